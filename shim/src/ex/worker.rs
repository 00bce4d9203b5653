//! Request Worker Threads
//!
//! Each mount runs a fixed pool of threads that pull requests from the
//! driver and answer them. A thread owns its 32 KiB request buffer and
//! opens a fresh device handle for every request.
//!
//! # Loop
//! ```text
//! open \\.\<device> ──► FSCTL_EVENT_WAIT ──► mount id ok? ──► dispatch
//!        ▲                    │                  │               │
//!        │         NO_SYSTEM_RESOURCES:      no: drop            │
//!        │           sleep 200 ms                │               │
//!        └──────────── close ◄──────────────────-┴───────────────┘
//! ```
//!
//! Any other wait failure ends the thread. At unmount the driver fails
//! pending waits with ERROR_OPERATION_ABORTED, which is how every worker
//! of a mount learns to exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::io::device::{DeviceAccess, DeviceError, DeviceIo, DeviceOpener, ERROR_OPERATION_ABORTED};
use crate::io::event::{EventContext, EVENT_CONTEXT_MAX_SIZE};
use crate::mount::control::{raw_device_name, FSCTL_EVENT_WAIT};
use crate::mount::registry::Registry;
use crate::mount::MountInstance;

/// Pause before waiting again after ERROR_NO_SYSTEM_RESOURCES
pub const WAIT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Counters shared by the workers of one mount
#[derive(Debug, Default)]
pub struct WorkerStats {
    dispatched: AtomicUsize,
    dropped: AtomicUsize,
    retries: AtomicUsize,
}

impl WorkerStats {
    /// Envelopes handed to the dispatcher
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Envelopes discarded for carrying another mount's id
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits retried after a transient failure
    pub fn retries(&self) -> usize {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Serve requests for `instance` until the driver stops handing them out.
///
/// Returns the error that ended the loop.
pub fn worker_loop<O: DeviceOpener + ?Sized>(
    instance: &MountInstance,
    registry: &Registry,
    opener: &O,
) -> DeviceError {
    let raw_device = raw_device_name(instance.device_name());
    let mut buffer = vec![0u8; EVENT_CONTEXT_MAX_SIZE];
    let dispatcher = instance.dispatcher();
    let stats = instance.stats();

    loop {
        let device = match opener.open(&raw_device, DeviceAccess::Query) {
            Ok(device) => device,
            Err(error) => return error,
        };

        let returned = match device.device_io_control(FSCTL_EVENT_WAIT, &[], &mut buffer) {
            Ok(returned) => returned.min(buffer.len()),
            Err(error) if error.is_transient() => {
                log::debug!("wait failed: {}; retrying", error);
                stats.retries.fetch_add(1, Ordering::Relaxed);
                drop(device);
                thread::sleep(WAIT_RETRY_DELAY);
                continue;
            }
            Err(error) => return error,
        };

        if returned == 0 {
            log::debug!("wait returned no data");
            continue;
        }
        let envelope = &buffer[..returned];

        if let Ok(header) = EventContext::peek_header(envelope) {
            let mount_id = header.mount_id.get();
            if mount_id != instance.mount_id() {
                if let Some(owner) = registry.find(mount_id) {
                    log::warn!(
                        "request {} belongs to mount {} ({}), not {}; dropped",
                        header.serial_number.get(),
                        mount_id,
                        owner.options().mount_point.display(),
                        instance.mount_id()
                    );
                } else {
                    log::warn!(
                        "request {} carries stale mount id {} (expected {}); dropped",
                        header.serial_number.get(),
                        mount_id,
                        instance.mount_id()
                    );
                }
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }

        stats.dispatched.fetch_add(1, Ordering::Relaxed);
        dispatcher.dispatch_envelope(&device, envelope);
    }
}

/// Start `instance.options().thread_count` named worker threads.
pub fn spawn_workers<O: DeviceOpener + 'static>(
    instance: &Arc<MountInstance>,
    registry: &Arc<Registry>,
    opener: &Arc<O>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let count = instance.options().thread_count;
    let mut workers = Vec::with_capacity(count as usize);

    for index in 0..count {
        let instance = Arc::clone(instance);
        let registry = Arc::clone(registry);
        let opener = Arc::clone(opener);

        let worker = thread::Builder::new()
            .name(format!("ntshim-{}-worker-{}", instance.mount_id(), index))
            .spawn(move || {
                let error = worker_loop(&instance, &registry, opener.as_ref());
                if error.code() == ERROR_OPERATION_ABORTED {
                    log::info!("worker {} released", index);
                } else {
                    log::error!("worker {} terminated: {}", index, error);
                }
            })?;
        workers.push(worker);
    }

    log::info!("mount {}: {} workers started", instance.mount_id(), count);
    Ok(workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::device::{ERROR_FILE_NOT_FOUND, ERROR_NO_SYSTEM_RESOURCES};
    use crate::mount::control::{DriverInfo, FSCTL_EVENT_INFO};
    use crate::mount::options::MountOptions;
    use crate::rtl::status::STATUS_SUCCESS;
    use crate::testing::{encode_directory_request, DirectoryQuery, MemoryFileSystem, MockOpener};
    use widestring::U16CString;

    fn instance(mount_id: u32, thread_count: u16) -> Arc<MountInstance> {
        let mut options = MountOptions::new("M");
        options.thread_count = thread_count;
        let fs = MemoryFileSystem::with_entries("\\dir", &["a", "b"]);
        Arc::new(MountInstance::new(
            options,
            Arc::new(fs),
            DriverInfo {
                driver_version: 0x190,
                device_number: 1,
                mount_id,
                device_name: U16CString::from_str_truncate("\\Device\\Volume1"),
            },
        ))
    }

    fn request(mount_id: u32, serial_number: u32) -> Vec<u8> {
        encode_directory_request(&DirectoryQuery {
            mount_id,
            serial_number,
            ..DirectoryQuery::default()
        })
    }

    #[test_log::test]
    fn test_loop_dispatches_until_released() {
        let opener = MockOpener::new();
        opener.push_event(request(7, 1));
        opener.push_event(request(7, 2));
        let instance = instance(7, 1);

        let error = worker_loop(&instance, &Registry::new(), &opener);
        assert_eq!(error.code(), ERROR_OPERATION_ABORTED);

        let responses = opener.responses();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].serial_number(), 1);
        assert_eq!(responses[1].status(), STATUS_SUCCESS);
        assert_eq!(instance.stats().dispatched(), 2);

        // One handle per wait, always the raw device
        let opened = opener.opened();
        assert_eq!(opened.len(), 3);
        assert!(opened
            .iter()
            .all(|(path, access)| path.to_string_lossy() == "\\\\.\\Device\\Volume1"
                && *access == DeviceAccess::Query));
    }

    #[test_log::test]
    fn test_foreign_and_stale_mount_ids_are_dropped() {
        let opener = MockOpener::new();
        opener.push_event(request(8, 1));
        opener.push_event(request(9, 2));
        opener.push_event(request(7, 3));

        let registry = Registry::new();
        registry.register(instance(8, 1));
        let instance = instance(7, 1);

        worker_loop(&instance, &registry, &opener);

        let responses = opener.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].serial_number(), 3);
        assert_eq!(instance.stats().dropped(), 2);
    }

    #[test_log::test]
    fn test_transient_failure_retries() {
        let opener = MockOpener::new();
        opener.push_event_error(ERROR_NO_SYSTEM_RESOURCES);
        opener.push_event(Vec::new());
        opener.push_event(request(7, 4));
        let instance = instance(7, 1);

        worker_loop(&instance, &Registry::new(), &opener);

        assert_eq!(instance.stats().retries(), 1);
        assert_eq!(opener.sent(FSCTL_EVENT_INFO).len(), 1);
    }

    #[test_log::test]
    fn test_open_failure_ends_loop() {
        let opener = MockOpener::new();
        opener.fail_open(
            &U16CString::from_str_truncate("\\\\.\\Device\\Volume1"),
            ERROR_FILE_NOT_FOUND,
        );
        let error = worker_loop(&instance(7, 1), &Registry::new(), &opener);
        assert_eq!(error.code(), ERROR_FILE_NOT_FOUND);
    }

    #[test_log::test]
    fn test_spawned_workers_share_the_queue() {
        let opener = Arc::new(MockOpener::new());
        for serial in 0..20 {
            opener.push_event(request(7, serial));
        }
        let instance = instance(7, 4);

        let workers = spawn_workers(&instance, &Arc::new(Registry::new()), &opener).unwrap();
        assert_eq!(workers.len(), 4);
        for worker in workers {
            worker.join().unwrap();
        }

        let mut serials: Vec<u32> = opener
            .responses()
            .iter()
            .map(|response| response.serial_number())
            .collect();
        serials.sort_unstable();
        assert_eq!(serials, (0..20).collect::<Vec<_>>());
        // Every request used its own handle (context 0x10) and released it
        assert_eq!(instance.handles().references(0x10), Some(1));
    }
}
