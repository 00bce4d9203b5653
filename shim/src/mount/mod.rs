//! Mount Management
//!
//! A mount is one volume served by this process:
//!
//! - **Options**: validated configuration (`options`)
//! - **Control**: IOCTLs that start, list and release volumes (`control`)
//! - **Registry**: every live mount of the process (`registry`)
//!
//! # Lifecycle
//! ```text
//! normalize options ──► open global device ──► EVENT_START
//!        ──► register ──► spawn workers ──► keepalive / notification
//!        ──► mounted() ──► join workers ──► close open handles
//!        ──► unmounted() ──► unregister
//! ```
//!
//! `Mount::run` blocks for the whole lifecycle. The volume goes away when
//! something releases it: `Mount::unmount`, `shutdown`, or the driver
//! itself once the keepalive handle closes with the process.

pub mod control;
pub mod options;
pub mod registry;

use std::sync::Arc;

use spin::Mutex;
use widestring::{U16CStr, U16CString};

use crate::ex::worker::{spawn_workers, WorkerStats};
use crate::fs::handle::OpenHandleTable;
use crate::fs::operations::{FileInfo, FileSystemOperations};
use crate::io::device::{DeviceAccess, DeviceIo, DeviceOpener};
use crate::io::dispatch::Dispatcher;

use control::{
    activate_keepalive, send_global_release, volume_file_path, ControlError, DriverInfo,
    DOKAN_GLOBAL_DEVICE_NAME, DOKAN_KEEPALIVE_FILE_NAME, DOKAN_NOTIFICATION_FILE_NAME,
};
use options::{MountError, MountFlags, MountOptions};
use registry::Registry;

type NotificationDevice = Box<dyn DeviceIo + Send + Sync>;

/// One mounted volume
pub struct MountInstance {
    options: MountOptions,
    operations: Arc<dyn FileSystemOperations>,
    driver: DriverInfo,
    handles: OpenHandleTable,
    stats: WorkerStats,
    notification: Mutex<Option<NotificationDevice>>,
}

impl MountInstance {
    pub fn new(
        options: MountOptions,
        operations: Arc<dyn FileSystemOperations>,
        driver: DriverInfo,
    ) -> Self {
        Self {
            options,
            operations,
            driver,
            handles: OpenHandleTable::new(),
            stats: WorkerStats::default(),
            notification: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn operations(&self) -> &dyn FileSystemOperations {
        self.operations.as_ref()
    }

    /// Id the driver stamps on every request for this volume
    pub fn mount_id(&self) -> u32 {
        self.driver.mount_id
    }

    pub fn device_number(&self) -> u32 {
        self.driver.device_number
    }

    /// Kernel device name, e.g. `\Device\Volume{...}`
    pub fn device_name(&self) -> &U16CStr {
        &self.driver.device_name
    }

    pub fn handles(&self) -> &OpenHandleTable {
        &self.handles
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(&self.handles, self.operations.as_ref(), &self.options)
    }

    /// Remove every slot left in the handle table and run `close_file` for
    /// each. Called once the workers are gone.
    fn close_open_handles(&self) {
        for closed in self.handles.drain() {
            let mut info = FileInfo::new(&self.options);
            info.context = closed.user_context;
            info.is_directory = closed.is_directory;

            log::debug!(
                "close_file {} ({:#x}) at unmount",
                closed.file_name.display(),
                closed.context
            );
            self.operations.close_file(&closed.file_name, &mut info);
        }
    }

    fn set_notification(&self, device: Option<NotificationDevice>) {
        *self.notification.lock() = device;
    }

    fn with_notification(
        &self,
        send: impl FnOnce(&dyn DeviceIo) -> Result<(), ControlError>,
    ) -> Result<(), ControlError> {
        let notification = self.notification.lock();
        match notification.as_deref() {
            Some(device) => send(device),
            None => Err(ControlError::NotificationUnavailable),
        }
    }

    /// Report a new file or directory at `path` (`M:\dir\name`)
    pub fn notify_create(&self, path: &U16CStr, is_directory: bool) -> Result<(), ControlError> {
        self.with_notification(|device| control::notify_create(device, path, is_directory))
    }

    pub fn notify_delete(&self, path: &U16CStr, is_directory: bool) -> Result<(), ControlError> {
        self.with_notification(|device| control::notify_delete(device, path, is_directory))
    }

    pub fn notify_update(&self, path: &U16CStr) -> Result<(), ControlError> {
        self.with_notification(|device| control::notify_update(device, path))
    }

    pub fn notify_xattr_update(&self, path: &U16CStr) -> Result<(), ControlError> {
        self.with_notification(|device| control::notify_xattr_update(device, path))
    }

    pub fn notify_rename(
        &self,
        old_path: &U16CStr,
        new_path: &U16CStr,
        is_directory: bool,
        is_in_same_directory: bool,
    ) -> Result<(), ControlError> {
        self.with_notification(|device| {
            control::notify_rename(device, old_path, new_path, is_directory, is_in_same_directory)
        })
    }
}

/// Mounts volumes through one driver connection
pub struct Mount<O: DeviceOpener> {
    opener: Arc<O>,
    registry: Arc<Registry>,
}

impl<O: DeviceOpener + 'static> Mount<O> {
    pub fn new(opener: Arc<O>, registry: Arc<Registry>) -> Self {
        Self { opener, registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Mount `operations` and serve it until the volume is released.
    pub fn run(
        &self,
        mut options: MountOptions,
        operations: Arc<dyn FileSystemOperations>,
    ) -> Result<(), MountError> {
        options.normalize()?;

        let _global = self
            .opener
            .open(DOKAN_GLOBAL_DEVICE_NAME, DeviceAccess::ReadWrite)
            .map_err(|error| {
                log::error!("{}", error);
                MountError::DriverInstall(error)
            })?;
        log::debug!("global device opened");

        let driver = control::start(self.opener.as_ref(), &options)?;
        let instance = Arc::new(MountInstance::new(options, operations, driver));
        self.registry.register(Arc::clone(&instance));

        let workers = match spawn_workers(&instance, &self.registry, &self.opener) {
            Ok(workers) => workers,
            Err(error) => {
                self.abandon(&instance);
                return Err(MountError::Mount(format!("cannot start workers: {}", error)));
            }
        };

        let keepalive = self.activate_keepalive(&instance);
        if instance.options().flags.contains(MountFlags::ENABLE_NOTIFICATION_API) {
            self.open_notification(&instance);
        }

        log::info!(
            "mounted: {} -> {}",
            instance.options().mount_point.display(),
            instance.device_name().display()
        );

        let mut info = FileInfo::new(instance.options());
        if let Err(status) = instance.operations().mounted(&mut info) {
            log::warn!("mounted callback failed: {}", status);
        }

        for worker in workers {
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }

        instance.close_open_handles();
        instance.set_notification(None);
        drop(keepalive);

        let mut info = FileInfo::new(instance.options());
        if let Err(status) = instance.operations().unmounted(&mut info) {
            log::warn!("unmounted callback failed: {}", status);
        }

        self.registry.unregister(&instance);
        log::info!("unmounted: {}", instance.options().mount_point.display());
        Ok(())
    }

    /// Release the volume mounted at `mount_point`, ending its `run`.
    pub fn unmount(&self, mount_point: &U16CStr) -> Result<(), ControlError> {
        send_global_release(self.opener.as_ref(), mount_point)
    }

    /// Undo a half-started mount
    fn abandon(&self, instance: &Arc<MountInstance>) {
        if let Err(error) = control::send_release(self.opener.as_ref(), instance.device_name()) {
            log::warn!("release after failed start: {}", error);
        }
        self.registry.unregister(instance);
    }

    /// Arm unmount-on-exit. Failure only costs cleanup after a crash.
    fn activate_keepalive(&self, instance: &MountInstance) -> Option<O::Device> {
        let path = volume_file_path(instance.device_name(), DOKAN_KEEPALIVE_FILE_NAME);
        let handle = match self.opener.open(&path, DeviceAccess::Query) {
            Ok(handle) => handle,
            Err(error) => {
                log::warn!("keepalive unavailable: {}", error);
                return None;
            }
        };
        if let Err(error) = activate_keepalive(&handle) {
            log::warn!("keepalive not activated: {}", error);
        }
        Some(handle)
    }

    fn open_notification(&self, instance: &MountInstance) {
        let path = volume_file_path(instance.device_name(), DOKAN_NOTIFICATION_FILE_NAME);
        match self.opener.open(&path, DeviceAccess::Notification) {
            Ok(device) => instance.set_notification(Some(Box::new(device))),
            Err(error) => log::warn!("notification handle unavailable: {}", error),
        }
    }
}

/// Release every registered mount (process teardown).
///
/// Returns the mount points whose release failed.
pub fn shutdown<O: DeviceOpener>(registry: &Registry, opener: &O) -> Vec<U16CString> {
    let mut failed = Vec::new();
    for instance in registry.drain() {
        let mount_point = &instance.options().mount_point;
        if let Err(error) = send_global_release(opener, mount_point) {
            log::warn!("release of {} failed: {}", mount_point.display(), error);
            failed.push(mount_point.clone());
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::device::ERROR_FILE_NOT_FOUND;
    use crate::mount::control::{
        driver_status, FSCTL_ACTIVATE_KEEPALIVE, FSCTL_EVENT_RELEASE, FSCTL_NOTIFY_PATH,
    };
    use crate::rtl::status::STATUS_SUCCESS;
    use crate::testing::{encode_directory_request, DirectoryQuery, MemoryFileSystem, MockOpener};
    use std::sync::atomic::Ordering;
    use widestring::u16cstr;

    fn mount_with(opener: &Arc<MockOpener>) -> Mount<MockOpener> {
        Mount::new(Arc::clone(opener), Arc::new(Registry::new()))
    }

    #[test_log::test]
    fn test_run_serves_until_released() {
        let opener = Arc::new(MockOpener::new());
        opener.reply_driver_info(driver_status::DOKAN_MOUNTED, 7, 2, "\\Device\\Volume7");
        opener.push_event(encode_directory_request(&DirectoryQuery {
            mount_id: 7,
            serial_number: 100,
            ..DirectoryQuery::default()
        }));
        opener.push_event(encode_directory_request(&DirectoryQuery {
            mount_id: 3,
            serial_number: 101,
            ..DirectoryQuery::default()
        }));

        let fs = Arc::new(MemoryFileSystem::with_entries("\\dir", &["x"]));
        let mount = mount_with(&opener);
        let mut options = MountOptions::new("M");
        options.thread_count = 2;
        mount.run(options, fs.clone()).unwrap();

        let responses = opener.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].serial_number(), 100);
        assert_eq!(responses[0].status(), STATUS_SUCCESS);

        assert_eq!(fs.mounted_calls.load(Ordering::SeqCst), 1);
        assert_eq!(fs.unmounted_calls.load(Ordering::SeqCst), 1);
        assert!(mount.registry().is_empty());

        let opened = opener.opened();
        assert_eq!(opened[0].0.as_ucstr(), DOKAN_GLOBAL_DEVICE_NAME);
        assert_eq!(opened[0].1, DeviceAccess::ReadWrite);
        assert!(opened.iter().any(|(path, _)| path.as_ucstr()
            == u16cstr!("\\\\?\\Device\\Volume7\\__drive_fs_keepalive")));
        assert_eq!(opener.sent(FSCTL_ACTIVATE_KEEPALIVE).len(), 1);
    }

    #[test_log::test]
    fn test_unmount_closes_handles_left_open() {
        let opener = Arc::new(MockOpener::new());
        opener.reply_driver_info(driver_status::DOKAN_MOUNTED, 5, 1, "\\Device\\Volume5");
        opener.push_event(encode_directory_request(&DirectoryQuery {
            mount_id: 5,
            context: 0x21,
            ..DirectoryQuery::default()
        }));

        let fs = Arc::new(MemoryFileSystem::with_entries("\\dir", &["x"]));
        fs.user_context.store(0xbeef, Ordering::SeqCst);
        let mount = mount_with(&opener);
        let mut options = MountOptions::new("M");
        options.thread_count = 1;
        mount.run(options, fs.clone()).unwrap();

        // The driver never sent IRP_MJ_CLOSE for 0x21
        assert_eq!(fs.closed.lock().clone(), vec![("\\dir".to_string(), 0xbeef)]);
        assert_eq!(fs.unmounted_calls.load(Ordering::SeqCst), 1);
    }

    #[test_log::test]
    fn test_driver_missing() {
        let opener = Arc::new(MockOpener::new());
        opener.fail_open(DOKAN_GLOBAL_DEVICE_NAME, ERROR_FILE_NOT_FOUND);
        let fs = Arc::new(MemoryFileSystem::with_entries("\\", &[]));

        let error = mount_with(&opener)
            .run(MountOptions::new("M"), fs.clone())
            .unwrap_err();
        assert_eq!(error.code(), -3);
        assert_eq!(fs.mounted_calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn test_start_refused() {
        let opener = Arc::new(MockOpener::new());
        opener.reply_driver_info(driver_status::DOKAN_START_FAILED, 0, 0, "");
        let mount = mount_with(&opener);

        let error = mount
            .run(MountOptions::new("M"), Arc::new(MemoryFileSystem::with_entries("\\", &[])))
            .unwrap_err();
        assert_eq!(error.code(), -4);
        assert!(mount.registry().is_empty());
    }

    #[test_log::test]
    fn test_version_rejected_before_driver() {
        let opener = Arc::new(MockOpener::new());
        let mut options = MountOptions::new("M");
        options.version = 10;

        let error = mount_with(&opener)
            .run(options, Arc::new(MemoryFileSystem::with_entries("\\", &[])))
            .unwrap_err();
        assert_eq!(error.code(), -7);
        assert!(opener.opened().is_empty());
    }

    #[test_log::test]
    fn test_notification_handle() {
        let opener = Arc::new(MockOpener::new());
        opener.reply_driver_info(driver_status::DOKAN_MOUNTED, 1, 1, "\\Device\\V");
        let mount = mount_with(&opener);
        let mut options = MountOptions::new("M");
        options.thread_count = 1;
        options.flags = MountFlags::ENABLE_NOTIFICATION_API;
        mount
            .run(options, Arc::new(MemoryFileSystem::with_entries("\\", &[])))
            .unwrap();

        assert!(opener.opened().iter().any(|(path, access)| *access
            == DeviceAccess::Notification
            && path.as_ucstr() == u16cstr!("\\\\?\\Device\\V\\__drive_fs_notification")));
    }

    #[test]
    fn test_instance_notify() {
        let opener = MockOpener::new();
        let instance = MountInstance::new(
            MountOptions::new("M"),
            Arc::new(MemoryFileSystem::with_entries("\\", &[])),
            DriverInfo {
                driver_version: 0x190,
                device_number: 1,
                mount_id: 1,
                device_name: U16CString::from_str_truncate("\\Device\\V"),
            },
        );

        assert_eq!(
            instance.notify_update(u16cstr!("M:\\a")),
            Err(ControlError::NotificationUnavailable)
        );

        let device = opener
            .open(u16cstr!("\\\\?\\Device\\V\\__drive_fs_notification"), DeviceAccess::Notification)
            .unwrap();
        instance.set_notification(Some(Box::new(device)));
        instance.notify_create(u16cstr!("M:\\a"), false).unwrap();
        instance
            .notify_rename(u16cstr!("M:\\a"), u16cstr!("M:\\b"), false, true)
            .unwrap();
        assert_eq!(opener.sent(FSCTL_NOTIFY_PATH).len(), 3);
    }

    #[test]
    fn test_shutdown_releases_every_mount() {
        let opener = MockOpener::new();
        let registry = Registry::new();
        for (id, mount_point) in [(1, "M"), (2, "N")] {
            registry.register(Arc::new(MountInstance::new(
                MountOptions::new(mount_point),
                Arc::new(MemoryFileSystem::with_entries("\\", &[])),
                DriverInfo {
                    driver_version: 0x190,
                    device_number: id,
                    mount_id: id,
                    device_name: U16CString::from_str_truncate("\\Device\\V"),
                },
            )));
        }

        let failed = shutdown(&registry, &opener);
        assert!(failed.is_empty());
        assert!(registry.is_empty());

        let released = opener.sent(FSCTL_EVENT_RELEASE);
        assert_eq!(released.len(), 2);
        assert!(released
            .iter()
            .all(|(path, _, _)| path.as_ucstr() == DOKAN_GLOBAL_DEVICE_NAME));
        assert_eq!(&released[1].1[4..6], &(b'N' as u16).to_le_bytes());
    }
}
