//! Request Dispatch
//!
//! Routes one decoded request to its handler and sends exactly one
//! response for it with FSCTL_EVENT_INFO.
//!
//! # Routing
//! | Major function | Handler |
//! |----------------|---------|
//! | DirectoryControl | `fs::directory` enumeration |
//! | Close | drop the open reference, answer success |
//! | Cleanup | answer success |
//! | any other IRP major | `STATUS_NOT_IMPLEMENTED` |
//! | outside the IRP table | dropped, no response |
//!
//! # Handle References
//! Every dispatch that touches a handle holds a `HandleGuard` from before
//! the handler runs until after the response is sent. Dropping the guard
//! releases the dispatch reference; if that was the last reference the file
//! system's `close_file` runs, outside the table lock.

use widestring::U16CStr;

use crate::fs::dirinfo::FileInformationClass;
use crate::fs::directory::dispatch_directory_information;
use crate::fs::handle::{ClosedHandle, HandleSnapshot, OpenHandleTable};
use crate::fs::operations::{FileInfo, FileSystemOperations};
use crate::io::device::DeviceIo;
use crate::io::event::{DecodeError, DirectoryRequest, EventContext, EventInformation, Operation};
use crate::io::irp::FileFlags;
use crate::mount::control::FSCTL_EVENT_INFO;
use crate::mount::options::MountOptions;
use crate::rtl::status::{
    NtStatus, STATUS_INVALID_PARAMETER, STATUS_NOT_IMPLEMENTED, STATUS_SUCCESS,
};

/// Per-mount request router
pub struct Dispatcher<'a> {
    handles: &'a OpenHandleTable,
    operations: &'a dyn FileSystemOperations,
    options: &'a MountOptions,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        handles: &'a OpenHandleTable,
        operations: &'a dyn FileSystemOperations,
        options: &'a MountOptions,
    ) -> Self {
        Self {
            handles,
            operations,
            options,
        }
    }

    /// Decode and dispatch one envelope as returned by FSCTL_EVENT_WAIT.
    ///
    /// A malformed envelope whose header is readable is answered with
    /// `STATUS_INVALID_PARAMETER`; one without a readable header is dropped.
    /// Major functions outside the IRP table (driver log messages) get no
    /// answer.
    pub fn dispatch_envelope<D: DeviceIo + ?Sized>(&self, device: &D, envelope: &[u8]) {
        match EventContext::decode(envelope) {
            Ok(request) => self.dispatch(device, &request),
            Err(DecodeError::UnknownMajorFunction(code)) => {
                log::debug!("dropping envelope with major function {:#x}", code);
            }
            Err(error) => match EventContext::peek_header(envelope) {
                Ok(header) => {
                    log::warn!(
                        "request {}: malformed envelope: {}",
                        header.serial_number.get(),
                        error
                    );
                    self.complete_raw(
                        device,
                        header.serial_number.get(),
                        header.context.get(),
                        STATUS_INVALID_PARAMETER,
                    );
                }
                Err(error) => log::warn!("dropping envelope: {}", error),
            },
        }
    }

    pub fn dispatch<D: DeviceIo + ?Sized>(&self, device: &D, request: &EventContext) {
        log::debug!(
            "request {}: {:?} context {:#x} pid {}",
            request.serial_number,
            request.major_function,
            request.context,
            request.process_id
        );

        match &request.operation {
            Operation::Directory(directory) => self.dispatch_directory(device, request, directory),
            Operation::Close { file_name } => self.dispatch_close(device, request, file_name),
            Operation::Cleanup { .. } => self.complete(device, request, STATUS_SUCCESS),
            Operation::Other => self.complete(device, request, STATUS_NOT_IMPLEMENTED),
        }
    }

    fn dispatch_directory<D: DeviceIo + ?Sized>(
        &self,
        device: &D,
        request: &EventContext,
        directory: &DirectoryRequest,
    ) {
        let class = match FileInformationClass::try_from(directory.file_information_class) {
            Ok(class) => class,
            Err(raw) => {
                log::warn!("request {}: unsupported information class {}", request.serial_number, raw);
                self.complete(device, request, STATUS_INVALID_PARAMETER);
                return;
            }
        };

        let mut response =
            match EventInformation::for_request(request, directory.buffer_length as usize) {
                Ok(response) => response,
                Err(status) => {
                    self.complete(device, request, status);
                    return;
                }
            };

        let guard = match self.acquire(request, &directory.directory_name) {
            Ok(guard) => guard,
            Err(status) => {
                self.complete(device, request, status);
                return;
            }
        };

        let mut info = guard.file_info();
        dispatch_directory_information(
            request,
            directory,
            class,
            self.handles,
            self.operations,
            &mut info,
            &mut response,
        );
        self.handles
            .update(request.context, info.context, info.is_directory);

        send_response(device, &response);
        drop(guard);
    }

    fn dispatch_close<D: DeviceIo + ?Sized>(
        &self,
        device: &D,
        request: &EventContext,
        file_name: &U16CStr,
    ) {
        let guard = match self.acquire(request, file_name) {
            Ok(guard) => guard,
            Err(status) => {
                self.complete(device, request, status);
                return;
            }
        };

        // Only drops the open reference; the guard's release runs close_file
        self.handles.close(request.context);

        self.complete(device, request, STATUS_SUCCESS);
        drop(guard);
    }

    fn acquire(&self, request: &EventContext, file_name: &U16CStr) -> Result<HandleGuard<'_>, NtStatus> {
        let snapshot = self.handles.acquire(request.context, file_name)?;
        Ok(HandleGuard {
            dispatcher: self,
            context: request.context,
            process_id: request.process_id,
            file_flags: request.file_flags,
            snapshot,
        })
    }

    /// Answer `request` with a bare status
    fn complete<D: DeviceIo + ?Sized>(&self, device: &D, request: &EventContext, status: NtStatus) {
        self.complete_raw(device, request.serial_number, request.context, status);
    }

    fn complete_raw<D: DeviceIo + ?Sized>(&self, device: &D, serial_number: u32, context: u64, status: NtStatus) {
        match EventInformation::new(serial_number, context, 0) {
            Ok(mut response) => {
                response.set_status(status);
                send_response(device, &response);
            }
            Err(status) => log::error!("request {}: no response sent: {}", serial_number, status),
        }
    }
}

fn send_response<D: DeviceIo + ?Sized>(device: &D, response: &EventInformation) {
    if let Err(error) = device.device_io_control(FSCTL_EVENT_INFO, response.as_bytes(), &mut []) {
        log::error!(
            "request {}: sending response failed: {}",
            response.serial_number(),
            error
        );
    }
}

/// One dispatch reference on an open handle
struct HandleGuard<'d> {
    dispatcher: &'d Dispatcher<'d>,
    context: u64,
    process_id: u32,
    file_flags: FileFlags,
    snapshot: HandleSnapshot,
}

impl<'d> HandleGuard<'d> {
    fn file_info(&self) -> FileInfo<'d> {
        let mut info = FileInfo::new(self.dispatcher.options);
        info.context = self.snapshot.user_context;
        info.is_directory = self.snapshot.is_directory;
        info.process_id = self.process_id;
        info.flags = self.file_flags;
        info
    }

    fn close_file(&self, closed: ClosedHandle) {
        let mut info = FileInfo::new(self.dispatcher.options);
        info.context = closed.user_context;
        info.is_directory = closed.is_directory;
        info.process_id = self.process_id;
        info.flags = self.file_flags;

        log::debug!("close_file {} ({:#x})", closed.file_name.display(), closed.context);
        self.dispatcher
            .operations
            .close_file(&closed.file_name, &mut info);
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        if let Some(closed) = self.dispatcher.handles.release(self.context) {
            self.close_file(closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::dirinfo::FileInformationClass;
    use crate::io::irp::IrpMajorFunction;
    use crate::rtl::status::STATUS_NO_SUCH_FILE;
    use crate::testing::{
        encode_cleanup, encode_close, encode_directory_request, encode_other,
        DirectoryQuery, MemoryFileSystem, MockDevice,
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;

    struct Fixture {
        handles: OpenHandleTable,
        fs: MemoryFileSystem,
        options: MountOptions,
        device: MockDevice,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                handles: OpenHandleTable::new(),
                fs: MemoryFileSystem::with_entries("\\dir", &["a.txt", "b.txt"]),
                options: MountOptions::default(),
                device: MockDevice::new(),
            }
        }

        fn send(&self, envelope: &[u8]) {
            Dispatcher::new(&self.handles, &self.fs, &self.options)
                .dispatch_envelope(&self.device, envelope);
        }

        fn responses(&self) -> Vec<EventInformation> {
            self.device
                .sent(FSCTL_EVENT_INFO)
                .iter()
                .map(|bytes| EventInformation::from_bytes(bytes).unwrap())
                .collect()
        }
    }

    #[test_log::test]
    fn test_directory_request_round_trip() {
        let fixture = Fixture::new();
        fixture.send(&encode_directory_request(&DirectoryQuery {
            serial_number: 31,
            context: 0x77,
            file_information_class: FileInformationClass::Names as u32,
            ..DirectoryQuery::default()
        }));

        let responses = fixture.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].serial_number(), 31);
        assert_eq!(responses[0].context(), 0x77);
        assert_eq!(responses[0].status(), STATUS_SUCCESS);
        // ".", "..", "a.txt", "b.txt"
        assert_eq!(responses[0].directory_index(), 4);
        // Open reference only
        assert_eq!(fixture.handles.references(0x77), Some(1));
    }

    #[test_log::test]
    fn test_invalid_class_touches_no_handle() {
        let fixture = Fixture::new();
        fixture.send(&encode_directory_request(&DirectoryQuery {
            file_information_class: 99,
            ..DirectoryQuery::default()
        }));

        let responses = fixture.responses();
        assert_eq!(responses[0].status(), STATUS_INVALID_PARAMETER);
        assert_eq!(responses[0].buffer_length(), 0);
        assert!(fixture.handles.is_empty());
        assert_eq!(fixture.fs.find_calls.load(Ordering::SeqCst), 0);
    }

    #[test_log::test]
    fn test_user_context_written_back() {
        let fixture = Fixture::new();
        fixture.fs.user_context.store(0xfeed, Ordering::SeqCst);
        fixture.send(&encode_directory_request(&DirectoryQuery {
            context: 5,
            ..DirectoryQuery::default()
        }));
        fixture.send(&encode_close(1, 2, 5, "\\dir"));

        let closed = fixture.fs.closed.lock().clone();
        assert_eq!(closed, vec![("\\dir".to_string(), 0xfeed)]);
    }

    #[test_log::test]
    fn test_close_releases_once() {
        let fixture = Fixture::new();
        fixture.send(&encode_directory_request(&DirectoryQuery {
            context: 9,
            ..DirectoryQuery::default()
        }));
        fixture.send(&encode_close(1, 2, 9, "\\dir"));
        assert!(fixture.handles.is_empty());

        // A close for an unknown context opens and closes a fresh slot
        fixture.send(&encode_close(1, 3, 9, "\\dir"));
        assert!(fixture.handles.is_empty());

        let responses = fixture.responses();
        assert_eq!(responses.len(), 3);
        assert!(responses.iter().all(|r| r.status() == STATUS_SUCCESS));
        assert_eq!(fixture.fs.closed.lock().len(), 2);
    }

    #[test_log::test]
    fn test_cleanup_and_unhandled_majors() {
        let fixture = Fixture::new();
        fixture.send(&encode_cleanup(1, 1, 3, "\\dir"));
        fixture.send(&encode_other(IrpMajorFunction::Read, 1, 2, 3));

        let responses = fixture.responses();
        assert_eq!(responses[0].status(), STATUS_SUCCESS);
        assert_eq!(responses[1].status(), STATUS_NOT_IMPLEMENTED);
        assert_eq!(responses[1].serial_number(), 2);
        assert!(fixture.handles.is_empty());
    }

    #[test_log::test]
    fn test_malformed_envelopes() {
        let fixture = Fixture::new();

        let mut truncated = encode_directory_request(&DirectoryQuery {
            serial_number: 12,
            ..DirectoryQuery::default()
        });
        truncated[52..56].copy_from_slice(&9000u32.to_le_bytes());
        fixture.send(&truncated);

        fixture.send(&[0u8; 10]);

        let responses = fixture.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].serial_number(), 12);
        assert_eq!(responses[0].status(), STATUS_INVALID_PARAMETER);
        assert!(fixture.handles.is_empty());
    }

    #[test_log::test]
    fn test_unknown_major_function_is_not_answered() {
        let fixture = Fixture::new();
        let mut envelope = encode_close(1, 44, 6, "\\dir");
        envelope[16] = 0xF0;
        fixture.send(&envelope);

        assert!(fixture.responses().is_empty());
        assert!(fixture.handles.is_empty());
        assert!(fixture.fs.closed.lock().is_empty());
    }

    #[test_log::test]
    fn test_close_runs_close_file_once() {
        let fixture = Fixture::new();
        fixture.send(&encode_close(1, 8, 4, "\\dir"));

        assert_eq!(fixture.responses().len(), 1);
        assert_eq!(fixture.responses()[0].status(), STATUS_SUCCESS);
        assert_eq!(fixture.fs.closed.lock().clone(), vec![("\\dir".to_string(), 0)]);
        assert!(fixture.handles.is_empty());
    }

    #[test_log::test]
    fn test_failed_enumeration_response() {
        let fixture = Fixture::new();
        fixture.send(&encode_directory_request(&DirectoryQuery {
            directory_name: "\\missing",
            ..DirectoryQuery::default()
        }));
        let responses = fixture.responses();
        assert_eq!(responses[0].status(), STATUS_NO_SUCH_FILE);
        assert_eq!(responses[0].buffer_length(), 0);
    }
}
