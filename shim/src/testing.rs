//! Test doubles: a scripted driver, an in-memory file system and request
//! envelope encoders.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use spin::Mutex;
use widestring::{U16CStr, U16CString, U16Str, U16String};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromZeros, IntoBytes};

use crate::fs::operations::{
    FileAttributes, FileInfo, FileSystemOperations, FillFindData, FindData,
};
use crate::fsrtl::name::fsrtl_is_name_in_expression;
use crate::io::device::{
    DeviceAccess, DeviceError, DeviceIo, DeviceOpener, ERROR_OPERATION_ABORTED,
};
use crate::io::event::{
    DirectoryOperation, EventContextHeader, EventInformation, FileNameOperation,
    EVENT_CONTEXT_OPERATION_OFFSET,
};
use crate::io::irp::IrpMajorFunction;
use crate::mount::control::{EventDriverInfo, FSCTL_EVENT_INFO, FSCTL_EVENT_START, FSCTL_EVENT_WAIT};
use crate::rtl::status::NtStatus;

// ============================================================================
// Scripted driver
// ============================================================================

/// One DeviceIoControl seen by the mock
#[derive(Debug, Clone)]
pub struct SentIoctl {
    pub path: U16CString,
    pub ioctl: u32,
    pub input: Vec<u8>,
    pub output_length: usize,
}

#[derive(Debug, Default)]
struct DriverState {
    sent: Vec<SentIoctl>,
    opened: Vec<(U16CString, DeviceAccess)>,
    /// Served to FSCTL_EVENT_WAIT in order; an empty queue aborts the wait
    events: VecDeque<Result<Vec<u8>, u32>>,
    replies: HashMap<u32, VecDeque<Result<Vec<u8>, u32>>>,
    open_failures: HashMap<U16CString, u32>,
}

impl DriverState {
    fn control(
        &mut self,
        path: &U16CStr,
        ioctl: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, DeviceError> {
        self.sent.push(SentIoctl {
            path: path.to_ucstring(),
            ioctl,
            input: input.to_vec(),
            output_length: output.len(),
        });

        let reply = if ioctl == FSCTL_EVENT_WAIT {
            Some(self.events.pop_front().unwrap_or(Err(ERROR_OPERATION_ABORTED)))
        } else {
            self.replies.get_mut(&ioctl).and_then(VecDeque::pop_front)
        };

        match reply {
            None => Ok(0),
            Some(Ok(bytes)) => {
                let length = bytes.len().min(output.len());
                output[..length].copy_from_slice(&bytes[..length]);
                Ok(length)
            }
            Some(Err(code)) => Err(DeviceError::Ioctl { ioctl, code }),
        }
    }
}

/// Device handle onto the shared scripted driver
#[derive(Debug, Clone)]
pub struct MockDevice {
    path: U16CString,
    state: Arc<Mutex<DriverState>>,
}

impl MockDevice {
    /// A device that is not backed by any opener
    pub fn new() -> Self {
        Self {
            path: U16CString::default(),
            state: Arc::default(),
        }
    }

    /// Inputs of every `ioctl` sent through this device's driver
    pub fn sent(&self, ioctl: u32) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|sent| sent.ioctl == ioctl)
            .map(|sent| sent.input.clone())
            .collect()
    }
}

impl DeviceIo for MockDevice {
    fn device_io_control(
        &self,
        ioctl: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, DeviceError> {
        self.state.lock().control(&self.path, ioctl, input, output)
    }
}

/// Opens `MockDevice`s that all talk to one scripted driver
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    state: Arc<Mutex<DriverState>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, envelope: Vec<u8>) {
        self.state.lock().events.push_back(Ok(envelope));
    }

    pub fn push_event_error(&self, code: u32) {
        self.state.lock().events.push_back(Err(code));
    }

    /// Queue output bytes for the next `ioctl`
    pub fn reply_with(&self, ioctl: u32, bytes: Vec<u8>) {
        self.state
            .lock()
            .replies
            .entry(ioctl)
            .or_default()
            .push_back(Ok(bytes));
    }

    /// Fail the next `ioctl` with a Win32 error
    pub fn fail_next(&self, ioctl: u32, code: u32) {
        self.state
            .lock()
            .replies
            .entry(ioctl)
            .or_default()
            .push_back(Err(code));
    }

    pub fn fail_open(&self, path: &U16CStr, code: u32) {
        self.state
            .lock()
            .open_failures
            .insert(path.to_ucstring(), code);
    }

    /// Queue an EVENT_DRIVER_INFO for the next FSCTL_EVENT_START
    pub fn reply_driver_info(&self, status: u32, mount_id: u32, device_number: u32, device_name: &str) {
        let mut info = EventDriverInfo::new_zeroed();
        info.driver_version = U32::new(crate::mount::control::DOKAN_DRIVER_VERSION);
        info.status = U32::new(status);
        info.mount_id = U32::new(mount_id);
        info.device_number = U32::new(device_number);
        for (slot, unit) in info.device_name.iter_mut().zip(device_name.encode_utf16()) {
            *slot = zerocopy::little_endian::U16::new(unit);
        }
        self.reply_with(FSCTL_EVENT_START, info.as_bytes().to_vec());
    }

    /// (path, input, output length) of every `ioctl` sent
    pub fn sent(&self, ioctl: u32) -> Vec<(U16CString, Vec<u8>, usize)> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|sent| sent.ioctl == ioctl)
            .map(|sent| (sent.path.clone(), sent.input.clone(), sent.output_length))
            .collect()
    }

    pub fn opened(&self) -> Vec<(U16CString, DeviceAccess)> {
        self.state.lock().opened.clone()
    }

    /// Responses sent with FSCTL_EVENT_INFO, in order
    pub fn responses(&self) -> Vec<EventInformation> {
        self.sent(FSCTL_EVENT_INFO)
            .into_iter()
            .filter_map(|(_, input, _)| EventInformation::from_bytes(&input).ok())
            .collect()
    }
}

impl DeviceOpener for MockOpener {
    type Device = MockDevice;

    fn open(&self, path: &U16CStr, access: DeviceAccess) -> Result<MockDevice, DeviceError> {
        let mut state = self.state.lock();
        if let Some(&code) = state.open_failures.get(path) {
            return Err(DeviceError::open(path, code));
        }
        state.opened.push((path.to_ucstring(), access));
        Ok(MockDevice {
            path: path.to_ucstring(),
            state: self.state.clone(),
        })
    }
}

// ============================================================================
// In-memory file system
// ============================================================================

/// One directory of named entries
#[derive(Debug)]
pub struct MemoryFileSystem {
    directory: U16CString,
    entries: Vec<FindData>,
    pattern_support: Mutex<bool>,
    failure: Mutex<Option<NtStatus>>,
    /// Written into `FileInfo::context` by every enumeration when non-zero
    pub user_context: AtomicU64,
    pub find_calls: AtomicUsize,
    pub pattern_calls: AtomicUsize,
    pub mounted_calls: AtomicUsize,
    pub unmounted_calls: AtomicUsize,
    /// (path, user context) of every close_file
    pub closed: Mutex<Vec<(String, u64)>>,
}

impl MemoryFileSystem {
    pub fn with_entries(directory: &str, names: &[&str]) -> Self {
        let entries = names
            .iter()
            .map(|name| {
                let name = U16String::from_str(name);
                let attributes = if name.as_slice().iter().all(|&u| u == b'.' as u16) {
                    FileAttributes::DIRECTORY
                } else {
                    FileAttributes::ARCHIVE
                };
                FindData::new(&name, attributes)
                    .map(|data| data.with_size(name.len() as u64 * 100))
                    .unwrap()
            })
            .collect();

        Self {
            directory: U16CString::from_str_truncate(directory),
            entries,
            pattern_support: Mutex::new(false),
            failure: Mutex::new(None),
            user_context: AtomicU64::new(0),
            find_calls: AtomicUsize::new(0),
            pattern_calls: AtomicUsize::new(0),
            mounted_calls: AtomicUsize::new(0),
            unmounted_calls: AtomicUsize::new(0),
            closed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_pattern_support(&self, enabled: bool) {
        *self.pattern_support.lock() = enabled;
    }

    pub fn fail_with(&self, status: Option<NtStatus>) {
        *self.failure.lock() = status;
    }

    fn enumerate(
        &self,
        path: &U16CStr,
        pattern: Option<&U16Str>,
        emit: &mut FillFindData<'_>,
        info: &mut FileInfo<'_>,
    ) -> Result<(), NtStatus> {
        if let Some(status) = *self.failure.lock() {
            return Err(status);
        }
        let context = self.user_context.load(Ordering::SeqCst);
        if context != 0 {
            info.context = context;
        }
        if path != self.directory.as_ucstr() {
            return Err(crate::rtl::status::STATUS_OBJECT_PATH_NOT_FOUND);
        }

        for entry in &self.entries {
            let keep = pattern.map_or(true, |pattern| {
                fsrtl_is_name_in_expression(pattern, entry.file_name().as_ustr(), true)
            });
            if keep {
                emit(entry)?;
            }
        }
        Ok(())
    }
}

impl FileSystemOperations for MemoryFileSystem {
    fn find_files(
        &self,
        path: &U16CStr,
        emit: &mut FillFindData<'_>,
        info: &mut FileInfo<'_>,
    ) -> Result<(), NtStatus> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.enumerate(path, None, emit, info)
    }

    fn find_files_with_pattern(
        &self,
        path: &U16CStr,
        pattern: &U16CStr,
        emit: &mut FillFindData<'_>,
        info: &mut FileInfo<'_>,
    ) -> Result<(), NtStatus> {
        if !*self.pattern_support.lock() {
            return Err(crate::rtl::status::STATUS_NOT_IMPLEMENTED);
        }
        self.pattern_calls.fetch_add(1, Ordering::SeqCst);
        self.enumerate(path, Some(pattern.as_ustr()), emit, info)
    }

    fn close_file(&self, path: &U16CStr, info: &mut FileInfo<'_>) {
        self.closed
            .lock()
            .push((path.to_string_lossy(), info.context));
    }

    fn mounted(&self, _info: &mut FileInfo<'_>) -> Result<(), NtStatus> {
        self.mounted_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn unmounted(&self, _info: &mut FileInfo<'_>) -> Result<(), NtStatus> {
        self.unmounted_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Envelope encoders
// ============================================================================

/// Fields of an IRP_MJ_DIRECTORY_CONTROL envelope
#[derive(Debug, Clone)]
pub struct DirectoryQuery<'a> {
    pub mount_id: u32,
    pub serial_number: u32,
    pub context: u64,
    pub file_information_class: u32,
    pub file_index: u32,
    pub buffer_length: u32,
    pub directory_name: &'a str,
    pub search_pattern: Option<&'a str>,
    pub flags: u32,
}

impl Default for DirectoryQuery<'_> {
    fn default() -> Self {
        Self {
            mount_id: 1,
            serial_number: 1,
            context: 0x10,
            file_information_class: 1,
            file_index: 0,
            buffer_length: 1024,
            directory_name: "\\dir",
            search_pattern: None,
            flags: 0,
        }
    }
}

fn wide_bytes(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn header(major: IrpMajorFunction, mount_id: u32, serial_number: u32, context: u64) -> EventContextHeader {
    let mut header = EventContextHeader::new_zeroed();
    header.mount_id = U32::new(mount_id);
    header.serial_number = U32::new(serial_number);
    header.process_id = U32::new(4242);
    header.major_function = major as u8;
    header.context = U64::new(context);
    header
}

fn finish(mut envelope: Vec<u8>) -> Vec<u8> {
    let length = envelope.len() as u32;
    envelope[0..4].copy_from_slice(&length.to_le_bytes());
    envelope
}

pub fn encode_directory_request(query: &DirectoryQuery<'_>) -> Vec<u8> {
    let mut header = header(
        IrpMajorFunction::DirectoryControl,
        query.mount_id,
        query.serial_number,
        query.context,
    );
    header.minor_function = crate::io::irp::directory_minor::IRP_MN_QUERY_DIRECTORY;
    header.flags = U32::new(query.flags);

    let name = wide_bytes(query.directory_name);
    let pattern = query.search_pattern.map(wide_bytes).unwrap_or_default();

    let mut operation = DirectoryOperation::new_zeroed();
    operation.file_information_class = U32::new(query.file_information_class);
    operation.file_index = U32::new(query.file_index);
    operation.buffer_length = U32::new(query.buffer_length);
    operation.directory_name_length = U32::new(name.len() as u32);
    operation.search_pattern_length = U32::new(pattern.len() as u32);
    // SearchPatternBase is DirectoryName + 1 WCHAR; the pattern follows the
    // name's terminator
    operation.search_pattern_offset = U32::new(name.len() as u32);

    let mut envelope = Vec::new();
    envelope.extend_from_slice(header.as_bytes());
    debug_assert_eq!(envelope.len(), EVENT_CONTEXT_OPERATION_OFFSET);
    envelope.extend_from_slice(operation.as_bytes());
    envelope.extend_from_slice(&name);
    envelope.extend_from_slice(&[0, 0]);
    envelope.extend_from_slice(&pattern);
    envelope.extend_from_slice(&[0, 0]);
    finish(envelope)
}

fn encode_file_name(major: IrpMajorFunction, mount_id: u32, serial_number: u32, context: u64, name: &str) -> Vec<u8> {
    let header = header(major, mount_id, serial_number, context);
    let name = wide_bytes(name);
    let operation = FileNameOperation {
        file_name_length: U32::new(name.len() as u32),
    };

    let mut envelope = Vec::new();
    envelope.extend_from_slice(header.as_bytes());
    envelope.extend_from_slice(operation.as_bytes());
    envelope.extend_from_slice(&name);
    envelope.extend_from_slice(&[0, 0]);
    finish(envelope)
}

pub fn encode_close(mount_id: u32, serial_number: u32, context: u64, name: &str) -> Vec<u8> {
    encode_file_name(IrpMajorFunction::Close, mount_id, serial_number, context, name)
}

pub fn encode_cleanup(mount_id: u32, serial_number: u32, context: u64, name: &str) -> Vec<u8> {
    encode_file_name(IrpMajorFunction::Cleanup, mount_id, serial_number, context, name)
}

/// An envelope for a major function this core answers with NOT_IMPLEMENTED
pub fn encode_other(major: IrpMajorFunction, mount_id: u32, serial_number: u32, context: u64) -> Vec<u8> {
    finish(header(major, mount_id, serial_number, context).as_bytes().to_vec())
}
