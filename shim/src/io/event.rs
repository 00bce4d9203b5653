//! Request and Response Envelopes
//!
//! Wire formats exchanged with the kernel driver over the event IOCTLs.
//! Layouts are the x64 driver's `EVENT_CONTEXT` and `EVENT_INFORMATION`,
//! little-endian, byte for byte.
//!
//! # EVENT_CONTEXT
//! ```text
//! 0   Length            4   MountId          8   SerialNumber
//! 12  ProcessId         16  MajorFunction    17  MinorFunction
//! 20  Flags             24  FileFlags        32  Context (u64)
//! 40  Operation (union, selected by MajorFunction)
//! ```
//!
//! # EVENT_INFORMATION
//! ```text
//! 0   SerialNumber      4   Status           8   Operation (union)
//! 16  Context (u64)     24  BufferLength     28  Buffer[]
//! ```

use core::mem::size_of;

use thiserror::Error;
use widestring::U16CString;
use zerocopy::little_endian::{I32, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::io::irp::{sl_flags, FileFlags, IrpMajorFunction};
use crate::rtl::status::{NtStatus, STATUS_NO_MEMORY, STATUS_SUCCESS};

/// Largest request the driver hands out in one FSCTL_EVENT_WAIT
pub const EVENT_CONTEXT_MAX_SIZE: usize = 32 * 1024;

/// Offset of the operation union in EVENT_CONTEXT
pub const EVENT_CONTEXT_OPERATION_OFFSET: usize = size_of::<EventContextHeader>();

/// Offset of `Buffer` in EVENT_INFORMATION
pub const EVENT_INFORMATION_BUFFER_OFFSET: usize = size_of::<EventInformationHeader>();

/// `sizeof(EVENT_INFORMATION)`, which carries an 8-byte buffer inline
pub const EVENT_INFORMATION_MIN_SIZE: usize = 40;

/// Fixed EVENT_CONTEXT header
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct EventContextHeader {
    pub length: U32,
    pub mount_id: U32,
    pub serial_number: U32,
    pub process_id: U32,
    pub major_function: u8,
    pub minor_function: u8,
    pub reserved0: [u8; 2],
    pub flags: U32,
    pub file_flags: U32,
    pub reserved1: [u8; 4],
    pub context: U64,
}

/// `Operation.Directory`, followed by DirectoryName and SearchPatternBase
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DirectoryOperation {
    pub file_information_class: U32,
    pub file_index: U32,
    pub buffer_length: U32,
    /// In bytes, without the terminator
    pub directory_name_length: U32,
    /// In bytes
    pub search_pattern_length: U32,
    /// Byte offset from SearchPatternBase
    pub search_pattern_offset: U32,
}

/// `Operation.Close` / `Operation.Cleanup`, followed by FileName
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileNameOperation {
    /// In bytes, without the terminator
    pub file_name_length: U32,
}

/// Fixed EVENT_INFORMATION header
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct EventInformationHeader {
    pub serial_number: U32,
    pub status: I32,
    /// `Operation.Directory.Index`; the rest of the union is unused here
    pub directory_index: U32,
    pub reserved: [u8; 4],
    pub context: U64,
    pub buffer_length: U32,
}

/// Malformed request envelopes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("envelope too short: {actual} bytes, need {needed}")]
    TooShort { needed: usize, actual: usize },
    #[error("envelope length {declared} disagrees with {received} bytes received")]
    LengthMismatch { declared: usize, received: usize },
    #[error("{field} runs past the end of the envelope")]
    OutOfBounds { field: &'static str },
    #[error("unknown major function {0}")]
    UnknownMajorFunction(u8),
}

/// Parameters of an IRP_MJ_DIRECTORY_CONTROL request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRequest {
    /// Raw FILE_INFORMATION_CLASS; validated by the dispatcher
    pub file_information_class: u32,
    pub file_index: u32,
    pub buffer_length: u32,
    pub directory_name: U16CString,
    pub search_pattern: Option<U16CString>,
}

/// Operation-specific part of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Directory(DirectoryRequest),
    Close { file_name: U16CString },
    Cleanup { file_name: U16CString },
    /// Any other major function; payload not decoded
    Other,
}

/// A decoded request envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub mount_id: u32,
    pub serial_number: u32,
    pub process_id: u32,
    pub major_function: IrpMajorFunction,
    pub minor_function: u8,
    pub flags: u32,
    pub file_flags: FileFlags,
    /// Driver's handle for the open file object
    pub context: u64,
    pub operation: Operation,
}

impl EventContext {
    /// Decode the header only, e.g. to check the mount id before
    /// committing to a full decode.
    pub fn peek_header(buffer: &[u8]) -> Result<EventContextHeader, DecodeError> {
        EventContextHeader::read_from_prefix(buffer)
            .map(|(header, _)| header)
            .map_err(|_| DecodeError::TooShort {
                needed: EVENT_CONTEXT_OPERATION_OFFSET,
                actual: buffer.len(),
            })
    }

    /// Decode one envelope as returned by FSCTL_EVENT_WAIT.
    pub fn decode(buffer: &[u8]) -> Result<Self, DecodeError> {
        let header = Self::peek_header(buffer)?;

        let declared = header.length.get() as usize;
        if declared < EVENT_CONTEXT_OPERATION_OFFSET || declared > buffer.len() {
            return Err(DecodeError::LengthMismatch {
                declared,
                received: buffer.len(),
            });
        }
        let buffer = &buffer[..declared];

        let major_function = IrpMajorFunction::try_from(header.major_function)
            .map_err(DecodeError::UnknownMajorFunction)?;

        let operation = match major_function {
            IrpMajorFunction::DirectoryControl => {
                Operation::Directory(decode_directory(buffer)?)
            }
            IrpMajorFunction::Close => Operation::Close {
                file_name: decode_file_name(buffer)?,
            },
            IrpMajorFunction::Cleanup => Operation::Cleanup {
                file_name: decode_file_name(buffer)?,
            },
            _ => Operation::Other,
        };

        Ok(Self {
            mount_id: header.mount_id.get(),
            serial_number: header.serial_number.get(),
            process_id: header.process_id.get(),
            major_function,
            minor_function: header.minor_function,
            flags: header.flags.get(),
            file_flags: FileFlags::from_bits_truncate(header.file_flags.get()),
            context: header.context.get(),
            operation,
        })
    }

    pub fn return_single_entry(&self) -> bool {
        self.flags & sl_flags::SL_RETURN_SINGLE_ENTRY != 0
    }

    /// Path the request refers to, if its operation carries one
    pub fn file_name(&self) -> Option<&U16CString> {
        match &self.operation {
            Operation::Directory(directory) => Some(&directory.directory_name),
            Operation::Close { file_name } | Operation::Cleanup { file_name } => Some(file_name),
            Operation::Other => None,
        }
    }
}

fn decode_directory(buffer: &[u8]) -> Result<DirectoryRequest, DecodeError> {
    let operation = &buffer[EVENT_CONTEXT_OPERATION_OFFSET..];
    let (directory, _) =
        DirectoryOperation::read_from_prefix(operation).map_err(|_| DecodeError::TooShort {
            needed: EVENT_CONTEXT_OPERATION_OFFSET + size_of::<DirectoryOperation>(),
            actual: buffer.len(),
        })?;

    let name_offset = EVENT_CONTEXT_OPERATION_OFFSET + size_of::<DirectoryOperation>();
    let mut directory_name = read_wide(
        buffer,
        name_offset,
        directory.directory_name_length.get() as usize,
        "DirectoryName",
    )?;
    normalize_file_name(&mut directory_name);

    let pattern_length = directory.search_pattern_length.get() as usize;
    let search_pattern = if pattern_length != 0 {
        // SearchPatternBase sits one WCHAR past DirectoryName[0]
        let pattern_base = name_offset + 2;
        let pattern_offset = pattern_base
            .checked_add(directory.search_pattern_offset.get() as usize)
            .ok_or(DecodeError::OutOfBounds {
                field: "SearchPattern",
            })?;
        let pattern = read_wide(buffer, pattern_offset, pattern_length, "SearchPattern")?;
        Some(U16CString::from_vec_truncate(pattern))
    } else {
        None
    };

    Ok(DirectoryRequest {
        file_information_class: directory.file_information_class.get(),
        file_index: directory.file_index.get(),
        buffer_length: directory.buffer_length.get(),
        directory_name: U16CString::from_vec_truncate(directory_name),
        search_pattern,
    })
}

fn decode_file_name(buffer: &[u8]) -> Result<U16CString, DecodeError> {
    let operation = &buffer[EVENT_CONTEXT_OPERATION_OFFSET..];
    let (close, _) =
        FileNameOperation::read_from_prefix(operation).map_err(|_| DecodeError::TooShort {
            needed: EVENT_CONTEXT_OPERATION_OFFSET + size_of::<FileNameOperation>(),
            actual: buffer.len(),
        })?;

    let mut file_name = read_wide(
        buffer,
        EVENT_CONTEXT_OPERATION_OFFSET + size_of::<FileNameOperation>(),
        close.file_name_length.get() as usize,
        "FileName",
    )?;
    normalize_file_name(&mut file_name);
    Ok(U16CString::from_vec_truncate(file_name))
}

/// Read `length` bytes of UTF-16 at `offset`, up to the first NUL
fn read_wide(
    buffer: &[u8],
    offset: usize,
    length: usize,
    field: &'static str,
) -> Result<Vec<u16>, DecodeError> {
    let end = offset
        .checked_add(length)
        .ok_or(DecodeError::OutOfBounds { field })?;
    let bytes = buffer
        .get(offset..end)
        .ok_or(DecodeError::OutOfBounds { field })?;

    Ok(bytes
        .chunks_exact(2)
        .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
        .take_while(|&unit| unit != 0)
        .collect())
}

const BACKSLASH: u16 = b'\\' as u16;

/// Canonicalize a request path in place.
///
/// A doubled leading separator collapses to one, then a trailing separator
/// is dropped unless the name is two units or shorter.
pub fn normalize_file_name(name: &mut Vec<u16>) {
    if name.len() >= 2 && name[0] == BACKSLASH && name[1] == BACKSLASH {
        name.remove(0);
    }
    if name.len() > 2 && name.last() == Some(&BACKSLASH) {
        name.pop();
    }
}

/// A response envelope under construction
#[derive(Debug)]
pub struct EventInformation {
    buffer: Vec<u8>,
}

impl EventInformation {
    /// Allocated size for a response carrying `buffer_length` payload bytes
    pub const fn allocation_size(buffer_length: usize) -> usize {
        let size = EVENT_INFORMATION_MIN_SIZE - 8 + buffer_length;
        if size > EVENT_INFORMATION_MIN_SIZE {
            size
        } else {
            EVENT_INFORMATION_MIN_SIZE
        }
    }

    /// Zeroed response for `request` with room for `buffer_length` bytes.
    ///
    /// Fails with `STATUS_NO_MEMORY` if the buffer cannot be allocated.
    pub fn for_request(request: &EventContext, buffer_length: usize) -> Result<Self, NtStatus> {
        Self::new(request.serial_number, request.context, buffer_length)
    }

    /// Zeroed response answering `serial_number`.
    pub fn new(serial_number: u32, context: u64, buffer_length: usize) -> Result<Self, NtStatus> {
        let size = Self::allocation_size(buffer_length);
        let mut buffer = Vec::new();
        buffer.try_reserve_exact(size).map_err(|_| STATUS_NO_MEMORY)?;
        buffer.resize(size, 0);

        let mut info = Self { buffer };
        info.update_header(|header| {
            header.serial_number = U32::new(serial_number);
            header.context = U64::new(context);
            header.status = I32::new(STATUS_SUCCESS.raw());
        });
        Ok(info)
    }

    fn header(&self) -> EventInformationHeader {
        EventInformationHeader::read_from_prefix(&self.buffer)
            .map(|(header, _)| header)
            .unwrap_or_else(|_| EventInformationHeader::new_zeroed())
    }

    fn update_header(&mut self, update: impl FnOnce(&mut EventInformationHeader)) {
        if let Ok((header, _)) = EventInformationHeader::mut_from_prefix(&mut self.buffer) {
            update(header);
        }
    }

    pub fn status(&self) -> NtStatus {
        NtStatus(self.header().status.get())
    }

    pub fn set_status(&mut self, status: NtStatus) {
        self.update_header(|header| header.status = I32::new(status.raw()));
    }

    pub fn directory_index(&self) -> u32 {
        self.header().directory_index.get()
    }

    pub fn set_directory_index(&mut self, index: u32) {
        self.update_header(|header| header.directory_index = U32::new(index));
    }

    pub fn context(&self) -> u64 {
        self.header().context.get()
    }

    pub fn serial_number(&self) -> u32 {
        self.header().serial_number.get()
    }

    pub fn buffer_length(&self) -> u32 {
        self.header().buffer_length.get()
    }

    pub fn set_buffer_length(&mut self, length: u32) {
        self.update_header(|header| header.buffer_length = U32::new(length));
    }

    /// Payload area after the header
    pub fn payload(&self) -> &[u8] {
        &self.buffer[EVENT_INFORMATION_BUFFER_OFFSET..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[EVENT_INFORMATION_BUFFER_OFFSET..]
    }

    /// Bytes sent with FSCTL_EVENT_INFO
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Decode a response, as the driver would
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < EVENT_INFORMATION_MIN_SIZE {
            return Err(DecodeError::TooShort {
                needed: EVENT_INFORMATION_MIN_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            buffer: bytes.to_vec(),
        })
    }
}
