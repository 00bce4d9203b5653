//! Directory Information Records
//!
//! Packs directory entries into the FILE_*_INFORMATION layouts that
//! NtQueryDirectoryFile returns.
//!
//! # Layout
//! Every record starts with `NextEntryOffset` and `FileIndex`, ends with
//! a variable length `FileName` (not NUL terminated), and starts on an
//! 8-byte boundary within the output buffer. The size reserved for a record
//! is the C `sizeof` of its structure (which already counts one name
//! character and tail padding) plus the name bytes, rounded up to 8.
//!
//! # Defaults
//! The shim does not track short names, EA sizes, file ids or reparse
//! tags; those fields are always zero. Change time mirrors the last write
//! time, and allocation size is the file size rounded up to the mount's
//! allocation unit.

use core::mem::size_of;

use zerocopy::little_endian::{I64, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::fs::operations::FindData;

/// FILE_INFORMATION_CLASS values accepted for directory queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FileInformationClass {
    Directory = 1,
    FullDirectory = 2,
    BothDirectory = 3,
    Names = 12,
    IdBothDirectory = 37,
    IdFullDirectory = 38,
    IdExtdDirectory = 60,
    IdExtdBothDirectory = 63,
}

impl TryFrom<u32> for FileInformationClass {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Directory,
            2 => Self::FullDirectory,
            3 => Self::BothDirectory,
            12 => Self::Names,
            37 => Self::IdBothDirectory,
            38 => Self::IdFullDirectory,
            60 => Self::IdExtdDirectory,
            63 => Self::IdExtdBothDirectory,
            other => return Err(other),
        })
    }
}

impl FileInformationClass {
    /// `sizeof` of the kernel structure, including its one-character
    /// `FileName` array and tail padding
    pub const fn record_size(self) -> usize {
        match self {
            Self::Directory => 72,
            Self::FullDirectory => 72,
            Self::BothDirectory => 96,
            Self::Names => 16,
            Self::IdBothDirectory => 112,
            Self::IdFullDirectory => 88,
            Self::IdExtdDirectory => 96,
            Self::IdExtdBothDirectory => 120,
        }
    }

    /// Byte offset of `FileName`
    pub const fn name_offset(self) -> usize {
        match self {
            Self::Directory => size_of::<FileDirectoryInformation>(),
            Self::FullDirectory => size_of::<FileFullDirInformation>(),
            Self::BothDirectory => size_of::<FileBothDirInformation>(),
            Self::Names => size_of::<FileNamesInformation>(),
            Self::IdBothDirectory => size_of::<FileIdBothDirInformation>(),
            Self::IdFullDirectory => size_of::<FileIdFullDirInformation>(),
            Self::IdExtdDirectory => size_of::<FileIdExtdDirInformation>(),
            Self::IdExtdBothDirectory => size_of::<FileIdExtdBothDirInformation>(),
        }
    }

    /// Packed size of a record whose name is `name_len` UTF-16 units
    pub const fn entry_size(self, name_len: usize) -> usize {
        quad_align(self.record_size() + name_len * 2)
    }
}

/// Round up to the next multiple of 8
#[inline]
pub const fn quad_align(size: usize) -> usize {
    (size + 7) & !7
}

/// FILE_DIRECTORY_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileDirectoryInformation {
    pub next_entry_offset: U32,
    pub file_index: U32,
    pub creation_time: I64,
    pub last_access_time: I64,
    pub last_write_time: I64,
    pub change_time: I64,
    pub end_of_file: I64,
    pub allocation_size: I64,
    pub file_attributes: U32,
    pub file_name_length: U32,
}

/// FILE_FULL_DIR_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileFullDirInformation {
    pub base: FileDirectoryInformation,
    pub ea_size: U32,
}

/// FILE_BOTH_DIR_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileBothDirInformation {
    pub base: FileDirectoryInformation,
    pub ea_size: U32,
    pub short_name_length: u8,
    pub reserved: u8,
    pub short_name: [u8; 24],
}

/// FILE_NAMES_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileNamesInformation {
    pub next_entry_offset: U32,
    pub file_index: U32,
    pub file_name_length: U32,
}

/// FILE_ID_BOTH_DIR_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileIdBothDirInformation {
    pub base: FileDirectoryInformation,
    pub ea_size: U32,
    pub short_name_length: u8,
    pub reserved: u8,
    pub short_name: [u8; 24],
    pub padding: [u8; 2],
    pub file_id: I64,
}

/// FILE_ID_FULL_DIR_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileIdFullDirInformation {
    pub base: FileDirectoryInformation,
    pub ea_size: U32,
    pub padding: [u8; 4],
    pub file_id: I64,
}

/// FILE_ID_EXTD_DIR_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileIdExtdDirInformation {
    pub base: FileDirectoryInformation,
    pub ea_size: U32,
    pub reparse_point_tag: U32,
    pub file_id: [u8; 16],
}

/// FILE_ID_EXTD_BOTH_DIR_INFORMATION without the name
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileIdExtdBothDirInformation {
    pub base: FileDirectoryInformation,
    pub ea_size: U32,
    pub reparse_point_tag: U32,
    pub file_id: [u8; 16],
    pub short_name_length: u8,
    pub reserved: u8,
    pub short_name: [u8; 24],
}

/// One record header, tagged by the information class it encodes
#[derive(Debug, Clone, Copy)]
pub enum DirectoryRecord {
    Directory(FileDirectoryInformation),
    FullDirectory(FileFullDirInformation),
    BothDirectory(FileBothDirInformation),
    Names(FileNamesInformation),
    IdBothDirectory(FileIdBothDirInformation),
    IdFullDirectory(FileIdFullDirInformation),
    IdExtdDirectory(FileIdExtdDirInformation),
    IdExtdBothDirectory(FileIdExtdBothDirInformation),
}

impl DirectoryRecord {
    /// Build the header for `entry` in the layout `class` selects.
    pub fn new(
        class: FileInformationClass,
        entry: &FindData,
        index: u32,
        allocation_unit: u32,
    ) -> Self {
        let base = directory_base(entry, index, allocation_unit);
        match class {
            FileInformationClass::Directory => Self::Directory(base),
            FileInformationClass::FullDirectory => {
                let mut record = FileFullDirInformation::new_zeroed();
                record.base = base;
                Self::FullDirectory(record)
            }
            FileInformationClass::BothDirectory => {
                let mut record = FileBothDirInformation::new_zeroed();
                record.base = base;
                Self::BothDirectory(record)
            }
            FileInformationClass::Names => {
                let mut record = FileNamesInformation::new_zeroed();
                record.file_index = base.file_index;
                record.file_name_length = base.file_name_length;
                Self::Names(record)
            }
            FileInformationClass::IdBothDirectory => {
                let mut record = FileIdBothDirInformation::new_zeroed();
                record.base = base;
                Self::IdBothDirectory(record)
            }
            FileInformationClass::IdFullDirectory => {
                let mut record = FileIdFullDirInformation::new_zeroed();
                record.base = base;
                Self::IdFullDirectory(record)
            }
            FileInformationClass::IdExtdDirectory => {
                let mut record = FileIdExtdDirInformation::new_zeroed();
                record.base = base;
                Self::IdExtdDirectory(record)
            }
            FileInformationClass::IdExtdBothDirectory => {
                let mut record = FileIdExtdBothDirInformation::new_zeroed();
                record.base = base;
                Self::IdExtdBothDirectory(record)
            }
        }
    }

    pub fn class(&self) -> FileInformationClass {
        match self {
            Self::Directory(_) => FileInformationClass::Directory,
            Self::FullDirectory(_) => FileInformationClass::FullDirectory,
            Self::BothDirectory(_) => FileInformationClass::BothDirectory,
            Self::Names(_) => FileInformationClass::Names,
            Self::IdBothDirectory(_) => FileInformationClass::IdBothDirectory,
            Self::IdFullDirectory(_) => FileInformationClass::IdFullDirectory,
            Self::IdExtdDirectory(_) => FileInformationClass::IdExtdDirectory,
            Self::IdExtdBothDirectory(_) => FileInformationClass::IdExtdBothDirectory,
        }
    }

    /// Header bytes, up to `FileName`
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Directory(r) => r.as_bytes(),
            Self::FullDirectory(r) => r.as_bytes(),
            Self::BothDirectory(r) => r.as_bytes(),
            Self::Names(r) => r.as_bytes(),
            Self::IdBothDirectory(r) => r.as_bytes(),
            Self::IdFullDirectory(r) => r.as_bytes(),
            Self::IdExtdDirectory(r) => r.as_bytes(),
            Self::IdExtdBothDirectory(r) => r.as_bytes(),
        }
    }
}

fn directory_base(entry: &FindData, index: u32, allocation_unit: u32) -> FileDirectoryInformation {
    let name_bytes = entry.file_name().len() * 2;
    let end_of_file = entry.file_size as i64;

    FileDirectoryInformation {
        next_entry_offset: U32::new(0),
        file_index: U32::new(index),
        creation_time: I64::new(entry.creation_time),
        last_access_time: I64::new(entry.last_access_time),
        last_write_time: I64::new(entry.last_write_time),
        change_time: I64::new(entry.last_write_time),
        end_of_file: I64::new(end_of_file),
        allocation_size: I64::new(align_allocation_size(end_of_file, allocation_unit)),
        file_attributes: U32::new(entry.attributes.bits()),
        file_name_length: U32::new(name_bytes as u32),
    }
}

/// Round a file size up to a whole number of allocation units
pub fn align_allocation_size(size: i64, allocation_unit: u32) -> i64 {
    let unit = i64::from(allocation_unit);
    if unit == 0 || size <= 0 {
        return size.max(0);
    }
    match size.checked_add(unit - 1) {
        Some(padded) => padded / unit * unit,
        None => size,
    }
}

/// Pack one entry at the start of `buffer`.
///
/// `remaining` is the space left in the response. Returns the number of
/// bytes written and decrements `remaining` by it, or returns 0 and writes
/// nothing when the record does not fit. A zero return is the normal end
/// of a page, not an error.
pub fn fill_directory_information(
    class: FileInformationClass,
    buffer: &mut [u8],
    remaining: &mut usize,
    entry: &FindData,
    index: u32,
    allocation_unit: u32,
) -> usize {
    let name = entry.file_name().as_slice();
    let size = class.entry_size(name.len());
    if *remaining < size || buffer.len() < size {
        return 0;
    }

    let record = &mut buffer[..size];
    record.fill(0);

    let header = DirectoryRecord::new(class, entry, index, allocation_unit);
    let header = header.as_bytes();
    record[..header.len()].copy_from_slice(header);

    let name_offset = class.name_offset();
    for (dst, unit) in record[name_offset..name_offset + name.len() * 2]
        .chunks_exact_mut(2)
        .zip(name)
    {
        dst.copy_from_slice(&unit.to_le_bytes());
    }

    *remaining -= size;
    size
}

/// Patch `NextEntryOffset` of the record starting at `record`.
pub fn set_next_entry_offset(record: &mut [u8], offset: u32) {
    if let Some(field) = record.get_mut(..4) {
        field.copy_from_slice(&offset.to_le_bytes());
    }
}

/// Read `NextEntryOffset` of the record starting at `record`.
pub fn next_entry_offset(record: &[u8]) -> u32 {
    record
        .get(..4)
        .and_then(|field| U32::read_from_bytes(field).ok())
        .map_or(0, |field| field.get())
}
