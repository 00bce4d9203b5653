//! File System Operations
//!
//! The capability table an embedding file system implements. The shim
//! owns the transport; everything about what files exist lives behind
//! this trait.
//!
//! # Enumeration
//! `find_files_with_pattern` is preferred when the implementation can
//! filter on its own. Returning `STATUS_NOT_IMPLEMENTED` from it (the
//! default) makes the shim fall back to `find_files` and match names
//! locally.
//!
//! Both methods report entries through `emit`, in the order they should
//! be listed.

use bitflags::bitflags;
use thiserror::Error;
use widestring::{U16CStr, U16CString, U16Str};

use crate::io::irp::FileFlags;
use crate::mount::options::MountOptions;
use crate::rtl::status::{NtStatus, STATUS_NOT_IMPLEMENTED};

/// Longest file name a directory entry can carry, in UTF-16 units
/// (MAX_PATH less the terminator)
pub const MAX_FILE_NAME_LENGTH: usize = 259;

bitflags! {
    /// FILE_ATTRIBUTE_* values
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x0000_0001;
        const HIDDEN = 0x0000_0002;
        const SYSTEM = 0x0000_0004;
        const DIRECTORY = 0x0000_0010;
        const ARCHIVE = 0x0000_0020;
        const DEVICE = 0x0000_0040;
        const NORMAL = 0x0000_0080;
        const TEMPORARY = 0x0000_0100;
        const SPARSE_FILE = 0x0000_0200;
        const REPARSE_POINT = 0x0000_0400;
        const COMPRESSED = 0x0000_0800;
        const OFFLINE = 0x0000_1000;
        const NOT_CONTENT_INDEXED = 0x0000_2000;
        const ENCRYPTED = 0x0000_4000;
    }
}

/// Errors returned to the file system from `emit`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FillDataError {
    #[error("file name exceeds 259 characters")]
    NameTooLong,
    #[error("out of memory while caching directory entries")]
    OutOfMemory,
}

impl From<FillDataError> for NtStatus {
    fn from(error: FillDataError) -> Self {
        match error {
            FillDataError::NameTooLong => crate::rtl::status::STATUS_NAME_TOO_LONG,
            FillDataError::OutOfMemory => crate::rtl::status::STATUS_NO_MEMORY,
        }
    }
}

/// One directory entry reported by the file system (WIN32_FIND_DATAW)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindData {
    file_name: U16CString,
    pub attributes: FileAttributes,
    /// NT time (100ns since 1601)
    pub creation_time: i64,
    pub last_access_time: i64,
    pub last_write_time: i64,
    pub file_size: u64,
}

impl FindData {
    /// Create an entry with zeroed times and size.
    ///
    /// Fails if the name is longer than `MAX_FILE_NAME_LENGTH` units. Names
    /// with interior NULs are cut at the first NUL.
    pub fn new(file_name: &U16Str, attributes: FileAttributes) -> Result<Self, FillDataError> {
        let file_name = U16CString::from_ustr_truncate(file_name);
        if file_name.len() > MAX_FILE_NAME_LENGTH {
            return Err(FillDataError::NameTooLong);
        }
        Ok(Self {
            file_name,
            attributes,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
            file_size: 0,
        })
    }

    pub fn with_times(mut self, creation: i64, last_access: i64, last_write: i64) -> Self {
        self.creation_time = creation;
        self.last_access_time = last_access;
        self.last_write_time = last_write;
        self
    }

    pub fn with_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn file_name(&self) -> &U16CStr {
        &self.file_name
    }
}

/// Per-request view handed to every callback (DOKAN_FILE_INFO)
#[derive(Debug)]
pub struct FileInfo<'a> {
    /// Value owned by the file system; persisted per open handle
    pub context: u64,
    /// Process that issued the request
    pub process_id: u32,
    pub is_directory: bool,
    pub flags: FileFlags,
    options: &'a MountOptions,
}

impl<'a> FileInfo<'a> {
    pub fn new(options: &'a MountOptions) -> Self {
        Self {
            context: 0,
            process_id: 0,
            is_directory: false,
            flags: FileFlags::empty(),
            options,
        }
    }

    pub fn options(&self) -> &MountOptions {
        self.options
    }

    pub fn delete_on_close(&self) -> bool {
        self.flags.contains(FileFlags::DELETE_ON_CLOSE)
    }

    pub fn paging_io(&self) -> bool {
        self.flags.contains(FileFlags::PAGING_IO)
    }

    pub fn synchronous_io(&self) -> bool {
        self.flags.contains(FileFlags::SYNCHRONOUS_IO)
    }

    pub fn no_cache(&self) -> bool {
        self.flags.contains(FileFlags::NOCACHE)
    }

    pub fn write_to_end_of_file(&self) -> bool {
        self.flags.contains(FileFlags::WRITE_TO_END_OF_FILE)
    }
}

/// Sink for entries produced by `find_files*`
pub type FillFindData<'a> = dyn FnMut(&FindData) -> Result<(), FillDataError> + 'a;

/// The external file system
///
/// Callbacks run on worker threads, concurrently for different handles,
/// and never while the shim holds one of its locks.
pub trait FileSystemOperations: Send + Sync {
    /// List every entry of `path`.
    fn find_files(
        &self,
        _path: &U16CStr,
        _emit: &mut FillFindData<'_>,
        _info: &mut FileInfo<'_>,
    ) -> Result<(), NtStatus> {
        Err(STATUS_NOT_IMPLEMENTED)
    }

    /// List the entries of `path` matching `pattern`.
    ///
    /// The shim does not re-check names returned from here.
    fn find_files_with_pattern(
        &self,
        _path: &U16CStr,
        _pattern: &U16CStr,
        _emit: &mut FillFindData<'_>,
        _info: &mut FileInfo<'_>,
    ) -> Result<(), NtStatus> {
        Err(STATUS_NOT_IMPLEMENTED)
    }

    /// The last reference to an open handle is gone.
    fn close_file(&self, _path: &U16CStr, _info: &mut FileInfo<'_>) {}

    fn mounted(&self, _info: &mut FileInfo<'_>) -> Result<(), NtStatus> {
        Ok(())
    }

    fn unmounted(&self, _info: &mut FileInfo<'_>) -> Result<(), NtStatus> {
        Ok(())
    }
}
