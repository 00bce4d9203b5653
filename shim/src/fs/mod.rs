//! File System Services (fs)
//!
//! - **Operations**: the callback table an embedding file system implements
//! - **Records**: FILE_*_INFORMATION directory layouts
//! - **Handles**: per-mount open file table and cached listings
//! - **Directory**: query-directory enumeration

pub mod operations;
pub mod dirinfo;
pub mod handle;
pub mod directory;

pub use operations::{
    FileAttributes,
    FileInfo,
    FileSystemOperations,
    FillDataError,
    FillFindData,
    FindData,
};

pub use dirinfo::FileInformationClass;
pub use handle::OpenHandleTable;
