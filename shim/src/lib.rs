//! ntshim
//!
//! User-mode half of a Windows installable file system. A kernel driver
//! turns file system IRPs into request envelopes; this crate pulls them
//! off the driver, hands them to an embedding file system through
//! `FileSystemOperations` and sends the answers back.
//!
//! # Architecture Overview
//!
//! - **rtl** - Runtime Library: NTSTATUS codes, FILETIME helpers
//! - **fsrtl** - File System Runtime Library: wildcard name matching
//! - **io** - I/O: IRP codes, envelopes, device handles, dispatch
//! - **fs** - File System: operations table, directory records, open handles
//! - **ex** - Executive: worker threads
//! - **mount** - Mount lifecycle: options, driver control, registry
//!
//! # Usage
//!
//! ```text
//! let registry = Arc::new(Registry::new());
//! let mount = Mount::new(Arc::new(Win32DeviceOpener), registry.clone());
//! mount.run(MountOptions::new("M"), Arc::new(MyFileSystem))?;  // blocks
//! ```
//!
//! `Mount::unmount` or `shutdown` from another thread ends `run`.

#![allow(clippy::new_without_default)]

pub mod rtl;
pub mod fsrtl;
pub mod io;
pub mod fs;
pub mod ex;
pub mod mount;

#[cfg(test)]
mod testing;

pub use rtl::NtStatus;

pub use fs::{
    FileAttributes,
    FileInfo,
    FileSystemOperations,
    FillDataError,
    FillFindData,
    FindData,
};

pub use io::{DeviceAccess, DeviceError, DeviceIo, DeviceOpener};

pub use mount::control::{ControlError, DriverInfo, MountPointInfo};
pub use mount::options::{MountError, MountFlags, MountOptions, DOKAN_VERSION};
pub use mount::registry::Registry;
pub use mount::{shutdown, Mount, MountInstance};
