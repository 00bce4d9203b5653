//! Kernel Device Abstraction
//!
//! Everything the shim says to the driver goes through a device handle and
//! `DeviceIoControl`. The two traits below are that surface: the Windows
//! implementation lives in `io::win32`, and tests substitute a scripted
//! device.
//!
//! # Handle Lifetime
//! Handles close when the `Device` value drops. Worker threads open a
//! fresh handle per request, the way the driver expects.

use thiserror::Error;
use widestring::U16CStr;

/// ERROR_FILE_NOT_FOUND
pub const ERROR_FILE_NOT_FOUND: u32 = 2;
/// ERROR_MORE_DATA: output buffer too small, retry with a larger one
pub const ERROR_MORE_DATA: u32 = 234;
/// ERROR_OPERATION_ABORTED: pending IRPs released at unmount
pub const ERROR_OPERATION_ABORTED: u32 = 995;
/// ERROR_NO_SYSTEM_RESOURCES: transient, the driver is short on memory
pub const ERROR_NO_SYSTEM_RESOURCES: u32 = 1450;

/// Access requested when opening a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAccess {
    /// Query-only handle (desired access 0), as used for IOCTLs
    Query,
    /// GENERIC_READ | GENERIC_WRITE
    ReadWrite,
    /// Directory-style handle for the notification file
    /// (FILE_FLAG_BACKUP_SEMANTICS, all share modes)
    Notification,
}

/// Device open or IOCTL failure, carrying the Win32 error code
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("cannot open {path}: win32 error {code}")]
    Open { path: String, code: u32 },
    #[error("ioctl {ioctl:#010x} failed: win32 error {code}")]
    Ioctl { ioctl: u32, code: u32 },
}

impl DeviceError {
    pub fn code(&self) -> u32 {
        match self {
            Self::Open { code, .. } | Self::Ioctl { code, .. } => *code,
        }
    }

    /// Worth retrying after a short pause
    pub fn is_transient(&self) -> bool {
        self.code() == ERROR_NO_SYSTEM_RESOURCES
    }

    /// The output buffer was too small
    pub fn is_more_data(&self) -> bool {
        self.code() == ERROR_MORE_DATA
    }

    pub(crate) fn open(path: &U16CStr, code: u32) -> Self {
        Self::Open {
            path: path.to_string_lossy(),
            code,
        }
    }
}

/// An open device handle
pub trait DeviceIo {
    /// Synchronous DeviceIoControl; returns the number of bytes written to
    /// `output`.
    fn device_io_control(
        &self,
        ioctl: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, DeviceError>;
}

/// Opens device handles by path
pub trait DeviceOpener: Send + Sync {
    type Device: DeviceIo + Send + Sync + 'static;

    fn open(&self, path: &U16CStr, access: DeviceAccess) -> Result<Self::Device, DeviceError>;

    /// Open `path`, send one IOCTL and close it again (SendToDevice)
    fn send(
        &self,
        path: &U16CStr,
        ioctl: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, DeviceError> {
        let device = self.open(path, DeviceAccess::Query)?;
        device.device_io_control(ioctl, input, output)
    }
}
