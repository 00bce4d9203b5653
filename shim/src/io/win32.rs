//! Win32 device handles
//!
//! `CreateFileW` / `DeviceIoControl` / `CloseHandle` behind the
//! `DeviceOpener` and `DeviceIo` traits.

use core::ffi::c_void;
use core::ptr;

use widestring::U16CStr;
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_BACKUP_SEMANTICS, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

use crate::io::device::{DeviceAccess, DeviceError, DeviceIo, DeviceOpener};

/// Opens real driver devices
#[derive(Debug, Default, Clone, Copy)]
pub struct Win32DeviceOpener;

/// Owned device handle; closed on drop
#[derive(Debug)]
pub struct Win32Device {
    handle: HANDLE,
}

// The handle is only passed to thread-safe Win32 calls.
unsafe impl Send for Win32Device {}
unsafe impl Sync for Win32Device {}

impl DeviceOpener for Win32DeviceOpener {
    type Device = Win32Device;

    fn open(&self, path: &U16CStr, access: DeviceAccess) -> Result<Win32Device, DeviceError> {
        let (desired_access, share_mode, flags) = match access {
            DeviceAccess::Query => (0, FILE_SHARE_READ | FILE_SHARE_WRITE, 0),
            DeviceAccess::ReadWrite => (
                GENERIC_READ | GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                0,
            ),
            DeviceAccess::Notification => (
                0,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                FILE_FLAG_BACKUP_SEMANTICS,
            ),
        };

        // SAFETY: `path` is NUL terminated and outlives the call.
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                desired_access,
                share_mode,
                ptr::null(),
                OPEN_EXISTING,
                flags,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            // SAFETY: no preconditions.
            let code = unsafe { GetLastError() };
            return Err(DeviceError::open(path, code));
        }

        Ok(Win32Device { handle })
    }
}

impl DeviceIo for Win32Device {
    fn device_io_control(
        &self,
        ioctl: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, DeviceError> {
        let mut returned: u32 = 0;
        let input_ptr = if input.is_empty() {
            ptr::null()
        } else {
            input.as_ptr().cast::<c_void>()
        };
        let output_ptr = if output.is_empty() {
            ptr::null_mut()
        } else {
            output.as_mut_ptr().cast::<c_void>()
        };

        // SAFETY: both buffers are valid for the lengths passed, and the
        // call is synchronous (no OVERLAPPED), so they outlive it.
        let ok = unsafe {
            DeviceIoControl(
                self.handle,
                ioctl,
                input_ptr,
                input.len() as u32,
                output_ptr,
                output.len() as u32,
                &mut returned,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            // SAFETY: no preconditions.
            let code = unsafe { GetLastError() };
            return Err(DeviceError::Ioctl { ioctl, code });
        }

        Ok(returned as usize)
    }
}

impl Drop for Win32Device {
    fn drop(&mut self) {
        // SAFETY: the handle came from CreateFileW and is closed once.
        unsafe {
            CloseHandle(self.handle);
        }
    }
}
