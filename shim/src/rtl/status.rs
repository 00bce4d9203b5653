//! NTSTATUS values
//!
//! The kernel only ever sees a status field, so every outcome of a
//! dispatch, expected or not, ends up as one of these.
//!
//! # Severity
//! The top two bits encode severity: `00` success, `01` informational,
//! `10` warning, `11` error. Warnings such as `STATUS_BUFFER_OVERFLOW` and
//! `STATUS_NO_MORE_FILES` are normal pagination outcomes, not failures.

use core::fmt;

/// An NTSTATUS code
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub i32);

impl NtStatus {
    /// Raw value as sent on the wire
    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// NT_SUCCESS: success or informational
    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 >= 0
    }

    /// NT_WARNING
    #[inline]
    pub const fn is_warning(self) -> bool {
        (self.0 as u32) >> 30 == 2
    }

    /// NT_ERROR
    #[inline]
    pub const fn is_error(self) -> bool {
        (self.0 as u32) >> 30 == 3
    }

    /// Lift a raw code into `Result`, treating anything but `STATUS_SUCCESS` as `Err`.
    pub fn ok(self) -> Result<(), NtStatus> {
        if self == STATUS_SUCCESS {
            Ok(())
        } else {
            Err(self)
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            STATUS_SUCCESS => "STATUS_SUCCESS",
            STATUS_PENDING => "STATUS_PENDING",
            STATUS_BUFFER_OVERFLOW => "STATUS_BUFFER_OVERFLOW",
            STATUS_NO_MORE_FILES => "STATUS_NO_MORE_FILES",
            STATUS_NOT_IMPLEMENTED => "STATUS_NOT_IMPLEMENTED",
            STATUS_INVALID_PARAMETER => "STATUS_INVALID_PARAMETER",
            STATUS_NO_SUCH_FILE => "STATUS_NO_SUCH_FILE",
            STATUS_NO_MEMORY => "STATUS_NO_MEMORY",
            STATUS_ACCESS_DENIED => "STATUS_ACCESS_DENIED",
            STATUS_OBJECT_NAME_NOT_FOUND => "STATUS_OBJECT_NAME_NOT_FOUND",
            STATUS_OBJECT_PATH_NOT_FOUND => "STATUS_OBJECT_PATH_NOT_FOUND",
            STATUS_INSUFFICIENT_RESOURCES => "STATUS_INSUFFICIENT_RESOURCES",
            STATUS_NAME_TOO_LONG => "STATUS_NAME_TOO_LONG",
            _ => return None,
        })
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "NtStatus({:#010x})", self.0 as u32),
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<NtStatus> for i32 {
    fn from(status: NtStatus) -> Self {
        status.0
    }
}

pub const STATUS_SUCCESS: NtStatus = NtStatus(0);
pub const STATUS_PENDING: NtStatus = NtStatus(0x0000_0103);
pub const STATUS_BUFFER_OVERFLOW: NtStatus = NtStatus(0x8000_0005_u32 as i32);
pub const STATUS_NO_MORE_FILES: NtStatus = NtStatus(0x8000_0006_u32 as i32);
pub const STATUS_NOT_IMPLEMENTED: NtStatus = NtStatus(0xC000_0002_u32 as i32);
pub const STATUS_INVALID_PARAMETER: NtStatus = NtStatus(0xC000_000D_u32 as i32);
pub const STATUS_NO_SUCH_FILE: NtStatus = NtStatus(0xC000_000F_u32 as i32);
pub const STATUS_NO_MEMORY: NtStatus = NtStatus(0xC000_0017_u32 as i32);
pub const STATUS_ACCESS_DENIED: NtStatus = NtStatus(0xC000_0022_u32 as i32);
pub const STATUS_OBJECT_NAME_NOT_FOUND: NtStatus = NtStatus(0xC000_0034_u32 as i32);
pub const STATUS_OBJECT_PATH_NOT_FOUND: NtStatus = NtStatus(0xC000_003A_u32 as i32);
pub const STATUS_INSUFFICIENT_RESOURCES: NtStatus = NtStatus(0xC000_009A_u32 as i32);
pub const STATUS_NAME_TOO_LONG: NtStatus = NtStatus(0xC000_0106_u32 as i32);
