//! Runtime Library (rtl)
//!
//! Common values shared by every dispatch path:
//!
//! - **Status**: NTSTATUS codes returned to the kernel
//! - **Time**: FILETIME conversions for directory records

pub mod status;
pub mod time;

pub use status::NtStatus;
