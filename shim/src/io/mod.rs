//! I/O (io)
//!
//! The transport between the kernel driver and the embedding file system:
//!
//! - **IRP codes**: major functions carried in every request
//! - **Envelopes**: request decoding and response encoding
//! - **Devices**: handles and IOCTLs to the driver
//! - **Dispatch**: routing a request to its handler
//! - **Create**: kernel to Win32 create parameter translation
//!
//! # Request Flow
//!
//! 1. A worker waits on the volume device (FSCTL_EVENT_WAIT)
//! 2. The envelope is decoded into an `EventContext`
//! 3. The dispatcher pins the open handle and runs the handler
//! 4. The response goes back with FSCTL_EVENT_INFO
//! 5. The handle reference is dropped

pub mod irp;
pub mod event;
pub mod device;
pub mod dispatch;
pub mod create;
#[cfg(windows)]
pub mod win32;

pub use irp::IrpMajorFunction;

pub use event::{
    DecodeError,
    EventContext,
    EventInformation,
    Operation,
};

pub use device::{
    DeviceAccess,
    DeviceError,
    DeviceIo,
    DeviceOpener,
};

pub use dispatch::Dispatcher;
pub use create::{map_kernel_to_user_create_file_flags, UserCreateFileFlags};

#[cfg(windows)]
pub use win32::{Win32Device, Win32DeviceOpener};
