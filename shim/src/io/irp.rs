//! I/O Request Packet (IRP) codes
//!
//! The kernel driver forwards each IRP it cannot complete on its own as a
//! request envelope. The envelope keeps the IRP's major and minor function
//! codes and the stack location flags, so the codes below must match the
//! NT values bit for bit.

use bitflags::bitflags;

/// Major function codes (IRP types)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IrpMajorFunction {
    Create = 0,
    CreateNamedPipe = 1,
    Close = 2,
    Read = 3,
    Write = 4,
    QueryInformation = 5,
    SetInformation = 6,
    QueryEa = 7,
    SetEa = 8,
    FlushBuffers = 9,
    QueryVolumeInformation = 10,
    SetVolumeInformation = 11,
    DirectoryControl = 12,
    FileSystemControl = 13,
    DeviceControl = 14,
    InternalDeviceControl = 15,
    Shutdown = 16,
    LockControl = 17,
    Cleanup = 18,
    CreateMailslot = 19,
    QuerySecurity = 20,
    SetSecurity = 21,
    Power = 22,
    SystemControl = 23,
    DeviceChange = 24,
    QueryQuota = 25,
    SetQuota = 26,
    Pnp = 27,
}

impl TryFrom<u8> for IrpMajorFunction {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Create,
            1 => Self::CreateNamedPipe,
            2 => Self::Close,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::QueryInformation,
            6 => Self::SetInformation,
            7 => Self::QueryEa,
            8 => Self::SetEa,
            9 => Self::FlushBuffers,
            10 => Self::QueryVolumeInformation,
            11 => Self::SetVolumeInformation,
            12 => Self::DirectoryControl,
            13 => Self::FileSystemControl,
            14 => Self::DeviceControl,
            15 => Self::InternalDeviceControl,
            16 => Self::Shutdown,
            17 => Self::LockControl,
            18 => Self::Cleanup,
            19 => Self::CreateMailslot,
            20 => Self::QuerySecurity,
            21 => Self::SetSecurity,
            22 => Self::Power,
            23 => Self::SystemControl,
            24 => Self::DeviceChange,
            25 => Self::QueryQuota,
            26 => Self::SetQuota,
            27 => Self::Pnp,
            other => return Err(other),
        })
    }
}

/// Minor function codes for IRP_MJ_DIRECTORY_CONTROL
pub mod directory_minor {
    pub const IRP_MN_QUERY_DIRECTORY: u8 = 0x01;
    pub const IRP_MN_NOTIFY_CHANGE_DIRECTORY: u8 = 0x02;
}

/// Stack location flags carried in the envelope's `Flags` field
pub mod sl_flags {
    /// Return only the first matching entry
    pub const SL_RETURN_SINGLE_ENTRY: u32 = 0x02;
}

bitflags! {
    /// Per-open flags the driver tracks for a file object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u32 {
        const DELETE_ON_CLOSE = 1;
        const PAGING_IO = 2;
        const SYNCHRONOUS_IO = 4;
        const WRITE_TO_END_OF_FILE = 8;
        const NOCACHE = 16;
    }
}
