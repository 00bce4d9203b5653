//! Mount Options
//!
//! Configuration an embedding process hands to `Mount::run`. Values are
//! validated once by `normalize`, before anything is sent to the driver;
//! out-of-range values are corrected where a safe default exists and
//! rejected otherwise.

use bitflags::bitflags;
use thiserror::Error;
use widestring::{U16CStr, U16CString};

/// Library version reported by this crate (1.4.0)
pub const DOKAN_VERSION: u16 = 140;

/// Oldest options version this crate still understands
pub const MINIMUM_COMPATIBLE_VERSION: u16 = 100;

/// Thread count used when the caller asks for 0
pub const DEFAULT_THREAD_COUNT: u16 = 5;

/// Hard cap on worker threads per mount
pub const MAX_THREADS: u16 = 15;

pub const DEFAULT_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_ALLOCATION_UNIT_SIZE: u32 = 512;

const MIN_UNIT_SIZE: u32 = 512;
const MAX_UNIT_SIZE: u32 = 65536;

bitflags! {
    /// DOKAN_OPTION_* flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        /// Verbose per-entry logging
        const DEBUG = 1;
        /// Debug output to stderr; implies DEBUG
        const STDERR = 2;
        const ALT_STREAM = 4;
        const WRITE_PROTECT = 8;
        /// Network drive; requires a drive letter mount point
        const NETWORK = 16;
        const REMOVABLE = 32;
        const MOUNT_MANAGER = 64;
        const CURRENT_SESSION = 128;
        const FILELOCK_USER_MODE = 256;
        const DISABLE_OPLOCKS = 512;
        const ENABLE_FCB_GARBAGE_COLLECTION = 1024;
        /// Match names case-sensitively
        const CASE_SENSITIVE = 2048;
        const ENABLE_UNMOUNT_NETWORK_DRIVE = 4096;
        const DISPATCH_DRIVER_LOGS = 8192;
        /// Open the notification handle after mounting
        const ENABLE_NOTIFICATION_API = 16384;
    }
}

/// Lifecycle failures, with the exit codes `DokanMain` returned
#[derive(Debug, Error)]
pub enum MountError {
    #[error("cannot open the driver: {0}")]
    DriverInstall(#[source] crate::io::device::DeviceError),
    #[error("driver refused to start the mount: {0}")]
    Start(String),
    #[error("mount failed: {0}")]
    Mount(String),
    #[error("options version {actual} is older than {minimum}")]
    Version { actual: u16, minimum: u16 },
}

impl MountError {
    /// Numeric code as returned by the C entry point
    pub fn code(&self) -> i32 {
        match self {
            Self::DriverInstall(_) => -3,
            Self::Start(_) => -4,
            Self::Mount(_) => -5,
            Self::Version { .. } => -7,
        }
    }
}

/// DOKAN_OPTIONS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub version: u16,
    pub thread_count: u16,
    pub flags: MountFlags,
    /// Drive letter (`M`, `M:`, `M:\`) or an empty NTFS folder
    pub mount_point: U16CString,
    /// UNC name for network drives; may be empty
    pub unc_name: U16CString,
    /// Milliseconds the driver waits for an answer before failing the IRP;
    /// 0 keeps the driver default
    pub timeout: u32,
    pub allocation_unit_size: u32,
    pub sector_size: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            version: DOKAN_VERSION,
            thread_count: 0,
            flags: MountFlags::empty(),
            mount_point: U16CString::default(),
            unc_name: U16CString::default(),
            timeout: 0,
            allocation_unit_size: DEFAULT_ALLOCATION_UNIT_SIZE,
            sector_size: DEFAULT_SECTOR_SIZE,
        }
    }
}

impl MountOptions {
    pub fn new(mount_point: &str) -> Self {
        Self {
            mount_point: U16CString::from_str_truncate(mount_point),
            ..Self::default()
        }
    }

    /// Apply defaults and caps; fails only on an unsupported version.
    pub fn normalize(&mut self) -> Result<(), MountError> {
        if self.flags.contains(MountFlags::STDERR) {
            self.flags |= MountFlags::DEBUG;
        }

        if self.flags.contains(MountFlags::NETWORK)
            && !is_mount_point_drive_letter(&self.mount_point)
        {
            log::warn!("network option requires a drive letter mount point; disabled");
            self.flags.remove(MountFlags::NETWORK);
        }

        if self.version < MINIMUM_COMPATIBLE_VERSION {
            return Err(MountError::Version {
                actual: self.version,
                minimum: MINIMUM_COMPATIBLE_VERSION,
            });
        }

        if !is_valid_unit_size(self.allocation_unit_size) || !is_valid_unit_size(self.sector_size) {
            log::warn!(
                "allocation unit {} / sector size {} out of range; using {}",
                self.allocation_unit_size,
                self.sector_size,
                DEFAULT_SECTOR_SIZE
            );
            self.allocation_unit_size = DEFAULT_ALLOCATION_UNIT_SIZE;
            self.sector_size = DEFAULT_SECTOR_SIZE;
        }

        if self.thread_count == 0 {
            self.thread_count = DEFAULT_THREAD_COUNT;
        } else if self.thread_count > MAX_THREADS {
            log::warn!("thread count {} capped at {}", self.thread_count, MAX_THREADS);
            self.thread_count = MAX_THREADS;
        }

        Ok(())
    }

    pub fn case_sensitive(&self) -> bool {
        self.flags.contains(MountFlags::CASE_SENSITIVE)
    }

    pub fn debug(&self) -> bool {
        self.flags.intersects(MountFlags::DEBUG | MountFlags::STDERR)
    }
}

fn is_valid_unit_size(size: u32) -> bool {
    (MIN_UNIT_SIZE..=MAX_UNIT_SIZE).contains(&size) && size.is_power_of_two()
}

/// `M`, `M:` or `M:\`
pub fn is_mount_point_drive_letter(mount_point: &U16CStr) -> bool {
    let units = mount_point.as_slice();
    match units.len() {
        1 => true,
        2 => units[1] == b':' as u16,
        3 => units[1] == b':' as u16 && units[2] == b'\\' as u16,
        _ => false,
    }
}
