//! Driver Control Plane
//!
//! Requests that manage mounts rather than serve file I/O: the start
//! handshake, release, mount point listing, keepalive and change
//! notification. Everything here is one IOCTL over a short-lived handle
//! unless a device is passed in.
//!
//! # IOCTL Codes
//! `CTL_CODE(FILE_DEVICE_UNKNOWN, function, METHOD_BUFFERED, FILE_ANY_ACCESS)`
//!
//! | Code | Function |
//! |------|----------|
//! | FSCTL_SET_DEBUG_MODE | 0x801 |
//! | FSCTL_EVENT_WAIT | 0x802 |
//! | FSCTL_EVENT_INFO | 0x803 |
//! | FSCTL_EVENT_RELEASE | 0x804 |
//! | FSCTL_EVENT_START | 0x805 |
//! | FSCTL_KEEPALIVE | 0x809 |
//! | FSCTL_EVENT_MOUNTPOINT_LIST | 0x80D |
//! | FSCTL_MOUNTPOINT_CLEANUP | 0x80F |
//! | FSCTL_ACTIVATE_KEEPALIVE | 0x810 |
//! | FSCTL_NOTIFY_PATH | 0x811 |

use core::mem::size_of;

use bitflags::bitflags;
use thiserror::Error;
use widestring::{u16cstr, U16CStr, U16CString};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::io::device::{DeviceError, DeviceIo, DeviceOpener};
use crate::mount::options::{MountError, MountFlags, MountOptions};

const FILE_DEVICE_UNKNOWN: u32 = 0x0000_0022;

/// CTL_CODE with METHOD_BUFFERED and FILE_ANY_ACCESS
pub const fn ctl_code(function: u32) -> u32 {
    (FILE_DEVICE_UNKNOWN << 16) | (function << 2)
}

pub const FSCTL_SET_DEBUG_MODE: u32 = ctl_code(0x801);
pub const FSCTL_EVENT_WAIT: u32 = ctl_code(0x802);
pub const FSCTL_EVENT_INFO: u32 = ctl_code(0x803);
pub const FSCTL_EVENT_RELEASE: u32 = ctl_code(0x804);
pub const FSCTL_EVENT_START: u32 = ctl_code(0x805);
pub const FSCTL_KEEPALIVE: u32 = ctl_code(0x809);
pub const FSCTL_EVENT_MOUNTPOINT_LIST: u32 = ctl_code(0x80D);
pub const FSCTL_MOUNTPOINT_CLEANUP: u32 = ctl_code(0x80F);
pub const FSCTL_ACTIVATE_KEEPALIVE: u32 = ctl_code(0x810);
pub const FSCTL_NOTIFY_PATH: u32 = ctl_code(0x811);

/// Control device every mount starts from
pub const DOKAN_GLOBAL_DEVICE_NAME: &U16CStr = u16cstr!("\\\\.\\Dokan_1");

/// Opened under the volume to arm unmount-on-process-exit
pub const DOKAN_KEEPALIVE_FILE_NAME: &U16CStr = u16cstr!("\\__drive_fs_keepalive");

/// Opened under the volume to carry FSCTL_NOTIFY_PATH
pub const DOKAN_NOTIFICATION_FILE_NAME: &U16CStr = u16cstr!("\\__drive_fs_notification");

/// Protocol version sent in EVENT_START
pub const DOKAN_DRIVER_VERSION: u32 = 0x0000_0190;

/// Characters in a mount point buffer
pub const MAX_PATH: usize = 260;

/// Characters in UNC and device name buffers
pub const DEVICE_NAME_LENGTH: usize = 64;

/// EVENT_DRIVER_INFO.Status
pub mod driver_status {
    pub const DOKAN_MOUNTED: u32 = 1;
    pub const DOKAN_USED: u32 = 2;
    pub const DOKAN_START_FAILED: u32 = 3;
}

/// EVENT_START.DeviceType
pub mod device_type {
    pub const DOKAN_DISK_FILE_SYSTEM: u32 = 0;
    pub const DOKAN_NETWORK_FILE_SYSTEM: u32 = 1;
}

bitflags! {
    /// EVENT_START.Flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DriverEventFlags: u32 {
        const ALTERNATIVE_STREAM_ON = 1;
        const WRITE_PROTECT = 2;
        const REMOVABLE = 4;
        const MOUNT_MANAGER = 8;
        const CURRENT_SESSION = 16;
        const FILELOCK_USER_MODE = 32;
        const DISABLE_OPLOCKS = 64;
        const ENABLE_FCB_GC = 128;
        const CASE_SENSITIVE = 256;
        const ENABLE_NETWORK_UNMOUNT = 512;
        const DISPATCH_DRIVER_LOGS = 1024;
    }
}

impl From<MountFlags> for DriverEventFlags {
    fn from(flags: MountFlags) -> Self {
        const MAP: [(MountFlags, DriverEventFlags); 11] = [
            (MountFlags::ALT_STREAM, DriverEventFlags::ALTERNATIVE_STREAM_ON),
            (MountFlags::WRITE_PROTECT, DriverEventFlags::WRITE_PROTECT),
            (MountFlags::REMOVABLE, DriverEventFlags::REMOVABLE),
            (MountFlags::MOUNT_MANAGER, DriverEventFlags::MOUNT_MANAGER),
            (MountFlags::CURRENT_SESSION, DriverEventFlags::CURRENT_SESSION),
            (MountFlags::FILELOCK_USER_MODE, DriverEventFlags::FILELOCK_USER_MODE),
            (MountFlags::DISABLE_OPLOCKS, DriverEventFlags::DISABLE_OPLOCKS),
            (MountFlags::ENABLE_FCB_GARBAGE_COLLECTION, DriverEventFlags::ENABLE_FCB_GC),
            (MountFlags::CASE_SENSITIVE, DriverEventFlags::CASE_SENSITIVE),
            (MountFlags::ENABLE_UNMOUNT_NETWORK_DRIVE, DriverEventFlags::ENABLE_NETWORK_UNMOUNT),
            (MountFlags::DISPATCH_DRIVER_LOGS, DriverEventFlags::DISPATCH_DRIVER_LOGS),
        ];

        MAP.iter()
            .filter(|(option, _)| flags.contains(*option))
            .fold(DriverEventFlags::empty(), |acc, (_, event)| acc | *event)
    }
}

/// FILE_NOTIFY_CHANGE_*
pub mod notify_filter {
    pub const FILE_NOTIFY_CHANGE_FILE_NAME: u32 = 0x0000_0001;
    pub const FILE_NOTIFY_CHANGE_DIR_NAME: u32 = 0x0000_0002;
    pub const FILE_NOTIFY_CHANGE_ATTRIBUTES: u32 = 0x0000_0004;
}

/// FILE_ACTION_*
pub mod notify_action {
    pub const FILE_ACTION_ADDED: u32 = 1;
    pub const FILE_ACTION_REMOVED: u32 = 2;
    pub const FILE_ACTION_MODIFIED: u32 = 3;
    pub const FILE_ACTION_RENAMED_OLD_NAME: u32 = 4;
    pub const FILE_ACTION_RENAMED_NEW_NAME: u32 = 5;
}

/// Control request failures that are not plain device errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("path {0:?} is not usable here")]
    InvalidPath(String),
    #[error("notification handle is not open")]
    NotificationUnavailable,
}

// ============================================================================
// Wire structures
// ============================================================================

/// EVENT_START
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct EventStart {
    pub user_version: U32,
    pub device_type: U32,
    pub flags: U32,
    pub mount_point: [U16; MAX_PATH],
    pub unc_name: [U16; DEVICE_NAME_LENGTH],
    pub irp_timeout: U32,
}

/// EVENT_DRIVER_INFO
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct EventDriverInfo {
    pub driver_version: U32,
    pub status: U32,
    pub device_number: U32,
    pub mount_id: U32,
    pub device_name: [U16; DEVICE_NAME_LENGTH],
}

/// DOKAN_CONTROL, one record of FSCTL_EVENT_MOUNTPOINT_LIST
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DokanControl {
    pub control_type: U32,
    pub mount_point: [U16; MAX_PATH],
    pub unc_name: [U16; DEVICE_NAME_LENGTH],
    pub device_name: [U16; DEVICE_NAME_LENGTH],
    pub reserved0: [u8; 4],
    pub device_object: U64,
    pub session_id: U32,
    pub reserved1: [u8; 4],
}

/// DOKAN_UNICODE_STRING_INTERMEDIATE header; MAX_PATH characters follow
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct UnicodeStringIntermediate {
    length: U16,
    maximum_length: U16,
}

/// `sizeof(DOKAN_UNICODE_STRING_INTERMEDIATE)`, one inline WCHAR plus padding
const UNICODE_STRING_INTERMEDIATE_SIZE: usize = 6;

/// DOKAN_NOTIFY_PATH_INTERMEDIATE header; the path follows
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct NotifyPathIntermediate {
    completion_filter: U32,
    action: U32,
    length: U16,
}

/// `sizeof(DOKAN_NOTIFY_PATH_INTERMEDIATE)`
const NOTIFY_PATH_INTERMEDIATE_SIZE: usize = 12;

/// Copy `source` into a fixed WCHAR array, always leaving a terminator
fn copy_wide(destination: &mut [U16], source: &U16CStr) {
    let capacity = destination.len().saturating_sub(1);
    for (slot, unit) in destination
        .iter_mut()
        .zip(source.as_slice().iter().take(capacity))
    {
        *slot = U16::new(*unit);
    }
}

/// Read a fixed WCHAR array up to its terminator
fn read_wide(source: &[U16]) -> U16CString {
    let units: Vec<u16> = source
        .iter()
        .map(|unit| unit.get())
        .take_while(|&unit| unit != 0)
        .collect();
    U16CString::from_vec_truncate(units)
}

fn concat(parts: &[&U16CStr]) -> U16CString {
    let units: Vec<u16> = parts
        .iter()
        .flat_map(|part| part.as_slice().iter().copied())
        .collect();
    U16CString::from_vec_truncate(units)
}

/// `\\.` + device name, the path worker threads open
pub fn raw_device_name(device_name: &U16CStr) -> U16CString {
    concat(&[u16cstr!("\\\\."), device_name])
}

/// `\\?` + device name + `file`, a file inside the mounted volume
pub fn volume_file_path(device_name: &U16CStr, file: &U16CStr) -> U16CString {
    concat(&[u16cstr!("\\\\?"), device_name, file])
}

// ============================================================================
// Start handshake
// ============================================================================

/// What the driver assigned to a new mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub driver_version: u32,
    pub device_number: u32,
    pub mount_id: u32,
    pub device_name: U16CString,
}

/// Build EVENT_START for `options`.
pub fn event_start(options: &MountOptions) -> EventStart {
    let mut start = EventStart::new_zeroed();
    start.user_version = U32::new(DOKAN_DRIVER_VERSION);
    start.device_type = U32::new(if options.flags.contains(MountFlags::NETWORK) {
        device_type::DOKAN_NETWORK_FILE_SYSTEM
    } else {
        device_type::DOKAN_DISK_FILE_SYSTEM
    });
    start.flags = U32::new(DriverEventFlags::from(options.flags).bits());
    copy_wide(&mut start.mount_point, &options.mount_point);
    copy_wide(&mut start.unc_name, &options.unc_name);
    start.irp_timeout = U32::new(options.timeout);
    start
}

/// FSCTL_EVENT_START: ask the driver for a new volume device.
pub fn start<O: DeviceOpener>(opener: &O, options: &MountOptions) -> Result<DriverInfo, MountError> {
    let request = event_start(options);
    let mut reply = EventDriverInfo::new_zeroed();

    opener
        .send(
            DOKAN_GLOBAL_DEVICE_NAME,
            FSCTL_EVENT_START,
            request.as_bytes(),
            reply.as_mut_bytes(),
        )
        .map_err(|error| MountError::Start(error.to_string()))?;

    match reply.status.get() {
        driver_status::DOKAN_MOUNTED => {
            let info = DriverInfo {
                driver_version: reply.driver_version.get(),
                device_number: reply.device_number.get(),
                mount_id: reply.mount_id.get(),
                device_name: read_wide(&reply.device_name),
            };
            log::debug!(
                "driver started mount {} on {}",
                info.mount_id,
                info.device_name.display()
            );
            Ok(info)
        }
        driver_status::DOKAN_START_FAILED => {
            let driver_version = reply.driver_version.get();
            if driver_version != DOKAN_DRIVER_VERSION {
                Err(MountError::Start(format!(
                    "driver version mismatch, driver {:#x}, library {:#x}",
                    driver_version, DOKAN_DRIVER_VERSION
                )))
            } else {
                Err(MountError::Start("driver start error".into()))
            }
        }
        status => Err(MountError::Start(format!("unexpected driver status {}", status))),
    }
}

// ============================================================================
// Release
// ============================================================================

/// FSCTL_EVENT_RELEASE on a volume device: fail pending waits so its
/// worker threads exit.
pub fn send_release<O: DeviceOpener>(opener: &O, device_name: &U16CStr) -> Result<(), DeviceError> {
    log::debug!("send release to {}", device_name.display());
    opener
        .send(&raw_device_name(device_name), FSCTL_EVENT_RELEASE, &[], &mut [])
        .map(|_| ())
}

/// FSCTL_EVENT_RELEASE on the global device, naming the mount point.
pub fn send_global_release<O: DeviceOpener>(
    opener: &O,
    mount_point: &U16CStr,
) -> Result<(), ControlError> {
    let units = mount_point.as_slice();
    if units.is_empty() || units.len() > MAX_PATH {
        return Err(ControlError::InvalidPath(mount_point.to_string_lossy()));
    }

    let header = UnicodeStringIntermediate {
        length: U16::new((units.len() * 2) as u16),
        maximum_length: U16::new((MAX_PATH * 2) as u16),
    };
    let mut input = vec![0u8; UNICODE_STRING_INTERMEDIATE_SIZE + MAX_PATH * 2];
    input[..size_of::<UnicodeStringIntermediate>()].copy_from_slice(header.as_bytes());
    write_units(&mut input[size_of::<UnicodeStringIntermediate>()..], units);

    log::debug!("send global release for {}", mount_point.display());
    opener.send(DOKAN_GLOBAL_DEVICE_NAME, FSCTL_EVENT_RELEASE, &input, &mut [])?;
    Ok(())
}

fn write_units(destination: &mut [u8], units: &[u16]) {
    for (chunk, unit) in destination.chunks_exact_mut(2).zip(units) {
        chunk.copy_from_slice(&unit.to_le_bytes());
    }
}

// ============================================================================
// Global queries
// ============================================================================

/// One mounted volume as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    pub control_type: u32,
    pub mount_point: U16CString,
    pub unc_name: U16CString,
    pub device_name: U16CString,
    pub device_object: u64,
    pub session_id: u32,
}

impl From<&DokanControl> for MountPointInfo {
    fn from(control: &DokanControl) -> Self {
        Self {
            control_type: control.control_type.get(),
            mount_point: read_wide(&control.mount_point),
            unc_name: read_wide(&control.unc_name),
            device_name: read_wide(&control.device_name),
            device_object: control.device_object.get(),
            session_id: control.session_id.get(),
        }
    }
}

/// Records requested by the first FSCTL_EVENT_MOUNTPOINT_LIST attempt
const INITIAL_MOUNT_POINT_SLOTS: usize = 32;

/// FSCTL_EVENT_MOUNTPOINT_LIST: every volume the driver knows.
///
/// With `unc_only`, volumes without a UNC name are left out.
pub fn mount_point_list<O: DeviceOpener>(
    opener: &O,
    unc_only: bool,
) -> Result<Vec<MountPointInfo>, DeviceError> {
    let mut buffer_length = INITIAL_MOUNT_POINT_SLOTS * size_of::<DokanControl>();

    let (buffer, returned) = loop {
        let mut buffer = vec![0u8; buffer_length];
        match opener.send(
            DOKAN_GLOBAL_DEVICE_NAME,
            FSCTL_EVENT_MOUNTPOINT_LIST,
            &[],
            &mut buffer,
        ) {
            Ok(returned) => break (buffer, returned.min(buffer_length)),
            Err(error) if error.is_more_data() => buffer_length *= 2,
            Err(error) => return Err(error),
        }
    };

    let records = &buffer[..returned - returned % size_of::<DokanControl>()];
    let list = <[DokanControl]>::ref_from_bytes(records)
        .map(|controls| {
            controls
                .iter()
                .map(MountPointInfo::from)
                .filter(|info| !unc_only || !info.unc_name.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Ok(list)
}

/// FSCTL_SET_DEBUG_MODE
pub fn set_debug_mode<O: DeviceOpener>(opener: &O, mode: u32) -> Result<(), DeviceError> {
    opener
        .send(
            DOKAN_GLOBAL_DEVICE_NAME,
            FSCTL_SET_DEBUG_MODE,
            &mode.to_le_bytes(),
            &mut [],
        )
        .map(|_| ())
}

/// FSCTL_MOUNTPOINT_CLEANUP: drop mount points left by dead processes.
pub fn mount_points_cleanup<O: DeviceOpener>(opener: &O) -> Result<(), DeviceError> {
    opener
        .send(DOKAN_GLOBAL_DEVICE_NAME, FSCTL_MOUNTPOINT_CLEANUP, &[], &mut [])
        .map(|_| ())
}

/// FSCTL_ACTIVATE_KEEPALIVE on an open keepalive file
pub fn activate_keepalive<D: DeviceIo + ?Sized>(keepalive: &D) -> Result<(), DeviceError> {
    keepalive
        .device_io_control(FSCTL_ACTIVATE_KEEPALIVE, &[], &mut [])
        .map(|_| ())
}

// ============================================================================
// Change notification
// ============================================================================

/// Drive letter and colon stripped from notification paths
const DRIVE_PREFIX_LENGTH: usize = 2;

/// FSCTL_NOTIFY_PATH: report a change under the mount.
///
/// `path` is a full path such as `M:\dir\file`; the first two characters
/// are dropped before sending.
pub fn notify_path<D: DeviceIo + ?Sized>(
    notification: &D,
    path: &U16CStr,
    completion_filter: u32,
    action: u32,
) -> Result<(), ControlError> {
    let units = path.as_slice();
    if units.len() <= DRIVE_PREFIX_LENGTH {
        return Err(ControlError::InvalidPath(path.to_string_lossy()));
    }
    let relative = &units[DRIVE_PREFIX_LENGTH..];
    let length = u16::try_from(relative.len() * 2)
        .map_err(|_| ControlError::InvalidPath(path.to_string_lossy()))?;

    let header = NotifyPathIntermediate {
        completion_filter: U32::new(completion_filter),
        action: U32::new(action),
        length: U16::new(length),
    };
    let mut input = vec![0u8; NOTIFY_PATH_INTERMEDIATE_SIZE + relative.len() * 2];
    input[..size_of::<NotifyPathIntermediate>()].copy_from_slice(header.as_bytes());
    write_units(&mut input[size_of::<NotifyPathIntermediate>()..], relative);

    notification
        .device_io_control(FSCTL_NOTIFY_PATH, &input, &mut [])
        .map_err(|error| {
            log::debug!("notify path {} failed: {}", path.display(), error);
            ControlError::from(error)
        })?;
    Ok(())
}

fn name_filter(is_directory: bool) -> u32 {
    if is_directory {
        notify_filter::FILE_NOTIFY_CHANGE_DIR_NAME
    } else {
        notify_filter::FILE_NOTIFY_CHANGE_FILE_NAME
    }
}

pub fn notify_create<D: DeviceIo + ?Sized>(
    notification: &D,
    path: &U16CStr,
    is_directory: bool,
) -> Result<(), ControlError> {
    notify_path(
        notification,
        path,
        name_filter(is_directory),
        notify_action::FILE_ACTION_ADDED,
    )
}

pub fn notify_delete<D: DeviceIo + ?Sized>(
    notification: &D,
    path: &U16CStr,
    is_directory: bool,
) -> Result<(), ControlError> {
    notify_path(
        notification,
        path,
        name_filter(is_directory),
        notify_action::FILE_ACTION_REMOVED,
    )
}

/// Attributes, size or times changed
pub fn notify_update<D: DeviceIo + ?Sized>(notification: &D, path: &U16CStr) -> Result<(), ControlError> {
    notify_path(
        notification,
        path,
        notify_filter::FILE_NOTIFY_CHANGE_ATTRIBUTES,
        notify_action::FILE_ACTION_MODIFIED,
    )
}

/// Extended attributes changed
pub fn notify_xattr_update<D: DeviceIo + ?Sized>(
    notification: &D,
    path: &U16CStr,
) -> Result<(), ControlError> {
    notify_update(notification, path)
}

/// A rename inside one directory is reported as an old/new name pair;
/// across directories as a removal and an addition. Both halves are
/// sent even if the first fails.
pub fn notify_rename<D: DeviceIo + ?Sized>(
    notification: &D,
    old_path: &U16CStr,
    new_path: &U16CStr,
    is_directory: bool,
    is_in_same_directory: bool,
) -> Result<(), ControlError> {
    let (old_action, new_action) = if is_in_same_directory {
        (
            notify_action::FILE_ACTION_RENAMED_OLD_NAME,
            notify_action::FILE_ACTION_RENAMED_NEW_NAME,
        )
    } else {
        (
            notify_action::FILE_ACTION_REMOVED,
            notify_action::FILE_ACTION_ADDED,
        )
    };

    let filter = name_filter(is_directory);
    let old = notify_path(notification, old_path, filter, old_action);
    let new = notify_path(notification, new_path, filter, new_action);
    old.and(new)
}
