//! Create Parameter Translation
//!
//! IRP_MJ_CREATE carries NT-style parameters (`ZwCreateFile`). File systems
//! that forward opens to `CreateFileW` need the Win32 equivalents; this is
//! the pure translation between the two.

/// Kernel access rights
pub mod file_access {
    pub const FILE_ALL_ACCESS: u32 = 0x001F_01FF;
    pub const FILE_GENERIC_READ: u32 = 0x0012_0089;
    pub const FILE_GENERIC_WRITE: u32 = 0x0012_0116;
    pub const FILE_GENERIC_EXECUTE: u32 = 0x0012_00A0;

    pub const GENERIC_READ: u32 = 0x8000_0000;
    pub const GENERIC_WRITE: u32 = 0x4000_0000;
    pub const GENERIC_EXECUTE: u32 = 0x2000_0000;
    pub const GENERIC_ALL: u32 = 0x1000_0000;
}

/// Kernel CreateOptions bits
pub mod create_options {
    pub const FILE_WRITE_THROUGH: u32 = 0x0000_0002;
    pub const FILE_SEQUENTIAL_ONLY: u32 = 0x0000_0004;
    pub const FILE_NO_INTERMEDIATE_BUFFERING: u32 = 0x0000_0008;
    pub const FILE_RANDOM_ACCESS: u32 = 0x0000_0800;
    pub const FILE_DELETE_ON_CLOSE: u32 = 0x0000_1000;
    pub const FILE_OPEN_FOR_BACKUP_INTENT: u32 = 0x0000_4000;
    pub const FILE_SESSION_AWARE: u32 = 0x0004_0000;
    pub const FILE_OPEN_REPARSE_POINT: u32 = 0x0020_0000;
}

/// Win32 FILE_FLAG_* bits
pub mod file_flags {
    pub const FILE_FLAG_WRITE_THROUGH: u32 = 0x8000_0000;
    pub const FILE_FLAG_NO_BUFFERING: u32 = 0x2000_0000;
    pub const FILE_FLAG_RANDOM_ACCESS: u32 = 0x1000_0000;
    pub const FILE_FLAG_SEQUENTIAL_SCAN: u32 = 0x0800_0000;
    pub const FILE_FLAG_DELETE_ON_CLOSE: u32 = 0x0400_0000;
    pub const FILE_FLAG_BACKUP_SEMANTICS: u32 = 0x0200_0000;
    pub const FILE_FLAG_SESSION_AWARE: u32 = 0x0080_0000;
    pub const FILE_FLAG_OPEN_REPARSE_POINT: u32 = 0x0020_0000;
}

/// Kernel CreateDisposition values
pub mod create_disposition {
    pub const FILE_SUPERSEDE: u32 = 0;
    pub const FILE_OPEN: u32 = 1;
    pub const FILE_CREATE: u32 = 2;
    pub const FILE_OPEN_IF: u32 = 3;
    pub const FILE_OVERWRITE: u32 = 4;
    pub const FILE_OVERWRITE_IF: u32 = 5;
}

/// Win32 dwCreationDisposition values
pub mod creation_disposition {
    pub const CREATE_NEW: u32 = 1;
    pub const CREATE_ALWAYS: u32 = 2;
    pub const OPEN_EXISTING: u32 = 3;
    pub const OPEN_ALWAYS: u32 = 4;
    pub const TRUNCATE_EXISTING: u32 = 5;
}

/// `CreateFileW` arguments derived from a kernel create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserCreateFileFlags {
    pub desired_access: u32,
    pub flags_and_attributes: u32,
    /// 0 for an unknown kernel disposition
    pub creation_disposition: u32,
}

const OPTION_TO_FLAG: [(u32, u32); 8] = [
    (create_options::FILE_WRITE_THROUGH, file_flags::FILE_FLAG_WRITE_THROUGH),
    (create_options::FILE_SEQUENTIAL_ONLY, file_flags::FILE_FLAG_SEQUENTIAL_SCAN),
    (create_options::FILE_RANDOM_ACCESS, file_flags::FILE_FLAG_RANDOM_ACCESS),
    (create_options::FILE_NO_INTERMEDIATE_BUFFERING, file_flags::FILE_FLAG_NO_BUFFERING),
    (create_options::FILE_OPEN_REPARSE_POINT, file_flags::FILE_FLAG_OPEN_REPARSE_POINT),
    (create_options::FILE_DELETE_ON_CLOSE, file_flags::FILE_FLAG_DELETE_ON_CLOSE),
    (create_options::FILE_OPEN_FOR_BACKUP_INTENT, file_flags::FILE_FLAG_BACKUP_SEMANTICS),
    (create_options::FILE_SESSION_AWARE, file_flags::FILE_FLAG_SESSION_AWARE),
];

const SPECIFIC_TO_GENERIC: [(u32, u32); 4] = [
    (file_access::FILE_GENERIC_READ, file_access::GENERIC_READ),
    (file_access::FILE_GENERIC_WRITE, file_access::GENERIC_WRITE),
    (file_access::FILE_GENERIC_EXECUTE, file_access::GENERIC_EXECUTE),
    (file_access::FILE_ALL_ACCESS, file_access::GENERIC_ALL),
];

/// Translate kernel create parameters to `CreateFileW` arguments.
///
/// File attributes pass through and CreateOptions bits become FILE_FLAG_*
/// bits. Each complete specific-rights set in `desired_access` is replaced
/// by its GENERIC_* right.
pub fn map_kernel_to_user_create_file_flags(
    desired_access: u32,
    file_attributes: u32,
    create_options: u32,
    create_disposition: u32,
) -> UserCreateFileFlags {
    let flags_and_attributes = OPTION_TO_FLAG
        .iter()
        .filter(|(option, _)| create_options & option == *option)
        .fold(file_attributes, |acc, (_, flag)| acc | flag);

    let creation_disposition = match create_disposition {
        create_disposition::FILE_CREATE => creation_disposition::CREATE_NEW,
        create_disposition::FILE_OPEN => creation_disposition::OPEN_EXISTING,
        create_disposition::FILE_OPEN_IF => creation_disposition::OPEN_ALWAYS,
        create_disposition::FILE_OVERWRITE => creation_disposition::TRUNCATE_EXISTING,
        create_disposition::FILE_SUPERSEDE | create_disposition::FILE_OVERWRITE_IF => {
            creation_disposition::CREATE_ALWAYS
        }
        _ => 0,
    };

    // Sets are tested against the original mask, then all matched sets
    // are cleared together
    let matched: Vec<&(u32, u32)> = SPECIFIC_TO_GENERIC
        .iter()
        .filter(|(specific, _)| desired_access & specific == *specific)
        .collect();
    let with_generic = matched
        .iter()
        .fold(desired_access, |acc, (_, generic)| acc | generic);
    let desired_access = matched
        .iter()
        .fold(with_generic, |acc, (specific, _)| acc & !specific);

    UserCreateFileFlags {
        desired_access,
        flags_and_attributes,
        creation_disposition,
    }
}
