//! Directory Enumeration
//!
//! Serves IRP_MJ_DIRECTORY_CONTROL / IRP_MN_QUERY_DIRECTORY requests.
//!
//! # Flow
//! ```text
//! request ──► index 0? ──yes──► drop cached listing
//!                │
//!                ▼
//!         listing cached? ──no──► find_files_with_pattern
//!                │                  └─ NOT_IMPLEMENTED ──► find_files
//!                │                 synthesize "." and ".."
//!                ▼
//!         walk listing from the continuation index,
//!         match, pack, chain ──► response
//! ```
//!
//! # Continuation Index
//! The kernel passes back the index returned by the previous call. Only
//! entries that match the pattern are numbered, so record `FileIndex`
//! values and the continuation index share one numbering: the record for
//! the n-th matching entry (0-based) carries `FileIndex` n + 1, and a
//! response that ends after it returns n + 1.
//!
//! # Outcomes
//! - `STATUS_SUCCESS`: at least one record packed
//! - `STATUS_BUFFER_OVERFLOW`: the first candidate did not fit
//! - `STATUS_NO_SUCH_FILE`: nothing to return for a scan from index 0
//! - `STATUS_NO_MORE_FILES`: nothing left past a non-zero index
//!
//! Every outcome other than success drops the cached listing, so the next
//! call starts from a fresh `find_files`.

use std::sync::Arc;

use widestring::{u16cstr, U16CStr};

use crate::fs::dirinfo::{fill_directory_information, set_next_entry_offset, FileInformationClass};
use crate::fs::handle::{DirectoryListing, OpenHandleTable};
use crate::fs::operations::{
    FileAttributes, FileInfo, FileSystemOperations, FillDataError, FillFindData, FindData,
};
use crate::fsrtl::name::fsrtl_is_name_in_expression;
use crate::io::event::{DirectoryRequest, EventContext, EventInformation};
use crate::rtl::status::{
    NtStatus, STATUS_BUFFER_OVERFLOW, STATUS_NOT_IMPLEMENTED, STATUS_NO_MORE_FILES,
    STATUS_NO_SUCH_FILE, STATUS_SUCCESS,
};
use crate::rtl::time::rtl_get_system_time;

const MATCH_ALL: &U16CStr = u16cstr!("*");
const ROOT: &U16CStr = u16cstr!("\\");
const CURRENT_DIRECTORY: &U16CStr = u16cstr!(".");
const PARENT_DIRECTORY: &U16CStr = u16cstr!("..");

/// Answer one directory query into `response`.
///
/// `class` has already been validated, and `response` was sized for
/// `directory.buffer_length` payload bytes.
pub fn dispatch_directory_information(
    request: &EventContext,
    directory: &DirectoryRequest,
    class: FileInformationClass,
    handles: &OpenHandleTable,
    operations: &dyn FileSystemOperations,
    info: &mut FileInfo<'_>,
    response: &mut EventInformation,
) {
    let context = request.context;
    let file_index = directory.file_index;
    let pattern = directory.search_pattern.as_deref();

    if file_index == 0 {
        handles.clear_listing(context);
    }

    let listing = match handles.listing(context) {
        Some(listing) if !listing.is_empty() => listing,
        _ => match populate(directory, operations, info) {
            Ok(listing) => {
                handles.set_listing(context, Some(listing.clone()));
                listing
            }
            Err(status) => {
                log::debug!(
                    "find_files {} failed: {}",
                    directory.directory_name.display(),
                    status
                );
                handles.clear_listing(context);
                finish_empty(response, file_index, false);
                return;
            }
        },
    };

    let outcome = match_files(request, directory, class, &listing, pattern, info, response);
    match outcome {
        MatchOutcome::Packed { next_index } => {
            log::debug!(
                "{}: index {} -> {}, {} bytes",
                directory.directory_name.display(),
                file_index,
                next_index,
                response.buffer_length()
            );
            response.set_status(STATUS_SUCCESS);
            response.set_directory_index(next_index);
        }
        MatchOutcome::Nothing { overflow } => {
            handles.clear_listing(context);
            finish_empty(response, file_index, overflow);
        }
    }
}

/// Status for a response that carries no records
fn finish_empty(response: &mut EventInformation, file_index: u32, overflow: bool) {
    let status = if overflow {
        STATUS_BUFFER_OVERFLOW
    } else if file_index == 0 {
        STATUS_NO_SUCH_FILE
    } else {
        STATUS_NO_MORE_FILES
    };
    log::debug!("directory query at index {}: {}", file_index, status);

    response.set_status(status);
    response.set_buffer_length(0);
    response.set_directory_index(file_index);
}

/// Run the file system's enumeration once and build the cached listing.
fn populate(
    directory: &DirectoryRequest,
    operations: &dyn FileSystemOperations,
    info: &mut FileInfo<'_>,
) -> Result<Arc<DirectoryListing>, NtStatus> {
    let path = directory.directory_name.as_ucstr();
    let pattern = directory.search_pattern.as_deref();

    let with_pattern = collect_entries(|emit| {
        operations.find_files_with_pattern(path, pattern.unwrap_or(MATCH_ALL), emit, info)
    });
    let (mut entries, prefiltered) = match with_pattern {
        Err(STATUS_NOT_IMPLEMENTED) => {
            let entries = collect_entries(|emit| operations.find_files(path, emit, info))?;
            (entries, false)
        }
        other => (other?, true),
    };

    if should_synthesize_dots(path, pattern) {
        add_missing_current_and_parent(&mut entries)?;
    }

    Ok(Arc::new(DirectoryListing::new(entries, prefiltered)))
}

fn collect_entries(
    enumerate: impl FnOnce(&mut FillFindData<'_>) -> Result<(), NtStatus>,
) -> Result<Vec<FindData>, NtStatus> {
    let mut entries = Vec::new();
    let mut emit = |data: &FindData| -> Result<(), FillDataError> {
        entries
            .try_reserve(1)
            .map_err(|_| FillDataError::OutOfMemory)?;
        entries.push(data.clone());
        Ok(())
    };
    enumerate(&mut emit)?;
    Ok(entries)
}

/// `.` and `..` belong in a listing of a non-root directory scanned with
/// no pattern or with `*`.
fn should_synthesize_dots(path: &U16CStr, pattern: Option<&U16CStr>) -> bool {
    if path == ROOT {
        return false;
    }
    match pattern {
        Some(pattern) => pattern == MATCH_ALL,
        None => true,
    }
}

/// Insert `.` and `..` at the head of `entries` unless already present.
fn add_missing_current_and_parent(entries: &mut Vec<FindData>) -> Result<(), NtStatus> {
    let has_current = entries.iter().any(|e| e.file_name() == CURRENT_DIRECTORY);
    let has_parent = entries.iter().any(|e| e.file_name() == PARENT_DIRECTORY);
    if has_current && has_parent {
        return Ok(());
    }

    let now = rtl_get_system_time();
    let mut synthesized = Vec::with_capacity(2);
    for (name, present) in [(CURRENT_DIRECTORY, has_current), (PARENT_DIRECTORY, has_parent)] {
        if !present {
            let entry = FindData::new(name.as_ustr(), FileAttributes::DIRECTORY)?
                .with_times(now, now, now);
            synthesized.push(entry);
        }
    }

    entries
        .try_reserve(synthesized.len())
        .map_err(|_| NtStatus::from(FillDataError::OutOfMemory))?;
    entries.splice(0..0, synthesized);
    Ok(())
}

enum MatchOutcome {
    /// At least one record written; `next_index` is the continuation index
    Packed { next_index: u32 },
    /// No record written; `overflow` if a candidate existed but did not fit
    Nothing { overflow: bool },
}

/// Walk `listing`, packing matching entries from the request's index on.
fn match_files(
    request: &EventContext,
    directory: &DirectoryRequest,
    class: FileInformationClass,
    listing: &DirectoryListing,
    pattern: Option<&U16CStr>,
    info: &FileInfo<'_>,
    response: &mut EventInformation,
) -> MatchOutcome {
    let options = info.options();
    let ignore_case = !options.case_sensitive();
    let trace = options.debug();
    let allocation_unit = options.allocation_unit_size;
    let single_entry = request.return_single_entry();
    let file_index = directory.file_index;

    // A pre-filtered listing is never matched again
    let pattern = pattern.filter(|_| !listing.is_prefiltered());

    let buffer_length = directory.buffer_length as usize;
    let payload = response.payload_mut();
    let mut remaining = buffer_length.min(payload.len());
    let capacity = remaining;

    let mut index: u32 = 0;
    let mut offset = 0usize;
    let mut last_record: Option<usize> = None;
    let mut buffer_full = false;

    for entry in listing.entries() {
        if let Some(pattern) = pattern {
            let matched = fsrtl_is_name_in_expression(
                pattern.as_ustr(),
                entry.file_name().as_ustr(),
                ignore_case,
            );
            if trace {
                log::trace!(
                    "match {} against {}: {}",
                    entry.file_name().display(),
                    pattern.display(),
                    matched
                );
            }
            if !matched {
                continue;
            }
        }

        if file_index <= index {
            let size = fill_directory_information(
                class,
                &mut payload[offset..],
                &mut remaining,
                entry,
                index + 1,
                allocation_unit,
            );
            if size == 0 {
                buffer_full = true;
                break;
            }
            last_record = Some(offset);

            if single_entry {
                index += 1;
                break;
            }

            set_next_entry_offset(&mut payload[offset..], size as u32);
            offset += size;
        }
        index += 1;
    }

    if let Some(last) = last_record {
        set_next_entry_offset(&mut payload[last..], 0);
    }
    response.set_buffer_length((capacity - remaining) as u32);

    if index <= file_index {
        MatchOutcome::Nothing {
            overflow: buffer_full,
        }
    } else {
        MatchOutcome::Packed { next_index: index }
    }
}
