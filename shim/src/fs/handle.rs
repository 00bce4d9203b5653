//! Open Handle Table
//!
//! Per-mount table of the files the kernel has open through this shim,
//! keyed by the opaque context value the driver stamps on every request
//! for that file object.
//!
//! # Reference Counting
//! Each slot carries two kinds of references:
//! - the *open* reference, taken when the slot is created and dropped by
//!   IRP_MJ_CLOSE
//! - one *dispatch* reference per request currently being served
//!
//! The count lives in the slot beside the data it guards. When it reaches
//! zero the slot is removed from the table, exactly once, and handed back
//! to the caller so the file system's `close_file` can run without the
//! table lock held.
//!
//! # Directory Cache
//! A slot may hold the listing produced by the last `find_files` call. The
//! listing is immutable once published: it is replaced or cleared as a
//! whole under the lock, and readers work on a cloned `Arc` after the lock
//! is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use spin::Mutex;
use widestring::{U16CStr, U16CString};

use crate::fs::operations::FindData;
use crate::rtl::status::{NtStatus, STATUS_NO_MEMORY};

/// Cached result of one `find_files` call
#[derive(Debug, Default)]
pub struct DirectoryListing {
    entries: Vec<FindData>,
    /// The file system filtered by pattern itself; skip local matching
    prefiltered: bool,
}

impl DirectoryListing {
    pub fn new(entries: Vec<FindData>, prefiltered: bool) -> Self {
        Self {
            entries,
            prefiltered,
        }
    }

    pub fn entries(&self) -> &[FindData] {
        &self.entries
    }

    pub fn is_prefiltered(&self) -> bool {
        self.prefiltered
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Table slot for one open file object
#[derive(Debug)]
struct HandleSlot {
    /// Open reference plus in-flight dispatches
    references: u32,
    /// IRP_MJ_CLOSE has not been seen yet
    open: bool,
    file_name: U16CString,
    user_context: u64,
    is_directory: bool,
    listing: Option<Arc<DirectoryListing>>,
}

/// What is left of a slot once its last reference is gone
#[derive(Debug, PartialEq, Eq)]
pub struct ClosedHandle {
    pub context: u64,
    pub file_name: U16CString,
    pub user_context: u64,
    pub is_directory: bool,
}

/// State a dispatch starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub user_context: u64,
    pub is_directory: bool,
}

/// Open handles of one mount
#[derive(Debug, Default)]
pub struct OpenHandleTable {
    slots: Mutex<HashMap<u64, HandleSlot>>,
}

impl OpenHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a dispatch reference on `context`, creating the slot on first
    /// sight with `file_name` as its display name.
    pub fn acquire(&self, context: u64, file_name: &U16CStr) -> Result<HandleSnapshot, NtStatus> {
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get_mut(&context) {
            slot.references = slot.references.checked_add(1).ok_or(STATUS_NO_MEMORY)?;
            return Ok(HandleSnapshot {
                user_context: slot.user_context,
                is_directory: slot.is_directory,
            });
        }

        slots.try_reserve(1).map_err(|_| STATUS_NO_MEMORY)?;
        slots.insert(
            context,
            HandleSlot {
                // open reference + this dispatch
                references: 2,
                open: true,
                file_name: file_name.to_ucstring(),
                user_context: 0,
                is_directory: false,
                listing: None,
            },
        );
        log::trace!("handle {:#x}: created", context);

        Ok(HandleSnapshot {
            user_context: 0,
            is_directory: false,
        })
    }

    /// Drop a dispatch reference.
    ///
    /// Returns the removed slot when this was the last reference.
    pub fn release(&self, context: u64) -> Option<ClosedHandle> {
        self.drop_reference(context, false)
    }

    /// Drop the open reference (IRP_MJ_CLOSE).
    ///
    /// A second close for the same slot is ignored.
    pub fn close(&self, context: u64) -> Option<ClosedHandle> {
        self.drop_reference(context, true)
    }

    fn drop_reference(&self, context: u64, open_reference: bool) -> Option<ClosedHandle> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&context)?;

        if open_reference {
            if !slot.open {
                log::warn!("handle {:#x}: closed twice", context);
                return None;
            }
            slot.open = false;
        }

        slot.references = slot.references.saturating_sub(1);
        if slot.references > 0 {
            return None;
        }

        let slot = slots.remove(&context)?;
        log::trace!("handle {:#x}: removed", context);
        Some(ClosedHandle {
            context,
            file_name: slot.file_name,
            user_context: slot.user_context,
            is_directory: slot.is_directory,
        })
    }

    /// Cached listing for `context`, if one is published
    pub fn listing(&self, context: u64) -> Option<Arc<DirectoryListing>> {
        self.slots
            .lock()
            .get(&context)
            .and_then(|slot| slot.listing.clone())
    }

    /// Replace the cached listing of `context` wholesale.
    pub fn set_listing(&self, context: u64, listing: Option<Arc<DirectoryListing>>) {
        if let Some(slot) = self.slots.lock().get_mut(&context) {
            slot.listing = listing;
        }
    }

    pub fn clear_listing(&self, context: u64) {
        self.set_listing(context, None);
    }

    /// Store the file system's context value and directory flag after a
    /// dispatch.
    pub fn update(&self, context: u64, user_context: u64, is_directory: bool) {
        if let Some(slot) = self.slots.lock().get_mut(&context) {
            slot.user_context = user_context;
            slot.is_directory = is_directory;
        }
    }

    /// Current reference count of `context`
    pub fn references(&self, context: u64) -> Option<u32> {
        self.slots.lock().get(&context).map(|slot| slot.references)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Remove every slot regardless of its count (unmount)
    pub fn drain(&self) -> Vec<ClosedHandle> {
        let mut slots = self.slots.lock();
        slots
            .drain()
            .map(|(context, slot)| ClosedHandle {
                context,
                file_name: slot.file_name,
                user_context: slot.user_context,
                is_directory: slot.is_directory,
            })
            .collect()
    }
}
