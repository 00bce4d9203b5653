//! RTL Time Functions
//!
//! NT timestamps are 64-bit counts of 100-nanosecond intervals since
//! January 1, 1601 (the FILETIME epoch). Directory records carry them
//! verbatim, so everything the shim hands to the kernel goes through here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Number of 100-nanosecond intervals per second
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Number of 100-nanosecond intervals per day
pub const TICKS_PER_DAY: i64 = TICKS_PER_SECOND * 60 * 60 * 24;

/// Days from 1601 to 1970 (Unix epoch)
const DAYS_FROM_1601_TO_1970: i64 = 134774;

/// Ticks from 1601 to 1970
pub const TICKS_1601_TO_1970: i64 = DAYS_FROM_1601_TO_1970 * TICKS_PER_DAY;

/// Convert Unix timestamp to NT time
///
/// Unix time: seconds since January 1, 1970
/// NT time: 100ns intervals since January 1, 1601
#[inline]
pub fn unix_time_to_nt_time(unix_time: i64) -> i64 {
    TICKS_1601_TO_1970 + (unix_time * TICKS_PER_SECOND)
}

/// Convert NT time to Unix timestamp
///
/// Returns seconds since January 1, 1970
#[inline]
pub fn nt_time_to_unix_time(nt_time: i64) -> i64 {
    (nt_time - TICKS_1601_TO_1970) / TICKS_PER_SECOND
}

/// Convert a `SystemTime` to NT time, clamping pre-1601 values to zero.
pub fn system_time_to_nt_time(time: SystemTime) -> i64 {
    let ticks = match time.duration_since(UNIX_EPOCH) {
        Ok(after) => TICKS_1601_TO_1970.saturating_add(duration_to_ticks(after)),
        Err(before) => TICKS_1601_TO_1970.saturating_sub(duration_to_ticks(before.duration())),
    };
    ticks.max(0)
}

fn duration_to_ticks(duration: Duration) -> i64 {
    let ticks = duration.as_nanos() / 100;
    i64::try_from(ticks).unwrap_or(i64::MAX)
}

/// Get current system time in NT format (GetSystemTimeAsFileTime)
pub fn rtl_get_system_time() -> i64 {
    system_time_to_nt_time(SystemTime::now())
}
