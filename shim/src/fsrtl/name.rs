//! Name Comparison Utilities
//!
//! Wildcard matching used to filter directory listings, with NT and DOS
//! wildcards and optional case folding.
//!
//! # Wildcards
//! - `*` matches zero or more characters
//! - `?` matches exactly one character
//! - `<` (DOS_STAR) matches zero or more characters, but never past the
//!   final `.` of the name
//! - `>` (DOS_QM) matches one character; positioned on the final `.` it
//!   matches nothing instead
//! - `"` (DOS_DOT) matches a `.` or nothing
//!
//! # Complexity
//! Matching is recursive: every `*`/`<` tries each split point of the
//! remaining name. Recursion depth is bounded by the expression length,
//! since each nested call starts past at least one wildcard. Run time is
//! exponential in the number of stars for adversarial expressions; callers
//! exposed to untrusted patterns should bound pattern length themselves.

use widestring::U16Str;

/// Wildcard code units
const WILDCARD_STAR: u16 = b'*' as u16;
const WILDCARD_QUESTION: u16 = b'?' as u16;
const WILDCARD_DOS_STAR: u16 = b'<' as u16;
const WILDCARD_DOS_QUESTION: u16 = b'>' as u16;
const WILDCARD_DOS_DOT: u16 = b'"' as u16;

const DOT: u16 = b'.' as u16;

/// Check if a name matches an expression with wildcards
///
/// # Arguments
/// * `expression` - Pattern with wildcards
/// * `name` - Name to match against
/// * `ignore_case` - Whether to ignore case
///
/// # Returns
/// true if name matches expression. An empty expression matches only an
/// empty name.
pub fn fsrtl_is_name_in_expression(expression: &U16Str, name: &U16Str, ignore_case: bool) -> bool {
    match_expression(expression.as_slice(), name.as_slice(), ignore_case)
}

fn match_expression(expr: &[u16], name: &[u16], ignore_case: bool) -> bool {
    let mut ei = 0; // expression index
    let mut ni = 0; // name index

    while ei < expr.len() {
        match expr[ei] {
            WILDCARD_STAR => {
                ei += 1;
                if ei == expr.len() {
                    return true;
                }

                while ni < name.len() {
                    if match_expression(&expr[ei..], &name[ni..], ignore_case) {
                        return true;
                    }
                    ni += 1;
                }
            }
            WILDCARD_DOS_STAR => {
                ei += 1;

                // Stop in front of the final dot; without one, run to the end
                let stop = name[ni..]
                    .iter()
                    .rposition(|&c| c == DOT)
                    .map_or(name.len(), |p| ni + p);

                while ni < stop {
                    if match_expression(&expr[ei..], &name[ni..], ignore_case) {
                        return true;
                    }
                    ni += 1;
                }
            }
            WILDCARD_DOS_QUESTION => {
                ei += 1;
                match name.get(ni) {
                    None => return false,
                    Some(&DOT) => {
                        // Only the final dot is skipped over as zero-width
                        if name[ni + 1..].contains(&DOT) {
                            ni += 1;
                        }
                    }
                    Some(_) => ni += 1,
                }
            }
            WILDCARD_DOS_DOT => {
                ei += 1;
                if name.get(ni) == Some(&DOT) {
                    ni += 1;
                }
            }
            WILDCARD_QUESTION => {
                if ni >= name.len() {
                    return false;
                }
                ei += 1;
                ni += 1;
            }
            c => {
                let matches = match name.get(ni) {
                    Some(&n) if ignore_case => upcase(c) == upcase(n),
                    Some(&n) => c == n,
                    None => false,
                };
                if !matches {
                    return false;
                }
                ei += 1;
                ni += 1;
            }
        }
    }

    ni == name.len()
}

/// Simple upper-case mapping of one UTF-16 code unit (towupper)
///
/// Surrogates and characters whose upper case expands to more than one
/// character, or leaves the BMP, map to themselves.
fn upcase(c: u16) -> u16 {
    if c < 0x80 {
        return (c as u8).to_ascii_uppercase() as u16;
    }
    let Some(ch) = char::from_u32(c as u32) else {
        return c;
    };
    let mut upper = ch.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) => u16::try_from(u as u32).unwrap_or(c),
        _ => c,
    }
}
