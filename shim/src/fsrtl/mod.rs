//! File System Runtime Library (fsrtl)
//!
//! Name handling shared by the dispatch paths:
//!
//! - **Wildcards**: DOS-style expression matching for directory filters

pub mod name;

pub use name::fsrtl_is_name_in_expression;
