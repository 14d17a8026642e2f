//! Byte, string and reference scanning over a module image

pub mod pattern;
pub mod strings;
pub mod xref;

pub use pattern::{find_all, find_first, scan_pattern_fast, Pattern};
pub use strings::{
    find_any_string_all, find_string, find_string_all, find_wide_string, find_wide_string_all,
};
pub use xref::{Reference, ReferenceKind, ReferenceScanner};
