//! Local library access: sandboxed filesystem scanning (C7) and muxer-safe
//! chapter write-back (C8) (SPEC_FULL.md §4.7, §4.8).

pub mod ids;
pub mod scanner;
pub mod writer;
