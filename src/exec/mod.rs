//! Execution control
//!
//! The payload's pre-exec chain, ordered by type state.

pub mod preexec;
