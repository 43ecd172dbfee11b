//! Utilities
//!
//! Descriptor and environment hygiene for the payload, and bounded output capture.

pub mod env_hygiene;
pub mod fd_closure;
pub mod output;
