//! Filesystem isolation: the per-run sandbox root

pub mod filesystem;

pub use filesystem::{MountReport, SandboxRoot, BOX_DIR};
