//! Cgroup resource governance (v2 only)

pub mod backend;
pub mod v2;

pub use backend::{CgroupBackend, CgroupLimits};
pub use v2::CgroupV2;
