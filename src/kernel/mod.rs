//! Thin wrappers around Linux kernel primitives.
//!
//! `unsafe` code is concentrated here.
//! Dependency direction: signal -> namespace -> capabilities -> credentials -> mount -> cgroup -> seccomp

pub mod capabilities;
pub mod cgroup;
pub mod credentials;
pub mod host;
pub mod mount;
pub mod namespace;
pub mod seccomp;
pub mod signal;
