//! probebox: sandboxed execution of untrusted probe programs
//!
//! A probe is a small program written to exercise one behaviour of the
//! sandbox: spinning past its time limit, allocating past its memory ceiling,
//! forking, calling denied syscalls, touching the network or the host
//! filesystem. probebox runs it under an explicit [`ExecutionPolicy`],
//! supervises its resource use, tears it down completely, and judges its
//! output against an oracle.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: PID, mount, network, IPC, UTS and user namespaces
//! - [`kernel::cgroup`]: cgroup v2 memory/pids limits and accounting
//! - [`kernel::mount`]: the restricted root the payload sees
//! - [`kernel::seccomp`]: syscall deny-lists
//! - [`kernel::signal`]: signalling helpers and the batch shutdown handler
//! - [`kernel::host`]: probing which of the above this host offers
//!
//! ## Sandbox Core ([`core`])
//! - [`core::enforcer`]: policy to isolation handles, with recorded degradations
//! - [`core::monitor`]: wall-clock, CPU and memory supervision with escalation
//! - [`core::orchestrator`]: one run end to end, teardown and classification
//! - [`core::proxy`]: the re-executed proxy that forks the sandbox init
//! - [`core::pool`] and [`core::harness`]: bounded concurrent evaluation
//!
//! ## Languages ([`judge`]) and Verdicts ([`verdict`])
//! - [`judge::runner`]: compile and launch rules per language
//! - [`verdict::oracle`]: expected behaviour of a run
//! - [`verdict::verdict`]: pass / fail / error
//!
//! ## Support
//! - [`exec::preexec`]: type-state ordered pre-exec chain of the payload
//! - [`safety`]: run directories and their symlink-proof removal
//! - [`observability::audit`]: structured audit events
//! - [`config`]: policy types, presets, validation, configuration loading
//! - [`utils`]: descriptor hygiene and bounded output capture

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Sandbox core
pub mod core;

// Language runners
pub mod judge;

// Oracles & Verdicts
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration & Policy
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint of the probebox binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use core::harness::Harness;
pub use core::orchestrator::Orchestrator;
pub use verdict::{judge, Oracle, Verdict, VerdictStatus};
