//! Language runners.
//!
//! The core stays language-agnostic. A runner names the file a submission is
//! staged under, its compile step (if any), its launch command, and what the
//! runtime needs from the policy.

pub mod languages;
pub mod registry;
pub mod runner;

pub use registry::RunnerRegistry;
pub use runner::{LanguageRunner, RunnerRequirements};
