//! Configuration and policy
//!
//! Policy types, named presets, validation, and loading of harness settings
//! and batch manifests.

pub mod loader;
pub mod presets;
pub mod types;
pub mod validator;
