//! Observability
//!
//! Structured audit events for limit breaches, degraded controls and teardown.

pub mod audit;
