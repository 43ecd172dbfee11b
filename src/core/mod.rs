//! Language-agnostic sandbox core.
//!
//! Enforcer, monitor and orchestrator, plus the proxy/init process model they
//! drive. Language-specific compile and launch rules live in [`crate::judge`].

pub mod enforcer;
pub mod harness;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod supervisor;
pub mod types;
