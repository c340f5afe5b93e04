//! Candidate probing
//!
//! Two stages, each run over a bounded worker pool:
//! - `reachability`: raw TCP connect latency
//! - `health`: one real HTTP request through an ephemeral backend instance

pub mod backend;
pub mod health;
pub mod pool;
pub mod process;
pub mod reachability;

pub use health::HealthProber;
pub use pool::{effective_workers, parallel_map};
pub use process::{BackendProcess, ProcessState};
