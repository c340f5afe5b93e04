//! Subbox - Subscription Candidate Selection Engine
//!
//! Turns a proxy subscription feed into a ranked list of usable endpoints.
//!
//! ## Pipeline
//!
//! - Link extraction from plain text, JSON and base64-wrapped payloads
//! - Decoding of `vless://` links into backend-agnostic descriptors
//! - Raw TCP reachability probing over a bounded worker pool
//! - End-to-end health probing through ephemeral sing-box instances
//! - Stable multi-key ranking of the probed candidates

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod probe;
pub mod ranking;
pub mod subscription;

pub use config::Config;
pub use error::{Result, SubboxError};
pub use models::Candidate;
pub use pipeline::Engine;
