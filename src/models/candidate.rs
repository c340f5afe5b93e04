use std::time::Duration;

use super::ConnectionDescriptor;

/// Why a probe stage did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Fail,
}

impl ProbeFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeFailure::Timeout => "timeout",
            ProbeFailure::Fail => "fail",
        }
    }
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of the raw TCP reachability probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    #[default]
    Untested,
    Measured(Duration),
    Failed(ProbeFailure),
}

impl Reachability {
    pub fn latency(&self) -> Option<Duration> {
        match self {
            Reachability::Measured(latency) => Some(*latency),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Reachability::Failed(_))
    }
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Untested => write!(f, "--"),
            Reachability::Measured(latency) => write!(f, "{}ms", latency.as_millis().max(1)),
            Reachability::Failed(kind) => write!(f, "{}", kind),
        }
    }
}

/// Outcome of the end-to-end health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    #[default]
    Untested,
    /// Transport succeeded; the status code is reported as-is, 4xx/5xx included
    Ok { status: u16, latency: Duration },
    Failed(ProbeFailure),
    /// Not attempted: reachability already failed or the tooling is missing
    Skipped,
}

impl Health {
    pub fn is_ok(&self) -> bool {
        matches!(self, Health::Ok { .. })
    }

    pub fn latency(&self) -> Option<Duration> {
        match self {
            Health::Ok { latency, .. } => Some(*latency),
            _ => None,
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Untested => write!(f, "--"),
            Health::Ok { status: 0, .. } => write!(f, "ok"),
            Health::Ok { status, .. } => write!(f, "ok:{}", status),
            Health::Failed(kind) => write!(f, "{}", clip_chars(kind.as_str(), 8)),
            Health::Skipped => write!(f, "skip"),
        }
    }
}

/// One decoded, probeable entry of the subscription feed
#[derive(Debug, Clone)]
pub struct Candidate {
    raw_link: String,
    display_name: String,
    descriptor: ConnectionDescriptor,
    pub reachability: Reachability,
    pub health: Health,
}

impl Candidate {
    pub fn new(raw_link: String, display_name: String, descriptor: ConnectionDescriptor) -> Self {
        Self {
            raw_link,
            display_name,
            descriptor,
            reachability: Reachability::Untested,
            health: Health::Untested,
        }
    }

    pub fn raw_link(&self) -> &str {
        &self.raw_link
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }
}

/// Truncate to `max` characters, marking the cut with `...` when there is room
pub fn clip_chars(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let mut out: String = s.chars().take(max - 3).collect();
    out.push_str("...");
    out
}
