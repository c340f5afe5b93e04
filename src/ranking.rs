//! Candidate ordering after probing

use std::cmp::Ordering;
use std::time::Duration;

use crate::models::{Candidate, Reachability};

/// Latency assigned to candidates without a reachability measurement
pub const UNREACHABLE_LATENCY: Duration = Duration::from_secs(10);

/// Sort candidates best-first, in place
///
/// Stable: candidates that compare equal keep their extraction order. With
/// `health_enabled` false the health fields are never consulted.
pub fn rank(candidates: &mut [Candidate], health_enabled: bool) {
    candidates.sort_by(|a, b| compare(a, b, health_enabled));
}

fn compare(a: &Candidate, b: &Candidate, health_enabled: bool) -> Ordering {
    if health_enabled {
        let (bucket_a, bucket_b) = (bucket(a), bucket(b));
        if bucket_a != bucket_b {
            return bucket_a.cmp(&bucket_b);
        }
        if bucket_a == 0 {
            let order = a.health.latency().cmp(&b.health.latency());
            if order != Ordering::Equal {
                return order;
            }
        }
    }

    reach_latency(a)
        .cmp(&reach_latency(b))
        .then_with(|| {
            a.display_name()
                .to_lowercase()
                .cmp(&b.display_name().to_lowercase())
        })
}

/// 0: healthy, 1: health not ok but TCP reachable, 2: everything else
fn bucket(candidate: &Candidate) -> u8 {
    if candidate.health.is_ok() {
        0
    } else if matches!(candidate.reachability, Reachability::Measured(_)) {
        1
    } else {
        2
    }
}

fn reach_latency(candidate: &Candidate) -> Duration {
    candidate
        .reachability
        .latency()
        .unwrap_or(UNREACHABLE_LATENCY)
}
