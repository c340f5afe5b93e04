//! Raw TCP reachability probing
//!
//! Measures how long a plain TCP connect to each candidate's endpoint takes.

use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::error::{Result, SubboxError};
use crate::models::{Candidate, ConnectionDescriptor, ProbeFailure, Reachability};
use crate::probe::pool::parallel_map;

/// Probe every candidate once and record the outcome on it
///
/// Never fails: per-candidate errors are stored as `Reachability::Failed`.
pub async fn probe_all(candidates: &mut [Candidate], connect_timeout: Duration, workers: usize) {
    if candidates.is_empty() {
        return;
    }

    info!("Reachability test of {} candidates", candidates.len());

    let outcomes = parallel_map(candidates.iter(), workers, |candidate| {
        probe_candidate(candidate, connect_timeout)
    })
    .await;

    for (candidate, outcome) in candidates.iter_mut().zip(outcomes) {
        candidate.reachability = outcome;
    }

    let reachable = candidates
        .iter()
        .filter(|c| matches!(c.reachability, Reachability::Measured(_)))
        .count();
    info!(
        "Reachability test complete: {} reachable, {} unreachable",
        reachable,
        candidates.len() - reachable
    );
}

#[instrument(skip_all, fields(candidate = %candidate.display_name()))]
async fn probe_candidate(candidate: &Candidate, connect_timeout: Duration) -> Reachability {
    match measure_connect(candidate.descriptor(), connect_timeout).await {
        Ok(latency) => {
            debug!("Connected in {:?}", latency);
            Reachability::Measured(latency)
        }
        Err(e) => {
            debug!("Connect failed: {}", e);
            Reachability::Failed(classify(&e))
        }
    }
}

/// Time one TCP connect to the descriptor's endpoint
pub async fn measure_connect(
    descriptor: &ConnectionDescriptor,
    connect_timeout: Duration,
) -> Result<Duration> {
    let start = Instant::now();
    let stream = timeout(
        connect_timeout,
        TcpStream::connect((descriptor.server.as_str(), descriptor.server_port)),
    )
    .await
    .map_err(|_| SubboxError::Timeout)??;
    let elapsed = start.elapsed();
    drop(stream);
    Ok(elapsed)
}

pub(crate) fn classify(err: &SubboxError) -> ProbeFailure {
    if err.is_timeout() {
        ProbeFailure::Timeout
    } else {
        ProbeFailure::Fail
    }
}
