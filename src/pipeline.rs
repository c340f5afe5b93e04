//! Stage orchestration
//!
//! `load -> reachability -> health -> rank`. Each stage finishes for every
//! candidate before the next one starts.

use tracing::{info, instrument};

use crate::config::Config;
use crate::error::Result;
use crate::models::Candidate;
use crate::probe::{health, reachability};
use crate::ranking::rank;
use crate::subscription::load_candidates;

/// Runs the full selection pipeline with a fixed configuration
pub struct Engine {
    config: Config,
}

impl Engine {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Turn a feed payload into a ranked candidate list
    ///
    /// Only the fatal conditions are returned as errors: nothing extracted,
    /// nothing decoded, or no usable loopback port. Everything else is
    /// recorded on the candidates.
    #[instrument(skip_all, fields(payload_len = payload.len()))]
    pub async fn run(&self, payload: &[u8]) -> Result<Vec<Candidate>> {
        let mut candidates = load_candidates(payload)?;
        self.probe(&mut candidates).await?;
        Ok(candidates)
    }

    /// Run the enabled probe stages over already decoded candidates, then rank
    pub async fn probe(&self, candidates: &mut [Candidate]) -> Result<()> {
        let probe = &self.config.probe;
        if probe.enabled {
            reachability::probe_all(candidates, probe.timeout, probe.workers).await;
        } else {
            info!("Reachability test disabled");
        }

        let health_config = &self.config.health;
        if health_config.enabled {
            health::probe_all(candidates, health_config).await?;
        }

        rank(candidates, health_config.enabled);
        Ok(())
    }
}
