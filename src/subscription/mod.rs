//! Subscription feed handling
//!
//! Turns a raw feed payload into the candidate list the probers work on:
//! - link extraction from plain, JSON and base64-wrapped payloads
//! - per-link decoding into connection descriptors

pub mod decode;
pub mod extract;

pub use decode::{decode, decode_candidate};
pub use extract::extract_links;

use tracing::{debug, info};

use crate::error::{Result, SubboxError};
use crate::models::Candidate;

/// Extract and decode every supported link in a feed payload
///
/// Links that fail to decode are dropped individually. Errors only when
/// nothing was extracted or nothing survived decoding.
pub fn load_candidates(payload: &[u8]) -> Result<Vec<Candidate>> {
    let links = extract_links(payload);
    if links.is_empty() {
        return Err(SubboxError::NoLinks);
    }

    let total = links.len();
    let candidates: Vec<Candidate> = links
        .iter()
        .filter_map(|raw| match decode_candidate(raw) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                debug!("Dropping link: {}", e);
                None
            }
        })
        .collect();

    if candidates.is_empty() {
        return Err(SubboxError::NoCandidates);
    }

    info!(
        "Decoded {} of {} subscription links",
        candidates.len(),
        total
    );
    Ok(candidates)
}

/// Pick a candidate by its 1-based position
pub fn select(candidates: &[Candidate], index: usize) -> Result<&Candidate> {
    if index == 0 || index > candidates.len() {
        return Err(SubboxError::SelectionOutOfRange {
            index,
            len: candidates.len(),
        });
    }
    Ok(&candidates[index - 1])
}
