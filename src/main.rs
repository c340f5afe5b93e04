//! Subbox - Entry Point
//!
//! Reads a subscription payload from a file or stdin, ranks its candidates
//! and prints the listing plus the chosen outbound.

use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use subbox::config::LogConfig;
use subbox::models::clip_chars;
use subbox::{subscription, Candidate, Config, Engine, Result, SubboxError};

/// Largest accepted subscription payload
const MAX_PAYLOAD_BYTES: usize = 8 * 1024 * 1024;
/// Column width for candidate names in the listing
const NAME_WIDTH: usize = 48;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Subbox");

    let source = std::env::args_os().nth(1).map(PathBuf::from);
    let payload = match &source {
        Some(path) if path.as_os_str() != "-" => {
            read_bounded(tokio::fs::File::open(path).await?).await?
        }
        _ => read_bounded(tokio::io::stdin()).await?,
    };
    info!("Read {} byte subscription payload", payload.len());

    let chosen = match config.select {
        Some(index) => {
            let candidates = subscription::load_candidates(&payload)?;
            print_listing(&candidates);
            subscription::select(&candidates, index)?.clone()
        }
        None => {
            let ranked = Engine::new(&config).run(&payload).await?;
            print_listing(&ranked);
            match ranked.into_iter().next() {
                Some(best) => best,
                None => return Err(SubboxError::NoCandidates),
            }
        }
    };

    info!("Selected {}", chosen.display_name());
    let outbound = chosen.descriptor().to_outbound(config.health.force_tcp);
    println!("{}", serde_json::to_string_pretty(&outbound)?);

    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("subbox={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    match LogFormat::parse(&log.format) {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    /// Anything but `json` falls back to the pretty formatter
    fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Read at most `MAX_PAYLOAD_BYTES`, failing rather than truncating
async fn read_bounded<R: AsyncRead + Unpin>(reader: R) -> Result<Vec<u8>> {
    let mut payload = Vec::new();
    reader
        .take(MAX_PAYLOAD_BYTES as u64 + 1)
        .read_to_end(&mut payload)
        .await?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(SubboxError::PayloadTooLarge {
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(payload)
}

fn print_listing(candidates: &[Candidate]) {
    for (i, candidate) in candidates.iter().enumerate() {
        println!("{}", listing_line(i + 1, candidate));
    }
}

/// `NN) [RTT:<r> HTTP:<h>] <name>` with left-aligned status columns
fn listing_line(number: usize, candidate: &Candidate) -> String {
    format!(
        "{:02}) [RTT:{:<7} HTTP:{:<8}] {}",
        number,
        candidate.reachability.to_string(),
        candidate.health.to_string(),
        clip_chars(candidate.display_name(), NAME_WIDTH)
    )
}
