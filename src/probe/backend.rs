//! Per-probe backend configuration
//!
//! Each health probe gets a minimal configuration: one local mixed inbound,
//! the candidate's outbound, and a route that sends everything through it.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;

use serde_json::{json, Value};
use tempfile::{Builder, NamedTempFile};
use tracing::debug;

use crate::error::{Result, SubboxError};

/// Build the single-outbound configuration for one probe
pub fn probe_config(outbound: Value, listen_port: u16) -> Value {
    json!({
        "log": { "level": "error" },
        "inbounds": [
            {
                "type": "mixed",
                "tag": "mixed-in",
                "listen": "127.0.0.1",
                "listen_port": listen_port,
            }
        ],
        "outbounds": [
            outbound,
            { "type": "direct", "tag": "direct" },
            { "type": "block", "tag": "block" },
        ],
        "route": {
            "auto_detect_interface": true,
            "final": "proxy",
        }
    })
}

/// Ask the OS for a free loopback port
///
/// Best effort: the port is released before the backend binds it, so another
/// process could grab it in between.
pub fn reserve_local_port() -> Result<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .map_err(|e| SubboxError::PortReservation(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| SubboxError::PortReservation(e.to_string()))?
        .port();
    if port == 0 {
        return Err(SubboxError::PortReservation(
            "OS returned port 0".into(),
        ));
    }
    Ok(port)
}

/// Private temporary file holding one probe configuration
///
/// Created exclusively with owner-only permissions and removed when dropped.
pub struct ConfigFile {
    file: NamedTempFile,
}

impl ConfigFile {
    pub fn write(config: &Value) -> Result<Self> {
        let raw = serde_json::to_vec_pretty(config)?;

        let mut file = Builder::new()
            .prefix("subbox-")
            .suffix(".json")
            .tempfile()?;
        file.write_all(&raw)?;
        file.flush()?;

        debug!("Wrote probe config to {}", file.path().display());
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Remove the file now instead of waiting for drop
    pub fn remove(self) -> Result<()> {
        self.file.close()?;
        Ok(())
    }
}
