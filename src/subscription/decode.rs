//! Descriptor translation: one connection string in, one descriptor out.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

use crate::error::{Result, SubboxError};
use crate::models::{Candidate, ConnectionDescriptor, Protocol, Reality, Security, Transport};

const DEFAULT_PORT: u16 = 443;

/// Decode a raw link into a connection descriptor
///
/// Pure function of its input: decoding the same link twice yields equal
/// descriptors.
pub fn decode(raw: &str) -> Result<ConnectionDescriptor> {
    let url = Url::parse(raw.trim())?;
    decode_url(&url)
}

/// Decode a raw link into a fresh, untested candidate
pub fn decode_candidate(raw: &str) -> Result<Candidate> {
    let url = Url::parse(raw.trim())?;
    let descriptor = decode_url(&url)?;
    let name = display_name(&url, &descriptor);
    Ok(Candidate::new(raw.trim().to_string(), name, descriptor))
}

fn decode_url(url: &Url) -> Result<ConnectionDescriptor> {
    let protocol = Protocol::from_scheme(url.scheme())
        .ok_or_else(|| SubboxError::UnsupportedScheme(url.scheme().to_string()))?;

    let credential = decode_component(url.username()).trim().to_string();
    if credential.is_empty() {
        return Err(SubboxError::InvalidDescriptor(
            "missing user id in authority".into(),
        ));
    }

    let server = host_string(url)
        .ok_or_else(|| SubboxError::InvalidDescriptor("missing server host".into()))?;

    let server_port = url.port().unwrap_or(DEFAULT_PORT);
    if server_port == 0 {
        return Err(SubboxError::InvalidDescriptor("invalid port: 0".into()));
    }

    let params = QueryParams::from_url(url);

    Ok(ConnectionDescriptor {
        protocol,
        server,
        server_port,
        credential,
        flow: params.get("flow"),
        security: decode_security(&params)?,
        transport: decode_transport(&params)?,
    })
}

fn decode_security(params: &QueryParams) -> Result<Option<Security>> {
    let mode = params.get("security").unwrap_or_default().to_lowercase();
    let public_key = params.get("pbk");

    let reality_implied = mode == "reality" || public_key.is_some();
    if mode != "tls" && !reality_implied {
        return Ok(None);
    }

    let reality = if reality_implied {
        let public_key = public_key.ok_or_else(|| {
            SubboxError::InvalidDescriptor("reality security requires pbk".into())
        })?;
        Some(Reality {
            public_key,
            short_id: params.get("sid"),
        })
    } else {
        None
    };

    Ok(Some(Security {
        server_name: params.first(&["sni", "serverName", "host"]),
        insecure: params.get("allowInsecure").is_some_and(|v| parse_bool(&v)),
        alpn: split_csv(params.get("alpn").as_deref()),
        fingerprint: params.first(&["fp", "fingerprint"]),
        reality,
    }))
}

fn decode_transport(params: &QueryParams) -> Result<Option<Transport>> {
    let kind = params
        .first(&["type", "network"])
        .unwrap_or_default()
        .to_lowercase();

    let transport = match kind.as_str() {
        "" | "tcp" => return Ok(None),
        "grpc" => Transport::Grpc {
            service_name: params
                .first(&["serviceName", "service_name"])
                .map(|s| s.strip_prefix('/').map(str::to_string).unwrap_or(s))
                .filter(|s| !s.is_empty()),
            authority: params.get("authority"),
        },
        "ws" | "websocket" => Transport::WebSocket {
            path: params.get("path"),
            host: params.get("host"),
        },
        "httpupgrade" => Transport::HttpUpgrade {
            host: params.get("host"),
            path: params.get("path"),
        },
        "http" | "h2" => Transport::Http2 {
            path: params.get("path"),
            hosts: split_csv(params.get("host").as_deref()),
        },
        other => {
            return Err(SubboxError::InvalidDescriptor(format!(
                "unsupported transport type: {:?}",
                other
            )))
        }
    };

    Ok(Some(transport))
}

/// Human label: the decoded fragment if present, else `host:port`
fn display_name(url: &Url, descriptor: &ConnectionDescriptor) -> String {
    if let Some(fragment) = url.fragment().map(str::trim).filter(|f| !f.is_empty()) {
        let plus_as_space = fragment.replace('+', " ");
        return match percent_decode_str(&plus_as_space).decode_utf8() {
            Ok(decoded) if !decoded.trim().is_empty() => decoded.into_owned(),
            _ => fragment.to_string(),
        };
    }
    format!("{}:{}", descriptor.server, descriptor.server_port)
}

fn host_string(url: &Url) -> Option<String> {
    let host = match url.host()? {
        Host::Domain(domain) => decode_component(domain).trim().to_string(),
        Host::Ipv4(addr) => addr.to_string(),
        Host::Ipv6(addr) => addr.to_string(),
    };
    (!host.is_empty()).then_some(host)
}

fn decode_component(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Query parameters keeping the first value of each key, trimmed
struct QueryParams(HashMap<String, String>);

impl QueryParams {
    fn from_url(url: &Url) -> Self {
        let mut map = HashMap::new();
        for (key, value) in url.query_pairs() {
            map.entry(key.into_owned())
                .or_insert_with(|| value.trim().to_string());
        }
        Self(map)
    }

    /// Non-empty value for `key`
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).filter(|v| !v.is_empty()).cloned()
    }

    /// First non-empty value among `keys`
    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }
}

pub(crate) fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn split_csv(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}
