//! Backend-agnostic connection descriptor decoded from a subscription link.

use serde_json::{json, Map, Value};

/// Proxy protocol carried by a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Vless,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
        }
    }

    pub fn from_scheme(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "vless" => Some(Protocol::Vless),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport layered on top of the raw TCP stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Grpc {
        service_name: Option<String>,
        authority: Option<String>,
    },
    WebSocket {
        path: Option<String>,
        host: Option<String>,
    },
    HttpUpgrade {
        host: Option<String>,
        path: Option<String>,
    },
    Http2 {
        path: Option<String>,
        hosts: Vec<String>,
    },
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Grpc { .. } => "grpc",
            Transport::WebSocket { .. } => "ws",
            Transport::HttpUpgrade { .. } => "httpupgrade",
            Transport::Http2 { .. } => "http",
        }
    }

    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), json!(self.kind()));

        match self {
            Transport::Grpc {
                service_name,
                authority,
            } => {
                insert_opt(&mut obj, "service_name", service_name);
                insert_opt(&mut obj, "authority", authority);
            }
            Transport::WebSocket { path, host } => {
                insert_opt(&mut obj, "path", path);
                if let Some(host) = host {
                    obj.insert("headers".into(), json!({ "Host": host }));
                }
            }
            Transport::HttpUpgrade { host, path } => {
                insert_opt(&mut obj, "host", host);
                insert_opt(&mut obj, "path", path);
            }
            Transport::Http2 { path, hosts } => {
                insert_opt(&mut obj, "path", path);
                if !hosts.is_empty() {
                    obj.insert("host".into(), json!(hosts));
                }
            }
        }

        Value::Object(obj)
    }
}

/// REALITY handshake parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reality {
    pub public_key: String,
    pub short_id: Option<String>,
}

/// TLS settings; presence of this block means TLS is enabled
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Security {
    pub server_name: Option<String>,
    pub insecure: bool,
    pub alpn: Vec<String>,
    pub fingerprint: Option<String>,
    pub reality: Option<Reality>,
}

impl Security {
    fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("enabled".into(), json!(true));
        insert_opt(&mut obj, "server_name", &self.server_name);
        if self.insecure {
            obj.insert("insecure".into(), json!(true));
        }
        if !self.alpn.is_empty() {
            obj.insert("alpn".into(), json!(self.alpn));
        }
        if let Some(fp) = &self.fingerprint {
            obj.insert(
                "utls".into(),
                json!({ "enabled": true, "fingerprint": fp }),
            );
        }
        if let Some(reality) = &self.reality {
            let mut r = Map::new();
            r.insert("enabled".into(), json!(true));
            r.insert("public_key".into(), json!(reality.public_key));
            insert_opt(&mut r, "short_id", &reality.short_id);
            obj.insert("reality".into(), Value::Object(r));
        }
        Value::Object(obj)
    }
}

/// Decoded connection parameters of one candidate
///
/// Invariants: `server_port` is never 0, `credential` is never empty and a
/// `reality` block always carries a public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub protocol: Protocol,
    pub server: String,
    pub server_port: u16,
    pub credential: String,
    pub flow: Option<String>,
    pub transport: Option<Transport>,
    pub security: Option<Security>,
}

impl ConnectionDescriptor {
    /// Endpoint in `host:port` form, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        if self.server.contains(':') {
            format!("[{}]:{}", self.server, self.server_port)
        } else {
            format!("{}:{}", self.server, self.server_port)
        }
    }

    /// Render as a backend outbound object tagged `proxy`.
    ///
    /// `force_tcp` pins the outbound to TCP, which the TUN run mode needs.
    pub fn to_outbound(&self, force_tcp: bool) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), json!(self.protocol.as_str()));
        obj.insert("tag".into(), json!("proxy"));
        obj.insert("server".into(), json!(self.server));
        obj.insert("server_port".into(), json!(self.server_port));
        obj.insert("uuid".into(), json!(self.credential));
        insert_opt(&mut obj, "flow", &self.flow);

        if let Some(security) = &self.security {
            obj.insert("tls".into(), security.to_value());
        }
        if let Some(transport) = &self.transport {
            obj.insert("transport".into(), transport.to_value());
        }
        if force_tcp {
            obj.insert("network".into(), json!("tcp"));
        }

        Value::Object(obj)
    }
}

fn insert_opt(obj: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(v) = value {
        obj.insert(key.to_string(), json!(v));
    }
}
