use crate::error::{Result, SubboxError};
use crate::subscription::decode::parse_bool;
use std::env;
use std::time::Duration;
use url::Url;

pub const DEFAULT_HEALTH_URL: &str = "https://www.gstatic.com/generate_204";

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Reachability stage configuration
    pub probe: ProbeConfig,
    /// Health stage configuration
    pub health: HealthConfig,
    /// 1-based candidate to pick without probing
    pub select: Option<usize>,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Run the TCP reachability stage
    pub enabled: bool,
    /// Per-attempt connect timeout
    pub timeout: Duration,
    /// Maximum concurrent connect attempts
    pub workers: usize,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Run the end-to-end health stage
    pub enabled: bool,
    /// URL requested through each candidate
    pub url: String,
    /// Overall request timeout per candidate
    pub timeout: Duration,
    /// Maximum concurrent backend instances
    pub workers: usize,
    /// Proxy backend executable (name or path)
    pub backend_bin: String,
    /// HTTP-check executable (name or path)
    pub curl_bin: String,
    /// Pin outbounds to TCP, matching the TUN run mode
    pub force_tcp: bool,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_millis(1500),
            workers: 12,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: DEFAULT_HEALTH_URL.to_string(),
            timeout: Duration::from_secs(8),
            workers: 3,
            backend_bin: "sing-box".to_string(),
            curl_bin: "curl".to_string(),
            force_tcp: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            health: HealthConfig::default(),
            select: None,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let select = match env::var("SUBBOX_SELECT") {
            Ok(raw) if !raw.trim().is_empty() => Some(parse_count("SUBBOX_SELECT", &raw)?),
            _ => None,
        };

        let config = Config {
            probe: ProbeConfig {
                enabled: !parse_bool(&get_env_or("SUBBOX_SKIP_PROBE", "false")),
                timeout: get_millis_or("SUBBOX_PROBE_TIMEOUT_MS", 1500)?,
                workers: parse_count("SUBBOX_PROBE_WORKERS", &get_env_or("SUBBOX_PROBE_WORKERS", "12"))?,
            },
            health: HealthConfig {
                enabled: parse_bool(&get_env_or("SUBBOX_HEALTH_CHECK", "true")),
                url: get_env_or("SUBBOX_HEALTH_URL", DEFAULT_HEALTH_URL)
                    .trim()
                    .to_string(),
                timeout: get_millis_or("SUBBOX_HEALTH_TIMEOUT_MS", 8000)?,
                workers: parse_count("SUBBOX_HEALTH_WORKERS", &get_env_or("SUBBOX_HEALTH_WORKERS", "3"))?,
                backend_bin: get_env_or("SUBBOX_BACKEND_BIN", "sing-box"),
                curl_bin: get_env_or("SUBBOX_CURL_BIN", "curl"),
                force_tcp: parse_bool(&get_env_or("SUBBOX_FORCE_TCP", "false")),
            },
            select: select.filter(|&i| i > 0),
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.probe.enabled {
            if self.probe.timeout.is_zero() {
                return Err(SubboxError::InvalidConfig(
                    "SUBBOX_PROBE_TIMEOUT_MS must be positive".into(),
                ));
            }
            if self.probe.workers < 1 {
                return Err(SubboxError::InvalidConfig(
                    "SUBBOX_PROBE_WORKERS must be at least 1".into(),
                ));
            }
        }

        if self.health.enabled {
            if self.health.timeout.is_zero() {
                return Err(SubboxError::InvalidConfig(
                    "SUBBOX_HEALTH_TIMEOUT_MS must be positive".into(),
                ));
            }
            if self.health.workers < 1 {
                return Err(SubboxError::InvalidConfig(
                    "SUBBOX_HEALTH_WORKERS must be at least 1".into(),
                ));
            }
            if self.health.url.is_empty() {
                return Err(SubboxError::InvalidConfig(
                    "SUBBOX_HEALTH_URL must not be empty when health checks are enabled".into(),
                ));
            }
            let parsed = Url::parse(&self.health.url).map_err(|e| {
                SubboxError::InvalidConfig(format!("SUBBOX_HEALTH_URL must be a valid URL: {}", e))
            })?;
            if parsed.host_str().map_or(true, str::is_empty) {
                return Err(SubboxError::InvalidConfig(
                    "SUBBOX_HEALTH_URL must include a host".into(),
                ));
            }
        }

        Ok(())
    }
}

fn get_millis_or(key: &str, default: u64) -> Result<Duration> {
    let raw = get_env_or(key, &default.to_string());
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| SubboxError::InvalidConfig(format!("{} must be a number of milliseconds", key)))
}

fn parse_count(key: &str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| SubboxError::InvalidConfig(format!("{} must be a valid number", key)))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "SUBBOX_SELECT",
        "SUBBOX_SKIP_PROBE",
        "SUBBOX_PROBE_TIMEOUT_MS",
        "SUBBOX_PROBE_WORKERS",
        "SUBBOX_HEALTH_CHECK",
        "SUBBOX_HEALTH_URL",
        "SUBBOX_HEALTH_TIMEOUT_MS",
        "SUBBOX_HEALTH_WORKERS",
        "SUBBOX_BACKEND_BIN",
        "SUBBOX_CURL_BIN",
        "SUBBOX_FORCE_TCP",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert!(config.probe.enabled);
        assert_eq!(config.probe.timeout, Duration::from_millis(1500));
        assert_eq!(config.probe.workers, 12);

        assert!(config.health.enabled);
        assert_eq!(config.health.url, DEFAULT_HEALTH_URL);
        assert_eq!(config.health.timeout, Duration::from_secs(8));
        assert_eq!(config.health.workers, 3);
        assert_eq!(config.health.backend_bin, "sing-box");
        assert_eq!(config.health.curl_bin, "curl");
        assert!(!config.health.force_tcp);

        assert!(config.select.is_none());
        assert_eq!(config.log.format, "pretty");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SUBBOX_PROBE_TIMEOUT_MS", "750");
        env::set_var("SUBBOX_PROBE_WORKERS", "4");
        env::set_var("SUBBOX_HEALTH_CHECK", "off");
        env::set_var("SUBBOX_HEALTH_WORKERS", "0");
        env::set_var("SUBBOX_BACKEND_BIN", "/opt/sing-box");
        env::set_var("SUBBOX_FORCE_TCP", "yes");
        env::set_var("SUBBOX_SELECT", "2");

        let config = Config::from_env().unwrap();

        assert_eq!(config.probe.timeout, Duration::from_millis(750));
        assert_eq!(config.probe.workers, 4);
        // Health validation is skipped while the stage is disabled.
        assert!(!config.health.enabled);
        assert_eq!(config.health.workers, 0);
        assert_eq!(config.health.backend_bin, "/opt/sing-box");
        assert!(config.health.force_tcp);
        assert_eq!(config.select, Some(2));
    }

    #[test]
    fn test_config_from_env_invalid_numbers() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SUBBOX_PROBE_WORKERS", "many");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, SubboxError::InvalidConfig(_)));

        env::remove_var("SUBBOX_PROBE_WORKERS");
        env::set_var("SUBBOX_HEALTH_TIMEOUT_MS", "8s");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, SubboxError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_rejects_zero_workers_and_timeouts() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SUBBOX_PROBE_WORKERS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            SubboxError::InvalidConfig(_)
        ));

        env::remove_var("SUBBOX_PROBE_WORKERS");
        env::set_var("SUBBOX_HEALTH_TIMEOUT_MS", "0");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            SubboxError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_config_rejects_bad_health_url() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("SUBBOX_HEALTH_URL", "not a url");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            SubboxError::InvalidConfig(_)
        ));

        env::set_var("SUBBOX_HEALTH_URL", "mailto:someone");
        assert!(matches!(
            Config::from_env().unwrap_err(),
            SubboxError::InvalidConfig(_)
        ));
    }

    #[test]
    fn test_validate_defaults() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.health.enabled = false;
        config.health.url = String::new();
        assert!(config.validate().is_ok());
    }
}
