//! End-to-end health probing through an ephemeral backend instance
//!
//! For every candidate a private backend process is started with a config
//! that routes a local mixed inbound through the candidate's outbound. One
//! real HTTP request is then sent through it with the external check tool.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::task::spawn_blocking;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::config::HealthConfig;
use crate::error::{Result, SubboxError};
use crate::models::{Candidate, ConnectionDescriptor, Health};
use crate::probe::backend::{probe_config, reserve_local_port, ConfigFile};
use crate::probe::pool::parallel_map;
use crate::probe::process::{locate_executable, BackendProcess};
use crate::probe::reachability::classify;

/// Upper bound on backend start-up wait
const MAX_START_TIMEOUT: Duration = Duration::from_secs(3);
/// Lower bound on backend start-up wait
const MIN_START_TIMEOUT: Duration = Duration::from_millis(500);
/// Upper bound on the check tool's connect phase
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
/// Slack on top of the request timeout for spawn and readiness
const DEADLINE_SLACK: Duration = Duration::from_secs(4);
/// Pause before the single retry
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
/// curl exit code for "operation timed out"
const CURL_TIMEOUT_EXIT: i32 = 28;

/// Health prober bound to resolved executables
pub struct HealthProber {
    config: HealthConfig,
    backend: PathBuf,
    curl: PathBuf,
}

impl HealthProber {
    /// Resolve both executables
    pub fn locate(config: &HealthConfig) -> Result<Self> {
        let backend = locate_executable(&config.backend_bin)
            .ok_or_else(|| SubboxError::ExecutableNotFound(config.backend_bin.clone()))?;
        let curl = locate_executable(&config.curl_bin)
            .ok_or_else(|| SubboxError::ExecutableNotFound(config.curl_bin.clone()))?;
        Ok(Self {
            config: config.clone(),
            backend,
            curl,
        })
    }

    /// Backend start-up wait: `min(3s, timeout)`, floored at 500ms
    pub fn start_timeout(&self) -> Duration {
        self.config
            .timeout
            .min(MAX_START_TIMEOUT)
            .max(MIN_START_TIMEOUT)
    }

    /// Deadline covering spawn, readiness and the request
    pub fn deadline(&self) -> Duration {
        self.config.timeout + DEADLINE_SLACK
    }

    #[instrument(skip_all, fields(candidate = %candidate.display_name()))]
    async fn probe_candidate(&self, candidate: &Candidate) -> Health {
        if candidate.reachability.is_failed() {
            debug!("Skipping, reachability already failed");
            return Health::Skipped;
        }

        match self.check(candidate.descriptor()).await {
            Ok((status, latency)) => {
                debug!("HTTP {} in {:?}", status, latency);
                Health::Ok { status, latency }
            }
            Err(e) => {
                debug!("Health check failed: {}", e);
                Health::Failed(classify(&e))
            }
        }
    }

    /// Run one full probe against a descriptor
    ///
    /// The backend process and its config file are released on every path,
    /// including deadline expiry.
    pub async fn check(&self, descriptor: &ConnectionDescriptor) -> Result<(u16, Duration)> {
        let outbound = descriptor.to_outbound(self.config.force_tcp);
        let (port, file) = spawn_blocking(move || -> Result<(u16, ConfigFile)> {
            let port = reserve_local_port()?;
            let file = ConfigFile::write(&probe_config(outbound, port))?;
            Ok((port, file))
        })
        .await
        .map_err(join_error)??;
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let mut process = BackendProcess::new(&self.backend, file.path());
        let result = match process.start() {
            Ok(()) => match timeout(self.deadline(), self.exercise(&mut process, addr)).await {
                Ok(result) => result,
                Err(elapsed) => Err(elapsed.into()),
            },
            Err(e) => Err(e),
        };

        process.shutdown().await;
        match spawn_blocking(move || file.remove()).await.map_err(join_error) {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => warn!("Failed to remove probe config: {}", e),
        }

        result
    }

    async fn exercise(
        &self,
        process: &mut BackendProcess,
        addr: SocketAddr,
    ) -> Result<(u16, Duration)> {
        process.wait_ready(addr, self.start_timeout()).await?;
        process.begin_request();
        self.request_with_retry(addr).await
    }

    /// One attempt, and one more after a short pause if it errors
    async fn request_with_retry(&self, proxy_addr: SocketAddr) -> Result<(u16, Duration)> {
        match run_http_check(&self.curl, proxy_addr, &self.config.url, self.config.timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                debug!("First health request failed, retrying: {}", e);
                sleep(RETRY_BACKOFF).await;
                run_http_check(&self.curl, proxy_addr, &self.config.url, self.config.timeout).await
            }
        }
    }
}

/// Probe every candidate and record the outcome on it
///
/// Missing tooling degrades to marking everything `Skipped`. Only a broken
/// loopback port allocator is reported as an error.
pub async fn probe_all(candidates: &mut [Candidate], config: &HealthConfig) -> Result<()> {
    if candidates.is_empty() {
        return Ok(());
    }

    // Resolved once per stage, before any probe is in flight.
    let prober = match HealthProber::locate(config) {
        Ok(prober) => prober,
        Err(e) => {
            warn!("Health check skipped: {}", e);
            mark_skipped(candidates);
            return Ok(());
        }
    };

    // Port allocation has to work at all before any probe can.
    reserve_local_port()?;

    info!("Health test of {} candidates", candidates.len());

    let outcomes = parallel_map(candidates.iter(), config.workers, |candidate| {
        prober.probe_candidate(candidate)
    })
    .await;

    for (candidate, outcome) in candidates.iter_mut().zip(outcomes) {
        candidate.health = outcome;
    }

    let healthy = candidates.iter().filter(|c| c.health.is_ok()).count();
    info!(
        "Health test complete: {} healthy, {} not healthy",
        healthy,
        candidates.len() - healthy
    );
    Ok(())
}

fn join_error(e: tokio::task::JoinError) -> SubboxError {
    SubboxError::Io(std::io::Error::other(e))
}

pub fn mark_skipped(candidates: &mut [Candidate]) {
    for candidate in candidates {
        candidate.health = Health::Skipped;
    }
}

/// Issue one HTTP request through the local proxy with the check tool
///
/// Returns the status code and the wall-clock latency of the request.
pub async fn run_http_check(
    curl: &std::path::Path,
    proxy_addr: SocketAddr,
    url: &str,
    request_timeout: Duration,
) -> Result<(u16, Duration)> {
    let start = Instant::now();
    let output = Command::new(curl)
        .args(curl_args(proxy_addr, url, request_timeout))
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    let latency = start.elapsed();

    if !output.status.success() {
        if output.status.code() == Some(CURL_TIMEOUT_EXIT) {
            return Err(SubboxError::Timeout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let reason = if stderr.is_empty() {
            output.status.to_string()
        } else {
            stderr
        };
        return Err(SubboxError::HealthCheckFailed(reason));
    }

    let status = parse_status(&String::from_utf8_lossy(&output.stdout))
        .map_err(|e| SubboxError::HealthCheckFailed(e.to_string()))?;
    Ok((status, latency))
}

fn curl_args(proxy_addr: SocketAddr, url: &str, request_timeout: Duration) -> Vec<String> {
    let connect_timeout = request_timeout.min(MAX_CONNECT_TIMEOUT);
    vec![
        "--silent".to_string(),
        "--show-error".to_string(),
        "--output".to_string(),
        "/dev/null".to_string(),
        "--write-out".to_string(),
        "%{http_code}".to_string(),
        "--ipv4".to_string(),
        "--connect-timeout".to_string(),
        format!("{:.1}", connect_timeout.as_secs_f64()),
        "--max-time".to_string(),
        format!("{:.1}", request_timeout.as_secs_f64()),
        "--proxy".to_string(),
        format!("http://{}", proxy_addr),
        "--user-agent".to_string(),
        "subbox-health/1.0".to_string(),
        url.to_string(),
    ]
}

fn parse_status(raw: &str) -> anyhow::Result<u16> {
    let raw = raw.trim();
    if raw.is_empty() {
        anyhow::bail!("check tool returned an empty status");
    }
    raw.parse()
        .map_err(|_| anyhow::anyhow!("check tool returned a non-numeric status: {:?}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::{ProbeFailure, Reachability};
    use crate::subscription::decode_candidate;

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("204").unwrap(), 204);
        assert_eq!(parse_status(" 503\n").unwrap(), 503);
        assert_eq!(parse_status("000").unwrap(), 0);
        assert!(parse_status("").is_err());
        assert!(parse_status("abc").is_err());
    }

    #[test]
    fn test_curl_args() {
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let args = curl_args(addr, "https://example.com/204", Duration::from_secs(8));

        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--connect-timeout") + 1], "3.0");
        assert_eq!(args[pos("--max-time") + 1], "8.0");
        assert_eq!(args[pos("--proxy") + 1], "http://127.0.0.1:40000");
        assert_eq!(args.last().unwrap(), "https://example.com/204");

        let args = curl_args(addr, "http://x", Duration::from_millis(1500));
        assert_eq!(args[pos("--connect-timeout") + 1], "1.5");
    }

    #[test]
    fn test_missing_tools_skip_everything() {
        let config = HealthConfig {
            backend_bin: "/nonexistent/subbox-backend".to_string(),
            ..HealthConfig::default()
        };
        match HealthProber::locate(&config) {
            Err(SubboxError::ExecutableNotFound(name)) => {
                assert_eq!(name, "/nonexistent/subbox-backend")
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }

        let mut candidates = vec![
            decode_candidate("vless://u@127.0.0.1:1#A").unwrap(),
            decode_candidate("vless://u@127.0.0.1:2#B").unwrap(),
        ];
        tokio_test::block_on(probe_all(&mut candidates, &config)).unwrap();
        assert!(candidates.iter().all(|c| c.health == Health::Skipped));
    }

    #[cfg(unix)]
    mod with_fake_tools {
        use super::*;

        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        use tempfile::TempDir;

        fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn config_for(backend: &Path, curl: &Path, timeout: Duration) -> HealthConfig {
            HealthConfig {
                backend_bin: backend.to_string_lossy().into_owned(),
                curl_bin: curl.to_string_lossy().into_owned(),
                timeout,
                workers: 2,
                ..HealthConfig::default()
            }
        }

        fn is_alive(pid: i32) -> bool {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid), None).is_ok()
        }

        #[tokio::test]
        async fn test_failed_reachability_never_spawns() {
            let dir = TempDir::new().unwrap();
            let marker = dir.path().join("spawned");
            let backend = write_script(
                dir.path(),
                "backend",
                &format!("touch {}\nexec sleep 30", marker.display()),
            );
            let curl = write_script(dir.path(), "curl", "printf 204");

            let mut candidate = decode_candidate("vless://u@127.0.0.1:1#Down").unwrap();
            candidate.reachability = Reachability::Failed(ProbeFailure::Fail);
            let mut candidates = vec![candidate];

            probe_all(
                &mut candidates,
                &config_for(&backend, &curl, Duration::from_secs(1)),
            )
            .await
            .unwrap();

            assert_eq!(candidates[0].health, Health::Skipped);
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn test_backend_exit_before_ready_is_fail() {
            let dir = TempDir::new().unwrap();
            let backend = write_script(dir.path(), "backend", "exit 1");
            let curl = write_script(dir.path(), "curl", "printf 204");

            let mut candidates = vec![decode_candidate("vless://u@127.0.0.1:1#Crash").unwrap()];
            probe_all(
                &mut candidates,
                &config_for(&backend, &curl, Duration::from_secs(2)),
            )
            .await
            .unwrap();

            assert_eq!(candidates[0].health, Health::Failed(ProbeFailure::Fail));
        }

        #[tokio::test]
        async fn test_readiness_timeout_cleans_up() {
            let dir = TempDir::new().unwrap();
            let record = dir.path().join("record");
            // `exec` keeps the recorded pid pointing at the long-lived process.
            let backend = write_script(
                dir.path(),
                "backend",
                &format!("echo \"$$ $3\" > {}\nexec sleep 30", record.display()),
            );
            let curl = write_script(dir.path(), "curl", "printf 204");

            let prober = HealthProber::locate(&config_for(
                &backend,
                &curl,
                Duration::from_millis(100),
            ))
            .unwrap();
            assert_eq!(prober.start_timeout(), Duration::from_millis(500));

            let candidate = decode_candidate("vless://u@127.0.0.1:1#Slow").unwrap();
            let err = prober.check(candidate.descriptor()).await.unwrap_err();
            assert!(matches!(err, SubboxError::ReadinessTimeout));

            let recorded = std::fs::read_to_string(&record).unwrap();
            let mut parts = recorded.split_whitespace();
            let pid: i32 = parts.next().unwrap().parse().unwrap();
            let config_path = PathBuf::from(parts.next().unwrap());

            assert!(!config_path.exists());
            assert!(!is_alive(pid));
        }

        /// Backend script that records `<pid> <config path>` atomically, then idles
        fn recording_backend(dir: &Path, record: &Path) -> PathBuf {
            write_script(
                dir,
                "backend",
                &format!(
                    "echo \"$$ $3\" > {r}.tmp\nmv {r}.tmp {r}\nexec sleep 30",
                    r = record.display()
                ),
            )
        }

        /// Accept on the inbound port named in the recorded config, standing in
        /// for the backend's listener
        fn accept_on_recorded_port(record: PathBuf) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                let config_path = loop {
                    if let Ok(raw) = tokio::fs::read_to_string(&record).await {
                        if let Some(path) = raw.split_whitespace().nth(1) {
                            break PathBuf::from(path);
                        }
                    }
                    sleep(Duration::from_millis(10)).await;
                };
                let raw = tokio::fs::read(&config_path).await.unwrap();
                let config: serde_json::Value = serde_json::from_slice(&raw).unwrap();
                let port = config["inbounds"][0]["listen_port"].as_u64().unwrap() as u16;

                let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port))
                    .await
                    .unwrap();
                loop {
                    let _ = listener.accept().await;
                }
            })
        }

        fn read_record(record: &Path) -> (i32, PathBuf) {
            let recorded = std::fs::read_to_string(record).unwrap();
            let mut parts = recorded.split_whitespace();
            let pid = parts.next().unwrap().parse().unwrap();
            (pid, PathBuf::from(parts.next().unwrap()))
        }

        #[tokio::test]
        async fn test_ready_backend_reports_status_and_cleans_up() {
            let dir = TempDir::new().unwrap();
            let record = dir.path().join("record");
            let backend = recording_backend(dir.path(), &record);
            let curl = write_script(dir.path(), "curl", "printf 204");
            let listener = accept_on_recorded_port(record.clone());

            let mut candidates = vec![decode_candidate("vless://u@127.0.0.1:1#Up").unwrap()];
            probe_all(
                &mut candidates,
                &config_for(&backend, &curl, Duration::from_secs(2)),
            )
            .await
            .unwrap();
            listener.abort();

            assert!(matches!(
                candidates[0].health,
                Health::Ok { status: 204, .. }
            ));
            let (pid, config_path) = read_record(&record);
            assert!(!config_path.exists());
            assert!(!is_alive(pid));
        }

        #[tokio::test]
        async fn test_request_timeout_cleans_up() {
            let dir = TempDir::new().unwrap();
            let record = dir.path().join("record");
            let backend = recording_backend(dir.path(), &record);
            let curl = write_script(dir.path(), "curl", "exec sleep 30");
            let listener = accept_on_recorded_port(record.clone());

            let prober = HealthProber::locate(&config_for(
                &backend,
                &curl,
                Duration::from_millis(200),
            ))
            .unwrap();
            let candidate = decode_candidate("vless://u@127.0.0.1:1#Stuck").unwrap();
            let err = prober.check(candidate.descriptor()).await.unwrap_err();
            listener.abort();

            assert!(err.is_timeout());
            let (pid, config_path) = read_record(&record);
            assert!(!config_path.exists());
            assert!(!is_alive(pid));
        }

        #[tokio::test]
        async fn test_http_check_reports_status_and_latency() {
            let dir = TempDir::new().unwrap();
            let curl = write_script(dir.path(), "curl", "printf 503");
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

            let (status, _latency) =
                run_http_check(&curl, addr, "http://example.com", Duration::from_secs(1))
                    .await
                    .unwrap();
            // Transport succeeded, so an HTTP error status is still reported as-is.
            assert_eq!(status, 503);
        }

        #[tokio::test]
        async fn test_http_check_error_classes() {
            let dir = TempDir::new().unwrap();
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

            let timed_out = write_script(dir.path(), "curl-timeout", "exit 28");
            let err = run_http_check(&timed_out, addr, "http://x", Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(err.is_timeout());

            let refused = write_script(
                dir.path(),
                "curl-refused",
                "echo 'curl: (7) Failed to connect' >&2\nexit 7",
            );
            let err = run_http_check(&refused, addr, "http://x", Duration::from_secs(1))
                .await
                .unwrap_err();
            match err {
                SubboxError::HealthCheckFailed(reason) => assert!(reason.contains("(7)")),
                other => panic!("unexpected error: {:?}", other),
            }

            let garbage = write_script(dir.path(), "curl-garbage", "printf nope");
            let err = run_http_check(&garbage, addr, "http://x", Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, SubboxError::HealthCheckFailed(_)));
        }

        #[tokio::test]
        async fn test_request_retries_once() {
            let dir = TempDir::new().unwrap();
            let counter = dir.path().join("attempts");
            // Fails the first time, succeeds the second.
            let curl = write_script(
                dir.path(),
                "curl",
                &format!(
                    "if [ -f {c} ]; then printf 200; else touch {c}; exit 7; fi",
                    c = counter.display()
                ),
            );
            let backend = write_script(dir.path(), "backend", "exit 0");

            let prober =
                HealthProber::locate(&config_for(&backend, &curl, Duration::from_secs(1))).unwrap();
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
            let (status, _) = prober.request_with_retry(addr).await.unwrap();
            assert_eq!(status, 200);
        }
    }
}
