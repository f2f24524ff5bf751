//! Host configuration.
//!
//! All settings have defaults, can be loaded from a JSON file, and can be
//! overridden by `MOOR_*` environment variables:
//!
//! ```text
//! MOOR_REGISTRATION_HOST      registration_host
//! MOOR_REGISTRATION_PORT      registration_port
//! MOOR_PORT_RANGE             port_range            ("from:to", either side optional)
//! MOOR_CONNECT_TIMEOUT_MS     connect_timeout_ms
//! MOOR_POOL_SIZE              connection_pool_size
//! MOOR_STOP_GRACE_MS          stop_grace_period_ms
//! MOOR_POLL_INTERVAL_MS       poll_interval_ms
//! MOOR_MAX_CONCURRENCY        max_concurrency
//! MOOR_IMPERSONATE            impersonation_enabled
//! MOOR_IMPERSONATION_EXEMPT   impersonation_exempt  (comma separated)
//! MOOR_ONE_SHOT_LAUNCH        one_shot_launch
//! MOOR_OUTPUT_CAPTURE_LIMIT   output_capture_limit
//! MOOR_REMOTE_HOST            remote_host
//! MOOR_REMOTE_SHELL           remote_shell
//! MOOR_INTERPRETER_DIR        interpreter_dir
//! MOOR_LOCAL_REPO_DIR         local_repo_dir
//! MOOR_WORKER_PATH            worker_path
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings shared by every worker the host launches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Address the registration listener binds to and advertises to workers.
    pub registration_host: String,
    /// Registration listener port. `0` picks an ephemeral port.
    pub registration_port: u16,
    /// Ports the worker may bind its RPC listener to.
    pub port_range: String,
    /// How long `start()` waits for the worker to register.
    pub connect_timeout_ms: u64,
    /// Maximum pooled RPC connections per worker.
    pub connection_pool_size: usize,
    /// Time between SIGTERM and SIGKILL when stopping a worker.
    pub stop_grace_period_ms: u64,
    /// Statement status polling interval.
    pub poll_interval_ms: u64,
    /// Concurrent statements admitted per worker group.
    pub max_concurrency: usize,
    /// Pass `--user` to workers for impersonated launches.
    pub impersonation_enabled: bool,
    /// Principals never impersonated even when impersonation is on.
    pub impersonation_exempt: Vec<String>,
    /// The launcher hands off to a cluster and exits 0 before the worker
    /// registers. Such an exit is not a launch failure in this mode.
    pub one_shot_launch: bool,
    /// Bytes of launch output kept for diagnostics.
    pub output_capture_limit: usize,
    /// Run workers on this host through `remote_shell`.
    pub remote_host: Option<String>,
    /// Remote shell used when `remote_host` is set.
    pub remote_shell: String,
    /// Interpreter runtime directory passed to workers.
    pub interpreter_dir: PathBuf,
    /// Local dependency repository directory passed to workers.
    pub local_repo_dir: PathBuf,
    /// Explicit worker runner. Resolved automatically when unset.
    pub worker_path: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            registration_host: "127.0.0.1".to_string(),
            registration_port: 0,
            port_range: ":".to_string(),
            connect_timeout_ms: 60_000,
            connection_pool_size: 10,
            stop_grace_period_ms: 3_000,
            poll_interval_ms: 500,
            max_concurrency: 10,
            impersonation_enabled: false,
            impersonation_exempt: vec!["anonymous".to_string()],
            one_shot_launch: false,
            output_capture_limit: 64 * 1024,
            remote_host: None,
            remote_shell: "ssh".to_string(),
            interpreter_dir: PathBuf::from("."),
            local_repo_dir: PathBuf::from("local-repo"),
            worker_path: None,
        }
    }
}

impl HostConfig {
    /// Load a configuration file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MOOR_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("MOOR_REGISTRATION_HOST") {
            self.registration_host = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_REGISTRATION_PORT")? {
            self.registration_port = v;
        }
        if let Some(v) = lookup("MOOR_PORT_RANGE") {
            self.port_range = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_CONNECT_TIMEOUT_MS")? {
            self.connect_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_POOL_SIZE")? {
            self.connection_pool_size = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_STOP_GRACE_MS")? {
            self.stop_grace_period_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_MAX_CONCURRENCY")? {
            self.max_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_IMPERSONATE")? {
            self.impersonation_enabled = v;
        }
        if let Some(v) = lookup("MOOR_IMPERSONATION_EXEMPT") {
            self.impersonation_exempt = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = parse_var(&lookup, "MOOR_ONE_SHOT_LAUNCH")? {
            self.one_shot_launch = v;
        }
        if let Some(v) = parse_var(&lookup, "MOOR_OUTPUT_CAPTURE_LIMIT")? {
            self.output_capture_limit = v;
        }
        if let Some(v) = lookup("MOOR_REMOTE_HOST") {
            self.remote_host = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup("MOOR_REMOTE_SHELL") {
            self.remote_shell = v;
        }
        if let Some(v) = lookup("MOOR_INTERPRETER_DIR") {
            self.interpreter_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MOOR_LOCAL_REPO_DIR") {
            self.local_repo_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MOOR_WORKER_PATH") {
            self.worker_path = Some(PathBuf::from(v));
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings no worker could run with.
    pub fn validate(&self) -> Result<()> {
        if self.connection_pool_size == 0 {
            return Err(Error::Config("connection_pool_size must be at least 1".to_string()));
        }
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::Config("connect_timeout_ms must be positive".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        self.port_range.parse::<PortRange>()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_millis(self.stop_grace_period_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        None => Ok(None),
    }
}

/// Inclusive port range in `from:to` form. Either bound may be omitted;
/// `:` means any free port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRange {
    pub from: Option<u16>,
    pub to: Option<u16>,
}

/// Lowest port tried when only the upper bound is given.
const UNPRIVILEGED_PORT_FLOOR: u16 = 1024;

impl PortRange {
    pub fn any() -> Self {
        Self::default()
    }

    /// Ports to try, in order. `[0]` for an unrestricted range.
    pub fn candidates(&self) -> Box<dyn Iterator<Item = u16> + Send> {
        match (self.from, self.to) {
            (None, None) => Box::new(std::iter::once(0)),
            (Some(from), None) => Box::new(from..=u16::MAX),
            (None, Some(to)) => Box::new(UNPRIVILEGED_PORT_FLOOR.min(to)..=to),
            (Some(from), Some(to)) => Box::new(from..=to),
        }
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("port range {s:?} must look like from:to")))?;
        let bound = |part: &str| -> Result<Option<u16>> {
            let part = part.trim();
            if part.is_empty() {
                return Ok(None);
            }
            part.parse()
                .map(Some)
                .map_err(|e| Error::Config(format!("invalid port {part:?} in range {s:?}: {e}")))
        };
        let range = Self {
            from: bound(from)?,
            to: bound(to)?,
        };
        if let (Some(from), Some(to)) = (range.from, range.to)
            && from > to
        {
            return Err(Error::Config(format!("port range {s:?} is empty")));
        }
        Ok(range)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = |p: Option<u16>| p.map(|p| p.to_string()).unwrap_or_default();
        write!(f, "{}:{}", side(self.from), side(self.to))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = HostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.impersonation_exempt, vec!["anonymous".to_string()]);
        assert_eq!(config.max_concurrency, 10);
        assert!(!config.one_shot_launch);
    }

    #[test]
    fn test_from_file_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "connect_timeout_ms": 2000, "one_shot_launch": true, "remote_host": "emr-header-1" }}"#
        )
        .unwrap();

        let config = HostConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
        assert!(config.one_shot_launch);
        assert_eq!(config.remote_host.as_deref(), Some("emr-header-1"));
        assert_eq!(config.connection_pool_size, 10);
    }

    #[test]
    fn test_from_file_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = HostConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MOOR_MAX_CONCURRENCY", "3"),
            ("MOOR_IMPERSONATE", "true"),
            ("MOOR_IMPERSONATION_EXEMPT", "anonymous, guest"),
            ("MOOR_PORT_RANGE", "30000:30100"),
        ]
        .into_iter()
        .collect();

        let config = HostConfig::default()
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert!(config.impersonation_enabled);
        assert_eq!(config.impersonation_exempt, vec!["anonymous", "guest"]);
        assert_eq!(config.port_range, "30000:30100");
    }

    #[test]
    fn test_env_override_parse_error_names_key() {
        let err = HostConfig::default()
            .apply_overrides(|k| (k == "MOOR_POOL_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MOOR_POOL_SIZE"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = HostConfig::default()
            .apply_overrides(|k| (k == "MOOR_MAX_CONCURRENCY").then(|| "0".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }

    #[test]
    fn test_port_range_parsing() {
        assert_eq!(":".parse::<PortRange>().unwrap(), PortRange::any());
        assert_eq!(PortRange::any().candidates().collect::<Vec<_>>(), vec![0]);

        let range: PortRange = "40000:40002".parse().unwrap();
        assert_eq!(range.candidates().collect::<Vec<_>>(), vec![40000, 40001, 40002]);
        assert_eq!(range.to_string(), "40000:40002");

        let open_top: PortRange = "65534:".parse().unwrap();
        assert_eq!(open_top.candidates().collect::<Vec<_>>(), vec![65534, 65535]);

        assert!("9000".parse::<PortRange>().is_err());
        assert!("9001:9000".parse::<PortRange>().is_err());
        assert!("a:b".parse::<PortRange>().is_err());
    }
}
