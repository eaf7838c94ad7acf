//! Server configuration
//!
//! Every setting can be given explicitly with a `with_*` setter. Accessors
//! resolve the explicit value first, then fall back to the environment:
//! - PORT                      - bind port when no bind string is set
//! - PID_FILE                  - where to write the pid
//! - LOG_LEVEL                 - tracing level (default info)
//! - TLS_VERSION               - enables TLS (TLSv1_2 or TLSv1_3)
//! - TLS_KEY / TLS_CERTIFICATE - paths to PEM files
//! - VERIFY_CLIENT_TLS         - require client certificates (true/1)
//! - CLIENT_TLS_CERTIFICATE_CA - path to the client CA bundle
//! - ALLOWED_NETWORKS          - comma-separated CIDR allow-list
//! - APP_ROOT                  - working directory for a restarted successor
//!
//! The environment is captured once when the configuration is created.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TLS versions that may be passed to [`Configuration::with_tls_version`]
pub const AVAILABLE_TLS_VERSIONS: &[&str] = &["TLSv1_2", "TLSv1_3"];

/// Default address when only a port is configured
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";

/// Default time a spawned successor has to collect the listening socket
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Default upper bound on a single multiplexed wait
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for one server instance
#[derive(Clone)]
pub struct Configuration {
    bind: Option<String>,
    bind_port: Option<u16>,
    bind_address: Option<String>,
    pidfile_path: Option<PathBuf>,
    start_command: Option<Vec<String>>,
    log_path: Option<PathBuf>,
    log_level: Option<String>,
    tls_version: Option<String>,
    tls_key: Option<String>,
    tls_certificate: Option<String>,
    verify_client_tls_certificate: Option<bool>,
    client_tls_certificate_ca: Option<String>,
    allowed_networks: Option<Vec<String>>,
    handoff_timeout: Duration,
    poll_interval: Duration,
    env: HashMap<String, String>,
}

impl Configuration {
    /// Create a configuration that falls back to the current process environment
    pub fn new() -> Self {
        Self::with_environment(std::env::vars())
    }

    /// Create a configuration that falls back to the given variables only
    pub fn with_environment<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            bind: None,
            bind_port: None,
            bind_address: None,
            pidfile_path: None,
            start_command: None,
            log_path: None,
            log_level: None,
            tls_version: None,
            tls_key: None,
            tls_certificate: None,
            verify_client_tls_certificate: None,
            client_tls_certificate_ca: None,
            allowed_networks: None,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            env: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = Some(bind.into());
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = Some(port);
        self
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }

    pub fn with_pidfile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pidfile_path = Some(path.into());
        self
    }

    /// Command line used to launch a successor: program followed by its arguments
    pub fn with_start_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start_command = Some(argv.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn with_tls_version(mut self, version: impl Into<String>) -> Self {
        self.tls_version = Some(version.into());
        self
    }

    /// PEM-encoded private key
    pub fn with_tls_key(mut self, pem: impl Into<String>) -> Self {
        self.tls_key = Some(pem.into());
        self
    }

    /// PEM-encoded certificate chain
    pub fn with_tls_certificate(mut self, pem: impl Into<String>) -> Self {
        self.tls_certificate = Some(pem.into());
        self
    }

    pub fn with_verify_client_tls_certificate(mut self, verify: bool) -> Self {
        self.verify_client_tls_certificate = Some(verify);
        self
    }

    /// PEM-encoded CA bundle used to verify client certificates
    pub fn with_client_tls_certificate_ca(mut self, pem: impl Into<String>) -> Self {
        self.client_tls_certificate_ca = Some(pem.into());
        self
    }

    pub fn with_allowed_networks<I, S>(mut self, networks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_networks = Some(networks.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_handoff_timeout(mut self, timeout: Duration) -> Self {
        self.handoff_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// URI to bind to, falls back to `tcp://{bind_address}:{bind_port}`
    pub fn bind(&self) -> Result<String> {
        match &self.bind {
            Some(bind) => Ok(bind.clone()),
            None => Ok(format!("tcp://{}:{}", self.bind_address(), self.bind_port()?)),
        }
    }

    /// Port to bind to, falls back to PORT
    pub fn bind_port(&self) -> Result<u16> {
        if let Some(port) = self.bind_port {
            return Ok(port);
        }
        let port = self
            .env_var("PORT")
            .ok_or_else(|| Error::config("You must configure a bind_port"))?;
        port.trim()
            .parse()
            .map_err(|_| Error::config(format!("PORT is not a valid port number: \"{port}\"")))
    }

    pub fn bind_address(&self) -> &str {
        self.bind_address.as_deref().unwrap_or(DEFAULT_BIND_ADDRESS)
    }

    /// Where to write the pid, falls back to PID_FILE. None disables the pidfile.
    pub fn pidfile_path(&self) -> Option<PathBuf> {
        self.pidfile_path
            .clone()
            .or_else(|| self.env_var("PID_FILE").map(PathBuf::from))
    }

    /// Command used to re-execute the server on hot restart
    pub fn start_command(&self) -> Result<&[String]> {
        match self.start_command.as_deref() {
            Some(argv) if !argv.is_empty() => Ok(argv),
            _ => Err(Error::config("You must configure a start_command")),
        }
    }

    /// Log file, None means stdout
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// Log level, falls back to LOG_LEVEL, then `info`
    pub fn log_level(&self) -> String {
        self.log_level
            .clone()
            .or_else(|| self.env_var("LOG_LEVEL"))
            .unwrap_or_else(|| "info".to_string())
    }

    /// TLS version, falls back to TLS_VERSION. None means the server is unencrypted.
    pub fn tls_version(&self) -> Result<Option<String>> {
        let Some(version) = self.tls_version.clone().or_else(|| self.env_var("TLS_VERSION")) else {
            return Ok(None);
        };
        if !AVAILABLE_TLS_VERSIONS.contains(&version.as_str()) {
            return Err(Error::config(format!(
                "Please ensure tls_version is one of {}",
                AVAILABLE_TLS_VERSIONS.join(", ")
            )));
        }
        Ok(Some(version))
    }

    /// Private key PEM, falls back to reading the file named by TLS_KEY
    pub fn tls_key(&self) -> Result<Option<String>> {
        self.pem_setting(&self.tls_key, "TLS_KEY")
    }

    /// Certificate PEM, falls back to reading the file named by TLS_CERTIFICATE
    pub fn tls_certificate(&self) -> Result<Option<String>> {
        self.pem_setting(&self.tls_certificate, "TLS_CERTIFICATE")
    }

    pub fn verify_client_tls_certificate(&self) -> bool {
        self.verify_client_tls_certificate.unwrap_or_else(|| {
            self.env_var("VERIFY_CLIENT_TLS")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        })
    }

    /// Client CA PEM, falls back to reading the file named by CLIENT_TLS_CERTIFICATE_CA
    pub fn client_tls_certificate_ca(&self) -> Result<Option<String>> {
        self.pem_setting(&self.client_tls_certificate_ca, "CLIENT_TLS_CERTIFICATE_CA")
    }

    /// CIDR ranges allowed to connect, falls back to ALLOWED_NETWORKS
    pub fn allowed_networks(&self) -> Vec<String> {
        if let Some(networks) = &self.allowed_networks {
            return networks.clone();
        }
        self.env_var("ALLOWED_NETWORKS")
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Should connections be checked against [`Configuration::allowed_networks`]?
    pub fn block_connections(&self) -> bool {
        !self.allowed_networks().is_empty()
    }

    /// Working directory for a restarted successor, from APP_ROOT
    pub fn app_root(&self) -> Option<PathBuf> {
        self.env_var("APP_ROOT").map(PathBuf::from)
    }

    pub fn handoff_timeout(&self) -> Duration {
        self.handoff_timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn env_var(&self, key: &str) -> Option<String> {
        self.env.get(key).filter(|v| !v.is_empty()).cloned()
    }

    fn pem_setting(&self, explicit: &Option<String>, var: &str) -> Result<Option<String>> {
        if let Some(pem) = explicit {
            return Ok(Some(pem.clone()));
        }
        match self.env_var(var) {
            Some(path) => fs::read_to_string(&path)
                .map(Some)
                .map_err(|e| Error::config(format!("Failed to read {var} from {path}: {e}"))),
            None => Ok(None),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

// Key material stays out of debug output.
impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("bind", &self.bind)
            .field("bind_port", &self.bind_port)
            .field("bind_address", &self.bind_address)
            .field("pidfile_path", &self.pidfile_path)
            .field("start_command", &self.start_command)
            .field("log_path", &self.log_path)
            .field("log_level", &self.log_level)
            .field("tls_version", &self.tls_version)
            .field("allowed_networks", &self.allowed_networks)
            .field("handoff_timeout", &self.handoff_timeout)
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}
