// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    cfg::enums::{
        DnsStrategy, ErrorStrategy, ProtocolVersion, QueueFullPolicy, SentinelRole,
        TrackingMode,
    },
    resilience::retry::BackoffStrategy,
};

/// Where a server lives: a TCP endpoint or a local IPC socket path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerAddr {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

pub const DEFAULT_PORT: u16 = 6379;

impl ServerAddr {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        ServerAddr::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        ServerAddr::Unix { path: path.into() }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerAddr::Tcp { host, port } => write!(f, "{host}:{port}"),
            ServerAddr::Unix { path } => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for ServerAddr {
    type Err = anyhow::Error;

    /// `host[:port]`, or `unix:<path>` / an absolute path for IPC.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(ServerAddr::unix(path));
        }
        if s.starts_with('/') {
            return Ok(ServerAddr::unix(s));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .with_context(|| format!("invalid port in address {s:?}"))?;
                ensure!(!host.is_empty(), "empty host in address {s:?}");
                Ok(ServerAddr::tcp(host, port))
            },
            None => {
                ensure!(!s.is_empty(), "empty address");
                Ok(ServerAddr::tcp(s, DEFAULT_PORT))
            },
        }
    }
}

impl Serialize for ServerAddr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServerAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Client configuration. Unknown options are rejected at parse time
/// (`deny_unknown_fields`) so a typo never silently disables a knob.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// One or more server endpoints. Multiple entries are walked with
    /// the configured DNS strategy.
    #[serde(default = "default_address")]
    pub address: Vec<ServerAddr>,

    /// Wire protocol to negotiate; version 3 unless pinned to 2.
    #[serde(default = "default_protocol")]
    pub protocol_version: ProtocolVersion,

    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// `SELECT`ed after the handshake when non-zero.
    #[serde(default)]
    pub database_index: u32,

    /// Registered via `CLIENT SETNAME` after the handshake.
    #[serde(default)]
    pub client_name: Option<String>,

    /// TLS transport settings; absent means plain TCP.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Default per-operation deadline: bounds connect, each read fill
    /// and each write flush.
    #[serde(default = "default_timeout", rename = "timeout_ms", with = "serde_millis")]
    pub timeout: Duration,

    #[serde(default)]
    pub dns_strategy: DnsStrategy,

    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub tracking: Option<TrackingConfig>,
    #[serde(default)]
    pub sentinel: Option<SentinelConfig>,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub event: EventConfig,
}

fn default_address() -> Vec<ServerAddr> {
    vec![ServerAddr::tcp("localhost", DEFAULT_PORT)]
}

fn default_protocol() -> ProtocolVersion {
    ProtocolVersion::Resp3
}

fn default_timeout() -> Duration {
    Duration::from_millis(5_000)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: default_address(),
            protocol_version: default_protocol(),
            username: None,
            password: None,
            database_index: 0,
            client_name: None,
            tls: None,
            timeout: default_timeout(),
            dns_strategy: DnsStrategy::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            tracking: None,
            sentinel: None,
            cluster: ClusterConfig::default(),
            event: EventConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Certificate verification; on unless explicitly disabled.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Extra CA bundle (PEM). Web-PKI roots are trusted regardless.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain (PEM) for mutual TLS.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// Private key (PEM) matching `cert_file`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    #[serde(default)]
    pub min_version: Option<TlsVersion>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_file: None,
            cert_file: None,
            key_file: None,
            min_version: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    #[serde(rename = "1.2")]
    Tls12,
    #[serde(rename = "1.3")]
    Tls13,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Fixed maximum number of live connections.
    #[serde(default = "default_pool_size")]
    pub size: usize,
    /// How long a checkout waits before reporting exhaustion.
    #[serde(default = "default_pool_wait", rename = "wait_ms", with = "serde_millis")]
    pub wait: Duration,
    /// Interval for the idle-connection ping loop; absent disables it.
    #[serde(
        default,
        rename = "health_interval_ms",
        with = "serde_opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub health_interval: Option<Duration>,
}

fn default_pool_size() -> usize {
    8
}

fn default_pool_wait() -> Duration {
    Duration::from_millis(5_000)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            wait: default_pool_wait(),
            health_interval: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Upper bound on attempts for one caller operation.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// How long the breaker stays open before probing.
    #[serde(default = "default_open_for", rename = "open_ms", with = "serde_millis")]
    pub open_for: Duration,
    /// Longest stay in half-open without a successful probe.
    #[serde(
        default = "default_half_open_for",
        rename = "half_open_ms",
        with = "serde_millis"
    )]
    pub half_open_for: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_for() -> Duration {
    Duration::from_millis(30_000)
}

fn default_half_open_for() -> Duration {
    Duration::from_millis(10_000)
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_for: default_open_for(),
            half_open_for: default_half_open_for(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfig {
    #[serde(default)]
    pub mode: TrackingMode,
    /// Key prefixes for broadcast mode.
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    /// Safety-net TTL for cached entries.
    #[serde(
        default,
        rename = "ttl_ms",
        with = "serde_opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub ttl: Option<Duration>,
}

fn default_max_entries() -> usize {
    10_000
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SentinelConfig {
    pub endpoints: Vec<ServerAddr>,
    /// Logical master name the sentinels monitor.
    pub service_name: String,
    #[serde(default)]
    pub role: SentinelRole,
    /// Reject a sentinel answer unless at least this many peer
    /// sentinels agree the master is up.
    #[serde(default)]
    pub min_other_sentinels: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Periodic slot-map refresh; absent refreshes only on MOVED.
    #[serde(
        default,
        rename = "refresh_ms",
        with = "serde_opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh: Option<Duration>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct EventConfig {
    /// Worker tasks for async event dispatch; absent dispatches
    /// synchronously on the publishing task.
    #[serde(default)]
    pub executor_pool_size: Option<usize>,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default)]
    pub queue_full: QueueFullPolicy,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
}

fn default_queue_size() -> usize {
    1_024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            executor_pool_size: None,
            queue_size: default_queue_size(),
            queue_full: QueueFullPolicy::default(),
            error_strategy: ErrorStrategy::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns
    /// the ready-to-use value. Relative paths are taken from the
    /// working directory, so the error names the file it actually
    /// tried.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .context("cannot resolve the working directory")?
                .join(path)
        };
        let raw = fs::read_to_string(&resolved).with_context(|| {
            format!("cannot read client config {}", resolved.display())
        })?;
        let cfg: Config = serde_yaml::from_str(&raw).with_context(|| {
            format!("client config {} is not valid YAML", resolved.display())
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates cross-field invariants the type system cannot.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.address.is_empty(), "address list must not be empty");
        ensure!(self.pool.size >= 1, "pool.size must be >= 1");
        ensure!(
            self.retry.max_attempts >= 1,
            "retry.max_attempts must be >= 1"
        );
        ensure!(
            self.circuit.failure_threshold >= 1,
            "circuit.failure_threshold must be >= 1"
        );
        ensure!(
            self.circuit.success_threshold >= 1,
            "circuit.success_threshold must be >= 1"
        );
        ensure!(
            !self.timeout.is_zero(),
            "timeout_ms must be greater than zero"
        );
        if let Some(tracking) = &self.tracking {
            ensure!(
                self.protocol_version == ProtocolVersion::Resp3,
                "tracking requires protocol_version 3"
            );
            ensure!(
                tracking.max_entries >= 1,
                "tracking.max_entries must be >= 1"
            );
            if tracking.mode != TrackingMode::Broadcast {
                ensure!(
                    tracking.prefixes.is_empty(),
                    "tracking.prefixes only apply to broadcast mode"
                );
            }
        }
        if let Some(sentinel) = &self.sentinel {
            ensure!(
                !sentinel.endpoints.is_empty(),
                "sentinel.endpoints must not be empty"
            );
            ensure!(
                !sentinel.service_name.is_empty(),
                "sentinel.service_name must not be empty"
            );
            ensure!(
                !self.cluster.enabled,
                "sentinel discovery and cluster routing are mutually exclusive"
            );
        }
        if self.username.is_some() {
            ensure!(
                self.password.is_some(),
                "username requires a password"
            );
        }
        Ok(())
    }

    /// Credentials as the handshake wants them.
    pub fn auth_pair(&self) -> Option<(&str, &str)> {
        self.password
            .as_deref()
            .map(|pass| (self.username.as_deref().unwrap_or("default"), pass))
    }
}

/// Serde helpers representing `Duration` as whole milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod serde_opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}
