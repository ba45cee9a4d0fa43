//! Client configuration and endpoint parsing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cred::CredentialsProvider;
use crate::error::{KestrelError, KestrelResult};

/// Cleartext endpoint scheme and its default port.
pub const SCHEME_CLEARTEXT: &str = "dax";
/// Encrypted endpoint scheme and its default port.
pub const SCHEME_ENCRYPTED: &str = "daxs";

/// Process-wide default port map.
pub fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        SCHEME_CLEARTEXT => Some(8111),
        SCHEME_ENCRYPTED => Some(9111),
        _ => None,
    }
}

/// A node address: the canonical key for active cluster members.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> HostPort {
        HostPort { host: host.into(), port }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-connection transport settings derived from the seed endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnConfig {
    pub is_encrypted: bool,
    pub hostname: String,
    pub skip_hostname_verification: bool,
}

fn default_max_pending_connections() -> i32 {
    10
}
fn default_cluster_update_interval_ms() -> u64 {
    4_000
}
fn default_cluster_update_threshold_ms() -> u64 {
    125
}
fn default_idle_connection_reap_delay_ms() -> u64 {
    30_000
}
fn default_client_health_check_interval_ms() -> u64 {
    5_000
}
fn default_fail_open_window_ms() -> u64 {
    1_000
}

/// Top-level client configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seed endpoints, each `scheme://host[:port]`.
    pub host_ports: Vec<String>,
    /// Signing region.
    pub region: String,
    /// Credential provider. Required.
    #[serde(skip)]
    pub credentials: Option<Arc<dyn CredentialsProvider>>,
    /// Dial gate width per host.
    #[serde(default = "default_max_pending_connections")]
    pub max_pending_connections_per_host: i32,
    /// Cluster refresh cadence.
    #[serde(default = "default_cluster_update_interval_ms")]
    pub cluster_update_interval_ms: u64,
    /// Minimum interval between roster pulls.
    #[serde(default = "default_cluster_update_threshold_ms")]
    pub cluster_update_threshold_ms: u64,
    /// Idle-connection reap cadence and maximum idle age.
    #[serde(default = "default_idle_connection_reap_delay_ms")]
    pub idle_connection_reap_delay_ms: u64,
    /// Per-node health probe cadence; also the fail-open disable duration.
    #[serde(default = "default_client_health_check_interval_ms")]
    pub client_health_check_interval_ms: u64,
    /// Window within which three consecutive route removals trigger the
    /// fail-open state.
    #[serde(default = "default_fail_open_window_ms")]
    pub fail_open_window_ms: u64,
    /// Skip TLS hostname verification.
    #[serde(default)]
    pub skip_hostname_verification: bool,
    /// Enables route eviction on consecutive I/O errors.
    #[serde(default)]
    pub route_manager_enabled: bool,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host_ports", &self.host_ports)
            .field("region", &self.region)
            .field("max_pending_connections_per_host", &self.max_pending_connections_per_host)
            .field("cluster_update_interval_ms", &self.cluster_update_interval_ms)
            .field("cluster_update_threshold_ms", &self.cluster_update_threshold_ms)
            .field("idle_connection_reap_delay_ms", &self.idle_connection_reap_delay_ms)
            .field("client_health_check_interval_ms", &self.client_health_check_interval_ms)
            .field("fail_open_window_ms", &self.fail_open_window_ms)
            .field("skip_hostname_verification", &self.skip_hostname_verification)
            .field("route_manager_enabled", &self.route_manager_enabled)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            host_ports: Vec::new(),
            region: String::new(),
            credentials: None,
            max_pending_connections_per_host: default_max_pending_connections(),
            cluster_update_interval_ms: default_cluster_update_interval_ms(),
            cluster_update_threshold_ms: default_cluster_update_threshold_ms(),
            idle_connection_reap_delay_ms: default_idle_connection_reap_delay_ms(),
            client_health_check_interval_ms: default_client_health_check_interval_ms(),
            fail_open_window_ms: default_fail_open_window_ms(),
            skip_hostname_verification: false,
            route_manager_enabled: false,
        }
    }
}

impl Config {
    pub fn cluster_update_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_update_interval_ms)
    }
    pub fn cluster_update_threshold(&self) -> Duration {
        Duration::from_millis(self.cluster_update_threshold_ms)
    }
    pub fn idle_connection_reap_delay(&self) -> Duration {
        Duration::from_millis(self.idle_connection_reap_delay_ms)
    }
    pub fn client_health_check_interval(&self) -> Duration {
        Duration::from_millis(self.client_health_check_interval_ms)
    }
    pub fn fail_open_window(&self) -> Duration {
        Duration::from_millis(self.fail_open_window_ms)
    }

    /// Validate required options and derive the transport settings from the
    /// seed endpoints.
    pub fn validate(&self) -> KestrelResult<(Vec<HostPort>, ConnConfig)> {
        if self.host_ports.is_empty() {
            return Err(KestrelError::param("host_ports", "at least one seed endpoint is required"));
        }
        if self.region.is_empty() {
            return Err(KestrelError::param("region", "signing region is required"));
        }
        if self.credentials.is_none() {
            return Err(KestrelError::param("credentials", "a credentials provider is required"));
        }
        if self.max_pending_connections_per_host < 0 {
            return Err(KestrelError::param(
                "max_pending_connections_per_host",
                "cannot be negative",
            ));
        }

        let (seeds, hostname, is_encrypted) = parse_seed_endpoints(&self.host_ports)?;
        let conn = ConnConfig {
            is_encrypted,
            hostname,
            skip_hostname_verification: self.skip_hostname_verification,
        };
        if conn.is_encrypted && conn.skip_hostname_verification {
            tracing::warn!(
                "hostname verification of TLS connections is disabled; the client cannot \
                 authenticate the cluster it connects to"
            );
        }
        Ok((seeds, conn))
    }
}

/// Parse the seed endpoint list, enforcing scheme consistency and the
/// single-seed rule for encrypted clusters.
pub fn parse_seed_endpoints(hosts: &[String]) -> KestrelResult<(Vec<HostPort>, String, bool)> {
    let mut out = Vec::with_capacity(hosts.len());
    let mut hostname = String::new();
    let mut is_encrypted = false;

    for (i, hp) in hosts.iter().enumerate() {
        let (host, port, scheme) = parse_host_port(hp)?;
        let encrypted = scheme == SCHEME_ENCRYPTED;
        if encrypted != is_encrypted {
            if i == 0 {
                is_encrypted = true;
            } else {
                return Err(KestrelError::param(
                    "host_ports",
                    "inconsistency between the schemes of provided endpoints",
                ));
            }
        }
        if encrypted && i > 0 {
            return Err(KestrelError::param(
                "host_ports",
                "only one cluster discovery endpoint may be provided for an encrypted cluster",
            ));
        }
        hostname = host.clone();
        out.push(HostPort { host, port });
    }
    Ok((out, hostname, is_encrypted))
}

/// Parse one `scheme://host[:port]` endpoint. A missing scheme defaults to
/// the cleartext scheme; a missing port defaults per scheme.
pub fn parse_host_port(endpoint: &str) -> KestrelResult<(String, u16, String)> {
    let invalid = || KestrelError::param("host_ports", format!("invalid endpoint {endpoint:?}"));

    let (scheme, rest) = match endpoint.split_once("://") {
        Some((s, r)) => (s.to_string(), r),
        None => {
            if !endpoint.contains(':') {
                return Err(invalid());
            }
            (SCHEME_CLEARTEXT.to_string(), endpoint)
        }
    };

    let Some(scheme_default) = default_port(&scheme) else {
        return Err(KestrelError::param(
            "host_ports",
            format!("URL scheme must be one of {SCHEME_CLEARTEXT},{SCHEME_ENCRYPTED}"),
        ));
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().map_err(|_| invalid())?),
        None => (rest, scheme_default),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port, scheme))
}
