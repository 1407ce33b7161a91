//! Daemon configuration.
//!
//! Configuration is a TOML file deserialized into [`AuthdConfig`]; every
//! value has a default so a missing file yields a runnable (if useless in
//! production) configuration, and the CLI can override the fields it
//! exposes. Unknown keys are rejected so a typo fails loudly at startup
//! instead of silently running with defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path of the config file.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path of the config file.
        path: String,
        /// The underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A field combination is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthdConfig {
    /// Enrollment daemon settings.
    pub authd: AuthdSection,
    /// Cluster topology.
    pub cluster: ClusterSection,
    /// Agents database sidecar.
    pub agents_db: AgentsDbSection,
}

/// The `[authd]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuthdSection {
    /// TCP port for remote enrollment.
    pub port: u16,
    /// Listen on IPv6 instead of IPv4.
    pub ipv6: bool,
    /// Connection pool capacity: accepted clients waiting for dispatch.
    pub pool_size: usize,
    /// Receive timeout in seconds for accepted sockets; 0 disables it.
    pub recv_timeout_secs: u64,
    /// Whether the remote enrollment listener runs at all.
    pub remote_enrollment: bool,
    /// Canonical key file.
    pub keys_file: PathBuf,
    /// Registration timestamp sidecar.
    pub timestamps_file: PathBuf,
    /// Directory holding per-agent state artifacts cleaned up on removal.
    pub state_dir: PathBuf,
    /// Enrollment password settings.
    pub password: PasswordSection,
    /// TLS material.
    pub tls: TlsSection,
    /// Forced-replacement policy.
    pub force: ForceSection,
}

impl Default for AuthdSection {
    fn default() -> Self {
        Self {
            port: 1515,
            ipv6: false,
            pool_size: 1000,
            recv_timeout_secs: 30,
            remote_enrollment: true,
            keys_file: PathBuf::from("/var/lib/muster/agent.keys"),
            timestamps_file: PathBuf::from("/var/lib/muster/agents-timestamp"),
            state_dir: PathBuf::from("/var/lib/muster/state"),
            password: PasswordSection::default(),
            tls: TlsSection::default(),
            force: ForceSection::default(),
        }
    }
}

/// The `[authd.password]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PasswordSection {
    /// Require an enrollment password.
    pub enabled: bool,
    /// File holding the password; when absent or unreadable a random
    /// password is generated and logged at startup.
    pub file: PathBuf,
}

impl Default for PasswordSection {
    fn default() -> Self {
        Self {
            enabled: false,
            file: PathBuf::from("/var/lib/muster/authd.pass"),
        }
    }
}

/// The `[authd.tls]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TlsSection {
    /// Server certificate chain (PEM).
    pub server_cert: PathBuf,
    /// Server private key (PEM).
    pub server_key: PathBuf,
    /// CA bundle used to verify agent client certificates. When unset,
    /// client certificates are neither requested nor verified.
    pub agent_ca: Option<PathBuf>,
    /// With `agent_ca`, additionally require the certificate to name the
    /// agent's source address.
    pub verify_host: bool,
    /// Minimum TLS version: `"1.2"` or `"1.3"`.
    pub min_version: String,
}

impl Default for TlsSection {
    fn default() -> Self {
        Self {
            server_cert: PathBuf::from("/var/lib/muster/manager.cert"),
            server_key: PathBuf::from("/var/lib/muster/manager.key"),
            agent_ca: None,
            verify_host: false,
            min_version: "1.2".to_string(),
        }
    }
}

/// The `[authd.force]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ForceSection {
    /// Permit a new enrollment to displace an existing agent with the same
    /// name or source address.
    pub enabled: bool,
}

/// The `[cluster]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ClusterSection {
    /// This node is part of a cluster.
    pub enabled: bool,
    /// This node is a worker: enrollment writes are forwarded to the
    /// master and no local keystore mutation happens.
    pub worker: bool,
    /// Local socket of the channel to the master node.
    pub master_socket: PathBuf,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            enabled: false,
            worker: false,
            master_socket: PathBuf::from("/run/muster/cluster.sock"),
        }
    }
}

/// The `[agents_db]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AgentsDbSection {
    /// Local socket of the agents database service.
    pub socket: PathBuf,
}

impl Default for AgentsDbSection {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/muster/agents-db.sock"),
        }
    }
}

impl AuthdConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Checks field combinations that cannot work at runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] with a human-readable reason.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.authd.remote_enrollment && self.authd.port == 0 {
            return Err(ConfigError::Invalid("port must be nonzero".to_string()));
        }
        if self.authd.pool_size == 0 {
            return Err(ConfigError::Invalid(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if !matches!(self.authd.tls.min_version.as_str(), "1.2" | "1.3") {
            return Err(ConfigError::Invalid(format!(
                "unsupported tls.min_version '{}'",
                self.authd.tls.min_version
            )));
        }
        if self.cluster.worker && !self.cluster.enabled {
            return Err(ConfigError::Invalid(
                "cluster.worker requires cluster.enabled".to_string(),
            ));
        }
        if self.authd.tls.verify_host && self.authd.tls.agent_ca.is_none() {
            return Err(ConfigError::Invalid(
                "tls.verify_host requires tls.agent_ca".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether this node is a cluster worker.
    #[must_use]
    pub const fn worker_node(&self) -> bool {
        self.cluster.enabled && self.cluster.worker
    }

    /// Whether this deployment is a single node (no cluster). Decides the
    /// group sync label the writer hands the agents database.
    #[must_use]
    pub const fn single_node(&self) -> bool {
        !self.cluster.enabled
    }

    /// Receive timeout for accepted sockets, if enabled.
    #[must_use]
    pub const fn recv_timeout(&self) -> Option<Duration> {
        if self.authd.recv_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.authd.recv_timeout_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AuthdConfig::default();
        config.validate().unwrap();
        assert_eq!(config.authd.port, 1515);
        assert!(config.single_node());
        assert!(!config.worker_node());
    }

    #[test]
    fn parses_full_file() {
        let toml = r#"
            [authd]
            port = 2515
            pool_size = 64
            recv_timeout_secs = 5
            keys_file = "/tmp/agent.keys"

            [authd.password]
            enabled = true
            file = "/tmp/authd.pass"

            [authd.tls]
            server_cert = "/tmp/cert.pem"
            server_key = "/tmp/key.pem"
            agent_ca = "/tmp/ca.pem"
            verify_host = true
            min_version = "1.3"

            [authd.force]
            enabled = true

            [cluster]
            enabled = true
            worker = true
            master_socket = "/tmp/master.sock"

            [agents_db]
            socket = "/tmp/db.sock"
        "#;
        let config: AuthdConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.authd.port, 2515);
        assert_eq!(config.recv_timeout(), Some(Duration::from_secs(5)));
        assert!(config.worker_node());
        assert!(!config.single_node());
        assert!(config.authd.force.enabled);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let toml = "[authd]\nprot = 1515\n";
        assert!(toml::from_str::<AuthdConfig>(toml).is_err());
    }

    #[test]
    fn worker_without_cluster_is_invalid() {
        let toml = "[cluster]\nworker = true\n";
        let config: AuthdConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn verify_host_requires_ca() {
        let toml = "[authd.tls]\nverify_host = true\n";
        let config: AuthdConfig = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeout_disables_deadline() {
        let toml = "[authd]\nrecv_timeout_secs = 0\n";
        let config: AuthdConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.recv_timeout(), None);
    }
}
