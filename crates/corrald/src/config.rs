//! Daemon configuration and on-disk layout.
//!
//! Settings come from an optional TOML file; command-line flags override
//! individual values.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Member name, unique in the cluster.
    pub name: String,
    /// `host:port` peers reach this member on.
    pub address: String,
    pub data_dir: PathBuf,
    pub reconcile_interval_secs: u64,
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            name: "corral-0".to_string(),
            address: "127.0.0.1:7443".to_string(),
            data_dir: PathBuf::from("/var/lib/corral"),
            reconcile_interval_secs: 10,
            log_format: LogFormat::Text,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// The file at `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            bail!("member name must not be empty");
        }
        if self.reconcile_interval_secs == 0 {
            bail!("reconcile_interval_secs must be positive");
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Socket the API binds to: every interface, on the member's port.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        let port = self
            .address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .with_context(|| format!("address {:?} has no valid port", self.address))?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    pub fn layout(&self) -> Layout {
        Layout {
            root: self.data_dir.clone(),
        }
    }
}

/// Paths under the data directory.
///
/// Everything in `state/`, the trust store included, belongs to the
/// cluster and is wiped when the member is removed; the member's own
/// identity and the control socket live outside it.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn metadata_db(&self) -> PathBuf {
        self.state_dir().join("metadata.redb")
    }

    pub fn raft_db(&self) -> PathBuf {
        self.state_dir().join("raft.redb")
    }

    pub fn cluster_cert(&self) -> PathBuf {
        self.state_dir().join("cluster.crt")
    }

    pub fn cluster_key(&self) -> PathBuf {
        self.state_dir().join("cluster.key")
    }

    pub fn trust_db(&self) -> PathBuf {
        self.state_dir().join("trust.redb")
    }

    /// Unix socket the operator drives bootstrap, join and removal through.
    pub fn control_socket(&self) -> PathBuf {
        self.root.join("control.sock")
    }

    pub fn server_cert(&self) -> PathBuf {
        self.root.join("server.crt")
    }

    pub fn server_key(&self) -> PathBuf {
        self.root.join("server.key")
    }

    /// Create the directories the stores live in.
    pub fn create(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.state_dir())?;
        Ok(())
    }

    /// Whether this member holds cluster state (bootstrapped or joined).
    pub fn is_member(&self) -> bool {
        self.cluster_cert().exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
name = "n1"
address = "10.0.0.1:9443"
log_format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.name, "n1");
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.reconcile_interval_secs, 10);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/corral"));
    }

    #[test]
    fn config_file_is_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corral.toml");
        std::fs::write(&path, "name = \"n2\"\nreconcile_interval_secs = 3\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.name, "n2");
        assert_eq!(config.reconcile_interval_secs, 3);
        assert_eq!(DaemonConfig::load(None).unwrap(), DaemonConfig::default());
    }

    #[test]
    fn listen_addr_uses_member_port() {
        let config = DaemonConfig {
            address: "node1.example:9443".into(),
            ..Default::default()
        };
        assert_eq!(config.listen_addr().unwrap().port(), 9443);

        let bad = DaemonConfig {
            address: "node1.example".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn removal_wipes_trust_but_keeps_identity() {
        let layout = DaemonConfig {
            data_dir: PathBuf::from("/data"),
            ..Default::default()
        }
        .layout();
        assert!(layout.metadata_db().starts_with(layout.state_dir()));
        assert!(layout.raft_db().starts_with(layout.state_dir()));
        assert!(layout.cluster_cert().starts_with(layout.state_dir()));
        assert!(layout.trust_db().starts_with(layout.state_dir()));
        assert!(!layout.server_cert().starts_with(layout.state_dir()));
        assert!(!layout.control_socket().starts_with(layout.state_dir()));
    }
}
