//! Node configuration.
//!
//! Configuration is loaded from the first file found of:
//! 1. `--config` / `OVERSEER_CONFIG`
//! 2. `$OVERSEER_DIR/config.toml`
//! 3. `~/.overseer/config.toml`
//!
//! A missing file yields the defaults (a root node with no children and no
//! game kinds).

use anyhow::{Context, Result};
use overseer_core::consensus::ConsensusParams;
use overseer_core::extractor::{ExtractorKind, ExtractorRegistry, FailurePolicy, GameKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,

    /// Parent node; absent on the root
    #[serde(default)]
    pub parent: Option<PeerConfig>,

    /// Child nodes in delegation priority order
    #[serde(default)]
    pub children: Vec<PeerConfig>,

    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub peers: PeersConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub game_kinds: BTreeMap<String, GameKindConfig>,

    /// File the configuration was read from
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of this node as its parent knows it
    #[serde(default = "default_node_name")]
    pub name: String,

    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Ceiling on locally running watch sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Registry database (default `<overseer dir>/watch.db`)
    pub database_path: Option<PathBuf>,

    /// Honour `X-Real-IP`, but only on requests whose socket peer is
    /// itself allowed (the fronting proxy)
    #[serde(default)]
    pub trust_real_ip_header: bool,

    /// Extra hosts allowed to call this node
    #[serde(default)]
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base URL of the external application; results are only logged without it
    pub url: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Delay between attempts to deliver an undelivered result
    #[serde(default = "default_report_retry")]
    pub report_retry_secs: u64,

    #[serde(default = "default_report_attempts")]
    pub report_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_offline_retry_delay")]
    pub offline_retry_delay_secs: u64,

    /// Cumulative offline wait before a session fails
    #[serde(default = "default_offline_max_wait")]
    pub offline_max_wait_secs: u64,

    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Base directory for capture commands
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Report stored verdicts of concluded sessions found at startup
    #[serde(default)]
    pub redeliver_results: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameKindConfig {
    pub extractor: ExtractorKind,

    /// Capture command; `{handle}` is replaced with the stream handle
    pub command: String,

    pub workdir: Option<PathBuf>,

    /// 0 disables quorum-based conclusion
    #[serde(default = "default_quorum")]
    pub quorum: usize,

    /// 0 disables the time window
    #[serde(default = "default_max_delta")]
    pub max_delta_secs: u64,

    #[serde(default)]
    pub only_last_result: bool,

    #[serde(default)]
    pub on_failure: FailurePolicy,
}

// Default value functions
fn default_node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "overseer".to_string())
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8021))
}

fn default_max_sessions() -> usize {
    4
}

fn default_request_timeout() -> u64 {
    10
}

fn default_report_retry() -> u64 {
    30
}

fn default_report_attempts() -> u32 {
    10
}

fn default_offline_retry_delay() -> u64 {
    30
}

fn default_offline_max_wait() -> u64 {
    3 * 60 * 60
}

fn default_kill_grace() -> u64 {
    3
}

fn default_quorum() -> usize {
    5
}

fn default_max_delta() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            database_path: None,
            trust_real_ip_header: false,
            allow: Vec::new(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            report_retry_secs: default_report_retry(),
            report_max_attempts: default_report_attempts(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            offline_retry_delay_secs: default_offline_retry_delay(),
            offline_max_wait_secs: default_offline_max_wait(),
            kill_grace_secs: default_kill_grace(),
            workdir: None,
        }
    }
}

/// Base directory for node data: `$OVERSEER_DIR` or `~/.overseer`
pub fn overseer_dir() -> PathBuf {
    std::env::var("OVERSEER_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".overseer")
        })
}

impl Config {
    /// Load configuration, preferring an explicitly given file.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => overseer_dir().join("config.toml"),
        };

        if path.exists() {
            Self::from_file(&path)
        } else if explicit.is_some() {
            anyhow::bail!("Config file {} does not exist", path.display())
        } else {
            Ok(Config::default())
        }
    }

    /// Parse one configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.config_path = Some(path.to_path_buf());
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, kind) in &self.game_kinds {
            if kind.command.trim().is_empty() {
                anyhow::bail!("Game kind {} has an empty command", name);
            }
        }
        let mut names: Vec<&str> = self.children.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            anyhow::bail!("Child node names must be unique");
        }
        Ok(())
    }

    /// A node without a parent settles results itself
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn database_path(&self) -> PathBuf {
        self.node
            .database_path
            .clone()
            .unwrap_or_else(|| overseer_dir().join("watch.db"))
    }

    /// Build the game kind registration table
    pub fn registry(&self) -> ExtractorRegistry {
        let mut registry = ExtractorRegistry::new();
        for (name, kind) in &self.game_kinds {
            registry.register(GameKind {
                name: name.clone(),
                extractor: kind.extractor,
                command: kind.command.clone(),
                workdir: kind.workdir.clone().or_else(|| self.watch.workdir.clone()),
                consensus: kind.consensus(),
                on_failure: kind.on_failure,
            });
        }
        registry
    }
}

impl GameKindConfig {
    pub fn consensus(&self) -> ConsensusParams {
        ConsensusParams {
            quorum: (self.quorum > 0).then_some(self.quorum),
            max_delta: (self.max_delta_secs > 0).then(|| Duration::from_secs(self.max_delta_secs)),
            only_last_result: self.only_last_result,
        }
    }
}

impl WatchConfig {
    pub fn offline_retry_delay(&self) -> Duration {
        Duration::from_secs(self.offline_retry_delay_secs)
    }

    pub fn offline_max_wait(&self) -> Duration {
        Duration::from_secs(self.offline_max_wait_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}
