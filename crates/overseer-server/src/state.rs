//! Application state.

use overseer_core::client::PeerClient;
use overseer_core::extractor::ExtractorRegistry;
use overseer_core::{Database, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::middleware::AllowList;
use crate::services::{ResultSink, WatchPool};

/// Timing knobs of the watch task
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub offline_retry_delay: Duration,
    pub offline_max_wait: Duration,
    pub kill_grace: Duration,
}

impl WatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            offline_retry_delay: config.watch.offline_retry_delay(),
            offline_max_wait: config.watch.offline_max_wait(),
            kill_grace: config.watch.kill_grace(),
        }
    }
}

/// Retry policy for results that could not be delivered
#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub retry_delay: Duration,
    pub max_attempts: u32,
}

impl ReportSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry_delay: Duration::from_secs(config.peers.report_retry_secs),
            max_attempts: config.peers.report_max_attempts,
        }
    }
}

/// Shared application state
pub struct AppState {
    /// Node configuration
    pub config: Arc<Config>,
    /// Watch session registry
    pub db: Arc<Database>,
    /// Game kinds this node can watch itself
    pub registry: Arc<ExtractorRegistry>,
    /// Locally running watches
    pub pool: Arc<WatchPool>,
    /// Parent node; `None` on the root
    pub parent: Option<PeerClient>,
    /// Child nodes in delegation order
    pub children: Vec<PeerClient>,
    /// Where the root delivers match results
    pub sink: Arc<dyn ResultSink>,
    /// Addresses allowed to call this node
    pub allow: AllowList,
    pub watch: WatchSettings,
    pub reporting: ReportSettings,
    /// Serializes CreateWatch so lookups and inserts stay consistent
    pub create_lock: Mutex<()>,
    /// Server start time
    pub start_time: Instant,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        db: Database,
        sink: Arc<dyn ResultSink>,
        allow: AllowList,
    ) -> Result<Arc<Self>> {
        let watch = WatchSettings::from_config(&config);
        let reporting = ReportSettings::from_config(&config);
        Self::build(config, db, sink, allow, watch, reporting)
    }

    /// Create state with explicit timing settings
    pub fn build(
        config: Config,
        db: Database,
        sink: Arc<dyn ResultSink>,
        allow: AllowList,
        watch: WatchSettings,
        reporting: ReportSettings,
    ) -> Result<Arc<Self>> {
        let timeout = Duration::from_secs(config.peers.request_timeout_secs);
        let parent = config
            .parent
            .as_ref()
            .map(|p| PeerClient::new(&p.name, &p.url, timeout))
            .transpose()?;
        let children = config
            .children
            .iter()
            .map(|c| PeerClient::new(&c.name, &c.url, timeout))
            .collect::<Result<Vec<_>>>()?;

        Ok(Arc::new(Self {
            registry: Arc::new(config.registry()),
            pool: Arc::new(WatchPool::new(config.node.max_sessions)),
            config: Arc::new(config),
            db: Arc::new(db),
            parent,
            children,
            sink,
            allow,
            watch,
            reporting,
            create_lock: Mutex::new(()),
            start_time: Instant::now(),
        }))
    }

    /// Look up a child node by its configured name
    pub fn child(&self, name: &str) -> Option<&PeerClient> {
        self.children.iter().find(|c| c.name() == name)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
