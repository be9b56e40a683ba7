//! Shared fixtures for the server's unit tests.

use async_trait::async_trait;
use overseer_core::consensus::ConsensusParams;
use overseer_core::extractor::ExtractorKind;
use overseer_core::types::{LifecycleState, MatchResult, WatchSession};
use overseer_core::{Database, Error, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{Config, GameKindConfig};
use crate::middleware::AllowList;
use crate::routes::create_router;
use crate::services::ResultSink;
use crate::state::{AppState, ReportSettings, WatchSettings};

/// Sink that remembers everything the root delivered
#[derive(Default)]
pub struct RecordingSink {
    results: Mutex<Vec<(String, MatchResult)>>,
    events: Mutex<Vec<(String, String)>>,
    failures: Mutex<u32>,
}

impl RecordingSink {
    pub fn results(&self) -> Vec<(String, MatchResult)> {
        self.results.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }

    /// Make the next `n` result deliveries fail
    pub fn fail_next(&self, n: u32) {
        *self.failures.lock().unwrap() = n;
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn match_result(&self, match_ref: &str, result: &MatchResult) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(Error::peer_unreachable("app", "connection refused"));
            }
        }
        self.results
            .lock()
            .unwrap()
            .push((match_ref.to_string(), result.clone()));
        Ok(())
    }

    async fn match_event(&self, match_ref: &str, text: &str) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((match_ref.to_string(), text.to_string()));
        Ok(())
    }
}

/// Root node state with an in-memory registry and a scripted `test` kind,
/// answering requests from 127.0.0.1 only.
///
/// The `test` kind runs `sleep 30` unless `adjust` changes it.
pub fn test_state<S: ResultSink + 'static>(
    sink: Arc<S>,
    adjust: impl FnOnce(&mut Config),
) -> Arc<AppState> {
    let mut config = Config::default();
    let defaults = ConsensusParams::default();
    config.game_kinds.insert(
        "test".to_string(),
        GameKindConfig {
            extractor: ExtractorKind::Scripted,
            command: "sleep 30".to_string(),
            workdir: None,
            quorum: defaults.quorum.unwrap_or(0),
            max_delta_secs: defaults.max_delta.map_or(0, |d| d.as_secs()),
            only_last_result: false,
            on_failure: Default::default(),
        },
    );
    config.peers.request_timeout_secs = 2;
    adjust(&mut config);

    let watch = WatchSettings {
        offline_retry_delay: Duration::from_millis(50),
        offline_max_wait: Duration::from_millis(200),
        kill_grace: Duration::from_millis(200),
    };
    let reporting = ReportSettings {
        retry_delay: Duration::from_millis(20),
        max_attempts: 5,
    };
    let allow = AllowList::from_addrs(
        [IpAddr::from([127, 0, 0, 1])],
        config.node.trust_real_ip_header,
    );
    AppState::build(
        config,
        Database::open_in_memory().unwrap(),
        sink,
        allow,
        watch,
        reporting,
    )
    .unwrap()
}

/// Insert a waiting, locally owned `test` session without starting it
pub fn insert_session(
    state: &AppState,
    handle: &str,
    match_ref: &str,
    a: &str,
    b: &str,
) -> WatchSession {
    let session = WatchSession {
        handle: handle.to_string(),
        game_kind: "test".to_string(),
        owner: None,
        primary_match_ref: match_ref.to_string(),
        linked_matches: Vec::new(),
        participant_a: a.to_string(),
        participant_b: b.to_string(),
        state: LifecycleState::Waiting,
        verdict: None,
        created_at: 0,
        updated_at: 0,
    };
    state.db.insert_session(&session).unwrap();
    session
}

/// Bind an ephemeral localhost port for a node that is built later
pub async fn bind_node() -> (tokio::net::TcpListener, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// Serve a node's full router on a bound listener
pub fn serve_node(listener: tokio::net::TcpListener, state: Arc<AppState>) {
    let app = create_router(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
}

/// Bind and serve a node; returns its base URL
pub async fn spawn_node(state: Arc<AppState>) -> String {
    let (listener, url) = bind_node().await;
    serve_node(listener, state);
    url
}

/// Poll `check` until it holds or about two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
