//! Origin allow-list for the watcher node.
//!
//! Only the parent, the children, the external application, localhost and
//! explicitly configured hosts may call a node. Host names are resolved once
//! at startup.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::state::AppState;

const REAL_IP_HEADER: &str = "x-real-ip";

/// Resolved set of addresses allowed to call this node
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    addrs: HashSet<IpAddr>,
    trust_real_ip: bool,
}

impl AllowList {
    pub fn from_addrs(addrs: impl IntoIterator<Item = IpAddr>, trust_real_ip: bool) -> Self {
        Self {
            addrs: addrs.into_iter().map(|ip| ip.to_canonical()).collect(),
            trust_real_ip,
        }
    }

    /// Resolve every neighbour named in the configuration.
    ///
    /// Unresolvable hosts are logged and skipped.
    pub async fn resolve(config: &Config) -> Self {
        let mut hosts: Vec<String> = vec!["localhost".to_string()];
        hosts.extend(config.parent.iter().map(|p| host_of(&p.url).to_string()));
        hosts.extend(config.children.iter().map(|c| host_of(&c.url).to_string()));
        hosts.extend(config.app.url.iter().map(|url| host_of(url).to_string()));
        hosts.extend(config.node.allow.iter().map(|h| host_of(h).to_string()));

        let mut addrs = HashSet::new();
        for host in hosts.iter().filter(|h| !h.is_empty()) {
            match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(resolved) => addrs.extend(resolved.map(|sa| sa.ip().to_canonical())),
                Err(e) => warn!(host = %host, error = %e, "Failed to resolve allowed host"),
            }
        }
        // localhost may resolve to only one family
        addrs.insert(IpAddr::from([127, 0, 0, 1]));
        addrs.insert(IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1]));

        debug!(count = addrs.len(), "Allow-list resolved");
        Self {
            addrs,
            trust_real_ip: config.node.trust_real_ip_header,
        }
    }

    pub fn allows(&self, ip: IpAddr) -> bool {
        self.addrs.contains(&ip.to_canonical())
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    /// Origin of a request: the socket peer, or `X-Real-IP` when trusted and
    /// set by an allowed peer.
    fn origin(&self, request: &Request<Body>) -> Option<IpAddr> {
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())?;
        if !self.trust_real_ip || !self.allows(peer) {
            return Some(peer);
        }

        let real_ip = request
            .headers()
            .get(REAL_IP_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        Some(real_ip.unwrap_or(peer))
    }
}

/// Strip scheme, path and port from a URL or `host[:port]` string
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next().unwrap_or(rest);
    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6);
    }
    // a bare IPv6 address has more than one colon
    if authority.matches(':').count() > 1 {
        return authority;
    }
    authority.split(':').next().unwrap_or(authority)
}

/// Rejection for callers outside the allow-list
#[derive(Debug)]
pub struct OriginRejected;

#[derive(Serialize)]
struct ErrorResponse {
    error_code: u16,
    error: String,
}

impl IntoResponse for OriginRejected {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error_code: StatusCode::FORBIDDEN.as_u16(),
            error: "Forbidden".to_string(),
        });
        (StatusCode::FORBIDDEN, body).into_response()
    }
}

/// Allow-list middleware for axum
pub async fn allowlist_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, OriginRejected> {
    match state.allow.origin(&request) {
        Some(ip) if state.allow.allows(ip) => Ok(next.run(request).await),
        origin => {
            debug!(origin = ?origin, path = %request.uri().path(), "Attempt to request from unknown address");
            Err(OriginRejected)
        }
    }
}
