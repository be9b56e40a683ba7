//! Delegation Router - deciding which node watches a new stream
//!
//! Children are offered the stream in their configured order and the first
//! one that accepts becomes the owner; this node only keeps a forwarding
//! pointer. When every child declines, the stream is accepted locally if the
//! game kind is registered and a slot is free. A rejection at this level
//! lets the caller (an ancestor) try its next child, which spreads load
//! depth-first through the tree.
//!
//! A full subtree answers `CapacityExceeded` even when this node cannot
//! watch the kind itself; `UnsupportedGameKind` means no node below
//! supports it.

use overseer_core::types::{
    validate_handle, LifecycleState, LinkedMatch, LoadReport, NewWatch, SessionKey, WatchSession,
};
use overseer_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::services::watcher;
use crate::state::AppState;

/// Where a CreateWatch request ended up
#[derive(Debug, Clone)]
pub enum Placement {
    /// New session watched by this node
    Created(WatchSession),
    /// New session owned by a child
    Forwarded(WatchSession),
    /// Match linked to an existing session
    Attached(WatchSession),
}

impl Placement {
    pub fn session(&self) -> &WatchSession {
        match self {
            Placement::Created(s) | Placement::Forwarded(s) | Placement::Attached(s) => s,
        }
    }

    pub fn into_session(self) -> WatchSession {
        match self {
            Placement::Created(s) | Placement::Forwarded(s) | Placement::Attached(s) => s,
        }
    }
}

fn new_session(new: &NewWatch, owner: Option<&str>) -> WatchSession {
    let now = chrono::Utc::now().timestamp_millis();
    WatchSession {
        handle: new.handle.clone(),
        game_kind: new.game_kind.clone(),
        owner: owner.map(str::to_string),
        primary_match_ref: new.match_ref.clone(),
        linked_matches: Vec::new(),
        participant_a: new.participant_a.clone(),
        participant_b: new.participant_b.clone(),
        state: LifecycleState::Waiting,
        verdict: None,
        created_at: now,
        updated_at: now,
    }
}

/// CreateWatch: attach to an existing session or place a new one.
pub async fn create_watch(state: &Arc<AppState>, new: NewWatch) -> Result<Placement> {
    validate_handle(&new.handle)?;
    let _guard = state.create_lock.lock().await;

    if let Some(existing) = state.db.get_session(&new.handle, &new.game_kind)? {
        return attach(state, existing, &new).await;
    }
    if let Some(other) = state.db.find_by_match_ref(&new.match_ref)? {
        warn!(match_ref = %new.match_ref, stream = %other.key(), "Match is already watched");
        return Err(Error::DuplicateMatch(new.match_ref));
    }

    let mut subtree_full = false;
    for child in &state.children {
        match child
            .create_watch(&new.handle, &new.game_kind, &new.request())
            .await
        {
            Ok(_) => {
                let session = new_session(&new, Some(child.name()));
                state.db.insert_session(&session)?;
                info!(key = %session.key(), child = child.name(), "Stream delegated to child");
                return Ok(Placement::Forwarded(session));
            }
            Err(e) => {
                subtree_full |= e.status_code() == 507;
                debug!(key = %new.key(), child = child.name(), error = %e, "Child declined stream");
            }
        }
    }

    accept_locally(state, &new, subtree_full)
}

fn accept_locally(state: &Arc<AppState>, new: &NewWatch, subtree_full: bool) -> Result<Placement> {
    let Some(kind) = state.registry.get(&new.game_kind) else {
        if subtree_full {
            info!(key = %new.key(), "Every observer for this game kind is busy");
            return Err(Error::CapacityExceeded);
        }
        return Err(Error::UnsupportedGameKind(new.game_kind.clone()));
    };
    if !state.pool.has_capacity() {
        info!(key = %new.key(), max = state.pool.max_sessions(), "All observers are busy");
        return Err(Error::CapacityExceeded);
    }

    let slot = state.pool.try_reserve(new.key())?;
    let session = new_session(new, None);
    // a failed insert drops the slot again
    state.db.insert_session(&session)?;

    info!(key = %session.key(), match_ref = %session.primary_match_ref, "Watching stream locally");
    watcher::spawn_watch(Arc::clone(state), session.clone(), kind, slot);
    Ok(Placement::Created(session))
}

async fn attach(state: &Arc<AppState>, existing: WatchSession, new: &NewWatch) -> Result<Placement> {
    let key = existing.key();
    if existing.settles_match(&new.match_ref) {
        debug!(key = %key, match_ref = %new.match_ref, "Match already attached");
        return Ok(Placement::Attached(existing));
    }
    if !existing.state.is_active() {
        warn!(key = %key, state = existing.state.as_str(), match_ref = %new.match_ref, "Stream already has a result");
        return Err(Error::Conflict(format!(
            "Stream {} already has a result",
            key
        )));
    }
    if state.db.find_by_match_ref(&new.match_ref)?.is_some() {
        return Err(Error::DuplicateMatch(new.match_ref.clone()));
    }
    let inverted = existing.polarity_for(&new.participant_a, &new.participant_b)?;

    let link = LinkedMatch {
        match_ref: new.match_ref.clone(),
        inverted,
    };
    state.db.attach_linked_match(&key, link)?;
    info!(key = %key, match_ref = %new.match_ref, inverted, "Match attached to stream");

    if let Some(owner) = &existing.owner {
        match state.child(owner) {
            Some(child) => {
                if let Err(e) = child
                    .create_watch(&new.handle, &new.game_kind, &new.request())
                    .await
                {
                    warn!(key = %key, child = %owner, error = %e, "Failed to attach match on child");
                }
            }
            None => warn!(key = %key, child = %owner, "Stream owned by an unknown child"),
        }
    }

    let session = state
        .db
        .get_session(&key.handle, &key.game_kind)?
        .ok_or_else(|| Error::not_found(&key.handle, &key.game_kind))?;
    Ok(Placement::Attached(session))
}

/// GetWatch: the record, as seen by whichever node watches the stream.
pub async fn get_watch(state: &Arc<AppState>, key: &SessionKey) -> Result<WatchSession> {
    let session = state
        .db
        .get_session(&key.handle, &key.game_kind)?
        .ok_or_else(|| Error::not_found(&key.handle, &key.game_kind))?;

    let Some(owner) = &session.owner else {
        return Ok(session);
    };
    let child = state
        .child(owner)
        .ok_or_else(|| Error::Other(format!("Stream owned by unknown child {}", owner)))?;
    match child.get_watch(&key.handle, &key.game_kind).await? {
        Some(remote) => Ok(remote),
        None => {
            warn!(key = %key, child = %owner, "Child lost the stream, returning local pointer");
            Ok(session)
        }
    }
}

/// DeleteWatch: drop the record, cancelling or forwarding as needed.
pub async fn delete_watch(state: &Arc<AppState>, key: &SessionKey) -> Result<()> {
    let session = state
        .db
        .get_session(&key.handle, &key.game_kind)?
        .ok_or_else(|| Error::not_found(&key.handle, &key.game_kind))?;

    match &session.owner {
        Some(owner) => match state.child(owner) {
            Some(child) => match child.delete_watch(&key.handle, &key.game_kind).await {
                Ok(true) => debug!(key = %key, child = %owner, "Stream deleted on child"),
                Ok(false) => debug!(key = %key, child = %owner, "Child had no such stream"),
                Err(e) => warn!(key = %key, child = %owner, error = %e, "Failed to delete stream on child"),
            },
            None => warn!(key = %key, child = %owner, "Stream owned by an unknown child"),
        },
        None => {
            if state.pool.cancel(key) {
                info!(key = %key, "Cancelled running watch");
            }
        }
    }

    state.db.delete_session(key)?;
    info!(key = %key, "Stream deleted");
    Ok(())
}

/// GetLoad: running watches of this node and every reachable child.
pub async fn subtree_load(state: &Arc<AppState>) -> LoadReport {
    let current = state.pool.len();
    let max = state.pool.max_sessions();
    let mut report = LoadReport {
        current_sessions: current,
        max_sessions: max,
        load: 0.0,
    };
    let mut loads = vec![utilisation(current, max)];

    for child in &state.children {
        match child.load().await {
            Ok(child_load) => {
                report.current_sessions += child_load.current_sessions;
                report.max_sessions += child_load.max_sessions;
                loads.push(child_load.load);
            }
            Err(e) => debug!(child = child.name(), error = %e, "Child load unavailable"),
        }
    }

    report.load = loads.iter().sum::<f64>() / loads.len() as f64;
    report
}

fn utilisation(current: usize, max: usize) -> f64 {
    if max == 0 {
        1.0
    } else {
        current as f64 / max as f64
    }
}
