//! WatchPool - the set of locally running watch tasks
//!
//! Each running task holds a [`Slot`]. The slot is the only way a session
//! enters the running set, and dropping it is the only way it leaves, so a
//! task is removed exactly once however it ends (conclusion, cancellation or
//! panic). Generations guard against a late drop removing a newer slot for
//! the same key.

use overseer_core::types::SessionKey;
use overseer_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Cooperative cancellation signal handed to a watch task
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Resolves once the task has been asked to stop.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // a dropped sender means the pool entry is gone; stop as well
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

struct RunningWatch {
    generation: u64,
    cancel: watch::Sender<bool>,
    started_at: Instant,
}

#[derive(Default)]
struct PoolInner {
    running: HashMap<SessionKey, RunningWatch>,
    next_generation: u64,
}

/// Reservation of one running-watch place
pub struct Slot {
    key: SessionKey,
    generation: u64,
    token: CancelToken,
    inner: Arc<Mutex<PoolInner>>,
}

impl Slot {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let current = inner
            .running
            .get(&self.key)
            .map(|entry| (entry.generation, entry.started_at));
        match current {
            Some((generation, started_at)) if generation == self.generation => {
                let ran_for = started_at.elapsed();
                inner.running.remove(&self.key);
                debug!(key = %self.key, ran_for = ?ran_for, "Watch slot released");
            }
            _ => warn!(key = %self.key, "Watch slot already released"),
        }
    }
}

/// Bounded set of locally running watches
pub struct WatchPool {
    inner: Arc<Mutex<PoolInner>>,
    max_sessions: usize,
}

impl WatchPool {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner::default())),
            max_sessions,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Number of running watches
    pub fn len(&self) -> usize {
        self.lock().running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_capacity(&self) -> bool {
        self.len() < self.max_sessions
    }

    pub fn is_running(&self, key: &SessionKey) -> bool {
        self.lock().running.contains_key(key)
    }

    /// Reserve a place for a new watch, honouring the ceiling.
    pub fn try_reserve(&self, key: SessionKey) -> Result<Slot> {
        self.reserve(key, true)
    }

    /// Reserve a place regardless of the ceiling (resuming persisted sessions).
    pub fn reserve_unbounded(&self, key: SessionKey) -> Result<Slot> {
        self.reserve(key, false)
    }

    fn reserve(&self, key: SessionKey, bounded: bool) -> Result<Slot> {
        let mut inner = self.lock();
        if inner.running.contains_key(&key) {
            return Err(Error::AlreadyRunning(key.to_string()));
        }
        if bounded && inner.running.len() >= self.max_sessions {
            return Err(Error::CapacityExceeded);
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let (tx, rx) = watch::channel(false);
        inner.running.insert(
            key.clone(),
            RunningWatch {
                generation,
                cancel: tx,
                started_at: Instant::now(),
            },
        );

        Ok(Slot {
            key,
            generation,
            token: CancelToken { rx },
            inner: Arc::clone(&self.inner),
        })
    }

    /// Ask a running watch to stop; returns `false` if it is not running.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        match self.lock().running.get(key) {
            Some(entry) => {
                entry.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Ask every running watch to stop; returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let inner = self.lock();
        for entry in inner.running.values() {
            entry.cancel.send_replace(true);
        }
        inner.running.len()
    }

    /// Wait until every slot has been released or `timeout` passes.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}
