//! SQLite-backed watch session registry.
//!
//! The registry is the only durable state of a node. Every lifecycle
//! transition is committed here before peers or the requester hear about it,
//! so a crash in between is recovered by retrying rather than rolling back.

use crate::error::{Error, Result};
use crate::types::{LifecycleState, LinkedMatch, SessionKey, Verdict, WatchSession, Winner};
use chrono::DateTime;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Registry schema (applied on open)
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

const SESSION_COLUMNS: &str = "handle, game_kind, owner, primary_match_ref, linked_matches,
        participant_a, participant_b, state, verdict_winner, verdict_strong,
        verdict_details, verdict_at, created_at, updated_at";

/// Database connection wrapper.
///
/// Thread-safe via internal Mutex. All database operations acquire the lock.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (and migrate) the registry at a specific path
    pub fn open_path(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(Error::Database)?;
        Self::with_connection(conn)
    }

    /// Open a throwaway in-memory registry
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(Error::Database)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Check database connectivity
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        conn.execute_batch("SELECT 1").map_err(Error::Database)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a session by its `(handle, game_kind)` key
    pub fn get_session(&self, handle: &str, game_kind: &str) -> Result<Option<WatchSession>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM watch_session WHERE handle = ?1 AND game_kind = ?2",
            SESSION_COLUMNS
        ))?;

        Ok(stmt
            .query_row(params![handle, game_kind], Self::map_session)
            .optional()?)
    }

    /// Find the session settling a match, as primary or linked match
    pub fn find_by_match_ref(&self, match_ref: &str) -> Result<Option<WatchSession>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM watch_session
             WHERE primary_match_ref = ?1
                OR EXISTS (
                    SELECT 1 FROM json_each(watch_session.linked_matches)
                    WHERE json_extract(json_each.value, '$.match_ref') = ?1
                )
             LIMIT 1",
            SESSION_COLUMNS
        ))?;

        Ok(stmt
            .query_row(params![match_ref], Self::map_session)
            .optional()?)
    }

    /// List every session, forwarding pointers included
    pub fn list_sessions(&self) -> Result<Vec<WatchSession>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM watch_session ORDER BY id",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], Self::map_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// List sessions watched by this node itself
    pub fn list_local_sessions(&self) -> Result<Vec<WatchSession>> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM watch_session WHERE owner IS NULL ORDER BY id",
            SESSION_COLUMNS
        ))?;
        let sessions = stmt
            .query_map([], Self::map_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    fn map_session(row: &rusqlite::Row) -> rusqlite::Result<WatchSession> {
        let linked_json: String = row.get(4)?;
        let linked_matches: Vec<LinkedMatch> = serde_json::from_str(&linked_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

        let state_str: String = row.get(7)?;
        let state = LifecycleState::from_str(&state_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                7,
                Type::Text,
                format!("unknown state {:?}", state_str).into(),
            )
        })?;

        let winner: Option<String> = row.get(8)?;
        let verdict = match winner.as_deref().and_then(Winner::from_str) {
            Some(winner) => {
                let at: Option<i64> = row.get(11)?;
                Some(Verdict {
                    winner,
                    strong: row.get::<_, Option<bool>>(9)?.unwrap_or(false),
                    details: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                    observed_at: at
                        .and_then(DateTime::from_timestamp_millis)
                        .unwrap_or_default(),
                })
            }
            None => None,
        };

        Ok(WatchSession {
            handle: row.get(0)?,
            game_kind: row.get(1)?,
            owner: row.get(2)?,
            primary_match_ref: row.get(3)?,
            linked_matches,
            participant_a: row.get(5)?,
            participant_b: row.get(6)?,
            state,
            verdict,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a new session record
    pub fn insert_session(&self, session: &WatchSession) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        let linked = serde_json::to_string(&session.linked_matches)?;

        conn.execute(
            "INSERT INTO watch_session
             (handle, game_kind, owner, primary_match_ref, linked_matches,
              participant_a, participant_b, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                session.handle,
                session.game_kind,
                session.owner,
                session.primary_match_ref,
                linked,
                session.participant_a,
                session.participant_b,
                session.state.as_str(),
                now,
            ],
        )?;

        Ok(())
    }

    /// Update the lifecycle state; returns `false` if the record is gone
    pub fn update_state(&self, key: &SessionKey, state: LifecycleState) -> Result<bool> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        let changed = conn.execute(
            "UPDATE watch_session SET state = ?1, updated_at = ?2
             WHERE handle = ?3 AND game_kind = ?4",
            params![state.as_str(), now, key.handle, key.game_kind],
        )?;
        Ok(changed > 0)
    }

    /// Persist the concluded verdict together with the terminal state
    pub fn record_verdict(
        &self,
        key: &SessionKey,
        state: LifecycleState,
        verdict: &Verdict,
    ) -> Result<bool> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let now = chrono::Utc::now().timestamp_millis();
        let changed = conn.execute(
            "UPDATE watch_session
             SET state = ?1, verdict_winner = ?2, verdict_strong = ?3,
                 verdict_details = ?4, verdict_at = ?5, updated_at = ?6
             WHERE handle = ?7 AND game_kind = ?8",
            params![
                state.as_str(),
                verdict.winner.as_str(),
                verdict.strong,
                verdict.details,
                verdict.observed_at.timestamp_millis(),
                now,
                key.handle,
                key.game_kind,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Attach a linked match to an existing session.
    ///
    /// Returns `false` when the match is already settled by the session;
    /// the polarity of an attached match is never rewritten.
    pub fn attach_linked_match(&self, key: &SessionKey, link: LinkedMatch) -> Result<bool> {
        let mut conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let tx = conn.transaction()?;

        let current = tx
            .query_row(
                &format!(
                    "SELECT {} FROM watch_session WHERE handle = ?1 AND game_kind = ?2",
                    SESSION_COLUMNS
                ),
                params![key.handle, key.game_kind],
                Self::map_session,
            )
            .optional()?;
        let Some(mut session) = current else {
            return Err(Error::not_found(&key.handle, &key.game_kind));
        };
        if !session.attach(link) {
            return Ok(false);
        }

        let now = chrono::Utc::now().timestamp_millis();
        tx.execute(
            "UPDATE watch_session SET linked_matches = ?1, updated_at = ?2
             WHERE handle = ?3 AND game_kind = ?4",
            params![
                serde_json::to_string(&session.linked_matches)?,
                now,
                key.handle,
                key.game_kind
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Delete a session record; returns `false` if it did not exist
    pub fn delete_session(&self, key: &SessionKey) -> Result<bool> {
        let conn = self.conn.lock().map_err(|_| Error::LockPoisoned)?;
        let deleted = conn.execute(
            "DELETE FROM watch_session WHERE handle = ?1 AND game_kind = ?2",
            params![key.handle, key.game_kind],
        )?;
        Ok(deleted > 0)
    }
}
