//! Durable session persistence store backed by SQLite
//!
//! The single writer-of-record for session, participant, and per-peer
//! connection state. Every state-machine transition ends with a write here,
//! and every resume path starts with a read, so a reconnecting client (or a
//! second device) can pick up where it left off without renegotiating from
//! scratch.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Result, SessionError};
use crate::quality::QualityAssessment;
use crate::session::{SessionRole, SessionStatus};
use crate::transport::signaling::SignalingMessage;
use crate::transport::ConnectionState;

/// Store change notification channel capacity
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Out-of-band change notification
///
/// Consumers (the participant registry, a waiting non-host peer) react to
/// these; when the channel is lagged or unavailable they fall back to
/// re-fetching.
#[derive(Debug, Clone)]
pub enum StoreChange {
    SessionUpdated { session_id: String },
    ParticipantRegistered { session_id: String, participant_id: String },
    ParticipantLeft { session_id: String, participant_id: String },
    ParticipantAdmitted { session_id: String, participant_id: String },
    SessionEnded { session_id: String },
}

/// Durable session record
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub host_user_id: Option<String>,
    pub status: SessionStatus,
    /// Tab-backgrounded flag; orthogonal to status and to recovery counting
    pub paused: bool,
    pub reconnection_count: u32,
    pub disconnect_reason: Option<String>,
    pub quality: Option<QualityAssessment>,
    pub last_active_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Durable participant record
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    pub participant_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub display_name: String,
    pub role: SessionRole,
    pub is_active: bool,
    /// Registered but not yet admitted by the host
    pub waiting: bool,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Per-peer transport state, for diagnostics and resumption
#[derive(Debug, Clone)]
pub struct ConnectionStateRecord {
    pub peer_id: String,
    pub connection_state: ConnectionState,
    pub ice_state: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot taken on unplanned disconnect so recovery resumes counting
/// attempts after a reload instead of restarting from zero
#[derive(Debug, Clone)]
pub struct RecoveryContext {
    pub reconnection_count: u32,
    pub reason: Option<String>,
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Session persistence store backed by SQLite
#[derive(Clone)]
pub struct SessionStore {
    pool: Pool<Sqlite>,
    change_tx: broadcast::Sender<StoreChange>,
}

impl SessionStore {
    /// Open (or create) the store at the given path
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            // SQLite is single-writer; one read plus one write connection
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .idle_timeout(Duration::from_secs(300))
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;

        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Ok(Self { pool, change_tx })
    }

    async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                host_user_id TEXT,
                status TEXT NOT NULL,
                paused INTEGER NOT NULL DEFAULT 0,
                reconnection_count INTEGER NOT NULL DEFAULT 0,
                disconnect_reason TEXT,
                disconnected_at TEXT,
                quality TEXT,
                last_active_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                user_id TEXT,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                waiting INTEGER NOT NULL DEFAULT 0,
                joined_at TEXT NOT NULL,
                left_at TEXT,
                UNIQUE(session_id, user_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connection_states (
                session_id TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                connection_state TEXT NOT NULL,
                ice_state TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, peer_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_signaling (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.change_tx.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is normal; notifications are fire-and-forget
        let _ = self.change_tx.send(change);
    }

    /// Create (or resume) the durable record for a session
    ///
    /// Idempotent: a second call with the same `session_id` refreshes the
    /// liveness stamp instead of creating a duplicate. A uniqueness race
    /// between two concurrent initializers is retried exactly once.
    pub async fn initialize_session(
        &self,
        session_id: &str,
        host_user_id: Option<&str>,
    ) -> Result<SessionRecord> {
        match self.try_initialize(session_id, host_user_id).await {
            Err(e) if e.is_unique_violation() => {
                debug!("Session upsert race on {}, retrying once", session_id);
                self.try_initialize(session_id, host_user_id)
                    .await
                    .map_err(|e| SessionError::WriteConflict(e.to_string()))
            }
            other => other,
        }
    }

    async fn try_initialize(
        &self,
        session_id: &str,
        host_user_id: Option<&str>,
    ) -> Result<SessionRecord> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, host_user_id, status, last_active_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(id) DO UPDATE SET last_active_at = ?4
            "#,
        )
        .bind(session_id)
        .bind(host_user_id)
        .bind(SessionStatus::Joining.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Fetch the durable record, if the session still exists
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<(
            String,
            Option<String>,
            String,
            i64,
            i64,
            Option<String>,
            Option<String>,
            String,
            String,
        )> = sqlx::query_as(
            r#"
            SELECT id, host_user_id, status, paused, reconnection_count,
                   disconnect_reason, quality, last_active_at, created_at
            FROM sessions WHERE id = ?1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, host, status, paused, reconnects, reason, quality, last_active, created)| {
                SessionRecord {
                    session_id: id,
                    host_user_id: host,
                    status: status.parse().unwrap_or(SessionStatus::Idle),
                    paused: paused != 0,
                    reconnection_count: reconnects as u32,
                    disconnect_reason: reason,
                    quality: quality.and_then(|q| serde_json::from_str(&q).ok()),
                    last_active_at: parse_timestamp(&last_active),
                    created_at: parse_timestamp(&created),
                }
            },
        ))
    }

    /// Record the session's lifecycle status
    pub async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?1, last_active_at = ?2 WHERE id = ?3")
            .bind(status.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        self.notify(StoreChange::SessionUpdated {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Refresh the liveness stamp
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_active_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Store the latest aggregate quality assessment
    pub async fn update_quality(
        &self,
        session_id: &str,
        assessment: &QualityAssessment,
    ) -> Result<()> {
        let json = serde_json::to_string(assessment)?;
        sqlx::query("UPDATE sessions SET quality = ?1 WHERE id = ?2")
            .bind(&json)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Mark the session paused (tab backgrounded) without destroying it
    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET paused = 1 WHERE id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clear the paused flag and refresh liveness
    pub async fn resume_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET paused = 0, last_active_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the durable record entirely; subsequent reads return nothing
    pub async fn end_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_signaling WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM connection_states WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM participants WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        info!("Session record deleted: {}", session_id);
        self.notify(StoreChange::SessionEnded {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// Snapshot the recovery context on unplanned disconnect
    pub async fn record_disconnection(&self, session_id: &str, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET reconnection_count = reconnection_count + 1,
                disconnect_reason = ?1,
                disconnected_at = ?2
            WHERE id = ?3
            "#,
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reset the recovery context after a successful reconnection
    pub async fn clear_recovery_context(&self, session_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sessions
            SET reconnection_count = 0, disconnect_reason = NULL, disconnected_at = NULL
            WHERE id = ?1
            "#,
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read the persisted recovery context, if any disconnect was recorded
    pub async fn recovery_context(&self, session_id: &str) -> Result<Option<RecoveryContext>> {
        let row: Option<(i64, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT reconnection_count, disconnect_reason, disconnected_at FROM sessions WHERE id = ?1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count, reason, disconnected_at)| RecoveryContext {
            reconnection_count: count as u32,
            reason,
            disconnected_at: disconnected_at.as_deref().map(parse_timestamp),
        }))
    }

    /// Register (or reactivate) a participant, bounded by session capacity
    ///
    /// Upsert keyed on `(session_id, user_id)`: re-registration reactivates
    /// the existing record rather than duplicating it. Anonymous guests
    /// (no user id) always get a fresh record. The capacity check is part
    /// of the insert statement itself, so concurrent registrations cannot
    /// oversubscribe the session; a user already holding an active slot is
    /// not counted against it. A uniqueness race is retried exactly once
    /// before surfacing as a write conflict.
    pub async fn add_participant(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        display_name: &str,
        role: SessionRole,
        waiting: bool,
        capacity: u32,
    ) -> Result<ParticipantRecord> {
        let record = match self
            .try_add_participant(session_id, user_id, display_name, role, waiting, capacity)
            .await
        {
            Err(e) if e.is_unique_violation() => self
                .try_add_participant(session_id, user_id, display_name, role, waiting, capacity)
                .await
                .map_err(|e| SessionError::WriteConflict(e.to_string()))?,
            other => other?,
        };

        self.notify(StoreChange::ParticipantRegistered {
            session_id: session_id.to_string(),
            participant_id: record.participant_id.clone(),
        });
        Ok(record)
    }

    async fn try_add_participant(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        display_name: &str,
        role: SessionRole,
        waiting: bool,
        capacity: u32,
    ) -> Result<ParticipantRecord> {
        let participant_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        // The COUNT excludes the registrant's own active row; an anonymous
        // registrant excludes nothing, since `NULL IS NOT ''` holds for
        // every row and no real user id is the empty string
        let result = sqlx::query(
            r#"
            INSERT INTO participants (id, session_id, user_id, display_name, role, is_active, waiting, joined_at)
            SELECT ?1, ?2, ?3, ?4, ?5, 1, ?6, ?7
            WHERE (SELECT COUNT(*) FROM participants
                   WHERE session_id = ?2 AND is_active = 1 AND user_id IS NOT ?8) < ?9
            ON CONFLICT(session_id, user_id) DO UPDATE SET
                display_name = excluded.display_name,
                role = excluded.role,
                is_active = 1,
                waiting = excluded.waiting,
                left_at = NULL
            "#,
        )
        .bind(&participant_id)
        .bind(session_id)
        .bind(user_id)
        .bind(display_name)
        .bind(role.to_string())
        .bind(waiting as i64)
        .bind(&now)
        .bind(user_id.unwrap_or(""))
        .bind(capacity as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SessionError::SessionFull { capacity });
        }

        // On conflict the original row (and its id) survives; read it back
        let record = match user_id {
            Some(uid) => self.participant_by_user(session_id, uid).await?,
            None => self.participant_by_id(&participant_id).await?,
        };
        record.ok_or_else(|| SessionError::NotFound(format!("participant in {}", session_id)))
    }

    /// Mark a participant inactive and stamp their leave time
    ///
    /// The row is never hard-deleted while the session exists.
    pub async fn remove_participant(&self, session_id: &str, user_id: &str) -> Result<()> {
        let participant = self.participant_by_user(session_id, user_id).await?;
        sqlx::query(
            r#"
            UPDATE participants SET is_active = 0, left_at = ?1
            WHERE session_id = ?2 AND user_id = ?3 AND is_active = 1
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if let Some(p) = participant {
            self.notify(StoreChange::ParticipantLeft {
                session_id: session_id.to_string(),
                participant_id: p.participant_id,
            });
        }
        Ok(())
    }

    /// Flip a waiting participant to admitted
    pub async fn admit_participant(&self, session_id: &str, participant_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE participants SET waiting = 0 WHERE session_id = ?1 AND id = ?2 AND waiting = 1",
        )
        .bind(session_id)
        .bind(participant_id)
        .execute(&self.pool)
        .await?;

        let admitted = result.rows_affected() > 0;
        if admitted {
            self.notify(StoreChange::ParticipantAdmitted {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            });
        }
        Ok(admitted)
    }

    /// All participant records for a session, join order
    pub async fn participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, user_id, display_name, role, is_active, waiting, joined_at, left_at
            FROM participants WHERE session_id = ?1 ORDER BY joined_at
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ParticipantRecord::from).collect())
    }

    /// Active, admitted participants
    pub async fn active_participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>> {
        Ok(self
            .participants(session_id)
            .await?
            .into_iter()
            .filter(|p| p.is_active && !p.waiting)
            .collect())
    }

    /// Active participants still in the waiting room
    pub async fn waiting_participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>> {
        Ok(self
            .participants(session_id)
            .await?
            .into_iter()
            .filter(|p| p.is_active && p.waiting)
            .collect())
    }

    async fn participant_by_user(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<ParticipantRecord>> {
        let row: Option<ParticipantRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, user_id, display_name, role, is_active, waiting, joined_at, left_at
            FROM participants WHERE session_id = ?1 AND user_id = ?2
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ParticipantRecord::from))
    }

    async fn participant_by_id(&self, participant_id: &str) -> Result<Option<ParticipantRecord>> {
        let row: Option<ParticipantRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, user_id, display_name, role, is_active, waiting, joined_at, left_at
            FROM participants WHERE id = ?1
            "#,
        )
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ParticipantRecord::from))
    }

    /// Record per-peer transport state for diagnostics and resumption
    pub async fn update_connection_state(
        &self,
        session_id: &str,
        peer_id: &str,
        connection_state: ConnectionState,
        ice_state: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO connection_states (session_id, peer_id, connection_state, ice_state, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(session_id, peer_id) DO UPDATE SET
                connection_state = excluded.connection_state,
                ice_state = excluded.ice_state,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(peer_id)
        .bind(connection_state.to_string())
        .bind(ice_state)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All recorded per-peer connection states
    pub async fn connection_states(&self, session_id: &str) -> Result<Vec<ConnectionStateRecord>> {
        let rows: Vec<(String, String, Option<String>, String)> = sqlx::query_as(
            r#"
            SELECT peer_id, connection_state, ice_state, updated_at
            FROM connection_states WHERE session_id = ?1 ORDER BY peer_id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(peer_id, state, ice_state, updated_at)| ConnectionStateRecord {
                peer_id,
                connection_state: state.parse().unwrap_or(ConnectionState::New),
                ice_state,
                updated_at: parse_timestamp(&updated_at),
            })
            .collect())
    }

    /// Buffer a signaling message that arrived mid-reconnection
    pub async fn add_pending_signaling(
        &self,
        session_id: &str,
        message: &SignalingMessage,
    ) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        sqlx::query(
            r#"
            INSERT INTO pending_signaling (session_id, kind, payload, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(session_id)
        .bind(message.kind())
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Buffered signaling messages in arrival order
    pub async fn get_pending_signaling(&self, session_id: &str) -> Result<Vec<SignalingMessage>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM pending_signaling WHERE session_id = ?1 ORDER BY id",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(payload,)| serde_json::from_str(&payload).ok())
            .collect())
    }

    /// Drop the replay buffer after the messages have been applied
    pub async fn clear_pending_signaling(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_signaling WHERE session_id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Underlying pool, for maintenance queries
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

type ParticipantRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    i64,
    String,
    Option<String>,
);

impl From<ParticipantRow> for ParticipantRecord {
    fn from(
        (id, session_id, user_id, display_name, role, is_active, waiting, joined_at, left_at): ParticipantRow,
    ) -> Self {
        Self {
            participant_id: id,
            session_id,
            user_id,
            display_name,
            role: role.parse().unwrap_or(SessionRole::Participant),
            is_active: is_active != 0,
            waiting: waiting != 0,
            joined_at: parse_timestamp(&joined_at),
            left_at: left_at.as_deref().map(parse_timestamp),
        }
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::signaling::{IceCandidate, SdpAnswer};
    use tempfile::tempdir;

    async fn open_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&dir.path().join("test.db")).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_initialize_session_upsert_dedup() {
        let (store, _dir) = open_store().await;

        store.initialize_session("S1", Some("U1")).await.unwrap();
        store.initialize_session("S1", Some("U1")).await.unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE id = 'S1'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);

        let record = store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(record.host_user_id.as_deref(), Some("U1"));
        assert!(!record.paused);
    }

    #[tokio::test]
    async fn test_status_round_trip() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", None).await.unwrap();

        store.update_status("S1", SessionStatus::Active).await.unwrap();
        let record = store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Active);

        store
            .update_status("S1", SessionStatus::Reconnecting)
            .await
            .unwrap();
        let record = store.get_session("S1").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Reconnecting);
    }

    #[tokio::test]
    async fn test_participant_upsert_reactivates() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", Some("U1")).await.unwrap();

        let first = store
            .add_participant("S1", Some("U1"), "Alice", SessionRole::Host, false, 8)
            .await
            .unwrap();
        store.remove_participant("S1", "U1").await.unwrap();

        let after_leave = store.participants("S1").await.unwrap();
        assert_eq!(after_leave.len(), 1);
        assert!(!after_leave[0].is_active);
        assert!(after_leave[0].left_at.is_some());

        // Re-registration reuses the row and reactivates it
        let second = store
            .add_participant("S1", Some("U1"), "Alice", SessionRole::Host, false, 8)
            .await
            .unwrap();
        assert_eq!(second.participant_id, first.participant_id);

        let records = store.participants("S1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_active);
        assert!(records[0].left_at.is_none());
    }

    #[tokio::test]
    async fn test_waiting_room_admission() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", Some("U1")).await.unwrap();

        let guest = store
            .add_participant("S1", Some("U2"), "Bob", SessionRole::Participant, true, 8)
            .await
            .unwrap();
        assert!(guest.waiting);
        assert_eq!(store.waiting_participants("S1").await.unwrap().len(), 1);
        assert_eq!(store.active_participants("S1").await.unwrap().len(), 0);

        assert!(store.admit_participant("S1", &guest.participant_id).await.unwrap());
        // Admitting twice is a no-op
        assert!(!store.admit_participant("S1", &guest.participant_id).await.unwrap());

        assert_eq!(store.waiting_participants("S1").await.unwrap().len(), 0);
        assert_eq!(store.active_participants("S1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_gates_the_insert() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", Some("U1")).await.unwrap();

        store
            .add_participant("S1", Some("U1"), "Alice", SessionRole::Host, false, 2)
            .await
            .unwrap();
        store
            .add_participant("S1", Some("U2"), "Bob", SessionRole::Participant, true, 2)
            .await
            .unwrap();

        let err = store
            .add_participant("S1", Some("U3"), "Carol", SessionRole::Participant, true, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionFull { capacity: 2 }));

        // An active user re-registering keeps their own slot at capacity
        store
            .add_participant("S1", Some("U2"), "Bob", SessionRole::Participant, true, 2)
            .await
            .unwrap();

        // Anonymous guests count toward capacity too
        let err = store
            .add_participant("S1", None, "Guest", SessionRole::Participant, true, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionFull { .. }));
    }

    #[tokio::test]
    async fn test_end_session_deletes_everything() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", Some("U1")).await.unwrap();
        store
            .add_participant("S1", Some("U1"), "Alice", SessionRole::Host, false, 8)
            .await
            .unwrap();
        store
            .update_connection_state("S1", "peer-1", ConnectionState::Connected, Some("connected"))
            .await
            .unwrap();
        store
            .add_pending_signaling("S1", &SignalingMessage::Close)
            .await
            .unwrap();

        store.end_session("S1").await.unwrap();

        assert!(store.get_session("S1").await.unwrap().is_none());
        assert!(store.participants("S1").await.unwrap().is_empty());
        assert!(store.connection_states("S1").await.unwrap().is_empty());
        assert!(store.get_pending_signaling("S1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_context_round_trip() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", None).await.unwrap();

        store.record_disconnection("S1", "ice failure").await.unwrap();
        store.record_disconnection("S1", "ice failure").await.unwrap();

        let context = store.recovery_context("S1").await.unwrap().unwrap();
        assert_eq!(context.reconnection_count, 2);
        assert_eq!(context.reason.as_deref(), Some("ice failure"));
        assert!(context.disconnected_at.is_some());

        store.clear_recovery_context("S1").await.unwrap();
        let context = store.recovery_context("S1").await.unwrap().unwrap();
        assert_eq!(context.reconnection_count, 0);
        assert!(context.reason.is_none());
    }

    #[tokio::test]
    async fn test_pending_signaling_fifo() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", None).await.unwrap();

        store
            .add_pending_signaling(
                "S1",
                &SignalingMessage::Answer(SdpAnswer::new("v=0")),
            )
            .await
            .unwrap();
        store
            .add_pending_signaling(
                "S1",
                &SignalingMessage::Candidate(IceCandidate::new("candidate:1")),
            )
            .await
            .unwrap();

        let pending = store.get_pending_signaling("S1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].kind(), "answer");
        assert_eq!(pending[1].kind(), "candidate");

        store.clear_pending_signaling("S1").await.unwrap();
        assert!(store.get_pending_signaling("S1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", None).await.unwrap();

        store.pause_session("S1").await.unwrap();
        assert!(store.get_session("S1").await.unwrap().unwrap().paused);

        // Pausing leaves the recovery budget untouched
        let context = store.recovery_context("S1").await.unwrap().unwrap();
        assert_eq!(context.reconnection_count, 0);

        store.resume_session("S1").await.unwrap();
        assert!(!store.get_session("S1").await.unwrap().unwrap().paused);
    }

    #[tokio::test]
    async fn test_connection_state_upsert() {
        let (store, _dir) = open_store().await;
        store.initialize_session("S1", None).await.unwrap();

        store
            .update_connection_state("S1", "peer-1", ConnectionState::Connecting, None)
            .await
            .unwrap();
        store
            .update_connection_state("S1", "peer-1", ConnectionState::Connected, Some("connected"))
            .await
            .unwrap();

        let states = store.connection_states("S1").await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].connection_state, ConnectionState::Connected);
        assert_eq!(states[0].ice_state.as_deref(), Some("connected"));
    }

    #[tokio::test]
    async fn test_change_notifications() {
        let (store, _dir) = open_store().await;
        let mut rx = store.subscribe();

        store.initialize_session("S1", Some("U1")).await.unwrap();
        let guest = store
            .add_participant("S1", Some("U2"), "Bob", SessionRole::Participant, true, 8)
            .await
            .unwrap();
        store.admit_participant("S1", &guest.participant_id).await.unwrap();

        let mut saw_registered = false;
        let mut saw_admitted = false;
        while let Ok(change) = rx.try_recv() {
            match change {
                StoreChange::ParticipantRegistered { participant_id, .. } => {
                    assert_eq!(participant_id, guest.participant_id);
                    saw_registered = true;
                }
                StoreChange::ParticipantAdmitted { participant_id, .. } => {
                    assert_eq!(participant_id, guest.participant_id);
                    saw_admitted = true;
                }
                _ => {}
            }
        }
        assert!(saw_registered);
        assert!(saw_admitted);
    }
}
