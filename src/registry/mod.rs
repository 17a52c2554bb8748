//! Participant registry
//!
//! Gatekeeper in front of the persistence store: registration is validated
//! against session liveness and capacity before any row is written, hosts
//! join directly while everyone else lands in the waiting room, and stale
//! session records are swept out once their liveness stamp ages past the
//! configured TTL.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::types::SessionEvent;
use crate::events::EventBus;
use crate::session::SessionRole;
use crate::store::{ParticipantRecord, SessionStore, StoreChange};

/// Poll fallback used when the change channel lags or closes
const ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Validated participant registration over the persistence store
#[derive(Clone)]
pub struct ParticipantRegistry {
    store: SessionStore,
    config: SessionConfig,
    events: Arc<EventBus>,
}

impl ParticipantRegistry {
    pub fn new(store: SessionStore, config: SessionConfig, events: Arc<EventBus>) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Register a participant in a session
    ///
    /// Validates the session before writing: it must exist, must not have
    /// aged past the liveness TTL, and must have room. Hosts are admitted
    /// immediately; everyone else starts in the waiting room. Registering
    /// the same user twice reactivates the existing record.
    pub async fn register_participant(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        display_name: &str,
        role: SessionRole,
    ) -> Result<ParticipantRecord> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let ttl = ChronoDuration::seconds(self.config.session_ttl_secs as i64);
        if Utc::now() - session.last_active_at > ttl {
            return Err(SessionError::SessionExpired(session_id.to_string()));
        }

        // Capacity is enforced by the store inside the insert itself, so
        // two registrations racing past this point cannot oversubscribe;
        // a user re-registering reclaims their own slot
        let waiting = role != SessionRole::Host;
        let record = self
            .store
            .add_participant(
                session_id,
                user_id,
                display_name,
                role,
                waiting,
                self.config.capacity,
            )
            .await?;

        info!(
            "Participant {} registered in {} as {} ({})",
            record.participant_id,
            session_id,
            role,
            if waiting { "waiting" } else { "admitted" }
        );
        self.events.publish(SessionEvent::ParticipantRegistered {
            participant_id: record.participant_id.clone(),
            display_name: display_name.to_string(),
        });
        Ok(record)
    }

    /// Mark a participant as having left
    ///
    /// Idempotent; the durable record is kept (inactive) for the lifetime
    /// of the session.
    pub async fn unregister_participant(&self, session_id: &str, user_id: &str) -> Result<()> {
        let was_active = self
            .store
            .participants(session_id)
            .await?
            .iter()
            .any(|p| p.is_active && p.user_id.as_deref() == Some(user_id));

        self.store.remove_participant(session_id, user_id).await?;

        if was_active {
            self.events.publish(SessionEvent::ParticipantLeft {
                participant_id: user_id.to_string(),
            });
        }
        Ok(())
    }

    /// Admit a waiting participant (host action)
    ///
    /// Returns `false` if the participant was not waiting; admitting twice
    /// is a no-op.
    pub async fn admit(&self, session_id: &str, participant_id: &str) -> Result<bool> {
        let admitted = self.store.admit_participant(session_id, participant_id).await?;
        if admitted {
            info!("Participant {} admitted to {}", participant_id, session_id);
            self.events.publish(SessionEvent::ParticipantAdmitted {
                participant_id: participant_id.to_string(),
            });
        }
        Ok(admitted)
    }

    /// Active, admitted participants
    pub async fn active_participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>> {
        self.store.active_participants(session_id).await
    }

    /// Participants still in the waiting room
    pub async fn waiting_participants(&self, session_id: &str) -> Result<Vec<ParticipantRecord>> {
        self.store.waiting_participants(session_id).await
    }

    /// Block until the given participant is admitted
    ///
    /// Listens on the store change channel, falling back to polling when the
    /// channel lags. Returns immediately if the participant is already
    /// admitted; errors if the session ends while waiting.
    pub async fn await_admission(&self, session_id: &str, participant_id: &str) -> Result<()> {
        let mut changes = self.store.subscribe();

        loop {
            match self.store.participants(session_id).await?.iter().find(|p| {
                p.participant_id == participant_id
            }) {
                Some(p) if !p.is_active => {
                    return Err(SessionError::InvalidState {
                        operation: "await_admission".into(),
                        status: "left".into(),
                    })
                }
                Some(p) if !p.waiting => return Ok(()),
                Some(_) => {}
                None => return Err(SessionError::NotFound(participant_id.to_string())),
            }

            match tokio::time::timeout(ADMISSION_POLL_INTERVAL, changes.recv()).await {
                Ok(Ok(StoreChange::ParticipantAdmitted {
                    participant_id: admitted,
                    ..
                })) if admitted == participant_id => return Ok(()),
                Ok(Ok(StoreChange::SessionEnded { session_id: ended })) if ended == session_id => {
                    return Err(SessionError::NotFound(session_id.to_string()))
                }
                Ok(Ok(_)) => {}
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!("Change channel lagged by {}, re-fetching", skipped);
                }
                // Channel closed or poll interval elapsed; re-fetch
                Ok(Err(RecvError::Closed)) | Err(_) => {}
            }
        }
    }

    /// Delete session records whose liveness stamp has aged past the TTL
    ///
    /// Returns the number of sessions swept. Intended to run periodically
    /// from whatever scheduler the embedding application provides.
    pub async fn cleanup_stale(&self) -> Result<u32> {
        let cutoff = (Utc::now()
            - ChronoDuration::seconds(self.config.session_ttl_secs as i64))
        .to_rfc3339();

        let stale: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM sessions WHERE last_active_at < ?1")
                .bind(&cutoff)
                .fetch_all(self.store.pool())
                .await?;

        for (session_id,) in &stale {
            warn!("Sweeping stale session {}", session_id);
        }
        let results = futures::future::join_all(
            stale.iter().map(|(session_id,)| self.store.end_session(session_id)),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(stale.len() as u32)
    }
}
