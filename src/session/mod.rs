//! Session lifecycle state machine
//!
//! [`SessionManager`] drives one local peer through a video session: joining
//! (media acquisition, then call initiation, each under its own timeout),
//! the waiting room for non-hosts, the active call, automatic recovery on
//! transport failure, and orderly teardown. Every transition is mirrored to
//! the persistence store and announced on the event bus.
//!
//! The manager is written against the [`MediaTransport`] trait and owns the
//! local media tracks exclusively: tracks are stopped exactly once, during
//! teardown, no matter how many times `leave_session` is called.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::events::types::SessionEvent;
use crate::events::EventBus;
use crate::quality::{QualityMonitor, QualityTier};
use crate::recovery::{RecoveryController, RecoveryOutcome, RecoveryTarget};
use crate::registry::ParticipantRegistry;
use crate::store::SessionStore;
use crate::transport::signaling::SignalingMessage;
use crate::transport::{ConnectionState, LocalStream, MediaTransport};
use crate::util::measure;

/// Session lifecycle status
///
/// `Ended` is terminal: a manager never leaves it, and rejoining means
/// constructing a fresh manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Idle,
    Joining,
    WaitingRoom,
    Active,
    Reconnecting,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Idle => write!(f, "idle"),
            SessionStatus::Joining => write!(f, "joining"),
            SessionStatus::WaitingRoom => write!(f, "waiting-room"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Reconnecting => write!(f, "reconnecting"),
            SessionStatus::Ended => write!(f, "ended"),
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SessionStatus::Idle),
            "joining" => Ok(SessionStatus::Joining),
            "waiting-room" => Ok(SessionStatus::WaitingRoom),
            "active" => Ok(SessionStatus::Active),
            "reconnecting" => Ok(SessionStatus::Reconnecting),
            "ended" => Ok(SessionStatus::Ended),
            _ => Err(()),
        }
    }
}

/// Role of the local peer in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Host,
    Participant,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionRole::Host => write!(f, "host"),
            SessionRole::Participant => write!(f, "participant"),
        }
    }
}

impl std::str::FromStr for SessionRole {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "host" => Ok(SessionRole::Host),
            "participant" => Ok(SessionRole::Participant),
            _ => Err(()),
        }
    }
}

/// Point-in-time view of the session, cheap to read from any thread
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub role: Option<SessionRole>,
    pub participant_id: Option<String>,
    pub quality: QualityTier,
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

/// Drives one local peer through the session lifecycle
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionManager {
    config: SessionConfig,
    session_id: String,
    user_id: Option<String>,
    display_name: String,
    transport: Arc<dyn MediaTransport>,
    store: SessionStore,
    registry: ParticipantRegistry,
    events: Arc<EventBus>,
    recovery: Arc<RecoveryController>,
    quality: Arc<QualityMonitor>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    status_rx: watch::Receiver<SessionStatus>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
    role: Arc<Mutex<Option<SessionRole>>>,
    participant_id: Arc<Mutex<Option<String>>>,
    local_stream: Arc<Mutex<Option<Arc<LocalStream>>>>,
    watcher_cancel: Arc<Mutex<Option<CancellationToken>>>,
}

impl SessionManager {
    pub fn new(
        session_id: impl Into<String>,
        user_id: Option<String>,
        display_name: impl Into<String>,
        config: SessionConfig,
        transport: Arc<dyn MediaTransport>,
        store: SessionStore,
    ) -> Self {
        let session_id = session_id.into();
        let events = Arc::new(EventBus::new());
        let registry = ParticipantRegistry::new(store.clone(), config.clone(), events.clone());
        let recovery = Arc::new(RecoveryController::new(config.recovery.clone(), events.clone()));
        let quality = Arc::new(QualityMonitor::new(
            transport.clone(),
            config.quality.clone(),
            events.clone(),
        ));
        let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
        let snapshot = Arc::new(ArcSwap::from_pointee(SessionSnapshot {
            session_id: session_id.clone(),
            status: SessionStatus::Idle,
            role: None,
            participant_id: None,
            quality: QualityTier::Good,
            video_enabled: false,
            audio_enabled: false,
        }));

        Self {
            config,
            session_id,
            user_id,
            display_name: display_name.into(),
            transport,
            store,
            registry,
            events,
            recovery,
            quality,
            status_tx: Arc::new(status_tx),
            status_rx,
            snapshot,
            role: Arc::new(Mutex::new(None)),
            participant_id: Arc::new(Mutex::new(None)),
            local_stream: Arc::new(Mutex::new(None)),
            watcher_cancel: Arc::new(Mutex::new(None)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn quality(&self) -> &Arc<QualityMonitor> {
        &self.quality
    }

    /// Current lifecycle status
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Watch channel carrying status transitions
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Lock-free point-in-time view
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    /// Join the session
    ///
    /// Acquires local media and initiates the call, each under its own
    /// timeout. Hosts go straight to `Active`; everyone else parks in the
    /// waiting room until the host admits them, then the call proceeds.
    /// On any failure the manager settles back to `Idle` with media
    /// released and no call ever initiated.
    pub async fn join_session(&self, role: SessionRole) -> Result<()> {
        let current = self.status();
        if current != SessionStatus::Idle {
            return Err(SessionError::InvalidState {
                operation: "join_session".into(),
                status: current.to_string(),
            });
        }

        *self.role.lock() = Some(role);
        self.publish_status(SessionStatus::Joining);

        match self.run_join(role).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Join failed for {}: {}", self.session_id, e);
                self.cleanup_failed_join(role).await;
                Err(e)
            }
        }
    }

    async fn run_join(&self, role: SessionRole) -> Result<()> {
        let host_user = if role == SessionRole::Host {
            self.user_id.as_deref()
        } else {
            None
        };
        self.store
            .initialize_session(&self.session_id, host_user)
            .await?;

        let record = self
            .registry
            .register_participant(
                &self.session_id,
                self.user_id.as_deref(),
                &self.display_name,
                role,
            )
            .await?;
        *self.participant_id.lock() = Some(record.participant_id.clone());
        self.refresh_snapshot(SessionStatus::Joining);

        self.transport.initialize().await?;

        let stream = self
            .with_timeout(
                "media acquisition",
                self.config.media_timeout(),
                measure("media acquisition", self.transport.local_stream()),
            )
            .await?;
        *self.local_stream.lock() = Some(stream.clone());

        if record.waiting {
            self.publish_status(SessionStatus::WaitingRoom);
            self.store
                .update_status(&self.session_id, SessionStatus::WaitingRoom)
                .await?;
            info!("Waiting for admission to {}", self.session_id);
            self.registry
                .await_admission(&self.session_id, &record.participant_id)
                .await?;
        }

        self.with_timeout(
            "call initiation",
            self.config.call_timeout(),
            measure("call initiation", self.transport.initiate_call(stream)),
        )
        .await?;

        self.settle_active().await?;
        info!("Joined session {} as {}", self.session_id, role);
        Ok(())
    }

    /// Finalize the transition to `Active` after a successful call setup
    ///
    /// The signaling buffer is drained here, after the status flip, so a
    /// message buffered right up to the flip is still replayed and nothing
    /// survives to leak into a later recovery.
    async fn settle_active(&self) -> Result<()> {
        self.publish_status(SessionStatus::Active);
        self.drain_pending_signaling().await?;
        self.store
            .update_status(&self.session_id, SessionStatus::Active)
            .await?;
        self.store.clear_recovery_context(&self.session_id).await?;
        self.store
            .update_connection_state(
                &self.session_id,
                self.peer_id(),
                ConnectionState::Connected,
                None,
            )
            .await?;

        self.quality.reset();
        self.quality.start();
        self.start_failure_watcher();
        Ok(())
    }

    async fn cleanup_failed_join(&self, role: SessionRole) {
        if let Some(stream) = self.local_stream.lock().take() {
            stream.stop_all();
        }
        if let Err(e) = self.transport.destroy().await {
            debug!("Transport teardown after failed join: {}", e);
        }

        // A host that never got in takes the fresh record with it; a guest
        // leaves the existing session untouched
        let result = match (role, self.user_id.as_deref()) {
            (SessionRole::Host, _) => self.store.end_session(&self.session_id).await,
            (SessionRole::Participant, Some(uid)) => {
                self.registry.unregister_participant(&self.session_id, uid).await
            }
            (SessionRole::Participant, None) => Ok(()),
        };
        if let Err(e) = result {
            warn!("Cleanup after failed join: {}", e);
        }

        *self.participant_id.lock() = None;
        *self.role.lock() = None;
        self.publish_status(SessionStatus::Idle);
    }

    /// Leave the session
    ///
    /// Infallible and idempotent: the first call stops local tracks, tears
    /// the transport down, deletes the durable record, and settles in
    /// `Ended`; later calls return immediately.
    pub async fn leave_session(&self) {
        if self.status() == SessionStatus::Ended {
            return;
        }
        info!("Leaving session {}", self.session_id);

        self.stop_background_tasks();
        self.teardown_transport().await;

        if let Some(uid) = self.user_id.as_deref() {
            if let Err(e) = self.registry.unregister_participant(&self.session_id, uid).await {
                warn!("Participant unregister on leave: {}", e);
            }
        }
        if let Err(e) = self.store.end_session(&self.session_id).await {
            warn!("Session record delete on leave: {}", e);
        }

        self.publish_status(SessionStatus::Ended);
        self.events.publish(SessionEvent::SessionEnded {
            session_id: self.session_id.clone(),
        });
    }

    /// Admit a waiting participant
    ///
    /// Only a host can admit; from anyone else this is a no-op. Returns
    /// whether a waiting participant was actually admitted.
    pub async fn admit_participant(&self, participant_id: &str) -> Result<bool> {
        if *self.role.lock() != Some(SessionRole::Host) {
            debug!("Ignoring admission attempt from a non-host");
            return Ok(false);
        }
        self.registry.admit(&self.session_id, participant_id).await
    }

    /// Toggle the local video track; returns the new enabled state
    ///
    /// With no local stream the snapshot state is reported untouched.
    pub async fn toggle_video(&self) -> Result<bool> {
        let enabled = self.transport.toggle_video().await?;
        self.refresh_snapshot(self.status());
        Ok(enabled)
    }

    /// Toggle the local audio track; returns the new enabled state
    pub async fn toggle_audio(&self) -> Result<bool> {
        let enabled = self.transport.toggle_audio().await?;
        self.refresh_snapshot(self.status());
        Ok(enabled)
    }

    /// Mark the session paused (tab backgrounded)
    ///
    /// Quality sampling stops so a throttled timer cannot masquerade as a
    /// failing connection; the recovery budget is untouched.
    pub async fn pause(&self) -> Result<()> {
        self.quality.stop();
        self.store.pause_session(&self.session_id).await
    }

    /// Resume from a pause, or pick up a previous process's session
    ///
    /// Restores the persisted recovery context so a reload mid-recovery
    /// resumes attempt counting instead of restarting from zero.
    pub async fn resume(&self) -> Result<()> {
        self.store.resume_session(&self.session_id).await?;

        if let Some(context) = self.store.recovery_context(&self.session_id).await? {
            if context.reconnection_count > 0 {
                debug!(
                    "Resuming recovery context: {} attempts consumed",
                    context.reconnection_count
                );
                self.recovery.resume_from(context.reconnection_count);
            }
        }

        if self.status() == SessionStatus::Active {
            self.quality.start();
        }
        Ok(())
    }

    /// Feed an inbound signaling message to the transport
    ///
    /// Messages arriving while the session is mid-reconnection are buffered
    /// durably and replayed once the connection is re-established.
    pub async fn handle_signaling(&self, message: SignalingMessage) -> Result<()> {
        if self.status() == SessionStatus::Reconnecting {
            debug!("Buffering {} during reconnection", message.kind());
            self.store
                .add_pending_signaling(&self.session_id, &message)
                .await?;
            // The connection may have come back while the write was in
            // flight; drain now so the message is not stranded in the
            // buffer until the next recovery
            if self.status() != SessionStatus::Reconnecting {
                return self.drain_pending_signaling().await;
            }
            return Ok(());
        }
        self.transport.apply_signaling(message).await
    }

    /// Apply and clear whatever signaling was buffered while the
    /// connection was down
    async fn drain_pending_signaling(&self) -> Result<()> {
        let pending = self.store.get_pending_signaling(&self.session_id).await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Replaying {} buffered signaling messages", pending.len());
        // Clear first: a failed replay must not resurface stale messages
        // on a later recovery
        self.store.clear_pending_signaling(&self.session_id).await?;
        for message in pending {
            self.transport.apply_signaling(message).await?;
        }
        Ok(())
    }

    fn peer_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or("local")
    }

    /// Send the status to watchers, the event bus, and the snapshot.
    /// Durable writes are the caller's business.
    fn publish_status(&self, status: SessionStatus) {
        let _ = self.status_tx.send(status);
        self.refresh_snapshot(status);
        self.events.publish(SessionEvent::StatusChanged { status });
    }

    fn refresh_snapshot(&self, status: SessionStatus) {
        let (video_enabled, audio_enabled) = {
            let stream = self.local_stream.lock();
            match stream.as_ref() {
                Some(s) => (
                    s.video_track().map(|t| t.is_enabled()).unwrap_or(false),
                    s.audio_track().map(|t| t.is_enabled()).unwrap_or(false),
                ),
                None => (false, false),
            }
        };
        self.snapshot.store(Arc::new(SessionSnapshot {
            session_id: self.session_id.clone(),
            status,
            role: *self.role.lock(),
            participant_id: self.participant_id.lock().clone(),
            quality: self.quality.assessment().tier,
            video_enabled,
            audio_enabled,
        }));
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        timeout: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionTimeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn stop_background_tasks(&self) {
        if let Some(token) = self.watcher_cancel.lock().take() {
            token.cancel();
        }
        self.quality.stop();
        self.recovery.stop();
    }

    /// Release media and destroy the transport; the durable record survives
    async fn teardown_transport(&self) {
        let stream = self.local_stream.lock().take();
        if let Some(stream) = stream {
            let stopped = stream.stop_all();
            debug!("Stopped {} local tracks", stopped);
        }
        if let Err(e) = self.transport.destroy().await {
            debug!("Transport destroy: {}", e);
        }
    }

    /// Watch for transport failure, dead media, and sustained critical
    /// quality; any of them arms the recovery controller
    fn start_failure_watcher(&self) {
        if let Some(token) = self.watcher_cancel.lock().take() {
            token.cancel();
        }
        let token = CancellationToken::new();
        *self.watcher_cancel.lock() = Some(token.clone());

        let manager = self.clone();
        let mut state_rx = self.transport.state_watch();
        let mut quality_rx = self.quality.assessment_watch();
        let zombie_interval = Duration::from_millis(self.config.quality.sample_interval_ms);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(zombie_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *state_rx.borrow();
                        if state.is_failure() {
                            manager.trigger_recovery(&format!("transport {}", state));
                        }
                    }
                    changed = quality_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let assessment = quality_rx.borrow().clone();
                        if let Err(e) = manager
                            .store
                            .update_quality(&manager.session_id, &assessment)
                            .await
                        {
                            debug!("Quality persist: {}", e);
                        }
                        manager.refresh_snapshot(manager.status());
                        if manager.quality.should_trigger_recovery() {
                            manager.trigger_recovery("sustained critical quality");
                        }
                    }
                    _ = ticker.tick() => {
                        // Connected but with every local track dead is a
                        // zombie call; the peer sees a frozen frame
                        if manager.transport.connection_state() == ConnectionState::Connected
                            && !manager.transport.has_live_media()
                        {
                            manager.trigger_recovery("media tracks ended");
                        }
                    }
                }
            }
        });
    }

    /// Arm the recovery controller; no-op if a run is already in flight
    fn trigger_recovery(&self, reason: &str) {
        if self.recovery.is_recovering() || self.status() != SessionStatus::Active {
            return;
        }
        warn!("Connection failure on {}: {}", self.session_id, reason);

        // Flip the status before yielding so a second failure signal
        // arriving right behind this one sees Reconnecting and bails
        self.publish_status(SessionStatus::Reconnecting);

        let manager = self.clone();
        let reason = reason.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager
                .store
                .update_status(&manager.session_id, SessionStatus::Reconnecting)
                .await
            {
                warn!("Status persist on disconnect: {}", e);
            }
            if let Err(e) = manager
                .store
                .record_disconnection(&manager.session_id, &reason)
                .await
            {
                warn!("Disconnect record: {}", e);
            }

            let target: Arc<dyn RecoveryTarget> = Arc::new(manager.clone());
            match manager.recovery.run(target).await {
                // `reestablish` already settled the session back to Active
                Ok(RecoveryOutcome::Succeeded { attempts }) => {
                    info!("Recovered {} after {} attempts", manager.session_id, attempts);
                }
                Ok(RecoveryOutcome::Cancelled) => {}
                Err(SessionError::RecoveryExhausted { attempts }) => {
                    // Fatal: the session is over, same teardown as an
                    // explicit leave
                    warn!(
                        "Recovery exhausted for {} after {} attempts",
                        manager.session_id, attempts
                    );
                    manager.leave_session().await;
                }
                Err(SessionError::InvalidState { .. }) => {}
                Err(e) => warn!("Recovery run failed: {}", e),
            }
        });
    }
}

#[async_trait]
impl RecoveryTarget for SessionManager {
    async fn drop_connection(&self) {
        self.quality.stop();
        self.teardown_transport().await;
        if let Err(e) = self
            .store
            .update_connection_state(
                &self.session_id,
                self.peer_id(),
                ConnectionState::Disconnected,
                None,
            )
            .await
        {
            debug!("Connection state persist: {}", e);
        }
    }

    async fn reestablish(&self) -> Result<()> {
        self.transport.initialize().await?;

        let stream = self
            .with_timeout(
                "media acquisition",
                self.config.media_timeout(),
                self.transport.local_stream(),
            )
            .await?;
        *self.local_stream.lock() = Some(stream.clone());

        self.with_timeout(
            "call initiation",
            self.config.call_timeout(),
            self.transport.initiate_call(stream),
        )
        .await?;

        self.settle_active().await
    }
}
