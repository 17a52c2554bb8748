//! Scriptable transport double for unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use super::signaling::SignalingMessage;
use super::{ConnectionState, LocalStream, MediaTransport, TransportStats};
use crate::error::{Result, SessionError};

/// In-memory transport with scriptable failures and observable call counts
pub struct MockTransport {
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    pub fail_media: AtomicBool,
    pub hang_media: AtomicBool,
    /// Number of upcoming `initiate_call` invocations that should fail
    pub fail_calls_remaining: AtomicU32,
    pub media_calls: AtomicU32,
    pub call_calls: AtomicU32,
    pub destroy_calls: AtomicU32,
    live_media: AtomicBool,
    last_stream: Mutex<Option<Arc<LocalStream>>>,
    stats_queue: Mutex<VecDeque<TransportStats>>,
    applied_signaling: Mutex<Vec<SignalingMessage>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        Self {
            state_tx: Arc::new(state_tx),
            state_rx,
            fail_media: AtomicBool::new(false),
            hang_media: AtomicBool::new(false),
            fail_calls_remaining: AtomicU32::new(0),
            media_calls: AtomicU32::new(0),
            call_calls: AtomicU32::new(0),
            destroy_calls: AtomicU32::new(0),
            live_media: AtomicBool::new(true),
            last_stream: Mutex::new(None),
            stats_queue: Mutex::new(VecDeque::new()),
            applied_signaling: Mutex::new(Vec::new()),
        }
    }

    /// Force the reported connection state, notifying watchers
    pub fn set_connection_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send(state);
    }

    pub fn set_live_media(&self, live: bool) {
        self.live_media.store(live, Ordering::Release);
    }

    pub fn push_stats(&self, stats: TransportStats) {
        self.stats_queue.lock().push_back(stats);
    }

    pub fn last_stream(&self) -> Option<Arc<LocalStream>> {
        self.last_stream.lock().clone()
    }

    pub fn applied_signaling(&self) -> Vec<SignalingMessage> {
        self.applied_signaling.lock().clone()
    }
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn local_stream(&self) -> Result<Arc<LocalStream>> {
        self.media_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_media.load(Ordering::Acquire) {
            // Simulates a permission prompt that never resolves
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        if self.fail_media.load(Ordering::Acquire) {
            return Err(SessionError::MediaAccess("permission denied".into()));
        }
        let stream = Arc::new(LocalStream::with_video_and_audio());
        *self.last_stream.lock() = Some(stream.clone());
        Ok(stream)
    }

    async fn initiate_call(&self, stream: Arc<LocalStream>) -> Result<bool> {
        self.call_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_calls_remaining.load(Ordering::Acquire);
        if remaining > 0 {
            self.fail_calls_remaining.store(remaining - 1, Ordering::Release);
            return Err(SessionError::TransportFailure("signaling unreachable".into()));
        }
        *self.last_stream.lock() = Some(stream);
        let _ = self.state_tx.send(ConnectionState::Connected);
        Ok(true)
    }

    async fn toggle_video(&self) -> Result<bool> {
        let guard = self.last_stream.lock();
        match guard.as_ref().and_then(|s| s.video_track()) {
            Some(track) => Ok(track.toggle()),
            None => Ok(false),
        }
    }

    async fn toggle_audio(&self) -> Result<bool> {
        let guard = self.last_stream.lock();
        match guard.as_ref().and_then(|s| s.audio_track()) {
            Some(track) => Ok(track.toggle()),
            None => Ok(false),
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn stats(&self) -> Result<TransportStats> {
        let next = self.stats_queue.lock().pop_front();
        Ok(next.unwrap_or_else(TransportStats::now))
    }

    fn has_live_media(&self) -> bool {
        self.live_media.load(Ordering::Acquire)
    }

    async fn apply_signaling(&self, message: SignalingMessage) -> Result<()> {
        self.applied_signaling.lock().push(message);
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.state_tx.send(ConnectionState::Closed);
        Ok(())
    }
}
