//! Media transport capability interface
//!
//! The session core is written against the [`MediaTransport`] trait and never
//! names a concrete engine. A default adapter over webrtc-rs lives in
//! [`webrtc`]; tests plug in a scriptable mock.

pub mod signaling;
pub mod webrtc;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::Result;
use signaling::SignalingMessage;

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Whether this state should arm the recovery controller
    pub fn is_failure(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for ConnectionState {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "new" => Ok(ConnectionState::New),
            "connecting" => Ok(ConnectionState::Connecting),
            "connected" => Ok(ConnectionState::Connected),
            "disconnected" => Ok(ConnectionState::Disconnected),
            "failed" => Ok(ConnectionState::Failed),
            "closed" => Ok(ConnectionState::Closed),
            _ => Err(()),
        }
    }
}

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

/// A local media track handle
///
/// The session state machine is the exclusive owner of local tracks: only it
/// calls [`MediaTrack::stop`], and only during teardown. Other components
/// hold read-only references.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Flip the enabled flag, returning the new state
    ///
    /// A stopped track cannot be re-enabled; the current (disabled) state is
    /// returned unchanged.
    pub fn toggle(&self) -> bool {
        if self.is_stopped() {
            return self.is_enabled();
        }
        let new = !self.enabled.load(Ordering::Acquire);
        self.enabled.store(new, Ordering::Release);
        new
    }

    /// Stop the track, releasing the underlying device handle
    ///
    /// Idempotent: returns `true` only on the stopping transition.
    pub fn stop(&self) -> bool {
        let was_stopped = self.stopped.swap(true, Ordering::AcqRel);
        if !was_stopped {
            self.enabled.store(false, Ordering::Release);
        }
        !was_stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Local media stream: the set of tracks acquired from camera/microphone
#[derive(Debug, Default)]
pub struct LocalStream {
    tracks: Vec<Arc<MediaTrack>>,
}

impl LocalStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self { tracks }
    }

    /// A stream with one video and one audio track, both enabled
    pub fn with_video_and_audio() -> Self {
        Self::new(vec![
            Arc::new(MediaTrack::new(TrackKind::Video)),
            Arc::new(MediaTrack::new(TrackKind::Audio)),
        ])
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn video_track(&self) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// Stop every track, returning how many actually transitioned to stopped
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }

    /// Whether any track is still live (not stopped)
    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_stopped())
    }
}

/// Cumulative transport statistics snapshot
///
/// Counters are cumulative since connection start; the quality monitor
/// computes per-interval deltas. Metrics the transport cannot measure are
/// `None`, never zero.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub round_trip_time_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub frames_per_second: Option<f64>,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
    /// Snapshot time, unix epoch milliseconds
    pub timestamp_ms: i64,
}

impl TransportStats {
    /// An empty snapshot stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }
}

/// Capability interface for the underlying media transport
///
/// Implementations wrap whatever peer-to-peer or relayed engine is plugged
/// in. All methods are cancel-safe; `destroy` must be idempotent.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Prepare the transport (peer connection, codecs, ICE agents)
    async fn initialize(&self) -> Result<()>;

    /// Acquire the local media stream (camera/microphone)
    async fn local_stream(&self) -> Result<Arc<LocalStream>>;

    /// Start the call with the given local stream
    ///
    /// Returns `true` once the signaling handshake has been sent.
    async fn initiate_call(&self, stream: Arc<LocalStream>) -> Result<bool>;

    /// Toggle the outgoing video track, returning the new enabled state
    async fn toggle_video(&self) -> Result<bool>;

    /// Toggle the outgoing audio track, returning the new enabled state
    async fn toggle_audio(&self) -> Result<bool>;

    /// Current transport connection state
    fn connection_state(&self) -> ConnectionState;

    /// Watch channel following connection state changes
    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    /// Current statistics snapshot
    async fn stats(&self) -> Result<TransportStats>;

    /// Whether the transport is actually carrying media
    ///
    /// A transport that reports `connected` while this returns `false` is a
    /// zombie connection and is treated as failed.
    fn has_live_media(&self) -> bool;

    /// Apply a buffered signaling message (answer/candidate replay)
    async fn apply_signaling(&self, message: SignalingMessage) -> Result<()>;

    /// Tear the transport down and release its resources
    async fn destroy(&self) -> Result<()>;
}
