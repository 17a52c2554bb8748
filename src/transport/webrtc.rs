//! Default media transport adapter over webrtc-rs
//!
//! Owns the `RTCPeerConnection`, maps its state changes into the crate's
//! [`ConnectionState`] watch channel, gathers trickle-ICE candidates, and
//! applies replayed signaling messages. Media capture is delegated to the
//! embedding media layer, which feeds this adapter's statistics snapshot via
//! [`WebRtcTransport::record_stats`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::signaling::{IceCandidate, SdpAnswer, SdpOffer, SignalingMessage};
use super::{ConnectionState, LocalStream, MediaTransport, TransportStats};
use crate::error::{Result, SessionError};

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs; multiple URLs allow UDP/TCP fallback
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Transport adapter configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    /// STUN server URLs; empty means host candidates only
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

/// Media transport backed by a webrtc-rs peer connection
pub struct WebRtcTransport {
    config: TransportConfig,
    pc: RwLock<Option<Arc<RTCPeerConnection>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    local_stream: RwLock<Option<Arc<LocalStream>>>,
    /// Set once a remote track has been observed on the current connection
    remote_media: Arc<AtomicBool>,
    /// ICE candidates gathered since the last (re)initialization
    ice_candidates: Arc<Mutex<Vec<IceCandidate>>>,
    /// Last statistics snapshot fed by the media layer
    stats: RwLock<TransportStats>,
    /// Local offer created by `initiate_call`, for the signaling layer
    local_offer: RwLock<Option<SdpOffer>>,
}

impl WebRtcTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        Self {
            config,
            pc: RwLock::new(None),
            state_tx: Arc::new(state_tx),
            state_rx,
            local_stream: RwLock::new(None),
            remote_media: Arc::new(AtomicBool::new(false)),
            ice_candidates: Arc::new(Mutex::new(vec![])),
            stats: RwLock::new(TransportStats::default()),
            local_offer: RwLock::new(None),
        }
    }

    /// Record a statistics snapshot from the media layer
    ///
    /// The RTP pipeline that actually moves frames owns the counters; this
    /// adapter only caches the latest snapshot for the quality monitor.
    pub async fn record_stats(&self, stats: TransportStats) {
        *self.stats.write().await = stats;
    }

    /// The SDP offer produced by the last `initiate_call`
    pub async fn local_offer(&self) -> Option<SdpOffer> {
        self.local_offer.read().await.clone()
    }

    /// ICE candidates gathered so far on the current connection
    pub async fn gathered_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.lock().await.clone()
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![];
        for stun_url in &self.config.stun_servers {
            servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }
        for turn in &self.config.turn_servers {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }
        servers
    }

    async fn build_peer_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SessionError::TransportFailure(format!("register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SessionError::TransportFailure(format!("register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| SessionError::TransportFailure(format!("create peer connection: {}", e)))?;

        Ok(Arc::new(pc))
    }

    async fn setup_event_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        let state = self.state_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = state.clone();
            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };
                info!("Peer connection state: {}", new_state);
                let _ = state.send(new_state);
            })
        }));

        let ice_candidates = self.ice_candidates.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ice_candidates = ice_candidates.clone();
            Box::pin(async move {
                if let Some(c) = candidate {
                    let candidate_str = c.to_json().map(|j| j.candidate).unwrap_or_default();
                    debug!("ICE candidate: {}", candidate_str);

                    let mut candidates = ice_candidates.lock().await;
                    candidates.push(IceCandidate {
                        candidate: candidate_str,
                        sdp_mid: c.to_json().ok().and_then(|j| j.sdp_mid),
                        sdp_mline_index: c.to_json().ok().and_then(|j| j.sdp_mline_index),
                        username_fragment: None,
                    });
                }
            })
        }));

        let remote_media = self.remote_media.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote_media = remote_media.clone();
            let kind = track.kind();
            Box::pin(async move {
                info!("Remote track received: {}", kind);
                remote_media.store(true, Ordering::Release);
            })
        }));
    }

    async fn require_pc(&self) -> Result<Arc<RTCPeerConnection>> {
        self.pc
            .read()
            .await
            .clone()
            .ok_or_else(|| SessionError::TransportFailure("transport not initialized".into()))
    }

    /// Handle a remote SDP offer and produce an answer (callee path)
    pub async fn handle_offer(&self, offer: SdpOffer) -> Result<SdpAnswer> {
        let pc = self.require_pc().await?;

        let sdp = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| SessionError::TransportFailure(format!("invalid SDP offer: {}", e)))?;
        pc.set_remote_description(sdp)
            .await
            .map_err(|e| SessionError::TransportFailure(format!("set remote description: {}", e)))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| SessionError::TransportFailure(format!("create answer: {}", e)))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| SessionError::TransportFailure(format!("set local description: {}", e)))?;

        let candidates = self.ice_candidates.lock().await.clone();
        Ok(SdpAnswer::with_candidates(answer.sdp, candidates))
    }

    async fn handle_answer(&self, answer: SdpAnswer) -> Result<()> {
        let pc = self.require_pc().await?;

        let sdp = RTCSessionDescription::answer(answer.sdp)
            .map_err(|e| SessionError::TransportFailure(format!("invalid SDP answer: {}", e)))?;
        pc.set_remote_description(sdp)
            .await
            .map_err(|e| SessionError::TransportFailure(format!("set remote description: {}", e)))?;

        if let Some(candidates) = answer.ice_candidates {
            for candidate in candidates {
                self.add_remote_candidate(candidate).await?;
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let pc = self.require_pc().await?;

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| SessionError::TransportFailure(format!("add ICE candidate: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for WebRtcTransport {
    async fn initialize(&self) -> Result<()> {
        // Re-initialization during recovery replaces the old connection
        if let Some(old) = self.pc.write().await.take() {
            if let Err(e) = old.close().await {
                warn!("Failed to close stale peer connection: {}", e);
            }
        }
        self.remote_media.store(false, Ordering::Release);
        self.ice_candidates.lock().await.clear();
        *self.local_offer.write().await = None;

        let pc = self.build_peer_connection().await?;
        self.setup_event_handlers(&pc).await;
        *self.pc.write().await = Some(pc);

        let _ = self.state_tx.send(ConnectionState::New);
        Ok(())
    }

    async fn local_stream(&self) -> Result<Arc<LocalStream>> {
        // Capture devices are attached by the embedding media layer; this
        // adapter owns the track handles and their enabled/stopped state.
        let mut guard = self.local_stream.write().await;
        if let Some(ref stream) = *guard {
            if stream.is_live() {
                return Ok(stream.clone());
            }
        }
        let stream = Arc::new(LocalStream::with_video_and_audio());
        *guard = Some(stream.clone());
        Ok(stream)
    }

    async fn initiate_call(&self, stream: Arc<LocalStream>) -> Result<bool> {
        let pc = self.require_pc().await?;

        if !stream.is_live() {
            return Err(SessionError::MediaAccess(
                "local stream has no live tracks".into(),
            ));
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| SessionError::TransportFailure(format!("create offer: {}", e)))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| SessionError::TransportFailure(format!("set local description: {}", e)))?;

        *self.local_offer.write().await = Some(SdpOffer::new(offer.sdp));
        *self.local_stream.write().await = Some(stream);

        info!("Call initiated, local offer ready for signaling");
        Ok(true)
    }

    async fn toggle_video(&self) -> Result<bool> {
        let guard = self.local_stream.read().await;
        match guard.as_ref().and_then(|s| s.video_track()) {
            Some(track) => Ok(track.toggle()),
            None => Ok(false),
        }
    }

    async fn toggle_audio(&self) -> Result<bool> {
        let guard = self.local_stream.read().await;
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
        Ok(self.stats.read().await.clone())
    }

    fn has_live_media(&self) -> bool {
        self.remote_media.load(Ordering::Acquire)
    }

    async fn apply_signaling(&self, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::Offer(offer) => {
                // Callee path: the produced answer goes back out through the
                // signaling layer, which polls gathered_candidates()
                let _ = self.handle_offer(offer).await?;
                Ok(())
            }
            SignalingMessage::Answer(answer) => self.handle_answer(answer).await,
            SignalingMessage::Candidate(candidate) => self.add_remote_candidate(candidate).await,
            SignalingMessage::Close => self.destroy().await,
        }
    }

    async fn destroy(&self) -> Result<()> {
        if let Some(pc) = self.pc.write().await.take() {
            pc.close()
                .await
                .map_err(|e| SessionError::TransportFailure(format!("close peer connection: {}", e)))?;
        }
        self.remote_media.store(false, Ordering::Release);
        Ok(())
    }
}
