//! Session core configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::quality::QualityConfig;
use crate::recovery::RecoveryConfig;

/// Top-level configuration for one session manager instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout for local media acquisition (camera/microphone), milliseconds
    pub media_timeout_ms: u64,
    /// Timeout for the call-initiation handshake, milliseconds
    pub call_timeout_ms: u64,
    /// Maximum number of active participants per session
    pub capacity: u32,
    /// Session liveness window in seconds; a session whose last-active stamp
    /// is older than this is treated as expired by the registry
    pub session_ttl_secs: i64,
    /// Recovery controller policy
    pub recovery: RecoveryConfig,
    /// Quality monitor policy
    pub quality: QualityConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            media_timeout_ms: 10_000,
            call_timeout_ms: 15_000,
            capacity: 2,
            session_ttl_secs: 3600,
            recovery: RecoveryConfig::default(),
            quality: QualityConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn media_timeout(&self) -> Duration {
        Duration::from_millis(self.media_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
