//! Session event types
//!
//! Defines all events broadcast through the session event bus.

use serde::{Deserialize, Serialize};

use crate::quality::{QualityTier, QualityTrend};
use crate::session::SessionStatus;

/// Session event enumeration
///
/// Events are tagged with their name for serialization, producing JSON like:
/// ```json
/// {"event": "status_changed", "data": {"status": "active"}}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Session lifecycle status changed
    StatusChanged { status: SessionStatus },
    /// Aggregate connection quality changed tier
    QualityChanged {
        tier: QualityTier,
        trend: QualityTrend,
    },
    /// A recovery attempt is starting
    RecoveryStarted { attempt: u32, max_attempts: u32 },
    /// Recovery succeeded and the session is active again
    RecoverySucceeded { attempts: u32 },
    /// All recovery attempts failed; user must rejoin manually
    RecoveryExhausted { attempts: u32 },
    /// A participant registered in the session
    ParticipantRegistered {
        participant_id: String,
        display_name: String,
    },
    /// A participant left or was removed
    ParticipantLeft { participant_id: String },
    /// A waiting participant was admitted by the host
    ParticipantAdmitted { participant_id: String },
    /// The session ended and its durable record was deleted
    SessionEnded { session_id: String },
}
