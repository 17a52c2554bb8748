//! telesession - Resilient video-session lifecycle core
//!
//! This crate provides the connection-management core for a single
//! peer-to-peer video call: the session state machine, bounded-retry
//! connection recovery, periodic connection-quality monitoring, a durable
//! SQLite-backed session store, and a participant registry.
//!
//! The underlying media transport is abstracted behind the
//! [`transport::MediaTransport`] capability trait; a default adapter over
//! webrtc-rs lives in [`transport::webrtc`].

pub mod config;
pub mod error;
pub mod events;
pub mod quality;
pub mod recovery;
pub mod registry;
pub mod session;
pub mod store;
pub mod transport;
pub mod util;

pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use session::{SessionManager, SessionRole, SessionStatus};
