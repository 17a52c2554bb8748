//! Connection recovery controller
//!
//! Drives a bounded, backoff-scheduled sequence of teardown/rejoin cycles
//! when the transport fails. At most one recovery loop runs per session;
//! exhausting the attempt budget is a fatal, user-visible condition.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Result, SessionError};
use crate::events::{EventBus, SessionEvent};

/// Recovery controller policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Maximum reconnection attempts before giving up
    pub max_retries: u32,
    /// Base backoff delay in milliseconds
    pub base_delay_ms: u64,
    /// Double the delay on each attempt; constant delay when disabled
    pub exponential: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            exponential: true,
        }
    }
}

impl RecoveryConfig {
    /// Backoff delay before the given 1-based attempt
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let millis = if self.exponential {
            self.base_delay_ms.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16))
        } else {
            self.base_delay_ms
        };
        Duration::from_millis(millis)
    }
}

/// What the recovery loop operates on
///
/// Implemented by the session manager; test doubles script the outcomes.
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Tear the connection down cleanly, releasing media handles
    ///
    /// Must not fail: cleanup errors are logged by the implementor.
    async fn drop_connection(&self);

    /// Re-establish the connection (media + call initiation)
    async fn reestablish(&self) -> Result<()>;
}

/// Terminal state of one recovery run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Connection restored after the given number of attempts
    Succeeded { attempts: u32 },
    /// The run was cancelled via `stop()`
    Cancelled,
}

/// Bounded-retry reconnection driver
pub struct RecoveryController {
    config: RecoveryConfig,
    events: Arc<EventBus>,
    is_recovering: AtomicBool,
    /// Current attempt number; 0 when idle or after success
    attempt: AtomicU32,
    /// Attempts already consumed before this process started (resumed from
    /// the store's recovery context after a reload)
    initial_attempts: AtomicU32,
    cancel: Mutex<Option<CancellationToken>>,
}

impl RecoveryController {
    pub fn new(config: RecoveryConfig, events: Arc<EventBus>) -> Self {
        Self {
            config,
            events,
            is_recovering: AtomicBool::new(false),
            attempt: AtomicU32::new(0),
            initial_attempts: AtomicU32::new(0),
            cancel: Mutex::new(None),
        }
    }

    /// Whether a recovery loop is currently in flight
    pub fn is_recovering(&self) -> bool {
        self.is_recovering.load(Ordering::Acquire)
    }

    /// Current attempt number (0 when idle)
    pub fn attempt_count(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Resume attempt counting from a persisted recovery context
    pub fn resume_from(&self, consumed_attempts: u32) {
        self.initial_attempts
            .store(consumed_attempts.min(self.config.max_retries), Ordering::Release);
    }

    /// Cancel any in-flight recovery and pending backoff timer
    ///
    /// Must be called on session teardown so no timer fires after the
    /// caller has gone away.
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.attempt.store(0, Ordering::Release);
        self.initial_attempts.store(0, Ordering::Release);
        self.is_recovering.store(false, Ordering::Release);
    }

    /// Start a recovery loop in the background
    ///
    /// Returns `false` without doing anything if a loop is already in
    /// flight (at most one recovery per session at a time).
    pub fn trigger(self: &Arc<Self>, target: Arc<dyn RecoveryTarget>) -> bool {
        if self.is_recovering.swap(true, Ordering::AcqRel) {
            return false;
        }
        let controller = self.clone();
        tokio::spawn(async move {
            let _ = controller.run_locked(target).await;
        });
        true
    }

    /// Run the recovery loop to completion on the caller's task
    ///
    /// Same single-flight guarantee as `trigger`; returns an error if a
    /// loop is already in flight.
    pub async fn run(&self, target: Arc<dyn RecoveryTarget>) -> Result<RecoveryOutcome> {
        if self.is_recovering.swap(true, Ordering::AcqRel) {
            return Err(SessionError::InvalidState {
                operation: "recovery".into(),
                status: "recovering".into(),
            });
        }
        self.run_locked(target).await
    }

    async fn run_locked(&self, target: Arc<dyn RecoveryTarget>) -> Result<RecoveryOutcome> {
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        let result = self.run_attempts(&target, &token).await;

        self.cancel.lock().take();
        self.is_recovering.store(false, Ordering::Release);
        result
    }

    async fn run_attempts(
        &self,
        target: &Arc<dyn RecoveryTarget>,
        token: &CancellationToken,
    ) -> Result<RecoveryOutcome> {
        let start = self.initial_attempts.load(Ordering::Acquire) + 1;
        let max = self.config.max_retries;

        for attempt in start..=max {
            self.attempt.store(attempt, Ordering::Release);
            info!("Recovery attempt {}/{}", attempt, max);
            self.events.publish(SessionEvent::RecoveryStarted {
                attempt,
                max_attempts: max,
            });

            // Clean teardown first so device handles are never leaked
            target.drop_connection().await;

            let delay = self.config.backoff_delay(attempt);
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Recovery cancelled during backoff");
                    self.attempt.store(0, Ordering::Release);
                    return Ok(RecoveryOutcome::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match target.reestablish().await {
                Ok(()) => {
                    info!("Recovery succeeded on attempt {}", attempt);
                    self.attempt.store(0, Ordering::Release);
                    self.initial_attempts.store(0, Ordering::Release);
                    self.events
                        .publish(SessionEvent::RecoverySucceeded { attempts: attempt });
                    return Ok(RecoveryOutcome::Succeeded { attempts: attempt });
                }
                Err(e) => {
                    warn!("Recovery attempt {}/{} failed: {}", attempt, max, e);
                }
            }
        }

        self.attempt.store(0, Ordering::Release);
        self.events
            .publish(SessionEvent::RecoveryExhausted { attempts: max });
        Err(SessionError::RecoveryExhausted { attempts: max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedTarget {
        drops: AtomicU32,
        attempts: AtomicU32,
        fail_remaining: AtomicU32,
        reestablish_delay: Duration,
    }

    impl ScriptedTarget {
        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                drops: AtomicU32::new(0),
                attempts: AtomicU32::new(0),
                fail_remaining: AtomicU32::new(times),
                reestablish_delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl RecoveryTarget for ScriptedTarget {
        async fn drop_connection(&self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }

        async fn reestablish(&self) -> Result<()> {
            if !self.reestablish_delay.is_zero() {
                tokio::time::sleep(self.reestablish_delay).await;
            }
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(SessionError::TransportFailure("still down".into()));
            }
            Ok(())
        }
    }

    fn fast_config() -> RecoveryConfig {
        RecoveryConfig {
            max_retries: 3,
            base_delay_ms: 5,
            exponential: true,
        }
    }

    fn controller(config: RecoveryConfig) -> (Arc<RecoveryController>, Arc<EventBus>) {
        let events = Arc::new(EventBus::new());
        (
            Arc::new(RecoveryController::new(config, events.clone())),
            events,
        )
    }

    #[test]
    fn test_backoff_exponential() {
        let config = RecoveryConfig::default();
        assert_eq!(config.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(4000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_constant() {
        let config = RecoveryConfig {
            exponential: false,
            ..Default::default()
        };
        assert_eq!(config.backoff_delay(1), Duration::from_millis(2000));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_bounded_retries_then_exhausted() {
        let (controller, events) = controller(fast_config());
        let mut rx = events.subscribe();
        let target = ScriptedTarget::failing(u32::MAX);

        let result = controller.run(target.clone() as Arc<dyn RecoveryTarget>).await;
        assert!(matches!(
            result,
            Err(SessionError::RecoveryExhausted { attempts: 3 })
        ));

        // Exactly 3 attempts, never a 4th
        assert_eq!(target.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(target.drops.load(Ordering::SeqCst), 3);
        assert!(!controller.is_recovering());

        // Exactly one exhausted event
        let mut exhausted = 0;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::RecoveryExhausted { attempts } = event {
                assert_eq!(attempts, 3);
                exhausted += 1;
            }
        }
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (controller, events) = controller(fast_config());
        let mut rx = events.subscribe();
        let target = ScriptedTarget::failing(1);

        let outcome = controller
            .run(target.clone() as Arc<dyn RecoveryTarget>)
            .await
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::Succeeded { attempts: 2 });
        assert_eq!(controller.attempt_count(), 0);
        assert!(!controller.is_recovering());

        let mut succeeded = 0;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::RecoverySucceeded { attempts } = event {
                assert_eq!(attempts, 2);
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 1);
    }

    #[tokio::test]
    async fn test_single_flight_guard() {
        let (controller, _events) = controller(RecoveryConfig {
            max_retries: 1,
            base_delay_ms: 30,
            exponential: false,
        });
        let target = Arc::new(ScriptedTarget {
            drops: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
            fail_remaining: AtomicU32::new(0),
            reestablish_delay: Duration::from_millis(20),
        });

        assert!(controller.trigger(target.clone() as Arc<dyn RecoveryTarget>));
        // Second trigger while the first is in flight is a no-op
        assert!(!controller.trigger(target.clone() as Arc<dyn RecoveryTarget>));

        tokio::time::sleep(Duration::from_millis(120)).await;

        // One loop, one attempt: pair counts match, not double
        assert_eq!(target.drops.load(Ordering::SeqCst), 1);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
        assert!(!controller.is_recovering());
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_backoff() {
        let (controller, _events) = controller(RecoveryConfig {
            max_retries: 3,
            base_delay_ms: 5_000,
            exponential: false,
        });
        let target = ScriptedTarget::failing(u32::MAX);

        assert!(controller.trigger(target.clone() as Arc<dyn RecoveryTarget>));
        tokio::time::sleep(Duration::from_millis(30)).await;

        controller.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Cancelled during the first backoff: torn down once, never rejoined
        assert_eq!(target.drops.load(Ordering::SeqCst), 1);
        assert_eq!(target.attempts.load(Ordering::SeqCst), 0);
        assert!(!controller.is_recovering());
        assert_eq!(controller.attempt_count(), 0);
    }

    #[tokio::test]
    async fn test_resume_from_persisted_context() {
        let (controller, _events) = controller(fast_config());
        let target = ScriptedTarget::failing(u32::MAX);

        // Two attempts consumed before the reload: only one remains
        controller.resume_from(2);
        let result = controller.run(target.clone() as Arc<dyn RecoveryTarget>).await;
        assert!(matches!(result, Err(SessionError::RecoveryExhausted { .. })));
        assert_eq!(target.attempts.load(Ordering::SeqCst), 1);
    }
}
