//! Connection quality monitoring
//!
//! Samples transport statistics on a fixed interval, computes per-interval
//! deltas, classifies each sample into a discrete quality tier, and keeps a
//! bounded rolling history for trend detection. Three consecutive critical
//! assessments arm the recovery controller.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, SessionEvent};
use crate::transport::{MediaTransport, TransportStats};

/// Quality monitor policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Sampling interval in milliseconds
    pub sample_interval_ms: u64,
    /// Rolling history length (samples)
    pub history_len: usize,
    /// RTT at or below this is excellent (ms)
    pub excellent_rtt_ms: f64,
    /// RTT at or below this is good (ms)
    pub good_rtt_ms: f64,
    /// RTT at or below this is poor; above is critical (ms)
    pub poor_rtt_ms: f64,
    /// Packet loss at or below this is excellent (%)
    pub excellent_loss_pct: f64,
    /// Packet loss at or below this is good (%)
    pub good_loss_pct: f64,
    /// Packet loss at or below this is poor; above is critical (%)
    pub poor_loss_pct: f64,
    /// Video below this frame rate degrades the sample to at least poor
    pub min_frame_rate: f64,
    /// Consecutive critical samples that arm recovery
    pub critical_trigger_samples: u32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 2000,
            history_len: 10,
            excellent_rtt_ms: 150.0,
            good_rtt_ms: 300.0,
            poor_rtt_ms: 600.0,
            excellent_loss_pct: 1.0,
            good_loss_pct: 5.0,
            poor_loss_pct: 15.0,
            min_frame_rate: 5.0,
            critical_trigger_samples: 3,
        }
    }
}

/// Discrete quality tier
///
/// Ordered from best to worst; `Ord` follows declaration order so the worst
/// of several per-metric contributions is simply `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Excellent,
    Good,
    Poor,
    Critical,
}

impl QualityTier {
    fn score(&self) -> f64 {
        match self {
            QualityTier::Excellent => 0.0,
            QualityTier::Good => 1.0,
            QualityTier::Poor => 2.0,
            QualityTier::Critical => 3.0,
        }
    }
}

impl std::fmt::Display for QualityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityTier::Excellent => write!(f, "excellent"),
            QualityTier::Good => write!(f, "good"),
            QualityTier::Poor => write!(f, "poor"),
            QualityTier::Critical => write!(f, "critical"),
        }
    }
}

/// Quality trend over the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTrend {
    Improving,
    Stable,
    Degrading,
}

/// One periodic quality measurement
///
/// Metrics the transport could not measure are `None`, never zero, so that
/// "not measured" is distinguishable from "measured as zero".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualitySample {
    pub round_trip_time_ms: Option<f64>,
    /// Packet loss over the sampling interval, 0-100; `None` on the first
    /// sample or when no packets were expected in the interval
    pub packet_loss_pct: Option<f64>,
    /// Receive bitrate over the interval, bits/sec
    pub bitrate_bps: u64,
    pub jitter_ms: Option<f64>,
    pub frame_rate: Option<f64>,
    pub resolution: Option<(u32, u32)>,
    pub timestamp_ms: i64,
    pub tier: QualityTier,
}

/// Aggregate assessment published through the watch channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub tier: QualityTier,
    pub trend: QualityTrend,
    pub consecutive_critical: u32,
}

impl Default for QualityAssessment {
    fn default() -> Self {
        Self {
            tier: QualityTier::Good,
            trend: QualityTrend::Stable,
            consecutive_critical: 0,
        }
    }
}

/// Classify a sample against the configured thresholds
///
/// Each present metric contributes the worst tier it individually justifies;
/// the sample tier is the worst contribution. Missing metrics contribute
/// nothing, which keeps the classification monotonic: strictly worse inputs
/// can never yield a better tier.
pub fn classify(sample: &QualitySample, config: &QualityConfig) -> QualityTier {
    let mut tier = QualityTier::Excellent;

    if let Some(rtt) = sample.round_trip_time_ms {
        let by_rtt = if rtt <= config.excellent_rtt_ms {
            QualityTier::Excellent
        } else if rtt <= config.good_rtt_ms {
            QualityTier::Good
        } else if rtt <= config.poor_rtt_ms {
            QualityTier::Poor
        } else {
            QualityTier::Critical
        };
        tier = tier.max(by_rtt);
    }

    if let Some(loss) = sample.packet_loss_pct {
        let by_loss = if loss <= config.excellent_loss_pct {
            QualityTier::Excellent
        } else if loss <= config.good_loss_pct {
            QualityTier::Good
        } else if loss <= config.poor_loss_pct {
            QualityTier::Poor
        } else {
            QualityTier::Critical
        };
        tier = tier.max(by_loss);
    }

    if let Some(fps) = sample.frame_rate {
        if fps < config.min_frame_rate {
            tier = tier.max(QualityTier::Poor);
        }
    }

    tier
}

/// Consecutive non-advancing snapshots tolerated before the pipeline is
/// treated as dead and samples degrade to missing
const STALE_SNAPSHOT_LIMIT: u32 = 2;

/// Periodic connection quality monitor
pub struct QualityMonitor {
    transport: Arc<dyn MediaTransport>,
    config: QualityConfig,
    events: Arc<EventBus>,
    history: RwLock<VecDeque<QualitySample>>,
    prev_snapshot: Mutex<Option<TransportStats>>,
    consecutive_critical: AtomicU32,
    /// Snapshots in a row whose timestamp did not advance
    stale_snapshots: AtomicU32,
    assessment_tx: watch::Sender<QualityAssessment>,
    assessment_rx: watch::Receiver<QualityAssessment>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl QualityMonitor {
    pub fn new(
        transport: Arc<dyn MediaTransport>,
        config: QualityConfig,
        events: Arc<EventBus>,
    ) -> Self {
        let (assessment_tx, assessment_rx) = watch::channel(QualityAssessment::default());
        Self {
            transport,
            config,
            events,
            history: RwLock::new(VecDeque::new()),
            prev_snapshot: Mutex::new(None),
            consecutive_critical: AtomicU32::new(0),
            stale_snapshots: AtomicU32::new(0),
            assessment_tx,
            assessment_rx,
            cancel: Mutex::new(None),
        }
    }

    /// Start the sampling loop; a second call restarts it
    pub fn start(self: &Arc<Self>) {
        self.stop();

        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());

        let monitor = self.clone();
        let interval = Duration::from_millis(self.config.sample_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would sample a zero-length interval
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match monitor.transport.stats().await {
                            Ok(stats) => {
                                monitor.ingest(stats);
                            }
                            Err(e) => {
                                warn!("Statistics snapshot unavailable: {}", e);
                                monitor.ingest_missing();
                            }
                        }
                    }
                }
            }
        });
    }

    /// Cancel the sampling loop
    pub fn stop(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    /// Reset history and counters (used when a recovered connection starts over)
    pub fn reset(&self) {
        self.history.write().clear();
        *self.prev_snapshot.lock() = None;
        self.consecutive_critical.store(0, Ordering::Release);
        self.stale_snapshots.store(0, Ordering::Release);
        let _ = self.assessment_tx.send(QualityAssessment::default());
    }

    /// Watch channel carrying the latest aggregate assessment
    pub fn assessment_watch(&self) -> watch::Receiver<QualityAssessment> {
        self.assessment_rx.clone()
    }

    /// Latest assessment value
    pub fn assessment(&self) -> QualityAssessment {
        self.assessment_rx.borrow().clone()
    }

    /// Most recent sample, if any
    pub fn latest_sample(&self) -> Option<QualitySample> {
        self.history.read().back().cloned()
    }

    /// Copy of the rolling history, oldest first
    pub fn history(&self) -> Vec<QualitySample> {
        self.history.read().iter().cloned().collect()
    }

    /// Ingest one raw snapshot, producing and recording a classified sample
    ///
    /// A snapshot whose timestamp has not advanced carries no fresh
    /// measurements; after `STALE_SNAPSHOT_LIMIT` of those in a row the
    /// pipeline has stopped reporting and the sample degrades to missing
    /// rather than re-classifying stale metrics.
    pub(crate) fn ingest(&self, stats: TransportStats) -> QualitySample {
        let prev = self.prev_snapshot.lock().replace(stats.clone());

        if let Some(ref p) = prev {
            if stats.timestamp_ms <= p.timestamp_ms {
                let stale = self.stale_snapshots.fetch_add(1, Ordering::AcqRel) + 1;
                if stale >= STALE_SNAPSHOT_LIMIT {
                    warn!("Statistics frozen for {} samples, treating as missing", stale);
                    return self.ingest_missing();
                }
            } else {
                self.stale_snapshots.store(0, Ordering::Release);
            }
        }

        let (bitrate_bps, packet_loss_pct) = match prev {
            Some(ref p) if stats.timestamp_ms > p.timestamp_ms => {
                let dt_ms = (stats.timestamp_ms - p.timestamp_ms) as u64;
                let dbytes = stats.bytes_received.saturating_sub(p.bytes_received);
                let bitrate = dbytes.saturating_mul(8).saturating_mul(1000) / dt_ms.max(1);

                let dlost = stats.packets_lost.saturating_sub(p.packets_lost);
                let dreceived = stats.packets_received.saturating_sub(p.packets_received);
                let expected = dlost + dreceived;
                let loss = if expected > 0 {
                    Some(dlost as f64 * 100.0 / expected as f64)
                } else {
                    None
                };
                (bitrate, loss)
            }
            _ => (0, None),
        };

        let mut sample = QualitySample {
            round_trip_time_ms: stats.round_trip_time_ms,
            packet_loss_pct,
            bitrate_bps,
            jitter_ms: stats.jitter_ms,
            frame_rate: stats.frames_per_second,
            resolution: match (stats.frame_width, stats.frame_height) {
                (Some(w), Some(h)) => Some((w, h)),
                _ => None,
            },
            timestamp_ms: stats.timestamp_ms,
            tier: QualityTier::Excellent,
        };
        sample.tier = classify(&sample, &self.config);

        self.record(sample.clone());
        sample
    }

    /// Record a fully-missing measurement (no recent statistics at all)
    pub(crate) fn ingest_missing(&self) -> QualitySample {
        let sample = QualitySample {
            round_trip_time_ms: None,
            packet_loss_pct: None,
            bitrate_bps: 0,
            jitter_ms: None,
            frame_rate: None,
            resolution: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            tier: QualityTier::Critical,
        };
        self.record(sample.clone());
        sample
    }

    fn record(&self, sample: QualitySample) {
        let trend = {
            let mut history = self.history.write();
            history.push_back(sample.clone());
            while history.len() > self.config.history_len {
                history.pop_front();
            }
            trend_of(&history)
        };

        let consecutive = if sample.tier == QualityTier::Critical {
            self.consecutive_critical.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.consecutive_critical.store(0, Ordering::Release);
            0
        };

        let previous_tier = self.assessment_rx.borrow().tier;
        let assessment = QualityAssessment {
            tier: sample.tier,
            trend,
            consecutive_critical: consecutive,
        };

        debug!(
            "Quality sample: tier={} trend={:?} bitrate={}bps loss={:?} rtt={:?}",
            sample.tier, trend, sample.bitrate_bps, sample.packet_loss_pct, sample.round_trip_time_ms
        );

        let _ = self.assessment_tx.send(assessment);

        if sample.tier != previous_tier {
            self.events.publish(SessionEvent::QualityChanged {
                tier: sample.tier,
                trend,
            });
        }
    }

    /// Whether the critical streak has reached the recovery trigger
    pub fn should_trigger_recovery(&self) -> bool {
        self.consecutive_critical.load(Ordering::Acquire) >= self.config.critical_trigger_samples
    }
}

fn trend_of(history: &VecDeque<QualitySample>) -> QualityTrend {
    if history.len() < 4 {
        return QualityTrend::Stable;
    }
    let mid = history.len() / 2;
    let older: f64 = history.iter().take(mid).map(|s| s.tier.score()).sum::<f64>() / mid as f64;
    let newer: f64 = history.iter().skip(mid).map(|s| s.tier.score()).sum::<f64>()
        / (history.len() - mid) as f64;

    // Higher score is worse
    if newer <= older - 0.5 {
        QualityTrend::Improving
    } else if newer >= older + 0.5 {
        QualityTrend::Degrading
    } else {
        QualityTrend::Stable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn sample_with(rtt: Option<f64>, loss: Option<f64>, fps: Option<f64>) -> QualitySample {
        QualitySample {
            round_trip_time_ms: rtt,
            packet_loss_pct: loss,
            bitrate_bps: 500_000,
            jitter_ms: None,
            frame_rate: fps,
            resolution: None,
            timestamp_ms: 0,
            tier: QualityTier::Excellent,
        }
    }

    fn monitor() -> Arc<QualityMonitor> {
        Arc::new(QualityMonitor::new(
            Arc::new(MockTransport::new()),
            QualityConfig::default(),
            Arc::new(EventBus::new()),
        ))
    }

    #[test]
    fn test_classify_bands() {
        let config = QualityConfig::default();
        assert_eq!(
            classify(&sample_with(Some(50.0), Some(0.0), Some(30.0)), &config),
            QualityTier::Excellent
        );
        assert_eq!(
            classify(&sample_with(Some(250.0), Some(0.5), Some(30.0)), &config),
            QualityTier::Good
        );
        assert_eq!(
            classify(&sample_with(Some(100.0), Some(10.0), Some(30.0)), &config),
            QualityTier::Poor
        );
        assert_eq!(
            classify(&sample_with(Some(900.0), Some(0.0), None), &config),
            QualityTier::Critical
        );
    }

    #[test]
    fn test_classify_monotonic() {
        let config = QualityConfig::default();
        // Strictly worse inputs never produce a better tier
        let better = classify(&sample_with(Some(100.0), Some(1.0), Some(30.0)), &config);
        let worse = classify(&sample_with(Some(400.0), Some(6.0), Some(30.0)), &config);
        assert!(worse >= better);
    }

    #[test]
    fn test_low_frame_rate_degrades() {
        let config = QualityConfig::default();
        assert_eq!(
            classify(&sample_with(Some(50.0), Some(0.0), Some(2.0)), &config),
            QualityTier::Poor
        );
    }

    #[test]
    fn test_missing_metrics_are_not_zero() {
        let config = QualityConfig::default();
        // Unknown RTT/loss does not penalize the sample
        assert_eq!(
            classify(&sample_with(None, None, None), &config),
            QualityTier::Excellent
        );
    }

    #[tokio::test]
    async fn test_delta_computation() {
        let monitor = monitor();

        let mut first = TransportStats::default();
        first.timestamp_ms = 1_000;
        first.bytes_received = 0;
        first.packets_received = 0;
        first.packets_lost = 0;
        monitor.ingest(first);

        let mut second = TransportStats::default();
        second.timestamp_ms = 3_000;
        second.bytes_received = 250_000; // 250 KB over 2s = 1 Mbps
        second.packets_received = 98;
        second.packets_lost = 2;
        second.round_trip_time_ms = Some(80.0);
        let sample = monitor.ingest(second);

        assert_eq!(sample.bitrate_bps, 1_000_000);
        assert!((sample.packet_loss_pct.unwrap() - 2.0).abs() < 1e-9);
        assert_eq!(sample.tier, QualityTier::Good);
    }

    #[tokio::test]
    async fn test_first_sample_has_no_loss() {
        let monitor = monitor();
        let mut stats = TransportStats::default();
        stats.timestamp_ms = 1_000;
        let sample = monitor.ingest(stats);
        assert!(sample.packet_loss_pct.is_none());
        assert_eq!(sample.bitrate_bps, 0);
    }

    #[tokio::test]
    async fn test_history_bounded() {
        let monitor = monitor();
        for i in 0..25 {
            let mut stats = TransportStats::default();
            stats.timestamp_ms = 1_000 + i * 2_000;
            monitor.ingest(stats);
        }
        assert_eq!(monitor.history().len(), QualityConfig::default().history_len);
    }

    #[tokio::test]
    async fn test_consecutive_critical_arms_recovery() {
        let monitor = monitor();
        assert!(!monitor.should_trigger_recovery());

        for _ in 0..2 {
            monitor.ingest_missing();
        }
        assert!(!monitor.should_trigger_recovery());

        monitor.ingest_missing();
        assert!(monitor.should_trigger_recovery());
        assert_eq!(monitor.assessment().consecutive_critical, 3);

        // One healthy sample resets the streak
        let mut stats = TransportStats::default();
        stats.timestamp_ms = chrono::Utc::now().timestamp_millis();
        stats.round_trip_time_ms = Some(50.0);
        monitor.ingest(stats);
        assert!(!monitor.should_trigger_recovery());
        assert_eq!(monitor.assessment().consecutive_critical, 0);
    }

    #[tokio::test]
    async fn test_frozen_statistics_degrade_to_critical() {
        let monitor = monitor();
        let mut stats = TransportStats::default();
        stats.timestamp_ms = 1_000;
        stats.bytes_received = 500_000;
        stats.packets_received = 1_000;
        stats.round_trip_time_ms = Some(40.0);

        // Healthy baseline
        assert_eq!(monitor.ingest(stats.clone()).tier, QualityTier::Excellent);

        // The identical snapshot repeated means the pipeline stopped
        // reporting; the stale RTT must not keep classifying as excellent
        monitor.ingest(stats.clone());
        let frozen = monitor.ingest(stats.clone());
        assert_eq!(frozen.tier, QualityTier::Critical);
        assert!(frozen.round_trip_time_ms.is_none());

        monitor.ingest(stats.clone());
        monitor.ingest(stats.clone());
        assert!(monitor.should_trigger_recovery());

        // A snapshot that advances again clears the freeze
        let mut fresh = stats.clone();
        fresh.timestamp_ms = 9_000;
        fresh.bytes_received = 900_000;
        let sample = monitor.ingest(fresh);
        assert_eq!(sample.tier, QualityTier::Excellent);
        assert!(!monitor.should_trigger_recovery());
    }

    #[tokio::test]
    async fn test_trend_degrading() {
        let monitor = monitor();
        // Good samples followed by critical ones
        for i in 0..5 {
            let mut stats = TransportStats::default();
            stats.timestamp_ms = 1_000 + i * 2_000;
            stats.round_trip_time_ms = Some(50.0);
            monitor.ingest(stats);
        }
        for _ in 0..5 {
            monitor.ingest_missing();
        }
        assert_eq!(monitor.assessment().trend, QualityTrend::Degrading);
    }

    #[tokio::test]
    async fn test_quality_change_publishes_event() {
        let events = Arc::new(EventBus::new());
        let monitor = Arc::new(QualityMonitor::new(
            Arc::new(MockTransport::new()),
            QualityConfig::default(),
            events.clone(),
        ));
        let mut rx = events.subscribe();

        monitor.ingest_missing();

        match rx.recv().await.unwrap() {
            SessionEvent::QualityChanged { tier, .. } => assert_eq!(tier, QualityTier::Critical),
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sampling_loop_stop() {
        let transport = Arc::new(MockTransport::new());
        let monitor = Arc::new(QualityMonitor::new(
            transport,
            QualityConfig {
                sample_interval_ms: 10,
                ..Default::default()
            },
            Arc::new(EventBus::new()),
        ));

        monitor.start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        monitor.stop();
        let after_stop = monitor.history().len();
        assert!(after_stop >= 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.history().len(), after_stop);
    }
}
