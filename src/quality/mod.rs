//! Link-quality monitoring
//!
//! [`QualityMonitor`] samples transport statistics on an interval,
//! classifies each window into a discrete tier, and emits one fresh
//! [`QualitySnapshot`] per tick. It never reconnects on its own; the
//! orchestrator owns that policy.

use crate::config::QualityThresholds;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Discrete link-health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    /// No usable statistics; the connection is not (yet) established
    Disconnected,
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}

/// One classified measurement window
///
/// Recomputed every tick; old snapshots are discarded, never mutated.
#[derive(Debug, Clone)]
pub struct QualitySnapshot {
    pub level: QualityLevel,
    /// Remote-reported round-trip time, milliseconds
    pub latency_ms: f64,
    /// Packet loss within the sampling window, 0.0 - 1.0
    pub packet_loss_ratio: f64,
    /// Outbound media bitrate within the window, kbit/s
    pub bitrate_kbps: u32,
    pub sampled_at: Instant,
}

impl QualitySnapshot {
    fn disconnected() -> Self {
        Self {
            level: QualityLevel::Disconnected,
            latency_ms: 0.0,
            packet_loss_ratio: 0.0,
            bitrate_kbps: 0,
            sampled_at: Instant::now(),
        }
    }
}

/// Cumulative transport counters read from the peer connection
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportStats {
    pub packets_sent: u64,
    /// From remote receiver reports; may regress on duplicates
    pub packets_lost: i64,
    pub bytes_sent: u64,
    pub round_trip_time_ms: Option<f64>,
}

/// Provider of cumulative transport statistics
#[async_trait::async_trait]
pub trait StatsSource: Send + Sync {
    /// Current counters, or `None` while the transport reports nothing
    async fn transport_stats(&self) -> Option<TransportStats>;
}

/// Map a loss ratio onto a quality tier
pub fn classify_loss(ratio: f64, thresholds: &QualityThresholds) -> QualityLevel {
    if ratio <= thresholds.excellent_max_loss {
        QualityLevel::Excellent
    } else if ratio <= thresholds.good_max_loss {
        QualityLevel::Good
    } else if ratio <= thresholds.fair_max_loss {
        QualityLevel::Fair
    } else {
        QualityLevel::Poor
    }
}

/// Compute the snapshot for one window from cumulative counters
///
/// Loss is a delta against the previous sample so the ratio reflects the
/// current window, not the whole call.
fn window_snapshot(
    prev: Option<&TransportStats>,
    current: &TransportStats,
    thresholds: &QualityThresholds,
    interval: Duration,
) -> QualitySnapshot {
    let zero = TransportStats::default();
    let prev = prev.unwrap_or(&zero);

    let delta_sent = current.packets_sent.saturating_sub(prev.packets_sent);
    let delta_lost = (current.packets_lost - prev.packets_lost).max(0) as u64;
    let delta_bytes = current.bytes_sent.saturating_sub(prev.bytes_sent);

    let packet_loss_ratio = if delta_sent > 0 {
        (delta_lost as f64 / delta_sent as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let bitrate_kbps = if interval.as_millis() > 0 {
        ((delta_bytes as f64 * 8.0) / interval.as_millis() as f64) as u32
    } else {
        0
    };

    QualitySnapshot {
        level: classify_loss(packet_loss_ratio, thresholds),
        latency_ms: current.round_trip_time_ms.unwrap_or(0.0),
        packet_loss_ratio,
        bitrate_kbps,
        sampled_at: Instant::now(),
    }
}

/// Periodic sampler over a [`StatsSource`]
pub struct QualityMonitor {
    source: Arc<dyn StatsSource>,
    thresholds: QualityThresholds,
    snapshots: mpsc::UnboundedSender<QualitySnapshot>,
    running: Mutex<Option<RunningSampler>>,
}

struct RunningSampler {
    // Dropping the sender stops the sampling task.
    _shutdown: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl QualityMonitor {
    /// Create a monitor that reports snapshots over `snapshots`
    pub fn new(
        source: Arc<dyn StatsSource>,
        thresholds: QualityThresholds,
        snapshots: mpsc::UnboundedSender<QualitySnapshot>,
    ) -> Self {
        Self {
            source,
            thresholds,
            snapshots,
            running: Mutex::new(None),
        }
    }

    /// Begin periodic sampling; a no-op while already running
    pub fn start(&self, interval: Duration) {
        let mut running = self.running.lock();
        if running.is_some() {
            debug!("quality monitor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let source = Arc::clone(&self.source);
        let thresholds = self.thresholds.clone();
        let snapshots = self.snapshots.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so the first window
            // spans a full interval.
            ticker.tick().await;

            let mut prev: Option<TransportStats> = None;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        match source.transport_stats().await {
                            None => {
                                prev = None;
                                if snapshots.send(QualitySnapshot::disconnected()).is_err() {
                                    break;
                                }
                            }
                            Some(current) => {
                                let snap =
                                    window_snapshot(prev.as_ref(), &current, &thresholds, interval);
                                trace!(
                                    level = %snap.level,
                                    loss = snap.packet_loss_ratio,
                                    bitrate_kbps = snap.bitrate_kbps,
                                    "quality sample"
                                );
                                prev = Some(current);
                                if snapshots.send(snap).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            debug!("quality sampler stopped");
        });

        *running = Some(RunningSampler {
            _shutdown: shutdown_tx,
            task,
        });
    }

    /// Halt sampling; idempotent
    pub fn stop(&self) {
        if let Some(sampler) = self.running.lock().take() {
            // Dropping the shutdown sender wakes the task; it exits on its
            // own, so the handle is only aborted as a backstop.
            sampler.task.abort();
        }
    }

    /// Whether the sampler is currently active
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for QualityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Debounce for quality-driven phase changes
///
/// The session only reports degradation after `threshold` consecutive poor
/// samples, so a single bad window never flaps the call state; one healthy
/// sample recovers it.
#[derive(Debug)]
pub struct DegradeTracker {
    threshold: u32,
    consecutive_poor: u32,
    degraded: bool,
}

/// Transition reported by [`DegradeTracker::observe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityShift {
    Degraded,
    Recovered,
}

impl DegradeTracker {
    /// Track degradation after `threshold` consecutive poor samples
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_poor: 0,
            degraded: false,
        }
    }

    /// Feed one sample; returns a transition when one occurs
    pub fn observe(&mut self, level: QualityLevel) -> Option<QualityShift> {
        if level == QualityLevel::Poor {
            self.consecutive_poor += 1;
            if !self.degraded && self.consecutive_poor >= self.threshold {
                self.degraded = true;
                return Some(QualityShift::Degraded);
            }
        } else {
            self.consecutive_poor = 0;
            if self.degraded {
                self.degraded = false;
                return Some(QualityShift::Recovered);
            }
        }
        None
    }

    /// Forget all history (used when a connection is replaced)
    pub fn reset(&mut self) {
        self.consecutive_poor = 0;
        self.degraded = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> QualityThresholds {
        QualityThresholds::default()
    }

    #[test]
    fn test_classify_loss_bands() {
        let t = thresholds();
        assert_eq!(classify_loss(0.0, &t), QualityLevel::Excellent);
        assert_eq!(classify_loss(0.005, &t), QualityLevel::Excellent);
        assert_eq!(classify_loss(0.01, &t), QualityLevel::Good);
        assert_eq!(classify_loss(0.02, &t), QualityLevel::Good);
        assert_eq!(classify_loss(0.04, &t), QualityLevel::Fair);
        assert_eq!(classify_loss(0.05, &t), QualityLevel::Fair);
        assert_eq!(classify_loss(0.051, &t), QualityLevel::Poor);
        assert_eq!(classify_loss(0.5, &t), QualityLevel::Poor);
    }

    #[test]
    fn test_window_uses_delta_not_cumulative() {
        // Cumulative loss is high, but the current window is clean.
        let prev = TransportStats {
            packets_sent: 1000,
            packets_lost: 100,
            bytes_sent: 100_000,
            round_trip_time_ms: Some(40.0),
        };
        let current = TransportStats {
            packets_sent: 2000,
            packets_lost: 100,
            bytes_sent: 350_000,
            round_trip_time_ms: Some(40.0),
        };

        let snap = window_snapshot(
            Some(&prev),
            &current,
            &thresholds(),
            Duration::from_millis(2000),
        );
        assert_eq!(snap.level, QualityLevel::Excellent);
        assert_eq!(snap.packet_loss_ratio, 0.0);
        // 250_000 bytes over 2s = 1000 kbit/s
        assert_eq!(snap.bitrate_kbps, 1000);
        assert_eq!(snap.latency_ms, 40.0);
    }

    #[test]
    fn test_window_flags_lossy_interval() {
        let prev = TransportStats {
            packets_sent: 1000,
            packets_lost: 0,
            ..Default::default()
        };
        let current = TransportStats {
            packets_sent: 1100,
            packets_lost: 10,
            ..Default::default()
        };

        let snap = window_snapshot(
            Some(&prev),
            &current,
            &thresholds(),
            Duration::from_millis(2000),
        );
        // 10 lost out of 100 sent in this window.
        assert_eq!(snap.level, QualityLevel::Poor);
        assert!((snap.packet_loss_ratio - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_first_window_uses_cumulative_counters() {
        let current = TransportStats {
            packets_sent: 100,
            packets_lost: 1,
            ..Default::default()
        };
        let snap = window_snapshot(None, &current, &thresholds(), Duration::from_millis(2000));
        assert_eq!(snap.level, QualityLevel::Good);
    }

    #[test]
    fn test_idle_window_is_not_poor() {
        let stats = TransportStats::default();
        let snap = window_snapshot(
            Some(&stats),
            &stats,
            &thresholds(),
            Duration::from_millis(2000),
        );
        assert_eq!(snap.level, QualityLevel::Excellent);
        assert_eq!(snap.packet_loss_ratio, 0.0);
    }

    #[test]
    fn test_debounce_requires_two_poor_ticks() {
        let mut tracker = DegradeTracker::new(2);
        assert_eq!(tracker.observe(QualityLevel::Poor), None);
        assert_eq!(
            tracker.observe(QualityLevel::Poor),
            Some(QualityShift::Degraded)
        );
        // Still degraded, no repeated notification.
        assert_eq!(tracker.observe(QualityLevel::Poor), None);
    }

    #[test]
    fn test_single_poor_tick_does_not_degrade() {
        let mut tracker = DegradeTracker::new(2);
        assert_eq!(tracker.observe(QualityLevel::Poor), None);
        assert_eq!(tracker.observe(QualityLevel::Good), None);
        assert_eq!(tracker.observe(QualityLevel::Poor), None);
        assert_eq!(tracker.observe(QualityLevel::Excellent), None);
    }

    #[test]
    fn test_recovery_on_first_healthy_tick() {
        let mut tracker = DegradeTracker::new(2);
        tracker.observe(QualityLevel::Poor);
        tracker.observe(QualityLevel::Poor);
        assert_eq!(
            tracker.observe(QualityLevel::Good),
            Some(QualityShift::Recovered)
        );
        assert_eq!(tracker.observe(QualityLevel::Good), None);
    }

    struct ScriptedSource {
        samples: Mutex<Vec<Option<TransportStats>>>,
    }

    #[async_trait::async_trait]
    impl StatsSource for ScriptedSource {
        async fn transport_stats(&self) -> Option<TransportStats> {
            let mut samples = self.samples.lock();
            if samples.is_empty() {
                None
            } else {
                samples.remove(0)
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_emits_disconnected_without_stats() {
        let source = Arc::new(ScriptedSource {
            samples: Mutex::new(vec![]),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = QualityMonitor::new(source, thresholds(), tx);
        monitor.start(Duration::from_millis(100));

        let snap = rx.recv().await.unwrap();
        assert_eq!(snap.level, QualityLevel::Disconnected);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_classifies_windows() {
        let source = Arc::new(ScriptedSource {
            samples: Mutex::new(vec![
                Some(TransportStats {
                    packets_sent: 100,
                    packets_lost: 0,
                    ..Default::default()
                }),
                Some(TransportStats {
                    packets_sent: 200,
                    packets_lost: 20,
                    ..Default::default()
                }),
            ]),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = QualityMonitor::new(source, thresholds(), tx);
        monitor.start(Duration::from_millis(100));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, QualityLevel::Excellent);
        let second = rx.recv().await.unwrap();
        // 20 lost out of 100 sent in the second window.
        assert_eq!(second.level, QualityLevel::Poor);
        monitor.stop();
    }

    #[tokio::test]
    async fn test_start_twice_is_noop_and_stop_idempotent() {
        let source = Arc::new(ScriptedSource {
            samples: Mutex::new(vec![]),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = QualityMonitor::new(source, thresholds(), tx);

        monitor.start(Duration::from_millis(100));
        monitor.start(Duration::from_millis(100));
        assert!(monitor.is_running());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
