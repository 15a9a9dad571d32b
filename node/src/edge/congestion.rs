//! Congestion control on accepted connections

use crate::config::CongestionSection;
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Now,
    After(Duration),
}

pub trait CongestionPolicy: Send + Sync {
    /// Asks to send `bytes`; `After` means wait and ask again
    fn admit(&self, bytes: usize) -> Admission;
    fn throttled(&self) -> u64;
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, name: &str, value: f64);
}

pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record(&self, name: &str, value: f64) {
        info!("metric {} = {}", name, value);
    }
}

struct Window {
    started: Instant,
    used: u64,
}

/// Allows `window_bytes` per `interval` across every connection sharing it
pub struct WindowCongestionPolicy {
    window_bytes: u64,
    interval: Duration,
    window: Mutex<Window>,
    throttled: AtomicU64,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl WindowCongestionPolicy {
    pub fn new(window_bytes: u64, interval: Duration) -> Self {
        Self {
            window_bytes: window_bytes.max(1),
            interval,
            window: Mutex::new(Window {
                started: Instant::now(),
                used: 0,
            }),
            throttled: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl CongestionPolicy for WindowCongestionPolicy {
    fn admit(&self, bytes: usize) -> Admission {
        let Ok(mut window) = self.window.lock() else {
            return Admission::Now;
        };

        let elapsed = window.started.elapsed();
        if elapsed >= self.interval {
            window.started = Instant::now();
            window.used = 0;
        }

        let bytes = bytes as u64;
        // An empty window admits anything so oversized messages still progress
        if window.used == 0 || window.used + bytes <= self.window_bytes {
            window.used += bytes;
            return Admission::Now;
        }

        let wait = self.interval.saturating_sub(window.started.elapsed());
        let throttled = self.throttled.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(metrics) = &self.metrics {
            metrics.record("congestion.throttled", throttled as f64);
        }
        Admission::After(wait.max(Duration::from_millis(1)))
    }

    fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}

pub fn build_congestion_policy(config: &CongestionSection) -> Option<Arc<dyn CongestionPolicy>> {
    if !config.enabled {
        return None;
    }

    let mut policy = WindowCongestionPolicy::new(config.window_bytes, Duration::from_millis(config.interval_ms));
    if config.log_metrics {
        policy = policy.with_metrics(Arc::new(LogMetricsSink));
    }
    info!(
        "Congestion control enabled: {} bytes per {} ms",
        config.window_bytes, config.interval_ms
    );
    Some(Arc::new(policy))
}

/// Waits until `policy` admits `bytes`
pub async fn wait_for_admission(policy: &dyn CongestionPolicy, bytes: usize) {
    while let Admission::After(wait) = policy.admit(bytes) {
        tokio::time::sleep(wait).await;
    }
}
