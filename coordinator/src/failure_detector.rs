//! Phi-accrual failure detector (SPEC_FULL.md §4.7): a softer, advisory liveness signal layered
//! on top of Raft's own election timers, useful for steering client-side retries before a Raft
//! election would actually fire.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;

const SAMPLE_WINDOW: usize = 100;
const SUSPICION_THRESHOLD: f64 = 8.0;

/// Tracks heartbeat inter-arrival times for a single peer and turns them into a phi value: the
/// more overdue the next heartbeat is relative to the observed distribution, the higher phi
/// climbs.
pub struct PhiAccrualDetector {
    intervals: VecDeque<f64>,
    last_heartbeat: Option<Instant>,
}

impl Default for PhiAccrualDetector {
    fn default() -> Self {
        Self {
            intervals: VecDeque::with_capacity(SAMPLE_WINDOW),
            last_heartbeat: None,
        }
    }
}

impl PhiAccrualDetector {
    pub fn record_heartbeat(&mut self, now: Instant) {
        if let Some(last) = self.last_heartbeat {
            let interval = now.duration_since(last).as_secs_f64();
            if self.intervals.len() == SAMPLE_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals.push_back(interval);
        }
        self.last_heartbeat = Some(now);
    }

    pub fn phi(&self, now: Instant) -> f64 {
        let Some(last) = self.last_heartbeat else {
            return 0.0;
        };
        if self.intervals.len() < 2 {
            return 0.0;
        }

        let elapsed = now.duration_since(last).as_secs_f64();
        let mean = self.intervals.iter().sum::<f64>() / self.intervals.len() as f64;
        let variance = self
            .intervals
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / self.intervals.len() as f64;
        let std_dev = variance.sqrt().max(1e-9);

        let y = (elapsed - mean) / (std_dev * std::f64::consts::SQRT_2);
        let cdf = 0.5 * (1.0 + erf(y));
        let survival = (1.0 - cdf).max(1e-15);
        -survival.log10()
    }
}

/// Abramowitz & Stegun 7.1.26 approximation, accurate to ~1.5e-7 -- plenty for a suspicion signal.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();
    sign * y
}

/// Owns one [`PhiAccrualDetector`] per monitored peer and exposes a suspicion-state change feed.
pub struct FailureDetectorRegistry {
    detectors: Mutex<HashMap<String, PhiAccrualDetector>>,
    suspicion_tx: watch::Sender<Vec<String>>,
    suspicion_rx: watch::Receiver<Vec<String>>,
}

impl FailureDetectorRegistry {
    pub fn new(peers: &[String]) -> Self {
        let detectors = peers
            .iter()
            .map(|p| (p.clone(), PhiAccrualDetector::default()))
            .collect();
        let (suspicion_tx, suspicion_rx) = watch::channel(Vec::new());
        Self {
            detectors: Mutex::new(detectors),
            suspicion_tx,
            suspicion_rx,
        }
    }

    pub fn record_heartbeat(&self, peer: &str) {
        let now = Instant::now();
        let mut detectors = self.detectors.lock();
        detectors.entry(peer.to_string()).or_default().record_heartbeat(now);
        self.publish_suspicions(&detectors);
    }

    pub fn is_suspected(&self, peer: &str) -> bool {
        let now = Instant::now();
        self.detectors
            .lock()
            .get(peer)
            .map(|d| d.phi(now) > SUSPICION_THRESHOLD)
            .unwrap_or(false)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.suspicion_rx.clone()
    }

    /// Current snapshot of suspected peers, for a status endpoint that doesn't want to hold a
    /// `watch::Receiver` open.
    pub fn suspected(&self) -> Vec<String> {
        self.suspicion_rx.borrow().clone()
    }

    fn publish_suspicions(&self, detectors: &HashMap<String, PhiAccrualDetector>) {
        let now = Instant::now();
        let mut suspected: Vec<String> = detectors
            .iter()
            .filter(|(_, d)| d.phi(now) > SUSPICION_THRESHOLD)
            .map(|(peer, _)| peer.clone())
            .collect();
        suspected.sort();
        let _ = self.suspicion_tx.send(suspected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn regular_heartbeats_keep_phi_low() {
        let mut detector = PhiAccrualDetector::default();
        let mut now = Instant::now();
        for _ in 0..20 {
            detector.record_heartbeat(now);
            now += Duration::from_millis(100);
        }
        assert!(detector.phi(now) < SUSPICION_THRESHOLD);
    }

    #[test]
    fn a_long_silence_raises_phi_above_threshold() {
        let mut detector = PhiAccrualDetector::default();
        let mut now = Instant::now();
        for _ in 0..20 {
            detector.record_heartbeat(now);
            now += Duration::from_millis(100);
        }
        let silent_now = now + Duration::from_secs(5);
        assert!(detector.phi(silent_now) > SUSPICION_THRESHOLD);
    }
}
