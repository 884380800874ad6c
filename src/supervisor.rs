//! Reconnection policy and adaptive quality control.
//!
//! - `ReconnectionSupervisor` counts consecutive failures, computes the
//!   exponential backoff delay and decides when a recorder must halt.
//! - `QualityController` steps the analysis tier down while frames stop
//!   arriving and back up once they flow again, one step per dwell period.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_secs: f64,
    pub max_delay_secs: f64,
    /// Relative jitter applied to every delay, e.g. 0.1 = +-10 %.
    pub jitter: f64,
    pub max_consecutive_errors: u32,
    /// No unit at all for this long ends the session as a stalled stream.
    pub stall_timeout_secs: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 5.0,
            max_delay_secs: 300.0,
            jitter: 0.1,
            max_consecutive_errors: 10,
            stall_timeout_secs: 30.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn validate(&self) -> Result<()> {
        if !(self.base_delay_secs > 0.0) {
            return Err(anyhow!("reconnect.base_delay_secs must be > 0"));
        }
        if self.max_delay_secs < self.base_delay_secs {
            return Err(anyhow!("reconnect.max_delay_secs must be >= base_delay_secs"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(anyhow!("reconnect.jitter must be within 0..1"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(anyhow!("reconnect.max_consecutive_errors must be >= 1"));
        }
        if !(self.stall_timeout_secs > 0.0) {
            return Err(anyhow!("reconnect.stall_timeout_secs must be > 0"));
        }
        Ok(())
    }

    /// Un-jittered delay after the `failures`-th consecutive failure:
    /// `min(base x 2^(failures-1), max)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(62) as i32;
        let secs = (self.base_delay_secs * 2f64.powi(exponent)).min(self.max_delay_secs);
        Duration::from_secs_f64(secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stall_timeout_secs)
    }
}

/// Decision after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureAction {
    Retry(Duration),
    Halt,
}

pub struct ReconnectionSupervisor {
    policy: ReconnectPolicy,
    consecutive_errors: u32,
    current_delay: Duration,
}

impl ReconnectionSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        let current_delay = policy.delay_for(1);
        Self {
            policy,
            consecutive_errors: 0,
            current_delay,
        }
    }

    /// A good unit arrived: the error budget and backoff start over.
    pub fn record_success(&mut self) {
        if self.consecutive_errors > 0 {
            log::debug!("resetting error count after {} failures", self.consecutive_errors);
        }
        self.consecutive_errors = 0;
        self.current_delay = self.policy.delay_for(1);
    }

    /// A connect attempt or session failed.
    pub fn record_failure(&mut self) -> FailureAction {
        self.consecutive_errors += 1;
        if self.exhausted() {
            return FailureAction::Halt;
        }
        let base = self.policy.delay_for(self.consecutive_errors);
        self.current_delay = policy_jitter(base, self.policy.jitter);
        FailureAction::Retry(self.current_delay)
    }

    /// A corrupt unit: counted toward the budget, no reconnect.
    /// Returns true when the budget is exhausted.
    pub fn record_decode_error(&mut self) -> bool {
        self.consecutive_errors += 1;
        self.exhausted()
    }

    fn exhausted(&self) -> bool {
        self.consecutive_errors >= self.policy.max_consecutive_errors
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

fn policy_jitter(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Sleep up to `duration`, waking early when `stop` is set.
/// Returns false if the sleep was interrupted.
pub fn interruptible_sleep(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

// ----------------------------------------------------------------------------
// Adaptive quality
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    /// Hand every Nth decoded frame to the detector.
    pub fn detector_stride(self) -> u64 {
        match self {
            QualityTier::High => 2,
            QualityTier::Medium => 3,
            QualityTier::Low => 6,
        }
    }

    /// Publish every Nth decoded frame as the live preview.
    pub fn preview_stride(self) -> u64 {
        match self {
            QualityTier::High => 1,
            QualityTier::Medium => 2,
            QualityTier::Low => 4,
        }
    }

    pub fn higher(self) -> Option<QualityTier> {
        match self {
            QualityTier::Low => Some(QualityTier::Medium),
            QualityTier::Medium => Some(QualityTier::High),
            QualityTier::High => None,
        }
    }

    pub fn lower(self) -> Option<QualityTier> {
        match self {
            QualityTier::High => Some(QualityTier::Medium),
            QualityTier::Medium => Some(QualityTier::Low),
            QualityTier::Low => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityTier::High => write!(f, "high"),
            QualityTier::Medium => write!(f, "medium"),
            QualityTier::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    /// A frame gap longer than this steps the tier down.
    pub degrade_after: Duration,
    /// A frame gap shorter than this steps the tier up.
    pub recover_within: Duration,
    /// Minimum time between tier changes.
    pub dwell: Duration,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            degrade_after: Duration::from_secs(10),
            recover_within: Duration::from_secs(2),
            dwell: Duration::from_secs(5),
        }
    }
}

pub struct QualityController {
    tier: QualityTier,
    last_frame_at: Instant,
    last_change: Instant,
    config: QualityConfig,
}

impl QualityController {
    pub fn new(config: QualityConfig, now: Instant) -> Self {
        Self {
            tier: QualityTier::High,
            last_frame_at: now,
            last_change: now,
            config,
        }
    }

    pub fn tier(&self) -> QualityTier {
        self.tier
    }

    pub fn on_frame(&mut self, now: Instant) {
        self.last_frame_at = now;
    }

    /// Returns the new tier when it changed.
    pub fn evaluate(&mut self, now: Instant) -> Option<QualityTier> {
        if now.saturating_duration_since(self.last_change) < self.config.dwell {
            return None;
        }
        let gap = now.saturating_duration_since(self.last_frame_at);
        let next = if gap > self.config.degrade_after {
            self.tier.lower()
        } else if gap < self.config.recover_within {
            self.tier.higher()
        } else {
            None
        }?;
        self.tier = next;
        self.last_change = now;
        Some(next)
    }
}
