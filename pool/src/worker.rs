/// Per-connection miner state
///
/// Lives inside the connection and is only touched by that connection's
/// request path and its VarDiff idle timer.

use std::time::{Duration, Instant};

use crate::config::PoolShareBasedBanningConfig;
use crate::jobs::WorkerShareContext;
use crate::vardiff::{VarDiffConfig, VarDiffState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShareStats {
    pub valid: u32,
    pub invalid: u32,
}

/// Verdict of the share-based banning check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BanVerdict {
    /// Not enough shares yet
    Pending,
    /// Ratio healthy, counters were reset
    Healthy,
    /// Invalid percentage reached the threshold
    Ban { invalid_percent: f64 },
}

#[derive(Debug)]
pub struct WorkerContext {
    pub ip_address: String,
    pub is_subscribed: bool,
    pub is_authorized: bool,
    pub miner: Option<String>,
    pub worker: Option<String>,
    pub user_agent: Option<String>,
    pub extra_nonce1: Option<String>,
    pub difficulty: f64,
    pub previous_difficulty: Option<f64>,
    pending_difficulty: Option<f64>,
    pub vardiff: Option<VarDiffState>,
    /// Fixed with `d=` at authorize time
    pub is_static_difficulty: bool,
    pub stats: ShareStats,
    pub created: Instant,
    pub last_activity: Instant,
}

impl WorkerContext {
    pub fn new(ip_address: String, difficulty: f64, vardiff: Option<VarDiffConfig>) -> Self {
        let now = Instant::now();
        Self {
            ip_address,
            is_subscribed: false,
            is_authorized: false,
            miner: None,
            worker: None,
            user_agent: None,
            extra_nonce1: None,
            difficulty,
            previous_difficulty: None,
            pending_difficulty: None,
            vardiff: vardiff.map(VarDiffState::new),
            is_static_difficulty: false,
            stats: ShareStats::default(),
            created: now,
            last_activity: now,
        }
    }

    pub fn set_difficulty(&mut self, difficulty: f64) {
        self.previous_difficulty = Some(self.difficulty);
        self.difficulty = difficulty;
    }

    /// Queue a difficulty to take effect at the next clean boundary.
    pub fn enqueue_difficulty(&mut self, difficulty: f64) {
        self.pending_difficulty = Some(difficulty);
    }

    /// Apply a queued difficulty. Returns it when it changed the current one.
    pub fn apply_pending_difficulty(&mut self) -> Option<f64> {
        let next = self.pending_difficulty.take()?;
        if next == self.difficulty {
            return None;
        }
        self.set_difficulty(next);
        Some(next)
    }

    pub fn vardiff_updated(&self) -> bool {
        self.vardiff.as_ref().is_some_and(|v| v.last_update().is_some())
    }

    /// Fix the difficulty for the session and turn VarDiff off.
    pub fn set_static_difficulty(&mut self, difficulty: f64) {
        self.vardiff = None;
        self.pending_difficulty = None;
        self.is_static_difficulty = true;
        self.set_difficulty(difficulty);
    }

    pub fn share_context(&self) -> WorkerShareContext {
        WorkerShareContext {
            extra_nonce1: self.extra_nonce1.clone().unwrap_or_default(),
            difficulty: self.difficulty,
            previous_difficulty: self.previous_difficulty,
            vardiff_updated: self.vardiff_updated(),
            miner: self.miner.clone().unwrap_or_default(),
            worker: self.worker.clone().unwrap_or_default(),
            user_agent: self.user_agent.clone(),
            ip_address: self.ip_address.clone(),
        }
    }

    pub fn record_share(&mut self, valid: bool) {
        if valid {
            self.stats.valid += 1;
        } else {
            self.stats.invalid += 1;
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Evaluate the invalid share ratio once `check_threshold` shares were seen.
    pub fn consider_ban(&mut self, cfg: &PoolShareBasedBanningConfig) -> BanVerdict {
        let total = self.stats.valid + self.stats.invalid;
        if total < cfg.check_threshold.max(1) {
            return BanVerdict::Pending;
        }
        let invalid_percent = self.stats.invalid as f64 / total as f64 * 100.0;
        if invalid_percent < cfg.invalid_percent {
            self.stats = ShareStats::default();
            return BanVerdict::Healthy;
        }
        BanVerdict::Ban { invalid_percent }
    }
}
