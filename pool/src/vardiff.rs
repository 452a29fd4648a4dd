/// Variable difficulty controller
///
/// Keeps each connection's share cadence near `target_time` by watching the
/// intervals between submissions and proposing a new difficulty once per
/// `retarget_time`. An idle timer drives the same update path when a miner
/// goes quiet so that an over-assigned difficulty still comes down.

use serde::Deserialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of inter-share samples kept per connection.
pub const SAMPLE_COUNT: usize = 32;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VarDiffConfigError {
    #[error("var_diff.min_diff must be positive")]
    NonPositiveMinDiff,
    #[error("var_diff.max_diff {max} is below min_diff {min}")]
    MaxBelowMin { min: f64, max: f64 },
    #[error("var_diff.target_time and retarget_time must be positive")]
    NonPositiveTiming,
    #[error("var_diff.variance_percent {0} must be within [0, 100)")]
    VarianceOutOfRange(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct VarDiffConfig {
    pub min_diff: f64,
    #[serde(default)]
    pub max_diff: Option<f64>,
    /// Largest absolute step a single retarget may take
    #[serde(default)]
    pub max_delta: Option<f64>,
    /// Desired average seconds between shares
    pub target_time: f64,
    /// Seconds between retargets
    pub retarget_time: f64,
    /// Tolerance band around `target_time`, in percent
    pub variance_percent: f64,
}

impl Default for VarDiffConfig {
    fn default() -> Self {
        Self {
            min_diff: 1.0,
            max_diff: None,
            max_delta: None,
            target_time: 15.0,
            retarget_time: 90.0,
            variance_percent: 30.0,
        }
    }
}

impl VarDiffConfig {
    pub fn validate(&self) -> Result<(), VarDiffConfigError> {
        if !(self.min_diff > 0.0) {
            return Err(VarDiffConfigError::NonPositiveMinDiff);
        }
        if let Some(max) = self.max_diff {
            if max < self.min_diff {
                return Err(VarDiffConfigError::MaxBelowMin { min: self.min_diff, max });
            }
        }
        if !(self.target_time > 0.0) || !(self.retarget_time > 0.0) {
            return Err(VarDiffConfigError::NonPositiveTiming);
        }
        if !(0.0..100.0).contains(&self.variance_percent) {
            return Err(VarDiffConfigError::VarianceOutOfRange(self.variance_percent));
        }
        Ok(())
    }

    /// Acceptable average share interval `[target / (1 + v), target * (1 + v)]`.
    pub fn band(&self) -> (f64, f64) {
        let v = 1.0 + self.variance_percent / 100.0;
        (self.target_time / v, self.target_time * v)
    }

    pub fn target_duration(&self) -> Duration {
        Duration::from_secs_f64(self.target_time)
    }
}

#[derive(Debug, Clone)]
pub struct VarDiffState {
    cfg: VarDiffConfig,
    /// Inter-share intervals, seconds
    time_buffer: VecDeque<f64>,
    last_ts: Option<Instant>,
    last_rtc: Option<Instant>,
    /// Set whenever a retarget actually changed the difficulty
    last_update: Option<Instant>,
}

impl VarDiffState {
    pub fn new(cfg: VarDiffConfig) -> Self {
        Self {
            cfg,
            time_buffer: VecDeque::with_capacity(SAMPLE_COUNT),
            last_ts: None,
            last_rtc: None,
            last_update: None,
        }
    }

    pub fn config(&self) -> &VarDiffConfig {
        &self.cfg
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    /// Record a submission (or an idle tick when `is_idle_update`) and
    /// optionally retarget.
    ///
    /// Returns `Some(new_difficulty)` if a retarget occurred and difficulty changed.
    pub fn update(&mut self, difficulty: f64, is_idle_update: bool, now: Instant) -> Option<f64> {
        let last_ts = match self.last_ts {
            Some(ts) => ts,
            None => {
                // First observation: start the window half-way so the first
                // retarget comes after half a retarget period.
                let half = Duration::from_secs_f64(self.cfg.retarget_time / 2.0);
                self.last_rtc = Some(now.checked_sub(half).unwrap_or(now));
                self.last_ts = Some(now);
                return None;
            }
        };

        let since_last = now.saturating_duration_since(last_ts).as_secs_f64();
        if self.time_buffer.len() == SAMPLE_COUNT {
            self.time_buffer.pop_front();
        }
        self.time_buffer.push_back(since_last);
        self.last_ts = Some(now);

        let last_rtc = self.last_rtc.unwrap_or(now);
        let since_retarget = now.saturating_duration_since(last_rtc).as_secs_f64();
        if since_retarget < self.cfg.retarget_time && !is_idle_update {
            return None;
        }
        self.last_rtc = Some(now);

        let avg = self.time_buffer.iter().sum::<f64>() / self.time_buffer.len() as f64;
        let (t_min, t_max) = self.cfg.band();
        let mut new_diff = None;

        if avg > 0.0 && avg < t_min {
            // Too fast: raise difficulty
            let mut candidate = difficulty * self.cfg.target_time / avg;
            if let Some(max_delta) = self.cfg.max_delta {
                candidate = candidate.min(difficulty + max_delta);
            }
            if let Some(max_diff) = self.cfg.max_diff {
                candidate = candidate.min(max_diff);
            }
            // a clamp below the current difficulty must not lower it
            if candidate > difficulty {
                new_diff = Some(candidate);
            }
        } else if avg > t_max {
            // Too slow: lower difficulty
            let mut candidate = difficulty * self.cfg.target_time / avg;
            if let Some(max_delta) = self.cfg.max_delta {
                candidate = candidate.max(difficulty - max_delta);
            }
            candidate = candidate.max(self.cfg.min_diff);
            if candidate < difficulty {
                new_diff = Some(candidate);
            }
        }

        match new_diff {
            Some(d) if (d - difficulty).abs() > f64::EPSILON * difficulty.abs().max(1.0) => {
                self.last_update = Some(now);
                self.time_buffer.clear();
                Some(d)
            }
            _ => None,
        }
    }
}
