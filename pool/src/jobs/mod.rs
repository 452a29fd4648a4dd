/// Job engine: share types, the coin-family seam and the generic manager
///
/// A [`CoinFamily`] knows how to talk to one kind of daemon, turn its
/// templates into [`MiningJob`]s and validate submissions against them.
/// [`JobManager`] drives the startup state machine, template refresh,
/// the valid-job backlog and block submission for any family.

pub mod bitcoin;
pub mod ethereum;
pub mod manager;
pub mod zcash;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::daemon::{DaemonError, DaemonRpc};
use crate::stratum::protocol::{StratumError, StratumNotification, StratumRequest};

pub use manager::{JobManager, JobManagerOptions, JobManagerState, NewJob};

/// Shares may be submitted against jobs up to this many heights behind the newest.
pub const MAX_BLOCK_BACKLOG: u64 = 3;

/// Refreshed jobs kept for one height; the oldest refresh goes first.
pub const MAX_JOBS_PER_HEIGHT: usize = 8;

/// Seconds an `ntime` may run ahead of the local clock.
pub const MAX_NTIME_DRIFT: u64 = 7200;

/// Minimum share/assigned difficulty ratio accepted.
pub const MIN_DIFFICULTY_RATIO: f64 = 0.99;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShareError {
    #[error("{0}")]
    Other(String),

    #[error("job not found")]
    JobNotFound,

    #[error("duplicate share")]
    DuplicateShare,

    #[error("low difficulty share ({0})")]
    LowDifficultyShare(f64),

    #[error("Unauthorized worker")]
    UnauthorizedWorker,

    #[error("Not subscribed")]
    NotSubscribed,

    #[error("{0}")]
    MinusOne(String),
}

impl ShareError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn code(&self) -> i32 {
        match self {
            Self::Other(_) => StratumError::OTHER,
            Self::JobNotFound => StratumError::JOB_NOT_FOUND,
            Self::DuplicateShare => StratumError::DUPLICATE_SHARE,
            Self::LowDifficultyShare(_) => StratumError::LOW_DIFFICULTY,
            Self::UnauthorizedWorker => StratumError::UNAUTHORIZED,
            Self::NotSubscribed => StratumError::NOT_SUBSCRIBED,
            Self::MinusOne(_) => StratumError::MINUS_ONE,
        }
    }
}

impl From<ShareError> for StratumError {
    fn from(e: ShareError) -> Self {
        StratumError::new(e.code(), e.to_string())
    }
}

/// Fatal for the pool being started; other pools keep running.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("unsupported daemon: {0}")]
    UnsupportedDaemon(String),

    #[error("invalid pool address {0}")]
    InvalidPoolAddress(String),

    #[error("daemon command {method} failed: {source}")]
    Daemon {
        method: String,
        #[source]
        source: DaemonError,
    },

    #[error("startup cancelled")]
    Cancelled,
}

impl StartupError {
    pub fn daemon(method: &str, source: DaemonError) -> Self {
        Self::Daemon {
            method: method.to_string(),
            source,
        }
    }
}

/// A validated submission, handed to persistence/payout consumers.
#[derive(Debug, Clone, Serialize)]
pub struct Share {
    pub pool_id: String,
    pub block_height: u64,
    pub miner: String,
    pub worker: String,
    pub user_agent: Option<String>,
    pub ip_address: String,
    /// Cluster that accepted the share
    pub source: String,
    /// Stratum difficulty the share was credited at
    pub difficulty: f64,
    pub network_difficulty: f64,
    pub is_block_candidate: bool,
    pub block_hash: Option<String>,
    pub block_reward: Option<Decimal>,
    /// Coinbase txid (UTXO chains) used later to confirm the block
    pub transaction_confirmation_data: Option<String>,
    pub created: DateTime<Utc>,
}

impl Share {
    pub fn new(ctx: &WorkerShareContext, block_height: u64, difficulty: f64, network_difficulty: f64) -> Self {
        Self {
            pool_id: String::new(),
            block_height,
            miner: ctx.miner.clone(),
            worker: ctx.worker.clone(),
            user_agent: ctx.user_agent.clone(),
            ip_address: ctx.ip_address.clone(),
            source: String::new(),
            difficulty,
            network_difficulty,
            is_block_candidate: false,
            block_hash: None,
            block_reward: None,
            transaction_confirmation_data: None,
            created: Utc::now(),
        }
    }
}

/// Worker fields share validation reads. Copied out of the connection so no
/// connection lock is held while a share is being verified.
#[derive(Debug, Clone, Default)]
pub struct WorkerShareContext {
    pub extra_nonce1: String,
    pub difficulty: f64,
    pub previous_difficulty: Option<f64>,
    /// A VarDiff retarget has happened on this connection
    pub vardiff_updated: bool,
    pub miner: String,
    pub worker: String,
    pub user_agent: Option<String>,
    pub ip_address: String,
}

impl WorkerShareContext {
    /// Resolve the difficulty a share is credited at: the current one, or the
    /// previous one while a VarDiff change may still be in flight.
    pub fn credited_difficulty(&self, share_diff: f64) -> Result<f64, ShareError> {
        if share_diff / self.difficulty >= MIN_DIFFICULTY_RATIO {
            return Ok(self.difficulty);
        }
        match self.previous_difficulty {
            Some(prev) if self.vardiff_updated && share_diff / prev >= MIN_DIFFICULTY_RATIO => Ok(prev),
            _ => Err(ShareError::LowDifficultyShare(share_diff)),
        }
    }
}

/// Local validation result. `block` carries the submission payload for
/// block candidates.
#[derive(Debug, Clone)]
pub struct ShareOutcome<B> {
    pub share: Share,
    pub block: Option<B>,
}

/// Per-job set of seen submissions.
#[derive(Debug, Default)]
pub struct SubmissionSet {
    seen: Mutex<HashSet<String>>,
}

impl SubmissionSet {
    /// Record `key`; false if it was already present.
    pub fn register(&self, key: String) -> bool {
        self.seen.lock().insert(key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hands out unique extranonce1 values of a fixed byte width.
#[derive(Debug)]
pub struct ExtraNonceProvider {
    size: usize,
    counter: AtomicU64,
}

impl ExtraNonceProvider {
    pub fn new(size: usize) -> Self {
        let size = size.clamp(1, 8);
        Self {
            size,
            counter: AtomicU64::new(rand::thread_rng().gen()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn next(&self) -> String {
        let value = self.counter.fetch_add(1, Ordering::Relaxed);
        let masked = if self.size >= 8 {
            value
        } else {
            value & ((1u64 << (self.size * 8)) - 1)
        };
        format!("{:0width$x}", masked, width = self.size * 2)
    }
}

pub trait MiningJob: Send + Sync {
    fn id(&self) -> &str;
    fn height(&self) -> u64;
    /// `mining.notify` parameters; the trailing element is the clean-jobs flag.
    fn job_params(&self, is_new: bool) -> Value;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncStatus {
    Synced,
    Syncing { percent: Option<f64> },
}

#[async_trait]
pub trait CoinFamily: Send + Sync + Sized + 'static {
    type Job: MiningJob + 'static;
    type Template: Send + Sync + 'static;
    /// Chain facts discovered during post-start initialisation.
    type Chain: Send + Sync + 'static;
    type Submission: Send + 'static;
    /// What the daemon needs to accept a found block.
    type Block: Send + Sync + 'static;

    fn name(&self) -> &'static str;
    fn daemon(&self) -> &Arc<dyn DaemonRpc>;

    async fn are_daemons_healthy(&self) -> bool;
    async fn are_daemons_connected(&self) -> bool;
    async fn sync_status(&self) -> SyncStatus;

    fn sync_poll_interval(&self) -> Duration {
        Duration::from_secs(10)
    }

    async fn post_start_init(&self) -> Result<Self::Chain, StartupError>;

    async fn fetch_template(&self, chain: &Self::Chain) -> Result<Self::Template, DaemonError>;

    /// Identity of a template; a new job is only built when this changes.
    fn template_key(&self, template: &Self::Template) -> String;

    fn create_job(&self, chain: &Self::Chain, template: Self::Template, job_id: String) -> anyhow::Result<Self::Job>;

    fn parse_submission(&self, params: &[Value]) -> Result<Self::Submission, ShareError>;

    fn submission_job_id<'a>(&self, submission: &'a Self::Submission) -> &'a str;

    async fn process_share(
        &self,
        chain: &Self::Chain,
        job: &Self::Job,
        ctx: &WorkerShareContext,
        submission: Self::Submission,
    ) -> Result<ShareOutcome<Self::Block>, ShareError>;

    /// Submit a candidate. Returns whether the daemon accepted it, filling in
    /// confirmation data on the share when available.
    async fn submit_block(&self, share: &mut Share, block: &Self::Block) -> bool;

    async fn validate_address(&self, address: &str) -> bool;

    // Stratum dialect

    fn extranonce1_size(&self) -> usize;

    fn subscribe_result(
        &self,
        request: &StratumRequest,
        connection_id: &str,
        extra_nonce1: &str,
    ) -> Result<Value, StratumError>;

    fn difficulty_notification(&self, difficulty: f64) -> StratumNotification;

    /// The dialect understands `mining.suggest_target`.
    fn supports_suggest_target(&self) -> bool {
        false
    }

    /// Difficulty asked for by `mining.suggest_target`; `None` for an invalid target.
    fn suggested_target_difficulty(&self, _target_hex: &str) -> Option<f64> {
        None
    }

    /// Factor from stratum difficulty to the unit shares are reported in.
    fn share_multiplier(&self) -> f64 {
        1.0
    }
}
