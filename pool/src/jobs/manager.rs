/// Generic job manager
///
/// Owns the startup state machine, the template refresh loop, the backlog of
/// jobs shares may still be submitted against, and block submission. New
/// jobs are published on a broadcast channel; the pool orchestrator is the
/// subscriber that fans them out to connections.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{CoinFamily, MiningJob, Share, ShareError, ShareOutcome, StartupError, SyncStatus, WorkerShareContext, MAX_BLOCK_BACKLOG, MAX_JOBS_PER_HEIGHT};
use crate::daemon::DaemonError;
use crate::metrics::prometheus as metrics;

const JOB_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobManagerState {
    WaitDaemonsHealthy,
    WaitDaemonsConnected,
    WaitDaemonsSynced,
    PostStartInit,
    Online,
}

/// Published whenever a job should be (re)broadcast.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub height: u64,
    pub is_new: bool,
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct JobManagerOptions {
    pub pool_id: String,
    pub cluster_name: String,
    pub block_refresh_interval: Duration,
    pub job_rebroadcast_timeout: Duration,
    /// Delay between startup checks
    pub startup_poll_interval: Duration,
}

impl JobManagerOptions {
    pub fn new(pool_id: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            cluster_name: cluster_name.into(),
            block_refresh_interval: Duration::from_millis(1000),
            job_rebroadcast_timeout: Duration::from_secs(55),
            startup_poll_interval: Duration::from_secs(10),
        }
    }
}

struct Backlog<J> {
    jobs: HashMap<String, Arc<J>>,
    /// Job ids, oldest first
    order: VecDeque<String>,
    current: Option<Arc<J>>,
    current_key: Option<String>,
    last_broadcast: Option<Instant>,
}

pub struct JobManager<F: CoinFamily> {
    family: Arc<F>,
    options: JobManagerOptions,
    chain: OnceLock<F::Chain>,
    state: Mutex<JobManagerState>,
    backlog: Mutex<Backlog<F::Job>>,
    job_counter: AtomicI32,
    jobs_tx: broadcast::Sender<NewJob>,
}

impl<F: CoinFamily> JobManager<F> {
    pub fn new(family: Arc<F>, options: JobManagerOptions) -> Self {
        let (jobs_tx, _) = broadcast::channel(JOB_CHANNEL_CAPACITY);
        Self {
            family,
            options,
            chain: OnceLock::new(),
            state: Mutex::new(JobManagerState::WaitDaemonsHealthy),
            backlog: Mutex::new(Backlog {
                jobs: HashMap::new(),
                order: VecDeque::new(),
                current: None,
                current_key: None,
                last_broadcast: None,
            }),
            job_counter: AtomicI32::new(0),
            jobs_tx,
        }
    }

    pub fn family(&self) -> &Arc<F> {
        &self.family
    }

    pub fn pool_id(&self) -> &str {
        &self.options.pool_id
    }

    pub fn state(&self) -> JobManagerState {
        *self.state.lock()
    }

    pub fn chain(&self) -> Option<&F::Chain> {
        self.chain.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewJob> {
        self.jobs_tx.subscribe()
    }

    pub fn current_job(&self) -> Option<Arc<F::Job>> {
        self.backlog.lock().current.clone()
    }

    pub fn current_job_params(&self, is_new: bool) -> Option<Value> {
        self.current_job().map(|job| job.job_params(is_new))
    }

    pub fn get_job(&self, job_id: &str) -> Option<Arc<F::Job>> {
        self.backlog.lock().jobs.get(job_id).cloned()
    }

    pub fn valid_job_count(&self) -> usize {
        self.backlog.lock().jobs.len()
    }

    /// Next job id: an incrementing 32-bit counter wrapping to zero, as 8 hex digits.
    pub fn next_job_id(&self) -> String {
        let prev = self
            .job_counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(if v == i32::MAX { 0 } else { v + 1 })
            })
            .unwrap_or(0);
        let next = if prev == i32::MAX { 0 } else { prev + 1 };
        format!("{:08x}", next)
    }

    fn set_state(&self, state: JobManagerState) {
        *self.state.lock() = state;
        tracing::debug!("[{}] Job manager state: {:?}", self.options.pool_id, state);
    }

    async fn pause(&self, cancel: &CancellationToken, interval: Duration) -> Result<(), StartupError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(StartupError::Cancelled),
            _ = tokio::time::sleep(interval) => Ok(()),
        }
    }

    /// Run the startup state machine up to the first job. Returns once the
    /// manager is online; the refresh loop is started separately.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), StartupError> {
        let pool = self.options.pool_id.clone();
        let poll = self.options.startup_poll_interval;
        tracing::info!("[{}] 🚀 Launching {} job manager", pool, self.family.name());

        self.set_state(JobManagerState::WaitDaemonsHealthy);
        while !self.family.are_daemons_healthy().await {
            tracing::info!("[{}] ⏳ Waiting for daemons to come online ...", pool);
            self.pause(cancel, poll).await?;
        }
        tracing::info!("[{}] ✅ All daemons online", pool);

        self.set_state(JobManagerState::WaitDaemonsConnected);
        while !self.family.are_daemons_connected().await {
            tracing::info!("[{}] ⏳ Waiting for daemons to connect to peers ...", pool);
            self.pause(cancel, poll).await?;
        }

        self.set_state(JobManagerState::WaitDaemonsSynced);
        let mut announced = false;
        loop {
            match self.family.sync_status().await {
                SyncStatus::Synced => break,
                SyncStatus::Syncing { percent } => {
                    if !announced {
                        tracing::info!(
                            "[{}] ⏳ Daemons still syncing with network. Manager will be started once synced",
                            pool
                        );
                        announced = true;
                    }
                    if let Some(p) = percent {
                        tracing::info!("[{}] Daemons have downloaded {:.2}% of the chain", pool, p);
                    }
                }
            }
            self.pause(cancel, self.family.sync_poll_interval().min(poll)).await?;
        }
        tracing::info!("[{}] ✅ All daemons synched with blockchain", pool);

        self.set_state(JobManagerState::PostStartInit);
        let chain = self.family.post_start_init().await?;
        // start() runs once per manager; a second call keeps the first chain
        let _ = self.chain.set(chain);

        loop {
            match self.refresh(true).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => tracing::warn!("[{}] ⚠️  Unable to fetch initial block template: {}", pool, e),
            }
            tracing::info!("[{}] ⏳ Waiting for first valid block template", pool);
            self.pause(cancel, poll.min(Duration::from_secs(5))).await?;
        }

        self.set_state(JobManagerState::Online);
        tracing::info!("[{}] ✅ Job manager online", pool);
        Ok(())
    }

    /// Poll the daemon every `block_refresh_interval` until cancelled.
    pub fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.options.block_refresh_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = this.refresh(false).await {
                            metrics::inc_template_fetch_errors(&this.options.pool_id);
                            tracing::warn!("[{}] ⚠️  Error refreshing block template: {}", this.options.pool_id, e);
                        }
                    }
                }
            }
            tracing::debug!("[{}] Template refresh loop stopped", this.options.pool_id);
        })
    }

    /// Fetch a template and publish a job if it changed, or if the current
    /// job is older than the rebroadcast timeout. `force` always rebuilds.
    pub async fn refresh(&self, force: bool) -> Result<bool, DaemonError> {
        let Some(chain) = self.chain.get() else {
            return Ok(false);
        };
        let template = self.family.fetch_template(chain).await?;
        let key = self.family.template_key(&template);

        let (changed, stale) = {
            let backlog = self.backlog.lock();
            let changed = backlog.current_key.as_deref() != Some(key.as_str());
            let stale = backlog
                .last_broadcast
                .map(|t| t.elapsed() >= self.options.job_rebroadcast_timeout)
                .unwrap_or(true);
            (changed, stale)
        };
        if !changed && !stale && !force {
            return Ok(false);
        }

        let job_id = self.next_job_id();
        let job = match self.family.create_job(chain, template, job_id) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!("[{}] Failed to build job from template: {:#}", self.options.pool_id, e);
                return Ok(false);
            }
        };
        if changed {
            tracing::info!("[{}] 📦 New block {} detected", self.options.pool_id, job.height());
        } else {
            tracing::debug!("[{}] Refreshing job {} for block {}", self.options.pool_id, job.id(), job.height());
        }
        self.publish(job, key, changed);
        Ok(true)
    }

    /// Insert `job` as current, evict jobs too far behind it or over the
    /// per-height cap, and broadcast it.
    pub fn publish(&self, job: F::Job, key: String, is_new: bool) {
        let job = Arc::new(job);
        let height = job.height();
        {
            let mut backlog = self.backlog.lock();
            let backlog = &mut *backlog;
            backlog.jobs.insert(job.id().to_string(), Arc::clone(&job));
            backlog.order.retain(|id| id != job.id());
            backlog.order.push_back(job.id().to_string());
            backlog
                .jobs
                .retain(|_, j| j.height() + MAX_BLOCK_BACKLOG >= height);

            let jobs = &mut backlog.jobs;
            let mut same_height = jobs.values().filter(|j| j.height() == height).count();
            backlog.order.retain(|id| {
                let Some(job_height) = jobs.get(id).map(|j| j.height()) else {
                    return false;
                };
                if job_height == height && same_height > MAX_JOBS_PER_HEIGHT {
                    jobs.remove(id);
                    same_height -= 1;
                    return false;
                }
                true
            });

            backlog.current = Some(Arc::clone(&job));
            backlog.current_key = Some(key);
            backlog.last_broadcast = Some(Instant::now());
        }

        metrics::set_template_height(&self.options.pool_id, height);
        metrics::inc_job_broadcasts(&self.options.pool_id);
        tracing::info!(
            "[{}] 📢 Broadcasting job {} (height {}, new={})",
            self.options.pool_id,
            job.id(),
            height,
            is_new
        );

        // no receivers is fine before the orchestrator subscribes
        let _ = self.jobs_tx.send(NewJob {
            job_id: job.id().to_string(),
            height,
            is_new,
            params: job.job_params(is_new),
        });
    }

    /// Validate a `mining.submit` against the backlog and, for block
    /// candidates, hand the block to the daemon.
    pub async fn submit_share(&self, ctx: &WorkerShareContext, params: &[Value]) -> Result<Share, ShareError> {
        let chain = self
            .chain
            .get()
            .ok_or_else(|| ShareError::other("pool is not online"))?;
        let submission = self.family.parse_submission(params)?;

        let job = self
            .get_job(self.family.submission_job_id(&submission))
            .ok_or(ShareError::JobNotFound)?;

        let ShareOutcome { mut share, block } = self.family.process_share(chain, &job, ctx, submission).await?;
        share.pool_id = self.options.pool_id.clone();
        share.source = self.options.cluster_name.clone();
        share.created = Utc::now();

        if share.is_block_candidate {
            match block {
                Some(block) => {
                    tracing::info!(
                        "[{}] 🎯 Submitting block {} [{}]",
                        self.options.pool_id,
                        share.block_height,
                        share.block_hash.as_deref().unwrap_or("")
                    );
                    metrics::inc_block_submit_attempts(&self.options.pool_id);
                    let accepted = self.family.submit_block(&mut share, &block).await;
                    share.is_block_candidate = accepted;
                    if accepted {
                        metrics::inc_blocks_found(&self.options.pool_id);
                        tracing::info!(
                            "[{}] ✅ Daemon accepted block {} submitted by {}",
                            self.options.pool_id,
                            share.block_height,
                            share.miner
                        );
                    } else {
                        metrics::inc_block_submit_rejected(&self.options.pool_id);
                        share.transaction_confirmation_data = None;
                    }
                }
                None => share.is_block_candidate = false,
            }
        }

        Ok(share)
    }

    #[cfg(test)]
    pub(crate) fn set_chain_for_test(&self, chain: F::Chain) {
        let _ = self.chain.set(chain);
        self.set_state(JobManagerState::Online);
    }

    #[cfg(test)]
    pub(crate) fn set_job_counter(&self, value: i32) {
        self.job_counter.store(value, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{DaemonRpc, MockDaemon};
    use crate::jobs::{ShareOutcome, WorkerShareContext};
    use crate::stratum::protocol::{methods, StratumError, StratumNotification, StratumRequest};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    struct TestJob {
        id: String,
        height: u64,
    }

    impl MiningJob for TestJob {
        fn id(&self) -> &str {
            &self.id
        }
        fn height(&self) -> u64 {
            self.height
        }
        fn job_params(&self, is_new: bool) -> Value {
            json!([self.id, self.height, is_new])
        }
    }

    struct TestFamily {
        daemon: Arc<dyn DaemonRpc>,
        healthy: AtomicBool,
        accept_blocks: bool,
    }

    impl TestFamily {
        fn new(daemon: Arc<MockDaemon>) -> Self {
            Self {
                daemon,
                healthy: AtomicBool::new(true),
                accept_blocks: true,
            }
        }
    }

    #[async_trait]
    impl CoinFamily for TestFamily {
        type Job = TestJob;
        type Template = u64;
        type Chain = ();
        type Submission = String;
        type Block = String;

        fn name(&self) -> &'static str {
            "test"
        }
        fn daemon(&self) -> &Arc<dyn DaemonRpc> {
            &self.daemon
        }
        async fn are_daemons_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
        async fn are_daemons_connected(&self) -> bool {
            true
        }
        async fn sync_status(&self) -> SyncStatus {
            SyncStatus::Synced
        }
        async fn post_start_init(&self) -> Result<(), StartupError> {
            Ok(())
        }
        async fn fetch_template(&self, _chain: &()) -> Result<u64, DaemonError> {
            let v = self.daemon.execute_any("height", json!([])).await?;
            v.as_u64().ok_or_else(|| DaemonError::Decode("height".into()))
        }
        fn template_key(&self, template: &u64) -> String {
            template.to_string()
        }
        fn create_job(&self, _chain: &(), template: u64, job_id: String) -> anyhow::Result<TestJob> {
            Ok(TestJob { id: job_id, height: template })
        }
        fn parse_submission(&self, params: &[Value]) -> Result<String, ShareError> {
            params
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| ShareError::other("missing job id"))
        }
        fn submission_job_id<'a>(&self, submission: &'a String) -> &'a str {
            submission
        }
        async fn process_share(
            &self,
            _chain: &(),
            job: &TestJob,
            ctx: &WorkerShareContext,
            _submission: String,
        ) -> Result<ShareOutcome<String>, ShareError> {
            let mut share = Share::new(ctx, job.height, ctx.difficulty, 1.0);
            let candidate = ctx.miner == "lucky";
            share.is_block_candidate = candidate;
            Ok(ShareOutcome {
                share,
                block: candidate.then(|| "00".to_string()),
            })
        }
        async fn submit_block(&self, share: &mut Share, _block: &String) -> bool {
            share.transaction_confirmation_data = Some("txid".into());
            self.accept_blocks
        }
        async fn validate_address(&self, _address: &str) -> bool {
            true
        }
        fn extranonce1_size(&self) -> usize {
            4
        }
        fn subscribe_result(&self, _r: &StratumRequest, id: &str, en1: &str) -> Result<Value, StratumError> {
            Ok(json!([id, en1]))
        }
        fn difficulty_notification(&self, difficulty: f64) -> StratumNotification {
            StratumNotification::new(methods::SET_DIFFICULTY, json!([difficulty]))
        }
    }

    fn manager(daemon: Arc<MockDaemon>) -> JobManager<TestFamily> {
        let mut options = JobManagerOptions::new("test-pool", "cluster");
        options.startup_poll_interval = Duration::from_millis(10);
        options.job_rebroadcast_timeout = Duration::from_secs(3600);
        JobManager::new(Arc::new(TestFamily::new(daemon)), options)
    }

    fn ctx(miner: &str) -> WorkerShareContext {
        WorkerShareContext {
            extra_nonce1: "00000001".into(),
            difficulty: 8.0,
            miner: miner.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_ids_increment_and_wrap() {
        let m = manager(Arc::new(MockDaemon::new()));
        assert_eq!(m.next_job_id(), "00000001");
        assert_eq!(m.next_job_id(), "00000002");
        m.set_job_counter(i32::MAX - 1);
        assert_eq!(m.next_job_id(), "7fffffff");
        assert_eq!(m.next_job_id(), "00000000");
    }

    #[tokio::test]
    async fn test_backlog_evicts_old_heights() {
        let m = manager(Arc::new(MockDaemon::new()));
        m.set_chain_for_test(());
        let mut ids = Vec::new();
        for height in 1..=10u64 {
            let id = m.next_job_id();
            ids.push((id.clone(), height));
            m.publish(TestJob { id, height }, height.to_string(), true);
        }

        for (id, height) in &ids {
            assert_eq!(m.get_job(id).is_some(), *height + MAX_BLOCK_BACKLOG >= 10, "height {}", height);
        }
        assert_eq!(m.valid_job_count(), (MAX_BLOCK_BACKLOG + 1) as usize);

        let stale = m.submit_share(&ctx("m"), &[json!("w"), json!(ids[0].0)]).await;
        assert_eq!(stale.unwrap_err(), ShareError::JobNotFound);
    }

    #[tokio::test]
    async fn test_backlog_caps_refreshes_per_height() {
        let m = manager(Arc::new(MockDaemon::new()));
        m.set_chain_for_test(());
        let old = m.next_job_id();
        m.publish(TestJob { id: old.clone(), height: 99 }, "99".into(), true);

        let mut ids = Vec::new();
        for i in 0..MAX_JOBS_PER_HEIGHT + 5 {
            let id = m.next_job_id();
            ids.push(id.clone());
            m.publish(TestJob { id, height: 100 }, "100".into(), i == 0);
        }

        assert_eq!(m.valid_job_count(), MAX_JOBS_PER_HEIGHT + 1);
        // the oldest refreshes went first, the previous height is untouched
        for id in &ids[..5] {
            assert!(m.get_job(id).is_none());
        }
        for id in &ids[5..] {
            assert!(m.get_job(id).is_some());
        }
        assert!(m.get_job(&old).is_some());
        assert_eq!(m.current_job().unwrap().id, *ids.last().unwrap());
    }

    #[tokio::test]
    async fn test_unchanged_template_is_not_rebroadcast() {
        let daemon = Arc::new(MockDaemon::new());
        daemon.respond("height", json!(100));
        let m = manager(daemon.clone());
        m.set_chain_for_test(());
        let mut rx = m.subscribe();

        assert!(m.refresh(false).await.unwrap());
        let first = rx.recv().await.unwrap();
        assert!(first.is_new);
        assert_eq!(first.height, 100);

        assert!(!m.refresh(false).await.unwrap());

        // forced refresh keeps the block but is not a new one
        assert!(m.refresh(true).await.unwrap());
        let again = rx.recv().await.unwrap();
        assert!(!again.is_new);
        assert_ne!(again.job_id, first.job_id);

        daemon.respond("height", json!(101));
        assert!(m.refresh(false).await.unwrap());
        assert!(rx.recv().await.unwrap().is_new);
    }

    #[tokio::test]
    async fn test_rejected_block_is_not_a_candidate() {
        let daemon = Arc::new(MockDaemon::new());
        let mut family = TestFamily::new(daemon);
        family.accept_blocks = false;
        let m = JobManager::new(Arc::new(family), JobManagerOptions::new("p", "c"));
        m.set_chain_for_test(());
        let id = m.next_job_id();
        m.publish(TestJob { id: id.clone(), height: 5 }, "5".into(), true);

        let share = m.submit_share(&ctx("lucky"), &[json!("w"), json!(id)]).await.unwrap();
        assert!(!share.is_block_candidate);
        assert!(share.transaction_confirmation_data.is_none());
        assert_eq!(share.pool_id, "p");
        assert_eq!(share.source, "c");
    }

    #[tokio::test]
    async fn test_accepted_block_is_a_candidate() {
        let m = manager(Arc::new(MockDaemon::new()));
        m.set_chain_for_test(());
        let id = m.next_job_id();
        m.publish(TestJob { id: id.clone(), height: 5 }, "5".into(), true);
        let share = m.submit_share(&ctx("lucky"), &[json!("w"), json!(id)]).await.unwrap();
        assert!(share.is_block_candidate);
        assert_eq!(share.transaction_confirmation_data.as_deref(), Some("txid"));
    }

    #[tokio::test]
    async fn test_startup_reaches_online() {
        let daemon = Arc::new(MockDaemon::new());
        daemon.respond("height", json!(7));
        let m = manager(daemon);
        let mut rx = m.subscribe();
        m.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(m.state(), JobManagerState::Online);
        assert_eq!(rx.recv().await.unwrap().height, 7);
    }

    #[tokio::test]
    async fn test_startup_is_cancellable() {
        let daemon = Arc::new(MockDaemon::new());
        let family = TestFamily::new(daemon);
        family.healthy.store(false, Ordering::SeqCst);
        let mut options = JobManagerOptions::new("p", "c");
        options.startup_poll_interval = Duration::from_millis(10);
        let m = JobManager::new(Arc::new(family), options);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let result = m.start(&cancel).await;
        assert!(matches!(result, Err(StartupError::Cancelled)));
        assert_eq!(m.state(), JobManagerState::WaitDaemonsHealthy);
    }
}
