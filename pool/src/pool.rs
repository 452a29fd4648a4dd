/// Pool orchestrator
///
/// Glues one coin family's job manager to the Stratum server: answers
/// miner requests, fans new jobs out to connections, drives VarDiff and
/// applies the banning policy. Accepted shares and found blocks leave the
/// pool as [`PoolEvent`]s.

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::banning::BanManager;
use crate::config::{ClusterBanningConfig, ClusterConfig, PoolConfig};
use crate::events::{EventBus, FoundBlock, PoolEvent};
use crate::jobs::{CoinFamily, ExtraNonceProvider, JobManager, JobManagerOptions, JobManagerState, MiningJob, NewJob, StartupError};
use crate::metrics::prometheus as metrics;
use crate::stratum::protocol::{methods, StratumError, StratumNotification, StratumRequest};
use crate::stratum::{ListenerOptions, StratumConnection, StratumHandler, StratumServer};
use crate::worker::{BanVerdict, WorkerContext};

/// Submissions older than this when they reach the handler are dropped.
pub const MAX_SHARE_AGE: Duration = Duration::from_secs(6);

/// Cooldown for clients that fail `mining.authorize`.
pub const AUTH_FAILURE_BAN: Duration = Duration::from_secs(60);

const PASSWORD_SEPARATOR: char = ';';

fn static_diff_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"d=(\d*(\.\d+)?)").expect("static difficulty regex"))
}

/// `d=<number>` from a `;`-separated authorize password.
pub fn static_difficulty(password: &str) -> Option<f64> {
    password.split(PASSWORD_SEPARATOR).find_map(|part| {
        let caps = static_diff_regex().captures(part)?;
        caps.get(1)?.as_str().trim().parse::<f64>().ok()
    })
}

/// Parse a numeric stratum parameter sent either as a number or a string.
fn param_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Snapshot reported on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub id: String,
    pub family: &'static str,
    pub state: String,
    pub online: bool,
    pub connections: usize,
    pub height: Option<u64>,
}

/// Object-safe view of a running pool, whatever its coin family.
pub trait PoolInfo: Send + Sync {
    fn status(&self) -> PoolStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarDiffTrigger {
    AcceptedShare,
    RejectedShare,
    Idle,
}

pub struct Pool<F: CoinFamily> {
    this: Weak<Self>,
    config: PoolConfig,
    banning: ClusterBanningConfig,
    manager: Arc<JobManager<F>>,
    extra_nonce: ExtraNonceProvider,
    ban_manager: Option<Arc<dyn BanManager>>,
    events: EventBus,
    connections: Mutex<HashMap<String, Arc<StratumConnection>>>,
}

impl<F: CoinFamily> Pool<F> {
    pub fn new(
        config: PoolConfig,
        cluster: &ClusterConfig,
        family: Arc<F>,
        ban_manager: Arc<dyn BanManager>,
        events: EventBus,
    ) -> Arc<Self> {
        let mut options = JobManagerOptions::new(config.id.clone(), cluster.cluster_name.clone());
        if config.block_refresh_interval > 0 {
            options.block_refresh_interval = Duration::from_millis(config.block_refresh_interval);
        }
        if config.job_rebroadcast_timeout > 0 {
            options.job_rebroadcast_timeout = Duration::from_secs(config.job_rebroadcast_timeout);
        }
        Self::with_options(config, cluster.banning.clone(), family, ban_manager, events, options)
    }

    pub fn with_options(
        config: PoolConfig,
        banning: ClusterBanningConfig,
        family: Arc<F>,
        ban_manager: Arc<dyn BanManager>,
        events: EventBus,
        options: JobManagerOptions,
    ) -> Arc<Self> {
        let extra_nonce = ExtraNonceProvider::new(family.extranonce1_size());
        let ban_manager = config.banning.enabled.then_some(ban_manager);
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            banning,
            manager: Arc::new(JobManager::new(family, options)),
            extra_nonce,
            ban_manager,
            events,
            connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn manager(&self) -> &Arc<JobManager<F>> {
        &self.manager
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn family(&self) -> &Arc<F> {
        self.manager.family()
    }

    /// Bring the job manager online and start the job fan-out.
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<(), StartupError> {
        let jobs = self.manager.subscribe();
        self.manager.start(cancel).await?;

        let pool = Arc::clone(self);
        let fan_out_cancel = cancel.clone();
        tokio::spawn(async move { pool.fan_out(jobs, fan_out_cancel).await });
        self.manager.spawn_refresh(cancel.clone());
        Ok(())
    }

    /// Serve Stratum on an already bound listener. `port` selects the
    /// endpoint configuration.
    pub fn serve(self: &Arc<Self>, listener: TcpListener, port: u16, cancel: CancellationToken) -> JoinHandle<()> {
        let server = Arc::new(StratumServer::new(
            self.config.id.clone(),
            Arc::clone(self),
            self.ban_manager.clone(),
            self.banning.ban_on_junk_receive,
        ));
        let options = ListenerOptions {
            port,
            proxy_protocol: self.config.ports.get(&port).and_then(|e| e.tcp_proxy_protocol.clone()),
        };
        tokio::spawn(server.serve(listener, options, cancel))
    }

    /// Start the pool, listen on every configured port and run until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        self.start(&cancel).await?;
        let mut ports: Vec<_> = self.config.ports.iter().collect();
        ports.sort_by_key(|(port, _)| **port);
        for (port, endpoint) in ports {
            let listener = StratumServer::<Self>::bind(&endpoint.listen_address, *port)
                .map_err(|e| anyhow::anyhow!("[{}] cannot listen on port {}: {}", self.config.id, port, e))?;
            self.serve(listener, *port, cancel.clone());
        }
        cancel.cancelled().await;
        tracing::info!("[{}] Pool stopped", self.config.id);
        Ok(())
    }

    async fn fan_out(&self, mut jobs: broadcast::Receiver<NewJob>, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => job,
            };
            match job {
                Ok(job) => self.on_new_job(&job),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("[{}] ⚠️  Job fan-out lagged by {} jobs", self.config.id, n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<StratumConnection>> {
        self.connections.lock().values().cloned().collect()
    }

    fn on_new_job(&self, job: &NewJob) {
        let timeout = Duration::from_secs(self.config.client_connection_timeout);
        let now = Instant::now();
        let mut sent = 0usize;

        for conn in self.snapshot() {
            let difficulty = {
                let mut ctx = conn.context();
                if !(ctx.is_subscribed && ctx.is_authorized) {
                    continue;
                }
                if !timeout.is_zero() && ctx.is_idle(timeout, now) {
                    drop(ctx);
                    tracing::info!("[{}] [{}] Booting zombie-worker (idle-timeout exceeded)", self.config.id, conn.id());
                    conn.disconnect();
                    continue;
                }
                ctx.apply_pending_difficulty()
            };
            if let Some(d) = difficulty {
                conn.notify(&self.family().difficulty_notification(d));
            }
            if conn.notify(&StratumNotification::new(methods::NOTIFY, job.params.clone())) {
                sent += 1;
            }
        }
        tracing::debug!("[{}] 📢 Job {} sent to {} workers", self.config.id, job.job_id, sent);
    }

    fn send_initial_work(&self, conn: &StratumConnection) {
        let difficulty = conn.context().difficulty;
        conn.notify(&self.family().difficulty_notification(difficulty));
        if let Some(params) = self.manager.current_job_params(true) {
            conn.notify(&StratumNotification::new(methods::NOTIFY, params));
        }
    }

    fn on_subscribe(&self, conn: &StratumConnection, request: &StratumRequest) {
        let extra_nonce1 = conn
            .context()
            .extra_nonce1
            .clone()
            .unwrap_or_else(|| self.extra_nonce.next());

        match self.family().subscribe_result(request, conn.id(), &extra_nonce1) {
            Ok(result) => {
                conn.respond(request.id.clone(), result);
                let authorized = {
                    let mut ctx = conn.context();
                    ctx.is_subscribed = true;
                    ctx.extra_nonce1 = Some(extra_nonce1);
                    ctx.user_agent = request.param_str(0).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
                    ctx.is_authorized
                };
                if authorized {
                    self.send_initial_work(conn);
                }
            }
            Err(e) => {
                conn.respond_error(request.id.clone(), e);
            }
        }
    }

    async fn on_authorize(&self, conn: &StratumConnection, request: &StratumRequest) {
        if !request.has_id() {
            conn.respond_error(request.id.clone(), StratumError::other("missing request id"));
            return;
        }
        let worker_value = request.param_str(0).unwrap_or_default();
        let password = request.param_str(1).unwrap_or_default();
        let mut split = worker_value.splitn(2, '.');
        let miner = split.next().unwrap_or_default().trim().to_string();
        let worker = split.next().unwrap_or_default().trim().to_string();

        let authorized = !miner.is_empty() && self.family().validate_address(&miner).await;

        if !authorized {
            conn.respond_error(
                request.id.clone(),
                StratumError::new(StratumError::UNAUTHORIZED, "Authorization failed"),
            );
            if let Some(bans) = &self.ban_manager {
                tracing::info!("[{}] [{}] Banning unauthorized worker for 60 sec", self.config.id, conn.id());
                bans.ban(conn.remote_endpoint().ip(), AUTH_FAILURE_BAN);
            }
            conn.disconnect();
            return;
        }

        let (subscribed, static_diff) = {
            let mut ctx = conn.context();
            ctx.is_authorized = true;
            ctx.miner = Some(miner);
            ctx.worker = Some(worker);

            let static_diff = static_difficulty(password).filter(|d| match &ctx.vardiff {
                Some(v) => *d >= v.config().min_diff,
                None => *d > ctx.difficulty,
            });
            if let Some(d) = static_diff {
                ctx.set_static_difficulty(d);
            }
            (ctx.is_subscribed, static_diff)
        };

        conn.respond(request.id.clone(), json!(true));
        tracing::info!(
            "[{}] [{}] Authorized {} from {}",
            self.config.id,
            conn.id(),
            worker_value,
            conn.remote_endpoint().ip()
        );
        if let Some(d) = static_diff {
            tracing::info!("[{}] [{}] Static difficulty set to {}", self.config.id, conn.id(), d);
        }
        if subscribed {
            self.send_initial_work(conn);
        }
    }

    async fn on_submit(&self, conn: &StratumConnection, request: &StratumRequest, received: Instant) {
        if !request.has_id() {
            conn.respond_error(request.id.clone(), StratumError::new(StratumError::MINUS_ONE, "missing request id"));
            return;
        }
        if received.elapsed() > MAX_SHARE_AGE {
            tracing::debug!(
                "[{}] [{}] Dropping stale share submission request (not client's fault)",
                self.config.id,
                conn.id()
            );
            return;
        }

        let snapshot = {
            let mut ctx = conn.context();
            ctx.touch(Instant::now());
            if !ctx.is_authorized {
                Err(StratumError::unauthorized())
            } else if !ctx.is_subscribed {
                Err(StratumError::not_subscribed())
            } else {
                Ok(ctx.share_context())
            }
        };

        let result = match snapshot {
            Ok(share_ctx) => self
                .manager
                .submit_share(&share_ctx, request.params_array())
                .await
                .map_err(StratumError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(share) => {
                conn.respond(request.id.clone(), json!(true));
                metrics::inc_accepted(&self.config.id);
                tracing::debug!(
                    "[{}] [{}] Share accepted: D={:.3}",
                    self.config.id,
                    conn.id(),
                    share.difficulty / self.family().share_multiplier()
                );
                if share.is_block_candidate {
                    tracing::info!(
                        "[{}] 🎉 Block {} found by {} [{}]",
                        self.config.id,
                        share.block_height,
                        share.miner,
                        conn.id()
                    );
                    self.events.publish(PoolEvent::FoundBlock(FoundBlock {
                        pool_id: self.config.id.clone(),
                        height: share.block_height,
                        hash: share.block_hash.clone(),
                    }));
                }
                self.events.publish_share(share, conn.id(), conn.remote_endpoint());
                conn.context().record_share(true);
                self.update_vardiff(conn, VarDiffTrigger::AcceptedShare);
            }
            Err(e) => {
                tracing::debug!("[{}] [{}] Share rejected: {} ({})", self.config.id, conn.id(), e.message, e.code);
                metrics::inc_rejected(&self.config.id, e.code);
                conn.respond_error(request.id.clone(), e);
                conn.context().record_share(false);
                self.update_vardiff(conn, VarDiffTrigger::RejectedShare);
                self.consider_ban(conn);
            }
        }
    }

    fn consider_ban(&self, conn: &StratumConnection) {
        let Some(bans) = &self.ban_manager else {
            return;
        };
        if !self.banning.ban_on_invalid_shares {
            return;
        }
        let verdict = conn.context().consider_ban(&self.config.banning);
        if let BanVerdict::Ban { invalid_percent } = verdict {
            tracing::info!(
                "[{}] [{}] Banning worker for {} sec: {:.0}% of recent shares were invalid",
                self.config.id,
                conn.id(),
                self.config.banning.time,
                invalid_percent
            );
            bans.ban(conn.remote_endpoint().ip(), Duration::from_secs(self.config.banning.time));
            conn.disconnect();
        }
    }

    fn on_suggest_difficulty(&self, conn: &StratumConnection, request: &StratumRequest) {
        conn.respond(request.id.clone(), json!(true));
        let Some(requested) = param_f64(request.params_array().first()) else {
            tracing::debug!("[{}] [{}] Unusable suggested difficulty {:?}", self.config.id, conn.id(), request.params);
            return;
        };
        let port_difficulty = self.port_difficulty(conn.local_port());
        if requested > port_difficulty {
            conn.context().set_difficulty(requested);
            conn.notify(&self.family().difficulty_notification(requested));
            tracing::info!(
                "[{}] [{}] Difficulty set to {} as requested by miner",
                self.config.id,
                conn.id(),
                requested
            );
        }
    }

    fn on_suggest_target(&self, conn: &StratumConnection, request: &StratumRequest) {
        if !self.family().supports_suggest_target() {
            conn.respond_error(request.id.clone(), StratumError::unsupported(&request.method));
            return;
        }
        if !request.has_id() {
            conn.respond_error(request.id.clone(), StratumError::other("missing request id"));
            return;
        }
        let requested = request
            .param_str(0)
            .filter(|s| !s.is_empty())
            .and_then(|t| self.family().suggested_target_difficulty(t));
        let Some(requested) = requested else {
            conn.respond_error(request.id.clone(), StratumError::other("invalid target"));
            return;
        };
        if requested < self.port_difficulty(conn.local_port()) {
            conn.respond_error(request.id.clone(), StratumError::other("suggested difficulty too low"));
            return;
        }
        let applied = {
            let mut ctx = conn.context();
            ctx.enqueue_difficulty(requested);
            ctx.apply_pending_difficulty();
            ctx.difficulty
        };
        conn.respond(request.id.clone(), json!(true));
        conn.notify(&self.family().difficulty_notification(applied));
    }

    fn port_difficulty(&self, port: u16) -> f64 {
        self.config.ports.get(&port).map(|e| e.difficulty).unwrap_or(0.0)
    }

    fn update_vardiff(&self, conn: &StratumConnection, trigger: VarDiffTrigger) {
        let changed = {
            let mut ctx = conn.context();
            let current = ctx.difficulty;
            let Some(vardiff) = ctx.vardiff.as_mut() else {
                return;
            };
            let Some(next) = vardiff.update(current, trigger == VarDiffTrigger::Idle, Instant::now()) else {
                return;
            };
            metrics::inc_vardiff_retarget();
            tracing::debug!(
                "[{}] [{}] VarDiff update to {:.2}{}",
                self.config.id,
                conn.id(),
                next,
                if trigger == VarDiffTrigger::Idle { " [idle]" } else { "" }
            );
            ctx.enqueue_difficulty(next);
            match trigger {
                VarDiffTrigger::AcceptedShare => ctx.apply_pending_difficulty(),
                _ => None,
            }
        };

        if let Some(d) = changed {
            conn.notify(&self.family().difficulty_notification(d));
            if let Some(params) = self.manager.current_job_params(false) {
                conn.notify(&StratumNotification::new(methods::NOTIFY, params));
            }
        }
    }

    /// Retargets a connection that went quiet, once per `target_time` of silence.
    fn spawn_vardiff_idle_timer(self: &Arc<Self>, conn: &Arc<StratumConnection>) {
        let Some(target) = conn.context().vardiff.as_ref().map(|v| v.config().target_duration()) else {
            return;
        };
        let pool = Arc::clone(self);
        let conn = Arc::clone(conn);
        let closed = conn.close_token();
        tokio::spawn(async move {
            let mut last_tick = Instant::now();
            loop {
                let last_share = conn.context().last_activity;
                let deadline = last_share.max(last_tick) + target;
                tokio::select! {
                    _ = closed.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
                if conn.context().last_activity > last_share {
                    continue;
                }
                last_tick = Instant::now();
                pool.update_vardiff(&conn, VarDiffTrigger::Idle);
            }
        });
    }
}

impl<F: CoinFamily> PoolInfo for Pool<F> {
    fn status(&self) -> PoolStatus {
        let state = self.manager.state();
        PoolStatus {
            id: self.config.id.clone(),
            family: self.family().name(),
            state: format!("{:?}", state),
            online: state == JobManagerState::Online,
            connections: self.connection_count(),
            height: self.manager.current_job().map(|job| job.height()),
        }
    }
}

#[async_trait]
impl<F: CoinFamily> StratumHandler for Pool<F> {
    fn create_context(&self, port: u16, remote: SocketAddr) -> WorkerContext {
        match self.config.ports.get(&port) {
            Some(endpoint) => WorkerContext::new(remote.ip().to_string(), endpoint.difficulty, endpoint.var_diff),
            None => {
                tracing::warn!("[{}] ⚠️  No endpoint configuration for port {}", self.config.id, port);
                WorkerContext::new(remote.ip().to_string(), 1.0, None)
            }
        }
    }

    async fn on_connect(&self, connection: &Arc<StratumConnection>) {
        self.connections
            .lock()
            .insert(connection.id().to_string(), Arc::clone(connection));
        if let Some(pool) = self.this.upgrade() {
            pool.spawn_vardiff_idle_timer(connection);
        }
    }

    async fn on_request(&self, connection: &Arc<StratumConnection>, request: StratumRequest, received: Instant) {
        match request.method.as_str() {
            methods::SUBSCRIBE => self.on_subscribe(connection, &request),
            methods::AUTHORIZE => self.on_authorize(connection, &request).await,
            methods::SUBMIT => self.on_submit(connection, &request, received).await,
            methods::SUGGEST_DIFFICULTY => self.on_suggest_difficulty(connection, &request),
            methods::SUGGEST_TARGET => self.on_suggest_target(connection, &request),
            methods::EXTRANONCE_SUBSCRIBE => {}
            other => {
                tracing::debug!("[{}] [{}] Unsupported request {}", self.config.id, connection.id(), other);
                connection.respond_error(request.id.clone(), StratumError::unsupported(other));
            }
        }
    }

    async fn on_disconnect(&self, connection: &Arc<StratumConnection>) {
        self.connections.lock().remove(connection.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("x", None ; "no directive")]
    #[test_case("d=1024", Some(1024.0) ; "plain")]
    #[test_case("x;d=0.5", Some(0.5) ; "second part")]
    #[test_case("d=12.25;foo=bar", Some(12.25) ; "first part")]
    #[test_case("d=", None ; "empty value")]
    fn test_static_difficulty(password: &str, expected: Option<f64>) {
        assert_eq!(static_difficulty(password), expected);
    }

    #[test]
    fn test_param_f64() {
        assert_eq!(param_f64(Some(&json!(64))), Some(64.0));
        assert_eq!(param_f64(Some(&json!(" 0.5 "))), Some(0.5));
        assert_eq!(param_f64(Some(&json!(["x"]))), None);
        assert_eq!(param_f64(None), None);
    }
}
