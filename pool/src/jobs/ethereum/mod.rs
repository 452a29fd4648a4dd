/// Account-model coin family (Ethereum / Ethash on Parity)
///
/// Work comes from `eth_getWork` alongside the pending block. A job is only
/// built when the header hash changes.

pub mod job;

use async_trait::async_trait;
use num_bigint::BigUint;
use num_traits::ToPrimitive;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::PoolConfig;
use crate::crypto::ethash::{self, EthashManager};
use crate::daemon::{DaemonCmd, DaemonError, DaemonResult, DaemonRpc};
use crate::jobs::{CoinFamily, Share, ShareError, ShareOutcome, StartupError, SyncStatus, WorkerShareContext};
use crate::stratum::protocol::{methods, StratumError, StratumNotification, StratumRequest};

pub use job::{EthereumBlock, EthereumJob, EthereumSubmission, EthereumTemplate, POW_2_32};

const STRATUM_VERSION: &str = "EthereumStratum/1.0.0";

#[derive(Debug, Clone)]
pub struct EthereumSettings {
    pub pool_id: String,
    pub pool_address: String,
}

impl EthereumSettings {
    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self {
            pool_id: cfg.id.clone(),
            pool_address: cfg.address.clone(),
        }
    }
}

/// Facts learned from the node during startup.
pub struct EthereumChain {
    pub network_id: String,
    pub chain_type: String,
    pub client_version: Option<String>,
    pub ethash: Arc<EthashManager>,
}

pub struct EthereumFamily {
    daemon: Arc<dyn DaemonRpc>,
    settings: EthereumSettings,
    ethash: Arc<EthashManager>,
}

impl EthereumFamily {
    pub fn new(daemon: Arc<dyn DaemonRpc>, settings: EthereumSettings) -> Self {
        Self::with_ethash(daemon, settings, Arc::new(EthashManager::new()))
    }

    pub fn with_ethash(daemon: Arc<dyn DaemonRpc>, settings: EthereumSettings, ethash: Arc<EthashManager>) -> Self {
        Self {
            daemon,
            settings,
            ethash,
        }
    }
}

fn address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("address regex"))
}

pub fn is_valid_address(address: &str) -> bool {
    address_regex().is_match(address) && address[2..].chars().any(|c| c != '0')
}

fn parse_hex_u64(value: &Value) -> Option<u64> {
    u64::from_str_radix(value.as_str()?.trim_start_matches("0x"), 16).ok()
}

fn parse_hex_f64(value: &Value) -> Option<f64> {
    BigUint::parse_bytes(value.as_str()?.trim_start_matches("0x").as_bytes(), 16)?.to_f64()
}

fn decode_error(message: impl Into<String>) -> DaemonError {
    DaemonError::Decode(message.into())
}

/// Combine the pending block and `eth_getWork` reply into a template.
fn build_template(block: DaemonResult, work: DaemonResult) -> Result<EthereumTemplate, DaemonError> {
    let block = block?;
    let work = work?;
    let work: Vec<&str> = work
        .as_array()
        .map(|w| w.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if work.len() < 4 {
        return Err(decode_error("eth_getWork returned fewer than 4 entries"));
    }

    let height = block
        .get("number")
        .and_then(parse_hex_u64)
        .ok_or_else(|| decode_error("pending block without number"))?;
    let work_height = parse_hex_u64(&json!(work[3])).ok_or_else(|| decode_error("invalid work height"))?;
    if work_height != height {
        return Err(decode_error(format!("work height {} does not match pending block {}", work_height, height)));
    }

    Ok(EthereumTemplate {
        header: work[0].to_string(),
        seed: work[1].to_string(),
        target: work[2].to_string(),
        difficulty: block.get("difficulty").and_then(parse_hex_f64).unwrap_or(0.0),
        height,
        parent_hash: block
            .get("parentHash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

/// Progress of a syncing Parity node, from warp chunks or block numbers.
fn sync_percent(state: &Value) -> Option<f64> {
    let pair = |a: &str, b: &str| -> Option<f64> {
        let done = state.get(a).and_then(parse_hex_u64)? as f64;
        let total = state.get(b).and_then(parse_hex_u64)? as f64;
        (total > 0.0).then(|| done / total * 100.0)
    };
    pair("warpChunksProcessed", "warpChunksAmount").or_else(|| pair("currentBlock", "highestBlock"))
}

#[async_trait]
impl CoinFamily for EthereumFamily {
    type Job = EthereumJob;
    type Template = EthereumTemplate;
    type Chain = EthereumChain;
    type Submission = EthereumSubmission;
    type Block = EthereumBlock;

    fn name(&self) -> &'static str {
        "ethereum"
    }

    fn daemon(&self) -> &Arc<dyn DaemonRpc> {
        &self.daemon
    }

    async fn are_daemons_healthy(&self) -> bool {
        let replies = self.daemon.execute_all("eth_getBlockByNumber", json!(["latest", false])).await;
        !replies.is_empty() && replies.iter().all(|r| matches!(r, Ok(v) if !v.is_null()))
    }

    async fn are_daemons_connected(&self) -> bool {
        matches!(
            self.daemon.execute_any("net_peerCount", json!([])).await,
            Ok(ref v) if parse_hex_u64(v).unwrap_or(0) > 0
        )
    }

    async fn sync_status(&self) -> SyncStatus {
        let replies = self.daemon.execute_all("eth_syncing", json!([])).await;
        if replies.is_empty() {
            return SyncStatus::Syncing { percent: None };
        }
        if replies.iter().all(|r| matches!(r, Ok(Value::Bool(false)))) {
            return SyncStatus::Synced;
        }
        let percent = replies
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .filter(|v| v.is_object())
            .find_map(sync_percent);
        SyncStatus::Syncing { percent }
    }

    fn sync_poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn post_start_init(&self) -> Result<EthereumChain, StartupError> {
        let replies = self
            .daemon
            .execute_batch_any(vec![
                DaemonCmd::new("net_version", json!([])),
                DaemonCmd::new("eth_accounts", json!([])),
                DaemonCmd::new("eth_coinbase", json!([])),
                DaemonCmd::new("parity_versionInfo", json!([])),
                DaemonCmd::new("parity_chain", json!([])),
            ])
            .await
            .map_err(|e| StartupError::daemon("post-start batch", e))?;
        let [net_version, _accounts, _coinbase, version_info, chain]: [DaemonResult; 5] = replies
            .try_into()
            .map_err(|_| StartupError::UnsupportedDaemon("incomplete batch reply".into()))?;

        let chain_type = match chain {
            Ok(v) => v.as_str().unwrap_or_default().to_string(),
            Err(_) => return Err(StartupError::UnsupportedDaemon("not running Parity".into())),
        };
        let network_id = match net_version.map_err(|e| StartupError::daemon("net_version", e))? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let client_version = version_info.ok().and_then(|v| {
            let version = v.get("version")?;
            Some(format!(
                "{}.{}.{}",
                version.get("major")?.as_u64()?,
                version.get("minor")?.as_u64()?,
                version.get("patch")?.as_u64()?
            ))
        });

        if !is_valid_address(&self.settings.pool_address) {
            return Err(StartupError::InvalidPoolAddress(self.settings.pool_address.clone()));
        }

        tracing::info!(
            "[{}] Network: {} (id {}){}",
            self.settings.pool_id,
            chain_type,
            network_id,
            client_version.as_deref().map(|v| format!(", Parity {}", v)).unwrap_or_default()
        );

        Ok(EthereumChain {
            network_id,
            chain_type,
            client_version,
            ethash: Arc::clone(&self.ethash),
        })
    }

    async fn fetch_template(&self, _chain: &EthereumChain) -> Result<EthereumTemplate, DaemonError> {
        let replies = self
            .daemon
            .execute_batch_any(vec![
                DaemonCmd::new("eth_getBlockByNumber", json!(["pending", true])),
                DaemonCmd::new("eth_getWork", json!([])),
            ])
            .await?;
        let mut replies = replies.into_iter();
        match (replies.next(), replies.next()) {
            (Some(block), Some(work)) => build_template(block, work),
            _ => Err(decode_error("incomplete batch reply")),
        }
    }

    fn template_key(&self, template: &EthereumTemplate) -> String {
        template.header.clone()
    }

    fn create_job(&self, chain: &EthereumChain, template: EthereumTemplate, job_id: String) -> anyhow::Result<EthereumJob> {
        let job = EthereumJob::new(template, job_id)?;
        // Build the verification cache ahead of the first share.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let manager = Arc::clone(&chain.ethash);
            let epoch = ethash::epoch(job.template().height);
            let pool_id = self.settings.pool_id.clone();
            handle.spawn(async move {
                if let Err(e) = manager.cache(epoch).await {
                    tracing::error!("[{}] Ethash cache for epoch {} failed: {}", pool_id, epoch, e);
                }
            });
        }
        Ok(job)
    }

    fn parse_submission(&self, params: &[Value]) -> Result<EthereumSubmission, ShareError> {
        EthereumSubmission::from_params(params)
    }

    fn submission_job_id<'a>(&self, submission: &'a EthereumSubmission) -> &'a str {
        &submission.job_id
    }

    async fn process_share(
        &self,
        chain: &EthereumChain,
        job: &EthereumJob,
        ctx: &WorkerShareContext,
        submission: EthereumSubmission,
    ) -> Result<ShareOutcome<EthereumBlock>, ShareError> {
        job.process_share(ctx, &submission, &chain.ethash).await
    }

    async fn submit_block(&self, share: &mut Share, block: &EthereumBlock) -> bool {
        let params = json!([block.nonce, block.header_hash, block.mix_hash]);
        match self.daemon.execute_any("eth_submitWork", params).await {
            Ok(Value::Bool(true)) => true,
            Ok(other) => {
                tracing::warn!(
                    "[{}] ⚠️  Block {} submission rejected: {}",
                    self.settings.pool_id,
                    share.block_height,
                    other
                );
                false
            }
            Err(e) => {
                tracing::warn!("[{}] ⚠️  Block {} submission failed: {}", self.settings.pool_id, share.block_height, e);
                false
            }
        }
    }

    async fn validate_address(&self, address: &str) -> bool {
        is_valid_address(address)
    }

    fn extranonce1_size(&self) -> usize {
        2
    }

    fn subscribe_result(&self, request: &StratumRequest, connection_id: &str, extra_nonce1: &str) -> Result<Value, StratumError> {
        let params = request.params_array();
        let non_empty = params.iter().filter(|p| p.as_str().is_some_and(|s| !s.is_empty())).count();
        if params.len() < 2 || non_empty < 2 {
            return Err(StratumError::new(StratumError::MINUS_ONE, "invalid request"));
        }
        Ok(json!([[methods::NOTIFY, connection_id, STRATUM_VERSION], extra_nonce1]))
    }

    fn difficulty_notification(&self, difficulty: f64) -> StratumNotification {
        StratumNotification::new(methods::SET_DIFFICULTY, json!([difficulty]))
    }

    fn share_multiplier(&self) -> f64 {
        POW_2_32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::target::to_hex64;
    use crate::daemon::MockDaemon;
    use crate::jobs::MiningJob;

    const POOL_ADDRESS: &str = "0x52bc44d5378309ee2abf1539bf71de1b7d7be3b5";

    fn family(daemon: Arc<MockDaemon>, address: &str) -> EthereumFamily {
        EthereumFamily::with_ethash(
            daemon,
            EthereumSettings {
                pool_id: "eth".into(),
                pool_address: address.into(),
            },
            Arc::new(job::tests::ethash()),
        )
    }

    fn parity() -> Arc<MockDaemon> {
        let daemon = Arc::new(MockDaemon::new());
        daemon.respond("net_version", json!("1"));
        daemon.respond("eth_accounts", json!([]));
        daemon.respond("eth_coinbase", json!(POOL_ADDRESS));
        daemon.respond("parity_versionInfo", json!({"version": {"major": 2, "minor": 7, "patch": 2}}));
        daemon.respond("parity_chain", json!("foundation"));
        daemon
    }

    fn work_daemon(work_height: &str) -> Arc<MockDaemon> {
        let daemon = parity();
        daemon.respond(
            "eth_getBlockByNumber",
            json!({"number": "0x4d2", "difficulty": "0x1e8480", "parentHash": "0xab"}),
        );
        let target = format!("0x{}", to_hex64(&BigUint::from(1u8)));
        daemon.respond(
            "eth_getWork",
            json!([job::tests::HEADER, format!("0x{}", hex::encode(ethash::seed_hash(0))), target, work_height]),
        );
        daemon
    }

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(POOL_ADDRESS));
        assert!(!is_valid_address("0x0000000000000000000000000000000000000000"));
        assert!(!is_valid_address("52bc44d5378309ee2abf1539bf71de1b7d7be3b5"));
        assert!(!is_valid_address("0x52bc44d5378309ee2abf1539bf71de1b7d7be3"));
    }

    #[tokio::test]
    async fn test_post_start_init() {
        let chain = family(parity(), POOL_ADDRESS).post_start_init().await.unwrap();
        assert_eq!(chain.network_id, "1");
        assert_eq!(chain.chain_type, "foundation");
        assert_eq!(chain.client_version.as_deref(), Some("2.7.2"));
    }

    #[tokio::test]
    async fn test_requires_parity() {
        let daemon = Arc::new(MockDaemon::new());
        daemon.respond("net_version", json!("1"));
        let err = family(daemon, POOL_ADDRESS).post_start_init().await.err().unwrap();
        assert!(matches!(err, StartupError::UnsupportedDaemon(_)));
    }

    #[tokio::test]
    async fn test_invalid_pool_address_is_fatal() {
        let err = family(parity(), "0xnope").post_start_init().await.err().unwrap();
        assert!(matches!(err, StartupError::InvalidPoolAddress(_)));
    }

    #[tokio::test]
    async fn test_fetch_template() {
        let f = family(work_daemon("0x4d2"), POOL_ADDRESS);
        let chain = f.post_start_init().await.unwrap();
        let template = f.fetch_template(&chain).await.unwrap();
        assert_eq!(template.height, 1234);
        assert_eq!(template.difficulty, 2_000_000.0);
        assert_eq!(f.template_key(&template), job::tests::HEADER);

        let built = f.create_job(&chain, template, "0000000a".into()).unwrap();
        assert_eq!(built.job_params(true)[3], true);
    }

    #[tokio::test]
    async fn test_work_height_mismatch_is_rejected() {
        let f = family(work_daemon("0x4d1"), POOL_ADDRESS);
        let chain = f.post_start_init().await.unwrap();
        assert!(matches!(f.fetch_template(&chain).await, Err(DaemonError::Decode(_))));
    }

    #[tokio::test]
    async fn test_sync_status() {
        let daemon = parity();
        daemon.respond("eth_syncing", json!(false));
        let f = family(daemon.clone(), POOL_ADDRESS);
        assert_eq!(f.sync_status().await, SyncStatus::Synced);

        daemon.respond("eth_syncing", json!({"currentBlock": "0x32", "highestBlock": "0x64"}));
        assert_eq!(f.sync_status().await, SyncStatus::Syncing { percent: Some(50.0) });
    }

    #[tokio::test]
    async fn test_submit_work() {
        let daemon = parity();
        daemon.respond("eth_submitWork", json!(true));
        let f = family(daemon.clone(), POOL_ADDRESS);
        let block = EthereumBlock {
            nonce: "0x00ff000000000001".into(),
            header_hash: job::tests::HEADER.into(),
            mix_hash: "0x01".into(),
        };
        let mut share = Share::new(&WorkerShareContext::default(), 1234, 1.0, 1.0);
        assert!(f.submit_block(&mut share, &block).await);

        daemon.respond("eth_submitWork", json!(false));
        assert!(!f.submit_block(&mut share, &block).await);
    }

    #[test]
    fn test_subscribe_dialect() {
        let f = family(parity(), POOL_ADDRESS);
        let req: StratumRequest =
            serde_json::from_str(r#"{"id":1,"method":"mining.subscribe","params":["ethminer/0.19","EthereumStratum/1.0.0"]}"#).unwrap();
        let result = f.subscribe_result(&req, "c7", "00ff").unwrap();
        assert_eq!(result, json!([["mining.notify", "c7", "EthereumStratum/1.0.0"], "00ff"]));

        let short: StratumRequest = serde_json::from_str(r#"{"id":2,"method":"mining.subscribe","params":["ethminer"]}"#).unwrap();
        assert_eq!(f.subscribe_result(&short, "c7", "00ff").unwrap_err().code, StratumError::MINUS_ONE);
        assert_eq!(f.share_multiplier(), POW_2_32);
    }
}
