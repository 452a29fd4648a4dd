/// UTXO-model coin family (Bitcoin and derivatives)
///
/// Templates come from `getblocktemplate` polling; a job is rebuilt when the
/// previous block hash or height changes. Proof-of-Stake forks are detected
/// from the shape of the `getdifficulty` reply.

pub mod job;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{Address, PubkeyHash, ScriptBuf};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{HashAlgorithmKind, PoolConfig};
use crate::crypto::{HashAlgorithm, Scrypt, Sha256D};
use crate::daemon::{DaemonCmd, DaemonError, DaemonRpc};
use crate::jobs::{CoinFamily, Share, ShareError, ShareOutcome, StartupError, SyncStatus, WorkerShareContext};
use crate::stratum::protocol::{methods, StratumError, StratumNotification, StratumRequest};

pub use job::{BitcoinBlock, BitcoinChain, BitcoinJob, BitcoinSubmission, BlockTemplate};

/// Coinbase tags longer than this are cut to keep the scriptSig under 100 bytes.
const MAX_COINBASE_TAG: usize = 40;

/// Daemon error code for "still downloading blocks".
const RPC_IN_WARMUP_OR_SYNCING: i64 = -10;

#[derive(Debug, Clone)]
pub struct BitcoinSettings {
    pub pool_id: String,
    pub pool_address: String,
    pub coinbase_tag: String,
    pub block_reward_multiplier: f64,
}

impl BitcoinSettings {
    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self {
            pool_id: cfg.id.clone(),
            pool_address: cfg.address.clone(),
            coinbase_tag: cfg.coinbase_tag.clone(),
            block_reward_multiplier: cfg.block_reward_multiplier,
        }
    }
}

/// Header hasher for a configured algorithm.
pub fn header_hasher(kind: HashAlgorithmKind) -> anyhow::Result<Arc<dyn HashAlgorithm>> {
    Ok(match kind {
        HashAlgorithmKind::Sha256d => Arc::new(Sha256D),
        HashAlgorithmKind::Scrypt => Arc::new(Scrypt::litecoin()?),
    })
}

pub struct BitcoinFamily {
    daemon: Arc<dyn DaemonRpc>,
    settings: BitcoinSettings,
    header_hasher: Arc<dyn HashAlgorithm>,
}

impl BitcoinFamily {
    pub fn new(daemon: Arc<dyn DaemonRpc>, settings: BitcoinSettings) -> Self {
        Self::with_hasher(daemon, settings, Arc::new(Sha256D))
    }

    /// Use a different proof-of-work function for block headers.
    pub fn with_hasher(daemon: Arc<dyn DaemonRpc>, settings: BitcoinSettings, header_hasher: Arc<dyn HashAlgorithm>) -> Self {
        Self {
            daemon,
            settings,
            header_hasher,
        }
    }

    fn template_params() -> Value {
        json!([{
            "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
            "rules": ["segwit"],
        }])
    }
}

/// Output script for `address` when it can be decoded without the daemon.
pub fn local_script(address: &str) -> Option<ScriptBuf> {
    if let Ok(parsed) = Address::from_str(address) {
        return Some(parsed.assume_checked().script_pubkey());
    }
    // altcoin P2PKH with a foreign version byte
    let payload = bitcoin::base58::decode_check(address).ok()?;
    if payload.len() != 21 {
        return None;
    }
    let hash: [u8; 20] = payload[1..].try_into().ok()?;
    Some(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)))
}

/// Every daemon answers `getblockchaininfo`.
pub(crate) async fn daemons_healthy(daemon: &dyn DaemonRpc) -> bool {
    let replies = daemon.execute_all("getblockchaininfo", json!([])).await;
    !replies.is_empty() && replies.iter().all(Result::is_ok)
}

pub(crate) async fn daemons_connected(daemon: &dyn DaemonRpc) -> bool {
    matches!(
        daemon.execute_any("getconnectioncount", json!([])).await,
        Ok(v) if v.as_u64().unwrap_or(0) > 0
    )
}

/// Synced once every daemon hands out templates. While a daemon reports it
/// is still downloading, progress comes from `verificationprogress`.
pub(crate) async fn sync_status(daemon: &dyn DaemonRpc, template_params: Value) -> SyncStatus {
    let replies = daemon.execute_all("getblocktemplate", template_params).await;
    if !replies.is_empty() && replies.iter().all(Result::is_ok) {
        return SyncStatus::Synced;
    }
    let syncing = replies
        .iter()
        .any(|r| matches!(r, Err(DaemonError::Rpc { code, .. }) if *code == RPC_IN_WARMUP_OR_SYNCING));
    if !syncing {
        return SyncStatus::Syncing { percent: None };
    }
    let percent = daemon
        .execute_any("getblockchaininfo", json!([]))
        .await
        .ok()
        .and_then(|info| info.get("verificationprogress").and_then(Value::as_f64))
        .map(|p| p * 100.0);
    SyncStatus::Syncing { percent }
}

/// Daemon-side address check through `method` (`validateaddress` or `z_validateaddress`).
pub(crate) async fn daemon_validates(daemon: &dyn DaemonRpc, method: &str, address: &str) -> bool {
    matches!(
        daemon.execute_any(method, json!([address])).await,
        Ok(v) if v.get("isvalid").and_then(Value::as_bool) == Some(true)
    )
}

/// `submitblock`, then `getblock` to make sure the daemon kept it. Fills the
/// share's confirmation data with the coinbase txid.
pub(crate) async fn submit_and_confirm(
    daemon: &dyn DaemonRpc,
    pool_id: &str,
    share: &mut Share,
    block_hex: &str,
    block_hash: &str,
    coinbase_txid: &str,
) -> bool {
    match daemon.execute_any("submitblock", json!([block_hex])).await {
        Ok(Value::Null) => {}
        Ok(reason) => {
            tracing::warn!("[{}] ⚠️  Block {} submission rejected: {}", pool_id, share.block_height, reason);
            return false;
        }
        Err(e) => {
            tracing::warn!("[{}] ⚠️  Block {} submission failed: {}", pool_id, share.block_height, e);
            return false;
        }
    }

    match daemon.execute_any("getblock", json!([block_hash])).await {
        Ok(info) if info.get("hash").and_then(Value::as_str) == Some(block_hash) => {
            let txid = info
                .get("tx")
                .and_then(|t| t.get(0))
                .and_then(Value::as_str)
                .unwrap_or(coinbase_txid);
            share.transaction_confirmation_data = Some(txid.to_string());
            true
        }
        Ok(_) => {
            tracing::warn!("[{}] ⚠️  Block {} not found after submission", pool_id, block_hash);
            false
        }
        Err(e) => {
            tracing::warn!("[{}] ⚠️  getblock {} failed: {}", pool_id, block_hash, e);
            false
        }
    }
}

#[async_trait]
impl CoinFamily for BitcoinFamily {
    type Job = BitcoinJob;
    type Template = BlockTemplate;
    type Chain = BitcoinChain;
    type Submission = BitcoinSubmission;
    type Block = BitcoinBlock;

    fn name(&self) -> &'static str {
        "bitcoin"
    }

    fn daemon(&self) -> &Arc<dyn DaemonRpc> {
        &self.daemon
    }

    async fn are_daemons_healthy(&self) -> bool {
        daemons_healthy(self.daemon.as_ref()).await
    }

    async fn are_daemons_connected(&self) -> bool {
        daemons_connected(self.daemon.as_ref()).await
    }

    async fn sync_status(&self) -> SyncStatus {
        sync_status(self.daemon.as_ref(), Self::template_params()).await
    }

    async fn post_start_init(&self) -> Result<BitcoinChain, StartupError> {
        let address = self.settings.pool_address.clone();
        let replies = self
            .daemon
            .execute_batch_any(vec![
                DaemonCmd::new("getblockchaininfo", json!([])),
                DaemonCmd::new("getdifficulty", json!([])),
                DaemonCmd::new("validateaddress", json!([address])),
            ])
            .await
            .map_err(|e| StartupError::daemon("post-start batch", e))?;

        let mut replies = replies.into_iter();
        let info = match replies.next() {
            Some(Ok(info)) => info,
            Some(Err(e)) => return Err(StartupError::daemon("getblockchaininfo", e)),
            None => return Err(StartupError::UnsupportedDaemon("empty batch reply".into())),
        };
        let network = info
            .get("chain")
            .and_then(Value::as_str)
            .ok_or_else(|| StartupError::UnsupportedDaemon("getblockchaininfo without chain".into()))?
            .to_string();

        let is_pos = matches!(
            replies.next(),
            Some(Ok(Value::Object(ref o))) if o.contains_key("proof-of-stake")
        );

        let validated = match replies.next() {
            Some(Ok(v)) if v.get("isvalid").and_then(Value::as_bool) == Some(true) => Some(v),
            _ => None,
        };
        let pool_script = local_script(&address)
            .or_else(|| {
                validated
                    .as_ref()
                    .and_then(|v| v.get("scriptPubKey").and_then(Value::as_str))
                    .and_then(|s| hex::decode(s).ok())
                    .map(ScriptBuf::from_bytes)
            })
            .ok_or_else(|| StartupError::InvalidPoolAddress(address.clone()))?;

        let mut coinbase_tag = self.settings.coinbase_tag.as_bytes().to_vec();
        coinbase_tag.truncate(MAX_COINBASE_TAG);

        tracing::info!(
            "[{}] Network: {}{}",
            self.settings.pool_id,
            network,
            if is_pos { " (proof-of-stake)" } else { "" }
        );

        Ok(BitcoinChain {
            network,
            pool_script,
            is_pos,
            coinbase_tag,
            header_hasher: Arc::clone(&self.header_hasher),
            block_reward_multiplier: self.settings.block_reward_multiplier,
        })
    }

    async fn fetch_template(&self, _chain: &BitcoinChain) -> Result<BlockTemplate, DaemonError> {
        let reply = self.daemon.execute_any("getblocktemplate", Self::template_params()).await?;
        serde_json::from_value(reply).map_err(|e| DaemonError::Decode(e.to_string()))
    }

    fn template_key(&self, template: &BlockTemplate) -> String {
        format!("{}:{}", template.previous_block_hash, template.height)
    }

    fn create_job(&self, chain: &BitcoinChain, template: BlockTemplate, job_id: String) -> anyhow::Result<BitcoinJob> {
        BitcoinJob::new(chain, template, job_id, chrono::Utc::now().timestamp())
    }

    fn parse_submission(&self, params: &[Value]) -> Result<BitcoinSubmission, ShareError> {
        BitcoinSubmission::from_params(params)
    }

    fn submission_job_id<'a>(&self, submission: &'a BitcoinSubmission) -> &'a str {
        &submission.job_id
    }

    async fn process_share(
        &self,
        _chain: &BitcoinChain,
        job: &BitcoinJob,
        ctx: &WorkerShareContext,
        submission: BitcoinSubmission,
    ) -> Result<ShareOutcome<BitcoinBlock>, ShareError> {
        job.process_share(ctx, &submission, chrono::Utc::now().timestamp())
    }

    async fn submit_block(&self, share: &mut Share, block: &BitcoinBlock) -> bool {
        submit_and_confirm(self.daemon.as_ref(), &self.settings.pool_id, share, &block.hex, &block.hash, &block.coinbase_txid).await
    }

    async fn validate_address(&self, address: &str) -> bool {
        if address.trim().is_empty() {
            return false;
        }
        local_script(address).is_some() || daemon_validates(self.daemon.as_ref(), "validateaddress", address).await
    }

    fn extranonce1_size(&self) -> usize {
        4
    }

    fn subscribe_result(&self, request: &StratumRequest, connection_id: &str, extra_nonce1: &str) -> Result<Value, StratumError> {
        if !request.has_id() {
            return Err(StratumError::other("missing request id"));
        }
        Ok(json!([
            [[methods::SET_DIFFICULTY, connection_id], [methods::NOTIFY, connection_id]],
            extra_nonce1,
            job::EXTRANONCE2_SIZE,
        ]))
    }

    fn difficulty_notification(&self, difficulty: f64) -> StratumNotification {
        StratumNotification::new(methods::SET_DIFFICULTY, json!([difficulty]))
    }
}
