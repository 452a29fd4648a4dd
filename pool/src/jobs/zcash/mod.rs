/// Shielded-UTXO coin family (Zcash and forks)
///
/// Shares carry an Equihash solution and a 32-byte nonce built from both
/// extranonces. Difficulty is pushed with `mining.set_target`.

pub mod job;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::{PubkeyHash, ScriptBuf};
use serde_json::{json, Value};
use std::sync::Arc;

use super::bitcoin::{daemon_validates, daemons_connected, daemons_healthy, submit_and_confirm, sync_status};
use crate::config::{PoolConfig, ZcashChainConfig};
use crate::crypto::equihash::SolutionVerifier;
use crate::crypto::target::{from_hex, ratio, target_from_difficulty, to_hex64, zcash_diff1};
use crate::crypto::{HashAlgorithm, Sha256D};
use crate::daemon::{DaemonCmd, DaemonError, DaemonRpc};
use crate::jobs::{CoinFamily, Share, ShareError, ShareOutcome, StartupError, SyncStatus, WorkerShareContext};
use crate::stratum::protocol::{methods, StratumError, StratumNotification, StratumRequest};

pub use job::{address_payload, BlockSubsidy, BlockTemplate, ZcashBlock, ZcashChain, ZcashJob, ZcashSubmission, ZcashTemplate};

#[derive(Debug, Clone)]
pub struct ZcashSettings {
    pub pool_id: String,
    pub pool_address: String,
    pub rewards: ZcashChainConfig,
}

impl ZcashSettings {
    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self {
            pool_id: cfg.id.clone(),
            pool_address: cfg.address.clone(),
            rewards: cfg.zcash.clone().unwrap_or_default(),
        }
    }
}

pub struct ZcashFamily {
    daemon: Arc<dyn DaemonRpc>,
    settings: ZcashSettings,
    verifier: Arc<dyn SolutionVerifier>,
    header_hasher: Arc<dyn HashAlgorithm>,
}

impl ZcashFamily {
    pub fn new(daemon: Arc<dyn DaemonRpc>, settings: ZcashSettings, verifier: Arc<dyn SolutionVerifier>) -> Self {
        Self {
            daemon,
            settings,
            verifier,
            header_hasher: Arc::new(Sha256D),
        }
    }

    fn template_params() -> Value {
        json!([{ "capabilities": ["coinbasetxn", "workid", "coinbase/append"] }])
    }
}

#[async_trait]
impl CoinFamily for ZcashFamily {
    type Job = ZcashJob;
    type Template = ZcashTemplate;
    type Chain = ZcashChain;
    type Submission = ZcashSubmission;
    type Block = ZcashBlock;

    fn name(&self) -> &'static str {
        "zcash"
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

    async fn post_start_init(&self) -> Result<ZcashChain, StartupError> {
        let address = self.settings.pool_address.clone();
        let replies = self
            .daemon
            .execute_batch_any(vec![
                DaemonCmd::new("getblockchaininfo", json!([])),
                DaemonCmd::new("validateaddress", json!([address])),
            ])
            .await
            .map_err(|e| StartupError::daemon("post-start batch", e))?;

        let mut replies = replies.into_iter();
        let network = match replies.next() {
            Some(Ok(info)) => info
                .get("chain")
                .and_then(Value::as_str)
                .ok_or_else(|| StartupError::UnsupportedDaemon("getblockchaininfo without chain".into()))?
                .to_string(),
            Some(Err(e)) => return Err(StartupError::daemon("getblockchaininfo", e)),
            None => return Err(StartupError::UnsupportedDaemon("empty batch reply".into())),
        };

        let daemon_ok = matches!(
            replies.next(),
            Some(Ok(ref v)) if v.get("isvalid").and_then(Value::as_bool) == Some(true)
        );
        // the coinbase pays a transparent P2PKH address
        let hash = address_payload(&address)
            .filter(|_| daemon_ok)
            .ok_or_else(|| StartupError::InvalidPoolAddress(address.clone()))?;

        tracing::info!("[{}] Network: {}", self.settings.pool_id, network);
        if self.settings.rewards.pays_founders_reward() {
            tracing::info!(
                "[{}] Founders reward {}% / treasury reward {}%",
                self.settings.pool_id,
                self.settings.rewards.founders_reward_percent,
                self.settings.rewards.treasury_reward_percent
            );
        }

        Ok(ZcashChain {
            network,
            pool_script: ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash)),
            rewards: self.settings.rewards.clone(),
            header_hasher: Arc::clone(&self.header_hasher),
            verifier: Arc::clone(&self.verifier),
        })
    }

    async fn fetch_template(&self, _chain: &ZcashChain) -> Result<ZcashTemplate, DaemonError> {
        let reply = self.daemon.execute_any("getblocktemplate", Self::template_params()).await?;
        let block: BlockTemplate = serde_json::from_value(reply).map_err(|e| DaemonError::Decode(e.to_string()))?;
        let subsidy = self.daemon.execute_any("getblocksubsidy", json!([block.height])).await?;
        let subsidy: BlockSubsidy = serde_json::from_value(subsidy).map_err(|e| DaemonError::Decode(e.to_string()))?;
        Ok(ZcashTemplate { block, subsidy })
    }

    fn template_key(&self, template: &ZcashTemplate) -> String {
        format!("{}:{}", template.block.previous_block_hash, template.block.height)
    }

    fn create_job(&self, chain: &ZcashChain, template: ZcashTemplate, job_id: String) -> anyhow::Result<ZcashJob> {
        ZcashJob::new(chain, template, job_id)
    }

    fn parse_submission(&self, params: &[Value]) -> Result<ZcashSubmission, ShareError> {
        ZcashSubmission::from_params(params)
    }

    fn submission_job_id<'a>(&self, submission: &'a ZcashSubmission) -> &'a str {
        &submission.job_id
    }

    async fn process_share(
        &self,
        _chain: &ZcashChain,
        job: &ZcashJob,
        ctx: &WorkerShareContext,
        submission: ZcashSubmission,
    ) -> Result<ShareOutcome<ZcashBlock>, ShareError> {
        job.process_share(ctx, &submission, chrono::Utc::now().timestamp()).await
    }

    async fn submit_block(&self, share: &mut Share, block: &ZcashBlock) -> bool {
        submit_and_confirm(self.daemon.as_ref(), &self.settings.pool_id, share, &block.hex, &block.hash, &block.coinbase_txid).await
    }

    async fn validate_address(&self, address: &str) -> bool {
        if address.trim().is_empty() {
            return false;
        }
        address_payload(address).is_some()
            || daemon_validates(self.daemon.as_ref(), "validateaddress", address).await
            || daemon_validates(self.daemon.as_ref(), "z_validateaddress", address).await
    }

    fn extranonce1_size(&self) -> usize {
        4
    }

    fn subscribe_result(&self, request: &StratumRequest, connection_id: &str, extra_nonce1: &str) -> Result<Value, StratumError> {
        if !request.has_id() {
            return Err(StratumError::other("missing request id"));
        }
        Ok(json!([connection_id, extra_nonce1]))
    }

    fn difficulty_notification(&self, difficulty: f64) -> StratumNotification {
        StratumNotification::new(methods::SET_TARGET, json!([encode_target(difficulty)]))
    }

    fn supports_suggest_target(&self) -> bool {
        true
    }

    fn suggested_target_difficulty(&self, target_hex: &str) -> Option<f64> {
        let target = from_hex(target_hex)?;
        let difficulty = ratio(&zcash_diff1(), &target);
        difficulty.is_finite().then_some(difficulty)
    }
}

/// `mining.set_target` payload for a stratum difficulty.
pub fn encode_target(difficulty: f64) -> String {
    to_hex64(&target_from_difficulty(&zcash_diff1(), difficulty))
}
