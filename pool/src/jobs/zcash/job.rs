/// Shielded-UTXO job (Zcash and forks)
///
/// The coinbase is complete on the server: miners vary the 32-byte header
/// nonce (extranonce1 + extranonce2) instead of the coinbase, so the merkle
/// root is fixed per job. Founders and treasury outputs follow a height-keyed
/// address rotation.

use bitcoin::hashes::Hash;
use bitcoin::{Amount, ScriptBuf, ScriptHash, TxOut};
use num_bigint::BigUint;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::ZcashChainConfig;
use crate::crypto::equihash::{SolutionVerifier, HEADER_LENGTH};
use crate::crypto::serialization::{compact_size, parse_hex_u32, reverse_hex, script_number};
use crate::crypto::target::{from_hex, hash_value_le, ratio, target_from_bits, zcash_diff1};
use crate::crypto::{sha256d, HashAlgorithm, MerkleTree};
use crate::jobs::{MiningJob, Share, ShareError, ShareOutcome, SubmissionSet, WorkerShareContext, MAX_NTIME_DRIFT};

/// Hex length of a (200,9) solution including its 3-byte CompactSize prefix.
pub const SOLUTION_HEX_LENGTH: usize = 2694;
const SOLUTION_PREFIX_LENGTH: usize = 3;
const NONCE_HEX_LENGTH: usize = 64;

const SATOSHIS_PER_COIN: f64 = 100_000_000.0;

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    pub hash: String,
    #[serde(default)]
    pub fee: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(rename = "curtime")]
    pub cur_time: u32,
    pub bits: String,
    pub height: u64,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default, rename = "finalsaplingroothash")]
    pub final_sapling_root_hash: Option<String>,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
}

/// `getblocksubsidy` result, in coins.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockSubsidy {
    pub miner: f64,
    #[serde(default)]
    pub founders: Option<f64>,
    #[serde(default)]
    pub community: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ZcashTemplate {
    pub block: BlockTemplate,
    pub subsidy: BlockSubsidy,
}

#[derive(Clone)]
pub struct ZcashChain {
    pub network: String,
    pub pool_script: ScriptBuf,
    pub rewards: ZcashChainConfig,
    pub header_hasher: Arc<dyn HashAlgorithm>,
    pub verifier: Arc<dyn SolutionVerifier>,
}

#[derive(Debug, Clone)]
pub struct ZcashSubmission {
    pub job_id: String,
    pub ntime: String,
    pub extra_nonce2: String,
    pub solution: String,
}

impl ZcashSubmission {
    /// `[worker, jobId, nTime, extraNonce2, solution]`
    pub fn from_params(params: &[Value]) -> Result<Self, ShareError> {
        let field = |i: usize| params.get(i).and_then(Value::as_str).unwrap_or_default().to_string();
        if field(0).is_empty() {
            return Err(ShareError::other("missing or invalid workername"));
        }
        let solution = field(4);
        if solution.is_empty() {
            return Err(ShareError::other("missing or invalid solution"));
        }
        Ok(Self {
            job_id: field(1),
            ntime: field(2),
            extra_nonce2: field(3),
            solution,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ZcashBlock {
    pub hex: String,
    pub hash: String,
    pub coinbase_txid: String,
}

pub struct ZcashJob {
    id: String,
    template: BlockTemplate,
    header_hasher: Arc<dyn HashAlgorithm>,
    verifier: Arc<dyn SolutionVerifier>,
    coinbase: Vec<u8>,
    coinbase_txid: String,
    merkle_root: [u8; 32],
    previous_hash: Vec<u8>,
    sapling_root: [u8; 32],
    bits: u32,
    block_target: BigUint,
    network_difficulty: f64,
    reward_to_pool: Amount,
    transaction_data: Vec<u8>,
    submissions: SubmissionSet,
    params: Vec<Value>,
}

/// Address at `index` of a rotation list, clamped to the last entry.
fn rotation_address(addresses: &[String], index: u64) -> Option<&str> {
    let last = addresses.len().checked_sub(1)?;
    addresses.get((index as usize).min(last)).map(String::as_str)
}

/// Founders address for `height`: the list is spread evenly over the
/// founders period.
pub fn founders_address(cfg: &ZcashChainConfig, height: u64) -> Option<&str> {
    let len = cfg.founders_reward_addresses.len() as u64;
    if len == 0 {
        return None;
    }
    let interval = (cfg.last_founders_reward_height() + len) / len;
    rotation_address(&cfg.founders_reward_addresses, height / interval.max(1))
}

/// Treasury address for `height`: rotates every change interval from the start height.
pub fn treasury_address(cfg: &ZcashChainConfig, height: u64) -> Option<&str> {
    let len = cfg.treasury_reward_addresses.len() as u64;
    if len == 0 {
        return None;
    }
    let step = height.saturating_sub(cfg.treasury_reward_start_block_height)
        / cfg.treasury_reward_address_change_interval.max(1);
    rotation_address(&cfg.treasury_reward_addresses, step % len)
}

/// P2SH script for a transparent Zcash address (2-byte version prefix).
pub fn p2sh_script(address: &str) -> Option<ScriptBuf> {
    let hash: [u8; 20] = address_payload(address)?;
    Some(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash)))
}

/// The 20-byte hash of a transparent Zcash address.
pub fn address_payload(address: &str) -> Option<[u8; 20]> {
    let payload = bitcoin::base58::decode_check(address).ok()?;
    if payload.len() != 22 {
        return None;
    }
    payload[2..].try_into().ok()
}

fn percent_of(amount: f64, percent: f64) -> u64 {
    (amount * percent / 100.0).round() as u64
}

/// Coinbase outputs: pool payout plus founders or treasury share.
fn build_outputs(chain: &ZcashChain, height: u64, block_reward: f64, fees: u64) -> Vec<TxOut> {
    let cfg = &chain.rewards;
    let mut outputs = Vec::with_capacity(2);
    let pool = |value: u64| TxOut {
        value: Amount::from_sat(value),
        script_pubkey: chain.pool_script.clone(),
    };

    let splits = cfg.pays_founders_reward()
        && (height <= cfg.last_founders_reward_height() || cfg.treasury_reward_start_block_height > 0);
    if !splits {
        outputs.push(pool(block_reward.round() as u64 + fees));
        return outputs;
    }

    let (percent, recipient) =
        if cfg.treasury_reward_start_block_height > 0 && height >= cfg.treasury_reward_start_block_height {
            (cfg.treasury_reward_percent, treasury_address(cfg, height))
        } else {
            (cfg.founders_reward_percent, founders_address(cfg, height))
        };

    match recipient.and_then(p2sh_script) {
        Some(script) => {
            let share = percent_of(block_reward, percent);
            let to_pool = (block_reward - share as f64).round() as u64;
            outputs.push(pool(to_pool + fees));
            outputs.push(TxOut {
                value: Amount::from_sat(share),
                script_pubkey: script,
            });
        }
        None => outputs.push(pool(block_reward.round() as u64 + fees)),
    }
    outputs
}

fn build_coinbase(height: u64, outputs: &[TxOut]) -> Vec<u8> {
    let script_sig = script_number(height as i64);
    let mut tx = Vec::with_capacity(128);
    tx.extend_from_slice(&1u32.to_le_bytes());
    tx.push(1);
    tx.extend_from_slice(&[0u8; 32]);
    tx.extend_from_slice(&u32::MAX.to_le_bytes());
    tx.extend(compact_size(script_sig.len() as u64));
    tx.extend_from_slice(script_sig.as_bytes());
    tx.extend_from_slice(&u32::MAX.to_le_bytes());
    tx.extend(compact_size(outputs.len() as u64));
    for output in outputs {
        tx.extend(bitcoin::consensus::encode::serialize(output));
    }
    tx.extend_from_slice(&0u32.to_le_bytes());
    tx
}

impl ZcashJob {
    pub fn new(chain: &ZcashChain, template: ZcashTemplate, id: String) -> anyhow::Result<Self> {
        let ZcashTemplate { block, subsidy } = template;

        let mut block_reward = subsidy.miner * SATOSHIS_PER_COIN;
        if chain.rewards.pays_founders_reward() {
            let founders = subsidy
                .founders
                .or(subsidy.community)
                .ok_or_else(|| anyhow::anyhow!("founders reward missing from block subsidy"))?;
            block_reward = (subsidy.miner + founders) * SATOSHIS_PER_COIN;
        }
        let fees = block.transactions.iter().map(|tx| tx.fee.max(0) as u64).sum::<u64>();

        let outputs = build_outputs(chain, block.height, block_reward, fees);
        let reward_to_pool = outputs.first().map(|o| o.value).unwrap_or(Amount::ZERO);
        let coinbase = build_coinbase(block.height, &outputs);
        let coinbase_hash = sha256d(&coinbase);

        let mut tx_hashes = Vec::with_capacity(block.transactions.len());
        let mut transaction_data = Vec::new();
        for tx in &block.transactions {
            let hash: [u8; 32] = reverse_hex(&tx.hash)?
                .try_into()
                .map_err(|_| anyhow::anyhow!("invalid transaction hash {}", tx.hash))?;
            tx_hashes.push(hash);
            transaction_data.extend(hex::decode(&tx.data)?);
        }
        let merkle_root = MerkleTree::new(&tx_hashes).with_first(coinbase_hash);

        let previous_hash = reverse_hex(&block.previous_block_hash)?;
        anyhow::ensure!(previous_hash.len() == 32, "previousblockhash must be 32 bytes");
        let sapling_root: [u8; 32] = match block.final_sapling_root_hash.as_deref() {
            Some(root) => reverse_hex(root)?
                .try_into()
                .map_err(|_| anyhow::anyhow!("invalid finalsaplingroothash"))?,
            None => [0u8; 32],
        };
        let bits = parse_hex_u32(&block.bits).ok_or_else(|| anyhow::anyhow!("invalid bits {}", block.bits))?;
        let block_target = block
            .target
            .as_deref()
            .and_then(from_hex)
            .unwrap_or_else(|| target_from_bits(bits));
        let network_difficulty = ratio(&zcash_diff1(), &block_target);

        let mut coinbase_txid = coinbase_hash;
        coinbase_txid.reverse();

        let params = vec![
            json!(id),
            json!(hex::encode(block.version.to_le_bytes())),
            json!(hex::encode(&previous_hash)),
            json!(hex::encode(merkle_root)),
            json!(hex::encode(sapling_root)),
            json!(hex::encode(block.cur_time.to_le_bytes())),
            json!(hex::encode(bits.to_le_bytes())),
        ];

        Ok(Self {
            id,
            header_hasher: Arc::clone(&chain.header_hasher),
            verifier: Arc::clone(&chain.verifier),
            coinbase,
            coinbase_txid: hex::encode(coinbase_txid),
            merkle_root,
            previous_hash,
            sapling_root,
            bits,
            block_target,
            network_difficulty,
            reward_to_pool,
            transaction_data,
            submissions: SubmissionSet::default(),
            params,
            template: block,
        })
    }

    pub fn coinbase(&self) -> &[u8] {
        &self.coinbase
    }

    pub fn block_target(&self) -> &BigUint {
        &self.block_target
    }

    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    pub fn serialize_header(&self, ntime: u32, nonce: &[u8]) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LENGTH);
        header.extend_from_slice(&self.template.version.to_le_bytes());
        header.extend_from_slice(&self.previous_hash);
        header.extend_from_slice(&self.merkle_root);
        header.extend_from_slice(&self.sapling_root);
        header.extend_from_slice(&ntime.to_le_bytes());
        header.extend_from_slice(&self.bits.to_le_bytes());
        header.extend_from_slice(nonce);
        header
    }

    fn serialize_block(&self, header: &[u8], solution: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(header.len() + solution.len() + self.coinbase.len() + self.transaction_data.len() + 9);
        block.extend_from_slice(header);
        block.extend_from_slice(solution);
        block.extend(compact_size(self.template.transactions.len() as u64 + 1));
        block.extend_from_slice(&self.coinbase);
        block.extend_from_slice(&self.transaction_data);
        block
    }

    pub async fn process_share(
        &self,
        ctx: &WorkerShareContext,
        submission: &ZcashSubmission,
        now: i64,
    ) -> Result<ShareOutcome<ZcashBlock>, ShareError> {
        if submission.ntime.len() != 8 {
            return Err(ShareError::other("incorrect size of ntime"));
        }
        let ntime_bytes: [u8; 4] = hex::decode(&submission.ntime)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| ShareError::other("incorrect size of ntime"))?;
        let ntime = u32::from_le_bytes(ntime_bytes);
        if ntime < self.template.cur_time || ntime as i64 > now + MAX_NTIME_DRIFT as i64 {
            return Err(ShareError::other("ntime out of range"));
        }

        let nonce_hex = format!("{}{}", ctx.extra_nonce1, submission.extra_nonce2);
        if nonce_hex.len() != NONCE_HEX_LENGTH {
            return Err(ShareError::other("incorrect size of extraNonce2"));
        }
        let nonce = hex::decode(&nonce_hex).map_err(|_| ShareError::other("incorrect size of extraNonce2"))?;
        if submission.solution.len() != SOLUTION_HEX_LENGTH {
            return Err(ShareError::other("incorrect size of solution"));
        }
        let solution = hex::decode(&submission.solution).map_err(|_| ShareError::other("invalid solution"))?;

        let key = format!("{}{}", nonce_hex.to_lowercase(), submission.solution.to_lowercase());
        if !self.submissions.register(key) {
            return Err(ShareError::DuplicateShare);
        }

        let header = self.serialize_header(ntime, &nonce);
        if !self
            .verifier
            .verify(header.clone(), solution[SOLUTION_PREFIX_LENGTH..].to_vec())
            .await
        {
            return Err(ShareError::other("invalid solution"));
        }

        let mut header_solution = header.clone();
        header_solution.extend_from_slice(&solution);
        let header_hash = self.header_hasher.digest(&header_solution, &[ntime as u64]);
        let header_value = hash_value_le(&header_hash);

        let share_diff = ratio(&zcash_diff1(), &header_value);
        let is_block_candidate = header_value <= self.block_target;
        let difficulty = if is_block_candidate {
            ctx.difficulty
        } else {
            ctx.credited_difficulty(share_diff)?
        };

        let mut share = Share::new(ctx, self.template.height, difficulty, self.network_difficulty);
        if !is_block_candidate {
            return Ok(ShareOutcome { share, block: None });
        }

        let mut block_hash = header_hash;
        block_hash.reverse();
        share.is_block_candidate = true;
        share.block_hash = Some(hex::encode(block_hash));
        share.block_reward = Some(Decimal::from(self.reward_to_pool.to_sat()) / dec!(100000000));

        let block = ZcashBlock {
            hex: hex::encode(self.serialize_block(&header, &solution)),
            hash: hex::encode(block_hash),
            coinbase_txid: self.coinbase_txid.clone(),
        };
        Ok(ShareOutcome { share, block: Some(block) })
    }
}

impl MiningJob for ZcashJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn height(&self) -> u64 {
        self.template.height
    }

    fn job_params(&self, is_new: bool) -> Value {
        let mut params = self.params.clone();
        params.push(json!(is_new));
        Value::Array(params)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::target::to_hex64;
    use crate::crypto::Sha256D;
    use async_trait::async_trait;
    use bitcoin::consensus::deserialize;
    use bitcoin::Transaction;

    pub(crate) const CUR_TIME: u32 = 1_700_000_000;

    /// Accepts every solution; real Equihash checks live in crypto::equihash.
    pub(crate) struct AcceptAll;

    #[async_trait]
    impl SolutionVerifier for AcceptAll {
        async fn verify(&self, header: Vec<u8>, _solution: Vec<u8>) -> bool {
            header.len() == HEADER_LENGTH
        }
    }

    struct RejectAll;

    #[async_trait]
    impl SolutionVerifier for RejectAll {
        async fn verify(&self, _header: Vec<u8>, _solution: Vec<u8>) -> bool {
            false
        }
    }

    /// A well-formed transparent address with a zcash-style 2-byte prefix.
    pub(crate) fn t_address(fill: u8) -> String {
        let mut payload = vec![0x1c, 0xbd];
        payload.extend_from_slice(&[fill; 20]);
        bitcoin::base58::encode_check(&payload)
    }

    pub(crate) fn chain(rewards: ZcashChainConfig) -> ZcashChain {
        ZcashChain {
            network: "test".into(),
            pool_script: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array([9u8; 20])),
            rewards,
            header_hasher: Arc::new(Sha256D),
            verifier: Arc::new(AcceptAll),
        }
    }

    pub(crate) fn template(height: u64, target: &str) -> ZcashTemplate {
        let block = serde_json::from_value(json!({
            "version": 4,
            "previousblockhash": "0000000004b9a3e1a6c8d1f5f8f2f0c3c6f6c2c3b1a5d4e3f2a1b0c9d8e7f6a5",
            "curtime": CUR_TIME,
            "bits": "1f07ffff",
            "height": height,
            "target": target,
            "transactions": [
                {"data": "aa", "hash": "11".repeat(32), "fee": 1000},
                {"data": "bb", "hash": "22".repeat(32), "fee": 2500}
            ]
        }))
        .unwrap();
        ZcashTemplate {
            block,
            subsidy: BlockSubsidy {
                miner: 10.0,
                founders: Some(2.5),
                community: None,
            },
        }
    }

    fn founders_config() -> ZcashChainConfig {
        ZcashChainConfig {
            founders_reward_percent: 20.0,
            founders_reward_addresses: (1..=4).map(t_address).collect(),
            founders_reward_subsidy_halving_interval: 840_000,
            founders_reward_subsidy_slow_start_interval: 20_000,
            ..Default::default()
        }
    }

    fn submission(en2: &str) -> ZcashSubmission {
        ZcashSubmission {
            job_id: "00000001".into(),
            ntime: hex::encode(CUR_TIME.to_le_bytes()),
            extra_nonce2: en2.into(),
            solution: format!("fd4005{}", "ab".repeat(1344)),
        }
    }

    fn ctx() -> WorkerShareContext {
        WorkerShareContext {
            extra_nonce1: "0a0b0c0d".into(),
            difficulty: 1e-12,
            miner: "t1miner".into(),
            ..Default::default()
        }
    }

    fn now() -> i64 {
        CUR_TIME as i64 + 5
    }

    fn en2() -> String {
        "00".repeat(28)
    }

    #[test]
    fn test_coinbase_outputs_with_founders() {
        let cfg = founders_config();
        let job = ZcashJob::new(&chain(cfg.clone()), template(100, &"f".repeat(64)), "00000001".into()).unwrap();
        let tx: Transaction = deserialize(job.coinbase()).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.output.len(), 2);

        // 12.5 coins, 20% to founders, fees to the pool
        assert_eq!(tx.output[0].value.to_sat(), 1_000_000_000 + 3500);
        assert_eq!(tx.output[1].value.to_sat(), 250_000_000);
        let expected = p2sh_script(founders_address(&cfg, 100).unwrap()).unwrap();
        assert_eq!(tx.output[1].script_pubkey, expected);
    }

    #[test]
    fn test_coinbase_without_founders() {
        let job = ZcashJob::new(&chain(ZcashChainConfig::default()), template(100, &"f".repeat(64)), "00000001".into()).unwrap();
        let tx: Transaction = deserialize(job.coinbase()).unwrap();
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value.to_sat(), 1_000_000_000 + 3500);
    }

    #[test]
    fn test_treasury_rotation() {
        let cfg = ZcashChainConfig {
            treasury_reward_percent: 10.0,
            treasury_reward_addresses: (1..=3).map(t_address).collect(),
            treasury_reward_start_block_height: 1000,
            treasury_reward_address_change_interval: 100,
            ..Default::default()
        };
        assert_eq!(treasury_address(&cfg, 1000), Some(cfg.treasury_reward_addresses[0].as_str()));
        assert_eq!(treasury_address(&cfg, 1150), Some(cfg.treasury_reward_addresses[1].as_str()));
        assert_eq!(treasury_address(&cfg, 1300), Some(cfg.treasury_reward_addresses[0].as_str()));

        let job = ZcashJob::new(&chain(cfg), template(1000, &"f".repeat(64)), "00000001".into()).unwrap();
        let tx: Transaction = deserialize(job.coinbase()).unwrap();
        assert_eq!(tx.output[1].value.to_sat(), 125_000_000);
        assert_eq!(tx.output[0].value.to_sat(), 1_125_000_000 + 3500);
    }

    #[test]
    fn test_founders_rotation_spreads_addresses() {
        let cfg = founders_config();
        // (849_999 + 4) / 4 = 212_500 blocks per address
        assert_eq!(founders_address(&cfg, 212_499), Some(cfg.founders_reward_addresses[0].as_str()));
        assert_eq!(founders_address(&cfg, 212_500), Some(cfg.founders_reward_addresses[1].as_str()));
        assert_eq!(founders_address(&cfg, 849_999), Some(cfg.founders_reward_addresses[3].as_str()));
    }

    #[test]
    fn test_job_params_layout() {
        let job = ZcashJob::new(&chain(ZcashChainConfig::default()), template(100, &"f".repeat(64)), "0000000a".into()).unwrap();
        let params = job.job_params(true);
        let params = params.as_array().unwrap();
        assert_eq!(params.len(), 8);
        assert_eq!(params[1], "04000000");
        assert_eq!(params[4], "0".repeat(64));
        assert_eq!(params[6], "ffff071f");
        assert_eq!(params[7], true);
    }

    #[tokio::test]
    async fn test_candidate_boundary() {
        let rewards = ZcashChainConfig::default();
        let reference = ZcashJob::new(&chain(rewards.clone()), template(100, &"f".repeat(64)), "00000001".into()).unwrap();
        let sub = submission(&en2());
        let nonce = hex::decode(format!("{}{}", ctx().extra_nonce1, en2())).unwrap();
        let mut bytes = reference.serialize_header(CUR_TIME, &nonce);
        bytes.extend(hex::decode(&sub.solution).unwrap());
        let value = hash_value_le(&sha256d(&bytes));

        let at = ZcashJob::new(&chain(rewards.clone()), template(100, &to_hex64(&value)), "00000002".into()).unwrap();
        let outcome = at.process_share(&ctx(), &sub, now()).await.unwrap();
        assert!(outcome.share.is_block_candidate);
        let block = outcome.block.unwrap();
        // header + solution + tx count + coinbase + 2 raw txs
        assert_eq!(block.hex.len() / 2, HEADER_LENGTH + 1347 + 1 + at.coinbase().len() + 2);

        let below = &value - BigUint::from(1u32);
        let miss = ZcashJob::new(&chain(rewards), template(100, &to_hex64(&below)), "00000003".into()).unwrap();
        let outcome = miss.process_share(&ctx(), &sub, now()).await.unwrap();
        assert!(!outcome.share.is_block_candidate);
    }

    #[tokio::test]
    async fn test_share_validation_errors() {
        let job = ZcashJob::new(&chain(ZcashChainConfig::default()), template(100, &"f".repeat(64)), "00000001".into()).unwrap();

        let mut sub = submission("00");
        assert_eq!(
            job.process_share(&ctx(), &sub, now()).await.unwrap_err(),
            ShareError::other("incorrect size of extraNonce2")
        );

        sub = submission(&en2());
        sub.solution = "ab".into();
        assert_eq!(
            job.process_share(&ctx(), &sub, now()).await.unwrap_err(),
            ShareError::other("incorrect size of solution")
        );

        sub = submission(&en2());
        sub.ntime = hex::encode((CUR_TIME - 1).to_le_bytes());
        assert_eq!(
            job.process_share(&ctx(), &sub, now()).await.unwrap_err(),
            ShareError::other("ntime out of range")
        );

        sub = submission(&en2());
        assert!(job.process_share(&ctx(), &sub, now()).await.is_ok());
        assert_eq!(
            job.process_share(&ctx(), &sub, now()).await.unwrap_err(),
            ShareError::DuplicateShare
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_accept_exactly_one() {
        let job = Arc::new(
            ZcashJob::new(&chain(ZcashChainConfig::default()), template(100, &"f".repeat(64)), "00000001".into()).unwrap(),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let job = Arc::clone(&job);
                tokio::spawn(async move { job.process_share(&ctx(), &submission(&en2()), now()).await })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert_eq!(e, ShareError::DuplicateShare),
            }
        }
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn test_invalid_solution_rejected() {
        let mut c = chain(ZcashChainConfig::default());
        c.verifier = Arc::new(RejectAll);
        let job = ZcashJob::new(&c, template(100, &"f".repeat(64)), "00000001".into()).unwrap();
        assert_eq!(
            job.process_share(&ctx(), &submission(&en2()), now()).await.unwrap_err(),
            ShareError::other("invalid solution")
        );
    }

    #[test]
    fn test_submission_params() {
        let ok = ZcashSubmission::from_params(&[json!("w"), json!("01"), json!("00"), json!("00"), json!("ff")]).unwrap();
        assert_eq!(ok.job_id, "01");
        assert_eq!(
            ZcashSubmission::from_params(&[json!(""), json!("01")]).unwrap_err(),
            ShareError::other("missing or invalid workername")
        );
        assert_eq!(
            ZcashSubmission::from_params(&[json!("w"), json!("01"), json!("00"), json!("00")]).unwrap_err(),
            ShareError::other("missing or invalid solution")
        );
    }
}
