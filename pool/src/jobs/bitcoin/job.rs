/// Bitcoin-style job: coinbase halves, merkle branch, 80-byte header and
/// share validation against one `getblocktemplate` snapshot.

use bitcoin::script::Builder;
use bitcoin::{Amount, ScriptBuf, TxOut};
use num_bigint::BigUint;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::crypto::serialization::{compact_size, parse_hex_u32, push_bytes, reverse_hex, script_number, swap_words};
use crate::crypto::target::{bitcoin_diff1, from_hex, hash_value_le, ratio, target_from_bits};
use crate::crypto::{sha256d, HashAlgorithm, MerkleTree};
use crate::jobs::{MiningJob, Share, ShareError, ShareOutcome, SubmissionSet, WorkerShareContext, MAX_NTIME_DRIFT};

/// extranonce1 (4 bytes) + extranonce2 (4 bytes)
pub const EXTRANONCE_PLACEHOLDER_SIZE: usize = 8;
pub const EXTRANONCE2_SIZE: usize = 4;

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: String,
}

/// `getblocktemplate` result, the fields jobs are built from.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockTemplate {
    pub version: u32,
    #[serde(rename = "previousblockhash")]
    pub previous_block_hash: String,
    #[serde(rename = "curtime")]
    pub cur_time: u32,
    pub bits: String,
    pub height: u64,
    #[serde(rename = "coinbasevalue")]
    pub coinbase_value: u64,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default, rename = "default_witness_commitment")]
    pub witness_commitment: Option<String>,
    #[serde(default, rename = "coinbaseaux")]
    pub coinbase_aux: Option<CoinbaseAux>,
}

/// Chain facts a job needs besides the template.
#[derive(Clone)]
pub struct BitcoinChain {
    pub network: String,
    pub pool_script: ScriptBuf,
    pub is_pos: bool,
    pub coinbase_tag: Vec<u8>,
    pub header_hasher: Arc<dyn HashAlgorithm>,
    pub block_reward_multiplier: f64,
}

/// Parsed `mining.submit` parameters.
#[derive(Debug, Clone)]
pub struct BitcoinSubmission {
    pub job_id: String,
    pub extra_nonce2: String,
    pub ntime: String,
    pub nonce: String,
}

impl BitcoinSubmission {
    pub fn from_params(params: &[Value]) -> Result<Self, ShareError> {
        let field = |i: usize| params.get(i).and_then(Value::as_str).map(str::to_string);
        match (field(1), field(2), field(3), field(4)) {
            (Some(job_id), Some(extra_nonce2), Some(ntime), Some(nonce)) => Ok(Self {
                job_id,
                extra_nonce2,
                ntime,
                nonce,
            }),
            _ => Err(ShareError::other("invalid params")),
        }
    }
}

/// Everything `submitblock` needs.
#[derive(Debug, Clone)]
pub struct BitcoinBlock {
    pub hex: String,
    pub hash: String,
    pub coinbase_txid: String,
}

pub struct BitcoinJob {
    id: String,
    template: BlockTemplate,
    is_pos: bool,
    header_hasher: Arc<dyn HashAlgorithm>,
    coinbase_initial: Vec<u8>,
    coinbase_final: Vec<u8>,
    merkle: MerkleTree,
    /// Previous block hash, internal byte order
    previous_hash: Vec<u8>,
    bits: u32,
    block_target: BigUint,
    network_difficulty: f64,
    block_reward: Decimal,
    transaction_data: Vec<u8>,
    submissions: SubmissionSet,
    params: Vec<Value>,
}

impl BitcoinJob {
    pub fn new(chain: &BitcoinChain, template: BlockTemplate, id: String, now: i64) -> anyhow::Result<Self> {
        let previous_hash = reverse_hex(&template.previous_block_hash)?;
        anyhow::ensure!(previous_hash.len() == 32, "previousblockhash must be 32 bytes");
        let bits = parse_hex_u32(&template.bits).ok_or_else(|| anyhow::anyhow!("invalid bits {}", template.bits))?;

        let block_target = template
            .target
            .as_deref()
            .and_then(from_hex)
            .unwrap_or_else(|| target_from_bits(bits));
        let network_difficulty = ratio(&bitcoin_diff1(), &block_target);

        let mut tx_hashes = Vec::with_capacity(template.transactions.len());
        let mut transaction_data = Vec::new();
        for tx in &template.transactions {
            let id = tx.txid.as_deref().or(tx.hash.as_deref()).unwrap_or_default();
            let hash: [u8; 32] = reverse_hex(id)?
                .try_into()
                .map_err(|_| anyhow::anyhow!("invalid transaction id {}", id))?;
            tx_hashes.push(hash);
            transaction_data.extend(hex::decode(&tx.data)?);
        }
        let merkle = MerkleTree::new(&tx_hashes);

        let (coinbase_initial, coinbase_final) = build_coinbase(chain, &template, now)?;

        let block_reward = Decimal::from(template.coinbase_value)
            * Decimal::from_f64(chain.block_reward_multiplier).unwrap_or(Decimal::ONE)
            / dec!(100000000);

        let params = vec![
            json!(id),
            json!(hex::encode(swap_words(&previous_hash))),
            json!(hex::encode(&coinbase_initial)),
            json!(hex::encode(&coinbase_final)),
            json!(merkle.steps_hex()),
            json!(format!("{:08x}", template.version)),
            json!(template.bits),
            json!(format!("{:08x}", template.cur_time)),
        ];

        Ok(Self {
            id,
            is_pos: chain.is_pos,
            header_hasher: Arc::clone(&chain.header_hasher),
            coinbase_initial,
            coinbase_final,
            merkle,
            previous_hash,
            bits,
            block_target,
            network_difficulty,
            block_reward,
            transaction_data,
            submissions: SubmissionSet::default(),
            params,
            template,
        })
    }

    pub fn template(&self) -> &BlockTemplate {
        &self.template
    }

    pub fn coinbase_initial(&self) -> &[u8] {
        &self.coinbase_initial
    }

    pub fn coinbase_final(&self) -> &[u8] {
        &self.coinbase_final
    }

    pub fn block_target(&self) -> &BigUint {
        &self.block_target
    }

    pub fn network_difficulty(&self) -> f64 {
        self.network_difficulty
    }

    pub fn coinbase(&self, extra_nonce1: &[u8], extra_nonce2: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.coinbase_initial.len() + EXTRANONCE_PLACEHOLDER_SIZE + self.coinbase_final.len());
        out.extend_from_slice(&self.coinbase_initial);
        out.extend_from_slice(extra_nonce1);
        out.extend_from_slice(extra_nonce2);
        out.extend_from_slice(&self.coinbase_final);
        out
    }

    pub fn serialize_header(&self, merkle_root: &[u8; 32], ntime: u32, nonce: u32) -> [u8; 80] {
        let mut header = [0u8; 80];
        header[0..4].copy_from_slice(&self.template.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.previous_hash);
        header[36..68].copy_from_slice(merkle_root);
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());
        header[76..80].copy_from_slice(&nonce.to_le_bytes());
        header
    }

    fn serialize_block(&self, header: &[u8], coinbase: &[u8]) -> Vec<u8> {
        let mut block = Vec::with_capacity(header.len() + coinbase.len() + self.transaction_data.len() + 10);
        block.extend_from_slice(header);
        block.extend(compact_size(self.template.transactions.len() as u64 + 1));
        block.extend_from_slice(coinbase);
        block.extend_from_slice(&self.transaction_data);
        if self.is_pos {
            // empty block signature
            block.push(0);
        }
        block
    }

    /// Validate a submission and, when it meets the network target, assemble
    /// the block.
    pub fn process_share(
        &self,
        ctx: &WorkerShareContext,
        submission: &BitcoinSubmission,
        now: i64,
    ) -> Result<ShareOutcome<BitcoinBlock>, ShareError> {
        if submission.extra_nonce2.len() != EXTRANONCE2_SIZE * 2 {
            return Err(ShareError::other("incorrect size of extraNonce2"));
        }
        let ntime = parse_hex_u32(&submission.ntime).ok_or_else(|| ShareError::other("incorrect size of ntime"))?;
        if (ntime as i64) < self.template.cur_time as i64 || ntime as i64 > now + MAX_NTIME_DRIFT as i64 {
            return Err(ShareError::other("ntime out of range"));
        }
        let nonce = parse_hex_u32(&submission.nonce).ok_or_else(|| ShareError::other("incorrect size of nonce"))?;

        let extra_nonce1 = hex::decode(&ctx.extra_nonce1).map_err(|_| ShareError::other("invalid extraNonce1"))?;
        let extra_nonce2 =
            hex::decode(&submission.extra_nonce2).map_err(|_| ShareError::other("incorrect size of extraNonce2"))?;

        let key = format!(
            "{}{}{}{}",
            ctx.extra_nonce1, submission.extra_nonce2, submission.ntime, submission.nonce
        )
        .to_lowercase();
        if !self.submissions.register(key) {
            return Err(ShareError::DuplicateShare);
        }

        let coinbase = self.coinbase(&extra_nonce1, &extra_nonce2);
        let coinbase_hash = sha256d(&coinbase);
        let merkle_root = self.merkle.with_first(coinbase_hash);
        let header = self.serialize_header(&merkle_root, ntime, nonce);
        let header_hash = self.header_hasher.digest(&header, &[ntime as u64]);
        let header_value = hash_value_le(&header_hash);

        let share_diff = ratio(&bitcoin_diff1(), &header_value) * self.header_hasher.share_multiplier();
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
        let mut coinbase_txid = coinbase_hash;
        coinbase_txid.reverse();

        share.is_block_candidate = true;
        share.block_hash = Some(hex::encode(block_hash));
        share.block_reward = Some(self.block_reward);

        let block = BitcoinBlock {
            hex: hex::encode(self.serialize_block(&header, &coinbase)),
            hash: hex::encode(block_hash),
            coinbase_txid: hex::encode(coinbase_txid),
        };
        Ok(ShareOutcome { share, block: Some(block) })
    }

    #[cfg(test)]
    pub(crate) fn header_value(&self, extra_nonce1: &str, submission: &BitcoinSubmission) -> BigUint {
        let coinbase = self.coinbase(
            &hex::decode(extra_nonce1).unwrap(),
            &hex::decode(&submission.extra_nonce2).unwrap(),
        );
        let root = self.merkle.with_first(sha256d(&coinbase));
        let header = self.serialize_header(
            &root,
            parse_hex_u32(&submission.ntime).unwrap(),
            parse_hex_u32(&submission.nonce).unwrap(),
        );
        hash_value_le(&self.header_hasher.digest(&header, &[]))
    }
}

impl MiningJob for BitcoinJob {
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

/// Split the coinbase around the extranonce placeholder.
fn build_coinbase(chain: &BitcoinChain, template: &BlockTemplate, now: i64) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let mut sig_initial = Vec::new();
    sig_initial.extend_from_slice(script_number(template.height as i64).as_bytes());
    if let Some(aux) = &template.coinbase_aux {
        if !aux.flags.is_empty() {
            sig_initial.extend(hex::decode(&aux.flags)?);
        }
    }
    sig_initial.extend_from_slice(script_number(now).as_bytes());
    // push opcode covering the extranonce bytes
    sig_initial.push(EXTRANONCE_PLACEHOLDER_SIZE as u8);

    let sig_final = push_bytes(Builder::new(), &chain.coinbase_tag).into_script();
    let script_len = sig_initial.len() + EXTRANONCE_PLACEHOLDER_SIZE + sig_final.len();

    let mut initial = Vec::with_capacity(64 + sig_initial.len());
    initial.extend_from_slice(&1u32.to_le_bytes());
    if chain.is_pos {
        initial.extend_from_slice(&template.cur_time.to_le_bytes());
    }
    initial.push(1);
    initial.extend_from_slice(&[0u8; 32]);
    initial.extend_from_slice(&u32::MAX.to_le_bytes());
    initial.extend(compact_size(script_len as u64));
    initial.extend(sig_initial);

    let mut outputs = Vec::new();
    if let Some(commitment) = template.witness_commitment.as_deref().filter(|c| !c.is_empty()) {
        outputs.push(TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(hex::decode(commitment)?),
        });
    }
    outputs.push(TxOut {
        value: Amount::from_sat(template.coinbase_value),
        script_pubkey: chain.pool_script.clone(),
    });

    let mut fin = Vec::new();
    fin.extend_from_slice(sig_final.as_bytes());
    fin.extend_from_slice(&u32::MAX.to_le_bytes());
    fin.extend(compact_size(outputs.len() as u64));
    for output in &outputs {
        fin.extend(bitcoin::consensus::encode::serialize(output));
    }
    fin.extend_from_slice(&0u32.to_le_bytes());

    Ok((initial, fin))
}
