/// Account-model job (Ethereum / Ethash)
///
/// Work is the pending block's header hash, seed hash and boundary as handed
/// out by `eth_getWork`. Shares are checked with light Ethash evaluation.

use num_bigint::BigUint;
use num_traits::One;
use serde_json::{json, Value};

use crate::crypto::ethash::{self, EthashManager};
use crate::crypto::serialization::decode_hex32;
use crate::crypto::target::{from_hex, ratio};
use crate::jobs::{MiningJob, Share, ShareError, ShareOutcome, SubmissionSet, WorkerShareContext};

/// Stratum difficulty 1 equals 2^32 hashes.
pub const POW_2_32: f64 = 4_294_967_296.0;
const NONCE_HEX_LENGTH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct EthereumTemplate {
    /// Pending block header hash (pow hash), `0x` prefixed
    pub header: String,
    pub seed: String,
    /// Boundary condition, `0x` prefixed big-endian
    pub target: String,
    pub difficulty: f64,
    pub height: u64,
    pub parent_hash: String,
}

#[derive(Debug, Clone)]
pub struct EthereumSubmission {
    pub job_id: String,
    pub nonce: String,
}

impl EthereumSubmission {
    /// `[worker, jobId, nonce]`, all present and non-empty.
    pub fn from_params(params: &[Value]) -> Result<Self, ShareError> {
        let fields: Vec<&str> = params.iter().filter_map(Value::as_str).filter(|s| !s.is_empty()).collect();
        if params.len() != 3 || fields.len() != 3 {
            return Err(ShareError::MinusOne("malformed PoW result".into()));
        }
        Ok(Self {
            job_id: fields[1].to_string(),
            nonce: fields[2].trim_start_matches("0x").to_string(),
        })
    }
}

/// `eth_submitWork` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct EthereumBlock {
    pub nonce: String,
    pub header_hash: String,
    pub mix_hash: String,
}

fn strip_0x(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

pub struct EthereumJob {
    id: String,
    template: EthereumTemplate,
    header_hash: [u8; 32],
    block_target: BigUint,
    submissions: SubmissionSet,
}

impl EthereumJob {
    pub fn new(template: EthereumTemplate, id: String) -> anyhow::Result<Self> {
        let header_hash = decode_hex32(strip_0x(&template.header))
            .ok_or_else(|| anyhow::anyhow!("invalid header hash {}", template.header))?;
        let block_target =
            from_hex(&template.target).ok_or_else(|| anyhow::anyhow!("invalid target {}", template.target))?;
        Ok(Self {
            id,
            template,
            header_hash,
            block_target,
            submissions: SubmissionSet::default(),
        })
    }

    pub fn template(&self) -> &EthereumTemplate {
        &self.template
    }

    pub fn epoch(&self) -> u64 {
        ethash::epoch(self.template.height)
    }

    pub async fn process_share(
        &self,
        ctx: &WorkerShareContext,
        submission: &EthereumSubmission,
        ethash: &EthashManager,
    ) -> Result<ShareOutcome<EthereumBlock>, ShareError> {
        let full_nonce = format!("{}{}", ctx.extra_nonce1, submission.nonce).to_lowercase();
        if full_nonce.len() != NONCE_HEX_LENGTH {
            return Err(ShareError::other("incorrect size of nonce"));
        }
        let nonce = u64::from_str_radix(&full_nonce, 16).map_err(|_| ShareError::other("malformed nonce"))?;

        if !self.submissions.register(full_nonce.clone()) {
            return Err(ShareError::DuplicateShare);
        }

        let cache = ethash.cache(self.epoch()).await.map_err(|e| {
            tracing::error!("Ethash cache for epoch {} unavailable: {}", self.epoch(), e);
            ShareError::other("ethash cache unavailable")
        })?;
        let header_hash = self.header_hash;
        let (mix, result) = tokio::task::spawn_blocking(move || cache.hashimoto_light(&header_hash, nonce))
            .await
            .map_err(|_| ShareError::other("ethash verification failed"))?;

        let value = BigUint::from_bytes_be(&result);
        let share_diff = ratio(&(BigUint::one() << 256u32), &value) / POW_2_32;
        let is_block_candidate = value <= self.block_target;
        let difficulty = if is_block_candidate {
            ctx.difficulty
        } else {
            ctx.credited_difficulty(share_diff)?
        };

        let mut share = Share::new(ctx, self.template.height, difficulty * POW_2_32, self.template.difficulty);
        if !is_block_candidate {
            return Ok(ShareOutcome { share, block: None });
        }

        let mix_hash = format!("0x{}", hex::encode(mix));
        let nonce_hex = format!("0x{}", full_nonce);
        share.is_block_candidate = true;
        share.transaction_confirmation_data = Some(format!("{}:{}", mix_hash, nonce_hex));

        let block = EthereumBlock {
            nonce: nonce_hex,
            header_hash: format!("0x{}", hex::encode(self.header_hash)),
            mix_hash,
        };
        Ok(ShareOutcome { share, block: Some(block) })
    }
}

impl MiningJob for EthereumJob {
    fn id(&self) -> &str {
        &self.id
    }

    fn height(&self) -> u64 {
        self.template.height
    }

    fn job_params(&self, is_new: bool) -> Value {
        json!([
            self.id,
            strip_0x(&self.template.seed),
            strip_0x(&self.template.header),
            is_new
        ])
    }
}
