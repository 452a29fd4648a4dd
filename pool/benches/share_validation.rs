/// Share validation benchmarks
///
/// Per-submission cost of the UTXO family: coinbase assembly, merkle root,
/// header hash and target comparison.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;

use stratum_pool::crypto::{MerkleTree, Sha256D};
use stratum_pool::jobs::bitcoin::{local_script, BitcoinChain, BitcoinJob, BitcoinSubmission, BlockTemplate};
use stratum_pool::jobs::WorkerShareContext;

const CUR_TIME: u32 = 1_700_000_000;

fn chain() -> BitcoinChain {
    BitcoinChain {
        network: "regtest".into(),
        pool_script: local_script("bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080").unwrap(),
        is_pos: false,
        coinbase_tag: b"/bench/".to_vec(),
        header_hasher: Arc::new(Sha256D),
        block_reward_multiplier: 1.0,
    }
}

fn template(tx_count: usize) -> BlockTemplate {
    let transactions: Vec<_> = (0..tx_count)
        .map(|i| json!({"data": "00", "txid": format!("{:064x}", i + 1)}))
        .collect();
    serde_json::from_value(json!({
        "version": 0x20000000u32,
        "previousblockhash": "0000000000000000000a4d5e1e0bcb2ac3ef5d8b0b2b1fe2fbd7e5c7a1b2c3d4",
        "curtime": CUR_TIME,
        "bits": "1703a30c",
        "height": 812_345,
        "coinbasevalue": 625_000_000u64,
        "transactions": transactions,
    }))
    .unwrap()
}

fn context() -> WorkerShareContext {
    WorkerShareContext {
        extra_nonce1: "0a0b0c0d".into(),
        // every hash clears this
        difficulty: 1e-12,
        miner: "bench".into(),
        ..Default::default()
    }
}

fn bench_process_share(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitcoin_process_share");
    for tx_count in [0usize, 100, 2000] {
        let job = BitcoinJob::new(&chain(), template(tx_count), "00000001".into(), CUR_TIME as i64).unwrap();
        let ctx = context();
        let mut nonce = 0u32;
        group.bench_with_input(BenchmarkId::from_parameter(tx_count), &job, |b, job| {
            b.iter(|| {
                nonce = nonce.wrapping_add(1);
                let submission = BitcoinSubmission {
                    job_id: "00000001".into(),
                    extra_nonce2: "00000000".into(),
                    ntime: format!("{:08x}", CUR_TIME),
                    nonce: format!("{:08x}", nonce),
                };
                black_box(job.process_share(&ctx, &submission, CUR_TIME as i64))
            })
        });
    }
    group.finish();
}

fn bench_merkle_root(c: &mut Criterion) {
    let hashes: Vec<[u8; 32]> = (0..2000u32)
        .map(|i| {
            let mut h = [0u8; 32];
            h[..4].copy_from_slice(&i.to_le_bytes());
            h
        })
        .collect();
    let tree = MerkleTree::new(&hashes);
    c.bench_function("merkle_with_first_2000", |b| b.iter(|| black_box(tree.with_first(black_box([7u8; 32])))));
}

criterion_group!(benches, bench_process_share, bench_merkle_root);
criterion_main!(benches);
