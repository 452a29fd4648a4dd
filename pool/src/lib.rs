//! Stratum mining pool engine.
//!
//! Miners connect over line-delimited JSON-RPC, receive jobs built from a
//! blockchain daemon's block template and submit shares that are validated,
//! difficulty-adjusted and, when they meet the network target, submitted
//! back to the daemon as blocks. Bitcoin-style, Ethereum (Ethash) and
//! Zcash (Equihash) chains are supported.

pub mod banning;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod events;
pub mod jobs;
pub mod metrics;
pub mod pool;
pub mod stratum;
pub mod vardiff;
pub mod worker;

pub use pool::{Pool, PoolInfo, PoolStatus};
