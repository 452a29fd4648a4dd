use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use crate::vardiff::{VarDiffConfig, VarDiffConfigError};

pub const DEFAULT_CONFIG_PATH: &str = "pool_config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("invalid config: pool {pool} port {port}: {source}")]
    VarDiff {
        pool: String,
        port: u16,
        #[source]
        source: VarDiffConfigError,
    },
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoinFamilyKind {
    #[default]
    Bitcoin,
    Ethereum,
    Zcash,
}

/// Block header proof-of-work for UTXO-family coins.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithmKind {
    #[default]
    Sha256d,
    /// Litecoin-style scrypt (N=1024, r=1, p=1)
    Scrypt,
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BanManagerKind {
    #[default]
    Integrated,
    IpTables,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ClusterBanningConfig {
    #[serde(default)]
    pub manager: BanManagerKind,
    /// Ban peers that send unparseable JSON
    #[serde(default = "default_true")]
    pub ban_on_junk_receive: bool,
    /// Ban peers whose invalid share ratio exceeds the pool threshold
    #[serde(default = "default_true")]
    pub ban_on_invalid_shares: bool,
}

impl Default for ClusterBanningConfig {
    fn default() -> Self {
        Self {
            manager: BanManagerKind::Integrated,
            ban_on_junk_receive: true,
            ban_on_invalid_shares: true,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct TcpProxyProtocolConfig {
    #[serde(default)]
    pub enable: bool,
    /// Drop connections that do not start with a PROXY header
    #[serde(default)]
    pub mandatory: bool,
    /// Peers allowed to send PROXY headers
    #[serde(default = "default_proxy_addresses")]
    pub proxy_addresses: Vec<IpAddr>,
}

impl Default for TcpProxyProtocolConfig {
    fn default() -> Self {
        Self {
            enable: false,
            mandatory: false,
            proxy_addresses: default_proxy_addresses(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct PoolEndpoint {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Initial stratum difficulty
    pub difficulty: f64,
    #[serde(default)]
    pub tcp_proxy_protocol: Option<TcpProxyProtocolConfig>,
    #[serde(default)]
    pub var_diff: Option<VarDiffConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PoolShareBasedBanningConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Number of shares before the invalid ratio is evaluated
    #[serde(default = "default_check_threshold")]
    pub check_threshold: u32,
    #[serde(default = "default_invalid_percent")]
    pub invalid_percent: f64,
    /// Ban duration in seconds
    #[serde(default = "default_ban_time")]
    pub time: u64,
}

impl Default for PoolShareBasedBanningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_threshold: default_check_threshold(),
            invalid_percent: default_invalid_percent(),
            time: default_ban_time(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct DaemonEndpointConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub http_path: Option<String>,
}

impl DaemonEndpointConfig {
    pub fn url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        let path = self.http_path.as_deref().unwrap_or("");
        let path = if path.is_empty() || path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}://{}:{}{}", scheme, self.host, self.port, path)
    }
}

/// Founders / treasury reward schedule for shielded-UTXO chains.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ZcashChainConfig {
    #[serde(default)]
    pub founders_reward_percent: f64,
    #[serde(default)]
    pub founders_reward_addresses: Vec<String>,
    #[serde(default)]
    pub founders_reward_subsidy_halving_interval: u64,
    #[serde(default)]
    pub founders_reward_subsidy_slow_start_interval: u64,
    #[serde(default)]
    pub treasury_reward_percent: f64,
    #[serde(default)]
    pub treasury_reward_addresses: Vec<String>,
    #[serde(default)]
    pub treasury_reward_start_block_height: u64,
    #[serde(default = "default_treasury_interval")]
    pub treasury_reward_address_change_interval: u64,
}

impl ZcashChainConfig {
    pub fn pays_founders_reward(&self) -> bool {
        !self.founders_reward_addresses.is_empty() || !self.treasury_reward_addresses.is_empty()
    }

    pub fn last_founders_reward_height(&self) -> u64 {
        (self.founders_reward_subsidy_halving_interval + self.founders_reward_subsidy_slow_start_interval / 2)
            .saturating_sub(1)
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct PoolConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub family: CoinFamilyKind,
    /// Header hash of the bitcoin family
    #[serde(default)]
    pub algorithm: HashAlgorithmKind,
    /// Ticker, informational only
    #[serde(default)]
    pub coin: String,
    /// Pool wallet receiving the coinbase reward
    pub address: String,
    pub ports: HashMap<u16, PoolEndpoint>,
    pub daemons: Vec<DaemonEndpointConfig>,
    #[serde(default)]
    pub banning: PoolShareBasedBanningConfig,
    /// Seconds of silence after which an authorized worker is dropped
    #[serde(default = "default_client_timeout")]
    pub client_connection_timeout: u64,
    /// Seconds without a new block before the job is refreshed anyway
    #[serde(default = "default_rebroadcast")]
    pub job_rebroadcast_timeout: u64,
    /// Template polling interval in milliseconds
    #[serde(default = "default_block_refresh")]
    pub block_refresh_interval: u64,
    /// Tag pushed into the coinbase scriptSig
    #[serde(default = "default_coinbase_tag")]
    pub coinbase_tag: String,
    /// Multiplier applied to the daemon coinbase value
    #[serde(default = "default_reward_multiplier")]
    pub block_reward_multiplier: f64,
    #[serde(default)]
    pub zcash: Option<ZcashChainConfig>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// Bind address of the health/metrics HTTP listener
    #[serde(default = "default_api_bind")]
    pub api_bind: String,
    #[serde(default = "default_equihash_threads")]
    pub equihash_max_threads: usize,
    #[serde(default)]
    pub banning: ClusterBanningConfig,
    pub pools: Vec<PoolConfig>,
}

fn default_true() -> bool { true }
fn default_proxy_addresses() -> Vec<IpAddr> {
    vec![IpAddr::from([127, 0, 0, 1]), IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 1])]
}
fn default_listen_address() -> String { "0.0.0.0".to_string() }
fn default_check_threshold() -> u32 { 50 }
fn default_invalid_percent() -> f64 { 50.0 }
fn default_ban_time() -> u64 { 600 }
fn default_treasury_interval() -> u64 { 1 }
fn default_client_timeout() -> u64 { 600 }
fn default_rebroadcast() -> u64 { 55 }
fn default_block_refresh() -> u64 { 1000 }
fn default_coinbase_tag() -> String { "/stratum-pool/".to_string() }
fn default_reward_multiplier() -> f64 { 1.0 }
fn default_cluster_name() -> String { "stratum-pool".to_string() }
fn default_api_bind() -> String { "127.0.0.1:4000".to_string() }
fn default_equihash_threads() -> usize { 1 }

impl ClusterConfig {
    /// Load the cluster configuration from `path`, then apply `STRATUM_POOL_*`
    /// environment overrides and normalise zero values.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let txt = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        let mut cfg = Self::from_json(&txt).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })?;

        if let Ok(b) = std::env::var("STRATUM_POOL_API_BIND") { cfg.api_bind = b; }
        if let Ok(n) = std::env::var("STRATUM_POOL_CLUSTER_NAME") { cfg.cluster_name = n; }
        if let Ok(t) = std::env::var("STRATUM_POOL_EQUIHASH_THREADS") {
            cfg.equihash_max_threads = t.parse().unwrap_or(cfg.equihash_max_threads);
        }

        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(txt: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(txt)
    }

    fn normalize(&mut self) {
        if self.equihash_max_threads == 0 {
            self.equihash_max_threads = default_equihash_threads();
        }
        for pool in &mut self.pools {
            if pool.block_refresh_interval == 0 {
                pool.block_refresh_interval = default_block_refresh();
            }
            if pool.block_reward_multiplier <= 0.0 {
                pool.block_reward_multiplier = default_reward_multiplier();
            }
            if pool.banning.check_threshold == 0 {
                pool.banning.check_threshold = default_check_threshold();
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_ports = std::collections::HashSet::new();
        for pool in self.pools.iter().filter(|p| p.enabled) {
            if pool.id.trim().is_empty() {
                return Err(ConfigError::Invalid("pool id must not be empty".into()));
            }
            if pool.address.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("pool {}: address must not be empty", pool.id)));
            }
            if pool.daemons.is_empty() {
                return Err(ConfigError::Invalid(format!("pool {}: no daemons configured", pool.id)));
            }
            if pool.ports.is_empty() {
                return Err(ConfigError::Invalid(format!("pool {}: no stratum ports configured", pool.id)));
            }
            if pool.algorithm != HashAlgorithmKind::Sha256d && pool.family != CoinFamilyKind::Bitcoin {
                return Err(ConfigError::Invalid(format!(
                    "pool {}: algorithm {:?} is only available to the bitcoin family",
                    pool.id, pool.algorithm
                )));
            }
            for (port, endpoint) in &pool.ports {
                if *port != 0 && !seen_ports.insert(*port) {
                    return Err(ConfigError::Invalid(format!("port {} is used by more than one pool", port)));
                }
                if endpoint.difficulty <= 0.0 {
                    return Err(ConfigError::Invalid(format!(
                        "pool {} port {}: difficulty must be positive",
                        pool.id, port
                    )));
                }
                if let Some(vd) = &endpoint.var_diff {
                    vd.validate().map_err(|source| ConfigError::VarDiff {
                        pool: pool.id.clone(),
                        port: *port,
                        source,
                    })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "cluster_name": "eu1",
        "banning": { "manager": "integrated", "ban_on_junk_receive": false },
        "pools": [{
            "id": "btc1",
            "family": "bitcoin",
            "coin": "BTC",
            "address": "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080",
            "ports": {
                "3333": { "difficulty": 0.5, "var_diff": {
                    "min_diff": 0.1, "max_diff": 1024, "target_time": 15,
                    "retarget_time": 90, "variance_percent": 30
                }},
                "3334": { "difficulty": 64,
                    "tcp_proxy_protocol": { "enable": true, "mandatory": true } }
            },
            "daemons": [{ "host": "127.0.0.1", "port": 18443, "user": "u", "password": "p" }],
            "banning": { "enabled": true, "check_threshold": 30, "invalid_percent": 40, "time": 300 }
        }]
    }"#;

    #[test]
    fn test_parse_sample_config() {
        let mut cfg = ClusterConfig::from_json(SAMPLE).unwrap();
        cfg.normalize();
        cfg.validate().unwrap();

        assert_eq!(cfg.cluster_name, "eu1");
        assert!(!cfg.banning.ban_on_junk_receive);
        assert!(cfg.banning.ban_on_invalid_shares);

        let pool = &cfg.pools[0];
        assert_eq!(pool.family, CoinFamilyKind::Bitcoin);
        assert_eq!(pool.ports.len(), 2);
        assert_eq!(pool.client_connection_timeout, 600);
        assert_eq!(pool.banning.check_threshold, 30);

        let vd = pool.ports[&3333].var_diff.as_ref().unwrap();
        assert_eq!(vd.max_diff, Some(1024.0));

        let proxy = pool.ports[&3334].tcp_proxy_protocol.as_ref().unwrap();
        assert!(proxy.mandatory);
        assert!(proxy.proxy_addresses.contains(&"127.0.0.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_daemon_url() {
        let d = DaemonEndpointConfig {
            host: "node".into(),
            port: 8332,
            user: None,
            password: None,
            ssl: true,
            http_path: Some("rpc".into()),
        };
        assert_eq!(d.url(), "https://node:8332/rpc");
    }

    #[test]
    fn test_rejects_pool_without_daemons() {
        let mut cfg = ClusterConfig::from_json(SAMPLE).unwrap();
        cfg.pools[0].daemons.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_bad_var_diff() {
        let mut cfg = ClusterConfig::from_json(SAMPLE).unwrap();
        let endpoint = cfg.pools[0].ports.get_mut(&3333).unwrap();
        endpoint.var_diff.as_mut().unwrap().min_diff = -1.0;
        match cfg.validate() {
            Err(ConfigError::VarDiff { pool, port, source }) => {
                assert_eq!(pool, "btc1");
                assert_eq!(port, 3333);
                assert_eq!(source, VarDiffConfigError::NonPositiveMinDiff);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_algorithm_selection() {
        let cfg = ClusterConfig::from_json(SAMPLE).unwrap();
        assert_eq!(cfg.pools[0].algorithm, HashAlgorithmKind::Sha256d);

        let ltc = SAMPLE.replace(r#""coin": "BTC","#, r#""coin": "LTC", "algorithm": "scrypt","#);
        let cfg = ClusterConfig::from_json(&ltc).unwrap();
        assert_eq!(cfg.pools[0].algorithm, HashAlgorithmKind::Scrypt);
        cfg.validate().unwrap();

        let mut cfg = cfg;
        cfg.pools[0].family = CoinFamilyKind::Ethereum;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_last_founders_reward_height() {
        let z = ZcashChainConfig {
            founders_reward_subsidy_halving_interval: 840_000,
            founders_reward_subsidy_slow_start_interval: 20_000,
            ..Default::default()
        };
        assert_eq!(z.last_founders_reward_height(), 849_999);
    }
}
