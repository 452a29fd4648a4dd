/// Remote address banning
///
/// Two interchangeable strategies: an in-process expiring table and a
/// delegate that inserts `iptables` DROP rules and removes them on expiry.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BanManagerKind, ClusterBanningConfig};
use crate::metrics::prometheus as metrics;

pub trait BanManager: Send + Sync {
    fn is_banned(&self, address: &IpAddr) -> bool;
    fn ban(&self, address: IpAddr, duration: Duration);
}

pub fn from_config(cfg: &ClusterBanningConfig) -> Arc<dyn BanManager> {
    match cfg.manager {
        BanManagerKind::Integrated => Arc::new(IntegratedBanManager::new()),
        BanManagerKind::IpTables => Arc::new(IpTablesBanManager::new()),
    }
}

/// Expiring in-memory ban table.
#[derive(Default)]
pub struct IntegratedBanManager {
    entries: Mutex<HashMap<IpAddr, Instant>>,
}

impl IntegratedBanManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_banned_at(&self, address: &IpAddr, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(address) {
            Some(expiry) if *expiry > now => true,
            Some(_) => {
                entries.remove(address);
                false
            }
            None => false,
        }
    }

    pub fn ban_at(&self, address: IpAddr, duration: Duration, now: Instant) {
        if duration.is_zero() {
            return;
        }
        let expiry = now + duration;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, until| *until > now);
        if entries.len() < before {
            tracing::debug!("Purged {} expired ban(s)", before - entries.len());
        }
        // never shorten an existing ban
        let slot = entries.entry(address).or_insert(expiry);
        if *slot < expiry {
            *slot = expiry;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BanManager for IntegratedBanManager {
    fn is_banned(&self, address: &IpAddr) -> bool {
        self.is_banned_at(address, Instant::now())
    }

    fn ban(&self, address: IpAddr, duration: Duration) {
        self.ban_at(address, duration, Instant::now());
        metrics::inc_bans();
    }
}

/// Delegates bans to the OS packet filter. Banned peers never reach the
/// listener, but the table is still consulted for connections that were
/// already established when the ban was issued.
pub struct IpTablesBanManager {
    table: Arc<IntegratedBanManager>,
    chain: String,
}

impl IpTablesBanManager {
    pub fn new() -> Self {
        Self {
            table: Arc::new(IntegratedBanManager::new()),
            chain: "INPUT".to_string(),
        }
    }

    fn rule_args(chain: &str, flag: &str, address: &IpAddr) -> Vec<String> {
        vec![
            flag.to_string(),
            chain.to_string(),
            "-s".to_string(),
            address.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]
    }

    async fn run_iptables(address: IpAddr, args: Vec<String>) {
        let binary = if address.is_ipv6() { "ip6tables" } else { "iptables" };
        match tokio::process::Command::new(binary).args(&args).status().await {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::warn!("⚠️  {} {} exited with {}", binary, args.join(" "), status),
            Err(e) => tracing::error!("Failed to run {}: {}", binary, e),
        }
    }
}

impl Default for IpTablesBanManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BanManager for IpTablesBanManager {
    fn is_banned(&self, address: &IpAddr) -> bool {
        self.table.is_banned(address)
    }

    fn ban(&self, address: IpAddr, duration: Duration) {
        if duration.is_zero() || self.table.is_banned(&address) {
            return;
        }
        self.table.ban(address, duration);

        let insert = Self::rule_args(&self.chain, "-I", &address);
        let delete = Self::rule_args(&self.chain, "-D", &address);
        // Outside a runtime there is nothing to schedule the removal on.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("⚠️  No runtime available, iptables ban for {} skipped", address);
            return;
        };
        handle.spawn(async move {
            Self::run_iptables(address, insert).await;
            tokio::time::sleep(duration).await;
            Self::run_iptables(address, delete).await;
            tracing::debug!("iptables ban for {} lifted", address);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_ban_and_expiry() {
        let bans = IntegratedBanManager::new();
        let now = Instant::now();
        bans.ban_at(addr(1), Duration::from_secs(60), now);

        assert!(bans.is_banned_at(&addr(1), now + Duration::from_secs(59)));
        assert!(!bans.is_banned_at(&addr(2), now));
        assert!(!bans.is_banned_at(&addr(1), now + Duration::from_secs(61)));
        // expired entry was dropped on lookup
        assert!(bans.is_empty());
    }

    #[test]
    fn test_ban_never_shortened() {
        let bans = IntegratedBanManager::new();
        let now = Instant::now();
        bans.ban_at(addr(1), Duration::from_secs(600), now);
        bans.ban_at(addr(1), Duration::from_secs(5), now);
        assert!(bans.is_banned_at(&addr(1), now + Duration::from_secs(300)));
    }

    #[test]
    fn test_zero_duration_is_ignored() {
        let bans = IntegratedBanManager::new();
        bans.ban(addr(3), Duration::ZERO);
        assert!(!bans.is_banned(&addr(3)));
    }

    #[test]
    fn test_new_ban_purges_expired_entries() {
        let bans = IntegratedBanManager::new();
        let now = Instant::now();
        for i in 0..10_000u32 {
            let ip = IpAddr::from(std::net::Ipv4Addr::from(0x0b00_0000 + i));
            bans.ban_at(ip, Duration::from_millis(1), now);
        }
        bans.ban_at(addr(2), Duration::from_secs(100), now);
        assert_eq!(bans.len(), 10_001);

        // an hour later the next ban sweeps everything that has expired
        bans.ban_at(addr(3), Duration::from_secs(60), now + Duration::from_secs(3600));
        assert_eq!(bans.len(), 1);
        assert!(bans.is_banned_at(&addr(3), now + Duration::from_secs(3601)));
    }

    #[test]
    fn test_iptables_rule_args() {
        let args = IpTablesBanManager::rule_args("INPUT", "-I", &addr(9));
        assert_eq!(args.join(" "), "-I INPUT -s 10.0.0.9 -j DROP");
    }
}
