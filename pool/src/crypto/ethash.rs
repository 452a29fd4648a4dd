/// Ethash light verification
///
/// Only the light path is used: the `ethash` crate builds the verification
/// cache (tens of MB per epoch) on the blocking pool and derives dataset
/// items from it on demand. The manager keeps the three most recently used
/// epochs and warms the next one in the background.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::OnceCell;

pub const EPOCH_LENGTH: u64 = 30_000;

/// Caches retained by [`EthashManager`].
pub const MAX_CACHED_EPOCHS: usize = 3;

pub fn epoch(block_number: u64) -> u64 {
    block_number / EPOCH_LENGTH
}

pub fn cache_size(epoch: u64) -> u64 {
    ::ethash::get_cache_size(epoch as usize) as u64
}

pub fn full_size(epoch: u64) -> u64 {
    ::ethash::get_full_size(epoch as usize) as u64
}

pub fn seed_hash(epoch: u64) -> [u8; 32] {
    ::ethash::get_seedhash(epoch as usize).0
}

/// Verification cache for one epoch.
pub struct EthashCache {
    pub epoch: u64,
    cache: Vec<u8>,
    full_size: u64,
}

impl EthashCache {
    pub fn generate(epoch: u64) -> Self {
        Self::with_sizes(epoch, cache_size(epoch), full_size(epoch), &seed_hash(epoch))
    }

    /// Build a cache of arbitrary geometry. Only epoch-derived sizes produce
    /// consensus-valid results.
    pub fn with_sizes(epoch: u64, cache_bytes: u64, full_size: u64, seed: &[u8; 32]) -> Self {
        let mut cache = vec![0u8; cache_bytes as usize];
        ::ethash::make_cache(&mut cache, (*seed).into());
        Self { epoch, cache, full_size }
    }

    pub fn full_size(&self) -> u64 {
        self.full_size
    }

    /// Returns `(mix_digest, result)` for a 32-byte header hash and nonce.
    pub fn hashimoto_light(&self, header_hash: &[u8; 32], nonce: u64) -> ([u8; 32], [u8; 32]) {
        let (mix, result) = ::ethash::hashimoto_light(
            (*header_hash).into(),
            nonce.to_be_bytes().into(),
            self.full_size as usize,
            &self.cache,
        );
        (mix.0, result.0)
    }
}

type CacheSlot = Arc<OnceCell<Arc<EthashCache>>>;

/// Most-recently-used set of epoch caches, shared by every Ethereum job.
#[derive(Clone)]
pub struct EthashManager {
    slots: Arc<Mutex<VecDeque<(u64, CacheSlot)>>>,
    /// Generate epoch + 1 in the background after each lookup
    lookahead: bool,
}

impl Default for EthashManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EthashManager {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(VecDeque::new())),
            lookahead: true,
        }
    }

    pub fn without_lookahead() -> Self {
        Self {
            lookahead: false,
            ..Self::new()
        }
    }

    /// Install an already generated cache.
    pub fn preload(&self, cache: EthashCache) {
        let epoch = cache.epoch;
        // an existing cache for the epoch wins
        let _ = self.slot(epoch).set(Arc::new(cache));
    }

    fn slot(&self, epoch: u64) -> CacheSlot {
        let mut slots = self.slots.lock();
        if let Some(pos) = slots.iter().position(|(e, _)| *e == epoch) {
            if let Some(entry) = slots.remove(pos) {
                let slot = entry.1.clone();
                slots.push_back(entry);
                return slot;
            }
        }
        let slot: CacheSlot = Arc::new(OnceCell::new());
        slots.push_back((epoch, slot.clone()));
        while slots.len() > MAX_CACHED_EPOCHS {
            if let Some((evicted, _)) = slots.pop_front() {
                tracing::debug!("Evicted ethash cache for epoch {}", evicted);
            }
        }
        slot
    }

    /// Cache for `epoch`, generating it if needed. Schedules the next epoch
    /// for background generation.
    pub async fn cache(&self, epoch: u64) -> anyhow::Result<Arc<EthashCache>> {
        let cache = self.load(epoch).await?;
        if !self.lookahead {
            return Ok(cache);
        }
        let next = self.clone();
        tokio::spawn(async move {
            if let Err(e) = next.load(epoch + 1).await {
                tracing::warn!("⚠️  Ethash pre-generation for epoch {} failed: {}", epoch + 1, e);
            }
        });
        Ok(cache)
    }

    async fn load(&self, epoch: u64) -> anyhow::Result<Arc<EthashCache>> {
        let slot = self.slot(epoch);
        let cache = slot
            .get_or_try_init(|| async move {
                tracing::info!("⏳ Generating ethash cache for epoch {}", epoch);
                let cache = tokio::task::spawn_blocking(move || EthashCache::generate(epoch)).await?;
                tracing::info!("✅ Ethash cache for epoch {} ready", epoch);
                Ok::<_, anyhow::Error>(Arc::new(cache))
            })
            .await?;
        Ok(cache.clone())
    }

    pub fn cached_epochs(&self) -> Vec<u64> {
        self.slots.lock().iter().map(|(e, _)| *e).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cache() -> EthashCache {
        // 1 KiB cache over a 4 KiB dataset keeps the test fast
        EthashCache::with_sizes(0, 1024, 4096, &seed_hash(0))
    }

    #[test]
    fn test_epoch_zero_sizes() {
        assert_eq!(cache_size(0), 16_776_896);
        assert_eq!(full_size(0), 1_073_739_904);
    }

    #[test]
    fn test_seed_hash() {
        assert_eq!(seed_hash(0), [0u8; 32]);
        assert_eq!(
            hex::encode(seed_hash(1)),
            "290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );
    }

    #[test]
    fn test_later_epoch_sizes() {
        assert_eq!(cache_size(1), 16_907_456);
        assert_eq!(full_size(1), 1_082_130_304);
    }

    #[test]
    fn test_epoch() {
        assert_eq!(epoch(0), 0);
        assert_eq!(epoch(29_999), 0);
        assert_eq!(epoch(30_000), 1);
    }

    #[test]
    fn test_hashimoto_is_deterministic() {
        let cache = tiny_cache();
        let header = [0x11u8; 32];
        let a = cache.hashimoto_light(&header, 42);
        let b = cache.hashimoto_light(&header, 42);
        assert_eq!(a, b);

        let c = cache.hashimoto_light(&header, 43);
        assert_ne!(a.1, c.1);
        assert_ne!(a.0, c.0);
    }

    #[tokio::test]
    async fn test_manager_keeps_three_epochs() {
        let manager = EthashManager::new();
        for e in [5u64, 6, 7, 8] {
            manager.slot(e);
        }
        assert_eq!(manager.cached_epochs(), vec![6, 7, 8]);

        // touching an epoch moves it to the back
        manager.slot(6);
        assert_eq!(manager.cached_epochs(), vec![7, 8, 6]);
    }

    #[tokio::test]
    async fn test_preloaded_cache_is_served() {
        let manager = EthashManager::without_lookahead();
        manager.preload(tiny_cache());
        let cache = manager.cache(0).await.unwrap();
        assert_eq!(cache.full_size(), 4096);
        assert_eq!(manager.cached_epochs(), vec![0]);
    }
}
