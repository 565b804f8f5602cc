// Short-lived record of which client ips recently polled which watch keys. Used to
// answer whether an instance is still actively watching a namespace.
use crate::config::InstanceCacheConfig;
use crate::metrics_defs::{INSTANCE_CACHE_HIT, INSTANCE_CACHE_MISS};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use shared::counter;
use std::time::Duration;

pub struct InstanceActivityCache {
    cache: Cache<String, ()>,
}

impl InstanceActivityCache {
    pub fn new(config: &InstanceCacheConfig) -> Self {
        // Entries are only ever written, so LRU order is write order and the
        // oldest stamp is evicted first once the cache is full.
        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(Duration::from_secs(config.ttl_secs))
            .eviction_policy(EvictionPolicy::lru())
            .build();

        InstanceActivityCache { cache }
    }

    fn entry_key(watch_key: &str, client_ip: &str) -> String {
        format!("{watch_key}+{client_ip}")
    }

    pub fn record(&self, watch_key: &str, client_ip: &str) {
        self.cache.insert(Self::entry_key(watch_key, client_ip), ());
    }

    pub fn is_active(&self, watch_key: &str, client_ip: &str) -> bool {
        self.cache
            .contains_key(&Self::entry_key(watch_key, client_ip))
    }

    /// True if `client_ip` polled any of `watch_keys` within the TTL.
    pub fn is_any_active<'a>(
        &self,
        watch_keys: impl IntoIterator<Item = &'a String>,
        client_ip: &str,
    ) -> bool {
        let hit = watch_keys
            .into_iter()
            .any(|key| self.is_active(key, client_ip));
        let metric_def = if hit {
            INSTANCE_CACHE_HIT
        } else {
            INSTANCE_CACHE_MISS
        };
        counter!(metric_def).increment(1);
        hit
    }
}
