//! Credential pools
//!
//! Each provider family owns a round-robin pool of API keys with a
//! per-key cooldown. The rotation index and cooldown map are shared by every
//! build in the process, so all access goes through one mutex.

use crate::providers::ProviderRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// How long a rate-limited key is skipped
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

const PLACEHOLDER_KEYS: [&str; 3] = ["none", "your-key-here", "your-api-key"];

/// Rotating key set of one family
#[derive(Debug, Clone)]
pub struct KeyPool {
    family: String,
    keys: Vec<String>,
    index: usize,
    cooldowns: HashMap<String, Instant>,
    rotations: u64,
    cooldown: Duration,
}

impl KeyPool {
    /// Pool over `keys`; blanks, placeholders and duplicates are dropped
    pub fn new(family: impl Into<String>, keys: impl IntoIterator<Item = String>) -> Self {
        let mut seen = HashSet::new();
        let keys = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && !PLACEHOLDER_KEYS.contains(&k.to_ascii_lowercase().as_str()))
            .filter(|k| seen.insert(k.clone()))
            .collect();
        Self {
            family: family.into(),
            keys,
            index: 0,
            cooldowns: HashMap::new(),
            rotations: 0,
            cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Pool from `<STEM>_API_KEYS` (comma-separated), else `<STEM>_API_KEY`
    pub fn from_lookup<F>(family: &str, env_stem: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = lookup(&format!("{}_API_KEYS", env_stem)).filter(|v| !v.trim().is_empty());
        let keys: Vec<String> = match set {
            Some(list) => list.split(',').map(str::to_string).collect(),
            None => lookup(&format!("{}_API_KEY", env_stem)).into_iter().collect(),
        };
        Self::new(family, keys)
    }

    /// Pool from the process environment
    pub fn from_env(family: &str, env_stem: &str) -> Self {
        Self::from_lookup(family, env_stem, |name| std::env::var(name).ok())
    }

    /// Override the cooldown applied by [`mark_limited`](Self::mark_limited)
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Family id
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the pool holds no key
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Next key not cooling down; when all are cooling, the one at the cursor
    pub fn next_key(&mut self, now: Instant) -> Option<String> {
        if self.keys.is_empty() {
            return None;
        }
        let n = self.keys.len();
        for _ in 0..n {
            let key = &self.keys[self.index % n];
            let ready = self.cooldowns.get(key).map(|until| now >= *until).unwrap_or(true);
            self.index = (self.index + 1) % n;
            if ready {
                return Some(key.clone());
            }
        }
        Some(self.keys[self.index % n].clone())
    }

    /// Put `key` on cooldown; the cursor already points past it
    pub fn mark_limited(&mut self, key: &str, now: Instant) {
        self.cooldowns.insert(key.to_string(), now + self.cooldown);
        self.rotations += 1;
    }

    /// Rate-limit rotations so far
    pub fn rotations(&self) -> u64 {
        self.rotations
    }
}

/// Key pools of every family behind one lock
#[derive(Debug, Default)]
pub struct KeyRing {
    pools: Mutex<HashMap<String, KeyPool>>,
}

impl KeyRing {
    /// Empty ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a pool for every family of `registry` from the environment
    pub fn from_env(registry: &ProviderRegistry) -> Self {
        let ring = Self::new();
        for family in registry.families() {
            let pool = KeyPool::from_env(&family.id, &family.env_stem);
            if pool.len() > 1 {
                tracing::info!(family = %family.id, keys = pool.len(), "Key pool loaded");
            }
            ring.insert(pool);
        }
        ring
    }

    /// Add or replace a pool
    pub fn insert(&self, pool: KeyPool) {
        self.lock().insert(pool.family().to_string(), pool);
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with_pool(self, pool: KeyPool) -> Self {
        self.insert(pool);
        self
    }

    /// Keys configured for `family`
    pub fn pool_size(&self, family: &str) -> usize {
        self.lock().get(family).map(KeyPool::len).unwrap_or(0)
    }

    /// Select the next usable key of `family`
    pub fn next_key(&self, family: &str) -> Option<String> {
        let now = Instant::now();
        self.lock().get_mut(family).and_then(|pool| pool.next_key(now))
    }

    /// Cool `key` down
    pub fn mark_limited(&self, family: &str, key: &str) {
        let now = Instant::now();
        if let Some(pool) = self.lock().get_mut(family) {
            pool.mark_limited(key, now);
            tracing::info!(
                family = %family,
                key_suffix = %key_suffix(key),
                rotations = pool.rotations(),
                "Rate limited - key cooling down"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, KeyPool>> {
        self.pools.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn key_suffix(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let start = chars.len().saturating_sub(6);
    format!("...{}", chars[start..].iter().collect::<String>())
}
