//! Process-wide pool of this party's private pre-keys.
//!
//! Long-term and one-time keys are named by the id of the card that
//! publishes them. Ephemeral keys generated by initiators are named
//! `eph-<hex public key>`. All sessions of a process share one pool, so
//! one-time key consumption goes through [`LocalKeyPool::claim_one_time`],
//! which removes the key under the pool lock.
//!
//! The pool lives in memory. A process that must answer handshakes addressed
//! to cards it published before a restart persists a [`KeyPoolSnapshot`] and
//! rebuilds its pool with [`LocalKeyPool::restore`].

use {
    crate::{cards::CardId, crypto::secret_bytes::SecretBytes},
    chrono::{DateTime, Duration, Utc},
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, HashMap},
        sync::{Mutex, MutexGuard},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    LongTerm,
    OneTime,
    Ephemeral,
}

/// A private key held by the pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolKey {
    pub kind: KeyKind,
    pub private_key: SecretBytes,
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl PoolKey {
    pub fn new(kind: KeyKind, private_key: &[u8], public_key: Vec<u8>) -> Self {
        Self {
            kind,
            private_key: SecretBytes::from(private_key),
            public_key,
            created_at: Utc::now(),
        }
    }
}

/// Name used for an initiator's ephemeral key.
pub fn ephemeral_key_name(public_key: &[u8]) -> String {
    format!("eph-{}", hex::encode(public_key))
}

/// Serialisable copy of every key in a [`LocalKeyPool`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeyPoolSnapshot {
    keys: BTreeMap<String, PoolKey>,
}

impl KeyPoolSnapshot {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Default)]
pub struct LocalKeyPool {
    keys: Mutex<HashMap<String, PoolKey>>,
}

impl LocalKeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a pool from a snapshot taken by [`LocalKeyPool::snapshot`].
    pub fn restore(snapshot: KeyPoolSnapshot) -> Self {
        Self {
            keys: Mutex::new(snapshot.keys.into_iter().collect()),
        }
    }

    /// Copy of every key currently held, ephemeral keys included.
    pub fn snapshot(&self) -> KeyPoolSnapshot {
        KeyPoolSnapshot {
            keys: self
                .keys()
                .iter()
                .map(|(name, key)| (name.clone(), key.clone()))
                .collect(),
        }
    }

    fn keys(&self) -> MutexGuard<'_, HashMap<String, PoolKey>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a key under `name`, replacing any key with the same name.
    pub fn insert(&self, name: impl Into<String>, key: PoolKey) {
        self.keys().insert(name.into(), key);
    }

    pub fn get(&self, name: &str) -> Option<PoolKey> {
        self.keys().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.keys().contains_key(name)
    }

    /// Take the one-time key named `name` out of the pool. At most one caller
    /// ever receives a given key.
    pub fn claim_one_time(&self, name: &str) -> Option<PoolKey> {
        let mut keys = self.keys();

        if keys.get(name).is_some_and(|k| k.kind == KeyKind::OneTime) {
            keys.remove(name)
        } else {
            None
        }
    }

    /// Put a claimed one-time key back, e.g. when derivation failed after the
    /// claim.
    pub fn release_one_time(&self, name: &str, key: PoolKey) {
        let mut keys = self.keys();

        if key.kind == KeyKind::OneTime && !keys.contains_key(name) {
            keys.insert(name.to_string(), key);
        }
    }

    /// Delete a key. Returns whether it was present.
    pub fn retire(&self, name: &str) -> bool {
        self.keys().remove(name).is_some()
    }

    pub fn count(&self, kind: KeyKind) -> usize {
        self.keys().values().filter(|k| k.kind == kind).count()
    }

    /// Newest long-term key created within `max_age` of `now`.
    pub fn active_long_term(&self, now: DateTime<Utc>, max_age: Duration) -> Option<CardId> {
        self.keys()
            .iter()
            .filter(|(_, k)| k.kind == KeyKind::LongTerm && now - k.created_at < max_age)
            .max_by_key(|(_, k)| k.created_at)
            .map(|(name, _)| CardId::from(name.as_str()))
    }

    /// Drop one-time keys older than `one_time_max_age` and long-term keys
    /// older than `long_term_max_age`. The newest long-term key is always
    /// kept. Ephemeral keys are never touched here. Returns the retired names.
    pub fn retire_expired(
        &self,
        now: DateTime<Utc>,
        long_term_max_age: Duration,
        one_time_max_age: Duration,
    ) -> Vec<String> {
        let mut keys = self.keys();

        let newest_long_term = keys
            .iter()
            .filter(|(_, k)| k.kind == KeyKind::LongTerm)
            .max_by_key(|(_, k)| k.created_at)
            .map(|(name, _)| name.clone());

        let expired = keys
            .iter()
            .filter(|(name, k)| match k.kind {
                KeyKind::OneTime => now - k.created_at >= one_time_max_age,
                KeyKind::LongTerm => {
                    Some(*name) != newest_long_term.as_ref()
                        && now - k.created_at >= long_term_max_age
                }
                KeyKind::Ephemeral => false,
            })
            .map(|(name, _)| name.clone())
            .collect::<Vec<_>>();

        for name in &expired {
            keys.remove(name);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    fn key(kind: KeyKind, age_days: i64) -> PoolKey {
        let mut key = PoolKey::new(kind, &[1u8; 32], vec![2u8; 32]);
        key.created_at = Utc::now() - Duration::days(age_days);
        key
    }

    #[test]
    fn test_claim_is_single_use() {
        let pool = LocalKeyPool::new();
        pool.insert("ot-1", key(KeyKind::OneTime, 0));

        assert!(pool.claim_one_time("ot-1").is_some());
        assert!(pool.claim_one_time("ot-1").is_none());
        assert_eq!(pool.count(KeyKind::OneTime), 0);
    }

    #[test]
    fn test_claim_ignores_other_kinds() {
        let pool = LocalKeyPool::new();
        pool.insert("lt-1", key(KeyKind::LongTerm, 0));

        assert!(pool.claim_one_time("lt-1").is_none());
        assert!(pool.contains("lt-1"));
    }

    #[test]
    fn test_release_puts_key_back() {
        let pool = LocalKeyPool::new();
        pool.insert("ot-1", key(KeyKind::OneTime, 0));

        let claimed = pool.claim_one_time("ot-1").unwrap();
        pool.release_one_time("ot-1", claimed);
        assert!(pool.claim_one_time("ot-1").is_some());
    }

    #[test]
    fn test_concurrent_claims_have_one_winner() {
        let pool = Arc::new(LocalKeyPool::new());
        pool.insert("ot-1", key(KeyKind::OneTime, 0));

        let handles = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.claim_one_time("ot-1").is_some())
            })
            .collect::<Vec<_>>();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_active_long_term_is_newest_unexpired() {
        let pool = LocalKeyPool::new();
        pool.insert("lt-old", key(KeyKind::LongTerm, 10));
        pool.insert("lt-new", key(KeyKind::LongTerm, 1));

        let now = Utc::now();
        assert_eq!(
            pool.active_long_term(now, Duration::days(7)),
            Some(CardId::from("lt-new"))
        );
        assert_eq!(pool.active_long_term(now, Duration::hours(1)), None);
    }

    #[test]
    fn test_retire_expired() {
        let pool = LocalKeyPool::new();
        pool.insert("ot-stale", key(KeyKind::OneTime, 40));
        pool.insert("ot-fresh", key(KeyKind::OneTime, 1));
        pool.insert("lt-stale", key(KeyKind::LongTerm, 30));
        pool.insert("lt-only-newest", key(KeyKind::LongTerm, 20));
        pool.insert("eph-1", key(KeyKind::Ephemeral, 90));

        let mut retired =
            pool.retire_expired(Utc::now(), Duration::days(14), Duration::days(30));
        retired.sort();

        assert_eq!(retired, vec!["lt-stale".to_string(), "ot-stale".to_string()]);
        assert!(pool.contains("lt-only-newest"));
        assert!(pool.contains("ot-fresh"));
        assert!(pool.contains("eph-1"));
    }

    #[test]
    fn test_snapshot_restores_every_key() {
        let pool = LocalKeyPool::new();
        pool.insert("lt-1", key(KeyKind::LongTerm, 3));
        pool.insert("ot-1", key(KeyKind::OneTime, 0));
        pool.insert("ot-2", key(KeyKind::OneTime, 0));
        pool.claim_one_time("ot-2").unwrap();

        let json = pool.snapshot().to_json().unwrap();
        let snapshot = KeyPoolSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot.len(), 2);

        let restored = LocalKeyPool::restore(snapshot);
        let original = pool.get("lt-1").unwrap();
        let copy = restored.get("lt-1").unwrap();
        assert_eq!(copy.private_key.as_slice(), original.private_key.as_slice());
        assert_eq!(copy.public_key, original.public_key);
        assert_eq!(copy.created_at, original.created_at);

        // Claimed keys stay spent after a restore.
        assert!(restored.claim_one_time("ot-1").is_some());
        assert!(restored.claim_one_time("ot-2").is_none());
    }

    #[test]
    fn test_snapshot_json_parsing() {
        assert!(KeyPoolSnapshot::from_json("{\"keys\":{}}").unwrap().is_empty());
        assert!(KeyPoolSnapshot::from_json("not json").is_err());
    }

    #[test]
    fn test_ephemeral_name() {
        assert_eq!(ephemeral_key_name(&[0xab, 0x01]), "eph-ab01");
    }
}
