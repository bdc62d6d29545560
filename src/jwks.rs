//! JWKS key resolution for referral-ticket validation.
//!
//! No HTTP client lives here: the actual key fetch is the injected
//! [`JwksKeysource`]'s job. This module caches the resolved key per `kid` so
//! a hit never touches the keysource again, and throttles only the *miss*
//! path (an unresolved `kid`, or one whose last resolution attempt failed),
//! the same separation `claw_auth::jwt` draws between `JwtConfig` (key
//! material) and the transport that delivers it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Minimum interval between two upstream refreshes for the same `kid` that
/// both miss the cache, to resist key-id enumeration abuse. Does not apply
/// to cache hits, and distinct `kid`s are throttled independently.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// External collaborator that resolves a JWKS key id to an Ed25519 public
/// key. Implemented by the colony runtime's JWKS fetcher; this crate only
/// consumes it.
pub trait JwksKeysource: Send + Sync {
    /// Resolves `kid` to a raw Ed25519 public key (32 bytes), refreshing the
    /// underlying key set if the id isn't already known.
    fn get_key_by_kid(&self, kid: &str) -> Result<Vec<u8>>;
}

/// One cached `kid` resolution: the key, if the last attempt succeeded, and
/// when that attempt happened.
struct CacheEntry {
    key: Option<Vec<u8>>,
    last_refresh: Instant,
}

/// Wraps a [`JwksKeysource`] with a per-`kid` key cache and a floor on how
/// often a cache miss is allowed to re-enter the keysource.
pub struct JwksCache<K> {
    keysource: K,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl<K: JwksKeysource> JwksCache<K> {
    #[must_use]
    pub fn new(keysource: K) -> Self {
        Self {
            keysource,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves `kid`. A cached key is returned immediately, with no
    /// throttling — only a miss (unseen `kid`, or one whose last resolution
    /// failed) re-enters the keysource, and misses for the same `kid` are
    /// throttled to [`MIN_REFRESH_INTERVAL`]. A miss that hits the floor
    /// gets `Error::PolicyViolation` rather than a stale key, since a
    /// referral ticket that can't be resolved yet should fail closed.
    pub fn get_key_by_kid(&self, kid: &str) -> Result<Vec<u8>> {
        {
            let cache = self
                .cache
                .lock()
                .map_err(|e| Error::Storage(format!("JWKS cache lock poisoned: {e}")))?;
            if let Some(entry) = cache.get(kid) {
                if let Some(key) = &entry.key {
                    return Ok(key.clone());
                }
                if entry.last_refresh.elapsed() < MIN_REFRESH_INTERVAL {
                    return Err(Error::PolicyViolation(
                        "JWKS refresh requested before minimum interval elapsed".into(),
                    ));
                }
            }
        }

        let result = self.keysource.get_key_by_kid(kid);

        let mut cache = self
            .cache
            .lock()
            .map_err(|e| Error::Storage(format!("JWKS cache lock poisoned: {e}")))?;
        cache.insert(
            kid.to_string(),
            CacheEntry {
                key: result.as_ref().ok().cloned(),
                last_refresh: Instant::now(),
            },
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingKeysource {
        calls: AtomicU32,
        key: Vec<u8>,
    }

    impl JwksKeysource for CountingKeysource {
        fn get_key_by_kid(&self, _kid: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.key.clone())
        }
    }

    struct FailingKeysource {
        calls: AtomicU32,
    }

    impl JwksKeysource for FailingKeysource {
        fn get_key_by_kid(&self, kid: &str) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound(format!("no such kid: {kid}")))
        }
    }

    #[test]
    fn first_lookup_succeeds() {
        let cache = JwksCache::new(CountingKeysource {
            calls: AtomicU32::new(0),
            key: vec![1, 2, 3],
        });
        let key = cache.get_key_by_kid("kid-1").unwrap();
        assert_eq!(key, vec![1, 2, 3]);
    }

    #[test]
    fn repeat_lookup_of_cached_kid_is_a_hit_not_throttled() {
        let keysource = CountingKeysource {
            calls: AtomicU32::new(0),
            key: vec![1, 2, 3],
        };
        let cache = JwksCache::new(keysource);
        cache.get_key_by_kid("kid-1").unwrap();
        // A second lookup of an already-resolved kid is a cache hit: it must
        // succeed immediately and must not re-enter the keysource.
        let key = cache.get_key_by_kid("kid-1").unwrap();
        assert_eq!(key, vec![1, 2, 3]);
        assert_eq!(cache.keysource.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rapid_repeat_miss_of_same_kid_is_throttled() {
        let cache = JwksCache::new(FailingKeysource {
            calls: AtomicU32::new(0),
        });
        assert!(cache.get_key_by_kid("kid-1").is_err());
        let result = cache.get_key_by_kid("kid-1");
        assert!(matches!(result, Err(Error::PolicyViolation(_))));
        // The throttle floor prevented a second upstream call.
        assert_eq!(cache.keysource.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_kids_are_throttled_independently() {
        let cache = JwksCache::new(FailingKeysource {
            calls: AtomicU32::new(0),
        });
        assert!(cache.get_key_by_kid("kid-1").is_err());
        // A different kid's miss is unaffected by kid-1's just-set floor.
        assert!(matches!(
            cache.get_key_by_kid("kid-2"),
            Err(Error::NotFound(_))
        ));
    }
}
