use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::error::Error;
use crate::keys::{FetchKeys, KeySet};

// Keys and their expiry instant always change together; the lock guarantees
// readers never observe a torn pair.
#[derive(Clone, Debug)]
struct CacheState {
    keys: Arc<KeySet>,
    expires_at: DateTime<Utc>,
}

///
/// Cache of the issuer's signing keys, bounded by the server-declared
/// max-age.
///
/// The only shared mutable state in the crate. Verification takes the read
/// lock just long enough to snapshot the current key set; refresh holds the
/// write lock across the fetch, which is acceptable because refreshes are
/// bounded by the max-age (typically hours).
///
#[derive(Debug)]
pub(crate) struct KeyCache {
    state: RwLock<CacheState>,
}

impl KeyCache {
    /// Starts empty and already expired, so the first verification triggers
    /// a refresh.
    pub fn new() -> Self {
        KeyCache {
            state: RwLock::new(CacheState {
                keys: Arc::new(KeySet::default()),
                expires_at: DateTime::<Utc>::MIN_UTC,
            }),
        }
    }

    /// True once `now` has reached the recorded expiry instant. Comparing
    /// instants avoids the drift that accumulating `now - last_update`
    /// deltas would introduce.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.state.read().unwrap().expires_at
    }

    /// Snapshot of the current key set.
    pub fn keys(&self) -> Arc<KeySet> {
        Arc::clone(&self.state.read().unwrap().keys)
    }

    /// Replaces the cached keys through the fetcher if they are still stale
    /// once the exclusive lock is held.
    ///
    /// The staleness re-check is the double-checked guard: concurrent callers
    /// that all observed a stale cache serialize here, the first performs the
    /// network fetch, and the rest see the fresh expiry and return without
    /// fetching. On failure the previous state is left completely unchanged,
    /// keeping stale-but-complete keys usable.
    pub fn refresh<F: FetchKeys>(&self, now: DateTime<Utc>, fetcher: &F) -> Result<(), Error> {
        let mut state = self.state.write().unwrap();
        if now < state.expires_at {
            return Ok(());
        }

        let (keys, max_age) = fetcher.fetch()?;
        log::debug!("refreshed signing keys: {} keys, max-age {}s", keys.len(), max_age);
        state.keys = Arc::new(keys);
        // The max-age is server-controlled; clamp instead of trusting it to
        // stay within datetime range.
        let max_age = Duration::seconds(max_age.min(i64::MAX as u64 / 1_000) as i64);
        state.expires_at = now
            .checked_add_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::sync::OnceLock;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    use super::*;

    struct StubFetcher {
        result: Result<(KeySet, u64), Error>,
        calls: Cell<usize>,
    }

    impl StubFetcher {
        fn returning(result: Result<(KeySet, u64), Error>) -> Self {
            StubFetcher {
                result,
                calls: Cell::new(0),
            }
        }
    }

    impl FetchKeys for StubFetcher {
        fn fetch(&self) -> Result<(KeySet, u64), Error> {
            self.calls.set(self.calls.get() + 1);
            self.result.clone()
        }
    }

    fn key_set(kids: &[&str]) -> KeySet {
        static PUBLIC: OnceLock<RsaPublicKey> = OnceLock::new();
        let public = PUBLIC.get_or_init(|| {
            let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("key");
            RsaPublicKey::from(&key)
        });
        kids.iter()
            .map(|kid| (kid.to_string(), public.clone()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn new_cache_is_stale_and_empty() {
        let cache = KeyCache::new();
        assert!(cache.is_stale(at(0)));
        assert_eq!(cache.keys().len(), 0);
    }

    #[test]
    fn refresh_sets_keys_and_expiry() {
        let cache = KeyCache::new();
        let fetcher = StubFetcher::returning(Ok((key_set(&["kid-1", "kid-2"]), 19008)));

        cache.refresh(at(1000), &fetcher).expect("refresh");
        assert_eq!(cache.keys().len(), 2);
        assert_eq!(cache.state.read().unwrap().expires_at, at(1000 + 19008));
    }

    #[test]
    fn freshness_is_monotonic_until_expiry() {
        let cache = KeyCache::new();
        let fetcher = StubFetcher::returning(Ok((key_set(&["kid-1"]), 60)));
        cache.refresh(at(1000), &fetcher).expect("refresh");

        assert!(!cache.is_stale(at(1000)));
        assert!(!cache.is_stale(at(1059)));
        assert!(cache.is_stale(at(1060)));
        assert!(cache.is_stale(at(2000)));
    }

    #[test]
    fn second_refresh_without_elapsed_time_skips_the_fetch() {
        let cache = KeyCache::new();
        let fetcher = StubFetcher::returning(Ok((key_set(&["kid-1"]), 60)));

        cache.refresh(at(1000), &fetcher).expect("refresh");
        cache.refresh(at(1000), &fetcher).expect("refresh");
        assert_eq!(fetcher.calls.get(), 1);
    }

    #[test]
    fn stale_cache_refreshes_again() {
        let cache = KeyCache::new();
        let fetcher = StubFetcher::returning(Ok((key_set(&["kid-1"]), 60)));

        cache.refresh(at(1000), &fetcher).expect("refresh");
        cache.refresh(at(1060), &fetcher).expect("refresh");
        assert_eq!(fetcher.calls.get(), 2);
        assert_eq!(cache.state.read().unwrap().expires_at, at(1120));
    }

    #[test]
    fn failed_refresh_leaves_previous_state_untouched() {
        let cache = KeyCache::new();
        let good = StubFetcher::returning(Ok((key_set(&["kid-1"]), 60)));
        cache.refresh(at(1000), &good).expect("refresh");
        let before = cache.keys();

        let bad = StubFetcher::returning(Err(Error::KeyFetchFailed("boom".to_string())));
        assert_eq!(
            cache.refresh(at(1060), &bad),
            Err(Error::KeyFetchFailed("boom".to_string()))
        );
        assert_eq!(*cache.keys(), *before);
        assert_eq!(cache.state.read().unwrap().expires_at, at(1060));
    }
}
