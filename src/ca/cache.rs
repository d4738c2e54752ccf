//! On-demand leaf certificates, cached per hostname.
//!
//! Leaves are signed lazily by the store's current root and reused until they
//! expire, fall out of the LRU window, or the root they chain to is replaced.
//! Concurrent requests for a hostname that is not cached share a single
//! signing operation.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::OffsetDateTime;
use tracing::debug;

use super::encoder::{self, Certificate, Validity};
use super::flight::{Role, SingleFlight};
use super::key::KeyMaterial;
use super::root::CaEntry;
use super::store::TrustStore;
use crate::config::LeafSettings;
use crate::error::{CaError, CaResult};

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// A signed leaf and everything needed to serve it.
pub struct LeafEntry {
    hostname: String,
    key: KeyMaterial,
    certificate: Certificate,
    root: Arc<CaEntry>,
    certified: Arc<CertifiedKey>,
}

impl LeafEntry {
    fn new(
        hostname: String,
        key: KeyMaterial,
        certificate: Certificate,
        root: Arc<CaEntry>,
    ) -> CaResult<Self> {
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.private_key_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(|e| CaError::issuance(&hostname, e))?;
        let chain = vec![certificate.der().clone(), root.certificate().der().clone()];

        Ok(Self {
            hostname,
            key,
            certificate,
            root,
            certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        })
    }

    /// The normalised hostname this leaf was issued for.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn key(&self) -> &KeyMaterial {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// The root that signed this leaf.
    pub fn root(&self) -> &Arc<CaEntry> {
        &self.root
    }

    /// Leaf plus root chain and signing key, ready for rustls.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.certificate.is_expired_at(now)
    }

    /// Usable at `now` and chained to `root`.
    fn is_fresh(&self, root: &Arc<CaEntry>, now: OffsetDateTime) -> bool {
        !self.is_expired_at(now) && Arc::ptr_eq(&self.root, root)
    }
}

impl std::fmt::Debug for LeafEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafEntry")
            .field("hostname", &self.hostname)
            .field("serial", &self.certificate.serial_hex())
            .field("not_after", &self.certificate.not_after())
            .finish_non_exhaustive()
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Signing operations performed.
    pub issued: u64,
    /// Callers that waited on another caller's signing.
    pub coalesced: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    issued: AtomicU64,
    coalesced: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Arc<LeafEntry>>,
    /// Least recently used at the front.
    recency: VecDeque<String>,
}

impl CacheState {
    fn touch(&mut self, hostname: &str) {
        if let Some(pos) = self.recency.iter().position(|h| h == hostname) {
            self.recency.remove(pos);
        }
        self.recency.push_back(hostname.to_string());
    }

    fn remove(&mut self, hostname: &str) -> Option<Arc<LeafEntry>> {
        if let Some(pos) = self.recency.iter().position(|h| h == hostname) {
            self.recency.remove(pos);
        }
        self.entries.remove(hostname)
    }
}

/// Issues and caches leaf certificates signed by a [`TrustStore`]'s root.
///
/// The store must be bootstrapped before the first [`issue`](Self::issue).
pub struct LeafCertCache {
    store: Arc<TrustStore>,
    settings: LeafSettings,
    state: Mutex<CacheState>,
    flights: SingleFlight<Arc<LeafEntry>>,
    counters: Counters,
}

impl LeafCertCache {
    pub fn new(store: Arc<TrustStore>, settings: LeafSettings) -> Self {
        Self {
            store,
            settings,
            state: Mutex::new(CacheState::default()),
            flights: SingleFlight::new(),
            counters: Counters::default(),
        }
    }

    /// Builds a shared cache and, when `settings.sweep_interval_secs` is
    /// set, starts its background sweeper.
    pub fn start(store: Arc<TrustStore>, settings: LeafSettings) -> Arc<Self> {
        let interval = settings.sweep_interval();
        let cache = Arc::new(Self::new(store, settings));
        if let Some(interval) = interval {
            debug!("sweeping leaf cache every {:?}", interval);
            cache.spawn_sweeper(interval);
        }
        cache
    }

    pub fn store(&self) -> &Arc<TrustStore> {
        &self.store
    }

    /// Returns a valid leaf for `hostname`, signing one if needed.
    ///
    /// `hostname` may carry a port, a trailing dot, or brackets around an
    /// IPv6 literal; these are stripped before lookup.
    pub fn issue(&self, hostname: &str) -> CaResult<Arc<LeafEntry>> {
        let host = normalize_hostname(hostname)?;
        let entry = self.issue_normalized(&host)?;
        if self.is_current(&entry) {
            return Ok(entry);
        }
        // The root was replaced while this request waited on another signer.
        debug!("root changed during issuance for {}, signing again", host);
        self.issue_normalized(&host)
    }

    fn issue_normalized(&self, host: &str) -> CaResult<Arc<LeafEntry>> {
        let host = host.to_string();
        let root = self
            .store
            .root()
            .ok_or_else(|| CaError::issuance(&host, "trust store has not been bootstrapped"))?;

        if let Some(entry) = self.lookup(&host, &root) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry);
        }

        match self.flights.join(&host) {
            Role::Follower(flight) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!("waiting for in-flight certificate for {}", host);
                flight.wait().map_err(|reason| CaError::issuance(&host, reason))
            }
            Role::Leader(guard) => {
                // Another leader may have finished between the lookup and join.
                if let Some(entry) = self.lookup(&host, &root) {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    guard.complete(Ok(Arc::clone(&entry)));
                    return Ok(entry);
                }
                self.counters.misses.fetch_add(1, Ordering::Relaxed);

                match self.sign(&host, &root) {
                    Ok(entry) => {
                        self.insert(Arc::clone(&entry));
                        guard.complete(Ok(Arc::clone(&entry)));
                        Ok(entry)
                    }
                    Err(e) => {
                        guard.complete(Err(e.to_string()));
                        Err(e)
                    }
                }
            }
        }
    }

    /// Drops expired leaves and leaves signed by a replaced root.
    /// Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let current_root = self.store.root();
        let mut state = self.lock_state();

        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| match &current_root {
                Some(root) => !entry.is_fresh(root, now),
                None => true,
            })
            .map(|(host, _)| host.clone())
            .collect();
        for host in &stale {
            state.remove(host);
        }

        if !stale.is_empty() {
            debug!("swept {} stale leaf certificates", stale.len());
        }
        stale.len()
    }

    /// Runs [`sweep_expired`](Self::sweep_expired) every `interval` on a
    /// background thread. The thread exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        thread::spawn(move || {
            loop {
                thread::sleep(interval);
                let Some(cache) = cache.upgrade() else {
                    debug!("leaf cache dropped, stopping sweeper");
                    break;
                };
                cache.sweep_expired();
            }
        })
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            issued: self.counters.issued.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.recency.clear();
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, entry: &LeafEntry) -> bool {
        self.store
            .root()
            .is_some_and(|root| Arc::ptr_eq(entry.root(), &root))
    }

    fn lookup(&self, host: &str, root: &Arc<CaEntry>) -> Option<Arc<LeafEntry>> {
        let mut state = self.lock_state();
        let entry = Arc::clone(state.entries.get(host)?);
        if entry.is_fresh(root, OffsetDateTime::now_utc()) {
            state.touch(host);
            Some(entry)
        } else {
            debug!("discarding stale certificate for {}", host);
            state.remove(host);
            None
        }
    }

    fn sign(&self, host: &str, root: &Arc<CaEntry>) -> CaResult<Arc<LeafEntry>> {
        let key = KeyMaterial::generate(self.settings.key_algorithm, self.settings.key_bits())
            .map_err(|e| CaError::issuance(host, e))?;
        let validity = Validity::for_duration(self.settings.validity())
            .map_err(|e| CaError::issuance(host, e))?;
        let certificate = encoder::sign_leaf(root, &key, host, &validity)
            .map_err(|e| CaError::issuance(host, e))?;
        self.counters.issued.fetch_add(1, Ordering::Relaxed);

        debug!(
            "issued certificate for {} (serial {}, expires {})",
            host,
            certificate.serial_hex(),
            certificate.not_after()
        );
        LeafEntry::new(host.to_string(), key, certificate, Arc::clone(root)).map(Arc::new)
    }

    fn insert(&self, entry: Arc<LeafEntry>) {
        let capacity = self.settings.cache_capacity;
        if capacity == 0 {
            return;
        }
        let mut state = self.lock_state();
        let host = entry.hostname().to_string();
        state.entries.insert(host.clone(), entry);
        state.touch(&host);

        while state.entries.len() > capacity {
            let Some(oldest) = state.recency.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("evicted certificate for {}", oldest);
        }
    }
}

impl std::fmt::Debug for LeafCertCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertCache")
            .field("capacity", &self.settings.cache_capacity)
            .field("len", &self.len())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

/// Canonical cache key for a requested host: trimmed, lowercased, without
/// port, brackets, or trailing dot. IP literals are re-rendered in canonical
/// form. Internationalised names must already be punycode.
pub fn normalize_hostname(raw: &str) -> CaResult<String> {
    let invalid = |reason: &str| CaError::Encoding(format!("invalid hostname {raw:?}: {reason}"));
    let trimmed = raw.trim();

    let host = if let Some(rest) = trimmed.strip_prefix('[') {
        let (inner, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
        if !tail.is_empty() && !tail.strip_prefix(':').is_some_and(is_port) {
            return Err(invalid("unexpected text after IPv6 literal"));
        }
        inner
    } else if trimmed.parse::<IpAddr>().is_ok() {
        trimmed
    } else {
        match trimmed.rsplit_once(':') {
            Some((host, port)) if is_port(port) => host,
            Some(_) => return Err(invalid("bad port")),
            None => trimmed,
        }
    };

    let host = host.strip_suffix('.').unwrap_or(host).to_ascii_lowercase();
    if host.is_empty() {
        return Err(invalid("empty"));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip.to_string());
    }

    encoder::check_subject_name(&host)?;
    if !host.is_ascii() {
        return Err(invalid("not ASCII"));
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(invalid("too long"));
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(invalid("bad label length"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with a hyphen"));
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(invalid("unexpected character"));
        }
    }
    Ok(host)
}

fn is_port(s: &str) -> bool {
    !s.is_empty() && s.parse::<u16>().is_ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::ca::key::KeyAlgorithm;
    use crate::config::StoreConfig;

    fn bootstrapped_store() -> (TempDir, Arc<TrustStore>) {
        let temp = tempdir().unwrap();
        let mut config = StoreConfig::default();
        config.ca.key_algorithm = KeyAlgorithm::EcdsaP256;
        let store = Arc::new(TrustStore::new(temp.path(), &config));
        store.bootstrap().unwrap();
        (temp, store)
    }

    fn cache_with(settings: LeafSettings) -> (TempDir, LeafCertCache) {
        let (temp, store) = bootstrapped_store();
        (temp, LeafCertCache::new(store, settings))
    }

    /// Tests that a second request is served from the cache.
    #[test]
    fn repeated_issue_is_cache_hit() {
        let (_temp, cache) = cache_with(LeafSettings::default());
        let first = cache.issue("example.com").unwrap();
        let second = cache.issue("example.com").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.certificate().serial(), second.certificate().serial());
        let metrics = cache.metrics();
        assert_eq!(metrics.issued, 1);
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    /// Tests that a leaf verifies against the root and names the host.
    #[test]
    fn leaf_chains_to_root() {
        let (_temp, cache) = cache_with(LeafSettings::default());
        let entry = cache.issue("api.example.com").unwrap();
        let root = cache.store().root().unwrap();

        root.verify(entry.certificate()).unwrap();
        assert!(Arc::ptr_eq(entry.root(), &root));
        let cert = entry.certificate();
        assert!(!cert.is_ca());
        assert!(cert.not_after() > cert.not_before());
        assert_eq!(cert.issuer(), root.certificate().subject());
        assert_eq!(
            cert.subject_alt_names(),
            &["api.example.com".to_string(), "*.example.com".to_string()]
        );
        assert_eq!(entry.certified_key().cert.len(), 2);
    }

    /// Tests that an IP literal gets an IP SAN.
    #[test]
    fn ip_literal_gets_ip_san() {
        let (_temp, cache) = cache_with(LeafSettings::default());
        let entry = cache.issue("[::1]:8443").unwrap();
        assert_eq!(entry.hostname(), "::1");
        assert_eq!(entry.certificate().subject_alt_names(), &["::1".to_string()]);
    }

    /// Tests that spellings of the same host share one entry.
    #[test]
    fn hostname_variants_share_entry() {
        let (_temp, cache) = cache_with(LeafSettings::default());
        let a = cache.issue("API.Example.COM.").unwrap();
        let b = cache.issue(" api.example.com:443 ").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    /// Tests hostname normalisation and rejection of malformed names.
    #[test]
    fn normalization() {
        assert_eq!(normalize_hostname("Example.com.").unwrap(), "example.com");
        assert_eq!(normalize_hostname("example.com:8080").unwrap(), "example.com");
        assert_eq!(normalize_hostname("10.0.0.1:443").unwrap(), "10.0.0.1");
        assert_eq!(normalize_hostname("[2001:DB8::1]").unwrap(), "2001:db8::1");
        assert_eq!(normalize_hostname("2001:db8::1").unwrap(), "2001:db8::1");

        for bad in [
            "",
            "   ",
            "exa mple.com",
            "example.com:http",
            "a..b",
            "-lead.example.com",
            "ex\u{7f}ample.com",
            "bücher.example",
            "[::1",
        ] {
            let err = normalize_hostname(bad).unwrap_err();
            assert!(matches!(err, CaError::Encoding(_)), "{bad:?}: {err}");
        }
    }

    /// Tests that concurrent requests for one host sign exactly once.
    #[test]
    fn concurrent_issue_signs_once() {
        const CALLERS: usize = 16;
        let (_temp, cache) = cache_with(LeafSettings::default());
        let cache = Arc::new(cache);
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.issue("burst.example.com").unwrap()
                })
            })
            .collect();
        let entries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        for entry in &entries {
            assert!(Arc::ptr_eq(entry, &entries[0]));
        }
        let metrics = cache.metrics();
        assert_eq!(metrics.issued, 1);
        assert_eq!(metrics.hits + metrics.coalesced + metrics.misses, CALLERS as u64);
    }

    /// Tests that an expired leaf is replaced with a new one.
    #[test]
    fn expired_leaf_is_reissued() {
        let settings = LeafSettings {
            validity_secs: 1,
            ..LeafSettings::default()
        };
        let (_temp, cache) = cache_with(settings);
        let first = cache.issue("short.example.com").unwrap();
        thread::sleep(Duration::from_millis(2100));

        let second = cache.issue("short.example.com").unwrap();
        assert_ne!(first.certificate().serial(), second.certificate().serial());
        assert!(second.certificate().not_after() > first.certificate().not_after());
        assert_eq!(cache.metrics().issued, 2);
    }

    /// Tests that the least recently used host is evicted first.
    #[test]
    fn lru_eviction() {
        let settings = LeafSettings {
            cache_capacity: 2,
            ..LeafSettings::default()
        };
        let (_temp, cache) = cache_with(settings);
        let a = cache.issue("a.example.com").unwrap();
        cache.issue("b.example.com").unwrap();
        cache.issue("a.example.com").unwrap();
        cache.issue("c.example.com").unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.metrics().evictions, 1);
        assert!(Arc::ptr_eq(&a, &cache.issue("a.example.com").unwrap()));
        cache.issue("b.example.com").unwrap();
        assert_eq!(cache.metrics().issued, 4);
    }

    /// Tests that capacity 0 signs every request.
    #[test]
    fn zero_capacity_disables_caching() {
        let settings = LeafSettings {
            cache_capacity: 0,
            ..LeafSettings::default()
        };
        let (_temp, cache) = cache_with(settings);
        let first = cache.issue("nocache.example.com").unwrap();
        let second = cache.issue("nocache.example.com").unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(cache.is_empty());
        assert_eq!(cache.metrics().issued, 2);
    }

    /// Tests that issuance before bootstrap fails with an issuance error.
    #[test]
    fn issue_requires_bootstrap() {
        let temp = tempdir().unwrap();
        let store = Arc::new(TrustStore::at(temp.path()));
        let cache = LeafCertCache::new(store, LeafSettings::default());

        let err = cache.issue("example.com").unwrap_err();
        assert!(matches!(err, CaError::Issuance { .. }), "{err}");
    }

    /// Tests that regenerating the root invalidates leaves signed by the old one.
    #[test]
    fn regenerated_root_invalidates_leaves() {
        let (_temp, cache) = cache_with(LeafSettings::default());
        let old = cache.issue("rotate.example.com").unwrap();

        let new_root = cache.store().regenerate().unwrap();
        let fresh = cache.issue("rotate.example.com").unwrap();

        assert!(!Arc::ptr_eq(&old, &fresh));
        new_root.verify(fresh.certificate()).unwrap();
        assert!(new_root.verify(old.certificate()).is_err());
        assert_eq!(cache.sweep_expired(), 0);
    }

    /// Tests that a sweep removes expired leaves.
    #[test]
    fn sweep_removes_expired() {
        let settings = LeafSettings {
            validity_secs: 1,
            ..LeafSettings::default()
        };
        let (_temp, cache) = cache_with(settings);
        cache.issue("one.example.com").unwrap();
        cache.issue("two.example.com").unwrap();
        assert_eq!(cache.sweep_expired(), 0);

        thread::sleep(Duration::from_millis(2100));
        assert_eq!(cache.sweep_expired(), 2);
        assert!(cache.is_empty());
    }

    /// Tests that the sweeper thread cleans up and exits with the cache.
    #[test]
    fn background_sweeper() {
        let settings = LeafSettings {
            validity_secs: 1,
            ..LeafSettings::default()
        };
        let (_temp, cache) = cache_with(settings);
        let cache = Arc::new(cache);
        cache.issue("sweep.example.com").unwrap();

        let handle = cache.spawn_sweeper(Duration::from_millis(50));
        thread::sleep(Duration::from_millis(2300));
        assert!(cache.is_empty());

        drop(cache);
        handle.join().unwrap();
    }

    /// Tests that a configured sweep interval starts the sweeper.
    #[test]
    fn start_runs_configured_sweeper() {
        let settings = LeafSettings {
            validity_secs: 1,
            sweep_interval_secs: Some(1),
            ..LeafSettings::default()
        };
        let (_temp, store) = bootstrapped_store();
        let cache = LeafCertCache::start(store, settings);
        cache.issue("auto.example.com").unwrap();
        assert_eq!(cache.len(), 1);

        thread::sleep(Duration::from_millis(3500));
        assert!(cache.is_empty());
    }

    /// Tests that without a sweep interval nothing is removed behind the caller.
    #[test]
    fn start_without_interval_keeps_entries() {
        let settings = LeafSettings {
            validity_secs: 1,
            sweep_interval_secs: None,
            ..LeafSettings::default()
        };
        let (_temp, store) = bootstrapped_store();
        let cache = LeafCertCache::start(store, settings);
        cache.issue("manual.example.com").unwrap();

        thread::sleep(Duration::from_millis(2100));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.sweep_expired(), 1);
    }

    /// Tests that a leaf lifetime past year 9999 is an issuance error.
    #[test]
    fn unrepresentable_leaf_lifetime_fails() {
        let settings = LeafSettings {
            validity_secs: u64::MAX,
            ..LeafSettings::default()
        };
        let (_temp, cache) = cache_with(settings);
        let err = cache.issue("example.com").unwrap_err();
        assert!(matches!(err, CaError::Issuance { .. }), "{err}");
        assert!(cache.is_empty());
    }

    /// Tests that a caller waiting on a signer that used a since-replaced
    /// root gets a leaf from the current root.
    #[test]
    fn waiter_resigns_after_root_replaced() {
        let (_temp, cache) = cache_with(LeafSettings::default());
        let cache = Arc::new(cache);
        let old_root = cache.store().root().unwrap();

        let Role::Leader(guard) = cache.flights.join("race.example.com") else {
            panic!("no flight should exist yet");
        };
        let waiter = {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.issue("race.example.com").unwrap())
        };
        while cache.metrics().coalesced == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        let stale = cache.sign("race.example.com", &old_root).unwrap();
        let new_root = cache.store().regenerate().unwrap();
        guard.complete(Ok(stale));

        let entry = waiter.join().unwrap();
        assert!(Arc::ptr_eq(entry.root(), &new_root));
        new_root.verify(entry.certificate()).unwrap();
    }

    /// Tests that clear empties the cache without touching counters.
    #[test]
    fn clear_empties_cache() {
        let (_temp, cache) = cache_with(LeafSettings::default());
        cache.issue("a.example.com").unwrap();
        cache.issue("b.example.com").unwrap();
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.metrics().issued, 2);
    }
}
