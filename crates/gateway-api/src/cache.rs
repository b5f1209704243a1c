//! Result cache with stampede protection
//!
//! Entries are keyed by a [`Fingerprint`] of the request shape. A lookup
//! either finds a live `Ready` value, joins an in-flight computation
//! (`Pending`), or becomes the leader that computes the value.
//!
//! Policy is wait-and-share: at most one computation per fingerprint runs at
//! a time and every waiter receives the leader's outcome. Failures are handed
//! to the waiters but never stored. If the leader is cancelled, its `Pending`
//! slot is removed and a waiter takes over.
//!
//! Expired entries are replaced lazily on lookup. When the table is full the
//! expired entries go first, then the ones closest to expiry.
//!
//! ## Configuration
//!
//! - `DATAPRODUCT_CACHE_TTL_SECS`: entry lifetime (default: 300)
//! - `DATAPRODUCT_CACHE_MAX_ENTRIES`: capacity (default: 100)

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dataproduct_gateway_core::env::env_parse;
use dataproduct_gateway_core::{FilterSet, GatewayError, Pagination, Result};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Default entry lifetime in seconds
const DEFAULT_TTL_SECS: u64 = 300;

/// Default capacity
const DEFAULT_MAX_ENTRIES: usize = 100;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            ttl_secs: env_parse("DATAPRODUCT_CACHE_TTL_SECS", DEFAULT_TTL_SECS),
            max_entries: env_parse("DATAPRODUCT_CACHE_MAX_ENTRIES", DEFAULT_MAX_ENTRIES),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.ttl_secs == 0 {
            return Err("cache ttl_secs must be > 0".to_string());
        }
        if self.max_entries == 0 {
            return Err("cache max_entries must be > 0".to_string());
        }
        Ok(())
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Deterministic identity of a cacheable request shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash (dataset, filters, pagination, stream flag).
    ///
    /// Every field is length-prefixed, so distinct inputs never collide by
    /// concatenation.
    pub fn compute(
        dataset: &str,
        filters: &FilterSet,
        pagination: Option<Pagination>,
        stream: bool,
    ) -> Self {
        fn field(hasher: &mut Sha256, bytes: &[u8]) {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, dataset.as_bytes());
        hasher.update((filters.len() as u64).to_le_bytes());
        for (column, value) in filters.iter() {
            field(&mut hasher, column.as_bytes());
            field(&mut hasher, value.as_bytes());
        }
        match pagination {
            Some(page) => {
                hasher.update([1u8]);
                hasher.update(page.limit.to_le_bytes());
                hasher.update(page.offset.to_le_bytes());
            }
            None => hasher.update([0u8]),
        }
        hasher.update([u8::from(stream)]);

        Fingerprint(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from a live entry
    Hit,
    /// Received from a computation another request was already running
    Shared,
    /// Computed by this request
    Miss,
}

impl CacheStatus {
    /// Value for the `X-Cache` response header.
    pub fn header_value(&self) -> &'static str {
        match self {
            CacheStatus::Hit | CacheStatus::Shared => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

type Outcome<V> = Option<std::result::Result<Arc<V>, GatewayError>>;

enum Slot<V> {
    Pending {
        generation: u64,
        receiver: watch::Receiver<Outcome<V>>,
    },
    Ready {
        value: Arc<V>,
        expires_at: Instant,
    },
}

enum Step<V> {
    Hit(Arc<V>),
    Wait(watch::Receiver<Outcome<V>>),
    Lead(u64, watch::Sender<Outcome<V>>),
}

/// Removes the leader's `Pending` slot unless the leader stored a value.
struct PendingGuard<'a, V> {
    entries: &'a DashMap<Fingerprint, Slot<V>>,
    key: Fingerprint,
    generation: u64,
    armed: bool,
}

impl<V> PendingGuard<'_, V> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<V> Drop for PendingGuard<'_, V> {
    fn drop(&mut self) {
        if self.armed {
            let generation = self.generation;
            self.entries.remove_if(&self.key, |_, slot| {
                matches!(slot, Slot::Pending { generation: g, .. } if *g == generation)
            });
        }
    }
}

pub struct CacheManager<V> {
    config: CacheConfig,
    entries: DashMap<Fingerprint, Slot<V>>,
    generation: AtomicU64,
}

impl<V: Send + Sync + 'static> CacheManager<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the cached value for `fingerprint` or compute it.
    ///
    /// `compute` runs at most once per call and only when this request is the
    /// leader. No lock is held while it runs.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> Result<(Arc<V>, CacheStatus)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let mut compute = Some(compute);

        loop {
            let step = self.lookup(fingerprint);

            match step {
                Step::Hit(value) => {
                    debug!(fingerprint = %fingerprint, "Cache hit");
                    return Ok((value, CacheStatus::Hit));
                }
                Step::Wait(mut receiver) => {
                    debug!(fingerprint = %fingerprint, "Waiting on in-flight computation");
                    let outcome = match receiver.wait_for(Option::is_some).await {
                        Ok(outcome) => outcome.clone(),
                        // Leader went away without an outcome; look again.
                        Err(_) => None,
                    };
                    match outcome {
                        Some(Ok(value)) => return Ok((value, CacheStatus::Shared)),
                        Some(Err(e)) => return Err(e),
                        None => continue,
                    }
                }
                Step::Lead(generation, sender) => {
                    let Some(compute) = compute.take() else {
                        return Err(GatewayError::Internal(
                            "cache computation already consumed".to_string(),
                        ));
                    };
                    let guard = PendingGuard {
                        entries: &self.entries,
                        key: fingerprint.clone(),
                        generation,
                        armed: true,
                    };

                    match compute().await {
                        Ok(value) => {
                            let value = Arc::new(value);
                            self.make_room();
                            self.entries.insert(
                                fingerprint.clone(),
                                Slot::Ready {
                                    value: Arc::clone(&value),
                                    expires_at: Instant::now() + self.config.ttl(),
                                },
                            );
                            guard.disarm();
                            let _ = sender.send(Some(Ok(Arc::clone(&value))));
                            return Ok((value, CacheStatus::Miss));
                        }
                        Err(e) => {
                            drop(guard);
                            let _ = sender.send(Some(Err(e.clone())));
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Step<V> {
        let now = Instant::now();
        match self.entries.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = match occupied.get() {
                    Slot::Ready { value, expires_at } if *expires_at > now => {
                        Some(Step::Hit(Arc::clone(value)))
                    }
                    Slot::Pending { receiver, .. } => Some(Step::Wait(receiver.clone())),
                    Slot::Ready { .. } => None,
                };
                match existing {
                    Some(step) => step,
                    None => {
                        debug!(fingerprint = %fingerprint, "Cache entry expired");
                        let (slot, step) = self.pending_slot();
                        occupied.insert(slot);
                        step
                    }
                }
            }
            Entry::Vacant(vacant) => {
                let (slot, step) = self.pending_slot();
                vacant.insert(slot);
                step
            }
        }
    }

    fn pending_slot(&self) -> (Slot<V>, Step<V>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        (
            Slot::Pending {
                generation,
                receiver,
            },
            Step::Lead(generation, sender),
        )
    }

    /// Evict until a new `Ready` entry fits. `Pending` slots are never evicted.
    fn make_room(&self) {
        let now = Instant::now();
        let ready = |entries: &DashMap<Fingerprint, Slot<V>>| {
            entries
                .iter()
                .filter(|e| matches!(e.value(), Slot::Ready { .. }))
                .count()
        };

        if ready(&self.entries) < self.config.max_entries {
            return;
        }

        self.entries
            .retain(|_, slot| !matches!(slot, Slot::Ready { expires_at, .. } if *expires_at <= now));

        while ready(&self.entries) >= self.config.max_entries {
            let oldest = self
                .entries
                .iter()
                .filter_map(|e| match e.value() {
                    Slot::Ready { expires_at, .. } => Some((e.key().clone(), *expires_at)),
                    Slot::Pending { .. } => None,
                })
                .min_by_key(|(_, expires_at)| *expires_at);

            let Some((key, _)) = oldest else {
                break;
            };
            debug!(fingerprint = %key, "Evicting cache entry");
            self.entries
                .remove_if(&key, |_, slot| matches!(slot, Slot::Ready { .. }));
        }
    }

    /// Number of live `Ready` entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready { expires_at, .. } if *expires_at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
