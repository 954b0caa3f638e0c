use chrono::{DateTime, Duration, Utc};
use core_model::{
    Clock, Freshness, KvStore, KvStoreExt, RecentQuery, Record, RecordMap, Snapshot, SystemClock,
};
use tracing::{debug, info, warn};

pub const CACHE_KEY: &str = "chatdex_search_cache";
pub const TIMESTAMP_KEY: &str = "chatdex_cache_timestamp";
pub const RECENT_KEY: &str = "chatdex_recent_searches";

pub const DEFAULT_TTL_HOURS: i64 = 24;
pub const MAX_RECENT_SEARCHES: usize = 10;

pub fn default_ttl() -> Duration {
    Duration::hours(DEFAULT_TTL_HOURS)
}

/// Persistence failures are logged, never returned.
pub struct CacheStore<S, C = SystemClock> {
    store: S,
    clock: C,
    ttl: Duration,
    snapshot: Snapshot,
}

impl<S: KvStore> CacheStore<S, SystemClock> {
    pub fn open(store: S, ttl: Duration) -> Self {
        Self::with_clock(store, SystemClock, ttl)
    }
}

impl<S: KvStore, C: Clock> CacheStore<S, C> {
    pub fn with_clock(store: S, clock: C, ttl: Duration) -> Self {
        let snapshot = read_snapshot(&store);
        debug!(
            records = snapshot.len(),
            built_at = ?snapshot.built_at(),
            "cache opened"
        );
        Self {
            store,
            clock,
            ttl,
            snapshot,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn peek(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Clears the cache and returns an empty snapshot once it has expired.
    pub fn load(&mut self) -> Snapshot {
        let now = self.clock.now();
        if self.snapshot.freshness(now, self.ttl) == Freshness::Expired {
            info!(
                records = self.snapshot.len(),
                age = ?self.snapshot.age(now),
                "cache expired, clearing"
            );
            self.clear();
            return Snapshot::empty();
        }
        self.snapshot.clone()
    }

    pub fn replace(&mut self, records: RecordMap) {
        let now = self.clock.now();
        self.snapshot = Snapshot::from_records(records.into_values(), Some(now));
        self.persist_records();
        if let Err(err) = self.store.set_json(TIMESTAMP_KEY, &now) {
            warn!(error = %err, "failed to persist cache timestamp");
        }
        info!(records = self.snapshot.len(), "cache replaced");
    }

    /// Leaves `built_at` alone.
    pub fn upsert(&mut self, record: Record) {
        debug!(id = %record.id, messages = record.messages.len(), "cache upsert");
        self.snapshot.insert(record);
        self.persist_records();
    }

    pub fn clear(&mut self) {
        self.snapshot = Snapshot::empty();
        for key in [CACHE_KEY, TIMESTAMP_KEY] {
            if let Err(err) = self.store.remove(key) {
                warn!(key, error = %err, "failed to remove cache key");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.snapshot.get(id)
    }

    pub fn age(&self) -> Option<Duration> {
        self.snapshot.age(self.clock.now())
    }

    pub fn freshness(&self) -> Freshness {
        self.snapshot.freshness(self.clock.now(), self.ttl)
    }

    pub fn needs_initial_build(&self) -> bool {
        self.snapshot.is_empty() || self.freshness() != Freshness::Fresh
    }

    fn persist_records(&self) {
        if let Err(err) = self.store.set_json(CACHE_KEY, self.snapshot.as_map()) {
            warn!(error = %err, "failed to persist cache records");
        }
    }
}

fn read_snapshot(store: &impl KvStore) -> Snapshot {
    let records = match store.get_json::<RecordMap>(CACHE_KEY) {
        Ok(records) => records.unwrap_or_default(),
        Err(err) => {
            warn!(error = %err, "unreadable cache records, starting empty");
            RecordMap::new()
        }
    };
    let built_at = match store.get_json::<DateTime<Utc>>(TIMESTAMP_KEY) {
        Ok(ts) => ts,
        Err(err) => {
            warn!(error = %err, "unreadable cache timestamp");
            None
        }
    };
    let mismatched = records.iter().filter(|(k, r)| **k != r.id).count();
    if mismatched > 0 {
        warn!(mismatched, "cache keys disagree with record ids, rekeying");
    }
    Snapshot::from_records(records.into_values(), built_at)
}

pub struct RecentQueryLog<S, C = SystemClock> {
    store: S,
    clock: C,
    max_entries: usize,
    entries: Vec<RecentQuery>,
}

impl<S: KvStore> RecentQueryLog<S, SystemClock> {
    pub fn open(store: S, max_entries: usize) -> Self {
        Self::with_clock(store, SystemClock, max_entries)
    }
}

impl<S: KvStore, C: Clock> RecentQueryLog<S, C> {
    pub fn with_clock(store: S, clock: C, max_entries: usize) -> Self {
        let mut entries = match store.get_json::<Vec<RecentQuery>>(RECENT_KEY) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(err) => {
                warn!(error = %err, "unreadable recent searches, starting empty");
                Vec::new()
            }
        };
        entries.truncate(max_entries);
        Self {
            store,
            clock,
            max_entries,
            entries,
        }
    }

    pub fn add(&mut self, query: &str) {
        if query.trim().is_empty() {
            return;
        }
        self.entries.retain(|e| e.query != query);
        self.entries.insert(
            0,
            RecentQuery {
                query: query.to_string(),
                timestamp: self.clock.now(),
            },
        );
        self.entries.truncate(self.max_entries);
        if let Err(err) = self.store.set_json(RECENT_KEY, &self.entries) {
            warn!(error = %err, "failed to persist recent searches");
        }
    }

    pub fn list(&self) -> &[RecentQuery] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        if let Err(err) = self.store.remove(RECENT_KEY) {
            warn!(error = %err, "failed to remove recent searches");
        }
    }
}
