use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[default]
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "user" | "human" => Role::User,
            "assistant" | "ai" => Role::Assistant,
            _ => Role::Unknown,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub title: String,
    pub locator: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub last_updated: DateTime<Utc>,
}

impl Record {
    pub fn from_stub(stub: Stub, now: DateTime<Utc>) -> Self {
        Self {
            id: stub.id,
            title: stub.title,
            locator: stub.locator,
            messages: Vec::new(),
            last_updated: now,
        }
    }

    pub fn is_content_indexed(&self) -> bool {
        !self.messages.is_empty()
    }
}

pub type RecordMap = IndexMap<String, Record>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Absent,
    Fresh,
    Expired,
}

/// Keys always equal the `id` of the record stored under them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: RecordMap,
    built_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_records(
        records: impl IntoIterator<Item = Record>,
        built_at: Option<DateTime<Utc>>,
    ) -> Self {
        let records = records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<RecordMap>();
        Self { records, built_at }
    }

    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id.clone(), record)
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn set_built_at(&mut self, built_at: Option<DateTime<Utc>>) {
        self.built_at = built_at;
    }

    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.built_at.map(|t| now - t)
    }

    pub fn freshness(&self, now: DateTime<Utc>, ttl: Duration) -> Freshness {
        match self.age(now) {
            Some(age) if age > ttl => Freshness::Expired,
            Some(_) => Freshness::Fresh,
            None if self.records.is_empty() => Freshness::Absent,
            None => Freshness::Expired,
        }
    }

    pub fn content_indexed_count(&self) -> usize {
        self.records.values().filter(|r| r.is_content_indexed()).count()
    }

    pub fn as_map(&self) -> &RecordMap {
        &self.records
    }

    pub fn into_records(self) -> RecordMap {
        self.records
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawStub {
    pub id: Option<String>,
    pub title: Option<String>,
    pub locator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stub {
    pub id: String,
    pub title: String,
    pub locator: String,
}

impl RawStub {
    pub fn id_only(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn resolve(self, ordinal: usize) -> Option<Stub> {
        let id = self
            .id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())?;
        let title = self
            .title
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| placeholder_title(ordinal));
        let locator = self
            .locator
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| id.clone());
        Some(Stub { id, title, locator })
    }
}

pub fn placeholder_title(ordinal: usize) -> String {
    format!("Chat {ordinal}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveRecord {
    pub id: String,
    pub title_hint: Option<String>,
    pub locator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentQuery {
    pub query: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend failed: {0}")]
    Backend(String),
    #[error("stored value under `{key}` is corrupt")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("extraction source unavailable: {0}")]
    Unavailable(String),
    #[error("failed reading {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse {what}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown record `{0}`")]
    UnknownRecord(String),
}

pub trait KvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

impl<T: KvStore + ?Sized> KvStore for &T {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }
    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

impl<T: KvStore + ?Sized> KvStore for Rc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }
    fn remove(&self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

pub trait KvStoreExt: KvStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageError::Corrupt {
                key: key.to_string(),
                source,
            })
    }

    fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value).map_err(|source| StorageError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        self.set(key, &raw)
    }
}

impl<T: KvStore + ?Sized> KvStoreExt for T {}

pub type StubListing = Vec<Result<RawStub, ExtractError>>;

pub trait RecordExtractor {
    /// Every discoverable stub. An `Err` item is a single stub that failed;
    /// an outer `Err` means the listing as a whole could not be produced.
    fn list_stubs(&self) -> Result<StubListing, ExtractError>;

    fn active_record(&self) -> Option<ActiveRecord>;

    fn extract_active_content(&self) -> Result<Vec<Message>, ExtractError>;

    fn open_record(&mut self, id: &str, locator: &str) -> Result<(), ExtractError>;
}

pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Cell<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.now.set(now);
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    fn record(id: &str, title: &str) -> Record {
        Record {
            id: id.to_string(),
            title: title.to_string(),
            locator: format!("/c/{id}"),
            messages: vec![],
            last_updated: Utc::now(),
        }
    }

    #[derive(Default)]
    struct MapStore(RefCell<HashMap<String, String>>);

    impl KvStore for MapStore {
        fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            Ok(self.0.borrow().get(key).cloned())
        }
        fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.0.borrow_mut().insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.0.borrow_mut().remove(key);
            Ok(())
        }
    }

    #[test]
    fn role_from_label() {
        assert_eq!(Role::from_label("user"), Role::User);
        assert_eq!(Role::from_label(" Assistant "), Role::Assistant);
        assert_eq!(Role::from_label("tool"), Role::Unknown);
        assert_eq!(Role::from_label(""), Role::Unknown);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn stub_without_id_is_dropped() {
        assert!(RawStub::default().resolve(1).is_none());
        let blank = RawStub {
            id: Some("   ".to_string()),
            ..RawStub::default()
        };
        assert!(blank.resolve(1).is_none());
    }

    #[test]
    fn stub_title_falls_back_to_placeholder() {
        let stub = RawStub {
            id: Some("abc".to_string()),
            title: Some("  ".to_string()),
            locator: Some("/c/abc".to_string()),
        }
        .resolve(7)
        .unwrap();
        assert_eq!(stub.title, "Chat 7");
        assert_eq!(stub.locator, "/c/abc");
    }

    #[test]
    fn stub_locator_defaults_to_id() {
        let stub = RawStub::id_only("abc").resolve(1).unwrap();
        assert_eq!(stub.locator, "abc");
    }

    #[test]
    fn snapshot_keys_follow_record_ids() {
        let snap = Snapshot::from_records(vec![record("a", "A"), record("b", "B")], None);
        for r in snap.records() {
            assert_eq!(snap.get(&r.id), Some(r));
        }
        assert_eq!(snap.ids().collect::<Vec<_>>(), vec!["a", "b"]);

        let listed = Snapshot::from_records(vec![record("z", "Z"), record("a", "A")], None);
        assert_eq!(listed.ids().collect::<Vec<_>>(), vec!["z", "a"]);
    }

    #[test]
    fn freshness_states() {
        let now = Utc::now();
        let ttl = Duration::hours(24);
        assert_eq!(Snapshot::empty().freshness(now, ttl), Freshness::Absent);

        let never_built = Snapshot::from_records(vec![record("a", "A")], None);
        assert_eq!(never_built.freshness(now, ttl), Freshness::Expired);
        assert!(never_built.age(now).is_none());

        let fresh = Snapshot::from_records(vec![], Some(now - ttl));
        assert_eq!(fresh.freshness(now, ttl), Freshness::Fresh);

        let expired = Snapshot::from_records(vec![], Some(now - ttl - Duration::seconds(1)));
        assert_eq!(expired.freshness(now, ttl), Freshness::Expired);
    }

    #[test]
    fn record_serializes_camel_case() {
        let json = serde_json::to_value(record("a", "A")).unwrap();
        assert!(json.get("lastUpdated").is_some());
        assert!(json.get("last_updated").is_none());
    }

    #[test]
    fn kv_json_roundtrip_and_corruption() {
        let store = MapStore::default();
        store.set_json("k", &vec![1, 2, 3]).unwrap();
        let back: Option<Vec<i32>> = store.get_json("k").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        store.set("bad", "{not json").unwrap();
        let err = store.get_json::<Vec<i32>>("bad").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { ref key, .. } if key == "bad"));

        assert!(store.get_json::<Vec<i32>>("missing").unwrap().is_none());
    }

    #[test]
    fn manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(5));
        assert_eq!(clock.now(), start + Duration::seconds(5));
        let by_ref: &dyn Clock = &&clock;
        assert_eq!(by_ref.now(), start + Duration::seconds(5));
    }
}
