use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use cache::CacheStore;
use core_model::{
    ActiveRecord, Clock, KvStore, Message, RecordExtractor, RecordMap, Record, Snapshot, Stub,
};
use tracing::{debug, error, info, warn};

pub const ACTIVE_FALLBACK_TITLE: &str = "Current Chat";

#[derive(Debug, Clone)]
pub enum BuildMode {
    Full,
    Incremental(Snapshot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProgress {
    pub processed: usize,
    pub total: usize,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub snapshot: Snapshot,
    pub new_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Built { records: usize, added: usize },
    NoNewRecords,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub stub_delay: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            stub_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub settle_delay: Duration,
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(2000),
            attempts: 10,
            interval: Duration::from_millis(500),
        }
    }
}

impl PollPolicy {
    pub fn immediate(attempts: u32) -> Self {
        Self {
            settle_delay: Duration::ZERO,
            attempts,
            interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Skipped,
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub observed: Option<(String, Observation)>,
    pub new_records_available: bool,
}

enum Tally {
    Indexing,
    Adding,
}

impl Tally {
    fn message(&self, processed: usize, total: usize) -> String {
        match self {
            Tally::Indexing => format!("Indexing {processed}/{total} chats..."),
            Tally::Adding => format!("Adding {processed}/{total} new chats..."),
        }
    }
}

pub fn build(
    extractor: &dyn RecordExtractor,
    mode: BuildMode,
    clock: &dyn Clock,
    options: &BuildOptions,
    mut on_progress: impl FnMut(&BuildProgress),
) -> anyhow::Result<BuildOutcome> {
    let (existing, tally) = match mode {
        BuildMode::Full => (None, Tally::Indexing),
        BuildMode::Incremental(snapshot) => (Some(snapshot), Tally::Adding),
    };
    let mut working: RecordMap = existing
        .as_ref()
        .map(|s| s.as_map().clone())
        .unwrap_or_default();

    let listing = extractor.list_stubs().context("listing stubs")?;
    let discovered = listing.len();
    info!(discovered, existing = working.len(), "stubs listed");

    let mut seen = HashSet::new();
    let mut pending: Vec<Stub> = Vec::new();
    for (i, item) in listing.into_iter().enumerate() {
        let ordinal = i + 1;
        let raw = match item {
            Ok(raw) => raw,
            Err(err) => {
                warn!(ordinal, error = %err, "skipping stub");
                continue;
            }
        };
        let Some(stub) = raw.resolve(ordinal) else {
            debug!(ordinal, "dropping stub without id");
            continue;
        };
        if working.contains_key(&stub.id) || !seen.insert(stub.id.clone()) {
            continue;
        }
        pending.push(stub);
    }

    if let Some(snapshot) = existing
        && pending.is_empty()
    {
        info!("no new chats found");
        return Ok(BuildOutcome {
            snapshot,
            new_count: 0,
        });
    }

    let total = pending.len();
    for (n, stub) in pending.into_iter().enumerate() {
        let record = Record::from_stub(stub, clock.now());
        working.insert(record.id.clone(), record);
        let processed = n + 1;
        on_progress(&BuildProgress {
            processed,
            total,
            message: tally.message(processed, total),
        });
        if !options.stub_delay.is_zero() {
            std::thread::sleep(options.stub_delay);
        }
    }

    info!(added = total, records = working.len(), "build finished");
    Ok(BuildOutcome {
        snapshot: Snapshot::from_records(working.into_values(), Some(clock.now())),
        new_count: total,
    })
}

/// Any failure leaves the cache as it was.
pub fn run_build<S: KvStore, C: Clock>(
    cache: &mut CacheStore<S, C>,
    extractor: &dyn RecordExtractor,
    kind: BuildKind,
    options: &BuildOptions,
    on_progress: impl FnMut(&BuildProgress),
) -> BuildStatus {
    let mode = match kind {
        BuildKind::Full => BuildMode::Full,
        BuildKind::Incremental => BuildMode::Incremental(cache.load()),
    };
    let outcome = match build(extractor, mode, cache.clock(), options, on_progress) {
        Ok(outcome) => outcome,
        Err(err) => {
            let reason = format!("{err:#}");
            error!(error = %reason, "build failed");
            return BuildStatus::Failed { reason };
        }
    };
    if kind == BuildKind::Incremental && outcome.new_count == 0 {
        return BuildStatus::NoNewRecords;
    }
    cache.replace(outcome.snapshot.into_records());
    BuildStatus::Built {
        records: cache.len(),
        added: outcome.new_count,
    }
}

pub fn observe_active<S: KvStore, C: Clock>(
    cache: &mut CacheStore<S, C>,
    active: &ActiveRecord,
    messages: Vec<Message>,
) -> Observation {
    if messages.is_empty() {
        return Observation::Skipped;
    }
    let now = cache.now();
    let (record, observation) = match cache.get(&active.id) {
        Some(existing) => {
            let mut record = existing.clone();
            record.messages = messages;
            record.last_updated = now;
            (record, Observation::Updated)
        }
        None => {
            let title = active
                .title_hint
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(ACTIVE_FALLBACK_TITLE)
                .to_string();
            info!(id = %active.id, "adding new chat to cache");
            let record = Record {
                id: active.id.clone(),
                title,
                locator: active.locator.clone(),
                messages,
                last_updated: now,
            };
            (record, Observation::Inserted)
        }
    };
    cache.upsert(record);
    observation
}

pub fn new_records_available<'a>(
    snapshot: &Snapshot,
    stub_ids: impl IntoIterator<Item = &'a str>,
) -> bool {
    stub_ids.into_iter().any(|id| !snapshot.contains(id))
}

pub fn navigate_and_extract(
    extractor: &mut dyn RecordExtractor,
    id: &str,
    locator: &str,
    policy: &PollPolicy,
) -> Vec<Message> {
    if let Err(err) = extractor.open_record(id, locator) {
        warn!(id, error = %err, "could not open record");
        return Vec::new();
    }
    if !policy.settle_delay.is_zero() {
        std::thread::sleep(policy.settle_delay);
    }
    for attempt in 1..=policy.attempts {
        match extractor.extract_active_content() {
            Ok(messages) if !messages.is_empty() => {
                debug!(id, attempt, messages = messages.len(), "content extracted");
                return messages;
            }
            Ok(_) => debug!(id, attempt, "content not rendered yet"),
            Err(err) => debug!(id, attempt, error = %err, "extraction attempt failed"),
        }
        if attempt < policy.attempts && !policy.interval.is_zero() {
            std::thread::sleep(policy.interval);
        }
    }
    warn!(id, attempts = policy.attempts, "no content within retry budget");
    Vec::new()
}

pub fn fetch_record_content<S: KvStore, C: Clock>(
    cache: &mut CacheStore<S, C>,
    extractor: &mut dyn RecordExtractor,
    id: &str,
    policy: &PollPolicy,
) -> anyhow::Result<Observation> {
    let record = cache
        .get(id)
        .cloned()
        .with_context(|| format!("record {id} is not cached"))?;
    let messages = navigate_and_extract(extractor, &record.id, &record.locator, policy);
    let active = ActiveRecord {
        id: record.id,
        title_hint: Some(record.title),
        locator: record.locator,
    };
    Ok(observe_active(cache, &active, messages))
}

pub fn refresh_tick<S: KvStore, C: Clock>(
    cache: &mut CacheStore<S, C>,
    extractor: &dyn RecordExtractor,
) -> TickReport {
    let observed = extractor.active_record().map(|active| {
        let messages = match extractor.extract_active_content() {
            Ok(messages) => messages,
            Err(err) => {
                warn!(id = %active.id, error = %err, "active content extraction failed");
                Vec::new()
            }
        };
        let observation = observe_active(cache, &active, messages);
        (active.id, observation)
    });

    let new_records_available = match extractor.list_stubs() {
        Ok(listing) => {
            let ids: Vec<String> = listing
                .into_iter()
                .filter_map(Result::ok)
                .filter_map(|raw| raw.resolve(0).map(|s| s.id))
                .collect();
            new_records_available(cache.peek(), ids.iter().map(String::as_str))
        }
        Err(err) => {
            warn!(error = %err, "stub listing failed during refresh");
            false
        }
    };

    TickReport {
        observed,
        new_records_available,
    }
}
