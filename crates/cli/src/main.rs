use std::{path::PathBuf, thread, time::Instant};

use anyhow::Context;
use cache::{CacheStore, RecentQueryLog};
use clap::{Parser, Subcommand};
use export::ExportExtractor;
use ingest::{BuildKind, BuildProgress, BuildStatus, TickReport};
use store_sqlite::SqliteKvStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod ui;

use config::Config;

#[derive(Parser)]
#[command(name = "chatdex")]
#[command(about = "Searchable index of chat conversations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Export directory to read conversations from.
    #[arg(long, global = true)]
    source: Option<PathBuf>,
    /// SQLite database holding the cache.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Init,
    /// Discover conversations and index their titles.
    Build {
        #[arg(long, default_value_t = false)]
        incremental: bool,
    },
    /// Load one cached conversation's messages from the source.
    Fetch { id: String },
    /// Capture the currently open conversation once.
    Observe,
    /// Keep capturing the open conversation on the refresh interval.
    Watch {
        #[arg(long)]
        ticks: Option<u64>,
    },
    Search {
        query: String,
        #[arg(long, default_value_t = false)]
        json: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    Recent {
        #[command(subcommand)]
        command: RecentCommand,
    },
    Status,
    Clear,
    Doctor,
}

#[derive(Subcommand)]
enum RecentCommand {
    List,
    Clear,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let config = Config::load()?;
    let t = Instant::now();

    let db_path = cli
        .db
        .clone()
        .or_else(|| config.cache.db_path.clone())
        .unwrap_or_else(SqliteKvStore::default_path);
    info!(path = %db_path.display(), "opening database");
    let store = SqliteKvStore::open_at(&db_path)?;
    store.init_schema()?;
    let ttl = config.ttl()?;

    match cli.command {
        Commands::Init => {
            info!(elapsed = ?t.elapsed(), "initialized");
            println!("{}", db_path.display());
        }
        Commands::Build { incremental } => {
            let mut cache = CacheStore::open(&store, ttl);
            let extractor = open_source(cli.source.as_ref(), &config)?;
            let kind = if incremental {
                BuildKind::Incremental
            } else {
                BuildKind::Full
            };
            let status = ingest::run_build(
                &mut cache,
                &extractor,
                kind,
                &config.build_options()?,
                log_progress,
            );
            match status {
                BuildStatus::Built { records, added } => {
                    info!(records, added, elapsed = ?t.elapsed(), "build done");
                    println!("indexed {added} chats ({records} total)");
                }
                BuildStatus::NoNewRecords => {
                    info!(elapsed = ?t.elapsed(), "no new chats");
                    println!("no new chats");
                }
                BuildStatus::Failed { reason } => anyhow::bail!("build failed: {reason}"),
            }
        }
        Commands::Fetch { id } => {
            let mut cache = CacheStore::open(&store, ttl);
            cache.load();
            let mut extractor = open_source(cli.source.as_ref(), &config)?;
            let observation =
                ingest::fetch_record_content(&mut cache, &mut extractor, &id, &config.poll_policy()?)?;
            info!(id = %id, elapsed = ?t.elapsed(), "fetch done");
            println!("{id}: {}", ui::observation_label(observation));
        }
        Commands::Observe => {
            let mut cache = CacheStore::open(&store, ttl);
            cache.load();
            let extractor = open_source(cli.source.as_ref(), &config)?;
            let report = ingest::refresh_tick(&mut cache, &extractor);
            print_tick(&report);
        }
        Commands::Watch { ticks } => {
            let interval = config.refresh_interval()?;
            let mut cache = CacheStore::open(&store, ttl);
            cache.load();
            if cache.needs_initial_build() {
                info!("cache empty or expired, running full build");
                let extractor = open_source(cli.source.as_ref(), &config)?;
                let status = ingest::run_build(
                    &mut cache,
                    &extractor,
                    BuildKind::Full,
                    &config.build_options()?,
                    log_progress,
                );
                if let BuildStatus::Failed { reason } = status {
                    warn!(reason = %reason, "initial build failed, watching anyway");
                }
            }
            let mut tick = 0u64;
            loop {
                // The source is re-read every tick so a changed active.json is picked up.
                let extractor = open_source(cli.source.as_ref(), &config)?;
                let report = ingest::refresh_tick(&mut cache, &extractor);
                print_tick(&report);
                tick += 1;
                if ticks.is_some_and(|max| tick >= max) {
                    break;
                }
                thread::sleep(interval);
            }
            info!(ticks = tick, elapsed = ?t.elapsed(), "watch stopped");
        }
        Commands::Search { query, json, limit } => {
            let mut recent = RecentQueryLog::open(&store, config.recent.max_entries);
            recent.add(&query);
            let mut cache = CacheStore::open(&store, ttl);
            let snapshot = cache.load();
            info!(query = %query, records = snapshot.len(), "searching");
            let mut results = search::search(&query, &snapshot);
            if let Some(limit) = limit {
                results.truncate(limit);
            }
            info!(results = results.len(), elapsed = ?t.elapsed(), "search done");
            if json {
                let output = ui::JsonSearchOutput {
                    stats: ui::stats_line(&query, results.len()),
                    results: results.iter().map(ui::JsonResult::from).collect(),
                    query,
                };
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                ui::print_results(&query, &results, cache.now());
            }
        }
        Commands::Recent { command } => {
            let mut recent = RecentQueryLog::open(&store, config.recent.max_entries);
            match command {
                RecentCommand::List => {
                    for entry in recent.list() {
                        println!("{} {}", entry.timestamp.to_rfc3339(), entry.query);
                    }
                }
                RecentCommand::Clear => {
                    recent.clear();
                    info!("recent searches cleared");
                }
            }
        }
        Commands::Status => {
            let cache = CacheStore::open(&store, ttl);
            let freshness = cache.freshness();
            let snapshot = cache.peek();
            println!("records={}", snapshot.len());
            println!("content_indexed={}", snapshot.content_indexed_count());
            match cache.age() {
                Some(age) => println!(
                    "age={}",
                    humantime::format_duration(age.to_std().unwrap_or_default())
                ),
                None => println!("age=never"),
            }
            println!("freshness={}", ui::freshness_label(freshness));
            println!("ttl={}", config.cache.ttl);
        }
        Commands::Clear => {
            let mut cache = CacheStore::open(&store, ttl);
            cache.clear();
            info!(elapsed = ?t.elapsed(), "cache cleared");
        }
        Commands::Doctor => {
            info!("running integrity check");
            let check = store.integrity_check()?;
            let entries = store.entries()?;
            info!(elapsed = ?t.elapsed(), "integrity check done");
            println!("integrity_check={check}");
            println!("db={}", db_path.display());
            for entry in &entries {
                println!("{}={} bytes (updated {})", entry.key, entry.bytes, entry.updated_at);
            }
            match source_dir(cli.source.as_ref(), &config) {
                Some(dir) => println!("source={} exists={}", dir.display(), dir.is_dir()),
                None => println!("source=unset"),
            }
        }
    }
    Ok(())
}

fn source_dir(flag: Option<&PathBuf>, config: &Config) -> Option<PathBuf> {
    flag.cloned().or_else(|| config.source.export_dir.clone())
}

fn open_source(flag: Option<&PathBuf>, config: &Config) -> anyhow::Result<ExportExtractor> {
    let dir = source_dir(flag, config).with_context(|| {
        format!(
            "no export directory; pass --source or set [source] export_dir in {}",
            Config::path().display()
        )
    })?;
    ExportExtractor::open(&dir).with_context(|| format!("opening export {}", dir.display()))
}

fn log_progress(progress: &BuildProgress) {
    info!(
        processed = progress.processed,
        total = progress.total,
        "{}",
        progress.message
    );
}

fn print_tick(report: &TickReport) {
    match &report.observed {
        Some((id, observation)) => println!("{id}: {}", ui::observation_label(*observation)),
        None => println!("no open chat"),
    }
    if report.new_records_available {
        println!("new chats available; run `chatdex build --incremental`");
    }
}
