use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use ingest::{BuildOptions, PollPolicy};
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub recent: RecentConfig,
    pub refresh: RefreshConfig,
    pub source: SourceConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl: String,
    pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: "24h".to_string(),
            db_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RecentConfig {
    pub max_entries: usize,
}

impl Default for RecentConfig {
    fn default() -> Self {
        Self {
            max_entries: cache::MAX_RECENT_SEARCHES,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub interval: String,
    pub settle_delay: String,
    pub poll_attempts: u32,
    pub poll_interval: String,
    pub stub_delay: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            settle_delay: "2s".to_string(),
            poll_attempts: 10,
            poll_interval: "500ms".to_string(),
            stub_delay: "10ms".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SourceConfig {
    pub export_dir: Option<PathBuf>,
}

impl Config {
    pub fn path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("chatdex").join("config.toml")
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::path();
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file at {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file at {}", config_path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn ttl(&self) -> anyhow::Result<chrono::Duration> {
        let ttl = duration("cache.ttl", &self.cache.ttl)?;
        chrono::Duration::from_std(ttl).context("cache.ttl is out of range")
    }

    pub fn refresh_interval(&self) -> anyhow::Result<Duration> {
        duration("refresh.interval", &self.refresh.interval)
    }

    pub fn poll_policy(&self) -> anyhow::Result<PollPolicy> {
        Ok(PollPolicy {
            settle_delay: duration("refresh.settle_delay", &self.refresh.settle_delay)?,
            attempts: self.refresh.poll_attempts.max(1),
            interval: duration("refresh.poll_interval", &self.refresh.poll_interval)?,
        })
    }

    pub fn build_options(&self) -> anyhow::Result<BuildOptions> {
        Ok(BuildOptions {
            stub_delay: duration("refresh.stub_delay", &self.refresh.stub_delay)?,
        })
    }
}

fn duration(field: &str, raw: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(raw.trim()).with_context(|| format!("invalid duration for {field}: {raw:?}"))
}
