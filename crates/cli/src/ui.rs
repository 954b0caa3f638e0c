use std::io::{self, IsTerminal};

use chrono::{DateTime, Utc};
use core_model::{Freshness, Role};
use ingest::Observation;
use owo_colors::OwoColorize;
use search::{HIGHLIGHT_CLOSE, HIGHLIGHT_OPEN, MessagePreview, ScoredResult};
use serde::Serialize;

#[derive(Serialize)]
pub struct JsonPreview {
    pub message_index: usize,
    pub role: Role,
    pub text: String,
    pub highlighted: String,
}

#[derive(Serialize)]
pub struct JsonResult {
    pub id: String,
    pub title: String,
    pub highlighted_title: String,
    pub locator: String,
    pub last_updated: DateTime<Utc>,
    pub score: u32,
    pub title_match: bool,
    pub total_matches: usize,
    pub content_indexed: bool,
    pub previews: Vec<JsonPreview>,
}

#[derive(Serialize)]
pub struct JsonSearchOutput {
    pub query: String,
    pub stats: String,
    pub results: Vec<JsonResult>,
}

impl From<&MessagePreview> for JsonPreview {
    fn from(p: &MessagePreview) -> Self {
        Self {
            message_index: p.message_index,
            role: p.role,
            text: p.text.clone(),
            highlighted: p.highlighted.clone(),
        }
    }
}

impl From<&ScoredResult> for JsonResult {
    fn from(r: &ScoredResult) -> Self {
        Self {
            id: r.id.clone(),
            title: r.title.clone(),
            highlighted_title: r.highlighted_title.clone(),
            locator: r.locator.clone(),
            last_updated: r.last_updated,
            score: r.score,
            title_match: r.title_match,
            total_matches: r.total_matches,
            content_indexed: r.content_indexed,
            previews: r.previews.iter().map(JsonPreview::from).collect(),
        }
    }
}

pub fn color_enabled() -> bool {
    io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none()
}

pub fn stats_line(query: &str, count: usize) -> String {
    match count {
        0 => format!("No results found for \"{query}\""),
        1 => "Found 1 conversation".to_string(),
        n => format!("Found {n} conversations"),
    }
}

/// Coarse "how long ago" label used next to each result.
pub fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = now.signed_duration_since(then);
    let minutes = delta.num_minutes();
    if minutes < 1 {
        return "Just now".to_string();
    }
    if minutes < 60 {
        return format!("{minutes}m ago");
    }
    let hours = delta.num_hours();
    if hours < 24 {
        return format!("{hours}h ago");
    }
    format!("{}d ago", delta.num_days())
}

pub fn freshness_label(freshness: Freshness) -> &'static str {
    match freshness {
        Freshness::Absent => "absent",
        Freshness::Fresh => "fresh",
        Freshness::Expired => "expired",
    }
}

pub fn observation_label(observation: Observation) -> &'static str {
    match observation {
        Observation::Skipped => "no content",
        Observation::Inserted => "added",
        Observation::Updated => "updated",
    }
}

/// Turns highlight spans into terminal styling, or strips them.
pub fn render_highlights(highlighted: &str, use_color: bool) -> String {
    let mut out = String::with_capacity(highlighted.len());
    let mut rest = highlighted;
    while let Some(start) = rest.find(HIGHLIGHT_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + HIGHLIGHT_OPEN.len()..];
        let (hit, tail) = match after.find(HIGHLIGHT_CLOSE) {
            Some(end) => (&after[..end], &after[end + HIGHLIGHT_CLOSE.len()..]),
            None => (after, ""),
        };
        if use_color {
            out.push_str(&hit.yellow().bold().to_string());
        } else {
            out.push_str(hit);
        }
        rest = tail;
    }
    out.push_str(rest);
    out
}

pub fn print_results(query: &str, results: &[ScoredResult], now: DateTime<Utc>) {
    let use_color = color_enabled();
    let stats = stats_line(query, results.len());
    if use_color {
        println!("{}", stats.dimmed());
    } else {
        println!("{stats}");
    }
    for (i, result) in results.iter().enumerate() {
        let title = render_highlights(&result.highlighted_title, use_color);
        let age = format_age(result.last_updated, now);
        let indexed = if result.content_indexed {
            "Content indexed"
        } else {
            "Title only"
        };
        let matches = format!("{} matches", result.total_matches);
        if use_color {
            println!(
                "[{i}] {}{}{}{}{}",
                title.bold(),
                " | ".dimmed(),
                age.dimmed(),
                " | ".dimmed(),
                indexed.cyan()
            );
            if result.total_matches > 0 {
                println!("    {}", matches.magenta());
            }
        } else {
            println!("[{i}] {title} | {age} | {indexed}");
            if result.total_matches > 0 {
                println!("    {matches}");
            }
        }
        for preview in &result.previews {
            let text = render_highlights(&preview.highlighted, use_color);
            let role = preview.role.as_str();
            if use_color {
                println!("    {} {text}", format!("{role}:").dimmed());
            } else {
                println!("    {role}: {text}");
            }
        }
    }
}
