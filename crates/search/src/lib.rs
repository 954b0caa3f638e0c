use chrono::{DateTime, Utc};
use core_model::{Record, Role, Snapshot};
use regex::{Captures, Regex, RegexBuilder};
use tracing::{debug, warn};

pub const TITLE_MATCH_SCORE: u32 = 10;
pub const EXACT_TITLE_BONUS: u32 = 20;
pub const MESSAGE_MATCH_SCORE: u32 = 5;

pub const PREVIEW_CONTEXT_CHARS: usize = 50;
pub const MAX_PREVIEW_LENGTH: usize = 150;
pub const MAX_PREVIEWS: usize = 2;
pub const ELLIPSIS: &str = "...";

pub const HIGHLIGHT_OPEN: &str = "<span class=\"search-highlight\">";
pub const HIGHLIGHT_CLOSE: &str = "</span>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePreview {
    pub message_index: usize,
    pub role: Role,
    pub text: String,
    pub highlighted: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredResult {
    pub id: String,
    pub title: String,
    pub highlighted_title: String,
    pub locator: String,
    pub last_updated: DateTime<Utc>,
    pub score: u32,
    pub title_match: bool,
    pub previews: Vec<MessagePreview>,
    pub total_matches: usize,
    pub content_indexed: bool,
}

#[derive(Debug, Clone)]
pub struct Highlighter {
    pattern: Option<Regex>,
}

impl Highlighter {
    pub fn new(term: &str) -> Self {
        if term.is_empty() {
            return Self { pattern: None };
        }
        let pattern = RegexBuilder::new(&regex::escape(term))
            .case_insensitive(true)
            .build();
        match pattern {
            Ok(pattern) => Self {
                pattern: Some(pattern),
            },
            Err(err) => {
                warn!(error = %err, "query too large to highlight");
                Self { pattern: None }
            }
        }
    }

    pub fn find(&self, text: &str) -> Option<(usize, usize)> {
        self.pattern
            .as_ref()?
            .find(text)
            .map(|m| (m.start(), m.end()))
    }

    pub fn highlight(&self, text: &str) -> String {
        let Some(pattern) = &self.pattern else {
            return text.to_string();
        };
        pattern
            .replace_all(text, |caps: &Captures| {
                format!("{HIGHLIGHT_OPEN}{}{HIGHLIGHT_CLOSE}", &caps[0])
            })
            .into_owned()
    }
}

/// Equal scores keep snapshot order.
pub fn search(query: &str, snapshot: &Snapshot) -> Vec<ScoredResult> {
    if query.trim().is_empty() {
        return Vec::new();
    }
    let needle = query.to_lowercase();
    let highlighter = Highlighter::new(query);
    let mut results: Vec<ScoredResult> = snapshot
        .records()
        .filter_map(|record| score_record(record, &needle, &highlighter))
        .collect();
    results.sort_by(|a, b| b.score.cmp(&a.score));
    debug!(query, hits = results.len(), "search done");
    results
}

fn score_record(record: &Record, needle: &str, highlighter: &Highlighter) -> Option<ScoredResult> {
    let title_lower = record.title.to_lowercase();
    let title_match = title_lower.contains(needle);

    let mut score = 0;
    let mut matching = 0;
    let mut previews = Vec::new();
    for message in &record.messages {
        if !message.content.to_lowercase().contains(needle) {
            continue;
        }
        matching += 1;
        score += MESSAGE_MATCH_SCORE;
        if previews.len() < MAX_PREVIEWS {
            let (text, highlighted) = preview(&message.content, highlighter);
            previews.push(MessagePreview {
                message_index: message.index,
                role: message.role,
                text,
                highlighted,
            });
        }
    }

    if !title_match && matching == 0 {
        return None;
    }
    if title_match {
        score += TITLE_MATCH_SCORE;
    }
    if title_lower == needle {
        score += EXACT_TITLE_BONUS;
    }

    Some(ScoredResult {
        id: record.id.clone(),
        title: record.title.clone(),
        highlighted_title: highlighter.highlight(&record.title),
        locator: record.locator.clone(),
        last_updated: record.last_updated,
        score,
        title_match,
        previews,
        total_matches: matching + usize::from(title_match),
        content_indexed: record.is_content_indexed(),
    })
}

pub fn preview(content: &str, highlighter: &Highlighter) -> (String, String) {
    let Some((start, end)) = highlighter.find(content) else {
        let text = format!("{}{ELLIPSIS}", truncate_chars(content, MAX_PREVIEW_LENGTH));
        return (text.clone(), text);
    };
    let from = chars_back(content, start, PREVIEW_CONTEXT_CHARS);
    let to = chars_forward(content, end, PREVIEW_CONTEXT_CHARS);
    let window = &content[from..to];
    let prefix = if from > 0 { ELLIPSIS } else { "" };
    let suffix = if to < content.len() { ELLIPSIS } else { "" };
    (
        format!("{prefix}{window}{suffix}"),
        format!("{prefix}{}{suffix}", highlighter.highlight(window)),
    )
}

pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

fn chars_back(text: &str, byte: usize, count: usize) -> usize {
    if count == 0 {
        return byte;
    }
    text[..byte]
        .char_indices()
        .rev()
        .nth(count - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn chars_forward(text: &str, byte: usize, count: usize) -> usize {
    text[byte..]
        .char_indices()
        .nth(count)
        .map(|(i, _)| byte + i)
        .unwrap_or(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::Message;

    fn record(id: &str, title: &str, contents: &[&str]) -> Record {
        Record {
            id: id.to_string(),
            title: title.to_string(),
            locator: format!("/c/{id}"),
            messages: contents
                .iter()
                .enumerate()
                .map(|(i, c)| Message {
                    role: if i % 2 == 0 { Role::User } else { Role::Assistant },
                    content: c.to_string(),
                    index: i,
                })
                .collect(),
            last_updated: Utc::now(),
        }
    }

    fn snapshot(records: Vec<Record>) -> Snapshot {
        Snapshot::from_records(records, Some(Utc::now()))
    }

    fn ids(results: &[ScoredResult]) -> Vec<&str> {
        results.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn blank_query_returns_nothing() {
        let snap = snapshot(vec![record("a", "Anything", &[])]);
        assert!(search("", &snap).is_empty());
        assert!(search("   \t", &snap).is_empty());
    }

    #[test]
    fn title_match_outranks_single_message_match() {
        let snap = snapshot(vec![
            record("b", "Other", &["I want to say hello"]),
            record("a", "Hello world", &[]),
        ]);
        let results = search("hello", &snap);
        assert_eq!(ids(&results), vec!["a", "b"]);
        assert_eq!(results[0].score, 10);
        assert_eq!(results[1].score, 5);
    }

    #[test]
    fn exact_title_gets_bonus() {
        let snap = snapshot(vec![
            record("a", "hello there", &["hello", "hello again"]),
            record("b", "Hello", &[]),
        ]);
        let results = search("hello", &snap);
        assert_eq!(ids(&results), vec!["b", "a"]);
        assert_eq!(results[0].score, 30);
        assert_eq!(results[1].score, 20);
    }

    #[test]
    fn non_matching_records_are_excluded() {
        let snap = snapshot(vec![record("a", "Rust", &["borrow checker"]), record("b", "Go", &[])]);
        assert!(search("python", &snap).is_empty());
    }

    #[test]
    fn counts_every_matching_message_but_keeps_two_previews() {
        let snap = snapshot(vec![record(
            "a",
            "Cargo notes",
            &["cargo build", "nothing here", "cargo test", "cargo run"],
        )]);
        let results = search("CARGO", &snap);
        let hit = &results[0];
        assert_eq!(hit.score, 10 + 3 * 5);
        assert_eq!(hit.total_matches, 4);
        assert_eq!(hit.previews.len(), 2);
        assert_eq!(hit.previews[0].message_index, 0);
        assert_eq!(hit.previews[1].message_index, 2);
        assert_eq!(hit.previews[1].role, Role::User);
        assert!(hit.content_indexed);
    }

    #[test]
    fn equal_scores_keep_snapshot_order() {
        let snap = snapshot(vec![
            record("c", "topic three", &[]),
            record("a", "topic one", &[]),
            record("b", "topic two", &[]),
        ]);
        let results = search("topic", &snap);
        assert_eq!(ids(&results), vec!["c", "a", "b"]);
    }

    #[test]
    fn title_is_highlighted_preserving_case() {
        let snap = snapshot(vec![record("a", "Hello HELLO", &[])]);
        let results = search("hello", &snap);
        assert_eq!(
            results[0].highlighted_title,
            format!(
                "{HIGHLIGHT_OPEN}Hello{HIGHLIGHT_CLOSE} {HIGHLIGHT_OPEN}HELLO{HIGHLIGHT_CLOSE}"
            )
        );
        assert!(!results[0].content_indexed);
    }

    #[test]
    fn preview_is_windowed_with_ellipses() {
        let content = format!("{}MATCH{}", "x".repeat(60), "y".repeat(60));
        let (text, highlighted) = preview(&content, &Highlighter::new("MATCH"));
        assert!(text.starts_with(ELLIPSIS));
        assert!(text.ends_with(ELLIPSIS));
        assert!(text.chars().count() <= 113);
        assert_eq!(text, format!("...{}MATCH{}...", "x".repeat(50), "y".repeat(50)));
        assert!(highlighted.contains(&format!("{HIGHLIGHT_OPEN}MATCH{HIGHLIGHT_CLOSE}")));
    }

    #[test]
    fn short_content_has_no_ellipses() {
        let (text, _) = preview("say hello", &Highlighter::new("hello"));
        assert_eq!(text, "say hello");
    }

    #[test]
    fn preview_window_respects_char_boundaries() {
        let content = format!("{}naïve{}", "é".repeat(70), "ü".repeat(70));
        let (text, _) = preview(&content, &Highlighter::new("NAÏVE"));
        assert_eq!(text.chars().count(), 3 + 50 + 5 + 50 + 3);
    }

    #[test]
    fn preview_falls_back_when_term_is_absent() {
        let content = "z".repeat(200);
        let (text, highlighted) = preview(&content, &Highlighter::new("missing"));
        assert_eq!(text, format!("{}...", "z".repeat(MAX_PREVIEW_LENGTH)));
        assert_eq!(highlighted, text);
    }

    #[test]
    fn query_is_matched_literally() {
        let snap = snapshot(vec![
            record("a", "axb", &[]),
            record("b", "see a.b here", &["axb and a.b"]),
        ]);
        let results = search("a.b", &snap);
        assert_eq!(ids(&results), vec!["b"]);
        let preview = &results[0].previews[0].highlighted;
        assert_eq!(
            preview,
            &format!("axb and {HIGHLIGHT_OPEN}a.b{HIGHLIGHT_CLOSE}")
        );
    }

    #[test]
    fn pattern_characters_do_not_break_highlighting() {
        let h = Highlighter::new("(a+)*[b]$");
        assert_eq!(
            h.highlight("x (a+)*[b]$ y"),
            format!("x {HIGHLIGHT_OPEN}(a+)*[b]${HIGHLIGHT_CLOSE} y")
        );
        assert_eq!(h.highlight("aaab"), "aaab");
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
