//! Reads conversations from an export directory:
//!
//! ```text
//! <root>/stubs.json          [{"id": "...", "title": "...", "locator": "..."}, ...]
//! <root>/active.json         {"id": "...", "title": "...", "locator": "..."}   (optional)
//! <root>/records/<id>.json   [{"role": "user", "content": "..."}, ...]
//! ```

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use core_model::{ActiveRecord, ExtractError, Message, RawStub, RecordExtractor, Role, StubListing};
use serde_json::Value;
use tracing::{debug, warn};

pub struct ExportExtractor {
    root: PathBuf,
    active: Option<ActiveRecord>,
}

impl ExportExtractor {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ExtractError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ExtractError::Unavailable(format!(
                "export directory {} does not exist",
                root.display()
            )));
        }
        let active = read_active(&root.join("active.json"));
        debug!(root = %root.display(), active = ?active.as_ref().map(|a| &a.id), "export opened");
        Ok(Self { root, active })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> Option<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return None;
        }
        Some(self.root.join("records").join(format!("{id}.json")))
    }
}

impl RecordExtractor for ExportExtractor {
    fn list_stubs(&self) -> Result<StubListing, ExtractError> {
        let path = self.root.join("stubs.json");
        let items: Vec<Value> = read_json(&path)?;
        Ok(items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                serde_json::from_value::<RawStub>(item).map_err(|source| ExtractError::Parse {
                    what: format!("stub #{}", i + 1),
                    source,
                })
            })
            .collect())
    }

    fn active_record(&self) -> Option<ActiveRecord> {
        self.active.clone()
    }

    fn extract_active_content(&self) -> Result<Vec<Message>, ExtractError> {
        let Some(active) = &self.active else {
            return Ok(Vec::new());
        };
        let Some(path) = self.record_path(&active.id) else {
            warn!(id = %active.id, "record id is not a valid file name");
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }
        let doc: Value = read_json(&path)?;
        Ok(parse_messages(&doc))
    }

    fn open_record(&mut self, id: &str, locator: &str) -> Result<(), ExtractError> {
        if self.record_path(id).is_none() {
            return Err(ExtractError::UnknownRecord(id.to_string()));
        }
        self.active = Some(ActiveRecord {
            id: id.to_string(),
            title_hint: None,
            locator: locator.to_string(),
        });
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ExtractError> {
    let raw = fs::read_to_string(path).map_err(|source| ExtractError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ExtractError::Parse {
        what: path.display().to_string(),
        source,
    })
}

fn read_active(path: &Path) -> Option<ActiveRecord> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable active.json");
            return None;
        }
    };
    let val: Value = match serde_json::from_str(&raw) {
        Ok(val) => val,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "malformed active.json");
            return None;
        }
    };
    let id = val.get("id").and_then(Value::as_str)?.trim();
    if id.is_empty() {
        return None;
    }
    Some(ActiveRecord {
        id: id.to_string(),
        title_hint: val.get("title").and_then(Value::as_str).map(str::to_string),
        locator: val
            .get("locator")
            .and_then(Value::as_str)
            .unwrap_or(id)
            .to_string(),
    })
}

pub fn parse_messages(doc: &Value) -> Vec<Message> {
    let items = doc
        .as_array()
        .or_else(|| doc.get("messages").and_then(Value::as_array));
    let Some(items) = items else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let content = content_text(item.get("content").or_else(|| item.get("text")));
            if content.is_empty() {
                return None;
            }
            let role = item
                .get("role")
                .or_else(|| item.get("author"))
                .and_then(Value::as_str)
                .map(Role::from_label)
                .unwrap_or_default();
            Some((role, content))
        })
        .enumerate()
        .map(|(index, (role, content))| Message {
            role,
            content,
            index,
        })
        .collect()
}

pub fn content_text(content: Option<&Value>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    if let Some(s) = content.as_str() {
        return s.trim().to_string();
    }
    let mut out = String::new();
    if let Some(parts) = content.as_array() {
        for part in parts {
            let text = part
                .as_str()
                .or_else(|| part.get("text").and_then(Value::as_str))
                .map(str::trim)
                .unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(text);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    struct TempExport(PathBuf);

    impl TempExport {
        fn new() -> Self {
            let n = COUNTER.fetch_add(1, Ordering::SeqCst);
            let dir = std::env::temp_dir().join(format!(
                "chatdex-export-{}-{n}",
                std::process::id()
            ));
            fs::create_dir_all(dir.join("records")).unwrap();
            Self(dir)
        }

        fn write(&self, rel: &str, val: &Value) {
            fs::write(self.0.join(rel), serde_json::to_string(val).unwrap()).unwrap();
        }
    }

    impl Drop for TempExport {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn missing_root_is_unavailable() {
        let err = ExportExtractor::open("/definitely/not/here").err().unwrap();
        assert!(matches!(err, ExtractError::Unavailable(_)));
    }

    #[test]
    fn lists_stubs_with_per_item_errors() {
        let dir = TempExport::new();
        dir.write(
            "stubs.json",
            &json!([
                {"id": "a", "title": "Alpha", "locator": "/c/a"},
                {"title": "no id"},
                {"id": 42},
                {"id": "b"}
            ]),
        );
        let ex = ExportExtractor::open(&dir.0).unwrap();
        let listing = ex.list_stubs().unwrap();
        assert_eq!(listing.len(), 4);
        assert_eq!(listing[0].as_ref().unwrap().id.as_deref(), Some("a"));
        assert!(listing[1].as_ref().unwrap().id.is_none());
        assert!(matches!(listing[2], Err(ExtractError::Parse { .. })));
        assert!(listing[3].as_ref().unwrap().title.is_none());
    }

    #[test]
    fn missing_stub_file_fails_the_listing() {
        let dir = TempExport::new();
        let ex = ExportExtractor::open(&dir.0).unwrap();
        assert!(matches!(ex.list_stubs(), Err(ExtractError::Io { .. })));
    }

    #[test]
    fn reads_active_record_content() {
        let dir = TempExport::new();
        dir.write("active.json", &json!({"id": "a", "title": "Alpha"}));
        dir.write(
            "records/a.json",
            &json!([
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "  "},
                {"role": "tool", "content": [{"text": "part one"}, {"text": "part two"}]},
                {"author": "assistant", "text": "hello"}
            ]),
        );
        let ex = ExportExtractor::open(&dir.0).unwrap();
        let active = ex.active_record().unwrap();
        assert_eq!(active.title_hint.as_deref(), Some("Alpha"));
        assert_eq!(active.locator, "a");

        let messages = ex.extract_active_content().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Unknown);
        assert_eq!(messages[1].content, "part one part two");
        assert_eq!(messages[1].index, 1);
        assert_eq!(messages[2].role, Role::Assistant);
    }

    #[test]
    fn open_record_switches_view() {
        let dir = TempExport::new();
        dir.write("records/b.json", &json!({"messages": [{"role": "user", "content": "bee"}]}));
        let mut ex = ExportExtractor::open(&dir.0).unwrap();
        assert!(ex.active_record().is_none());
        assert!(ex.extract_active_content().unwrap().is_empty());

        ex.open_record("b", "/c/b").unwrap();
        assert_eq!(ex.active_record().unwrap().locator, "/c/b");
        assert_eq!(ex.extract_active_content().unwrap()[0].content, "bee");

        ex.open_record("nothing", "/c/nothing").unwrap();
        assert!(ex.extract_active_content().unwrap().is_empty());
    }

    #[test]
    fn rejects_path_like_ids() {
        let dir = TempExport::new();
        let mut ex = ExportExtractor::open(&dir.0).unwrap();
        let err = ex.open_record("../stubs", "x").unwrap_err();
        assert!(matches!(err, ExtractError::UnknownRecord(_)));
        assert!(ex.active_record().is_none());
    }
}
