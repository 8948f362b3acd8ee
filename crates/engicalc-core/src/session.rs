//! The open document and its editing state.
//!
//! [`DocumentSession`] is the single writer for this state. Readers take a
//! [`watch::Receiver`] from [`DocumentSession::subscribe`] and see every
//! transition.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tokio::sync::watch;
use yaml_rust2::{Yaml, YamlLoader};

use crate::error::{EngicalcError, FrontmatterError};

/// Header fields of an engineering document.
///
/// Well-known keys get typed fields; anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engineer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub filename: String,
    pub metadata: DocumentMetadata,
    /// Markdown body without the frontmatter.
    pub content: String,
    /// The file as it was loaded.
    pub raw_content: String,
}

impl Document {
    /// A document with no frontmatter.
    pub fn new(filename: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            filename: filename.into(),
            metadata: DocumentMetadata::default(),
            raw_content: content.clone(),
            content,
        }
    }

    /// Read and parse a document from disk, named after its file name.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngicalcError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::parse(&filename, &raw)?)
    }

    /// Split optional `---` delimited YAML frontmatter from the Markdown body.
    pub fn parse(filename: &str, raw: &str) -> Result<Self, FrontmatterError> {
        let Some((yaml, content)) = split_frontmatter(raw) else {
            return Ok(Self::new(filename, raw));
        };

        let docs = YamlLoader::load_from_str(yaml).map_err(|err| {
            let marker = err.marker();
            // Frontmatter starts on the line after the opening `---`.
            FrontmatterError::new(filename, raw, err.info(), marker.line() + 1, marker.col() + 1)
                .with_advice("frontmatter must be a YAML mapping between two `---` lines")
        })?;

        let metadata = match docs.first() {
            None | Some(Yaml::Null) => DocumentMetadata::default(),
            Some(Yaml::Hash(hash)) => metadata_from_yaml(hash),
            Some(_) => {
                return Err(FrontmatterError::new(
                    filename,
                    raw,
                    "frontmatter is not a mapping",
                    2,
                    1,
                )
                .with_advice("use `key: value` lines, e.g. `project: Footbridge`"));
            }
        };

        Ok(Self {
            filename: filename.to_owned(),
            metadata,
            content: content.to_owned(),
            raw_content: raw.to_owned(),
        })
    }
}

/// Returns `(yaml, body)` when `raw` opens with a `---` line and has a closing one.
fn split_frontmatter(raw: &str) -> Option<(&str, &str)> {
    let rest = raw
        .strip_prefix("---\n")
        .or_else(|| raw.strip_prefix("---\r\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed == "---" || trimmed == "..." {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

fn metadata_from_yaml(hash: &yaml_rust2::yaml::Hash) -> DocumentMetadata {
    let mut metadata = DocumentMetadata::default();
    for (key, value) in hash {
        let Some(key) = scalar_string(key) else {
            continue;
        };
        let slot = match key.as_str() {
            "project" => &mut metadata.project,
            "engineer" => &mut metadata.engineer,
            "date" => &mut metadata.date,
            "revision" => &mut metadata.revision,
            "title" => &mut metadata.title,
            "description" => &mut metadata.description,
            _ => {
                metadata.extra.insert(key, yaml_to_json(value));
                continue;
            }
        };
        *slot = scalar_string(value);
    }
    metadata
}

fn scalar_string(yaml: &Yaml) -> Option<String> {
    match yaml {
        Yaml::String(s) | Yaml::Real(s) => Some(s.clone()),
        Yaml::Integer(i) => Some(i.to_string()),
        Yaml::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

fn yaml_to_json(yaml: &Yaml) -> Value {
    match yaml {
        Yaml::String(s) => Value::String(s.clone()),
        Yaml::Integer(i) => Value::from(*i),
        Yaml::Real(s) => s
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(s.clone())),
        Yaml::Boolean(b) => Value::Bool(*b),
        Yaml::Array(items) => Value::Array(items.iter().map(yaml_to_json).collect()),
        Yaml::Hash(hash) => Value::Object(
            hash.iter()
                .filter_map(|(k, v)| scalar_string(k).map(|k| (k, yaml_to_json(v))))
                .collect(),
        ),
        Yaml::Null | Yaml::BadValue | Yaml::Alias(_) => Value::Null,
    }
}

/// Snapshot of the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub current: Option<Document>,
    /// Unsaved edits exist.
    pub is_modified: bool,
    pub is_saving: bool,
    pub error: Option<String>,
}

impl SessionState {
    /// Markdown body of the current document.
    pub fn content(&self) -> Option<&str> {
        self.current.as_ref().map(|doc| doc.content.as_str())
    }
}

#[derive(Debug)]
pub struct DocumentSession {
    state: watch::Sender<SessionState>,
}

impl Default for DocumentSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentSession {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self { state }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Open `doc` (or close with `None`). The new document starts unmodified.
    pub fn set_current(&self, doc: Option<Document>) {
        tracing::debug!(
            target: "engicalc::preview",
            filename = doc.as_ref().map(|d| d.filename.as_str()),
            "session document changed"
        );
        self.state.send_modify(|state| {
            state.current = doc;
            state.is_modified = false;
        });
    }

    /// Replace the body of the current document and mark the session modified.
    pub fn update_content(&self, content: impl Into<String>) {
        let content = content.into();
        self.state.send_modify(|state| {
            if let Some(doc) = state.current.as_mut() {
                doc.content = content;
            }
            state.is_modified = true;
        });
    }

    pub fn update_metadata(&self, metadata: DocumentMetadata) {
        self.state.send_modify(|state| {
            if let Some(doc) = state.current.as_mut() {
                doc.metadata = metadata;
            }
            state.is_modified = true;
        });
    }

    pub fn set_modified(&self, modified: bool) {
        self.state.send_if_modified(|state| {
            std::mem::replace(&mut state.is_modified, modified) != modified
        });
    }

    pub fn set_saving(&self, saving: bool) {
        self.state
            .send_if_modified(|state| std::mem::replace(&mut state.is_saving, saving) != saving);
    }

    pub fn set_error(&self, error: Option<String>) {
        if let Some(error) = &error {
            tracing::warn!(target: "engicalc::preview", %error, "session error");
        }
        self.state.send_if_modified(|state| {
            let changed = state.error != error;
            state.error = error;
            changed
        });
    }

    /// Close the document and clear every flag.
    pub fn reset(&self) {
        self.state.send_replace(SessionState::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEAM: &str = "---\nproject: Footbridge\nengineer: A. Smith\nrevision: 2\nloads:\n  dead: 1.5\n  live: 4\n---\n# Beam check\n";

    #[test]
    fn parses_frontmatter() {
        let doc = Document::parse("beam.md", BEAM).unwrap();
        assert_eq!(doc.filename, "beam.md");
        assert_eq!(doc.content, "# Beam check\n");
        assert_eq!(doc.raw_content, BEAM);
        assert_eq!(doc.metadata.project.as_deref(), Some("Footbridge"));
        assert_eq!(doc.metadata.engineer.as_deref(), Some("A. Smith"));
        assert_eq!(doc.metadata.revision.as_deref(), Some("2"));
        assert_eq!(doc.metadata.title, None);
        assert_eq!(
            Value::Object(doc.metadata.extra.clone()),
            serde_json::json!({"loads": {"dead": 1.5, "live": 4}})
        );
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("engicalc-load-{}.md", std::process::id()));
        std::fs::write(&path, BEAM).unwrap();
        let doc = Document::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(doc.filename, path.file_name().unwrap().to_string_lossy());
        assert_eq!(doc.metadata.project.as_deref(), Some("Footbridge"));

        let missing = Document::load(path.with_extension("missing"));
        assert!(matches!(missing, Err(EngicalcError::Io(_))));
    }

    #[test]
    fn no_frontmatter() {
        let doc = Document::parse("plain.md", "# Title\n\n---\n\nrule above\n").unwrap();
        assert_eq!(doc.metadata, DocumentMetadata::default());
        assert_eq!(doc.content, "# Title\n\n---\n\nrule above\n");

        let unclosed = "---\nproject: x\n";
        let doc = Document::parse("unclosed.md", unclosed).unwrap();
        assert_eq!(doc.content, unclosed);
    }

    #[test]
    fn empty_frontmatter() {
        let doc = Document::parse("empty.md", "---\n---\nbody\n").unwrap();
        assert_eq!(doc.metadata, DocumentMetadata::default());
        assert_eq!(doc.content, "body\n");
    }

    #[test]
    fn malformed_frontmatter_points_into_file() {
        let raw = "---\nproject: [unclosed\n---\nbody\n";
        let err = Document::parse("bad.md", raw).unwrap_err();
        assert!(!err.message().is_empty());
        assert!(err.location().offset() >= 4);
        assert!(err.location().offset() <= raw.len());

        let err = Document::parse("list.md", "---\n- a\n- b\n---\n").unwrap_err();
        assert_eq!(err.message(), "frontmatter is not a mapping");
    }

    #[test]
    fn metadata_serializes_flat() {
        let doc = Document::parse("beam.md", BEAM).unwrap();
        let value = serde_json::to_value(&doc.metadata).unwrap();
        assert_eq!(value["project"], "Footbridge");
        assert_eq!(value["loads"]["live"], 4);
        assert!(value.get("title").is_none());
    }

    #[test]
    fn transitions() {
        let session = DocumentSession::new();
        let mut rx = session.subscribe();
        assert_eq!(session.state(), SessionState::default());

        session.set_current(Some(Document::new("a.md", "one")));
        assert!(rx.has_changed().unwrap());
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.content(), Some("one"));
        assert!(!state.is_modified);

        session.update_content("two");
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.content(), Some("two"));
        assert!(state.is_modified);

        session.update_metadata(DocumentMetadata {
            title: Some("Beam".into()),
            ..Default::default()
        });
        assert_eq!(
            session.state().current.unwrap().metadata.title.as_deref(),
            Some("Beam")
        );

        session.set_modified(false);
        session.set_saving(true);
        session.set_error(Some("disk full".into()));
        let state = rx.borrow_and_update().clone();
        assert!(!state.is_modified);
        assert!(state.is_saving);
        assert_eq!(state.error.as_deref(), Some("disk full"));

        session.reset();
        assert_eq!(*rx.borrow_and_update(), SessionState::default());
    }

    #[test]
    fn no_op_flags_do_not_notify() {
        let session = DocumentSession::new();
        let rx = session.subscribe();
        session.set_saving(false);
        session.set_modified(false);
        session.set_error(None);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn edits_without_document_only_mark_modified() {
        let session = DocumentSession::new();
        session.update_content("orphan");
        let state = session.state();
        assert!(state.current.is_none());
        assert!(state.is_modified);
    }
}
