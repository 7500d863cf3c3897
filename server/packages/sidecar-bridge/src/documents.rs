use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use sidecar_bridge_error::BridgeError;
use url::Url;

use crate::model::{char_len, offset_at, replace_chars, Range};

/// Text documents the host can read and modify. `version_id` increases on
/// every modification and is how sessions detect edits made by someone else.
pub trait DocumentStore: Send {
    fn text(&self, uri: &Url) -> Result<String, BridgeError>;

    fn read_range(&self, uri: &Url, range: Range) -> Result<String, BridgeError> {
        let text = self.text(uri)?;
        let (start, end) = resolve_range(uri, &text, range)?;
        Ok(text.chars().skip(start).take(end - start).collect())
    }

    /// Replace `range` with `new_text`, returning the new version id.
    fn apply_edit(&mut self, uri: &Url, range: Range, new_text: &str) -> Result<i32, BridgeError>;

    fn version_id(&self, uri: &Url) -> Option<i32>;
}

pub type SharedDocuments = Arc<Mutex<dyn DocumentStore>>;

pub fn shared<D: DocumentStore + 'static>(store: D) -> SharedDocuments {
    Arc::new(Mutex::new(store))
}

/// Resolve `range` to character offsets within `text`.
pub(crate) fn resolve_range(
    uri: &Url,
    text: &str,
    range: Range,
) -> Result<(usize, usize), BridgeError> {
    let invalid = |message: String| BridgeError::InvalidRange {
        uri: uri.to_string(),
        message,
    };
    let start = offset_at(text, range.start)
        .ok_or_else(|| invalid(format!("start {range} is outside the document")))?;
    let end = offset_at(text, range.end)
        .ok_or_else(|| invalid(format!("end {range} is outside the document")))?;
    if end < start {
        return Err(invalid(format!("range {range} ends before it starts")));
    }
    Ok((start, end))
}

#[derive(Debug, Clone)]
struct Document {
    text: String,
    version: i32,
}

impl Document {
    fn edit(&mut self, uri: &Url, range: Range, new_text: &str) -> Result<i32, BridgeError> {
        let (start, end) = resolve_range(uri, &self.text, range)?;
        self.text = replace_chars(&self.text, start, end - start, new_text);
        self.version += 1;
        Ok(self.version)
    }
}

/// Documents held purely in memory. Used by tests and embedding hosts that
/// manage persistence themselves.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: HashMap<Url, Document>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) a document at version 1.
    pub fn open(&mut self, uri: Url, text: impl Into<String>) {
        self.documents.insert(
            uri,
            Document {
                text: text.into(),
                version: 1,
            },
        );
    }

    pub fn close(&mut self, uri: &Url) -> bool {
        self.documents.remove(uri).is_some()
    }

    pub fn with_document(mut self, uri: Url, text: impl Into<String>) -> Self {
        self.open(uri, text);
        self
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn text(&self, uri: &Url) -> Result<String, BridgeError> {
        self.documents
            .get(uri)
            .map(|document| document.text.clone())
            .ok_or_else(|| BridgeError::DocumentNotFound {
                uri: uri.to_string(),
            })
    }

    fn apply_edit(&mut self, uri: &Url, range: Range, new_text: &str) -> Result<i32, BridgeError> {
        let document = self
            .documents
            .get_mut(uri)
            .ok_or_else(|| BridgeError::DocumentNotFound {
                uri: uri.to_string(),
            })?;
        document.edit(uri, range, new_text)
    }

    fn version_id(&self, uri: &Url) -> Option<i32> {
        self.documents.get(uri).map(|document| document.version)
    }
}

/// `file://` documents backed by the local filesystem. Files are read lazily
/// and edited in memory; nothing is written until [`WorkspaceDocuments::save`].
/// A file that was never edited reports version 0.
#[derive(Debug)]
pub struct WorkspaceDocuments {
    root: Option<PathBuf>,
    loaded: HashMap<Url, Document>,
}

impl WorkspaceDocuments {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            loaded: HashMap::new(),
        }
    }

    /// Resolve a user supplied path against the workspace root.
    pub fn uri_for(&self, path: &str) -> Option<Url> {
        if let Ok(url) = Url::parse(path) {
            if url.scheme() == "file" {
                return Some(url);
            }
        }
        let path = PathBuf::from(path);
        let absolute = match (&self.root, path.is_absolute()) {
            (_, true) => path,
            (Some(root), false) => root.join(path),
            (None, false) => std::env::current_dir().ok()?.join(path),
        };
        Url::from_file_path(absolute).ok()
    }

    fn path_for(uri: &Url) -> Result<PathBuf, BridgeError> {
        uri.to_file_path().map_err(|()| BridgeError::DocumentNotFound {
            uri: uri.to_string(),
        })
    }

    fn read_from_disk(uri: &Url) -> Result<String, BridgeError> {
        let path = Self::path_for(uri)?;
        std::fs::read_to_string(&path).map_err(|err| {
            tracing::debug!(uri = %uri, error = %err, "documents: read failed");
            BridgeError::DocumentNotFound {
                uri: uri.to_string(),
            }
        })
    }

    /// Write the in-memory text of `uri` back to disk.
    pub fn save(&self, uri: &Url) -> std::io::Result<bool> {
        let Some(document) = self.loaded.get(uri) else {
            return Ok(false);
        };
        let path = uri.to_file_path().map_err(|()| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("not a file uri: {uri}"),
            )
        })?;
        std::fs::write(&path, document.text.as_bytes())?;
        tracing::info!(
            uri = %uri,
            chars = char_len(&document.text),
            "documents: saved"
        );
        Ok(true)
    }
}

impl DocumentStore for WorkspaceDocuments {
    fn text(&self, uri: &Url) -> Result<String, BridgeError> {
        match self.loaded.get(uri) {
            Some(document) => Ok(document.text.clone()),
            None => Self::read_from_disk(uri),
        }
    }

    fn apply_edit(&mut self, uri: &Url, range: Range, new_text: &str) -> Result<i32, BridgeError> {
        if !self.loaded.contains_key(uri) {
            let text = Self::read_from_disk(uri)?;
            self.loaded
                .insert(uri.clone(), Document { text, version: 0 });
        }
        match self.loaded.get_mut(uri) {
            Some(document) => document.edit(uri, range, new_text),
            None => Err(BridgeError::DocumentNotFound {
                uri: uri.to_string(),
            }),
        }
    }

    fn version_id(&self, uri: &Url) -> Option<i32> {
        match self.loaded.get(uri) {
            Some(document) => Some(document.version),
            None => Self::path_for(uri)
                .ok()
                .filter(|path| path.is_file())
                .map(|_| 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri() -> Url {
        Url::parse("file:///workspace/a.ts").expect("uri")
    }

    #[test]
    fn in_memory_edits_bump_versions() {
        let mut store = InMemoryDocumentStore::new().with_document(uri(), "let a = 1;\nlet b = 2;\n");
        assert_eq!(store.version_id(&uri()), Some(1));

        let version = store
            .apply_edit(&uri(), Range::lines(1, 4, 1, 5), "c")
            .expect("edit");
        assert_eq!(version, 2);
        assert_eq!(store.text(&uri()).expect("text"), "let a = 1;\nlet c = 2;\n");
        assert_eq!(
            store
                .read_range(&uri(), Range::lines(0, 4, 1, 5))
                .expect("range"),
            "a = 1;\nlet c"
        );
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let mut store = InMemoryDocumentStore::new().with_document(uri(), "abc");
        let err = store
            .apply_edit(&uri(), Range::lines(0, 2, 0, 1), "")
            .expect_err("reversed range");
        assert_eq!(err.error_type(), sidecar_bridge_error::ErrorType::InvalidRange);
        let err = store
            .apply_edit(&uri(), Range::lines(2, 0, 2, 0), "")
            .expect_err("past end");
        assert_eq!(err.error_type(), sidecar_bridge_error::ErrorType::InvalidRange);
        assert_eq!(store.version_id(&uri()), Some(1));

        let missing = Url::parse("file:///missing.ts").expect("uri");
        assert!(matches!(
            store.text(&missing),
            Err(BridgeError::DocumentNotFound { .. })
        ));
    }

    #[test]
    fn workspace_documents_load_lazily_and_save() {
        let dir = std::env::temp_dir().join(format!(
            "sidecar-bridge-docs-{}-{}",
            std::process::id(),
            crate::now_ms()
        ));
        std::fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("main.rs");
        std::fs::write(&path, "fn main() {}\n").expect("write");

        let mut docs = WorkspaceDocuments::new(Some(dir.clone()));
        let uri = docs.uri_for("main.rs").expect("uri");
        assert_eq!(docs.version_id(&uri), Some(0));

        docs.apply_edit(&uri, Range::lines(0, 3, 0, 7), "start")
            .expect("edit");
        assert_eq!(docs.version_id(&uri), Some(1));
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "fn main() {}\n"
        );

        assert!(docs.save(&uri).expect("save"));
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "fn start() {}\n"
        );
        let _ = std::fs::remove_dir_all(&dir);
    }
}
