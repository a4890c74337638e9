//! Build state persistence
//!
//! Every generated file is kept as a [`FileRecord`] and the whole map is
//! flushed to `.forge_state.json` after each write, so a crash loses at
//! most the file that was being synthesized. Opening a project directory
//! that already holds a state document resumes from it; a corrupt
//! document is logged and replaced with a fresh state.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of the persisted state document
pub const STATE_FILE: &str = ".forge_state.json";

/// Content hash used for records and resume checks
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// A generated file and its bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Project-relative path
    pub path: String,
    /// Current content
    pub content: String,
    /// blake3 hex digest of `content`
    pub hash: String,
    /// Review attempts spent on the current content
    pub review_count: u32,
    /// Last write time
    pub written_at: DateTime<Utc>,
}

impl FileRecord {
    /// Create a record, hashing the content
    pub fn new(path: impl Into<String>, content: impl Into<String>, review_count: u32) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            hash: content_hash(&content),
            content,
            review_count,
            written_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordMetadata {
    hash: String,
    chars: usize,
    review_count: u32,
    written_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    files: BTreeMap<String, String>,
    metadata: BTreeMap<String, RecordMetadata>,
    saved_at: DateTime<Utc>,
}

/// The map of generated files for one build
#[derive(Debug)]
pub struct CodebaseState {
    root: PathBuf,
    records: BTreeMap<String, FileRecord>,
    resumed: bool,
}

impl CodebaseState {
    /// Fresh, empty state rooted at `root` (nothing is read from disk)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            records: BTreeMap::new(),
            resumed: false,
        }
    }

    /// Open the state for `root`, resuming a persisted document if present
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let mut state = Self::new(root);
        let path = state.state_path();
        if !path.exists() {
            return Ok(state);
        }

        let content = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str::<StateDocument>(&content) {
            Ok(doc) => {
                state.records = Self::records_from_document(doc);
                state.resumed = true;
                tracing::info!(
                    files = state.records.len(),
                    "Resumed build state from {}",
                    path.display()
                );
            }
            Err(e) => {
                tracing::warn!("Corrupt state document {}: {} - starting fresh", path.display(), e);
            }
        }
        Ok(state)
    }

    fn records_from_document(doc: StateDocument) -> BTreeMap<String, FileRecord> {
        let mut metadata = doc.metadata;
        doc.files
            .into_iter()
            .map(|(path, content)| {
                let computed = content_hash(&content);
                let record = match metadata.remove(&path) {
                    Some(meta) => {
                        if meta.hash != computed {
                            tracing::warn!(path = %path, "Stored hash differs from content; rehashing");
                        }
                        FileRecord {
                            path: path.clone(),
                            content,
                            hash: computed,
                            review_count: meta.review_count,
                            written_at: meta.written_at,
                        }
                    }
                    None => FileRecord::new(path.clone(), content, 0),
                };
                (path, record)
            })
            .collect()
    }

    /// Project root the files are written under
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the state document
    pub fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    /// Whether this state was loaded from a previous run
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    /// Write `content` to disk, update the record and persist the state
    pub async fn write(
        &mut self,
        path: &str,
        content: &str,
        review_count: u32,
    ) -> Result<&FileRecord> {
        let full_path = self.root.join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full_path, content).await?;

        let record = FileRecord::new(path, content, review_count);
        tracing::debug!(path = %path, hash = %&record.hash[..16], "File record written");
        self.records.insert(path.to_string(), record);
        self.save().await?;

        self.records
            .get(path)
            .ok_or_else(|| crate::error::StateError::UnknownPath(path.to_string()).into())
    }

    /// Flush the state document to disk
    pub async fn save(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let doc = StateDocument {
            files: self
                .records
                .iter()
                .map(|(path, r)| (path.clone(), r.content.clone()))
                .collect(),
            metadata: self
                .records
                .iter()
                .map(|(path, r)| {
                    (
                        path.clone(),
                        RecordMetadata {
                            hash: r.hash.clone(),
                            chars: r.content.chars().count(),
                            review_count: r.review_count,
                            written_at: r.written_at,
                        },
                    )
                })
                .collect(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&doc)?;
        tokio::fs::write(self.state_path(), json).await?;
        Ok(())
    }

    /// Record for `path`
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    /// Whether `path` has been written
    pub fn contains(&self, path: &str) -> bool {
        self.records.contains_key(path)
    }

    /// Whether the record exists and the file on disk still matches it
    pub fn is_current(&self, path: &str) -> bool {
        match self.records.get(path) {
            Some(record) => std::fs::read_to_string(self.root.join(path))
                .map(|disk| content_hash(&disk) == record.hash)
                .unwrap_or(false),
            None => false,
        }
    }

    /// All records, ordered by path
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    /// Written paths, ordered
    pub fn paths(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Number of written files
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_persists_and_reloads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::open(dir.path()).await.unwrap();
        assert!(!state.is_resumed());

        state.write("main.py", "print('hi')\n", 1).await.unwrap();
        state.write("pkg/util.py", "X = 1\n", 0).await.unwrap();
        assert!(dir.path().join("pkg/util.py").exists());

        let reloaded = CodebaseState::open(dir.path()).await.unwrap();
        assert!(reloaded.is_resumed());
        assert_eq!(reloaded.len(), 2);
        for record in state.records() {
            let other = reloaded.get(&record.path).unwrap();
            assert_eq!(other.content, record.content);
            assert_eq!(other.hash, record.hash);
            assert_eq!(other.review_count, record.review_count);
        }
    }

    #[tokio::test]
    async fn test_corrupt_document_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STATE_FILE), "{ not json").unwrap();

        let state = CodebaseState::open(dir.path()).await.unwrap();
        assert!(state.is_empty());
        assert!(!state.is_resumed());
    }

    #[tokio::test]
    async fn test_is_current_detects_disk_edits() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = CodebaseState::open(dir.path()).await.unwrap();
        state.write("app.py", "A = 1\n", 0).await.unwrap();
        assert!(state.is_current("app.py"));

        std::fs::write(dir.path().join("app.py"), "A = 2\n").unwrap();
        assert!(!state.is_current("app.py"));
        assert!(!state.is_current("missing.py"));
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
