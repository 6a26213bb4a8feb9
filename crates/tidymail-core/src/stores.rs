//! JSON files holding the sender directory, rule tables, categories, and the
//! per-message diagnostics log.
//!
//! Each store is read fully and written back wholesale. Writes go to a sibling
//! temporary file first and are renamed into place, so readers never observe a
//! half-written file.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::labels::{LabelStep, OrganizerKind};
use crate::mailbox::Uid;
use crate::senders::{SenderDirectory, normalize_address};

/// Entries in the sender label file that are UI placeholders rather than labels.
pub const PSEUDO_LABELS: [&str; 2] = ["Filter by Label", "---"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("category name must not be empty")]
    EmptyCategory,
    #[error("category {0} already exists")]
    DuplicateCategory(String),
    #[error("label name must not be empty")]
    EmptyLabel,
}

async fn read_json<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(T::default()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, body).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    debug!(path = %path.display(), "store written");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct SenderDirectoryStore {
    path: PathBuf,
}

impl SenderDirectoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<SenderDirectory, StoreError> {
        read_json(&self.path).await
    }

    /// Overwrite the stored directory with `directory`.
    pub async fn replace(&self, directory: &SenderDirectory) -> Result<(), StoreError> {
        write_json(&self.path, directory).await
    }

    /// Drop one sender; returns whether it was present.
    pub async fn remove_sender(&self, address: &str) -> Result<bool, StoreError> {
        let mut directory = self.load().await?;
        let removed = directory.remove(address).is_some();
        if removed {
            self.replace(&directory).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.replace(&SenderDirectory::new()).await
    }
}

/// `{label: [address, ...]}` as stored on disk.
pub type SenderLabels = BTreeMap<String, Vec<String>>;
/// `{address: true}` as stored on disk.
pub type Unsubscribed = BTreeMap<String, bool>;

/// Address rules: which label each sender gets, and which senders are unsubscribed.
#[derive(Debug, Clone)]
pub struct RuleStore {
    labels_path: PathBuf,
    unsubscribed_path: PathBuf,
}

impl RuleStore {
    pub fn new(labels_path: impl Into<PathBuf>, unsubscribed_path: impl Into<PathBuf>) -> Self {
        Self {
            labels_path: labels_path.into(),
            unsubscribed_path: unsubscribed_path.into(),
        }
    }

    pub async fn load_labels(&self) -> Result<SenderLabels, StoreError> {
        read_json(&self.labels_path).await
    }

    pub async fn load_unsubscribed(&self) -> Result<Unsubscribed, StoreError> {
        read_json(&self.unsubscribed_path).await
    }

    /// Real label names, without the placeholder entries.
    pub async fn label_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .load_labels()
            .await?
            .into_keys()
            .filter(|label| !PSEUDO_LABELS.contains(&label.as_str()))
            .collect())
    }

    pub async fn addresses_for_label(&self, label: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .load_labels()
            .await?
            .remove(label)
            .unwrap_or_default())
    }

    /// File `address` under `label`, moving it out of any other label.
    pub async fn assign_label(&self, address: &str, label: &str) -> Result<(), StoreError> {
        let label = label.trim();
        if label.is_empty() || PSEUDO_LABELS.contains(&label) {
            return Err(StoreError::EmptyLabel);
        }
        let address = normalize_address(address);
        let mut labels = self.load_labels().await?;
        for addresses in labels.values_mut() {
            addresses.retain(|existing| normalize_address(existing) != address);
        }
        labels.entry(label.to_string()).or_default().push(address);
        write_json(&self.labels_path, &labels).await
    }

    pub async fn unsubscribe(&self, address: &str) -> Result<(), StoreError> {
        let mut unsubscribed = self.load_unsubscribed().await?;
        unsubscribed.insert(normalize_address(address), true);
        write_json(&self.unsubscribed_path, &unsubscribed).await
    }

    /// Returns whether the address was unsubscribed.
    pub async fn resubscribe(&self, address: &str) -> Result<bool, StoreError> {
        let mut unsubscribed = self.load_unsubscribed().await?;
        let removed = unsubscribed.remove(&normalize_address(address)).is_some();
        if removed {
            write_json(&self.unsubscribed_path, &unsubscribed).await?;
        }
        Ok(removed)
    }

    /// Reset the label file to its placeholder-only state.
    pub async fn clear_labels(&self) -> Result<(), StoreError> {
        let labels: SenderLabels = PSEUDO_LABELS
            .iter()
            .map(|label| (label.to_string(), Vec::new()))
            .collect();
        write_json(&self.labels_path, &labels).await
    }

    pub async fn clear_unsubscribed(&self) -> Result<(), StoreError> {
        write_json(&self.unsubscribed_path, &Unsubscribed::new()).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryFile {
    #[serde(default)]
    pub categories: Vec<String>,
}

/// Ordered, user-defined categories for the AI organizer.
#[derive(Debug, Clone)]
pub struct CategoryStore {
    path: PathBuf,
}

impl CategoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<Vec<String>, StoreError> {
        let file: CategoryFile = read_json(&self.path).await?;
        Ok(file.categories)
    }

    pub async fn add(&self, name: &str) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyCategory);
        }
        let mut categories = self.load().await?;
        if categories.iter().any(|existing| existing == name) {
            return Err(StoreError::DuplicateCategory(name.to_string()));
        }
        categories.push(name.to_string());
        write_json(&self.path, &CategoryFile { categories }).await
    }

    /// Returns whether the category existed.
    pub async fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut categories = self.load().await?;
        let before = categories.len();
        categories.retain(|existing| existing != name.trim());
        let removed = categories.len() != before;
        if removed {
            write_json(&self.path, &CategoryFile { categories }).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        write_json(&self.path, &CategoryFile::default()).await
    }
}

/// What happened to one message during an organizer run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    pub organizer: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier_answer: Option<String>,
    #[serde(default)]
    pub label_calls: Vec<LabelStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl DiagnosticRecord {
    pub fn new(kind: OrganizerKind, outcome: impl Into<String>) -> Self {
        Self {
            organizer: kind.as_str().to_string(),
            outcome: outcome.into(),
            sender: None,
            subject: None,
            date: None,
            summary: None,
            classifier_answer: None,
            label_calls: Vec::new(),
            error: None,
            recorded_at: Utc::now(),
        }
    }
}

/// Per-UID diagnostics, keyed by the UID's decimal string.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    path: PathBuf,
}

impl DiagnosticLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn load(&self) -> Result<BTreeMap<String, DiagnosticRecord>, StoreError> {
        read_json(&self.path).await
    }

    /// Store `record` for `uid`, replacing any earlier record for it.
    pub async fn record(&self, uid: Uid, record: DiagnosticRecord) -> Result<(), StoreError> {
        let mut entries = self.load().await?;
        entries.insert(uid.to_string(), record);
        write_json(&self.path, &entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::LabelDelta;
    use crate::senders::ParsedSender;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_files_load_as_empty() {
        let dir = TempDir::new().expect("temp dir");
        let senders = SenderDirectoryStore::new(dir.path().join("senders.json"));
        let categories = CategoryStore::new(dir.path().join("categories.json"));

        assert!(senders.load().await.expect("load").is_empty());
        assert!(categories.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn directory_replace_and_remove() {
        let dir = TempDir::new().expect("temp dir");
        let store = SenderDirectoryStore::new(dir.path().join("nested/senders.json"));
        let mut directory = SenderDirectory::new();
        directory.record(ParsedSender {
            address: "a@x.com".into(),
            name: "A".into(),
        });
        store.replace(&directory).await.expect("replace");

        assert_eq!(store.load().await.expect("load"), directory);
        assert!(store.remove_sender("A@X.COM").await.expect("remove"));
        assert!(!store.remove_sender("a@x.com").await.expect("second remove"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn assigning_a_label_moves_the_address() {
        let dir = TempDir::new().expect("temp dir");
        let store = RuleStore::new(
            dir.path().join("sender_labels.json"),
            dir.path().join("unsubscribed.json"),
        );
        store.clear_labels().await.expect("clear");
        store.assign_label("a@x.com", "Finance").await.expect("assign");
        store.assign_label("A@x.com", "Travel").await.expect("reassign");

        assert!(store.addresses_for_label("Finance").await.expect("load").is_empty());
        assert_eq!(
            store.addresses_for_label("Travel").await.expect("load"),
            vec!["a@x.com".to_string()]
        );
        assert_eq!(
            store.label_names().await.expect("names"),
            vec!["Finance".to_string(), "Travel".to_string()]
        );
        assert!(matches!(
            store.assign_label("b@x.com", "---").await,
            Err(StoreError::EmptyLabel)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_round_trip() {
        let dir = TempDir::new().expect("temp dir");
        let store = RuleStore::new(
            dir.path().join("sender_labels.json"),
            dir.path().join("unsubscribed.json"),
        );
        store.unsubscribe("Spam@X.com").await.expect("unsubscribe");
        assert_eq!(
            store.load_unsubscribed().await.expect("load").get("spam@x.com"),
            Some(&true)
        );
        assert!(store.resubscribe("spam@x.com").await.expect("resubscribe"));
        assert!(!store.resubscribe("spam@x.com").await.expect("again"));
    }

    #[tokio::test]
    async fn categories_reject_empty_and_duplicates() {
        let dir = TempDir::new().expect("temp dir");
        let store = CategoryStore::new(dir.path().join("categories.json"));
        store.add("Finance").await.expect("add");
        store.add(" Travel ").await.expect("add trimmed");

        assert!(matches!(store.add("  ").await, Err(StoreError::EmptyCategory)));
        assert!(matches!(
            store.add("Finance").await,
            Err(StoreError::DuplicateCategory(name)) if name == "Finance"
        ));
        assert_eq!(
            store.load().await.expect("load"),
            vec!["Finance".to_string(), "Travel".to_string()]
        );
        assert!(store.remove("Finance").await.expect("remove"));
        assert_eq!(store.load().await.expect("load"), vec!["Travel".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_file_is_reported() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("categories.json");
        tokio::fs::write(&path, b"{not json").await.expect("write");
        let store = CategoryStore::new(&path);
        assert!(matches!(store.load().await, Err(StoreError::Json { .. })));
    }

    #[tokio::test]
    async fn diagnostics_are_keyed_by_uid() {
        let dir = TempDir::new().expect("temp dir");
        let log = DiagnosticLog::new(dir.path().join("log.json"));
        let mut record = DiagnosticRecord::new(OrganizerKind::Ai, "contract_violation");
        record.classifier_answer = Some("Bogus".into());
        record.label_calls = vec![LabelStep {
            label: OrganizerKind::Ai.checked_label(),
            delta: LabelDelta::Remove,
            ok: false,
            response: "NO label change rejected".into(),
        }];
        log.record(42, record.clone()).await.expect("record");

        let entries = log.load().await.expect("load");
        assert_eq!(entries.get("42"), Some(&record));
    }
}
