//! gpubid-store: Durable state storage
//!
//! The whole scheduler state is one JSON document persisted to a single file.
//! Writes go to a sibling temp file, fsync, then an atomic rename over the
//! target; the document on disk is never truncated in place. Reads happen
//! once at startup; afterwards the in-memory document is authoritative.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use gpubid_core::{Document, SchedError, SchedResult};

/// Name of the state document inside the data directory
pub const STATE_FILE: &str = "state.json";

/// File-backed document store
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Create a store rooted at the given data directory
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(STATE_FILE),
        }
    }

    /// Path of the state document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, or `None` on a fresh install
    pub async fn load(&self) -> SchedResult<Option<Document>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let doc: Document = serde_json::from_slice(&bytes).map_err(|e| {
                    SchedError::Storage(format!(
                        "Corrupt state document {}: {}",
                        self.path.display(),
                        e
                    ))
                })?;
                info!(
                    path = %self.path.display(),
                    days = doc.days.len(),
                    users = doc.users.len(),
                    "Loaded state document"
                );
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SchedError::Storage(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Durably persist the document with an atomic temp-file swap
    pub async fn persist(&self, doc: &Document) -> SchedResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Persisted state document");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpubid_core::{Day, DayStatus, Role, ScheduleConfig, User};
    use rust_decimal_macros::dec;

    fn sample_doc() -> Document {
        let mut doc = Document::new(ScheduleConfig::default());
        let mut user = User::new("alice", "ff".to_string(), "00".to_string(), Role::User, 10);
        user.balance = dec!(7.34);
        doc.users.insert("alice".to_string(), user);
        doc.days
            .insert("2025-08-02".to_string(), Day::new(DayStatus::Executing, 4));
        doc.days
            .insert("2025-08-03".to_string(), Day::new(DayStatus::Open, 4));
        doc
    }

    #[tokio::test]
    async fn test_load_fresh_install() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_round_trip_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());

        store.persist(&sample_doc()).await.unwrap();
        let first = tokio::fs::read(store.path()).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        store.persist(&loaded).await.unwrap();
        let second = tokio::fs::read(store.path()).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.persist(&sample_doc()).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STATE_FILE.to_string()]);
    }

    #[tokio::test]
    async fn test_preserves_balance_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        store.persist(&sample_doc()).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.users["alice"].balance, dec!(7.34));
    }

    #[tokio::test]
    async fn test_corrupt_document_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        tokio::fs::write(store.path(), b"{not json").await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(SchedError::Storage(_))
        ));
    }
}
