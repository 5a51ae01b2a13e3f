//! Short-lived upload sessions between preview and confirm.
//!
//! A session holds no authoritative state. An abandoned one simply expires.

use crate::categories::CategoryResolution;
use crate::error::{Result, RoyaltyError};
use crate::extractor::RawSheet;
use crate::schema::ColumnMapping;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: Uuid,
    pub contract_id: String,
    pub source_filename: String,
    /// Parsed sheet, so confirm does not need the file again
    pub sheet: RawSheet,
    pub suggested_mapping: ColumnMapping,
    pub suggested_categories: Option<CategoryResolution>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn new(
        contract_id: impl Into<String>,
        source_filename: impl Into<String>,
        sheet: RawSheet,
        suggested_mapping: ColumnMapping,
        suggested_categories: Option<CategoryResolution>,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            upload_id: Uuid::new_v4(),
            contract_id: contract_id.into(),
            source_filename: source_filename.into(),
            sheet,
            suggested_mapping,
            suggested_categories,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Keyed store for upload sessions. Expired sessions read as absent.
#[async_trait]
pub trait UploadSessionStore: Send + Sync {
    async fn put(&self, session: UploadSession) -> Result<()>;

    async fn get(&self, upload_id: Uuid) -> Result<Option<UploadSession>>;

    async fn remove(&self, upload_id: Uuid) -> Result<()>;

    /// Drops every expired session and returns how many were removed.
    async fn purge_expired(&self) -> Result<usize>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<Uuid, UploadSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[async_trait]
impl UploadSessionStore for InMemorySessionStore {
    async fn put(&self, session: UploadSession) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(session.upload_id, session);
        Ok(())
    }

    async fn get(&self, upload_id: Uuid) -> Result<Option<UploadSession>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&upload_id)
            .filter(|s| !s.is_expired(Utc::now()))
            .cloned())
    }

    async fn remove(&self, upload_id: Uuid) -> Result<()> {
        self.sessions.write().await.remove(&upload_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(now));
        Ok(before - sessions.len())
    }
}

/// One JSON file per session in a shared directory, so any process that
/// mounts the directory can confirm an upload another one previewed.
pub struct DirectorySessionStore {
    dir: PathBuf,
}

impl DirectorySessionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, upload_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", upload_id))
    }

    async fn read_session(path: &Path) -> Result<Option<UploadSession>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                RoyaltyError::Storage(format!("corrupt session file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(path: &Path) -> Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl UploadSessionStore for DirectorySessionStore {
    async fn put(&self, session: UploadSession) -> Result<()> {
        let path = self.path_for(session.upload_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec(&session)?;
        tokio::fs::write(&tmp, json).await?;
        // Readers never see a half-written file.
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Wrote upload session {}", path.display());
        Ok(())
    }

    async fn get(&self, upload_id: Uuid) -> Result<Option<UploadSession>> {
        let path = self.path_for(upload_id);
        let Some(session) = Self::read_session(&path).await? else {
            return Ok(None);
        };
        if session.is_expired(Utc::now()) {
            Self::remove_file(&path).await?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn remove(&self, upload_id: Uuid) -> Result<()> {
        Self::remove_file(&self.path_for(upload_id)).await
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_session(&path).await {
                Ok(Some(session)) if session.is_expired(now) => {
                    Self::remove_file(&path).await?;
                    removed += 1;
                }
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable session file {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}

/// Loads a live session and checks it belongs to `contract_id`.
pub async fn load_for_contract(
    store: &dyn UploadSessionStore,
    upload_id: Uuid,
    contract_id: &str,
) -> Result<UploadSession> {
    let session = store
        .get(upload_id)
        .await?
        .ok_or(RoyaltyError::SessionNotFound(upload_id))?;
    if session.contract_id != contract_id {
        return Err(RoyaltyError::SessionContractMismatch {
            upload_id,
            expected: session.contract_id,
            actual: contract_id.to_string(),
        });
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::extractor::extract;

    fn session(ttl: Duration) -> UploadSession {
        let sheet = extract(
            b"Product,Net Sales\nTee,100\n",
            "report.csv",
            &PipelineConfig::default(),
        )
        .unwrap();
        UploadSession::new(
            "c-1",
            "report.csv",
            sheet,
            ColumnMapping::new(),
            None,
            ttl,
        )
    }

    #[tokio::test]
    async fn test_in_memory_expiry_and_purge() {
        let store = InMemorySessionStore::new();
        let live = session(Duration::hours(1));
        let stale = session(Duration::seconds(-1));
        let (live_id, stale_id) = (live.upload_id, stale.upload_id);
        store.put(live).await.unwrap();
        store.put(stale).await.unwrap();

        assert!(store.get(live_id).await.unwrap().is_some());
        assert!(store.get(stale_id).await.unwrap().is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);

        store.remove(live_id).await.unwrap();
        assert!(store.get(live_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_contract_mismatch() {
        let store = InMemorySessionStore::new();
        let s = session(Duration::hours(1));
        let id = s.upload_id;
        store.put(s).await.unwrap();

        assert!(load_for_contract(&store, id, "c-1").await.is_ok());
        let err = load_for_contract(&store, id, "c-2").await.unwrap_err();
        assert!(matches!(err, RoyaltyError::SessionContractMismatch { .. }));
        let err = load_for_contract(&store, Uuid::new_v4(), "c-1")
            .await
            .unwrap_err();
        assert!(matches!(err, RoyaltyError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_directory_store_is_shared_between_instances() {
        let dir = std::env::temp_dir().join(format!("upload-sessions-{}", Uuid::new_v4()));
        let writer = DirectorySessionStore::open(&dir).await.unwrap();
        let reader = DirectorySessionStore::open(&dir).await.unwrap();

        let s = session(Duration::hours(1));
        let id = s.upload_id;
        writer.put(s.clone()).await.unwrap();

        let loaded = reader.get(id).await.unwrap().unwrap();
        assert_eq!(loaded, s);

        reader.remove(id).await.unwrap();
        assert!(writer.get(id).await.unwrap().is_none());

        writer.put(session(Duration::seconds(-1))).await.unwrap();
        assert_eq!(reader.purge_expired().await.unwrap(), 1);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_session_file_is_a_storage_error() {
        let dir = std::env::temp_dir().join(format!("upload-sessions-{}", Uuid::new_v4()));
        let store = DirectorySessionStore::open(&dir).await.unwrap();
        let id = Uuid::new_v4();
        tokio::fs::write(store.path_for(id), b"{ not json").await.unwrap();

        let err = store.get(id).await.unwrap_err();
        assert!(matches!(err, RoyaltyError::Storage(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Collaborator);
        // A purge skips the file instead of failing.
        assert_eq!(store.purge_expired().await.unwrap(), 0);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
