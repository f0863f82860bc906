//! Seams between the engine and the outside world
//!
//! The executor and receiver talk to the coordinator and to blob storage
//! only through the traits here, so the whole engine runs unchanged against
//! an in-process coordinator, a remote one, or the in-memory fakes used by
//! the tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tracing::debug;

use crate::action::{ActionGroupId, CompletionKind, PeerId, SessionId, TransferArtifact};
use crate::errors::{Result, SyncError};
use crate::session::Coordinator;

/// Completion reporting as seen from one peer. The peer identity is bound
/// into the client, not passed per call.
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    async fn assert_action_done(
        &self,
        session: &SessionId,
        kind: CompletionKind,
        ids: &[ActionGroupId],
    ) -> Result<()>;

    async fn assert_action_errors(&self, session: &SessionId, ids: &[ActionGroupId])
        -> Result<()>;

    async fn inform_issuance_finished(&self, session: &SessionId) -> Result<()>;

    async fn request_abort(&self, session: &SessionId) -> Result<()>;
}

/// Client for a coordinator living in the same process.
pub struct LocalCoordinator {
    coordinator: Arc<Coordinator>,
    peer: PeerId,
}

impl LocalCoordinator {
    pub fn new(coordinator: Arc<Coordinator>, peer: PeerId) -> Self {
        Self { coordinator, peer }
    }
}

#[async_trait]
impl CoordinatorClient for LocalCoordinator {
    async fn assert_action_done(
        &self,
        session: &SessionId,
        kind: CompletionKind,
        ids: &[ActionGroupId],
    ) -> Result<()> {
        self.coordinator
            .assert_action_done(session, &self.peer, kind, ids)
            .await
    }

    async fn assert_action_errors(
        &self,
        session: &SessionId,
        ids: &[ActionGroupId],
    ) -> Result<()> {
        self.coordinator
            .assert_action_errors(session, &self.peer, ids)
            .await
    }

    async fn inform_issuance_finished(&self, session: &SessionId) -> Result<()> {
        self.coordinator
            .inform_issuance_finished(session, &self.peer)
            .await
    }

    async fn request_abort(&self, session: &SessionId) -> Result<()> {
        self.coordinator.request_abort(session, &self.peer).await
    }
}

/// Moves a finished payload file into blob storage under the artifact's
/// object key. Returns the number of bytes shipped.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(&self, artifact: &TransferArtifact, payload: &Path) -> Result<u64>;
}

/// Blob storage as the coordinator sees it.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload_url(&self, key: &str) -> Result<String>;
    async fn download_url(&self, key: &str) -> Result<String>;
    async fn delete_object(&self, key: &str) -> Result<()>;
    async fn object_size(&self, key: &str) -> Result<u64>;
}

/// In-memory blob store used by the tests and by single-process setups.
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().insert(key.to_string(), data);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload_url(&self, key: &str) -> Result<String> {
        Ok(format!("memory://{key}"))
    }

    async fn download_url(&self, key: &str) -> Result<String> {
        if self.objects.lock().contains_key(key) {
            Ok(format!("memory://{key}"))
        } else {
            Err(SyncError::Transport(format!("no such object: {key}")))
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn object_size(&self, key: &str) -> Result<u64> {
        self.objects
            .lock()
            .get(key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| SyncError::Transport(format!("no such object: {key}")))
    }
}

/// Uploader writing straight into a [`MemoryBlobStore`].
pub struct MemoryUploader {
    store: Arc<MemoryBlobStore>,
}

impl MemoryUploader {
    pub fn new(store: Arc<MemoryBlobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArtifactUploader for MemoryUploader {
    async fn upload(&self, artifact: &TransferArtifact, payload: &Path) -> Result<u64> {
        let data = fs::read(payload).await?;
        let len = data.len() as u64;
        let key = artifact.object_key();
        debug!(%key, bytes = len, "payload stored");
        self.store.put(&key, data);
        Ok(len)
    }
}
