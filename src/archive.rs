//! Outbound transfer batching
//!
//! Shipping thousands of small files as individual blobs drowns the transfer
//! plane in per-object overhead, so the batcher folds small payloads into a
//! shared tar archive per (operator, target peer) and ships the archive as
//! one artifact. Large payloads bypass batching: a large whole file becomes
//! a single-entry archive of its own, a large delta ships as a raw delta
//! stream. Every archive carries a JSON manifest as its LAST entry so the
//! receiver can stream the content entries to disk before reading it.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::action::{
    ActionGroup, ActionGroupId, ActionOperator, ArtifactKind, CompletionKind, PeerId, SessionId,
    SyncMode, TransferArtifact,
};
use crate::errors::Result;
use crate::reporter::ActionReporter;
use crate::transport::ArtifactUploader;

/// Reserved tar entry name of the archive manifest.
pub const MANIFEST_ENTRY: &str = ".treesync-manifest.json";

/// Maps every content entry of an archive back to its action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Tar entry name, unique within the archive.
    pub name: String,
    pub action_id: ActionGroupId,
    /// How the receiver applies this entry: whole content or a delta
    /// against its published baseline.
    pub mode: SyncMode,
}

/// An uploaded artifact plus the peer that must download it, handed to
/// whoever announces artifacts to the coordinator.
#[derive(Debug, Clone)]
pub struct ArtifactAnnouncement {
    pub artifact: TransferArtifact,
    pub recipient: PeerId,
}

/// Entries for different operators or different targets never share an
/// archive.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchKey {
    operator: ActionOperator,
    target: PeerId,
}

struct OpenArchive {
    key: BatchKey,
    builder: tar::Builder<File>,
    path: PathBuf,
    opened_at: Instant,
    total_bytes: u64,
    manifest: ArchiveManifest,
    action_ids: Vec<ActionGroupId>,
}

/// Folds outbound payloads into archives and ships them through a bounded
/// two-stage pipeline (pack, then upload). Owned by one executor; not
/// shared.
pub struct TransferBatcher {
    session: SessionId,
    owner: PeerId,
    uploader: Arc<dyn ArtifactUploader>,
    reporter: ActionReporter,
    announcements: mpsc::UnboundedSender<ArtifactAnnouncement>,
    small_file_limit: u64,
    archive_max_size: u64,
    archive_window: Duration,
    pack_permits: Arc<Semaphore>,
    upload_permits: Arc<Semaphore>,
    current: Option<OpenArchive>,
    inflight: JoinSet<()>,
    scratch_dir: PathBuf,
}

impl TransferBatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionId,
        owner: PeerId,
        uploader: Arc<dyn ArtifactUploader>,
        reporter: ActionReporter,
        announcements: mpsc::UnboundedSender<ArtifactAnnouncement>,
        config: &crate::config::EngineConfig,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session,
            owner,
            uploader,
            reporter,
            announcements,
            small_file_limit: config.small_file_limit,
            archive_max_size: config.archive_max_size,
            archive_window: config.archive_window,
            pack_permits: Arc::new(Semaphore::new(config.pack_concurrency)),
            upload_permits: Arc::new(Semaphore::new(config.upload_concurrency)),
            current: None,
            inflight: JoinSet::new(),
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Hand over one outbound payload file. The file is a scratch product of
    /// the executor and is deleted here once placed, whether placement
    /// succeeded or not.
    pub fn submit(
        &mut self,
        action: &ActionGroup,
        target: &PeerId,
        mode: SyncMode,
        payload: PathBuf,
    ) -> Result<()> {
        let size = std::fs::metadata(&payload)?.len();
        if size > self.small_file_limit {
            self.spawn_standalone(action, target, mode, payload, size);
            return Ok(());
        }

        let key = BatchKey {
            operator: action.operator,
            target: target.clone(),
        };
        let must_flush = match &self.current {
            Some(open) => {
                open.key != key
                    || open.total_bytes + size > self.archive_max_size
                    || open.opened_at.elapsed() >= self.archive_window
            }
            None => false,
        };
        if must_flush {
            self.flush_current();
        }

        let placed = self.append_to_current(action, key, mode, &payload, size);
        if let Err(e) = std::fs::remove_file(&payload) {
            warn!(path = %payload.display(), %e, "scratch payload not deleted");
        }
        placed
    }

    fn append_to_current(
        &mut self,
        action: &ActionGroup,
        key: BatchKey,
        mode: SyncMode,
        payload: &Path,
        size: u64,
    ) -> Result<()> {
        let open = match self.current.as_mut() {
            Some(open) => open,
            None => {
                let (file, path) = tempfile::Builder::new()
                    .prefix(".treesync-archive-")
                    .tempfile_in(&self.scratch_dir)?
                    .keep()
                    .map_err(|e| e.error)?;
                debug!(path = %path.display(), ?key.operator, target = %key.target, "archive opened");
                self.current.insert(OpenArchive {
                    key,
                    builder: tar::Builder::new(file),
                    path,
                    opened_at: Instant::now(),
                    total_bytes: 0,
                    manifest: ArchiveManifest { entries: Vec::new() },
                    action_ids: Vec::new(),
                })
            }
        };

        let name = action.id.to_string();
        let mut src = File::open(payload)?;
        open.builder.append_file(&name, &mut src)?;
        open.total_bytes += size;
        open.manifest.entries.push(ManifestEntry {
            name,
            action_id: action.id,
            mode,
        });
        open.action_ids.push(action.id);
        Ok(())
    }

    /// Ship the open archive, if any sat past the batching window.
    pub fn flush_aged(&mut self) {
        let aged = self
            .current
            .as_ref()
            .is_some_and(|open| open.opened_at.elapsed() >= self.archive_window);
        if aged {
            self.flush_current();
        }
    }

    /// Seal the open archive and ship it through the pack/upload pipeline.
    fn flush_current(&mut self) {
        let Some(open) = self.current.take() else {
            return;
        };
        let OpenArchive {
            key,
            builder,
            path,
            manifest,
            action_ids,
            total_bytes,
            ..
        } = open;
        debug!(bytes = total_bytes, entries = action_ids.len(), "archive sealed");

        let artifact = TransferArtifact::new(
            self.session.clone(),
            self.owner.clone(),
            ArtifactKind::FullContentTransfer,
            action_ids.clone(),
        );
        let announcement = ArtifactAnnouncement {
            artifact: artifact.clone(),
            recipient: key.target,
        };
        let uploader = self.uploader.clone();
        let reporter = self.reporter.clone();
        let announcements = self.announcements.clone();
        let pack_permits = self.pack_permits.clone();
        let upload_permits = self.upload_permits.clone();

        self.inflight.spawn(async move {
            let sealed = {
                let _permit = match pack_permits.acquire_owned().await {
                    Ok(permit) => permit,
                    // The semaphore is never closed while tasks run.
                    Err(_) => return,
                };
                tokio::task::spawn_blocking(move || seal_archive(builder, &manifest)).await
            };
            match sealed {
                Ok(Ok(())) => {
                    ship(
                        uploader,
                        reporter,
                        announcements,
                        upload_permits,
                        artifact,
                        announcement,
                        &path,
                        &action_ids,
                    )
                    .await;
                }
                Ok(Err(e)) => {
                    warn!(%e, "archive sealing failed");
                    for id in &action_ids {
                        reporter.report_error(*id).await;
                    }
                }
                Err(e) => {
                    warn!(%e, "archive sealing task lost");
                    for id in &action_ids {
                        reporter.report_error(*id).await;
                    }
                }
            }
            remove_scratch(&path).await;
        });
    }

    /// Ship one oversized payload on its own. A whole file still travels as
    /// a single-entry archive so every full-content artifact has the same
    /// shape; a delta travels raw.
    fn spawn_standalone(
        &mut self,
        action: &ActionGroup,
        target: &PeerId,
        mode: SyncMode,
        payload: PathBuf,
        size: u64,
    ) {
        debug!(action = %action.id, bytes = size, ?mode, "payload bypasses batching");
        let kind = match mode {
            SyncMode::Full => ArtifactKind::FullContentTransfer,
            SyncMode::Delta => ArtifactKind::DeltaContentTransfer,
        };
        let artifact = TransferArtifact::new(
            self.session.clone(),
            self.owner.clone(),
            kind,
            vec![action.id],
        );
        let announcement = ArtifactAnnouncement {
            artifact: artifact.clone(),
            recipient: target.clone(),
        };
        let action_ids = vec![action.id];
        let action_id = action.id;
        let uploader = self.uploader.clone();
        let reporter = self.reporter.clone();
        let announcements = self.announcements.clone();
        let pack_permits = self.pack_permits.clone();
        let upload_permits = self.upload_permits.clone();
        let scratch_dir = self.scratch_dir.clone();

        self.inflight.spawn(async move {
            let shippable = match mode {
                SyncMode::Delta => Ok(payload.clone()),
                SyncMode::Full => {
                    let packed = {
                        let _permit = match pack_permits.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(_) => return,
                        };
                        let source = payload.clone();
                        tokio::task::spawn_blocking(move || {
                            pack_single(&source, action_id, &scratch_dir)
                        })
                        .await
                    };
                    remove_scratch(&payload).await;
                    match packed {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(%e, "packing task lost");
                            reporter.report_error(action_id).await;
                            return;
                        }
                    }
                }
            };
            match shippable {
                Ok(path) => {
                    ship(
                        uploader,
                        reporter,
                        announcements,
                        upload_permits,
                        artifact,
                        announcement,
                        &path,
                        &action_ids,
                    )
                    .await;
                    remove_scratch(&path).await;
                }
                Err(e) => {
                    warn!(%e, "standalone payload not packed");
                    reporter.report_error(action_id).await;
                }
            }
        });
    }

    /// Seal whatever is open and wait for every inflight upload.
    pub async fn join(&mut self) {
        self.flush_current();
        while self.inflight.join_next().await.is_some() {}
    }

    #[cfg(test)]
    fn backdate_current(&mut self, by: Duration) {
        if let Some(open) = self.current.as_mut() {
            open.opened_at -= by;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ship(
    uploader: Arc<dyn ArtifactUploader>,
    reporter: ActionReporter,
    announcements: mpsc::UnboundedSender<ArtifactAnnouncement>,
    upload_permits: Arc<Semaphore>,
    artifact: TransferArtifact,
    announcement: ArtifactAnnouncement,
    path: &Path,
    action_ids: &[ActionGroupId],
) {
    let _permit = match upload_permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    match uploader.upload(&artifact, path).await {
        Ok(bytes) => {
            debug!(artifact = %artifact.id, bytes, "artifact uploaded");
            for id in action_ids {
                reporter
                    .report_success(CompletionKind::UploadFinished, *id)
                    .await;
            }
            if announcements.send(announcement).is_err() {
                warn!(artifact = %artifact.id, "nobody listening for artifact announcements");
            }
        }
        Err(e) => {
            warn!(artifact = %artifact.id, %e, "artifact upload failed");
            for id in action_ids {
                reporter.report_error(*id).await;
            }
        }
    }
}

/// Append the manifest as the final entry and finish the tar stream.
fn seal_archive(mut builder: tar::Builder<File>, manifest: &ArchiveManifest) -> Result<()> {
    let data = serde_json::to_vec(manifest)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, MANIFEST_ENTRY, data.as_slice())?;
    builder.into_inner()?;
    Ok(())
}

fn pack_single(payload: &Path, action_id: ActionGroupId, scratch_dir: &Path) -> Result<PathBuf> {
    let (file, path) = tempfile::Builder::new()
        .prefix(".treesync-archive-")
        .tempfile_in(scratch_dir)?
        .keep()
        .map_err(|e| e.error)?;
    let mut builder = tar::Builder::new(file);
    let name = action_id.to_string();
    let mut src = File::open(payload)?;
    builder.append_file(&name, &mut src)?;
    let manifest = ArchiveManifest {
        entries: vec![ManifestEntry {
            name,
            action_id,
            mode: SyncMode::Full,
        }],
    };
    seal_archive(builder, &manifest)?;
    Ok(path)
}

async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), %e, "scratch file not deleted");
    }
}
