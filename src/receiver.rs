//! Inbound artifact application
//!
//! Counterpart of the transfer batcher: takes a downloaded artifact and
//! rewrites the local destinations it carries. Archives are unpacked into a
//! staging directory, then each manifest entry goes through its own replace
//! transaction; a raw delta stream rewrites a single destination. Every
//! rewrite is reported as a finished download, every failed entry as an
//! error, without stopping the rest of the archive.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::action::{
    ActionGroup, ActionGroupId, ArtifactKind, CompletionKind, PeerId, SyncMode, TransferArtifact,
};
use crate::archive::{ArchiveManifest, ManifestEntry, MANIFEST_ENTRY};
use crate::delta::apply_delta;
use crate::errors::{Result, SyncError};
use crate::executor::PartRoots;
use crate::replace::ReplaceTransaction;
use crate::reporter::ActionReporter;

pub struct TransferReceiver {
    local_peer: PeerId,
    roots: PartRoots,
    plan: HashMap<ActionGroupId, ActionGroup>,
    reporter: ActionReporter,
}

impl TransferReceiver {
    pub fn new(
        local_peer: PeerId,
        roots: PartRoots,
        actions: &[ActionGroup],
        reporter: ActionReporter,
    ) -> Self {
        Self {
            local_peer,
            roots,
            plan: actions.iter().map(|a| (a.id, a.clone())).collect(),
            reporter,
        }
    }

    /// Apply one downloaded artifact to the local roots.
    pub async fn apply_artifact(
        &self,
        artifact: &TransferArtifact,
        payload: &[u8],
    ) -> Result<()> {
        debug!(artifact = %artifact.id, ?artifact.kind, bytes = payload.len(), "applying artifact");
        match artifact.kind {
            ArtifactKind::DeltaContentTransfer => self.apply_raw_delta(artifact, payload).await,
            ArtifactKind::FullContentTransfer => self.apply_archive(artifact, payload).await,
            other => Err(SyncError::Transport(format!(
                "artifact kind {other:?} carries no file content"
            ))),
        }
    }

    /// A standalone delta stream rewrites exactly one destination, with the
    /// current destination content as the baseline.
    async fn apply_raw_delta(
        &self,
        artifact: &TransferArtifact,
        payload: &[u8],
    ) -> Result<()> {
        let Some(id) = artifact.action_ids.first() else {
            return Err(SyncError::Transport(format!(
                "delta artifact {} names no action",
                artifact.id
            )));
        };
        let action = self.action(*id)?;
        let dest = self.dest_for(action)?;
        let applied = self.rewrite(action, &dest, |replacer| {
            let mut out = BufWriter::new(File::create(replacer.incoming_path())?);
            apply_delta(replacer.destination(), Cursor::new(payload), &mut out)?;
            out.flush()?;
            Ok(())
        });
        match applied {
            Ok(()) => {
                self.reporter
                    .report_success(CompletionKind::DownloadFinished, *id)
                    .await;
            }
            Err(e) => {
                warn!(action = %id, %e, "delta stream not applied");
                self.reporter.report_error(*id).await;
            }
        }
        Ok(())
    }

    async fn apply_archive(&self, artifact: &TransferArtifact, payload: &[u8]) -> Result<()> {
        let staging = tempfile::tempdir()?;
        let mut manifest: Option<ArchiveManifest> = None;

        let mut archive = tar::Archive::new(Cursor::new(payload));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.display().to_string();
            if name == MANIFEST_ENTRY {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                manifest = Some(serde_json::from_slice(&data)?);
            } else {
                entry.unpack_in(staging.path())?;
            }
        }
        let Some(manifest) = manifest else {
            return Err(SyncError::Transport(format!(
                "archive {} carries no manifest",
                artifact.id
            )));
        };

        for entry in &manifest.entries {
            let staged = staging.path().join(&entry.name);
            match self.apply_entry(entry, &staged) {
                Ok(()) => {
                    self.reporter
                        .report_success(CompletionKind::DownloadFinished, entry.action_id)
                        .await;
                }
                Err(e) => {
                    warn!(action = %entry.action_id, %e, "archive entry not applied");
                    self.reporter.report_error(entry.action_id).await;
                }
            }
        }
        Ok(())
    }

    fn apply_entry(&self, entry: &ManifestEntry, staged: &Path) -> Result<()> {
        let action = self.action(entry.action_id)?;
        let dest = self.dest_for(action)?;
        match entry.mode {
            SyncMode::Full => self.rewrite(action, &dest, |replacer| {
                fs::copy(staged, replacer.incoming_path())?;
                Ok(())
            }),
            SyncMode::Delta => self.rewrite(action, &dest, |replacer| {
                let delta = BufReader::new(File::open(staged)?);
                let mut out = BufWriter::new(File::create(replacer.incoming_path())?);
                apply_delta(replacer.destination(), delta, &mut out)?;
                out.flush()?;
                Ok(())
            }),
        }
    }

    fn rewrite(
        &self,
        action: &ActionGroup,
        dest: &Path,
        fill: impl FnOnce(&ReplaceTransaction) -> Result<()>,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut replacer = ReplaceTransaction::begin(dest)?;
        match fill_then_commit(action, &mut replacer, fill) {
            Ok(()) => Ok(()),
            Err(e) => {
                replacer.revert(&e);
                Err(e)
            }
        }
    }

    fn action(&self, id: ActionGroupId) -> Result<&ActionGroup> {
        self.plan
            .get(&id)
            .ok_or_else(|| SyncError::Transport(format!("artifact names unknown action {id}")))
    }

    fn dest_for(&self, action: &ActionGroup) -> Result<PathBuf> {
        let target = action
            .targets
            .iter()
            .find(|t| t.endpoint.peer == self.local_peer)
            .ok_or_else(|| {
                SyncError::Transport(format!(
                    "action {} has no target on this peer",
                    action.id
                ))
            })?;
        Ok(self.roots.resolve(&target.endpoint.part)?.join(&action.path))
    }
}

fn fill_then_commit(
    action: &ActionGroup,
    replacer: &mut ReplaceTransaction,
    fill: impl FnOnce(&ReplaceTransaction) -> Result<()>,
) -> Result<()> {
    fill(replacer)?;
    replacer.commit()?;
    replacer.mark_validation_started();
    stamp(action, replacer.destination())
}

/// Only explicit planner timestamps can be applied here; the source mtime
/// never crosses the wire.
fn stamp(action: &ActionGroup, dest: &Path) -> Result<()> {
    if let Some(times) = &action.timestamps {
        filetime::set_file_mtime(
            dest,
            filetime::FileTime::from_unix_time(
                times.modified.timestamp(),
                times.modified.timestamp_subsec_nanos(),
            ),
        )?;
    }
    Ok(())
}
