//! Per-peer execution of planned actions
//!
//! Every peer receives the same plan; the executor runs the parts where the
//! local peer has a role. Namespace and metadata operators act on local
//! roots directly, content copies are applied locally or turned into
//! payloads for the transfer batcher. Cancellation stops issuing without a
//! word to the coordinator; an abort still signals issuance finished so the
//! session can reach its end state.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use filetime::FileTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::action::{
    ActionGroup, ActionOperator, ActionTarget, CompletionKind, FsKind, PeerId, SessionId,
    SyncMode,
};
use crate::archive::TransferBatcher;
use crate::config::EngineConfig;
use crate::delta::{apply_delta, DeltaEngine};
use crate::errors::{Result, SyncError};
use crate::replace::ReplaceTransaction;
use crate::reporter::ActionReporter;
use crate::signature::SignatureStore;
use crate::transport::CoordinatorClient;

/// Maps data-part codes to local filesystem roots.
#[derive(Debug, Clone, Default)]
pub struct PartRoots {
    map: HashMap<String, PathBuf>,
}

impl PartRoots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, part: impl Into<String>, root: impl Into<PathBuf>) {
        self.map.insert(part.into(), root.into());
    }

    pub fn resolve(&self, part: &str) -> Result<&Path> {
        self.map
            .get(part)
            .map(PathBuf::as_path)
            .ok_or_else(|| SyncError::UnknownPart(part.to_string()))
    }
}

/// What one pass over an action did on this peer.
enum Outcome {
    Done(CompletionKind),
    /// Payloads handed to the batcher; completion is reported after upload.
    Routed,
    /// No role for the local peer.
    Skipped,
}

pub struct ActionExecutor {
    session: SessionId,
    local_peer: PeerId,
    roots: PartRoots,
    signatures: Arc<SignatureStore>,
    delta: DeltaEngine,
    client: Arc<dyn CoordinatorClient>,
    reporter: ActionReporter,
    batcher: TransferBatcher,
    cancel: CancellationToken,
    abort: Arc<AtomicBool>,
    scratch: PathBuf,
}

impl ActionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: SessionId,
        local_peer: PeerId,
        roots: PartRoots,
        signatures: Arc<SignatureStore>,
        client: Arc<dyn CoordinatorClient>,
        reporter: ActionReporter,
        batcher: TransferBatcher,
        config: &EngineConfig,
        scratch: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session,
            local_peer,
            roots,
            signatures,
            delta: DeltaEngine::new(config.delta_block_size),
            client,
            reporter,
            batcher,
            cancel: CancellationToken::new(),
            abort: Arc::new(AtomicBool::new(false)),
            scratch: scratch.into(),
        }
    }

    /// Token that stops the run loop quietly: in-flight work is drained but
    /// nothing more is issued and no issuance-finished signal is sent.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Flag that turns the run into an abort: issuing stops, in-flight work
    /// is drained, and issuance finished is still signaled.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Execute this peer's share of the plan. Individual action failures are
    /// reported and do not stop the loop; only infrastructure failures
    /// surface as an error.
    pub async fn run(&mut self, actions: &[ActionGroup]) -> Result<()> {
        let sweep_cancel = CancellationToken::new();
        let sweeper = self.reporter.spawn_age_sweeper(sweep_cancel.clone());

        let cancelled = self.issue(actions).await;
        self.batcher.join().await;
        self.reporter.flush().await;
        sweep_cancel.cancel();
        let _ = sweeper.await;

        // A cancelled run drains quietly; issuance finished is not claimed.
        if cancelled {
            return Ok(());
        }
        self.client.inform_issuance_finished(&self.session).await?;
        Ok(())
    }

    /// Issue actions until the plan is exhausted, the abort flag stops
    /// issuance, or cancellation (the `true` return) cuts the run short.
    async fn issue(&mut self, actions: &[ActionGroup]) -> bool {
        for action in actions {
            if self.cancel.is_cancelled() {
                debug!(peer = %self.local_peer, "execution cancelled");
                return true;
            }
            if self.abort.load(Ordering::SeqCst) {
                info!(peer = %self.local_peer, "abort flag set; issuing stops");
                return false;
            }
            self.batcher.flush_aged();

            match self.run_action(action) {
                Ok(Outcome::Done(kind)) => {
                    self.reporter.report_success(kind, action.id).await;
                }
                Ok(Outcome::Routed) | Ok(Outcome::Skipped) => {}
                Err(e) => {
                    warn!(action = %action.id, path = %action.path.display(), %e, "action failed");
                    self.reporter.report_error(action.id).await;
                }
            }
        }
        false
    }

    fn run_action(&mut self, action: &ActionGroup) -> Result<Outcome> {
        match action.operator {
            ActionOperator::Create => self.run_create(action),
            ActionOperator::Delete => self.run_delete(action),
            ActionOperator::CopyDate => self.run_copy_date(action),
            ActionOperator::CopyContentOnly | ActionOperator::CopyContentAndDate => {
                self.run_copy_content(action)
            }
        }
    }

    fn run_create(&self, action: &ActionGroup) -> Result<Outcome> {
        if action.kind == FsKind::File {
            // Planning never emits file creation; file content always
            // arrives through a copy.
            panic!(
                "create action planned for a file: {}",
                action.path.display()
            );
        }
        let mut touched = false;
        for target in self.local_targets(action) {
            let dest = self.roots.resolve(&target.endpoint.part)?.join(&action.path);
            fs::create_dir_all(&dest)?;
            debug!(path = %dest.display(), "directory created");
            touched = true;
        }
        if touched {
            Ok(Outcome::Done(CompletionKind::DirectoryCreated))
        } else {
            Ok(Outcome::Skipped)
        }
    }

    fn run_delete(&self, action: &ActionGroup) -> Result<Outcome> {
        let mut touched = false;
        for target in self.local_targets(action) {
            let dest = self.roots.resolve(&target.endpoint.part)?.join(&action.path);
            match fs::symlink_metadata(&dest) {
                // Already gone counts as done.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
                Ok(meta) if meta.is_dir() => {
                    let empty = fs::read_dir(&dest)?.next().is_none();
                    if empty {
                        fs::remove_dir(&dest)?;
                    } else {
                        fs::remove_dir_all(&dest)?;
                    }
                }
                Ok(_) => fs::remove_file(&dest)?,
            }
            debug!(path = %dest.display(), "deleted");
            touched = true;
        }
        if touched {
            Ok(Outcome::Done(CompletionKind::Deleted))
        } else {
            Ok(Outcome::Skipped)
        }
    }

    fn run_copy_date(&self, action: &ActionGroup) -> Result<Outcome> {
        if action.timestamps.is_none() {
            // Planning always carries the stamp for a date copy; without it
            // there is nothing to apply.
            panic!(
                "date copy planned without timestamps: {}",
                action.path.display()
            );
        }
        let mut touched = false;
        for target in self.local_targets(action) {
            let dest = self.roots.resolve(&target.endpoint.part)?.join(&action.path);
            if !dest.exists() {
                return Err(SyncError::DestinationMissing(dest));
            }
            self.stamp(action, &dest, None)?;
            touched = true;
        }
        if touched {
            Ok(Outcome::Done(CompletionKind::DateCopied))
        } else {
            Ok(Outcome::Skipped)
        }
    }

    fn run_copy_content(&mut self, action: &ActionGroup) -> Result<Outcome> {
        let Some(source) = action.source.as_ref() else {
            panic!(
                "content copy planned without a source: {}",
                action.path.display()
            );
        };
        // The source peer drives content copies; target peers see the
        // content arrive through the receiver.
        if source.peer != self.local_peer {
            return Ok(Outcome::Skipped);
        }
        let source_path = self.roots.resolve(&source.part)?.join(&action.path);

        let mut local_done = false;
        let mut routed = false;
        for target in &action.targets {
            if target.endpoint.peer == self.local_peer {
                let dest = self.roots.resolve(&target.endpoint.part)?.join(&action.path);
                self.apply_local(action, target, &source_path, &dest)?;
                local_done = true;
            } else {
                self.route_remote(action, target, &source_path)?;
                routed = true;
            }
        }
        if local_done {
            Ok(Outcome::Done(CompletionKind::LocalCopyDone))
        } else if routed {
            Ok(Outcome::Routed)
        } else {
            Ok(Outcome::Skipped)
        }
    }

    /// Rewrite a destination on this peer through a replace transaction.
    fn apply_local(
        &self,
        action: &ActionGroup,
        target: &ActionTarget,
        source_path: &Path,
        dest: &Path,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut replacer = ReplaceTransaction::begin(dest)?;
        let outcome = self.fill_and_commit(action, target, source_path, &mut replacer);
        if let Err(e) = outcome {
            replacer.revert(&e);
            return Err(e);
        }
        Ok(())
    }

    fn fill_and_commit(
        &self,
        action: &ActionGroup,
        target: &ActionTarget,
        source_path: &Path,
        replacer: &mut ReplaceTransaction,
    ) -> Result<()> {
        let delta_applied = match (target.mode, target.baseline_signature.as_ref()) {
            (SyncMode::Delta, Some(sig_id)) => match self.signatures.lookup(sig_id) {
                Ok(signature) => {
                    let (delta_path, _) =
                        self.delta
                            .build_to_temp(source_path, &signature, &self.scratch)?;
                    let applied = self.apply_delta_file(&delta_path, replacer);
                    // The delta scratch file is consumed either way.
                    if let Err(e) = fs::remove_file(&delta_path) {
                        warn!(path = %delta_path.display(), %e, "delta scratch not deleted");
                    }
                    applied?;
                    true
                }
                Err(SyncError::SignatureUnavailable(_)) => false,
                Err(e) => return Err(e),
            },
            _ => false,
        };
        if !delta_applied {
            fs::copy(source_path, replacer.incoming_path())?;
        }
        replacer.commit()?;
        replacer.mark_validation_started();
        self.stamp(action, replacer.destination(), Some(source_path))?;
        Ok(())
    }

    fn apply_delta_file(&self, delta_path: &Path, replacer: &ReplaceTransaction) -> Result<()> {
        let delta = BufReader::new(File::open(delta_path)?);
        let mut out = BufWriter::new(File::create(replacer.incoming_path())?);
        apply_delta(replacer.destination(), delta, &mut out)?;
        out.flush()?;
        Ok(())
    }

    /// Produce a payload for a remote target and hand it to the batcher. A
    /// delta target whose baseline signature is gone degrades to a full
    /// copy instead of failing the action.
    fn route_remote(
        &mut self,
        action: &ActionGroup,
        target: &ActionTarget,
        source_path: &Path,
    ) -> Result<()> {
        let (mode, payload) = match (target.mode, target.baseline_signature.as_ref()) {
            (SyncMode::Delta, Some(sig_id)) => match self.signatures.lookup(sig_id) {
                Ok(signature) => {
                    let (path, stats) =
                        self.delta
                            .build_to_temp(source_path, &signature, &self.scratch)?;
                    debug!(
                        action = %action.id,
                        literal = stats.literal_bytes,
                        matched = stats.matched_bytes,
                        "delta payload built"
                    );
                    (SyncMode::Delta, path)
                }
                Err(SyncError::SignatureUnavailable(_)) => {
                    debug!(action = %action.id, "baseline signature gone; sending full content");
                    (SyncMode::Full, self.copy_to_scratch(source_path)?)
                }
                Err(e) => return Err(e),
            },
            _ => (SyncMode::Full, self.copy_to_scratch(source_path)?),
        };
        self.batcher
            .submit(action, &target.endpoint.peer, mode, payload)
    }

    fn copy_to_scratch(&self, source: &Path) -> Result<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix(".treesync-full-")
            .tempfile_in(&self.scratch)?
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)?;
        fs::copy(source, &path)?;
        Ok(path)
    }

    /// Apply the planner's explicit timestamps, or mirror the source mtime
    /// for content-and-date copies. Content-only copies leave the
    /// destination stamps alone.
    fn stamp(&self, action: &ActionGroup, dest: &Path, source: Option<&Path>) -> Result<()> {
        if let Some(times) = &action.timestamps {
            filetime::set_file_mtime(dest, to_file_time(times.modified))?;
        } else if action.operator == ActionOperator::CopyContentAndDate {
            if let Some(source) = source {
                let meta = fs::metadata(source)?;
                filetime::set_file_mtime(dest, FileTime::from_last_modification_time(&meta))?;
            }
        }
        Ok(())
    }

    fn local_targets<'a>(
        &'a self,
        action: &'a ActionGroup,
    ) -> impl Iterator<Item = &'a ActionTarget> {
        action
            .targets
            .iter()
            .filter(|t| t.endpoint.peer == self.local_peer)
    }
}

fn to_file_time(t: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(t.timestamp(), t.timestamp_subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{EndpointRef, SignatureId, StampTimes};
    use crate::session::Coordinator;
    use crate::signature::FileSignature;
    use crate::transport::{LocalCoordinator, MemoryBlobStore, MemoryUploader};
    use tokio::sync::mpsc;

    struct Rig {
        executor: ActionExecutor,
        coordinator: Arc<Coordinator>,
        root: tempfile::TempDir,
        _scratch: tempfile::TempDir,
        signatures: Arc<SignatureStore>,
    }

    async fn rig(peer: &str, members: &[&str], actions: &[ActionGroup]) -> Rig {
        let config = EngineConfig::default();
        let store = Arc::new(MemoryBlobStore::new());
        let coordinator = Arc::new(Coordinator::new(store.clone(), &config));
        let session = SessionId::from("s");
        coordinator
            .start_session(
                &session,
                members.iter().map(|m| PeerId::from(*m)).collect(),
                actions,
            )
            .await
            .unwrap();

        let client: Arc<dyn CoordinatorClient> =
            Arc::new(LocalCoordinator::new(coordinator.clone(), peer.into()));
        let reporter = ActionReporter::new(session.clone(), client.clone(), &config);
        let (tx, _rx) = mpsc::unbounded_channel();
        let root = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let signatures = Arc::new(SignatureStore::new());

        let mut roots = PartRoots::new();
        roots.insert("p1", root.path());
        roots.insert("p2", root.path().join("second"));
        fs::create_dir_all(root.path().join("second")).unwrap();

        let batcher = TransferBatcher::new(
            session.clone(),
            peer.into(),
            Arc::new(MemoryUploader::new(store)),
            reporter.clone(),
            tx,
            &config,
            scratch.path(),
        );
        let executor = ActionExecutor::new(
            session,
            peer.into(),
            roots,
            signatures.clone(),
            client,
            reporter,
            batcher,
            &config,
            scratch.path(),
        );
        Rig {
            executor,
            coordinator,
            root,
            _scratch: scratch,
            signatures,
        }
    }

    fn target_on(peer: &str, part: &str) -> ActionTarget {
        ActionTarget::full(EndpointRef::new(peer, part))
    }

    #[tokio::test]
    async fn namespace_actions_run_locally_and_count() {
        let create = ActionGroup::new(
            ActionOperator::Create,
            FsKind::Directory,
            "nested/dir",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let delete = ActionGroup::new(
            ActionOperator::Delete,
            FsKind::File,
            "old.txt",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let actions = vec![create, delete];
        let mut rig = rig("b", &["b"], &actions).await;
        fs::write(rig.root.path().join("old.txt"), b"stale").unwrap();

        rig.executor.run(&actions).await.unwrap();

        assert!(rig.root.path().join("nested/dir").is_dir());
        assert!(!rig.root.path().join("old.txt").exists());

        let snapshot = rig
            .coordinator
            .snapshot(&SessionId::from("s"))
            .await
            .unwrap();
        assert_eq!(snapshot.finished_actions, 2);
        assert!(snapshot.is_ended(), "single member informed issuance finished");
    }

    #[tokio::test]
    async fn delete_of_absent_path_is_satisfied() {
        let delete = ActionGroup::new(
            ActionOperator::Delete,
            FsKind::File,
            "never-existed.txt",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let actions = vec![delete];
        let mut rig = rig("b", &["b"], &actions).await;

        rig.executor.run(&actions).await.unwrap();
        let snapshot = rig
            .coordinator
            .snapshot(&SessionId::from("s"))
            .await
            .unwrap();
        assert_eq!(snapshot.finished_actions, 1);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test]
    async fn non_empty_directory_delete_is_recursive() {
        let delete = ActionGroup::new(
            ActionOperator::Delete,
            FsKind::Directory,
            "tree",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let actions = vec![delete];
        let mut rig = rig("b", &["b"], &actions).await;
        fs::create_dir_all(rig.root.path().join("tree/leaf")).unwrap();
        fs::write(rig.root.path().join("tree/leaf/f.txt"), b"x").unwrap();

        rig.executor.run(&actions).await.unwrap();
        assert!(!rig.root.path().join("tree").exists());
    }

    #[tokio::test]
    async fn copy_date_requires_destination() {
        let copy_date = ActionGroup::new(
            ActionOperator::CopyDate,
            FsKind::File,
            "missing.txt",
            None,
            vec![target_on("b", "p1")],
            0,
        )
        .with_timestamps(StampTimes {
            modified: Utc::now(),
            created: None,
        });
        let actions = vec![copy_date];
        let mut rig = rig("b", &["b"], &actions).await;

        rig.executor.run(&actions).await.unwrap();
        let snapshot = rig
            .coordinator
            .snapshot(&SessionId::from("s"))
            .await
            .unwrap();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.finished_actions, 0);
    }

    #[tokio::test]
    async fn local_full_copy_rewrites_destination() {
        let copy = ActionGroup::new(
            ActionOperator::CopyContentAndDate,
            FsKind::File,
            "doc.txt",
            Some(EndpointRef::new("b", "p1")),
            vec![target_on("b", "p2")],
            9,
        );
        let actions = vec![copy];
        let mut rig = rig("b", &["b"], &actions).await;
        fs::write(rig.root.path().join("doc.txt"), b"fresh txt").unwrap();
        fs::write(rig.root.path().join("second/doc.txt"), b"old").unwrap();

        rig.executor.run(&actions).await.unwrap();
        assert_eq!(
            fs::read(rig.root.path().join("second/doc.txt")).unwrap(),
            b"fresh txt"
        );
        let snapshot = rig
            .coordinator
            .snapshot(&SessionId::from("s"))
            .await
            .unwrap();
        assert_eq!(snapshot.finished_actions, 1);
        assert_eq!(snapshot.processed_volume, 9);
    }

    #[tokio::test]
    async fn local_delta_copy_uses_published_baseline() {
        let sig_id = SignatureId::from("doc-baseline");
        let copy = ActionGroup::new(
            ActionOperator::CopyContentOnly,
            FsKind::File,
            "doc.txt",
            Some(EndpointRef::new("b", "p1")),
            vec![ActionTarget::delta(
                EndpointRef::new("b", "p2"),
                sig_id.clone(),
            )],
            0,
        );
        let actions = vec![copy];
        let mut rig = rig("b", &["b"], &actions).await;
        let baseline = b"shared prefix that mostly survives the edit".to_vec();
        let mut new_content = baseline.clone();
        new_content.extend_from_slice(b" plus a new tail");
        fs::write(rig.root.path().join("doc.txt"), &new_content).unwrap();
        fs::write(rig.root.path().join("second/doc.txt"), &baseline).unwrap();
        rig.signatures
            .publish(sig_id, FileSignature::index_bytes(&baseline, 8));

        rig.executor.run(&actions).await.unwrap();
        assert_eq!(
            fs::read(rig.root.path().join("second/doc.txt")).unwrap(),
            new_content
        );
    }

    #[tokio::test]
    async fn cancellation_stops_without_issuance_signal() {
        let delete = ActionGroup::new(
            ActionOperator::Delete,
            FsKind::File,
            "old.txt",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let actions = vec![delete];
        let mut rig = rig("b", &["b"], &actions).await;
        fs::write(rig.root.path().join("old.txt"), b"stale").unwrap();

        rig.executor.cancellation_token().cancel();
        rig.executor.run(&actions).await.unwrap();

        assert!(rig.root.path().join("old.txt").exists(), "nothing was issued");
        let snapshot = rig
            .coordinator
            .snapshot(&SessionId::from("s"))
            .await
            .unwrap();
        assert!(snapshot.completed_members.is_empty());
        assert!(!snapshot.is_ended());
    }

    #[tokio::test]
    async fn abort_still_signals_issuance_finished() {
        let delete = ActionGroup::new(
            ActionOperator::Delete,
            FsKind::File,
            "old.txt",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let actions = vec![delete];
        let mut rig = rig("b", &["b"], &actions).await;
        fs::write(rig.root.path().join("old.txt"), b"stale").unwrap();

        rig.executor.abort_flag().store(true, Ordering::SeqCst);
        rig.executor.run(&actions).await.unwrap();

        assert!(rig.root.path().join("old.txt").exists());
        let snapshot = rig
            .coordinator
            .snapshot(&SessionId::from("s"))
            .await
            .unwrap();
        assert!(snapshot.completed_members.contains(&PeerId::from("b")));
    }

    #[tokio::test]
    #[should_panic(expected = "create action planned for a file")]
    async fn create_planned_for_a_file_is_a_contract_violation() {
        let create = ActionGroup::new(
            ActionOperator::Create,
            FsKind::File,
            "f.txt",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let actions = vec![create];
        let mut rig = rig("b", &["b"], &actions).await;
        rig.executor.run(&actions).await.unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "date copy planned without timestamps")]
    async fn date_copy_without_timestamps_is_a_contract_violation() {
        let copy_date = ActionGroup::new(
            ActionOperator::CopyDate,
            FsKind::File,
            "bare.txt",
            None,
            vec![target_on("b", "p1")],
            0,
        );
        let actions = vec![copy_date];
        let mut rig = rig("b", &["b"], &actions).await;
        fs::write(rig.root.path().join("bare.txt"), b"x").unwrap();
        rig.executor.run(&actions).await.unwrap();
    }
}
