//! Coordinator-side session registry
//!
//! All cross-peer mutable state lives here: one [`ProgressAggregate`] and one
//! set of tracking records per session, behind an explicit store keyed by
//! session id (no ambient globals). Every mutation goes through a
//! bounded-wait session lock; peers receive state changes as
//! [`SessionEvent`] pushes over a broadcast channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::action::{
    ActionGroup, ActionGroupId, ArtifactId, PeerId, SessionId, TransferArtifact,
};
use crate::config::EngineConfig;
use crate::errors::{Result, SyncError};
use crate::ledger::TrackingAction;
use crate::transport::BlobStore;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndStatus {
    Regular,
    Abortion,
}

/// Session-wide counters and end state, derived from the tracking records
/// under the session lock. Counters only increase; the end is set once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressAggregate {
    pub total_actions: u64,
    pub finished_actions: u64,
    pub errors: u64,
    /// Bytes actually rewritten on peer disks.
    pub processed_volume: u64,
    /// Bytes that crossed the network.
    pub exchanged_volume: u64,
    pub members: Vec<PeerId>,
    /// Peers that signaled they finished issuing their local actions.
    pub completed_members: BTreeSet<PeerId>,
    pub abort_requested_on: Option<DateTime<Utc>>,
    pub abort_requested_by: BTreeSet<PeerId>,
    pub ended_on: Option<DateTime<Utc>>,
    pub end_status: Option<EndStatus>,
}

impl ProgressAggregate {
    pub(crate) fn new(members: Vec<PeerId>) -> Self {
        Self {
            total_actions: 0,
            finished_actions: 0,
            errors: 0,
            processed_volume: 0,
            exchanged_volume: 0,
            members,
            completed_members: BTreeSet::new(),
            abort_requested_on: None,
            abort_requested_by: BTreeSet::new(),
            ended_on: None,
            end_status: None,
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested_on.is_some()
    }

    pub fn is_ended(&self) -> bool {
        self.ended_on.is_some()
    }

    /// Every original member must have signaled explicitly, even one that
    /// had zero actions to run.
    pub fn all_members_completed(&self) -> bool {
        self.members
            .iter()
            .all(|m| self.completed_members.contains(m))
    }

    pub fn all_actions_done(&self) -> bool {
        self.finished_actions + self.errors >= self.total_actions
    }
}

/// State change pushed to every member of a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started {
        aggregate: ProgressAggregate,
    },
    Progress {
        aggregate: ProgressAggregate,
    },
    Ended {
        finished_on: DateTime<Utc>,
        status: EndStatus,
    },
}

/// Per-artifact download bookkeeping; dropped once everyone has everything.
pub(crate) struct ArtifactTracking {
    pub artifact: TransferArtifact,
    pub recipients: BTreeSet<PeerId>,
    pub parts: u32,
    pub downloaded: BTreeSet<(PeerId, u32)>,
}

impl ArtifactTracking {
    fn complete(&self) -> bool {
        self.recipients.iter().all(|peer| {
            (0..self.parts)
                .all(|part| self.downloaded.contains(&(peer.clone(), part)))
        })
    }
}

pub(crate) struct SessionCore {
    pub aggregate: ProgressAggregate,
    pub tracking: HashMap<ActionGroupId, TrackingAction>,
    pub artifacts: HashMap<ArtifactId, ArtifactTracking>,
}

pub(crate) struct SessionState {
    pub core: Arc<Mutex<SessionCore>>,
    pub events: broadcast::Sender<SessionEvent>,
}

impl SessionState {
    /// Delivery failures only mean nobody is subscribed right now.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

/// Authoritative coordinator for any number of sessions.
pub struct Coordinator {
    sessions: RwLock<HashMap<SessionId, Arc<SessionState>>>,
    blobs: Arc<dyn BlobStore>,
    lock_wait: Duration,
}

impl Coordinator {
    pub fn new(blobs: Arc<dyn BlobStore>, config: &EngineConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            blobs,
            lock_wait: config.lock_wait,
        }
    }

    /// Register a batch of planned actions for a session, creating the
    /// session on the first call. The first creation pushes
    /// [`SessionEvent::Started`]; later batches push a progress update.
    /// The returned receiver is subscribed before that push, so the caller
    /// always observes it.
    pub async fn start_session(
        &self,
        session: &SessionId,
        members: Vec<PeerId>,
        actions: &[ActionGroup],
    ) -> Result<broadcast::Receiver<SessionEvent>> {
        let mut sessions = self.sessions.write().await;
        if let Some(state) = sessions.get(session) {
            let mut core = state.core.lock().await;
            if core.aggregate.is_ended() {
                return Err(SyncError::SessionEnded(session.clone()));
            }
            for action in actions {
                core.tracking
                    .entry(action.id)
                    .or_insert_with(|| TrackingAction::from_action(action));
            }
            core.aggregate.total_actions = core.tracking.len() as u64;
            let aggregate = core.aggregate.clone();
            drop(core);
            let receiver = state.events.subscribe();
            state.push(SessionEvent::Progress { aggregate });
            return Ok(receiver);
        }

        info!(%session, members = members.len(), actions = actions.len(), "session started");
        let mut tracking = HashMap::new();
        for action in actions {
            tracking.insert(action.id, TrackingAction::from_action(action));
        }
        let mut aggregate = ProgressAggregate::new(members);
        aggregate.total_actions = tracking.len() as u64;

        let (events, _) = broadcast::channel(64);
        let state = Arc::new(SessionState {
            core: Arc::new(Mutex::new(SessionCore {
                aggregate: aggregate.clone(),
                tracking,
                artifacts: HashMap::new(),
            })),
            events,
        });
        sessions.insert(session.clone(), state.clone());
        let receiver = state.events.subscribe();
        state.push(SessionEvent::Started { aggregate });
        Ok(receiver)
    }

    pub async fn subscribe(&self, session: &SessionId) -> Result<broadcast::Receiver<SessionEvent>> {
        Ok(self.state(session).await?.events.subscribe())
    }

    pub async fn snapshot(&self, session: &SessionId) -> Result<ProgressAggregate> {
        let (_, core) = self.lock_core(session).await?;
        Ok(core.aggregate.clone())
    }

    /// Drop all state for a session.
    pub async fn reset_session(&self, session: &SessionId) {
        if self.sessions.write().await.remove(session).is_some() {
            info!(%session, "session reset");
        }
    }

    /// Announce a blob and who must download it.
    pub async fn register_artifact(
        &self,
        artifact: TransferArtifact,
        recipients: BTreeSet<PeerId>,
        parts: u32,
    ) -> Result<()> {
        let (_, mut core) = self.lock_core(&artifact.session.clone()).await?;
        debug!(artifact = %artifact.id, parts, "artifact registered");
        core.artifacts.insert(
            artifact.id,
            ArtifactTracking {
                artifact,
                recipients,
                parts: parts.max(1),
                downloaded: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Record one downloaded part; once every recipient has every part the
    /// artifact is forgotten and its backing objects deleted.
    pub async fn assert_part_downloaded(
        &self,
        session: &SessionId,
        artifact_id: ArtifactId,
        part: u32,
        peer: &PeerId,
    ) -> Result<()> {
        let retired = {
            let (_, mut core) = self.lock_core(session).await?;
            let Some(tracking) = core.artifacts.get_mut(&artifact_id) else {
                warn!(%artifact_id, "download report for unknown artifact");
                return Ok(());
            };
            tracking.downloaded.insert((peer.clone(), part));
            if tracking.complete() {
                core.artifacts.remove(&artifact_id)
            } else {
                None
            }
        };

        if let Some(tracking) = retired {
            debug!(%artifact_id, "artifact fully downloaded; deleting backing objects");
            for part in 0..tracking.parts {
                let mut artifact = tracking.artifact.clone();
                artifact.part = part;
                if let Err(e) = self.blobs.delete_object(&artifact.object_key()).await {
                    warn!(key = %artifact.object_key(), %e, "failed to delete backing object");
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn state(&self, session: &SessionId) -> Result<Arc<SessionState>> {
        self.sessions
            .read()
            .await
            .get(session)
            .cloned()
            .ok_or_else(|| SyncError::SessionNotFound(session.clone()))
    }

    /// Acquire the session lock with a bounded wait. Failing loudly here
    /// matters: an unreported completion is a correctness bug, not a
    /// performance hiccup.
    pub(crate) async fn lock_core(
        &self,
        session: &SessionId,
    ) -> Result<(Arc<SessionState>, OwnedMutexGuard<SessionCore>)> {
        let state = self.state(session).await?;
        let guard = tokio::time::timeout(self.lock_wait, state.core.clone().lock_owned())
            .await
            .map_err(|_| SyncError::LockTimeout(self.lock_wait))?;
        Ok((state, guard))
    }
}
