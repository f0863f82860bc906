//! Tracking records and the atomic update path
//!
//! One [`TrackingAction`] per action group per session records who must do
//! what and who already has. All mutation happens inside
//! [`Coordinator::lock_core`], so reports from different peers never
//! interleave their aggregate-counter updates, and every counter transition
//! fires exactly once no matter how often a report is repeated.

use std::collections::BTreeSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::action::{ActionGroup, ActionGroupId, CompletionKind, PeerId, SessionId};
use crate::errors::{Result, SyncError};
use crate::monitor;
use crate::session::{Coordinator, SessionCore, SessionEvent, SessionState};

/// Replicated completion record of one action group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingAction {
    pub source: Option<PeerId>,
    pub targets: BTreeSet<PeerId>,
    pub source_success: Option<bool>,
    pub succeeded: BTreeSet<PeerId>,
    pub errored: BTreeSet<PeerId>,
    pub size: u64,
    pub content_bearing: bool,
}

/// What a report did to the record; duplicates must not move counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    New,
    Repeat,
    UnknownRole,
}

impl TrackingAction {
    pub fn from_action(action: &ActionGroup) -> Self {
        Self {
            source: action.source.as_ref().map(|e| e.peer.clone()),
            targets: action
                .targets
                .iter()
                .map(|t| t.endpoint.peer.clone())
                .collect(),
            source_success: None,
            succeeded: BTreeSet::new(),
            errored: BTreeSet::new(),
            size: action.size,
            content_bearing: action.operator.carries_content(),
        }
    }

    /// Finished: the source reported success (vacuously true for sourceless
    /// operators) and every target did too.
    pub fn is_finished(&self) -> bool {
        let source_ok = match self.source {
            None => true,
            Some(_) => self.source_success == Some(true),
        };
        source_ok && self.targets.iter().all(|t| self.succeeded.contains(t))
    }

    pub fn has_error(&self) -> bool {
        self.source_success == Some(false) || !self.errored.is_empty()
    }

    /// A later report overwrites the earlier one: a peer id sits in at most
    /// one of succeeded/errored.
    pub(crate) fn record_success(&mut self, peer: &PeerId, kind: CompletionKind) -> Recorded {
        if kind.marks_source() {
            if self.source.as_ref() != Some(peer) {
                return Recorded::UnknownRole;
            }
            let repeat = self.source_success == Some(true);
            self.source_success = Some(true);
            if repeat {
                Recorded::Repeat
            } else {
                Recorded::New
            }
        } else {
            if !self.targets.contains(peer) {
                return Recorded::UnknownRole;
            }
            // A local rewrite completes the source role too when the same
            // peer holds both ends.
            if kind == CompletionKind::LocalCopyDone && self.source.as_ref() == Some(peer) {
                self.source_success = Some(true);
            }
            self.errored.remove(peer);
            if self.succeeded.insert(peer.clone()) {
                Recorded::New
            } else {
                Recorded::Repeat
            }
        }
    }

    pub(crate) fn record_error(&mut self, peer: &PeerId) -> Recorded {
        if self.targets.contains(peer) {
            self.succeeded.remove(peer);
            if self.errored.insert(peer.clone()) {
                Recorded::New
            } else {
                Recorded::Repeat
            }
        } else if self.source.as_ref() == Some(peer) {
            let repeat = self.source_success == Some(false);
            self.source_success = Some(false);
            if repeat {
                Recorded::Repeat
            } else {
                Recorded::New
            }
        } else {
            Recorded::UnknownRole
        }
    }
}

impl Coordinator {
    /// Record successful completions. The completion kind decides the side
    /// effects: only upload/download completions move `exchanged_volume`,
    /// only local rewrites move `processed_volume`, and the finished counter
    /// moves exactly once per action group.
    pub async fn assert_action_done(
        &self,
        session: &SessionId,
        peer: &PeerId,
        kind: CompletionKind,
        ids: &[ActionGroupId],
    ) -> Result<()> {
        let (state, mut guard) = self.lock_core(session).await?;
        let core = &mut *guard;
        guard_open(core, session)?;
        if core.aggregate.abort_requested() {
            return Err(SyncError::AbortInProgress(session.clone()));
        }

        let mut changed = false;
        for id in ids {
            let Some(tracking) = core.tracking.get_mut(id) else {
                warn!(%session, %id, "success report for unknown action group");
                continue;
            };
            let was_finished = tracking.is_finished();
            match tracking.record_success(peer, kind) {
                Recorded::New => {
                    if tracking.content_bearing {
                        if kind.moves_processed_volume() {
                            core.aggregate.processed_volume += tracking.size;
                        }
                        if kind.moves_exchanged_volume() {
                            core.aggregate.exchanged_volume += tracking.size;
                        }
                    }
                    changed = true;
                }
                Recorded::Repeat => {
                    debug!(%session, %id, ?kind, "duplicate success report ignored");
                }
                Recorded::UnknownRole => {
                    warn!(%session, %id, %peer, ?kind, "report from a peer with no role in this action");
                    continue;
                }
            }
            if !was_finished && tracking.is_finished() {
                core.aggregate.finished_actions += 1;
                changed = true;
            }
        }

        if changed {
            monitor::check_counters(&core.aggregate);
            self.after_update(&state, core);
        }
        Ok(())
    }

    /// Record failed completions; the error counter moves once per action
    /// group, on its first error.
    pub async fn assert_action_errors(
        &self,
        session: &SessionId,
        peer: &PeerId,
        ids: &[ActionGroupId],
    ) -> Result<()> {
        let (state, mut guard) = self.lock_core(session).await?;
        let core = &mut *guard;
        guard_open(core, session)?;
        if core.aggregate.abort_requested() {
            return Err(SyncError::AbortInProgress(session.clone()));
        }

        let mut changed = false;
        for id in ids {
            let Some(tracking) = core.tracking.get_mut(id) else {
                warn!(%session, %id, "error report for unknown action group");
                continue;
            };
            let had_error = tracking.has_error();
            match tracking.record_error(peer) {
                Recorded::New => {
                    if !had_error && tracking.has_error() {
                        core.aggregate.errors += 1;
                    }
                    changed = true;
                }
                Recorded::Repeat => {
                    debug!(%session, %id, "duplicate error report ignored");
                }
                Recorded::UnknownRole => {
                    warn!(%session, %id, %peer, "error report from a peer with no role in this action");
                }
            }
        }

        if changed {
            monitor::check_counters(&core.aggregate);
            self.after_update(&state, core);
        }
        Ok(())
    }

    /// A peer signals it issued all of its local actions; required from every
    /// member, even one that had nothing to do. Still accepted after an
    /// abort so the session can reach its end state.
    pub async fn inform_issuance_finished(
        &self,
        session: &SessionId,
        peer: &PeerId,
    ) -> Result<()> {
        let (state, mut guard) = self.lock_core(session).await?;
        let core = &mut *guard;
        guard_open(core, session)?;

        if !core.aggregate.members.contains(peer) {
            warn!(%session, %peer, "issuance-finished signal from a non-member");
            return Ok(());
        }
        if core.aggregate.completed_members.insert(peer.clone()) {
            info!(%session, %peer, "member finished issuing actions");
            self.after_update(&state, core);
        }
        Ok(())
    }

    /// Session-wide abort request. After this lands, success/error updates
    /// are refused; the session ends with [`EndStatus::Abortion`] once every
    /// member has signaled issuance finished.
    ///
    /// [`EndStatus::Abortion`]: crate::session::EndStatus::Abortion
    pub async fn request_abort(&self, session: &SessionId, peer: &PeerId) -> Result<()> {
        let (state, mut guard) = self.lock_core(session).await?;
        let core = &mut *guard;
        guard_open(core, session)?;

        if core.aggregate.abort_requested_on.is_none() {
            core.aggregate.abort_requested_on = Some(Utc::now());
            info!(%session, %peer, "abort requested");
        }
        core.aggregate.abort_requested_by.insert(peer.clone());
        self.after_update(&state, core);
        Ok(())
    }

    /// Push the new counters and, when the end condition is newly reached,
    /// seal the aggregate and push the end exactly once.
    fn after_update(&self, state: &SessionState, core: &mut SessionCore) {
        state.push(SessionEvent::Progress {
            aggregate: core.aggregate.clone(),
        });
        if monitor::is_ended(&core.aggregate) {
            let (finished_on, status) = monitor::seal(&mut core.aggregate, Utc::now());
            info!(?status, "synchronization ended");
            state.push(SessionEvent::Ended {
                finished_on,
                status,
            });
        }
    }
}

/// Stale reports against a finished session are no-ops, not corruption.
fn guard_open(core: &SessionCore, session: &SessionId) -> Result<()> {
    if core.aggregate.is_ended() {
        return Err(SyncError::SessionEnded(session.clone()));
    }
    Ok(())
}
