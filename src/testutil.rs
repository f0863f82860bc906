//! Shared fakes for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::action::{ActionGroupId, CompletionKind, SessionId};
use crate::errors::Result;
use crate::transport::CoordinatorClient;

/// Coordinator client that records every call instead of forwarding it.
#[derive(Default)]
pub struct RecordingClient {
    pub done: Mutex<Vec<(CompletionKind, Vec<ActionGroupId>)>>,
    pub errors: Mutex<Vec<Vec<ActionGroupId>>>,
}

impl RecordingClient {
    /// All successfully reported ids of one completion kind, across chunks.
    pub fn done_ids(&self, kind: CompletionKind) -> Vec<ActionGroupId> {
        self.done
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    pub fn error_ids(&self) -> Vec<ActionGroupId> {
        self.errors.lock().iter().flatten().copied().collect()
    }
}

#[async_trait]
impl CoordinatorClient for RecordingClient {
    async fn assert_action_done(
        &self,
        _session: &SessionId,
        kind: CompletionKind,
        ids: &[ActionGroupId],
    ) -> Result<()> {
        self.done.lock().push((kind, ids.to_vec()));
        Ok(())
    }

    async fn assert_action_errors(
        &self,
        _session: &SessionId,
        ids: &[ActionGroupId],
    ) -> Result<()> {
        self.errors.lock().push(ids.to_vec());
        Ok(())
    }

    async fn inform_issuance_finished(&self, _session: &SessionId) -> Result<()> {
        Ok(())
    }

    async fn request_abort(&self, _session: &SessionId) -> Result<()> {
        Ok(())
    }
}
