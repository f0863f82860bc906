//! Planned-action data model shared by every peer of a session
//!
//! An [`ActionGroup`] is one unit of work produced by the planning step. It is
//! immutable after creation: the executor and the coordinator ledger both
//! consume it read-only.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// One synchronization session shared by a group of peers.
    SessionId
);
string_id!(
    /// One participant process in a session.
    PeerId
);
string_id!(
    /// Identifier of a published baseline signature, resolvable by the
    /// signature store.
    SignatureId
);

/// Identifier of one planned action, identical on every peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionGroupId(Uuid);

impl ActionGroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionGroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one blob in flight between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What an action does to its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionOperator {
    CopyContentOnly,
    CopyDate,
    CopyContentAndDate,
    Delete,
    Create,
}

impl ActionOperator {
    /// Content-bearing operators move bytes and take part in volume
    /// accounting; the others only touch metadata or the namespace.
    pub fn carries_content(&self) -> bool {
        matches!(self, Self::CopyContentOnly | Self::CopyContentAndDate)
    }

    pub fn copies_dates(&self) -> bool {
        matches!(self, Self::CopyDate | Self::CopyContentAndDate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsKind {
    File,
    Directory,
}

/// How content reaches a given target: a whole copy, or a binary delta
/// against a previously published baseline signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    Full,
    Delta,
}

/// Addresses one synchronized root on one peer. A peer may expose several
/// roots, told apart by the data-part code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointRef {
    pub peer: PeerId,
    pub part: String,
}

impl EndpointRef {
    pub fn new(peer: impl Into<PeerId>, part: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            part: part.into(),
        }
    }
}

/// One destination of an action, with the transfer mode chosen for it by the
/// planner based on whether a usable baseline signature exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTarget {
    pub endpoint: EndpointRef,
    pub mode: SyncMode,
    pub baseline_signature: Option<SignatureId>,
}

impl ActionTarget {
    pub fn full(endpoint: EndpointRef) -> Self {
        Self {
            endpoint,
            mode: SyncMode::Full,
            baseline_signature: None,
        }
    }

    pub fn delta(endpoint: EndpointRef, signature: SignatureId) -> Self {
        Self {
            endpoint,
            mode: SyncMode::Delta,
            baseline_signature: Some(signature),
        }
    }
}

/// Explicit timestamps supplied by the planner for date-copying operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampTimes {
    pub modified: DateTime<Utc>,
    pub created: Option<DateTime<Utc>>,
}

/// One planned, peer-agnostic synchronization action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionGroup {
    pub id: ActionGroupId,
    pub operator: ActionOperator,
    pub kind: FsKind,
    /// Path relative to the data-part root, identical on every endpoint.
    pub path: PathBuf,
    /// Zero for Delete/Create, exactly one for the copy operators.
    pub source: Option<EndpointRef>,
    pub targets: Vec<ActionTarget>,
    /// Size estimate used for volume accounting.
    pub size: u64,
    pub timestamps: Option<StampTimes>,
}

impl ActionGroup {
    pub fn new(
        operator: ActionOperator,
        kind: FsKind,
        path: impl Into<PathBuf>,
        source: Option<EndpointRef>,
        targets: Vec<ActionTarget>,
        size: u64,
    ) -> Self {
        Self {
            id: ActionGroupId::new(),
            operator,
            kind,
            path: path.into(),
            source,
            targets,
            size,
            timestamps: None,
        }
    }

    pub fn with_timestamps(mut self, timestamps: StampTimes) -> Self {
        self.timestamps = Some(timestamps);
        self
    }
}

/// Kinds of blobs moving through the object-storage collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    BaseInventory,
    FullInventory,
    PlanningData,
    FullContentTransfer,
    DeltaContentTransfer,
    ProfileDetails,
}

impl ArtifactKind {
    fn key_tag(&self) -> &'static str {
        match self {
            Self::BaseInventory => "base_inventory",
            Self::FullInventory => "full_inventory",
            Self::PlanningData => "planning",
            Self::FullContentTransfer => "full",
            Self::DeltaContentTransfer => "delta",
            Self::ProfileDetails => "profile",
        }
    }
}

/// Describes one physical blob in flight: who produced it, which actions it
/// satisfies and which multi-part slice it is. Ephemeral; the coordinator
/// forgets it once every intended recipient has downloaded every part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferArtifact {
    pub id: ArtifactId,
    pub session: SessionId,
    pub owner: PeerId,
    pub kind: ArtifactKind,
    pub action_ids: Vec<ActionGroupId>,
    pub part: u32,
}

impl TransferArtifact {
    pub fn new(
        session: SessionId,
        owner: PeerId,
        kind: ArtifactKind,
        action_ids: Vec<ActionGroupId>,
    ) -> Self {
        Self {
            id: ArtifactId::new(),
            session,
            owner,
            kind,
            action_ids,
            part: 0,
        }
    }

    /// Deterministic object key: independent producers never collide because
    /// the key embeds session, owner, kind and a fresh artifact id.
    pub fn object_key(&self) -> String {
        format!(
            "{}/{}/{}_{}.part{}",
            self.session,
            self.owner,
            self.kind.key_tag(),
            self.id,
            self.part
        )
    }
}

/// Semantic completion type carried with a success report so the ledger can
/// apply the right side effects. A closed enum dispatched with `match`; no
/// callable crosses the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionKind {
    LocalCopyDone,
    DateCopied,
    Deleted,
    DirectoryCreated,
    UploadFinished,
    DownloadFinished,
}

impl CompletionKind {
    /// Reports that stand for the source side of an action rather than a
    /// target rewrite.
    pub fn marks_source(&self) -> bool {
        matches!(self, Self::UploadFinished)
    }

    /// Only upload/download completions move `exchanged_volume`.
    pub fn moves_exchanged_volume(&self) -> bool {
        matches!(self, Self::UploadFinished | Self::DownloadFinished)
    }

    /// Bytes actually rewritten on a local disk.
    pub fn moves_processed_volume(&self) -> bool {
        matches!(self, Self::LocalCopyDone | Self::DownloadFinished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_distinct_per_artifact() {
        let a = TransferArtifact::new(
            SessionId::from("s1"),
            PeerId::from("peer-a"),
            ArtifactKind::FullContentTransfer,
            vec![ActionGroupId::new()],
        );
        let b = TransferArtifact::new(
            SessionId::from("s1"),
            PeerId::from("peer-a"),
            ArtifactKind::FullContentTransfer,
            vec![ActionGroupId::new()],
        );
        assert_ne!(a.object_key(), b.object_key());
        assert!(a.object_key().starts_with("s1/peer-a/full_"));
    }

    #[test]
    fn operator_classification() {
        assert!(ActionOperator::CopyContentAndDate.carries_content());
        assert!(ActionOperator::CopyContentOnly.carries_content());
        assert!(!ActionOperator::Delete.carries_content());
        assert!(ActionOperator::CopyDate.copies_dates());
        assert!(!ActionOperator::Create.copies_dates());
    }
}
