//! Two peers drive a session end to end through the in-memory transfer
//! plane: one delta copy across peers, one delete, one directory creation.

use std::fs;
use std::sync::Arc;

use anyhow::Result;

use tokio::sync::mpsc;

use treesync::action::{
    ActionGroup, ActionOperator, ActionTarget, EndpointRef, FsKind, PeerId, SessionId,
    SignatureId,
};
use treesync::archive::{ArtifactAnnouncement, TransferBatcher};
use treesync::config::EngineConfig;
use treesync::executor::{ActionExecutor, PartRoots};
use treesync::receiver::TransferReceiver;
use treesync::reporter::ActionReporter;
use treesync::session::{Coordinator, EndStatus, SessionEvent};
use treesync::signature::{FileSignature, SignatureStore};
use treesync::transport::{
    CoordinatorClient, LocalCoordinator, MemoryBlobStore, MemoryUploader,
};

struct Peer {
    executor: ActionExecutor,
    receiver: TransferReceiver,
    reporter: ActionReporter,
    signatures: Arc<SignatureStore>,
    announced: mpsc::UnboundedReceiver<ArtifactAnnouncement>,
    root: tempfile::TempDir,
    _scratch: tempfile::TempDir,
}

fn peer(
    name: &str,
    coordinator: &Arc<Coordinator>,
    store: &Arc<MemoryBlobStore>,
    actions: &[ActionGroup],
    config: &EngineConfig,
) -> Peer {
    let session = SessionId::from("e2e");
    let client: Arc<dyn CoordinatorClient> =
        Arc::new(LocalCoordinator::new(coordinator.clone(), name.into()));
    let reporter = ActionReporter::new(session.clone(), client.clone(), config);
    let (tx, announced) = mpsc::unbounded_channel();
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let signatures = Arc::new(SignatureStore::new());

    let mut roots = PartRoots::new();
    roots.insert("docs", root.path());

    let batcher = TransferBatcher::new(
        session.clone(),
        name.into(),
        Arc::new(MemoryUploader::new(store.clone())),
        reporter.clone(),
        tx,
        config,
        scratch.path(),
    );
    let executor = ActionExecutor::new(
        session,
        name.into(),
        roots.clone(),
        signatures.clone(),
        client,
        reporter.clone(),
        batcher,
        config,
        scratch.path(),
    );
    let receiver = TransferReceiver::new(name.into(), roots, actions, reporter.clone());
    Peer {
        executor,
        receiver,
        reporter,
        signatures,
        announced,
        root,
        _scratch: scratch,
    }
}

#[tokio::test]
async fn two_peer_session_ends_regularly_after_full_plan() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = EngineConfig::default();
    let store = Arc::new(MemoryBlobStore::new());
    let coordinator = Arc::new(Coordinator::new(store.clone(), &config));
    let session = SessionId::from("e2e");

    let sig_id = SignatureId::from("report-baseline");
    let copy = ActionGroup::new(
        ActionOperator::CopyContentAndDate,
        FsKind::File,
        "report.txt",
        Some(EndpointRef::new("a", "docs")),
        vec![ActionTarget::delta(
            EndpointRef::new("b", "docs"),
            sig_id.clone(),
        )],
        64,
    );
    let delete = ActionGroup::new(
        ActionOperator::Delete,
        FsKind::File,
        "obsolete.txt",
        None,
        vec![ActionTarget::full(EndpointRef::new("b", "docs"))],
        0,
    );
    let create = ActionGroup::new(
        ActionOperator::Create,
        FsKind::Directory,
        "logs",
        None,
        vec![ActionTarget::full(EndpointRef::new("b", "docs"))],
        0,
    );
    let actions = vec![copy, delete, create];

    let mut events = coordinator
        .start_session(&session, vec!["a".into(), "b".into()], &actions)
        .await?;

    let mut peer_a = peer("a", &coordinator, &store, &actions, &config);
    let mut peer_b = peer("b", &coordinator, &store, &actions, &config);

    // Shared history: b holds an older revision, a published its signature.
    let baseline =
        b"quarterly report, revision one, with plenty of shared content".to_vec();
    let mut current = baseline.clone();
    current.extend_from_slice(b"\nrevision two adds this closing line");
    fs::write(peer_a.root.path().join("report.txt"), &current)?;
    fs::write(peer_b.root.path().join("report.txt"), &baseline)?;
    fs::write(peer_b.root.path().join("obsolete.txt"), b"stale")?;
    peer_a
        .signatures
        .publish(sig_id, FileSignature::index_bytes(&baseline, 16));

    // Peer a issues its share of the plan: the copy becomes an uploaded
    // artifact, the namespace actions are not its role.
    peer_a.executor.run(&actions).await?;

    // Transfer plane: announce, download, apply, acknowledge.
    let announcement = peer_a.announced.try_recv()?;
    assert_eq!(announcement.recipient, PeerId::from("b"));
    coordinator
        .register_artifact(
            announcement.artifact.clone(),
            [PeerId::from("b")].into(),
            1,
        )
        .await?;
    let key = announcement.artifact.object_key();
    let payload = store.get(&key).expect("uploaded artifact present");
    peer_b
        .receiver
        .apply_artifact(&announcement.artifact, &payload)
        .await?;
    coordinator
        .assert_part_downloaded(&session, announcement.artifact.id, 0, &PeerId::from("b"))
        .await?;
    assert!(
        store.get(&key).is_none(),
        "fully downloaded artifact must be retired from blob storage"
    );

    // Peer b issues its share; its final flush also delivers the buffered
    // download report, and its issuance signal closes the session.
    peer_b.executor.run(&actions).await?;
    peer_a.reporter.flush().await;
    peer_b.reporter.flush().await;

    assert_eq!(
        fs::read(peer_b.root.path().join("report.txt")).unwrap(),
        current
    );
    assert!(!peer_b.root.path().join("obsolete.txt").exists());
    assert!(peer_b.root.path().join("logs").is_dir());

    let snapshot = coordinator.snapshot(&session).await?;
    assert!(snapshot.is_ended());
    assert_eq!(snapshot.end_status, Some(EndStatus::Regular));
    assert_eq!(snapshot.finished_actions, 3);
    assert_eq!(snapshot.errors, 0);
    assert_eq!(snapshot.exchanged_volume, 128, "one upload and one download");
    assert_eq!(snapshot.processed_volume, 64);

    let mut started = 0;
    let mut ended = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::Started { .. } => started += 1,
            SessionEvent::Progress { .. } => {}
            SessionEvent::Ended { status, .. } => {
                ended += 1;
                assert_eq!(status, EndStatus::Regular);
            }
        }
    }
    assert_eq!(started, 1, "the initial subscription observes the start push");
    assert_eq!(ended, 1, "the end is pushed exactly once");

    Ok(())
}
