//! End-to-end scenarios across tree, trash, revisions and uploads.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tempfile::TempDir;

use common::attrs::{self, Attributes};
use common::events::{Event, EventPublisher, UserId};
use common::{Error, Options, Result};
use metadata::{MetadataBackend, XattrsBackend};

use crate::assimilation::EventAction;
use crate::blobstore::PosixBlobStore;
use crate::lookup::Lookup;
use crate::node::{self, Node};
use crate::permissions::{AllowAll, PermissionsChecker, ResourcePermissions};
use crate::trashbin::{RestoreRef, Trashbin};
use crate::tree::Tree;
use crate::upload::UploadStore;
use crate::usermapper::NoopUserMapper;

#[derive(Default)]
struct RecordingPublisher {
    events: StdMutex<Vec<Event>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: Event) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl RecordingPublisher {
    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| f(e)).count()
    }

    async fn wait_for(&self, f: impl Fn(&Event) -> bool) {
        for _ in 0..200 {
            if self.count(&f) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected event was not published");
    }
}

struct TestEngine {
    _dir: TempDir,
    tree: Arc<Tree>,
    trash: Trashbin,
    uploads: UploadStore,
    events: Arc<RecordingPublisher>,
    space: Node,
}

impl TestEngine {
    async fn new() -> Self {
        Self::with_permissions(Arc::new(AllowAll)).await
    }

    async fn with_permissions(permissions: Arc<dyn PermissionsChecker>) -> Self {
        let dir = TempDir::new().unwrap();
        let mut options = Options::new(dir.path());
        options.scan_debounce_delay_ms = 20;
        options.max_concurrency = 2;
        let options = Arc::new(options);

        let backend: Arc<dyn MetadataBackend> = Arc::new(XattrsBackend::new());
        let lookup = Arc::new(Lookup::new(options.clone(), backend));
        let events = Arc::new(RecordingPublisher::default());
        let tree = Tree::new(
            lookup,
            Arc::new(PosixBlobStore::new()),
            permissions,
            events.clone(),
            Arc::new(NoopUserMapper),
            options,
        );
        tree.start_scan_workers().await;

        let owner = UserId {
            idp: "https://idp.test".to_string(),
            opaque_id: "alice".to_string(),
        };
        let space = tree
            .create_space(Some("s1".to_string()), &owner, None)
            .await
            .unwrap();

        Self {
            _dir: dir,
            trash: Trashbin::new(tree.clone()),
            uploads: UploadStore::new(tree.clone()),
            tree,
            events,
            space,
        }
    }

    fn backend(&self) -> &dyn MetadataBackend {
        self.tree.lookup().metadata_backend()
    }

    async fn treesize(&self, path: &Path) -> i64 {
        self.backend()
            .get_i64(path, attrs::TREESIZE_ATTR)
            .await
            .unwrap()
    }

    /// Drive a full upload: session, node creation, payload, finalize.
    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        content: &[u8],
        existing_node_id: Option<&str>,
    ) -> Result<Node> {
        let mut session = self.uploads.new_session();
        session.set_size(content.len() as i64);
        session.set_node("s1", existing_node_id, parent_id, name, existing_node_id.is_some());
        self.uploads
            .create_node_for_upload(&mut session, Attributes::new())
            .await?;
        self.uploads
            .write_chunk(&mut session, Bytes::copy_from_slice(content))
            .await?;
        self.uploads.finalize(&session).await
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[tokio::test]
async fn test_mkdir_and_upload_propagates_sizes() {
    // E1
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "f", b"abcdefgh", None).await.unwrap();

    assert_eq!(engine.treesize(&engine.space.path).await, 8);
    assert_eq!(engine.treesize(&a.path).await, 8);
    assert_eq!(f.blobsize, 8);

    let md5 = engine
        .backend()
        .get(&f.path, &format!("{}md5", attrs::CHECKSUM_PREFIX))
        .await
        .unwrap();
    assert_eq!(hex(&md5), "e8dc4081b13434b45189a720b77b6818");

    engine
        .events
        .wait_for(|e| matches!(e, Event::UploadReady { .. }))
        .await;
    engine
        .events
        .wait_for(|e| matches!(e, Event::ContainerCreated { .. }))
        .await;
}

#[tokio::test]
async fn test_rename_keeps_id_and_emits_item_moved() {
    // E2
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "f", b"abcdefgh", None).await.unwrap();

    engine.tree.move_node("s1", &f.id, &a.id, "g").await.unwrap();

    let moved = Node::read(engine.tree.lookup(), "s1", &f.id).await.unwrap();
    assert!(moved.exists);
    assert_eq!(moved.id, f.id);
    assert_eq!(moved.name, "g");
    assert_eq!(moved.path, a.path.join("g"));
    assert_eq!(
        engine.tree.lookup().get_cached_id("s1", &f.id).await,
        Some(a.path.join("g"))
    );

    engine
        .events
        .wait_for(|e| matches!(e, Event::ItemMoved { .. }))
        .await;
    assert_eq!(
        engine.events.count(|e| matches!(e, Event::ItemMoved { .. })),
        1
    );
}

#[tokio::test]
async fn test_overwrite_with_if_match_creates_revision() {
    // E3
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "g", b"abcdefgh", None).await.unwrap();

    let old_mtime = f.mtime(engine.backend()).await.unwrap();
    let old_etag = node::calculate_etag(&f.id, old_mtime);

    let mut session = engine.uploads.new_session();
    session.set_size(5);
    session.set_node("s1", Some(&f.id), &a.id, "g", true);
    session.set_header_if_match(&old_etag);
    engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap();
    engine
        .uploads
        .write_chunk(&mut session, Bytes::from_static(b"HELLO"))
        .await
        .unwrap();
    let updated = engine.uploads.finalize(&session).await.unwrap();

    assert_eq!(updated.blobsize, 5);
    assert_eq!(session.size_diff(), -3);
    assert_eq!(
        session.version_id().unwrap(),
        format!("{}.REV.{}", f.id, attrs::format_time(old_mtime))
    );

    let revision_path = engine
        .tree
        .lookup()
        .version_path("s1", &f.id, &attrs::format_time(old_mtime))
        .await
        .unwrap();
    assert_eq!(
        tokio::fs::read(&revision_path).await.unwrap(),
        b"abcdefgh"
    );
    assert_eq!(tokio::fs::read(&updated.path).await.unwrap(), b"HELLO");

    assert_eq!(engine.treesize(&a.path).await, 5);
    assert_eq!(engine.treesize(&engine.space.path).await, 5);
}

#[tokio::test]
async fn test_upload_precondition_failures() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "f", b"abcdefgh", None).await.unwrap();
    let old_mtime = f.mtime(engine.backend()).await.unwrap();

    // stale etag
    let mut session = engine.uploads.new_session();
    session.set_size(5);
    session.set_node("s1", Some(&f.id), &a.id, "f", true);
    session.set_header_if_match("\"somethingelse\"");
    let err = engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));

    // if-none-match: * fails when the resource exists
    let mut session = engine.uploads.new_session();
    session.set_size(5);
    session.set_node("s1", Some(&f.id), &a.id, "f", true);
    session.set_header_if_none_match("*");
    let err = engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));

    // if-none-match list containing the current etag
    let mut session = engine.uploads.new_session();
    session.set_size(5);
    session.set_node("s1", Some(&f.id), &a.id, "f", true);
    session.set_header_if_none_match(&format!(
        "\"other\", {}",
        node::calculate_etag(&f.id, old_mtime)
    ));
    let err = engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));

    // modified since the given timestamp
    let mut session = engine.uploads.new_session();
    session.set_size(5);
    session.set_node("s1", Some(&f.id), &a.id, "f", true);
    session.set_header_if_unmodified_since(&attrs::format_time(
        old_mtime - chrono::Duration::seconds(60),
    ));
    let err = engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Aborted(_)));

    // matching etag passes
    let mut session = engine.uploads.new_session();
    session.set_size(5);
    session.set_node("s1", Some(&f.id), &a.id, "f", true);
    session.set_header_if_match(&node::calculate_etag(&f.id, old_mtime));
    engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_trash_round_trip() {
    // E4 + E5
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let g = engine.upload(&a.id, "g", b"HELLO", None).await.unwrap();

    let key = engine.trash.move_to_trash(&g).await.unwrap();

    let trash_item = engine
        .space
        .path
        .join(".Trash/files")
        .join(format!("{}.trashitem", key));
    assert_eq!(tokio::fs::read(&trash_item).await.unwrap(), b"HELLO");
    let info = tokio::fs::read_to_string(
        engine
            .space
            .path
            .join(".Trash/info")
            .join(format!("{}.trashinfo", key)),
    )
    .await
    .unwrap();
    assert!(info.contains("Path=a/g"));
    assert_eq!(engine.treesize(&a.path).await, 0);
    assert_eq!(engine.treesize(&engine.space.path).await, 0);

    let listed = engine.trash.list_recycle("s1", "", "").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].key, key);
    assert_eq!(listed[0].original_path, "a/g");
    assert!(listed[0].deletion_time.is_some());

    engine
        .trash
        .restore_recycle_item(
            "s1",
            &key,
            ".",
            &RestoreRef {
                node_id: a.id.clone(),
                path: "g".to_string(),
            },
        )
        .await
        .unwrap();

    let restored = Node::read(engine.tree.lookup(), "s1", &g.id).await.unwrap();
    assert!(restored.exists);
    assert_eq!(restored.id, g.id);
    assert_eq!(restored.parent_id, a.id);
    assert_eq!(tokio::fs::read(&restored.path).await.unwrap(), b"HELLO");
    assert_eq!(engine.treesize(&a.path).await, 5);
    assert_eq!(engine.treesize(&engine.space.path).await, 5);
    assert!(!engine
        .space
        .path
        .join(".Trash/info")
        .join(format!("{}.trashinfo", key))
        .exists());
}

#[tokio::test]
async fn test_restore_into_different_parent() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let b = engine.tree.create_container("s1", "s1", "b").await.unwrap();
    let f = engine.upload(&a.id, "f", b"data", None).await.unwrap();

    let key = engine.trash.move_to_trash(&f).await.unwrap();
    engine
        .trash
        .restore_recycle_item(
            "s1",
            &key,
            ".",
            &RestoreRef {
                node_id: b.id.clone(),
                path: "f".to_string(),
            },
        )
        .await
        .unwrap();

    let restored = Node::read(engine.tree.lookup(), "s1", &f.id).await.unwrap();
    assert_eq!(restored.parent_id, b.id);
    assert_eq!(restored.path, b.path.join("f"));
    assert_eq!(engine.treesize(&b.path).await, 4);
    assert_eq!(engine.treesize(&a.path).await, 0);
}

#[tokio::test]
async fn test_trash_two_files_with_identical_basenames() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let b = engine.tree.create_container("s1", "s1", "b").await.unwrap();
    let fa = engine.upload(&a.id, "f", b"one", None).await.unwrap();
    let fb = engine.upload(&b.id, "f", b"two!", None).await.unwrap();

    let key_a = engine.trash.move_to_trash(&fa).await.unwrap();
    let key_b = engine.trash.move_to_trash(&fb).await.unwrap();
    assert_ne!(key_a, key_b);

    let mut listed = engine.trash.list_recycle("s1", "", "").await.unwrap();
    listed.sort_by(|x, y| x.original_path.cmp(&y.original_path));
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].original_path, "a/f");
    assert_eq!(listed[1].original_path, "b/f");
}

#[tokio::test]
async fn test_purge_and_empty_respect_permissions() {
    struct StatOnly;
    #[async_trait]
    impl PermissionsChecker for StatOnly {
        async fn assemble_permissions(&self, _n: &Node) -> Result<ResourcePermissions> {
            Ok(ResourcePermissions::stat_only())
        }
        async fn assemble_trash_permissions(&self, _n: &Node) -> Result<ResourcePermissions> {
            Ok(ResourcePermissions::stat_only())
        }
    }
    struct NoRights;
    #[async_trait]
    impl PermissionsChecker for NoRights {
        async fn assemble_permissions(&self, _n: &Node) -> Result<ResourcePermissions> {
            Ok(ResourcePermissions::default())
        }
        async fn assemble_trash_permissions(&self, _n: &Node) -> Result<ResourcePermissions> {
            Ok(ResourcePermissions::default())
        }
    }

    let engine = TestEngine::with_permissions(Arc::new(StatOnly)).await;
    let err = engine
        .trash
        .purge_recycle_item("s1", "some-key", ".")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
    let err = engine.trash.empty_recycle("s1").await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));

    let engine = TestEngine::with_permissions(Arc::new(NoRights)).await;
    let err = engine
        .trash
        .purge_recycle_item("s1", "some-key", ".")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "existence must not leak");
}

#[tokio::test]
async fn test_out_of_band_create_is_assimilated() {
    // E6
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    engine.upload(&a.id, "g", b"HELLO", None).await.unwrap();

    let h = a.path.join("h");
    tokio::fs::write(&h, b"abc").await.unwrap();

    engine
        .tree
        .scan(&h, EventAction::Create, false)
        .await
        .unwrap();
    engine.tree.wait_for_scan_idle().await;

    let backend = engine.backend();
    let id = backend.get(&h, attrs::ID_ATTR).await.unwrap();
    assert!(!id.is_empty());
    let parent_id = backend.get(&h, attrs::PARENTID_ATTR).await.unwrap();
    assert_eq!(parent_id, a.id.as_bytes());
    backend
        .get(&h, &format!("{}md5", attrs::CHECKSUM_PREFIX))
        .await
        .unwrap();
    backend
        .get(&h, &format!("{}sha1", attrs::CHECKSUM_PREFIX))
        .await
        .unwrap();

    assert_eq!(engine.treesize(&a.path).await, 8);
    assert_eq!(engine.treesize(&engine.space.path).await, 8);

    engine
        .events
        .wait_for(|e| matches!(e, Event::UploadReady { filename, .. } if filename == "h"))
        .await;
}

#[tokio::test]
async fn test_out_of_band_move_keeps_id() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let b = engine.tree.create_container("s1", "s1", "b").await.unwrap();
    let f = engine.upload(&a.id, "f", b"payload", None).await.unwrap();

    // moved behind the engine's back
    let target = b.path.join("f");
    tokio::fs::rename(&f.path, &target).await.unwrap();

    engine
        .tree
        .scan(&target, EventAction::Move, false)
        .await
        .unwrap();
    engine.tree.wait_for_scan_idle().await;

    let moved = Node::read(engine.tree.lookup(), "s1", &f.id).await.unwrap();
    assert_eq!(moved.path, target);
    assert_eq!(moved.parent_id, b.id);
    engine
        .events
        .wait_for(|e| matches!(e, Event::ItemMoved { .. }))
        .await;
}

#[tokio::test]
async fn test_id_clash_after_preserving_copy_mints_new_id() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "f", b"payload", None).await.unwrap();

    // cp --preserve=xattr
    let copy = a.path.join("f-copy");
    tokio::fs::copy(&f.path, &copy).await.unwrap();
    let all = engine.backend().all(&f.path).await.unwrap();
    engine
        .backend()
        .set_multiple(&copy, &all, false)
        .await
        .unwrap();

    engine
        .tree
        .scan(&copy, EventAction::Create, false)
        .await
        .unwrap();
    engine.tree.wait_for_scan_idle().await;

    // re-assimilation runs detached; poll until the copy got its own id
    let mut copy_id = Vec::new();
    for _ in 0..200 {
        if let Ok(id) = engine.backend().get(&copy, attrs::ID_ATTR).await {
            if id != f.id.as_bytes() {
                copy_id = id;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!copy_id.is_empty(), "copy never got a fresh id");

    // the original binding is untouched
    assert_eq!(
        engine.backend().get(&f.path, attrs::ID_ATTR).await.unwrap(),
        f.id.as_bytes()
    );
    assert_eq!(
        engine.tree.lookup().get_cached_id("s1", &f.id).await,
        Some(f.path.clone())
    );
}

#[tokio::test]
async fn test_revision_listing_and_restore() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "f", b"version-one", None).await.unwrap();
    let first_mtime = f.mtime(engine.backend()).await.unwrap();
    let updated = engine
        .upload(&a.id, "f", b"v2", Some(&f.id))
        .await
        .unwrap();

    let revisions = engine.tree.list_revisions(&updated).await.unwrap();
    assert_eq!(revisions.len(), 1);
    assert_eq!(
        revisions[0].key,
        format!("{}.REV.{}", f.id, attrs::format_time(first_mtime))
    );
    assert_eq!(revisions[0].size, 11);

    let (info, reader) = engine
        .tree
        .download_revision("s1", &revisions[0].key, |_| true)
        .await
        .unwrap();
    assert_eq!(info.size, 11);
    let mut reader = reader.unwrap();
    let mut content = Vec::new();
    use tokio::io::AsyncReadExt;
    reader.read_to_end(&mut content).await.unwrap();
    assert_eq!(content, b"version-one");

    engine
        .tree
        .restore_revision("s1", &revisions[0].key)
        .await
        .unwrap();
    let restored = Node::read(engine.tree.lookup(), "s1", &f.id).await.unwrap();
    assert_eq!(tokio::fs::read(&restored.path).await.unwrap(), b"version-one");
    assert_eq!(restored.blobsize, 11);
    assert_eq!(engine.treesize(&a.path).await, 11);
    // the restored revision is gone, the replaced state is kept instead
    let remaining = engine.tree.list_revisions(&restored).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_ne!(remaining[0].key, revisions[0].key);
}

#[tokio::test]
async fn test_revision_timestamp_collision() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "f", b"abcdefgh", None).await.unwrap();
    let m1 = f.mtime(engine.backend()).await.unwrap();

    // identical content: overwrite leaves a revision whose checksums match
    // the live node
    engine.upload(&a.id, "f", b"abcdefgh", Some(&f.id)).await.unwrap();

    // force the next overwrite to reuse the same revision timestamp
    engine
        .backend()
        .set(
            &f.path,
            attrs::MTIME_ATTR,
            attrs::format_time(m1).as_bytes(),
        )
        .await
        .unwrap();

    // matching checksums: the stale revision is replaced
    engine.upload(&a.id, "f", b"xyz", Some(&f.id)).await.unwrap();

    // now set up a mismatch: same timestamp again, but content differs from
    // the revision written above
    engine
        .backend()
        .set(
            &f.path,
            attrs::MTIME_ATTR,
            attrs::format_time(m1).as_bytes(),
        )
        .await
        .unwrap();
    let mut session = engine.uploads.new_session();
    session.set_size(4);
    session.set_node("s1", Some(&f.id), &a.id, "f", true);
    let err = engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
}

#[tokio::test]
async fn test_zero_byte_upload() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "empty", b"", None).await.unwrap();

    assert_eq!(f.blobsize, 0);
    assert_eq!(engine.treesize(&a.path).await, 0);
    assert_eq!(
        engine.backend().get(&f.path, attrs::ID_ATTR).await.unwrap(),
        f.id.as_bytes()
    );
}

#[tokio::test]
async fn test_upload_session_lifecycle() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();

    let mut session = engine.uploads.new_session();
    session.set_size(10);
    session.set_node("s1", None, &a.id, "f", false);
    engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap();

    // offset follows the payload
    let offset = engine
        .uploads
        .write_chunk(&mut session, Bytes::from_static(b"01234"))
        .await
        .unwrap();
    assert_eq!(offset, 5);

    let loaded = engine.uploads.get(session.id()).await.unwrap();
    assert_eq!(loaded.info.offset, 5);
    assert_eq!(loaded.filename(), "f");

    let listed = engine.uploads.list().await.unwrap();
    assert_eq!(listed.len(), 1);

    // abandoned: revert and drop the session
    engine.uploads.cleanup(&session, true, false, true).await;
    assert!(matches!(
        engine.uploads.get(session.id()).await,
        Err(Error::NotFound(_))
    ));
    assert!(engine.uploads.list().await.unwrap().is_empty());

    assert!(matches!(
        engine.uploads.get("no-such-session").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_quota_is_enforced() {
    let engine = TestEngine::new().await;
    let owner = UserId {
        idp: "https://idp.test".to_string(),
        opaque_id: "bob".to_string(),
    };
    let space = engine
        .tree
        .create_space(Some("s2".to_string()), &owner, Some(4))
        .await
        .unwrap();

    let mut session = engine.uploads.new_session();
    session.set_size(10);
    session.set_node("s2", None, &space.id, "big", false);
    let err = engine
        .uploads
        .create_node_for_upload(&mut session, Attributes::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QuotaExceeded(_)));
}

#[tokio::test]
async fn test_empty_directory_scan() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();

    // out-of-band empty directory
    let sub = a.path.join("sub");
    tokio::fs::create_dir(&sub).await.unwrap();
    engine
        .tree
        .scan(&sub, EventAction::Create, true)
        .await
        .unwrap();
    engine.tree.wait_for_scan_idle().await;

    let backend = engine.backend();
    assert!(!backend.get(&sub, attrs::ID_ATTR).await.unwrap().is_empty());
    assert_eq!(backend.get_i64(&sub, attrs::TREESIZE_ATTR).await.unwrap(), 0);
    assert_eq!(engine.treesize(&a.path).await, 0);
}

#[tokio::test]
async fn test_delete_scan_purges_cache_entry() {
    let engine = TestEngine::new().await;
    let a = engine.tree.create_container("s1", "s1", "a").await.unwrap();
    let f = engine.upload(&a.id, "f", b"bytes", None).await.unwrap();
    let f_path = f.path.clone();

    tokio::fs::remove_file(&f_path).await.unwrap();
    engine
        .tree
        .scan(&f_path, EventAction::Delete, false)
        .await
        .unwrap();
    engine.tree.wait_for_scan_idle().await;

    assert_eq!(engine.tree.lookup().get_cached_id("s1", &f.id).await, None);
    assert_eq!(engine.treesize(&a.path).await, 0);
    engine
        .events
        .wait_for(|e| matches!(e, Event::ItemTrashed { .. }))
        .await;
}
