//! End-to-end reconciliation scenarios.

use driftsync_core::domain::{EngineError, Fsid, NodeHandle, NodeKind, SyncRunState, TreeState};
use driftsync_core::ports::TransferDirection;

use crate::common::{
    fingerprint, seed_table, Command, Harness, MockCloud, MockFilesystem, SeedNode, CLOUD_ROOT,
    DEBRIS, ROOT,
};

// ----------------------------------------------------------------------
// 1. Rename in place
// ----------------------------------------------------------------------

#[test]
fn test_rename_in_place_issues_single_setattr() {
    let content = b"0123456789";
    let fp = fingerprint(content, 1000);

    let fs = MockFilesystem::new(true);
    // a.txt is already gone; the filesystem now reports b.txt with the
    // same fsid, mtime and size.
    fs.add_file("/sync/b.txt", 7, 1000, content);

    let cloud = MockCloud::new();
    cloud.add_file(70, CLOUD_ROOT, "a.txt", fp);

    let (table, _) = seed_table(&[SeedNode {
        parent: 0,
        local_name: "a.txt",
        kind: NodeKind::File,
        fsid: 7,
        handle: 70,
        fingerprint: Some(fp),
    }]);

    let mut h = Harness::new(fs, cloud, Some(table));
    h.settle(40);

    // Exactly one cloud rename-in-place, no transfers.
    assert_eq!(
        h.cloud.count_commands(|c| matches!(
            c,
            Command::SetAttr { node: 70, name } if name == "b.txt"
        )),
        1
    );
    assert_eq!(
        h.cloud.count_commands(|c| matches!(c, Command::Transfer(_))),
        0
    );
    assert_eq!(
        h.cloud.count_commands(|c| matches!(c, Command::Rename { .. })),
        0
    );

    // The tree ends up with b.txt carrying the same identity.
    assert!(h.root_child("a.txt").is_none());
    let b = h.root_child("b.txt").expect("b.txt tracked");
    let node = h.sync.tree().node(b);
    assert_eq!(node.fsid, Fsid::new(7));
    assert_eq!(node.synced_handle, NodeHandle::new(70));
}

// ----------------------------------------------------------------------
// 2. Move between folders
// ----------------------------------------------------------------------

#[test]
fn test_move_between_folders_issues_single_rename() {
    let content = b"ffffff";
    let fp = fingerprint(content, 500);

    let fs = MockFilesystem::new(true);
    fs.add_dir("/sync/x", 100);
    fs.add_dir("/sync/y", 101);
    // f now lives under y; it is gone from x.
    fs.add_file("/sync/y/f", 11, 500, content);

    let cloud = MockCloud::new();
    cloud.add_dir(2, CLOUD_ROOT, "x");
    cloud.add_dir(3, CLOUD_ROOT, "y");
    cloud.add_file(20, 2, "f", fp);

    // Rows are assigned ids 1, 2, 3 in order; f hangs under x (row 1).
    let (table, ids) = seed_table(&[
        SeedNode {
            parent: 0,
            local_name: "x",
            kind: NodeKind::Dir,
            fsid: 100,
            handle: 2,
            fingerprint: None,
        },
        SeedNode {
            parent: 0,
            local_name: "y",
            kind: NodeKind::Dir,
            fsid: 101,
            handle: 3,
            fingerprint: None,
        },
        SeedNode {
            parent: 1,
            local_name: "f",
            kind: NodeKind::File,
            fsid: 11,
            handle: 20,
            fingerprint: Some(fp),
        },
    ]);
    assert_eq!(ids[0], 1);

    let mut h = Harness::new(fs, cloud, Some(table));
    h.settle(40);

    // One reparenting rename with no name change.
    assert_eq!(
        h.cloud.count_commands(|c| matches!(
            c,
            Command::Rename { node: 20, new_parent: 3, new_name: None }
        )),
        1
    );
    assert_eq!(
        h.cloud.count_commands(|c| matches!(c, Command::Transfer(_))),
        0
    );

    // f is tracked under y, with its identity intact.
    let tree = h.sync.tree();
    let y = h.root_child("y").expect("y tracked");
    let f = tree.child_by_name(y, "f").expect("f under y");
    assert_eq!(tree.node(f).fsid, Fsid::new(11));
    assert_eq!(tree.node(f).synced_handle, NodeHandle::new(20));
    let x = h.root_child("x").expect("x tracked");
    assert!(tree.child_by_name(x, "f").is_none());
}

// ----------------------------------------------------------------------
// 3. Concurrent edit on both sides
// ----------------------------------------------------------------------

#[test]
fn test_concurrent_edit_routes_to_user_intervention() {
    let f0 = fingerprint(b"original!!", 1000);
    let local_content = b"local edit";
    let f2 = fingerprint(b"cloud edit", 3000);

    let fs = MockFilesystem::new(true);
    fs.add_file("/sync/doc.txt", 5, 2000, local_content);

    let cloud = MockCloud::new();
    cloud.add_file(50, CLOUD_ROOT, "doc.txt", f2);

    let (table, _) = seed_table(&[SeedNode {
        parent: 0,
        local_name: "doc.txt",
        kind: NodeKind::File,
        fsid: 5,
        handle: 50,
        fingerprint: Some(f0),
    }]);

    let mut h = Harness::new(fs, cloud, Some(table));
    h.settle(20);

    // No writes on either side.
    assert_eq!(
        h.cloud.count_commands(|c| matches!(c, Command::Transfer(_))),
        0
    );
    assert_eq!(
        h.cloud
            .count_commands(|c| matches!(c, Command::SetAttr { .. } | Command::Rename { .. })),
        0
    );
    assert!(h.fs.contains("/sync/doc.txt"));

    // The conflict is flagged on the directory.
    let tree = h.sync.tree();
    assert!(tree.node(tree.root()).conflicts >= TreeState::ActionHere);
}

// ----------------------------------------------------------------------
// 4. Cloud deletion
// ----------------------------------------------------------------------

#[test]
fn test_cloud_deletion_moves_local_to_debris() {
    let content = b"precious";
    let fp = fingerprint(content, 800);

    let fs = MockFilesystem::new(true);
    fs.add_file("/sync/gone.txt", 7, 800, content);

    let cloud = MockCloud::new();
    cloud.add_file(70, CLOUD_ROOT, "gone.txt", fp);

    let (table, _) = seed_table(&[SeedNode {
        parent: 0,
        local_name: "gone.txt",
        kind: NodeKind::File,
        fsid: 7,
        handle: 70,
        fingerprint: Some(fp),
    }]);

    let mut h = Harness::new(fs, cloud, Some(table));
    assert!(h.settle(30), "pair reconciles cleanly first");

    // The cloud child disappears; the action packet names its handle.
    h.cloud.remove_node(70);
    h.sync.note_cloud_changed(NodeHandle::new(70));
    h.settle(40);

    // The local file went to the dated debris, not away.
    assert!(!h.fs.contains("/sync/gone.txt"));
    let debris_root = format!("{ROOT}/{DEBRIS}");
    let quarantined = h.fs.paths_under(&debris_root);
    assert!(
        quarantined.iter().any(|p| p.ends_with("/gone.txt")),
        "expected gone.txt under {debris_root}, got {quarantined:?}"
    );

    // The LocalNode is dropped.
    assert!(h.root_child("gone.txt").is_none());
}

// ----------------------------------------------------------------------
// 5. Transient local open failure
// ----------------------------------------------------------------------

#[test]
fn test_blocked_entry_gets_scan_blocked_node() {
    let fs = MockFilesystem::new(true);
    fs.add_blocked("/sync/locked.bin");

    let cloud = MockCloud::new();

    let mut h = Harness::new(fs, cloud, None);
    // A few ticks: scan, materialize the blocked node.
    for _ in 0..6 {
        h.tick();
        h.wait_for_scan();
    }

    let locked = h.root_child("locked.bin").expect("blocked node tracked");
    let tree = h.sync.tree();
    let node = tree.node(locked);
    assert!(node.scan_blocked.action_here());
    assert!(node
        .rare()
        .and_then(|r| r.scan_blocked_timer.as_ref())
        .is_some());

    // No transfers were attempted for the unreadable entry.
    assert_eq!(
        h.cloud.count_commands(|c| matches!(c, Command::Transfer(_))),
        0
    );

    // Once the back-off elapses, the parent is rescanned.
    let scans_before = h.fs.list_calls(ROOT);
    h.settle(10);
    assert!(h.fs.list_calls(ROOT) > scans_before);
}

// ----------------------------------------------------------------------
// 6. Name clash on a case-insensitive volume
// ----------------------------------------------------------------------

#[test]
fn test_cloud_name_clash_reported_without_writes() {
    let content = b"readme body";
    let fp = fingerprint(content, 600);

    let fs = MockFilesystem::new(false); // case-insensitive volume
    fs.add_file("/sync/README", 7, 600, content);

    let cloud = MockCloud::new();
    cloud.add_file(70, CLOUD_ROOT, "README", fp);
    cloud.add_file(71, CLOUD_ROOT, "readme", fingerprint(b"other", 601));

    let (table, _) = seed_table(&[SeedNode {
        parent: 0,
        local_name: "README",
        kind: NodeKind::File,
        fsid: 7,
        handle: 70,
        fingerprint: Some(fp),
    }]);

    let mut h = Harness::new(fs, cloud, Some(table));
    h.settle(20);

    // No write actions at all.
    assert!(h.cloud.commands().is_empty());

    // The incumbent row survives; the clash is flagged on the folder.
    let readme = h.root_child("README").expect("incumbent kept");
    let tree = h.sync.tree();
    assert_eq!(tree.node(readme).synced_handle, NodeHandle::new(70));
    assert!(tree.node(tree.root()).conflicts >= TreeState::ActionHere);

    // The clash is also reported to the host.
    let errors = h.sync.take_row_errors();
    assert!(errors
        .iter()
        .any(|e| matches!(e, EngineError::NameConflict(_))));
}

// ----------------------------------------------------------------------
// Fresh-tree flows
// ----------------------------------------------------------------------

#[test]
fn test_new_local_file_is_uploaded() {
    let content = b"fresh local";
    let fs = MockFilesystem::new(true);
    fs.add_file("/sync/new.txt", 9, 700, content);

    let cloud = MockCloud::new();

    let mut h = Harness::new(fs, cloud, None);
    h.settle(20);

    let uploads = h.cloud.count_commands(|c| {
        matches!(
            c,
            Command::Transfer(spec)
                if spec.direction == TransferDirection::Upload && spec.name == "new.txt"
        )
    });
    assert_eq!(uploads, 1, "exactly one upload started");

    // The LocalNode exists and remembers the upload is in flight.
    let new = h.root_child("new.txt").expect("tracked");
    assert!(h.sync.tree().node(new).upload_in_flight);
}

#[test]
fn test_new_cloud_file_is_downloaded() {
    let fs = MockFilesystem::new(true);
    let cloud = MockCloud::new();
    cloud.add_file(55, CLOUD_ROOT, "remote.bin", fingerprint(b"remote data", 900));

    let mut h = Harness::new(fs, cloud, None);
    h.settle(20);

    let downloads = h.cloud.count_commands(|c| {
        matches!(
            c,
            Command::Transfer(spec)
                if spec.direction == TransferDirection::Download
                    && spec.cloud_node == NodeHandle::new(55)
        )
    });
    assert_eq!(downloads, 1, "exactly one download started");
    assert!(h.root_child("remote.bin").is_some());
}

#[test]
fn test_new_cloud_folder_is_created_locally() {
    let fs = MockFilesystem::new(true);
    let cloud = MockCloud::new();
    cloud.add_dir(60, CLOUD_ROOT, "docs");
    cloud.add_file(61, 60, "inner.txt", fingerprint(b"inner", 50));

    let mut h = Harness::new(fs, cloud, None);
    h.settle(40);

    // The folder was made for real and the inner file is fetching.
    assert!(h.fs.contains("/sync/docs"));
    assert_eq!(
        h.cloud.count_commands(|c| matches!(
            c,
            Command::Transfer(spec) if spec.direction == TransferDirection::Download
        )),
        1
    );
}

#[test]
fn test_new_local_folder_is_created_in_cloud() {
    let fs = MockFilesystem::new(true);
    fs.add_dir("/sync/photos", 42);

    let cloud = MockCloud::new();

    let mut h = Harness::new(fs, cloud, None);
    h.settle(40);

    assert_eq!(
        h.cloud.count_commands(|c| matches!(
            c,
            Command::PutNodes { parent, names }
                if *parent == CLOUD_ROOT && names == &vec!["photos".to_string()]
        )),
        1
    );

    // After the folder lands, the node adopts its handle.
    let photos = h.root_child("photos").expect("tracked");
    assert!(!h.sync.tree().node(photos).synced_handle.is_undef());
}

#[test]
fn test_local_deletion_moves_cloud_to_debris() {
    let content = b"bye";
    let fp = fingerprint(content, 10);

    let fs = MockFilesystem::new(true);
    fs.add_file("/sync/bye.txt", 7, 10, content);

    let cloud = MockCloud::new();
    cloud.add_file(70, CLOUD_ROOT, "bye.txt", fp);

    let (table, _) = seed_table(&[SeedNode {
        parent: 0,
        local_name: "bye.txt",
        kind: NodeKind::File,
        fsid: 7,
        handle: 70,
        fingerprint: Some(fp),
    }]);

    let mut h = Harness::new(fs, cloud, Some(table));
    assert!(h.settle(30), "pair reconciles cleanly first");

    // The user deletes the file; the watcher reports the path.
    h.fs.remove("/sync/bye.txt");
    h.sync
        .note_path_changed(&driftsync_core::domain::LocalPath::from("/sync/bye.txt"));
    h.settle(40);

    assert_eq!(
        h.cloud
            .count_commands(|c| matches!(c, Command::SyncDebris { node: 70 })),
        1
    );
    assert!(h.root_child("bye.txt").is_none());
}

#[test]
fn test_symlink_is_quarantined_not_synced() {
    let fs = MockFilesystem::new(true);
    fs.add_symlink("/sync/link", 33);

    let cloud = MockCloud::new();

    let mut h = Harness::new(fs, cloud, None);
    h.settle(10);

    // Blocked, not uploaded.
    assert_eq!(
        h.cloud.count_commands(|c| matches!(c, Command::Transfer(_))),
        0
    );
    let link = h.root_child("link").expect("symlink tracked as blocked");
    assert!(h.sync.tree().node(link).use_blocked.action_here());
}

#[test]
fn test_initial_scan_reaches_active() {
    let content = b"steady";
    let fp = fingerprint(content, 100);

    let fs = MockFilesystem::new(true);
    fs.add_file("/sync/a.txt", 3, 100, content);

    let cloud = MockCloud::new();
    cloud.add_file(30, CLOUD_ROOT, "a.txt", fp);

    let (table, _) = seed_table(&[SeedNode {
        parent: 0,
        local_name: "a.txt",
        kind: NodeKind::File,
        fsid: 3,
        handle: 30,
        fingerprint: Some(fp),
    }]);

    let mut h = Harness::new(fs, cloud, Some(table));
    assert_eq!(h.sync.state(), SyncRunState::InitialScan);

    let synced = h.settle(30);
    assert!(synced, "tree should fully reconcile");
    assert_eq!(h.sync.state(), SyncRunState::Active);
    assert!(h.cloud.commands().is_empty(), "nothing to do for a synced pair");
}

#[test]
fn test_initial_scan_backfills_fsids_on_unstable_volume() {
    let content = b"refound";
    let fp = fingerprint(content, 400);

    let fs = MockFilesystem::new(true);
    fs.add_file("/sync/keep.txt", 77, 400, content);

    let cloud = MockCloud::new();
    cloud.add_file(40, CLOUD_ROOT, "keep.txt", fp);

    // Seed with UNDEF fsid, as if restored from a volume without
    // stable ids.
    let (table, _) = seed_table(&[SeedNode {
        parent: 0,
        local_name: "keep.txt",
        kind: NodeKind::File,
        fsid: u64::MAX,
        handle: 40,
        fingerprint: Some(fp),
    }]);

    let mut h = Harness::new(fs, cloud, Some(table));
    h.settle(30);

    let keep = h.root_child("keep.txt").expect("tracked");
    assert_eq!(h.sync.tree().node(keep).fsid, Fsid::new(77));
    assert!(h.cloud.commands().is_empty());
}
