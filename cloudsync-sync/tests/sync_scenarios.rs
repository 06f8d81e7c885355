use std::time::Duration;

use cloudsync_core::{CloudError, Credentials, Event, OType, Oid, ProviderConfig, Side};
use cloudsync_sync::{SyncEngine, SyncError, SyncState};
use cloudsync_testkit::{init_tracing, test_engine_config, Harness, MockOp, MockProvider};

fn cycles(h: &Harness, n: usize) {
    for _ in 0..n {
        h.engine.cycle(Duration::from_millis(20)).expect("cycle");
    }
}

// ---------------------------------------------------------------------------
// Propagation
// ---------------------------------------------------------------------------

#[test]
fn local_file_reaches_remote() {
    let h = Harness::new();
    h.local.write("/a.txt", b"hello");
    h.converge();

    assert_eq!(h.remote.read("/a.txt").as_deref(), Some(&b"hello"[..]));
    assert_eq!(h.engine.entry_state("/a.txt"), Some(SyncState::InSync));
}

#[test]
fn remote_tree_reaches_local() {
    let h = Harness::new();
    h.remote.write("/docs/2024/report.txt", b"q4");
    h.remote.mkdirs("/empty");
    h.converge();

    assert!(h.local.is_dir("/docs/2024"));
    assert!(h.local.is_dir("/empty"));
    assert_eq!(
        h.local.read("/docs/2024/report.txt").as_deref(),
        Some(&b"q4"[..])
    );
    h.assert_mirrored();
}

#[test]
fn modification_round_trips_both_ways() {
    let h = Harness::new();
    h.local.write("/notes.md", b"v1");
    h.converge();

    h.remote.write("/notes.md", b"v2");
    h.converge();
    assert_eq!(h.local.read("/notes.md").as_deref(), Some(&b"v2"[..]));

    h.local.write("/notes.md", b"v3");
    h.converge();
    assert_eq!(h.remote.read("/notes.md").as_deref(), Some(&b"v3"[..]));
    h.assert_mirrored();
}

#[test]
fn settled_engine_issues_no_further_operations() {
    let h = Harness::new();
    h.local.write("/a", b"a");
    h.local.write("/d/b", b"b");
    h.remote.write("/r/c", b"c");
    h.converge();

    let before = h.mutations();
    cycles(&h, 3);
    assert_eq!(h.mutations(), before);
    assert!(h.engine.is_settled());
}

#[test]
fn replayed_event_is_ignored() {
    let h = Harness::new();
    let oid = h.local.write("/same.txt", b"1");
    h.converge();

    let entry = h.engine.entry("/same.txt").expect("entry");
    let hash = entry.sides[0].hash.clone();
    let replay = Event::new(
        OType::File,
        oid,
        Some("/same.txt".to_string()),
        hash,
        true,
        1.0,
    );
    assert!(!h.engine.apply_event(Side::LOCAL, replay).expect("apply"));
    assert!(h.engine.is_settled());
}

#[test]
fn different_sync_roots_map_onto_each_other() {
    let h = Harness::with_configs(
        ProviderConfig::default(),
        ProviderConfig::default().with_sync_root("/cloud/sync"),
    );
    h.local.write("/a/b.txt", b"nested");
    h.remote.write("/outside.txt", b"ignored");
    h.converge();

    assert_eq!(
        h.remote.read("/cloud/sync/a/b.txt").as_deref(),
        Some(&b"nested"[..])
    );
    assert!(!h.local.exists("/outside.txt"));
    h.assert_mirrored();
}

#[test]
fn parents_are_created_where_required() {
    let h = Harness::with_configs(
        ProviderConfig::default(),
        ProviderConfig::default().with_require_parent_folder(true),
    );
    h.local.write("/x/y/z.txt", b"deep");
    h.converge();

    assert!(h.remote.is_dir("/x/y"));
    assert_eq!(h.remote.read("/x/y/z.txt").as_deref(), Some(&b"deep"[..]));
}

#[test]
fn temporary_failures_are_retried_in_place() {
    let h = Harness::new();
    h.remote
        .fail_next(MockOp::Create, CloudError::Temporary("503".into()));
    h.local.write("/retry.txt", b"r");
    let stats = h.converge();

    assert!(h.remote.exists("/retry.txt"));
    assert!(stats.retries >= 1);
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[test]
fn delete_propagates_and_tombstones() {
    let h = Harness::new();
    h.local.write("/gone.txt", b"x");
    h.converge();

    h.local.remove("/gone.txt");
    h.converge();

    assert!(!h.remote.exists("/gone.txt"));
    assert_eq!(h.engine.entry_state("/gone.txt"), Some(SyncState::Tombstoned));
}

#[test]
fn tombstones_are_purged_after_grace() {
    let h = Harness::with_engine_config(
        test_engine_config().with_tombstone_grace(Duration::ZERO),
        ProviderConfig::default(),
        ProviderConfig::default(),
    );
    h.remote.write("/tmp.txt", b"t");
    h.converge();
    h.remote.remove("/tmp.txt");
    h.converge();

    assert!(!h.local.exists("/tmp.txt"));
    assert_eq!(h.engine.entry_state("/tmp.txt"), None);
}

#[test]
fn late_delete_does_not_remove_recreated_file() {
    let h = Harness::new();
    let old = h.local.write("/f.txt", b"one");
    h.converge();

    h.local.remove("/f.txt");
    h.local.write("/f.txt", b"two");
    h.converge();

    assert_eq!(h.remote.read("/f.txt").as_deref(), Some(&b"two"[..]));

    // A stale deletion of the first incarnation arrives again.
    let stale = Event::new(OType::File, old, None, None, false, 0.0);
    assert!(!h.engine.apply_event(Side::LOCAL, stale).expect("apply"));
    h.converge();
    assert_eq!(h.remote.read("/f.txt").as_deref(), Some(&b"two"[..]));
}

#[test]
fn deleted_on_both_sides_is_quiet() {
    let h = Harness::new();
    h.local.write("/both.txt", b"b");
    h.converge();

    h.local.remove("/both.txt");
    h.remote.remove("/both.txt");
    let before = h.mutations();
    h.converge();

    assert_eq!(h.mutations(), before);
    assert_eq!(h.engine.entry_state("/both.txt"), Some(SyncState::Tombstoned));
}

#[test]
fn modification_beats_deletion() {
    let h = Harness::new();
    h.local.write("/m.txt", b"old");
    h.converge();

    h.local.remove("/m.txt");
    h.remote.write("/m.txt", b"new");
    h.converge();

    assert_eq!(h.local.read("/m.txt").as_deref(), Some(&b"new"[..]));
    assert_eq!(h.remote.read("/m.txt").as_deref(), Some(&b"new"[..]));
}

#[test]
fn directory_delete_restores_unseen_children() {
    let h = Harness::new();
    h.local.write("/d/known.txt", b"k");
    h.converge();

    h.remote.write("/d/fresh.txt", b"f");
    h.local.remove("/d");
    h.converge();

    assert_eq!(h.local.read("/d/fresh.txt").as_deref(), Some(&b"f"[..]));
    assert!(!h.remote.exists("/d/known.txt"));
    h.assert_mirrored();
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[test]
fn newer_change_wins_and_loser_is_preserved() {
    let h = Harness::new();
    h.local.set_time(100.0);
    h.local.write("/b.txt", b"x");
    h.remote.set_time(200.0);
    h.remote.write("/b.txt", b"y");
    let stats = h.converge();

    for side in [&h.local, &h.remote] {
        assert_eq!(side.read("/b.txt").as_deref(), Some(&b"y"[..]));
        assert_eq!(side.read("/b.conflicted.txt").as_deref(), Some(&b"x"[..]));
    }
    assert_eq!(stats.conflicts, 1);
}

#[test]
fn conflict_name_skips_taken_paths() {
    let h = Harness::new();
    h.local.write("/c.txt.keep", b"unrelated");
    h.remote.write("/c.conflicted.txt", b"already here");
    h.local.set_time(100.0);
    h.local.write("/c.txt", b"mine");
    h.remote.set_time(200.0);
    h.remote.write("/c.txt", b"theirs");
    h.converge();

    assert_eq!(h.local.read("/c.txt").as_deref(), Some(&b"theirs"[..]));
    assert_eq!(
        h.local.read("/c.conflicted-2.txt").as_deref(),
        Some(&b"mine"[..])
    );
    h.assert_mirrored();
}

#[test]
fn identical_concurrent_edits_do_not_conflict() {
    let h = Harness::new();
    h.local.write("/same.txt", b"v1");
    h.converge();

    h.local.write("/same.txt", b"v2");
    h.remote.write("/same.txt", b"v2");
    let stats = h.converge();

    assert_eq!(stats.conflicts, 0);
    assert!(!h.local.exists("/same.conflicted.txt"));
    h.assert_mirrored();
}

#[test]
fn matching_files_on_first_sync_are_adopted() {
    let h = Harness::new();
    h.local.write("/pre.txt", b"identical");
    h.remote.write("/pre.txt", b"identical");
    let stats = h.converge();

    assert_eq!(stats.conflicts, 0);
    assert_eq!(h.mutations(), 0);
    assert_eq!(h.engine.entry_state("/pre.txt"), Some(SyncState::InSync));
}

// ---------------------------------------------------------------------------
// Renames
// ---------------------------------------------------------------------------

#[test]
fn file_rename_is_one_remote_rename() {
    let h = Harness::new();
    h.local.write("/old.txt", b"o");
    h.converge();

    let renames = h.remote.call_count(MockOp::Rename);
    h.local.move_to("/old.txt", "/new.txt");
    h.converge();

    assert_eq!(h.remote.call_count(MockOp::Rename), renames + 1);
    assert!(!h.remote.exists("/old.txt"));
    assert_eq!(h.remote.read("/new.txt").as_deref(), Some(&b"o"[..]));
}

#[test]
fn directory_rename_moves_subtree_with_one_call() {
    let h = Harness::new();
    h.local.write("/d/f.txt", b"f");
    h.local.write("/d/sub/g.txt", b"g");
    h.converge();

    let renames = h.remote.call_count(MockOp::Rename);
    let uploads = h.remote.call_count(MockOp::Upload);
    h.local.move_to("/d", "/e");
    h.converge();

    assert_eq!(h.remote.call_count(MockOp::Rename), renames + 1);
    assert_eq!(h.remote.call_count(MockOp::Upload), uploads);
    assert_eq!(h.remote.read("/e/sub/g.txt").as_deref(), Some(&b"g"[..]));
    assert!(!h.remote.exists("/d"));
    assert!(h.engine.entry("/e/f.txt").is_some());
    h.assert_mirrored();
}

#[test]
fn failed_rename_leaves_state_untouched() {
    let h = Harness::new();
    h.local.write("/r.txt", b"r");
    h.converge();
    let remote_oid = h.remote.oid_of("/r.txt").expect("remote copy");

    h.remote
        .fail_next(MockOp::Rename, CloudError::FileNotFound("/moved".into()));
    h.local.move_to("/r.txt", "/moved/r.txt");
    cycles(&h, 1);

    let entry = h.engine.entry("/moved/r.txt").expect("entry follows local");
    assert_eq!(entry.sides[1].path.as_deref(), Some("/r.txt"));
    assert_eq!(entry.sides[1].oid.as_ref(), Some(&remote_oid));
    let cache = h.engine.path_cache(Side::REMOTE).expect("cache");
    assert_eq!(cache.get_path(&remote_oid).as_deref(), Some("/r.txt"));
    assert!(!h.engine.is_settled());

    h.converge();
    assert_eq!(h.remote.read("/moved/r.txt").as_deref(), Some(&b"r"[..]));
}

#[test]
fn rename_over_existing_clears_target_first() {
    let h = Harness::with_configs(
        ProviderConfig::default(),
        ProviderConfig::default().with_renames_over_existing(false),
    );
    h.local.write("/a.txt", b"a");
    h.local.write("/b.txt", b"b");
    h.converge();

    h.local.move_to("/a.txt", "/b.txt");
    h.converge();

    assert_eq!(h.remote.read("/b.txt").as_deref(), Some(&b"a"[..]));
    assert!(!h.remote.exists("/a.txt"));
}

#[test]
fn recreated_file_reusing_its_oid_is_synced() {
    init_tracing();
    let local = MockProvider::new().with_recycled_oids();
    let remote = MockProvider::new();
    let engine = SyncEngine::new(
        test_engine_config(),
        vec![Box::new(local.clone()), Box::new(remote.clone())],
    );
    let h = Harness {
        local,
        remote,
        engine,
    };
    let first = h.local.write("/b.txt", b"old");
    h.converge();

    h.local.remove("/b.txt");
    let second = h.local.write("/b.txt", b"b");
    assert_eq!(first, second);
    h.converge();

    let files: Vec<_> = h.remote.files().into_iter().collect();
    assert_eq!(files, vec![("/b.txt".to_string(), b"b".to_vec())]);
    h.assert_mirrored();
}

// ---------------------------------------------------------------------------
// Oid-only events
// ---------------------------------------------------------------------------

#[test]
fn pathless_event_is_tracked_until_placed() {
    let h = Harness::new();
    h.local.write("/p.txt", b"p");
    let info = h.engine.lookup("/p.txt").expect("lookup").expect("exists");
    let mut event = Event::from_info(&info, 1.0);
    event.path = None;

    assert!(h.engine.apply_event(Side::LOCAL, event).expect("tracked"));
    assert!(h.engine.entry("/p.txt").is_none());
    let pending = h.engine.entries();
    assert_eq!(pending.len(), 1);
    assert!(!pending[0].placed);
    assert_eq!(pending[0].sides[0].oid.as_ref(), Some(&info.oid));

    h.converge();
    let entry = h.engine.entry("/p.txt").expect("placed");
    assert!(entry.placed);
    assert_eq!(entry.state, SyncState::InSync);
    assert_eq!(h.remote.read("/p.txt").as_deref(), Some(&b"p"[..]));
}

#[test]
fn unplaceable_oid_is_never_propagated() {
    let h = Harness::new();
    let ghost = Event::new(OType::File, Oid::from("ghost"), None, None, true, 1.0);

    assert!(h.engine.apply_event(Side::LOCAL, ghost).expect("tracked"));
    h.converge();

    assert_eq!(h.remote.mutation_count(), 0);
    assert!(h.engine.entries().iter().all(|e| !e.placed));
    assert!(h.engine.is_settled());
}

// ---------------------------------------------------------------------------
// Feed recovery and failures
// ---------------------------------------------------------------------------

#[test]
fn invalid_cursor_recovers_by_walking() {
    let h = Harness::new();
    h.remote.write("/keep.txt", b"k");
    h.remote.write("/drop.txt", b"d");
    h.converge();

    h.remote.remove("/drop.txt");
    h.remote.write("/late.txt", b"l");
    h.remote.invalidate_cursors();
    h.converge();

    assert!(h.local.exists("/late.txt"));
    assert!(!h.local.exists("/drop.txt"));
    assert!(h.local.exists("/keep.txt"));
}

#[test]
fn offline_side_catches_up_when_reconnected() {
    let h = Harness::new();
    h.converge();

    h.remote.set_offline(true);
    h.local.write("/queued.txt", b"q");
    let outcome = h
        .engine
        .run(Duration::from_millis(60), |_| false)
        .expect("offline run");
    assert!(!outcome.is_satisfied());
    assert!(!h.engine.is_settled());

    h.remote.set_offline(false);
    h.converge();
    assert_eq!(h.remote.read("/queued.txt").as_deref(), Some(&b"q"[..]));
}

#[test]
fn rejected_token_stops_until_new_credentials() {
    let h = Harness::new();
    h.remote
        .fail_next(MockOp::Events, CloudError::Token("expired".into()));
    h.local.write("/t.txt", b"t");

    let err = h
        .engine
        .run(Duration::from_secs(1), |_| false)
        .expect_err("auth failure surfaces");
    assert!(matches!(err, SyncError::AuthFailed { side, .. } if side == Side::REMOTE));

    let again = h.engine.run(Duration::from_millis(50), |_| false);
    assert!(matches!(again, Err(SyncError::AuthFailed { .. })));

    h.engine
        .set_credentials(Side::REMOTE, Credentials::new().with("token", "fresh"))
        .expect("known side");
    h.converge();
    assert!(h.remote.exists("/t.txt"));
}

#[test]
fn injected_local_change_is_applied_before_polling() {
    let h = Harness::new();
    h.local.write("/inj.txt", b"i");

    assert!(h.engine.inject_local_event("/inj.txt", true).expect("inject"));
    assert_eq!(h.engine.entry_state("/inj.txt"), Some(SyncState::Unresolved));
    let info = h.engine.lookup("/inj.txt").expect("lookup").expect("exists");
    assert!(!info.is_dir());

    h.converge();
    assert!(h.remote.exists("/inj.txt"));

    h.local.remove("/inj.txt");
    assert!(h.engine.inject_local_event("/inj.txt", false).expect("inject"));
    h.converge();
    assert!(!h.remote.exists("/inj.txt"));
}

#[test]
fn unknown_side_is_rejected() {
    let h = Harness::new();
    assert!(matches!(
        h.engine.reseed(Side(7)),
        Err(SyncError::UnknownSide(Side(7)))
    ));
}
