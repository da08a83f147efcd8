//! Placeholder lifecycle against the in-memory host and remote store

use std::sync::atomic::Ordering;
use std::time::Duration;

use fs2::FileExt;
use tetherdrive_core::domain::{PinState, PlaceholderState};
use tetherdrive_core::ports::IPlaceholderHost;
use tetherdrive_sync::SyncError;

use crate::common::{rel, ts, Harness};

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_create_or_update_file_is_idempotent() {
    let h = Harness::new().await;
    h.remote.add_file("notes.txt", b"hello world", ts(1_700_000_100));

    h.placeholders
        .create_or_update_file(&rel("notes.txt"))
        .await
        .unwrap();
    let created = h.host.info("notes.txt").unwrap();
    assert!(created.is_placeholder);
    assert!(created.offline);
    assert_eq!(std::fs::metadata(h.local("notes.txt")).unwrap().len(), 11);

    h.placeholders
        .create_or_update_file(&rel("notes.txt"))
        .await
        .unwrap();
    let first = h.host.info("notes.txt").unwrap();
    assert_eq!(first.state, PlaceholderState::InSync);

    h.host.clear_ops();
    h.placeholders
        .create_or_update_file(&rel("notes.txt"))
        .await
        .unwrap();
    assert_eq!(h.host.info("notes.txt").unwrap(), first);
    assert!(h.host.ops().is_empty(), "unexpected ops: {:?}", h.host.ops());
}

#[tokio::test]
async fn test_bulk_population_order() {
    let h = Harness::new().await;
    h.remote.add_file("a/file1", b"one", ts(1_700_000_001));
    h.remote.add_file("a/sub/file2", b"two", ts(1_700_000_002));
    h.remote.add_file("desktop.ini", b"[x]", ts(1_700_000_003));

    let summary = h
        .placeholders
        .create_bulk(&rel(""), &h.cancel)
        .await
        .unwrap();

    assert_eq!(summary.files, 2);
    assert_eq!(summary.directories, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        h.host.ops(),
        vec!["create a", "create a/file1", "create a/sub", "create a/sub/file2"]
    );
    assert!(!h.local("desktop.ini").exists());

    // Every directory visited by the walk is populated.
    assert!(!h.host.info("a").unwrap().offline);
    assert!(!h.host.info("a/sub").unwrap().offline);
    assert!(h.host.info("a/sub/file2").unwrap().offline);
}

#[tokio::test]
async fn test_bulk_population_stops_when_cancelled() {
    let h = Harness::new().await;
    h.remote.add_file("a/file1", b"one", ts(1_700_000_001));
    h.cancel.cancel();

    let err = h
        .placeholders
        .create_bulk(&rel(""), &h.cancel)
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::Cancelled)
    ));
    assert!(h.host.ops().is_empty());
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_bulk_population_fails_when_root_cannot_be_listed() {
    let h = Harness::new().await;
    h.remote.add_file("a/file1", b"one", ts(1_700_000_001));
    h.remote.refuse_listing(true);

    let err = h
        .placeholders
        .create_bulk(&rel(""), &h.cancel)
        .await
        .unwrap_err();

    assert!(format!("{err:#}").contains("listing refused"));
    assert!(!h.local("a").exists());
}

#[tokio::test]
async fn test_type_mismatch_is_reported() {
    let h = Harness::new().await;
    h.remote.add_dir("thing");
    std::fs::write(h.local("thing"), b"local file").unwrap();

    let entry = h.remote.entry("thing").unwrap();
    assert!(h.placeholders.create_or_update_entry(&entry).await.is_err());
    assert_eq!(h.read_local("thing"), b"local file");
}

// ============================================================================
// Change detection
// ============================================================================

#[tokio::test]
async fn test_matching_identity_marks_in_sync_without_cycle() {
    let h = Harness::new().await;
    h.remote.add_file("photo.jpg", b"jpegdata", ts(1_700_000_200));
    h.hydrated("photo.jpg").await;
    assert_eq!(h.read_local("photo.jpg"), b"jpegdata");

    h.host.clear_ops();
    h.placeholders
        .update_file(&rel("photo.jpg"), false)
        .await
        .unwrap();

    assert!(h.host.ops().is_empty(), "unexpected ops: {:?}", h.host.ops());
    let info = h.host.info("photo.jpg").unwrap();
    assert_eq!(info.state, PlaceholderState::InSync);
    assert!(!info.offline);
}

#[tokio::test]
async fn test_changed_file_dehydrated_before_rehydration() {
    let h = Harness::new().await;
    h.remote.add_file("doc.txt", b"old", ts(1_700_000_300));
    h.hydrated("doc.txt").await;

    h.remote.add_file("doc.txt", b"new content", ts(1_700_000_400));
    h.host.clear_ops();
    h.placeholders
        .update_file(&rel("doc.txt"), false)
        .await
        .unwrap();

    assert_eq!(
        h.host.ops(),
        vec!["update+dehydrate doc.txt", "hydrate doc.txt"]
    );
    assert_eq!(h.read_local("doc.txt"), b"new content");
    let info = h.host.info("doc.txt").unwrap();
    assert_eq!(info.state, PlaceholderState::InSync);
    assert!(!info.offline);
    assert_eq!(info.identity, Some(h.remote.entry("doc.txt").unwrap().identity()));
}

#[tokio::test]
async fn test_unpinned_file_stays_dehydrated() {
    let h = Harness::new().await;
    h.remote.add_file("video.mp4", b"frames", ts(1_700_000_500));
    h.hydrated("video.mp4").await;
    h.host.set_pin("video.mp4", PinState::Unpinned);

    h.remote.add_file("video.mp4", b"new frames", ts(1_700_000_600));
    h.host.clear_ops();
    h.placeholders
        .update_file(&rel("video.mp4"), false)
        .await
        .unwrap();

    let info = h.host.info("video.mp4").unwrap();
    assert!(info.offline);
    assert_eq!(info.state, PlaceholderState::InSync);
    assert_eq!(info.pin, PinState::Unpinned);
    assert!(!h.host.ops().iter().any(|op| op == "hydrate video.mp4"));
}

#[tokio::test]
async fn test_pinned_file_rehydrated_and_pin_restored() {
    let h = Harness::new().await;
    h.remote.add_file("keep.txt", b"v1", ts(1_700_000_700));
    h.hydrated("keep.txt").await;
    h.host.set_pin("keep.txt", PinState::Pinned);

    h.remote.add_file("keep.txt", b"v2 longer", ts(1_700_000_800));
    h.host.clear_ops();
    h.placeholders
        .update_file(&rel("keep.txt"), false)
        .await
        .unwrap();

    assert_eq!(
        h.host.ops(),
        vec![
            "pin keep.txt inherit",
            "update+dehydrate keep.txt",
            "hydrate keep.txt",
            "pin keep.txt pinned",
        ]
    );
    assert_eq!(h.read_local("keep.txt"), b"v2 longer");
    assert_eq!(h.host.info("keep.txt").unwrap().pin, PinState::Pinned);
}

#[tokio::test]
async fn test_offline_placeholder_updated_in_place() {
    let h = Harness::new().await;
    h.remote.add_file("big.iso", b"0123456789", ts(1_700_000_900));
    h.placeholders
        .create_or_update_file(&rel("big.iso"))
        .await
        .unwrap();

    h.remote.add_file("big.iso", b"0123", ts(1_700_001_000));
    h.host.clear_ops();
    h.placeholders
        .update_file(&rel("big.iso"), false)
        .await
        .unwrap();

    assert_eq!(h.host.ops(), vec!["update big.iso"]);
    assert_eq!(std::fs::metadata(h.local("big.iso")).unwrap().len(), 4);
    assert!(h.host.info("big.iso").unwrap().offline);
}

#[tokio::test]
async fn test_locked_file_gives_up_after_retries() {
    let h = Harness::new().await;
    h.remote.add_file("busy.db", b"rows", ts(1_700_001_100));
    h.hydrated("busy.db").await;

    let holder = std::fs::File::open(h.local("busy.db")).unwrap();
    holder.lock_exclusive().unwrap();

    let err = h
        .placeholders
        .update_file(&rel("busy.db"), true)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::FileLocked(_))
    ));
    assert_eq!(h.read_local("busy.db"), b"rows");

    drop(holder);
    h.placeholders
        .update_file(&rel("busy.db"), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_reconcile_partial_is_non_destructive() {
    let h = Harness::new().await;
    h.remote.add_file("part.bin", b"abcdef", ts(1_700_001_200));
    h.placeholders
        .create_or_update_file(&rel("part.bin"))
        .await
        .unwrap();
    h.host.set_state("part.bin", PlaceholderState::PartiallyOnDisk);

    h.placeholders
        .reconcile_partial(&rel("part.bin"))
        .await
        .unwrap();
    assert_eq!(
        h.host.info("part.bin").unwrap().state,
        PlaceholderState::InSync
    );

    h.host.set_state("part.bin", PlaceholderState::PartiallyOnDisk);
    h.remote.add_file("part.bin", b"changed", ts(1_700_001_300));
    h.host.clear_ops();
    h.placeholders
        .reconcile_partial(&rel("part.bin"))
        .await
        .unwrap();
    assert_eq!(
        h.host.info("part.bin").unwrap().state,
        PlaceholderState::PartiallyOnDisk
    );
    assert!(h.host.ops().is_empty());
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_writer_per_path() {
    let h = Harness::new().await;
    h.remote.add_file("shared.txt", b"x", ts(1_700_001_400));
    h.remote.add_file("other.txt", b"y", ts(1_700_001_400));
    for path in ["shared.txt", "other.txt"] {
        h.placeholders.create_or_update_file(&rel(path)).await.unwrap();
    }
    h.host.set_update_delay(Duration::from_millis(50));

    let same = rel("shared.txt");
    let (a, b) = tokio::join!(
        h.placeholders.update_file(&same, true),
        h.placeholders.update_file(&same, true)
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(h.host.max_concurrent_updates.load(Ordering::SeqCst), 1);

    let other = rel("other.txt");
    let (a, b) = tokio::join!(
        h.placeholders.update_file(&same, true),
        h.placeholders.update_file(&other, true)
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(h.host.max_concurrent_updates.load(Ordering::SeqCst), 2);
    assert!(h.placeholders.locks().is_empty());
}

// ============================================================================
// Rename / delete
// ============================================================================

#[tokio::test]
async fn test_rename_moves_local_entry() {
    let h = Harness::new().await;
    h.remote.add_file("old.txt", b"data", ts(1_700_001_500));
    h.placeholders.create_or_update_file(&rel("old.txt")).await.unwrap();

    h.placeholders
        .rename_file(&rel("old.txt"), &rel("new.txt"))
        .await
        .unwrap();

    assert!(!h.local("old.txt").exists());
    let info = h.host.info("new.txt").unwrap();
    assert!(info.is_placeholder);
    assert_eq!(info.state, PlaceholderState::InSync);
}

#[tokio::test]
async fn test_rename_falls_back_to_create() {
    let h = Harness::new().await;
    h.remote.add_file("moved/target.txt", b"abc", ts(1_700_001_600));
    h.remote.add_dir("renamed-dir");
    std::fs::create_dir(h.local("moved")).unwrap();

    h.placeholders
        .rename_file(&rel("gone.txt"), &rel("moved/target.txt"))
        .await
        .unwrap();
    assert!(h.host.info("moved/target.txt").unwrap().is_placeholder);

    h.placeholders
        .rename_directory(&rel("gone-dir"), &rel("renamed-dir"))
        .await
        .unwrap();
    assert!(h.host.info("renamed-dir").unwrap().is_directory);
}

#[tokio::test]
async fn test_delete_and_delete_bulk() {
    let h = Harness::new().await;
    h.remote.add_file("tree/a.txt", b"a", ts(1_700_001_700));
    h.remote.add_file("tree/deep/b.txt", b"b", ts(1_700_001_700));
    h.remote.add_file("single.txt", b"s", ts(1_700_001_700));
    h.placeholders.create_bulk(&rel(""), &h.cancel).await.unwrap();

    h.placeholders.delete(&rel("single.txt")).await.unwrap();
    assert!(!h.local("single.txt").exists());
    h.placeholders.delete(&rel("single.txt")).await.unwrap();

    h.placeholders.delete_bulk(&rel("tree")).await.unwrap();
    assert!(!h.local("tree").exists());
    assert!(h.remote.contains("tree/deep/b.txt"));
}

#[tokio::test]
async fn test_directory_update_skips_unpopulated() {
    let h = Harness::new().await;
    h.remote.add_file("photos/1.jpg", b"1", ts(1_700_001_800));
    h.placeholders.create_directory(&rel("photos")).await.unwrap();

    h.placeholders.update_directory(&rel("photos")).await.unwrap();
    let info = h.host.info("photos").unwrap();
    assert!(info.offline);
    assert_eq!(info.state, PlaceholderState::Placeholder);

    h.host.create_placeholders(&rel("photos"), &[]).await.unwrap();
    h.placeholders.update_directory(&rel("photos")).await.unwrap();
    assert_eq!(
        h.host.info("photos").unwrap().state,
        PlaceholderState::InSync
    );
}
