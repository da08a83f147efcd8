//! Host callbacks and connection lifecycle

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tetherdrive_core::domain::{PlaceholderState, PopulationPolicy};
use tetherdrive_core::ports::{DataRequest, IHostCallbacks};
use tetherdrive_sync::connector::VirtualizationConnector;
use tetherdrive_sync::remote_watcher::RemoteWatcher;
use tetherdrive_sync::SyncError;

use crate::common::{rel, test_root, ts, Harness, MockHost, RecordingSink};

// ============================================================================
// fetch_data
// ============================================================================

#[tokio::test]
async fn test_fetch_data_streams_in_chunks() {
    let h = Harness::new().await;
    h.remote.add_file("data.bin", b"0123456789", ts(1_700_000_000));
    let sink = RecordingSink::default();

    h.callbacks
        .fetch_data(DataRequest::new(rel("data.bin"), 0, 10), &sink)
        .await;

    let chunks = sink.chunks.lock().unwrap().clone();
    let offsets: Vec<u64> = chunks.iter().map(|(o, _)| *o).collect();
    assert_eq!(offsets, vec![0, 4, 8]);
    assert_eq!(sink.bytes(), b"0123456789");
    assert_eq!(
        *sink.progress.lock().unwrap(),
        vec![(10, 4), (10, 8), (10, 10)]
    );
    assert!(sink.failed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_fetch_data_honours_offset() {
    let h = Harness::new().await;
    h.remote.add_file("data.bin", b"0123456789", ts(1_700_000_000));
    let sink = RecordingSink::default();

    h.callbacks
        .fetch_data(DataRequest::new(rel("data.bin"), 3, 5), &sink)
        .await;

    assert_eq!(
        *sink.chunks.lock().unwrap(),
        vec![(3, b"3456".to_vec()), (7, b"7".to_vec())]
    );
    assert_eq!(h.remote.calls(), vec!["open_read data.bin@3"]);
}

#[tokio::test]
async fn test_short_read_fails_remaining_range() {
    let h = Harness::new().await;
    h.remote.add_file("data.bin", b"0123456789", ts(1_700_000_000));
    h.remote.set_read_limit(Some(6));
    let sink = RecordingSink::default();

    h.callbacks
        .fetch_data(DataRequest::new(rel("data.bin"), 0, 10), &sink)
        .await;

    assert_eq!(sink.bytes(), b"012345");
    assert_eq!(*sink.failed.lock().unwrap(), vec![(6, 4)]);
}

#[tokio::test]
async fn test_cancelled_request_fails_whole_range() {
    let h = Harness::new().await;
    h.remote.add_file("data.bin", b"0123456789", ts(1_700_000_000));
    let sink = RecordingSink::default();
    sink.cancelled.store(true, Ordering::SeqCst);

    h.callbacks
        .fetch_data(DataRequest::new(rel("data.bin"), 0, 10), &sink)
        .await;

    assert!(sink.chunks.lock().unwrap().is_empty());
    assert_eq!(*sink.failed.lock().unwrap(), vec![(0, 10)]);
}

#[tokio::test]
async fn test_missing_remote_file_fails_range() {
    let h = Harness::new().await;
    let sink = RecordingSink::default();

    h.callbacks
        .fetch_data(DataRequest::new(rel("nope.bin"), 2, 8), &sink)
        .await;

    assert_eq!(*sink.failed.lock().unwrap(), vec![(2, 8)]);
}

// ============================================================================
// fetch_placeholders
// ============================================================================

#[tokio::test]
async fn test_fetch_placeholders_populates_one_level() {
    let h = Harness::new().await;
    h.remote.add_file("readme.md", b"hi", ts(1_700_000_000));
    h.remote.add_file("thumbs.db", b"cache", ts(1_700_000_000));
    h.remote.add_file("docs/a.txt", b"a", ts(1_700_000_000));
    h.remote.add_file("docs/b.md", b"b", ts(1_700_000_000));

    h.callbacks.fetch_placeholders(&rel(""), None).await;

    assert!(h.host.info("readme.md").unwrap().is_placeholder);
    assert!(h.host.info("docs").unwrap().offline);
    assert!(!h.local("thumbs.db").exists());
    assert!(!h.local("docs/a.txt").exists());

    h.callbacks.fetch_placeholders(&rel("docs"), Some("*.txt")).await;

    assert!(h.host.info("docs/a.txt").unwrap().is_placeholder);
    assert!(!h.local("docs/b.md").exists());
    assert!(!h.host.info("docs").unwrap().offline);
}

#[tokio::test]
async fn test_fetch_placeholders_for_missing_directory_is_logged() {
    let h = Harness::new().await;
    std::fs::create_dir(h.local("ghost")).unwrap();

    h.callbacks.fetch_placeholders(&rel("ghost"), None).await;

    assert!(h.host.ops().is_empty());
}

// ============================================================================
// Completions
// ============================================================================

#[tokio::test]
async fn test_delete_propagates_only_after_local_absence() {
    let h = Harness::new().await;
    h.remote.add_file("kept.txt", b"k", ts(1_700_000_000));
    h.remote.add_file("old/a.txt", b"a", ts(1_700_000_000));
    h.placeholders.create_bulk(&rel(""), &h.cancel).await.unwrap();

    // Still on disk: the deletion was rolled back or never happened.
    h.callbacks.on_delete_completion(&rel("kept.txt")).await;
    h.completions.flush().await.unwrap();
    assert!(h.remote.contains("kept.txt"));
    assert_eq!(h.remote.count_calls("delete_"), 0);

    std::fs::remove_dir_all(h.local("old")).unwrap();
    h.callbacks.on_delete_completion(&rel("old")).await;
    h.completions.flush().await.unwrap();
    assert!(!h.remote.contains("old"));
    assert!(!h.remote.contains("old/a.txt"));
    assert_eq!(h.remote.count_calls("delete_directory old"), 1);
    assert_eq!(h.remote.count_calls("delete_file"), 0);
}

#[tokio::test]
async fn test_delete_of_reserved_name_is_ignored() {
    let h = Harness::new().await;
    h.remote.add_file("desktop.ini", b"x", ts(1_700_000_000));

    h.callbacks.on_delete_completion(&rel("desktop.ini")).await;
    h.completions.flush().await.unwrap();

    assert!(h.remote.contains("desktop.ini"));
    assert_eq!(h.remote.count_calls("metadata"), 0);
}

#[tokio::test]
async fn test_rename_of_synced_file_propagates() {
    let h = Harness::new().await;
    h.remote.add_file("a.txt", b"alpha", ts(1_700_000_000));
    h.hydrated("a.txt").await;

    std::fs::rename(h.local("a.txt"), h.local("b.txt")).unwrap();
    h.callbacks
        .on_rename_completion(&rel("a.txt"), &rel("b.txt"))
        .await;
    h.completions.flush().await.unwrap();

    assert!(!h.remote.contains("a.txt"));
    assert_eq!(h.remote.content("b.txt").unwrap(), b"alpha");
    assert_eq!(h.remote.count_calls("rename a.txt -> b.txt"), 1);
    let info = h.host.info("b.txt").unwrap();
    assert_eq!(info.state, PlaceholderState::InSync);
    assert_eq!(h.read_local("b.txt"), b"alpha");
}

#[tokio::test]
async fn test_rename_of_unknown_source_skips_remote() {
    let h = Harness::new().await;
    std::fs::write(h.local("draft-renamed.txt"), b"local only").unwrap();

    h.callbacks
        .on_rename_completion(&rel("draft.txt"), &rel("draft-renamed.txt"))
        .await;
    h.completions.flush().await.unwrap();

    assert_eq!(h.remote.count_calls("rename"), 0);
    assert!(!h.remote.contains("draft-renamed.txt"));
}

#[tokio::test]
async fn test_close_completion_refreshes_file() {
    let h = Harness::new().await;
    h.remote.add_file("log.txt", b"v1", ts(1_700_000_000));
    h.placeholders.create_or_update_file(&rel("log.txt")).await.unwrap();
    h.remote.add_file("log.txt", b"v2 is longer", ts(1_700_000_100));

    h.callbacks.on_close_completion(&rel("log.txt")).await;
    h.completions.flush().await.unwrap();

    let info = h.host.info("log.txt").unwrap();
    assert_eq!(info.state, PlaceholderState::InSync);
    assert_eq!(info.identity, Some(h.remote.entry("log.txt").unwrap().identity()));
    assert_eq!(std::fs::metadata(h.local("log.txt")).unwrap().len(), 12);
}

#[tokio::test]
async fn test_close_completion_keeps_local_edit() {
    let h = Harness::new().await;
    h.remote.add_file("report.txt", b"v1", ts(1_700_000_000));
    h.hydrated("report.txt").await;
    h.host.set_state("report.txt", PlaceholderState::Placeholder);
    h.remote.add_file("report.txt", b"v2 from elsewhere", ts(1_700_000_100));

    std::fs::write(h.local("report.txt"), b"saved by the editor").unwrap();
    h.host.clear_ops();
    h.callbacks.on_close_completion(&rel("report.txt")).await;
    h.completions.flush().await.unwrap();

    assert!(h.host.ops().is_empty(), "ops: {:?}", h.host.ops());
    assert_eq!(h.read_local("report.txt"), b"saved by the editor");
    assert_eq!(
        h.host.info("report.txt").unwrap().state,
        PlaceholderState::Placeholder
    );
}

#[tokio::test]
async fn test_remote_poll_does_not_recreate_pending_delete() {
    let h = Harness::new().await;
    h.remote.add_file("gone.txt", b"bye", ts(1_700_000_000));
    h.remote.add_file("old/inner.txt", b"in", ts(1_700_000_000));
    h.placeholders.create_bulk(&rel(""), &h.cancel).await.unwrap();

    // Hold the completion queue so the deletions stay pending.
    let (release, held) = tokio::sync::oneshot::channel::<()>();
    h.completions
        .enqueue("hold", async move {
            let _ = held.await;
            Ok(())
        })
        .unwrap();

    std::fs::remove_file(h.local("gone.txt")).unwrap();
    std::fs::remove_dir_all(h.local("old")).unwrap();
    h.callbacks.on_delete_completion(&rel("gone.txt")).await;
    h.callbacks.on_delete_completion(&rel("old")).await;
    assert!(h.placeholders.is_pending_delete(&rel("gone.txt")));
    assert!(h.placeholders.is_pending_delete(&rel("old/inner.txt")));

    let watcher = RemoteWatcher::new(
        h.callbacks.clone(),
        h.placeholders.clone(),
        h.host.clone(),
        Duration::from_secs(3600),
    );
    watcher.poll_once(&h.cancel).await.unwrap();

    assert!(!h.local("gone.txt").exists());
    assert!(!h.local("old").exists());

    release.send(()).unwrap();
    h.completions.flush().await.unwrap();

    assert!(!h.remote.contains("gone.txt"));
    assert!(!h.remote.contains("old"));
    assert!(!h.placeholders.is_pending_delete(&rel("gone.txt")));
    assert!(!h.placeholders.is_pending_delete(&rel("old/inner.txt")));
}

// ============================================================================
// update_placeholders
// ============================================================================

#[tokio::test]
async fn test_update_placeholders_removes_remote_deletions() {
    let h = Harness::new().await;
    h.remote.add_file("keep.txt", b"k", ts(1_700_000_000));
    h.remote.add_file("gone.txt", b"g", ts(1_700_000_000));
    h.remote.add_file("olddir/x.txt", b"x", ts(1_700_000_000));
    h.remote.add_file("live/gone-too.txt", b"y", ts(1_700_000_000));
    h.placeholders.create_bulk(&rel(""), &h.cancel).await.unwrap();
    std::fs::write(h.local("draft.txt"), b"pending upload").unwrap();

    h.remote.remove("gone.txt");
    h.remote.remove("olddir");
    h.remote.remove("live/gone-too.txt");

    h.callbacks.update_placeholders(&rel("")).await.unwrap();

    assert!(h.local("keep.txt").exists());
    assert!(h.local("draft.txt").exists());
    assert!(h.local("live").exists());
    assert!(!h.local("gone.txt").exists());
    assert!(!h.local("olddir").exists());
    assert!(!h.local("live/gone-too.txt").exists());
}

#[tokio::test]
async fn test_update_placeholders_stops_when_cancelled() {
    let h = Harness::new().await;
    h.cancel.cancel();

    let err = h.callbacks.update_placeholders(&rel("")).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::Cancelled)
    ));
}

// ============================================================================
// Connection lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_and_disconnect_are_guarded() {
    let h = Harness::new().await;
    let host = Arc::new(MockHost::new(h.dir.path()));
    let connector = VirtualizationConnector::new(
        test_root(h.dir.path(), PopulationPolicy::OnDemand),
        host.clone(),
        h.callbacks.clone(),
    );

    connector.disconnect().await.unwrap();
    assert_eq!(host.disconnects.load(Ordering::SeqCst), 0);

    connector.connect().await.unwrap();
    assert!(connector.is_connected().await);
    assert!(host.is_connected());

    let err = connector.connect().await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SyncError>(),
        Some(SyncError::AlreadyConnected)
    ));
    assert_eq!(host.connects.load(Ordering::SeqCst), 1);

    connector.disconnect().await.unwrap();
    connector.disconnect().await.unwrap();
    assert_eq!(host.disconnects.load(Ordering::SeqCst), 1);
    assert!(!connector.is_connected().await);
    assert!(!host.is_connected());
}

#[tokio::test]
async fn test_failed_connect_leaves_connector_disconnected() {
    let h = Harness::new().await;
    let host = Arc::new(MockHost::new(h.dir.path()));
    host.fail_connect();
    let connector = VirtualizationConnector::new(
        test_root(h.dir.path(), PopulationPolicy::OnDemand),
        host.clone(),
        h.callbacks.clone(),
    );

    assert!(connector.connect().await.is_err());
    assert!(!connector.is_connected().await);
    connector.disconnect().await.unwrap();
    assert_eq!(host.disconnects.load(Ordering::SeqCst), 0);
}
