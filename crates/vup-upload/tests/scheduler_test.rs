//! End-to-end jobs through the scheduler: retries, pool bounds, pause,
//! cancel, quota, session expiry, paging and crash cleanup.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio_util::sync::CancellationToken;

use vup_core::types::{FileState, RevisionUploadState};
use vup_store::{MetadataStore, StoreError};
use vup_upload::transfer::BLOCK_PAGE_SIZE;
use vup_upload::{
    EventKind, JobOutcome, KeyResolver, RevisionEncryptionCoordinator, SubmitOutcome,
};

use common::{collect_events, pattern, position, test_config, Harness};

/// Block once the job is past encryption and inside the transfer stage.
async fn wait_for_transfer(h: &Harness) {
    tokio::time::timeout(Duration::from_secs(30), async {
        while h.remote.upload_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transfer never started");
}

#[tokio::test]
async fn uploads_and_round_trips() {
    let h = Harness::new(test_config());
    let data = pattern(2500);
    let file = h.draft("photo.raw", &data).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Completed);

    let stored = h.file(&file.id);
    assert_eq!(stored.state, FileState::Active);
    assert!(stored.active_revision_draft.is_none());
    let rev_id = stored.active_revision.clone().unwrap();
    assert_eq!(stored.revisions, vec![rev_id.clone()]);

    let rev = h.store.read_revision(&rev_id).unwrap().unwrap();
    assert_eq!(rev.upload_state, RevisionUploadState::Uploaded);
    assert!(rev.session.is_none());
    assert_eq!(h.cache_files(), 0, "cache is collected after commit");

    // read the committed revision back and decrypt it
    let commit = h.remote.last_commit();
    let committed = h
        .remote
        .inner
        .committed_revision(&commit.file_id, &commit.revision_id)
        .await
        .unwrap();
    let metadata = h.resolver.resolve(&stored).await.unwrap();
    let mut clear = Vec::new();
    for (block, key) in rev.blocks.iter().zip(&committed.block_keys) {
        let ct = h.remote.inner.read_object(key).await.unwrap();
        clear.extend(metadata.decrypt_block(&rev.id, block.index, &ct, &block.signature).unwrap());
    }
    assert_eq!(clear, data);

    let manifest = vup_upload::commit::manifest_bytes(&rev).unwrap();
    metadata
        .verify_manifest(&manifest, rev.manifest_signature.as_deref().unwrap())
        .unwrap();
    assert_eq!(committed.manifest_signature, rev.manifest_signature.clone().unwrap());
    let sealed = STANDARD.decode(&committed.xattrs).unwrap();
    metadata.decrypt_xattr(&rev.id, &sealed).unwrap();
}

#[tokio::test]
async fn network_failures_then_success() {
    let h = Harness::new(test_config());
    h.remote.commit_failures.store(3, Ordering::SeqCst);
    let file = h.draft("flaky.bin", &pattern(1500)).await;
    let scheduler = h.scheduler();
    let mut rx = scheduler.subscribe();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(h.remote.commit_calls.load(Ordering::SeqCst), 4);

    let events = collect_events(&mut rx, 1).await;
    let retries: Vec<u32> = events
        .iter()
        .filter_map(|e| match e.kind {
            EventKind::Retrying { attempt, .. } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![2, 3, 4]);

    let rev_id = h.file(&file.id).active_revision.unwrap();
    let rev = h.store.read_revision(&rev_id).unwrap().unwrap();
    assert_eq!(rev.upload_state, RevisionUploadState::Uploaded);
}

#[tokio::test]
async fn gives_up_after_max_retries() {
    let h = Harness::new(test_config());
    h.remote.commit_failures.store(u32::MAX, Ordering::SeqCst);
    let file = h.draft("down.bin", &pattern(100)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(
        handle.wait().await,
        JobOutcome::Failed {
            category: "network unavailable".into()
        }
    );
    assert_eq!(h.remote.commit_calls.load(Ordering::SeqCst), 10);

    let stored = h.file(&file.id);
    assert_eq!(stored.state, FileState::PausedUpload);
    assert_eq!(stored.last_error.as_deref(), Some("network unavailable"));
}

#[tokio::test]
async fn dropped_block_uploads_are_resent_in_place() {
    let h = Harness::new(test_config());
    h.remote.dropped_uploads.store(2, Ordering::SeqCst);
    let file = h.draft("resend.bin", &pattern(2048)).await;
    let scheduler = h.scheduler();
    let mut rx = scheduler.subscribe();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(h.remote.upload_calls.load(Ordering::SeqCst), 4);

    let events = collect_events(&mut rx, 1).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e.kind, EventKind::Retrying { .. })));
}

#[tokio::test]
async fn pool_of_one_runs_jobs_sequentially() {
    let mut config = test_config();
    config.max_concurrent_files = 1;
    let h = Harness::new(config);
    h.remote.set_upload_delay(Duration::from_millis(100));
    let a = h.draft("a.bin", &pattern(1000)).await;
    let b = h.draft("b.bin", &pattern(1000)).await;
    let scheduler = h.scheduler();
    let mut rx = scheduler.subscribe();

    let ha = scheduler.submit(&a.id).await.unwrap().into_handle().unwrap();
    let hb = scheduler.submit(&b.id).await.unwrap().into_handle().unwrap();
    let events = collect_events(&mut rx, 2).await;
    assert_eq!(ha.wait().await, JobOutcome::Completed);
    assert_eq!(hb.wait().await, JobOutcome::Completed);

    let (first, second) = if position(&events, &a.id, &EventKind::Started)
        < position(&events, &b.id, &EventKind::Started)
    {
        (&a.id, &b.id)
    } else {
        (&b.id, &a.id)
    };
    assert!(
        position(&events, first, &EventKind::Completed)
            < position(&events, second, &EventKind::Started),
        "jobs overlapped: {events:?}"
    );
    assert_eq!(h.remote.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn pool_of_two_overlaps_jobs() {
    let mut config = test_config();
    config.max_concurrent_files = 2;
    let h = Harness::new(config);
    h.remote.set_upload_delay(Duration::from_millis(200));
    let a = h.draft("a.bin", &pattern(1000)).await;
    let b = h.draft("b.bin", &pattern(1000)).await;
    let scheduler = h.scheduler();
    let mut rx = scheduler.subscribe();

    scheduler.submit(&a.id).await.unwrap();
    scheduler.submit(&b.id).await.unwrap();
    let events = collect_events(&mut rx, 2).await;

    let both_started = position(&events, &a.id, &EventKind::Started)
        .max(position(&events, &b.id, &EventKind::Started));
    let first_done = position(&events, &a.id, &EventKind::Completed)
        .min(position(&events, &b.id, &EventKind::Completed));
    assert!(both_started < first_done, "jobs did not overlap: {events:?}");
    assert_eq!(h.remote.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn second_submit_reports_already_uploading() {
    let h = Harness::new(test_config());
    h.remote.set_upload_delay(Duration::from_millis(200));
    let file = h.draft("dup.bin", &pattern(500)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert!(matches!(
        scheduler.submit(&file.id).await.unwrap(),
        SubmitOutcome::AlreadyUploading
    ));
    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(scheduler.active_jobs().await, 0);
}

#[tokio::test]
async fn pause_keeps_state_and_resumes() {
    let h = Harness::new(test_config());
    h.remote.set_upload_delay(Duration::from_millis(300));
    let file = h.draft("pause.bin", &pattern(3000)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    wait_for_transfer(&h).await;
    assert!(scheduler.pause(&file.id).await);
    assert_eq!(handle.wait().await, JobOutcome::Paused);

    let stored = h.file(&file.id);
    assert_eq!(stored.state, FileState::PausedUpload);
    let rev = h
        .store
        .read_revision(stored.active_revision_draft.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(rev.upload_state, RevisionUploadState::Encrypted);
    assert!(rev.session.is_some());

    h.remote.set_upload_delay(Duration::ZERO);
    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(h.file(&file.id).state, FileState::Active);
}

#[tokio::test]
async fn cancel_discards_running_draft() {
    let h = Harness::new(test_config());
    h.remote.set_upload_delay(Duration::from_millis(300));
    let file = h.draft("cancel.bin", &pattern(3000)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    wait_for_transfer(&h).await;
    assert!(scheduler.cancel(file.upload_id.unwrap()).await.unwrap());
    assert_eq!(handle.wait().await, JobOutcome::Cancelled);

    let stored = h.file(&file.id);
    assert_eq!(stored.state, FileState::Deleted);
    assert!(stored.active_revision_draft.is_none());
    assert!(h.store.read_revision(&file.id).unwrap().is_none());
    assert_eq!(h.cache_files(), 0);
    assert_eq!(h.remote.commit_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_without_running_job() {
    let h = Harness::new(test_config());
    let file = h.draft("idle.bin", &pattern(10)).await;
    let scheduler = h.scheduler();

    assert!(scheduler.cancel(file.upload_id.unwrap()).await.unwrap());
    assert_eq!(h.file(&file.id).state, FileState::Deleted);
    assert!(!scheduler.cancel(uuid::Uuid::new_v4()).await.unwrap());
}

#[tokio::test]
async fn quota_parks_file_until_budget_frees() {
    let h = Harness::new(test_config());
    h.remote.quota_exceeded.store(true, Ordering::SeqCst);
    let file = h.draft("big.bin", &pattern(4000)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Waiting);
    assert_eq!(h.file(&file.id).state, FileState::Waiting);

    h.remote.quota_exceeded.store(false, Ordering::SeqCst);
    assert!(scheduler.on_storage_budget_changed(3999).await.unwrap().is_empty());
    assert_eq!(h.file(&file.id).state, FileState::Waiting);

    let handles = scheduler.on_storage_budget_changed(4000).await.unwrap();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        assert_eq!(handle.wait().await, JobOutcome::Completed);
    }
    assert_eq!(h.file(&file.id).state, FileState::Active);
}

#[tokio::test]
async fn budget_admits_waiting_files_in_queue_order() {
    let h = Harness::new(test_config());
    h.remote.quota_exceeded.store(true, Ordering::SeqCst);
    let first = h.draft("first.bin", &pattern(3000)).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.draft("second.bin", &pattern(1000)).await;
    let scheduler = h.scheduler();
    for id in [&first.id, &second.id] {
        let handle = scheduler.submit(id).await.unwrap().into_handle().unwrap();
        assert_eq!(handle.wait().await, JobOutcome::Waiting);
    }

    h.remote.quota_exceeded.store(false, Ordering::SeqCst);
    // the oldest file fits, the next one does not; nothing skips the queue
    let handles = scheduler.on_storage_budget_changed(3500).await.unwrap();
    let admitted: Vec<&str> = handles.iter().map(|h| h.file_id()).collect();
    assert_eq!(admitted, vec![first.id.as_str()]);
    for handle in handles {
        handle.wait().await;
    }
    assert_eq!(h.file(&second.id).state, FileState::Waiting);
}

#[tokio::test]
async fn restarts_interrupted_uploads() {
    let h = Harness::new(test_config());
    let file = h.draft("crash.bin", &pattern(2000)).await;
    assert_eq!(h.file(&file.id).state, FileState::Uploading);

    let scheduler = h.scheduler();
    let handles = scheduler.restart_interrupted_jobs().await.unwrap();
    assert_eq!(handles.len(), 1);
    for handle in handles {
        assert_eq!(handle.wait().await, JobOutcome::Completed);
    }
    assert!(scheduler.restart_interrupted_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_session_regenerates_the_draft() {
    let h = Harness::new(test_config());
    h.remote.expire_next_commit.store(true, Ordering::SeqCst);
    let file = h.draft("slow.bin", &pattern(2500)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(h.remote.commit_calls.load(Ordering::SeqCst), 2);

    let stored = h.file(&file.id);
    assert_ne!(stored.upload_id, file.upload_id, "upload id must be regenerated");
    let rev_id = stored.active_revision.unwrap();
    assert_ne!(rev_id, file.id);
    assert!(h.store.read_revision(&file.id).unwrap().is_none());
    let rev = h.store.read_revision(&rev_id).unwrap().unwrap();
    assert_eq!(rev.upload_state, RevisionUploadState::Uploaded);
    assert_eq!(rev.blocks.len(), 3);
    assert_eq!(h.cache_files(), 0);
    assert_eq!(
        h.remote.discarded_sessions.lock().unwrap().len(),
        1,
        "the expired session is discarded"
    );
}

#[tokio::test]
async fn block_targets_are_requested_in_pages() {
    let h = Harness::new(test_config());
    let file = h.draft("large.bin", &pattern(120 * 1024)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Completed);

    let requests = h.remote.target_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests, vec![BLOCK_PAGE_SIZE, BLOCK_PAGE_SIZE, 20]);
    let rev_id = h.file(&file.id).active_revision.unwrap();
    assert_eq!(h.store.read_revision(&rev_id).unwrap().unwrap().blocks.len(), 120);
}

#[tokio::test]
async fn credential_failure_is_retried() {
    let (h, keys) = Harness::new(test_config()).with_flaky_keys(1);
    let file = h.draft("locked.bin", &pattern(1500)).await;
    let scheduler = h.scheduler();
    let mut rx = scheduler.subscribe();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(handle.wait().await, JobOutcome::Completed);
    assert_eq!(keys.calls.load(Ordering::SeqCst), 2);

    let events = collect_events(&mut rx, 1).await;
    assert!(
        events
            .iter()
            .any(|e| matches!(e.kind, EventKind::Retrying { attempt: 2, .. })),
        "{events:?}"
    );
    let stored = h.file(&file.id);
    assert_eq!(stored.state, FileState::Active);
    assert!(stored.last_error.is_none());
}

#[tokio::test]
async fn rejected_commit_clears_upload_flags_and_fails() {
    let h = Harness::new(test_config());
    h.remote.reject_commits.store(true, Ordering::SeqCst);
    let file = h.draft("rejected.bin", &pattern(2500)).await;
    let scheduler = h.scheduler();

    let handle = scheduler.submit(&file.id).await.unwrap().into_handle().unwrap();
    assert_eq!(
        handle.wait().await,
        JobOutcome::Failed {
            category: "upload rejected".into()
        }
    );
    assert_eq!(h.remote.commit_calls.load(Ordering::SeqCst), 1, "not retried");
    assert_eq!(h.remote.upload_calls.load(Ordering::SeqCst), 3);

    let stored = h.file(&file.id);
    assert_eq!(stored.state, FileState::PausedUpload);
    assert_eq!(stored.last_error.as_deref(), Some("upload rejected"));

    // the reset is on disk, not only in memory
    let on_disk = MetadataStore::open(&h.state_path()).unwrap();
    for store in [&*h.store, &on_disk] {
        let rev = store.read_revision(&file.id).unwrap().unwrap();
        assert_eq!(rev.upload_state, RevisionUploadState::Encrypted);
        assert_eq!(rev.blocks.len(), 3);
        assert!(rev.blocks.iter().all(|b| !b.uploaded && b.upload_token.is_none()));
        assert!(rev.session.is_none());
    }
    assert_eq!(h.cache_files(), 3, "ciphertext is kept for a later attempt");
}

#[tokio::test]
async fn restart_sweeps_orphaned_cache_files() {
    let h = Harness::new(test_config());
    // encrypted and paused: its blocks must survive the sweep
    let paused = h.draft("paused.bin", &pattern(2500)).await;
    let job = h.encryption_job(&paused, CancellationToken::new()).await;
    RevisionEncryptionCoordinator::new().run(job.clone()).await.unwrap();
    h.store
        .transaction(|tx| {
            tx.file_mut(&paused.id)?.state = FileState::PausedUpload;
            Ok::<_, StoreError>(())
        })
        .unwrap();
    assert_eq!(h.cache_files(), 3);

    let orphan = h.cache_dir().join("0b5e7a1e-crashed.block");
    let foreign = h.cache_dir().join("notes.txt");
    std::fs::write(&orphan, b"ciphertext nobody recorded").unwrap();
    std::fs::write(&foreign, b"not a block").unwrap();

    let scheduler = h.scheduler();
    assert!(scheduler.restart_interrupted_jobs().await.unwrap().is_empty());

    assert!(!orphan.exists());
    assert!(foreign.exists());
    let rev = h.store.read_revision(&job.revision_id).unwrap().unwrap();
    assert_eq!(rev.blocks.len(), 3);
    assert!(rev.blocks.iter().all(|b| b.local_path.exists()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn jobs_for_different_files_proceed_while_the_store_flushes() {
    let mut config = test_config();
    config.max_concurrent_files = 2;
    let h = Harness::new(config);
    h.remote.set_upload_delay(Duration::from_millis(1));
    let a = h.draft("a.bin", &pattern(60 * 1024)).await;
    let b = h.draft("b.bin", &pattern(60 * 1024)).await;
    let scheduler = h.scheduler();

    // keep the store flushing for as long as both jobs run
    let stop = CancellationToken::new();
    let flusher = {
        let store = h.store.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut flushes = 0u32;
            while !stop.is_cancelled() {
                store.persist().await.unwrap();
                flushes += 1;
                tokio::task::yield_now().await;
            }
            flushes
        })
    };

    let first = scheduler.submit(&a.id).await.unwrap().into_handle().unwrap();
    let second = scheduler.submit(&b.id).await.unwrap().into_handle().unwrap();
    let (first, second) = tokio::time::timeout(
        Duration::from_secs(60),
        futures::future::join(first.wait(), second.wait()),
    )
    .await
    .expect("jobs stalled behind the flusher");
    assert_eq!(first, JobOutcome::Completed);
    assert_eq!(second, JobOutcome::Completed);

    stop.cancel();
    assert!(flusher.await.unwrap() > 0);

    let on_disk = MetadataStore::open(&h.state_path()).unwrap();
    for id in [&a.id, &b.id] {
        assert_eq!(on_disk.read_file(id).unwrap().unwrap().state, FileState::Active);
    }
}
