// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

// Allow expect/unwrap in tests - they provide clear panic messages on failure
#![allow(clippy::expect_used, clippy::unwrap_used)]

//! Upload monitor reconciliation against scripted agent answers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use datamotion_types::{
    Answer, AnswerPayload, DataObjectType, DataStoreRole, StoreProtocol, UploadStatus,
};

use datamotion_manager::db::{MemoryDatabase, VolumeDao};
use datamotion_manager::model::{
    DownloadState, ObjectInStoreState, StoreRecord, VolumeState,
};
use datamotion_manager::upload_monitor::{ReconcileOutcome, SkipReason, UploadMonitor};

use common::{FakeAgent, FakeSelector, Reply, host, store, store_record, volume_record, zone};

const VOLUME_ID: i64 = 5;
const RECORD_ID: i64 = 50;
const NODE_ID: i64 = 1;

struct UploadHarness {
    db: Arc<MemoryDatabase>,
    agent: Arc<FakeAgent>,
    selector: Arc<FakeSelector>,
    monitor: UploadMonitor,
}

/// One volume waiting on its upload to an NFS image store, polled through
/// host 1.
fn harness(created: DateTime<Utc>, owner: i64) -> UploadHarness {
    let db = Arc::new(MemoryDatabase::new());
    let image = store(3, DataStoreRole::Image, StoreProtocol::Nfs, zone(1));
    db.insert_data_store(image.clone());
    db.insert_host(host(1, 3, 1, owner));
    db.insert_volume(volume_record(VOLUME_ID, None, VolumeState::NotUploaded));

    let mut record = store_record(
        RECORD_ID,
        DataObjectType::Volume,
        VOLUME_ID,
        &image,
        ObjectInStoreState::Allocated,
        created,
    );
    record.install_path = None;
    db.insert_store_record(record);

    let agent = FakeAgent::new();
    let selector = FakeSelector::new(1, Arc::clone(&agent));
    let monitor = UploadMonitor::new(
        db.clone(),
        selector.clone(),
        Duration::from_secs(60),
        Duration::from_secs(600),
        NODE_ID,
    );

    UploadHarness {
        db,
        agent,
        selector,
        monitor,
    }
}

fn status_answer(status: UploadStatus, download_pct: i32) -> Answer {
    Answer::success().with_payload(AnswerPayload::UploadStatus {
        status,
        download_pct,
        install_path: None,
        size: None,
        physical_size: None,
    })
}

fn upload_record(h: &UploadHarness) -> StoreRecord {
    h.db.store_records(DataObjectType::Volume)
        .into_iter()
        .find(|r| r.id == RECORD_ID)
        .unwrap()
}

async fn volume_state(h: &UploadHarness) -> VolumeState {
    h.db.find_volume(VOLUME_ID).await.unwrap().unwrap().state
}

// ============================================================================
// Agent reports
// ============================================================================

/// Test: a completed upload marks the volume Uploaded and records where it
/// landed; the next tick has nothing left to do
#[tokio::test]
async fn completed_upload_is_recorded_once() {
    let h = harness(Utc::now(), NODE_ID);
    h.agent.script(
        "upload_status",
        Reply::Answer(
            Answer::success().with_payload(AnswerPayload::UploadStatus {
                status: UploadStatus::Completed,
                download_pct: 100,
                install_path: Some("volumes/5.qcow2".to_string()),
                size: Some(4096),
                physical_size: Some(2048),
            }),
        ),
    );

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::Uploaded)]);
    assert_eq!(volume_state(&h).await, VolumeState::Uploaded);

    let record = upload_record(&h);
    assert_eq!(record.download_state, Some(DownloadState::Uploaded));
    assert_eq!(record.download_pct, 100);
    assert_eq!(record.install_path.as_deref(), Some("volumes/5.qcow2"));
    assert_eq!(record.size, 4096);
    assert_eq!(record.physical_size, 2048);

    assert!(h.monitor.tick().await.is_empty());
    assert_eq!(h.agent.sent_names(), vec!["upload_status"]);
}

/// Test: an agent-side error moves the volume to UploadError with the details
#[tokio::test]
async fn failed_upload_records_error() {
    let h = harness(Utc::now(), NODE_ID);
    let mut answer = status_answer(UploadStatus::Error, 30);
    answer.details = Some("checksum mismatch".to_string());
    h.agent.script("upload_status", Reply::Answer(answer));

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::Failed)]);
    assert_eq!(volume_state(&h).await, VolumeState::UploadError);

    let record = upload_record(&h);
    assert_eq!(record.download_state, Some(DownloadState::UploadError));
    assert_eq!(record.error_str.as_deref(), Some("checksum mismatch"));
}

/// Test: progress moves a fresh volume to UploadInProgress and tracks the
/// percentage
#[tokio::test]
async fn in_progress_upload_tracks_percentage() {
    let h = harness(Utc::now(), NODE_ID);
    h.agent.script(
        "upload_status",
        Reply::Answer(status_answer(UploadStatus::InProgress, 40)),
    );
    h.agent.script(
        "upload_status",
        Reply::Answer(status_answer(UploadStatus::InProgress, 75)),
    );

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::InProgress)]);
    assert_eq!(volume_state(&h).await, VolumeState::UploadInProgress);
    assert_eq!(upload_record(&h).download_pct, 40);

    // Already in progress, only the percentage moves
    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::InProgress)]);
    let record = upload_record(&h);
    assert_eq!(record.download_state, Some(DownloadState::UploadInProgress));
    assert_eq!(record.download_pct, 75);
}

/// Test: the first progress report moves the volume and its store row in
/// one write
#[tokio::test]
async fn upload_start_is_written_with_volume_transition() {
    let h = harness(Utc::now(), NODE_ID);
    h.db.fail_download_updates();
    h.agent.script(
        "upload_status",
        Reply::Answer(status_answer(UploadStatus::InProgress, 15)),
    );
    h.agent.script(
        "upload_status",
        Reply::Answer(status_answer(UploadStatus::InProgress, 20)),
    );

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::InProgress)]);
    assert_eq!(volume_state(&h).await, VolumeState::UploadInProgress);
    let record = upload_record(&h);
    assert_eq!(record.download_state, Some(DownloadState::UploadInProgress));
    assert_eq!(record.download_pct, 15);

    // Later progress is a standalone update, which now fails
    assert!(h.monitor.tick().await.is_empty());
    assert_eq!(upload_record(&h).download_pct, 15);
}

// ============================================================================
// Timeouts
// ============================================================================

/// Test: an upload with no news past the timeout is abandoned
#[tokio::test]
async fn stale_upload_is_abandoned() {
    let h = harness(Utc::now() - chrono::Duration::hours(2), NODE_ID);

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::Abandoned)]);
    assert_eq!(volume_state(&h).await, VolumeState::UploadAbandoned);

    let record = upload_record(&h);
    assert_eq!(record.download_state, Some(DownloadState::Abandoned));
    assert!(record.error_str.unwrap().contains("600 seconds"));
    assert!(h.monitor.tick().await.is_empty());
}

/// Test: a still-running upload past the timeout is abandoned too
#[tokio::test]
async fn slow_upload_in_progress_is_abandoned() {
    let h = harness(Utc::now() - chrono::Duration::hours(2), NODE_ID);
    h.agent.script(
        "upload_status",
        Reply::Answer(status_answer(UploadStatus::InProgress, 10)),
    );

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::Abandoned)]);
    assert_eq!(volume_state(&h).await, VolumeState::UploadAbandoned);
}

#[tokio::test]
async fn fresh_upload_without_news_is_unchanged() {
    let h = harness(Utc::now(), NODE_ID);

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::Unchanged)]);
    assert_eq!(volume_state(&h).await, VolumeState::NotUploaded);
}

// ============================================================================
// Skips
// ============================================================================

/// Test: uploads through a host owned by another management server are left
/// alone
#[tokio::test]
async fn upload_owned_by_other_node_is_skipped() {
    let h = harness(Utc::now() - chrono::Duration::hours(2), 2);

    let outcomes = h.monitor.tick().await;
    assert_eq!(
        outcomes,
        vec![(RECORD_ID, ReconcileOutcome::Skipped(SkipReason::NotOwner))]
    );
    assert_eq!(volume_state(&h).await, VolumeState::NotUploaded);
    assert!(h.agent.sent().is_empty());
}

#[tokio::test]
async fn upload_without_endpoint_is_skipped() {
    let h = harness(Utc::now(), NODE_ID);
    h.selector.set_available(false);

    let outcomes = h.monitor.tick().await;
    assert_eq!(
        outcomes,
        vec![(RECORD_ID, ReconcileOutcome::Skipped(SkipReason::NoEndpoint))]
    );
}

/// Test: an unreachable agent leaves the upload for the next tick
#[tokio::test]
async fn unreachable_agent_is_retried_next_tick() {
    let h = harness(Utc::now(), NODE_ID);
    h.agent.script(
        "upload_status",
        Reply::Transport("connection refused".to_string()),
    );

    let outcomes = h.monitor.tick().await;
    assert_eq!(
        outcomes,
        vec![(RECORD_ID, ReconcileOutcome::Skipped(SkipReason::NoAnswer))]
    );
    assert_eq!(volume_state(&h).await, VolumeState::NotUploaded);

    let outcomes = h.monitor.tick().await;
    assert_eq!(outcomes, vec![(RECORD_ID, ReconcileOutcome::Unchanged)]);
}

// ============================================================================
// Task lifecycle
// ============================================================================

/// Test: the monitor starts once and stops on shutdown
#[tokio::test]
async fn monitor_starts_once_and_shuts_down() {
    let h = harness(Utc::now(), NODE_ID);
    let monitor = Arc::new(h.monitor);

    let handle = Arc::clone(&monitor).start().unwrap();
    assert!(Arc::clone(&monitor).start().is_none());

    monitor.shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
