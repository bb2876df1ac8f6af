// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Volume upload status monitor
//!
//! Volumes uploaded by users land on an image store through an agent. This
//! task polls the agents for every volume still waiting on its upload and
//! moves the volume to Uploaded, UploadError or UploadAbandoned.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use datamotion_types::{AnswerPayload, Command, DataObjectType, UploadStatus, UploadStatusCommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::{Persistence, StoreError};
use crate::endpoint::EndpointSelector;
use crate::fsm::{DownloadUpdate, TransitionPayload, volume_machine};
use crate::metrics;
use crate::model::{DownloadState, StoreRecord, VolumeEvent, VolumeRecord, VolumeState};

/// What one reconciliation did with a pending upload record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Uploaded,
    Failed,
    InProgress,
    Abandoned,
    /// The agent has no news and the upload has not timed out
    Unchanged,
    /// A transition lost to a concurrent writer or was not legal
    NotApplied,
    Skipped(SkipReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    NoStore,
    NoEndpoint,
    VolumeGone,
    NotOwner,
    NoAnswer,
    UnexpectedAnswer,
}

pub struct UploadMonitor {
    db: Arc<dyn Persistence>,
    selector: Arc<dyn EndpointSelector>,
    interval: Duration,
    timeout: Duration,
    node_id: i64,
    started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl UploadMonitor {
    pub fn new(
        db: Arc<dyn Persistence>,
        selector: Arc<dyn EndpointSelector>,
        interval: Duration,
        timeout: Duration,
        node_id: i64,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            db,
            selector,
            interval,
            timeout,
            node_id,
            started: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Spawn the polling loop. Returns `None` if it is already running.
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Upload monitor already started");
            return None;
        }
        Some(tokio::spawn(async move { self.run().await }))
    }

    pub fn shutdown(&self) {
        info!("Shutting down upload monitor");
        // Intentionally ignore send error - the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    async fn run(&self) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            node_id = self.node_id,
            "Upload monitor started"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        while !*shutdown_rx.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            self.tick().await;
        }

        info!("Upload monitor stopped");
    }

    /// One reconciliation pass over every pending upload.
    pub async fn tick(&self) -> Vec<(i64, ReconcileOutcome)> {
        metrics::record_upload_monitor_tick();

        let records = match self.db.list_pending_uploads().await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "Failed to list pending uploads");
                return Vec::new();
            }
        };

        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            match self.reconcile(&record).await {
                Ok(outcome) => {
                    debug!(record_id = record.id, volume_id = record.object_id, ?outcome, "Reconciled upload");
                    outcomes.push((record.id, outcome));
                }
                Err(e) => {
                    error!(
                        record_id = record.id,
                        volume_id = record.object_id,
                        error = %e,
                        "Failed to reconcile upload"
                    );
                }
            }
        }
        outcomes
    }

    async fn reconcile(&self, record: &StoreRecord) -> Result<ReconcileOutcome, StoreError> {
        let Some(store) = self.db.find_data_store(record.store_id).await? else {
            warn!(record_id = record.id, store_id = record.store_id, "Upload store not found");
            return Ok(ReconcileOutcome::Skipped(SkipReason::NoStore));
        };

        let Some(endpoint) = self.selector.select_for_store(&store).await else {
            warn!(
                record_id = record.id,
                store_id = store.id,
                "No endpoint to query upload status"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::NoEndpoint));
        };

        let Some(mut volume) = self.db.find_volume(record.object_id).await? else {
            debug!(volume_id = record.object_id, "Volume removed while uploading");
            return Ok(ReconcileOutcome::Skipped(SkipReason::VolumeGone));
        };

        let owned = self
            .db
            .find_host(endpoint.host_id())
            .await?
            .is_some_and(|h| h.management_server_id == Some(self.node_id));
        if !owned {
            debug!(
                volume_id = volume.id,
                host_id = endpoint.host_id(),
                "Upload host is managed by another node"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::NotOwner));
        }

        let command = Command::UploadStatus(UploadStatusCommand {
            entity_id: volume.id,
            entity_type: DataObjectType::Volume,
        });
        let answer = match endpoint.send_message(&command).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(volume_id = volume.id, error = %e, "Upload status query failed");
                return Ok(ReconcileOutcome::Skipped(SkipReason::NoAnswer));
            }
        };

        let (status, download_pct, install_path, size, physical_size) = match &answer.payload {
            AnswerPayload::UploadStatus {
                status,
                download_pct,
                install_path,
                size,
                physical_size,
            } => (
                *status,
                *download_pct,
                install_path.clone(),
                *size,
                *physical_size,
            ),
            other => {
                warn!(
                    volume_id = volume.id,
                    payload = ?other,
                    "Unexpected answer to upload status query"
                );
                return Ok(ReconcileOutcome::Skipped(SkipReason::UnexpectedAnswer));
            }
        };
        metrics::record_upload_status(&status.to_string());

        match status {
            UploadStatus::Completed => {
                let payload = TransitionPayload {
                    install_path,
                    size,
                    physical_size,
                    download: Some(DownloadUpdate {
                        record_id: record.id,
                        state: DownloadState::Uploaded,
                        pct: Some(100),
                        error: None,
                    }),
                };
                if !self
                    .fire(&mut volume, VolumeEvent::OperationSucceeded, Some(&payload))
                    .await?
                {
                    return Ok(ReconcileOutcome::NotApplied);
                }
                info!(volume_id = volume.id, "Volume upload completed");
                Ok(ReconcileOutcome::Uploaded)
            }
            UploadStatus::Error => {
                let payload = TransitionPayload {
                    download: Some(DownloadUpdate {
                        record_id: record.id,
                        state: DownloadState::UploadError,
                        pct: Some(download_pct),
                        error: answer.details.clone(),
                    }),
                    ..Default::default()
                };
                if !self
                    .fire(&mut volume, VolumeEvent::OperationFailed, Some(&payload))
                    .await?
                {
                    return Ok(ReconcileOutcome::NotApplied);
                }
                warn!(
                    volume_id = volume.id,
                    details = answer.details_or_default(),
                    "Volume upload failed"
                );
                Ok(ReconcileOutcome::Failed)
            }
            UploadStatus::InProgress => {
                if volume.state == VolumeState::NotUploaded {
                    let payload = TransitionPayload {
                        download: Some(DownloadUpdate {
                            record_id: record.id,
                            state: DownloadState::UploadInProgress,
                            pct: Some(download_pct),
                            error: None,
                        }),
                        ..Default::default()
                    };
                    if !self
                        .fire(&mut volume, VolumeEvent::UploadRequested, Some(&payload))
                        .await?
                    {
                        return Ok(ReconcileOutcome::NotApplied);
                    }
                } else {
                    self.db
                        .update_download_state(
                            DataObjectType::Volume,
                            record.id,
                            DownloadState::UploadInProgress,
                            Some(download_pct),
                        )
                        .await?;
                }
                match self.abandon_if_expired(&mut volume, record).await? {
                    ReconcileOutcome::Unchanged => Ok(ReconcileOutcome::InProgress),
                    outcome => Ok(outcome),
                }
            }
            UploadStatus::Unknown => self.abandon_if_expired(&mut volume, record).await,
        }
    }

    /// Abandon the upload if it has been pending longer than the timeout.
    async fn abandon_if_expired(
        &self,
        volume: &mut VolumeRecord,
        record: &StoreRecord,
    ) -> Result<ReconcileOutcome, StoreError> {
        let elapsed = Utc::now().signed_duration_since(record.created);
        if !elapsed.to_std().is_ok_and(|e| e > self.timeout) {
            return Ok(ReconcileOutcome::Unchanged);
        }

        let payload = TransitionPayload {
            download: Some(DownloadUpdate {
                record_id: record.id,
                state: DownloadState::Abandoned,
                pct: None,
                error: Some(format!(
                    "Upload not completed within {} seconds",
                    self.timeout.as_secs()
                )),
            }),
            ..Default::default()
        };
        if !self
            .fire(volume, VolumeEvent::OperationTimeout, Some(&payload))
            .await?
        {
            return Ok(ReconcileOutcome::NotApplied);
        }
        warn!(
            volume_id = volume.id,
            elapsed_secs = elapsed.num_seconds(),
            "Volume upload abandoned"
        );
        Ok(ReconcileOutcome::Abandoned)
    }

    async fn fire(
        &self,
        volume: &mut VolumeRecord,
        event: VolumeEvent,
        payload: Option<&TransitionPayload>,
    ) -> Result<bool, StoreError> {
        let applied = volume_machine()
            .transition(volume, event, payload, self.db.as_ref())
            .await?;
        if !applied {
            error!(
                volume_id = volume.id,
                state = %volume.state,
                event = %event,
                "Unexpected failure applying upload status to volume"
            );
        }
        Ok(applied)
    }
}
