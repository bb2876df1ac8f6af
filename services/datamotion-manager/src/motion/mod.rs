// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Data motion strategy
//!
//! Copies volumes, snapshots and templates between data stores by sending
//! commands to host agents. Each (source, destination) pair is routed to one
//! copy procedure (see [`route::route`]); procedures that cannot reach both
//! stores from one agent stage the source through an image cache first.
//!
//! A copy that the agent rejects is not an error: it produces an [`Answer`]
//! with `result == false`. Only infrastructure failures (database, transport,
//! cache allocation) surface as [`MotionError`], and every path rolls back
//! the cache entries it created before returning.

pub mod route;
pub mod staging;

use std::sync::Arc;

use datamotion_types::{
    Answer, Command, CopyCommand, DataObjectType, DataStoreRole, MigrateVolumeCommand, Scope,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cache::{CacheError, CacheManager, destroy_object};
use crate::config::MotionSettings;
use crate::db::{Persistence, StoreError, load_snapshot_chain};
use crate::endpoint::{Endpoint, EndpointError, EndpointSelector};
use crate::fsm::{TransitionPayload, object_in_store_machine};
use crate::metrics;
use crate::model::{
    DataObject, DataStore, NewStoreRecord, ObjectInStoreEvent, SnapshotObject, StoreRecord,
    VolumeLocation, VolumeObject,
};

pub use route::{CopyRoute, needs_cache, pick_cache_scope};
pub use staging::{Disposition, StagedCache};

/// Details of the answer returned for bulk volume copies.
pub const UNSUPPORTED_BULK_COPY: &str = "Unsupported operation requested for copying data.";

const NO_ENDPOINT_DETAILS: &str = "No remote endpoint to send command, check if host is up";

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("No usable cache scope for copying {0}")]
    NoCacheScope(String),

    #[error("No endpoint available for {0}")]
    NoEndpoint(String),

    #[error("{command} failed on agent: {details}")]
    Remote {
        command: &'static str,
        details: String,
    },

    #[error("Placement record for {0} changed underneath us")]
    Transition(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of an asynchronous copy: the agent's answer, an error message, or
/// both absent when no procedure could satisfy the request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CopyCommandResult {
    pub answer: Option<Answer>,
    pub error: Option<String>,
}

impl CopyCommandResult {
    fn from_answer(answer: Answer) -> Self {
        let error = (!answer.result).then(|| answer.details_or_default().to_string());
        Self {
            answer: Some(answer),
            error,
        }
    }

    fn from_error(error: &MotionError) -> Self {
        Self {
            answer: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.answer.as_ref().is_some_and(|a| a.result)
    }
}

pub struct DataMotionStrategy {
    db: Arc<dyn Persistence>,
    selector: Arc<dyn EndpointSelector>,
    cache: Arc<dyn CacheManager>,
    settings: watch::Receiver<MotionSettings>,
}

impl DataMotionStrategy {
    pub fn new(
        db: Arc<dyn Persistence>,
        selector: Arc<dyn EndpointSelector>,
        cache: Arc<dyn CacheManager>,
        settings: watch::Receiver<MotionSettings>,
    ) -> Self {
        Self {
            db,
            selector,
            cache,
            settings,
        }
    }

    fn settings(&self) -> MotionSettings {
        self.settings.borrow().clone()
    }

    /// Every pairwise copy is handled here.
    pub fn can_handle(&self, _src: &DataObject, _dest: &DataObject) -> bool {
        true
    }

    /// Bulk volume copies (live migration with storage) are not.
    pub fn can_handle_volumes(&self, _volumes: &[(VolumeObject, DataStore)]) -> bool {
        false
    }

    pub fn copy_volumes(&self, volumes: &[(VolumeObject, DataStore)]) -> CopyCommandResult {
        warn!(count = volumes.len(), "Bulk volume copy requested");
        CopyCommandResult::from_answer(Answer::failure(UNSUPPORTED_BULK_COPY))
    }

    /// Copy `src` to `dest` by whichever procedure handles the pair.
    pub async fn copy_async(&self, src: &DataObject, dest: &DataObject) -> CopyCommandResult {
        let route = route::route(src, dest);
        info!(src = %src, dest = %dest, route = route.name(), "Copy requested");

        let outcome = match (route, src, dest) {
            (CopyRoute::VolumeFromSnapshot, _, _) => {
                self.copy_volume_from_snapshot(src, dest).await.map(Some)
            }
            (CopyRoute::TemplateFromSnapshot, _, _) => {
                self.create_template_from_snapshot(src, dest).await.map(Some)
            }
            (CopyRoute::CloneVolume, _, _) => self.clone_volume(src, dest).await.map(Some),
            (CopyRoute::MigrateVolume, DataObject::Volume(s), DataObject::Volume(d)) => {
                self.migrate_volume_to_pool(s, d).await.map(Some)
            }
            (CopyRoute::VolumeBetweenPools, _, _) => {
                self.copy_volume_between_pools(src, dest).await
            }
            (CopyRoute::Snapshot, _, _) => self.copy_snapshot(src, dest).await.map(Some),
            (CopyRoute::Object, _, _) | (CopyRoute::MigrateVolume, _, _) => {
                self.copy_object(src, dest).await.map(Some)
            }
        };

        match outcome {
            Ok(Some(answer)) => {
                let result = if answer.result { "success" } else { "failure" };
                metrics::record_copy(route.name(), result);
                if !answer.result {
                    warn!(
                        src = %src,
                        dest = %dest,
                        details = answer.details_or_default(),
                        "Copy failed on agent"
                    );
                }
                CopyCommandResult::from_answer(answer)
            }
            Ok(None) => {
                metrics::record_copy(route.name(), "unsatisfied");
                warn!(src = %src, dest = %dest, "No staging store available for copy");
                CopyCommandResult::default()
            }
            Err(e) => {
                metrics::record_copy(route.name(), "error");
                error!(src = %src, dest = %dest, error = %e, "Copy failed");
                CopyCommandResult::from_error(&e)
            }
        }
    }

    /// Send `command` to `endpoint`. No endpoint is an agent-level failure,
    /// not an error.
    async fn execute(
        &self,
        endpoint: Option<Arc<dyn Endpoint>>,
        command: &Command,
    ) -> Result<Answer, MotionError> {
        match endpoint {
            Some(endpoint) => Ok(endpoint.send_message(command).await?),
            None => {
                warn!(command = command.name(), "No endpoint available for command");
                Ok(Answer::failure(NO_ENDPOINT_DETAILS))
            }
        }
    }

    fn require_cache_scope(&self, src: &DataObject, dest: &DataObject) -> Result<Scope, MotionError> {
        pick_cache_scope(src.store(), dest.store())
            .ok_or_else(|| MotionError::NoCacheScope(src.to_string()))
    }

    // -------------------------------------------------------------------------
    // Generic copy
    // -------------------------------------------------------------------------

    /// Copy any object, staging the source in an image cache when the two
    /// stores cannot be bridged by one agent.
    pub async fn copy_object(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Result<Answer, MotionError> {
        let wait = self.settings().primary_storage_download_wait;
        self.copy_object_with_wait(src, dest, wait).await
    }

    async fn copy_object_with_wait(
        &self,
        src: &DataObject,
        dest: &DataObject,
        wait_secs: u64,
    ) -> Result<Answer, MotionError> {
        let settings = self.settings();
        let mut staged = StagedCache::new(Arc::clone(&self.cache));

        let effective_src = if needs_cache(src.store(), dest.store()) {
            let scope = self.require_cache_scope(src, dest)?;
            let cached = self.cache.create_cache_object(src, &scope).await?;
            staged.push(cached.clone());
            cached
        } else {
            src.clone()
        };

        let endpoint = self.selector.select_for_copy(&effective_src, dest).await;
        let command = Command::Copy(CopyCommand::new(
            effective_src.to_descriptor(),
            dest.to_descriptor(),
            wait_secs,
            settings.execute_in_sequence,
        ));

        let answer = match self.execute(endpoint, &command).await {
            Ok(answer) => answer,
            Err(e) => {
                staged.settle(Disposition::Delete).await;
                return Err(e);
            }
        };

        // A volume staged for a volume copy is never reused
        let both_volumes = src.object_type() == DataObjectType::Volume
            && dest.object_type() == DataObjectType::Volume;
        let disposition = if both_volumes || !answer.result {
            Disposition::Delete
        } else {
            Disposition::Release
        };
        staged.settle(disposition).await;
        Ok(answer)
    }

    // -------------------------------------------------------------------------
    // Snapshot sources
    // -------------------------------------------------------------------------

    /// The snapshot with its full backing chain, loading it from the
    /// placement records when the caller passed a bare snapshot.
    async fn resolve_chain(&self, snapshot: &SnapshotObject) -> Result<SnapshotObject, MotionError> {
        if snapshot.parent.is_some() {
            return Ok(snapshot.clone());
        }
        match load_snapshot_chain(self.db.as_ref(), &snapshot.store, snapshot.snapshot_id).await {
            Ok(chain) => Ok(chain),
            Err(StoreError::NotFound(_)) => Ok(snapshot.clone()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stage every link of the chain, oldest first, into one cache zone and
    /// return the cached leaf with its cached ancestors attached.
    async fn stage_chain(
        &self,
        src: &DataObject,
        dest: &DataObject,
        staged: &mut StagedCache,
    ) -> Result<DataObject, MotionError> {
        let DataObject::Snapshot(snapshot) = src else {
            return Ok(src.clone());
        };
        let scope = self.require_cache_scope(src, dest)?;
        let chain = self.resolve_chain(snapshot).await?;

        let mut cached_parent: Option<SnapshotObject> = None;
        for link in chain.chain_oldest_first() {
            let cached = self
                .cache
                .create_cache_object(&DataObject::Snapshot(link.clone()), &scope)
                .await?;
            match cached {
                DataObject::Snapshot(mut cached) => {
                    cached.parent = cached_parent.take().map(Box::new);
                    staged.push(DataObject::Snapshot(SnapshotObject {
                        parent: None,
                        ..cached.clone()
                    }));
                    cached_parent = Some(cached);
                }
                other => staged.push(other),
            }
        }

        Ok(cached_parent.map_or_else(|| src.clone(), DataObject::Snapshot))
    }

    async fn copy_from_snapshot(
        &self,
        src: &DataObject,
        dest: &DataObject,
        stage: bool,
        wait_secs: u64,
    ) -> Result<Answer, MotionError> {
        let settings = self.settings();
        let mut staged = StagedCache::new(Arc::clone(&self.cache));

        let effective_src = if stage {
            match self.stage_chain(src, dest, &mut staged).await {
                Ok(cached) => cached,
                Err(e) => {
                    staged.settle(Disposition::Delete).await;
                    return Err(e);
                }
            }
        } else {
            src.clone()
        };

        let endpoint = self.selector.select_for_copy(&effective_src, dest).await;
        let command = Command::Copy(CopyCommand::new(
            effective_src.to_descriptor(),
            dest.to_descriptor(),
            wait_secs,
            settings.execute_in_sequence,
        ));
        let result = self.execute(endpoint, &command).await;

        // Staged chains are only useful to this copy
        staged.settle(Disposition::Delete).await;
        result
    }

    /// Create a primary volume from a snapshot.
    pub async fn copy_volume_from_snapshot(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Result<Answer, MotionError> {
        let stage = !src.store().is_nfs_backed();
        let wait = self.settings().create_volume_from_snapshot_wait;
        self.copy_from_snapshot(src, dest, stage, wait).await
    }

    pub async fn create_template_from_snapshot(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Result<Answer, MotionError> {
        let stage = needs_cache(src.store(), dest.store());
        let wait = self.settings().create_private_template_from_snapshot_wait;
        self.copy_from_snapshot(src, dest, stage, wait).await
    }

    /// Back up a snapshot to another store.
    ///
    /// The cache slot is attached to the command rather than filled first;
    /// the agent stages through it as part of the copy.
    pub async fn copy_snapshot(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Result<Answer, MotionError> {
        let settings = self.settings();
        let mut staged = StagedCache::new(Arc::clone(&self.cache));

        let mut command = CopyCommand::new(
            src.to_descriptor(),
            dest.to_descriptor(),
            settings.backup_snapshot_wait,
            settings.execute_in_sequence,
        );
        if needs_cache(src.store(), dest.store()) {
            let scope = self.require_cache_scope(src, dest)?;
            let cached = self.cache.get_cache_object(src, &scope).await?;
            command = command.with_cache(cached.to_descriptor());
            staged.push(cached);
        }

        let endpoint = self.selector.select_for_copy(src, dest).await;
        let answer = match self.execute(endpoint, &Command::Copy(command)).await {
            Ok(answer) => answer,
            Err(e) => {
                staged.settle(Disposition::Delete).await;
                return Err(e);
            }
        };

        let disposition = if answer.result {
            Disposition::Release
        } else {
            Disposition::Delete
        };
        staged.settle(disposition).await;
        Ok(answer)
    }

    // -------------------------------------------------------------------------
    // Template and volume sources
    // -------------------------------------------------------------------------

    /// Create a volume from a template already present on the destination
    /// side; the agent owning the destination pool does the work.
    pub async fn clone_volume(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Result<Answer, MotionError> {
        let settings = self.settings();
        let endpoint = self.selector.select_for_store(dest.store()).await;
        let command = Command::Copy(CopyCommand::new(
            src.to_descriptor(),
            dest.to_descriptor(),
            0,
            settings.execute_in_sequence,
        ));
        self.execute(endpoint, &command).await
    }

    /// Copy a volume to a different primary pool.
    ///
    /// Returns `Ok(None)` when neither an image cache nor a filesystem image
    /// store is available to stage through.
    pub async fn copy_volume_between_pools(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Result<Option<Answer>, MotionError> {
        let settings = self.settings();
        // Both staging paths use the destination pool's zone
        let cache_store = match dest.store().scope.widen_to_zone() {
            Some(scope) => self.cache.get_cache_storage(&scope).await?,
            None => None,
        };

        let Some(cache_store) = cache_store else {
            return self
                .copy_volume_through_image_store(src, dest, settings.copy_volume_wait)
                .await;
        };

        let mut staged = StagedCache::new(Arc::clone(&self.cache));
        let cached = self.cache.create_cache_object_in(src, &cache_store).await?;
        staged.push(cached.clone());

        let endpoint = self.selector.select_for_copy(&cached, dest).await;
        let command = Command::Copy(CopyCommand::new(
            cached.to_descriptor(),
            dest.to_descriptor(),
            settings.copy_volume_wait,
            settings.execute_in_sequence,
        ));
        let result = self.execute(endpoint, &command).await;
        staged.settle(Disposition::Delete).await;
        result.map(Some)
    }

    async fn copy_volume_through_image_store(
        &self,
        src: &DataObject,
        dest: &DataObject,
        wait_secs: u64,
    ) -> Result<Option<Answer>, MotionError> {
        let Some(zone_id) = dest.store().zone_id() else {
            warn!(dest = %dest, "Destination pool has no zone, cannot stage volume");
            return Ok(None);
        };
        let image_store = self
            .db
            .list_data_stores(DataStoreRole::Image, zone_id)
            .await?
            .into_iter()
            .find(|s| s.protocol.is_filesystem());
        let Some(image_store) = image_store else {
            warn!(zone_id, "No NFS or CIFS image store in zone to stage volume");
            return Ok(None);
        };

        let mut record = self
            .db
            .create_store_record(NewStoreRecord::for_object(src, &image_store))
            .await?;
        let result = match object_in_store_machine(DataObjectType::Volume)
            .transition(
                &mut record,
                ObjectInStoreEvent::CreateOnlyRequested,
                None,
                self.db.as_ref(),
            )
            .await
        {
            Ok(true) => {
                self.copy_via_staged_record(src, dest, &image_store, &mut record, wait_secs)
                    .await
            }
            Ok(false) => Err(MotionError::Transition(src.to_string())),
            Err(e) => Err(e.into()),
        };

        let staged = src.placed_in(&image_store, record.install_path.clone());
        if let Err(e) = destroy_object(self.db.as_ref(), self.selector.as_ref(), &staged).await {
            warn!(object = %staged, error = %e, "Failed to remove staged volume");
            metrics::record_cache_cleanup_failure();
        }

        result.map(Some)
    }

    /// Both hops of a copy through an image store, driving the staged
    /// record: Created, Ready after the first hop, Copying during the
    /// second.
    async fn copy_via_staged_record(
        &self,
        src: &DataObject,
        dest: &DataObject,
        image_store: &DataStore,
        record: &mut StoreRecord,
        wait_secs: u64,
    ) -> Result<Answer, MotionError> {
        let machine = object_in_store_machine(DataObjectType::Volume);
        let db = self.db.as_ref();
        let staged = src.placed_in(image_store, None);

        let first = match self.copy_object_with_wait(src, &staged, wait_secs).await {
            Ok(answer) => answer,
            Err(e) => {
                machine
                    .transition(record, ObjectInStoreEvent::OperationFailed, None, db)
                    .await?;
                return Err(e);
            }
        };
        if !first.result {
            machine
                .transition(record, ObjectInStoreEvent::OperationFailed, None, db)
                .await?;
            return Ok(first);
        }

        let payload = TransitionPayload::from_answer(&first);
        if !machine
            .transition(
                record,
                ObjectInStoreEvent::OperationSucceeded,
                Some(&payload),
                db,
            )
            .await?
            || !machine
                .transition(record, ObjectInStoreEvent::CopyingRequested, None, db)
                .await?
        {
            return Err(MotionError::Transition(staged.to_string()));
        }

        let staged = src.placed_in(image_store, record.install_path.clone());
        let second = self.copy_object_with_wait(&staged, dest, wait_secs).await;
        let event = match &second {
            Ok(answer) if answer.result => ObjectInStoreEvent::OperationSucceeded,
            _ => ObjectInStoreEvent::OperationFailed,
        };
        machine.transition(record, event, None, db).await?;
        second
    }

    /// Move a volume to another primary pool in place.
    ///
    /// Unlike the copy procedures, a failed answer is an error here: the
    /// volume's location is only updated after the agent confirms the move.
    pub async fn migrate_volume_to_pool(
        &self,
        src: &VolumeObject,
        dest: &VolumeObject,
    ) -> Result<Answer, MotionError> {
        let settings = self.settings();
        let endpoint = self
            .selector
            .select_for_store(&src.store)
            .await
            .ok_or_else(|| MotionError::NoEndpoint(format!("pool {}", src.store.id)))?;
        let volume = self
            .db
            .find_volume(src.volume_id)
            .await?
            .ok_or_else(|| MotionError::NotFound(format!("volume {}", src.volume_id)))?;

        let command = Command::MigrateVolume(MigrateVolumeCommand {
            volume_id: src.volume_id,
            volume_path: src
                .path
                .clone()
                .or_else(|| volume.path.clone())
                .unwrap_or_default(),
            pool: dest.store.to_descriptor(),
            wait_secs: settings.copy_volume_wait,
            execute_in_sequence: settings.execute_in_sequence,
        });

        let answer = endpoint.send_message(&command).await?;
        if !answer.result {
            return Err(MotionError::Remote {
                command: command.name(),
                details: answer.details_or_default().to_string(),
            });
        }

        let location = VolumeLocation {
            path: answer
                .volume_path()
                .map(str::to_string)
                .or_else(|| volume.path.clone()),
            folder: dest.store.path.clone(),
            pod_id: dest.store.pod_id,
            pool_id: dest.store.id,
            last_pool_id: volume.pool_id.or(Some(src.store.id)),
        };
        self.db
            .update_volume_location(src.volume_id, &location)
            .await?;

        info!(
            volume_id = src.volume_id,
            from_pool = ?location.last_pool_id,
            to_pool = location.pool_id,
            path = ?location.path,
            "Migrated volume to pool"
        );
        Ok(answer)
    }
}
