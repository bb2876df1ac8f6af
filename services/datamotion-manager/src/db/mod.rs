// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Persistence layer
//!
//! Every table the data motion layer touches is reached through one of the
//! DAO traits below. [`postgres::Database`] implements them on PostgreSQL;
//! [`memory::MemoryDatabase`] keeps everything in process and is what the
//! tests run against.
//!
//! State columns are never written directly: transitions go through
//! [`crate::fsm::TransitionStore`], whose implementations issue a conditional
//! update on `(id, state, updated_count)`.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use datamotion_types::{DataObjectType, DataStoreRole};
use thiserror::Error;

use crate::fsm::TransitionStore;
use crate::model::{
    DataStore, DownloadState, Host, HostFilter, SnapshotObject, StoragePoolStatus, StoreRecord,
    NewStoreRecord, VmInstance, VolumeLocation, VolumeRecord, WorkItem,
};

pub use memory::MemoryDatabase;
pub use postgres::Database;

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Invalid value {value:?} in column {column}")]
    Decode { column: &'static str, value: String },
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Query(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for StoreError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        StoreError::Connection(e.to_string())
    }
}

/// Data stores: primary pools, image stores and image caches.
#[async_trait]
pub trait DataStoreDao: Send + Sync {
    async fn find_data_store(&self, id: i64) -> Result<Option<DataStore>, StoreError>;

    /// Stores with the given role in a zone.
    async fn list_data_stores(
        &self,
        role: DataStoreRole,
        zone_id: i64,
    ) -> Result<Vec<DataStore>, StoreError>;

    /// Primary pools in a zone with the given status.
    async fn list_pools_by_status(
        &self,
        zone_id: i64,
        status: StoragePoolStatus,
    ) -> Result<Vec<DataStore>, StoreError>;

    async fn update_pool_status(
        &self,
        pool_id: i64,
        status: StoragePoolStatus,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait HostDao: Send + Sync {
    async fn find_host(&self, id: i64) -> Result<Option<Host>, StoreError>;

    async fn list_up_hosts(&self, filter: HostFilter) -> Result<Vec<Host>, StoreError>;
}

/// Volume-, snapshot- and template-in-store records, one table per kind.
#[async_trait]
pub trait ObjectInStoreDao: TransitionStore<StoreRecord> {
    /// Insert a record in the `Allocated` state.
    async fn create_store_record(&self, new: NewStoreRecord) -> Result<StoreRecord, StoreError>;

    async fn find_store_record(
        &self,
        kind: DataObjectType,
        id: i64,
    ) -> Result<Option<StoreRecord>, StoreError>;

    /// The live (non-destroyed) record placing `object_id` in a store.
    async fn find_by_store_object(
        &self,
        kind: DataObjectType,
        store_id: i64,
        role: DataStoreRole,
        object_id: i64,
    ) -> Result<Option<StoreRecord>, StoreError>;

    /// Live records in a store.
    async fn list_by_store(
        &self,
        kind: DataObjectType,
        store_id: i64,
        role: DataStoreRole,
    ) -> Result<Vec<StoreRecord>, StoreError>;

    /// Destroyed records still present in a store, for garbage collection.
    async fn list_destroyed(
        &self,
        kind: DataObjectType,
        store_id: i64,
    ) -> Result<Vec<StoreRecord>, StoreError>;

    /// Hard-delete every primary record of a store being decommissioned.
    async fn delete_primary_records_for_store(
        &self,
        kind: DataObjectType,
        store_id: i64,
    ) -> Result<u64, StoreError>;

    /// Transfer bookkeeping that does not change lifecycle state.
    async fn update_download_state(
        &self,
        kind: DataObjectType,
        id: i64,
        state: DownloadState,
        pct: Option<i32>,
    ) -> Result<(), StoreError>;

    /// Add `delta` to the record's reference count, never going below zero.
    /// Returns the new count.
    async fn adjust_ref_count(
        &self,
        kind: DataObjectType,
        id: i64,
        delta: i64,
    ) -> Result<i64, StoreError>;

    /// The record of the snapshot `record` is a delta against, in the same
    /// store.
    async fn find_parent(&self, record: &StoreRecord) -> Result<Option<StoreRecord>, StoreError> {
        match record.parent_snapshot_id {
            Some(parent_id) if record.kind == DataObjectType::Snapshot => {
                self.find_by_store_object(
                    DataObjectType::Snapshot,
                    record.store_id,
                    record.store_role,
                    parent_id,
                )
                .await
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
pub trait VolumeDao: TransitionStore<VolumeRecord> {
    async fn find_volume(&self, id: i64) -> Result<Option<VolumeRecord>, StoreError>;

    async fn list_volumes_by_pool(&self, pool_id: i64) -> Result<Vec<VolumeRecord>, StoreError>;

    /// Volume-in-store records whose volume is `NotUploaded` or
    /// `UploadInProgress`.
    async fn list_pending_uploads(&self) -> Result<Vec<StoreRecord>, StoreError>;

    async fn update_volume_location(
        &self,
        volume_id: i64,
        location: &VolumeLocation,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait VmInstanceDao: Send + Sync {
    async fn find_vm(&self, id: i64) -> Result<Option<VmInstance>, StoreError>;
}

/// Work items recording workloads stopped for pool maintenance.
#[async_trait]
pub trait StoragePoolWorkDao: Send + Sync {
    async fn find_work(&self, pool_id: i64, vm_id: i64) -> Result<Option<WorkItem>, StoreError>;

    async fn create_work(
        &self,
        pool_id: i64,
        vm_id: i64,
        management_server_id: i64,
    ) -> Result<WorkItem, StoreError>;

    async fn update_work(&self, item: &WorkItem) -> Result<(), StoreError>;

    /// Items owned by this node whose workload has not been stopped yet.
    async fn list_pending_for_prepare(
        &self,
        pool_id: i64,
        management_server_id: i64,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Items owned by this node whose workload was stopped and not restarted.
    async fn list_pending_for_cancel(
        &self,
        pool_id: i64,
        management_server_id: i64,
    ) -> Result<Vec<WorkItem>, StoreError>;
}

/// Everything the data motion layer needs from the database.
pub trait Persistence:
    DataStoreDao + HostDao + ObjectInStoreDao + VolumeDao + VmInstanceDao + StoragePoolWorkDao
{
}

impl<T> Persistence for T where
    T: DataStoreDao + HostDao + ObjectInStoreDao + VolumeDao + VmInstanceDao + StoragePoolWorkDao
{
}

/// Load a snapshot placed in `store` together with its backing chain.
pub async fn load_snapshot_chain(
    db: &dyn Persistence,
    store: &DataStore,
    snapshot_id: i64,
) -> Result<SnapshotObject, StoreError> {
    let leaf = db
        .find_by_store_object(DataObjectType::Snapshot, store.id, store.role, snapshot_id)
        .await?
        .ok_or_else(|| {
            StoreError::NotFound(format!("snapshot {} in store {}", snapshot_id, store.id))
        })?;

    let mut records = vec![leaf];
    while let Some(current) = records.last() {
        let Some(parent) = db.find_parent(current).await? else {
            break;
        };
        if records.iter().any(|r| r.object_id == parent.object_id) {
            tracing::warn!(
                snapshot_id,
                store_id = store.id,
                parent_id = parent.object_id,
                "Snapshot chain loops back on itself, truncating"
            );
            break;
        }
        records.push(parent);
    }

    let mut chain: Option<SnapshotObject> = None;
    for record in records.into_iter().rev() {
        chain = Some(SnapshotObject {
            snapshot_id: record.object_id,
            path: record.install_path,
            size: Some(record.size),
            store: store.clone(),
            parent: chain.map(Box::new),
        });
    }
    chain.ok_or_else(|| StoreError::NotFound(format!("snapshot {}", snapshot_id)))
}
