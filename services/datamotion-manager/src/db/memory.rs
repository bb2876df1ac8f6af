// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-memory database
//!
//! Implements the same DAO traits as the PostgreSQL layer, with the same
//! conditional-update semantics for state transitions. Used by the tests and
//! handy for running the manager without a database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datamotion_types::{DataObjectType, DataStoreRole};

use super::{
    DataStoreDao, HostDao, ObjectInStoreDao, StoragePoolWorkDao, StoreError, VmInstanceDao,
    VolumeDao,
};
use crate::fsm::{Stateful, TransitionPayload, TransitionStore};
use crate::model::{
    DataStore, DownloadState, Host, HostFilter, HostStatus, NewStoreRecord, ObjectInStoreState,
    StoragePoolStatus, StoreRecord, VmInstance, VolumeLocation, VolumeRecord, VolumeState,
    WorkItem,
};

/// First id handed out for rows created through the DAO traits. Rows seeded
/// by tests use small ids and never collide.
const FIRST_GENERATED_ID: i64 = 10_000;

#[derive(Default)]
struct Tables {
    next_id: i64,
    data_stores: BTreeMap<i64, DataStore>,
    hosts: BTreeMap<i64, Host>,
    volumes: BTreeMap<i64, VolumeRecord>,
    vms: BTreeMap<i64, VmInstance>,
    store_refs: HashMap<DataObjectType, BTreeMap<i64, StoreRecord>>,
    work: BTreeMap<i64, WorkItem>,
    raced_creates: HashSet<DataObjectType>,
    download_updates_offline: bool,
}

impl Tables {
    fn generate_id(&mut self) -> i64 {
        if self.next_id < FIRST_GENERATED_ID {
            self.next_id = FIRST_GENERATED_ID;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn refs(&mut self, kind: DataObjectType) -> &mut BTreeMap<i64, StoreRecord> {
        self.store_refs.entry(kind).or_default()
    }
}

/// In-memory implementation of every DAO trait.
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -------------------------------------------------------------------------
    // Setup and inspection helpers
    // -------------------------------------------------------------------------

    pub fn insert_data_store(&self, store: DataStore) {
        self.tables().data_stores.insert(store.id, store);
    }

    pub fn insert_host(&self, host: Host) {
        self.tables().hosts.insert(host.id, host);
    }

    pub fn insert_volume(&self, volume: VolumeRecord) {
        self.tables().volumes.insert(volume.id, volume);
    }

    pub fn insert_vm(&self, vm: VmInstance) {
        self.tables().vms.insert(vm.id, vm);
    }

    pub fn remove_vm(&self, vm_id: i64) {
        self.tables().vms.remove(&vm_id);
    }

    pub fn insert_store_record(&self, record: StoreRecord) {
        self.tables().refs(record.kind).insert(record.id, record);
    }

    /// Overwrite a record's state without going through a transition.
    pub fn force_store_state(&self, kind: DataObjectType, id: i64, state: ObjectInStoreState) {
        if let Some(record) = self.tables().refs(kind).get_mut(&id) {
            record.state = state;
        }
    }

    /// Every record of a kind, destroyed ones included.
    pub fn store_records(&self, kind: DataObjectType) -> Vec<StoreRecord> {
        self.tables().refs(kind).values().cloned().collect()
    }

    /// Have a concurrent writer touch the next `kind` record created through
    /// the DAO, so the creator's first transition loses.
    pub fn race_next_create(&self, kind: DataObjectType) {
        self.tables().raced_creates.insert(kind);
    }

    /// Make standalone download-state updates fail as if the connection
    /// dropped. Updates carried by a volume transition still apply.
    pub fn fail_download_updates(&self) {
        self.tables().download_updates_offline = true;
    }

    pub fn work_items(&self) -> Vec<WorkItem> {
        self.tables().work.values().cloned().collect()
    }

    pub fn pool_status(&self, pool_id: i64) -> Option<StoragePoolStatus> {
        self.tables().data_stores.get(&pool_id).map(|s| s.status)
    }
}

#[async_trait]
impl DataStoreDao for MemoryDatabase {
    async fn find_data_store(&self, id: i64) -> Result<Option<DataStore>, StoreError> {
        Ok(self.tables().data_stores.get(&id).cloned())
    }

    async fn list_data_stores(
        &self,
        role: DataStoreRole,
        zone_id: i64,
    ) -> Result<Vec<DataStore>, StoreError> {
        Ok(self
            .tables()
            .data_stores
            .values()
            .filter(|s| s.role == role && s.zone_id() == Some(zone_id))
            .cloned()
            .collect())
    }

    async fn list_pools_by_status(
        &self,
        zone_id: i64,
        status: StoragePoolStatus,
    ) -> Result<Vec<DataStore>, StoreError> {
        Ok(self
            .tables()
            .data_stores
            .values()
            .filter(|s| {
                s.role == DataStoreRole::Primary
                    && s.zone_id() == Some(zone_id)
                    && s.status == status
            })
            .cloned()
            .collect())
    }

    async fn update_pool_status(
        &self,
        pool_id: i64,
        status: StoragePoolStatus,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let pool = tables
            .data_stores
            .get_mut(&pool_id)
            .ok_or_else(|| StoreError::NotFound(format!("storage pool {}", pool_id)))?;
        pool.status = status;
        Ok(())
    }
}

#[async_trait]
impl HostDao for MemoryDatabase {
    async fn find_host(&self, id: i64) -> Result<Option<Host>, StoreError> {
        Ok(self.tables().hosts.get(&id).cloned())
    }

    async fn list_up_hosts(&self, filter: HostFilter) -> Result<Vec<Host>, StoreError> {
        Ok(self
            .tables()
            .hosts
            .values()
            .filter(|h| h.status == HostStatus::Up && filter.matches(h))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TransitionStore<StoreRecord> for MemoryDatabase {
    async fn update_state(
        &self,
        record: &StoreRecord,
        next: ObjectInStoreState,
        at: DateTime<Utc>,
        payload: Option<&TransitionPayload>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        let Some(stored) = tables.refs(record.kind).get_mut(&record.id) else {
            return Ok(false);
        };
        if stored.state != record.state || stored.updated_count != record.updated_count {
            return Ok(false);
        }
        stored.apply_transition(next, at, payload);
        Ok(true)
    }
}

#[async_trait]
impl ObjectInStoreDao for MemoryDatabase {
    async fn create_store_record(&self, new: NewStoreRecord) -> Result<StoreRecord, StoreError> {
        let mut tables = self.tables();
        let record = StoreRecord {
            id: tables.generate_id(),
            kind: new.kind,
            object_id: new.object_id,
            store_id: new.store_id,
            store_role: new.store_role,
            state: ObjectInStoreState::Allocated,
            destroyed: false,
            updated_count: 0,
            updated: None,
            created: Utc::now(),
            zone_id: new.zone_id,
            download_state: new.download_state,
            download_pct: 0,
            install_path: new.install_path,
            size: new.size,
            physical_size: 0,
            ref_cnt: 0,
            extract_url: None,
            error_str: None,
            parent_snapshot_id: new.parent_snapshot_id,
        };
        let mut stored = record.clone();
        if tables.raced_creates.remove(&record.kind) {
            stored.updated_count += 1;
        }
        tables.refs(record.kind).insert(record.id, stored);
        Ok(record)
    }

    async fn find_store_record(
        &self,
        kind: DataObjectType,
        id: i64,
    ) -> Result<Option<StoreRecord>, StoreError> {
        Ok(self.tables().refs(kind).get(&id).cloned())
    }

    async fn find_by_store_object(
        &self,
        kind: DataObjectType,
        store_id: i64,
        role: DataStoreRole,
        object_id: i64,
    ) -> Result<Option<StoreRecord>, StoreError> {
        Ok(self
            .tables()
            .refs(kind)
            .values()
            .find(|r| {
                r.store_id == store_id
                    && r.store_role == role
                    && r.object_id == object_id
                    && !r.destroyed
                    && r.state != ObjectInStoreState::Destroyed
            })
            .cloned())
    }

    async fn list_by_store(
        &self,
        kind: DataObjectType,
        store_id: i64,
        role: DataStoreRole,
    ) -> Result<Vec<StoreRecord>, StoreError> {
        Ok(self
            .tables()
            .refs(kind)
            .values()
            .filter(|r| r.store_id == store_id && r.store_role == role && !r.destroyed)
            .cloned()
            .collect())
    }

    async fn list_destroyed(
        &self,
        kind: DataObjectType,
        store_id: i64,
    ) -> Result<Vec<StoreRecord>, StoreError> {
        Ok(self
            .tables()
            .refs(kind)
            .values()
            .filter(|r| r.store_id == store_id && r.destroyed)
            .cloned()
            .collect())
    }

    async fn delete_primary_records_for_store(
        &self,
        kind: DataObjectType,
        store_id: i64,
    ) -> Result<u64, StoreError> {
        let mut tables = self.tables();
        let refs = tables.refs(kind);
        let before = refs.len();
        refs.retain(|_, r| !(r.store_id == store_id && r.store_role == DataStoreRole::Primary));
        Ok((before - refs.len()) as u64)
    }

    async fn update_download_state(
        &self,
        kind: DataObjectType,
        id: i64,
        state: DownloadState,
        pct: Option<i32>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables();
        if tables.download_updates_offline {
            return Err(StoreError::Connection("download state update refused".to_string()));
        }
        let record = tables
            .refs(kind)
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{} store record {}", kind, id)))?;
        record.download_state = Some(state);
        if let Some(pct) = pct {
            record.download_pct = pct;
        }
        Ok(())
    }

    async fn adjust_ref_count(
        &self,
        kind: DataObjectType,
        id: i64,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut tables = self.tables();
        let record = tables
            .refs(kind)
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{} store record {}", kind, id)))?;
        record.ref_cnt = (record.ref_cnt + delta).max(0);
        Ok(record.ref_cnt)
    }
}

#[async_trait]
impl TransitionStore<VolumeRecord> for MemoryDatabase {
    async fn update_state(
        &self,
        record: &VolumeRecord,
        next: VolumeState,
        at: DateTime<Utc>,
        payload: Option<&TransitionPayload>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables();
        let Some(stored) = tables.volumes.get_mut(&record.id) else {
            return Ok(false);
        };
        if stored.state != record.state || stored.updated_count != record.updated_count {
            return Ok(false);
        }
        stored.apply_transition(next, at, payload);

        if let Some(payload) = payload
            && let Some(download) = &payload.download
            && let Some(store_ref) = tables
                .refs(DataObjectType::Volume)
                .get_mut(&download.record_id)
        {
            store_ref.download_state = Some(download.state);
            if let Some(pct) = download.pct {
                store_ref.download_pct = pct;
            }
            if let Some(error) = &download.error {
                store_ref.error_str = Some(error.clone());
            }
            if let Some(path) = &payload.install_path {
                store_ref.install_path = Some(path.clone());
            }
            if let Some(size) = payload.size {
                store_ref.size = size;
            }
            if let Some(physical_size) = payload.physical_size {
                store_ref.physical_size = physical_size;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl VolumeDao for MemoryDatabase {
    async fn find_volume(&self, id: i64) -> Result<Option<VolumeRecord>, StoreError> {
        Ok(self.tables().volumes.get(&id).cloned())
    }

    async fn list_volumes_by_pool(&self, pool_id: i64) -> Result<Vec<VolumeRecord>, StoreError> {
        Ok(self
            .tables()
            .volumes
            .values()
            .filter(|v| v.pool_id == Some(pool_id))
            .cloned()
            .collect())
    }

    async fn list_pending_uploads(&self) -> Result<Vec<StoreRecord>, StoreError> {
        let mut tables = self.tables();
        let pending: Vec<i64> = tables
            .volumes
            .values()
            .filter(|v| {
                matches!(
                    v.state,
                    VolumeState::NotUploaded | VolumeState::UploadInProgress
                )
            })
            .map(|v| v.id)
            .collect();
        Ok(tables
            .refs(DataObjectType::Volume)
            .values()
            .filter(|r| !r.destroyed && pending.contains(&r.object_id))
            .cloned()
            .collect())
    }

    async fn update_volume_location(
        &self,
        volume_id: i64,
        location: &VolumeLocation,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let volume = tables
            .volumes
            .get_mut(&volume_id)
            .ok_or_else(|| StoreError::NotFound(format!("volume {}", volume_id)))?;
        volume.path = location.path.clone();
        volume.folder = location.folder.clone();
        volume.pod_id = location.pod_id;
        volume.pool_id = Some(location.pool_id);
        volume.last_pool_id = location.last_pool_id;
        Ok(())
    }
}

#[async_trait]
impl VmInstanceDao for MemoryDatabase {
    async fn find_vm(&self, id: i64) -> Result<Option<VmInstance>, StoreError> {
        Ok(self.tables().vms.get(&id).cloned())
    }
}

#[async_trait]
impl StoragePoolWorkDao for MemoryDatabase {
    async fn find_work(&self, pool_id: i64, vm_id: i64) -> Result<Option<WorkItem>, StoreError> {
        Ok(self
            .tables()
            .work
            .values()
            .find(|w| w.pool_id == pool_id && w.vm_id == vm_id)
            .cloned())
    }

    async fn create_work(
        &self,
        pool_id: i64,
        vm_id: i64,
        management_server_id: i64,
    ) -> Result<WorkItem, StoreError> {
        let mut tables = self.tables();
        let item = WorkItem {
            id: tables.generate_id(),
            vm_id,
            pool_id,
            stopped_for_maintenance: false,
            started_after_maintenance: false,
            management_server_id,
        };
        tables.work.insert(item.id, item.clone());
        Ok(item)
    }

    async fn update_work(&self, item: &WorkItem) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let stored = tables
            .work
            .get_mut(&item.id)
            .ok_or_else(|| StoreError::NotFound(format!("work item {}", item.id)))?;
        *stored = item.clone();
        Ok(())
    }

    async fn list_pending_for_prepare(
        &self,
        pool_id: i64,
        management_server_id: i64,
    ) -> Result<Vec<WorkItem>, StoreError> {
        Ok(self
            .tables()
            .work
            .values()
            .filter(|w| {
                w.pool_id == pool_id
                    && w.management_server_id == management_server_id
                    && !w.stopped_for_maintenance
            })
            .cloned()
            .collect())
    }

    async fn list_pending_for_cancel(
        &self,
        pool_id: i64,
        management_server_id: i64,
    ) -> Result<Vec<WorkItem>, StoreError> {
        Ok(self
            .tables()
            .work
            .values()
            .filter(|w| {
                w.pool_id == pool_id
                    && w.management_server_id == management_server_id
                    && w.stopped_for_maintenance
                    && !w.started_after_maintenance
            })
            .cloned()
            .collect())
    }
}
