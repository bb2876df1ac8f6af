// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Domain model: data stores, the objects placed in them, and the records
//! that track each placement.

use std::fmt;

use chrono::{DateTime, Utc};
use datamotion_types::{
    DataObjectType, DataStoreRole, DataStoreTO, DataTO, Scope, StoreProtocol,
};
use serde::Serialize;
use strum::{Display, EnumIter, EnumString};

// ============================================================================
// Data Stores
// ============================================================================

/// Lifecycle of a primary storage pool as seen by maintenance automation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum StoragePoolStatus {
    Up,
    PrepareForMaintenance,
    Maintenance,
    ErrorInMaintenance,
    Disabled,
}

/// A data store: primary pool, image store, or image cache.
#[derive(Debug, Clone, PartialEq)]
pub struct DataStore {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub role: DataStoreRole,
    pub protocol: StoreProtocol,
    pub url: String,
    /// Mount path on the hypervisor, for primary pools
    pub path: Option<String>,
    pub scope: Scope,
    pub pod_id: Option<i64>,
    pub status: StoragePoolStatus,
}

impl DataStore {
    pub fn to_descriptor(&self) -> DataStoreTO {
        DataStoreTO {
            id: self.id,
            uuid: self.uuid.clone(),
            role: self.role,
            protocol: self.protocol,
            url: self.url.clone(),
            path: self.path.clone(),
        }
    }

    pub fn is_nfs_backed(&self) -> bool {
        self.protocol == StoreProtocol::Nfs
    }

    pub fn is_image_cache(&self) -> bool {
        self.role == DataStoreRole::ImageCache
    }

    pub fn zone_id(&self) -> Option<i64> {
        self.scope.zone_id()
    }
}

// ============================================================================
// Data Objects
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeObject {
    pub volume_id: i64,
    pub name: String,
    pub path: Option<String>,
    pub size: Option<i64>,
    pub store: DataStore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotObject {
    pub snapshot_id: i64,
    pub path: Option<String>,
    pub size: Option<i64>,
    pub store: DataStore,
    /// The snapshot this one is a delta against, if any
    pub parent: Option<Box<SnapshotObject>>,
}

impl SnapshotObject {
    /// The backing chain of this snapshot, oldest ancestor first and this
    /// snapshot last.
    pub fn chain_oldest_first(&self) -> Vec<&SnapshotObject> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(snapshot) = current {
            chain.push(snapshot);
            current = snapshot.parent.as_deref();
        }
        chain.reverse();
        chain
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemplateObject {
    pub template_id: i64,
    pub name: String,
    pub path: Option<String>,
    pub size: Option<i64>,
    pub store: DataStore,
}

/// A volume, snapshot, or template in a particular data store.
#[derive(Debug, Clone, PartialEq)]
pub enum DataObject {
    Volume(VolumeObject),
    Snapshot(SnapshotObject),
    Template(TemplateObject),
}

impl DataObject {
    pub fn object_type(&self) -> DataObjectType {
        match self {
            DataObject::Volume(_) => DataObjectType::Volume,
            DataObject::Snapshot(_) => DataObjectType::Snapshot,
            DataObject::Template(_) => DataObjectType::Template,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            DataObject::Volume(v) => v.volume_id,
            DataObject::Snapshot(s) => s.snapshot_id,
            DataObject::Template(t) => t.template_id,
        }
    }

    pub fn store(&self) -> &DataStore {
        match self {
            DataObject::Volume(v) => &v.store,
            DataObject::Snapshot(s) => &s.store,
            DataObject::Template(t) => &t.store,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            DataObject::Volume(v) => v.path.as_deref(),
            DataObject::Snapshot(s) => s.path.as_deref(),
            DataObject::Template(t) => t.path.as_deref(),
        }
    }

    pub fn size(&self) -> Option<i64> {
        match self {
            DataObject::Volume(v) => v.size,
            DataObject::Snapshot(s) => s.size,
            DataObject::Template(t) => t.size,
        }
    }

    /// The same logical object placed in another store.
    ///
    /// Snapshot parents are not carried over; chains are rebuilt by whoever
    /// stages them.
    pub fn placed_in(&self, store: &DataStore, path: Option<String>) -> DataObject {
        match self {
            DataObject::Volume(v) => DataObject::Volume(VolumeObject {
                path,
                store: store.clone(),
                ..v.clone()
            }),
            DataObject::Snapshot(s) => DataObject::Snapshot(SnapshotObject {
                snapshot_id: s.snapshot_id,
                path,
                size: s.size,
                store: store.clone(),
                parent: None,
            }),
            DataObject::Template(t) => DataObject::Template(TemplateObject {
                path,
                store: store.clone(),
                ..t.clone()
            }),
        }
    }

    pub fn to_descriptor(&self) -> DataTO {
        let (name, parent_path) = match self {
            DataObject::Volume(v) => (Some(v.name.clone()), None),
            DataObject::Snapshot(s) => (
                None,
                s.parent.as_ref().and_then(|p| p.path.clone()),
            ),
            DataObject::Template(t) => (Some(t.name.clone()), None),
        };
        DataTO {
            object_type: self.object_type(),
            id: self.id(),
            name,
            path: self.path().map(str::to_string),
            size: self.size(),
            parent_path,
            store: self.store().to_descriptor(),
        }
    }
}

impl fmt::Display for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} on {} store {}",
            self.object_type(),
            self.id(),
            self.store().role,
            self.store().id
        )
    }
}

// ============================================================================
// Association Records
// ============================================================================

/// Lifecycle of an object placed in a store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum ObjectInStoreState {
    Allocated,
    Creating,
    Created,
    Ready,
    Copying,
    Migrating,
    Destroying,
    Destroyed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum ObjectInStoreEvent {
    CreateRequested,
    CreateOnlyRequested,
    CopyingRequested,
    MigrationRequested,
    OperationSucceeded,
    OperationFailed,
    OperationTimeout,
    DestroyRequested,
}

/// Transfer bookkeeping for uploads and downloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum DownloadState {
    NotDownloaded,
    DownloadInProgress,
    Downloaded,
    DownloadError,
    NotUploaded,
    UploadInProgress,
    Uploaded,
    UploadError,
    Abandoned,
}

/// One volume, snapshot, or template placed in one store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub id: i64,
    pub kind: DataObjectType,
    pub object_id: i64,
    pub store_id: i64,
    pub store_role: DataStoreRole,
    pub state: ObjectInStoreState,
    pub destroyed: bool,
    pub updated_count: i64,
    pub updated: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub zone_id: Option<i64>,
    pub download_state: Option<DownloadState>,
    pub download_pct: i32,
    pub install_path: Option<String>,
    pub size: i64,
    pub physical_size: i64,
    pub ref_cnt: i64,
    pub extract_url: Option<String>,
    pub error_str: Option<String>,
    /// Snapshot records only
    pub parent_snapshot_id: Option<i64>,
}

impl StoreRecord {
    /// Whether reaching `next` also flips the `destroyed` flag.
    ///
    /// Snapshot records keep their flag so that the chain can still be walked
    /// for retention bookkeeping.
    pub fn marks_destroyed_on(&self, next: ObjectInStoreState) -> bool {
        next == ObjectInStoreState::Destroyed && self.kind != DataObjectType::Snapshot
    }
}

/// Fields needed to place an object in a store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStoreRecord {
    pub kind: DataObjectType,
    pub object_id: i64,
    pub store_id: i64,
    pub store_role: DataStoreRole,
    pub zone_id: Option<i64>,
    pub install_path: Option<String>,
    pub size: i64,
    pub parent_snapshot_id: Option<i64>,
    pub download_state: Option<DownloadState>,
}

impl NewStoreRecord {
    pub fn new(kind: DataObjectType, object_id: i64, store: &DataStore) -> Self {
        Self {
            kind,
            object_id,
            store_id: store.id,
            store_role: store.role,
            zone_id: store.zone_id(),
            install_path: None,
            size: 0,
            parent_snapshot_id: None,
            download_state: None,
        }
    }

    /// Record for `object` placed in `store`.
    pub fn for_object(object: &DataObject, store: &DataStore) -> Self {
        let mut record = Self::new(object.object_type(), object.id(), store);
        record.size = object.size().unwrap_or(0);
        if let DataObject::Snapshot(s) = object {
            record.parent_snapshot_id = s.parent.as_ref().map(|p| p.snapshot_id);
        }
        record
    }
}

// ============================================================================
// Volumes
// ============================================================================

/// Lifecycle of the volume itself, independent of where it is placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum VolumeState {
    Allocated,
    Ready,
    NotUploaded,
    UploadInProgress,
    Uploaded,
    UploadError,
    UploadAbandoned,
    Destroy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum VolumeEvent {
    UploadRequested,
    OperationSucceeded,
    OperationFailed,
    OperationTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeRecord {
    pub id: i64,
    pub name: String,
    pub state: VolumeState,
    pub updated_count: i64,
    pub updated: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub pool_id: Option<i64>,
    pub last_pool_id: Option<i64>,
    pub path: Option<String>,
    pub folder: Option<String>,
    pub pod_id: Option<i64>,
    pub size: i64,
    pub vm_id: Option<i64>,
    pub zone_id: i64,
}

/// Where a volume lives after a pool migration.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeLocation {
    pub path: Option<String>,
    pub folder: Option<String>,
    pub pod_id: Option<i64>,
    pub pool_id: i64,
    pub last_pool_id: Option<i64>,
}

// ============================================================================
// Hosts and Workloads
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum HostStatus {
    Up,
    Down,
    Disconnected,
    Maintenance,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub id: i64,
    pub name: String,
    /// Address the host's agent listens on
    pub address: String,
    pub cluster_id: Option<i64>,
    pub zone_id: i64,
    pub status: HostStatus,
    /// Management server that currently owns the host's agent connection
    pub management_server_id: Option<i64>,
}

/// Which hosts to consider when looking for Up hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostFilter {
    Host(i64),
    Cluster(i64),
    Zone(i64),
}

impl HostFilter {
    /// Hosts able to reach a store of the given scope.
    pub fn for_scope(scope: &Scope) -> Option<Self> {
        match scope {
            Scope::Host { host_id, .. } => Some(HostFilter::Host(*host_id)),
            Scope::Cluster { cluster_id, .. } => Some(HostFilter::Cluster(*cluster_id)),
            Scope::Zone { zone_id } => zone_id.map(HostFilter::Zone),
            Scope::Region { .. } => None,
        }
    }

    pub fn matches(&self, host: &Host) -> bool {
        match self {
            HostFilter::Host(id) => host.id == *id,
            HostFilter::Cluster(id) => host.cluster_id == Some(*id),
            HostFilter::Zone(id) => host.zone_id == *id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    User,
    ConsoleProxy,
    SecondaryStorageVm,
    DomainRouter,
}

impl VmType {
    /// System VMs and routers are brought back on another pool once drained;
    /// user VMs stay stopped until their owner starts them.
    pub fn restarts_after_drain(self) -> bool {
        !matches!(self, VmType::User)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display, EnumString)]
pub enum VmState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Error,
    Destroyed,
}

impl VmState {
    /// Whether a VM in this state holds its volumes open.
    pub fn holds_volumes(self) -> bool {
        matches!(self, VmState::Running | VmState::Starting | VmState::Stopping)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmInstance {
    pub id: i64,
    pub name: String,
    pub vm_type: VmType,
    pub state: VmState,
    pub host_id: Option<i64>,
}

/// A workload stopped so that its pool could enter maintenance.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: i64,
    pub vm_id: i64,
    pub pool_id: i64,
    pub stopped_for_maintenance: bool,
    pub started_after_maintenance: bool,
    pub management_server_id: i64,
}
