// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared fixtures for the integration tests: seeded rows for the in-memory
//! database and scripted stand-ins for agents and the VM service.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datamotion_types::{
    Answer, AnswerPayload, Command, DataObjectType, DataStoreRole, Scope, StoreProtocol,
    UploadStatus,
};
use tokio::sync::watch;

use datamotion_manager::cache::{CacheManager, StorageCacheManager};
use datamotion_manager::config::MotionSettings;
use datamotion_manager::db::MemoryDatabase;
use datamotion_manager::endpoint::{Endpoint, EndpointError, EndpointSelector};
use datamotion_manager::model::{
    DataObject, DataStore, Host, HostStatus, ObjectInStoreState, StoragePoolStatus, StoreRecord,
    VmInstance, VmState, VmType, VolumeRecord, VolumeState,
};
use datamotion_manager::motion::DataMotionStrategy;
use datamotion_manager::workload::{WorkloadError, WorkloadManager};

// ============================================================================
// Rows
// ============================================================================

pub fn zone(zone_id: i64) -> Scope {
    Scope::Zone {
        zone_id: Some(zone_id),
    }
}

pub fn cluster(cluster_id: i64, zone_id: i64) -> Scope {
    Scope::Cluster {
        cluster_id,
        zone_id,
    }
}

pub fn store(id: i64, role: DataStoreRole, protocol: StoreProtocol, scope: Scope) -> DataStore {
    DataStore {
        id,
        uuid: format!("store-{}", id),
        name: format!("store-{}", id),
        role,
        protocol,
        url: format!("{}://10.0.0.{}/store", protocol, id),
        path: (role == DataStoreRole::Primary).then(|| format!("/mnt/pool-{}", id)),
        scope,
        pod_id: Some(1),
        status: StoragePoolStatus::Up,
    }
}

pub fn host(id: i64, cluster_id: i64, zone_id: i64, management_server_id: i64) -> Host {
    Host {
        id,
        name: format!("host-{}", id),
        address: format!("10.0.1.{}", id),
        cluster_id: Some(cluster_id),
        zone_id,
        status: HostStatus::Up,
        management_server_id: Some(management_server_id),
    }
}

pub fn volume_record(id: i64, pool_id: Option<i64>, state: VolumeState) -> VolumeRecord {
    VolumeRecord {
        id,
        name: format!("vol-{}", id),
        state,
        updated_count: 0,
        updated: None,
        created: Utc::now(),
        pool_id,
        last_pool_id: None,
        path: Some(format!("vol-{}", id)),
        folder: None,
        pod_id: Some(1),
        size: 1024,
        vm_id: None,
        zone_id: 1,
    }
}

pub fn vm(id: i64, vm_type: VmType, state: VmState) -> VmInstance {
    VmInstance {
        id,
        name: format!("vm-{}", id),
        vm_type,
        state,
        host_id: Some(1),
    }
}

/// A placement record as it would look after a completed copy.
pub fn store_record(
    id: i64,
    kind: DataObjectType,
    object_id: i64,
    store: &DataStore,
    state: ObjectInStoreState,
    created: DateTime<Utc>,
) -> StoreRecord {
    StoreRecord {
        id,
        kind,
        object_id,
        store_id: store.id,
        store_role: store.role,
        state,
        destroyed: false,
        updated_count: 0,
        updated: None,
        created,
        zone_id: store.zone_id(),
        download_state: None,
        download_pct: 0,
        install_path: Some(format!("{}/{}", kind, object_id)),
        size: 512,
        physical_size: 512,
        ref_cnt: 0,
        extract_url: None,
        error_str: None,
        parent_snapshot_id: None,
    }
}

// ============================================================================
// Scripted agent
// ============================================================================

/// What the agent should do with the next command of a given kind.
pub enum Reply {
    /// The agent's normal successful answer
    Default,
    Answer(Answer),
    /// The request never reaches the agent
    Transport(String),
}

/// Records every command sent to it and answers from a per-command script,
/// falling back to a successful answer.
#[derive(Default)]
pub struct FakeAgent {
    sent: Mutex<Vec<(i64, Command)>>,
    script: Mutex<HashMap<&'static str, VecDeque<Reply>>>,
}

impl FakeAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a reply for the next command named `command`.
    pub fn script(&self, command: &'static str, reply: Reply) {
        self.script
            .lock()
            .unwrap()
            .entry(command)
            .or_default()
            .push_back(reply);
    }

    pub fn sent(&self) -> Vec<(i64, Command)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent().iter().map(|(_, c)| c.name()).collect()
    }

    pub fn copies(&self) -> Vec<datamotion_types::CopyCommand> {
        self.sent()
            .into_iter()
            .filter_map(|(_, c)| match c {
                Command::Copy(copy) => Some(copy),
                _ => None,
            })
            .collect()
    }

    fn default_answer(command: &Command) -> Answer {
        match command {
            Command::Copy(copy) => {
                let mut new_data = copy.dest.clone();
                if new_data.path.is_none() {
                    new_data.path = Some(format!(
                        "store-{}/{}/{}",
                        copy.dest.store.id, copy.dest.object_type, copy.dest.id
                    ));
                }
                Answer::success().with_payload(AnswerPayload::Copy { new_data })
            }
            Command::MigrateVolume(migrate) => {
                Answer::success().with_payload(AnswerPayload::MigrateVolume {
                    volume_path: format!("migrated/{}", migrate.volume_id),
                })
            }
            Command::UploadStatus(_) => {
                Answer::success().with_payload(AnswerPayload::UploadStatus {
                    status: UploadStatus::Unknown,
                    download_pct: 0,
                    install_path: None,
                    size: None,
                    physical_size: None,
                })
            }
            Command::Delete(_) | Command::ModifyStoragePool(_) => Answer::success(),
        }
    }

    fn handle(&self, host_id: i64, command: &Command) -> Result<Answer, EndpointError> {
        self.sent.lock().unwrap().push((host_id, command.clone()));
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(command.name())
            .and_then(VecDeque::pop_front)
            .unwrap_or(Reply::Default);
        match reply {
            Reply::Default => Ok(Self::default_answer(command)),
            Reply::Answer(answer) => Ok(answer),
            Reply::Transport(message) => Err(EndpointError::Unavailable(message)),
        }
    }
}

pub struct FakeEndpoint {
    host_id: i64,
    agent: Arc<FakeAgent>,
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    fn host_id(&self) -> i64 {
        self.host_id
    }

    async fn send_message(&self, command: &Command) -> Result<Answer, EndpointError> {
        self.agent.handle(self.host_id, command)
    }
}

/// Always picks `host_id` unless switched off, in which case nothing is
/// reachable.
pub struct FakeSelector {
    host_id: i64,
    agent: Arc<FakeAgent>,
    available: AtomicBool,
}

impl FakeSelector {
    pub fn new(host_id: i64, agent: Arc<FakeAgent>) -> Arc<Self> {
        Arc::new(Self {
            host_id,
            agent,
            available: AtomicBool::new(true),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn endpoint(&self, host_id: i64) -> Option<Arc<dyn Endpoint>> {
        if !self.available.load(Ordering::SeqCst) {
            return None;
        }
        Some(Arc::new(FakeEndpoint {
            host_id,
            agent: Arc::clone(&self.agent),
        }))
    }
}

#[async_trait]
impl EndpointSelector for FakeSelector {
    async fn select_for_copy(
        &self,
        _src: &DataObject,
        _dest: &DataObject,
    ) -> Option<Arc<dyn Endpoint>> {
        self.endpoint(self.host_id)
    }

    async fn select_for_store(&self, _store: &DataStore) -> Option<Arc<dyn Endpoint>> {
        self.endpoint(self.host_id)
    }

    async fn select_host(&self, host_id: i64) -> Option<Arc<dyn Endpoint>> {
        self.endpoint(host_id)
    }
}

// ============================================================================
// VM service
// ============================================================================

type StopHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct FakeWorkloads {
    fail_stop: Mutex<HashSet<i64>>,
    fail_start: Mutex<HashSet<i64>>,
    stop_hooks: Mutex<HashMap<i64, StopHook>>,
    calls: Mutex<Vec<(&'static str, i64)>>,
}

impl FakeWorkloads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_stop(&self, vm_id: i64) {
        self.fail_stop.lock().unwrap().insert(vm_id);
    }

    pub fn fail_start(&self, vm_id: i64) {
        self.fail_start.lock().unwrap().insert(vm_id);
    }

    pub fn allow_start(&self, vm_id: i64) {
        self.fail_start.lock().unwrap().remove(&vm_id);
    }

    /// Run `hook` once the VM has been stopped.
    pub fn on_stop(&self, vm_id: i64, hook: impl Fn() + Send + Sync + 'static) {
        self.stop_hooks.lock().unwrap().insert(vm_id, Box::new(hook));
    }

    pub fn calls(&self) -> Vec<(&'static str, i64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn ids(&self, action: &str) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter(|(a, _)| *a == action)
            .map(|(_, id)| id)
            .collect()
    }
}

#[async_trait]
impl WorkloadManager for FakeWorkloads {
    async fn stop(&self, vm: &VmInstance) -> Result<(), WorkloadError> {
        self.calls.lock().unwrap().push(("stop", vm.id));
        if self.fail_stop.lock().unwrap().contains(&vm.id) {
            return Err(WorkloadError::Rejected(format!("vm {} refused to stop", vm.id)));
        }
        if let Some(hook) = self.stop_hooks.lock().unwrap().get(&vm.id) {
            hook();
        }
        Ok(())
    }

    async fn start(&self, vm: &VmInstance) -> Result<(), WorkloadError> {
        self.calls.lock().unwrap().push(("start", vm.id));
        if self.fail_start.lock().unwrap().contains(&vm.id) {
            return Err(WorkloadError::Rejected(format!("vm {} refused to start", vm.id)));
        }
        Ok(())
    }
}

// ============================================================================
// Assembled services
// ============================================================================

/// A strategy over the in-memory database and a scripted agent on host 1.
pub struct MotionHarness {
    pub db: Arc<MemoryDatabase>,
    pub agent: Arc<FakeAgent>,
    pub selector: Arc<FakeSelector>,
    pub cache: Arc<dyn CacheManager>,
    pub strategy: DataMotionStrategy,
}

impl MotionHarness {
    pub fn new() -> Self {
        let db = Arc::new(MemoryDatabase::new());
        let agent = FakeAgent::new();
        let selector = FakeSelector::new(1, Arc::clone(&agent));
        let (_settings_tx, settings_rx) = watch::channel(MotionSettings::default());

        let cache: Arc<dyn CacheManager> = Arc::new(StorageCacheManager::new(
            db.clone(),
            selector.clone(),
            settings_rx.clone(),
        ));
        let strategy =
            DataMotionStrategy::new(db.clone(), selector.clone(), cache.clone(), settings_rx);

        Self {
            db,
            agent,
            selector,
            cache,
            strategy,
        }
    }
}
