// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Storage pool maintenance automation
//!
//! Putting a primary pool into maintenance stops every workload holding one
//! of its volumes. Each stop is recorded as a work item so that cancelling
//! maintenance (possibly on another management server after a restart)
//! knows which workloads to bring back.

use std::sync::Arc;

use datamotion_types::{Command, ModifyStoragePoolCommand};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::db::{Persistence, StoreError};
use crate::endpoint::EndpointSelector;
use crate::metrics;
use crate::model::{DataStore, Host, HostFilter, StoragePoolStatus, VmType};
use crate::workload::{WorkloadError, WorkloadManager};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("Storage pool {0} not found")]
    PoolNotFound(i64),

    #[error("Failed to stop {vm_type} {vm_id}: {source}")]
    StopFailed {
        vm_id: i64,
        vm_type: VmType,
        source: WorkloadError,
    },

    #[error("Failed to start {vm_type} {vm_id}: {source}")]
    StartFailed {
        vm_id: i64,
        vm_type: VmType,
        source: WorkloadError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct StoragePoolAutomation {
    db: Arc<dyn Persistence>,
    selector: Arc<dyn EndpointSelector>,
    workloads: Arc<dyn WorkloadManager>,
    node_id: i64,
}

impl StoragePoolAutomation {
    pub fn new(
        db: Arc<dyn Persistence>,
        selector: Arc<dyn EndpointSelector>,
        workloads: Arc<dyn WorkloadManager>,
        node_id: i64,
    ) -> Self {
        Self {
            db,
            selector,
            workloads,
            node_id,
        }
    }

    async fn load_pool(&self, pool_id: i64) -> Result<DataStore, MaintenanceError> {
        self.db
            .find_data_store(pool_id)
            .await?
            .ok_or(MaintenanceError::PoolNotFound(pool_id))
    }

    async fn up_hosts(&self, pool: &DataStore) -> Result<Vec<Host>, StoreError> {
        match HostFilter::for_scope(&pool.scope) {
            Some(filter) => self.db.list_up_hosts(filter).await,
            None => Ok(Vec::new()),
        }
    }

    /// Tell every host to add or drop the pool. Failures are logged only.
    async fn modify_pool_on_hosts(&self, pool: &DataStore, hosts: &[Host], add: bool) {
        let command = Command::ModifyStoragePool(ModifyStoragePoolCommand {
            add,
            pool: pool.to_descriptor(),
        });
        for host in hosts {
            let Some(endpoint) = self.selector.select_host(host.id).await else {
                warn!(host_id = host.id, pool_id = pool.id, "No endpoint for host");
                continue;
            };
            match endpoint.send_message(&command).await {
                Ok(answer) if answer.result => {}
                Ok(answer) => warn!(
                    host_id = host.id,
                    pool_id = pool.id,
                    add,
                    details = answer.details_or_default(),
                    "Host rejected storage pool update"
                ),
                Err(e) => warn!(
                    host_id = host.id,
                    pool_id = pool.id,
                    add,
                    error = %e,
                    "Failed to send storage pool update"
                ),
            }
        }
    }

    /// Put a pool into maintenance, stopping the workloads that use it.
    ///
    /// On failure the pool is left in ErrorInMaintenance and work items keep
    /// whatever progress they made.
    pub async fn maintain(&self, pool_id: i64) -> Result<bool, MaintenanceError> {
        let pool = self.load_pool(pool_id).await?;
        let hosts = self.up_hosts(&pool).await?;

        if hosts.is_empty() {
            info!(pool_id, "No Up hosts for pool, entering maintenance directly");
            self.db
                .update_pool_status(pool_id, StoragePoolStatus::Maintenance)
                .await?;
            return Ok(true);
        }

        self.db
            .update_pool_status(pool_id, StoragePoolStatus::PrepareForMaintenance)
            .await?;

        match self.drain(&pool, &hosts).await {
            Ok(()) => {
                self.db
                    .update_pool_status(pool_id, StoragePoolStatus::Maintenance)
                    .await?;
                info!(pool_id, "Storage pool in maintenance");
                Ok(true)
            }
            Err(e) => {
                error!(pool_id, error = %e, "Failed to prepare storage pool for maintenance");
                metrics::record_maintenance_failure();
                if let Err(se) = self
                    .db
                    .update_pool_status(pool_id, StoragePoolStatus::ErrorInMaintenance)
                    .await
                {
                    error!(pool_id, error = %se, "Failed to record maintenance error");
                }
                Err(e)
            }
        }
    }

    async fn drain(&self, pool: &DataStore, hosts: &[Host]) -> Result<(), MaintenanceError> {
        self.modify_pool_on_hosts(pool, hosts, false).await;

        // Workloads can only come back if another pool can take them
        let restart = match pool.zone_id() {
            Some(zone_id) => self
                .db
                .list_pools_by_status(zone_id, StoragePoolStatus::Up)
                .await?
                .iter()
                .any(|p| p.id != pool.id),
            None => false,
        };

        for volume in self.db.list_volumes_by_pool(pool.id).await? {
            let Some(vm_id) = volume.vm_id else {
                continue;
            };
            let Some(vm) = self.db.find_vm(vm_id).await? else {
                continue;
            };
            if !vm.state.holds_volumes() {
                continue;
            }

            match self.db.find_work(pool.id, vm.id).await? {
                Some(mut item) => {
                    item.stopped_for_maintenance = false;
                    item.started_after_maintenance = false;
                    item.management_server_id = self.node_id;
                    self.db.update_work(&item).await?;
                }
                None => {
                    self.db.create_work(pool.id, vm.id, self.node_id).await?;
                }
            }
        }

        for mut item in self
            .db
            .list_pending_for_prepare(pool.id, self.node_id)
            .await?
        {
            let Some(vm) = self.db.find_vm(item.vm_id).await? else {
                warn!(pool_id = pool.id, vm_id = item.vm_id, "VM removed before it could be stopped");
                continue;
            };

            self.workloads
                .stop(&vm)
                .await
                .map_err(|source| MaintenanceError::StopFailed {
                    vm_id: vm.id,
                    vm_type: vm.vm_type,
                    source,
                })?;
            item.stopped_for_maintenance = true;
            self.db.update_work(&item).await?;
            info!(pool_id = pool.id, vm_id = vm.id, vm_type = %vm.vm_type, "Stopped workload");

            if restart && vm.vm_type.restarts_after_drain() {
                match self.workloads.start(&vm).await {
                    Ok(()) => {
                        item.started_after_maintenance = true;
                        self.db.update_work(&item).await?;
                    }
                    // Left pending so cancelling maintenance retries it
                    Err(e) => warn!(
                        pool_id = pool.id,
                        vm_id = vm.id,
                        vm_type = %vm.vm_type,
                        error = %e,
                        "Failed to restart workload on another pool"
                    ),
                }
            }
        }

        Ok(())
    }

    /// Take a pool out of maintenance and restart the workloads stopped for
    /// it.
    pub async fn cancel_maintain(&self, pool_id: i64) -> Result<bool, MaintenanceError> {
        let pool = self.load_pool(pool_id).await?;
        let hosts = self.up_hosts(&pool).await?;

        if hosts.is_empty() {
            info!(pool_id, "No Up hosts for pool, leaving maintenance directly");
            self.db
                .update_pool_status(pool_id, StoragePoolStatus::Up)
                .await?;
            return Ok(true);
        }

        self.modify_pool_on_hosts(&pool, &hosts, true).await;

        for mut item in self
            .db
            .list_pending_for_cancel(pool_id, self.node_id)
            .await?
        {
            let Some(vm) = self.db.find_vm(item.vm_id).await? else {
                warn!(pool_id, vm_id = item.vm_id, "VM removed before it could be restarted");
                continue;
            };

            if let Err(source) = self.workloads.start(&vm).await {
                error!(pool_id, vm_id = vm.id, error = %source, "Failed to restart workload");
                metrics::record_maintenance_failure();
                return Err(MaintenanceError::StartFailed {
                    vm_id: vm.id,
                    vm_type: vm.vm_type,
                    source,
                });
            }
            item.started_after_maintenance = true;
            self.db.update_work(&item).await?;
            info!(pool_id, vm_id = vm.id, vm_type = %vm.vm_type, "Restarted workload");
        }

        self.db
            .update_pool_status(pool_id, StoragePoolStatus::Up)
            .await?;
        info!(pool_id, "Storage pool back in service");
        Ok(true)
    }
}
