// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Wiring for the data motion manager

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{CacheManager, StorageCacheManager};
use crate::config::{ManagerConfig, MotionSettings};
use crate::db::Persistence;
use crate::endpoint::{EndpointSelector, HostEndpointSelector};
use crate::maintenance::StoragePoolAutomation;
use crate::motion::DataMotionStrategy;
use crate::upload_monitor::UploadMonitor;
use crate::workload::WorkloadManager;

/// Every service of the manager, built over one database and endpoint
/// selector.
pub struct ManagerContext {
    config: ManagerConfig,
    selector: Arc<dyn EndpointSelector>,
    cache: Arc<dyn CacheManager>,
    strategy: DataMotionStrategy,
    upload_monitor: Arc<UploadMonitor>,
    automation: StoragePoolAutomation,
}

impl ManagerContext {
    pub fn new(
        config: ManagerConfig,
        db: Arc<dyn Persistence>,
        workloads: Arc<dyn WorkloadManager>,
        settings: watch::Receiver<MotionSettings>,
    ) -> Result<Self> {
        let selector: Arc<dyn EndpointSelector> = Arc::new(HostEndpointSelector::new(
            Arc::clone(&db),
            config.agent_port,
            config.agent_timeout_secs,
        )?);
        Ok(Self::with_selector(config, db, selector, workloads, settings))
    }

    /// Build the context around an existing endpoint selector.
    pub fn with_selector(
        config: ManagerConfig,
        db: Arc<dyn Persistence>,
        selector: Arc<dyn EndpointSelector>,
        workloads: Arc<dyn WorkloadManager>,
        settings: watch::Receiver<MotionSettings>,
    ) -> Self {
        let cache: Arc<dyn CacheManager> = Arc::new(StorageCacheManager::new(
            Arc::clone(&db),
            Arc::clone(&selector),
            settings.clone(),
        ));

        let strategy = DataMotionStrategy::new(
            Arc::clone(&db),
            Arc::clone(&selector),
            Arc::clone(&cache),
            settings,
        );

        let upload_monitor = Arc::new(UploadMonitor::new(
            Arc::clone(&db),
            Arc::clone(&selector),
            Duration::from_secs(config.upload_monitor_interval_secs),
            Duration::from_secs(config.upload_operation_timeout_secs),
            config.management_server_id,
        ));

        let automation = StoragePoolAutomation::new(
            db,
            Arc::clone(&selector),
            workloads,
            config.management_server_id,
        );

        Self {
            config,
            selector,
            cache,
            strategy,
            upload_monitor,
            automation,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn selector(&self) -> &Arc<dyn EndpointSelector> {
        &self.selector
    }

    pub fn cache(&self) -> &Arc<dyn CacheManager> {
        &self.cache
    }

    pub fn strategy(&self) -> &DataMotionStrategy {
        &self.strategy
    }

    pub fn automation(&self) -> &StoragePoolAutomation {
        &self.automation
    }

    pub fn upload_monitor(&self) -> &Arc<UploadMonitor> {
        &self.upload_monitor
    }

    /// Start the background tasks.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        Arc::clone(&self.upload_monitor).start()
    }

    pub fn shutdown(&self) {
        self.upload_monitor.shutdown();
    }
}
