// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Stopping and starting VMs on behalf of pool maintenance

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::model::{VmInstance, VmType};

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("VM service returned status {status} for VM {vm_id}")]
    Status { vm_id: i64, status: u16 },

    #[error("{0}")]
    Rejected(String),
}

/// Stops and starts the workloads that use a pool.
#[async_trait]
pub trait WorkloadManager: Send + Sync {
    async fn stop(&self, vm: &VmInstance) -> Result<(), WorkloadError>;
    async fn start(&self, vm: &VmInstance) -> Result<(), WorkloadError>;
}

#[derive(Serialize)]
struct PowerRequest {
    vm_type: VmType,
}

/// Posts `/vms/{id}/stop` and `/vms/{id}/start` to the VM service.
pub struct HttpWorkloadManager {
    client: Client,
    base_url: String,
}

impl HttpWorkloadManager {
    pub fn new(base_url: String, timeout_secs: u64) -> Result<Self, WorkloadError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, base_url })
    }

    async fn power(&self, vm: &VmInstance, action: &str) -> Result<(), WorkloadError> {
        let url = format!("{}/vms/{}/{}", self.base_url, vm.id, action);
        tracing::debug!(vm_id = vm.id, vm_type = %vm.vm_type, action, "Sending VM power request");

        let response = self
            .client
            .post(&url)
            .json(&PowerRequest {
                vm_type: vm.vm_type,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::warn!(
                vm_id = vm.id,
                action,
                status = %response.status(),
                "VM service returned non-success status"
            );
            return Err(WorkloadError::Status {
                vm_id: vm.id,
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadManager for HttpWorkloadManager {
    async fn stop(&self, vm: &VmInstance) -> Result<(), WorkloadError> {
        self.power(vm, "stop").await
    }

    async fn start(&self, vm: &VmInstance) -> Result<(), WorkloadError> {
        self.power(vm, "start").await
    }
}
