// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Agent endpoints
//!
//! An [`Endpoint`] executes a [`Command`] on one hypervisor host and returns
//! the agent's [`Answer`]. An [`EndpointSelector`] picks the host that can
//! reach the stores involved in a command.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use datamotion_types::{Answer, Command, DataStoreRole};
use rand::seq::IndexedRandom;
use reqwest::Client;
use thiserror::Error;

use crate::db::{Persistence, StoreError};
use crate::model::{DataObject, DataStore, Host, HostFilter};

/// Agent transport errors
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Agent on host {host_id} returned status {status}")]
    Status { host_id: i64, status: u16 },

    #[error("Agent unavailable: {0}")]
    Unavailable(String),
}

/// A host agent able to execute commands.
#[async_trait]
pub trait Endpoint: Send + Sync {
    fn host_id(&self) -> i64;

    /// Send `command` and wait for the agent's answer.
    async fn send_message(&self, command: &Command) -> Result<Answer, EndpointError>;
}

/// Chooses the endpoint for a command.
///
/// `None` means no Up host can reach the stores involved.
#[async_trait]
pub trait EndpointSelector: Send + Sync {
    /// An endpoint that can reach both sides of a copy.
    async fn select_for_copy(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Option<Arc<dyn Endpoint>>;

    /// An endpoint that can reach `store`.
    async fn select_for_store(&self, store: &DataStore) -> Option<Arc<dyn Endpoint>>;

    /// The endpoint of one particular host, if it is Up.
    async fn select_host(&self, host_id: i64) -> Option<Arc<dyn Endpoint>>;
}

/// Posts JSON commands to a host agent's `/commands` resource.
pub struct HttpEndpoint {
    client: Client,
    host_id: i64,
    base_url: String,
}

impl HttpEndpoint {
    pub fn new(client: Client, host_id: i64, base_url: String) -> Self {
        Self {
            client,
            host_id,
            base_url,
        }
    }

    pub fn for_host(client: Client, host: &Host, port: u16) -> Self {
        Self::new(client, host.id, format!("http://{}:{}", host.address, port))
    }
}

#[async_trait]
impl Endpoint for HttpEndpoint {
    fn host_id(&self) -> i64 {
        self.host_id
    }

    async fn send_message(&self, command: &Command) -> Result<Answer, EndpointError> {
        let url = format!("{}/commands", self.base_url);
        tracing::debug!(
            host_id = self.host_id,
            command = command.name(),
            "Sending command to agent"
        );

        let response = self.client.post(&url).json(command).send().await?;

        if !response.status().is_success() {
            tracing::warn!(
                host_id = self.host_id,
                command = command.name(),
                status = %response.status(),
                "Agent returned non-success status"
            );
            return Err(EndpointError::Status {
                host_id: self.host_id,
                status: response.status().as_u16(),
            });
        }

        Ok(response.json().await?)
    }
}

/// Picks a random Up host in scope of the store involved.
pub struct HostEndpointSelector {
    db: Arc<dyn Persistence>,
    client: Client,
    agent_port: u16,
}

impl HostEndpointSelector {
    pub fn new(
        db: Arc<dyn Persistence>,
        agent_port: u16,
        timeout_secs: u64,
    ) -> Result<Self, EndpointError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            db,
            client,
            agent_port,
        })
    }

    async fn up_hosts(&self, store: &DataStore) -> Result<Vec<Host>, StoreError> {
        match HostFilter::for_scope(&store.scope) {
            Some(filter) => self.db.list_up_hosts(filter).await,
            None => Ok(Vec::new()),
        }
    }

    async fn pick(&self, store: &DataStore) -> Option<Arc<dyn Endpoint>> {
        let hosts = match self.up_hosts(store).await {
            Ok(hosts) => hosts,
            Err(e) => {
                tracing::warn!(
                    store_id = store.id,
                    error = %e,
                    "Failed to list Up hosts for store"
                );
                return None;
            }
        };

        let host = hosts.choose(&mut rand::rng())?;
        Some(Arc::new(HttpEndpoint::for_host(
            self.client.clone(),
            host,
            self.agent_port,
        )))
    }
}

#[async_trait]
impl EndpointSelector for HostEndpointSelector {
    async fn select_for_copy(
        &self,
        src: &DataObject,
        dest: &DataObject,
    ) -> Option<Arc<dyn Endpoint>> {
        // Only a hypervisor attached to the primary pool can mount it; image
        // stores are reachable from any host in the zone.
        let (first, second) = if dest.store().role == DataStoreRole::Primary
            && src.store().role != DataStoreRole::Primary
        {
            (dest.store(), src.store())
        } else {
            (src.store(), dest.store())
        };

        match self.pick(first).await {
            Some(endpoint) => Some(endpoint),
            None => self.pick(second).await,
        }
    }

    async fn select_for_store(&self, store: &DataStore) -> Option<Arc<dyn Endpoint>> {
        self.pick(store).await
    }

    async fn select_host(&self, host_id: i64) -> Option<Arc<dyn Endpoint>> {
        match self.db.find_host(host_id).await {
            Ok(Some(host)) if host.status == crate::model::HostStatus::Up => Some(Arc::new(
                HttpEndpoint::for_host(self.client.clone(), &host, self.agent_port),
            )),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(host_id, error = %e, "Failed to look up host");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDatabase;
    use crate::model::{HostStatus, StoragePoolStatus, VolumeObject};
    use datamotion_types::{Scope, StoreProtocol};

    fn host(id: i64, cluster_id: i64, status: HostStatus) -> Host {
        Host {
            id,
            name: format!("host-{}", id),
            address: format!("10.0.1.{}", id),
            cluster_id: Some(cluster_id),
            zone_id: 1,
            status,
            management_server_id: Some(1),
        }
    }

    fn store(id: i64, role: DataStoreRole, scope: Scope) -> DataStore {
        DataStore {
            id,
            uuid: format!("store-{}", id),
            name: format!("store-{}", id),
            role,
            protocol: StoreProtocol::Nfs,
            url: format!("nfs://10.0.0.{}/export", id),
            path: None,
            scope,
            pod_id: None,
            status: StoragePoolStatus::Up,
        }
    }

    fn volume_in(store: DataStore) -> DataObject {
        DataObject::Volume(VolumeObject {
            volume_id: 1,
            name: "vol".to_string(),
            path: None,
            size: None,
            store,
        })
    }

    fn selector(db: Arc<MemoryDatabase>) -> HostEndpointSelector {
        let _ = rustls::crypto::ring::default_provider().install_default();
        HostEndpointSelector::new(db, 8250, 5).unwrap()
    }

    /// Test: only Up hosts in the primary pool's cluster are chosen for a copy
    #[tokio::test]
    async fn copy_prefers_primary_cluster() {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_host(host(1, 10, HostStatus::Up));
        db.insert_host(host(2, 20, HostStatus::Up));
        db.insert_host(host(3, 20, HostStatus::Down));

        let image = volume_in(store(
            1,
            DataStoreRole::Image,
            Scope::Zone { zone_id: Some(1) },
        ));
        let primary = volume_in(store(
            2,
            DataStoreRole::Primary,
            Scope::Cluster {
                cluster_id: 20,
                zone_id: 1,
            },
        ));

        let selector = selector(db);
        for _ in 0..10 {
            let endpoint = selector.select_for_copy(&image, &primary).await.unwrap();
            assert_eq!(endpoint.host_id(), 2);
        }
    }

    /// Test: no Up host in scope yields no endpoint
    #[tokio::test]
    async fn no_up_hosts_no_endpoint() {
        let db = Arc::new(MemoryDatabase::new());
        db.insert_host(host(1, 10, HostStatus::Maintenance));
        let pool = store(
            2,
            DataStoreRole::Primary,
            Scope::Cluster {
                cluster_id: 10,
                zone_id: 1,
            },
        );
        let selector = selector(db);
        assert!(selector.select_for_store(&pool).await.is_none());
        assert!(selector.select_host(1).await.is_none());
    }
}
