// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! PostgreSQL database layer using tokio-postgres
//!
//! Enum columns are stored as their display names. Placement records live in
//! one table per object kind (`volume_store_ref`, `snapshot_store_ref`,
//! `template_store_ref`) sharing the same column layout.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datamotion_types::{DataObjectType, DataStoreRole, Scope};
use deadpool_postgres::{Config, Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::debug;

use super::{
    DataStoreDao, HostDao, ObjectInStoreDao, StoragePoolWorkDao, StoreError, VmInstanceDao,
    VolumeDao,
};
use crate::fsm::{TransitionPayload, TransitionStore};
use crate::model::{
    DataStore, DownloadState, Host, HostFilter, NewStoreRecord, ObjectInStoreState,
    StoragePoolStatus, StoreRecord, VmInstance, VolumeLocation, VolumeRecord, VolumeState,
    WorkItem,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS data_stores (
    id BIGSERIAL PRIMARY KEY,
    uuid TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    role TEXT NOT NULL,
    protocol TEXT NOT NULL,
    url TEXT NOT NULL,
    path TEXT,
    scope_type TEXT NOT NULL,
    host_id BIGINT,
    cluster_id BIGINT,
    zone_id BIGINT,
    region_id BIGINT,
    pod_id BIGINT,
    status TEXT NOT NULL DEFAULT 'Up'
);

CREATE TABLE IF NOT EXISTS hosts (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    address TEXT NOT NULL,
    cluster_id BIGINT,
    zone_id BIGINT NOT NULL,
    status TEXT NOT NULL,
    management_server_id BIGINT
);

CREATE TABLE IF NOT EXISTS volumes (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_count BIGINT NOT NULL DEFAULT 0,
    updated TIMESTAMPTZ,
    created TIMESTAMPTZ NOT NULL DEFAULT now(),
    pool_id BIGINT,
    last_pool_id BIGINT,
    path TEXT,
    folder TEXT,
    pod_id BIGINT,
    size BIGINT NOT NULL DEFAULT 0,
    vm_id BIGINT,
    zone_id BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS vm_instances (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    vm_type TEXT NOT NULL,
    state TEXT NOT NULL,
    host_id BIGINT
);

CREATE TABLE IF NOT EXISTS volume_store_ref (
    id BIGSERIAL PRIMARY KEY,
    volume_id BIGINT NOT NULL,
    store_id BIGINT NOT NULL,
    store_role TEXT NOT NULL,
    state TEXT NOT NULL,
    destroyed BOOLEAN NOT NULL DEFAULT false,
    updated_count BIGINT NOT NULL DEFAULT 0,
    updated TIMESTAMPTZ,
    created TIMESTAMPTZ NOT NULL DEFAULT now(),
    zone_id BIGINT,
    download_state TEXT,
    download_pct INTEGER NOT NULL DEFAULT 0,
    install_path TEXT,
    size BIGINT NOT NULL DEFAULT 0,
    physical_size BIGINT NOT NULL DEFAULT 0,
    ref_cnt BIGINT NOT NULL DEFAULT 0,
    extract_url TEXT,
    error_str TEXT
);

CREATE TABLE IF NOT EXISTS snapshot_store_ref (
    id BIGSERIAL PRIMARY KEY,
    snapshot_id BIGINT NOT NULL,
    store_id BIGINT NOT NULL,
    store_role TEXT NOT NULL,
    state TEXT NOT NULL,
    destroyed BOOLEAN NOT NULL DEFAULT false,
    updated_count BIGINT NOT NULL DEFAULT 0,
    updated TIMESTAMPTZ,
    created TIMESTAMPTZ NOT NULL DEFAULT now(),
    zone_id BIGINT,
    download_state TEXT,
    download_pct INTEGER NOT NULL DEFAULT 0,
    install_path TEXT,
    size BIGINT NOT NULL DEFAULT 0,
    physical_size BIGINT NOT NULL DEFAULT 0,
    ref_cnt BIGINT NOT NULL DEFAULT 0,
    extract_url TEXT,
    error_str TEXT,
    parent_snapshot_id BIGINT
);

CREATE TABLE IF NOT EXISTS template_store_ref (
    id BIGSERIAL PRIMARY KEY,
    template_id BIGINT NOT NULL,
    store_id BIGINT NOT NULL,
    store_role TEXT NOT NULL,
    state TEXT NOT NULL,
    destroyed BOOLEAN NOT NULL DEFAULT false,
    updated_count BIGINT NOT NULL DEFAULT 0,
    updated TIMESTAMPTZ,
    created TIMESTAMPTZ NOT NULL DEFAULT now(),
    zone_id BIGINT,
    download_state TEXT,
    download_pct INTEGER NOT NULL DEFAULT 0,
    install_path TEXT,
    size BIGINT NOT NULL DEFAULT 0,
    physical_size BIGINT NOT NULL DEFAULT 0,
    ref_cnt BIGINT NOT NULL DEFAULT 0,
    extract_url TEXT,
    error_str TEXT
);

CREATE TABLE IF NOT EXISTS storage_pool_work (
    id BIGSERIAL PRIMARY KEY,
    pool_id BIGINT NOT NULL,
    vm_id BIGINT NOT NULL,
    stopped_for_maintenance BOOLEAN NOT NULL DEFAULT false,
    started_after_maintenance BOOLEAN NOT NULL DEFAULT false,
    management_server_id BIGINT NOT NULL,
    UNIQUE (pool_id, vm_id)
);
"#;

const DATA_STORE_COLUMNS: &str = "id, uuid, name, role, protocol, url, path, scope_type, \
     host_id, cluster_id, zone_id, region_id, pod_id, status";

const HOST_COLUMNS: &str = "id, name, address, cluster_id, zone_id, status, management_server_id";

const VOLUME_COLUMNS: &str = "id, name, state, updated_count, updated, created, pool_id, \
     last_pool_id, path, folder, pod_id, size, vm_id, zone_id";

const WORK_COLUMNS: &str = "id, vm_id, pool_id, stopped_for_maintenance, \
     started_after_maintenance, management_server_id";

/// Table and object-id column holding placement records of `kind`.
fn store_ref_table(kind: DataObjectType) -> (&'static str, &'static str) {
    match kind {
        DataObjectType::Volume => ("volume_store_ref", "volume_id"),
        DataObjectType::Snapshot => ("snapshot_store_ref", "snapshot_id"),
        DataObjectType::Template => ("template_store_ref", "template_id"),
    }
}

fn store_ref_columns(kind: DataObjectType, prefix: &str) -> String {
    let (_, object_column) = store_ref_table(kind);
    let parent = if kind == DataObjectType::Snapshot {
        format!("{prefix}parent_snapshot_id")
    } else {
        "NULL::BIGINT AS parent_snapshot_id".to_string()
    };
    [
        "id",
        &format!("{object_column} AS object_id"),
        "store_id",
        "store_role",
        "state",
        "destroyed",
        "updated_count",
        "updated",
        "created",
        "zone_id",
        "download_state",
        "download_pct",
        "install_path",
        "size",
        "physical_size",
        "ref_cnt",
        "extract_url",
        "error_str",
    ]
    .iter()
    .map(|c| format!("{prefix}{c}"))
    .chain(std::iter::once(parent))
    .collect::<Vec<_>>()
    .join(", ")
}

fn parse_column<T: FromStr>(column: &'static str, value: &str) -> Result<T, StoreError> {
    value.parse().map_err(|_| StoreError::Decode {
        column,
        value: value.to_string(),
    })
}

fn data_store_from_row(row: &Row) -> Result<DataStore, StoreError> {
    let scope_type: String = row.try_get("scope_type")?;
    let host_id: Option<i64> = row.try_get("host_id")?;
    let cluster_id: Option<i64> = row.try_get("cluster_id")?;
    let zone_id: Option<i64> = row.try_get("zone_id")?;
    let region_id: Option<i64> = row.try_get("region_id")?;

    let scope = match (scope_type.as_str(), host_id, cluster_id, zone_id, region_id) {
        ("host", Some(host_id), Some(cluster_id), Some(zone_id), _) => Scope::Host {
            host_id,
            cluster_id,
            zone_id,
        },
        ("cluster", _, Some(cluster_id), Some(zone_id), _) => Scope::Cluster {
            cluster_id,
            zone_id,
        },
        ("zone", _, _, zone_id, _) => Scope::Zone { zone_id },
        ("region", _, _, _, Some(region_id)) => Scope::Region { region_id },
        _ => {
            return Err(StoreError::Decode {
                column: "scope_type",
                value: scope_type,
            });
        }
    };

    let role: String = row.try_get("role")?;
    let protocol: String = row.try_get("protocol")?;
    let status: String = row.try_get("status")?;
    Ok(DataStore {
        id: row.try_get("id")?,
        uuid: row.try_get("uuid")?,
        name: row.try_get("name")?,
        role: parse_column("role", &role)?,
        protocol: parse_column("protocol", &protocol)?,
        url: row.try_get("url")?,
        path: row.try_get("path")?,
        scope,
        pod_id: row.try_get("pod_id")?,
        status: parse_column("status", &status)?,
    })
}

fn store_record_from_row(kind: DataObjectType, row: &Row) -> Result<StoreRecord, StoreError> {
    let store_role: String = row.try_get("store_role")?;
    let state: String = row.try_get("state")?;
    let download_state: Option<String> = row.try_get("download_state")?;
    Ok(StoreRecord {
        id: row.try_get("id")?,
        kind,
        object_id: row.try_get("object_id")?,
        store_id: row.try_get("store_id")?,
        store_role: parse_column("store_role", &store_role)?,
        state: parse_column("state", &state)?,
        destroyed: row.try_get("destroyed")?,
        updated_count: row.try_get("updated_count")?,
        updated: row.try_get("updated")?,
        created: row.try_get("created")?,
        zone_id: row.try_get("zone_id")?,
        download_state: download_state
            .map(|s| parse_column("download_state", &s))
            .transpose()?,
        download_pct: row.try_get("download_pct")?,
        install_path: row.try_get("install_path")?,
        size: row.try_get("size")?,
        physical_size: row.try_get("physical_size")?,
        ref_cnt: row.try_get("ref_cnt")?,
        extract_url: row.try_get("extract_url")?,
        error_str: row.try_get("error_str")?,
        parent_snapshot_id: row.try_get("parent_snapshot_id")?,
    })
}

fn volume_from_row(row: &Row) -> Result<VolumeRecord, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(VolumeRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        state: parse_column("state", &state)?,
        updated_count: row.try_get("updated_count")?,
        updated: row.try_get("updated")?,
        created: row.try_get("created")?,
        pool_id: row.try_get("pool_id")?,
        last_pool_id: row.try_get("last_pool_id")?,
        path: row.try_get("path")?,
        folder: row.try_get("folder")?,
        pod_id: row.try_get("pod_id")?,
        size: row.try_get("size")?,
        vm_id: row.try_get("vm_id")?,
        zone_id: row.try_get("zone_id")?,
    })
}

fn host_from_row(row: &Row) -> Result<Host, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Host {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        address: row.try_get("address")?,
        cluster_id: row.try_get("cluster_id")?,
        zone_id: row.try_get("zone_id")?,
        status: parse_column("status", &status)?,
        management_server_id: row.try_get("management_server_id")?,
    })
}

fn vm_from_row(row: &Row) -> Result<VmInstance, StoreError> {
    let vm_type: String = row.try_get("vm_type")?;
    let state: String = row.try_get("state")?;
    Ok(VmInstance {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        vm_type: parse_column("vm_type", &vm_type)?,
        state: parse_column("state", &state)?,
        host_id: row.try_get("host_id")?,
    })
}

fn work_from_row(row: &Row) -> Result<WorkItem, StoreError> {
    Ok(WorkItem {
        id: row.try_get("id")?,
        vm_id: row.try_get("vm_id")?,
        pool_id: row.try_get("pool_id")?,
        stopped_for_maintenance: row.try_get("stopped_for_maintenance")?,
        started_after_maintenance: row.try_get("started_after_maintenance")?,
        management_server_id: row.try_get("management_server_id")?,
    })
}

/// Database operations
pub struct Database {
    pool: Pool,
}

impl Database {
    /// Create a new database connection pool from a connection URL
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| StoreError::Connection(format!("Invalid database URL: {}", e)))?;

        let mut cfg = Config::new();
        if let Some(host) = pg_config.get_hosts().first() {
            match host {
                tokio_postgres::config::Host::Tcp(host) => {
                    cfg.host = Some(host.clone());
                }
                tokio_postgres::config::Host::Unix(path) => {
                    cfg.host = Some(path.to_string_lossy().to_string());
                }
            }
        }
        if let Some(port) = pg_config.get_ports().first() {
            cfg.port = Some(*port);
        }
        if let Some(user) = pg_config.get_user() {
            cfg.user = Some(user.to_string());
        }
        if let Some(password) = pg_config.get_password() {
            cfg.password = Some(String::from_utf8_lossy(password).to_string());
        }
        if let Some(dbname) = pg_config.get_dbname() {
            cfg.dbname = Some(dbname.to_string());
        }

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Connection(format!("Failed to create pool: {}", e)))?;

        let client = pool.get().await?;
        client.execute("SELECT 1", &[]).await.map_err(|e| {
            StoreError::Connection(format!("Failed to connect to database: {}", e))
        })?;

        Ok(Self { pool })
    }

    /// Create any missing tables.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.batch_execute(SCHEMA).await?;
        Ok(())
    }
}

#[async_trait]
impl DataStoreDao for Database {
    async fn find_data_store(&self, id: i64) -> Result<Option<DataStore>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {DATA_STORE_COLUMNS} FROM data_stores WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .as_ref()
            .map(data_store_from_row)
            .transpose()
    }

    async fn list_data_stores(
        &self,
        role: DataStoreRole,
        zone_id: i64,
    ) -> Result<Vec<DataStore>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {DATA_STORE_COLUMNS} FROM data_stores \
             WHERE role = $1 AND zone_id = $2 ORDER BY id"
        );
        let role = role.to_string();
        client
            .query(&query, &[&role, &zone_id])
            .await?
            .iter()
            .map(data_store_from_row)
            .collect()
    }

    async fn list_pools_by_status(
        &self,
        zone_id: i64,
        status: StoragePoolStatus,
    ) -> Result<Vec<DataStore>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {DATA_STORE_COLUMNS} FROM data_stores \
             WHERE role = $1 AND zone_id = $2 AND status = $3 ORDER BY id"
        );
        let role = DataStoreRole::Primary.to_string();
        let status = status.to_string();
        client
            .query(&query, &[&role, &zone_id, &status])
            .await?
            .iter()
            .map(data_store_from_row)
            .collect()
    }

    async fn update_pool_status(
        &self,
        pool_id: i64,
        status: StoragePoolStatus,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let status = status.to_string();
        let updated = client
            .execute(
                "UPDATE data_stores SET status = $1 WHERE id = $2",
                &[&status, &pool_id],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("storage pool {}", pool_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl HostDao for Database {
    async fn find_host(&self, id: i64) -> Result<Option<Host>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .as_ref()
            .map(host_from_row)
            .transpose()
    }

    async fn list_up_hosts(&self, filter: HostFilter) -> Result<Vec<Host>, StoreError> {
        let client = self.pool.get().await?;
        let (column, value) = match filter {
            HostFilter::Host(id) => ("id", id),
            HostFilter::Cluster(id) => ("cluster_id", id),
            HostFilter::Zone(id) => ("zone_id", id),
        };
        let query = format!(
            "SELECT {HOST_COLUMNS} FROM hosts WHERE status = 'Up' AND {column} = $1 ORDER BY id"
        );
        client
            .query(&query, &[&value])
            .await?
            .iter()
            .map(host_from_row)
            .collect()
    }
}

#[async_trait]
impl TransitionStore<StoreRecord> for Database {
    async fn update_state(
        &self,
        record: &StoreRecord,
        next: ObjectInStoreState,
        at: DateTime<Utc>,
        payload: Option<&TransitionPayload>,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;
        let (table, _) = store_ref_table(record.kind);
        let next_state = next.to_string();
        let current_state = record.state.to_string();
        let destroyed = record.marks_destroyed_on(next);
        let install_path = payload.and_then(|p| p.install_path.clone());
        let size = payload.and_then(|p| p.size);
        let physical_size = payload.and_then(|p| p.physical_size);

        let query = format!(
            "UPDATE {table} SET state = $1, updated_count = updated_count + 1, updated = $2, \
             destroyed = destroyed OR $3, \
             install_path = COALESCE($4, install_path), \
             size = COALESCE($5, size), \
             physical_size = COALESCE($6, physical_size) \
             WHERE id = $7 AND state = $8 AND updated_count = $9"
        );
        let updated = client
            .execute(
                &query,
                &[
                    &next_state,
                    &at,
                    &destroyed,
                    &install_path,
                    &size,
                    &physical_size,
                    &record.id,
                    &current_state,
                    &record.updated_count,
                ],
            )
            .await?;

        if updated == 0 {
            let query = format!(
                "SELECT state, updated_count, updated FROM {table} WHERE id = $1"
            );
            match client.query_opt(&query, &[&record.id]).await? {
                Some(row) => {
                    let state: String = row.try_get(0)?;
                    let updated_count: i64 = row.try_get(1)?;
                    let updated: Option<DateTime<Utc>> = row.try_get(2)?;
                    debug!(
                        table,
                        record_id = record.id,
                        stored_state = %state,
                        stored_count = updated_count,
                        stored_updated = ?updated,
                        expected_state = %current_state,
                        expected_count = record.updated_count,
                        "Conditional state update matched no rows"
                    );
                }
                None => debug!(table, record_id = record.id, "Record no longer exists"),
            }
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl ObjectInStoreDao for Database {
    async fn create_store_record(&self, new: NewStoreRecord) -> Result<StoreRecord, StoreError> {
        let client = self.pool.get().await?;
        let (table, object_column) = store_ref_table(new.kind);
        let store_role = new.store_role.to_string();
        let state = ObjectInStoreState::Allocated.to_string();
        let download_state = new.download_state.map(|s| s.to_string());
        let columns = store_ref_columns(new.kind, "");

        let row = if new.kind == DataObjectType::Snapshot {
            let query = format!(
                "INSERT INTO {table} ({object_column}, store_id, store_role, state, zone_id, \
                 install_path, size, download_state, parent_snapshot_id) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {columns}"
            );
            client
                .query_one(
                    &query,
                    &[
                        &new.object_id,
                        &new.store_id,
                        &store_role,
                        &state,
                        &new.zone_id,
                        &new.install_path,
                        &new.size,
                        &download_state,
                        &new.parent_snapshot_id,
                    ],
                )
                .await?
        } else {
            let query = format!(
                "INSERT INTO {table} ({object_column}, store_id, store_role, state, zone_id, \
                 install_path, size, download_state) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {columns}"
            );
            client
                .query_one(
                    &query,
                    &[
                        &new.object_id,
                        &new.store_id,
                        &store_role,
                        &state,
                        &new.zone_id,
                        &new.install_path,
                        &new.size,
                        &download_state,
                    ],
                )
                .await?
        };
        store_record_from_row(new.kind, &row)
    }

    async fn find_store_record(
        &self,
        kind: DataObjectType,
        id: i64,
    ) -> Result<Option<StoreRecord>, StoreError> {
        let client = self.pool.get().await?;
        let (table, _) = store_ref_table(kind);
        let columns = store_ref_columns(kind, "");
        let query = format!("SELECT {columns} FROM {table} WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .map(|row| store_record_from_row(kind, &row))
            .transpose()
    }

    async fn find_by_store_object(
        &self,
        kind: DataObjectType,
        store_id: i64,
        role: DataStoreRole,
        object_id: i64,
    ) -> Result<Option<StoreRecord>, StoreError> {
        let client = self.pool.get().await?;
        let (table, object_column) = store_ref_table(kind);
        let columns = store_ref_columns(kind, "");
        let query = format!(
            "SELECT {columns} FROM {table} \
             WHERE store_id = $1 AND store_role = $2 AND {object_column} = $3 \
             AND destroyed = false AND state <> 'Destroyed' \
             ORDER BY id DESC LIMIT 1"
        );
        let role = role.to_string();
        client
            .query_opt(&query, &[&store_id, &role, &object_id])
            .await?
            .map(|row| store_record_from_row(kind, &row))
            .transpose()
    }

    async fn list_by_store(
        &self,
        kind: DataObjectType,
        store_id: i64,
        role: DataStoreRole,
    ) -> Result<Vec<StoreRecord>, StoreError> {
        let client = self.pool.get().await?;
        let (table, _) = store_ref_table(kind);
        let columns = store_ref_columns(kind, "");
        let query = format!(
            "SELECT {columns} FROM {table} \
             WHERE store_id = $1 AND store_role = $2 AND destroyed = false ORDER BY id"
        );
        let role = role.to_string();
        client
            .query(&query, &[&store_id, &role])
            .await?
            .iter()
            .map(|row| store_record_from_row(kind, row))
            .collect()
    }

    async fn list_destroyed(
        &self,
        kind: DataObjectType,
        store_id: i64,
    ) -> Result<Vec<StoreRecord>, StoreError> {
        let client = self.pool.get().await?;
        let (table, _) = store_ref_table(kind);
        let columns = store_ref_columns(kind, "");
        let query = format!(
            "SELECT {columns} FROM {table} WHERE store_id = $1 AND destroyed = true ORDER BY id"
        );
        client
            .query(&query, &[&store_id])
            .await?
            .iter()
            .map(|row| store_record_from_row(kind, row))
            .collect()
    }

    async fn delete_primary_records_for_store(
        &self,
        kind: DataObjectType,
        store_id: i64,
    ) -> Result<u64, StoreError> {
        let client = self.pool.get().await?;
        let (table, _) = store_ref_table(kind);
        let query = format!("DELETE FROM {table} WHERE store_id = $1 AND store_role = $2");
        let role = DataStoreRole::Primary.to_string();
        Ok(client.execute(&query, &[&store_id, &role]).await?)
    }

    async fn update_download_state(
        &self,
        kind: DataObjectType,
        id: i64,
        state: DownloadState,
        pct: Option<i32>,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let (table, _) = store_ref_table(kind);
        let query = format!(
            "UPDATE {table} SET download_state = $1, \
             download_pct = COALESCE($2, download_pct) WHERE id = $3"
        );
        let state = state.to_string();
        let updated = client.execute(&query, &[&state, &pct, &id]).await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("{} store record {}", kind, id)));
        }
        Ok(())
    }

    async fn adjust_ref_count(
        &self,
        kind: DataObjectType,
        id: i64,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let client = self.pool.get().await?;
        let (table, _) = store_ref_table(kind);
        let query = format!(
            "UPDATE {table} SET ref_cnt = GREATEST(ref_cnt + $1, 0) WHERE id = $2 RETURNING ref_cnt"
        );
        let row = client
            .query_opt(&query, &[&delta, &id])
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{} store record {}", kind, id)))?;
        Ok(row.try_get(0)?)
    }
}

#[async_trait]
impl TransitionStore<VolumeRecord> for Database {
    async fn update_state(
        &self,
        record: &VolumeRecord,
        next: VolumeState,
        at: DateTime<Utc>,
        payload: Option<&TransitionPayload>,
    ) -> Result<bool, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let next_state = next.to_string();
        let current_state = record.state.to_string();

        let updated = tx
            .execute(
                "UPDATE volumes SET state = $1, updated_count = updated_count + 1, updated = $2 \
                 WHERE id = $3 AND state = $4 AND updated_count = $5",
                &[
                    &next_state,
                    &at,
                    &record.id,
                    &current_state,
                    &record.updated_count,
                ],
            )
            .await?;
        if updated == 0 {
            tx.rollback().await?;
            debug!(
                volume_id = record.id,
                expected_state = %current_state,
                expected_count = record.updated_count,
                "Conditional volume update matched no rows"
            );
            return Ok(false);
        }

        if let Some(payload) = payload
            && let Some(download) = &payload.download
        {
            let download_state = download.state.to_string();
            tx.execute(
                "UPDATE volume_store_ref SET download_state = $1, \
                 download_pct = COALESCE($2, download_pct), \
                 error_str = COALESCE($3, error_str), \
                 install_path = COALESCE($4, install_path), \
                 size = COALESCE($5, size), \
                 physical_size = COALESCE($6, physical_size) \
                 WHERE id = $7",
                &[
                    &download_state,
                    &download.pct,
                    &download.error,
                    &payload.install_path,
                    &payload.size,
                    &payload.physical_size,
                    &download.record_id,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl VolumeDao for Database {
    async fn find_volume(&self, id: i64) -> Result<Option<VolumeRecord>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE id = $1");
        client
            .query_opt(&query, &[&id])
            .await?
            .as_ref()
            .map(volume_from_row)
            .transpose()
    }

    async fn list_volumes_by_pool(&self, pool_id: i64) -> Result<Vec<VolumeRecord>, StoreError> {
        let client = self.pool.get().await?;
        let query =
            format!("SELECT {VOLUME_COLUMNS} FROM volumes WHERE pool_id = $1 ORDER BY id");
        client
            .query(&query, &[&pool_id])
            .await?
            .iter()
            .map(volume_from_row)
            .collect()
    }

    async fn list_pending_uploads(&self) -> Result<Vec<StoreRecord>, StoreError> {
        let client = self.pool.get().await?;
        let columns = store_ref_columns(DataObjectType::Volume, "r.");
        let query = format!(
            "SELECT {columns} FROM volume_store_ref r JOIN volumes v ON v.id = r.volume_id \
             WHERE v.state IN ('NotUploaded', 'UploadInProgress') AND r.destroyed = false \
             ORDER BY r.id"
        );
        client
            .query(&query, &[])
            .await?
            .iter()
            .map(|row| store_record_from_row(DataObjectType::Volume, row))
            .collect()
    }

    async fn update_volume_location(
        &self,
        volume_id: i64,
        location: &VolumeLocation,
    ) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE volumes SET path = $1, folder = $2, pod_id = $3, pool_id = $4, \
                 last_pool_id = $5 WHERE id = $6",
                &[
                    &location.path,
                    &location.folder,
                    &location.pod_id,
                    &location.pool_id,
                    &location.last_pool_id,
                    &volume_id,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("volume {}", volume_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl VmInstanceDao for Database {
    async fn find_vm(&self, id: i64) -> Result<Option<VmInstance>, StoreError> {
        let client = self.pool.get().await?;
        client
            .query_opt(
                "SELECT id, name, vm_type, state, host_id FROM vm_instances WHERE id = $1",
                &[&id],
            )
            .await?
            .as_ref()
            .map(vm_from_row)
            .transpose()
    }
}

#[async_trait]
impl StoragePoolWorkDao for Database {
    async fn find_work(&self, pool_id: i64, vm_id: i64) -> Result<Option<WorkItem>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {WORK_COLUMNS} FROM storage_pool_work WHERE pool_id = $1 AND vm_id = $2"
        );
        client
            .query_opt(&query, &[&pool_id, &vm_id])
            .await?
            .as_ref()
            .map(work_from_row)
            .transpose()
    }

    async fn create_work(
        &self,
        pool_id: i64,
        vm_id: i64,
        management_server_id: i64,
    ) -> Result<WorkItem, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "INSERT INTO storage_pool_work (pool_id, vm_id, management_server_id) \
             VALUES ($1, $2, $3) RETURNING {WORK_COLUMNS}"
        );
        let row = client
            .query_one(&query, &[&pool_id, &vm_id, &management_server_id])
            .await?;
        work_from_row(&row)
    }

    async fn update_work(&self, item: &WorkItem) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE storage_pool_work SET stopped_for_maintenance = $1, \
                 started_after_maintenance = $2, management_server_id = $3 WHERE id = $4",
                &[
                    &item.stopped_for_maintenance,
                    &item.started_after_maintenance,
                    &item.management_server_id,
                    &item.id,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("work item {}", item.id)));
        }
        Ok(())
    }

    async fn list_pending_for_prepare(
        &self,
        pool_id: i64,
        management_server_id: i64,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {WORK_COLUMNS} FROM storage_pool_work \
             WHERE pool_id = $1 AND management_server_id = $2 \
             AND stopped_for_maintenance = false ORDER BY id"
        );
        client
            .query(&query, &[&pool_id, &management_server_id])
            .await?
            .iter()
            .map(work_from_row)
            .collect()
    }

    async fn list_pending_for_cancel(
        &self,
        pool_id: i64,
        management_server_id: i64,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let client = self.pool.get().await?;
        let query = format!(
            "SELECT {WORK_COLUMNS} FROM storage_pool_work \
             WHERE pool_id = $1 AND management_server_id = $2 \
             AND stopped_for_maintenance = true AND started_after_maintenance = false \
             ORDER BY id"
        );
        client
            .query(&query, &[&pool_id, &management_server_id])
            .await?
            .iter()
            .map(work_from_row)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_columns_select_parent() {
        let columns = store_ref_columns(DataObjectType::Snapshot, "r.");
        assert!(columns.starts_with("r.id, r.snapshot_id AS object_id"));
        assert!(columns.ends_with("r.parent_snapshot_id"));
    }

    #[test]
    fn template_columns_synthesize_parent() {
        let columns = store_ref_columns(DataObjectType::Template, "");
        assert!(columns.contains("template_id AS object_id"));
        assert!(columns.ends_with("NULL::BIGINT AS parent_snapshot_id"));
    }

    #[test]
    fn parse_column_reports_bad_values() {
        let err = parse_column::<StoragePoolStatus>("status", "Sideways").unwrap_err();
        match err {
            StoreError::Decode { column, value } => {
                assert_eq!(column, "status");
                assert_eq!(value, "Sideways");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(
            parse_column::<ObjectInStoreState>("state", "Ready").unwrap(),
            ObjectInStoreState::Ready
        );
    }
}
