// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the data motion manager and the storage agents.
//!
//! The manager decides how volumes, snapshots, and templates move between
//! data stores; the agents running next to those stores carry out the
//! actual copies. This crate holds everything that crosses that boundary:
//! store and object descriptors, placement scopes, commands, and answers.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, VariantNames};

// ============================================================================
// Stores and Objects
// ============================================================================

/// Kind of data object that can be placed in a data store.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum DataObjectType {
    Volume,
    Snapshot,
    Template,
}

/// Role a data store plays in the storage topology.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum DataStoreRole {
    /// Hypervisor-attached storage pool
    Primary,
    /// Secondary, long-term store for templates, snapshots and uploads
    Image,
    /// Ephemeral zone-local staging store
    ImageCache,
}

/// Backend protocol of a data store.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum StoreProtocol {
    Nfs,
    Cifs,
    S3,
    Swift,
    Rbd,
    Iscsi,
    Local,
}

impl StoreProtocol {
    /// Whether agents can mount the store as a plain filesystem.
    pub fn is_filesystem(self) -> bool {
        matches!(self, StoreProtocol::Nfs | StoreProtocol::Cifs)
    }
}

/// Placement granularity of a store or resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Scope {
    Host {
        host_id: i64,
        cluster_id: i64,
        zone_id: i64,
    },
    Cluster {
        cluster_id: i64,
        zone_id: i64,
    },
    /// A zone; `zone_id` is absent for stores that span every zone.
    Zone { zone_id: Option<i64> },
    Region { region_id: i64 },
}

impl Scope {
    /// The concrete id of this scope, if it names one.
    pub fn scope_id(&self) -> Option<i64> {
        match self {
            Scope::Host { host_id, .. } => Some(*host_id),
            Scope::Cluster { cluster_id, .. } => Some(*cluster_id),
            Scope::Zone { zone_id } => *zone_id,
            Scope::Region { region_id } => Some(*region_id),
        }
    }

    /// The zone enclosing this scope.
    pub fn zone_id(&self) -> Option<i64> {
        match self {
            Scope::Host { zone_id, .. } | Scope::Cluster { zone_id, .. } => Some(*zone_id),
            Scope::Zone { zone_id } => *zone_id,
            Scope::Region { .. } => None,
        }
    }

    /// Widen host and cluster scopes to their enclosing zone.
    ///
    /// Cache stores are provisioned per zone, so this is the granularity used
    /// to find or create one. A region has no single enclosing zone and
    /// yields `None`.
    pub fn widen_to_zone(&self) -> Option<Scope> {
        match self {
            Scope::Host { zone_id, .. } | Scope::Cluster { zone_id, .. } => Some(Scope::Zone {
                zone_id: Some(*zone_id),
            }),
            Scope::Zone { .. } => Some(*self),
            Scope::Region { .. } => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Host { host_id, .. } => write!(f, "host {}", host_id),
            Scope::Cluster { cluster_id, .. } => write!(f, "cluster {}", cluster_id),
            Scope::Zone { zone_id: Some(id) } => write!(f, "zone {}", id),
            Scope::Zone { zone_id: None } => write!(f, "all zones"),
            Scope::Region { region_id } => write!(f, "region {}", region_id),
        }
    }
}

/// Serialized description of a data store, as handed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DataStoreTO {
    pub id: i64,
    pub uuid: String,
    pub role: DataStoreRole,
    pub protocol: StoreProtocol,
    pub url: String,
    /// Mount path on the hypervisor, for primary pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DataStoreTO {
    /// Whether the store is NFS-backed and can be copied to or from
    /// directly.
    pub fn is_nfs(&self) -> bool {
        self.protocol == StoreProtocol::Nfs
    }
}

/// Serialized description of a data object in a particular store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DataTO {
    pub object_type: DataObjectType,
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Install path relative to the store root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Path of the parent snapshot, so agents can resolve backing chains
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    pub store: DataStoreTO,
}

// ============================================================================
// Commands
// ============================================================================

/// Copy a data object from one store to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CopyCommand {
    pub src: DataTO,
    pub dest: DataTO,
    /// Hint cache location the agent may stage through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<DataTO>,
    /// Advisory timeout enforced by the agent
    pub wait_secs: u64,
    pub execute_in_sequence: bool,
}

impl CopyCommand {
    pub fn new(src: DataTO, dest: DataTO, wait_secs: u64, execute_in_sequence: bool) -> Self {
        Self {
            src,
            dest,
            cache: None,
            wait_secs,
            execute_in_sequence,
        }
    }

    /// Attach a cache descriptor to the command.
    pub fn with_cache(mut self, cache: DataTO) -> Self {
        self.cache = Some(cache);
        self
    }
}

/// Move a volume between primary pools without an intermediate copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MigrateVolumeCommand {
    pub volume_id: i64,
    pub volume_path: String,
    pub pool: DataStoreTO,
    pub wait_secs: u64,
    pub execute_in_sequence: bool,
}

/// Remove a data object from its store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeleteCommand {
    pub data: DataTO,
}

/// Ask an agent how far along an upload is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UploadStatusCommand {
    pub entity_id: i64,
    pub entity_type: DataObjectType,
}

/// Register (`add`) or remove the storage heartbeat for a pool on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ModifyStoragePoolCommand {
    pub add: bool,
    pub pool: DataStoreTO,
}

/// Every command the manager sends to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Copy(CopyCommand),
    MigrateVolume(MigrateVolumeCommand),
    Delete(DeleteCommand),
    UploadStatus(UploadStatusCommand),
    ModifyStoragePool(ModifyStoragePoolCommand),
}

impl Command {
    /// Short name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Copy(_) => "copy",
            Command::MigrateVolume(_) => "migrate_volume",
            Command::Delete(_) => "delete",
            Command::UploadStatus(_) => "upload_status",
            Command::ModifyStoragePool(_) => "modify_storage_pool",
        }
    }
}

// ============================================================================
// Answers
// ============================================================================

/// Upload progress as reported by an agent.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Display, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Completed,
    InProgress,
    Error,
    Unknown,
}

/// Command-specific part of an answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerPayload {
    #[default]
    None,
    Copy {
        new_data: DataTO,
    },
    MigrateVolume {
        volume_path: String,
    },
    UploadStatus {
        status: UploadStatus,
        #[serde(default)]
        download_pct: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        install_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        physical_size: Option<i64>,
    },
}

/// Result of a command executed by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Answer {
    pub result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub payload: AnswerPayload,
}

impl Answer {
    pub fn success() -> Self {
        Self {
            result: true,
            details: None,
            payload: AnswerPayload::None,
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            result: false,
            details: Some(details.into()),
            payload: AnswerPayload::None,
        }
    }

    pub fn with_payload(mut self, payload: AnswerPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Details text, or a placeholder when the agent sent none.
    pub fn details_or_default(&self) -> &str {
        self.details.as_deref().unwrap_or("no details")
    }

    /// The object as the agent created it, for copy answers.
    pub fn new_data(&self) -> Option<&DataTO> {
        match &self.payload {
            AnswerPayload::Copy { new_data } => Some(new_data),
            _ => None,
        }
    }

    /// The volume's path after migration, for migrate answers.
    pub fn volume_path(&self) -> Option<&str> {
        match &self.payload {
            AnswerPayload::MigrateVolume { volume_path } => Some(volume_path),
            _ => None,
        }
    }
}
