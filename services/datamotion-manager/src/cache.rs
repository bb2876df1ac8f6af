// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Image cache staging
//!
//! Stores that agents cannot read directly (object stores, block protocols)
//! are copied through an ImageCache store in the zone first. Cache entries
//! are placement records in the cache store and are reference counted: every
//! create or get takes a reference, release drops one, delete tears the
//! entry down regardless.

use std::sync::Arc;

use async_trait::async_trait;
use datamotion_types::{Command, CopyCommand, DataStoreRole, DeleteCommand, Scope};
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::MotionSettings;
use crate::db::{Persistence, StoreError};
use crate::endpoint::{EndpointError, EndpointSelector};
use crate::fsm::{TransitionPayload, object_in_store_machine};
use crate::metrics;
use crate::model::{DataObject, DataStore, NewStoreRecord, ObjectInStoreEvent, ObjectInStoreState};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("No image cache store for scope {0}")]
    NoCacheStore(Scope),

    #[error("No endpoint available for {0}")]
    NoEndpoint(String),

    #[error("Agent failed to {action} {object}: {details}")]
    Remote {
        action: &'static str,
        object: String,
        details: String,
    },

    #[error("Cache entry for {0} changed underneath us")]
    Conflict(String),

    #[error(transparent)]
    Endpoint(#[from] EndpointError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Staging area management for copies that need an intermediate hop.
#[async_trait]
pub trait CacheManager: Send + Sync {
    /// An ImageCache store for `scope`, or `None` if the zone has none.
    async fn get_cache_storage(&self, scope: &Scope) -> Result<Option<DataStore>, CacheError>;

    /// Copy `object` into a cache store picked for `scope`.
    async fn create_cache_object(
        &self,
        object: &DataObject,
        scope: &Scope,
    ) -> Result<DataObject, CacheError>;

    /// Copy `object` into `store`, or take a reference on the existing copy.
    async fn create_cache_object_in(
        &self,
        object: &DataObject,
        store: &DataStore,
    ) -> Result<DataObject, CacheError>;

    /// Reserve a cache slot for `object` without copying it. The agent fills
    /// it as a side effect of the command the slot is attached to.
    async fn get_cache_object(
        &self,
        object: &DataObject,
        scope: &Scope,
    ) -> Result<DataObject, CacheError>;

    /// Drop one reference. A missing entry is not an error.
    async fn release_cache_object(&self, cached: &DataObject) -> Result<(), CacheError>;

    /// Tear the entry down. A missing entry is not an error.
    async fn delete_cache_object(&self, cached: &DataObject) -> Result<(), CacheError>;
}

/// Cache manager backed by the placement tables, allocating a random
/// ImageCache store in the requested zone.
pub struct StorageCacheManager {
    db: Arc<dyn Persistence>,
    selector: Arc<dyn EndpointSelector>,
    settings: watch::Receiver<MotionSettings>,
}

impl StorageCacheManager {
    pub fn new(
        db: Arc<dyn Persistence>,
        selector: Arc<dyn EndpointSelector>,
        settings: watch::Receiver<MotionSettings>,
    ) -> Self {
        Self {
            db,
            selector,
            settings,
        }
    }

    async fn require_cache_storage(&self, scope: &Scope) -> Result<DataStore, CacheError> {
        self.get_cache_storage(scope)
            .await?
            .ok_or(CacheError::NoCacheStore(*scope))
    }
}

#[async_trait]
impl CacheManager for StorageCacheManager {
    async fn get_cache_storage(&self, scope: &Scope) -> Result<Option<DataStore>, CacheError> {
        let Scope::Zone {
            zone_id: Some(zone_id),
        } = scope
        else {
            tracing::warn!(%scope, "Image cache allocation only supports zone scope");
            return Ok(None);
        };

        let mut stores = self
            .db
            .list_data_stores(DataStoreRole::ImageCache, *zone_id)
            .await?;
        stores.shuffle(&mut rand::rng());
        Ok(stores.into_iter().next())
    }

    async fn create_cache_object(
        &self,
        object: &DataObject,
        scope: &Scope,
    ) -> Result<DataObject, CacheError> {
        let store = self.require_cache_storage(scope).await?;
        self.create_cache_object_in(object, &store).await
    }

    async fn create_cache_object_in(
        &self,
        object: &DataObject,
        store: &DataStore,
    ) -> Result<DataObject, CacheError> {
        let kind = object.object_type();
        let machine = object_in_store_machine(kind);

        let existing = self
            .db
            .find_by_store_object(kind, store.id, store.role, object.id())
            .await?;
        let mut record = match existing {
            Some(record) if record.state == ObjectInStoreState::Ready => {
                self.db.adjust_ref_count(kind, record.id, 1).await?;
                metrics::record_cache_object("reused");
                tracing::debug!(object = %object, cache_store = store.id, "Reusing cached copy");
                return Ok(object.placed_in(store, record.install_path));
            }
            Some(record) => record,
            None => {
                self.db
                    .create_store_record(NewStoreRecord::for_object(object, store))
                    .await?
            }
        };

        if !machine
            .transition(
                &mut record,
                ObjectInStoreEvent::CreateRequested,
                None,
                self.db.as_ref(),
            )
            .await?
        {
            return Err(CacheError::Conflict(object.to_string()));
        }

        let dest = object.placed_in(store, None);
        let Some(endpoint) = self.selector.select_for_copy(object, &dest).await else {
            machine
                .transition(
                    &mut record,
                    ObjectInStoreEvent::OperationFailed,
                    None,
                    self.db.as_ref(),
                )
                .await?;
            return Err(CacheError::NoEndpoint(object.to_string()));
        };

        let settings = self.settings.borrow().clone();
        let command = Command::Copy(CopyCommand::new(
            object.to_descriptor(),
            dest.to_descriptor(),
            settings.primary_storage_download_wait,
            settings.execute_in_sequence,
        ));

        let answer = match endpoint.send_message(&command).await {
            Ok(answer) if answer.result => answer,
            Ok(answer) => {
                machine
                    .transition(
                        &mut record,
                        ObjectInStoreEvent::OperationFailed,
                        None,
                        self.db.as_ref(),
                    )
                    .await?;
                return Err(CacheError::Remote {
                    action: "stage",
                    object: object.to_string(),
                    details: answer.details_or_default().to_string(),
                });
            }
            Err(e) => {
                machine
                    .transition(
                        &mut record,
                        ObjectInStoreEvent::OperationFailed,
                        None,
                        self.db.as_ref(),
                    )
                    .await?;
                return Err(e.into());
            }
        };

        let payload = TransitionPayload::from_answer(&answer);
        if !machine
            .transition(
                &mut record,
                ObjectInStoreEvent::OperationSucceeded,
                Some(&payload),
                self.db.as_ref(),
            )
            .await?
        {
            return Err(CacheError::Conflict(object.to_string()));
        }
        self.db.adjust_ref_count(kind, record.id, 1).await?;
        metrics::record_cache_object("created");

        tracing::info!(
            object = %object,
            cache_store = store.id,
            path = ?record.install_path,
            "Staged object in image cache"
        );
        Ok(object.placed_in(store, record.install_path))
    }

    async fn get_cache_object(
        &self,
        object: &DataObject,
        scope: &Scope,
    ) -> Result<DataObject, CacheError> {
        let store = self.require_cache_storage(scope).await?;
        let kind = object.object_type();

        let record = match self
            .db
            .find_by_store_object(kind, store.id, store.role, object.id())
            .await?
        {
            Some(record) => {
                metrics::record_cache_object("reused");
                record
            }
            None => {
                let mut record = self
                    .db
                    .create_store_record(NewStoreRecord::for_object(object, &store))
                    .await?;
                if !object_in_store_machine(kind)
                    .transition(
                        &mut record,
                        ObjectInStoreEvent::CreateOnlyRequested,
                        None,
                        self.db.as_ref(),
                    )
                    .await?
                {
                    return Err(CacheError::Conflict(object.to_string()));
                }
                metrics::record_cache_object("created");
                record
            }
        };

        self.db.adjust_ref_count(kind, record.id, 1).await?;
        Ok(object.placed_in(&store, record.install_path))
    }

    async fn release_cache_object(&self, cached: &DataObject) -> Result<(), CacheError> {
        let kind = cached.object_type();
        let store = cached.store();
        let Some(record) = self
            .db
            .find_by_store_object(kind, store.id, store.role, cached.id())
            .await?
        else {
            tracing::debug!(object = %cached, "Released cache entry no longer exists");
            return Ok(());
        };

        let remaining = self.db.adjust_ref_count(kind, record.id, -1).await?;
        metrics::record_cache_object("released");
        tracing::debug!(object = %cached, remaining, "Released cache entry");
        Ok(())
    }

    async fn delete_cache_object(&self, cached: &DataObject) -> Result<(), CacheError> {
        destroy_object(self.db.as_ref(), self.selector.as_ref(), cached).await?;
        metrics::record_cache_object("deleted");
        Ok(())
    }
}

/// Drive the placement record of `object` to Destroyed and have an agent
/// remove the data. Does nothing if the record is already gone.
///
/// A failed delete leaves the record in Destroying for garbage collection.
pub(crate) async fn destroy_object(
    db: &dyn Persistence,
    selector: &dyn EndpointSelector,
    object: &DataObject,
) -> Result<(), CacheError> {
    let kind = object.object_type();
    let store = object.store();
    let machine = object_in_store_machine(kind);

    let Some(mut record) = db
        .find_by_store_object(kind, store.id, store.role, object.id())
        .await?
    else {
        tracing::debug!(object = %object, "Nothing to delete");
        return Ok(());
    };

    if !machine
        .transition(&mut record, ObjectInStoreEvent::DestroyRequested, None, db)
        .await?
    {
        return Err(CacheError::Conflict(object.to_string()));
    }

    let Some(endpoint) = selector.select_for_store(store).await else {
        return Err(CacheError::NoEndpoint(object.to_string()));
    };

    let command = Command::Delete(DeleteCommand {
        data: object.to_descriptor(),
    });
    let failure = match endpoint.send_message(&command).await {
        Ok(answer) if answer.result => None,
        Ok(answer) => Some(CacheError::Remote {
            action: "delete",
            object: object.to_string(),
            details: answer.details_or_default().to_string(),
        }),
        Err(e) => Some(e.into()),
    };

    match failure {
        None => {
            machine
                .transition(&mut record, ObjectInStoreEvent::OperationSucceeded, None, db)
                .await?;
            tracing::debug!(object = %object, "Deleted object");
            Ok(())
        }
        Some(e) => {
            machine
                .transition(&mut record, ObjectInStoreEvent::OperationFailed, None, db)
                .await?;
            Err(e)
        }
    }
}
