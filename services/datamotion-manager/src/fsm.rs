// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Table-driven lifecycle state machines
//!
//! A [`StateMachine`] maps `(state, event)` to the next state. Applying a
//! transition never writes the state column blindly: the backing
//! [`TransitionStore`] updates the row only if it still holds the state and
//! `updated_count` the caller loaded, and bumps the count. Exactly one of
//! two concurrent transitions loaded from the same version can win; the
//! loser sees `false` and must reload.
//!
//! Each object kind gets its own table, see [`object_in_store_machine`] and
//! [`volume_machine`].

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use datamotion_types::{Answer, DataObjectType};
use lazy_static::lazy_static;
use tracing::{debug, warn};

use crate::db::StoreError;
use crate::metrics;
use crate::model::{
    DownloadState, ObjectInStoreEvent, ObjectInStoreState, StoreRecord, VolumeEvent, VolumeRecord,
    VolumeState,
};

/// A persisted record whose lifecycle is driven by a [`StateMachine`].
pub trait Stateful: fmt::Debug + Send + Sync {
    type State: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync;

    fn id(&self) -> i64;
    fn state(&self) -> Self::State;
    fn updated_count(&self) -> i64;

    /// Mirror a committed transition onto the in-memory copy.
    fn apply_transition(
        &mut self,
        next: Self::State,
        at: DateTime<Utc>,
        payload: Option<&TransitionPayload>,
    );
}

/// Extra fields written together with a successful transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPayload {
    pub install_path: Option<String>,
    pub size: Option<i64>,
    pub physical_size: Option<i64>,
    /// Download bookkeeping on the volume-in-store record, written in the
    /// same transaction as a volume transition
    pub download: Option<DownloadUpdate>,
}

impl TransitionPayload {
    /// Location and size of the object an agent reported creating.
    pub fn from_answer(answer: &Answer) -> Self {
        match answer.new_data() {
            Some(data) => Self {
                install_path: data.path.clone(),
                size: data.size,
                ..Default::default()
            },
            None => Self::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadUpdate {
    pub record_id: i64,
    pub state: DownloadState,
    pub pct: Option<i32>,
    pub error: Option<String>,
}

/// Conditional state write for one record type.
#[async_trait]
pub trait TransitionStore<R: Stateful>: Send + Sync {
    /// Move `record` to `next` if the stored row still matches its id, state
    /// and `updated_count`. Returns whether a row was updated.
    async fn update_state(
        &self,
        record: &R,
        next: R::State,
        at: DateTime<Utc>,
        payload: Option<&TransitionPayload>,
    ) -> Result<bool, StoreError>;
}

/// `(state, event) -> state` lookup table.
pub struct StateMachine<S, E> {
    name: &'static str,
    transitions: HashMap<(S, E), S>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync,
    E: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            transitions: HashMap::new(),
        }
    }

    pub fn with_transition(mut self, from: S, event: E, to: S) -> Self {
        self.transitions.insert((from, event), to);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn next_state(&self, from: S, event: E) -> Option<S> {
        self.transitions.get(&(from, event)).copied()
    }

    /// Events accepted in `from`.
    pub fn events_from(&self, from: S) -> Vec<E> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == from)
            .map(|(_, event)| *event)
            .collect()
    }

    /// Fire `event` against `record`.
    ///
    /// Returns `Ok(true)` when the transition was committed, in which case
    /// `record` now reflects the new state and version. Returns `Ok(false)`
    /// without touching the record when the table has no entry for the pair
    /// or when another writer got there first.
    pub async fn transition<R, D>(
        &self,
        record: &mut R,
        event: E,
        payload: Option<&TransitionPayload>,
        store: &D,
    ) -> Result<bool, StoreError>
    where
        R: Stateful<State = S>,
        D: TransitionStore<R> + ?Sized,
    {
        let current = record.state();
        let Some(next) = self.next_state(current, event) else {
            warn!(
                machine = self.name,
                record_id = record.id(),
                state = %current,
                event = %event,
                accepted = ?self.events_from(current),
                record = ?record,
                "No transition from current state for event, record left unchanged"
            );
            metrics::record_illegal_transition(self.name);
            return Ok(false);
        };

        let now = Utc::now();
        if store.update_state(record, next, now, payload).await? {
            debug!(
                machine = self.name,
                record_id = record.id(),
                from = %current,
                to = %next,
                event = %event,
                "State transition applied"
            );
            record.apply_transition(next, now, payload);
            Ok(true)
        } else {
            warn!(
                machine = self.name,
                record_id = record.id(),
                expected_state = %current,
                expected_count = record.updated_count(),
                next = %next,
                event = %event,
                "Record changed underneath us, transition not applied"
            );
            metrics::record_transition_conflict(self.name);
            Ok(false)
        }
    }
}

impl Stateful for StoreRecord {
    type State = ObjectInStoreState;

    fn id(&self) -> i64 {
        self.id
    }

    fn state(&self) -> ObjectInStoreState {
        self.state
    }

    fn updated_count(&self) -> i64 {
        self.updated_count
    }

    fn apply_transition(
        &mut self,
        next: ObjectInStoreState,
        at: DateTime<Utc>,
        payload: Option<&TransitionPayload>,
    ) {
        if self.marks_destroyed_on(next) {
            self.destroyed = true;
        }
        if let Some(payload) = payload {
            if let Some(path) = &payload.install_path {
                self.install_path = Some(path.clone());
            }
            if let Some(size) = payload.size {
                self.size = size;
            }
            if let Some(physical_size) = payload.physical_size {
                self.physical_size = physical_size;
            }
        }
        self.state = next;
        self.updated_count += 1;
        self.updated = Some(at);
    }
}

impl Stateful for VolumeRecord {
    type State = VolumeState;

    fn id(&self) -> i64 {
        self.id
    }

    fn state(&self) -> VolumeState {
        self.state
    }

    fn updated_count(&self) -> i64 {
        self.updated_count
    }

    fn apply_transition(
        &mut self,
        next: VolumeState,
        at: DateTime<Utc>,
        _payload: Option<&TransitionPayload>,
    ) {
        self.state = next;
        self.updated_count += 1;
        self.updated = Some(at);
    }
}

pub type ObjectInStoreMachine = StateMachine<ObjectInStoreState, ObjectInStoreEvent>;
pub type VolumeMachine = StateMachine<VolumeState, VolumeEvent>;

fn object_in_store_table(name: &'static str) -> ObjectInStoreMachine {
    use ObjectInStoreEvent::*;
    use ObjectInStoreState::*;

    StateMachine::new(name)
        .with_transition(Allocated, CreateRequested, Creating)
        .with_transition(Allocated, CreateOnlyRequested, Created)
        .with_transition(Allocated, DestroyRequested, Destroying)
        .with_transition(Creating, OperationSucceeded, Ready)
        .with_transition(Creating, OperationFailed, Allocated)
        .with_transition(Creating, OperationTimeout, Failed)
        .with_transition(Creating, DestroyRequested, Destroying)
        .with_transition(Created, OperationSucceeded, Ready)
        .with_transition(Created, OperationFailed, Allocated)
        .with_transition(Created, DestroyRequested, Destroying)
        .with_transition(Ready, CopyingRequested, Copying)
        .with_transition(Ready, MigrationRequested, Migrating)
        .with_transition(Ready, DestroyRequested, Destroying)
        .with_transition(Copying, OperationSucceeded, Ready)
        .with_transition(Copying, OperationFailed, Ready)
        .with_transition(Migrating, OperationSucceeded, Ready)
        .with_transition(Migrating, OperationFailed, Ready)
        .with_transition(Destroying, DestroyRequested, Destroying)
        .with_transition(Destroying, OperationSucceeded, Destroyed)
        .with_transition(Destroying, OperationFailed, Destroying)
        .with_transition(Failed, DestroyRequested, Destroying)
}

fn volume_table() -> VolumeMachine {
    use VolumeEvent::*;
    use VolumeState::*;

    StateMachine::new("volume")
        .with_transition(NotUploaded, UploadRequested, UploadInProgress)
        .with_transition(NotUploaded, OperationSucceeded, Uploaded)
        .with_transition(NotUploaded, OperationFailed, UploadError)
        .with_transition(NotUploaded, OperationTimeout, UploadAbandoned)
        .with_transition(UploadInProgress, OperationSucceeded, Uploaded)
        .with_transition(UploadInProgress, OperationFailed, UploadError)
        .with_transition(UploadInProgress, OperationTimeout, UploadAbandoned)
}

lazy_static! {
    static ref VOLUME_IN_STORE: ObjectInStoreMachine = object_in_store_table("volume_in_store");
    static ref SNAPSHOT_IN_STORE: ObjectInStoreMachine =
        object_in_store_table("snapshot_in_store");
    // Template creation may be re-requested while an agent is still
    // downloading.
    static ref TEMPLATE_IN_STORE: ObjectInStoreMachine = object_in_store_table(
        "template_in_store"
    )
    .with_transition(
        ObjectInStoreState::Creating,
        ObjectInStoreEvent::CreateRequested,
        ObjectInStoreState::Creating
    );
    static ref VOLUME: VolumeMachine = volume_table();
}

/// Lifecycle table for objects of `kind` placed in a store.
pub fn object_in_store_machine(kind: DataObjectType) -> &'static ObjectInStoreMachine {
    match kind {
        DataObjectType::Volume => &VOLUME_IN_STORE,
        DataObjectType::Snapshot => &SNAPSHOT_IN_STORE,
        DataObjectType::Template => &TEMPLATE_IN_STORE,
    }
}

/// Lifecycle table for the volume itself.
pub fn volume_machine() -> &'static VolumeMachine {
    &VOLUME
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryDatabase, ObjectInStoreDao};
    use crate::model::{DataStore, NewStoreRecord, StoragePoolStatus};
    use datamotion_types::{DataStoreRole, Scope, StoreProtocol};
    use strum::IntoEnumIterator;

    fn cache_store() -> DataStore {
        DataStore {
            id: 5,
            uuid: "cache-5".to_string(),
            name: "cache-5".to_string(),
            role: DataStoreRole::ImageCache,
            protocol: StoreProtocol::Nfs,
            url: "nfs://10.0.0.5/cache".to_string(),
            path: None,
            scope: Scope::Zone { zone_id: Some(1) },
            pod_id: None,
            status: StoragePoolStatus::Up,
        }
    }

    async fn allocated(db: &MemoryDatabase, kind: DataObjectType) -> StoreRecord {
        db.create_store_record(NewStoreRecord::new(kind, 11, &cache_store()))
            .await
            .unwrap()
    }

    // -------------------------------------------------------------------------
    // Table lookups
    // -------------------------------------------------------------------------

    #[test]
    fn create_then_succeed_reaches_ready() {
        let machine = object_in_store_machine(DataObjectType::Volume);
        let creating = machine
            .next_state(
                ObjectInStoreState::Allocated,
                ObjectInStoreEvent::CreateRequested,
            )
            .unwrap();
        assert_eq!(creating, ObjectInStoreState::Creating);
        assert_eq!(
            machine.next_state(creating, ObjectInStoreEvent::OperationSucceeded),
            Some(ObjectInStoreState::Ready)
        );
    }

    #[test]
    fn only_templates_accept_repeated_create() {
        for kind in [DataObjectType::Volume, DataObjectType::Snapshot] {
            assert_eq!(
                object_in_store_machine(kind).next_state(
                    ObjectInStoreState::Creating,
                    ObjectInStoreEvent::CreateRequested
                ),
                None
            );
        }
        assert_eq!(
            object_in_store_machine(DataObjectType::Template).next_state(
                ObjectInStoreState::Creating,
                ObjectInStoreEvent::CreateRequested
            ),
            Some(ObjectInStoreState::Creating)
        );
    }

    #[test]
    fn destroyed_is_terminal() {
        let machine = object_in_store_machine(DataObjectType::Snapshot);
        assert!(machine.events_from(ObjectInStoreState::Destroyed).is_empty());
    }

    // -------------------------------------------------------------------------
    // Transitions against the store
    // -------------------------------------------------------------------------

    /// Test: a legal transition bumps the version and persists the state
    #[tokio::test]
    async fn legal_transition_bumps_version() {
        let db = MemoryDatabase::new();
        let mut record = allocated(&db, DataObjectType::Volume).await;
        let machine = object_in_store_machine(DataObjectType::Volume);

        let applied = machine
            .transition(
                &mut record,
                ObjectInStoreEvent::CreateRequested,
                None,
                &db,
            )
            .await
            .unwrap();

        assert!(applied);
        assert_eq!(record.state, ObjectInStoreState::Creating);
        assert_eq!(record.updated_count, 1);
        let stored = db
            .find_store_record(DataObjectType::Volume, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, record);
    }

    /// Test: success payload lands in the record
    #[tokio::test]
    async fn success_payload_updates_install_path() {
        let db = MemoryDatabase::new();
        let mut record = allocated(&db, DataObjectType::Template).await;
        let machine = object_in_store_machine(DataObjectType::Template);
        machine
            .transition(&mut record, ObjectInStoreEvent::CreateRequested, None, &db)
            .await
            .unwrap();

        let payload = TransitionPayload {
            install_path: Some("template/tmpl/1/11".to_string()),
            size: Some(4096),
            ..Default::default()
        };
        assert!(
            machine
                .transition(
                    &mut record,
                    ObjectInStoreEvent::OperationSucceeded,
                    Some(&payload),
                    &db
                )
                .await
                .unwrap()
        );

        let stored = db
            .find_store_record(DataObjectType::Template, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.install_path.as_deref(), Some("template/tmpl/1/11"));
        assert_eq!(stored.size, 4096);
        assert_eq!(stored.state, ObjectInStoreState::Ready);
    }

    /// Test: of two writers loaded from the same version only one wins
    #[tokio::test]
    async fn concurrent_transitions_admit_one_winner() {
        let db = MemoryDatabase::new();
        let record = allocated(&db, DataObjectType::Volume).await;
        let machine = object_in_store_machine(DataObjectType::Volume);

        let mut first = record.clone();
        let mut second = record.clone();
        let (a, b) = tokio::join!(
            machine.transition(&mut first, ObjectInStoreEvent::CreateRequested, None, &db),
            machine.transition(&mut second, ObjectInStoreEvent::DestroyRequested, None, &db),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(a ^ b, "exactly one transition must win");
        let stored = db
            .find_store_record(DataObjectType::Volume, record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.updated_count, record.updated_count + 1);
        let loser = if a { &second } else { &first };
        assert_eq!(loser, &record, "loser keeps its stale copy");
    }

    /// Test: every pair missing from the table is rejected without a write
    #[tokio::test]
    async fn illegal_pairs_never_write() {
        let db = MemoryDatabase::new();
        let machine = object_in_store_machine(DataObjectType::Snapshot);

        for state in ObjectInStoreState::iter() {
            for event in ObjectInStoreEvent::iter() {
                if machine.next_state(state, event).is_some() {
                    continue;
                }
                let mut record = allocated(&db, DataObjectType::Snapshot).await;
                db.force_store_state(DataObjectType::Snapshot, record.id, state);
                record.state = state;
                let before = record.clone();

                let applied = machine
                    .transition(&mut record, event, None, &db)
                    .await
                    .unwrap();

                assert!(!applied, "{} + {} must be rejected", state, event);
                assert_eq!(record, before);
                let stored = db
                    .find_store_record(DataObjectType::Snapshot, record.id)
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(stored.updated_count, before.updated_count);
                assert_eq!(stored.state, state);
            }
        }
    }

    /// Test: templates are flagged destroyed, snapshots are not
    #[tokio::test]
    async fn destroyed_flag_follows_kind() {
        let db = MemoryDatabase::new();
        for (kind, flagged) in [
            (DataObjectType::Template, true),
            (DataObjectType::Snapshot, false),
        ] {
            let mut record = allocated(&db, kind).await;
            let machine = object_in_store_machine(kind);
            for event in [
                ObjectInStoreEvent::DestroyRequested,
                ObjectInStoreEvent::OperationSucceeded,
            ] {
                assert!(machine.transition(&mut record, event, None, &db).await.unwrap());
            }
            let stored = db.find_store_record(kind, record.id).await.unwrap().unwrap();
            assert_eq!(stored.state, ObjectInStoreState::Destroyed);
            assert_eq!(stored.destroyed, flagged);
        }
    }
}
