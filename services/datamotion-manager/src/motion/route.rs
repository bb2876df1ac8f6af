// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Copy routing and cache placement decisions

use datamotion_types::{DataStoreRole, Scope};

use crate::model::{DataObject, DataStore};

/// Which copy procedure handles a (source, destination) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CopyRoute {
    VolumeFromSnapshot,
    TemplateFromSnapshot,
    CloneVolume,
    MigrateVolume,
    VolumeBetweenPools,
    Snapshot,
    Object,
}

impl CopyRoute {
    /// Label used in logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            CopyRoute::VolumeFromSnapshot => "volume_from_snapshot",
            CopyRoute::TemplateFromSnapshot => "template_from_snapshot",
            CopyRoute::CloneVolume => "clone_volume",
            CopyRoute::MigrateVolume => "migrate_volume",
            CopyRoute::VolumeBetweenPools => "volume_between_pools",
            CopyRoute::Snapshot => "snapshot",
            CopyRoute::Object => "object",
        }
    }
}

pub fn route(src: &DataObject, dest: &DataObject) -> CopyRoute {
    match (src, dest) {
        (DataObject::Snapshot(_), DataObject::Volume(_)) => CopyRoute::VolumeFromSnapshot,
        (DataObject::Snapshot(_), DataObject::Template(_)) => CopyRoute::TemplateFromSnapshot,
        (DataObject::Snapshot(_), DataObject::Snapshot(_)) => CopyRoute::Snapshot,
        (DataObject::Template(_), DataObject::Volume(_)) => CopyRoute::CloneVolume,
        (DataObject::Volume(s), DataObject::Volume(d))
            if s.store.role == DataStoreRole::Primary && d.store.role == DataStoreRole::Primary =>
        {
            if s.volume_id == d.volume_id {
                CopyRoute::MigrateVolume
            } else {
                CopyRoute::VolumeBetweenPools
            }
        }
        (DataObject::Volume(_), DataObject::Volume(_))
        | (DataObject::Volume(_), DataObject::Snapshot(_))
        | (DataObject::Volume(_), DataObject::Template(_))
        | (DataObject::Template(_), DataObject::Template(_))
        | (DataObject::Template(_), DataObject::Snapshot(_)) => CopyRoute::Object,
    }
}

/// Whether a copy between the two stores has to go through an image cache.
///
/// Agents read and write NFS stores directly, and an ImageCache store is
/// itself the staging area.
pub fn needs_cache(src: &DataStore, dest: &DataStore) -> bool {
    !(src.is_nfs_backed() || dest.is_nfs_backed() || src.is_image_cache() || dest.is_image_cache())
}

/// The zone to stage a copy in: the source's if it names a concrete scope
/// inside one zone, otherwise the destination's.
pub fn pick_cache_scope(src: &DataStore, dest: &DataStore) -> Option<Scope> {
    let zone_of = |store: &DataStore| {
        store
            .scope
            .scope_id()
            .and_then(|_| store.scope.widen_to_zone())
    };

    let picked = zone_of(src).or_else(|| zone_of(dest));
    if picked.is_none() {
        tracing::warn!(
            src_store = src.id,
            src_scope = %src.scope,
            dest_store = dest.id,
            dest_scope = %dest.scope,
            "Neither store lies in a concrete zone, cannot pick a cache"
        );
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SnapshotObject, StoragePoolStatus, TemplateObject, VolumeObject};
    use datamotion_types::StoreProtocol;
    use strum::IntoEnumIterator;

    fn store(id: i64, role: DataStoreRole, protocol: StoreProtocol, scope: Scope) -> DataStore {
        DataStore {
            id,
            uuid: format!("store-{}", id),
            name: format!("store-{}", id),
            role,
            protocol,
            url: format!("{}://10.0.0.{}/x", protocol, id),
            path: None,
            scope,
            pod_id: None,
            status: StoragePoolStatus::Up,
        }
    }

    fn zone() -> Scope {
        Scope::Zone { zone_id: Some(1) }
    }

    fn volume(id: i64, role: DataStoreRole) -> DataObject {
        DataObject::Volume(VolumeObject {
            volume_id: id,
            name: format!("vol-{}", id),
            path: None,
            size: None,
            store: store(id, role, StoreProtocol::Nfs, zone()),
        })
    }

    fn snapshot() -> DataObject {
        DataObject::Snapshot(SnapshotObject {
            snapshot_id: 1,
            path: None,
            size: None,
            store: store(1, DataStoreRole::Image, StoreProtocol::S3, zone()),
            parent: None,
        })
    }

    fn template() -> DataObject {
        DataObject::Template(TemplateObject {
            template_id: 1,
            name: "tmpl".to_string(),
            path: None,
            size: None,
            store: store(1, DataStoreRole::Image, StoreProtocol::S3, zone()),
        })
    }

    #[test]
    fn routes_by_kind_pair() {
        let primary = volume(1, DataStoreRole::Primary);
        assert_eq!(route(&snapshot(), &primary), CopyRoute::VolumeFromSnapshot);
        assert_eq!(route(&snapshot(), &template()), CopyRoute::TemplateFromSnapshot);
        assert_eq!(route(&snapshot(), &snapshot()), CopyRoute::Snapshot);
        assert_eq!(route(&template(), &primary), CopyRoute::CloneVolume);
        assert_eq!(route(&primary, &template()), CopyRoute::Object);
        assert_eq!(route(&template(), &template()), CopyRoute::Object);
    }

    /// Test: volume pairs route on id only when both sides are primary
    #[test]
    fn volume_pairs_route_on_id_and_role() {
        let mut src = volume(1, DataStoreRole::Primary);
        let mut same = volume(1, DataStoreRole::Primary);
        if let DataObject::Volume(v) = &mut same {
            v.store.id = 2;
        }
        assert_eq!(route(&src, &same), CopyRoute::MigrateVolume);
        assert_eq!(
            route(&src, &volume(2, DataStoreRole::Primary)),
            CopyRoute::VolumeBetweenPools
        );
        assert_eq!(route(&src, &volume(1, DataStoreRole::Image)), CopyRoute::Object);
        if let DataObject::Volume(v) = &mut src {
            v.store.role = DataStoreRole::Image;
        }
        assert_eq!(route(&src, &same), CopyRoute::Object);
    }

    /// Test: caching is skipped iff either side is NFS or an image cache
    #[test]
    fn needs_cache_grid() {
        for src_protocol in StoreProtocol::iter() {
            for dest_protocol in StoreProtocol::iter() {
                for src_role in DataStoreRole::iter() {
                    for dest_role in DataStoreRole::iter() {
                        let src = store(1, src_role, src_protocol, zone());
                        let dest = store(2, dest_role, dest_protocol, zone());
                        let direct = src_protocol == StoreProtocol::Nfs
                            || dest_protocol == StoreProtocol::Nfs
                            || src_role == DataStoreRole::ImageCache
                            || dest_role == DataStoreRole::ImageCache;
                        assert_eq!(
                            needs_cache(&src, &dest),
                            !direct,
                            "{} {} -> {} {}",
                            src_role,
                            src_protocol,
                            dest_role,
                            dest_protocol
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn cache_scope_prefers_source_and_widens() {
        let cluster = store(
            1,
            DataStoreRole::Primary,
            StoreProtocol::Rbd,
            Scope::Cluster {
                cluster_id: 4,
                zone_id: 2,
            },
        );
        let global = store(
            2,
            DataStoreRole::Image,
            StoreProtocol::S3,
            Scope::Zone { zone_id: None },
        );

        assert_eq!(
            pick_cache_scope(&cluster, &global),
            Some(Scope::Zone { zone_id: Some(2) })
        );
        assert_eq!(
            pick_cache_scope(&global, &cluster),
            Some(Scope::Zone { zone_id: Some(2) })
        );
        assert_eq!(pick_cache_scope(&global, &global), None);
    }

    /// Test: a region-wide source stages in the destination's zone
    #[test]
    fn region_source_uses_destination_zone() {
        let region = store(
            1,
            DataStoreRole::Image,
            StoreProtocol::S3,
            Scope::Region { region_id: 1 },
        );
        let pool = store(
            2,
            DataStoreRole::Primary,
            StoreProtocol::Rbd,
            Scope::Cluster {
                cluster_id: 3,
                zone_id: 1,
            },
        );
        assert_eq!(
            pick_cache_scope(&region, &pool),
            Some(Scope::Zone { zone_id: Some(1) })
        );
        assert_eq!(
            pick_cache_scope(&pool, &region),
            Some(Scope::Zone { zone_id: Some(1) })
        );
        assert_eq!(pick_cache_scope(&region, &region), None);
    }
}
