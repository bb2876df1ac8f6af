// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Guard over objects staged in an image cache for one copy.

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::cache::CacheManager;
use crate::metrics;
use crate::model::DataObject;

/// What to do with staged objects once the copy is over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Drop our reference and leave the entry for reuse
    Release,
    /// Tear the entry down
    Delete,
}

/// Cache entries created for a copy that must be released or deleted when
/// the copy ends.
///
/// Call [`StagedCache::settle`] on every exit. A guard dropped unsettled
/// (early return, cancelled future) spawns a delete of everything it holds.
pub struct StagedCache {
    cache: Arc<dyn CacheManager>,
    objects: Vec<DataObject>,
    settled: bool,
}

impl StagedCache {
    pub fn new(cache: Arc<dyn CacheManager>) -> Self {
        Self {
            cache,
            objects: Vec::new(),
            settled: false,
        }
    }

    pub fn push(&mut self, object: DataObject) {
        self.objects.push(object);
    }

    /// Release or delete every staged object, newest first.
    ///
    /// Failures are logged and counted; the copy's outcome does not depend
    /// on cleanup.
    pub async fn settle(mut self, disposition: Disposition) {
        self.settled = true;
        let objects = std::mem::take(&mut self.objects);
        for object in objects.iter().rev() {
            let result = match disposition {
                Disposition::Release => self.cache.release_cache_object(object).await,
                Disposition::Delete => self.cache.delete_cache_object(object).await,
            };
            if let Err(e) = result {
                tracing::warn!(
                    object = %object,
                    ?disposition,
                    error = %e,
                    "Failed to clean up staged cache object"
                );
                metrics::record_cache_cleanup_failure();
            }
        }
    }
}

impl Drop for StagedCache {
    fn drop(&mut self) {
        if self.settled || self.objects.is_empty() {
            return;
        }
        let objects = std::mem::take(&mut self.objects);

        let Ok(handle) = Handle::try_current() else {
            tracing::warn!(
                count = objects.len(),
                "Staged cache objects dropped outside a runtime, leaving them for garbage collection"
            );
            for _ in &objects {
                metrics::record_cache_cleanup_failure();
            }
            return;
        };

        tracing::warn!(
            count = objects.len(),
            "Staged cache dropped without being settled, deleting in background"
        );
        let cache = Arc::clone(&self.cache);
        handle.spawn(async move {
            for object in objects.iter().rev() {
                if let Err(e) = cache.delete_cache_object(object).await {
                    tracing::warn!(
                        object = %object,
                        error = %e,
                        "Failed to delete abandoned cache object"
                    );
                    metrics::record_cache_cleanup_failure();
                }
            }
        });
    }
}
