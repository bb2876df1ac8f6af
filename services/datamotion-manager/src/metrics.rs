// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Prometheus metrics for the data motion manager
//!
//! Exports metrics for:
//! - copy operations, by route and result
//! - cache object lifecycle and cleanup failures
//! - state machine conflicts and rejected events
//! - upload monitor activity
//! - pool maintenance failures

use prometheus::{Counter, CounterVec, Opts, Registry, TextEncoder};

// Static metric initialization uses expect because these are compile-time
// constant definitions that cannot fail in practice.
//
// This module exists to scope the clippy allow attributes to just the metric definitions.
#[allow(clippy::expect_used)]
mod metrics_impl {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        /// Registry for all manager metrics
        pub static ref REGISTRY: Registry = Registry::new();

        /// Copy operations by route (`object`, `volume_from_snapshot`, ...)
        /// and result (`success`, `failure`, `error`)
        pub static ref COPY_OPERATIONS: CounterVec = CounterVec::new(
            Opts::new(
                "datamotion_copy_operations_total",
                "Total copy operations handled by the data motion strategy"
            ),
            &["route", "result"]
        ).expect("valid metric name");

        /// Cache objects by action (`created`, `reused`, `released`, `deleted`)
        pub static ref CACHE_OBJECTS: CounterVec = CounterVec::new(
            Opts::new(
                "datamotion_cache_objects_total",
                "Image cache object lifecycle events"
            ),
            &["action"]
        ).expect("valid metric name");

        /// Staged copies that could not be released or deleted. The copy
        /// itself completed; the cache entry is left for garbage collection.
        pub static ref CACHE_CLEANUP_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "datamotion_cache_cleanup_failures_total",
                "Total failures releasing or deleting staged cache objects"
            )
        ).expect("valid metric name");

        pub static ref TRANSITION_CONFLICTS: CounterVec = CounterVec::new(
            Opts::new(
                "datamotion_transition_conflicts_total",
                "State transitions lost to a concurrent writer"
            ),
            &["machine"]
        ).expect("valid metric name");

        pub static ref ILLEGAL_TRANSITIONS: CounterVec = CounterVec::new(
            Opts::new(
                "datamotion_illegal_transitions_total",
                "Events fired in a state with no transition for them"
            ),
            &["machine"]
        ).expect("valid metric name");

        pub static ref UPLOAD_MONITOR_TICKS: Counter = Counter::with_opts(
            Opts::new(
                "datamotion_upload_monitor_ticks_total",
                "Upload monitor reconciliation passes"
            )
        ).expect("valid metric name");

        /// Upload status answers by reported status
        pub static ref UPLOAD_STATUS_UPDATES: CounterVec = CounterVec::new(
            Opts::new(
                "datamotion_upload_status_updates_total",
                "Upload status answers processed by the upload monitor"
            ),
            &["status"]
        ).expect("valid metric name");

        pub static ref MAINTENANCE_FAILURES: Counter = Counter::with_opts(
            Opts::new(
                "datamotion_maintenance_failures_total",
                "Storage pools that ended in ErrorInMaintenance"
            )
        ).expect("valid metric name");
    }
}

pub use metrics_impl::{
    CACHE_CLEANUP_FAILURES, CACHE_OBJECTS, COPY_OPERATIONS, ILLEGAL_TRANSITIONS,
    MAINTENANCE_FAILURES, REGISTRY, TRANSITION_CONFLICTS, UPLOAD_MONITOR_TICKS,
    UPLOAD_STATUS_UPDATES,
};

/// Register all metrics with the registry
///
/// Should be called once during application startup.
/// Panics if registration fails (indicates a programming error).
#[allow(clippy::expect_used)]
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(COPY_OPERATIONS.clone()))
        .expect("Failed to register COPY_OPERATIONS");
    REGISTRY
        .register(Box::new(CACHE_OBJECTS.clone()))
        .expect("Failed to register CACHE_OBJECTS");
    REGISTRY
        .register(Box::new(CACHE_CLEANUP_FAILURES.clone()))
        .expect("Failed to register CACHE_CLEANUP_FAILURES");
    REGISTRY
        .register(Box::new(TRANSITION_CONFLICTS.clone()))
        .expect("Failed to register TRANSITION_CONFLICTS");
    REGISTRY
        .register(Box::new(ILLEGAL_TRANSITIONS.clone()))
        .expect("Failed to register ILLEGAL_TRANSITIONS");
    REGISTRY
        .register(Box::new(UPLOAD_MONITOR_TICKS.clone()))
        .expect("Failed to register UPLOAD_MONITOR_TICKS");
    REGISTRY
        .register(Box::new(UPLOAD_STATUS_UPDATES.clone()))
        .expect("Failed to register UPLOAD_STATUS_UPDATES");
    REGISTRY
        .register(Box::new(MAINTENANCE_FAILURES.clone()))
        .expect("Failed to register MAINTENANCE_FAILURES");
}

/// Get metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_default()
}

pub fn record_copy(route: &str, result: &str) {
    COPY_OPERATIONS.with_label_values(&[route, result]).inc();
}

pub fn record_cache_object(action: &str) {
    CACHE_OBJECTS.with_label_values(&[action]).inc();
}

/// Record a staged object that could not be released or deleted
pub fn record_cache_cleanup_failure() {
    CACHE_CLEANUP_FAILURES.inc();
}

pub fn record_transition_conflict(machine: &str) {
    TRANSITION_CONFLICTS.with_label_values(&[machine]).inc();
}

pub fn record_illegal_transition(machine: &str) {
    ILLEGAL_TRANSITIONS.with_label_values(&[machine]).inc();
}

pub fn record_upload_monitor_tick() {
    UPLOAD_MONITOR_TICKS.inc();
}

pub fn record_upload_status(status: &str) {
    UPLOAD_STATUS_UPDATES.with_label_values(&[status]).inc();
}

pub fn record_maintenance_failure() {
    MAINTENANCE_FAILURES.inc();
}
