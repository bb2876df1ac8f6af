// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Data motion manager
//!
//! Moves storage objects (volumes, snapshots, templates) between data
//! stores by sending copy commands to host agents, staging through image
//! caches when neither side can be reached directly. Also tracks user
//! volume uploads and drains primary pools for maintenance.

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod endpoint;
pub mod fsm;
pub mod maintenance;
pub mod metrics;
pub mod model;
pub mod motion;
pub mod upload_monitor;
pub mod workload;
