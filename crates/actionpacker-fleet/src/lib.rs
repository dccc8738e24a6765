// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! ActionPacker Fleet - Runner Lifecycle & Reconciliation
//!
//! This crate creates, starts, monitors, stops and removes self-hosted
//! GitHub Actions runners across two execution backends, and keeps the
//! recorded fleet converged with what the host and GitHub actually report.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Callers (API surface, schedulers)                    │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                  │ create / start / stop / remove
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        FleetEngine (this crate)                      │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────────┐  │
//! │  │  Process   │  │ Container  │  │   Status   │  │    Orphan      │  │
//! │  │  Backend   │  │  Backend   │  │    Sync    │  │    Tracker     │  │
//! │  └────────────┘  └────────────┘  └────────────┘  └────────────────┘  │
//! │        per-runner locks  ·  startup gate  ·  reconcile worker        │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │                  │                 │
//!        ▼                  ▼                 ▼
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────────────────────────┐
//! │ host procs  │   │  docker CLI  │   │ GitHub (actionpacker-github)    │
//! │ (run.sh)    │   │              │   │ tokens, listing, de-register    │
//! └─────────────┘   └──────────────┘   └─────────────────────────────────┘
//!                          │
//!                          ▼
//!              ┌──────────────────────────┐
//!              │  SQLite record store     │
//!              │  (runners, runner_events)│
//!              └──────────────────────────┘
//! ```
//!
//! # Runner States
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `pending` | Record created, nothing provisioned yet |
//! | `configuring` | Agent downloaded/configured or image pulled |
//! | `starting` | Process or container launching |
//! | `running` | Backend resource confirmed alive |
//! | `stopping` | Graceful stop in progress |
//! | `stopped` | Resource exists but is not running |
//! | `removed` | Resources deleted and de-registered (terminal) |
//! | `orphaned` | Resource vanished while GitHub still lists the runner |
//! | `error` | An operation failed; see `last_error` |
//!
//! # Reconciliation
//!
//! | Pass | When | What |
//! |------|------|------|
//! | Startup | Once, before lifecycle calls are accepted | Every runner ends confirmed live or settled |
//! | Periodic | Every `reconcile_interval` | Status sync, then orphan scan and termination |
//! | On demand | [`FleetEngine::sync_runner_status`] | Single-runner status sync |

#![deny(missing_docs)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod orphan_tracker;
pub mod reconcile_worker;
pub mod record;
pub mod runtime;
pub mod startup;
pub mod status_sync;
pub mod store;

pub use config::FleetConfig;
pub use engine::{CreateRunnerRequest, EngineConfig, FleetEngine};
pub use error::{Error, LifecycleStep, Result};
pub use orphan_tracker::{OrphanReason, OrphanRecord, OrphanReport};
pub use reconcile_worker::{ReconcileReport, ReconcileWorker, ReconcileWorkerConfig};
pub use record::{BackendHandle, RunnerEvent, RunnerId, RunnerMode, RunnerRecord, RunnerStatus};
pub use runtime::FleetRuntime;
pub use startup::StartupReport;
pub use store::{RunnerStore, SqliteRunnerStore};
