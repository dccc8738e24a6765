// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner record storage.
//!
//! The store is the only shared mutable state in the fleet. It enforces the
//! record invariants that do not depend on timing: handle type matches mode,
//! `running` has a handle, `removed` has none, no two runners share a live
//! handle, mode is write-once and rows are never deleted.

pub mod sqlite;

pub use self::sqlite::SqliteRunnerStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{RunnerEvent, RunnerId, RunnerRecord};

/// Persistence for runner records and their transition history.
#[async_trait]
pub trait RunnerStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, record: &RunnerRecord) -> Result<()>;

    /// Fetch a record by id.
    async fn get(&self, id: RunnerId) -> Result<Option<RunnerRecord>>;

    /// Fetch a record by its registered name.
    async fn find_by_name(&self, name: &str) -> Result<Option<RunnerRecord>>;

    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<RunnerRecord>>;

    /// Records not in `removed`, oldest first.
    async fn list_active(&self) -> Result<Vec<RunnerRecord>>;

    /// Overwrite the mutable fields of an existing record.
    ///
    /// Fails with `RunnerNotFound` for unknown ids and `ModeImmutable` if
    /// `record.mode` differs from the stored mode.
    async fn update(&self, record: &RunnerRecord) -> Result<()>;

    /// Append a transition to the runner's history.
    async fn record_event(&self, event: &RunnerEvent) -> Result<()>;

    /// Transition history of a runner, oldest first.
    async fn list_events(&self, id: RunnerId) -> Result<Vec<RunnerEvent>>;
}
