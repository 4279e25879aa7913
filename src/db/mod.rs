//! Metadata store access.
//!
//! - `repo`: SQL-only functions over a SQLite pool that map rows into [`Record`]s.
//! - [`RecordSource`]: the seam the planner and workers read through, so tests can
//!   substitute an in-memory source.

pub mod repo;

pub use repo::*;

use crate::model::{ObjectType, Record, TimeField, WorkItem};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Number of `object` records whose `time_field` is after `cutoff`.
    async fn count(
        &self,
        object: ObjectType,
        time_field: TimeField,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    /// The records on `item`'s page, ordered by primary key.
    async fn fetch_page(&self, item: &WorkItem) -> Result<Vec<Record>>;
}

/// [`RecordSource`] backed by the metadata SQLite database.
#[derive(Debug, Clone)]
pub struct SqlRecordSource {
    pool: Pool,
}

impl SqlRecordSource {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSource for SqlRecordSource {
    async fn count(
        &self,
        object: ObjectType,
        time_field: TimeField,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        repo::count_newer(&self.pool, object, time_field, cutoff).await
    }

    async fn fetch_page(&self, item: &WorkItem) -> Result<Vec<Record>> {
        repo::fetch_page(
            &self.pool,
            item.object_type,
            item.time_field,
            item.cutoff,
            item.items_per_page,
            item.offset(),
        )
        .await
    }
}
