#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use search_sync::db::RecordSource;
use search_sync::elastic::{IndexError, IndexStore};
use search_sync::model::{ObjectType, Record, RunReport, SearchDocument, TimeField, WorkItem};
use search_sync::render::FlatRenderer;
use search_sync::sync::WorkDistributor;
use search_sync::worker::SyncContext;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub fn cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Record source serving synthetic rows `1..=count` per (object, time field).
#[derive(Default)]
pub struct FakeSource {
    counts: HashMap<(ObjectType, TimeField), u64>,
    pub count_calls: Mutex<Vec<(ObjectType, TimeField)>>,
    pub fetches: Mutex<Vec<WorkItem>>,
    pub fail_fetch: bool,
}

impl FakeSource {
    pub fn with_counts(counts: &[(ObjectType, TimeField, u64)]) -> Self {
        Self {
            counts: counts.iter().map(|(o, t, c)| ((*o, *t), *c)).collect(),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_fetch: true,
            ..Default::default()
        }
    }

    pub async fn fetch_count(&self) -> usize {
        self.fetches.lock().await.len()
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    async fn count(&self, object: ObjectType, time_field: TimeField, _cutoff: DateTime<Utc>) -> Result<u64> {
        self.count_calls.lock().await.push((object, time_field));
        Ok(self.counts.get(&(object, time_field)).copied().unwrap_or(0))
    }

    async fn fetch_page(&self, item: &WorkItem) -> Result<Vec<Record>> {
        self.fetches.lock().await.push(item.clone());
        if self.fail_fetch {
            return Err(anyhow!("metadata store went away"));
        }
        let total = self
            .counts
            .get(&(item.object_type, item.time_field))
            .copied()
            .unwrap_or(0);
        let first = item.offset() + 1;
        let last = (item.offset() + item.items_per_page).min(total);
        Ok((first..=last)
            .map(|id| {
                json!({
                    "id": id,
                    "name": format!("{} {}", item.object_type, id),
                    "created": "2024-02-01 00:00:00",
                    "updated": "2024-02-02 00:00:00"
                })
                .as_object()
                .unwrap()
                .clone()
            })
            .collect())
    }
}

/// Index store that records bulk calls and replays scripted results.
#[derive(Default)]
pub struct RecordingStore {
    responses: Mutex<VecDeque<Result<(), IndexError>>>,
    pub bulk_calls: Mutex<Vec<Vec<SearchDocument>>>,
    pub schema_calls: AtomicU32,
    /// Preflight attempts that fail before the store comes up.
    connect_failures: AtomicU32,
    pub bulk_delay: Option<Duration>,
    pub always_retryable: bool,
}

impl RecordingStore {
    pub fn with_responses(responses: Vec<Result<(), IndexError>>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::from(responses)),
            ..Default::default()
        }
    }

    pub fn always_failing_bulk() -> Self {
        Self {
            always_retryable: true,
            ..Default::default()
        }
    }

    pub fn unreachable_for(attempts: u32) -> Self {
        Self {
            connect_failures: AtomicU32::new(attempts),
            ..Default::default()
        }
    }

    pub fn with_bulk_delay(delay: Duration) -> Self {
        Self {
            bulk_delay: Some(delay),
            ..Default::default()
        }
    }

    pub async fn bulk_count(&self) -> usize {
        self.bulk_calls.lock().await.len()
    }

    pub async fn indexed_ids(&self) -> Vec<String> {
        self.bulk_calls
            .lock()
            .await
            .iter()
            .flatten()
            .map(|d| d.id.clone())
            .collect()
    }
}

#[async_trait]
impl IndexStore for RecordingStore {
    async fn ensure_schema(&self) -> Result<(), IndexError> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(IndexError::Connectivity("connection refused".into()));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn bulk_upsert(&self, documents: &[SearchDocument]) -> Result<(), IndexError> {
        if let Some(delay) = self.bulk_delay {
            tokio::time::sleep(delay).await;
        }
        self.bulk_calls.lock().await.push(documents.to_vec());
        if self.always_retryable {
            return Err(IndexError::Retryable("503 Service Unavailable".into()));
        }
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

/// Distributor that only collects what the planner submits.
#[derive(Default)]
pub struct CollectingDistributor {
    pub items: Mutex<Vec<WorkItem>>,
}

#[async_trait]
impl WorkDistributor for CollectingDistributor {
    async fn submit(&self, item: WorkItem) -> Result<()> {
        self.items.lock().await.push(item);
        Ok(())
    }

    async fn drain_and_wait(&mut self) -> Result<RunReport> {
        Ok(RunReport::default())
    }
}

pub fn context(source: Arc<FakeSource>, store: Arc<RecordingStore>) -> SyncContext {
    SyncContext {
        source,
        renderer: Arc::new(FlatRenderer),
        store,
        max_attempts: 5,
    }
}

/// Index store whose bulk call panics, as a buggy client might.
#[derive(Default)]
pub struct PanickingStore;

#[async_trait]
impl IndexStore for PanickingStore {
    async fn ensure_schema(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), IndexError> {
        Ok(())
    }

    async fn bulk_upsert(&self, _documents: &[SearchDocument]) -> Result<(), IndexError> {
        panic!("bulk client blew up");
    }
}

pub fn panicking_context(source: Arc<FakeSource>) -> SyncContext {
    SyncContext {
        source,
        renderer: Arc::new(FlatRenderer),
        store: Arc::new(PanickingStore),
        max_attempts: 5,
    }
}
