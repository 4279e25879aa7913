//! Splits a run into per-page work items.

use crate::db::RecordSource;
use crate::model::{ObjectType, WorkItem, SYNC_OBJECTS, TIME_FIELDS};
use crate::sync::WorkDistributor;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanParams {
    pub objects: Vec<ObjectType>,
    pub items_per_page: u64,
    pub cutoff: DateTime<Utc>,
    pub excluded_fields: BTreeSet<String>,
}

impl PlanParams {
    /// Plan over every syncable object type.
    pub fn new(items_per_page: u64, cutoff: DateTime<Utc>, excluded_fields: BTreeSet<String>) -> Self {
        Self {
            objects: SYNC_OBJECTS.to_vec(),
            items_per_page,
            cutoff,
            excluded_fields,
        }
    }
}

pub fn num_pages(total_count: u64, items_per_page: u64) -> u64 {
    total_count.div_ceil(items_per_page)
}

/// Count what changed since the cutoff and submit one item per page.
///
/// Each item carries `total_pages = num_pages + 1`; that value only feeds log
/// lines and is kept for parity with existing dashboards.
pub async fn generate_work(
    source: &dyn RecordSource,
    distributor: &dyn WorkDistributor,
    params: &PlanParams,
) -> Result<u64> {
    if params.items_per_page == 0 {
        return Err(anyhow!("items_per_page must be at least 1"));
    }

    let mut planned = 0;
    for &object in &params.objects {
        for time_field in TIME_FIELDS {
            let total_count = source.count(object, time_field, params.cutoff).await?;
            let pages = num_pages(total_count, params.items_per_page);
            debug!(object = %object, time_field = %time_field, total_count, pages, "planned partition");
            for page in 1..=pages {
                distributor
                    .submit(WorkItem {
                        object_type: object,
                        time_field,
                        page,
                        items_per_page: params.items_per_page,
                        cutoff: params.cutoff,
                        total_pages: pages + 1,
                        excluded_fields: params.excluded_fields.clone(),
                    })
                    .await?;
                planned += 1;
            }
        }
    }
    info!(planned, cutoff = %params.cutoff, "work planned");
    Ok(planned)
}
