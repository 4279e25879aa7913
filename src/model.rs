use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// One raw row from the metadata store, keyed by column name.
pub type Record = Map<String, Value>;

/// Record categories that are mirrored into the search index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Keys,
    Values,
    Groups,
    Institutions,
    Instruments,
    Projects,
    Users,
    Transactions,
}

/// Sync order used by the planner.
pub const SYNC_OBJECTS: [ObjectType; 8] = [
    ObjectType::Keys,
    ObjectType::Values,
    ObjectType::Groups,
    ObjectType::Institutions,
    ObjectType::Instruments,
    ObjectType::Projects,
    ObjectType::Users,
    ObjectType::Transactions,
];

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Keys => "keys",
            ObjectType::Values => "values",
            ObjectType::Groups => "groups",
            ObjectType::Institutions => "institutions",
            ObjectType::Instruments => "instruments",
            ObjectType::Projects => "projects",
            ObjectType::Users => "users",
            ObjectType::Transactions => "transactions",
        }
    }

    /// Backing table in the metadata store.
    pub fn table(&self) -> &'static str {
        self.as_str()
    }

    pub fn primary_key(&self) -> &'static str {
        "id"
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamp dimension that made a record eligible for a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeField {
    Created,
    Updated,
}

pub const TIME_FIELDS: [TimeField; 2] = [TimeField::Created, TimeField::Updated];

impl TimeField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeField::Created => "created",
            TimeField::Updated => "updated",
        }
    }

    /// Column holding this timestamp.
    pub fn column(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for TimeField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single page of one object type along one time dimension.
///
/// Items are plain values: executing one needs nothing but the item itself and the
/// record source / index store handles, which is what lets them travel through the
/// broker table as JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub object_type: ObjectType,
    pub time_field: TimeField,
    /// 1-based.
    pub page: u64,
    pub items_per_page: u64,
    /// Records with `time_field` strictly after this instant are included.
    pub cutoff: DateTime<Utc>,
    /// Logging only.
    pub total_pages: u64,
    pub excluded_fields: BTreeSet<String>,
}

impl WorkItem {
    /// Row offset of the first record on this page.
    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1) * self.items_per_page
    }
}

/// A rendered document ready for a bulk `index` action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchDocument {
    pub id: String,
    pub source: Value,
}

/// Outcome totals for one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub planned: u64,
    pub succeeded: u64,
    /// Gave up after the retry budget ran out.
    pub abandoned: u64,
    /// Hit a non-retryable error.
    pub failed: u64,
}

impl RunReport {
    pub fn merge(&mut self, other: &RunReport) {
        self.succeeded += other.succeeded;
        self.abandoned += other.abandoned;
        self.failed += other.failed;
    }

    pub fn is_clean(&self) -> bool {
        self.abandoned == 0 && self.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(page: u64) -> WorkItem {
        WorkItem {
            object_type: ObjectType::Projects,
            time_field: TimeField::Updated,
            page,
            items_per_page: 100,
            cutoff: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            total_pages: 4,
            excluded_fields: BTreeSet::from(["description".to_string()]),
        }
    }

    #[test]
    fn offset_is_zero_based() {
        assert_eq!(item(1).offset(), 0);
        assert_eq!(item(3).offset(), 200);
    }

    #[test]
    fn work_item_serializes_with_snake_case_tags() {
        let value = serde_json::to_value(item(2)).unwrap();
        assert_eq!(value["object_type"], "projects");
        assert_eq!(value["time_field"], "updated");
        let back: WorkItem = serde_json::from_value(value).unwrap();
        assert_eq!(back, item(2));
    }

    #[test]
    fn report_merge_keeps_planned() {
        let mut total = RunReport {
            planned: 10,
            ..Default::default()
        };
        total.merge(&RunReport {
            planned: 99,
            succeeded: 7,
            abandoned: 2,
            failed: 1,
        });
        assert_eq!(total.planned, 10);
        assert_eq!(total.succeeded, 7);
        assert!(!total.is_clean());
    }
}
