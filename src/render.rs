//! Turns raw metadata rows into search documents.

use crate::model::{ObjectType, Record, SearchDocument};
use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeSet;

pub trait DocumentRenderer: Send + Sync {
    fn render(
        &self,
        object: ObjectType,
        records: &[Record],
        excluded_fields: &BTreeSet<String>,
    ) -> Result<Vec<SearchDocument>>;
}

/// One flat document per row.
///
/// The document id is `{object}_{primary key}` so re-syncing the same row replaces
/// the previous copy. `created`/`updated` are exposed as `created_date` /
/// `updated_date` to line up with the index mapping, and a `type` field carries the
/// object name.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatRenderer;

impl FlatRenderer {
    fn render_one(
        object: ObjectType,
        record: &Record,
        excluded_fields: &BTreeSet<String>,
    ) -> Result<SearchDocument> {
        let pk = object.primary_key();
        let key = match record.get(pk) {
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => return Err(anyhow!("{} record without a usable {}", object, pk)),
        };

        let mut source = serde_json::Map::new();
        for (column, value) in record {
            let field = match column.as_str() {
                "created" => "created_date",
                "updated" => "updated_date",
                other => other,
            };
            if excluded_fields.contains(field) || excluded_fields.contains(column) {
                continue;
            }
            source.insert(field.to_string(), value.clone());
        }
        source.insert("type".into(), Value::from(object.as_str()));

        Ok(SearchDocument {
            id: format!("{}_{}", object, key),
            source: Value::Object(source),
        })
    }
}

impl DocumentRenderer for FlatRenderer {
    fn render(
        &self,
        object: ObjectType,
        records: &[Record],
        excluded_fields: &BTreeSet<String>,
    ) -> Result<Vec<SearchDocument>> {
        records
            .iter()
            .map(|record| Self::render_one(object, record, excluded_fields))
            .collect()
    }
}
