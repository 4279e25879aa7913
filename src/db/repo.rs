use crate::model::{ObjectType, Record, TimeField};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Number, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, SqlitePool, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

/// Timestamp layout used by the metadata store (`CURRENT_TIMESTAMP` style, UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", database_url))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database {}", database_url))?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(?err, dir = %parent.display(), "failed to create database directory");
            }
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub fn format_cutoff(cutoff: DateTime<Utc>) -> String {
    cutoff.format(TIMESTAMP_FORMAT).to_string()
}

#[instrument(skip_all, fields(object = %object, time_field = %time_field))]
pub async fn count_newer(
    pool: &Pool,
    object: ObjectType,
    time_field: TimeField,
    cutoff: DateTime<Utc>,
) -> Result<u64> {
    let sql = format!(
        "SELECT COUNT(*) FROM \"{}\" WHERE \"{}\" > ?",
        object.table(),
        time_field.column()
    );
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(format_cutoff(cutoff))
        .fetch_one(pool)
        .await
        .with_context(|| format!("failed to count {} by {}", object, time_field))?;
    u64::try_from(count).map_err(|_| anyhow!("negative count {} for {}", count, object))
}

/// Up to `limit` rows newer than `cutoff`, ordered by primary key, skipping `offset`.
#[instrument(skip_all, fields(object = %object, time_field = %time_field, offset = offset))]
pub async fn fetch_page(
    pool: &Pool,
    object: ObjectType,
    time_field: TimeField,
    cutoff: DateTime<Utc>,
    limit: u64,
    offset: u64,
) -> Result<Vec<Record>> {
    let sql = format!(
        "SELECT * FROM \"{}\" WHERE \"{}\" > ? ORDER BY \"{}\" LIMIT ? OFFSET ?",
        object.table(),
        time_field.column(),
        object.primary_key()
    );
    let limit = i64::try_from(limit).context("page size out of range")?;
    let offset = i64::try_from(offset).context("page offset out of range")?;
    let rows = sqlx::query(&sql)
        .bind(format_cutoff(cutoff))
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
        .with_context(|| format!("failed to fetch {} rows at offset {}", object, offset))?;
    rows.iter().map(row_to_record).collect()
}

/// Map a row into a JSON object using each value's storage class.
fn row_to_record(row: &SqliteRow) -> Result<Record> {
    let mut record = Record::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let raw = row.try_get_raw(idx)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" => Value::from(row.try_get_unchecked::<i64, _>(idx)?),
                "REAL" => Number::from_f64(row.try_get_unchecked::<f64, _>(idx)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BLOB" => Value::String(
                    String::from_utf8_lossy(&row.try_get_unchecked::<Vec<u8>, _>(idx)?)
                        .into_owned(),
                ),
                _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}
