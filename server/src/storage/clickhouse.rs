//! ClickHouse measurement sink
//!
//! Measurements go to a plain MergeTree sorted by (tag, timestamp_ms); samples
//! sharing a tag and millisecond are all kept. Each series is sent as a
//! single insert block. Sensor offsets come from the SQLite registry.

use super::sqlite::SqliteStore;
use super::{calibrated_values, StoreError, TimeseriesSink};
use async_trait::async_trait;
use clickhouse::{Client, Row};
use iotedge_shared::utils::time::to_unix_millis;
use iotedge_shared::Series;
use serde::{Deserialize, Serialize};
use std::time::Instant;

const TABLE_NAME: &str = "iotedge_measurements";

const DEFAULT_TABLE_ENGINE: &str = "\
MergeTree() \
PARTITION BY toYYYYMM(fromUnixTimestamp64Milli(timestamp_ms)) \
ORDER BY (tag, timestamp_ms) \
SETTINGS index_granularity = 8192";

/// One row in the measurements table (matches ClickHouse schema).
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub tag: String,
    /// Milliseconds since Unix epoch
    pub timestamp_ms: i64,
    pub value: f64,
    pub comment: String,
}

impl From<clickhouse::error::Error> for StoreError {
    fn from(e: clickhouse::error::Error) -> Self {
        StoreError::Backend(format!("clickhouse: {}", e))
    }
}

pub struct ClickHouseSink {
    client: Client,
    table: String,
    registry: SqliteStore,
}

impl ClickHouseSink {
    /// Connect and create the measurements table if needed.
    pub async fn new(endpoint: &str, database: &str, registry: SqliteStore) -> Result<Self, StoreError> {
        let mut client = Client::default()
            .with_url(endpoint)
            .with_database(database)
            .with_option("connect_timeout", "10")
            .with_option("receive_timeout", "30");
        if let Ok(password) = std::env::var("IOTEDGE_CLICKHOUSE_PASSWORD") {
            client = client.with_user("default").with_password(password);
        }

        let sink = Self {
            client,
            table: TABLE_NAME.to_string(),
            registry,
        };
        sink.ensure_table().await?;
        Ok(sink)
    }

    async fn ensure_table(&self) -> Result<(), StoreError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tag String,
                timestamp_ms Int64,
                value Float64,
                comment String
            ) ENGINE = {}",
            self.table, DEFAULT_TABLE_ENGINE
        );
        self.client.query(&ddl).execute().await?;
        Ok(())
    }

    fn rows(series: &Series, offset: Option<f32>) -> Vec<MeasurementRow> {
        let values = calibrated_values(series, offset);
        series
            .timestamps
            .iter()
            .zip(values)
            .enumerate()
            .map(|(i, (timestamp, value))| MeasurementRow {
                tag: series.tag.clone(),
                timestamp_ms: to_unix_millis(timestamp),
                value,
                comment: series.comment(i).unwrap_or_default().to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl TimeseriesSink for ClickHouseSink {
    async fn insert(&self, series: &Series) -> Result<(), StoreError> {
        let offset = self.registry.sensor_offset(&series.tag).await?;
        let rows = Self::rows(series, offset);
        let start = Instant::now();

        let mut insert = self.client.insert(&self.table)?;
        for row in &rows {
            insert.write(row).await?;
        }
        insert.end().await?;

        tracing::debug!(
            tag = %series.tag,
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "inserted series into ClickHouse"
        );
        Ok(())
    }

    async fn check(&self) -> Result<(), StoreError> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_rows_apply_offset_and_comments() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut series = Series::single("t1", ts, 10.0);
        series.push(ts + chrono::Duration::milliseconds(50), 11.0);
        series.comments = vec!["a".to_string()];

        let rows = ClickHouseSink::rows(&series, Some(1.5));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].value, 11.5);
        assert_eq!(rows[1].timestamp_ms - rows[0].timestamp_ms, 50);
        assert_eq!(rows[0].comment, "a");
        assert_eq!(rows[1].comment, "");
    }
}
