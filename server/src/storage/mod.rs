//! Storage backends
//!
//! The core talks to two collaborators: the device/sensor registry
//! ([`DeviceStore`]) and the append-only measurement sink
//! ([`TimeseriesSink`]). Both are trait objects constructed once in `main`
//! and shared by the HTTP handlers and the flush scheduler.

#[cfg(feature = "clickhouse-storage")]
pub mod clickhouse;
pub mod memory;
pub mod sqlite;

use crate::config::StorageConfig;
use async_trait::async_trait;
use iotedge_shared::{Device, DeviceDesc, LogMessage, RecordId, Sensor, Series};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    pub fn device_not_found(name: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "device",
            name: name.into(),
        }
    }

    pub fn sensor_not_found(name: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "sensor",
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Backend(format!("storage task failed: {}", e))
    }
}

/// Run a storage call with a deadline; expiry surfaces as [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Device and sensor registry
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Return the device with `desc.name`, creating it with default interval
    /// and buffer if it does not exist yet.
    async fn get_or_create_device(&self, desc: &DeviceDesc) -> Result<Device, StoreError>;

    async fn get_device(&self, name: &str) -> Result<Device, StoreError>;

    async fn get_sensors(&self, device_id: RecordId) -> Result<Vec<Sensor>, StoreError>;

    /// Register a sensor; `sensor.id` is ignored and assigned by the store.
    async fn insert_sensor(&self, sensor: &Sensor) -> Result<Sensor, StoreError>;

    /// Persist interval, buffer and description of an existing device.
    async fn configure_device(&self, device: &Device) -> Result<(), StoreError>;

    /// Persist the offset of an existing sensor.
    async fn configure_sensor(&self, sensor: &Sensor) -> Result<(), StoreError>;

    async fn insert_log(&self, message: &LogMessage) -> Result<(), StoreError>;
}

/// Append-only measurement store.
///
/// Re-inserting a series that was partially written must be safe: the flush
/// scheduler retries whole series.
#[async_trait]
pub trait TimeseriesSink: Send + Sync {
    async fn insert(&self, series: &Series) -> Result<(), StoreError>;

    /// Connectivity probe run once at startup. Default is a no-op.
    async fn check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Flush anything the backend buffers internally. Default is a no-op.
    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Registry and sink handles built from the storage configuration
pub struct Storage {
    pub devices: Arc<dyn DeviceStore>,
    pub sink: Arc<dyn TimeseriesSink>,
}

/// Open the configured backend.
pub async fn open(config: &StorageConfig) -> Result<Storage, StoreError> {
    match config {
        StorageConfig::Memory => {
            tracing::warn!("using in-memory storage, data is lost on exit");
            let store = Arc::new(memory::MemoryStore::new());
            Ok(Storage {
                devices: store.clone(),
                sink: store,
            })
        }
        StorageConfig::Sqlite { path } => {
            tracing::info!("SQLite storage at {}", path);
            let store = Arc::new(sqlite::SqliteStore::open(path)?);
            Ok(Storage {
                devices: store.clone(),
                sink: store,
            })
        }
        #[cfg(feature = "clickhouse-storage")]
        StorageConfig::ClickHouse {
            endpoint,
            database,
            registry_path,
        } => {
            let registry = sqlite::SqliteStore::open(registry_path)?;
            let sink = clickhouse::ClickHouseSink::new(endpoint, database, registry.clone()).await?;
            tracing::info!("ClickHouse storage enabled: {} / {}", endpoint, database);
            Ok(Storage {
                devices: Arc::new(registry),
                sink: Arc::new(sink),
            })
        }
        #[cfg(not(feature = "clickhouse-storage"))]
        StorageConfig::ClickHouse { .. } => Err(StoreError::Backend(
            "ClickHouse storage requires the clickhouse-storage feature".into(),
        )),
    }
}

/// Values of `series` with a sensor's calibration offset applied.
pub(crate) fn calibrated_values(series: &Series, offset: Option<f32>) -> Vec<f64> {
    match offset {
        Some(offset) if offset != 0.0 => series.values.iter().map(|v| v + offset as f64).collect(),
        _ => series.values.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_calibrated_values() {
        let series = Series::single("t1", Utc::now(), 20.0);
        assert_eq!(calibrated_values(&series, Some(-4.0)), vec![16.0]);
        assert_eq!(calibrated_values(&series, None), vec![20.0]);
    }

    #[tokio::test]
    async fn test_open_memory_shares_one_store() {
        let storage = open(&StorageConfig::Memory).await.unwrap();
        let desc = DeviceDesc {
            name: "dev".to_string(),
            ..Default::default()
        };
        storage.devices.get_or_create_device(&desc).await.unwrap();
        storage.sink.check().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result: Result<(), StoreError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(StoreError::Timeout(Duration::from_millis(10))));
    }
}
