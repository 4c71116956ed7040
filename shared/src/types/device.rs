//! Device and sensor registry types
//!
//! Field names follow the PascalCase JSON that deployed devices already send.
//! Lower-case aliases are accepted on input.

use serde::{Deserialize, Serialize};

/// Database identifier of a device or sensor
pub type RecordId = i64;

/// Default reporting interval (seconds) for newly registered devices
pub const DEFAULT_INTERVAL_SECS: f32 = 60.0;

/// Default number of samples a device buffers before uploading
pub const DEFAULT_BUFFER: i32 = 2;

/// Self-description a device sends when it boots
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDesc {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    /// Sensor names the device carries
    #[serde(rename = "Sensors", alias = "sensors", default)]
    pub sensors: Vec<String>,

    #[serde(rename = "Description", alias = "description", default)]
    pub description: String,
}

/// Body of `POST /init-device`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitDeviceRequest {
    #[serde(rename = "Device", alias = "device")]
    pub device: DeviceDesc,
}

/// A registered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "ID", alias = "id")]
    pub id: RecordId,

    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    /// Sampling interval in seconds
    #[serde(rename = "Interval", alias = "interval")]
    pub interval: f32,

    /// Samples buffered on the device between uploads
    #[serde(rename = "Buffer", alias = "buffer")]
    pub buffer: i32,

    #[serde(rename = "Description", alias = "description", default)]
    pub description: String,
}

impl Device {
    /// A device record that has not been assigned an id yet.
    pub fn unsaved(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            interval: DEFAULT_INTERVAL_SECS,
            buffer: DEFAULT_BUFFER,
            description: description.into(),
        }
    }
}

/// A sensor attached to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    #[serde(rename = "ID", alias = "id")]
    pub id: RecordId,

    #[serde(rename = "DeviceID", alias = "device_id")]
    pub device_id: RecordId,

    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    /// Calibration offset added to every stored value of this sensor
    #[serde(rename = "Offset", alias = "offset", default)]
    pub offset: f32,
}

/// Body of `POST /device/configure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureDeviceRequest {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    #[serde(rename = "Interval", alias = "interval")]
    pub interval: f32,

    #[serde(rename = "Buffer", alias = "buffer")]
    pub buffer: i32,
}

/// Body of `POST /sensor/configure`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureSensorRequest {
    /// Device name
    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    #[serde(rename = "SensorName", alias = "sensor_name")]
    pub sensor_name: String,

    #[serde(rename = "Offset", alias = "offset")]
    pub offset: f32,
}
