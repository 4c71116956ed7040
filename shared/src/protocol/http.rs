//! HTTP routes and response envelopes

use serde::{Deserialize, Serialize};

/// Default port of the ingestion API
pub const HTTP_PORT: u16 = 3004;

pub const URI_INIT_DEVICE: &str = "/init-device";
pub const URI_UPDATE_SENSOR: &str = "/update-sensor";
pub const URI_DEVICE_CONFIGURE: &str = "/device/configure";
pub const URI_SENSOR_CONFIGURE: &str = "/sensor/configure";
pub const URI_UPLOAD_DATA: &str = "/upload-data";
pub const URI_SAVE_TIMESERIES: &str = "/timeseries/save";
pub const URI_LOGGING: &str = "/logging";

pub const STATUS_OK: &str = "OK";
pub const STATUS_BUSY: &str = "Busy";
pub const STATUS_ERROR: &str = "Error";

/// Generic `{Status, Answer}` response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "Status")]
    pub status: String,

    #[serde(rename = "Answer")]
    pub answer: serde_json::Value,
}

impl Output {
    pub fn ok(answer: impl Into<serde_json::Value>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            answer: answer.into(),
        }
    }

    pub fn busy() -> Self {
        Self {
            status: STATUS_BUSY.to_string(),
            answer: "server busy, retry later".into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR.to_string(),
            answer: serde_json::Value::String(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// One reading in a direct sensor-value submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorValue {
    #[serde(rename = "Name", alias = "name")]
    pub name: String,

    #[serde(rename = "Value", alias = "value")]
    pub value: f32,
}

/// Body of `POST /update-sensor`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorValues {
    #[serde(rename = "Tags", alias = "tags", default)]
    pub tags: Vec<String>,

    #[serde(rename = "Data", alias = "data", default)]
    pub data: Vec<SensorValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_envelope() {
        let body = serde_json::to_string(&Output::ok("Okay")).unwrap();
        assert_eq!(body, r#"{"Status":"OK","Answer":"Okay"}"#);
        assert!(!Output::busy().is_ok());
    }

    #[test]
    fn test_sensor_values_decode() {
        let json = r#"{"Tags":["room1"],"Data":[{"Name":"Temp","Value":21.5}]}"#;
        let values: SensorValues = serde_json::from_str(json).unwrap();
        assert_eq!(values.data[0].name, "Temp");
        assert_eq!(values.data[0].value, 21.5);
    }
}
