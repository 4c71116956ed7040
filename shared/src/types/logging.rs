//! Log messages forwarded by devices

use serde::{Deserialize, Serialize};

/// Severity of a device log message; encoded as an integer on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl From<i32> for LogLevel {
    /// Unknown levels are treated as `Info`.
    fn from(level: i32) -> Self {
        match level {
            0 => LogLevel::Debug,
            2 => LogLevel::Warning,
            3 => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl From<LogLevel> for i32 {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        }
    }
}

/// Body of `POST /logging`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(rename = "Device", alias = "device")]
    pub device: String,

    #[serde(rename = "Text", alias = "text", default)]
    pub text: String,

    #[serde(rename = "Level", alias = "level", default = "default_level")]
    pub level: LogLevel,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_wire_integer() {
        let msg: LogMessage =
            serde_json::from_str(r#"{"Device":"Basel3","Text":"low battery","Level":2}"#).unwrap();
        assert_eq!(msg.level, LogLevel::Warning);
    }

    #[test]
    fn test_unknown_level_is_info() {
        let msg: LogMessage = serde_json::from_str(r#"{"Device":"d","Level":42}"#).unwrap();
        assert_eq!(msg.level, LogLevel::Info);
        assert!(msg.text.is_empty());
    }

    #[test]
    fn test_level_serializes_as_integer() {
        let value = serde_json::to_value(LogLevel::Error).unwrap();
        assert_eq!(value, serde_json::json!(3));
    }
}
