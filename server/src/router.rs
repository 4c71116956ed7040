//! Topic router: turns an MQTT publication into a buffered sample.
//!
//! Topics follow `<prefix...>/<tag>/data`; the tag is the second-to-last
//! segment regardless of how deep the prefix is.

use crate::buffer::AggregationBuffer;
use crate::metrics;
use chrono::Utc;
use iotedge_shared::Sample;
use std::sync::Arc;

const MIN_TOPIC_SEGMENTS: usize = 3;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouteError {
    #[error("cannot classify topic '{topic}': expected at least 3 segments")]
    Classification { topic: String },

    #[error("payload {payload:?} on topic '{topic}' is not a number")]
    Validation { topic: String, payload: String },
}

impl RouteError {
    fn reason(&self) -> &'static str {
        match self {
            RouteError::Classification { .. } => "classification",
            RouteError::Validation { .. } => "validation",
        }
    }
}

/// Extract the tag from a topic path.
pub fn classify(topic: &str) -> Result<&str, RouteError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() < MIN_TOPIC_SEGMENTS {
        return Err(RouteError::Classification {
            topic: topic.to_string(),
        });
    }
    Ok(segments[segments.len() - 2])
}

/// Parse a payload as a 32-bit float after trimming whitespace.
pub fn parse_value(topic: &str, payload: &[u8]) -> Result<f32, RouteError> {
    let invalid = || RouteError::Validation {
        topic: topic.to_string(),
        payload: String::from_utf8_lossy(payload).into_owned(),
    };
    std::str::from_utf8(payload)
        .map_err(|_| invalid())?
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(invalid)
}

/// Classify and validate one publication, stamping it with the current time.
pub fn route(topic: &str, payload: &[u8]) -> Result<Sample, RouteError> {
    let tag = classify(topic)?;
    let value = parse_value(topic, payload)?;
    Ok(Sample {
        tag: tag.to_string(),
        timestamp: Utc::now(),
        value: value as f64,
    })
}

/// Routes publications into the aggregation buffer.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    buffer: Arc<AggregationBuffer>,
}

impl TopicRouter {
    pub fn new(buffer: Arc<AggregationBuffer>) -> Self {
        Self { buffer }
    }

    /// Route one publication. Bad input is logged and dropped, never retried.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) {
        match route(topic, payload) {
            Ok(sample) => {
                tracing::trace!(tag = %sample.tag, value = sample.value, "routed sample");
                self.buffer.append(&sample.tag, sample.timestamp, sample.value);
                metrics::MQTT_MESSAGES_TOTAL
                    .with_label_values(&["routed"])
                    .inc();
            }
            Err(e) => {
                tracing::warn!("dropping publication: {}", e);
                metrics::MQTT_MESSAGES_TOTAL
                    .with_label_values(&[e.reason()])
                    .inc();
            }
        }
    }
}
