//! Timeseries samples as they travel from devices to the sink

use crate::utils::time::{self, TimestampError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single measurement of one sensor stream
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Ordered (timestamp, value) pairs for one tag.
///
/// This is both the unit the aggregation buffer accumulates and the JSON
/// import format devices post directly (`{Tag, Timestamps, Values, Comments}`).
/// On the wire timestamps are `YYYY-MM-DD HH:MM:SS.mmm` strings and values are
/// decimal strings; numbers and RFC 3339 timestamps are accepted as input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    #[serde(rename = "Tag", alias = "tag")]
    pub tag: String,

    #[serde(
        rename = "Timestamps",
        alias = "timestamps",
        default,
        with = "timestamps_wire"
    )]
    pub timestamps: Vec<DateTime<Utc>>,

    #[serde(
        rename = "Values",
        alias = "values",
        default,
        serialize_with = "serialize_values",
        deserialize_with = "deserialize_values"
    )]
    pub values: Vec<f64>,

    /// Free-form annotations; either empty or one per value
    #[serde(rename = "Comments", alias = "comments", default)]
    pub comments: Vec<String>,
}

/// Structural problems in an imported series
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SeriesError {
    #[error("series has an empty tag")]
    EmptyTag,

    #[error("series {tag}: {timestamps} timestamps but {values} values")]
    LengthMismatch {
        tag: String,
        timestamps: usize,
        values: usize,
    },
}

impl Series {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    /// A series holding exactly one sample.
    pub fn single(tag: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            tag: tag.into(),
            timestamps: vec![timestamp],
            values: vec![value],
            comments: Vec::new(),
        }
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, value: f64) {
        self.timestamps.push(timestamp);
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Comment attached to the sample at `index`, if any.
    pub fn comment(&self, index: usize) -> Option<&str> {
        self.comments.get(index).map(String::as_str)
    }

    /// Check that timestamps and values line up.
    pub fn validate(&self) -> Result<(), SeriesError> {
        if self.tag.is_empty() {
            return Err(SeriesError::EmptyTag);
        }
        if self.timestamps.len() != self.values.len() {
            return Err(SeriesError::LengthMismatch {
                tag: self.tag.clone(),
                timestamps: self.timestamps.len(),
                values: self.values.len(),
            });
        }
        Ok(())
    }

    /// Iterate the series as individual samples.
    pub fn samples(&self) -> impl Iterator<Item = Sample> + '_ {
        self.timestamps
            .iter()
            .zip(self.values.iter())
            .map(move |(ts, value)| Sample {
                tag: self.tag.clone(),
                timestamp: *ts,
                value: *value,
            })
    }
}

mod timestamps_wire {
    use super::*;
    use serde::de::Error;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(
        timestamps: &Vec<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(timestamps.iter().map(time::format_timestamp))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<DateTime<Utc>>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| time::parse_timestamp(s))
            .collect::<Result<Vec<_>, TimestampError>>()
            .map_err(D::Error::custom)
    }
}

#[allow(clippy::ptr_arg)]
fn serialize_values<S: Serializer>(values: &Vec<f64>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|v| v.to_string()))
}

fn deserialize_values<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    Vec::<NumberOrText>::deserialize(deserializer)?
        .into_iter()
        .map(|v| {
            let parsed = match &v {
                NumberOrText::Number(n) => Some(*n),
                NumberOrText::Text(s) => s.trim().parse::<f64>().ok(),
            };
            parsed.filter(|n| n.is_finite()).ok_or_else(|| match v {
                NumberOrText::Number(n) => D::Error::custom(format!("not a finite number: {}", n)),
                NumberOrText::Text(s) => D::Error::custom(format!("not a valid number: {:?}", s)),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_decode_import_format() {
        let json = r#"[{
            "Tag": "Basel3Temperature",
            "Timestamps": ["2024-03-01 10:00:00.000", "2024-03-01 10:00:00.050"],
            "Values": ["283.500000", "284.25"],
            "Comments": ["dummy", "dummy"]
        }]"#;
        let series: Vec<Series> = serde_json::from_str(json).unwrap();
        assert_eq!(series.len(), 1);
        let s = &series[0];
        assert_eq!(s.tag, "Basel3Temperature");
        assert_eq!(s.values, vec![283.5, 284.25]);
        assert_eq!(
            s.timestamps[1],
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap() + chrono::Duration::milliseconds(50)
        );
        assert_eq!(s.comment(0), Some("dummy"));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_decode_lower_case_with_numbers() {
        let json = r#"{"tag":"t1","timestamps":["2024-03-01T10:00:00Z"],"values":[1.5]}"#;
        let s: Series = serde_json::from_str(json).unwrap();
        assert_eq!(s.values, vec![1.5]);
        assert!(s.comments.is_empty());
    }

    #[test]
    fn test_decode_rejects_non_numeric_value() {
        let json = r#"{"Tag":"t1","Timestamps":["2024-03-01 10:00:00.000"],"Values":["abc"]}"#;
        assert!(serde_json::from_str::<Series>(json).is_err());
    }

    #[test]
    fn test_decode_rejects_non_finite_value() {
        for value in ["NaN", "inf", "-Infinity"] {
            let json = format!(
                r#"{{"Tag":"t1","Timestamps":["2024-03-01 10:00:00.000"],"Values":["{}"]}}"#,
                value
            );
            assert!(serde_json::from_str::<Series>(&json).is_err(), "accepted {}", value);
        }
    }

    #[test]
    fn test_encode_uses_wire_strings() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let s = Series::single("t1", ts, 23.5);
        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value["Tag"], "t1");
        assert_eq!(value["Timestamps"][0], "2024-03-01 10:00:00.000");
        assert_eq!(value["Values"][0], "23.5");
    }

    #[test]
    fn test_validate_length_mismatch() {
        let mut s = Series::new("t1");
        s.timestamps.push(Utc::now());
        assert!(matches!(
            s.validate(),
            Err(SeriesError::LengthMismatch { timestamps: 1, values: 0, .. })
        ));
        assert_eq!(Series::new("").validate(), Err(SeriesError::EmptyTag));
    }

    #[test]
    fn test_samples_iterates_in_order() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let mut s = Series::single("t1", t0, 1.0);
        s.push(t0 + chrono::Duration::seconds(1), 2.0);
        let values: Vec<f64> = s.samples().map(|sample| sample.value).collect();
        assert_eq!(values, vec![1.0, 2.0]);
    }
}
