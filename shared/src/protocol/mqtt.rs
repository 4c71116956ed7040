//! MQTT topic conventions
//!
//! Devices publish a single numeric payload to `<any>/.../<tag>/data`. The
//! server subscribes to every depth from 2 to 7 segments.

/// Literal last segment of every data topic
pub const DATA_SEGMENT: &str = "data";

/// Default broker port
pub const MQTT_PORT: u16 = 1883;

/// Heartbeat topic the server publishes to
pub const PING_TOPIC: &str = "/server/ping/data";

/// Payload of the heartbeat publish
pub const PING_PAYLOAD: &str = "-10";

/// Wildcard filters covering 2..=7 topic segments ending in `data`
pub const DATA_TOPIC_FILTERS: [&str; 6] = [
    "+/+/+/+/+/+/data",
    "+/+/+/+/+/data",
    "+/+/+/+/data",
    "+/+/+/data",
    "+/+/data",
    "+/data",
];

/// Build the data topic for `tag` under `prefix` (e.g. `home/livingroom`).
pub fn data_topic(prefix: &str, tag: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", tag, DATA_SEGMENT)
    } else {
        format!("{}/{}/{}", prefix, tag, DATA_SEGMENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_topic() {
        assert_eq!(data_topic("home/livingroom", "temp1"), "home/livingroom/temp1/data");
        assert_eq!(data_topic("/home/", "temp1"), "home/temp1/data");
        assert_eq!(data_topic("", "temp1"), "temp1/data");
    }

    #[test]
    fn test_filters_end_in_data_segment() {
        for filter in DATA_TOPIC_FILTERS {
            assert!(filter.ends_with(DATA_SEGMENT));
        }
    }
}
