//! In-memory aggregation buffer for samples awaiting the next flush

use chrono::{DateTime, Utc};
use iotedge_shared::Series;
use parking_lot::Mutex;

/// Tag-keyed accumulator of (timestamp, value) pairs. Thread-safe.
///
/// The lock is held for exactly one append or one swap and never across I/O.
#[derive(Debug, Default)]
pub struct AggregationBuffer {
    series: Mutex<Vec<Series>>,
}

impl AggregationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample to the series for `tag`, creating it on first sight.
    pub fn append(&self, tag: &str, timestamp: DateTime<Utc>, value: f64) {
        let (tags, samples) = {
            let mut series = self.series.lock();
            match series.iter_mut().find(|s| s.tag == tag) {
                Some(existing) => existing.push(timestamp, value),
                None => series.push(Series::single(tag, timestamp, value)),
            }
            (series.len(), series.iter().map(Series::len).sum::<usize>())
        };

        crate::metrics::BUFFER_TAGS.set(tags as f64);
        crate::metrics::BUFFER_SAMPLES.set(samples as f64);
    }

    /// Move every buffered series out, leaving the buffer empty.
    pub fn drain_and_clear(&self) -> Vec<Series> {
        let drained = std::mem::take(&mut *self.series.lock());

        crate::metrics::BUFFER_TAGS.set(0.0);
        crate::metrics::BUFFER_SAMPLES.set(0.0);
        drained
    }

    /// Number of distinct tags currently buffered.
    pub fn tag_count(&self) -> usize {
        self.series.lock().len()
    }

    /// Total samples across all buffered series.
    pub fn sample_count(&self) -> usize {
        self.series.lock().iter().map(Series::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_drain_groups_by_tag() {
        let buffer = AggregationBuffer::new();
        buffer.append("t1", ts(0), 1.0);
        buffer.append("t1", ts(1), 2.0);
        buffer.append("t2", ts(0), 9.0);
        assert_eq!(buffer.tag_count(), 2);
        assert_eq!(buffer.sample_count(), 3);

        let drained = buffer.drain_and_clear();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].tag, "t1");
        assert_eq!(drained[0].timestamps, vec![ts(0), ts(1)]);
        assert_eq!(drained[0].values, vec![1.0, 2.0]);
        assert_eq!(drained[1].tag, "t2");
        assert_eq!(drained[1].timestamps, vec![ts(0)]);
        assert_eq!(drained[1].values, vec![9.0]);

        assert!(buffer.drain_and_clear().is_empty());
        assert_eq!(buffer.sample_count(), 0);
    }

    #[test]
    fn test_tag_isolation() {
        let buffer = AggregationBuffer::new();
        buffer.append("a", ts(0), 1.0);
        buffer.append("b", ts(0), 5.0);
        buffer.append("a", ts(1), 2.0);
        buffer.append("a", ts(2), 3.0);

        let drained = buffer.drain_and_clear();
        let b = drained.iter().find(|s| s.tag == "b").unwrap();
        assert_eq!(b.values, vec![5.0]);
        assert_eq!(b.timestamps, vec![ts(0)]);
    }

    #[test]
    fn test_order_preserved_per_tag() {
        let buffer = AggregationBuffer::new();
        // arrival order, not timestamp order
        buffer.append("t", ts(5), 5.0);
        buffer.append("t", ts(1), 1.0);
        buffer.append("t", ts(3), 3.0);

        let drained = buffer.drain_and_clear();
        assert_eq!(drained[0].values, vec![5.0, 1.0, 3.0]);
    }

    #[test]
    fn test_no_duplication_across_concurrent_drains() {
        let buffer = Arc::new(AggregationBuffer::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        buffer.append(&format!("tag{}", p), ts(i), (p * 1000 + i) as f64);
                    }
                })
            })
            .collect();

        let mut drained = Vec::new();
        while producers.iter().any(|h| !h.is_finished()) {
            drained.extend(buffer.drain_and_clear());
        }
        for handle in producers {
            handle.join().unwrap();
        }
        drained.extend(buffer.drain_and_clear());

        let mut values: Vec<f64> = drained.iter().flat_map(|s| s.values.clone()).collect();
        assert_eq!(values.len(), 2000);
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        values.dedup();
        assert_eq!(values.len(), 2000);

        // per-tag order survives being split over several drains
        for p in 0..4 {
            let tag = format!("tag{}", p);
            let seen: Vec<f64> = drained
                .iter()
                .filter(|s| s.tag == tag)
                .flat_map(|s| s.values.clone())
                .collect();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
