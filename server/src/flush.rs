//! Periodic flush of the aggregation buffer.
//!
//! Once per period the scheduler drains the buffer and persists every series,
//! either into the local sink or by forwarding the batch to a redirect
//! server. Deadlines advance by exactly one period per cycle, so a slow cycle
//! never shifts the ones after it.
//!
//! Failed inserts are retried for at most the series budget, after which that
//! series is dropped and the next one is tried. Each attempt is cut off at
//! the safety margin before the next deadline; once the margin is reached the
//! rest of the batch is dropped. Dropped series are counted as lost.

use crate::buffer::AggregationBuffer;
use crate::config::FlushConfig;
use crate::forward::RedirectClient;
use crate::storage::{with_timeout, TimeseriesSink};
use crate::{audit, metrics};
use iotedge_shared::Series;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Where drained batches go.
#[derive(Clone)]
pub enum Persistence {
    Sink(Arc<dyn TimeseriesSink>),
    Redirect(RedirectClient),
}

/// Outcome of one flush cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Deadline the cycle was scheduled for
    pub deadline: Instant,
    pub started: Instant,
    pub series: usize,
    pub persisted: usize,
    pub lost_series: usize,
    pub lost_samples: usize,
    pub retries: usize,
}

impl CycleReport {
    fn new(deadline: Instant, batch: &[Series]) -> Self {
        Self {
            deadline,
            started: Instant::now(),
            series: batch.len(),
            persisted: 0,
            lost_series: 0,
            lost_samples: 0,
            retries: 0,
        }
    }
}

pub struct FlushScheduler {
    buffer: Arc<AggregationBuffer>,
    persistence: Persistence,
    config: FlushConfig,
    reports: Option<mpsc::UnboundedSender<CycleReport>>,
}

impl FlushScheduler {
    pub fn new(buffer: Arc<AggregationBuffer>, persistence: Persistence, config: FlushConfig) -> Self {
        Self {
            buffer,
            persistence,
            config,
            reports: None,
        }
    }

    /// Publish a [`CycleReport`] after every cycle.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<CycleReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Run until `cancel` fires, then perform a final flush.
    pub async fn run(self, cancel: CancellationToken) {
        let period = self.config.period();
        let mut deadline = Instant::now() + period;
        tracing::info!(
            period_secs = self.config.period_secs,
            settle_secs = self.config.settle_secs,
            redirect = matches!(self.persistence, Persistence::Redirect(_)),
            "flush scheduler started"
        );

        loop {
            tokio::select! {
                _ = sleep_until(deadline) => {}
                _ = cancel.cancelled() => break,
            }

            let next_deadline = deadline + period;
            self.cycle(deadline, next_deadline).await;

            tokio::select! {
                _ = sleep(self.config.settle()) => {}
                _ = cancel.cancelled() => break,
            }
            deadline = next_deadline;
        }

        let now = Instant::now();
        tracing::info!("flush scheduler stopping, final flush");
        self.cycle(now, now + period).await;
    }

    async fn cycle(&self, scheduled: Instant, next_deadline: Instant) {
        let report = self.flush_once(scheduled, next_deadline).await;
        metrics::FLUSH_CYCLES_TOTAL.inc();
        if let Some(tx) = &self.reports {
            let _ = tx.send(report);
        }
    }

    /// Drain the buffer and persist it; `next_deadline` bounds the retry budget.
    pub async fn flush_once(&self, scheduled: Instant, next_deadline: Instant) -> CycleReport {
        let batch = self.buffer.drain_and_clear();
        let mut report = CycleReport::new(scheduled, &batch);
        if batch.is_empty() {
            tracing::trace!("nothing to flush");
            return report;
        }
        tracing::info!(series = batch.len(), "flushing buffered series");

        let timer = metrics::FLUSH_DURATION.start_timer();
        match &self.persistence {
            Persistence::Sink(sink) => {
                self.persist(sink.as_ref(), &batch, next_deadline, &mut report).await
            }
            Persistence::Redirect(client) => Self::redirect(client, &batch, &mut report).await,
        }
        timer.observe_duration();
        report
    }

    async fn persist(
        &self,
        sink: &dyn TimeseriesSink,
        batch: &[Series],
        next_deadline: Instant,
        report: &mut CycleReport,
    ) {
        let margin = self.config.safety_margin();
        let backoff = self.config.retry_backoff();
        let budget = self.config.series_budget();

        'series: for (index, series) in batch.iter().enumerate() {
            let give_up = Instant::now() + budget;
            loop {
                let now = Instant::now();
                let remaining = next_deadline.saturating_duration_since(now);
                if remaining <= margin {
                    Self::abort(&batch[index..], report);
                    break 'series;
                }
                if now >= give_up {
                    tracing::warn!(tag = %series.tag, "retry budget exhausted, skipping series");
                    Self::abort(std::slice::from_ref(series), report);
                    continue 'series;
                }

                let limit = (remaining - margin).min(give_up - now);
                match with_timeout(limit, sink.insert(series)).await {
                    Ok(()) => {
                        report.persisted += 1;
                        metrics::FLUSH_SERIES_TOTAL
                            .with_label_values(&["persisted"])
                            .inc();
                        tracing::trace!(tag = %series.tag, samples = series.len(), "series persisted");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(tag = %series.tag, "insert failed: {}", e);
                        report.retries += 1;
                        metrics::FLUSH_RETRIES_TOTAL.inc();
                        sleep(backoff).await;
                    }
                }
            }
        }
    }

    fn abort(remaining: &[Series], report: &mut CycleReport) {
        let samples: usize = remaining.iter().map(Series::len).sum();
        report.lost_series += remaining.len();
        report.lost_samples += samples;
        metrics::FLUSH_SERIES_TOTAL
            .with_label_values(&["lost"])
            .inc_by(remaining.len() as f64);
        metrics::FLUSH_SAMPLES_LOST.inc_by(samples as f64);
        tracing::error!(
            series = remaining.len(),
            samples,
            "dropping unpersisted data"
        );
        audit::flush_data_lost(remaining.len(), samples);
    }

    async fn redirect(client: &RedirectClient, batch: &[Series], report: &mut CycleReport) {
        tracing::info!(url = %client.url(), series = batch.len(), "redirecting batch");
        match client.forward(batch).await {
            Ok(()) => {
                report.persisted = batch.len();
                metrics::REDIRECT_TOTAL.with_label_values(&["ok"]).inc();
            }
            Err(e) => {
                tracing::error!("failed to forward batch: {}", e);
                metrics::REDIRECT_TOTAL.with_label_values(&["error"]).inc();
                Self::abort(batch, report);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::Utc;
    use std::time::Duration;

    fn scheduler(store: Arc<MemoryStore>, buffer: Arc<AggregationBuffer>) -> FlushScheduler {
        FlushScheduler::new(buffer, Persistence::Sink(store), FlushConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_persists_all_series() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("t1", Utc::now(), 1.0);
        buffer.append("t1", Utc::now(), 2.0);
        buffer.append("t2", Utc::now(), 9.0);

        let now = Instant::now();
        let report = scheduler(store.clone(), buffer.clone())
            .flush_once(now, now + Duration::from_secs(30))
            .await;
        assert_eq!(report.series, 2);
        assert_eq!(report.persisted, 2);
        assert_eq!(report.lost_series, 0);
        assert_eq!(store.measurements("t1").len(), 2);
        assert_eq!(store.measurements("t2").len(), 1);
        assert_eq!(buffer.sample_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_inserts(3);
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("t1", Utc::now(), 1.0);

        let start = Instant::now();
        let report = scheduler(store.clone(), buffer)
            .flush_once(start, start + Duration::from_secs(30))
            .await;
        assert_eq!(report.persisted, 1);
        assert_eq!(report.retries, 3);
        assert_eq!(store.insert_attempts(), 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(150) && elapsed < Duration::from_millis(160));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_sink_aborts_at_safety_margin() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("t1", Utc::now(), 1.0);
        buffer.append("t2", Utc::now(), 2.0);
        buffer.append("t2", Utc::now(), 3.0);
        buffer.append("t3", Utc::now(), 4.0);

        // first series spends its 2s budget, the second runs into the margin at 3s
        let start = Instant::now();
        let report = scheduler(store.clone(), buffer.clone())
            .flush_once(start, start + Duration::from_secs(5))
            .await;

        assert_eq!(report.persisted, 0);
        assert_eq!(report.lost_series, 3);
        assert_eq!(report.lost_samples, 4);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3), "stopped early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(3_100), "overran margin: {:?}", elapsed);
        assert_eq!(report.retries, store.insert_attempts());

        // lost data is not carried into the next cycle
        store.set_failing(false);
        let later = Instant::now();
        let next = scheduler(store.clone(), buffer)
            .flush_once(later, later + Duration::from_secs(30))
            .await;
        assert_eq!(next.series, 0);
        assert_eq!(store.measurement_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_series_does_not_starve_the_rest() {
        let store = Arc::new(MemoryStore::new());
        store.reject_tag("bad");
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("bad", Utc::now(), 1.0);
        buffer.append("good", Utc::now(), 2.0);

        let start = Instant::now();
        let report = scheduler(store.clone(), buffer)
            .flush_once(start, start + Duration::from_secs(30))
            .await;

        assert_eq!(report.persisted, 1);
        assert_eq!(report.lost_series, 1);
        assert_eq!(report.lost_samples, 1);
        assert_eq!(store.measurements("good").len(), 1);
        assert!(start.elapsed() < Duration::from_millis(2_100), "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_insert_is_cut_off() {
        let store = Arc::new(MemoryStore::new());
        store.set_insert_delay(Duration::from_secs(40));
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("t1", Utc::now(), 1.0);

        let start = Instant::now();
        let report = scheduler(store.clone(), buffer)
            .flush_once(start, start + Duration::from_secs(30))
            .await;

        assert_eq!(report.lost_series, 1);
        assert_eq!(store.insert_attempts(), 1);
        assert_eq!(store.measurement_count(), 0);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2_100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_insert_never_passes_the_margin() {
        let store = Arc::new(MemoryStore::new());
        store.set_insert_delay(Duration::from_secs(40));
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("t1", Utc::now(), 1.0);
        buffer.append("t2", Utc::now(), 2.0);

        let config = FlushConfig {
            series_budget_ms: 60_000,
            ..FlushConfig::default()
        };
        let start = Instant::now();
        let report = FlushScheduler::new(buffer, Persistence::Sink(store.clone()), config)
            .flush_once(start, start + Duration::from_secs(30))
            .await;

        assert_eq!(report.lost_series, 2);
        assert_eq!(report.retries, 1);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(28), "stopped early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(28_100), "overran margin: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadlines_do_not_drift() {
        let store = Arc::new(MemoryStore::new());
        store.set_failing(true);
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("t1", Utc::now(), 1.0);

        let config = FlushConfig {
            series_budget_ms: 60_000,
            ..FlushConfig::default()
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let task = tokio::spawn(
            FlushScheduler::new(buffer.clone(), Persistence::Sink(store), config)
                .with_reports(tx)
                .run(cancel.clone()),
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.deadline, start + Duration::from_secs(30));
        assert!(first.started - start < Duration::from_millis(30_005));
        assert_eq!(first.lost_series, 1);

        // retries ran until 58s and settle until 63s, past the 60s deadline
        let second = rx.recv().await.unwrap();
        assert_eq!(second.deadline, start + Duration::from_secs(60));
        assert!(second.started >= start + Duration::from_secs(63));

        let third = rx.recv().await.unwrap();
        assert_eq!(third.deadline, start + Duration::from_secs(90));
        assert!(third.started >= start + Duration::from_secs(90));
        assert!(third.started - start < Duration::from_millis(90_005));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_performs_final_flush() {
        let store = Arc::new(MemoryStore::new());
        let buffer = Arc::new(AggregationBuffer::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(scheduler(store.clone(), buffer.clone()).run(cancel.clone()));

        sleep(Duration::from_secs(10)).await;
        buffer.append("late", Utc::now(), 4.0);
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(store.measurements("late").len(), 1);
    }

    #[tokio::test]
    async fn test_redirect_forwards_batch() {
        let (addr, mut rx) =
            crate::forward::tests::capture_server(hyper::StatusCode::OK).await;
        let client = RedirectClient::new(&format!("http://{}", addr)).unwrap();
        let buffer = Arc::new(AggregationBuffer::new());
        buffer.append("t1", Utc::now(), 1.0);

        let scheduler = FlushScheduler::new(
            buffer,
            Persistence::Redirect(client),
            FlushConfig::default(),
        );
        let now = Instant::now();
        let report = scheduler.flush_once(now, now + Duration::from_secs(30)).await;
        assert_eq!(report.persisted, 1);

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].tag, "t1");
    }
}
