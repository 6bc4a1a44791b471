use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use relay_kafka::BrokerClient;
use relay_metrics::{MetricData, Schemas, parse_metric};
use relay_statsd::metric;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::flush::{FlushExecutor, FlushTrigger};
use crate::stats::RouteStats;
use crate::statsd::{RouteCounters, RouteGauges};

/// Decodes buffered lines into a batch and flushes it by size or time.
///
/// This is the only consumer of the buffer and the only owner of the batch.
#[derive(Debug)]
pub(crate) struct Accumulator<C> {
    key: Arc<str>,
    rx: mpsc::Receiver<Bytes>,
    schemas: Schemas,
    org_id: i32,
    max_batch: usize,
    max_wait: Duration,
    batch: Vec<MetricData>,
    executor: FlushExecutor<C>,
    stats: Arc<RouteStats>,
}

impl<C: BrokerClient> Accumulator<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: Arc<str>,
        rx: mpsc::Receiver<Bytes>,
        schemas: Schemas,
        org_id: i32,
        max_batch: usize,
        max_wait: Duration,
        executor: FlushExecutor<C>,
        stats: Arc<RouteStats>,
    ) -> Self {
        Self {
            key,
            rx,
            schemas,
            org_id,
            max_batch,
            max_wait,
            batch: Vec::with_capacity(max_batch),
            executor,
            stats,
        }
    }

    /// Runs until the buffer is closed and drained, then returns the flush executor.
    pub async fn run(mut self) -> FlushExecutor<C> {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.max_wait, self.max_wait);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                line = self.rx.recv() => match line {
                    Some(line) => self.handle_line(line).await,
                    None => break,
                },
                _ = ticker.tick() => self.handle_tick().await,
            }
        }

        if !self.batch.is_empty() {
            self.flush(FlushTrigger::Shutdown).await;
        }

        relay_log::debug!(route = &*self.key, "buffer drained");
        self.executor
    }

    async fn handle_line(&mut self, line: Bytes) {
        self.stats.dec_buffered();

        match parse_metric(&line, &self.schemas, self.org_id) {
            Ok(metric) => self.batch.push(metric),
            Err(error) => {
                relay_log::error!(
                    route = &*self.key,
                    error = &error as &dyn std::error::Error,
                    "failed to parse metric, skipping {:?}",
                    line,
                );
                self.stats.inc_decode_failed();
                metric!(
                    counter(RouteCounters::MetricsDropped) += 1,
                    route = &*self.key,
                    reason = "invalid"
                );
                return;
            }
        }

        if self.batch.len() >= self.max_batch {
            self.flush(FlushTrigger::Size).await;
        }
    }

    async fn handle_tick(&mut self) {
        metric!(
            gauge(RouteGauges::Buffered) = self.stats.buffered(),
            route = &*self.key
        );

        if !self.batch.is_empty() {
            self.flush(FlushTrigger::Ticker).await;
        }
    }

    async fn flush(&mut self, trigger: FlushTrigger) {
        relay_log::trace!(
            route = &*self.key,
            "flushing {} metrics, trigger {trigger}",
            self.batch.len(),
        );
        self.executor.flush(&mut self.batch, trigger).await;
    }
}
