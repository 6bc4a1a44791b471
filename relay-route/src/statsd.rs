use relay_statsd::{CounterMetric, DistributionMetric, GaugeMetric, TimerMetric};

/// Counter metrics for Kafka routes.
pub enum RouteCounters {
    /// Number of metrics that were not forwarded.
    ///
    /// This metric is tagged with:
    ///  - `route`: The route key.
    ///  - `reason`: `queue_full` if the buffer was full, `invalid` if the line could not be
    ///    decoded or encoded, `fatal` if the buffer was thrown away because the route failed to
    ///    connect.
    MetricsDropped,
    /// Number of metrics acknowledged by the brokers.
    ///
    /// This metric is tagged with:
    ///  - `route`: The route key.
    MetricsOut,
    /// Number of failed flush attempts.
    ///
    /// This metric is tagged with:
    ///  - `route`: The route key.
    FlushErrors,
}

impl CounterMetric for RouteCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::MetricsDropped => "route.metrics.dropped",
            Self::MetricsOut => "route.metrics.out",
            Self::FlushErrors => "route.flush.errors",
        }
    }
}

/// Gauge metrics for Kafka routes.
pub enum RouteGauges {
    /// Number of lines waiting in the buffer.
    Buffered,
    /// Capacity of the buffer.
    BufferSize,
}

impl GaugeMetric for RouteGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::Buffered => "route.buffered",
            Self::BufferSize => "route.buffer_size",
        }
    }
}

/// Timer metrics for Kafka routes.
pub enum RouteTimers {
    /// Time taken by the attempt that delivered a batch.
    ///
    /// This metric is tagged with:
    ///  - `route`: The route key.
    ///  - `trigger`: What caused the flush, see [`FlushTrigger`](crate::FlushTrigger).
    FlushDuration,
}

impl TimerMetric for RouteTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "route.flush.duration",
        }
    }
}

/// Distribution metrics for Kafka routes.
pub enum RouteDistributions {
    /// Encoded size of a successfully flushed batch in bytes.
    ///
    /// This metric is tagged with:
    ///  - `route`: The route key.
    ///  - `trigger`: What caused the flush.
    FlushSize,
}

impl DistributionMetric for RouteDistributions {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushSize => "route.flush.size",
        }
    }
}
