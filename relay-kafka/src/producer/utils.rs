use rdkafka::ClientContext;
use rdkafka::error::KafkaError;
use relay_statsd::metric;

use crate::statsd::KafkaCounters;

/// Kafka client context that logs client errors.
#[derive(Debug)]
pub struct CaptureErrorContext;

impl ClientContext for CaptureErrorContext {
    /// Called by librdkafka for global errors, such as all brokers being down.
    ///
    /// These errors are informational, librdkafka keeps reconnecting on its own.
    fn error(&self, error: KafkaError, reason: &str) {
        relay_log::warn!(
            error = &error as &dyn std::error::Error,
            "kafka client error: {reason}"
        );

        metric!(counter(KafkaCounters::ClientError) += 1);
    }
}

/// The wrapper type around the kafka [`rdkafka::producer::FutureProducer`] with our own
/// [`CaptureErrorContext`] context.
pub type FutureProducer = rdkafka::producer::FutureProducer<CaptureErrorContext>;
