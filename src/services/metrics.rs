use crate::pipeline::traits::MetricsSink;

/// Forwards pipeline events to the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderMetrics;

impl MetricsSink for RecorderMetrics {
    fn job_completed(&self) {
        metrics::counter!("demographics_jobs_completed_total").increment(1);
    }

    fn job_failed(&self, status: &str) {
        metrics::counter!("demographics_jobs_failed_total", "status" => status.to_string()).increment(1);
    }

    fn fetch_retried(&self) {
        metrics::counter!("demographics_fetch_retries_total").increment(1);
    }

    fn batch_dispatched(&self, fill: usize, capacity: usize) {
        metrics::counter!("demographics_batches_dispatched_total").increment(1);
        if capacity > 0 {
            metrics::histogram!("demographics_batch_fill_ratio").record(fill as f64 / capacity as f64);
        }
    }
}

/// Register descriptions for everything `RecorderMetrics` emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "demographics_jobs_completed_total",
        "Usernames that received a successful verdict"
    );
    metrics::describe_counter!(
        "demographics_jobs_failed_total",
        "Usernames that received a degraded verdict, by status"
    );
    metrics::describe_counter!(
        "demographics_batches_dispatched_total",
        "Inference batches sent to the predictor"
    );
    metrics::describe_counter!(
        "demographics_fetch_retries_total",
        "Thumbnail fetches scheduled for another attempt"
    );
    metrics::describe_histogram!(
        "demographics_batch_fill_ratio",
        "Batch size divided by configured capacity"
    );
    metrics::describe_gauge!(
        "demographics_queue_depth",
        "Usernames waiting in the Redis queue"
    );
}
