//! Pipeline metrics, registered once against the global meter.
//!
//! No exporter is installed here; instruments are no-ops until the host sets a meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};

#[derive(Clone, Debug)]
pub struct PipelineMetrics {
    pub runs_total: Counter<u64>,
    pub stage_latency_ms: Histogram<f64>,
    pub stage_failures_total: Counter<u64>,
    pub rows_ingested_total: Counter<u64>,
}

static PIPELINE_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("churnguard_pipeline"));

pub static PIPELINE_METRICS: Lazy<PipelineMetrics> = Lazy::new(|| {
    PipelineMetrics {
        runs_total: PIPELINE_METER.u64_counter("churnguard_runs_total")
            .with_description("Orchestrator runs by terminal state")
            .build(),
        stage_latency_ms: PIPELINE_METER.f64_histogram("churnguard_stage_latency_ms")
            .with_description("Wall-clock duration per pipeline stage (ms)")
            .with_unit("ms")
            .build(),
        stage_failures_total: PIPELINE_METER.u64_counter("churnguard_stage_failures_total")
            .with_description("Stages that ended the run with an error")
            .build(),
        rows_ingested_total: PIPELINE_METER.u64_counter("churnguard_rows_ingested_total")
            .with_description("Source rows read by the ingestion merger (pre-dedup)")
            .build(),
    }
});
