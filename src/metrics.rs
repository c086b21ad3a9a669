use crate::{PipelineError, Stage};
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Metric handles for one pipeline run.
///
/// Handles registered before a recorder is installed are no-ops, so the
/// exporter must be installed before the pipeline is built to see anything.
pub struct Metrics {
    pub images_total: Counter,
    pub images_downloaded: Counter,
    pub images_processed: Counter,
    pub images_saved: Counter,
    pub download_errors: Counter,
    pub process_errors: Counter,
    pub save_errors: Counter,
    pub download_duration: Histogram,
    pub process_duration: Histogram,
    pub save_duration: Histogram,
    pub download_queue_depth: Gauge,
    pub process_queue_depth: Gauge,
    pub save_queue_depth: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            images_total: register_counter!("pipeline_images_total"),
            images_downloaded: register_counter!("pipeline_images_downloaded_total"),
            images_processed: register_counter!("pipeline_images_processed_total"),
            images_saved: register_counter!("pipeline_images_saved_total"),
            download_errors: register_counter!("pipeline_errors_total", "stage" => "download"),
            process_errors: register_counter!("pipeline_errors_total", "stage" => "process"),
            save_errors: register_counter!("pipeline_errors_total", "stage" => "save"),
            download_duration: register_histogram!("pipeline_stage_seconds", "stage" => "download"),
            process_duration: register_histogram!("pipeline_stage_seconds", "stage" => "process"),
            save_duration: register_histogram!("pipeline_stage_seconds", "stage" => "save"),
            download_queue_depth: register_gauge!("pipeline_queue_depth", "queue" => "download"),
            process_queue_depth: register_gauge!("pipeline_queue_depth", "queue" => "process"),
            save_queue_depth: register_gauge!("pipeline_queue_depth", "queue" => "save"),
        }
    }

    pub fn record_success(&self, stage: Stage, duration: Duration) {
        match stage {
            Stage::Download => self.images_downloaded.increment(1),
            Stage::Process => self.images_processed.increment(1),
            Stage::Save => self.images_saved.increment(1),
        }
        self.record_duration(stage, duration);
    }

    pub fn record_error(&self, stage: Stage, duration: Duration) {
        match stage {
            Stage::Download => self.download_errors.increment(1),
            Stage::Process => self.process_errors.increment(1),
            Stage::Save => self.save_errors.increment(1),
        }
        self.record_duration(stage, duration);
    }

    fn record_duration(&self, stage: Stage, duration: Duration) {
        let seconds = duration.as_secs_f64();
        match stage {
            Stage::Download => self.download_duration.record(seconds),
            Stage::Process => self.process_duration.record(seconds),
            Stage::Save => self.save_duration.record(seconds),
        }
    }

    pub fn set_queue_depths(&self, download: usize, process: usize, save: usize) {
        self.download_queue_depth.set(download as f64);
        self.process_queue_depth.set(process as f64);
        self.save_queue_depth.set(save as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Installs a Prometheus recorder as the global `metrics` recorder.
pub struct PrometheusExporter;

impl PrometheusExporter {
    /// Install the recorder and return a handle that renders the text exposition format.
    pub fn install() -> Result<PrometheusHandle, PipelineError> {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::set_boxed_recorder(Box::new(recorder))
            .map_err(|e| PipelineError::Setup(format!("metrics recorder: {e}")))?;

        info!("Prometheus metrics recorder installed");
        Ok(handle)
    }
}
