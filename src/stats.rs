//! Run statistics shared by every worker.
//!
//! All counters are atomics: workers of the same and of different pools
//! increment them concurrently and no update may be lost.

use crate::{Metrics, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Stamp {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl Stamp {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct Stats {
    run_id: Uuid,
    total_images: AtomicUsize,
    downloaded: AtomicUsize,
    processed: AtomicUsize,
    saved: AtomicUsize,
    download_errors: AtomicUsize,
    process_errors: AtomicUsize,
    save_errors: AtomicUsize,
    started: OnceLock<Stamp>,
    finished: OnceLock<Stamp>,
    metrics: Metrics,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            total_images: AtomicUsize::new(0),
            downloaded: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            saved: AtomicUsize::new(0),
            download_errors: AtomicUsize::new(0),
            process_errors: AtomicUsize::new(0),
            save_errors: AtomicUsize::new(0),
            started: OnceLock::new(),
            finished: OnceLock::new(),
            metrics: Metrics::new(),
        }
    }

    /// Identifies this run in logs and reports.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record the batch size and stamp the start time. Later calls keep the first stamp.
    pub fn begin(&self, total_images: usize) {
        self.total_images.store(total_images, Ordering::Release);
        self.metrics.images_total.increment(total_images as u64);
        let _ = self.started.set(Stamp::now());
    }

    pub fn finish(&self) {
        let _ = self.finished.set(Stamp::now());
    }

    pub fn record_success(&self, stage: Stage, duration: Duration) {
        let counter = match stage {
            Stage::Download => &self.downloaded,
            Stage::Process => &self.processed,
            Stage::Save => &self.saved,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_success(stage, duration);
    }

    pub fn record_error(&self, stage: Stage, duration: Duration) {
        let counter = match stage {
            Stage::Download => &self.download_errors,
            Stage::Process => &self.process_errors,
            Stage::Save => &self.save_errors,
        };
        counter.fetch_add(1, Ordering::AcqRel);
        self.metrics.record_error(stage, duration);
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn total_images(&self) -> usize {
        self.total_images.load(Ordering::Acquire)
    }

    pub fn downloaded(&self) -> usize {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    pub fn saved(&self) -> usize {
        self.saved.load(Ordering::Acquire)
    }

    pub fn errors_at(&self, stage: Stage) -> usize {
        match stage {
            Stage::Download => self.download_errors.load(Ordering::Acquire),
            Stage::Process => self.process_errors.load(Ordering::Acquire),
            Stage::Save => self.save_errors.load(Ordering::Acquire),
        }
    }

    pub fn errors(&self) -> usize {
        self.errors_at(Stage::Download) + self.errors_at(Stage::Process) + self.errors_at(Stage::Save)
    }

    /// Time since `begin`, frozen once `finish` has been called.
    pub fn elapsed(&self) -> Duration {
        match (self.started.get(), self.finished.get()) {
            (Some(start), Some(end)) => end.instant.duration_since(start.instant),
            (Some(start), None) => start.instant.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.elapsed();
        let total_images = self.total_images();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            total_images as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        StatsSnapshot {
            run_id: self.run_id,
            total_images,
            downloaded: self.downloaded(),
            processed: self.processed(),
            saved: self.saved(),
            errors: self.errors(),
            download_errors: self.errors_at(Stage::Download),
            process_errors: self.errors_at(Stage::Process),
            save_errors: self.errors_at(Stage::Save),
            started_at: self.started.get().map(|s| s.wall),
            finished_at: self.finished.get().map(|s| s.wall),
            elapsed,
            throughput,
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub run_id: Uuid,
    pub total_images: usize,
    pub downloaded: usize,
    pub processed: usize,
    pub saved: usize,
    pub errors: usize,
    pub download_errors: usize,
    pub process_errors: usize,
    pub save_errors: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed: Duration,
    /// Images per second over the whole run
    pub throughput: f64,
}

impl StatsSnapshot {
    /// Items that reached a terminal outcome (saved or failed at some stage).
    pub fn settled(&self) -> usize {
        self.saved + self.errors
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub download: usize,
    pub process: usize,
    pub save: usize,
}

/// Non-blocking progress view while the pipeline runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineProgress {
    pub total: usize,
    pub downloaded: usize,
    pub processed: usize,
    pub saved: usize,
    pub errors: usize,
    pub queue_depths: QueueDepths,
}

impl PipelineProgress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.saved + self.errors >= self.total
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.saved + self.errors) as f64 / self.total as f64 * 100.0
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_sums_stage_errors() {
        let stats = Stats::new();
        stats.begin(4);
        stats.record_success(Stage::Download, Duration::from_millis(5));
        stats.record_error(Stage::Download, Duration::ZERO);
        stats.record_error(Stage::Process, Duration::ZERO);
        stats.record_error(Stage::Save, Duration::ZERO);
        stats.finish();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_images, 4);
        assert_eq!(snapshot.downloaded, 1);
        assert_eq!(snapshot.errors, 3);
        assert_eq!(snapshot.download_errors, 1);
        assert!(snapshot.started_at.is_some());
        assert!(snapshot.finished_at.is_some());
        assert_eq!(snapshot.run_id, stats.run_id());
    }

    #[test]
    fn elapsed_is_frozen_after_finish() {
        let stats = Stats::new();
        stats.begin(1);
        stats.finish();
        let first = stats.elapsed();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(stats.elapsed(), first);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let stats = Arc::new(Stats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_success(Stage::Save, Duration::ZERO);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.saved(), 8000);
    }

    #[test]
    fn progress_percent() {
        let progress = PipelineProgress {
            total: 4,
            downloaded: 3,
            processed: 2,
            saved: 1,
            errors: 1,
            queue_depths: QueueDepths::default(),
        };
        assert_eq!(progress.percent(), 50.0);
        assert!(!progress.is_complete());
    }
}
