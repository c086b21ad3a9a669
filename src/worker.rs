use crate::{
    format_bytes, AnalysisExecutor, AnalysisKind, ArtifactKind, ArtifactLayout, DecodedPayload,
    ErrorSeverity, ImageAnalyzer, ImageFetcher, ImageStore, ImageTask, PipelineError,
    ProcessedPayload, Stage, StageQueue, Stats,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Diagnostic identity of a worker, e.g. `ProcessWorker-2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub kind: Stage,
    pub ordinal: usize,
}

impl WorkerId {
    pub fn new(kind: Stage, ordinal: usize) -> Self {
        Self { kind, ordinal }
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            Stage::Download => "DownloadWorker",
            Stage::Process => "ProcessWorker",
            Stage::Save => "SaveWorker",
        };
        write!(f, "{}-{}", kind, self.ordinal)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub is_running: bool,
    pub completed_count: usize,
    pub error_count: usize,
}

/// Flags and counters shared between a worker and its clones.
#[derive(Clone)]
struct WorkerCore {
    id: WorkerId,
    stopped: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    completed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl WorkerCore {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            stopped: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
            completed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!("{} asked to stop", self.id);
            // notify_one keeps a permit if the worker is not waiting right now.
            self.stop_signal.notify_one();
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait for the next item, or `None` on timeout or a stop request.
    ///
    /// A timeout is not a reason to exit: the caller re-checks the stop flag.
    async fn next<T>(&self, queue: &StageQueue<T>, wait: Duration) -> Option<(T, crate::Ack)> {
        tokio::select! {
            biased;
            next = queue.get_timeout(wait) => next,
            _ = self.stop_signal.notified() => None,
        }
    }

    fn should_continue<T>(&self, queue: &StageQueue<T>) -> bool {
        !self.is_stopped() || !queue.is_empty()
    }

    fn record_success(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Log a per-item failure at a level matching its severity.
    fn report_failure(&self, index: usize, err: PipelineError) {
        let stage = err.stage().unwrap_or(self.id.kind);
        let err = err.for_item(index);
        match err.severity() {
            ErrorSeverity::Low => warn!(
                "{} failed image {} at {} stage: {}",
                self.id, index, stage, err
            ),
            _ => error!(
                "{} failed image {} at {} stage: {}",
                self.id, index, stage, err
            ),
        }
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            completed_count: self.completed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Fetches and decodes images from the download queue.
#[derive(Clone)]
pub struct DownloadWorker {
    core: WorkerCore,
    input: Arc<StageQueue<ImageTask>>,
    output: Arc<StageQueue<DecodedPayload>>,
    fetcher: Arc<dyn ImageFetcher>,
    stats: Arc<Stats>,
    wait: Duration,
}

impl DownloadWorker {
    pub fn new(
        ordinal: usize,
        input: Arc<StageQueue<ImageTask>>,
        output: Arc<StageQueue<DecodedPayload>>,
        fetcher: Arc<dyn ImageFetcher>,
        stats: Arc<Stats>,
        wait: Duration,
    ) -> Self {
        Self {
            core: WorkerCore::new(WorkerId::new(Stage::Download, ordinal)),
            input,
            output,
            fetcher,
            stats,
            wait,
        }
    }

    pub async fn run(&self) {
        info!("Starting {}", self.core.id);
        self.core.is_running.store(true, Ordering::Relaxed);

        while self.core.should_continue(&self.input) {
            let Some((task, ack)) = self.core.next(&self.input, self.wait).await else {
                continue;
            };
            self.handle(task).await;
            ack.done();
        }

        self.core.is_running.store(false, Ordering::Relaxed);
        info!("{} stopped", self.core.id);
    }

    async fn handle(&self, task: ImageTask) {
        let started = Instant::now();
        match self.download(&task).await {
            Ok(image) => {
                self.stats.record_success(Stage::Download, started.elapsed());
                self.core.record_success();
                debug!(
                    "{} downloaded image {} ({}x{})",
                    self.core.id,
                    task.index,
                    image.width(),
                    image.height()
                );

                self.output
                    .put(DecodedPayload {
                        index: task.index,
                        source: task.source,
                        image,
                    })
                    .await;
            }
            Err(e) => {
                self.stats.record_error(Stage::Download, started.elapsed());
                self.core.record_error();
                self.core.report_failure(task.index, e);
            }
        }
    }

    async fn download(&self, task: &ImageTask) -> Result<image::DynamicImage, PipelineError> {
        let url = &task.source.url;
        let bytes = self.fetcher.fetch(url).await?;
        debug!(
            "{} fetched {} for image {}",
            self.core.id,
            format_bytes(bytes.len()),
            task.index
        );
        image::load_from_memory(&bytes)
            .map_err(|e| PipelineError::fetch(url.as_str(), format!("undecodable image: {e}")))
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn get_stats(&self) -> WorkerStats {
        self.core.stats()
    }
}

/// Runs both analyzers on the shared executor.
#[derive(Clone)]
pub struct ProcessWorker {
    core: WorkerCore,
    input: Arc<StageQueue<DecodedPayload>>,
    output: Arc<StageQueue<ProcessedPayload>>,
    executor: Arc<AnalysisExecutor>,
    lib_analyzer: Arc<dyn ImageAnalyzer>,
    custom_analyzer: Arc<dyn ImageAnalyzer>,
    analysis: AnalysisKind,
    stats: Arc<Stats>,
    wait: Duration,
}

impl ProcessWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ordinal: usize,
        input: Arc<StageQueue<DecodedPayload>>,
        output: Arc<StageQueue<ProcessedPayload>>,
        executor: Arc<AnalysisExecutor>,
        lib_analyzer: Arc<dyn ImageAnalyzer>,
        custom_analyzer: Arc<dyn ImageAnalyzer>,
        analysis: AnalysisKind,
        stats: Arc<Stats>,
        wait: Duration,
    ) -> Self {
        Self {
            core: WorkerCore::new(WorkerId::new(Stage::Process, ordinal)),
            input,
            output,
            executor,
            lib_analyzer,
            custom_analyzer,
            analysis,
            stats,
            wait,
        }
    }

    pub async fn run(&self) {
        info!("Starting {}", self.core.id);
        self.core.is_running.store(true, Ordering::Relaxed);

        while self.core.should_continue(&self.input) {
            let Some((payload, ack)) = self.core.next(&self.input, self.wait).await else {
                continue;
            };
            self.handle(payload).await;
            ack.done();
        }

        self.core.is_running.store(false, Ordering::Relaxed);
        info!("{} stopped", self.core.id);
    }

    async fn handle(&self, payload: DecodedPayload) {
        let DecodedPayload {
            index,
            source,
            image,
        } = payload;

        let lib = self.lib_analyzer.clone();
        let custom = self.custom_analyzer.clone();
        let kind = self.analysis;
        let started = Instant::now();

        let result = self
            .executor
            .run(move || {
                let lib_artifact = lib.analyze(kind, &image)?;
                let custom_artifact = custom.analyze(kind, &image)?;
                Ok((image, lib_artifact, custom_artifact))
            })
            .await;

        match result {
            Ok((original, lib_artifact, custom_artifact)) => {
                self.stats.record_success(Stage::Process, started.elapsed());
                self.core.record_success();
                debug!(
                    "{} analyzed image {} ({} in {:?})",
                    self.core.id,
                    index,
                    kind.tag(),
                    started.elapsed()
                );

                self.output
                    .put(ProcessedPayload {
                        index,
                        source,
                        original,
                        lib_artifact,
                        custom_artifact,
                    })
                    .await;
            }
            Err(e) => {
                self.stats.record_error(Stage::Process, started.elapsed());
                self.core.record_error();
                self.core.report_failure(index, e);
            }
        }
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn get_stats(&self) -> WorkerStats {
        self.core.stats()
    }
}

/// Writes the three artifacts of each processed image.
#[derive(Clone)]
pub struct SaveWorker {
    core: WorkerCore,
    input: Arc<StageQueue<ProcessedPayload>>,
    store: Arc<dyn ImageStore>,
    layout: ArtifactLayout,
    stats: Arc<Stats>,
    wait: Duration,
}

impl SaveWorker {
    pub fn new(
        ordinal: usize,
        input: Arc<StageQueue<ProcessedPayload>>,
        store: Arc<dyn ImageStore>,
        layout: ArtifactLayout,
        stats: Arc<Stats>,
        wait: Duration,
    ) -> Self {
        Self {
            core: WorkerCore::new(WorkerId::new(Stage::Save, ordinal)),
            input,
            store,
            layout,
            stats,
            wait,
        }
    }

    pub async fn run(&self) {
        info!("Starting {}", self.core.id);
        self.core.is_running.store(true, Ordering::Relaxed);

        while self.core.should_continue(&self.input) {
            let Some((payload, ack)) = self.core.next(&self.input, self.wait).await else {
                continue;
            };
            self.handle(payload).await;
            ack.done();
        }

        self.core.is_running.store(false, Ordering::Relaxed);
        info!("{} stopped", self.core.id);
    }

    async fn handle(&self, payload: ProcessedPayload) {
        let started = Instant::now();
        let failures = self.persist(&payload).await;

        if failures.is_empty() {
            self.stats.record_success(Stage::Save, started.elapsed());
            self.core.record_success();
            debug!("{} saved image {}", self.core.id, payload.index);
            return;
        }

        // One error per item, however many of its writes failed.
        self.stats.record_error(Stage::Save, started.elapsed());
        self.core.record_error();
        for failure in failures {
            self.core.report_failure(payload.index, failure);
        }
    }

    /// Returns every failure; an empty vector means all three files were written.
    async fn persist(&self, payload: &ProcessedPayload) -> Vec<PipelineError> {
        let label = payload.source.label_or_default();
        let directory = self.layout.directory(label);
        if let Err(e) = self.store.ensure_directory(&directory).await {
            return vec![e];
        }

        let [original, lib, custom] =
            ArtifactKind::ALL.map(|kind| self.layout.path(payload.index, label, kind));

        let (original, lib, custom) = futures::join!(
            self.store.write_image(&original, &payload.original),
            self.store.write_image(&lib, &payload.lib_artifact),
            self.store.write_image(&custom, &payload.custom_artifact),
        );

        [original, lib, custom]
            .into_iter()
            .filter_map(Result::err)
            .collect()
    }

    pub fn stop(&self) {
        self.core.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    pub fn get_stats(&self) -> WorkerStats {
        self.core.stats()
    }
}
