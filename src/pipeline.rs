//! Pipeline orchestration.
//!
//! [`PipelineManager`] owns the three stage queues, the shared [`Stats`] and
//! the worker pools between them. A run is `initialize` with the sources,
//! `start_workers`, then `wait_for_completion`, which returns only once every
//! item has reached a terminal outcome.

use crate::{
    AnalysisExecutor, ArtifactLayout, Config, CustomAnalyzer, DecodedPayload, DownloadWorker,
    FsImageStore, HttpFetcher, ImageAnalyzer, ImageFetcher, ImageStore, ImageTask,
    LibraryAnalyzer, PipelineError, PipelineProgress, ProcessWorker, ProcessedPayload,
    QueueDepths, SaveWorker, SourceRef, StageQueue, Stats, StatsSnapshot, WorkerStats,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct WorkerRoster {
    started: bool,
    download: Vec<DownloadWorker>,
    process: Vec<ProcessWorker>,
    save: Vec<SaveWorker>,
    handles: Vec<JoinHandle<()>>,
    executor: Option<Arc<AnalysisExecutor>>,
}

impl WorkerRoster {
    fn stop_all(&self) {
        self.download.iter().for_each(DownloadWorker::stop);
        self.process.iter().for_each(ProcessWorker::stop);
        self.save.iter().for_each(SaveWorker::stop);
    }
}

pub struct PipelineManager {
    config: Config,
    fetcher: Arc<dyn ImageFetcher>,
    store: Arc<dyn ImageStore>,
    lib_analyzer: Arc<dyn ImageAnalyzer>,
    custom_analyzer: Arc<dyn ImageAnalyzer>,
    stats: Arc<Stats>,
    download_queue: Arc<StageQueue<ImageTask>>,
    process_queue: Arc<StageQueue<DecodedPayload>>,
    save_queue: Arc<StageQueue<ProcessedPayload>>,
    initialized: AtomicBool,
    roster: Mutex<WorkerRoster>,
}

impl PipelineManager {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<dyn ImageStore>,
        lib_analyzer: Arc<dyn ImageAnalyzer>,
        custom_analyzer: Arc<dyn ImageAnalyzer>,
    ) -> Self {
        let capacity = config.queue_capacity;
        Self {
            fetcher,
            store,
            lib_analyzer,
            custom_analyzer,
            stats: Arc::new(Stats::new()),
            download_queue: Arc::new(StageQueue::unbounded("download")),
            process_queue: Arc::new(StageQueue::with_capacity("process", capacity)),
            save_queue: Arc::new(StageQueue::with_capacity("save", capacity)),
            initialized: AtomicBool::new(false),
            roster: Mutex::new(WorkerRoster::default()),
            config,
        }
    }

    /// Wire the HTTP fetcher, filesystem store and the bundled analyzers.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        config.validate()?;
        let fetcher = Arc::new(HttpFetcher::new(&config)?);
        let store = Arc::new(FsImageStore::new(config.output_format));

        Ok(Self::new(
            config,
            fetcher,
            store,
            Arc::new(LibraryAnalyzer::new()),
            Arc::new(CustomAnalyzer::new()),
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Seed the download queue, numbering sources by input position.
    pub async fn initialize<I, S>(&self, sources: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceRef>,
    {
        let tasks: Vec<ImageTask> = sources
            .into_iter()
            .enumerate()
            .map(|(index, source)| ImageTask {
                index,
                source: source.into(),
            })
            .collect();

        if tasks.is_empty() {
            return Err(PipelineError::Initialization(
                "no image sources supplied".to_string(),
            ));
        }

        if self.initialized.swap(true, Ordering::AcqRel) {
            return Err(PipelineError::Initialization(
                "pipeline is already initialized".to_string(),
            ));
        }

        let total = tasks.len();
        self.stats.begin(total);
        for task in tasks {
            self.download_queue.put(task).await;
        }

        info!(
            "Pipeline run {} initialized with {} images",
            self.stats.run_id(),
            total
        );
        Ok(())
    }

    /// Spawn the three worker pools. Returns as soon as they are running.
    pub async fn start_workers(
        &self,
        download: usize,
        process: usize,
        save: usize,
    ) -> Result<(), PipelineError> {
        if download == 0 || process == 0 || save == 0 {
            return Err(PipelineError::Initialization(format!(
                "worker counts must be positive (download={download}, process={process}, save={save})"
            )));
        }

        let mut roster = self.roster.lock().await;
        if roster.started {
            return Err(PipelineError::Initialization(
                "workers are already started".to_string(),
            ));
        }

        let executor = Arc::new(AnalysisExecutor::new(process)?);
        let layout = ArtifactLayout {
            root: self.config.output_dir.clone(),
            format: self.config.output_format,
            analysis: self.config.analysis,
        };

        for ordinal in 0..download {
            let worker = DownloadWorker::new(
                ordinal,
                self.download_queue.clone(),
                self.process_queue.clone(),
                self.fetcher.clone(),
                self.stats.clone(),
                self.config.dequeue_timeout,
            );
            let task = worker.clone();
            roster.handles.push(tokio::spawn(async move { task.run().await }));
            roster.download.push(worker);
        }

        for ordinal in 0..process {
            let worker = ProcessWorker::new(
                ordinal,
                self.process_queue.clone(),
                self.save_queue.clone(),
                executor.clone(),
                self.lib_analyzer.clone(),
                self.custom_analyzer.clone(),
                self.config.analysis,
                self.stats.clone(),
                self.config.dequeue_timeout,
            );
            let task = worker.clone();
            roster.handles.push(tokio::spawn(async move { task.run().await }));
            roster.process.push(worker);
        }

        for ordinal in 0..save {
            let worker = SaveWorker::new(
                ordinal,
                self.save_queue.clone(),
                self.store.clone(),
                layout.clone(),
                self.stats.clone(),
                self.config.save_dequeue_timeout,
            );
            let task = worker.clone();
            roster.handles.push(tokio::spawn(async move { task.run().await }));
            roster.save.push(worker);
        }

        roster.executor = Some(executor);
        roster.started = true;

        info!(
            "Started {} download, {} process and {} save workers",
            download, process, save
        );
        Ok(())
    }

    /// [`start_workers`](Self::start_workers) with the configured pool sizes.
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.start_workers(
            self.config.download_workers,
            self.config.process_workers,
            self.config.save_workers,
        )
        .await
    }

    /// Suspend until every item is settled, then stop the workers and report.
    ///
    /// Completion is decided by the queues' acknowledgement counters, joined
    /// upstream first: an empty queue with an item still in flight is not done.
    pub async fn wait_for_completion(&self) -> Result<StatsSnapshot, PipelineError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(PipelineError::Initialization(
                "pipeline was never initialized".to_string(),
            ));
        }
        if !self.roster.lock().await.started {
            return Err(PipelineError::Initialization(
                "workers were never started".to_string(),
            ));
        }

        self.download_queue.join().await;
        debug!("Download queue drained");
        self.process_queue.join().await;
        debug!("Process queue drained");
        self.save_queue.join().await;
        debug!("Save queue drained");

        self.stop_workers().await;
        self.stats.finish();

        let snapshot = self.stats.snapshot();
        info!(
            "Pipeline finished: {} saved, {} errors of {} images in {:?}",
            snapshot.saved, snapshot.errors, snapshot.total_images, snapshot.elapsed
        );
        Ok(snapshot)
    }

    /// Stop every worker, await their tasks and shut the executor down.
    ///
    /// Workers finish the item they hold. Safe to call more than once.
    pub async fn stop_workers(&self) {
        let (handles, executor) = {
            let mut roster = self.roster.lock().await;
            roster.stop_all();
            (std::mem::take(&mut roster.handles), roster.executor.take())
        };

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }

        if let Some(executor) = executor {
            executor.shutdown().await;
        }
    }

    /// Non-blocking progress view. Also refreshes the queue depth gauges.
    pub fn current_stats(&self) -> PipelineProgress {
        let queue_depths = QueueDepths {
            download: self.download_queue.len(),
            process: self.process_queue.len(),
            save: self.save_queue.len(),
        };
        self.stats.metrics().set_queue_depths(
            queue_depths.download,
            queue_depths.process,
            queue_depths.save,
        );

        PipelineProgress {
            total: self.stats.total_images(),
            downloaded: self.stats.downloaded(),
            processed: self.stats.processed(),
            saved: self.stats.saved(),
            errors: self.stats.errors(),
            queue_depths,
        }
    }

    /// Items per queue still waiting for an acknowledgement, queued or in flight.
    pub fn pending(&self) -> QueueDepths {
        QueueDepths {
            download: self.download_queue.unfinished(),
            process: self.process_queue.unfinished(),
            save: self.save_queue.unfinished(),
        }
    }

    pub async fn worker_stats(&self) -> Vec<WorkerStats> {
        let roster = self.roster.lock().await;
        roster
            .download
            .iter()
            .map(DownloadWorker::get_stats)
            .chain(roster.process.iter().map(ProcessWorker::get_stats))
            .chain(roster.save.iter().map(SaveWorker::get_stats))
            .collect()
    }
}

impl Drop for PipelineManager {
    fn drop(&mut self) {
        let roster = self.roster.get_mut();
        if !roster.handles.is_empty() {
            warn!("Pipeline dropped with workers still running, stopping them");
            roster.stop_all();
        }
    }
}

impl std::fmt::Debug for PipelineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineManager")
            .field("download_queue", &self.download_queue)
            .field("process_queue", &self.process_queue)
            .field("save_queue", &self.save_queue)
            .field("initialized", &self.initialized.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
