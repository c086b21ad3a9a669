#[cfg(test)]
mod integration_tests {
    use crate::{
        AnalysisKind, Config, CustomAnalyzer, FsImageStore, ImageAnalyzer, ImageFetcher,
        ImageStore, LibraryAnalyzer, MockImageFetcher, MockImageStore, OutputFormat,
        PipelineError, PipelineManager, QueueDepths, SourceRef, Stage,
    };
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 120, 40])));
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    fn test_config() -> Config {
        Config {
            dequeue_timeout: Duration::from_millis(50),
            save_dequeue_timeout: Duration::from_millis(50),
            output_dir: PathBuf::from("out"),
            output_format: OutputFormat::Png,
            ..Default::default()
        }
    }

    /// Serves canned responses; unknown URLs behave like a 404.
    #[derive(Default)]
    struct StubFetcher {
        responses: HashMap<String, Result<Vec<u8>, String>>,
    }

    impl StubFetcher {
        fn image(mut self, url: &str, width: u32, height: u32) -> Self {
            self.responses.insert(url.to_string(), Ok(png_bytes(width, height)));
            self
        }

        fn bytes(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(url.to_string(), Ok(body.to_vec()));
            self
        }

        fn failure(mut self, url: &str, reason: &str) -> Self {
            self.responses.insert(url.to_string(), Err(reason.to_string()));
            self
        }
    }

    #[async_trait]
    impl ImageFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, PipelineError> {
            match self.responses.get(url) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(reason)) => Err(PipelineError::fetch(url, reason.clone())),
                None => Err(PipelineError::fetch(url, "HTTP 404")),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct WriteRecord {
        path: PathBuf,
        width: u32,
    }

    /// In-memory store recording every write; paths containing `fail_on` are rejected.
    #[derive(Default)]
    struct RecordingStore {
        directories: Mutex<Vec<PathBuf>>,
        writes: Mutex<Vec<WriteRecord>>,
        fail_on: Option<String>,
    }

    impl RecordingStore {
        fn failing_on(pattern: &str) -> Self {
            Self {
                fail_on: Some(pattern.to_string()),
                ..Default::default()
            }
        }

        fn writes(&self) -> Vec<WriteRecord> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageStore for RecordingStore {
        async fn ensure_directory(&self, path: &Path) -> Result<(), PipelineError> {
            self.directories.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }

        async fn write_image(&self, path: &Path, image: &DynamicImage) -> Result<(), PipelineError> {
            if let Some(pattern) = &self.fail_on {
                if path.to_string_lossy().contains(pattern.as_str()) {
                    return Err(PipelineError::persist(path, "disk full"));
                }
            }
            self.writes.lock().unwrap().push(WriteRecord {
                path: path.to_path_buf(),
                width: image.width(),
            });
            Ok(())
        }
    }

    /// Returns its input unchanged after `delay`, failing images of `reject_width`.
    struct EchoAnalyzer {
        delay: Duration,
        reject_width: Option<u32>,
    }

    impl EchoAnalyzer {
        fn instant() -> Self {
            Self {
                delay: Duration::ZERO,
                reject_width: None,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                reject_width: None,
            }
        }

        fn rejecting(width: u32) -> Self {
            Self {
                delay: Duration::ZERO,
                reject_width: Some(width),
            }
        }

        fn echo(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
            std::thread::sleep(self.delay);
            if Some(image.width()) == self.reject_width {
                return Err(PipelineError::analysis("rejected by test analyzer"));
            }
            Ok(image.clone())
        }
    }

    impl ImageAnalyzer for EchoAnalyzer {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn detect_edges(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
            self.echo(image)
        }

        fn detect_corners(&self, image: &DynamicImage) -> Result<DynamicImage, PipelineError> {
            self.echo(image)
        }
    }

    fn pipeline(
        config: Config,
        fetcher: impl ImageFetcher + 'static,
        store: Arc<dyn ImageStore>,
        analyzer: EchoAnalyzer,
    ) -> PipelineManager {
        PipelineManager::new(
            config,
            Arc::new(fetcher),
            store,
            Arc::new(analyzer),
            Arc::new(EchoAnalyzer::instant()),
        )
    }

    #[tokio::test]
    async fn test_successful_item_and_404_item() {
        let fetcher = StubFetcher::default().image("u0", 8, 8).failure("u1", "HTTP 404");
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(test_config(), fetcher, store.clone(), EchoAnalyzer::instant());

        manager.initialize(["u0", "u1"]).await.unwrap();
        manager.start_workers(2, 1, 1).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.total_images, 2);
        assert_eq!(stats.downloaded, 1);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.saved, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.download_errors, 1);

        assert_eq!(
            *store.directories.lock().unwrap(),
            vec![PathBuf::from("out/Unknown")]
        );

        let mut paths: Vec<_> = store.writes().into_iter().map(|w| w.path).collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("out/Unknown/0_Unknown_custom_edges.png"),
                PathBuf::from("out/Unknown/0_Unknown_lib_edges.png"),
                PathBuf::from("out/Unknown/0_Unknown_original.png"),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_input_is_rejected() {
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(test_config(), StubFetcher::default(), store, EchoAnalyzer::instant());

        let err = manager.initialize(Vec::<String>::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Initialization(_)));

        // Nothing was seeded, so a later initialize still works.
        manager.initialize(["u0"]).await.unwrap();
    }

    #[tokio::test]
    async fn test_lifecycle_misuse_is_an_initialization_error() {
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(test_config(), StubFetcher::default(), store, EchoAnalyzer::instant());

        assert!(matches!(
            manager.wait_for_completion().await,
            Err(PipelineError::Initialization(_))
        ));

        manager.initialize(["u0"]).await.unwrap();
        assert!(matches!(
            manager.initialize(["u1"]).await,
            Err(PipelineError::Initialization(_))
        ));
        assert!(matches!(
            manager.wait_for_completion().await,
            Err(PipelineError::Initialization(_))
        ));
        assert!(matches!(
            manager.start_workers(1, 0, 1).await,
            Err(PipelineError::Initialization(_))
        ));

        manager.start_workers(1, 1, 1).await.unwrap();
        assert!(matches!(
            manager.start_workers(1, 1, 1).await,
            Err(PipelineError::Initialization(_))
        ));

        let stats = manager.wait_for_completion().await.unwrap();
        assert_eq!(stats.download_errors, 1);
    }

    #[tokio::test]
    async fn test_partial_failure_isolation() {
        let fetcher = StubFetcher::default()
            .image("a", 4, 4)
            .failure("b", "request timed out")
            .image("c", 4, 4);
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(test_config(), fetcher, store.clone(), EchoAnalyzer::instant());

        manager.initialize(["a", "b", "c"]).await.unwrap();
        manager.start_workers(3, 2, 2).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.saved, 2);
        assert_eq!(store.writes().len(), 6);
        assert!(!store.writes().iter().any(|w| w.path.to_string_lossy().contains("/1_")));
    }

    #[tokio::test]
    async fn test_conservation_across_every_stage() {
        // 0, 3, 6 succeed; 1 is a 404; 2 is not an image; 4 is rejected by
        // the analyzer; 5 fails to save.
        let fetcher = StubFetcher::default()
            .image("u0", 8, 8)
            .bytes("u2", b"definitely not a png")
            .image("u3", 8, 8)
            .image("u4", 13, 8)
            .image("u5", 8, 8)
            .image("u6", 8, 8);
        let store = Arc::new(RecordingStore::failing_on("5_Unknown_lib"));
        let manager = pipeline(test_config(), fetcher, store.clone(), EchoAnalyzer::rejecting(13));

        let sources: Vec<String> = (0..7).map(|i| format!("u{i}")).collect();
        manager.initialize(sources).await.unwrap();
        manager.start_workers(3, 2, 2).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.total_images, 7);
        assert_eq!(stats.download_errors, 2);
        assert_eq!(stats.process_errors, 1);
        assert_eq!(stats.save_errors, 1);
        assert_eq!(stats.saved, 3);
        assert_eq!(stats.saved + stats.errors, stats.total_images);
        assert_eq!(stats.downloaded, stats.processed + stats.process_errors);
        assert_eq!(stats.processed, stats.saved + stats.save_errors);

        // The other two writes of the failing item still went through.
        let item5 = store
            .writes()
            .into_iter()
            .filter(|w| w.path.to_string_lossy().contains("5_Unknown"))
            .count();
        assert_eq!(item5, 2);
    }

    #[tokio::test]
    async fn test_every_put_is_acknowledged_once() {
        let fetcher = (0..10).fold(StubFetcher::default(), |f, i| {
            if i % 3 == 0 {
                f.failure(&format!("u{i}"), "HTTP 500")
            } else {
                f.image(&format!("u{i}"), 4, 4)
            }
        });
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(test_config(), fetcher, store, EchoAnalyzer::instant());

        manager
            .initialize((0..10).map(|i| format!("u{i}")))
            .await
            .unwrap();
        manager.start_workers(4, 2, 3).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.saved + stats.errors, 10);
        assert_eq!(manager.pending(), QueueDepths::default());
        assert_eq!(manager.current_stats().queue_depths, QueueDepths::default());
    }

    #[tokio::test]
    async fn test_no_premature_completion_with_slow_analyzer() {
        let fetcher = StubFetcher::default()
            .image("u0", 4, 4)
            .image("u1", 4, 4)
            .image("u2", 4, 4);
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(
            test_config(),
            fetcher,
            store.clone(),
            EchoAnalyzer::slow(Duration::from_millis(150)),
        );

        manager.initialize(["u0", "u1", "u2"]).await.unwrap();
        manager.start_workers(3, 1, 1).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        // The download queue empties almost at once; completion must still
        // wait for every slow analysis and every write.
        assert_eq!(stats.saved, 3);
        assert_eq!(store.writes().len(), 9);
        assert!(stats.elapsed >= Duration::from_millis(450));
        assert!(manager.current_stats().is_complete());
    }

    #[tokio::test]
    async fn test_outputs_keep_their_input_index() {
        let mut fetcher = StubFetcher::default();
        let mut sources = Vec::new();
        for i in 0..6u32 {
            let url = format!("https://cdn/{i}.png");
            fetcher = fetcher.image(&url, i + 1, 3);
            sources.push(SourceRef::new(url).with_label(if i % 2 == 0 { "Bengal" } else { "Maine Coon" }));
        }
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(
            test_config(),
            fetcher,
            store.clone(),
            EchoAnalyzer::slow(Duration::from_millis(5)),
        );

        manager.initialize(sources).await.unwrap();
        manager.start_workers(4, 3, 2).await.unwrap();
        manager.wait_for_completion().await.unwrap();

        let writes = store.writes();
        assert_eq!(writes.len(), 18);
        for i in 0..6u32 {
            let label = if i % 2 == 0 { "Bengal" } else { "Maine_Coon" };
            let expected = PathBuf::from(format!("out/{label}/{i}_{label}_original.png"));
            let write = writes.iter().find(|w| w.path == expected).unwrap();
            assert_eq!(write.width, i + 1, "artifact {} carries another image", expected.display());
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let fetcher = StubFetcher::default().image("u0", 4, 4);
        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(test_config(), fetcher, store, EchoAnalyzer::instant());

        manager.initialize(["u0"]).await.unwrap();
        manager.start_workers(2, 2, 2).await.unwrap();
        let first = manager.wait_for_completion().await.unwrap();

        manager.stop_workers().await;
        manager.stop_workers().await;
        let second = manager.wait_for_completion().await.unwrap();
        assert_eq!(first.saved, second.saved);

        let workers = manager.worker_stats().await;
        assert_eq!(workers.len(), 6);
        assert!(workers.iter().all(|w| !w.is_running));
        assert_eq!(workers.iter().map(|w| w.completed_count).sum::<usize>(), 3);
    }

    #[tokio::test]
    async fn test_bounded_queues_apply_backpressure() {
        let fetcher = (0..20).fold(StubFetcher::default(), |f, i| f.image(&format!("u{i}"), 4, 4));
        let store = Arc::new(RecordingStore::default());
        let config = Config {
            queue_capacity: Some(1),
            ..test_config()
        };
        let manager = pipeline(config, fetcher, store.clone(), EchoAnalyzer::slow(Duration::from_millis(2)));

        manager
            .initialize((0..20).map(|i| format!("u{i}")))
            .await
            .unwrap();
        manager.start_workers(6, 1, 1).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.saved, 20);
        assert_eq!(store.writes().len(), 60);
    }

    #[tokio::test]
    async fn test_unimplemented_circle_detection_fails_process_stage() {
        let fetcher = StubFetcher::default().image("u0", 6, 6).image("u1", 6, 6);
        let store = Arc::new(RecordingStore::default());
        let config = Config {
            analysis: AnalysisKind::Circles,
            ..test_config()
        };
        let manager = PipelineManager::new(
            config,
            Arc::new(fetcher),
            store.clone(),
            Arc::new(LibraryAnalyzer::new()),
            Arc::new(CustomAnalyzer::new()),
        );

        manager.initialize(["u0", "u1"]).await.unwrap();
        manager.start_workers(1, 1, 1).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.process_errors, 2);
        assert_eq!(stats.saved, 0);
        assert!(store.writes().is_empty());
        assert_eq!(manager.stats().errors_at(Stage::Process), 2);
    }

    #[tokio::test]
    async fn test_directory_failure_counts_one_save_error() {
        let mut store = MockImageStore::new();
        store
            .expect_ensure_directory()
            .times(2)
            .returning(|path| Err(PipelineError::persist(path, "read-only file system")));
        store.expect_write_image().never();

        let fetcher = StubFetcher::default().image("u0", 4, 4).image("u1", 4, 4);
        let manager = pipeline(test_config(), fetcher, Arc::new(store), EchoAnalyzer::instant());

        manager.initialize(["u0", "u1"]).await.unwrap();
        manager.start_workers(1, 1, 1).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.save_errors, 2);
        assert_eq!(stats.saved, 0);
    }

    #[tokio::test]
    async fn test_all_three_writes_attempted_when_one_fails() {
        let mut store = MockImageStore::new();
        store.expect_ensure_directory().returning(|_| Ok(()));
        store
            .expect_write_image()
            .times(3)
            .returning(|path, _| {
                if path.to_string_lossy().contains("_custom_") {
                    Err(PipelineError::persist(path, "quota exceeded"))
                } else {
                    Ok(())
                }
            });

        let fetcher = StubFetcher::default().image("u0", 4, 4);
        let manager = pipeline(test_config(), fetcher, Arc::new(store), EchoAnalyzer::instant());

        manager.initialize(["u0"]).await.unwrap();
        manager.start_workers(1, 1, 1).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.save_errors, 1);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test]
    async fn test_fetcher_is_called_once_per_item() {
        let mut fetcher = MockImageFetcher::new();
        fetcher
            .expect_fetch()
            .withf(|url: &str| url.starts_with("https://ok/"))
            .times(2)
            .returning(|_| Ok(png_bytes(3, 3)));
        fetcher
            .expect_fetch()
            .withf(|url: &str| url.starts_with("https://gone/"))
            .times(1)
            .returning(|url| Err(PipelineError::fetch(url, "HTTP 410")));

        let store = Arc::new(RecordingStore::default());
        let manager = pipeline(test_config(), fetcher, store, EchoAnalyzer::instant());

        manager
            .initialize(["https://ok/1.png", "https://gone/2.png", "https://ok/3.png"])
            .await
            .unwrap();
        manager.start_workers(2, 1, 1).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();

        assert_eq!(stats.downloaded, 2);
        assert_eq!(stats.download_errors, 1);
    }

    #[tokio::test]
    async fn test_end_to_end_on_disk_with_bundled_analyzers() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            output_dir: dir.path().to_path_buf(),
            ..test_config()
        };
        let fetcher = StubFetcher::default()
            .image("https://cdn/a.jpg", 24, 16)
            .image("https://cdn/b.jpg", 16, 16);
        let manager = PipelineManager::new(
            config,
            Arc::new(fetcher),
            Arc::new(FsImageStore::new(OutputFormat::Png)),
            Arc::new(LibraryAnalyzer::new()),
            Arc::new(CustomAnalyzer::new()),
        );

        manager
            .initialize([
                SourceRef::new("https://cdn/a.jpg").with_label("Maine Coon"),
                SourceRef::new("https://cdn/b.jpg"),
            ])
            .await
            .unwrap();
        manager.start_workers(2, 2, 2).await.unwrap();
        let stats = manager.wait_for_completion().await.unwrap();
        assert_eq!(stats.saved, 2);

        for name in [
            "Maine_Coon/0_Maine_Coon_original.png",
            "Maine_Coon/0_Maine_Coon_lib_edges.png",
            "Maine_Coon/0_Maine_Coon_custom_edges.png",
            "Unknown/1_Unknown_original.png",
            "Unknown/1_Unknown_lib_edges.png",
            "Unknown/1_Unknown_custom_edges.png",
        ] {
            let path = dir.path().join(name);
            let image = image::open(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()));
            assert!(image.width() > 0);
        }
    }
}
