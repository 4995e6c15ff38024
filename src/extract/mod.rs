//! Batch Extraction
//!
//! Runs recognition over an ordered batch of images. Each image is decoded,
//! optionally preprocessed, and recognized independently; a failure is
//! recorded against that image and the batch carries on. Outcomes come back
//! in input order whatever order workers finish in.

pub mod events;
pub mod pool;
pub mod result;

pub use events::ExtractEvent;
pub use pool::{EnginePool, EngineStrategy};
pub use result::{BatchStatus, ExtractionEntry, ExtractionResult, PerImageOutcome};

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::acquire::{ImageHandle, ImageSource};
use crate::config::{AppConfig, OcrPreprocessing};
use crate::error::{ConfigurationError, ErrorKind, ImageError};
use crate::vision::ocr_preprocess::preprocess;
use crate::vision::{BackendLoader, EngineSpec, RecognitionEngine};

/// Options for one extractor
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Upper bound on worker threads
    pub workers: usize,
    pub strategy: EngineStrategy,
    pub preprocessing: OcrPreprocessing,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            strategy: EngineStrategy::PerWorker,
            preprocessing: OcrPreprocessing::default(),
        }
    }
}

impl ExtractOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.batch.effective_workers(),
            strategy: config.batch.strategy,
            preprocessing: config.preprocessing.clone(),
        }
    }
}

/// Per-worker recognition step
type RecognizeFn<'a, W> = dyn Fn(&mut W, &ImageHandle) -> Result<String, ImageError> + Sync + 'a;

/// Orchestrates recognition across a batch of images
pub struct BatchExtractor {
    pool: EnginePool,
    options: ExtractOptions,
    /// Token for the next batch; replaced by `reset_cancellation`
    cancel: Mutex<CancellationToken>,
    events: Option<Sender<ExtractEvent>>,
}

impl BatchExtractor {
    pub fn new(loader: Arc<dyn BackendLoader>, options: ExtractOptions) -> Self {
        Self {
            pool: EnginePool::new(loader),
            options,
            cancel: Mutex::new(CancellationToken::new()),
            events: None,
        }
    }

    /// Send progress events to `sender`
    pub fn with_events(mut self, sender: Sender<ExtractEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Use `token` for cooperative cancellation
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        *self.cancel.get_mut() = token;
        self
    }

    /// Token that cancels batches run by this extractor.
    ///
    /// Once cancelled it stays cancelled, and so does every later batch,
    /// until `reset_cancellation` installs a new one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    /// Replace a spent token so the next batch runs normally.
    /// Tokens handed out before the reset no longer affect this extractor.
    pub fn reset_cancellation(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    pub fn options(&self) -> &ExtractOptions {
        &self.options
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    /// Run a batch sequentially on a caller-owned engine
    pub fn extract(&self, engine: &mut RecognitionEngine, images: &[ImageSource]) -> ExtractionResult {
        let batch_id = Uuid::new_v4();
        let start = Instant::now();
        let cancel = self.cancellation_token();
        self.emit(ExtractEvent::BatchStarted {
            batch_id,
            total: images.len(),
            workers: 1,
        });

        let mut entries = Vec::with_capacity(images.len());
        for (index, source) in images.iter().enumerate() {
            let outcome = if cancel.is_cancelled() {
                PerImageOutcome::cancelled()
            } else {
                self.process_image(source, |handle| engine.recognize(handle))
            };
            self.emit_finished(batch_id, index, source, &outcome);
            entries.push(ExtractionEntry {
                source_path: source.path().to_path_buf(),
                outcome,
            });
        }

        self.finish(batch_id, entries, start)
    }

    /// Validate `spec`, acquire engines, and run the batch on the worker pool.
    ///
    /// Configuration problems are returned before any image is touched.
    pub fn run(
        &self,
        spec: &EngineSpec,
        images: &[ImageSource],
    ) -> Result<ExtractionResult, ConfigurationError> {
        spec.validate()?;

        if images.is_empty() {
            debug!("Empty batch, no engine needed");
            return Ok(self.finish(Uuid::new_v4(), Vec::new(), Instant::now()));
        }

        let workers = self.options.workers.clamp(1, images.len());

        match self.options.strategy {
            EngineStrategy::PerWorker if workers == 1 => {
                let mut engine = self.pool.acquire(spec)?;
                let result = self.extract(&mut engine, images);
                self.pool.release(engine);
                Ok(result)
            }
            EngineStrategy::PerWorker => {
                let engines = self.pool.acquire_many(spec, workers)?;
                let recognize = |engine: &mut RecognitionEngine, handle: &ImageHandle| {
                    engine.recognize(handle)
                };
                let (engines, result) = self.run_pool(images, engines, &recognize);
                for engine in engines {
                    self.pool.release(engine);
                }
                Ok(result)
            }
            EngineStrategy::Shared => {
                let shared = Mutex::new(self.pool.acquire(spec)?);
                let recognize = |_: &mut (), handle: &ImageHandle| shared.lock().recognize(handle);
                let (_, result) = self.run_pool(images, vec![(); workers], &recognize);
                self.pool.release(shared.into_inner());
                Ok(result)
            }
        }
    }

    /// Spread images over one thread per worker state, collecting by index
    fn run_pool<W: Send>(
        &self,
        images: &[ImageSource],
        states: Vec<W>,
        recognize: &RecognizeFn<'_, W>,
    ) -> (Vec<W>, ExtractionResult) {
        let batch_id = Uuid::new_v4();
        let start = Instant::now();
        let cancel = &self.cancellation_token();
        let workers = states.len();
        self.emit(ExtractEvent::BatchStarted {
            batch_id,
            total: images.len(),
            workers,
        });
        info!("Extracting {} images on {} workers", images.len(), workers);

        let (job_tx, job_rx) = crossbeam_channel::bounded::<(usize, &ImageSource)>(workers * 2);
        let (done_tx, done_rx) = crossbeam_channel::unbounded::<(usize, PerImageOutcome)>();
        let mut slots: Vec<Option<PerImageOutcome>> = vec![None; images.len()];

        let states = std::thread::scope(|scope| {
            let handles: Vec<_> = states
                .into_iter()
                .enumerate()
                .map(|(worker, mut state)| {
                    let job_rx = job_rx.clone();
                    let done_tx = done_tx.clone();
                    scope.spawn(move || {
                        for (index, source) in job_rx.iter() {
                            let outcome = if cancel.is_cancelled() {
                                PerImageOutcome::cancelled()
                            } else {
                                self.process_image(source, |handle| recognize(&mut state, handle))
                            };
                            if done_tx.send((index, outcome)).is_err() {
                                break;
                            }
                        }
                        debug!("Worker {} finished", worker);
                        state
                    })
                })
                .collect();
            drop(job_rx);
            drop(done_tx);

            scope.spawn(move || {
                for job in images.iter().enumerate() {
                    if job_tx.send(job).is_err() {
                        break;
                    }
                }
            });

            for (index, outcome) in done_rx.iter() {
                self.emit_finished(batch_id, index, &images[index], &outcome);
                slots[index] = Some(outcome);
            }

            handles
                .into_iter()
                .filter_map(|handle| match handle.join() {
                    Ok(state) => Some(state),
                    Err(_) => {
                        error!("Extraction worker panicked; its engine is discarded");
                        None
                    }
                })
                .collect::<Vec<_>>()
        });

        let entries = images
            .iter()
            .zip(slots)
            .map(|(source, slot)| ExtractionEntry {
                source_path: source.path().to_path_buf(),
                outcome: slot.unwrap_or_else(|| {
                    PerImageOutcome::failure(
                        ErrorKind::Recognition,
                        "worker stopped before finishing this image",
                    )
                }),
            })
            .collect();

        (states, self.finish(batch_id, entries, start))
    }

    /// Decode, preprocess, recognize. The decoded image is dropped on return.
    ///
    /// A panic inside the recognition library is caught and recorded as a
    /// recognition failure for this image only.
    fn process_image(
        &self,
        source: &ImageSource,
        recognize: impl FnOnce(&ImageHandle) -> Result<String, ImageError>,
    ) -> PerImageOutcome {
        let handle = match source.decode() {
            Ok(handle) => preprocess(handle, &self.options.preprocessing),
            Err(e) => {
                warn!("{}", e);
                return PerImageOutcome::failure(e.kind(), e.detail());
            }
        };

        match panic::catch_unwind(AssertUnwindSafe(|| recognize(&handle))) {
            Ok(Ok(text)) => PerImageOutcome::Text(text),
            Ok(Err(e)) => {
                warn!("{}", e);
                PerImageOutcome::failure(e.kind(), e.detail())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("Recognition panicked on {:?}: {}", source.path(), reason);
                PerImageOutcome::failure(
                    ErrorKind::Recognition,
                    format!("recognition engine panicked: {}", reason),
                )
            }
        }
    }

    fn finish(&self, batch_id: Uuid, entries: Vec<ExtractionEntry>, start: Instant) -> ExtractionResult {
        let result = ExtractionResult::new(batch_id, entries, start.elapsed().as_millis() as u64);
        info!(
            "Batch {} {:?}: {} ok, {} failed in {} ms",
            batch_id,
            result.status(),
            result.text_count(),
            result.failure_count(),
            result.elapsed_ms()
        );
        self.emit(ExtractEvent::BatchFinished {
            batch_id,
            status: result.status(),
            succeeded: result.text_count(),
            failed: result.failure_count(),
        });
        result
    }

    fn emit_finished(&self, batch_id: Uuid, index: usize, source: &ImageSource, outcome: &PerImageOutcome) {
        self.emit(ExtractEvent::ImageFinished {
            batch_id,
            index,
            path: source.path().to_path_buf(),
            error: outcome.error_kind(),
        });
    }

    fn emit(&self, event: ExtractEvent) {
        if let Some(sender) = &self.events {
            let _ = sender.send(event);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquire::source::fixtures::png_bytes;
    use crate::vision::engine::testing::{model_dir, FakeLoader, FAILING_WIDTH, PANICKING_WIDTH};
    use crate::vision::EngineMode;
    use tempfile::TempDir;

    fn valid(name: &str, width: u32, delay_ms: u8) -> ImageSource {
        ImageSource::from_bytes(name, png_bytes(width, 2, [width as u8, 0, delay_ms, 255]))
    }

    fn corrupt(name: &str) -> ImageSource {
        ImageSource::from_bytes(name, b"\x89PNG broken".to_vec())
    }

    fn setup(workers: usize, strategy: EngineStrategy) -> (TempDir, FakeLoader, BatchExtractor, EngineSpec) {
        let dir = model_dir(&["eng"]);
        let loader = FakeLoader::default();
        let extractor = BatchExtractor::new(
            Arc::new(loader.clone()),
            ExtractOptions {
                workers,
                strategy,
                ..Default::default()
            },
        );
        let spec = EngineSpec::new(dir.path(), "eng", EngineMode::Default);
        (dir, loader, extractor, spec)
    }

    fn texts(result: &ExtractionResult) -> Vec<Option<String>> {
        result.outcomes().map(|o| o.text().map(str::to_string)).collect()
    }

    #[test]
    fn test_corrupt_image_isolated() {
        let (_dir, _loader, extractor, spec) = setup(1, EngineStrategy::PerWorker);
        let images = vec![valid("validA.png", 4, 0), corrupt("corrupt.png"), valid("validB.png", 6, 0)];

        let result = extractor.run(&spec, &images).unwrap();

        assert_eq!(result.len(), 3);
        assert_eq!(result.status(), BatchStatus::Completed);
        let outcomes: Vec<_> = result.outcomes().collect();
        assert_eq!(outcomes[0], &PerImageOutcome::Text("eng 4x2 #040000\n".to_string()));
        assert_eq!(outcomes[1].error_kind(), Some(ErrorKind::Decode));
        assert_eq!(outcomes[2], &PerImageOutcome::Text("eng 6x2 #060000\n".to_string()));
        assert_eq!(result.entries()[1].source_path, std::path::PathBuf::from("corrupt.png"));
    }

    #[test]
    fn test_empty_batch_is_success() {
        let (_dir, loader, extractor, spec) = setup(4, EngineStrategy::PerWorker);
        let result = extractor.run(&spec, &[]).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.status(), BatchStatus::Completed);
        assert_eq!(loader.load_count(), 0);
    }

    #[test]
    fn test_missing_model_dir_fails_before_processing() {
        let (_dir, loader, extractor, _) = setup(2, EngineStrategy::PerWorker);
        let (tx, rx) = crossbeam_channel::unbounded();
        let extractor = extractor.with_events(tx);
        let spec = EngineSpec::new("/nonexistent/tessdata", "eng", EngineMode::Default);

        let err = extractor.run(&spec, &[valid("a.png", 4, 0)]).unwrap_err();
        assert!(matches!(err, ConfigurationError::ModelDirMissing { .. }));
        assert_eq!(loader.load_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_recognition_failure_recorded() {
        let (_dir, _loader, extractor, spec) = setup(1, EngineStrategy::PerWorker);
        let images = vec![valid("a.png", 4, 0), valid("bad.png", FAILING_WIDTH, 0)];
        let result = extractor.run(&spec, &images).unwrap();
        assert_eq!(
            result.entries()[1].outcome,
            PerImageOutcome::failure(ErrorKind::Recognition, "internal engine failure")
        );
        assert_eq!(result.text_count(), 1);
    }

    #[test]
    fn test_backend_panic_isolated_for_any_worker_count() {
        for workers in [1, 2] {
            for strategy in [EngineStrategy::PerWorker, EngineStrategy::Shared] {
                let (_dir, _loader, extractor, spec) = setup(workers, strategy);
                let images = vec![
                    valid("a.png", 4, 0),
                    valid("crash.png", PANICKING_WIDTH, 0),
                    valid("c.png", 5, 0),
                ];

                let result = extractor.run(&spec, &images).unwrap();

                let kinds: Vec<_> = result.outcomes().map(|o| o.error_kind()).collect();
                assert_eq!(kinds, vec![None, Some(ErrorKind::Recognition), None], "{workers} {strategy:?}");
                match &result.entries()[1].outcome {
                    PerImageOutcome::Failure { message, .. } => {
                        assert!(message.contains("fake backend crashed"), "{message}")
                    }
                    other => panic!("unexpected outcome: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn test_panicked_engine_still_serves_later_images() {
        let (_dir, loader, extractor, spec) = setup(1, EngineStrategy::PerWorker);
        let mut engine = RecognitionEngine::initialize(&loader, spec).unwrap();
        let images = vec![valid("crash.png", PANICKING_WIDTH, 0), valid("b.png", 5, 0)];

        let result = extractor.extract(&mut engine, &images);
        assert_eq!(result.entries()[0].outcome.error_kind(), Some(ErrorKind::Recognition));
        assert_eq!(result.entries()[1].outcome.text(), Some("eng 5x2 #050000\n"));
    }

    #[test]
    fn test_parallel_preserves_input_order() {
        for strategy in [EngineStrategy::PerWorker, EngineStrategy::Shared] {
            let (_dir, _loader, extractor, spec) = setup(4, strategy);
            // Earlier images sleep longer so they finish last
            let images: Vec<_> = (0..8u32)
                .map(|i| valid(&format!("{i}.png"), 20 + i, (8 - i as u8) * 5))
                .collect();

            let result = extractor.run(&spec, &images).unwrap();

            assert_eq!(result.len(), images.len());
            for (i, entry) in result.entries().iter().enumerate() {
                assert_eq!(entry.source_path, std::path::PathBuf::from(format!("{i}.png")));
                let text = entry.outcome.text().unwrap();
                assert!(text.starts_with(&format!("eng {}x2", 20 + i)), "{strategy:?}: {text}");
            }
        }
    }

    #[test]
    fn test_engine_initialized_once_per_worker() {
        let (_dir, loader, extractor, spec) = setup(3, EngineStrategy::PerWorker);
        let images: Vec<_> = (0..12u32).map(|i| valid("x.png", 20 + i, 0)).collect();

        extractor.run(&spec, &images).unwrap();
        assert_eq!(loader.load_count(), 3);

        // Unchanged spec reuses the idle engines
        extractor.run(&spec, &images).unwrap();
        assert_eq!(loader.load_count(), 3);
    }

    #[test]
    fn test_shared_strategy_loads_one_engine() {
        let (_dir, loader, extractor, spec) = setup(4, EngineStrategy::Shared);
        let images: Vec<_> = (0..10u32).map(|i| valid("x.png", 20 + i, 0)).collect();
        let result = extractor.run(&spec, &images).unwrap();
        assert_eq!(result.text_count(), 10);
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_workers_capped_by_batch_size() {
        let (_dir, loader, extractor, spec) = setup(8, EngineStrategy::PerWorker);
        extractor.run(&spec, &[valid("a.png", 4, 0), valid("b.png", 5, 0)]).unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[test]
    fn test_extract_is_idempotent() {
        let (_dir, loader, extractor, spec) = setup(1, EngineStrategy::PerWorker);
        let mut engine = RecognitionEngine::initialize(&loader, spec).unwrap();
        let images = vec![valid("a.png", 4, 0), corrupt("b.png"), valid("c.png", 9, 0)];

        let first = extractor.extract(&mut engine, &images);
        let second = extractor.extract(&mut engine, &images);

        assert_eq!(texts(&first), texts(&second));
        assert_eq!(first.entries(), second.entries());
        assert_ne!(first.batch_id(), second.batch_id());
        assert_eq!(engine.recognized_count(), 4);
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_cancelled_batch_keeps_length() {
        let (_dir, loader, extractor, spec) = setup(1, EngineStrategy::PerWorker);
        let mut engine = RecognitionEngine::initialize(&loader, spec.clone()).unwrap();
        extractor.cancellation_token().cancel();

        let images = vec![valid("a.png", 4, 0), valid("b.png", 5, 0)];
        let result = extractor.extract(&mut engine, &images);
        assert_eq!(result.len(), 2);
        assert_eq!(result.status(), BatchStatus::Cancelled);
        assert!(result
            .outcomes()
            .all(|o| o.error_kind() == Some(ErrorKind::Cancelled)));

        let parallel = BatchExtractor::new(
            Arc::new(loader.clone()),
            ExtractOptions {
                workers: 2,
                ..Default::default()
            },
        )
        .with_cancellation(extractor.cancellation_token());
        let result = parallel.run(&spec, &images).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.status(), BatchStatus::Cancelled);
    }

    #[test]
    fn test_reset_cancellation_allows_next_batch() {
        let (_dir, _loader, extractor, spec) = setup(2, EngineStrategy::PerWorker);
        let images = vec![valid("a.png", 4, 0), valid("b.png", 5, 0)];

        let stale = extractor.cancellation_token();
        stale.cancel();
        assert_eq!(extractor.run(&spec, &images).unwrap().status(), BatchStatus::Cancelled);
        // Still cancelled without a reset
        assert_eq!(extractor.run(&spec, &images).unwrap().status(), BatchStatus::Cancelled);

        let fresh = extractor.reset_cancellation();
        assert!(!fresh.is_cancelled());
        let result = extractor.run(&spec, &images).unwrap();
        assert_eq!(result.status(), BatchStatus::Completed);
        assert_eq!(result.text_count(), 2);

        stale.cancel();
        assert!(!extractor.cancellation_token().is_cancelled());
    }

    #[test]
    fn test_events_reported() {
        let (_dir, _loader, extractor, spec) = setup(2, EngineStrategy::PerWorker);
        let (tx, rx) = crossbeam_channel::unbounded();
        let extractor = extractor.with_events(tx);
        let images = vec![valid("a.png", 4, 0), corrupt("b.png"), valid("c.png", 5, 0)];

        let result = extractor.run(&spec, &images).unwrap();
        let events: Vec<_> = rx.try_iter().collect();

        assert_eq!(events.len(), 5);
        assert!(matches!(events[0], ExtractEvent::BatchStarted { total: 3, workers: 2, .. }));
        let failed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExtractEvent::ImageFinished { index, error: Some(kind), .. } => Some((*index, *kind)),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![(1, ErrorKind::Decode)]);
        assert_eq!(
            events[4],
            ExtractEvent::BatchFinished {
                batch_id: result.batch_id(),
                status: BatchStatus::Completed,
                succeeded: 2,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_preprocessing_applied_before_recognition() {
        let dir = model_dir(&["eng"]);
        let extractor = BatchExtractor::new(
            Arc::new(FakeLoader::default()),
            ExtractOptions {
                preprocessing: OcrPreprocessing {
                    enabled: true,
                    min_dimension: 0,
                    scale: 2,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let spec = EngineSpec::new(dir.path(), "eng", EngineMode::Default);
        let result = extractor.run(&spec, &[valid("a.png", 4, 0)]).unwrap();
        assert!(result.entries()[0].outcome.text().unwrap().starts_with("eng 8x4"));
    }
}
