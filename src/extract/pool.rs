//! Engine reuse across batches
//!
//! Engines released after a batch stay idle in the pool and are handed out
//! again while the requested [`EngineSpec`] is unchanged. Requesting a
//! different spec drops the idle engines of the old one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::vision::{BackendLoader, EngineSpec, RecognitionEngine};

/// How a parallel batch uses engines
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum EngineStrategy {
    /// One engine serialized behind a lock; decoding still runs in parallel
    Shared,
    /// One engine per worker thread
    #[default]
    PerWorker,
}

struct Idle {
    spec: Option<EngineSpec>,
    engines: Vec<RecognitionEngine>,
}

/// Cache of initialized engines
pub struct EnginePool {
    loader: Arc<dyn BackendLoader>,
    idle: Mutex<Idle>,
}

impl EnginePool {
    pub fn new(loader: Arc<dyn BackendLoader>) -> Self {
        Self {
            loader,
            idle: Mutex::new(Idle {
                spec: None,
                engines: Vec::new(),
            }),
        }
    }

    pub fn loader(&self) -> &dyn BackendLoader {
        self.loader.as_ref()
    }

    /// Take an idle engine for `spec` or initialize a new one
    pub fn acquire(&self, spec: &EngineSpec) -> Result<RecognitionEngine, ConfigurationError> {
        let mut engines = self.acquire_many(spec, 1)?;
        Ok(engines.remove(0))
    }

    /// Take `count` engines for `spec`, initializing only the shortfall.
    ///
    /// The spec is re-validated even when idle engines exist, so a model
    /// directory removed between batches still fails fast.
    pub fn acquire_many(
        &self,
        spec: &EngineSpec,
        count: usize,
    ) -> Result<Vec<RecognitionEngine>, ConfigurationError> {
        spec.validate()?;

        let mut engines = {
            let mut idle = self.idle.lock();
            if idle.spec.as_ref() != Some(spec) {
                if !idle.engines.is_empty() {
                    debug!("Dropping {} idle engines for a changed spec", idle.engines.len());
                }
                idle.engines.clear();
                idle.spec = Some(spec.clone());
            }
            let take = count.min(idle.engines.len());
            let keep = idle.engines.len() - take;
            idle.engines.split_off(keep)
        };

        if !engines.is_empty() {
            debug!("Reusing {} idle engines", engines.len());
        }

        while engines.len() < count {
            engines.push(RecognitionEngine::initialize(self.loader(), spec.clone())?);
        }

        Ok(engines)
    }

    /// Return an engine for later batches
    pub fn release(&self, engine: RecognitionEngine) {
        let mut idle = self.idle.lock();
        if idle.spec.as_ref() == Some(engine.spec()) {
            idle.engines.push(engine);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().engines.len()
    }

    /// Drop all idle engines
    pub fn clear(&self) {
        let mut idle = self.idle.lock();
        idle.engines.clear();
        idle.spec = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::engine::testing::{model_dir, FakeLoader};
    use crate::vision::EngineMode;

    #[test]
    fn test_reuse_for_unchanged_spec() {
        let dir = model_dir(&["eng"]);
        let loader = FakeLoader::default();
        let pool = EnginePool::new(Arc::new(loader.clone()));
        let spec = EngineSpec::new(dir.path(), "eng", EngineMode::Default);

        let engines = pool.acquire_many(&spec, 3).unwrap();
        assert_eq!(loader.load_count(), 3);
        for engine in engines {
            pool.release(engine);
        }
        assert_eq!(pool.idle_count(), 3);

        let engines = pool.acquire_many(&spec, 4).unwrap();
        assert_eq!(engines.len(), 4);
        assert_eq!(loader.load_count(), 4);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_changed_spec_drops_idle_engines() {
        let dir = model_dir(&["eng", "rus"]);
        let loader = FakeLoader::default();
        let pool = EnginePool::new(Arc::new(loader.clone()));

        let eng = EngineSpec::new(dir.path(), "eng", EngineMode::Default);
        pool.release(pool.acquire(&eng).unwrap());
        assert_eq!(pool.idle_count(), 1);

        let rus = EngineSpec::new(dir.path(), "rus", EngineMode::Default);
        let engine = pool.acquire(&rus).unwrap();
        assert_eq!(engine.spec().language, "rus");
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(loader.load_count(), 2);

        // A stale engine for the old spec is not kept
        let old = RecognitionEngine::initialize(&FakeLoader::default(), eng).unwrap();
        pool.release(old);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_mode_change_is_a_different_spec() {
        let dir = model_dir(&["eng"]);
        let loader = FakeLoader::default();
        let pool = EnginePool::new(Arc::new(loader.clone()));

        pool.release(pool.acquire(&EngineSpec::new(dir.path(), "eng", EngineMode::Default)).unwrap());
        pool.acquire(&EngineSpec::new(dir.path(), "eng", EngineMode::LstmOnly)).unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[test]
    fn test_clear_forces_reload() {
        let dir = model_dir(&["eng"]);
        let loader = FakeLoader::default();
        let pool = EnginePool::new(Arc::new(loader.clone()));
        let spec = EngineSpec::new(dir.path(), "eng", EngineMode::Default);

        pool.release(pool.acquire(&spec).unwrap());
        pool.clear();
        assert_eq!(pool.idle_count(), 0);
        pool.acquire(&spec).unwrap();
        assert_eq!(loader.load_count(), 2);
    }

    #[test]
    fn test_acquire_revalidates() {
        let dir = model_dir(&["eng"]);
        let pool = EnginePool::new(Arc::new(FakeLoader::default()));
        let spec = EngineSpec::new(dir.path(), "eng", EngineMode::Default);
        pool.release(pool.acquire(&spec).unwrap());

        std::fs::remove_file(dir.path().join("eng.traineddata")).unwrap();
        let err = pool.acquire(&spec).unwrap_err();
        assert!(matches!(err, ConfigurationError::ModelNotFound { .. }));
    }
}
