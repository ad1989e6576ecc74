//! Execution units.
//!
//! Every unit owns one [`WorkerContext`] and therefore at most one engine.
//! Units never touch storage; they hand [`TaskOutcome`]s back to the
//! coordinating thread.

use crate::analysis_store::{AnalysisRecord, WorkItem};
use crate::extractor::{ExtractionError, ExtractorConfig, ExtractorFactory, FeatureExtractor};
use anyhow::{Context, Result};
use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct TaskOutcome {
    pub item: WorkItem,
    pub result: Result<AnalysisRecord, ExtractionError>,
}

/// Per-unit state: the engine is built on the first item that reaches it and
/// reused for every later item. A failed build is remembered, not retried.
pub struct WorkerContext {
    factory: Arc<dyn ExtractorFactory>,
    config: ExtractorConfig,
    engine: Option<Result<Box<dyn FeatureExtractor>, String>>,
}

impl WorkerContext {
    pub fn new(factory: Arc<dyn ExtractorFactory>, config: ExtractorConfig) -> Self {
        Self {
            factory,
            config,
            engine: None,
        }
    }

    pub fn has_engine(&self) -> bool {
        matches!(self.engine, Some(Ok(_)))
    }

    /// Analyzes one item. Panics raised by the engine are reported as
    /// [`ExtractionError::Crashed`].
    pub fn run(&mut self, item: &WorkItem, version: &str) -> Result<AnalysisRecord, ExtractionError> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.analyze(item, version))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Extraction of {} panicked: {}", item.item_id, message);
                Err(ExtractionError::Crashed(message))
            }
        }
    }

    fn analyze(&mut self, item: &WorkItem, version: &str) -> Result<AnalysisRecord, ExtractionError> {
        let path = Path::new(&item.source_path);
        // The catalog may be stale by the time the item is picked up
        if !path.exists() {
            return Err(ExtractionError::FileNotFound(path.to_path_buf()));
        }

        let factory = &self.factory;
        let config = &self.config;
        let engine = self.engine.get_or_insert_with(|| {
            debug!("Building extraction engine");
            factory.build(config).map_err(|e| {
                error!("Failed to build extraction engine: {}", e);
                match e {
                    ExtractionError::EngineUnavailable(message) => message,
                    other => other.to_string(),
                }
            })
        });

        match engine {
            Ok(engine) => engine.analyze(&item.item_id, path, version),
            Err(message) => Err(ExtractionError::EngineUnavailable(message.clone())),
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

/// A fixed set of execution units fed from a shared queue.
///
/// Outcomes come back in completion order. Dropping the pool closes the queue
/// and joins every unit.
pub struct WorkerPool {
    task_tx: Option<Sender<WorkItem>>,
    outcome_rx: Receiver<TaskOutcome>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        size: usize,
        factory: Arc<dyn ExtractorFactory>,
        config: &ExtractorConfig,
        version: &str,
    ) -> Result<Self> {
        let (task_tx, task_rx) = channel::unbounded::<WorkItem>();
        let (outcome_tx, outcome_rx) = channel::unbounded::<TaskOutcome>();

        let mut pool = Self {
            task_tx: Some(task_tx),
            outcome_rx,
            handles: Vec::with_capacity(size),
        };

        for unit in 0..size {
            let task_rx = task_rx.clone();
            let outcome_tx = outcome_tx.clone();
            let factory = Arc::clone(&factory);
            let config = config.clone();
            let version = version.to_string();

            // On error the partially built pool is dropped, which joins the
            // units already started
            let handle = std::thread::Builder::new()
                .name(format!("analysis-unit-{}", unit))
                .spawn(move || {
                    let mut context = WorkerContext::new(factory, config);
                    for item in task_rx.iter() {
                        let result = context.run(&item, &version);
                        if outcome_tx.send(TaskOutcome { item, result }).is_err() {
                            break;
                        }
                    }
                    debug!("Execution unit {} finished", unit);
                })
                .with_context(|| format!("Failed to spawn execution unit {}", unit))?;
            pool.handles.push(handle);
        }

        info!("Started {} execution units", size);
        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Queues an item. Fails only when every unit is gone.
    pub fn submit(&self, item: WorkItem) -> Result<(), WorkItem> {
        match &self.task_tx {
            Some(tx) => tx.send(item).map_err(|e| e.into_inner()),
            None => Err(item),
        }
    }

    /// No more submissions; units exit once the queue drains.
    pub fn close(&mut self) {
        self.task_tx.take();
    }

    /// Next completed task. `None` once the pool is closed, the queue is
    /// drained and every unit has exited.
    pub fn recv(&self) -> Option<TaskOutcome> {
        self.outcome_rx.recv().ok()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("analysis-unit").to_string();
            if handle.join().is_err() {
                warn!("Execution unit {} terminated abnormally", name);
            }
        }
    }
}
