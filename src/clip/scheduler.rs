//! Owner of the decoder threads, assigns new readers to them
use super::manager::{ManagerShared, ReadManager};
use super::reader::{ClipNotifier, ClipReader, ReaderOptions};
use crate::config::ClipConfig;
use crate::decoder::{default_factory, BackendFactory, ClipSource};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use smallvec::SmallVec;

use std::sync::Arc;
use std::thread::JoinHandle;

struct Worker {
    shared: Arc<ManagerShared>,
    thread: Option<JoinHandle<()>>,
}

/// Spawns up to `max_threads` decoder threads on demand.
///
/// Dropping the scheduler stops all threads; readers still alive afterwards
/// keep their last frame but no longer animate.
pub struct ClipScheduler {
    config: ClipConfig,
    factory: BackendFactory,
    workers: Mutex<SmallVec<[Worker; 8]>>,
}

impl ClipScheduler {
    pub fn new(config: ClipConfig) -> Self {
        Self::with_factory(config, default_factory())
    }

    /// Scheduler constructing backends through `factory` instead of format sniffing
    pub fn with_factory(config: ClipConfig, factory: BackendFactory) -> Self {
        Self {
            config,
            factory,
            workers: Mutex::new(SmallVec::new()),
        }
    }

    pub fn config(&self) -> &ClipConfig {
        &self.config
    }

    /// Opens a clip on the least busy thread.
    ///
    /// Decoding starts right away; `notifier` receives the reader's events.
    pub fn open(
        &self,
        source: ClipSource,
        options: ReaderOptions,
        notifier: ClipNotifier,
    ) -> Result<ClipReader> {
        let manager = self.pick_worker()?;
        let reader = manager.open_reader(source, options, notifier, self.config.placeholder_cost);

        log::info!(
            "Opened reader {} on clip reader thread {}",
            reader.id(),
            manager.index
        );
        Ok(reader)
    }

    fn pick_worker(&self) -> Result<Arc<ManagerShared>> {
        let mut workers = self.workers.lock();

        if workers.len() < self.config.max_threads.max(1) {
            match self.spawn_worker(workers.len()) {
                Ok(worker) => {
                    let shared = Arc::clone(&worker.shared);
                    workers.push(worker);
                    return Ok(shared);
                }
                Err(err) if !workers.is_empty() => {
                    log::warn!("{err:#}, reusing existing threads");
                }
                Err(err) => return Err(err),
            }
        }

        workers
            .iter()
            .enumerate()
            .min_by_key(|(index, worker)| (worker.shared.load(), *index))
            .map(|(_, worker)| Arc::clone(&worker.shared))
            .context("No clip reader thread available")
    }

    fn spawn_worker(&self, index: usize) -> Result<Worker> {
        let (shared, events) = ManagerShared::new(index);

        let thread_shared = Arc::clone(&shared);
        let config = self.config.clone();
        let factory = Arc::clone(&self.factory);
        let thread = std::thread::Builder::new()
            .name(format!("clip-reader-{index}"))
            .spawn(move || {
                let manager = ReadManager::new(thread_shared, config, factory);
                smol::block_on(manager.run(events));
            })
            .with_context(|| format!("Could not spawn clip reader thread {index}"))?;

        log::info!("Spawned clip reader thread {index}");
        Ok(Worker {
            shared,
            thread: Some(thread),
        })
    }

    /// Number of live readers per thread, in thread order
    pub fn reader_counts(&self) -> Vec<usize> {
        self.workers
            .lock()
            .iter()
            .map(|worker| worker.shared.reader_count())
            .collect()
    }

    /// Load estimate per thread, in thread order
    pub fn loads(&self) -> Vec<u64> {
        self.workers
            .lock()
            .iter()
            .map(|worker| worker.shared.load())
            .collect()
    }

    pub fn thread_count(&self) -> usize {
        self.workers.lock().len()
    }
}

impl Drop for ClipScheduler {
    fn drop(&mut self) {
        let mut workers = self.workers.lock();
        for worker in workers.iter() {
            worker.shared.shutdown();
        }
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    log::error!("Clip reader thread {} panicked", worker.shared.index);
                }
            }
        }
    }
}
