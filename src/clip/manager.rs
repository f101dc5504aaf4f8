//! Per-thread scheduler driving all readers assigned to one worker
use super::reader::{ClipEvent, ClipNotifier, ClipReader, ClipState, ReaderId, ReaderOptions, ReaderShared};
use super::state::{ProcessResult, ReaderState};
use crate::config::ClipConfig;
use crate::decoder::{BackendFactory, ClipSource};
use crate::util::clock;

use parking_lot::RwLock;
use smallvec::SmallVec;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) struct NewReader {
    pub shared: Arc<ReaderShared>,
    pub source: ClipSource,
    pub options: ReaderOptions,
}

pub(crate) enum ManagerEvent {
    Append(NewReader),
    /// Some reader's wake flag was set
    Wake,
    Shutdown,
}

struct ReaderEntry {
    /// Wants another processing pass, cleared by the manager only
    wake: AtomicBool,
}

/// The part of a manager other threads talk to
pub(crate) struct ManagerShared {
    pub index: usize,
    readers: RwLock<HashMap<ReaderId, ReaderEntry>>,
    /// Animated pixel area of all readers on this thread
    load: AtomicU64,
    events: smol::channel::Sender<ManagerEvent>,
    /// A `Wake` is queued and not processed yet
    signal_pending: AtomicBool,
}

impl ManagerShared {
    pub fn new(index: usize) -> (Arc<Self>, smol::channel::Receiver<ManagerEvent>) {
        let (events, receiver) = smol::channel::unbounded();
        let shared = Arc::new(Self {
            index,
            readers: RwLock::new(HashMap::new()),
            load: AtomicU64::new(0),
            events,
            signal_pending: AtomicBool::new(false),
        });
        (shared, receiver)
    }

    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.read().len()
    }

    pub fn contains(&self, id: ReaderId) -> bool {
        self.readers.read().contains_key(&id)
    }

    /// Registers a new reader and hands it to the worker thread
    pub fn open_reader(
        self: &Arc<Self>,
        source: ClipSource,
        options: ReaderOptions,
        notifier: ClipNotifier,
        placeholder_cost: u64,
    ) -> ClipReader {
        let shared = Arc::new(ReaderShared::new(ReaderId::next(), notifier, !options.autoplay));
        let id = shared.id;

        self.readers.write().insert(
            id,
            ReaderEntry {
                wake: AtomicBool::new(true),
            },
        );
        self.load.fetch_add(placeholder_cost, Ordering::AcqRel);

        let reader = NewReader {
            shared: Arc::clone(&shared),
            source,
            options,
        };
        if self.events.try_send(ManagerEvent::Append(reader)).is_err() {
            log::error!("Clip reader thread {} is gone, reader {id} will not play", self.index);
        }

        ClipReader::new(shared, Arc::clone(self))
    }

    /// Flags a reader for processing and wakes the thread
    pub fn wake(&self, id: ReaderId) {
        if let Some(entry) = self.readers.read().get(&id) {
            entry.wake.store(true, Ordering::Release);
        }
        self.signal();
    }

    pub fn remove(&self, id: ReaderId) {
        self.readers.write().remove(&id);
        self.signal();
    }

    pub fn shutdown(&self) {
        let _ = self.events.try_send(ManagerEvent::Shutdown);
    }

    fn signal(&self) {
        if !self.signal_pending.swap(true, Ordering::AcqRel) {
            let _ = self.events.try_send(ManagerEvent::Wake);
        }
    }

    fn release_load(&self, amount: u64) {
        let _ = self
            .load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                Some(load.saturating_sub(amount))
            });
    }
}

/// Thread-local half of a manager, owns the reader states
pub(crate) struct ReadManager {
    shared: Arc<ManagerShared>,
    config: ClipConfig,
    factory: BackendFactory,
    states: HashMap<ReaderId, ReaderState>,
}

impl ReadManager {
    pub fn new(shared: Arc<ManagerShared>, config: ClipConfig, factory: BackendFactory) -> Self {
        Self {
            shared,
            config,
            factory,
            states: HashMap::new(),
        }
    }

    /// Returns false once the manager should stop
    pub fn handle_event(&mut self, event: ManagerEvent) -> bool {
        match event {
            ManagerEvent::Append(reader) => {
                let id = reader.shared.id;
                if !self.shared.contains(id) {
                    log::debug!("Reader {id} stopped before reaching its thread");
                    self.shared.release_load(self.config.placeholder_cost);
                    return true;
                }

                let state = ReaderState::new(
                    reader.shared,
                    reader.source,
                    reader.options.mode,
                    Arc::clone(&self.factory),
                    self.config.clone(),
                );
                self.states.insert(id, state);
                true
            }
            ManagerEvent::Wake => true,
            ManagerEvent::Shutdown => false,
        }
    }

    /// One pass over all readers.
    ///
    /// Returns the clip clock time of the earliest next wake, if any.
    pub fn process(&mut self, now: u64) -> Option<u64> {
        self.shared.signal_pending.store(false, Ordering::Release);

        let mut due: SmallVec<[ReaderId; 16]> = SmallVec::new();
        {
            let readers = self.shared.readers.read();
            let shared = &self.shared;
            self.states.retain(|id, state| match readers.get(id) {
                Some(entry) => {
                    let flagged = entry.wake.swap(false, Ordering::AcqRel);
                    if flagged || state.next_wake().is_some_and(|at| at <= now) {
                        due.push(*id);
                    }
                    true
                }
                None => {
                    log::info!("Dropping reader {id}");
                    shared.release_load(state.load);
                    false
                }
            });
        }

        for id in due {
            let Some(mut state) = self.states.remove(&id) else {
                continue;
            };
            let result = state.process(now);
            if self.handle_result(&mut state, result, now) {
                self.states.insert(id, state);
            }
        }

        self.states.values().filter_map(ReaderState::next_wake).min()
    }

    /// Applies a processing result. Returns false if the state has to go.
    fn handle_result(&self, state: &mut ReaderState, mut result: ProcessResult, now: u64) -> bool {
        let shared = Arc::clone(&state.shared);
        loop {
            result = match result {
                ProcessResult::Wait => return true,
                ProcessResult::Started => {
                    let size = state.frame_size();
                    shared.set_dimensions(size);

                    let area = u64::from(size.0) * u64::from(size.1);
                    self.shared.load.fetch_add(area, Ordering::AcqRel);
                    self.shared.release_load(state.load);
                    state.load = area;

                    shared.ring.finish_dimensions();
                    if shared.request.lock().is_some() {
                        shared.ring.supply_request();
                    }
                    shared.notify(ClipEvent::Reinit);
                    state.process(now)
                }
                ProcessResult::Paused => {
                    log::debug!("Reader {} auto-paused", shared.id);
                    return true;
                }
                ProcessResult::Repaint => self.repaint(state, now),
                ProcessResult::CopyFrame => {
                    if !self.shared.contains(shared.id) {
                        log::debug!("Reader {} stopped while decoding", shared.id);
                        self.shared.release_load(state.load);
                        return false;
                    }
                    match state.publish(now) {
                        Ok(()) => {
                            shared.notify(ClipEvent::Repaint);
                            ProcessResult::Wait
                        }
                        Err(err) => {
                            log::error!("Could not publish frame of reader {}: {err:#}", shared.id);
                            ProcessResult::Error
                        }
                    }
                }
                ProcessResult::Error => {
                    self.shared.readers.write().remove(&shared.id);
                    self.shared.release_load(state.load);
                    if shared.finish(ClipState::Error) {
                        shared.notify(ClipEvent::Reinit);
                    }
                    return false;
                }
            };
        }
    }

    /// Decides what a due reader does: pause, wait for a slot or decode
    fn repaint(&self, state: &mut ReaderState, now: u64) -> ProcessResult {
        let shared = &state.shared;
        if state.should_pause(now) {
            shared.auto_paused.store(true, Ordering::SeqCst);
            // A paint may have landed between the check and the flag
            if state.should_pause(now) || !shared.auto_paused.swap(false, Ordering::SeqCst) {
                return ProcessResult::Paused;
            }
        }

        if shared.ring.is_full() {
            return ProcessResult::Wait;
        }

        match state.decode_next(now) {
            Ok(()) => ProcessResult::CopyFrame,
            Err(err) => {
                log::error!("Reader {} failed: {err:#}", state.id());
                ProcessResult::Error
            }
        }
    }

    /// Worker thread main loop
    pub async fn run(mut self, events: smol::channel::Receiver<ManagerEvent>) {
        log::info!("Clip reader thread {} running", self.shared.index);

        enum Tick {
            Event(Result<ManagerEvent, smol::channel::RecvError>),
            Timer,
        }

        'run: loop {
            let deadline = self.process(clock::now_ms());

            let tick = match deadline {
                Some(at) => {
                    smol::future::or(async { Tick::Event(events.recv().await) }, async {
                        smol::Timer::at(clock::instant_at(at)).await;
                        Tick::Timer
                    })
                    .await
                }
                None => Tick::Event(events.recv().await),
            };

            match tick {
                Tick::Timer => {}
                Tick::Event(Ok(event)) => {
                    if !self.handle_event(event) {
                        break 'run;
                    }
                }
                Tick::Event(Err(_)) => break 'run,
            }

            while let Ok(event) = events.try_recv() {
                if !self.handle_event(event) {
                    break 'run;
                }
            }
        }

        log::info!(
            "Clip reader thread {} shutting down with {} readers",
            self.shared.index,
            self.states.len()
        );
    }
}
