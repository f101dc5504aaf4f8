//! Consumer side of a clip: the handle the UI thread paints from
use super::frame::{Displayed, FrameInfo, FrameRequest};
use super::manager::ManagerShared;
use super::ring::{FrameRing, RingPhase};
use crate::decoder::ClipMode;

use image::RgbaImage;
use parking_lot::Mutex;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique reader identity, also used as the registry key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReaderId(u64);

impl ReaderId {
    pub(crate) fn next() -> Self {
        Self(NEXT_READER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ClipState {
    Reading = 0,
    /// Decoding failed for good, the last good frame stays available
    Error = 1,
    Stopped = 2,
}

impl ClipState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Reading,
            1 => Self::Error,
            _ => Self::Stopped,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    /// Start animating right after the first frame
    pub autoplay: bool,
    pub mode: ClipMode,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            autoplay: true,
            mode: ClipMode::Gif,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClipEvent {
    /// Dimensions became known or the reader failed: re-query everything
    Reinit,
    /// A new frame was published
    Repaint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClipNotification {
    pub reader: ReaderId,
    pub event: ClipEvent,
}

/// Sends reader events to the consumer thread
#[derive(Clone, Debug)]
pub struct ClipNotifier {
    sender: smol::channel::Sender<ClipNotification>,
}

impl ClipNotifier {
    pub fn send(&self, reader: ReaderId, event: ClipEvent) {
        let result = self.sender.try_send(ClipNotification { reader, event });

        if let Err(err) = result {
            if err.is_closed() {
                log::debug!("Notification receiver for reader {reader} is gone");
            } else {
                log::error!("Failed to send clip notification: {err}");
            }
        }
    }
}

/// Channel carrying notifications of all readers opened with the notifier
pub fn notification_channel() -> (ClipNotifier, smol::channel::Receiver<ClipNotification>) {
    let (sender, receiver) = smol::channel::unbounded();
    (ClipNotifier { sender }, receiver)
}

/// State shared by a reader handle and the worker decoding it
pub(crate) struct ReaderShared {
    pub id: ReaderId,
    pub ring: FrameRing,
    state: AtomicU8,
    /// Native size, `width << 32 | height`, 0 while unknown
    dimensions: AtomicU64,
    /// Size the consumer wants frames at
    pub request: Mutex<Option<FrameRequest>>,
    /// Set by the worker when nobody watches, cleared by the next paint
    pub auto_paused: AtomicBool,
    /// Explicit pause by the consumer
    pub paused: AtomicBool,
    notifier: ClipNotifier,
}

impl ReaderShared {
    pub fn new(id: ReaderId, notifier: ClipNotifier, paused: bool) -> Self {
        Self {
            id,
            ring: FrameRing::new(),
            state: AtomicU8::new(ClipState::Reading as u8),
            dimensions: AtomicU64::new(0),
            request: Mutex::new(None),
            auto_paused: AtomicBool::new(false),
            paused: AtomicBool::new(paused),
            notifier,
        }
    }

    pub fn state(&self) -> ClipState {
        ClipState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Leaves `Reading` for a terminal state, false if already terminal
    pub fn finish(&self, state: ClipState) -> bool {
        self.state
            .compare_exchange(
                ClipState::Reading as u8,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self.dimensions.load(Ordering::Acquire) {
            0 => None,
            packed => Some(((packed >> 32) as u32, packed as u32)),
        }
    }

    pub fn set_dimensions(&self, (width, height): (u32, u32)) {
        let packed = (u64::from(width) << 32) | u64::from(height);
        self.dimensions.store(packed, Ordering::Release);
    }

    pub fn is_suspended(&self) -> bool {
        self.paused.load(Ordering::Acquire) || self.auto_paused.load(Ordering::SeqCst)
    }

    pub fn notify(&self, event: ClipEvent) {
        self.notifier.send(self.id, event);
    }
}

/// Consumer handle of one clip.
///
/// All methods are meant to be called from the thread that paints the clip.
/// Dropping the handle stops the reader.
pub struct ClipReader {
    shared: Arc<ReaderShared>,
    manager: Arc<ManagerShared>,
    last: Mutex<Option<Arc<RgbaImage>>>,
}

impl fmt::Debug for ClipReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipReader")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .field("dimensions", &self.shared.dimensions())
            .finish()
    }
}

impl ClipReader {
    pub(crate) fn new(shared: Arc<ReaderShared>, manager: Arc<ManagerShared>) -> Self {
        Self {
            shared,
            manager,
            last: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ReaderId {
        self.shared.id
    }

    pub fn state(&self) -> ClipState {
        self.shared.state()
    }

    /// Whether the native dimensions are known
    pub fn ready(&self) -> bool {
        self.shared.dimensions().is_some()
    }

    pub fn width(&self) -> u32 {
        self.shared.dimensions().map_or(0, |(width, _)| width)
    }

    pub fn height(&self) -> u32 {
        self.shared.dimensions().map_or(0, |(_, height)| height)
    }

    /// Supplies the size the first frame is rendered at.
    ///
    /// May be called before the dimensions are known, the request then takes
    /// effect once they are. Does nothing after the first frame.
    pub fn start(&self, request: FrameRequest) {
        if self.state() != ClipState::Reading || !request.is_valid() {
            return;
        }

        match self.shared.ring.phase() {
            RingPhase::AwaitingDimensions | RingPhase::AwaitingRequest => {
                *self.shared.request.lock() = Some(request);
                if self.shared.ring.supply_request() {
                    self.manager.wake(self.shared.id);
                }
            }
            RingPhase::AwaitingFirstFrame | RingPhase::Cycling => {}
        }
    }

    /// Frame to paint now.
    ///
    /// A non-zero `now` moves to the next published frame and keeps the clip
    /// animating; `now == 0` repaints the current frame and lets the clip pause.
    /// A request differing from the frame's re-renders it synchronously and is
    /// used for all later frames.
    pub fn current(&self, request: &FrameRequest, now: u64) -> Option<Arc<RgbaImage>> {
        let mut last = self.last.lock();
        if self.state() != ClipState::Reading {
            return last.clone();
        }

        let ring = &self.shared.ring;
        if now > 0 {
            let was_full = ring.is_full();
            if ring.move_to_next_show() && was_full {
                self.manager.wake(self.shared.id);
            }
        }

        let Some(slot) = ring.show_slot() else {
            return last.clone();
        };

        {
            let mut frame = ring.lock(slot);
            if request.is_valid() && frame.request != *request {
                log::debug!(
                    "Reader {} re-rendering at {:?}",
                    self.shared.id,
                    request.frame_size()
                );
                frame.prepare(*request);
                *self.shared.request.lock() = Some(*request);
            }
            if let Some(prepared) = &frame.prepared {
                *last = Some(Arc::clone(prepared));
            }
        }

        if now > 0 {
            ring.mark_displayed(slot, Displayed::Shown);
            if self.shared.auto_paused.swap(false, Ordering::SeqCst) {
                log::debug!("Reader {} resumed by paint", self.shared.id);
                self.manager.wake(self.shared.id);
            }
        } else {
            ring.mark_displayed(slot, Displayed::ShownPause);
        }

        last.clone()
    }

    /// Details of the frame `current` returns, `None` before the first one
    pub fn frame_info(&self) -> Option<FrameInfo> {
        let ring = &self.shared.ring;
        let slot = ring.show_slot()?;
        let info = ring.lock(slot).info();
        Some(info)
    }

    /// Stops decoding and releases the worker's resources. Idempotent.
    pub fn stop(&self) {
        if self.shared.finish(ClipState::Stopped) {
            log::info!("Stopping reader {}", self.shared.id);
            self.manager.remove(self.shared.id);
        }
    }

    /// Moves the reader to the terminal error state.
    ///
    /// Later calls become no-ops, `current` keeps returning the last good frame.
    pub fn error(&self) {
        if self.shared.finish(ClipState::Error) {
            log::info!("Reader {} marked as failed", self.shared.id);
            self.manager.remove(self.shared.id);
        }
    }

    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::AcqRel) {
            self.manager.wake(self.shared.id);
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.swap(false, Ordering::AcqRel) {
            self.manager.wake(self.shared.id);
        }
    }

    /// Whether the consumer paused the clip explicitly
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }
}

impl Drop for ClipReader {
    fn drop(&mut self) {
        self.stop();
    }
}
