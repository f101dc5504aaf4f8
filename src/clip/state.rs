//! Worker side of a clip: owns the backend and the decode timeline
use super::frame::{Displayed, FrameRequest};
use super::reader::{ReaderId, ReaderShared};
use super::ring::RingPhase;
use crate::config::ClipConfig;
use crate::decoder::{BackendFactory, ClipMode, ClipSource, DecodeBackend};

use anyhow::{bail, Context, Result};
use image::RgbaImage;

use std::sync::Arc;

/// Outcome of one processing step, interpreted by the read manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProcessResult {
    /// Nothing to do until the next wake
    Wait,
    /// First frame decoded, dimensions known
    Started,
    /// Nobody is watching, stop decoding until the next paint
    Paused,
    /// The next frame is due
    Repaint,
    /// A rendered frame is ready to be published
    CopyFrame,
    Error,
}

pub(crate) struct ReaderState {
    pub shared: Arc<ReaderShared>,
    source: Option<ClipSource>,
    mode: ClipMode,
    factory: BackendFactory,
    config: ClipConfig,
    backend: Option<Box<dyn DecodeBackend>>,
    /// Current frame rendered at the request size, swapped into the ring
    rendered: RgbaImage,
    has_alpha: bool,
    /// When the decoded frame is meant to appear
    frame_when: u64,
    /// When the frame after it is due
    next_due: u64,
    last_published: u64,
    /// Not decoding because of a pause
    suspended: bool,
    /// Load this reader is charged on its manager
    pub load: u64,
}

impl ReaderState {
    pub fn new(
        shared: Arc<ReaderShared>,
        source: ClipSource,
        mode: ClipMode,
        factory: BackendFactory,
        config: ClipConfig,
    ) -> Self {
        let load = config.placeholder_cost;
        Self {
            shared,
            source: Some(source),
            mode,
            factory,
            config,
            backend: None,
            rendered: RgbaImage::new(0, 0),
            has_alpha: false,
            frame_when: 0,
            next_due: 0,
            last_published: 0,
            suspended: false,
            load,
        }
    }

    pub fn id(&self) -> ReaderId {
        self.shared.id
    }

    pub fn process(&mut self, now: u64) -> ProcessResult {
        if self.backend.is_none() {
            return match self.start() {
                Ok(()) => ProcessResult::Started,
                Err(err) => {
                    log::error!("Could not start reader {}: {err:#}", self.shared.id);
                    ProcessResult::Error
                }
            };
        }

        match self.shared.ring.phase() {
            RingPhase::AwaitingDimensions | RingPhase::AwaitingRequest => ProcessResult::Wait,
            RingPhase::AwaitingFirstFrame => ProcessResult::CopyFrame,
            RingPhase::Cycling => {
                if self.shared.is_suspended() {
                    if !self.suspended {
                        log::debug!("Reader {} suspended", self.shared.id);
                        self.suspended = true;
                    }
                    return ProcessResult::Wait;
                }

                if self.suspended {
                    log::debug!("Reader {} resumed", self.shared.id);
                    self.suspended = false;
                    self.next_due = now;
                    // Frames still pending from before the pause get a fresh grace period
                    self.last_published = now;
                }

                if now >= self.next_due {
                    ProcessResult::Repaint
                } else {
                    ProcessResult::Wait
                }
            }
        }
    }

    /// Creates and opens the backend and decodes the first frame
    fn start(&mut self) -> Result<()> {
        let source = self.source.take().context("Reader source already consumed")?;
        let mut backend = (self.factory)(source, self.mode, &self.config)?;
        backend.open()?;
        backend.read_next_frame().context("Could not decode the first frame")?;

        let size = backend.frame_size();
        if size.0 == 0 || size.1 == 0 {
            bail!("First frame has no size");
        }
        self.has_alpha = backend.render_frame(&mut self.rendered, size)?;

        log::info!(
            "Reader {} started with {} backend at {}x{}",
            self.shared.id,
            backend.name(),
            size.0,
            size.1
        );
        self.backend = Some(backend);
        Ok(())
    }

    /// Native frame size of the opened backend
    pub fn frame_size(&self) -> (u32, u32) {
        self.backend.as_ref().map_or((0, 0), |backend| backend.frame_size())
    }

    /// Whether a due frame should not be decoded because nobody paints
    pub fn should_pause(&self, now: u64) -> bool {
        let ring = &self.shared.ring;
        let Some(latest) = ring.latest_slot() else {
            return false;
        };

        match ring.displayed(latest) {
            Displayed::ShownPause => true,
            Displayed::NotShown => now >= self.last_published + self.config.pause_grace_ms,
            Displayed::Shown => false,
        }
    }

    /// Decodes the next frame, catching up once if the timeline fell behind
    pub fn decode_next(&mut self, now: u64) -> Result<()> {
        let request = self.request();
        let Some(backend) = self.backend.as_mut() else {
            bail!("Reader decoded before starting");
        };

        backend.read_next_frame()?;
        self.frame_when = self.next_due;
        self.next_due = self.frame_when + u64::from(backend.next_frame_delay());

        if self.next_due <= now {
            backend.read_next_frame()?;
            self.frame_when = self.next_due;
            self.next_due = self.frame_when + u64::from(backend.next_frame_delay());

            if self.next_due <= now {
                log::debug!("Reader {} fell behind, re-anchoring at {now}", self.shared.id);
                self.frame_when = now;
                self.next_due = now + u64::from(backend.next_frame_delay());
            }
        }

        let size = render_size(&request, backend.frame_size());
        self.has_alpha = backend.render_frame(&mut self.rendered, size)?;
        Ok(())
    }

    /// Moves the rendered frame into the write slot and publishes it
    pub fn publish(&mut self, now: u64) -> Result<()> {
        let ring = &self.shared.ring;
        let Some(slot) = ring.write_slot() else {
            bail!("No free slot to publish into");
        };
        let first = ring.phase() == RingPhase::AwaitingFirstFrame;
        let request = self.request();

        let Some(backend) = self.backend.as_mut() else {
            bail!("Reader published before starting");
        };
        let size = render_size(&request, backend.frame_size());
        if self.rendered.dimensions() != size {
            self.has_alpha = backend.render_frame(&mut self.rendered, size)?;
        }

        if first {
            self.frame_when = now;
        }

        {
            let mut frame = ring.lock(slot);
            std::mem::swap(&mut frame.original, &mut self.rendered);
            frame.has_alpha = self.has_alpha;
            frame.timestamp = self.frame_when;
            frame.sequence = ring.next_sequence();
            frame.prepare(request);
        }
        ring.finish_write(slot);

        self.last_published = now;
        if first {
            self.next_due = now + u64::from(backend.next_frame_delay());
        }
        Ok(())
    }

    fn request(&self) -> FrameRequest {
        self.shared.request.lock().unwrap_or_default()
    }

    /// When this reader wants to be processed again, `None` if only a wake helps
    pub fn next_wake(&self) -> Option<u64> {
        if self.backend.is_none() {
            return Some(0);
        }

        let ring = &self.shared.ring;
        match ring.phase() {
            RingPhase::AwaitingDimensions | RingPhase::AwaitingRequest => None,
            RingPhase::AwaitingFirstFrame => Some(0),
            RingPhase::Cycling if self.suspended => None,
            RingPhase::Cycling if ring.is_full() => Some(
                self.next_due
                    .max(self.last_published + self.config.pause_grace_ms),
            ),
            RingPhase::Cycling => Some(self.next_due),
        }
    }
}

/// Frame size to render at, native size when no request was made
fn render_size(request: &FrameRequest, native: (u32, u32)) -> (u32, u32) {
    if request.is_valid() {
        request.frame_size()
    } else {
        native
    }
}
