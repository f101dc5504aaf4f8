//! clipdeck - decodes animated images and clips on background threads
//!
//! Frames are produced by a small pool of worker threads and handed to a
//! single consumer thread through a lock-free three-slot ring per clip.

pub mod clip;
pub mod config;
pub mod decoder;
mod util;

pub use clip::{
    notification_channel, ClipEvent, ClipNotification, ClipNotifier, ClipReader, ClipScheduler,
    ClipState, FrameRequest, ReaderId, ReaderOptions,
};
pub use config::ClipConfig;
pub use util::clock::now_ms;
pub use decoder::{open_backend, BackendFactory, ClipMode, ClipSource, DecodeBackend};
