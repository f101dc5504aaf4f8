//! Clip readers: background decoding with a lock-free hand-off to the painting thread
mod frame;
mod manager;
mod reader;
mod ring;
mod scheduler;
mod state;

pub use frame::{prepare_frame, round_corners, Displayed, FrameInfo, FrameRequest};
pub use reader::{
    notification_channel, ClipEvent, ClipNotification, ClipNotifier, ClipReader, ClipState,
    ReaderId, ReaderOptions,
};
pub use scheduler::ClipScheduler;
