//! Three-slot frame hand-off between one decoder and one consumer.
//!
//! Frame `n` of a clip lives in slot `n % 3`. The producer owns the `write`
//! cursor (frames completely written so far), the consumer owns the `show`
//! cursor (frame currently on screen). Both only ever move forward:
//!
//! - the producer may fill frame `write` only while `write - show <= 2`, so
//!   its slot is never the one on screen nor one the consumer can advance to
//!   before it is published;
//! - the consumer advances `show` by one only while `show + 1 < write`, so it
//!   only ever lands on a completely written slot.
//!
//! Cursor stores use release ordering and the loads on the other side use
//! acquire, which makes the slot contents written before a store visible after
//! the matching load. The slot mutexes are therefore never contended.

use super::frame::{Displayed, Frame};

use parking_lot::{Mutex, MutexGuard};

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

pub(crate) const SLOT_COUNT: usize = 3;

/// Bootstrap progress of a ring
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RingPhase {
    /// The decoder has not produced a raw frame yet
    AwaitingDimensions = 0,
    /// Dimensions are known, the consumer has not asked for a size yet
    AwaitingRequest = 1,
    /// A request exists, the first rendered frame is being produced
    AwaitingFirstFrame = 2,
    Cycling = 3,
}

impl RingPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::AwaitingDimensions,
            1 => Self::AwaitingRequest,
            2 => Self::AwaitingFirstFrame,
            _ => Self::Cycling,
        }
    }
}

/// What a slot is currently used for
#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotRole {
    Show,
    /// Published but not on screen yet
    Pending,
    Write,
    Spare,
}

#[derive(Default)]
pub(crate) struct FrameSlot {
    frame: Mutex<Frame>,
    displayed: AtomicU8,
}

pub(crate) struct FrameRing {
    slots: [FrameSlot; SLOT_COUNT],
    phase: AtomicU8,
    show: AtomicU64,
    write: AtomicU64,
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            phase: AtomicU8::new(RingPhase::AwaitingDimensions as u8),
            show: AtomicU64::new(0),
            write: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> RingPhase {
        RingPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn slot_of(sequence: u64) -> usize {
        (sequence % SLOT_COUNT as u64) as usize
    }

    /// Locks a slot. Callers only touch slots the cursors hand them.
    pub fn lock(&self, slot: usize) -> MutexGuard<'_, Frame> {
        self.slots[slot].frame.lock()
    }

    /// Sequentially consistent, pairs with the reader's auto-pause flag
    pub fn displayed(&self, slot: usize) -> Displayed {
        Displayed::from_u8(self.slots[slot].displayed.load(Ordering::SeqCst))
    }

    /// Frames written so far
    #[cfg(test)]
    pub fn written(&self) -> u64 {
        self.write.load(Ordering::Acquire)
    }

    /// Sequence number of the frame on screen
    pub fn shown(&self) -> u64 {
        self.show.load(Ordering::Acquire)
    }

    /// Role of every slot, as seen at one instant
    #[cfg(test)]
    pub fn roles(&self) -> [SlotRole; SLOT_COUNT] {
        let mut roles = [SlotRole::Spare; SLOT_COUNT];
        if self.phase() != RingPhase::Cycling {
            if self.phase() == RingPhase::AwaitingFirstFrame {
                roles[0] = SlotRole::Write;
            }
            return roles;
        }

        let write = self.written();
        let show = self.shown();
        for sequence in show + 1..write {
            roles[Self::slot_of(sequence)] = SlotRole::Pending;
        }
        if write - show <= 2 {
            roles[Self::slot_of(write)] = SlotRole::Write;
        }
        roles[Self::slot_of(show)] = SlotRole::Show;
        roles
    }

    // Producer side

    /// First raw frame decoded: start waiting for a render request
    pub fn finish_dimensions(&self) {
        let _ = self.phase.compare_exchange(
            RingPhase::AwaitingDimensions as u8,
            RingPhase::AwaitingRequest as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Slot the producer may fill next, `None` if the consumer is behind
    pub fn write_slot(&self) -> Option<usize> {
        match self.phase() {
            RingPhase::AwaitingFirstFrame => Some(0),
            RingPhase::Cycling => {
                let write = self.write.load(Ordering::Relaxed);
                let show = self.show.load(Ordering::Acquire);
                (write - show <= 2).then(|| Self::slot_of(write))
            }
            _ => None,
        }
    }

    /// Sequence number the next written frame gets
    pub fn next_sequence(&self) -> u64 {
        match self.phase() {
            RingPhase::Cycling => self.write.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    /// Whether the consumer has to advance before anything else can be written
    pub fn is_full(&self) -> bool {
        self.phase() == RingPhase::Cycling && self.write_slot().is_none()
    }

    /// Slot of the most recently published frame
    pub fn latest_slot(&self) -> Option<usize> {
        match self.phase() {
            RingPhase::Cycling => Some(Self::slot_of(self.write.load(Ordering::Acquire) - 1)),
            _ => None,
        }
    }

    /// Publishes the slot returned by `write_slot`
    pub fn finish_write(&self, slot: usize) {
        self.slots[slot]
            .displayed
            .store(Displayed::NotShown as u8, Ordering::SeqCst);

        match self.phase() {
            RingPhase::AwaitingFirstFrame => {
                self.write.store(1, Ordering::Release);
                self.phase.store(RingPhase::Cycling as u8, Ordering::Release);
            }
            RingPhase::Cycling => {
                let write = self.write.load(Ordering::Relaxed);
                self.write.store(write + 1, Ordering::Release);
            }
            phase => log::error!("Frame published while ring is in {:?}", phase),
        }
    }

    // Either side

    /// Dimensions known and a request supplied: start producing frames.
    ///
    /// Returns false if the ring was not waiting for a request.
    pub fn supply_request(&self) -> bool {
        self.phase
            .compare_exchange(
                RingPhase::AwaitingRequest as u8,
                RingPhase::AwaitingFirstFrame as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // Consumer side

    /// Slot on screen, `None` before the first frame is published
    pub fn show_slot(&self) -> Option<usize> {
        match self.phase() {
            RingPhase::Cycling => Some(Self::slot_of(self.show.load(Ordering::Relaxed))),
            _ => None,
        }
    }

    /// Moves to the next published frame, if there is one
    pub fn move_to_next_show(&self) -> bool {
        if self.phase() != RingPhase::Cycling {
            return false;
        }

        let show = self.show.load(Ordering::Relaxed);
        let write = self.write.load(Ordering::Acquire);
        if show + 1 < write {
            self.show.store(show + 1, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn mark_displayed(&self, slot: usize, displayed: Displayed) {
        self.slots[slot]
            .displayed
            .store(displayed as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    fn cycling_ring() -> FrameRing {
        let ring = FrameRing::new();
        ring.finish_dimensions();
        assert!(ring.supply_request());
        let slot = ring.write_slot().unwrap();
        ring.finish_write(slot);
        ring
    }

    #[test]
    fn bootstrap_phases_in_order() {
        let ring = FrameRing::new();
        assert_eq!(ring.phase(), RingPhase::AwaitingDimensions);
        assert!(!ring.supply_request());
        assert_eq!(ring.write_slot(), None);
        assert_eq!(ring.show_slot(), None);

        ring.finish_dimensions();
        assert_eq!(ring.phase(), RingPhase::AwaitingRequest);
        assert_eq!(ring.write_slot(), None);

        assert!(ring.supply_request());
        assert!(!ring.supply_request());
        assert_eq!(ring.write_slot(), Some(0));
        assert_eq!(ring.roles()[0], SlotRole::Write);

        ring.finish_write(0);
        assert_eq!(ring.phase(), RingPhase::Cycling);
        assert_eq!(ring.show_slot(), Some(0));
        assert_eq!(ring.write_slot(), Some(1));
    }

    #[test]
    fn producer_stops_two_frames_ahead() {
        let ring = cycling_ring();
        ring.finish_write(ring.write_slot().unwrap());
        ring.finish_write(ring.write_slot().unwrap());
        assert!(ring.is_full());
        assert_eq!(
            ring.roles(),
            [SlotRole::Show, SlotRole::Pending, SlotRole::Pending]
        );

        assert!(ring.move_to_next_show());
        assert_eq!(ring.show_slot(), Some(1));
        assert_eq!(ring.write_slot(), Some(0));
        assert_eq!(
            ring.roles(),
            [SlotRole::Write, SlotRole::Show, SlotRole::Pending]
        );
    }

    #[test]
    fn consumer_never_passes_the_producer() {
        let ring = cycling_ring();
        assert!(!ring.move_to_next_show());
        assert_eq!(ring.show_slot(), Some(0));

        ring.finish_write(ring.write_slot().unwrap());
        assert!(ring.move_to_next_show());
        assert!(!ring.move_to_next_show());
        assert_eq!(ring.shown(), 1);
    }

    #[test]
    fn published_frames_start_undisplayed() {
        let ring = cycling_ring();
        ring.mark_displayed(0, Displayed::Shown);
        let slot = ring.write_slot().unwrap();
        ring.mark_displayed(slot, Displayed::Shown);
        ring.finish_write(slot);
        assert_eq!(ring.displayed(0), Displayed::Shown);
        assert_eq!(ring.displayed(slot), Displayed::NotShown);
        assert_eq!(ring.latest_slot(), Some(slot));
    }

    #[test]
    fn interleavings_keep_slots_exclusive() {
        // Deterministic pseudo-random schedule over both sides
        let ring = cycling_ring();
        let mut seed = 0x2545_f491_u32;
        for _ in 0..10_000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 2 == 0 {
                if let Some(slot) = ring.write_slot() {
                    assert_ne!(Some(slot), ring.show_slot());
                    ring.finish_write(slot);
                }
            } else {
                let before = ring.shown();
                ring.move_to_next_show();
                assert!(ring.shown() < ring.written());
                assert!(ring.shown() - before <= 1);
            }
            let roles = ring.roles();
            assert_eq!(roles.iter().filter(|r| **r == SlotRole::Show).count(), 1);
            assert!(roles.iter().filter(|r| **r == SlotRole::Write).count() <= 1);
        }
    }

    #[test]
    fn concurrent_hand_off_delivers_frames_in_order() {
        let ring = Arc::new(cycling_ring());
        ring.lock(0).sequence = 0;
        const FRAMES: u64 = 5_000;

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut next = 1;
                while next < FRAMES {
                    match ring.write_slot() {
                        Some(slot) => {
                            {
                                let mut frame = ring.lock(slot);
                                frame.sequence = next;
                            }
                            ring.finish_write(slot);
                            next += 1;
                        }
                        None => std::thread::yield_now(),
                    }
                }
            })
        };

        let mut last = 0;
        while last + 1 < FRAMES {
            if ring.move_to_next_show() {
                let slot = ring.show_slot().unwrap();
                let sequence = ring.lock(slot).sequence;
                assert_eq!(sequence, last + 1);
                last = sequence;
            } else {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
    }
}
