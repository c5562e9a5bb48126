//! PC-speaker event channel.
//!
//! The PIT forwards counter-2 OUT transitions here as timestamped
//! level changes; the mixer thread consumes them at audio cadence and
//! renders the square wave.  The machine side never blocks: if the
//! mixer falls behind, events are dropped.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::trace;

/// One OUT2 level change, stamped with the PIT tick it happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakerEvent {
    pub pit_ticks: u64,
    /// Speaker data enable (port 0x61 bit 1) at event time.
    pub active: bool,
    /// OUT2 level.
    pub level: bool,
}

pub struct PcSpeaker {
    events: Sender<SpeakerEvent>,
}

impl PcSpeaker {
    pub fn new() -> (Self, Receiver<SpeakerEvent>) {
        // ~1s of square wave at audible rates; overflow means the
        // mixer is gone, so dropping is harmless
        let (tx, rx) = bounded(8192);
        (Self { events: tx }, rx)
    }

    pub fn add_event(&self, pit_ticks: u64, active: bool, level: bool) {
        match self.events.try_send(SpeakerEvent {
            pit_ticks,
            active,
            level,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                trace!("speaker event dropped (mixer not draining)");
            }
        }
    }
}
