//! OPL2 (YM3812) register front-end.
//!
//! The synth itself runs on the mixer thread: register writes leave
//! here as timestamped events.  Only the two on-chip timers are
//! emulated in place, because guests poll the status register to
//! detect the chip and to pace music playback.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::trace;

use crate::machine::clock::USEC;

/// One FM register write, stamped with virtual time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FmEvent {
    pub time_ns: u64,
    pub reg: u16,
    pub value: u8,
}

struct OplTimer {
    preset: u8,
    start_ns: u64,
    running: bool,
    masked: bool,
    expired: bool,
    /// Tick length: 80 µs for timer 1, 320 µs for timer 2.
    period_ns: u64,
}

impl OplTimer {
    fn new(period_us: u64) -> Self {
        Self {
            preset: 0,
            start_ns: 0,
            running: false,
            masked: false,
            expired: false,
            period_ns: period_us * USEC,
        }
    }

    fn overflow_period_ns(&self) -> u64 {
        (256 - self.preset as u64) * self.period_ns
    }

    fn update(&mut self, now_ns: u64) {
        if self.running && now_ns >= self.start_ns + self.overflow_period_ns() {
            self.expired = true;
        }
    }
}

pub struct Opl {
    index: u8,
    regs: [u8; 256],
    timer1: OplTimer,
    timer2: OplTimer,
    events: Sender<FmEvent>,
}

impl Opl {
    pub fn new() -> (Self, Receiver<FmEvent>) {
        let (tx, rx) = bounded(4096);
        (
            Self {
                index: 0,
                regs: [0; 256],
                timer1: OplTimer::new(80),
                timer2: OplTimer::new(320),
                events: tx,
            },
            rx,
        )
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.regs = [0; 256];
        self.timer1 = OplTimer::new(80);
        self.timer2 = OplTimer::new(320);
    }

    /// Address (0) / data (1) port pair.
    pub fn write(&mut self, port: u16, value: u8, now_ns: u64) {
        if port & 1 == 0 {
            self.index = value;
            return;
        }
        let reg = self.index as u16;
        self.regs[reg as usize] = value;
        match reg {
            0x02 => self.timer1.preset = value,
            0x03 => self.timer2.preset = value,
            0x04 => {
                if value & 0x80 != 0 {
                    // IRQ-RESET clears both overflow flags; the
                    // counters reload and keep running
                    self.timer1.expired = false;
                    self.timer2.expired = false;
                    self.timer1.start_ns = now_ns;
                    self.timer2.start_ns = now_ns;
                } else {
                    self.timer1.masked = value & 0x40 != 0;
                    self.timer2.masked = value & 0x20 != 0;
                    let t1 = value & 0x01 != 0;
                    if t1 && !self.timer1.running {
                        self.timer1.start_ns = now_ns;
                        self.timer1.expired = false;
                    }
                    self.timer1.running = t1;
                    let t2 = value & 0x02 != 0;
                    if t2 && !self.timer2.running {
                        self.timer2.start_ns = now_ns;
                        self.timer2.expired = false;
                    }
                    self.timer2.running = t2;
                }
            }
            _ => {
                // a voice register: hand it to the synth
                match self.events.try_send(FmEvent {
                    time_ns: now_ns,
                    reg,
                    value,
                }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        trace!("OPL event dropped (mixer not draining)");
                    }
                }
            }
        }
    }

    /// Status register: IRQ plus the two overflow flags.
    pub fn read_status(&mut self, now_ns: u64) -> u8 {
        self.timer1.update(now_ns);
        self.timer2.update(now_ns);
        let t1 = self.timer1.expired && !self.timer1.masked;
        let t2 = self.timer2.expired && !self.timer2.masked;
        let mut status = 0;
        if t1 {
            status |= 0x40;
        }
        if t2 {
            status |= 0x20;
        }
        if t1 || t2 {
            status |= 0x80;
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::clock::MSEC;

    #[test]
    fn timer1_expires_after_preset_ticks() {
        let (mut opl, _rx) = Opl::new();
        // preset 0xC0: (256-192)*80us = 5.12ms
        opl.write(0, 0x02, 0);
        opl.write(1, 0xC0, 0);
        opl.write(0, 0x04, 0);
        opl.write(1, 0x01, 0); // start timer 1
        assert_eq!(opl.read_status(5 * MSEC), 0x00);
        assert_eq!(opl.read_status(6 * MSEC), 0xC0);
        // IRQ-RESET clears the flags
        opl.write(0, 0x04, 6 * MSEC);
        opl.write(1, 0x80, 6 * MSEC);
        assert_eq!(opl.read_status(6 * MSEC) & 0x40, 0);
    }

    #[test]
    fn masked_timer_does_not_raise_status() {
        let (mut opl, _rx) = Opl::new();
        opl.write(0, 0x02, 0);
        opl.write(1, 0xFF, 0);
        opl.write(0, 0x04, 0);
        opl.write(1, 0x41, 0); // start timer1, masked
        assert_eq!(opl.read_status(MSEC), 0x00);
    }

    #[test]
    fn voice_writes_become_events() {
        let (mut opl, rx) = Opl::new();
        opl.write(0, 0xA0, 1000);
        opl.write(1, 0x44, 1000);
        let e = rx.try_recv().unwrap();
        assert_eq!(
            e,
            FmEvent {
                time_ns: 1000,
                reg: 0xA0,
                value: 0x44
            }
        );
    }
}
