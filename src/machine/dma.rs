//! 8237 DMA controller pair.
//!
//! Master chip: 8-bit channels 0–3.  Slave chip: 16-bit channels 4–7,
//! with channel 4 cascaded to the master.  Devices own a channel via
//! [`DmaDevice`] and assert DRQ; the machine loop services pending
//! requests by bursting bytes between guest memory and the device's
//! DMA callbacks until the count underflows (TC).

use log::{debug, trace, warn};

use crate::devices::DmaDevice;
use crate::machine::bus::{PortRange, PORT_8BIT, PORT_RW};

pub const DMA_PORTS: &[PortRange] = &[
    // master 8237 register file
    PortRange { from: 0x00, to: 0x0F, mask: PORT_8BIT | PORT_RW },
    // page registers
    PortRange { from: 0x81, to: 0x83, mask: PORT_8BIT | PORT_RW },
    PortRange { from: 0x87, to: 0x87, mask: PORT_8BIT | PORT_RW },
    PortRange { from: 0x89, to: 0x8B, mask: PORT_8BIT | PORT_RW },
    // slave 8237 register file
    PortRange { from: 0xC0, to: 0xDE, mask: PORT_8BIT | PORT_RW },
];

// ── Mode register fields ──────────────────────────────────────

pub const DMA_MODE_VERIFY: u8 = 0;
/// Device → memory.
pub const DMA_MODE_WRITE: u8 = 1;
/// Memory → device.
pub const DMA_MODE_READ: u8 = 2;

/// What a device reports back from a DMA burst callback.
#[derive(Debug, Clone, Copy)]
pub struct DmaResult {
    /// Transfer units actually produced/consumed.
    pub len: u16,
    /// Device wants DRQ dropped (sector boundary, TC, error).
    pub clear_drq: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDir {
    Verify,
    /// I/O to memory (the device produces bytes).
    ToMemory,
    /// Memory to I/O (the device consumes bytes).
    FromMemory,
}

#[derive(Debug, Default, Clone, Copy)]
struct Channel {
    // mode register, decoded
    mode_type: u8,    // 0=demand 1=single 2=block 3=cascade
    transfer_type: u8, // verify/write/read
    autoinit: bool,
    decrement: bool,

    base_address: u16,
    base_count: u16,
    current_address: u16,
    current_count: u16,
    page: u8,

    drq: bool,
    request: bool, // software request (0x09)
    mask: bool,
    tc: bool,
}

/// One 8237 chip (4 channels).
#[derive(Debug, Default)]
struct I8237 {
    chan: [Channel; 4],
    flip_flop: bool,
    command: u8,
    disabled: bool,
}

impl I8237 {
    fn reset(&mut self) {
        for c in self.chan.iter_mut() {
            *c = Channel {
                mask: true,
                ..Channel::default()
            };
        }
        self.flip_flop = false;
        self.command = 0;
        self.disabled = false;
    }

    /// Address/count register access uses a shared byte flip-flop.
    fn write_reg16(reg: &mut u16, flip_flop: &mut bool, value: u8) {
        if *flip_flop {
            *reg = (*reg & 0x00FF) | ((value as u16) << 8);
        } else {
            *reg = (*reg & 0xFF00) | value as u16;
        }
        *flip_flop = !*flip_flop;
    }

    fn read_reg16(reg: u16, flip_flop: &mut bool) -> u8 {
        let v = if *flip_flop {
            (reg >> 8) as u8
        } else {
            reg as u8
        };
        *flip_flop = !*flip_flop;
        v
    }

    fn status(&mut self) -> u8 {
        let mut v = 0u8;
        for (i, c) in self.chan.iter_mut().enumerate() {
            if c.tc {
                v |= 1 << i;
                c.tc = false; // TC bits clear on status read
            }
            if c.drq {
                v |= 0x10 << i;
            }
        }
        v
    }
}

// ── Controller pair ───────────────────────────────────────────

pub struct Dma {
    master: I8237,
    slave: I8237,
    owner: [DmaDevice; 8],
    /// TC line as seen by the device currently being serviced.
    tc_line: bool,
    hlda: bool,
}

impl Default for Dma {
    fn default() -> Self {
        Self::new()
    }
}

impl Dma {
    pub fn new() -> Self {
        let mut dma = Self {
            master: I8237::default(),
            slave: I8237::default(),
            owner: [DmaDevice::None; 8],
            tc_line: false,
            hlda: false,
        };
        dma.reset();
        dma
    }

    pub fn reset(&mut self) {
        self.master.reset();
        self.slave.reset();
        self.tc_line = false;
        self.hlda = false;
    }

    // ── Device-facing API ─────────────────────────────────────

    pub fn register_8bit_channel(&mut self, chan: usize, device: DmaDevice) {
        assert!(chan < 4);
        if self.owner[chan] != DmaDevice::None {
            warn!("DMA channel {} already owned by {:?}", chan, self.owner[chan]);
        }
        self.owner[chan] = device;
    }

    pub fn register_16bit_channel(&mut self, chan: usize, device: DmaDevice) {
        assert!((5..8).contains(&chan));
        self.owner[chan] = device;
    }

    pub fn unregister_channel(&mut self, chan: usize) {
        self.owner[chan] = DmaDevice::None;
        self.set_drq(chan, false);
    }

    pub fn set_drq(&mut self, chan: usize, level: bool) {
        let (chip, ch) = self.split(chan);
        chip.chan[ch].drq = level;
    }

    pub fn get_drq(&self, chan: usize) -> bool {
        let (chip, ch) = self.split_ref(chan);
        chip.chan[ch].drq
    }

    /// TC line state, valid while a device DMA callback runs.
    pub fn get_tc(&self) -> bool {
        self.tc_line
    }

    pub fn owner(&self, chan: usize) -> DmaDevice {
        self.owner[chan]
    }

    // ── CPU hold handshake ────────────────────────────────────

    /// HRQ: some unmasked channel wants the bus.
    pub fn hrq(&self) -> bool {
        self.pending_channel().is_some()
    }

    pub fn set_hlda(&mut self, level: bool) {
        self.hlda = level;
    }

    /// Highest-priority unmasked channel with DRQ (or software request).
    /// Fixed priority: 0..3, then 5..7 through the cascade.
    pub fn pending_channel(&self) -> Option<usize> {
        if self.master.disabled {
            return None;
        }
        for ch in 0..4 {
            let c = &self.master.chan[ch];
            if (c.drq || c.request) && !c.mask && c.mode_type != 3 {
                return Some(ch);
            }
        }
        if self.slave.disabled {
            return None;
        }
        for ch in 1..4 {
            let c = &self.slave.chan[ch];
            if (c.drq || c.request) && !c.mask && c.mode_type != 3 {
                return Some(4 + ch);
            }
        }
        None
    }

    // ── Transfer bookkeeping (driven by the machine loop) ─────

    /// Describe the next burst on `chan`: physical start address, the
    /// transfer unit count until terminal count, and direction.
    pub fn burst_window(&mut self, chan: usize) -> (u32, usize, XferDir) {
        let wide = chan >= 4;
        let (chip, ch) = self.split(chan);
        let c = &chip.chan[ch];
        let units = c.current_count as usize + 1;
        let addr = if wide {
            // 16-bit channels shift the address left; page bit 0 ignored
            ((c.page as u32 & 0xFE) << 16) | ((c.current_address as u32) << 1)
        } else {
            ((c.page as u32) << 16) | c.current_address as u32
        };
        let dir = match c.transfer_type {
            DMA_MODE_WRITE => XferDir::ToMemory,
            DMA_MODE_READ => XferDir::FromMemory,
            _ => XferDir::Verify,
        };
        (addr, units, dir)
    }

    /// Set the TC line for the device callback about to run.
    pub fn begin_burst(&mut self, chan: usize, units: usize) {
        let (chip, ch) = self.split(chan);
        self.tc_line = units >= chip.chan[ch].current_count as usize + 1;
    }

    /// Account `units` transfers on `chan`.  Returns `true` on terminal
    /// count; autoinit reloads, otherwise the channel masks itself.
    pub fn advance(&mut self, chan: usize, units: usize) -> bool {
        self.tc_line = false;
        if units == 0 {
            return false;
        }
        let (chip, ch) = self.split(chan);
        let c = &mut chip.chan[ch];
        let u = units as u16;
        if c.decrement {
            c.current_address = c.current_address.wrapping_sub(u);
        } else {
            c.current_address = c.current_address.wrapping_add(u);
        }
        let remaining = c.current_count as usize + 1;
        if units >= remaining {
            c.tc = true;
            if c.autoinit {
                c.current_address = c.base_address;
                c.current_count = c.base_count;
                trace!("DMA ch{} TC, autoinit reload", chan);
            } else {
                c.current_count = 0xFFFF;
                c.mask = true;
                debug!("DMA ch{} TC, channel masked", chan);
            }
            true
        } else {
            c.current_count -= u;
            false
        }
    }

    // ── Register file ─────────────────────────────────────────

    pub fn read(&mut self, port: u16) -> u8 {
        match port {
            0x00..=0x07 => {
                let ch = (port >> 1) as usize;
                let ff = &mut self.master.flip_flop;
                if port & 1 == 0 {
                    I8237::read_reg16(self.master.chan[ch].current_address, ff)
                } else {
                    I8237::read_reg16(self.master.chan[ch].current_count, ff)
                }
            }
            0x08 => self.master.status(),
            0x0D => 0, // temp register, not modeled
            0x0F => {
                let mut v = 0xF0;
                for (i, c) in self.master.chan.iter().enumerate() {
                    if c.mask {
                        v |= 1 << i;
                    }
                }
                v
            }
            0x81 => self.master.chan[2].page,
            0x82 => self.master.chan[3].page,
            0x83 => self.master.chan[1].page,
            0x87 => self.master.chan[0].page,
            0x89 => self.slave.chan[2].page,
            0x8A => self.slave.chan[3].page,
            0x8B => self.slave.chan[1].page,
            0xC0..=0xDE if port & 1 == 0 => {
                let ix = ((port - 0xC0) >> 2) as usize;
                let ff = &mut self.slave.flip_flop;
                if port & 2 == 0 {
                    I8237::read_reg16(self.slave.chan[ix].current_address, ff)
                } else {
                    I8237::read_reg16(self.slave.chan[ix].current_count, ff)
                }
            }
            0xD0 => self.slave.status(),
            _ => {
                warn!("DMA: read from unhandled port 0x{:02X}", port);
                0xFF
            }
        }
    }

    pub fn write(&mut self, port: u16, value: u8) {
        match port {
            0x00..=0x07 => {
                let ch = (port >> 1) as usize;
                let ff = &mut self.master.flip_flop;
                if port & 1 == 0 {
                    I8237::write_reg16(&mut self.master.chan[ch].current_address, ff, value);
                    self.master.chan[ch].base_address = self.master.chan[ch].current_address;
                } else {
                    I8237::write_reg16(&mut self.master.chan[ch].current_count, ff, value);
                    self.master.chan[ch].base_count = self.master.chan[ch].current_count;
                }
            }
            0x08 => {
                self.master.command = value;
                self.master.disabled = value & 0x04 != 0;
            }
            0x09 => {
                let ch = (value & 3) as usize;
                self.master.chan[ch].request = value & 0x04 != 0;
            }
            0x0A => {
                let ch = (value & 3) as usize;
                self.master.chan[ch].mask = value & 0x04 != 0;
            }
            0x0B => Self::write_mode(&mut self.master, value),
            0x0C => self.master.flip_flop = false,
            0x0D => self.master.reset(),
            0x0E => {
                for c in self.master.chan.iter_mut() {
                    c.mask = false;
                }
            }
            0x0F => {
                for (i, c) in self.master.chan.iter_mut().enumerate() {
                    c.mask = value & (1 << i) != 0;
                }
            }
            0x81 => self.master.chan[2].page = value,
            0x82 => self.master.chan[3].page = value,
            0x83 => self.master.chan[1].page = value,
            0x87 => self.master.chan[0].page = value,
            0x89 => self.slave.chan[2].page = value,
            0x8A => self.slave.chan[3].page = value,
            0x8B => self.slave.chan[1].page = value,
            0xC0..=0xDE if port & 1 == 0 => {
                let ix = ((port - 0xC0) >> 2) as usize;
                let ff = &mut self.slave.flip_flop;
                if port & 2 == 0 {
                    I8237::write_reg16(&mut self.slave.chan[ix].current_address, ff, value);
                    self.slave.chan[ix].base_address = self.slave.chan[ix].current_address;
                } else {
                    I8237::write_reg16(&mut self.slave.chan[ix].current_count, ff, value);
                    self.slave.chan[ix].base_count = self.slave.chan[ix].current_count;
                }
            }
            0xD0 => {
                self.slave.command = value;
                self.slave.disabled = value & 0x04 != 0;
            }
            0xD2 => {
                let ch = (value & 3) as usize;
                self.slave.chan[ch].request = value & 0x04 != 0;
            }
            0xD4 => {
                let ch = (value & 3) as usize;
                self.slave.chan[ch].mask = value & 0x04 != 0;
            }
            0xD6 => Self::write_mode(&mut self.slave, value),
            0xD8 => self.slave.flip_flop = false,
            0xDA => self.slave.reset(),
            0xDC => {
                for c in self.slave.chan.iter_mut() {
                    c.mask = false;
                }
            }
            0xDE => {
                for (i, c) in self.slave.chan.iter_mut().enumerate() {
                    c.mask = value & (1 << i) != 0;
                }
            }
            _ => warn!("DMA: write to unhandled port 0x{:02X}", port),
        }
    }

    fn write_mode(chip: &mut I8237, value: u8) {
        let ch = (value & 3) as usize;
        let c = &mut chip.chan[ch];
        c.transfer_type = (value >> 2) & 3;
        c.autoinit = value & 0x10 != 0;
        c.decrement = value & 0x20 != 0;
        c.mode_type = (value >> 6) & 3;
        debug!(
            "DMA ch{}: mode type={} xfer={} autoinit={} dec={}",
            ch, c.mode_type, c.transfer_type, c.autoinit, c.decrement
        );
    }

    // ── helpers ───────────────────────────────────────────────

    fn split(&mut self, chan: usize) -> (&mut I8237, usize) {
        if chan < 4 {
            (&mut self.master, chan)
        } else {
            (&mut self.slave, chan - 4)
        }
    }

    fn split_ref(&self, chan: usize) -> (&I8237, usize) {
        if chan < 4 {
            (&self.master, chan)
        } else {
            (&self.slave, chan - 4)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program_ch2(dma: &mut Dma, addr: u16, count: u16, mode: u8) {
        dma.write(0x0B, mode);
        dma.write(0x0C, 0); // clear flip-flop
        dma.write(0x04, addr as u8);
        dma.write(0x04, (addr >> 8) as u8);
        dma.write(0x05, count as u8);
        dma.write(0x05, (count >> 8) as u8);
        dma.write(0x81, 0x01); // page
        dma.write(0x0A, 0x02); // unmask ch2
    }

    #[test]
    fn flip_flop_orders_address_bytes() {
        let mut dma = Dma::new();
        program_ch2(&mut dma, 0x3412, 511, 0x46);
        let (addr, units, dir) = dma.burst_window(2);
        assert_eq!(addr, 0x1_3412);
        assert_eq!(units, 512);
        assert_eq!(dir, XferDir::ToMemory);
    }

    #[test]
    fn terminal_count_masks_channel() {
        let mut dma = Dma::new();
        program_ch2(&mut dma, 0, 511, 0x46);
        dma.set_drq(2, true);
        assert_eq!(dma.pending_channel(), Some(2));
        assert!(!dma.advance(2, 256));
        assert!(dma.advance(2, 256));
        // masked after TC without autoinit
        assert_eq!(dma.pending_channel(), None);
        // TC status bit reads back once
        assert_eq!(dma.read(0x08) & 0x04, 0x04);
        assert_eq!(dma.read(0x08) & 0x04, 0x00);
    }

    #[test]
    fn autoinit_reloads_base_registers() {
        let mut dma = Dma::new();
        program_ch2(&mut dma, 0x2000, 3, 0x56); // autoinit, write
        dma.set_drq(2, true);
        assert!(dma.advance(2, 4));
        let (addr, units, _) = dma.burst_window(2);
        assert_eq!(addr, 0x1_2000);
        assert_eq!(units, 4);
        assert_eq!(dma.pending_channel(), Some(2));
    }

    #[test]
    fn wide_channel_addresses_are_word_scaled() {
        let mut dma = Dma::new();
        dma.write(0xD6, 0x45); // ch5: single, write
        dma.write(0xD8, 0);
        dma.write(0xC4, 0x00);
        dma.write(0xC4, 0x10); // word address 0x1000
        dma.write(0xC6, 0xFF);
        dma.write(0xC6, 0x00);
        dma.write(0x8B, 0x03);
        let (addr, ..) = dma.burst_window(5);
        assert_eq!(addr, 0x2_2000);
    }
}

// ── Save state ────────────────────────────────────────────────

use crate::error::SaveStateError;
use crate::savestate::{LumpReader, LumpWriter, StateBuf};

impl Channel {
    fn save(&self, w: &mut LumpWriter) {
        w.put_u8(self.mode_type);
        w.put_u8(self.transfer_type);
        w.put_bool(self.autoinit);
        w.put_bool(self.decrement);
        w.put_u16(self.base_address);
        w.put_u16(self.base_count);
        w.put_u16(self.current_address);
        w.put_u16(self.current_count);
        w.put_u8(self.page);
        w.put_bool(self.drq);
        w.put_bool(self.request);
        w.put_bool(self.mask);
        w.put_bool(self.tc);
    }

    fn restore(&mut self, r: &mut LumpReader) -> Result<(), SaveStateError> {
        self.mode_type = r.get_u8()?;
        self.transfer_type = r.get_u8()?;
        self.autoinit = r.get_bool()?;
        self.decrement = r.get_bool()?;
        self.base_address = r.get_u16()?;
        self.base_count = r.get_u16()?;
        self.current_address = r.get_u16()?;
        self.current_count = r.get_u16()?;
        self.page = r.get_u8()?;
        self.drq = r.get_bool()?;
        self.request = r.get_bool()?;
        self.mask = r.get_bool()?;
        self.tc = r.get_bool()?;
        Ok(())
    }
}

impl Dma {
    pub fn save_state(&self, state: &mut StateBuf) {
        let mut w = LumpWriter::new();
        for chip in [&self.master, &self.slave] {
            for c in &chip.chan {
                c.save(&mut w);
            }
            w.put_bool(chip.flip_flop);
            w.put_u8(chip.command);
            w.put_bool(chip.disabled);
        }
        state.write_lump("dma", w.finish());
    }

    pub fn restore_state(&mut self, state: &mut StateBuf) -> Result<(), SaveStateError> {
        let mut r = state.read_lump("dma")?;
        for chip in [&mut self.master, &mut self.slave] {
            for c in chip.chan.iter_mut() {
                c.restore(&mut r)?;
            }
            chip.flip_flop = r.get_bool()?;
            chip.command = r.get_u8()?;
            chip.disabled = r.get_bool()?;
        }
        self.tc_line = false;
        r.expect_end()
    }
}
