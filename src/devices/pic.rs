//! 8259A programmable interrupt controller pair.
//!
//! Master at 0x20/0x21, slave at 0xA0/0xA1, slave INT cascaded into
//! master IRQ 2.  Only cascaded edge-triggered mode is implemented;
//! single-PIC and level-sensitive requests from the guest are accepted
//! but logged as errors.
//!
//! Device IRQ lines 0–15 enter through [`Pic::raise_irq`] /
//! [`Pic::lower_irq`]; the CPU acknowledges through [`Pic::iac`].

use log::{debug, error, trace};

use crate::machine::bus::{PortRange, PORT_8BIT, PORT_RW};
use crate::machine::IntrLine;

pub const PIC_PORTS: &[PortRange] = &[
    PortRange {
        from: 0x20,
        to: 0x21,
        mask: PORT_8BIT | PORT_RW,
    },
    PortRange {
        from: 0xA0,
        to: 0xA1,
        mask: PORT_8BIT | PORT_RW,
    },
];

// ── Single 8259 chip ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct I8259 {
    is_master: bool,
    single_pic: bool,
    /// Programmable vector offset (ICW2).
    interrupt_offset: u8,
    /// Master: bitmap of lines with a slave attached.  Slave: own id.
    cascade: u8,
    auto_eoi: bool,
    imr: u8,
    isr: u8,
    irr: u8,
    /// 0 = IRR, 1 = ISR (OCW3 read select).
    read_reg_select: u8,
    /// IRQ picked by the last `service` pass.
    irq: u8,
    lowest_priority: u8,
    /// INT output pin.
    int_out: bool,
    /// Raw input pin levels (edge detector state).
    irq_in: u8,
    in_init: bool,
    init_requires_4: bool,
    init_byte_expected: u8,
    special_mask: bool,
    polled: bool,
    rotate_on_autoeoi: bool,
    /// Per-line trigger mode bitmap; stays 0 (edge) on this board.
    edge_level: u8,
}

impl I8259 {
    fn new(is_master: bool) -> Self {
        let mut pic = Self {
            is_master,
            single_pic: false,
            interrupt_offset: 0,
            cascade: 0,
            auto_eoi: false,
            imr: 0,
            isr: 0,
            irr: 0,
            read_reg_select: 0,
            irq: 0,
            lowest_priority: 7,
            int_out: false,
            irq_in: 0,
            in_init: false,
            init_requires_4: false,
            init_byte_expected: 0,
            special_mask: false,
            polled: false,
            rotate_on_autoeoi: false,
            edge_level: 0,
        };
        pic.reset();
        pic
    }

    fn reset(&mut self) {
        self.single_pic = false;
        self.interrupt_offset = if self.is_master { 0x08 } else { 0x70 };
        self.cascade = if self.is_master { 0x04 } else { 0x02 };
        self.auto_eoi = false;
        self.imr = 0xFF;
        self.isr = 0;
        self.irr = 0;
        self.read_reg_select = 0;
        self.irq = 0;
        self.lowest_priority = 7;
        self.int_out = false;
        self.irq_in = 0;
        self.in_init = false;
        self.init_requires_4 = false;
        self.init_byte_expected = 0;
        self.special_mask = false;
        self.polled = false;
        self.rotate_on_autoeoi = false;
        self.edge_level = 0;
    }

    fn name(&self) -> &'static str {
        if self.is_master {
            "master"
        } else {
            "slave"
        }
    }

    /// Clear the in-service bit of highest priority (non-specific EOI).
    fn clear_highest_interrupt(&mut self) {
        let highest = (self.lowest_priority + 1) & 7;
        let mut irq = highest;
        loop {
            if self.isr & (1 << irq) != 0 {
                self.isr &= !(1 << irq);
                break;
            }
            irq = (irq + 1) & 7;
            if irq == highest {
                break;
            }
        }
    }

    /// Priority resolution after any state change.  Returns `true`
    /// when the INT pin transitions low→high (caller must signal the
    /// CPU, or the master's IRQ 2 for the slave chip).
    fn service(&mut self) -> bool {
        let highest_priority = (self.lowest_priority + 1) & 7;

        if self.int_out {
            // last interrupt still not acknowledged
            trace!("{}: INT pending, not re-serviced", self.name());
            return false;
        }

        // Highest-priority in-service bit bounds the scan in normal
        // mode; with the special mask every priority stays open.
        let isr = self.isr;
        let max_irq = if self.special_mask {
            highest_priority
        } else {
            let mut max_irq = highest_priority;
            if isr != 0 {
                while isr & (1 << max_irq) == 0 {
                    max_irq = (max_irq + 1) & 7;
                }
                if max_irq == highest_priority {
                    // highest priority already in service
                    return false;
                }
            }
            max_irq
        };

        let unmasked = self.irr & !self.imr;
        if unmasked == 0 {
            return false;
        }
        let mut irq = highest_priority;
        loop {
            // special mask: skip lines already in service
            if !(self.special_mask && (isr >> irq) & 1 != 0) && unmasked & (1 << irq) != 0 {
                self.irq = irq;
                self.int_out = true;
                return true;
            }
            irq = (irq + 1) & 7;
            if irq == max_irq {
                return false;
            }
        }
    }
}

// ── Cascaded pair ─────────────────────────────────────────────

pub struct Pic {
    master: I8259,
    slave: I8259,
}

impl Default for Pic {
    fn default() -> Self {
        Self::new()
    }
}

impl Pic {
    pub fn new() -> Self {
        Self {
            master: I8259::new(true),
            slave: I8259::new(false),
        }
    }

    pub fn reset(&mut self) {
        self.master.reset();
        self.slave.reset();
    }

    // ── IRQ lines ─────────────────────────────────────────────

    pub fn raise_irq(&mut self, irq_no: usize, intr: &mut IntrLine) {
        let mask = 1u8 << (irq_no & 7);
        if irq_no <= 7 && self.master.irq_in & mask == 0 {
            debug!("IRQ line {} high (mIMR={:02X})", irq_no, self.master.imr);
            self.master.irq_in |= mask;
            self.master.irr |= mask;
            self.service_master(intr);
        } else if (8..=15).contains(&irq_no) && self.slave.irq_in & mask == 0 {
            debug!("IRQ line {} high (sIMR={:02X})", irq_no, self.slave.imr);
            self.slave.irq_in |= mask;
            self.slave.irr |= mask;
            self.service_slave(intr);
        }
    }

    pub fn lower_irq(&mut self, irq_no: usize) {
        let mask = 1u8 << (irq_no & 7);
        if irq_no <= 7 && self.master.irq_in & mask != 0 {
            trace!("IRQ line {} low", irq_no);
            self.master.irq_in &= !mask;
            self.master.irr &= !mask;
        } else if (8..=15).contains(&irq_no) && self.slave.irq_in & mask != 0 {
            trace!("IRQ line {} low", irq_no);
            self.slave.irq_in &= !mask;
            self.slave.irr &= !mask;
        }
    }

    fn service_master(&mut self, intr: &mut IntrLine) {
        if self.master.service() {
            trace!("master: signalling IRQ {}", self.master.irq);
            intr.raise();
        }
    }

    fn service_slave(&mut self, intr: &mut IntrLine) {
        if self.slave.service() {
            // a slave request presents on the master as IRQ 2
            let mask = 1u8 << 2;
            if self.master.irq_in & mask == 0 {
                self.master.irq_in |= mask;
                self.master.irr |= mask;
                self.service_master(intr);
            }
        }
    }

    // ── Port file ─────────────────────────────────────────────

    pub fn read(&mut self, port: u16, io_len: u8, intr: &mut IntrLine) -> u16 {
        let value = match port {
            0x20 | 0x21 => self.read_chip(true, port - 0x20, io_len, intr),
            0xA0 | 0xA1 => self.read_chip(false, port - 0xA0, io_len, intr),
            _ => {
                error!("PIC: io read from address 0x{:04X}", port);
                0
            }
        };
        trace!("PIC: read  0x{:x} -> 0x{:x}", port, value);
        value
    }

    fn read_chip(&mut self, master: bool, address: u16, io_len: u8, intr: &mut IntrLine) -> u16 {
        let polled = if master {
            self.master.polled
        } else {
            self.slave.polled
        };
        if polled {
            // poll command: the read acknowledges the current interrupt
            if master {
                self.master.clear_highest_interrupt();
                self.master.polled = false;
                self.service_master(intr);
            } else {
                self.slave.clear_highest_interrupt();
                self.slave.polled = false;
                self.service_slave(intr);
            }
            let irq = if master {
                self.master.irq
            } else {
                self.slave.irq
            } as u16;
            return if io_len > 1 { irq << 8 | irq } else { irq };
        }
        let chip = if master {
            &mut self.master
        } else {
            &mut self.slave
        };
        match address {
            0 => {
                if chip.read_reg_select != 0 {
                    chip.isr as u16
                } else {
                    chip.irr as u16
                }
            }
            1 => chip.imr as u16,
            _ => 0,
        }
    }

    pub fn write(&mut self, port: u16, value: u8, intr: &mut IntrLine) {
        trace!("PIC: write 0x{:x} <- 0x{:02x}", port, value);
        match port {
            0x20 | 0x21 => self.write_chip(true, port - 0x20, value, intr),
            0xA0 | 0xA1 => self.write_chip(false, port - 0xA0, value, intr),
            _ => {}
        }
    }

    fn write_chip(&mut self, master: bool, address: u16, value: u8, intr: &mut IntrLine) {
        macro_rules! chip {
            () => {
                if master {
                    &mut self.master
                } else {
                    &mut self.slave
                }
            };
        }
        match address {
            0 => {
                // ICW1
                if value & 0x10 != 0 {
                    let pic = chip!();
                    pic.single_pic = value & 0x02 != 0;
                    pic.in_init = true;
                    pic.init_requires_4 = value & 0x01 != 0;
                    pic.init_byte_expected = 2;
                    pic.imr = 0;
                    pic.isr = 0;
                    pic.irr = 0;
                    pic.lowest_priority = 7;
                    pic.int_out = false; // reprogramming drops a pending INTR
                    pic.auto_eoi = false;
                    pic.rotate_on_autoeoi = false;
                    debug!(
                        "{}: ICW1: {}, {}, {}",
                        pic.name(),
                        if pic.init_requires_4 { "w/ ICW4" } else { "w/o ICW4" },
                        if pic.single_pic { "single" } else { "cascade" },
                        if value & 0x08 != 0 { "level" } else { "edge" },
                    );
                    if pic.single_pic {
                        error!("{}: ICW1: single mode not supported", pic.name());
                    }
                    if value & 0x08 != 0 {
                        error!("{}: ICW1: level sensitive mode not supported", pic.name());
                    }
                    if master {
                        intr.clear();
                    } else {
                        let cascade_mask = self.master.cascade;
                        self.master.irq_in &= !cascade_mask;
                    }
                    return;
                }

                // OCW3
                if value & 0x18 == 0x08 {
                    let pic = chip!();
                    let special_mask = (value & 0x60) >> 5;
                    if value & 0x04 != 0 {
                        // polling overrides the read register select
                        pic.polled = true;
                        return;
                    }
                    match value & 0x03 {
                        0x02 => pic.read_reg_select = 0,
                        0x03 => pic.read_reg_select = 1,
                        _ => {}
                    }
                    if special_mask == 0x02 {
                        pic.special_mask = false;
                    } else if special_mask == 0x03 {
                        pic.special_mask = true;
                        if master {
                            self.service_master(intr);
                        } else {
                            self.service_slave(intr);
                        }
                    }
                    return;
                }

                // OCW2
                match value {
                    0x00 | 0x80 => {
                        chip!().rotate_on_autoeoi = value != 0;
                    }
                    0x20 | 0xA0 => {
                        // non-specific EOI (0xA0: with priority rotation)
                        let pic = chip!();
                        pic.clear_highest_interrupt();
                        if value == 0xA0 {
                            pic.lowest_priority = (pic.lowest_priority + 1) & 7;
                        }
                        if master {
                            self.service_master(intr);
                        } else {
                            self.service_slave(intr);
                        }
                    }
                    0x40 => { /* reserved no-op */ }
                    0x60..=0x67 => {
                        chip!().isr &= !(1 << (value - 0x60));
                        if master {
                            self.service_master(intr);
                        } else {
                            self.service_slave(intr);
                        }
                    }
                    0xC0..=0xC7 => {
                        chip!().lowest_priority = value - 0xC0;
                    }
                    0xE0..=0xE7 => {
                        // specific EOI and rotate
                        let pic = chip!();
                        pic.isr &= !(1 << (value - 0xE0));
                        pic.lowest_priority = value - 0xE0;
                        if master {
                            self.service_master(intr);
                        } else {
                            self.service_slave(intr);
                        }
                    }
                    0x02 => { /* single-mode bit write, ignored (386BSD does this) */ }
                    _ => {
                        error!("{}: OCW2: invalid value 0x{:02X}", chip!().name(), value);
                    }
                }
            }
            1 => {
                let pic = chip!();
                if pic.in_init {
                    match pic.init_byte_expected {
                        2 => {
                            pic.interrupt_offset = value & 0xF8;
                            pic.init_byte_expected = 3;
                            debug!("{}: ICW2: offset INT 0x{:02X}", pic.name(), pic.interrupt_offset);
                        }
                        3 => {
                            debug!("{}: ICW3: 0x{:02X}", pic.name(), value);
                            if pic.init_requires_4 {
                                pic.init_byte_expected = 4;
                            } else {
                                pic.in_init = false;
                            }
                        }
                        4 => {
                            pic.auto_eoi = value & 0x02 != 0;
                            debug!(
                                "{}: ICW4: {}",
                                pic.name(),
                                if pic.auto_eoi { "auto EOI" } else { "normal EOI" }
                            );
                            if value & 0x01 == 0 {
                                error!("{}: ICW4: MCS-80/86 mode not supported", pic.name());
                            }
                            pic.in_init = false;
                        }
                        _ => {
                            error!("{}: bad init sequence state", pic.name());
                        }
                    }
                    return;
                }
                // OCW1: interrupt mask
                if master {
                    self.set_master_imr(value, intr);
                } else {
                    self.set_slave_imr(value, intr);
                }
            }
            _ => {}
        }
    }

    /// Masking a line can retract an INTR the CPU has not taken yet
    /// (POST relies on the resulting pulse).
    fn set_master_imr(&mut self, imr: u8, intr: &mut IntrLine) {
        if self.master.imr == imr {
            return;
        }
        if self.master.int_out {
            self.master.int_out = false;
            intr.clear();
        }
        debug!("master: IMR=0x{:02X}", imr);
        self.master.imr = imr;
        self.service_master(intr);
    }

    fn set_slave_imr(&mut self, imr: u8, intr: &mut IntrLine) {
        if self.slave.imr == imr {
            return;
        }
        if self.slave.int_out {
            self.slave.int_out = false;
            if self.master.irq == 2 {
                self.master.int_out = false;
            }
            intr.clear();
        }
        debug!("slave: IMR=0x{:02X}", imr);
        self.slave.imr = imr;
        self.service_slave(intr);
    }

    // ── INTA cycle ────────────────────────────────────────────

    /// CPU interrupt-acknowledge handshake.  Returns the vector.
    pub fn iac(&mut self, intr: &mut IntrLine) -> u8 {
        intr.clear();
        self.master.int_out = false;
        // spurious: request vanished between INTR and INTA
        if self.master.irr == 0 {
            return self.master.interrupt_offset + 7;
        }
        if self.master.edge_level & (1 << self.master.irq) == 0 {
            self.master.irr &= !(1 << self.master.irq);
        }
        if !self.master.auto_eoi {
            self.master.isr |= 1 << self.master.irq;
        } else if self.master.rotate_on_autoeoi {
            self.master.lowest_priority = self.master.irq;
        }

        let vector;
        if self.master.irq != 2 {
            vector = self.master.irq + self.master.interrupt_offset;
        } else {
            // IRQ 2 = cascaded slave, acknowledge it too
            self.slave.int_out = false;
            self.master.irq_in &= !(1 << 2);
            if self.slave.irr == 0 {
                return self.slave.interrupt_offset + 7;
            }
            vector = self.slave.irq + self.slave.interrupt_offset;
            if self.slave.edge_level & (1 << self.slave.irq) == 0 {
                self.slave.irr &= !(1 << self.slave.irq);
            }
            if !self.slave.auto_eoi {
                self.slave.isr |= 1 << self.slave.irq;
            } else if self.slave.rotate_on_autoeoi {
                self.slave.lowest_priority = self.slave.irq;
            }
            self.service_slave(intr);
        }
        self.service_master(intr);
        vector
    }

    // ── Debug accessors (device status display) ───────────────

    pub fn get_irr(&self) -> u16 {
        self.master.irr as u16 | (self.slave.irr as u16) << 8
    }

    pub fn get_imr(&self) -> u16 {
        self.master.imr as u16 | (self.slave.imr as u16) << 8
    }

    pub fn get_isr(&self) -> u16 {
        self.master.isr as u16 | (self.slave.isr as u16) << 8
    }

    pub fn get_irq_lines(&self) -> u16 {
        self.master.irq_in as u16 | (self.slave.irq_in as u16) << 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Standard PC init: vectors 0x08/0x70, cascade on IRQ2, 8086 mode.
    fn init_pair(pic: &mut Pic, intr: &mut IntrLine) {
        pic.write(0x20, 0x11, intr);
        pic.write(0x21, 0x08, intr);
        pic.write(0x21, 0x04, intr);
        pic.write(0x21, 0x01, intr);
        pic.write(0xA0, 0x11, intr);
        pic.write(0xA1, 0x70, intr);
        pic.write(0xA1, 0x02, intr);
        pic.write(0xA1, 0x01, intr);
        pic.write(0x21, 0x00, intr); // unmask all
        pic.write(0xA1, 0x00, intr);
    }

    #[test]
    fn icw_sequence_then_irq3_vectors_to_0x0b() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.raise_irq(3, &mut intr);
        assert!(intr.is_raised());
        assert_eq!(pic.iac(&mut intr), 0x0B);
        assert!(!intr.is_raised());
        assert_eq!(pic.get_isr(), 1 << 3);
    }

    #[test]
    fn lower_priority_waits_for_eoi() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.raise_irq(4, &mut intr);
        assert_eq!(pic.iac(&mut intr), 0x0C);
        // IRQ 6 pends behind the in-service IRQ 4
        pic.raise_irq(6, &mut intr);
        assert!(!intr.is_raised());
        // higher-priority IRQ 1 preempts
        pic.raise_irq(1, &mut intr);
        assert!(intr.is_raised());
        assert_eq!(pic.iac(&mut intr), 0x09);
        pic.write(0x20, 0x20, &mut intr); // EOI (clears IRQ1)
        pic.write(0x20, 0x20, &mut intr); // EOI (clears IRQ4)
        assert!(intr.is_raised());
        assert_eq!(pic.iac(&mut intr), 0x0E);
    }

    #[test]
    fn slave_request_cascades_through_irq2() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.raise_irq(14, &mut intr);
        assert!(intr.is_raised());
        assert_eq!(pic.iac(&mut intr), 0x76);
        assert_eq!(pic.get_isr(), (1 << 2) | (1 << 14));
        // EOI both chips
        pic.write(0xA0, 0x20, &mut intr);
        pic.write(0x20, 0x20, &mut intr);
        assert_eq!(pic.get_isr(), 0);
    }

    #[test]
    fn masked_line_does_not_interrupt() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.write(0x21, 0x08, &mut intr); // mask IRQ3
        pic.raise_irq(3, &mut intr);
        assert!(!intr.is_raised());
        assert_eq!(pic.get_irr() & 0x08, 0x08);
        // unmasking delivers the latched request
        pic.write(0x21, 0x00, &mut intr);
        assert!(intr.is_raised());
        assert_eq!(pic.iac(&mut intr), 0x0B);
    }

    #[test]
    fn spurious_interrupt_returns_vector_7() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.raise_irq(5, &mut intr);
        pic.lower_irq(5);
        // INTR was raised but the request is gone
        assert_eq!(pic.iac(&mut intr), 0x08 + 7);
        assert_eq!(pic.get_isr(), 0);
    }

    #[test]
    fn masking_a_pending_request_retracts_intr() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.raise_irq(3, &mut intr);
        assert!(intr.is_raised());
        pic.write(0x21, 0xFF, &mut intr);
        assert!(!intr.is_raised());
    }

    #[test]
    fn polled_mode_read_acknowledges() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.raise_irq(4, &mut intr);
        assert_eq!(pic.iac(&mut intr), 0x0C);
        pic.write(0x20, 0x0C, &mut intr); // OCW3 poll
        let v = pic.read(0x20, 1, &mut intr);
        assert_eq!(v, 4);
        assert_eq!(pic.get_isr(), 0); // poll read performed the EOI
    }

    #[test]
    fn isr_and_irr_read_select() {
        let mut pic = Pic::new();
        let mut intr = IntrLine::default();
        init_pair(&mut pic, &mut intr);
        pic.raise_irq(0, &mut intr);
        assert_eq!(pic.read(0x20, 1, &mut intr), 0x01); // IRR default
        pic.iac(&mut intr);
        pic.write(0x20, 0x0B, &mut intr); // OCW3: read ISR
        assert_eq!(pic.read(0x20, 1, &mut intr), 0x01);
    }
}

// ── Save state ────────────────────────────────────────────────

use crate::error::SaveStateError;
use crate::savestate::{LumpWriter, StateBuf};

impl I8259 {
    fn save(&self, w: &mut LumpWriter) {
        w.put_bool(self.single_pic);
        w.put_u8(self.interrupt_offset);
        w.put_u8(self.cascade);
        w.put_bool(self.auto_eoi);
        w.put_u8(self.imr);
        w.put_u8(self.isr);
        w.put_u8(self.irr);
        w.put_u8(self.read_reg_select);
        w.put_u8(self.irq);
        w.put_u8(self.lowest_priority);
        w.put_bool(self.int_out);
        w.put_u8(self.irq_in);
        w.put_bool(self.in_init);
        w.put_bool(self.init_requires_4);
        w.put_u8(self.init_byte_expected);
        w.put_bool(self.special_mask);
        w.put_bool(self.polled);
        w.put_bool(self.rotate_on_autoeoi);
        w.put_u8(self.edge_level);
    }

    fn restore(&mut self, r: &mut crate::savestate::LumpReader) -> Result<(), SaveStateError> {
        self.single_pic = r.get_bool()?;
        self.interrupt_offset = r.get_u8()?;
        self.cascade = r.get_u8()?;
        self.auto_eoi = r.get_bool()?;
        self.imr = r.get_u8()?;
        self.isr = r.get_u8()?;
        self.irr = r.get_u8()?;
        self.read_reg_select = r.get_u8()?;
        self.irq = r.get_u8()?;
        self.lowest_priority = r.get_u8()?;
        self.int_out = r.get_bool()?;
        self.irq_in = r.get_u8()?;
        self.in_init = r.get_bool()?;
        self.init_requires_4 = r.get_bool()?;
        self.init_byte_expected = r.get_u8()?;
        self.special_mask = r.get_bool()?;
        self.polled = r.get_bool()?;
        self.rotate_on_autoeoi = r.get_bool()?;
        self.edge_level = r.get_u8()?;
        Ok(())
    }
}

impl Pic {
    pub fn save_state(&self, state: &mut StateBuf) {
        let mut w = LumpWriter::new();
        self.master.save(&mut w);
        self.slave.save(&mut w);
        state.write_lump("pic", w.finish());
    }

    pub fn restore_state(&mut self, state: &mut StateBuf) -> Result<(), SaveStateError> {
        let mut r = state.read_lump("pic")?;
        self.master.restore(&mut r)?;
        self.slave.restore(&mut r)?;
        r.expect_end()
    }
}
