//! ATA/ATAPI storage controller: two channels, two device slots each.
//!
//! Writing the command register latches BSY and schedules the slot's
//! command timer for the mechanically honest execution time; the timer
//! completion clears BSY, raises the channel IRQ and opens the DRQ
//! window.  The ATAPI packet sub-protocol lives in [`atapi`]; the ATA
//! opcode handlers in [`commands`].
//!
//! The PS/1 default wiring is one hard disk at ATA0:0 and a CD-ROM at
//! ATA0:1.

pub mod atapi;
pub mod cdrom;
pub mod commands;
pub mod storage;

use log::{debug, trace, warn};

use crate::machine::bus::{PortRange, PORT_16BIT, PORT_32BIT, PORT_8BIT, PORT_RW};
use crate::machine::clock::USEC;
use crate::machine::timers::{TimerFn, TimerId, TimerWheel};
use crate::machine::DevCtx;

use cdrom::CdRomDrive;
use storage::{HardDisk, SECTOR_SIZE};

pub const ATA_MAX_MULTIPLE_SECTORS: u32 = 16;
pub const ATA_BUFFER_SIZE: usize = ATA_MAX_MULTIPLE_SECTORS as usize * SECTOR_SIZE;

// command execution times, µs
pub const MIN_CMD_US: u32 = 250;
pub const DEFAULT_CMD_US: u32 = 2_200;
pub const SEEK_CMD_US: u32 = 2_940;
pub const CALIB_CMD_US: u32 = 500_000;
pub const CTRL_OVERH_US: u32 = 3_000;

pub const ATA_PORTS: [&[PortRange]; 2] = [
    &[
        PortRange { from: 0x01F0, to: 0x01F0, mask: PORT_16BIT | PORT_32BIT | PORT_RW },
        PortRange { from: 0x01F1, to: 0x01F7, mask: PORT_8BIT | PORT_RW },
        PortRange { from: 0x03F6, to: 0x03F6, mask: PORT_8BIT | PORT_RW },
    ],
    &[
        PortRange { from: 0x0170, to: 0x0170, mask: PORT_16BIT | PORT_32BIT | PORT_RW },
        PortRange { from: 0x0171, to: 0x0177, mask: PORT_8BIT | PORT_RW },
        PortRange { from: 0x0376, to: 0x0376, mask: PORT_8BIT | PORT_RW },
    ],
];

pub const ATA_IRQS: [usize; 2] = [14, 15];

// ── sense keys / ASC (SFF-8020i) ──────────────────────────────

pub const SENSE_NONE: u8 = 0;
pub const SENSE_NOT_READY: u8 = 2;
pub const SENSE_ILLEGAL_REQUEST: u8 = 5;
pub const SENSE_UNIT_ATTENTION: u8 = 6;
pub const SENSE_ABORTED: u8 = 0x0B;

pub const ASC_DRIVE_NOT_READY: u8 = 0x04;
pub const ASC_INVALID_COMMAND_OPCODE: u8 = 0x20;
pub const ASC_LOGICAL_BLOCK_OOR: u8 = 0x21;
pub const ASC_INVALID_FIELD_IN_CMD_PACKET: u8 = 0x24;
pub const ASC_NOT_READY_TO_READY: u8 = 0x28;
pub const ASC_SAVING_PARAMETERS_NOT_SUPPORTED: u8 = 0x39;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
pub const ASC_MEDIA_REMOVAL_PREVENTED: u8 = 0x53;

pub const ATAPI_PACKET_SIZE: usize = 12;

// ── per-slot state ────────────────────────────────────────────

pub enum AtaDevice {
    None,
    Hdd(HardDisk),
    Cdrom(CdRomDrive),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Status {
    pub busy: bool,
    pub drive_ready: bool,
    pub write_fault: bool,
    pub seek_complete: bool,
    pub drq: bool,
    pub corrected_data: bool,
    pub index_pulse: bool,
    pub index_pulse_time: u64,
    pub err: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct InterruptReason {
    /// 1 = command/message, 0 = data.
    pub c_d: bool,
    /// 1 = to host, 0 = to device.
    pub i_o: bool,
    pub rel: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Hob {
    pub nsector: u8,
    pub sector: u8,
    pub lcyl: u8,
    pub hcyl: u8,
    pub feature: u8,
}

pub struct Controller {
    pub status: Status,
    pub error_register: u8,
    pub interrupt_reason: InterruptReason,
    pub head_no: u8,
    pub sector_count: u8,
    pub sector_no: u8,
    /// Aliased as the ATAPI byte count.
    pub cylinder_no: u16,
    pub lba_mode: bool,
    pub lba48: bool,
    pub features: u8,
    pub multiple_sectors: u32,
    pub mdma_mode: u8,
    pub udma_mode: u8,
    pub packet_dma: bool,
    pub buffer: Vec<u8>,
    pub buffer_index: usize,
    pub buffer_size: usize,
    pub drq_index: usize,
    pub byte_count: u32,
    pub num_sectors: u32,
    pub current_command: u8,
    pub hob: Hob,
    pub look_ahead_time_us: u64,
    pub control_reset: bool,
    pub disable_irq: bool,
    pub reset_in_progress: bool,
}

impl Default for Controller {
    fn default() -> Self {
        Self {
            status: Status::default(),
            error_register: 0,
            interrupt_reason: InterruptReason::default(),
            head_no: 0,
            sector_count: 0,
            sector_no: 0,
            cylinder_no: 0,
            lba_mode: false,
            lba48: false,
            features: 0,
            multiple_sectors: 0,
            mdma_mode: 0,
            udma_mode: 0,
            packet_dma: false,
            buffer: vec![0; ATA_BUFFER_SIZE],
            buffer_index: 0,
            buffer_size: 0,
            drq_index: 0,
            byte_count: 0,
            num_sectors: 0,
            current_command: 0,
            hob: Hob::default(),
            look_ahead_time_us: 0,
            control_reset: false,
            disable_irq: false,
            reset_in_progress: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: [u8; 4],
    pub specific_inf: [u8; 4],
    pub fruc: u8,
    pub key_spec: [u8; 3],
}

#[derive(Debug, Clone)]
pub struct AtapiState {
    pub command: u8,
    pub bytes_remaining: i64,
    pub bytes_total: i64,
    pub sectors_remaining: u32,
    pub sectors_total: u32,
    pub sector_size: u32,
    pub drq_sectors: u32,
    pub seek_completion_time_us: u64,
    pub error_recovery: [u8; 8],
}

impl Default for AtapiState {
    fn default() -> Self {
        Self {
            command: 0,
            bytes_remaining: 0,
            bytes_total: 0,
            sectors_remaining: 0,
            sectors_total: 0,
            sector_size: 2048,
            drq_sectors: 0,
            seek_completion_time_us: 0,
            // Error Recovery page: code, length, params, retry count
            error_recovery: [0x01, 0x06, 0x00, 0x03, 0, 0, 0, 0],
        }
    }
}

#[derive(Default)]
pub struct DriveState {
    pub next_lba: i64,
    pub curr_lba: i64,
    pub prev_cyl: i64,
    pub sense: Sense,
    pub atapi: AtapiState,
    pub identify: Option<[u16; 256]>,
}

pub struct DriveSlot {
    pub controller: Controller,
    pub drive: DriveState,
    pub device: AtaDevice,
    pub timer: TimerId,
}

pub struct AtaChannel {
    pub irq: usize,
    pub ioaddr1: u16,
    pub ioaddr2: u16,
    pub drive_select: usize,
    pub slots: [DriveSlot; 2],
}

// ── Controller pair ───────────────────────────────────────────

pub struct StorageCtrlAta {
    pub channels: [AtaChannel; 2],
}

impl StorageCtrlAta {
    pub fn install(timers: &mut TimerWheel, devices: [[AtaDevice; 2]; 2]) -> Self {
        let mut devices = devices.into_iter();
        let mut channel = |ch: usize, ioaddr1: u16, ioaddr2: u16| {
            let mut devs = devices.next().unwrap().into_iter();
            AtaChannel {
                irq: ATA_IRQS[ch],
                ioaddr1,
                ioaddr2,
                drive_select: 0,
                slots: std::array::from_fn(|dev| DriveSlot {
                    controller: Controller::default(),
                    drive: DriveState::default(),
                    device: devs.next().unwrap(),
                    timer: timers.register(&format!("ATA{}-{}", ch, dev), TimerFn::AtaCmd(ch, dev)),
                }),
            }
        };
        let ctrl = Self {
            channels: [channel(0, 0x01F0, 0x03F0), channel(1, 0x0170, 0x0370)],
        };
        debug!("installed ATA storage controller");
        ctrl
    }

    pub fn power_on_reset(&mut self, ctx: &mut DevCtx) {
        let now_us = ctx.now_us();
        for ch in 0..2 {
            ctx.lower_irq(self.channels[ch].irq);
            self.reset_channel(ch, now_us);
            for dev in 0..2 {
                let slot = &mut self.channels[ch].slots[dev];
                if let AtaDevice::Hdd(hdd) = &mut slot.device {
                    hdd.power_on(now_us);
                    let powerup = hdd.power_up_eta_us(now_us);
                    if powerup > 0 {
                        slot.controller.status.busy = true;
                        slot.controller.status.drive_ready = false;
                        ctx.timers.activate(slot.timer, ctx.clock.now_ns(), powerup * USEC);
                    }
                }
            }
        }
    }

    fn reset_channel(&mut self, ch: usize, now_us: u64) {
        self.channels[ch].drive_select = 0;
        for slot in self.channels[ch].slots.iter_mut() {
            slot.drive.next_lba = 0;
            slot.drive.curr_lba = 0;
            slot.drive.prev_cyl = 0;
            slot.drive.sense = Sense::default();
            slot.drive.atapi = AtapiState::default();
            slot.drive.identify = None;

            let c = &mut slot.controller;
            c.status = Status {
                drive_ready: true,
                seek_complete: true,
                ..Status::default()
            };
            c.error_register = 0x01; // diagnostic code: no error
            c.head_no = 0;
            c.sector_count = 1;
            c.sector_no = 1;
            c.cylinder_no = 0;
            c.current_command = 0;
            c.buffer_index = 0;
            c.control_reset = false;
            c.disable_irq = false;
            c.reset_in_progress = false;
            c.multiple_sectors = 0;
            c.lba_mode = false;
            c.features = 0;
            c.mdma_mode = 0;
            c.udma_mode = 0;
            c.look_ahead_time_us = now_us;
        }
    }

    // ── helpers ───────────────────────────────────────────────

    pub fn sel(&mut self, ch: usize) -> &mut DriveSlot {
        let d = self.channels[ch].drive_select;
        &mut self.channels[ch].slots[d]
    }

    pub fn sel_ref(&self, ch: usize) -> &DriveSlot {
        &self.channels[ch].slots[self.channels[ch].drive_select]
    }

    pub fn selected_is_present(&self, ch: usize) -> bool {
        !matches!(self.sel_ref(ch).device, AtaDevice::None)
    }

    pub fn selected_is_hdd(&self, ch: usize) -> bool {
        matches!(self.sel_ref(ch).device, AtaDevice::Hdd(_))
    }

    pub fn selected_is_cd(&self, ch: usize) -> bool {
        matches!(self.sel_ref(ch).device, AtaDevice::Cdrom(_))
    }

    fn any_is_present(&self, ch: usize) -> bool {
        self.channels[ch]
            .slots
            .iter()
            .any(|s| !matches!(s.device, AtaDevice::None))
    }

    pub fn sectors(&self, ch: usize) -> i64 {
        match &self.sel_ref(ch).device {
            AtaDevice::Hdd(h) => h.sectors() as i64,
            AtaDevice::Cdrom(c) => c.sectors(),
            AtaDevice::None => 0,
        }
    }

    fn decode(&self, address: u16) -> Option<(usize, u16)> {
        for ch in 0..2 {
            if address & 0xFFF8 == self.channels[ch].ioaddr1 {
                return Some((ch, address - self.channels[ch].ioaddr1));
            }
            if address & 0xFFF8 == self.channels[ch].ioaddr2 {
                return Some((ch, address - self.channels[ch].ioaddr2 + 0x10));
            }
        }
        None
    }

    // ── interrupts / completion ───────────────────────────────

    pub fn raise_interrupt(&mut self, ch: usize, ctx: &mut DevCtx) {
        if !self.sel_ref(ch).controller.disable_irq {
            trace!("ATA{}: raising interrupt {}", ch, self.channels[ch].irq);
            ctx.raise_irq(self.channels[ch].irq);
        }
    }

    pub fn lower_interrupt(&mut self, ch: usize, ctx: &mut DevCtx) {
        ctx.lower_irq(self.channels[ch].irq);
    }

    pub fn command_successful(&mut self, ch: usize, dev: usize, raise_int: bool, ctx: &mut DevCtx) {
        let c = &mut self.channels[ch].slots[dev].controller;
        c.status.busy = false;
        c.status.err = false;
        c.status.drq = false;
        c.status.drive_ready = true;
        c.status.seek_complete = true;
        c.status.corrected_data = false;
        c.buffer_index = 0;
        c.error_register = 0;
        if raise_int {
            self.raise_interrupt(ch, ctx);
        }
    }

    pub fn command_aborted(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) {
        let c = &mut self.sel(ch).controller;
        debug!("ATA{}: aborting on command 0x{:02X}", ch, cmd);
        c.current_command = 0;
        c.status.busy = false;
        c.status.drive_ready = true;
        c.status.err = true;
        c.error_register = 0x04; // ABRT
        c.status.drq = false;
        c.status.corrected_data = false;
        c.buffer_index = 0;
        self.raise_interrupt(ch, ctx);
    }

    pub fn set_signature(&mut self, ch: usize, dev: usize) {
        let is_hdd = matches!(self.channels[ch].slots[dev].device, AtaDevice::Hdd(_));
        let is_cd = matches!(self.channels[ch].slots[dev].device, AtaDevice::Cdrom(_));
        let c = &mut self.channels[ch].slots[dev].controller;
        c.head_no = 0;
        c.sector_count = 1;
        c.sector_no = 1;
        if is_hdd {
            c.cylinder_no = 0;
            self.channels[ch].drive_select = 0;
        } else if is_cd {
            c.cylinder_no = 0xEB14;
        } else {
            c.cylinder_no = 0xFFFF;
        }
    }

    // ── addressing ────────────────────────────────────────────

    pub fn calculate_logical_address(&mut self, ch: usize) -> i64 {
        let sectors = self.sectors(ch);
        let c = &self.sel_ref(ch).controller;
        let logical_sector = if c.lba_mode {
            if !c.lba48 {
                (c.head_no as i64) << 24 | (c.cylinder_no as i64) << 8 | c.sector_no as i64
            } else {
                (c.hob.hcyl as i64) << 40
                    | (c.hob.lcyl as i64) << 32
                    | (c.hob.sector as i64) << 24
                    | (c.cylinder_no as i64) << 8
                    | c.sector_no as i64
            }
        } else {
            match &self.sel_ref(ch).device {
                AtaDevice::Hdd(h) => {
                    h.chs_to_lba(c.cylinder_no as u32, c.head_no as u32, c.sector_no as u32)
                }
                _ => -1,
            }
        };
        if logical_sector < 0 || logical_sector >= sectors {
            debug!("ATA{}: logical address out of bounds ({}/{})", ch, logical_sector, sectors);
            return -1;
        }
        logical_sector
    }

    /// Advance the task-file registers past `amount` sectors.
    /// Returns the cylinder of the new position.
    pub fn increment_address(&mut self, ch: usize, lba_sect: &mut i64, amount: u8) -> i64 {
        let slot = self.sel(ch);
        let c = &mut slot.controller;
        c.sector_count = c.sector_count.wrapping_sub(amount);
        c.num_sectors -= amount as u32;
        *lba_sect += amount as i64;
        if c.lba_mode {
            if !c.lba48 {
                c.head_no = ((*lba_sect >> 24) & 0xF) as u8;
                c.cylinder_no = (*lba_sect >> 8) as u16;
                c.sector_no = *lba_sect as u8;
                c.cylinder_no as i64
            } else {
                c.hob.hcyl = (*lba_sect >> 40) as u8;
                c.hob.lcyl = (*lba_sect >> 32) as u8;
                c.hob.sector = (*lba_sect >> 24) as u8;
                c.cylinder_no = (*lba_sect >> 8) as u16;
                c.sector_no = *lba_sect as u8;
                c.cylinder_no as i64 | ((*lba_sect >> 16) & 0xFFFF_0000)
            }
        } else {
            let hdd = match &slot.device {
                AtaDevice::Hdd(h) => h,
                _ => return 0,
            };
            if *lba_sect >= hdd.sectors() as i64 {
                c.sector_no = 1;
                c.head_no = 0;
                c.cylinder_no = (hdd.geometry.cylinders - 1) as u16;
            } else {
                let (cyl, h, s) = hdd.lba_to_chs(*lba_sect);
                c.cylinder_no = cyl as u16;
                c.head_no = h as u8;
                c.sector_no = s as u8;
            }
            c.cylinder_no as i64
        }
    }

    pub fn lba48_transform(&mut self, ch: usize, lba48: bool) {
        let c = &mut self.sel(ch).controller;
        c.lba48 = lba48;
        if !lba48 {
            c.num_sectors = if c.sector_count == 0 {
                256
            } else {
                c.sector_count as u32
            };
        } else if c.sector_count == 0 && c.hob.nsector == 0 {
            c.num_sectors = 65536;
        } else {
            c.num_sectors = (c.hob.nsector as u32) << 8 | c.sector_count as u32;
        }
    }

    /// Move sectors between the controller buffer and the disk image.
    /// Fails when the address walks off the medium.
    pub fn ata_tx_sectors(&mut self, ch: usize, write: bool, len: usize) -> Result<(), ()> {
        let mut sector_count = len / SECTOR_SIZE;
        debug_assert!(sector_count > 0);

        let curr_cyl = {
            let slot = self.sel(ch);
            match &slot.device {
                AtaDevice::Hdd(h) => h.lba_to_cylinder(slot.drive.curr_lba),
                _ => return Err(()),
            }
        };
        let mut c1 = curr_cyl;
        let mut c0;
        let mut bufpos = 0;
        while sector_count > 0 {
            let mut logical_sector = self.calculate_logical_address(ch);
            if logical_sector < 0 {
                return Err(());
            }
            {
                let slot = self.sel(ch);
                let hdd = match &mut slot.device {
                    AtaDevice::Hdd(h) => h,
                    _ => return Err(()),
                };
                if write {
                    hdd.write_sector(logical_sector as u64, &slot.controller.buffer[bufpos..]);
                } else {
                    hdd.read_sector(logical_sector as u64, &mut slot.controller.buffer[bufpos..]);
                }
            }
            c0 = c1;
            c1 = self.increment_address(ch, &mut logical_sector, 1);
            sector_count -= 1;
            bufpos += SECTOR_SIZE;
            self.sel(ch).drive.next_lba = logical_sector;
            if sector_count == 0 {
                // the head doesn't move for the final advance
                c1 = c0;
            }
        }
        let slot = self.sel(ch);
        slot.drive.curr_lba = slot.drive.next_lba - 1;
        if curr_cyl != c1 {
            slot.drive.prev_cyl = curr_cyl;
        }
        Ok(())
    }

    // ── seek timing ───────────────────────────────────────────

    pub fn get_seek_time(&mut self, ch: usize, c0: i64, c1: i64, cprev: i64) -> u32 {
        if c0 == c1 {
            return 0;
        }
        let mut exec_time = SEEK_CMD_US;
        let (overhead, move_time) = match &self.sel_ref(ch).device {
            AtaDevice::Hdd(h) => (h.timings.seek_overhead_us, h.seek_move_time_us(c0, c1)),
            AtaDevice::Cdrom(c) => (20_000, c.seek_move_time_us(c0, c1)),
            AtaDevice::None => (0, 0),
        };
        // settling is ~70% of the documented seek overhead
        let ovrh = (overhead as f64 * 0.70) as u32;
        let settling_time = ovrh.saturating_sub(exec_time);
        if c1 == cprev {
            // returning to the previous cylinder is much cheaper for
            // the controller
            exec_time = (exec_time as f64 * 0.4) as u32;
        }
        move_time + settling_time + exec_time
    }

    /// Implied seek for ATA transfers.  Returns the seek time; the
    /// look-ahead window restarts after the arm lands.
    pub fn seek(&mut self, ch: usize, curr_time_us: u64) -> u32 {
        let (curr_cyl, dest_cyl, curr_h, dest_h) = {
            let slot = self.sel_ref(ch);
            match &slot.device {
                AtaDevice::Hdd(h) => (
                    h.lba_to_cylinder(slot.drive.curr_lba),
                    h.lba_to_cylinder(slot.drive.next_lba),
                    h.lba_to_head(slot.drive.curr_lba),
                    h.lba_to_head(slot.drive.next_lba),
                ),
                _ => return 0,
            }
        };
        if curr_cyl == dest_cyl {
            if curr_h != dest_h {
                self.sel(ch).controller.look_ahead_time_us = curr_time_us;
            }
            return 0;
        }
        let prev_cyl = self.sel_ref(ch).drive.prev_cyl;
        let seek_time = self.get_seek_time(ch, curr_cyl, dest_cyl, prev_cyl);
        let slot = self.sel(ch);
        if let AtaDevice::Hdd(h) = &mut slot.device {
            h.seek(curr_cyl, dest_cyl);
        }
        slot.drive.prev_cyl = curr_cyl;
        slot.drive.curr_lba = slot.drive.next_lba;
        slot.controller.look_ahead_time_us = curr_time_us + seek_time as u64;
        seek_time
    }

    pub fn activate_command_timer(&mut self, ch: usize, exec_time_us: u32, ctx: &mut DevCtx) {
        let mut exec = if exec_time_us == 0 { MIN_CMD_US } else { exec_time_us } as u64;
        let now_us = ctx.now_us();
        if let AtaDevice::Hdd(h) = &self.sel_ref(ch).device {
            let power_up = h.power_up_eta_us(now_us);
            if power_up > 0 {
                trace!("ATA{}: drive powering up, command delayed {}us", ch, power_up);
                exec += power_up;
            }
        }
        let timer = self.sel_ref(ch).timer;
        ctx.activate_timer(timer, exec * USEC);
        trace!("ATA{}: command exec time: {}us", ch, exec);
    }

    // ── command timer ─────────────────────────────────────────

    pub fn command_timer(&mut self, ch: usize, dev: usize, ctx: &mut DevCtx) {
        if matches!(self.channels[ch].slots[dev].device, AtaDevice::Hdd(_) | AtaDevice::None) {
            let cmd = self.channels[ch].slots[dev].controller.current_command;
            match cmd {
                0x00 => {
                    // power up finished, no IRQ
                    self.command_successful(ch, dev, false, ctx);
                }
                0x20 | 0x21 | 0x24 | 0x29 | 0xC4 => {
                    self.command_successful(ch, dev, true, ctx);
                    self.channels[ch].slots[dev].controller.status.drq = true;
                }
                0x40 | 0x41 | 0x42 => {
                    self.command_successful(ch, dev, true, ctx);
                    let num = self.channels[ch].slots[dev].controller.num_sectors;
                    let mut next = self.channels[ch].slots[dev].drive.next_lba;
                    let next_cyl = self.increment_address(ch, &mut next, num as u8);
                    let slot = self.sel(ch);
                    if let AtaDevice::Hdd(h) = &slot.device {
                        let curr_cyl = h.lba_to_cylinder(slot.drive.curr_lba);
                        if curr_cyl != next_cyl {
                            slot.drive.prev_cyl = curr_cyl;
                        }
                    }
                    slot.drive.next_lba = next;
                    slot.drive.curr_lba = next;
                }
                0x30 | 0x31 | 0xC5 | 0x34 | 0x39 => {
                    self.command_successful(ch, dev, true, ctx);
                    self.channels[ch].slots[dev].controller.status.drq = true;
                }
                0x90 => {
                    self.command_successful(ch, dev, true, ctx);
                    self.channels[ch].slots[dev].controller.error_register = 0x01;
                }
                _ => {
                    self.command_successful(ch, dev, true, ctx);
                }
            }
        } else {
            let atapi_cmd = self.channels[ch].slots[dev].drive.atapi.command;
            match atapi_cmd {
                0x1E | 0x2B | 0x1B | 0x45 | 0x47 => {
                    // seek/audio: command time is over, head may still
                    // be moving (DSC tracked separately)
                    self.atapi_success(ch, true, ctx);
                }
                0x28 | 0xA8 => {
                    if self.channels[ch].slots[dev].drive.atapi.sectors_total == 0 {
                        self.atapi_success(ch, true, ctx);
                    } else {
                        self.atapi_ready_to_transfer(ch, atapi::INT_DATA, atapi::INT_TO_HOST, true, ctx);
                    }
                }
                0x12 | 0x1A | 0x5A | 0x25 | 0x42 | 0x43 | 0x03 | 0x4A => {
                    self.atapi_ready_to_transfer(ch, atapi::INT_DATA, atapi::INT_TO_HOST, true, ctx);
                }
                0x55 => {
                    self.atapi_ready_to_transfer(ch, atapi::INT_DATA, atapi::INT_TO_DEV, true, ctx);
                }
                cmd => {
                    debug!("ATA{}: ATAPI command 0x{:02x} should not be timed", ch, cmd);
                }
            }
        }
    }

    // ── port file ─────────────────────────────────────────────

    pub fn read(&mut self, address: u16, len: u8, ctx: &mut DevCtx) -> u32 {
        let (ch, port) = match self.decode(address) {
            Some(x) => x,
            None => return !0,
        };
        match port {
            0x00 => self.read_data(ch, len, ctx),
            0x01 => {
                if self.any_is_present(ch) {
                    self.sel_ref(ch).controller.error_register as u32
                } else {
                    0
                }
            }
            0x02 => {
                if self.any_is_present(ch) {
                    self.sel_ref(ch).controller.sector_count as u32
                } else {
                    0
                }
            }
            0x03 => {
                if self.any_is_present(ch) {
                    self.sel_ref(ch).controller.sector_no as u32
                } else {
                    0
                }
            }
            0x04 => {
                if self.any_is_present(ch) {
                    (self.sel_ref(ch).controller.cylinder_no & 0xFF) as u32
                } else {
                    0
                }
            }
            0x05 => {
                if self.any_is_present(ch) {
                    (self.sel_ref(ch).controller.cylinder_no >> 8) as u32
                } else {
                    0
                }
            }
            0x06 => {
                let c = &self.sel_ref(ch).controller;
                (1 << 7
                    | (c.lba_mode as u8) << 6
                    | 1 << 5
                    | (self.channels[ch].drive_select as u8) << 4
                    | c.head_no) as u32
            }
            0x07 | 0x16 => {
                let value = self.read_status(ch, ctx);
                if port == 0x07 {
                    self.lower_interrupt(ch, ctx);
                }
                value as u32
            }
            _ => {
                debug!("ATA{}: invalid read address 0x{:03X}", ch, address);
                !0
            }
        }
    }

    fn read_status(&mut self, ch: usize, ctx: &mut DevCtx) -> u8 {
        if !self.selected_is_present(ch) {
            return 0;
        }
        let now_us = ctx.now_us();
        if self.selected_is_cd(ch) {
            self.atapi_check_seek_completion(ch, now_us);
        }
        let trk_read_us = match &self.sel_ref(ch).device {
            AtaDevice::Hdd(h) => h.timings.trk_read_us as u64,
            _ => 1_000_000 / 75,
        };
        let c = &mut self.sel(ch).controller;
        let value = (c.status.busy as u8) << 7
            | (c.status.drive_ready as u8) << 6
            | (c.status.write_fault as u8) << 5
            | (c.status.seek_complete as u8) << 4
            | (c.status.drq as u8) << 3
            | (c.status.corrected_data as u8) << 2
            | (c.status.index_pulse as u8) << 1
            | c.status.err as u8;
        c.status.index_pulse = false;
        if now_us.saturating_sub(c.status.index_pulse_time) >= trk_read_us {
            c.status.index_pulse = true;
            c.status.index_pulse_time = now_us;
        }
        value
    }

    /// Immediate-command DSC tracking (ATAPI SEEK / PLAY).
    pub fn atapi_check_seek_completion(&mut self, ch: usize, now_us: u64) -> u32 {
        let slot = self.sel(ch);
        if slot.drive.atapi.seek_completion_time_us != 0 {
            if slot.drive.atapi.seek_completion_time_us <= now_us {
                slot.controller.status.seek_complete = true;
                slot.drive.atapi.seek_completion_time_us = 0;
                slot.drive.curr_lba = slot.drive.next_lba;
                return 0;
            }
            return (slot.drive.atapi.seek_completion_time_us - now_us) as u32;
        }
        0
    }

    pub fn write(&mut self, address: u16, value: u32, len: u8, ctx: &mut DevCtx) {
        let (ch, port) = match self.decode(address) {
            Some(x) => x,
            None => return,
        };
        match port {
            0x00 => self.write_data(ch, value, len, ctx),
            0x01 => {
                for slot in self.channels[ch].slots.iter_mut() {
                    slot.controller.hob.feature = slot.controller.features;
                    slot.controller.features = value as u8;
                }
            }
            0x02 => {
                for slot in self.channels[ch].slots.iter_mut() {
                    slot.controller.hob.nsector = slot.controller.sector_count;
                    slot.controller.sector_count = value as u8;
                }
            }
            0x03 => {
                for slot in self.channels[ch].slots.iter_mut() {
                    slot.controller.hob.sector = slot.controller.sector_no;
                    slot.controller.sector_no = value as u8;
                }
            }
            0x04 => {
                for slot in self.channels[ch].slots.iter_mut() {
                    slot.controller.hob.lcyl = slot.controller.cylinder_no as u8;
                    slot.controller.cylinder_no =
                        (slot.controller.cylinder_no & 0xFF00) | value as u16 & 0xFF;
                }
            }
            0x05 => {
                for slot in self.channels[ch].slots.iter_mut() {
                    slot.controller.hob.hcyl = (slot.controller.cylinder_no >> 8) as u8;
                    slot.controller.cylinder_no =
                        ((value as u16 & 0xFF) << 8) | (slot.controller.cylinder_no & 0xFF);
                }
            }
            0x06 => {
                let lba_mode = (value >> 6) & 1 != 0;
                if value & 0xA0 != 0xA0 {
                    trace!("ATA{}: drv head not 1x1xxxxxb", ch);
                }
                self.channels[ch].drive_select = ((value >> 4) & 1) as usize;
                for slot in self.channels[ch].slots.iter_mut() {
                    slot.controller.head_no = (value & 0xF) as u8;
                    slot.controller.lba_mode = lba_mode;
                }
                if !self.selected_is_present(ch) {
                    trace!(
                        "ATA{}: device set to {} which does not exist",
                        ch,
                        self.channels[ch].drive_select
                    );
                }
            }
            0x07 => self.write_command(ch, value as u8, ctx),
            0x16 => self.write_device_control(ch, value as u8, ctx),
            _ => debug!("ATA{}: invalid write address 0x{:03X}", ch, address),
        }
    }

    fn write_command(&mut self, ch: usize, mut cmd: u8, ctx: &mut DevCtx) {
        if !self.selected_is_present(ch) {
            debug!("ATA{}: command 0x{:02X} issued to a missing drive", ch, cmd);
            return;
        }
        // a command write acknowledges the IRQ
        self.lower_interrupt(ch, ctx);
        if self.sel_ref(ch).controller.status.busy {
            warn!("ATA{}: command 0x{:02X} sent with BSY set", ch, cmd);
            return;
        }
        if cmd & 0xF0 == 0x10 {
            cmd = 0x10;
        }
        {
            let c = &mut self.sel(ch).controller;
            c.status.busy = true;
            c.status.err = false;
            c.status.drive_ready = true;
            c.status.drq = false;
            c.status.corrected_data = false;
            c.current_command = cmd;
            c.error_register = 0;
        }
        let exec_time = self.dispatch_ata_command(ch, cmd, ctx);
        if !self.sel_ref(ch).controller.status.err && exec_time > 0 {
            self.activate_command_timer(ch, exec_time, ctx);
        }
    }

    fn write_device_control(&mut self, ch: usize, value: u8, ctx: &mut DevCtx) {
        let prev_reset = self.sel_ref(ch).controller.control_reset;
        for slot in self.channels[ch].slots.iter_mut() {
            slot.controller.control_reset = value & 0x04 != 0;
            slot.controller.disable_irq = value & 0x02 != 0;
        }
        if !prev_reset && self.sel_ref(ch).controller.control_reset {
            debug!("ATA{}: enter RESET mode", ch);
            for dev in 0..2 {
                let is_cd = matches!(self.channels[ch].slots[dev].device, AtaDevice::Cdrom(_));
                let slot = &mut self.channels[ch].slots[dev];
                let c = &mut slot.controller;
                c.status.busy = true;
                c.status.drive_ready = false;
                c.reset_in_progress = true;
                c.status.write_fault = false;
                c.status.drq = false;
                c.status.corrected_data = false;
                c.status.err = false;
                if is_cd {
                    // an immediate-mode seek keeps its DSC semantics
                    // across SRST
                    if slot.drive.atapi.seek_completion_time_us == 0 {
                        c.status.seek_complete = true;
                    }
                } else {
                    c.status.seek_complete = true;
                }
                c.error_register = 0x01;
                c.current_command = 0;
                c.buffer_index = 0;
                c.multiple_sectors = 0;
                c.lba_mode = false;
                c.disable_irq = false;
            }
            self.lower_interrupt(ch, ctx);
        } else if self.sel_ref(ch).controller.reset_in_progress
            && !self.sel_ref(ch).controller.control_reset
        {
            debug!("ATA{}: reset complete", ch);
            for dev in 0..2 {
                let c = &mut self.channels[ch].slots[dev].controller;
                c.status.busy = false;
                c.status.drive_ready = true;
                c.reset_in_progress = false;
                self.set_signature(ch, dev);
            }
        }
    }

    // ── data register ─────────────────────────────────────────

    fn read_data(&mut self, ch: usize, len: u8, ctx: &mut DevCtx) -> u32 {
        if !self.sel_ref(ch).controller.status.drq {
            debug!(
                "ATA{}: data read with DRQ clear, last command=0x{:02X}",
                ch,
                self.sel_ref(ch).controller.current_command
            );
            return 0;
        }
        match self.sel_ref(ch).controller.current_command {
            0x20 | 0x21 | 0xC4 | 0x24 | 0x29 => {
                let c = &mut self.sel(ch).controller;
                let mut value = c.buffer[c.buffer_index] as u32;
                value |= (c.buffer[c.buffer_index + 1] as u32) << 8;
                c.buffer_index += 2;
                if c.buffer_index >= c.buffer_size {
                    c.status.drq = false;
                    if c.num_sectors == 0 {
                        c.status.err = false;
                        c.buffer_size = 0;
                    } else {
                        let exec_time = self.ata_read_next_block(ch, 0, ctx);
                        if !self.sel_ref(ch).controller.status.err {
                            self.activate_command_timer(ch, exec_time, ctx);
                            self.sel(ch).controller.status.busy = true;
                        }
                    }
                }
                value
            }
            0xEC | 0xA1 => {
                let c = &mut self.sel(ch).controller;
                let mut value = c.buffer[c.buffer_index] as u32;
                c.buffer_index += 1;
                if len > 1 {
                    value |= (c.buffer[c.buffer_index] as u32) << 8;
                    c.buffer_index += 1;
                }
                if c.buffer_index >= 512 {
                    c.status.drq = false;
                }
                value
            }
            0xA0 => self.atapi_read_data(ch, len, ctx),
            cmd => {
                debug!("ATA{}: unexpected data read, current command 0x{:02X}", ch, cmd);
                0
            }
        }
    }

    fn write_data(&mut self, ch: usize, value: u32, len: u8, ctx: &mut DevCtx) {
        match self.sel_ref(ch).controller.current_command {
            0x30 | 0x31 | 0xC5 | 0x34 | 0x39 => {
                {
                    let c = &mut self.sel(ch).controller;
                    c.buffer[c.buffer_index] = value as u8;
                    c.buffer[c.buffer_index + 1] = (value >> 8) as u8;
                    c.buffer_index += 2;
                }
                let (index, size) = {
                    let c = &self.sel_ref(ch).controller;
                    (c.buffer_index, c.buffer_size)
                };
                if index >= size {
                    // whole block buffered: commit it to the medium.
                    // No timer: the write cache accepts it immediately
                    // (the PS/1 BIOS gives the IRQ only 1000µs).
                    let dev = self.channels[ch].drive_select;
                    if self.ata_tx_sectors(ch, true, size).is_ok() {
                        self.command_successful(ch, dev, true, ctx);
                    } else {
                        let cmd = self.sel_ref(ch).controller.current_command;
                        self.command_aborted(ch, cmd, ctx);
                    }
                    // writes invalidate the whole look-ahead cache
                    self.sel(ch).controller.look_ahead_time_us = ctx.now_us();
                    if !self.sel_ref(ch).controller.status.err
                        && self.sel_ref(ch).controller.num_sectors != 0
                    {
                        self.ata_write_next_block(ch, ctx);
                        self.sel(ch).controller.status.drq = true;
                    }
                }
            }
            0xA0 => self.atapi_write_data(ch, value, len, ctx),
            cmd => {
                debug!("ATA{}: unexpected data write, current command 0x{:02X}", ch, cmd);
            }
        }
    }

    /// Port-count view of the whole controller for the status display.
    pub fn is_busy(&self) -> bool {
        self.channels.iter().any(|ch| {
            ch.slots
                .iter()
                .any(|s| matches!(s.device, AtaDevice::Hdd(_)) && s.controller.status.busy)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::cdrom::{CdRomDrive, Disc, Track};
    use super::storage::{DrivePerformance, HardDisk, MediaGeometry};
    use super::*;
    use crate::devices::pic::Pic;
    use crate::machine::clock::Clock;
    use crate::machine::dma::Dma;
    use crate::machine::IntrLine;

    struct Fixture {
        clock: Clock,
        timers: TimerWheel,
        pic: Pic,
        intr: IntrLine,
        dma: Dma,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                clock: Clock::new(),
                timers: TimerWheel::new(),
                pic: Pic::new(),
                intr: IntrLine::default(),
                dma: Dma::new(),
            }
        }

        fn ctx(&mut self) -> DevCtx<'_> {
            DevCtx {
                clock: &self.clock,
                timers: &mut self.timers,
                pic: &mut self.pic,
                intr: &mut self.intr,
                dma: &mut self.dma,
            }
        }

        fn run(&mut self, ata: &mut StorageCtrlAta, until_ns: u64) {
            loop {
                let due = match self.timers.next_due() {
                    Some(d) if d <= until_ns => d,
                    _ => break,
                };
                let now = self.clock.now_ns();
                self.clock.advance(due - now);
                if let Some((_, TimerFn::AtaCmd(ch, dev))) = self.timers.pop_due(due) {
                    ata.command_timer(ch, dev, &mut self.ctx());
                }
            }
            let now = self.clock.now_ns();
            if until_ns > now {
                self.clock.advance(until_ns - now);
            }
        }

        fn run_all(&mut self, ata: &mut StorageCtrlAta) {
            while let Some(due) = self.timers.next_due() {
                self.run(ata, due);
            }
        }
    }

    fn small_geometry() -> MediaGeometry {
        MediaGeometry {
            cylinders: 40,
            heads: 4,
            spt: 17,
            wpcomp: -1,
            lzone: 40,
        }
    }

    fn ata_with_hdd(fx: &mut Fixture) -> (StorageCtrlAta, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.img");
        HardDisk::create(&path, small_geometry()).unwrap();
        let hdd = HardDisk::open(&path, small_geometry(), DrivePerformance::default()).unwrap();
        let mut ata = StorageCtrlAta::install(
            &mut fx.timers,
            [
                [AtaDevice::Hdd(hdd), AtaDevice::None],
                [AtaDevice::None, AtaDevice::None],
            ],
        );
        ata.power_on_reset(&mut fx.ctx());
        // wait out the spindle power-up
        fx.run_all(&mut ata);
        (ata, dir)
    }

    fn ata_with_cd(fx: &mut Fixture) -> StorageCtrlAta {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(
            Disc::from_tracks(vec![Track {
                number: 1,
                attr: 0x14,
                start_lba: 0,
                length: 5000,
            }]),
            0,
        );
        let mut ata = StorageCtrlAta::install(
            &mut fx.timers,
            [
                [AtaDevice::Cdrom(cd), AtaDevice::None],
                [AtaDevice::None, AtaDevice::None],
            ],
        );
        ata.power_on_reset(&mut fx.ctx());
        // swallow the power-on medium-change unit attention
        fx.clock.advance(10 * crate::machine::clock::SEC);
        send_packet(fx, &mut ata, &[0x00; 12]); // TEST UNIT READY
        fx.run_all(&mut ata);
        ata
    }

    fn set_chs(fx: &mut Fixture, ata: &mut StorageCtrlAta, c: u16, h: u8, s: u8, count: u8) {
        ata.write(0x1F2, count as u32, 1, &mut fx.ctx());
        ata.write(0x1F3, s as u32, 1, &mut fx.ctx());
        ata.write(0x1F4, (c & 0xFF) as u32, 1, &mut fx.ctx());
        ata.write(0x1F5, (c >> 8) as u32, 1, &mut fx.ctx());
        ata.write(0x1F6, (0xA0 | h) as u32, 1, &mut fx.ctx());
    }

    fn status(fx: &mut Fixture, ata: &mut StorageCtrlAta) -> u8 {
        ata.read(0x1F7, 1, &mut fx.ctx()) as u8
    }

    fn read_buffer(fx: &mut Fixture, ata: &mut StorageCtrlAta, words: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(words * 2);
        for _ in 0..words {
            let w = ata.read(0x1F0, 2, &mut fx.ctx()) as u16;
            out.push(w as u8);
            out.push((w >> 8) as u8);
        }
        out
    }

    fn send_packet(fx: &mut Fixture, ata: &mut StorageCtrlAta, cdb: &[u8; 12]) {
        ata.write(0x1F4, 0xFE, 1, &mut fx.ctx()); // byte count
        ata.write(0x1F5, 0xFF, 1, &mut fx.ctx());
        ata.write(0x1F7, 0xA0, 1, &mut fx.ctx()); // PACKET
        assert_eq!(status(fx, ata) & 0x08, 0x08, "CDB DRQ expected");
        for i in 0..6 {
            let w = cdb[i * 2] as u32 | (cdb[i * 2 + 1] as u32) << 8;
            ata.write(0x1F0, w, 2, &mut fx.ctx());
        }
    }

    #[test]
    fn identify_device_reports_geometry_and_lba() {
        let mut fx = Fixture::new();
        let (mut ata, _dir) = ata_with_hdd(&mut fx);
        ata.write(0x1F6, 0xA0, 1, &mut fx.ctx());
        ata.write(0x1F7, 0xEC, 1, &mut fx.ctx());
        assert_eq!(status(&mut fx, &mut ata) & 0x08, 0x08); // DRQ
        let data = read_buffer(&mut fx, &mut ata, 256);
        let word = |i: usize| data[i * 2] as u16 | (data[i * 2 + 1] as u16) << 8;
        assert_eq!(word(0), 0x0040);
        assert_eq!(word(1), 40);
        assert_eq!(word(3), 4);
        assert_eq!(word(6), 17);
        assert_eq!(word(47), ATA_MAX_MULTIPLE_SECTORS as u16);
        let total = 40 * 4 * 17u32;
        assert_eq!(word(60) as u32 | (word(61) as u32) << 16, total);
        assert_eq!(status(&mut fx, &mut ata) & 0x08, 0); // DRQ dropped
    }

    #[test]
    fn write_then_read_sectors_roundtrip() {
        let mut fx = Fixture::new();
        let (mut ata, _dir) = ata_with_hdd(&mut fx);
        // WRITE SECTORS, CHS 0/0/5, 2 sectors
        set_chs(&mut fx, &mut ata, 0, 0, 5, 2);
        ata.write(0x1F7, 0x30, 1, &mut fx.ctx());
        fx.run_all(&mut ata);
        assert_eq!(status(&mut fx, &mut ata) & 0x08, 0x08, "write DRQ");
        let payload: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
        for sector in 0..2 {
            for i in 0..256 {
                let off = sector * 512 + i * 2;
                let w = payload[off] as u32 | (payload[off + 1] as u32) << 8;
                ata.write(0x1F0, w, 2, &mut fx.ctx());
            }
        }
        fx.run_all(&mut ata);
        let st = status(&mut fx, &mut ata);
        assert_eq!(st & 0x01, 0, "no error after write");

        // READ SECTORS back
        set_chs(&mut fx, &mut ata, 0, 0, 5, 2);
        ata.write(0x1F7, 0x20, 1, &mut fx.ctx());
        assert_eq!(status(&mut fx, &mut ata) & 0x80, 0x80, "BSY while reading");
        fx.run_all(&mut ata);
        assert_eq!(status(&mut fx, &mut ata) & 0x08, 0x08, "read DRQ");
        let mut back = read_buffer(&mut fx, &mut ata, 256);
        fx.run_all(&mut ata); // second sector staged by timer
        back.extend(read_buffer(&mut fx, &mut ata, 256));
        assert_eq!(back, payload);
    }

    #[test]
    fn read_multiple_honors_block_size() {
        let mut fx = Fixture::new();
        let (mut ata, _dir) = ata_with_hdd(&mut fx);
        // SET MULTIPLE MODE 4
        set_chs(&mut fx, &mut ata, 0, 0, 1, 4);
        ata.write(0x1F7, 0xC6, 1, &mut fx.ctx());
        assert_eq!(status(&mut fx, &mut ata) & 0x01, 0);
        // READ MULTIPLE of 8 sectors: two 4-sector blocks
        set_chs(&mut fx, &mut ata, 0, 0, 1, 8);
        ata.write(0x1F7, 0xC4, 1, &mut fx.ctx());
        fx.run_all(&mut ata);
        let block1 = read_buffer(&mut fx, &mut ata, 4 * 256);
        assert_eq!(block1.len(), 2048);
        // controller re-arms for the next block
        fx.run_all(&mut ata);
        assert_eq!(status(&mut fx, &mut ata) & 0x08, 0x08);
    }

    #[test]
    fn set_multiple_rejects_non_power_of_two() {
        let mut fx = Fixture::new();
        let (mut ata, _dir) = ata_with_hdd(&mut fx);
        set_chs(&mut fx, &mut ata, 0, 0, 1, 3);
        ata.write(0x1F7, 0xC6, 1, &mut fx.ctx());
        let st = status(&mut fx, &mut ata);
        assert_eq!(st & 0x01, 0x01);
        assert_eq!(ata.read(0x1F1, 1, &mut fx.ctx()) as u8, 0x04); // ABRT
    }

    #[test]
    fn lba48_read_uses_hob_registers() {
        let mut fx = Fixture::new();
        let (mut ata, _dir) = ata_with_hdd(&mut fx);
        // write the HOB bytes first, then the low bytes
        ata.write(0x1F2, 0, 1, &mut fx.ctx()); // sector count high
        ata.write(0x1F2, 1, 1, &mut fx.ctx()); // sector count low
        ata.write(0x1F3, 0, 1, &mut fx.ctx());
        ata.write(0x1F3, 100, 1, &mut fx.ctx()); // lba 100
        ata.write(0x1F4, 0, 1, &mut fx.ctx());
        ata.write(0x1F4, 0, 1, &mut fx.ctx());
        ata.write(0x1F5, 0, 1, &mut fx.ctx());
        ata.write(0x1F5, 0, 1, &mut fx.ctx());
        ata.write(0x1F6, 0xE0, 1, &mut fx.ctx()); // LBA mode
        ata.write(0x1F7, 0x24, 1, &mut fx.ctx()); // READ SECTORS EXT
        fx.run_all(&mut ata);
        assert_eq!(status(&mut fx, &mut ata) & 0x09, 0x08, "DRQ, no error");
    }

    #[test]
    fn srst_resets_and_sets_signature() {
        let mut fx = Fixture::new();
        let mut ata = ata_with_cd(&mut fx);
        ata.write(0x3F6, 0x04, 1, &mut fx.ctx()); // SRST
        ata.write(0x3F6, 0x00, 1, &mut fx.ctx());
        // ATAPI signature in the cylinder registers
        assert_eq!(ata.read(0x1F4, 1, &mut fx.ctx()), 0x14);
        assert_eq!(ata.read(0x1F5, 1, &mut fx.ctx()), 0xEB);
        assert_eq!(ata.read(0x1F2, 1, &mut fx.ctx()), 0x01);
    }

    #[test]
    fn atapi_inquiry_returns_cdrom_device() {
        let mut fx = Fixture::new();
        let mut ata = ata_with_cd(&mut fx);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x12; // INQUIRY
        cdb[4] = 36;
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        assert_eq!(status(&mut fx, &mut ata) & 0x08, 0x08);
        // interrupt reason: data, to host
        assert_eq!(ata.read(0x1F2, 1, &mut fx.ctx()) & 0x03, 0x02);
        let data = read_buffer(&mut fx, &mut ata, 18);
        assert_eq!(data[0], 0x05); // CD-ROM
        assert_eq!(data[1], 0x80); // removable
        assert_eq!(&data[8..16], b"QUARTZ  ");
    }

    #[test]
    fn atapi_read_capacity_reports_sectors() {
        let mut fx = Fixture::new();
        let mut ata = ata_with_cd(&mut fx);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x25;
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        let data = read_buffer(&mut fx, &mut ata, 4);
        let sectors = u32::from_be_bytes(data[0..4].try_into().unwrap());
        assert_eq!(sectors, 5000);
        let blocksize = u32::from_be_bytes(data[4..8].try_into().unwrap());
        assert_eq!(blocksize, 2048);
    }

    #[test]
    fn atapi_sense_latch_roundtrip() {
        let mut fx = Fixture::new();
        let mut ata = ata_with_cd(&mut fx);
        // READ(10) out of range -> ILLEGAL REQUEST / LBA OOR
        let mut cdb = [0u8; 12];
        cdb[0] = 0x28;
        cdb[2..6].copy_from_slice(&100_000u32.to_be_bytes());
        cdb[8] = 1;
        send_packet(&mut fx, &mut ata, &cdb);
        let st = status(&mut fx, &mut ata);
        assert_eq!(st & 0x01, 0x01, "ERR set");
        assert_eq!(ata.read(0x1F1, 1, &mut fx.ctx()) >> 4, SENSE_ILLEGAL_REQUEST as u32);

        // REQUEST SENSE returns the latched key
        let mut cdb = [0u8; 12];
        cdb[0] = 0x03;
        cdb[4] = 18;
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        let data = read_buffer(&mut fx, &mut ata, 9);
        assert_eq!(data[0] & 0x7F, 0x70);
        assert_eq!(data[2] & 0x0F, SENSE_ILLEGAL_REQUEST);
        assert_eq!(data[12], ASC_LOGICAL_BLOCK_OOR);
    }

    #[test]
    fn atapi_unit_attention_on_medium_change_clears_after_sense() {
        let mut fx = Fixture::new();
        let mut ata = ata_with_cd(&mut fx);
        // swap the disc
        if let AtaDevice::Cdrom(cd) = &mut ata.channels[0].slots[0].device {
            cd.insert_disc(
                Disc::from_tracks(vec![Track {
                    number: 1,
                    attr: 0x14,
                    start_lba: 0,
                    length: 100,
                }]),
                fx.clock.now_ns() / 1000,
            );
        }
        fx.clock.advance(10 * crate::machine::clock::SEC);
        // first TEST UNIT READY errors with UNIT ATTENTION
        send_packet(&mut fx, &mut ata, &[0u8; 12]);
        assert_eq!(status(&mut fx, &mut ata) & 0x01, 0x01);
        assert_eq!(ata.read(0x1F1, 1, &mut fx.ctx()) >> 4, SENSE_UNIT_ATTENTION as u32);
        // REQUEST SENSE reports and clears it
        let mut cdb = [0u8; 12];
        cdb[0] = 0x03;
        cdb[4] = 18;
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        let data = read_buffer(&mut fx, &mut ata, 9);
        assert_eq!(data[2] & 0x0F, SENSE_UNIT_ATTENTION);
        assert_eq!(data[12], ASC_NOT_READY_TO_READY);
        // next TEST UNIT READY is clean
        send_packet(&mut fx, &mut ata, &[0u8; 12]);
        fx.run_all(&mut ata);
        assert_eq!(status(&mut fx, &mut ata) & 0x01, 0);
    }

    #[test]
    fn atapi_read_toc_format0() {
        let mut fx = Fixture::new();
        let mut ata = ata_with_cd(&mut fx);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x43;
        cdb[7] = 0x00;
        cdb[8] = 64;
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        let data = read_buffer(&mut fx, &mut ata, 10);
        assert_eq!(data[2], 1); // first track
        assert_eq!(data[3], 1); // last track
        assert_eq!(data[4 + 2], 1); // track 1 descriptor
        assert_eq!(data[4 + 8 + 2], 0xAA); // lead-out
    }

    #[test]
    fn atapi_play_audio_then_subchannel_position() {
        let mut fx = Fixture::new();
        let mut cd = CdRomDrive::new();
        cd.insert_disc(
            Disc::from_tracks(vec![
                Track { number: 1, attr: 0x14, start_lba: 0, length: 1000 },
                Track { number: 2, attr: 0x10, start_lba: 1000, length: 9000 },
            ]),
            0,
        );
        let mut ata = StorageCtrlAta::install(
            &mut fx.timers,
            [
                [AtaDevice::Cdrom(cd), AtaDevice::None],
                [AtaDevice::None, AtaDevice::None],
            ],
        );
        ata.power_on_reset(&mut fx.ctx());
        fx.clock.advance(10 * crate::machine::clock::SEC);
        send_packet(&mut fx, &mut ata, &[0u8; 12]); // clear UA
        fx.run_all(&mut ata);

        // PLAY AUDIO lba=1000, len=750 (10 seconds)
        let mut cdb = [0u8; 12];
        cdb[0] = 0x45;
        cdb[2..6].copy_from_slice(&1000u32.to_be_bytes());
        cdb[7..9].copy_from_slice(&750u16.to_be_bytes());
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        assert_eq!(status(&mut fx, &mut ata) & 0x01, 0);

        // let five seconds of audio elapse
        fx.clock.advance(5 * crate::machine::clock::SEC);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x42; // READ SUB-CHANNEL
        cdb[2] = 0x40; // SubQ
        cdb[3] = 0x01; // current position
        cdb[8] = 16;
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        let data = read_buffer(&mut fx, &mut ata, 8);
        assert_eq!(data[1], 0x11); // audio playing
        let pos = u32::from_be_bytes(data[8..12].try_into().unwrap());
        assert!(pos > 1000 && pos <= 1000 + 5 * 75 + 75, "pos={}", pos);
    }

    #[test]
    fn atapi_stop_ends_playback() {
        let mut fx = Fixture::new();
        let mut cd = CdRomDrive::new();
        cd.insert_disc(
            Disc::from_tracks(vec![Track { number: 1, attr: 0x10, start_lba: 0, length: 20000 }]),
            0,
        );
        let mut ata = StorageCtrlAta::install(
            &mut fx.timers,
            [
                [AtaDevice::Cdrom(cd), AtaDevice::None],
                [AtaDevice::None, AtaDevice::None],
            ],
        );
        ata.power_on_reset(&mut fx.ctx());
        fx.clock.advance(10 * crate::machine::clock::SEC);
        send_packet(&mut fx, &mut ata, &[0u8; 12]);
        fx.run_all(&mut ata);

        let mut cdb = [0u8; 12];
        cdb[0] = 0x45;
        cdb[2..6].copy_from_slice(&0u32.to_be_bytes());
        cdb[7..9].copy_from_slice(&7500u16.to_be_bytes());
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        fx.clock.advance(crate::machine::clock::SEC);

        let mut cdb = [0u8; 12];
        cdb[0] = 0x4E; // STOP PLAY/SCAN
        send_packet(&mut fx, &mut ata, &cdb);
        fx.run_all(&mut ata);
        if let AtaDevice::Cdrom(cd) = &mut ata.channels[0].slots[0].device {
            let (status, _) = cd.get_audio_status(fx.clock.now_ns() / 1000);
            assert_eq!(status, super::cdrom::AudioStatus::Stopped);
        }
    }
}

// ── Save state ────────────────────────────────────────────────

use crate::error::SaveStateError;
use crate::savestate::{LumpReader, LumpWriter, StateBuf};

impl Controller {
    fn save(&self, w: &mut LumpWriter) {
        w.put_bool(self.status.busy);
        w.put_bool(self.status.drive_ready);
        w.put_bool(self.status.write_fault);
        w.put_bool(self.status.seek_complete);
        w.put_bool(self.status.drq);
        w.put_bool(self.status.corrected_data);
        w.put_bool(self.status.err);
        w.put_u8(self.error_register);
        w.put_bool(self.interrupt_reason.c_d);
        w.put_bool(self.interrupt_reason.i_o);
        w.put_u8(self.head_no);
        w.put_u8(self.sector_count);
        w.put_u8(self.sector_no);
        w.put_u16(self.cylinder_no);
        w.put_bool(self.lba_mode);
        w.put_bool(self.lba48);
        w.put_u8(self.features);
        w.put_u32(self.multiple_sectors);
        w.put_u8(self.mdma_mode);
        w.put_u8(self.udma_mode);
        w.put_bool(self.packet_dma);
        w.put_bytes(&self.buffer);
        w.put_u64(self.buffer_index as u64);
        w.put_u64(self.buffer_size as u64);
        w.put_u64(self.drq_index as u64);
        w.put_u32(self.byte_count);
        w.put_u32(self.num_sectors);
        w.put_u8(self.current_command);
        w.put_u8(self.hob.nsector);
        w.put_u8(self.hob.sector);
        w.put_u8(self.hob.lcyl);
        w.put_u8(self.hob.hcyl);
        w.put_u8(self.hob.feature);
        w.put_u64(self.look_ahead_time_us);
        w.put_bool(self.control_reset);
        w.put_bool(self.disable_irq);
        w.put_bool(self.reset_in_progress);
    }

    fn restore(&mut self, r: &mut LumpReader) -> Result<(), SaveStateError> {
        self.status.busy = r.get_bool()?;
        self.status.drive_ready = r.get_bool()?;
        self.status.write_fault = r.get_bool()?;
        self.status.seek_complete = r.get_bool()?;
        self.status.drq = r.get_bool()?;
        self.status.corrected_data = r.get_bool()?;
        self.status.err = r.get_bool()?;
        self.error_register = r.get_u8()?;
        self.interrupt_reason.c_d = r.get_bool()?;
        self.interrupt_reason.i_o = r.get_bool()?;
        self.head_no = r.get_u8()?;
        self.sector_count = r.get_u8()?;
        self.sector_no = r.get_u8()?;
        self.cylinder_no = r.get_u16()?;
        self.lba_mode = r.get_bool()?;
        self.lba48 = r.get_bool()?;
        self.features = r.get_u8()?;
        self.multiple_sectors = r.get_u32()?;
        self.mdma_mode = r.get_u8()?;
        self.udma_mode = r.get_u8()?;
        self.packet_dma = r.get_bool()?;
        self.buffer = r.get_bytes(ATA_BUFFER_SIZE)?;
        self.buffer_index = r.get_u64()? as usize;
        self.buffer_size = r.get_u64()? as usize;
        self.drq_index = r.get_u64()? as usize;
        self.byte_count = r.get_u32()?;
        self.num_sectors = r.get_u32()?;
        self.current_command = r.get_u8()?;
        self.hob.nsector = r.get_u8()?;
        self.hob.sector = r.get_u8()?;
        self.hob.lcyl = r.get_u8()?;
        self.hob.hcyl = r.get_u8()?;
        self.hob.feature = r.get_u8()?;
        self.look_ahead_time_us = r.get_u64()?;
        self.control_reset = r.get_bool()?;
        self.disable_irq = r.get_bool()?;
        self.reset_in_progress = r.get_bool()?;
        Ok(())
    }
}

impl StorageCtrlAta {
    pub fn save_state(&self, state: &mut StateBuf) {
        let mut w = LumpWriter::new();
        for ch in &self.channels {
            w.put_u8(ch.drive_select as u8);
            for slot in &ch.slots {
                slot.controller.save(&mut w);
                w.put_i64(slot.drive.next_lba);
                w.put_i64(slot.drive.curr_lba);
                w.put_i64(slot.drive.prev_cyl);
                w.put_u8(slot.drive.sense.key);
                w.put_u8(slot.drive.sense.asc);
                w.put_u8(slot.drive.sense.ascq);
                w.put_u8(slot.drive.atapi.command);
                w.put_i64(slot.drive.atapi.bytes_remaining);
                w.put_i64(slot.drive.atapi.bytes_total);
                w.put_u32(slot.drive.atapi.sectors_remaining);
                w.put_u32(slot.drive.atapi.sectors_total);
                w.put_u32(slot.drive.atapi.sector_size);
                w.put_u32(slot.drive.atapi.drq_sectors);
                w.put_u64(slot.drive.atapi.seek_completion_time_us);
                w.put_bytes(&slot.drive.atapi.error_recovery);
            }
        }
        state.write_lump("ata", w.finish());
    }

    pub fn restore_state(&mut self, state: &mut StateBuf) -> Result<(), SaveStateError> {
        let mut r = state.read_lump("ata")?;
        for ch in self.channels.iter_mut() {
            ch.drive_select = r.get_u8()? as usize;
            for slot in ch.slots.iter_mut() {
                slot.controller.restore(&mut r)?;
                slot.drive.next_lba = r.get_i64()?;
                slot.drive.curr_lba = r.get_i64()?;
                slot.drive.prev_cyl = r.get_i64()?;
                slot.drive.sense.key = r.get_u8()?;
                slot.drive.sense.asc = r.get_u8()?;
                slot.drive.sense.ascq = r.get_u8()?;
                slot.drive.atapi.command = r.get_u8()?;
                slot.drive.atapi.bytes_remaining = r.get_i64()?;
                slot.drive.atapi.bytes_total = r.get_i64()?;
                slot.drive.atapi.sectors_remaining = r.get_u32()?;
                slot.drive.atapi.sectors_total = r.get_u32()?;
                slot.drive.atapi.sector_size = r.get_u32()?;
                slot.drive.atapi.drq_sectors = r.get_u32()?;
                slot.drive.atapi.seek_completion_time_us = r.get_u64()?;
                slot.drive.atapi.error_recovery.copy_from_slice(&r.get_bytes(8)?);
                // IDENTIFY data regenerates on the next request
                slot.drive.identify = None;
            }
        }
        r.expect_end()
    }
}
