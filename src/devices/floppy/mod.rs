//! 8272A-compatible floppy disk controller (82077AA register set).
//!
//! The controller walks the classic command → execution → result
//! phase machine, with the data FIFO at 0x3F5 carrying command bytes,
//! result bytes and, in non-DMA mode, sector data.  Long operations
//! re-arm the controller timer; nothing blocks.
//!
//! A contrived RESET pseudo-command models the 250 µs the chip takes
//! to come out of a DOR/DSR-initiated reset.

pub mod disk;

use log::{debug, error, trace, warn};

use crate::machine::bus::{PortRange, PORT_8BIT, PORT_READ, PORT_RW};
use crate::machine::clock::USEC;
use crate::machine::dma::DmaResult;
use crate::machine::timers::{TimerFn, TimerId, TimerWheel};
use crate::machine::{DevCtx, DmaCtx, ResetKind};

use disk::{FloppyDisk, FloppyDrive, SECTOR_SIZE};

pub const FLOPPY_DMA_CHAN: usize = 2;
pub const FLOPPY_IRQ: usize = 6;

pub const FDC_PORTS: &[PortRange] = &[
    // Status Register A / B (Model 30)
    PortRange { from: 0x3F0, to: 0x3F1, mask: PORT_8BIT | PORT_READ },
    // DOR
    PortRange { from: 0x3F2, to: 0x3F2, mask: PORT_8BIT | PORT_RW },
    // MSR read / DSR write
    PortRange { from: 0x3F4, to: 0x3F4, mask: PORT_8BIT | PORT_RW },
    // data FIFO
    PortRange { from: 0x3F5, to: 0x3F5, mask: PORT_8BIT | PORT_RW },
    // DIR read / CCR write
    PortRange { from: 0x3F7, to: 0x3F7, mask: PORT_8BIT | PORT_RW },
];

// ── Interface register bits ───────────────────────────────────

const DOR_MOTEN0: u8 = 0x10;
const DOR_NDMAGATE: u8 = 0x08;
const DOR_NRESET: u8 = 0x04;
const DOR_DRVSEL: u8 = 0x03;

const MSR_RQM: u8 = 0x80;
const MSR_DIO: u8 = 0x40;
const MSR_NONDMA: u8 = 0x20;
const MSR_CMDBUSY: u8 = 0x10;

const DSR_SW_RESET: u8 = 0x80;
const DSR_PWR_DOWN: u8 = 0x40;
const DSR_PRECOMP: u8 = 0x1C;
const DSR_DRATE_SEL: u8 = 0x03;

const DIR_DSKCHG: u8 = 0x80;
const DIR_NDMAGATE: u8 = 0x08;

const CCR_NOPREC: u8 = 0x04;
const CCR_DRATE_SEL: u8 = 0x03;

// ── Status register bits ──────────────────────────────────────

const ST0_IC: u8 = 0xC0;
const ST0_IC_NORMAL: u8 = 0x00;
const ST0_IC_ABNORMAL: u8 = 0x40;
const ST0_IC_INVALID: u8 = 0x80;
const ST0_IC_POLLING: u8 = 0xC0;
const ST0_SE: u8 = 0x20;
const ST0_EC: u8 = 0x10;

const ST1_DE: u8 = 0x20;
const ST1_OR: u8 = 0x10;
const ST1_ND: u8 = 0x04;
const ST1_NW: u8 = 0x02;
const ST1_MA: u8 = 0x01;

const ST2_DD: u8 = 0x20;
const ST2_WC: u8 = 0x10;
const ST2_MD: u8 = 0x01;

const ST3_WP: u8 = 0x40;
const ST3_T0: u8 = 0x10;
const ST3_BASE: u8 = 0x28;

const CONF_EIS: u8 = 0x40;
const CONF_EFIFO: u8 = 0x20;

// ── Command opcodes (low five bits of the first byte) ─────────

const CMD_MASK: u8 = 0x1F;

const CMD_READ: u8 = 0x06;
const CMD_READ_DEL: u8 = 0x0C;
const CMD_WRITE: u8 = 0x05;
const CMD_WRITE_DEL: u8 = 0x09;
const CMD_READ_TRACK: u8 = 0x02;
const CMD_VERIFY: u8 = 0x16;
const CMD_VERSION: u8 = 0x10;
const CMD_FORMAT_TRACK: u8 = 0x0D;
const CMD_SCAN_EQ: u8 = 0x11;
const CMD_SCAN_LO_EQ: u8 = 0x19;
const CMD_SCAN_HI_EQ: u8 = 0x1D;
const CMD_RECALIBRATE: u8 = 0x07;
const CMD_SENSE_INT: u8 = 0x08;
const CMD_SPECIFY: u8 = 0x03;
const CMD_SENSE_DRIVE: u8 = 0x04;
const CMD_CONFIGURE: u8 = 0x13;
const CMD_SEEK: u8 = 0x0F;
const CMD_DUMPREG: u8 = 0x0E;
const CMD_READ_ID: u8 = 0x0A;
const CMD_PERP_MODE: u8 = 0x12;
const CMD_LOCK: u8 = 0x14;

const CMD_INVALID: u8 = 0x00;
/// Contrived: models the delay after a DOR/DSR reset.
const CMD_RESET: u8 = 0x1F;

/// Command length in bytes, by opcode.
fn command_size(code: u8) -> (usize, &'static str) {
    match code {
        CMD_READ => (9, "read data"),
        CMD_READ_DEL => (9, "read deleted data"),
        CMD_WRITE => (9, "write data"),
        CMD_WRITE_DEL => (9, "write deleted data"),
        CMD_READ_TRACK => (9, "read track"),
        CMD_VERIFY => (9, "verify"),
        CMD_VERSION => (1, "version"),
        CMD_FORMAT_TRACK => (6, "format track"),
        CMD_SCAN_EQ => (9, "scan equal"),
        CMD_SCAN_LO_EQ => (9, "scan low or equal"),
        CMD_SCAN_HI_EQ => (9, "scan high or equal"),
        CMD_RECALIBRATE => (2, "recalibrate"),
        CMD_SENSE_INT => (1, "sense interrupt"),
        CMD_SPECIFY => (3, "specify"),
        CMD_SENSE_DRIVE => (2, "sense drive status"),
        CMD_CONFIGURE => (4, "configure"),
        CMD_SEEK => (3, "seek"),
        CMD_DUMPREG => (1, "dumpreg"),
        CMD_READ_ID => (2, "read ID"),
        CMD_PERP_MODE => (2, "perpendicular mode"),
        CMD_LOCK => (1, "lock/unlock"),
        _ => (1, "INVALID COMMAND"),
    }
}

/// Data rates by DSR/CCR select value, in kbit/s.
const DRATE_IN_K: [u32; 4] = [500, 300, 250, 1000];

/// Register interface flavour.  The PS/1 runs the Model 30 mode with
/// the extra SRA/SRB status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdcMode {
    PcAt,
    Model30,
}

// ── Controller ────────────────────────────────────────────────

pub struct FloppyCtrl {
    mode: FdcMode,

    // interface registers
    dor: u8,
    main_status_reg: u8,
    data_rate: u8,
    noprec: bool,
    dir: [u8; 4],

    // command/result FIFO
    command: [u8; 10],
    command_index: usize,
    command_size: usize,
    command_complete: bool,
    pending_command: u8,
    multi_track: bool,
    result: [u8; 10],
    result_index: usize,
    result_size: usize,

    status_reg0: u8,
    status_reg1: u8,
    status_reg2: u8,
    status_reg3: u8,

    // per-drive position state
    cylinder: [u8; 4],
    head: [u8; 4],
    sector: [u8; 4],
    eot: [u8; 4],
    cur_cylinder: [u8; 4],
    direction: [bool; 4],
    step: [bool; 4],
    wrdata: [bool; 4],
    rddata: [bool; 4],
    /// Head-unload deadline per (drive, head), in µs of virtual time.
    last_hut: [[u64; 2]; 4],
    boot_time: [u64; 4],

    pending_irq: bool,
    reset_sensei: u8,

    // programmed parameters
    srt: u8,
    hut: u8,
    hlt: u8,
    config: u8,
    pretrk: u8,
    perp_mode: u8,
    lock: bool,

    // sector staging
    floppy_buffer: [u8; SECTOR_SIZE],
    floppy_buffer_index: usize,
    format_count: u16,
    format_fillbyte: u8,
    tc: bool,

    timer: TimerId,
    latency_mult: f64,

    // host side
    media: [Option<FloppyDisk>; 2],
    device_type: [FloppyDrive; 2],
    num_installed_floppies: usize,
    disk_changed: [bool; 2],
}

impl FloppyCtrl {
    pub fn install(timers: &mut TimerWheel, drives: [FloppyDrive; 2], latency_mult: f64) -> Self {
        let num_installed = drives.iter().filter(|d| **d != FloppyDrive::None).count();
        Self {
            mode: FdcMode::Model30,
            dor: 0,
            main_status_reg: 0,
            data_rate: 0,
            noprec: false,
            dir: [0; 4],
            command: [0; 10],
            command_index: 0,
            command_size: 0,
            command_complete: true,
            pending_command: CMD_INVALID,
            multi_track: false,
            result: [0; 10],
            result_index: 0,
            result_size: 0,
            status_reg0: 0,
            status_reg1: 0,
            status_reg2: 0,
            status_reg3: 0,
            cylinder: [0; 4],
            head: [0; 4],
            sector: [0; 4],
            eot: [0; 4],
            cur_cylinder: [0; 4],
            direction: [false; 4],
            step: [false; 4],
            wrdata: [false; 4],
            rddata: [false; 4],
            last_hut: [[0; 2]; 4],
            boot_time: [0; 4],
            pending_irq: false,
            reset_sensei: 0,
            srt: 0,
            hut: 0,
            hlt: 0,
            config: CONF_EFIFO,
            pretrk: 0,
            perp_mode: 0,
            lock: false,
            floppy_buffer: [0; SECTOR_SIZE],
            floppy_buffer_index: 0,
            format_count: 0,
            format_fillbyte: 0,
            tc: false,
            timer: timers.register("FDC", TimerFn::Fdc),
            latency_mult: latency_mult.clamp(0.0, 1.0),
            media: [None, None],
            device_type: drives,
            num_installed_floppies: num_installed,
            disk_changed: [false; 2],
        }
    }

    pub fn insert_media(&mut self, drive: usize, disk: FloppyDisk) {
        debug!(
            "floppy {}: '{}' ro={}, h={},t={},spt={}",
            if drive == 0 { "A" } else { "B" },
            disk.path.display(),
            disk.write_protected,
            disk.heads,
            disk.tracks,
            disk.spt
        );
        self.dir[drive] |= DIR_DSKCHG;
        self.media[drive] = Some(disk);
        self.disk_changed[drive] = true;
    }

    pub fn eject_media(&mut self, drive: usize) {
        if let Some(mut m) = self.media[drive].take() {
            m.close();
            self.dir[drive] |= DIR_DSKCHG;
            debug!("floppy {} ejected", if drive == 0 { "A" } else { "B" });
        }
    }

    pub fn reset(&mut self, kind: ResetKind, ctx: &mut DevCtx) {
        match kind {
            ResetKind::PowerOn => {
                self.dor = 0;
                self.main_status_reg = 0;
                self.data_rate = 0;
                self.noprec = false;
                self.dir = [0; 4];
                self.pending_irq = false;
                self.reset_sensei = 0;
                self.status_reg0 = 0;
                self.status_reg1 = 0;
                self.status_reg2 = 0;
                self.status_reg3 = 0;
                self.srt = 0;
                self.hut = 0;
                self.hlt = 0;
                self.last_hut = [[0; 2]; 4];
                self.boot_time = [0; 4];
                self.cur_cylinder = [0; 4];
                self.floppy_buffer_index = 0;
                self.tc = false;
            }
            _ => {
                // hardware reset clears everything except the
                // parameters programmed by SPECIFY
                self.pending_irq = false;
                self.reset_sensei = 0;
                self.main_status_reg &= MSR_NONDMA;
                self.status_reg0 = 0;
                self.status_reg1 = 0;
                self.status_reg2 = 0;
                self.status_reg3 = 0;
            }
        }

        if kind != ResetKind::Software {
            // software reset (DOR bit 2 / DSR bit 7) does not touch
            // DOR, DIR, CCR or the lock bit
            self.dor = DOR_NDMAGATE | DOR_NRESET;
            for d in 0..4 {
                self.dir[d] |= DIR_DSKCHG;
            }
            self.data_rate = 2; // 250 Kbps
            self.lock = false;
        }
        if !self.lock {
            self.config = CONF_EFIFO;
            self.pretrk = 0;
        }
        self.perp_mode = 0;

        for d in 0..4 {
            self.cylinder[d] = 0;
            self.head[d] = 0;
            self.sector[d] = 0;
            self.eot[d] = 0;
            self.step[d] = false;
            self.wrdata[d] = false;
            self.rddata[d] = false;
        }

        ctx.lower_irq(FLOPPY_IRQ);
        if self.main_status_reg & MSR_NONDMA == 0 {
            ctx.dma.set_drq(FLOPPY_DMA_CHAN, false);
        }
        self.enter_idle_phase();
    }

    pub fn power_off(&mut self) {
        self.dor = 0;
    }

    // ── helpers ───────────────────────────────────────────────

    fn current_drive(&self) -> usize {
        (self.dor & DOR_DRVSEL) as usize
    }

    fn cmd_code(&self) -> u8 {
        self.pending_command & CMD_MASK
    }

    fn cmd_mtrk(&self) -> bool {
        self.pending_command & 0x80 != 0
    }

    fn st_hds(&self, drive: usize) -> u8 {
        (self.head[drive] << 2) | drive as u8
    }

    fn is_motor_on(&self, drive: usize) -> bool {
        self.dor & (DOR_MOTEN0 << drive) != 0
    }

    fn media(&self, drive: usize) -> Option<&FloppyDisk> {
        if drive < 2 {
            self.media[drive].as_ref()
        } else {
            None
        }
    }

    fn drive_type(&self, drive: usize) -> FloppyDrive {
        if drive < 2 {
            self.device_type[drive]
        } else {
            FloppyDrive::None
        }
    }

    fn get_drate_for_media(&self, drive: usize) -> u8 {
        use disk::FloppyType::*;
        let media = match self.media(drive) {
            Some(m) => m,
            Option::None => return 2,
        };
        match media.disk_type {
            F160k | F180k | F320k | F360k => 1, // 300 on a HD 5.25" spindle
            F720k => 2,                         // 250
            F1_2 | F1_44 => 0,                  // 500
            F2_88 => 3,                         // 1000
            None => 2,
        }
    }

    // ── Port file ─────────────────────────────────────────────

    pub fn read(&mut self, address: u16, ctx: &mut DevCtx) -> u8 {
        let drive = self.current_drive();
        let mut value: u8 = 0;
        trace!("FDC: read 0x{:04X} [{:02X}]", address, self.pending_command);

        match address {
            0x3F0 => {
                // SRA, Model 30 only
                if self.mode == FdcMode::PcAt {
                    return 0xFF;
                }
                value |= (self.pending_irq as u8) << 7;
                value |= (ctx.dma.get_drq(FLOPPY_DMA_CHAN) as u8) << 6;
                value |= (self.step[drive] as u8) << 5;
                if self.cur_cylinder[drive] == 0 {
                    value |= 1 << 4;
                }
                value |= ((self.head[drive] == 0) as u8) << 3;
                if self.sector[drive] == 0 {
                    value |= 1 << 2;
                }
                if matches!(self.media(drive), Some(m) if m.write_protected) {
                    value |= 1 << 1;
                }
                value |= !self.direction[drive] as u8;
            }
            0x3F1 => {
                // SRB, Model 30 only
                if self.mode == FdcMode::PcAt {
                    return 0xFF;
                }
                value |= ((self.num_installed_floppies <= 1) as u8) << 7;
                value |= ((drive != 1) as u8) << 6;
                value |= ((drive != 0) as u8) << 5;
                value |= (self.wrdata[drive] as u8) << 4;
                value |= (self.rddata[drive] as u8) << 3;
                value |= (self.wrdata[drive] as u8) << 2;
                value |= ((drive != 3) as u8) << 1;
                value |= (drive != 2) as u8;
            }
            0x3F2 => {
                value = self.dor;
            }
            0x3F4 => {
                value = self.main_status_reg;
                if self.pending_command == CMD_INVALID {
                    // NONDMA distinguishes the polled transfer phase
                    // from result-byte reads
                    value &= !MSR_NONDMA;
                }
            }
            0x3F5 => {
                value = self.read_fifo(ctx);
            }
            0x3F7 => {
                // motor must be on to read the DIR of the selection
                let motor = self.dor & (DOR_MOTEN0 << drive) != 0;
                if motor {
                    if self.mode == FdcMode::PcAt {
                        value |= self.dir[drive] & DIR_DSKCHG;
                    } else {
                        value |= (!(self.dir[drive] & DIR_DSKCHG != 0) as u8) << 7;
                        value |= self.dor & DIR_NDMAGATE;
                        value |= (self.noprec as u8) << 2;
                        value |= self.data_rate;
                    }
                    // the STEP latch clears on DIR reads
                    self.step[drive] = false;
                }
            }
            _ => return 0,
        }

        value
    }

    fn read_fifo(&mut self, ctx: &mut DevCtx) -> u8 {
        if (self.main_status_reg & MSR_NONDMA != 0) && self.cmd_code() == CMD_READ {
            // polled sector data
            if self.floppy_buffer_index >= SECTOR_SIZE {
                self.floppy_buffer_index = 0;
            }
            let mut value = [0u8];
            let mut dctx = DmaCtx {
                clock: ctx.clock,
                timers: &mut *ctx.timers,
                pic: &mut *ctx.pic,
                intr: &mut *ctx.intr,
                tc: false,
            };
            self.read_data(&mut value, false, &mut dctx);
            if self.floppy_buffer_index >= SECTOR_SIZE {
                // INT drops when the FIFO empties at the end of a
                // sector; the result phase will raise it again
                self.lower_interrupt(ctx);
            }
            value[0]
        } else if self.result_size == 0 {
            self.main_status_reg &= MSR_NONDMA;
            self.result[0]
        } else {
            let value = self.result[self.result_index];
            self.result_index += 1;
            self.main_status_reg &= 0xF0;
            self.lower_interrupt(ctx);
            if self.result_index >= self.result_size {
                self.enter_idle_phase();
            }
            value
        }
    }

    pub fn write(&mut self, address: u16, value: u8, ctx: &mut DevCtx) {
        trace!("FDC: write 0x{:04X} <- 0x{:02X}", address, value);

        match address {
            0x3F2 => {
                // DOR
                let normal_op = value & DOR_NRESET != 0;
                let prev_normal_op = self.dor & DOR_NRESET != 0;
                let drive_sel = (value & DOR_DRVSEL) as usize;
                self.dor = value;
                if !prev_normal_op && normal_op {
                    // transition out of reset takes 250 µs
                    ctx.activate_timer(self.timer, 250 * USEC);
                } else if prev_normal_op && !normal_op {
                    self.main_status_reg &= MSR_NONDMA;
                    self.pending_command = CMD_RESET;
                }
                if self.drive_type(drive_sel) == FloppyDrive::None {
                    debug!("FDC: non existing drive selected");
                }
            }
            0x3F4 => {
                // DSR
                self.data_rate = value & DSR_DRATE_SEL;
                if value & DSR_SW_RESET != 0 {
                    self.main_status_reg &= MSR_NONDMA;
                    self.pending_command = CMD_RESET;
                    ctx.activate_timer(self.timer, 250 * USEC);
                }
                if value & (DSR_PWR_DOWN | DSR_PRECOMP) != 0 {
                    trace!("FDC: DSR unsupported bits set: 0x{:02X}", value);
                }
            }
            0x3F5 => self.write_fifo(value, ctx),
            0x3F7 => {
                // CCR
                self.data_rate = value & CCR_DRATE_SEL;
                self.noprec = value & CCR_NOPREC != 0;
            }
            _ => {
                debug!("FDC: write to 0x{:04X} ignored", address);
            }
        }
    }

    fn write_fifo(&mut self, value: u8, ctx: &mut DevCtx) {
        if (self.main_status_reg & MSR_NONDMA != 0)
            && (self.cmd_code() == CMD_WRITE || self.cmd_code() == CMD_FORMAT_TRACK)
        {
            // polled data transfer
            let buf = [value];
            let mut dctx = DmaCtx {
                clock: ctx.clock,
                timers: &mut *ctx.timers,
                pic: &mut *ctx.pic,
                intr: &mut *ctx.intr,
                tc: false,
            };
            self.write_data(&buf, false, &mut dctx);
            self.lower_interrupt(ctx);
            return;
        }
        if self.command_complete {
            if self.pending_command != CMD_INVALID {
                // a command is still executing: first-wins, drop this
                debug!(
                    "FDC: new command 0x{:02X} with old one [{:02X}] pending",
                    value, self.pending_command
                );
                return;
            }
            self.command[0] = value;
            self.command_complete = false;
            self.command_index = 1;
            self.main_status_reg &= !MSR_DIO;
            self.main_status_reg |= MSR_RQM | MSR_CMDBUSY;
            let (size, name) = command_size(value & CMD_MASK);
            self.command_size = size;
            trace!("FDC: D1/{} <- 0x{:02X} (cmd: {})", size, value, name);
        } else {
            self.command[self.command_index] = value;
            self.command_index += 1;
        }
        if self.command_index == self.command_size {
            self.enter_execution_phase(ctx);
            self.command_complete = true;
        }
    }

    // ── Execution phase ───────────────────────────────────────

    fn enter_execution_phase(&mut self, ctx: &mut DevCtx) {
        self.main_status_reg &= MSR_NONDMA;
        self.main_status_reg |= MSR_CMDBUSY;
        self.pending_command = self.command[0];
        debug!(
            "FDC COMMAND: {:02X?}",
            &self.command[..self.command_size]
        );

        match self.cmd_code() {
            CMD_READ => self.cmd_read_data(ctx),
            CMD_WRITE => self.cmd_write_data(ctx),
            CMD_VERSION => self.cmd_version(ctx),
            CMD_FORMAT_TRACK => self.cmd_format_track(ctx),
            CMD_RECALIBRATE => self.cmd_recalibrate(ctx),
            CMD_SENSE_INT => self.cmd_sense_int(ctx),
            CMD_SPECIFY => self.cmd_specify(),
            CMD_SENSE_DRIVE => self.cmd_sense_drive(ctx),
            CMD_CONFIGURE => self.cmd_configure(),
            CMD_SEEK => self.cmd_seek(ctx),
            CMD_DUMPREG => self.cmd_dumpreg(ctx),
            CMD_READ_ID => self.cmd_read_id(ctx),
            CMD_PERP_MODE => self.cmd_perp_mode(),
            CMD_LOCK => self.cmd_lock(ctx),
            CMD_READ_DEL | CMD_WRITE_DEL | CMD_READ_TRACK | CMD_VERIFY | CMD_SCAN_EQ
            | CMD_SCAN_LO_EQ | CMD_SCAN_HI_EQ => self.cmd_not_implemented(ctx),
            _ => self.cmd_invalid(ctx),
        }
    }

    fn start_read_write_cmd(&mut self, ctx: &mut DevCtx) -> bool {
        let cmd = if self.cmd_code() == CMD_READ { "read" } else { "write" };
        self.multi_track = self.cmd_mtrk();
        if self.dor & DOR_NDMAGATE == 0 {
            warn!("FDC: {} with INT disabled is untested", cmd);
        }
        let drive = (self.command[1] & 0x03) as usize;
        self.dor = (self.dor & 0xFC) | drive as u8;

        let cylinder = self.command[2];
        let head = self.command[3] & 0x01;
        let sector = self.command[4];
        let sector_size = self.command[5];
        let mut eot = self.command[6];

        debug!(
            "FDC {} data DRV{}, {}C={},H={},S={},N={},EOT={}",
            cmd,
            drive,
            if self.cmd_mtrk() { "MT," } else { "" },
            cylinder,
            head,
            sector,
            sector_size,
            eot
        );

        if !self.is_motor_on(drive) {
            debug!("FDC {}: motor not on", cmd);
            return false; // hang the controller
        }
        if self.drive_type(drive) == FloppyDrive::None {
            debug!("FDC {}: bad drive #{}", cmd, drive);
            return false;
        }
        // real drives reject commands whose HD bit doesn't match the
        // head field
        if head != (self.command[1] >> 2) & 1 {
            debug!("FDC {}: head mismatch between command[1] and head field", cmd);
            self.status_reg0 = ST0_IC_ABNORMAL | self.st_hds(drive);
            self.status_reg1 = ST1_ND;
            self.status_reg2 = 0;
            self.enter_result_phase_dev(ctx);
            return false;
        }
        let (tracks, spt, drate) = match self.media(drive) {
            Some(m) => (m.tracks, m.spt, self.get_drate_for_media(drive)),
            None => {
                // no index pulses, no termination: lock-up
                debug!("FDC {}: media not present", cmd);
                return false;
            }
        };
        if sector_size != 0x02 {
            error!("FDC {}: sector size {} not supported", cmd, 128u32 << sector_size);
            return false;
        }
        if cylinder >= tracks {
            debug!("FDC {}: parameters out of range", cmd);
            return false;
        }
        if eot == 0 {
            eot = spt;
        }
        self.direction[drive] = self.cylinder[drive] > cylinder;
        self.cylinder[drive] = cylinder;
        self.head[drive] = head;
        self.sector[drive] = sector;
        self.eot[drive] = eot;

        if sector > spt || self.data_rate != drate {
            if sector > spt {
                debug!("FDC {}: sector {} past last sector {}", cmd, sector, spt);
            }
            self.status_reg0 = ST0_IC_ABNORMAL | self.st_hds(drive);
            self.status_reg1 = ST1_ND;
            self.status_reg2 = 0;
            self.enter_result_phase_dev(ctx);
            return false;
        }
        if cylinder != self.cur_cylinder[drive] && self.config & CONF_EIS == 0 {
            debug!("FDC {}: cylinder != current cylinder with EIS off", cmd);
            self.status_reg0 = ST0_IC_ABNORMAL | self.st_hds(drive);
            self.status_reg1 = ST1_ND;
            self.status_reg2 = 0;
            self.enter_result_phase_dev(ctx);
            return false;
        }
        true
    }

    fn cmd_read_data(&mut self, ctx: &mut DevCtx) {
        if !self.start_read_write_cmd(ctx) {
            return;
        }
        let drive = (self.command[1] & 0x03) as usize;
        let logical_sector = self.chs_to_lba(drive);
        if logical_sector >= self.media(drive).unwrap().sectors {
            debug!("FDC read data: logical sector out of bounds");
            return;
        }
        self.rddata[drive] = true;
        self.floppy_xfer_read(drive, logical_sector as u64 * 512);
        let sector_time = self.calculate_rw_delay(drive, true, ctx.now_us());
        ctx.activate_timer(self.timer, sector_time as u64 * USEC);
    }

    fn cmd_write_data(&mut self, ctx: &mut DevCtx) {
        if !self.start_read_write_cmd(ctx) {
            return;
        }
        let drive = (self.command[1] & 0x03) as usize;
        self.wrdata[drive] = true;
        if self.main_status_reg & MSR_NONDMA != 0 {
            if self.cur_cylinder[drive] != self.cylinder[drive] {
                // implied seek first
                let sector_time = self.calculate_rw_delay(drive, true, ctx.now_us());
                ctx.activate_timer(self.timer, sector_time as u64 * USEC);
            } else {
                self.main_status_reg |= MSR_RQM;
                self.raise_interrupt_ctx(ctx);
            }
        } else {
            ctx.dma.set_drq(FLOPPY_DMA_CHAN, true);
        }
    }

    fn cmd_version(&mut self, ctx: &mut DevCtx) {
        let drive = (self.command[1] & 0x03) as usize;
        self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
        self.enter_result_phase_dev(ctx);
    }

    fn cmd_format_track(&mut self, ctx: &mut DevCtx) {
        let drive = (self.command[1] & 0x03) as usize;
        self.dor = (self.dor & 0xFC) | drive as u8;
        if !self.is_motor_on(drive) {
            error!("FDC format track: motor not on");
            return;
        }
        self.head[drive] = (self.command[1] >> 2) & 0x01;
        let sector_size = self.command[2];
        self.format_count = self.command[3] as u16;
        self.format_fillbyte = self.command[5];

        debug!(
            "FDC format track DRV{}, N={},SC={},D={:02x}",
            drive, sector_size, self.format_count, self.format_fillbyte
        );

        if self.drive_type(drive) == FloppyDrive::None {
            error!("FDC format track: bad drive #{}", drive);
            return;
        }
        if sector_size != 0x02 {
            error!("FDC format track: sector size {} not supported", 128u32 << sector_size);
            return;
        }
        let (wp, spt) = match self.media(drive) {
            Some(m) => (m.write_protected, m.spt),
            None => {
                debug!("FDC format track: media not present");
                return;
            }
        };
        if wp || self.format_count as u8 != spt {
            if wp {
                debug!("FDC: attempt to format with media write-protected");
            } else {
                error!("FDC: wrong floppy disk type for format");
            }
            self.status_reg0 = ST0_IC_ABNORMAL | self.st_hds(drive);
            self.status_reg1 = ST1_DE | ST1_ND | ST1_NW | ST1_MA;
            self.status_reg2 = ST2_DD | ST2_WC | ST2_MD;
            self.enter_result_phase_dev(ctx);
            return;
        }

        // 4 ID header bytes per sector arrive through the FIFO/DMA
        self.format_count <<= 2;

        if self.main_status_reg & MSR_NONDMA != 0 {
            self.main_status_reg |= MSR_RQM;
            self.raise_interrupt_ctx(ctx);
        } else {
            ctx.dma.set_drq(FLOPPY_DMA_CHAN, true);
        }
    }

    fn cmd_recalibrate(&mut self, ctx: &mut DevCtx) {
        let drive = (self.command[1] & 0x03) as usize;
        self.dor = (self.dor & 0xFC) | drive as u8;
        debug!("FDC recalibrate DRV{} (cur.C={})", drive, self.cur_cylinder[drive]);

        if self.drive_type(drive) != FloppyDrive::None && self.boot_time[drive] == 0 {
            self.boot_time[drive] = ctx.now_ns();
        }

        self.direction[drive] = self.cylinder[drive] > 0;
        self.cylinder[drive] = 0;
        // during the seek portion the controller is non-busy but the
        // drive is
        self.main_status_reg &= MSR_NONDMA;
        self.main_status_reg |= 1 << drive;

        let step_delay = self.calculate_step_delay(drive, self.cur_cylinder[drive], 0);
        trace!("FDC step_delay: {} us", step_delay);
        ctx.activate_timer(self.timer, step_delay as u64 * USEC);
    }

    fn cmd_sense_int(&mut self, ctx: &mut DevCtx) {
        if self.reset_sensei > 0 {
            let drive = 4 - self.reset_sensei;
            self.status_reg0 &= ST0_IC | ST0_SE | ST0_EC;
            self.status_reg0 |= self.st_hds(drive as usize);
            self.reset_sensei -= 1;
        } else if !self.pending_irq {
            self.status_reg0 = ST0_IC_INVALID;
        }
        self.enter_result_phase_dev(ctx);
    }

    fn cmd_specify(&mut self) {
        self.srt = self.command[1] >> 4;
        self.hut = self.command[1] & 0x0F;
        self.hlt = self.command[2] >> 1;
        debug!(
            "FDC specify, SRT={},HUT={},HLT={},ND={}",
            self.srt,
            self.hut,
            self.hlt,
            self.command[2] & 1
        );
        if self.command[2] & 0x01 != 0 {
            self.main_status_reg |= MSR_NONDMA;
        }
        self.enter_idle_phase();
    }

    fn cmd_sense_drive(&mut self, ctx: &mut DevCtx) {
        let drive = (self.command[1] & 0x03) as usize;
        self.head[drive] = (self.command[1] >> 2) & 0x01;
        self.status_reg3 = ST3_BASE | self.st_hds(drive);
        if matches!(self.media(drive), Some(m) if m.write_protected) {
            self.status_reg3 |= ST3_WP;
        }
        if self.drive_type(drive) != FloppyDrive::None && self.cur_cylinder[drive] == 0 {
            self.status_reg3 |= ST3_T0;
        }
        self.enter_result_phase_dev(ctx);
    }

    fn cmd_configure(&mut self) {
        self.config = self.command[2];
        self.pretrk = self.command[3];
        debug!(
            "FDC configure, EIS={},EFIFO={},FIFOTHR={},PRETRK={}",
            (self.config & CONF_EIS) != 0,
            (self.config & CONF_EFIFO) != 0,
            self.config & 0x0F,
            self.pretrk
        );
        self.enter_idle_phase();
    }

    fn cmd_seek(&mut self, ctx: &mut DevCtx) {
        let drive = (self.command[1] & 0x03) as usize;
        let head = (self.command[1] >> 2) & 0x01;
        let cylinder = self.command[2];
        debug!(
            "FDC seek DRV{}, C={} (cur.C={})",
            drive, cylinder, self.cur_cylinder[drive]
        );
        if self.pending_command & 0x80 != 0 {
            // relative seek
            self.cmd_not_implemented(ctx);
            return;
        }
        self.dor = (self.dor & 0xFC) | drive as u8;
        self.direction[drive] = self.cylinder[drive] > cylinder;
        self.cylinder[drive] = cylinder;
        self.head[drive] = head;

        self.main_status_reg &= MSR_NONDMA;
        self.main_status_reg |= 1 << drive;

        let step_delay = self.calculate_step_delay(drive, self.cylinder[drive], cylinder);
        trace!("FDC step_delay: {} us", step_delay);
        ctx.activate_timer(self.timer, step_delay as u64 * USEC);
    }

    fn cmd_dumpreg(&mut self, ctx: &mut DevCtx) {
        let drive = (self.command[1] & 0x03) as usize;
        self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
        self.enter_result_phase_dev(ctx);
    }

    fn cmd_read_id(&mut self, ctx: &mut DevCtx) {
        let drive = (self.command[1] & 0x03) as usize;
        self.head[drive] = (self.command[1] >> 2) & 0x01;
        self.dor = (self.dor & 0xFC) | drive as u8;
        debug!("FDC read ID DRV{}", drive);

        if !self.is_motor_on(drive) {
            debug!("FDC read ID: motor not on");
            return;
        }
        if self.drive_type(drive) == FloppyDrive::None {
            debug!("FDC read ID: bad drive #{}", drive);
            return;
        }
        if self.media(drive).is_none() {
            debug!("FDC read ID: media not present");
            return;
        }
        if self.data_rate != self.get_drate_for_media(drive) {
            self.status_reg0 = ST0_IC_ABNORMAL | self.st_hds(drive);
            self.status_reg1 = ST1_MA;
            self.status_reg2 = 0;
            self.enter_result_phase_dev(ctx);
            return;
        }
        self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
        let sector_time = self.calculate_rw_delay(drive, true, ctx.now_us());
        ctx.activate_timer(self.timer, sector_time as u64 * USEC);
    }

    fn cmd_perp_mode(&mut self) {
        self.perp_mode = self.command[1];
        debug!("FDC perpendicular mode, config=0x{:02X}", self.perp_mode);
        self.enter_idle_phase();
    }

    fn cmd_lock(&mut self, ctx: &mut DevCtx) {
        self.lock = self.pending_command & 0x80 != 0;
        let drive = (self.command[1] & 0x03) as usize;
        self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
        self.enter_result_phase_dev(ctx);
    }

    fn cmd_not_implemented(&mut self, ctx: &mut DevCtx) {
        error!("FDC command 0x{:02X} not implemented", self.pending_command);
        self.status_reg0 = ST0_IC_INVALID;
        self.enter_result_phase_dev(ctx);
    }

    fn cmd_invalid(&mut self, ctx: &mut DevCtx) {
        debug!("FDC INVALID command: 0x{:02X}", self.pending_command);
        self.status_reg0 = ST0_IC_INVALID;
        self.enter_result_phase_dev(ctx);
    }

    // ── Media transfer ────────────────────────────────────────

    fn floppy_xfer_read(&mut self, drive: usize, offset: u64) {
        trace!("FDC xfer DRV{}: offset={}, from floppy", drive, offset);
        if let Some(m) = self.media[drive].as_mut() {
            m.read(offset, &mut self.floppy_buffer);
        }
    }

    fn floppy_xfer_write(&mut self, drive: usize, offset: u64) {
        trace!("FDC xfer DRV{}: offset={}, to floppy", drive, offset);
        if let Some(m) = self.media[drive].as_mut() {
            m.write(offset, &self.floppy_buffer);
        }
    }

    // ── Command timer ─────────────────────────────────────────

    pub fn timer(&mut self, ctx: &mut DevCtx) {
        let drive = self.current_drive();
        match self.cmd_code() {
            CMD_RECALIBRATE => {
                self.status_reg0 = ST0_SE | drive as u8;
                if !self.is_motor_on(drive) {
                    self.status_reg0 |= ST0_IC_ABNORMAL | ST0_EC;
                } else {
                    self.status_reg0 |= ST0_IC_NORMAL;
                }
                self.direction[drive] = false;
                self.main_status_reg &= !(1 << drive);
                self.step_head();
                self.enter_idle_phase();
                self.raise_interrupt_ctx(ctx);
            }
            CMD_SEEK => {
                self.status_reg0 = ST0_IC_NORMAL | ST0_SE | self.st_hds(drive);
                self.main_status_reg &= !(1 << drive);
                self.step_head();
                self.enter_idle_phase();
                self.raise_interrupt_ctx(ctx);
            }
            CMD_READ_ID => {
                self.enter_result_phase_dev(ctx);
            }
            CMD_WRITE => {
                if self.tc {
                    self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
                    self.status_reg1 = 0;
                    self.status_reg2 = 0;
                    debug!(
                        "FDC <<WRITE DONE>> DRV{} C={},H={},S={}",
                        drive, self.cylinder[drive], self.head[drive], self.sector[drive]
                    );
                    self.enter_result_phase_dev(ctx);
                    return;
                }
                if self.main_status_reg & MSR_NONDMA != 0 {
                    if self.main_status_reg & MSR_RQM == 0 {
                        // initial seek completed, request data
                        self.main_status_reg |= MSR_RQM;
                        self.raise_interrupt_ctx(ctx);
                    } else {
                        // FIFO underrun
                        self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
                        self.status_reg1 = ST1_OR;
                        self.status_reg2 = 0;
                        self.enter_result_phase_dev(ctx);
                        return;
                    }
                } else {
                    ctx.dma.set_drq(FLOPPY_DMA_CHAN, true);
                }
                self.step_head();
            }
            CMD_READ => {
                if self.main_status_reg & MSR_NONDMA != 0 {
                    if self.floppy_buffer_index >= SECTOR_SIZE {
                        // host stopped reading the FIFO: auto-TC
                        self.tc = true;
                        self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
                        self.status_reg1 = ST1_OR;
                        self.status_reg2 = 0;
                        self.enter_result_phase_dev(ctx);
                        return;
                    }
                    if self.main_status_reg & MSR_RQM == 0 {
                        // announce data once; host reads until TC
                        self.raise_interrupt_ctx(ctx);
                        self.main_status_reg |= MSR_RQM | MSR_DIO;
                    }
                    let delay = self.calculate_rw_delay(drive, false, ctx.now_us());
                    ctx.activate_timer(self.timer, delay as u64 * USEC);
                } else {
                    self.floppy_buffer_index = 0;
                    ctx.dma.set_drq(FLOPPY_DMA_CHAN, true);
                }
                self.step_head();
            }
            CMD_FORMAT_TRACK => {
                if self.format_count == 0 || self.tc {
                    self.format_count = 0;
                    self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
                    self.enter_result_phase_dev(ctx);
                } else if self.main_status_reg & MSR_NONDMA != 0 {
                    self.main_status_reg |= MSR_RQM;
                    self.raise_interrupt_ctx(ctx);
                } else {
                    ctx.dma.set_drq(FLOPPY_DMA_CHAN, true);
                }
            }
            CMD_RESET => {
                debug!("FDC RESET");
                self.reset(ResetKind::Software, ctx);
                self.pending_command = CMD_INVALID;
                self.status_reg0 = ST0_IC_POLLING;
                self.raise_interrupt_ctx(ctx);
                self.reset_sensei = 4;
            }
            CMD_INVALID => {
                trace!("FDC timer: nothing pending");
            }
            code => {
                error!("FDC timer: unexpected pending command {:02X}", code);
            }
        }
    }

    // ── FIFO data paths ───────────────────────────────────────

    /// Move bytes out of the sector buffer (read command).  Used by
    /// the DMA engine and the polled FIFO path.
    pub fn read_data(&mut self, buffer_to: &mut [u8], dma: bool, ctx: &mut DmaCtx) -> DmaResult {
        let drive = self.current_drive();
        let maxlen = buffer_to.len();
        let mut len = SECTOR_SIZE - self.floppy_buffer_index;
        if len > maxlen {
            len = maxlen;
        }
        buffer_to[..len]
            .copy_from_slice(&self.floppy_buffer[self.floppy_buffer_index..][..len]);
        self.floppy_buffer_index += len;
        self.tc = self.get_tc(ctx.tc) && len == maxlen;

        let mut clear_drq = false;
        if self.floppy_buffer_index >= SECTOR_SIZE || self.tc {
            if self.floppy_buffer_index >= SECTOR_SIZE {
                self.increment_sector();
            }
            if self.tc {
                self.status_reg0 = ST0_IC_NORMAL | self.st_hds(drive);
                self.status_reg1 = 0;
                self.status_reg2 = 0;
                debug!(
                    "FDC <<READ DONE>> TC - DRV{} C={},H={},S={}",
                    drive, self.cylinder[drive], self.head[drive], self.sector[drive]
                );
                clear_drq = dma;
                self.enter_result_phase(ctx);
            } else {
                // stage the next sector
                let lba = self.chs_to_lba(drive) as u64;
                self.floppy_xfer_read(drive, lba * 512);
                clear_drq = dma;
                let sector_time = self.calculate_rw_delay(drive, false, ctx.now_ns() / 1000);
                ctx.activate_timer(self.timer, sector_time as u64 * USEC);
            }
        }
        DmaResult {
            len: len as u16,
            clear_drq,
        }
    }

    /// Accept bytes into the sector buffer (write/format commands).
    pub fn write_data(&mut self, buffer_from: &[u8], dma: bool, ctx: &mut DmaCtx) -> DmaResult {
        let drive = self.current_drive();

        if self.cmd_code() == CMD_FORMAT_TRACK {
            self.format_count -= 1;
            match 3 - (self.format_count & 0x03) {
                0 => {
                    self.cylinder[drive] = buffer_from[0];
                }
                1 => {
                    if buffer_from[0] != self.head[drive] {
                        debug!("FDC format: head number does not match head field");
                    }
                }
                2 => {
                    self.sector[drive] = buffer_from[0];
                }
                3 => {
                    if buffer_from[0] != 2 {
                        debug!("FDC format: sector size {} not supported", 128u32 << buffer_from[0]);
                    }
                    trace!(
                        "formatting cylinder {} head {} sector {}",
                        self.cylinder[drive],
                        self.head[drive],
                        self.sector[drive]
                    );
                    self.floppy_buffer = [self.format_fillbyte; SECTOR_SIZE];
                    let lba = self.chs_to_lba(drive) as u64;
                    self.floppy_xfer_write(drive, lba * 512);
                    if !dma {
                        self.main_status_reg &= !MSR_RQM;
                    }
                    let sector_time = self.calculate_rw_delay(drive, false, ctx.now_ns() / 1000);
                    ctx.activate_timer(self.timer, sector_time as u64 * USEC);
                    return DmaResult { len: 1, clear_drq: dma };
                }
                _ => unreachable!(),
            }
            return DmaResult { len: 1, clear_drq: false };
        }

        let maxlen = buffer_from.len();
        let mut len = SECTOR_SIZE - self.floppy_buffer_index;
        if len > maxlen {
            len = maxlen;
        }
        self.floppy_buffer[self.floppy_buffer_index..][..len]
            .copy_from_slice(&buffer_from[..len]);
        self.floppy_buffer_index += len;
        self.tc = self.get_tc(ctx.tc) && len == maxlen;

        let mut clear_drq = false;
        if self.floppy_buffer_index >= SECTOR_SIZE || self.tc {
            if matches!(self.media(drive), Some(m) if m.write_protected) {
                debug!("FDC: drive {} is write-protected", drive);
                self.status_reg0 = ST0_IC_ABNORMAL | self.st_hds(drive);
                self.status_reg1 = ST1_DE | ST1_ND | ST1_NW | ST1_MA;
                self.status_reg2 = ST2_DD | ST2_WC | ST2_MD;
                self.enter_result_phase(ctx);
                return DmaResult { len: 1, clear_drq: dma };
            }
            let lba = self.chs_to_lba(drive) as u64;
            self.floppy_xfer_write(drive, lba * 512);
            let sector_time = self.calculate_rw_delay(drive, false, ctx.now_ns() / 1000);
            if self.floppy_buffer_index >= SECTOR_SIZE {
                self.increment_sector();
            }
            self.floppy_buffer_index = 0;
            // wait for the data to reach the disk before more DRQ
            clear_drq = dma;
            ctx.activate_timer(self.timer, sector_time as u64 * USEC);
        }
        DmaResult {
            len: len as u16,
            clear_drq,
        }
    }

    /// DMA write transfer: controller → memory (guest reads a sector).
    pub fn dma_write(&mut self, buffer: &mut [u8], ctx: &mut DmaCtx) -> DmaResult {
        trace!("FDC DMA write DRV{}", self.current_drive());
        self.read_data(buffer, true, ctx)
    }

    /// DMA read transfer: memory → controller (guest writes a sector).
    pub fn dma_read(&mut self, buffer: &[u8], ctx: &mut DmaCtx) -> DmaResult {
        trace!("FDC DMA read DRV{}", self.current_drive());
        self.write_data(buffer, true, ctx)
    }

    // ── Interrupts ────────────────────────────────────────────

    fn raise_interrupt(&mut self, ctx: &mut DmaCtx) {
        if (self.dor & DOR_NDMAGATE != 0) && !self.pending_irq {
            trace!("FDC: raising IRQ {}", FLOPPY_IRQ);
            ctx.raise_irq(FLOPPY_IRQ);
            self.pending_irq = true;
        }
        self.reset_sensei = 0;
    }

    fn raise_interrupt_ctx(&mut self, ctx: &mut DevCtx) {
        if (self.dor & DOR_NDMAGATE != 0) && !self.pending_irq {
            trace!("FDC: raising IRQ {}", FLOPPY_IRQ);
            ctx.raise_irq(FLOPPY_IRQ);
            self.pending_irq = true;
        }
        self.reset_sensei = 0;
    }

    fn lower_interrupt(&mut self, ctx: &mut DevCtx) {
        if self.pending_irq {
            ctx.lower_irq(FLOPPY_IRQ);
            self.pending_irq = false;
        }
    }

    // ── Phase transitions ─────────────────────────────────────

    fn enter_result_phase(&mut self, ctx: &mut DmaCtx) {
        let drive = self.current_drive();
        self.result_index = 0;
        self.main_status_reg |= MSR_RQM | MSR_DIO | MSR_CMDBUSY;

        let mut raise_int = false;
        if self.status_reg0 & ST0_IC == ST0_IC_INVALID {
            self.result_size = 1;
            self.result[0] = self.status_reg0;
        } else {
            match self.cmd_code() {
                CMD_SENSE_DRIVE => {
                    self.result_size = 1;
                    self.result[0] = self.status_reg3;
                }
                CMD_SENSE_INT => {
                    self.result_size = 2;
                    self.result[0] = self.status_reg0;
                    self.result[1] = self.cur_cylinder[drive];
                }
                CMD_DUMPREG => {
                    self.result_size = 10;
                    for i in 0..4 {
                        self.result[i] = self.cur_cylinder[i];
                    }
                    self.result[4] = (self.srt << 4) | self.hut;
                    self.result[5] = (self.hlt << 1)
                        | if self.main_status_reg & MSR_NONDMA != 0 { 1 } else { 0 };
                    self.result[6] = self.eot[drive];
                    self.result[7] = ((self.lock as u8) << 7) | (self.perp_mode & 0x7F);
                    self.result[8] = self.config;
                    self.result[9] = self.pretrk;
                }
                CMD_VERSION => {
                    self.result_size = 1;
                    self.result[0] = 0x90;
                }
                CMD_LOCK => {
                    self.result_size = 1;
                    self.result[0] = (self.lock as u8) << 4;
                }
                CMD_READ_ID | CMD_FORMAT_TRACK | CMD_READ | CMD_WRITE => {
                    self.result_size = 7;
                    self.result[0] = self.status_reg0;
                    self.result[1] = self.status_reg1;
                    self.result[2] = self.status_reg2;
                    self.result[3] = self.cylinder[drive];
                    self.result[4] = self.head[drive];
                    self.result[5] = self.sector[drive];
                    self.result[6] = 2; // sector size code
                    raise_int = true;
                }
                code => {
                    error!("FDC: result phase for unexpected command {:02X}", code);
                    self.result_size = 1;
                    self.result[0] = self.status_reg0;
                }
            }
        }

        self.pending_command = CMD_INVALID;
        debug!("FDC RESULT: {:02X?}", &self.result[..self.result_size]);
        if raise_int {
            self.raise_interrupt(ctx);
        }
    }

    fn enter_result_phase_dev(&mut self, ctx: &mut DevCtx) {
        let mut dctx = DmaCtx {
            clock: ctx.clock,
            timers: &mut *ctx.timers,
            pic: &mut *ctx.pic,
            intr: &mut *ctx.intr,
            tc: false,
        };
        self.enter_result_phase(&mut dctx);
    }

    fn enter_idle_phase(&mut self) {
        self.main_status_reg &= MSR_NONDMA | 0x0F;
        self.main_status_reg |= MSR_RQM;
        self.pending_command = CMD_INVALID;
        self.command_complete = true;
        self.command_index = 0;
        self.command_size = 0;
        self.result_size = 0;
        self.floppy_buffer_index = 0;
    }

    // ── Geometry & timing ─────────────────────────────────────

    fn chs_to_lba(&self, drive: usize) -> u32 {
        let m = self.media(drive).expect("no media");
        (self.cylinder[drive] as u32 * m.heads as u32 + self.head[drive] as u32)
            * m.spt as u32
            + (self.sector[drive] as u32 - 1)
    }

    fn calculate_step_delay(&self, drive: usize, c0: u8, c1: u8) -> u32 {
        let one_step_delay = (16 - self.srt as u32) * (500_000 / DRATE_IN_K[self.data_rate as usize]);
        if !self.is_motor_on(drive) {
            return one_step_delay;
        }
        let steps = if c0 == c1 {
            1
        } else {
            (c1 as i32 - c0 as i32).unsigned_abs()
        };
        let settling_time = 15_000;
        one_step_delay * steps + settling_time
    }

    fn calculate_rw_delay(&mut self, drive: usize, latency: bool, now_us: u64) -> u32 {
        let max_latency_us = if self.drive_type(drive) == FloppyDrive::Fdd525Hd {
            60_000_000 / 360
        } else {
            60_000_000 / 300
        };
        let spt = self.media(drive).map_or(18, |m| m.spt) as u32;
        let mut sector_time_us = max_latency_us / spt;

        // head load time after an unload
        let mut hlt = self.hlt as u32;
        if hlt == 0 {
            hlt = 128;
        }
        hlt *= 1_000_000 / DRATE_IN_K[self.data_rate as usize];
        let head = self.head[drive] as usize;
        if self.last_hut[drive][head] < now_us {
            sector_time_us += hlt;
        }

        if latency {
            // average rotational latency is half a revolution; the
            // 2.2 divisor accounts for HLT overlap
            sector_time_us += ((max_latency_us as f64 / 2.2) * self.latency_mult) as u32;
        }

        let mut hut = self.hut as u32;
        if hut == 0 {
            hut = 128;
        }
        hut *= 8_000_000 / DRATE_IN_K[self.data_rate as usize];

        trace!("FDC sector time = {} us", sector_time_us);
        self.last_hut[drive][head] = now_us + sector_time_us as u64 + hut as u64;
        sector_time_us
    }

    fn step_head(&mut self) {
        let drive = self.current_drive();
        if self.is_motor_on(drive) && self.cur_cylinder[drive] != self.cylinder[drive] {
            self.step[drive] = true;
            self.cur_cylinder[drive] = self.cylinder[drive];
            if self.media(drive).is_some() {
                // a step pulse on a selected drive clears DSKCHG
                self.dir[drive] &= !DIR_DSKCHG;
            }
        }
    }

    fn increment_sector(&mut self) {
        let drive = self.current_drive();
        let (spt, tracks) = match self.media(drive) {
            Some(m) => (m.spt, m.tracks),
            None => return,
        };
        self.sector[drive] += 1;
        if self.sector[drive] > self.eot[drive] || self.sector[drive] > spt {
            self.sector[drive] = 1;
            if self.multi_track {
                self.head[drive] += 1;
                if self.head[drive] > 1 {
                    self.head[drive] = 0;
                    self.cylinder[drive] += 1;
                }
            } else {
                self.cylinder[drive] += 1;
            }
            if self.cylinder[drive] >= tracks {
                // one past the last cylinder, not tracks-1
                self.cylinder[drive] = tracks;
                debug!("FDC increment_sector: clamping cylinder to max");
            }
        }
    }

    fn get_tc(&self, dma_tc: bool) -> bool {
        if self.main_status_reg & MSR_NONDMA != 0 {
            // EOT is the last sector to transfer; all head-0 sectors
            // go first, then head 1 when multi-track
            let drive = self.current_drive();
            let heads = self.media(drive).map_or(2, |m| m.heads);
            let mut terminal_count = self.floppy_buffer_index == SECTOR_SIZE
                && self.sector[drive] == self.eot[drive];
            if self.multi_track {
                terminal_count &= self.head[drive] == heads - 1;
            }
            terminal_count
        } else {
            dma_tc
        }
    }

    pub fn is_motor_spinning(&self, drive: usize) -> bool {
        self.media[drive].is_some() && self.is_motor_on(drive)
    }

    /// Media-change latch for the machine status display.
    pub fn take_disk_changed(&mut self, drive: usize) -> bool {
        std::mem::take(&mut self.disk_changed[drive])
    }
}

#[cfg(test)]
mod tests {
    use super::disk::FloppyType;
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

        fn run(&mut self, fdc: &mut FloppyCtrl, until_ns: u64) {
            loop {
                let due = match self.timers.next_due() {
                    Some(d) if d <= until_ns => d,
                    _ => break,
                };
                let now = self.clock.now_ns();
                self.clock.advance(due - now);
                if let Some((_, TimerFn::Fdc)) = self.timers.pop_due(due) {
                    fdc.timer(&mut self.ctx());
                }
            }
            let now = self.clock.now_ns();
            if until_ns > now {
                self.clock.advance(until_ns - now);
            }
        }

        fn run_all(&mut self, fdc: &mut FloppyCtrl) {
            while let Some(due) = self.timers.next_due() {
                self.run(fdc, due);
            }
        }
    }

    fn fdc_with_disk(fx: &mut Fixture) -> (FloppyCtrl, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.img");
        FloppyDisk::create(FloppyType::F1_44, &path).unwrap();
        let disk = FloppyDisk::open(FloppyDrive::Fdd350Hd, FloppyType::F1_44, &path, false).unwrap();
        let mut fdc = FloppyCtrl::install(
            &mut fx.timers,
            [FloppyDrive::Fdd350Hd, FloppyDrive::None],
            1.0,
        );
        fdc.insert_media(0, disk);
        fdc.reset(ResetKind::PowerOn, &mut fx.ctx());
        // motor on, drive 0, 500 kbps for 1.44M media
        fdc.write(0x3F2, DOR_NDMAGATE | DOR_NRESET | DOR_MOTEN0, &mut fx.ctx());
        fdc.write(0x3F7, 0x00, &mut fx.ctx());
        (fdc, dir)
    }

    fn send_command(fx: &mut Fixture, fdc: &mut FloppyCtrl, bytes: &[u8]) {
        for b in bytes {
            fdc.write(0x3F5, *b, &mut fx.ctx());
        }
    }

    fn read_results(fx: &mut Fixture, fdc: &mut FloppyCtrl, n: usize) -> Vec<u8> {
        (0..n).map(|_| fdc.read(0x3F5, &mut fx.ctx())).collect()
    }

    #[test]
    fn recalibrate_then_sense_interrupt() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        send_command(&mut fx, &mut fdc, &[CMD_RECALIBRATE, 0x00]);
        // drive busy during the seek
        assert_eq!(fdc.read(0x3F4, &mut fx.ctx()) & 0x01, 0x01);
        fx.run_all(&mut fdc);
        // SE set, drive 0, normal termination; cylinder 0
        assert!(fdc.pending_irq);
        send_command(&mut fx, &mut fdc, &[CMD_SENSE_INT]);
        let res = read_results(&mut fx, &mut fdc, 2);
        assert_eq!(res[0], ST0_SE);
        assert_eq!(res[1], 0);
    }

    #[test]
    fn recalibrate_completes_after_step_and_settle_time() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        // move to cylinder 5 first
        send_command(&mut fx, &mut fdc, &[CMD_SEEK, 0x00, 5]);
        fx.run_all(&mut fdc);
        assert_eq!(fdc.cur_cylinder[0], 5);
        send_command(&mut fx, &mut fdc, &[CMD_RECALIBRATE, 0x00]);
        // 5 steps at (16-SRT)*1000us for 500kbps + 15ms settle
        let eta = fx.timers.eta_ns(fdc.timer, fx.clock.now_ns()).unwrap();
        assert_eq!(eta, (16 * 1000 * 5 + 15_000) as u64 * USEC);
        fx.run_all(&mut fdc);
        assert_eq!(fdc.cur_cylinder[0], 0);
    }

    #[test]
    fn reset_sequence_posts_polling_irq_and_four_sensei() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        // DOR reset pulse
        fdc.write(0x3F2, DOR_NDMAGATE, &mut fx.ctx());
        fdc.write(0x3F2, DOR_NDMAGATE | DOR_NRESET, &mut fx.ctx());
        fx.run(&mut fdc, fx.clock.now_ns() + 250 * USEC);
        assert!(fdc.pending_irq);
        for i in 0..4 {
            send_command(&mut fx, &mut fdc, &[CMD_SENSE_INT]);
            let res = read_results(&mut fx, &mut fdc, 2);
            assert_eq!(res[0] & ST0_IC, ST0_IC_POLLING, "sensei {}", i);
        }
        // a fifth sense interrupt with no pending IRQ is invalid
        send_command(&mut fx, &mut fdc, &[CMD_SENSE_INT]);
        let res = read_results(&mut fx, &mut fdc, 1);
        assert_eq!(res[0] & ST0_IC, ST0_IC_INVALID);
    }

    #[test]
    fn version_and_dumpreg_result_sizes() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        send_command(&mut fx, &mut fdc, &[CMD_VERSION]);
        assert_eq!(read_results(&mut fx, &mut fdc, 1), vec![0x90]);
        // specify SRT/HUT/HLT then dump
        send_command(&mut fx, &mut fdc, &[CMD_SPECIFY, 0xAF, 0x1E]);
        send_command(&mut fx, &mut fdc, &[CMD_DUMPREG]);
        let res = read_results(&mut fx, &mut fdc, 10);
        assert_eq!(res[4], 0xAF);
        assert_eq!(res[5] & 0xFE, 0x1E & 0xFE);
    }

    #[test]
    fn read_data_via_dma_delivers_sector() {
        let mut fx = Fixture::new();
        let (mut fdc, dir) = fdc_with_disk(&mut fx);
        // pattern sector C0/H0/S1
        {
            let path = dir.path().join("a.img");
            let mut img = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            use std::io::{Seek, SeekFrom, Write};
            img.seek(SeekFrom::Start(0)).unwrap();
            img.write_all(&[0xA5u8; 512]).unwrap();
        }
        // reopen media to see the change
        let path = dir.path().join("a.img");
        let disk = FloppyDisk::open(FloppyDrive::Fdd350Hd, FloppyType::F1_44, &path, false).unwrap();
        fdc.insert_media(0, disk);

        // READ: MT off, drive 0, C0 H0 S1, N=2, EOT=1
        send_command(
            &mut fx,
            &mut fdc,
            &[CMD_READ, 0x00, 0, 0, 1, 2, 1, 0x1B, 0xFF],
        );
        // rotational + head load delay, then DRQ
        fx.run_all(&mut fdc);
        assert!(fx.dma.get_drq(FLOPPY_DMA_CHAN));

        // burst the full sector as the DMA engine would, TC at end
        let mut buf = [0u8; 512];
        let mut dctx = DmaCtx {
            clock: &fx.clock,
            timers: &mut fx.timers,
            pic: &mut fx.pic,
            intr: &mut fx.intr,
            tc: true,
        };
        let res = fdc.dma_write(&mut buf, &mut dctx);
        assert_eq!(res.len, 512);
        assert!(res.clear_drq);
        assert_eq!(buf, [0xA5; 512]);

        // controller entered the result phase with 7 bytes; the
        // reported CHS is the post-increment position
        let res = read_results(&mut fx, &mut fdc, 7);
        assert_eq!(res[0] & ST0_IC, ST0_IC_NORMAL);
        assert_eq!(res[3], 1); // cylinder after EOT wrap
        assert_eq!(res[5], 1); // sector
        assert_eq!(res[6], 2); // sector size code
        // back to idle
        assert_eq!(fdc.read(0x3F4, &mut fx.ctx()) & MSR_RQM, MSR_RQM);
    }

    #[test]
    fn write_data_via_dma_persists_to_image() {
        let mut fx = Fixture::new();
        let (mut fdc, dir) = fdc_with_disk(&mut fx);
        send_command(
            &mut fx,
            &mut fdc,
            &[CMD_WRITE, 0x00, 0, 0, 2, 2, 2, 0x1B, 0xFF],
        );
        // write asserts DRQ immediately
        assert!(fx.dma.get_drq(FLOPPY_DMA_CHAN));
        let buf = [0x5Au8; 512];
        let mut dctx = DmaCtx {
            clock: &fx.clock,
            timers: &mut fx.timers,
            pic: &mut fx.pic,
            intr: &mut fx.intr,
            tc: true,
        };
        let res = fdc.dma_read(&buf, &mut dctx);
        assert_eq!(res.len, 512);
        // the sector write completes on the next timer tick
        fx.run_all(&mut fdc);
        let res = read_results(&mut fx, &mut fdc, 7);
        assert_eq!(res[0] & ST0_IC, ST0_IC_NORMAL);

        let img = std::fs::read(dir.path().join("a.img")).unwrap();
        assert_eq!(&img[512..1024], &[0x5A; 512][..]);
    }

    #[test]
    fn read_past_last_sector_aborts_with_nd() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        // sector 19 on an 18-sector track
        send_command(
            &mut fx,
            &mut fdc,
            &[CMD_READ, 0x00, 0, 0, 19, 2, 19, 0x1B, 0xFF],
        );
        let res = read_results(&mut fx, &mut fdc, 7);
        assert_eq!(res[0] & ST0_IC, ST0_IC_ABNORMAL);
        assert_eq!(res[1] & ST1_ND, ST1_ND);
    }

    #[test]
    fn data_rate_mismatch_aborts_read_id() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        fdc.write(0x3F7, 0x02, &mut fx.ctx()); // 250 kbps, media wants 500
        send_command(&mut fx, &mut fdc, &[CMD_READ_ID, 0x00]);
        let res = read_results(&mut fx, &mut fdc, 7);
        assert_eq!(res[0] & ST0_IC, ST0_IC_ABNORMAL);
        assert_eq!(res[1] & ST1_MA, ST1_MA);
    }

    #[test]
    fn write_protected_media_aborts_with_nw() {
        let mut fx = Fixture::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.img");
        FloppyDisk::create(FloppyType::F1_44, &path).unwrap();
        let disk = FloppyDisk::open(FloppyDrive::Fdd350Hd, FloppyType::F1_44, &path, true).unwrap();
        let mut fdc = FloppyCtrl::install(
            &mut fx.timers,
            [FloppyDrive::Fdd350Hd, FloppyDrive::None],
            1.0,
        );
        fdc.insert_media(0, disk);
        fdc.reset(ResetKind::PowerOn, &mut fx.ctx());
        fdc.write(0x3F2, DOR_NDMAGATE | DOR_NRESET | DOR_MOTEN0, &mut fx.ctx());
        fdc.write(0x3F7, 0x00, &mut fx.ctx());

        send_command(
            &mut fx,
            &mut fdc,
            &[CMD_WRITE, 0x00, 0, 0, 1, 2, 1, 0x1B, 0xFF],
        );
        let buf = [0u8; 512];
        let mut dctx = DmaCtx {
            clock: &fx.clock,
            timers: &mut fx.timers,
            pic: &mut fx.pic,
            intr: &mut fx.intr,
            tc: true,
        };
        fdc.dma_read(&buf, &mut dctx);
        let res = read_results(&mut fx, &mut fdc, 7);
        assert_eq!(res[0] & ST0_IC, ST0_IC_ABNORMAL);
        assert_eq!(res[1] & ST1_NW, ST1_NW);
    }

    #[test]
    fn invalid_opcode_returns_single_st0_80() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        send_command(&mut fx, &mut fdc, &[0x18]);
        let res = read_results(&mut fx, &mut fdc, 1);
        assert_eq!(res[0], ST0_IC_INVALID);
    }

    #[test]
    fn new_command_while_pending_is_dropped() {
        let mut fx = Fixture::new();
        let (mut fdc, _dir) = fdc_with_disk(&mut fx);
        send_command(&mut fx, &mut fdc, &[CMD_SEEK, 0x00, 3]);
        // seek in progress: a fresh command byte must be ignored
        fdc.write(0x3F5, CMD_VERSION, &mut fx.ctx());
        fx.run_all(&mut fdc);
        assert_eq!(fdc.cur_cylinder[0], 3);
        // sense interrupt works, proving the FSM wasn't corrupted
        send_command(&mut fx, &mut fdc, &[CMD_SENSE_INT]);
        let res = read_results(&mut fx, &mut fdc, 2);
        assert_eq!(res[1], 3);
    }
}

// ── Save state ────────────────────────────────────────────────

use crate::error::SaveStateError;
use crate::savestate::{LumpWriter, StateBuf};

impl FloppyCtrl {
    pub fn save_state(&self, state: &mut StateBuf) {
        let mut w = LumpWriter::new();
        w.put_u8(self.dor);
        w.put_u8(self.main_status_reg);
        w.put_u8(self.data_rate);
        w.put_bool(self.noprec);
        w.put_bytes(&self.dir);
        w.put_bytes(&self.command);
        w.put_u64(self.command_index as u64);
        w.put_u64(self.command_size as u64);
        w.put_bool(self.command_complete);
        w.put_u8(self.pending_command);
        w.put_bool(self.multi_track);
        w.put_bytes(&self.result);
        w.put_u64(self.result_index as u64);
        w.put_u64(self.result_size as u64);
        w.put_u8(self.status_reg0);
        w.put_u8(self.status_reg1);
        w.put_u8(self.status_reg2);
        w.put_u8(self.status_reg3);
        w.put_bytes(&self.cylinder);
        w.put_bytes(&self.head);
        w.put_bytes(&self.sector);
        w.put_bytes(&self.eot);
        w.put_bytes(&self.cur_cylinder);
        for d in 0..4 {
            w.put_bool(self.direction[d]);
            w.put_bool(self.step[d]);
            w.put_bool(self.wrdata[d]);
            w.put_bool(self.rddata[d]);
            w.put_u64(self.last_hut[d][0]);
            w.put_u64(self.last_hut[d][1]);
            w.put_u64(self.boot_time[d]);
        }
        w.put_bool(self.pending_irq);
        w.put_u8(self.reset_sensei);
        w.put_u8(self.srt);
        w.put_u8(self.hut);
        w.put_u8(self.hlt);
        w.put_u8(self.config);
        w.put_u8(self.pretrk);
        w.put_u8(self.perp_mode);
        w.put_bool(self.lock);
        w.put_bytes(&self.floppy_buffer);
        w.put_u64(self.floppy_buffer_index as u64);
        w.put_u16(self.format_count);
        w.put_u8(self.format_fillbyte);
        w.put_bool(self.tc);
        state.write_lump("fdc", w.finish());
    }

    pub fn restore_state(&mut self, state: &mut StateBuf) -> Result<(), SaveStateError> {
        let mut r = state.read_lump("fdc")?;
        self.dor = r.get_u8()?;
        self.main_status_reg = r.get_u8()?;
        self.data_rate = r.get_u8()?;
        self.noprec = r.get_bool()?;
        self.dir.copy_from_slice(&r.get_bytes(4)?);
        self.command.copy_from_slice(&r.get_bytes(10)?);
        self.command_index = r.get_u64()? as usize;
        self.command_size = r.get_u64()? as usize;
        self.command_complete = r.get_bool()?;
        self.pending_command = r.get_u8()?;
        self.multi_track = r.get_bool()?;
        self.result.copy_from_slice(&r.get_bytes(10)?);
        self.result_index = r.get_u64()? as usize;
        self.result_size = r.get_u64()? as usize;
        self.status_reg0 = r.get_u8()?;
        self.status_reg1 = r.get_u8()?;
        self.status_reg2 = r.get_u8()?;
        self.status_reg3 = r.get_u8()?;
        self.cylinder.copy_from_slice(&r.get_bytes(4)?);
        self.head.copy_from_slice(&r.get_bytes(4)?);
        self.sector.copy_from_slice(&r.get_bytes(4)?);
        self.eot.copy_from_slice(&r.get_bytes(4)?);
        self.cur_cylinder.copy_from_slice(&r.get_bytes(4)?);
        for d in 0..4 {
            self.direction[d] = r.get_bool()?;
            self.step[d] = r.get_bool()?;
            self.wrdata[d] = r.get_bool()?;
            self.rddata[d] = r.get_bool()?;
            self.last_hut[d][0] = r.get_u64()?;
            self.last_hut[d][1] = r.get_u64()?;
            self.boot_time[d] = r.get_u64()?;
        }
        self.pending_irq = r.get_bool()?;
        self.reset_sensei = r.get_u8()?;
        self.srt = r.get_u8()?;
        self.hut = r.get_u8()?;
        self.hlt = r.get_u8()?;
        self.config = r.get_u8()?;
        self.pretrk = r.get_u8()?;
        self.perp_mode = r.get_u8()?;
        self.lock = r.get_bool()?;
        self.floppy_buffer.copy_from_slice(&r.get_bytes(SECTOR_SIZE)?);
        self.floppy_buffer_index = r.get_u64()? as usize;
        self.format_count = r.get_u16()?;
        self.format_fillbyte = r.get_u8()?;
        self.tc = r.get_bool()?;
        r.expect_end()
    }
}
