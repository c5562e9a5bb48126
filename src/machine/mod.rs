//! The machine: shared services plus the wiring that owns every chip.

pub mod bus;
pub mod clock;
pub mod dma;
pub mod timers;

use crate::devices::pic::Pic;
use clock::Clock;
use dma::Dma;
use timers::{TimerId, TimerWheel};

/// Shared bus services handed to a device while one of its port
/// handlers or timer callbacks runs.  Split borrows of the machine:
/// the device itself is never inside, so no aliasing.
pub struct DevCtx<'a> {
    pub clock: &'a Clock,
    pub timers: &'a mut TimerWheel,
    pub pic: &'a mut Pic,
    pub intr: &'a mut IntrLine,
    pub dma: &'a mut Dma,
}

impl DevCtx<'_> {
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn now_us(&self) -> u64 {
        self.clock.now_us()
    }

    pub fn raise_irq(&mut self, irq: usize) {
        self.pic.raise_irq(irq, self.intr);
    }

    pub fn lower_irq(&mut self, irq: usize) {
        self.pic.lower_irq(irq);
    }

    pub fn activate_timer(&mut self, id: TimerId, delta_ns: u64) {
        self.timers.activate(id, self.clock.now_ns(), delta_ns);
    }

    pub fn activate_timer_periodic(&mut self, id: TimerId, delta_ns: u64, period_ns: u64) {
        self.timers
            .activate_periodic(id, self.clock.now_ns(), delta_ns, period_ns);
    }

    pub fn deactivate_timer(&mut self, id: TimerId) {
        self.timers.deactivate(id);
    }
}

/// Reduced context for DMA burst callbacks: the DMA engine itself is
/// busy driving the transfer, so only its TC line is visible.
pub struct DmaCtx<'a> {
    pub clock: &'a Clock,
    pub timers: &'a mut TimerWheel,
    pub pic: &'a mut Pic,
    pub intr: &'a mut IntrLine,
    /// Terminal count reached at the end of the burst being serviced.
    pub tc: bool,
}

impl DmaCtx<'_> {
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn raise_irq(&mut self, irq: usize) {
        self.pic.raise_irq(irq, self.intr);
    }

    pub fn activate_timer(&mut self, id: TimerId, delta_ns: u64) {
        self.timers.activate(id, self.clock.now_ns(), delta_ns);
    }

    pub fn deactivate_timer(&mut self, id: TimerId) {
        self.timers.deactivate(id);
    }
}

/// What kind of reset is being delivered to the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    PowerOn,
    /// Hardware reset line (keeps some programmed parameters).
    Hardware,
    /// Device-initiated soft reset (e.g. FDC DOR/DSR, ATA SRST).
    Software,
}

/// INTR pin between the PIC pair and the CPU.
#[derive(Debug, Default)]
pub struct IntrLine {
    raised: bool,
}

impl IntrLine {
    pub fn raise(&mut self) {
        self.raised = true;
    }

    pub fn clear(&mut self) {
        self.raised = false;
    }

    pub fn is_raised(&self) -> bool {
        self.raised
    }
}

// ── Guest memory ──────────────────────────────────────────────

/// Flat RAM as seen by the DMA engine.  The CPU side owns the real
/// memory map; this is the slice the ISA bus masters can reach.
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_byte(&self, addr: u32) -> u8 {
        self.data.get(addr as usize).copied().unwrap_or(0xFF)
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) {
        if let Some(b) = self.data.get_mut(addr as usize) {
            *b = value;
        }
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.read_byte(addr + i as u32);
        }
    }

    pub fn write(&mut self, addr: u32, buf: &[u8]) {
        for (i, b) in buf.iter().enumerate() {
            self.write_byte(addr + i as u32, *b);
        }
    }
}

// ── The machine ───────────────────────────────────────────────

use log::{info, warn};

use crate::audio::{Mixer, MixerSources};
use crate::config::MachineConfig;
use crate::devices::ata::{self, StorageCtrlAta};
use crate::devices::floppy::{self, FloppyCtrl};
use crate::devices::pic::PIC_PORTS;
use crate::devices::pit::{Pit, PIT_PORTS};
use crate::devices::sblaster::SBlaster;
use crate::devices::speaker::PcSpeaker;
use crate::devices::uart::{Serial, SerialMouseHandle};
use crate::devices::{DeviceId, DmaDevice};
use crate::error::ConfigError;
use crate::savestate::StateBuf;
use bus::{IoBus, PORT_16BIT, PORT_32BIT};
use dma::XferDir;
use timers::TimerFn;

macro_rules! devctx {
    ($m:expr) => {
        DevCtx {
            clock: &$m.clock,
            timers: &mut $m.timers,
            pic: &mut $m.pic,
            intr: &mut $m.intr,
            dma: &mut $m.dma,
        }
    };
}

macro_rules! dmactx {
    ($m:expr, $tc:expr) => {
        DmaCtx {
            clock: &$m.clock,
            timers: &mut $m.timers,
            pic: &mut $m.pic,
            intr: &mut $m.intr,
            tc: $tc,
        }
    };
}

pub struct Machine {
    pub clock: Clock,
    pub timers: TimerWheel,
    pub bus: IoBus,
    pub dma: Dma,
    pub pic: Pic,
    pub intr: IntrLine,
    pub memory: Memory,
    /// Line number → owning device, for the logs and status display.
    irq_names: [&'static str; 16],

    pub pit: Pit,
    pub serial: Serial,
    pub fdc: FloppyCtrl,
    pub ata: StorageCtrlAta,
    pub sblaster: SBlaster,

    mixer: Option<Mixer>,
}

impl Machine {
    /// Assemble the device subsystem from a configuration.  Port or
    /// resource conflicts abort the build.
    pub fn new(config: &MachineConfig) -> Result<Self, ConfigError> {
        let mut timers = TimerWheel::new();
        let mut bus = IoBus::new();
        let mut dma = Dma::new();

        // PIT + speaker
        let (speaker, speaker_rx) = PcSpeaker::new();
        let pit = Pit::install(&mut timers, Some(speaker));
        bus.register(DeviceId::Pit, PIT_PORTS)?;

        // PIC
        let pic = Pic::new();
        bus.register(DeviceId::Pic, PIC_PORTS)?;

        // DMA register file
        bus.register(DeviceId::Dma, dma::DMA_PORTS)?;

        // serial ports
        let backends = config.serial_backends()?;
        let mut serial = Serial::install(&mut timers, backends, config.serial_tx_delay_ms);
        for (p, com) in config.serial_com_bindings().iter().enumerate() {
            if let Some(com) = com {
                serial.install_com(&mut bus, p, *com)?;
            }
        }
        serial.set_enabled(true);

        // floppy
        let mut fdc = FloppyCtrl::install(&mut timers, config.floppy_drives()?, config.fdd_latency);
        for (drive, disk) in config.floppy_media()?.into_iter().enumerate() {
            if let Some(disk) = disk {
                fdc.insert_media(drive, disk);
            }
        }
        bus.register(DeviceId::Fdc, floppy::FDC_PORTS)?;
        dma.register_8bit_channel(floppy::FLOPPY_DMA_CHAN, DmaDevice::Fdc);

        // ATA channels
        let ata = StorageCtrlAta::install(&mut timers, config.ata_devices()?);
        bus.register(DeviceId::Ata(0), ata::ATA_PORTS[0])?;
        bus.register(DeviceId::Ata(1), ata::ATA_PORTS[1])?;

        // sound blaster
        let (sblaster, fm_rx) = SBlaster::install(
            &mut timers,
            config.sblaster_iobase,
            config.sblaster_irq,
            config.sblaster_dma,
        );
        bus.register(DeviceId::SBlaster, &sblaster.port_ranges())?;
        dma.register_8bit_channel(sblaster.dma_channel(), DmaDevice::SBlaster);

        let mixer = if config.mixer_enabled {
            Some(Mixer::spawn(MixerSources {
                dac: sblaster.dac_handle(),
                speaker: speaker_rx,
                fm: fm_rx,
            }))
        } else {
            None
        };

        let mut irq_names = [""; 16];
        irq_names[0] = "pit";
        irq_names[2] = "cascade";
        irq_names[3] = "serial";
        irq_names[4] = "serial";
        irq_names[6] = "fdc";
        irq_names[config.sblaster_irq] = "sblaster";
        irq_names[14] = "ata0";
        irq_names[15] = "ata1";

        let mut machine = Self {
            clock: Clock::new(),
            timers,
            bus,
            dma,
            pic,
            intr: IntrLine::default(),
            memory: Memory::new(config.ram_kb as usize * 1024),
            irq_names,
            pit,
            serial,
            fdc,
            ata,
            sblaster,
            mixer,
        };
        machine.reset(ResetKind::PowerOn);
        info!("machine assembled: {} KiB RAM", config.ram_kb);
        Ok(machine)
    }

    pub fn irq_name(&self, line: usize) -> &'static str {
        self.irq_names[line & 0x0F]
    }

    pub fn mouse_handle(&self) -> SerialMouseHandle {
        self.serial.mouse_handle()
    }

    pub fn reset(&mut self, kind: ResetKind) {
        if kind == ResetKind::PowerOn {
            self.clock.reset();
        }
        self.pic.reset();
        self.dma.reset();
        self.intr.clear();
        self.pit.reset(&mut self.timers);
        self.serial.reset();
        self.fdc.reset(kind, &mut devctx!(self));
        self.ata.power_on_reset(&mut devctx!(self));
        self.sblaster.reset(&mut devctx!(self));
    }

    pub fn power_off(&mut self) {
        self.fdc.power_off();
        self.mixer.take();
    }

    // ── CPU-facing interface ──────────────────────────────────

    pub fn intr(&self) -> bool {
        self.intr.is_raised()
    }

    /// Interrupt-acknowledge cycle.
    pub fn iac(&mut self) -> u8 {
        self.pic.iac(&mut self.intr)
    }

    pub fn io_read(&mut self, port: u16, width: u8) -> u32 {
        let entry = match self.bus.read_handler(port) {
            Some(e) => e,
            None => return IoBus::open_bus_read(port, width),
        };
        // decompose wide accesses the handler doesn't take natively
        if width == 2 && entry.mask & PORT_16BIT == 0 {
            let lo = self.io_read(port, 1);
            let hi = self.io_read(port.wrapping_add(1), 1);
            return lo | hi << 8;
        }
        if width == 4 && entry.mask & PORT_32BIT == 0 {
            let lo = self.io_read(port, 2);
            let hi = self.io_read(port.wrapping_add(2), 2);
            return lo | hi << 16;
        }
        match entry.device {
            DeviceId::Dma => self.dma.read(port) as u32,
            DeviceId::Pic => self.pic.read(port, width, &mut self.intr) as u32,
            DeviceId::Pit => self.pit.read(port, &mut devctx!(self)) as u32,
            DeviceId::Serial => self.serial.read(port, &mut devctx!(self)) as u32,
            DeviceId::Fdc => self.fdc.read(port, &mut devctx!(self)) as u32,
            DeviceId::Ata(_) => self.ata.read(port, width, &mut devctx!(self)),
            DeviceId::SBlaster => self.sblaster.read(port, &mut devctx!(self)) as u32,
        }
    }

    pub fn io_write(&mut self, port: u16, width: u8, value: u32) {
        let entry = match self.bus.write_handler(port) {
            Some(e) => e,
            None => {
                IoBus::open_bus_write(port, width, value);
                return;
            }
        };
        if width == 2 && entry.mask & PORT_16BIT == 0 {
            self.io_write(port, 1, value & 0xFF);
            self.io_write(port.wrapping_add(1), 1, value >> 8 & 0xFF);
            return;
        }
        if width == 4 && entry.mask & PORT_32BIT == 0 {
            self.io_write(port, 2, value & 0xFFFF);
            self.io_write(port.wrapping_add(2), 2, value >> 16);
            return;
        }
        match entry.device {
            DeviceId::Dma => self.dma.write(port, value as u8),
            DeviceId::Pic => self.pic.write(port, value as u8, &mut self.intr),
            DeviceId::Pit => self.pit.write(port, value as u8, &mut devctx!(self)),
            DeviceId::Serial => self.serial.write(port, value as u8, &mut devctx!(self)),
            DeviceId::Fdc => self.fdc.write(port, value as u8, &mut devctx!(self)),
            DeviceId::Ata(_) => self.ata.write(port, value, width, &mut devctx!(self)),
            DeviceId::SBlaster => self.sblaster.write(port, value as u8, &mut devctx!(self)),
        }
        self.service_dma();
    }

    // ── Virtual-time loop ─────────────────────────────────────

    /// Advance virtual time, stopping at every timer deadline so
    /// callbacks fire at their exact due time, then service DMA.
    pub fn run_for(&mut self, span_ns: u64) {
        let target = self.clock.now_ns() + span_ns;
        loop {
            let due = match self.timers.next_due() {
                Some(d) if d <= target => d,
                _ => break,
            };
            let now = self.clock.now_ns();
            if due > now {
                self.clock.advance(due - now);
            }
            while let Some((_, tag)) = self.timers.pop_due(self.clock.now_ns()) {
                self.fire_timer(tag);
            }
            self.service_dma();
        }
        let now = self.clock.now_ns();
        if target > now {
            self.clock.advance(target - now);
        }
    }

    fn fire_timer(&mut self, tag: TimerFn) {
        match tag {
            TimerFn::Pit => self.pit.handle_systimer(&mut devctx!(self)),
            TimerFn::UartTx(p) => self.serial.tx_timer(p, &mut devctx!(self)),
            TimerFn::UartRx(p) => self.serial.rx_timer(p, &mut devctx!(self)),
            TimerFn::UartFifo(p) => self.serial.fifo_timer(p, &mut devctx!(self)),
            TimerFn::Fdc => self.fdc.timer(&mut devctx!(self)),
            TimerFn::AtaCmd(ch, dev) => self.ata.command_timer(ch, dev, &mut devctx!(self)),
            TimerFn::Dsp => self.sblaster.dsp_timer(&mut devctx!(self)),
            TimerFn::SbDma => self.sblaster.dma_timer(true, &mut devctx!(self)),
            TimerFn::Dac => self.sblaster.dac_timer(&mut devctx!(self)),
        }
    }

    /// One DMA bus-hold: service pending DRQs until the lines drop.
    fn service_dma(&mut self) {
        let mut guard = 0;
        while let Some(chan) = self.dma.pending_channel() {
            guard += 1;
            if guard > 256 {
                warn!("DMA: service loop runaway, breaking hold");
                break;
            }
            self.dma.set_hlda(true);
            let owner = self.dma.owner(chan);
            let (addr, units, dir) = self.dma.burst_window(chan);
            match owner {
                DmaDevice::None => {
                    // unowned channel: nothing will ever answer DACK
                    self.dma.set_drq(chan, false);
                }
                DmaDevice::Fdc => match dir {
                    XferDir::ToMemory => {
                        let mut buf = vec![0u8; units.min(512)];
                        self.dma.begin_burst(chan, buf.len());
                        let tc = self.dma.get_tc();
                        let res = self.fdc.dma_write(&mut buf, &mut dmactx!(self, tc));
                        self.memory.write(addr, &buf[..res.len as usize]);
                        if res.clear_drq {
                            self.dma.set_drq(chan, false);
                        }
                        self.dma.advance(chan, res.len as usize);
                    }
                    XferDir::FromMemory => {
                        let mut buf = vec![0u8; units.min(512)];
                        self.memory.read(addr, &mut buf);
                        self.dma.begin_burst(chan, buf.len());
                        let tc = self.dma.get_tc();
                        let res = self.fdc.dma_read(&buf, &mut dmactx!(self, tc));
                        if res.clear_drq {
                            self.dma.set_drq(chan, false);
                        }
                        self.dma.advance(chan, res.len as usize);
                    }
                    XferDir::Verify => {
                        self.dma.set_drq(chan, false);
                        self.dma.advance(chan, units);
                    }
                },
                DmaDevice::SBlaster => match dir {
                    XferDir::FromMemory => {
                        // the DAC consumes one frame per DACK
                        let n = units.min(2);
                        let mut buf = vec![0u8; n];
                        self.memory.read(addr, &mut buf);
                        self.dma.begin_burst(chan, n);
                        let tc = self.dma.get_tc();
                        let res = self.sblaster.dma_read(&buf, &mut dmactx!(self, tc));
                        if res.clear_drq {
                            self.dma.set_drq(chan, false);
                        }
                        self.dma.advance(chan, res.len as usize);
                    }
                    XferDir::ToMemory => {
                        let mut buf = vec![0u8; units.min(64)];
                        self.dma.begin_burst(chan, buf.len());
                        let tc = self.dma.get_tc();
                        let res = self.sblaster.dma_write(&mut buf, &mut dmactx!(self, tc));
                        self.memory.write(addr, &buf[..res.len as usize]);
                        if res.clear_drq {
                            self.dma.set_drq(chan, false);
                        }
                        self.dma.advance(chan, res.len as usize);
                    }
                    XferDir::Verify => {
                        self.dma.set_drq(chan, false);
                        self.dma.advance(chan, units);
                    }
                },
            }
        }
        self.dma.set_hlda(false);
    }

    // ── Persistence ───────────────────────────────────────────

    pub fn save_state(&self) -> StateBuf {
        let mut state = StateBuf::new();
        let mut w = crate::savestate::LumpWriter::new();
        w.put_u64(self.clock.now_ns());
        w.put_bool(self.intr.is_raised());
        state.write_lump("machine", w.finish());
        self.pic.save_state(&mut state);
        self.pit.save_state(&mut state);
        self.dma.save_state(&mut state);
        self.serial.save_state(&mut state);
        self.fdc.save_state(&mut state);
        self.ata.save_state(&mut state);
        self.sblaster.save_state(&mut state);
        state
    }

    /// Restore device state.  Timers and host-side resources re-arm
    /// lazily on the next guest access, as after a power-on.
    pub fn restore_state(&mut self, state: &mut StateBuf) -> Result<(), crate::error::SaveStateError> {
        state.rewind();
        let mut r = state.read_lump("machine")?;
        let now = r.get_u64()?;
        let raised = r.get_bool()?;
        self.clock.reset();
        self.clock.advance(now);
        if raised {
            self.intr.raise();
        } else {
            self.intr.clear();
        }
        self.pic.restore_state(state)?;
        self.pit.restore_state(state)?;
        self.dma.restore_state(state)?;
        self.serial.restore_state(state)?;
        self.fdc.restore_state(state)?;
        self.ata.restore_state(state)?;
        self.sblaster.restore_state(state)?;
        Ok(())
    }

    /// One status line per device, for the headless harness.
    pub fn status_report(&mut self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "t={} ns  INTR={}\n",
            self.clock.now_ns(),
            self.intr.is_raised() as u8
        ));
        out.push_str(&format!(
            "PIC  IRR={:04X} IMR={:04X} ISR={:04X}\n",
            self.pic.get_irr(),
            self.pic.get_imr(),
            self.pic.get_isr()
        ));
        out.push_str(&format!(
            "PIT  ticks={} OUT0={} OUT2={}\n",
            self.pit.pit_ticks(),
            self.pit.out(0) as u8,
            self.pit.out(2) as u8
        ));
        out.push_str(&format!(
            "FDC  motorA={} motorB={}\n",
            self.fdc.is_motor_spinning(0) as u8,
            self.fdc.is_motor_spinning(1) as u8
        ));
        out.push_str(&format!("ATA  busy={}\n", self.ata.is_busy() as u8));
        if let Some(mixer) = &self.mixer {
            out.push_str(&format!("MIX  frames={}\n", mixer.buffered_frames()));
        }
        out
    }
}
