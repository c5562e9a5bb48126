//! 16550A UART bank (up to four COM ports).
//!
//! Each host-side port owns a guest-visible UART and a [`HostPort`]
//! backend.  COM numbers bind dynamically: the register file installs
//! its 8-port range when a COM is assigned and releases it on rebind,
//! so the guest can shuffle COM assignments at runtime.
//!
//! All transmission and reception is paced by TX/RX timers re-armed at
//! `databyte_usec`, the wire time of one framed byte at the current
//! divisor and line settings.

pub mod backend;
pub mod modem;
pub mod mouse;
pub mod network;

use std::sync::{Arc, Mutex};

use log::{debug, error, trace, warn};

use crate::machine::bus::{IoBus, PortRange, PORT_8BIT, PORT_RW};
use crate::machine::clock::USEC;
use crate::machine::timers::{TimerFn, TimerId, TimerWheel};
use crate::machine::DevCtx;

use backend::HostPort;
use mouse::{MouseState, MouseType, MOUSE_BUFF_SIZE};

pub const SER_PORTS: usize = 4;

/// UART crystal: 115200 = 1.8432 MHz / 16.
const PC_CLOCK_XTL: u32 = 1_843_200;

// register offsets
const SER_THR: u16 = 0; // RBR on read
const SER_IER: u16 = 1;
const SER_IIR: u16 = 2; // FCR on write
const SER_LCR: u16 = 3;
const SER_MCR: u16 = 4;
const SER_LSR: u16 = 5;
const SER_MSR: u16 = 6;
const SER_SCR: u16 = 7;

const COM_BASES: [u16; 4] = [0x3F8, 0x2F8, 0x3E8, 0x2E8];
const COM_IRQS: [usize; 4] = [4, 3, 4, 3];

pub const SERIAL_PORTS_COM: [PortRange; 4] = [
    PortRange {
        from: 0x3F8,
        to: 0x3FF,
        mask: PORT_8BIT | PORT_RW,
    },
    PortRange {
        from: 0x2F8,
        to: 0x2FF,
        mask: PORT_8BIT | PORT_RW,
    },
    PortRange {
        from: 0x3E8,
        to: 0x3EF,
        mask: PORT_8BIT | PORT_RW,
    },
    PortRange {
        from: 0x2E8,
        to: 0x2EF,
        mask: PORT_8BIT | PORT_RW,
    },
];

// interrupt sources, in IIR priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntType {
    Ier,
    RxData,
    TxHold,
    RxLstat,
    ModStat,
    Fifo,
}

// ── Register bit groups ───────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
struct IntEnable {
    rxdata: bool,
    txhold: bool,
    rxlstat: bool,
    modstat: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct LineControl {
    wordlen_sel: u8,
    stopbits: bool,
    parity_enable: bool,
    evenparity_sel: bool,
    stick_parity: bool,
    break_cntl: bool,
    dlab: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ModemControl {
    dtr: bool,
    rts: bool,
    out1: bool,
    out2: bool,
    local_loopback: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct LineStatus {
    rxdata_ready: bool,
    overrun_error: bool,
    parity_error: bool,
    framing_error: bool,
    break_int: bool,
    thr_empty: bool,
    tsr_empty: bool,
    fifo_error: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ModemStatus {
    pub delta_cts: bool,
    pub delta_dsr: bool,
    pub ri_trailedge: bool,
    pub delta_dcd: bool,
    pub cts: bool,
    pub dsr: bool,
    pub ri: bool,
    pub dcd: bool,
}

/// Line levels a backend reports back to the UART.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ModemLines {
    pub cts: bool,
    pub dsr: bool,
    pub ri: bool,
    pub dcd: bool,
}

// ── One UART ──────────────────────────────────────────────────

struct Uart {
    com: Option<usize>,
    irq: usize,

    int_enable: IntEnable,
    line_cntl: LineControl,
    modem_cntl: ModemControl,
    line_status: LineStatus,
    modem_status: ModemStatus,

    // interrupt sources, latched vs pending-on-disabled
    ls_interrupt: bool,
    ms_interrupt: bool,
    rx_interrupt: bool,
    tx_interrupt: bool,
    fifo_interrupt: bool,
    ls_ipending: bool,
    ms_ipending: bool,
    rx_ipending: bool,
    fifo_ipending: bool,
    iir_ipending: bool,
    iir_id: u8,

    fifo_enable: bool,
    rx_trigger: u8,
    rx_fifo: [u8; 16],
    tx_fifo: [u8; 16],
    rx_fifo_end: usize,
    tx_fifo_end: usize,

    thrbuffer: u8,
    tsrbuffer: u8,
    rxbuffer: u8,
    scratch: u8,
    divisor_lsb: u8,
    divisor_msb: u8,
    baudrate: u32,
    databyte_usec: u32,
}

impl Uart {
    fn new() -> Self {
        let mut u = Self {
            com: None,
            irq: 0,
            int_enable: IntEnable::default(),
            line_cntl: LineControl::default(),
            modem_cntl: ModemControl::default(),
            line_status: LineStatus::default(),
            modem_status: ModemStatus::default(),
            ls_interrupt: false,
            ms_interrupt: false,
            rx_interrupt: false,
            tx_interrupt: false,
            fifo_interrupt: false,
            ls_ipending: false,
            ms_ipending: false,
            rx_ipending: false,
            fifo_ipending: false,
            iir_ipending: true,
            iir_id: 0,
            fifo_enable: false,
            rx_trigger: 0,
            rx_fifo: [0; 16],
            tx_fifo: [0; 16],
            rx_fifo_end: 0,
            tx_fifo_end: 0,
            thrbuffer: 0,
            tsrbuffer: 0,
            rxbuffer: 0,
            scratch: 0,
            divisor_lsb: 0,
            divisor_msb: 0,
            baudrate: 0,
            databyte_usec: 0,
        };
        u.power_on_defaults();
        u
    }

    fn power_on_defaults(&mut self) {
        self.ls_interrupt = false;
        self.ms_interrupt = false;
        self.rx_interrupt = false;
        self.tx_interrupt = false;
        self.fifo_interrupt = false;
        self.ls_ipending = false;
        self.ms_ipending = false;
        self.rx_ipending = false;
        self.fifo_ipending = false;
        self.int_enable = IntEnable::default();
        self.iir_ipending = true;
        self.iir_id = 0;
        self.fifo_enable = false;
        self.rx_trigger = 0;
        self.rx_fifo_end = 0;
        self.tx_fifo_end = 0;
        self.line_cntl = LineControl {
            wordlen_sel: 3,
            ..LineControl::default()
        };
        self.modem_cntl = ModemControl::default();
        self.line_status = LineStatus {
            thr_empty: true,
            tsr_empty: true,
            ..LineStatus::default()
        };
        self.modem_status = ModemStatus::default();
        self.scratch = 0;
        self.divisor_lsb = 0x0C; // 9600 baud
        self.divisor_msb = 0;
        self.rx_fifo = [0; 16];
        self.tx_fifo = [0; 16];
    }

    fn name(&self) -> String {
        match self.com {
            Some(c) => format!("COM{}", c + 1),
            None => "COM-".to_string(),
        }
    }
}

/// Host side of one port: backend plus its three timers.
struct Host {
    backend: HostPort,
    tx_timer: TimerId,
    rx_timer: TimerId,
    fifo_timer: TimerId,
    tx_delay_ms: f64,
}

// ── The serial interface device ───────────────────────────────

pub struct Serial {
    uart: [Uart; SER_PORTS],
    host: [Host; SER_PORTS],
    /// COM number → port index.
    portmap: [Option<usize>; 4],
    enabled: bool,
    mouse: Arc<Mutex<MouseState>>,
    mouse_port: Option<usize>,
    mouse_type: MouseType,
    /// 0 = idle, 1 = DTR seen, 2 = RTS seen (ident due).
    mouse_detect: u8,
    mouse_buffer: [u8; MOUSE_BUFF_SIZE],
    mouse_buffer_head: usize,
    mouse_buffer_elements: usize,
}

/// Cloneable handle the GUI/input thread uses to feed the serial mouse.
#[derive(Clone)]
pub struct SerialMouseHandle {
    state: Arc<Mutex<MouseState>>,
}

impl SerialMouseHandle {
    pub fn motion(&self, delta_x: i32, delta_y: i32, delta_z: i32) {
        if delta_x == 0 && delta_y == 0 && delta_z == 0 {
            return;
        }
        let mut m = self.state.lock().unwrap();
        m.motion(delta_x, delta_y, delta_z);
    }

    pub fn button(&self, button: usize, pressed: bool) {
        let mut m = self.state.lock().unwrap();
        m.button(button, pressed);
    }
}

impl Serial {
    pub fn install(timers: &mut TimerWheel, backends: [HostPort; SER_PORTS], tx_delay_ms: f64) -> Self {
        let mouse = Arc::new(Mutex::new(MouseState::default()));
        let mut backends = backends.into_iter();
        let host = std::array::from_fn::<_, SER_PORTS, _>(|p| Host {
            backend: backends.next().unwrap(),
            tx_timer: timers.register(&format!("serial {} TX", p), TimerFn::UartTx(p)),
            rx_timer: timers.register(&format!("serial {} RX", p), TimerFn::UartRx(p)),
            fifo_timer: timers.register(&format!("serial {} FIFO", p), TimerFn::UartFifo(p)),
            tx_delay_ms,
        });
        let mut serial = Self {
            uart: std::array::from_fn(|_| Uart::new()),
            host,
            portmap: [None; 4],
            enabled: false,
            mouse,
            mouse_port: None,
            mouse_type: MouseType::None,
            mouse_detect: 0,
            mouse_buffer: [0; MOUSE_BUFF_SIZE],
            mouse_buffer_head: 0,
            mouse_buffer_elements: 0,
        };
        for p in 0..SER_PORTS {
            if let HostPort::Mouse(t) = &serial.host[p].backend {
                serial.mouse_port = Some(p);
                serial.mouse_type = *t;
            }
        }
        debug!("installed serial interface");
        serial
    }

    pub fn mouse_handle(&self) -> SerialMouseHandle {
        SerialMouseHandle {
            state: self.mouse.clone(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if enabled != self.enabled {
            debug!("serial interface {}", if enabled { "ENABLED" } else { "DISABLED" });
            self.enabled = enabled;
        }
    }

    /// Bind host port `p` to COM `com`, claiming its I/O range.
    pub fn install_com(
        &mut self,
        bus: &mut IoBus,
        p: usize,
        com: usize,
    ) -> Result<(), crate::error::ConfigError> {
        bus.register(crate::devices::DeviceId::Serial, &[SERIAL_PORTS_COM[com]])?;
        self.uart[p].com = Some(com);
        self.uart[p].irq = COM_IRQS[com];
        self.portmap[com] = Some(p);
        debug!(
            "serial {} -> COM{}, I/O 0x{:04X}, IRQ {}",
            p,
            com + 1,
            COM_BASES[com],
            COM_IRQS[com]
        );
        Ok(())
    }

    pub fn reset(&mut self) {
        for p in 0..SER_PORTS {
            self.uart[p].power_on_defaults();
            self.set_baudrate(p);
            self.set_databyte_time(p);
            match &mut self.host[p].backend {
                HostPort::Net(net) => net.clear_queues(),
                HostPort::Modem(modem) => {
                    let u = &self.uart[p];
                    modem.set_mcr(u.modem_cntl.dtr, u.modem_cntl.rts);
                    modem.reset();
                }
                HostPort::Speech(speech) => speech.reset(),
                HostPort::None => {}
                _ => {
                    // simulate a connected device
                    self.uart[p].modem_status.cts = true;
                    self.uart[p].modem_status.dsr = true;
                }
            }
        }
        self.mouse.lock().unwrap().reset();
        self.mouse_detect = 0;
        self.mouse_buffer_elements = 0;
        self.mouse_buffer_head = 0;
        self.mouse_buffer = [0; MOUSE_BUFF_SIZE];
    }

    // ── Interrupt plumbing ────────────────────────────────────

    fn lower_interrupt(&mut self, port: usize, ctx: &mut DevCtx) {
        let u = &self.uart[port];
        if !u.rx_interrupt
            && !u.tx_interrupt
            && !u.ls_interrupt
            && !u.ms_interrupt
            && !u.fifo_interrupt
        {
            ctx.lower_irq(u.irq);
        }
    }

    fn raise_interrupt(&mut self, port: usize, int_type: IntType, ctx: &mut DevCtx) {
        let u = &mut self.uart[port];
        let gen_int = match int_type {
            IntType::Ier => true,
            IntType::RxData => {
                if u.int_enable.rxdata {
                    u.rx_interrupt = true;
                    true
                } else {
                    u.rx_ipending = true;
                    false
                }
            }
            IntType::TxHold => {
                if u.int_enable.txhold {
                    u.tx_interrupt = true;
                    true
                } else {
                    false
                }
            }
            IntType::RxLstat => {
                if u.int_enable.rxlstat {
                    u.ls_interrupt = true;
                    true
                } else {
                    u.ls_ipending = true;
                    false
                }
            }
            IntType::ModStat => {
                if u.ms_ipending && u.int_enable.modstat {
                    u.ms_interrupt = true;
                    u.ms_ipending = false;
                    true
                } else {
                    false
                }
            }
            IntType::Fifo => {
                if u.int_enable.rxdata {
                    u.fifo_interrupt = true;
                    true
                } else {
                    u.fifo_ipending = true;
                    false
                }
            }
        };
        if gen_int && u.modem_cntl.out2 {
            let irq = u.irq;
            trace!("{}: raising IRQ {} ({:?})", u.name(), irq, int_type);
            ctx.raise_irq(irq);
        }
    }

    /// Backend-reported line changes (modem DCD/RI etc).
    fn set_msr(&mut self, port: usize, lines: ModemLines, ctx: &mut DevCtx) {
        let mut gen_int = false;
        {
            let u = &mut self.uart[port];
            let loopback = u.modem_cntl.local_loopback;
            if lines.ri != u.modem_status.ri {
                u.modem_status.ri = lines.ri;
                if !loopback {
                    if !lines.ri {
                        u.modem_status.ri_trailedge = true;
                    }
                    gen_int = true;
                }
            }
            if lines.dcd != u.modem_status.dcd {
                u.modem_status.dcd = lines.dcd;
                if !loopback {
                    u.modem_status.delta_dcd = true;
                    gen_int = true;
                }
            }
            if lines.dsr != u.modem_status.dsr {
                u.modem_status.dsr = lines.dsr;
                if !loopback {
                    u.modem_status.delta_dsr = true;
                    gen_int = true;
                }
            }
            if lines.cts != u.modem_status.cts {
                u.modem_status.cts = lines.cts;
                if !loopback {
                    u.modem_status.delta_cts = true;
                    gen_int = true;
                }
            }
            if gen_int {
                u.ms_ipending = true;
            }
        }
        if gen_int {
            self.raise_interrupt(port, IntType::ModStat, ctx);
        }
    }

    // ── Port file ─────────────────────────────────────────────

    fn decode(&self, address: u16) -> Option<usize> {
        let com = match address & 0x03F8 {
            0x03F8 => 0,
            0x02F8 => 1,
            0x03E8 => 2,
            0x02E8 => 3,
            _ => return None,
        };
        self.portmap[com]
    }

    pub fn read(&mut self, address: u16, ctx: &mut DevCtx) -> u8 {
        if !self.enabled {
            // POST probes LCR with the interface disabled and must
            // see the port as missing
            return 0;
        }
        let port = match self.decode(address) {
            Some(p) => p,
            None => {
                debug!("serial: read from unbound port 0x{:04X}", address);
                return 0;
            }
        };

        match address & 0x07 {
            SER_THR => {
                let u = &mut self.uart[port];
                if u.line_cntl.dlab {
                    u.divisor_lsb
                } else if u.fifo_enable {
                    let val = u.rx_fifo[0];
                    if u.rx_fifo_end > 0 {
                        u.rx_fifo.copy_within(1..16, 0);
                        u.rx_fifo_end -= 1;
                    }
                    if u.rx_fifo_end == 0 {
                        u.line_status.rxdata_ready = false;
                        u.rx_interrupt = false;
                        u.rx_ipending = false;
                        u.fifo_interrupt = false;
                        u.fifo_ipending = false;
                        self.lower_interrupt(port, ctx);
                    }
                    val
                } else {
                    let val = u.rxbuffer;
                    u.line_status.rxdata_ready = false;
                    u.rx_interrupt = false;
                    u.rx_ipending = false;
                    self.lower_interrupt(port, ctx);
                    val
                }
            }
            SER_IER => {
                let u = &self.uart[port];
                if u.line_cntl.dlab {
                    u.divisor_msb
                } else {
                    u.int_enable.rxdata as u8
                        | (u.int_enable.txhold as u8) << 1
                        | (u.int_enable.rxlstat as u8) << 2
                        | (u.int_enable.modstat as u8) << 3
                }
            }
            SER_IIR => {
                let u = &mut self.uart[port];
                if u.ls_interrupt {
                    u.iir_id = 0x3;
                    u.iir_ipending = false;
                } else if u.fifo_interrupt {
                    u.iir_id = 0x6;
                    u.iir_ipending = false;
                } else if u.rx_interrupt {
                    u.iir_id = 0x2;
                    u.iir_ipending = false;
                } else if u.tx_interrupt {
                    u.iir_id = 0x1;
                    u.iir_ipending = false;
                    // reading IIR clears the THRE source
                    u.tx_interrupt = false;
                } else if u.ms_interrupt {
                    u.iir_id = 0x0;
                    u.iir_ipending = false;
                } else {
                    u.iir_id = 0x0;
                    u.iir_ipending = true;
                }
                let val = u.iir_ipending as u8
                    | u.iir_id << 1
                    | if u.fifo_enable { 0xC0 } else { 0x00 };
                self.lower_interrupt(port, ctx);
                val
            }
            SER_LCR => {
                let u = &self.uart[port];
                u.line_cntl.wordlen_sel
                    | (u.line_cntl.stopbits as u8) << 2
                    | (u.line_cntl.parity_enable as u8) << 3
                    | (u.line_cntl.evenparity_sel as u8) << 4
                    | (u.line_cntl.stick_parity as u8) << 5
                    | (u.line_cntl.break_cntl as u8) << 6
                    | (u.line_cntl.dlab as u8) << 7
            }
            SER_MCR => {
                let u = &self.uart[port];
                u.modem_cntl.dtr as u8
                    | (u.modem_cntl.rts as u8) << 1
                    | (u.modem_cntl.out1 as u8) << 2
                    | (u.modem_cntl.out2 as u8) << 3
                    | (u.modem_cntl.local_loopback as u8) << 4
            }
            SER_LSR => {
                let u = &mut self.uart[port];
                let val = u.line_status.rxdata_ready as u8
                    | (u.line_status.overrun_error as u8) << 1
                    | (u.line_status.parity_error as u8) << 2
                    | (u.line_status.framing_error as u8) << 3
                    | (u.line_status.break_int as u8) << 4
                    | (u.line_status.thr_empty as u8) << 5
                    | (u.line_status.tsr_empty as u8) << 6
                    | (u.line_status.fifo_error as u8) << 7;
                u.line_status.overrun_error = false;
                u.line_status.framing_error = false;
                u.line_status.break_int = false;
                u.ls_interrupt = false;
                u.ls_ipending = false;
                self.lower_interrupt(port, ctx);
                val
            }
            SER_MSR => {
                let u = &mut self.uart[port];
                let val = u.modem_status.delta_cts as u8
                    | (u.modem_status.delta_dsr as u8) << 1
                    | (u.modem_status.ri_trailedge as u8) << 2
                    | (u.modem_status.delta_dcd as u8) << 3
                    | (u.modem_status.cts as u8) << 4
                    | (u.modem_status.dsr as u8) << 5
                    | (u.modem_status.ri as u8) << 6
                    | (u.modem_status.dcd as u8) << 7;
                u.modem_status.delta_cts = false;
                u.modem_status.delta_dsr = false;
                u.modem_status.ri_trailedge = false;
                u.modem_status.delta_dcd = false;
                u.ms_interrupt = false;
                u.ms_ipending = false;
                self.lower_interrupt(port, ctx);
                val
            }
            SER_SCR => self.uart[port].scratch,
            _ => 0,
        }
    }

    pub fn write(&mut self, address: u16, value: u8, ctx: &mut DevCtx) {
        if !self.enabled {
            return;
        }
        let port = match self.decode(address) {
            Some(p) => p,
            None => {
                debug!("serial: write to unbound port 0x{:04X}", address);
                return;
            }
        };

        match address & 0x07 {
            SER_THR => self.write_thr(port, value, ctx),
            SER_IER => self.write_ier(port, value, ctx),
            SER_IIR => self.write_fcr(port, value),
            SER_LCR => self.write_lcr(port, value, ctx),
            SER_MCR => self.write_mcr(port, value, ctx),
            SER_LSR => warn!("{}: write to line status register ignored", self.uart[port].name()),
            SER_MSR => warn!("{}: write to modem status register ignored", self.uart[port].name()),
            SER_SCR => self.uart[port].scratch = value,
            _ => {}
        }
    }

    fn write_thr(&mut self, port: usize, value: u8, ctx: &mut DevCtx) {
        if self.uart[port].line_cntl.dlab {
            self.uart[port].divisor_lsb = value;
            return;
        }
        if self.uart[port].tx_interrupt {
            self.uart[port].tx_interrupt = false;
            self.lower_interrupt(port, ctx);
        }
        let u = &mut self.uart[port];
        let bitmask = 0xFFu8 >> (3 - u.line_cntl.wordlen_sel);
        let value = value & bitmask;
        if u.line_status.thr_empty {
            if u.fifo_enable {
                u.tx_fifo[u.tx_fifo_end] = value;
                u.tx_fifo_end += 1;
            } else {
                u.thrbuffer = value;
            }
            u.line_status.thr_empty = false;
            if u.line_status.tsr_empty {
                if u.fifo_enable {
                    u.tsrbuffer = u.tx_fifo[0];
                    u.tx_fifo.copy_within(1..16, 0);
                    u.tx_fifo_end -= 1;
                    u.line_status.thr_empty = u.tx_fifo_end == 0;
                } else {
                    u.tsrbuffer = u.thrbuffer;
                    u.line_status.thr_empty = true;
                }
                u.line_status.tsr_empty = false;
                let thr_empty = u.line_status.thr_empty;
                let db = u.databyte_usec as u64;
                if thr_empty {
                    self.raise_interrupt(port, IntType::TxHold, ctx);
                }
                trace!("serial {}: activating TX timer: {} us", port, db);
                ctx.activate_timer(self.host[port].tx_timer, db * USEC);
            }
        } else if u.fifo_enable {
            if u.tx_fifo_end < 16 {
                u.tx_fifo[u.tx_fifo_end] = value;
                u.tx_fifo_end += 1;
            } else {
                warn!("{}: transmit FIFO overflow", u.name());
            }
        } else {
            warn!("{}: write to tx hold register when not empty", u.name());
        }
    }

    fn write_ier(&mut self, port: usize, value: u8, ctx: &mut DevCtx) {
        if self.uart[port].line_cntl.dlab {
            self.uart[port].divisor_msb = value;
            return;
        }
        let new_rxdata = value & 0x01 != 0;
        let new_txhold = value & 0x02 != 0;
        let new_rxlstat = value & 0x04 != 0;
        let new_modstat = value & 0x08 != 0;
        let mut gen_int = false;
        let mut lower = false;
        {
            let u = &mut self.uart[port];
            if new_modstat != u.int_enable.modstat {
                u.int_enable.modstat = new_modstat;
                if new_modstat {
                    if u.ms_ipending {
                        u.ms_interrupt = true;
                        u.ms_ipending = false;
                        gen_int = true;
                    }
                } else if u.ms_interrupt {
                    u.ms_interrupt = false;
                    u.ms_ipending = true;
                    lower = true;
                }
            }
            if new_txhold != u.int_enable.txhold {
                u.int_enable.txhold = new_txhold;
                if new_txhold {
                    u.tx_interrupt = u.line_status.thr_empty;
                    if u.tx_interrupt {
                        gen_int = true;
                    }
                } else {
                    u.tx_interrupt = false;
                    lower = true;
                }
            }
            if new_rxdata != u.int_enable.rxdata {
                u.int_enable.rxdata = new_rxdata;
                if new_rxdata {
                    if u.fifo_ipending {
                        u.fifo_interrupt = true;
                        u.fifo_ipending = false;
                        gen_int = true;
                    }
                    if u.rx_ipending {
                        u.rx_interrupt = true;
                        u.rx_ipending = false;
                        gen_int = true;
                    }
                } else {
                    if u.rx_interrupt {
                        u.rx_interrupt = false;
                        u.rx_ipending = true;
                        lower = true;
                    }
                    if u.fifo_interrupt {
                        u.fifo_interrupt = false;
                        u.fifo_ipending = true;
                        lower = true;
                    }
                }
            }
            if new_rxlstat != u.int_enable.rxlstat {
                u.int_enable.rxlstat = new_rxlstat;
                if new_rxlstat {
                    if u.ls_ipending {
                        u.ls_interrupt = true;
                        u.ls_ipending = false;
                        gen_int = true;
                    }
                } else if u.ls_interrupt {
                    u.ls_interrupt = false;
                    u.ls_ipending = true;
                    lower = true;
                }
            }
        }
        if lower {
            self.lower_interrupt(port, ctx);
        }
        if gen_int {
            self.raise_interrupt(port, IntType::Ier, ctx);
        }
    }

    fn write_fcr(&mut self, port: usize, value: u8) {
        let u = &mut self.uart[port];
        let enabled = value & 0x01 != 0 && !u.fifo_enable;
        if enabled {
            u.rx_fifo_end = 0;
            u.tx_fifo_end = 0;
        } else if value & 0x01 == 0 && u.fifo_enable {
            debug!("serial {}: FIFO disabled", port);
        }
        u.fifo_enable = value & 0x01 != 0;
        if value & 0x02 != 0 {
            u.rx_fifo_end = 0;
        }
        if value & 0x04 != 0 {
            u.tx_fifo_end = 0;
        }
        u.rx_trigger = (value & 0xC0) >> 6;
        if enabled {
            debug!("serial {}: FIFO enabled, rxtrigger={}", port, u.rx_trigger);
        }
    }

    fn write_lcr(&mut self, port: usize, value: u8, ctx: &mut DevCtx) {
        let new_wordlen = value & 0x03;
        let new_dlab = value & 0x80 != 0;
        {
            let u = &mut self.uart[port];
            u.line_cntl.wordlen_sel = new_wordlen;
            u.line_cntl.stopbits = value & 0x04 != 0;
            u.line_cntl.parity_enable = value & 0x08 != 0;
            u.line_cntl.evenparity_sel = value & 0x10 != 0;
            u.line_cntl.stick_parity = value & 0x20 != 0;
            u.line_cntl.break_cntl = value & 0x40 != 0;
        }

        if self.uart[port].modem_cntl.local_loopback && self.uart[port].line_cntl.break_cntl {
            self.uart[port].line_status.break_int = true;
            self.uart[port].line_status.framing_error = true;
            self.rx_fifo_enq(port, 0x00, ctx);
        }

        if !new_dlab && self.uart[port].line_cntl.dlab {
            self.set_baudrate(port);
        }
        self.uart[port].line_cntl.dlab = new_dlab;

        self.set_databyte_time(port);
        let db = self.uart[port].databyte_usec as u64;
        if db != 0 {
            trace!("serial {}: activating RX timer: {} us", port, db);
            ctx.activate_timer(self.host[port].rx_timer, db * USEC);
        }
    }

    fn write_mcr(&mut self, port: usize, value: u8, ctx: &mut DevCtx) {
        let new_dtr = value & 0x01 != 0;
        let new_rts = value & 0x02 != 0;
        let new_out1 = value & 0x04 != 0;
        let new_out2 = value & 0x08 != 0;
        let new_loop = value & 0x10 != 0;

        // serial mouse power-up detection: DTR then RTS with 7/8-bit words
        if matches!(self.host[port].backend, HostPort::Mouse(_))
            && (self.uart[port].line_cntl.wordlen_sel == 2
                || self.uart[port].line_cntl.wordlen_sel == 3)
        {
            if !self.uart[port].modem_cntl.dtr && new_dtr {
                self.mouse_detect = 1;
            }
            if self.mouse_detect == 1 && new_rts {
                self.mouse_detect = 2;
            }
        }

        {
            let u = &mut self.uart[port];
            u.modem_cntl.dtr = new_dtr;
            u.modem_cntl.rts = new_rts;
            u.modem_cntl.out1 = new_out1;
            if new_out2 != u.modem_cntl.out2 {
                debug!("serial {}: INTs {}abled", port, if new_out2 { "en" } else { "dis" });
            }
            u.modem_cntl.out2 = new_out2;
        }

        if new_loop != self.uart[port].modem_cntl.local_loopback {
            self.uart[port].modem_cntl.local_loopback = new_loop;
            if new_loop {
                if self.uart[port].line_cntl.break_cntl {
                    self.uart[port].line_status.break_int = true;
                    self.uart[port].line_status.framing_error = true;
                    self.rx_fifo_enq(port, 0x00, ctx);
                }
            } else if let HostPort::Modem(modem) = &mut self.host[port].backend {
                let lines = modem.lines();
                self.set_msr(port, lines, ctx);
            }
        }

        if self.uart[port].modem_cntl.local_loopback {
            // MCR outputs cross over to the MSR inputs
            let u = &mut self.uart[port];
            let prev = u.modem_status;
            u.modem_status.cts = u.modem_cntl.rts;
            u.modem_status.dsr = u.modem_cntl.dtr;
            u.modem_status.ri = u.modem_cntl.out1;
            u.modem_status.dcd = u.modem_cntl.out2;
            if u.modem_status.cts != prev.cts {
                u.modem_status.delta_cts = true;
                u.ms_ipending = true;
            }
            if u.modem_status.dsr != prev.dsr {
                u.modem_status.delta_dsr = true;
                u.ms_ipending = true;
            }
            if u.modem_status.ri != prev.ri {
                u.ms_ipending = true;
            }
            if !u.modem_status.ri && prev.ri {
                u.modem_status.ri_trailedge = true;
            }
            if u.modem_status.dcd != prev.dcd {
                u.modem_status.delta_dcd = true;
                u.ms_ipending = true;
            }
            self.raise_interrupt(port, IntType::ModStat, ctx);
        } else {
            if matches!(self.host[port].backend, HostPort::Mouse(_)) && self.mouse_detect == 2 {
                debug!("serial {}: mouse detection mode", port);
                match self.mouse_type {
                    MouseType::Microsoft | MouseType::MouseSystems => {
                        self.mouse_buffer_head = 0;
                        self.mouse_buffer_elements = 1;
                        self.mouse_buffer[0] = b'M';
                    }
                    MouseType::Wheel => {
                        self.mouse_buffer_head = 0;
                        self.mouse_buffer_elements = 6;
                        self.mouse_buffer[..6].copy_from_slice(&[b'M', b'Z', b'@', 0, 0, 0]);
                    }
                    MouseType::None => {}
                }
                let db = self.uart[port].databyte_usec as u64;
                ctx.activate_timer(self.host[port].rx_timer, db * USEC);
                self.mouse_detect = 0;
            }
            match &mut self.host[port].backend {
                HostPort::Modem(modem) => {
                    modem.set_mcr(new_dtr, new_rts);
                }
                HostPort::None => {}
                _ => {
                    // simulate a connected device
                    let u = &mut self.uart[port];
                    u.modem_status.cts = true;
                    u.modem_status.dsr = true;
                    u.modem_status.ri = false;
                    u.modem_status.dcd = false;
                }
            }
        }
    }

    // ── Baud timing ───────────────────────────────────────────

    fn set_baudrate(&mut self, port: usize) {
        let u = &mut self.uart[port];
        let divisor = (u.divisor_msb as u32) << 8 | u.divisor_lsb as u32;
        if divisor == 0 {
            debug!("{}: ignoring invalid baud rate divisor", u.name());
            return;
        }
        let new_baudrate = PC_CLOCK_XTL / (16 * divisor);
        if new_baudrate != u.baudrate {
            u.baudrate = new_baudrate;
            debug!("serial {}: baud rate set to {}", port, new_baudrate);
            let tx_delay_ms = self.host[port].tx_delay_ms;
            if tx_delay_ms > 0.0 {
                if let HostPort::Net(net) = &mut self.host[port].backend {
                    net.set_tx_threshold(tx_delay_ms, new_baudrate);
                }
                if let HostPort::Modem(modem) = &mut self.host[port].backend {
                    modem.set_tx_threshold(tx_delay_ms, new_baudrate);
                }
            }
        }
    }

    fn set_databyte_time(&mut self, port: usize) {
        let u = &mut self.uart[port];
        if u.baudrate == 0 {
            return;
        }
        let baud_usec = 1_000_000.0 / u.baudrate as f64;
        let word_len = 5.0 + u.line_cntl.wordlen_sel as f64;
        let mut stop_bits = if u.line_cntl.stopbits { 2.0 } else { 1.0 };
        if u.line_cntl.stopbits && word_len == 5.0 {
            stop_bits = 1.5;
        }
        let packet_len = 1.0 + word_len + u.line_cntl.parity_enable as u8 as f64 + stop_bits;
        u.databyte_usec = (packet_len * baud_usec) as u32;
        trace!(
            "serial {}: databyte is {} us ({} baud)",
            port,
            u.databyte_usec,
            u.baudrate
        );
    }

    // ── RX delivery ───────────────────────────────────────────

    fn rx_fifo_enq(&mut self, port: usize, data: u8, ctx: &mut DevCtx) {
        let fifo_timer = self.host[port].fifo_timer;
        let u = &mut self.uart[port];
        if u.fifo_enable {
            if u.rx_fifo_end == 16 {
                warn!("{}: receive FIFO overflow", u.name());
                u.line_status.overrun_error = true;
                self.raise_interrupt(port, IntType::RxLstat, ctx);
            } else {
                u.rx_fifo[u.rx_fifo_end] = data;
                u.rx_fifo_end += 1;
                let gen_int = match u.rx_trigger {
                    1 => u.rx_fifo_end == 4,
                    2 => u.rx_fifo_end == 8,
                    3 => u.rx_fifo_end == 14,
                    _ => true,
                };
                if gen_int {
                    ctx.deactivate_timer(fifo_timer);
                    u.line_status.rxdata_ready = true;
                    self.raise_interrupt(port, IntType::RxData, ctx);
                } else {
                    // time-out interrupt if the trigger level isn't
                    // reached within 3 databyte intervals
                    let db = u.databyte_usec as u64;
                    ctx.activate_timer(fifo_timer, db * 3 * USEC);
                }
            }
        } else {
            if u.line_status.rxdata_ready {
                warn!("{}: overrun error", u.name());
                u.line_status.overrun_error = true;
                self.raise_interrupt(port, IntType::RxLstat, ctx);
            }
            let u = &mut self.uart[port];
            u.rxbuffer = data;
            u.line_status.rxdata_ready = true;
            self.raise_interrupt(port, IntType::RxData, ctx);
        }
    }

    // ── Timer callbacks ───────────────────────────────────────

    pub fn tx_timer(&mut self, port: usize, ctx: &mut DevCtx) {
        let mut sent = true;
        let byte = self.uart[port].tsrbuffer;

        if self.uart[port].modem_cntl.local_loopback {
            self.rx_fifo_enq(port, byte, ctx);
        } else {
            match &mut self.host[port].backend {
                HostPort::Modem(modem) => {
                    sent = modem.serial_write_byte(byte);
                }
                HostPort::Speech(speech) => {
                    sent = speech.serial_write_byte(byte);
                }
                HostPort::File(file) => {
                    if let Err(e) = file.write_byte(byte) {
                        error!("serial {}: cannot write to file: {}", port, e);
                        self.host[port].backend = HostPort::Dummy;
                    }
                }
                #[cfg(unix)]
                HostPort::Term(term) => {
                    term.write_byte(byte);
                }
                HostPort::Mouse(_) => {
                    debug!("serial {}: write to mouse ignored: 0x{:02x}", port, byte);
                }
                HostPort::Net(net) => {
                    if net.is_connected() {
                        sent = net.tx_push(byte);
                        if !sent {
                            debug!("serial {}: tx buffer overflow: {:02x}", port, byte);
                        }
                    }
                }
                HostPort::None | HostPort::Dummy => {}
            }
        }

        let mut gen_int = false;
        if sent {
            let u = &mut self.uart[port];
            u.line_status.tsr_empty = true;
            if u.fifo_enable && u.tx_fifo_end > 0 {
                u.tsrbuffer = u.tx_fifo[0];
                u.line_status.tsr_empty = false;
                u.tx_fifo.copy_within(1..16, 0);
                u.tx_fifo_end -= 1;
                gen_int = u.tx_fifo_end == 0;
            } else if !u.line_status.thr_empty {
                u.tsrbuffer = u.thrbuffer;
                u.line_status.tsr_empty = false;
                gen_int = true;
            }
        }
        if !self.uart[port].line_status.tsr_empty {
            if gen_int {
                self.uart[port].line_status.thr_empty = true;
                self.raise_interrupt(port, IntType::TxHold, ctx);
            }
            let db = self.uart[port].databyte_usec as u64;
            ctx.activate_timer(self.host[port].tx_timer, db * USEC);
        } else {
            trace!("serial {}: deactivating TX timer", port);
        }
    }

    pub fn rx_timer(&mut self, port: usize, ctx: &mut DevCtx) {
        if !self.enabled
            || matches!(self.host[port].backend, HostPort::None | HostPort::Dummy)
        {
            trace!("serial {}: rx timer disabled", port);
            return;
        }

        // let the modem backend run its own state machine and update
        // the line states it exposes
        if let HostPort::Modem(modem) = &mut self.host[port].backend {
            modem.poll();
            let lines = modem.lines();
            self.set_msr(port, lines, ctx);
        }

        let mut data_ready = false;
        let mut db_usec = self.uart[port].databyte_usec as u64;
        let mut chbuf = 0u8;

        if !self.uart[port].line_status.rxdata_ready || self.uart[port].fifo_enable {
            match &mut self.host[port].backend {
                HostPort::Modem(modem) => {
                    if let Some(b) = modem.serial_read_byte() {
                        chbuf = b;
                        data_ready = true;
                    }
                }
                HostPort::Speech(speech) => {
                    if let Some(b) = speech.serial_read_byte() {
                        chbuf = b;
                        data_ready = true;
                    }
                }
                HostPort::Net(net) => {
                    if net.is_connected() && !self.uart[port].line_status.rxdata_ready {
                        if let Some(b) = net.rx_pop() {
                            chbuf = b;
                            data_ready = true;
                        }
                    }
                }
                #[cfg(unix)]
                HostPort::Term(term) => {
                    if let Some(b) = term.read_byte() {
                        chbuf = b;
                        data_ready = true;
                    }
                }
                HostPort::Mouse(_) => {
                    {
                        let mut m = self.mouse.lock().unwrap();
                        if m.update && self.mouse_buffer_elements == 0 {
                            let (data, nbytes) = m.make_packet(self.mouse_type);
                            for &b in &data[..nbytes] {
                                let tail = (self.mouse_buffer_head + self.mouse_buffer_elements)
                                    % MOUSE_BUFF_SIZE;
                                self.mouse_buffer[tail] = b;
                                self.mouse_buffer_elements += 1;
                            }
                        }
                    }
                    if self.mouse_buffer_elements > 0 {
                        chbuf = self.mouse_buffer[self.mouse_buffer_head];
                        self.mouse_buffer_head = (self.mouse_buffer_head + 1) % MOUSE_BUFF_SIZE;
                        self.mouse_buffer_elements -= 1;
                        data_ready = true;
                    }
                }
                _ => {}
            }
            if data_ready {
                if !self.uart[port].modem_cntl.local_loopback {
                    self.rx_fifo_enq(port, chbuf, ctx);
                }
            } else if !self.uart[port].fifo_enable
                && !matches!(self.host[port].backend, HostPort::Mouse(_))
            {
                // nothing waiting: drop to a slow 100ms poll
                db_usec = 100_000;
            }
        } else {
            // receiver still full: poll at 4x the byte rate
            db_usec *= 4;
        }

        ctx.activate_timer(self.host[port].rx_timer, db_usec * USEC);
    }

    pub fn fifo_timer(&mut self, port: usize, ctx: &mut DevCtx) {
        self.uart[port].line_status.rxdata_ready = true;
        self.raise_interrupt(port, IntType::Fifo, ctx);
    }

    // ── Mouse line power ──────────────────────────────────────

    /// Mouse packets flow only while DTR and RTS are up.
    pub fn mouse_powered(&self) -> bool {
        match self.mouse_port {
            Some(p) => self.uart[p].modem_cntl.dtr && self.uart[p].modem_cntl.rts,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
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

        fn run(&mut self, ser: &mut Serial, until_ns: u64) {
            loop {
                let due = match self.timers.next_due() {
                    Some(d) if d <= until_ns => d,
                    _ => break,
                };
                let now = self.clock.now_ns();
                self.clock.advance(due - now);
                match self.timers.pop_due(due) {
                    Some((_, TimerFn::UartTx(p))) => ser.tx_timer(p, &mut self.ctx()),
                    Some((_, TimerFn::UartRx(p))) => ser.rx_timer(p, &mut self.ctx()),
                    Some((_, TimerFn::UartFifo(p))) => ser.fifo_timer(p, &mut self.ctx()),
                    _ => {}
                }
            }
            let now = self.clock.now_ns();
            if until_ns > now {
                self.clock.advance(until_ns - now);
            }
        }
    }

    fn com1(fx: &mut Fixture) -> Serial {
        let backends = [HostPort::Dummy, HostPort::None, HostPort::None, HostPort::None];
        let mut ser = Serial::install(&mut fx.timers, backends, 0.0);
        let mut bus = IoBus::new();
        ser.install_com(&mut bus, 0, 0).unwrap();
        ser.set_enabled(true);
        ser.reset();
        ser
    }

    fn init_pic(fx: &mut Fixture) {
        let mut intr = IntrLine::default();
        fx.pic.write(0x20, 0x11, &mut intr);
        fx.pic.write(0x21, 0x08, &mut intr);
        fx.pic.write(0x21, 0x04, &mut intr);
        fx.pic.write(0x21, 0x01, &mut intr);
        fx.pic.write(0x21, 0x00, &mut intr);
    }

    #[test]
    fn divisor_latch_sets_baud_and_byte_time() {
        let mut fx = Fixture::new();
        let mut ser = com1(&mut fx);
        // DLAB on, divisor 12 -> 9600 baud
        ser.write(0x3FB, 0x80, &mut fx.ctx());
        ser.write(0x3F8, 12, &mut fx.ctx());
        ser.write(0x3F9, 0, &mut fx.ctx());
        // 8N1, DLAB off
        ser.write(0x3FB, 0x03, &mut fx.ctx());
        assert_eq!(ser.uart[0].baudrate, 9600);
        // 10 bits per frame at 9600 baud = 1041 us
        assert_eq!(ser.uart[0].databyte_usec, 1041);
    }

    #[test]
    fn zero_divisor_keeps_previous_rate() {
        let mut fx = Fixture::new();
        let mut ser = com1(&mut fx);
        assert_eq!(ser.uart[0].baudrate, 9600); // reset default
        ser.write(0x3FB, 0x80, &mut fx.ctx());
        ser.write(0x3F8, 0, &mut fx.ctx());
        ser.write(0x3F9, 0, &mut fx.ctx());
        ser.write(0x3FB, 0x03, &mut fx.ctx());
        assert_eq!(ser.uart[0].baudrate, 9600);
    }

    #[test]
    fn loopback_roundtrip_after_one_byte_time() {
        let mut fx = Fixture::new();
        init_pic(&mut fx);
        let mut ser = com1(&mut fx);
        ser.write(0x3FB, 0x80, &mut fx.ctx());
        ser.write(0x3F8, 12, &mut fx.ctx());
        ser.write(0x3F9, 0, &mut fx.ctx());
        ser.write(0x3FB, 0x03, &mut fx.ctx());
        ser.write(0x3FC, 0x18, &mut fx.ctx()); // loopback + OUT2
        ser.write(0x3F9, 0x01, &mut fx.ctx()); // IER: rx data
        ser.write(0x3F8, 0x41, &mut fx.ctx());
        // nothing before a byte time
        fx.run(&mut ser, 1_040 * USEC);
        assert_eq!(ser.uart[0].line_status.rxdata_ready, false);
        fx.run(&mut ser, 1_041 * USEC);
        assert!(ser.uart[0].line_status.rxdata_ready);
        assert!(fx.intr.is_raised());
        assert_eq!(fx.pic.iac(&mut fx.intr), 0x08 + 4);
        assert_eq!(ser.read(0x3F8, &mut fx.ctx()), 0x41);
        assert!(!ser.uart[0].line_status.rxdata_ready);
    }

    #[test]
    fn iir_priority_and_thre_clear_on_read() {
        let mut fx = Fixture::new();
        let mut ser = com1(&mut fx);
        ser.write(0x3F9, 0x02, &mut fx.ctx()); // IER: THRE
        // THR empty: enabling the source latches the interrupt
        let iir = ser.read(0x3FA, &mut fx.ctx());
        assert_eq!(iir & 0x0F, 0x02); // THRE id, pending
        // second read: source was cleared by the first
        let iir = ser.read(0x3FA, &mut fx.ctx());
        assert_eq!(iir & 0x01, 0x01);
    }

    #[test]
    fn fifo_trigger_level_raises_rxdata() {
        let mut fx = Fixture::new();
        init_pic(&mut fx);
        let mut ser = com1(&mut fx);
        ser.write(0x3FB, 0x03, &mut fx.ctx());
        ser.write(0x3FA, 0x41, &mut fx.ctx()); // FIFO enable, trigger 4
        ser.write(0x3FC, 0x08, &mut fx.ctx()); // OUT2
        ser.write(0x3F9, 0x01, &mut fx.ctx());
        for b in 0..3u8 {
            ser.rx_fifo_enq(0, b, &mut fx.ctx());
        }
        assert!(!ser.uart[0].line_status.rxdata_ready);
        ser.rx_fifo_enq(0, 3, &mut fx.ctx());
        assert!(ser.uart[0].line_status.rxdata_ready);
        assert!(fx.intr.is_raised());
        // IIR reports received-data-available
        let iir = ser.read(0x3FA, &mut fx.ctx());
        assert_eq!(iir & 0x0F, 0x04);
        assert_eq!(iir & 0xC0, 0xC0); // FIFOs enabled
    }

    #[test]
    fn fifo_timeout_fires_after_three_byte_times() {
        let mut fx = Fixture::new();
        init_pic(&mut fx);
        let mut ser = com1(&mut fx);
        ser.write(0x3FB, 0x80, &mut fx.ctx());
        ser.write(0x3F8, 12, &mut fx.ctx());
        ser.write(0x3F9, 0, &mut fx.ctx());
        ser.write(0x3FB, 0x03, &mut fx.ctx());
        ser.write(0x3FA, 0x41, &mut fx.ctx());
        ser.write(0x3FC, 0x08, &mut fx.ctx());
        ser.write(0x3F9, 0x01, &mut fx.ctx());
        let t0 = fx.clock.now_ns();
        ser.rx_fifo_enq(0, 0xAA, &mut fx.ctx());
        assert!(!ser.uart[0].line_status.rxdata_ready);
        fx.run(&mut ser, t0 + 3 * 1_041 * USEC);
        assert!(ser.uart[0].line_status.rxdata_ready);
        let iir = ser.read(0x3FA, &mut fx.ctx());
        assert_eq!(iir & 0x0F, 0x0C); // character timeout id
    }

    #[test]
    fn overrun_sets_lsr_and_line_status_interrupt() {
        let mut fx = Fixture::new();
        init_pic(&mut fx);
        let mut ser = com1(&mut fx);
        ser.write(0x3FC, 0x08, &mut fx.ctx());
        ser.write(0x3F9, 0x04, &mut fx.ctx()); // IER: line status
        ser.rx_fifo_enq(0, 1, &mut fx.ctx());
        ser.rx_fifo_enq(0, 2, &mut fx.ctx()); // rxbuffer still full
        let lsr = ser.read(0x3FD, &mut fx.ctx());
        assert_eq!(lsr & 0x02, 0x02);
        // LSR read clears the error
        let lsr = ser.read(0x3FD, &mut fx.ctx());
        assert_eq!(lsr & 0x02, 0x00);
    }

    #[test]
    fn msr_read_clears_delta_bits() {
        let mut fx = Fixture::new();
        let mut ser = com1(&mut fx);
        ser.write(0x3FC, 0x10, &mut fx.ctx()); // loopback
        ser.write(0x3FC, 0x13, &mut fx.ctx()); // loopback + DTR + RTS
        let msr = ser.read(0x3FE, &mut fx.ctx());
        assert_eq!(msr & 0x30, 0x30); // CTS+DSR mirrored
        assert!(msr & 0x03 != 0); // deltas
        let msr = ser.read(0x3FE, &mut fx.ctx());
        assert_eq!(msr & 0x0F, 0);
    }

    #[test]
    fn mouse_ident_on_dtr_rts_toggle() {
        let mut fx = Fixture::new();
        let backends = [
            HostPort::Mouse(MouseType::Microsoft),
            HostPort::None,
            HostPort::None,
            HostPort::None,
        ];
        let mut ser = Serial::install(&mut fx.timers, backends, 0.0);
        let mut bus = IoBus::new();
        ser.install_com(&mut bus, 0, 0).unwrap();
        ser.set_enabled(true);
        ser.reset();
        ser.write(0x3FB, 0x80, &mut fx.ctx());
        ser.write(0x3F8, 96, &mut fx.ctx()); // 1200 baud
        ser.write(0x3F9, 0, &mut fx.ctx());
        ser.write(0x3FB, 0x02, &mut fx.ctx()); // 7 bits
        ser.write(0x3FC, 0x01, &mut fx.ctx()); // DTR
        ser.write(0x3FC, 0x03, &mut fx.ctx()); // DTR + RTS
        // ident byte arrives via the RX timer
        fx.run(&mut ser, fx.clock.now_ns() + 20_000 * USEC);
        assert!(ser.uart[0].line_status.rxdata_ready);
        assert_eq!(ser.read(0x3F8, &mut fx.ctx()), b'M');
    }

    #[test]
    fn tx_fifo_drains_to_backend_at_byte_rate() {
        let mut fx = Fixture::new();
        let mut ser = com1(&mut fx);
        ser.write(0x3FB, 0x80, &mut fx.ctx());
        ser.write(0x3F8, 12, &mut fx.ctx());
        ser.write(0x3F9, 0, &mut fx.ctx());
        ser.write(0x3FB, 0x03, &mut fx.ctx());
        ser.write(0x3FA, 0x01, &mut fx.ctx()); // FIFO on
        for b in b"abc" {
            ser.write(0x3F8, *b, &mut fx.ctx());
        }
        assert!(!ser.uart[0].line_status.tsr_empty);
        // three byte times drain everything
        fx.run(&mut ser, fx.clock.now_ns() + 4 * 1_041 * USEC);
        assert!(ser.uart[0].line_status.tsr_empty);
        assert!(ser.uart[0].line_status.thr_empty);
    }
}

// ── Save state ────────────────────────────────────────────────

use crate::error::SaveStateError;
use crate::savestate::{LumpReader, LumpWriter, StateBuf};

impl Uart {
    fn save(&self, w: &mut LumpWriter) {
        w.put_u8(self.com.map_or(0xFF, |c| c as u8));
        w.put_u64(self.irq as u64);
        w.put_bool(self.int_enable.rxdata);
        w.put_bool(self.int_enable.txhold);
        w.put_bool(self.int_enable.rxlstat);
        w.put_bool(self.int_enable.modstat);
        w.put_u8(self.line_cntl.wordlen_sel);
        w.put_bool(self.line_cntl.stopbits);
        w.put_bool(self.line_cntl.parity_enable);
        w.put_bool(self.line_cntl.evenparity_sel);
        w.put_bool(self.line_cntl.stick_parity);
        w.put_bool(self.line_cntl.break_cntl);
        w.put_bool(self.line_cntl.dlab);
        w.put_bool(self.modem_cntl.dtr);
        w.put_bool(self.modem_cntl.rts);
        w.put_bool(self.modem_cntl.out1);
        w.put_bool(self.modem_cntl.out2);
        w.put_bool(self.modem_cntl.local_loopback);
        w.put_u8(self.line_status_byte());
        w.put_u8(self.modem_status_byte());
        w.put_bool(self.ls_interrupt);
        w.put_bool(self.ms_interrupt);
        w.put_bool(self.rx_interrupt);
        w.put_bool(self.tx_interrupt);
        w.put_bool(self.fifo_interrupt);
        w.put_bool(self.ls_ipending);
        w.put_bool(self.ms_ipending);
        w.put_bool(self.rx_ipending);
        w.put_bool(self.fifo_ipending);
        w.put_bool(self.fifo_enable);
        w.put_u8(self.rx_trigger);
        w.put_bytes(&self.rx_fifo);
        w.put_bytes(&self.tx_fifo);
        w.put_u64(self.rx_fifo_end as u64);
        w.put_u64(self.tx_fifo_end as u64);
        w.put_u8(self.thrbuffer);
        w.put_u8(self.tsrbuffer);
        w.put_u8(self.rxbuffer);
        w.put_u8(self.scratch);
        w.put_u8(self.divisor_lsb);
        w.put_u8(self.divisor_msb);
        w.put_u32(self.baudrate);
        w.put_u32(self.databyte_usec);
    }

    fn line_status_byte(&self) -> u8 {
        self.line_status.rxdata_ready as u8
            | (self.line_status.overrun_error as u8) << 1
            | (self.line_status.parity_error as u8) << 2
            | (self.line_status.framing_error as u8) << 3
            | (self.line_status.break_int as u8) << 4
            | (self.line_status.thr_empty as u8) << 5
            | (self.line_status.tsr_empty as u8) << 6
            | (self.line_status.fifo_error as u8) << 7
    }

    fn modem_status_byte(&self) -> u8 {
        self.modem_status.delta_cts as u8
            | (self.modem_status.delta_dsr as u8) << 1
            | (self.modem_status.ri_trailedge as u8) << 2
            | (self.modem_status.delta_dcd as u8) << 3
            | (self.modem_status.cts as u8) << 4
            | (self.modem_status.dsr as u8) << 5
            | (self.modem_status.ri as u8) << 6
            | (self.modem_status.dcd as u8) << 7
    }

    fn restore(&mut self, r: &mut LumpReader) -> Result<(), SaveStateError> {
        let com = r.get_u8()?;
        self.com = if com == 0xFF { None } else { Some(com as usize) };
        self.irq = r.get_u64()? as usize;
        self.int_enable.rxdata = r.get_bool()?;
        self.int_enable.txhold = r.get_bool()?;
        self.int_enable.rxlstat = r.get_bool()?;
        self.int_enable.modstat = r.get_bool()?;
        self.line_cntl.wordlen_sel = r.get_u8()?;
        self.line_cntl.stopbits = r.get_bool()?;
        self.line_cntl.parity_enable = r.get_bool()?;
        self.line_cntl.evenparity_sel = r.get_bool()?;
        self.line_cntl.stick_parity = r.get_bool()?;
        self.line_cntl.break_cntl = r.get_bool()?;
        self.line_cntl.dlab = r.get_bool()?;
        self.modem_cntl.dtr = r.get_bool()?;
        self.modem_cntl.rts = r.get_bool()?;
        self.modem_cntl.out1 = r.get_bool()?;
        self.modem_cntl.out2 = r.get_bool()?;
        self.modem_cntl.local_loopback = r.get_bool()?;
        let lsr = r.get_u8()?;
        self.line_status.rxdata_ready = lsr & 0x01 != 0;
        self.line_status.overrun_error = lsr & 0x02 != 0;
        self.line_status.parity_error = lsr & 0x04 != 0;
        self.line_status.framing_error = lsr & 0x08 != 0;
        self.line_status.break_int = lsr & 0x10 != 0;
        self.line_status.thr_empty = lsr & 0x20 != 0;
        self.line_status.tsr_empty = lsr & 0x40 != 0;
        self.line_status.fifo_error = lsr & 0x80 != 0;
        let msr = r.get_u8()?;
        self.modem_status.delta_cts = msr & 0x01 != 0;
        self.modem_status.delta_dsr = msr & 0x02 != 0;
        self.modem_status.ri_trailedge = msr & 0x04 != 0;
        self.modem_status.delta_dcd = msr & 0x08 != 0;
        self.modem_status.cts = msr & 0x10 != 0;
        self.modem_status.dsr = msr & 0x20 != 0;
        self.modem_status.ri = msr & 0x40 != 0;
        self.modem_status.dcd = msr & 0x80 != 0;
        self.ls_interrupt = r.get_bool()?;
        self.ms_interrupt = r.get_bool()?;
        self.rx_interrupt = r.get_bool()?;
        self.tx_interrupt = r.get_bool()?;
        self.fifo_interrupt = r.get_bool()?;
        self.ls_ipending = r.get_bool()?;
        self.ms_ipending = r.get_bool()?;
        self.rx_ipending = r.get_bool()?;
        self.fifo_ipending = r.get_bool()?;
        self.fifo_enable = r.get_bool()?;
        self.rx_trigger = r.get_u8()?;
        self.rx_fifo.copy_from_slice(&r.get_bytes(16)?);
        self.tx_fifo.copy_from_slice(&r.get_bytes(16)?);
        self.rx_fifo_end = r.get_u64()? as usize;
        self.tx_fifo_end = r.get_u64()? as usize;
        self.thrbuffer = r.get_u8()?;
        self.tsrbuffer = r.get_u8()?;
        self.rxbuffer = r.get_u8()?;
        self.scratch = r.get_u8()?;
        self.divisor_lsb = r.get_u8()?;
        self.divisor_msb = r.get_u8()?;
        self.baudrate = r.get_u32()?;
        self.databyte_usec = r.get_u32()?;
        Ok(())
    }
}

impl Serial {
    pub fn save_state(&self, state: &mut StateBuf) {
        let mut w = LumpWriter::new();
        w.put_bool(self.enabled);
        for u in &self.uart {
            u.save(&mut w);
        }
        for com in &self.portmap {
            w.put_u8(com.map_or(0xFF, |p| p as u8));
        }
        state.write_lump("serial", w.finish());
    }

    /// COM bindings in the restored state must already be installed on
    /// the bus; the machine re-binds before calling this.
    pub fn restore_state(&mut self, state: &mut StateBuf) -> Result<(), SaveStateError> {
        let mut r = state.read_lump("serial")?;
        self.enabled = r.get_bool()?;
        for u in self.uart.iter_mut() {
            u.restore(&mut r)?;
        }
        for com in self.portmap.iter_mut() {
            let p = r.get_u8()?;
            *com = if p == 0xFF { None } else { Some(p as usize) };
        }
        r.expect_end()
    }
}
