//! Hayes-AT modem on top of the TCP backend.
//!
//! Command mode accumulates a line into the command buffer, echoes it
//! back when ATE1 (default), and emits numeric or verbose result
//! codes.  ATD dials the configured (or dialed) address as a TCP
//! connection; data mode passes bytes through until the +++ escape
//! with its one-second guard time on both sides.
//!
//! Supported commands: AT, ATA, ATD, ATE, ATH, ATI, ATO, ATV, ATZ,
//! ATS<n>=<v>, ATS<n>?, and the ignore-and-OK catch-all for the &/\\
//! prefixes legacy software loves to send.

use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, info};

use super::network::{NetMode, NetPort};
use super::ModemLines;

const GUARD_TIME_MS: u128 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModemMode {
    Command,
    Online,
}

pub struct ModemPort {
    net: NetPort,
    mode: ModemMode,
    cmd: String,
    echo: bool,
    verbose: bool,
    /// S-registers; S0 = auto-answer rings.
    sregs: [u8; 16],
    /// Bytes waiting for the guest (result codes, RING, echo).
    to_guest: VecDeque<u8>,
    /// +++ escape progress and guard timing.
    escape_count: u8,
    last_byte_at: Option<Instant>,
    dtr: bool,
    rts: bool,
    ringing_reported: bool,
    /// Peer was connected on the previous poll (drop detection).
    was_connected: bool,
}

impl ModemPort {
    /// `listen` is the optional listen address for inbound calls.
    pub fn new(listen: Option<&str>, tx_delay_ms: f64, tcp_nodelay: bool) -> Self {
        let addr = listen.unwrap_or("0.0.0.0:2323");
        let net = NetPort::new(addr, NetMode::Server, tx_delay_ms, tcp_nodelay);
        Self {
            net,
            mode: ModemMode::Command,
            cmd: String::new(),
            echo: true,
            verbose: true,
            sregs: [0; 16],
            to_guest: VecDeque::new(),
            escape_count: 0,
            last_byte_at: None,
            dtr: false,
            rts: false,
            ringing_reported: false,
            was_connected: false,
        }
    }

    pub fn reset(&mut self) {
        self.mode = ModemMode::Command;
        self.cmd.clear();
        self.echo = true;
        self.verbose = true;
        self.sregs = [0; 16];
        self.to_guest.clear();
        self.escape_count = 0;
        self.ringing_reported = false;
        self.net.hangup();
    }

    pub fn set_mcr(&mut self, dtr: bool, rts: bool) {
        // DTR drop hangs up (standard &D2 behavior)
        if self.dtr && !dtr && self.mode == ModemMode::Online {
            self.hangup_to_command(false);
        }
        self.dtr = dtr;
        self.rts = rts;
    }

    pub fn set_tx_threshold(&mut self, tx_delay_ms: f64, baud: u32) {
        self.net.set_tx_threshold(tx_delay_ms, baud);
    }

    /// Line states presented on the UART's MSR.
    pub fn lines(&self) -> ModemLines {
        ModemLines {
            cts: true,
            dsr: true,
            ri: self.net.is_connected() && self.mode == ModemMode::Command,
            dcd: self.mode == ModemMode::Online && self.net.is_connected(),
        }
    }

    /// Periodic state maintenance, run from the UART RX timer.
    pub fn poll(&mut self) {
        let connected = self.net.is_connected();
        if self.mode == ModemMode::Command {
            if connected && !self.ringing_reported {
                self.ringing_reported = true;
                self.emit_result("RING");
                debug!("modem: RING");
            } else if !connected {
                self.ringing_reported = false;
            }
        } else if self.mode == ModemMode::Online && self.was_connected && !connected {
            // carrier lost
            self.hangup_to_command(true);
        }
        self.was_connected = connected;
    }

    // ── Guest byte stream ─────────────────────────────────────

    pub fn serial_write_byte(&mut self, byte: u8) -> bool {
        match self.mode {
            ModemMode::Online => {
                // +++ escape: guard, three plusses, guard
                let now = Instant::now();
                let idle = self
                    .last_byte_at
                    .map_or(true, |t| now.duration_since(t).as_millis() >= GUARD_TIME_MS);
                if byte == b'+' && (self.escape_count > 0 || idle) {
                    self.escape_count += 1;
                    if self.escape_count == 3 {
                        self.escape_count = 0;
                        self.mode = ModemMode::Command;
                        self.emit_result("OK");
                        info!("modem: escaped to command mode");
                        self.last_byte_at = Some(now);
                        return true;
                    }
                } else {
                    // flush any withheld plusses
                    for _ in 0..self.escape_count {
                        self.net.tx_push(b'+');
                    }
                    self.escape_count = 0;
                    self.net.tx_push(byte);
                }
                self.last_byte_at = Some(now);
                true
            }
            ModemMode::Command => {
                if self.echo {
                    self.to_guest.push_back(byte);
                }
                match byte {
                    b'\r' => {
                        let line = std::mem::take(&mut self.cmd);
                        self.execute(line.trim());
                    }
                    0x08 | 0x7F => {
                        self.cmd.pop();
                    }
                    b => {
                        if self.cmd.len() < 128 {
                            self.cmd.push(b as char);
                        }
                    }
                }
                true
            }
        }
    }

    pub fn serial_read_byte(&mut self) -> Option<u8> {
        if let Some(b) = self.to_guest.pop_front() {
            return Some(b);
        }
        if self.mode == ModemMode::Online {
            return self.net.rx_pop();
        }
        None
    }

    // ── Command interpreter ───────────────────────────────────

    fn execute(&mut self, line: &str) {
        let upper = line.to_ascii_uppercase();
        if upper.is_empty() {
            return;
        }
        if !upper.starts_with("AT") {
            self.emit_result("ERROR");
            return;
        }
        debug!("modem: command \"{}\"", line);
        let body = &upper[2..];
        if body.is_empty() {
            self.emit_result("OK");
            return;
        }

        let mut chars = body.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                'D' => {
                    // dial: ATD, ATDT, ATDP; remainder is the address
                    let rest: String = chars.by_ref().collect();
                    let addr = rest
                        .trim_start_matches(['T', 'P'])
                        .trim()
                        .replace(';', "");
                    if addr.is_empty() {
                        self.emit_result("ERROR");
                    } else {
                        let (host, port) = NetPort::parse_address(&addr, 2323);
                        info!("modem: dialing {}:{}", host, port);
                        self.net.dial(&format!("{}:{}", host, port));
                        // connection status is picked up by poll();
                        // report optimistically like a blind dial
                        self.mode = ModemMode::Online;
                        self.emit_result("CONNECT");
                    }
                    return;
                }
                'A' => {
                    if self.net.is_connected() {
                        self.mode = ModemMode::Online;
                        self.emit_result("CONNECT");
                    } else {
                        self.emit_result("NO CARRIER");
                    }
                    return;
                }
                'H' => {
                    chars.next_if(|d| d.is_ascii_digit());
                    self.net.hangup();
                    self.mode = ModemMode::Command;
                    self.emit_result("OK");
                    return;
                }
                'O' => {
                    if self.net.is_connected() {
                        self.mode = ModemMode::Online;
                        self.emit_result("CONNECT");
                    } else {
                        self.emit_result("NO CARRIER");
                    }
                    return;
                }
                'E' => {
                    self.echo = chars.next_if(|d| d.is_ascii_digit()) != Some('0');
                }
                'V' => {
                    self.verbose = chars.next_if(|d| d.is_ascii_digit()) != Some('0');
                }
                'Z' => {
                    let echo = self.echo;
                    self.reset();
                    self.echo = echo;
                    self.emit_result("OK");
                    return;
                }
                'I' => {
                    chars.next_if(|d| d.is_ascii_digit());
                    self.emit_line("QUARTZ SOFT MODEM");
                }
                'S' => {
                    let num: String =
                        std::iter::from_fn(|| chars.next_if(|d| d.is_ascii_digit())).collect();
                    let reg = num.parse::<usize>().unwrap_or(0).min(self.sregs.len() - 1);
                    match chars.next() {
                        Some('=') => {
                            let val: String =
                                std::iter::from_fn(|| chars.next_if(|d| d.is_ascii_digit()))
                                    .collect();
                            self.sregs[reg] = val.parse().unwrap_or(0);
                        }
                        Some('?') => {
                            let v = format!("{:03}", self.sregs[reg]);
                            self.emit_line(&v);
                        }
                        _ => {
                            self.emit_result("ERROR");
                            return;
                        }
                    }
                }
                '&' | '\\' | '%' => {
                    // configuration prefixes: swallow one letter+digits
                    chars.next();
                    while chars.next_if(|d| d.is_ascii_digit()).is_some() {}
                }
                _ => { /* unknown single letters are tolerated */ }
            }
        }
        self.emit_result("OK");
    }

    fn hangup_to_command(&mut self, report: bool) {
        self.net.hangup();
        self.mode = ModemMode::Command;
        if report {
            self.emit_result("NO CARRIER");
            info!("modem: carrier lost");
        }
    }

    fn emit_result(&mut self, verbose_code: &str) {
        if self.verbose {
            self.emit_line(verbose_code);
        } else {
            let num = match verbose_code {
                "OK" => "0",
                "CONNECT" => "1",
                "RING" => "2",
                "NO CARRIER" => "3",
                "ERROR" => "4",
                _ => "4",
            };
            for b in num.bytes() {
                self.to_guest.push_back(b);
            }
            self.to_guest.push_back(b'\r');
        }
    }

    fn emit_line(&mut self, text: &str) {
        self.to_guest.push_back(b'\r');
        self.to_guest.push_back(b'\n');
        for b in text.bytes() {
            self.to_guest.push_back(b);
        }
        self.to_guest.push_back(b'\r');
        self.to_guest.push_back(b'\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(modem: &mut ModemPort) -> String {
        let mut s = Vec::new();
        while let Some(b) = modem.serial_read_byte() {
            s.push(b);
        }
        String::from_utf8_lossy(&s).to_string()
    }

    fn send(modem: &mut ModemPort, line: &str) {
        for b in line.bytes() {
            modem.serial_write_byte(b);
        }
        modem.serial_write_byte(b'\r');
    }

    #[test]
    fn at_returns_ok_with_echo() {
        let mut m = ModemPort::new(Some("127.0.0.1:0"), 0.0, true);
        send(&mut m, "AT");
        let out = drain(&mut m);
        assert!(out.starts_with("AT\r"));
        assert!(out.contains("OK"));
    }

    #[test]
    fn ate0_disables_echo() {
        let mut m = ModemPort::new(Some("127.0.0.1:0"), 0.0, true);
        send(&mut m, "ATE0");
        drain(&mut m);
        send(&mut m, "AT");
        let out = drain(&mut m);
        assert!(!out.contains("ATE"));
        assert!(out.contains("OK"));
    }

    #[test]
    fn sregister_write_and_query() {
        let mut m = ModemPort::new(Some("127.0.0.1:0"), 0.0, true);
        send(&mut m, "ATS0=2");
        drain(&mut m);
        send(&mut m, "ATS0?");
        let out = drain(&mut m);
        assert!(out.contains("002"));
    }

    #[test]
    fn non_at_garbage_errors() {
        let mut m = ModemPort::new(Some("127.0.0.1:0"), 0.0, true);
        send(&mut m, "BT");
        let out = drain(&mut m);
        assert!(out.contains("ERROR"));
    }

    #[test]
    fn ata_without_carrier_reports_no_carrier() {
        let mut m = ModemPort::new(Some("127.0.0.1:0"), 0.0, true);
        send(&mut m, "ATA");
        let out = drain(&mut m);
        assert!(out.contains("NO CARRIER"));
    }

    #[test]
    fn numeric_result_codes_when_atv0() {
        let mut m = ModemPort::new(Some("127.0.0.1:0"), 0.0, true);
        send(&mut m, "ATV0");
        drain(&mut m);
        send(&mut m, "AT");
        let out = drain(&mut m);
        assert!(out.contains('0'));
        assert!(!out.contains("OK"));
    }
}
