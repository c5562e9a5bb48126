//! TCP host backend for a serial port.
//!
//! A client connects out, a server accepts exactly one peer at a time.
//! Socket I/O runs on background threads; the UART side only touches
//! two bounded byte queues.  The TX queue is flushed to the socket in
//! batches of `tx_threshold` bytes (or after `tx_delay_ms` of silence)
//! to approximate the latency of a real modem link.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

pub const DEFAULT_RX_FIFO_SIZE: usize = 2048;
pub const DEFAULT_TX_FIFO_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetMode {
    Client,
    Server,
}

pub struct NetPort {
    mode: NetMode,
    addr: String,
    rx: Receiver<u8>,
    tx: Sender<u8>,
    /// Socket-thread ends, handed over on (re)connect.
    rx_in: Sender<u8>,
    tx_out: Receiver<u8>,
    connected: Arc<AtomicBool>,
    /// A server saw an unanswered inbound connection (modem RING).
    ringing: Arc<AtomicBool>,
    stream: Arc<Mutex<Option<TcpStream>>>,
    tx_threshold: Arc<Mutex<usize>>,
    tx_delay_ms: f64,
    tcp_nodelay: bool,
}

impl NetPort {
    /// `addr` is `host:port`; port defaults to 2323 when missing.
    pub fn parse_address(dev: &str, default_port: u16) -> (String, u16) {
        match dev.rsplit_once(':') {
            Some((host, port)) => match port.parse() {
                Ok(p) => (host.to_string(), p),
                Err(_) => (dev.to_string(), default_port),
            },
            None => (dev.to_string(), default_port),
        }
    }

    pub fn new(addr: &str, mode: NetMode, tx_delay_ms: f64, tcp_nodelay: bool) -> Self {
        let (rx_in, rx) = bounded(DEFAULT_RX_FIFO_SIZE);
        let (tx, tx_out) = bounded(DEFAULT_TX_FIFO_SIZE);
        let port = Self {
            mode,
            addr: addr.to_string(),
            rx,
            tx,
            rx_in,
            tx_out,
            connected: Arc::new(AtomicBool::new(false)),
            ringing: Arc::new(AtomicBool::new(false)),
            stream: Arc::new(Mutex::new(None)),
            tx_threshold: Arc::new(Mutex::new(1)),
            tx_delay_ms,
            tcp_nodelay,
        };
        match mode {
            NetMode::Client => port.spawn_client(),
            NetMode::Server => port.spawn_server(),
        }
        port
    }

    /// Open a fresh outbound connection (modem ATD path).
    pub fn dial(&mut self, addr: &str) {
        self.addr = addr.to_string();
        self.spawn_client();
    }

    fn spawn_client(&self) {
        let addr = self.addr.clone();
        let connected = self.connected.clone();
        let stream_slot = self.stream.clone();
        let rx_in = self.rx_in.clone();
        let tx_out = self.tx_out.clone();
        let threshold = self.tx_threshold.clone();
        let tx_delay_ms = self.tx_delay_ms;
        let nodelay = self.tcp_nodelay;
        thread::Builder::new()
            .name("serial-net-client".into())
            .spawn(move || {
                info!("serial net: connecting to {}", addr);
                match TcpStream::connect(&addr) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(nodelay);
                        info!("serial net: connected to {}", addr);
                        run_connection(
                            stream, stream_slot, connected, rx_in, tx_out, threshold,
                            tx_delay_ms,
                        );
                    }
                    Err(e) => {
                        error!("serial net: cannot connect to {}: {}", addr, e);
                        connected.store(false, Ordering::SeqCst);
                    }
                }
            })
            .expect("spawn serial net thread");
    }

    fn spawn_server(&self) {
        let addr = self.addr.clone();
        let connected = self.connected.clone();
        let ringing = self.ringing.clone();
        let stream_slot = self.stream.clone();
        let rx_in = self.rx_in.clone();
        let tx_out = self.tx_out.clone();
        let threshold = self.tx_threshold.clone();
        let tx_delay_ms = self.tx_delay_ms;
        let nodelay = self.tcp_nodelay;
        thread::Builder::new()
            .name("serial-net-server".into())
            .spawn(move || {
                let listener = match TcpListener::bind(&addr) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("serial net: cannot listen on {}: {}", addr, e);
                        return;
                    }
                };
                info!("serial net: listening on {}", addr);
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            let _ = stream.set_nodelay(nodelay);
                            ringing.store(true, Ordering::SeqCst);
                            info!("serial net: peer connected");
                            run_connection(
                                stream,
                                stream_slot.clone(),
                                connected.clone(),
                                rx_in.clone(),
                                tx_out.clone(),
                                threshold.clone(),
                                tx_delay_ms,
                            );
                            ringing.store(false, Ordering::SeqCst);
                        }
                        Err(e) => {
                            warn!("serial net: accept failed: {}", e);
                            break;
                        }
                    }
                }
            })
            .expect("spawn serial net thread");
    }

    // ── UART-side queue access ────────────────────────────────

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_ringing(&self) -> bool {
        self.ringing.load(Ordering::SeqCst)
    }

    pub fn rx_pop(&self) -> Option<u8> {
        self.rx.try_recv().ok()
    }

    pub fn tx_push(&self, byte: u8) -> bool {
        match self.tx.try_send(byte) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn clear_queues(&self) {
        while self.rx.try_recv().is_ok() {}
        while self.tx_out.try_recv().is_ok() {}
    }

    /// Batch size approximating `tx_delay_ms` of line time at `baud`.
    pub fn set_tx_threshold(&self, tx_delay_ms: f64, baud: u32) {
        let bytes = (tx_delay_ms / 1000.0 * baud as f64 / 8.0).max(1.0) as usize;
        *self.tx_threshold.lock().unwrap() = bytes;
        debug!("serial net: tx threshold {} bytes ({} ms)", bytes, tx_delay_ms);
    }

    /// Drop the peer (modem ATH).
    pub fn hangup(&self) {
        if let Some(stream) = self.stream.lock().unwrap().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Pump one peer until either side goes away.  The writer half runs
/// inline here; a second thread feeds the RX queue.
#[allow(clippy::too_many_arguments)]
fn run_connection(
    stream: TcpStream,
    stream_slot: Arc<Mutex<Option<TcpStream>>>,
    connected: Arc<AtomicBool>,
    rx_in: Sender<u8>,
    tx_out: Receiver<u8>,
    threshold: Arc<Mutex<usize>>,
    tx_delay_ms: f64,
) {
    let reader = match stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("serial net: clone failed: {}", e);
            return;
        }
    };
    *stream_slot.lock().unwrap() = stream.try_clone().ok();
    connected.store(true, Ordering::SeqCst);

    let reader_connected = connected.clone();
    let reader_thread = thread::Builder::new()
        .name("serial-net-rx".into())
        .spawn(move || {
            let mut reader = reader;
            let mut buf = [0u8; 256];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        for &b in &buf[..n] {
                            // allow overflow on read: drop when full
                            let _ = rx_in.try_send(b);
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        })
        .expect("spawn serial net rx thread");

    // writer: batch to threshold, flush on idle
    let mut stream = stream;
    let flush_after = Duration::from_millis(tx_delay_ms.max(1.0) as u64);
    let mut batch: Vec<u8> = Vec::new();
    while connected.load(Ordering::SeqCst) {
        match tx_out.recv_timeout(flush_after) {
            Ok(b) => {
                batch.push(b);
                let th = *threshold.lock().unwrap();
                if batch.len() >= th {
                    if stream.write_all(&batch).is_err() {
                        break;
                    }
                    batch.clear();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if !batch.is_empty() {
                    if stream.write_all(&batch).is_err() {
                        break;
                    }
                    batch.clear();
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }

    connected.store(false, Ordering::SeqCst);
    stream_slot.lock().unwrap().take();
    let _ = stream.shutdown(std::net::Shutdown::Both);
    let _ = reader_thread.join();
    info!("serial net: peer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing_defaults_the_port() {
        assert_eq!(
            NetPort::parse_address("example.org:4000", 2323),
            ("example.org".to_string(), 4000)
        );
        assert_eq!(
            NetPort::parse_address("example.org", 2323),
            ("example.org".to_string(), 2323)
        );
    }

    #[test]
    fn loopback_roundtrip_through_sockets() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let echo = thread::spawn(move || {
            let (mut s, _) = listener.accept().unwrap();
            let mut buf = [0u8; 3];
            s.read_exact(&mut buf).unwrap();
            s.write_all(&buf).unwrap();
        });

        let net = NetPort::new(&addr.to_string(), NetMode::Client, 0.0, true);
        for _ in 0..50 {
            if net.is_connected() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(net.is_connected());
        for b in b"abc" {
            assert!(net.tx_push(*b));
        }
        let mut got = Vec::new();
        for _ in 0..100 {
            while let Some(b) = net.rx_pop() {
                got.push(b);
            }
            if got.len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(got, b"abc");
        echo.join().unwrap();
    }
}
