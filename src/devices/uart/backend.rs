//! Host-side backends for a serial port.
//!
//! A tagged variant instead of a trait object: each backend owns its
//! resources, dispatch is a `match`, and save-state never has to
//! serialise a vtable.  Backends that cannot be constructed on this
//! platform degrade to [`HostPort::Dummy`] with an error log.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use log::{debug, info};

use super::modem::ModemPort;
use super::mouse::MouseType;
use super::network::NetPort;

pub enum HostPort {
    /// No device: LCR probes fail, MSR floats low.
    None,
    /// A device is "present" but discards everything.
    Dummy,
    File(FilePort),
    #[cfg(unix)]
    Term(TermPort),
    Net(NetPort),
    Modem(ModemPort),
    Speech(SpeechPort),
    Mouse(MouseType),
}

impl HostPort {
    pub fn kind(&self) -> &'static str {
        match self {
            HostPort::None => "none",
            HostPort::Dummy => "dummy",
            HostPort::File(_) => "file",
            #[cfg(unix)]
            HostPort::Term(_) => "term",
            HostPort::Net(_) => "net",
            HostPort::Modem(_) => "modem",
            HostPort::Speech(_) => "speak",
            HostPort::Mouse(_) => "mouse",
        }
    }
}

// ── File sink ─────────────────────────────────────────────────

/// Raw byte dump to a host file, opened lazily on the first byte.
pub struct FilePort {
    path: PathBuf,
    out: Option<File>,
}

impl FilePort {
    pub fn new(path: PathBuf) -> Self {
        Self { path, out: None }
    }

    pub fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        if self.out.is_none() {
            self.out = Some(File::create(&self.path)?);
            info!("serial file: opened output '{}'", self.path.display());
        }
        let f = self.out.as_mut().unwrap();
        f.write_all(&[byte])?;
        f.flush()
    }
}

// ── POSIX tty passthrough ─────────────────────────────────────

/// Non-blocking raw-mode tty.  The original termios settings are
/// restored when the port is dropped.
#[cfg(unix)]
pub struct TermPort {
    fd: i32,
    term_orig: libc::termios,
}

#[cfg(unix)]
impl TermPort {
    pub fn open(dev: &str) -> io::Result<Self> {
        use std::ffi::CString;

        let cdev = CString::new(dev).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let fd = unsafe { libc::open(cdev.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK, 0o600) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut term_orig: libc::termios = unsafe { std::mem::zeroed() };
        unsafe {
            libc::tcgetattr(fd, &mut term_orig);
            let mut term_new = term_orig;
            term_new.c_iflag = 0;
            term_new.c_oflag = 0;
            term_new.c_cflag = libc::CS8 | libc::CREAD | libc::CLOCAL;
            term_new.c_lflag = 0;
            term_new.c_cc[libc::VMIN] = 1;
            term_new.c_cc[libc::VTIME] = 0;
            libc::tcsetattr(fd, libc::TCSAFLUSH, &term_new);
        }
        info!("serial term: opened tty on '{}' (fd {})", dev, fd);
        Ok(Self { fd, term_orig })
    }

    pub fn write_byte(&mut self, byte: u8) -> bool {
        let res = unsafe { libc::write(self.fd, &byte as *const u8 as *const _, 1) };
        if res != 1 {
            debug!("serial term: write failed");
            return false;
        }
        true
    }

    pub fn read_byte(&mut self) -> Option<u8> {
        let mut byte = 0u8;
        let res = unsafe { libc::read(self.fd, &mut byte as *mut u8 as *mut _, 1) };
        if res == 1 {
            Some(byte)
        } else {
            None
        }
    }
}

#[cfg(unix)]
impl Drop for TermPort {
    fn drop(&mut self) {
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSAFLUSH, &self.term_orig);
            libc::close(self.fd);
        }
    }
}

// ── Speech synthesiser feed ───────────────────────────────────

/// Collects phoneme bytes; a real synthesiser would consume the
/// buffer at flush marks.  Nothing is voiced here, the buffer is the
/// observable surface.
pub struct SpeechPort {
    phonemes: Vec<u8>,
}

impl Default for SpeechPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechPort {
    pub fn new() -> Self {
        Self {
            phonemes: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.phonemes.clear();
    }

    pub fn serial_write_byte(&mut self, byte: u8) -> bool {
        self.phonemes.push(byte);
        if byte == b'\r' {
            debug!("speech: utterance of {} bytes", self.phonemes.len());
            self.phonemes.clear();
        }
        true
    }

    pub fn serial_read_byte(&mut self) -> Option<u8> {
        None
    }

    pub fn buffered(&self) -> usize {
        self.phonemes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_port_opens_lazily_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("com1.bin");
        let mut fp = FilePort::new(path.clone());
        assert!(!path.exists());
        fp.write_byte(0x41).unwrap();
        fp.write_byte(0x42).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"AB");
    }

    #[test]
    fn speech_buffers_until_flush_mark() {
        let mut sp = SpeechPort::new();
        for b in b"HEH LOW" {
            sp.serial_write_byte(*b);
        }
        assert_eq!(sp.buffered(), 7);
        sp.serial_write_byte(b'\r');
        assert_eq!(sp.buffered(), 0);
    }
}
