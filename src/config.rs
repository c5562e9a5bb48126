//! Persistent machine configuration.
//! Stored as JSON; a missing or invalid file falls back to defaults.

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info};
use serde::{Deserialize, Serialize};

use crate::devices::ata::cdrom::CdRomDrive;
use crate::devices::ata::storage::{DrivePerformance, HardDisk, MediaGeometry};
use crate::devices::ata::AtaDevice;
use crate::devices::floppy::disk::{FloppyDisk, FloppyDrive, FloppyType};
use crate::devices::uart::backend::{FilePort, HostPort, SpeechPort};
use crate::devices::uart::modem::ModemPort;
use crate::devices::uart::mouse::MouseType;
use crate::devices::uart::network::{NetMode, NetPort};
use crate::devices::uart::SER_PORTS;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// "none", "dummy", "file", "term", "net-client", "net-server",
    /// "pipe-client", "pipe-server", "modem", "speak" or "mouse".
    pub mode: String,
    /// Device path or host:port, depending on the mode.
    pub dev: String,
    /// COM number this host port binds to (1-4), 0 = unbound.
    pub com: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            mode: "none".to_string(),
            dev: String::new(),
            com: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FloppyConfig {
    /// Drive hardware: "none", "3.5" or "5.25".
    pub drive: String,
    /// Media type: "auto" sizes from the image file.
    pub disk_type: String,
    pub image: Option<PathBuf>,
    pub write_protected: bool,
}

impl Default for FloppyConfig {
    fn default() -> Self {
        Self {
            drive: "none".to_string(),
            disk_type: "auto".to_string(),
            image: None,
            write_protected: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HddConfig {
    pub image: Option<PathBuf>,
    pub cylinders: u32,
    pub heads: u32,
    pub spt: u32,
}

impl Default for HddConfig {
    fn default() -> Self {
        Self {
            image: None,
            cylinders: 615,
            heads: 4,
            spt: 17,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub ram_kb: u32,

    pub floppy_a: FloppyConfig,
    pub floppy_b: FloppyConfig,
    /// Rotational latency scale, 0.0 (none) to 1.0 (realistic).
    pub fdd_latency: f64,

    pub hdd: HddConfig,
    pub cdrom: bool,
    pub cdrom_image: Option<PathBuf>,

    pub serial: [SerialConfig; SER_PORTS],
    pub serial_tx_delay_ms: f64,
    pub tcp_nodelay: bool,

    pub sblaster_iobase: u16,
    pub sblaster_irq: usize,
    pub sblaster_dma: usize,

    /// Spawn the mixer thread (off for headless test runs).
    pub mixer_enabled: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_kb: 2048,
            floppy_a: FloppyConfig {
                drive: "3.5".to_string(),
                ..FloppyConfig::default()
            },
            floppy_b: FloppyConfig::default(),
            fdd_latency: 1.0,
            hdd: HddConfig::default(),
            cdrom: false,
            cdrom_image: None,
            serial: [
                SerialConfig {
                    mode: "dummy".to_string(),
                    com: 1,
                    ..SerialConfig::default()
                },
                SerialConfig::default(),
                SerialConfig::default(),
                SerialConfig::default(),
            ],
            serial_tx_delay_ms: 20.0,
            tcp_nodelay: true,
            sblaster_iobase: 0x220,
            sblaster_irq: 5,
            sblaster_dma: 1,
            mixer_enabled: true,
        }
    }
}

impl MachineConfig {
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(cfg) => {
                    info!("loaded configuration from '{}'", path.display());
                    cfg
                }
                Err(e) => {
                    error!("invalid config '{}': {}; using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, path: &Path) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = fs::write(path, json) {
                    error!("cannot write config '{}': {}", path.display(), e);
                }
            }
            Err(e) => error!("cannot serialize config: {}", e),
        }
    }

    // ── Machine assembly helpers ──────────────────────────────

    pub fn serial_backends(&self) -> Result<[HostPort; SER_PORTS], ConfigError> {
        let mut out: [HostPort; SER_PORTS] =
            [HostPort::None, HostPort::None, HostPort::None, HostPort::None];
        for (p, cfg) in self.serial.iter().enumerate() {
            out[p] = match cfg.mode.as_str() {
                "none" => HostPort::None,
                "dummy" => HostPort::Dummy,
                "file" => {
                    if cfg.dev.is_empty() {
                        return Err(ConfigError::InvalidSerialBackend(
                            p,
                            "file mode needs a path".to_string(),
                        ));
                    }
                    HostPort::File(FilePort::new(PathBuf::from(&cfg.dev)))
                }
                #[cfg(unix)]
                "term" => {
                    use crate::devices::uart::backend::TermPort;
                    match TermPort::open(&cfg.dev) {
                        Ok(t) => HostPort::Term(t),
                        Err(e) => {
                            error!("serial {}: term open failed ({}), dummy instead", p, e);
                            HostPort::Dummy
                        }
                    }
                }
                "net-client" => {
                    let (host, port) = NetPort::parse_address(&cfg.dev, 2323);
                    HostPort::Net(NetPort::new(
                        &format!("{}:{}", host, port),
                        NetMode::Client,
                        self.serial_tx_delay_ms,
                        self.tcp_nodelay,
                    ))
                }
                "net-server" => {
                    let (host, port) = NetPort::parse_address(&cfg.dev, 2323);
                    HostPort::Net(NetPort::new(
                        &format!("{}:{}", host, port),
                        NetMode::Server,
                        self.serial_tx_delay_ms,
                        self.tcp_nodelay,
                    ))
                }
                // named pipes have no portable host plumbing here
                "pipe-client" | "pipe-server" => {
                    error!("serial {}: pipe mode not supported, dummy instead", p);
                    HostPort::Dummy
                }
                "modem" => HostPort::Modem(ModemPort::new(
                    if cfg.dev.is_empty() { None } else { Some(&cfg.dev) },
                    self.serial_tx_delay_ms,
                    self.tcp_nodelay,
                )),
                "speak" => HostPort::Speech(SpeechPort::new()),
                "mouse" => HostPort::Mouse(MouseType::Microsoft),
                "mouse-wheel" => HostPort::Mouse(MouseType::Wheel),
                "mouse-msys" => HostPort::Mouse(MouseType::MouseSystems),
                other => {
                    return Err(ConfigError::InvalidSerialBackend(p, other.to_string()));
                }
            };
        }
        Ok(out)
    }

    pub fn serial_com_bindings(&self) -> [Option<usize>; SER_PORTS] {
        let mut out = [None; SER_PORTS];
        for (p, cfg) in self.serial.iter().enumerate() {
            if (1..=4).contains(&cfg.com) {
                out[p] = Some(cfg.com - 1);
            }
        }
        out
    }

    pub fn floppy_drives(&self) -> Result<[FloppyDrive; 2], ConfigError> {
        let parse = |s: &str| {
            FloppyDrive::from_str(s).ok_or_else(|| ConfigError::InvalidDriveType(s.to_string()))
        };
        Ok([parse(&self.floppy_a.drive)?, parse(&self.floppy_b.drive)?])
    }

    pub fn floppy_media(&self) -> Result<[Option<FloppyDisk>; 2], ConfigError> {
        let open = |cfg: &FloppyConfig| -> Result<Option<FloppyDisk>, ConfigError> {
            let path = match &cfg.image {
                Some(p) => p,
                None => return Ok(None),
            };
            let drive = FloppyDrive::from_str(&cfg.drive)
                .ok_or_else(|| ConfigError::InvalidDriveType(cfg.drive.clone()))?;
            let disk_type = if cfg.disk_type == "auto" {
                let size = fs::metadata(path)
                    .map_err(|_| ConfigError::MissingImage(path.clone()))?
                    .len();
                FloppyType::from_size(size).ok_or_else(|| ConfigError::BadImage {
                    path: path.clone(),
                    reason: format!("image size {} matches no media type", size),
                })?
            } else {
                FloppyType::from_str(&cfg.disk_type)
                    .ok_or_else(|| ConfigError::InvalidDriveType(cfg.disk_type.clone()))?
            };
            Ok(Some(FloppyDisk::open(
                drive,
                disk_type,
                path,
                cfg.write_protected,
            )?))
        };
        Ok([open(&self.floppy_a)?, open(&self.floppy_b)?])
    }

    /// PS/1 layout: HDD at ATA0:0, CD-ROM in the next free slot.
    pub fn ata_devices(&self) -> Result<[[AtaDevice; 2]; 2], ConfigError> {
        let mut slot0 = AtaDevice::None;
        let mut slot1 = AtaDevice::None;
        if let Some(image) = &self.hdd.image {
            let geometry = MediaGeometry {
                cylinders: self.hdd.cylinders,
                heads: self.hdd.heads,
                spt: self.hdd.spt,
                wpcomp: -1,
                lzone: self.hdd.cylinders,
            };
            slot0 = AtaDevice::Hdd(HardDisk::open(
                image,
                geometry,
                DrivePerformance::default(),
            )?);
        }
        if self.cdrom {
            let mut cd = CdRomDrive::new();
            if let Some(iso) = &self.cdrom_image {
                cd.insert_iso(iso, 0)?;
            }
            let cd = AtaDevice::Cdrom(cd);
            if matches!(slot0, AtaDevice::None) {
                slot0 = cd;
            } else {
                slot1 = cd;
            }
        }
        Ok([[slot0, slot1], [AtaDevice::None, AtaDevice::None]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_roundtrip_through_json() {
        let cfg = MachineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MachineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ram_kb, 2048);
        assert_eq!(back.serial[0].mode, "dummy");
        assert_eq!(back.sblaster_iobase, 0x220);
    }

    #[test]
    fn load_tolerates_missing_and_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let cfg = MachineConfig::load(&missing);
        assert_eq!(cfg.ram_kb, 2048);
        let garbage = dir.path().join("bad.json");
        fs::write(&garbage, "{not json").unwrap();
        let cfg = MachineConfig::load(&garbage);
        assert_eq!(cfg.ram_kb, 2048);
    }

    #[test]
    fn unknown_serial_mode_is_an_install_error() {
        let mut cfg = MachineConfig::default();
        cfg.serial[1].mode = "teletype".to_string();
        assert!(cfg.serial_backends().is_err());
    }

    #[test]
    fn com_bindings_are_one_based() {
        let mut cfg = MachineConfig::default();
        cfg.serial[0].com = 1;
        cfg.serial[1].com = 2;
        let bind = cfg.serial_com_bindings();
        assert_eq!(bind[0], Some(0));
        assert_eq!(bind[1], Some(1));
        assert_eq!(bind[2], None);
    }
}
