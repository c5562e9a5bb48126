//! I/O port dispatcher.
//!
//! Two flat tables (read and write) map every port to the owning chip
//! plus an access mask.  Registration is declarative: each device
//! publishes `(from, to, mask)` ranges, install claims them, remove
//! releases them.  Claiming a port that another device already holds
//! with the same intent is a configuration error.

use log::warn;

use crate::devices::DeviceId;
use crate::error::ConfigError;

// ── Access mask bits ──────────────────────────────────────────

pub const PORT_8BIT: u8 = 0x01;
pub const PORT_16BIT: u8 = 0x02;
pub const PORT_32BIT: u8 = 0x04;
pub const PORT_READ: u8 = 0x08;
pub const PORT_WRITE: u8 = 0x10;
pub const PORT_RW: u8 = PORT_READ | PORT_WRITE;

/// One entry of a device's published port table.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
    pub mask: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct PortEntry {
    pub device: DeviceId,
    pub mask: u8,
}

pub struct IoBus {
    read: Vec<Option<PortEntry>>,
    write: Vec<Option<PortEntry>>,
}

impl Default for IoBus {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBus {
    pub fn new() -> Self {
        Self {
            read: vec![None; 0x10000],
            write: vec![None; 0x10000],
        }
    }

    /// Claim a device's whole port table.  On conflict nothing is
    /// rolled back; install aborts and the machine is discarded.
    pub fn register(&mut self, device: DeviceId, ranges: &[PortRange]) -> Result<(), ConfigError> {
        for r in ranges {
            for port in r.from..=r.to {
                if r.mask & PORT_READ != 0 {
                    if let Some(prev) = self.read[port as usize] {
                        return Err(ConfigError::PortAlreadyBound {
                            port,
                            owner: prev.device.name(),
                        });
                    }
                    self.read[port as usize] = Some(PortEntry {
                        device,
                        mask: r.mask,
                    });
                }
                if r.mask & PORT_WRITE != 0 {
                    if let Some(prev) = self.write[port as usize] {
                        return Err(ConfigError::PortAlreadyBound {
                            port,
                            owner: prev.device.name(),
                        });
                    }
                    self.write[port as usize] = Some(PortEntry {
                        device,
                        mask: r.mask,
                    });
                }
            }
        }
        Ok(())
    }

    /// Release every port a device holds.  Combined with `register`
    /// this is the atomic rebind used for POS-style reconfiguration.
    pub fn unregister(&mut self, device: DeviceId) {
        for e in self.read.iter_mut().chain(self.write.iter_mut()) {
            if matches!(e, Some(p) if p.device == device) {
                *e = None;
            }
        }
    }

    pub fn read_handler(&self, port: u16) -> Option<PortEntry> {
        self.read[port as usize]
    }

    pub fn write_handler(&self, port: u16) -> Option<PortEntry> {
        self.write[port as usize]
    }

    /// Policy for an access that matched no handler.
    pub fn open_bus_read(port: u16, width: u8) -> u32 {
        warn!("unhandled read from port 0x{:04X} ({}b)", port, width * 8);
        match width {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    pub fn open_bus_write(port: u16, width: u8, value: u32) {
        warn!(
            "unhandled write to port 0x{:04X} ({}b) <- 0x{:X}",
            port,
            width * 8,
            value
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_claims_fail() {
        let mut bus = IoBus::new();
        bus.register(
            DeviceId::Pit,
            &[PortRange {
                from: 0x40,
                to: 0x43,
                mask: PORT_8BIT | PORT_RW,
            }],
        )
        .unwrap();
        let err = bus
            .register(
                DeviceId::Fdc,
                &[PortRange {
                    from: 0x43,
                    to: 0x47,
                    mask: PORT_8BIT | PORT_RW,
                }],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::PortAlreadyBound { port: 0x43, .. }
        ));
    }

    #[test]
    fn unregister_releases_ports() {
        let mut bus = IoBus::new();
        let table = [PortRange {
            from: 0x3F8,
            to: 0x3FF,
            mask: PORT_8BIT | PORT_RW,
        }];
        bus.register(DeviceId::Serial, &table).unwrap();
        bus.unregister(DeviceId::Serial);
        assert!(bus.read_handler(0x3F8).is_none());
        bus.register(DeviceId::Serial, &table).unwrap();
    }

    #[test]
    fn read_and_write_tables_are_independent() {
        let mut bus = IoBus::new();
        bus.register(
            DeviceId::Fdc,
            &[PortRange {
                from: 0x3F4,
                to: 0x3F4,
                mask: PORT_8BIT | PORT_READ,
            }],
        )
        .unwrap();
        bus.register(
            DeviceId::Pit,
            &[PortRange {
                from: 0x3F4,
                to: 0x3F4,
                mask: PORT_8BIT | PORT_WRITE,
            }],
        )
        .unwrap();
        assert_eq!(bus.read_handler(0x3F4).unwrap().device, DeviceId::Fdc);
        assert_eq!(bus.write_handler(0x3F4).unwrap().device, DeviceId::Pit);
    }
}
