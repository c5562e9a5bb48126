//! Device implementations and the identifiers the buses dispatch on.
//!
//! The machine owns every chip as a plain struct field; the port and
//! DMA tables store [`DeviceId`] / [`DmaDevice`] discriminants and the
//! machine resolves them back to fields.  No trait objects, no back
//! pointers: save-state stays a byte copy.

pub mod ata;
pub mod floppy;
pub mod pic;
pub mod pit;
pub mod sblaster;
pub mod speaker;
pub mod uart;

/// Which chip a port table entry routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceId {
    Dma,
    Pic,
    /// Includes port 0x61 system control B (speaker gate, refresh).
    Pit,
    Serial,
    Fdc,
    /// ATA channel 0 or 1.
    Ata(usize),
    SBlaster,
}

impl DeviceId {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceId::Dma => "dma",
            DeviceId::Pic => "pic",
            DeviceId::Pit => "pit",
            DeviceId::Serial => "serial",
            DeviceId::Fdc => "fdc",
            DeviceId::Ata(_) => "ata",
            DeviceId::SBlaster => "sblaster",
        }
    }
}

/// Owner of a DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DmaDevice {
    #[default]
    None,
    Fdc,
    SBlaster,
}
