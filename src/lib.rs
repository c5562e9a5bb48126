//! Quartz — device-level emulation core for an IBM PS/1-class PC.
//!
//! The crate models the peripheral side of the machine: port-mapped
//! controllers (PIC, PIT, UARTs, floppy, ATA/ATAPI, Sound Blaster), the
//! DMA engine, and the virtual-time scheduling that drives them.  The
//! CPU core is an external collaborator: it calls [`machine::Machine`]'s
//! `io_read` / `io_write` / `iac` entry points, advances virtual time,
//! and observes the INTR line.

pub mod audio;
pub mod config;
pub mod devices;
pub mod error;
pub mod machine;
pub mod savestate;
