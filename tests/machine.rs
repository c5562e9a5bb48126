//! Whole-machine scenarios: the CPU-facing port interface drives the
//! assembled device subsystem through BIOS-like sequences.

use std::io::Write;

use quartz::config::MachineConfig;
use quartz::machine::clock::{MSEC, SEC, USEC};
use quartz::machine::Machine;

fn headless_config() -> MachineConfig {
    let mut cfg = MachineConfig::default();
    cfg.mixer_enabled = false;
    cfg
}

fn machine() -> Machine {
    Machine::new(&headless_config()).unwrap()
}

/// Standard POST init of the PIC pair, everything unmasked.
fn init_pic(m: &mut Machine) {
    for (port, value) in [
        (0x20, 0x11),
        (0x21, 0x08),
        (0x21, 0x04),
        (0x21, 0x01),
        (0xA0, 0x11),
        (0xA1, 0x70),
        (0xA1, 0x02),
        (0xA1, 0x01),
        (0x21, 0x00),
        (0xA1, 0x00),
    ] {
        m.io_write(port, 1, value);
    }
}

#[test]
fn s1_pic_init_and_serial_irq_vector() {
    let mut cfg = headless_config();
    cfg.serial[0].mode = "dummy".to_string();
    cfg.serial[0].com = 2; // COM2 -> IRQ 3
    let mut m = Machine::new(&cfg).unwrap();
    init_pic(&mut m);

    // 9600 baud, 8N1, loopback, RX data interrupt enabled
    m.io_write(0x2FB, 1, 0x80);
    m.io_write(0x2F8, 1, 12);
    m.io_write(0x2F9, 1, 0);
    m.io_write(0x2FB, 1, 0x03);
    m.io_write(0x2FC, 1, 0x18);
    m.io_write(0x2F9, 1, 0x01);
    m.io_write(0x2F8, 1, 0x41);

    m.run_for(2 * MSEC);
    assert!(m.intr());
    assert_eq!(m.iac(), 0x08 + 3);
    assert_eq!(m.io_read(0x2F8, 1), 0x41);
}

#[test]
fn s2_pit_mode2_period_is_4096_clk() {
    let mut m = machine();
    init_pic(&mut m);
    m.io_write(0x43, 1, 0x34);
    m.io_write(0x40, 1, 0x00);
    m.io_write(0x40, 1, 0x10); // count 4096

    // OUT pulses low at 4096 CLK (~3.433 ms), IRQ0 rises on reload
    m.run_for(3_432 * USEC);
    assert!(!m.intr());
    m.run_for(3 * USEC);
    assert!(m.intr());
    assert_eq!(m.iac(), 0x08);
}

#[test]
fn s3_uart_9600_baud_echo_after_1041us() {
    let mut cfg = headless_config();
    cfg.serial[0].com = 1;
    let mut m = Machine::new(&cfg).unwrap();
    init_pic(&mut m);

    m.io_write(0x3FB, 1, 0x80);
    m.io_write(0x3F8, 1, 12);
    m.io_write(0x3F9, 1, 0);
    m.io_write(0x3FB, 1, 0x03);
    m.io_write(0x3FC, 1, 0x10); // loopback
    m.io_write(0x3F8, 1, 0x41);

    m.run_for(1_040 * USEC);
    assert_eq!(m.io_read(0x3FD, 1) & 0x01, 0, "no data before a byte time");
    m.run_for(2 * USEC);
    assert_eq!(m.io_read(0x3FD, 1) & 0x01, 0x01);
    assert_eq!(m.io_read(0x3F8, 1), 0x41);
}

fn config_with_floppy(dir: &tempfile::TempDir) -> MachineConfig {
    let path = dir.path().join("a.img");
    let mut f = std::fs::File::create(&path).unwrap();
    // 1.44M blank with a patterned first sector
    let mut image = vec![0u8; 1_474_560];
    image[..512].iter_mut().enumerate().for_each(|(i, b)| *b = (i % 253) as u8);
    f.write_all(&image).unwrap();
    let mut cfg = headless_config();
    cfg.floppy_a.image = Some(path);
    cfg
}

#[test]
fn s4_fdc_recalibrate_then_sense_interrupt() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_with_floppy(&dir);
    let mut m = Machine::new(&cfg).unwrap();
    init_pic(&mut m);

    m.io_write(0x3F2, 1, 0x1C); // motor A on, no reset, DMA gate
    m.io_write(0x3F7, 1, 0x00); // 500 kbps
    m.io_write(0x3F5, 1, 0x07); // RECALIBRATE
    m.io_write(0x3F5, 1, 0x00);

    // a same-cylinder recalibrate still takes a step plus settling
    m.run_for(40 * MSEC);
    assert!(m.intr());
    assert_eq!(m.iac(), 0x08 + 6);

    m.io_write(0x3F5, 1, 0x08); // SENSE INTERRUPT
    assert_eq!(m.io_read(0x3F5, 1), 0x20); // ST0: seek end
    assert_eq!(m.io_read(0x3F5, 1), 0); // cylinder 0
}

#[test]
fn fdc_dma_read_delivers_sector_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config_with_floppy(&dir);
    let mut m = Machine::new(&cfg).unwrap();
    init_pic(&mut m);

    // program DMA channel 2: single mode, write transfer, 512 bytes
    // to physical 0x01000
    m.io_write(0x0B, 1, 0x46);
    m.io_write(0x0C, 1, 0x00);
    m.io_write(0x04, 1, 0x00);
    m.io_write(0x04, 1, 0x10);
    m.io_write(0x05, 1, 0xFF);
    m.io_write(0x05, 1, 0x01);
    m.io_write(0x81, 1, 0x00);
    m.io_write(0x0A, 1, 0x02);

    m.io_write(0x3F2, 1, 0x1C);
    m.io_write(0x3F7, 1, 0x00);
    // READ DATA: drive 0, C0 H0 S1, N=2, EOT=1
    for b in [0x06, 0x00, 0x00, 0x00, 0x01, 0x02, 0x01, 0x1B, 0xFF] {
        m.io_write(0x3F5, 1, b);
    }
    m.run_for(SEC);
    assert!(m.intr(), "completion IRQ after TC");
    assert_eq!(m.iac(), 0x08 + 6);
    // exactly one completion interrupt, DRQ dropped
    assert!(!m.intr());
    assert!(!m.dma.get_drq(2));

    for i in 0..512u32 {
        assert_eq!(m.memory.read_byte(0x1000 + i), (i % 253) as u8);
    }
    // 7 result bytes with normal termination
    let st0 = m.io_read(0x3F5, 1);
    assert_eq!(st0 & 0xC0, 0x00);
    for _ in 0..6 {
        m.io_read(0x3F5, 1);
    }
}

fn config_with_hdd(dir: &tempfile::TempDir) -> MachineConfig {
    let path = dir.path().join("c.img");
    let f = std::fs::File::create(&path).unwrap();
    f.set_len(40 * 4 * 17 * 512).unwrap();
    let mut cfg = headless_config();
    cfg.hdd.image = Some(path);
    cfg.hdd.cylinders = 40;
    cfg.hdd.heads = 4;
    cfg.hdd.spt = 17;
    cfg
}

#[test]
fn s5_ata_identify_device_words() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Machine::new(&config_with_hdd(&dir)).unwrap();
    init_pic(&mut m);
    m.run_for(2 * SEC); // spindle power-up

    m.io_write(0x1F6, 1, 0xA0);
    m.io_write(0x1F7, 1, 0xEC);
    assert_eq!(m.io_read(0x1F7, 1) & 0x08, 0x08, "DRQ after IDENTIFY");
    let mut words = [0u16; 256];
    for w in words.iter_mut() {
        *w = m.io_read(0x1F0, 2) as u16;
    }
    assert_eq!(words[0], 0x0040);
    assert_eq!(words[47], 16);
    let total = 40 * 4 * 17u32;
    assert_eq!(words[60] as u32 | (words[61] as u32) << 16, total);
}

#[test]
fn ata_write_read_idempotence_via_ports() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Machine::new(&config_with_hdd(&dir)).unwrap();
    init_pic(&mut m);
    m.run_for(2 * SEC);

    // WRITE SECTORS at LBA 34, 1 sector
    m.io_write(0x1F2, 1, 1);
    m.io_write(0x1F3, 1, 34);
    m.io_write(0x1F4, 1, 0);
    m.io_write(0x1F5, 1, 0);
    m.io_write(0x1F6, 1, 0xE0);
    m.io_write(0x1F7, 1, 0x30);
    m.run_for(SEC);
    assert_eq!(m.io_read(0x1F7, 1) & 0x08, 0x08);
    let payload: Vec<u16> = (0..256).map(|i| (i * 7 + 1) as u16).collect();
    for w in &payload {
        m.io_write(0x1F0, 2, *w as u32);
    }
    assert_eq!(m.io_read(0x1F7, 1) & 0x01, 0);

    // READ SECTORS back
    m.io_write(0x1F2, 1, 1);
    m.io_write(0x1F3, 1, 34);
    m.io_write(0x1F4, 1, 0);
    m.io_write(0x1F5, 1, 0);
    m.io_write(0x1F6, 1, 0xE0);
    m.io_write(0x1F7, 1, 0x20);
    m.run_for(SEC);
    assert_eq!(m.io_read(0x1F7, 1) & 0x08, 0x08);
    for w in &payload {
        assert_eq!(m.io_read(0x1F0, 2) as u16, *w);
    }
}

fn config_with_cdrom(dir: &tempfile::TempDir) -> MachineConfig {
    let path = dir.path().join("disc.iso");
    let f = std::fs::File::create(&path).unwrap();
    f.set_len(2048 * 300).unwrap();
    let mut cfg = headless_config();
    cfg.cdrom = true;
    cfg.cdrom_image = Some(path);
    cfg
}

#[test]
fn s6_atapi_inquiry_reports_removable_cdrom() {
    let dir = tempfile::tempdir().unwrap();
    let mut m = Machine::new(&config_with_cdrom(&dir)).unwrap();
    init_pic(&mut m);
    m.run_for(5 * SEC); // disc spin-up

    // clear the power-on unit attention
    m.io_write(0x1F6, 1, 0xA0);
    m.io_write(0x1F4, 1, 0xFE);
    m.io_write(0x1F5, 1, 0xFF);
    m.io_write(0x1F7, 1, 0xA0);
    for _ in 0..6 {
        m.io_write(0x1F0, 2, 0x0000); // TEST UNIT READY
    }
    m.run_for(100 * MSEC);

    // INQUIRY, 36 bytes
    m.io_write(0x1F4, 1, 0xFE);
    m.io_write(0x1F5, 1, 0xFF);
    m.io_write(0x1F7, 1, 0xA0);
    let cdb = [0x12u8, 0, 0, 0, 36, 0, 0, 0, 0, 0, 0, 0];
    for pair in cdb.chunks(2) {
        m.io_write(0x1F0, 2, pair[0] as u32 | (pair[1] as u32) << 8);
    }
    m.run_for(100 * MSEC);
    assert_eq!(m.io_read(0x1F7, 1) & 0x08, 0x08);
    let b0 = m.io_read(0x1F0, 2);
    assert_eq!(b0 & 0xFF, 0x05); // CD-ROM device
    assert_eq!(b0 >> 8, 0x80); // removable
}

#[test]
fn save_restore_preserves_device_registers() {
    let mut m = machine();
    init_pic(&mut m);
    m.io_write(0x21, 1, 0xA5); // master IMR
    m.io_write(0x43, 1, 0x34);
    m.io_write(0x40, 1, 0x34);
    m.io_write(0x40, 1, 0x12);
    m.io_write(0x3FF, 1, 0x77); // COM1 scratch
    m.run_for(MSEC);

    let mut state = m.save_state();

    // scramble
    m.io_write(0x21, 1, 0x00);
    m.io_write(0x3FF, 1, 0x00);

    m.restore_state(&mut state).unwrap();
    assert_eq!(m.io_read(0x21, 1), 0xA5);
    assert_eq!(m.io_read(0x3FF, 1), 0x77);
}

#[test]
fn sixteen_bit_access_decomposes_on_byte_ports() {
    let mut m = machine();
    // PIC data ports are 8-bit: a 16-bit read at 0x20 splits into
    // 0x20 and 0x21
    init_pic(&mut m);
    m.io_write(0x21, 1, 0x5A);
    let v = m.io_read(0x20, 2);
    assert_eq!(v >> 8, 0x5A);
}

#[test]
fn unmapped_ports_float_high_and_swallow_writes() {
    let mut m = machine();
    assert_eq!(m.io_read(0x0133, 1), 0xFF);
    assert_eq!(m.io_read(0x0133, 2), 0xFFFF);
    m.io_write(0x0133, 1, 0x42); // dropped
}

#[test]
fn duplicate_port_claims_fail_install() {
    let mut cfg = headless_config();
    // two sound blasters can't share 0x220; emulate the clash by
    // pointing the card at the PIT range instead
    cfg.sblaster_iobase = 0x40;
    assert!(Machine::new(&cfg).is_err());
}