//! ATA opcode handlers.
//!
//! Each handler returns the command execution time in µs; the caller
//! arms the slot's command timer with it (0 means the command already
//! completed or aborted).  Unlisted opcodes abort with ERR+ABRT, which
//! is all the guest needs to move on.

use log::debug;

use super::storage::SECTOR_SIZE;
use super::*;

/// The ATA specification level reported by IDENTIFY DEVICE.
const ATA_VERSION: u16 = 6;

impl StorageCtrlAta {
    pub(super) fn dispatch_ata_command(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        match cmd {
            0x10 => self.ata_cmd_calibrate_drive(ch, cmd, ctx),
            0x20 | 0x21 | 0x24 | 0x29 | 0xC4 => self.ata_cmd_read_sectors(ch, cmd, ctx),
            0x30 | 0x31 | 0x34 | 0x39 | 0xC5 => self.ata_cmd_write_sectors(ch, cmd, ctx),
            0x40 | 0x41 | 0x42 => self.ata_cmd_read_verify_sectors(ch, cmd, ctx),
            0x70 => self.ata_cmd_seek(ch, cmd, ctx),
            0x90 => self.ata_cmd_execute_device_diagnostic(ch, cmd, ctx),
            0x91 => self.ata_cmd_initialize_drive_parameters(ch, cmd, ctx),
            0xEC => self.ata_cmd_identify_device(ch, cmd, ctx),
            0xEF => self.ata_cmd_set_features(ch, cmd, ctx),
            0xC6 => self.ata_cmd_set_multiple_mode(ch, cmd, ctx),
            0xA1 => self.ata_cmd_identify_packet_device(ch, cmd, ctx),
            0x08 => self.ata_cmd_device_reset(ch, cmd, ctx),
            0xA0 => self.ata_cmd_send_packet(ch, cmd, ctx),
            0xE0 | 0xE1 | 0xE7 | 0xEA => self.ata_cmd_power_stubs(ch, cmd, ctx),
            0xE5 => self.ata_cmd_check_power_mode(ch, cmd, ctx),
            0x27 | 0xF8 => self.ata_cmd_read_native_max_address(ch, cmd, ctx),
            _ => {
                debug!("ATA{}: command 0x{:02X} not implemented", ch, cmd);
                self.command_aborted(ch, cmd, ctx);
                0
            }
        }
    }

    fn ata_cmd_calibrate_drive(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            debug!("ATA{}: CALIBRATE issued to non-disk", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        // move head to cylinder 0, issue IRQ on completion
        self.sel(ch).drive.next_lba = 0;
        self.sel(ch).controller.cylinder_no = 0;
        let now_us = ctx.now_us();
        let seek_time = self.seek(ch, now_us + CALIB_CMD_US as u64);
        CALIB_CMD_US + seek_time
    }

    fn ata_cmd_read_sectors(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            debug!("ATA{}: READ SECTORS issued to non-disk", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        {
            // Win98 probes 0/0/0 in CHS mode
            let c = &self.sel_ref(ch).controller;
            if !c.lba_mode && c.head_no == 0 && c.cylinder_no == 0 && c.sector_no == 0 {
                debug!("ATA{}: read from 0/0/0, aborting", ch);
                self.command_aborted(ch, cmd, ctx);
                return 0;
            }
        }
        let lba48 = cmd == 0x24 || cmd == 0x29;
        self.lba48_transform(ch, lba48);
        let logical_sector = self.calculate_logical_address(ch);
        if logical_sector < 0 {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        self.sel(ch).drive.next_lba = logical_sector;
        debug!(
            "ATA{}: reading {} sector(s) at lba={}",
            ch,
            self.sel_ref(ch).controller.num_sectors,
            logical_sector
        );
        let cmd_time = DEFAULT_CMD_US + CTRL_OVERH_US;
        self.ata_read_next_block(ch, cmd_time, ctx)
    }

    /// Stage the next block of a read into the controller buffer and
    /// compute its full (seek + rotation + media) time.
    pub(super) fn ata_read_next_block(&mut self, ch: usize, cmd_time: u32, ctx: &mut DevCtx) -> u32 {
        let current = self.sel_ref(ch).controller.current_command;
        let mut xfer_amount = 1u32;
        if current == 0xC4 || current == 0x29 {
            // READ MULTIPLE
            let (multiple, num) = {
                let c = &self.sel_ref(ch).controller;
                (c.multiple_sectors, c.num_sectors)
            };
            if multiple == 0 {
                self.command_aborted(ch, current, ctx);
                return 0;
            }
            xfer_amount = num.min(multiple);
        }
        {
            let c = &mut self.sel(ch).controller;
            c.buffer_size = xfer_amount as usize * SECTOR_SIZE;
            c.buffer_index = 0;
        }
        let now = ctx.now_us() + cmd_time as u64;
        let seek_time = self.seek(ch, now);
        let xfer_time = {
            let slot = self.sel(ch);
            let next_lba = slot.drive.next_lba;
            let look_ahead = slot.controller.look_ahead_time_us;
            match &mut slot.device {
                AtaDevice::Hdd(h) => {
                    h.transfer_time_us(now + seek_time as u64, next_lba, xfer_amount, look_ahead)
                }
                _ => 0,
            }
        };
        let exec_time = cmd_time + seek_time + xfer_time;
        let size = self.sel_ref(ch).controller.buffer_size;
        if self.ata_tx_sectors(ch, false, size).is_err() {
            self.command_aborted(ch, current, ctx);
            return 0;
        }
        exec_time
    }

    fn ata_cmd_read_verify_sectors(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            debug!("ATA{}: READ VERIFY issued to non-disk", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let lba48 = cmd == 0x42;
        self.lba48_transform(ch, lba48);
        let logical_sector = self.calculate_logical_address(ch);
        if logical_sector < 0 {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        self.sel(ch).drive.next_lba = logical_sector;
        let cmd_time = DEFAULT_CMD_US + CTRL_OVERH_US;
        let now = ctx.now_us() + cmd_time as u64;
        let seek_time = self.seek(ch, now);
        let read_time = {
            let slot = self.sel(ch);
            let num = slot.controller.num_sectors;
            let look_ahead = slot.controller.look_ahead_time_us;
            match &mut slot.device {
                AtaDevice::Hdd(h) => {
                    h.transfer_time_us(now + seek_time as u64, logical_sector, num, look_ahead)
                }
                _ => 0,
            }
        };
        cmd_time + seek_time + read_time
    }

    fn ata_cmd_write_sectors(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            debug!("ATA{}: WRITE SECTORS issued to non-disk", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let lba48 = cmd == 0x34 || cmd == 0x39;
        self.lba48_transform(ch, lba48);

        let mut xfer_amount = 1u32;
        if cmd == 0xC5 || cmd == 0x39 {
            // WRITE MULTIPLE
            let (multiple, num) = {
                let c = &self.sel_ref(ch).controller;
                (c.multiple_sectors, c.num_sectors)
            };
            if multiple == 0 {
                self.command_aborted(ch, cmd, ctx);
                return 0;
            }
            xfer_amount = num.min(multiple);
        }
        {
            let c = &mut self.sel(ch).controller;
            c.buffer_size = xfer_amount as usize * SECTOR_SIZE;
            c.buffer_index = 0;
        }
        let logical_sector = self.calculate_logical_address(ch);
        if logical_sector < 0 {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        self.sel(ch).drive.next_lba = logical_sector;
        debug!("ATA{}: writing sectors at lba={}", ch, logical_sector);
        let now_us = ctx.now_us();
        let cmd_time = DEFAULT_CMD_US + CTRL_OVERH_US;
        let seek_time = self.seek(ch, now_us);
        cmd_time + seek_time
    }

    /// Re-open the DRQ window for the next block of a write.
    pub(super) fn ata_write_next_block(&mut self, ch: usize, ctx: &mut DevCtx) {
        let current = self.sel_ref(ch).controller.current_command;
        let mut xfer_amount = 1u32;
        if current == 0xC5 || current == 0x39 {
            let (multiple, num) = {
                let c = &self.sel_ref(ch).controller;
                (c.multiple_sectors, c.num_sectors)
            };
            if multiple == 0 {
                self.command_aborted(ch, current, ctx);
                return;
            }
            xfer_amount = num.min(multiple);
        }
        let c = &mut self.sel(ch).controller;
        c.buffer_size = xfer_amount as usize * SECTOR_SIZE;
        c.buffer_index = 0;
    }

    fn ata_cmd_execute_device_diagnostic(&mut self, ch: usize, _cmd: u8, _ctx: &mut DevCtx) -> u32 {
        let slave_selected = self.channels[ch].drive_select;
        self.set_signature(ch, slave_selected);
        DEFAULT_CMD_US + CTRL_OVERH_US
    }

    fn ata_cmd_initialize_drive_parameters(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            debug!("ATA{}: INITIALIZE DRIVE PARAMETERS issued to non-disk", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let (spt, heads) = match &self.sel_ref(ch).device {
            AtaDevice::Hdd(h) => (h.geometry.spt, h.geometry.heads),
            _ => unreachable!(),
        };
        let c = &self.sel_ref(ch).controller;
        if c.sector_count as u32 != spt {
            debug!(
                "ATA{}: logical sector count {} not supported",
                ch, c.sector_count
            );
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        if c.head_no == 0 {
            // Linux 2.6 sends 0 and doesn't tolerate an abort
            debug!("ATA{}: max. logical head number 0 not supported", ch);
        } else if c.head_no as u32 != heads - 1 {
            debug!("ATA{}: max. logical head number {} not supported", ch, c.head_no);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        0
    }

    fn ata_cmd_identify_device(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_present(ch) {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        if self.selected_is_cd(ch) {
            // a packet device answers with its signature and aborts
            let dev = self.channels[ch].drive_select;
            self.set_signature(ch, dev);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        if self.sel_ref(ch).drive.identify.is_none() {
            self.identify_ata_device(ch);
        }
        let slot = self.sel(ch);
        let id = slot.drive.identify.as_ref().unwrap();
        for (i, word) in id.iter().enumerate() {
            slot.controller.buffer[i * 2] = *word as u8;
            slot.controller.buffer[i * 2 + 1] = (*word >> 8) as u8;
        }
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        self.sel(ch).controller.status.drq = true;
        0
    }

    fn ata_cmd_set_features(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        let features = self.sel_ref(ch).controller.features;
        match features {
            0x03 => {
                // Set Transfer Mode; busmastering DMA is not wired on
                // this board so only the mode bookkeeping is kept
                self.sel(ch).drive.identify = None;
                let sector_count = self.sel_ref(ch).controller.sector_count;
                let mode_type = sector_count >> 3;
                let mode = sector_count & 0x07;
                let c = &mut self.sel(ch).controller;
                match mode_type {
                    0x00 | 0x01 => {
                        debug!("ATA{}: set transfer mode to PIO", ch);
                        c.mdma_mode = 0;
                        c.udma_mode = 0;
                    }
                    0x04 => {
                        debug!("ATA{}: set transfer mode to MDMA{}", ch, mode);
                        c.mdma_mode = 1 << mode;
                        c.udma_mode = 0;
                    }
                    0x08 => {
                        debug!("ATA{}: set transfer mode to UDMA{}", ch, mode);
                        c.mdma_mode = 0;
                        c.udma_mode = 1 << mode;
                    }
                    t => {
                        debug!("ATA{}: unknown transfer mode type 0x{:02X}", ch, t);
                        self.command_aborted(ch, cmd, ctx);
                        return 0;
                    }
                }
            }
            0x02 | 0x82 | 0xAA | 0x55 | 0xCC | 0x66 => {
                debug!(
                    "ATA{}: SET FEATURES subcommand 0x{:02X} not supported, returning success",
                    ch, features
                );
            }
            _ => {
                debug!("ATA{}: SET FEATURES unknown subcommand 0x{:02X}", ch, features);
                self.command_aborted(ch, cmd, ctx);
                return 0;
            }
        }
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        0
    }

    fn ata_cmd_set_multiple_mode(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let count = self.sel_ref(ch).controller.sector_count as u32;
        if count > ATA_MAX_MULTIPLE_SECTORS || count == 0 || count & (count - 1) != 0 {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        self.sel(ch).controller.multiple_sectors = count;
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        0
    }

    fn ata_cmd_identify_packet_device(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_cd(ch) {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        if self.sel_ref(ch).drive.identify.is_none() {
            self.identify_atapi_device(ch);
        }
        let slot = self.sel(ch);
        let id = slot.drive.identify.as_ref().unwrap();
        for (i, word) in id.iter().enumerate() {
            slot.controller.buffer[i * 2] = *word as u8;
            slot.controller.buffer[i * 2 + 1] = (*word >> 8) as u8;
        }
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        self.sel(ch).controller.status.drq = true;
        0
    }

    fn ata_cmd_device_reset(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_cd(ch) {
            debug!("ATA{}: DEVICE RESET issued to HDD", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let dev = self.channels[ch].drive_select;
        self.set_signature(ch, dev);
        self.command_successful(ch, dev, false, ctx);
        self.sel(ch).controller.error_register &= !(1 << 7);
        0
    }

    fn ata_cmd_send_packet(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_cd(ch) {
            debug!("ATA{}: PACKET issued to HDD", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let features = self.sel_ref(ch).controller.features;
        self.sel(ch).controller.packet_dma = features & 1 != 0;
        if features & (1 << 1) != 0 {
            debug!("ATA{}: PACKET-overlapped not supported", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        if self.sel_ref(ch).controller.packet_dma {
            debug!("ATA{}: PACKET DMA not supported", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        {
            let slot = self.sel(ch);
            slot.controller.sector_count = 1;
            slot.drive.atapi.command = 0;
            slot.controller.buffer_index = 0;
            slot.controller.buffer_size = ATAPI_PACKET_SIZE;
        }
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, false, ctx);
        self.atapi_ready_to_transfer(ch, atapi::INT_CMD, atapi::INT_TO_DEV, false, ctx);
        0
    }

    fn ata_cmd_power_stubs(&mut self, ch: usize, _cmd: u8, ctx: &mut DevCtx) -> u32 {
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        0
    }

    fn ata_cmd_check_power_mode(&mut self, ch: usize, _cmd: u8, ctx: &mut DevCtx) -> u32 {
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        self.sel(ch).controller.sector_count = 0xFF; // active/idle
        0
    }

    fn ata_cmd_seek(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            debug!("ATA{}: SEEK not supported for non-disk", ch);
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let logical_sector = self.calculate_logical_address(ch);
        if logical_sector < 0 {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        self.sel(ch).drive.next_lba = logical_sector;
        let now_us = ctx.now_us();
        let seek_time = self.seek(ch, now_us + CTRL_OVERH_US as u64);
        seek_time + CTRL_OVERH_US
    }

    fn ata_cmd_read_native_max_address(&mut self, ch: usize, cmd: u8, ctx: &mut DevCtx) -> u32 {
        if !self.selected_is_hdd(ch) {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        if !self.sel_ref(ch).controller.lba_mode {
            self.command_aborted(ch, cmd, ctx);
            return 0;
        }
        let lba48 = cmd == 0x27;
        self.lba48_transform(ch, lba48);
        let max_sector = self.sectors(ch) - 1;
        let c = &mut self.sel(ch).controller;
        if !c.lba48 {
            c.head_no = ((max_sector >> 24) & 0xF) as u8;
            c.cylinder_no = (max_sector >> 8) as u16;
            c.sector_no = max_sector as u8;
        } else {
            c.hob.hcyl = (max_sector >> 40) as u8;
            c.hob.lcyl = (max_sector >> 32) as u8;
            c.hob.sector = (max_sector >> 24) as u8;
            c.cylinder_no = (max_sector >> 8) as u16;
            c.sector_no = max_sector as u8;
        }
        let dev = self.channels[ch].drive_select;
        self.command_successful(ch, dev, true, ctx);
        0
    }

    // ── IDENTIFY data ─────────────────────────────────────────

    fn put_ata_string(id: &mut [u16], start: usize, words: usize, text: &str) {
        // big-endian byte pairs, space padded
        let bytes: Vec<u8> = text
            .bytes()
            .chain(std::iter::repeat(b' '))
            .take(words * 2)
            .collect();
        for i in 0..words {
            id[start + i] = (bytes[i * 2] as u16) << 8 | bytes[i * 2 + 1] as u16;
        }
    }

    pub(super) fn identify_ata_device(&mut self, ch: usize) {
        let slot = self.sel(ch);
        let (geometry, sectors, serial, model, firmware) = match &slot.device {
            AtaDevice::Hdd(h) => (
                h.geometry,
                h.sectors(),
                h.serial.clone(),
                h.model.clone(),
                h.firmware.clone(),
            ),
            _ => return,
        };
        let multiple_sectors = slot.controller.multiple_sectors;
        let mut id = [0u16; 256];

        id[0] = 0x0040; // fixed drive
        id[1] = geometry.cylinders.min(16383) as u16;
        id[3] = geometry.heads as u16;
        id[4] = (512 * geometry.spt) as u16;
        id[5] = 512;
        id[6] = geometry.spt as u16;
        Self::put_ata_string(&mut id, 10, 10, &serial);
        id[20] = 3; // dual ported buffer with read caching
        id[21] = 512; // buffer size in sectors
        id[22] = 4; // ECC bytes on long commands
        Self::put_ata_string(&mut id, 23, 4, &firmware);
        Self::put_ata_string(&mut id, 27, 20, &model);
        id[47] = ATA_MAX_MULTIPLE_SECTORS as u16;
        id[48] = 1; // dword I/O
        id[49] = 1 << 9; // LBA supported
        id[51] = 0x200;
        id[52] = 0x200;
        id[53] = 0x07; // words 54-58, 64-70 and 88 valid
        id[54] = geometry.cylinders.min(16383) as u16;
        id[55] = geometry.heads as u16;
        id[56] = geometry.spt as u16;
        id[57] = sectors as u16;
        id[58] = (sectors >> 16) as u16;
        id[59] = if multiple_sectors > 0 {
            0x0100 | multiple_sectors as u16
        } else {
            0
        };
        id[60] = sectors as u16;
        id[61] = (sectors >> 16) as u16;
        // words 64-68: PIO modes and cycle times
        id[64] = 0x00;
        for w in 65..=68 {
            id[w] = 120;
        }
        for v in 1..=ATA_VERSION {
            id[80] |= 1 << v;
        }
        id[82] = 1 << 14; // NOP
        id[83] = (1 << 14) | (1 << 13) | (1 << 12) | (1 << 10); // FLUSH, 48-bit
        id[84] = 1 << 14;
        id[85] = 1 << 14;
        id[86] = (1 << 14) | (1 << 13) | (1 << 12) | (1 << 10);
        id[87] = 1 << 14;
        id[93] = 1 | (1 << 14) | 0x2000;
        // words 100-103: 48-bit total sectors
        id[100] = sectors as u16;
        id[101] = (sectors >> 16) as u16;
        id[102] = (sectors >> 32) as u16;
        id[103] = (sectors >> 48) as u16;

        self.sel(ch).drive.identify = Some(id);
    }

    pub(super) fn identify_atapi_device(&mut self, ch: usize) {
        let (serial, model, firmware) = match &self.sel_ref(ch).device {
            AtaDevice::Cdrom(c) => (c.serial.clone(), c.model.clone(), c.firmware.clone()),
            _ => return,
        };
        let mut id = [0u16; 256];

        // removable CD-ROM, interrupt DRQ, 12-byte packets
        id[0] = (2 << 14) | (5 << 8) | (1 << 7) | (1 << 5);
        Self::put_ata_string(&mut id, 10, 10, &serial);
        Self::put_ata_string(&mut id, 23, 4, &firmware);
        Self::put_ata_string(&mut id, 27, 20, &model);
        id[49] = 1 << 9; // LBA (mandatory)
        id[53] = 0x03; // words 54-58 and 64-70 valid
        id[64] = 1; // PIO mode 3
        id[65] = 180;
        id[66] = 180;
        id[67] = 300;
        id[68] = 180;
        id[71] = 30;
        id[72] = 30;
        id[73] = 0x6; // ATAPI 1.x / 2.x
        id[74] = 0x9; // SFF-8020i

        self.sel(ch).drive.identify = Some(id);
    }
}
