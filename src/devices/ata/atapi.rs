//! ATAPI packet layer (SFF-8020i subset for a CD-ROM drive).
//!
//! A PACKET command opens a 12-byte CDB window; the CDB dispatches
//! here.  Response data is staged in the controller buffer and doled
//! out in DRQ windows of `byte_count` bytes; oversized responses take
//! several rounds.  Every command updates the sense data, and
//! REQUEST SENSE hands the 18-byte block back, clearing a latched
//! UNIT ATTENTION.

use log::{debug, trace};

use super::cdrom::{AudioStatus, DiscState, Msf};
use super::*;

pub const INT_DATA: bool = false;
pub const INT_CMD: bool = true;
pub const INT_TO_DEV: bool = false;
pub const INT_TO_HOST: bool = true;

fn read_16bit(b: &[u8]) -> u16 {
    (b[0] as u16) << 8 | b[1] as u16
}

fn read_32bit(b: &[u8]) -> u32 {
    (b[0] as u32) << 24 | (b[1] as u32) << 16 | (b[2] as u32) << 8 | b[3] as u32
}

impl StorageCtrlAta {
    // ── transfer plumbing ─────────────────────────────────────

    pub(super) fn atapi_ready_to_transfer(
        &mut self,
        ch: usize,
        c_d: bool,
        i_o: bool,
        int: bool,
        ctx: &mut DevCtx,
    ) {
        let c = &mut self.sel(ch).controller;
        c.interrupt_reason.c_d = c_d;
        c.interrupt_reason.i_o = i_o;
        c.status.busy = false;
        c.status.drq = true;
        c.status.err = false;
        if int {
            self.raise_interrupt(ch, ctx);
        }
    }

    pub(super) fn atapi_set_sense(&mut self, ch: usize, key: u8, asc: u8, ascq: u8) {
        let sense = &mut self.sel(ch).drive.sense;
        sense.key = key;
        sense.asc = asc;
        sense.ascq = ascq;
    }

    pub(super) fn atapi_success(&mut self, ch: usize, int: bool, ctx: &mut DevCtx) {
        {
            let c = &mut self.sel(ch).controller;
            c.error_register = 0;
            c.interrupt_reason.c_d = INT_CMD;
            c.interrupt_reason.i_o = INT_TO_HOST;
            c.interrupt_reason.rel = false;
            c.status.busy = false;
            c.status.drive_ready = true;
            c.status.write_fault = false;
            c.status.drq = false;
            c.status.err = false;
        }
        if int {
            self.raise_interrupt(ch, ctx);
        }
        self.sel(ch).drive.atapi.command = 0;
    }

    pub(super) fn atapi_error(&mut self, ch: usize, int: bool, ctx: &mut DevCtx) {
        let sense = self.sel_ref(ch).drive.sense;
        debug!(
            "ATA{}: ATAPI cmd error key=0x{:02X} asc=0x{:02X} ascq=0x{:02X}",
            ch, sense.key, sense.asc, sense.ascq
        );
        {
            let c = &mut self.sel(ch).controller;
            c.error_register = sense.key << 4;
            c.interrupt_reason.c_d = INT_CMD;
            c.interrupt_reason.i_o = INT_TO_HOST;
            c.interrupt_reason.rel = false;
            c.status.busy = false;
            c.status.drive_ready = true;
            c.status.write_fault = false;
            c.status.drq = false;
            c.status.err = true;
        }
        if int {
            self.raise_interrupt(ch, ctx);
        }
        self.sel(ch).drive.atapi.command = 0;
    }

    /// Prepare a host→device parameter transfer window.
    fn atapi_init_receive(&mut self, ch: usize, tx_len: usize) -> bool {
        let c = &mut self.sel(ch).controller;
        c.byte_count = tx_len.min(c.buffer.len()) as u32;
        c.buffer_index = 0;
        c.buffer_size = c.byte_count as usize;
        if (c.byte_count as usize) < tx_len {
            debug!("ATA{}: ATAPI receive: multiple DRQ transfers not supported", ch);
            return false;
        }
        true
    }

    /// Prepare a device→host response of `req_len` bytes, clipped by
    /// the guest's allocation length and negotiated DRQ byte count.
    fn atapi_init_send(&mut self, ch: usize, cmd: u8, req_len: usize, alloc_len: usize) {
        let slot = self.sel(ch);
        let c = &mut slot.controller;

        if c.byte_count == 0xFFFF {
            c.byte_count = 0xFFFE;
        }
        if c.byte_count & 1 != 0 && alloc_len > c.byte_count as usize {
            // drives never send odd-length DRQs except the last one
            trace!(
                "ATA{}: ATAPI odd byte count 0x{:04X}, cmd=0x{:02X}, rounding down",
                ch,
                c.byte_count,
                cmd
            );
            c.byte_count -= 1;
        }
        if !c.packet_dma && c.byte_count == 0 {
            debug!("ATA{}: ATAPI command 0x{:02X} with zero byte count", ch, cmd);
            return;
        }
        let alloc_len = if alloc_len == 0 {
            c.byte_count as usize
        } else {
            alloc_len
        };

        c.status.busy = true;
        c.status.drive_ready = true;
        c.status.drq = false;
        c.status.err = false;
        c.buffer_size = req_len;
        c.buffer_index = 0;
        c.drq_index = 0;
        if c.byte_count as usize > req_len {
            c.byte_count = req_len as u32;
        }
        if c.byte_count as usize > alloc_len {
            c.byte_count = alloc_len as u32;
        }
        slot.drive.atapi.bytes_remaining = req_len as i64;
        slot.drive.atapi.bytes_total = req_len as i64;
        trace!(
            "ATA{}: ATAPI send to host: req_len={}, alloc_len={}, byte_count={}",
            ch,
            req_len,
            alloc_len,
            c.byte_count
        );
    }

    // ── data register paths (called from mod.rs) ──────────────

    pub(super) fn atapi_read_data(&mut self, ch: usize, len: u8, ctx: &mut DevCtx) -> u32 {
        {
            let c = &self.sel_ref(ch).controller;
            if c.buffer_index >= c.buffer_size {
                debug!("ATA{}: ATAPI read past buffer ({})", ch, c.buffer_size);
                return 0;
            }
        }
        let value;
        let drq_done;
        {
            let slot = self.sel(ch);
            let c = &mut slot.controller;
            let mut v = c.buffer[c.buffer_index] as u32;
            if len == 2 {
                v |= (c.buffer[c.buffer_index + 1] as u32) << 8;
            }
            value = v;
            c.buffer_index += len as usize;
            c.drq_index += len as usize;
            slot.drive.atapi.bytes_remaining -= len as i64;
            drq_done = c.drq_index >= c.byte_count as usize;
        }
        if drq_done {
            {
                let c = &mut self.sel(ch).controller;
                c.status.drq = false;
                c.drq_index = 0;
            }
            let bytes_remaining = self.sel_ref(ch).drive.atapi.bytes_remaining;
            if bytes_remaining > 0 {
                match self.sel_ref(ch).drive.atapi.command {
                    0x28 | 0xA8 => {
                        // reads refill the buffer block by block
                        let exec_time = self.atapi_read_next_block(ch, false, ctx);
                        if !self.sel_ref(ch).controller.status.err {
                            self.activate_command_timer(ch, exec_time, ctx);
                            self.sel(ch).controller.status.busy = true;
                        }
                    }
                    _ => {
                        // other responses live in the buffer whole;
                        // open a new DRQ window over the remainder
                        trace!("ATA{}: ATAPI new DRQ, bytes remaining={}", ch, bytes_remaining);
                        let c = &mut self.sel(ch).controller;
                        if bytes_remaining < c.byte_count as i64 {
                            c.byte_count = bytes_remaining as u32;
                        }
                        self.atapi_ready_to_transfer(ch, INT_DATA, INT_TO_HOST, true, ctx);
                    }
                }
            } else {
                trace!("ATA{}: ATAPI all bytes read", ch);
                self.atapi_success(ch, true, ctx);
            }
        }
        value
    }

    pub(super) fn atapi_write_data(&mut self, ch: usize, value: u32, len: u8, ctx: &mut DevCtx) {
        {
            let c = &self.sel_ref(ch).controller;
            if !c.status.drq {
                debug!("ATA{}: ATAPI write with DRQ clear", ch);
                return;
            }
            if c.buffer_index >= c.buffer_size {
                debug!("ATA{}: ATAPI write past buffer ({})", ch, c.buffer_size);
                return;
            }
        }
        let transfer_done;
        {
            let c = &mut self.sel(ch).controller;
            c.buffer[c.buffer_index] = value as u8;
            if len == 2 {
                c.buffer[c.buffer_index + 1] = (value >> 8) as u8;
            }
            c.buffer_index += len as usize;
            transfer_done = c.buffer_index >= c.buffer_size;
        }
        if !transfer_done {
            return;
        }
        {
            let c = &mut self.sel(ch).controller;
            c.status.drq = false;
            c.status.busy = true;
        }
        let atapi_command = self.sel_ref(ch).drive.atapi.command;
        if atapi_command == 0 {
            // a fresh CDB
            self.sel(ch).controller.buffer_size = 0;
            let opcode = self.sel_ref(ch).controller.buffer[0];
            self.dispatch_atapi_command(ch, opcode, ctx);
        } else {
            // a command expecting parameter data
            match atapi_command {
                0x55 => {
                    let param_len = self.sel_ref(ch).controller.buffer_size;
                    self.atapi_mode_select(ch, param_len);
                    self.atapi_success(ch, true, ctx);
                }
                cmd => {
                    debug!("ATA{}: ATAPI not expecting data for command 0x{:02X}", ch, cmd);
                    self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND_OPCODE, 0);
                    self.atapi_error(ch, true, ctx);
                }
            }
        }
    }

    fn dispatch_atapi_command(&mut self, ch: usize, opcode: u8, ctx: &mut DevCtx) {
        let known = matches!(
            opcode,
            0x00 | 0x03 | 0x12 | 0x1A | 0x1B | 0x1E | 0x25 | 0x28 | 0x2B | 0x42 | 0x43 | 0x45
                | 0x47 | 0x4A | 0x4B | 0x4E | 0x51 | 0x55 | 0x5A | 0xA8
        );
        if !known {
            debug!("ATA{}: ATAPI unknown command 0x{:02X}", ch, opcode);
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND_OPCODE, 0);
            self.atapi_error(ch, true, ctx);
            return;
        }
        self.sel(ch).drive.atapi.command = opcode;
        debug!("ATA{}: ATAPI command 0x{:02X}", ch, opcode);

        // medium transitions surface as an error on every command but
        // INQUIRY and REQUEST SENSE
        if opcode != 0x12 && opcode != 0x03 && !self.atapi_check_transitions(ch) {
            self.atapi_error(ch, true, ctx);
            return;
        }

        let exec_time = match opcode {
            0x00 => self.atapi_cmd_test_unit_ready(ch, ctx),
            0x03 => self.atapi_cmd_request_sense(ch, ctx),
            0x12 => self.atapi_cmd_inquiry(ch, ctx),
            0x1A | 0x5A => self.atapi_cmd_mode_sense(ch, opcode, ctx),
            0x1B => self.atapi_cmd_start_stop_unit(ch, ctx),
            0x1E => self.atapi_cmd_prevent_allow_medium_removal(ch, ctx),
            0x25 => self.atapi_cmd_read_cdrom_capacity(ch, ctx),
            0x28 | 0xA8 => self.atapi_cmd_read(ch, opcode, ctx),
            0x2B => self.atapi_cmd_seek(ch, ctx),
            0x42 => self.atapi_cmd_read_subchannel(ch, ctx),
            0x43 => self.atapi_cmd_read_toc(ch, ctx),
            0x45 => self.atapi_cmd_play_audio(ch, ctx),
            0x47 => self.atapi_cmd_play_audio_msf(ch, ctx),
            0x4A => self.atapi_cmd_get_event_status_notification(ch, ctx),
            0x4B => self.atapi_cmd_pause_resume(ch, ctx),
            0x4E => self.atapi_cmd_stop_play_scan(ch, ctx),
            0x51 => self.atapi_cmd_read_disc_info(ch, ctx),
            0x55 => self.atapi_cmd_mode_select(ch, ctx),
            _ => unreachable!(),
        };
        if !self.sel_ref(ch).controller.status.err && exec_time > 0 {
            self.activate_command_timer(ch, exec_time, ctx);
        }
    }

    // ── drive access checks ───────────────────────────────────

    fn atapi_check_transitions(&mut self, ch: usize) -> bool {
        let accessible = match &mut self.sel(ch).device {
            AtaDevice::Cdrom(cd) => {
                let changed = cd.has_medium_changed(true);
                changed && cd.is_disc_accessible()
            }
            _ => false,
        };
        if accessible {
            // not-ready → ready transitions surface as UNIT ATTENTION
            self.atapi_set_sense(ch, SENSE_UNIT_ATTENTION, ASC_NOT_READY_TO_READY, 0);
            return false;
        }
        self.atapi_set_sense(ch, SENSE_NONE, 0, 0);
        true
    }

    /// Check the disc is usable; optionally spin it up and report the
    /// time until ready.
    fn atapi_access_drive(
        &mut self,
        ch: usize,
        spin_up: bool,
        blocking: bool,
        time_to_ready: Option<&mut u32>,
        now_us: u64,
    ) -> bool {
        let state = {
            let cd = match &mut self.sel(ch).device {
                AtaDevice::Cdrom(cd) => cd,
                _ => return false,
            };
            if spin_up {
                cd.spin_up(now_us);
            }
            cd.disc_state(now_us)
        };
        match state {
            DiscState::NoDisc | DiscState::DoorOpen | DiscState::DoorClosing | DiscState::Ejecting => {
                self.atapi_set_sense(ch, SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 0);
                false
            }
            DiscState::SpinningUp => {
                if blocking {
                    if let Some(ttr) = time_to_ready {
                        if let AtaDevice::Cdrom(cd) = &self.sel_ref(ch).device {
                            *ttr = cd.time_to_ready_us(now_us) as u32;
                        }
                    }
                    self.atapi_set_sense(ch, SENSE_NONE, 0, 0);
                    true
                } else {
                    self.atapi_set_sense(ch, SENSE_NOT_READY, ASC_DRIVE_NOT_READY, 1);
                    false
                }
            }
            DiscState::Idle | DiscState::Ready => self.atapi_check_transitions(ch),
        }
    }

    /// Stop audio if requested and refresh the head position from the
    /// player.
    fn atapi_update_head_pos(&mut self, ch: usize, stop_audio: bool, now_us: u64) {
        let slot = self.sel(ch);
        let cd = match &mut slot.device {
            AtaDevice::Cdrom(cd) => cd,
            _ => return,
        };
        let (status, curr_audio_lba) = cd.get_audio_status(now_us);
        if stop_audio && (status == AudioStatus::Playing || status == AudioStatus::Paused) {
            debug!("ATA{}: ATAPI interrupting CD audio playback", ch);
            cd.stop_audio();
        }
        if curr_audio_lba >= 0 {
            slot.drive.curr_lba = curr_audio_lba;
        }
    }

    pub(super) fn atapi_seek(&mut self, ch: usize) -> u32 {
        let (c0, c1) = {
            let slot = self.sel_ref(ch);
            let cd = match &slot.device {
                AtaDevice::Cdrom(cd) => cd,
                _ => return 0,
            };
            let (c0, _, _) = cd.lba_to_chs(slot.drive.curr_lba);
            let (c1, _, _) = cd.lba_to_chs(slot.drive.next_lba);
            (c0, c1)
        };
        trace!(
            "ATA{}: ATAPI seek LBA:{} -> LBA:{}",
            ch,
            self.sel_ref(ch).drive.curr_lba,
            self.sel_ref(ch).drive.next_lba
        );
        self.get_seek_time(ch, c0, c1, -1)
    }

    // ── packet commands ───────────────────────────────────────

    fn atapi_cmd_test_unit_ready(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        if !self.atapi_access_drive(ch, false, false, None, now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        self.atapi_success(ch, true, ctx);
        0
    }

    fn atapi_cmd_request_sense(&mut self, ch: usize, _ctx: &mut DevCtx) -> u32 {
        let alloc_length = self.sel_ref(ch).controller.buffer[4] as usize;
        self.atapi_init_send(ch, 0x03, 18, alloc_length);
        let slot = self.sel(ch);
        let sense = slot.drive.sense;
        let b = &mut slot.controller.buffer;
        b[0] = (1 << 7) | 0x70; // current errors
        b[1] = 0;
        b[2] = sense.key;
        b[3..7].copy_from_slice(&sense.information);
        b[7] = 17 - 7; // additional sense length
        b[8..12].copy_from_slice(&sense.specific_inf);
        b[12] = sense.asc;
        b[13] = sense.ascq;
        b[14] = sense.fruc;
        b[15..18].copy_from_slice(&sense.key_spec);
        if sense.key == SENSE_UNIT_ATTENTION {
            self.atapi_set_sense(ch, SENSE_NONE, 0, 0);
        }
        DEFAULT_CMD_US
    }

    fn atapi_cmd_inquiry(&mut self, ch: usize, _ctx: &mut DevCtx) -> u32 {
        let alloc_length = self.sel_ref(ch).controller.buffer[4] as usize;
        let (vendor, product, revision) = match &self.sel_ref(ch).device {
            AtaDevice::Cdrom(cd) => (cd.vendor.clone(), cd.product.clone(), cd.revision.clone()),
            _ => return 0,
        };
        let b = &mut self.sel(ch).controller.buffer;
        b[0] = 0x05; // CD-ROM device
        b[1] = 0x80; // removable
        b[2] = 0x00;
        b[3] = 0x21; // ATAPI-2
        b[4] = 36 - 5;
        b[5] = 0;
        b[6] = 0;
        b[7] = 0;
        b[8..16].copy_from_slice(&vendor.as_bytes()[..8]);
        b[16..32].copy_from_slice(&product.as_bytes()[..16]);
        b[32..36].copy_from_slice(&revision.as_bytes()[..4]);
        self.atapi_init_send(ch, 0x12, 36, alloc_length);
        DEFAULT_CMD_US
    }

    fn atapi_cmd_read_cdrom_capacity(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        if !self.atapi_access_drive(ch, false, false, None, now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let sec = self.sectors(ch) as u32;
        let b = &mut self.sel(ch).controller.buffer;
        b[0..4].copy_from_slice(&sec.to_be_bytes());
        b[4..8].copy_from_slice(&2048u32.to_be_bytes());
        self.atapi_init_send(ch, 0x25, 8, 0);
        DEFAULT_CMD_US
    }

    fn atapi_cmd_read_toc(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        let mut time_to_ready = 0u32;
        if !self.atapi_access_drive(ch, true, true, Some(&mut time_to_ready), now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let (alloc_length, mut format, starting_track, msf) = {
            let b = &self.sel_ref(ch).controller.buffer;
            (
                read_16bit(&b[7..]) as usize,
                b[2] & 0x0F,
                b[6],
                (b[1] >> 1) & 1 != 0,
            )
        };
        if format == 0 {
            // byte 9 carries the legacy vendor-specific format field
            format = self.sel_ref(ch).controller.buffer[9] >> 6;
        }
        trace!(
            "ATA{}: ATAPI READ TOC format={} start={} msf={}",
            ch,
            format,
            starting_track,
            msf
        );
        if starting_track > 99 && starting_track != 0xAA {
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let toc_length = {
            let slot = self.sel(ch);
            let cd = match &mut slot.device {
                AtaDevice::Cdrom(cd) => cd,
                _ => return 0,
            };
            // buffer borrow: compose into a scratch, then copy
            let mut scratch = [0u8; 1024];
            match cd.read_toc(&mut scratch, msf, starting_track, format) {
                Some(len) => {
                    slot.controller.buffer[..len].copy_from_slice(&scratch[..len]);
                    len
                }
                None => 0,
            }
        };
        if toc_length == 0 {
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        self.atapi_init_send(ch, 0x43, toc_length, alloc_length);
        // the drive caches the TOC when the disc loads; only the
        // spin-up time counts
        DEFAULT_CMD_US + time_to_ready
    }

    fn atapi_cmd_read(&mut self, ch: usize, opcode: u8, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        let (lba, mut transfer_length) = {
            let b = &self.sel_ref(ch).controller.buffer;
            let lba = read_32bit(&b[2..]) as i64;
            let len = if opcode == 0x28 {
                read_16bit(&b[7..]) as i64
            } else {
                read_32bit(&b[6..]) as i64
            };
            (lba, len)
        };
        let mut time_to_ready = 0u32;
        if !self.atapi_access_drive(ch, true, true, Some(&mut time_to_ready), now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let max_lba = match &self.sel_ref(ch).device {
            AtaDevice::Cdrom(cd) => cd.max_lba(),
            _ => return 0,
        };
        if lba > max_lba {
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_LOGICAL_BLOCK_OOR, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        if lba + transfer_length - 1 > max_lba {
            transfer_length = max_lba - lba + 1;
        }
        transfer_length = transfer_length.max(0);
        debug!(
            "ATA{}: ATAPI READ lba={} transfer_length={}",
            ch, lba, transfer_length
        );
        let sector_size = self.sel_ref(ch).drive.atapi.sector_size;
        let total_bytes = transfer_length * sector_size as i64;

        // negotiate the DRQ byte count
        let byte_count = self.sel_ref(ch).controller.byte_count;
        if transfer_length != 0 && byte_count == 0 {
            debug!("ATA{}: ATAPI READ with zero byte count", ch);
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        if byte_count < sector_size {
            debug!("ATA{}: ATAPI READ byte count smaller than {}", ch, sector_size);
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        {
            let c = &mut self.sel(ch).controller;
            c.byte_count = c.byte_count.min(0xFFFE);
            c.byte_count = (c.byte_count as i64).min(total_bytes) as u32;
            c.byte_count = c.byte_count.min(c.buffer.len() as u32);
        }
        {
            let slot = self.sel(ch);
            slot.drive.atapi.drq_sectors = slot.controller.byte_count / sector_size;
        }

        let cur_seek_target = self.sel_ref(ch).drive.next_lba;
        let next_point = now_us + DEFAULT_CMD_US as u64;
        let mut time_to_seek = self.atapi_check_seek_completion(ch, next_point);
        if time_to_seek == 0 {
            self.atapi_update_head_pos(ch, true, now_us);
        }
        {
            let slot = self.sel(ch);
            slot.drive.atapi.bytes_total = total_bytes;
            slot.drive.atapi.bytes_remaining = total_bytes;
            slot.drive.atapi.sectors_total = transfer_length as u32;
            slot.drive.atapi.sectors_remaining = transfer_length as u32;
            let c = &mut slot.controller;
            c.status.busy = true;
            c.status.drive_ready = true;
            c.status.drq = false;
            c.status.err = false;
            c.buffer_size = 0;
            c.buffer_index = 0;
            c.drq_index = 0;
            slot.drive.next_lba = lba;
        }

        if time_to_ready == 0 {
            if time_to_seek != 0 {
                if lba != cur_seek_target {
                    // seeking, but not where this read wants to go
                    time_to_seek = self.atapi_seek(ch);
                }
            } else {
                time_to_seek = self.atapi_seek(ch);
            }
        } else {
            time_to_seek = self.atapi_seek(ch);
        }

        let time_to_read = self.atapi_read_next_block(ch, true, ctx);
        if self.sel_ref(ch).controller.status.err {
            return 0;
        }
        DEFAULT_CMD_US + time_to_ready + time_to_seek + time_to_read
    }

    pub(super) fn atapi_read_next_block(&mut self, ch: usize, rot_latency: bool, ctx: &mut DevCtx) -> u32 {
        {
            let slot = self.sel(ch);
            slot.drive.curr_lba = slot.drive.next_lba;
        }
        let (xfer_amount, sector_size) = {
            let a = &self.sel_ref(ch).drive.atapi;
            (a.sectors_remaining.min(a.drq_sectors), a.sector_size)
        };
        {
            let c = &mut self.sel(ch).controller;
            // for reads the DRQ window and the buffer are the same
            c.buffer_size = xfer_amount as usize * sector_size as usize;
            c.buffer_index = 0;
            c.byte_count = c.buffer_size as u32;
        }
        let (mut xfer_time, rot_lat) = match &self.sel_ref(ch).device {
            AtaDevice::Cdrom(cd) => (cd.transfer_time_us(xfer_amount), cd.rotational_latency_us()),
            _ => (0, 0),
        };
        if rot_latency {
            xfer_time += rot_lat;
        }
        trace!(
            "ATA{}: ATAPI reading {} sector(s), lba={}, tx={}us",
            ch,
            xfer_amount,
            self.sel_ref(ch).drive.curr_lba,
            xfer_time
        );
        for i in 0..xfer_amount {
            let lba = self.sel_ref(ch).drive.curr_lba;
            let ok = {
                let slot = self.sel(ch);
                let offset = i as usize * sector_size as usize;
                match &mut slot.device {
                    AtaDevice::Cdrom(cd) => {
                        cd.read_sector(lba, &mut slot.controller.buffer[offset..])
                    }
                    _ => false,
                }
            };
            if !ok {
                // disc pulled mid-transfer
                self.atapi_set_sense(ch, SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 0);
                self.atapi_error(ch, true, ctx);
                return 0;
            }
            let slot = self.sel(ch);
            slot.drive.curr_lba += 1;
            slot.drive.atapi.sectors_remaining -= 1;
        }
        let slot = self.sel(ch);
        slot.drive.next_lba = slot.drive.curr_lba;
        xfer_time
    }

    fn atapi_cmd_seek(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        let mut time_to_ready = 0u32;
        if !self.atapi_access_drive(ch, true, true, Some(&mut time_to_ready), now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let lba = read_32bit(&self.sel_ref(ch).controller.buffer[2..]) as i64;
        let max_lba = match &self.sel_ref(ch).device {
            AtaDevice::Cdrom(cd) => cd.max_lba(),
            _ => return 0,
        };
        if lba > max_lba {
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_LOGICAL_BLOCK_OOR, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        self.atapi_update_head_pos(ch, true, now_us);
        let next_time_point = now_us + SEEK_CMD_US as u64 + time_to_ready as u64;
        self.sel(ch).drive.next_lba = lba;
        let seek_time = self.atapi_seek(ch);
        {
            let slot = self.sel(ch);
            slot.controller.status.seek_complete = false;
            slot.drive.atapi.seek_completion_time_us = next_time_point + seek_time as u64;
        }
        // SEEK is an immediate command: completion status now, DSC
        // when the head actually arrives
        SEEK_CMD_US + time_to_ready
    }

    fn atapi_cmd_start_stop_unit(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        let (immed, lo_ej, start) = {
            let b = &self.sel_ref(ch).controller.buffer;
            (b[1] & 1 != 0, b[4] & 2 != 0, b[4] & 1 != 0)
        };
        let mut time_to_complete = 0u32;
        if !lo_ej && !start {
            trace!("ATA{}: ATAPI stopping the disc", ch);
            if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
                cd.spin_down();
            }
        } else if !lo_ej && start {
            trace!("ATA{}: ATAPI going to ready state", ch);
            if !self.atapi_access_drive(ch, true, true, Some(&mut time_to_complete), now_us) {
                self.atapi_error(ch, true, ctx);
                return 0;
            }
        } else if lo_ej && !start {
            let locked = match &self.sel_ref(ch).device {
                AtaDevice::Cdrom(cd) => cd.is_door_locked(),
                _ => false,
            };
            if locked {
                self.atapi_set_sense(ch, SENSE_NOT_READY, ASC_MEDIA_REMOVAL_PREVENTED, 0);
                self.atapi_error(ch, true, ctx);
                return 0;
            }
            trace!("ATA{}: ATAPI ejecting the disc", ch);
            if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
                cd.open_door();
            }
        } else {
            trace!("ATA{}: ATAPI closing the door", ch);
            if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
                time_to_complete = (cd.close_door(now_us) / 1000) as u32;
            }
        }
        if immed {
            time_to_complete = 0;
        }
        DEFAULT_CMD_US + time_to_complete
    }

    fn atapi_cmd_stop_play_scan(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        self.atapi_update_head_pos(ch, true, now_us);
        self.atapi_success(ch, true, ctx);
        0
    }

    fn atapi_cmd_pause_resume(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        if !self.atapi_access_drive(ch, true, false, None, now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let resume = self.sel_ref(ch).controller.buffer[8] & 1 != 0;
        let ok = match &mut self.sel(ch).device {
            AtaDevice::Cdrom(cd) => cd.pause_resume_audio(resume, now_us),
            _ => false,
        };
        if !ok {
            self.atapi_set_sense(ch, SENSE_ABORTED, 0xB9, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        self.atapi_success(ch, true, ctx);
        0
    }

    fn atapi_cmd_play_audio(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let (start, len) = {
            let b = &self.sel_ref(ch).controller.buffer;
            (read_32bit(&b[2..]), read_16bit(&b[7..]) as i64)
        };
        let start_lba = if start == 0xFFFF_FFFF { -1 } else { start as i64 };
        self.atapi_play_audio(ch, start_lba, -1, len, ctx)
    }

    fn atapi_cmd_play_audio_msf(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let (start, end) = {
            let b = &self.sel_ref(ch).controller.buffer;
            (Msf::from_bytes(&b[3..6]), Msf::from_bytes(&b[6..9]))
        };
        let start_lba = if start.min == 0xFF && start.sec == 0xFF && start.fr == 0xFF {
            -1
        } else {
            start.to_frames()
        };
        self.atapi_play_audio(ch, start_lba, end.to_frames(), -1, ctx)
    }

    fn atapi_play_audio(
        &mut self,
        ch: usize,
        mut start_lba: i64,
        mut end_lba: i64,
        len: i64,
        ctx: &mut DevCtx,
    ) -> u32 {
        let now_us = ctx.now_us();
        let mut time_to_ready = 0u32;
        if !self.atapi_access_drive(ch, true, true, Some(&mut time_to_ready), now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        // a SEEK may still be in flight; its target becomes the head
        // position used for ATD-style "play from here"
        let mut time_to_seek_complete = self.atapi_check_seek_completion(ch, now_us);
        let head_position = if time_to_seek_complete != 0 {
            self.sel_ref(ch).drive.next_lba
        } else {
            self.atapi_update_head_pos(ch, false, now_us);
            self.sel_ref(ch).drive.curr_lba
        };
        if start_lba == -1 {
            start_lba = head_position;
        }
        if end_lba == -1 {
            end_lba = start_lba + len;
        }
        let check = match &self.sel_ref(ch).device {
            AtaDevice::Cdrom(cd) => cd.check_play_audio(start_lba, end_lba),
            _ => Err((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT)),
        };
        if let Err((sense, asc)) = check {
            self.atapi_set_sense(ch, sense, asc, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        if start_lba == end_lba {
            // equal addresses play nothing, and that's not an error
            if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
                cd.stop_audio();
            }
            return DEFAULT_CMD_US;
        }
        if head_position != start_lba {
            self.sel(ch).drive.curr_lba = head_position;
            self.sel(ch).drive.next_lba = start_lba;
            time_to_seek_complete = self.atapi_seek(ch);
            let slot = self.sel(ch);
            slot.controller.status.seek_complete = false;
            slot.drive.atapi.seek_completion_time_us =
                now_us + time_to_ready as u64 + time_to_seek_complete as u64;
        }
        if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
            cd.play_audio(start_lba, end_lba, now_us, time_to_seek_complete as u64);
        }
        // immediate status
        DEFAULT_CMD_US
    }

    fn atapi_cmd_read_subchannel(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let now_us = ctx.now_us();
        let mut time_to_ready = 0u32;
        if !self.atapi_access_drive(ch, true, true, Some(&mut time_to_ready), now_us) {
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let (msf, sub_q, data_format, _track_number, alloc_length) = {
            let b = &self.sel_ref(ch).controller.buffer;
            (
                (b[1] >> 1) & 1 != 0,
                (b[2] >> 6) & 1 != 0,
                b[3],
                b[6],
                read_16bit(&b[7..]) as usize,
            )
        };
        trace!(
            "ATA{}: ATAPI READ SUB-CHANNEL msf={} sub_q={} format={}",
            ch,
            msf,
            sub_q,
            data_format
        );
        if data_format == 0 || data_format > 3 {
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let time_to_seek_complete = self.atapi_check_seek_completion(ch, now_us);
        let head_position = if time_to_seek_complete != 0 {
            self.sel_ref(ch).drive.next_lba
        } else {
            self.atapi_update_head_pos(ch, false, now_us);
            self.sel_ref(ch).drive.curr_lba
        };

        let (audio_status, _) = match &mut self.sel(ch).device {
            AtaDevice::Cdrom(cd) => cd.get_audio_status(now_us),
            _ => (AudioStatus::Stopped, -1),
        };
        let audio_status_byte = match audio_status {
            AudioStatus::Playing => 0x11,
            AudioStatus::Paused => 0x12,
            AudioStatus::Completed => 0x13,
            AudioStatus::Stopped => 0x15,
        };

        let req_len;
        {
            let b = &mut self.sel(ch).controller.buffer;
            b[0] = 0;
            b[1] = audio_status_byte;
            if !sub_q || data_format != 1 {
                // header only
                b[2] = 0;
                b[3] = 0;
                req_len = 4;
            } else {
                // current position
                b[3] = 12; // data length LSB
                b[2] = 0;
                b[4] = 0x01; // format
                b[5] = 0x10; // audio track, Q valid
                b[6] = 1; // track
                b[7] = 1; // index
                if msf {
                    let m = Msf::from_frames(head_position + super::cdrom::CD_MSF_OFFSET);
                    b[8] = 0;
                    b[9] = m.min;
                    b[10] = m.sec;
                    b[11] = m.fr;
                } else {
                    b[8..12].copy_from_slice(&(head_position as u32).to_be_bytes());
                }
                // track-relative address
                if msf {
                    let m = Msf::from_frames(head_position);
                    b[12] = 0;
                    b[13] = m.min;
                    b[14] = m.sec;
                    b[15] = m.fr;
                } else {
                    b[12..16].copy_from_slice(&(head_position as u32).to_be_bytes());
                }
                req_len = 16;
            }
        }
        self.atapi_init_send(ch, 0x42, req_len, alloc_length);
        DEFAULT_CMD_US + time_to_ready + time_to_seek_complete
    }

    fn atapi_cmd_prevent_allow_medium_removal(&mut self, ch: usize, _ctx: &mut DevCtx) -> u32 {
        let lock = self.sel_ref(ch).controller.buffer[4] & 1 != 0;
        if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
            cd.lock_door(lock);
        }
        debug!(
            "ATA{}: ATAPI door now {}",
            ch,
            if lock { "locked" } else { "unlocked" }
        );
        DEFAULT_CMD_US
    }

    fn atapi_cmd_read_disc_info(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        // kept unimplemented to keep CD-ROM drivers happy
        self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
        self.atapi_error(ch, true, ctx);
        0
    }

    fn atapi_cmd_get_event_status_notification(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let (immed, request, alloc_length) = {
            let b = &self.sel_ref(ch).controller.buffer;
            (b[1] & 1 != 0, b[4], read_16bit(&b[7..]) as usize)
        };
        if !immed {
            debug!("ATA{}: ATAPI GET EVENT STATUS: async mode not supported", ch);
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        let (changed, accessible) = match &mut self.sel(ch).device {
            AtaDevice::Cdrom(cd) => (cd.has_medium_changed(true), cd.is_disc_accessible()),
            _ => (false, false),
        };
        let event_length;
        {
            let b = &mut self.sel(ch).controller.buffer;
            if request == 1 << 4 {
                // MEDIA class
                b[0] = 0;
                b[1] = 4;
                b[2] = 4; // MEDIA event class
                b[3] = 1 << 4;
                b[4] = if !changed {
                    0
                } else if accessible {
                    4 // new media
                } else {
                    3 // media removed
                };
                b[5] = if accessible { 1 << 1 } else { 0 };
                b[6] = 0;
                b[7] = 0;
                event_length = if alloc_length <= 4 { 4 } else { 8 };
            } else {
                // any other class: empty event header
                b[0] = 0;
                b[1] = 0;
                b[2] = (1 << 7) | request;
                b[3] = 1 << 4;
                event_length = 4;
            }
        }
        self.atapi_init_send(ch, 0x4A, event_length, alloc_length);
        DEFAULT_CMD_US
    }

    // ── mode pages ────────────────────────────────────────────

    fn atapi_cmd_mode_select(&mut self, ch: usize, ctx: &mut DevCtx) -> u32 {
        let (sp, param_len) = {
            let b = &self.sel_ref(ch).controller.buffer;
            (b[1] & 1 != 0, read_16bit(&b[7..]) as usize)
        };
        if sp {
            // saved pages not supported
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        if param_len == 0 {
            // zero-length parameter list is not an error
            self.atapi_success(ch, true, ctx);
            return 0;
        }
        if !self.atapi_init_receive(ch, param_len) {
            self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
            self.atapi_error(ch, true, ctx);
            return 0;
        }
        DEFAULT_CMD_US
    }

    pub(super) fn atapi_mode_select(&mut self, ch: usize, param_len: usize) {
        let param_len = param_len.min(ATA_BUFFER_SIZE);
        if param_len == 0 {
            debug!("ATA{}: ATAPI MODE SELECT with zero param length", ch);
            return;
        }
        // the 8-byte mode parameter header is reserved on MODE SELECT
        let mut scan = 8usize;
        while scan + 2 < param_len {
            let (page_code, page_len) = {
                let b = &self.sel_ref(ch).controller.buffer;
                (b[scan] & 0x1F, b[scan + 1] as usize)
            };
            let total_len = page_len + 2;
            let expected = match page_code {
                0x01 => 0x06,
                0x0D => 0x06,
                0x0E => 0x0E,
                0x2A => 0x12,
                _ => {
                    debug!("ATA{}: ATAPI MODE SELECT unknown page 0x{:02X}", ch, page_code);
                    scan += total_len;
                    continue;
                }
            };
            if expected != page_len {
                debug!(
                    "ATA{}: ATAPI MODE SELECT page 0x{:02X}: invalid length {}",
                    ch, page_code, page_len
                );
                scan += total_len;
                continue;
            }
            if scan + total_len > param_len {
                debug!("ATA{}: ATAPI MODE SELECT page extends past buffer", ch);
                break;
            }
            match page_code {
                0x01 => {
                    let b: [u8; 8] = self.sel_ref(ch).controller.buffer[scan..scan + 8]
                        .try_into()
                        .unwrap();
                    self.sel(ch).drive.atapi.error_recovery = b;
                }
                0x0D => {
                    let mult = self.sel_ref(ch).controller.buffer[scan + 3] & 0x0F;
                    if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
                        cd.set_timeout_mult(mult);
                    }
                }
                0x0E => {
                    let (sotc, p0, p1) = {
                        let b = &self.sel_ref(ch).controller.buffer;
                        (
                            b[scan + 2] & 0x02 != 0,
                            (b[scan + 8] & 0x0F, b[scan + 9]),
                            (b[scan + 10] & 0x0F, b[scan + 11]),
                        )
                    };
                    if let AtaDevice::Cdrom(cd) = &mut self.sel(ch).device {
                        cd.set_sotc(sotc);
                        cd.set_audio_port(0, p0.0, p0.1);
                        cd.set_audio_port(1, p1.0, p1.1);
                    }
                }
                _ => {}
            }
            scan += total_len;
        }
    }

    /// Mode parameter header + single page body.
    fn atapi_init_mode_sense_single(&mut self, ch: usize, size: usize) {
        let disc_type = match &mut self.sel(ch).device {
            // 0x70 = door open, 0x71 = no disc; data disc otherwise
            AtaDevice::Cdrom(cd) => {
                if cd.is_disc_accessible() {
                    0x01
                } else {
                    0x71
                }
            }
            _ => 0x70,
        };
        let b = &mut self.sel(ch).controller.buffer;
        b[0] = ((size + 6) >> 8) as u8;
        b[1] = (size + 6) as u8;
        b[2] = disc_type;
        b[3..8].fill(0);
    }

    fn atapi_cmd_mode_sense(&mut self, ch: usize, opcode: u8, ctx: &mut DevCtx) -> u32 {
        let (alloc_length, page_control, page_code) = {
            let b = &self.sel_ref(ch).controller.buffer;
            let alloc = if opcode == 0x5A {
                read_16bit(&b[7..]) as usize
            } else {
                b[4] as usize
            };
            (alloc, b[2] >> 6, b[2] & 0x3F)
        };
        trace!(
            "ATA{}: ATAPI MODE SENSE pc={} page=0x{:02X}",
            ch,
            page_control,
            page_code
        );
        const HEADER: usize = 8;
        let current_values = page_control == 0;
        match page_control {
            0x0 | 0x2 => match page_code {
                0x01 => {
                    // Read Error Recovery
                    self.atapi_init_mode_sense_single(ch, 8);
                    let page = self.sel_ref(ch).drive.atapi.error_recovery;
                    self.sel(ch).controller.buffer[HEADER..HEADER + 8].copy_from_slice(&page);
                    self.atapi_init_send(ch, opcode, HEADER + 8, alloc_length);
                    DEFAULT_CMD_US
                }
                0x0D => {
                    // CD-ROM Parameters
                    self.atapi_init_mode_sense_single(ch, 8);
                    let mult = match &self.sel_ref(ch).device {
                        AtaDevice::Cdrom(cd) => cd.timeout_mult(),
                        _ => 0,
                    };
                    let b = &mut self.sel(ch).controller.buffer;
                    b[HEADER] = 0x0D;
                    b[HEADER + 1] = 0x06;
                    b[HEADER + 2] = 0;
                    b[HEADER + 3] = mult;
                    b[HEADER + 4] = 0;
                    b[HEADER + 5] = 60; // seconds per MSF minute
                    b[HEADER + 6] = 0;
                    b[HEADER + 7] = 75; // frames per MSF second
                    self.atapi_init_send(ch, opcode, HEADER + 8, alloc_length);
                    DEFAULT_CMD_US
                }
                0x0E => {
                    // CD-ROM Audio Control
                    self.atapi_init_mode_sense_single(ch, 16);
                    let (p0, p1) = match &self.sel_ref(ch).device {
                        AtaDevice::Cdrom(cd) => (cd.get_audio_port(0), cd.get_audio_port(1)),
                        _ => ((1, 0xFF), (2, 0xFF)),
                    };
                    let b = &mut self.sel(ch).controller.buffer;
                    b[HEADER] = 0x0E;
                    b[HEADER + 1] = 0x0E;
                    b[HEADER + 2] = 1 << 2; // Immed
                    b[HEADER + 3] = 0;
                    b[HEADER + 4] = 0;
                    b[HEADER + 5] = 0;
                    b[HEADER + 6] = 0;
                    b[HEADER + 7] = 75; // LBAs per second of audio
                    if current_values {
                        b[HEADER + 8] = p0.0;
                        b[HEADER + 9] = p0.1;
                        b[HEADER + 10] = p1.0;
                        b[HEADER + 11] = p1.1;
                    } else {
                        b[HEADER + 8] = 1;
                        b[HEADER + 9] = 0xFF;
                        b[HEADER + 10] = 2;
                        b[HEADER + 11] = 0xFF;
                    }
                    b[HEADER + 12] = 0;
                    b[HEADER + 13] = 0;
                    b[HEADER + 14] = 0;
                    b[HEADER + 15] = 0;
                    self.atapi_init_send(ch, opcode, HEADER + 16, alloc_length);
                    DEFAULT_CMD_US
                }
                0x2A => {
                    // CD-ROM Capabilities and Mechanical Status
                    self.atapi_init_mode_sense_single(ch, 20);
                    let (locked, max_kb, cur_kb) = match &self.sel_ref(ch).device {
                        AtaDevice::Cdrom(cd) => {
                            (cd.is_door_locked(), cd.max_speed_kb(), cd.cur_speed_kb())
                        }
                        _ => (false, 0, 0),
                    };
                    let b = &mut self.sel(ch).controller.buffer;
                    b[HEADER] = 0x2A;
                    b[HEADER + 1] = 0x12;
                    b[HEADER + 2] = 0x07; // method 2, CD-E/CD-R read
                    b[HEADER + 3] = 0x00; // no write support
                    b[HEADER + 4] = 0x71; // multisession, mode 2, audio
                    b[HEADER + 5] = 0xFF; // UPC/ISRC/C2/CDDA
                    b[HEADER + 6] = 1 | ((locked as u8) << 1) | (1 << 3) | (1 << 5);
                    b[HEADER + 7] = 0x03; // separate mute and volume
                    b[HEADER + 8] = (max_kb >> 8) as u8;
                    b[HEADER + 9] = max_kb as u8;
                    b[HEADER + 10] = 1; // 256 volume levels, MSB
                    b[HEADER + 11] = 0;
                    b[HEADER + 12] = (512u16 >> 8) as u8; // buffer KB
                    b[HEADER + 13] = 0;
                    let speed = if current_values { cur_kb } else { max_kb };
                    b[HEADER + 14] = (speed >> 8) as u8;
                    b[HEADER + 15] = speed as u8;
                    b[HEADER + 16] = 0;
                    b[HEADER + 17] = 0;
                    b[HEADER + 18] = 0;
                    b[HEADER + 19] = 0;
                    self.atapi_init_send(ch, opcode, HEADER + 20, alloc_length);
                    DEFAULT_CMD_US
                }
                _ => {
                    trace!(
                        "ATA{}: ATAPI MODE SENSE page 0x{:02X} not implemented",
                        ch,
                        page_code
                    );
                    self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
                    self.atapi_error(ch, true, ctx);
                    0
                }
            },
            0x1 => {
                self.atapi_set_sense(ch, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD_IN_CMD_PACKET, 0);
                self.atapi_error(ch, true, ctx);
                0
            }
            _ => {
                self.atapi_set_sense(
                    ch,
                    SENSE_ILLEGAL_REQUEST,
                    ASC_SAVING_PARAMETERS_NOT_SUPPORTED,
                    0,
                );
                self.atapi_error(ch, true, ctx);
                0
            }
        }
    }
}
