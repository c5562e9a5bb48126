//! CD-ROM drive: disc state machine, table of contents, audio player.
//!
//! The data path reads 2048-byte sectors from a raw ISO image.  The
//! TOC is synthesised from the track list (a plain ISO gives one data
//! track plus lead-out); audio playback advances the head position
//! against virtual time at 75 frames per second.  The audio state is
//! behind a mutex because the mixer thread polls it for samples while
//! the machine thread drives the SCSI-ish transitions.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::error::ConfigError;
use crate::machine::clock::SEC;

pub const CD_SECTOR_SIZE: usize = 2048;
/// CD audio frame rate: 1 second = 75 frames.
pub const CD_FPS: u64 = 75;
/// Frames hidden before track 1 (MSF 00:02:00).
pub const CD_MSF_OFFSET: i64 = 150;

// ── MSF addressing ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msf {
    pub min: u8,
    pub sec: u8,
    pub fr: u8,
}

impl Msf {
    pub fn from_bytes(b: &[u8]) -> Self {
        Self {
            min: b[0],
            sec: b[1],
            fr: b[2],
        }
    }

    pub fn from_frames(frames: i64) -> Self {
        Self {
            min: (frames / (60 * 75)) as u8,
            sec: ((frames / 75) % 60) as u8,
            fr: (frames % 75) as u8,
        }
    }

    pub fn to_frames(self) -> i64 {
        self.min as i64 * 60 * 75 + self.sec as i64 * 75 + self.fr as i64
    }
}

// ── Disc model ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscState {
    NoDisc,
    DoorOpen,
    DoorClosing,
    Ejecting,
    SpinningUp,
    Idle,
    Ready,
}

#[derive(Debug, Clone, Copy)]
pub struct Track {
    pub number: u8,
    /// Control nibble; bit 2 = data track.
    pub attr: u8,
    pub start_lba: i64,
    pub length: i64,
}

impl Track {
    pub fn is_audio(&self) -> bool {
        self.attr & 0x04 == 0
    }
}

pub struct Disc {
    pub tracks: Vec<Track>,
    pub sectors: i64,
    image: Option<(PathBuf, File)>,
}

impl Disc {
    /// A plain ISO: one data track, lead-out after the image.
    pub fn from_iso(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingImage(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if size % CD_SECTOR_SIZE as u64 != 0 {
            return Err(ConfigError::BadImage {
                path: path.to_path_buf(),
                reason: "not a multiple of 2048 bytes".to_string(),
            });
        }
        let sectors = (size / CD_SECTOR_SIZE as u64) as i64;
        Ok(Self {
            tracks: vec![Track {
                number: 1,
                attr: 0x14,
                start_lba: 0,
                length: sectors,
            }],
            sectors,
            image: Some((path.to_path_buf(), file)),
        })
    }

    /// Synthetic disc for mixed-mode layouts (used by tests too).
    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        let sectors = tracks.iter().map(|t| t.start_lba + t.length).max().unwrap_or(0);
        Self {
            tracks,
            sectors,
            image: None,
        }
    }

    fn read_sector(&mut self, lba: u64, buffer: &mut [u8]) -> bool {
        match &mut self.image {
            Some((_, f)) => f
                .seek(SeekFrom::Start(lba * CD_SECTOR_SIZE as u64))
                .and_then(|_| f.read_exact(&mut buffer[..CD_SECTOR_SIZE]))
                .is_ok(),
            None => {
                buffer[..CD_SECTOR_SIZE].fill(0);
                true
            }
        }
    }
}

// ── Audio player ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioStatus {
    Playing,
    Paused,
    Stopped,
    /// Play completed successfully since the last status poll.
    Completed,
}

#[derive(Debug)]
struct AudioState {
    status: AudioStatus,
    start_lba: i64,
    end_lba: i64,
    /// Virtual time the playback (re)started.
    start_time_us: u64,
    /// Position latched on pause.
    paused_lba: i64,
    completed_reported: bool,
}

impl AudioState {
    fn position(&self, now_us: u64) -> i64 {
        match self.status {
            AudioStatus::Playing => {
                let advanced = (now_us.saturating_sub(self.start_time_us)) * CD_FPS / 1_000_000;
                (self.start_lba + advanced as i64).min(self.end_lba)
            }
            AudioStatus::Paused => self.paused_lba,
            _ => -1,
        }
    }
}

// ── The drive ─────────────────────────────────────────────────

pub struct CdRomDrive {
    disc: Option<Disc>,
    state: DiscState,
    /// Virtual-time µs when the current state transition completes.
    state_eta_us: u64,
    door_locked: bool,
    medium_changed: bool,
    audio: Arc<Mutex<AudioState>>,
    /// MODE SELECT page 0x0D inactivity multiplier.
    timeout_mult: u8,
    sotc: bool,
    audio_ports: [(u8, u8); 2],

    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// 1x = 150 KB/s; this is a 8x unit.
    speed_factor: u32,
}

const SPIN_UP_US: u64 = 1_600_000;
const DOOR_CLOSE_NS: u64 = 2 * SEC;

impl Default for CdRomDrive {
    fn default() -> Self {
        Self::new()
    }
}

impl CdRomDrive {
    pub fn new() -> Self {
        Self {
            disc: None,
            state: DiscState::NoDisc,
            state_eta_us: 0,
            door_locked: false,
            medium_changed: false,
            audio: Arc::new(Mutex::new(AudioState {
                status: AudioStatus::Stopped,
                start_lba: 0,
                end_lba: 0,
                start_time_us: 0,
                paused_lba: -1,
                completed_reported: true,
            })),
            timeout_mult: 0,
            sotc: false,
            audio_ports: [(1, 0xFF), (2, 0xFF)],
            vendor: "QUARTZ  ".to_string(),
            product: "CD-ROM DRIVE    ".to_string(),
            revision: "1.0 ".to_string(),
            model: "QUARTZ CD-ROM".to_string(),
            serial: "QZCD000000000001".to_string(),
            firmware: "1.0".to_string(),
            speed_factor: 8,
        }
    }

    pub fn insert_disc(&mut self, disc: Disc, now_us: u64) {
        info!("CD-ROM: disc inserted ({} sectors)", disc.sectors);
        self.disc = Some(disc);
        self.state = DiscState::SpinningUp;
        self.state_eta_us = now_us + SPIN_UP_US;
        self.medium_changed = true;
    }

    pub fn insert_iso(&mut self, path: &Path, now_us: u64) -> Result<(), ConfigError> {
        let disc = Disc::from_iso(path)?;
        self.insert_disc(disc, now_us);
        Ok(())
    }

    pub fn eject(&mut self) -> bool {
        if self.door_locked {
            return false;
        }
        if self.disc.is_some() {
            debug!("CD-ROM: disc ejected");
        }
        self.disc = None;
        self.state = DiscState::DoorOpen;
        self.medium_changed = true;
        self.stop_audio();
        true
    }

    // ── disc state ────────────────────────────────────────────

    /// Resolve timed transitions against virtual time.
    pub fn disc_state(&mut self, now_us: u64) -> DiscState {
        if self.state == DiscState::SpinningUp && now_us >= self.state_eta_us {
            self.state = DiscState::Ready;
        }
        if self.state == DiscState::DoorClosing && now_us >= self.state_eta_us {
            self.state = if self.disc.is_some() {
                DiscState::SpinningUp
            } else {
                DiscState::NoDisc
            };
            self.state_eta_us = now_us + SPIN_UP_US;
        }
        self.state
    }

    pub fn spin_up(&mut self, now_us: u64) {
        if self.disc.is_some() && matches!(self.state, DiscState::Idle) {
            self.state = DiscState::SpinningUp;
            self.state_eta_us = now_us + SPIN_UP_US / 4;
        }
    }

    pub fn spin_down(&mut self) {
        if self.state == DiscState::Ready {
            self.state = DiscState::Idle;
        }
    }

    pub fn open_door(&mut self) {
        self.eject();
    }

    /// Returns the time the closing takes, in ns.
    pub fn close_door(&mut self, now_us: u64) -> u64 {
        if self.state == DiscState::DoorOpen {
            self.state = DiscState::DoorClosing;
            self.state_eta_us = now_us + DOOR_CLOSE_NS / 1000;
            DOOR_CLOSE_NS
        } else {
            0
        }
    }

    pub fn time_to_ready_us(&self, now_us: u64) -> u64 {
        match self.state {
            DiscState::SpinningUp | DiscState::DoorClosing => {
                self.state_eta_us.saturating_sub(now_us)
            }
            _ => 0,
        }
    }

    pub fn lock_door(&mut self, lock: bool) {
        self.door_locked = lock;
    }

    pub fn is_door_locked(&self) -> bool {
        self.door_locked
    }

    pub fn is_disc_accessible(&self) -> bool {
        self.disc.is_some()
            && matches!(
                self.state,
                DiscState::SpinningUp | DiscState::Idle | DiscState::Ready
            )
    }

    /// Reads and clears the media-changed latch when `ack` is set.
    pub fn has_medium_changed(&mut self, ack: bool) -> bool {
        let changed = self.medium_changed;
        if ack {
            self.medium_changed = false;
        }
        changed
    }

    pub fn sectors(&self) -> i64 {
        self.disc.as_ref().map_or(0, |d| d.sectors)
    }

    pub fn max_lba(&self) -> i64 {
        self.sectors() - 1
    }

    pub fn max_speed_kb(&self) -> u16 {
        (self.speed_factor * 150) as u16
    }

    pub fn cur_speed_kb(&self) -> u16 {
        self.max_speed_kb()
    }

    pub fn set_timeout_mult(&mut self, v: u8) {
        self.timeout_mult = v;
    }

    pub fn timeout_mult(&self) -> u8 {
        self.timeout_mult
    }

    pub fn set_sotc(&mut self, sotc: bool) {
        self.sotc = sotc;
    }

    pub fn set_audio_port(&mut self, port: usize, channel: u8, volume: u8) {
        self.audio_ports[port] = (channel, volume);
    }

    pub fn get_audio_port(&self, port: usize) -> (u8, u8) {
        self.audio_ports[port]
    }

    // ── data path ─────────────────────────────────────────────

    pub fn read_sector(&mut self, lba: i64, buffer: &mut [u8]) -> bool {
        match &mut self.disc {
            Some(d) if lba >= 0 && lba < d.sectors => d.read_sector(lba as u64, buffer),
            _ => false,
        }
    }

    pub fn lba_to_chs(&self, lba: i64) -> (i64, i64, i64) {
        // one spiral "cylinder" per minute of playback
        let frames_per_cyl = 60 * CD_FPS as i64;
        (lba / frames_per_cyl, 0, lba % frames_per_cyl)
    }

    pub fn transfer_time_us(&self, amount: u32) -> u32 {
        // 2048 bytes per sector at speed_factor * 150 KB/s
        let bytes = amount as u64 * CD_SECTOR_SIZE as u64;
        (bytes * 1_000_000 / (self.max_speed_kb() as u64 * 1024)) as u32
    }

    pub fn rotational_latency_us(&self) -> u32 {
        // CLV drive, ~300ms full stroke; use half a frame window
        (1_000_000 / CD_FPS / 2) as u32
    }

    pub fn seek_move_time_us(&self, c0: i64, c1: i64) -> u32 {
        let dist = (c1 - c0).unsigned_abs() as u32;
        if dist == 0 {
            return 0;
        }
        // ~120ms average, scaled by distance across the disc
        20_000 + dist * 2_000
    }

    // ── TOC ───────────────────────────────────────────────────

    /// SFF-8020i READ TOC formats 0 (tracks), 1 (session info) and
    /// 2 (full TOC).  Returns the response length.
    pub fn read_toc(
        &self,
        buffer: &mut [u8],
        msf: bool,
        starting_track: u8,
        format: u8,
    ) -> Option<usize> {
        let disc = self.disc.as_ref()?;
        let leadout = disc.sectors;
        match format {
            0 => {
                let mut len = 4;
                let mut first_track = 0;
                for t in &disc.tracks {
                    if first_track == 0 {
                        first_track = t.number;
                    }
                    if t.number >= starting_track || starting_track == 0 {
                        buffer[len] = 0;
                        buffer[len + 1] = t.attr;
                        buffer[len + 2] = t.number;
                        buffer[len + 3] = 0;
                        Self::put_lba(&mut buffer[len + 4..], t.start_lba, msf);
                        len += 8;
                    }
                }
                // lead-out descriptor, track 0xAA
                buffer[len] = 0;
                buffer[len + 1] = 0x16;
                buffer[len + 2] = 0xAA;
                buffer[len + 3] = 0;
                Self::put_lba(&mut buffer[len + 4..], leadout, msf);
                len += 8;
                buffer[0] = ((len - 2) >> 8) as u8;
                buffer[1] = (len - 2) as u8;
                buffer[2] = first_track;
                buffer[3] = disc.tracks.last().map_or(0, |t| t.number);
                Some(len)
            }
            1 => {
                // multi-session info: single session discs only
                buffer[0] = 0;
                buffer[1] = 0x0A;
                buffer[2] = 1; // first session
                buffer[3] = 1; // last session
                let first = disc.tracks.first()?;
                buffer[4] = 0;
                buffer[5] = first.attr;
                buffer[6] = first.number;
                buffer[7] = 0;
                Self::put_lba(&mut buffer[8..], first.start_lba, msf);
                Some(12)
            }
            2 => {
                // raw TOC: Q sub-channel points
                let mut len = 4;
                for t in &disc.tracks {
                    buffer[len] = 1; // session
                    buffer[len + 1] = t.attr;
                    buffer[len + 2] = 0;
                    buffer[len + 3] = t.number; // POINT
                    buffer[len + 4] = 0;
                    buffer[len + 5] = 0;
                    buffer[len + 6] = 0;
                    let m = Msf::from_frames(t.start_lba + CD_MSF_OFFSET);
                    buffer[len + 7] = 0;
                    buffer[len + 8] = m.min;
                    buffer[len + 9] = m.sec;
                    buffer[len + 10] = m.fr;
                    len += 11;
                }
                buffer[0] = ((len - 2) >> 8) as u8;
                buffer[1] = (len - 2) as u8;
                buffer[2] = 1;
                buffer[3] = 1;
                Some(len)
            }
            _ => None,
        }
    }

    fn put_lba(buffer: &mut [u8], lba: i64, msf: bool) {
        if msf {
            let m = Msf::from_frames(lba + CD_MSF_OFFSET);
            buffer[0] = 0;
            buffer[1] = m.min;
            buffer[2] = m.sec;
            buffer[3] = m.fr;
        } else {
            buffer[0] = (lba >> 24) as u8;
            buffer[1] = (lba >> 16) as u8;
            buffer[2] = (lba >> 8) as u8;
            buffer[3] = lba as u8;
        }
    }

    fn track_at(&self, lba: i64) -> Option<&Track> {
        self.disc
            .as_ref()?
            .tracks
            .iter()
            .find(|t| lba >= t.start_lba && lba < t.start_lba + t.length)
    }

    // ── audio ─────────────────────────────────────────────────

    pub fn check_play_audio(&self, start_lba: i64, end_lba: i64) -> Result<(), (u8, u8)> {
        const SENSE_ILLEGAL_REQUEST: u8 = 5;
        if start_lba < 0 || end_lba < start_lba || start_lba > self.max_lba() {
            return Err((SENSE_ILLEGAL_REQUEST, 0x21)); // LBA out of range
        }
        match self.track_at(start_lba) {
            Some(t) if t.is_audio() => Ok(()),
            // play on a data track: illegal mode for this track
            Some(_) => Err((SENSE_ILLEGAL_REQUEST, 0x64)),
            None => Err((SENSE_ILLEGAL_REQUEST, 0x21)),
        }
    }

    pub fn play_audio(&mut self, start_lba: i64, end_lba: i64, now_us: u64, delay_us: u64) {
        let mut audio = self.audio.lock().unwrap();
        audio.status = AudioStatus::Playing;
        audio.start_lba = start_lba;
        audio.end_lba = end_lba.min(self.disc.as_ref().map_or(end_lba, |d| d.sectors));
        audio.start_time_us = now_us + delay_us;
        audio.completed_reported = false;
        debug!("CD-ROM: playing audio {}..{}", start_lba, audio.end_lba);
    }

    /// Pause (resume=false) or resume playback.  Fails when there is
    /// no operation to pause/resume.
    pub fn pause_resume_audio(&mut self, resume: bool, now_us: u64) -> bool {
        let mut audio = self.audio.lock().unwrap();
        if resume {
            if audio.status != AudioStatus::Paused {
                return false;
            }
            audio.start_lba = audio.paused_lba;
            audio.start_time_us = now_us;
            audio.status = AudioStatus::Playing;
        } else {
            if audio.status != AudioStatus::Playing {
                return false;
            }
            audio.paused_lba = audio.position(now_us);
            audio.status = AudioStatus::Paused;
        }
        true
    }

    pub fn stop_audio(&mut self) {
        let mut audio = self.audio.lock().unwrap();
        if audio.status == AudioStatus::Playing || audio.status == AudioStatus::Paused {
            debug!("CD-ROM: audio stopped");
        }
        audio.status = AudioStatus::Stopped;
        audio.completed_reported = true;
    }

    /// Audio status and, when playing/paused, the head position.
    pub fn get_audio_status(&mut self, now_us: u64) -> (AudioStatus, i64) {
        let mut audio = self.audio.lock().unwrap();
        if audio.status == AudioStatus::Playing && audio.position(now_us) >= audio.end_lba {
            audio.status = if audio.completed_reported {
                AudioStatus::Stopped
            } else {
                audio.completed_reported = true;
                AudioStatus::Completed
            };
        }
        (audio.status, audio.position(now_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_disc() -> Disc {
        Disc::from_tracks(vec![
            Track { number: 1, attr: 0x14, start_lba: 0, length: 1000 },
            Track { number: 2, attr: 0x10, start_lba: 1000, length: 4500 },
            Track { number: 3, attr: 0x10, start_lba: 5500, length: 4500 },
        ])
    }

    #[test]
    fn msf_conversion() {
        let m = Msf::from_frames(2 * 60 * 75 + 30 * 75 + 44);
        assert_eq!((m.min, m.sec, m.fr), (2, 30, 44));
        assert_eq!(m.to_frames(), 2 * 60 * 75 + 30 * 75 + 44);
    }

    #[test]
    fn spin_up_takes_time() {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(audio_disc(), 0);
        assert_eq!(cd.disc_state(0), DiscState::SpinningUp);
        assert!(cd.time_to_ready_us(0) > 0);
        assert_eq!(cd.disc_state(SPIN_UP_US), DiscState::Ready);
    }

    #[test]
    fn toc_format0_lists_tracks_and_leadout() {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(audio_disc(), 0);
        let mut buf = [0u8; 128];
        let len = cd.read_toc(&mut buf, false, 0, 0).unwrap();
        assert_eq!(len, 4 + 4 * 8);
        assert_eq!(buf[2], 1); // first track
        assert_eq!(buf[3], 3); // last track
        assert_eq!(buf[4 + 3 * 8 + 2], 0xAA); // lead-out
        // lead-out LBA
        let lo = &buf[4 + 3 * 8 + 4..];
        let lba = i64::from(lo[0]) << 24 | i64::from(lo[1]) << 16 | i64::from(lo[2]) << 8 | i64::from(lo[3]);
        assert_eq!(lba, 10_000);
    }

    #[test]
    fn toc_msf_encoding_offsets_by_2_seconds() {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(audio_disc(), 0);
        let mut buf = [0u8; 128];
        cd.read_toc(&mut buf, true, 0, 0).unwrap();
        // track 1 starts at LBA 0 = MSF 00:02:00
        assert_eq!(&buf[8..12], &[0, 0, 2, 0]);
    }

    #[test]
    fn audio_play_advances_with_virtual_time() {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(audio_disc(), 0);
        cd.play_audio(1000, 2000, 0, 0);
        let (status, pos) = cd.get_audio_status(1_000_000);
        assert_eq!(status, AudioStatus::Playing);
        assert_eq!(pos, 1075); // one second is 75 frames
        // past the end: completed once, then stopped
        let (status, _) = cd.get_audio_status(60_000_000);
        assert_eq!(status, AudioStatus::Completed);
        let (status, _) = cd.get_audio_status(60_000_000);
        assert_eq!(status, AudioStatus::Stopped);
    }

    #[test]
    fn pause_latches_position() {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(audio_disc(), 0);
        cd.play_audio(1000, 5000, 0, 0);
        assert!(cd.pause_resume_audio(false, 2_000_000));
        let (status, pos) = cd.get_audio_status(10_000_000);
        assert_eq!(status, AudioStatus::Paused);
        assert_eq!(pos, 1150);
        assert!(cd.pause_resume_audio(true, 10_000_000));
        let (_, pos) = cd.get_audio_status(11_000_000);
        assert_eq!(pos, 1225);
    }

    #[test]
    fn play_on_data_track_is_rejected() {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(audio_disc(), 0);
        assert!(cd.check_play_audio(1000, 2000).is_ok());
        let err = cd.check_play_audio(10, 100).unwrap_err();
        assert_eq!(err, (5, 0x64));
    }

    #[test]
    fn locked_door_blocks_eject() {
        let mut cd = CdRomDrive::new();
        cd.insert_disc(audio_disc(), 0);
        cd.lock_door(true);
        assert!(!cd.eject());
        cd.lock_door(false);
        assert!(cd.eject());
        assert!(cd.has_medium_changed(true));
        assert!(!cd.has_medium_changed(false));
    }
}
