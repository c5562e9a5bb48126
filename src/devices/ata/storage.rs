//! Storage device model: geometry, performance characteristics and
//! the timing math shared by the ATA drives.
//!
//! The mechanical model splits a seek into overhead + per-cylinder
//! average speed, both derived from the two figures drive data sheets
//! actually publish (track-to-track and full stroke).  Rotational
//! position is tracked as a fraction of a turn so rotational latency
//! can be computed for any target sector.
//!
//! A look-ahead cache window is simulated purely with timestamps: an
//! access inside the window and on the cached track skips the
//! rotational latency.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::error::ConfigError;

pub const SECTOR_SIZE: usize = 512;
/// Gap + servo + ECC bytes per track, used for media timing only.
const TRACK_OVERHEAD: f64 = 512.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub spt: u32,
    pub wpcomp: i32,
    pub lzone: u32,
}

impl MediaGeometry {
    pub fn sectors(&self) -> u64 {
        self.cylinders as u64 * self.heads as u64 * self.spt as u64
    }
}

/// Figures from the drive's data sheet.
#[derive(Debug, Clone, Copy)]
pub struct DrivePerformance {
    pub seek_max_ms: f64,
    pub seek_trk_ms: f64,
    pub rot_speed_rpm: u32,
    pub interleave: u32,
    pub overh_time_ms: f64,
}

impl Default for DrivePerformance {
    fn default() -> Self {
        // a late-80s 3600rpm unit
        Self {
            seek_max_ms: 40.0,
            seek_trk_ms: 8.0,
            rot_speed_rpm: 3600,
            interleave: 4,
            overh_time_ms: 5.0,
        }
    }
}

/// Derived timing figures, all in microseconds.
#[derive(Debug, Clone, Copy)]
pub struct DriveTimings {
    pub trk_read_us: u32,
    pub trk2trk_us: u32,
    pub seek_overhead_us: u32,
    pub seek_avgspeed_us: u32,
    pub sec_read_us: u32,
    pub sec_xfer_us: u32,
}

impl DriveTimings {
    pub fn from_perf(perf: &DrivePerformance, geom: &MediaGeometry) -> Self {
        let trk_read_us = (6.0e7 / perf.rot_speed_rpm as f64).round() as u32;
        let trk2trk_us = (perf.seek_trk_ms * 1000.0) as u32;
        // trk2trk = overhead + avgspeed
        // maximum = overhead + avgspeed*(ncyls-1)
        let seek_avgspeed_us = (((perf.seek_max_ms - perf.seek_trk_ms)
            / (geom.cylinders.max(3) - 2) as f64)
            * 1000.0)
            .round() as u32;
        let seek_overhead_us = trk2trk_us.saturating_sub(seek_avgspeed_us);
        let bytes_pt = geom.spt as f64 * SECTOR_SIZE as f64 + TRACK_OVERHEAD;
        let bytes_us = bytes_pt / trk_read_us as f64;
        let sec_read_us = (SECTOR_SIZE as f64 / bytes_us).round() as u32;
        let sec_xfer_us = (sec_read_us as f64 * (perf.interleave as f64 * 0.8).max(1.0)) as u32;
        Self {
            trk_read_us,
            trk2trk_us,
            seek_overhead_us,
            seek_avgspeed_us,
            sec_read_us,
            sec_xfer_us,
        }
    }
}

// ── Hard disk drive ───────────────────────────────────────────

pub struct HardDisk {
    pub geometry: MediaGeometry,
    pub perf: DrivePerformance,
    pub timings: DriveTimings,
    pub path: PathBuf,
    file: File,

    pub serial: String,
    pub model: String,
    pub firmware: String,

    /// Fractional track position at `last_pos_time_us`.
    last_head_pos: f64,
    last_pos_time_us: u64,
    power_on_time_us: u64,
    power_up_duration_us: u64,
}

impl HardDisk {
    pub fn open(path: &Path, geometry: MediaGeometry, perf: DrivePerformance) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::MissingImage(path.to_path_buf()));
        }
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        if size != geometry.sectors() * SECTOR_SIZE as u64 {
            return Err(ConfigError::BadImage {
                path: path.to_path_buf(),
                reason: format!(
                    "image is {} bytes, geometry wants {}",
                    size,
                    geometry.sectors() * SECTOR_SIZE as u64
                ),
            });
        }
        let timings = DriveTimings::from_perf(&perf, &geometry);
        info!(
            "hard disk '{}': C/H/S {}/{}/{}, {} RPM",
            path.display(),
            geometry.cylinders,
            geometry.heads,
            geometry.spt,
            perf.rot_speed_rpm
        );
        debug!(
            "  trk2trk {} us, ovh {} us, avg {} us/cyl, sec read {} us",
            timings.trk2trk_us, timings.seek_overhead_us, timings.seek_avgspeed_us, timings.sec_read_us
        );
        Ok(Self {
            geometry,
            perf,
            timings,
            path: path.to_path_buf(),
            file,
            serial: format!("QZ{:014}", size % 99_999_999),
            model: "QUARTZ FIXED DISK".to_string(),
            firmware: "1.0".to_string(),
            last_head_pos: 0.0,
            last_pos_time_us: 0,
            power_on_time_us: 0,
            power_up_duration_us: 1_500_000,
        })
    }

    /// Create a zero-filled image matching the geometry.
    pub fn create(path: &Path, geometry: MediaGeometry) -> Result<(), ConfigError> {
        let f = File::create(path)?;
        f.set_len(geometry.sectors() * SECTOR_SIZE as u64)?;
        Ok(())
    }

    pub fn sectors(&self) -> u64 {
        self.geometry.sectors()
    }

    // ── addressing ────────────────────────────────────────────

    pub fn chs_to_lba(&self, c: u32, h: u32, s: u32) -> i64 {
        if s == 0 {
            return -1;
        }
        ((c as i64 * self.geometry.heads as i64) + h as i64) * self.geometry.spt as i64
            + (s as i64 - 1)
    }

    pub fn lba_to_chs(&self, lba: i64) -> (i64, i64, i64) {
        let spt = self.geometry.spt as i64;
        let heads = self.geometry.heads as i64;
        let c = lba / (heads * spt);
        let h = (lba / spt) % heads;
        let s = (lba % spt) + 1;
        (c, h, s)
    }

    pub fn lba_to_cylinder(&self, lba: i64) -> i64 {
        lba / (self.geometry.heads as i64 * self.geometry.spt as i64)
    }

    pub fn lba_to_head(&self, lba: i64) -> i64 {
        (lba / self.geometry.spt as i64) % self.geometry.heads as i64
    }

    // ── media I/O ─────────────────────────────────────────────

    pub fn read_sector(&mut self, lba: u64, buffer: &mut [u8]) {
        let offset = lba * SECTOR_SIZE as u64;
        if let Err(e) = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(&mut buffer[..SECTOR_SIZE]))
        {
            // short read: zero-fill and keep the guest going
            error!("hdd read at lba {} failed: {}", lba, e);
            buffer[..SECTOR_SIZE].fill(0);
        }
    }

    pub fn write_sector(&mut self, lba: u64, buffer: &[u8]) {
        let offset = lba * SECTOR_SIZE as u64;
        if let Err(e) = self
            .file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&buffer[..SECTOR_SIZE]))
            .and_then(|_| self.file.flush())
        {
            error!("hdd write at lba {} failed: {}", lba, e);
        }
    }

    // ── mechanics ─────────────────────────────────────────────

    pub fn power_on(&mut self, now_us: u64) {
        self.power_on_time_us = now_us;
        self.last_pos_time_us = now_us;
        self.last_head_pos = 0.0;
    }

    /// Microseconds until the spindle is at speed; 0 when ready.
    pub fn power_up_eta_us(&self, now_us: u64) -> u64 {
        let ready = self.power_on_time_us + self.power_up_duration_us;
        ready.saturating_sub(now_us)
    }

    /// Fractional track position under the head at `now`.
    pub fn head_position(&self, now_us: u64) -> f64 {
        let elapsed = now_us.saturating_sub(self.last_pos_time_us);
        (self.last_head_pos + elapsed as f64 / self.timings.trk_read_us as f64).fract()
    }

    /// Arm move time between two cylinders.
    pub fn seek_move_time_us(&self, c0: i64, c1: i64) -> u32 {
        let dist = (c1 - c0).unsigned_abs();
        if dist == 0 {
            return 0;
        }
        if dist == 1 {
            self.timings.trk2trk_us
        } else {
            self.timings.seek_overhead_us + self.timings.seek_avgspeed_us * dist as u32
        }
    }

    /// Record a seek; the rotational position keeps spinning.
    pub fn seek(&mut self, _c0: i64, _c1: i64) {}

    /// Wait for `sector` (0-based hardware sector on the track) to
    /// pass under the head.
    pub fn rotational_latency_us(&self, head_pos: f64, hw_sector: u32) -> u32 {
        let sect_frac = hw_sector as f64 / self.geometry.spt as f64;
        let mut dist = sect_frac - head_pos;
        if dist < 0.0 {
            dist += 1.0;
        }
        (dist * self.timings.trk_read_us as f64) as u32
    }

    /// Interleave-adjusted hardware sector of a logical sector.
    pub fn hw_sector(&self, s: i64) -> u32 {
        (((s - 1) as u32) * self.perf.interleave) % self.geometry.spt
    }

    /// Total media time for `amount` sectors starting at `lba`,
    /// honouring the look-ahead window: if the access lands on the
    /// track cached since `look_ahead_time_us`, rotational latency is
    /// skipped.
    pub fn transfer_time_us(&mut self, now_us: u64, lba: i64, amount: u32, look_ahead_time_us: u64) -> u32 {
        let (_, _, s) = self.lba_to_chs(lba);
        let pos = self.head_position(now_us);
        let cached = look_ahead_time_us != 0
            && now_us >= look_ahead_time_us
            && (now_us - look_ahead_time_us) >= self.timings.trk_read_us as u64;
        let mut time = 0;
        if !cached {
            time += self.rotational_latency_us(pos, self.hw_sector(s));
        }
        time += self.timings.sec_xfer_us * amount;
        // head position advances with the transfer
        self.last_head_pos = self.head_position(now_us + time as u64);
        self.last_pos_time_us = now_us + time as u64;
        time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> MediaGeometry {
        MediaGeometry {
            cylinders: 615,
            heads: 4,
            spt: 17,
            wpcomp: -1,
            lzone: 615,
        }
    }

    fn hdd() -> (tempfile::TempDir, HardDisk) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.img");
        HardDisk::create(&path, geometry()).unwrap();
        let disk = HardDisk::open(&path, geometry(), DrivePerformance::default()).unwrap();
        (dir, disk)
    }

    #[test]
    fn chs_lba_roundtrip() {
        let (_d, disk) = hdd();
        for lba in [0i64, 1, 16, 17, 67, 615 * 4 * 17 - 1] {
            let (c, h, s) = disk.lba_to_chs(lba);
            assert_eq!(disk.chs_to_lba(c as u32, h as u32, s as u32), lba);
        }
    }

    #[test]
    fn sector_roundtrip() {
        let (_d, mut disk) = hdd();
        let data = [0xC3u8; SECTOR_SIZE];
        disk.write_sector(100, &data);
        let mut back = [0u8; SECTOR_SIZE];
        disk.read_sector(100, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn seek_time_model() {
        let (_d, disk) = hdd();
        assert_eq!(disk.seek_move_time_us(5, 5), 0);
        assert_eq!(disk.seek_move_time_us(5, 6), disk.timings.trk2trk_us);
        // full stroke lands near the data sheet figure
        let full = disk.seek_move_time_us(0, 614);
        let sheet = (DrivePerformance::default().seek_max_ms * 1000.0) as u32;
        assert!((full as i64 - sheet as i64).abs() < 2000, "{} vs {}", full, sheet);
    }

    #[test]
    fn rotational_latency_wraps() {
        let (_d, disk) = hdd();
        // a 3600rpm disk turns in ~16667us
        let lat0 = disk.rotational_latency_us(0.0, 0);
        assert_eq!(lat0, 0);
        let lat = disk.rotational_latency_us(0.5, 0);
        assert!((lat as i64 - disk.timings.trk_read_us as i64 / 2).abs() < 10);
    }

    #[test]
    fn power_up_counts_down() {
        let (_d, mut disk) = hdd();
        disk.power_on(1000);
        assert!(disk.power_up_eta_us(1000) > 0);
        assert_eq!(disk.power_up_eta_us(10_000_000), 0);
    }
}
