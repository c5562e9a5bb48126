//! Raw floppy disk images.
//!
//! A flat sector dump with geometry inferred from the declared media
//! type (and, for 1.44M, from a few known oversized DMF layouts).
//! Short reads are zero-filled and logged; the guest sees good data
//! and the host problem stays in the log.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::error::ConfigError;

pub const SECTOR_SIZE: usize = 512;

/// Installed drive hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloppyDrive {
    None,
    /// 3.5" high density (1.44M)
    Fdd350Hd,
    /// 5.25" high density (1.2M)
    Fdd525Hd,
}

impl FloppyDrive {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(FloppyDrive::None),
            "3.5" => Some(FloppyDrive::Fdd350Hd),
            "5.25" => Some(FloppyDrive::Fdd525Hd),
            _ => None,
        }
    }

    fn mask(self) -> u8 {
        match self {
            FloppyDrive::None => 0x00,
            FloppyDrive::Fdd350Hd => 0x08,
            FloppyDrive::Fdd525Hd => 0x02,
        }
    }

    /// Spindle speed; HD 5.25" drives spin at 360 rpm, the rest at 300.
    pub fn rpm(self) -> u32 {
        match self {
            FloppyDrive::Fdd525Hd => 360,
            _ => 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloppyType {
    None,
    F160k,
    F180k,
    F320k,
    F360k,
    F720k,
    F1_2,
    F1_44,
    F2_88,
}

struct TypeDef {
    trk: u8,
    hd: u8,
    spt: u8,
    sectors: u32,
    drive_mask: u8,
}

impl FloppyType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(FloppyType::None),
            "160K" => Some(FloppyType::F160k),
            "180K" => Some(FloppyType::F180k),
            "320K" => Some(FloppyType::F320k),
            "360K" => Some(FloppyType::F360k),
            "720K" => Some(FloppyType::F720k),
            "1.2M" => Some(FloppyType::F1_2),
            "1.44M" => Some(FloppyType::F1_44),
            "2.88M" => Some(FloppyType::F2_88),
            _ => None,
        }
    }

    pub fn from_size(bytes: u64) -> Option<Self> {
        match bytes / 512 {
            320 => Some(FloppyType::F160k),
            360 => Some(FloppyType::F180k),
            640 => Some(FloppyType::F320k),
            720 => Some(FloppyType::F360k),
            1440 => Some(FloppyType::F720k),
            2400 => Some(FloppyType::F1_2),
            2880 | 3360 | 3444 | 3680 => Some(FloppyType::F1_44),
            5760 => Some(FloppyType::F2_88),
            _ => None,
        }
    }

    fn def(self) -> TypeDef {
        match self {
            FloppyType::None => TypeDef { trk: 0, hd: 0, spt: 0, sectors: 0, drive_mask: 0x00 },
            FloppyType::F160k => TypeDef { trk: 40, hd: 1, spt: 8, sectors: 320, drive_mask: 0x03 },
            FloppyType::F180k => TypeDef { trk: 40, hd: 1, spt: 9, sectors: 360, drive_mask: 0x03 },
            FloppyType::F320k => TypeDef { trk: 40, hd: 2, spt: 8, sectors: 640, drive_mask: 0x03 },
            FloppyType::F360k => TypeDef { trk: 40, hd: 2, spt: 9, sectors: 720, drive_mask: 0x03 },
            FloppyType::F720k => TypeDef { trk: 80, hd: 2, spt: 9, sectors: 1440, drive_mask: 0x1F },
            FloppyType::F1_2 => TypeDef { trk: 80, hd: 2, spt: 15, sectors: 2400, drive_mask: 0x02 },
            FloppyType::F1_44 => TypeDef { trk: 80, hd: 2, spt: 18, sectors: 2880, drive_mask: 0x18 },
            FloppyType::F2_88 => TypeDef { trk: 80, hd: 2, spt: 36, sectors: 5760, drive_mask: 0x10 },
        }
    }
}

/// One mounted image.
pub struct FloppyDisk {
    pub disk_type: FloppyType,
    pub tracks: u8,
    pub heads: u8,
    pub spt: u8,
    pub sectors: u32,
    pub write_protected: bool,
    pub path: PathBuf,
    file: Option<File>,
}

impl FloppyDisk {
    pub fn open(
        devtype: FloppyDrive,
        disk_type: FloppyType,
        path: &Path,
        write_protected: bool,
    ) -> Result<Self, ConfigError> {
        if disk_type == FloppyType::None {
            return Err(ConfigError::InvalidDriveType("none".to_string()));
        }
        let def = disk_type.def();
        if def.drive_mask & devtype.mask() == 0 {
            return Err(ConfigError::BadImage {
                path: path.to_path_buf(),
                reason: "media type not valid for this floppy drive".to_string(),
            });
        }
        if !path.exists() {
            return Err(ConfigError::MissingImage(path.to_path_buf()));
        }

        let mut write_protected = write_protected;
        let file = if write_protected {
            File::open(path)?
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => f,
                Err(e) => {
                    info!("'{}' not writable ({}), opening read-only", path.display(), e);
                    write_protected = true;
                    File::open(path)?
                }
            }
        };

        let size = file.metadata()?.len();
        let (tracks, heads, spt, sectors) = if disk_type == FloppyType::F1_44 && size > 1_474_560 {
            // oversized DMF-style layouts
            let (t, h, s): (u8, u8, u8) = match size {
                1_720_320 => (80, 2, 21),
                1_763_328 => (82, 2, 21),
                1_884_160 => (80, 2, 23),
                _ => {
                    return Err(ConfigError::BadImage {
                        path: path.to_path_buf(),
                        reason: format!("unknown image size {}", size),
                    })
                }
            };
            (t, h, s, t as u32 * h as u32 * s as u32)
        } else {
            if size > def.sectors as u64 * 512 {
                return Err(ConfigError::BadImage {
                    path: path.to_path_buf(),
                    reason: "file too large for selected type".to_string(),
                });
            }
            (def.trk, def.hd, def.spt, def.sectors)
        };

        Ok(Self {
            disk_type,
            tracks,
            heads,
            spt,
            sectors,
            write_protected,
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Create a zero-filled image of the given type.
    pub fn create(disk_type: FloppyType, path: &Path) -> Result<(), ConfigError> {
        let def = disk_type.def();
        let f = File::create(path)?;
        f.set_len(def.sectors as u64 * 512)?;
        info!("created blank {}-sector image '{}'", def.sectors, path.display());
        Ok(())
    }

    pub fn read(&mut self, offset: u64, buffer: &mut [u8]) {
        let file = match &mut self.file {
            Some(f) => f,
            None => {
                buffer.fill(0);
                return;
            }
        };
        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            error!("floppy image seek to {} failed: {}", offset, e);
            buffer.fill(0);
            return;
        }
        let mut read = 0;
        while read < buffer.len() {
            match file.read(&mut buffer[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) => {
                    error!("floppy image read failed: {}", e);
                    break;
                }
            }
        }
        if read < buffer.len() {
            // zero-fill the short tail, guest continues
            debug!("partial read on floppy image: {}/{}", read, buffer.len());
            buffer[read..].fill(0);
        }
    }

    pub fn write(&mut self, offset: u64, buffer: &[u8]) {
        debug_assert!(!self.write_protected);
        let file = match &mut self.file {
            Some(f) => f,
            None => return,
        };
        if let Err(e) = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(buffer))
            .and_then(|_| file.flush())
        {
            error!("floppy image write failed: {}", e);
        }
    }

    pub fn close(&mut self) {
        self.file.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_image(disk_type: FloppyType) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fd.img");
        FloppyDisk::create(disk_type, &path).unwrap();
        (dir, path)
    }

    #[test]
    fn type_table_geometry() {
        let (_dir, path) = blank_image(FloppyType::F1_44);
        let disk =
            FloppyDisk::open(FloppyDrive::Fdd350Hd, FloppyType::F1_44, &path, false).unwrap();
        assert_eq!((disk.tracks, disk.heads, disk.spt), (80, 2, 18));
        assert_eq!(disk.sectors, 2880);
    }

    #[test]
    fn wrong_drive_for_media_is_rejected() {
        let (_dir, path) = blank_image(FloppyType::F1_2);
        let err = FloppyDisk::open(FloppyDrive::Fdd350Hd, FloppyType::F1_2, &path, false);
        assert!(err.is_err());
    }

    #[test]
    fn sector_roundtrip() {
        let (_dir, path) = blank_image(FloppyType::F720k);
        let mut disk =
            FloppyDisk::open(FloppyDrive::Fdd350Hd, FloppyType::F720k, &path, false).unwrap();
        let data = [0x5A; SECTOR_SIZE];
        disk.write(9 * 512, &data);
        let mut back = [0u8; SECTOR_SIZE];
        disk.read(9 * 512, &mut back);
        assert_eq!(back, data);
    }

    #[test]
    fn short_read_past_end_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.img");
        std::fs::write(&path, vec![0xFF; 256]).unwrap();
        // size check rejects only too-large files; short files read as zeros
        let mut disk =
            FloppyDisk::open(FloppyDrive::Fdd350Hd, FloppyType::F720k, &path, true).unwrap();
        let mut buf = [0xAA; SECTOR_SIZE];
        disk.read(0, &mut buf);
        assert_eq!(&buf[..256], &[0xFF; 256][..]);
        assert_eq!(&buf[256..], &[0x00; 256][..]);
    }

    #[test]
    fn size_detection() {
        assert_eq!(FloppyType::from_size(1_474_560), Some(FloppyType::F1_44));
        assert_eq!(FloppyType::from_size(368_640 * 2), Some(FloppyType::F720k));
        assert_eq!(FloppyType::from_size(12345), None);
    }
}
