use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::mapper::Mirroring;
use super::serde_bytes;

pub const HEADER_LEN: usize = 16;
pub const TRAINER_LEN: usize = 512;
pub const PRG_BANK_SIZE: usize = 16 * 1024;
pub const CHR_BANK_SIZE: usize = 8 * 1024;

const MAGIC: &[u8; 4] = b"NES\x1A";

/// Reasons a cartridge image is rejected. Raised only while loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("image is {0} bytes, too small to contain an iNES header")]
    TooShort(usize),
    #[error("invalid iNES header magic, expected NES<EOF>")]
    BadMagic,
    #[error("image truncated: expected {expected} {section} bytes, found {actual}")]
    Truncated {
        section: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("header declares zero PRG ROM banks")]
    NoPrgBanks,
    #[error("unsupported mapper ({0:03})")]
    UnsupportedMapper(u8),
}

/// ROM and RAM banks of one cartridge.
///
/// The ROM arrays never change after load, so live and snapshot mappers
/// share them through `Arc`. Only CHR RAM is duplicated on copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartridgeImage {
    #[serde(skip)]
    prg_rom: Arc<[u8]>,
    #[serde(skip)]
    chr_rom: Arc<[u8]>,
    #[serde(with = "serde_bytes::vec")]
    chr_ram: Vec<u8>,
    prg_bank_count: u8,
    chr_bank_count: u8,
}

impl CartridgeImage {
    pub fn new(prg_rom: Vec<u8>, chr_rom: Vec<u8>) -> Result<Self, LoadError> {
        let prg_bank_count = prg_rom.len() / PRG_BANK_SIZE;
        if prg_bank_count == 0 {
            return Err(LoadError::NoPrgBanks);
        }
        let chr_bank_count = chr_rom.len() / CHR_BANK_SIZE;
        let chr_ram = if chr_bank_count == 0 {
            vec![0; CHR_BANK_SIZE]
        } else {
            Vec::new()
        };

        Ok(Self {
            prg_rom: prg_rom.into(),
            chr_rom: chr_rom.into(),
            chr_ram,
            prg_bank_count: prg_bank_count as u8,
            chr_bank_count: chr_bank_count as u8,
        })
    }

    pub fn prg_bank_count(&self) -> usize {
        (self.prg_bank_count as usize).max(1)
    }

    /// Zero when the cartridge carries CHR RAM.
    pub fn chr_bank_count(&self) -> usize {
        self.chr_bank_count as usize
    }

    pub fn chr_is_ram(&self) -> bool {
        self.chr_bank_count == 0
    }

    pub fn prg_len(&self) -> usize {
        self.prg_rom.len()
    }

    pub fn chr_len(&self) -> usize {
        if self.chr_is_ram() {
            self.chr_ram.len()
        } else {
            self.chr_rom.len()
        }
    }

    /// Reads PRG ROM; the offset wraps modulo the ROM size. An image
    /// deserialized without its ROM reads as zero.
    pub fn read_prg(&self, offset: usize) -> u8 {
        wrapped(&self.prg_rom, offset)
    }

    /// Reads CHR ROM or RAM; the offset wraps modulo the CHR size.
    pub fn read_chr(&self, offset: usize) -> u8 {
        if self.chr_is_ram() {
            wrapped(&self.chr_ram, offset)
        } else {
            wrapped(&self.chr_rom, offset)
        }
    }

    /// Writes land only when CHR is RAM.
    pub fn write_chr(&mut self, offset: usize, value: u8) {
        if self.chr_is_ram() && !self.chr_ram.is_empty() {
            let len = self.chr_ram.len();
            self.chr_ram[offset % len] = value;
        }
    }

    /// True when `other` can be copied into `self` without reallocating.
    pub(crate) fn same_layout(&self, other: &Self) -> bool {
        self.prg_bank_count == other.prg_bank_count
            && self.chr_bank_count == other.chr_bank_count
            && self.chr_ram.len() == other.chr_ram.len()
    }

    /// Copies the writable part of `source`. ROM stays shared.
    pub(crate) fn copy_from(&mut self, source: &Self) {
        self.chr_ram.copy_from_slice(&source.chr_ram);
    }
}

fn wrapped(bytes: &[u8], offset: usize) -> u8 {
    match bytes.len() {
        0 => 0,
        len => bytes[offset % len],
    }
}

#[derive(Debug, Clone)]
pub struct Cartridge {
    pub mapper_id: u8,
    pub mirroring: Mirroring,
    pub has_battery_backed_ram: bool,
    pub image: CartridgeImage,
}

impl Cartridge {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("failed to read ROM: {}", path.display()))?;
        Self::from_bytes(&bytes)
            .with_context(|| format!("failed to load ROM: {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < HEADER_LEN {
            return Err(LoadError::TooShort(bytes.len()));
        }
        if &bytes[0..4] != MAGIC {
            return Err(LoadError::BadMagic);
        }

        let flags6 = bytes[6];
        let flags7 = bytes[7];
        let mapper_id = (flags7 & 0xF0) | (flags6 >> 4);
        let mirroring = if (flags6 & 0x01) != 0 {
            Mirroring::Vertical
        } else {
            Mirroring::Horizontal
        };
        let has_battery_backed_ram = (flags6 & 0x02) != 0;
        let trainer_present = (flags6 & 0x04) != 0;

        let prg_size = bytes[4] as usize * PRG_BANK_SIZE;
        let chr_size = bytes[5] as usize * CHR_BANK_SIZE;
        if prg_size == 0 {
            return Err(LoadError::NoPrgBanks);
        }

        let mut cursor = HEADER_LEN;
        if trainer_present {
            cursor += TRAINER_LEN;
        }

        let prg_rom = take_section(bytes, &mut cursor, prg_size, "PRG")?;
        let chr_rom = take_section(bytes, &mut cursor, chr_size, "CHR")?;

        Ok(Self {
            mapper_id,
            mirroring,
            has_battery_backed_ram,
            image: CartridgeImage::new(prg_rom, chr_rom)?,
        })
    }
}

fn take_section(
    bytes: &[u8],
    cursor: &mut usize,
    len: usize,
    section: &'static str,
) -> Result<Vec<u8>, LoadError> {
    let available = bytes.len().saturating_sub(*cursor);
    if available < len {
        return Err(LoadError::Truncated {
            section,
            expected: len,
            actual: available,
        });
    }
    let data = bytes[*cursor..*cursor + len].to_vec();
    *cursor += len;
    Ok(data)
}
