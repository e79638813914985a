use serde::{Deserialize, Serialize};

use super::cartridge::{CHR_BANK_SIZE, Cartridge, CartridgeImage, LoadError, PRG_BANK_SIZE};
use super::serde_bytes;

const PRG_WINDOW_START: u16 = 0x8000;
const PRG_UPPER_HALF: u16 = 0xC000;
const CHR_HALF_SIZE: usize = 4 * 1024;
const MMC3_PRG_BANK_SIZE: usize = 8 * 1024;
const MMC3_CHR_BANK_SIZE: usize = 1024;
const MMC3_PRG_RAM_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mirroring {
    Horizontal,
    Vertical,
    OneScreenLower,
    OneScreenUpper,
}

impl Mirroring {
    /// Physical 1 KiB nametable page backing logical table `table` (0-3).
    pub fn page(self, table: usize) -> usize {
        match self {
            Mirroring::Horizontal => (table >> 1) & 1,
            Mirroring::Vertical => table & 1,
            Mirroring::OneScreenLower => 0,
            Mirroring::OneScreenUpper => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperKind {
    Nrom,
    Mmc1,
    Uxrom,
    Cnrom,
    Mmc3,
}

/// Cartridge board logic. One variant per supported chip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mapper {
    Nrom(Nrom),
    Mmc1(Mmc1),
    Uxrom(Uxrom),
    Cnrom(Cnrom),
    Mmc3(Mmc3),
}

impl Mapper {
    pub fn new(cart: Cartridge) -> Result<Self, LoadError> {
        let Cartridge {
            mapper_id,
            mirroring,
            image,
            ..
        } = cart;
        let mapper = match mapper_id {
            0 => Mapper::Nrom(Nrom { image, mirroring }),
            1 => Mapper::Mmc1(Mmc1::new(image, mirroring)),
            2 => Mapper::Uxrom(Uxrom {
                image,
                mirroring,
                prg_bank: 0,
            }),
            3 => Mapper::Cnrom(Cnrom {
                image,
                mirroring,
                chr_bank: 0,
            }),
            4 => Mapper::Mmc3(Mmc3::new(image, mirroring)),
            id => return Err(LoadError::UnsupportedMapper(id)),
        };
        Ok(mapper)
    }

    pub fn kind(&self) -> MapperKind {
        match self {
            Mapper::Nrom(_) => MapperKind::Nrom,
            Mapper::Mmc1(_) => MapperKind::Mmc1,
            Mapper::Uxrom(_) => MapperKind::Uxrom,
            Mapper::Cnrom(_) => MapperKind::Cnrom,
            Mapper::Mmc3(_) => MapperKind::Mmc3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind() {
            MapperKind::Nrom => "NROM",
            MapperKind::Mmc1 => "MMC1",
            MapperKind::Uxrom => "UxROM",
            MapperKind::Cnrom => "CNROM",
            MapperKind::Mmc3 => "MMC3",
        }
    }

    fn image(&self) -> &CartridgeImage {
        match self {
            Mapper::Nrom(m) => &m.image,
            Mapper::Mmc1(m) => &m.image,
            Mapper::Uxrom(m) => &m.image,
            Mapper::Cnrom(m) => &m.image,
            Mapper::Mmc3(m) => &m.image,
        }
    }

    /// CPU access to $4020-$FFFF. `open_bus` is returned for unmapped space.
    pub fn cpu_read(&self, addr: u16, open_bus: u8) -> u8 {
        match self {
            Mapper::Nrom(m) => m.cpu_read(addr, open_bus),
            Mapper::Mmc1(m) => m.cpu_read(addr, open_bus),
            Mapper::Uxrom(m) => m.cpu_read(addr, open_bus),
            Mapper::Cnrom(m) => m.cpu_read(addr, open_bus),
            Mapper::Mmc3(m) => m.cpu_read(addr, open_bus),
        }
    }

    pub fn cpu_write(&mut self, addr: u16, value: u8) {
        match self {
            Mapper::Nrom(_) => {}
            Mapper::Mmc1(m) => m.cpu_write(addr, value),
            Mapper::Uxrom(m) => m.cpu_write(addr, value),
            Mapper::Cnrom(m) => m.cpu_write(addr, value),
            Mapper::Mmc3(m) => m.cpu_write(addr, value),
        }
    }

    /// Pattern table access, $0000-$1FFF.
    pub fn ppu_read(&self, addr: u16) -> u8 {
        let addr = addr & 0x1FFF;
        match self {
            Mapper::Nrom(m) => m.image.read_chr(addr as usize),
            Mapper::Mmc1(m) => m.image.read_chr(m.chr_offset(addr)),
            Mapper::Uxrom(m) => m.image.read_chr(addr as usize),
            Mapper::Cnrom(m) => m.image.read_chr(m.chr_offset(addr)),
            Mapper::Mmc3(m) => m.image.read_chr(m.chr_offset(addr)),
        }
    }

    pub fn ppu_write(&mut self, addr: u16, value: u8) {
        let addr = addr & 0x1FFF;
        match self {
            Mapper::Nrom(m) => m.image.write_chr(addr as usize, value),
            Mapper::Mmc1(m) => {
                let offset = m.chr_offset(addr);
                m.image.write_chr(offset, value);
            }
            Mapper::Uxrom(m) => m.image.write_chr(addr as usize, value),
            Mapper::Cnrom(m) => {
                let offset = m.chr_offset(addr);
                m.image.write_chr(offset, value);
            }
            Mapper::Mmc3(m) => {
                let offset = m.chr_offset(addr);
                m.image.write_chr(offset, value);
            }
        }
    }

    pub fn mirroring(&self) -> Mirroring {
        match self {
            Mapper::Nrom(m) => m.mirroring,
            Mapper::Mmc1(m) => m.mirroring,
            Mapper::Uxrom(m) => m.mirroring,
            Mapper::Cnrom(m) => m.mirroring,
            Mapper::Mmc3(m) => m.mirroring,
        }
    }

    /// Called by the PPU once per rendered scanline.
    pub fn clock_scanline(&mut self) {
        if let Mapper::Mmc3(m) = self {
            m.clock_irq_counter();
        }
    }

    /// Level of the cartridge IRQ line.
    pub fn irq_pending(&self) -> bool {
        match self {
            Mapper::Mmc3(m) => m.irq_pending,
            _ => false,
        }
    }

    pub fn debug_state(&self) -> String {
        match self {
            Mapper::Nrom(m) => format!("NROM mirroring={:?}", m.mirroring),
            Mapper::Mmc1(m) => format!(
                "MMC1 shift=${:02X} prg_mode={} chr_mode={} chr=[{:02X},{:02X}] prg=${:02X} mirroring={:?}",
                m.shift,
                m.prg_rom_bank_mode,
                m.chr_rom_bank_mode,
                m.chr_bank0,
                m.chr_bank1,
                m.prg_bank,
                m.mirroring
            ),
            Mapper::Uxrom(m) => format!("UxROM prg=${:02X}", m.prg_bank),
            Mapper::Cnrom(m) => format!("CNROM chr=${:02X}", m.chr_bank),
            Mapper::Mmc3(m) => format!(
                "MMC3 bank_select=${:02X} regs={:02X?} irq_latch=${:02X} irq_counter=${:02X} reload={} en={} pending={}",
                m.bank_select,
                m.bank_regs,
                m.irq_latch,
                m.irq_counter,
                m.irq_reload,
                m.irq_enabled,
                m.irq_pending
            ),
        }
    }

    /// True when `source` holds state for the same board and bank layout.
    pub fn compatible_with(&self, source: &Mapper) -> bool {
        let prg_ram_matches = match (self, source) {
            (Mapper::Mmc3(live), Mapper::Mmc3(other)) => live.prg_ram.len() == other.prg_ram.len(),
            _ => true,
        };
        self.kind() == source.kind() && self.image().same_layout(source.image()) && prg_ram_matches
    }

    pub fn chr_ram_len(&self) -> usize {
        if self.image().chr_is_ram() {
            self.image().chr_len()
        } else {
            0
        }
    }

    /// Duplicates the mutable state of `source` into `destination` in place.
    ///
    /// Registers and CHR RAM are copied; ROM arrays stay shared. Falls back
    /// to a full clone when the two are not [`compatible_with`](Self::compatible_with)
    /// each other.
    pub fn copy(source: &Mapper, destination: &mut Mapper) {
        match (source, destination) {
            (Mapper::Nrom(src), Mapper::Nrom(dst)) if src.image.same_layout(&dst.image) => {
                dst.image.copy_from(&src.image);
                dst.mirroring = src.mirroring;
            }
            (Mapper::Mmc1(src), Mapper::Mmc1(dst)) if src.image.same_layout(&dst.image) => {
                dst.image.copy_from(&src.image);
                dst.mirroring = src.mirroring;
                dst.shift = src.shift;
                dst.prg_rom_bank_mode = src.prg_rom_bank_mode;
                dst.chr_rom_bank_mode = src.chr_rom_bank_mode;
                dst.chr_bank0 = src.chr_bank0;
                dst.chr_bank1 = src.chr_bank1;
                dst.prg_bank = src.prg_bank;
            }
            (Mapper::Uxrom(src), Mapper::Uxrom(dst)) if src.image.same_layout(&dst.image) => {
                dst.image.copy_from(&src.image);
                dst.mirroring = src.mirroring;
                dst.prg_bank = src.prg_bank;
            }
            (Mapper::Cnrom(src), Mapper::Cnrom(dst)) if src.image.same_layout(&dst.image) => {
                dst.image.copy_from(&src.image);
                dst.mirroring = src.mirroring;
                dst.chr_bank = src.chr_bank;
            }
            (Mapper::Mmc3(src), Mapper::Mmc3(dst))
                if src.image.same_layout(&dst.image)
                    && src.prg_ram.len() == dst.prg_ram.len() =>
            {
                dst.image.copy_from(&src.image);
                dst.prg_ram.copy_from_slice(&src.prg_ram);
                dst.mirroring = src.mirroring;
                dst.bank_select = src.bank_select;
                dst.bank_regs = src.bank_regs;
                dst.prg_ram_enabled = src.prg_ram_enabled;
                dst.prg_ram_write_protect = src.prg_ram_write_protect;
                dst.irq_latch = src.irq_latch;
                dst.irq_counter = src.irq_counter;
                dst.irq_reload = src.irq_reload;
                dst.irq_enabled = src.irq_enabled;
                dst.irq_pending = src.irq_pending;
            }
            (source, destination) => *destination = source.clone(),
        }
    }
}

/// Mapper 0: fixed 16 or 32 KiB PRG, fixed 8 KiB CHR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nrom {
    image: CartridgeImage,
    mirroring: Mirroring,
}

impl Nrom {
    fn cpu_read(&self, addr: u16, open_bus: u8) -> u8 {
        if addr < PRG_WINDOW_START {
            return open_bus;
        }
        // A single 16 KiB bank shows up twice in the 32 KiB window.
        let window = self.image.prg_bank_count() * PRG_BANK_SIZE;
        self.image
            .read_prg((addr - PRG_WINDOW_START) as usize % window)
    }
}

/// Mapper 1: serial-loaded bank registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mmc1 {
    image: CartridgeImage,
    mirroring: Mirroring,
    /// Bit 4 starts as a marker; it reaches bit 0 on the fifth write.
    shift: u8,
    prg_rom_bank_mode: u8,
    chr_rom_bank_mode: u8,
    chr_bank0: u8,
    chr_bank1: u8,
    prg_bank: u8,
}

const MMC1_SHIFT_RESET: u8 = 0x10;
const MMC1_MIRRORING: [Mirroring; 4] = [
    Mirroring::OneScreenLower,
    Mirroring::OneScreenUpper,
    Mirroring::Vertical,
    Mirroring::Horizontal,
];

impl Mmc1 {
    fn new(image: CartridgeImage, mirroring: Mirroring) -> Self {
        Self {
            image,
            mirroring,
            shift: MMC1_SHIFT_RESET,
            prg_rom_bank_mode: 3,
            chr_rom_bank_mode: 0,
            chr_bank0: 0,
            chr_bank1: 0,
            prg_bank: 0,
        }
    }

    pub fn shift(&self) -> u8 {
        self.shift
    }

    pub fn prg_rom_bank_mode(&self) -> u8 {
        self.prg_rom_bank_mode
    }

    pub fn prg_bank(&self) -> u8 {
        self.prg_bank
    }

    fn cpu_read(&self, addr: u16, open_bus: u8) -> u8 {
        if addr < PRG_WINDOW_START {
            return open_bus;
        }
        let banks = self.image.prg_bank_count();
        let bank = self.prg_bank as usize;
        let offset = match self.prg_rom_bank_mode {
            // 32 KiB mode: the register counts 16 KiB units with bit 0 ignored.
            0 | 1 => (bank & 0x0E) % banks * PRG_BANK_SIZE + (addr - PRG_WINDOW_START) as usize,
            2 => {
                if addr < PRG_UPPER_HALF {
                    (addr - PRG_WINDOW_START) as usize
                } else {
                    bank % banks * PRG_BANK_SIZE + (addr - PRG_UPPER_HALF) as usize
                }
            }
            _ => {
                if addr < PRG_UPPER_HALF {
                    bank % banks * PRG_BANK_SIZE + (addr - PRG_WINDOW_START) as usize
                } else {
                    (banks - 1) * PRG_BANK_SIZE + (addr - PRG_UPPER_HALF) as usize
                }
            }
        };
        self.image.read_prg(offset)
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        if addr < PRG_WINDOW_START {
            return;
        }
        if (value & 0x80) != 0 {
            self.shift = MMC1_SHIFT_RESET;
            self.prg_rom_bank_mode = 3;
            return;
        }

        let commit = (self.shift & 0x01) != 0;
        self.shift = (self.shift >> 1) | ((value & 0x01) << 4);
        if !commit {
            return;
        }

        let data = self.shift & 0x1F;
        match addr {
            0x8000..=0x9FFF => {
                self.mirroring = MMC1_MIRRORING[(data & 0x03) as usize];
                self.prg_rom_bank_mode = (data >> 2) & 0x03;
                self.chr_rom_bank_mode = (data >> 4) & 0x01;
            }
            0xA000..=0xBFFF => self.chr_bank0 = data,
            0xC000..=0xDFFF => self.chr_bank1 = data,
            _ => self.prg_bank = data & 0x0F,
        }
        self.shift = MMC1_SHIFT_RESET;
    }

    fn chr_offset(&self, addr: u16) -> usize {
        let addr = addr as usize;
        // CHR RAM boards ignore the CHR bank registers.
        if self.image.chr_is_ram() {
            return addr;
        }
        let halves = 2 * self.image.chr_bank_count();
        if self.chr_rom_bank_mode == 0 {
            (self.chr_bank0 as usize & 0x1E) % halves * CHR_HALF_SIZE + addr
        } else if addr < CHR_HALF_SIZE {
            self.chr_bank0 as usize % halves * CHR_HALF_SIZE + addr
        } else {
            self.chr_bank1 as usize % halves * CHR_HALF_SIZE + (addr - CHR_HALF_SIZE)
        }
    }
}

/// Mapper 2: switchable 16 KiB bank at $8000, last bank fixed at $C000.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uxrom {
    image: CartridgeImage,
    mirroring: Mirroring,
    prg_bank: u8,
}

impl Uxrom {
    fn cpu_read(&self, addr: u16, open_bus: u8) -> u8 {
        let banks = self.image.prg_bank_count();
        match addr {
            0x8000..=0xBFFF => self.image.read_prg(
                self.prg_bank as usize % banks * PRG_BANK_SIZE + (addr - PRG_WINDOW_START) as usize,
            ),
            0xC000..=0xFFFF => self
                .image
                .read_prg((banks - 1) * PRG_BANK_SIZE + (addr - PRG_UPPER_HALF) as usize),
            _ => open_bus,
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        if addr >= PRG_WINDOW_START {
            self.prg_bank = value;
        }
    }
}

/// Mapper 3: fixed PRG, switchable 8 KiB CHR bank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cnrom {
    image: CartridgeImage,
    mirroring: Mirroring,
    chr_bank: u8,
}

impl Cnrom {
    fn cpu_read(&self, addr: u16, open_bus: u8) -> u8 {
        if addr < PRG_WINDOW_START {
            return open_bus;
        }
        let window = self.image.prg_bank_count() * PRG_BANK_SIZE;
        self.image
            .read_prg((addr - PRG_WINDOW_START) as usize % window)
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        if addr >= PRG_WINDOW_START {
            self.chr_bank = value;
        }
    }

    fn chr_offset(&self, addr: u16) -> usize {
        let banks = self.image.chr_bank_count().max(1);
        self.chr_bank as usize % banks * CHR_BANK_SIZE + addr as usize
    }
}

/// Mapper 4: 8 KiB PRG / 1 KiB CHR banking with a scanline IRQ counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mmc3 {
    image: CartridgeImage,
    mirroring: Mirroring,
    #[serde(with = "serde_bytes::vec")]
    prg_ram: Vec<u8>,
    bank_select: u8,
    bank_regs: [u8; 8],
    prg_ram_enabled: bool,
    prg_ram_write_protect: bool,

    irq_latch: u8,
    irq_counter: u8,
    irq_reload: bool,
    irq_enabled: bool,
    irq_pending: bool,
}

impl Mmc3 {
    fn new(image: CartridgeImage, mirroring: Mirroring) -> Self {
        Self {
            image,
            mirroring,
            prg_ram: vec![0; MMC3_PRG_RAM_SIZE],
            bank_select: 0,
            bank_regs: [0, 2, 4, 5, 6, 7, 0, 1],
            prg_ram_enabled: true,
            prg_ram_write_protect: false,
            irq_latch: 0,
            irq_counter: 0,
            irq_reload: false,
            irq_enabled: false,
            irq_pending: false,
        }
    }

    fn prg_bank_count(&self) -> usize {
        self.image.prg_bank_count() * (PRG_BANK_SIZE / MMC3_PRG_BANK_SIZE)
    }

    fn cpu_read(&self, addr: u16, open_bus: u8) -> u8 {
        match addr {
            0x6000..=0x7FFF => {
                if self.prg_ram_enabled {
                    self.prg_ram
                        .get((addr - 0x6000) as usize)
                        .copied()
                        .unwrap_or(open_bus)
                } else {
                    open_bus
                }
            }
            0x8000..=0xFFFF => {
                let banks = self.prg_bank_count();
                let second_last = banks - 2;
                let swapped = (self.bank_select & 0x40) != 0;
                let bank = match addr {
                    0x8000..=0x9FFF if swapped => second_last,
                    0x8000..=0x9FFF => self.bank_regs[6] as usize,
                    0xA000..=0xBFFF => self.bank_regs[7] as usize,
                    0xC000..=0xDFFF if swapped => self.bank_regs[6] as usize,
                    0xC000..=0xDFFF => second_last,
                    _ => banks - 1,
                };
                let offset = (addr as usize) & (MMC3_PRG_BANK_SIZE - 1);
                self.image
                    .read_prg(bank % banks * MMC3_PRG_BANK_SIZE + offset)
            }
            _ => open_bus,
        }
    }

    fn cpu_write(&mut self, addr: u16, value: u8) {
        let even = (addr & 0x01) == 0;
        match addr {
            0x6000..=0x7FFF => {
                if self.prg_ram_enabled && !self.prg_ram_write_protect {
                    if let Some(byte) = self.prg_ram.get_mut((addr - 0x6000) as usize) {
                        *byte = value;
                    }
                }
            }
            0x8000..=0x9FFF if even => self.bank_select = value,
            0x8000..=0x9FFF => {
                let target = (self.bank_select & 0x07) as usize;
                self.bank_regs[target] = value;
            }
            0xA000..=0xBFFF if even => {
                self.mirroring = if (value & 0x01) == 0 {
                    Mirroring::Vertical
                } else {
                    Mirroring::Horizontal
                };
            }
            0xA000..=0xBFFF => {
                self.prg_ram_enabled = (value & 0x80) != 0;
                self.prg_ram_write_protect = (value & 0x40) != 0;
            }
            0xC000..=0xDFFF if even => self.irq_latch = value,
            0xC000..=0xDFFF => {
                self.irq_counter = 0;
                self.irq_reload = true;
            }
            0xE000..=0xFFFF if even => {
                self.irq_enabled = false;
                self.irq_pending = false;
            }
            0xE000..=0xFFFF => self.irq_enabled = true,
            _ => {}
        }
    }

    fn chr_offset(&self, addr: u16) -> usize {
        // Slots are 1 KiB; R0/R1 cover two slots each with bit 0 forced.
        let mut slot = addr as usize / MMC3_CHR_BANK_SIZE;
        if (self.bank_select & 0x80) != 0 {
            slot ^= 4;
        }
        let bank = match slot {
            0 => self.bank_regs[0] & 0xFE,
            1 => self.bank_regs[0] | 0x01,
            2 => self.bank_regs[1] & 0xFE,
            3 => self.bank_regs[1] | 0x01,
            n => self.bank_regs[n - 2],
        };
        let banks = (self.image.chr_len() / MMC3_CHR_BANK_SIZE).max(1);
        bank as usize % banks * MMC3_CHR_BANK_SIZE + (addr as usize & (MMC3_CHR_BANK_SIZE - 1))
    }

    fn clock_irq_counter(&mut self) {
        if self.irq_counter == 0 || self.irq_reload {
            self.irq_counter = self.irq_latch;
            self.irq_reload = false;
        } else {
            self.irq_counter -= 1;
        }

        if self.irq_counter == 0 && self.irq_enabled {
            self.irq_pending = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::cartridge::tests::build_image;

    fn load(mapper_id: u8, prg_banks: u8, chr_banks: u8) -> Mapper {
        let cart = Cartridge::from_bytes(&build_image(mapper_id, prg_banks, chr_banks, 0)).unwrap();
        Mapper::new(cart).unwrap()
    }

    /// Image whose 8 KiB PRG pages and 1 KiB CHR pages hold their own index.
    fn mmc3(prg_banks: u8, chr_banks: u8) -> Mapper {
        let mut bytes = build_image(4, prg_banks, chr_banks, 0);
        let prg_end = 16 + prg_banks as usize * PRG_BANK_SIZE;
        for (page, chunk) in bytes[16..prg_end].chunks_mut(MMC3_PRG_BANK_SIZE).enumerate() {
            chunk.fill(page as u8);
        }
        for (page, chunk) in bytes[prg_end..].chunks_mut(MMC3_CHR_BANK_SIZE).enumerate() {
            chunk.fill(page as u8);
        }
        Mapper::new(Cartridge::from_bytes(&bytes).unwrap()).unwrap()
    }

    fn mmc1_serial_write(mapper: &mut Mapper, addr: u16, value: u8) {
        for bit in 0..5 {
            mapper.cpu_write(addr, (value >> bit) & 0x01);
        }
    }

    fn as_mmc1(mapper: &Mapper) -> &Mmc1 {
        match mapper {
            Mapper::Mmc1(m) => m,
            other => panic!("expected MMC1, got {}", other.name()),
        }
    }

    #[test]
    fn unsupported_mapper_is_rejected() {
        let cart = Cartridge::from_bytes(&build_image(7, 1, 1, 0)).unwrap();
        assert_eq!(Mapper::new(cart).unwrap_err(), LoadError::UnsupportedMapper(7));
    }

    #[test]
    fn nrom_mirrors_single_prg_bank() {
        let mut bytes = build_image(0, 1, 1, 0);
        bytes[16 + 0x0123] = 0x77;
        let mapper = Mapper::new(Cartridge::from_bytes(&bytes).unwrap()).unwrap();

        assert_eq!(mapper.cpu_read(0x8123, 0), 0x77);
        assert_eq!(mapper.cpu_read(0xC123, 0), 0x77);
        for addr in [0x8000u16, 0x9FFF, 0xBFFF] {
            assert_eq!(mapper.cpu_read(addr, 0), mapper.cpu_read(addr + 0x4000, 0));
        }
    }

    #[test]
    fn nrom_reads_open_bus_below_prg_and_ignores_writes() {
        let mut mapper = load(0, 2, 1);
        assert_eq!(mapper.cpu_read(0x6000, 0xAB), 0xAB);
        mapper.cpu_write(0x8000, 0xFF);
        assert_eq!(mapper.cpu_read(0x8000, 0), 1);
        assert_eq!(mapper.cpu_read(0xC000, 0), 2);
        mapper.ppu_write(0x0000, 0x55);
        assert_eq!(mapper.ppu_read(0x0000), 1);
    }

    #[test]
    fn mmc1_five_writes_load_prg_bank() {
        let mut mapper = load(1, 8, 1);
        let bits = [1u8, 0, 1, 1, 1];
        for bit in bits {
            mapper.cpu_write(0xE000, bit);
        }
        // b4..b0 = 1 1 1 0 1 = 0x1D, masked to four bits.
        assert_eq!(as_mmc1(&mapper).prg_bank(), 0x0D);
        assert_eq!(as_mmc1(&mapper).shift(), 0x10);
    }

    #[test]
    fn mmc1_reset_write_clears_shift_and_forces_mode_3() {
        let mut mapper = load(1, 4, 1);
        mmc1_serial_write(&mut mapper, 0x8000, 0b0_0000);
        assert_eq!(as_mmc1(&mapper).prg_rom_bank_mode(), 0);

        mapper.cpu_write(0x8000, 1);
        mapper.cpu_write(0x8000, 0);
        mapper.cpu_write(0xA000, 0x80);
        assert_eq!(as_mmc1(&mapper).shift(), 0x10);
        assert_eq!(as_mmc1(&mapper).prg_rom_bank_mode(), 3);
    }

    #[test]
    fn mmc1_ignores_writes_below_prg_window() {
        let mut mapper = load(1, 4, 1);
        for _ in 0..5 {
            mapper.cpu_write(0x6000, 1);
        }
        assert_eq!(as_mmc1(&mapper).shift(), 0x10);
        assert_eq!(mapper.cpu_read(0x6000, 0x3C), 0x3C);
    }

    #[test]
    fn mmc1_prg_modes() {
        let mut mapper = load(1, 4, 1);
        mmc1_serial_write(&mut mapper, 0xE000, 2);

        // Mode 3: switch $8000, fix last bank at $C000.
        assert_eq!(mapper.cpu_read(0x8000, 0), 3);
        assert_eq!(mapper.cpu_read(0xC000, 0), 4);

        // Mode 2: fix first bank at $8000, switch $C000.
        mmc1_serial_write(&mut mapper, 0x8000, 0b0_1000);
        assert_eq!(mapper.cpu_read(0x8000, 0), 1);
        assert_eq!(mapper.cpu_read(0xC000, 0), 3);

        // Mode 0: 32 KiB, bit 0 of the bank register ignored.
        mmc1_serial_write(&mut mapper, 0x8000, 0b0_0000);
        mmc1_serial_write(&mut mapper, 0xE000, 3);
        assert_eq!(mapper.cpu_read(0x8000, 0), 3);
        assert_eq!(mapper.cpu_read(0xC000, 0), 4);
    }

    #[test]
    fn mmc1_control_sets_mirroring_from_table() {
        let mut mapper = load(1, 2, 1);
        let expected = [
            Mirroring::OneScreenLower,
            Mirroring::OneScreenUpper,
            Mirroring::Vertical,
            Mirroring::Horizontal,
        ];
        for (value, mirroring) in expected.into_iter().enumerate() {
            mmc1_serial_write(&mut mapper, 0x8000, 0x0C | value as u8);
            assert_eq!(mapper.mirroring(), mirroring);
        }
    }

    #[test]
    fn mmc1_chr_modes() {
        let mut mapper = load(1, 2, 2);
        // 8 KiB mode selects by chr_bank0 with bit 0 ignored.
        mmc1_serial_write(&mut mapper, 0xA000, 3);
        assert_eq!(mapper.ppu_read(0x0000), 2);
        assert_eq!(mapper.ppu_read(0x1000), 2);

        // 4 KiB mode: independent halves.
        mmc1_serial_write(&mut mapper, 0x8000, 0x1C);
        mmc1_serial_write(&mut mapper, 0xA000, 0);
        mmc1_serial_write(&mut mapper, 0xC000, 3);
        assert_eq!(mapper.ppu_read(0x0000), 1);
        assert_eq!(mapper.ppu_read(0x1000), 2);
    }

    #[test]
    fn mmc1_chr_ram_is_writable() {
        let mut mapper = load(1, 2, 0);
        mapper.ppu_write(0x1FFF, 0x42);
        assert_eq!(mapper.ppu_read(0x1FFF), 0x42);
    }

    #[test]
    fn uxrom_keeps_last_bank_fixed() {
        let mut mapper = load(2, 3, 0);
        mapper.cpu_write(0x8000, 1);
        assert_eq!(mapper.cpu_read(0x8000, 0), 2);
        assert_eq!(mapper.cpu_read(0xC000, 0), 3);
        mapper.cpu_write(0xFFFF, 4);
        assert_eq!(mapper.cpu_read(0x8000, 0), 2);
    }

    #[test]
    fn cnrom_switches_chr_bank() {
        let mut mapper = load(3, 2, 4);
        mapper.cpu_write(0x8000, 2);
        assert_eq!(mapper.ppu_read(0x0000), 3);
        assert_eq!(mapper.cpu_read(0xC000, 0), 2);
    }

    #[test]
    fn mmc3_prg_modes() {
        let mut mapper = mmc3(4, 1);
        mapper.cpu_write(0x8000, 6);
        mapper.cpu_write(0x8001, 2);
        mapper.cpu_write(0x8000, 7);
        mapper.cpu_write(0x8001, 3);
        assert_eq!(mapper.cpu_read(0x8000, 0), 2);
        assert_eq!(mapper.cpu_read(0xA000, 0), 3);
        assert_eq!(mapper.cpu_read(0xC000, 0), 6);
        assert_eq!(mapper.cpu_read(0xE000, 0), 7);

        mapper.cpu_write(0x8000, 0x46);
        assert_eq!(mapper.cpu_read(0x8000, 0), 6);
        assert_eq!(mapper.cpu_read(0xC000, 0), 2);
    }

    #[test]
    fn mmc3_chr_inversion() {
        let mut mapper = mmc3(2, 1);
        mapper.cpu_write(0x8000, 0);
        mapper.cpu_write(0x8001, 4);
        mapper.cpu_write(0x8000, 2);
        mapper.cpu_write(0x8001, 7);
        assert_eq!(mapper.ppu_read(0x0000), 4);
        assert_eq!(mapper.ppu_read(0x0400), 5);
        assert_eq!(mapper.ppu_read(0x1000), 7);

        mapper.cpu_write(0x8000, 0x80);
        assert_eq!(mapper.ppu_read(0x1000), 4);
        assert_eq!(mapper.ppu_read(0x0000), 7);
    }

    #[test]
    fn mmc3_scanline_irq() {
        let mut mapper = mmc3(2, 1);
        mapper.cpu_write(0xC000, 2);
        mapper.cpu_write(0xC001, 0);
        mapper.cpu_write(0xE001, 0);

        mapper.clock_scanline();
        mapper.clock_scanline();
        assert!(!mapper.irq_pending());
        mapper.clock_scanline();
        assert!(mapper.irq_pending());

        mapper.clock_scanline();
        assert!(mapper.irq_pending(), "line stays asserted until acknowledged");
        mapper.cpu_write(0xE000, 0);
        assert!(!mapper.irq_pending());
    }

    #[test]
    fn mmc3_prg_ram_write_protect() {
        let mut mapper = mmc3(2, 1);
        mapper.cpu_write(0x6000, 0xAA);
        assert_eq!(mapper.cpu_read(0x6000, 0), 0xAA);
        mapper.cpu_write(0xA001, 0xC0);
        mapper.cpu_write(0x6000, 0x55);
        assert_eq!(mapper.cpu_read(0x6000, 0), 0xAA);
        mapper.cpu_write(0xA001, 0x00);
        assert_eq!(mapper.cpu_read(0x6000, 0x11), 0x11);
    }

    #[test]
    fn copy_duplicates_registers_and_chr_ram_without_aliasing() {
        let mut live = load(1, 4, 0);
        mmc1_serial_write(&mut live, 0xE000, 2);
        live.ppu_write(0x0010, 0x99);

        let mut saved = load(1, 4, 0);
        Mapper::copy(&live, &mut saved);
        assert_eq!(saved, live);

        live.ppu_write(0x0010, 0x11);
        mmc1_serial_write(&mut live, 0xE000, 1);
        assert_eq!(saved.ppu_read(0x0010), 0x99);
        assert_eq!(saved.cpu_read(0x8000, 0), 3);

        Mapper::copy(&saved, &mut live);
        assert_eq!(live.ppu_read(0x0010), 0x99);
        assert_eq!(live.cpu_read(0x8000, 0), 3);
    }

    #[test]
    fn copy_across_variants_replaces_destination() {
        let source = load(2, 2, 0);
        let mut destination = load(0, 1, 1);
        assert!(!destination.compatible_with(&source));
        Mapper::copy(&source, &mut destination);
        assert_eq!(destination.kind(), MapperKind::Uxrom);
    }
}
