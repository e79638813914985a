pub mod apu;
pub mod cartridge;
pub mod cpu;
pub mod frame;
pub mod mapper;
pub mod palette;
pub mod ppu;
mod serde_bytes;

use std::{collections::VecDeque, ops::ControlFlow, path::Path};

use anyhow::Context;
use log::{info, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use apu::Apu;
use cartridge::{Cartridge, LoadError};
use cpu::Cpu;
use frame::FrameBuffer;
use mapper::Mapper;
use ppu::Ppu;

pub const BUTTON_A: u8 = 0x80;
pub const BUTTON_B: u8 = 0x40;
pub const BUTTON_SELECT: u8 = 0x20;
pub const BUTTON_START: u8 = 0x10;
pub const BUTTON_UP: u8 = 0x08;
pub const BUTTON_DOWN: u8 = 0x04;
pub const BUTTON_LEFT: u8 = 0x02;
pub const BUTTON_RIGHT: u8 = 0x01;

const OAM_DMA_CYCLES: u16 = 513;
const DMC_DMA_STALL_CYCLES: u16 = 4;
const MAX_DEBUG_EVENTS: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NesDebugCounters {
    pub frames: u64,
    pub cpu_cycles: u64,
    pub nmi_serviced: u64,
    pub irq_serviced: u64,
    pub unknown_opcodes: u64,
    pub oam_dma_transfers: u64,
    pub dmc_dma_fetches: u64,
    pub dmc_dma_stall_cycles: u64,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot holds {snapshot} state but the loaded cartridge uses {live}")]
    MapperMismatch {
        live: &'static str,
        snapshot: &'static str,
    },
    #[error("snapshot bank layout does not match the loaded cartridge (CHR RAM {live} vs {snapshot} bytes)")]
    LayoutMismatch { live: usize, snapshot: usize },
    #[error("snapshot field {0} is out of range")]
    OutOfRange(&'static str),
    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),
}

/// Full machine state at a frame boundary.
///
/// ROM contents are not part of a snapshot; it can only be restored into a
/// system running the same cartridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    cpu: Cpu,
    ppu: Ppu,
    apu: Apu,
    mapper: Mapper,
    #[serde(with = "serde_bytes::array")]
    ram: [u8; 2048],
    controller_state: u8,
    controller_shift: u8,
    strobe: bool,
    open_bus: u8,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses and range-checks a snapshot. The mapper it carries has no
    /// ROM; its PRG and CHR ROM reads return zero until restored.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.check_ranges()?;
        Ok(snapshot)
    }

    fn check_ranges(&self) -> Result<(), SnapshotError> {
        match self.ppu.out_of_range_field().or_else(|| self.apu.out_of_range_field()) {
            Some(field) => Err(SnapshotError::OutOfRange(field)),
            None => Ok(()),
        }
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }
}

/// Lets an embedding drive [`Nes::run`].
pub trait Host {
    fn audio_sample(&mut self, sample: f32);

    /// Called once per frame at the pre-render boundary, the only point where
    /// snapshots, restores and input changes are applied.
    fn frame_boundary(&mut self, nes: &mut Nes, frame: &FrameBuffer<'_>) -> ControlFlow<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nes {
    pub(crate) cpu: Cpu,
    pub(crate) ppu: Ppu,
    pub(crate) apu: Apu,
    pub(crate) mapper: Mapper,
    #[serde(with = "serde_bytes::array")]
    pub(crate) ram: [u8; 2048],

    controller_state: u8,
    controller_shift: u8,
    strobe: bool,
    open_bus: u8,
    frame_ready: bool,

    pub(crate) counters: NesDebugCounters,
    events: VecDeque<String>,
}

impl Nes {
    pub fn new(cart: Cartridge) -> Result<Self, LoadError> {
        let mapper_id = cart.mapper_id;
        let mapper = Mapper::new(cart)?;
        let mut nes = Self {
            cpu: Cpu::default(),
            ppu: Ppu::new(),
            apu: Apu::new(),
            mapper,
            ram: [0; 2048],
            controller_state: 0,
            controller_shift: 0,
            strobe: false,
            open_bus: 0,
            frame_ready: false,
            counters: NesDebugCounters::default(),
            events: VecDeque::with_capacity(MAX_DEBUG_EVENTS),
        };
        info!("cartridge loaded: {} (mapper {mapper_id})", nes.mapper.name());
        nes.reset();
        nes.push_debug_event(format!(
            "ROM loaded: {} (mapper {mapper_id})",
            nes.mapper.name()
        ));
        Ok(nes)
    }

    pub fn from_rom_bytes(bytes: &[u8]) -> Result<Self, LoadError> {
        Self::new(Cartridge::from_bytes(bytes)?)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let cart = Cartridge::from_file(path)?;
        Self::new(cart).with_context(|| format!("failed to start {}", path.display()))
    }

    /// Console reset: CPU reloads the reset vector, PPU and APU restart.
    /// Mapper banking survives.
    pub fn reset(&mut self) {
        self.counters = NesDebugCounters::default();
        self.events.clear();
        self.open_bus = 0;
        self.frame_ready = false;
        self.ppu.reset();
        self.apu.reset();
        self.reset_cpu();
        info!("reset, PC=${:04X}", self.cpu.pc);
        self.push_debug_event(format!("CPU reset, PC=${:04X}", self.cpu.pc));
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn ppu(&self) -> &Ppu {
        &self.ppu
    }

    pub fn apu(&self) -> &Apu {
        &self.apu
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn peek_ram(&self, addr: u16) -> u8 {
        self.ram[(addr as usize) & 0x07FF]
    }

    pub fn controller_state(&self) -> u8 {
        self.controller_state
    }

    pub fn counters(&self) -> NesDebugCounters {
        self.counters
    }

    /// Latest button sample. Reaches the shift register only while strobe is high.
    pub fn set_controller_state(&mut self, state: u8) {
        self.controller_state = state;
        if self.strobe {
            self.controller_shift = state;
        }
    }

    pub(crate) fn irq_line(&self) -> bool {
        self.apu.irq_pending() || self.mapper.irq_pending()
    }

    /// One CPU cycle, three PPU dots and one APU cycle. Returns the APU sample.
    pub fn step_frame_unit(&mut self, frame: &mut FrameBuffer<'_>) -> f32 {
        if self.strobe {
            self.controller_shift = self.controller_state;
        }

        self.step_cpu();
        self.counters.cpu_cycles = self.counters.cpu_cycles.wrapping_add(1);

        for _ in 0..3 {
            self.ppu.step(&mut self.mapper, frame);
            if self.ppu.take_nmi() {
                self.cpu.nmi_pending = true;
            }
        }

        let sample = self.apu.step();
        if let Some(addr) = self.apu.take_dmc_dma_request() {
            self.dmc_dma(addr);
        }

        if self.ppu.take_frame_boundary() {
            self.counters.frames = self.counters.frames.wrapping_add(1);
            self.frame_ready = true;
        }
        sample
    }

    /// True once after each frame boundary crossed by [`step_frame_unit`](Self::step_frame_unit).
    pub fn take_frame_boundary(&mut self) -> bool {
        std::mem::take(&mut self.frame_ready)
    }

    /// Steps until the next frame boundary, appending every APU sample.
    pub fn run_frame(&mut self, frame: &mut FrameBuffer<'_>, samples: &mut Vec<f32>) {
        loop {
            samples.push(self.step_frame_unit(frame));
            if self.take_frame_boundary() {
                return;
            }
        }
    }

    /// Steps until the CPU sits between instructions again.
    pub fn step_instruction(&mut self, frame: &mut FrameBuffer<'_>) {
        self.step_frame_unit(frame);
        while !self.cpu.at_instruction_boundary() && !self.cpu.jammed() {
            self.step_frame_unit(frame);
        }
    }

    /// Runs until the host breaks out at a frame boundary.
    pub fn run<H: Host>(&mut self, host: &mut H, frame: &mut FrameBuffer<'_>) {
        loop {
            let sample = self.step_frame_unit(frame);
            host.audio_sample(sample);
            if self.take_frame_boundary() && host.frame_boundary(self, frame).is_break() {
                return;
            }
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            cpu: self.cpu.clone(),
            ppu: self.ppu.clone(),
            apu: self.apu.clone(),
            mapper: self.mapper.clone(),
            ram: self.ram,
            controller_state: self.controller_state,
            controller_shift: self.controller_shift,
            strobe: self.strobe,
            open_bus: self.open_bus,
        }
    }

    /// Like [`snapshot`](Self::snapshot), reusing the buffers in `slot`.
    pub fn save_into(&mut self, slot: &mut Snapshot) {
        slot.cpu.clone_from(&self.cpu);
        slot.ppu.clone_from(&self.ppu);
        slot.apu.clone_from(&self.apu);
        Mapper::copy(&self.mapper, &mut slot.mapper);
        slot.ram = self.ram;
        slot.controller_state = self.controller_state;
        slot.controller_shift = self.controller_shift;
        slot.strobe = self.strobe;
        slot.open_bus = self.open_bus;
        info!("snapshot saved at CPU cycle {}", self.cpu.total_cycles());
        self.push_debug_event("Snapshot saved");
    }

    /// Replaces the machine state with `snapshot`. Nothing is modified when
    /// the snapshot belongs to a different cartridge layout.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), SnapshotError> {
        if self.mapper.kind() != snapshot.mapper.kind() {
            return Err(SnapshotError::MapperMismatch {
                live: self.mapper.name(),
                snapshot: snapshot.mapper.name(),
            });
        }
        if !self.mapper.compatible_with(&snapshot.mapper) {
            return Err(SnapshotError::LayoutMismatch {
                live: self.mapper.chr_ram_len(),
                snapshot: snapshot.mapper.chr_ram_len(),
            });
        }
        snapshot.check_ranges()?;

        self.cpu.clone_from(&snapshot.cpu);
        self.ppu.clone_from(&snapshot.ppu);
        self.apu.clone_from(&snapshot.apu);
        Mapper::copy(&snapshot.mapper, &mut self.mapper);
        self.ram = snapshot.ram;
        self.controller_state = snapshot.controller_state;
        self.controller_shift = snapshot.controller_shift;
        self.strobe = snapshot.strobe;
        self.open_bus = snapshot.open_bus;
        self.frame_ready = false;

        info!("snapshot restored, PC=${:04X}", self.cpu.pc);
        self.push_debug_event(format!("Snapshot restored, PC=${:04X}", self.cpu.pc));
        Ok(())
    }

    pub fn debug_recent_events(&self, limit: usize) -> Vec<String> {
        self.events.iter().rev().take(limit).cloned().collect()
    }

    pub(crate) fn push_debug_event<S: Into<String>>(&mut self, event: S) {
        let event = event.into();
        trace!("{event}");
        if self.events.len() >= MAX_DEBUG_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub(crate) fn cpu_read(&mut self, addr: u16) -> u8 {
        let value = match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF],
            0x2000..=0x3FFF => self.ppu.cpu_read_register(addr, &self.mapper),
            0x4015 => self.apu.read_status(),
            0x4016 => (self.open_bus & 0xE0) | self.read_controller(),
            0x4017 => self.open_bus & 0xE0,
            0x4000..=0x401F => self.open_bus,
            _ => self.mapper.cpu_read(addr, self.open_bus),
        };
        self.open_bus = value;
        value
    }

    pub(crate) fn cpu_write(&mut self, addr: u16, value: u8) {
        self.open_bus = value;
        match addr {
            0x0000..=0x1FFF => self.ram[(addr as usize) & 0x07FF] = value,
            0x2000..=0x3FFF => self.ppu.cpu_write_register(addr, value, &mut self.mapper),
            0x4014 => self.oam_dma(value),
            0x4016 => {
                self.strobe = (value & 0x01) != 0;
                if self.strobe {
                    self.controller_shift = self.controller_state;
                }
            }
            0x4000..=0x4017 => self.apu.write_register(addr, value),
            0x4018..=0x401F => {}
            _ => self.mapper.cpu_write(addr, value),
        }
    }

    /// Serial port 1. Buttons leave MSB first; ones follow the eighth read.
    fn read_controller(&mut self) -> u8 {
        if self.strobe {
            return self.controller_state >> 7;
        }
        let bit = self.controller_shift >> 7;
        self.controller_shift = (self.controller_shift << 1) | 0x01;
        bit
    }

    fn oam_dma(&mut self, page: u8) {
        let base = (page as u16) << 8;
        let mut bytes = [0u8; 256];
        for (offset, slot) in bytes.iter_mut().enumerate() {
            *slot = self.cpu_read(base | offset as u16);
        }
        self.ppu.write_oam_dma(&bytes);

        // One extra alignment cycle when the DMA starts on an odd CPU cycle.
        let stall = OAM_DMA_CYCLES + (self.cpu.total_cycles() & 0x01) as u16;
        self.cpu.stall_cycles = self.cpu.stall_cycles.saturating_add(stall);
        self.counters.oam_dma_transfers = self.counters.oam_dma_transfers.wrapping_add(1);
        self.push_debug_event(format!("OAM DMA page=${page:02X} stall={stall}"));
    }

    fn dmc_dma(&mut self, addr: u16) {
        let value = self.cpu_read(addr);
        self.apu.complete_dmc_dma(value);
        self.cpu.stall_cycles = self.cpu.stall_cycles.saturating_add(DMC_DMA_STALL_CYCLES);
        self.counters.dmc_dma_fetches = self.counters.dmc_dma_fetches.wrapping_add(1);
        self.counters.dmc_dma_stall_cycles = self
            .counters
            .dmc_dma_stall_cycles
            .wrapping_add(DMC_DMA_STALL_CYCLES as u64);
        self.push_debug_event(format!("DMC DMA ${addr:04X} -> ${value:02X}"));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::nes::cartridge::{HEADER_LEN, tests::build_image};
    use crate::nes::frame::Screen;

    /// NROM image with `program` at $8000 and NOPs elsewhere. NMI enters at
    /// $9000 and IRQ/BRK at $9100.
    pub(crate) fn program_image(program: &[u8]) -> Vec<u8> {
        let mut bytes = build_image(0, 2, 1, 0);
        let prg = &mut bytes[HEADER_LEN..HEADER_LEN + 0x8000];
        prg.fill(0xEA);
        prg[..program.len()].copy_from_slice(program);
        prg[0x7FFA..].copy_from_slice(&[0x00, 0x90, 0x00, 0x80, 0x00, 0x91]);
        bytes
    }

    pub(crate) fn nes_with_program(program: &[u8]) -> Nes {
        Nes::from_rom_bytes(&program_image(program)).unwrap()
    }

    fn read_port(nes: &mut Nes) -> u8 {
        nes.cpu_read(0x4016) & 0x01
    }

    #[test]
    fn controller_shifts_out_msb_first_then_ones() {
        let mut nes = nes_with_program(&[]);
        nes.set_controller_state(BUTTON_A | BUTTON_RIGHT);
        nes.cpu_write(0x4016, 1);
        nes.cpu_write(0x4016, 0);

        let bits: Vec<u8> = (0..10).map(|_| read_port(&mut nes)).collect();
        assert_eq!(bits, [1, 0, 0, 0, 0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn controller_state_latches_only_while_strobed() {
        let mut nes = nes_with_program(&[]);
        nes.cpu_write(0x4016, 1);
        nes.cpu_write(0x4016, 0);
        nes.set_controller_state(BUTTON_A);
        assert_eq!(read_port(&mut nes), 0);

        nes.cpu_write(0x4016, 1);
        assert_eq!(read_port(&mut nes), 1);
        assert_eq!(read_port(&mut nes), 1);
        nes.set_controller_state(BUTTON_B);
        assert_eq!(read_port(&mut nes), 0);
    }

    #[test]
    fn controller_port_keeps_open_bus_upper_bits() {
        let mut nes = nes_with_program(&[]);
        nes.set_controller_state(BUTTON_A);
        nes.cpu_write(0x4016, 1);
        nes.open_bus = 0x40;
        assert_eq!(nes.cpu_read(0x4016), 0x41);
        nes.open_bus = 0x40;
        assert_eq!(nes.cpu_read(0x4017), 0x40);
    }

    #[test]
    fn internal_ram_is_mirrored() {
        let mut nes = nes_with_program(&[]);
        nes.cpu_write(0x0801, 0x5A);
        assert_eq!(nes.cpu_read(0x0001), 0x5A);
        assert_eq!(nes.cpu_read(0x1801), 0x5A);
    }

    #[test]
    fn unmapped_reads_return_last_bus_value() {
        let mut nes = nes_with_program(&[]);
        nes.cpu_write(0x0000, 0x5A);
        assert_eq!(nes.cpu_read(0x5000), 0x5A);
        assert_eq!(nes.cpu_read(0x4018), 0x5A);
        nes.cpu_read(0x8000);
        assert_eq!(nes.cpu_read(0x6000), 0xEA);
    }

    #[test]
    fn oam_dma_copies_a_page_and_stalls_the_cpu() {
        let mut nes = nes_with_program(&[]);
        for i in 0..256u16 {
            nes.cpu_write(0x0200 + i, i as u8);
        }
        let odd = nes.cpu.total_cycles() & 1;
        nes.cpu_write(0x4014, 0x02);

        assert_eq!(nes.ppu.peek_oam(5), 5);
        assert_eq!(nes.ppu.peek_oam(255), 255);
        assert_eq!(nes.cpu.stall_cycles as u64, 513 + odd);
        assert_eq!(nes.counters.oam_dma_transfers, 1);
    }

    #[test]
    fn frame_unit_runs_three_dots_per_cpu_cycle() {
        let mut nes = nes_with_program(&[]);
        let mut screen = Screen::default();
        let mut frame = screen.frame();
        let before = nes.ppu.dot();
        nes.step_frame_unit(&mut frame);
        assert_eq!(nes.ppu.dot(), before + 3);
        assert_eq!(nes.counters.cpu_cycles, 1);
    }

    #[test]
    fn run_frame_spans_one_video_frame() {
        let mut nes = nes_with_program(&[]);
        let mut screen = Screen::default();
        let mut frame = screen.frame();
        let mut samples = Vec::new();

        nes.run_frame(&mut frame, &mut samples);
        samples.clear();
        nes.run_frame(&mut frame, &mut samples);

        assert!((29_780..=29_781).contains(&samples.len()), "{}", samples.len());
        assert_eq!(nes.counters.frames, 2);
    }

    #[test]
    fn vblank_nmi_reaches_the_cpu() {
        // LDA #$80; STA $2000
        let mut nes = nes_with_program(&[0xA9, 0x80, 0x8D, 0x00, 0x20]);
        let mut screen = Screen::default();
        let mut frame = screen.frame();
        let mut samples = Vec::new();
        for _ in 0..3 {
            nes.run_frame(&mut frame, &mut samples);
        }
        assert_eq!(nes.counters.nmi_serviced, 2);
    }

    #[test]
    fn dmc_fetch_stalls_cpu_four_cycles() {
        let mut nes = nes_with_program(&[]);
        let mut screen = Screen::default();
        let mut frame = screen.frame();
        nes.cpu_write(0x4012, 0x00);
        nes.cpu_write(0x4013, 0x00);
        nes.cpu_write(0x4015, 0x10);

        nes.step_frame_unit(&mut frame);
        assert_eq!(nes.counters.dmc_dma_fetches, 1);
        assert_eq!(nes.counters.dmc_dma_stall_cycles, 4);
        assert_eq!(nes.cpu.stall_cycles, 4);
    }

    #[test]
    fn snapshot_restore_round_trip() {
        let mut nes = nes_with_program(&[]);
        let mut screen = Screen::default();
        let mut frame = screen.frame();
        let mut samples = Vec::new();
        nes.run_frame(&mut frame, &mut samples);
        nes.cpu_write(0x0010, 0x77);

        let saved = nes.snapshot();
        nes.run_frame(&mut frame, &mut samples);
        nes.cpu_write(0x0010, 0x11);
        assert_ne!(nes.snapshot(), saved);

        nes.restore(&saved).unwrap();
        assert_eq!(nes.snapshot(), saved);
        assert_eq!(nes.peek_ram(0x0010), 0x77);
    }

    #[test]
    fn save_into_reuses_slot() {
        let mut nes = nes_with_program(&[]);
        let mut slot = nes.snapshot();
        nes.cpu_write(0x0020, 0x42);
        nes.save_into(&mut slot);
        assert_eq!(slot, nes.snapshot());
    }

    #[test]
    fn restored_chr_ram_does_not_alias_snapshot() {
        let bytes = build_image(0, 1, 0, 0);
        let mut nes = Nes::from_rom_bytes(&bytes).unwrap();
        nes.mapper.ppu_write(0x0010, 0xAA);

        let saved = nes.snapshot();
        nes.mapper.ppu_write(0x0010, 0xBB);
        assert_eq!(saved.mapper().ppu_read(0x0010), 0xAA);

        nes.restore(&saved).unwrap();
        assert_eq!(nes.mapper.ppu_read(0x0010), 0xAA);
        nes.mapper.ppu_write(0x0010, 0xCC);
        assert_eq!(saved.mapper().ppu_read(0x0010), 0xAA);
    }

    #[test]
    fn restore_rejects_other_cartridge() {
        let mut nes = nes_with_program(&[]);
        let other = Nes::from_rom_bytes(&build_image(1, 2, 1, 0)).unwrap();
        let before = nes.snapshot();

        let err = nes.restore(&other.snapshot()).unwrap_err();
        assert!(matches!(err, SnapshotError::MapperMismatch { .. }));
        assert_eq!(nes.snapshot(), before);

        let chr_ram = Nes::from_rom_bytes(&build_image(0, 2, 0, 0)).unwrap();
        let err = nes.restore(&chr_ram.snapshot()).unwrap_err();
        assert!(matches!(err, SnapshotError::LayoutMismatch { .. }));
    }

    #[test]
    fn json_snapshot_restores_into_same_cartridge() {
        let mut nes = nes_with_program(&[0xA9, 0x42]);
        let mut screen = Screen::default();
        let mut frame = screen.frame();
        let mut samples = Vec::new();
        nes.run_frame(&mut frame, &mut samples);
        let saved = nes.snapshot();
        let json = saved.to_json().unwrap();

        nes.run_frame(&mut frame, &mut samples);
        nes.restore(&Snapshot::from_json(&json).unwrap()).unwrap();
        assert_eq!(nes.snapshot(), saved);

        assert!(matches!(
            Snapshot::from_json("{}"),
            Err(SnapshotError::Json(_))
        ));
    }

    #[test]
    fn parsed_snapshot_mapper_reads_without_rom() {
        for mapper_id in [0, 1, 2, 3, 4] {
            let nes = Nes::from_rom_bytes(&build_image(mapper_id, 2, 1, 0)).unwrap();
            let json = nes.snapshot().to_json().unwrap();
            let parsed = Snapshot::from_json(&json).unwrap();

            assert_eq!(parsed.mapper().cpu_read(0x8000, 0x5A), 0);
            assert_eq!(parsed.mapper().cpu_read(0xFFFC, 0x5A), 0);
            assert_eq!(parsed.mapper().ppu_read(0x0000), 0);
        }
    }

    #[test]
    fn out_of_range_counters_are_rejected() {
        let nes = nes_with_program(&[]);
        let json = nes.snapshot().to_json().unwrap();

        for (section, field, value) in [
            ("ppu", "sprite_count", 9),
            ("ppu", "dot", 341),
            ("ppu", "scanline", 262),
        ] {
            let mut crafted: serde_json::Value = serde_json::from_str(&json).unwrap();
            crafted[section][field] = value.into();
            let err = Snapshot::from_json(&crafted.to_string()).unwrap_err();
            assert!(matches!(err, SnapshotError::OutOfRange(_)), "{field}: {err}");
        }

        let mut crafted: serde_json::Value = serde_json::from_str(&json).unwrap();
        crafted["apu"]["triangle"]["step"] = 32.into();
        assert!(matches!(
            Snapshot::from_json(&crafted.to_string()),
            Err(SnapshotError::OutOfRange("apu.triangle"))
        ));
    }

    #[test]
    fn reset_keeps_mapper_banking() {
        let mut nes = Nes::from_rom_bytes(&build_image(2, 4, 0, 0)).unwrap();
        nes.cpu_write(0x8000, 2);
        nes.cpu_write(0x0000, 0x99);
        nes.reset();

        assert_eq!(nes.cpu.pc, 0x0404);
        assert_eq!(nes.cpu.sp, 0xFD);
        assert_eq!(nes.cpu_read(0x8000), 3);
        assert_eq!(nes.peek_ram(0x0000), 0x99);
        assert_eq!(nes.debug_recent_events(1), ["CPU reset, PC=$0404"]);
    }
}
