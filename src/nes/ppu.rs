use serde::{Deserialize, Serialize};

use super::frame::FrameBuffer;
use super::mapper::Mapper;
use super::palette::argb;
use super::serde_bytes;

pub const VISIBLE_LINES: u16 = 240;
pub const VBLANK_LINE: u16 = 241;
pub const PRE_RENDER_LINE: u16 = 261;
pub const DOTS_PER_LINE: u16 = 341;
/// Pre-render dot at which the frame is handed to the host.
pub const FRAME_BOUNDARY_DOT: u16 = 338;

const CTRL_NMI_ENABLE: u8 = 0x80;
const CTRL_VRAM_INC_32: u8 = 0x04;
const CTRL_SPRITE_TABLE: u8 = 0x08;
const CTRL_BG_TABLE: u8 = 0x10;
const CTRL_SPRITE_SIZE_16: u8 = 0x20;

const MASK_GRAYSCALE: u8 = 0x01;
const MASK_SHOW_BG_LEFT: u8 = 0x02;
const MASK_SHOW_SPRITE_LEFT: u8 = 0x04;
const MASK_SHOW_BG: u8 = 0x08;
const MASK_SHOW_SPRITES: u8 = 0x10;

const STATUS_SPRITE_OVERFLOW: u8 = 0x20;
const STATUS_SPRITE_ZERO_HIT: u8 = 0x40;
const STATUS_VBLANK: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ppu {
    ctrl: u8,
    mask: u8,
    status: u8,

    oam_addr: u8,
    #[serde(with = "serde_bytes::array")]
    oam: [u8; 256],

    #[serde(with = "serde_bytes::array")]
    vram: [u8; 2048],
    #[serde(with = "serde_bytes::array")]
    palette_ram: [u8; 32],

    write_toggle: bool,
    v: u16,
    t: u16,
    fine_x: u8,
    read_buffer: u8,
    open_bus: u8,

    scanline: u16,
    dot: u16,
    odd_frame: bool,
    frame_count: u64,
    frame_ready: bool,
    vblank_suppress: bool,
    nmi_line: bool,
    nmi_edge: bool,

    next_tile_id: u8,
    next_tile_attr: u8,
    next_tile_lsb: u8,
    next_tile_msb: u8,
    bg_shift_pattern_lo: u16,
    bg_shift_pattern_hi: u16,
    bg_shift_attr_lo: u16,
    bg_shift_attr_hi: u16,

    sprite_count: usize,
    sprite_patterns_lo: [u8; 8],
    sprite_patterns_hi: [u8; 8],
    sprite_x: [u8; 8],
    sprite_attributes: [u8; 8],
    sprite_zero_on_line: bool,
}

impl Default for Ppu {
    fn default() -> Self {
        Self::new()
    }
}

impl Ppu {
    pub fn new() -> Self {
        Self {
            ctrl: 0,
            mask: 0,
            status: 0,
            oam_addr: 0,
            oam: [0; 256],
            vram: [0; 2048],
            palette_ram: [0x0F; 32],
            write_toggle: false,
            v: 0,
            t: 0,
            fine_x: 0,
            read_buffer: 0,
            open_bus: 0,
            scanline: PRE_RENDER_LINE,
            dot: 0,
            odd_frame: false,
            frame_count: 0,
            frame_ready: false,
            vblank_suppress: false,
            nmi_line: false,
            nmi_edge: false,
            next_tile_id: 0,
            next_tile_attr: 0,
            next_tile_lsb: 0,
            next_tile_msb: 0,
            bg_shift_pattern_lo: 0,
            bg_shift_pattern_hi: 0,
            bg_shift_attr_lo: 0,
            bg_shift_attr_hi: 0,
            sprite_count: 0,
            sprite_patterns_lo: [0; 8],
            sprite_patterns_hi: [0; 8],
            sprite_x: [0; 8],
            sprite_attributes: [0; 8],
            sprite_zero_on_line: false,
        }
    }

    /// Clears registers and timing. Nametable and OAM contents survive, as
    /// they do across a console reset.
    pub fn reset(&mut self) {
        let vram = self.vram;
        let oam = self.oam;
        let frame_count = self.frame_count;
        *self = Self::new();
        self.vram = vram;
        self.oam = oam;
        self.frame_count = frame_count;
    }

    pub fn scanline(&self) -> u16 {
        self.scanline
    }

    pub fn dot(&self) -> u16 {
        self.dot
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn ctrl(&self) -> u8 {
        self.ctrl
    }

    pub fn mask(&self) -> u8 {
        self.mask
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn vblank(&self) -> bool {
        (self.status & STATUS_VBLANK) != 0
    }

    pub fn peek_vram(&self, index: usize) -> u8 {
        self.vram[index % self.vram.len()]
    }

    pub fn peek_palette(&self, index: usize) -> u8 {
        self.palette_ram[index % self.palette_ram.len()]
    }

    pub fn peek_oam(&self, index: usize) -> u8 {
        self.oam[index % self.oam.len()]
    }

    /// First timing counter outside its hardware range, for snapshot checks.
    pub(crate) fn out_of_range_field(&self) -> Option<&'static str> {
        if self.scanline > PRE_RENDER_LINE {
            Some("ppu.scanline")
        } else if self.dot >= DOTS_PER_LINE {
            Some("ppu.dot")
        } else if self.sprite_count > self.sprite_x.len() {
            Some("ppu.sprite_count")
        } else {
            None
        }
    }

    /// Consumes the pending NMI edge, if any.
    pub fn take_nmi(&mut self) -> bool {
        std::mem::take(&mut self.nmi_edge)
    }

    /// True once per frame, when the pre-render line reaches the boundary dot.
    pub fn take_frame_boundary(&mut self) -> bool {
        std::mem::take(&mut self.frame_ready)
    }

    pub fn cpu_read_register(&mut self, addr: u16, mapper: &Mapper) -> u8 {
        let value = match 0x2000 | (addr & 0x0007) {
            0x2002 => {
                // Reading on the dot before vblank starts suppresses it for the frame.
                if self.scanline == VBLANK_LINE && self.dot == 0 {
                    self.vblank_suppress = true;
                }

                let value = (self.status & 0xE0) | (self.open_bus & 0x1F);
                self.status &= !STATUS_VBLANK;
                self.write_toggle = false;
                self.update_nmi_line();
                value
            }
            0x2004 => self.oam[self.oam_addr as usize],
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                let value = self.ppu_read(ppu_addr, mapper);
                let result = if ppu_addr >= 0x3F00 {
                    // Palette reads bypass the buffer, which picks up the nametable underneath.
                    self.read_buffer = self.ppu_read(ppu_addr - 0x1000, mapper);
                    value
                } else {
                    std::mem::replace(&mut self.read_buffer, value)
                };

                self.increment_vram_addr_cpu_access();
                result
            }
            _ => self.open_bus,
        };
        self.open_bus = value;
        value
    }

    pub fn cpu_write_register(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        self.open_bus = value;
        match 0x2000 | (addr & 0x0007) {
            0x2000 => {
                self.ctrl = value;
                self.t = (self.t & !0x0C00) | (((value as u16) & 0x03) << 10);
                self.update_nmi_line();
            }
            0x2001 => self.mask = value,
            0x2003 => self.oam_addr = value,
            0x2004 => {
                self.oam[self.oam_addr as usize] = value;
                self.oam_addr = self.oam_addr.wrapping_add(1);
            }
            0x2005 => {
                if !self.write_toggle {
                    self.fine_x = value & 0x07;
                    self.t = (self.t & !0x001F) | ((value as u16) >> 3);
                } else {
                    self.t = (self.t & !0x03E0) | (((value as u16) >> 3) << 5);
                    self.t = (self.t & !0x7000) | (((value as u16) & 0x07) << 12);
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2006 => {
                if !self.write_toggle {
                    self.t = (self.t & 0x00FF) | (((value as u16) & 0x3F) << 8);
                } else {
                    self.t = (self.t & 0x7F00) | (value as u16);
                    self.v = self.t;
                }
                self.write_toggle = !self.write_toggle;
            }
            0x2007 => {
                let ppu_addr = self.v & 0x3FFF;
                self.ppu_write(ppu_addr, value, mapper);
                self.increment_vram_addr_cpu_access();
            }
            _ => {}
        }
    }

    pub fn write_oam_dma(&mut self, bytes: &[u8; 256]) {
        for byte in bytes {
            self.oam[self.oam_addr as usize] = *byte;
            self.oam_addr = self.oam_addr.wrapping_add(1);
        }
    }

    /// Advances one dot, writing a pixel into `frame` on visible dots.
    pub fn step(&mut self, mapper: &mut Mapper, frame: &mut FrameBuffer<'_>) {
        let visible_line = self.scanline < VISIBLE_LINES;
        let pre_render = self.scanline == PRE_RENDER_LINE;
        let render_line = visible_line || pre_render;
        let rendering_enabled = self.rendering_enabled();

        if pre_render && self.dot == 1 {
            self.status &= !(STATUS_VBLANK | STATUS_SPRITE_ZERO_HIT | STATUS_SPRITE_OVERFLOW);
            self.vblank_suppress = false;
            self.update_nmi_line();
        }

        if self.scanline == VBLANK_LINE && self.dot == 1 {
            if !self.vblank_suppress {
                self.status |= STATUS_VBLANK;
            }
            self.vblank_suppress = false;
            self.frame_count = self.frame_count.wrapping_add(1);
            self.update_nmi_line();
        }

        if visible_line && self.dot == 0 {
            self.evaluate_sprites(mapper);
        }

        // Dot 1 draws bit 15 as loaded; every later dot shifts first.
        if render_line
            && rendering_enabled
            && ((2..=257).contains(&self.dot) || (322..=337).contains(&self.dot))
        {
            self.shift_background_registers();
        }

        if visible_line && (1..=256).contains(&self.dot) {
            let x = (self.dot - 1) as usize;
            self.render_pixel(x, self.scanline as usize, frame);
        }

        if render_line && rendering_enabled {
            if (1..=256).contains(&self.dot) || (321..=336).contains(&self.dot) {
                self.fetch_background((self.dot - 1) & 0x07, mapper);
            }

            if visible_line && (1..=256).contains(&self.dot) {
                self.shift_sprite_registers();
            }

            match self.dot {
                256 => self.increment_y(),
                257 => {
                    self.load_background_shifters();
                    self.copy_horizontal_bits();
                }
                260 => mapper.clock_scanline(),
                280..=304 if pre_render => self.copy_vertical_bits(),
                338 | 340 => {
                    self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
                }
                _ => {}
            }
        }

        if pre_render && self.dot == FRAME_BOUNDARY_DOT {
            self.frame_ready = true;
        }

        // Odd frames drop the last pre-render dot while rendering.
        if pre_render && rendering_enabled && self.odd_frame && self.dot == 339 {
            self.dot = 0;
            self.scanline = 0;
            self.odd_frame = false;
            return;
        }

        self.dot += 1;
        if self.dot == DOTS_PER_LINE {
            self.dot = 0;
            self.scanline += 1;
            if self.scanline > PRE_RENDER_LINE {
                self.scanline = 0;
                self.odd_frame = !self.odd_frame;
            }
        }
    }

    fn fetch_background(&mut self, phase: u16, mapper: &Mapper) {
        let table = if (self.ctrl & CTRL_BG_TABLE) != 0 {
            0x1000
        } else {
            0x0000
        };
        let fine_y = (self.v >> 12) & 0x07;
        match phase {
            0 => {
                self.load_background_shifters();
                self.next_tile_id = self.ppu_read(0x2000 | (self.v & 0x0FFF), mapper);
            }
            2 => {
                let addr = 0x23C0
                    | (self.v & 0x0C00)
                    | ((self.v >> 4) & 0x0038)
                    | ((self.v >> 2) & 0x0007);
                let attr = self.ppu_read(addr, mapper);
                let shift = ((self.v >> 4) & 0x04) | (self.v & 0x02);
                self.next_tile_attr = (attr >> shift) & 0x03;
            }
            4 => {
                let addr = table + (self.next_tile_id as u16) * 16 + fine_y;
                self.next_tile_lsb = self.ppu_read(addr, mapper);
            }
            6 => {
                let addr = table + (self.next_tile_id as u16) * 16 + fine_y + 8;
                self.next_tile_msb = self.ppu_read(addr, mapper);
            }
            7 => self.increment_coarse_x(),
            _ => {}
        }
    }

    fn rendering_enabled(&self) -> bool {
        (self.mask & (MASK_SHOW_BG | MASK_SHOW_SPRITES)) != 0
    }

    fn update_nmi_line(&mut self) {
        let line = (self.ctrl & CTRL_NMI_ENABLE) != 0 && (self.status & STATUS_VBLANK) != 0;
        if line && !self.nmi_line {
            self.nmi_edge = true;
        }
        self.nmi_line = line;
    }

    fn render_pixel(&mut self, x: usize, y: usize, frame: &mut FrameBuffer<'_>) {
        let (bg_pixel, bg_palette) = self.background_sample(x);
        let (spr_pixel, spr_palette, spr_behind_bg, spr_is_zero) = self.sprite_sample(x);
        let bg_opaque = bg_pixel != 0;

        if spr_is_zero && bg_opaque && x < 255 {
            self.status |= STATUS_SPRITE_ZERO_HIT;
        }

        let palette_index = match (bg_opaque, spr_pixel != 0) {
            (false, false) => 0,
            (false, true) => 0x10 | (spr_palette << 2) | spr_pixel,
            (true, true) if !spr_behind_bg => 0x10 | (spr_palette << 2) | spr_pixel,
            (true, _) => (bg_palette << 2) | bg_pixel,
        };

        let mut color = self.palette_ram[palette_ram_index(palette_index as u16)] & 0x3F;
        if (self.mask & MASK_GRAYSCALE) != 0 {
            color &= 0x30;
        }
        frame.put(y, x, argb(color));
    }

    fn background_sample(&self, x: usize) -> (u8, u8) {
        if (self.mask & MASK_SHOW_BG) == 0 {
            return (0, 0);
        }
        if x < 8 && (self.mask & MASK_SHOW_BG_LEFT) == 0 {
            return (0, 0);
        }

        let bit = 0x8000u16 >> self.fine_x;
        let p0 = u8::from((self.bg_shift_pattern_lo & bit) != 0);
        let p1 = u8::from((self.bg_shift_pattern_hi & bit) != 0);
        let a0 = u8::from((self.bg_shift_attr_lo & bit) != 0);
        let a1 = u8::from((self.bg_shift_attr_hi & bit) != 0);

        ((p1 << 1) | p0, (a1 << 1) | a0)
    }

    /// First opaque sprite at `x`: (pixel, palette, behind background, is sprite 0).
    fn sprite_sample(&self, x: usize) -> (u8, u8, bool, bool) {
        if (self.mask & MASK_SHOW_SPRITES) == 0 {
            return (0, 0, false, false);
        }
        if x < 8 && (self.mask & MASK_SHOW_SPRITE_LEFT) == 0 {
            return (0, 0, false, false);
        }

        for i in 0..self.sprite_count {
            if self.sprite_x[i] != 0 {
                continue;
            }

            let p0 = (self.sprite_patterns_lo[i] & 0x80) >> 7;
            let p1 = (self.sprite_patterns_hi[i] & 0x80) >> 6;
            let pixel = p0 | p1;
            if pixel == 0 {
                continue;
            }

            let attributes = self.sprite_attributes[i];
            return (
                pixel,
                attributes & 0x03,
                (attributes & 0x20) != 0,
                i == 0 && self.sprite_zero_on_line,
            );
        }

        (0, 0, false, false)
    }

    fn shift_background_registers(&mut self) {
        self.bg_shift_pattern_lo <<= 1;
        self.bg_shift_pattern_hi <<= 1;
        self.bg_shift_attr_lo <<= 1;
        self.bg_shift_attr_hi <<= 1;
    }

    fn shift_sprite_registers(&mut self) {
        for i in 0..self.sprite_count {
            if self.sprite_x[i] > 0 {
                self.sprite_x[i] -= 1;
            } else {
                self.sprite_patterns_lo[i] <<= 1;
                self.sprite_patterns_hi[i] <<= 1;
            }
        }
    }

    fn load_background_shifters(&mut self) {
        self.bg_shift_pattern_lo = (self.bg_shift_pattern_lo & 0xFF00) | self.next_tile_lsb as u16;
        self.bg_shift_pattern_hi = (self.bg_shift_pattern_hi & 0xFF00) | self.next_tile_msb as u16;

        let attr_lo = if (self.next_tile_attr & 0x01) != 0 { 0xFF } else { 0x00 };
        let attr_hi = if (self.next_tile_attr & 0x02) != 0 { 0xFF } else { 0x00 };
        self.bg_shift_attr_lo = (self.bg_shift_attr_lo & 0xFF00) | attr_lo;
        self.bg_shift_attr_hi = (self.bg_shift_attr_hi & 0xFF00) | attr_hi;
    }

    fn increment_coarse_x(&mut self) {
        if (self.v & 0x001F) == 31 {
            self.v &= !0x001F;
            self.v ^= 0x0400;
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn increment_y(&mut self) {
        if (self.v & 0x7000) != 0x7000 {
            self.v = self.v.wrapping_add(0x1000);
            return;
        }

        self.v &= !0x7000;
        let y = match (self.v & 0x03E0) >> 5 {
            29 => {
                self.v ^= 0x0800;
                0
            }
            31 => 0,
            y => y + 1,
        };
        self.v = (self.v & !0x03E0) | (y << 5);
    }

    fn copy_horizontal_bits(&mut self) {
        self.v = (self.v & !0x041F) | (self.t & 0x041F);
    }

    fn copy_vertical_bits(&mut self) {
        self.v = (self.v & !0x7BE0) | (self.t & 0x7BE0);
    }

    /// Loads up to eight sprites covering the current line into the shifters.
    fn evaluate_sprites(&mut self, mapper: &Mapper) {
        let sprite_height: u16 = if (self.ctrl & CTRL_SPRITE_SIZE_16) != 0 {
            16
        } else {
            8
        };

        self.sprite_count = 0;
        self.sprite_zero_on_line = false;

        for i in 0..64 {
            let base = i * 4;
            let top = self.oam[base] as u16 + 1;
            if self.scanline < top || self.scanline - top >= sprite_height {
                continue;
            }

            if self.sprite_count == 8 {
                if self.rendering_enabled() {
                    self.status |= STATUS_SPRITE_OVERFLOW;
                }
                break;
            }

            let tile_index = self.oam[base + 1];
            let attributes = self.oam[base + 2];
            let mut row = self.scanline - top;
            if (attributes & 0x80) != 0 {
                row = sprite_height - 1 - row;
            }

            let (table, tile) = if sprite_height == 16 {
                (
                    ((tile_index & 0x01) as u16) * 0x1000,
                    ((tile_index & 0xFE) as u16) + row / 8,
                )
            } else if (self.ctrl & CTRL_SPRITE_TABLE) != 0 {
                (0x1000, tile_index as u16)
            } else {
                (0x0000, tile_index as u16)
            };

            let addr = table + tile * 16 + (row & 0x07);
            let mut low = mapper.ppu_read(addr);
            let mut high = mapper.ppu_read(addr + 8);
            if (attributes & 0x40) != 0 {
                low = low.reverse_bits();
                high = high.reverse_bits();
            }

            let slot = self.sprite_count;
            self.sprite_patterns_lo[slot] = low;
            self.sprite_patterns_hi[slot] = high;
            self.sprite_x[slot] = self.oam[base + 3];
            self.sprite_attributes[slot] = attributes;
            if i == 0 {
                self.sprite_zero_on_line = true;
            }
            self.sprite_count += 1;
        }
    }

    fn increment_vram_addr_cpu_access(&mut self) {
        let render_line = self.scanline < VISIBLE_LINES || self.scanline == PRE_RENDER_LINE;
        // $2007 access while rendering bumps coarse X and Y instead.
        if self.rendering_enabled() && render_line {
            self.increment_coarse_x();
            self.increment_y();
        } else if (self.ctrl & CTRL_VRAM_INC_32) != 0 {
            self.v = self.v.wrapping_add(32);
        } else {
            self.v = self.v.wrapping_add(1);
        }
    }

    fn ppu_read(&self, addr: u16, mapper: &Mapper) -> u8 {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_read(addr),
            0x2000..=0x3EFF => self.vram[nametable_index(addr, mapper)],
            _ => self.palette_ram[palette_ram_index(addr)],
        }
    }

    fn ppu_write(&mut self, addr: u16, value: u8, mapper: &mut Mapper) {
        let addr = addr & 0x3FFF;
        match addr {
            0x0000..=0x1FFF => mapper.ppu_write(addr, value),
            0x2000..=0x3EFF => self.vram[nametable_index(addr, mapper)] = value,
            _ => self.palette_ram[palette_ram_index(addr)] = value,
        }
    }
}

/// Sprite backdrop entries $3F10/$14/$18/$1C alias the background ones.
fn palette_ram_index(addr: u16) -> usize {
    let index = (addr & 0x1F) as usize;
    if index >= 16 && (index & 0x03) == 0 {
        index - 16
    } else {
        index
    }
}

fn nametable_index(addr: u16, mapper: &Mapper) -> usize {
    let index = ((addr - 0x2000) & 0x0FFF) as usize;
    let page = mapper.mirroring().page(index / 0x400);
    page * 0x400 + (index & 0x3FF)
}
