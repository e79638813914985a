use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use eframe::egui::{self, ColorImage, Key, TextureHandle, TextureOptions};

use crate::audio::{AudioOutput, Resampler};
use crate::nes::frame::{SCREEN_HEIGHT, SCREEN_WIDTH, Screen};
use crate::nes::{
    BUTTON_A, BUTTON_B, BUTTON_DOWN, BUTTON_LEFT, BUTTON_RIGHT, BUTTON_SELECT, BUTTON_START,
    BUTTON_UP, Nes, Snapshot,
};

const NTSC_FRAME_RATE_HZ: f64 = 60.098_813_897_440_515;
const MAX_FRAMES_PER_UPDATE: u32 = 2;
const AUDIO_MAX_BUFFER_MS: usize = 40;
const AUDIO_TARGET_BUFFER_MS: usize = 20;
const FALLBACK_SAMPLE_RATE: u32 = 48_000;

/// Keyboard layout: K/J are A/B, U/I are Select/Start, WASD or arrows steer.
const KEY_MAP: [(Key, u8); 12] = [
    (Key::K, BUTTON_A),
    (Key::J, BUTTON_B),
    (Key::U, BUTTON_SELECT),
    (Key::I, BUTTON_START),
    (Key::W, BUTTON_UP),
    (Key::S, BUTTON_DOWN),
    (Key::A, BUTTON_LEFT),
    (Key::D, BUTTON_RIGHT),
    (Key::ArrowUp, BUTTON_UP),
    (Key::ArrowDown, BUTTON_DOWN),
    (Key::ArrowLeft, BUTTON_LEFT),
    (Key::ArrowRight, BUTTON_RIGHT),
];

pub struct NesApp {
    nes: Option<Nes>,
    screen: Screen,
    frame_texture: Option<TextureHandle>,
    status_line: String,
    loaded_rom: Option<PathBuf>,
    audio: Option<AudioOutput>,
    resampler: Resampler,
    samples: Vec<f32>,
    frame_interval: Duration,
    next_frame_at: Option<Instant>,
    paused: bool,
    save_slot: Option<Snapshot>,
}

impl NesApp {
    pub fn new(cc: &eframe::CreationContext<'_>, rom: Option<PathBuf>) -> Self {
        cc.egui_ctx.set_visuals(egui::Visuals::dark());

        let audio = match AudioOutput::new(AUDIO_MAX_BUFFER_MS) {
            Ok(audio) => Some(audio),
            Err(err) => {
                log::warn!("audio disabled: {err:#}");
                None
            }
        };
        let sample_rate = audio
            .as_ref()
            .map_or(FALLBACK_SAMPLE_RATE, AudioOutput::sample_rate);

        let mut app = Self {
            nes: None,
            screen: Screen::default(),
            frame_texture: None,
            status_line: "Drop a .nes file or click Open ROM".to_string(),
            loaded_rom: None,
            audio,
            resampler: Resampler::new(sample_rate),
            samples: Vec::with_capacity(30_000),
            frame_interval: Duration::from_secs_f64(1.0 / NTSC_FRAME_RATE_HZ),
            next_frame_at: None,
            paused: false,
            save_slot: None,
        };
        if let Some(path) = rom {
            app.load_rom(&path);
        }
        app
    }

    fn load_rom(&mut self, path: &Path) {
        match Nes::from_file(path) {
            Ok(nes) => {
                self.status_line = format!(
                    "Loaded {} using {}",
                    path.file_name().and_then(|f| f.to_str()).unwrap_or("ROM"),
                    nes.mapper().name()
                );
                self.nes = Some(nes);
                self.loaded_rom = Some(path.to_path_buf());
                self.save_slot = None;
                self.screen = Screen::default();
                self.frame_texture = None;
                self.next_frame_at = None;
            }
            Err(err) => {
                log::error!("{err:#}");
                self.status_line = format!("Failed to load ROM: {err:#}");
            }
        }
    }

    fn open_rom_dialog(&mut self) {
        if let Some(path) = rfd::FileDialog::new()
            .add_filter("NES ROM", &["nes"])
            .set_title("Open NES ROM")
            .pick_file()
        {
            self.load_rom(&path);
        }
    }

    fn handle_dropped_files(&mut self, ctx: &egui::Context) {
        let dropped = ctx.input(|input| input.raw.dropped_files.clone());
        for path in dropped.into_iter().filter_map(|file| file.path) {
            let is_nes = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("nes"));

            if is_nes {
                self.load_rom(&path);
            } else {
                self.status_line = format!("Unsupported file: {}", path.display());
            }
        }
    }

    fn handle_shortcuts(&mut self, ctx: &egui::Context) {
        if ctx.input(|i| i.modifiers.command && i.key_pressed(Key::O)) {
            self.open_rom_dialog();
        }

        let (reset, pause, save, restore) = ctx.input(|i| {
            (
                i.key_pressed(Key::R),
                i.key_pressed(Key::P),
                i.key_pressed(Key::Q),
                i.key_pressed(Key::E),
            )
        });
        if reset {
            self.reset();
        }
        if pause {
            self.toggle_pause();
        }
        if save {
            self.save_state();
        }
        if restore {
            self.restore_state();
        }
    }

    fn reset(&mut self) {
        if let Some(nes) = self.nes.as_mut() {
            nes.reset();
            self.next_frame_at = None;
            self.status_line = "Reset complete".to_string();
        }
    }

    fn toggle_pause(&mut self) {
        if self.nes.is_some() {
            self.paused = !self.paused;
            self.next_frame_at = None;
        }
    }

    // Frames always end at the pre-render boundary, so the console is quiescent here.
    fn save_state(&mut self) {
        let Some(nes) = self.nes.as_mut() else {
            return;
        };
        match self.save_slot.as_mut() {
            Some(slot) => nes.save_into(slot),
            None => self.save_slot = Some(nes.snapshot()),
        }
        self.status_line = "State saved".to_string();
    }

    fn restore_state(&mut self) {
        let (Some(nes), Some(slot)) = (self.nes.as_mut(), self.save_slot.as_ref()) else {
            return;
        };
        self.status_line = match nes.restore(slot) {
            Ok(()) => "State restored".to_string(),
            Err(err) => format!("Restore failed: {err}"),
        };
    }

    fn controller_state_from_input(ctx: &egui::Context) -> u8 {
        ctx.input(|input| {
            KEY_MAP
                .iter()
                .filter(|(key, _)| input.key_down(*key))
                .fold(0u8, |state, (_, button)| state | button)
        })
    }

    fn update_texture(&mut self, ctx: &egui::Context) {
        let image =
            ColorImage::from_rgba_unmultiplied([SCREEN_WIDTH, SCREEN_HEIGHT], &self.screen.to_rgba());

        if let Some(texture) = self.frame_texture.as_mut() {
            texture.set(image, TextureOptions::NEAREST);
        } else {
            self.frame_texture =
                Some(ctx.load_texture("nes-frame", image, TextureOptions::NEAREST));
        }
    }

    fn run_frame_with_audio(&mut self, controller_state: u8) {
        let Some(nes) = self.nes.as_mut() else {
            return;
        };
        nes.set_controller_state(controller_state);
        self.samples.clear();
        nes.run_frame(&mut self.screen.frame(), &mut self.samples);

        self.resampler.extend(&self.samples);
        let output = self.resampler.take_output();
        if let Some(audio) = &self.audio {
            audio.push_samples(&output);
        }
    }

    fn audio_is_saturated(&self) -> bool {
        self.audio.as_ref().is_some_and(|audio| {
            audio.queued_samples() >= audio.sample_rate() as usize * AUDIO_TARGET_BUFFER_MS / 1000
        })
    }

    fn debug_panel(&self, ui: &mut egui::Ui) {
        let Some(nes) = self.nes.as_ref() else {
            ui.label("No ROM loaded");
            return;
        };
        let cpu = nes.cpu();
        let ppu = nes.ppu();
        let counters = nes.counters();
        ui.monospace(format!(
            "CPU A={:02X} X={:02X} Y={:02X} P={:02X} SP={:02X} PC={:04X} cycles={}{}",
            cpu.a,
            cpu.x,
            cpu.y,
            cpu.p,
            cpu.sp,
            cpu.pc,
            cpu.total_cycles(),
            if cpu.jammed() { " JAMMED" } else { "" }
        ));
        ui.monospace(format!(
            "PPU scanline={} dot={} ctrl={:02X} mask={:02X} status={:02X}",
            ppu.scanline(),
            ppu.dot(),
            ppu.ctrl(),
            ppu.mask(),
            ppu.status()
        ));
        ui.monospace(format!(
            "frames={} nmi={} irq={} oam_dma={} dmc_dma={} (stall {}) unknown_ops={}",
            counters.frames,
            counters.nmi_serviced,
            counters.irq_serviced,
            counters.oam_dma_transfers,
            counters.dmc_dma_fetches,
            counters.dmc_dma_stall_cycles,
            counters.unknown_opcodes
        ));
        ui.monospace(format!("Mapper: {}", nes.mapper().debug_state()));

        let events = nes.debug_recent_events(8);
        if !events.is_empty() {
            ui.separator();
            ui.label("Recent events:");
            for event in events {
                ui.monospace(event);
            }
        }
    }
}

impl eframe::App for NesApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.handle_dropped_files(ctx);
        self.handle_shortcuts(ctx);

        let now = Instant::now();
        if self.nes.is_some() && !self.paused {
            let mut next = self.next_frame_at.unwrap_or(now);
            let mut ran_frames = 0u32;
            while Instant::now() >= next
                && !self.audio_is_saturated()
                && ran_frames < MAX_FRAMES_PER_UPDATE
            {
                let state = Self::controller_state_from_input(ctx);
                self.run_frame_with_audio(state);
                ran_frames += 1;
                next += self.frame_interval;
            }

            if ran_frames == 0 && now > next + self.frame_interval {
                next = now;
            }
            self.next_frame_at = Some(next);
        }

        self.update_texture(ctx);

        egui::TopBottomPanel::top("toolbar").show(ctx, |ui| {
            ui.horizontal(|ui| {
                if ui.button("Open ROM").clicked() {
                    self.open_rom_dialog();
                }

                let has_rom = self.nes.is_some();
                if ui
                    .add_enabled(has_rom, egui::Button::new("Reset (R)"))
                    .clicked()
                {
                    self.reset();
                }
                let pause_label = if self.paused { "Resume (P)" } else { "Pause (P)" };
                if ui
                    .add_enabled(has_rom, egui::Button::new(pause_label))
                    .clicked()
                {
                    self.toggle_pause();
                }
                if ui
                    .add_enabled(has_rom, egui::Button::new("Save (Q)"))
                    .clicked()
                {
                    self.save_state();
                }
                if ui
                    .add_enabled(self.save_slot.is_some(), egui::Button::new("Restore (E)"))
                    .clicked()
                {
                    self.restore_state();
                }

                if let Some(path) = &self.loaded_rom {
                    ui.separator();
                    ui.label(path.display().to_string());
                }
            });
        });

        egui::TopBottomPanel::bottom("status").show(ctx, |ui| {
            ui.horizontal_wrapped(|ui| {
                ui.label(&self.status_line);
                ui.separator();
                match &self.audio {
                    Some(audio) => ui.label(format!(
                        "Audio: {} Hz (queue {} ms)",
                        audio.sample_rate(),
                        audio.queued_samples() * 1000 / audio.sample_rate() as usize
                    )),
                    None => ui.label("Audio: unavailable"),
                };
                ui.separator();
                ui.label("Controls: WASD/arrows move, K=A, J=B, I=Start, U=Select");
            });
            ui.separator();
            ui.collapsing("Debug", |ui| self.debug_panel(ui));
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.vertical_centered(|ui| {
                let available = ui.available_size();
                let scale_x = (available.x / SCREEN_WIDTH as f32).max(1.0);
                let scale_y = (available.y / SCREEN_HEIGHT as f32).max(1.0);
                let scale = scale_x.min(scale_y).floor().max(1.0);
                let target = egui::vec2(SCREEN_WIDTH as f32 * scale, SCREEN_HEIGHT as f32 * scale);

                if let Some(texture) = &self.frame_texture {
                    ui.add(egui::Image::new(texture).fit_to_exact_size(target));
                }
            });
        });

        let wait = self
            .next_frame_at
            .map_or(self.frame_interval, |next| {
                next.saturating_duration_since(Instant::now())
            });
        ctx.request_repaint_after(wait.min(self.frame_interval));
    }
}
