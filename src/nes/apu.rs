use serde::{Deserialize, Serialize};

pub const CPU_CLOCK_HZ: f64 = 1_789_772.727_272_727_3;

const LENGTH_TABLE: [u8; 32] = [
    10, 254, 20, 2, 40, 4, 80, 6, 160, 8, 60, 10, 14, 12, 26, 14, 12, 16, 24, 18, 48, 20, 96, 22,
    192, 24, 72, 26, 16, 28, 32, 30,
];

const DUTY_TABLE: [u8; 4] = [0b0100_0000, 0b0110_0000, 0b0111_1000, 0b1001_1111];

const TRIANGLE_SEQUENCE: [u8; 32] = [
    15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12,
    13, 14, 15,
];

const NOISE_PERIOD_TABLE: [u16; 16] = [
    4, 8, 16, 32, 64, 96, 128, 160, 202, 254, 380, 508, 762, 1016, 2034, 4068,
];

const DMC_RATE_TABLE: [u16; 16] = [
    428, 380, 340, 320, 286, 254, 226, 214, 190, 160, 142, 128, 106, 84, 72, 54,
];

const FC_QUARTER_1: u32 = 7_457;
const FC_HALF_1: u32 = 14_913;
const FC_QUARTER_3: u32 = 22_371;
const FC_4STEP_HALF_2: u32 = 29_829;
const FC_4STEP_RESET: u32 = 29_830;
const FC_5STEP_HALF_2: u32 = 37_281;
const FC_5STEP_RESET: u32 = 37_282;

/// Volume envelope shared by the pulse and noise channels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Envelope {
    start: bool,
    looping: bool,
    constant: bool,
    volume: u8,
    divider: u8,
    decay: u8,
}

impl Envelope {
    fn write(&mut self, value: u8) {
        self.looping = (value & 0x20) != 0;
        self.constant = (value & 0x10) != 0;
        self.volume = value & 0x0F;
    }

    fn clock(&mut self) {
        if self.start {
            self.start = false;
            self.decay = 15;
            self.divider = self.volume;
            return;
        }

        if self.divider > 0 {
            self.divider -= 1;
            return;
        }

        self.divider = self.volume;
        if self.decay > 0 {
            self.decay -= 1;
        } else if self.looping {
            self.decay = 15;
        }
    }

    fn output(&self) -> u8 {
        if self.constant { self.volume } else { self.decay }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LengthCounter {
    enabled: bool,
    halt: bool,
    value: u8,
}

impl LengthCounter {
    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.value = 0;
        }
    }

    fn load(&mut self, register: u8) {
        if self.enabled {
            self.value = LENGTH_TABLE[(register >> 3) as usize];
        }
    }

    fn clock(&mut self) {
        if !self.halt && self.value > 0 {
            self.value -= 1;
        }
    }

    fn active(&self) -> bool {
        self.value > 0
    }
}

/// Pulse period sweep. Pulse 1 negates with ones' complement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Sweep {
    ones_complement: bool,
    enabled: bool,
    period: u8,
    negate: bool,
    shift: u8,
    reload: bool,
    divider: u8,
}

impl Sweep {
    fn write(&mut self, value: u8) {
        self.enabled = (value & 0x80) != 0;
        self.period = (value >> 4) & 0x07;
        self.negate = (value & 0x08) != 0;
        self.shift = value & 0x07;
        self.reload = true;
    }

    fn target(&self, timer_period: u16) -> u16 {
        if self.shift == 0 {
            return timer_period;
        }
        let change = timer_period >> self.shift;
        if self.negate {
            let change = change + u16::from(self.ones_complement);
            timer_period.saturating_sub(change)
        } else {
            timer_period.wrapping_add(change)
        }
    }

    fn mutes(&self, timer_period: u16) -> bool {
        timer_period < 8 || self.target(timer_period) > 0x07FF
    }

    fn clock(&mut self, timer_period: &mut u16) {
        if self.divider == 0 && self.enabled && self.shift > 0 && !self.mutes(*timer_period) {
            *timer_period = self.target(*timer_period);
        }

        if self.divider == 0 || self.reload {
            self.divider = self.period;
            self.reload = false;
        } else {
            self.divider -= 1;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Pulse {
    envelope: Envelope,
    length: LengthCounter,
    sweep: Sweep,
    duty: u8,
    duty_step: u8,
    timer_period: u16,
    timer: u16,
}

impl Pulse {
    fn new(ones_complement: bool) -> Self {
        Self {
            sweep: Sweep {
                ones_complement,
                ..Sweep::default()
            },
            ..Self::default()
        }
    }

    fn write(&mut self, register: u16, value: u8) {
        match register & 0x03 {
            0 => {
                self.duty = value >> 6;
                self.length.halt = (value & 0x20) != 0;
                self.envelope.write(value);
            }
            1 => self.sweep.write(value),
            2 => self.timer_period = (self.timer_period & 0x0700) | value as u16,
            _ => {
                self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
                self.length.load(value);
                self.duty_step = 0;
                self.envelope.start = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer == 0 {
            self.timer = self.timer_period;
            self.duty_step = (self.duty_step + 1) & 0x07;
        } else {
            self.timer -= 1;
        }
    }

    fn clock_half_frame(&mut self) {
        self.length.clock();
        self.sweep.clock(&mut self.timer_period);
    }

    fn output(&self) -> u8 {
        let high = (DUTY_TABLE[self.duty as usize] << self.duty_step) & 0x80 != 0;
        if !high || !self.length.active() || self.sweep.mutes(self.timer_period) {
            0
        } else {
            self.envelope.output()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Triangle {
    length: LengthCounter,
    linear_reload_value: u8,
    linear_counter: u8,
    linear_reload: bool,
    timer_period: u16,
    timer: u16,
    step: u8,
}

impl Triangle {
    fn write(&mut self, register: u16, value: u8) {
        match register & 0x03 {
            0 => {
                self.length.halt = (value & 0x80) != 0;
                self.linear_reload_value = value & 0x7F;
            }
            2 => self.timer_period = (self.timer_period & 0x0700) | value as u16,
            3 => {
                self.timer_period = (self.timer_period & 0x00FF) | (((value & 0x07) as u16) << 8);
                self.length.load(value);
                self.linear_reload = true;
            }
            _ => {}
        }
    }

    fn clock_timer(&mut self) {
        if self.timer > 0 {
            self.timer -= 1;
            return;
        }
        self.timer = self.timer_period;
        if self.length.active() && self.linear_counter > 0 {
            self.step = (self.step + 1) & 0x1F;
        }
    }

    fn clock_linear_counter(&mut self) {
        if self.linear_reload {
            self.linear_counter = self.linear_reload_value;
        } else if self.linear_counter > 0 {
            self.linear_counter -= 1;
        }
        // The control bit doubles as the length halt flag.
        if !self.length.halt {
            self.linear_reload = false;
        }
    }

    fn output(&self) -> u8 {
        // Ultrasonic periods are silenced rather than aliased.
        if !self.length.active() || self.linear_counter == 0 || self.timer_period < 2 {
            0
        } else {
            TRIANGLE_SEQUENCE[self.step as usize]
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Noise {
    envelope: Envelope,
    length: LengthCounter,
    short_mode: bool,
    timer_period: u16,
    timer: u16,
    shift_register: u16,
}

impl Default for Noise {
    fn default() -> Self {
        Self {
            envelope: Envelope::default(),
            length: LengthCounter::default(),
            short_mode: false,
            timer_period: NOISE_PERIOD_TABLE[0],
            timer: 0,
            shift_register: 1,
        }
    }
}

impl Noise {
    fn write(&mut self, register: u16, value: u8) {
        match register & 0x03 {
            0 => {
                self.length.halt = (value & 0x20) != 0;
                self.envelope.write(value);
            }
            2 => {
                self.short_mode = (value & 0x80) != 0;
                self.timer_period = NOISE_PERIOD_TABLE[(value & 0x0F) as usize];
            }
            3 => {
                self.length.load(value);
                self.envelope.start = true;
            }
            _ => {}
        }
    }

    fn clock_timer(&mut self) {
        if self.timer > 0 {
            self.timer -= 1;
            return;
        }
        // Periods are in CPU cycles.
        self.timer = self.timer_period.saturating_sub(1);
        let tap = if self.short_mode { 6 } else { 1 };
        let feedback = (self.shift_register ^ (self.shift_register >> tap)) & 0x01;
        self.shift_register = (self.shift_register >> 1) | (feedback << 14);
    }

    fn output(&self) -> u8 {
        if !self.length.active() || (self.shift_register & 0x01) != 0 {
            0
        } else {
            self.envelope.output()
        }
    }
}

/// Delta modulation channel. Sample bytes arrive through the bus via
/// [`Apu::take_dmc_dma_request`] and [`Apu::complete_dmc_dma`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Dmc {
    enabled: bool,
    irq_enabled: bool,
    irq: bool,
    looping: bool,
    timer_period: u16,
    timer: u16,
    output_level: u8,
    sample_addr: u8,
    sample_length: u8,
    current_addr: u16,
    bytes_remaining: u16,
    sample_buffer: Option<u8>,
    shift_register: u8,
    bits_remaining: u8,
    silence: bool,
}

impl Default for Dmc {
    fn default() -> Self {
        Self {
            enabled: false,
            irq_enabled: false,
            irq: false,
            looping: false,
            timer_period: DMC_RATE_TABLE[0],
            timer: DMC_RATE_TABLE[0],
            output_level: 0,
            sample_addr: 0,
            sample_length: 0,
            current_addr: 0xC000,
            bytes_remaining: 0,
            sample_buffer: None,
            shift_register: 0,
            bits_remaining: 8,
            silence: true,
        }
    }
}

impl Dmc {
    fn write(&mut self, register: u16, value: u8) {
        match register & 0x03 {
            0 => {
                self.irq_enabled = (value & 0x80) != 0;
                if !self.irq_enabled {
                    self.irq = false;
                }
                self.looping = (value & 0x40) != 0;
                self.timer_period = DMC_RATE_TABLE[(value & 0x0F) as usize];
            }
            1 => self.output_level = value & 0x7F,
            2 => self.sample_addr = value,
            _ => self.sample_length = value,
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.bytes_remaining = 0;
        } else if self.bytes_remaining == 0 {
            self.restart();
        }
    }

    fn restart(&mut self) {
        self.current_addr = 0xC000 | ((self.sample_addr as u16) << 6);
        self.bytes_remaining = ((self.sample_length as u16) << 4) | 0x0001;
    }

    fn wants_byte(&self) -> bool {
        self.enabled && self.sample_buffer.is_none() && self.bytes_remaining > 0
    }

    fn accept_byte(&mut self, value: u8) {
        self.sample_buffer = Some(value);
        self.current_addr = if self.current_addr == 0xFFFF {
            0x8000
        } else {
            self.current_addr + 1
        };
        self.bytes_remaining = self.bytes_remaining.saturating_sub(1);

        if self.bytes_remaining == 0 {
            if self.looping {
                self.restart();
            } else if self.irq_enabled {
                self.irq = true;
            }
        }
    }

    fn clock_timer(&mut self) {
        if self.timer > 1 {
            self.timer -= 1;
            return;
        }
        self.timer = self.timer_period;

        if !self.silence {
            if (self.shift_register & 0x01) != 0 {
                if self.output_level <= 125 {
                    self.output_level += 2;
                }
            } else if self.output_level >= 2 {
                self.output_level -= 2;
            }
        }
        self.shift_register >>= 1;

        self.bits_remaining = self.bits_remaining.saturating_sub(1);
        if self.bits_remaining == 0 {
            self.bits_remaining = 8;
            match self.sample_buffer.take() {
                Some(sample) => {
                    self.shift_register = sample;
                    self.silence = false;
                }
                None => self.silence = true,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apu {
    pulse1: Pulse,
    pulse2: Pulse,
    triangle: Triangle,
    noise: Noise,
    dmc: Dmc,

    frame_counter: u32,
    five_step: bool,
    irq_inhibit: bool,
    pub(crate) frame_irq: bool,
    cycle: u64,
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

impl Apu {
    pub fn new() -> Self {
        Self {
            pulse1: Pulse::new(true),
            pulse2: Pulse::new(false),
            triangle: Triangle::default(),
            noise: Noise::default(),
            dmc: Dmc::default(),
            frame_counter: 0,
            five_step: false,
            irq_inhibit: false,
            frame_irq: false,
            cycle: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn write_register(&mut self, addr: u16, value: u8) {
        match addr {
            0x4000..=0x4003 => self.pulse1.write(addr, value),
            0x4004..=0x4007 => self.pulse2.write(addr, value),
            0x4008..=0x400B => self.triangle.write(addr, value),
            0x400C..=0x400F => self.noise.write(addr, value),
            0x4010..=0x4013 => self.dmc.write(addr, value),
            0x4015 => self.write_status(value),
            0x4017 => self.write_frame_counter(value),
            _ => {}
        }
    }

    /// $4015 read. Clears the frame IRQ flag.
    pub fn read_status(&mut self) -> u8 {
        let mut status = 0u8;
        status |= u8::from(self.pulse1.length.active());
        status |= u8::from(self.pulse2.length.active()) << 1;
        status |= u8::from(self.triangle.length.active()) << 2;
        status |= u8::from(self.noise.length.active()) << 3;
        status |= u8::from(self.dmc.bytes_remaining > 0) << 4;
        status |= u8::from(self.frame_irq) << 6;
        status |= u8::from(self.dmc.irq) << 7;

        self.frame_irq = false;
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.frame_irq || self.dmc.irq
    }

    pub(crate) fn out_of_range_field(&self) -> Option<&'static str> {
        for (name, pulse) in [("apu.pulse1", &self.pulse1), ("apu.pulse2", &self.pulse2)] {
            if pulse.duty as usize >= DUTY_TABLE.len() || pulse.duty_step > 7 {
                return Some(name);
            }
        }
        if self.triangle.step as usize >= TRIANGLE_SEQUENCE.len() {
            return Some("apu.triangle");
        }
        None
    }

    /// Address of the next DMC sample byte, when the channel's buffer is empty.
    pub fn take_dmc_dma_request(&self) -> Option<u16> {
        self.dmc.wants_byte().then_some(self.dmc.current_addr)
    }

    pub fn complete_dmc_dma(&mut self, value: u8) {
        self.dmc.accept_byte(value);
    }

    /// Advances one CPU cycle and returns the mixed sample in [0.0, 1.0).
    pub fn step(&mut self) -> f32 {
        self.cycle = self.cycle.wrapping_add(1);

        if (self.cycle & 1) == 0 {
            self.pulse1.clock_timer();
            self.pulse2.clock_timer();
        }
        self.noise.clock_timer();
        self.triangle.clock_timer();
        self.dmc.clock_timer();
        self.clock_frame_counter();

        self.mix()
    }

    fn write_status(&mut self, value: u8) {
        self.dmc.irq = false;
        self.pulse1.length.set_enabled((value & 0x01) != 0);
        self.pulse2.length.set_enabled((value & 0x02) != 0);
        self.triangle.length.set_enabled((value & 0x04) != 0);
        self.noise.length.set_enabled((value & 0x08) != 0);
        self.dmc.set_enabled((value & 0x10) != 0);
    }

    fn write_frame_counter(&mut self, value: u8) {
        self.five_step = (value & 0x80) != 0;
        self.irq_inhibit = (value & 0x40) != 0;
        if self.irq_inhibit {
            self.frame_irq = false;
        }
        self.frame_counter = 0;
        if self.five_step {
            self.clock_quarter_frame();
            self.clock_half_frame();
        }
    }

    fn clock_frame_counter(&mut self) {
        self.frame_counter += 1;

        match (self.five_step, self.frame_counter) {
            (_, FC_QUARTER_1 | FC_QUARTER_3) => self.clock_quarter_frame(),
            (_, FC_HALF_1) | (true, FC_5STEP_HALF_2) => {
                self.clock_quarter_frame();
                self.clock_half_frame();
            }
            (false, FC_4STEP_HALF_2) => {
                self.clock_quarter_frame();
                self.clock_half_frame();
                self.raise_frame_irq();
            }
            (false, FC_4STEP_RESET) => {
                self.raise_frame_irq();
                self.frame_counter = 0;
            }
            (true, FC_5STEP_RESET) => self.frame_counter = 0,
            _ => {}
        }
    }

    fn raise_frame_irq(&mut self) {
        if !self.irq_inhibit {
            self.frame_irq = true;
        }
    }

    fn clock_quarter_frame(&mut self) {
        self.pulse1.envelope.clock();
        self.pulse2.envelope.clock();
        self.triangle.clock_linear_counter();
        self.noise.envelope.clock();
    }

    fn clock_half_frame(&mut self) {
        self.pulse1.clock_half_frame();
        self.pulse2.clock_half_frame();
        self.triangle.length.clock();
        self.noise.length.clock();
    }

    fn mix(&self) -> f32 {
        let pulse_sum = (self.pulse1.output() + self.pulse2.output()) as f32;
        let pulse_out = if pulse_sum > 0.0 {
            95.88 / ((8128.0 / pulse_sum) + 100.0)
        } else {
            0.0
        };

        let tnd_in = (self.triangle.output() as f32 / 8227.0)
            + (self.noise.output() as f32 / 12241.0)
            + (self.dmc.output_level as f32 / 22638.0);
        let tnd_out = if tnd_in > 0.0 {
            159.79 / ((1.0 / tnd_in) + 100.0)
        } else {
            0.0
        };

        pulse_out + tnd_out
    }
}
