use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::nes::apu::CPU_CLOCK_HZ;

const MIN_OUTPUT_RATE: u32 = 8_000;

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

#[derive(Debug, Clone, Default)]
struct HighPass {
    alpha: f32,
    prev_in: f32,
    prev_out: f32,
}

impl HighPass {
    fn new(cutoff_hz: f32, dt: f32) -> Self {
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: rc / (rc + dt),
            ..Self::default()
        }
    }

    fn process(&mut self, sample: f32) -> f32 {
        let out = self.alpha * (self.prev_out + sample - self.prev_in);
        self.prev_in = sample;
        self.prev_out = out;
        out
    }
}

#[derive(Debug, Clone, Default)]
struct LowPass {
    alpha: f32,
    prev_out: f32,
}

impl LowPass {
    fn new(cutoff_hz: f32, dt: f32) -> Self {
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        Self {
            alpha: dt / (rc + dt),
            prev_out: 0.0,
        }
    }

    fn process(&mut self, sample: f32) -> f32 {
        self.prev_out += self.alpha * (sample - self.prev_out);
        self.prev_out
    }
}

/// Turns the one-sample-per-CPU-cycle APU stream into host-rate audio.
///
/// Input samples are box-filtered down to the output rate, then run through
/// the console's output stage: two high-pass filters (90 Hz, 440 Hz) that
/// strip the DC offset and a 14 kHz low-pass.
#[derive(Debug, Clone)]
pub struct Resampler {
    output_rate: u32,
    phase: f64,
    sum: f32,
    count: u32,
    hp90: HighPass,
    hp440: HighPass,
    lp14k: LowPass,
    output: Vec<f32>,
}

impl Resampler {
    pub fn new(output_rate: u32) -> Self {
        let output_rate = output_rate.max(MIN_OUTPUT_RATE);
        let dt = 1.0 / output_rate as f32;
        Self {
            output_rate,
            phase: 0.0,
            sum: 0.0,
            count: 0,
            hp90: HighPass::new(90.0, dt),
            hp440: HighPass::new(440.0, dt),
            lp14k: LowPass::new(14_000.0, dt),
            output: Vec::with_capacity(2048),
        }
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    pub fn push(&mut self, sample: f32) {
        self.sum += sample;
        self.count += 1;
        self.phase += self.output_rate as f64;
        if self.phase < CPU_CLOCK_HZ {
            return;
        }

        self.phase -= CPU_CLOCK_HZ;
        let averaged = self.sum / self.count as f32;
        self.sum = 0.0;
        self.count = 0;

        let filtered = self
            .lp14k
            .process(self.hp440.process(self.hp90.process(averaged)));
        self.output.push(filtered.clamp(-1.0, 1.0));
    }

    pub fn extend(&mut self, samples: &[f32]) {
        for &sample in samples {
            self.push(sample);
        }
    }

    pub fn take_output(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.output)
    }
}

/// Default output device fed from a bounded queue of mono samples.
pub struct AudioOutput {
    queue: SampleQueue,
    _stream: cpal::Stream,
    sample_rate: u32,
    max_queue_samples: usize,
}

impl AudioOutput {
    pub fn new(max_latency_ms: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no default audio output device"))?;
        let supported = device
            .default_output_config()
            .context("failed to query default audio config")?;

        let stream_config: cpal::StreamConfig = supported.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        let max_queue_samples = (sample_rate as usize * max_latency_ms) / 1000;
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::with_capacity(max_queue_samples)));

        let err_fn = |err| log::error!("audio stream error: {err}");

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _| fill_output(data, channels, &queue, |s| s),
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::I16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [i16], _| {
                        fill_output(data, channels, &queue, |s| (s * i16::MAX as f32) as i16)
                    },
                    err_fn,
                    None,
                )?
            }
            cpal::SampleFormat::U16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &stream_config,
                    move |data: &mut [u16], _| {
                        fill_output(data, channels, &queue, |s| {
                            ((s * 0.5 + 0.5) * u16::MAX as f32) as u16
                        })
                    },
                    err_fn,
                    None,
                )?
            }
            other => return Err(anyhow!("unsupported audio sample format: {other:?}")),
        };

        stream
            .play()
            .context("failed to start audio output stream")?;
        log::info!("audio output at {sample_rate} Hz, {channels} channel(s)");

        Ok(Self {
            queue,
            _stream: stream,
            sample_rate,
            max_queue_samples,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Queues samples, dropping the oldest ones past the latency bound.
    pub fn push_samples(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let Ok(mut queue) = self.queue.lock() else {
            return;
        };

        let overflow = (queue.len() + samples.len()).saturating_sub(self.max_queue_samples);
        let dropped = overflow.min(queue.len());
        queue.drain(..dropped);
        queue.extend(samples.iter().map(|s| s.clamp(-1.0, 1.0)));
    }

    pub fn queued_samples(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }
}

fn fill_output<T: Copy>(
    data: &mut [T],
    channels: usize,
    queue: &SampleQueue,
    convert: impl Fn(f32) -> T,
) {
    let Ok(mut queue) = queue.lock() else {
        return;
    };
    for frame in data.chunks_mut(channels) {
        let sample = convert(queue.pop_front().unwrap_or(0.0).clamp(-1.0, 1.0));
        frame.fill(sample);
    }
}
