use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use kinescope::audio::Resampler;
use kinescope::logging;
use kinescope::nes::frame::Screen;
use kinescope::nes::{Nes, Snapshot};
use sha1::{Digest, Sha1};

const USAGE: &str = "kinescope_headless\n\n\
Usage:\n\
  kinescope_headless [options] <rom.nes>\n\n\
Options:\n\
  --rom PATH          ROM image to run (may also be given positionally)\n\
  --frames N          Frames to run (default 60)\n\
  --hash-every N      Print the frame hash every N frames (default: last frame only)\n\
  --input HEX         Controller byte held for the whole run, e.g. --input 10 (Start)\n\
  --load-state PATH   Restore a JSON snapshot before running\n\
  --save-state PATH   Write a JSON snapshot after the last frame\n\
  --audio-rate HZ     Host sample rate used for the audio summary (default 48000)\n\
  -h, --help          Show this help";

#[derive(Debug, Clone, PartialEq)]
struct Config {
    rom: Option<PathBuf>,
    frames: u32,
    hash_every: Option<u32>,
    input: u8,
    load_state: Option<PathBuf>,
    save_state: Option<PathBuf>,
    audio_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom: None,
            frames: 60,
            hash_every: None,
            input: 0,
            load_state: None,
            save_state: None,
            audio_rate: 48_000,
        }
    }
}

/// `Ok(None)` means help was requested.
fn parse_args<I: Iterator<Item = String>>(mut args: I) -> Result<Option<Config>> {
    let mut cfg = Config::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--rom" => {
                let value = args
                    .next()
                    .context("--rom requires a path, e.g. --rom game.nes")?;
                cfg.rom = Some(PathBuf::from(value));
            }
            "--frames" => {
                let value = args
                    .next()
                    .context("--frames requires an integer, e.g. --frames 600")?;
                cfg.frames = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --frames value: {value}"))?;
            }
            "--hash-every" => {
                let value = args
                    .next()
                    .context("--hash-every requires an integer, e.g. --hash-every 60")?;
                let every = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --hash-every value: {value}"))?;
                if every == 0 {
                    anyhow::bail!("--hash-every must be at least 1");
                }
                cfg.hash_every = Some(every);
            }
            "--input" => {
                let value = args
                    .next()
                    .context("--input requires a hex byte, e.g. --input 80")?;
                let digits = value.trim_start_matches("0x").trim_start_matches('$');
                cfg.input = u8::from_str_radix(digits, 16)
                    .with_context(|| format!("invalid --input value: {value}"))?;
            }
            "--load-state" => {
                let value = args
                    .next()
                    .context("--load-state requires a path, e.g. --load-state slot.json")?;
                cfg.load_state = Some(PathBuf::from(value));
            }
            "--save-state" => {
                let value = args
                    .next()
                    .context("--save-state requires a path, e.g. --save-state slot.json")?;
                cfg.save_state = Some(PathBuf::from(value));
            }
            "--audio-rate" => {
                let value = args
                    .next()
                    .context("--audio-rate requires an integer, e.g. --audio-rate 44100")?;
                cfg.audio_rate = value
                    .parse::<u32>()
                    .with_context(|| format!("invalid --audio-rate value: {value}"))?;
            }
            "--help" | "-h" => return Ok(None),
            other if !other.starts_with('-') && cfg.rom.is_none() => {
                cfg.rom = Some(PathBuf::from(other));
            }
            other => anyhow::bail!("unknown argument: {other} (use --help)"),
        }
    }

    if cfg.rom.is_none() {
        anyhow::bail!("no ROM given (use --help)");
    }
    Ok(Some(cfg))
}

fn frame_hash(screen: &Screen) -> String {
    let digest = Sha1::digest(screen.to_rgba());
    BASE64_STANDARD.encode(digest)
}

fn run(cfg: &Config, rom: &Path) -> Result<()> {
    let start = Instant::now();
    let mut nes = Nes::from_file(rom)?;
    log::info!("loaded {} ({})", rom.display(), nes.mapper().name());

    if let Some(path) = &cfg.load_state {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot = Snapshot::from_json(&json)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))?;
        nes.restore(&snapshot)
            .with_context(|| format!("failed to restore snapshot {}", path.display()))?;
    }

    nes.set_controller_state(cfg.input);
    let mut screen = Screen::default();
    let mut resampler = Resampler::new(cfg.audio_rate);
    let mut samples = Vec::with_capacity(30_000);
    let mut host_samples = 0usize;
    let mut peak = 0.0f32;

    for frame in 1..=cfg.frames {
        samples.clear();
        nes.run_frame(&mut screen.frame(), &mut samples);
        resampler.extend(&samples);
        let output = resampler.take_output();
        host_samples += output.len();
        peak = output.iter().fold(peak, |peak, s| peak.max(s.abs()));

        let hash_now = match cfg.hash_every {
            Some(every) => frame % every == 0,
            None => frame == cfg.frames,
        };
        if hash_now {
            println!("frame={frame:05} sha1={}", frame_hash(&screen));
        }
    }

    if let Some(path) = &cfg.save_state {
        let json = nes
            .snapshot()
            .to_json()
            .context("failed to encode snapshot")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        println!("snapshot written to {}", path.display());
    }

    let counters = nes.counters();
    println!();
    println!("Run Summary");
    println!("- mapper: {}", nes.mapper().name());
    println!("- frames: {}", counters.frames);
    println!("- cpu cycles: {}", counters.cpu_cycles);
    println!("- nmi/irq serviced: {}/{}", counters.nmi_serviced, counters.irq_serviced);
    println!("- unknown opcodes: {}", counters.unknown_opcodes);
    println!("- jammed: {}", nes.cpu().jammed());
    println!(
        "- audio: {} samples at {} Hz, peak {:.3}",
        host_samples,
        resampler.output_rate(),
        peak
    );
    println!("- elapsed: {:.2}s", start.elapsed().as_secs_f32());
    Ok(())
}

fn main() -> Result<()> {
    logging::init(log::LevelFilter::Warn);
    let Some(cfg) = parse_args(std::env::args().skip(1))? else {
        println!("{USAGE}");
        return Ok(());
    };
    let rom = cfg.rom.clone().context("no ROM given")?;
    run(&cfg, &rom)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn positional_rom_with_defaults() {
        let cfg = parse_args(args(&["game.nes"])).unwrap().unwrap();
        assert_eq!(cfg.rom, Some(PathBuf::from("game.nes")));
        assert_eq!(cfg.frames, 60);
        assert_eq!(cfg.audio_rate, 48_000);
        assert_eq!(cfg.input, 0);
    }

    #[test]
    fn options_are_parsed() {
        let cfg = parse_args(args(&[
            "--rom",
            "a.nes",
            "--frames",
            "5",
            "--hash-every",
            "2",
            "--input",
            "0x90",
            "--save-state",
            "out.json",
            "--audio-rate",
            "44100",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(cfg.frames, 5);
        assert_eq!(cfg.hash_every, Some(2));
        assert_eq!(cfg.input, 0x90);
        assert_eq!(cfg.save_state, Some(PathBuf::from("out.json")));
        assert_eq!(cfg.audio_rate, 44_100);
    }

    #[test]
    fn help_short_circuits() {
        assert_eq!(parse_args(args(&["--help"])).unwrap(), None);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(parse_args(args(&["a.nes", "--frames", "many"])).is_err());
        assert!(parse_args(args(&["a.nes", "--input", "zz"])).is_err());
        assert!(parse_args(args(&["a.nes", "--hash-every", "0"])).is_err());
        assert!(parse_args(args(&["a.nes", "--bogus"])).is_err());
        assert!(parse_args(args(&["--frames", "3"])).is_err());
    }
}
