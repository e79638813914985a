use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use kinescope::logging;
use kinescope::nes::cpu::{
    FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW, FLAG_ZERO,
};
use kinescope::nes::frame::Screen;
use kinescope::nes::{Nes, Snapshot};

const MAX_UNTIL_INSTRUCTIONS: u32 = 5_000_000;

fn print_help() {
    println!("Commands:");
    println!("  step, s [n]    - Step n instructions (default 1)");
    println!("  frame, f [n]   - Run n frames (default 1)");
    println!("  until, u <addr> - Step until PC reaches addr");
    println!("  regs           - Show CPU registers");
    println!("  mem <addr>     - Show 16 bytes of internal RAM");
    println!("  ppu            - Show PPU state");
    println!("  apu            - Show APU interrupt state");
    println!("  mapper         - Show mapper state");
    println!("  events [n]     - Show recent debug events");
    println!("  counters       - Show debug counters");
    println!("  save / load    - Snapshot into or restore from the debugger slot");
    println!("  reset          - Reset the console");
    println!("  quit, q        - Exit debugger");
}

fn parse_hex(text: &str) -> Option<u16> {
    let digits = text
        .trim_start_matches('$')
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(digits, 16).ok()
}

fn parse_count(parts: &[&str]) -> u32 {
    parts
        .get(1)
        .and_then(|text| text.parse::<u32>().ok())
        .unwrap_or(1)
        .max(1)
}

fn print_regs(nes: &Nes) {
    let cpu = nes.cpu();
    println!("A: ${:02X}  X: ${:02X}  Y: ${:02X}", cpu.a, cpu.x, cpu.y);
    println!("P: {:08b} (NV-BDIZC)", cpu.p);
    println!("SP: ${:02X}  PC: ${:04X}", cpu.sp, cpu.pc);
    println!(
        "Flags: N={} V={} D={} I={} Z={} C={}",
        cpu.flag(FLAG_NEGATIVE),
        cpu.flag(FLAG_OVERFLOW),
        cpu.flag(FLAG_DECIMAL),
        cpu.flag(FLAG_INTERRUPT),
        cpu.flag(FLAG_ZERO),
        cpu.flag(FLAG_CARRY)
    );
    println!("Cycles: {}  Jammed: {}", cpu.total_cycles(), cpu.jammed());
}

fn print_memory(nes: &Nes, addr: u16) {
    println!("Memory ${:04X}-${:04X}:", addr, addr.wrapping_add(15));
    for row in 0..2u16 {
        let base = addr.wrapping_add(row * 8);
        let bytes: Vec<String> = (0..8u16)
            .map(|i| format!("{:02X}", nes.peek_ram(base.wrapping_add(i))))
            .collect();
        println!("{base:04X}: {}", bytes.join(" "));
    }
}

fn main() -> Result<()> {
    logging::init(log::LevelFilter::Warn);
    println!("Kinescope NES Debugger");
    println!("======================");
    println!();

    let Some(rom_path) = std::env::args_os().nth(1).map(PathBuf::from) else {
        println!("Usage: kinescope_debug <rom.nes>");
        println!();
        print_help();
        return Ok(());
    };

    println!("Loading ROM: {}", rom_path.display());
    let mut nes = Nes::from_file(&rom_path)?;
    println!("Mapper: {}", nes.mapper().name());
    println!();
    println!("Initial state:");
    print_regs(&nes);
    println!();
    println!("Type 'help' for commands");

    let mut screen = Screen::default();
    let mut samples = Vec::new();
    let mut slot: Option<Snapshot> = None;

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = lines.next() else {
            break;
        };
        let line = line.context("failed to read command")?;
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            continue;
        };

        match command {
            "help" | "h" => print_help(),
            "step" | "s" => {
                for _ in 0..parse_count(&parts) {
                    nes.step_instruction(&mut screen.frame());
                }
                print_regs(&nes);
            }
            "frame" | "f" => {
                for _ in 0..parse_count(&parts) {
                    samples.clear();
                    nes.run_frame(&mut screen.frame(), &mut samples);
                }
                println!(
                    "Frame {} done, PC=${:04X}",
                    nes.counters().frames,
                    nes.cpu().pc
                );
            }
            "until" | "u" => match parts.get(1).and_then(|text| parse_hex(text)) {
                Some(target) => {
                    let mut executed = 0u32;
                    while nes.cpu().pc != target
                        && !nes.cpu().jammed()
                        && executed < MAX_UNTIL_INSTRUCTIONS
                    {
                        nes.step_instruction(&mut screen.frame());
                        executed += 1;
                    }
                    if nes.cpu().pc == target {
                        println!("Reached ${target:04X} after {executed} instruction(s)");
                    } else {
                        println!("Stopped at ${:04X} after {executed} instruction(s)", nes.cpu().pc);
                    }
                }
                None => println!("Usage: until <addr>"),
            },
            "regs" => print_regs(&nes),
            "mem" => match parts.get(1).and_then(|text| parse_hex(text)) {
                Some(addr) => print_memory(&nes, addr),
                None => println!("Usage: mem <addr>"),
            },
            "ppu" => {
                let ppu = nes.ppu();
                println!("PPU State:");
                println!("  Scanline: {}, Dot: {}", ppu.scanline(), ppu.dot());
                println!("  Frame: {}", ppu.frame_count());
                println!("  $2000 (ctrl):   {:08b}", ppu.ctrl());
                println!("  $2001 (mask):   {:08b}", ppu.mask());
                println!("  $2002 (status): {:08b}", ppu.status());
                let palette: Vec<String> = (0..32)
                    .map(|i| format!("{:02X}", ppu.peek_palette(i)))
                    .collect();
                println!("  Palette: {}", palette.join(" "));
                let row: Vec<String> = (0..32)
                    .map(|i| format!("{:02X}", ppu.peek_vram(i)))
                    .collect();
                println!("  Nametable row 0: {}", row.join(" "));
            }
            "apu" => {
                println!("APU IRQ pending: {}", nes.apu().irq_pending());
            }
            "mapper" => {
                println!("Mapper: {}", nes.mapper().debug_state());
            }
            "events" => {
                let limit = parts
                    .get(1)
                    .and_then(|text| text.parse::<usize>().ok())
                    .unwrap_or(16);
                for event in nes.debug_recent_events(limit) {
                    println!("  {event}");
                }
            }
            "counters" => {
                println!("{:#?}", nes.counters());
            }
            "save" => {
                match slot.as_mut() {
                    Some(snapshot) => nes.save_into(snapshot),
                    None => slot = Some(nes.snapshot()),
                }
                println!("Saved at PC=${:04X}", nes.cpu().pc);
            }
            "load" => match slot.as_ref() {
                Some(snapshot) => match nes.restore(snapshot) {
                    Ok(()) => println!("Restored, PC=${:04X}", nes.cpu().pc),
                    Err(err) => println!("Restore failed: {err}"),
                },
                None => println!("No snapshot saved"),
            },
            "reset" => {
                nes.reset();
                print_regs(&nes);
            }
            "quit" | "q" => {
                println!("Goodbye!");
                break;
            }
            _ => {
                println!("Unknown command: {command}. Type 'help' for available commands.");
            }
        }
    }

    Ok(())
}
