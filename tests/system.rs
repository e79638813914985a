use std::ops::ControlFlow;

use kinescope::nes::cartridge::LoadError;
use kinescope::nes::frame::{FrameBuffer, SCREEN_WIDTH, Screen};
use kinescope::nes::{Host, Nes, SnapshotError};

const PRG_LEN: usize = 0x8000;
const CHR_LEN: usize = 0x2000;

/// 32 KiB PRG with `program` at $8000 and every vector pointing at $8000.
fn ines_image(mapper_id: u8, program: &[u8]) -> Vec<u8> {
    let mut bytes = vec![b'N', b'E', b'S', 0x1A, 2, 1, (mapper_id & 0x0F) << 4, mapper_id & 0xF0];
    bytes.resize(16, 0);

    let mut prg = vec![0xEA; PRG_LEN];
    prg[..program.len()].copy_from_slice(program);
    prg[PRG_LEN - 6..].copy_from_slice(&[0x00, 0x80, 0x00, 0x80, 0x00, 0x80]);
    bytes.extend_from_slice(&prg);
    bytes.extend(std::iter::repeat_n(0x55, CHR_LEN));
    bytes
}

/// Enables rendering, then counts upward in $10 forever.
const COUNTER_PROGRAM: &[u8] = &[
    0xA9, 0x1E, // LDA #$1E
    0x8D, 0x01, 0x20, // STA $2001
    0xE6, 0x10, // INC $10
    0x4C, 0x05, 0x80, // JMP $8005
];

fn run_frames(nes: &mut Nes, screen: &mut Screen, frames: usize) {
    let mut samples = Vec::new();
    for _ in 0..frames {
        nes.run_frame(&mut screen.frame(), &mut samples);
    }
}

#[test]
fn first_instruction_executes_at_reset_vector() {
    let mut nes = Nes::from_rom_bytes(&ines_image(0, &[0xA9, 0x42, 0x85, 0x10])).unwrap();
    assert_eq!(nes.cpu().pc, 0x8000);
    assert_eq!(nes.mapper().name(), "NROM");

    let mut screen = Screen::default();
    nes.step_instruction(&mut screen.frame());
    assert_eq!(nes.cpu().a, 0x42);
    assert_eq!(nes.cpu().pc, 0x8002);

    nes.step_instruction(&mut screen.frame());
    assert_eq!(nes.peek_ram(0x0010), 0x42);
    assert_eq!(nes.peek_ram(0x0810), 0x42);
}

#[test]
fn single_bank_cartridge_starts_at_mirrored_vector() {
    // One 16 KiB PRG bank, one CHR bank, horizontal mirroring, mapper 0.
    let mut bytes = vec![b'N', b'E', b'S', 0x1A, 1, 1, 0x00, 0x00];
    bytes.resize(16, 0);
    let mut prg = vec![0xEA; PRG_LEN / 2];
    prg[0x0000..0x0002].copy_from_slice(&[0xA2, 0x07]); // LDX #$07
    prg[0x3FFC..0x3FFE].copy_from_slice(&[0x00, 0xC0]);
    bytes.extend_from_slice(&prg);
    bytes.extend(std::iter::repeat_n(0x00, CHR_LEN));

    let mut nes = Nes::from_rom_bytes(&bytes).unwrap();
    assert_eq!(nes.cpu().pc, 0xC000);
    assert_eq!(nes.cpu().x, 0x00);

    let mut screen = Screen::default();
    nes.step_frame_unit(&mut screen.frame());
    assert_eq!(nes.cpu().x, 0x07);
    assert_eq!(nes.cpu().pc, 0xC002);
}

#[test]
fn malformed_images_are_rejected() {
    let mut bad_magic = ines_image(0, &[]);
    bad_magic[0] = b'X';
    assert!(matches!(
        Nes::from_rom_bytes(&bad_magic),
        Err(LoadError::BadMagic)
    ));

    let mut truncated = ines_image(0, &[]);
    truncated.truncate(16 + PRG_LEN / 2);
    assert!(matches!(
        Nes::from_rom_bytes(&truncated),
        Err(LoadError::Truncated { .. })
    ));

    assert!(matches!(
        Nes::from_rom_bytes(&ines_image(7, &[])),
        Err(LoadError::UnsupportedMapper(7))
    ));
}

#[test]
fn restore_replays_identically() {
    let mut nes = Nes::from_rom_bytes(&ines_image(0, COUNTER_PROGRAM)).unwrap();
    let mut screen = Screen::default();
    run_frames(&mut nes, &mut screen, 2);

    let snapshot = nes.snapshot();
    run_frames(&mut nes, &mut screen, 3);
    let counter = nes.peek_ram(0x0010);
    let pc = nes.cpu().pc;
    let cycles = nes.cpu().total_cycles();
    let pixels = screen.pixels().to_vec();

    nes.restore(&snapshot).unwrap();
    assert_eq!(nes.snapshot(), snapshot);
    run_frames(&mut nes, &mut screen, 3);
    assert_eq!(nes.peek_ram(0x0010), counter);
    assert_eq!(nes.cpu().pc, pc);
    assert_eq!(nes.cpu().total_cycles(), cycles);
    assert_eq!(screen.pixels(), pixels.as_slice());
}

#[test]
fn json_snapshot_moves_between_systems() {
    let image = ines_image(0, COUNTER_PROGRAM);
    let mut source = Nes::from_rom_bytes(&image).unwrap();
    let mut screen = Screen::default();
    run_frames(&mut source, &mut screen, 4);

    let json = source.snapshot().to_json().unwrap();
    let snapshot = kinescope::nes::Snapshot::from_json(&json).unwrap();

    let mut target = Nes::from_rom_bytes(&image).unwrap();
    target.restore(&snapshot).unwrap();
    assert_eq!(target.cpu().pc, source.cpu().pc);
    assert_eq!(target.peek_ram(0x0010), source.peek_ram(0x0010));

    let mut other_screen = Screen::default();
    run_frames(&mut source, &mut screen, 2);
    run_frames(&mut target, &mut other_screen, 2);
    assert_eq!(target.peek_ram(0x0010), source.peek_ram(0x0010));
    assert_eq!(target.cpu().total_cycles(), source.cpu().total_cycles());
}

#[test]
fn snapshot_from_other_mapper_is_refused() {
    let nrom = Nes::from_rom_bytes(&ines_image(0, COUNTER_PROGRAM)).unwrap();
    let mut uxrom = Nes::from_rom_bytes(&ines_image(2, COUNTER_PROGRAM)).unwrap();
    let before = uxrom.snapshot();

    let err = uxrom.restore(&nrom.snapshot()).unwrap_err();
    assert!(matches!(err, SnapshotError::MapperMismatch { .. }));
    assert_eq!(uxrom.snapshot(), before);
}

struct CountingHost {
    frames: u32,
    samples: usize,
    stop_after: u32,
}

impl Host for CountingHost {
    fn audio_sample(&mut self, sample: f32) {
        assert!((0.0..1.0).contains(&sample));
        self.samples += 1;
    }

    fn frame_boundary(&mut self, nes: &mut Nes, _frame: &FrameBuffer<'_>) -> ControlFlow<()> {
        self.frames += 1;
        nes.set_controller_state(0x10);
        if self.frames == self.stop_after {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

#[test]
fn host_loop_sees_each_frame_boundary() {
    let mut nes = Nes::from_rom_bytes(&ines_image(0, COUNTER_PROGRAM)).unwrap();
    let mut pixels = vec![0u32; (SCREEN_WIDTH + 16) * 240];
    let mut frame = FrameBuffer::new(&mut pixels, SCREEN_WIDTH + 16).unwrap();
    let mut host = CountingHost {
        frames: 0,
        samples: 0,
        stop_after: 3,
    };

    nes.run(&mut host, &mut frame);
    assert_eq!(host.frames, 3);
    assert_eq!(nes.counters().frames, 3);
    assert_eq!(nes.controller_state(), 0x10);
    assert!(host.samples > 2 * 29_000 && host.samples < 3 * 30_000);
}
