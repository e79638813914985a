use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::Nes;

pub const FLAG_CARRY: u8 = 0x01;
pub const FLAG_ZERO: u8 = 0x02;
pub const FLAG_INTERRUPT: u8 = 0x04;
pub const FLAG_DECIMAL: u8 = 0x08;
pub const FLAG_BREAK: u8 = 0x10;
pub const FLAG_UNUSED: u8 = 0x20;
pub const FLAG_OVERFLOW: u8 = 0x40;
pub const FLAG_NEGATIVE: u8 = 0x80;

pub const NMI_VECTOR: u16 = 0xFFFA;
pub const RESET_VECTOR: u16 = 0xFFFC;
pub const IRQ_VECTOR: u16 = 0xFFFE;

const INTERRUPT_CYCLES: u8 = 7;

/// 2A03 register file and per-cycle bookkeeping.
///
/// An instruction's bus traffic happens on the first cycle of the
/// instruction; the remaining cycles are counted off by `cycles_remaining`
/// so interrupts and DMA still line up with the PPU and APU clocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub p: u8,
    pub sp: u8,
    pub pc: u16,

    pub(crate) cycles_remaining: u8,
    pub(crate) nmi_pending: bool,
    pub(crate) stall_cycles: u16,
    pub(crate) total_cycles: u64,
    pub(crate) jammed: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            sp: 0xFD,
            pc: 0,
            cycles_remaining: 0,
            nmi_pending: false,
            stall_cycles: 0,
            total_cycles: 0,
            jammed: false,
        }
    }
}

impl Cpu {
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    pub fn jammed(&self) -> bool {
        self.jammed
    }

    pub fn at_instruction_boundary(&self) -> bool {
        self.cycles_remaining == 0 && self.stall_cycles == 0
    }

    pub fn flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    fn bit(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, (self.a & value) == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
        self.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.set_flag(FLAG_CARRY, register >= value);
        self.update_zn(register.wrapping_sub(value));
    }

    fn adc(&mut self, value: u8) {
        let carry_in = u16::from(self.flag(FLAG_CARRY));
        let result = self.a as u16 + value as u16 + carry_in;
        let out = result as u8;

        self.set_flag(FLAG_CARRY, result > 0xFF);
        self.set_flag(FLAG_OVERFLOW, ((self.a ^ out) & (value ^ out) & 0x80) != 0);

        self.a = out;
        self.update_zn(out);
    }

    fn sbc(&mut self, value: u8) {
        self.adc(value ^ 0xFF);
    }

    fn asl(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = value << 1;
        self.update_zn(result);
        result
    }

    fn lsr(&mut self, value: u8) -> u8 {
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = value >> 1;
        self.update_zn(result);
        result
    }

    fn rol(&mut self, value: u8) -> u8 {
        let carry_in = u8::from(self.flag(FLAG_CARRY));
        self.set_flag(FLAG_CARRY, (value & 0x80) != 0);
        let result = (value << 1) | carry_in;
        self.update_zn(result);
        result
    }

    fn ror(&mut self, value: u8) -> u8 {
        let carry_in = if self.flag(FLAG_CARRY) { 0x80 } else { 0 };
        self.set_flag(FLAG_CARRY, (value & 0x01) != 0);
        let result = (value >> 1) | carry_in;
        self.update_zn(result);
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Implied,
    Accumulator,
    Immediate,
    ZeroPage,
    ZeroPageX,
    ZeroPageY,
    Absolute,
    AbsoluteX,
    AbsoluteY,
    Indirect,
    IndirectX,
    IndirectY,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Adc,
    And,
    Asl,
    Bit,
    Branch,
    Brk,
    Clc,
    Cld,
    Cli,
    Clv,
    Cmp,
    Cpx,
    Cpy,
    Dec,
    Dex,
    Dey,
    Eor,
    Inc,
    Inx,
    Iny,
    Jmp,
    Jsr,
    Lda,
    Ldx,
    Ldy,
    Lsr,
    Nop,
    Ora,
    Pha,
    Php,
    Pla,
    Plp,
    Rol,
    Ror,
    Rti,
    Rts,
    Sbc,
    Sec,
    Sed,
    Sei,
    Sta,
    Stx,
    Sty,
    Tax,
    Tay,
    Tsx,
    Txa,
    Txs,
    Tya,
    // Stable unofficial opcodes.
    Alr,
    Anc,
    Arr,
    Axs,
    Dcp,
    Isb,
    Lax,
    Rla,
    Rra,
    Sax,
    Slo,
    Sre,
    Jam,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
    Modify,
}

const GROUP1: [Op; 8] = [
    Op::Ora,
    Op::And,
    Op::Eor,
    Op::Adc,
    Op::Sta,
    Op::Lda,
    Op::Cmp,
    Op::Sbc,
];
const GROUP2: [Op; 8] = [
    Op::Asl,
    Op::Rol,
    Op::Lsr,
    Op::Ror,
    Op::Stx,
    Op::Ldx,
    Op::Dec,
    Op::Inc,
];
const GROUP3: [Op; 8] = [
    Op::Slo,
    Op::Rla,
    Op::Sre,
    Op::Rra,
    Op::Sax,
    Op::Lax,
    Op::Dcp,
    Op::Isb,
];
const GROUP3_IMMEDIATE: [Op; 8] = [
    Op::Anc,
    Op::Anc,
    Op::Alr,
    Op::Arr,
    Op::Unknown,
    Op::Unknown,
    Op::Axs,
    Op::Sbc,
];

fn operation(opcode: u8) -> Op {
    let aaa = (opcode >> 5) as usize;
    let bbb = (opcode >> 2) & 0x07;
    match opcode & 0x03 {
        0x01 if opcode == 0x89 => Op::Nop,
        0x01 => GROUP1[aaa],
        0x02 => match (bbb, aaa) {
            (0, 5) => Op::Ldx,
            (0, 4 | 6 | 7) => Op::Nop,
            (0 | 4, _) => Op::Jam,
            (2, 4) => Op::Txa,
            (2, 5) => Op::Tax,
            (2, 6) => Op::Dex,
            (2, 7) => Op::Nop,
            (6, 4) => Op::Txs,
            (6, 5) => Op::Tsx,
            (6, _) => Op::Nop,
            (7, 4) => Op::Unknown,
            _ => GROUP2[aaa],
        },
        0x03 => match opcode {
            0x93 | 0x9B | 0x9F | 0xBB => Op::Unknown,
            _ if bbb == 2 => GROUP3_IMMEDIATE[aaa],
            _ => GROUP3[aaa],
        },
        _ => match opcode {
            0x00 => Op::Brk,
            0x20 => Op::Jsr,
            0x40 => Op::Rti,
            0x60 => Op::Rts,
            0x08 => Op::Php,
            0x28 => Op::Plp,
            0x48 => Op::Pha,
            0x68 => Op::Pla,
            0x88 => Op::Dey,
            0xA8 => Op::Tay,
            0xC8 => Op::Iny,
            0xE8 => Op::Inx,
            0x18 => Op::Clc,
            0x38 => Op::Sec,
            0x58 => Op::Cli,
            0x78 => Op::Sei,
            0x98 => Op::Tya,
            0xB8 => Op::Clv,
            0xD8 => Op::Cld,
            0xF8 => Op::Sed,
            0x24 | 0x2C => Op::Bit,
            0x4C | 0x6C => Op::Jmp,
            0x84 | 0x8C | 0x94 => Op::Sty,
            0xA0 | 0xA4 | 0xAC | 0xB4 | 0xBC => Op::Ldy,
            0xC0 | 0xC4 | 0xCC => Op::Cpy,
            0xE0 | 0xE4 | 0xEC => Op::Cpx,
            0x9C => Op::Unknown,
            _ if bbb == 4 => Op::Branch,
            _ => Op::Nop,
        },
    }
}

fn addressing_mode(opcode: u8) -> Mode {
    let aaa = opcode >> 5;
    let bbb = (opcode >> 2) & 0x07;
    let cc = opcode & 0x03;
    // STX/LDX and SAX/LAX index with Y where the rest of the row uses X.
    let indexes_y = matches!(aaa, 4 | 5) && cc >= 2;

    if (cc & 0x01) != 0 {
        return match bbb {
            0 => Mode::IndirectX,
            1 => Mode::ZeroPage,
            2 => Mode::Immediate,
            3 => Mode::Absolute,
            4 => Mode::IndirectY,
            5 if indexes_y => Mode::ZeroPageY,
            5 => Mode::ZeroPageX,
            6 => Mode::AbsoluteY,
            _ if indexes_y => Mode::AbsoluteY,
            _ => Mode::AbsoluteX,
        };
    }

    match bbb {
        0 if opcode == 0x20 => Mode::Absolute,
        0 if cc == 0 && aaa < 4 => Mode::Implied,
        0 if cc == 2 && aaa < 4 => Mode::Implied,
        0 => Mode::Immediate,
        1 => Mode::ZeroPage,
        2 if cc == 2 && aaa < 4 => Mode::Accumulator,
        2 => Mode::Implied,
        3 if opcode == 0x6C => Mode::Indirect,
        3 => Mode::Absolute,
        4 if cc == 0 => Mode::Relative,
        4 => Mode::Implied,
        5 if indexes_y => Mode::ZeroPageY,
        5 => Mode::ZeroPageX,
        6 => Mode::Implied,
        _ if indexes_y => Mode::AbsoluteY,
        _ => Mode::AbsoluteX,
    }
}

fn access(op: Op) -> Access {
    match op {
        Op::Sta | Op::Stx | Op::Sty | Op::Sax => Access::Write,
        Op::Asl
        | Op::Lsr
        | Op::Rol
        | Op::Ror
        | Op::Dec
        | Op::Inc
        | Op::Slo
        | Op::Rla
        | Op::Sre
        | Op::Rra
        | Op::Dcp
        | Op::Isb => Access::Modify,
        _ => Access::Read,
    }
}

/// Cycle count before branch and page-crossing penalties.
fn base_cycles(op: Op, mode: Mode) -> u8 {
    match op {
        Op::Brk => return 7,
        Op::Jsr | Op::Rti | Op::Rts => return 6,
        Op::Jmp if mode == Mode::Indirect => return 5,
        Op::Jmp => return 3,
        Op::Php | Op::Pha => return 3,
        Op::Plp | Op::Pla => return 4,
        _ => {}
    }

    match (access(op), mode) {
        (_, Mode::Implied | Mode::Accumulator | Mode::Immediate | Mode::Relative) => 2,
        (Access::Modify, Mode::ZeroPage) => 5,
        (Access::Modify, Mode::ZeroPageX | Mode::ZeroPageY | Mode::Absolute) => 6,
        (Access::Modify, Mode::AbsoluteX | Mode::AbsoluteY) => 7,
        (Access::Modify, _) => 8,
        (_, Mode::ZeroPage) => 3,
        (_, Mode::ZeroPageX | Mode::ZeroPageY | Mode::Absolute) => 4,
        (Access::Write, Mode::AbsoluteX | Mode::AbsoluteY) => 5,
        (Access::Write, _) => 6,
        (Access::Read, Mode::AbsoluteX | Mode::AbsoluteY | Mode::Indirect) => 4,
        (Access::Read, Mode::IndirectX) => 6,
        (Access::Read, Mode::IndirectY) => 5,
    }
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    None,
    Accumulator,
    Memory { addr: u16, page_crossed: bool },
}

impl Nes {
    /// Advances the CPU by exactly one clock cycle.
    pub(crate) fn step_cpu(&mut self) {
        self.cpu.total_cycles = self.cpu.total_cycles.wrapping_add(1);

        if self.cpu.stall_cycles > 0 {
            self.cpu.stall_cycles -= 1;
            return;
        }
        if self.cpu.cycles_remaining > 0 {
            self.cpu.cycles_remaining -= 1;
            return;
        }
        if self.cpu.jammed {
            return;
        }

        let cycles = if self.cpu.nmi_pending {
            self.cpu.nmi_pending = false;
            self.service_interrupt(NMI_VECTOR);
            self.counters.nmi_serviced = self.counters.nmi_serviced.wrapping_add(1);
            debug!("NMI serviced -> PC=${:04X}", self.cpu.pc);
            self.push_debug_event(format!("NMI serviced -> PC=${:04X}", self.cpu.pc));
            INTERRUPT_CYCLES
        } else if self.irq_line() && !self.cpu.flag(FLAG_INTERRUPT) {
            self.service_interrupt(IRQ_VECTOR);
            self.counters.irq_serviced = self.counters.irq_serviced.wrapping_add(1);
            debug!("IRQ serviced -> PC=${:04X}", self.cpu.pc);
            self.push_debug_event(format!("IRQ serviced -> PC=${:04X}", self.cpu.pc));
            INTERRUPT_CYCLES
        } else {
            self.execute_instruction()
        };

        self.cpu.cycles_remaining = cycles - 1;
    }

    pub(crate) fn reset_cpu(&mut self) {
        let total_cycles = self.cpu.total_cycles;
        self.cpu = Cpu {
            total_cycles,
            ..Cpu::default()
        };
        self.cpu.pc = self.read_u16(RESET_VECTOR);
    }

    fn execute_instruction(&mut self) -> u8 {
        let opcode_pc = self.cpu.pc;
        let opcode = self.fetch_byte();
        let op = operation(opcode);
        let mode = addressing_mode(opcode);
        let operand = self.resolve_operand(mode);

        let mut cycles = base_cycles(op, mode);
        let page_crossed = matches!(operand, Operand::Memory { page_crossed: true, .. });
        if page_crossed && access(op) == Access::Read {
            cycles += 1;
        }

        cycles + self.execute(opcode, opcode_pc, op, operand)
    }

    fn resolve_operand(&mut self, mode: Mode) -> Operand {
        let (addr, page_crossed) = match mode {
            Mode::Implied => return Operand::None,
            Mode::Accumulator => return Operand::Accumulator,
            Mode::Immediate | Mode::Relative => {
                let addr = self.cpu.pc;
                self.cpu.pc = self.cpu.pc.wrapping_add(1);
                (addr, false)
            }
            Mode::ZeroPage => (self.fetch_byte() as u16, false),
            Mode::ZeroPageX => (self.fetch_byte().wrapping_add(self.cpu.x) as u16, false),
            Mode::ZeroPageY => (self.fetch_byte().wrapping_add(self.cpu.y) as u16, false),
            Mode::Absolute => (self.fetch_word(), false),
            Mode::AbsoluteX => {
                let base = self.fetch_word();
                indexed(base, self.cpu.x)
            }
            Mode::AbsoluteY => {
                let base = self.fetch_word();
                indexed(base, self.cpu.y)
            }
            Mode::Indirect => {
                let ptr = self.fetch_word();
                (self.read_u16_page_wrapped(ptr), false)
            }
            Mode::IndirectX => {
                let zp = self.fetch_byte().wrapping_add(self.cpu.x);
                (self.read_zp_u16(zp), false)
            }
            Mode::IndirectY => {
                let zp = self.fetch_byte();
                let base = self.read_zp_u16(zp);
                indexed(base, self.cpu.y)
            }
        };
        Operand::Memory { addr, page_crossed }
    }

    fn load(&mut self, operand: Operand) -> u8 {
        match operand {
            Operand::None => 0,
            Operand::Accumulator => self.cpu.a,
            Operand::Memory { addr, .. } => self.cpu_read(addr),
        }
    }

    fn store(&mut self, operand: Operand, value: u8) {
        match operand {
            Operand::None => {}
            Operand::Accumulator => self.cpu.a = value,
            Operand::Memory { addr, .. } => self.cpu_write(addr, value),
        }
    }

    fn modify(&mut self, operand: Operand, op: impl FnOnce(&mut Cpu, u8) -> u8) -> u8 {
        let value = self.load(operand);
        let out = op(&mut self.cpu, value);
        self.store(operand, out);
        out
    }

    /// Runs `op` and returns any cycles spent beyond its base count.
    fn execute(&mut self, opcode: u8, opcode_pc: u16, op: Op, operand: Operand) -> u8 {
        match op {
            Op::Adc => {
                let value = self.load(operand);
                self.cpu.adc(value);
            }
            Op::Sbc => {
                let value = self.load(operand);
                self.cpu.sbc(value);
            }
            Op::And => {
                let value = self.load(operand);
                self.cpu.a &= value;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Ora => {
                let value = self.load(operand);
                self.cpu.a |= value;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Eor => {
                let value = self.load(operand);
                self.cpu.a ^= value;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Bit => {
                let value = self.load(operand);
                self.cpu.bit(value);
            }
            Op::Cmp => {
                let value = self.load(operand);
                self.cpu.compare(self.cpu.a, value);
            }
            Op::Cpx => {
                let value = self.load(operand);
                self.cpu.compare(self.cpu.x, value);
            }
            Op::Cpy => {
                let value = self.load(operand);
                self.cpu.compare(self.cpu.y, value);
            }
            Op::Lda => {
                self.cpu.a = self.load(operand);
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Ldx => {
                self.cpu.x = self.load(operand);
                self.cpu.update_zn(self.cpu.x);
            }
            Op::Ldy => {
                self.cpu.y = self.load(operand);
                self.cpu.update_zn(self.cpu.y);
            }
            Op::Sta => self.store(operand, self.cpu.a),
            Op::Stx => self.store(operand, self.cpu.x),
            Op::Sty => self.store(operand, self.cpu.y),

            Op::Asl => {
                self.modify(operand, Cpu::asl);
            }
            Op::Lsr => {
                self.modify(operand, Cpu::lsr);
            }
            Op::Rol => {
                self.modify(operand, Cpu::rol);
            }
            Op::Ror => {
                self.modify(operand, Cpu::ror);
            }
            Op::Inc => {
                self.modify(operand, |cpu, value| {
                    let out = value.wrapping_add(1);
                    cpu.update_zn(out);
                    out
                });
            }
            Op::Dec => {
                self.modify(operand, |cpu, value| {
                    let out = value.wrapping_sub(1);
                    cpu.update_zn(out);
                    out
                });
            }

            Op::Inx => {
                self.cpu.x = self.cpu.x.wrapping_add(1);
                self.cpu.update_zn(self.cpu.x);
            }
            Op::Iny => {
                self.cpu.y = self.cpu.y.wrapping_add(1);
                self.cpu.update_zn(self.cpu.y);
            }
            Op::Dex => {
                self.cpu.x = self.cpu.x.wrapping_sub(1);
                self.cpu.update_zn(self.cpu.x);
            }
            Op::Dey => {
                self.cpu.y = self.cpu.y.wrapping_sub(1);
                self.cpu.update_zn(self.cpu.y);
            }
            Op::Tax => {
                self.cpu.x = self.cpu.a;
                self.cpu.update_zn(self.cpu.x);
            }
            Op::Tay => {
                self.cpu.y = self.cpu.a;
                self.cpu.update_zn(self.cpu.y);
            }
            Op::Txa => {
                self.cpu.a = self.cpu.x;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Tya => {
                self.cpu.a = self.cpu.y;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Tsx => {
                self.cpu.x = self.cpu.sp;
                self.cpu.update_zn(self.cpu.x);
            }
            Op::Txs => self.cpu.sp = self.cpu.x,

            Op::Clc => self.cpu.set_flag(FLAG_CARRY, false),
            Op::Sec => self.cpu.set_flag(FLAG_CARRY, true),
            Op::Cli => self.cpu.set_flag(FLAG_INTERRUPT, false),
            Op::Sei => self.cpu.set_flag(FLAG_INTERRUPT, true),
            Op::Cld => self.cpu.set_flag(FLAG_DECIMAL, false),
            Op::Sed => self.cpu.set_flag(FLAG_DECIMAL, true),
            Op::Clv => self.cpu.set_flag(FLAG_OVERFLOW, false),

            Op::Pha => self.push(self.cpu.a),
            Op::Php => self.push(self.cpu.p | FLAG_BREAK | FLAG_UNUSED),
            Op::Pla => {
                self.cpu.a = self.pop();
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Plp => {
                self.cpu.p = (self.pop() & !FLAG_BREAK) | FLAG_UNUSED;
            }

            Op::Jmp => {
                if let Operand::Memory { addr, .. } = operand {
                    self.cpu.pc = addr;
                }
            }
            Op::Jsr => {
                if let Operand::Memory { addr, .. } = operand {
                    self.push_u16(self.cpu.pc.wrapping_sub(1));
                    self.cpu.pc = addr;
                }
            }
            Op::Rts => {
                self.cpu.pc = self.pop_u16().wrapping_add(1);
            }
            Op::Rti => {
                self.cpu.p = (self.pop() & !FLAG_BREAK) | FLAG_UNUSED;
                self.cpu.pc = self.pop_u16();
            }
            Op::Brk => {
                self.cpu.pc = self.cpu.pc.wrapping_add(1);
                self.push_u16(self.cpu.pc);
                self.push(self.cpu.p | FLAG_BREAK | FLAG_UNUSED);
                self.cpu.set_flag(FLAG_INTERRUPT, true);
                self.cpu.pc = self.read_u16(IRQ_VECTOR);
            }
            Op::Branch => return self.branch(opcode, operand),

            Op::Nop => {
                if let Operand::Memory { .. } = operand {
                    self.load(operand);
                }
            }

            Op::Lax => {
                let value = self.load(operand);
                self.cpu.a = value;
                self.cpu.x = value;
                self.cpu.update_zn(value);
            }
            Op::Sax => self.store(operand, self.cpu.a & self.cpu.x),
            Op::Dcp => {
                let out = self.modify(operand, |_, value| value.wrapping_sub(1));
                self.cpu.compare(self.cpu.a, out);
            }
            Op::Isb => {
                let out = self.modify(operand, |_, value| value.wrapping_add(1));
                self.cpu.sbc(out);
            }
            Op::Slo => {
                let out = self.modify(operand, Cpu::asl);
                self.cpu.a |= out;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Rla => {
                let out = self.modify(operand, Cpu::rol);
                self.cpu.a &= out;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Sre => {
                let out = self.modify(operand, Cpu::lsr);
                self.cpu.a ^= out;
                self.cpu.update_zn(self.cpu.a);
            }
            Op::Rra => {
                let out = self.modify(operand, Cpu::ror);
                self.cpu.adc(out);
            }
            Op::Anc => {
                let value = self.load(operand);
                self.cpu.a &= value;
                self.cpu.update_zn(self.cpu.a);
                self.cpu.set_flag(FLAG_CARRY, (self.cpu.a & 0x80) != 0);
            }
            Op::Alr => {
                let value = self.cpu.a & self.load(operand);
                self.cpu.a = self.cpu.lsr(value);
            }
            Op::Arr => {
                let value = self.cpu.a & self.load(operand);
                let carry_in = if self.cpu.flag(FLAG_CARRY) { 0x80 } else { 0 };
                self.cpu.a = (value >> 1) | carry_in;
                self.cpu.update_zn(self.cpu.a);
                self.cpu.set_flag(FLAG_CARRY, (self.cpu.a & 0x40) != 0);
                self.cpu.set_flag(
                    FLAG_OVERFLOW,
                    (((self.cpu.a >> 6) ^ (self.cpu.a >> 5)) & 0x01) != 0,
                );
            }
            Op::Axs => {
                let value = self.load(operand);
                let ax = self.cpu.a & self.cpu.x;
                self.cpu.set_flag(FLAG_CARRY, ax >= value);
                self.cpu.x = ax.wrapping_sub(value);
                self.cpu.update_zn(self.cpu.x);
            }

            Op::Jam => {
                self.cpu.jammed = true;
                warn!("CPU jammed by opcode ${opcode:02X} at ${opcode_pc:04X}");
                self.push_debug_event(format!(
                    "CPU jam ${:02X} @ ${:04X}",
                    opcode, opcode_pc
                ));
            }
            Op::Unknown => self.note_unknown_opcode(opcode, opcode_pc),
        }
        0
    }

    fn branch(&mut self, opcode: u8, operand: Operand) -> u8 {
        const CONDITION_FLAGS: [u8; 4] = [FLAG_NEGATIVE, FLAG_OVERFLOW, FLAG_CARRY, FLAG_ZERO];
        let flag = CONDITION_FLAGS[(opcode >> 6) as usize];
        let expected = (opcode & 0x20) != 0;
        let offset = self.load(operand) as i8;
        if self.cpu.flag(flag) != expected {
            return 0;
        }

        let old_pc = self.cpu.pc;
        let new_pc = old_pc.wrapping_add(offset as i16 as u16);
        self.cpu.pc = new_pc;
        if (old_pc & 0xFF00) != (new_pc & 0xFF00) {
            2
        } else {
            1
        }
    }

    fn service_interrupt(&mut self, vector: u16) {
        self.push_u16(self.cpu.pc);
        self.push((self.cpu.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.cpu.set_flag(FLAG_INTERRUPT, true);
        self.cpu.pc = self.read_u16(vector);
    }

    fn note_unknown_opcode(&mut self, opcode: u8, pc: u16) {
        self.counters.unknown_opcodes = self.counters.unknown_opcodes.wrapping_add(1);
        warn!("unknown opcode ${opcode:02X} at ${pc:04X}, treated as NOP");
        self.push_debug_event(format!("Unknown opcode ${:02X} @ ${:04X}", opcode, pc));
    }

    fn fetch_byte(&mut self) -> u8 {
        let byte = self.cpu_read(self.cpu.pc);
        self.cpu.pc = self.cpu.pc.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self) -> u16 {
        let lo = self.fetch_byte() as u16;
        let hi = self.fetch_byte() as u16;
        (hi << 8) | lo
    }

    pub(crate) fn read_u16(&mut self, addr: u16) -> u16 {
        let lo = self.cpu_read(addr) as u16;
        let hi = self.cpu_read(addr.wrapping_add(1)) as u16;
        (hi << 8) | lo
    }

    /// JMP ($xxFF) fetches the high byte from the start of the same page.
    fn read_u16_page_wrapped(&mut self, addr: u16) -> u16 {
        let lo = self.cpu_read(addr) as u16;
        let hi_addr = (addr & 0xFF00) | (addr.wrapping_add(1) & 0x00FF);
        let hi = self.cpu_read(hi_addr) as u16;
        (hi << 8) | lo
    }

    fn read_zp_u16(&mut self, addr: u8) -> u16 {
        let lo = self.cpu_read(addr as u16) as u16;
        let hi = self.cpu_read(addr.wrapping_add(1) as u16) as u16;
        (hi << 8) | lo
    }

    fn push(&mut self, value: u8) {
        self.cpu_write(0x0100 | self.cpu.sp as u16, value);
        self.cpu.sp = self.cpu.sp.wrapping_sub(1);
    }

    fn pop(&mut self) -> u8 {
        self.cpu.sp = self.cpu.sp.wrapping_add(1);
        self.cpu_read(0x0100 | self.cpu.sp as u16)
    }

    fn push_u16(&mut self, value: u16) {
        self.push((value >> 8) as u8);
        self.push(value as u8);
    }

    fn pop_u16(&mut self) -> u16 {
        let lo = self.pop() as u16;
        let hi = self.pop() as u16;
        (hi << 8) | lo
    }
}

fn indexed(base: u16, index: u8) -> (u16, bool) {
    let addr = base.wrapping_add(index as u16);
    (addr, (base & 0xFF00) != (addr & 0xFF00))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::tests::nes_with_program;

    /// Steps until the current instruction has used all of its cycles.
    fn run_instruction(nes: &mut Nes) -> u64 {
        let start = nes.cpu.total_cycles();
        nes.step_cpu();
        while !nes.cpu.at_instruction_boundary() {
            nes.step_cpu();
        }
        nes.cpu.total_cycles() - start
    }

    #[test]
    fn decodes_addressing_modes_across_groups() {
        assert_eq!(addressing_mode(0xA9), Mode::Immediate);
        assert_eq!(addressing_mode(0xB1), Mode::IndirectY);
        assert_eq!(addressing_mode(0x0A), Mode::Accumulator);
        assert_eq!(addressing_mode(0xB6), Mode::ZeroPageY);
        assert_eq!(addressing_mode(0xBE), Mode::AbsoluteY);
        assert_eq!(addressing_mode(0xBC), Mode::AbsoluteX);
        assert_eq!(addressing_mode(0x6C), Mode::Indirect);
        assert_eq!(addressing_mode(0x20), Mode::Absolute);
        assert_eq!(addressing_mode(0xD0), Mode::Relative);
        assert_eq!(addressing_mode(0xA2), Mode::Immediate);
        assert_eq!(addressing_mode(0x97), Mode::ZeroPageY);
        assert_eq!(addressing_mode(0x60), Mode::Implied);
        assert_eq!(operation(0x89), Op::Nop);
        assert_eq!(operation(0xEB), Op::Sbc);
        assert_eq!(operation(0x02), Op::Jam);
        assert_eq!(operation(0x9A), Op::Txs);
    }

    #[test]
    fn official_cycle_counts() {
        let cases = [
            (0xA9, 2),
            (0xA5, 3),
            (0xB5, 4),
            (0xAD, 4),
            (0xA1, 6),
            (0xB1, 5),
            (0x8D, 4),
            (0x9D, 5),
            (0x91, 6),
            (0x06, 5),
            (0x1E, 7),
            (0x4C, 3),
            (0x6C, 5),
            (0x20, 6),
            (0x60, 6),
            (0x48, 3),
            (0x68, 4),
            (0x00, 7),
            (0xEA, 2),
            (0xC3, 8),
        ];
        for (opcode, cycles) in cases {
            let op = operation(opcode);
            assert_eq!(
                base_cycles(op, addressing_mode(opcode)),
                cycles,
                "opcode ${opcode:02X}"
            );
        }
    }

    #[test]
    fn first_step_executes_at_reset_vector() {
        let mut nes = nes_with_program(&[0xA9, 0x42, 0xEA]);
        assert_eq!(nes.cpu.pc, 0x8000);
        assert_eq!(nes.cpu.sp, 0xFD);
        assert_eq!(nes.cpu.p, FLAG_INTERRUPT | FLAG_UNUSED);

        nes.step_cpu();
        assert_eq!(nes.cpu.a, 0x42);
        assert_eq!(nes.cpu.pc, 0x8002);
        assert_eq!(nes.cpu.cycles_remaining, 1);
    }

    #[test]
    fn adc_sets_carry_and_overflow() {
        // CLC; LDA #$50; ADC #$50
        let mut nes = nes_with_program(&[0x18, 0xA9, 0x50, 0x69, 0x50]);
        for _ in 0..3 {
            run_instruction(&mut nes);
        }
        assert_eq!(nes.cpu.a, 0xA0);
        assert!(nes.cpu.flag(FLAG_OVERFLOW));
        assert!(nes.cpu.flag(FLAG_NEGATIVE));
        assert!(!nes.cpu.flag(FLAG_CARRY));
    }

    #[test]
    fn sbc_borrows() {
        // SEC; LDA #$00; SBC #$01
        let mut nes = nes_with_program(&[0x38, 0xA9, 0x00, 0xE9, 0x01]);
        for _ in 0..3 {
            run_instruction(&mut nes);
        }
        assert_eq!(nes.cpu.a, 0xFF);
        assert!(!nes.cpu.flag(FLAG_CARRY));
    }

    #[test]
    fn page_crossing_read_costs_a_cycle() {
        // LDX #$01; LDA $80FF,X
        let mut nes = nes_with_program(&[0xA2, 0x01, 0xBD, 0xFF, 0x80]);
        run_instruction(&mut nes);
        assert_eq!(run_instruction(&mut nes), 5);
    }

    #[test]
    fn taken_branch_costs_extra_cycles() {
        // LDA #$00; BEQ +2; NOP; NOP
        let mut nes = nes_with_program(&[0xA9, 0x00, 0xF0, 0x02, 0xEA, 0xEA, 0xEA]);
        run_instruction(&mut nes);
        assert_eq!(run_instruction(&mut nes), 3);
        assert_eq!(nes.cpu.pc, 0x8006);
    }

    #[test]
    fn jsr_and_rts_round_trip() {
        // JSR $8004; NOP; RTS at $8004
        let mut nes = nes_with_program(&[0x20, 0x04, 0x80, 0xEA, 0x60]);
        run_instruction(&mut nes);
        assert_eq!(nes.cpu.pc, 0x8004);
        assert_eq!(nes.cpu.sp, 0xFB);
        run_instruction(&mut nes);
        assert_eq!(nes.cpu.pc, 0x8003);
        assert_eq!(nes.cpu.sp, 0xFD);
    }

    #[test]
    fn indirect_jump_wraps_within_page() {
        // LDA #$34; STA $02FF; LDA #$12; STA $0200; JMP ($02FF)
        let mut nes = nes_with_program(&[
            0xA9, 0x34, 0x8D, 0xFF, 0x02, 0xA9, 0x12, 0x8D, 0x00, 0x02, 0x6C, 0xFF, 0x02,
        ]);
        for _ in 0..5 {
            run_instruction(&mut nes);
        }
        assert_eq!(nes.cpu.pc, 0x1234);
    }

    #[test]
    fn nmi_is_taken_at_instruction_boundary() {
        let mut nes = nes_with_program(&[0xEA, 0xEA]);
        nes.step_cpu();
        nes.cpu.nmi_pending = true;
        nes.step_cpu();
        assert_eq!(nes.cpu.pc, 0x8001, "NOP must finish first");

        assert_eq!(run_instruction(&mut nes), 7);
        assert_eq!(nes.cpu.pc, 0x9000);
        assert!(nes.cpu.flag(FLAG_INTERRUPT));
        assert_eq!(nes.cpu.sp, 0xFA);
        assert_eq!(nes.counters.nmi_serviced, 1);
    }

    #[test]
    fn irq_respects_interrupt_disable() {
        // CLI; NOP
        let mut nes = nes_with_program(&[0xEA, 0x58, 0xEA, 0xEA]);
        nes.apu.frame_irq = true;
        run_instruction(&mut nes);
        assert_eq!(nes.cpu.pc, 0x8001, "I flag is set after reset");

        run_instruction(&mut nes);
        run_instruction(&mut nes);
        assert_eq!(nes.cpu.pc, 0x9100);
        assert_eq!(nes.counters.irq_serviced, 1);
    }

    #[test]
    fn brk_pushes_break_flag() {
        let mut nes = nes_with_program(&[0x00, 0xFF]);
        run_instruction(&mut nes);
        assert_eq!(nes.cpu.pc, 0x9100);
        let pushed_p = nes.ram[0x01FB];
        assert_ne!(pushed_p & FLAG_BREAK, 0);
        assert_eq!(nes.ram[0x01FC], 0x02);
        assert_eq!(nes.ram[0x01FD], 0x80);
    }

    #[test]
    fn unofficial_read_modify_write() {
        // LDA #$05; STA $10; DCP $10 (mem=4, cmp 5 vs 4 -> carry)
        let mut nes = nes_with_program(&[0xA9, 0x05, 0x85, 0x10, 0xC7, 0x10]);
        for _ in 0..3 {
            run_instruction(&mut nes);
        }
        assert_eq!(nes.ram[0x10], 0x04);
        assert!(nes.cpu.flag(FLAG_CARRY));
        assert!(!nes.cpu.flag(FLAG_ZERO));
    }

    #[test]
    fn jam_halts_the_cpu() {
        let mut nes = nes_with_program(&[0x02, 0xEA]);
        run_instruction(&mut nes);
        assert!(nes.cpu.jammed());
        let pc = nes.cpu.pc;
        for _ in 0..10 {
            nes.step_cpu();
        }
        assert_eq!(nes.cpu.pc, pc);
    }
}
