use serde::{Deserialize, Serialize};

use super::{
    Bus, FLAG_BREAK, FLAG_CARRY, FLAG_DECIMAL, FLAG_INTERRUPT, FLAG_NEGATIVE, FLAG_OVERFLOW,
    FLAG_UNUSED, FLAG_ZERO,
};

pub(crate) const NMI_VECTOR: u16 = 0xFFFA;
pub(crate) const RESET_VECTOR: u16 = 0xFFFC;
pub(crate) const IRQ_VECTOR: u16 = 0xFFFE;

/// 6502 register file plus the working latches of the current
/// instruction. Execution itself lives on [`Bus`], which supplies the
/// memory fabric the CPU reads through.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Cpu {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub p: u8,
    pub pc: u16,

    pub opcode: u8,
    pub fetched: u8,
    pub addr_abs: u16,
    pub addr_rel: u16,
    pub cycles: u8,

    pub nmi_pending: bool,
    pub irq_line: bool,
    pub halted: bool,
    pub total_cycles: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpuState {
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub sp: u8,
    pub p: u8,
    pub pc: u16,
    pub opcode: u8,
    pub fetched: u8,
    pub addr_abs: u16,
    pub addr_rel: u16,
    pub cycles: u8,
    pub nmi_pending: bool,
    pub irq_line: bool,
    pub halted: bool,
    pub total_cycles: u64,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,
            p: FLAG_INTERRUPT | FLAG_UNUSED,
            pc: 0,
            opcode: 0,
            fetched: 0,
            addr_abs: 0,
            addr_rel: 0,
            cycles: 0,
            nmi_pending: false,
            irq_line: false,
            halted: false,
            total_cycles: 0,
        }
    }

    pub fn flag(&self, flag: u8) -> bool {
        (self.p & flag) != 0
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.p |= flag;
        } else {
            self.p &= !flag;
        }
        self.p |= FLAG_UNUSED;
    }

    pub fn update_zn(&mut self, value: u8) {
        self.set_flag(FLAG_ZERO, value == 0);
        self.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
    }

    pub fn save_state(&self) -> CpuState {
        CpuState {
            a: self.a,
            x: self.x,
            y: self.y,
            sp: self.sp,
            p: self.p,
            pc: self.pc,
            opcode: self.opcode,
            fetched: self.fetched,
            addr_abs: self.addr_abs,
            addr_rel: self.addr_rel,
            cycles: self.cycles,
            nmi_pending: self.nmi_pending,
            irq_line: self.irq_line,
            halted: self.halted,
            total_cycles: self.total_cycles,
        }
    }

    pub fn load_state(&mut self, s: &CpuState) {
        self.a = s.a;
        self.x = s.x;
        self.y = s.y;
        self.sp = s.sp;
        self.p = s.p;
        self.pc = s.pc;
        self.opcode = s.opcode;
        self.fetched = s.fetched;
        self.addr_abs = s.addr_abs;
        self.addr_rel = s.addr_rel;
        self.cycles = s.cycles;
        self.nmi_pending = s.nmi_pending;
        self.irq_line = s.irq_line;
        self.halted = s.halted;
        self.total_cycles = s.total_cycles;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Imp,
    Acc,
    Imm,
    Zp0,
    Zpx,
    Zpy,
    Rel,
    Abs,
    Abx,
    Aby,
    Ind,
    Izx,
    Izy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs, Clc,
    Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny, Jmp,
    Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror, Rti,
    Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
    // Documented unofficial opcodes.
    Lax, Sax, Dcp, Isc, Slo, Rla, Sre, Rra, Anc, Alr, Arr, Axs,
    // Unstable opcodes rendered as correct-width NOPs: the address is
    // resolved (so PC advances properly) but nothing is accessed.
    NopAddr,
    // The $x2 column halts the CPU until reset.
    Jam,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct OpEntry {
    pub op: Op,
    pub mode: Mode,
    pub cycles: u8,
    pub legal: bool,
}

const fn op(op: Op, mode: Mode, cycles: u8) -> OpEntry {
    OpEntry {
        op,
        mode,
        cycles,
        legal: true,
    }
}

const fn ill(op: Op, mode: Mode, cycles: u8) -> OpEntry {
    OpEntry {
        op,
        mode,
        cycles,
        legal: false,
    }
}

use Mode::*;
use Op::*;

/// The decode table: one (operation, addressing mode, base cycles) triple
/// per opcode. Page-cross and branch penalties are added at execution
/// time.
#[rustfmt::skip]
pub(crate) const OPCODE_TABLE: [OpEntry; 256] = [
    // 0x00
    op(Brk, Imp, 7), op(Ora, Izx, 6), ill(Jam, Imp, 2), ill(Slo, Izx, 8),
    ill(Nop, Zp0, 3), op(Ora, Zp0, 3), op(Asl, Zp0, 5), ill(Slo, Zp0, 5),
    op(Php, Imp, 3), op(Ora, Imm, 2), op(Asl, Acc, 2), ill(Anc, Imm, 2),
    ill(Nop, Abs, 4), op(Ora, Abs, 4), op(Asl, Abs, 6), ill(Slo, Abs, 6),
    // 0x10
    op(Bpl, Rel, 2), op(Ora, Izy, 5), ill(Jam, Imp, 2), ill(Slo, Izy, 8),
    ill(Nop, Zpx, 4), op(Ora, Zpx, 4), op(Asl, Zpx, 6), ill(Slo, Zpx, 6),
    op(Clc, Imp, 2), op(Ora, Aby, 4), ill(Nop, Imp, 2), ill(Slo, Aby, 7),
    ill(Nop, Abx, 4), op(Ora, Abx, 4), op(Asl, Abx, 7), ill(Slo, Abx, 7),
    // 0x20
    op(Jsr, Abs, 6), op(And, Izx, 6), ill(Jam, Imp, 2), ill(Rla, Izx, 8),
    op(Bit, Zp0, 3), op(And, Zp0, 3), op(Rol, Zp0, 5), ill(Rla, Zp0, 5),
    op(Plp, Imp, 4), op(And, Imm, 2), op(Rol, Acc, 2), ill(Anc, Imm, 2),
    op(Bit, Abs, 4), op(And, Abs, 4), op(Rol, Abs, 6), ill(Rla, Abs, 6),
    // 0x30
    op(Bmi, Rel, 2), op(And, Izy, 5), ill(Jam, Imp, 2), ill(Rla, Izy, 8),
    ill(Nop, Zpx, 4), op(And, Zpx, 4), op(Rol, Zpx, 6), ill(Rla, Zpx, 6),
    op(Sec, Imp, 2), op(And, Aby, 4), ill(Nop, Imp, 2), ill(Rla, Aby, 7),
    ill(Nop, Abx, 4), op(And, Abx, 4), op(Rol, Abx, 7), ill(Rla, Abx, 7),
    // 0x40
    op(Rti, Imp, 6), op(Eor, Izx, 6), ill(Jam, Imp, 2), ill(Sre, Izx, 8),
    ill(Nop, Zp0, 3), op(Eor, Zp0, 3), op(Lsr, Zp0, 5), ill(Sre, Zp0, 5),
    op(Pha, Imp, 3), op(Eor, Imm, 2), op(Lsr, Acc, 2), ill(Alr, Imm, 2),
    op(Jmp, Abs, 3), op(Eor, Abs, 4), op(Lsr, Abs, 6), ill(Sre, Abs, 6),
    // 0x50
    op(Bvc, Rel, 2), op(Eor, Izy, 5), ill(Jam, Imp, 2), ill(Sre, Izy, 8),
    ill(Nop, Zpx, 4), op(Eor, Zpx, 4), op(Lsr, Zpx, 6), ill(Sre, Zpx, 6),
    op(Cli, Imp, 2), op(Eor, Aby, 4), ill(Nop, Imp, 2), ill(Sre, Aby, 7),
    ill(Nop, Abx, 4), op(Eor, Abx, 4), op(Lsr, Abx, 7), ill(Sre, Abx, 7),
    // 0x60
    op(Rts, Imp, 6), op(Adc, Izx, 6), ill(Jam, Imp, 2), ill(Rra, Izx, 8),
    ill(Nop, Zp0, 3), op(Adc, Zp0, 3), op(Ror, Zp0, 5), ill(Rra, Zp0, 5),
    op(Pla, Imp, 4), op(Adc, Imm, 2), op(Ror, Acc, 2), ill(Arr, Imm, 2),
    op(Jmp, Ind, 5), op(Adc, Abs, 4), op(Ror, Abs, 6), ill(Rra, Abs, 6),
    // 0x70
    op(Bvs, Rel, 2), op(Adc, Izy, 5), ill(Jam, Imp, 2), ill(Rra, Izy, 8),
    ill(Nop, Zpx, 4), op(Adc, Zpx, 4), op(Ror, Zpx, 6), ill(Rra, Zpx, 6),
    op(Sei, Imp, 2), op(Adc, Aby, 4), ill(Nop, Imp, 2), ill(Rra, Aby, 7),
    ill(Nop, Abx, 4), op(Adc, Abx, 4), op(Ror, Abx, 7), ill(Rra, Abx, 7),
    // 0x80
    ill(Nop, Imm, 2), op(Sta, Izx, 6), ill(Nop, Imm, 2), ill(Sax, Izx, 6),
    op(Sty, Zp0, 3), op(Sta, Zp0, 3), op(Stx, Zp0, 3), ill(Sax, Zp0, 3),
    op(Dey, Imp, 2), ill(Nop, Imm, 2), op(Txa, Imp, 2), ill(NopAddr, Imm, 2),
    op(Sty, Abs, 4), op(Sta, Abs, 4), op(Stx, Abs, 4), ill(Sax, Abs, 4),
    // 0x90
    op(Bcc, Rel, 2), op(Sta, Izy, 6), ill(Jam, Imp, 2), ill(NopAddr, Izy, 6),
    op(Sty, Zpx, 4), op(Sta, Zpx, 4), op(Stx, Zpy, 4), ill(Sax, Zpy, 4),
    op(Tya, Imp, 2), op(Sta, Aby, 5), op(Txs, Imp, 2), ill(NopAddr, Aby, 5),
    ill(NopAddr, Abx, 5), op(Sta, Abx, 5), ill(NopAddr, Aby, 5), ill(NopAddr, Aby, 5),
    // 0xA0
    op(Ldy, Imm, 2), op(Lda, Izx, 6), op(Ldx, Imm, 2), ill(Lax, Izx, 6),
    op(Ldy, Zp0, 3), op(Lda, Zp0, 3), op(Ldx, Zp0, 3), ill(Lax, Zp0, 3),
    op(Tay, Imp, 2), op(Lda, Imm, 2), op(Tax, Imp, 2), ill(NopAddr, Imm, 2),
    op(Ldy, Abs, 4), op(Lda, Abs, 4), op(Ldx, Abs, 4), ill(Lax, Abs, 4),
    // 0xB0
    op(Bcs, Rel, 2), op(Lda, Izy, 5), ill(Jam, Imp, 2), ill(Lax, Izy, 5),
    op(Ldy, Zpx, 4), op(Lda, Zpx, 4), op(Ldx, Zpy, 4), ill(Lax, Zpy, 4),
    op(Clv, Imp, 2), op(Lda, Aby, 4), op(Tsx, Imp, 2), ill(Nop, Aby, 4),
    op(Ldy, Abx, 4), op(Lda, Abx, 4), op(Ldx, Aby, 4), ill(Lax, Aby, 4),
    // 0xC0
    op(Cpy, Imm, 2), op(Cmp, Izx, 6), ill(Nop, Imm, 2), ill(Dcp, Izx, 8),
    op(Cpy, Zp0, 3), op(Cmp, Zp0, 3), op(Dec, Zp0, 5), ill(Dcp, Zp0, 5),
    op(Iny, Imp, 2), op(Cmp, Imm, 2), op(Dex, Imp, 2), ill(Axs, Imm, 2),
    op(Cpy, Abs, 4), op(Cmp, Abs, 4), op(Dec, Abs, 6), ill(Dcp, Abs, 6),
    // 0xD0
    op(Bne, Rel, 2), op(Cmp, Izy, 5), ill(Jam, Imp, 2), ill(Dcp, Izy, 8),
    ill(Nop, Zpx, 4), op(Cmp, Zpx, 4), op(Dec, Zpx, 6), ill(Dcp, Zpx, 6),
    op(Cld, Imp, 2), op(Cmp, Aby, 4), ill(Nop, Imp, 2), ill(Dcp, Aby, 7),
    ill(Nop, Abx, 4), op(Cmp, Abx, 4), op(Dec, Abx, 7), ill(Dcp, Abx, 7),
    // 0xE0
    op(Cpx, Imm, 2), op(Sbc, Izx, 6), ill(Nop, Imm, 2), ill(Isc, Izx, 8),
    op(Cpx, Zp0, 3), op(Sbc, Zp0, 3), op(Inc, Zp0, 5), ill(Isc, Zp0, 5),
    op(Inx, Imp, 2), op(Sbc, Imm, 2), op(Nop, Imp, 2), ill(Sbc, Imm, 2),
    op(Cpx, Abs, 4), op(Sbc, Abs, 4), op(Inc, Abs, 6), ill(Isc, Abs, 6),
    // 0xF0
    op(Beq, Rel, 2), op(Sbc, Izy, 5), ill(Jam, Imp, 2), ill(Isc, Izy, 8),
    ill(Nop, Zpx, 4), op(Sbc, Zpx, 4), op(Inc, Zpx, 6), ill(Isc, Zpx, 6),
    op(Sed, Imp, 2), op(Sbc, Aby, 4), ill(Nop, Imp, 2), ill(Isc, Aby, 7),
    ill(Nop, Abx, 4), op(Sbc, Abx, 4), op(Inc, Abx, 7), ill(Isc, Abx, 7),
];

impl Bus {
    /// Advance the CPU by one cycle. A new instruction (or interrupt
    /// sequence) begins when the previous one's cycle budget is spent;
    /// its effects are applied up front and the remaining cycles tick
    /// away silently.
    pub(crate) fn clock_cpu(&mut self) {
        if self.dma_stall > 0 {
            self.dma_stall -= 1;
            self.cpu.total_cycles += 1;
            return;
        }

        if self.cpu.halted {
            self.cpu.cycles = 0;
            self.cpu.total_cycles += 1;
            return;
        }

        if self.cpu.cycles == 0 {
            if self.cpu.nmi_pending {
                self.cpu.nmi_pending = false;
                self.interrupt(NMI_VECTOR);
            } else if self.cpu.irq_line && !self.cpu.flag(FLAG_INTERRUPT) {
                self.interrupt(IRQ_VECTOR);
            } else {
                self.execute_instruction();
            }
        }

        self.cpu.cycles -= 1;
        self.cpu.total_cycles += 1;
    }

    pub(crate) fn reset_cpu(&mut self) {
        self.cpu.a = 0;
        self.cpu.x = 0;
        self.cpu.y = 0;
        self.cpu.sp = 0xFD;
        self.cpu.p = FLAG_INTERRUPT | FLAG_UNUSED;
        self.cpu.pc = self.read_word(RESET_VECTOR);
        self.cpu.opcode = 0;
        self.cpu.fetched = 0;
        self.cpu.addr_abs = 0;
        self.cpu.addr_rel = 0;
        self.cpu.nmi_pending = false;
        self.cpu.irq_line = false;
        self.cpu.halted = false;
        self.cpu.total_cycles = 0;
        self.cpu.cycles = 7;
    }

    /// Hardware interrupt entry. B is pushed clear; BRK pushes it set.
    /// Entering the handler does not clear the interrupt source; the line
    /// stays asserted until the program acknowledges the device.
    fn interrupt(&mut self, vector: u16) {
        self.push_word(self.cpu.pc);
        self.push((self.cpu.p & !FLAG_BREAK) | FLAG_UNUSED);
        self.cpu.set_flag(FLAG_INTERRUPT, true);
        self.cpu.pc = self.read_word(vector);
        self.cpu.cycles = 7;
    }

    fn execute_instruction(&mut self) {
        let opcode = self.cpu_read(self.cpu.pc);
        self.cpu.opcode = opcode;
        self.cpu.pc = self.cpu.pc.wrapping_add(1);

        let entry = OPCODE_TABLE[opcode as usize];
        let page_crossed = self.resolve_mode(entry.mode);
        let (penalty_eligible, extra) = self.execute_op(entry.op, entry.mode);

        let mut cycles = entry.cycles + extra;
        if page_crossed && penalty_eligible {
            cycles += 1;
        }
        self.cpu.cycles = cycles;
    }

    /// Compute the effective address for `mode`, reporting whether an
    /// indexed mode crossed a page boundary.
    fn resolve_mode(&mut self, mode: Mode) -> bool {
        match mode {
            Imp | Acc => false,
            Imm => {
                self.cpu.addr_abs = self.cpu.pc;
                self.cpu.pc = self.cpu.pc.wrapping_add(1);
                false
            }
            Zp0 => {
                self.cpu.addr_abs = self.fetch_byte() as u16;
                false
            }
            Zpx => {
                let base = self.fetch_byte();
                self.cpu.addr_abs = base.wrapping_add(self.cpu.x) as u16;
                false
            }
            Zpy => {
                let base = self.fetch_byte();
                self.cpu.addr_abs = base.wrapping_add(self.cpu.y) as u16;
                false
            }
            Rel => {
                self.cpu.addr_rel = self.fetch_byte() as i8 as i16 as u16;
                false
            }
            Abs => {
                self.cpu.addr_abs = self.fetch_word();
                false
            }
            Abx => {
                let base = self.fetch_word();
                self.cpu.addr_abs = base.wrapping_add(self.cpu.x as u16);
                (base & 0xFF00) != (self.cpu.addr_abs & 0xFF00)
            }
            Aby => {
                let base = self.fetch_word();
                self.cpu.addr_abs = base.wrapping_add(self.cpu.y as u16);
                (base & 0xFF00) != (self.cpu.addr_abs & 0xFF00)
            }
            Ind => {
                let ptr = self.fetch_word();
                // The 6502 never carries into the pointer's high byte, so
                // a $xxFF pointer wraps within its own page.
                let lo = self.cpu_read(ptr) as u16;
                let hi_addr = (ptr & 0xFF00) | (ptr.wrapping_add(1) & 0x00FF);
                let hi = self.cpu_read(hi_addr) as u16;
                self.cpu.addr_abs = (hi << 8) | lo;
                false
            }
            Izx => {
                let zp = self.fetch_byte().wrapping_add(self.cpu.x);
                self.cpu.addr_abs = self.read_zp_word(zp);
                false
            }
            Izy => {
                let zp = self.fetch_byte();
                let base = self.read_zp_word(zp);
                self.cpu.addr_abs = base.wrapping_add(self.cpu.y as u16);
                (base & 0xFF00) != (self.cpu.addr_abs & 0xFF00)
            }
        }
    }

    /// Run the operation. Returns (takes the page-cross penalty, extra
    /// cycles from taken branches).
    fn execute_op(&mut self, op: Op, mode: Mode) -> (bool, u8) {
        match op {
            Lda => {
                self.cpu.a = self.fetch(mode);
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (true, 0)
            }
            Ldx => {
                self.cpu.x = self.fetch(mode);
                let x = self.cpu.x;
                self.cpu.update_zn(x);
                (true, 0)
            }
            Ldy => {
                self.cpu.y = self.fetch(mode);
                let y = self.cpu.y;
                self.cpu.update_zn(y);
                (true, 0)
            }
            Sta => {
                self.cpu_write(self.cpu.addr_abs, self.cpu.a);
                (false, 0)
            }
            Stx => {
                self.cpu_write(self.cpu.addr_abs, self.cpu.x);
                (false, 0)
            }
            Sty => {
                self.cpu_write(self.cpu.addr_abs, self.cpu.y);
                (false, 0)
            }
            Tax => {
                self.cpu.x = self.cpu.a;
                let v = self.cpu.x;
                self.cpu.update_zn(v);
                (false, 0)
            }
            Tay => {
                self.cpu.y = self.cpu.a;
                let v = self.cpu.y;
                self.cpu.update_zn(v);
                (false, 0)
            }
            Tsx => {
                self.cpu.x = self.cpu.sp;
                let v = self.cpu.x;
                self.cpu.update_zn(v);
                (false, 0)
            }
            Txa => {
                self.cpu.a = self.cpu.x;
                let v = self.cpu.a;
                self.cpu.update_zn(v);
                (false, 0)
            }
            Txs => {
                self.cpu.sp = self.cpu.x;
                (false, 0)
            }
            Tya => {
                self.cpu.a = self.cpu.y;
                let v = self.cpu.a;
                self.cpu.update_zn(v);
                (false, 0)
            }

            Pha => {
                self.push(self.cpu.a);
                (false, 0)
            }
            Php => {
                self.push(self.cpu.p | FLAG_BREAK | FLAG_UNUSED);
                (false, 0)
            }
            Pla => {
                self.cpu.a = self.pop();
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (false, 0)
            }
            Plp => {
                self.cpu.p = (self.pop() & !FLAG_BREAK) | FLAG_UNUSED;
                (false, 0)
            }

            Adc => {
                let value = self.fetch(mode);
                self.adc(value);
                (true, 0)
            }
            Sbc => {
                let value = self.fetch(mode);
                self.adc(value ^ 0xFF);
                (true, 0)
            }
            And => {
                self.cpu.a &= self.fetch(mode);
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (true, 0)
            }
            Ora => {
                self.cpu.a |= self.fetch(mode);
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (true, 0)
            }
            Eor => {
                self.cpu.a ^= self.fetch(mode);
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (true, 0)
            }
            Bit => {
                let value = self.fetch(mode);
                let a = self.cpu.a;
                self.cpu.set_flag(FLAG_ZERO, (a & value) == 0);
                self.cpu.set_flag(FLAG_NEGATIVE, (value & 0x80) != 0);
                self.cpu.set_flag(FLAG_OVERFLOW, (value & 0x40) != 0);
                (false, 0)
            }
            Cmp => {
                let value = self.fetch(mode);
                self.compare(self.cpu.a, value);
                (true, 0)
            }
            Cpx => {
                let value = self.fetch(mode);
                self.compare(self.cpu.x, value);
                (false, 0)
            }
            Cpy => {
                let value = self.fetch(mode);
                self.compare(self.cpu.y, value);
                (false, 0)
            }

            Asl => {
                self.rmw(mode, |cpu, v| {
                    cpu.set_flag(FLAG_CARRY, (v & 0x80) != 0);
                    v << 1
                });
                (false, 0)
            }
            Lsr => {
                self.rmw(mode, |cpu, v| {
                    cpu.set_flag(FLAG_CARRY, (v & 0x01) != 0);
                    v >> 1
                });
                (false, 0)
            }
            Rol => {
                self.rmw(mode, |cpu, v| {
                    let carry_in = cpu.flag(FLAG_CARRY) as u8;
                    cpu.set_flag(FLAG_CARRY, (v & 0x80) != 0);
                    (v << 1) | carry_in
                });
                (false, 0)
            }
            Ror => {
                self.rmw(mode, |cpu, v| {
                    let carry_in = (cpu.flag(FLAG_CARRY) as u8) << 7;
                    cpu.set_flag(FLAG_CARRY, (v & 0x01) != 0);
                    (v >> 1) | carry_in
                });
                (false, 0)
            }
            Inc => {
                self.rmw(mode, |_, v| v.wrapping_add(1));
                (false, 0)
            }
            Dec => {
                self.rmw(mode, |_, v| v.wrapping_sub(1));
                (false, 0)
            }
            Inx => {
                self.cpu.x = self.cpu.x.wrapping_add(1);
                let v = self.cpu.x;
                self.cpu.update_zn(v);
                (false, 0)
            }
            Iny => {
                self.cpu.y = self.cpu.y.wrapping_add(1);
                let v = self.cpu.y;
                self.cpu.update_zn(v);
                (false, 0)
            }
            Dex => {
                self.cpu.x = self.cpu.x.wrapping_sub(1);
                let v = self.cpu.x;
                self.cpu.update_zn(v);
                (false, 0)
            }
            Dey => {
                self.cpu.y = self.cpu.y.wrapping_sub(1);
                let v = self.cpu.y;
                self.cpu.update_zn(v);
                (false, 0)
            }

            Jmp => {
                self.cpu.pc = self.cpu.addr_abs;
                (false, 0)
            }
            Jsr => {
                self.push_word(self.cpu.pc.wrapping_sub(1));
                self.cpu.pc = self.cpu.addr_abs;
                (false, 0)
            }
            Rts => {
                self.cpu.pc = self.pop_word().wrapping_add(1);
                (false, 0)
            }
            Rti => {
                self.cpu.p = (self.pop() & !FLAG_BREAK) | FLAG_UNUSED;
                self.cpu.pc = self.pop_word();
                (false, 0)
            }
            Brk => {
                // BRK pushes the address after its padding byte.
                self.cpu.pc = self.cpu.pc.wrapping_add(1);
                self.push_word(self.cpu.pc);
                self.push(self.cpu.p | FLAG_BREAK | FLAG_UNUSED);
                self.cpu.set_flag(FLAG_INTERRUPT, true);
                self.cpu.pc = self.read_word(IRQ_VECTOR);
                (false, 0)
            }

            Bcc => (false, self.branch(!self.cpu.flag(FLAG_CARRY))),
            Bcs => (false, self.branch(self.cpu.flag(FLAG_CARRY))),
            Bne => (false, self.branch(!self.cpu.flag(FLAG_ZERO))),
            Beq => (false, self.branch(self.cpu.flag(FLAG_ZERO))),
            Bpl => (false, self.branch(!self.cpu.flag(FLAG_NEGATIVE))),
            Bmi => (false, self.branch(self.cpu.flag(FLAG_NEGATIVE))),
            Bvc => (false, self.branch(!self.cpu.flag(FLAG_OVERFLOW))),
            Bvs => (false, self.branch(self.cpu.flag(FLAG_OVERFLOW))),

            Clc => {
                self.cpu.set_flag(FLAG_CARRY, false);
                (false, 0)
            }
            Sec => {
                self.cpu.set_flag(FLAG_CARRY, true);
                (false, 0)
            }
            Cli => {
                self.cpu.set_flag(FLAG_INTERRUPT, false);
                (false, 0)
            }
            Sei => {
                self.cpu.set_flag(FLAG_INTERRUPT, true);
                (false, 0)
            }
            Clv => {
                self.cpu.set_flag(FLAG_OVERFLOW, false);
                (false, 0)
            }
            Cld => {
                self.cpu.set_flag(FLAG_DECIMAL, false);
                (false, 0)
            }
            Sed => {
                self.cpu.set_flag(FLAG_DECIMAL, true);
                (false, 0)
            }

            Nop => {
                // Operand-bearing NOP variants still perform their read.
                if !matches!(mode, Imp | Acc | Imm) {
                    let _ = self.cpu_read(self.cpu.addr_abs);
                }
                (true, 0)
            }
            NopAddr => (false, 0),
            Jam => {
                self.cpu.halted = true;
                log::warn!(
                    "CPU jammed by opcode ${:02X} at ${:04X}",
                    self.cpu.opcode,
                    self.cpu.pc.wrapping_sub(1)
                );
                (false, 0)
            }

            Lax => {
                let value = self.fetch(mode);
                self.cpu.a = value;
                self.cpu.x = value;
                self.cpu.update_zn(value);
                (true, 0)
            }
            Sax => {
                self.cpu_write(self.cpu.addr_abs, self.cpu.a & self.cpu.x);
                (false, 0)
            }
            Dcp => {
                let out = self.rmw(mode, |_, v| v.wrapping_sub(1));
                self.compare(self.cpu.a, out);
                (false, 0)
            }
            Isc => {
                let out = self.rmw(mode, |_, v| v.wrapping_add(1));
                self.adc(out ^ 0xFF);
                (false, 0)
            }
            Slo => {
                let out = self.rmw(mode, |cpu, v| {
                    cpu.set_flag(FLAG_CARRY, (v & 0x80) != 0);
                    v << 1
                });
                self.cpu.a |= out;
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (false, 0)
            }
            Rla => {
                let out = self.rmw(mode, |cpu, v| {
                    let carry_in = cpu.flag(FLAG_CARRY) as u8;
                    cpu.set_flag(FLAG_CARRY, (v & 0x80) != 0);
                    (v << 1) | carry_in
                });
                self.cpu.a &= out;
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (false, 0)
            }
            Sre => {
                let out = self.rmw(mode, |cpu, v| {
                    cpu.set_flag(FLAG_CARRY, (v & 0x01) != 0);
                    v >> 1
                });
                self.cpu.a ^= out;
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (false, 0)
            }
            Rra => {
                let out = self.rmw(mode, |cpu, v| {
                    let carry_in = (cpu.flag(FLAG_CARRY) as u8) << 7;
                    cpu.set_flag(FLAG_CARRY, (v & 0x01) != 0);
                    (v >> 1) | carry_in
                });
                self.adc(out);
                (false, 0)
            }
            Anc => {
                self.cpu.a &= self.fetch(mode);
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                self.cpu.set_flag(FLAG_CARRY, (a & 0x80) != 0);
                (false, 0)
            }
            Alr => {
                let value = self.cpu.a & self.fetch(mode);
                self.cpu.set_flag(FLAG_CARRY, (value & 0x01) != 0);
                self.cpu.a = value >> 1;
                let a = self.cpu.a;
                self.cpu.update_zn(a);
                (false, 0)
            }
            Arr => {
                let value = self.cpu.a & self.fetch(mode);
                let carry_in = (self.cpu.flag(FLAG_CARRY) as u8) << 7;
                let result = (value >> 1) | carry_in;
                self.cpu.a = result;
                self.cpu.update_zn(result);
                self.cpu.set_flag(FLAG_CARRY, (result & 0x40) != 0);
                self.cpu
                    .set_flag(FLAG_OVERFLOW, (((result >> 6) ^ (result >> 5)) & 0x01) != 0);
                (false, 0)
            }
            Axs => {
                let value = self.fetch(mode);
                let ax = self.cpu.a & self.cpu.x;
                self.cpu.set_flag(FLAG_CARRY, ax >= value);
                self.cpu.x = ax.wrapping_sub(value);
                let x = self.cpu.x;
                self.cpu.update_zn(x);
                (false, 0)
            }
        }
    }

    fn fetch(&mut self, mode: Mode) -> u8 {
        let value = if mode == Acc {
            self.cpu.a
        } else {
            self.cpu_read(self.cpu.addr_abs)
        };
        self.cpu.fetched = value;
        value
    }

    fn rmw(&mut self, mode: Mode, f: impl FnOnce(&mut Cpu, u8) -> u8) -> u8 {
        if mode == Acc {
            let value = self.cpu.a;
            let out = f(&mut self.cpu, value);
            self.cpu.a = out;
            self.cpu.update_zn(out);
            out
        } else {
            let value = self.cpu_read(self.cpu.addr_abs);
            let out = f(&mut self.cpu, value);
            self.cpu_write(self.cpu.addr_abs, out);
            self.cpu.update_zn(out);
            out
        }
    }

    fn adc(&mut self, value: u8) {
        let carry_in = self.cpu.flag(FLAG_CARRY) as u16;
        let a = self.cpu.a as u16;
        let sum = a + value as u16 + carry_in;
        let out = sum as u8;

        self.cpu.set_flag(FLAG_CARRY, sum > 0xFF);
        self.cpu
            .set_flag(FLAG_OVERFLOW, ((self.cpu.a ^ out) & (value ^ out) & 0x80) != 0);
        self.cpu.a = out;
        self.cpu.update_zn(out);
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.cpu.set_flag(FLAG_CARRY, register >= value);
        self.cpu.update_zn(result);
    }

    fn branch(&mut self, condition: bool) -> u8 {
        if !condition {
            return 0;
        }
        let old_pc = self.cpu.pc;
        let new_pc = old_pc.wrapping_add(self.cpu.addr_rel);
        self.cpu.pc = new_pc;
        if (old_pc & 0xFF00) != (new_pc & 0xFF00) {
            2
        } else {
            1
        }
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

    fn read_zp_word(&mut self, addr: u8) -> u16 {
        let lo = self.cpu_read(addr as u16) as u16;
        let hi = self.cpu_read(addr.wrapping_add(1) as u16) as u16;
        (hi << 8) | lo
    }

    pub(crate) fn read_word(&mut self, addr: u16) -> u16 {
        let lo = self.cpu_read(addr) as u16;
        let hi = self.cpu_read(addr.wrapping_add(1)) as u16;
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

    fn push_word(&mut self, value: u16) {
        self.push((value >> 8) as u8);
        self.push(value as u8);
    }

    fn pop_word(&mut self) -> u16 {
        let lo = self.pop() as u16;
        let hi = self.pop() as u16;
        (hi << 8) | lo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nes::test_support::{bus_with_program, bus_with_vectors};

    fn run_one(bus: &mut Bus) -> u8 {
        // The first CPU clock executes the instruction; spin out the rest.
        bus.clock_cpu();
        let mut consumed = 1;
        while bus.cpu.cycles > 0 {
            bus.clock_cpu();
            consumed += 1;
        }
        consumed
    }

    #[test]
    fn lda_immediate_sets_flags_and_takes_two_cycles() {
        let mut bus = bus_with_program(&[0xA9, 0x00, 0xA9, 0x80]);
        assert_eq!(run_one(&mut bus), 2);
        assert!(bus.cpu.flag(FLAG_ZERO));
        assert_eq!(run_one(&mut bus), 2);
        assert!(bus.cpu.flag(FLAG_NEGATIVE));
        assert_eq!(bus.cpu.a, 0x80);
    }

    #[test]
    fn absolute_x_read_pays_for_page_cross() {
        // LDX #$01; LDA $80FF,X crosses into $8100.
        let mut bus = bus_with_program(&[0xA2, 0x01, 0xBD, 0xFF, 0x80]);
        run_one(&mut bus);
        assert_eq!(run_one(&mut bus), 5);

        // Same read without a crossing costs the base 4.
        let mut bus = bus_with_program(&[0xA2, 0x01, 0xBD, 0x00, 0x80]);
        run_one(&mut bus);
        assert_eq!(run_one(&mut bus), 4);
    }

    #[test]
    fn indexed_store_never_pays_the_penalty() {
        let mut bus = bus_with_program(&[0xA9, 0xAB, 0xA2, 0x01, 0x9D, 0xFF, 0x02]);
        run_one(&mut bus);
        run_one(&mut bus);
        assert_eq!(run_one(&mut bus), 5);
        assert_eq!(bus.peek(0x0300), 0xAB);
    }

    #[test]
    fn taken_branch_costs_extra_and_more_across_pages() {
        // BNE +0x10 taken, same page.
        let mut bus = bus_with_program(&[0xA9, 0x01, 0xD0, 0x10]);
        run_one(&mut bus);
        assert_eq!(run_one(&mut bus), 3);

        // Not taken.
        let mut bus = bus_with_program(&[0xA9, 0x00, 0xD0, 0x10]);
        run_one(&mut bus);
        assert_eq!(run_one(&mut bus), 2);
    }

    #[test]
    fn jmp_indirect_wraps_within_the_pointer_page() {
        let mut bus = bus_with_program(&[0x6C, 0xFF, 0x02]);
        bus.write(0x02FF, 0x34);
        bus.write(0x0200, 0x12);
        run_one(&mut bus);
        assert_eq!(bus.cpu.pc, 0x1234);
    }

    #[test]
    fn adc_overflow_and_carry_follow_the_signed_rule() {
        // 0x50 + 0x50 = 0xA0: signed overflow, no carry.
        let mut bus = bus_with_program(&[0xA9, 0x50, 0x69, 0x50]);
        run_one(&mut bus);
        run_one(&mut bus);
        assert_eq!(bus.cpu.a, 0xA0);
        assert!(bus.cpu.flag(FLAG_OVERFLOW));
        assert!(!bus.cpu.flag(FLAG_CARRY));

        // 0xFF + 0x01 = 0x00: carry out, no signed overflow.
        let mut bus = bus_with_program(&[0xA9, 0xFF, 0x69, 0x01]);
        run_one(&mut bus);
        run_one(&mut bus);
        assert_eq!(bus.cpu.a, 0x00);
        assert!(bus.cpu.flag(FLAG_CARRY));
        assert!(!bus.cpu.flag(FLAG_OVERFLOW));
        assert!(bus.cpu.flag(FLAG_ZERO));
    }

    #[test]
    fn sbc_borrows_through_carry() {
        // SEC; LDA #$10; SBC #$20 -> 0xF0, borrow (carry clear).
        let mut bus = bus_with_program(&[0x38, 0xA9, 0x10, 0xE9, 0x20]);
        run_one(&mut bus);
        run_one(&mut bus);
        run_one(&mut bus);
        assert_eq!(bus.cpu.a, 0xF0);
        assert!(!bus.cpu.flag(FLAG_CARRY));
        assert!(bus.cpu.flag(FLAG_NEGATIVE));
    }

    #[test]
    fn php_pushes_b_and_u_set_plp_reads_them_back_masked() {
        let mut bus = bus_with_program(&[0x08, 0x68]);
        bus.cpu.p = FLAG_CARRY | FLAG_UNUSED;
        run_one(&mut bus);
        run_one(&mut bus);
        assert_eq!(bus.cpu.a, FLAG_CARRY | FLAG_UNUSED | FLAG_BREAK);
    }

    #[test]
    fn brk_pushes_pc_plus_one_and_vectors_through_fffe() {
        let mut bus = bus_with_vectors(&[0x00, 0xEA, 0xEA], 0x9100, 0x9000);
        let sp_before = bus.cpu.sp;
        run_one(&mut bus);
        assert_eq!(bus.cpu.pc, 0x9000);
        assert!(bus.cpu.flag(FLAG_INTERRUPT));

        // Pushed return address is BRK+2.
        let lo = bus.peek(0x0100 | (sp_before.wrapping_sub(1)) as u16);
        let hi = bus.peek(0x0100 | sp_before as u16);
        let pushed = ((hi as u16) << 8) | lo as u16;
        assert_eq!(pushed, 0x8002);

        let pushed_p = bus.peek(0x0100 | (sp_before.wrapping_sub(2)) as u16);
        assert_ne!(pushed_p & FLAG_BREAK, 0);
        assert_ne!(pushed_p & FLAG_UNUSED, 0);
    }

    #[test]
    fn nmi_preempts_irq_and_clears_its_latch() {
        let mut bus = bus_with_vectors(&[0xEA, 0xEA], 0x9100, 0x9200);
        bus.cpu.nmi_pending = true;
        bus.cpu.irq_line = true;
        bus.cpu.set_flag(FLAG_INTERRUPT, false);

        assert_eq!(run_one(&mut bus), 7);
        assert_eq!(bus.cpu.pc, 0x9100);
        assert!(!bus.cpu.nmi_pending);
        assert!(bus.cpu.flag(FLAG_INTERRUPT));
    }

    #[test]
    fn irq_respects_the_interrupt_mask() {
        let mut bus = bus_with_vectors(&[0xEA, 0xEA], 0x9100, 0x9200);
        bus.cpu.irq_line = true;
        bus.cpu.set_flag(FLAG_INTERRUPT, true);

        run_one(&mut bus);
        assert_ne!(bus.cpu.pc, 0x9200);

        bus.cpu.set_flag(FLAG_INTERRUPT, false);
        run_one(&mut bus);
        assert_eq!(bus.cpu.pc, 0x9200);
    }

    #[test]
    fn lax_loads_a_and_x_together() {
        let mut bus = bus_with_program(&[0xA7, 0x10]);
        bus.write(0x0010, 0x5A);
        run_one(&mut bus);
        assert_eq!(bus.cpu.a, 0x5A);
        assert_eq!(bus.cpu.x, 0x5A);
    }

    #[test]
    fn dcp_decrements_then_compares() {
        let mut bus = bus_with_program(&[0xA9, 0x40, 0xC7, 0x10]);
        bus.write(0x0010, 0x41);
        run_one(&mut bus);
        assert_eq!(run_one(&mut bus), 5);
        assert_eq!(bus.peek(0x0010), 0x40);
        assert!(bus.cpu.flag(FLAG_ZERO));
        assert!(bus.cpu.flag(FLAG_CARRY));
    }

    #[test]
    fn jam_opcode_halts_the_cpu() {
        let mut bus = bus_with_program(&[0x02, 0xEA]);
        run_one(&mut bus);
        assert!(bus.cpu.halted);
        let pc = bus.cpu.pc;
        for _ in 0..12 {
            bus.clock_cpu();
        }
        assert_eq!(bus.cpu.pc, pc);
    }

    #[test]
    fn unofficial_nops_consume_documented_width_and_cycles() {
        // $04 = NOP zp (2 bytes, 3 cycles), $1C = NOP abs,X (3 bytes, 4).
        let mut bus = bus_with_program(&[0x04, 0x10, 0x1C, 0x00, 0x02]);
        let pc = bus.cpu.pc;
        assert_eq!(run_one(&mut bus), 3);
        assert_eq!(bus.cpu.pc, pc.wrapping_add(2));
        assert_eq!(run_one(&mut bus), 4);
        assert_eq!(bus.cpu.pc, pc.wrapping_add(5));
    }

    #[test]
    fn every_opcode_consumes_at_least_two_cycles() {
        for entry in OPCODE_TABLE.iter() {
            assert!(entry.cycles >= 2);
        }
    }
}
