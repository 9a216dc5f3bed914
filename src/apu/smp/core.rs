//! Instruction fetch/decode/execute
//!
//! One long dispatch over the 256-opcode space, built from generic
//! addressing-mode helpers. Every opcode is short and deterministic, so the
//! core is a plain match rather than a coroutine; suspension happens only
//! between instructions in the driver loop.

use super::super::dsp::Dsp;
use super::{AccessKind, Flags, Smp};

type BinOp = fn(&mut Smp, u8, u8) -> u8;
type UnOp = fn(&mut Smp, u8) -> u8;
type WordOp = fn(&mut Smp, u16, u16) -> u16;

/// ALU register operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg {
    A,
    X,
    Y,
}

impl Smp {
    fn reg(&self, reg: Reg) -> u8 {
        match reg {
            Reg::A => self.regs.a,
            Reg::X => self.regs.x,
            Reg::Y => self.regs.y,
        }
    }

    fn set_reg(&mut self, reg: Reg, value: u8) {
        match reg {
            Reg::A => self.regs.a = value,
            Reg::X => self.regs.x = value,
            Reg::Y => self.regs.y = value,
        }
    }

    fn ya(&self) -> u16 {
        u16::from(self.regs.y) << 8 | u16::from(self.regs.a)
    }

    fn set_ya(&mut self, value: u16) {
        self.regs.a = value as u8;
        self.regs.y = (value >> 8) as u8;
    }

    fn dp_base(&self) -> u16 {
        if self.regs.p.contains(Flags::P) {
            0x0100
        } else {
            0x0000
        }
    }

    // ---- primitive bus operations ----

    pub(crate) fn fetch(&mut self, bus: &mut Dsp) -> u8 {
        let address = self.regs.pc;
        self.regs.pc = self.regs.pc.wrapping_add(1);
        let kind = if self.opcode_fetch_pending {
            AccessKind::Execute
        } else {
            AccessKind::Read
        };
        self.opcode_fetch_pending = false;
        self.read(bus, address, kind, false)
    }

    fn load(&mut self, bus: &mut Dsp, address: u8) -> u8 {
        let address = self.dp_base() | u16::from(address);
        self.read(bus, address, AccessKind::Read, false)
    }

    fn load_dummy(&mut self, bus: &mut Dsp, address: u8) {
        let address = self.dp_base() | u16::from(address);
        self.read(bus, address, AccessKind::Read, true);
    }

    fn store(&mut self, bus: &mut Dsp, address: u8, data: u8) {
        let address = self.dp_base() | u16::from(address);
        self.write(bus, address, data);
    }

    fn pull(&mut self, bus: &mut Dsp) -> u8 {
        self.regs.s = self.regs.s.wrapping_add(1);
        let address = 0x0100 | u16::from(self.regs.s);
        self.read(bus, address, AccessKind::Read, false)
    }

    fn push(&mut self, bus: &mut Dsp, data: u8) {
        let address = 0x0100 | u16::from(self.regs.s);
        self.regs.s = self.regs.s.wrapping_sub(1);
        self.write(bus, address, data);
    }

    fn fetch16(&mut self, bus: &mut Dsp) -> u16 {
        let lo = self.fetch(bus);
        let hi = self.fetch(bus);
        u16::from(lo) | u16::from(hi) << 8
    }

    // ---- addressing-mode instruction shapes ----

    fn absolute_read(&mut self, bus: &mut Dsp, op: BinOp, target: Reg) {
        let address = self.fetch16(bus);
        let data = self.read(bus, address, AccessKind::Read, false);
        let lhs = self.reg(target);
        let result = op(self, lhs, data);
        self.set_reg(target, result);
    }

    fn absolute_modify(&mut self, bus: &mut Dsp, op: UnOp) {
        let address = self.fetch16(bus);
        let data = self.read(bus, address, AccessKind::Read, false);
        let result = op(self, data);
        self.write(bus, address, result);
    }

    fn absolute_write(&mut self, bus: &mut Dsp, reg: Reg) {
        let address = self.fetch16(bus);
        self.read(bus, address, AccessKind::Read, true);
        self.write(bus, address, self.reg(reg));
    }

    fn absolute_indexed_read(&mut self, bus: &mut Dsp, op: BinOp, index: Reg) {
        let address = self.fetch16(bus);
        self.idle();
        let address = address.wrapping_add(u16::from(self.reg(index)));
        let data = self.read(bus, address, AccessKind::Read, false);
        let lhs = self.regs.a;
        let result = op(self, lhs, data);
        self.regs.a = result;
    }

    fn absolute_indexed_write(&mut self, bus: &mut Dsp, index: Reg) {
        let address = self.fetch16(bus);
        self.idle();
        let address = address.wrapping_add(u16::from(self.reg(index)));
        self.read(bus, address, AccessKind::Read, true);
        self.write(bus, address, self.regs.a);
    }

    fn absolute_bit_modify(&mut self, bus: &mut Dsp, mode: u8) {
        let operand = self.fetch16(bus);
        let bit = (operand >> 13) as u8;
        let address = operand & 0x1FFF;
        let mut data = self.read(bus, address, AccessKind::Read, false);
        let carry = self.regs.p.contains(Flags::C);
        let bit_set = data & (1 << bit) != 0;
        match mode {
            0 => {
                // OR1 C, m.b
                self.idle();
                self.regs.p.set(Flags::C, carry | bit_set);
            }
            1 => {
                // OR1 C, /m.b
                self.idle();
                self.regs.p.set(Flags::C, carry | !bit_set);
            }
            2 => {
                // AND1 C, m.b
                self.regs.p.set(Flags::C, carry & bit_set);
            }
            3 => {
                // AND1 C, /m.b
                self.regs.p.set(Flags::C, carry & !bit_set);
            }
            4 => {
                // EOR1 C, m.b
                self.idle();
                self.regs.p.set(Flags::C, carry ^ bit_set);
            }
            5 => {
                // MOV1 C, m.b
                self.regs.p.set(Flags::C, bit_set);
            }
            6 => {
                // MOV1 m.b, C
                self.idle();
                if carry {
                    data |= 1 << bit;
                } else {
                    data &= !(1 << bit);
                }
                self.write(bus, address, data);
            }
            _ => {
                // NOT1 m.b
                data ^= 1 << bit;
                self.write(bus, address, data);
            }
        }
    }

    fn branch(&mut self, bus: &mut Dsp, take: bool) {
        let displacement = self.fetch(bus);
        if !take {
            return;
        }
        self.idle();
        self.idle();
        self.regs.pc = self.regs.pc.wrapping_add(i16::from(displacement as i8) as u16);
    }

    fn branch_bit(&mut self, bus: &mut Dsp, bit: u8, matched: bool) {
        let address = self.fetch(bus);
        let data = self.load(bus, address);
        self.idle();
        let displacement = self.fetch(bus);
        if (data & (1 << bit) != 0) != matched {
            return;
        }
        self.idle();
        self.idle();
        self.regs.pc = self.regs.pc.wrapping_add(i16::from(displacement as i8) as u16);
    }

    fn branch_not_direct(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus);
        let data = self.load(bus, address);
        self.idle();
        let displacement = self.fetch(bus);
        if self.regs.a == data {
            return;
        }
        self.idle();
        self.idle();
        self.regs.pc = self.regs.pc.wrapping_add(i16::from(displacement as i8) as u16);
    }

    fn branch_not_direct_decrement(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus);
        let data = self.load(bus, address).wrapping_sub(1);
        self.store(bus, address, data);
        let displacement = self.fetch(bus);
        if data == 0 {
            return;
        }
        self.idle();
        self.idle();
        self.regs.pc = self.regs.pc.wrapping_add(i16::from(displacement as i8) as u16);
    }

    fn branch_not_direct_indexed(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus);
        self.idle();
        let data = self.load(bus, address.wrapping_add(self.regs.x));
        self.idle();
        let displacement = self.fetch(bus);
        if self.regs.a == data {
            return;
        }
        self.idle();
        self.idle();
        self.regs.pc = self.regs.pc.wrapping_add(i16::from(displacement as i8) as u16);
    }

    fn branch_not_y_decrement(&mut self, bus: &mut Dsp) {
        self.idle();
        self.idle();
        let displacement = self.fetch(bus);
        self.regs.y = self.regs.y.wrapping_sub(1);
        if self.regs.y == 0 {
            return;
        }
        self.idle();
        self.idle();
        self.regs.pc = self.regs.pc.wrapping_add(i16::from(displacement as i8) as u16);
    }

    fn do_break(&mut self, bus: &mut Dsp) {
        self.idle();
        self.push(bus, (self.regs.pc >> 8) as u8);
        self.push(bus, self.regs.pc as u8);
        self.push(bus, self.regs.p.bits());
        self.idle();
        let lo = self.read(bus, 0xFFDE, AccessKind::Read, false);
        let hi = self.read(bus, 0xFFDF, AccessKind::Read, false);
        self.regs.pc = u16::from(lo) | u16::from(hi) << 8;
        self.regs.p.insert(Flags::B);
        self.regs.p.remove(Flags::I);
    }

    fn call_absolute(&mut self, bus: &mut Dsp) {
        let address = self.fetch16(bus);
        self.idle();
        self.push(bus, (self.regs.pc >> 8) as u8);
        self.push(bus, self.regs.pc as u8);
        self.idle();
        self.idle();
        self.regs.pc = address;
    }

    fn call_page(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus);
        self.idle();
        self.push(bus, (self.regs.pc >> 8) as u8);
        self.push(bus, self.regs.pc as u8);
        self.idle();
        self.regs.pc = 0xFF00 | u16::from(address);
    }

    fn call_table(&mut self, bus: &mut Dsp, vector: u8) {
        self.idle();
        self.idle();
        self.push(bus, (self.regs.pc >> 8) as u8);
        self.push(bus, self.regs.pc as u8);
        self.idle();
        let address = 0xFFDEu16.wrapping_sub(u16::from(vector) << 1);
        let lo = self.read(bus, address, AccessKind::Read, false);
        let hi = self.read(bus, address.wrapping_add(1), AccessKind::Read, false);
        self.regs.pc = u16::from(lo) | u16::from(hi) << 8;
    }

    fn decimal_adjust_add(&mut self) {
        self.idle();
        self.idle();
        if self.regs.p.contains(Flags::C) || self.regs.a > 0x99 {
            self.regs.a = self.regs.a.wrapping_add(0x60);
            self.regs.p.insert(Flags::C);
        }
        if self.regs.p.contains(Flags::H) || self.regs.a & 0x0F > 0x09 {
            self.regs.a = self.regs.a.wrapping_add(0x06);
        }
        let a = self.regs.a;
        self.regs.p.set(Flags::Z, a == 0);
        self.regs.p.set(Flags::N, a & 0x80 != 0);
    }

    fn decimal_adjust_sub(&mut self) {
        self.idle();
        self.idle();
        if !self.regs.p.contains(Flags::C) || self.regs.a > 0x99 {
            self.regs.a = self.regs.a.wrapping_sub(0x60);
            self.regs.p.remove(Flags::C);
        }
        if !self.regs.p.contains(Flags::H) || self.regs.a & 0x0F > 0x09 {
            self.regs.a = self.regs.a.wrapping_sub(0x06);
        }
        let a = self.regs.a;
        self.regs.p.set(Flags::Z, a == 0);
        self.regs.p.set(Flags::N, a & 0x80 != 0);
    }

    fn direct_read(&mut self, bus: &mut Dsp, op: BinOp, target: Reg) {
        let address = self.fetch(bus);
        let data = self.load(bus, address);
        let lhs = self.reg(target);
        let result = op(self, lhs, data);
        self.set_reg(target, result);
    }

    fn direct_modify(&mut self, bus: &mut Dsp, op: UnOp) {
        let address = self.fetch(bus);
        let data = self.load(bus, address);
        let result = op(self, data);
        self.store(bus, address, result);
    }

    fn direct_write(&mut self, bus: &mut Dsp, reg: Reg) {
        let address = self.fetch(bus);
        self.load_dummy(bus, address);
        self.store(bus, address, self.reg(reg));
    }

    fn direct_direct_compare(&mut self, bus: &mut Dsp, op: BinOp) {
        let source = self.fetch(bus);
        let rhs = self.load(bus, source);
        let target = self.fetch(bus);
        let lhs = self.load(bus, target);
        op(self, lhs, rhs);
        self.idle();
    }

    fn direct_direct_modify(&mut self, bus: &mut Dsp, op: BinOp) {
        let source = self.fetch(bus);
        let rhs = self.load(bus, source);
        let target = self.fetch(bus);
        let lhs = self.load(bus, target);
        let result = op(self, lhs, rhs);
        self.store(bus, target, result);
    }

    fn direct_direct_write(&mut self, bus: &mut Dsp) {
        let source = self.fetch(bus);
        let data = self.load(bus, source);
        let target = self.fetch(bus);
        self.store(bus, target, data);
    }

    fn direct_immediate_compare(&mut self, bus: &mut Dsp, op: BinOp) {
        let immediate = self.fetch(bus);
        let address = self.fetch(bus);
        let data = self.load(bus, address);
        op(self, data, immediate);
        self.idle();
    }

    fn direct_immediate_modify(&mut self, bus: &mut Dsp, op: BinOp) {
        let immediate = self.fetch(bus);
        let address = self.fetch(bus);
        let data = self.load(bus, address);
        let result = op(self, data, immediate);
        self.store(bus, address, result);
    }

    fn direct_immediate_write(&mut self, bus: &mut Dsp) {
        let immediate = self.fetch(bus);
        let address = self.fetch(bus);
        self.load_dummy(bus, address);
        self.store(bus, address, immediate);
    }

    fn direct_compare_word(&mut self, bus: &mut Dsp, op: WordOp) {
        let address = self.fetch(bus);
        let lo = self.load(bus, address);
        let hi = self.load(bus, address.wrapping_add(1));
        let data = u16::from(lo) | u16::from(hi) << 8;
        let lhs = self.ya();
        let result = op(self, lhs, data);
        self.set_ya(result);
    }

    fn direct_read_word(&mut self, bus: &mut Dsp, op: WordOp) {
        let address = self.fetch(bus);
        let lo = self.load(bus, address);
        self.idle();
        let hi = self.load(bus, address.wrapping_add(1));
        let data = u16::from(lo) | u16::from(hi) << 8;
        let lhs = self.ya();
        let result = op(self, lhs, data);
        self.set_ya(result);
    }

    fn direct_modify_word(&mut self, bus: &mut Dsp, adjust: i32) {
        let address = self.fetch(bus);
        let mut data = (i32::from(self.load(bus, address)) + adjust) as u16;
        self.store(bus, address, data as u8);
        data = data.wrapping_add(u16::from(self.load(bus, address.wrapping_add(1))) << 8);
        self.store(bus, address.wrapping_add(1), (data >> 8) as u8);
        self.regs.p.set(Flags::Z, data == 0);
        self.regs.p.set(Flags::N, data & 0x8000 != 0);
    }

    fn direct_write_word(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus);
        self.load_dummy(bus, address);
        self.store(bus, address, self.regs.a);
        self.store(bus, address.wrapping_add(1), self.regs.y);
    }

    fn direct_read_word_into_ya(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus);
        self.regs.a = self.load(bus, address);
        self.idle();
        self.regs.y = self.load(bus, address.wrapping_add(1));
        let ya = self.ya();
        self.regs.p.set(Flags::Z, ya == 0);
        self.regs.p.set(Flags::N, ya & 0x8000 != 0);
    }

    fn direct_indexed_read(&mut self, bus: &mut Dsp, op: BinOp, target: Reg, index: Reg) {
        let address = self.fetch(bus);
        self.idle();
        let data = self.load(bus, address.wrapping_add(self.reg(index)));
        let lhs = self.reg(target);
        let result = op(self, lhs, data);
        self.set_reg(target, result);
    }

    fn direct_indexed_modify(&mut self, bus: &mut Dsp, op: UnOp) {
        let address = self.fetch(bus);
        self.idle();
        let address = address.wrapping_add(self.regs.x);
        let data = self.load(bus, address);
        let result = op(self, data);
        self.store(bus, address, result);
    }

    fn direct_indexed_write(&mut self, bus: &mut Dsp, reg: Reg, index: Reg) {
        let address = self.fetch(bus);
        self.idle();
        let address = address.wrapping_add(self.reg(index));
        self.load_dummy(bus, address);
        self.store(bus, address, self.reg(reg));
    }

    fn divide(&mut self) {
        for _ in 0..11 {
            self.idle();
        }
        let ya = self.ya();
        let x = u16::from(self.regs.x);
        // overflow set if the quotient exceeds 8 bits
        self.regs.p.set(Flags::H, self.regs.x & 15 <= self.regs.y & 15);
        self.regs.p.set(Flags::V, self.regs.y >= self.regs.x);
        if u16::from(self.regs.y) < x << 1 {
            if x != 0 {
                self.regs.a = (ya / x) as u8;
                self.regs.y = (ya % x) as u8;
            }
        } else {
            // quotient does not fit; mimic the hardware's fold-back
            let divisor = 256 - i32::from(x);
            let rebased = i32::from(ya) - (i32::from(x) << 9);
            if divisor != 0 {
                self.regs.a = (255 - rebased / divisor) as u8;
                self.regs.y = (i32::from(x) + rebased % divisor) as u8;
            }
        }
        let a = self.regs.a;
        self.regs.p.set(Flags::Z, a == 0);
        self.regs.p.set(Flags::N, a & 0x80 != 0);
    }

    fn exchange_nibble(&mut self) {
        self.idle();
        self.idle();
        self.idle();
        self.idle();
        self.regs.a = self.regs.a >> 4 | self.regs.a << 4;
        let a = self.regs.a;
        self.regs.p.set(Flags::Z, a == 0);
        self.regs.p.set(Flags::N, a & 0x80 != 0);
    }

    fn flag_set(&mut self, flag: Flags, value: bool) {
        self.idle();
        self.regs.p.set(flag, value);
    }

    fn interrupt_flag_set(&mut self, value: bool) {
        self.idle();
        self.idle();
        self.regs.p.set(Flags::I, value);
    }

    fn immediate_read(&mut self, bus: &mut Dsp, op: BinOp, target: Reg) {
        let data = self.fetch(bus);
        let lhs = self.reg(target);
        let result = op(self, lhs, data);
        self.set_reg(target, result);
    }

    fn implied_modify(&mut self, op: UnOp, target: Reg) {
        self.idle();
        let value = self.reg(target);
        let result = op(self, value);
        self.set_reg(target, result);
    }

    fn indexed_indirect_read(&mut self, bus: &mut Dsp, op: BinOp) {
        let address = self.fetch(bus).wrapping_add(self.regs.x);
        self.idle();
        let lo = self.load(bus, address);
        let hi = self.load(bus, address.wrapping_add(1));
        let pointer = u16::from(lo) | u16::from(hi) << 8;
        let data = self.read(bus, pointer, AccessKind::Read, false);
        let lhs = self.regs.a;
        let result = op(self, lhs, data);
        self.regs.a = result;
    }

    fn indexed_indirect_write(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus).wrapping_add(self.regs.x);
        self.idle();
        let lo = self.load(bus, address);
        let hi = self.load(bus, address.wrapping_add(1));
        let pointer = u16::from(lo) | u16::from(hi) << 8;
        self.read(bus, pointer, AccessKind::Read, true);
        self.write(bus, pointer, self.regs.a);
    }

    fn indirect_indexed_read(&mut self, bus: &mut Dsp, op: BinOp) {
        let address = self.fetch(bus);
        let lo = self.load(bus, address);
        let hi = self.load(bus, address.wrapping_add(1));
        self.idle();
        let pointer = (u16::from(lo) | u16::from(hi) << 8).wrapping_add(u16::from(self.regs.y));
        let data = self.read(bus, pointer, AccessKind::Read, false);
        let lhs = self.regs.a;
        let result = op(self, lhs, data);
        self.regs.a = result;
    }

    fn indirect_indexed_write(&mut self, bus: &mut Dsp) {
        let address = self.fetch(bus);
        let lo = self.load(bus, address);
        let hi = self.load(bus, address.wrapping_add(1));
        self.idle();
        let pointer = (u16::from(lo) | u16::from(hi) << 8).wrapping_add(u16::from(self.regs.y));
        self.read(bus, pointer, AccessKind::Read, true);
        self.write(bus, pointer, self.regs.a);
    }

    fn indirect_x_read(&mut self, bus: &mut Dsp, op: BinOp) {
        self.idle();
        let data = self.load(bus, self.regs.x);
        let lhs = self.regs.a;
        let result = op(self, lhs, data);
        self.regs.a = result;
    }

    fn indirect_x_write(&mut self, bus: &mut Dsp) {
        self.idle();
        self.load_dummy(bus, self.regs.x);
        self.store(bus, self.regs.x, self.regs.a);
    }

    fn indirect_x_increment_read(&mut self, bus: &mut Dsp) {
        self.idle();
        let data = self.load(bus, self.regs.x);
        self.regs.x = self.regs.x.wrapping_add(1);
        self.idle();
        self.regs.a = data;
        self.regs.p.set(Flags::Z, data == 0);
        self.regs.p.set(Flags::N, data & 0x80 != 0);
    }

    fn indirect_x_increment_write(&mut self, bus: &mut Dsp) {
        self.idle();
        self.idle();
        self.store(bus, self.regs.x, self.regs.a);
        self.regs.x = self.regs.x.wrapping_add(1);
    }

    fn indirect_x_compare_indirect_y(&mut self, bus: &mut Dsp, op: BinOp, write_back: bool) {
        self.idle();
        let rhs = self.load(bus, self.regs.y);
        let lhs = self.load(bus, self.regs.x);
        let result = op(self, lhs, rhs);
        if write_back {
            self.store(bus, self.regs.x, result);
        } else {
            self.idle();
        }
    }

    fn jump_absolute(&mut self, bus: &mut Dsp) {
        self.regs.pc = self.fetch16(bus);
    }

    fn jump_indirect_x(&mut self, bus: &mut Dsp) {
        let address = self.fetch16(bus);
        self.idle();
        let address = address.wrapping_add(u16::from(self.regs.x));
        let lo = self.read(bus, address, AccessKind::Read, false);
        let hi = self.read(bus, address.wrapping_add(1), AccessKind::Read, false);
        self.regs.pc = u16::from(lo) | u16::from(hi) << 8;
    }

    fn multiply(&mut self) {
        for _ in 0..8 {
            self.idle();
        }
        let ya = u16::from(self.regs.y) * u16::from(self.regs.a);
        self.regs.a = ya as u8;
        self.regs.y = (ya >> 8) as u8;
        // flags are from the Y side only
        let y = self.regs.y;
        self.regs.p.set(Flags::Z, y == 0);
        self.regs.p.set(Flags::N, y & 0x80 != 0);
    }

    fn overflow_clear(&mut self) {
        self.idle();
        self.regs.p.remove(Flags::H);
        self.regs.p.remove(Flags::V);
    }

    fn pull_reg(&mut self, bus: &mut Dsp, reg: Reg) {
        self.idle();
        self.idle();
        let data = self.pull(bus);
        self.set_reg(reg, data);
    }

    fn pull_p(&mut self, bus: &mut Dsp) {
        self.idle();
        self.idle();
        self.regs.p = Flags::from_bits_retain(self.pull(bus));
    }

    fn push_byte(&mut self, bus: &mut Dsp, data: u8) {
        self.idle();
        self.push(bus, data);
        self.idle();
    }

    fn do_return(&mut self, bus: &mut Dsp) {
        self.idle();
        self.idle();
        let lo = self.pull(bus);
        let hi = self.pull(bus);
        self.regs.pc = u16::from(lo) | u16::from(hi) << 8;
    }

    fn return_interrupt(&mut self, bus: &mut Dsp) {
        self.idle();
        self.idle();
        self.regs.p = Flags::from_bits_retain(self.pull(bus));
        let lo = self.pull(bus);
        let hi = self.pull(bus);
        self.regs.pc = u16::from(lo) | u16::from(hi) << 8;
    }

    fn direct_set_bit(&mut self, bus: &mut Dsp, bit: u8, value: bool) {
        let address = self.fetch(bus);
        let mut data = self.load(bus, address);
        if value {
            data |= 1 << bit;
        } else {
            data &= !(1 << bit);
        }
        self.store(bus, address, data);
    }

    fn test_set_bits_absolute(&mut self, bus: &mut Dsp, set: bool) {
        let address = self.fetch16(bus);
        let data = self.read(bus, address, AccessKind::Read, false);
        let compare = self.regs.a.wrapping_sub(data);
        self.regs.p.set(Flags::Z, compare == 0);
        self.regs.p.set(Flags::N, compare & 0x80 != 0);
        self.read(bus, address, AccessKind::Read, true);
        let result = if set { data | self.regs.a } else { data & !self.regs.a };
        self.write(bus, address, result);
    }

    fn transfer(&mut self, from: u8, to_sp: bool) -> u8 {
        self.idle();
        if !to_sp {
            self.regs.p.set(Flags::Z, from == 0);
            self.regs.p.set(Flags::N, from & 0x80 != 0);
        }
        from
    }

    // ---- dispatch ----

    pub(crate) fn dispatch(&mut self, bus: &mut Dsp, opcode: u8) {
        match opcode {
            0x00 => self.idle(), // NOP
            0x01 => self.call_table(bus, 0),
            0x02 => self.direct_set_bit(bus, 0, true),
            0x03 => self.branch_bit(bus, 0, true),
            0x04 => self.direct_read(bus, Self::alg_or, Reg::A),
            0x05 => self.absolute_read(bus, Self::alg_or, Reg::A),
            0x06 => self.indirect_x_read(bus, Self::alg_or),
            0x07 => self.indexed_indirect_read(bus, Self::alg_or),
            0x08 => self.immediate_read(bus, Self::alg_or, Reg::A),
            0x09 => self.direct_direct_modify(bus, Self::alg_or),
            0x0A => self.absolute_bit_modify(bus, 0),
            0x0B => self.direct_modify(bus, Self::alg_asl),
            0x0C => self.absolute_modify(bus, Self::alg_asl),
            0x0D => {
                let p = self.regs.p.bits();
                self.push_byte(bus, p);
            }
            0x0E => self.test_set_bits_absolute(bus, true),
            0x0F => self.do_break(bus),

            0x10 => self.branch(bus, !self.regs.p.contains(Flags::N)),
            0x11 => self.call_table(bus, 1),
            0x12 => self.direct_set_bit(bus, 0, false),
            0x13 => self.branch_bit(bus, 0, false),
            0x14 => self.direct_indexed_read(bus, Self::alg_or, Reg::A, Reg::X),
            0x15 => self.absolute_indexed_read(bus, Self::alg_or, Reg::X),
            0x16 => self.absolute_indexed_read(bus, Self::alg_or, Reg::Y),
            0x17 => self.indirect_indexed_read(bus, Self::alg_or),
            0x18 => self.direct_immediate_modify(bus, Self::alg_or),
            0x19 => self.indirect_x_compare_indirect_y(bus, Self::alg_or, true),
            0x1A => self.direct_modify_word(bus, -1),
            0x1B => self.direct_indexed_modify(bus, Self::alg_asl),
            0x1C => self.implied_modify(Self::alg_asl, Reg::A),
            0x1D => self.implied_modify(Self::alg_dec, Reg::X),
            0x1E => self.absolute_read(bus, Self::alg_cmp, Reg::X),
            0x1F => self.jump_indirect_x(bus),

            0x20 => self.flag_set(Flags::P, false),
            0x21 => self.call_table(bus, 2),
            0x22 => self.direct_set_bit(bus, 1, true),
            0x23 => self.branch_bit(bus, 1, true),
            0x24 => self.direct_read(bus, Self::alg_and, Reg::A),
            0x25 => self.absolute_read(bus, Self::alg_and, Reg::A),
            0x26 => self.indirect_x_read(bus, Self::alg_and),
            0x27 => self.indexed_indirect_read(bus, Self::alg_and),
            0x28 => self.immediate_read(bus, Self::alg_and, Reg::A),
            0x29 => self.direct_direct_modify(bus, Self::alg_and),
            0x2A => self.absolute_bit_modify(bus, 1),
            0x2B => self.direct_modify(bus, Self::alg_rol),
            0x2C => self.absolute_modify(bus, Self::alg_rol),
            0x2D => {
                let a = self.regs.a;
                self.push_byte(bus, a);
            }
            0x2E => self.branch_not_direct(bus),
            0x2F => self.branch(bus, true),

            0x30 => self.branch(bus, self.regs.p.contains(Flags::N)),
            0x31 => self.call_table(bus, 3),
            0x32 => self.direct_set_bit(bus, 1, false),
            0x33 => self.branch_bit(bus, 1, false),
            0x34 => self.direct_indexed_read(bus, Self::alg_and, Reg::A, Reg::X),
            0x35 => self.absolute_indexed_read(bus, Self::alg_and, Reg::X),
            0x36 => self.absolute_indexed_read(bus, Self::alg_and, Reg::Y),
            0x37 => self.indirect_indexed_read(bus, Self::alg_and),
            0x38 => self.direct_immediate_modify(bus, Self::alg_and),
            0x39 => self.indirect_x_compare_indirect_y(bus, Self::alg_and, true),
            0x3A => self.direct_modify_word(bus, 1),
            0x3B => self.direct_indexed_modify(bus, Self::alg_rol),
            0x3C => self.implied_modify(Self::alg_rol, Reg::A),
            0x3D => self.implied_modify(Self::alg_inc, Reg::X),
            0x3E => self.direct_read(bus, Self::alg_cmp, Reg::X),
            0x3F => self.call_absolute(bus),

            0x40 => self.flag_set(Flags::P, true),
            0x41 => self.call_table(bus, 4),
            0x42 => self.direct_set_bit(bus, 2, true),
            0x43 => self.branch_bit(bus, 2, true),
            0x44 => self.direct_read(bus, Self::alg_eor, Reg::A),
            0x45 => self.absolute_read(bus, Self::alg_eor, Reg::A),
            0x46 => self.indirect_x_read(bus, Self::alg_eor),
            0x47 => self.indexed_indirect_read(bus, Self::alg_eor),
            0x48 => self.immediate_read(bus, Self::alg_eor, Reg::A),
            0x49 => self.direct_direct_modify(bus, Self::alg_eor),
            0x4A => self.absolute_bit_modify(bus, 2),
            0x4B => self.direct_modify(bus, Self::alg_lsr),
            0x4C => self.absolute_modify(bus, Self::alg_lsr),
            0x4D => {
                let x = self.regs.x;
                self.push_byte(bus, x);
            }
            0x4E => self.test_set_bits_absolute(bus, false),
            0x4F => self.call_page(bus),

            0x50 => self.branch(bus, !self.regs.p.contains(Flags::V)),
            0x51 => self.call_table(bus, 5),
            0x52 => self.direct_set_bit(bus, 2, false),
            0x53 => self.branch_bit(bus, 2, false),
            0x54 => self.direct_indexed_read(bus, Self::alg_eor, Reg::A, Reg::X),
            0x55 => self.absolute_indexed_read(bus, Self::alg_eor, Reg::X),
            0x56 => self.absolute_indexed_read(bus, Self::alg_eor, Reg::Y),
            0x57 => self.indirect_indexed_read(bus, Self::alg_eor),
            0x58 => self.direct_immediate_modify(bus, Self::alg_eor),
            0x59 => self.indirect_x_compare_indirect_y(bus, Self::alg_eor, true),
            0x5A => self.direct_compare_word(bus, Self::alg_cpw),
            0x5B => self.direct_indexed_modify(bus, Self::alg_lsr),
            0x5C => self.implied_modify(Self::alg_lsr, Reg::A),
            0x5D => {
                let a = self.regs.a;
                self.regs.x = self.transfer(a, false);
            }
            0x5E => self.absolute_read(bus, Self::alg_cmp, Reg::Y),
            0x5F => self.jump_absolute(bus),

            0x60 => self.flag_set(Flags::C, false),
            0x61 => self.call_table(bus, 6),
            0x62 => self.direct_set_bit(bus, 3, true),
            0x63 => self.branch_bit(bus, 3, true),
            0x64 => self.direct_read(bus, Self::alg_cmp, Reg::A),
            0x65 => self.absolute_read(bus, Self::alg_cmp, Reg::A),
            0x66 => self.indirect_x_read(bus, Self::alg_cmp),
            0x67 => self.indexed_indirect_read(bus, Self::alg_cmp),
            0x68 => self.immediate_read(bus, Self::alg_cmp, Reg::A),
            0x69 => self.direct_direct_compare(bus, Self::alg_cmp),
            0x6A => self.absolute_bit_modify(bus, 3),
            0x6B => self.direct_modify(bus, Self::alg_ror),
            0x6C => self.absolute_modify(bus, Self::alg_ror),
            0x6D => {
                let y = self.regs.y;
                self.push_byte(bus, y);
            }
            0x6E => self.branch_not_direct_decrement(bus),
            0x6F => self.do_return(bus),

            0x70 => self.branch(bus, self.regs.p.contains(Flags::V)),
            0x71 => self.call_table(bus, 7),
            0x72 => self.direct_set_bit(bus, 3, false),
            0x73 => self.branch_bit(bus, 3, false),
            0x74 => self.direct_indexed_read(bus, Self::alg_cmp, Reg::A, Reg::X),
            0x75 => self.absolute_indexed_read(bus, Self::alg_cmp, Reg::X),
            0x76 => self.absolute_indexed_read(bus, Self::alg_cmp, Reg::Y),
            0x77 => self.indirect_indexed_read(bus, Self::alg_cmp),
            0x78 => self.direct_immediate_compare(bus, Self::alg_cmp),
            0x79 => self.indirect_x_compare_indirect_y(bus, Self::alg_cmp, false),
            0x7A => self.direct_read_word(bus, Self::alg_adw),
            0x7B => self.direct_indexed_modify(bus, Self::alg_ror),
            0x7C => self.implied_modify(Self::alg_ror, Reg::A),
            0x7D => {
                let x = self.regs.x;
                self.regs.a = self.transfer(x, false);
            }
            0x7E => self.direct_read(bus, Self::alg_cmp, Reg::Y),
            0x7F => self.return_interrupt(bus),

            0x80 => self.flag_set(Flags::C, true),
            0x81 => self.call_table(bus, 8),
            0x82 => self.direct_set_bit(bus, 4, true),
            0x83 => self.branch_bit(bus, 4, true),
            0x84 => self.direct_read(bus, Self::alg_adc, Reg::A),
            0x85 => self.absolute_read(bus, Self::alg_adc, Reg::A),
            0x86 => self.indirect_x_read(bus, Self::alg_adc),
            0x87 => self.indexed_indirect_read(bus, Self::alg_adc),
            0x88 => self.immediate_read(bus, Self::alg_adc, Reg::A),
            0x89 => self.direct_direct_modify(bus, Self::alg_adc),
            0x8A => self.absolute_bit_modify(bus, 4),
            0x8B => self.direct_modify(bus, Self::alg_dec),
            0x8C => self.absolute_modify(bus, Self::alg_dec),
            0x8D => self.immediate_read(bus, Self::alg_ld, Reg::Y),
            0x8E => self.pull_p(bus),
            0x8F => self.direct_immediate_write(bus),

            0x90 => self.branch(bus, !self.regs.p.contains(Flags::C)),
            0x91 => self.call_table(bus, 9),
            0x92 => self.direct_set_bit(bus, 4, false),
            0x93 => self.branch_bit(bus, 4, false),
            0x94 => self.direct_indexed_read(bus, Self::alg_adc, Reg::A, Reg::X),
            0x95 => self.absolute_indexed_read(bus, Self::alg_adc, Reg::X),
            0x96 => self.absolute_indexed_read(bus, Self::alg_adc, Reg::Y),
            0x97 => self.indirect_indexed_read(bus, Self::alg_adc),
            0x98 => self.direct_immediate_modify(bus, Self::alg_adc),
            0x99 => self.indirect_x_compare_indirect_y(bus, Self::alg_adc, true),
            0x9A => self.direct_read_word(bus, Self::alg_sbw),
            0x9B => self.direct_indexed_modify(bus, Self::alg_dec),
            0x9C => self.implied_modify(Self::alg_dec, Reg::A),
            0x9D => {
                let s = self.regs.s;
                self.regs.x = self.transfer(s, false);
            }
            0x9E => self.divide(),
            0x9F => self.exchange_nibble(),

            0xA0 => self.interrupt_flag_set(true),
            0xA1 => self.call_table(bus, 10),
            0xA2 => self.direct_set_bit(bus, 5, true),
            0xA3 => self.branch_bit(bus, 5, true),
            0xA4 => self.direct_read(bus, Self::alg_sbc, Reg::A),
            0xA5 => self.absolute_read(bus, Self::alg_sbc, Reg::A),
            0xA6 => self.indirect_x_read(bus, Self::alg_sbc),
            0xA7 => self.indexed_indirect_read(bus, Self::alg_sbc),
            0xA8 => self.immediate_read(bus, Self::alg_sbc, Reg::A),
            0xA9 => self.direct_direct_modify(bus, Self::alg_sbc),
            0xAA => self.absolute_bit_modify(bus, 5),
            0xAB => self.direct_modify(bus, Self::alg_inc),
            0xAC => self.absolute_modify(bus, Self::alg_inc),
            0xAD => self.immediate_read(bus, Self::alg_cmp, Reg::Y),
            0xAE => self.pull_reg(bus, Reg::A),
            0xAF => self.indirect_x_increment_write(bus),

            0xB0 => self.branch(bus, self.regs.p.contains(Flags::C)),
            0xB1 => self.call_table(bus, 11),
            0xB2 => self.direct_set_bit(bus, 5, false),
            0xB3 => self.branch_bit(bus, 5, false),
            0xB4 => self.direct_indexed_read(bus, Self::alg_sbc, Reg::A, Reg::X),
            0xB5 => self.absolute_indexed_read(bus, Self::alg_sbc, Reg::X),
            0xB6 => self.absolute_indexed_read(bus, Self::alg_sbc, Reg::Y),
            0xB7 => self.indirect_indexed_read(bus, Self::alg_sbc),
            0xB8 => self.direct_immediate_modify(bus, Self::alg_sbc),
            0xB9 => self.indirect_x_compare_indirect_y(bus, Self::alg_sbc, true),
            0xBA => self.direct_read_word_into_ya(bus),
            0xBB => self.direct_indexed_modify(bus, Self::alg_inc),
            0xBC => self.implied_modify(Self::alg_inc, Reg::A),
            0xBD => {
                let x = self.regs.x;
                self.regs.s = self.transfer(x, true);
            }
            0xBE => self.decimal_adjust_sub(),
            0xBF => self.indirect_x_increment_read(bus),

            0xC0 => self.interrupt_flag_set(false),
            0xC1 => self.call_table(bus, 12),
            0xC2 => self.direct_set_bit(bus, 6, true),
            0xC3 => self.branch_bit(bus, 6, true),
            0xC4 => self.direct_write(bus, Reg::A),
            0xC5 => self.absolute_write(bus, Reg::A),
            0xC6 => self.indirect_x_write(bus),
            0xC7 => self.indexed_indirect_write(bus),
            0xC8 => self.immediate_read(bus, Self::alg_cmp, Reg::X),
            0xC9 => self.absolute_write(bus, Reg::X),
            0xCA => self.absolute_bit_modify(bus, 6),
            0xCB => self.direct_write(bus, Reg::Y),
            0xCC => self.absolute_write(bus, Reg::Y),
            0xCD => self.immediate_read(bus, Self::alg_ld, Reg::X),
            0xCE => self.pull_reg(bus, Reg::X),
            0xCF => self.multiply(),

            0xD0 => self.branch(bus, !self.regs.p.contains(Flags::Z)),
            0xD1 => self.call_table(bus, 13),
            0xD2 => self.direct_set_bit(bus, 6, false),
            0xD3 => self.branch_bit(bus, 6, false),
            0xD4 => self.direct_indexed_write(bus, Reg::A, Reg::X),
            0xD5 => self.absolute_indexed_write(bus, Reg::X),
            0xD6 => self.absolute_indexed_write(bus, Reg::Y),
            0xD7 => self.indirect_indexed_write(bus),
            0xD8 => self.direct_write(bus, Reg::X),
            0xD9 => self.direct_indexed_write(bus, Reg::X, Reg::Y),
            0xDA => self.direct_write_word(bus),
            0xDB => self.direct_indexed_write(bus, Reg::Y, Reg::X),
            0xDC => self.implied_modify(Self::alg_dec, Reg::Y),
            0xDD => {
                let y = self.regs.y;
                self.regs.a = self.transfer(y, false);
            }
            0xDE => self.branch_not_direct_indexed(bus),
            0xDF => self.decimal_adjust_add(),

            0xE0 => self.overflow_clear(),
            0xE1 => self.call_table(bus, 14),
            0xE2 => self.direct_set_bit(bus, 7, true),
            0xE3 => self.branch_bit(bus, 7, true),
            0xE4 => self.direct_read(bus, Self::alg_ld, Reg::A),
            0xE5 => self.absolute_read(bus, Self::alg_ld, Reg::A),
            0xE6 => self.indirect_x_read(bus, Self::alg_ld),
            0xE7 => self.indexed_indirect_read(bus, Self::alg_ld),
            0xE8 => self.immediate_read(bus, Self::alg_ld, Reg::A),
            0xE9 => self.absolute_read(bus, Self::alg_ld, Reg::X),
            0xEA => self.absolute_bit_modify(bus, 7),
            0xEB => self.direct_read(bus, Self::alg_ld, Reg::Y),
            0xEC => self.absolute_read(bus, Self::alg_ld, Reg::Y),
            0xED => {
                self.idle();
                self.idle();
                self.regs.p.toggle(Flags::C);
            }
            0xEE => self.pull_reg(bus, Reg::Y),
            0xEF => {
                // SLEEP: resumes on interrupt
                self.idle();
                self.idle();
                self.wait_latch = true;
            }

            0xF0 => self.branch(bus, self.regs.p.contains(Flags::Z)),
            0xF1 => self.call_table(bus, 15),
            0xF2 => self.direct_set_bit(bus, 7, false),
            0xF3 => self.branch_bit(bus, 7, false),
            0xF4 => self.direct_indexed_read(bus, Self::alg_ld, Reg::A, Reg::X),
            0xF5 => self.absolute_indexed_read(bus, Self::alg_ld, Reg::X),
            0xF6 => self.absolute_indexed_read(bus, Self::alg_ld, Reg::Y),
            0xF7 => self.indirect_indexed_read(bus, Self::alg_ld),
            0xF8 => self.direct_read(bus, Self::alg_ld, Reg::X),
            0xF9 => self.direct_indexed_read(bus, Self::alg_ld, Reg::X, Reg::Y),
            0xFA => self.direct_direct_write(bus),
            0xFB => self.direct_indexed_read(bus, Self::alg_ld, Reg::Y, Reg::X),
            0xFC => self.implied_modify(Self::alg_inc, Reg::Y),
            0xFD => {
                let a = self.regs.a;
                self.regs.y = self.transfer(a, false);
            }
            0xFE => self.branch_not_y_decrement(bus),
            0xFF => {
                // STOP: halts until power-cycle
                self.idle();
                self.idle();
                self.stop_latch = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot(program: &[u8]) -> (Smp, Dsp) {
        let mut smp = Smp::new();
        smp.power();
        let mut bus = Dsp::new();
        bus.aram[0x0200..0x0200 + program.len()].copy_from_slice(program);
        smp.regs.pc = 0x0200;
        smp.io.iplrom_enable = false;
        (smp, bus)
    }

    fn run(smp: &mut Smp, bus: &mut Dsp, instructions: usize) {
        for _ in 0..instructions {
            smp.run_instruction(bus);
        }
    }

    #[test]
    fn test_mov_imm_and_store() {
        // MOV A,#$5A ; MOV $40,A
        let (mut smp, mut bus) = boot(&[0xE8, 0x5A, 0xC4, 0x40]);
        run(&mut smp, &mut bus, 2);
        assert_eq!(smp.regs.a, 0x5A);
        assert_eq!(bus.aram[0x0040], 0x5A);
        assert_eq!(smp.regs.pc, 0x0204);
    }

    #[test]
    fn test_direct_page_flag_selects_page_one() {
        // SETP ; MOV A,#$77 ; MOV $40,A
        let (mut smp, mut bus) = boot(&[0x40, 0xE8, 0x77, 0xC4, 0x40]);
        run(&mut smp, &mut bus, 3);
        assert_eq!(bus.aram[0x0140], 0x77);
        assert_eq!(bus.aram[0x0040], 0x00);
    }

    #[test]
    fn test_adc_sets_carry_chain() {
        // MOV A,#$FF ; CLRC ; ADC A,#$02
        let (mut smp, mut bus) = boot(&[0xE8, 0xFF, 0x60, 0x88, 0x02]);
        run(&mut smp, &mut bus, 3);
        assert_eq!(smp.regs.a, 0x01);
        assert!(smp.regs.p.contains(Flags::C));
    }

    #[test]
    fn test_branch_loop_counts_down() {
        // MOV X,#$03 ; DEC X ; BNE -3 ; STOP
        let (mut smp, mut bus) = boot(&[0xCD, 0x03, 0x1D, 0xD0, 0xFD, 0xFF]);
        for _ in 0..16 {
            if smp.stop_latch {
                break;
            }
            smp.run_instruction(&mut bus);
        }
        assert!(smp.stop_latch);
        assert_eq!(smp.regs.x, 0);
        assert!(smp.regs.p.contains(Flags::Z));
    }

    #[test]
    fn test_call_and_ret() {
        // CALL $0210 ; STOP ... at $0210: MOV A,#$11 ; RET
        let mut program = [0u8; 0x20];
        program[0] = 0x3F;
        program[1] = 0x10;
        program[2] = 0x02;
        program[3] = 0xFF;
        program[0x10] = 0xE8;
        program[0x11] = 0x11;
        program[0x12] = 0x6F;
        let (mut smp, mut bus) = boot(&program);
        run(&mut smp, &mut bus, 3);
        assert_eq!(smp.regs.a, 0x11);
        assert_eq!(smp.regs.pc, 0x0203);
        assert_eq!(smp.regs.s, 0xEF);
    }

    #[test]
    fn test_mul_and_div_round_trip() {
        // MOV A,#$07 ; MOV Y,#$09 ; MUL YA ; MOV X,#$09 ; DIV YA,X
        let (mut smp, mut bus) = boot(&[0xE8, 0x07, 0x8D, 0x09, 0xCF, 0xCD, 0x09, 0x9E]);
        run(&mut smp, &mut bus, 3);
        assert_eq!(smp.regs.a, 63);
        assert_eq!(smp.regs.y, 0);
        run(&mut smp, &mut bus, 2);
        assert_eq!(smp.regs.a, 7);
        assert_eq!(smp.regs.y, 0);
    }

    #[test]
    fn test_movw_and_incw() {
        // MOV A,#$FF ; MOV Y,#$01 ; MOVW $30,YA ; INCW $30
        let (mut smp, mut bus) = boot(&[0xE8, 0xFF, 0x8D, 0x01, 0xDA, 0x30, 0x3A, 0x30]);
        run(&mut smp, &mut bus, 4);
        assert_eq!(bus.aram[0x0030], 0x00);
        assert_eq!(bus.aram[0x0031], 0x02);
    }

    #[test]
    fn test_set1_bbs() {
        // SET1 $20.3 ; BBS $20.3,+1 ; STOP ; MOV A,#$42 ; STOP
        let (mut smp, mut bus) = boot(&[0x62, 0x20, 0x63, 0x20, 0x01, 0xFF, 0xE8, 0x42, 0xFF]);
        run(&mut smp, &mut bus, 3);
        assert_eq!(bus.aram[0x0020], 0x08);
        assert_eq!(smp.regs.a, 0x42);
        assert!(!smp.stop_latch);
    }

    #[test]
    fn test_nop_costs_four_clocks() {
        let (mut smp, mut bus) = boot(&[0x00]);
        let before = smp.global_cycle_counter;
        run(&mut smp, &mut bus, 1);
        // fetch + idle at default wait states: 2 + 2 clocks
        assert_eq!(smp.global_cycle_counter - before, 4);
    }

    #[test]
    fn test_stack_push_pop() {
        // MOV A,#$AA ; PUSH A ; MOV A,#$00 ; POP A
        let (mut smp, mut bus) = boot(&[0xE8, 0xAA, 0x2D, 0xE8, 0x00, 0xAE]);
        run(&mut smp, &mut bus, 4);
        assert_eq!(smp.regs.a, 0xAA);
        assert_eq!(smp.regs.s, 0xEF);
    }

    #[test]
    fn test_tset1_sets_bits_and_flags() {
        // MOV A,#$0F ; TSET1 $0240
        let mut program = [0u8; 0x60];
        program[0] = 0xE8;
        program[1] = 0x0F;
        program[2] = 0x0E;
        program[3] = 0x40;
        program[4] = 0x02;
        program[0x40] = 0xF0;
        let (mut smp, mut bus) = boot(&program);
        run(&mut smp, &mut bus, 2);
        assert_eq!(bus.aram[0x0240], 0xFF);
        // flags follow A - data = 0x0F - 0xF0
        assert!(!smp.regs.p.contains(Flags::Z));
    }
}
