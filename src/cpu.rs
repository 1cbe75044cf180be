//! Fetch-decode-execute engine (`spec.md` §4.2).
//!
//! `Cpu` owns only the register file. Each `step()` call borrows the other
//! components explicitly through a [`Bus`] — no shared ownership, no
//! interior mutability, no unsafe aliasing.

use log::{trace, warn};
use rand::Rng;

use crate::errors::EmuError;
use crate::errors::StepResult;
use crate::graphics::Graphics;
use crate::interrupts::{InterruptController, Vector};
use crate::keyboard::Keyboard;
use crate::memory::{Memory, VECTOR_TABLE_BASE};
use crate::opcode::{self, Encoding, OperandMode};
use crate::ports::{HwReg, Port8, Port16};
use crate::registers::{Flags, Registers};
use crate::sound::Sound;
use crate::timer::Timer;

/// A borrow of every peripheral `Cpu::step` needs, gathered so the long
/// instruction match below doesn't pass six parameters at every call site.
pub struct Bus<'a> {
    pub mem: &'a mut Memory,
    pub gfx: &'a mut Graphics,
    pub snd: &'a mut Sound,
    pub kbd: &'a mut Keyboard,
    pub timer: &'a mut Timer,
    pub intc: &'a mut InterruptController,
}

#[derive(Debug, Default, Clone)]
pub struct Cpu {
    pub regs: Registers,
    halted: bool,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            halted: false,
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    fn fetch8(&mut self, mem: &Memory) -> u8 {
        let b = mem.read8(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        b
    }

    fn fetch16(&mut self, mem: &Memory) -> u16 {
        let w = mem.read16(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(2);
        w
    }

    /// Reads `n` operand mode nibbles from `ceil(n/2)` mode bytes (§6.2).
    /// Each byte's high nibble is the next operand's mode; for a
    /// one-operand instruction the low nibble of its single mode byte is
    /// unused padding.
    fn read_modes(&mut self, mem: &Memory, n: usize) -> Result<Vec<OperandMode>, EmuError> {
        let mut modes = Vec::with_capacity(n + 1);
        while modes.len() < n {
            let byte = self.fetch8(mem);
            let hi = OperandMode::from_nibble(byte >> 4).ok_or(EmuError::InvalidOperandMode {
                pc: self.regs.pc,
                mode: byte >> 4,
            })?;
            modes.push(hi);
            if modes.len() < n {
                let lo =
                    OperandMode::from_nibble(byte & 0xF).ok_or(EmuError::InvalidOperandMode {
                        pc: self.regs.pc,
                        mode: byte & 0xF,
                    })?;
                modes.push(lo);
            }
        }
        modes.truncate(n);
        Ok(modes)
    }

    fn check_byte_reg(&self, id: u8) -> Result<usize, EmuError> {
        if (id as usize) < crate::registers::NUM_BYTE_REGS {
            Ok(id as usize)
        } else {
            Err(EmuError::InvalidOperandMode {
                pc: self.regs.pc,
                mode: OperandMode::Reg as u8,
            })
        }
    }

    fn check_word_reg(&self, id: u8) -> Result<usize, EmuError> {
        if (id as usize) < crate::registers::NUM_WORD_REGS {
            Ok(id as usize)
        } else {
            Err(EmuError::InvalidOperandMode {
                pc: self.regs.pc,
                mode: OperandMode::Reg as u8,
            })
        }
    }

    fn resolve8(&mut self, mem: &Memory, mode: OperandMode) -> Result<Port8, EmuError> {
        Ok(match mode {
            OperandMode::Reg => {
                let id = self.fetch8(mem);
                Port8::Reg(self.check_byte_reg(id)?)
            }
            OperandMode::RegHigh => {
                let id = self.fetch8(mem);
                Port8::PHigh(self.check_word_reg(id)?)
            }
            OperandMode::RegLow => {
                let id = self.fetch8(mem);
                Port8::PLow(self.check_word_reg(id)?)
            }
            OperandMode::Imm => Port8::Imm(self.fetch8(mem)),
            OperandMode::DirectMem => Port8::Mem(self.fetch16(mem)),
            OperandMode::IndirectReg => {
                let id = self.fetch8(mem);
                let idx = self.check_word_reg(id)?;
                Port8::Mem(self.regs.p[idx])
            }
            OperandMode::IndexedReg => {
                let id = self.fetch8(mem);
                let idx = self.check_word_reg(id)?;
                let offset = self.fetch8(mem) as i8;
                Port8::Mem(self.regs.p[idx].wrapping_add(offset as i16 as u16))
            }
            OperandMode::HwReg => {
                let code = self.fetch8(mem);
                let hw = HwReg::from_code(code).ok_or(EmuError::InvalidOperandMode {
                    pc: self.regs.pc,
                    mode: code,
                })?;
                Port8::Hw(hw)
            }
        })
    }

    fn resolve16(&mut self, mem: &Memory, mode: OperandMode) -> Result<Port16, EmuError> {
        Ok(match mode {
            OperandMode::Reg => {
                let id = self.fetch8(mem);
                Port16::Reg(self.check_word_reg(id)?)
            }
            OperandMode::RegHigh | OperandMode::RegLow => {
                return Err(EmuError::InvalidOperandMode {
                    pc: self.regs.pc,
                    mode: mode as u8,
                });
            }
            OperandMode::Imm => Port16::Imm(self.fetch16(mem)),
            OperandMode::DirectMem => Port16::Mem(self.fetch16(mem)),
            OperandMode::IndirectReg => {
                let id = self.fetch8(mem);
                let idx = self.check_word_reg(id)?;
                Port16::Mem(self.regs.p[idx])
            }
            OperandMode::IndexedReg => {
                let id = self.fetch8(mem);
                let idx = self.check_word_reg(id)?;
                let offset = self.fetch8(mem) as i8;
                Port16::Mem(self.regs.p[idx].wrapping_add(offset as i16 as u16))
            }
            OperandMode::HwReg => {
                let code = self.fetch8(mem);
                let hw = HwReg::from_code(code).ok_or(EmuError::InvalidOperandMode {
                    pc: self.regs.pc,
                    mode: code,
                })?;
                Port16::Hw(hw)
            }
        })
    }

    fn read8(&self, bus: &Bus, port: Port8) -> u8 {
        match port {
            Port8::Reg(i) => self.regs.r[i],
            Port8::PHigh(i) => self.regs.p_high(i),
            Port8::PLow(i) => self.regs.p_low(i),
            Port8::Imm(v) => v,
            Port8::Mem(a) => bus.mem.read8(a),
            Port8::Hw(hw) => self.read_hw8(bus, hw),
        }
    }

    fn write8(&mut self, bus: &mut Bus, port: Port8, value: u8) {
        match port {
            Port8::Reg(i) => self.regs.r[i] = value,
            Port8::PHigh(i) => self.regs.set_p_high(i, value),
            Port8::PLow(i) => self.regs.set_p_low(i, value),
            Port8::Imm(_) => {}
            Port8::Mem(a) => bus.mem.write8(a, value),
            Port8::Hw(hw) => self.write_hw8(bus, hw, value),
        }
    }

    fn read16(&self, bus: &Bus, port: Port16) -> u16 {
        match port {
            Port16::Reg(i) => self.regs.p[i],
            Port16::Imm(v) => v,
            Port16::Mem(a) => bus.mem.read16(a),
            Port16::Hw(hw) => self.read_hw16(bus, hw),
        }
    }

    fn write16(&mut self, bus: &mut Bus, port: Port16, value: u16) {
        match port {
            Port16::Reg(i) => self.regs.p[i] = value,
            Port16::Imm(_) => {}
            Port16::Mem(a) => bus.mem.write16(a, value),
            Port16::Hw(hw) => self.write_hw16(bus, hw, value),
        }
    }

    fn read_hw8(&self, bus: &Bus, hw: HwReg) -> u8 {
        match hw {
            HwReg::Vm => bus.gfx.vm(),
            HwReg::Vl => bus.gfx.vl(),
            HwReg::Sv => bus.snd.sv(),
            HwReg::Sw => bus.snd.sw(),
            HwReg::Ts => bus.timer.ts(),
            HwReg::Tc => bus.timer.tc(),
            _ => 0,
        }
    }

    fn write_hw8(&self, bus: &mut Bus, hw: HwReg, value: u8) {
        match hw {
            HwReg::Vm => bus.gfx.set_vm(value),
            HwReg::Vl => bus.gfx.set_vl(value),
            HwReg::Sv => bus.snd.set_sv(value),
            HwReg::Sw => bus.snd.set_sw(value),
            HwReg::Ts => bus.timer.set_ts(value),
            HwReg::Tc => bus.timer.set_tc(value),
            _ => {}
        }
    }

    fn read_hw16(&self, bus: &Bus, hw: HwReg) -> u16 {
        match hw {
            HwReg::Vx => bus.gfx.vx(),
            HwReg::Vy => bus.gfx.vy(),
            HwReg::Sa => bus.snd.sa(),
            HwReg::Sf => bus.snd.sf(),
            HwReg::Tt => bus.timer.tt(),
            HwReg::Tm => bus.timer.tm(),
            _ => 0,
        }
    }

    fn write_hw16(&self, bus: &mut Bus, hw: HwReg, value: u16) {
        match hw {
            HwReg::Vx => bus.gfx.set_vx(value),
            HwReg::Vy => bus.gfx.set_vy(value),
            HwReg::Sa => bus.snd.set_sa(value),
            HwReg::Sf => bus.snd.set_sf(value),
            HwReg::Tt => bus.timer.set_tt(value),
            HwReg::Tm => bus.timer.set_tm(value),
            _ => {}
        }
    }

    fn push8(&mut self, mem: &mut Memory, value: u8) -> Result<(), EmuError> {
        let sp = self.regs.sp();
        if sp == 0 {
            return Err(EmuError::StackOverflow);
        }
        let new_sp = sp - 1;
        mem.write8(new_sp, value);
        self.regs.set_sp(new_sp);
        Ok(())
    }

    fn push16(&mut self, mem: &mut Memory, value: u16) -> Result<(), EmuError> {
        let sp = self.regs.sp();
        if sp < 2 {
            return Err(EmuError::StackOverflow);
        }
        let new_sp = sp - 2;
        mem.write16(new_sp, value);
        self.regs.set_sp(new_sp);
        Ok(())
    }

    fn pop8(&mut self, mem: &Memory) -> Result<u8, EmuError> {
        let sp = self.regs.sp();
        if 0xFFFFu32 - sp as u32 < 1 {
            return Err(EmuError::StackUnderflow);
        }
        let value = mem.read8(sp);
        self.regs.set_sp(sp + 1);
        Ok(value)
    }

    fn pop16(&mut self, mem: &Memory) -> Result<u16, EmuError> {
        let sp = self.regs.sp();
        if 0xFFFFu32 - sp as u32 < 2 {
            return Err(EmuError::StackUnderflow);
        }
        let value = mem.read16(sp);
        self.regs.set_sp(sp + 2);
        Ok(value)
    }

    /// Executes one instruction, or services a pending interrupt if one is
    /// ready (`spec.md` §4.2.1). Never advances past a halted CPU.
    pub fn step(&mut self, bus: &mut Bus) -> StepResult {
        if self.halted {
            return StepResult::Halted;
        }

        if self.regs.flags.contains(Flags::INTERRUPT) {
            if let Some(vector) = bus.intc.highest_priority() {
                return self.service_interrupt(bus, vector);
            }
        }

        let start_pc = self.regs.pc;
        match self.execute_one(bus) {
            Ok(cycles) => {
                bus.timer.tick(cycles, bus.intc);
                StepResult::Ok { cycles }
            }
            Err(kind) => {
                self.regs.pc = start_pc;
                StepResult::Fault { kind, pc: start_pc }
            }
        }
    }

    fn service_interrupt(&mut self, bus: &mut Bus, vector: u8) -> StepResult {
        if let Err(kind) = self.push16(bus.mem, self.regs.pc) {
            return StepResult::Fault {
                kind,
                pc: self.regs.pc,
            };
        }
        if let Err(kind) = self.push8(bus.mem, self.regs.flags.bits()) {
            return StepResult::Fault {
                kind,
                pc: self.regs.pc,
            };
        }
        self.regs.flags.remove(Flags::INTERRUPT);
        let vector_addr = VECTOR_TABLE_BASE + vector as u16 * 4;
        self.regs.pc = bus.mem.read16(vector_addr);
        bus.intc.acknowledge(vector);
        if vector == Vector::Keyboard as u8 {
            bus.kbd.acknowledge_irq();
        }
        bus.timer.tick(12, bus.intc);
        StepResult::Ok { cycles: 12 }
    }

    fn execute_one(&mut self, bus: &mut Bus) -> Result<u32, EmuError> {
        let pc_at_fetch = self.regs.pc;
        let opcode_byte = self.fetch8(bus.mem);
        let info = opcode::lookup(opcode_byte).ok_or(EmuError::InvalidOpcode {
            pc: pc_at_fetch,
            byte: opcode_byte,
        })?;
        trace!("{:#06x}: {} ({:#04x})", pc_at_fetch, info.mnemonic, opcode_byte);

        self.dispatch(bus, opcode_byte, info.encoding)?;
        Ok(info.cycles)
    }

    fn dispatch(&mut self, bus: &mut Bus, opcode: u8, encoding: Encoding) -> Result<(), EmuError> {
        use Encoding::*;

        match opcode {
            0x00 => Ok(()), // NOP

            0x01 => self.op_mov8(bus),
            0x02 => self.op_mov16(bus),
            0x03 => self.op_push8(bus),
            0x04 => self.op_push16(bus),
            0x05 => self.op_pop8(bus),
            0x06 => self.op_pop16(bus),
            0x07 => self.op_add8(bus),
            0x08 => self.op_add16(bus),
            0x09 => self.op_sub8(bus),
            0x0A => self.op_sub16(bus),
            0x0B => self.op_mul8(bus),
            0x0C => self.op_mul16(bus),
            0x0D => self.op_div8(bus),
            0x0E => self.op_div16(bus),
            0x0F => self.op_mod8(bus),
            0x10 => self.op_mod16(bus),
            0x11 => self.op_inc8(bus),
            0x12 => self.op_inc16(bus),
            0x13 => self.op_dec8(bus),
            0x14 => self.op_dec16(bus),
            0x15 => self.op_neg8(bus),
            0x16 => self.op_neg16(bus),
            0x17 => self.op_cmp8(bus),
            0x18 => self.op_cmp16(bus),

            0x40 => self.op_and8(bus),
            0x41 => self.op_and16(bus),
            0x42 => self.op_or8(bus),
            0x43 => self.op_or16(bus),
            0x44 => self.op_xor8(bus),
            0x45 => self.op_xor16(bus),
            0x46 => self.op_not8(bus),
            0x47 => self.op_not16(bus),
            0x48 => self.op_shl8(bus),
            0x49 => self.op_shl16(bus),
            0x4A => self.op_shr8(bus),
            0x4B => self.op_shr16(bus),
            0x4C => self.op_rol8(bus),
            0x4D => self.op_rol16(bus),
            0x4E => self.op_ror8(bus),
            0x4F => self.op_ror16(bus),

            0x60 => {
                let target = self.fetch16(bus.mem);
                self.regs.pc = target;
                Ok(())
            }
            0x61 => {
                let target = self.fetch16(bus.mem);
                self.push16(bus.mem, self.regs.pc)?;
                self.regs.pc = target;
                Ok(())
            }
            0x62 => {
                let target = self.pop16(bus.mem)?;
                self.regs.pc = target;
                Ok(())
            }
            0x63 => {
                let flags = self.pop8(bus.mem)?;
                let pc = self.pop16(bus.mem)?;
                self.regs.flags = Flags::from_bits_truncate(flags);
                self.regs.flags.insert(Flags::INTERRUPT);
                self.regs.pc = pc;
                Ok(())
            }
            0x64 => {
                self.halted = true;
                Ok(())
            }
            0x65 => {
                self.regs.flags.insert(Flags::INTERRUPT);
                Ok(())
            }
            0x66 => {
                self.regs.flags.remove(Flags::INTERRUPT);
                Ok(())
            }
            0x67..=0x74 => self.op_conditional_jump(bus, opcode),

            0x80 => self.op_keyin(bus),
            0x81 => self.op_keystat(bus),
            0x82 => self.op_keycount(bus),
            0x83 => {
                bus.kbd.clear();
                Ok(())
            }
            0x84 | 0x85 => self.op_keyctrl(bus, encoding),

            0x86 => self.op_swrite(bus),
            0x87 => self.op_sread(bus),
            0x88 => self.op_srolx(bus),
            0x89 => self.op_sroly(bus),
            0x8A => {
                bus.gfx.flip_x();
                Ok(())
            }
            0x8B => {
                bus.gfx.flip_y();
                Ok(())
            }
            0x8C => {
                bus.gfx.rotate_left();
                Ok(())
            }
            0x8D => {
                bus.gfx.rotate_right();
                Ok(())
            }
            0x8E => self.op_text(bus),
            0x8F => {
                bus.snd.play();
                Ok(())
            }
            0x90 => {
                bus.snd.stop();
                Ok(())
            }
            0x91 => self.op_rnd(bus),
            0x92 => self.op_rndr8(bus),
            0x93 => self.op_rndr16(bus),
            0x94 | 0x95 => self.op_spblit(bus, encoding),
            0x96 => bus.gfx.blit_all_sprites(bus.mem),

            _ => unreachable!("opcode {opcode:#04x} missing from dispatch but present in table"),
        }
    }

    fn set_logic_flags8(&mut self, result: u8) {
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x80 != 0);
        self.regs.flags.remove(Flags::CARRY);
        self.regs.flags.remove(Flags::OVERFLOW);
    }

    fn set_logic_flags16(&mut self, result: u16) {
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x8000 != 0);
        self.regs.flags.remove(Flags::CARRY);
        self.regs.flags.remove(Flags::OVERFLOW);
    }

    fn op_mov8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let v = self.read8(bus, src);
        self.write8(bus, dst, v);
        Ok(())
    }

    fn op_mov16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let v = self.read16(bus, src);
        self.write16(bus, dst, v);
        Ok(())
    }

    fn op_push8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let src = self.resolve8(bus.mem, modes[0])?;
        let v = self.read8(bus, src);
        self.push8(bus.mem, v)
    }

    fn op_push16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let src = self.resolve16(bus.mem, modes[0])?;
        let v = self.read16(bus, src);
        self.push16(bus.mem, v)
    }

    fn op_pop8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let v = self.pop8(bus.mem)?;
        self.write8(bus, dst, v);
        Ok(())
    }

    fn op_pop16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let v = self.pop16(bus.mem)?;
        self.write16(bus, dst, v);
        Ok(())
    }

    fn op_add8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let a = self.read8(bus, dst);
        let b = self.read8(bus, src);
        let (result, carry) = a.overflowing_add(b);
        let (_, overflow) = (a as i8).overflowing_add(b as i8);
        self.write8(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x80 != 0);
        self.regs.flags.set(Flags::CARRY, carry);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_add16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let a = self.read16(bus, dst);
        let b = self.read16(bus, src);
        let (result, carry) = a.overflowing_add(b);
        let (_, overflow) = (a as i16).overflowing_add(b as i16);
        self.write16(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x8000 != 0);
        self.regs.flags.set(Flags::CARRY, carry);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_sub8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let a = self.read8(bus, dst);
        let b = self.read8(bus, src);
        let (result, borrow) = a.overflowing_sub(b);
        let (_, overflow) = (a as i8).overflowing_sub(b as i8);
        self.write8(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x80 != 0);
        self.regs.flags.set(Flags::CARRY, borrow);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_sub16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let a = self.read16(bus, dst);
        let b = self.read16(bus, src);
        let (result, borrow) = a.overflowing_sub(b);
        let (_, overflow) = (a as i16).overflowing_sub(b as i16);
        self.write16(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x8000 != 0);
        self.regs.flags.set(Flags::CARRY, borrow);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_mul8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let a = self.read8(bus, dst) as i8 as i32;
        let b = self.read8(bus, src) as i8 as i32;
        let product = a * b;
        let truncated = product as i8;
        let overflow = product != truncated as i32;
        self.write8(bus, dst, truncated as u8);
        self.regs.flags.set(Flags::ZERO, truncated == 0);
        self.regs.flags.set(Flags::SIGN, truncated < 0);
        self.regs.flags.remove(Flags::CARRY);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_mul16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let a = self.read16(bus, dst) as i16 as i64;
        let b = self.read16(bus, src) as i16 as i64;
        let product = a * b;
        let truncated = product as i16;
        let overflow = product != truncated as i64;
        self.write16(bus, dst, truncated as u16);
        self.regs.flags.set(Flags::ZERO, truncated == 0);
        self.regs.flags.set(Flags::SIGN, truncated < 0);
        self.regs.flags.remove(Flags::CARRY);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_div8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let a = self.read8(bus, dst) as i8;
        let b = self.read8(bus, src) as i8;
        if b == 0 {
            warn!("DIV8 by zero at pc={:#06x}, recovering with result 0", self.regs.pc);
            self.regs.divide_fault = true;
            self.write8(bus, dst, 0);
            self.set_logic_flags8(0);
            return Ok(());
        }
        let result = a.wrapping_div(b) as u8;
        self.write8(bus, dst, result);
        self.set_logic_flags8(result);
        Ok(())
    }

    fn op_div16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let a = self.read16(bus, dst) as i16;
        let b = self.read16(bus, src) as i16;
        if b == 0 {
            warn!("DIV16 by zero at pc={:#06x}, recovering with result 0", self.regs.pc);
            self.regs.divide_fault = true;
            self.write16(bus, dst, 0);
            self.set_logic_flags16(0);
            return Ok(());
        }
        let result = a.wrapping_div(b) as u16;
        self.write16(bus, dst, result);
        self.set_logic_flags16(result);
        Ok(())
    }

    fn op_mod8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let a = self.read8(bus, dst) as i8;
        let b = self.read8(bus, src) as i8;
        if b == 0 {
            warn!("MOD8 by zero at pc={:#06x}, recovering with result 0", self.regs.pc);
            self.regs.divide_fault = true;
            self.write8(bus, dst, 0);
            self.set_logic_flags8(0);
            return Ok(());
        }
        let result = a.wrapping_rem(b) as u8;
        self.write8(bus, dst, result);
        self.set_logic_flags8(result);
        Ok(())
    }

    fn op_mod16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let a = self.read16(bus, dst) as i16;
        let b = self.read16(bus, src) as i16;
        if b == 0 {
            warn!("MOD16 by zero at pc={:#06x}, recovering with result 0", self.regs.pc);
            self.regs.divide_fault = true;
            self.write16(bus, dst, 0);
            self.set_logic_flags16(0);
            return Ok(());
        }
        let result = a.wrapping_rem(b) as u16;
        self.write16(bus, dst, result);
        self.set_logic_flags16(result);
        Ok(())
    }

    fn op_inc8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let a = self.read8(bus, dst);
        let (result, _) = a.overflowing_add(1);
        let (_, overflow) = (a as i8).overflowing_add(1);
        self.write8(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x80 != 0);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_inc16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let a = self.read16(bus, dst);
        let (result, _) = a.overflowing_add(1);
        let (_, overflow) = (a as i16).overflowing_add(1);
        self.write16(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x8000 != 0);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_dec8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let a = self.read8(bus, dst);
        let (result, _) = a.overflowing_sub(1);
        let (_, overflow) = (a as i8).overflowing_sub(1);
        self.write8(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x80 != 0);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_dec16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let a = self.read16(bus, dst);
        let (result, _) = a.overflowing_sub(1);
        let (_, overflow) = (a as i16).overflowing_sub(1);
        self.write16(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x8000 != 0);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_neg8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let a = self.read8(bus, dst);
        let (result, borrow) = 0u8.overflowing_sub(a);
        let (_, overflow) = 0i8.overflowing_sub(a as i8);
        self.write8(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x80 != 0);
        self.regs.flags.set(Flags::CARRY, borrow);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_neg16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let a = self.read16(bus, dst);
        let (result, borrow) = 0u16.overflowing_sub(a);
        let (_, overflow) = 0i16.overflowing_sub(a as i16);
        self.write16(bus, dst, result);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x8000 != 0);
        self.regs.flags.set(Flags::CARRY, borrow);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_cmp8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let a_port = self.resolve8(bus.mem, modes[0])?;
        let b_port = self.resolve8(bus.mem, modes[1])?;
        let a = self.read8(bus, a_port);
        let b = self.read8(bus, b_port);
        let (result, borrow) = a.overflowing_sub(b);
        let (_, overflow) = (a as i8).overflowing_sub(b as i8);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x80 != 0);
        self.regs.flags.set(Flags::CARRY, borrow);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_cmp16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let a_port = self.resolve16(bus.mem, modes[0])?;
        let b_port = self.resolve16(bus.mem, modes[1])?;
        let a = self.read16(bus, a_port);
        let b = self.read16(bus, b_port);
        let (result, borrow) = a.overflowing_sub(b);
        let (_, overflow) = (a as i16).overflowing_sub(b as i16);
        self.regs.flags.set(Flags::ZERO, result == 0);
        self.regs.flags.set(Flags::SIGN, result & 0x8000 != 0);
        self.regs.flags.set(Flags::CARRY, borrow);
        self.regs.flags.set(Flags::OVERFLOW, overflow);
        Ok(())
    }

    fn op_and8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let result = self.read8(bus, dst) & self.read8(bus, src);
        self.write8(bus, dst, result);
        self.set_logic_flags8(result);
        Ok(())
    }

    fn op_and16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let result = self.read16(bus, dst) & self.read16(bus, src);
        self.write16(bus, dst, result);
        self.set_logic_flags16(result);
        Ok(())
    }

    fn op_or8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let result = self.read8(bus, dst) | self.read8(bus, src);
        self.write8(bus, dst, result);
        self.set_logic_flags8(result);
        Ok(())
    }

    fn op_or16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let result = self.read16(bus, dst) | self.read16(bus, src);
        self.write16(bus, dst, result);
        self.set_logic_flags16(result);
        Ok(())
    }

    fn op_xor8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let src = self.resolve8(bus.mem, modes[1])?;
        let result = self.read8(bus, dst) ^ self.read8(bus, src);
        self.write8(bus, dst, result);
        self.set_logic_flags8(result);
        Ok(())
    }

    fn op_xor16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let src = self.resolve16(bus.mem, modes[1])?;
        let result = self.read16(bus, dst) ^ self.read16(bus, src);
        self.write16(bus, dst, result);
        self.set_logic_flags16(result);
        Ok(())
    }

    fn op_not8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let result = !self.read8(bus, dst);
        self.write8(bus, dst, result);
        self.set_logic_flags8(result);
        Ok(())
    }

    fn op_not16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let result = !self.read16(bus, dst);
        self.write16(bus, dst, result);
        self.set_logic_flags16(result);
        Ok(())
    }

    fn op_shl8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount);
        let mut value = self.read8(bus, dst);
        let mut carry = self.regs.flags.contains(Flags::CARRY);
        for _ in 0..count {
            carry = value & 0x80 != 0;
            value <<= 1;
        }
        self.write8(bus, dst, value);
        self.set_logic_flags8(value);
        self.regs.flags.set(Flags::CARRY, carry);
        Ok(())
    }

    fn op_shl16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount);
        let mut value = self.read16(bus, dst);
        let mut carry = self.regs.flags.contains(Flags::CARRY);
        for _ in 0..count {
            carry = value & 0x8000 != 0;
            value <<= 1;
        }
        self.write16(bus, dst, value);
        self.set_logic_flags16(value);
        self.regs.flags.set(Flags::CARRY, carry);
        Ok(())
    }

    fn op_shr8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount);
        let mut value = self.read8(bus, dst);
        let mut carry = self.regs.flags.contains(Flags::CARRY);
        for _ in 0..count {
            carry = value & 0x01 != 0;
            value >>= 1;
        }
        self.write8(bus, dst, value);
        self.set_logic_flags8(value);
        self.regs.flags.set(Flags::CARRY, carry);
        Ok(())
    }

    fn op_shr16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount);
        let mut value = self.read16(bus, dst);
        let mut carry = self.regs.flags.contains(Flags::CARRY);
        for _ in 0..count {
            carry = value & 0x0001 != 0;
            value >>= 1;
        }
        self.write16(bus, dst, value);
        self.set_logic_flags16(value);
        self.regs.flags.set(Flags::CARRY, carry);
        Ok(())
    }

    fn op_rol8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount) % 8;
        let value = self.read8(bus, dst).rotate_left(count as u32);
        self.write8(bus, dst, value);
        self.set_logic_flags8(value);
        self.regs.flags.set(Flags::CARRY, value & 0x01 != 0);
        Ok(())
    }

    fn op_rol16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount) % 16;
        let value = self.read16(bus, dst).rotate_left(count as u32);
        self.write16(bus, dst, value);
        self.set_logic_flags16(value);
        self.regs.flags.set(Flags::CARRY, value & 0x0001 != 0);
        Ok(())
    }

    fn op_ror8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount) % 8;
        let value = self.read8(bus, dst).rotate_right(count as u32);
        self.write8(bus, dst, value);
        self.set_logic_flags8(value);
        self.regs.flags.set(Flags::CARRY, value & 0x80 != 0);
        Ok(())
    }

    fn op_ror16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let amount = self.resolve8(bus.mem, modes[1])?;
        let count = self.read8(bus, amount) % 16;
        let value = self.read16(bus, dst).rotate_right(count as u32);
        self.write16(bus, dst, value);
        self.set_logic_flags16(value);
        self.regs.flags.set(Flags::CARRY, value & 0x8000 != 0);
        Ok(())
    }

    fn op_conditional_jump(&mut self, bus: &mut Bus, opcode: u8) -> Result<(), EmuError> {
        let target = self.fetch16(bus.mem);
        let f = &self.regs.flags;
        let take = match opcode {
            0x67 => f.contains(Flags::ZERO),                              // JZ
            0x68 => !f.contains(Flags::ZERO),                             // JNZ
            0x69 => f.contains(Flags::CARRY),                             // JC
            0x6A => !f.contains(Flags::CARRY),                            // JNC
            0x6B => f.contains(Flags::SIGN),                              // JS
            0x6C => !f.contains(Flags::SIGN),                             // JNS
            0x6D => f.contains(Flags::OVERFLOW),                         // JO
            0x6E => !f.contains(Flags::OVERFLOW),                        // JNO
            0x6F => f.contains(Flags::ZERO),                              // JEQ
            0x70 => !f.contains(Flags::ZERO),                             // JNE
            0x71 => f.contains(Flags::SIGN) != f.contains(Flags::OVERFLOW), // JLT
            0x72 => {
                f.contains(Flags::ZERO) || f.contains(Flags::SIGN) != f.contains(Flags::OVERFLOW)
            } // JLE
            0x73 => {
                !f.contains(Flags::ZERO) && f.contains(Flags::SIGN) == f.contains(Flags::OVERFLOW)
            } // JGT
            0x74 => f.contains(Flags::SIGN) == f.contains(Flags::OVERFLOW), // JGE
            _ => unreachable!(),
        };
        if take {
            self.regs.pc = target;
        }
        Ok(())
    }

    fn op_keyin(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let code = bus.kbd.pop();
        self.write8(bus, dst, code);
        self.regs.flags.set(Flags::ZERO, code == 0);
        Ok(())
    }

    fn op_keystat(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let status = bus.kbd.status();
        self.write8(bus, dst, status);
        Ok(())
    }

    fn op_keycount(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let count = bus.kbd.count();
        self.write8(bus, dst, count);
        Ok(())
    }

    fn op_keyctrl(&mut self, bus: &mut Bus, encoding: Encoding) -> Result<(), EmuError> {
        let value = self.fixed_operand_value(bus, encoding)?;
        bus.kbd.set_control(value);
        Ok(())
    }

    fn op_spblit(&mut self, bus: &mut Bus, encoding: Encoding) -> Result<(), EmuError> {
        let id = self.fixed_operand_value(bus, encoding)?;
        bus.gfx.blit_sprite(bus.mem, id)
    }

    /// Shared decode for `FixedReg`/`FixedImm` opcodes (`KEYCTRL`, `SPBLIT`).
    fn fixed_operand_value(&mut self, bus: &mut Bus, encoding: Encoding) -> Result<u8, EmuError> {
        match encoding {
            Encoding::FixedReg => {
                let reg_id = self.fetch8(bus.mem);
                let idx = self.check_byte_reg(reg_id)?;
                Ok(self.regs.r[idx])
            }
            Encoding::FixedImm => Ok(self.fetch8(bus.mem)),
            _ => unreachable!("fixed_operand_value called with non-fixed encoding"),
        }
    }

    fn op_swrite(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let src = self.resolve8(bus.mem, modes[0])?;
        let v = self.read8(bus, src);
        bus.gfx.write(v);
        Ok(())
    }

    fn op_sread(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let v = bus.gfx.read();
        self.write8(bus, dst, v);
        Ok(())
    }

    fn op_srolx(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let amount = self.resolve8(bus.mem, modes[0])?;
        let dx = self.read8(bus, amount) as i8;
        bus.gfx.scroll_x(dx);
        Ok(())
    }

    fn op_sroly(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let amount = self.resolve8(bus.mem, modes[0])?;
        let dy = self.read8(bus, amount) as i8;
        bus.gfx.scroll_y(dy);
        Ok(())
    }

    fn op_text(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 2)?;
        let addr_port = self.resolve16(bus.mem, modes[0])?;
        let color_port = self.resolve8(bus.mem, modes[1])?;
        let addr = self.read16(bus, addr_port);
        let color = self.read8(bus, color_port);
        bus.gfx.draw_text(bus.mem, addr, color);
        Ok(())
    }

    fn op_rnd(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 1)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let value: u16 = rand::thread_rng().gen();
        self.write16(bus, dst, value);
        Ok(())
    }

    fn op_rndr8(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 3)?;
        let dst = self.resolve8(bus.mem, modes[0])?;
        let lo_port = self.resolve8(bus.mem, modes[1])?;
        let hi_port = self.resolve8(bus.mem, modes[2])?;
        let lo = self.read8(bus, lo_port);
        let hi = self.read8(bus, hi_port);
        if lo > hi {
            return Err(EmuError::InvalidRange {
                lo: lo as u16,
                hi: hi as u16,
            });
        }
        let value = rand::thread_rng().gen_range(lo..=hi);
        self.write8(bus, dst, value);
        Ok(())
    }

    fn op_rndr16(&mut self, bus: &mut Bus) -> Result<(), EmuError> {
        let modes = self.read_modes(bus.mem, 3)?;
        let dst = self.resolve16(bus.mem, modes[0])?;
        let lo_port = self.resolve16(bus.mem, modes[1])?;
        let hi_port = self.resolve16(bus.mem, modes[2])?;
        let lo = self.read16(bus, lo_port);
        let hi = self.read16(bus, hi_port);
        if lo > hi {
            return Err(EmuError::InvalidRange { lo, hi });
        }
        let value = rand::thread_rng().gen_range(lo..=hi);
        self.write16(bus, dst, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        cpu: Cpu,
        mem: Memory,
        gfx: Graphics,
        snd: Sound,
        kbd: Keyboard,
        timer: Timer,
        intc: InterruptController,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                cpu: Cpu::new(),
                mem: Memory::new(),
                gfx: Graphics::new(),
                snd: Sound::new(),
                kbd: Keyboard::new(),
                timer: Timer::new(),
                intc: InterruptController::new(),
            }
        }

        fn bus(&mut self) -> Bus<'_> {
            Bus {
                mem: &mut self.mem,
                gfx: &mut self.gfx,
                snd: &mut self.snd,
                kbd: &mut self.kbd,
                timer: &mut self.timer,
                intc: &mut self.intc,
            }
        }

        fn load(&mut self, bytes: &[u8], origin: u16) {
            self.mem.load_image(bytes, origin).unwrap();
            self.cpu.regs.pc = origin;
        }

        fn step(&mut self) -> StepResult {
            let mut bus = self.bus();
            self.cpu.step(&mut bus)
        }

        fn run_until_halt(&mut self, max: usize) -> usize {
            let mut n = 0;
            for _ in 0..max {
                match self.step() {
                    StepResult::Halted => return n,
                    StepResult::Fault { kind, pc } => panic!("fault {kind:?} at {pc:#x}"),
                    StepResult::Ok { .. } => n += 1,
                }
            }
            panic!("did not halt within {max} steps");
        }
    }

    /// Mode byte helper: two operands packed into one byte.
    fn modes2(a: OperandMode, b: OperandMode) -> u8 {
        ((a as u8) << 4) | (b as u8)
    }

    /// Mode byte helper: a single operand occupies the high nibble (the
    /// low nibble is unused padding for one-operand instructions).
    fn modes1(a: OperandMode) -> u8 {
        (a as u8) << 4
    }

    #[test]
    fn scenario_add_two_constants() {
        let mut h = Harness::new();
        // MOV P0, 5 ; MOV P1, 3 ; ADD P0, P1 ; HLT
        let prog = [
            0x02, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0, 5, // MOV P0, 5
            0x02, modes2(OperandMode::Reg, OperandMode::Imm), 1, 0, 3, // MOV P1, 3
            0x08, modes2(OperandMode::Reg, OperandMode::Reg), 0, 1, // ADD P0, P1
            0x64, // HLT
        ];
        h.load(&prog, 0x1000);
        h.run_until_halt(10);
        assert_eq!(h.cpu.regs.p[0], 8);
        assert!(!h.cpu.regs.flags.contains(Flags::ZERO));
        assert!(!h.cpu.regs.flags.contains(Flags::CARRY));
        assert!(h.cpu.halted());
    }

    #[test]
    fn scenario_loop_count() {
        let mut h = Harness::new();
        // MOV P0, 10 ; loop: DEC P0 ; JNZ loop ; HLT
        let prog = [
            0x02, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0, 10, // MOV P0,10 (5 bytes)
            0x14, modes1(OperandMode::Reg), 0, // loop: DEC P0 (3 bytes, at 0x1005)
            0x68, 0x10, 0x05, // JNZ loop (3 bytes)
            0x64,
        ];
        h.load(&prog, 0x1000);
        let steps = h.run_until_halt(100);
        assert_eq!(h.cpu.regs.p[0], 0);
        assert!(h.cpu.regs.flags.contains(Flags::ZERO));
        assert_eq!(steps, 1 + 10 * 2 + 1);
    }

    #[test]
    fn scenario_divide_by_zero_recovers() {
        let mut h = Harness::new();
        let prog = [
            0x02, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0, 10, // MOV P0,10
            0x02, modes2(OperandMode::Reg, OperandMode::Imm), 1, 0, 0, // MOV P1,0
            0x0E, modes2(OperandMode::Reg, OperandMode::Reg), 0, 1, // DIV P0,P1
            0x02, modes2(OperandMode::Reg, OperandMode::Imm), 2, 0, 7, // MOV P2,7
            0x64,
        ];
        h.load(&prog, 0x1000);
        h.run_until_halt(10);
        assert_eq!(h.cpu.regs.p[0], 0);
        assert!(h.cpu.regs.divide_fault);
        assert_eq!(h.cpu.regs.p[2], 7);
    }

    #[test]
    fn call_and_return_restores_pc_and_sp() {
        let mut h = Harness::new();
        // CALL sub ; HLT ; sub: RET
        let prog = [0x61, 0x10, 0x04, 0x64, 0x62];
        h.load(&prog, 0x1000);
        let sp_before = h.cpu.regs.sp();
        // step CALL
        assert!(matches!(h.step(), StepResult::Ok { .. }));
        assert_eq!(h.cpu.regs.pc, 0x1004);
        // step RET
        assert!(matches!(h.step(), StepResult::Ok { .. }));
        assert_eq!(h.cpu.regs.pc, 0x1003);
        assert_eq!(h.cpu.regs.sp(), sp_before);
    }

    #[test]
    fn keyboard_interrupt_runs_handler() {
        let mut h = Harness::new();
        // handler at 0x2000: KEYIN R0 ; IRET
        let handler = [0x80, modes1(OperandMode::Reg), 0, 0x63];
        h.mem.load_image(&handler, 0x2000).unwrap();
        h.mem.write16(crate::memory::VECTOR_TABLE_BASE + 4, 0x2000);

        // main: KEYCTRL imm 1 ; STI ; HLT
        let prog = [0x85, 0x01, 0x65, 0x64];
        h.load(&prog, 0x1000);

        assert!(matches!(h.step(), StepResult::Ok { .. })); // KEYCTRL
        assert!(matches!(h.step(), StepResult::Ok { .. })); // STI
        assert!(h.cpu.regs.flags.contains(Flags::INTERRUPT));

        {
            let mut bus = h.bus();
            bus.kbd.press_key(0x41, bus.intc);
        }

        assert!(matches!(h.step(), StepResult::Ok { cycles: 12 })); // interrupt entry
        assert!(matches!(h.step(), StepResult::Ok { .. })); // KEYIN
        assert_eq!(h.cpu.regs.r[0], 0x41);
        assert!(matches!(h.step(), StepResult::Ok { .. })); // IRET
        assert!(h.cpu.regs.flags.contains(Flags::INTERRUPT));
        assert_eq!(h.kbd.count(), 0);
    }

    #[test]
    fn invalid_opcode_holds_pc() {
        let mut h = Harness::new();
        h.load(&[0xFF], 0x1000);
        match h.step() {
            StepResult::Fault {
                kind: EmuError::InvalidOpcode { byte: 0xFF, .. },
                pc,
            } => assert_eq!(pc, 0x1000),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(h.cpu.regs.pc, 0x1000);
    }

    #[test]
    fn cmp_sets_exactly_zscv() {
        let mut h = Harness::new();
        let prog = [0x17, modes2(OperandMode::Imm, OperandMode::Imm), 5, 5, 0x64];
        h.load(&prog, 0x1000);
        h.step();
        assert!(h.cpu.regs.flags.contains(Flags::ZERO));
        assert!(!h.cpu.regs.flags.contains(Flags::SIGN));
        assert!(!h.cpu.regs.flags.contains(Flags::CARRY));
        assert!(!h.cpu.regs.flags.contains(Flags::OVERFLOW));
    }

    #[test]
    fn halted_cpu_ignores_further_steps() {
        let mut h = Harness::new();
        h.load(&[0x64], 0x1000);
        h.step();
        assert!(matches!(h.step(), StepResult::Halted));
    }
}
