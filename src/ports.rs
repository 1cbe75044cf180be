//! Resolved operand locations ("ports", `spec.md` §9 design notes).
//!
//! Operand resolution happens once per instruction, in `cpu.rs`'s decode
//! step. `[PN]` (indirect) and `[PN+imm8]` (indexed) both collapse into a
//! `Mem` port at resolution time, once the effective address has been
//! computed — the handler that later reads or writes the port never needs
//! to know which addressing mode produced it.

/// One of the CPU-visible hardware registers aliased onto peripherals
/// (`spec.md` §3 "Hardware registers").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwReg {
    Vx,
    Vy,
    Vm,
    Vl,
    Sa,
    Sf,
    Sv,
    Sw,
    Tt,
    Tm,
    Ts,
    Tc,
}

impl HwReg {
    /// `mode.rs`'s encoding for the one-byte hardware-register selector.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => HwReg::Vx,
            1 => HwReg::Vy,
            2 => HwReg::Vm,
            3 => HwReg::Vl,
            4 => HwReg::Sa,
            5 => HwReg::Sf,
            6 => HwReg::Sv,
            7 => HwReg::Sw,
            8 => HwReg::Tt,
            9 => HwReg::Tm,
            10 => HwReg::Ts,
            11 => HwReg::Tc,
            _ => return None,
        })
    }

    pub fn to_code(self) -> u8 {
        match self {
            HwReg::Vx => 0,
            HwReg::Vy => 1,
            HwReg::Vm => 2,
            HwReg::Vl => 3,
            HwReg::Sa => 4,
            HwReg::Sf => 5,
            HwReg::Sv => 6,
            HwReg::Sw => 7,
            HwReg::Tt => 8,
            HwReg::Tm => 9,
            HwReg::Ts => 10,
            HwReg::Tc => 11,
        }
    }

    /// True if this register is a 16-bit port; false if 8-bit.
    pub fn is_wide(self) -> bool {
        matches!(
            self,
            HwReg::Vx | HwReg::Vy | HwReg::Sa | HwReg::Sf | HwReg::Tt | HwReg::Tm
        )
    }
}

/// A resolved 8-bit operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port8 {
    Reg(usize),
    PHigh(usize),
    PLow(usize),
    Imm(u8),
    Mem(u16),
    Hw(HwReg),
}

/// A resolved 16-bit operand location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port16 {
    Reg(usize),
    Imm(u16),
    Mem(u16),
    Hw(HwReg),
}

impl Port8 {
    pub fn is_writable(self) -> bool {
        !matches!(self, Port8::Imm(_))
    }
}

impl Port16 {
    pub fn is_writable(self) -> bool {
        !matches!(self, Port16::Imm(_))
    }
}
