//! The opcode table: the single source of truth mapping an opcode byte to a
//! mnemonic, its operand encoding and its cycle cost (`spec.md` §6.2, §9).
//!
//! `cpu.rs`'s decoder and `disasm.rs`'s listing both call [`lookup`] — there
//! is no second copy of this table anywhere else in the crate.

/// Width of an operand resolved through the generic mode-byte encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W8,
    W16,
}

/// How an instruction's operand bytes are laid out after the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// No operand bytes at all (`HLT`, `RET`, `SFLIPX`, ...).
    None,
    /// A single 2-byte absolute address with no mode byte — control-transfer
    /// targets are always direct per `spec.md` §4.2.2.
    DirectAddress,
    /// One mode byte per two operands (nibble-packed), then each operand's
    /// value bytes in order. `Width` entries give the operand count and
    /// individual widths.
    Modes(&'static [Width]),
    /// A single register id byte, no mode byte — used where the ISA commits
    /// to "always a register" at the opcode level (`KEYCTRL reg`, `SPBLIT
    /// reg`).
    FixedReg,
    /// A single immediate byte, no mode byte (`KEYCTRL imm`, `SPBLIT imm`).
    FixedImm,
}

impl Encoding {
    pub fn operand_count(self) -> usize {
        match self {
            Encoding::None => 0,
            Encoding::DirectAddress => 1,
            Encoding::Modes(w) => w.len(),
            Encoding::FixedReg => 1,
            Encoding::FixedImm => 1,
        }
    }

    /// Number of mode bytes (nibble-packed, two operands per byte).
    pub fn mode_byte_count(self) -> usize {
        match self {
            Encoding::Modes(w) => w.len().div_ceil(2),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub opcode: u8,
    pub mnemonic: &'static str,
    pub encoding: Encoding,
    pub cycles: u32,
}

macro_rules! op {
    ($byte:expr, $name:expr, $enc:expr, $cycles:expr) => {
        OpcodeInfo {
            opcode: $byte,
            mnemonic: $name,
            encoding: $enc,
            cycles: $cycles,
        }
    };
}

const W8: Width = Width::W8;
const W16: Width = Width::W16;

/// Returns the table entry for `byte`, or `None` if the slot is unassigned
/// (`InvalidOpcode`, `spec.md` §4.2.5).
pub fn lookup(byte: u8) -> Option<OpcodeInfo> {
    use Encoding::*;
    Some(match byte {
        0x00 => op!(0x00, "NOP", None, 1),

        0x01 => op!(0x01, "MOV8", Modes(&[W8, W8]), 2),
        0x02 => op!(0x02, "MOV16", Modes(&[W16, W16]), 2),
        0x03 => op!(0x03, "PUSH8", Modes(&[W8]), 3),
        0x04 => op!(0x04, "PUSH16", Modes(&[W16]), 3),
        0x05 => op!(0x05, "POP8", Modes(&[W8]), 3),
        0x06 => op!(0x06, "POP16", Modes(&[W16]), 3),
        0x07 => op!(0x07, "ADD8", Modes(&[W8, W8]), 2),
        0x08 => op!(0x08, "ADD16", Modes(&[W16, W16]), 2),
        0x09 => op!(0x09, "SUB8", Modes(&[W8, W8]), 2),
        0x0A => op!(0x0A, "SUB16", Modes(&[W16, W16]), 2),
        0x0B => op!(0x0B, "MUL8", Modes(&[W8, W8]), 3),
        0x0C => op!(0x0C, "MUL16", Modes(&[W16, W16]), 3),
        0x0D => op!(0x0D, "DIV8", Modes(&[W8, W8]), 4),
        0x0E => op!(0x0E, "DIV16", Modes(&[W16, W16]), 4),
        0x0F => op!(0x0F, "MOD8", Modes(&[W8, W8]), 4),
        0x10 => op!(0x10, "MOD16", Modes(&[W16, W16]), 4),
        0x11 => op!(0x11, "INC8", Modes(&[W8]), 1),
        0x12 => op!(0x12, "INC16", Modes(&[W16]), 1),
        0x13 => op!(0x13, "DEC8", Modes(&[W8]), 1),
        0x14 => op!(0x14, "DEC16", Modes(&[W16]), 1),
        0x15 => op!(0x15, "NEG8", Modes(&[W8]), 1),
        0x16 => op!(0x16, "NEG16", Modes(&[W16]), 1),
        0x17 => op!(0x17, "CMP8", Modes(&[W8, W8]), 2),
        0x18 => op!(0x18, "CMP16", Modes(&[W16, W16]), 2),

        0x40 => op!(0x40, "AND8", Modes(&[W8, W8]), 2),
        0x41 => op!(0x41, "AND16", Modes(&[W16, W16]), 2),
        0x42 => op!(0x42, "OR8", Modes(&[W8, W8]), 2),
        0x43 => op!(0x43, "OR16", Modes(&[W16, W16]), 2),
        0x44 => op!(0x44, "XOR8", Modes(&[W8, W8]), 2),
        0x45 => op!(0x45, "XOR16", Modes(&[W16, W16]), 2),
        0x46 => op!(0x46, "NOT8", Modes(&[W8]), 1),
        0x47 => op!(0x47, "NOT16", Modes(&[W16]), 1),
        0x48 => op!(0x48, "SHL8", Modes(&[W8, W8]), 1),
        0x49 => op!(0x49, "SHL16", Modes(&[W16, W16]), 1),
        0x4A => op!(0x4A, "SHR8", Modes(&[W8, W8]), 1),
        0x4B => op!(0x4B, "SHR16", Modes(&[W16, W16]), 1),
        0x4C => op!(0x4C, "ROL8", Modes(&[W8, W8]), 1),
        0x4D => op!(0x4D, "ROL16", Modes(&[W16, W16]), 1),
        0x4E => op!(0x4E, "ROR8", Modes(&[W8, W8]), 1),
        0x4F => op!(0x4F, "ROR16", Modes(&[W16, W16]), 1),

        0x60 => op!(0x60, "JMP", DirectAddress, 3),
        0x61 => op!(0x61, "CALL", DirectAddress, 4),
        0x62 => op!(0x62, "RET", None, 4),
        0x63 => op!(0x63, "IRET", None, 4),
        0x64 => op!(0x64, "HLT", None, 1),
        0x65 => op!(0x65, "STI", None, 1),
        0x66 => op!(0x66, "CLI", None, 1),
        0x67 => op!(0x67, "JZ", DirectAddress, 3),
        0x68 => op!(0x68, "JNZ", DirectAddress, 3),
        0x69 => op!(0x69, "JC", DirectAddress, 3),
        0x6A => op!(0x6A, "JNC", DirectAddress, 3),
        0x6B => op!(0x6B, "JS", DirectAddress, 3),
        0x6C => op!(0x6C, "JNS", DirectAddress, 3),
        0x6D => op!(0x6D, "JO", DirectAddress, 3),
        0x6E => op!(0x6E, "JNO", DirectAddress, 3),
        0x6F => op!(0x6F, "JEQ", DirectAddress, 3),
        0x70 => op!(0x70, "JNE", DirectAddress, 3),
        0x71 => op!(0x71, "JLT", DirectAddress, 3),
        0x72 => op!(0x72, "JLE", DirectAddress, 3),
        0x73 => op!(0x73, "JGT", DirectAddress, 3),
        0x74 => op!(0x74, "JGE", DirectAddress, 3),

        0x80 => op!(0x80, "KEYIN", Modes(&[W8]), 2),
        0x81 => op!(0x81, "KEYSTAT", Modes(&[W8]), 2),
        0x82 => op!(0x82, "KEYCOUNT", Modes(&[W8]), 2),
        0x83 => op!(0x83, "KEYCLEAR", None, 1),
        0x84 => op!(0x84, "KEYCTRL", FixedReg, 2),
        0x85 => op!(0x85, "KEYCTRL", FixedImm, 2),

        0x86 => op!(0x86, "SWRITE", Modes(&[W8]), 3),
        0x87 => op!(0x87, "SREAD", Modes(&[W8]), 3),
        0x88 => op!(0x88, "SROLX", Modes(&[W8]), 4),
        0x89 => op!(0x89, "SROLY", Modes(&[W8]), 4),
        0x8A => op!(0x8A, "SFLIPX", None, 4),
        0x8B => op!(0x8B, "SFLIPY", None, 4),
        0x8C => op!(0x8C, "SROTL", None, 6),
        0x8D => op!(0x8D, "SROTR", None, 6),
        0x8E => op!(0x8E, "TEXT", Modes(&[W16, W8]), 4),
        0x8F => op!(0x8F, "SPLAY", None, 2),
        0x90 => op!(0x90, "SSTOP", None, 2),
        0x91 => op!(0x91, "RND", Modes(&[W16]), 2),
        0x92 => op!(0x92, "RNDR8", Modes(&[W8, W8, W8]), 3),
        0x93 => op!(0x93, "RNDR16", Modes(&[W16, W16, W16]), 3),
        0x94 => op!(0x94, "SPBLIT", FixedReg, 8),
        0x95 => op!(0x95, "SPBLIT", FixedImm, 8),
        0x96 => op!(0x96, "SPBLITALL", None, 40),

        _ => return None,
    })
}

/// Operand mode nibble values, shared by the encoder (tests) and decoder
/// (`cpu.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandMode {
    Reg = 0,
    RegHigh = 1,
    RegLow = 2,
    Imm = 3,
    DirectMem = 4,
    IndirectReg = 5,
    IndexedReg = 6,
    HwReg = 7,
}

impl OperandMode {
    pub fn from_nibble(n: u8) -> Option<Self> {
        Some(match n {
            0 => OperandMode::Reg,
            1 => OperandMode::RegHigh,
            2 => OperandMode::RegLow,
            3 => OperandMode::Imm,
            4 => OperandMode::DirectMem,
            5 => OperandMode::IndirectReg,
            6 => OperandMode::IndexedReg,
            7 => OperandMode::HwReg,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_slots_are_none() {
        assert!(lookup(0x19).is_none());
        assert!(lookup(0x3F).is_none());
        assert!(lookup(0x50).is_none());
        assert!(lookup(0x75).is_none());
        assert!(lookup(0xA0).is_none());
        assert!(lookup(0xFF).is_none());
    }

    #[test]
    fn ranges_match_spec_layout() {
        assert_eq!(lookup(0x64).unwrap().mnemonic, "HLT");
        assert_eq!(lookup(0x84).unwrap().mnemonic, "KEYCTRL");
        assert_eq!(lookup(0x96).unwrap().mnemonic, "SPBLITALL");
    }

    #[test]
    fn mode_byte_count_packs_two_operands_per_byte() {
        assert_eq!(Encoding::Modes(&[W8, W8]).mode_byte_count(), 1);
        assert_eq!(Encoding::Modes(&[W8, W8, W8]).mode_byte_count(), 2);
        assert_eq!(Encoding::Modes(&[W16]).mode_byte_count(), 1);
    }
}
