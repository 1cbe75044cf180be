//! Bytes → text disassembly, driven entirely by [`opcode::lookup`]
//! (`spec.md` §6.2, §9 "single machine-readable source").

use crate::memory::Memory;
use crate::opcode::{self, Encoding, OperandMode, Width};

/// One decoded instruction: its address, raw bytes, and rendered text.
#[derive(Debug, Clone)]
pub struct Line {
    pub addr: u16,
    pub bytes: Vec<u8>,
    pub text: String,
}

fn render_operand(mem: &Memory, cursor: &mut u16, mode: OperandMode, width: Width) -> String {
    match mode {
        OperandMode::Reg => {
            let id = mem.read8(*cursor);
            *cursor = cursor.wrapping_add(1);
            match width {
                Width::W8 => format!("r{id}"),
                Width::W16 => format!("p{id}"),
            }
        }
        OperandMode::RegHigh => {
            let id = mem.read8(*cursor);
            *cursor = cursor.wrapping_add(1);
            format!("P{id}:")
        }
        OperandMode::RegLow => {
            let id = mem.read8(*cursor);
            *cursor = cursor.wrapping_add(1);
            format!(":P{id}")
        }
        OperandMode::Imm => match width {
            Width::W8 => {
                let v = mem.read8(*cursor);
                *cursor = cursor.wrapping_add(1);
                format!("#{v:#04x}")
            }
            Width::W16 => {
                let v = mem.read16(*cursor);
                *cursor = cursor.wrapping_add(2);
                format!("#{v:#06x}")
            }
        },
        OperandMode::DirectMem => {
            let addr = mem.read16(*cursor);
            *cursor = cursor.wrapping_add(2);
            format!("[{addr:#06x}]")
        }
        OperandMode::IndirectReg => {
            let id = mem.read8(*cursor);
            *cursor = cursor.wrapping_add(1);
            format!("[P{id}]")
        }
        OperandMode::IndexedReg => {
            let id = mem.read8(*cursor);
            *cursor = cursor.wrapping_add(1);
            let off = mem.read8(*cursor) as i8;
            *cursor = cursor.wrapping_add(1);
            format!("[P{id}+{off}]")
        }
        OperandMode::HwReg => {
            let code = mem.read8(*cursor);
            *cursor = cursor.wrapping_add(1);
            format!("${code}")
        }
    }
}

/// Disassembles one instruction starting at `addr`. Returns the rendered
/// line and the address immediately after it, or a one-line `.byte`
/// fallback (plus `addr+1`) if the opcode is unassigned.
pub fn disassemble_one(mem: &Memory, addr: u16) -> (Line, u16) {
    let opcode_byte = mem.read8(addr);
    let Some(info) = opcode::lookup(opcode_byte) else {
        return (
            Line {
                addr,
                bytes: vec![opcode_byte],
                text: format!(".byte {opcode_byte:#04x}"),
            },
            addr.wrapping_add(1),
        );
    };

    let mut cursor = addr.wrapping_add(1);
    let text = match info.encoding {
        Encoding::None => info.mnemonic.to_string(),
        Encoding::DirectAddress => {
            let target = mem.read16(cursor);
            cursor = cursor.wrapping_add(2);
            format!("{} {:#06x}", info.mnemonic, target)
        }
        Encoding::FixedReg => {
            let id = mem.read8(cursor);
            cursor = cursor.wrapping_add(1);
            format!("{} r{id}", info.mnemonic)
        }
        Encoding::FixedImm => {
            let v = mem.read8(cursor);
            cursor = cursor.wrapping_add(1);
            format!("{} #{v:#04x}", info.mnemonic)
        }
        Encoding::Modes(widths) => {
            let n = widths.len();
            let mut modes = Vec::with_capacity(n);
            let mut remaining = n;
            while remaining > 0 {
                let byte = mem.read8(cursor);
                cursor = cursor.wrapping_add(1);
                modes.push(OperandMode::from_nibble(byte >> 4));
                remaining -= 1;
                if remaining > 0 {
                    modes.push(OperandMode::from_nibble(byte & 0xF));
                    remaining -= 1;
                }
            }
            let mut operands = Vec::with_capacity(n);
            for (mode, width) in modes.into_iter().zip(widths.iter().copied()) {
                match mode {
                    Some(m) => operands.push(render_operand(mem, &mut cursor, m, width)),
                    None => {
                        operands.push("?".to_string());
                        break;
                    }
                }
            }
            format!("{} {}", info.mnemonic, operands.join(", "))
        }
    };

    let len = (cursor - addr) as usize;
    let bytes = mem.read_slice(addr, len);
    (Line { addr, bytes, text }, cursor)
}

/// Disassembles `len` bytes starting at `origin`, stopping early if an
/// instruction would read past `origin + len`.
pub fn disassemble_range(mem: &Memory, origin: u16, len: u16) -> Vec<Line> {
    let end = origin.wrapping_add(len);
    let mut lines = Vec::new();
    let mut addr = origin;
    while addr < end {
        let (line, next) = disassemble_one(mem, addr);
        lines.push(line);
        if next <= addr {
            break; // defensive: a zero-length step would spin forever
        }
        addr = next;
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modes2(a: OperandMode, b: OperandMode) -> u8 {
        ((a as u8) << 4) | (b as u8)
    }

    #[test]
    fn disassembles_mov_with_register_and_immediate() {
        let mut mem = Memory::new();
        let prog = [0x02, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0, 5];
        mem.load_image(&prog, 0x1000).unwrap();
        let (line, next) = disassemble_one(&mem, 0x1000);
        assert_eq!(line.text, "MOV16 p0, #0x0005");
        assert_eq!(next, 0x1005);
    }

    #[test]
    fn disassembles_control_flow_direct_address() {
        let mut mem = Memory::new();
        mem.load_image(&[0x61, 0x20, 0x00], 0x1000).unwrap();
        let (line, _) = disassemble_one(&mem, 0x1000);
        assert_eq!(line.text, "CALL 0x2000");
    }

    #[test]
    fn unassigned_opcode_falls_back_to_byte_literal() {
        let mut mem = Memory::new();
        mem.load_image(&[0xFF], 0x1000).unwrap();
        let (line, next) = disassemble_one(&mem, 0x1000);
        assert_eq!(line.text, ".byte 0xff");
        assert_eq!(next, 0x1001);
    }

    #[test]
    fn disassemble_range_stops_at_end() {
        let mut mem = Memory::new();
        mem.load_image(&[0x64, 0x00, 0x64], 0x1000).unwrap();
        let lines = disassemble_range(&mem, 0x1000, 2);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].text, "HLT");
        assert_eq!(lines[1].text, "NOP");
    }
}
