//! Interactive step debugger driving an [`Emulator`] from a line-oriented
//! REPL (`spec.md` §6.4).

use std::io::{self, BufRead, Write};

use bitvec::prelude::*;
use itertools::Itertools;

use crate::emulator::Emulator;
use crate::errors::{RunOutcome, StepResult};

/// Wraps an [`Emulator`] with a breakpoint set and a `step/run/break/regs/
/// mem/layer/quit` command loop.
pub struct Debugger {
    emu: Emulator,
    breakpoints: BitVec,
}

impl Debugger {
    pub fn new(emu: Emulator) -> Self {
        Self {
            emu,
            breakpoints: bitvec![0; 0x1_0000],
        }
    }

    /// Reads commands from `input` and writes responses to `output` until
    /// `quit` or end-of-input.
    pub fn run_repl<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> io::Result<()> {
        loop {
            write!(output, "(nova16) ")?;
            output.flush()?;
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                return Ok(());
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self.dispatch(line, &mut output)? {
                return Ok(());
            }
        }
    }

    /// Runs one command. Returns `Ok(true)` if the session should end.
    fn dispatch<W: Write>(&mut self, line: &str, out: &mut W) -> io::Result<bool> {
        let mut parts = line.split_whitespace();
        match parts.next().unwrap_or("") {
            "step" => self.cmd_step(out)?,
            "run" => self.cmd_run(out)?,
            "break" => self.cmd_break(parts.next(), out)?,
            "regs" => self.cmd_regs(out)?,
            "mem" => self.cmd_mem(parts.next(), parts.next(), out)?,
            "layer" => self.cmd_layer(parts.next(), parts.next(), out)?,
            "quit" => return Ok(true),
            other => writeln!(out, "unknown command: {other}")?,
        }
        Ok(false)
    }

    fn cmd_step<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        report_step(self.emu.step(), out)
    }

    /// Steps until halt, fault, or a breakpointed `PC`, whichever comes
    /// first (§6.4: `run`).
    fn cmd_run<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        loop {
            let pc_before = self.emu.dump_registers().pc;
            let result = self.emu.step();
            match result {
                StepResult::Ok { .. } => {
                    let pc_after = self.emu.dump_registers().pc;
                    if pc_after != pc_before && self.breakpoints[pc_after as usize] {
                        writeln!(out, "breakpoint hit at {pc_after:#06x}")?;
                        return Ok(());
                    }
                }
                StepResult::Halted | StepResult::Fault { .. } => {
                    return report_step(result, out);
                }
            }
        }
    }

    fn cmd_break<W: Write>(&mut self, addr: Option<&str>, out: &mut W) -> io::Result<()> {
        match addr.and_then(parse_addr) {
            Some(addr) => {
                self.breakpoints.set(addr as usize, true);
                writeln!(out, "breakpoint set at {addr:#06x}")
            }
            None => writeln!(out, "usage: break <addr>"),
        }
    }

    fn cmd_regs<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        let snap = self.emu.dump_registers();
        writeln!(out, "pc={:#06x} flags={:?}", snap.pc, snap.flags)?;
        writeln!(out, "r: {:?}", snap.r)?;
        writeln!(out, "p: {:?}", snap.p)
    }

    fn cmd_mem<W: Write>(&mut self, addr: Option<&str>, len: Option<&str>, out: &mut W) -> io::Result<()> {
        let (Some(addr), Some(len)) = (addr.and_then(parse_addr), len.and_then(|s| s.parse::<usize>().ok()))
        else {
            return writeln!(out, "usage: mem <addr> <len>");
        };
        let bytes = self.emu.read_memory(addr, len);
        for (row, chunk) in bytes.chunks(16).enumerate() {
            let hex = chunk.iter().map(|b| format!("{b:02x}")).join(" ");
            writeln!(out, "{:#06x}: {hex}", addr.wrapping_add((row * 16) as u16))?;
        }
        Ok(())
    }

    fn cmd_layer<W: Write>(&mut self, index: Option<&str>, outfile: Option<&str>, out: &mut W) -> io::Result<()> {
        let (Some(index), Some(outfile)) = (index.and_then(|s| s.parse::<usize>().ok()), outfile) else {
            return writeln!(out, "usage: layer <n> <outfile>");
        };
        if index == 0 {
            self.emu.composite();
        }
        let bytes = self.emu.layer(index);
        std::fs::write(outfile, &bytes)?;
        writeln!(out, "wrote {} bytes to {outfile}", bytes.len())
    }
}

fn report_step<W: Write>(result: StepResult, out: &mut W) -> io::Result<()> {
    match result {
        StepResult::Ok { cycles } => writeln!(out, "ok ({cycles} cycles)"),
        StepResult::Halted => writeln!(out, "halted"),
        StepResult::Fault { kind, pc } => writeln!(out, "fault at {pc:#06x}: {kind}"),
    }
}

pub fn parse_addr(s: &str) -> Option<u16> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Summarizes a `run_for` outcome for the non-interactive `emulate` CLI
/// path (`spec.md` §6.4 exit codes).
pub fn exit_code_for(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Halted => 0,
        RunOutcome::Fault { .. } => 1,
        RunOutcome::CyclesExhausted => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prog_halt_immediately() -> Vec<u8> {
        vec![0x64] // HLT
    }

    #[test]
    fn step_then_quit_reports_halt() {
        let emu = Emulator::new(&prog_halt_immediately(), crate::emulator::DEFAULT_ORIGIN).unwrap();
        let mut dbg = Debugger::new(emu);
        let input = b"step\nquit\n".as_slice();
        let mut output = Vec::new();
        dbg.run_repl(input, &mut output).unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("halted"));
    }

    #[test]
    fn break_then_run_stops_at_breakpoint() {
        // JMP back to self, so `run` would spin forever without a breakpoint.
        let prog = [0x60, 0x10, 0x00];
        let emu = Emulator::new(&prog, crate::emulator::DEFAULT_ORIGIN).unwrap();
        let mut dbg = Debugger::new(emu);
        let input = b"break 0x1000\nrun\nquit\n".as_slice();
        let mut output = Vec::new();
        dbg.run_repl(input, &mut output).unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("breakpoint hit at 0x1000"));
    }

    #[test]
    fn regs_reports_initial_pc() {
        let emu = Emulator::new(&prog_halt_immediately(), crate::emulator::DEFAULT_ORIGIN).unwrap();
        let mut dbg = Debugger::new(emu);
        let input = b"regs\nquit\n".as_slice();
        let mut output = Vec::new();
        dbg.run_repl(input, &mut output).unwrap();
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("pc=0x1000"));
    }

    #[test]
    fn exit_codes_match_outcomes() {
        assert_eq!(exit_code_for(&RunOutcome::Halted), 0);
        assert_eq!(exit_code_for(&RunOutcome::CyclesExhausted), 2);
        assert_eq!(
            exit_code_for(&RunOutcome::Fault {
                kind: crate::errors::EmuError::StackUnderflow,
                pc: 0
            }),
            1
        );
    }
}
