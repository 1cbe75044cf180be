//! CLI front-end: `emulate` / `disasm` / `debug` (`spec.md` §6.4).

use std::io::{Read, Write};

use clap::{Parser, Subcommand};
use clio::ClioPath;

use nova16::debugger::Debugger;
use nova16::disasm;
use nova16::errors::RunOutcome;
use nova16::Emulator;

#[derive(Parser)]
#[command(name = "nova16", about = "NOVA-16 machine emulator")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a program until it halts, faults, or exhausts its cycle budget.
    Emulate {
        program: ClioPath,
        #[arg(long, default_value_t = nova16::DEFAULT_ORIGIN)]
        origin: u16,
        #[arg(long)]
        cycles: Option<u64>,
        /// Present for parity with a windowed front-end; this binary never
        /// opens a window (`spec.md` §1: the GUI event loop is out of scope).
        #[arg(long)]
        headless: bool,
    },
    /// Print a disassembly listing of a program image.
    Disasm {
        program: ClioPath,
        #[arg(long, default_value_t = nova16::DEFAULT_ORIGIN)]
        origin: u16,
    },
    /// Start an interactive step debugger on a program image.
    Debug {
        program: ClioPath,
        #[arg(long, default_value_t = nova16::DEFAULT_ORIGIN)]
        origin: u16,
    },
}

fn read_program(path: &ClioPath) -> Vec<u8> {
    let name = path
        .file_name()
        .map_or("stdin".to_owned(), |n| n.to_string_lossy().into_owned());
    let mut file = path.open().unwrap_or_else(|_| panic!("could not open {name}"));
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .unwrap_or_else(|_| panic!("could not read {name}"));
    bytes
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let exit_code = match args.command {
        Command::Emulate {
            program,
            origin,
            cycles,
            headless: _,
        } => cmd_emulate(&read_program(&program), origin, cycles),
        Command::Disasm { program, origin } => {
            cmd_disasm(&read_program(&program), origin);
            0
        }
        Command::Debug { program, origin } => {
            cmd_debug(&read_program(&program), origin);
            0
        }
    };

    std::process::exit(exit_code);
}

/// Runs to completion and reports the outcome, mapping it onto the exit
/// codes `spec.md` §6.4 specifies for `emulate`.
fn cmd_emulate(program: &[u8], origin: u16, cycles: Option<u64>) -> i32 {
    let mut emu = Emulator::new(program, origin).expect("failed to load program image");
    let budget = cycles.unwrap_or(u64::MAX);
    let summary = emu.run_for(budget);
    match &summary.outcome {
        RunOutcome::Halted => {
            println!(
                "halted after {} instructions ({} cycles)",
                summary.instructions_executed, summary.cycles_executed
            );
            0
        }
        RunOutcome::Fault { kind, pc } => {
            let snap = emu.dump_registers();
            eprintln!("fault at pc={pc:#06x}: {kind}");
            eprintln!("pc={:#06x} flags={:?}", snap.pc, snap.flags);
            eprintln!("r: {:?}", snap.r);
            eprintln!("p: {:?}", snap.p);
            1
        }
        RunOutcome::CyclesExhausted => {
            println!("cycle budget exhausted after {} instructions", summary.instructions_executed);
            2
        }
    }
}

fn cmd_disasm(program: &[u8], origin: u16) {
    let mut mem = nova16::memory::Memory::new();
    mem.load_image(program, origin)
        .expect("program image does not fit in memory");
    for line in disasm::disassemble_range(&mem, origin, program.len() as u16) {
        let hex: String = line.bytes.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:#06x}  {hex:<12}  {}", line.addr, line.text);
    }
}

fn cmd_debug(program: &[u8], origin: u16) {
    let emu = Emulator::new(program, origin).expect("failed to load program image");
    let mut dbg = Debugger::new(emu);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    dbg.run_repl(stdin.lock(), stdout.lock())
        .expect("debugger REPL I/O failed");
    let _ = std::io::stdout().flush();
}
