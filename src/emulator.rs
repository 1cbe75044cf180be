//! Wires every component together and exposes the host-facing API
//! (`spec.md` §6.3).

use crate::cpu::{Bus, Cpu};
use crate::errors::{EmuError, RunOutcome, RunSummary, StepResult};
use crate::graphics::Graphics;
use crate::interrupts::InterruptController;
use crate::keyboard::Keyboard;
use crate::memory::Memory;
use crate::registers::RegSnapshot;
use crate::sound::Sound;
use crate::timer::Timer;

pub const DEFAULT_ORIGIN: u16 = 0x1000;

/// Owns the CPU and every peripheral, and is the only thing a host program
/// needs to drive a NOVA-16 program (`spec.md` §6.3).
pub struct Emulator {
    cpu: Cpu,
    mem: Memory,
    gfx: Graphics,
    snd: Sound,
    kbd: Keyboard,
    timer: Timer,
    intc: InterruptController,
}

impl Emulator {
    /// Loads `program` at `origin` and sets `PC` there (§6.1).
    pub fn new(program: &[u8], origin: u16) -> Result<Self, EmuError> {
        let mut mem = Memory::new();
        mem.load_image(program, origin)?;
        let mut cpu = Cpu::new();
        cpu.regs.pc = origin;
        Ok(Self {
            cpu,
            mem,
            gfx: Graphics::new(),
            snd: Sound::new(),
            kbd: Keyboard::new(),
            timer: Timer::new(),
            intc: InterruptController::new(),
        })
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

    /// Executes one instruction, or services a pending interrupt.
    pub fn step(&mut self) -> StepResult {
        let mut bus = self.bus();
        self.cpu.step(&mut bus)
    }

    /// Steps until halt, fault, or `max_cycles` is exhausted — whichever
    /// comes first (§6.3 convenience loop).
    pub fn run_for(&mut self, max_cycles: u64) -> RunSummary {
        let mut cycles_executed = 0u64;
        let mut instructions_executed = 0u64;
        loop {
            match self.step() {
                StepResult::Ok { cycles } => {
                    cycles_executed += cycles as u64;
                    instructions_executed += 1;
                    if cycles_executed >= max_cycles {
                        return RunSummary {
                            cycles_executed,
                            instructions_executed,
                            outcome: RunOutcome::CyclesExhausted,
                        };
                    }
                }
                StepResult::Halted => {
                    return RunSummary {
                        cycles_executed,
                        instructions_executed,
                        outcome: RunOutcome::Halted,
                    };
                }
                StepResult::Fault { kind, pc } => {
                    return RunSummary {
                        cycles_executed,
                        instructions_executed,
                        outcome: RunOutcome::Fault { kind, pc },
                    };
                }
            }
        }
    }

    /// The composited output (layer 0), row-major 256×256.
    pub fn framebuffer(&self) -> Vec<u8> {
        self.gfx.framebuffer()
    }

    /// Composites layers 1..7 onto layer 0. The host calls this before
    /// reading `framebuffer()` (§4.3 "on host request").
    pub fn composite(&mut self) {
        self.gfx.composite();
    }

    pub fn layer(&self, index: usize) -> Vec<u8> {
        self.gfx.layer_bytes(index)
    }

    /// Delivers a keypress from the host frontend (§6.3, §5 "suspension
    /// points": this is the only host-initiated mutation between steps).
    pub fn press_key(&mut self, code: u8) {
        self.kbd.press_key(code, &mut self.intc);
    }

    pub fn dump_registers(&self) -> RegSnapshot {
        self.cpu.regs.snapshot()
    }

    pub fn read_memory(&self, addr: u16, len: usize) -> Vec<u8> {
        self.mem.read_slice(addr, len)
    }

    pub fn memory(&self) -> &Memory {
        &self.mem
    }

    pub fn halted(&self) -> bool {
        self.cpu.halted()
    }
}
