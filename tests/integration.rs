//! Black-box end-to-end scenarios driving only the public `Emulator` API
//! (`spec.md` §8.3).

use nova16::errors::{EmuError, RunOutcome};
use nova16::memory::{SPRITE_TABLE_BASE, VECTOR_TABLE_BASE};
use nova16::opcode::OperandMode;
use nova16::registers::Flags;
use nova16::{Emulator, StepResult};

fn modes2(a: OperandMode, b: OperandMode) -> u8 {
    ((a as u8) << 4) | (b as u8)
}

fn modes1(a: OperandMode) -> u8 {
    (a as u8) << 4
}

/// `MOV8 [addr], imm8` — the only way a black-box caller can seed memory
/// the emulator doesn't expose a host write for (sprite tables, vectors,
/// handler bytes): run it through the CPU itself.
fn mov8_mem_imm(addr: u16, val: u8) -> [u8; 5] {
    let [hi, lo] = addr.to_be_bytes();
    [0x01, modes2(OperandMode::DirectMem, OperandMode::Imm), hi, lo, val]
}

fn mov16_mem_imm(addr: u16, val: u16) -> [u8; 6] {
    let [hi, lo] = addr.to_be_bytes();
    let [vhi, vlo] = val.to_be_bytes();
    [0x02, modes2(OperandMode::DirectMem, OperandMode::Imm), hi, lo, vhi, vlo]
}

/// §8.3 scenario 1: `MOV P0, 5 ; MOV P1, 3 ; ADD P0, P1 ; HLT`.
#[test]
fn add_two_constants() {
    let prog = [
        0x02, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0, 5, // MOV16 P0, 5
        0x02, modes2(OperandMode::Reg, OperandMode::Imm), 1, 0, 3, // MOV16 P1, 3
        0x08, modes2(OperandMode::Reg, OperandMode::Reg), 0, 1, // ADD16 P0, P1
        0x64, // HLT
    ];
    let mut emu = Emulator::new(&prog, nova16::DEFAULT_ORIGIN).unwrap();
    let summary = emu.run_for(1000);
    assert_eq!(summary.outcome, RunOutcome::Halted);
    let regs = emu.dump_registers();
    assert_eq!(regs.p[0], 8);
    assert!(!regs.flags.contains(Flags::ZERO));
    assert!(emu.halted());
}

/// §8.3 scenario 2: `MOV P0, 10 ; loop: DEC P0 ; JNZ loop ; HLT`, asserting
/// the exact instruction count `1 + 10*2 + 1 = 22`.
#[test]
fn loop_count_executes_exact_instruction_total() {
    let prog = [
        0x02, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0, 10, // MOV16 P0, 10 (5 bytes)
        0x14, modes1(OperandMode::Reg), 0, // loop: DEC16 P0 (3 bytes, at origin+5)
        0x68, 0, 0, // JNZ loop (3 bytes, patched below)
        0x64, // HLT
    ];
    let mut prog = prog;
    let loop_addr = nova16::DEFAULT_ORIGIN + 5;
    prog[9] = (loop_addr >> 8) as u8;
    prog[10] = (loop_addr & 0xFF) as u8;

    let mut emu = Emulator::new(&prog, nova16::DEFAULT_ORIGIN).unwrap();
    let summary = emu.run_for(10_000);
    assert_eq!(summary.outcome, RunOutcome::Halted);
    assert_eq!(summary.instructions_executed, 1 + 10 * 2 + 1);
    assert_eq!(emu.dump_registers().p[0], 0);
}

/// §8.3 scenario 3: a coordinate-mode pixel write lands at `(100, 120)` on
/// layer 1 and nowhere else.
#[test]
fn draw_pixel_in_coordinate_mode() {
    let prog = [
        0x01, modes2(OperandMode::HwReg, OperandMode::Imm), 2, 0, // MOV8 VM, 0
        0x01, modes2(OperandMode::HwReg, OperandMode::Imm), 3, 1, // MOV8 VL, 1
        0x02, modes2(OperandMode::HwReg, OperandMode::Imm), 0, 0, 100, // MOV16 VX, 100
        0x02, modes2(OperandMode::HwReg, OperandMode::Imm), 1, 0, 120, // MOV16 VY, 120
        0x01, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0x1F, // MOV8 R0, 0x1F
        0x86, (OperandMode::Reg as u8) << 4, 0, // SWRITE R0
        0x64, // HLT
    ];
    let mut emu = Emulator::new(&prog, nova16::DEFAULT_ORIGIN).unwrap();
    assert_eq!(emu.run_for(1000).outcome, RunOutcome::Halted);
    let layer1 = emu.layer(1);
    assert_eq!(layer1[120 * 256 + 100], 0x1F);
    assert_eq!(layer1.iter().filter(|&&b| b != 0).count(), 1);
}

/// §8.3 scenario 4: a 2x2 sprite blits onto layer 5 at (10, 20). The sprite
/// data and its control block are written by the program itself, since the
/// host API never exposes a raw memory poke.
#[test]
fn sprite_blit_composites_onto_sprite_layer() {
    let mut prog = Vec::new();
    prog.extend_from_slice(&mov8_mem_imm(0x3000, 0xAA));
    prog.extend_from_slice(&mov8_mem_imm(0x3001, 0xBB));
    prog.extend_from_slice(&mov8_mem_imm(0x3002, 0xCC));
    prog.extend_from_slice(&mov8_mem_imm(0x3003, 0xDD));
    prog.extend_from_slice(&mov16_mem_imm(SPRITE_TABLE_BASE, 0x3000)); // data_addr
    prog.extend_from_slice(&mov8_mem_imm(SPRITE_TABLE_BASE + 2, 10)); // x
    prog.extend_from_slice(&mov8_mem_imm(SPRITE_TABLE_BASE + 3, 20)); // y
    prog.extend_from_slice(&mov8_mem_imm(SPRITE_TABLE_BASE + 4, 2)); // width
    prog.extend_from_slice(&mov8_mem_imm(SPRITE_TABLE_BASE + 5, 2)); // height
    prog.extend_from_slice(&mov8_mem_imm(SPRITE_TABLE_BASE + 6, 0x01)); // active, layer 5
    prog.extend_from_slice(&mov8_mem_imm(SPRITE_TABLE_BASE + 7, 0)); // key
    prog.extend_from_slice(&[0x01, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0]); // MOV8 R0, 0
    prog.extend_from_slice(&[0x94, 0]); // SPBLIT r0
    prog.push(0x64); // HLT

    let mut emu = Emulator::new(&prog, nova16::DEFAULT_ORIGIN).unwrap();
    assert_eq!(emu.run_for(10_000).outcome, RunOutcome::Halted);
    let layer5 = emu.layer(5);
    assert_eq!(layer5[20 * 256 + 10], 0xAA);
    assert_eq!(layer5[20 * 256 + 11], 0xBB);
    assert_eq!(layer5[21 * 256 + 10], 0xCC);
    assert_eq!(layer5[21 * 256 + 11], 0xDD);
    assert_eq!(layer5.iter().filter(|&&b| b != 0).count(), 4);
}

/// §8.3 scenario 5: a keyboard press reaches the installed handler via the
/// interrupt controller and the buffer drains. The handler bytes and the
/// vector table entry are written in-program, just like the sprite table
/// above, to keep the test to the public `Emulator` surface.
#[test]
fn keyboard_interrupt_delivers_to_handler() {
    const HANDLER_ADDR: u16 = 0x2000;
    const KEYBOARD_VECTOR: u16 = 1;

    let mut prog = Vec::new();
    // handler at 0x2000: KEYIN R0 ; IRET
    prog.extend_from_slice(&mov8_mem_imm(HANDLER_ADDR, 0x80));
    prog.extend_from_slice(&mov8_mem_imm(HANDLER_ADDR + 1, modes1(OperandMode::Reg)));
    prog.extend_from_slice(&mov8_mem_imm(HANDLER_ADDR + 2, 0));
    prog.extend_from_slice(&mov8_mem_imm(HANDLER_ADDR + 3, 0x63));
    // vector 1 (keyboard) -> handler
    prog.extend_from_slice(&mov16_mem_imm(
        VECTOR_TABLE_BASE + KEYBOARD_VECTOR * 4,
        HANDLER_ADDR,
    ));
    let setup_instructions = 5; // four MOV8s (handler bytes) + one MOV16 (vector entry)
    // main: KEYCTRL #1 ; STI ; HLT
    prog.extend_from_slice(&[0x85, 0x01, 0x65, 0x64]);

    let mut emu = Emulator::new(&prog, nova16::DEFAULT_ORIGIN).unwrap();

    for _ in 0..setup_instructions {
        assert!(matches!(emu.step(), StepResult::Ok { .. }));
    }

    assert!(matches!(emu.step(), StepResult::Ok { .. })); // KEYCTRL
    assert!(matches!(emu.step(), StepResult::Ok { .. })); // STI
    assert!(emu.dump_registers().flags.contains(Flags::INTERRUPT));

    emu.press_key(0x41);

    assert!(matches!(emu.step(), StepResult::Ok { cycles: 12 })); // interrupt entry
    assert!(matches!(emu.step(), StepResult::Ok { .. })); // KEYIN
    assert_eq!(emu.dump_registers().r[0], 0x41);
    assert!(matches!(emu.step(), StepResult::Ok { .. })); // IRET
    assert!(emu.dump_registers().flags.contains(Flags::INTERRUPT));
}

/// §8.3 scenario 6: `DIV` by zero recovers gracefully instead of halting.
#[test]
fn divide_by_zero_recovers_and_continues() {
    let prog = [
        0x02, modes2(OperandMode::Reg, OperandMode::Imm), 0, 0, 10, // MOV16 P0, 10
        0x02, modes2(OperandMode::Reg, OperandMode::Imm), 1, 0, 0, // MOV16 P1, 0
        0x0E, modes2(OperandMode::Reg, OperandMode::Reg), 0, 1, // DIV16 P0, P1
        0x02, modes2(OperandMode::Reg, OperandMode::Imm), 2, 0, 7, // MOV16 P2, 7
        0x64, // HLT
    ];
    let mut emu = Emulator::new(&prog, nova16::DEFAULT_ORIGIN).unwrap();
    let summary = emu.run_for(1000);
    assert_eq!(summary.outcome, RunOutcome::Halted);
    let regs = emu.dump_registers();
    assert_eq!(regs.p[0], 0);
    assert_eq!(regs.p[2], 7);
}

/// An invalid opcode surfaces as a fault rather than panicking, with `PC`
/// held at the faulting instruction (§4.2.5, §7).
#[test]
fn invalid_opcode_surfaces_as_fault_not_panic() {
    let prog = [0xFF];
    let mut emu = Emulator::new(&prog, nova16::DEFAULT_ORIGIN).unwrap();
    let summary = emu.run_for(100);
    match summary.outcome {
        RunOutcome::Fault {
            kind: EmuError::InvalidOpcode { byte: 0xFF, .. },
            pc,
        } => assert_eq!(pc, nova16::DEFAULT_ORIGIN),
        other => panic!("unexpected outcome: {other:?}"),
    }
}
