//! Timer device: a free-running count-up counter compared against a match
//! value (`spec.md` §4.6).
//!
//! Exposed to the CPU as four hardware registers: `TT` (current count, 16
//! bit), `TM` (match value, 16 bit), `TS` (speed divider, 8 bit — the
//! counter advances once every `TS` instruction cycles), `TC` (control, 8
//! bit: enable / IRQ-enable / reset-on-match).

use crate::interrupts::{InterruptController, Vector};

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct TimerControl: u8 {
        const ENABLE     = 0b0000_0001;
        const IRQ_ENABLE = 0b0000_0010;
        const RESET_ON_MATCH = 0b0000_0100;
    }
}

#[derive(Debug, Default, Clone)]
pub struct Timer {
    count: u16,
    match_value: u16,
    /// Instruction cycles per count-up tick. `0` is treated as `1`.
    speed: u8,
    control: TimerControl,
    accumulator: u32,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tt(&self) -> u16 {
        self.count
    }

    pub fn set_tt(&mut self, value: u16) {
        self.count = value;
    }

    pub fn tm(&self) -> u16 {
        self.match_value
    }

    pub fn set_tm(&mut self, value: u16) {
        self.match_value = value;
    }

    pub fn ts(&self) -> u8 {
        self.speed
    }

    pub fn set_ts(&mut self, value: u8) {
        self.speed = value;
    }

    pub fn tc(&self) -> u8 {
        self.control.bits()
    }

    pub fn set_tc(&mut self, value: u8) {
        self.control = TimerControl::from_bits_truncate(value);
    }

    /// Advances the timer's cycle accumulator by the instruction's cycle
    /// cost; crossing `TS` increments `TT` (§4.6 "Tick").
    pub fn tick(&mut self, cycles: u32, interrupts: &mut InterruptController) {
        if !self.control.contains(TimerControl::ENABLE) {
            return;
        }
        let divisor = self.speed.max(1) as u32;
        self.accumulator += cycles;
        while self.accumulator >= divisor {
            self.accumulator -= divisor;
            self.count = self.count.wrapping_add(1);
            if self.count == self.match_value {
                if self.control.contains(TimerControl::IRQ_ENABLE) {
                    interrupts.raise(Vector::Timer);
                }
                if self.control.contains(TimerControl::RESET_ON_MATCH) {
                    self.count = 0;
                }
            }
        }
    }
}
