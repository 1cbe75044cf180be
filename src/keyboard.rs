//! Keyboard device: a 16-slot ring buffer of scan codes, a status register
//! and a control register (`spec.md` §4.5).

use crate::interrupts::{InterruptController, Vector};

pub const BUFFER_LEN: usize = 16;

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct KeyStatus: u8 {
        const NON_EMPTY  = 0b0000_0001;
        const FULL       = 0b0000_0010;
        const IRQ_PENDING = 0b1000_0000;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct KeyControl: u8 {
        const IRQ_ENABLE = 0b0000_0001;
    }
}

/// A fixed-capacity ring buffer of pending scan codes, with a status byte
/// the program can poll and a control byte that gates the keyboard IRQ.
#[derive(Debug, Default, Clone)]
pub struct Keyboard {
    buffer: [u8; BUFFER_LEN],
    head: usize,
    len: usize,
    control: KeyControl,
    irq_pending: bool,
}

impl Keyboard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Host-facing input: a key was pressed on the frontend. Silently
    /// drops the code if the buffer is full (§4.5 "appends ... if not
    /// full").
    pub fn press_key(&mut self, code: u8, interrupts: &mut InterruptController) {
        if self.len == BUFFER_LEN {
            return;
        }
        let tail = (self.head + self.len) % BUFFER_LEN;
        self.buffer[tail] = code;
        self.len += 1;
        if self.control.contains(KeyControl::IRQ_ENABLE) {
            self.irq_pending = true;
            interrupts.raise(Vector::Keyboard);
        }
    }

    /// `KEYIN dst`: pops the oldest scan code, or `0` if the buffer is
    /// empty.
    pub fn pop(&mut self) -> u8 {
        if self.len == 0 {
            return 0;
        }
        let code = self.buffer[self.head];
        self.head = (self.head + 1) % BUFFER_LEN;
        self.len -= 1;
        code
    }

    /// `KEYSTAT dst` (§4.5: bit 0 non-empty, bit 1 full, bit 7 IRQ pending).
    pub fn status(&self) -> u8 {
        let mut s = KeyStatus::empty();
        s.set(KeyStatus::NON_EMPTY, self.len > 0);
        s.set(KeyStatus::FULL, self.len == BUFFER_LEN);
        s.set(KeyStatus::IRQ_PENDING, self.irq_pending);
        s.bits()
    }

    /// `KEYCOUNT dst`: number of codes currently buffered.
    pub fn count(&self) -> u8 {
        self.len as u8
    }

    /// `KEYCLEAR`: drops all buffered codes and clears the IRQ-pending bit.
    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.irq_pending = false;
    }

    /// Called by the CPU when it enters the keyboard interrupt handler.
    pub fn acknowledge_irq(&mut self) {
        self.irq_pending = false;
    }

    /// `KEYCTRL reg`/`KEYCTRL imm`.
    pub fn set_control(&mut self, value: u8) {
        self.control = KeyControl::from_bits_truncate(value);
    }

    pub fn control(&self) -> u8 {
        self.control.bits()
    }
}
