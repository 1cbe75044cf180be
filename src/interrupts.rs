//! Interrupt controller: 8 vectors, each with a pending and an enable bit
//! (`spec.md` §3 "Interrupt controller", §4.2.1).

use bitflags::bitflags;

pub const NUM_VECTORS: usize = 8;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct VectorMask: u8 {
        const V0 = 0b0000_0001;
        const V1 = 0b0000_0010;
        const V2 = 0b0000_0100;
        const V3 = 0b0000_1000;
        const V4 = 0b0001_0000;
        const V5 = 0b0010_0000;
        const V6 = 0b0100_0000;
        const V7 = 0b1000_0000;
    }
}

impl VectorMask {
    pub fn for_vector(vector: u8) -> Self {
        Self::from_bits_truncate(1u8 << vector)
    }
}

/// Which IRQ source owns which vector (§3). Vector 0 has the highest
/// arbitration priority, vector 7 the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vector {
    Timer = 0,
    Keyboard = 1,
    VBlank = 2,
    Sound0 = 3,
    Sound1 = 4,
    Reserved5 = 5,
    Reserved6 = 6,
    Reserved7 = 7,
}

/// Tracks raised-but-not-yet-serviced interrupts and which vectors the
/// program has unmasked. The global `INTERRUPT` flag in `Registers` is the
/// master enable; `enabled` here is the per-vector mask.
///
/// Gating for the timer and keyboard vectors already happens at the source
/// (`Timer`/`Keyboard` only call `raise` when their own `IRQ_ENABLE` bit is
/// set, per §4.7 "controlled by peripherals' own enable flags"), so all
/// eight vectors start enabled here; the controller's own mask exists for a
/// program that wants to selectively mask vectors itself.
#[derive(Debug, Clone)]
pub struct InterruptController {
    pending: VectorMask,
    enabled: VectorMask,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self {
            pending: VectorMask::empty(),
            enabled: VectorMask::all(),
        }
    }
}

impl InterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&mut self, vector: Vector) {
        self.pending |= VectorMask::for_vector(vector as u8);
    }

    pub fn raise_index(&mut self, vector: u8) {
        self.pending |= VectorMask::for_vector(vector);
    }

    pub fn set_enabled(&mut self, mask: VectorMask) {
        self.enabled = mask;
    }

    pub fn enabled(&self) -> VectorMask {
        self.enabled
    }

    pub fn pending(&self) -> VectorMask {
        self.pending
    }

    /// Returns the highest-priority vector that is both pending and
    /// enabled, without clearing it (`spec.md` §4.2.1 step 1: "if the
    /// global interrupt flag is set and at least one enabled vector is
    /// pending, service the lowest-numbered one first").
    pub fn highest_priority(&self) -> Option<u8> {
        let ready = self.pending & self.enabled;
        (0..NUM_VECTORS as u8).find(|&v| ready.contains(VectorMask::for_vector(v)))
    }

    /// Clears the pending bit for `vector`, as happens on interrupt entry.
    pub fn acknowledge(&mut self, vector: u8) {
        self.pending.remove(VectorMask::for_vector(vector));
    }
}
