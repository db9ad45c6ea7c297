//! Library to flash the RP42 calculator over its USB serial console.
//!
//! The RP42 runs its firmware from a single external flash chip, and the
//! firmware console exposes a line-oriented rewrite mode for reprogramming
//! it in place. The upload is a fixed five-phase sequence (erase, manual
//! reset, tail write, manual checkpoint, head write) driven by [`stm32`];
//! the operator front end lives in the `rp42-flasher-cli` crate.

pub mod stm32;

/// Flashing status
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Status {
    /// Synthetic erase progress; the target gives no completion signal, so
    /// this advances on a fixed clock.
    Erasing(f32),
    /// Fraction of the current write region sent to the target.
    Writing(f32),
}
