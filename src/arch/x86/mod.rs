//! x86/x86-64 implementations of the four engine components.

pub use self::decoder::{DecodeError, Decoder, InstructionRecord, OpcodeClass};
pub use self::relocator::{can_relocate, ReadOutcome, Relocator};
pub use self::writer::{BranchKind, Label, Writer};

pub mod decoder;
pub mod relocator;
mod thunk;
pub mod writer;
