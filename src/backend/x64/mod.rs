//! x64 backend modules.
//!
//! - `registers`: GPR/XMM register definitions, register sets, ABI data
//! - `encoder`: low-level instruction encoding (REX/ModRM/SIB)
//! - `assembler`: fixed-capacity code emission with labels and jump patching

pub mod assembler;
pub mod encoder;
pub mod registers;

pub use assembler::{Assembler, JumpDestination, Label};
pub use encoder::{Condition, EncodedInst, Indirect};
pub use registers::{Gpr, GprSet, Xmm, XmmSet, ARG_REGS};
