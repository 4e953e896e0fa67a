//! Inline-cache rewriter for the Ember runtime.
//!
//! A small deterministic code generator that specializes dynamic-dispatch
//! sites at runtime. Client code describes a fast path as a sequence of
//! high-level actions (guard a pointer, load an attribute, call a helper,
//! adjust reference counts, return) against symbolic operand handles; the
//! rewriter then resolves every operand to a concrete machine location,
//! performs on-the-fly register allocation with spill/reload, tracks
//! reference-count ownership, and commits native x64 code into a slot
//! carved out of a patchpoint.
//!
//! # Architecture
//!
//! ```text
//! IC builder ──actions──▶ Rewriter (collecting phase)
//!                             │ commit()
//!                             ▼
//!                         Rewriter (emitting phase)
//!                             │ register allocation, refcounting,
//!                             │ guard routing
//!                             ▼
//!                         SlotRewrite ──install──▶ IcInfo slot
//! ```
//!
//! - `backend::x64`: instruction encoding and the byte-buffer assembler
//! - `ic`: patchpoint metadata, slot reservation, commit/abort
//! - `rewriter`: the two-phase action/assembly engine
//! - `runtime`: object-layout facade consumed by the emitted code
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod ic;
pub mod rewriter;
pub mod runtime;

pub use backend::x64::assembler::Assembler;
pub use backend::x64::registers::{Gpr, GprSet, Xmm, XmmSet};
pub use ic::{IcError, IcInfo, IcMetadata, IcStatsSnapshot, SlotRewrite};
pub use rewriter::location::Location;
pub use rewriter::var::{RefType, VarId};
pub use rewriter::{MovWidth, Rewriter, SetattrKind};
pub use runtime::RuntimeRef;
