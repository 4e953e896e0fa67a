//! Machine locations for rewriter operands.

use crate::backend::x64::registers::{Gpr, Xmm, ARG_REGS};

/// A tagged value naming a machine place a variable can live in.
///
/// `Stack` offsets are relative to the stack pointer at IC entry; `Scratch`
/// offsets are relative to the start of the per-IC scratch window (itself a
/// fixed rsp-relative region). `StackIndirect` names a pointer stored at an
/// rsp-relative slot plus an offset within the pointee; it only appears in
/// decref-info records handed to the unwinder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// A general-purpose register.
    Reg(Gpr),
    /// An SSE register.
    XmmReg(Xmm),
    /// A caller-stack slot: byte offset from the entry stack pointer.
    Stack(i32),
    /// A slot in the per-IC scratch window: byte offset within the window.
    Scratch(i32),
    /// Pointer at `Stack(outer)`, field at byte `inner` inside the pointee.
    StackIndirect(i32, i32),
    /// Any allocatable register; resolved by the allocator.
    AnyReg,
    /// No location.
    None,
    /// Not yet initialized.
    Uninitialized,
}

impl Location {
    /// The ABI location of integer call argument `argnum`.
    ///
    /// Positions 0-5 map to the six argument registers; later positions are
    /// caller-stack slots.
    pub fn for_arg(argnum: usize) -> Location {
        if let Some(&reg) = ARG_REGS.get(argnum) {
            return Location::Reg(reg);
        }
        Location::Stack(((argnum - ARG_REGS.len()) * 8) as i32)
    }

    /// True if a call clobbers this location.
    ///
    /// Caller-saved integer registers and all SSE registers are clobbered;
    /// stack and scratch slots survive.
    pub fn is_clobbered_by_call(self) -> bool {
        match self {
            Location::Reg(reg) => !reg.is_callee_save(),
            Location::XmmReg(_) => true,
            Location::Stack(_) | Location::Scratch(_) => false,
            _ => unreachable!("no clobber classification for {self}"),
        }
    }

    /// Map a DWARF register number to a location.
    pub fn from_dwarf(dwarf: u16) -> Option<Location> {
        if let Some(gpr) = Gpr::from_dwarf(dwarf) {
            return Some(Location::Reg(gpr));
        }
        Xmm::from_dwarf(dwarf).map(Location::XmmReg)
    }

    /// True for `Reg`.
    #[inline]
    pub fn is_reg(self) -> bool {
        matches!(self, Location::Reg(_))
    }

    /// True for memory locations (stack or scratch).
    #[inline]
    pub fn is_mem(self) -> bool {
        matches!(self, Location::Stack(_) | Location::Scratch(_))
    }

    /// Extract the GPR; panics on other variants.
    #[inline]
    pub fn as_gpr(self) -> Gpr {
        match self {
            Location::Reg(reg) => reg,
            _ => panic!("not a gp register: {self}"),
        }
    }

    /// Extract the SSE register; panics on other variants.
    #[inline]
    pub fn as_xmm(self) -> Xmm {
        match self {
            Location::XmmReg(reg) => reg,
            _ => panic!("not an xmm register: {self}"),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Reg(reg) => write!(f, "{reg}"),
            Location::XmmReg(reg) => write!(f, "{reg}"),
            Location::Stack(off) => write!(f, "stack({off})"),
            Location::Scratch(off) => write!(f, "scratch({off})"),
            Location::StackIndirect(outer, inner) => {
                write!(f, "stack_indirect({outer}, {inner})")
            }
            Location::AnyReg => write!(f, "anyreg"),
            Location::None => write!(f, "none"),
            Location::Uninitialized => write!(f, "uninitialized"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
