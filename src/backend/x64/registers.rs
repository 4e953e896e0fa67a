//! x64 register definitions and System V AMD64 ABI data.
//!
//! Provides the general-purpose and SSE register vocabulary consumed by the
//! encoder and the rewriter's allocator, plus compact bitset types for
//! register-set arithmetic and the DWARF numbering used to describe
//! patchpoint live-outs.

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// A 64-bit general-purpose register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// All 16 registers in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low 3 bits for the ModRM byte.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// True for r8-r15, which require a REX extension bit.
    #[inline(always)]
    pub const fn needs_rex_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// Convert from an encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Gpr> {
        if enc < 16 {
            Some(Gpr::ALL[enc as usize])
        } else {
            None
        }
    }

    /// Check if this register is callee-saved under the System V ABI.
    #[inline]
    pub const fn is_callee_save(self) -> bool {
        matches!(
            self,
            Gpr::Rbx | Gpr::Rsp | Gpr::Rbp | Gpr::R12 | Gpr::R13 | Gpr::R14 | Gpr::R15
        )
    }

    /// Map a DWARF register number to a GPR.
    ///
    /// The DWARF numbering interleaves rdx/rcx relative to the hardware
    /// encoding, so this is a table rather than a cast.
    pub const fn from_dwarf(dwarf: u16) -> Option<Gpr> {
        match dwarf {
            0 => Some(Gpr::Rax),
            1 => Some(Gpr::Rdx),
            2 => Some(Gpr::Rcx),
            3 => Some(Gpr::Rbx),
            4 => Some(Gpr::Rsi),
            5 => Some(Gpr::Rdi),
            6 => Some(Gpr::Rbp),
            7 => Some(Gpr::Rsp),
            8 => Some(Gpr::R8),
            9 => Some(Gpr::R9),
            10 => Some(Gpr::R10),
            11 => Some(Gpr::R11),
            12 => Some(Gpr::R12),
            13 => Some(Gpr::R13),
            14 => Some(Gpr::R14),
            15 => Some(Gpr::R15),
            _ => None,
        }
    }

    /// The DWARF register number of this GPR.
    pub const fn dwarf(self) -> u16 {
        match self {
            Gpr::Rax => 0,
            Gpr::Rdx => 1,
            Gpr::Rcx => 2,
            Gpr::Rbx => 3,
            Gpr::Rsi => 4,
            Gpr::Rdi => 5,
            Gpr::Rbp => 6,
            Gpr::Rsp => 7,
            Gpr::R8 => 8,
            Gpr::R9 => 9,
            Gpr::R10 => 10,
            Gpr::R11 => 11,
            Gpr::R12 => 12,
            Gpr::R13 => 13,
            Gpr::R14 => 14,
            Gpr::R15 => 15,
        }
    }
}

impl std::fmt::Display for Gpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        write!(f, "{}", NAMES[self.encoding() as usize])
    }
}

/// Integer argument registers, in ABI position order.
pub const ARG_REGS: [Gpr; 6] = [Gpr::Rdi, Gpr::Rsi, Gpr::Rdx, Gpr::Rcx, Gpr::R8, Gpr::R9];

// =============================================================================
// GPR Set
// =============================================================================

/// A set of GPRs using a 16-bit bitfield for O(1) operations.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct GprSet(u16);

impl GprSet {
    /// Empty register set.
    pub const EMPTY: GprSet = GprSet(0);

    /// All 16 registers.
    pub const ALL: GprSet = GprSet(0xFFFF);

    /// Callee-saved registers (rbx, rsp, rbp, r12-r15).
    pub const CALLEE_SAVED: GprSet = GprSet(
        1 << Gpr::Rbx as u16
            | 1 << Gpr::Rsp as u16
            | 1 << Gpr::Rbp as u16
            | 1 << Gpr::R12 as u16
            | 1 << Gpr::R13 as u16
            | 1 << Gpr::R14 as u16
            | 1 << Gpr::R15 as u16,
    );

    /// Default allocatable set: caller-saved integer registers.
    ///
    /// rsp/rbp are never allocatable; callee-saved registers are excluded
    /// because emitted code does not restore them at throwing call sites.
    /// They remain reachable as spill destinations.
    pub const ALLOCATABLE: GprSet = GprSet(
        1 << Gpr::Rax as u16
            | 1 << Gpr::Rcx as u16
            | 1 << Gpr::Rdx as u16
            | 1 << Gpr::Rsi as u16
            | 1 << Gpr::Rdi as u16
            | 1 << Gpr::R8 as u16
            | 1 << Gpr::R9 as u16
            | 1 << Gpr::R10 as u16
            | 1 << Gpr::R11 as u16,
    );

    /// Callee-saved registers usable as spill destinations (excludes rsp/rbp).
    pub const SPILLABLE_CALLEE_SAVED: GprSet = GprSet(
        1 << Gpr::Rbx as u16
            | 1 << Gpr::R12 as u16
            | 1 << Gpr::R13 as u16
            | 1 << Gpr::R14 as u16
            | 1 << Gpr::R15 as u16,
    );

    /// Registers addressable by `setcc` without a REX prefix (al/cl/dl/bl).
    pub const BYTE_ADDRESSABLE: GprSet = GprSet(
        1 << Gpr::Rax as u16 | 1 << Gpr::Rcx as u16 | 1 << Gpr::Rdx as u16 | 1 << Gpr::Rbx as u16,
    );

    /// Create a set containing a single register.
    #[inline(always)]
    pub const fn singleton(reg: Gpr) -> Self {
        GprSet(1 << reg.encoding())
    }

    /// Create from a raw bitmask.
    #[inline(always)]
    pub const fn from_bits(bits: u16) -> Self {
        GprSet(bits)
    }

    /// Get the raw bitmask.
    #[inline(always)]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Check if the set contains a register.
    #[inline(always)]
    pub const fn contains(self, reg: Gpr) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    /// Check if the set is empty.
    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add a register to the set.
    #[inline(always)]
    pub const fn insert(self, reg: Gpr) -> Self {
        GprSet(self.0 | (1 << reg.encoding()))
    }

    /// Remove a register from the set.
    #[inline(always)]
    pub const fn remove(self, reg: Gpr) -> Self {
        GprSet(self.0 & !(1 << reg.encoding()))
    }

    /// Union of two sets.
    #[inline(always)]
    pub const fn union(self, other: GprSet) -> Self {
        GprSet(self.0 | other.0)
    }

    /// Intersection of two sets.
    #[inline(always)]
    pub const fn intersection(self, other: GprSet) -> Self {
        GprSet(self.0 & other.0)
    }

    /// Difference (self - other).
    #[inline(always)]
    pub const fn difference(self, other: GprSet) -> Self {
        GprSet(self.0 & !other.0)
    }

    /// Count the number of registers in the set.
    #[inline(always)]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over members in encoding order.
    #[inline]
    pub fn iter(self) -> impl Iterator<Item = Gpr> {
        (0..16u8).filter_map(move |i| {
            if self.0 & (1 << i) != 0 {
                Gpr::from_encoding(i)
            } else {
                None
            }
        })
    }
}

impl std::fmt::Debug for GprSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// SSE Registers
// =============================================================================

/// An SSE register (xmm0-xmm15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
    Xmm3 = 3,
    Xmm4 = 4,
    Xmm5 = 5,
    Xmm6 = 6,
    Xmm7 = 7,
    Xmm8 = 8,
    Xmm9 = 9,
    Xmm10 = 10,
    Xmm11 = 11,
    Xmm12 = 12,
    Xmm13 = 13,
    Xmm14 = 14,
    Xmm15 = 15,
}

impl Xmm {
    /// All 16 registers in encoding order.
    pub const ALL: [Xmm; 16] = [
        Xmm::Xmm0,
        Xmm::Xmm1,
        Xmm::Xmm2,
        Xmm::Xmm3,
        Xmm::Xmm4,
        Xmm::Xmm5,
        Xmm::Xmm6,
        Xmm::Xmm7,
        Xmm::Xmm8,
        Xmm::Xmm9,
        Xmm::Xmm10,
        Xmm::Xmm11,
        Xmm::Xmm12,
        Xmm::Xmm13,
        Xmm::Xmm14,
        Xmm::Xmm15,
    ];

    /// Get the hardware encoding (0-15).
    #[inline(always)]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low 3 bits for the ModRM byte.
    #[inline(always)]
    pub const fn low_bits(self) -> u8 {
        self.encoding() & 0x7
    }

    /// True for xmm8-xmm15.
    #[inline(always)]
    pub const fn needs_rex_bit(self) -> bool {
        self.encoding() >= 8
    }

    /// Convert from an encoding value if valid.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Option<Xmm> {
        if enc < 16 {
            Some(Xmm::ALL[enc as usize])
        } else {
            None
        }
    }

    /// Map a DWARF register number (17-32) to an SSE register.
    pub const fn from_dwarf(dwarf: u16) -> Option<Xmm> {
        if dwarf >= 17 && dwarf <= 32 {
            Xmm::from_encoding((dwarf - 17) as u8)
        } else {
            None
        }
    }

    /// The DWARF register number of this SSE register.
    #[inline]
    pub const fn dwarf(self) -> u16 {
        self.encoding() as u16 + 17
    }
}

impl std::fmt::Display for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xmm{}", self.encoding())
    }
}

// =============================================================================
// SSE Register Set
// =============================================================================

/// A set of SSE registers using a 16-bit bitfield.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct XmmSet(u16);

impl XmmSet {
    pub const EMPTY: XmmSet = XmmSet(0);
    pub const ALL: XmmSet = XmmSet(0xFFFF);

    #[inline(always)]
    pub const fn singleton(reg: Xmm) -> Self {
        XmmSet(1 << reg.encoding())
    }

    #[inline(always)]
    pub const fn contains(self, reg: Xmm) -> bool {
        (self.0 & (1 << reg.encoding())) != 0
    }

    #[inline(always)]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn insert(self, reg: Xmm) -> Self {
        XmmSet(self.0 | (1 << reg.encoding()))
    }

    #[inline(always)]
    pub const fn remove(self, reg: Xmm) -> Self {
        XmmSet(self.0 & !(1 << reg.encoding()))
    }

    #[inline(always)]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate over members in encoding order.
    #[inline]
    pub fn iter(self) -> impl Iterator<Item = Xmm> {
        (0..16u8).filter_map(move |i| {
            if self.0 & (1 << i) != 0 {
                Xmm::from_encoding(i)
            } else {
                None
            }
        })
    }
}

impl std::fmt::Debug for XmmSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpr_encoding_roundtrip() {
        for reg in Gpr::ALL {
            assert_eq!(Gpr::from_encoding(reg.encoding()), Some(reg));
        }
        assert_eq!(Gpr::from_encoding(16), None);
    }

    #[test]
    fn test_gpr_callee_save() {
        assert!(Gpr::Rbx.is_callee_save());
        assert!(Gpr::R12.is_callee_save());
        assert!(Gpr::R15.is_callee_save());
        assert!(Gpr::Rsp.is_callee_save());
        assert!(!Gpr::Rax.is_callee_save());
        assert!(!Gpr::Rdi.is_callee_save());
        assert!(!Gpr::R11.is_callee_save());
    }

    #[test]
    fn test_gpr_dwarf_roundtrip() {
        for reg in Gpr::ALL {
            assert_eq!(Gpr::from_dwarf(reg.dwarf()), Some(reg));
        }
        // rdx/rcx are swapped relative to hardware encoding
        assert_eq!(Gpr::from_dwarf(1), Some(Gpr::Rdx));
        assert_eq!(Gpr::from_dwarf(2), Some(Gpr::Rcx));
        assert_eq!(Gpr::from_dwarf(33), None);
    }

    #[test]
    fn test_arg_regs() {
        assert_eq!(ARG_REGS[0], Gpr::Rdi);
        assert_eq!(ARG_REGS[1], Gpr::Rsi);
        assert_eq!(ARG_REGS[2], Gpr::Rdx);
        assert_eq!(ARG_REGS[3], Gpr::Rcx);
        assert_eq!(ARG_REGS[4], Gpr::R8);
        assert_eq!(ARG_REGS[5], Gpr::R9);
    }

    #[test]
    fn test_gpr_set_basic_ops() {
        let set = GprSet::EMPTY.insert(Gpr::Rax).insert(Gpr::R11);
        assert!(set.contains(Gpr::Rax));
        assert!(set.contains(Gpr::R11));
        assert!(!set.contains(Gpr::Rcx));
        assert_eq!(set.len(), 2);

        let removed = set.remove(Gpr::Rax);
        assert!(!removed.contains(Gpr::Rax));
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn test_gpr_set_allocatable_excludes_callee_saved() {
        assert!(GprSet::ALLOCATABLE
            .intersection(GprSet::CALLEE_SAVED)
            .is_empty());
        assert!(!GprSet::ALLOCATABLE.contains(Gpr::Rsp));
        assert!(!GprSet::ALLOCATABLE.contains(Gpr::Rbp));
        assert!(GprSet::ALLOCATABLE.contains(Gpr::Rax));
        assert!(GprSet::ALLOCATABLE.contains(Gpr::R11));
    }

    #[test]
    fn test_gpr_set_spillable_is_callee_saved() {
        for reg in GprSet::SPILLABLE_CALLEE_SAVED.iter() {
            assert!(reg.is_callee_save());
        }
        assert!(!GprSet::SPILLABLE_CALLEE_SAVED.contains(Gpr::Rsp));
        assert!(!GprSet::SPILLABLE_CALLEE_SAVED.contains(Gpr::Rbp));
    }

    #[test]
    fn test_gpr_set_iter_order() {
        let set = GprSet::EMPTY
            .insert(Gpr::R10)
            .insert(Gpr::Rax)
            .insert(Gpr::Rdi);
        let regs: Vec<Gpr> = set.iter().collect();
        assert_eq!(regs, vec![Gpr::Rax, Gpr::Rdi, Gpr::R10]);
    }

    #[test]
    fn test_xmm_dwarf() {
        assert_eq!(Xmm::Xmm0.dwarf(), 17);
        assert_eq!(Xmm::from_dwarf(17), Some(Xmm::Xmm0));
        assert_eq!(Xmm::from_dwarf(32), Some(Xmm::Xmm15));
        assert_eq!(Xmm::from_dwarf(16), None);
        assert_eq!(Xmm::from_dwarf(33), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Gpr::Rax.to_string(), "rax");
        assert_eq!(Gpr::R13.to_string(), "r13");
        assert_eq!(Xmm::Xmm4.to_string(), "xmm4");
    }
}
