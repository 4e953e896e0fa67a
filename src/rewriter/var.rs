//! Symbolic operand variables.
//!
//! A `Var` names a value flowing through the fast path: an incoming
//! argument, a loaded attribute, a constant, a call result. During the
//! collecting phase only the use list grows; during the emitting phase the
//! location set and the use cursor move in lockstep with the action queue.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use super::location::Location;
use crate::backend::x64::encoder::MovWidth;

/// Index of a variable in the rewriter's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) u32);

impl VarId {
    #[inline(always)]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Reference-count ownership of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefType {
    /// Ownership not yet declared.
    #[default]
    Unknown,
    /// The fast path owns one reference; it must be handed off or decrefed.
    Owned,
    /// The fast path borrows the reference; no balancing is emitted.
    Borrowed,
}

/// What a location in the reverse map currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarSlot {
    /// A live variable.
    Var(VarId),
    /// Scratch bytes reserved for an allocation but not yet populated.
    Placeholder,
}

impl VarSlot {
    #[inline]
    pub(crate) fn var(self) -> Option<VarId> {
        match self {
            VarSlot::Var(id) => Some(id),
            VarSlot::Placeholder => None,
        }
    }
}

/// Arena entry for one variable.
pub(crate) struct VarData {
    /// Every location this value is currently materialized at.
    pub locations: SmallVec<[Location; 4]>,

    pub is_constant: bool,
    pub constant_value: u64,

    pub reftype: RefType,
    pub nullable: bool,

    /// Action indices that use this var, in queue order.
    pub uses: Vec<u32>,
    /// Cursor into `uses`, advanced during emit.
    pub next_use: usize,

    /// How many actions consume a reference to this var.
    pub num_refs_consumed: u32,
    /// `uses.len()` at the most recent `ref_consumed` call.
    pub last_refconsumed_numuses: u32,

    /// True for incoming arguments, which stay pinned until guarding ends.
    pub is_arg: bool,
    pub arg_loc: Location,

    /// `(first_slot, num_slots)` when this var owns a scratch region.
    pub scratch_allocation: Option<(i32, i32)>,

    /// Attribute guards already recorded, for dedup.
    pub attr_guards: FxHashSet<(i32, u64, bool)>,

    /// Memo of attribute loads, valid until the first mutation action.
    pub getattrs: FxHashMap<(i32, MovWidth), VarId>,
}

impl VarData {
    pub fn new() -> Self {
        VarData {
            locations: SmallVec::new(),
            is_constant: false,
            constant_value: 0,
            reftype: RefType::Unknown,
            nullable: false,
            uses: Vec::new(),
            next_use: 0,
            num_refs_consumed: 0,
            last_refconsumed_numuses: 0,
            is_arg: false,
            arg_loc: Location::None,
            scratch_allocation: None,
            attr_guards: FxHashSet::default(),
            getattrs: FxHashMap::default(),
        }
    }

    pub fn new_constant(value: u64) -> Self {
        let mut var = Self::new();
        var.is_constant = true;
        var.constant_value = value;
        var
    }

    #[inline]
    pub fn is_in_location(&self, loc: Location) -> bool {
        self.locations.contains(&loc)
    }

    /// True once the use cursor has consumed every recorded use.
    #[inline]
    pub fn is_done_using(&self) -> bool {
        self.next_use == self.uses.len()
    }

    /// True if the final consumer of this owned reference transfers
    /// ownership, so no decref is synthesized at release.
    pub fn ref_handed_off(&self) -> bool {
        self.reftype == RefType::Owned
            && self.num_refs_consumed > 0
            && self.last_refconsumed_numuses as usize == self.uses.len()
    }

    /// Whether the unwinder (or release) must decref this var if
    /// `current_action` throws.
    ///
    /// Not owned: no. Nothing consumed the reference: yes. Otherwise only
    /// if `current_action` is not the hand-off point.
    pub fn needs_decref(&self, current_action: usize) -> bool {
        if self.reftype != RefType::Owned {
            return false;
        }
        if self.num_refs_consumed == 0 {
            return true;
        }
        let handoff_action = self.uses[self.last_refconsumed_numuses as usize - 1];
        handoff_action as usize != current_action
    }

    /// The scratch location of a byte within this var's scratch region.
    pub fn scratch_location(&self, additional_bytes: i32) -> Location {
        let (first_slot, _) = self
            .scratch_allocation
            .expect("var has no scratch allocation");
        Location::Scratch(first_slot * 8 + additional_bytes)
    }
}

// =============================================================================
// Tests
// =============================================================================
