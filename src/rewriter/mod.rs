//! The two-phase action/assembly engine.
//!
//! A [`Rewriter`] is created against one [`SlotRewrite`] reservation and
//! driven in two phases:
//!
//! 1. **Collecting**: builder calls (`add_guard`, `get_attr`, `call`,
//!    `set_attr`, ...) each append one deferred action over symbolic
//!    [`VarId`] handles and return fresh result handles. No instructions
//!    are emitted and no emit-phase state exists yet.
//! 2. **Emitting**: entered by `commit()`. Actions run in order; every var
//!    is resolved to concrete machine locations with on-the-fly register
//!    allocation (farthest-next-use eviction, spill to callee-saved
//!    registers then scratch), reference counts are balanced with
//!    synthesized increfs/decrefs, guards are routed to a shared slow-path
//!    exit, and the result is installed into the slot.
//!
//! Resource exhaustion (scratch full, slot overflow, no spill destination)
//! folds into a sticky `failed` flag and a clean abort; misuse of the API
//! is a programmer error and panics.

pub mod location;
pub mod var;

mod actions;
mod const_loader;

#[cfg(test)]
mod integration_tests;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::backend::x64::assembler::{Assembler, JumpDestination};
use crate::backend::x64::encoder::{Condition, Indirect};
use crate::backend::x64::registers::{Gpr, GprSet, Xmm, ARG_REGS};
use crate::ic::{DecrefInfo, IcInfo, SlotRewrite, SlowPathJump, IC_INVALIDATION_HEADER_SIZE};
use crate::runtime;
use crate::runtime::RuntimeRef;

use actions::{Action, ActionCategory, ActionKind, CmpOp};
use const_loader::ConstLoader;
use location::Location;
use var::{RefType, VarData, VarId, VarSlot};

pub use crate::backend::x64::encoder::MovWidth;

/// True if `val` is representable as a sign-extended 32-bit immediate.
///
/// This single predicate governs immediate-vs-register compares, direct
/// vs indirect counter updates, and near vs register-indirect calls.
#[inline]
pub(crate) const fn fits_i32(val: u64) -> bool {
    val as i64 >= i32::MIN as i64 && val as i64 <= i32::MAX as i64
}

/// A constant too large for an imm32 operand.
#[inline]
pub(crate) const fn is_large_constant(val: u64) -> bool {
    !fits_i32(val)
}

/// Ownership contract of a `set_attr` store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetattrKind {
    /// Caller makes no promise about the stored reference's lifetime.
    Unknown,
    /// The store borrows the reference; someone else keeps it alive.
    RefUsed,
    /// The store transfers ownership to the containing object.
    HandedOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Collecting,
    Emitting,
}

// =============================================================================
// Rewriter
// =============================================================================

/// The inline-cache rewriter engine.
pub struct Rewriter<'ic> {
    rewrite: SlotRewrite<'ic>,
    asm: Assembler,
    phase: Phase,

    vars: Vec<VarData>,
    actions: Vec<Action>,
    /// Reverse map from machine locations to their occupants.
    vars_by_location: FxHashMap<Location, VarSlot>,
    const_loader: ConstLoader,

    args: Vec<VarId>,
    live_outs: Vec<VarId>,
    live_out_regs: Vec<u16>,
    return_location: Location,
    allocatable_regs: GprSet,
    spill_regs: GprSet,

    decref_infos: Vec<DecrefInfo>,
    next_slot_jmps: Vec<SlowPathJump>,
    owned_attrs: Vec<(VarId, i32)>,
    retained_refs: Vec<RuntimeRef>,
    picked_slot_addr: Option<u64>,

    failed: bool,
    finished: bool,
    done_guarding: bool,
    added_changing_action: bool,
    marked_inside_ic: bool,
    needs_invalidation_support: bool,
    last_guard_action: Option<usize>,
    current_action: usize,
}

impl<'ic> Rewriter<'ic> {
    /// Begin a rewrite of `ic` if the site is still worth specializing.
    pub fn create(ic: &'ic IcInfo, num_args: usize) -> Option<Rewriter<'ic>> {
        if !ic.should_attempt() {
            return None;
        }
        let rewrite = ic.start_rewrite().ok()?;
        Some(Self::new(rewrite, num_args))
    }

    /// Build a rewriter over an existing slot reservation.
    pub fn new(rewrite: SlotRewrite<'ic>, num_args: usize) -> Rewriter<'ic> {
        let metadata = rewrite.ic().metadata().clone();
        let mut rw = Rewriter {
            asm: Assembler::new(metadata.slot_size),
            rewrite,
            phase: Phase::Collecting,
            vars: Vec::new(),
            actions: Vec::new(),
            vars_by_location: FxHashMap::default(),
            const_loader: ConstLoader::new(),
            args: Vec::new(),
            live_outs: Vec::new(),
            live_out_regs: Vec::new(),
            return_location: Location::Reg(metadata.return_register),
            allocatable_regs: metadata.allocatable_regs,
            spill_regs: metadata.spill_regs,
            decref_infos: Vec::new(),
            next_slot_jmps: Vec::new(),
            owned_attrs: Vec::new(),
            retained_refs: Vec::new(),
            picked_slot_addr: None,
            failed: false,
            finished: false,
            done_guarding: false,
            added_changing_action: false,
            marked_inside_ic: false,
            needs_invalidation_support: metadata.needs_invalidation_support,
            last_guard_action: None,
            current_action: 0,
        };

        // Incoming arguments are pinned at their ABI locations until
        // guarding completes.
        for i in 0..num_args {
            let l = Location::for_arg(i);
            let var = rw.push_var(VarData::new());
            {
                let v = &mut rw.vars[var.index()];
                v.is_arg = true;
                v.arg_loc = l;
                v.locations.push(l);
            }
            rw.vars_by_location.insert(l, VarSlot::Var(var));
            rw.args.push(var);
        }

        // Live-outs become vars pinned at their DWARF-described registers
        // so the allocator preserves them across the fast path.
        for &dwarf in &metadata.live_out_regs {
            let l = Location::from_dwarf(dwarf).expect("bad live-out dwarf number");
            assert_ne!(l, rw.return_location, "return register listed as live-out");
            let var = match rw.vars_by_location.get(&l) {
                Some(slot) => slot.var().expect("placeholder at live-out location"),
                None => {
                    let var = rw.push_var(VarData::new());
                    rw.vars[var.index()].locations.push(l);
                    rw.vars_by_location.insert(l, VarSlot::Var(var));
                    var
                }
            };
            debug_assert!(!rw.live_out_regs.contains(&dwarf), "duplicate live-out");
            rw.live_outs.push(var);
            rw.live_out_regs.push(dwarf);
        }

        rw
    }

    // =========================================================================
    // Phase discipline
    // =========================================================================

    #[inline]
    fn assert_phase_collecting(&self) {
        assert!(
            self.phase == Phase::Collecting,
            "collect-phase operation called while emitting"
        );
    }

    #[inline]
    fn assert_phase_emitting(&self) {
        assert!(
            self.phase == Phase::Emitting,
            "emit-phase operation called while collecting"
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The var holding incoming argument `i`.
    pub fn get_arg(&self, i: usize) -> VarId {
        self.args[i]
    }

    /// Number of incoming arguments.
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Where the fast path's result must land.
    pub fn return_destination(&self) -> Location {
        self.return_location
    }

    /// True once a resource limit was hit; commit will abort.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// True after commit or abort.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The assembler, for post-commit inspection.
    pub fn assembler(&self) -> &Assembler {
        &self.asm
    }

    /// Retain an object whose address is baked into the emitted code.
    pub fn retain_reference(&mut self, obj: RuntimeRef) {
        self.retained_refs.push(obj);
    }

    // =========================================================================
    // Var and action plumbing
    // =========================================================================

    fn push_var(&mut self, data: VarData) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(data);
        id
    }

    fn create_var(&mut self) -> VarId {
        self.assert_phase_collecting();
        self.push_var(VarData::new())
    }

    fn create_constant_var(&mut self, val: u64) -> VarId {
        self.assert_phase_collecting();
        self.push_var(VarData::new_constant(val))
    }

    /// Materialize a 64-bit constant as a var, deduplicated per rewrite.
    pub fn load_const(&mut self, val: u64) -> VarId {
        self.assert_phase_collecting();
        if let Some(var) = self.const_loader.find(val) {
            return var;
        }
        let var = self.create_constant_var(val);
        self.const_loader.consts.push((val, var));
        var
    }

    fn add_action(&mut self, kind: ActionKind, deps: &[VarId], category: ActionCategory) {
        self.assert_phase_collecting();

        // Guards after a mutation cannot be re-ordered to the front; give
        // up on the rewrite instead.
        if category == ActionCategory::Guard && self.added_changing_action {
            self.failed = true;
            return;
        }

        let idx = self.actions.len() as u32;
        for &dep in deps {
            self.vars[dep.index()].uses.push(idx);
        }

        match category {
            ActionCategory::Guard => {
                // Every guard uses every arg: restore_args keeps them pinned
                // at their ABI locations until guarding completes.
                for arg in self.args.clone() {
                    self.vars[arg.index()].uses.push(idx);
                }
                self.last_guard_action = Some(idx as usize);
            }
            ActionCategory::Mutation => {
                self.added_changing_action = true;
            }
            ActionCategory::Normal => {}
        }

        self.actions.push(Action::new(kind, category));
    }

    // =========================================================================
    // Collecting API: guards
    // =========================================================================

    /// Guard that `var` equals `val`, exiting to the slow path otherwise.
    pub fn add_guard(&mut self, var: VarId, val: u64) {
        if self.vars[var.index()].is_constant {
            assert_eq!(
                self.vars[var.index()].constant_value,
                val,
                "added guard which is always false"
            );
            return;
        }
        let val_var = self.load_const(val);
        self.add_action(
            ActionKind::Guard {
                var,
                val: val_var,
                negate: false,
            },
            &[var, val_var],
            ActionCategory::Guard,
        );
    }

    /// Guard that `var` does not equal `val`.
    pub fn add_guard_not_eq(&mut self, var: VarId, val: u64) {
        let val_var = self.load_const(val);
        self.add_action(
            ActionKind::Guard {
                var,
                val: val_var,
                negate: true,
            },
            &[var, val_var],
            ActionCategory::Guard,
        );
    }

    /// Guard that `var`, viewed as signed, is not negative.
    pub fn add_guard_not_lt0(&mut self, var: VarId) {
        self.add_action(
            ActionKind::GuardNotLt0 { var },
            &[var],
            ActionCategory::Guard,
        );
    }

    /// Guard on a field of `var`. Duplicate guards are dropped.
    pub fn add_attr_guard(&mut self, var: VarId, offset: i32, val: u64, negate: bool) {
        if !self.vars[var.index()].attr_guards.insert((offset, val, negate)) {
            return; // duplicate guard
        }
        let val_var = self.load_const(val);
        self.add_action(
            ActionKind::AttrGuard {
                var,
                offset,
                val: val_var,
                negate,
            },
            &[var, val_var],
            ActionCategory::Guard,
        );
    }

    // =========================================================================
    // Collecting API: attributes
    // =========================================================================

    /// Load a field of `var`. Loads are memoized per `(offset, width)`
    /// until the first mutation action.
    pub fn get_attr(&mut self, var: VarId, offset: i32, width: MovWidth) -> VarId {
        self.get_attr_into(var, offset, Location::AnyReg, width)
    }

    /// Load a field of `var` into a specific destination.
    ///
    /// Only destination-agnostic loads participate in the memo; a pinned
    /// destination always produces a fresh load.
    pub fn get_attr_into(
        &mut self,
        var: VarId,
        offset: i32,
        dest: Location,
        width: MovWidth,
    ) -> VarId {
        self.assert_phase_collecting();

        if !self.added_changing_action && dest == Location::AnyReg {
            if let Some(&cached) = self.vars[var.index()].getattrs.get(&(offset, width)) {
                return cached;
            }
            let result = self.create_var();
            self.vars[var.index()].getattrs.insert((offset, width), result);
            self.add_action(
                ActionKind::GetAttr {
                    result,
                    ptr: var,
                    offset,
                    dest,
                    width,
                },
                &[var],
                ActionCategory::Normal,
            );
            return result;
        }

        let result = self.create_var();
        self.add_action(
            ActionKind::GetAttr {
                result,
                ptr: var,
                offset,
                dest,
                width,
            },
            &[var],
            ActionCategory::Normal,
        );
        result
    }

    /// Load a 32-bit float field, widening it to a double.
    pub fn get_attr_float(&mut self, var: VarId, offset: i32, dest: Location) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionKind::GetAttrFloat {
                result,
                ptr: var,
                offset,
                dest,
            },
            &[var],
            ActionCategory::Normal,
        );
        result
    }

    /// Load a double field.
    pub fn get_attr_double(&mut self, var: VarId, offset: i32, dest: Location) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionKind::GetAttrDouble {
                result,
                ptr: var,
                offset,
                dest,
            },
            &[var],
            ActionCategory::Normal,
        );
        result
    }

    /// Store `val` into a field of `var`.
    ///
    /// When `val` is an owned reference the caller must declare the store's
    /// ownership contract; pair `HandedOff` stores with [`ref_consumed`].
    ///
    /// [`ref_consumed`]: Rewriter::ref_consumed
    pub fn set_attr(
        &mut self,
        var: VarId,
        offset: i32,
        val: VarId,
        kind: SetattrKind,
        width: MovWidth,
    ) {
        if self.vars[val.index()].reftype == RefType::Owned {
            debug_assert!(
                kind != SetattrKind::Unknown,
                "owned reference stored without a lifetime contract"
            );
        }
        debug_assert!(width == MovWidth::Q || kind == SetattrKind::Unknown);
        self.add_action(
            ActionKind::SetAttr {
                ptr: var,
                offset,
                val,
                width,
            },
            &[var, val],
            ActionCategory::Mutation,
        );
    }

    /// Store `val` into a field, releasing the previous value.
    pub fn replace_attr(&mut self, var: VarId, offset: i32, val: VarId, prev_nullable: bool) {
        let prev = self.get_attr(var, offset, MovWidth::Q);
        self.set_attr(var, offset, val, SetattrKind::HandedOff, MovWidth::Q);
        self.ref_consumed(val);

        if prev_nullable {
            self.set_nullable(prev, true);
            self.xdecref(prev);
        } else {
            self.decref(prev);
        }
    }

    // =========================================================================
    // Collecting API: reference counting
    // =========================================================================

    /// Emit an incref of `var`.
    pub fn incref(&mut self, var: VarId) {
        self.add_action(ActionKind::Incref { var }, &[var], ActionCategory::Mutation);
    }

    /// Emit a decref of `var`, calling its dealloc slot at zero.
    pub fn decref(&mut self, var: VarId) {
        self.add_action(ActionKind::Decref { var }, &[var], ActionCategory::Mutation);
    }

    /// Emit a null-safe decref of `var`.
    pub fn xdecref(&mut self, var: VarId) {
        self.add_action(ActionKind::Xdecref { var }, &[var], ActionCategory::Mutation);
    }

    /// Record that the most recent action consumes one reference to `var`.
    pub fn ref_consumed(&mut self, var: VarId) {
        {
            let v = &mut self.vars[var.index()];
            debug_assert!(
                v.reftype != RefType::Unknown || (v.is_constant && v.constant_value == 0),
                "ref_consumed on a var with undeclared ownership"
            );
            v.num_refs_consumed += 1;
            v.last_refconsumed_numuses = v.uses.len() as u32;
        }
        self.actions
            .last_mut()
            .expect("ref_consumed with no pending action")
            .consumed_refs
            .push(var);
    }

    /// Declare the ownership of `var`. May only tighten `Unknown`.
    pub fn set_type(&mut self, var: VarId, reftype: RefType) -> VarId {
        assert!(reftype != RefType::Unknown);
        let v = &mut self.vars[var.index()];
        debug_assert!(v.reftype == RefType::Unknown || v.reftype == reftype);
        if v.reftype == RefType::Unknown {
            v.reftype = reftype;
        }
        var
    }

    /// Mark whether `var` may be null.
    pub fn set_nullable(&mut self, var: VarId, nullable: bool) -> VarId {
        self.vars[var.index()].nullable = nullable;
        var
    }

    /// Track that a scratch-resident container owns the reference stored at
    /// `byte_offset` inside it, so the unwinder can release it.
    pub fn register_owned_attr(&mut self, var: VarId, byte_offset: i32) {
        self.add_action(
            ActionKind::RegisterOwnedAttr {
                var,
                offset: byte_offset,
            },
            &[var],
            ActionCategory::Normal,
        );
    }

    /// End the tracking started by [`register_owned_attr`].
    ///
    /// [`register_owned_attr`]: Rewriter::register_owned_attr
    pub fn deregister_owned_attr(&mut self, var: VarId, byte_offset: i32) {
        self.add_action(
            ActionKind::DeregisterOwnedAttr {
                var,
                offset: byte_offset,
            },
            &[var],
            ActionCategory::Normal,
        );
    }

    // =========================================================================
    // Collecting API: comparisons, arithmetic, misc
    // =========================================================================

    /// Materialize `lhs == rhs` as 0/1.
    pub fn cmp_eq(&mut self, lhs: VarId, rhs: VarId) -> VarId {
        self.cmp(lhs, rhs, CmpOp::Eq)
    }

    /// Materialize `lhs != rhs` as 0/1.
    pub fn cmp_neq(&mut self, lhs: VarId, rhs: VarId) -> VarId {
        self.cmp(lhs, rhs, CmpOp::NotEq)
    }

    fn cmp(&mut self, lhs: VarId, rhs: VarId, op: CmpOp) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionKind::Cmp {
                result,
                lhs,
                rhs,
                op,
                dest: Location::AnyReg,
            },
            &[lhs, rhs],
            ActionCategory::Normal,
        );
        result
    }

    /// Materialize `var != 0` as 0/1.
    pub fn to_bool(&mut self, var: VarId) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionKind::ToBool {
                result,
                var,
                dest: Location::AnyReg,
            },
            &[var],
            ActionCategory::Normal,
        );
        result
    }

    /// Materialize `var + imm`.
    pub fn add(&mut self, var: VarId, imm: i64) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionKind::Add {
                result,
                var,
                imm,
                dest: Location::AnyReg,
            },
            &[var],
            ActionCategory::Normal,
        );
        result
    }

    /// Record an assembler comment at this point in the action stream.
    pub fn comment(&mut self, text: &str) {
        self.add_action(
            ActionKind::Comment {
                text: text.to_owned(),
            },
            &[],
            ActionCategory::Normal,
        );
    }

    /// Emit an int3 breakpoint.
    pub fn trap(&mut self) {
        self.add_action(ActionKind::Trap, &[], ActionCategory::Normal);
    }

    // =========================================================================
    // Collecting API: scratch allocation
    // =========================================================================

    /// Reserve `n` contiguous 8-byte scratch slots.
    pub fn allocate(&mut self, n: i32) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionKind::Allocate { result, slots: n },
            &[],
            ActionCategory::Normal,
        );
        result
    }

    /// Reserve `n` scratch slots and copy `n` words from `*array_ptr`.
    pub fn allocate_and_copy(&mut self, array_ptr: VarId, n: i32) -> VarId {
        let result = self.create_var();
        self.add_action(
            ActionKind::AllocateAndCopy {
                result,
                src: array_ptr,
                slots: n,
            },
            &[array_ptr],
            ActionCategory::Normal,
        );
        result
    }

    /// Reserve `n_rest + 1` scratch slots holding `first_elem` followed by
    /// `n_rest` words copied from `*rest_ptr`.
    pub fn allocate_and_copy_plus1(
        &mut self,
        first_elem: VarId,
        rest_ptr: Option<VarId>,
        n_rest: i32,
    ) -> VarId {
        if n_rest > 0 {
            assert!(rest_ptr.is_some());
        } else {
            assert!(rest_ptr.is_none());
        }
        let result = self.create_var();
        let mut deps: SmallVec<[VarId; 2]> = SmallVec::new();
        deps.push(first_elem);
        if let Some(rest) = rest_ptr {
            deps.push(rest);
        }
        self.add_action(
            ActionKind::AllocateAndCopyPlus1 {
                result,
                first: first_elem,
                rest: rest_ptr,
                n_rest,
            },
            &deps,
            ActionCategory::Normal,
        );
        result
    }

    // =========================================================================
    // Collecting API: calls
    // =========================================================================

    /// Call a helper function.
    ///
    /// Integer arguments are placed in the ABI argument registers; XMM
    /// arguments must already sit in their positional XMM registers.
    /// `extra_uses` keeps vars alive across the call without passing them.
    pub fn call(
        &mut self,
        has_side_effects: bool,
        func: u64,
        args: &[VarId],
        args_xmm: &[VarId],
        extra_uses: &[VarId],
    ) -> VarId {
        debug_assert!(args.len() <= ARG_REGS.len(), "stack call arguments unsupported");
        let result = self.create_var();
        let category = if has_side_effects {
            ActionCategory::Mutation
        } else {
            ActionCategory::Normal
        };

        let mut deps: SmallVec<[VarId; 8]> = SmallVec::new();
        deps.extend_from_slice(args);
        deps.extend_from_slice(args_xmm);
        deps.extend_from_slice(extra_uses);

        self.add_action(
            ActionKind::Call {
                result,
                func,
                has_side_effects,
                can_throw: true,
                args: args.iter().copied().collect(),
                args_xmm: args_xmm.iter().copied().collect(),
                extra_uses: extra_uses.iter().copied().collect(),
            },
            &deps,
            category,
        );
        result
    }

    /// Compare a helper's return value against its error sentinel and
    /// raise the pending C-API exception on match.
    pub fn check_and_throw_capi_exception(&mut self, var: VarId, exc_val: i64, width: MovWidth) {
        self.add_action(
            ActionKind::CheckAndThrowCapiException {
                var,
                exc_val,
                width,
            },
            &[var],
            ActionCategory::Mutation,
        );
    }

    // =========================================================================
    // Terminals
    // =========================================================================

    /// Commit, returning `var` (as a new reference) in the return register.
    pub fn commit_returning(&mut self, var: VarId) {
        assert!(
            self.vars[var.index()].reftype != RefType::Unknown,
            "returned var has undeclared ownership"
        );
        self.add_action(ActionKind::PlaceReturn { var }, &[var], ActionCategory::Normal);
        self.ref_consumed(var);
        self.commit();
    }

    /// Commit, returning a non-refcounted value in the return register.
    pub fn commit_returning_non_python(&mut self, var: VarId) {
        assert!(self.vars[var.index()].reftype == RefType::Unknown);
        self.add_action(ActionKind::PlaceReturn { var }, &[var], ActionCategory::Normal);
        self.commit();
    }

    /// Abandon the rewrite, releasing retained references.
    pub fn abort(&mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        assert!(!self.finished, "terminal call on a finished rewrite");
        self.finished = true;
        self.rewrite.abort();
        self.retained_refs.clear();
    }

    /// Run the emitting phase and install the result.
    pub fn commit(&mut self) {
        assert!(
            self.owned_attrs.is_empty(),
            "missing a call to deregister_owned_attr"
        );
        assert!(!self.finished, "terminal call on a finished rewrite");
        self.phase = Phase::Emitting;

        if self.failed {
            self.rewrite.note_failed();
            self.abort_inner();
            return;
        }

        // If any retained object is already down to our reference, the
        // specialization is dead on arrival.
        if self.retained_refs.iter().any(|r| r.refcount() == 1) {
            self.abort_inner();
            return;
        }

        if self.asm.has_failed() {
            self.rewrite.note_assembly_fail();
            self.abort_inner();
            return;
        }

        // Live-outs and constants get a synthetic use at the end so they
        // stay available; a "spilled" constant costs nothing and keeps it
        // reachable for lea-based materialization.
        let actions_len = self.actions.len() as u32;
        for lo in self.live_outs.clone() {
            self.vars[lo.index()].uses.push(actions_len);
        }
        for v in &mut self.vars {
            if v.is_constant {
                v.uses.push(actions_len);
            }
        }

        self.assert_consistent();

        if self.last_guard_action.is_none() {
            self.finish_guarding();
        }

        let Some(slot_addr) = self.rewrite.prepare_entry() else {
            self.rewrite.note_assembly_fail();
            self.abort_inner();
            return;
        };
        self.picked_slot_addr = Some(slot_addr);

        for i in 0..self.actions.len() {
            // A consumer that is not the final hand-off needs its own
            // reference; synthesize the incref before the action runs.
            let consumed: SmallVec<[VarId; 2]> = self.actions[i].consumed_refs.clone();
            for var in consumed {
                let v = &self.vars[var.index()];
                if v.ref_handed_off() {
                    let last_used_action =
                        v.uses[v.last_refconsumed_numuses as usize - 1] as usize;
                    if last_used_action == i {
                        continue;
                    }
                    debug_assert!(last_used_action >= i);
                }
                debug_assert!(self.done_guarding);
                self.emit_incref(var, 1);
            }

            self.current_action = i;
            let kind = self.actions[i].kind.clone();
            self.emit_action_kind(kind);

            if self.failed {
                self.rewrite.note_failed();
                self.abort_inner();
                return;
            }
            self.assert_consistent();

            if Some(i) == self.last_guard_action {
                self.finish_guarding();
            }
        }

        assert!(
            self.owned_attrs.is_empty(),
            "missing a call to deregister_owned_attr"
        );

        if self.marked_inside_ic {
            self.asm.comment("mark inside ic");
            debug_assert!(self.needs_invalidation_support);
            let addr = self.rewrite.num_inside_addr();
            if is_large_constant(addr) {
                let reg = self.alloc_reg(Location::AnyReg, self.return_location);
                self.load_const_into_reg(addr, reg);
                self.asm.dec_mem(Indirect::new(reg, 0), MovWidth::L);
            } else {
                self.asm.dec_abs(addr as i32, MovWidth::L);
            }
        }

        self.asm.comment("live outs");

        // All uses must be accounted for now, except the live-out and
        // constant extras added above.
        #[cfg(debug_assertions)]
        for (idx, v) in self.vars.iter().enumerate() {
            let num_as_live_out = self
                .live_outs
                .iter()
                .filter(|lo| lo.index() == idx)
                .count();
            debug_assert_eq!(
                v.next_use + num_as_live_out + usize::from(v.is_constant),
                v.uses.len()
            );
        }

        debug_assert_eq!(self.live_out_regs.len(), self.live_outs.len());

        for idx in 0..self.vars.len() {
            if self.vars[idx].is_constant {
                self.bump_use(VarId(idx as u32));
            }
        }

        self.place_live_outs();

        for lo in self.live_outs.clone() {
            // Automatic refcounting cannot see past the slot boundary.
            debug_assert_eq!(self.vars[lo.index()].reftype, RefType::Unknown);
            self.bump_use(lo);
        }

        #[cfg(debug_assertions)]
        {
            for v in &self.vars {
                debug_assert_eq!(v.next_use, v.uses.len());
            }
            for (&l, &slot) in &self.vars_by_location {
                debug_assert_eq!(slot, VarSlot::Placeholder, "live var left at {l}");
            }
        }

        if self.asm.has_failed() {
            self.rewrite.note_assembly_fail();
            self.abort_inner();
            return;
        }

        let decref_infos = std::mem::take(&mut self.decref_infos);
        let retained = std::mem::take(&mut self.retained_refs);
        let jmps = std::mem::take(&mut self.next_slot_jmps);
        match self.rewrite.commit(&mut self.asm, decref_infos, retained, &jmps) {
            Ok(()) => self.finished = true,
            Err(_) => {
                self.rewrite.note_assembly_fail();
                self.abort_inner();
            }
        }
    }

    /// Iteratively move each live-out into its declared register, releasing
    /// its other locations. Conflict cycles would stall the loop and are
    /// asserted against.
    fn place_live_outs(&mut self) {
        let mut num_to_move = self.live_outs.len();
        let mut moved = vec![false; num_to_move];
        while num_to_move > 0 {
            let start_move = num_to_move;
            for i in 0..self.live_outs.len() {
                if moved[i] {
                    continue;
                }
                let expected =
                    Location::from_dwarf(self.live_out_regs[i]).expect("bad live-out dwarf");
                let var = self.live_outs[i];

                if self.vars[var.index()].is_in_location(expected) {
                    moved[i] = true;
                    num_to_move -= 1;
                    continue;
                }
                if self.vars_by_location.contains_key(&expected) {
                    continue;
                }

                match expected {
                    Location::Reg(r) => {
                        let reg = self.get_in_reg(var, expected, false, Location::AnyReg);
                        debug_assert_eq!(reg, r);
                    }
                    Location::XmmReg(x) => {
                        let reg = self.get_in_xmm_reg(var, expected);
                        debug_assert_eq!(reg, x);
                    }
                    _ => unreachable!("live-out at {expected}"),
                }

                for l in self.vars[var.index()].locations.clone() {
                    if l == expected {
                        continue;
                    }
                    self.remove_location_from_var(var, l);
                }

                moved[i] = true;
                num_to_move -= 1;
            }
            assert!(
                num_to_move < start_move,
                "live-out placement found a conflict cycle"
            );
        }

        #[cfg(debug_assertions)]
        for i in 0..self.live_outs.len() {
            let expected = Location::from_dwarf(self.live_out_regs[i]).unwrap();
            debug_assert!(self.vars[self.live_outs[i].index()].is_in_location(expected));
        }
    }

    fn finish_guarding(&mut self) {
        self.done_guarding = true;
        for arg in self.args.clone() {
            if self.vars[arg.index()].is_done_using() {
                self.release(arg);
            }
        }
        self.assert_consistent();
    }
}

// =============================================================================
// Emitting internals
// =============================================================================

impl Rewriter<'_> {
    fn emit_action_kind(&mut self, kind: ActionKind) {
        match kind {
            ActionKind::Guard { var, val, negate } => self.emit_guard(var, val, negate),
            ActionKind::GuardNotLt0 { var } => self.emit_guard_not_lt0(var),
            ActionKind::AttrGuard {
                var,
                offset,
                val,
                negate,
            } => self.emit_attr_guard(var, offset, val, negate),
            ActionKind::GetAttr {
                result,
                ptr,
                offset,
                dest,
                width,
            } => self.emit_get_attr(result, ptr, offset, dest, width),
            ActionKind::GetAttrFloat {
                result,
                ptr,
                offset,
                dest,
            } => self.emit_get_attr_float(result, ptr, offset, dest),
            ActionKind::GetAttrDouble {
                result,
                ptr,
                offset,
                dest,
            } => self.emit_get_attr_double(result, ptr, offset, dest),
            ActionKind::SetAttr {
                ptr,
                offset,
                val,
                width,
            } => self.emit_set_attr(ptr, offset, val, width),
            ActionKind::Cmp {
                result,
                lhs,
                rhs,
                op,
                dest,
            } => self.emit_cmp(result, lhs, rhs, op, dest),
            ActionKind::ToBool { result, var, dest } => self.emit_to_bool(result, var, dest),
            ActionKind::Add {
                result,
                var,
                imm,
                dest,
            } => self.emit_add(result, var, imm, dest),
            ActionKind::Incref { var } => {
                self.emit_incref(var, 1);
                self.bump_use(var);
            }
            ActionKind::Decref { var } => self.emit_decref(var, &[var]),
            ActionKind::Xdecref { var } => self.emit_xdecref(var, &[var]),
            ActionKind::Call {
                result,
                func,
                has_side_effects,
                can_throw,
                args,
                args_xmm,
                extra_uses,
            } => {
                let mut all: SmallVec<[VarId; 8]> = SmallVec::new();
                all.extend_from_slice(&args);
                all.extend_from_slice(&args_xmm);
                all.extend_from_slice(&extra_uses);
                self.emit_call(
                    Some(result),
                    has_side_effects,
                    can_throw,
                    func,
                    &args,
                    &args_xmm,
                    &all,
                );
            }
            ActionKind::Allocate { result, slots } => {
                self.asm.comment("_allocate");
                self.emit_allocate(result, slots);
            }
            ActionKind::AllocateAndCopy {
                result,
                src,
                slots,
            } => self.emit_allocate_and_copy(result, src, slots),
            ActionKind::AllocateAndCopyPlus1 {
                result,
                first,
                rest,
                n_rest,
            } => self.emit_allocate_and_copy_plus1(result, first, rest, n_rest),
            ActionKind::CheckAndThrowCapiException {
                var,
                exc_val,
                width,
            } => self.emit_check_and_throw_capi_exception(var, exc_val, width),
            ActionKind::RegisterOwnedAttr { var, offset } => {
                debug_assert!(
                    !self.owned_attrs.contains(&(var, offset)),
                    "owned attr registered twice"
                );
                self.owned_attrs.push((var, offset));
                self.bump_use(var);
            }
            ActionKind::DeregisterOwnedAttr { var, offset } => {
                let pos = self
                    .owned_attrs
                    .iter()
                    .position(|&p| p == (var, offset))
                    .expect("deregistering an unknown owned attr");
                self.owned_attrs.remove(pos);
                self.bump_use(var);
            }
            ActionKind::PlaceReturn { var } => {
                self.asm.comment("commit_returning");
                self.get_in_reg(var, self.return_location, true, Location::AnyReg);
                self.bump_use(var);
            }
            ActionKind::Comment { text } => self.asm.comment(&text),
            ActionKind::Trap => self.asm.trap(),
        }
    }

    // =========================================================================
    // Guards
    // =========================================================================

    fn emit_guard(&mut self, var: VarId, val_var: VarId, negate: bool) {
        self.asm.comment("_add_guard");

        debug_assert!(self.vars[val_var.index()].is_constant);
        let val = self.vars[val_var.index()].constant_value;

        let var_reg = self.get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
        if is_large_constant(val) {
            let reg = self.get_in_reg(val_var, Location::AnyReg, true, Location::Reg(var_reg));
            self.asm.cmp(var_reg, reg);
        } else if val == 0 {
            self.asm.test(var_reg, var_reg);
        } else {
            self.asm.cmp_imm(var_reg, val as i32, MovWidth::Q);
        }

        // Only movs below, so the flags survive to the jump.
        self.restore_args();
        self.assert_args_in_place();
        self.next_slot_jump(if negate {
            Condition::Equal
        } else {
            Condition::NotEqual
        });

        self.bump_use(var);
        self.bump_use(val_var);
        self.assert_consistent();
    }

    fn emit_guard_not_lt0(&mut self, var: VarId) {
        let var_reg = self.get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
        self.asm.test(var_reg, var_reg);

        self.restore_args();
        self.assert_args_in_place();
        self.next_slot_jump(Condition::Sign);

        self.bump_use(var);
        self.assert_consistent();
    }

    fn emit_attr_guard(&mut self, var: VarId, offset: i32, val_var: VarId, negate: bool) {
        self.asm.comment("_add_attr_guard");

        debug_assert!(self.vars[val_var.index()].is_constant);
        let val = self.vars[val_var.index()].constant_value;

        let var_reg = self.get_in_reg(var, Location::AnyReg, true, Location::AnyReg);
        if is_large_constant(val) {
            let reg = if val_var == var {
                // Guarding a constant's field against itself (cls->cls
                // style); the pointer register already holds the value.
                var_reg
            } else {
                self.get_in_reg(val_var, Location::AnyReg, true, Location::Reg(var_reg))
            };
            self.asm.cmp_mem_reg(Indirect::new(var_reg, offset), reg);
        } else {
            self.asm.cmp_mem_imm(Indirect::new(var_reg, offset), val as i32);
        }

        self.restore_args();
        self.assert_args_in_place();
        self.next_slot_jump(if negate {
            Condition::Equal
        } else {
            Condition::NotEqual
        });

        self.bump_use(var);
        self.bump_use(val_var);
        self.assert_consistent();
    }

    /// Route a guard's conditional jump to the slow-path exit.
    ///
    /// Prefers a short jump to an earlier same-condition jump (using it as
    /// a trampoline) over a fresh full-size jump; full-size jumps target
    /// the provisional slot end and are retargeted at commit.
    fn next_slot_jump(&mut self, cond: Condition) {
        let mut last_jmp_start = None;
        for jump in self.next_slot_jmps.iter().rev() {
            if jump.cond == cond {
                last_jmp_start = Some(jump.start);
                break;
            }
        }

        if let Some(start) = last_jmp_start {
            if self.asm.bytes_written() - start < 0x80 {
                self.asm.jcc_to(cond, JumpDestination::from_start(start));
                return;
            }
        }

        let start = self.asm.bytes_written();
        self.asm
            .jcc_rel32_to(cond, JumpDestination::from_start(self.rewrite.slot_size()));
        self.next_slot_jmps.push(SlowPathJump {
            start,
            end: self.asm.bytes_written(),
            cond,
        });
    }

    /// Move args (and general-purpose live-outs) back to their pinned
    /// locations. Only movs, so callers may rely on the flags.
    fn restore_args(&mut self) {
        debug_assert!(!self.done_guarding);

        for i in 0..self.args.len() {
            let arg = self.args[i];
            self.bump_use(arg);

            let l = Location::for_arg(i);
            if matches!(l, Location::Stack(_)) {
                continue;
            }
            debug_assert!(l.is_reg());
            if !self.vars[arg.index()].is_in_location(l) {
                self.alloc_reg(l, Location::AnyReg);
                self.get_in_reg(arg, l, false, Location::AnyReg);
            }
        }

        for i in 0..self.live_outs.len() {
            if let Some(Location::Reg(r)) = Location::from_dwarf(self.live_out_regs[i]) {
                let lo = self.live_outs[i];
                if !self.vars[lo.index()].is_in_location(Location::Reg(r)) {
                    self.alloc_reg(Location::Reg(r), Location::AnyReg);
                    self.get_in_reg(lo, Location::Reg(r), false, Location::AnyReg);
                    debug_assert!(self.vars[lo.index()].is_in_location(Location::Reg(r)));
                }
            }
        }
    }

    fn assert_args_in_place(&self) {
        debug_assert!(!self.done_guarding);
        #[cfg(debug_assertions)]
        {
            for &arg in &self.args {
                debug_assert!(
                    self.vars[arg.index()].is_in_location(self.vars[arg.index()].arg_loc)
                );
            }
            for i in 0..self.live_outs.len() {
                let l = Location::from_dwarf(self.live_out_regs[i]).unwrap();
                debug_assert!(self.vars[self.live_outs[i].index()].is_in_location(l));
            }
        }
    }

    // =========================================================================
    // Attributes
    // =========================================================================

    fn emit_get_attr(
        &mut self,
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
        width: MovWidth,
    ) {
        self.asm.comment("_get_attr");

        let ptr_reg = self.get_in_reg(ptr, Location::AnyReg, true, Location::AnyReg);

        self.bump_use_early_if_possible(ptr);

        if !self.failed {
            let reg = self.initialize_in_reg(result, dest);
            self.asm.load(reg, Indirect::new(ptr_reg, offset), width);
        }

        self.release_if_no_uses(result);
        self.bump_use_late_if_necessary(ptr);
        self.assert_consistent();
    }

    fn emit_get_attr_double(&mut self, result: VarId, ptr: VarId, offset: i32, dest: Location) {
        self.asm.comment("_get_attr_double");

        let ptr_reg = self.get_in_reg(ptr, Location::AnyReg, false, Location::AnyReg);
        self.bump_use_early_if_possible(ptr);

        let reg = self.initialize_in_xmm(result, dest);
        self.asm.movsd_load(reg, Indirect::new(ptr_reg, offset));

        self.bump_use_late_if_necessary(ptr);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_get_attr_float(&mut self, result: VarId, ptr: VarId, offset: i32, dest: Location) {
        self.asm.comment("_get_attr_float");

        let ptr_reg = self.get_in_reg(ptr, Location::AnyReg, false, Location::AnyReg);
        self.bump_use_early_if_possible(ptr);

        let reg = self.initialize_in_xmm(result, dest);
        self.asm.movss_load(reg, Indirect::new(ptr_reg, offset));
        // widen to double
        self.asm.cvtss2sd(reg, reg);

        self.bump_use_late_if_necessary(ptr);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_set_attr(&mut self, ptr: VarId, offset: i32, val: VarId, width: MovWidth) {
        self.asm.comment("_set_attr");

        if self.vars[ptr.index()].scratch_allocation.is_some() {
            let dest_mem = self.indirect_for(self.vars[ptr.index()].scratch_location(offset));
            if let Some(imm) = self.try_get_as_immediate(val) {
                self.asm.store_imm(dest_mem, imm as i32, width);
            } else {
                let val_reg = self.get_in_reg(val, Location::AnyReg, false, Location::AnyReg);
                self.asm.store(dest_mem, val_reg, width);
            }
        } else {
            let ptr_reg = self.get_in_reg(ptr, Location::AnyReg, false, Location::AnyReg);
            if let Some(imm) = self.try_get_as_immediate(val) {
                self.asm
                    .store_imm(Indirect::new(ptr_reg, offset), imm as i32, width);
            } else {
                let val_reg =
                    self.get_in_reg(val, Location::AnyReg, false, Location::Reg(ptr_reg));
                debug_assert_ne!(ptr_reg, val_reg);
                self.asm.store(Indirect::new(ptr_reg, offset), val_reg, width);
            }
        }

        self.bump_use(ptr);

        // A store of a scratch array publishes a pointer the use tracker
        // cannot see; keep the backing slots reserved.
        if self.vars[val.index()].scratch_allocation.is_some() {
            self.vars[val.index()].scratch_allocation = None;
        }
        self.bump_use(val);

        self.assert_consistent();
    }

    fn try_get_as_immediate(&self, var: VarId) -> Option<u64> {
        let v = &self.vars[var.index()];
        if v.is_constant && !is_large_constant(v.constant_value) {
            Some(v.constant_value)
        } else {
            None
        }
    }

    // =========================================================================
    // Comparisons and arithmetic
    // =========================================================================

    fn emit_cmp(&mut self, result: VarId, lhs: VarId, rhs: VarId, op: CmpOp, dest: Location) {
        self.asm.comment("_cmp");

        let lhs_reg = self.get_in_reg(lhs, Location::AnyReg, false, dest);
        let rhs_reg = self.get_in_reg(rhs, Location::AnyReg, false, dest);
        debug_assert_ne!(lhs_reg, rhs_reg);

        self.bump_use_early_if_possible(lhs);
        self.bump_use_early_if_possible(rhs);

        // setcc without a REX prefix reaches al/cl/dl/bl only.
        let valid = GprSet::BYTE_ADDRESSABLE.intersection(self.allocatable_regs);
        let result_reg = self.alloc_reg_from(dest, Location::AnyReg, valid);
        self.initialize_in_reg(result, Location::Reg(result_reg));
        self.asm.cmp(lhs_reg, rhs_reg);
        match op {
            CmpOp::Eq => self.asm.setcc(Condition::Equal, result_reg),
            CmpOp::NotEq => self.asm.setcc(Condition::NotEqual, result_reg),
        }

        self.bump_use_late_if_necessary(lhs);
        self.bump_use_late_if_necessary(rhs);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_to_bool(&mut self, result: VarId, var: VarId, dest: Location) {
        self.asm.comment("_to_bool");

        let this_reg = self.get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
        self.bump_use_early_if_possible(var);

        let result_reg = self.alloc_reg(dest, Location::AnyReg);
        self.initialize_in_reg(result, Location::Reg(result_reg));

        self.asm.test(this_reg, this_reg);
        self.asm.setcc(Condition::NOT_ZERO, result_reg);

        self.bump_use_late_if_necessary(var);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_add(&mut self, result: VarId, var: VarId, imm: i64, dest: Location) {
        self.asm.comment("_add");

        let result_reg = self.alloc_reg(dest, Location::AnyReg);
        let a_reg = self.get_in_reg(var, Location::AnyReg, true, Location::Reg(result_reg));
        debug_assert_ne!(a_reg, result_reg);

        self.initialize_in_reg(result, Location::Reg(result_reg));

        self.asm.mov(result_reg, a_reg);
        debug_assert!(!is_large_constant(imm as u64));
        self.asm.add_imm(result_reg, imm as i32);

        self.bump_use(var);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Emit `num_refs` increfs of `var`. Does not bump its use; designed
    /// to be callable from other emitting functions.
    fn emit_incref(&mut self, var: VarId, num_refs: u32) {
        debug_assert!(num_refs > 0);

        // xincref(NULL) is a no-op; skip it at compile time.
        if self.vars[var.index()].is_constant && self.vars[var.index()].constant_value == 0 {
            return;
        }
        debug_assert!(!self.vars[var.index()].nullable);

        let v = &self.vars[var.index()];
        if v.is_constant && !is_large_constant(v.constant_value) {
            let addr = v.constant_value as i32 + runtime::REFCOUNT_OFFSET;
            for _ in 0..num_refs {
                self.asm.inc_abs(addr, MovWidth::Q);
            }
        } else {
            let reg = self.get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
            let mem = Indirect::new(reg, runtime::REFCOUNT_OFFSET);
            if num_refs == 1 {
                self.asm.inc_mem(mem, MovWidth::Q);
            } else {
                self.asm.add_mem_imm(mem, num_refs as i32);
            }
        }
    }

    /// Emit a decref of `var` with the dealloc call under a
    /// forward-jump-if-nonzero. Does not bump `var`'s use.
    fn emit_decref(&mut self, var: VarId, vars_to_bump: &[VarId]) {
        self.asm.comment("_decref");
        debug_assert!(!self.vars[var.index()].nullable);

        self.setup_call(true, &[var], &[], Location::Reg(Gpr::Rax), vars_to_bump);

        // setup_call placed the object in the first arg register.
        let reg = ARG_REGS[0];
        self.asm
            .dec_mem(Indirect::new(reg, runtime::REFCOUNT_OFFSET), MovWidth::Q);
        let nonzero = self.asm.create_label();
        self.asm.jcc_label(Condition::NOT_ZERO, nonzero);
        self.asm
            .load(Gpr::Rax, Indirect::new(reg, runtime::CLASS_OFFSET), MovWidth::Q);
        self.asm
            .call_mem(Indirect::new(Gpr::Rax, runtime::DEALLOC_OFFSET));
        self.asm.bind_label(nonzero);

        for &v in vars_to_bump {
            self.bump_use_late_if_necessary(v);
        }
    }

    /// Emit a null-safe decref via the runtime helper.
    fn emit_xdecref(&mut self, var: VarId, vars_to_bump: &[VarId]) {
        self.asm.comment("_xdecref");
        debug_assert!(self.vars[var.index()].nullable);

        self.emit_call(
            None,
            true,
            false,
            runtime::object_xdecref as usize as u64,
            &[var],
            &[],
            vars_to_bump,
        );
    }

    /// Which locations the unwinder must decref if the current action's
    /// call throws.
    fn get_decref_locations(&mut self) -> Vec<Location> {
        let mut infos = Vec::new();

        for idx in 0..self.vars.len() {
            if self.vars[idx].locations.is_empty()
                || !self.vars[idx].needs_decref(self.current_action)
            {
                continue;
            }
            let locations = self.vars[idx].locations.clone();
            let mut found = None;
            for l in locations {
                match l {
                    Location::Scratch(_) => {
                        // The unwinder does not know the scratch window;
                        // rewrite as an rsp-relative slot.
                        found = Some(Location::Stack(self.indirect_for(l).disp));
                        break;
                    }
                    Location::Stack(_) => {
                        found = Some(l);
                        break;
                    }
                    Location::Reg(_) => {
                        if !l.is_clobbered_by_call() {
                            found = Some(l);
                            break;
                        }
                    }
                    _ => unreachable!("owned var at {l}"),
                }
            }
            match found {
                Some(l) => infos.push(l),
                // Very rare; give up on the rewrite rather than lose a ref.
                None => self.failed = true,
            }
        }

        for i in 0..self.owned_attrs.len() {
            let (var, inner) = self.owned_attrs[i];
            let v = &self.vars[var.index()];
            assert!(
                !v.locations.is_empty() || v.scratch_allocation.is_some(),
                "owned attribute no longer reachable; missing deregister_owned_attr?"
            );
            let l = if !v.locations.is_empty() {
                debug_assert!(v.locations.len() == 1 || v.scratch_allocation.is_some());
                let l = v.locations[0];
                debug_assert!(l.is_mem());
                l
            } else {
                v.scratch_location(0)
            };
            let outer = self.indirect_for(l).disp;
            infos.push(Location::StackIndirect(outer, inner));
        }

        infos
    }

    /// Record a decref-info entry for the instruction pointer at the
    /// current emission point.
    fn register_decref_info_here(&mut self) {
        let locations = self.get_decref_locations();
        let ip = self.picked_slot_addr.expect("no slot picked") + self.asm.bytes_written() as u64;
        self.decref_infos.push(DecrefInfo { ip, locations });
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Place arguments, spill caller-saved state, and update the IC entry
    /// counter if this is the first side-effectful call.
    fn setup_call(
        &mut self,
        has_side_effects: bool,
        args: &[VarId],
        args_xmm: &[VarId],
        preserve: Location,
        bump_early: &[VarId],
    ) {
        if has_side_effects {
            debug_assert!(self.done_guarding);

            // Leave room for an invalidator to overwrite the prefix with a
            // jump without racing a torn instruction.
            while self.asm.bytes_written() < IC_INVALIDATION_HEADER_SIZE {
                self.asm.nop();
            }

            if self.needs_invalidation_support && !self.marked_inside_ic {
                let addr = self.rewrite.num_inside_addr();
                if is_large_constant(addr) {
                    let reg = self.alloc_reg(Location::AnyReg, preserve);
                    self.load_const_into_reg(addr, reg);
                    self.asm.inc_mem(Indirect::new(reg, 0), MovWidth::L);
                } else {
                    self.asm.inc_abs(addr as i32, MovWidth::L);
                }
                self.assert_consistent();
                self.marked_inside_ic = true;
            }
        }

        for (i, &arg) in args.iter().enumerate() {
            let l = Location::for_arg(i);
            if !self.vars[arg.index()].is_in_location(l) {
                let r = l.as_gpr();
                {
                    // Force the allocator to evict the occupant first.
                    let r2 = self.alloc_reg(l, preserve);
                    if self.failed {
                        return;
                    }
                    debug_assert_eq!(r, r2);
                    debug_assert!(!self.vars_by_location.contains_key(&l));
                }

                if let Some(imm) = self.try_get_as_immediate(arg) {
                    if imm == 0 {
                        self.asm.clear_reg(r);
                    } else {
                        self.asm.mov_imm(r, imm);
                    }
                    self.add_location_to_var(arg, l);
                } else {
                    let r2 = self.get_in_reg(arg, l, false, Location::AnyReg);
                    debug_assert!(self.vars[arg.index()].is_in_location(Location::Reg(r2)));
                    debug_assert_eq!(r2, r);
                }
            }
            debug_assert!(self.vars[arg.index()].is_in_location(Location::for_arg(i)));
        }

        self.assert_consistent();

        for (i, &x) in args_xmm.iter().enumerate() {
            let l = Location::XmmReg(Xmm::from_encoding(i as u8).unwrap());
            debug_assert!(self.vars[x.index()].is_in_location(l));
        }

        for &v in bump_early {
            self.bump_use_early_if_possible(v);
        }

        // Spill every caller-saved register whose occupant survives the
        // call through no other location.
        for check_loc in Self::caller_save_locations() {
            debug_assert!(check_loc.is_clobbered_by_call());
            let Some(slot) = self.vars_by_location.get(&check_loc) else {
                continue;
            };
            let var = slot.var().expect("placeholder in a register");
            let v = &self.vars[var.index()];

            let mut need_to_spill = v.locations.iter().all(|l| l.is_clobbered_by_call());
            if need_to_spill && args.contains(&var) && v.is_done_using() {
                // We hold the only use and the call is about to consume
                // it; nothing to preserve.
                need_to_spill = false;
            }

            if need_to_spill {
                match check_loc {
                    Location::Reg(r) => {
                        self.spill_register(r, preserve);
                        if self.failed {
                            return;
                        }
                    }
                    Location::XmmReg(x) => {
                        debug_assert_eq!(self.vars[var.index()].locations.len(), 1);
                        self.spill_xmm_register(x);
                        if self.failed {
                            return;
                        }
                    }
                    _ => unreachable!(),
                }
            } else {
                self.remove_location_from_var(var, check_loc);
            }
        }

        self.assert_consistent();

        #[cfg(debug_assertions)]
        for (&l, _) in &self.vars_by_location {
            debug_assert!(
                !matches!(l, Location::Reg(_) | Location::XmmReg(_)) || !l.is_clobbered_by_call(),
                "live value left in caller-saved {l} across a call"
            );
        }
    }

    /// Emit the cheapest call to `func`: near rel32 when the displacement
    /// fits, otherwise an indirect call through `tmp_reg`.
    fn call_optimal_encoding(&mut self, tmp_reg: Gpr, func: u64) {
        debug_assert!(!self
            .vars_by_location
            .contains_key(&Location::Reg(tmp_reg)));

        let next_ip =
            self.picked_slot_addr.expect("no slot picked") + self.asm.bytes_written() as u64 + 5;
        let disp = (func as i64).wrapping_sub(next_ip as i64);
        if i32::try_from(disp).is_ok() {
            self.asm.call_rel32(disp as i32);
        } else {
            self.load_const_into_reg(func, tmp_reg);
            self.asm.call_reg(tmp_reg);
        }
    }

    fn emit_call(
        &mut self,
        result: Option<VarId>,
        has_side_effects: bool,
        can_throw: bool,
        func: u64,
        args: &[VarId],
        args_xmm: &[VarId],
        vars_to_bump: &[VarId],
    ) {
        self.asm.comment("_call");

        // r11 is the call scratch register; free it up front.
        let r = self.alloc_reg(Location::Reg(Gpr::R11), Location::AnyReg);
        if self.failed {
            return;
        }

        self.setup_call(has_side_effects, args, args_xmm, Location::Reg(Gpr::R11), vars_to_bump);
        self.assert_consistent();

        self.call_optimal_encoding(r, func);

        if can_throw {
            self.register_decref_info_here();
        }

        if !self.failed {
            debug_assert!(!self.vars_by_location.contains_key(&Location::Reg(Gpr::Rax)));
            if let Some(res) = result {
                self.initialize_in_reg(res, Location::Reg(Gpr::Rax));
            }
            self.assert_consistent();
        }

        if let Some(res) = result {
            self.release_if_no_uses(res);
        }
        for &v in vars_to_bump {
            self.bump_use_late_if_necessary(v);
        }
    }

    fn emit_check_and_throw_capi_exception(&mut self, var: VarId, exc_val: i64, width: MovWidth) {
        self.asm.comment("_check_and_throw_capi_exception");

        let var_reg = self.get_in_reg(var, Location::AnyReg, false, Location::AnyReg);
        if exc_val == 0 {
            debug_assert_eq!(width, MovWidth::Q);
            self.asm.test(var_reg, var_reg);
        } else {
            self.asm.cmp_imm(var_reg, exc_val as i32, width);
        }

        self.setup_call(false, &[], &[], Location::AnyReg, &[]);

        let no_error = self.asm.create_label();
        self.asm.jcc_label(Condition::NOT_ZERO, no_error);
        self.call_optimal_encoding(
            Gpr::R11,
            runtime::throw_capi_exception as usize as u64,
        );
        self.register_decref_info_here();
        self.asm.bind_label(no_error);

        self.bump_use(var);
        self.assert_consistent();
    }

    fn caller_save_locations() -> impl Iterator<Item = Location> {
        Gpr::ALL
            .iter()
            .filter(|r| !r.is_callee_save())
            .map(|&r| Location::Reg(r))
            .chain(Xmm::ALL.iter().map(|&x| Location::XmmReg(x)))
    }

    // =========================================================================
    // Scratch allocation
    // =========================================================================

    /// Find one free 8-byte scratch slot.
    fn alloc_scratch(&mut self) -> Location {
        self.assert_phase_emitting();

        let scratch_size = self.rewrite.scratch_size();
        let mut i = 0;
        while i < scratch_size {
            let l = Location::Scratch(i);
            if !self.vars_by_location.contains_key(&l) {
                return l;
            }
            i += 8;
        }
        self.failed = true;
        Location::None
    }

    /// Reserve `n` contiguous scratch slots for `result`, marking them
    /// with placeholders. Returns the first slot index.
    fn emit_allocate(&mut self, result: VarId, n: i32) -> i32 {
        debug_assert!(n >= 1);

        let scratch_size = self.rewrite.scratch_size();
        let mut consec = 0;
        let mut i = 0;
        while i < scratch_size {
            let l = Location::Scratch(i);
            if !self.vars_by_location.contains_key(&l) {
                consec += 1;
                if consec == n {
                    let first = i / 8 - n + 1;
                    for j in first..=i / 8 {
                        let m = Location::Scratch(j * 8);
                        debug_assert!(!self.vars_by_location.contains_key(&m));
                        self.vars_by_location.insert(m, VarSlot::Placeholder);
                    }
                    debug_assert!(self.vars[result.index()].scratch_allocation.is_none());
                    self.vars[result.index()].scratch_allocation = Some((first, n));
                    self.assert_consistent();
                    self.release_if_no_uses(result);
                    return first;
                }
            } else {
                consec = 0;
            }
            i += 8;
        }
        self.failed = true;
        0
    }

    fn emit_allocate_and_copy(&mut self, result: VarId, src: VarId, n: i32) {
        self.asm.comment("_allocate_and_copy");

        let offset = self.emit_allocate(result, n);
        if self.failed {
            return;
        }

        let src_ptr = self.get_in_reg(src, Location::AnyReg, false, Location::AnyReg);
        let tmp = self.alloc_reg(Location::AnyReg, Location::Reg(src_ptr));
        debug_assert_ne!(tmp, src_ptr);

        let scratch_base = self.rewrite.scratch_rsp_offset();
        for i in 0..n {
            self.asm.load(tmp, Indirect::new(src_ptr, 8 * i), MovWidth::Q);
            self.asm.store(
                Indirect::new(Gpr::Rsp, 8 * (offset + i) + scratch_base),
                tmp,
                MovWidth::Q,
            );
        }

        self.bump_use(src);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }

    fn emit_allocate_and_copy_plus1(
        &mut self,
        result: VarId,
        first: VarId,
        rest: Option<VarId>,
        n_rest: i32,
    ) {
        self.asm.comment("_allocate_and_copy_plus1");

        let offset = self.emit_allocate(result, n_rest + 1);
        if self.failed {
            return;
        }

        let scratch_base = self.rewrite.scratch_rsp_offset();
        let first_reg = self.get_in_reg(first, Location::AnyReg, false, Location::AnyReg);
        self.asm.store(
            Indirect::new(Gpr::Rsp, 8 * offset + scratch_base),
            first_reg,
            MovWidth::Q,
        );

        if n_rest > 0 {
            let rest = rest.expect("rest pointer required");
            let src_ptr = self.get_in_reg(rest, Location::AnyReg, false, Location::AnyReg);
            let tmp = self.alloc_reg(Location::AnyReg, Location::Reg(src_ptr));
            debug_assert_ne!(tmp, src_ptr);

            for i in 0..n_rest {
                self.asm.load(tmp, Indirect::new(src_ptr, 8 * i), MovWidth::Q);
                self.asm.store(
                    Indirect::new(Gpr::Rsp, 8 * (offset + i + 1) + scratch_base),
                    tmp,
                    MovWidth::Q,
                );
            }
            self.bump_use(rest);
        }

        self.bump_use(first);
        self.release_if_no_uses(result);
        self.assert_consistent();
    }
}

// =============================================================================
// Register allocation and location bookkeeping
// =============================================================================

impl Rewriter<'_> {
    /// Ensure `var` is in a register, materializing constants and reloading
    /// spills on demand. Idempotent.
    ///
    /// With a specific `dest` the value is moved there; with `AnyReg` any
    /// current register is accepted. `other_than` excludes one register
    /// from allocation (typically a pointer the caller also needs).
    fn get_in_reg(
        &mut self,
        var: VarId,
        dest: Location,
        allow_constant_in_reg: bool,
        other_than: Location,
    ) -> Gpr {
        self.assert_phase_emitting();
        debug_assert!(matches!(dest, Location::Reg(_) | Location::AnyReg));
        debug_assert!(allow_constant_in_reg || {
            let v = &self.vars[var.index()];
            !v.is_constant || is_large_constant(v.constant_value)
        });

        if self.vars[var.index()].locations.is_empty() {
            // A constant materializes on first use.
            if self.vars[var.index()].is_constant {
                let value = self.vars[var.index()].constant_value;
                let reg = self.alloc_reg(dest, other_than);
                self.load_const_into_reg(value, reg);
                self.add_location_to_var(var, Location::Reg(reg));
                return reg;
            }
            // A scratch array is referenced by its address.
            if self.vars[var.index()].scratch_allocation.is_some() {
                let reg = self.alloc_reg(dest, other_than);
                let mem = self.indirect_for(self.vars[var.index()].scratch_location(0));
                self.asm.lea(reg, mem);
                self.add_location_to_var(var, Location::Reg(reg));
                return reg;
            }
        }

        debug_assert!(!self.vars[var.index()].locations.is_empty());

        // Already exactly where the caller wants it?
        for &l in &self.vars[var.index()].locations {
            if l == dest {
                return l.as_gpr();
            }
        }

        // In some other register?
        for l in self.vars[var.index()].locations.clone() {
            if let Location::Reg(reg) = l {
                if dest != Location::AnyReg {
                    let dest_reg = dest.as_gpr();
                    debug_assert_ne!(dest_reg, reg);
                    self.alloc_reg(dest, other_than);
                    self.asm.mov(dest_reg, reg);
                    self.add_location_to_var(var, Location::Reg(dest_reg));
                    return dest_reg;
                }
                debug_assert_ne!(Location::Reg(reg), other_than);
                return reg;
            }
        }

        // Memory only: reload.
        debug_assert_eq!(self.vars[var.index()].locations.len(), 1);
        let l = self.vars[var.index()].locations[0];

        let reg = self.alloc_reg(dest, other_than);
        if self.failed {
            return reg;
        }
        debug_assert!(!self.vars_by_location.contains_key(&Location::Reg(reg)));

        let mem = self.indirect_for(l);
        self.asm.load(reg, mem, MovWidth::Q);
        self.add_location_to_var(var, Location::Reg(reg));
        reg
    }

    /// The SSE counterpart of [`get_in_reg`](Self::get_in_reg).
    fn get_in_xmm_reg(&mut self, var: VarId, dest: Location) -> Xmm {
        self.assert_phase_emitting();
        debug_assert!(matches!(dest, Location::XmmReg(_) | Location::AnyReg));
        debug_assert!(!self.vars[var.index()].is_constant);
        debug_assert!(!self.vars[var.index()].locations.is_empty());

        for &l in &self.vars[var.index()].locations {
            if l == dest {
                return l.as_xmm();
            }
        }

        for l in self.vars[var.index()].locations.clone() {
            if let Location::XmmReg(reg) = l {
                if dest != Location::AnyReg {
                    let dest_reg = dest.as_xmm();
                    debug_assert_ne!(dest_reg, reg);
                    self.asm.movsd(dest_reg, reg);
                    self.add_location_to_var(var, Location::XmmReg(dest_reg));
                    return dest_reg;
                }
                return reg;
            }
        }

        debug_assert_eq!(self.vars[var.index()].locations.len(), 1);
        let l = self.vars[var.index()].locations[0];
        debug_assert!(matches!(l, Location::Scratch(_)));

        let dest_reg = dest.as_xmm();
        debug_assert!(!self
            .vars_by_location
            .contains_key(&Location::XmmReg(dest_reg)));

        let mem = self.indirect_for(l);
        self.asm.movsd_load(dest_reg, mem);
        self.add_location_to_var(var, Location::XmmReg(dest_reg));
        dest_reg
    }

    /// Bind a fresh result var to a register.
    ///
    /// A specific destination currently pinned by an arg falls back to
    /// `AnyReg`; args cannot be spilled until guarding completes.
    fn initialize_in_reg(&mut self, var: VarId, dest: Location) -> Gpr {
        self.assert_phase_emitting();

        let mut dest = dest;
        if let Location::Reg(_) = dest {
            if !self.done_guarding {
                if let Some(VarSlot::Var(occupant)) = self.vars_by_location.get(&dest) {
                    if self.vars[occupant.index()].is_arg {
                        dest = Location::AnyReg;
                    }
                }
            }
        }

        let reg = self.alloc_reg(dest, Location::AnyReg);
        let l = Location::Reg(reg);

        debug_assert!(self.failed || !self.vars_by_location.contains_key(&l));
        self.vars_by_location.insert(l, VarSlot::Var(var));
        debug_assert!(!self.vars[var.index()].is_in_location(l));
        self.vars[var.index()].locations.push(l);
        reg
    }

    /// Bind a fresh result var to an SSE register.
    fn initialize_in_xmm(&mut self, var: VarId, dest: Location) -> Xmm {
        self.assert_phase_emitting();

        let reg = self.alloc_xmm_reg(dest, Location::None);
        let l = Location::XmmReg(reg);

        debug_assert!(!self.vars_by_location.contains_key(&l));
        self.vars_by_location.insert(l, VarSlot::Var(var));
        debug_assert!(!self.vars[var.index()].is_in_location(l));
        self.vars[var.index()].locations.push(l);
        reg
    }

    fn alloc_reg(&mut self, dest: Location, other_than: Location) -> Gpr {
        self.alloc_reg_from(dest, other_than, self.allocatable_regs)
    }

    /// Choose a physical register for `dest`.
    ///
    /// `AnyReg` returns the first free register of `valid`, else evicts
    /// the occupant whose next use is farthest away. Pinned args (while
    /// guarding) and mid-release vars are never evicted. A specific
    /// register evicts its occupant.
    fn alloc_reg_from(&mut self, dest: Location, other_than: Location, valid: GprSet) -> Gpr {
        self.assert_phase_emitting();

        match dest {
            Location::AnyReg => {
                let mut best: Option<(u32, Gpr)> = None;
                for reg in valid.iter() {
                    if Location::Reg(reg) == other_than {
                        continue;
                    }
                    let Some(slot) = self.vars_by_location.get(&Location::Reg(reg)) else {
                        return reg;
                    };
                    let occupant = slot.var().expect("placeholder in a register");
                    let v = &self.vars[occupant.index()];
                    if !self.done_guarding && v.is_arg && v.arg_loc == Location::Reg(reg) {
                        continue;
                    }
                    if v.is_done_using() {
                        // Dead but still holding a location: something we
                        // are actively decref'ing. Leave it alone.
                        continue;
                    }
                    let next = v.uses[v.next_use];
                    if best.map_or(true, |(b, _)| next > b) {
                        best = Some((next, reg));
                    }
                }

                let (_, best_reg) = best.expect("no allocatable register");
                self.spill_register(best_reg, other_than);
                debug_assert!(
                    self.failed || !self.vars_by_location.contains_key(&Location::Reg(best_reg))
                );
                best_reg
            }
            Location::Reg(reg) => {
                debug_assert!(valid.contains(reg));
                if self.vars_by_location.contains_key(&dest) {
                    self.spill_register(reg, other_than);
                }
                debug_assert!(self.failed || !self.vars_by_location.contains_key(&dest));
                reg
            }
            _ => unreachable!("alloc_reg for {dest}"),
        }
    }

    /// Choose an SSE register, evicting the farthest-next-use occupant.
    fn alloc_xmm_reg(&mut self, dest: Location, other_than: Location) -> Xmm {
        self.assert_phase_emitting();

        match dest {
            Location::AnyReg => {
                let mut best: Option<(u32, Xmm)> = None;
                for reg in Xmm::ALL {
                    if Location::XmmReg(reg) == other_than {
                        continue;
                    }
                    let Some(slot) = self.vars_by_location.get(&Location::XmmReg(reg)) else {
                        return reg;
                    };
                    let occupant = slot.var().expect("placeholder in an xmm register");
                    let v = &self.vars[occupant.index()];
                    if v.is_done_using() {
                        continue;
                    }
                    let next = v.uses[v.next_use];
                    if best.map_or(true, |(b, _)| next > b) {
                        best = Some((next, reg));
                    }
                }

                let (_, best_reg) = best.expect("no allocatable xmm register");
                self.spill_xmm_register(best_reg);
                best_reg
            }
            Location::XmmReg(reg) => {
                if self.vars_by_location.contains_key(&dest) {
                    self.spill_xmm_register(reg);
                }
                debug_assert!(self.failed || !self.vars_by_location.contains_key(&dest));
                reg
            }
            _ => unreachable!("alloc_xmm_reg for {dest}"),
        }
    }

    /// Evict the occupant of `reg`.
    ///
    /// Values reachable elsewhere (another location, a constant, a scratch
    /// array) just drop the register. Otherwise the value moves to a free
    /// callee-saved register, else to a scratch slot.
    fn spill_register(&mut self, reg: Gpr, preserve: Location) {
        debug_assert!(matches!(preserve, Location::Reg(_) | Location::AnyReg));

        let var = self.vars_by_location[&Location::Reg(reg)]
            .var()
            .expect("spilling a placeholder");

        {
            let v = &self.vars[var.index()];
            if v.locations.len() > 1 || v.is_constant || v.scratch_allocation.is_some() {
                self.remove_location_from_var(var, Location::Reg(reg));
                return;
            }
        }

        for new_reg in self.spill_regs.iter() {
            debug_assert!(new_reg.is_callee_save());
            if self.vars_by_location.contains_key(&Location::Reg(new_reg)) {
                continue;
            }
            if Location::Reg(new_reg) == preserve {
                continue;
            }
            self.asm.mov(new_reg, reg);
            self.add_location_to_var(var, Location::Reg(new_reg));
            self.remove_location_from_var(var, Location::Reg(reg));
            return;
        }

        let scratch = self.alloc_scratch();
        if self.failed {
            return;
        }
        let mem = self.indirect_for(scratch);
        self.asm.store(mem, reg, MovWidth::Q);
        self.add_location_to_var(var, scratch);
        self.remove_location_from_var(var, Location::Reg(reg));
    }

    /// Evict the occupant of an SSE register into a scratch slot.
    fn spill_xmm_register(&mut self, reg: Xmm) {
        self.assert_phase_emitting();

        let var = self.vars_by_location[&Location::XmmReg(reg)]
            .var()
            .expect("spilling a placeholder");
        debug_assert_eq!(self.vars[var.index()].locations.len(), 1);

        let scratch = self.alloc_scratch();
        if self.failed {
            return;
        }
        let mem = self.indirect_for(scratch);
        self.asm.movsd_store(mem, reg);
        self.add_location_to_var(var, scratch);
        self.remove_location_from_var(var, Location::XmmReg(reg));
    }

    /// The rsp-relative operand for a stack or scratch location.
    fn indirect_for(&self, l: Location) -> Indirect {
        match l {
            Location::Scratch(off) => {
                Indirect::new(Gpr::Rsp, self.rewrite.scratch_rsp_offset() + off)
            }
            Location::Stack(off) => Indirect::new(Gpr::Rsp, off),
            _ => panic!("no memory operand for {l}"),
        }
    }

    fn add_location_to_var(&mut self, var: VarId, l: Location) {
        if self.failed {
            return;
        }
        debug_assert!(!self.vars[var.index()].is_in_location(l));
        debug_assert!(!self.vars_by_location.contains_key(&l));
        debug_assert!(matches!(
            l,
            Location::Reg(_) | Location::XmmReg(_) | Location::Scratch(_) | Location::Stack(_)
        ));

        self.vars[var.index()].locations.push(l);
        self.vars_by_location.insert(l, VarSlot::Var(var));

        // A var lives in at most one of stack, scratch, or (small)
        // constant form at a time.
        #[cfg(debug_assertions)]
        {
            let v = &self.vars[var.index()];
            let mut count = 0;
            if v.is_constant && !is_large_constant(v.constant_value) {
                count += 1;
            }
            for &loc in &v.locations {
                if loc.is_mem() {
                    count += 1;
                }
            }
            debug_assert!(count <= 1);
        }
    }

    fn remove_location_from_var(&mut self, var: VarId, l: Location) {
        debug_assert!(self.vars[var.index()].is_in_location(l));
        debug_assert_eq!(self.vars_by_location.get(&l), Some(&VarSlot::Var(var)));

        self.vars_by_location.remove(&l);
        let v = &mut self.vars[var.index()];
        let pos = v.locations.iter().position(|&x| x == l).unwrap();
        v.locations.remove(pos);
    }

    // =========================================================================
    // Use tracking
    // =========================================================================

    /// Advance `var`'s use cursor; at the final use the var is released
    /// (args wait for guarding to finish).
    fn bump_use(&mut self, var: VarId) {
        self.assert_phase_emitting();

        let v = &mut self.vars[var.index()];
        v.next_use += 1;
        debug_assert!(v.next_use <= v.uses.len());

        if v.is_done_using() {
            if !self.done_guarding && v.is_arg {
                return;
            }
            self.release(var);
        }
    }

    /// Bump now when the value need not survive the action, freeing its
    /// register for the result.
    fn bump_use_early_if_possible(&mut self, var: VarId) {
        if self.vars[var.index()].reftype != RefType::Owned {
            self.bump_use(var);
        }
    }

    /// Bump after the action for owned values, so a synthesized decref can
    /// still read them.
    fn bump_use_late_if_necessary(&mut self, var: VarId) {
        if self.vars[var.index()].reftype == RefType::Owned {
            self.bump_use(var);
        }
    }

    /// Release a fresh result that nothing ever uses.
    fn release_if_no_uses(&mut self, var: VarId) {
        self.assert_phase_emitting();
        if self.vars[var.index()].uses.is_empty() {
            debug_assert_eq!(self.vars[var.index()].next_use, 0);
            self.release(var);
        }
    }

    /// Drop all of `var`'s locations, closing an owned ref's lifetime with
    /// a decref unless it was handed off.
    fn release(&mut self, var: VarId) {
        if self.vars[var.index()].reftype == RefType::Owned
            && !self.vars[var.index()].ref_handed_off()
        {
            if self.vars[var.index()].nullable {
                self.emit_xdecref(var, &[]);
            } else {
                self.emit_decref(var, &[]);
            }
        }

        for loc in self.vars[var.index()].locations.clone() {
            self.vars_by_location.remove(&loc);
        }

        if let Some((first, len)) = self.vars[var.index()].scratch_allocation {
            for i in 0..len {
                let l = Location::Scratch((first + i) * 8);
                debug_assert_eq!(self.vars_by_location.get(&l), Some(&VarSlot::Placeholder));
                self.vars_by_location.remove(&l);
            }
            self.vars[var.index()].scratch_allocation = None;
        }

        self.vars[var.index()].locations.clear();
    }

    // =========================================================================
    // Consistency checking
    // =========================================================================

    /// Verify the forward/reverse location maps agree (debug builds only).
    fn assert_consistent(&self) {
        #[cfg(debug_assertions)]
        {
            if self.failed {
                return;
            }
            for (&loc, &slot) in &self.vars_by_location {
                if let VarSlot::Var(id) = slot {
                    assert!(
                        self.vars[id.index()].is_in_location(loc),
                        "reverse map names a var not at {loc}"
                    );
                }
            }
            for (idx, v) in self.vars.iter().enumerate() {
                for &l in &v.locations {
                    match self.vars_by_location.get(&l) {
                        Some(VarSlot::Var(id)) => assert_eq!(
                            id.index(),
                            idx,
                            "two vars claim {l}"
                        ),
                        Some(VarSlot::Placeholder) => {}
                        None => panic!("location {l} missing from the reverse map"),
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
