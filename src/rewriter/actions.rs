//! Deferred action encoding.
//!
//! The collecting phase appends one [`Action`] per builder call; the
//! emitting phase runs them in order. Actions carry their operands as arena
//! indices rather than closures, which keeps them `'static` and lets the
//! emit loop borrow the engine mutably while interpreting them.

use smallvec::SmallVec;

use super::location::Location;
use super::var::VarId;
use crate::backend::x64::encoder::MovWidth;

/// How an action interacts with memoization and guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionCategory {
    /// A conditional exit to the slow path. Guards must precede any
    /// mutation and are all emitted before argument pins are released.
    Guard,
    /// Reads state but does not change runtime-visible state.
    Normal,
    /// Changes runtime-visible state; disables the get-attr memo.
    Mutation,
}

/// Comparison operators with a materialized boolean result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    NotEq,
}

/// One deferred operation, with operands by var-arena index.
#[derive(Debug, Clone)]
pub(crate) enum ActionKind {
    Guard {
        var: VarId,
        val: VarId,
        negate: bool,
    },
    GuardNotLt0 {
        var: VarId,
    },
    AttrGuard {
        var: VarId,
        offset: i32,
        val: VarId,
        negate: bool,
    },
    GetAttr {
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
        width: MovWidth,
    },
    GetAttrFloat {
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
    },
    GetAttrDouble {
        result: VarId,
        ptr: VarId,
        offset: i32,
        dest: Location,
    },
    SetAttr {
        ptr: VarId,
        offset: i32,
        val: VarId,
        width: MovWidth,
    },
    Cmp {
        result: VarId,
        lhs: VarId,
        rhs: VarId,
        op: CmpOp,
        dest: Location,
    },
    ToBool {
        result: VarId,
        var: VarId,
        dest: Location,
    },
    Add {
        result: VarId,
        var: VarId,
        imm: i64,
        dest: Location,
    },
    Incref {
        var: VarId,
    },
    Decref {
        var: VarId,
    },
    Xdecref {
        var: VarId,
    },
    Call {
        result: VarId,
        func: u64,
        has_side_effects: bool,
        can_throw: bool,
        args: SmallVec<[VarId; 6]>,
        args_xmm: SmallVec<[VarId; 4]>,
        extra_uses: SmallVec<[VarId; 2]>,
    },
    Allocate {
        result: VarId,
        slots: i32,
    },
    AllocateAndCopy {
        result: VarId,
        src: VarId,
        slots: i32,
    },
    AllocateAndCopyPlus1 {
        result: VarId,
        first: VarId,
        rest: Option<VarId>,
        n_rest: i32,
    },
    CheckAndThrowCapiException {
        var: VarId,
        exc_val: i64,
        width: MovWidth,
    },
    RegisterOwnedAttr {
        var: VarId,
        offset: i32,
    },
    DeregisterOwnedAttr {
        var: VarId,
        offset: i32,
    },
    /// Move a var into the return register at the end of the fast path.
    PlaceReturn {
        var: VarId,
    },
    Comment {
        text: String,
    },
    Trap,
}

/// A queued action with its refcount hand-off bookkeeping.
#[derive(Debug)]
pub(crate) struct Action {
    pub kind: ActionKind,
    pub category: ActionCategory,
    /// Vars whose reference this action consumes (`ref_consumed`).
    pub consumed_refs: SmallVec<[VarId; 2]>,
}

impl Action {
    #[inline]
    pub fn new(kind: ActionKind, category: ActionCategory) -> Self {
        Action {
            kind,
            category,
            consumed_refs: SmallVec::new(),
        }
    }
}
