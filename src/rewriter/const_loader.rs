//! Constant materialization.
//!
//! Every distinct 64-bit constant requested during collection becomes a
//! dedicated var, so the allocator tracks its register residency like any
//! other value. At emit time a constant loads through the cheapest of:
//! a clearing idiom, a register-register copy from a live duplicate, a
//! `lea` off a nearby live constant, or a full immediate move.

use super::location::Location;
use super::var::{VarId, VarSlot};
use super::{is_large_constant, Rewriter};
use crate::backend::x64::encoder::Indirect;
use crate::backend::x64::registers::Gpr;

/// Collect-phase table of `(value, var)` pairs, deduplicated per rewrite.
pub(crate) struct ConstLoader {
    pub consts: Vec<(u64, VarId)>,
}

impl ConstLoader {
    pub fn new() -> Self {
        ConstLoader { consts: Vec::new() }
    }

    /// The var already bound to `val`, if any.
    pub fn find(&self, val: u64) -> Option<VarId> {
        self.consts
            .iter()
            .find(|&&(v, _)| v == val)
            .map(|&(_, var)| var)
    }
}

impl Rewriter<'_> {
    /// Emit the cheapest sequence that puts `val` into `dst`.
    pub(crate) fn load_const_into_reg(&mut self, val: u64, dst: Gpr) {
        self.assert_phase_emitting();

        if val == 0 {
            self.asm.clear_reg(dst);
            return;
        }
        if self.try_reg_reg_move(val, dst) {
            return;
        }
        if self.try_lea(val, dst) {
            return;
        }
        self.asm.mov_imm(dst, val);
    }

    /// Copy `val` from a register that already holds it.
    fn try_reg_reg_move(&mut self, val: u64, dst: Gpr) -> bool {
        self.assert_phase_emitting();

        if let Some(src) = self.find_const_in_reg(val) {
            if src != dst {
                self.asm.mov(dst, src);
            }
            return true;
        }
        false
    }

    /// Compute a large `val` as `lea [base + disp]` off a live constant
    /// within a 32-bit signed displacement.
    fn try_lea(&mut self, val: u64, dst: Gpr) -> bool {
        self.assert_phase_emitting();

        if !is_large_constant(val) {
            return false;
        }
        for reg in Gpr::ALL {
            let Some(&VarSlot::Var(id)) = self.vars_by_location.get(&Location::Reg(reg)) else {
                continue;
            };
            let v = &self.vars[id.index()];
            if !v.is_constant {
                continue;
            }
            let offset = val.wrapping_sub(v.constant_value);
            if is_large_constant(offset) {
                continue;
            }
            self.asm.lea(dst, Indirect::new(reg, offset as i64 as i32));
            return true;
        }
        false
    }

    /// A register currently holding `val` through a constant var.
    fn find_const_in_reg(&self, val: u64) -> Option<Gpr> {
        for &(cval, var) in &self.const_loader.consts {
            if cval != val {
                continue;
            }
            for &l in &self.vars[var.index()].locations {
                if let Location::Reg(reg) = l {
                    return Some(reg);
                }
            }
        }
        None
    }
}
