//! Fixed-capacity x64 assembler.
//!
//! Owns the code buffer for one IC slot rewrite. The buffer never grows:
//! emitting past capacity sets a sticky failure flag instead, which the
//! rewriter folds into an aborted rewrite. Provides:
//!
//! - all mnemonics the rewriter emits, delegating to `encoder`
//! - forward-reference labels with rel32 patching
//! - direct jumps to slot-relative offsets, choosing rel8/rel32 encoding
//! - a comment side-table (never bytes) for diagnostics and tests

use super::encoder::{self, Condition, EncodedInst, Indirect, MovWidth};
use super::registers::{Gpr, Xmm};

// =============================================================================
// Jump Destinations and Labels
// =============================================================================

/// A jump target expressed as a byte offset from the start of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpDestination(pub usize);

impl JumpDestination {
    #[inline]
    pub const fn from_start(offset: usize) -> Self {
        JumpDestination(offset)
    }
}

/// A label representing a (possibly not yet bound) position in the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

impl Label {
    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// A pending rel32 fixup against an unbound label.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Offset of the 4-byte displacement field.
    pos: u32,
    label: Label,
}

// =============================================================================
// Assembler
// =============================================================================

/// Byte-buffer assembler with a hard capacity limit.
pub struct Assembler {
    code: Vec<u8>,
    capacity: usize,
    failed: bool,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    comments: Vec<(usize, String)>,
}

impl Assembler {
    /// Create an assembler for a slot of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Assembler {
            code: Vec::with_capacity(capacity),
            capacity,
            failed: false,
            labels: Vec::new(),
            fixups: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Number of bytes emitted so far.
    #[inline]
    pub fn bytes_written(&self) -> usize {
        self.code.len()
    }

    /// Slot capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once any emit overflowed the slot.
    #[inline]
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Force the failure flag (used when a fixup cannot be encoded).
    #[inline]
    pub fn fail(&mut self) {
        self.failed = true;
    }

    /// The emitted code bytes.
    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Mutable access for jump retargeting at commit.
    #[inline]
    pub fn code_mut(&mut self) -> &mut [u8] {
        &mut self.code
    }

    /// Record a comment at the current position. Emits no bytes.
    pub fn comment(&mut self, text: &str) {
        self.comments.push((self.code.len(), text.to_owned()));
    }

    /// All recorded comments as (offset, text) pairs.
    #[inline]
    pub fn comments(&self) -> &[(usize, String)] {
        &self.comments
    }

    fn emit(&mut self, inst: EncodedInst) {
        if self.failed {
            return;
        }
        if self.code.len() + inst.len() > self.capacity {
            self.failed = true;
            return;
        }
        self.code.extend_from_slice(inst.as_slice());
    }

    // =========================================================================
    // Moves
    // =========================================================================

    /// MOV dst, src.
    pub fn mov(&mut self, dst: Gpr, src: Gpr) {
        self.emit(encoder::encode_mov_rr(dst, src));
    }

    /// MOV dst, imm with the smallest usable encoding.
    pub fn mov_imm(&mut self, dst: Gpr, imm: u64) {
        self.emit(encoder::encode_mov_imm(dst, imm));
    }

    /// Load from memory, zero-extending narrow widths.
    pub fn load(&mut self, dst: Gpr, mem: Indirect, width: MovWidth) {
        self.emit(encoder::encode_load(dst, mem, width));
    }

    /// Store a register to memory.
    pub fn store(&mut self, mem: Indirect, src: Gpr, width: MovWidth) {
        self.emit(encoder::encode_store(mem, src, width));
    }

    /// Store an immediate to memory.
    pub fn store_imm(&mut self, mem: Indirect, imm: i32, width: MovWidth) {
        self.emit(encoder::encode_store_imm(mem, imm, width));
    }

    /// XOR-clear a register.
    pub fn clear_reg(&mut self, reg: Gpr) {
        self.emit(encoder::encode_clear_reg(reg));
    }

    // =========================================================================
    // Compare / Arithmetic
    // =========================================================================

    /// CMP a, b.
    pub fn cmp(&mut self, a: Gpr, b: Gpr) {
        self.emit(encoder::encode_cmp_rr(a, b));
    }

    /// CMP reg, imm at the given width.
    pub fn cmp_imm(&mut self, reg: Gpr, imm: i32, width: MovWidth) {
        self.emit(encoder::encode_cmp_imm(reg, imm, width));
    }

    /// CMP [mem], imm.
    pub fn cmp_mem_imm(&mut self, mem: Indirect, imm: i32) {
        self.emit(encoder::encode_cmp_mem_imm(mem, imm));
    }

    /// CMP [mem], reg.
    pub fn cmp_mem_reg(&mut self, mem: Indirect, reg: Gpr) {
        self.emit(encoder::encode_cmp_mem_reg(mem, reg));
    }

    /// TEST a, b.
    pub fn test(&mut self, a: Gpr, b: Gpr) {
        self.emit(encoder::encode_test_rr(a, b));
    }

    /// ADD reg, imm.
    pub fn add_imm(&mut self, reg: Gpr, imm: i32) {
        self.emit(encoder::encode_add_imm(reg, imm));
    }

    /// ADD [mem], imm.
    pub fn add_mem_imm(&mut self, mem: Indirect, imm: i32) {
        self.emit(encoder::encode_add_mem_imm(mem, imm));
    }

    /// INC [mem].
    pub fn inc_mem(&mut self, mem: Indirect, width: MovWidth) {
        self.emit(encoder::encode_inc_mem(mem, width));
    }

    /// DEC [mem].
    pub fn dec_mem(&mut self, mem: Indirect, width: MovWidth) {
        self.emit(encoder::encode_dec_mem(mem, width));
    }

    /// INC [abs32].
    pub fn inc_abs(&mut self, addr: i32, width: MovWidth) {
        self.emit(encoder::encode_inc_abs(addr, width));
    }

    /// DEC [abs32].
    pub fn dec_abs(&mut self, addr: i32, width: MovWidth) {
        self.emit(encoder::encode_dec_abs(addr, width));
    }

    /// LEA dst, [mem].
    pub fn lea(&mut self, dst: Gpr, mem: Indirect) {
        self.emit(encoder::encode_lea(dst, mem));
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// CALL rel32.
    pub fn call_rel32(&mut self, disp: i32) {
        self.emit(encoder::encode_call_rel32(disp));
    }

    /// CALL reg.
    pub fn call_reg(&mut self, reg: Gpr) {
        self.emit(encoder::encode_call_reg(reg));
    }

    /// CALL [mem].
    pub fn call_mem(&mut self, mem: Indirect) {
        self.emit(encoder::encode_call_mem(mem));
    }

    // =========================================================================
    // Jumps
    // =========================================================================

    /// JMP to a slot-relative offset, using rel8 when it fits.
    pub fn jmp_to(&mut self, dest: JumpDestination) {
        let target = dest.0 as i64;
        let short_disp = target - (self.code.len() as i64 + 2);
        if i8::try_from(short_disp).is_ok() {
            self.emit(encoder::encode_jmp_rel8(short_disp as i8));
        } else {
            let disp = target - (self.code.len() as i64 + 5);
            self.emit(encoder::encode_jmp_rel32(disp as i32));
        }
    }

    /// Jcc to a slot-relative offset, using rel8 when it fits.
    pub fn jcc_to(&mut self, cond: Condition, dest: JumpDestination) {
        let target = dest.0 as i64;
        let short_disp = target - (self.code.len() as i64 + 2);
        if i8::try_from(short_disp).is_ok() {
            self.emit(encoder::encode_jcc_rel8(cond, short_disp as i8));
        } else {
            let disp = target - (self.code.len() as i64 + 6);
            self.emit(encoder::encode_jcc_rel32(cond, disp as i32));
        }
    }

    /// Jcc to a slot-relative offset, always in the 6-byte rel32 form.
    ///
    /// Used for jumps that may be retargeted at commit time, so the patcher
    /// can rely on a fixed layout.
    pub fn jcc_rel32_to(&mut self, cond: Condition, dest: JumpDestination) {
        let disp = dest.0 as i64 - (self.code.len() as i64 + 6);
        self.emit(encoder::encode_jcc_rel32(cond, disp as i32));
    }

    // =========================================================================
    // Labels (forward references)
    // =========================================================================

    /// Create a new unbound label.
    pub fn create_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(None);
        Label(id)
    }

    /// Jcc to a label; patched when the label is bound.
    pub fn jcc_label(&mut self, cond: Condition, label: Label) {
        self.emit(encoder::encode_jcc_rel32(cond, 0));
        if !self.failed {
            self.fixups.push(Fixup {
                pos: (self.code.len() - 4) as u32,
                label,
            });
        }
    }

    /// JMP to a label; patched when the label is bound.
    pub fn jmp_label(&mut self, label: Label) {
        self.emit(encoder::encode_jmp_rel32(0));
        if !self.failed {
            self.fixups.push(Fixup {
                pos: (self.code.len() - 4) as u32,
                label,
            });
        }
    }

    /// Bind a label to the current position, patching pending references.
    pub fn bind_label(&mut self, label: Label) {
        let pos = self.code.len() as u32;
        self.labels[label.id() as usize] = Some(pos);

        let mut i = 0;
        while i < self.fixups.len() {
            if self.fixups[i].label == label {
                let fixup = self.fixups.swap_remove(i);
                let disp = pos as i64 - (fixup.pos as i64 + 4);
                let field = fixup.pos as usize;
                self.code[field..field + 4].copy_from_slice(&(disp as i32).to_le_bytes());
            } else {
                i += 1;
            }
        }
    }

    /// True if any label reference is still unbound.
    #[inline]
    pub fn has_unbound_references(&self) -> bool {
        !self.fixups.is_empty()
    }

    // =========================================================================
    // SSE
    // =========================================================================

    /// MOVSD xmm, [mem].
    pub fn movsd_load(&mut self, dst: Xmm, mem: Indirect) {
        self.emit(encoder::encode_movsd_load(dst, mem));
    }

    /// MOVSD [mem], xmm.
    pub fn movsd_store(&mut self, mem: Indirect, src: Xmm) {
        self.emit(encoder::encode_movsd_store(mem, src));
    }

    /// MOVSD dst, src.
    pub fn movsd(&mut self, dst: Xmm, src: Xmm) {
        self.emit(encoder::encode_movsd_rr(dst, src));
    }

    /// MOVSS xmm, [mem].
    pub fn movss_load(&mut self, dst: Xmm, mem: Indirect) {
        self.emit(encoder::encode_movss_load(dst, mem));
    }

    /// CVTSS2SD dst, src.
    pub fn cvtss2sd(&mut self, dst: Xmm, src: Xmm) {
        self.emit(encoder::encode_cvtss2sd(dst, src));
    }

    // =========================================================================
    // Misc
    // =========================================================================

    /// SETcc reg8.
    pub fn setcc(&mut self, cond: Condition, reg: Gpr) {
        self.emit(encoder::encode_setcc(cond, reg));
    }

    /// Single-byte NOP.
    pub fn nop(&mut self) {
        self.emit(encoder::encode_nop());
    }

    /// INT3 breakpoint.
    pub fn trap(&mut self) {
        self.emit(encoder::encode_int3());
    }

    /// Pad the remainder of the slot with NOPs.
    pub fn fill_with_nops(&mut self) {
        while self.code.len() < self.capacity {
            self.code.push(0x90);
        }
    }
}

/// Retarget a rel32 jump whose displacement field ends at `jmp_end`.
///
/// Used by the slot committer to repoint slow-path jumps after variable-size
/// slot truncation. `jmp_end` and `new_target` are slot-relative offsets.
pub fn retarget_rel32(code: &mut [u8], jmp_end: usize, new_target: usize) {
    let disp = new_target as i64 - jmp_end as i64;
    code[jmp_end - 4..jmp_end].copy_from_slice(&(disp as i32).to_le_bytes());
}

// =============================================================================
// Tests
// =============================================================================
