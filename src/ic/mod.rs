//! Patchpoint / IC-slot infrastructure.
//!
//! An [`IcInfo`] describes one rewritable dispatch site: a fixed region of
//! (would-be executable) memory next to the patchpoint, the scratch-window
//! geometry, the register environment, and the live-out set the surrounding
//! code expects. Rewrites reserve a provisional slot, emit into a private
//! buffer, and either commit (installing the bytes and transferring retained
//! references and unwinder metadata) or abort (returning the slot).
//!
//! # Concurrency
//!
//! Slot reservation is serialized by an internal mutex; at most one rewrite
//! is in flight per IC. Each committed slot carries a `num_inside` counter
//! that emitted side-effectful code increments on entry and decrements on
//! exit, so invalidators know when patching the prefix is safe.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use thiserror::Error;

use crate::backend::x64::assembler::{retarget_rel32, Assembler, JumpDestination};
use crate::backend::x64::encoder::Condition;
use crate::backend::x64::registers::{Gpr, GprSet};
use crate::rewriter::location::Location;
use crate::runtime::RuntimeRef;

/// Rewrite attempts after which a site is considered megamorphic.
pub const MEGAMORPHIC_THRESHOLD: u32 = 100;

/// Bytes an invalidator may overwrite with a jump; side-effectful code must
/// not start before this prefix.
pub const IC_INVALIDATION_HEADER_SIZE: usize = 5;

// =============================================================================
// Errors
// =============================================================================

/// Failures surfaced by the slot infrastructure.
#[derive(Error, Debug)]
pub enum IcError {
    /// Metadata describes an impossible IC.
    #[error("invalid ic metadata: {0}")]
    InvalidMetadata(&'static str),

    /// A rewrite is already in flight for this IC.
    #[error("a rewrite is already in progress")]
    RewriteActive,

    /// The emitted code overflowed its slot.
    #[error("slot overflow: {written} bytes emitted into a {slot_size}-byte slot")]
    SlotOverflow { written: usize, slot_size: usize },
}

// =============================================================================
// Metadata
// =============================================================================

/// Static description of one patchpoint, fixed at compile time of the
/// surrounding code.
#[derive(Debug, Clone)]
pub struct IcMetadata {
    /// Provisional size of one rewrite slot, in bytes.
    pub slot_size: usize,
    /// Total size of the rewritable region.
    pub region_size: usize,
    /// Size of the per-IC scratch window, in bytes (multiple of 8).
    pub scratch_size: i32,
    /// Offset of the scratch window from the entry stack pointer.
    pub scratch_rsp_offset: i32,
    /// Registers the rewriter may allocate.
    pub allocatable_regs: GprSet,
    /// Callee-saved registers usable as spill destinations.
    pub spill_regs: GprSet,
    /// Register the fast path's result must land in.
    pub return_register: Gpr,
    /// DWARF numbers of registers live after the patchpoint.
    pub live_out_regs: Vec<u16>,
    /// Whether emitted code must maintain the `num_inside` counter.
    pub needs_invalidation_support: bool,
}

impl IcMetadata {
    /// Metadata with the default register environment.
    pub fn new(slot_size: usize, region_size: usize) -> Self {
        IcMetadata {
            slot_size,
            region_size,
            scratch_size: 64,
            scratch_rsp_offset: 32,
            allocatable_regs: GprSet::ALLOCATABLE,
            spill_regs: GprSet::SPILLABLE_CALLEE_SAVED,
            return_register: Gpr::Rax,
            live_out_regs: Vec::new(),
            needs_invalidation_support: true,
        }
    }

    fn validate(&self) -> Result<(), IcError> {
        if self.slot_size == 0 || self.slot_size > self.region_size {
            return Err(IcError::InvalidMetadata("slot does not fit region"));
        }
        if self.scratch_size < 0 || self.scratch_size % 8 != 0 {
            return Err(IcError::InvalidMetadata("scratch size must be a multiple of 8"));
        }
        if self.allocatable_regs.contains(Gpr::Rsp) || self.allocatable_regs.contains(Gpr::Rbp) {
            return Err(IcError::InvalidMetadata("rsp/rbp are not allocatable"));
        }
        if self.live_out_regs.contains(&self.return_register.dwarf()) {
            return Err(IcError::InvalidMetadata("return register listed as live-out"));
        }
        Ok(())
    }
}

// =============================================================================
// Decref Info
// =============================================================================

/// Unwinder record: locations holding owned references at one call site.
#[derive(Debug, Clone)]
pub struct DecrefInfo {
    /// Absolute instruction pointer immediately after the call.
    pub ip: u64,
    /// Locations the unwinder must decref if `ip` unwinds.
    pub locations: Vec<Location>,
}

/// A full-size conditional jump to the slow path, recorded so commit can
/// retarget it after variable-size slot truncation.
#[derive(Debug, Clone, Copy)]
pub struct SlowPathJump {
    /// Offset of the jump's first byte.
    pub start: usize,
    /// Offset one past the displacement field.
    pub end: usize,
    pub cond: Condition,
}

// =============================================================================
// Slots
// =============================================================================

/// One committed (or in-flight) rewrite slot.
pub struct IcSlot {
    /// Offset of the slot within the region.
    pub start: usize,
    /// Committed code length; 0 while the rewrite is in flight.
    pub code_len: usize,
    /// Readers-inside counter maintained by emitted code.
    pub num_inside: AtomicU32,
    /// Unwinder metadata for this slot's call sites.
    pub decref_infos: Vec<DecrefInfo>,
    /// Object references baked into the emitted code.
    pub retained_refs: Vec<RuntimeRef>,
}

struct RegionState {
    bytes: Box<[u8]>,
    next_free: usize,
    rewrite_active: bool,
    slots: Vec<Box<IcSlot>>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Per-IC rewrite counters.
#[derive(Debug, Default)]
struct IcStats {
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    aborted_assembly_fail: AtomicU64,
    aborted_failed: AtomicU64,
    total_bytes: AtomicU64,
}

/// Snapshot of [`IcInfo`] statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IcStatsSnapshot {
    pub started: u64,
    pub committed: u64,
    pub aborted: u64,
    pub aborted_assembly_fail: u64,
    pub aborted_failed: u64,
    pub total_bytes: u64,
}

// =============================================================================
// IcInfo
// =============================================================================

/// One rewritable dispatch site.
pub struct IcInfo {
    metadata: IcMetadata,
    region: Mutex<RegionState>,
    stats: IcStats,
    times_rewritten: AtomicU32,
}

impl IcInfo {
    /// Create an IC with a zero-filled region.
    pub fn new(metadata: IcMetadata) -> Result<IcInfo, IcError> {
        metadata.validate()?;
        let bytes = vec![0u8; metadata.region_size].into_boxed_slice();
        Ok(IcInfo {
            metadata,
            region: Mutex::new(RegionState {
                bytes,
                next_free: 0,
                rewrite_active: false,
                slots: Vec::new(),
            }),
            stats: IcStats::default(),
            times_rewritten: AtomicU32::new(0),
        })
    }

    /// Static metadata for this site.
    #[inline]
    pub fn metadata(&self) -> &IcMetadata {
        &self.metadata
    }

    /// Base address of the rewritable region.
    pub fn region_base(&self) -> u64 {
        self.region.lock().bytes.as_ptr() as u64
    }

    /// True once the site has been rewritten too many times to be worth
    /// specializing further.
    #[inline]
    pub fn is_megamorphic(&self) -> bool {
        self.times_rewritten.load(Ordering::Relaxed) >= MEGAMORPHIC_THRESHOLD
    }

    /// Whether a new rewrite attempt is worthwhile.
    pub fn should_attempt(&self) -> bool {
        if self.is_megamorphic() {
            return false;
        }
        let region = self.region.lock();
        !region.rewrite_active && region.next_free + self.metadata.slot_size <= region.bytes.len()
    }

    /// Begin a rewrite, serializing against other rewrites of this IC.
    pub fn start_rewrite(&self) -> Result<SlotRewrite<'_>, IcError> {
        {
            let mut region = self.region.lock();
            if region.rewrite_active {
                return Err(IcError::RewriteActive);
            }
            region.rewrite_active = true;
        }
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        Ok(SlotRewrite {
            ic: self,
            slot_index: None,
            finished: false,
        })
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> IcStatsSnapshot {
        IcStatsSnapshot {
            started: self.stats.started.load(Ordering::Relaxed),
            committed: self.stats.committed.load(Ordering::Relaxed),
            aborted: self.stats.aborted.load(Ordering::Relaxed),
            aborted_assembly_fail: self.stats.aborted_assembly_fail.load(Ordering::Relaxed),
            aborted_failed: self.stats.aborted_failed.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
        }
    }

    /// Number of committed slots.
    pub fn committed_slots(&self) -> usize {
        self.region.lock().slots.iter().filter(|s| s.code_len > 0).count()
    }

    /// Bytes occupied by committed slots.
    pub fn bytes_used(&self) -> usize {
        self.region.lock().next_free
    }

    /// The installed code of a committed slot.
    pub fn slot_code(&self, index: usize) -> Vec<u8> {
        let region = self.region.lock();
        let slot = &region.slots[index];
        region.bytes[slot.start..slot.start + slot.code_len].to_vec()
    }

    /// Region-absolute start address of a slot.
    pub fn slot_start_addr(&self, index: usize) -> u64 {
        let region = self.region.lock();
        region.bytes.as_ptr() as u64 + region.slots[index].start as u64
    }

    /// Unwinder records of a committed slot.
    pub fn slot_decref_infos(&self, index: usize) -> Vec<DecrefInfo> {
        self.region.lock().slots[index].decref_infos.clone()
    }

    /// Number of retained references held by a committed slot.
    pub fn slot_retained_refs(&self, index: usize) -> usize {
        self.region.lock().slots[index].retained_refs.len()
    }

    /// `num_inside` value of a committed slot.
    pub fn slot_num_inside(&self, index: usize) -> u32 {
        self.region.lock().slots[index].num_inside.load(Ordering::Relaxed)
    }

    /// Drop a committed slot, releasing its retained references.
    ///
    /// The caller must have observed `num_inside == 0` after detaching the
    /// entry jump; this host-side bookkeeping does not re-check.
    pub fn invalidate_slot(&self, index: usize) {
        let mut region = self.region.lock();
        let slot = &mut region.slots[index];
        slot.code_len = 0;
        slot.decref_infos.clear();
        slot.retained_refs.clear();
    }
}

// =============================================================================
// SlotRewrite
// =============================================================================

/// A reservation for one rewrite of one IC.
///
/// Created by [`IcInfo::start_rewrite`]; at most one exists per IC at a
/// time. Dropping it without committing releases the reservation.
pub struct SlotRewrite<'ic> {
    ic: &'ic IcInfo,
    slot_index: Option<usize>,
    finished: bool,
}

impl<'ic> SlotRewrite<'ic> {
    /// Provisional slot size in bytes.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.ic.metadata.slot_size
    }

    /// Scratch window size in bytes.
    #[inline]
    pub fn scratch_size(&self) -> i32 {
        self.ic.metadata.scratch_size
    }

    /// Scratch window offset from the entry stack pointer.
    #[inline]
    pub fn scratch_rsp_offset(&self) -> i32 {
        self.ic.metadata.scratch_rsp_offset
    }

    /// The register the fast path's result must land in.
    #[inline]
    pub fn return_register(&self) -> Gpr {
        self.ic.metadata.return_register
    }

    /// The owning IC.
    #[inline]
    pub fn ic(&self) -> &'ic IcInfo {
        self.ic
    }

    /// Reserve the concrete slot. Returns its absolute start address, or
    /// `None` when the region is exhausted.
    pub(crate) fn prepare_entry(&mut self) -> Option<u64> {
        debug_assert!(self.slot_index.is_none(), "slot already prepared");
        let mut region = self.ic.region.lock();
        let start = region.next_free;
        if start + self.ic.metadata.slot_size > region.bytes.len() {
            return None;
        }
        region.slots.push(Box::new(IcSlot {
            start,
            code_len: 0,
            num_inside: AtomicU32::new(0),
            decref_infos: Vec::new(),
            retained_refs: Vec::new(),
        }));
        self.slot_index = Some(region.slots.len() - 1);
        Some(region.bytes.as_ptr() as u64 + start as u64)
    }

    /// Absolute address of the picked slot's `num_inside` counter.
    pub(crate) fn num_inside_addr(&self) -> u64 {
        let region = self.ic.region.lock();
        let slot = &region.slots[self.slot_index.expect("no slot prepared")];
        &slot.num_inside as *const AtomicU32 as u64
    }

    /// Install the emitted code.
    ///
    /// Appends the fall-through jump to the patchpoint continue point,
    /// retargets recorded slow-path jumps to the truncated slot end, copies
    /// the bytes into the region, and transfers retained references and
    /// unwinder records to the slot.
    pub(crate) fn commit(
        &mut self,
        asm: &mut Assembler,
        decref_infos: Vec<DecrefInfo>,
        retained_refs: Vec<RuntimeRef>,
        pending_jumps: &[SlowPathJump],
    ) -> Result<(), IcError> {
        debug_assert!(!self.finished);
        let slot_index = self.slot_index.expect("commit without prepare_entry");

        let mut region = self.ic.region.lock();
        let slot_start = region.slots[slot_index].start;

        // Fall through to the code after the whole region.
        let continue_offset = region.bytes.len() - slot_start;
        asm.jmp_to(JumpDestination::from_start(continue_offset));
        if asm.has_failed() {
            return Err(IcError::SlotOverflow {
                written: asm.bytes_written(),
                slot_size: self.ic.metadata.slot_size,
            });
        }

        // The slot shrinks to the bytes actually emitted; slow-path jumps
        // that targeted the provisional end now target the real end.
        let code_len = asm.bytes_written();
        for jump in pending_jumps {
            retarget_rel32(asm.code_mut(), jump.end, code_len);
        }

        region.bytes[slot_start..slot_start + code_len].copy_from_slice(asm.code());
        region.next_free = slot_start + code_len;

        let slot = &mut region.slots[slot_index];
        slot.code_len = code_len;
        slot.decref_infos = decref_infos;
        slot.retained_refs = retained_refs;

        region.rewrite_active = false;
        self.finished = true;

        self.ic.times_rewritten.fetch_add(1, Ordering::Relaxed);
        self.ic.stats.committed.fetch_add(1, Ordering::Relaxed);
        self.ic
            .stats
            .total_bytes
            .fetch_add(code_len as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Abandon the rewrite, returning any reserved slot.
    pub(crate) fn abort(&mut self) {
        debug_assert!(!self.finished);
        let mut region = self.ic.region.lock();
        if let Some(index) = self.slot_index.take() {
            // The provisional slot is always the most recent reservation.
            debug_assert_eq!(index, region.slots.len() - 1);
            region.slots.pop();
        }
        region.rewrite_active = false;
        self.finished = true;
        self.ic.stats.aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record which failure class caused an abort.
    pub(crate) fn note_assembly_fail(&self) {
        self.ic
            .stats
            .aborted_assembly_fail
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_failed(&self) {
        self.ic.stats.aborted_failed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for SlotRewrite<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
