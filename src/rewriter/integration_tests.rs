//! Rewriter Integration Tests
//!
//! End-to-end scenarios driving the full collect/emit/commit pipeline
//! against a host-side IC region and asserting on the exact machine code,
//! unwinder metadata, and statistics produced.

use super::*;
use crate::ic::{IcInfo, IcMetadata};
use crate::runtime::{ClassHeader, ObjectHeader};

fn test_ic() -> IcInfo {
    IcInfo::new(IcMetadata::new(256, 1024)).unwrap()
}

fn test_rewriter(ic: &IcInfo, num_args: usize) -> Rewriter<'_> {
    Rewriter::new(ic.start_rewrite().unwrap(), num_args)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

fn has_comment(rw: &Rewriter<'_>, text: &str) -> bool {
    rw.assembler().comments().iter().any(|(_, c)| c == text)
}

unsafe extern "C" fn no_dealloc(_: *mut ObjectHeader) {}

fn leaked_object() -> *mut ObjectHeader {
    let class = Box::into_raw(Box::new(ClassHeader::new(no_dealloc)));
    Box::into_raw(Box::new(ObjectHeader::new(class)))
}

/// An address no test heap will reach, forcing register-indirect calls.
const FAR_HELPER: u64 = 0x7F00_DEAD_0000;

// =============================================================================
// Guards and returns
// =============================================================================

/// Identity guard then return: cmp / jne-to-slowpath / value in the
/// return register / fall-through jump, and nothing else.
#[test]
fn test_identity_guard_then_return() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.add_guard(arg, 0xdead);
    rw.commit_returning_non_python(arg);

    assert!(rw.is_finished());
    assert!(!rw.has_failed());
    assert_eq!(ic.stats().aborted, 0);
    assert_eq!(ic.stats().committed, 1);

    let code = ic.slot_code(0);
    // cmp rdi, 0xdead
    assert_eq!(&code[0..7], &[0x48, 0x81, 0xFF, 0xAD, 0xDE, 0x00, 0x00]);
    // jne rel32, retargeted from the provisional slot end to the real end
    assert_eq!(&code[7..9], &[0x0F, 0x85]);
    let disp = i32::from_le_bytes(code[9..13].try_into().unwrap());
    assert_eq!(disp as usize, code.len() - 13);
    // mov rax, rdi
    assert_eq!(&code[13..16], &[0x48, 0x89, 0xF8]);
    // fall-through jmp to the patchpoint continue point
    assert_eq!(code[16], 0xE9);
    assert_eq!(code.len(), 21);
}

/// `commit_returning` of a borrowed value materializes the new reference
/// with an incref before the return move.
#[test]
fn test_commit_returning_increfs_borrowed() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.set_type(arg, RefType::Borrowed);
    rw.add_guard(arg, 0xdead);
    rw.commit_returning(arg);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // incq [rdi] between the guard and the return move
    let incref_at = find(&code, &[0x48, 0xFF, 0x07]).unwrap();
    let mov_at = find(&code, &[0x48, 0x89, 0xF8]).unwrap();
    assert!(incref_at > 12 && incref_at < mov_at);
}

/// Type-guard on offset 0 plus a quadword load at offset 16, with the
/// load landing directly in the return register.
#[test]
fn test_attr_guard_and_get_attr() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    rw.add_attr_guard(obj, 0, 0x1000, false);
    let attr = rw.get_attr(obj, 16, MovWidth::Q);
    rw.commit_returning_non_python(attr);

    assert!(rw.is_finished());
    assert_eq!(ic.stats().aborted, 0);

    let code = ic.slot_code(0);
    // cmp qword [rdi], 0x1000
    assert_eq!(&code[0..7], &[0x48, 0x81, 0x3F, 0x00, 0x10, 0x00, 0x00]);
    // jne rel32
    assert_eq!(&code[7..9], &[0x0F, 0x85]);
    // mov rax, [rdi+16] -- allocator hands out the return register first
    assert_eq!(&code[13..17], &[0x48, 0x8B, 0x47, 0x10]);
    // no extra moves before the fall-through jump
    assert_eq!(code[17], 0xE9);
}

/// A second large constant near a live one loads via lea, not a fresh
/// 10-byte immediate.
#[test]
fn test_const_reuse_via_lea() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 2);
    let a0 = rw.get_arg(0);
    let a1 = rw.get_arg(1);
    rw.add_guard(a0, 0x1_0000_0000);
    rw.add_guard(a1, 0x1_0000_0020);
    rw.commit();

    assert!(rw.is_finished());
    assert_eq!(ic.stats().committed, 1);

    let code = ic.slot_code(0);
    // exactly one movabs (rax), for the first constant
    assert_eq!(count(&code, &[0x48, 0xB8]), 1);
    // lea rcx, [rax+0x20] for the second
    assert!(find(&code, &[0x48, 0x8D, 0x48, 0x20]).is_some());
}

/// Same-condition guards chain through the first full-size jump as a
/// short-form trampoline.
#[test]
fn test_slow_path_trampoline_short_jump() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 3);
    for i in 0..3 {
        let arg = rw.get_arg(i);
        rw.add_guard(arg, 0x10 + i as u64);
    }
    rw.commit();

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // one rel32 jne, two short backward jne trampolines
    assert_eq!(count(&code, &[0x0F, 0x85]), 1);
    assert_eq!(code.iter().filter(|&&b| b == 0x75).count(), 2);
}

/// Guards recorded after a mutation action fail the rewrite cleanly.
#[test]
fn test_guard_after_mutation_fails_rewrite() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 2);
    let obj = rw.get_arg(0);
    let val = rw.get_arg(1);
    rw.set_attr(obj, 8, val, SetattrKind::Unknown, MovWidth::Q);
    rw.add_guard(obj, 0x1234);
    assert!(rw.has_failed());

    rw.commit();
    assert!(rw.is_finished());
    assert_eq!(ic.stats().committed, 0);
    assert_eq!(ic.stats().aborted, 1);
    assert_eq!(ic.stats().aborted_failed, 1);
}

// =============================================================================
// Reference counting
// =============================================================================

/// An owned ref handed off to a store produces no decref and no decref
/// info past the hand-off point.
#[test]
fn test_owned_ref_handoff_no_decref() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let val = rw.call(false, FAR_HELPER, &[], &[], &[]);
    rw.set_type(val, RefType::Owned);
    rw.set_attr(obj, 8, val, SetattrKind::HandedOff, MovWidth::Q);
    rw.ref_consumed(val);
    rw.commit();

    assert!(rw.is_finished());
    assert_eq!(ic.stats().committed, 1);
    assert!(!has_comment(&rw, "_decref"));

    // the call's decref info exists but names no locations
    let infos = ic.slot_decref_infos(0);
    assert_eq!(infos.len(), 1);
    assert!(infos[0].locations.is_empty());
}

/// An owned ref that nothing consumes gets a synthesized decref at its
/// final use, with the dealloc call under a jump-if-nonzero.
#[test]
fn test_decref_emitted_for_unconsumed_owned() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 0);
    let val = rw.call(false, FAR_HELPER, &[], &[], &[]);
    rw.set_type(val, RefType::Owned);
    rw.commit();

    assert!(rw.is_finished());
    assert!(has_comment(&rw, "_decref"));

    let code = ic.slot_code(0);
    // decq [rdi] followed by a forward jnz over the dealloc sequence
    let dec_at = find(&code, &[0x48, 0xFF, 0x0F]).unwrap();
    assert_eq!(&code[dec_at + 3..dec_at + 5], &[0x0F, 0x85]);
    // mov rax, [rdi+8]; call [rax+16]
    assert!(find(&code, &[0x48, 0x8B, 0x47, 0x08]).is_some());
    assert!(find(&code, &[0xFF, 0x50, 0x10]).is_some());
}

/// xdecref of a nullable value routes through the null-safe helper.
#[test]
fn test_xdecref_nullable_calls_helper() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let prev = rw.get_attr(obj, 24, MovWidth::Q);
    rw.set_nullable(prev, true);
    rw.xdecref(prev);
    rw.commit();

    assert!(rw.is_finished());
    assert!(has_comment(&rw, "_xdecref"));
    assert!(has_comment(&rw, "_call"));
    assert_eq!(ic.stats().committed, 1);
}

/// replace_attr loads the old value, stores the new one, and releases
/// the old one.
#[test]
fn test_replace_attr_releases_previous() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let val = rw.call(false, FAR_HELPER, &[], &[], &[]);
    rw.set_type(val, RefType::Owned);
    rw.replace_attr(obj, 16, val, false);
    rw.commit();

    assert!(rw.is_finished());
    assert!(has_comment(&rw, "_get_attr"));
    assert!(has_comment(&rw, "_set_attr"));
    assert!(has_comment(&rw, "_decref"));
    assert_eq!(ic.stats().committed, 1);
}

/// incref of a compile-time-constant pointer increments through an
/// absolute address without touching a register.
#[test]
fn test_incref_constant_pointer() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 0);
    let obj = rw.load_const(0x1000);
    rw.set_type(obj, RefType::Borrowed);
    rw.incref(obj);
    rw.commit();

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // incq [abs 0x1000]
    assert!(find(&code, &[0x48, 0xFF, 0x04, 0x25, 0x00, 0x10, 0x00, 0x00]).is_some());
}

// =============================================================================
// Calls and decref info
// =============================================================================

/// An owned var live across a throwing call appears in that call's
/// decref info, translated from its scratch slot to a stack offset.
#[test]
fn test_throwing_call_decref_info() {
    let mut metadata = IcMetadata::new(256, 1024);
    metadata.spill_regs = GprSet::EMPTY; // force spills into scratch
    let ic = IcInfo::new(metadata).unwrap();

    let mut rw = test_rewriter(&ic, 1);
    let owned = rw.call(false, FAR_HELPER, &[], &[], &[]);
    rw.set_type(owned, RefType::Owned);
    let _ignored = rw.call(false, FAR_HELPER + 0x100, &[], &[], &[]);
    rw.commit_returning(owned);

    assert!(rw.is_finished());
    assert_eq!(ic.stats().committed, 1);

    let infos = ic.slot_decref_infos(0);
    assert_eq!(infos.len(), 2);
    // nothing owned is live at the first call
    assert!(infos[0].locations.is_empty());
    // the second call sees `owned` spilled to scratch slot 0, reported as
    // an rsp-relative stack slot
    assert_eq!(infos[1].locations, vec![Location::Stack(32)]);

    // instruction pointers fall inside the slot, in program order
    let base = ic.slot_start_addr(0);
    let len = ic.slot_code(0).len() as u64;
    assert!(infos[0].ip > base && infos[0].ip <= base + len);
    assert!(infos[1].ip > infos[0].ip && infos[1].ip <= base + len);
}

/// An owned var spilled to a callee-saved register is reported by
/// register, not by stack slot.
#[test]
fn test_decref_info_prefers_callee_saved_register() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 0);
    let owned = rw.call(false, FAR_HELPER, &[], &[], &[]);
    rw.set_type(owned, RefType::Owned);
    let _ignored = rw.call(false, FAR_HELPER + 0x100, &[], &[], &[]);
    rw.commit_returning(owned);

    assert!(rw.is_finished());
    let infos = ic.slot_decref_infos(0);
    assert_eq!(infos[1].locations, vec![Location::Reg(Gpr::Rbx)]);
}

/// Integer args land in the ABI argument registers, displacing and
/// preserving prior occupants.
#[test]
fn test_call_abi_placement() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let seven = rw.load_const(7);
    let zero = rw.load_const(0);
    let result = rw.call(false, FAR_HELPER, &[seven, obj, zero], &[], &[]);
    rw.commit_returning_non_python(result);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // obj evicted from rdi into a callee-saved register
    assert!(find(&code, &[0x48, 0x89, 0xFB]).is_some()); // mov rbx, rdi
    // ...then placed as argument 1
    assert!(find(&code, &[0x48, 0x89, 0xDE]).is_some()); // mov rsi, rbx
    // argument 0 as an immediate
    assert!(find(&code, &[0xBF, 0x07, 0x00, 0x00, 0x00]).is_some()); // mov edi, 7
    // argument 2 as the zero idiom
    assert!(find(&code, &[0x31, 0xD2]).is_some()); // xor edx, edx
    // far helper goes through r11
    assert!(find(&code, &[0x41, 0xFF, 0xD3]).is_some()); // call r11
}

/// A helper within rel32 range gets a near call, not an indirect one.
#[test]
fn test_near_call_uses_rel32() {
    let ic = test_ic();
    let func = ic.region_base() + 0x4000;
    let mut rw = test_rewriter(&ic, 0);
    let result = rw.call(false, func, &[], &[], &[]);
    rw.commit_returning_non_python(result);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    assert!(code.contains(&0xE8));
    // no movabs into r11
    assert!(find(&code, &[0x49, 0xBB]).is_none());
}

/// The first side-effectful call pads the invalidation header, bumps the
/// slot's num_inside counter, and commit emits the matching decrement.
#[test]
fn test_side_effect_call_marks_inside_ic() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let result = rw.call(true, FAR_HELPER, &[obj], &[], &[]);
    rw.commit_returning_non_python(result);

    assert!(rw.is_finished());
    assert!(has_comment(&rw, "mark inside ic"));

    let code = ic.slot_code(0);
    // invalidation header: nothing but nops in the first five bytes
    assert!(code[..5].iter().all(|&b| b == 0x90));
    // increment and decrement of the counter, through a register since
    // the counter lives on the test heap; the decrement avoids the
    // return register
    assert!(find(&code, &[0xFF, 0x00]).is_some()); // incl [rax]
    assert!(find(&code, &[0xFF, 0x09]).is_some()); // decl [rcx]
    // counter is balanced on the host side
    assert_eq!(ic.slot_num_inside(0), 0);
}

// =============================================================================
// Scratch allocation
// =============================================================================

/// Live scratch allocations occupy disjoint slots; stores to each use
/// distinct rsp offsets.
#[test]
fn test_scratch_allocations_are_disjoint() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 0);
    let first = rw.allocate(2);
    let second = rw.allocate(2);
    let seven = rw.load_const(7);
    let nine = rw.load_const(9);
    rw.set_attr(first, 0, seven, SetattrKind::Unknown, MovWidth::Q);
    rw.set_attr(second, 0, nine, SetattrKind::Unknown, MovWidth::Q);
    rw.commit();

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // mov qword [rsp+32], 7 -- first allocation at scratch slot 0
    assert!(find(&code, &[0x48, 0xC7, 0x44, 0x24, 0x20, 0x07, 0x00, 0x00, 0x00]).is_some());
    // mov qword [rsp+48], 9 -- second allocation two slots later
    assert!(find(&code, &[0x48, 0xC7, 0x44, 0x24, 0x30, 0x09, 0x00, 0x00, 0x00]).is_some());
}

/// allocate_and_copy reserves slots and copies element by element.
#[test]
fn test_allocate_and_copy() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let src = rw.get_arg(0);
    let copy = rw.allocate_and_copy(src, 2);
    rw.commit_returning_non_python(copy);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // mov rax, [rdi]; mov [rsp+32], rax
    assert!(find(&code, &[0x48, 0x8B, 0x07]).is_some());
    assert!(find(&code, &[0x48, 0x89, 0x44, 0x24, 0x20]).is_some());
    // mov rax, [rdi+8]; mov [rsp+40], rax
    assert!(find(&code, &[0x48, 0x8B, 0x47, 0x08]).is_some());
    assert!(find(&code, &[0x48, 0x89, 0x44, 0x24, 0x28]).is_some());
}

/// Requesting more scratch than the window holds fails the rewrite and
/// returns the slot untouched.
#[test]
fn test_scratch_exhaustion_aborts() {
    let ic = test_ic(); // 64-byte scratch window: 8 slots
    let mut rw = test_rewriter(&ic, 0);
    let _big = rw.allocate(9);
    rw.commit();

    assert!(rw.is_finished());
    assert!(rw.has_failed());
    assert_eq!(ic.stats().committed, 0);
    assert_eq!(ic.stats().aborted, 1);
    assert_eq!(ic.stats().aborted_failed, 1);
    assert_eq!(ic.committed_slots(), 0);
    assert_eq!(ic.bytes_used(), 0);
}

// =============================================================================
// Live-outs
// =============================================================================

/// A live-out in a caller-saved register is spilled around a call and
/// placed back before the slot exits.
#[test]
fn test_caller_saved_live_out_restored() {
    let mut metadata = IcMetadata::new(256, 1024);
    metadata.live_out_regs = vec![Gpr::R10.dwarf()];
    let ic = IcInfo::new(metadata).unwrap();

    let mut rw = test_rewriter(&ic, 0);
    let result = rw.call(false, FAR_HELPER, &[], &[], &[]);
    rw.commit_returning_non_python(result);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // spilled into rbx before the call, moved back after
    let spill_at = find(&code, &[0x4C, 0x89, 0xD3]).unwrap(); // mov rbx, r10
    let restore_at = find(&code, &[0x49, 0x89, 0xDA]).unwrap(); // mov r10, rbx
    assert!(spill_at < restore_at);
}

/// Callee-saved live-outs survive untouched.
#[test]
fn test_callee_saved_live_outs_untouched() {
    let mut metadata = IcMetadata::new(256, 1024);
    metadata.live_out_regs = vec![Gpr::R12.dwarf(), Gpr::R13.dwarf()];
    let ic = IcInfo::new(metadata).unwrap();

    let mut rw = test_rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.add_guard(arg, 0x42);
    rw.commit_returning_non_python(arg);

    assert!(rw.is_finished());
    assert_eq!(ic.stats().committed, 1);
    let code = ic.slot_code(0);
    // no spill/restore traffic for r12/r13
    assert!(find(&code, &[0x4D, 0x89]).is_none());
}

// =============================================================================
// Retained references and aborts
// =============================================================================

/// Abort releases retained references exactly once.
#[test]
fn test_abort_releases_retained_refs() {
    let obj = leaked_object();
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 0);
    rw.retain_reference(unsafe { RuntimeRef::from_borrowed(obj) });
    unsafe { assert_eq!((*obj).refcount, 2) };

    rw.abort();
    unsafe { assert_eq!((*obj).refcount, 1) };
    assert_eq!(ic.stats().aborted, 1);
}

/// A retained object whose refcount fell to one kills the rewrite
/// silently: the specialization is already dead.
#[test]
fn test_stale_reference_aborts_silently() {
    let obj = leaked_object();
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.add_guard(arg, 0x42);
    rw.retain_reference(unsafe { RuntimeRef::from_borrowed(obj) });

    // the runtime dropped its reference while we were collecting
    unsafe { (*obj).refcount -= 1 };

    rw.commit();
    assert!(rw.is_finished());
    assert_eq!(ic.stats().committed, 0);
    assert_eq!(ic.stats().aborted, 1);
    assert_eq!(ic.stats().aborted_failed, 0);
    assert_eq!(ic.stats().aborted_assembly_fail, 0);
}

/// Committed slots keep their retained references until invalidation.
#[test]
fn test_commit_transfers_retained_refs() {
    let obj = leaked_object();
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.add_guard(arg, 0x42);
    rw.retain_reference(unsafe { RuntimeRef::from_borrowed(obj) });
    rw.commit();

    assert!(rw.is_finished());
    assert_eq!(ic.slot_retained_refs(0), 1);
    unsafe { assert_eq!((*obj).refcount, 2) };

    ic.invalidate_slot(0);
    unsafe { assert_eq!((*obj).refcount, 1) };
}

#[test]
#[should_panic(expected = "terminal call on a finished rewrite")]
fn test_second_terminal_call_panics() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 0);
    rw.commit();
    assert!(rw.is_finished());
    rw.abort();
}

#[test]
#[should_panic(expected = "collect-phase operation called while emitting")]
fn test_collect_after_commit_panics() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    rw.commit();
    let arg = rw.get_arg(0);
    rw.add_guard(arg, 1);
}

#[test]
#[should_panic(expected = "deregister_owned_attr")]
fn test_unmatched_owned_attr_panics() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 0);
    let arr = rw.allocate(1);
    rw.register_owned_attr(arr, 0);
    rw.commit();
}

// =============================================================================
// Owned attributes
// =============================================================================

/// A registered owned attribute shows up in decref info as a two-level
/// stack-indirect record.
#[test]
fn test_owned_attr_decref_info() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let arr = rw.allocate(2);
    let stored = rw.get_attr(obj, 8, MovWidth::Q);
    rw.set_attr(arr, 8, stored, SetattrKind::Unknown, MovWidth::Q);
    rw.register_owned_attr(arr, 8);
    let _result = rw.call(false, FAR_HELPER, &[], &[], &[arr]);
    rw.deregister_owned_attr(arr, 8);
    rw.commit();

    assert!(rw.is_finished());
    assert_eq!(ic.stats().committed, 1);
    let infos = ic.slot_decref_infos(0);
    assert_eq!(infos.len(), 1);
    // scratch slot 0 at rsp+32, field at byte 8 inside it
    assert!(infos[0]
        .locations
        .contains(&Location::StackIndirect(32, 8)));
}

// =============================================================================
// Floating point
// =============================================================================

/// Double loads go straight into an XMM register.
#[test]
fn test_get_attr_double() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let _d = rw.get_attr_double(obj, 8, Location::XmmReg(Xmm::Xmm0));
    rw.commit();

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // movsd xmm0, [rdi+8]
    assert!(find(&code, &[0xF2, 0x0F, 0x10, 0x47, 0x08]).is_some());
}

/// Float loads widen to double in place.
#[test]
fn test_get_attr_float_widens() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let obj = rw.get_arg(0);
    let _f = rw.get_attr_float(obj, 12, Location::XmmReg(Xmm::Xmm1));
    rw.commit();

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // movss xmm1, [rdi+12]
    assert!(find(&code, &[0xF3, 0x0F, 0x10, 0x4F, 0x0C]).is_some());
    // cvtss2sd xmm1, xmm1
    assert!(find(&code, &[0xF3, 0x0F, 0x5A, 0xC9]).is_some());
}

// =============================================================================
// Comparisons
// =============================================================================

/// Materialized comparisons restrict the result to a byte-addressable
/// register and use setcc.
#[test]
fn test_cmp_eq_materializes_bool() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 2);
    let a = rw.get_arg(0);
    let b = rw.get_arg(1);
    let eq = rw.cmp_eq(a, b);
    rw.commit_returning_non_python(eq);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // cmp rdi, rsi
    assert!(find(&code, &[0x48, 0x39, 0xF7]).is_some());
    // sete al
    assert!(find(&code, &[0x0F, 0x94, 0xC0]).is_some());
}

/// to_bool emits test + setnz.
#[test]
fn test_to_bool() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let v = rw.get_arg(0);
    let b = rw.to_bool(v);
    rw.commit_returning_non_python(b);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // test rdi, rdi
    assert!(find(&code, &[0x48, 0x85, 0xFF]).is_some());
    // setne al
    assert!(find(&code, &[0x0F, 0x95, 0xC0]).is_some());
}

// =============================================================================
// Error-check helper
// =============================================================================

/// check_and_throw_capi_exception tests the sentinel and calls the
/// thrower under a forward jnz.
#[test]
fn test_check_and_throw_capi_exception() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let ret = rw.get_arg(0);
    rw.check_and_throw_capi_exception(ret, 0, MovWidth::Q);
    rw.commit();

    assert!(rw.is_finished());
    assert!(has_comment(&rw, "_check_and_throw_capi_exception"));
    let code = ic.slot_code(0);
    // test rdi, rdi, then (after caller-save movs) a jnz over the thrower
    let test_at = find(&code, &[0x48, 0x85, 0xFF]).unwrap();
    let jnz_at = find(&code[test_at..], &[0x0F, 0x85]).unwrap() + test_at;
    assert!(jnz_at > test_at);
    // a decref-info record is registered for the throwing path
    assert_eq!(ic.slot_decref_infos(0).len(), 1);
}

// =============================================================================
// Remaining guard and arithmetic forms
// =============================================================================

/// Sign guards exit on negative values.
#[test]
fn test_guard_not_lt0() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let len = rw.get_arg(0);
    rw.add_guard_not_lt0(len);
    rw.commit_returning_non_python(len);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // test rdi, rdi; js rel32
    assert_eq!(&code[0..3], &[0x48, 0x85, 0xFF]);
    assert_eq!(&code[3..5], &[0x0F, 0x88]);
}

/// Negated guards exit on equality.
#[test]
fn test_guard_not_eq() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let arg = rw.get_arg(0);
    rw.add_guard_not_eq(arg, 0x33);
    rw.commit_returning_non_python(arg);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // cmp rdi, 0x33 (imm8 form); je rel32
    assert_eq!(&code[0..4], &[0x48, 0x83, 0xFF, 0x33]);
    assert_eq!(&code[4..6], &[0x0F, 0x84]);
}

/// add copies into a fresh register, then adds the immediate.
#[test]
fn test_add_immediate() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 1);
    let base = rw.get_arg(0);
    let sum = rw.add(base, 24);
    rw.commit_returning_non_python(sum);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // mov rax, rdi; add rax, 24
    assert!(find(&code, &[0x48, 0x89, 0xF8]).is_some());
    assert!(find(&code, &[0x48, 0x83, 0xC0, 0x18]).is_some());
}

/// allocate_and_copy_plus1 stores the head element, then copies the rest.
#[test]
fn test_allocate_and_copy_plus1() {
    let ic = test_ic();
    let mut rw = test_rewriter(&ic, 2);
    let head = rw.get_arg(0);
    let rest = rw.get_arg(1);
    let array = rw.allocate_and_copy_plus1(head, Some(rest), 2);
    rw.commit_returning_non_python(array);

    assert!(rw.is_finished());
    let code = ic.slot_code(0);
    // mov [rsp+32], rdi -- the head element at slot 0
    assert!(find(&code, &[0x48, 0x89, 0x7C, 0x24, 0x20]).is_some());
    // mov rax, [rsi]; mov [rsp+40], rax -- rest element 0 at slot 1
    assert!(find(&code, &[0x48, 0x8B, 0x06]).is_some());
    assert!(find(&code, &[0x48, 0x89, 0x44, 0x24, 0x28]).is_some());
    // mov rax, [rsi+8]; mov [rsp+48], rax -- rest element 1 at slot 2
    assert!(find(&code, &[0x48, 0x8B, 0x46, 0x08]).is_some());
    assert!(find(&code, &[0x48, 0x89, 0x44, 0x24, 0x30]).is_some());
    // the result is the array address
    assert!(find(&code, &[0x48, 0x8D, 0x44, 0x24, 0x20]).is_some()); // lea rax, [rsp+32]
}
