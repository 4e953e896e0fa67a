//! Object-layout facade consumed by emitted code.
//!
//! The rewriter does not know the runtime's full object model; it consumes
//! three facts: the offset of the reference-count word, the offset of the
//! class pointer, and the offset of the deallocation slot within a class.
//! Emitted code manipulates refcounts through those offsets and calls
//! `[obj → class → dealloc]` when a count hits zero.
//!
//! [`RuntimeRef`] is the host-side owned handle the rewriter keeps for
//! objects baked into emitted code (guard values, constant attributes). It
//! pins the object for the lifetime of the installed slot.

use std::ptr::NonNull;

/// Byte offset of the reference-count word in every object.
pub const REFCOUNT_OFFSET: i32 = 0;

/// Byte offset of the class pointer in every object.
pub const CLASS_OFFSET: i32 = 8;

/// Byte offset of the dealloc function pointer within a class object.
pub const DEALLOC_OFFSET: i32 = 16;

/// Signature of a class's deallocation slot.
pub type DeallocFn = unsafe extern "C" fn(*mut ObjectHeader);

// =============================================================================
// Object Layout
// =============================================================================

/// Common header of every runtime object.
#[repr(C)]
pub struct ObjectHeader {
    /// Non-atomic reference count; the runtime is single-threaded at the
    /// object-mutation level.
    pub refcount: u64,
    /// The object's class.
    pub class: *mut ClassHeader,
}

impl ObjectHeader {
    /// Create a header with an initial refcount of 1.
    #[inline]
    pub fn new(class: *mut ClassHeader) -> Self {
        ObjectHeader { refcount: 1, class }
    }
}

/// Header of a class object: an object header followed by the dealloc slot.
#[repr(C)]
pub struct ClassHeader {
    pub base: ObjectHeader,
    /// Called when an instance's refcount reaches zero.
    pub dealloc: DeallocFn,
}

impl ClassHeader {
    /// Create a class with no metaclass.
    #[inline]
    pub fn new(dealloc: DeallocFn) -> Self {
        ClassHeader {
            base: ObjectHeader {
                refcount: 1,
                class: std::ptr::null_mut(),
            },
            dealloc,
        }
    }
}

// =============================================================================
// Helper entry points referenced by emitted code
// =============================================================================

/// Null-safe decref helper; emitted code calls this for nullable slots.
///
/// # Safety
///
/// `obj` must be null or a valid object pointer with a positive refcount.
pub unsafe extern "C" fn object_xdecref(obj: *mut ObjectHeader) {
    if obj.is_null() {
        return;
    }
    unsafe {
        (*obj).refcount -= 1;
        if (*obj).refcount == 0 {
            let class = (*obj).class;
            ((*class).dealloc)(obj);
        }
    }
}

/// Raises the pending C-API exception. Emitted code calls this when a
/// helper signalled failure through its return value.
pub extern "C" fn throw_capi_exception() {
    // The real runtime unwinds from here; reaching it on the host side is a
    // bug in the embedding.
    panic!("throw_capi_exception called outside emitted code");
}

// =============================================================================
// Retained references
// =============================================================================

/// An owned reference to a runtime object held by the host.
///
/// The rewriter retains one of these for every object pointer baked into
/// emitted code, releasing them on abort or when the slot is invalidated.
pub struct RuntimeRef {
    ptr: NonNull<ObjectHeader>,
}

impl RuntimeRef {
    /// Take ownership of a borrowed pointer, incrementing its refcount.
    ///
    /// # Safety
    ///
    /// `ptr` must be a valid object pointer with a positive refcount.
    #[inline]
    pub unsafe fn from_borrowed(ptr: *mut ObjectHeader) -> Self {
        let ptr = NonNull::new(ptr).expect("null object pointer");
        unsafe {
            (*ptr.as_ptr()).refcount += 1;
        }
        RuntimeRef { ptr }
    }

    /// The raw object pointer.
    #[inline]
    pub fn as_ptr(&self) -> *mut ObjectHeader {
        self.ptr.as_ptr()
    }

    /// The object address as an immediate for emitted code.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Current refcount. Used for the stale-optimization check at commit.
    #[inline]
    pub fn refcount(&self) -> u64 {
        unsafe { (*self.ptr.as_ptr()).refcount }
    }
}

impl Clone for RuntimeRef {
    fn clone(&self) -> Self {
        unsafe { Self::from_borrowed(self.ptr.as_ptr()) }
    }
}

impl Drop for RuntimeRef {
    fn drop(&mut self) {
        unsafe {
            let obj = self.ptr.as_ptr();
            (*obj).refcount -= 1;
            if (*obj).refcount == 0 {
                let class = (*obj).class;
                ((*class).dealloc)(obj);
            }
        }
    }
}

impl std::fmt::Debug for RuntimeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RuntimeRef({:p}, rc={})", self.ptr, self.refcount())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DEALLOC_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_dealloc(obj: *mut ObjectHeader) {
        DEALLOC_CALLS.fetch_add(1, Ordering::SeqCst);
        drop(unsafe { Box::from_raw(obj) });
    }

    fn new_class() -> *mut ClassHeader {
        Box::into_raw(Box::new(ClassHeader::new(counting_dealloc)))
    }

    fn new_object(class: *mut ClassHeader) -> *mut ObjectHeader {
        Box::into_raw(Box::new(ObjectHeader::new(class)))
    }

    #[test]
    fn test_layout_offsets() {
        assert_eq!(std::mem::offset_of!(ObjectHeader, refcount), REFCOUNT_OFFSET as usize);
        assert_eq!(std::mem::offset_of!(ObjectHeader, class), CLASS_OFFSET as usize);
        assert_eq!(std::mem::offset_of!(ClassHeader, dealloc), DEALLOC_OFFSET as usize);
    }

    #[test]
    fn test_runtime_ref_counts() {
        let class = new_class();
        let obj = new_object(class);

        let r1 = unsafe { RuntimeRef::from_borrowed(obj) };
        assert_eq!(r1.refcount(), 2);

        let r2 = r1.clone();
        assert_eq!(r1.refcount(), 3);

        drop(r2);
        assert_eq!(r1.refcount(), 2);

        drop(r1);
        unsafe {
            assert_eq!((*obj).refcount, 1);
            // release the creating reference
            object_xdecref(obj);
            drop(Box::from_raw(class));
        }
    }

    #[test]
    fn test_dealloc_called_at_zero() {
        let class = new_class();
        let obj = new_object(class);
        let before = DEALLOC_CALLS.load(Ordering::SeqCst);

        unsafe { object_xdecref(obj) };
        assert_eq!(DEALLOC_CALLS.load(Ordering::SeqCst), before + 1);

        unsafe { drop(Box::from_raw(class)) };
    }

    #[test]
    fn test_xdecref_null_is_noop() {
        unsafe { object_xdecref(std::ptr::null_mut()) };
    }
}
