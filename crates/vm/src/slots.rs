//! The runtime slot API a native function body sees.
//!
//! A native call reserves a small window at the top of the calling fiber's
//! stack — slot 0 is `self` (or null for a bare function), slots
//! `1..=argc` are the arguments — and hands the function a `NativeSlots`
//! borrowing that window plus the heap it may allocate through. Extra
//! slots requested via `reserve_slots` just grow the window; the VM drops
//! everything above slot 0 once the native call returns, leaving only the
//! result it wrote into slot 0.

use std::cell::RefCell;
use std::ptr::NonNull;

use pocket_runtime::{fiber_cell, GcBox, GcHeap, NativeContext, PkFiber, Value};

pub struct NativeSlots<'a> {
    pub(crate) fiber: NonNull<GcBox>,
    pub(crate) base: usize,
    pub(crate) argc: usize,
    pub(crate) reserved: usize,
    pub(crate) gc: &'a mut GcHeap,
    pub(crate) error: Option<String>,
}

impl<'a> NativeSlots<'a> {
    fn fiber_ref(&self) -> &'static RefCell<PkFiber> {
        unsafe { fiber_cell(self.fiber) }
    }

    pub(crate) fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }
}

impl<'a> NativeContext for NativeSlots<'a> {
    fn slot_count(&self) -> usize {
        self.reserved.max(self.argc + 1)
    }

    fn reserve_slots(&mut self, count: usize) {
        if count > self.reserved {
            self.reserved = count;
            let mut fiber = self.fiber_ref().borrow_mut();
            fiber.grow(self.base + count);
        }
    }

    fn get_slot(&self, index: usize) -> Value {
        self.fiber_ref().borrow().stack_get(self.base + index)
    }

    fn set_slot(&mut self, index: usize, value: Value) {
        self.fiber_ref().borrow_mut().stack_set(self.base + index, value);
    }

    fn argc(&self) -> usize {
        self.argc
    }

    fn get_self(&self) -> Value {
        self.get_slot(0)
    }

    fn set_runtime_error(&mut self, message: String) {
        self.error = Some(message);
    }

    fn heap(&mut self) -> &mut GcHeap {
        self.gc
    }
}
