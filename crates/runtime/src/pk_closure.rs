//! Closure and Upvalue heap objects.
//!
//! An upvalue is open while its enclosing activation is still on a fiber's
//! stack and closed once that activation returns. A raw pointer into the
//! stack would need patching on every grow that moves the backing storage;
//! recording `(fiber, slot index)` instead stays valid across a grow for
//! free since indices don't move — growth only needs to touch the fiber's
//! own frame bookkeeping, not every upvalue.

use std::ptr::NonNull;

use crate::heap::GcBox;
use crate::pk_fiber::PkFiber;
use crate::value::Value;

pub enum UpvalueState {
    Open { fiber: NonNull<GcBox>, slot: usize },
    Closed(Value),
}

pub struct PkUpvalue(UpvalueState);

impl PkUpvalue {
    pub fn open(fiber: NonNull<GcBox>, slot: usize) -> Self {
        PkUpvalue(UpvalueState::Open { fiber, slot })
    }

    pub fn is_open(&self) -> bool {
        matches!(self.0, UpvalueState::Open { .. })
    }

    pub fn stack_slot(&self) -> Option<(NonNull<GcBox>, usize)> {
        match self.0 {
            UpvalueState::Open { fiber, slot } => Some((fiber, slot)),
            UpvalueState::Closed(_) => None,
        }
    }

    pub fn get(&self) -> Value {
        match self.0 {
            UpvalueState::Open { fiber, slot } => {
                // SAFETY: same invariant as `Value::heap` — the fiber this
                // upvalue references is kept alive by GC roots for as long
                // as the upvalue itself is reachable.
                let fiber_ref: &std::cell::RefCell<PkFiber> =
                    unsafe { crate::pk_fiber::fiber_cell(fiber) };
                fiber_ref.borrow().stack_get(slot)
            }
            UpvalueState::Closed(v) => v,
        }
    }

    pub fn set(&mut self, value: Value) {
        match self.0 {
            UpvalueState::Open { fiber, slot } => {
                let fiber_ref: &std::cell::RefCell<PkFiber> =
                    unsafe { crate::pk_fiber::fiber_cell(fiber) };
                fiber_ref.borrow_mut().stack_set(slot, value);
            }
            UpvalueState::Closed(ref mut v) => *v = value,
        }
    }

    /// `OP_CLOSE_UPVALUE` / frame-return closing: copy `value` (the
    /// current slot's value, read by the caller before the fiber's stack
    /// goes away) into the upvalue itself so it survives the frame going
    /// away. Takes the value rather than reading the slot itself since
    /// the caller already holds the fiber borrowed mutably at the point
    /// upvalues are closed.
    pub fn close(&mut self, value: Value) {
        if let UpvalueState::Open { .. } = self.0 {
            self.0 = UpvalueState::Closed(value);
        }
    }
}

pub struct PkClosure {
    pub function: NonNull<GcBox>,
    pub upvalues: Vec<NonNull<GcBox>>,
}

impl PkClosure {
    pub fn new(function: NonNull<GcBox>, upvalues: Vec<NonNull<GcBox>>) -> Self {
        PkClosure { function, upvalues }
    }
}
