//! Fiber heap objects.
//!
//! Each fiber owns its own value stack and call-frame array and is the
//! interpreter's unit of cooperative scheduling. `pocket-vm` drives the
//! dispatch loop and owns `OP_CALL`/`OP_RETURN`/`yield` semantics; this
//! module only owns the data a fiber needs to exist: its stack, its
//! frames, stack growth, and the open-upvalue bookkeeping that growth and
//! frame return both touch.

use std::cell::RefCell;
use std::ptr::NonNull;

use crate::heap::{GcBox, HeapObject};
use crate::value::Value;

pub const MIN_STACK_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    New,
    Running,
    Yielded,
    Done,
}

/// One activation record. `rbp` is an index into the fiber's stack:
/// `stack[rbp]` is the return-value slot, `stack[rbp+1..=rbp+arity]` are
/// the arguments.
pub struct CallFrame {
    pub ip: usize,
    pub closure: NonNull<GcBox>,
    pub rbp: usize,
    pub self_value: Value,
}

pub struct PkFiber {
    pub state: FiberState,
    pub stack: Vec<Value>,
    pub sp: usize,
    pub frames: Vec<CallFrame>,
    /// Open upvalues, ordered by descending stack slot — new opens are
    /// inserted so the list stays sorted, which is what makes "is there
    /// already an open upvalue for this slot" a short linear scan.
    pub open_upvalues: Vec<NonNull<GcBox>>,
    pub base_closure: NonNull<GcBox>,
    pub caller: Option<NonNull<GcBox>>,
    pub error: Option<String>,
}

impl PkFiber {
    pub fn new(base_closure: NonNull<GcBox>) -> Self {
        PkFiber {
            state: FiberState::New,
            stack: vec![Value::null(); MIN_STACK_SIZE],
            sp: 0,
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            base_closure,
            caller: None,
            error: None,
        }
    }

    pub fn stack_get(&self, index: usize) -> Value {
        self.stack[index]
    }

    pub fn stack_set(&mut self, index: usize, value: Value) {
        self.stack[index] = value;
    }

    pub fn push(&mut self, value: Value) {
        if self.sp == self.stack.len() {
            self.grow(self.stack.len() + 1);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
    }

    pub fn pop(&mut self) -> Value {
        self.sp -= 1;
        self.stack[self.sp]
    }

    /// Ensures the stack can hold at least `required` slots, growing to
    /// the next power of two if not. Because open upvalues address the
    /// stack by index rather than raw pointer (see `pk_closure.rs`),
    /// growth here is just a `Vec` resize — no pointer-patching pass over
    /// frames or upvalues is needed.
    pub fn grow(&mut self, required: usize) {
        if required <= self.stack.len() {
            return;
        }
        let new_len = pocket_core::pow2::ceil_pow2(required);
        self.stack.resize(new_len, Value::null());
    }

    /// Finds or creates the open upvalue for `slot`, deduping by walking
    /// the open-upvalue list. `alloc` is called only on a miss, to
    /// allocate a fresh `GcBox`.
    pub fn find_or_open_upvalue(
        &mut self,
        fiber_ptr: NonNull<GcBox>,
        slot: usize,
        alloc: impl FnOnce(crate::pk_closure::PkUpvalue) -> NonNull<GcBox>,
    ) -> NonNull<GcBox> {
        for &up in &self.open_upvalues {
            // SAFETY: every entry in `open_upvalues` is a live Upvalue GcBox.
            let data = unsafe { &up.as_ref().data };
            if let HeapObject::Upvalue(cell) = data {
                if cell.borrow().stack_slot() == Some((fiber_ptr, slot)) {
                    return up;
                }
            }
        }
        let fresh = alloc(crate::pk_closure::PkUpvalue::open(fiber_ptr, slot));
        let insert_at = self
            .open_upvalues
            .iter()
            .position(|&up| {
                let data = unsafe { &up.as_ref().data };
                matches!(data, HeapObject::Upvalue(cell) if cell.borrow().stack_slot().map(|(_, s)| s) < Some(slot))
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(insert_at, fresh);
        fresh
    }

    /// Closes every open upvalue at-or-above `from_slot`. Reads each
    /// slot's value from `self` before closing rather than letting the
    /// upvalue re-borrow the fiber itself, since `self` is already
    /// borrowed mutably by the caller at this point. A hand-rolled
    /// index loop rather than `Vec::retain`, since the retain closure
    /// would need to borrow all of `self` (for `stack_get`) while
    /// `self.open_upvalues` is simultaneously borrowed by `retain`.
    pub fn close_upvalues_from(&mut self, from_slot: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let up = self.open_upvalues[i];
            let data = unsafe { &up.as_ref().data };
            let remove = match data {
                HeapObject::Upvalue(cell) => match cell.borrow().stack_slot() {
                    None => true,
                    Some((_, slot)) if slot >= from_slot => {
                        let value = self.stack_get(slot);
                        cell.borrow_mut().close(value);
                        true
                    }
                    _ => false,
                },
                _ => false,
            };
            if remove {
                self.open_upvalues.remove(i);
            } else {
                i += 1;
            }
        }
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    pub fn take_error(&mut self) -> Option<String> {
        self.error.take()
    }
}

/// # Safety
/// `ptr` must point at a live `GcBox` whose data is `HeapObject::Fiber`.
pub unsafe fn fiber_cell(ptr: NonNull<GcBox>) -> &'static RefCell<PkFiber> {
    match &ptr.as_ref().data {
        HeapObject::Fiber(cell) => cell,
        _ => panic!("fiber_cell called on a non-Fiber GcBox"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_fiber_starts_in_new_state() {
        let dummy = NonNull::dangling();
        let f = PkFiber::new(dummy);
        assert_eq!(f.state, FiberState::New);
        assert_eq!(f.stack.len(), MIN_STACK_SIZE);
    }

    #[test]
    fn grow_rounds_up_to_power_of_two_and_preserves_indices() {
        let dummy = NonNull::dangling();
        let mut f = PkFiber::new(dummy);
        f.stack_set(3, Value::int(42));
        f.grow(200);
        assert!(f.stack.len() >= 200);
        assert_eq!(f.stack_get(3).as_int(), Some(42));
    }

    #[test]
    fn push_pop_roundtrip() {
        let dummy = NonNull::dangling();
        let mut f = PkFiber::new(dummy);
        f.push(Value::int(1));
        f.push(Value::int(2));
        assert_eq!(f.pop().as_int(), Some(2));
        assert_eq!(f.pop().as_int(), Some(1));
    }
}
