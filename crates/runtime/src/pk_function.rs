//! Function heap objects.
//!
//! A `PkFunction` is either native (a host-supplied callback reached
//! through [`NativeContext`], a Rust trait standing in for a C-shaped
//! runtime slot API) or script (opcodes emitted by `pocket-compiler` plus
//! the per-op line table `pocket-vm` walks to build a stack trace). Bare
//! functions are never pushed on the operand stack — only a
//! [`crate::pk_closure::PkClosure`] wrapping one is a callable run-time
//! value.

use std::ptr::NonNull;

use crate::gc::GcHeap;
use crate::heap::GcBox;
use crate::value::Value;

/// Sentinel arity meaning "any argument count".
pub const VARIADIC: i32 = -1;

/// The host-facing surface a native function body sees: a runtime slot
/// API modeled as a trait object rather than a C vtable.
pub trait NativeContext {
    fn slot_count(&self) -> usize;
    fn reserve_slots(&mut self, count: usize);
    fn get_slot(&self, index: usize) -> Value;
    fn set_slot(&mut self, index: usize, value: Value);
    fn argc(&self) -> usize;
    fn get_self(&self) -> Value;
    fn set_runtime_error(&mut self, message: String);
    /// Gives a native function access to the heap it must allocate through
    /// (a new string, list, …) rather than threading a second parameter
    /// through every `NativeFn`.
    fn heap(&mut self) -> &mut GcHeap;
}

pub type NativeFn = fn(&mut dyn NativeContext);

pub struct ScriptBody {
    pub code: Vec<u8>,
    /// Source line for each opcode offset in `code`, same length as
    /// `code`'s instruction count (not its byte count).
    pub lines: Vec<u32>,
    pub stack_size: u32,
    pub upvalue_count: u8,
}

pub enum FunctionBody {
    Native { body: NativeFn, docstring: Option<String> },
    Script(ScriptBody),
}

pub struct PkFunction {
    pub name: String,
    /// -1 (`VARIADIC`) or a fixed non-negative arity.
    pub arity: i32,
    pub module: NonNull<GcBox>,
    pub body: FunctionBody,
}

impl PkFunction {
    pub fn new_native(name: impl Into<String>, arity: i32, module: NonNull<GcBox>, body: NativeFn, docstring: Option<String>) -> Self {
        PkFunction {
            name: name.into(),
            arity,
            module,
            body: FunctionBody::Native { body, docstring },
        }
    }

    pub fn new_script(name: impl Into<String>, arity: i32, module: NonNull<GcBox>, script: ScriptBody) -> Self {
        PkFunction {
            name: name.into(),
            arity,
            module,
            body: FunctionBody::Script(script),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native { .. })
    }

    pub fn is_variadic(&self) -> bool {
        self.arity == VARIADIC
    }

    pub fn accepts_argc(&self, argc: usize) -> bool {
        self.is_variadic() || self.arity as usize == argc
    }

    pub fn line_for_offset(&self, offset: usize) -> Option<u32> {
        match &self.body {
            FunctionBody::Script(s) => s.lines.get(offset).copied(),
            FunctionBody::Native { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variadic_accepts_any_argc() {
        let module = NonNull::dangling();
        let f = PkFunction::new_native("f", VARIADIC, module, |_| {}, None);
        assert!(f.accepts_argc(0));
        assert!(f.accepts_argc(5));
    }

    #[test]
    fn fixed_arity_rejects_mismatch() {
        let module = NonNull::dangling();
        let f = PkFunction::new_native("f", 2, module, |_| {}, None);
        assert!(f.accepts_argc(2));
        assert!(!f.accepts_argc(1));
    }
}
