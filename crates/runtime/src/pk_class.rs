//! Class and Instance heap objects.
//!
//! User classes are single-inheritance from `Object` or another user
//! class; the ten primitive classes are final and never appear as
//! a `super_class`. A class's constructor, when present, is the closure
//! bound under the reserved method name `_init`.

use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::heap::GcBox;

pub struct PkClass {
    pub module: NonNull<GcBox>,
    pub name_index: u32,
    pub ctor: Option<NonNull<GcBox>>,
    /// Field names in declaration order; an instance's field `Value`s are
    /// indexed the same way.
    pub fields: Vec<u32>,
    pub methods: Vec<(u32, NonNull<GcBox>)>,
    pub super_class: Option<NonNull<GcBox>>,
    /// Primitive classes (Object, Null, Bool, Number, String, List, Map,
    /// Range, Closure, Fiber) are final — never a valid `super_class`.
    pub is_final: bool,
}

impl PkClass {
    pub fn new(module: NonNull<GcBox>, name_index: u32, super_class: Option<NonNull<GcBox>>) -> Self {
        PkClass {
            module,
            name_index,
            ctor: None,
            fields: Vec::new(),
            methods: Vec::new(),
            super_class,
            is_final: false,
        }
    }

    pub fn bind_method(&mut self, name_index: u32, closure: NonNull<GcBox>, ctor_name_index: u32) {
        if name_index == ctor_name_index {
            self.ctor = Some(closure);
        } else if let Some(slot) = self.methods.iter_mut().find(|(n, _)| *n == name_index) {
            slot.1 = closure;
        } else {
            self.methods.push((name_index, closure));
        }
    }

    pub fn own_method(&self, name_index: u32) -> Option<NonNull<GcBox>> {
        self.methods
            .iter()
            .find(|(n, _)| *n == name_index)
            .map(|(_, c)| *c)
    }

    pub fn field_index(&self, name_index: u32) -> Option<usize> {
        self.fields.iter().position(|&n| n == name_index)
    }

    pub fn declare_field(&mut self, name_index: u32) -> usize {
        if let Some(i) = self.field_index(name_index) {
            return i;
        }
        self.fields.push(name_index);
        self.fields.len() - 1
    }
}

/// Walks `class` then its `super_class` chain looking for a method bound
/// to `name_index`. `classes` resolves a `GcBox` pointer to its `PkClass`;
/// kept as a callback so this module doesn't need to know how the caller
/// borrows heap data.
pub fn resolve_method(
    class: NonNull<GcBox>,
    name_index: u32,
    class_of: impl Fn(NonNull<GcBox>) -> Option<NonNull<GcBox>>,
    method_of: impl Fn(NonNull<GcBox>, u32) -> Option<NonNull<GcBox>>,
) -> Option<NonNull<GcBox>> {
    let mut current = Some(class);
    while let Some(c) = current {
        if let Some(m) = method_of(c, name_index) {
            return Some(m);
        }
        current = class_of(c);
    }
    None
}

pub enum PkInstance {
    Native {
        ptr: *mut c_void,
        native_id: u32,
    },
    Script {
        class: NonNull<GcBox>,
        fields: Vec<crate::value::Value>,
    },
}

impl PkInstance {
    pub fn new_script(class: NonNull<GcBox>, field_count: usize) -> Self {
        PkInstance::Script {
            class,
            fields: vec![crate::value::Value::null(); field_count],
        }
    }

    pub fn new_native(ptr: *mut c_void, native_id: u32) -> Self {
        PkInstance::Native { ptr, native_id }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, PkInstance::Native { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_method_distinguishes_ctor_from_regular_methods() {
        let module = NonNull::dangling();
        let mut class = PkClass::new(module, 0, None);
        let ctor_name = 1u32;
        let init_closure = NonNull::dangling();
        class.bind_method(ctor_name, init_closure, ctor_name);
        assert!(class.ctor.is_some());
        assert!(class.own_method(ctor_name).is_none());
    }

    #[test]
    fn declare_field_is_idempotent() {
        let module = NonNull::dangling();
        let mut class = PkClass::new(module, 0, None);
        let a = class.declare_field(5);
        let b = class.declare_field(5);
        assert_eq!(a, b);
        assert_eq!(class.fields.len(), 1);
    }
}
