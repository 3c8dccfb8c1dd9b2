//! The ergonomic `Value` type — a thin, `Copy` wrapper around a
//! [`NanBox`] that adds the operations the rest of the runtime actually
//! calls: `typeOf`, `isSame`/`isEqual`, `hash`, `toBool`, `toString`/
//! `toRepr`. `NanBox` stays a bare bit-packing primitive; this is where the
//! language semantics live.

use std::ptr::NonNull;

use crate::heap::{GcBox, HeapKind, HeapObject};
use crate::nanbox::NanBox;
use pocket_core::hash::bit_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveTag {
    Null,
    Undefined,
    Void,
    Bool,
    Number,
    String,
    List,
    Map,
    Range,
    Module,
    Function,
    Closure,
    Upvalue,
    Fiber,
    Class,
    Instance,
}

#[derive(Clone, Copy)]
pub struct Value(NanBox);

impl Value {
    pub fn null() -> Self {
        Value(NanBox::null())
    }

    pub fn undefined() -> Self {
        Value(NanBox::undefined())
    }

    pub fn void() -> Self {
        Value(NanBox::void())
    }

    pub fn bool(b: bool) -> Self {
        Value(NanBox::from_bool(b))
    }

    pub fn int(n: i32) -> Self {
        Value(NanBox::from_int(n))
    }

    pub fn float(f: f64) -> Self {
        Value(NanBox::from_float(f))
    }

    pub fn object(ptr: NonNull<GcBox>) -> Self {
        Value(NanBox::from_object(ptr))
    }

    pub fn is_null(self) -> bool {
        self.0.is_boxed() && self.0.is_null()
    }

    pub fn is_undefined(self) -> bool {
        self.0.is_undefined()
    }

    pub fn is_void(self) -> bool {
        self.0.is_boxed()
            && !self.0.is_null()
            && !self.0.is_undefined()
            && !self.0.is_bool()
            && !self.0.is_int()
            && !self.0.is_object()
    }

    pub fn is_bool(self) -> bool {
        self.0.is_bool()
    }

    pub fn is_int(self) -> bool {
        self.0.is_int()
    }

    pub fn is_float(self) -> bool {
        self.0.is_float()
    }

    pub fn is_number(self) -> bool {
        self.is_int() || self.is_float()
    }

    pub fn is_object(self) -> bool {
        self.0.is_object()
    }

    pub fn as_bool(self) -> Option<bool> {
        self.is_bool().then(|| self.0.as_bool())
    }

    pub fn as_int(self) -> Option<i32> {
        self.is_int().then(|| self.0.as_int())
    }

    /// Numeric value as `f64`, coercing an integer the way arithmetic ops
    /// that mix int/float operands need to.
    pub fn as_number(self) -> Option<f64> {
        if self.is_int() {
            Some(self.0.as_int() as f64)
        } else if self.is_float() {
            Some(self.0.as_float())
        } else {
            None
        }
    }

    pub fn as_object(self) -> Option<NonNull<GcBox>> {
        self.is_object().then(|| self.0.as_object())
    }

    fn heap(self) -> Option<&'static HeapObject> {
        // SAFETY: object pointers are kept alive by the GC root set for as
        // long as any live `Value` can reference them; the interpreter
        // never lets a `Value` outlive collection of its referent.
        self.as_object().map(|p| unsafe { &p.as_ref().data })
    }

    pub fn heap_kind(self) -> Option<HeapKind> {
        self.heap().map(HeapObject::kind)
    }

    pub fn type_of(self) -> PrimitiveTag {
        if self.is_null() {
            PrimitiveTag::Null
        } else if self.is_undefined() {
            PrimitiveTag::Undefined
        } else if self.is_bool() {
            PrimitiveTag::Bool
        } else if self.is_number() {
            PrimitiveTag::Number
        } else if self.is_object() {
            match self.heap_kind().expect("object value must have a heap kind") {
                HeapKind::String => PrimitiveTag::String,
                HeapKind::List => PrimitiveTag::List,
                HeapKind::Map => PrimitiveTag::Map,
                HeapKind::Range => PrimitiveTag::Range,
                HeapKind::Module => PrimitiveTag::Module,
                HeapKind::Function => PrimitiveTag::Function,
                HeapKind::Closure => PrimitiveTag::Closure,
                HeapKind::Upvalue => PrimitiveTag::Upvalue,
                HeapKind::Fiber => PrimitiveTag::Fiber,
                HeapKind::Class => PrimitiveTag::Class,
                HeapKind::Instance => PrimitiveTag::Instance,
            }
        } else {
            PrimitiveTag::Void
        }
    }

    /// `isSame` — raw bit equality, nothing structural.
    pub fn is_same(self, other: Value) -> bool {
        self.0 == other.0
    }

    /// `isEqual` — `isSame`, plus structural equality for strings,
    /// lists, and ranges. Does not unify an `Int` and a `Float` that carry
    /// the same mathematical value: those have distinct bit patterns, so
    /// `isSame` already reports `false`, and `hash` must agree with
    /// `isEqual` — unifying them here without also unifying their hashes
    /// would break that coherence. Deliberately does not guard against
    /// self-referential lists (such a cycle is deliberately left undetected).
    pub fn is_equal(self, other: Value) -> bool {
        if self.is_same(other) {
            return true;
        }
        match (self.heap_kind(), other.heap_kind()) {
            (Some(HeapKind::String), Some(HeapKind::String)) => {
                self.as_string().unwrap() == other.as_string().unwrap()
            }
            (Some(HeapKind::List), Some(HeapKind::List)) => {
                let a = self.as_list().unwrap();
                let b = other.as_list().unwrap();
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.is_equal(y))
            }
            (Some(HeapKind::Range), Some(HeapKind::Range)) => {
                let a = self.as_range().unwrap();
                let b = other.as_range().unwrap();
                a.from == b.from && a.to == b.to
            }
            _ => false,
        }
    }

    /// `hash` — `None` for list/map/function/fiber/class/instance,
    /// which the caller (chiefly `PkMap`) must reject as map keys.
    pub fn hash(self) -> Option<u64> {
        if self.is_null() {
            Some(bit_hash(0))
        } else if self.is_undefined() {
            Some(bit_hash(1))
        } else if self.is_void() {
            Some(bit_hash(2))
        } else if let Some(b) = self.as_bool() {
            Some(bit_hash(if b { 3 } else { 4 }))
        } else if self.is_int() {
            Some(bit_hash(self.0.as_int() as i64 as u64))
        } else if self.is_float() {
            Some(bit_hash(self.0.as_float().to_bits()))
        } else {
            match self.heap_kind()? {
                HeapKind::String => Some(self.as_string().unwrap().hash()),
                HeapKind::Range => {
                    let r = self.as_range().unwrap();
                    Some(bit_hash(r.from.to_bits()) ^ bit_hash(r.to.to_bits()))
                }
                _ => None,
            }
        }
    }

    /// `toBool`: false for null, false, 0, and empty string/list/map;
    /// true for everything else, including an empty range.
    pub fn to_bool(self) -> bool {
        if self.is_null() || self.is_undefined() {
            return false;
        }
        if let Some(b) = self.as_bool() {
            return b;
        }
        if let Some(n) = self.as_number() {
            return n != 0.0;
        }
        match self.heap_kind() {
            Some(HeapKind::String) => !self.as_string().unwrap().is_empty(),
            Some(HeapKind::List) => !self.as_list().unwrap().borrow().is_empty(),
            Some(HeapKind::Map) => !self.as_map().unwrap().borrow().is_empty(),
            _ => true,
        }
    }

    pub fn as_string(self) -> Option<&'static crate::pk_string::PkString> {
        match self.heap()? {
            HeapObject::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(self) -> Option<&'static std::cell::RefCell<crate::pk_list::PkList>> {
        match self.heap()? {
            HeapObject::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(self) -> Option<&'static std::cell::RefCell<crate::pk_map::PkMap>> {
        match self.heap()? {
            HeapObject::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_range(self) -> Option<&'static crate::pk_range::PkRange> {
        match self.heap()? {
            HeapObject::Range(r) => Some(r),
            _ => None,
        }
    }

    /// `toString`. `visiting` tracks object pointers currently being
    /// rendered higher up the call stack, so a self-referential container
    /// prints `[...]`/`{...}` instead of recursing forever.
    pub fn to_display(self, repr: bool, visiting: &mut Vec<*const GcBox>) -> String {
        if self.is_null() {
            return "null".to_string();
        }
        if self.is_undefined() {
            return "undefined".to_string();
        }
        if self.is_void() {
            return "void".to_string();
        }
        if let Some(b) = self.as_bool() {
            return if b { "true" } else { "false" }.to_string();
        }
        if self.is_int() {
            return self.0.as_int().to_string();
        }
        if self.is_float() {
            return format_float(self.0.as_float());
        }
        let ptr = self.as_object().unwrap().as_ptr() as *const GcBox;
        match self.heap_kind().unwrap() {
            HeapKind::String => {
                let s = self.as_string().unwrap();
                if repr {
                    format!("\"{}\"", escape_repr(&s.as_str_lossy()))
                } else {
                    s.as_str_lossy().into_owned()
                }
            }
            HeapKind::List => {
                if visiting.contains(&ptr) {
                    return "[...]".to_string();
                }
                visiting.push(ptr);
                let items = self.as_list().unwrap().borrow();
                let rendered: Vec<String> =
                    items.iter().map(|v| v.to_display(true, visiting)).collect();
                visiting.pop();
                format!("[{}]", rendered.join(", "))
            }
            HeapKind::Map => {
                if visiting.contains(&ptr) {
                    return "{...}".to_string();
                }
                visiting.push(ptr);
                let map = self.as_map().unwrap().borrow();
                let rendered: Vec<String> = map
                    .iter()
                    .map(|(k, v)| {
                        format!(
                            "{}: {}",
                            k.to_display(true, visiting),
                            v.to_display(true, visiting)
                        )
                    })
                    .collect();
                visiting.pop();
                format!("{{{}}}", rendered.join(", "))
            }
            HeapKind::Range => {
                let r = self.as_range().unwrap();
                format!("{}..{}", format_float(r.from), format_float(r.to))
            }
            HeapKind::Module => "<module>".to_string(),
            HeapKind::Function => "<function>".to_string(),
            HeapKind::Closure => "<closure>".to_string(),
            HeapKind::Upvalue => "<upvalue>".to_string(),
            HeapKind::Fiber => "<fiber>".to_string(),
            HeapKind::Class => "<class>".to_string(),
            HeapKind::Instance => "<instance>".to_string(),
        }
    }

    pub fn to_display_string(self) -> String {
        self.to_display(false, &mut Vec::new())
    }

    pub fn to_repr_string(self) -> String {
        self.to_display(true, &mut Vec::new())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(*other)
    }
}

fn format_float(f: f64) -> String {
    if f == f.trunc() && f.is_finite() && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn escape_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_same_is_bit_equality_for_primitives() {
        assert!(Value::int(5).is_same(Value::int(5)));
        assert!(!Value::int(5).is_same(Value::int(6)));
        assert!(Value::null().is_same(Value::null()));
        assert!(!Value::null().is_same(Value::undefined()));
    }

    #[test]
    fn to_bool_matches_truthiness_table() {
        assert!(!Value::null().to_bool());
        assert!(!Value::bool(false).to_bool());
        assert!(!Value::int(0).to_bool());
        assert!(Value::int(1).to_bool());
        assert!(Value::bool(true).to_bool());
    }

    #[test]
    fn hash_is_defined_for_primitives() {
        assert!(Value::null().hash().is_some());
        assert!(Value::int(1).hash().is_some());
        assert_eq!(Value::int(1).hash(), Value::int(1).hash());
    }

    #[test]
    fn int_and_float_of_same_value_are_not_equal() {
        assert!(!Value::int(1).is_equal(Value::float(1.0)));
        assert_ne!(Value::int(1).hash(), Value::float(1.0).hash());
    }
}
