//! Heap-object header and the VM-wide object chain.
//!
//! Every heap allocation is a `GcBox`: a mark bit, a `next` pointer
//! threading it into the VM's singly-linked object chain, and the object's
//! own data. There is no separate kind byte in the header — `HeapObject`'s
//! discriminant already tells the GC and the NaN box's `Object` tag what
//! they're looking at, so `GcBox::kind()` reads it straight off the enum
//! rather than keeping a second copy in sync.
//!
//! `GcBox`es are allocated with `Box::into_raw` and only ever freed by the
//! collector in `gc.rs`; every
//! other consumer reaches them through a `NonNull<GcBox>` borrowed from a
//! `NanBox`, a `GcHandle`, or a root list.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::pk_class::{PkClass, PkInstance};
use crate::pk_closure::{PkClosure, PkUpvalue};
use crate::pk_fiber::PkFiber;
use crate::pk_function::PkFunction;
use crate::pk_list::PkList;
use crate::pk_map::PkMap;
use crate::pk_module::PkModule;
use crate::pk_range::PkRange;
use crate::pk_string::PkString;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
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

impl HeapKind {
    /// Name surfaced by the `type_name` built-in and in error
    /// messages ("X is not subscriptable", etc).
    pub fn name(self) -> &'static str {
        match self {
            HeapKind::String => "String",
            HeapKind::List => "List",
            HeapKind::Map => "Map",
            HeapKind::Range => "Range",
            HeapKind::Module => "Module",
            HeapKind::Function => "Function",
            HeapKind::Closure => "Closure",
            HeapKind::Upvalue => "Upvalue",
            HeapKind::Fiber => "Fiber",
            HeapKind::Class => "Class",
            HeapKind::Instance => "Instance",
        }
    }
}

/// Lists and maps are mutated in place through a shared `NonNull<GcBox>`,
/// so their payloads live behind a `RefCell`; immutable objects (strings,
/// ranges, functions) don't need one.
pub enum HeapObject {
    String(PkString),
    List(RefCell<PkList>),
    Map(RefCell<PkMap>),
    Range(PkRange),
    Module(RefCell<PkModule>),
    Function(PkFunction),
    Closure(RefCell<PkClosure>),
    Upvalue(RefCell<PkUpvalue>),
    Fiber(RefCell<PkFiber>),
    Class(RefCell<PkClass>),
    Instance(RefCell<PkInstance>),
}

impl HeapObject {
    pub fn kind(&self) -> HeapKind {
        match self {
            HeapObject::String(_) => HeapKind::String,
            HeapObject::List(_) => HeapKind::List,
            HeapObject::Map(_) => HeapKind::Map,
            HeapObject::Range(_) => HeapKind::Range,
            HeapObject::Module(_) => HeapKind::Module,
            HeapObject::Function(_) => HeapKind::Function,
            HeapObject::Closure(_) => HeapKind::Closure,
            HeapObject::Upvalue(_) => HeapKind::Upvalue,
            HeapObject::Fiber(_) => HeapKind::Fiber,
            HeapObject::Class(_) => HeapKind::Class,
            HeapObject::Instance(_) => HeapKind::Instance,
        }
    }

    /// Rough byte size used to recount `bytes_allocated` during sweep.
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<GcBox>();
        base + match self {
            HeapObject::String(s) => s.len(),
            HeapObject::List(l) => l.borrow().len() * std::mem::size_of::<crate::value::Value>(),
            HeapObject::Map(m) => m.borrow().capacity() * 2 * std::mem::size_of::<crate::value::Value>(),
            _ => 0,
        }
    }
}

pub struct GcBox {
    pub marked: Cell<bool>,
    pub next: Cell<Option<NonNull<GcBox>>>,
    pub data: HeapObject,
}

impl GcBox {
    pub fn new(data: HeapObject) -> Box<GcBox> {
        Box::new(GcBox {
            marked: Cell::new(false),
            next: Cell::new(None),
            data,
        })
    }

    pub fn kind(&self) -> HeapKind {
        self.data.kind()
    }

    pub fn is_marked(&self) -> bool {
        self.marked.get()
    }

    pub fn mark(&self) {
        self.marked.set(true);
    }

    pub fn unmark(&self) {
        self.marked.set(false);
    }
}

/// Pointer equality for heap objects — this is what `Value::isSame`
/// ultimately reduces to for the `Object` tag.
pub fn same_object(a: NonNull<GcBox>, b: NonNull<GcBox>) -> bool {
    a == b
}
