//! The always-present built-in name table.
//!
//! `print`, `gc`, and `yield` need capabilities a plain [`NativeContext`]
//! can't express — host stdio, the VM's external GC roots, fiber control
//! flow — so they're registered as ordinary closures whose bodies are never
//! actually invoked: the dispatch loop recognizes their `Function` pointer
//! by identity before it would otherwise make a native call, and runs
//! VM-level logic instead. Everything else here (`to_string`, `to_repr`,
//! `type_name`, `list_append`, `list_remove`, `map_remove`) only needs heap
//! allocation and slot access, so it's a genuine [`NativeFn`].

use std::cell::RefCell;
use std::ptr::NonNull;

use pocket_runtime::{
    GcBox, GcHeap, HeapObject, NativeContext, PkClass, PkClosure, PkFunction, PkModule, PkString,
    Value, VARIADIC,
};

pub struct PrimitiveClasses {
    pub object: NonNull<GcBox>,
    pub null: NonNull<GcBox>,
    pub bool_: NonNull<GcBox>,
    pub number: NonNull<GcBox>,
    pub string: NonNull<GcBox>,
    pub list: NonNull<GcBox>,
    pub map: NonNull<GcBox>,
    pub range: NonNull<GcBox>,
    pub closure: NonNull<GcBox>,
    pub fiber: NonNull<GcBox>,
}

/// Identity anchors for the three call-site intrinsics, plus everything
/// resolvable through `PushGlobal`'s built-in fallback tier.
pub struct Builtins {
    pub names: Vec<(String, Value)>,
    pub print_fn: NonNull<GcBox>,
    pub gc_fn: NonNull<GcBox>,
    pub yield_fn: NonNull<GcBox>,
    pub classes: PrimitiveClasses,
}

fn unreachable_native(_ctx: &mut dyn NativeContext) {
    unreachable!("call dispatch must intercept this function by identity before invoking it");
}

fn native_closure(
    gc: &mut GcHeap,
    module: NonNull<GcBox>,
    name: &str,
    arity: i32,
    body: pocket_runtime::NativeFn,
) -> NonNull<GcBox> {
    let function = gc.alloc(HeapObject::Function(PkFunction::new_native(name, arity, module, body, None)));
    gc.alloc(HeapObject::Closure(RefCell::new(PkClosure::new(function, Vec::new()))))
}

fn primitive_class(
    gc: &mut GcHeap,
    module: &mut std::cell::RefMut<'_, PkModule>,
    module_ptr: NonNull<GcBox>,
    name: &str,
    super_class: Option<NonNull<GcBox>>,
) -> NonNull<GcBox> {
    let name_idx = module.intern_name(name);
    let mut class = PkClass::new(module_ptr, name_idx, super_class);
    class.is_final = true;
    gc.alloc(HeapObject::Class(RefCell::new(class)))
}

fn to_string_native(ctx: &mut dyn NativeContext) {
    let v = ctx.get_slot(1);
    let text = v.to_display_string();
    let ptr = ctx.heap().alloc(HeapObject::String(PkString::from_str(&text)));
    ctx.set_slot(0, Value::object(ptr));
}

fn to_repr_native(ctx: &mut dyn NativeContext) {
    let v = ctx.get_slot(1);
    let text = v.to_repr_string();
    let ptr = ctx.heap().alloc(HeapObject::String(PkString::from_str(&text)));
    ctx.set_slot(0, Value::object(ptr));
}

fn type_name_native(ctx: &mut dyn NativeContext) {
    let v = ctx.get_slot(1);
    let name = crate::vm::primitive_type_name(v);
    let ptr = ctx.heap().alloc(HeapObject::String(PkString::from_str(name)));
    ctx.set_slot(0, Value::object(ptr));
}

fn list_append_native(ctx: &mut dyn NativeContext) {
    let list_v = ctx.get_slot(1);
    let value = ctx.get_slot(2);
    match list_v.as_list() {
        Some(cell) => {
            cell.borrow_mut().push(value);
            ctx.set_slot(0, Value::null());
        }
        None => ctx.set_runtime_error("list_append expects a List as its first argument".into()),
    }
}

fn list_remove_native(ctx: &mut dyn NativeContext) {
    let list_v = ctx.get_slot(1);
    let index_v = ctx.get_slot(2);
    let (Some(cell), Some(idx)) = (list_v.as_list(), index_v.as_int()) else {
        ctx.set_runtime_error("list_remove expects (List, Number)".into());
        return;
    };
    match cell.borrow_mut().remove(idx as usize) {
        Ok(removed) => ctx.set_slot(0, removed),
        Err(message) => ctx.set_runtime_error(message.to_string()),
    }
}

fn map_remove_native(ctx: &mut dyn NativeContext) {
    let map_v = ctx.get_slot(1);
    let key = ctx.get_slot(2);
    let Some(cell) = map_v.as_map() else {
        ctx.set_runtime_error("map_remove expects a Map as its first argument".into());
        return;
    };
    match cell.borrow_mut().remove(key) {
        Ok(Some(v)) => ctx.set_slot(0, v),
        Ok(None) => ctx.set_slot(0, Value::null()),
        Err(_) => ctx.set_runtime_error("unhashable map key".into()),
    }
}

pub fn install(gc: &mut GcHeap) -> (NonNull<GcBox>, Builtins) {
    let module_ptr = gc.alloc(HeapObject::Module(RefCell::new(PkModule::new("builtin", "<builtin>"))));

    let object = {
        let cell = unsafe { pocket_runtime::module_cell(module_ptr) };
        let mut module = cell.borrow_mut();
        primitive_class(gc, &mut module, module_ptr, "Object", None)
    };
    let mut class_of = |gc: &mut GcHeap, name: &str| {
        let cell = unsafe { pocket_runtime::module_cell(module_ptr) };
        let mut module = cell.borrow_mut();
        primitive_class(gc, &mut module, module_ptr, name, Some(object))
    };
    let null = class_of(gc, "Null");
    let bool_ = class_of(gc, "Bool");
    let number = class_of(gc, "Number");
    let string = class_of(gc, "String");
    let list = class_of(gc, "List");
    let map = class_of(gc, "Map");
    let range = class_of(gc, "Range");
    let closure = class_of(gc, "Closure");
    let fiber = class_of(gc, "Fiber");
    drop(class_of);

    let print_fn = native_closure(gc, module_ptr, "print", VARIADIC, unreachable_native);
    let gc_fn = native_closure(gc, module_ptr, "gc", 0, unreachable_native);
    let yield_fn = native_closure(gc, module_ptr, "yield", VARIADIC, unreachable_native);
    let to_string_fn = native_closure(gc, module_ptr, "to_string", 1, to_string_native);
    let to_repr_fn = native_closure(gc, module_ptr, "to_repr", 1, to_repr_native);
    let type_name_fn = native_closure(gc, module_ptr, "type_name", 1, type_name_native);
    let list_append_fn = native_closure(gc, module_ptr, "list_append", 2, list_append_native);
    let list_remove_fn = native_closure(gc, module_ptr, "list_remove", 2, list_remove_native);
    let map_remove_fn = native_closure(gc, module_ptr, "map_remove", 2, map_remove_native);

    let names = vec![
        ("print".to_string(), Value::object(print_fn)),
        ("gc".to_string(), Value::object(gc_fn)),
        ("yield".to_string(), Value::object(yield_fn)),
        ("to_string".to_string(), Value::object(to_string_fn)),
        ("to_repr".to_string(), Value::object(to_repr_fn)),
        ("type_name".to_string(), Value::object(type_name_fn)),
        ("list_append".to_string(), Value::object(list_append_fn)),
        ("list_remove".to_string(), Value::object(list_remove_fn)),
        ("map_remove".to_string(), Value::object(map_remove_fn)),
        ("Object".to_string(), Value::object(object)),
        ("Null".to_string(), Value::object(null)),
        ("Bool".to_string(), Value::object(bool_)),
        ("Number".to_string(), Value::object(number)),
        ("String".to_string(), Value::object(string)),
        ("List".to_string(), Value::object(list)),
        ("Map".to_string(), Value::object(map)),
        ("Range".to_string(), Value::object(range)),
        ("Closure".to_string(), Value::object(closure)),
        ("Fiber".to_string(), Value::object(fiber)),
    ];

    (
        module_ptr,
        Builtins {
            names,
            print_fn,
            gc_fn,
            yield_fn,
            classes: PrimitiveClasses {
                object,
                null,
                bool_,
                number,
                string,
                list,
                map,
                range,
                closure,
                fiber,
            },
        },
    )
}
