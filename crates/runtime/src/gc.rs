//! The mark-and-sweep collector.
//!
//! Non-moving, non-incremental, triggered lazily by the allocator when
//! `bytes_allocated > next_gc`. `GcHeap` owns the object chain and the
//! temp-root stack; every other root (the
//! VM's builtin closures and primitive classes, the module cache, the
//! handle list, the current compiler, the current fiber and the fibers
//! reachable through its `caller` chain) lives in `pocket-vm` and
//! `pocket-compiler`, so `collect` takes those as an explicit root slice
//! rather than reaching for them itself.

use std::ptr::NonNull;

use crate::heap::{GcBox, HeapObject};
use crate::value::Value;

pub struct GcHeap {
    head: Option<NonNull<GcBox>>,
    bytes_allocated: usize,
    next_gc: usize,
    min_heap_size: usize,
    heap_fill_percent: usize,
    temp_roots: Vec<Value>,
    gray: Vec<NonNull<GcBox>>,
}

impl GcHeap {
    pub fn new() -> Self {
        let min_heap_size = 1 << 20;
        GcHeap {
            head: None,
            bytes_allocated: 0,
            next_gc: min_heap_size,
            min_heap_size,
            heap_fill_percent: 75,
            temp_roots: Vec::new(),
            gray: Vec::new(),
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Walks the object chain for `ptr`'s presence. O(n) in live heap size —
    /// meant for the rare post-collection finalization sweep a host's
    /// native-instance free callback needs, not the hot allocation path.
    pub fn contains(&self, ptr: NonNull<GcBox>) -> bool {
        let mut current = self.head;
        while let Some(p) = current {
            if p == ptr {
                return true;
            }
            current = unsafe { p.as_ref().next.get() };
        }
        false
    }

    /// Allocates `data`, links it into the object chain, and counts its
    /// size toward the next collection threshold. Does not collect itself
    /// — callers check `should_collect()` and call `collect` at a point
    /// where their own roots (e.g. a value under construction) are safe to
    /// expose: construction should order its fields before any further
    /// allocation that could trigger a collection.
    pub fn alloc(&mut self, data: HeapObject) -> NonNull<GcBox> {
        let size = data.approx_size();
        let boxed = GcBox::new(data);
        let ptr = NonNull::from(Box::leak(boxed));
        unsafe {
            ptr.as_ref().next.set(self.head);
        }
        self.head = Some(ptr);
        self.bytes_allocated += size;
        ptr
    }

    pub fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp_root(&mut self) {
        self.temp_roots.pop();
    }

    fn mark_value(&mut self, value: Value) {
        if let Some(ptr) = value.as_object() {
            self.mark_object(ptr);
        }
    }

    fn mark_object(&mut self, ptr: NonNull<GcBox>) {
        let already_marked = unsafe { ptr.as_ref().is_marked() };
        if !already_marked {
            unsafe { ptr.as_ref().mark() };
            self.gray.push(ptr);
        }
    }

    /// Runs a full collection cycle. `external_roots` is every GC root
    /// this module doesn't itself own (see module doc).
    pub fn collect(&mut self, external_roots: &[NonNull<GcBox>]) {
        // 1. Reset, to be recounted during trace.
        self.bytes_allocated = 0;
        self.gray.clear();

        // 2. Mark roots.
        let temp_roots = std::mem::take(&mut self.temp_roots);
        for &v in &temp_roots {
            self.mark_value(v);
        }
        self.temp_roots = temp_roots;
        for &ptr in external_roots {
            self.mark_object(ptr);
        }

        // 3. Trace.
        while let Some(ptr) = self.gray.pop() {
            let data = unsafe { &ptr.as_ref().data };
            self.bytes_allocated += data.approx_size();
            for child in trace_children(data) {
                self.mark_object(child);
            }
        }

        // 4. Sweep.
        self.sweep();

        // 5. Resize threshold.
        let grown = self.bytes_allocated + self.bytes_allocated * self.heap_fill_percent / 100;
        self.next_gc = grown.max(self.min_heap_size);
    }

    fn sweep(&mut self) {
        let mut prev: Option<NonNull<GcBox>> = None;
        let mut current = self.head;
        while let Some(ptr) = current {
            let next = unsafe { ptr.as_ref().next.get() };
            if unsafe { ptr.as_ref().is_marked() } {
                unsafe { ptr.as_ref().unmark() };
                prev = Some(ptr);
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref().next.set(next) },
                    None => self.head = next,
                }
                // SAFETY: this object is unreachable from any marked root
                // (it was never pushed to `gray`), so freeing it now is
                // sound; the GC is the sole destructor path.
                unsafe {
                    drop(Box::from_raw(ptr.as_ptr()));
                }
            }
            current = next;
        }
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

fn trace_children(data: &HeapObject) -> Vec<NonNull<GcBox>> {
    let mut out = Vec::new();
    match data {
        HeapObject::String(_) | HeapObject::Range(_) => {}
        HeapObject::List(list) => {
            for v in list.borrow().iter() {
                if let Some(p) = v.as_object() {
                    out.push(p);
                }
            }
        }
        HeapObject::Map(map) => {
            for (k, v) in map.borrow().iter() {
                if let Some(p) = k.as_object() {
                    out.push(p);
                }
                if let Some(p) = v.as_object() {
                    out.push(p);
                }
            }
        }
        HeapObject::Module(module) => {
            let module = module.borrow();
            for &c in &module.constants {
                if let Some(p) = c.as_object() {
                    out.push(p);
                }
            }
            for &g in &module.globals {
                if let Some(p) = g.as_object() {
                    out.push(p);
                }
            }
            if let Some(body) = module.body {
                out.push(body);
            }
        }
        HeapObject::Function(function) => {
            out.push(function.module);
        }
        HeapObject::Closure(closure) => {
            let closure = closure.borrow();
            out.push(closure.function);
            out.extend(closure.upvalues.iter().copied());
        }
        HeapObject::Upvalue(upvalue) => {
            if !upvalue.borrow().is_open() {
                if let Some(p) = upvalue.borrow().get().as_object() {
                    out.push(p);
                }
            }
        }
        HeapObject::Fiber(fiber) => {
            let fiber = fiber.borrow();
            for &v in fiber.stack.iter().take(fiber.sp) {
                if let Some(p) = v.as_object() {
                    out.push(p);
                }
            }
            for frame in &fiber.frames {
                out.push(frame.closure);
                if let Some(p) = frame.self_value.as_object() {
                    out.push(p);
                }
            }
            out.extend(fiber.open_upvalues.iter().copied());
            out.push(fiber.base_closure);
            if let Some(caller) = fiber.caller {
                out.push(caller);
            }
        }
        HeapObject::Class(class) => {
            let class = class.borrow();
            out.push(class.module);
            if let Some(ctor) = class.ctor {
                out.push(ctor);
            }
            out.extend(class.methods.iter().map(|(_, c)| *c));
            if let Some(sup) = class.super_class {
                out.push(sup);
            }
        }
        HeapObject::Instance(instance) => {
            if let crate::pk_class::PkInstance::Script { class, fields } = &*instance.borrow() {
                out.push(*class);
                for &f in fields {
                    if let Some(p) = f.as_object() {
                        out.push(p);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_links_into_chain_and_counts_bytes() {
        let mut heap = GcHeap::new();
        let before = heap.bytes_allocated();
        heap.alloc(HeapObject::String(crate::pk_string::PkString::from_str("x")));
        assert!(heap.bytes_allocated() > before);
    }

    #[test]
    fn collect_frees_unreachable_and_keeps_rooted() {
        let mut heap = GcHeap::new();
        let kept = heap.alloc(HeapObject::String(crate::pk_string::PkString::from_str("kept")));
        heap.alloc(HeapObject::String(crate::pk_string::PkString::from_str("garbage")));
        heap.collect(&[kept]);
        // The kept pointer is still valid and still points at "kept".
        let data = unsafe { &kept.as_ref().data };
        match data {
            HeapObject::String(s) => assert_eq!(s.as_str_lossy(), "kept"),
            _ => panic!("expected a string"),
        }
    }
}
