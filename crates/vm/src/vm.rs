//! The fetch-decode-execute loop, module/import bookkeeping, and the
//! host-facing `run*` entry points.
//!
//! One `Vm` owns one `GcHeap` and drives exactly one fiber at a time
//! (`current_fiber`); `Fiber.run`/`Fiber.resume`/`yield` just retarget
//! which fiber that is. A runtime error anywhere aborts the whole call —
//! PocketLang doesn't let a script catch one, so there's no unwinding
//! discipline to preserve for a fiber suspended further up the `caller`
//! chain.

use std::cell::RefCell;
use std::ptr::NonNull;

use pocket_compiler::{read_u16, CompileOutcome, Op};
use pocket_runtime::{
    fiber_cell, module_cell, CallFrame, FiberState, GcBox, GcHeap, HeapObject, MapError, PkClass,
    PkClosure, PkFiber, PkFunction, PkInstance, PkList, PkMap, PkModule, PkRange, PkString, PkUpvalue,
    Value,
};

use crate::builtins::{self, Builtins};
use crate::config::HostConfig;
use crate::error::{RunOutcome, VmFault};
use crate::handle::{Handle, HandleTable};

/// Display name for `type_name` and error messages — primitives first,
/// then whatever `HeapKind::name` already knows for heap objects.
pub(crate) fn primitive_type_name(v: Value) -> &'static str {
    if v.is_null() {
        "Null"
    } else if v.is_undefined() {
        "Undefined"
    } else if v.is_void() {
        "Void"
    } else if v.is_bool() {
        "Bool"
    } else if v.is_number() {
        "Number"
    } else {
        v.heap_kind().expect("non-primitive value must be an object").name()
    }
}

/// Marks a frame whose eventual `Return` must deliver a value other than
/// its own: constructors return the instance, not the ctor body's return
/// expression, and a first-time `import` returns the module object, not
/// whatever its top-level code evaluates to.
struct ReturnOverride {
    fiber: NonNull<GcBox>,
    depth: usize,
    value: Value,
}

pub struct Vm {
    gc: GcHeap,
    host: HostConfig,
    handles: HandleTable,
    builtin_module: NonNull<GcBox>,
    builtins: Builtins,
    modules: Vec<(String, NonNull<GcBox>)>,
    current_fiber: Option<NonNull<GcBox>>,
    overrides: Vec<ReturnOverride>,
    native_instances: Vec<(NonNull<GcBox>, *mut std::os::raw::c_void, u32)>,
    repl_buffer: String,
}

/// # Safety
/// `ptr` must point at a live `GcBox` whose data is `HeapObject::Class`.
unsafe fn class_cell(ptr: NonNull<GcBox>) -> &'static RefCell<PkClass> {
    match &ptr.as_ref().data {
        HeapObject::Class(cell) => cell,
        _ => panic!("class_cell called on a non-Class GcBox"),
    }
}

/// # Safety
/// `ptr` must point at a live `GcBox` whose data is `HeapObject::Instance`.
unsafe fn instance_cell(ptr: NonNull<GcBox>) -> &'static RefCell<PkInstance> {
    match &ptr.as_ref().data {
        HeapObject::Instance(cell) => cell,
        _ => panic!("instance_cell called on a non-Instance GcBox"),
    }
}

/// # Safety
/// `ptr` must point at a live `GcBox` whose data is `HeapObject::Closure`.
unsafe fn closure_cell(ptr: NonNull<GcBox>) -> &'static RefCell<PkClosure> {
    match &ptr.as_ref().data {
        HeapObject::Closure(cell) => cell,
        _ => panic!("closure_cell called on a non-Closure GcBox"),
    }
}

/// # Safety
/// `ptr` must point at a live `GcBox` whose data is `HeapObject::Upvalue`.
unsafe fn upvalue_cell(ptr: NonNull<GcBox>) -> &'static RefCell<PkUpvalue> {
    match &ptr.as_ref().data {
        HeapObject::Upvalue(cell) => cell,
        _ => panic!("upvalue_cell called on a non-Upvalue GcBox"),
    }
}

/// # Safety
/// `ptr` must point at a live `GcBox` whose data is `HeapObject::Function`.
unsafe fn function_ref(ptr: NonNull<GcBox>) -> &'static PkFunction {
    match &ptr.as_ref().data {
        HeapObject::Function(f) => f,
        _ => panic!("function_ref called on a non-Function GcBox"),
    }
}

/// Outcome of executing a single opcode: either keep looping, or the
/// whole run is over (value delivered to nothing, or a runtime error).
enum Step {
    Continue,
    Finished(Value),
    Error(String),
}

impl Vm {
    #[tracing::instrument(name = "new_vm", skip_all)]
    pub fn new(host: HostConfig) -> Self {
        let mut gc = GcHeap::new();
        let (builtin_module, builtins) = builtins::install(&mut gc);
        tracing::debug!("built-in name table installed");
        Vm {
            gc,
            host,
            handles: HandleTable::new(),
            builtin_module,
            builtins,
            modules: Vec::new(),
            current_fiber: None,
            overrides: Vec::new(),
            native_instances: Vec::new(),
            repl_buffer: String::new(),
        }
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn handles_mut(&mut self) -> &mut HandleTable {
        &mut self.handles
    }

    pub fn release_handle(&mut self, handle: Handle) {
        self.handles.release(handle);
    }

    // ---- GC --------------------------------------------------------------

    fn gc_roots(&self) -> Vec<NonNull<GcBox>> {
        let mut roots = Vec::new();
        roots.push(self.builtin_module);
        for (_, v) in &self.builtins.names {
            if let Some(p) = v.as_object() {
                roots.push(p);
            }
        }
        for &(_, ptr) in &self.modules {
            roots.push(ptr);
        }
        roots.extend(self.handles.roots());
        let mut fiber = self.current_fiber;
        while let Some(ptr) = fiber {
            roots.push(ptr);
            fiber = unsafe { fiber_cell(ptr) }.borrow().caller;
        }
        for (ptr, _, _) in &self.native_instances {
            roots.push(*ptr);
        }
        roots
    }

    fn maybe_collect(&mut self) {
        if self.gc.should_collect() {
            self.gc_collect();
        }
    }

    #[tracing::instrument(name = "gc_collect", skip_all, fields(bytes_before = self.gc.bytes_allocated()))]
    fn gc_collect(&mut self) {
        let roots = self.gc_roots();
        self.gc.collect(&roots);
        self.finalize_native_instances();
        tracing::trace!(bytes_after = self.gc.bytes_allocated(), "collection complete");
    }

    /// Calls the host's `inst_free_fn` for every native instance the last
    /// collection swept, diffing by `GcHeap::contains`.
    fn finalize_native_instances(&mut self) {
        let gc = &self.gc;
        let host = &mut self.host;
        self.native_instances.retain(|&(ptr, data, id)| {
            let alive = gc.contains(ptr);
            if !alive {
                if let Some(f) = &mut host.inst_free_fn {
                    f(data, id);
                }
            }
            alive
        });
    }

    // ---- module/import bookkeeping ---------------------------------------

    #[tracing::instrument(skip(self))]
    fn resolve_path(&mut self, from_path: &str, target: &str) -> Option<String> {
        let resolved = match &mut self.host.resolve_path_fn {
            Some(f) => f(from_path, target),
            None => None,
        };
        tracing::trace!(?resolved, "import path resolution");
        resolved
    }

    fn load_script(&mut self, path: &str) -> Option<String> {
        match &mut self.host.load_script_fn {
            Some(f) => f(path),
            None => None,
        }
    }

    fn cached_module(&self, canonical_path: &str) -> Option<NonNull<GcBox>> {
        self.modules.iter().find(|(p, _)| p == canonical_path).map(|(_, ptr)| *ptr)
    }

    // ---- host entry points -------------------------------------------------

    #[tracing::instrument(skip(self, source), fields(bytes = source.len()))]
    pub fn run_string(&mut self, source: &str, module_name: &str, module_path: &str) -> RunOutcome {
        let mut gc = std::mem::replace(&mut self.gc, GcHeap::new());
        let (module_ptr, outcome) = pocket_compiler::compile_module(source, module_name, module_path, &mut gc, self);
        self.gc = gc;
        match outcome {
            CompileOutcome::Success => {}
            CompileOutcome::UnexpectedEof => return RunOutcome::UnexpectedEof,
            CompileOutcome::CompileError(errs) => {
                tracing::debug!(count = errs.len(), "compile failed");
                return RunOutcome::CompileError(errs);
            }
        }
        let outcome = self.run_module(module_ptr);
        if let RunOutcome::RuntimeError(message) = &outcome {
            tracing::debug!(%message, "run ended with a scripted runtime error");
        }
        outcome
    }

    pub fn run_file(&mut self, path: &str) -> RunOutcome {
        let Some(source) = std::fs::read_to_string(path).ok() else {
            return RunOutcome::RuntimeError(format!("cannot read file '{path}'"));
        };
        self.run_string(&source, path, path)
    }

    /// Buffers `line` and attempts to compile+run; an `UnexpectedEof`
    /// result means the caller should read another line and call again
    /// with the buffer un-reset (the buffer itself stays accumulated by
    /// this method, not the caller).
    pub fn run_repl_line(&mut self, line: &str) -> RunOutcome {
        self.repl_buffer.push_str(line);
        self.repl_buffer.push('\n');
        let mut gc = std::mem::replace(&mut self.gc, GcHeap::new());
        let source = self.repl_buffer.clone();
        let (module_ptr, outcome) = pocket_compiler::compile_module(&source, "repl", "<repl>", &mut gc, self);
        self.gc = gc;
        match outcome {
            CompileOutcome::UnexpectedEof => RunOutcome::UnexpectedEof,
            CompileOutcome::CompileError(errs) => {
                self.repl_buffer.clear();
                RunOutcome::CompileError(errs)
            }
            CompileOutcome::Success => {
                self.repl_buffer.clear();
                self.run_module(module_ptr)
            }
        }
    }

    /// Drives a blocking read-eval-print loop off the host's
    /// `stdin_read`/`stdout_write` callbacks until end of input.
    pub fn run_repl(&mut self) {
        loop {
            let Some(line) = self.host.read_line() else { return };
            match self.run_repl_line(&line) {
                RunOutcome::UnexpectedEof => continue,
                RunOutcome::CompileError(errs) => {
                    for e in errs {
                        self.host.write_stderr(&format!("{e}\n"));
                    }
                }
                RunOutcome::RuntimeError(msg) => {
                    self.host.write_stderr(&format!("{msg}\n"));
                }
                RunOutcome::Success => {}
            }
        }
    }

    fn run_module(&mut self, module_ptr: NonNull<GcBox>) -> RunOutcome {
        let body = unsafe { module_cell(module_ptr) }.borrow().body;
        let Some(body) = body else {
            return RunOutcome::Success;
        };
        unsafe { module_cell(module_ptr) }.borrow_mut().mark_initializing();
        let fiber_ptr = self.gc.alloc(HeapObject::Fiber(RefCell::new(PkFiber::new(body))));
        {
            let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
            fiber.grow(1);
            fiber.sp = 1;
            fiber.state = FiberState::Running;
            fiber.frames.push(CallFrame { ip: 0, closure: body, rbp: 0, self_value: Value::null() });
        }
        self.current_fiber = Some(fiber_ptr);
        self.run_loop()
    }

    // ---- fiber/stack helpers ------------------------------------------------

    fn push_script_frame(
        &mut self,
        fiber_ptr: NonNull<GcBox>,
        closure_ptr: NonNull<GcBox>,
        rbp: usize,
        argc: usize,
        self_value: Value,
    ) {
        let function_ptr = unsafe { closure_cell(closure_ptr) }.borrow().function;
        let stack_size = match &unsafe { function_ref(function_ptr) }.body {
            pocket_runtime::FunctionBody::Script(s) => s.stack_size as usize,
            pocket_runtime::FunctionBody::Native { .. } => {
                unreachable!("push_script_frame called with a native function")
            }
        };
        let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
        fiber.grow(rbp + 1 + stack_size);
        for slot in argc..stack_size {
            fiber.stack_set(rbp + 1 + slot, Value::null());
        }
        fiber.sp = rbp + 1 + stack_size;
        fiber.frames.push(CallFrame { ip: 0, closure: closure_ptr, rbp, self_value });
    }

    // ---- the dispatch loop --------------------------------------------------

    fn run_loop(&mut self) -> RunOutcome {
        loop {
            let Some(fiber_ptr) = self.current_fiber else {
                return RunOutcome::Success;
            };
            match self.step(fiber_ptr) {
                Step::Continue => continue,
                Step::Finished(_) => return RunOutcome::Success,
                Step::Error(message) => return RunOutcome::RuntimeError(message),
            }
        }
    }

    fn step(&mut self, fiber_ptr: NonNull<GcBox>) -> Step {
        self.maybe_collect();

        let (closure_ptr, ip, rbp) = {
            let fiber = unsafe { fiber_cell(fiber_ptr) }.borrow();
            let frame = fiber.frames.last().expect("a running fiber always has a frame");
            (frame.closure, frame.ip, frame.rbp)
        };
        let function_ptr = unsafe { closure_cell(closure_ptr) }.borrow().function;
        let function = unsafe { function_ref(function_ptr) };
        let module_ptr = function.module;
        let code: &'static [u8] = match &function.body {
            pocket_runtime::FunctionBody::Script(s) => unsafe {
                std::slice::from_raw_parts(s.code.as_ptr(), s.code.len())
            },
            pocket_runtime::FunctionBody::Native { .. } => {
                unreachable!("a native function never has its own frame")
            }
        };

        let Some(op) = Op::from_u8(code[ip]) else {
            return Step::Error(format!("corrupt bytecode: invalid opcode {}", code[ip]));
        };

        macro_rules! set_frame_ip {
            ($new_ip:expr) => {{
                let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                fiber.frames.last_mut().expect("frame still present").ip = $new_ip;
            }};
        }
        macro_rules! push {
            ($v:expr) => {
                unsafe { fiber_cell(fiber_ptr) }.borrow_mut().push($v)
            };
        }
        macro_rules! pop {
            () => {
                unsafe { fiber_cell(fiber_ptr) }.borrow_mut().pop()
            };
        }
        macro_rules! peek {
            ($from_top:expr) => {{
                let fiber = unsafe { fiber_cell(fiber_ptr) }.borrow();
                fiber.stack_get(fiber.sp - 1 - $from_top)
            }};
        }
        macro_rules! sp {
            () => {
                unsafe { fiber_cell(fiber_ptr) }.borrow().sp
            };
        }
        macro_rules! runtime_error {
            ($msg:expr) => {
                return Step::Error($msg)
            };
        }

        let u16_operand = |at: usize| read_u16(code, at);
        let next_ip = ip + 1 + op.operand_len();

        match op {
            // ---- 1. push literals ------------------------------------------
            Op::Const => {
                let idx = u16_operand(ip + 1);
                let v = unsafe { module_cell(module_ptr) }.borrow().constant_at(idx as u32);
                push!(v);
                set_frame_ip!(next_ip);
            }
            Op::PushNull => {
                push!(Value::null());
                set_frame_ip!(next_ip);
            }
            Op::PushZero => {
                push!(Value::int(0));
                set_frame_ip!(next_ip);
            }
            Op::PushTrue => {
                push!(Value::bool(true));
                set_frame_ip!(next_ip);
            }
            Op::PushFalse => {
                push!(Value::bool(false));
                set_frame_ip!(next_ip);
            }
            Op::PushEmptyList => {
                let hint = u16_operand(ip + 1) as usize;
                let ptr = self.gc.alloc(HeapObject::List(RefCell::new(PkList::with_capacity(hint))));
                push!(Value::object(ptr));
                set_frame_ip!(next_ip);
            }
            Op::PushEmptyMap => {
                let ptr = self.gc.alloc(HeapObject::Map(RefCell::new(PkMap::new())));
                push!(Value::object(ptr));
                set_frame_ip!(next_ip);
            }
            Op::PushSelf => {
                let fiber = unsafe { fiber_cell(fiber_ptr) }.borrow();
                let self_value = fiber.frames.last().unwrap().self_value;
                drop(fiber);
                push!(self_value);
                set_frame_ip!(next_ip);
            }

            // ---- 2. locals / globals / upvalues ----------------------------
            Op::PushLocal0 | Op::PushLocal1 | Op::PushLocal2 | Op::PushLocal3 | Op::PushLocal4
            | Op::PushLocal5 | Op::PushLocal6 | Op::PushLocal7 | Op::PushLocal8 => {
                let slot = op as u8 - Op::PushLocal0 as u8;
                let v = unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(rbp + 1 + slot as usize);
                push!(v);
                set_frame_ip!(next_ip);
            }
            Op::PushLocal => {
                let slot = code[ip + 1];
                let v = unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(rbp + 1 + slot as usize);
                push!(v);
                set_frame_ip!(next_ip);
            }
            Op::StoreLocal => {
                let slot = code[ip + 1];
                let v = peek!(0);
                unsafe { fiber_cell(fiber_ptr) }.borrow_mut().stack_set(rbp + 1 + slot as usize, v);
                set_frame_ip!(next_ip);
            }
            Op::PushUpvalue => {
                let idx = code[ip + 1] as usize;
                let up_ptr = unsafe { closure_cell(closure_ptr) }.borrow().upvalues[idx];
                let v = unsafe { upvalue_cell(up_ptr) }.borrow().get();
                push!(v);
                set_frame_ip!(next_ip);
            }
            Op::StoreUpvalue => {
                let idx = code[ip + 1] as usize;
                let up_ptr = unsafe { closure_cell(closure_ptr) }.borrow().upvalues[idx];
                let v = peek!(0);
                unsafe { upvalue_cell(up_ptr) }.borrow_mut().set(v);
                set_frame_ip!(next_ip);
            }
            Op::PushGlobal => {
                let idx = u16_operand(ip + 1) as u32;
                let module = unsafe { module_cell(module_ptr) }.borrow();
                let found = module.global_names.iter().position(|&n| n == idx).map(|pos| module.globals[pos]);
                match found {
                    Some(v) => {
                        drop(module);
                        push!(v);
                    }
                    None => {
                        let name = module.name_at(idx).to_string();
                        drop(module);
                        match self.builtins.names.iter().find(|(n, _)| *n == name) {
                            Some((_, v)) => {
                                let v = *v;
                                push!(v);
                            }
                            None => runtime_error!(format!("undefined name '{name}'")),
                        }
                    }
                }
                set_frame_ip!(next_ip);
            }
            Op::StoreGlobal => {
                let idx = u16_operand(ip + 1) as u32;
                let v = peek!(0);
                unsafe { module_cell(module_ptr) }.borrow_mut().define_global(idx, v);
                set_frame_ip!(next_ip);
            }

            // ---- 3. closure build -------------------------------------------
            Op::PushClosure => {
                let const_idx = u16_operand(ip + 1) as u32;
                let upvalue_count = code[ip + 3] as usize;
                let fn_ptr = unsafe { module_cell(module_ptr) }.borrow().constant_at(const_idx).as_object().unwrap();
                let mut upvalues = Vec::with_capacity(upvalue_count);
                for i in 0..upvalue_count {
                    let is_immediate = code[ip + 4 + i * 2] != 0;
                    let index = code[ip + 5 + i * 2] as usize;
                    let up_ptr = if is_immediate {
                        let gc = &mut self.gc;
                        unsafe { fiber_cell(fiber_ptr) }.borrow_mut().find_or_open_upvalue(fiber_ptr, rbp + 1 + index, |upv| {
                            gc.alloc(HeapObject::Upvalue(RefCell::new(upv)))
                        })
                    } else {
                        unsafe { closure_cell(closure_ptr) }.borrow().upvalues[index]
                    };
                    upvalues.push(up_ptr);
                }
                let closure = PkClosure::new(fn_ptr, upvalues);
                let ptr = self.gc.alloc(HeapObject::Closure(RefCell::new(closure)));
                push!(Value::object(ptr));
                set_frame_ip!(ip + 4 + upvalue_count * 2);
            }

            // ---- 4. class build ----------------------------------------------
            Op::CreateClass => {
                let name_idx = u16_operand(ip + 1) as u32;
                let base = pop!();
                let super_class = if base.is_null() {
                    Some(self.builtins.classes.object)
                } else {
                    match base.as_object().filter(|p| unsafe { p.as_ref().kind() } == pocket_runtime::HeapKind::Class) {
                        Some(p) => Some(p),
                        None => runtime_error!("base class must be a Class".to_string()),
                    }
                };
                let class = PkClass::new(module_ptr, name_idx, super_class);
                let ptr = self.gc.alloc(HeapObject::Class(RefCell::new(class)));
                push!(Value::object(ptr));
                set_frame_ip!(next_ip);
            }
            Op::BindMethod => {
                let method_idx = u16_operand(ip + 1) as u32;
                let closure_v = pop!();
                let class_v = peek!(0);
                let Some(closure_obj) = closure_v.as_object() else {
                    runtime_error!("method body must be a closure".to_string());
                };
                let class_ptr = class_v.as_object().expect("class must be on stack below its methods");
                let ctor_idx = unsafe { module_cell(module_ptr) }.borrow_mut().intern_name("_init");
                unsafe { class_cell(class_ptr) }.borrow_mut().bind_method(method_idx, closure_obj, ctor_idx);
                set_frame_ip!(next_ip);
            }

            // ---- 5. calls -----------------------------------------------------
            Op::Call => {
                let argc = code[ip + 1] as usize;
                let callable_slot = sp!() - argc - 1;
                set_frame_ip!(next_ip);
                if let Err(msg) = self.invoke(fiber_ptr, callable_slot, argc, false, None) {
                    runtime_error!(msg);
                }
            }
            Op::TailCall => {
                let argc = code[ip + 1] as usize;
                let callable_slot = sp!() - argc - 1;
                if let Err(msg) = self.invoke(fiber_ptr, callable_slot, argc, true, None) {
                    runtime_error!(msg);
                }
            }
            Op::MethodCall => {
                let argc = code[ip + 1] as usize;
                let name_idx = u16_operand(ip + 2) as u32;
                let receiver_slot = sp!() - argc - 1;
                set_frame_ip!(next_ip);
                if let Err(msg) = self.invoke(fiber_ptr, receiver_slot, argc, false, Some(name_idx)) {
                    runtime_error!(msg);
                }
            }

            // ---- 6. return ------------------------------------------------
            Op::Return => {
                let return_value = pop!();
                let popped_rbp = {
                    let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                    let frame = fiber.frames.pop().expect("return with no active frame");
                    fiber.close_upvalues_from(frame.rbp + 1);
                    frame.rbp
                };
                let depth_before_pop = unsafe { fiber_cell(fiber_ptr) }.borrow().frames.len() + 1;
                let override_idx = self
                    .overrides
                    .iter()
                    .position(|o| o.fiber == fiber_ptr && o.depth == depth_before_pop);
                let final_value = match override_idx {
                    Some(i) => self.overrides.remove(i).value,
                    None => return_value,
                };
                let frames_left = unsafe { fiber_cell(fiber_ptr) }.borrow().frames.len();
                if frames_left > 0 {
                    let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                    fiber.stack_set(popped_rbp, final_value);
                    fiber.sp = popped_rbp + 1;
                } else {
                    return self.finish_fiber(fiber_ptr, final_value);
                }
            }

            // ---- 7. iteration ------------------------------------------------
            Op::IterTest => {
                let seq_slot = code[ip + 1] as usize;
                let v = unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(rbp + 1 + seq_slot);
                match v.heap_kind() {
                    Some(pocket_runtime::HeapKind::List) | Some(pocket_runtime::HeapKind::Range) => {}
                    _ => runtime_error!(format!("{} is not iterable", primitive_type_name(v))),
                }
                set_frame_ip!(next_ip);
            }
            Op::Iter => {
                let seq_slot = code[ip + 1] as usize;
                let iter_slot = code[ip + 2] as usize;
                let value_slot = code[ip + 3] as usize;
                let jump = read_u16(code, ip + 4);
                let after_operand = next_ip;
                let (seq, counter) = {
                    let fiber = unsafe { fiber_cell(fiber_ptr) }.borrow();
                    (fiber.stack_get(rbp + 1 + seq_slot), fiber.stack_get(rbp + 1 + iter_slot))
                };
                let counter = counter.as_int().expect("iterator counter must be an int") as usize;
                let step_result = match seq.heap_kind().unwrap() {
                    pocket_runtime::HeapKind::List => {
                        let list = seq.as_list().unwrap().borrow();
                        if counter >= list.len() {
                            None
                        } else {
                            Some(list.get(counter).unwrap())
                        }
                    }
                    pocket_runtime::HeapKind::Range => {
                        let r = seq.as_range().unwrap();
                        let step = if r.from <= r.to { 1.0 } else { -1.0 };
                        let value = r.from + counter as f64 * step;
                        let done = if step > 0.0 { value >= r.to } else { value <= r.to };
                        if done { None } else { Some(Value::int(value as i32)) }
                    }
                    _ => runtime_error!(format!("{} is not iterable", primitive_type_name(seq))),
                };
                match step_result {
                    None => set_frame_ip!(after_operand + jump as usize),
                    Some(value) => {
                        let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                        fiber.stack_set(rbp + 1 + value_slot, value);
                        fiber.stack_set(rbp + 1 + iter_slot, Value::int(counter as i32 + 1));
                        drop(fiber);
                        set_frame_ip!(after_operand);
                    }
                }
            }

            // ---- 8. branching --------------------------------------------
            Op::Jump => {
                let offset = u16_operand(ip + 1);
                set_frame_ip!(next_ip + offset as usize);
            }
            Op::JumpIf => {
                let offset = u16_operand(ip + 1);
                let v = pop!();
                set_frame_ip!(if v.to_bool() { next_ip + offset as usize } else { next_ip });
            }
            Op::JumpIfNot => {
                let offset = u16_operand(ip + 1);
                let v = pop!();
                set_frame_ip!(if !v.to_bool() { next_ip + offset as usize } else { next_ip });
            }
            Op::Loop => {
                let offset = u16_operand(ip + 1);
                set_frame_ip!(next_ip - offset as usize);
            }
            Op::And => {
                let offset = u16_operand(ip + 1);
                let v = peek!(0);
                if v.to_bool() {
                    pop!();
                    set_frame_ip!(next_ip);
                } else {
                    set_frame_ip!(next_ip + offset as usize);
                }
            }
            Op::Or => {
                let offset = u16_operand(ip + 1);
                let v = peek!(0);
                if v.to_bool() {
                    set_frame_ip!(next_ip + offset as usize);
                } else {
                    pop!();
                    set_frame_ip!(next_ip);
                }
            }

            // ---- 9. attribute / subscript ----------------------------------
            Op::GetAttrib | Op::GetAttribKeep => {
                let name_idx = u16_operand(ip + 1) as u32;
                let name = unsafe { module_cell(module_ptr) }.borrow().name_at(name_idx).to_string();
                let receiver = if op == Op::GetAttrib { pop!() } else { peek!(0) };
                match self.get_attrib(receiver, &name) {
                    Ok(v) => push!(v),
                    Err(msg) => runtime_error!(msg),
                }
                set_frame_ip!(next_ip);
            }
            Op::SetAttrib => {
                let name_idx = u16_operand(ip + 1) as u32;
                let name = unsafe { module_cell(module_ptr) }.borrow().name_at(name_idx).to_string();
                let value = pop!();
                let receiver = pop!();
                if let Err(msg) = self.set_attrib(receiver, &name, value) {
                    runtime_error!(msg);
                }
                set_frame_ip!(next_ip);
            }
            Op::GetSubscript | Op::GetSubscriptKeep => {
                let key = pop!();
                let receiver = if op == Op::GetSubscript { pop!() } else { peek!(0) };
                match get_subscript(receiver, key) {
                    Ok(v) => push!(v),
                    Err(msg) => runtime_error!(msg),
                }
                set_frame_ip!(next_ip);
            }
            Op::SetSubscript => {
                let value = pop!();
                let key = pop!();
                let receiver = pop!();
                if let Err(msg) = set_subscript(receiver, key, value) {
                    runtime_error!(msg);
                }
                set_frame_ip!(next_ip);
            }

            // ---- 10. arithmetic & bitwise ------------------------------------
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::BitAnd | Op::BitOr | Op::BitXor
            | Op::BitLshift | Op::BitRshift => {
                let b = pop!();
                let a = pop!();
                if op == Op::Add {
                    if let (Some(pocket_runtime::HeapKind::String), Some(pocket_runtime::HeapKind::String)) =
                        (a.heap_kind(), b.heap_kind())
                    {
                        let concatenated = a.as_string().unwrap().concat(b.as_string().unwrap());
                        let ptr = self.gc.alloc(HeapObject::String(concatenated));
                        push!(Value::object(ptr));
                        set_frame_ip!(next_ip);
                        return Step::Continue;
                    }
                    if let (Some(pocket_runtime::HeapKind::List), Some(pocket_runtime::HeapKind::List)) =
                        (a.heap_kind(), b.heap_kind())
                    {
                        let concatenated = a.as_list().unwrap().borrow().concat(&b.as_list().unwrap().borrow());
                        let ptr = self.gc.alloc(HeapObject::List(RefCell::new(concatenated)));
                        push!(Value::object(ptr));
                        set_frame_ip!(next_ip);
                        return Step::Continue;
                    }
                }
                match binary_op(op, a, b) {
                    Ok(v) => push!(v),
                    Err(msg) => runtime_error!(msg),
                }
                set_frame_ip!(next_ip);
            }
            Op::BitNot => {
                let a = pop!();
                match a.as_int() {
                    Some(n) => push!(Value::int(!n)),
                    None => runtime_error!(format!("cannot bitwise-not a {}", primitive_type_name(a))),
                }
                set_frame_ip!(next_ip);
            }
            Op::Negate => {
                let a = pop!();
                if let Some(n) = a.as_int() {
                    if n == i32::MIN {
                        runtime_error!("integer overflow".to_string());
                    }
                    push!(Value::int(-n));
                } else if let Some(f) = a.as_number() {
                    push!(Value::float(-f));
                } else {
                    runtime_error!(format!("cannot negate a {}", primitive_type_name(a)));
                }
                set_frame_ip!(next_ip);
            }
            Op::Not => {
                let a = pop!();
                push!(Value::bool(!a.to_bool()));
                set_frame_ip!(next_ip);
            }

            // ---- 11. comparison --------------------------------------------
            Op::EqEq => {
                let b = pop!();
                let a = pop!();
                push!(Value::bool(a.is_equal(b)));
                set_frame_ip!(next_ip);
            }
            Op::NotEq => {
                let b = pop!();
                let a = pop!();
                push!(Value::bool(!a.is_equal(b)));
                set_frame_ip!(next_ip);
            }
            Op::Lt | Op::LtEq | Op::Gt | Op::GtEq => {
                let b = pop!();
                let a = pop!();
                match compare(op, a, b) {
                    Ok(v) => push!(v),
                    Err(msg) => runtime_error!(msg),
                }
                set_frame_ip!(next_ip);
            }
            Op::In => {
                let container = pop!();
                let needle = pop!();
                match contains(container, needle) {
                    Ok(v) => push!(Value::bool(v)),
                    Err(msg) => runtime_error!(msg),
                }
                set_frame_ip!(next_ip);
            }
            Op::Is => {
                let class_v = pop!();
                let v = pop!();
                match self.is_instance_of(v, class_v) {
                    Ok(b) => push!(Value::bool(b)),
                    Err(msg) => runtime_error!(msg),
                }
                set_frame_ip!(next_ip);
            }
            Op::RangeExcl => {
                let to = pop!();
                let from = pop!();
                match (from.as_number(), to.as_number()) {
                    (Some(f), Some(t)) => {
                        let ptr = self.gc.alloc(HeapObject::Range(PkRange::new(f, t)));
                        push!(Value::object(ptr));
                    }
                    _ => runtime_error!("range endpoints must be numbers".to_string()),
                }
                set_frame_ip!(next_ip);
            }
            Op::RangeIncl => {
                let to = pop!();
                let from = pop!();
                match (from.as_number(), to.as_number()) {
                    (Some(f), Some(t)) => {
                        let ptr = self.gc.alloc(HeapObject::Range(PkRange::new(f, t + 1.0)));
                        push!(Value::object(ptr));
                    }
                    _ => runtime_error!("range endpoints must be numbers".to_string()),
                }
                set_frame_ip!(next_ip);
            }

            // ---- 12. miscellaneous -----------------------------------------
            Op::Pop => {
                pop!();
                set_frame_ip!(next_ip);
            }
            Op::Swap => {
                let a = pop!();
                let b = pop!();
                push!(a);
                push!(b);
                set_frame_ip!(next_ip);
            }
            Op::CloseUpvalue => {
                let threshold = code[ip + 1] as usize;
                unsafe { fiber_cell(fiber_ptr) }.borrow_mut().close_upvalues_from(rbp + 1 + threshold);
                set_frame_ip!(next_ip);
            }
            Op::ReplPrint => {
                let v = pop!();
                if !v.is_null() {
                    let text = v.to_repr_string();
                    self.host.write_stdout(&format!("{text}\n"));
                }
                set_frame_ip!(next_ip);
            }
            Op::End => {
                let v = pop!();
                return self.finish_fiber(fiber_ptr, v);
            }
            Op::Import => {
                let name_idx = u16_operand(ip + 1) as u32;
                let target = unsafe { module_cell(module_ptr) }.borrow().name_at(name_idx).to_string();
                let current_path = unsafe { module_cell(module_ptr) }.borrow().path.clone();
                let Some(canonical) = self.resolve_path(&current_path, &target) else {
                    runtime_error!(format!("cannot resolve import '{target}'"));
                };
                let Some(imported_ptr) = self.cached_module(&canonical) else {
                    runtime_error!(format!("import '{target}' was not compiled"));
                };
                let already_initialized = unsafe { module_cell(imported_ptr) }.borrow().initialized;
                if already_initialized {
                    push!(Value::object(imported_ptr));
                    set_frame_ip!(next_ip);
                } else {
                    unsafe { module_cell(imported_ptr) }.borrow_mut().mark_initializing();
                    let main_closure = unsafe { module_cell(imported_ptr) }.borrow().body;
                    let Some(main_closure) = main_closure else {
                        push!(Value::object(imported_ptr));
                        set_frame_ip!(next_ip);
                        return Step::Continue;
                    };
                    set_frame_ip!(next_ip);
                    let frame_rbp = sp!();
                    self.push_script_frame(fiber_ptr, main_closure, frame_rbp, 0, Value::null());
                    let depth = unsafe { fiber_cell(fiber_ptr) }.borrow().frames.len();
                    self.overrides.push(ReturnOverride {
                        fiber: fiber_ptr,
                        depth,
                        value: Value::object(imported_ptr),
                    });
                }
            }
        }

        Step::Continue
    }

    fn finish_fiber(&mut self, fiber_ptr: NonNull<GcBox>, value: Value) -> Step {
        let caller = {
            let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
            fiber.state = FiberState::Done;
            fiber.caller.take()
        };
        match caller {
            Some(caller_ptr) => {
                unsafe { fiber_cell(caller_ptr) }.borrow_mut().push(value);
                self.current_fiber = Some(caller_ptr);
                Step::Continue
            }
            None => {
                self.current_fiber = None;
                Step::Finished(value)
            }
        }
    }

    // ---- attribute / subscript dispatch --------------------------------------

    fn get_attrib(&mut self, receiver: Value, name: &str) -> Result<Value, String> {
        if name == "done" {
            if let Some(ptr) = receiver.as_object() {
                if unsafe { ptr.as_ref().kind() } == pocket_runtime::HeapKind::Fiber {
                    let done = unsafe { fiber_cell(ptr) }.borrow().state == FiberState::Done;
                    return Ok(Value::bool(done));
                }
            }
        }
        match receiver.heap_kind() {
            Some(pocket_runtime::HeapKind::Module) => {
                let ptr = receiver.as_object().unwrap();
                unsafe { module_cell(ptr) }
                    .borrow()
                    .resolve_global(name)
                    .ok_or_else(|| format!("module has no attribute '{name}'"))
            }
            Some(pocket_runtime::HeapKind::Range) => {
                let r = receiver.as_range().unwrap();
                match name {
                    "first" => Ok(Value::int(r.first() as i32)),
                    "last" => Ok(Value::int(r.last() as i32)),
                    _ => Err(format!("Range has no attribute '{name}'")),
                }
            }
            Some(pocket_runtime::HeapKind::Instance) => {
                let ptr = receiver.as_object().unwrap();
                let instance = unsafe { instance_cell(ptr) }.borrow();
                match &*instance {
                    PkInstance::Script { class, fields } => {
                        let name_idx = unsafe { module_cell(unsafe { class_cell(*class) }.borrow().module) }
                            .borrow_mut()
                            .intern_name(name);
                        let idx = unsafe { class_cell(*class) }.borrow().field_index(name_idx);
                        match idx {
                            Some(i) => Ok(fields[i]),
                            None => Err(format!("Instance has no attribute '{name}'")),
                        }
                    }
                    PkInstance::Native { ptr: native_ptr, native_id } => {
                        let native_ptr = *native_ptr;
                        let native_id = *native_id;
                        drop(instance);
                        match &mut self.host.inst_get_attrib_fn {
                            Some(f) => f(native_ptr, native_id, name).ok_or_else(|| format!("native instance has no attribute '{name}'")),
                            None => Err("host does not support native-instance attributes".to_string()),
                        }
                    }
                }
            }
            _ => Err(format!("{} has no attribute '{name}'", primitive_type_name(receiver))),
        }
    }

    fn set_attrib(&mut self, receiver: Value, name: &str, value: Value) -> Result<(), String> {
        match receiver.heap_kind() {
            Some(pocket_runtime::HeapKind::Instance) => {
                let ptr = receiver.as_object().unwrap();
                let is_native = unsafe { instance_cell(ptr) }.borrow().is_native();
                if is_native {
                    let (native_ptr, native_id) = match &*unsafe { instance_cell(ptr) }.borrow() {
                        PkInstance::Native { ptr, native_id } => (*ptr, *native_id),
                        _ => unreachable!(),
                    };
                    return match &mut self.host.inst_set_attrib_fn {
                        Some(f) => {
                            if f(native_ptr, native_id, name, value) {
                                Ok(())
                            } else {
                                Err(format!("native instance rejected attribute '{name}'"))
                            }
                        }
                        None => Err("host does not support native-instance attributes".to_string()),
                    };
                }
                let mut instance = unsafe { instance_cell(ptr) }.borrow_mut();
                let PkInstance::Script { class, fields } = &mut *instance else {
                    unreachable!("native case handled above");
                };
                let module_of_class = unsafe { class_cell(*class) }.borrow().module;
                let name_idx = unsafe { module_cell(module_of_class) }.borrow_mut().intern_name(name);
                let idx = unsafe { class_cell(*class) }.borrow_mut().declare_field(name_idx);
                if idx >= fields.len() {
                    fields.resize(idx + 1, Value::null());
                }
                fields[idx] = value;
                Ok(())
            }
            _ => Err(format!("cannot set attribute '{name}' on a {}", primitive_type_name(receiver))),
        }
    }

    fn is_instance_of(&self, v: Value, class_v: Value) -> Result<bool, String> {
        let Some(target_class) = class_v.as_object().filter(|p| unsafe { p.as_ref().kind() } == pocket_runtime::HeapKind::Class) else {
            return Err("right-hand side of 'is' must be a Class".to_string());
        };
        let starting_class = match v.heap_kind() {
            Some(pocket_runtime::HeapKind::Instance) => {
                let ptr = v.as_object().unwrap();
                match &*unsafe { instance_cell(ptr) }.borrow() {
                    PkInstance::Script { class, .. } => Some(*class),
                    PkInstance::Native { .. } => None,
                }
            }
            Some(kind) => Some(primitive_class_for(&self.builtins, kind)),
            None => {
                if v.is_null() {
                    Some(self.builtins.classes.null)
                } else if v.is_bool() {
                    Some(self.builtins.classes.bool_)
                } else if v.is_number() {
                    Some(self.builtins.classes.number)
                } else {
                    None
                }
            }
        };
        let Some(mut current) = starting_class else {
            return Ok(false);
        };
        loop {
            if current == target_class {
                return Ok(true);
            }
            let super_class = unsafe { class_cell(current) }.borrow().super_class;
            match super_class {
                Some(sup) => current = sup,
                None => return Ok(false),
            }
        }
    }

    // ---- calls ----------------------------------------------------------------

    /// `callable_slot` holds either a plain callable (`Call`/`TailCall`) or
    /// the method receiver (`MethodCall`, `method_name` set). Resolves what
    /// to invoke, then dispatches to the intrinsic/native/script/class path.
    fn invoke(
        &mut self,
        fiber_ptr: NonNull<GcBox>,
        callable_slot: usize,
        argc: usize,
        is_tail: bool,
        method_name: Option<u32>,
    ) -> Result<(), String> {
        let receiver = unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(callable_slot);

        if let Some(name_idx) = method_name {
            let current_module = unsafe { closure_cell({
                let fiber = unsafe { fiber_cell(fiber_ptr) }.borrow();
                fiber.frames.last().unwrap().closure
            }) }.borrow().function;
            let name = unsafe { module_cell(unsafe { function_ref(current_module) }.module) }
                .borrow()
                .name_at(name_idx)
                .to_string();
            return self.invoke_method(fiber_ptr, callable_slot, argc, receiver, &name);
        }

        match receiver.heap_kind() {
            Some(pocket_runtime::HeapKind::Closure) => self.invoke_closure(fiber_ptr, callable_slot, argc, is_tail, receiver.as_object().unwrap()),
            Some(pocket_runtime::HeapKind::Class) => self.instantiate(fiber_ptr, callable_slot, argc, receiver.as_object().unwrap()),
            _ => Err(format!("{} is not callable", primitive_type_name(receiver))),
        }
    }

    fn invoke_closure(
        &mut self,
        fiber_ptr: NonNull<GcBox>,
        callable_slot: usize,
        argc: usize,
        is_tail: bool,
        closure_ptr: NonNull<GcBox>,
    ) -> Result<(), String> {
        if closure_ptr == self.builtins.print_fn {
            let mut parts = Vec::with_capacity(argc);
            {
                let fiber = unsafe { fiber_cell(fiber_ptr) }.borrow();
                for i in 0..argc {
                    parts.push(fiber.stack_get(callable_slot + 1 + i).to_display_string());
                }
            }
            self.host.write_stdout(&format!("{}\n", parts.join(" ")));
            let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
            fiber.stack_set(callable_slot, Value::null());
            fiber.sp = callable_slot + 1;
            return Ok(());
        }
        if closure_ptr == self.builtins.gc_fn {
            self.maybe_collect_forced();
            let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
            fiber.stack_set(callable_slot, Value::null());
            fiber.sp = callable_slot + 1;
            return Ok(());
        }
        if closure_ptr == self.builtins.yield_fn {
            return self.do_yield(fiber_ptr, callable_slot, argc);
        }

        let function_ptr = unsafe { closure_cell(closure_ptr) }.borrow().function;
        let function = unsafe { function_ref(function_ptr) };
        if !function.accepts_argc(argc) {
            if function.is_variadic() {
                return Err("wrong number of arguments".to_string());
            }
            return Err(format!("Expected exactly {} argument(s).", function.arity));
        }

        if function.is_native() {
            let pocket_runtime::FunctionBody::Native { body, .. } = &function.body else { unreachable!() };
            let mut slots = crate::slots::NativeSlots {
                fiber: fiber_ptr,
                base: callable_slot,
                argc,
                reserved: argc + 1,
                gc: &mut self.gc,
                error: None,
            };
            body(&mut slots);
            let error = slots.take_error();
            match error {
                Some(msg) => return Err(msg),
                None => {
                    let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                    fiber.sp = callable_slot + 1;
                    return Ok(());
                }
            }
        }

        let rbp = if is_tail {
            let current_rbp = unsafe { fiber_cell(fiber_ptr) }.borrow().frames.last().unwrap().rbp;
            let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
            for i in 0..=argc {
                let v = fiber.stack_get(callable_slot + i);
                fiber.stack_set(current_rbp + i, v);
            }
            fiber.frames.pop();
            current_rbp
        } else {
            callable_slot
        };
        self.push_script_frame(fiber_ptr, closure_ptr, rbp, argc, Value::null());
        Ok(())
    }

    fn invoke_method(
        &mut self,
        fiber_ptr: NonNull<GcBox>,
        receiver_slot: usize,
        argc: usize,
        receiver: Value,
        name: &str,
    ) -> Result<(), String> {
        if let Some(ptr) = receiver.as_object() {
            if unsafe { ptr.as_ref().kind() } == pocket_runtime::HeapKind::Class && ptr == self.builtins.classes.fiber {
                return self.invoke_fiber_static(fiber_ptr, receiver_slot, argc, name);
            }
        }
        match receiver.heap_kind() {
            Some(pocket_runtime::HeapKind::Instance) => {
                let inst_ptr = receiver.as_object().unwrap();
                let is_native = unsafe { instance_cell(inst_ptr) }.borrow().is_native();
                if is_native {
                    return Err(format!("unknown attribute '{name}'"));
                }
                let class_ptr = match &*unsafe { instance_cell(inst_ptr) }.borrow() {
                    PkInstance::Script { class, .. } => *class,
                    PkInstance::Native { .. } => unreachable!(),
                };
                let module_of_class = unsafe { class_cell(class_ptr) }.borrow().module;
                let name_idx = unsafe { module_cell(module_of_class) }.borrow_mut().intern_name(name);
                let method = pocket_runtime::pk_class::resolve_method(
                    class_ptr,
                    name_idx,
                    |c| unsafe { class_cell(c) }.borrow().super_class,
                    |c, n| unsafe { class_cell(c) }.borrow().own_method(n),
                );
                match method {
                    Some(closure_ptr) => {
                        let function_ptr = unsafe { closure_cell(closure_ptr) }.borrow().function;
                        let function = unsafe { function_ref(function_ptr) };
                        if !function.accepts_argc(argc) {
                            return Err(format!("Expected exactly {} argument(s).", function.arity));
                        }
                        self.push_script_frame(fiber_ptr, closure_ptr, receiver_slot, argc, receiver);
                        Ok(())
                    }
                    None => Err(format!("unknown attribute '{name}'")),
                }
            }
            _ => Err(format!("unknown attribute '{name}'")),
        }
    }

    fn invoke_fiber_static(
        &mut self,
        fiber_ptr: NonNull<GcBox>,
        receiver_slot: usize,
        argc: usize,
        name: &str,
    ) -> Result<(), String> {
        match name {
            "new" => {
                if argc != 1 {
                    return Err("Fiber.new expects exactly one argument".to_string());
                }
                let closure_v = unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(receiver_slot + 1);
                let Some(closure_ptr) = closure_v.as_object().filter(|p| unsafe { p.as_ref().kind() } == pocket_runtime::HeapKind::Closure) else {
                    return Err("Fiber.new expects a closure".to_string());
                };
                let new_fiber = self.gc.alloc(HeapObject::Fiber(RefCell::new(PkFiber::new(closure_ptr))));
                let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                fiber.stack_set(receiver_slot, Value::object(new_fiber));
                fiber.sp = receiver_slot + 1;
                Ok(())
            }
            "run" | "resume" => {
                if argc == 0 {
                    return Err(format!("Fiber.{name} expects a fiber argument"));
                }
                let target_v = unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(receiver_slot + 1);
                let Some(target_ptr) = target_v.as_object().filter(|p| unsafe { p.as_ref().kind() } == pocket_runtime::HeapKind::Fiber) else {
                    return Err(format!("Fiber.{name} expects a Fiber"));
                };
                let expected_state = if name == "run" { FiberState::New } else { FiberState::Yielded };
                let state = unsafe { fiber_cell(target_ptr) }.borrow().state;
                if state != expected_state {
                    return Err(format!("fiber is not in a state to be {}", if name == "run" { "run" } else { "resumed" }));
                }
                let passed = if argc >= 2 {
                    unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(receiver_slot + 2)
                } else {
                    Value::null()
                };
                unsafe { fiber_cell(target_ptr) }.borrow_mut().caller = Some(fiber_ptr);
                {
                    let mut caller = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                    caller.sp = receiver_slot;
                }
                if name == "run" {
                    let base_closure = unsafe { fiber_cell(target_ptr) }.borrow().base_closure;
                    let fn_ptr = unsafe { closure_cell(base_closure) }.borrow().function;
                    let function = unsafe { function_ref(fn_ptr) };
                    let call_args = argc - 1;
                    if !function.accepts_argc(call_args) {
                        return Err(format!("Expected exactly {} argument(s).", function.arity));
                    }
                    {
                        let mut target = unsafe { fiber_cell(target_ptr) }.borrow_mut();
                        target.grow(1 + call_args.max(1));
                        target.stack_set(0, Value::null());
                        for i in 0..call_args {
                            let v = unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(receiver_slot + 2 + i);
                            target.stack_set(1 + i, v);
                        }
                        target.sp = 1 + call_args;
                        target.state = FiberState::Running;
                    }
                    self.push_script_frame(target_ptr, base_closure, 0, call_args, Value::null());
                } else {
                    let slot = unsafe { fiber_cell(target_ptr) }.borrow().sp - 1;
                    let mut target = unsafe { fiber_cell(target_ptr) }.borrow_mut();
                    target.stack_set(slot, passed);
                    target.state = FiberState::Running;
                }
                tracing::trace!(target: "fiber_switch", from = ?fiber_ptr, to = ?target_ptr, op = name, "run/resume");
                self.current_fiber = Some(target_ptr);
                Ok(())
            }
            _ => Err(format!("unknown attribute '{name}' on Fiber")),
        }
    }

    fn do_yield(&mut self, fiber_ptr: NonNull<GcBox>, callable_slot: usize, argc: usize) -> Result<(), String> {
        let value = if argc >= 1 {
            unsafe { fiber_cell(fiber_ptr) }.borrow().stack_get(callable_slot + 1)
        } else {
            Value::null()
        };
        let caller = unsafe { fiber_cell(fiber_ptr) }.borrow().caller;
        let Some(caller_ptr) = caller else {
            return Err("yield with no running fiber to resume".to_string());
        };
        {
            let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
            fiber.stack_set(callable_slot, Value::null());
            fiber.sp = callable_slot + 1;
            fiber.state = FiberState::Yielded;
            fiber.caller = None;
        }
        unsafe { fiber_cell(caller_ptr) }.borrow_mut().push(value);
        tracing::trace!(target: "fiber_switch", from = ?fiber_ptr, to = ?caller_ptr, "yield");
        self.current_fiber = Some(caller_ptr);
        Ok(())
    }

    fn instantiate(&mut self, fiber_ptr: NonNull<GcBox>, callable_slot: usize, argc: usize, class_ptr: NonNull<GcBox>) -> Result<(), String> {
        if is_primitive_class(&self.builtins, class_ptr) {
            return Err("cannot construct a primitive class directly".to_string());
        }
        let field_count = unsafe { class_cell(class_ptr) }.borrow().fields.len();
        let instance = PkInstance::new_script(class_ptr, field_count);
        let instance_ptr = self.gc.alloc(HeapObject::Instance(RefCell::new(instance)));
        let instance_value = Value::object(instance_ptr);

        let ctor = unsafe { class_cell(class_ptr) }.borrow().ctor;
        match ctor {
            Some(ctor_closure) => {
                let function_ptr = unsafe { closure_cell(ctor_closure) }.borrow().function;
                let function = unsafe { function_ref(function_ptr) };
                if !function.accepts_argc(argc) {
                    return Err(format!("Expected exactly {} argument(s).", function.arity));
                }
                self.push_script_frame(fiber_ptr, ctor_closure, callable_slot, argc, instance_value);
                let depth = unsafe { fiber_cell(fiber_ptr) }.borrow().frames.len();
                self.overrides.push(ReturnOverride { fiber: fiber_ptr, depth, value: instance_value });
                Ok(())
            }
            None => {
                if argc != 0 {
                    return Err("class has no constructor but was given arguments".to_string());
                }
                let mut fiber = unsafe { fiber_cell(fiber_ptr) }.borrow_mut();
                fiber.stack_set(callable_slot, instance_value);
                fiber.sp = callable_slot + 1;
                Ok(())
            }
        }
    }

    fn maybe_collect_forced(&mut self) {
        self.gc_collect();
    }

    pub fn fault_to_string(&self, fault: VmFault) -> String {
        fault.to_string()
    }
}

fn primitive_class_for(builtins: &Builtins, kind: pocket_runtime::HeapKind) -> NonNull<GcBox> {
    use pocket_runtime::HeapKind::*;
    match kind {
        String => builtins.classes.string,
        List => builtins.classes.list,
        Map => builtins.classes.map,
        Range => builtins.classes.range,
        Closure => builtins.classes.closure,
        Fiber => builtins.classes.fiber,
        _ => builtins.classes.object,
    }
}

fn is_primitive_class(builtins: &Builtins, ptr: NonNull<GcBox>) -> bool {
    let c = &builtins.classes;
    ptr == c.object
        || ptr == c.null
        || ptr == c.bool_
        || ptr == c.number
        || ptr == c.string
        || ptr == c.list
        || ptr == c.map
        || ptr == c.range
        || ptr == c.closure
        || ptr == c.fiber
}

impl pocket_compiler::ImportHost for Vm {
    fn resolve_path(&mut self, from_path: &str, target: &str) -> Option<String> {
        Vm::resolve_path(self, from_path, target)
    }

    fn load_script(&mut self, path: &str) -> Option<String> {
        Vm::load_script(self, path)
    }

    fn cached_module(&mut self, canonical_path: &str) -> Option<NonNull<GcBox>> {
        Vm::cached_module(self, canonical_path)
    }

    fn register_module(&mut self, canonical_path: &str, module: NonNull<GcBox>) {
        self.modules.push((canonical_path.to_string(), module));
    }
}

// ---- free-standing value operations ----------------------------------------

fn get_subscript(receiver: Value, key: Value) -> Result<Value, String> {
    match receiver.heap_kind() {
        Some(pocket_runtime::HeapKind::List) => {
            let list = receiver.as_list().unwrap().borrow();
            let Some(idx) = key.as_int() else {
                return Err("list index must be a Number".to_string());
            };
            let idx = normalize_index(idx, list.len())?;
            list.get(idx).ok_or_else(|| "list index out of bounds".to_string())
        }
        Some(pocket_runtime::HeapKind::Map) => {
            let map = receiver.as_map().unwrap().borrow();
            match map.get(key) {
                Ok(Some(v)) => Ok(v),
                Ok(None) => Ok(Value::undefined()),
                Err(MapError::Unhashable) => Err("unhashable map key".to_string()),
            }
        }
        Some(pocket_runtime::HeapKind::String) => {
            let s = receiver.as_string().unwrap();
            let Some(idx) = key.as_int() else {
                return Err("string index must be a Number".to_string());
            };
            let idx = normalize_index(idx, s.len())?;
            let byte = s.as_bytes().get(idx).copied().ok_or_else(|| "string index out of bounds".to_string())?;
            Ok(Value::int(byte as i32))
        }
        _ => Err(format!("{} is not subscriptable", primitive_type_name(receiver))),
    }
}

fn normalize_index(idx: i32, len: usize) -> Result<usize, String> {
    let resolved = if idx < 0 { idx + len as i32 } else { idx };
    if resolved < 0 || resolved as usize >= len {
        Err("index out of bounds".to_string())
    } else {
        Ok(resolved as usize)
    }
}

fn set_subscript(receiver: Value, key: Value, value: Value) -> Result<(), String> {
    match receiver.heap_kind() {
        Some(pocket_runtime::HeapKind::List) => {
            let mut list = receiver.as_list().unwrap().borrow_mut();
            let Some(idx) = key.as_int() else {
                return Err("list index must be a Number".to_string());
            };
            let len = list.len();
            let idx = normalize_index(idx, len)?;
            list.set(idx, value).ok_or_else(|| "list index out of bounds".to_string())
        }
        Some(pocket_runtime::HeapKind::Map) => {
            let mut map = receiver.as_map().unwrap().borrow_mut();
            map.set(key, value).map_err(|_| "unhashable map key".to_string())
        }
        _ => Err(format!("cannot assign into a {}", primitive_type_name(receiver))),
    }
}

fn contains(container: Value, needle: Value) -> Result<bool, String> {
    match container.heap_kind() {
        Some(pocket_runtime::HeapKind::List) => {
            let list = container.as_list().unwrap().borrow();
            Ok(list.iter().any(|v| v.is_equal(needle)))
        }
        Some(pocket_runtime::HeapKind::Map) => {
            let map = container.as_map().unwrap().borrow();
            map.contains_key(needle).map_err(|_| "unhashable map key".to_string())
        }
        Some(pocket_runtime::HeapKind::Range) => {
            let r = container.as_range().unwrap();
            match needle.as_number() {
                Some(n) => Ok(n >= r.from && n < r.to),
                None => Ok(false),
            }
        }
        Some(pocket_runtime::HeapKind::String) => {
            let haystack = container.as_string().unwrap().as_str_lossy();
            match needle.heap_kind() {
                Some(pocket_runtime::HeapKind::String) => {
                    Ok(haystack.contains(needle.as_string().unwrap().as_str_lossy().as_ref()))
                }
                _ => Err("'in' on a String expects a String".to_string()),
            }
        }
        _ => Err(format!("cannot use 'in' on a {}", primitive_type_name(container))),
    }
}

fn compare(op: Op, a: Value, b: Value) -> Result<Value, String> {
    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        let result = match op {
            Op::Lt => x < y,
            Op::LtEq => x <= y,
            Op::Gt => x > y,
            Op::GtEq => x >= y,
            _ => unreachable!(),
        };
        return Ok(Value::bool(result));
    }
    if let (Some(pocket_runtime::HeapKind::String), Some(pocket_runtime::HeapKind::String)) = (a.heap_kind(), b.heap_kind()) {
        let x = a.as_string().unwrap().as_str_lossy();
        let y = b.as_string().unwrap().as_str_lossy();
        let result = match op {
            Op::Lt => x < y,
            Op::LtEq => x <= y,
            Op::Gt => x > y,
            Op::GtEq => x >= y,
            _ => unreachable!(),
        };
        return Ok(Value::bool(result));
    }
    Err(format!(
        "cannot compare {} and {}",
        primitive_type_name(a),
        primitive_type_name(b)
    ))
}

fn binary_op(op: Op, a: Value, b: Value) -> Result<Value, String> {
    use pocket_runtime::nanbox::{MAX_INT, MIN_INT};

    if op == Op::Add {
        if let (Some(pocket_runtime::HeapKind::String), Some(pocket_runtime::HeapKind::String)) = (a.heap_kind(), b.heap_kind()) {
            // Concatenation is allocation, which only the VM (holding the
            // heap) can do; this path is short-circuited in `vm.rs`'s
            // dispatch before reaching here. See the `Op::Add` match arm.
            unreachable!("string concatenation must be handled by the caller, which owns the heap");
        }
        if let (Some(pocket_runtime::HeapKind::List), Some(pocket_runtime::HeapKind::List)) = (a.heap_kind(), b.heap_kind()) {
            unreachable!("list concatenation must be handled by the caller, which owns the heap");
        }
    }

    if let (Some(x), Some(y)) = (a.as_int(), b.as_int()) {
        if let Some(bitwise) = bitwise_int_op(op, x, y) {
            return bitwise;
        }
        let wide = match op {
            Op::Add => x as i64 + y as i64,
            Op::Sub => x as i64 - y as i64,
            Op::Mul => x as i64 * y as i64,
            Op::Div => {
                if y == 0 {
                    return Err("division by zero".to_string());
                }
                return Ok(Value::float(x as f64 / y as f64));
            }
            Op::Mod => {
                if y == 0 {
                    return Err("division by zero".to_string());
                }
                return Ok(Value::int(x.rem_euclid(y)));
            }
            _ => unreachable!(),
        };
        if wide > MAX_INT || wide < MIN_INT {
            return Err("integer overflow".to_string());
        }
        return Ok(Value::int(wide as i32));
    }

    if let (Some(x), Some(y)) = (a.as_number(), b.as_number()) {
        let result = match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
            Op::Mod => x.rem_euclid(y),
            Op::BitAnd | Op::BitOr | Op::BitXor | Op::BitLshift | Op::BitRshift => {
                return Err("bitwise operators require integer operands".to_string());
            }
            _ => unreachable!(),
        };
        return Ok(Value::float(result));
    }

    Err(format!(
        "cannot apply operator to {} and {}",
        primitive_type_name(a),
        primitive_type_name(b)
    ))
}

fn bitwise_int_op(op: Op, x: i32, y: i32) -> Option<Result<Value, String>> {
    let result = match op {
        Op::BitAnd => x & y,
        Op::BitOr => x | y,
        Op::BitXor => x ^ y,
        Op::BitLshift => {
            if !(0..32).contains(&y) {
                return Some(Err("shift amount out of range".to_string()));
            }
            x.wrapping_shl(y as u32)
        }
        Op::BitRshift => {
            if !(0..32).contains(&y) {
                return Some(Err("shift amount out of range".to_string()));
            }
            x.wrapping_shr(y as u32)
        }
        _ => return None,
    };
    Some(Ok(Value::int(result)))
}
