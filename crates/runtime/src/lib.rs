//! PocketLang Runtime: value model, object layer, and garbage collector.
//!
//! - **Value model**: [`nanbox`] packs every value into one machine
//!   word; [`value`] layers `typeOf`/`isSame`/`isEqual`/`hash`/`toBool`/
//!   `toString` on top.
//! - **Object layer**: one module per heap kind
//!   (`pk_string`/`pk_list`/`pk_map`/`pk_range`/`pk_module`/`pk_function`/
//!   `pk_closure`/`pk_fiber`/`pk_class`), unified under [`heap`]'s
//!   `GcBox`/`HeapObject`.
//! - **Garbage collector**: [`gc`]'s non-incremental mark-and-sweep
//!   over the object chain `heap` threads through every allocation.

pub mod gc;
pub mod heap;
pub mod nanbox;
pub mod pk_class;
pub mod pk_closure;
pub mod pk_fiber;
pub mod pk_function;
pub mod pk_list;
pub mod pk_map;
pub mod pk_module;
pub mod pk_range;
pub mod pk_string;
pub mod value;

pub use gc::GcHeap;
pub use heap::{GcBox, HeapKind, HeapObject};
pub use nanbox::NanBox;
pub use pk_class::{PkClass, PkInstance};
pub use pk_closure::{PkClosure, PkUpvalue};
pub use pk_fiber::{fiber_cell, CallFrame, FiberState, PkFiber};
pub use pk_function::{FunctionBody, NativeContext, NativeFn, PkFunction, ScriptBody};
pub use pk_list::PkList;
pub use pk_map::{MapError, PkMap};
pub use pk_module::{module_cell, PkModule};
pub use pk_range::PkRange;
pub use pk_string::PkString;
pub use value::{PrimitiveTag, Value};
