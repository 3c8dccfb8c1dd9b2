//! The embedding surface a host fills in to create a [`crate::Vm`].
//!
//! Every field is optional except the two import callbacks, which only
//! matter if a script actually uses `import`; a host that never imports
//! modules can leave them `None`. Unset I/O callbacks fall back to the
//! process's own stdio, matching a CLI front-end's expectations without
//! forcing every embedder to wire one up.

use std::os::raw::c_void;

use pocket_runtime::Value;

/// Resolves `target` (the literal string after `import`) relative to the
/// importing module's own path, to a canonical path. `None` means "no such
/// module".
pub type ResolvePathFn = Box<dyn FnMut(&str, &str) -> Option<String>>;
/// Reads the source text at a path already returned by `resolve_path_fn`.
pub type LoadScriptFn = Box<dyn FnMut(&str) -> Option<String>>;
/// UTF-8 byte output; used for `print`, compile errors, and runtime stack
/// traces.
pub type WriteFn = Box<dyn FnMut(&str)>;
/// Reads one line of input for the `lang`/`io` native surface; `None` means
/// end of input.
pub type ReadLineFn = Box<dyn FnMut() -> Option<String>>;
/// Called when a script reads an attribute of a host-defined native
/// instance; returns the value or `None` ("no such attribute").
pub type InstGetAttribFn = Box<dyn FnMut(*mut c_void, u32, &str) -> Option<Value>>;
/// Called when a script writes an attribute of a host-defined native
/// instance; returns whether the write was accepted.
pub type InstSetAttribFn = Box<dyn FnMut(*mut c_void, u32, &str, Value) -> bool>;
/// Called when a native instance becomes unreachable and is collected.
pub type InstFreeFn = Box<dyn FnMut(*mut c_void, u32)>;
/// Maps a native-instance kind id to its display name, for error messages
/// and `type_name`.
pub type InstNameFn = Box<dyn FnMut(u32) -> String>;

#[derive(Default)]
pub struct HostConfig {
    pub stdout_write: Option<WriteFn>,
    pub stderr_write: Option<WriteFn>,
    pub stdin_read: Option<ReadLineFn>,
    pub resolve_path_fn: Option<ResolvePathFn>,
    pub load_script_fn: Option<LoadScriptFn>,
    pub inst_get_attrib_fn: Option<InstGetAttribFn>,
    pub inst_set_attrib_fn: Option<InstSetAttribFn>,
    pub inst_free_fn: Option<InstFreeFn>,
    pub inst_name_fn: Option<InstNameFn>,
    pub use_ansi_color: bool,
}

impl HostConfig {
    pub fn new() -> Self {
        HostConfig::default()
    }

    pub(crate) fn write_stdout(&mut self, text: &str) {
        match &mut self.stdout_write {
            Some(f) => f(text),
            None => print!("{text}"),
        }
    }

    pub(crate) fn write_stderr(&mut self, text: &str) {
        match &mut self.stderr_write {
            Some(f) => f(text),
            None => eprint!("{text}"),
        }
    }

    pub(crate) fn read_line(&mut self) -> Option<String> {
        match &mut self.stdin_read {
            Some(f) => f(),
            None => {
                let mut buf = String::new();
                match std::io::stdin().read_line(&mut buf) {
                    Ok(0) => None,
                    Ok(_) => Some(buf),
                    Err(_) => None,
                }
            }
        }
    }
}
