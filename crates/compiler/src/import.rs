//! The host hook the compiler recurses through to resolve `import`.
//!
//! Import resolution happens synchronously at compile time: the compiler
//! asks the host to turn a relative target into a canonical path, asks it
//! to load that path's source, and recursively compiles the result. This
//! trait is the seam — `pocket-vm` is the only implementer, since it's the
//! one holding the module cache and the user-supplied path/loader
//! callbacks (`resolve_path_fn`/`load_script_fn`) from the embedding API.
use std::ptr::NonNull;

use pocket_runtime::GcBox;

pub trait ImportHost {
    /// Resolves `target` (the literal string after `import`) relative to
    /// `from_path`, the importing module's own path. `None` means "no such
    /// module".
    fn resolve_path(&mut self, from_path: &str, target: &str) -> Option<String>;

    /// Reads the source text at a path already returned by `resolve_path`.
    fn load_script(&mut self, path: &str) -> Option<String>;

    /// Looks up an already-compiled module by canonical path.
    fn cached_module(&mut self, canonical_path: &str) -> Option<NonNull<GcBox>>;

    /// Records a freshly compiled module under its canonical path, before
    /// recursing into it, so that an import cycle sees a cache hit instead
    /// of compiling the same module twice.
    fn register_module(&mut self, canonical_path: &str, module: NonNull<GcBox>);
}
