//! VM configuration, threaded explicitly through [`crate::vm::Vm::new`] rather than
//! read from a global or an env-driven config crate.

use crate::error::JStarError;
use crate::vm::Vm;

/// Host callback invoked for every syntax/compile/deserialize/version diagnostic.
pub type ErrorCallback = Box<dyn FnMut(&JStarError)>;

/// Outcome of resolving an import by module path.
pub enum ImportResolution {
    /// J* source to compile.
    Source { code: String, path: String },
    /// Precompiled bytecode to deserialize.
    Bytecode { bytes: Vec<u8>, path: String },
    /// No module satisfies this path.
    NotFound,
}

/// Host-supplied resolver for `IMPORT`: the sole filesystem/extension-loading
/// extension point. The VM itself never touches the filesystem.
pub trait ImportCallback {
    fn resolve(&mut self, vm: &mut Vm, dotted_path: &str) -> ImportResolution;
}

/// A no-op resolver used by embedders that only ever run a single pre-loaded module.
pub struct NoImports;

impl ImportCallback for NoImports {
    fn resolve(&mut self, _vm: &mut Vm, _dotted_path: &str) -> ImportResolution {
        ImportResolution::NotFound
    }
}

/// Construction-time configuration for a [`Vm`].
pub struct Config {
    /// Initial value-stack capacity, in slots.
    pub stack_size: usize,
    /// Bytes allocated before the first GC cycle is triggered.
    pub initial_gc_threshold: usize,
    /// Multiplier applied to `allocated_bytes` after a collection to get the next threshold.
    pub heap_grow_rate: f64,
    /// Maximum call-frame depth before a stack-overflow runtime exception is raised.
    pub max_call_depth: usize,
    /// Force a collection on every allocation.
    pub stress_gc: bool,
    /// Opaque pointer the host can stash and retrieve via the embedding API.
    pub host_data: Option<*mut std::ffi::c_void>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: 4096,
            initial_gc_threshold: 1 << 20,
            heap_grow_rate: 2.0,
            max_call_depth: 512,
            stress_gc: false,
            host_data: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stack_size(mut self, n: usize) -> Self {
        self.stack_size = n;
        self
    }

    pub fn with_initial_gc_threshold(mut self, n: usize) -> Self {
        self.initial_gc_threshold = n;
        self
    }

    pub fn with_heap_grow_rate(mut self, rate: f64) -> Self {
        self.heap_grow_rate = rate;
        self
    }

    pub fn with_stress_gc(mut self, on: bool) -> Self {
        self.stress_gc = on;
        self
    }
}
