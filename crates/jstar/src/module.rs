//! Module registry and import resolution.
//!
//! The registry itself is just a name → module map; all of the interesting behavior (source
//! vs. bytecode, cyclic-import safety, native registry binding) lives in [`crate::vm::Vm::import`],
//! which is the only code that mutates it.

use ahash::AHashMap;

use crate::heap::HeapId;

/// Maps a dotted module path's interned name to its module object, insertion-ordered so a
/// host can enumerate loaded modules in import order if it ever needs to (e.g. for a repl's
/// `reload`).
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    by_name: AHashMap<HeapId, HeapId>,
    order: Vec<HeapId>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: HeapId) -> Option<HeapId> {
        self.by_name.get(&name).copied()
    }

    /// Registers `module` under `name` *before* its top-level function runs, so a cyclic import sees the partially-initialized module rather than recursing.
    pub fn insert(&mut self, name: HeapId, module: HeapId) {
        if self.by_name.insert(name, module).is_none() {
            self.order.push(module);
        }
    }

    /// Removes a module whose top-level function failed.
    pub fn remove(&mut self, name: HeapId) {
        if let Some(module) = self.by_name.remove(&name) {
            self.order.retain(|&m| m != module);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.order.iter().copied()
    }
}
