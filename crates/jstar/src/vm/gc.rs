//! Garbage collection trigger and root marking.
//!
//! [`Heap`] owns the mark/sweep mechanics; this module only owns the root set, the one part
//! of the tracing collector that has to know about [`Vm`]'s own state (value stack, call
//! frames, open upvalues, loaded modules) rather than the object graph alone.

use super::Vm;

impl Vm {
    /// Marks every root and sweeps. Called from the main dispatch
    /// loop once per instruction when `Heap::should_collect` trips; also callable directly
    /// by an embedder that wants a deterministic collection point (`Vm::collect`).
    pub(crate) fn collect_garbage(&mut self) {
        self.tracer.on_gc_start(self.heap.stats().allocated_bytes);
        self.mark_roots();
        self.heap.sweep();
        self.tracer.on_gc_end(self.heap.stats().live_objects);
    }

    fn mark_roots(&mut self) {
        for &v in &self.stack {
            self.heap.mark_value(v);
        }
        for frame in &self.frames {
            self.heap.mark(frame.closure);
            if let Some(v) = frame.pending_reraise {
                self.heap.mark_value(v);
            }
            if let Some(v) = frame.constructing {
                self.heap.mark_value(v);
            }
        }
        for &id in &self.open_upvalues {
            self.heap.mark(id);
        }
        for module_id in self.modules.iter() {
            self.heap.mark(module_id);
        }
        self.heap.mark_static_strings();
    }
}
