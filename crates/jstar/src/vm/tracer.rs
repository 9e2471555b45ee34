//! VM execution tracing: a set of hook points the embedder can observe without
//! the VM paying for them when nobody's listening.
//!
//! [`NoopTracer`] is the default; every hook has a no-op body so a host that doesn't care
//! about tracing pays only the cost of a trait-object call per hook site, not per-event
//! allocation or formatting.

use crate::bytecode::Opcode;
use crate::heap::HeapId;
use crate::value::Value;

/// Hook points fired during execution. All methods default to
/// no-ops; implement only the ones a given tracer cares about.
pub trait VmTracer {
    /// Fired before each opcode dispatch. The hottest hook — keep implementations cheap.
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Fired when a call frame is pushed (`Call`/`Invoke`/`SuperInvoke`/generator resume).
    fn on_call(&mut self, _closure: HeapId, _frame_depth: usize) {}

    /// Fired when a call frame is popped via `Return`.
    fn on_return(&mut self, _value: Value, _frame_depth: usize) {}

    /// Fired when a guest exception is raised, before handler search begins.
    fn on_raise(&mut self, _exception: Value, _frame_depth: usize) {}

    /// Fired once a `raise` finds (or fails to find) a handler.
    fn on_unwind(&mut self, _caught: bool, _frame_depth: usize) {}

    /// Fired around a GC cycle, before marking and after sweeping respectively.
    fn on_gc_start(&mut self, _allocated_bytes: usize) {}
    fn on_gc_end(&mut self, _live_objects: usize) {}
}

/// Zero-overhead default tracer used when the embedder doesn't configure one.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}
