//! Call-frame record: one entry per active call, tracking the closure
//! running, its return instruction pointer, its base slot in the value stack, and the
//! exception-handler stack active within it.

use crate::heap::HeapId;
use crate::value::Value;

/// One `TRY_PUSH`ed handler: where
/// `RAISE` should resume and how far to unwind the value stack first.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRecord {
    /// Value-stack depth (relative to the frame base) to unwind to before jumping.
    pub stack_depth: usize,
    /// Bytecode offset of the `except` clause dispatch table for this `try`, or `None` for a
    /// bare `try...ensure` (and `with`'s desugaring) which has no arms to dispatch to.
    pub handler_ip: Option<usize>,
    /// Bytecode offset of the `ensure` clause, run on both normal and exceptional exit.
    pub ensure_ip: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CallFrame {
    pub closure: HeapId,
    pub ip: usize,
    /// Index into the VM's value stack where this frame's slot 0 lives.
    pub base: usize,
    pub handlers: Vec<HandlerRecord>,
    /// Set while unwinding a generator's `RETURN`/`raise`-past-top so the VM knows this
    /// frame belongs to a generator resume rather than a direct call.
    pub is_generator_frame: bool,
    /// Set by `raise_in` when it redirects into an ensure-only continuation (bare
    /// `try...ensure`, or an unmatched `except` arm list): `ENSURE_EXIT` checks this and
    /// re-raises once the ensure block has run, rather than falling through.
    pub pending_reraise: Option<Value>,
    /// Set by `call_class_constructor` when this frame is running a user `construct` method:
    /// `RETURN` overrides whatever the method body computed with this instance value instead.
    pub constructing: Option<Value>,
}

impl CallFrame {
    pub fn new(closure: HeapId, base: usize) -> Self {
        Self {
            closure,
            ip: 0,
            base,
            handlers: Vec::new(),
            is_generator_frame: false,
            pending_reraise: None,
            constructing: None,
        }
    }
}
