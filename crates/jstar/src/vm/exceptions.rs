//! `try`/`except`/`ensure`/`raise`.
//!
//! `TRY_PUSH`/`TRY_POP` maintain a per-frame stack of [`HandlerRecord`]s. `RAISE` (and any VM
//! operation that needs to signal a guest exception — arity mismatches, type errors, missing
//! names) funnels through [`Vm::handle_raise`], which walks frames from the current one down
//! to `floor` looking for the innermost still-active handler, consuming it as it goes so an
//! unmatched `except` arm list's own re-raise continues the search past this handler rather
//! than finding it again.
//!
//! `floor` bounds the search to frames owned by the current [`Vm::run`] invocation: an
//! exception raised while a dunder-method call (`call.rs`'s `perform_call_sync`) or generator
//! resume is being driven by a nested `run` only searches that nested call's own frames. If
//! not caught there, it surfaces as `Err` to the Rust call site that started the nested run,
//! which (being itself inside some outer opcode handler) re-offers it to `handle_raise` at its
//! own, enclosing floor, continuing the search one recursion level further out, so a chain
//! of nested runs is walked as a single flat search over current and outer frames.

use crate::value::Value;

use super::frame::HandlerRecord;
use super::Vm;

impl Vm {
    pub(crate) fn op_try_push(&mut self, handler_raw: u16, ensure_raw: u16) {
        let frame = self.frames.last_mut().expect("active frame");
        let stack_depth = self.stack.len() - frame.base;
        let handler_ip = if handler_raw == u16::MAX { None } else { Some(handler_raw as usize) };
        let ensure_ip = if ensure_raw == u16::MAX { None } else { Some(ensure_raw as usize) };
        frame.handlers.push(HandlerRecord { stack_depth, handler_ip, ensure_ip });
    }

    pub(crate) fn op_try_pop(&mut self) {
        self.frames.last_mut().expect("active frame").handlers.pop();
    }

    pub(crate) fn op_ensure_exit(&mut self, floor: usize) -> Result<(), Value> {
        let pending = self.frames.last_mut().expect("active frame").pending_reraise.take();
        match pending {
            Some(exc) => self.handle_raise(exc, floor),
            None => Ok(()),
        }
    }

    pub(crate) fn do_raise(&mut self, exc: Value, floor: usize) -> Result<(), Value> {
        self.handle_raise(exc, floor)
    }

    /// Finds the innermost active handler at or above `floor`, consumes it, and either jumps
    /// the owning frame's instruction pointer into its dispatch/ensure code (`Ok`, dispatch
    /// loop continues normally) or, if nothing in range catches it, unwinds back to `floor`
    /// and returns the exception for the caller to re-offer further out (`Err`).
    pub(crate) fn handle_raise(&mut self, exc: Value, floor: usize) -> Result<(), Value> {
        self.tracer.on_raise(exc, self.frames.len());
        let mut frame_idx = self.frames.len();
        while frame_idx > floor {
            frame_idx -= 1;
            if let Some(record) = self.frames[frame_idx].handlers.pop() {
                self.tracer.on_unwind(true, frame_idx + 1);
                self.frames.truncate(frame_idx + 1);
                let base = self.frames[frame_idx].base;
                let unwind_to = base + record.stack_depth;
                self.close_upvalues_from(unwind_to);
                self.stack.truncate(unwind_to);
                match record.handler_ip {
                    Some(ip) => {
                        self.push(exc);
                        self.frames[frame_idx].ip = ip;
                    }
                    None => {
                        self.frames[frame_idx].pending_reraise = Some(exc);
                        self.frames[frame_idx].ip =
                            record.ensure_ip.expect("a handler with no dispatch table always has an ensure clause");
                    }
                }
                return Ok(());
            }
        }
        self.tracer.on_unwind(false, floor);
        let base = self.frames.get(floor).map(|f| f.base).unwrap_or(0);
        self.frames.truncate(floor);
        self.stack.truncate(base);
        Err(exc)
    }
}
