//! Register-of-slots stack virtual machine.
//!
//! One [`Vm`] owns the heap, the value stack, the call-frame stack, and the module registry.
//! Dispatch itself lives in [`run`](Vm::run); the opcode groups that need more than a few
//! lines are split into sibling modules by concern (`binary.rs`, `compare.rs`, `attr.rs`,
//! `collections.rs`, `call.rs`, `exceptions.rs`) rather than one multi-thousand-line `match`.

pub mod frame;

mod attr;
mod binary;
mod builtins;
mod call;
mod collections;
mod compare;
mod exceptions;
mod gc;
mod import;
pub mod tracer;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ast::BinaryOp;
use crate::bytecode::Opcode;
use crate::config::{Config, ErrorCallback, ImportCallback, NoImports};
use crate::heap::{Heap, HeapId, Obj};
use crate::module::ModuleRegistry;
use crate::types::{Class, Module, TraceRecord};
use crate::value::Value;

use frame::CallFrame;
use tracer::{NoopTracer, VmTracer};

pub(crate) use builtins::BuiltinClasses;

/// What stopped one call to [`Vm::run`]: either the frame at its floor returned normally, or
/// (only meaningful when resuming/driving a generator) it suspended at a `yield`.
#[derive(Debug, Clone, Copy)]
pub enum RunOutcome {
    Returned(Value),
    Yielded(Value),
}

pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Open upvalues, one entry per still-live stack slot some closure has captured,
    /// ordered by `stack_slot` ascending so `close_upvalues_from` can binary-search the
    /// boundary rather than scan.
    pub(crate) open_upvalues: Vec<HeapId>,
    pub(crate) modules: ModuleRegistry,
    pub(crate) core_module: HeapId,
    pub(crate) builtins: BuiltinClasses,
    pub(crate) config: Config,
    pub(crate) last_trace: Vec<TraceRecord>,
    /// Base stack index of each currently-running native call, pushed/popped around
    /// `call_native` so nested native -> guest -> native chains each see their own base.
    pub(crate) native_bases: Vec<usize>,
    /// Signal-handler-safe cancellation flag. Polled at each backward branch and call boundary; a host stashes
    /// [`Vm::eval_break_handle`] and stores `true` from any context, including a signal
    /// handler, without touching the `Vm` itself.
    eval_break: Arc<AtomicBool>,
    tracer: Box<dyn VmTracer>,
    import_callback: Box<dyn ImportCallback>,
    on_error: ErrorCallback,
}

impl Vm {
    pub fn new(config: Config, import_callback: Box<dyn ImportCallback>, on_error: ErrorCallback) -> Self {
        let mut heap = Heap::new(config.initial_gc_threshold, config.heap_grow_rate);
        heap.stress_gc = config.stress_gc;
        let core_name = heap.intern("__core__");
        let core_module = heap.alloc(Obj::Module(Module::new(core_name)));
        let builtins = builtins::install(&mut heap, core_module);
        let mut modules = ModuleRegistry::new();
        modules.insert(core_name, core_module);
        Self {
            heap,
            stack: Vec::with_capacity(config.stack_size),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            modules,
            core_module,
            builtins,
            config,
            last_trace: Vec::new(),
            native_bases: Vec::new(),
            eval_break: Arc::new(AtomicBool::new(false)),
            tracer: Box::new(NoopTracer),
            import_callback,
            on_error,
        }
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
    }

    pub fn report_error(&mut self, err: &crate::error::JStarError) {
        (self.on_error)(err);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn core_module(&self) -> HeapId {
        self.core_module
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// A clone of the cancellation flag, for a host to store a `true` into from a signal
    /// handler or another thread. The `Vm` itself is never
    /// touched from outside its own thread; only this `Arc<AtomicBool>` is shared.
    pub fn eval_break_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.eval_break)
    }

    fn check_eval_break(&mut self, floor: usize) -> Result<(), Value> {
        if self.eval_break.swap(false, Ordering::Relaxed) {
            let exc = self.interrupted_exception("Execution interrupted");
            return self.handle_raise(exc, floor);
        }
        Ok(())
    }

    // ---- stack helpers ----

    pub(crate) fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: bytecode is compiler-generated and balanced")
    }

    pub(crate) fn peek(&self, back: usize) -> Value {
        self.stack[self.stack.len() - 1 - back]
    }

    pub(crate) fn value_type_name(&self, v: Value) -> &'static str {
        match v {
            Value::Obj(id) => self.heap.get(id).type_name(),
            other => other.type_name(),
        }
    }

    fn frame_base(&self) -> usize {
        self.frames.last().expect("run is only called with at least one active frame").base
    }

    // ---- bytecode fetch helpers ----

    fn current_code(&self) -> &crate::bytecode::Code {
        let frame = self.frames.last().expect("active frame");
        let closure = match self.heap.get(frame.closure) {
            Obj::Closure(c) => c,
            _ => unreachable!("CallFrame::closure always names an Obj::Closure"),
        };
        match self.heap.get(closure.function) {
            Obj::Function(f) => &f.code,
            _ => unreachable!("Closure::function always names an Obj::Function"),
        }
    }

    fn fetch_u8(&mut self) -> u8 {
        let idx = self.frames.len() - 1;
        let ip = self.frames[idx].ip;
        let byte = self.current_code().bytes[ip];
        self.frames[idx].ip += 1;
        byte
    }

    fn fetch_opcode(&mut self) -> Opcode {
        let byte = self.fetch_u8();
        Opcode::from_u8(byte).expect("bytecode is compiler-generated and every byte is a valid opcode")
    }

    fn fetch_u16(&mut self) -> u16 {
        let lo = self.fetch_u8();
        let hi = self.fetch_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn fetch_i16(&mut self) -> i16 {
        self.fetch_u16() as i16
    }

    fn fetch_u16_u8(&mut self) -> (u16, u8) {
        let a = self.fetch_u16();
        let b = self.fetch_u8();
        (a, b)
    }

    fn fetch_u16_u16(&mut self) -> (u16, u16) {
        let a = self.fetch_u16();
        let b = self.fetch_u16();
        (a, b)
    }

    fn const_value(&mut self, k: u16) -> Value {
        let code = self.current_code();
        match &code.consts[k as usize] {
            crate::bytecode::Const::Number(n) => Value::Number(*n),
            crate::bytecode::Const::Str(s) => {
                let s = s.clone();
                Value::Obj(self.heap.intern(&s))
            }
            crate::bytecode::Const::Proto(_) => {
                unreachable!("proto constants are only read by MAKE_CLOSURE, via const_proto")
            }
        }
    }

    fn jump_relative(&mut self, offset: i16) {
        let idx = self.frames.len() - 1;
        let ip = self.frames[idx].ip as i64;
        self.frames[idx].ip = (ip + offset as i64) as usize;
    }

    fn loop_back(&mut self, magnitude: u16) {
        let idx = self.frames.len() - 1;
        self.frames[idx].ip -= magnitude as usize;
    }

    // ---- main dispatch loop ----

    /// Runs until the call-frame stack drops to `floor` via `RETURN`, or the frame at
    /// `floor + 1` suspends via `YIELD`. Recursive calls (one nested synchronous call per
    /// dunder dispatch, generator resume, or native callback) pass `self.frames.len()` as
    /// the new `floor` before pushing the callee's frame.
    pub(crate) fn run(&mut self, floor: usize) -> Result<RunOutcome, Value> {
        loop {
            debug_assert!(self.frames.len() > floor, "run must be entered with an active frame above floor");
            let ip = self.frames.last().unwrap().ip;
            let stack_depth = self.stack.len() - self.frame_base();
            let frame_depth = self.frames.len();
            let op = self.fetch_opcode();
            self.tracer.on_instruction(ip, op, stack_depth, frame_depth);

            match op {
                Opcode::LoadConst => {
                    let k = self.fetch_u16();
                    let v = self.const_value(k);
                    self.push(v);
                }
                Opcode::LoadNull => self.push(Value::Null),
                Opcode::LoadTrue => self.push(Value::Bool(true)),
                Opcode::LoadFalse => self.push(Value::Bool(false)),
                Opcode::LoadNumberSmall => {
                    let n = self.fetch_u8();
                    self.push(Value::Number(f64::from(n)));
                }
                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => {
                    let v = self.peek(0);
                    self.push(v);
                }
                Opcode::Swap => {
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                }
                Opcode::GetLocal => {
                    let idx = self.fetch_u8();
                    let base = self.frame_base();
                    let v = self.stack[base + idx as usize];
                    self.push(v);
                }
                Opcode::SetLocal => {
                    let idx = self.fetch_u8();
                    let base = self.frame_base();
                    let v = self.peek(0);
                    self.stack[base + idx as usize] = v;
                }
                Opcode::GetUpvalue => {
                    let idx = self.fetch_u8();
                    let v = self.read_upvalue(idx);
                    self.push(v);
                }
                Opcode::SetUpvalue => {
                    let idx = self.fetch_u8();
                    let v = self.peek(0);
                    self.write_upvalue(idx, v);
                }
                Opcode::GetGlobal => {
                    let k = self.fetch_u16();
                    self.op_get_global(k, floor)?;
                }
                Opcode::SetGlobal => {
                    let k = self.fetch_u16();
                    self.op_set_global(k, floor)?;
                }
                Opcode::DefGlobal => {
                    let k = self.fetch_u16();
                    self.op_def_global(k);
                }
                Opcode::CloseUpvalue => self.close_one_upvalue(),
                Opcode::GetField => {
                    let k = self.fetch_u16();
                    self.op_get_field(k, floor)?;
                }
                Opcode::SetField => {
                    let k = self.fetch_u16();
                    self.op_set_field(k, floor)?;
                }
                Opcode::GetIndex => self.op_get_index(floor)?,
                Opcode::SetIndex => self.op_set_index(floor)?,
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Pow
                | Opcode::BAnd
                | Opcode::BOr
                | Opcode::BXor
                | Opcode::Shl
                | Opcode::Shr => self.op_binary(op, floor)?,
                Opcode::Neg => self.op_neg(floor)?,
                Opcode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.truthy()));
                }
                Opcode::BNot => self.op_bnot(floor)?,
                Opcode::Eq | Opcode::Neq | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge | Opcode::Is => {
                    self.op_compare(op, floor)?;
                }
                Opcode::Jump => {
                    let off = self.fetch_i16();
                    self.jump_relative(off);
                }
                Opcode::JumpIfFalse => {
                    let off = self.fetch_i16();
                    let v = self.pop();
                    if !v.truthy() {
                        self.jump_relative(off);
                    }
                }
                Opcode::JumpIfTrue => {
                    let off = self.fetch_i16();
                    let v = self.pop();
                    if v.truthy() {
                        self.jump_relative(off);
                    }
                }
                Opcode::Loop => {
                    let mag = self.fetch_u16();
                    self.loop_back(mag);
                    self.check_eval_break(floor)?;
                }
                Opcode::Call => {
                    let argc = self.fetch_u8();
                    self.check_eval_break(floor)?;
                    self.op_call(argc as usize, floor)?;
                }
                Opcode::Invoke => {
                    let (k, argc) = self.fetch_u16_u8();
                    self.check_eval_break(floor)?;
                    self.op_invoke(k, argc as usize, floor)?;
                }
                Opcode::SuperInvoke => {
                    let (k, argc) = self.fetch_u16_u8();
                    self.check_eval_break(floor)?;
                    self.op_super_invoke(k, argc as usize, floor)?;
                }
                Opcode::CallSpread => {
                    self.check_eval_break(floor)?;
                    self.op_call_spread(floor)?;
                }
                Opcode::Return => {
                    if let Some(outcome) = self.op_return(floor) {
                        return Ok(outcome);
                    }
                }
                Opcode::Yield => return Ok(self.op_yield()),
                Opcode::MakeClosure => {
                    let k = self.fetch_u16();
                    self.op_make_closure(k);
                }
                Opcode::MakeList => {
                    let n = self.fetch_u8();
                    self.op_make_list(n as usize);
                }
                Opcode::MakeTuple => {
                    let n = self.fetch_u8();
                    self.op_make_tuple(n as usize);
                }
                Opcode::MakeTable => self.op_make_table(),
                Opcode::MakeClass => {
                    let k = self.fetch_u16();
                    self.op_make_class(k);
                }
                Opcode::Inherit => self.op_inherit(floor)?,
                Opcode::Method => {
                    let k = self.fetch_u16();
                    self.op_method(k);
                }
                Opcode::BindMethod => {
                    let k = self.fetch_u16();
                    self.op_bind_method(k, floor)?;
                }
                Opcode::ListAppend => self.op_list_append(),
                Opcode::ListExtend => self.op_list_extend(floor)?,
                Opcode::ListToTuple => self.op_list_to_tuple(),
                Opcode::ForPrep => self.op_for_prep(floor)?,
                Opcode::ForIter => {
                    let off = self.fetch_i16();
                    self.op_for_iter(off, floor)?;
                }
                Opcode::TryPush => {
                    let (h, e) = self.fetch_u16_u16();
                    self.op_try_push(h, e);
                }
                Opcode::TryPop => self.op_try_pop(),
                Opcode::Raise => {
                    let v = self.pop();
                    self.do_raise(v, floor)?;
                }
                Opcode::EnsureEnter => {}
                Opcode::EnsureExit => self.op_ensure_exit(floor)?,
                Opcode::Unpack => {
                    let n = self.fetch_u8();
                    self.op_unpack(n as usize, floor)?;
                }
                Opcode::Spread => self.op_spread(floor)?,
                Opcode::Import => {
                    let k = self.fetch_u16();
                    self.op_import(k, floor)?;
                }
                Opcode::ImportAs => {
                    let (p, a) = self.fetch_u16_u16();
                    self.op_import_as(p, a, floor)?;
                }
                Opcode::ImportFrom => {
                    let k = self.fetch_u16();
                    self.op_import_from(k, floor)?;
                }
            }

            if self.heap.should_collect() {
                self.collect_garbage();
            }
        }
    }

    fn binary_opcode_dunder(op: Opcode) -> &'static str {
        match op {
            Opcode::Add => "__add__",
            Opcode::Sub => "__sub__",
            Opcode::Mul => "__mul__",
            Opcode::Div => "__div__",
            Opcode::Mod => "__mod__",
            Opcode::Pow => "__pow__",
            _ => unreachable!("only arithmetic opcodes with an overload fall back to a dunder"),
        }
    }
}

fn _assert_binary_op_variants_covered(op: BinaryOp) {
    // Keeps `binary_opcode` (compiler) and this VM in sync if `BinaryOp` ever grows a variant.
    match op {
        BinaryOp::Add
        | BinaryOp::Sub
        | BinaryOp::Mul
        | BinaryOp::Div
        | BinaryOp::Mod
        | BinaryOp::Pow
        | BinaryOp::BAnd
        | BinaryOp::BOr
        | BinaryOp::BXor
        | BinaryOp::Shl
        | BinaryOp::Shr
        | BinaryOp::Eq
        | BinaryOp::Neq
        | BinaryOp::Lt
        | BinaryOp::Le
        | BinaryOp::Gt
        | BinaryOp::Ge
        | BinaryOp::Is => {}
    }
}

#[allow(unused)]
fn _unused_no_imports_reference() -> Box<dyn ImportCallback> {
    Box::new(NoImports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler;
    use crate::parser::Parser;

    // Top-level `return` is a parse error (no function to return from), so these programs
    // bind their result to a top-level `var`, which the compiler treats as a global on the
    // core module (`depth == 0` in `Compiler::declare_and_define`) rather than a local.
    fn run_source(src: &str) -> (Vm, Result<Value, Value>) {
        let mut vm = Vm::new(Config::new(), Box::new(NoImports), Box::new(|_: &crate::error::JStarError| {}));
        let ast = Parser::new(src, "test.jsr").parse_program().expect("parses");
        let main = compiler::compile(&ast, &mut vm.heap, "test.jsr", "<main>").expect("compiles");
        let result = vm.interpret_main(main);
        (vm, result)
    }

    #[test]
    fn runs_a_trivial_arithmetic_program() {
        let (mut vm, result) = run_source("var x = 1 + 2 * 3");
        assert!(result.is_ok());
        let core = vm.core_module();
        assert_eq!(vm.get_global(core, "x"), Some(Value::Number(7.0)));
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        let (mut vm, result) = run_source(
            "fun counter()\n  var n = 0\n  fun inc()\n    n = n + 1\n    return n\n  end\n  return inc\nend\nvar c = counter()\nvar r1 = c()\nvar r2 = c()",
        );
        assert!(result.is_ok());
        let core = vm.core_module();
        assert_eq!(vm.get_global(core, "r2"), Some(Value::Number(2.0)));
    }
}
