//! Calling convention: argument binding, the `CALL`/`INVOKE`/
//! `SUPER_INVOKE` opcodes, closure/class/method construction, and generator create/resume.
//!
//! Every callable shape funnels through [`Vm::perform_call`] once its callee value and the
//! count of values already sitting on top of the stack (which become the callee's positional
//! locals, receiver included for methods) are known. Only two things ever push a new
//! `CallFrame` and let the dispatch loop in `mod.rs` continue straight into it: an ordinary
//! closure call, and a generator resume. Everything else (natives, constructors without a
//! user `construct`, bound-method/class-callable unwrapping) resolves synchronously within
//! the opcode that triggered it.

use crate::heap::{HeapId, Obj};
use crate::intern::StaticStr;
use crate::types::{Class, Closure, Function, Generator, GeneratorState, Instance, Tuple, Upvalue};
use crate::value::Value;

use super::frame::CallFrame;
use super::{RunOutcome, Vm};

pub(crate) enum GeneratorStep {
    Yielded(Value),
    Finished,
}

impl Vm {
    // ---- upvalues ----

    fn current_closure_upvalue(&self, idx: u8) -> HeapId {
        let frame = self.frames.last().expect("active frame");
        match self.heap.get(frame.closure) {
            Obj::Closure(c) => c.upvalues[idx as usize],
            _ => unreachable!("CallFrame::closure always names an Obj::Closure"),
        }
    }

    pub(crate) fn read_upvalue(&self, idx: u8) -> Value {
        let up_id = self.current_closure_upvalue(idx);
        match self.heap.get(up_id) {
            Obj::Upvalue(Upvalue::Open { stack_slot }) => self.stack[*stack_slot],
            Obj::Upvalue(Upvalue::Closed(v)) => *v,
            _ => unreachable!("closure upvalue slots always name an Obj::Upvalue"),
        }
    }

    pub(crate) fn write_upvalue(&mut self, idx: u8, v: Value) {
        let up_id = self.current_closure_upvalue(idx);
        match self.heap.get_mut(up_id) {
            Obj::Upvalue(Upvalue::Open { stack_slot }) => {
                let slot = *stack_slot;
                self.stack[slot] = v;
            }
            Obj::Upvalue(u @ Upvalue::Closed(_)) => *u = Upvalue::Closed(v),
            _ => unreachable!("closure upvalue slots always name an Obj::Upvalue"),
        }
    }

    fn capture_upvalue(&mut self, stack_slot: usize) -> HeapId {
        let split = self.open_upvalues.partition_point(|&id| match self.heap.get(id) {
            Obj::Upvalue(Upvalue::Open { stack_slot: s }) => *s < stack_slot,
            _ => unreachable!("open_upvalues only ever holds open Obj::Upvalue ids"),
        });
        if let Some(&id) = self.open_upvalues.get(split) {
            if matches!(self.heap.get(id), Obj::Upvalue(Upvalue::Open { stack_slot: s }) if *s == stack_slot) {
                return id;
            }
        }
        let id = self.heap.alloc(Obj::Upvalue(Upvalue::Open { stack_slot }));
        self.open_upvalues.insert(split, id);
        id
    }

    /// Closes every open upvalue at or above `from_slot`: used both by `CLOSE_UPVALUE` for a single exiting local and by frame
    /// unwinding (return, raise) for an entire frame's worth at once.
    pub(crate) fn close_upvalues_from(&mut self, from_slot: usize) {
        let split = self.open_upvalues.partition_point(|&id| match self.heap.get(id) {
            Obj::Upvalue(Upvalue::Open { stack_slot }) => *stack_slot < from_slot,
            _ => unreachable!("open_upvalues only ever holds open Obj::Upvalue ids"),
        });
        let closing: Vec<HeapId> = self.open_upvalues.split_off(split);
        for id in closing {
            let slot = match self.heap.get(id) {
                Obj::Upvalue(Upvalue::Open { stack_slot }) => *stack_slot,
                _ => unreachable!(),
            };
            let value = self.stack[slot];
            if let Obj::Upvalue(u) = self.heap.get_mut(id) {
                *u = Upvalue::Closed(value);
            }
        }
    }

    /// `CLOSE_UPVALUE` is emitted in place of `POP` for a captured local leaving scope:
    /// it still has to remove the slot from the value stack, it just also
    /// detaches any open upvalue pointing at it first.
    pub(crate) fn close_one_upvalue(&mut self) {
        let slot = self.stack.len() - 1;
        self.close_upvalues_from(slot);
        self.pop();
    }

    // ---- closures ----

    pub(crate) fn op_make_closure(&mut self, proto_k: u16) {
        let function = {
            let code = self.current_code();
            match &code.consts[proto_k as usize] {
                crate::bytecode::Const::Proto(f) => (**f).clone(),
                _ => unreachable!("MAKE_CLOSURE's operand always names a Const::Proto"),
            }
        };
        let count = self.fetch_u8();
        let frame_base = self.frames.last().expect("active frame").base;
        let mut upvalues = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let from_parent_local = self.fetch_u8() != 0;
            let index = self.fetch_u8();
            let id = if from_parent_local {
                self.capture_upvalue(frame_base + index as usize)
            } else {
                self.current_closure_upvalue(index)
            };
            upvalues.push(id);
        }
        let module = match self.heap.get(self.frames.last().unwrap().closure) {
            Obj::Closure(c) => c.module,
            _ => unreachable!(),
        };
        let function_id = self.heap.alloc(Obj::Function(function));
        let closure = Closure::new(function_id, upvalues, module);
        let closure_id = self.heap.alloc(Obj::Closure(closure));
        self.push(Value::Obj(closure_id));
    }

    // ---- classes ----

    pub(crate) fn op_make_class(&mut self, name_k: u16) {
        let name_id = self.string_const(name_k);
        let class = Class::new(name_id, None);
        let id = self.heap.alloc(Obj::Class(class));
        self.push(Value::Obj(id));
    }

    /// Pops the superclass value (a fresh `GET_LOCAL` copy per the compiler's `class_decl`)
    /// and records it on the class value still underneath. The declared zero stack effect in
    /// `Opcode::fixed_stack_effect` is a soft hint, same as `CLOSE_UPVALUE`'s: the real effect
    /// is -1.
    pub(crate) fn op_inherit(&mut self, floor: usize) -> Result<(), Value> {
        let superclass_val = self.pop();
        let superclass_id = match superclass_val {
            Value::Obj(id) if matches!(self.heap.get(id), Obj::Class(_)) => id,
            _ => {
                let exc = self.type_error("Superclass must be a Class");
                return self.handle_raise(exc, floor);
            }
        };
        let class_val = self.peek(0);
        if let Value::Obj(class_id) = class_val {
            if let Obj::Class(c) = self.heap.get_mut(class_id) {
                c.superclass = Some(superclass_id);
            }
        }
        Ok(())
    }

    pub(crate) fn op_method(&mut self, name_k: u16) {
        let name_id = self.string_const(name_k);
        let method_val = self.pop();
        let class_val = self.peek(0);
        if let Value::Obj(class_id) = class_val {
            if let Obj::Class(c) = self.heap.get_mut(class_id) {
                c.methods.insert(name_id, method_val);
            }
        }
    }

    /// Never emitted by this compiler (native method stubs compile to `METHOD`, same as any
    /// other method body, with a `LoadNull` placeholder closure); kept for format/dispatch
    /// completeness and mirrors `METHOD`'s mechanics exactly. The embedding API's actual
    /// native-binding entry point is [`Vm::bind_native_method`] in `embed.rs`, called directly
    /// by the host rather than through bytecode.
    pub(crate) fn op_bind_method(&mut self, name_k: u16, _floor: usize) -> Result<(), Value> {
        self.op_method(name_k);
        Ok(())
    }

    pub(crate) fn lookup_method(&self, class_id: HeapId, name: StaticStr) -> Option<Value> {
        let name_id = self.heap.static_id(name);
        self.lookup_method_by_id(class_id, name_id)
    }

    pub(crate) fn lookup_method_by_id(&self, mut class_id: HeapId, name_id: HeapId) -> Option<Value> {
        loop {
            let class = match self.heap.get(class_id) {
                Obj::Class(c) => c,
                _ => unreachable!("lookup_method_by_id is only ever called with a Class id"),
            };
            if let Some(&v) = class.methods.get(&name_id) {
                return Some(v);
            }
            class_id = class.superclass?;
        }
    }

    /// Walks `instance`'s class chain looking for `class_id`, the way `IS` matches an
    /// exception's runtime type against an `except` arm's class expression.
    pub(crate) fn instance_is_a(&self, instance_class: HeapId, class_id: HeapId) -> bool {
        let mut cur = Some(instance_class);
        while let Some(id) = cur {
            if id == class_id {
                return true;
            }
            cur = match self.heap.get(id) {
                Obj::Class(c) => c.superclass,
                _ => None,
            };
        }
        false
    }

    // ---- calling convention ----

    fn string_const(&mut self, k: u16) -> HeapId {
        match self.const_value(k) {
            Value::Obj(id) => id,
            _ => unreachable!("string-constant operands always resolve to an interned Obj::Str"),
        }
    }

    fn arity_error(&mut self, name: HeapId, required: usize, has_vararg: bool, got: usize) -> Value {
        let name = self.heap.str_of(name).to_owned();
        let qualifier = if has_vararg { "at least " } else { "" };
        self.type_error(format!("Function {name}() expected {qualifier}{required} arguments, got {got}"))
    }

    fn bind_args(&mut self, function: &Function, args: Vec<Value>) -> Result<Vec<Value>, Value> {
        let required = function.required_arity as usize;
        let max_positional = function.arity();
        let argc = args.len();
        if argc < required || (!function.has_vararg && argc > max_positional) {
            return Err(self.arity_error(function.name, required, function.has_vararg, argc));
        }
        let mut locals = Vec::with_capacity(function.num_locals);
        locals.extend_from_slice(&args[..required.min(argc)]);
        for (i, default) in function.defaults.iter().enumerate() {
            let pos = required + i;
            locals.push(args.get(pos).copied().unwrap_or(*default));
        }
        if function.has_vararg {
            let rest = if argc > max_positional { args[max_positional..].to_vec() } else { Vec::new() };
            let tuple_id = self.heap.alloc(Obj::Tuple(Tuple::new(rest)));
            locals.push(Value::Obj(tuple_id));
        }
        while locals.len() < function.num_locals {
            locals.push(Value::Null);
        }
        Ok(locals)
    }

    /// Pops `total_argc` raw values off the stack and binds them against `function_id`'s
    /// parameter list.
    fn prepare_locals(&mut self, function_id: HeapId, total_argc: usize) -> Result<Vec<Value>, Value> {
        let function = match self.heap.get(function_id) {
            Obj::Function(f) => f.clone(),
            _ => unreachable!("prepare_locals is only ever called with a Function id"),
        };
        let args_start = self.stack.len() - total_argc;
        let args = self.stack.split_off(args_start);
        self.bind_args(&function, args)
    }

    /// Entered by a plain `CALL` (callee already stripped off the stack by the caller) and by
    /// `INVOKE`/`SUPER_INVOKE` (receiver is locals slot 0, no separate callee slot to strip).
    /// Builds this call's locals, then either pushes a new frame (ordinary closure — the
    /// dispatch loop just continues straight into it) or allocates a suspended `Generator`
    /// object and leaves it as this call's immediate result.
    fn call_closure(&mut self, closure_id: HeapId, total_argc: usize, floor: usize) -> Result<(), Value> {
        let function_id = match self.heap.get(closure_id) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let is_generator = match self.heap.get(function_id) {
            Obj::Function(f) => f.is_generator,
            _ => unreachable!(),
        };
        let locals = match self.prepare_locals(function_id, total_argc) {
            Ok(l) => l,
            Err(exc) => return self.handle_raise(exc, floor),
        };
        if is_generator {
            let mut generator = Generator::new(closure_id);
            generator.saved_stack = locals;
            generator.state = GeneratorState::New;
            let id = self.heap.alloc(Obj::Generator(generator));
            self.push(Value::Obj(id));
            return Ok(());
        }
        if self.frames.len() >= self.config.max_call_depth {
            let exc = self.make_exception(self.builtins.exception, "Stack overflow");
            return self.handle_raise(exc, floor);
        }
        let base = self.stack.len();
        self.stack.extend(locals);
        self.tracer.on_call(closure_id, self.frames.len() + 1);
        self.frames.push(CallFrame::new(closure_id, base));
        Ok(())
    }

    fn call_native(&mut self, native: crate::types::NativeFn, total_argc: usize, floor: usize) -> Result<(), Value> {
        let required = native.required_arity as usize;
        if total_argc < required || (!native.has_vararg && total_argc > required) {
            let exc = self.arity_error(native.name, required, native.has_vararg, total_argc);
            return self.handle_raise(exc, floor);
        }
        let base = self.stack.len() - total_argc;
        self.native_bases.push(base);
        let result = (native.func)(self);
        self.native_bases.pop();
        match result {
            crate::embed::NativeResult::Ok => Ok(()),
            crate::embed::NativeResult::Err => {
                let exc = self.pop();
                self.handle_raise(exc, floor)
            }
        }
    }

    fn call_class_constructor(&mut self, class_id: HeapId, argc: usize, floor: usize) -> Result<(), Value> {
        let instance_id = self.heap.alloc(Obj::Instance(Instance::new(class_id)));
        let instance_val = Value::Obj(instance_id);
        match self.lookup_method(class_id, StaticStr::construct) {
            Some(ctor) => {
                let insert_at = self.stack.len() - argc;
                self.stack.insert(insert_at, instance_val);
                let frames_before = self.frames.len();
                self.perform_call(ctor, argc + 1, floor)?;
                if self.frames.len() > frames_before {
                    self.frames.last_mut().unwrap().constructing = Some(instance_val);
                } else {
                    self.pop();
                    self.push(instance_val);
                }
                Ok(())
            }
            None => {
                if argc != 0 {
                    let exc = self.type_error(format!(
                        "{} has no constructor and takes no arguments",
                        self.heap.str_of(match self.heap.get(class_id) { Obj::Class(c) => c.name, _ => unreachable!() })
                    ));
                    return self.handle_raise(exc, floor);
                }
                self.push(instance_val);
                Ok(())
            }
        }
    }

    /// Dispatches a callee value against `total_argc` already-prepared locals sitting on top
    /// of the stack.
    pub(crate) fn perform_call(&mut self, callee: Value, total_argc: usize, floor: usize) -> Result<(), Value> {
        match callee {
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Closure(_) => self.call_closure(id, total_argc, floor),
                Obj::Native(native) => {
                    let native = *native;
                    self.call_native(native, total_argc, floor)
                }
                Obj::Class(_) => self.call_class_constructor(id, total_argc, floor),
                Obj::BoundMethod(bm) => {
                    let (receiver, method) = (bm.receiver, bm.method);
                    let insert_at = self.stack.len() - total_argc;
                    self.stack.insert(insert_at, receiver);
                    self.perform_call(method, total_argc + 1, floor)
                }
                Obj::Instance(inst) => {
                    let class_id = inst.class;
                    match self.lookup_method(class_id, StaticStr::__call__) {
                        Some(m) => {
                            let insert_at = self.stack.len() - total_argc;
                            self.stack.insert(insert_at, callee);
                            self.perform_call(m, total_argc + 1, floor)
                        }
                        None => {
                            self.stack.truncate(self.stack.len() - total_argc);
                            let exc = self.type_error("Object is not callable");
                            self.handle_raise(exc, floor)
                        }
                    }
                }
                _ => {
                    self.stack.truncate(self.stack.len() - total_argc);
                    let name = self.value_type_name(callee);
                    let exc = self.type_error(format!("{name} is not callable"));
                    self.handle_raise(exc, floor)
                }
            },
            _ => {
                self.stack.truncate(self.stack.len() - total_argc);
                let name = self.value_type_name(callee);
                let exc = self.type_error(format!("{name} is not callable"));
                self.handle_raise(exc, floor)
            }
        }
    }

    pub(crate) fn op_call(&mut self, argc: usize, floor: usize) -> Result<(), Value> {
        let callee_slot = self.stack.len() - argc - 1;
        let callee = self.stack.remove(callee_slot);
        self.perform_call(callee, argc, floor)
    }

    pub(crate) fn op_invoke(&mut self, name_k: u16, argc: usize, floor: usize) -> Result<(), Value> {
        let name_id = self.string_const(name_k);
        let base = self.stack.len() - argc - 1;
        let receiver = self.stack[base];
        if let Value::Obj(id) = receiver {
            match self.heap.get(id) {
                Obj::Instance(inst) => {
                    let class_id = inst.class;
                    if let Some(field) = inst.fields.get(Value::Obj(name_id)) {
                        self.stack.remove(base);
                        return self.perform_call(field, argc, floor);
                    }
                    if let Some(m) = self.lookup_method_by_id(class_id, name_id) {
                        return self.perform_call(m, argc + 1, floor);
                    }
                    let name = self.heap.str_of(name_id).to_owned();
                    let exc = self.name_error(format!("Unknown method or field '{name}'"));
                    return self.handle_raise(exc, floor);
                }
                Obj::Class(_) => {
                    if let Some(m) = self.lookup_method_by_id(id, name_id) {
                        self.stack.remove(base);
                        return self.perform_call(m, argc, floor);
                    }
                }
                _ => {}
            }
        }
        let name = self.heap.str_of(name_id).to_owned();
        let type_name = self.value_type_name(receiver);
        let exc = self.type_error(format!("'{type_name}' has no method '{name}'"));
        self.handle_raise(exc, floor)
    }

    /// `super.m(args)` / `super(args)`: the superclass value rides on top of the stack (a
    /// fresh `GET_LOCAL "super"` copy, per `super_call`'s codegen), with `[receiver,
    /// args...]` directly beneath it, already shaped exactly like `INVOKE`'s operand region.
    pub(crate) fn op_super_invoke(&mut self, name_k: u16, argc: usize, floor: usize) -> Result<(), Value> {
        let name_id = self.string_const(name_k);
        let superclass_val = self.pop();
        let class_id = match superclass_val {
            Value::Obj(id) if matches!(self.heap.get(id), Obj::Class(_)) => id,
            _ => unreachable!("`super` always resolves to a Class value"),
        };
        match self.lookup_method_by_id(class_id, name_id) {
            Some(m) => self.perform_call(m, argc + 1, floor),
            None => {
                let name = self.heap.str_of(name_id).to_owned();
                let exc = self.name_error(format!("Unknown method '{name}' on superclass"));
                self.handle_raise(exc, floor)
            }
        }
    }

    pub(crate) fn op_return(&mut self, floor: usize) -> Option<RunOutcome> {
        let mut value = self.pop();
        let frame = self.frames.pop().expect("RETURN always has an active frame");
        if let Some(v) = frame.constructing {
            value = v;
        }
        self.close_upvalues_from(frame.base);
        self.stack.truncate(frame.base);
        self.tracer.on_return(value, self.frames.len());
        if self.frames.len() <= floor {
            Some(RunOutcome::Returned(value))
        } else {
            self.push(value);
            None
        }
    }

    /// Suspends the top frame in place (stack and frame both left intact) and returns control
    /// to whichever `run` call is driving this generator's resume; that caller (see
    /// [`Vm::resume_generator`]) is the one that actually splices the frame back out into the
    /// generator's saved state.
    pub(crate) fn op_yield(&mut self) -> RunOutcome {
        let value = self.pop();
        RunOutcome::Yielded(value)
    }

    /// Drives one step of `generator_id`: resumes it at `resume_ip` with `sent` as the value
    /// of the currently-suspended `yield` expression (ignored on the very first resume), runs
    /// until the next `YIELD`/`RETURN`/uncaught raise, and updates the generator's saved state
    /// accordingly.
    pub(crate) fn resume_generator(&mut self, generator_id: HeapId, sent: Value, floor: usize) -> Result<GeneratorStep, Value> {
        let state = match self.heap.get(generator_id) {
            Obj::Generator(g) => g.state,
            _ => unreachable!("resume_generator is only ever called with a Generator id"),
        };
        if state == GeneratorState::Finished {
            return Ok(GeneratorStep::Finished);
        }
        let (closure_id, resume_ip, saved_stack, handlers) = match self.heap.get_mut(generator_id) {
            Obj::Generator(g) => {
                g.state = GeneratorState::Running;
                (g.closure, g.resume_ip, std::mem::take(&mut g.saved_stack), std::mem::take(&mut g.saved_frame.handlers))
            }
            _ => unreachable!(),
        };
        let base = self.stack.len();
        self.stack.extend(saved_stack);
        let mut frame = CallFrame::new(closure_id, base);
        frame.ip = resume_ip;
        frame.handlers = handlers;
        self.frames.push(frame);
        if state != GeneratorState::New {
            self.push(sent);
        }
        let new_floor = self.frames.len() - 1;
        match self.run(new_floor) {
            Ok(RunOutcome::Returned(_)) => {
                if let Obj::Generator(g) = self.heap.get_mut(generator_id) {
                    g.state = GeneratorState::Finished;
                }
                Ok(GeneratorStep::Finished)
            }
            Ok(RunOutcome::Yielded(v)) => {
                let frame = self.frames.pop().expect("op_yield leaves its frame for the resume driver");
                let tail = self.stack.split_off(frame.base);
                if let Obj::Generator(g) = self.heap.get_mut(generator_id) {
                    g.saved_stack = tail;
                    g.saved_frame.handlers = frame.handlers;
                    g.resume_ip = frame.ip;
                    g.state = GeneratorState::Suspended;
                }
                Ok(GeneratorStep::Yielded(v))
            }
            Err(exc) => {
                if let Obj::Generator(g) = self.heap.get_mut(generator_id) {
                    g.state = GeneratorState::Finished;
                }
                let _ = floor;
                Err(exc)
            }
        }
    }

    /// Synchronously resolves a dunder-method call to its final value by recursing into
    /// [`Vm::run`] when the callee is a guest closure, rather than just pushing its frame and
    /// letting the main dispatch loop continue. Used by
    /// call sites — `compare.rs`'s `NEQ`, `collections.rs`'s iterator protocol — that need the
    /// result in hand before deciding what to do next, unlike a plain binary/index dunder
    /// whose result can simply be left for `RETURN` to place on the stack.
    pub(crate) fn perform_call_sync(&mut self, callee: Value, argc: usize, floor: usize) -> Result<Value, Value> {
        let frames_before = self.frames.len();
        self.perform_call(callee, argc, floor)?;
        if self.frames.len() > frames_before {
            match self.run(frames_before)? {
                RunOutcome::Returned(v) | RunOutcome::Yielded(v) => Ok(v),
            }
        } else {
            Ok(self.pop())
        }
    }

    // ---- embedding entry points ----

    /// Runs a freshly-compiled top-level script function to completion.
    pub fn interpret_main(&mut self, main: Function) -> Result<Value, Value> {
        let module = self.core_module;
        let function_id = self.heap.alloc(Obj::Function(main));
        let closure = Closure::new(function_id, Vec::new(), module);
        let closure_id = self.heap.alloc(Obj::Closure(closure));
        self.call_value(Value::Obj(closure_id), &[])
    }

    /// Calls any callable guest value with host-supplied arguments, driving it to completion
    ///. Used for the top-level script entry
    /// point and for host-initiated re-entry into guest callbacks.
    pub fn call_value(&mut self, callee: Value, args: &[Value]) -> Result<Value, Value> {
        for &a in args {
            self.push(a);
        }
        let floor = self.frames.len();
        self.perform_call(callee, args.len(), floor)?;
        if self.frames.len() > floor {
            self.run(floor)
        } else {
            Ok(self.pop())
        }
        .map(|outcome| match outcome {
            RunOutcome::Returned(v) => v,
            RunOutcome::Yielded(v) => v,
        })
    }
}
