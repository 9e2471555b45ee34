//! Embedding API: the stack-oriented surface a host uses to register native
//! functions, read/write globals, and drive the VM without touching its internals directly.
//!
//! Native callees run synchronously inside
//! `CALL`/`INVOKE`. A [`NativeFnPtr`](crate::types::NativeFn) receives only `&mut Vm`; it
//! reads its arguments with [`Vm::native_arg`]/[`Vm::native_argc`], relative to the base
//! [`Vm::call_native`](super::vm::call) pushed onto `native_bases` for this invocation, and
//! finishes by calling exactly one of [`Vm::native_return`]/[`Vm::native_raise`] and
//! returning the [`NativeResult`] it produced — both leave exactly one value on the stack in
//! place of the arguments, success or failure.

use crate::heap::{HeapId, Obj};
use crate::types::{NativeFn, NativeFnPtr};
use crate::value::Value;
use crate::vm::Vm;

/// What a native function call produced: success (return value already pushed via
/// [`Vm::native_return`]) or failure (exception already pushed via [`Vm::native_raise`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeResult {
    Ok,
    Err,
}

impl Vm {
    fn native_base(&self) -> usize {
        *self.native_bases.last().expect("native_arg/native_argc called outside a native function")
    }

    /// Number of arguments passed to the currently-running native call.
    pub fn native_argc(&self) -> usize {
        self.stack.len() - self.native_base()
    }

    /// The `i`th argument (0-based) to the currently-running native call.
    pub fn native_arg(&self, i: usize) -> Value {
        let base = self.native_base();
        self.stack[base + i]
    }

    /// Ends a native call successfully, leaving `v` as the call's result.
    pub fn native_return(&mut self, v: Value) -> NativeResult {
        let base = self.native_base();
        self.stack.truncate(base);
        self.stack.push(v);
        NativeResult::Ok
    }

    /// Ends a native call by raising `exc` as a guest exception.
    pub fn native_raise(&mut self, exc: Value) -> NativeResult {
        let base = self.native_base();
        self.stack.truncate(base);
        self.stack.push(exc);
        NativeResult::Err
    }

    /// Convenience over [`Vm::native_raise`] for the common "wrong argument type" case.
    pub fn native_type_error(&mut self, msg: impl Into<String>) -> NativeResult {
        let exc = self.type_error(msg);
        self.native_raise(exc)
    }

    fn native_fn(&mut self, name: &str, required_arity: u8, has_vararg: bool, func: NativeFnPtr) -> NativeFn {
        let name_id = self.heap.intern(name);
        NativeFn { name: name_id, required_arity, has_vararg, func }
    }

    /// Registers a global native function in `module`. `module` is usually [`Vm::core_module`] for a VM-wide builtin.
    pub fn register_native(&mut self, module: HeapId, name: &str, required_arity: u8, has_vararg: bool, func: NativeFnPtr) {
        let native = self.native_fn(name, required_arity, has_vararg, func);
        let native_id = self.heap.alloc(Obj::Native(native));
        let key = Value::Obj(native.name);
        match self.heap.get_mut(module) {
            Obj::Module(m) => m.set_global(key, Value::Obj(native_id)),
            _ => unreachable!("register_native always targets a module"),
        }
    }

    /// Binds a native function as a method on `class`, the host-side counterpart of `METHOD` for classes defined entirely in Rust.
    pub fn bind_native_method(&mut self, class: HeapId, name: &str, required_arity: u8, has_vararg: bool, func: NativeFnPtr) {
        let native = self.native_fn(name, required_arity, has_vararg, func);
        let native_id = self.heap.alloc(Obj::Native(native));
        match self.heap.get_mut(class) {
            Obj::Class(c) => {
                c.methods.insert(native.name, Value::Obj(native_id));
            }
            _ => unreachable!("bind_native_method always targets a class"),
        }
    }

    /// Reads a named global from `module`.
    pub fn get_global(&mut self, module: HeapId, name: &str) -> Option<Value> {
        let key = Value::Obj(self.heap.intern(name));
        match self.heap.get(module) {
            Obj::Module(m) => m.get_global(key),
            _ => unreachable!("get_global always targets a module"),
        }
    }

    /// Writes a named global on `module`.
    pub fn set_global(&mut self, module: HeapId, name: &str, v: Value) {
        let key = Value::Obj(self.heap.intern(name));
        match self.heap.get_mut(module) {
            Obj::Module(m) => m.set_global(key, v),
            _ => unreachable!("set_global always targets a module"),
        }
    }

    /// Calls `m` by name on `receiver` with `args`, the host-facing analogue of `INVOKE`.
    pub fn call_method(&mut self, receiver: Value, method: &str, args: &[Value]) -> Result<Value, Value> {
        if let Value::Obj(id) = receiver {
            let name_id = self.heap.intern(method);
            if let Obj::Instance(inst) = self.heap.get(id) {
                let class_id = inst.class;
                if let Some(m) = self.lookup_method_by_id(class_id, name_id) {
                    let mut call_args = Vec::with_capacity(args.len() + 1);
                    call_args.push(receiver);
                    call_args.extend_from_slice(args);
                    return self.call_value(m, &call_args);
                }
            }
        }
        let exc = self.name_error(format!("No method '{method}' on this value"));
        Err(exc)
    }

    /// Ensures the value stack can grow by `n` more pushes without reallocating mid-call.
    pub fn ensure_stack_capacity(&mut self, n: usize) {
        self.stack.reserve(n);
    }

    /// Forces an immediate mark-and-sweep collection, independent of whether `Heap::should_collect` has tripped.
    pub fn collect(&mut self) {
        self.collect_garbage();
    }

    /// Signals the eval-break flag as if a signal handler had fired, for a host driving the VM from its own thread without a separate handle.
    pub fn request_eval_break(&self) {
        self.eval_break_handle().store(true, std::sync::atomic::Ordering::Relaxed);
    }

    /// A host-facing textual rendering of any value, used to report unhandled exceptions and
    /// in REPL echoing. Does not dispatch a guest `__string__` override; it reads
    /// only fields the VM itself defines (an exception's `msg`, a class's `name`).
    pub fn describe(&self, v: Value) -> String {
        match v {
            Value::Number(n) => format!("{n}"),
            Value::Bool(b) => format!("{b}"),
            Value::Null => "null".to_owned(),
            Value::Handle(_) => "<handle>".to_owned(),
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Str(s) => s.as_str().to_owned(),
                Obj::List(l) => format!("[{}]", l.items.iter().map(|v| self.describe(*v)).collect::<Vec<_>>().join(", ")),
                Obj::Tuple(t) => format!("({})", t.items.iter().map(|v| self.describe(*v)).collect::<Vec<_>>().join(", ")),
                Obj::Class(c) => format!("<class {}>", self.heap.str_of(c.name)),
                Obj::Function(f) => format!("<fn {}>", self.heap.str_of(f.name)),
                Obj::Closure(c) => {
                    let name = match self.heap.get(c.function) {
                        Obj::Function(f) => self.heap.str_of(f.name),
                        _ => "?",
                    };
                    format!("<fn {name}>")
                }
                Obj::Native(n) => format!("<native fn {}>", self.heap.str_of(n.name)),
                Obj::Module(m) => format!("<module {}>", self.heap.str_of(m.name)),
                Obj::Instance(inst) => {
                    let class_name = match self.heap.get(inst.class) {
                        Obj::Class(c) => self.heap.str_of(c.name),
                        _ => "?",
                    };
                    let msg_key = Value::Obj(self.heap.static_id(crate::intern::StaticStr::msg));
                    match inst.fields.get(msg_key) {
                        Some(Value::Obj(msg_id)) => format!("{class_name}: {}", self.heap.str_of(msg_id)),
                        _ => format!("<{class_name} instance>"),
                    }
                }
                other => format!("<{}>", other.type_name()),
            },
        }
    }
}
