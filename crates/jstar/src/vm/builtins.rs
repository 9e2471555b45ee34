//! Built-in exception hierarchy constructed directly on the heap at startup.
//!
//! The standard library itself is out of scope (`sys`/`io`/`math`/`re`/`debug` are
//! Non-goals), but `try`/`except`/`raise` is core language surface, and the `msg` entry in
//! [`crate::intern::StaticStr`] is the one piece of the corpus that already assumes raised
//! objects carry a message field. Rather than leave every runtime type error as an unnamed
//! bare value with nothing for `except e is TypeError` to match against, a small built-in
//! class tree is installed directly as heap objects (no J* source involved) the way a C
//! embedding API typically seeds a handful of "prelude" globals before the first script runs.

use crate::embed::NativeResult;
use crate::heap::{Heap, HeapId, Obj};
use crate::types::{Class, Instance, NativeFn};
use crate::value::Value;

use super::Vm;

/// Heap ids of the built-in exception classes, registered as globals of the core module so
/// guest code can both raise (`raise TypeError("msg")`, via the native `construct` bound on
/// `Exception` below) and match (`except e is TypeError`) against them without any
/// source-level prelude.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinClasses {
    pub exception: HeapId,
    pub type_error: HeapId,
    pub name_error: HeapId,
    pub index_error: HeapId,
    pub import_error: HeapId,
    pub arithmetic_error: HeapId,
    pub interrupted_exception: HeapId,
}

fn define_class(heap: &mut Heap, core_module: HeapId, name: &str, superclass: Option<HeapId>) -> HeapId {
    let name_id = heap.intern(name);
    let class = Class::new(name_id, superclass);
    let class_id = heap.alloc(Obj::Class(class));
    let key = Value::Obj(name_id);
    match heap.get_mut(core_module) {
        Obj::Module(m) => m.set_global(key, Value::Obj(class_id)),
        _ => unreachable!("core_module always names an Obj::Module"),
    }
    class_id
}

/// `construct(this, msg)` bound natively on `Exception`, inherited by every built-in subclass
/// through the same `lookup_method_by_id` superclass walk a guest-defined `construct` would
/// use: `raise TypeError("bad value")` runs this exactly as if `TypeError` were guest J* code
/// overriding `Exception.construct` without calling `super.construct`. `call_class_constructor`
/// discards whatever a native constructor returns and pushes the instance itself, so this
/// only needs to mutate `this`'s fields, not produce a meaningful return value.
fn exception_construct(vm: &mut Vm) -> NativeResult {
    let this = vm.native_arg(0);
    let msg = if vm.native_argc() > 1 { vm.native_arg(1) } else { Value::Null };
    if let Value::Obj(id) = this {
        let msg_key = Value::Obj(vm.heap().static_id(crate::intern::StaticStr::msg));
        if let Obj::Instance(inst) = vm.heap_mut().get_mut(id) {
            inst.fields.set(msg_key, msg);
        }
    }
    vm.native_return(Value::Null)
}

/// Builds the exception hierarchy before `Vm` itself exists, so `Vm::new` can move the
/// result straight into its `builtins` field instead of needing a placeholder to overwrite.
pub(super) fn install(heap: &mut Heap, core_module: HeapId) -> BuiltinClasses {
    let exception = define_class(heap, core_module, "Exception", None);
    let type_error = define_class(heap, core_module, "TypeError", Some(exception));
    let name_error = define_class(heap, core_module, "NameError", Some(exception));
    let index_error = define_class(heap, core_module, "IndexError", Some(exception));
    let import_error = define_class(heap, core_module, "ImportError", Some(exception));
    let arithmetic_error = define_class(heap, core_module, "ArithmeticError", Some(exception));
    let interrupted_exception = define_class(heap, core_module, "InterruptedException", Some(exception));

    let construct_name = heap.intern("construct");
    let native = NativeFn { name: construct_name, required_arity: 1, has_vararg: true, func: exception_construct };
    let native_id = heap.alloc(Obj::Native(native));
    match heap.get_mut(exception) {
        Obj::Class(c) => {
            c.methods.insert(construct_name, Value::Obj(native_id));
        }
        _ => unreachable!("just-defined class"),
    }

    BuiltinClasses { exception, type_error, name_error, index_error, import_error, arithmetic_error, interrupted_exception }
}

impl Vm {
    /// Builds `class(msg)` as a fresh `Instance`, the way a native constructor would, without
    /// going through `__call__`/`construct` dispatch.
    pub(crate) fn make_exception(&mut self, class: HeapId, msg: impl Into<String>) -> Value {
        let mut instance = Instance::new(class);
        let msg_key = Value::Obj(self.heap.static_id(crate::intern::StaticStr::msg));
        let msg_str = self.heap.intern(&msg.into());
        instance.fields.set(msg_key, Value::Obj(msg_str));
        let id = self.heap.alloc(Obj::Instance(instance));
        Value::Obj(id)
    }

    pub(crate) fn type_error(&mut self, msg: impl Into<String>) -> Value {
        self.make_exception(self.builtins.type_error, msg)
    }

    pub(crate) fn name_error(&mut self, msg: impl Into<String>) -> Value {
        self.make_exception(self.builtins.name_error, msg)
    }

    pub(crate) fn index_error(&mut self, msg: impl Into<String>) -> Value {
        self.make_exception(self.builtins.index_error, msg)
    }

    pub(crate) fn import_error(&mut self, msg: impl Into<String>) -> Value {
        self.make_exception(self.builtins.import_error, msg)
    }

    pub(crate) fn arithmetic_error(&mut self, msg: impl Into<String>) -> Value {
        self.make_exception(self.builtins.arithmetic_error, msg)
    }

    pub(crate) fn interrupted_exception(&mut self, msg: impl Into<String>) -> Value {
        self.make_exception(self.builtins.interrupted_exception, msg)
    }
}
