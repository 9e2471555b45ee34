//! List/Tuple/Table construction, spread (`...expr`), unpack (`a, b = expr`), and the
//! `for`-loop iterator protocol.
//!
//! `MAKE_LIST`/`MAKE_TUPLE` build from a fixed `n` known at compile time. A literal
//! containing a spread element can't know its final length at compile time, so the compiler
//! instead emits an empty `MAKE_LIST` followed by a `LIST_APPEND`/`LIST_EXTEND` per element
//! (`compiler::sequence_literal`, `compiler::spread_call_args`); `SPREAD` itself only
//! normalizes whatever iterable sits on top of the stack into a concrete `List` for
//! `LIST_EXTEND`/`CALL_SPREAD` to consume.

use crate::heap::Obj;
use crate::intern::StaticStr;
use crate::types::{JList, Tuple};
use crate::value::Value;

use super::Vm;

impl Vm {
    pub(crate) fn op_make_list(&mut self, n: usize) {
        let start = self.stack.len() - n;
        let items = self.stack.split_off(start);
        let id = self.heap.alloc(Obj::List(JList::with_items(items)));
        self.push(Value::Obj(id));
    }

    pub(crate) fn op_make_tuple(&mut self, n: usize) {
        let start = self.stack.len() - n;
        let items = self.stack.split_off(start);
        let id = self.heap.alloc(Obj::Tuple(Tuple::new(items)));
        self.push(Value::Obj(id));
    }

    pub(crate) fn op_make_table(&mut self) {
        let id = self.heap.alloc(Obj::Table(crate::types::Table::new()));
        self.push(Value::Obj(id));
    }

    /// Appends the top-of-stack value to the list beneath it, left in place: a list
    /// literal with a spread element builds incrementally rather than via a fixed `n`.
    pub(crate) fn op_list_append(&mut self) {
        let value = self.pop();
        let list_val = self.peek(0);
        let Value::Obj(id) = list_val else {
            unreachable!("LIST_APPEND's operand is always a list under incremental construction");
        };
        match self.heap.get_mut(id) {
            Obj::List(l) => l.items.push(value),
            _ => unreachable!("LIST_APPEND's operand is always an Obj::List"),
        }
    }

    /// Appends every element of a `SPREAD`-normalized list to the list beneath it.
    pub(crate) fn op_list_extend(&mut self, floor: usize) -> Result<(), Value> {
        let extra = self.pop();
        let Value::Obj(extra_id) = extra else {
            unreachable!("LIST_EXTEND's operand is always SPREAD's normalized List");
        };
        let extra_items = match self.heap.get(extra_id) {
            Obj::List(l) => l.items.clone(),
            _ => unreachable!("LIST_EXTEND's operand is always an Obj::List"),
        };
        let list_val = self.peek(0);
        let Value::Obj(id) = list_val else {
            unreachable!("LIST_EXTEND's target is always a list under incremental construction");
        };
        match self.heap.get_mut(id) {
            Obj::List(l) => l.items.extend(extra_items),
            _ => unreachable!("LIST_EXTEND's target is always an Obj::List"),
        }
        let _ = floor;
        Ok(())
    }

    pub(crate) fn op_list_to_tuple(&mut self) {
        let list_val = self.pop();
        let Value::Obj(id) = list_val else {
            unreachable!("LIST_TO_TUPLE's operand is always a list under incremental construction");
        };
        let items = match self.heap.get(id) {
            Obj::List(l) => l.items.clone(),
            _ => unreachable!("LIST_TO_TUPLE's operand is always an Obj::List"),
        };
        let tuple_id = self.heap.alloc(Obj::Tuple(Tuple::new(items)));
        self.push(Value::Obj(tuple_id));
    }

    /// `f(...args)`/`o.m(...args)` (`compiler::spread_call_args`): the flattened argument
    /// list sits on top as a `List`, with the callee (or bound method, already resolved by
    /// `GET_FIELD` for a method call) directly beneath it — splice the list's elements onto
    /// the real stack and call exactly like `CALL` with the resulting runtime-known count.
    pub(crate) fn op_call_spread(&mut self, floor: usize) -> Result<(), Value> {
        let args_val = self.pop();
        let Value::Obj(args_id) = args_val else {
            unreachable!("CALL_SPREAD's operand is always spread_call_args's built List");
        };
        let items = match self.heap.get(args_id) {
            Obj::List(l) => l.items.clone(),
            _ => unreachable!("CALL_SPREAD's operand is always an Obj::List"),
        };
        let callee = self.pop();
        let argc = items.len();
        for v in items {
            self.push(v);
        }
        self.perform_call(callee, argc, floor)
    }

    /// `a, b = expr`: `expr`'s value must be a `List` or `Tuple`
    /// of exactly `n` elements. Pushes them in reverse so `unpack`'s per-target codegen
    /// (which stores and pops the top of stack once per target, first target first) consumes
    /// them in the right order.
    pub(crate) fn op_unpack(&mut self, n: usize, floor: usize) -> Result<(), Value> {
        let source = self.pop();
        let items: Option<Vec<Value>> = match source {
            Value::Obj(id) => match self.heap.get(id) {
                Obj::List(l) => Some(l.items.clone()),
                Obj::Tuple(t) => Some(t.items.to_vec()),
                _ => None,
            },
            _ => None,
        };
        match items {
            Some(items) if items.len() == n => {
                for &v in items.iter().rev() {
                    self.push(v);
                }
                Ok(())
            }
            Some(items) => {
                let exc = self.type_error(format!("Cannot unpack {} values into {} targets", items.len(), n));
                self.handle_raise(exc, floor)
            }
            None => {
                let type_name = self.value_type_name(source);
                let exc = self.type_error(format!("Cannot unpack a '{type_name}'"));
                self.handle_raise(exc, floor)
            }
        }
    }

    /// Normalizes the top-of-stack iterable into a concrete `List`:
    /// `List`/`Tuple` values pass through as a shallow copy, anything else is drained through
    /// the `__iter__`/`__next__` protocol (same dispatch `FOR_ITER` uses).
    pub(crate) fn op_spread(&mut self, floor: usize) -> Result<(), Value> {
        let source = self.pop();
        let items = match source {
            Value::Obj(id) => match self.heap.get(id) {
                Obj::List(l) => l.items.clone(),
                Obj::Tuple(t) => t.items.to_vec(),
                _ => self.drain_iterable(source, floor)?,
            },
            _ => self.drain_iterable(source, floor)?,
        };
        let id = self.heap.alloc(Obj::List(JList::with_items(items)));
        self.push(Value::Obj(id));
        Ok(())
    }

    fn drain_iterable(&mut self, iterable: Value, floor: usize) -> Result<Vec<Value>, Value> {
        let mut items = Vec::new();
        let mut state = Value::Null;
        loop {
            let next_state = self.call_iter_dunder(iterable, state, floor)?;
            if matches!(next_state, Value::Null | Value::Bool(false)) {
                return Ok(items);
            }
            items.push(self.call_next_dunder(iterable, next_state, floor)?);
            state = next_state;
        }
    }

    /// Calls `iterable.__iter__(prev)`: a `Generator` is driven
    /// directly through [`Vm::resume_generator`] rather than a dunder lookup, since it has no
    /// class of its own to carry one.
    fn call_iter_dunder(&mut self, iterable: Value, prev: Value, floor: usize) -> Result<Value, Value> {
        if let Value::Obj(id) = iterable {
            if matches!(self.heap.get(id), Obj::Generator(_)) {
                let state = match self.heap.get(id) {
                    Obj::Generator(g) => g.state,
                    _ => unreachable!(),
                };
                return Ok(Value::Bool(state != crate::types::GeneratorState::Finished));
            }
            if let Obj::Instance(inst) = self.heap.get(id) {
                let class_id = inst.class;
                if let Some(m) = self.lookup_method(class_id, StaticStr::__iter__) {
                    self.push(iterable);
                    self.push(prev);
                    return self.perform_call_sync(m, 2, floor);
                }
            }
        }
        let name = self.value_type_name(iterable);
        Err(self.type_error(format!("'{name}' is not iterable")))
    }

    fn call_next_dunder(&mut self, iterable: Value, state: Value, floor: usize) -> Result<Value, Value> {
        if let Value::Obj(id) = iterable {
            if matches!(self.heap.get(id), Obj::Generator(_)) {
                return match self.resume_generator(id, Value::Null, floor)? {
                    super::call::GeneratorStep::Yielded(v) => Ok(v),
                    super::call::GeneratorStep::Finished => {
                        unreachable!("call_iter_dunder already reported termination for a finished generator")
                    }
                };
            }
            if let Obj::Instance(inst) = self.heap.get(id) {
                let class_id = inst.class;
                if let Some(m) = self.lookup_method(class_id, StaticStr::__next__) {
                    self.push(iterable);
                    self.push(state);
                    return self.perform_call_sync(m, 2, floor);
                }
            }
        }
        unreachable!("call_next_dunder is only reached for Generator/Instance iterables");
    }

    /// Validates `iterable` supports the iterator protocol; leaves
    /// it on the stack unchanged as `@iter` — the real construction happens in `FOR_ITER`'s
    /// per-step dunder dispatch.
    pub(crate) fn op_for_prep(&mut self, floor: usize) -> Result<(), Value> {
        let iterable = self.peek(0);
        let iterable_ok = match iterable {
            Value::Obj(id) => matches!(self.heap.get(id), Obj::Generator(_) | Obj::Instance(_) | Obj::List(_) | Obj::Tuple(_) | Obj::Str(_)),
            _ => false,
        };
        if iterable_ok {
            return Ok(());
        }
        let type_name = self.value_type_name(iterable);
        let exc = self.type_error(format!("'{type_name}' is not iterable"));
        self.handle_raise(exc, floor)
    }

    /// One `for`-loop step: calls `__iter__(@iter, @state)`; `null`/
    /// `false` means the loop is finished and jumps `off` past the body, otherwise
    /// `__next__(@iter, new_state)` produces the element exposed to the loop body. `@iter`,
    /// `@state`, and the binding always sit at a fixed offset from the current stack top
    /// (`for_in_stmt`'s codegen never leaves anything else on top of them at this point).
    pub(crate) fn op_for_iter(&mut self, off: i16, floor: usize) -> Result<(), Value> {
        let top = self.stack.len();
        let iter_val = self.stack[top - 3];
        let prev_state = self.stack[top - 2];
        let new_state = match self.iter_step(iter_val, prev_state, floor) {
            Ok(s) => s,
            Err(exc) => return self.handle_raise(exc, floor),
        };
        if matches!(new_state, Value::Null | Value::Bool(false)) {
            self.jump_relative(off);
            return Ok(());
        }
        let elem = match self.next_step(iter_val, new_state, floor) {
            Ok(v) => v,
            Err(exc) => return self.handle_raise(exc, floor),
        };
        let top = self.stack.len();
        self.stack[top - 2] = new_state;
        self.stack[top - 1] = elem;
        Ok(())
    }

    /// Fast path for the built-in sequence types: the iterator state is simply the next 0-based index, with no dunder dispatch.
    fn iter_step(&mut self, iterable: Value, prev: Value, floor: usize) -> Result<Value, Value> {
        if let Value::Obj(id) = iterable {
            let len = match self.heap.get(id) {
                Obj::List(l) => Some(l.len()),
                Obj::Tuple(t) => Some(t.len()),
                Obj::Str(s) => Some(s.as_str().chars().count()),
                _ => None,
            };
            if let Some(len) = len {
                let next_idx = match prev {
                    Value::Null => 0,
                    Value::Number(n) => n as usize + 1,
                    _ => unreachable!("integer-index iteration only ever threads a Number state"),
                };
                return Ok(if next_idx < len { Value::Number(next_idx as f64) } else { Value::Bool(false) });
            }
        }
        self.call_iter_dunder(iterable, prev, floor)
    }

    fn next_step(&mut self, iterable: Value, state: Value, floor: usize) -> Result<Value, Value> {
        if let (Value::Obj(id), Value::Number(n)) = (iterable, state) {
            let idx = n as usize;
            match self.heap.get(id) {
                Obj::List(l) => return Ok(l.items[idx]),
                Obj::Tuple(t) => return Ok(t.items[idx]),
                Obj::Str(s) => {
                    let ch = s.as_str().chars().nth(idx).unwrap();
                    let str_id = self.heap.intern(&ch.to_string());
                    return Ok(Value::Obj(str_id));
                }
                _ => {}
            }
        }
        self.call_next_dunder(iterable, state, floor)
    }
}
