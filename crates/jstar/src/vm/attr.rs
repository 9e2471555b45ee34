//! Name resolution:
//! `GET_GLOBAL`/`SET_GLOBAL`/`DEF_GLOBAL`, `GET_FIELD`/`SET_FIELD`, `GET_INDEX`/`SET_INDEX`.
//!
//! Field access on an `Instance` checks the per-instance field table before the class's
//! method table, same order as `INVOKE` (`vm::call`): a field shadows a method of the same
//! name. Reading a method as a bare value (not immediately called) produces a `BoundMethod`
//! so it still carries its receiver if stored and called later.

use crate::heap::{HeapId, Obj};
use crate::intern::StaticStr;
use crate::types::BoundMethod;
use crate::value::Value;

use super::Vm;

impl Vm {
    fn current_module(&self) -> HeapId {
        let closure = self.frames.last().expect("active frame").closure;
        match self.heap.get(closure) {
            Obj::Closure(c) => c.module,
            _ => unreachable!(),
        }
    }

    fn module_globals(&self, module: HeapId) -> &crate::types::Table {
        match self.heap.get(module) {
            Obj::Module(m) => &m.globals,
            _ => unreachable!("current_module always names an Obj::Module"),
        }
    }

    pub(crate) fn op_get_global(&mut self, k: u16, floor: usize) -> Result<(), Value> {
        let name_id = match self.const_value(k) {
            Value::Obj(id) => id,
            _ => unreachable!(),
        };
        let module = self.current_module();
        match self.module_globals(module).get(Value::Obj(name_id)) {
            Some(v) => {
                self.push(v);
                Ok(())
            }
            None => {
                let name = self.heap.str_of(name_id).to_owned();
                let exc = self.name_error(format!("Name '{name}' is not defined"));
                self.handle_raise(exc, floor)
            }
        }
    }

    pub(crate) fn op_set_global(&mut self, k: u16, floor: usize) -> Result<(), Value> {
        let name_id = match self.const_value(k) {
            Value::Obj(id) => id,
            _ => unreachable!(),
        };
        let module = self.current_module();
        let key = Value::Obj(name_id);
        if !self.module_globals(module).contains(key) {
            let name = self.heap.str_of(name_id).to_owned();
            let exc = self.name_error(format!("Name '{name}' is not defined"));
            return self.handle_raise(exc, floor);
        }
        let value = self.peek(0);
        match self.heap.get_mut(module) {
            Obj::Module(m) => m.set_global(key, value),
            _ => unreachable!(),
        }
        Ok(())
    }

    pub(crate) fn op_def_global(&mut self, k: u16) {
        let name_id = match self.const_value(k) {
            Value::Obj(id) => id,
            _ => unreachable!(),
        };
        let module = self.current_module();
        let value = self.pop();
        match self.heap.get_mut(module) {
            Obj::Module(m) => m.set_global(Value::Obj(name_id), value),
            _ => unreachable!(),
        }
    }

    fn instance_bound_value(&mut self, receiver: Value, class_id: HeapId, name_id: HeapId) -> Option<Value> {
        self.lookup_method_by_id(class_id, name_id).map(|method| {
            let id = self.heap.alloc(Obj::BoundMethod(BoundMethod { receiver, method }));
            Value::Obj(id)
        })
    }

    pub(crate) fn op_get_field(&mut self, k: u16, floor: usize) -> Result<(), Value> {
        let name_id = match self.const_value(k) {
            Value::Obj(id) => id,
            _ => unreachable!(),
        };
        let object = self.pop();
        let resolved = match object {
            Value::Obj(id) => match self.heap.get(id) {
                Obj::Instance(inst) => {
                    let (class_id, field) = (inst.class, inst.fields.get(Value::Obj(name_id)));
                    match field {
                        Some(v) => Some(v),
                        None => self.instance_bound_value(object, class_id, name_id),
                    }
                }
                Obj::Class(_) => self.lookup_method_by_id(id, name_id),
                Obj::Module(m) => m.get_global(Value::Obj(name_id)),
                _ => None,
            },
            _ => None,
        };
        match resolved {
            Some(v) => {
                self.push(v);
                Ok(())
            }
            None => {
                let name = self.heap.str_of(name_id).to_owned();
                let type_name = self.value_type_name(object);
                let exc = self.name_error(format!("'{type_name}' has no field '{name}'"));
                self.handle_raise(exc, floor)
            }
        }
    }

    pub(crate) fn op_set_field(&mut self, k: u16, floor: usize) -> Result<(), Value> {
        let name_id = match self.const_value(k) {
            Value::Obj(id) => id,
            _ => unreachable!(),
        };
        let value = self.pop();
        let object = self.pop();
        let ok = match object {
            Value::Obj(id) => match self.heap.get_mut(id) {
                Obj::Instance(inst) => {
                    inst.fields.set(Value::Obj(name_id), value);
                    true
                }
                Obj::Module(m) => {
                    m.set_global(Value::Obj(name_id), value);
                    true
                }
                _ => false,
            },
            _ => false,
        };
        if ok {
            self.push(value);
            Ok(())
        } else {
            let type_name = self.value_type_name(object);
            let exc = self.type_error(format!("Cannot set fields on a '{type_name}'"));
            self.handle_raise(exc, floor)
        }
    }

    fn normalize_index(len: usize, n: f64) -> Option<usize> {
        let n = n as i64;
        let idx = if n < 0 { n + len as i64 } else { n };
        if idx >= 0 && (idx as usize) < len {
            Some(idx as usize)
        } else {
            None
        }
    }

    pub(crate) fn op_get_index(&mut self, floor: usize) -> Result<(), Value> {
        let index = self.pop();
        let object = self.pop();
        match object {
            Value::Obj(id) => match (self.heap.get(id), index) {
                (Obj::List(l), Value::Number(n)) => match Self::normalize_index(l.len(), n) {
                    Some(i) => {
                        let v = l.items[i];
                        self.push(v);
                        Ok(())
                    }
                    None => {
                        let exc = self.index_error("List index out of bounds");
                        self.handle_raise(exc, floor)
                    }
                },
                (Obj::Tuple(t), Value::Number(n)) => match Self::normalize_index(t.len(), n) {
                    Some(i) => {
                        let v = t.items[i];
                        self.push(v);
                        Ok(())
                    }
                    None => {
                        let exc = self.index_error("Tuple index out of bounds");
                        self.handle_raise(exc, floor)
                    }
                },
                (Obj::Str(s), Value::Number(n)) => match Self::normalize_index(s.as_str().chars().count(), n) {
                    Some(i) => {
                        let ch = s.as_str().chars().nth(i).unwrap();
                        let id = self.heap.intern(&ch.to_string());
                        self.push(Value::Obj(id));
                        Ok(())
                    }
                    None => {
                        let exc = self.index_error("String index out of bounds");
                        self.handle_raise(exc, floor)
                    }
                },
                (Obj::Table(t), key) => match t.get(key) {
                    Some(v) => {
                        self.push(v);
                        Ok(())
                    }
                    None => {
                        let exc = self.index_error("Key not found in Table");
                        self.handle_raise(exc, floor)
                    }
                },
                (Obj::Instance(inst), _) => {
                    let class_id = inst.class;
                    match self.lookup_method(class_id, StaticStr::__get__) {
                        Some(m) => {
                            self.push(object);
                            self.push(index);
                            self.perform_call(m, 2, floor)
                        }
                        None => {
                            let exc = self.type_error("Object does not support indexing");
                            self.handle_raise(exc, floor)
                        }
                    }
                }
                _ => {
                    let type_name = self.value_type_name(object);
                    let exc = self.type_error(format!("'{type_name}' does not support indexing"));
                    self.handle_raise(exc, floor)
                }
            },
            _ => {
                let type_name = self.value_type_name(object);
                let exc = self.type_error(format!("'{type_name}' does not support indexing"));
                self.handle_raise(exc, floor)
            }
        }
    }

    pub(crate) fn op_set_index(&mut self, floor: usize) -> Result<(), Value> {
        let value = self.pop();
        let index = self.pop();
        let object = self.pop();
        match object {
            Value::Obj(id) => {
                let ok = match (self.heap.get_mut(id), index) {
                    (Obj::List(l), Value::Number(n)) => match Self::normalize_index(l.len(), n) {
                        Some(i) => {
                            l.items[i] = value;
                            true
                        }
                        None => false,
                    },
                    (Obj::Table(t), key) => {
                        t.set(key, value);
                        true
                    }
                    _ => false,
                };
                if ok {
                    self.push(value);
                    return Ok(());
                }
                if let Obj::Instance(inst) = self.heap.get(id) {
                    let class_id = inst.class;
                    if let Some(m) = self.lookup_method(class_id, StaticStr::__set__) {
                        self.push(object);
                        self.push(index);
                        self.push(value);
                        return self.perform_call(m, 3, floor);
                    }
                }
                let type_name = self.value_type_name(object);
                let exc = self.type_error(format!("'{type_name}' does not support index assignment"));
                self.handle_raise(exc, floor)
            }
            _ => {
                let type_name = self.value_type_name(object);
                let exc = self.type_error(format!("'{type_name}' does not support index assignment"));
                self.handle_raise(exc, floor)
            }
        }
    }
}
