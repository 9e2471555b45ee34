//! Comparison opcodes: `EQ`, `NEQ`, `LT`, `LE`,
//! `GT`, `GE`, `IS`.
//!
//! `EQ`/`NEQ` are bitwise/identity by default, with an `__eq__` dunder
//! fallback when the left operand is a class instance. `GT`/`GE` are implemented as their
//! `LT`/`LE` mirror with swapped operands, since the compiler has no separate opcodes for
//! them. `IS` walks the left operand's class chain against the right operand: `except
//! e is TypeError` and `class Foo is Bar` both read `is` as "is-an-instance-of".

use crate::bytecode::Opcode;
use crate::heap::Obj;
use crate::intern::StaticStr;
use crate::value::Value;

use super::Vm;

impl Vm {
    fn value_eq(&mut self, a: Value, b: Value, floor: usize) -> Result<bool, Value> {
        if let Value::Obj(id) = a {
            if let Obj::Instance(inst) = self.heap.get(id) {
                let class_id = inst.class;
                if let Some(m) = self.lookup_method(class_id, StaticStr::__eq__) {
                    self.push(a);
                    self.push(b);
                    let result = self.perform_call_sync(m, 2, floor)?;
                    return Ok(result.truthy());
                }
            }
        }
        Ok(a == b)
    }

    fn value_lt(&mut self, a: Value, b: Value, floor: usize) -> Result<bool, Value> {
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            return Ok(x < y);
        }
        if let Value::Obj(id) = a {
            if let Obj::Instance(inst) = self.heap.get(id) {
                let class_id = inst.class;
                if let Some(m) = self.lookup_method(class_id, StaticStr::__lt__) {
                    self.push(a);
                    self.push(b);
                    let result = self.perform_call_sync(m, 2, floor)?;
                    return Ok(result.truthy());
                }
            }
        }
        let lhs_name = self.value_type_name(a);
        let rhs_name = self.value_type_name(b);
        Err(self.type_error(format!("Cannot compare '{lhs_name}' and '{rhs_name}'")))
    }

    fn value_le(&mut self, a: Value, b: Value, floor: usize) -> Result<bool, Value> {
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            return Ok(x <= y);
        }
        if let Value::Obj(id) = a {
            if let Obj::Instance(inst) = self.heap.get(id) {
                let class_id = inst.class;
                if let Some(m) = self.lookup_method(class_id, StaticStr::__le__) {
                    self.push(a);
                    self.push(b);
                    let result = self.perform_call_sync(m, 2, floor)?;
                    return Ok(result.truthy());
                }
            }
        }
        let lhs_name = self.value_type_name(a);
        let rhs_name = self.value_type_name(b);
        Err(self.type_error(format!("Cannot compare '{lhs_name}' and '{rhs_name}'")))
    }

    pub(crate) fn op_compare(&mut self, op: Opcode, floor: usize) -> Result<(), Value> {
        let rhs = self.pop();
        let lhs = self.pop();
        let result = match op {
            Opcode::Eq => self.value_eq(lhs, rhs, floor),
            Opcode::Neq => self.value_eq(lhs, rhs, floor).map(|b| !b),
            Opcode::Lt => self.value_lt(lhs, rhs, floor),
            Opcode::Le => self.value_le(lhs, rhs, floor),
            Opcode::Gt => self.value_lt(rhs, lhs, floor),
            Opcode::Ge => self.value_le(rhs, lhs, floor),
            Opcode::Is => Ok(self.is_instance(lhs, rhs)),
            _ => unreachable!("op_compare is only ever called with a comparison opcode"),
        };
        match result {
            Ok(b) => {
                self.push(Value::Bool(b));
                Ok(())
            }
            Err(exc) => self.handle_raise(exc, floor),
        }
    }

    fn is_instance(&self, value: Value, class: Value) -> bool {
        let (Value::Obj(value_id), Value::Obj(class_id)) = (value, class) else {
            return false;
        };
        if !matches!(self.heap.get(class_id), Obj::Class(_)) {
            return false;
        }
        let instance_class = match self.heap.get(value_id) {
            Obj::Instance(inst) => inst.class,
            _ => return false,
        };
        self.instance_is_a(instance_class, class_id)
    }
}
