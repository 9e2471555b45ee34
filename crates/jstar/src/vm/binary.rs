//! Arithmetic and bitwise opcodes.
//!
//! `Value::Number` operands are handled directly; anything else dispatches to the matching
//! dunder method when the left operand is a class instance, and is a `TypeError` otherwise.

use crate::bytecode::Opcode;
use crate::heap::Obj;
use crate::value::Value;

use super::Vm;

fn numeric_binop(op: Opcode, a: f64, b: f64) -> f64 {
    match op {
        Opcode::Add => a + b,
        Opcode::Sub => a - b,
        Opcode::Mul => a * b,
        Opcode::Div => a / b,
        Opcode::Mod => a % b,
        Opcode::Pow => a.powf(b),
        Opcode::BAnd => ((a as i64) & (b as i64)) as f64,
        Opcode::BOr => ((a as i64) | (b as i64)) as f64,
        Opcode::BXor => ((a as i64) ^ (b as i64)) as f64,
        Opcode::Shl => ((a as i64) << (b as i64)) as f64,
        Opcode::Shr => ((a as i64) >> (b as i64)) as f64,
        _ => unreachable!("op_binary is only ever called with an arithmetic/bitwise opcode"),
    }
}

impl Vm {
    pub(crate) fn op_binary(&mut self, op: Opcode, floor: usize) -> Result<(), Value> {
        let rhs = self.pop();
        let lhs = self.pop();
        match (lhs, rhs) {
            (Value::Number(a), Value::Number(b)) => {
                self.push(Value::Number(numeric_binop(op, a, b)));
                Ok(())
            }
            (Value::Obj(id), _) if matches!(self.heap.get(id), Obj::Instance(_)) => {
                let class_id = match self.heap.get(id) {
                    Obj::Instance(inst) => inst.class,
                    _ => unreachable!(),
                };
                let name = Self::binary_opcode_dunder(op);
                let name_id = self.heap.intern(name);
                match self.lookup_method_by_id(class_id, name_id) {
                    Some(m) => {
                        self.push(lhs);
                        self.push(rhs);
                        self.perform_call(m, 2, floor)
                    }
                    None => {
                        let exc = self.type_error(format!("Instance does not overload '{name}'"));
                        self.handle_raise(exc, floor)
                    }
                }
            }
            _ => {
                let lhs_name = self.value_type_name(lhs);
                let rhs_name = self.value_type_name(rhs);
                let exc = self.type_error(format!("Unsupported operand types: '{lhs_name}' and '{rhs_name}'"));
                self.handle_raise(exc, floor)
            }
        }
    }

    pub(crate) fn op_neg(&mut self, floor: usize) -> Result<(), Value> {
        match self.pop() {
            Value::Number(n) => {
                self.push(Value::Number(-n));
                Ok(())
            }
            other => {
                let name = self.value_type_name(other);
                let exc = self.type_error(format!("'{name}' does not support unary '-'"));
                self.handle_raise(exc, floor)
            }
        }
    }

    pub(crate) fn op_bnot(&mut self, floor: usize) -> Result<(), Value> {
        match self.pop() {
            Value::Number(n) => {
                self.push(Value::Number(!(n as i64) as f64));
                Ok(())
            }
            other => {
                let name = self.value_type_name(other);
                let exc = self.type_error(format!("'{name}' does not support unary '~'"));
                self.handle_raise(exc, floor)
            }
        }
    }
}
