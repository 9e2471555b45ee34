//! Textual disassembly of a compiled [`Function`], for `jstarc -l`/`-d` and debugging.

use std::fmt::Write as _;

use crate::heap::Heap;
use crate::types::function::Function;

use super::code::Const;
use super::op::Opcode;

fn read_u8(bytes: &[u8], ip: &mut usize) -> u8 {
    let b = bytes[*ip];
    *ip += 1;
    b
}

fn read_u16(bytes: &[u8], ip: &mut usize) -> u16 {
    let lo = read_u8(bytes, ip);
    let hi = read_u8(bytes, ip);
    u16::from_le_bytes([lo, hi])
}

fn read_i16(bytes: &[u8], ip: &mut usize) -> i16 {
    read_u16(bytes, ip) as i16
}

fn const_repr(code: &super::code::Code, k: u16) -> String {
    match &code.consts[k as usize] {
        Const::Number(n) => format!("{n}"),
        Const::Str(s) => format!("{s:?}"),
        Const::Proto(f) => format!("<fn {}>", f.name.index()),
    }
}

/// Disassembles `f`'s own bytecode, then recurses into every `MAKE_CLOSURE`-referenced
/// prototype in its constant pool, depth-first.
pub fn disassemble(f: &Function, heap: &Heap) -> String {
    let mut out = String::new();
    disassemble_into(f, heap, &mut out);
    out
}

fn disassemble_into(f: &Function, heap: &Heap, out: &mut String) {
    let name = heap.str_of(f.name);
    let path = heap.str_of(f.source_path);
    let _ = writeln!(out, "== {name} ({path}) arity={} locals={} generator={} ==", f.arity(), f.num_locals, f.is_generator);

    let bytes = &f.code.bytes;
    let mut ip = 0usize;
    while ip < bytes.len() {
        let offset = ip;
        let op = Opcode::from_u8(read_u8(bytes, &mut ip)).expect("disassembling well-formed bytecode");
        let (line, _) = f.code.location_at(offset as u32);
        let _ = write!(out, "{offset:04} {line:>4} {op:?}");
        match op {
            Opcode::LoadConst | Opcode::GetGlobal | Opcode::SetGlobal | Opcode::DefGlobal | Opcode::GetField
            | Opcode::SetField | Opcode::MakeClosure | Opcode::MakeClass | Opcode::Method | Opcode::BindMethod
            | Opcode::Import | Opcode::ImportFrom => {
                let k = read_u16(bytes, &mut ip);
                let _ = write!(out, " {k} ; {}", const_repr(&f.code, k));
            }
            Opcode::LoadNumberSmall | Opcode::GetLocal | Opcode::SetLocal | Opcode::GetUpvalue | Opcode::SetUpvalue
            | Opcode::Call | Opcode::MakeList | Opcode::MakeTuple | Opcode::Unpack => {
                let n = read_u8(bytes, &mut ip);
                let _ = write!(out, " {n}");
            }
            Opcode::Jump | Opcode::JumpIfFalse | Opcode::JumpIfTrue | Opcode::ForIter => {
                let off = read_i16(bytes, &mut ip);
                let _ = write!(out, " {off} -> {}", (offset as i64 + 3 + off as i64));
            }
            Opcode::Loop => {
                let mag = read_u16(bytes, &mut ip);
                let _ = write!(out, " {mag} -> {}", offset as i64 + 3 - mag as i64);
            }
            Opcode::Invoke | Opcode::SuperInvoke => {
                let k = read_u16(bytes, &mut ip);
                let argc = read_u8(bytes, &mut ip);
                let _ = write!(out, " {k} ({argc} args) ; {}", const_repr(&f.code, k));
            }
            Opcode::ImportAs => {
                let k = read_u16(bytes, &mut ip);
                let alias = read_u16(bytes, &mut ip);
                let _ = write!(out, " {k} as {alias} ; {}", const_repr(&f.code, k));
            }
            Opcode::TryPush => {
                let handler = read_u16(bytes, &mut ip);
                let end = read_u16(bytes, &mut ip);
                let _ = write!(out, " handler={handler} end={end}");
            }
            _ => {}
        }
        let _ = writeln!(out);
    }

    for c in &f.code.consts {
        if let Const::Proto(proto) = c {
            disassemble_into(proto, heap, out);
        }
    }
}
