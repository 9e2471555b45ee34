//! Bytecode container format: `serialize`/`deserialize` a compiled [`Function`] prototype to
//! and from a flat byte buffer.
//!
//! Layout: `magic(4) version(u16) function`, where
//! `function := arity(u8) required_arity(u8) has_vararg(u8) num_locals(u16) n_defaults(u16)
//! defaults(value[]) n_upvalues(u8) upvalues(upvalue_desc[]) code_len(u32) code(byte[])
//! const_len(u16) consts(const[]) name_len(u16) name(byte[]) source_path_len(u16)
//! source_path(byte[]) lineinfo_len(u32) lineinfo(byte[]) is_generator(u8)` and
//! `const := tag(u8) payload`. `source_path`/`required_arity`/`has_vararg`/`num_locals` are
//! not named in the distilled grammar but are needed to reconstruct a runnable [`Function`];
//! everything else follows the quoted shape field for field.
//!
//! Only the outermost call carries `magic`/`version`; nested [`Const::Proto`] entries
//! recurse straight into `function` since they share their enclosing file's version.

use crate::bytecode::code::{Code, Const, LineEntry};
use crate::error::JStarError;
use crate::heap::Heap;
use crate::types::function::{Function, UpvalueDesc};
use crate::value::Value;

const MAGIC: [u8; 4] = *b"J*BC";
pub const FORMAT_VERSION: u16 = 1;

const CONST_TAG_NUMBER: u8 = 0;
const CONST_TAG_STR: u8 = 1;
const CONST_TAG_PROTO: u8 = 2;

/// Cursor over a byte slice that fails cleanly instead of panicking on a truncated or
/// malformed buffer.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], JStarError> {
        let end = self.pos.checked_add(n).ok_or_else(|| JStarError::Deserialize("length overflow".into()))?;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| JStarError::Deserialize("unexpected end of buffer".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, JStarError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, JStarError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, JStarError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, JStarError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes_of(&mut self, len: usize) -> Result<&'a [u8], JStarError> {
        self.take(len)
    }

    fn string(&mut self, len: usize) -> Result<String, JStarError> {
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| JStarError::Deserialize("string constant is not valid utf-8".into()))
    }
}

fn write_len_prefixed_u16(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_value(out: &mut Vec<u8>, v: &Value, heap: &Heap) {
    match v {
        Value::Number(n) => {
            out.push(0);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Bool(b) => {
            out.push(1);
            out.push(*b as u8);
        }
        Value::Null => out.push(2),
        Value::Obj(id) => {
            out.push(3);
            write_len_prefixed_u16(out, heap.str_of(*id));
        }
        Value::Handle(_) => unreachable!("a host handle can never appear as a default-argument constant"),
    }
}

fn read_value(r: &mut Reader, heap: &mut Heap) -> Result<Value, JStarError> {
    match r.u8()? {
        0 => Ok(Value::Number(r.f64()?)),
        1 => Ok(Value::Bool(r.u8()? != 0)),
        2 => Ok(Value::Null),
        3 => {
            let len = r.u16()? as usize;
            let s = r.string(len)?;
            Ok(Value::Obj(heap.intern(&s)))
        }
        tag => Err(JStarError::Deserialize(format!("unknown default-value tag {tag}"))),
    }
}

fn write_function(out: &mut Vec<u8>, f: &Function, heap: &Heap) {
    out.push(f.arity() as u8);
    out.push(f.required_arity);
    out.push(f.has_vararg as u8);
    out.extend_from_slice(&(f.num_locals as u16).to_le_bytes());

    out.extend_from_slice(&(f.defaults.len() as u16).to_le_bytes());
    for d in &f.defaults {
        write_value(out, d, heap);
    }

    out.push(f.upvalues.len() as u8);
    for uv in &f.upvalues {
        out.push(uv.index);
        out.push(uv.from_parent_local as u8);
    }

    out.extend_from_slice(&(f.code.bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&f.code.bytes);

    out.extend_from_slice(&(f.code.consts.len() as u16).to_le_bytes());
    for c in &f.code.consts {
        match c {
            Const::Number(n) => {
                out.push(CONST_TAG_NUMBER);
                out.extend_from_slice(&n.to_le_bytes());
            }
            Const::Str(s) => {
                out.push(CONST_TAG_STR);
                write_len_prefixed_u16(out, s);
            }
            Const::Proto(proto) => {
                out.push(CONST_TAG_PROTO);
                write_function(out, proto, heap);
            }
        }
    }

    write_len_prefixed_u16(out, heap.str_of(f.name));
    write_len_prefixed_u16(out, heap.str_of(f.source_path));

    out.extend_from_slice(&(f.code.lines.len() as u32).to_le_bytes());
    for entry in &f.code.lines {
        out.extend_from_slice(&entry.start_offset.to_le_bytes());
        out.extend_from_slice(&entry.line.to_le_bytes());
        out.extend_from_slice(&entry.column.to_le_bytes());
    }

    out.push(f.is_generator as u8);
}

fn read_function(r: &mut Reader, heap: &mut Heap) -> Result<Function, JStarError> {
    let arity = r.u8()?;
    let required_arity = r.u8()?;
    let has_vararg = r.u8()? != 0;
    let num_locals = r.u16()? as usize;

    let n_defaults = r.u16()? as usize;
    let mut defaults = Vec::with_capacity(n_defaults);
    for _ in 0..n_defaults {
        defaults.push(read_value(r, heap)?);
    }
    if required_arity as usize + defaults.len() != arity as usize {
        return Err(JStarError::Deserialize("arity does not match required_arity + defaults".into()));
    }

    let n_upvalues = r.u8()? as usize;
    let mut upvalues = Vec::with_capacity(n_upvalues);
    for _ in 0..n_upvalues {
        let index = r.u8()?;
        let from_parent_local = r.u8()? != 0;
        upvalues.push(UpvalueDesc { index, from_parent_local });
    }

    let code_len = r.u32()? as usize;
    let bytes = r.bytes_of(code_len)?.to_vec();

    let n_consts = r.u16()? as usize;
    let mut consts = Vec::with_capacity(n_consts);
    for _ in 0..n_consts {
        let tag = r.u8()?;
        let c = match tag {
            CONST_TAG_NUMBER => Const::Number(r.f64()?),
            CONST_TAG_STR => {
                let len = r.u16()? as usize;
                Const::Str(r.string(len)?.into_boxed_str())
            }
            CONST_TAG_PROTO => Const::Proto(Box::new(read_function(r, heap)?)),
            tag => return Err(JStarError::Deserialize(format!("unknown constant tag {tag}"))),
        };
        consts.push(c);
    }

    let name_len = r.u16()? as usize;
    let name = heap.intern(&r.string(name_len)?);
    let source_path_len = r.u16()? as usize;
    let source_path = heap.intern(&r.string(source_path_len)?);

    let n_lines = r.u32()? as usize;
    let mut lines = Vec::with_capacity(n_lines);
    for _ in 0..n_lines {
        let start_offset = r.u32()?;
        let line = r.u32()?;
        let column = r.u32()?;
        lines.push(LineEntry { start_offset, line, column });
    }

    let is_generator = r.u8()? != 0;

    Ok(Function {
        name,
        source_path,
        required_arity,
        defaults,
        has_vararg,
        upvalues,
        num_locals,
        is_generator,
        code: Code { bytes, consts, lines },
    })
}

/// Encodes `function` as a self-describing bytecode file.
pub fn serialize(function: &Function, heap: &Heap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    write_function(&mut out, function, heap);
    out
}

/// Decodes a buffer produced by [`serialize`]. Interns every string constant and name into
/// `heap` as it goes, so the returned [`Function`]'s `HeapId`s are already valid for that
/// heap. Fails on a magic/version mismatch or any structurally inconsistent length or tag.
pub fn deserialize(bytes: &[u8], heap: &mut Heap) -> Result<Function, JStarError> {
    let mut r = Reader::new(bytes);
    let magic = r.take(4)?;
    if magic != MAGIC {
        return Err(JStarError::Deserialize("bad magic bytes".into()));
    }
    let version = r.u16()?;
    if version != FORMAT_VERSION {
        return Err(JStarError::Version { expected: FORMAT_VERSION, found: version });
    }
    read_function(&mut r, heap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::Opcode;

    fn sample_function(heap: &mut Heap) -> Function {
        let mut code = Code::new();
        code.bytes.push(Opcode::LoadNull as u8);
        code.bytes.push(Opcode::Return as u8);
        code.consts.push(Const::Number(42.0));
        code.consts.push(Const::Str("hello".into()));
        code.lines.push(LineEntry { start_offset: 0, line: 1, column: 1 });
        Function {
            name: heap.intern("f"),
            source_path: heap.intern("test.jsr"),
            required_arity: 1,
            defaults: vec![Value::Number(1.0)],
            has_vararg: false,
            upvalues: vec![UpvalueDesc { index: 0, from_parent_local: true }],
            num_locals: 2,
            is_generator: false,
            code,
        }
    }

    #[test]
    fn round_trips_a_simple_function() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let f = sample_function(&mut heap);
        let bytes = serialize(&f, &heap);
        let back = deserialize(&bytes, &mut heap).expect("round trip");
        assert_eq!(back.arity(), f.arity());
        assert_eq!(back.required_arity, f.required_arity);
        assert_eq!(heap.str_of(back.name), "f");
        assert_eq!(back.code.bytes, f.code.bytes);
        assert_eq!(back.code.consts.len(), 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let bytes = vec![0u8; 8];
        assert!(matches!(deserialize(&bytes, &mut heap), Err(JStarError::Deserialize(_))));
    }

    #[test]
    fn rejects_version_mismatch() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let f = sample_function(&mut heap);
        let mut bytes = serialize(&f, &heap);
        bytes[4] = 0xff;
        bytes[5] = 0xff;
        assert!(matches!(deserialize(&bytes, &mut heap), Err(JStarError::Version { .. })));
    }

    #[test]
    fn rejects_truncated_buffer() {
        let mut heap = Heap::new(1 << 20, 2.0);
        let f = sample_function(&mut heap);
        let bytes = serialize(&f, &heap);
        let truncated = &bytes[..bytes.len() - 4];
        assert!(deserialize(truncated, &mut heap).is_err());
    }
}
