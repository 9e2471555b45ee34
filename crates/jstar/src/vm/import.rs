//! `IMPORT`/`IMPORT_AS`/`IMPORT_FROM`.
//!
//! All three opcodes resolve to the same module-loading algorithm and differ only in what
//! the compiler does with the module value they leave on the stack (`import_stmt`): a plain
//! `import foo.bar.baz` binds it under the path's last segment, `as` binds it under an
//! explicit alias, and `for` (`IMPORT_FROM`) copies out individual globals. The VM itself
//! never splits a dotted path into package segments — each import names one fully-qualified
//! module, looked up and registered under its whole dotted string.

use crate::config::ImportResolution;
use crate::heap::{HeapId, Obj};
use crate::types::{Closure, Function, Module};
use crate::value::Value;

use super::Vm;

impl Vm {
    fn path_name(&mut self, k: u16) -> (HeapId, String) {
        let id = match self.const_value(k) {
            Value::Obj(id) => id,
            _ => unreachable!("import path operands are always string constants"),
        };
        (id, self.heap.str_of(id).to_owned())
    }

    /// Steps 1-6 of the module-loading algorithm: registry hit, host resolution, compile or
    /// deserialize, register-then-run (so a cyclic import observes the partially-initialized
    /// module), unregister on failure.
    fn load_module(&mut self, path_id: HeapId, path_str: &str, floor: usize) -> Result<HeapId, Value> {
        if let Some(existing) = self.modules.get(path_id) {
            return Ok(existing);
        }
        let mut callback = std::mem::replace(&mut self.import_callback, Box::new(crate::config::NoImports));
        let resolution = callback.resolve(self, path_str);
        self.import_callback = callback;
        let function = match resolution {
            ImportResolution::NotFound => {
                let exc = self.import_error(format!("Module '{path_str}' not found"));
                return Err(exc);
            }
            ImportResolution::Source { code, path } => match self.compile_module_source(&code, &path, path_str) {
                Ok(f) => f,
                Err(exc) => return Err(exc),
            },
            ImportResolution::Bytecode { bytes, path } => match crate::serialize::deserialize(&bytes, &mut self.heap) {
                Ok(f) => f,
                Err(e) => {
                    let exc = self.import_error(format!("Failed to load '{path}': {e}"));
                    return Err(exc);
                }
            },
        };
        let module = Module::new(path_id);
        let module_id = self.heap.alloc(Obj::Module(module));
        self.modules.insert(path_id, module_id);
        let function_id = self.heap.alloc(Obj::Function(function));
        let closure = Closure::new(function_id, Vec::new(), module_id);
        let closure_id = self.heap.alloc(Obj::Closure(closure));
        match self.perform_call_sync(Value::Obj(closure_id), 0, floor) {
            Ok(_) => Ok(module_id),
            Err(exc) => {
                self.modules.remove(path_id);
                Err(exc)
            }
        }
    }

    fn compile_module_source(&mut self, code: &str, path: &str, module_name: &str) -> Result<Function, Value> {
        let ast = match crate::parser::Parser::new(code, path).parse_program() {
            Ok(ast) => ast,
            Err(diags) => return Err(self.import_error(Self::format_diagnostics(path, &diags))),
        };
        match crate::compiler::compile(&ast, &mut self.heap, path, module_name) {
            Ok(f) => Ok(f),
            Err(diags) => Err(self.import_error(Self::format_diagnostics(path, &diags))),
        }
    }

    fn format_diagnostics(path: &str, diags: &[crate::error::Diagnostic]) -> String {
        let mut msg = format!("Failed to load module '{path}':");
        for d in diags {
            msg.push('\n');
            msg.push_str(&d.message);
        }
        msg
    }

    pub(crate) fn op_import(&mut self, k: u16, floor: usize) -> Result<(), Value> {
        let (id, path) = self.path_name(k);
        match self.load_module(id, &path, floor) {
            Ok(module_id) => {
                self.push(Value::Obj(module_id));
                Ok(())
            }
            Err(exc) => self.handle_raise(exc, floor),
        }
    }

    /// `k2` (the alias string constant) is never read at runtime: `import_stmt` binds the
    /// alias itself via a separate `DEF_GLOBAL`/`SET_LOCAL` once this opcode has pushed the
    /// module value, the same way `IMPORT`'s last-segment binding works. It is kept as an
    /// operand purely so a disassembly of this instruction reads `IMPORT_AS foo.bar as baz`
    /// rather than just `IMPORT_AS foo.bar`.
    pub(crate) fn op_import_as(&mut self, path_k: u16, _alias_k: u16, floor: usize) -> Result<(), Value> {
        self.op_import(path_k, floor)
    }

    pub(crate) fn op_import_from(&mut self, k: u16, floor: usize) -> Result<(), Value> {
        self.op_import(k, floor)
    }
}
