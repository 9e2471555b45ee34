//! Per-function compilation state: the locals array, upvalue table, and loop-control stack
//! the [`super::Compiler`] threads through one nested function at a time.

use crate::bytecode::CodeBuilder;
use crate::bytecode::builder::JumpLabel;
use crate::types::function::UpvalueDesc;

pub struct Local {
    pub name: Box<str>,
    pub depth: u32,
    /// Set once some nested function resolves this local as an upvalue; on scope exit the
    /// compiler emits `CLOSE_UPVALUE` instead of `POP` for it.
    pub captured: bool,
}

/// Patch sites for `break`/`continue` within one enclosing loop, resolved when the loop
/// finishes compiling.
pub struct LoopScope {
    pub loop_start: usize,
    pub break_jumps: Vec<JumpLabel>,
    pub continue_jumps: Vec<JumpLabel>,
}

impl LoopScope {
    pub fn new(loop_start: usize) -> Self {
        Self { loop_start, break_jumps: Vec::new(), continue_jumps: Vec::new() }
    }
}

pub struct FuncScope {
    pub name: Box<str>,
    pub is_generator: bool,
    pub in_constructor: bool,
    pub in_class: bool,
    pub depth: u32,
    pub locals: Vec<Local>,
    pub max_locals: usize,
    pub upvalues: Vec<UpvalueDesc>,
    pub loops: Vec<LoopScope>,
    pub builder: CodeBuilder,
}

impl FuncScope {
    pub fn new(name: &str, is_generator: bool) -> Self {
        Self {
            name: name.into(),
            is_generator,
            in_constructor: false,
            in_class: false,
            depth: 0,
            locals: Vec::new(),
            max_locals: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
            builder: CodeBuilder::new(),
        }
    }

    pub fn declare_local(&mut self, name: &str) {
        self.locals.push(Local { name: name.into(), depth: self.depth, captured: false });
        self.max_locals = self.max_locals.max(self.locals.len());
    }

    pub fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals.iter().rposition(|l| l.name.as_ref() == name).map(|i| i as u8)
    }

    pub fn add_upvalue(&mut self, desc: UpvalueDesc) -> u8 {
        if let Some(i) = self.upvalues.iter().position(|u| *u == desc) {
            return i as u8;
        }
        self.upvalues.push(desc);
        (self.upvalues.len() - 1) as u8
    }
}
