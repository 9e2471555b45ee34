//! AST → bytecode compiler.
//!
//! One [`Compiler`] walks one [`Ast`] and produces a top-level [`Function`] prototype, with a
//! stack of [`FuncScope`]s tracking the function currently being emitted into — mirroring the
//! teacher's own compiler, which keeps one scope frame per nested `def`/lambda and resolves
//! names by walking that stack outward.

mod scope;

use crate::ast::{Ast, BinaryOp, ExceptArm, ExprId, ExprKind, LogicalOp, Params, Stmt, StmtId, StmtKind, UnaryOp};
use crate::bytecode::{CodeBuilder, Opcode};
use crate::error::{Diagnostic, Location};
use crate::heap::Heap;
use crate::types::function::{Function, UpvalueDesc};
use crate::value::Value;

use scope::{FuncScope, LoopScope};

const NO_ENSURE: u16 = u16::MAX;
/// Sentinel `handler_ip` for a `TRY_PUSH` with no `except` arms (`with`, bare `try...ensure`):
/// the VM runs its ensure block and re-raises unconditionally rather than dispatching into
/// an arm-matching chain that doesn't exist.
const NO_HANDLER: u16 = u16::MAX;

pub struct Compiler<'a> {
    ast: &'a Ast,
    heap: &'a mut Heap,
    path: &'a str,
    scopes: Vec<FuncScope>,
    errors: Vec<Diagnostic>,
}

/// Compiles `ast` (the parse of one source file or REPL chunk) into a top-level function
/// prototype, or the list of compile errors found along the way.
pub fn compile(ast: &Ast, heap: &mut Heap, path: &str, name: &str) -> Result<Function, Vec<Diagnostic>> {
    let mut compiler = Compiler { ast, heap, path, scopes: Vec::new(), errors: Vec::new() };
    compiler.scopes.push(FuncScope::new(name, false));
    // Statements run directly at `depth == 0`, not inside a `block()`-opened child scope, so
    // top-level `var`/`fun`/`class` declarations hit `declare_and_define`'s global case the
    // same way `compile_function` keeps its own parameters/body at a fixed, non-zero depth.
    for &id in &ast.program {
        compiler.statement(id);
    }
    let proto = compiler.finish_scope(Params::default());
    if compiler.errors.is_empty() {
        Ok(proto)
    } else {
        Err(compiler.errors)
    }
}

impl<'a> Compiler<'a> {
    fn scope(&mut self) -> &mut FuncScope {
        self.scopes.last_mut().expect("compiler scope stack is never empty while compiling")
    }

    fn error(&mut self, loc: Location, message: impl Into<String>) {
        self.errors.push(Diagnostic { path: self.path.to_owned(), loc, message: message.into() });
    }

    fn str_const(&mut self, s: &str) -> u16 {
        self.scope().builder.add_str_const(s)
    }

    // ---- statements ----

    fn block(&mut self, stmts: &[StmtId]) {
        self.begin_scope();
        for &id in stmts {
            self.statement(id);
        }
        let loc = stmts.last().map(|id| self.ast.stmt(*id).loc).unwrap_or(Location::new(1, 1));
        self.end_scope(loc);
    }

    fn begin_scope(&mut self) {
        self.scope().depth += 1;
    }

    /// Pops every local declared at the scope now ending, emitting `CLOSE_UPVALUE` for the
    /// ones that were captured and plain `POP` otherwise.
    fn end_scope(&mut self, loc: Location) {
        let depth = self.scope().depth;
        while let Some(local) = self.scope().locals.last() {
            if local.depth < depth {
                break;
            }
            let captured = local.captured;
            self.scope().locals.pop();
            self.scope().builder.emit(if captured { Opcode::CloseUpvalue } else { Opcode::Pop }, loc);
        }
        self.scope().depth -= 1;
    }

    fn statement(&mut self, id: StmtId) {
        let stmt: Stmt = self.ast.stmt(id).clone();
        match stmt.kind {
            StmtKind::VarDecl { name, init } => self.var_decl(&name, init, stmt.loc),
            StmtKind::FunDecl { name, params, body, is_generator, decorators, is_static } => {
                self.fun_decl(&name, &params, &body, is_generator, &decorators, is_static, stmt.loc)
            }
            StmtKind::NativeDecl { name, params, decorators: _, is_static } => self.native_decl(&name, &params, is_static, stmt.loc),
            StmtKind::ClassDecl { name, superclass, methods, decorators: _ } => self.class_decl(&name, superclass, &methods, stmt.loc),
            StmtKind::If { cond, then_body, elifs, else_body } => self.if_stmt(cond, &then_body, &elifs, else_body.as_deref(), stmt.loc),
            StmtKind::While { cond, body } => self.while_stmt(cond, &body, stmt.loc),
            StmtKind::ForC { init, cond, step, body } => self.for_c_stmt(init, cond, step, &body, stmt.loc),
            StmtKind::ForIn { binding, iterable, body } => self.for_in_stmt(&binding, iterable, &body, stmt.loc),
            StmtKind::TryExcept { body, excepts, ensure } => self.try_except_stmt(&body, &excepts, ensure.as_deref(), stmt.loc),
            StmtKind::Raise(expr) => {
                self.expression(expr);
                self.scope().builder.emit(Opcode::Raise, stmt.loc);
            }
            StmtKind::With { expr, binding, body } => self.with_stmt(expr, &binding, &body, stmt.loc),
            StmtKind::Return(value) => self.return_stmt(value, stmt.loc),
            StmtKind::Break => self.break_stmt(stmt.loc),
            StmtKind::Continue => self.continue_stmt(stmt.loc),
            StmtKind::Import { path, module_alias, names } => self.import_stmt(&path, module_alias.as_deref(), names.as_ref(), stmt.loc),
            StmtKind::Block(stmts) => self.block(&stmts),
            StmtKind::ExprStmt(expr) => {
                self.expression(expr);
                // `a, b = ...` already nets to zero stack depth (`unpack`'s arms each pop the
                // slot they consumed); every other expression leaves exactly one value, which
                // this `POP` discards.
                if !matches!(self.ast.expr(expr).kind, ExprKind::Unpack { .. }) {
                    self.scope().builder.emit(Opcode::Pop, stmt.loc);
                }
            }
        }
    }

    fn var_decl(&mut self, name: &str, init: Option<ExprId>, loc: Location) {
        match init {
            Some(e) => self.expression(e),
            None => self.scope().builder.emit(Opcode::LoadNull, loc),
        }
        self.declare_and_define(name, loc);
    }

    /// Declares `name` as a new local (or global, at function-top scope) and leaves it
    /// initialized from the value already on top of the stack.
    fn declare_and_define(&mut self, name: &str, loc: Location) {
        if self.scope().depth == 0 {
            let k = self.str_const(name);
            self.scope().builder.emit_u16(Opcode::DefGlobal, k, loc);
            return;
        }
        if self.scope().locals.iter().any(|l| l.depth == self.scope().depth && l.name.as_ref() == name) {
            self.error(loc, format!("variable '{name}' already declared in this scope"));
        }
        self.scope().declare_local(name);
        // The value is already on the stack at the new local's slot; no instruction needed.
    }

    fn fun_decl(&mut self, name: &str, params: &Params, body: &[StmtId], is_generator: bool, decorators: &[ExprId], is_static: bool, loc: Location) {
        if is_static && !self.scope().in_class {
            self.error(loc, "'static' is only valid inside a class body");
        }
        let proto = self.compile_function(name, params, body, is_generator, loc);
        let upvalues = proto.upvalues.clone();
        let k = self.scope().builder.add_proto_const(proto);
        self.emit_make_closure(k, &upvalues, loc);
        for &dec in decorators {
            self.expression(dec);
            self.scope().builder.emit_u8(Opcode::Call, 1, loc);
        }
        if self.scope().in_class {
            let name_k = self.str_const(name);
            self.scope().builder.emit_u16(Opcode::Method, name_k, loc);
        } else {
            self.declare_and_define(name, loc);
        }
    }

    fn native_decl(&mut self, name: &str, params: &Params, is_static: bool, loc: Location) {
        if is_static && !self.scope().in_class {
            self.error(loc, "'static' is only valid inside a class body");
        }
        // A native declaration only reserves the binding; the host supplies the actual
        // function pointer through the module's native registry at import time. Here we just load null as a placeholder slot to bind later.
        let _ = params;
        self.scope().builder.emit(Opcode::LoadNull, loc);
        if self.scope().in_class {
            let name_k = self.str_const(name);
            self.scope().builder.emit_u16(Opcode::Method, name_k, loc);
        } else {
            self.declare_and_define(name, loc);
        }
    }

    /// A class's methods see their superclass through a `super` binding captured the same way
    /// any enclosing local is: it lives one scope out from
    /// the method bodies, so `resolve_upvalue` picks it up without the methods needing any
    /// special-cased lookup. Declaring it *before* `MAKE_CLASS` keeps the class itself the
    /// single persistent stack slot the method loop pushes/pops closures against.
    fn class_decl(&mut self, name: &str, superclass: Option<ExprId>, methods: &[StmtId], loc: Location) {
        self.begin_scope();
        if let Some(sup) = superclass {
            self.expression(sup);
            self.scope().declare_local("super");
        }
        let name_k = self.str_const(name);
        self.scope().builder.emit_u16(Opcode::MakeClass, name_k, loc);
        if superclass.is_some() {
            let super_slot = self.scope().resolve_local("super").expect("just declared");
            self.scope().builder.emit_u8(Opcode::GetLocal, super_slot, loc);
            self.scope().builder.emit(Opcode::Inherit, loc);
        }
        self.scope().in_class = true;
        for &m in methods {
            self.statement(m);
        }
        self.scope().in_class = false;
        self.end_scope(loc);
        self.declare_and_define(name, loc);
    }

    fn if_stmt(&mut self, cond: ExprId, then_body: &[StmtId], elifs: &[(ExprId, Vec<StmtId>)], else_body: Option<&[StmtId]>, loc: Location) {
        self.expression(cond);
        let skip_then = self.scope().builder.emit_jump(Opcode::JumpIfFalse, loc);
        self.block(then_body);
        let mut end_jumps = vec![self.scope().builder.emit_jump(Opcode::Jump, loc)];
        self.scope().builder.patch_jump(skip_then);
        for (elif_cond, elif_body) in elifs {
            self.expression(*elif_cond);
            let skip = self.scope().builder.emit_jump(Opcode::JumpIfFalse, loc);
            self.block(elif_body);
            end_jumps.push(self.scope().builder.emit_jump(Opcode::Jump, loc));
            self.scope().builder.patch_jump(skip);
        }
        if let Some(body) = else_body {
            self.block(body);
        }
        for j in end_jumps {
            self.scope().builder.patch_jump(j);
        }
    }

    fn while_stmt(&mut self, cond: ExprId, body: &[StmtId], loc: Location) {
        let loop_start = self.scope().builder.current_offset();
        self.expression(cond);
        let exit = self.scope().builder.emit_jump(Opcode::JumpIfFalse, loc);
        self.scope().loops.push(LoopScope::new(loop_start));
        self.block(body);
        self.close_loop(loop_start, loc, exit);
    }

    fn for_c_stmt(&mut self, init: Option<StmtId>, cond: Option<ExprId>, step: Option<ExprId>, body: &[StmtId], loc: Location) {
        self.begin_scope();
        if let Some(init) = init {
            self.statement(init);
        }
        let loop_start = self.scope().builder.current_offset();
        let exit = cond.map(|c| {
            self.expression(c);
            self.scope().builder.emit_jump(Opcode::JumpIfFalse, loc)
        });
        self.scope().loops.push(LoopScope::new(loop_start));
        self.block(body);
        // `continue` must still run the step clause, so it jumps here rather than straight
        // back to `loop_start`.
        let continue_target = self.scope().builder.current_offset();
        if let Some(step) = step {
            self.expression(step);
            self.scope().builder.emit(Opcode::Pop, loc);
        }
        self.scope().builder.emit_loop(loop_start, loc);
        let finished = self.scope().loops.pop().expect("loop scope pushed above");
        for j in finished.break_jumps {
            self.scope().builder.patch_jump(j);
        }
        self.patch_continues(finished.continue_jumps, continue_target, loc);
        if let Some(exit) = exit {
            self.scope().builder.patch_jump(exit);
        }
        self.end_scope(loc);
    }

    /// `FOR_ITER` needs three live slots for the iterator protocol: the iterable
    /// itself (`__next__` is called against it every time), the previous `__iter__` result
    /// threaded forward as state, and the element exposed to the loop body. Declaring all
    /// three as locals means `end_scope` balances them the same way it balances any other
    /// local, with no VM-side bookkeeping beyond the three stack slots `FOR_ITER` rewrites
    /// in place.
    fn for_in_stmt(&mut self, binding: &str, iterable: ExprId, body: &[StmtId], loc: Location) {
        self.begin_scope();
        self.expression(iterable);
        self.scope().builder.emit(Opcode::ForPrep, loc);
        self.scope().declare_local("@iter");
        self.scope().builder.emit(Opcode::LoadNull, loc);
        self.scope().declare_local("@state");
        self.scope().builder.emit(Opcode::LoadNull, loc);
        self.scope().declare_local(binding);
        let loop_start = self.scope().builder.current_offset();
        let exit = self.scope().builder.emit_jump(Opcode::ForIter, loc);
        self.scope().loops.push(LoopScope::new(loop_start));
        self.block(body);
        self.close_loop(loop_start, loc, exit);
        self.end_scope(loc);
    }

    fn close_loop(&mut self, loop_start: usize, loc: Location, exit: crate::bytecode::builder::JumpLabel) {
        let continue_target = self.scope().builder.current_offset();
        self.scope().builder.emit_loop(loop_start, loc);
        self.scope().builder.patch_jump(exit);
        let finished = self.scope().loops.pop().expect("loop scope pushed by caller");
        for j in finished.break_jumps {
            self.scope().builder.patch_jump(j);
        }
        self.patch_continues(finished.continue_jumps, continue_target, loc);
    }

    /// `continue` is compiled as a forward jump; in a `while`/`for-in` it targets the `LOOP`
    /// instruction itself (so the condition/iterator step still runs), in a C-style `for` it
    /// targets the step clause recorded by the caller.
    fn patch_continues(&mut self, sites: Vec<crate::bytecode::builder::JumpLabel>, target: usize, _loc: Location) {
        for j in sites {
            self.scope().builder.patch_jump_to(j, target);
        }
    }

    fn break_stmt(&mut self, loc: Location) {
        if self.scope().loops.is_empty() {
            self.error(loc, "'break' outside loop");
            return;
        }
        let j = self.scope().builder.emit_jump(Opcode::Jump, loc);
        self.scope().loops.last_mut().unwrap().break_jumps.push(j);
    }

    fn continue_stmt(&mut self, loc: Location) {
        if self.scope().loops.is_empty() {
            self.error(loc, "'continue' outside loop");
            return;
        }
        let j = self.scope().builder.emit_jump(Opcode::Jump, loc);
        self.scope().loops.last_mut().unwrap().continue_jumps.push(j);
    }

    fn try_except_stmt(&mut self, body: &[StmtId], excepts: &[ExceptArm], ensure: Option<&[StmtId]>, loc: Location) {
        if excepts.is_empty() && ensure.is_none() {
            self.block(body);
            return;
        }
        if excepts.is_empty() {
            // Bare `try ... ensure ... end`: there is no arm-dispatch chain to jump into, so
            // the VM itself runs the ensure block and re-raises on an uncaught exception
            // (see `Vm::raise_in`'s `NO_HANDLER` handling).
            let (_, ensure_site) = self.scope().builder.emit_u16_u16(Opcode::TryPush, NO_HANDLER, NO_ENSURE, loc);
            self.block(body);
            self.scope().builder.emit(Opcode::TryPop, loc);
            // Both the normal-completion path (falls straight through from TRY_POP) and the
            // VM-driven exceptional path (jumped here by `raise_in` on a `NO_HANDLER` match)
            // converge on this one copy of the ensure block.
            let ensure_offset = self.scope().builder.current_offset();
            self.scope().builder.patch_u16(ensure_site, ensure_offset as u16);
            self.scope().builder.emit(Opcode::EnsureEnter, loc);
            self.block(ensure.unwrap());
            self.scope().builder.emit(Opcode::EnsureExit, loc);
            return;
        }

        let (handler_site, ensure_site) = self.scope().builder.emit_u16_u16(Opcode::TryPush, 0, NO_ENSURE, loc);
        self.block(body);
        self.scope().builder.emit(Opcode::TryPop, loc);
        let skip_handlers = self.scope().builder.emit_jump(Opcode::Jump, loc);

        let handler_offset = self.scope().builder.current_offset();
        self.scope().builder.patch_u16(handler_site, handler_offset as u16);
        let mut arm_end_jumps = Vec::new();
        for arm in excepts {
            // The matched exception stays on the stack across every arm check (`Dup` feeds
            // `Is`, leaving the original for the next arm or the binding).
            self.scope().builder.emit(Opcode::Dup, loc);
            self.expression(arm.class_expr);
            self.scope().builder.emit(Opcode::Is, loc);
            let skip_arm = self.scope().builder.emit_jump(Opcode::JumpIfFalse, loc);
            self.begin_scope();
            if let Some(binding) = &arm.binding {
                self.scope().declare_local(binding);
            } else {
                self.scope().builder.emit(Opcode::Pop, loc);
            }
            for &s in &arm.body {
                self.statement(s);
            }
            self.end_scope(loc);
            arm_end_jumps.push(self.scope().builder.emit_jump(Opcode::Jump, loc));
            self.scope().builder.patch_jump(skip_arm);
        }
        // No arm matched: run ensure (its own copy, since the shared copy below is only
        // reachable from the caught/normal paths) then re-raise.
        if let Some(ensure_body) = ensure {
            self.scope().builder.emit(Opcode::EnsureEnter, loc);
            self.block(ensure_body);
            self.scope().builder.emit(Opcode::EnsureExit, loc);
        }
        self.scope().builder.emit(Opcode::Raise, loc);
        for j in arm_end_jumps {
            self.scope().builder.patch_jump(j);
        }
        self.scope().builder.patch_jump(skip_handlers);

        if let Some(ensure_body) = ensure {
            let ensure_offset = self.scope().builder.current_offset();
            self.scope().builder.patch_u16(ensure_site, ensure_offset as u16);
            self.scope().builder.emit(Opcode::EnsureEnter, loc);
            self.block(ensure_body);
            self.scope().builder.emit(Opcode::EnsureExit, loc);
        }
    }

    /// `with e as x ... end` desugars to `try { x = e; body } ensure { x.close() }`.
    fn with_stmt(&mut self, expr: ExprId, binding: &str, body: &[StmtId], loc: Location) {
        let (_, ensure_site) = self.scope().builder.emit_u16_u16(Opcode::TryPush, NO_HANDLER, NO_ENSURE, loc);
        self.begin_scope();
        self.expression(expr);
        self.scope().declare_local(binding);
        for &s in body {
            self.statement(s);
        }
        self.scope().builder.emit(Opcode::TryPop, loc);
        let close_k = self.str_const("close");
        let local_idx = self.scope().resolve_local(binding).expect("just declared");
        self.scope().builder.emit_u8(Opcode::GetLocal, local_idx, loc);
        self.scope().builder.emit_u16_u8(Opcode::Invoke, close_k, 0, loc);
        self.scope().builder.emit(Opcode::Pop, loc);
        let skip_ensure = self.scope().builder.emit_jump(Opcode::Jump, loc);

        let ensure_offset = self.scope().builder.current_offset();
        self.scope().builder.patch_u16(ensure_site, ensure_offset as u16);
        self.scope().builder.emit(Opcode::EnsureEnter, loc);
        self.scope().builder.emit_u8(Opcode::GetLocal, local_idx, loc);
        self.scope().builder.emit_u16_u8(Opcode::Invoke, close_k, 0, loc);
        self.scope().builder.emit(Opcode::Pop, loc);
        self.scope().builder.emit(Opcode::EnsureExit, loc);
        self.scope().builder.patch_jump(skip_ensure);
        self.end_scope(loc);
    }

    fn return_stmt(&mut self, value: Option<ExprId>, loc: Location) {
        if self.scopes.len() == 1 {
            self.error(loc, "'return' outside function");
        }
        if self.scope().in_constructor && value.is_some() {
            self.error(loc, "'construct' cannot return a value");
        }
        match value {
            Some(e) => self.expression(e),
            None => self.scope().builder.emit(Opcode::LoadNull, loc),
        }
        self.scope().builder.emit(Opcode::Return, loc);
    }

    fn import_stmt(&mut self, path: &[Box<str>], module_alias: Option<&str>, names: Option<&crate::ast::ImportNames>, loc: Location) {
        let dotted: String = path.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(".");
        let path_k = self.str_const(&dotted);
        if let Some(names) = names {
            self.scope().builder.emit_u16(Opcode::ImportFrom, path_k, loc);
            for (name, alias) in &names.names {
                self.scope().builder.emit(Opcode::Dup, loc);
                let field_k = self.str_const(name);
                self.scope().builder.emit_u16(Opcode::GetField, field_k, loc);
                self.declare_and_define(alias.as_deref().unwrap_or(name), loc);
            }
            self.scope().builder.emit(Opcode::Pop, loc);
        } else if let Some(alias) = module_alias {
            let alias_k = self.str_const(alias);
            self.scope().builder.emit_u16_u16(Opcode::ImportAs, path_k, alias_k, loc);
            self.declare_and_define(alias, loc);
        } else {
            self.scope().builder.emit_u16(Opcode::Import, path_k, loc);
            let bound_name = path.last().expect("import path is non-empty");
            self.declare_and_define(bound_name, loc);
        }
    }

    // ---- expressions ----

    fn expression(&mut self, id: ExprId) {
        let expr = self.ast.expr(id).clone();
        let loc = expr.loc;
        match expr.kind {
            ExprKind::Null => self.scope().builder.emit(Opcode::LoadNull, loc),
            ExprKind::True => self.scope().builder.emit(Opcode::LoadTrue, loc),
            ExprKind::False => self.scope().builder.emit(Opcode::LoadFalse, loc),
            ExprKind::Number(n) => {
                if n.fract() == 0.0 && (0.0..=255.0).contains(&n) {
                    self.scope().builder.emit_u8(Opcode::LoadNumberSmall, n as u8, loc);
                } else {
                    let k = self.scope().builder.add_number_const(n);
                    self.scope().builder.emit_u16(Opcode::LoadConst, k, loc);
                }
            }
            ExprKind::Str(s) => {
                let k = self.str_const(&s);
                self.scope().builder.emit_u16(Opcode::LoadConst, k, loc);
            }
            ExprKind::Ident(name) => self.load_variable(&name, loc),
            ExprKind::Super => self.load_variable("super", loc),
            ExprKind::Tuple(items) => self.sequence_literal(&items, Opcode::MakeTuple, loc),
            ExprKind::List(items) => self.sequence_literal(&items, Opcode::MakeList, loc),
            ExprKind::Table(pairs) => {
                self.scope().builder.emit(Opcode::MakeTable, loc);
                for (k, v) in pairs {
                    self.scope().builder.emit(Opcode::Dup, loc);
                    self.expression(k);
                    self.expression(v);
                    self.scope().builder.emit(Opcode::SetIndex, loc);
                    self.scope().builder.emit(Opcode::Pop, loc);
                }
            }
            ExprKind::FunLit { params, body, is_generator } => {
                let proto = self.compile_function("<lambda>", &params, &body, is_generator, loc);
                let upvalues = proto.upvalues.clone();
                let k = self.scope().builder.add_proto_const(proto);
                self.emit_make_closure(k, &upvalues, loc);
            }
            ExprKind::Yield(value) => {
                if !self.scope().is_generator {
                    self.error(loc, "'yield' used outside a generator function");
                }
                if self.scope().in_constructor {
                    self.error(loc, "'yield' is not allowed inside 'construct'");
                }
                match value {
                    Some(e) => self.expression(e),
                    None => self.scope().builder.emit(Opcode::LoadNull, loc),
                }
                self.scope().builder.emit(Opcode::Yield, loc);
            }
            ExprKind::Spread(inner) => {
                self.expression(inner);
                self.scope().builder.emit(Opcode::Spread, loc);
            }
            ExprKind::Unary { op, expr } => {
                self.expression(expr);
                let opcode = match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BNot => Opcode::BNot,
                    UnaryOp::Len | UnaryOp::FlattenLen => Opcode::Invoke, // resolved below
                };
                match op {
                    UnaryOp::Len => {
                        let k = self.str_const("__len__");
                        self.scope().builder.emit_u16_u8(Opcode::Invoke, k, 0, loc);
                    }
                    UnaryOp::FlattenLen => {
                        let k = self.str_const("__flattenLen__");
                        self.scope().builder.emit_u16_u8(Opcode::Invoke, k, 0, loc);
                    }
                    _ => self.scope().builder.emit(opcode, loc),
                }
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.expression(lhs);
                self.expression(rhs);
                self.scope().builder.emit(binary_opcode(op), loc);
            }
            ExprKind::Logical { op, lhs, rhs } => self.logical(op, lhs, rhs, loc),
            ExprKind::Ternary { cond, then_branch, else_branch } => {
                self.expression(cond);
                let else_jump = self.scope().builder.emit_jump(Opcode::JumpIfFalse, loc);
                self.expression(then_branch);
                let end_jump = self.scope().builder.emit_jump(Opcode::Jump, loc);
                self.scope().builder.patch_jump(else_jump);
                self.expression(else_branch);
                self.scope().builder.patch_jump(end_jump);
            }
            ExprKind::Assign { target, op, value } => self.assign(target, op, value, loc),
            ExprKind::Unpack { targets, value } => self.unpack(&targets, value, loc),
            ExprKind::Call { callee, args } => self.call(callee, &args, loc),
            ExprKind::BraceCall { callee, table } => self.call(callee, &[table], loc),
            ExprKind::Index { object, index } => {
                self.expression(object);
                self.expression(index);
                self.scope().builder.emit(Opcode::GetIndex, loc);
            }
            ExprKind::Field { object, name } => {
                self.expression(object);
                let k = self.str_const(&name);
                self.scope().builder.emit_u16(Opcode::GetField, k, loc);
            }
        }
    }

    fn sequence_literal(&mut self, items: &[ExprId], opcode: Opcode, loc: Location) {
        let has_spread = items.iter().any(|&id| matches!(self.ast.expr(id).kind, ExprKind::Spread(_)));
        if !has_spread {
            for &item in items {
                self.expression(item);
            }
            let n = items.len();
            if n > u8::MAX as usize {
                self.error(loc, "too many elements in literal (max 255)");
            }
            self.scope().builder.emit_u8(opcode, n as u8, loc);
            self.scope().builder.track_stack_effect(1 - n as i32);
            return;
        }
        // A spread element makes the final length unknowable here, so build incrementally
        // (mirrors the table literal's `Dup`-free append below, `SPREAD` normalizes any
        // iterable to a `List` first and `LIST_EXTEND` splices it in).
        self.scope().builder.emit_u8(Opcode::MakeList, 0, loc);
        self.scope().builder.track_stack_effect(1);
        for &item in items {
            if let ExprKind::Spread(inner) = self.ast.expr(item).kind.clone() {
                self.expression(inner);
                self.scope().builder.emit(Opcode::Spread, loc);
                self.scope().builder.emit(Opcode::ListExtend, loc);
            } else {
                self.expression(item);
                self.scope().builder.emit(Opcode::ListAppend, loc);
            }
        }
        if opcode == Opcode::MakeTuple {
            self.scope().builder.emit(Opcode::ListToTuple, loc);
        }
    }

    fn logical(&mut self, op: LogicalOp, lhs: ExprId, rhs: ExprId, loc: Location) {
        self.expression(lhs);
        match op {
            LogicalOp::And => {
                let short_circuit = self.scope().builder.emit_jump(Opcode::JumpIfFalse, loc);
                self.scope().builder.emit(Opcode::Pop, loc);
                self.expression(rhs);
                self.scope().builder.patch_jump(short_circuit);
            }
            LogicalOp::Or => {
                let short_circuit = self.scope().builder.emit_jump(Opcode::JumpIfTrue, loc);
                self.scope().builder.emit(Opcode::Pop, loc);
                self.expression(rhs);
                self.scope().builder.patch_jump(short_circuit);
            }
        }
    }

    fn assign(&mut self, target: ExprId, op: Option<BinaryOp>, value: ExprId, loc: Location) {
        let target_kind = self.ast.expr(target).kind.clone();
        if !matches!(target_kind, ExprKind::Ident(_) | ExprKind::Field { .. } | ExprKind::Index { .. }) {
            self.error(loc, "invalid assignment target");
            return;
        }
        match &target_kind {
            ExprKind::Ident(name) => {
                if let Some(op) = op {
                    self.load_variable(name, loc);
                    self.expression(value);
                    self.scope().builder.emit(binary_opcode(op), loc);
                } else {
                    self.expression(value);
                }
                self.store_variable(name, loc);
            }
            ExprKind::Field { object, name } => {
                self.expression(*object);
                if let Some(op) = op {
                    self.scope().builder.emit(Opcode::Dup, loc);
                    let k = self.str_const(name);
                    self.scope().builder.emit_u16(Opcode::GetField, k, loc);
                    self.expression(value);
                    self.scope().builder.emit(binary_opcode(op), loc);
                } else {
                    self.expression(value);
                }
                let k = self.str_const(name);
                self.scope().builder.emit_u16(Opcode::SetField, k, loc);
            }
            ExprKind::Index { object, index } => {
                if let Some(op) = op {
                    // `object`/`index` are pushed once and read back by slot (rather than
                    // re-evaluated, which would duplicate any side effect, or duplicated via
                    // a stack rotate, which this opcode set has no instruction for): after
                    // this pair of pushes their values sit at two known frame-relative slots
                    // for the rest of the expression.
                    let obj_slot = self.scope().builder.stack_depth() as u8;
                    self.expression(*object);
                    let idx_slot = self.scope().builder.stack_depth() as u8;
                    self.expression(*index);
                    self.scope().builder.emit_u8(Opcode::GetLocal, obj_slot, loc);
                    self.scope().builder.emit_u8(Opcode::GetLocal, idx_slot, loc);
                    self.scope().builder.emit(Opcode::GetIndex, loc);
                    self.expression(value);
                    self.scope().builder.emit(binary_opcode(op), loc);
                } else {
                    self.expression(*object);
                    self.expression(*index);
                    self.expression(value);
                }
                self.scope().builder.emit(Opcode::SetIndex, loc);
            }
            _ => unreachable!("checked above"),
        }
    }

    fn unpack(&mut self, targets: &[ExprId], value: ExprId, loc: Location) {
        for &t in targets {
            if !matches!(self.ast.expr(t).kind, ExprKind::Ident(_) | ExprKind::Field { .. } | ExprKind::Index { .. }) {
                self.error(loc, "unpacking assignment target must be an lvalue");
            }
        }
        self.expression(value);
        if targets.len() > u8::MAX as usize {
            self.error(loc, "too many unpack targets (max 255)");
        }
        self.scope().builder.emit_u8(Opcode::Unpack, targets.len() as u8, loc);
        self.scope().builder.track_stack_effect(targets.len() as i32 - 1);
        // Each arm leaves its slice of the unpacked value consumed and the stack back at the
        // depth it had before this call: `UNPACK` pops 1 and pushes `targets.len()`, and every
        // arm below pops exactly one of those back off, so the whole statement is net zero
        // (`statement()` special-cases `Unpack` to skip the usual trailing `POP`).
        for &t in targets {
            let kind = self.ast.expr(t).kind.clone();
            match kind {
                ExprKind::Ident(name) => {
                    self.store_variable(&name, loc);
                    self.scope().builder.emit(Opcode::Pop, loc);
                }
                ExprKind::Field { object, name } => {
                    // `object` is evaluated after this target's value is already on the stack,
                    // so a `SWAP` is needed to present `SET_FIELD` with its expected
                    // [object, value] order.
                    self.expression(object);
                    self.scope().builder.emit(Opcode::Swap, loc);
                    let k = self.str_const(&name);
                    self.scope().builder.emit_u16(Opcode::SetField, k, loc);
                    self.scope().builder.emit(Opcode::Pop, loc);
                }
                ExprKind::Index { object, index } => {
                    self.expression(object);
                    self.scope().builder.emit(Opcode::Swap, loc);
                    self.expression(index);
                    self.scope().builder.emit(Opcode::Swap, loc);
                    self.scope().builder.emit(Opcode::SetIndex, loc);
                    self.scope().builder.emit(Opcode::Pop, loc);
                }
                _ => {}
            }
        }
    }

    fn call(&mut self, callee: ExprId, args: &[ExprId], loc: Location) {
        let has_spread = args.iter().any(|&a| matches!(self.ast.expr(a).kind, ExprKind::Spread(_)));
        // `a.b(args)` is lowered to `INVOKE` rather than `GET_FIELD` + `CALL`.
        if let ExprKind::Field { object, name } = self.ast.expr(callee).kind.clone() {
            if matches!(self.ast.expr(object).kind, ExprKind::Super) {
                self.super_call(&name, args, loc);
                return;
            }
            self.expression(object);
            if has_spread {
                // No fast-path `INVOKE` for a spread argument list: resolve the bound method
                // through `GET_FIELD` (same value `INVOKE` would dispatch to) and fall through
                // to the generic spread-call sequence below.
                let k = self.str_const(&name);
                self.scope().builder.emit_u16(Opcode::GetField, k, loc);
                self.spread_call_args(args, loc);
                return;
            }
            for &a in args {
                self.expression(a);
            }
            let k = self.str_const(&name);
            if args.len() > u8::MAX as usize {
                self.error(loc, "too many arguments (max 255)");
            }
            self.scope().builder.emit_u16_u8(Opcode::Invoke, k, args.len() as u8, loc);
            self.scope().builder.track_stack_effect(-(args.len() as i32));
            return;
        }
        if matches!(self.ast.expr(callee).kind, ExprKind::Super) {
            self.super_call("construct", args, loc);
            return;
        }
        self.expression(callee);
        if has_spread {
            self.spread_call_args(args, loc);
            return;
        }
        for &a in args {
            self.expression(a);
        }
        if args.len() > u8::MAX as usize {
            self.error(loc, "too many arguments (max 255)");
        }
        self.scope().builder.emit_u8(Opcode::Call, args.len() as u8, loc);
        self.scope().builder.track_stack_effect(-(args.len() as i32));
    }

    /// Builds the flattened argument list for a call containing a spread (`f(...xs)`,
    /// `o.m(a, ...xs)`) and emits `CALL_SPREAD` against whatever callee/bound-method value is
    /// already on the stack beneath it.
    fn spread_call_args(&mut self, args: &[ExprId], loc: Location) {
        self.scope().builder.emit_u8(Opcode::MakeList, 0, loc);
        self.scope().builder.track_stack_effect(1);
        for &a in args {
            if let ExprKind::Spread(inner) = self.ast.expr(a).kind.clone() {
                self.expression(inner);
                self.scope().builder.emit(Opcode::Spread, loc);
                self.scope().builder.emit(Opcode::ListExtend, loc);
            } else {
                self.expression(a);
                self.scope().builder.emit(Opcode::ListAppend, loc);
            }
        }
        self.scope().builder.emit(Opcode::CallSpread, loc);
        self.scope().builder.track_stack_effect(-1);
    }

    /// `super(args)` / `super.m(args)`: the receiver is always the current method's own
    /// slot 0 (by calling convention, not by any reserved keyword), and the superclass to
    /// start method lookup from is the `super` binding resolved like any other name. Both
    /// ride along on the stack since `SUPER_INVOKE`'s operands only carry the method name and
    /// argument count.
    fn super_call(&mut self, method: &str, args: &[ExprId], loc: Location) {
        self.scope().builder.emit_u8(Opcode::GetLocal, 0, loc);
        for &a in args {
            self.expression(a);
        }
        self.load_variable("super", loc);
        let k = self.str_const(method);
        if args.len() > u8::MAX as usize {
            self.error(loc, "too many arguments (max 255)");
        }
        self.scope().builder.emit_u16_u8(Opcode::SuperInvoke, k, args.len() as u8, loc);
        self.scope().builder.track_stack_effect(-(args.len() as i32) - 1);
    }

    // ---- variable resolution ----

    fn load_variable(&mut self, name: &str, loc: Location) {
        if let Some(idx) = self.scope().resolve_local(name) {
            self.scope().builder.emit_u8(Opcode::GetLocal, idx, loc);
            return;
        }
        if let Some(idx) = self.resolve_upvalue(self.scopes.len() - 1, name) {
            self.scope().builder.emit_u8(Opcode::GetUpvalue, idx, loc);
            return;
        }
        let k = self.str_const(name);
        self.scope().builder.emit_u16(Opcode::GetGlobal, k, loc);
    }

    fn store_variable(&mut self, name: &str, loc: Location) {
        if let Some(idx) = self.scope().resolve_local(name) {
            self.scope().builder.emit_u8(Opcode::SetLocal, idx, loc);
            return;
        }
        if let Some(idx) = self.resolve_upvalue(self.scopes.len() - 1, name) {
            self.scope().builder.emit_u8(Opcode::SetUpvalue, idx, loc);
            return;
        }
        let k = self.str_const(name);
        self.scope().builder.emit_u16(Opcode::SetGlobal, k, loc);
    }

    /// Resolves `name` as an upvalue of `self.scopes[level]`, recursing outward and marking
    /// every intermediate local `captured`. Returns the upvalue's index within that scope, or `None` at the outermost
    /// (top-level) scope, where an unresolved name is a global.
    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let parent = level - 1;
        if let Some(local_idx) = self.scopes[parent].resolve_local(name) {
            self.scopes[parent].locals[local_idx as usize].captured = true;
            return Some(self.scopes[level].add_upvalue(UpvalueDesc { index: local_idx, from_parent_local: true }));
        }
        let outer_upvalue = self.resolve_upvalue(parent, name)?;
        Some(self.scopes[level].add_upvalue(UpvalueDesc { index: outer_upvalue, from_parent_local: false }))
    }

    // ---- function prototypes ----

    fn compile_function(&mut self, name: &str, params: &Params, body: &[StmtId], is_generator: bool, loc: Location) -> Function {
        let mut fn_scope = FuncScope::new(name, is_generator);
        fn_scope.in_constructor = name == "construct";
        fn_scope.depth = 1;
        for p in &params.positional {
            fn_scope.declare_local(p);
        }
        for (p, _) in &params.defaults {
            fn_scope.declare_local(p);
        }
        if let Some(v) = &params.vararg {
            fn_scope.declare_local(v);
        }
        self.scopes.push(fn_scope);
        for &s in body {
            self.statement(s);
        }
        // Implicit `return null` if control falls off the end.
        self.scope().builder.emit(Opcode::LoadNull, loc);
        self.scope().builder.emit(Opcode::Return, loc);
        let defaults = self.const_fold_defaults(params);
        self.finish_scope_with(params.positional.len() as u8, defaults, params.vararg.is_some())
    }

    fn const_fold_defaults(&mut self, params: &Params) -> Vec<Value> {
        params
            .defaults
            .iter()
            .filter_map(|(name, expr)| match self.const_fold(*expr) {
                Some(v) => Some(v),
                None => {
                    let loc = self.ast.expr(*expr).loc;
                    self.error(loc, format!("default value for parameter '{name}' must be a constant expression"));
                    None
                }
            })
            .collect()
    }

    fn const_fold(&mut self, id: ExprId) -> Option<Value> {
        match &self.ast.expr(id).kind {
            ExprKind::Null => Some(Value::Null),
            ExprKind::True => Some(Value::Bool(true)),
            ExprKind::False => Some(Value::Bool(false)),
            ExprKind::Number(n) => Some(Value::Number(*n)),
            ExprKind::Str(s) => {
                let id = self.heap.intern(s);
                Some(Value::Obj(id))
            }
            ExprKind::Unary { op: UnaryOp::Neg, expr } => self.const_fold(*expr).and_then(|v| match v {
                Value::Number(n) => Some(Value::Number(-n)),
                _ => None,
            }),
            _ => None,
        }
    }

    fn finish_scope(&mut self, params: Params) -> Function {
        self.finish_scope_with(params.positional.len() as u8, Vec::new(), params.vararg.is_some())
    }

    fn finish_scope_with(&mut self, required_arity: u8, defaults: Vec<Value>, has_vararg: bool) -> Function {
        let scope = self.scopes.pop().expect("matching compile_function push");
        let name_id = self.heap.intern(&scope.name);
        let path_id = self.heap.intern(self.path);
        Function {
            name: name_id,
            source_path: path_id,
            required_arity,
            defaults,
            has_vararg,
            upvalues: scope.upvalues,
            num_locals: scope.max_locals,
            is_generator: scope.is_generator,
            code: scope.builder.build(),
        }
    }

    /// Emits `MAKE_CLOSURE k` followed by the prototype's capture descriptors inline: a count
    /// byte, then one `(from_parent_local, index)` pair per upvalue, each read by the VM at
    /// `MAKE_CLOSURE` execution time to decide whether to capture the enclosing frame's local
    /// slot or its own upvalue slot.
    fn emit_make_closure(&mut self, proto_k: u16, upvalues: &[UpvalueDesc], loc: Location) {
        self.scope().builder.emit_u16(Opcode::MakeClosure, proto_k, loc);
        self.scope().builder.emit_raw_u8(upvalues.len() as u8);
        for u in upvalues {
            self.scope().builder.emit_raw_u8(u.from_parent_local as u8);
            self.scope().builder.emit_raw_u8(u.index);
        }
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Pow => Opcode::Pow,
        BinaryOp::BAnd => Opcode::BAnd,
        BinaryOp::BOr => Opcode::BOr,
        BinaryOp::BXor => Opcode::BXor,
        BinaryOp::Shl => Opcode::Shl,
        BinaryOp::Shr => Opcode::Shr,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Neq => Opcode::Neq,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::Is => Opcode::Is,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile_src(src: &str) -> Result<Function, Vec<Diagnostic>> {
        let ast = Parser::new(src, "test.jsr").parse_program()?;
        let mut heap = Heap::new(1 << 20, 2.0);
        compile(&ast, &mut heap, "test.jsr", "<main>")
    }

    #[test]
    fn compiles_an_empty_program_to_an_implicit_return() {
        let proto = compile_src("").expect("compiles");
        assert!(!proto.code.bytes.is_empty());
    }

    #[test]
    fn rejects_break_outside_loop() {
        let err = compile_src("break").unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("break")));
    }

    #[test]
    fn rejects_duplicate_local_in_same_scope() {
        let err = compile_src("var x = 1\nvar x = 2").unwrap_err();
        assert!(err.iter().any(|d| d.message.contains("already declared")));
    }

    #[test]
    fn accepts_a_simple_arithmetic_expression_statement() {
        compile_src("1 + 2 * 3").expect("compiles");
    }
}
