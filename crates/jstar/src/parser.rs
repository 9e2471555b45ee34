//! Recursive-descent, Pratt-free parser with one token of lookahead.
//!
//! Errors are reported through a user-supplied callback receiving `(path, location,
//! message)`; the parser then enters panic mode and synchronizes to the next statement
//! boundary rather than aborting outright, so a single file can report more than one syntax
//! error per pass.

use crate::ast::{Ast, BinaryOp, ExceptArm, ExprId, ExprKind, ImportNames, LogicalOp, Params, StmtId, StmtKind, UnaryOp};
use crate::error::{Diagnostic, Location};
use crate::lexer::{Lexer, unescape_string};
use crate::token::{Token, TokenKind};

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    path: String,
    prev: Token<'src>,
    current: Token<'src>,
    ast: Ast,
    diagnostics: Vec<Diagnostic>,
    panicking: bool,
    loop_depth: u32,
    func_depth: u32,
    in_constructor: bool,
}

type PResult<T> = Result<T, ()>;

impl<'src> Parser<'src> {
    pub fn new(src: &'src str, path: impl Into<String>) -> Self {
        let mut lexer = Lexer::new(src);
        let first = lexer.next_token();
        Self {
            lexer,
            path: path.into(),
            prev: first,
            current: first,
            ast: Ast::new(),
            diagnostics: Vec::new(),
            panicking: false,
            loop_depth: 0,
            func_depth: 0,
            in_constructor: false,
        }
    }

    /// Parses the whole source file, returning the arena and top-level statement list, or
    /// the accumulated diagnostics if anything failed to parse.
    pub fn parse_program(mut self) -> Result<Ast, Vec<Diagnostic>> {
        self.skip_newlines();
        let mut program = Vec::new();
        while !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(s) => program.push(s),
                Err(()) => self.synchronize(),
            }
            self.skip_newlines();
        }
        if self.diagnostics.is_empty() {
            self.ast.program = program;
            Ok(self.ast)
        } else {
            Err(self.diagnostics)
        }
    }

    // ---- token plumbing ----

    fn advance(&mut self) {
        self.prev = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            self.error_at_current("unrecognized character");
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, msg: &str) -> PResult<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            self.error_at_current(msg);
            Err(())
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(TokenKind::Newline) {
            self.advance();
        }
    }

    fn end_statement(&mut self) -> PResult<()> {
        if self.check(TokenKind::Newline) || self.check(TokenKind::Eof) || self.check(TokenKind::SemiColon) {
            self.skip_newlines();
            while self.matches(TokenKind::SemiColon) {
                self.skip_newlines();
            }
            Ok(())
        } else {
            self.error_at_current("expected end of statement");
            Err(())
        }
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current.loc, msg);
    }

    fn error_at(&mut self, loc: Location, msg: &str) {
        if self.panicking {
            return;
        }
        self.panicking = true;
        self.diagnostics.push(Diagnostic { path: self.path.clone(), loc, message: msg.to_owned() });
    }

    fn synchronize(&mut self) {
        self.panicking = false;
        while !self.check(TokenKind::Eof) {
            if self.prev.kind == TokenKind::Newline || self.prev.kind == TokenKind::SemiColon {
                return;
            }
            match self.current.kind {
                TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Class
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Try => return,
                _ => self.advance(),
            }
        }
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) -> PResult<StmtId> {
        if self.check(TokenKind::At) {
            return self.decorated_declaration();
        }
        let loc = self.current.loc;
        match self.current.kind {
            TokenKind::Var => self.var_decl(),
            TokenKind::Fun => self.fun_decl(Vec::new(), false),
            TokenKind::Native => self.native_decl(Vec::new(), false),
            TokenKind::Class => self.class_decl(Vec::new()),
            TokenKind::Static => {
                self.advance();
                match self.current.kind {
                    TokenKind::Fun => self.fun_decl(Vec::new(), true),
                    TokenKind::Native => self.native_decl(Vec::new(), true),
                    _ => {
                        self.error_at(loc, "'static' is only valid before a method declaration inside a class");
                        Err(())
                    }
                }
            }
            _ => self.statement(),
        }
    }

    fn decorated_declaration(&mut self) -> PResult<StmtId> {
        let mut decorators = Vec::new();
        while self.matches(TokenKind::At) {
            decorators.push(self.expression()?);
            self.end_statement()?;
        }
        let mut is_static = false;
        if self.matches(TokenKind::Static) {
            is_static = true;
        }
        match self.current.kind {
            TokenKind::Fun => self.fun_decl(decorators, is_static),
            TokenKind::Native => self.native_decl(decorators, is_static),
            TokenKind::Class => self.class_decl(decorators),
            _ => {
                self.error_at_current("decorators may only precede 'fun', 'native' or 'class' declarations");
                Err(())
            }
        }
    }

    fn var_decl(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        self.expect(TokenKind::Identifier, "expected variable name")?;
        let name: Box<str> = self.prev.lexeme.into();
        let init = if self.matches(TokenKind::Eq) { Some(self.expression()?) } else { None };
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::VarDecl { name, init }, loc))
    }

    fn params_list(&mut self) -> PResult<Params> {
        self.expect(TokenKind::LeftParen, "expected '(' to start parameter list")?;
        let mut params = Params::default();
        let mut in_defaults = false;
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.matches(TokenKind::DotDotDot) {
                    self.expect(TokenKind::Identifier, "expected vararg name after '...'")?;
                    params.vararg = Some(self.prev.lexeme.into());
                    break;
                }
                self.expect(TokenKind::Identifier, "expected parameter name")?;
                let name: Box<str> = self.prev.lexeme.into();
                // One-token lookahead: seeing '=' after a positional name means the parser
                // rewinds into "defaults" mode rather than treating it as a new statement.
                if self.check(TokenKind::Eq) {
                    in_defaults = true;
                    self.advance();
                    let default = self.expression()?;
                    params.defaults.push((name, default));
                } else if in_defaults {
                    self.error_at(self.prev.loc, "non-default parameter after a defaulted one");
                    return Err(());
                } else {
                    params.positional.push(name);
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' after parameter list")?;
        Ok(params)
    }

    fn fun_decl(&mut self, decorators: Vec<ExprId>, is_static: bool) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        self.expect(TokenKind::Identifier, "expected function name")?;
        let name: Box<str> = self.prev.lexeme.into();
        let params = self.params_list()?;
        self.func_depth += 1;
        let was_ctor = std::mem::replace(&mut self.in_constructor, &*name == "construct");
        let body = self.block_until_end()?;
        self.in_constructor = was_ctor;
        self.func_depth -= 1;
        let is_generator = body_contains_yield(&self.ast, &body);
        if is_generator && &*name == "construct" {
            self.error_at(loc, "'yield' is not allowed inside a constructor");
            return Err(());
        }
        Ok(self.ast.alloc_stmt(StmtKind::FunDecl { name, params, body, is_generator, decorators, is_static }, loc))
    }

    /// `construct(params) ... end` inside a class body; lowers to a `FunDecl` named
    /// `"construct"` so the compiler and VM's constructor-dispatch path need no separate case.
    fn construct_decl(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        let name: Box<str> = "construct".into();
        let params = self.params_list()?;
        self.func_depth += 1;
        let was_ctor = std::mem::replace(&mut self.in_constructor, true);
        let body = self.block_until_end()?;
        self.in_constructor = was_ctor;
        self.func_depth -= 1;
        if body_contains_yield(&self.ast, &body) {
            self.error_at(loc, "'yield' is not allowed inside a constructor");
            return Err(());
        }
        Ok(self.ast.alloc_stmt(StmtKind::FunDecl { name, params, body, is_generator: false, decorators: Vec::new(), is_static: false }, loc))
    }

    fn native_decl(&mut self, decorators: Vec<ExprId>, is_static: bool) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        self.expect(TokenKind::Identifier, "expected native function name")?;
        let name: Box<str> = self.prev.lexeme.into();
        let params = self.params_list()?;
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::NativeDecl { name, params, decorators, is_static }, loc))
    }

    fn class_decl(&mut self, decorators: Vec<ExprId>) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        self.expect(TokenKind::Identifier, "expected class name")?;
        let name: Box<str> = self.prev.lexeme.into();
        let superclass = if self.matches(TokenKind::Is) { Some(self.expression()?) } else { None };
        self.skip_newlines();
        let mut methods = Vec::new();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            let member = if self.check(TokenKind::At) {
                self.decorated_declaration()?
            } else if self.matches(TokenKind::Static) {
                match self.current.kind {
                    TokenKind::Fun => self.fun_decl(Vec::new(), true)?,
                    TokenKind::Native => self.native_decl(Vec::new(), true)?,
                    _ => {
                        self.error_at_current("expected 'fun' or 'native' after 'static'");
                        return Err(());
                    }
                }
            } else if self.check(TokenKind::Fun) {
                self.fun_decl(Vec::new(), false)?
            } else if self.check(TokenKind::Native) {
                self.native_decl(Vec::new(), false)?
            } else if self.check(TokenKind::Construct) {
                self.construct_decl()?
            } else {
                self.error_at_current("expected method declaration inside class body");
                return Err(());
            };
            methods.push(member);
            self.skip_newlines();
        }
        self.expect(TokenKind::End, "expected 'end' to close class body")?;
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::ClassDecl { name, superclass, methods, decorators }, loc))
    }

    fn statement(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        match self.current.kind {
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Try => self.try_stmt(),
            TokenKind::Raise => {
                self.advance();
                let expr = self.expression()?;
                self.end_statement()?;
                Ok(self.ast.alloc_stmt(StmtKind::Raise(expr), loc))
            }
            TokenKind::With => self.with_stmt(),
            TokenKind::Return => {
                self.advance();
                if self.func_depth == 0 {
                    self.error_at(loc, "'return' outside of a function");
                    return Err(());
                }
                let value = if self.check(TokenKind::Newline) || self.check(TokenKind::Eof) || self.check(TokenKind::SemiColon) {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.end_statement()?;
                Ok(self.ast.alloc_stmt(StmtKind::Return(value), loc))
            }
            TokenKind::Break => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error_at(loc, "'break' outside of a loop");
                    return Err(());
                }
                self.end_statement()?;
                Ok(self.ast.alloc_stmt(StmtKind::Break, loc))
            }
            TokenKind::Continue => {
                self.advance();
                if self.loop_depth == 0 {
                    self.error_at(loc, "'continue' outside of a loop");
                    return Err(());
                }
                self.end_statement()?;
                Ok(self.ast.alloc_stmt(StmtKind::Continue, loc))
            }
            TokenKind::Import => self.import_stmt(),
            TokenKind::Begin => {
                self.advance();
                let body = self.block_until_end()?;
                Ok(self.ast.alloc_stmt(StmtKind::Block(body), loc))
            }
            _ => {
                let expr = self.expression()?;
                self.end_statement()?;
                Ok(self.ast.alloc_stmt(StmtKind::ExprStmt(expr), loc))
            }
        }
    }

    /// Parses statements up to (and consuming) a terminating `end` keyword.
    fn block_until_end(&mut self) -> PResult<Vec<StmtId>> {
        self.skip_newlines();
        let mut body = Vec::new();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(s) => body.push(s),
                Err(()) => self.synchronize(),
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::End, "expected 'end' to close block")?;
        Ok(body)
    }

    fn if_stmt(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        let cond = self.expression()?;
        self.skip_newlines();
        let mut then_body = Vec::new();
        while !matches!(self.current.kind, TokenKind::Elif | TokenKind::Else | TokenKind::End) && !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(s) => then_body.push(s),
                Err(()) => self.synchronize(),
            }
            self.skip_newlines();
        }
        let mut elifs = Vec::new();
        while self.matches(TokenKind::Elif) {
            let econd = self.expression()?;
            self.skip_newlines();
            let mut ebody = Vec::new();
            while !matches!(self.current.kind, TokenKind::Elif | TokenKind::Else | TokenKind::End) && !self.check(TokenKind::Eof) {
                match self.declaration() {
                    Ok(s) => ebody.push(s),
                    Err(()) => self.synchronize(),
                }
                self.skip_newlines();
            }
            elifs.push((econd, ebody));
        }
        let else_body = if self.matches(TokenKind::Else) {
            self.skip_newlines();
            Some(self.block_until_end_inner()?)
        } else {
            None
        };
        self.expect(TokenKind::End, "expected 'end' to close 'if'")?;
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::If { cond, then_body, elifs, else_body }, loc))
    }

    /// Like `block_until_end` but does not consume the trailing `end` (the caller does).
    fn block_until_end_inner(&mut self) -> PResult<Vec<StmtId>> {
        let mut body = Vec::new();
        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(s) => body.push(s),
                Err(()) => self.synchronize(),
            }
            self.skip_newlines();
        }
        Ok(body)
    }

    fn while_stmt(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        let cond = self.expression()?;
        self.skip_newlines();
        self.loop_depth += 1;
        let body = self.block_until_end()?;
        self.loop_depth -= 1;
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::While { cond, body }, loc))
    }

    fn for_stmt(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        // `for x in iterable do ... end` vs C-style `for init; cond; step do ... end`.
        if self.check(TokenKind::Identifier) {
            let save_lexer_tok = self.current;
            let name_lexeme = self.current.lexeme;
            self.advance();
            if self.matches(TokenKind::In) {
                let binding: Box<str> = name_lexeme.into();
                let iterable = self.expression()?;
                self.matches(TokenKind::Do);
                self.skip_newlines();
                self.loop_depth += 1;
                let body = self.block_until_end()?;
                self.loop_depth -= 1;
                self.end_statement()?;
                return Ok(self.ast.alloc_stmt(StmtKind::ForIn { binding, iterable, body }, loc));
            }
            // Not a for-in: rewind the lexer and reparse as the init-clause of a C-style for.
            self.lexer.rewind(&save_lexer_tok);
            self.current = save_lexer_tok;
        }
        let init = if self.check(TokenKind::SemiColon) {
            None
        } else if self.check(TokenKind::Var) {
            Some(self.var_decl()?)
        } else {
            let e = self.expression()?;
            let s = self.ast.alloc_stmt(StmtKind::ExprStmt(e), loc);
            self.expect(TokenKind::SemiColon, "expected ';' after for-loop initializer")?;
            Some(s)
        };
        if init.is_none() {
            self.expect(TokenKind::SemiColon, "expected ';' after empty for-loop initializer")?;
        }
        let cond = if self.check(TokenKind::SemiColon) { None } else { Some(self.expression()?) };
        self.expect(TokenKind::SemiColon, "expected ';' after for-loop condition")?;
        let step = if self.check(TokenKind::Do) || self.check(TokenKind::Newline) { None } else { Some(self.expression()?) };
        self.matches(TokenKind::Do);
        self.skip_newlines();
        self.loop_depth += 1;
        let body = self.block_until_end()?;
        self.loop_depth -= 1;
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::ForC { init, cond, step, body }, loc))
    }

    fn try_stmt(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        self.skip_newlines();
        let body = self.block_until_end_inner_multi(&[TokenKind::Except, TokenKind::Ensure, TokenKind::End])?;
        let mut excepts = Vec::new();
        while self.matches(TokenKind::Except) {
            let class_expr = self.expression()?;
            let binding = if self.check(TokenKind::Identifier) {
                let n = self.current.lexeme;
                self.advance();
                Some(n.into())
            } else {
                None
            };
            self.skip_newlines();
            let ebody = self.block_until_end_inner_multi(&[TokenKind::Except, TokenKind::Ensure, TokenKind::End])?;
            excepts.push(ExceptArm { class_expr, binding, body: ebody });
        }
        let ensure = if self.matches(TokenKind::Ensure) {
            self.skip_newlines();
            Some(self.block_until_end_inner()?)
        } else {
            None
        };
        self.expect(TokenKind::End, "expected 'end' to close 'try'")?;
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::TryExcept { body, excepts, ensure }, loc))
    }

    fn block_until_end_inner_multi(&mut self, stoppers: &[TokenKind]) -> PResult<Vec<StmtId>> {
        let mut body = Vec::new();
        while !stoppers.contains(&self.current.kind) && !self.check(TokenKind::Eof) {
            match self.declaration() {
                Ok(s) => body.push(s),
                Err(()) => self.synchronize(),
            }
            self.skip_newlines();
        }
        Ok(body)
    }

    fn with_stmt(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        let expr = self.expression()?;
        self.expect(TokenKind::As, "expected 'as' in 'with' statement")?;
        self.expect(TokenKind::Identifier, "expected binding name after 'as'")?;
        let binding: Box<str> = self.prev.lexeme.into();
        self.skip_newlines();
        let body = self.block_until_end()?;
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::With { expr, binding, body }, loc))
    }

    fn import_stmt(&mut self) -> PResult<StmtId> {
        let loc = self.current.loc;
        self.advance();
        let mut path = Vec::new();
        self.expect(TokenKind::Identifier, "expected module name after 'import'")?;
        path.push(self.prev.lexeme.into());
        while self.matches(TokenKind::Dot) {
            self.expect(TokenKind::Identifier, "expected identifier after '.' in module path")?;
            path.push(self.prev.lexeme.into());
        }
        let module_alias = if self.matches(TokenKind::As) {
            self.expect(TokenKind::Identifier, "expected alias name after 'as'")?;
            Some(self.prev.lexeme.into())
        } else {
            None
        };
        let names = if self.matches(TokenKind::For) {
            let mut names = Vec::new();
            loop {
                self.expect(TokenKind::Identifier, "expected imported name")?;
                let name: Box<str> = self.prev.lexeme.into();
                let alias = if self.matches(TokenKind::As) {
                    self.expect(TokenKind::Identifier, "expected alias name after 'as'")?;
                    Some(self.prev.lexeme.into())
                } else {
                    None
                };
                names.push((name, alias));
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            Some(ImportNames { names })
        } else {
            None
        };
        self.end_statement()?;
        Ok(self.ast.alloc_stmt(StmtKind::Import { path, module_alias, names }, loc))
    }

    // ---- expressions ----

    fn expression(&mut self) -> PResult<ExprId> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<ExprId> {
        let loc = self.current.loc;
        let first = self.ternary()?;
        if self.check(TokenKind::Comma) {
            // Comma in expression context forms a tuple; it is only reinterpreted
            // as an unpacking-assignment target list if an '=' follows the whole list.
            let mut targets = vec![first];
            while self.matches(TokenKind::Comma) {
                targets.push(self.ternary()?);
            }
            if self.matches(TokenKind::Eq) {
                if !targets.iter().all(|&t| is_lvalue(&self.ast, t)) {
                    self.error_at(loc, "all elements of an unpacking assignment must be lvalues");
                    return Err(());
                }
                let value = self.assignment()?;
                return Ok(self.ast.alloc_expr(ExprKind::Unpack { targets, value }, loc));
            }
            return Ok(self.ast.alloc_expr(ExprKind::Tuple(targets), loc));
        }
        let op = match self.current.kind {
            TokenKind::Eq => Some(None),
            TokenKind::PlusEq => Some(Some(BinaryOp::Add)),
            TokenKind::MinusEq => Some(Some(BinaryOp::Sub)),
            TokenKind::StarEq => Some(Some(BinaryOp::Mul)),
            TokenKind::SlashEq => Some(Some(BinaryOp::Div)),
            TokenKind::PercentEq => Some(Some(BinaryOp::Mod)),
            _ => None,
        };
        if let Some(op) = op {
            if !is_lvalue(&self.ast, first) {
                self.error_at(loc, "invalid assignment target");
                return Err(());
            }
            self.advance();
            let value = self.assignment()?;
            return Ok(self.ast.alloc_expr(ExprKind::Assign { target: first, op, value }, loc));
        }
        Ok(first)
    }

    fn ternary(&mut self) -> PResult<ExprId> {
        let loc = self.current.loc;
        let expr = self.logical_or()?;
        if self.matches(TokenKind::If) {
            let cond = self.logical_or()?;
            self.expect(TokenKind::Else, "expected 'else' in ternary expression")?;
            let else_branch = self.ternary()?;
            return Ok(self.ast.alloc_expr(ExprKind::Ternary { cond, then_branch: expr, else_branch }, loc));
        }
        Ok(expr)
    }

    fn logical_or(&mut self) -> PResult<ExprId> {
        let mut lhs = self.logical_and()?;
        while self.check(TokenKind::Or) {
            let loc = self.current.loc;
            self.advance();
            let rhs = self.logical_and()?;
            lhs = self.ast.alloc_expr(ExprKind::Logical { op: LogicalOp::Or, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn logical_and(&mut self) -> PResult<ExprId> {
        let mut lhs = self.equality()?;
        while self.check(TokenKind::And) {
            let loc = self.current.loc;
            self.advance();
            let rhs = self.equality()?;
            lhs = self.ast.alloc_expr(ExprKind::Logical { op: LogicalOp::And, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> PResult<ExprId> {
        let mut lhs = self.relational()?;
        loop {
            let op = match self.current.kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::BangEq => BinaryOp::Neq,
                _ => break,
            };
            let loc = self.current.loc;
            self.advance();
            let rhs = self.relational()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn relational(&mut self) -> PResult<ExprId> {
        let mut lhs = self.bitwise_or()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Less => BinaryOp::Lt,
                TokenKind::LessEq => BinaryOp::Le,
                TokenKind::Greater => BinaryOp::Gt,
                TokenKind::GreaterEq => BinaryOp::Ge,
                TokenKind::Is => BinaryOp::Is,
                _ => break,
            };
            let loc = self.current.loc;
            self.advance();
            let rhs = self.bitwise_or()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn bitwise_or(&mut self) -> PResult<ExprId> {
        let mut lhs = self.bitwise_xor()?;
        while self.check(TokenKind::Pipe) {
            let loc = self.current.loc;
            self.advance();
            let rhs = self.bitwise_xor()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op: BinaryOp::BOr, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn bitwise_xor(&mut self) -> PResult<ExprId> {
        let mut lhs = self.bitwise_and()?;
        while self.check(TokenKind::Caret) {
            let loc = self.current.loc;
            self.advance();
            let rhs = self.bitwise_and()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op: BinaryOp::BXor, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn bitwise_and(&mut self) -> PResult<ExprId> {
        let mut lhs = self.shift()?;
        while self.check(TokenKind::Amp) {
            let loc = self.current.loc;
            self.advance();
            let rhs = self.shift()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op: BinaryOp::BAnd, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn shift(&mut self) -> PResult<ExprId> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.current.kind {
                TokenKind::LessLess => BinaryOp::Shl,
                TokenKind::GreaterGreater => BinaryOp::Shr,
                _ => break,
            };
            let loc = self.current.loc;
            self.advance();
            let rhs = self.additive()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> PResult<ExprId> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            let loc = self.current.loc;
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> PResult<ExprId> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            let loc = self.current.loc;
            self.advance();
            let rhs = self.unary()?;
            lhs = self.ast.alloc_expr(ExprKind::Binary { op, lhs, rhs }, loc);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> PResult<ExprId> {
        let loc = self.current.loc;
        let op = match self.current.kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang | TokenKind::Not => Some(UnaryOp::Not),
            TokenKind::Tilde => Some(UnaryOp::BNot),
            TokenKind::Hash => Some(UnaryOp::Len),
            TokenKind::HashHash => Some(UnaryOp::FlattenLen),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let expr = self.unary()?;
            return Ok(self.ast.alloc_expr(ExprKind::Unary { op, expr }, loc));
        }
        self.power()
    }

    fn power(&mut self) -> PResult<ExprId> {
        let base = self.postfix()?;
        if self.check(TokenKind::StarStar) {
            let loc = self.current.loc;
            self.advance();
            let exp = self.unary()?; // right-assoc
            return Ok(self.ast.alloc_expr(ExprKind::Binary { op: BinaryOp::Pow, lhs: base, rhs: exp }, loc));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> PResult<ExprId> {
        let mut expr = self.primary()?;
        loop {
            let loc = self.current.loc;
            if self.matches(TokenKind::LeftParen) {
                let args = self.call_args()?;
                expr = self.ast.alloc_expr(ExprKind::Call { callee: expr, args }, loc);
            } else if self.matches(TokenKind::LeftSquare) {
                let index = self.expression()?;
                self.expect(TokenKind::RightSquare, "expected ']' after index expression")?;
                expr = self.ast.alloc_expr(ExprKind::Index { object: expr, index }, loc);
            } else if self.matches(TokenKind::Dot) {
                self.expect(TokenKind::Identifier, "expected field name after '.'")?;
                let name: Box<str> = self.prev.lexeme.into();
                expr = self.ast.alloc_expr(ExprKind::Field { object: expr, name }, loc);
            } else if self.check(TokenKind::LeftBrace) {
                let table = self.table_literal()?;
                expr = self.ast.alloc_expr(ExprKind::BraceCall { callee: expr, table }, loc);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> PResult<Vec<ExprId>> {
        let mut args = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.matches(TokenKind::DotDotDot) {
                    let loc = self.prev.loc;
                    let inner = self.ternary()?;
                    args.push(self.ast.alloc_expr(ExprKind::Spread(inner), loc));
                } else {
                    args.push(self.assignment()?);
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RightParen, "expected ')' after argument list")?;
        Ok(args)
    }

    fn primary(&mut self) -> PResult<ExprId> {
        let loc = self.current.loc;
        match self.current.kind {
            TokenKind::Null => {
                self.advance();
                Ok(self.ast.alloc_expr(ExprKind::Null, loc))
            }
            TokenKind::True => {
                self.advance();
                Ok(self.ast.alloc_expr(ExprKind::True, loc))
            }
            TokenKind::False => {
                self.advance();
                Ok(self.ast.alloc_expr(ExprKind::False, loc))
            }
            TokenKind::Number => {
                let lexeme = self.current.lexeme;
                self.advance();
                let n = parse_number(lexeme);
                Ok(self.ast.alloc_expr(ExprKind::Number(n), loc))
            }
            TokenKind::String => {
                let lexeme = self.current.lexeme;
                self.advance();
                let s = unescape_string(lexeme).unwrap_or_default();
                Ok(self.ast.alloc_expr(ExprKind::Str(s.into()), loc))
            }
            TokenKind::Identifier => {
                let name = self.current.lexeme;
                self.advance();
                Ok(self.ast.alloc_expr(ExprKind::Ident(name.into()), loc))
            }
            TokenKind::Super => {
                self.advance();
                Ok(self.ast.alloc_expr(ExprKind::Super, loc))
            }
            TokenKind::Yield => {
                self.advance();
                let value = if self.starts_expression() { Some(self.expression()?) } else { None };
                Ok(self.ast.alloc_expr(ExprKind::Yield(value), loc))
            }
            TokenKind::DotDotDot => {
                self.advance();
                let inner = self.ternary()?;
                Ok(self.ast.alloc_expr(ExprKind::Spread(inner), loc))
            }
            TokenKind::LeftParen => {
                self.advance();
                if self.matches(TokenKind::RightParen) {
                    return Ok(self.ast.alloc_expr(ExprKind::Tuple(Vec::new()), loc));
                }
                let first = self.assignment()?;
                if self.matches(TokenKind::Comma) {
                    let mut items = vec![first];
                    if !self.check(TokenKind::RightParen) {
                        loop {
                            items.push(self.assignment()?);
                            if !self.matches(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RightParen, "expected ')' to close tuple literal")?;
                    return Ok(self.ast.alloc_expr(ExprKind::Tuple(items), loc));
                }
                self.expect(TokenKind::RightParen, "expected ')' to close grouping")?;
                Ok(first)
            }
            TokenKind::LeftSquare => {
                self.advance();
                let mut items = Vec::new();
                if !self.check(TokenKind::RightSquare) {
                    loop {
                        if self.matches(TokenKind::DotDotDot) {
                            let sloc = self.prev.loc;
                            let inner = self.assignment()?;
                            items.push(self.ast.alloc_expr(ExprKind::Spread(inner), sloc));
                        } else {
                            items.push(self.assignment()?);
                        }
                        if !self.matches(TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(TokenKind::RightSquare, "expected ']' to close list literal")?;
                Ok(self.ast.alloc_expr(ExprKind::List(items), loc))
            }
            TokenKind::LeftBrace => self.table_literal(),
            TokenKind::Fun => self.fun_literal(),
            TokenKind::Pipe | TokenKind::Pipe2 => self.arrow_literal(),
            _ => {
                self.error_at_current("expected expression");
                Err(())
            }
        }
    }

    fn starts_expression(&self) -> bool {
        !matches!(
            self.current.kind,
            TokenKind::Newline | TokenKind::Eof | TokenKind::SemiColon | TokenKind::End | TokenKind::RightParen | TokenKind::RightSquare | TokenKind::RightBrace
        )
    }

    fn table_literal(&mut self) -> PResult<ExprId> {
        let loc = self.current.loc;
        self.expect(TokenKind::LeftBrace, "expected '{' to start table literal")?;
        let mut entries = Vec::new();
        self.skip_newlines();
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.skip_newlines();
                let key = self.assignment()?;
                self.expect(TokenKind::Colon, "expected ':' between table key and value")?;
                let value = self.assignment()?;
                entries.push((key, value));
                self.skip_newlines();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.skip_newlines();
        self.expect(TokenKind::RightBrace, "expected '}' to close table literal")?;
        Ok(self.ast.alloc_expr(ExprKind::Table(entries), loc))
    }

    fn fun_literal(&mut self) -> PResult<ExprId> {
        let loc = self.current.loc;
        self.advance();
        let params = self.params_list()?;
        self.func_depth += 1;
        let was_ctor = std::mem::replace(&mut self.in_constructor, false);
        let body = self.block_until_end()?;
        self.in_constructor = was_ctor;
        self.func_depth -= 1;
        let is_generator = body_contains_yield(&self.ast, &body);
        Ok(self.ast.alloc_expr(ExprKind::FunLit { params, body, is_generator }, loc))
    }

    /// `|a, b| -> expr` lambda shorthand; desugars to a single-statement function literal.
    fn arrow_literal(&mut self) -> PResult<ExprId> {
        let loc = self.current.loc;
        let mut params = Params::default();
        if self.matches(TokenKind::Pipe2) {
            // empty parameter list written as '||'
        } else {
            self.expect(TokenKind::Pipe, "expected '|' to start lambda parameter list")?;
            if !self.check(TokenKind::Pipe) {
                loop {
                    self.expect(TokenKind::Identifier, "expected parameter name")?;
                    params.positional.push(self.prev.lexeme.into());
                    if !self.matches(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.expect(TokenKind::Pipe, "expected '|' to close lambda parameter list")?;
        }
        self.expect(TokenKind::Arrow, "expected '->' after lambda parameter list")?;
        self.func_depth += 1;
        let value = self.expression()?;
        self.func_depth -= 1;
        let ret_loc = self.ast.expr(value).loc;
        let ret = self.ast.alloc_stmt(StmtKind::Return(Some(value)), ret_loc);
        Ok(self.ast.alloc_expr(ExprKind::FunLit { params, body: vec![ret], is_generator: false }, loc))
    }
}

fn is_lvalue(ast: &Ast, id: ExprId) -> bool {
    matches!(ast.expr(id).kind, ExprKind::Ident(_) | ExprKind::Field { .. } | ExprKind::Index { .. })
}

fn parse_number(lexeme: &str) -> f64 {
    if let Some(hex) = lexeme.strip_prefix("0x").or_else(|| lexeme.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).map(|v| v as f64).unwrap_or(f64::NAN);
    }
    lexeme.parse::<f64>().unwrap_or(f64::NAN)
}

fn body_contains_yield(ast: &Ast, body: &[StmtId]) -> bool {
    body.iter().any(|&s| stmt_contains_yield(ast, s))
}

fn stmt_contains_yield(ast: &Ast, id: StmtId) -> bool {
    use crate::ast::StmtKind as SK;
    match &ast.stmt(id).kind {
        SK::VarDecl { init, .. } => init.is_some_and(|e| expr_contains_yield(ast, e)),
        SK::FunDecl { .. } | SK::NativeDecl { .. } | SK::ClassDecl { .. } => false,
        SK::If { cond, then_body, elifs, else_body } => {
            expr_contains_yield(ast, *cond)
                || body_contains_yield(ast, then_body)
                || elifs.iter().any(|(c, b)| expr_contains_yield(ast, *c) || body_contains_yield(ast, b))
                || else_body.as_ref().is_some_and(|b| body_contains_yield(ast, b))
        }
        SK::While { cond, body } => expr_contains_yield(ast, *cond) || body_contains_yield(ast, body),
        SK::ForC { cond, step, body, .. } => {
            cond.is_some_and(|e| expr_contains_yield(ast, e)) || step.is_some_and(|e| expr_contains_yield(ast, e)) || body_contains_yield(ast, body)
        }
        SK::ForIn { iterable, body, .. } => expr_contains_yield(ast, *iterable) || body_contains_yield(ast, body),
        SK::TryExcept { body, excepts, ensure } => {
            body_contains_yield(ast, body)
                || excepts.iter().any(|arm| body_contains_yield(ast, &arm.body))
                || ensure.as_ref().is_some_and(|b| body_contains_yield(ast, b))
        }
        SK::Raise(e) => expr_contains_yield(ast, *e),
        SK::With { expr, body, .. } => expr_contains_yield(ast, *expr) || body_contains_yield(ast, body),
        SK::Return(e) => e.is_some_and(|e| expr_contains_yield(ast, e)),
        SK::Break | SK::Continue | SK::Import { .. } => false,
        SK::Block(body) => body_contains_yield(ast, body),
        SK::ExprStmt(e) => expr_contains_yield(ast, *e),
    }
}

fn expr_contains_yield(ast: &Ast, id: ExprId) -> bool {
    match &ast.expr(id).kind {
        ExprKind::Yield(_) => true,
        ExprKind::FunLit { .. } => false,
        ExprKind::Tuple(items) | ExprKind::List(items) => items.iter().any(|&e| expr_contains_yield(ast, e)),
        ExprKind::Table(entries) => entries.iter().any(|&(k, v)| expr_contains_yield(ast, k) || expr_contains_yield(ast, v)),
        ExprKind::Spread(e) | ExprKind::Unary { expr: e, .. } => expr_contains_yield(ast, *e),
        ExprKind::Binary { lhs, rhs, .. } | ExprKind::Logical { lhs, rhs, .. } => expr_contains_yield(ast, *lhs) || expr_contains_yield(ast, *rhs),
        ExprKind::Ternary { cond, then_branch, else_branch } => {
            expr_contains_yield(ast, *cond) || expr_contains_yield(ast, *then_branch) || expr_contains_yield(ast, *else_branch)
        }
        ExprKind::Assign { target, value, .. } => expr_contains_yield(ast, *target) || expr_contains_yield(ast, *value),
        ExprKind::Unpack { targets, value } => targets.iter().any(|&t| expr_contains_yield(ast, t)) || expr_contains_yield(ast, *value),
        ExprKind::Call { callee, args } => expr_contains_yield(ast, *callee) || args.iter().any(|&a| expr_contains_yield(ast, a)),
        ExprKind::BraceCall { callee, table } => expr_contains_yield(ast, *callee) || expr_contains_yield(ast, *table),
        ExprKind::Index { object, index } => expr_contains_yield(ast, *object) || expr_contains_yield(ast, *index),
        ExprKind::Field { object, .. } => expr_contains_yield(ast, *object),
        ExprKind::Null | ExprKind::True | ExprKind::False | ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Ident(_) | ExprKind::Super => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Ast {
        Parser::new(src, "<test>").parse_program().expect("parse should succeed")
    }

    #[test]
    fn parses_arithmetic_with_precedence() {
        let ast = parse("1 + 2 * 3\n");
        assert_eq!(ast.program.len(), 1);
        let StmtKind::ExprStmt(e) = ast.stmt(ast.program[0]).kind else { panic!() };
        let ExprKind::Binary { op: BinaryOp::Add, rhs, .. } = ast.expr(e).kind else { panic!() };
        assert!(matches!(ast.expr(rhs).kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn parses_var_decl() {
        let ast = parse("var x = 1\n");
        let StmtKind::VarDecl { name, init } = &ast.stmt(ast.program[0]).kind else { panic!() };
        assert_eq!(&**name, "x");
        assert!(init.is_some());
    }

    #[test]
    fn parses_if_elif_else() {
        let ast = parse("if a elif b else c end\n");
        let StmtKind::If { elifs, else_body, .. } = &ast.stmt(ast.program[0]).kind else { panic!() };
        assert_eq!(elifs.len(), 1);
        assert!(else_body.is_some());
    }

    #[test]
    fn parses_for_in_loop() {
        let ast = parse("for x in range(3) do print(x) end\n");
        assert!(matches!(ast.stmt(ast.program[0]).kind, StmtKind::ForIn { .. }));
    }

    #[test]
    fn detects_generator_function() {
        let ast = parse("fun gen() yield 1 end\n");
        let StmtKind::FunDecl { is_generator, .. } = &ast.stmt(ast.program[0]).kind else { panic!() };
        assert!(is_generator);
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        let err = Parser::new("break\n", "<test>").parse_program().unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.contains("'break'"));
    }

    #[test]
    fn unpack_assignment_requires_lvalues() {
        let err = Parser::new("a, 1 = f()\n", "<test>").parse_program().unwrap_err();
        assert!(err[0].message.contains("lvalue"));
    }

    #[test]
    fn parses_class_with_inheritance_and_super() {
        let ast = parse("class B is A fun f() return super.f() end end\n");
        assert!(matches!(ast.stmt(ast.program[0]).kind, StmtKind::ClassDecl { .. }));
    }

    #[test]
    fn parses_construct_as_a_named_method() {
        let ast = parse("class Point construct(this, x, y) this.x = x; this.y = y end end\n");
        let StmtKind::ClassDecl { methods, .. } = &ast.stmt(ast.program[0]).kind else { panic!() };
        assert_eq!(methods.len(), 1);
        let StmtKind::FunDecl { name, params, .. } = &ast.stmt(methods[0]).kind else { panic!() };
        assert_eq!(&**name, "construct");
        assert_eq!(params.positional.len(), 3);
    }

    #[test]
    fn yield_inside_construct_is_a_compile_error() {
        let err = Parser::new("class A construct() yield 1 end end\n", "<test>").parse_program().unwrap_err();
        assert!(err[0].message.contains("yield"));
    }
}
