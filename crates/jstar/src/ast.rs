//! Arena-allocated AST.
//!
//! All nodes for one compilation live in a single [`Ast`] arena; parent/child edges are
//! owning `Vec`s, and every cross-reference (a `break` pointing at its enclosing loop, a
//! `continue` target, an identifier's resolved binding) is recorded by index rather than by
//! pointer, resolved later by the compiler.

use crate::error::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExprId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BNot,
    Len,
    FlattenLen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Is,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// One formal parameter list: positional names, then `(name, default expr)` pairs, then an
/// optional vararg name that collects excess positional arguments into a tuple.
#[derive(Debug, Clone, Default)]
pub struct Params {
    pub positional: Vec<Box<str>>,
    pub defaults: Vec<(Box<str>, ExprId)>,
    pub vararg: Option<Box<str>>,
}

impl Params {
    pub fn arity(&self) -> usize {
        self.positional.len() + self.defaults.len()
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Null,
    True,
    False,
    Number(f64),
    Str(Box<str>),
    Ident(Box<str>),
    Super,
    Tuple(Vec<ExprId>),
    List(Vec<ExprId>),
    Table(Vec<(ExprId, ExprId)>),
    FunLit { params: Params, body: Vec<StmtId>, is_generator: bool },
    Yield(Option<ExprId>),
    Spread(ExprId),
    Unary { op: UnaryOp, expr: ExprId },
    Binary { op: BinaryOp, lhs: ExprId, rhs: ExprId },
    Logical { op: LogicalOp, lhs: ExprId, rhs: ExprId },
    Ternary { cond: ExprId, then_branch: ExprId, else_branch: ExprId },
    /// Plain or compound (`+=` etc, `op = Some(..)`) assignment; `target` must be an lvalue
    /// (`Ident`, `Field`, or `Index`) — enforced by the compiler.
    Assign { target: ExprId, op: Option<BinaryOp>, value: ExprId },
    /// `a, b = expr` — every entry of `targets` must independently be an lvalue.
    Unpack { targets: Vec<ExprId>, value: ExprId },
    Call { callee: ExprId, args: Vec<ExprId> },
    /// `callee { ... }` — a call with a single trailing table-literal argument.
    BraceCall { callee: ExprId, table: ExprId },
    Index { object: ExprId, index: ExprId },
    Field { object: ExprId, name: Box<str> },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub loc: Location,
}

#[derive(Debug, Clone)]
pub struct ExceptArm {
    pub class_expr: ExprId,
    pub binding: Option<Box<str>>,
    pub body: Vec<StmtId>,
}

#[derive(Debug, Clone)]
pub struct ImportNames {
    pub names: Vec<(Box<str>, Option<Box<str>>)>,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    VarDecl { name: Box<str>, init: Option<ExprId> },
    FunDecl { name: Box<str>, params: Params, body: Vec<StmtId>, is_generator: bool, decorators: Vec<ExprId>, is_static: bool },
    NativeDecl { name: Box<str>, params: Params, decorators: Vec<ExprId>, is_static: bool },
    ClassDecl { name: Box<str>, superclass: Option<ExprId>, methods: Vec<StmtId>, decorators: Vec<ExprId> },
    If { cond: ExprId, then_body: Vec<StmtId>, elifs: Vec<(ExprId, Vec<StmtId>)>, else_body: Option<Vec<StmtId>> },
    While { cond: ExprId, body: Vec<StmtId> },
    ForC { init: Option<StmtId>, cond: Option<ExprId>, step: Option<ExprId>, body: Vec<StmtId> },
    ForIn { binding: Box<str>, iterable: ExprId, body: Vec<StmtId> },
    TryExcept { body: Vec<StmtId>, excepts: Vec<ExceptArm>, ensure: Option<Vec<StmtId>> },
    Raise(ExprId),
    With { expr: ExprId, binding: Box<str>, body: Vec<StmtId> },
    Return(Option<ExprId>),
    Break,
    Continue,
    Import { path: Vec<Box<str>>, module_alias: Option<Box<str>>, names: Option<ImportNames> },
    Block(Vec<StmtId>),
    ExprStmt(ExprId),
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub loc: Location,
}

/// The arena for one compilation unit. Owns every expression and statement node produced by
/// the parser for a single source file.
#[derive(Debug, Default)]
pub struct Ast {
    exprs: Vec<Expr>,
    stmts: Vec<Stmt>,
    pub program: Vec<StmtId>,
}

impl Ast {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_expr(&mut self, kind: ExprKind, loc: Location) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr { kind, loc });
        id
    }

    pub fn alloc_stmt(&mut self, kind: StmtKind, loc: Location) -> StmtId {
        let id = StmtId(self.stmts.len() as u32);
        self.stmts.push(Stmt { kind, loc });
        id
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }
}
