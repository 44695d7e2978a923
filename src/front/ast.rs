//! The abstract syntax tree.

use crate::common::Id;

/// A source program: any number of extern declarations and one function.
#[derive(Debug)]
pub struct Program {
    pub externs: Vec<Extern>,
    pub func: Function,
}

/// An extern declaration for one of the two built-ins.
#[derive(Debug)]
pub struct Extern {
    pub name: Id,
    pub returns_value: bool,
    pub takes_arg: bool,
}

/// The single `int <name>(int <param>)` function.
#[derive(Debug)]
pub struct Function {
    pub name: Id,
    pub param: Id,
    pub body: Stmt,
}

#[derive(Debug)]
pub enum Stmt {
    Block(Vec<Stmt>),
    Decl(Id),
    Assign(Id, Expr),
    If {
        cond: Expr,
        then: Box<Stmt>,
        els: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    Return(Expr),
    /// A call in statement position, e.g. `print(x);`.
    Call(Id, Option<Expr>),
}

#[derive(Debug)]
pub enum Expr {
    Var(Id),
    Const(i32),
    Call(Id, Option<Box<Expr>>),
    BinOp {
        op: BOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    RelOp {
        op: ROp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Negate(Box<Expr>),
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Relational operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ROp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}
