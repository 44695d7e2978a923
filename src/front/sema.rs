//! Scope checking.
//!
//! The language is monomorphic, so the only static checks are lexical: every
//! variable use must resolve to a declaration, and no name may be declared
//! twice in the same scope.

use std::fmt::Debug;

use derive_more::derive::Display;

use crate::common::{Id, Set};

use super::ast::*;

#[derive(Display, PartialEq, Eq)]
#[display("Semantic error: {}", self.0)]
pub struct SemaError(String);

impl Debug for SemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Check the program, reporting the first scoping error found.
pub fn check(program: &Program) -> Result<(), SemaError> {
    let mut scopes = Scopes::default();
    scopes.push();
    scopes.insert(program.func.param)?;
    // The function body is a block; its statements share the function scope,
    // matching the parameter's scope.
    match &program.func.body {
        Stmt::Block(stmts) => {
            for stmt in stmts {
                scopes.stmt(stmt)?;
            }
        }
        other => scopes.stmt(other)?,
    }
    scopes.pop();
    Ok(())
}

/// A stack of symbol tables, innermost scope last.
#[derive(Default)]
struct Scopes {
    tables: Vec<Set<Id>>,
}

impl Scopes {
    fn push(&mut self) {
        self.tables.push(Set::new());
    }

    fn pop(&mut self) {
        self.tables.pop();
    }

    fn insert(&mut self, name: Id) -> Result<(), SemaError> {
        let innermost = self.tables.last_mut().unwrap();
        if !innermost.insert(name) {
            return Err(SemaError(format!(
                "Variable '{name}' already declared in this scope."
            )));
        }
        Ok(())
    }

    fn resolve(&self, name: Id) -> Result<(), SemaError> {
        if self.tables.iter().rev().any(|table| table.contains(&name)) {
            Ok(())
        } else {
            Err(SemaError(format!("Variable '{name}' not declared.")))
        }
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), SemaError> {
        match stmt {
            Stmt::Block(stmts) => {
                self.push();
                for stmt in stmts {
                    self.stmt(stmt)?;
                }
                self.pop();
                Ok(())
            }
            Stmt::Decl(name) => self.insert(*name),
            Stmt::Assign(lhs, rhs) => {
                self.resolve(*lhs)?;
                self.expr(rhs)
            }
            Stmt::If { cond, then, els } => {
                self.expr(cond)?;
                self.stmt(then)?;
                if let Some(els) = els {
                    self.stmt(els)?;
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                self.expr(cond)?;
                self.stmt(body)
            }
            Stmt::Return(expr) => self.expr(expr),
            Stmt::Call(_, arg) => match arg {
                Some(arg) => self.expr(arg),
                None => Ok(()),
            },
        }
    }

    fn expr(&self, expr: &Expr) -> Result<(), SemaError> {
        match expr {
            Expr::Var(name) => self.resolve(*name),
            Expr::Const(_) => Ok(()),
            Expr::Call(_, arg) => match arg {
                Some(arg) => self.expr(arg),
                None => Ok(()),
            },
            Expr::BinOp { lhs, rhs, .. } | Expr::RelOp { lhs, rhs, .. } => {
                self.expr(lhs)?;
                self.expr(rhs)
            }
            Expr::Negate(inner) => self.expr(inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::parse;

    #[test]
    fn accepts_scoped_redeclaration() {
        let program = parse("int f(int p) { int x; { int x; x = 1; } x = 2; return x; }").unwrap();
        assert!(check(&program).is_ok());
    }

    #[test]
    fn rejects_redeclaration_in_one_scope() {
        let program = parse("int f(int p) { int x; int x; return 0; }").unwrap();
        let err = check(&program).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Semantic error: Variable 'x' already declared in this scope."
        );
    }

    #[test]
    fn rejects_undeclared_use() {
        let program = parse("int f(int p) { y = 3; return y; }").unwrap();
        let err = check(&program).unwrap_err();
        assert_eq!(err.to_string(), "Semantic error: Variable 'y' not declared.");
    }

    #[test]
    fn parameter_is_in_scope() {
        let program = parse("int f(int p) { return p + 1; }").unwrap();
        assert!(check(&program).is_ok());
    }

    #[test]
    fn inner_declarations_do_not_leak() {
        let program = parse("int f(int p) { { int x; x = 1; } return x; }").unwrap();
        let err = check(&program).unwrap_err();
        assert_eq!(err.to_string(), "Semantic error: Variable 'x' not declared.");
    }
}
