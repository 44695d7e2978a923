//! The parser.

use std::fmt::Debug;

use derive_more::derive::Display;

use crate::common::id;

use super::ast::*;
use super::lex::{tokenize, Token, TokenKind};

#[derive(Display)]
#[display("Syntax error: line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl Debug for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub fn parse(input: &str) -> Result<Program, ParseError> {
    let tokens = tokenize(input).map_err(|e| ParseError {
        line: e.line,
        message: format!("unexpected character {:?}", e.found),
    })?;
    let mut parser = Parser { tokens, pos: 0 };
    let program = parser.program()?;
    parser.expect_end()?;
    Ok(program)
}

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn peek2_kind(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos + 1).map(|t| t.kind)
    }

    fn line(&self) -> usize {
        self.peek()
            .map(|t| t.line)
            .or_else(|| self.tokens.last().map(|t| t.line))
            .unwrap_or(1)
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, ParseError> {
        Err(ParseError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn bump(&mut self) -> Result<Token<'src>, ParseError> {
        match self.tokens.get(self.pos) {
            Some(token) => {
                self.pos += 1;
                Ok(*token)
            }
            None => self.error("unexpected end of input"),
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token<'src>, ParseError> {
        match self.peek().copied() {
            Some(token) if token.kind == kind => self.bump(),
            Some(token) => self.error(format!("expected '{kind}', found '{}'", token.text)),
            None => self.error(format!("expected '{kind}', found end of input")),
        }
    }

    fn expect_end(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => self.error(format!("trailing input at '{}'", token.text)),
        }
    }

    fn name(&mut self) -> Result<crate::common::Id, ParseError> {
        let token = self.expect(TokenKind::Id)?;
        Ok(id(token.text))
    }

    fn program(&mut self) -> Result<Program, ParseError> {
        let mut externs = Vec::new();
        while self.peek_kind() == Some(TokenKind::Extern) {
            externs.push(self.extern_decl()?);
        }
        let func = self.function()?;
        Ok(Program { externs, func })
    }

    fn extern_decl(&mut self) -> Result<Extern, ParseError> {
        self.expect(TokenKind::Extern)?;
        let returns_value = match self.bump()? {
            t if t.kind == TokenKind::Int => true,
            t if t.kind == TokenKind::Void => false,
            t => return self.error(format!("expected return type, found '{}'", t.text)),
        };
        let name = self.name()?;
        self.expect(TokenKind::LParen)?;
        let takes_arg = self.eat(TokenKind::Int);
        if !takes_arg {
            self.eat(TokenKind::Void);
        }
        self.expect(TokenKind::RParen)?;
        self.expect(TokenKind::Semi)?;
        Ok(Extern {
            name,
            returns_value,
            takes_arg,
        })
    }

    fn function(&mut self) -> Result<Function, ParseError> {
        self.expect(TokenKind::Int)?;
        let name = self.name()?;
        self.expect(TokenKind::LParen)?;
        self.expect(TokenKind::Int)?;
        let param = self.name()?;
        self.expect(TokenKind::RParen)?;
        let body = self.block()?;
        Ok(Function { name, param, body })
    }

    fn block(&mut self) -> Result<Stmt, ParseError> {
        self.expect(TokenKind::LBrace)?;
        let mut stmts = Vec::new();
        while self.peek_kind() != Some(TokenKind::RBrace) {
            if self.peek().is_none() {
                return self.error("unterminated block");
            }
            stmts.push(self.stmt()?);
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Stmt::Block(stmts))
    }

    fn stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_kind() {
            Some(TokenKind::LBrace) => self.block(),
            Some(TokenKind::Int) => {
                self.bump()?;
                let name = self.name()?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Decl(name))
            }
            Some(TokenKind::If) => {
                self.bump()?;
                self.expect(TokenKind::LParen)?;
                let cond = self.rexpr()?;
                self.expect(TokenKind::RParen)?;
                let then = Box::new(self.stmt()?);
                let els = if self.eat(TokenKind::Else) {
                    Some(Box::new(self.stmt()?))
                } else {
                    None
                };
                Ok(Stmt::If { cond, then, els })
            }
            Some(TokenKind::While) => {
                self.bump()?;
                self.expect(TokenKind::LParen)?;
                let cond = self.rexpr()?;
                self.expect(TokenKind::RParen)?;
                let body = Box::new(self.stmt()?);
                Ok(Stmt::While { cond, body })
            }
            Some(TokenKind::Return) => {
                self.bump()?;
                let expr = self.expr()?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Return(expr))
            }
            Some(TokenKind::Id) if self.peek2_kind() == Some(TokenKind::LParen) => {
                let callee = self.name()?;
                self.expect(TokenKind::LParen)?;
                let arg = if self.peek_kind() == Some(TokenKind::RParen) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(TokenKind::RParen)?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Call(callee, arg))
            }
            Some(TokenKind::Id) => {
                let lhs = self.name()?;
                self.expect(TokenKind::Assign)?;
                let rhs = self.expr()?;
                self.expect(TokenKind::Semi)?;
                Ok(Stmt::Assign(lhs, rhs))
            }
            _ => self.error("expected a statement"),
        }
    }

    /// A relational test, only valid in `if`/`while` conditions.
    fn rexpr(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.expr()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Lt) => ROp::Lt,
            Some(TokenKind::Gt) => ROp::Gt,
            Some(TokenKind::Le) => ROp::Le,
            Some(TokenKind::Ge) => ROp::Ge,
            Some(TokenKind::EqEq) => ROp::Eq,
            Some(TokenKind::Ne) => ROp::Ne,
            _ => return self.error("expected a relational operator"),
        };
        self.bump()?;
        let rhs = self.expr()?;
        Ok(Expr::RelOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BOp::Add,
                Some(TokenKind::Minus) => BOp::Sub,
                _ => break,
            };
            self.bump()?;
            let rhs = self.term()?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BOp::Mul,
                Some(TokenKind::Slash) => BOp::Div,
                _ => break,
            };
            self.bump()?;
            let rhs = self.factor()?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        if self.eat(TokenKind::Minus) {
            let inner = self.factor()?;
            return Ok(Expr::Negate(Box::new(inner)));
        }
        match self.peek_kind() {
            Some(TokenKind::Num) => {
                let token = self.bump()?;
                match token.text.parse::<i32>() {
                    Ok(value) => Ok(Expr::Const(value)),
                    Err(_) => self.error(format!("integer literal '{}' out of range", token.text)),
                }
            }
            Some(TokenKind::Id) if self.peek2_kind() == Some(TokenKind::LParen) => {
                let callee = self.name()?;
                self.expect(TokenKind::LParen)?;
                let arg = if self.peek_kind() == Some(TokenKind::RParen) {
                    None
                } else {
                    Some(Box::new(self.expr()?))
                };
                self.expect(TokenKind::RParen)?;
                Ok(Expr::Call(callee, arg))
            }
            Some(TokenKind::Id) => Ok(Expr::Var(self.name()?)),
            Some(TokenKind::LParen) => {
                self.bump()?;
                let inner = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            _ => self.error("expected an expression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_kitchen_sink() {
        let src = "\
extern void print(int);
extern int read();

int func(int p) {
    int i;
    i = read();
    while (i < p) {
        print(i * 2);
        i = i + 1;
    }
    if (i == p) {
        return -i;
    } else {
        return p / 2;
    }
}";
        let program = parse(src).unwrap();
        assert_eq!(program.externs.len(), 2);
        assert_eq!(program.func.name.as_str(), "func");
        assert_eq!(program.func.param.as_str(), "p");
        let Stmt::Block(stmts) = &program.func.body else {
            panic!("function body should be a block");
        };
        assert_eq!(stmts.len(), 4);
        assert!(matches!(stmts[0], Stmt::Decl(_)));
        assert!(matches!(stmts[2], Stmt::While { .. }));
    }

    #[test]
    fn precedence_binds_term_tighter() {
        let program = parse("int f(int p) { return 1 + 2 * 3; }").unwrap();
        let Stmt::Block(stmts) = &program.func.body else {
            panic!()
        };
        let Stmt::Return(Expr::BinOp { op: BOp::Add, rhs, .. }) = &stmts[0] else {
            panic!("expected `1 + (2 * 3)`");
        };
        assert!(matches!(**rhs, Expr::BinOp { op: BOp::Mul, .. }));
    }

    #[test]
    fn reports_the_failing_line() {
        let err = parse("int f(int p) {\n  x = ;\n}").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
