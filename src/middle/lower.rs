//! Lowering from the AST to the basic-block IR.
//!
//! All allocas are created up front in the entry block: one for the
//! parameter (immediately stored to), one per declared local found by a
//! recursive pre-scan of the body, and one `ret` slot that unifies the
//! return path.  Every `return` stores into the `ret` slot and branches to
//! the function's single `end` block; statements after a `return` are
//! lowered into a fresh block that nothing branches to, and a final BFS
//! prune deletes those unreachable blocks.

use crate::common::{id, Id, Map, Set};
use crate::front::ast;

use super::ir::*;

/// Lower a checked program.  The AST is consumed; the IR is self-contained.
pub fn lower(program: ast::Program) -> Module {
    let externs = vec![
        ExternDecl {
            name: id("print"),
            returns_value: false,
            takes_arg: true,
        },
        ExternDecl {
            name: id("read"),
            returns_value: true,
            takes_arg: false,
        },
    ];
    let func = lower_function(&program.func, &externs);
    Module {
        externs,
        funcs: vec![func],
    }
}

fn lower_function(func: &ast::Function, externs: &[ExternDecl]) -> Function {
    let mut f = Function::new(func.name, func.param);
    let entry = f.add_block("entry");

    let param_slot = f.push(entry, Inst::Alloca { name: func.param });
    f.push(
        entry,
        Inst::Store {
            value: Value::Param,
            dst: Value::Inst(param_slot),
        },
    );

    let mut var_map = Map::new();
    var_map.insert(func.param, param_slot);
    for name in declared_names(&func.body) {
        let slot = f.push(entry, Inst::Alloca { name });
        var_map.insert(name, slot);
    }

    let ret_slot = f.push(entry, Inst::Alloca { name: id("ret") });

    let mut builder = Builder {
        f,
        var_map,
        ret_slot,
        exit: None,
        externs,
    };
    let last = builder.stmt(&func.body, entry);

    // Fall off the end of the body: branch to the unified exit.  If the body
    // ended in a `return`, `last` is an unreferenced continuation block and
    // this branch disappears with it in the prune.
    let exit = builder.exit_block();
    builder.f.push(last, Inst::Br { target: exit });

    let ret_val = builder.f.push(
        exit,
        Inst::Load {
            src: Value::Inst(ret_slot),
        },
    );
    builder.f.push(
        exit,
        Inst::Ret {
            value: Value::Inst(ret_val),
        },
    );

    let mut f = builder.f;
    f.prune_unreachable();
    f
}

/// Every name declared anywhere in the body, in declaration order.  A name
/// declared in more than one scope shares a single entry-block slot.
fn declared_names(body: &ast::Stmt) -> Vec<Id> {
    fn walk(stmt: &ast::Stmt, seen: &mut Set<Id>, order: &mut Vec<Id>) {
        match stmt {
            ast::Stmt::Block(stmts) => {
                for stmt in stmts {
                    walk(stmt, seen, order);
                }
            }
            ast::Stmt::Decl(name) => {
                if seen.insert(*name) {
                    order.push(*name);
                }
            }
            ast::Stmt::If { then, els, .. } => {
                walk(then, seen, order);
                if let Some(els) = els {
                    walk(els, seen, order);
                }
            }
            ast::Stmt::While { body, .. } => walk(body, seen, order),
            _ => {}
        }
    }
    let mut seen = Set::new();
    let mut order = Vec::new();
    walk(body, &mut seen, &mut order);
    order
}

struct Builder<'a> {
    f: Function,
    var_map: Map<Id, InstId>,
    ret_slot: InstId,
    exit: Option<BlockId>,
    externs: &'a [ExternDecl],
}

impl Builder<'_> {
    /// The function's single synthesized exit block.
    fn exit_block(&mut self) -> BlockId {
        match self.exit {
            Some(b) => b,
            None => {
                let b = self.f.add_block("end");
                self.exit = Some(b);
                b
            }
        }
    }

    fn slot(&self, name: Id) -> Value {
        Value::Inst(self.var_map[&name])
    }

    /// Lower one statement into `cur`; returns the block the next statement
    /// should be appended to.
    fn stmt(&mut self, stmt: &ast::Stmt, cur: BlockId) -> BlockId {
        match stmt {
            ast::Stmt::Block(stmts) => {
                let mut cur = cur;
                for stmt in stmts {
                    cur = self.stmt(stmt, cur);
                }
                cur
            }
            // Storage was reserved by the pre-scan.
            ast::Stmt::Decl(_) => cur,
            ast::Stmt::Assign(lhs, rhs) => {
                let value = self.expr(rhs, cur);
                let dst = self.slot(*lhs);
                self.f.push(cur, Inst::Store { value, dst });
                cur
            }
            ast::Stmt::Return(expr) => {
                let value = self.expr(expr, cur);
                let dst = Value::Inst(self.ret_slot);
                self.f.push(cur, Inst::Store { value, dst });
                let exit = self.exit_block();
                self.f.push(cur, Inst::Br { target: exit });
                // Anything lowered after this lands in an unreachable block.
                self.f.add_block("end")
            }
            ast::Stmt::If { cond, then, els } => {
                let cond = self.expr(cond, cur);
                let then_b = self.f.add_block("if_true");
                let else_b = self.f.add_block("if_false");
                let end_b = self.f.add_block("if_end");
                self.f.push(
                    cur,
                    Inst::CondBr {
                        cond,
                        then: then_b,
                        els: else_b,
                    },
                );
                let then_end = self.stmt(then, then_b);
                self.f.push(then_end, Inst::Br { target: end_b });
                let else_end = match els {
                    Some(els) => self.stmt(els, else_b),
                    None => else_b,
                };
                self.f.push(else_end, Inst::Br { target: end_b });
                end_b
            }
            ast::Stmt::While { cond, body } => {
                let cond_b = self.f.add_block("while_cond");
                self.f.push(cur, Inst::Br { target: cond_b });
                let cond_v = self.expr(cond, cond_b);
                let body_b = self.f.add_block("while_true");
                let exit_b = self.f.add_block("while_false");
                self.f.push(
                    cond_b,
                    Inst::CondBr {
                        cond: cond_v,
                        then: body_b,
                        els: exit_b,
                    },
                );
                let body_end = self.stmt(body, body_b);
                self.f.push(body_end, Inst::Br { target: cond_b });
                exit_b
            }
            ast::Stmt::Call(callee, arg) => {
                let arg = arg.as_ref().map(|a| self.expr(a, cur));
                self.call(*callee, arg, cur);
                cur
            }
        }
    }

    /// Lower an expression into `cur`.  Expressions are straight-line and
    /// never change the insertion block.
    fn expr(&mut self, expr: &ast::Expr, cur: BlockId) -> Value {
        match expr {
            ast::Expr::Const(v) => Value::Const(*v),
            ast::Expr::Var(name) => {
                let src = self.slot(*name);
                Value::Inst(self.f.push(cur, Inst::Load { src }))
            }
            ast::Expr::Negate(inner) => {
                let operand = self.expr(inner, cur);
                Value::Inst(self.f.push(
                    cur,
                    Inst::BinArith {
                        op: ArithOp::Sub,
                        lhs: Value::Const(0),
                        rhs: operand,
                    },
                ))
            }
            ast::Expr::BinOp { op, lhs, rhs } => {
                let lhs = self.expr(lhs, cur);
                let rhs = self.expr(rhs, cur);
                let op = match op {
                    ast::BOp::Add => ArithOp::Add,
                    ast::BOp::Sub => ArithOp::Sub,
                    ast::BOp::Mul => ArithOp::Mul,
                    ast::BOp::Div => ArithOp::Sdiv,
                };
                Value::Inst(self.f.push(cur, Inst::BinArith { op, lhs, rhs }))
            }
            ast::Expr::RelOp { op, lhs, rhs } => {
                let lhs = self.expr(lhs, cur);
                let rhs = self.expr(rhs, cur);
                let pred = match op {
                    ast::ROp::Lt => Pred::Slt,
                    ast::ROp::Gt => Pred::Sgt,
                    ast::ROp::Le => Pred::Sle,
                    ast::ROp::Ge => Pred::Sge,
                    ast::ROp::Eq => Pred::Eq,
                    ast::ROp::Ne => Pred::Ne,
                };
                Value::Inst(self.f.push(cur, Inst::ICmp { pred, lhs, rhs }))
            }
            ast::Expr::Call(callee, arg) => {
                let arg = arg.as_ref().map(|a| self.expr(a, cur));
                self.call(*callee, arg, cur)
            }
        }
    }

    fn call(&mut self, callee: Id, arg: Option<Value>, cur: BlockId) -> Value {
        // The checker does not know about callees; a name other than the
        // two built-ins cannot come out of a valid pipeline.
        let decl = self
            .externs
            .iter()
            .find(|e| e.name == callee)
            .unwrap_or_else(|| panic!("call to unknown function '{callee}'"));
        let returns_value = decl.returns_value;
        Value::Inst(self.f.push(
            cur,
            Inst::Call {
                callee,
                arg,
                returns_value,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front;

    fn build(src: &str) -> Module {
        let program = front::parse(src).unwrap();
        front::check(&program).unwrap();
        lower(program)
    }

    fn block_names(f: &Function) -> Vec<&str> {
        f.blocks.iter().map(|b| b.name.as_str()).collect()
    }

    #[test]
    fn straight_line_function() {
        let module = build("int func(int p) { int x; x = p + p; return x; }");
        let f = &module.funcs[0];
        assert_eq!(block_names(f), vec!["entry", "end"]);

        let entry = f.entry();
        let insts: Vec<&Inst> = f.block(entry).insts.iter().map(|i| f.inst(*i)).collect();
        // allocas for p, x, ret; store of the parameter; two loads of p;
        // the add; the store to x; branch to end.
        let allocas: Vec<&str> = insts
            .iter()
            .filter_map(|i| match i {
                Inst::Alloca { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(allocas, vec!["p", "x", "ret"]);
        assert!(matches!(f.terminator(entry), Some(Inst::Br { .. })));

        let end = BlockId(1);
        let end_insts: Vec<&Inst> = f.block(end).insts.iter().map(|i| f.inst(*i)).collect();
        assert!(matches!(end_insts[0], Inst::Load { .. }));
        assert!(matches!(end_insts[1], Inst::Ret { .. }));
    }

    #[test]
    fn while_shape() {
        let module = build(
            "int func(int p) { int i; i = 0; while (i < p) { print(i); i = i + 1; } return 0; }",
        );
        let f = &module.funcs[0];
        assert_eq!(
            block_names(f),
            vec!["entry", "while_cond", "while_true", "while_false", "end"]
        );
        // The condition block re-evaluates the test and branches both ways.
        let cond = BlockId(1);
        match f.terminator(cond) {
            Some(Inst::CondBr { cond, then, els }) => {
                assert!(matches!(f.inst(match cond {
                    Value::Inst(i) => *i,
                    _ => panic!(),
                }), Inst::ICmp { pred: Pred::Slt, .. }));
                assert_eq!(*then, BlockId(2));
                assert_eq!(*els, BlockId(3));
            }
            other => panic!("expected CondBr, got {other:?}"),
        }
        // The body loops back to the condition.
        assert_eq!(f.successors(BlockId(2)), vec![cond]);
    }

    #[test]
    fn code_after_return_is_pruned() {
        let module = build("int func(int p) { return p; p = p + 1; return p; }");
        let f = &module.funcs[0];
        assert_eq!(block_names(f), vec!["entry", "end"]);
        // The surviving store is the store of p into the ret slot; the
        // incremented store is gone with its block.
        let stores: Vec<&Inst> = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .map(|i| f.inst(*i))
            .filter(|i| matches!(i, Inst::Store { .. }))
            .collect();
        assert_eq!(stores.len(), 2); // parameter spill + ret slot
    }

    #[test]
    fn if_else_joins_at_end() {
        let module = build(
            "int func(int p) { int x; if (p < 0) { x = 1; } else { x = 2; } return x; }",
        );
        let f = &module.funcs[0];
        assert_eq!(
            block_names(f),
            vec!["entry", "if_true", "if_false", "if_end", "end"]
        );
        assert_eq!(f.successors(BlockId(1)), vec![BlockId(3)]);
        assert_eq!(f.successors(BlockId(2)), vec![BlockId(3)]);
        let preds = f.predecessors();
        assert_eq!(preds[&BlockId(3)].len(), 2);
    }

    #[test]
    fn early_return_skips_the_join() {
        let module =
            build("int func(int p) { int x; x = p + 1; if (p > 0) { return x; } x = p + 1; return x; }");
        let f = &module.funcs[0];
        // if_true stores to ret and branches straight to end.
        let if_true = BlockId(1);
        assert_eq!(f.block(if_true).name.as_str(), "if_true");
        let succs = f.successors(if_true);
        assert_eq!(succs.len(), 1);
        assert_eq!(f.block(succs[0]).name.as_str(), "end");
        // Both `p + 1` additions survive in their own blocks.
        let adds = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter(|i| matches!(f.inst(**i), Inst::BinArith { op: ArithOp::Add, .. }))
            .count();
        assert_eq!(adds, 2);
    }

    #[test]
    fn every_reachable_block_is_terminated() {
        let module = build(
            "int func(int p) { int i; i = 0; while (i < p) { if (i == 3) { return i; } i = i + 1; } return 0; }",
        );
        let f = &module.funcs[0];
        for b in 0..f.blocks.len() {
            assert!(
                f.terminator(BlockId(b)).is_some(),
                "block {} lacks a terminator",
                f.block(BlockId(b)).name
            );
        }
    }
}
