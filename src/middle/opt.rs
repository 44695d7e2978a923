//! Local optimizations: common-subexpression elimination, constant folding,
//! and dead-code elimination, repeated with inter-block constant propagation
//! until nothing changes.

use super::dataflow;
use super::ir::*;

pub fn optimize(mut module: Module) -> Module {
    for f in &mut module.funcs {
        optimize_function(f);
    }
    module
}

fn optimize_function(f: &mut Function) {
    loop {
        local_passes(f);
        if !dataflow::propagate_constants(f) {
            break;
        }
    }
}

fn local_passes(f: &mut Function) {
    for b in 0..f.blocks.len() {
        let b = BlockId(b);
        cse_block(f, b);
        fold_block(f, b);
        dce_block(f, b);
    }
}

/// For every pair of instructions computing the same value in this block,
/// rewire the later one's uses onto the earlier one.  The later instruction
/// is left in place for DCE to collect.
fn cse_block(f: &mut Function, b: BlockId) {
    let insts = f.block(b).insts.clone();
    for (i, &first) in insts.iter().enumerate() {
        if matches!(f.inst(first), Inst::Alloca { .. }) {
            continue;
        }
        for (j, &second) in insts.iter().enumerate().skip(i + 1) {
            if same_computation(f.inst(first), f.inst(second))
                && safe_to_replace(f, &insts, i, j)
            {
                f.replace_all_uses_with(second, Value::Inst(first));
            }
        }
    }
}

fn same_computation(a: &Inst, b: &Inst) -> bool {
    match (a, b) {
        (Inst::Load { src: sa }, Inst::Load { src: sb }) => sa == sb,
        (
            Inst::BinArith {
                op: oa,
                lhs: la,
                rhs: ra,
            },
            Inst::BinArith {
                op: ob,
                lhs: lb,
                rhs: rb,
            },
        ) => oa == ob && la == lb && ra == rb,
        (
            Inst::ICmp {
                pred: pa,
                lhs: la,
                rhs: ra,
            },
            Inst::ICmp {
                pred: pb,
                lhs: lb,
                rhs: rb,
            },
        ) => pa == pb && la == lb && ra == rb,
        _ => false,
    }
}

/// The only aliasing reasoning in the compiler: a pair of loads may be
/// merged unless a store to their address sits between them.
fn safe_to_replace(f: &Function, insts: &[InstId], i: usize, j: usize) -> bool {
    let src = match f.inst(insts[i]) {
        Inst::Load { src } => *src,
        _ => return true,
    };
    !insts[i + 1..j].iter().any(|mid| match f.inst(*mid) {
        Inst::Store { dst, .. } => *dst == src,
        _ => false,
    })
}

/// Fold `add`/`sub`/`mul` with two constant operands, rewriting users to the
/// two's-complement result.  Division and comparisons are never folded.
fn fold_block(f: &mut Function, b: BlockId) {
    let insts = f.block(b).insts.clone();
    for id in insts {
        if let Inst::BinArith {
            op,
            lhs: Value::Const(x),
            rhs: Value::Const(y),
        } = *f.inst(id)
        {
            let folded = match op {
                ArithOp::Add => x.wrapping_add(y),
                ArithOp::Sub => x.wrapping_sub(y),
                ArithOp::Mul => x.wrapping_mul(y),
                ArithOp::Sdiv => continue,
            };
            f.replace_all_uses_with(id, Value::Const(folded));
        }
    }
}

/// One erase sweep over the block.  Chains of dead instructions converge
/// through the caller's fixpoint, not within a single sweep.
fn dce_block(f: &mut Function, b: BlockId) {
    let insts = f.block(b).insts.clone();
    for id in insts {
        let inst = f.inst(id);
        let keep = matches!(
            inst,
            Inst::Store { .. } | Inst::Call { .. } | Inst::Alloca { .. }
        ) || inst.is_terminator();
        if !keep && f.num_uses(id) == 0 {
            f.erase(b, id);
        }
    }
}
