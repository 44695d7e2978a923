//! Reaching-definitions analysis over store instructions, and the constant
//! propagation built on it.
//!
//! `GEN[B]` holds the last store per address in `B`; `KILL[B]` holds every
//! store elsewhere in the function whose destination matches one of `B`'s
//! stores.  `IN`/`OUT` are iterated in program order to a fixpoint, with
//! `OUT[B] = GEN[B] ∪ (IN[B] \ KILL[B])`.

use crate::common::{Map, Set};

use super::ir::*;

/// Rewrite loads whose every reaching store wrote one known constant.
/// Returns true if any load was rewritten.
pub fn propagate_constants(f: &mut Function) -> bool {
    let sets = ReachingStores::compute(f);
    let mut changed = false;

    for b in 0..f.blocks.len() {
        let b = BlockId(b);
        let mut reaching = sets.input[&b].clone();
        let mut doomed = Vec::new();

        for &id in f.block(b).insts.clone().iter() {
            match f.inst(id) {
                Inst::Store { dst, .. } => {
                    let dst = *dst;
                    reaching.retain(|s| store_dst(f, *s) != dst);
                    reaching.insert(id);
                }
                Inst::Load { src } => {
                    let src = *src;
                    let mut constants = reaching
                        .iter()
                        .filter(|s| store_dst(f, **s) == src)
                        .map(|s| store_value(f, *s));
                    let Some(first) = constants.next() else {
                        continue;
                    };
                    let Value::Const(value) = first else {
                        continue;
                    };
                    if constants.all(|v| v == Value::Const(value)) {
                        f.replace_all_uses_with(id, Value::Const(value));
                        doomed.push(id);
                        changed = true;
                    }
                }
                _ => {}
            }
        }

        for id in doomed {
            f.erase(b, id);
        }
    }

    changed
}

fn store_dst(f: &Function, store: InstId) -> Value {
    match f.inst(store) {
        Inst::Store { dst, .. } => *dst,
        _ => unreachable!("reaching sets hold stores only"),
    }
}

fn store_value(f: &Function, store: InstId) -> Value {
    match f.inst(store) {
        Inst::Store { value, .. } => *value,
        _ => unreachable!("reaching sets hold stores only"),
    }
}

struct ReachingStores {
    input: Map<BlockId, Set<InstId>>,
}

impl ReachingStores {
    fn compute(f: &Function) -> ReachingStores {
        let blocks: Vec<BlockId> = (0..f.blocks.len()).map(BlockId).collect();

        let mut stores_of: Map<BlockId, Vec<InstId>> = Map::new();
        for &b in &blocks {
            stores_of.insert(
                b,
                f.block(b)
                    .insts
                    .iter()
                    .copied()
                    .filter(|i| matches!(f.inst(*i), Inst::Store { .. }))
                    .collect(),
            );
        }

        // GEN: the store that survives per address, i.e. the last one.
        let mut gen: Map<BlockId, Set<InstId>> = Map::new();
        for &b in &blocks {
            let mut last_per_addr: Map<Value, InstId> = Map::new();
            for &s in &stores_of[&b] {
                last_per_addr.insert(store_dst(f, s), s);
            }
            gen.insert(b, last_per_addr.into_values().collect());
        }

        // KILL: stores elsewhere that write one of this block's addresses.
        let mut kill: Map<BlockId, Set<InstId>> = Map::new();
        for &b in &blocks {
            let own_addrs: Set<Value> =
                stores_of[&b].iter().map(|s| store_dst(f, *s)).collect();
            let mut killed = Set::new();
            for &other in &blocks {
                if other == b {
                    continue;
                }
                for &s in &stores_of[&other] {
                    if own_addrs.contains(&store_dst(f, s)) {
                        killed.insert(s);
                    }
                }
            }
            kill.insert(b, killed);
        }

        let preds = f.predecessors();
        let mut input: Map<BlockId, Set<InstId>> = blocks.iter().map(|b| (*b, Set::new())).collect();
        let mut output = gen.clone();

        loop {
            let mut changed = false;
            for &b in &blocks {
                let mut incoming = Set::new();
                for p in &preds[&b] {
                    incoming.extend(output[p].iter().copied());
                }
                let mut out: Set<InstId> = gen[&b].clone();
                out.extend(incoming.difference(&kill[&b]).copied());
                input.insert(b, incoming);
                if out != output[&b] {
                    output.insert(b, out);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        ReachingStores { input }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front;
    use crate::middle::lower;

    fn build(src: &str) -> Module {
        let program = front::parse(src).unwrap();
        front::check(&program).unwrap();
        lower(program)
    }

    fn loads(f: &Function) -> usize {
        f.blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter(|i| matches!(f.inst(**i), Inst::Load { .. }))
            .count()
    }

    #[test]
    fn distinct_reaching_constants_block_the_rewrite() {
        let mut module =
            build("int func(int p) { int x; x = 7; if (p < 0) { x = 8; } return x; }");
        let f = &mut module.funcs[0];
        let before = loads(f);
        // Two stores of distinct constants (7, 8) reach the final load of x,
        // so it survives, and nothing else is constant either.
        assert!(!propagate_constants(f));
        assert_eq!(loads(f), before);
    }

    #[test]
    fn agreeing_reaching_constants_rewrite_the_load() {
        let mut module =
            build("int func(int p) { int x; x = 7; if (p < 0) { x = 7; } return x; }");
        let f = &mut module.funcs[0];
        assert!(propagate_constants(f));
        // Both reaching stores wrote 7; the load of x in if_end is gone and
        // the store to ret now stores the constant directly.
        let ret_store = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter_map(|i| match f.inst(*i) {
                Inst::Store {
                    value,
                    dst: Value::Inst(a),
                } if matches!(f.inst(*a), Inst::Alloca { name } if name.as_str() == "ret") => {
                    Some(*value)
                }
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(ret_store, Value::Const(7));
    }

    #[test]
    fn later_store_in_block_wins() {
        let mut module = build("int func(int p) { int x; x = 1; x = 2; return x; }");
        let f = &mut module.funcs[0];
        assert!(propagate_constants(f));
        let ret_store = f
            .blocks
            .iter()
            .flat_map(|b| b.insts.iter())
            .filter_map(|i| match f.inst(*i) {
                Inst::Store {
                    value,
                    dst: Value::Inst(a),
                } if matches!(f.inst(*a), Inst::Alloca { name } if name.as_str() == "ret") => {
                    Some(*value)
                }
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(ret_store, Value::Const(2));
    }

    #[test]
    fn loop_carried_stores_are_not_constant() {
        let mut module = build(
            "int func(int p) { int i; i = 0; while (i < p) { i = i + 1; } return i; }",
        );
        let f = &mut module.funcs[0];
        // In while_cond, both `i = 0` and `i = i + 1` reach the load of i;
        // the latter is not a constant, so nothing is rewritten there.
        let before = loads(f);
        propagate_constants(f);
        assert_eq!(loads(f), before);
    }

    #[test]
    fn nonconstant_store_blocks_rewrite() {
        let mut module = build("int func(int p) { int x; x = p; return x; }");
        let f = &mut module.funcs[0];
        assert!(!propagate_constants(f));
    }
}
