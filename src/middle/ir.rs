//! The intermediate representation.
//!
//! Instructions live in an arena owned by their [Function]; blocks and
//! operands refer to them through stable [InstId] indices, and def-use
//! edges are kept in a side table so that [Function::replace_all_uses_with]
//! can rewire every user of a value in one step.

use derive_more::Display;

use crate::common::{Id, Map, Set};

/// A module: external declarations plus the functions.
#[derive(Debug)]
pub struct Module {
    pub externs: Vec<ExternDecl>,
    pub funcs: Vec<Function>,
}

impl Module {
    pub fn extern_decl(&self, name: Id) -> Option<&ExternDecl> {
        self.externs.iter().find(|e| e.name == name)
    }
}

/// One of the runtime built-ins (`print`, `read`).
#[derive(Debug, Clone, Copy)]
pub struct ExternDecl {
    pub name: Id,
    pub returns_value: bool,
    pub takes_arg: bool,
}

/// A stable handle to an instruction in its function's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InstId(pub usize);

/// A stable handle to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// An operand: another instruction's value, a constant, or the parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Value {
    Inst(InstId),
    Const(i32),
    Param,
}

/// Arithmetic opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ArithOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("mul")]
    Mul,
    #[display("sdiv")]
    Sdiv,
}

/// Comparison predicates (all signed, plus equality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Pred {
    #[display("slt")]
    Slt,
    #[display("sgt")]
    Sgt,
    #[display("sle")]
    Sle,
    #[display("sge")]
    Sge,
    #[display("eq")]
    Eq,
    #[display("ne")]
    Ne,
}

#[derive(Debug, Clone)]
pub enum Inst {
    /// A stack slot for the named local.  Only appears in the entry block;
    /// its value is the address of the slot.
    Alloca { name: Id },
    Load {
        src: Value,
    },
    Store {
        value: Value,
        dst: Value,
    },
    BinArith {
        op: ArithOp,
        lhs: Value,
        rhs: Value,
    },
    ICmp {
        pred: Pred,
        lhs: Value,
        rhs: Value,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Value,
        then: BlockId,
        els: BlockId,
    },
    Ret {
        value: Value,
    },
    Call {
        callee: Id,
        arg: Option<Value>,
        returns_value: bool,
    },
}

impl Inst {
    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Br { .. } | Inst::CondBr { .. } | Inst::Ret { .. })
    }

    /// Does this instruction define a value usable as an operand?
    pub fn produces_value(&self) -> bool {
        match self {
            Inst::Store { .. } | Inst::Br { .. } | Inst::CondBr { .. } | Inst::Ret { .. } => false,
            Inst::Call { returns_value, .. } => *returns_value,
            _ => true,
        }
    }

    /// The operand slots of this instruction, in order.
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Inst::Alloca { .. } | Inst::Br { .. } => vec![],
            Inst::Load { src } => vec![*src],
            Inst::Store { value, dst } => vec![*value, *dst],
            Inst::BinArith { lhs, rhs, .. } | Inst::ICmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Inst::CondBr { cond, .. } => vec![*cond],
            Inst::Ret { value } => vec![*value],
            Inst::Call { arg, .. } => arg.iter().copied().collect(),
        }
    }

    /// Rewrite every operand slot equal to `old` with `new`.
    fn replace_operand(&mut self, old: Value, new: Value) {
        let rewrite = |slot: &mut Value| {
            if *slot == old {
                *slot = new;
            }
        };
        match self {
            Inst::Alloca { .. } | Inst::Br { .. } => {}
            Inst::Load { src } => rewrite(src),
            Inst::Store { value, dst } => {
                rewrite(value);
                rewrite(dst);
            }
            Inst::BinArith { lhs, rhs, .. } | Inst::ICmp { lhs, rhs, .. } => {
                rewrite(lhs);
                rewrite(rhs);
            }
            Inst::CondBr { cond, .. } => rewrite(cond),
            Inst::Ret { value } => rewrite(value),
            Inst::Call { arg, .. } => {
                if let Some(arg) = arg {
                    rewrite(arg);
                }
            }
        }
    }

    /// Successor blocks if this is a terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Inst::Br { target } => vec![*target],
            Inst::CondBr { then, els, .. } => vec![*then, *els],
            _ => vec![],
        }
    }
}

/// A basic block: an ordered run of instructions ending in one terminator.
#[derive(Debug)]
pub struct Block {
    pub name: Id,
    pub insts: Vec<InstId>,
}

#[derive(Debug)]
pub struct Function {
    pub name: Id,
    pub param: Id,
    pub blocks: Vec<Block>,
    arena: Vec<Inst>,
    /// Def-use edges: for each defining instruction, the instructions using
    /// its value, one entry per operand slot.
    uses: Map<InstId, Vec<InstId>>,
    /// Base-name occurrence counts for unique block naming.
    block_names: Map<String, usize>,
}

impl Function {
    pub fn new(name: Id, param: Id) -> Self {
        Function {
            name,
            param,
            blocks: Vec::new(),
            arena: Vec::new(),
            uses: Map::new(),
            block_names: Map::new(),
        }
    }

    pub fn entry(&self) -> BlockId {
        BlockId(0)
    }

    /// Append a block, uniquing its name (`end`, `end1`, `end2`, ...).
    pub fn add_block(&mut self, base: &str) -> BlockId {
        let n = self.block_names.entry(base.to_string()).or_insert(0);
        let name = if *n == 0 {
            base.to_string()
        } else {
            format!("{base}{n}")
        };
        *n += 1;
        self.blocks.push(Block {
            name: Id::new(name),
            insts: Vec::new(),
        });
        BlockId(self.blocks.len() - 1)
    }

    pub fn block(&self, b: BlockId) -> &Block {
        &self.blocks[b.0]
    }

    pub fn inst(&self, i: InstId) -> &Inst {
        &self.arena[i.0]
    }

    /// Append an instruction to a block, recording its use edges.
    pub fn push(&mut self, b: BlockId, inst: Inst) -> InstId {
        let id = InstId(self.arena.len());
        for op in inst.operands() {
            if let Value::Inst(def) = op {
                self.uses.entry(def).or_default().push(id);
            }
        }
        self.arena.push(inst);
        self.blocks[b.0].insts.push(id);
        id
    }

    /// The users of an instruction's value, one entry per operand slot.
    pub fn users(&self, i: InstId) -> &[InstId] {
        self.uses.get(&i).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn num_uses(&self, i: InstId) -> usize {
        self.users(i).len()
    }

    /// Rewire every use of `old`'s value to `new`, updating both use lists.
    pub fn replace_all_uses_with(&mut self, old: InstId, new: Value) {
        let users = self.uses.remove(&old).unwrap_or_default();
        for user in &users {
            self.arena[user.0].replace_operand(Value::Inst(old), new);
        }
        if let Value::Inst(def) = new {
            self.uses.entry(def).or_default().extend(users);
        }
    }

    /// Remove an instruction from its block and drop its operand use edges.
    /// The arena slot is abandoned; nothing may reference it afterwards.
    pub fn erase(&mut self, b: BlockId, i: InstId) {
        for op in self.arena[i.0].operands() {
            if let Value::Inst(def) = op {
                if let Some(users) = self.uses.get_mut(&def) {
                    if let Some(slot) = users.iter().position(|u| *u == i) {
                        users.remove(slot);
                    }
                }
            }
        }
        self.uses.remove(&i);
        self.blocks[b.0].insts.retain(|id| *id != i);
    }

    /// The block's terminator, if it has one yet.
    pub fn terminator(&self, b: BlockId) -> Option<&Inst> {
        let last = *self.blocks[b.0].insts.last()?;
        let inst = self.inst(last);
        inst.is_terminator().then_some(inst)
    }

    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.terminator(b).map(Inst::successors).unwrap_or_default()
    }

    /// Map from each block to the set of distinct predecessor blocks.
    pub fn predecessors(&self) -> Map<BlockId, Set<BlockId>> {
        let mut preds: Map<BlockId, Set<BlockId>> = Map::new();
        for b in 0..self.blocks.len() {
            preds.entry(BlockId(b)).or_default();
        }
        for b in 0..self.blocks.len() {
            for succ in self.successors(BlockId(b)) {
                preds.entry(succ).or_default().insert(BlockId(b));
            }
        }
        preds
    }

    /// Blocks reachable from entry by a forward breadth-first search over
    /// terminator successors.
    pub fn reachable(&self) -> Set<BlockId> {
        let mut visited = Set::new();
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self.entry());
        visited.insert(self.entry());
        while let Some(b) = queue.pop_front() {
            for succ in self.successors(b) {
                if visited.insert(succ) {
                    queue.push_back(succ);
                }
            }
        }
        visited
    }

    /// Delete every block not reachable from entry, compacting block ids.
    pub fn prune_unreachable(&mut self) {
        let reachable = self.reachable();
        if reachable.len() == self.blocks.len() {
            return;
        }

        // Drop the dead blocks' use edges before the blocks themselves.
        for (b, block) in self.blocks.iter().enumerate() {
            if reachable.contains(&BlockId(b)) {
                continue;
            }
            for i in &block.insts {
                for op in self.arena[i.0].operands() {
                    if let Value::Inst(def) = op {
                        if let Some(users) = self.uses.get_mut(&def) {
                            if let Some(slot) = users.iter().position(|u| u == i) {
                                users.remove(slot);
                            }
                        }
                    }
                }
            }
        }
        for (b, block) in self.blocks.iter().enumerate() {
            if !reachable.contains(&BlockId(b)) {
                for i in &block.insts {
                    self.uses.remove(i);
                }
            }
        }

        // Compact the block vector and remap branch targets.  A reachable
        // block's terminator can only target reachable blocks, so the map is
        // total where it is needed.
        let mut remap: Map<BlockId, BlockId> = Map::new();
        let mut next = 0;
        for b in 0..self.blocks.len() {
            if reachable.contains(&BlockId(b)) {
                remap.insert(BlockId(b), BlockId(next));
                next += 1;
            }
        }
        let mut b = 0;
        self.blocks.retain(|_| {
            let keep = reachable.contains(&BlockId(b));
            b += 1;
            keep
        });
        for block in &self.blocks {
            if let Some(&last) = block.insts.last() {
                match &mut self.arena[last.0] {
                    Inst::Br { target } => *target = remap[target],
                    Inst::CondBr { then, els, .. } => {
                        *then = remap[then];
                        *els = remap[els];
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id;

    fn empty_func() -> Function {
        Function::new(id("f"), id("p"))
    }

    #[test]
    fn replace_all_uses_rewires_operands() {
        let mut f = empty_func();
        let entry = f.add_block("entry");
        let a = f.push(entry, Inst::Alloca { name: id("x") });
        let l1 = f.push(entry, Inst::Load { src: Value::Inst(a) });
        let l2 = f.push(entry, Inst::Load { src: Value::Inst(a) });
        let add = f.push(
            entry,
            Inst::BinArith {
                op: ArithOp::Add,
                lhs: Value::Inst(l1),
                rhs: Value::Inst(l2),
            },
        );
        f.replace_all_uses_with(l2, Value::Inst(l1));
        match f.inst(add) {
            Inst::BinArith { lhs, rhs, .. } => {
                assert_eq!(*lhs, Value::Inst(l1));
                assert_eq!(*rhs, Value::Inst(l1));
            }
            _ => unreachable!(),
        }
        assert_eq!(f.num_uses(l1), 2);
        assert_eq!(f.num_uses(l2), 0);
    }

    #[test]
    fn erase_maintains_use_lists() {
        let mut f = empty_func();
        let entry = f.add_block("entry");
        let a = f.push(entry, Inst::Alloca { name: id("x") });
        let l = f.push(entry, Inst::Load { src: Value::Inst(a) });
        assert_eq!(f.num_uses(a), 1);
        f.erase(entry, l);
        assert_eq!(f.num_uses(a), 0);
        assert_eq!(f.block(entry).insts, vec![a]);
    }

    #[test]
    fn block_names_are_uniqued() {
        let mut f = empty_func();
        f.add_block("end");
        let b1 = f.add_block("end");
        let b2 = f.add_block("end");
        assert_eq!(f.block(b1).name.as_str(), "end1");
        assert_eq!(f.block(b2).name.as_str(), "end2");
    }

    #[test]
    fn prune_removes_unreachable_and_remaps_targets() {
        let mut f = empty_func();
        let entry = f.add_block("entry");
        let orphan = f.add_block("orphan");
        let exit = f.add_block("end");
        f.push(entry, Inst::Br { target: exit });
        f.push(orphan, Inst::Br { target: exit });
        f.push(exit, Inst::Ret { value: Value::Const(0) });
        f.prune_unreachable();
        assert_eq!(f.blocks.len(), 2);
        assert_eq!(f.block(BlockId(1)).name.as_str(), "end");
        assert_eq!(f.successors(BlockId(0)), vec![BlockId(1)]);
    }
}
