//! Code generation: per-block liveness, linear-scan register allocation over
//! the three-register pool, frame layout, and instruction selection.

use crate::common::{id, Id, Map};
use crate::middle::ir::{self, BlockId, Inst, InstId, Pred, Value};

use super::asm::*;

/// Where an allocated value lives.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
    Reg(Register),
    Spilled,
}

pub fn code_gen(module: &ir::Module) -> Program {
    Program {
        functions: module.funcs.iter().map(gen_function).collect(),
    }
}

fn gen_function(f: &ir::Function) -> FunctionCode {
    let mut cg = FuncCodegen {
        f,
        reg_map: Map::new(),
        offsets: Map::new(),
        labels: Map::new(),
        param_slot: param_slot(f),
        div_scratch: None,
        frame_size: 0,
    };
    for b in 0..f.blocks.len() {
        cg.allocate_registers(BlockId(b));
    }
    cg.layout_frame();
    cg.make_labels();
    cg.emit()
}

/// The alloca holding the incoming parameter: the destination of the store
/// of the parameter value that the entry block begins with.
fn param_slot(f: &ir::Function) -> Option<InstId> {
    f.block(f.entry()).insts.iter().find_map(|&i| match f.inst(i) {
        Inst::Store {
            value: Value::Param,
            dst: Value::Inst(slot),
        } => Some(*slot),
        _ => None,
    })
}

/// Per-block liveness: the position of each value's last in-block use.
struct Liveness {
    last_use: Map<InstId, usize>,
}

impl Liveness {
    fn compute(f: &ir::Function, b: BlockId) -> Liveness {
        let mut index = Map::new();
        let mut count = 0;
        for &i in &f.block(b).insts {
            if !matches!(f.inst(i), Inst::Alloca { .. }) {
                index.insert(i, count);
                count += 1;
            }
        }
        // A value's range runs from its definition to its last in-block use;
        // uses in other blocks do not extend it.
        let mut last_use = Map::new();
        for (&i, _) in &index {
            if !f.inst(i).produces_value() {
                continue;
            }
            let end = f
                .users(i)
                .iter()
                .filter_map(|u| index.get(u).copied())
                .max()
                .unwrap_or(0);
            last_use.insert(i, end);
        }
        Liveness { last_use }
    }
}

struct FuncCodegen<'a> {
    f: &'a ir::Function,
    reg_map: Map<InstId, Location>,
    offsets: Map<InstId, i32>,
    labels: Map<BlockId, Id>,
    param_slot: Option<InstId>,
    div_scratch: Option<i32>,
    frame_size: i32,
}

impl FuncCodegen<'_> {
    /// Use counts order the allocation priority; ties break by definition
    /// order so the allocator is deterministic.
    fn use_key(&self, i: InstId) -> (usize, InstId) {
        (self.f.num_uses(i), i)
    }

    /// Linear-scan allocation over one block.  Registers are released at an
    /// operand's last use, the lowest available register is taken for each
    /// new value, and when the pool is dry either a cheaper live value or
    /// the new value itself is spilled.
    fn allocate_registers(&mut self, b: BlockId) {
        let live = Liveness::compute(self.f, b);
        let mut available = [true; POOL.len()];
        // Current owner of each pool register; a stale `reg_map` entry from
        // a released value is not a spill candidate.
        let mut holder: [Option<InstId>; POOL.len()] = [None; POOL.len()];

        let mut all_inst: Vec<InstId> = self
            .f
            .block(b)
            .insts
            .iter()
            .copied()
            .filter(|&i| {
                !matches!(self.f.inst(i), Inst::Alloca { .. }) && self.f.inst(i).produces_value()
            })
            .collect();
        all_inst.sort_by_key(|&i| self.use_key(i));

        let mut i = 0;
        for &inst in &self.f.block(b).insts {
            // Release registers whose value dies at this instruction.
            for op in self.f.inst(inst).operands() {
                let Value::Inst(op) = op else { continue };
                if live.last_use.get(&op) != Some(&i) {
                    continue;
                }
                if let Some(Location::Reg(r)) = self.reg_map.get(&op) {
                    let slot = POOL.iter().position(|p| p == r).unwrap();
                    if holder[slot] == Some(op) {
                        available[slot] = true;
                    }
                }
            }

            if matches!(self.f.inst(inst), Inst::Alloca { .. }) {
                continue;
            }
            i += 1;
            if !self.f.inst(inst).produces_value() {
                continue;
            }

            if let Some(slot) = available.iter().position(|a| *a) {
                available[slot] = false;
                holder[slot] = Some(inst);
                self.reg_map.insert(inst, Location::Reg(POOL[slot]));
                continue;
            }

            // No register free: steal from the most expensive value that is
            // still cheaper than this one, else spill this one.
            let mut victim = None;
            for &v in &all_inst {
                if self.use_key(v) >= self.use_key(inst) {
                    continue;
                }
                if let Some(Location::Reg(r)) = self.reg_map.get(&v) {
                    let slot = POOL.iter().position(|p| p == r).unwrap();
                    if holder[slot] == Some(v) {
                        victim = Some((v, slot));
                    }
                }
            }
            match victim {
                Some((v, slot)) => {
                    self.reg_map.insert(inst, Location::Reg(POOL[slot]));
                    holder[slot] = Some(inst);
                    self.reg_map.insert(v, Location::Spilled);
                }
                None => {
                    self.reg_map.insert(inst, Location::Spilled);
                }
            }
        }
    }

    /// Assign frame offsets: allocas first, then spill slots.  The
    /// parameter's alloca is the incoming argument slot above the frame,
    /// which is why stores of the parameter value need no code.  A spilled
    /// load aliases its source alloca's slot instead of getting its own.
    fn layout_frame(&mut self) {
        let mut local_mem = 0;
        let mut bump = || {
            local_mem += WORD_SIZE;
            -local_mem
        };
        for block in &self.f.blocks {
            for &i in &block.insts {
                if matches!(self.f.inst(i), Inst::Alloca { .. }) {
                    let off = if self.param_slot == Some(i) { 8 } else { bump() };
                    self.offsets.insert(i, off);
                }
            }
        }
        let spilled: Vec<InstId> = self
            .reg_map
            .iter()
            .filter(|(_, loc)| **loc == Location::Spilled)
            .map(|(i, _)| *i)
            .collect();
        for i in spilled {
            match self.f.inst(i) {
                Inst::Load {
                    src: Value::Inst(slot),
                } => {
                    let off = self.offsets[slot];
                    self.offsets.insert(i, off);
                }
                _ => {
                    let off = bump();
                    self.offsets.insert(i, off);
                }
            }
        }
        let has_div = self.f.blocks.iter().flat_map(|b| b.insts.iter()).any(|&i| {
            matches!(
                self.f.inst(i),
                Inst::BinArith {
                    op: ir::ArithOp::Sdiv,
                    ..
                }
            )
        });
        if has_div {
            self.div_scratch = Some(bump());
        }
        self.frame_size = local_mem - WORD_SIZE;
    }

    fn make_labels(&mut self) {
        for b in 0..self.f.blocks.len() {
            let label = if b == 0 {
                ".LFB0".to_string()
            } else {
                format!(".L{b}")
            };
            self.labels.insert(BlockId(b), id(&label));
        }
    }

    fn location(&self, i: InstId) -> Option<Location> {
        self.reg_map.get(&i).copied()
    }

    fn slot(&self, i: InstId) -> FrameSlot {
        match self.offsets.get(&i) {
            Some(off) => FrameSlot(*off),
            None => panic!("operand {i:?} has no stack slot"),
        }
    }

    /// Materialization priority for a source operand: constant, then
    /// register, then frame slot.
    fn operand(&self, v: Value) -> Operand {
        match v {
            Value::Const(c) => Operand::Imm(c),
            Value::Param => panic!("the parameter value is only stored, never read"),
            Value::Inst(i) => match self.location(i) {
                Some(Location::Reg(r)) => Operand::Reg(r),
                _ => Operand::Slot(self.slot(i)),
            },
        }
    }

    fn emit(&self) -> FunctionCode {
        let mut basic_blocks = Vec::new();
        for b in 0..self.f.blocks.len() {
            let b = BlockId(b);
            let mut instructions = Vec::new();
            for &i in &self.f.block(b).insts {
                self.emit_inst(i, &mut instructions);
            }
            basic_blocks.push(BasicBlock {
                label: self.labels[&b].as_str().to_string(),
                instructions,
            });
        }
        FunctionCode {
            name: self.f.name,
            frame_size: self.frame_size,
            basic_blocks,
        }
    }

    fn emit_inst(&self, i: InstId, out: &mut Vec<Instruction>) {
        use Instruction::*;
        use Register::*;

        match self.f.inst(i) {
            // The slot was reserved in the prologue.
            Inst::Alloca { .. } => {}

            Inst::Load { src } => {
                // A spilled load needs no code: its slot aliases the source
                // alloca, so consumers read the variable directly.
                if let Some(Location::Reg(r)) = self.location(i) {
                    let Value::Inst(slot) = src else {
                        panic!("load from a non-alloca address");
                    };
                    out.push(Mov {
                        src: Operand::Slot(self.slot(*slot)),
                        dst: Operand::Reg(r),
                    });
                }
            }

            Inst::Store { value, dst } => {
                // The parameter's alloca is its argument slot; the value is
                // already there.
                if *value == Value::Param {
                    return;
                }
                let Value::Inst(dst) = dst else {
                    panic!("store to a non-alloca address");
                };
                let dst = Operand::Slot(self.slot(*dst));
                match self.operand(*value) {
                    src @ (Operand::Imm(_) | Operand::Reg(_)) => out.push(Mov { src, dst }),
                    src @ Operand::Slot(_) => {
                        // Memory to memory goes through the scratch register.
                        out.push(Mov {
                            src,
                            dst: Operand::Reg(Eax),
                        });
                        out.push(Mov {
                            src: Operand::Reg(Eax),
                            dst,
                        });
                    }
                }
            }

            Inst::BinArith {
                op: ir::ArithOp::Sdiv,
                lhs,
                rhs,
            } => self.emit_div(i, *lhs, *rhs, out),

            Inst::BinArith { op, lhs, rhs } => {
                let x = self.work_register(i);
                out.push(Mov {
                    src: self.operand(*lhs),
                    dst: Operand::Reg(x),
                });
                let op = match op {
                    ir::ArithOp::Add => ArithOp::Add,
                    ir::ArithOp::Sub => ArithOp::Sub,
                    ir::ArithOp::Mul => ArithOp::Mul,
                    ir::ArithOp::Sdiv => unreachable!(),
                };
                out.push(Arith {
                    op,
                    src: self.operand(*rhs),
                    dst: x,
                });
                self.store_if_spilled(i, out);
            }

            Inst::ICmp { lhs, rhs, .. } => {
                let x = self.work_register(i);
                out.push(Mov {
                    src: self.operand(*lhs),
                    dst: Operand::Reg(x),
                });
                out.push(Cmp {
                    src: self.operand(*rhs),
                    dst: x,
                });
                self.store_if_spilled(i, out);
            }

            Inst::Br { target } => out.push(Jmp(self.labels[target])),

            Inst::CondBr { cond, then, els } => {
                let Value::Inst(cond) = cond else {
                    panic!("conditional branch on a non-instruction condition");
                };
                let Inst::ICmp { pred, .. } = self.f.inst(*cond) else {
                    panic!("conditional branch condition is not a comparison");
                };
                let cond = match pred {
                    Pred::Eq => Condition::Equal,
                    Pred::Ne => Condition::NotEqual,
                    Pred::Slt => Condition::Less,
                    Pred::Sle => Condition::LessEq,
                    Pred::Sgt => Condition::Greater,
                    Pred::Sge => Condition::GreaterEq,
                };
                out.push(J {
                    cond,
                    target: self.labels[then],
                });
                out.push(Jmp(self.labels[els]));
            }

            Inst::Ret { value } => {
                // Constant, then memory, then register.
                let src = match value {
                    Value::Const(c) => Operand::Imm(*c),
                    Value::Param => panic!("the parameter value is only stored, never read"),
                    Value::Inst(v) => match self.offsets.get(v) {
                        Some(off) => Operand::Slot(FrameSlot(*off)),
                        None => match self.location(*v) {
                            Some(Location::Reg(r)) => Operand::Reg(r),
                            _ => panic!("return value has no location"),
                        },
                    },
                };
                out.push(Mov {
                    src,
                    dst: Operand::Reg(Eax),
                });
                out.push(Leave);
                out.push(Ret);
            }

            Inst::Call {
                callee,
                arg,
                returns_value,
            } => {
                for reg in POOL {
                    out.push(Push(Operand::Reg(reg)));
                }
                let argc = arg.iter().len() as i32;
                if let Some(arg) = arg {
                    out.push(Push(self.operand(*arg)));
                }
                out.push(Call(*callee));
                if argc > 0 {
                    out.push(Arith {
                        op: ArithOp::Add,
                        src: Operand::Imm(WORD_SIZE * argc),
                        dst: Esp,
                    });
                }
                for reg in POOL.iter().rev() {
                    out.push(Pop(*reg));
                }
                if *returns_value {
                    match self.location(i) {
                        Some(Location::Reg(r)) => out.push(Mov {
                            src: Operand::Reg(Eax),
                            dst: Operand::Reg(r),
                        }),
                        _ => out.push(Mov {
                            src: Operand::Reg(Eax),
                            dst: Operand::Slot(self.slot(i)),
                        }),
                    }
                }
            }
        }
    }

    /// The register an arithmetic instruction computes in: its own if it has
    /// one, else the scratch register.
    fn work_register(&self, i: InstId) -> Register {
        match self.location(i) {
            Some(Location::Reg(r)) => r,
            _ => Register::Eax,
        }
    }

    /// Spilled results computed in the scratch register land in their slot.
    fn store_if_spilled(&self, i: InstId, out: &mut Vec<Instruction>) {
        if self.location(i) == Some(Location::Spilled) {
            out.push(Instruction::Mov {
                src: Operand::Reg(Register::Eax),
                dst: Operand::Slot(self.slot(i)),
            });
        }
    }

    /// `idivl` divides `%edx:%eax` and takes no immediate, so the dividend
    /// is lifted into `%eax`, the divisor is staged out of `%edx` or an
    /// immediate into a scratch frame slot, and `%edx` is preserved around
    /// the `cltd`/`idivl` pair unless it is the destination.
    fn emit_div(&self, i: InstId, lhs: Value, rhs: Value, out: &mut Vec<Instruction>) {
        use Instruction::*;
        use Register::*;

        out.push(Mov {
            src: self.operand(lhs),
            dst: Operand::Reg(Eax),
        });
        let divisor = match self.operand(rhs) {
            src @ (Operand::Imm(_) | Operand::Reg(Edx)) => {
                let scratch = FrameSlot(self.div_scratch.expect("division scratch slot"));
                out.push(Mov {
                    src,
                    dst: Operand::Slot(scratch),
                });
                Operand::Slot(scratch)
            }
            other => other,
        };
        let own = self.location(i);
        let preserve_edx = own != Some(Location::Reg(Edx));
        if preserve_edx {
            out.push(Push(Operand::Reg(Edx)));
        }
        out.push(Cltd);
        out.push(Idiv(divisor));
        match own {
            Some(Location::Reg(r)) => out.push(Mov {
                src: Operand::Reg(Eax),
                dst: Operand::Reg(r),
            }),
            _ => out.push(Mov {
                src: Operand::Reg(Eax),
                dst: Operand::Slot(self.slot(i)),
            }),
        }
        if preserve_edx {
            out.push(Pop(Edx));
        }
    }
}
