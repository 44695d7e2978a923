//! The 32-bit x86 target description.
//!
//! We emit AT&T syntax for the cdecl ABI used by Linux on i386:
//!
//! - The caller pushes arguments right to left and pops them after the call;
//!   the return value comes back in `%eax`.
//! - `%ebx` is callee-saved and `%ecx`/`%edx` are caller-saved, but the
//!   generated code saves and restores all three around every call, so the
//!   register allocator can treat the pool uniformly.
//! - Each function's frame is `pushl %ebp; movl %esp, %ebp; subl $n, %esp`,
//!   with locals and spill slots addressed at negative offsets from `%ebp`
//!   and the incoming argument at `8(%ebp)` (above the saved `%ebp` and the
//!   return address).
//!
//! # Registers
//!
//! Values are allocated to `%ebx`, `%ecx`, and `%edx` only.  `%eax` is the
//! scratch register: spill traffic, division, and return values pass through
//! it, and nothing may live in it across an instruction.

use derive_more::Display;

use crate::common::Id;

/// Word and slot size for this target.
pub const WORD_SIZE: i32 = 4;

/// Registers for the actual i386 machine.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Register {
    #[display("%eax")]
    Eax,
    #[display("%ebx")]
    Ebx,
    #[display("%ecx")]
    Ecx,
    #[display("%edx")]
    Edx,
    #[display("%ebp")]
    Ebp,
    #[display("%esp")]
    Esp,
}

/// The allocatable pool, in allocation preference order.
pub static POOL: [Register; 3] = [Register::Ebx, Register::Ecx, Register::Edx];

/// A stack slot addressed relative to the frame pointer.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[display("{_0}(%ebp)")]
pub struct FrameSlot(pub i32);

/// Operands that i386 instructions can access.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Operand {
    /// An immediate.
    #[display("${_0}")]
    Imm(i32),
    /// A register.
    #[display("{_0}")]
    Reg(Register),
    /// A memory location in the current frame.
    #[display("{_0}")]
    Slot(FrameSlot),
}

/// Conditions for conditional jumps, named by their `j<cc>` suffix.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum Condition {
    #[display("e")]
    Equal,
    #[display("ne")]
    NotEqual,
    #[display("l")]
    Less,
    #[display("le")]
    LessEq,
    #[display("g")]
    Greater,
    #[display("ge")]
    GreaterEq,
}

/// Two-operand arithmetic mnemonics.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum ArithOp {
    #[display("addl")]
    Add,
    #[display("subl")]
    Sub,
    #[display("imull")]
    Mul,
}

/// An i386 instruction.  Operands are in AT&T order, source first.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Instruction {
    Mov {
        src: Operand,
        dst: Operand,
    },
    Arith {
        op: ArithOp,
        src: Operand,
        dst: Register,
    },
    /// Compare `dst` against `src` (computes `dst - src` for the flags).
    Cmp {
        src: Operand,
        dst: Register,
    },
    Push(Operand),
    Pop(Register),
    /// Sign-extend `%eax` into `%edx:%eax` ahead of a division.
    Cltd,
    /// Signed divide of `%edx:%eax`; quotient lands in `%eax`.
    Idiv(Operand),
    Jmp(Id),
    J {
        cond: Condition,
        target: Id,
    },
    Call(Id),
    Leave,
    Ret,
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Instruction::*;

        match self {
            Mov { src, dst } => write!(f, "\tmovl\t{src}, {dst}"),
            Arith { op, src, dst } => write!(f, "\t{op}\t{src}, {dst}"),
            Cmp { src, dst } => write!(f, "\tcmpl\t{src}, {dst}"),
            Push(op) => write!(f, "\tpushl\t{op}"),
            Pop(reg) => write!(f, "\tpopl\t{reg}"),
            Cltd => write!(f, "\tcltd"),
            Idiv(op) => write!(f, "\tidivl\t{op}"),
            Jmp(target) => write!(f, "\tjmp {target}"),
            J { cond, target } => write!(f, "\tj{cond} {target}"),
            Call(callee) => write!(f, "\tcall\t{callee}"),
            Leave => write!(f, "\tleave"),
            Ret => write!(f, "\tret"),
        }
    }
}

/// One labeled run of instructions.
pub struct BasicBlock {
    pub label: String,
    pub instructions: Vec<Instruction>,
}

/// One function's generated code.
pub struct FunctionCode {
    pub name: Id,
    pub frame_size: i32,
    pub basic_blocks: Vec<BasicBlock>,
}

/// A backend program.
pub struct Program {
    pub functions: Vec<FunctionCode>,
}

impl Program {
    /// Render the final assembly text.
    pub fn asm_code(&self) -> String {
        let mut out = String::from("\t.text\n");
        for func in &self.functions {
            out.push_str(&format!("\t.globl\t{}\n", func.name));
            out.push_str(&format!("\t.type\t{}, @function\n", func.name));
            out.push_str(&format!("{}:\n", func.name));
            for (i, block) in func.basic_blocks.iter().enumerate() {
                out.push_str(&format!("{}:\n", block.label));
                if i == 0 {
                    out.push_str("\tpushl\t%ebp\n");
                    out.push_str("\tmovl\t%esp, %ebp\n");
                    out.push_str(&format!("\tsubl\t${}, %esp\n", func.frame_size));
                }
                for inst in &block.instructions {
                    out.push_str(&format!("{inst}\n"));
                }
            }
        }
        out
    }
}
