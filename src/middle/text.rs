//! The textual form of the IR.
//!
//! [Module] prints in an LLVM-flavored syntax, and [parse] reads the same
//! syntax back.  Printing a parsed module reproduces the text exactly;
//! parsing a printed module reproduces the module up to the naming of
//! anonymous values, so the IR can be serialized between pipeline stages.

use std::fmt::{self, Debug, Write as _};

use derive_more::derive::Display;
use regex::Regex;

use crate::common::{id, Id, Map, Set};

use super::ir::*;

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", print(self))
    }
}

/// Render a module to its textual form.
pub fn print(module: &Module) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "; ModuleID = 'miniC'");
    for ext in &module.externs {
        let ret = if ext.returns_value { "i32" } else { "void" };
        let arg = if ext.takes_arg { "i32" } else { "" };
        let _ = writeln!(out, "\ndeclare {ret} @{}({arg})", ext.name);
    }
    for func in &module.funcs {
        let _ = writeln!(out, "\n{}", print_function(func));
    }
    out
}

fn print_function(f: &Function) -> String {
    let names = ValueNames::assign(f);
    let mut out = String::new();
    let _ = writeln!(out, "define i32 @{}(i32 %{}) {{", f.name, f.param);
    for (i, block) in f.blocks.iter().enumerate() {
        if i > 0 {
            let _ = writeln!(out);
        }
        let _ = writeln!(out, "{}:", block.name);
        for &inst in &block.insts {
            let _ = writeln!(out, "  {}", print_inst(f, inst, &names));
        }
    }
    out.push('}');
    out
}

/// Printed names for value-producing instructions: allocas keep their local's
/// name (uniqued against the parameter and each other), everything else gets
/// a sequential number.
struct ValueNames {
    names: Map<InstId, String>,
}

impl ValueNames {
    fn assign(f: &Function) -> ValueNames {
        let mut taken: Set<String> = Set::new();
        taken.insert(f.param.as_str().to_string());
        let mut names = Map::new();
        let mut next = 0usize;
        for block in &f.blocks {
            for &inst in &block.insts {
                match f.inst(inst) {
                    Inst::Alloca { name } => {
                        let mut candidate = name.as_str().to_string();
                        let mut n = 0;
                        while taken.contains(&candidate) {
                            n += 1;
                            candidate = format!("{name}{n}");
                        }
                        taken.insert(candidate.clone());
                        names.insert(inst, candidate);
                    }
                    other if other.produces_value() => {
                        names.insert(inst, next.to_string());
                        next += 1;
                    }
                    _ => {}
                }
            }
        }
        ValueNames { names }
    }

    fn value(&self, f: &Function, v: Value) -> String {
        match v {
            Value::Const(c) => c.to_string(),
            Value::Param => format!("%{}", f.param),
            Value::Inst(i) => format!("%{}", self.names[&i]),
        }
    }

    fn def(&self, i: InstId) -> &str {
        &self.names[&i]
    }
}

fn print_inst(f: &Function, id: InstId, names: &ValueNames) -> String {
    let v = |val: Value| names.value(f, val);
    match f.inst(id) {
        Inst::Alloca { .. } => format!("%{} = alloca i32", names.def(id)),
        Inst::Load { src } => format!("%{} = load i32, ptr {}", names.def(id), v(*src)),
        Inst::Store { value, dst } => format!("store i32 {}, ptr {}", v(*value), v(*dst)),
        Inst::BinArith { op, lhs, rhs } => {
            format!("%{} = {op} i32 {}, {}", names.def(id), v(*lhs), v(*rhs))
        }
        Inst::ICmp { pred, lhs, rhs } => {
            format!("%{} = icmp {pred} i32 {}, {}", names.def(id), v(*lhs), v(*rhs))
        }
        Inst::Br { target } => format!("br label %{}", f.block(*target).name),
        Inst::CondBr { cond, then, els } => format!(
            "br i1 {}, label %{}, label %{}",
            v(*cond),
            f.block(*then).name,
            f.block(*els).name
        ),
        Inst::Ret { value } => format!("ret i32 {}", v(*value)),
        Inst::Call {
            callee,
            arg,
            returns_value,
        } => {
            let args = match arg {
                Some(a) => format!("i32 {}", v(*a)),
                None => String::new(),
            };
            if *returns_value {
                format!("%{} = call i32 @{callee}({args})", names.def(id))
            } else {
                format!("call void @{callee}({args})")
            }
        }
    }
}

#[derive(Display)]
#[display("IR parse error: line {line}: {message}")]
pub struct IrParseError {
    pub line: usize,
    pub message: String,
}

impl Debug for IrParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Read a module back from its textual form.
pub fn parse(input: &str) -> Result<Module, IrParseError> {
    Parser::new().parse(input)
}

struct Parser {
    re_declare: Regex,
    re_define: Regex,
    re_label: Regex,
    re_alloca: Regex,
    re_load: Regex,
    re_store: Regex,
    re_arith: Regex,
    re_icmp: Regex,
    re_br: Regex,
    re_condbr: Regex,
    re_ret: Regex,
    re_call: Regex,
}

impl Parser {
    fn new() -> Parser {
        Parser {
            re_declare: Regex::new(r"^declare (void|i32) @(\w+)\((i32)?\)$").unwrap(),
            re_define: Regex::new(r"^define i32 @(\w+)\(i32 %([\w.]+)\) \{$").unwrap(),
            re_label: Regex::new(r"^([\w.]+):$").unwrap(),
            re_alloca: Regex::new(r"^%([\w.]+) = alloca i32$").unwrap(),
            re_load: Regex::new(r"^%([\w.]+) = load i32, ptr (\S+)$").unwrap(),
            re_store: Regex::new(r"^store i32 (\S+), ptr (\S+)$").unwrap(),
            re_arith: Regex::new(r"^%([\w.]+) = (add|sub|mul|sdiv) i32 (\S+), (\S+)$").unwrap(),
            re_icmp: Regex::new(r"^%([\w.]+) = icmp (slt|sgt|sle|sge|eq|ne) i32 (\S+), (\S+)$")
                .unwrap(),
            re_br: Regex::new(r"^br label %([\w.]+)$").unwrap(),
            re_condbr: Regex::new(r"^br i1 (\S+), label %([\w.]+), label %([\w.]+)$").unwrap(),
            re_ret: Regex::new(r"^ret i32 (\S+)$").unwrap(),
            re_call: Regex::new(r"^(?:%([\w.]+) = call i32|call void) @(\w+)\((?:i32 (\S+))?\)$")
                .unwrap(),
        }
    }

    fn parse(&self, input: &str) -> Result<Module, IrParseError> {
        let mut module = Module {
            externs: Vec::new(),
            funcs: Vec::new(),
        };

        let err = |line: usize, message: String| IrParseError { line, message };

        // First pass inside each function needs the block labels, so split
        // the input into function bodies up front.
        let mut current: Option<FunctionParse> = None;
        for (idx, raw) in input.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            if let Some(caps) = self.re_declare.captures(line) {
                module.externs.push(ExternDecl {
                    name: id(&caps[2]),
                    returns_value: &caps[1] == "i32",
                    takes_arg: caps.get(3).is_some(),
                });
                continue;
            }
            if let Some(caps) = self.re_define.captures(line) {
                if current.is_some() {
                    return Err(err(lineno, "nested function definition".into()));
                }
                current = Some(FunctionParse::new(id(&caps[1]), id(&caps[2])));
                continue;
            }
            if line == "}" {
                let fp = current
                    .take()
                    .ok_or_else(|| err(lineno, "stray '}'".into()))?;
                module.funcs.push(fp.finish(lineno)?);
                continue;
            }
            match &mut current {
                Some(fp) => fp.line(line, lineno),
                None => Err(err(lineno, format!("unexpected top-level line '{line}'"))),
            }?;
        }
        if current.is_some() {
            return Err(err(input.lines().count(), "unterminated function".into()));
        }
        Ok(module)
    }
}

/// Accumulates one function's body lines, then builds it in two passes so
/// branches may target blocks defined later in the text.
struct FunctionParse {
    name: Id,
    param: Id,
    body: Vec<(String, usize)>,
}

impl FunctionParse {
    fn new(name: Id, param: Id) -> FunctionParse {
        FunctionParse {
            name,
            param,
            body: Vec::new(),
        }
    }

    fn line(&mut self, line: &str, lineno: usize) -> Result<(), IrParseError> {
        self.body.push((line.to_string(), lineno));
        Ok(())
    }

    fn finish(self, closing_line: usize) -> Result<Function, IrParseError> {
        let p = Parser::new();
        let err = |line: usize, message: String| IrParseError { line, message };

        let mut f = Function::new(self.name, self.param);
        let mut blocks: Map<String, BlockId> = Map::new();
        for (line, lineno) in &self.body {
            if let Some(caps) = p.re_label.captures(line) {
                let label = caps[1].to_string();
                if blocks.contains_key(&label) {
                    return Err(err(*lineno, format!("duplicate block label '{label}'")));
                }
                blocks.insert(label.clone(), f.add_block(&label));
            }
        }
        if f.blocks.is_empty() {
            return Err(err(closing_line, "function has no blocks".into()));
        }

        let mut values: Map<String, Value> = Map::new();
        values.insert(self.param.as_str().to_string(), Value::Param);

        let lookup_block = |blocks: &Map<String, BlockId>, name: &str, lineno: usize| {
            blocks
                .get(name)
                .copied()
                .ok_or_else(|| err(lineno, format!("unknown block '%{name}'")))
        };
        let operand = |values: &Map<String, Value>, text: &str, lineno: usize| {
            if let Some(name) = text.strip_prefix('%') {
                values
                    .get(name)
                    .copied()
                    .ok_or_else(|| err(lineno, format!("unknown value '{text}'")))
            } else {
                text.parse::<i32>()
                    .map(Value::Const)
                    .map_err(|_| err(lineno, format!("bad operand '{text}'")))
            }
        };

        let mut cur: Option<BlockId> = None;
        for (line, lineno) in &self.body {
            let lineno = *lineno;
            if let Some(caps) = p.re_label.captures(line) {
                cur = Some(blocks[&caps[1]]);
                continue;
            }
            let b = cur.ok_or_else(|| err(lineno, "instruction outside a block".into()))?;

            let (def, inst) = if let Some(caps) = p.re_alloca.captures(line) {
                (Some(caps[1].to_string()), Inst::Alloca { name: id(&caps[1]) })
            } else if let Some(caps) = p.re_load.captures(line) {
                let src = operand(&values, &caps[2], lineno)?;
                (Some(caps[1].to_string()), Inst::Load { src })
            } else if let Some(caps) = p.re_store.captures(line) {
                let value = operand(&values, &caps[1], lineno)?;
                let dst = operand(&values, &caps[2], lineno)?;
                (None, Inst::Store { value, dst })
            } else if let Some(caps) = p.re_arith.captures(line) {
                let op = match &caps[2] {
                    "add" => ArithOp::Add,
                    "sub" => ArithOp::Sub,
                    "mul" => ArithOp::Mul,
                    _ => ArithOp::Sdiv,
                };
                let lhs = operand(&values, &caps[3], lineno)?;
                let rhs = operand(&values, &caps[4], lineno)?;
                (Some(caps[1].to_string()), Inst::BinArith { op, lhs, rhs })
            } else if let Some(caps) = p.re_icmp.captures(line) {
                let pred = match &caps[2] {
                    "slt" => Pred::Slt,
                    "sgt" => Pred::Sgt,
                    "sle" => Pred::Sle,
                    "sge" => Pred::Sge,
                    "eq" => Pred::Eq,
                    _ => Pred::Ne,
                };
                let lhs = operand(&values, &caps[3], lineno)?;
                let rhs = operand(&values, &caps[4], lineno)?;
                (Some(caps[1].to_string()), Inst::ICmp { pred, lhs, rhs })
            } else if let Some(caps) = p.re_condbr.captures(line) {
                let cond = operand(&values, &caps[1], lineno)?;
                let then = lookup_block(&blocks, &caps[2], lineno)?;
                let els = lookup_block(&blocks, &caps[3], lineno)?;
                (None, Inst::CondBr { cond, then, els })
            } else if let Some(caps) = p.re_br.captures(line) {
                let target = lookup_block(&blocks, &caps[1], lineno)?;
                (None, Inst::Br { target })
            } else if let Some(caps) = p.re_ret.captures(line) {
                let value = operand(&values, &caps[1], lineno)?;
                (None, Inst::Ret { value })
            } else if let Some(caps) = p.re_call.captures(line) {
                let arg = match caps.get(3) {
                    Some(m) => Some(operand(&values, m.as_str(), lineno)?),
                    None => None,
                };
                let returns_value = caps.get(1).is_some();
                (
                    caps.get(1).map(|m| m.as_str().to_string()),
                    Inst::Call {
                        callee: id(&caps[2]),
                        arg,
                        returns_value,
                    },
                )
            } else {
                return Err(err(lineno, format!("unrecognized instruction '{line}'")));
            };

            let inst_id = f.push(b, inst);
            if let Some(def) = def {
                if values.insert(def.clone(), Value::Inst(inst_id)).is_some() {
                    return Err(err(lineno, format!("redefinition of '%{def}'")));
                }
            }
        }
        Ok(f)
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

    #[test]
    fn print_then_parse_then_print_is_identity() {
        let module = build(
            "int func(int p) { int i; i = 0; while (i < p) { print(i); i = i + 1; } return 0; }",
        );
        let text = print(&module);
        let reparsed = parse(&text).unwrap();
        assert_eq!(print(&reparsed), text);
    }

    #[test]
    fn printed_form_has_the_expected_shape() {
        let module = build("int func(int p) { int x; x = p + p; return x; }");
        let text = print(&module);
        assert!(text.contains("declare void @print(i32)"));
        assert!(text.contains("declare i32 @read()"));
        assert!(text.contains("define i32 @func(i32 %p) {"));
        assert!(text.contains("%p1 = alloca i32"));
        assert!(text.contains("store i32 %p, ptr %p1"));
        assert!(text.contains("br label %end"));
        assert!(text.contains("ret i32"));
    }

    #[test]
    fn parse_resolves_operands_and_blocks() {
        let text = "\
; ModuleID = 'miniC'

declare void @print(i32)

declare i32 @read()

define i32 @func(i32 %p) {
entry:
  %x = alloca i32
  %0 = call i32 @read()
  store i32 %0, ptr %x
  %1 = load i32, ptr %x
  %2 = icmp slt i32 %1, 10
  br i1 %2, label %a, label %b

a:
  call void @print(i32 %1)
  br label %b

b:
  ret i32 0
}";
        let module = parse(text).unwrap();
        assert_eq!(module.externs.len(), 2);
        let f = &module.funcs[0];
        assert_eq!(f.blocks.len(), 3);
        assert_eq!(f.successors(BlockId(0)), vec![BlockId(1), BlockId(2)]);
        // Use lists are rebuilt: %1 feeds the icmp and the print call.
        let load = f.block(BlockId(0)).insts[3];
        assert_eq!(f.num_uses(load), 2);
        assert_eq!(print(&module).trim_end(), text);
    }

    #[test]
    fn unknown_value_is_an_error() {
        let text = "\
define i32 @func(i32 %p) {
entry:
  ret i32 %nope
}";
        let e = parse(text).unwrap_err();
        assert_eq!(e.line, 3);
    }
}
