use crate::front;
use crate::middle::{lower, optimize, text};

use super::*;

fn compile(src: &str) -> String {
    let program = front::parse(src).unwrap();
    front::check(&program).unwrap();
    let module = optimize(lower(program));
    code_gen(&module).asm_code()
}

fn compile_ir(ll: &str) -> String {
    let module = text::parse(ll).unwrap();
    code_gen(&module).asm_code()
}

#[test]
fn module_header_and_frame() {
    let asm = compile("int func(int p) { int x; x = p + p; return x; }");
    assert!(asm.starts_with("\t.text\n\t.globl\tfunc\n\t.type\tfunc, @function\nfunc:\n.LFB0:\n"));
    // p lives at the incoming argument slot; x and ret take the two local
    // slots, and the frame reserves localMem - 4.
    assert!(asm.contains("\tpushl\t%ebp\n\tmovl\t%esp, %ebp\n\tsubl\t$4, %esp\n"));
}

#[test]
fn doubling_reads_the_argument_once() {
    let asm = compile("int func(int p) { int x; x = p + p; return x; }");
    // CSE leaves one load of p, from the argument slot.
    assert_eq!(asm.matches("movl\t8(%ebp)").count(), 1);
    assert!(asm.contains("\tmovl\t8(%ebp), %ebx\n"));
    assert!(asm.contains("\taddl\t%ebx, %ebx\n"));
    assert!(asm.ends_with("\tleave\n\tret\n"));
}

#[test]
fn folded_constant_is_stored_and_returned() {
    let asm = compile("int func(int p) { int x; x = 2 + 3; return x; }");
    // The add was folded away; only constant stores and a constant return
    // remain.
    assert!(!asm.contains("addl"));
    assert!(asm.contains("\tmovl\t$5, -4(%ebp)\n"));
    assert!(asm.contains("\tmovl\t$5, %eax\n\tleave\n\tret\n"));
}

#[test]
fn while_loop_blocks_and_branches() {
    let asm = compile(
        "int func(int p) { int i; i = 0; while (i < p) { print(i); i = i + 1; } return 0; }",
    );
    // entry, while_cond, while_true, while_false, end.
    for label in [".LFB0:", ".L1:", ".L2:", ".L3:", ".L4:"] {
        assert!(asm.contains(label), "missing {label}");
    }
    // The loop test branches to the body on signed less-than.
    assert!(asm.contains("\tjl .L2\n\tjmp .L3\n"));
    // The body jumps back to the condition.
    assert!(asm.contains("\tjmp .L1\n"));
    assert!(asm.contains("\tmovl\t$0, %eax\n\tleave\n\tret\n"));
}

#[test]
fn calls_save_the_pool_and_pop_the_argument() {
    let asm = compile(
        "int func(int p) { int i; i = 0; while (i < p) { print(i); i = i + 1; } return 0; }",
    );
    // The pool is saved, the argument (in %ebx) is pushed last, and the
    // argument and saves are popped in reverse after the call.
    assert!(asm.contains(
        "\tpushl\t%ebx\n\tpushl\t%ecx\n\tpushl\t%edx\n\tpushl\t%ebx\n\tcall\tprint\n"
    ));
    assert!(asm.contains("\taddl\t$4, %esp\n\tpopl\t%edx\n\tpopl\t%ecx\n\tpopl\t%ebx\n"));
}

#[test]
fn read_result_lands_in_a_register() {
    let asm = compile("int func(int p) { int x; x = read(); return x; }");
    // No argument: no stack adjustment after the call.
    assert!(asm.contains("\tcall\tread\n\tpopl\t%edx\n\tpopl\t%ecx\n\tpopl\t%ebx\n"));
    assert!(asm.contains("\tmovl\t%eax, %ebx\n"));
}

#[test]
fn fourth_live_value_spills() {
    // Four call results are live at once; the pool holds three.  The victim
    // is the latest-defined value no dearer than the new one, so the third
    // call's result is spilled to the first slot.
    let asm = compile_ir(
        "\
declare i32 @read()

define i32 @func(i32 %p) {
entry:
  %0 = call i32 @read()
  %1 = call i32 @read()
  %2 = call i32 @read()
  %3 = call i32 @read()
  %4 = add i32 %0, %1
  %5 = add i32 %2, %3
  %6 = add i32 %4, %5
  ret i32 %6
}",
    );
    assert!(asm.contains("\tmovl\t%eax, -4(%ebp)\n"));
    // The add reads the spilled value back from its slot.
    assert!(asm.contains("\tmovl\t-4(%ebp), %ecx\n"));
    // No allocas: the frame formula leaves zero extra space.
    assert!(asm.contains("\tsubl\t$0, %esp\n"));
}

#[test]
fn division_goes_through_eax_and_a_scratch_slot() {
    let asm = compile("int func(int p) { int x; x = p / 2; return x; }");
    // The immediate divisor is staged in memory; %edx is preserved.
    assert!(asm.contains("\tmovl\t$2, -12(%ebp)\n"));
    assert!(asm.contains("\tpushl\t%edx\n\tcltd\n\tidivl\t-12(%ebp)\n"));
    assert!(asm.contains("\tpopl\t%edx\n"));
}

#[test]
fn branch_condition_maps_every_predicate() {
    for (op, jcc) in [
        ("<", "jl"),
        (">", "jg"),
        ("<=", "jle"),
        (">=", "jge"),
        ("==", "je"),
        ("!=", "jne"),
    ] {
        let src =
            format!("int func(int p) {{ int x; x = 0; if (p {op} 3) {{ x = 1; }} return x; }}");
        let asm = compile(&src);
        assert!(asm.contains(&format!("\t{jcc} .L1\n")), "{op} should emit {jcc}");
    }
}

#[test]
fn every_memory_operand_is_frame_relative() {
    let asm = compile(
        "int func(int p) { int a; int b; a = p * 2; b = a - p; if (a > b) { print(a); } return b; }",
    );
    let slots = regex::Regex::new(r"(-?\d+)\(%ebp\)").unwrap();
    for caps in slots.captures_iter(&asm) {
        let off: i32 = caps[1].parse().unwrap();
        assert!(off == 8 || (off < 0 && off % 4 == 0), "odd offset {off}");
    }
    let regs = regex::Regex::new(r"%e[a-z]{2}").unwrap();
    for m in regs.find_iter(&asm) {
        assert!(
            ["%eax", "%ebx", "%ecx", "%edx", "%ebp", "%esp"].contains(&m.as_str()),
            "unexpected register {}",
            m.as_str()
        );
    }
}

#[test]
fn generated_code_is_deterministic() {
    let src = "int func(int p) { int i; i = 0; while (i < p) { i = i + read(); } return i; }";
    assert_eq!(compile(src), compile(src));
}

#[test]
fn reparsed_ir_compiles_identically() {
    let program = front::parse("int func(int p) { int x; x = p + p; return x; }").unwrap();
    front::check(&program).unwrap();
    let module = optimize(lower(program));
    let reparsed = text::parse(&text::print(&module)).unwrap();
    assert_eq!(code_gen(&module).asm_code(), code_gen(&reparsed).asm_code());
}
