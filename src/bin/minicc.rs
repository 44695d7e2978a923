//! the main compiler binary.  takes a miniC source file and writes the
//! pre-optimization IR (`out.ll`), the optimized IR (`out_new.ll`), and the
//! final assembly (`out_new.s`) to the working directory, or dumps a single
//! stage to stdout with `--out`.
//!
//! run with `--help` for more info.

use clap::{Parser, ValueEnum};

use minic::back::code_gen;
use minic::front::{self, lex};
use minic::middle::{lower, optimize, text};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// dump one stage to stdout instead of writing the output files
    #[arg(value_enum, short, long)]
    out: Option<Output>,
    /// turn on optimizations for the dumped stage
    #[arg(short = 'O', default_value_t = false)]
    optimize: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Output {
    /// the list of tokens
    Tokens,
    /// the ast data structure
    Ast,
    /// the textual IR
    Ir,
    /// the resulting assembly code
    Asm,
}

fn main() {
    let args = Args::parse();
    if let Err(message) = run(&args) {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), String> {
    let input = std::fs::read_to_string(&args.file)
        .map_err(|e| format!("cannot open '{}': {e}", args.file))?;

    if let Some(stage) = args.out {
        return dump(stage, &input, args.optimize);
    }

    let module = build_ir(&input)?;
    write_out("out.ll", text::print(&module))?;
    let module = optimize(module);
    write_out("out_new.ll", text::print(&module))?;
    write_out("out_new.s", code_gen(&module).asm_code())?;
    Ok(())
}

fn build_ir(input: &str) -> Result<minic::middle::ir::Module, String> {
    let program = front::parse(input).map_err(|e| e.to_string())?;
    front::check(&program).map_err(|e| e.to_string())?;
    Ok(lower(program))
}

fn write_out(path: &str, contents: String) -> Result<(), String> {
    std::fs::write(path, contents).map_err(|e| format!("cannot write '{path}': {e}"))
}

fn dump(stage: Output, input: &str, optimized: bool) -> Result<(), String> {
    match stage {
        Output::Tokens => {
            let mut lexer = lex::Lexer::new(input);
            loop {
                match lexer.next() {
                    Ok(Some(token)) => println!("{token}"),
                    Ok(None) => break,
                    Err(e) => return Err(e.to_string()),
                }
            }
        }
        Output::Ast => {
            let program = front::parse(input).map_err(|e| e.to_string())?;
            front::check(&program).map_err(|e| e.to_string())?;
            println!("{program:#?}");
        }
        Output::Ir => {
            let mut module = build_ir(input)?;
            if optimized {
                module = optimize(module);
            }
            print!("{}", text::print(&module));
        }
        Output::Asm => {
            let mut module = build_ir(input)?;
            if optimized {
                module = optimize(module);
            }
            print!("{}", code_gen(&module).asm_code());
        }
    }
    Ok(())
}
