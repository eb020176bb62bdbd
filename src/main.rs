use std::env;
use std::fmt::Write as _;
use std::fs;
use std::process::ExitCode;

use toyc::asm::generate_asm_string;
use toyc::grammar::CompUnitParser;
use toyc::ir::builder::IrBuilder;
use toyc::ir::parser::IrParser;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Ast,
    Ir,
    Asm,
    All,
}

fn usage() -> String {
    "usage: toyc <input.c|input.tc|input.ll> [flags]\n\
     \n\
     flags:\n\
     \x20 --ast    print the AST\n\
     \x20 --ir     print LLVM IR text\n\
     \x20 --asm    print RISC-V assembly (default)\n\
     \x20 --all    print all three\n\
     \x20 -o FILE  write output to FILE"
        .to_string()
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("toyc: error: {}", message);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), String> {
    let mut input: Option<String> = None;
    let mut mode = Mode::Asm;
    let mut output: Option<String> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--ast" => mode = Mode::Ast,
            "--ir" => mode = Mode::Ir,
            "--asm" => mode = Mode::Asm,
            "--all" => mode = Mode::All,
            "-o" => {
                output = Some(args.next().ok_or_else(|| "-o requires a file name".to_string())?)
            }
            _ if arg.starts_with('-') => return Err(format!("unknown flag '{}'\n{}", arg, usage())),
            _ => input = Some(arg),
        }
    }
    let Some(input) = input else {
        return Err(usage());
    };

    let source =
        fs::read_to_string(&input).map_err(|e| format!("cannot open '{}': {}", input, e))?;

    // the whole output is buffered so a failed compilation leaves no
    // partial file behind
    let mut out = String::new();

    if input.ends_with(".ll") {
        let mut module = IrParser::parse_module(&source).map_err(|e| e.to_string())?;
        if matches!(mode, Mode::Ast | Mode::All) {
            out.push_str("AST not available for LLVM IR input\n\n");
        }
        if matches!(mode, Mode::Ir | Mode::All) {
            let _ = write!(out, "{}", module);
        }
        if matches!(mode, Mode::Asm | Mode::All) {
            out.push_str(&generate_asm_string(&mut module));
        }
    } else {
        let unit = CompUnitParser::new()
            .parse(&source)
            .map_err(|e| format!("parse error in '{}': {}", input, e))?;
        if matches!(mode, Mode::Ast | Mode::All) {
            let _ = writeln!(out, "{:#?}", unit);
        }
        if matches!(mode, Mode::Ir | Mode::Asm | Mode::All) {
            let mut module = IrBuilder::build_module(&unit);
            if matches!(mode, Mode::Ir | Mode::All) {
                let _ = write!(out, "{}", module);
            }
            if matches!(mode, Mode::Asm | Mode::All) {
                out.push_str(&generate_asm_string(&mut module));
            }
        }
    }

    match output {
        Some(path) => {
            fs::write(&path, out).map_err(|e| format!("cannot write '{}': {}", path, e))?
        }
        None => print!("{}", out),
    }
    Ok(())
}
