//! Parser for the LLVM IR text subset emitted by the module printer.
//!
//! Line oriented: module header lines are accepted and ignored, function
//! bodies are split into labels and instructions, and instructions before
//! the first label belong to an implicit `entry` block. Malformed lines
//! fail the whole module with a line-numbered diagnostic.

use crate::ir::{CmpPred, FuncParam, Function, Instruction, IrType, Module, Opcode, Operand};
use std::fmt;

#[derive(Debug)]
pub struct IrParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for IrParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IR parse error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for IrParseError {}

pub struct IrParser;

impl IrParser {
    pub fn parse_module(text: &str) -> Result<Module, IrParseError> {
        let mut module = Module::default();
        let mut current: Option<Function> = None;
        let mut cur_block = 0usize;

        for (lineno, raw) in text.lines().enumerate() {
            let lineno = lineno + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let err = |message: String| IrParseError { line: lineno, message };

            if current.is_none() {
                // header lines (source_filename, target triple, ...) are ignored
                if line.starts_with("define ") {
                    current = Some(parse_def_line(line).map_err(err)?);
                    cur_block = 0;
                }
            } else if line == "}" {
                let mut func = current.take().unwrap();
                finish_function(&mut func);
                module.functions.push(func);
            } else if let Some(label) = line.strip_suffix(':') {
                cur_block = current.as_mut().unwrap().add_block(label.trim().to_string());
            } else {
                let mut inst = parse_instruction(line).map_err(err)?;
                inst.block_id = cur_block as i32;
                current.as_mut().unwrap().blocks[cur_block].insts.push(inst);
            }
        }

        if current.is_some() {
            return Err(IrParseError {
                line: text.lines().count(),
                message: "unterminated function definition".to_string(),
            });
        }
        Ok(module)
    }
}

/// `define dso_local {i32|void} @name(i32 noundef %0, ...) #0 {`
fn parse_def_line(line: &str) -> Result<Function, String> {
    let rest = line.strip_prefix("define ").unwrap().trim_start();
    let rest = rest.strip_prefix("dso_local ").unwrap_or(rest);

    let (ret, rest) = rest
        .split_once(' ')
        .ok_or_else(|| "missing return type in function definition".to_string())?;
    let return_type =
        IrType::from_str(ret).ok_or_else(|| format!("unknown return type '{}'", ret))?;

    let rest = rest
        .trim_start()
        .strip_prefix('@')
        .ok_or_else(|| "missing '@' in function definition".to_string())?;
    let lparen = rest.find('(').ok_or_else(|| "missing '(' in function definition".to_string())?;
    let rparen = rest.rfind(')').ok_or_else(|| "missing ')' in function definition".to_string())?;
    let name = rest[..lparen].trim();
    if name.is_empty() {
        return Err("empty function name".to_string());
    }

    let mut func = Function::new(name, return_type);
    for part in rest[lparen + 1..rparen].split(',') {
        let part = part.trim();
        if part.is_empty() || part == "void" {
            continue;
        }
        let vreg_tok = part
            .split_whitespace()
            .last()
            .and_then(|tok| tok.strip_prefix('%'))
            .ok_or_else(|| format!("malformed parameter '{}'", part))?;
        let vreg: u32 =
            vreg_tok.parse().map_err(|_| format!("malformed parameter '%{}'", vreg_tok))?;
        func.params.push(FuncParam { name: vreg.to_string(), ty: IrType::I32 });
        func.param_vregs.push(vreg);
    }

    func.add_block("entry");
    Ok(func)
}

fn finish_function(func: &mut Function) {
    let mut max_vreg: i32 = -1;
    for &v in &func.param_vregs {
        max_vreg = max_vreg.max(v as i32);
    }
    for block in &func.blocks {
        for inst in &block.insts {
            if let Some(d) = inst.def_reg() {
                max_vreg = max_vreg.max(d as i32);
            }
            for u in inst.use_regs() {
                max_vreg = max_vreg.max(u as i32);
            }
        }
    }
    func.max_vreg_id = max_vreg;
}

fn parse_instruction(line: &str) -> Result<Instruction, String> {
    if line == "ret void" {
        return Ok(Instruction::make_ret_void());
    }

    if let Some(rest) = line.strip_prefix("ret ") {
        let (ty, val) = rest
            .trim()
            .split_once(' ')
            .ok_or_else(|| format!("malformed ret '{}'", line))?;
        let ty = IrType::from_str(ty).ok_or_else(|| format!("unknown type '{}'", ty))?;
        return Ok(Instruction::make_ret(ty, parse_operand(val.trim())?));
    }

    if let Some(rest) = line.strip_prefix("br label ") {
        let target = parse_label(rest.trim())?;
        return Ok(Instruction::make_br(target));
    }

    if let Some(rest) = line.strip_prefix("br i1 ") {
        let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(format!("malformed conditional branch '{}'", line));
        }
        let cond = parse_operand(parts[0])?;
        let t = parse_label(strip_keyword(parts[1], "label")?)?;
        let f = parse_label(strip_keyword(parts[2], "label")?)?;
        return Ok(Instruction::make_cond_br(cond, t, f));
    }

    if let Some(rest) = line.strip_prefix("store ") {
        let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
        if parts.len() < 2 {
            return Err(format!("malformed store '{}'", line));
        }
        let (ty, val) =
            parts[0].split_once(' ').ok_or_else(|| format!("malformed store '{}'", line))?;
        let ty = IrType::from_str(ty).ok_or_else(|| format!("unknown type '{}'", ty))?;
        let ptr = parse_operand(strip_keyword(parts[1], "ptr")?)?;
        let align = parse_align(&parts[2..])?;
        return Ok(Instruction::make_store(ty, parse_operand(val.trim())?, ptr, align));
    }

    if let Some((def, rhs)) = line.split_once('=') {
        let def = parse_operand(def.trim())?;
        if !def.is_vreg() {
            return Err(format!("result of '{}' is not a vreg", line));
        }
        let rhs = rhs.trim();

        if let Some(rest) = rhs.strip_prefix("alloca ") {
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            let ty = IrType::from_str(parts[0])
                .ok_or_else(|| format!("unknown type '{}'", parts[0]))?;
            let align = parse_align(&parts[1..])?;
            return Ok(Instruction::make_alloca(def, ty, align));
        }

        if let Some(rest) = rhs.strip_prefix("load ") {
            let parts: Vec<&str> = rest.split(',').map(str::trim).collect();
            if parts.len() < 2 {
                return Err(format!("malformed load '{}'", line));
            }
            let ty = IrType::from_str(parts[0])
                .ok_or_else(|| format!("unknown type '{}'", parts[0]))?;
            let ptr = parse_operand(strip_keyword(parts[1], "ptr")?)?;
            let align = parse_align(&parts[2..])?;
            return Ok(Instruction::make_load(def, ty, ptr, align));
        }

        if let Some(rest) = rhs.strip_prefix("call ") {
            let lparen =
                rest.find('(').ok_or_else(|| format!("malformed call '{}'", line))?;
            let rparen =
                rest.rfind(')').ok_or_else(|| format!("malformed call '{}'", line))?;
            let (ty, callee) = rest[..lparen]
                .trim()
                .split_once(' ')
                .ok_or_else(|| format!("malformed call '{}'", line))?;
            let ty = IrType::from_str(ty).ok_or_else(|| format!("unknown type '{}'", ty))?;
            let callee = callee
                .trim()
                .strip_prefix('@')
                .ok_or_else(|| format!("malformed callee in '{}'", line))?;
            let mut args = Vec::new();
            for part in rest[lparen + 1..rparen].split(',') {
                let part = part.trim();
                if part.is_empty() {
                    continue;
                }
                let tok = part.split_whitespace().last().unwrap();
                args.push(parse_operand(tok)?);
            }
            return Ok(Instruction::make_call(def, ty, callee, args));
        }

        if let Some(rest) = rhs.strip_prefix("icmp ") {
            let mut tokens = rest.split_whitespace();
            let pred = tokens
                .next()
                .and_then(CmpPred::from_str)
                .ok_or_else(|| format!("unknown icmp predicate in '{}'", line))?;
            let ty = tokens
                .next()
                .and_then(IrType::from_str)
                .ok_or_else(|| format!("unknown type in '{}'", line))?;
            let rest: String = tokens.collect::<Vec<_>>().join(" ");
            let (lhs, rhs_op) = rest
                .split_once(',')
                .ok_or_else(|| format!("malformed icmp '{}'", line))?;
            return Ok(Instruction::make_icmp(
                pred,
                def,
                ty,
                parse_operand(lhs.trim())?,
                parse_operand(rhs_op.trim())?,
            ));
        }

        let mut tokens = rhs.split_whitespace();
        if let Some(opcode) = tokens.next().and_then(Opcode::arith_from_str) {
            let mut tok = tokens.next().ok_or_else(|| format!("malformed '{}'", line))?;
            if tok == "nsw" {
                tok = tokens.next().ok_or_else(|| format!("malformed '{}'", line))?;
            }
            let ty = IrType::from_str(tok).ok_or_else(|| format!("unknown type '{}'", tok))?;
            let rest: String = tokens.collect::<Vec<_>>().join(" ");
            let (lhs, rhs_op) =
                rest.split_once(',').ok_or_else(|| format!("malformed '{}'", line))?;
            return Ok(Instruction::make_bin_op(
                opcode,
                def,
                ty,
                parse_operand(lhs.trim())?,
                parse_operand(rhs_op.trim())?,
            ));
        }
    }

    Err(format!("unrecognized instruction '{}'", line))
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Result<&'a str, String> {
    s.strip_prefix(keyword)
        .map(str::trim)
        .ok_or_else(|| format!("expected '{}' in '{}'", keyword, s))
}

fn parse_align(parts: &[&str]) -> Result<u32, String> {
    match parts.first() {
        None => Ok(4),
        Some(part) => {
            let n = strip_keyword(part, "align")?;
            n.parse().map_err(|_| format!("malformed alignment '{}'", part))
        }
    }
}

fn parse_label(s: &str) -> Result<Operand, String> {
    match parse_operand(s)? {
        op @ Operand::Label(_) => Ok(op),
        other => Err(format!("expected label, found '{}'", other)),
    }
}

fn parse_operand(s: &str) -> Result<Operand, String> {
    if s == "true" {
        return Ok(Operand::BoolLit(true));
    }
    if s == "false" {
        return Ok(Operand::BoolLit(false));
    }
    if let Some(rest) = s.strip_prefix('%') {
        if !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()) {
            return rest
                .parse()
                .map(Operand::VReg)
                .map_err(|_| format!("vreg id out of range '%{}'", rest));
        }
        return Ok(Operand::Label(rest.to_string()));
    }
    s.parse().map(Operand::Imm).map_err(|_| format!("malformed operand '{}'", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"; ModuleID = 'toyc'
source_filename = "toyc"
target triple = "riscv32-unknown-elf"

define dso_local i32 @fact(i32 noundef %0) #0 {
  %2 = alloca i32, align 4
  store i32 %0, ptr %2, align 4
  %3 = load i32, ptr %2, align 4
  %4 = icmp sle i32 %3, 1
  br i1 %4, label %then_0, label %else_0

then_0:
  ret i32 1

else_0:
  %5 = load i32, ptr %2, align 4
  %6 = sub nsw i32 %5, 1
  %7 = call i32 @fact(i32 noundef %6)
  %8 = mul nsw i32 %5, %7
  ret i32 %8
}
"#;

    #[test]
    fn parses_functions_blocks_and_instructions() {
        let module = IrParser::parse_module(SAMPLE).unwrap();
        assert_eq!(module.functions.len(), 1);
        let func = &module.functions[0];
        assert_eq!(func.name, "fact");
        assert_eq!(func.param_vregs, vec![0]);
        assert_eq!(func.blocks.len(), 3);
        assert_eq!(func.blocks[0].name, "entry");
        assert_eq!(func.blocks[1].name, "then_0");
        assert_eq!(func.max_vreg_id, 8);

        let icmp = &func.blocks[0].insts[3];
        assert_eq!(icmp.opcode, Opcode::ICmp);
        assert_eq!(icmp.cmp_pred, CmpPred::Sle);
    }

    #[test]
    fn module_text_round_trips() {
        let module = IrParser::parse_module(SAMPLE).unwrap();
        let printed = module.to_string();
        let reparsed = IrParser::parse_module(&printed).unwrap();
        assert_eq!(reparsed.functions.len(), module.functions.len());
        for (a, b) in module.functions.iter().zip(&reparsed.functions) {
            assert_eq!(a.to_string(), b.to_string());
        }
    }

    #[test]
    fn malformed_instruction_reports_line() {
        let bad = "define dso_local i32 @f() #0 {\n  %1 = frobnicate i32 0\n}\n";
        let err = IrParser::parse_module(bad).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("unrecognized"));
    }

    #[test]
    fn bool_and_label_operands() {
        assert_eq!(parse_operand("true").unwrap(), Operand::BoolLit(true));
        assert_eq!(parse_operand("%12").unwrap(), Operand::VReg(12));
        assert_eq!(parse_operand("%while_end_0").unwrap(), Operand::Label("while_end_0".into()));
        assert_eq!(parse_operand("-42").unwrap(), Operand::Imm(-42));
    }
}
