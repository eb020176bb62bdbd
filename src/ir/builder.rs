//! Lowering from the ToyC AST to the typed IR.

use crate::ast::{self, BinaryOp, BlockItem, Exp, FuncType, Stmt, UnaryOp};
use crate::ir::{CmpPred, FuncParam, Function, Instruction, IrType, Module, Opcode, Operand};
use rustc_hash::FxHashMap;

/// Builds an IR [`Module`] from a parsed compilation unit.
pub struct IrBuilder;

impl IrBuilder {
    pub fn build_module(unit: &ast::CompUnit) -> Module {
        let mut module = Module::default();
        for func in &unit.funcs {
            module.functions.push(FuncBuilder::build(func));
        }
        module
    }
}

/// Per-function lowering context: scope stack, loop label stack, the
/// shared label counter, and a cache of loaded variable values keyed by
/// the variable's alloca vreg.
struct FuncBuilder {
    func: Function,
    cur: usize,
    vreg_counter: u32,
    label_counter: u32,
    scopes: Vec<FxHashMap<String, Operand>>,
    loaded: FxHashMap<u32, Operand>,
    break_labels: Vec<String>,
    continue_labels: Vec<String>,
}

impl FuncBuilder {
    fn build(def: &ast::FuncDef) -> Function {
        let ret_ty = match def.ret_type {
            FuncType::Int => IrType::I32,
            FuncType::Void => IrType::Void,
        };
        let mut b = FuncBuilder {
            func: Function::new(def.ident.clone(), ret_ty),
            cur: 0,
            // Parameters occupy vregs 0..k-1; the entry block owns the next
            // number, so the instruction counter starts at k and
            // pre-increments (clang's numbering).
            vreg_counter: def.params.len() as u32,
            label_counter: 0,
            scopes: vec![FxHashMap::default()],
            loaded: FxHashMap::default(),
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
        };

        for (i, _) in def.params.iter().enumerate() {
            b.func.params.push(FuncParam { name: i.to_string(), ty: IrType::I32 });
            b.func.param_vregs.push(i as u32);
        }

        b.cur = b.func.add_block("entry");

        // main carries a zero-initialized result slot
        if def.ident == "main" {
            let ret_var = b.new_vreg();
            b.add_variable(format!("{}_ret", def.ident), ret_var.clone());
            b.emit(Instruction::make_alloca(ret_var.clone(), IrType::I32, 4));
            b.emit(Instruction::make_store(IrType::I32, Operand::Imm(0), ret_var, 4));
        }

        // every parameter is spilled to its own slot at entry
        for (i, param) in def.params.iter().enumerate() {
            let slot = b.new_vreg();
            b.emit(Instruction::make_alloca(slot.clone(), IrType::I32, 4));
            b.emit(Instruction::make_store(
                IrType::I32,
                Operand::VReg(i as u32),
                slot.clone(),
                4,
            ));
            b.add_variable(param.ident.clone(), slot);
        }

        b.build_block(&def.block);

        if !b.is_terminated() {
            match ret_ty {
                IrType::Void => b.emit(Instruction::make_ret_void()),
                _ => b.emit(Instruction::make_ret(IrType::I32, Operand::Imm(0))),
            }
        }

        b.func.max_vreg_id = b.vreg_counter as i32;
        b.func
    }

    // ---------------- helpers ----------------

    fn new_vreg(&mut self) -> Operand {
        self.vreg_counter += 1;
        Operand::VReg(self.vreg_counter)
    }

    fn new_label(&self, base: &str) -> String {
        format!("{}_{}", base, self.label_counter)
    }

    fn create_block(&mut self, name: String) -> usize {
        self.func.add_block(name)
    }

    fn emit(&mut self, mut inst: Instruction) {
        inst.block_id = self.cur as i32;
        self.func.blocks[self.cur].insts.push(inst);
    }

    fn is_terminated(&self) -> bool {
        self.func.blocks[self.cur].is_terminated()
    }

    fn enter_scope(&mut self) {
        self.scopes.push(FxHashMap::default());
    }

    fn exit_scope(&mut self) {
        self.scopes.pop();
    }

    fn add_variable(&mut self, name: String, slot: Operand) {
        self.scopes.last_mut().unwrap().insert(name, slot);
    }

    fn find_variable(&self, name: &str) -> Option<Operand> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name).cloned())
    }

    /// Conditions must be a vreg or a boolean literal; integer literals in
    /// condition position become `true`/`false`.
    fn as_condition(op: Operand) -> Operand {
        match op {
            Operand::Imm(v) => Operand::BoolLit(v != 0),
            other => other,
        }
    }

    // ---------------- statements ----------------

    fn build_block(&mut self, block: &ast::Block) {
        self.enter_scope();
        for item in &block.items {
            if self.is_terminated() {
                break;
            }
            match item {
                BlockItem::Decl(decl) => self.build_decl(decl),
                BlockItem::Stmt(stmt) => self.build_stmt(stmt),
            }
        }
        self.exit_scope();
    }

    fn build_decl(&mut self, decl: &ast::Decl) {
        for def in &decl.defs {
            let value = self.build_exp(&def.init);
            let slot = self.new_vreg();
            self.emit(Instruction::make_alloca(slot.clone(), IrType::I32, 4));
            self.add_variable(def.ident.clone(), slot.clone());
            self.emit(Instruction::make_store(IrType::I32, value, slot.clone(), 4));
            self.loaded.remove(&slot.vreg().unwrap());
        }
    }

    fn build_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { ident, exp } => {
                let value = self.build_exp(exp);
                let slot = self
                    .find_variable(ident)
                    .unwrap_or_else(|| panic!("assignment to undefined variable '{}'", ident));
                self.emit(Instruction::make_store(IrType::I32, value, slot.clone(), 4));
                self.loaded.remove(&slot.vreg().unwrap());
            }
            Stmt::Exp(exp) => {
                if let Some(exp) = exp {
                    self.build_exp(exp);
                }
            }
            Stmt::Block(block) => self.build_block(block),
            Stmt::If(if_stmt) => self.build_if(if_stmt),
            Stmt::While(while_stmt) => self.build_while(while_stmt),
            Stmt::Break => {
                let target = self
                    .break_labels
                    .last()
                    .cloned()
                    .expect("'break' statement not within a loop");
                self.emit(Instruction::make_br(Operand::Label(target)));
            }
            Stmt::Continue => {
                let target = self
                    .continue_labels
                    .last()
                    .cloned()
                    .expect("'continue' statement not within a loop");
                self.emit(Instruction::make_br(Operand::Label(target)));
            }
            Stmt::Return(exp) => {
                match exp {
                    Some(exp) => {
                        let value = self.build_exp(exp);
                        self.emit(Instruction::make_ret(IrType::I32, value));
                    }
                    None => self.emit(Instruction::make_ret_void()),
                }
            }
        }
    }

    fn build_if(&mut self, if_stmt: &ast::If) {
        self.loaded.clear();
        let cond = Self::as_condition(self.build_exp(&if_stmt.cond));

        let then_name = self.new_label("then");
        let else_name = self.new_label("else");
        let end_name = self.new_label("endif");
        self.label_counter += 1;

        self.emit(Instruction::make_cond_br(
            cond,
            Operand::Label(then_name.clone()),
            Operand::Label(else_name.clone()),
        ));

        self.cur = self.create_block(then_name);
        self.loaded.clear();
        self.build_stmt(&if_stmt.then_stmt);
        if !self.is_terminated() {
            self.emit(Instruction::make_br(Operand::Label(end_name.clone())));
        }

        // an if without an else still gets an (empty) else block
        self.cur = self.create_block(else_name);
        self.loaded.clear();
        if let Some(else_stmt) = &if_stmt.else_stmt {
            self.build_stmt(else_stmt);
        }
        if !self.is_terminated() {
            self.emit(Instruction::make_br(Operand::Label(end_name.clone())));
        }

        self.cur = self.create_block(end_name);
        self.loaded.clear();
    }

    fn build_while(&mut self, while_stmt: &ast::While) {
        let cond_name = self.new_label("while_cond");
        let body_name = self.new_label("while_body");
        let end_name = self.new_label("while_end");
        self.label_counter += 1;

        self.break_labels.push(end_name.clone());
        self.continue_labels.push(cond_name.clone());

        self.emit(Instruction::make_br(Operand::Label(cond_name.clone())));

        self.cur = self.create_block(cond_name.clone());
        self.loaded.clear();
        let cond = Self::as_condition(self.build_exp(&while_stmt.cond));
        self.emit(Instruction::make_cond_br(
            cond,
            Operand::Label(body_name.clone()),
            Operand::Label(end_name.clone()),
        ));

        self.cur = self.create_block(body_name);
        self.loaded.clear();
        self.build_stmt(&while_stmt.body);
        if !self.is_terminated() {
            self.emit(Instruction::make_br(Operand::Label(cond_name)));
        }

        self.cur = self.create_block(end_name);
        self.loaded.clear();

        self.break_labels.pop();
        self.continue_labels.pop();
    }

    // ---------------- expressions ----------------

    fn build_exp(&mut self, exp: &Exp) -> Operand {
        match exp {
            Exp::Number(v) => Operand::Imm(*v),
            Exp::LVal(name) => {
                let slot = self
                    .find_variable(name)
                    .unwrap_or_else(|| panic!("undefined variable '{}'", name));
                let slot_id = slot.vreg().unwrap();
                if let Some(cached) = self.loaded.get(&slot_id) {
                    return cached.clone();
                }
                let temp = self.new_vreg();
                self.emit(Instruction::make_load(temp.clone(), IrType::I32, slot, 4));
                self.loaded.insert(slot_id, temp.clone());
                temp
            }
            Exp::Call { callee, args } => self.build_call(callee, args),
            Exp::Unary { op, exp } => self.build_unary(*op, exp),
            Exp::Binary { op, lhs, rhs } => self.build_binary(*op, lhs, rhs),
        }
    }

    fn build_binary(&mut self, op: BinaryOp, lhs: &Exp, rhs: &Exp) -> Operand {
        if matches!(op, BinaryOp::LAnd | BinaryOp::LOr) {
            return self.build_logical(op, lhs, rhs);
        }
        if let Some(pred) = comparison_pred(op) {
            let lhs = self.build_exp(lhs);
            let rhs = self.build_exp(rhs);
            let result = self.new_vreg();
            self.emit(Instruction::make_icmp(pred, result.clone(), IrType::I32, lhs, rhs));
            return result;
        }

        let lhs = self.build_exp(lhs);
        let rhs = self.build_exp(rhs);
        let result = self.new_vreg();
        let opcode = match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => Opcode::SDiv,
            _ => Opcode::SRem,
        };
        self.emit(Instruction::make_bin_op(opcode, result.clone(), IrType::I32, lhs, rhs));
        result
    }

    fn build_unary(&mut self, op: UnaryOp, exp: &Exp) -> Operand {
        match op {
            UnaryOp::Pos => self.build_exp(exp),
            UnaryOp::Neg => {
                if let Exp::Number(v) = exp {
                    return Operand::Imm(v.wrapping_neg());
                }
                let inner = self.build_exp(exp);
                let result = self.new_vreg();
                self.emit(Instruction::make_bin_op(
                    Opcode::Sub,
                    result.clone(),
                    IrType::I32,
                    Operand::Imm(0),
                    inner,
                ));
                result
            }
            UnaryOp::Not => {
                let inner = self.build_exp(exp);
                let result = self.new_vreg();
                self.emit(Instruction::make_icmp(
                    CmpPred::Eq,
                    result.clone(),
                    IrType::I32,
                    inner,
                    Operand::Imm(0),
                ));
                result
            }
        }
    }

    /// Short-circuit `&&`/`||`: an `i1` result slot, a conditional branch
    /// on the left operand, and a final load of the slot.
    fn build_logical(&mut self, op: BinaryOp, lhs: &Exp, rhs: &Exp) -> Operand {
        let result_var = self.new_vreg();
        self.emit(Instruction::make_alloca(result_var.clone(), IrType::I1, 1));

        let lhs = Self::as_condition(self.build_exp(lhs));

        if op == BinaryOp::LAnd {
            let rhs_name = self.new_label("land_rhs");
            let false_name = self.new_label("land_false");
            let end_name = self.new_label("land_end");
            self.label_counter += 1;

            self.emit(Instruction::make_cond_br(
                lhs,
                Operand::Label(rhs_name.clone()),
                Operand::Label(false_name.clone()),
            ));

            self.cur = self.create_block(false_name);
            self.emit(Instruction::make_store(
                IrType::I1,
                Operand::BoolLit(false),
                result_var.clone(),
                1,
            ));
            self.emit(Instruction::make_br(Operand::Label(end_name.clone())));

            self.cur = self.create_block(rhs_name);
            let rhs = self.build_exp(rhs);
            self.emit(Instruction::make_store(IrType::I1, rhs, result_var.clone(), 1));
            self.emit(Instruction::make_br(Operand::Label(end_name.clone())));

            self.cur = self.create_block(end_name);
        } else {
            let true_name = self.new_label("lor_true");
            let rhs_name = self.new_label("lor_rhs");
            let end_name = self.new_label("lor_end");
            self.label_counter += 1;

            self.emit(Instruction::make_cond_br(
                lhs,
                Operand::Label(true_name.clone()),
                Operand::Label(rhs_name.clone()),
            ));

            self.cur = self.create_block(true_name);
            self.emit(Instruction::make_store(
                IrType::I1,
                Operand::BoolLit(true),
                result_var.clone(),
                1,
            ));
            self.emit(Instruction::make_br(Operand::Label(end_name.clone())));

            self.cur = self.create_block(rhs_name);
            let rhs = self.build_exp(rhs);
            self.emit(Instruction::make_store(IrType::I1, rhs, result_var.clone(), 1));
            self.emit(Instruction::make_br(Operand::Label(end_name.clone())));

            self.cur = self.create_block(end_name);
        }

        // values loaded on either arm are not valid at the join
        self.loaded.clear();

        let result = self.new_vreg();
        self.emit(Instruction::make_load(result.clone(), IrType::I1, result_var, 1));
        result
    }

    fn build_call(&mut self, callee: &str, args: &[Exp]) -> Operand {
        let args: Vec<Operand> = args.iter().map(|arg| self.build_exp(arg)).collect();
        let result = self.new_vreg();
        self.emit(Instruction::make_call(result.clone(), IrType::I32, callee, args));
        result
    }
}

fn comparison_pred(op: BinaryOp) -> Option<CmpPred> {
    match op {
        BinaryOp::Eq => Some(CmpPred::Eq),
        BinaryOp::Ne => Some(CmpPred::Ne),
        BinaryOp::Lt => Some(CmpPred::Slt),
        BinaryOp::Gt => Some(CmpPred::Sgt),
        BinaryOp::Le => Some(CmpPred::Sle),
        BinaryOp::Ge => Some(CmpPred::Sge),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::CompUnitParser;
    use crate::ir::Module;

    fn build(source: &str) -> Module {
        let unit = CompUnitParser::new().parse(source).expect("parse failed");
        IrBuilder::build_module(&unit)
    }

    #[test]
    fn vregs_are_defined_at_most_once() {
        let module = build(
            "int fact(int n) { if (n <= 1) return 1; return n * fact(n - 1); }
             int main() { return fact(5); }",
        );
        for func in &module.functions {
            let mut seen = std::collections::HashSet::new();
            for block in &func.blocks {
                for inst in &block.insts {
                    if let Some(def) = inst.def_reg() {
                        assert!(seen.insert(def), "vreg %{} defined twice in @{}", def, func.name);
                    }
                }
            }
        }
    }

    #[test]
    fn main_gets_hidden_result_slot_and_param_numbering_is_clang_style() {
        let module = build("int add(int a, int b) { return a + b; } int main() { return 0; }");
        let add = &module.functions[0];
        assert_eq!(add.param_vregs, vec![0, 1]);
        // first instruction vreg skips the entry block's implicit number
        assert_eq!(add.blocks[0].insts[0].def_reg(), Some(3));

        let main = &module.functions[1];
        let entry = &main.blocks[0];
        assert_eq!(entry.insts[0].opcode, Opcode::Alloca);
        assert_eq!(entry.insts[1].opcode, Opcode::Store);
    }

    #[test]
    fn blocks_end_with_a_single_terminator() {
        let module = build(
            "int main() {
                int i = 0;
                while (i < 10) {
                    if (i == 5) break;
                    i = i + 1;
                }
                return i;
            }",
        );
        for block in &module.functions[0].blocks {
            for (k, inst) in block.insts.iter().enumerate() {
                if inst.is_terminator() {
                    assert_eq!(k, block.insts.len() - 1, "terminator mid-block in {}", block.name);
                }
            }
        }
    }

    #[test]
    fn short_circuit_lowering_uses_i1_slot() {
        let module = build("int main() { int a = 1; int b = 0; return a && b; }");
        let func = &module.functions[0];
        let text = func.to_string();
        assert!(text.contains("alloca i1, align 1"));
        assert!(text.contains("land_rhs_"));
        assert!(text.contains("store i1 false"));
        assert!(text.contains("load i1"));
    }

    #[test]
    fn literal_condition_becomes_bool() {
        let module = build("int main() { while (1) { return 3; } return 0; }");
        let text = module.functions[0].to_string();
        assert!(text.contains("br i1 true"));
    }

    #[test]
    fn if_without_else_still_branches_through_else_block() {
        let module = build("int main() { int x = 1; if (x > 0) x = 2; return x; }");
        let func = &module.functions[0];
        assert!(func.block_map.contains_key("else_0"));
        let else_id = func.block_map["else_0"];
        assert_eq!(func.blocks[else_id].insts.len(), 1);
        assert!(func.blocks[else_id].insts[0].is_terminator());
    }

    #[test]
    fn default_return_added_to_open_final_block() {
        let module = build("int f(int c) { if (c) return 1; }");
        let func = &module.functions[0];
        let last = func.blocks.last().unwrap();
        assert_eq!(last.insts.last().unwrap().opcode, Opcode::Ret);
    }
}
