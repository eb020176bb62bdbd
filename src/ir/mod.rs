//! Typed SSA-form intermediate representation.
//!
//! A [`Module`] owns its [`Function`]s, a function owns its
//! [`BasicBlock`]s, and a block owns its [`Instruction`]s. Control-flow
//! edges are stored as block indices into the owning function, so the CFG
//! carries no shared ownership. The textual form is a compatible subset of
//! LLVM IR and round-trips through [`parser`].

pub mod builder;
pub mod parser;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use std::fmt;

/// The closed set of IR operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Alloca,
    Load,
    Store,
    Add,
    Sub,
    Mul,
    SDiv,
    SRem,
    ICmp,
    Br,
    CondBr,
    Ret,
    RetVoid,
    Call,
}

impl Opcode {
    /// LLVM IR keyword for this operation.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Alloca => "alloca",
            Opcode::Load => "load",
            Opcode::Store => "store",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::SDiv => "sdiv",
            Opcode::SRem => "srem",
            Opcode::ICmp => "icmp",
            Opcode::Br | Opcode::CondBr => "br",
            Opcode::Ret | Opcode::RetVoid => "ret",
            Opcode::Call => "call",
        }
    }

    /// Whether instructions with this opcode produce a result vreg.
    pub fn defines_value(self) -> bool {
        matches!(
            self,
            Opcode::Alloca
                | Opcode::Load
                | Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::SDiv
                | Opcode::SRem
                | Opcode::ICmp
                | Opcode::Call
        )
    }

    pub fn arith_from_str(s: &str) -> Option<Opcode> {
        match s {
            "add" => Some(Opcode::Add),
            "sub" => Some(Opcode::Sub),
            "mul" => Some(Opcode::Mul),
            "sdiv" => Some(Opcode::SDiv),
            "srem" => Some(Opcode::SRem),
            _ => None,
        }
    }
}

/// Signed comparison predicates for `icmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sgt,
    Sle,
    Sge,
}

impl CmpPred {
    pub fn as_str(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Slt => "slt",
            CmpPred::Sgt => "sgt",
            CmpPred::Sle => "sle",
            CmpPred::Sge => "sge",
        }
    }

    pub fn from_str(s: &str) -> Option<CmpPred> {
        match s {
            "eq" => Some(CmpPred::Eq),
            "ne" => Some(CmpPred::Ne),
            "slt" => Some(CmpPred::Slt),
            "sgt" => Some(CmpPred::Sgt),
            "sle" => Some(CmpPred::Sle),
            "sge" => Some(CmpPred::Sge),
            _ => None,
        }
    }
}

impl fmt::Display for CmpPred {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value types carried by instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrType {
    I32,
    I1,
    Void,
}

impl IrType {
    pub fn from_str(s: &str) -> Option<IrType> {
        match s {
            "i32" => Some(IrType::I32),
            "i1" => Some(IrType::I1),
            "void" => Some(IrType::Void),
            _ => None,
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            IrType::I32 => "i32",
            IrType::I1 => "i1",
            IrType::Void => "void",
        })
    }
}

/// An instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    VReg(u32),
    Imm(i32),
    Label(String),
    BoolLit(bool),
}

impl Operand {
    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }

    pub fn is_vreg(&self) -> bool {
        matches!(self, Operand::VReg(_))
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Operand::Imm(_))
    }

    /// The vreg id, if this operand is a virtual register.
    pub fn vreg(&self) -> Option<u32> {
        match self {
            Operand::VReg(id) => Some(*id),
            _ => None,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Operand::Label(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::VReg(id) => write!(f, "%{}", id),
            Operand::Imm(v) => write!(f, "{}", v),
            Operand::Label(name) => write!(f, "%{}", name),
            Operand::BoolLit(b) => f.write_str(if *b { "true" } else { "false" }),
        }
    }
}

/// A single IR instruction.
///
/// `index` and `block_id` are assigned late, when the allocator linearizes
/// the function in reverse postorder.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub opcode: Opcode,
    pub ty: IrType,
    pub def: Operand,
    pub ops: SmallVec<[Operand; 3]>,
    pub cmp_pred: CmpPred,
    pub callee: String,
    pub nsw: bool,
    pub align: u32,
    pub index: i32,
    pub block_id: i32,
}

impl Instruction {
    fn new(opcode: Opcode, ty: IrType) -> Instruction {
        Instruction {
            opcode,
            ty,
            def: Operand::None,
            ops: SmallVec::new(),
            cmp_pred: CmpPred::Eq,
            callee: String::new(),
            nsw: false,
            align: 4,
            index: -1,
            block_id: -1,
        }
    }

    pub fn make_alloca(def: Operand, ty: IrType, align: u32) -> Instruction {
        let mut i = Instruction::new(Opcode::Alloca, ty);
        i.def = def;
        i.align = align;
        i
    }

    pub fn make_load(def: Operand, ty: IrType, ptr: Operand, align: u32) -> Instruction {
        let mut i = Instruction::new(Opcode::Load, ty);
        i.def = def;
        i.ops.push(ptr);
        i.align = align;
        i
    }

    pub fn make_store(ty: IrType, value: Operand, ptr: Operand, align: u32) -> Instruction {
        let mut i = Instruction::new(Opcode::Store, ty);
        i.ops.push(value);
        i.ops.push(ptr);
        i.align = align;
        i
    }

    pub fn make_bin_op(
        opcode: Opcode,
        def: Operand,
        ty: IrType,
        lhs: Operand,
        rhs: Operand,
    ) -> Instruction {
        let mut i = Instruction::new(opcode, ty);
        i.def = def;
        i.ops.push(lhs);
        i.ops.push(rhs);
        i.nsw = true;
        i
    }

    pub fn make_icmp(
        pred: CmpPred,
        def: Operand,
        ty: IrType,
        lhs: Operand,
        rhs: Operand,
    ) -> Instruction {
        let mut i = Instruction::new(Opcode::ICmp, ty);
        i.def = def;
        i.ops.push(lhs);
        i.ops.push(rhs);
        i.cmp_pred = pred;
        i
    }

    pub fn make_br(target: Operand) -> Instruction {
        let mut i = Instruction::new(Opcode::Br, IrType::Void);
        i.ops.push(target);
        i
    }

    pub fn make_cond_br(cond: Operand, true_target: Operand, false_target: Operand) -> Instruction {
        let mut i = Instruction::new(Opcode::CondBr, IrType::Void);
        i.ops.push(cond);
        i.ops.push(true_target);
        i.ops.push(false_target);
        i
    }

    pub fn make_ret(ty: IrType, value: Operand) -> Instruction {
        let mut i = Instruction::new(Opcode::Ret, ty);
        i.ops.push(value);
        i
    }

    pub fn make_ret_void() -> Instruction {
        Instruction::new(Opcode::RetVoid, IrType::Void)
    }

    pub fn make_call(
        def: Operand,
        ret_ty: IrType,
        callee: impl Into<String>,
        args: impl IntoIterator<Item = Operand>,
    ) -> Instruction {
        let mut i = Instruction::new(Opcode::Call, ret_ty);
        i.def = def;
        i.callee = callee.into();
        i.ops.extend(args);
        i
    }

    /// The vreg written by this instruction, if any.
    pub fn def_reg(&self) -> Option<u32> {
        self.def.vreg()
    }

    /// The vregs read by this instruction, in operand order. The operand
    /// positions that count as uses depend on the opcode; labels never do.
    pub fn use_regs(&self) -> Vec<u32> {
        match self.opcode {
            Opcode::Alloca | Opcode::Br | Opcode::RetVoid => Vec::new(),
            // ops[0] = ptr
            Opcode::Load => self.ops.first().and_then(Operand::vreg).into_iter().collect(),
            // ops[0] = cond, the rest are labels
            Opcode::CondBr => self.ops.first().and_then(Operand::vreg).into_iter().collect(),
            Opcode::Ret => self.ops.first().and_then(Operand::vreg).into_iter().collect(),
            // value + ptr, both operands may be vregs; likewise binary ops
            // and call arguments
            Opcode::Store
            | Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::SDiv
            | Opcode::SRem
            | Opcode::ICmp
            | Opcode::Call => self.ops.iter().filter_map(Operand::vreg).collect(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Br | Opcode::CondBr | Opcode::Ret | Opcode::RetVoid
        )
    }

    pub fn is_call(&self) -> bool {
        self.opcode == Opcode::Call
    }

    /// Labels this instruction may branch to (true target first).
    pub fn branch_targets(&self) -> Vec<&str> {
        match self.opcode {
            Opcode::Br => self.ops.iter().filter_map(Operand::label).collect(),
            Opcode::CondBr => self.ops.iter().skip(1).filter_map(Operand::label).collect(),
            _ => Vec::new(),
        }
    }

    /// The condition vreg of a conditional branch.
    pub fn branch_cond_reg(&self) -> Option<u32> {
        match self.opcode {
            Opcode::CondBr => self.ops.first().and_then(Operand::vreg),
            _ => None,
        }
    }

    /// Write position of this instruction in the two-point position model.
    pub fn pos_def(&self) -> i32 {
        self.index * 2
    }

    /// Read position of this instruction in the two-point position model.
    pub fn pos_use(&self) -> i32 {
        self.index * 2 + 1
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.opcode {
            Opcode::Alloca => {
                write!(f, "{} = alloca {}, align {}", self.def, self.ty, self.align)
            }
            Opcode::Load => write!(
                f,
                "{} = load {}, ptr {}, align {}",
                self.def, self.ty, self.ops[0], self.align
            ),
            Opcode::Store => write!(
                f,
                "store {} {}, ptr {}, align {}",
                self.ty, self.ops[0], self.ops[1], self.align
            ),
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::SDiv | Opcode::SRem => write!(
                f,
                "{} = {}{} {} {}, {}",
                self.def,
                self.opcode.mnemonic(),
                if self.nsw { " nsw" } else { "" },
                self.ty,
                self.ops[0],
                self.ops[1]
            ),
            Opcode::ICmp => write!(
                f,
                "{} = icmp {} {} {}, {}",
                self.def, self.cmp_pred, self.ty, self.ops[0], self.ops[1]
            ),
            Opcode::Br => write!(f, "br label {}", self.ops[0]),
            Opcode::CondBr => write!(
                f,
                "br i1 {}, label {}, label {}",
                self.ops[0], self.ops[1], self.ops[2]
            ),
            Opcode::Ret => write!(f, "ret {} {}", self.ty, self.ops[0]),
            Opcode::RetVoid => f.write_str("ret void"),
            Opcode::Call => {
                write!(f, "{} = call {} @{}(", self.def, self.ty, self.callee)?;
                for (j, op) in self.ops.iter().enumerate() {
                    if j > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "i32 noundef {}", op)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A basic block: a label, an owned instruction sequence, index-based CFG
/// edges, and the four liveness sets filled in by the analyzer.
#[derive(Debug, Default)]
pub struct BasicBlock {
    pub id: usize,
    pub name: String,
    pub insts: Vec<Instruction>,
    pub succs: Vec<usize>,
    pub preds: Vec<usize>,
    pub def_set: FxHashSet<u32>,
    pub use_set: FxHashSet<u32>,
    pub live_in: FxHashSet<u32>,
    pub live_out: FxHashSet<u32>,
}

impl BasicBlock {
    /// Position of the first instruction, -1 for an empty block.
    pub fn first_pos(&self) -> i32 {
        self.insts.first().map_or(-1, Instruction::pos_def)
    }

    /// Position of the last instruction, -1 for an empty block.
    pub fn last_pos(&self) -> i32 {
        self.insts.last().map_or(-1, Instruction::pos_use)
    }

    pub fn is_terminated(&self) -> bool {
        self.insts.last().is_some_and(Instruction::is_terminator)
    }
}

#[derive(Debug, Clone)]
pub struct FuncParam {
    pub name: String,
    pub ty: IrType,
}

/// An IR function: parameters, owned basic blocks (index 0 is the entry
/// block), a label lookup map, and the reverse-postorder view computed by
/// the liveness analysis.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub return_type: IrType,
    pub params: Vec<FuncParam>,
    pub blocks: Vec<BasicBlock>,
    pub block_map: FxHashMap<String, usize>,
    pub rpo_order: Vec<usize>,
    pub param_vregs: Vec<u32>,
    pub max_vreg_id: i32,
}

impl Function {
    pub fn new(name: impl Into<String>, return_type: IrType) -> Function {
        Function {
            name: name.into(),
            return_type,
            params: Vec::new(),
            blocks: Vec::new(),
            block_map: FxHashMap::default(),
            rpo_order: Vec::new(),
            param_vregs: Vec::new(),
            max_vreg_id: -1,
        }
    }

    /// Create a new block with the given label and append it.
    pub fn add_block(&mut self, name: impl Into<String>) -> usize {
        let id = self.blocks.len();
        let name = name.into();
        self.block_map.insert(name.clone(), id);
        self.blocks.push(BasicBlock { id, name, ..BasicBlock::default() });
        id
    }

    pub fn entry_block(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    /// Populate successor/predecessor edges from block terminators. A block
    /// whose last instruction is not a terminator falls through to the
    /// textually next block; empty blocks get no edges. Branching to an
    /// unknown label is a builder bug.
    pub fn build_cfg(&mut self) {
        for block in &mut self.blocks {
            block.succs.clear();
            block.preds.clear();
        }

        let mut edges = Vec::new();
        for (i, block) in self.blocks.iter().enumerate() {
            let Some(last) = block.insts.last() else {
                continue;
            };
            if last.is_terminator() {
                for target in last.branch_targets() {
                    match self.block_map.get(target) {
                        Some(&j) => edges.push((i, j)),
                        None => panic!("branch to unknown label %{} in @{}", target, self.name),
                    }
                }
            } else if i + 1 < self.blocks.len() {
                edges.push((i, i + 1));
            }
        }

        for (i, j) in edges {
            self.blocks[i].succs.push(j);
            self.blocks[j].preds.push(i);
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ret = if self.return_type == IrType::Void { "void" } else { "i32" };
        write!(f, "define dso_local {} @{}(", ret, self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "i32 noundef %{}", param.name)?;
        }
        f.write_str(") #0 {\n")?;

        for (bi, block) in self.blocks.iter().enumerate() {
            if bi > 0 {
                write!(f, "\n{}:\n", block.name)?;
            }
            for inst in &block.insts {
                writeln!(f, "  {}", inst)?;
            }
        }
        f.write_str("}\n")
    }
}

/// A compilation unit.
#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub source_file: String,
    pub target_triple: String,
    pub functions: Vec<Function>,
}

impl Default for Module {
    fn default() -> Module {
        Module {
            name: "toyc".to_string(),
            source_file: "toyc".to_string(),
            target_triple: "riscv32-unknown-elf".to_string(),
            functions: Vec::new(),
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        writeln!(f, "source_filename = \"{}\"", self.source_file)?;
        writeln!(f, "target triple = \"{}\"", self.target_triple)?;
        f.write_str("\n\n")?;
        for func in &self.functions {
            writeln!(f, "{}", func)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vreg(id: u32) -> Operand {
        Operand::VReg(id)
    }

    #[test]
    fn def_and_use_queries_follow_opcode_positions() {
        let store = Instruction::make_store(IrType::I32, vreg(1), vreg(2), 4);
        assert_eq!(store.def_reg(), None);
        assert_eq!(store.use_regs(), vec![1, 2]);

        let load = Instruction::make_load(vreg(3), IrType::I32, vreg(2), 4);
        assert_eq!(load.def_reg(), Some(3));
        assert_eq!(load.use_regs(), vec![2]);

        let br = Instruction::make_br(Operand::Label("end".into()));
        assert_eq!(br.use_regs(), Vec::<u32>::new());
        assert!(br.is_terminator());

        let cond = Instruction::make_cond_br(
            vreg(4),
            Operand::Label("a".into()),
            Operand::Label("b".into()),
        );
        assert_eq!(cond.use_regs(), vec![4]);
        assert_eq!(cond.branch_cond_reg(), Some(4));
        assert_eq!(cond.branch_targets(), vec!["a", "b"]);

        let call = Instruction::make_call(vreg(9), IrType::I32, "f", [vreg(1), Operand::Imm(7)]);
        assert_eq!(call.def_reg(), Some(9));
        assert_eq!(call.use_regs(), vec![1]);
        assert!(call.is_call());
    }

    #[test]
    fn positions_use_the_two_point_model() {
        let mut inst = Instruction::make_ret_void();
        inst.index = 5;
        assert_eq!(inst.pos_def(), 10);
        assert_eq!(inst.pos_use(), 11);
    }

    #[test]
    fn instruction_text_matches_llvm_subset() {
        let add = Instruction::make_bin_op(Opcode::Add, vreg(3), IrType::I32, vreg(1), vreg(2));
        assert_eq!(add.to_string(), "%3 = add nsw i32 %1, %2");

        let icmp = Instruction::make_icmp(CmpPred::Sgt, vreg(5), IrType::I32, vreg(4), Operand::Imm(3));
        assert_eq!(icmp.to_string(), "%5 = icmp sgt i32 %4, 3");

        let store = Instruction::make_store(IrType::I1, Operand::BoolLit(true), vreg(6), 1);
        assert_eq!(store.to_string(), "store i1 true, ptr %6, align 1");

        let call = Instruction::make_call(vreg(7), IrType::I32, "fact", [Operand::Imm(5)]);
        assert_eq!(call.to_string(), "%7 = call i32 @fact(i32 noundef 5)");

        let cond = Instruction::make_cond_br(
            vreg(8),
            Operand::Label("then_0".into()),
            Operand::Label("else_0".into()),
        );
        assert_eq!(cond.to_string(), "br i1 %8, label %then_0, label %else_0");
    }

    #[test]
    fn cfg_edges_from_terminators_and_fall_through() {
        let mut func = Function::new("f", IrType::I32);
        let entry = func.add_block("entry");
        let a = func.add_block("a");
        let b = func.add_block("b");
        let end = func.add_block("end");

        func.blocks[entry].insts.push(Instruction::make_cond_br(
            vreg(1),
            Operand::Label("a".into()),
            Operand::Label("b".into()),
        ));
        func.blocks[a].insts.push(Instruction::make_br(Operand::Label("end".into())));
        // block b has a non-terminator only: falls through to end
        func.blocks[b].insts.push(Instruction::make_bin_op(
            Opcode::Add,
            vreg(2),
            IrType::I32,
            vreg(1),
            Operand::Imm(1),
        ));
        func.blocks[end]
            .insts
            .push(Instruction::make_ret(IrType::I32, Operand::Imm(0)));

        func.build_cfg();

        assert_eq!(func.blocks[entry].succs, vec![a, b]);
        assert_eq!(func.blocks[a].succs, vec![end]);
        assert_eq!(func.blocks[b].succs, vec![end]);
        assert!(func.blocks[end].succs.is_empty());
        assert_eq!(func.blocks[end].preds, vec![a, b]);
        assert_eq!(func.blocks[a].preds, vec![entry]);
    }

    #[test]
    #[should_panic(expected = "unknown label")]
    fn cfg_panics_on_unknown_branch_target() {
        let mut func = Function::new("f", IrType::Void);
        func.add_block("entry");
        func.blocks[0]
            .insts
            .push(Instruction::make_br(Operand::Label("nowhere".into())));
        func.build_cfg();
    }
}
