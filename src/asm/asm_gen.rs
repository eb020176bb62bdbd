//! Per-function RISC-V code generation.
//!
//! Instructions are emitted into a line buffer with a placeholder for the
//! prologue and one per epilogue; once the function body is done and the
//! frame size is known, the placeholders are patched in place. Operands
//! resolve through the allocator's output: immediates and spilled vregs
//! pass through the alternating spill temporaries t0/t1.

use crate::asm::reg_alloc::LinearScanAllocator;
use crate::asm::riscv::Reg;
use crate::ir::{CmpPred, Function, Instruction, IrType, Opcode, Operand};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// A compare whose result may be consumed by the next conditional branch.
/// Cached by def vreg; consumed (and removed) by branch fusion.
struct CmpInfo {
    pred: CmpPred,
    lhs_reg: String,
    rhs_reg: String,
}

pub struct AsmGen<'a> {
    func: &'a Function,
    allocator: &'a mut LinearScanAllocator,
    lines: Vec<String>,
    alloca_offsets: FxHashMap<u32, i32>,
    cmp_map: FxHashMap<u32, CmpInfo>,
    stack_offset: i32,
    total_stack_size: i32,
    frame_overhead: i32,
    call_save_size: i32,
    call_arg_area_size: i32,
    prologue_marker: usize,
    epilogue_markers: Vec<usize>,
    last_def_reg: String,
}

impl<'a> AsmGen<'a> {
    pub fn new(func: &'a Function, allocator: &'a mut LinearScanAllocator) -> AsmGen<'a> {
        AsmGen {
            func,
            allocator,
            lines: Vec::new(),
            alloca_offsets: FxHashMap::default(),
            cmp_map: FxHashMap::default(),
            stack_offset: 0,
            total_stack_size: 0,
            frame_overhead: 0,
            call_save_size: 0,
            call_arg_area_size: 0,
            prologue_marker: 0,
            epilogue_markers: Vec::new(),
            last_def_reg: String::new(),
        }
    }

    pub fn generate(mut self) -> Vec<String> {
        self.precompute_frame_parts();

        let func = self.func;
        self.push(format!("    .globl {}", func.name));
        self.push(format!("{}:", func.name));
        self.prologue_marker = self.lines.len();
        self.push(String::new());

        for (bi, block) in func.blocks.iter().enumerate() {
            // the entry block's label is implicit after the prologue
            if bi > 0 {
                self.push(format!("{}:", self.block_label(&block.name)));
            }
            for inst in &block.insts {
                self.generate_inst(inst);
            }
        }

        self.calculate_stack_frame();
        self.patch_frame_placeholders();

        self.push(format!("    .size {}, .-{}", func.name, func.name));
        self.push(String::new());
        self.lines
    }

    /// Sizes that feed both the prologue and spill-offset math:
    /// ra/s0 plus callee-saved save space, the caller-save area used
    /// around calls, and the outgoing stack-argument area.
    fn precompute_frame_parts(&mut self) {
        let alloc = self.allocator.result();
        self.frame_overhead = 8 + alloc.callee_saved_regs.len() as i32 * 4;

        let caller_saved: BTreeSet<Reg> = alloc
            .vreg_to_phys
            .values()
            .copied()
            .filter(|r| r.is_caller_saved() && !r.is_spill_temp())
            .collect();
        self.call_save_size = caller_saved.len() as i32 * 4;

        let mut max_stack_args = 0;
        for block in &self.func.blocks {
            for inst in &block.insts {
                if inst.opcode == Opcode::Call {
                    max_stack_args = max_stack_args.max(inst.ops.len() as i32 - 8);
                }
            }
        }
        self.call_arg_area_size = max_stack_args.max(0) * 4;
    }

    fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    fn push_inst(&mut self, line: String) {
        self.lines.push(format!("    {}", line));
    }

    fn block_label(&self, block_name: &str) -> String {
        format!(".{}_{}", self.func.name, block_name)
    }

    // ---------------- instruction dispatch ----------------

    fn generate_inst(&mut self, inst: &Instruction) {
        match inst.opcode {
            Opcode::Alloca => self.gen_alloca(inst),
            Opcode::Store => self.gen_store(inst),
            Opcode::Load => self.gen_load(inst),
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::SDiv | Opcode::SRem => {
                self.gen_bin_op(inst)
            }
            Opcode::ICmp => self.gen_icmp(inst),
            Opcode::CondBr => self.gen_cond_br(inst),
            Opcode::Br => self.gen_br(inst),
            Opcode::Ret | Opcode::RetVoid => self.gen_ret(inst),
            Opcode::Call => self.gen_call(inst),
        }
    }

    /// Reserve 4 bytes (1 for i1, padded to 4) and remember the slot; no
    /// code is emitted.
    fn gen_alloca(&mut self, inst: &Instruction) {
        let vreg = inst.def_reg().expect("alloca without a def");
        let size = if inst.ty == IrType::I1 { 1 } else { 4 };
        self.stack_offset += size;
        if self.stack_offset % 4 != 0 {
            self.stack_offset += 4 - self.stack_offset % 4;
        }
        self.alloca_offsets.insert(vreg, self.stack_offset);
    }

    fn gen_store(&mut self, inst: &Instruction) {
        let val = self.resolve_use(&inst.ops[0]);
        let ptr = inst.ops[1].vreg().expect("store through a non-vreg pointer");
        let offset = self.alloca_offset(ptr);
        let op = if inst.ty == IrType::I1 { "sb" } else { "sw" };
        self.push_inst(format!("{} {}, -{}(s0)", op, val, offset));
    }

    fn gen_load(&mut self, inst: &Instruction) {
        let def = self.resolve_def(&inst.def);
        let ptr = inst.ops[0].vreg().expect("load through a non-vreg pointer");
        let offset = self.alloca_offset(ptr);
        let op = if inst.ty == IrType::I1 { "lb" } else { "lw" };
        self.push_inst(format!("{} {}, -{}(s0)", op, def, offset));
        self.spill_def_if_needed(inst);
    }

    fn gen_bin_op(&mut self, inst: &Instruction) {
        let def = self.resolve_def(&inst.def);

        // add/sub with an immediate in the 12-bit signed range folds into addi
        let addi_range = |v: i64| (-2048..=2047).contains(&v);
        if inst.opcode == Opcode::Add {
            if let Operand::Imm(v) = inst.ops[1] {
                if addi_range(v as i64) {
                    let lhs = self.resolve_use(&inst.ops[0]);
                    self.push_inst(format!("addi {}, {}, {}", def, lhs, v));
                    self.spill_def_if_needed(inst);
                    return;
                }
            }
            if let Operand::Imm(v) = inst.ops[0] {
                if addi_range(v as i64) {
                    let rhs = self.resolve_use(&inst.ops[1]);
                    self.push_inst(format!("addi {}, {}, {}", def, rhs, v));
                    self.spill_def_if_needed(inst);
                    return;
                }
            }
        }
        if inst.opcode == Opcode::Sub {
            if let Operand::Imm(v) = inst.ops[1] {
                if addi_range(-(v as i64)) {
                    let lhs = self.resolve_use(&inst.ops[0]);
                    self.push_inst(format!("addi {}, {}, {}", def, lhs, -v));
                    self.spill_def_if_needed(inst);
                    return;
                }
            }
        }

        let lhs = self.resolve_use(&inst.ops[0]);
        let rhs = self.resolve_use(&inst.ops[1]);
        let op = match inst.opcode {
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Mul => "mul",
            Opcode::SDiv => "div",
            Opcode::SRem => "rem",
            _ => unreachable!(),
        };
        self.push_inst(format!("{} {}, {}, {}", op, def, lhs, rhs));
        self.spill_def_if_needed(inst);
    }

    /// Always materializes a 0/1 value in the def register, and caches the
    /// operand registers so a following conditional branch can fuse.
    fn gen_icmp(&mut self, inst: &Instruction) {
        let lhs = self.resolve_use(&inst.ops[0]);
        let rhs = self.resolve_use(&inst.ops[1]);
        let def = self.resolve_def(&inst.def);

        // fusion is only sound while the operand registers survive up to
        // the consuming branch; a spilled def shares the spill temps with
        // its operands, and the materialization below would clobber them
        if def != lhs && def != rhs {
            self.cmp_map.insert(
                inst.def_reg().expect("icmp without a def"),
                CmpInfo { pred: inst.cmp_pred, lhs_reg: lhs.clone(), rhs_reg: rhs.clone() },
            );
        }

        match inst.cmp_pred {
            CmpPred::Eq => {
                self.push_inst(format!("sub {}, {}, {}", def, lhs, rhs));
                self.push_inst(format!("seqz {}, {}", def, def));
            }
            CmpPred::Ne => {
                self.push_inst(format!("sub {}, {}, {}", def, lhs, rhs));
                self.push_inst(format!("snez {}, {}", def, def));
            }
            CmpPred::Slt => {
                self.push_inst(format!("slt {}, {}, {}", def, lhs, rhs));
            }
            CmpPred::Sgt => {
                self.push_inst(format!("slt {}, {}, {}", def, rhs, lhs));
            }
            CmpPred::Sle => {
                self.push_inst(format!("slt {}, {}, {}", def, rhs, lhs));
                self.push_inst(format!("xori {}, {}, 1", def, def));
            }
            CmpPred::Sge => {
                self.push_inst(format!("slt {}, {}, {}", def, lhs, rhs));
                self.push_inst(format!("xori {}, {}, 1", def, def));
            }
        }
        self.spill_def_if_needed(inst);
    }

    /// Fuse with a cached compare into a single conditional branch when
    /// possible, otherwise fall back to bnez + j.
    fn gen_cond_br(&mut self, inst: &Instruction) {
        let true_label = self.block_label(inst.ops[1].label().expect("condbr without true label"));
        let false_label = self.block_label(inst.ops[2].label().expect("condbr without false label"));

        let cached = inst.ops[0].vreg().and_then(|v| self.cmp_map.remove(&v));
        match cached {
            Some(cmp) => {
                let br_op = match cmp.pred {
                    CmpPred::Eq => "beq",
                    CmpPred::Ne => "bne",
                    CmpPred::Slt => "blt",
                    CmpPred::Sgt => "bgt",
                    CmpPred::Sle => "ble",
                    CmpPred::Sge => "bge",
                };
                self.push_inst(format!("{} {}, {}, {}", br_op, cmp.lhs_reg, cmp.rhs_reg, true_label));
                self.push_inst(format!("j {}", false_label));
            }
            None => {
                let cond = self.resolve_use(&inst.ops[0]);
                self.push_inst(format!("bnez {}, {}", cond, true_label));
                self.push_inst(format!("j {}", false_label));
            }
        }
    }

    fn gen_br(&mut self, inst: &Instruction) {
        let target = self.block_label(inst.ops[0].label().expect("br without label"));
        self.push_inst(format!("j {}", target));
    }

    fn gen_ret(&mut self, inst: &Instruction) {
        if inst.opcode == Opcode::Ret {
            match &inst.ops[0] {
                Operand::Imm(v) => self.push_inst(format!("li a0, {}", v)),
                Operand::BoolLit(b) => self.push_inst(format!("li a0, {}", *b as i32)),
                op => {
                    let val = self.resolve_use(op);
                    if val != "a0" {
                        self.push_inst(format!("mv a0, {}", val));
                    }
                }
            }
        }
        self.epilogue_markers.push(self.lines.len());
        self.push(String::new());
        self.push_inst("ret".to_string());
    }

    /// Call lowering: save live caller-saved registers above the outgoing
    /// argument area, place stack then register arguments (register
    /// arguments load straight from saved locations, so a0..a7 can never
    /// clobber each other), call, capture a0, restore, spill the def.
    fn gen_call(&mut self, inst: &Instruction) {
        let def_phys = inst.def.vreg().and_then(|v| self.phys_of(v));

        let saved: Vec<Reg> = {
            let alloc = self.allocator.result();
            let set: BTreeSet<Reg> = alloc
                .vreg_to_phys
                .values()
                .copied()
                .filter(|&r| r.is_caller_saved() && !r.is_spill_temp() && Some(r) != def_phys)
                .collect();
            set.into_iter().collect()
        };

        let mut save_offsets: FxHashMap<Reg, i32> = FxHashMap::default();
        let mut offset = self.call_arg_area_size;
        for &reg in &saved {
            self.push_inst(format!("sw {}, {}(sp)", reg, offset));
            save_offsets.insert(reg, offset);
            offset += 4;
        }

        // arguments 8.. go to the outgoing area at sp+0, sp+4, ...
        for (i, op) in inst.ops.iter().enumerate().skip(8) {
            let arg_offset = (i as i32 - 8) * 4;
            match op {
                Operand::Imm(v) => {
                    let tmp = self.spill_temp();
                    self.push_inst(format!("li {}, {}", tmp, v));
                    self.push_inst(format!("sw {}, {}(sp)", tmp, arg_offset));
                }
                Operand::BoolLit(b) => {
                    let tmp = self.spill_temp();
                    self.push_inst(format!("li {}, {}", tmp, *b as i32));
                    self.push_inst(format!("sw {}, {}(sp)", tmp, arg_offset));
                }
                Operand::VReg(v) => {
                    if let Some(phys) = self.phys_of(*v) {
                        if let Some(&save) = save_offsets.get(&phys) {
                            // the register was clobbered by the save area setup
                            let tmp = self.spill_temp();
                            self.push_inst(format!("lw {}, {}(sp)", tmp, save));
                            self.push_inst(format!("sw {}, {}(sp)", tmp, arg_offset));
                        } else {
                            self.push_inst(format!("sw {}, {}(sp)", phys, arg_offset));
                        }
                    } else if let Some(slot) = self.stack_of(*v) {
                        let tmp = self.spill_temp();
                        if slot > 0 {
                            self.push_inst(format!("lw {}, {}(s0)", tmp, slot - 4));
                        } else {
                            let sp_off = self.spill_slot_to_sp_offset(slot);
                            self.push_inst(format!("lw {}, {}(sp)", tmp, sp_off));
                        }
                        self.push_inst(format!("sw {}, {}(sp)", tmp, arg_offset));
                    } else {
                        panic!("call argument %{} has no location", v);
                    }
                }
                op => panic!("invalid call argument {:?}", op),
            }
        }

        // arguments 0..8 go to a0..a7, each loaded from its saved location
        for (i, op) in inst.ops.iter().enumerate().take(8) {
            let target = Reg::arg(i);
            match op {
                Operand::Imm(v) => self.push_inst(format!("li {}, {}", target, v)),
                Operand::BoolLit(b) => self.push_inst(format!("li {}, {}", target, *b as i32)),
                Operand::VReg(v) => {
                    if let Some(phys) = self.phys_of(*v) {
                        if let Some(&save) = save_offsets.get(&phys) {
                            self.push_inst(format!("lw {}, {}(sp)", target, save));
                        } else if phys != target {
                            // callee-saved sources are not clobbered
                            self.push_inst(format!("mv {}, {}", target, phys));
                        }
                    } else if let Some(slot) = self.stack_of(*v) {
                        if slot > 0 {
                            self.push_inst(format!("lw {}, {}(s0)", target, slot - 4));
                        } else {
                            let sp_off = self.spill_slot_to_sp_offset(slot);
                            self.push_inst(format!("lw {}, {}(sp)", target, sp_off));
                        }
                    } else {
                        panic!("call argument %{} has no location", v);
                    }
                }
                op => panic!("invalid call argument {:?}", op),
            }
        }

        self.push_inst(format!("call {}", inst.callee));

        // capture the return value before the restores clobber a0
        let def = self.resolve_def(&inst.def);
        if def != "a0" {
            self.push_inst(format!("mv {}, a0", def));
        }

        let mut offset = self.call_arg_area_size;
        for &reg in &saved {
            self.push_inst(format!("lw {}, {}(sp)", reg, offset));
            offset += 4;
        }

        self.spill_def_if_needed(inst);
    }

    // ---------------- operand resolution ----------------

    fn spill_temp(&mut self) -> Reg {
        self.allocator.allocate_spill_temp_reg()
    }

    fn phys_of(&self, vreg: u32) -> Option<Reg> {
        self.allocator.result().vreg_to_phys.get(&vreg).copied()
    }

    fn stack_of(&self, vreg: u32) -> Option<i32> {
        self.allocator.result().vreg_to_stack.get(&vreg).copied()
    }

    /// Resolve a use operand to a register name, loading immediates,
    /// booleans, incoming stack parameters, and spilled vregs into a spill
    /// temporary first.
    fn resolve_use(&mut self, op: &Operand) -> String {
        match op {
            Operand::Imm(v) => {
                let tmp = self.spill_temp();
                self.push_inst(format!("li {}, {}", tmp, v));
                tmp.to_string()
            }
            Operand::BoolLit(b) => {
                let tmp = self.spill_temp();
                self.push_inst(format!("li {}, {}", tmp, *b as i32));
                tmp.to_string()
            }
            Operand::VReg(v) => {
                if let Some(reg) = self.phys_of(*v) {
                    return reg.to_string();
                }
                if let Some(slot) = self.stack_of(*v) {
                    let tmp = self.spill_temp();
                    if slot > 0 {
                        // incoming stack parameter, in the caller's frame
                        self.push_inst(format!("lw {}, {}(s0)", tmp, slot - 4));
                    } else {
                        let sp_off = self.spill_slot_to_sp_offset(slot);
                        self.push_inst(format!("lw {}, {}(sp)", tmp, sp_off));
                    }
                    return tmp.to_string();
                }
                panic!("use of vreg %{} with no location", v)
            }
            op => panic!("cannot resolve operand {:?}", op),
        }
    }

    /// Resolve the def operand to its target register; a spilled def gets
    /// a spill temporary, and the caller writes it back through
    /// `spill_def_if_needed`.
    fn resolve_def(&mut self, op: &Operand) -> String {
        let Some(vreg) = op.vreg() else {
            self.last_def_reg = "a0".to_string();
            return self.last_def_reg.clone();
        };
        self.last_def_reg = match self.phys_of(vreg) {
            Some(reg) => reg.to_string(),
            None => self.spill_temp().to_string(),
        };
        self.last_def_reg.clone()
    }

    fn spill_def_if_needed(&mut self, inst: &Instruction) {
        let Some(vreg) = inst.def_reg() else { return };
        let Some(slot) = self.stack_of(vreg) else { return };
        if slot < 0 && !self.alloca_offsets.contains_key(&vreg) {
            let sp_off = self.spill_slot_to_sp_offset(slot);
            let line = format!("sw {}, {}(sp)", self.last_def_reg, sp_off);
            self.push_inst(line);
        }
    }

    /// s0-relative offset of an alloca slot, past the ra/s0/callee-saved
    /// region at the top of the frame.
    fn alloca_offset(&self, vreg: u32) -> i32 {
        match self.alloca_offsets.get(&vreg) {
            Some(offset) => offset + self.frame_overhead,
            None => panic!("no stack slot recorded for %{}", vreg),
        }
    }

    /// Map an allocator spill slot (-4, -8, ...) to its sp offset. Frame
    /// bottom layout: [0, argArea) outgoing args, then the caller-save
    /// area, then the spill slots.
    fn spill_slot_to_sp_offset(&self, slot: i32) -> i32 {
        self.call_arg_area_size + self.call_save_size + (-slot - 4)
    }

    // ---------------- frame ----------------

    /// total = alloca + (ra/s0 + callee-saved) + spills + caller-save
    /// area + outgoing args, rounded up to 16 bytes.
    fn calculate_stack_frame(&mut self) {
        let alloc = self.allocator.result();
        let spill_size =
            alloc.vreg_to_stack.values().filter(|&&s| s < 0).map(|&s| -s).max().unwrap_or(0);
        let frame_overhead = 8 + alloc.callee_saved_regs.len() as i32 * 4;
        let total = self.stack_offset
            + frame_overhead
            + spill_size
            + self.call_save_size
            + self.call_arg_area_size;
        self.total_stack_size = (total + 15) & !15;
    }

    fn patch_frame_placeholders(&mut self) {
        let callee_saved: Vec<Reg> =
            self.allocator.result().callee_saved_regs.iter().copied().collect();
        let total = self.total_stack_size;

        let mut prologue = vec![
            format!("    addi sp, sp, -{}", total),
            format!("    sw ra, {}(sp)", total - 4),
            format!("    sw s0, {}(sp)", total - 8),
            format!("    addi s0, sp, {}", total),
        ];
        let mut offset = total - 12;
        for &reg in &callee_saved {
            prologue.push(format!("    sw {}, {}(sp)", reg, offset));
            offset -= 4;
        }

        let mut epilogue = Vec::new();
        let mut offset = total - 12;
        for &reg in &callee_saved {
            epilogue.push(format!("    lw {}, {}(sp)", reg, offset));
            offset -= 4;
        }
        epilogue.push(format!("    lw ra, {}(sp)", total - 4));
        epilogue.push(format!("    lw s0, {}(sp)", total - 8));
        epilogue.push(format!("    addi sp, sp, {}", total));

        // patch back-to-front so earlier marker indices stay valid
        let mut patches: Vec<(usize, &[String])> =
            self.epilogue_markers.iter().map(|&i| (i, epilogue.as_slice())).collect();
        patches.push((self.prologue_marker, prologue.as_slice()));
        patches.sort_by(|a, b| b.0.cmp(&a.0));
        for (index, replacement) in patches {
            self.lines.splice(index..index + 1, replacement.iter().cloned());
        }
    }
}
