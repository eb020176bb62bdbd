//! Liveness analysis over the function CFG.
//!
//! Three steps: per-block use/def sets, reverse postorder construction,
//! and the backward data-flow fixed point
//!
//! ```text
//! liveOut(B) = U liveIn(S) for S in succ(B)
//! liveIn(B)  = useSet(B) U (liveOut(B) \ defSet(B))
//! ```
//!
//! All sets grow monotonically within a finite vreg universe, so the
//! iteration converges.

use crate::ir::Function;
use log::trace;
use rustc_hash::FxHashSet;

pub struct LivenessAnalysis;

impl LivenessAnalysis {
    /// Run the full analysis: CFG construction, use/def sets, RPO, and the
    /// liveIn/liveOut fixed point. Results land in the function's blocks
    /// and `rpo_order`.
    pub fn run(func: &mut Function) {
        func.build_cfg();
        Self::compute_use_def_sets(func);
        func.rpo_order = Self::build_rpo(func);
        Self::solve_fixed_point(func);
    }

    /// useSet holds the vregs read before any write in the block
    /// (use-before-def); defSet holds every vreg written in the block.
    fn compute_use_def_sets(func: &mut Function) {
        for block in &mut func.blocks {
            block.use_set.clear();
            block.def_set.clear();
            block.live_in.clear();
            block.live_out.clear();

            let mut local_def = FxHashSet::default();
            for inst in &block.insts {
                for used in inst.use_regs() {
                    if !local_def.contains(&used) {
                        block.use_set.insert(used);
                    }
                }
                if let Some(def) = inst.def_reg() {
                    block.def_set.insert(def);
                    local_def.insert(def);
                }
            }
        }
    }

    /// Iterative DFS from the entry block with a two-phase marker: a block
    /// is pushed once for discovery and once for post-visit emission; the
    /// collected postorder is reversed.
    pub fn build_rpo(func: &Function) -> Vec<usize> {
        let mut order = Vec::new();
        if func.blocks.is_empty() {
            return order;
        }

        let mut visited = vec![false; func.blocks.len()];
        let mut stack = vec![(0usize, false)];

        while let Some((id, processed)) = stack.pop() {
            if processed {
                order.push(id);
                continue;
            }
            if visited[id] {
                continue;
            }
            visited[id] = true;
            stack.push((id, true));
            for &succ in func.blocks[id].succs.iter().rev() {
                if !visited[succ] {
                    stack.push((succ, false));
                }
            }
        }

        order.reverse();
        order
    }

    fn solve_fixed_point(func: &mut Function) {
        let rpo = func.rpo_order.clone();
        let mut changed = true;
        while changed {
            changed = false;
            for &id in rpo.iter().rev() {
                let new_out: FxHashSet<u32> = func.blocks[id]
                    .succs
                    .iter()
                    .flat_map(|&s| func.blocks[s].live_in.iter().copied())
                    .collect();

                let block = &func.blocks[id];
                let mut new_in: FxHashSet<u32> = block.use_set.clone();
                new_in.extend(new_out.iter().filter(|v| !block.def_set.contains(v)));

                if new_in != block.live_in || new_out != block.live_out {
                    let block = &mut func.blocks[id];
                    block.live_in = new_in;
                    block.live_out = new_out;
                    changed = true;
                }
            }
        }

        for &id in &rpo {
            let block = &func.blocks[id];
            trace!(
                "liveness @{} {}: in={:?} out={:?}",
                func.name,
                block.name,
                block.live_in,
                block.live_out
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Function, Instruction, IrType, Opcode, Operand};

    fn label(name: &str) -> Operand {
        Operand::Label(name.to_string())
    }

    fn vreg(id: u32) -> Operand {
        Operand::VReg(id)
    }

    fn add(def: u32, lhs: Operand, rhs: Operand) -> Instruction {
        Instruction::make_bin_op(Opcode::Add, vreg(def), IrType::I32, lhs, rhs)
    }

    /// entry -> (left | right) -> end, with %1 defined in entry and used in
    /// end, and %2 defined only on the left path.
    fn diamond() -> Function {
        let mut func = Function::new("f", IrType::I32);
        let entry = func.add_block("entry");
        let left = func.add_block("left");
        let right = func.add_block("right");
        let end = func.add_block("end");

        func.blocks[entry].insts.push(add(1, Operand::Imm(1), Operand::Imm(2)));
        func.blocks[entry]
            .insts
            .push(Instruction::make_cond_br(vreg(1), label("left"), label("right")));
        func.blocks[left].insts.push(add(2, vreg(1), Operand::Imm(3)));
        func.blocks[left].insts.push(Instruction::make_br(label("end")));
        func.blocks[right].insts.push(Instruction::make_br(label("end")));
        func.blocks[end].insts.push(add(3, vreg(1), Operand::Imm(0)));
        func.blocks[end].insts.push(Instruction::make_ret(IrType::I32, vreg(3)));
        func.max_vreg_id = 3;
        func
    }

    #[test]
    fn rpo_starts_at_entry_and_respects_successor_order() {
        let mut func = diamond();
        func.build_cfg();
        let rpo = LivenessAnalysis::build_rpo(&func);
        assert_eq!(rpo[0], 0);
        assert_eq!(rpo.len(), 4);
        assert_eq!(*rpo.last().unwrap(), 3);
        // first successor is visited first
        assert_eq!(rpo[1], 1);
    }

    #[test]
    fn use_before_def_rule() {
        let mut func = Function::new("g", IrType::I32);
        let entry = func.add_block("entry");
        // %1 = add 0, 0 ; %2 = add %1, %1  -- %1 is defined before use, so
        // it must not appear in the block's useSet
        func.blocks[entry].insts.push(add(1, Operand::Imm(0), Operand::Imm(0)));
        func.blocks[entry].insts.push(add(2, vreg(1), vreg(1)));
        func.blocks[entry].insts.push(Instruction::make_ret(IrType::I32, vreg(2)));
        LivenessAnalysis::run(&mut func);

        let block = &func.blocks[0];
        assert!(block.use_set.is_empty());
        assert!(block.def_set.contains(&1));
        assert!(block.def_set.contains(&2));
    }

    #[test]
    fn fixed_point_satisfies_dataflow_equations() {
        let mut func = diamond();
        LivenessAnalysis::run(&mut func);

        // %1 flows into both branch blocks and the join
        assert!(func.blocks[1].live_in.contains(&1));
        assert!(func.blocks[2].live_in.contains(&1));
        assert!(func.blocks[3].live_in.contains(&1));
        // %2 is dead after left (never used)
        assert!(!func.blocks[3].live_in.contains(&2));
        // nothing is live out of the exit block
        assert!(func.blocks[3].live_out.is_empty());

        // the equations hold for every block
        for block in &func.blocks {
            let mut expected: Vec<u32> = block
                .use_set
                .iter()
                .chain(block.live_out.iter().filter(|v| !block.def_set.contains(v)))
                .copied()
                .collect();
            expected.sort_unstable();
            expected.dedup();
            let mut actual: Vec<u32> = block.live_in.iter().copied().collect();
            actual.sort_unstable();
            assert_eq!(actual, expected, "liveIn mismatch in {}", block.name);
        }
    }

    #[test]
    fn loop_converges_with_back_edge() {
        // entry -> cond ; cond -> body | end ; body -> cond
        let mut func = Function::new("h", IrType::I32);
        let entry = func.add_block("entry");
        let cond = func.add_block("cond");
        let body = func.add_block("body");
        let end = func.add_block("end");

        func.blocks[entry].insts.push(add(1, Operand::Imm(0), Operand::Imm(0)));
        func.blocks[entry].insts.push(Instruction::make_br(label("cond")));
        func.blocks[cond]
            .insts
            .push(Instruction::make_icmp(
                crate::ir::CmpPred::Slt,
                vreg(2),
                IrType::I32,
                vreg(1),
                Operand::Imm(10),
            ));
        func.blocks[cond]
            .insts
            .push(Instruction::make_cond_br(vreg(2), label("body"), label("end")));
        func.blocks[body].insts.push(add(3, vreg(1), Operand::Imm(1)));
        func.blocks[body].insts.push(Instruction::make_br(label("cond")));
        func.blocks[end].insts.push(Instruction::make_ret(IrType::I32, vreg(1)));
        func.max_vreg_id = 3;

        LivenessAnalysis::run(&mut func);
        // %1 is live around the loop
        assert!(func.blocks[cond].live_in.contains(&1));
        assert!(func.blocks[body].live_out.contains(&1) || func.blocks[body].live_in.contains(&1));
    }
}
