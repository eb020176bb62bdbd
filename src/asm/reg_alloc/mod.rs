//! Register allocation: liveness analysis, live intervals, and the
//! linear-scan allocator.

mod interval;
mod liveness;
mod lsra;

use crate::asm::riscv::Reg;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

pub use interval::{LiveInterval, LiveIntervalBuilder, LiveRange};
pub use liveness::LivenessAnalysis;
pub use lsra::LinearScanAllocator;

/// Where a parameter lives on function entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    /// One of a0..a7.
    Reg(Reg),
    /// Positive byte offset from s0 (incoming stack argument).
    Stack(i32),
}

/// Per-function allocation output.
///
/// Stack offsets in `vreg_to_stack` are signed: negative offsets are spill
/// slots addressed relative to sp, positive offsets are incoming stack
/// parameters addressed relative to s0.
#[derive(Debug, Default, Clone)]
pub struct AllocationResult {
    pub vreg_to_phys: FxHashMap<u32, Reg>,
    pub vreg_to_stack: FxHashMap<u32, i32>,
    pub param_vreg_to_location: FxHashMap<u32, ParamLocation>,
    pub used_phys_regs: BTreeSet<Reg>,
    pub callee_saved_regs: BTreeSet<Reg>,
}
