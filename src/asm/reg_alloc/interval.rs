//! Live ranges and per-vreg live intervals.

use crate::asm::riscv::Reg;
use crate::ir::Function;
use rustc_hash::FxHashMap;

/// A closed range [start, end] of instruction positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: i32,
    pub end: i32,
}

impl LiveRange {
    pub fn new(start: i32, end: i32) -> LiveRange {
        LiveRange { start, end }
    }

    pub fn overlaps(&self, other: &LiveRange) -> bool {
        !(self.end < other.start || other.end < self.start)
    }

    /// Ranges that touch ([0,3] and [4,6]) merge into one.
    pub fn adjacent(&self, other: &LiveRange) -> bool {
        self.end + 1 == other.start || other.end + 1 == self.start
    }
}

/// The positions at which a vreg is live: a sorted vector of merged,
/// non-overlapping ranges, plus the allocation outcome.
#[derive(Debug, Clone)]
pub struct LiveInterval {
    pub vreg: u32,
    pub ranges: Vec<LiveRange>,
    pub phys_reg: Option<Reg>,
    pub spill_slot: Option<i32>,
}

impl LiveInterval {
    pub fn new(vreg: u32) -> LiveInterval {
        LiveInterval { vreg, ranges: Vec::new(), phys_reg: None, spill_slot: None }
    }

    /// Insert [start, end], merging with any overlapping or adjacent
    /// ranges so the vector stays sorted and non-overlapping.
    pub fn add_range(&mut self, start: i32, end: i32) {
        if start > end {
            return;
        }
        self.ranges.push(LiveRange::new(start, end));
        self.ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<LiveRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if last.overlaps(&r) || last.adjacent(&r) => {
                    last.end = last.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, pos: i32) -> bool {
        self.ranges.iter().any(|r| pos >= r.start && pos <= r.end)
    }

    /// Earliest live position; empty intervals sort last.
    pub fn start(&self) -> i32 {
        self.ranges.first().map_or(i32::MAX, |r| r.start)
    }

    /// Latest live position.
    pub fn end(&self) -> i32 {
        self.ranges.last().map_or(-1, |r| r.end)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Builds the live interval of every vreg from the completed liveness
/// analysis and instruction numbering.
pub struct LiveIntervalBuilder;

impl LiveIntervalBuilder {
    /// Intervals that stay empty (the vreg never occurs) are discarded.
    pub fn build(func: &Function) -> FxHashMap<u32, LiveInterval> {
        let mut intervals = FxHashMap::default();
        for vreg in 0..=func.max_vreg_id {
            let vreg = vreg as u32;
            let mut interval = LiveInterval::new(vreg);
            Self::build_interval_for_vreg(func, vreg, &mut interval);
            if !interval.is_empty() {
                intervals.insert(vreg, interval);
            }
        }
        intervals
    }

    /// Walk the RPO blocks. A vreg live into a block starts its range at
    /// the block's first position; live out extends it to the last. Inside
    /// the block, a def opens a range at its write position and a use
    /// extends the range to its read position.
    fn build_interval_for_vreg(func: &Function, vreg: u32, interval: &mut LiveInterval) {
        for &id in &func.rpo_order {
            let block = &func.blocks[id];
            let live_at_start = block.live_in.contains(&vreg);
            let live_at_end = block.live_out.contains(&vreg);

            if !live_at_start && !live_at_end {
                let mentioned = block.insts.iter().any(|inst| {
                    inst.def_reg() == Some(vreg) || inst.use_regs().contains(&vreg)
                });
                if !mentioned {
                    continue;
                }
            }

            let block_start = block.first_pos();
            let block_end = block.last_pos();
            if block_start == -1 || block_end == -1 {
                continue;
            }

            let mut range_start = if live_at_start { block_start } else { -1 };
            let mut range_end = if live_at_end { block_end } else { -1 };

            for inst in &block.insts {
                if inst.def_reg() == Some(vreg) {
                    if range_start == -1 {
                        range_start = inst.pos_def();
                    }
                    range_end = if live_at_end { block_end } else { inst.pos_def() };
                }
                if inst.use_regs().contains(&vreg) {
                    if range_start == -1 {
                        range_start = if live_at_start { block_start } else { inst.pos_use() };
                    }
                    range_end = range_end.max(inst.pos_use());
                }
            }

            if range_start != -1 && range_end != -1 {
                interval.add_range(range_start, range_end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_merge_when_overlapping() {
        let mut iv = LiveInterval::new(0);
        iv.add_range(0, 5);
        iv.add_range(3, 9);
        assert_eq!(iv.ranges, vec![LiveRange::new(0, 9)]);
    }

    #[test]
    fn ranges_merge_when_adjacent() {
        let mut iv = LiveInterval::new(0);
        iv.add_range(0, 3);
        iv.add_range(4, 6);
        assert_eq!(iv.ranges, vec![LiveRange::new(0, 6)]);
    }

    #[test]
    fn disjoint_ranges_stay_sorted() {
        let mut iv = LiveInterval::new(0);
        iv.add_range(10, 12);
        iv.add_range(0, 2);
        iv.add_range(5, 7);
        assert_eq!(
            iv.ranges,
            vec![LiveRange::new(0, 2), LiveRange::new(5, 7), LiveRange::new(10, 12)]
        );
        assert_eq!(iv.start(), 0);
        assert_eq!(iv.end(), 12);
    }

    #[test]
    fn middle_insert_bridges_neighbors() {
        let mut iv = LiveInterval::new(0);
        iv.add_range(0, 2);
        iv.add_range(8, 10);
        iv.add_range(3, 7);
        assert_eq!(iv.ranges, vec![LiveRange::new(0, 10)]);
    }

    #[test]
    fn contains_checks_every_range() {
        let mut iv = LiveInterval::new(0);
        iv.add_range(0, 2);
        iv.add_range(6, 8);
        assert!(iv.contains(1));
        assert!(!iv.contains(4));
        assert!(iv.contains(6));
    }

    #[test]
    fn inverted_range_is_ignored() {
        let mut iv = LiveInterval::new(0);
        iv.add_range(5, 3);
        assert!(iv.is_empty());
        assert_eq!(iv.start(), i32::MAX);
        assert_eq!(iv.end(), -1);
    }
}
