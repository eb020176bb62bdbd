//! RV32I register model: ABI names, saver classes, and the allocation
//! priority table used by the linear scan.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Reg {
    Zero,
    Ra,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
    T3,
    T4,
    T5,
    T6,
}

/// The two registers reserved for the emitter to materialize immediates
/// and reload spilled operands. They never enter the allocatable set.
pub const SPILL_TEMP_REGS: [Reg; 2] = [Reg::T0, Reg::T1];

impl Reg {
    /// Get register from its hardware index (x0..x31).
    pub fn from_index(index: u32) -> Reg {
        match index {
            0 => Reg::Zero,
            1 => Reg::Ra,
            2 => Reg::Sp,
            3 => Reg::Gp,
            4 => Reg::Tp,
            5 => Reg::T0,
            6 => Reg::T1,
            7 => Reg::T2,
            8 => Reg::S0,
            9 => Reg::S1,
            10 => Reg::A0,
            11 => Reg::A1,
            12 => Reg::A2,
            13 => Reg::A3,
            14 => Reg::A4,
            15 => Reg::A5,
            16 => Reg::A6,
            17 => Reg::A7,
            18 => Reg::S2,
            19 => Reg::S3,
            20 => Reg::S4,
            21 => Reg::S5,
            22 => Reg::S6,
            23 => Reg::S7,
            24 => Reg::S8,
            25 => Reg::S9,
            26 => Reg::S10,
            27 => Reg::S11,
            28 => Reg::T3,
            29 => Reg::T4,
            30 => Reg::T5,
            31 => Reg::T6,
            _ => panic!("invalid register index: {}", index),
        }
    }

    /// Hardware index (x0..x31).
    pub fn index(self) -> u32 {
        self as u32
    }

    /// The i-th argument register a0..a7.
    pub fn arg(i: usize) -> Reg {
        assert!(i < 8, "argument register index out of range: {}", i);
        Reg::from_index(10 + i as u32)
    }

    pub fn is_callee_saved(self) -> bool {
        matches!(
            self,
            Reg::S1
                | Reg::S2
                | Reg::S3
                | Reg::S4
                | Reg::S5
                | Reg::S6
                | Reg::S7
                | Reg::S8
                | Reg::S9
                | Reg::S10
                | Reg::S11
        )
    }

    pub fn is_caller_saved(self) -> bool {
        matches!(
            self,
            Reg::T0
                | Reg::T1
                | Reg::T2
                | Reg::A0
                | Reg::A1
                | Reg::A2
                | Reg::A3
                | Reg::A4
                | Reg::A5
                | Reg::A6
                | Reg::A7
                | Reg::T3
                | Reg::T4
                | Reg::T5
                | Reg::T6
        )
    }

    /// Registers the allocator must never hand out: zero, ra, sp, gp, tp,
    /// the frame pointer, and the two spill temporaries.
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Reg::Zero | Reg::Ra | Reg::Sp | Reg::Gp | Reg::Tp | Reg::T0 | Reg::T1 | Reg::S0
        )
    }

    pub fn is_spill_temp(self) -> bool {
        SPILL_TEMP_REGS.contains(&self)
    }

    /// Allocation priority; lower means preferred. Argument registers
    /// first, then the remaining temporaries, then the saved registers.
    pub fn priority(self) -> u32 {
        match self {
            Reg::A0 => 0,
            Reg::A1 => 1,
            Reg::A2 => 2,
            Reg::A3 => 3,
            Reg::A4 => 4,
            Reg::A5 => 5,
            Reg::A6 => 6,
            Reg::A7 => 7,
            Reg::T2 => 20,
            Reg::T3 => 21,
            Reg::T4 => 22,
            Reg::T5 => 23,
            Reg::T6 => 24,
            Reg::S2 => 40,
            Reg::S3 => 41,
            Reg::S4 => 42,
            Reg::S5 => 43,
            Reg::S6 => 44,
            Reg::S7 => 45,
            Reg::S8 => 46,
            Reg::S9 => 47,
            Reg::S10 => 48,
            Reg::S11 => 49,
            Reg::S1 => 50,
            _ => 999,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Reg::Zero => "zero",
            Reg::Ra => "ra",
            Reg::Sp => "sp",
            Reg::Gp => "gp",
            Reg::Tp => "tp",
            Reg::T0 => "t0",
            Reg::T1 => "t1",
            Reg::T2 => "t2",
            Reg::S0 => "s0",
            Reg::S1 => "s1",
            Reg::A0 => "a0",
            Reg::A1 => "a1",
            Reg::A2 => "a2",
            Reg::A3 => "a3",
            Reg::A4 => "a4",
            Reg::A5 => "a5",
            Reg::A6 => "a6",
            Reg::A7 => "a7",
            Reg::S2 => "s2",
            Reg::S3 => "s3",
            Reg::S4 => "s4",
            Reg::S5 => "s5",
            Reg::S6 => "s6",
            Reg::S7 => "s7",
            Reg::S8 => "s8",
            Reg::S9 => "s9",
            Reg::S10 => "s10",
            Reg::S11 => "s11",
            Reg::T3 => "t3",
            Reg::T4 => "t4",
            Reg::T5 => "t5",
            Reg::T6 => "t6",
        };
        f.write_str(name)
    }
}

/// Target register file description: the 32 registers and the allocatable
/// subset in (priority, index) order.
#[derive(Debug)]
pub struct RegInfo {
    allocatable: Vec<Reg>,
}

impl Default for RegInfo {
    fn default() -> RegInfo {
        RegInfo::new()
    }
}

impl RegInfo {
    pub fn new() -> RegInfo {
        let mut allocatable: Vec<Reg> =
            (0..32).map(Reg::from_index).filter(|r| !r.is_reserved()).collect();
        allocatable.sort_by_key(|r| (r.priority(), r.index()));
        RegInfo { allocatable }
    }

    /// Allocatable registers, best priority first.
    pub fn allocatable(&self) -> &[Reg] {
        &self.allocatable
    }
}
