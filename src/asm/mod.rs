//! RISC-V assembly generation from the typed IR.

pub mod asm_gen;
pub mod reg_alloc;
pub mod riscv;

use crate::ir::Module;
use asm_gen::AsmGen;
use reg_alloc::LinearScanAllocator;
use riscv::RegInfo;
use std::io::{Result, Write};

/// Generate RV32 assembly for a whole module.
///
/// Phase A runs the register allocator once per function and caches the
/// results; phase B emits every function in source order. Functions are
/// independent, so the per-function state resets completely between them.
pub fn generate_asm(module: &mut Module, writer: &mut dyn Write) -> Result<()> {
    writeln!(writer, "    .text")?;

    let mut allocators: Vec<LinearScanAllocator> = Vec::with_capacity(module.functions.len());
    for func in &mut module.functions {
        let mut allocator = LinearScanAllocator::new(RegInfo::new());
        allocator.allocate(func);
        allocators.push(allocator);
    }

    for (func, allocator) in module.functions.iter().zip(allocators.iter_mut()) {
        for line in AsmGen::new(func, allocator).generate() {
            writeln!(writer, "{}", line)?;
        }
    }
    Ok(())
}

/// Convenience wrapper used by the driver and the tests.
pub fn generate_asm_string(module: &mut Module) -> String {
    let mut buf = Vec::new();
    generate_asm(module, &mut buf).expect("write to Vec cannot fail");
    String::from_utf8(buf).expect("emitted assembly is ASCII")
}
