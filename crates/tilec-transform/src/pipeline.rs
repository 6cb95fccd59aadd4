//! The compilation pipeline.
//!
//! Sequences cleanup, staging, the analyses, and synchronization insertion
//! in dependency order: staging must precede layout inference (it decides
//! which groups are shared-resident), offsets must exist before hazard
//! detection (byte-range overlap), and synchronization runs last. The
//! result carries everything an instruction-selection stage needs.

use log::debug;
use thiserror::Error;
use tilec_analysis::{Align, Allocation, Axes, LayoutError, Layouts, Liveness};
use tilec_ir::{Function, IrError, Target};

use crate::membar::{Membar, MembarError};
use crate::{cts, dce, peephole};

/// Errors surfacing from any stage of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ir(#[from] IrError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Membar(#[from] MembarError),
}

/// The annotated result of running the middle-end over one kernel.
#[derive(Debug)]
pub struct CompiledKernel {
    /// Layout of every tile value and scratch buffer.
    pub layouts: Layouts,
    /// Byte offsets of all shared buffers.
    pub allocation: Allocation,
    /// Total shared memory the kernel needs, in bytes.
    pub shared_mem: u32,
}

/// Runs the middle-end over `func` in place.
pub fn compile(
    func: &mut Function,
    num_warps: u32,
    target: &Target,
) -> Result<CompiledKernel, PipelineError> {
    func.validate()?;

    dce::run(func);
    peephole::run(func);
    dce::run(func);
    if target.parallel {
        cts::run(func, target);
    }
    peephole::run(func);
    dce::run(func);

    let axes = Axes::run(func);
    let align = Align::run(func);
    let layouts = Layouts::run(func, &axes, &align, num_warps, target)?;
    let liveness = Liveness::run(func, &layouts);
    let allocation = Allocation::run(&layouts, &liveness);
    Membar::new(&layouts, &allocation, target).run(func)?;

    let shared_mem = allocation.allocated_size();
    debug!(
        "compiled `{}`: {} layout groups, {shared_mem} bytes of shared memory",
        func.name,
        layouts.len()
    );
    Ok(CompiledKernel {
        layouts,
        allocation,
        shared_mem,
    })
}
