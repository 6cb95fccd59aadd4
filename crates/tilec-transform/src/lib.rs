//! IR-mutating passes for the tilec middle-end: dead-code elimination,
//! local simplifications, shared-memory staging, synchronization insertion,
//! and the pipeline that sequences them with the analyses.

pub mod cts;
pub mod dce;
pub mod membar;
pub mod peephole;
pub mod pipeline;

pub use membar::{Membar, MembarError};
pub use pipeline::{compile, CompiledKernel, PipelineError};
