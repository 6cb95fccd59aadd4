//! Target hardware description.
//!
//! Everything the middle-end needs to know about the accelerator is a
//! capability here; passes never compare architecture version numbers.

/// Tensor-core generation tier, which decides the MMA fragment math.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorCoreGen {
    /// No tensor cores.
    None,
    /// First generation: 8x8 fragments packed by operand orientation.
    First,
    /// Second generation: fixed 16x8 warp shape.
    Second,
}

/// Capabilities of the accelerator being compiled for.
#[derive(Clone, Debug)]
pub struct Target {
    /// Warps execute in lockstep (GPU-like). Sequential targets get a
    /// single logical thread.
    pub parallel: bool,
    /// Threads per warp on a parallel target.
    pub warp_size: u32,
    /// Tensor-core generation available for half-precision dots.
    pub tensor_core: TensorCoreGen,
    /// Copies into shared memory can run asynchronously.
    pub async_copy: bool,
    /// A write-after-read to shared memory needs a barrier even when the
    /// value is double-buffered.
    pub conservative_war: bool,
}

impl Target {
    /// A first-generation parallel target: synchronous copies, relaxed
    /// write-after-read ordering.
    pub fn gpu_gen1() -> Self {
        Self {
            parallel: true,
            warp_size: 32,
            tensor_core: TensorCoreGen::First,
            async_copy: false,
            conservative_war: false,
        }
    }

    /// A second-generation parallel target: asynchronous copy engines and
    /// the conservative write-after-read barrier requirement.
    pub fn gpu_gen2() -> Self {
        Self {
            parallel: true,
            warp_size: 32,
            tensor_core: TensorCoreGen::Second,
            async_copy: true,
            conservative_war: true,
        }
    }

    /// A sequential CPU-like target.
    pub fn cpu() -> Self {
        Self {
            parallel: false,
            warp_size: 1,
            tensor_core: TensorCoreGen::None,
            async_copy: false,
            conservative_war: false,
        }
    }

    /// Total threads available to one kernel instance.
    pub fn num_threads(&self, num_warps: u32) -> u32 {
        if self.parallel {
            num_warps * self.warp_size
        } else {
            1
        }
    }
}
