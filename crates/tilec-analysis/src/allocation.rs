//! Shared-memory offset assignment.
//!
//! Packs shared buffers into one block of shared memory. Buffers whose live
//! intervals are disjoint may reuse the same bytes; buffers alive at the
//! same time must not overlap. Placement is first-fit in layout-id order:
//! each buffer takes the lowest offset at which it clears every
//! already-placed buffer it interferes with.

use log::debug;

use crate::layout::{LayoutId, Layouts};
use crate::liveness::Liveness;

/// Byte offsets of shared buffers plus the total footprint.
#[derive(Debug, Default)]
pub struct Allocation {
    offsets: Vec<Option<u32>>,
    allocated_size: u32,
}

impl Allocation {
    /// Assigns offsets to every live shared layout.
    pub fn run(layouts: &Layouts, liveness: &Liveness) -> Self {
        let mut placed: Vec<(u32, u32, LayoutId)> = Vec::new();
        let mut offsets = vec![None; layouts.len()];
        let mut allocated_size = 0u32;

        for (id, shared) in layouts.shareds() {
            let Some(seg) = liveness.get(id) else { continue };
            let size = shared.size.max(1);

            // Lowest offset clear of every interfering placed buffer.
            let mut offset = 0u32;
            loop {
                let conflict = placed.iter().find(|&&(start, end, other)| {
                    let other_seg = match liveness.get(other) {
                        Some(s) => s,
                        None => return false,
                    };
                    seg.intersects(other_seg) && offset < end && start < offset + size
                });
                match conflict {
                    Some(&(_, end, _)) => offset = end,
                    None => break,
                }
            }
            debug!("shared buffer {id}: {size} bytes at offset {offset}");
            placed.push((offset, offset + size, id));
            placed.sort_unstable();
            offsets[id] = Some(offset);
            allocated_size = allocated_size.max(offset + size);
        }
        Self {
            offsets,
            allocated_size,
        }
    }

    /// Builds an allocation from explicit `(layout id, byte offset)` pairs.
    ///
    /// Intended for callers that compute placement elsewhere and for tests
    /// that pin exact address ranges.
    pub fn with_offsets(len: usize, pairs: &[(LayoutId, u32)]) -> Self {
        let mut offsets = vec![None; len];
        for &(id, offset) in pairs {
            offsets[id] = Some(offset);
        }
        Self {
            offsets,
            allocated_size: 0,
        }
    }

    /// The byte offset of a shared layout, if it was allocated.
    pub fn offset_of(&self, id: LayoutId) -> Option<u32> {
        self.offsets.get(id).copied().flatten()
    }

    /// Returns `true` if the layout received an offset.
    pub fn is_allocated(&self, id: LayoutId) -> bool {
        self.offset_of(id).is_some()
    }

    /// Total bytes of shared memory needed.
    pub fn allocated_size(&self) -> u32 {
        self.allocated_size
    }
}
