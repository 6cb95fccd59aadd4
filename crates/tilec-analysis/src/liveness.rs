//! Live ranges of shared-memory buffers.
//!
//! Numbers every instruction in block order, then gives each shared layout
//! the interval from the first definition of one of its members to the last
//! use of any member. The allocator overlaps buffers whose intervals are
//! disjoint.

use tilec_ir::{cfg, Function, HandleMap, Value};

use crate::layout::{LayoutId, Layouts};

/// A half-open slot interval `[start, end)`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    pub start: u32,
    pub end: u32,
}

impl Segment {
    /// Returns `true` if the two intervals share at least one slot.
    pub fn intersects(self, other: Segment) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Live intervals of shared layouts, keyed by layout id.
#[derive(Debug, Default)]
pub struct Liveness {
    intervals: Vec<Option<Segment>>,
}

impl Liveness {
    /// Computes live intervals for every shared layout.
    pub fn run(func: &Function, layouts: &Layouts) -> Self {
        // Slot numbering: 1-based, blocks in arena order.
        let mut slot_of: HandleMap<Value, u32> = HandleMap::new();
        let mut slot = 0u32;
        for (_, block) in func.blocks.iter() {
            for &inst in &block.insts {
                slot += 1;
                slot_of.insert(inst, slot);
            }
        }
        let users = cfg::users(func);

        let mut intervals = vec![None; layouts.len()];
        for (id, shared) in layouts.shareds() {
            let mut start = u32::MAX;
            let mut end = 0u32;
            for &v in &shared.base.values {
                if let Some(&s) = slot_of.get(v) {
                    start = start.min(s);
                }
                for &u in users.get(v).map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(&s) = slot_of.get(u) {
                        end = end.max(s);
                    }
                }
            }
            if start == u32::MAX {
                start = 0;
            }
            if end <= start {
                end = start + 1;
            }
            intervals[id] = Some(Segment { start, end });
        }
        Self { intervals }
    }

    /// The live interval of a shared layout, if it has one.
    pub fn get(&self, id: LayoutId) -> Option<Segment> {
        self.intervals.get(id).copied().flatten()
    }
}
