//! Staged edits to instruction lists.
//!
//! Passes that insert instructions while walking a block record their edits
//! here and apply them in one splice afterwards, so the walk never iterates
//! a list under mutation.

use crate::arena::Handle;
use crate::func::BasicBlock;
use crate::inst::Value;

/// An ordered list of "insert value before index" edits against one block.
#[derive(Debug, Default)]
pub struct EditList {
    edits: Vec<(usize, Handle<Value>)>,
}

impl EditList {
    /// Creates an empty edit list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an insertion before the instruction currently at `index`.
    ///
    /// Multiple insertions at the same index are applied in the order they
    /// were recorded.
    pub fn insert_before(&mut self, index: usize, value: Handle<Value>) {
        self.edits.push((index, value));
    }

    /// Returns `true` if no edits were recorded.
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Applies all recorded edits to the block's instruction list.
    pub fn apply(mut self, block: &mut BasicBlock) {
        if self.edits.is_empty() {
            return;
        }
        // Stable sort keeps same-index edits in recording order.
        self.edits.sort_by_key(|&(index, _)| index);
        let old = std::mem::take(&mut block.insts);
        let mut out = Vec::with_capacity(old.len() + self.edits.len());
        let mut edits = self.edits.into_iter().peekable();
        for (i, inst) in old.into_iter().enumerate() {
            while let Some(&(at, v)) = edits.peek() {
                if at != i {
                    break;
                }
                out.push(v);
                edits.next();
            }
            out.push(inst);
        }
        // Edits at or past the end append.
        out.extend(edits.map(|(_, v)| v));
        block.insts = out;
    }
}
