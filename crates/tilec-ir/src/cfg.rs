//! Control-flow graph utilities: predecessors, traversal orders, use/def
//! queries over a function's blocks.

use crate::arena::{Handle, HandleMap};
use crate::func::{BasicBlock, Function};
use crate::inst::Value;

/// Computes the predecessor lists of every block.
pub fn predecessors(func: &Function) -> HandleMap<BasicBlock, Vec<Handle<BasicBlock>>> {
    let mut preds: HandleMap<BasicBlock, Vec<Handle<BasicBlock>>> = HandleMap::new();
    for (handle, _) in func.blocks.iter() {
        preds.insert(handle, Vec::new());
    }
    for (handle, block) in func.blocks.iter() {
        if let Some(term) = &block.terminator {
            for succ in term.successors() {
                if let Some(list) = preds.get_mut(succ) {
                    if !list.contains(&handle) {
                        list.push(handle);
                    }
                }
            }
        }
    }
    preds
}

/// Returns the blocks reachable from the entry in reverse post-order.
///
/// In RPO every block appears before its successors except along back
/// edges, which is the order forward dataflow analyses want.
pub fn reverse_post_order(func: &Function) -> Vec<Handle<BasicBlock>> {
    let Some(entry) = func.entry else {
        return Vec::new();
    };
    let mut visited: HandleMap<BasicBlock, ()> = HandleMap::new();
    let mut post = Vec::new();
    // Iterative DFS; (block, next successor index) pairs.
    let mut stack = vec![(entry, 0usize)];
    visited.insert(entry, ());
    while let Some(&mut (block, ref mut next)) = stack.last_mut() {
        let succs = func.blocks[block]
            .terminator
            .as_ref()
            .map(|t| t.successors())
            .unwrap_or_default();
        if *next < succs.len() {
            let succ = succs[*next];
            *next += 1;
            if !visited.contains(succ) {
                visited.insert(succ, ());
                stack.push((succ, 0));
            }
        } else {
            post.push(block);
            stack.pop();
        }
    }
    post.reverse();
    post
}

/// Maps every block-resident instruction value to its containing block.
pub fn value_blocks(func: &Function) -> HandleMap<Value, Handle<BasicBlock>> {
    let mut map = HandleMap::new();
    for (handle, block) in func.blocks.iter() {
        for &inst in &block.insts {
            map.insert(inst, handle);
        }
    }
    map
}

/// Maps every value to the instruction values that use it as an operand.
pub fn users(func: &Function) -> HandleMap<Value, Vec<Handle<Value>>> {
    let mut map: HandleMap<Value, Vec<Handle<Value>>> = HandleMap::new();
    for (_, block) in func.blocks.iter() {
        for &inst in &block.insts {
            if let Some(kind) = func.values[inst].inst() {
                for op in kind.operands() {
                    match map.get_mut(op) {
                        Some(list) => {
                            if !list.contains(&inst) {
                                list.push(inst);
                            }
                        }
                        None => {
                            map.insert(op, vec![inst]);
                        }
                    }
                }
            }
        }
    }
    map
}
