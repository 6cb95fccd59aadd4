//! Dead-code elimination.
//!
//! Keeps instructions with observable side effects and everything reachable
//! from them or from block terminators; drops the rest from the instruction
//! lists. Values stay in the arena (it is append-only), they just stop being
//! scheduled.

use log::debug;
use tilec_ir::{Function, Handle, HandleMap, Terminator, Value};

/// Runs one DCE sweep. Returns `true` if any instruction was removed.
pub fn run(func: &mut Function) -> bool {
    let mut live: HandleMap<Value, ()> = HandleMap::new();
    let mut worklist: Vec<Handle<Value>> = Vec::new();
    let mut mark = |live: &mut HandleMap<Value, ()>, worklist: &mut Vec<_>, v: Handle<Value>| {
        if !live.contains(v) {
            live.insert(v, ());
            worklist.push(v);
        }
    };

    // Roots: side-effecting instructions and terminator operands.
    for (_, block) in func.blocks.iter() {
        for &inst in &block.insts {
            if func.values[inst].inst().is_some_and(|k| k.has_side_effect()) {
                mark(&mut live, &mut worklist, inst);
            }
        }
        match block.terminator {
            Some(Terminator::CondBranch { cond, .. }) => {
                mark(&mut live, &mut worklist, cond);
            }
            Some(Terminator::Return { value: Some(v) }) => {
                mark(&mut live, &mut worklist, v);
            }
            _ => {}
        }
    }

    while let Some(v) = worklist.pop() {
        if let Some(kind) = func.values[v].inst() {
            for op in kind.operands() {
                mark(&mut live, &mut worklist, op);
            }
        }
    }

    let mut removed = 0usize;
    for (_, block) in func.blocks.iter_mut() {
        let before = block.insts.len();
        block.insts.retain(|&inst| live.contains(inst));
        removed += before - block.insts.len();
    }
    if removed > 0 {
        debug!("dce removed {removed} dead instructions from `{}`", func.name);
    }
    removed > 0
}
