//! Shared-memory staging.
//!
//! Tensor-core dots read their A and B operands out of shared memory, so
//! every dot operand must be produced by a shared-writing instruction. This
//! pass walks dot operands (through phis, so loop-carried operands get one
//! staging copy per incoming edge) and wraps each register-resident producer
//! in a `CopyToShared` — or rewrites a masked load into its asynchronous
//! shared-memory form when the target supports async copies.

use log::debug;
use tilec_ir::{cfg, BasicBlock, Function, Handle, InstKind, Target, Value, ValueDef};

/// Runs the staging pass. Returns `true` if any copy was inserted.
pub fn run(func: &mut Function, target: &Target) -> bool {
    let mut dots: Vec<(Handle<Value>, Handle<Value>, Handle<Value>)> = Vec::new();
    for (_, block) in func.blocks.iter() {
        for &inst in &block.insts {
            if let Some((a, b, _)) = func.values[inst].inst().and_then(InstKind::as_dot) {
                dots.push((inst, a, b));
            }
        }
    }

    let mut changed = false;
    for (dot, a, b) in dots {
        let mut seen = Vec::new();
        changed |= stage(func, target, dot, a, None, &mut seen);
        seen.clear();
        changed |= stage(func, target, dot, b, None, &mut seen);
    }
    if changed {
        debug!("cts staged dot operands in `{}`", func.name);
    }
    changed
}

/// Ensures `operand` of `consumer` is produced in shared memory, inserting a
/// copy right after the producer. `edge` carries the incoming block when the
/// consumer is a phi, so copies of loop-carried arguments land on the right
/// edge.
fn stage(
    func: &mut Function,
    target: &Target,
    consumer: Handle<Value>,
    operand: Handle<Value>,
    edge: Option<Handle<BasicBlock>>,
    seen: &mut Vec<Handle<Value>>,
) -> bool {
    let def = func.values[operand].def.clone();
    let kind = match def {
        ValueDef::Inst(kind) => kind,
        ValueDef::Argument { .. } => {
            // No producer to copy after; stage on the consuming edge (or
            // just before the consumer).
            let ty = func.values[operand].ty.clone();
            let copy = func.make_inst(InstKind::CopyToShared { src: operand }, ty);
            insert_for_consumer(func, consumer, copy, edge);
            replace_use(func, consumer, operand, copy);
            return true;
        }
    };

    match kind {
        InstKind::Phi { incoming } => {
            // Phi cycles terminate here.
            if seen.contains(&operand) {
                return false;
            }
            seen.push(operand);
            let mut changed = false;
            for (pred, value) in incoming {
                changed |= stage(func, target, operand, value, Some(pred), seen);
            }
            changed
        }
        ref k if k.writes_shared() => false,
        InstKind::MaskedLoad {
            ptr,
            mask,
            fallback,
        } if target.async_copy => {
            let ty = func.values[operand].ty.clone();
            let copy = func.make_inst(
                InstKind::MaskedLoadAsync {
                    ptr,
                    mask,
                    fallback,
                },
                ty,
            );
            insert_after(func, operand, copy);
            replace_use(func, consumer, operand, copy);
            true
        }
        _ => {
            let ty = func.values[operand].ty.clone();
            let copy = func.make_inst(InstKind::CopyToShared { src: operand }, ty);
            insert_after(func, operand, copy);
            replace_use(func, consumer, operand, copy);
            true
        }
    }
}

/// Inserts `new` immediately after `producer` in its block.
fn insert_after(func: &mut Function, producer: Handle<Value>, new: Handle<Value>) {
    let blocks = cfg::value_blocks(func);
    if let Some(&block) = blocks.get(producer) {
        let insts = &mut func.blocks[block].insts;
        match insts.iter().position(|&i| i == producer) {
            Some(pos) => insts.insert(pos + 1, new),
            None => insts.push(new),
        }
    }
}

/// Inserts `new` before `consumer`, or at the end of the incoming edge's
/// block when the consumer is a phi.
fn insert_for_consumer(
    func: &mut Function,
    consumer: Handle<Value>,
    new: Handle<Value>,
    edge: Option<Handle<BasicBlock>>,
) {
    if let Some(pred) = edge {
        func.blocks[pred].insts.push(new);
        return;
    }
    let blocks = cfg::value_blocks(func);
    if let Some(&block) = blocks.get(consumer) {
        let insts = &mut func.blocks[block].insts;
        match insts.iter().position(|&i| i == consumer) {
            Some(pos) => insts.insert(pos, new),
            None => insts.push(new),
        }
    }
}

fn replace_use(func: &mut Function, consumer: Handle<Value>, old: Handle<Value>, new: Handle<Value>) {
    if let ValueDef::Inst(kind) = &mut func.values[consumer].def {
        kind.replace_operand(old, new);
    }
}
