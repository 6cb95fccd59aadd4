//! Local simplifications.
//!
//! Two rewrites, both pure use-replacement (the orphaned definitions are
//! left for DCE):
//!
//! * `trans(trans(x))` becomes `x`,
//! * `copy_to_shared(x)` where `x` already writes shared memory becomes `x`.

use log::debug;
use tilec_ir::{Function, Handle, HandleMap, InstKind, Terminator, Value, ValueDef};

/// Runs one simplification sweep. Returns `true` if anything was rewritten.
pub fn run(func: &mut Function) -> bool {
    let mut replace: HandleMap<Value, Handle<Value>> = HandleMap::new();
    for (handle, value) in func.values.iter() {
        let Some(kind) = value.inst() else { continue };
        match *kind {
            InstKind::Trans { src } => {
                if let Some(&InstKind::Trans { src: inner }) = func.values[src].inst() {
                    replace.insert(handle, inner);
                }
            }
            InstKind::CopyToShared { src } => {
                if func.values[src].inst().is_some_and(|k| k.writes_shared()) {
                    replace.insert(handle, src);
                }
            }
            _ => {}
        }
    }
    if replace.iter().next().is_none() {
        return false;
    }

    // Chase chains so rewrites land on the final survivor.
    let resolve = |mut v: Handle<Value>| {
        while let Some(&next) = replace.get(v) {
            v = next;
        }
        v
    };
    let pairs: Vec<(Handle<Value>, Handle<Value>)> =
        replace.iter().map(|(old, _)| (old, resolve(old))).collect();

    // A pattern whose uses were already rewritten (its definition lingers in
    // the append-only arena) counts as a change only if a use changed now.
    let mut changed = false;
    for (_, value) in func.values.iter_mut() {
        if let ValueDef::Inst(kind) = &mut value.def {
            for &(old, new) in &pairs {
                changed |= kind.replace_operand(old, new);
            }
        }
    }
    for (_, block) in func.blocks.iter_mut() {
        match &mut block.terminator {
            Some(Terminator::Return { value: Some(v) }) | Some(Terminator::CondBranch { cond: v, .. }) => {
                for &(old, new) in &pairs {
                    if *v == old {
                        *v = new;
                        changed = true;
                    }
                }
            }
            _ => {}
        }
    }
    if changed {
        debug!(
            "peephole rewrote uses of {} values in `{}`",
            pairs.len(),
            func.name
        );
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilec_ir::{Scalar, Type};

    #[test]
    fn double_transpose_cancels() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let p = f.add_argument("p", Type::ptr_tile(Scalar::F32, vec![16, 64]), None);
        let x = f.add_argument("x", Type::tile(Scalar::F32, vec![16, 64]), None);
        let t1 = f.add_inst(
            b,
            InstKind::Trans { src: x },
            Type::tile(Scalar::F32, vec![64, 16]),
        );
        let t2 = f.add_inst(
            b,
            InstKind::Trans { src: t1 },
            Type::tile(Scalar::F32, vec![16, 64]),
        );
        let st = f.add_inst(b, InstKind::Store { ptr: p, value: t2 }, Type::VOID);
        f.set_terminator(b, Terminator::Return { value: None });

        assert!(run(&mut f));
        assert_eq!(
            f.values[st].inst().map(InstKind::operands),
            Some(vec![p, x])
        );
        assert!(!run(&mut f));
    }

    #[test]
    fn unused_pattern_reports_no_change() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let p = f.add_argument("p", Type::ptr_tile(Scalar::F32, vec![16, 64]), None);
        let x = f.add_argument("x", Type::tile(Scalar::F32, vec![16, 64]), None);
        let t1 = f.add_inst(
            b,
            InstKind::Trans { src: x },
            Type::tile(Scalar::F32, vec![64, 16]),
        );
        f.add_inst(
            b,
            InstKind::Trans { src: t1 },
            Type::tile(Scalar::F32, vec![16, 64]),
        );
        f.add_inst(b, InstKind::Store { ptr: p, value: x }, Type::VOID);
        f.set_terminator(b, Terminator::Return { value: None });

        // The double transpose is matched but nothing reads it, so a sweep
        // that rewrites no use must not claim progress.
        assert!(!run(&mut f));
    }

    #[test]
    fn redundant_copy_to_shared_collapses() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let ty = Type::tile(Scalar::F16, vec![16, 64]);
        let x = f.add_argument("x", ty.clone(), None);
        let acc = f.add_argument("acc", Type::tile(Scalar::F32, vec![16, 16]), None);
        let c1 = f.add_inst(b, InstKind::CopyToShared { src: x }, ty.clone());
        let c2 = f.add_inst(b, InstKind::CopyToShared { src: c1 }, ty.clone());
        let other = f.add_inst(
            b,
            InstKind::CopyToShared { src: x },
            Type::tile(Scalar::F16, vec![64, 16]),
        );
        let d = f.add_inst(
            b,
            InstKind::Dot {
                a: c2,
                b: other,
                c: acc,
            },
            Type::tile(Scalar::F32, vec![16, 16]),
        );
        f.set_terminator(b, Terminator::Return { value: None });

        assert!(run(&mut f));
        assert_eq!(
            f.values[d].inst().and_then(InstKind::as_dot),
            Some((c1, other, acc))
        );
    }
}
