//! Pointer contiguity analysis.
//!
//! Front-ends declare per-axis contiguity on pointer arguments through
//! [`ArgAlign`]; this pass propagates those facts along pointer arithmetic
//! and control-flow merges so that layout inference can pick vector widths
//! and memory-coalescing orders for loads and stores.
//!
//! The lattice per (value, axis) is a single `u32` contiguity: how many
//! consecutive elements along that axis are known adjacent in memory.
//! Everything unknown is 1. The propagation runs two sweeps in value order,
//! enough to push facts across single-level phi back edges.

use tilec_ir::{Function, Handle, HandleMap, InstKind, Value, ValueDef};

/// Per-value, per-axis contiguity facts.
#[derive(Debug, Default)]
pub struct Align {
    contiguous: HandleMap<Value, Vec<u32>>,
}

impl Align {
    /// Runs the contiguity propagation over a function.
    pub fn run(func: &Function) -> Self {
        let mut out = Self::default();

        // Seed arguments from their declared attributes.
        for &arg in &func.arguments {
            let value = &func.values[arg];
            let rank = value.ty.rank();
            if rank == 0 {
                continue;
            }
            let mut facts = vec![1u32; rank];
            if let ValueDef::Argument {
                align: Some(ref a), ..
            } = value.def
            {
                for (d, fact) in facts.iter_mut().enumerate() {
                    if let Some(&c) = a.contiguous.get(d) {
                        *fact = c.max(1);
                    }
                }
            }
            out.contiguous.insert(arg, facts);
        }

        // Two sweeps: the second picks up facts flowing around loop phis.
        for _ in 0..2 {
            for (handle, value) in func.values.iter() {
                if !value.ty.is_tile() {
                    continue;
                }
                let Some(kind) = value.inst() else { continue };
                if let Some(facts) = out.transfer(func, handle, kind) {
                    out.contiguous.insert(handle, facts);
                }
            }
        }
        out
    }

    fn transfer(
        &self,
        func: &Function,
        result: Handle<Value>,
        kind: &InstKind,
    ) -> Option<Vec<u32>> {
        let rank = func.values[result].ty.rank();
        match *kind {
            InstKind::PtrAdd { base, .. } => Some(self.padded(base, rank)),
            InstKind::Trans { src } => {
                let mut facts = self.padded(src, rank);
                facts.reverse();
                Some(facts)
            }
            InstKind::Binary { lhs, rhs, .. } => {
                let a = self.padded(lhs, rank);
                let b = self.padded(rhs, rank);
                Some(a.iter().zip(&b).map(|(&x, &y)| x.min(y)).collect())
            }
            InstKind::Broadcast { src } => {
                let src_shape = &func.values[src].ty.shape;
                let out_shape = &func.values[result].ty.shape;
                let src_facts = self.padded(src, src_shape.len());
                let facts = (0..rank)
                    .map(|d| {
                        if src_shape.get(d) == out_shape.get(d) {
                            src_facts.get(d).copied().unwrap_or(1)
                        } else {
                            1
                        }
                    })
                    .collect();
                Some(facts)
            }
            InstKind::Phi { ref incoming } => {
                let mut facts: Option<Vec<u32>> = None;
                for &(_, v) in incoming {
                    let Some(in_facts) = self.contiguous.get(v) else {
                        continue;
                    };
                    facts = Some(match facts {
                        None => in_facts.clone(),
                        Some(acc) => acc
                            .iter()
                            .zip(in_facts)
                            .map(|(&x, &y)| x.min(y))
                            .collect(),
                    });
                }
                Some(facts.unwrap_or_else(|| vec![1; rank]))
            }
            _ => None,
        }
    }

    fn padded(&self, v: Handle<Value>, rank: usize) -> Vec<u32> {
        let mut facts = self
            .contiguous
            .get(v)
            .cloned()
            .unwrap_or_else(|| vec![1; rank]);
        facts.resize(rank, 1);
        facts
    }

    /// Per-axis contiguity of a value; empty for scalars and untracked values.
    pub fn contiguous(&self, v: Handle<Value>) -> &[u32] {
        self.contiguous.get(v).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Contiguity of `v` along one axis; 1 when nothing is known.
    pub fn get(&self, v: Handle<Value>, axis: usize) -> u32 {
        self.contiguous(v).get(axis).copied().unwrap_or(1)
    }
}
