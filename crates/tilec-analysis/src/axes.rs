//! Axis-equivalence assignment.
//!
//! Gives every dimension of every tile value an axis variable and merges
//! variables that must index the same logical tensor axis: elementwise
//! operations tie their operands dimension by dimension, transposes tie
//! reversed dimensions, dots tie the result to the accumulator. Layout
//! boundaries (copy-to-shared, async loads, recoalesce, splat) deliberately
//! tie nothing: the whole point of those instructions is that their result
//! lives in a different physical distribution than their operand.
//!
//! The layout inference pass intersects the resulting axis sets to decide
//! which values are forced into one layout group.

use tilec_ir::{Function, Handle, HandleMap, InstKind, Value};

/// Identifier of one axis-equivalence class.
pub type AxisId = u32;

/// The result of axis assignment: per-value axis ids, one per dimension.
#[derive(Debug, Default)]
pub struct Axes {
    axes: HandleMap<Value, Vec<AxisId>>,
}

impl Axes {
    /// Runs axis assignment over a function.
    pub fn run(func: &Function) -> Self {
        let mut uf = AxisUnionFind::default();

        // One fresh variable per (value, dimension).
        let mut vars: HandleMap<Value, Vec<u32>> = HandleMap::new();
        for (handle, value) in func.values.iter() {
            if value.ty.is_tile() {
                let dims = (0..value.ty.rank()).map(|_| uf.fresh()).collect();
                vars.insert(handle, dims);
            }
        }

        for (_, block) in func.blocks.iter() {
            for &inst in &block.insts {
                let Some(kind) = func.values[inst].inst() else {
                    continue;
                };
                merge_for_inst(&mut uf, &vars, func, inst, kind);
            }
        }

        // Compact representatives into stable axis ids.
        let mut axes = HandleMap::new();
        let mut compact: Vec<Option<AxisId>> = vec![None; uf.len()];
        let mut next: AxisId = 0;
        for (handle, dims) in vars.iter() {
            let ids = dims
                .iter()
                .map(|&d| {
                    let root = uf.find(d);
                    *compact[root as usize].get_or_insert_with(|| {
                        let id = next;
                        next += 1;
                        id
                    })
                })
                .collect();
            axes.insert(handle, ids);
        }
        Self { axes }
    }

    /// Axis ids of a value, one per tile dimension; empty for scalars.
    pub fn axes_of(&self, v: Handle<Value>) -> &[AxisId] {
        self.axes.get(v).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn merge_for_inst(
    uf: &mut AxisUnionFind,
    vars: &HandleMap<Value, Vec<u32>>,
    func: &Function,
    result: Handle<Value>,
    kind: &InstKind,
) {
    let tie_same = |uf: &mut AxisUnionFind, a: Handle<Value>, b: Handle<Value>| {
        if let (Some(da), Some(db)) = (vars.get(a), vars.get(b)) {
            for (&x, &y) in da.iter().zip(db.iter()) {
                uf.union(x, y);
            }
        }
    };

    match *kind {
        InstKind::Binary { lhs, rhs, .. } => {
            tie_same(uf, result, lhs);
            tie_same(uf, result, rhs);
        }
        InstKind::PtrAdd { base, offset } => {
            tie_same(uf, result, base);
            tie_same(uf, result, offset);
        }
        InstKind::Load { ptr } => tie_same(uf, result, ptr),
        InstKind::MaskedLoad {
            ptr,
            mask,
            fallback,
        } => {
            tie_same(uf, result, ptr);
            tie_same(uf, result, mask);
            tie_same(uf, result, fallback);
        }
        InstKind::Store { ptr, value } => tie_same(uf, ptr, value),
        InstKind::AtomicRmw { ptr, value, .. } => tie_same(uf, ptr, value),
        InstKind::Phi { ref incoming } => {
            for &(_, v) in incoming {
                tie_same(uf, result, v);
            }
        }
        InstKind::Trans { src } => {
            if let (Some(dr), Some(ds)) = (vars.get(result), vars.get(src)) {
                let rank = ds.len();
                for (d, &x) in dr.iter().enumerate() {
                    if let Some(&y) = ds.get(rank - 1 - d) {
                        uf.union(x, y);
                    }
                }
            }
        }
        InstKind::Dot { c, .. } => {
            // The result is distributed like its accumulator; the a/b
            // operands live in their own (shared-memory) groups.
            tie_same(uf, result, c);
        }
        InstKind::Reduce { src, axis, .. } => {
            if let (Some(dr), Some(ds)) = (vars.get(result), vars.get(src)) {
                let mut src_dims = ds.iter().enumerate().filter(|&(d, _)| d != axis as usize);
                for &x in dr {
                    if let Some((_, &y)) = src_dims.next() {
                        uf.union(x, y);
                    }
                }
            }
        }
        InstKind::Broadcast { src } => {
            if let (Some(dr), Some(ds)) = (vars.get(result), vars.get(src)) {
                let r_shape = &func.values[result].ty.shape;
                let s_shape = &func.values[src].ty.shape;
                for d in 0..ds.len().min(dr.len()) {
                    if s_shape.get(d) == r_shape.get(d) && s_shape.get(d) != Some(&1) {
                        uf.union(dr[d], ds[d]);
                    }
                }
            }
        }
        // Layout boundaries and scalar-only instructions tie nothing.
        InstKind::Splat { .. }
        | InstKind::CopyToShared { .. }
        | InstKind::MaskedLoadAsync { .. }
        | InstKind::Recoalesce { .. }
        | InstKind::Barrier
        | InstKind::AsyncWait { .. } => {}
    }
}

#[derive(Debug, Default)]
struct AxisUnionFind {
    parent: Vec<u32>,
}

impl AxisUnionFind {
    fn fresh(&mut self) -> u32 {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        id
    }

    fn len(&self) -> usize {
        self.parent.len()
    }

    fn find(&mut self, mut i: u32) -> u32 {
        while self.parent[i as usize] != i {
            let grandparent = self.parent[self.parent[i as usize] as usize];
            self.parent[i as usize] = grandparent;
            i = grandparent;
        }
        i
    }

    fn union(&mut self, a: u32, b: u32) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb as usize] = ra;
        }
    }
}
