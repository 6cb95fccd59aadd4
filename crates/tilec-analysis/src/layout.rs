//! Layout inference.
//!
//! Partitions the tile values of a kernel into groups that must share one
//! physical data layout, then classifies each group:
//!
//! * [`MmaLayout`] for groups feeding tensor-core dots,
//! * [`SharedLayout`] for groups staged through shared memory,
//! * [`ScanlineLayout`] for everything else (the default row-major
//!   round-robin distribution over threads).
//!
//! Grouping is a union-find over the constraint graph: two values are
//! connected when their axis-equivalence sets intersect, so instructions
//! that tie axes (elementwise ops, phis, transposes) pull their operands
//! into one group while layout boundaries (copy-to-shared, async loads,
//! recoalesce) split groups apart.
//!
//! Classification of a tensor-core group recursively forces the dot's
//! operand groups first, since the operand shared layouts decide the
//! fragment ordering. The recursion carries an in-progress set and reports
//! a cycle instead of looping.

use log::warn;
use thiserror::Error;
use tilec_ir::cfg;
use tilec_ir::{
    BasicBlock, Function, Handle, HandleMap, InstKind, Scalar, Target, TensorCoreGen, Terminator,
    Value,
};

use crate::align::Align;
use crate::axes::{Axes, AxisId};
use crate::union_find::ValueGraph;

/// Identifier of one layout group.
pub type LayoutId = usize;

/// Errors produced by layout inference.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// A layout group ended up with no member values.
    #[error("layout group {0} has no members")]
    EmptyGroup(LayoutId),
    /// Tensor-core operand resolution revisited a group still being
    /// classified.
    #[error("cyclic layout dependency through group {0}")]
    CyclicDependency(LayoutId),
    /// A tensor-core dot operand is not staged through shared memory.
    #[error("tensor-core dot operand in group {0} has no shared-memory layout")]
    MissingSharedOperand(LayoutId),
    /// A tensor-core layout was requested on a target without tensor cores.
    #[error("target has no tensor cores")]
    NoTensorCore,
}

/// Which operand position of a dot a shared buffer feeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DotOperand {
    A,
    B,
}

/// Facts shared by every layout kind.
#[derive(Clone, Debug)]
pub struct LayoutBase {
    /// Group identifier.
    pub id: LayoutId,
    /// Axis-equivalence classes of the representative, one per dimension.
    pub axes: Vec<AxisId>,
    /// Tile shape of the representative.
    pub shape: Vec<u32>,
    /// Member values, in value order.
    pub values: Vec<Handle<Value>>,
    /// Dimension permutation, fastest-varying first.
    pub order: Vec<u32>,
}

impl LayoutBase {
    /// The `n`-th fastest-varying dimension.
    pub fn order(&self, n: usize) -> u32 {
        self.order.get(n).copied().unwrap_or(n as u32)
    }
}

/// A tensor-core (MMA) layout. All per-dimension vectors cover the two
/// spatial dimensions plus a trailing depth slot.
#[derive(Clone, Debug)]
pub struct MmaLayout {
    pub base: LayoutBase,
    /// Fragments per warp.
    pub fpw: [u32; 3],
    /// Shape covered by one warp.
    pub spw: [u32; 3],
    /// Warps per tile.
    pub wpt: [u32; 3],
    /// Shape covered by one pass of the whole block.
    pub spt: [u32; 3],
    /// Fragment repetitions.
    pub rep: [u32; 3],
}

impl MmaLayout {
    /// Shape covered per block pass along one dimension.
    pub fn spt(&self, d: usize) -> u32 {
        self.spt.get(d).copied().unwrap_or(1)
    }
}

/// The default distributed layout: contiguous per-thread chunks cycled
/// round-robin across the block, fastest axis first.
#[derive(Clone, Debug)]
pub struct ScanlineLayout {
    pub base: LayoutBase,
    /// Elements per thread along each dimension.
    pub nts: Vec<u32>,
    /// Threads along each dimension.
    pub mts: Vec<u32>,
}

impl ScanlineLayout {
    pub fn nts(&self, d: usize) -> u32 {
        self.nts.get(d).copied().unwrap_or(1)
    }

    pub fn mts(&self, d: usize) -> u32 {
        self.mts.get(d).copied().unwrap_or(1)
    }
}

/// The two buffers and the merge point of a double-buffered shared tile.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DoubleBufferInfo {
    /// The value filling the buffer before the loop.
    pub first: Handle<Value>,
    /// The value filling the buffer on the back edge.
    pub second: Handle<Value>,
    /// The phi merging the two.
    pub phi: Handle<Value>,
}

/// A shared-memory resident layout.
#[derive(Clone, Debug)]
pub struct SharedLayout {
    pub base: LayoutBase,
    /// Layout group of the staged operand, when there is one. Its order
    /// decides this buffer's order.
    pub arg: Option<LayoutId>,
    /// Element type stored in the buffer.
    pub elem: Scalar,
    /// Buffer size in bytes (doubled when double-buffered).
    pub size: u32,
    /// Present when the buffer is rotated across loop iterations.
    pub double_buffer: Option<DoubleBufferInfo>,
    /// Member used as a dot's A operand, if any.
    pub dot_a: Option<Handle<Value>>,
    /// Member used as a dot's B operand, if any.
    pub dot_b: Option<Handle<Value>>,
    /// Member used as a tensor-core dot's A operand, if any.
    pub hmma_dot_a: Option<Handle<Value>>,
    /// Member used as a tensor-core dot's B operand, if any.
    pub hmma_dot_b: Option<Handle<Value>>,
}

impl SharedLayout {
    /// Member feeding the given dot operand position, if any.
    pub fn dot_use(&self, op: DotOperand) -> Option<Handle<Value>> {
        match op {
            DotOperand::A => self.dot_a,
            DotOperand::B => self.dot_b,
        }
    }

    /// Member feeding the given tensor-core dot operand position, if any.
    pub fn hmma_dot_use(&self, op: DotOperand) -> Option<Handle<Value>> {
        match op {
            DotOperand::A => self.hmma_dot_a,
            DotOperand::B => self.hmma_dot_b,
        }
    }
}

/// One classified layout group.
#[derive(Clone, Debug)]
pub enum Layout {
    Mma(MmaLayout),
    Scanline(ScanlineLayout),
    Shared(SharedLayout),
}

impl Layout {
    /// The facts common to every layout kind.
    pub fn base(&self) -> &LayoutBase {
        match self {
            Self::Mma(l) => &l.base,
            Self::Scanline(l) => &l.base,
            Self::Shared(l) => &l.base,
        }
    }

    pub fn to_mma(&self) -> Option<&MmaLayout> {
        match self {
            Self::Mma(l) => Some(l),
            _ => None,
        }
    }

    pub fn to_scanline(&self) -> Option<&ScanlineLayout> {
        match self {
            Self::Scanline(l) => Some(l),
            _ => None,
        }
    }

    pub fn to_shared(&self) -> Option<&SharedLayout> {
        match self {
            Self::Shared(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }
}

/// The result of layout inference over one function.
#[derive(Debug)]
pub struct Layouts {
    layouts: Vec<Layout>,
    group_of: HandleMap<Value, LayoutId>,
    tmp: HandleMap<Value, LayoutId>,
}

impl Layouts {
    /// Runs layout inference.
    pub fn run(
        func: &Function,
        axes: &Axes,
        align: &Align,
        num_warps: u32,
        target: &Target,
    ) -> Result<Self, LayoutError> {
        Builder {
            func,
            axes,
            align,
            num_warps,
            target,
            users: cfg::users(func),
            value_blocks: cfg::value_blocks(func),
        }
        .run()
    }

    /// The layout of a value, if it belongs to a group.
    pub fn get(&self, v: Handle<Value>) -> Option<&Layout> {
        self.group_of.get(v).map(|&id| &self.layouts[id])
    }

    /// The group id of a value.
    pub fn group_of(&self, v: Handle<Value>) -> Option<LayoutId> {
        self.group_of.get(v).copied()
    }

    /// The layout with the given id.
    pub fn by_id(&self, id: LayoutId) -> &Layout {
        &self.layouts[id]
    }

    /// The scratch-buffer layout id of an instruction, if it needs one.
    pub fn tmp_id(&self, v: Handle<Value>) -> Option<LayoutId> {
        self.tmp.get(v).copied()
    }

    /// All layouts, in id order.
    pub fn all(&self) -> impl Iterator<Item = (LayoutId, &Layout)> {
        self.layouts.iter().enumerate()
    }

    /// All shared layouts, in id order.
    pub fn shareds(&self) -> impl Iterator<Item = (LayoutId, &SharedLayout)> {
        self.layouts
            .iter()
            .enumerate()
            .filter_map(|(id, l)| l.to_shared().map(|s| (id, s)))
    }

    /// Number of layout groups, scratch buffers included.
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

struct Builder<'a> {
    func: &'a Function,
    axes: &'a Axes,
    align: &'a Align,
    num_warps: u32,
    target: &'a Target,
    users: HandleMap<Value, Vec<Handle<Value>>>,
    value_blocks: HandleMap<Value, Handle<BasicBlock>>,
}

impl Builder<'_> {
    fn run(self) -> Result<Layouts, LayoutError> {
        let mut graph = ValueGraph::new();
        self.make_graph(&mut graph);
        let (groups, group_of) = graph.connected_components();

        let mut slots: Vec<Option<Layout>> = vec![None; groups.len()];
        let mut in_progress = vec![false; groups.len()];
        for id in 0..groups.len() {
            self.create(id, &groups, &group_of, &mut slots, &mut in_progress)?;
        }
        let mut layouts: Vec<Layout> = Vec::with_capacity(slots.len());
        for (id, slot) in slots.into_iter().enumerate() {
            layouts.push(slot.ok_or(LayoutError::EmptyGroup(id))?);
        }

        let mut result = Layouts {
            layouts,
            group_of,
            tmp: HandleMap::new(),
        };
        self.create_tmp(&mut result);
        Ok(result)
    }

    /// Connects every instruction with its tile operands (and the operands
    /// with each other) whenever their axis sets intersect.
    fn make_graph(&self, graph: &mut ValueGraph) {
        for (handle, value) in self.func.values.iter() {
            if value.ty.is_tile() {
                graph.add_node(handle);
            }
        }
        for (_, block) in self.func.blocks.iter() {
            for &inst in &block.insts {
                let Some(kind) = self.func.values[inst].inst() else {
                    continue;
                };
                let operands = kind.operands();
                for &opx in &operands {
                    self.connect(graph, inst, opx);
                    for &opy in &operands {
                        self.connect(graph, opx, opy);
                    }
                }
            }
        }
    }

    fn connect(&self, graph: &mut ValueGraph, x: Handle<Value>, y: Handle<Value>) {
        if x == y {
            return;
        }
        if !self.func.values[x].ty.is_tile() || !self.func.values[y].ty.is_tile() {
            return;
        }
        let xa = self.axes.axes_of(x);
        let ya = self.axes.axes_of(y);
        if xa.iter().any(|a| ya.contains(a)) {
            graph.add_edge(x, y);
        }
    }

    fn create(
        &self,
        id: LayoutId,
        groups: &[Vec<Handle<Value>>],
        group_of: &HandleMap<Value, LayoutId>,
        slots: &mut Vec<Option<Layout>>,
        in_progress: &mut Vec<bool>,
    ) -> Result<(), LayoutError> {
        if slots[id].is_some() {
            return Ok(());
        }
        if in_progress[id] {
            return Err(LayoutError::CyclicDependency(id));
        }
        in_progress[id] = true;

        let values = &groups[id];
        let largest = self.largest_member(values).ok_or(LayoutError::EmptyGroup(id))?;
        let base = LayoutBase {
            id,
            axes: self.axes.axes_of(largest).to_vec(),
            shape: self.func.values[largest].ty.shape.clone(),
            values: values.clone(),
            order: self.io_order(values, self.func.values[largest].ty.rank()),
        };

        let hmma_c = values
            .iter()
            .copied()
            .find(|&v| self.is_hmma_c(v));
        let staging = values.iter().copied().find(|&v| {
            self.func.values[v]
                .inst()
                .is_some_and(InstKind::writes_shared)
        });

        let layout = if let Some(dot) = hmma_c {
            let (a, b, _) = self.func.values[dot]
                .inst()
                .and_then(InstKind::as_dot)
                .ok_or(LayoutError::EmptyGroup(id))?;
            let id_a = *group_of.get(a).ok_or(LayoutError::MissingSharedOperand(id))?;
            let id_b = *group_of.get(b).ok_or(LayoutError::MissingSharedOperand(id))?;
            self.create(id_a, groups, group_of, slots, in_progress)?;
            self.create(id_b, groups, group_of, slots, in_progress)?;
            let shared_a = slots[id_a]
                .as_ref()
                .and_then(Layout::to_shared)
                .ok_or(LayoutError::MissingSharedOperand(id))?;
            let shared_b = slots[id_b]
                .as_ref()
                .and_then(Layout::to_shared)
                .ok_or(LayoutError::MissingSharedOperand(id))?;
            Layout::Mma(self.make_mma(base, shared_a, shared_b)?)
        } else if let Some(cts) = staging {
            let arg = self.func.values[cts]
                .inst()
                .map(InstKind::operands)
                .and_then(|ops| ops.first().copied())
                .ok_or(LayoutError::EmptyGroup(id))?;
            let arg_layout = match group_of.get(arg) {
                Some(&arg_id) => {
                    self.create(arg_id, groups, group_of, slots, in_progress)?;
                    slots[arg_id].as_ref()
                }
                None => None,
            };
            let elem = self.func.values[largest].ty.element_scalar();
            Layout::Shared(self.make_shared(base, arg_layout, elem))
        } else {
            Layout::Scanline(self.make_scanline(base))
        };
        slots[id] = Some(layout);
        in_progress[id] = false;
        Ok(())
    }

    /// The member with the highest rank, then the most elements, preferring
    /// non-transpose members so the pre-transpose orientation decides the
    /// group's shape.
    fn largest_member(&self, values: &[Handle<Value>]) -> Option<Handle<Value>> {
        let key = |v: Handle<Value>| {
            let ty = &self.func.values[v].ty;
            (ty.rank(), ty.num_elements())
        };
        let mut best: Option<Handle<Value>> = None;
        for &v in values {
            if self.func.values[v].inst().is_some_and(InstKind::is_trans) {
                continue;
            }
            if best.map_or(true, |b| key(v) > key(b)) {
                best = Some(v);
            }
        }
        if best.is_none() {
            for &v in values {
                if best.map_or(true, |b| key(v) > key(b)) {
                    best = Some(v);
                }
            }
        }
        best
    }

    /// Returns `true` for a dot whose operands both hold half floats on a
    /// target with tensor cores.
    fn is_hmma_c(&self, v: Handle<Value>) -> bool {
        if self.target.tensor_core == TensorCoreGen::None {
            return false;
        }
        let Some((a, b, _)) = self.func.values[v].inst().and_then(InstKind::as_dot) else {
            return false;
        };
        self.func.values[a].ty.element_scalar().is_half()
            && self.func.values[b].ty.element_scalar().is_half()
    }

    /// Dimension order of a distributed group: identity, then sorted so the
    /// most contiguous axis of the densest memory access comes first.
    fn io_order(&self, values: &[Handle<Value>], rank: usize) -> Vec<u32> {
        let mut order: Vec<u32> = (0..rank as u32).collect();
        let mut ptr: Option<Handle<Value>> = None;
        for &v in values {
            let Some(p) = self.func.values[v].inst().and_then(InstKind::pointer_operand) else {
                continue;
            };
            let denser = ptr.map_or(true, |old| {
                self.func.values[p].ty.num_elements() > self.func.values[old].ty.num_elements()
            });
            if denser {
                ptr = Some(p);
            }
        }
        if let Some(ptr) = ptr {
            order.sort_by(|&a, &b| {
                self.align
                    .get(ptr, b as usize)
                    .cmp(&self.align.get(ptr, a as usize))
            });
        }
        order
    }

    fn make_mma(
        &self,
        base: LayoutBase,
        shared_a: &SharedLayout,
        shared_b: &SharedLayout,
    ) -> Result<MmaLayout, LayoutError> {
        let (fpw, spw, rep) = match self.target.tensor_core {
            TensorCoreGen::None => return Err(LayoutError::NoTensorCore),
            TensorCoreGen::First => {
                let fpw = [2u32, 2, 1];
                let ord_a = &shared_a.base.order;
                let ord_b = &shared_b.base.order;
                let is_a_row = ord_a.first().copied().unwrap_or(0) != 0;
                let is_b_row = ord_b.first().copied().unwrap_or(0) != 0;
                let inner_a = shared_a.base.shape[ord_a[0] as usize];
                let inner_b = shared_b.base.shape[ord_b[0] as usize];
                let is_a_vec4 = !is_a_row && inner_a <= 16;
                let is_b_vec4 = is_b_row && inner_b <= 16;
                let pack_0: u32 = if is_a_row || is_a_vec4 { 1 } else { 2 };
                let pack_1: u32 = if is_b_row && !is_b_vec4 { 2 } else { 1 };
                let rep = [2 * pack_0, 2 * pack_1, 1];
                let spw = [fpw[0] * 4 * rep[0], fpw[1] * 4 * rep[1], 1];
                (fpw, spw, rep)
            }
            TensorCoreGen::Second => ([1, 1, 1], [16, 8, 1], [2, 2, 1]),
        };

        // Grow warps-per-tile as square as possible, capped by the tile
        // shape, until every warp has work or growth stalls.
        let shape = |d: usize| base.shape.get(d).copied().unwrap_or(1);
        let mut wpt = [1u32, 1, 1];
        loop {
            let prev = wpt;
            if wpt[0] * wpt[1] * wpt[2] < self.num_warps {
                wpt[0] = clamp(wpt[0] * 2, 1, shape(0) / spw[0]);
            }
            if wpt[0] * wpt[1] * wpt[2] < self.num_warps {
                wpt[1] = clamp(wpt[1] * 2, 1, shape(1) / spw[1]);
            }
            if wpt == prev {
                break;
            }
        }
        let spt = [spw[0] * wpt[0], spw[1] * wpt[1], 1];
        Ok(MmaLayout {
            base,
            fpw,
            spw,
            wpt,
            spt,
            rep,
        })
    }

    fn make_scanline(&self, base: LayoutBase) -> ScanlineLayout {
        let rank = base.shape.len();
        let mut nts = vec![1u32; rank];
        let mut mts = vec![1u32; rank];
        if rank == 0 {
            return ScanlineLayout { base, nts, mts };
        }

        let mut size: u32 = base.shape.iter().product();
        let mut num_threads = self.target.num_threads(self.num_warps);
        let feeds_dot = base.values.iter().any(|&v| {
            self.func.values[v]
                .inst()
                .is_some_and(|k| matches!(k, InstKind::Dot { .. }))
        });

        // Pointer of the highest-rank memory access consuming a member, for
        // the vector width along the contiguous axis.
        let mut ptr: Option<Handle<Value>> = None;
        for &v in &base.values {
            for &u in self.users.get(v).map(Vec::as_slice).unwrap_or(&[]) {
                if let Some(p) = self.func.values[u].inst().and_then(InstKind::pointer_operand) {
                    let wider = ptr.map_or(true, |old| {
                        self.func.values[p].ty.rank() > self.func.values[old].ty.rank()
                    });
                    if wider {
                        ptr = Some(p);
                    }
                }
            }
        }
        let elem_bits = base
            .values
            .first()
            .map(|&v| self.func.values[v].ty.element_scalar().bits())
            .unwrap_or(32)
            .max(8);

        let i = base.order(0) as usize;
        let contiguous = match ptr {
            Some(p) => self.align.get(p, i).min(128 / elem_bits).max(1),
            None => 1,
        };
        nts[i] = clamp(size / num_threads.max(1), 1, contiguous.min(base.shape[i]));
        mts[i] = clamp(num_threads, 1, base.shape[i] / nts[i]);
        size /= base.shape[i];
        num_threads /= mts[i];

        if feeds_dot && rank > 1 {
            let j = base.order(1) as usize;
            nts[j] = clamp(size / num_threads.max(1), 1, base.shape[j].min(4));
        }
        for d in 1..rank {
            let i = base.order(d) as usize;
            if d > 1 || !feeds_dot {
                nts[i] = 1;
            }
            mts[i] = clamp(num_threads, 1, base.shape[i] / nts[i]);
            num_threads /= mts[i].max(1);
        }
        ScanlineLayout { base, nts, mts }
    }

    fn make_shared(&self, mut base: LayoutBase, arg: Option<&Layout>, elem: Scalar) -> SharedLayout {
        base.order = arg.map(|l| l.base().order.clone()).unwrap_or_else(|| vec![0]);

        let mut double_buffer = None;
        for &v in &base.values {
            if double_buffer.is_none() {
                double_buffer = self.double_bufferable(v);
            }
        }

        let mut dot_a = None;
        let mut dot_b = None;
        let mut hmma_dot_a = None;
        let mut hmma_dot_b = None;
        for &v in &base.values {
            for &u in self.users.get(v).map(Vec::as_slice).unwrap_or(&[]) {
                let Some((a, b, _)) = self.func.values[u].inst().and_then(InstKind::as_dot)
                else {
                    continue;
                };
                let hmma = self.is_hmma_c(u);
                if a == v {
                    dot_a = Some(v);
                    if hmma {
                        hmma_dot_a = Some(v);
                    }
                }
                if b == v {
                    dot_b = Some(v);
                    if hmma {
                        hmma_dot_b = Some(v);
                    }
                }
            }
        }

        let mut size = elem.width as u32 * base.shape.iter().product::<u32>();
        if double_buffer.is_some() {
            size *= 2;
        }
        SharedLayout {
            arg: arg.map(|l| l.base().id),
            base,
            elem,
            size,
            double_buffer,
            dot_a,
            dot_b,
            hmma_dot_a,
            hmma_dot_b,
        }
    }

    /// Recognizes the rotating-buffer pattern: a two-way phi in a loop
    /// header whose back-edge value refills the buffer each iteration.
    fn double_bufferable(&self, v: Handle<Value>) -> Option<DoubleBufferInfo> {
        let incoming = self.func.values[v].inst().and_then(InstKind::as_phi)?;
        let &[(block_0, value_0), (block_1, value_1)] = incoming else {
            return None;
        };
        let phi_block = *self.value_blocks.get(v)?;
        let latch_0 = self.is_loop_latch(block_0, phi_block);
        let latch_1 = self.is_loop_latch(block_1, phi_block);
        let (first, second) = match (latch_0, latch_1) {
            (false, true) => (value_0, value_1),
            (true, false) => (value_1, value_0),
            _ => return None,
        };

        let staged = |x: Handle<Value>, f: fn(&InstKind) -> bool| {
            self.func.values[x].inst().is_some_and(f)
        };
        let both_cts = staged(first, InstKind::is_copy_to_shared)
            && staged(second, InstKind::is_copy_to_shared);
        let both_async = staged(first, InstKind::is_masked_load_async)
            && staged(second, InstKind::is_masked_load_async);
        let latch_fills = staged(second, InstKind::writes_shared)
            && !self.func.values[first].is_inst();
        if both_cts || both_async || latch_fills {
            Some(DoubleBufferInfo {
                first,
                second,
                phi: v,
            })
        } else {
            None
        }
    }

    fn is_loop_latch(&self, pred: Handle<BasicBlock>, header: Handle<BasicBlock>) -> bool {
        match self.func.blocks[pred].terminator {
            Some(Terminator::CondBranch {
                then_dest,
                else_dest,
                ..
            }) => then_dest == header || else_dest == header,
            _ => false,
        }
    }

    /// Scratch shared buffers for instructions that exchange data across
    /// threads without a shared-resident operand group of their own.
    fn create_tmp(&self, result: &mut Layouts) {
        for (_, block) in self.func.blocks.iter() {
            for &inst in &block.insts {
                let Some(kind) = self.func.values[inst].inst() else {
                    continue;
                };
                match *kind {
                    InstKind::Reduce { src, axis, .. } => {
                        let Some(layout) = result.get(src).cloned() else { continue };
                        let Some(scanline) = layout.to_scanline() else {
                            warn!(
                                "reduce operand group {} is not scanline; skipping scratch buffer",
                                layout.base().id
                            );
                            continue;
                        };
                        let mut shape = self.func.values[src].ty.shape.clone();
                        shape[axis as usize] = scanline.mts(axis as usize);
                        let elem = self.func.values[inst].ty.element_scalar();
                        self.push_tmp(result, inst, src, shape, Some(layout.clone()), elem);
                    }
                    InstKind::Recoalesce { src } => {
                        let in_mma = result.get(src).and_then(Layout::to_mma).cloned();
                        let out = result.get(inst).and_then(Layout::to_scanline).cloned();
                        let (Some(in_mma), Some(out)) = (in_mma, out) else {
                            continue;
                        };
                        let in_shape = &self.func.values[src].ty.shape;
                        let ld = out.base.order(0) as usize;
                        let mut shape = vec![0u32; in_shape.len()];
                        for k in 0..in_shape.len() {
                            shape[k] = if k == ld { in_shape[k] } else { in_mma.spt(k) };
                        }
                        let elem = self.func.values[src].ty.element_scalar();
                        self.push_tmp(result, inst, src, shape, Some(Layout::Scanline(out)), elem);
                    }
                    InstKind::AtomicRmw { value, .. } => {
                        let result_scalar = self.func.values[inst].ty.element_scalar();
                        let elem = if result_scalar.width == 0 {
                            self.func.values[value].ty.element_scalar()
                        } else {
                            result_scalar
                        };
                        self.push_tmp(result, inst, inst, vec![1], None, elem);
                    }
                    _ => {}
                }
            }
        }
    }

    fn push_tmp(
        &self,
        result: &mut Layouts,
        inst: Handle<Value>,
        axes_of: Handle<Value>,
        shape: Vec<u32>,
        arg: Option<Layout>,
        elem: Scalar,
    ) {
        let id = result.layouts.len();
        let base = LayoutBase {
            id,
            axes: self.axes.axes_of(axes_of).to_vec(),
            shape,
            values: vec![inst],
            order: Vec::new(),
        };
        let shared = self.make_shared(base, arg.as_ref(), elem);
        result.layouts.push(Layout::Shared(shared));
        result.tmp.insert(inst, id);
    }
}

fn clamp(x: u32, a: u32, b: u32) -> u32 {
    let lo = a.min(b);
    let hi = a.max(b);
    x.clamp(lo.max(1), hi.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilec_ir::{ArgAlign, Type};

    fn infer(func: &Function, num_warps: u32, target: &Target) -> Layouts {
        let axes = Axes::run(func);
        let align = Align::run(func);
        Layouts::run(func, &axes, &align, num_warps, target).unwrap()
    }

    fn ptr_arg(
        f: &mut Function,
        name: &str,
        scalar: Scalar,
        shape: Vec<u32>,
        contig: Vec<u32>,
    ) -> Handle<Value> {
        f.add_argument(
            name,
            Type::ptr_tile(scalar, shape),
            Some(ArgAlign {
                contiguous: contig,
                aligned: vec![],
            }),
        )
    }

    /// 1024 f32 elements, 128 threads, contiguity 4: each thread owns a
    /// 4-wide chunk and all 128 threads are spread along the fast axis.
    #[test]
    fn scanline_vector_width_follows_contiguity() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let p = ptr_arg(&mut f, "p", Scalar::F32, vec![1024], vec![4]);
        let x = f.add_inst(b, InstKind::Load { ptr: p }, Type::tile(Scalar::F32, vec![1024]));
        f.set_terminator(b, Terminator::Return { value: None });

        let layouts = infer(&f, 4, &Target::gpu_gen2());
        let scan = layouts.get(x).unwrap().to_scanline().unwrap();
        assert_eq!(scan.nts(0), 4);
        assert_eq!(scan.mts(0), 128);
    }

    #[test]
    fn order_puts_contiguous_axis_first() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let p = ptr_arg(&mut f, "p", Scalar::F32, vec![16, 64], vec![1, 8]);
        let x = f.add_inst(
            b,
            InstKind::Load { ptr: p },
            Type::tile(Scalar::F32, vec![16, 64]),
        );
        f.set_terminator(b, Terminator::Return { value: None });

        let layouts = infer(&f, 4, &Target::gpu_gen2());
        let base = layouts.get(x).unwrap().base();
        assert_eq!(base.order, vec![1, 0]);
    }

    #[test]
    fn higher_rank_member_decides_group_shape() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let x = f.add_argument("x", Type::tile(Scalar::F32, vec![64]), None);
        let bc = f.add_inst(
            b,
            InstKind::Broadcast { src: x },
            Type::tile(Scalar::F32, vec![64, 1]),
        );
        f.set_terminator(b, Terminator::Return { value: None });

        let layouts = infer(&f, 4, &Target::gpu_gen2());
        // Both members hold 64 elements; the rank-2 one fixes the group's
        // shape.
        assert_eq!(layouts.group_of(x), layouts.group_of(bc));
        assert_eq!(layouts.get(bc).unwrap().base().shape, vec![64, 1]);
    }

    #[test]
    fn vector_width_follows_the_highest_rank_pointer() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let src_ptr = ptr_arg(&mut f, "src", Scalar::F32, vec![16, 64], vec![1, 8]);
        let dst_ptr = ptr_arg(&mut f, "dst", Scalar::F32, vec![64], vec![1]);
        let x = f.add_inst(
            b,
            InstKind::Load { ptr: src_ptr },
            Type::tile(Scalar::F32, vec![16, 64]),
        );
        let r = f.add_inst(
            b,
            InstKind::Reduce {
                op: tilec_ir::ReduceOp::Sum,
                src: x,
                axis: 0,
            },
            Type::tile(Scalar::F32, vec![64]),
        );
        f.add_inst(
            b,
            InstKind::Store {
                ptr: dst_ptr,
                value: r,
            },
            Type::VOID,
        );
        f.set_terminator(b, Terminator::Return { value: None });

        let layouts = infer(&f, 4, &Target::gpu_gen2());
        let scan = layouts.get(x).unwrap().to_scanline().unwrap();
        // The rank-2 load, not the rank-1 store encountered later, supplies
        // the contiguity cap along the fast axis.
        assert_eq!(scan.nts(1), 4);
        assert_eq!(scan.mts(1), 16);
    }

    fn hmma_kernel() -> (Function, Handle<Value>, Handle<Value>, Handle<Value>) {
        let mut f = Function::new("matmul");
        let b = f.add_block("entry");
        let a_ty = Type::tile(Scalar::F16, vec![64, 16]);
        let b_ty = Type::tile(Scalar::F16, vec![16, 64]);
        let c_ty = Type::tile(Scalar::F32, vec![64, 64]);
        let a_in = f.add_argument("a", a_ty.clone(), None);
        let b_in = f.add_argument("b", b_ty.clone(), None);
        let acc = f.add_argument("acc", c_ty.clone(), None);
        let a_sh = f.add_inst(b, InstKind::CopyToShared { src: a_in }, a_ty);
        let b_sh = f.add_inst(b, InstKind::CopyToShared { src: b_in }, b_ty);
        let d = f.add_inst(
            b,
            InstKind::Dot {
                a: a_sh,
                b: b_sh,
                c: acc,
            },
            c_ty,
        );
        f.set_terminator(b, Terminator::Return { value: None });
        (f, a_sh, b_sh, d)
    }

    #[test]
    fn tensor_core_dot_gets_mma_layout() {
        let (f, a_sh, b_sh, d) = hmma_kernel();
        let layouts = infer(&f, 4, &Target::gpu_gen2());

        let mma = layouts.get(d).unwrap().to_mma().unwrap();
        assert_eq!(mma.spw, [16, 8, 1]);
        assert_eq!(mma.wpt, [2, 2, 1]);
        assert_eq!(mma.spt, [32, 16, 1]);

        let sh_a = layouts.get(a_sh).unwrap().to_shared().unwrap();
        let sh_b = layouts.get(b_sh).unwrap().to_shared().unwrap();
        assert_eq!(sh_a.hmma_dot_a, Some(a_sh));
        assert_eq!(sh_b.hmma_dot_b, Some(b_sh));
        // 64*16 half elements.
        assert_eq!(sh_a.size, 64 * 16 * 2);
    }

    #[test]
    fn dot_without_tensor_cores_stays_scanline() {
        let (f, _, _, d) = hmma_kernel();
        let mut target = Target::gpu_gen2();
        target.tensor_core = TensorCoreGen::None;
        let layouts = infer(&f, 4, &target);
        assert!(layouts.get(d).unwrap().to_scanline().is_some());
    }

    #[test]
    fn register_dot_operand_is_an_error() {
        let mut f = Function::new("matmul");
        let b = f.add_block("entry");
        let a_ty = Type::tile(Scalar::F16, vec![64, 16]);
        let b_ty = Type::tile(Scalar::F16, vec![16, 64]);
        let c_ty = Type::tile(Scalar::F32, vec![64, 64]);
        let a_in = f.add_argument("a", a_ty, None);
        let b_in = f.add_argument("b", b_ty.clone(), None);
        let acc = f.add_argument("acc", c_ty.clone(), None);
        let b_sh = f.add_inst(b, InstKind::CopyToShared { src: b_in }, b_ty);
        f.add_inst(
            b,
            InstKind::Dot {
                a: a_in,
                b: b_sh,
                c: acc,
            },
            c_ty,
        );
        f.set_terminator(b, Terminator::Return { value: None });

        let axes = Axes::run(&f);
        let align = Align::run(&f);
        let err = Layouts::run(&f, &axes, &align, 4, &Target::gpu_gen2());
        assert!(matches!(err, Err(LayoutError::MissingSharedOperand(_))));
    }

    #[test]
    fn double_buffered_phi_doubles_the_size() {
        let mut f = Function::new("k");
        let entry = f.add_block("entry");
        let body = f.add_block("body");
        let exit = f.add_block("exit");
        let ty = Type::tile(Scalar::F16, vec![16, 64]);
        let x = f.add_argument("x", ty.clone(), None);
        let cond = f.add_argument("c", Type::scalar(Scalar::BOOL), None);

        let first = f.add_inst(entry, InstKind::CopyToShared { src: x }, ty.clone());
        let phi = f.add_inst(body, InstKind::Phi { incoming: vec![] }, ty.clone());
        let second = f.add_inst(body, InstKind::CopyToShared { src: x }, ty.clone());
        if let tilec_ir::ValueDef::Inst(InstKind::Phi { incoming }) = &mut f.values[phi].def {
            incoming.push((entry, first));
            incoming.push((body, second));
        }
        f.set_terminator(entry, Terminator::Branch { dest: body });
        f.set_terminator(
            body,
            Terminator::CondBranch {
                cond,
                then_dest: body,
                else_dest: exit,
            },
        );
        f.set_terminator(exit, Terminator::Return { value: None });

        let layouts = infer(&f, 4, &Target::gpu_gen2());
        let shared = layouts.get(phi).unwrap().to_shared().unwrap();
        let info = shared.double_buffer.unwrap();
        assert_eq!(info.first, first);
        assert_eq!(info.second, second);
        assert_eq!(info.phi, phi);
        assert_eq!(shared.size, 16 * 64 * 2 * 2);
    }

    #[test]
    fn reduce_gets_a_scratch_buffer() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let p = ptr_arg(&mut f, "p", Scalar::F32, vec![1024], vec![4]);
        let x = f.add_inst(b, InstKind::Load { ptr: p }, Type::tile(Scalar::F32, vec![1024]));
        let r = f.add_inst(
            b,
            InstKind::Reduce {
                op: tilec_ir::ReduceOp::Sum,
                src: x,
                axis: 0,
            },
            Type::scalar(Scalar::F32),
        );
        f.set_terminator(b, Terminator::Return { value: None });

        let layouts = infer(&f, 4, &Target::gpu_gen2());
        let id = layouts.tmp_id(r).unwrap();
        let shared = layouts.by_id(id).to_shared().unwrap();
        // One slot per participating thread along the reduced axis.
        assert_eq!(shared.base.shape, vec![128]);
        assert_eq!(shared.size, 128 * 4);
    }

    #[test]
    fn atomic_gets_a_single_element_scratch() {
        let mut f = Function::new("k");
        let b = f.add_block("entry");
        let p = f.add_argument("p", Type::ptr_tile(Scalar::F32, vec![1]), None);
        let v = f.add_argument("v", Type::tile(Scalar::F32, vec![1]), None);
        let atom = f.add_inst(
            b,
            InstKind::AtomicRmw {
                op: tilec_ir::AtomicOp::Add,
                ptr: p,
                value: v,
            },
            Type::tile(Scalar::F32, vec![1]),
        );
        f.set_terminator(b, Terminator::Return { value: None });

        let layouts = infer(&f, 4, &Target::gpu_gen2());
        let id = layouts.tmp_id(atom).unwrap();
        let shared = layouts.by_id(id).to_shared().unwrap();
        assert_eq!(shared.base.shape, vec![1]);
        assert_eq!(shared.size, 4);
    }
}
