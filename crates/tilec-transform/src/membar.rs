//! Synchronization insertion.
//!
//! Inserts barriers and async-copy waits so every shared-memory access
//! observes a correctly ordered view, and no more of them than the hazards
//! require. The pass is a forward dataflow analysis over the CFG in reverse
//! post-order, swept to a fixed point (a sweep with no insertions):
//!
//! * `async_write` — in-flight asynchronous copies, in issue order. A read
//!   that aliases one of them needs an `AsyncWait` deep enough to retire the
//!   producing copy, followed by a barrier.
//! * `sync_write` — synchronous shared writes not yet separated from
//!   subsequent reads by a barrier (read-after-write hazards).
//! * `sync_read` — shared reads not yet separated from subsequent writes
//!   (write-after-read hazards).
//!
//! Aliasing is byte-range intersection over the offsets the allocator
//! assigned, so buffers placed apart never force a barrier. Writes that
//! refill a double-buffered tile are exempt from the WAR check (the rotation
//! guarantees the previous read targeted the other half) unless the target
//! demands conservative WAR ordering.
//!
//! Insertions go through a staged [`EditList`] per block, applied after the
//! block is scanned.

use log::debug;
use thiserror::Error;
use tilec_analysis::{Allocation, Layout, LayoutId, Layouts};
use tilec_ir::{
    cfg, BasicBlock, EditList, Function, Handle, HandleMap, InstKind, Target, Type, Value,
};

/// Errors produced by synchronization insertion.
#[derive(Debug, Error)]
pub enum MembarError {
    /// A shared buffer involved in a hazard check has no assigned offset.
    #[error("shared buffer {0} was never assigned an offset")]
    UnallocatedBuffer(LayoutId),
    /// The insertion sweep kept finding new hazards past the iteration
    /// bound.
    #[error("barrier placement in `{0}` did not reach a fixed point")]
    NoFixedPoint(String),
}

/// Dataflow state at one program point.
#[derive(Clone, Debug, Default, PartialEq)]
struct State {
    async_write: Vec<Handle<Value>>,
    sync_write: Vec<Handle<Value>>,
    sync_read: Vec<Handle<Value>>,
}

impl State {
    fn join(&mut self, other: &State) {
        for &v in &other.async_write {
            if !self.async_write.contains(&v) {
                self.async_write.push(v);
            }
        }
        for &v in &other.sync_write {
            if !self.sync_write.contains(&v) {
                self.sync_write.push(v);
            }
        }
        for &v in &other.sync_read {
            if !self.sync_read.contains(&v) {
                self.sync_read.push(v);
            }
        }
    }
}

/// The synchronization-insertion pass.
pub struct Membar<'a> {
    layouts: &'a Layouts,
    allocation: &'a Allocation,
    target: &'a Target,
}

impl<'a> Membar<'a> {
    pub fn new(layouts: &'a Layouts, allocation: &'a Allocation, target: &'a Target) -> Self {
        Self {
            layouts,
            allocation,
            target,
        }
    }

    /// Inserts the required barriers and waits. Returns how many
    /// instructions were inserted.
    pub fn run(&self, func: &mut Function) -> Result<usize, MembarError> {
        let rpo = cfg::reverse_post_order(func);
        let preds = cfg::predecessors(func);
        let safe_war = self.safe_war();
        let mut exit: HandleMap<BasicBlock, State> = HandleMap::new();
        let mut total = 0usize;

        // Each sweep either settles or inserts; insertions are bounded by
        // the hazards present, so the cap only trips on a pass defect.
        let max_rounds = func.blocks.len() + 8;
        for _ in 0..max_rounds {
            let mut inserted = false;
            for &block in &rpo {
                let mut state = State::default();
                for &pred in preds.get(block).map(Vec::as_slice).unwrap_or(&[]) {
                    if let Some(s) = exit.get(pred) {
                        state.join(s);
                    }
                }
                let plan = self.transfer(func, block, &mut state, &safe_war, &mut inserted)?;
                if !plan.is_empty() {
                    total += plan.len();
                    let mut edits = EditList::new();
                    for (idx, kind) in plan {
                        let v = func.make_inst(kind, Type::VOID);
                        edits.insert_before(idx, v);
                    }
                    edits.apply(&mut func.blocks[block]);
                }
                exit.insert(block, state);
            }
            if !inserted {
                if total > 0 {
                    debug!(
                        "membar inserted {total} synchronization instructions in `{}`",
                        func.name
                    );
                }
                return Ok(total);
            }
        }
        Err(MembarError::NoFixedPoint(func.name.clone()))
    }

    /// Walks one block, updating `state` and planning insertions as
    /// `(index, instruction)` pairs against the current instruction list.
    fn transfer(
        &self,
        func: &Function,
        block: Handle<BasicBlock>,
        state: &mut State,
        safe_war: &HandleMap<Value, ()>,
        inserted: &mut bool,
    ) -> Result<Vec<(usize, InstKind)>, MembarError> {
        let mut plan = Vec::new();
        for (idx, &inst) in func.blocks[block].insts.iter().enumerate() {
            let Some(kind) = func.values[inst].inst() else {
                continue;
            };
            if kind.as_phi().is_some() {
                continue;
            }
            let mut wait_n = kind.as_async_wait();
            let mut have_barrier = kind.is_barrier();

            if kind.is_masked_load_async() && !state.async_write.contains(&inst) {
                state.async_write.push(inst);
            }
            if kind.is_copy_to_shared() && !state.sync_write.contains(&inst) {
                state.sync_write.push(inst);
            }
            let reads: Vec<Handle<Value>> = kind
                .operands()
                .into_iter()
                .filter(|&op| self.layouts.get(op).is_some_and(Layout::is_shared))
                .collect();

            // Async RAW: wait until the copy producing the read (and every
            // copy issued before it) has retired.
            let mut newest: Option<usize> = None;
            for &r in &reads {
                let mut aliases = false;
                for &w in &state.async_write {
                    if self.values_overlap(r, w)? {
                        aliases = true;
                    }
                }
                if aliases {
                    let mut visited = Vec::new();
                    let g = self.producer_of(func, r, &state.async_write, &mut visited);
                    let slot = state
                        .async_write
                        .iter()
                        .position(|&w| w == g)
                        .unwrap_or(state.async_write.len());
                    newest = Some(newest.map_or(slot, |n| n.max(slot)));
                }
            }
            if let Some(slot) = newest {
                if slot < state.async_write.len() {
                    let n = (state.async_write.len() - 1 - slot) as u32;
                    plan.push((idx, InstKind::AsyncWait { n }));
                    plan.push((idx, InstKind::Barrier));
                    *inserted = true;
                    wait_n = Some(n);
                    have_barrier = true;
                }
            }

            // Sync RAW and WAR need a plain barrier.
            if !have_barrier {
                let mut raw = false;
                for &r in &reads {
                    for &w in &state.sync_write {
                        if self.values_overlap(r, w)? {
                            raw = true;
                        }
                    }
                }
                let mut war = false;
                if kind.writes_shared()
                    && (self.target.conservative_war || !safe_war.contains(inst))
                {
                    for &r in &state.sync_read {
                        if self.values_overlap(inst, r)? {
                            war = true;
                        }
                    }
                }
                if raw || war {
                    plan.push((idx, InstKind::Barrier));
                    *inserted = true;
                    have_barrier = true;
                }
            }

            if let Some(n) = wait_n {
                let drain = state.async_write.len().saturating_sub(n as usize);
                state.async_write.drain(..drain);
            }
            if have_barrier {
                state.sync_write.clear();
                state.sync_read.clear();
            }
            for &r in &reads {
                if !state.sync_read.contains(&r) {
                    state.sync_read.push(r);
                }
            }
        }
        Ok(plan)
    }

    /// Values whose writes never WAR-conflict: members of double-buffered
    /// layouts other than the rotating phi itself.
    fn safe_war(&self) -> HandleMap<Value, ()> {
        let mut safe = HandleMap::new();
        for (_, shared) in self.layouts.shareds() {
            let Some(db) = shared.double_buffer else { continue };
            for &v in &shared.base.values {
                if v != db.phi {
                    safe.insert(v, ());
                }
            }
        }
        safe
    }

    /// Resolves a shared read back to the async copy that fills it: a
    /// double-buffered phi maps to its pre-loop fill, other phis to the
    /// newest producer among their incoming values.
    fn producer_of(
        &self,
        func: &Function,
        v: Handle<Value>,
        async_write: &[Handle<Value>],
        visited: &mut Vec<Handle<Value>>,
    ) -> Handle<Value> {
        let Some(incoming) = func.values[v].inst().and_then(InstKind::as_phi) else {
            return v;
        };
        if visited.contains(&v) {
            return v;
        }
        visited.push(v);
        if let Some(shared) = self.layouts.get(v).and_then(Layout::to_shared) {
            if let Some(db) = shared.double_buffer {
                return db.first;
            }
        }
        let slot = |x: Handle<Value>| {
            async_write
                .iter()
                .position(|&w| w == x)
                .unwrap_or(async_write.len())
        };
        let mut best = v;
        let mut best_slot: Option<usize> = None;
        for &(_, inc) in incoming {
            let g = self.producer_of(func, inc, async_write, visited);
            let s = slot(g);
            if best_slot.map_or(true, |b| s > b) {
                best = g;
                best_slot = Some(s);
            }
        }
        best
    }

    /// Byte ranges a value occupies in shared memory: its group's buffer
    /// and, for data-exchange instructions, their scratch buffer.
    fn ranges(&self, v: Handle<Value>) -> Result<Vec<(u32, u32)>, MembarError> {
        let mut out = Vec::new();
        let mut push = |id: LayoutId, out: &mut Vec<(u32, u32)>| -> Result<(), MembarError> {
            if let Some(shared) = self.layouts.by_id(id).to_shared() {
                let start = self
                    .allocation
                    .offset_of(id)
                    .ok_or(MembarError::UnallocatedBuffer(id))?;
                out.push((start, start + shared.size));
            }
            Ok(())
        };
        if let Some(id) = self.layouts.group_of(v) {
            push(id, &mut out)?;
        }
        if let Some(id) = self.layouts.tmp_id(v) {
            push(id, &mut out)?;
        }
        Ok(out)
    }

    fn values_overlap(&self, a: Handle<Value>, b: Handle<Value>) -> Result<bool, MembarError> {
        let ra = self.ranges(a)?;
        let rb = self.ranges(b)?;
        Ok(ra
            .iter()
            .any(|&(s0, e0)| rb.iter().any(|&(s1, e1)| s0 < e1 && s1 < e0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilec_analysis::{Align, Axes, Liveness};
    use tilec_ir::{Scalar, Terminator, Type, ValueDef};

    fn analyze(func: &Function, target: &Target) -> (Layouts, Allocation) {
        let axes = Axes::run(func);
        let align = Align::run(func);
        let layouts = Layouts::run(func, &axes, &align, 4, target).unwrap();
        let liveness = Liveness::run(func, &layouts);
        let allocation = Allocation::run(&layouts, &liveness);
        (layouts, allocation)
    }

    fn barrier_count(f: &Function, b: Handle<BasicBlock>) -> usize {
        f.blocks[b]
            .insts
            .iter()
            .filter(|&&i| f.values[i].inst().is_some_and(InstKind::is_barrier))
            .count()
    }

    #[test]
    fn raw_hazard_gets_one_barrier_before_the_read() {
        let mut f = Function::new("k");
        let blk = f.add_block("entry");
        let a_ty = Type::tile(Scalar::F16, vec![64, 16]);
        let b_ty = Type::tile(Scalar::F16, vec![16, 64]);
        let c_ty = Type::tile(Scalar::F32, vec![64, 64]);
        let a_in = f.add_argument("a", a_ty.clone(), None);
        let b_in = f.add_argument("b", b_ty.clone(), None);
        let acc = f.add_argument("acc", c_ty.clone(), None);
        let sa = f.add_inst(blk, InstKind::CopyToShared { src: a_in }, a_ty);
        let sb = f.add_inst(blk, InstKind::CopyToShared { src: b_in }, b_ty);
        let d = f.add_inst(
            blk,
            InstKind::Dot {
                a: sa,
                b: sb,
                c: acc,
            },
            c_ty,
        );
        f.set_terminator(blk, Terminator::Return { value: None });

        let target = Target::gpu_gen1();
        let (layouts, allocation) = analyze(&f, &target);
        let membar = Membar::new(&layouts, &allocation, &target);
        assert_eq!(membar.run(&mut f).unwrap(), 1);

        let insts = &f.blocks[blk].insts;
        assert_eq!(insts.len(), 4);
        assert!(f.values[insts[2]].inst().unwrap().is_barrier());
        assert_eq!(insts[3], d);

        // Idempotent: the barrier now satisfies the hazard.
        let membar = Membar::new(&layouts, &allocation, &target);
        assert_eq!(membar.run(&mut f).unwrap(), 0);
    }

    #[test]
    fn existing_barrier_in_predecessor_block_suffices() {
        let mut f = Function::new("k");
        let fill = f.add_block("fill");
        let compute = f.add_block("compute");
        let a_ty = Type::tile(Scalar::F16, vec![64, 16]);
        let b_ty = Type::tile(Scalar::F16, vec![16, 64]);
        let c_ty = Type::tile(Scalar::F32, vec![64, 64]);
        let a_in = f.add_argument("a", a_ty.clone(), None);
        let b_in = f.add_argument("b", b_ty.clone(), None);
        let acc = f.add_argument("acc", c_ty.clone(), None);
        let sa = f.add_inst(fill, InstKind::CopyToShared { src: a_in }, a_ty);
        let sb = f.add_inst(fill, InstKind::CopyToShared { src: b_in }, b_ty);
        f.add_inst(fill, InstKind::Barrier, Type::VOID);
        f.add_inst(
            compute,
            InstKind::Dot {
                a: sa,
                b: sb,
                c: acc,
            },
            c_ty,
        );
        f.set_terminator(fill, Terminator::Branch { dest: compute });
        f.set_terminator(compute, Terminator::Return { value: None });

        let target = Target::gpu_gen1();
        let (layouts, allocation) = analyze(&f, &target);
        let membar = Membar::new(&layouts, &allocation, &target);
        assert_eq!(membar.run(&mut f).unwrap(), 0);
    }

    #[test]
    fn async_reads_wait_for_their_producers() {
        let mut f = Function::new("k");
        let blk = f.add_block("entry");
        let a_ty = Type::tile(Scalar::F16, vec![64, 16]);
        let b_ty = Type::tile(Scalar::F16, vec![16, 64]);
        let c_ty = Type::tile(Scalar::F32, vec![64, 64]);
        let pa = f.add_argument("pa", Type::ptr_tile(Scalar::F16, vec![64, 16]), None);
        let pb = f.add_argument("pb", Type::ptr_tile(Scalar::F16, vec![16, 64]), None);
        let ma = f.add_argument("ma", Type::tile(Scalar::BOOL, vec![64, 16]), None);
        let mb = f.add_argument("mb", Type::tile(Scalar::BOOL, vec![16, 64]), None);
        let fa = f.add_argument("fa", a_ty.clone(), None);
        let fb = f.add_argument("fb", b_ty.clone(), None);
        let acc = f.add_argument("acc", c_ty.clone(), None);
        let sa = f.add_inst(
            blk,
            InstKind::MaskedLoadAsync {
                ptr: pa,
                mask: ma,
                fallback: fa,
            },
            a_ty,
        );
        let sb = f.add_inst(
            blk,
            InstKind::MaskedLoadAsync {
                ptr: pb,
                mask: mb,
                fallback: fb,
            },
            b_ty,
        );
        let d = f.add_inst(
            blk,
            InstKind::Dot {
                a: sa,
                b: sb,
                c: acc,
            },
            c_ty,
        );
        f.set_terminator(blk, Terminator::Return { value: None });

        let target = Target::gpu_gen2();
        let (layouts, allocation) = analyze(&f, &target);
        let membar = Membar::new(&layouts, &allocation, &target);
        assert_eq!(membar.run(&mut f).unwrap(), 2);

        // async_wait(0): both copies must retire before the dot reads.
        let insts = &f.blocks[blk].insts;
        assert_eq!(insts.len(), 5);
        assert_eq!(
            f.values[insts[2]].inst().unwrap().as_async_wait(),
            Some(0)
        );
        assert!(f.values[insts[3]].inst().unwrap().is_barrier());
        assert_eq!(insts[4], d);
    }

    #[test]
    fn read_of_the_oldest_copy_leaves_newer_copies_in_flight() {
        let mut f = Function::new("k");
        let blk = f.add_block("entry");
        let ty = Type::tile(Scalar::F16, vec![64, 16]);
        let mask_ty = Type::tile(Scalar::BOOL, vec![64, 16]);
        let ptr_ty = Type::ptr_tile(Scalar::F16, vec![64, 16]);
        let p = f.add_argument("p", ptr_ty, None);
        let m = f.add_argument("m", mask_ty, None);
        let fb = f.add_argument("fb", ty.clone(), None);
        let mla = |f: &mut Function| {
            f.add_inst(
                blk,
                InstKind::MaskedLoadAsync {
                    ptr: p,
                    mask: m,
                    fallback: fb,
                },
                ty.clone(),
            )
        };
        let a = mla(&mut f);
        let _b = mla(&mut f);
        let _c = mla(&mut f);
        let read = f.add_inst(blk, InstKind::Recoalesce { src: a }, ty.clone());
        f.set_terminator(blk, Terminator::Return { value: None });

        let target = Target::gpu_gen2();
        let (layouts, allocation) = analyze(&f, &target);
        let membar = Membar::new(&layouts, &allocation, &target);
        assert_eq!(membar.run(&mut f).unwrap(), 2);

        // Only the oldest of the three copies is read, so two may stay
        // outstanding.
        let insts = &f.blocks[blk].insts;
        assert_eq!(f.values[insts[3]].inst().unwrap().as_async_wait(), Some(2));
        assert!(f.values[insts[4]].inst().unwrap().is_barrier());
        assert_eq!(insts[5], read);
    }

    #[test]
    fn war_hazard_gets_a_barrier_before_the_overwrite() {
        let mut f = Function::new("k");
        let blk = f.add_block("entry");
        let ty = Type::tile(Scalar::F32, vec![32]);
        let x = f.add_argument("x", ty.clone(), None);
        let sh_1 = f.add_inst(blk, InstKind::CopyToShared { src: x }, ty.clone());
        let y = f.add_inst(blk, InstKind::Recoalesce { src: sh_1 }, ty.clone());
        let sh_2 = f.add_inst(blk, InstKind::CopyToShared { src: y }, ty);
        f.set_terminator(blk, Terminator::Return { value: None });

        let target = Target::gpu_gen1();
        let (layouts, allocation) = analyze(&f, &target);
        // Disjoint lifetimes place both buffers at the same offset, so the
        // refill must wait for the read.
        assert_eq!(
            allocation.offset_of(layouts.group_of(sh_1).unwrap()),
            allocation.offset_of(layouts.group_of(sh_2).unwrap())
        );
        let membar = Membar::new(&layouts, &allocation, &target);
        // One barrier for the read-after-write, one for the write-after-read.
        assert_eq!(membar.run(&mut f).unwrap(), 2);
        let insts = &f.blocks[blk].insts;
        assert!(f.values[insts[1]].inst().unwrap().is_barrier());
        assert_eq!(insts[2], y);
        assert!(f.values[insts[3]].inst().unwrap().is_barrier());
        assert_eq!(insts[4], sh_2);
    }

    #[test]
    fn writes_to_disjoint_ranges_need_no_barrier() {
        let mut f = Function::new("k");
        let blk = f.add_block("entry");
        let ty = Type::tile(Scalar::F32, vec![32]);
        let x = f.add_argument("x", ty.clone(), None);
        let sh_read = f.add_inst(blk, InstKind::CopyToShared { src: x }, ty.clone());
        f.add_inst(blk, InstKind::Barrier, Type::VOID);
        let sh_other = f.add_inst(blk, InstKind::CopyToShared { src: x }, ty.clone());
        let r = f.add_inst(blk, InstKind::Recoalesce { src: sh_read }, ty);
        f.set_terminator(blk, Terminator::Return { value: None });

        let target = Target::gpu_gen1();
        let axes = Axes::run(&f);
        let align = Align::run(&f);
        let layouts = Layouts::run(&f, &axes, &align, 4, &target).unwrap();
        let id_read = layouts.group_of(sh_read).unwrap();
        let id_other = layouts.group_of(sh_other).unwrap();

        // The unsynchronized write lands in [128, 256); the read targets
        // [0, 128). Disjoint bytes, no hazard.
        let apart = Allocation::with_offsets(layouts.len(), &[(id_read, 0), (id_other, 128)]);
        let mut g = f.clone();
        let membar = Membar::new(&layouts, &apart, &target);
        assert_eq!(membar.run(&mut g).unwrap(), 0);

        // Same program with both buffers at offset 0: the write now clobbers
        // the bytes the read needs, so a barrier lands before the read.
        let stacked = Allocation::with_offsets(layouts.len(), &[(id_read, 0), (id_other, 0)]);
        let membar = Membar::new(&layouts, &stacked, &target);
        assert_eq!(membar.run(&mut f).unwrap(), 1);
        let insts = &f.blocks[blk].insts;
        assert!(f.values[insts[3]].inst().unwrap().is_barrier());
        assert_eq!(insts[4], r);
    }

    fn double_buffer_loop() -> (Function, Handle<BasicBlock>) {
        let mut f = Function::new("k");
        let entry = f.add_block("entry");
        let body = f.add_block("body");
        let exit = f.add_block("exit");
        let ty = Type::tile(Scalar::F16, vec![16, 64]);
        let x = f.add_argument("x", ty.clone(), None);
        let cond = f.add_argument("c", Type::scalar(Scalar::BOOL), None);
        let first = f.add_inst(entry, InstKind::CopyToShared { src: x }, ty.clone());
        let phi = f.add_inst(body, InstKind::Phi { incoming: vec![] }, ty.clone());
        let _read = f.add_inst(body, InstKind::Recoalesce { src: phi }, ty.clone());
        let second = f.add_inst(body, InstKind::CopyToShared { src: x }, ty);
        if let ValueDef::Inst(InstKind::Phi { incoming }) = &mut f.values[phi].def {
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
        (f, body)
    }

    #[test]
    fn double_buffered_refill_skips_the_war_barrier() {
        let (mut f, body) = double_buffer_loop();
        let target = Target::gpu_gen1();
        let (layouts, allocation) = analyze(&f, &target);
        let membar = Membar::new(&layouts, &allocation, &target);
        membar.run(&mut f).unwrap();
        // Only the RAW barrier before the read; the rotating refill is safe.
        assert_eq!(barrier_count(&f, body), 1);
    }

    #[test]
    fn conservative_targets_still_barrier_refills() {
        let (mut f, body) = double_buffer_loop();
        let mut target = Target::gpu_gen1();
        target.conservative_war = true;
        let (layouts, allocation) = analyze(&f, &target);
        let membar = Membar::new(&layouts, &allocation, &target);
        membar.run(&mut f).unwrap();
        // RAW barrier before the read plus the WAR barrier before the
        // refill.
        assert_eq!(barrier_count(&f, body), 2);
    }
}
