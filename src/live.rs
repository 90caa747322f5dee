//! Live range analysis over SSA partitions.
//!
//! For every partition this computes the set of basic blocks it is live on
//! entry to: a local scan records uses not covered by an earlier def in the
//! same block, then a backward worklist extends those seeds through
//! predecessor edges until it hits the defining block. Live-on-exit sets are
//! derived afterwards, and only on demand.

use crate::entity::EntityRef;
use crate::ir::{Block, Function, Name, Value};
use crate::varmap::{Partition, VarMap};
use cranelift_bitset::CompoundBitSet;

/// Live range information for the partitions of a [`VarMap`].
pub struct LiveInfo {
    num_blocks: usize,

    /// Per partition, the blocks it is live on entry to.
    livein: Vec<CompoundBitSet>,

    /// Per block, the partitions live on exit. Deferred until
    /// [`LiveInfo::compute_liveout`] is called.
    liveout: Option<Vec<CompoundBitSet>>,

    /// Partitions that are live-in to at least one block; these are the
    /// seeds the worklist starts from.
    global: CompoundBitSet,
}

/// If `value` is in a partition of `map`, set that partition's bit in `set`.
fn set_if_valid(map: &VarMap, set: &mut CompoundBitSet, value: Value) {
    if let Some(p) = map.var_to_partition(value) {
        set.insert(p.index());
    }
}

impl LiveInfo {
    /// Calculate the live-on-entry block set of every partition in `map`.
    ///
    /// In debug builds the result is cross-checked against the entry block:
    /// anything live on entry to the function that is not a default def
    /// means an earlier pass left a use without a dominating def, and the
    /// analysis panics after reporting the offenders.
    pub fn compute(map: &VarMap, func: &Function) -> Self {
        let mut live = Self {
            num_blocks: func.num_blocks(),
            livein: (0..map.num_partitions())
                .map(|_| CompoundBitSet::new())
                .collect(),
            liveout: None,
            global: CompoundBitSet::with_capacity(map.num_partitions()),
        };

        let mut saw_def = CompoundBitSet::with_capacity(map.num_partitions());

        for block in func.blocks() {
            saw_def.clear();

            for &phi in func.phis(block) {
                for &(arg, edge_src) in func.phi_args(phi) {
                    // Arguments which either have no def or are not defined
                    // in the block the edge comes from are live on entry to
                    // that block.
                    match func.def_block(arg) {
                        Some(def_block) if def_block == edge_src => {}
                        _ => live.add_livein_if_notdef(map, &saw_def, arg, edge_src),
                    }
                }
            }

            // Don't mark φ results as defined until all the φ-nodes have
            // been processed. If the φ sequence is
            //    a_3 = φ(a_1, a_2)
            //    b_3 = φ(b_1, a_3)
            // the a_3 referred to in b_3's node is the one incoming on the
            // edge, *not* the result just above it.
            for &phi in func.phis(block) {
                set_if_valid(map, &mut saw_def, func.phi_result(phi));
            }

            for &inst in func.block_insts(block) {
                for &arg in func.uses(inst) {
                    live.add_livein_if_notdef(map, &saw_def, arg, block);
                }
                for &def in func.defs(inst) {
                    set_if_valid(map, &mut saw_def, def);
                }
            }
        }

        // Fill in all the live-on-entry blocks between each seed and the
        // def. The stack is shared across partitions.
        let mut stack: Vec<Block> = Vec::with_capacity(func.num_blocks());
        let Self {
            ref global,
            ref mut livein,
            ..
        } = live;
        for p in global.iter() {
            live_worklist(map, func, &mut stack, &mut livein[p], Partition::new(p));
        }

        if cfg!(debug_assertions) {
            live.verify_live_on_entry(map, func);
        }

        live
    }

    /// If `value` has a partition and no def has been seen for it, record it
    /// live on entry to `block` and seed the worklist.
    fn add_livein_if_notdef(
        &mut self,
        map: &VarMap,
        saw_def: &CompoundBitSet,
        value: Value,
        block: Block,
    ) {
        let p = match map.var_to_partition(value) {
            Some(p) => p,
            None => return,
        };
        if !saw_def.contains(p.index()) {
            self.livein[p.index()].insert(block.index());
            self.global.insert(p.index());
        }
    }

    /// Calculate the live-on-exit set of every block from the live-on-entry
    /// information.
    pub fn compute_liveout(&mut self, map: &VarMap, func: &Function) {
        let mut on_exit: Vec<CompoundBitSet> = (0..self.num_blocks)
            .map(|_| CompoundBitSet::new())
            .collect();

        // All φ arguments are live on exit from the edge's source block.
        for block in func.blocks() {
            for &phi in func.phis(block) {
                for &(arg, edge_src) in func.phi_args(phi) {
                    if let Some(p) = map.var_to_partition(arg) {
                        on_exit[edge_src.index()].insert(p.index());
                    }
                }
            }
        }

        // Live on exit from all predecessors of a live-on-entry block.
        for (p, livein) in self.livein.iter().enumerate() {
            for b in livein.iter() {
                for &pred in func.preds(Block::new(b)) {
                    on_exit[pred.index()].insert(p);
                }
            }
        }

        self.liveout = Some(on_exit);
    }

    /// The blocks partition `part` is live on entry to.
    pub fn live_entry_blocks(&self, part: Partition) -> &CompoundBitSet {
        &self.livein[part.index()]
    }

    /// Whether `part` is live on entry to `block`.
    pub fn is_live_on_entry(&self, part: Partition, block: Block) -> bool {
        self.livein[part.index()].contains(block.index())
    }

    /// The partitions live on exit from `block`. Panics unless
    /// [`LiveInfo::compute_liveout`] has run.
    pub fn live_on_exit(&self, block: Block) -> &CompoundBitSet {
        let liveout = self
            .liveout
            .as_ref()
            .expect("live-on-exit was never calculated");
        &liveout[block.index()]
    }

    /// Whether `part` is live-in to any block at all.
    pub fn is_global(&self, part: Partition) -> bool {
        self.global.contains(part.index())
    }

    /// Number of blocks this information covers.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Check for live-on-entry partitions with a real def in the program,
    /// which typically means an earlier optimization broke the SSA form.
    fn verify_live_on_entry(&self, map: &VarMap, func: &Function) {
        let entry = match func.entry_block() {
            Some(entry) => entry,
            None => return,
        };

        let mut num = 0;
        for i in 0..map.num_partitions() {
            let value = match map.partition_to_name(Partition::new(i)) {
                Some(Name::Value(v)) => v,
                _ => continue,
            };
            let stmt = func.value_def(value);
            let default = func.default_def(func.root_var(value));

            if self.is_live_on_entry(Partition::new(i), entry) {
                if let Some(stmt) = stmt {
                    num += 1;
                    log::error!(
                        "{} is defined by {} in {}, but is also live-on-entry \
                         to {}; it appears to have multiple defs",
                        value,
                        stmt,
                        func.block_of(stmt)
                            .map_or("no block".to_string(), |b| b.to_string()),
                        entry
                    );
                } else if default != Some(value) {
                    num += 1;
                    log::error!(
                        "{} is live-on-entry to {} but is not the default def of {}",
                        value,
                        entry,
                        func.var(func.root_var(value)).name
                    );
                }
            } else if default == Some(value) {
                // The only way a default def is legitimately not live on
                // entry is as a φ argument of the entry block itself.
                let in_phi = func.phis(entry).iter().any(|&phi| {
                    func.phi_args(phi).iter().any(|&(arg, _)| arg == value)
                });
                if !in_phi {
                    num += 1;
                    log::error!(
                        "{} is a default def but is not marked live-on-entry to {}",
                        value,
                        entry
                    );
                }
            }
        }

        if num > 0 {
            panic!("{} errors in live-on-entry calculation", num);
        }
    }
}

/// Extend `livein` backwards from its seed blocks to every block between a
/// use and the def of partition `part`.
fn live_worklist(
    map: &VarMap,
    func: &Function,
    stack: &mut Vec<Block>,
    livein: &mut CompoundBitSet,
    part: Partition,
) {
    let def_block = match map.partition_to_name(part) {
        Some(Name::Value(v)) => func.def_block(v),
        _ => None,
    };

    debug_assert!(stack.is_empty());
    stack.extend(livein.iter().map(Block::new));

    while let Some(block) = stack.pop() {
        for &pred in func.preds(block) {
            // It's not live on entry to the block it's defined in.
            if Some(pred) == def_block {
                continue;
            }
            if livein.insert(pred.index()) {
                stack.push(pred);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;

    #[test]
    fn straight_line_has_no_livein() {
        let mut func = Function::new();
        let block = func.make_block();
        let a = func.make_var("a", Type::I32);
        let b = func.make_var("b", Type::I32);
        let a1 = func.make_value(a);
        let b1 = func.make_value(b);
        func.append_op(block, &[a1], &[]);
        func.append_op(block, &[b1], &[a1]);
        func.append_op(block, &[], &[b1]);

        let map = VarMap::build(&mut func, false);
        let live = LiveInfo::compute(&map, &func);

        for v in [a1, b1] {
            let p = map.var_to_partition(v).unwrap();
            assert!(!live.is_global(p));
            assert!(live.live_entry_blocks(p).is_empty());
        }
    }

    #[test]
    fn worklist_reaches_all_paths_between_def_and_use() {
        // b0 defines d, the loop b1 <-> b2 uses it in b2.
        let mut func = Function::new();
        let b0 = func.make_block();
        let b1 = func.make_block();
        let b2 = func.make_block();
        func.add_edge(b0, b1);
        func.add_edge(b1, b2);
        func.add_edge(b2, b1);
        let d = {
            let var = func.make_var("d", Type::I32);
            func.make_value(var)
        };
        func.append_op(b0, &[d], &[]);
        func.append_op(b2, &[], &[d]);

        let map = VarMap::build(&mut func, false);
        let live = LiveInfo::compute(&map, &func);

        let p = map.var_to_partition(d).unwrap();
        assert!(live.is_global(p));
        assert!(live.is_live_on_entry(p, b1));
        assert!(live.is_live_on_entry(p, b2));
        // Never live on entry to its defining block.
        assert!(!live.is_live_on_entry(p, b0));
    }

    #[test]
    fn phi_args_live_out_of_incoming_edge() {
        // a1 from b0 and a2 from b1 merge in b2.
        let mut func = Function::new();
        let b0 = func.make_block();
        let b1 = func.make_block();
        let b2 = func.make_block();
        func.add_edge(b0, b2);
        func.add_edge(b1, b2);
        let a = func.make_var("a", Type::I32);
        let a1 = func.make_value(a);
        let a2 = func.make_value(a);
        let a3 = func.make_value(a);
        func.append_op(b0, &[a1], &[]);
        func.append_op(b1, &[a2], &[]);
        func.append_phi(b2, a3, &[(a1, b0), (a2, b1)]);
        func.append_op(b2, &[], &[a3]);

        let map = VarMap::build(&mut func, false);
        let mut live = LiveInfo::compute(&map, &func);
        live.compute_liveout(&map, &func);

        let p1 = map.var_to_partition(a1).unwrap();
        let p2 = map.var_to_partition(a2).unwrap();
        assert!(live.live_on_exit(b0).contains(p1.index()));
        assert!(!live.live_on_exit(b1).contains(p1.index()));
        assert!(live.live_on_exit(b1).contains(p2.index()));

        // The argument defined in the edge's source is not live-in there.
        assert!(!live.is_live_on_entry(p1, b0));
        assert!(!live.is_live_on_entry(p2, b1));
    }

    #[test]
    fn ordered_phis_use_the_incoming_version() {
        // In the loop header h:
        //    a3 = φ(a1 from e, a2 from l)
        //    b3 = φ(b1 from e, a3 from l)
        // The a3 in b3's node flows in along the back edge, so it must be
        // live on entry to the latch, unaffected by the def just above.
        let mut func = Function::new();
        let e = func.make_block();
        let h = func.make_block();
        let l = func.make_block();
        func.add_edge(e, h);
        func.add_edge(h, l);
        func.add_edge(l, h);
        let a = func.make_var("a", Type::I32);
        let b = func.make_var("b", Type::I32);
        let a1 = func.make_default_def(a);
        let a2 = func.make_value(a);
        let a3 = func.make_value(a);
        let b1 = func.make_default_def(b);
        let b3 = func.make_value(b);
        func.append_phi(h, a3, &[(a1, e), (a2, l)]);
        func.append_phi(h, b3, &[(b1, e), (a3, l)]);
        func.append_op(l, &[a2], &[]);
        func.append_op(l, &[], &[b3]);

        let map = VarMap::build(&mut func, false);
        let live = LiveInfo::compute(&map, &func);

        let p3 = map.var_to_partition(a3).unwrap();
        assert!(live.is_live_on_entry(p3, l));
        // Not live into its own defining block.
        assert!(!live.is_live_on_entry(p3, h));
    }

    #[test]
    fn default_defs_are_live_on_entry() {
        let mut func = Function::new();
        let b0 = func.make_block();
        let b1 = func.make_block();
        func.add_edge(b0, b1);
        let p = func.make_var("p", Type::I64);
        func.var_mut(p).parameter = true;
        let p0 = func.make_default_def(p);
        func.append_op(b1, &[], &[p0]);

        let map = VarMap::build(&mut func, false);
        let live = LiveInfo::compute(&map, &func);

        let part = map.var_to_partition(p0).unwrap();
        assert!(live.is_live_on_entry(part, b0));
        assert!(live.is_live_on_entry(part, b1));
    }
}
