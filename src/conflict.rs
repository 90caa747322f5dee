//! Partition interference graph.
//!
//! Two partitions conflict when they are live at the same program point and
//! belong to the same group; they can then never share storage. Conflicts
//! across groups are never recorded since cross-group coalescing is not
//! attempted in the first place, which keeps the graph small and the
//! whole-block pairwise step linear in the live set instead of quadratic.

use crate::coalesce::CoalesceList;
use crate::entity::EntityRef;
use crate::groups::PartitionGroups;
use crate::ir::{Function, Value};
use crate::live::LiveInfo;
use crate::varmap::{Partition, VarMap};
use cranelift_bitset::CompoundBitSet;

/// An undirected conflict relation over partitions.
pub struct ConflictGraph {
    /// Neighbor set per partition; symmetric.
    edges: Vec<CompoundBitSet>,
}

impl ConflictGraph {
    /// Create an empty graph over `num_partitions` partitions.
    pub fn new(num_partitions: usize) -> Self {
        Self {
            edges: (0..num_partitions).map(|_| CompoundBitSet::new()).collect(),
        }
    }

    /// Record a conflict between `p` and `q`. Self-conflicts are ignored.
    pub fn add(&mut self, p: Partition, q: Partition) {
        if p == q {
            return;
        }
        self.edges[p.index()].insert(q.index());
        self.edges[q.index()].insert(p.index());
    }

    /// Whether `p` and `q` conflict.
    pub fn conflict(&self, p: Partition, q: Partition) -> bool {
        self.edges[p.index()].contains(q.index())
    }

    /// Fold `removed`'s conflicts into `kept` after the two partitions have
    /// been unioned. `removed`'s node becomes empty and no neighbor points
    /// at it any more.
    pub fn merge(&mut self, kept: Partition, removed: Partition) {
        if kept == removed {
            return;
        }
        let neighbors: Vec<usize> = self.edges[removed.index()].iter().collect();
        for n in neighbors {
            self.edges[n].remove(removed.index());
            if n != kept.index() {
                self.edges[n].insert(kept.index());
                self.edges[kept.index()].insert(n);
            }
        }
        self.edges[removed.index()].clear();
        self.edges[kept.index()].remove(removed.index());
    }
}

/// If `value` is in a partition, kill its live bit and record a conflict
/// with every live partition in the same group.
fn add_conflicts_if_valid<K>(
    tpa: &PartitionGroups<K>,
    graph: &mut ConflictGraph,
    map: &VarMap,
    live_now: &mut CompoundBitSet,
    value: Value,
) {
    let p = match map.var_to_partition(value) {
        Some(p) => p,
        None => return,
    };
    live_now.remove(p.index());
    // If find returns nothing, this object isn't interesting.
    let group = match tpa.find(p) {
        Some(group) => group,
        None => return,
    };
    // Only add interferences between objects in the same list.
    for q in tpa.partitions(group) {
        if live_now.contains(q.index()) {
            graph.add(p, q);
        }
    }
}

/// Build the conflict graph for the information in `live`, restricted to
/// partitions sharing a group of `tpa`. Copies encountered on the way are
/// added to `cl` when one is passed in.
///
/// Requires [`LiveInfo::compute_liveout`] to have run.
pub fn build_conflict_graph<K>(
    live: &LiveInfo,
    tpa: &PartitionGroups<K>,
    map: &VarMap,
    func: &Function,
    mut cl: Option<&mut CoalesceList>,
) -> ConflictGraph {
    let mut graph = ConflictGraph::new(map.num_partitions());

    if tpa.num_groups() == 0 {
        return graph;
    }

    let mut live_now = CompoundBitSet::new();

    // Scratch for the whole-block pairwise step, reused across blocks.
    // `tpa_nodes[g]` heads a list of this block's live partitions in group
    // `g`, threaded through `partition_link`; entries are partition+1 so
    // zero means empty. `tpa_to_clear` remembers which groups to reset.
    let mut partition_link = vec![0u32; map.num_partitions() + 1];
    let mut tpa_nodes = vec![0u32; tpa.num_groups()];
    let mut tpa_to_clear: Vec<usize> = Vec::new();

    for block in func.blocks() {
        // Start with the live on exit temporaries.
        live_now.clone_from(live.live_on_exit(block));

        for &inst in func.block_insts(block).iter().rev() {
            let mut is_a_copy = false;

            // A copy between two partitions does not introduce an
            // interference by itself. If it did, nothing that is copied
            // could ever be coalesced; when the two operands really do
            // conflict, they conflict elsewhere in the program as well.
            if let Some((lhs, rhs)) = func.is_copy(inst) {
                if let (Some(p1), Some(p2)) = (
                    map.var_to_partition(lhs),
                    map.var_to_partition(rhs),
                ) {
                    is_a_copy = true;
                    // If the source is live, hide it while the conflicts of
                    // the destination are recorded.
                    let was_live = live_now.remove(p2.index());
                    add_conflicts_if_valid(tpa, &mut graph, map, &mut live_now, lhs);
                    if was_live {
                        live_now.insert(p2.index());
                    }
                    if let Some(cl) = cl.as_deref_mut() {
                        cl.add(p1, p2, 1);
                    }
                    live_now.insert(p2.index());
                }
            }

            if !is_a_copy {
                for &def in func.defs(inst) {
                    add_conflicts_if_valid(tpa, &mut graph, map, &mut live_now, def);
                }
                for &arg in func.uses(inst) {
                    if let Some(p) = map.var_to_partition(arg) {
                        live_now.insert(p.index());
                    }
                }
            }
        }

        // A φ whose result is unused records no conflicts in the walk
        // above, but the translation out of SSA still materializes its
        // copies on the incoming edges. Without these conflicts the result
        // could be coalesced with something live across the block and the
        // materialized copies would clobber it.
        for &phi in func.phis(block) {
            let result = func.phi_result(phi);
            if let Some(p) = map.var_to_partition(result) {
                if !live_now.contains(p.index()) {
                    add_conflicts_if_valid(tpa, &mut graph, map, &mut live_now, result);
                }
            }
        }

        // Anything which is still live at this point interferes. Walk the
        // live set once, linking each partition into its group's list and
        // adding conflicts against the members already seen.
        for x in live_now.iter() {
            if let Some(group) = tpa.find(Partition::new(x)) {
                let start = tpa_nodes[group.index()];
                // A zero start means this group's list is being started;
                // register it for the post-block reset.
                if start == 0 {
                    tpa_to_clear.push(group.index());
                }
                let mut y = start;
                while y != 0 {
                    graph.add(Partition::new(x), Partition::new(y as usize - 1));
                    y = partition_link[y as usize];
                }
                tpa_nodes[group.index()] = x as u32 + 1;
                partition_link[x + 1] = start;
            }
        }

        // Now clear the used group references.
        for &g in &tpa_to_clear {
            tpa_nodes[g] = 0;
        }
        tpa_to_clear.clear();
    }

    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;
    use crate::varmap::CompactMode;

    fn analyze(func: &mut Function) -> (VarMap, LiveInfo) {
        let mut map = VarMap::build(func, false);
        map.compact(func, CompactMode::Normal);
        let mut live = LiveInfo::compute(&map, func);
        live.compute_liveout(&map, func);
        (map, live)
    }

    #[test]
    fn merge_folds_neighbors() {
        let mut graph = ConflictGraph::new(4);
        let p = |i| Partition::new(i);
        graph.add(p(0), p(2));
        graph.add(p(1), p(3));

        graph.merge(p(0), p(1));

        assert!(graph.conflict(p(0), p(2)));
        assert!(graph.conflict(p(0), p(3)));
        assert!(!graph.conflict(p(1), p(3)));
        assert!(!graph.conflict(p(0), p(1)));
    }

    #[test]
    fn copy_operands_do_not_conflict() {
        let mut func = Function::new();
        let block = func.make_block();
        let a = func.make_var("a", Type::I32);
        let a1 = func.make_value(a);
        let a2 = func.make_value(a);
        func.append_op(block, &[a1], &[]);
        func.append_copy(block, a2, a1);
        func.append_op(block, &[], &[a2]);

        let (map, live) = analyze(&mut func);
        let tpa = PartitionGroups::by_root_var(&map, &func);
        let mut cl = CoalesceList::new(map.num_partitions());
        let graph = build_conflict_graph(&live, &tpa, &map, &func, Some(&mut cl));

        let p1 = map.var_to_partition(a1).unwrap();
        let p2 = map.var_to_partition(a2).unwrap();
        assert!(!graph.conflict(p1, p2));

        cl.sort();
        let (c1, c2, cost) = cl.pop_best().expect("copy was seeded");
        assert_eq!((c1, c2), (p1.min(p2), p1.max(p2)));
        assert_eq!(cost, 1);
        assert!(cl.pop_best().is_none());
    }

    #[test]
    fn value_live_past_copy_conflicts() {
        // a2 := a1 but a1 is used again afterwards, so the two overlap.
        let mut func = Function::new();
        let block = func.make_block();
        let a = func.make_var("a", Type::I32);
        let a1 = func.make_value(a);
        let a2 = func.make_value(a);
        func.append_op(block, &[a1], &[]);
        func.append_copy(block, a2, a1);
        func.append_op(block, &[], &[a1, a2]);

        let (map, live) = analyze(&mut func);
        let tpa = PartitionGroups::by_root_var(&map, &func);
        let graph = build_conflict_graph(&live, &tpa, &map, &func, None);

        let p1 = map.var_to_partition(a1).unwrap();
        let p2 = map.var_to_partition(a2).unwrap();
        assert!(graph.conflict(p1, p2));
    }

    #[test]
    fn phi_result_used_after_argument_conflicts() {
        // a3 = φ(a1, a2) followed by a use of a1: both live at that use.
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
        func.append_op(b2, &[], &[a1]);
        func.append_op(b2, &[], &[a3]);

        let (map, live) = analyze(&mut func);
        let tpa = PartitionGroups::by_root_var(&map, &func);
        let graph = build_conflict_graph(&live, &tpa, &map, &func, None);

        let p1 = map.var_to_partition(a1).unwrap();
        let p3 = map.var_to_partition(a3).unwrap();
        assert!(graph.conflict(p1, p3));
    }

    #[test]
    fn unused_phi_result_conflicts_with_live_through() {
        // a3 = φ(a1, a2) is never used, but a4 is live through the join
        // block; the φ's edge copies still clobber a3's storage there.
        let mut func = Function::new();
        let b0 = func.make_block();
        let b1 = func.make_block();
        let b2 = func.make_block();
        let b3 = func.make_block();
        func.add_edge(b0, b1);
        func.add_edge(b0, b2);
        func.add_edge(b1, b2);
        func.add_edge(b2, b3);
        let a = func.make_var("a", Type::I32);
        let a1 = func.make_value(a);
        let a2 = func.make_value(a);
        let a3 = func.make_value(a);
        let a4 = func.make_value(a);
        func.append_op(b0, &[a4], &[]);
        func.append_op(b0, &[a1], &[]);
        func.append_op(b1, &[a2], &[]);
        func.append_phi(b2, a3, &[(a1, b0), (a2, b1)]);
        func.append_op(b3, &[], &[a4]);

        let (map, live) = analyze(&mut func);
        let tpa = PartitionGroups::by_root_var(&map, &func);
        let graph = build_conflict_graph(&live, &tpa, &map, &func, None);

        let p3 = map.var_to_partition(a3).unwrap();
        let p4 = map.var_to_partition(a4).unwrap();
        assert!(graph.conflict(p3, p4));
    }

    #[test]
    fn whole_block_clique_is_group_local() {
        // Two variables live across the same block only conflict with their
        // own group members.
        let mut func = Function::new();
        let b0 = func.make_block();
        let b1 = func.make_block();
        let b2 = func.make_block();
        func.add_edge(b0, b1);
        func.add_edge(b1, b2);
        let a = func.make_var("a", Type::I32);
        let b = func.make_var("b", Type::I32);
        let a1 = func.make_value(a);
        let a2 = func.make_value(a);
        let b1v = func.make_value(b);
        func.append_op(b0, &[a1], &[]);
        func.append_op(b0, &[a2], &[]);
        func.append_op(b0, &[b1v], &[]);
        func.append_op(b2, &[], &[a1, a2, b1v]);

        let (map, live) = analyze(&mut func);
        let tpa = PartitionGroups::by_root_var(&map, &func);
        let graph = build_conflict_graph(&live, &tpa, &map, &func, None);

        let p_a1 = map.var_to_partition(a1).unwrap();
        let p_a2 = map.var_to_partition(a2).unwrap();
        let p_b1 = map.var_to_partition(b1v).unwrap();
        // Same group: recorded by the whole-block walk of b1.
        assert!(graph.conflict(p_a1, p_a2));
        // Cross-group liveness is deliberately not recorded.
        assert!(!graph.conflict(p_a1, p_b1));
        assert!(!graph.conflict(p_a2, p_b1));
    }
}
