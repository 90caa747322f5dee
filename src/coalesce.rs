//! Coalescing of storage partitions.
//!
//! Copies between partitions are collected into a cost-ordered candidate
//! list while the conflict graph is built; the coalescer then pops the most
//! valuable candidates first and unions partitions whenever the graph
//! permits. Picking greedily and globally by descending cost gives
//! measurably fewer partitions than going group by group. All rejections
//! are expected control flow and only logged.

use crate::conflict::{build_conflict_graph, ConflictGraph};
use crate::entity::EntityRef;
use crate::groups::{Group, PartitionGroups};
use crate::ir::Function;
use crate::live::LiveInfo;
use crate::varmap::{CompactMode, Partition, VarMap};

/// A list of candidate partition pairs to coalesce, with accumulated costs.
///
/// The list starts in add-mode, where candidates accumulate bucketed by
/// their lower partition so repeated copies of the same pair fold into one
/// entry. [`CoalesceList::sort`] flattens the buckets and switches the list
/// to pop-mode.
pub struct CoalesceList {
    add_mode: bool,
    /// Per lower partition, the paired partitions in ascending order.
    buckets: Vec<Vec<(Partition, i32)>>,
    /// Flattened candidates in ascending cost order, popped from the back.
    sorted: Vec<(Partition, Partition, i32)>,
}

impl CoalesceList {
    /// Create an empty coalesce list over `num_partitions` partitions.
    pub fn new(num_partitions: usize) -> Self {
        Self {
            add_mode: true,
            buckets: vec![Vec::new(); num_partitions],
            sorted: Vec::new(),
        }
    }

    /// Add a potential coalesce between `p1` and `p2` with a cost of
    /// `value`, accumulating onto any earlier additions of the same pair.
    pub fn add(&mut self, p1: Partition, p2: Partition, value: i32) {
        debug_assert!(self.add_mode);
        if p1 == p2 {
            return;
        }
        let (p1, p2) = if p2 < p1 { (p2, p1) } else { (p1, p2) };
        let bucket = &mut self.buckets[p1.index()];
        match bucket.binary_search_by_key(&p2, |&(q, _)| q) {
            Ok(i) => bucket[i].1 += value,
            Err(i) => bucket.insert(i, (p2, value)),
        }
    }

    /// Flatten the buckets and order all candidates so the highest cost
    /// pops first. Must be called once, before popping.
    pub fn sort(&mut self) {
        debug_assert!(self.add_mode);
        self.add_mode = false;
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            let p1 = Partition::new(i);
            for (p2, cost) in bucket.drain(..) {
                self.sorted.push((p1, p2, cost));
            }
        }
        self.sorted.sort_unstable_by_key(|&(_, _, cost)| cost);
    }

    /// Remove and return the best remaining candidate, or `None` when the
    /// list is exhausted.
    pub fn pop_best(&mut self) -> Option<(Partition, Partition, i32)> {
        debug_assert!(!self.add_mode);
        self.sorted.pop()
    }
}

/// Attempt to coalesce the members of `tpa` subject to the conflicts in
/// `graph`.
///
/// With a coalesce list, only the listed candidates are attempted, best
/// first. Without one, every group is reduced as far as the graph allows.
/// Either way coalescing is best effort: a candidate whose groups don't
/// match, whose partitions conflict, or whose union is refused is skipped.
pub fn coalesce_groups<K>(
    tpa: &mut PartitionGroups<K>,
    graph: &mut ConflictGraph,
    map: &mut VarMap,
    func: &Function,
    cl: Option<&mut CoalesceList>,
) {
    // Attempt to coalesce the items on a coalesce list.
    if let Some(cl) = cl {
        while let Some((x, y, cost)) = cl.pop_best() {
            match (tpa.find(x), tpa.find(y)) {
                (Some(w), Some(z)) if w == z => {}
                _ => {
                    log::debug!("coalesce ({}, {}): fail, non-matching groups", x, y);
                    continue;
                }
            }

            // Earlier unions may have moved either partition; resolve both
            // through the current map before looking anything up.
            let var = map
                .partition_to_name(x)
                .expect("coalesce candidate has no representative");
            let tmp = map
                .partition_to_name(y)
                .expect("coalesce candidate has no representative");
            let x = map.var_to_partition(var).expect("stale representative");
            let y = map.var_to_partition(tmp).expect("stale representative");
            if x == y {
                log::debug!("coalesce ({}, {}): already coalesced", x, y);
                continue;
            }
            if graph.conflict(x, y) {
                log::debug!("coalesce ({}, {}): fail, conflict", x, y);
                continue;
            }

            let merged = match map.union(func, var, tmp) {
                Some(p) => p,
                None => {
                    log::debug!("coalesce ({}, {}): unable to union", x, y);
                    continue;
                }
            };

            // The other partition is gone; fold its conflicts over and
            // unlink it from its group.
            if merged == x {
                graph.merge(x, y);
                if let Some(group) = tpa.find(y) {
                    tpa.remove_partition(group, y);
                }
            } else {
                graph.merge(y, x);
                if let Some(group) = tpa.find(x) {
                    tpa.remove_partition(group, x);
                }
            }
            log::debug!("coalesce ({}, {}) cost {}: success -> {}", x, y, cost, merged);
        }
        // When a coalesce list is given, nothing else is attempted.
        return;
    }

    // No list: reduce each group as far as the conflicts allow.
    for gi in 0..tpa.num_groups() {
        let group = Group::new(gi);
        while let Some(head) = tpa.first_partition(group) {
            // Coalesce the first partition with anything that doesn't
            // conflict. Its next link stays usable after removal.
            tpa.remove_partition(group, head);

            let mut var = map
                .partition_to_name(head)
                .expect("grouped partition has no representative");
            // The representative partition `head` currently belongs to.
            let mut p1 = map.var_to_partition(var).expect("stale representative");

            let mut cursor = tpa.next_partition(head);
            while let Some(z) = cursor {
                let next = tpa.next_partition(z);
                let tmp = map
                    .partition_to_name(z)
                    .expect("grouped partition has no representative");
                let p2 = map.var_to_partition(tmp).expect("stale representative");

                if tmp == var {
                    // Already merged into this partition earlier on.
                    tpa.remove_partition(group, z);
                    log::debug!("coalesce ({}, {}): already coalesced", p1, p2);
                } else if !graph.conflict(p1, p2) {
                    if tpa.find(head).is_none() || tpa.find(z).is_none() {
                        log::debug!("coalesce ({}, {}): fail, ungrouped member", p1, p2);
                        cursor = next;
                        continue;
                    }
                    let merged = match map.union(func, var, tmp) {
                        Some(p) => p,
                        None => {
                            log::debug!("coalesce ({}, {}): unable to union", p1, p2);
                            cursor = next;
                            continue;
                        }
                    };
                    tpa.remove_partition(group, z);
                    if merged == p1 {
                        graph.merge(merged, z);
                    } else {
                        // The surviving representative changed sides.
                        graph.merge(merged, head);
                        p1 = merged;
                    }
                    // The representative entity may have changed as well.
                    var = map
                        .partition_to_name(p1)
                        .expect("merged partition has no representative");
                    log::debug!("coalesce: success -> {}", merged);
                } else {
                    log::debug!("coalesce ({}, {}): fail, conflict", p1, p2);
                }
                cursor = next;
            }
        }
    }
}

/// Run the whole storage coalescing pipeline over `func`'s partition map:
/// drop the partitions with nothing to coalesce, compute liveness, group the
/// rest by root variable, build the conflict graph while collecting copies,
/// coalesce best-first, and renumber the surviving partitions densely.
pub fn coalesce_partitions(func: &Function, map: &mut VarMap) {
    map.compact(func, CompactMode::NoSingleDefs);
    if map.num_partitions() == 0 {
        map.compact(func, CompactMode::Normal);
        return;
    }
    let candidates = map.num_partitions();

    let mut live = LiveInfo::compute(map, func);
    live.compute_liveout(map, func);

    let mut rv = PartitionGroups::by_root_var(map, func);
    let mut cl = CoalesceList::new(map.num_partitions());
    let mut graph = build_conflict_graph(&live, &rv, map, func, Some(&mut cl));
    cl.sort();

    coalesce_groups(&mut rv, &mut graph, map, func, Some(&mut cl));

    map.compact(func, CompactMode::Normal);
    log::debug!(
        "coalesced {} candidate partitions; {} partitions remain",
        candidates,
        map.num_partitions()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Type, Value};

    fn analyze(func: &mut Function) -> (VarMap, LiveInfo) {
        let mut map = VarMap::build(func, false);
        map.compact(func, CompactMode::Normal);
        let mut live = LiveInfo::compute(&map, func);
        live.compute_liveout(&map, func);
        (map, live)
    }

    #[test]
    fn list_accumulates_and_pops_descending() {
        let p = |i| Partition::new(i);
        let mut cl = CoalesceList::new(8);
        cl.add(p(3), p(1), 1);
        cl.add(p(1), p(3), 2);
        cl.add(p(0), p(2), 5);
        cl.add(p(4), p(5), 1);
        cl.add(p(5), p(4), 1);
        cl.sort();

        assert_eq!(cl.pop_best(), Some((p(0), p(2), 5)));
        assert_eq!(cl.pop_best(), Some((p(1), p(3), 3)));
        assert_eq!(cl.pop_best(), Some((p(4), p(5), 2)));
        assert_eq!(cl.pop_best(), None);
    }

    #[test]
    fn straight_line_leaves_partitions_alone() {
        // a := 1; b := 2; c := a + b; return c. Three distinct variables,
        // no copies, so there is nothing to coalesce.
        let mut func = Function::new();
        let block = func.make_block();
        let a1 = {
            let var = func.make_var("a", Type::I32);
            func.make_value(var)
        };
        let b1 = {
            let var = func.make_var("b", Type::I32);
            func.make_value(var)
        };
        let c1 = {
            let var = func.make_var("c", Type::I32);
            func.make_value(var)
        };
        func.append_op(block, &[a1], &[]);
        func.append_op(block, &[b1], &[]);
        func.append_op(block, &[c1], &[a1, b1]);
        func.append_op(block, &[], &[c1]);

        let (mut map, live) = analyze(&mut func);
        assert_eq!(map.num_partitions(), 3);

        let mut rv = PartitionGroups::by_root_var(&map, &func);
        let mut cl = CoalesceList::new(map.num_partitions());
        let mut graph = build_conflict_graph(&live, &rv, &map, &func, Some(&mut cl));
        cl.sort();
        assert_eq!(cl.pop_best(), None);

        coalesce_groups(&mut rv, &mut graph, &mut map, &func, None);

        map.compact(&func, CompactMode::Normal);
        assert_eq!(map.num_partitions(), 3);
        assert!(!map.same_partition(a1, b1));
        assert!(!map.same_partition(a1, c1));
    }

    #[test]
    fn copy_chain_coalesces() {
        // a1 := 1; a2 := a1; use(a2). One copy, no overlap: one partition
        // should remain.
        let mut func = Function::new();
        let block = func.make_block();
        let a = func.make_var("a", Type::I32);
        let a1 = func.make_value(a);
        let a2 = func.make_value(a);
        func.append_op(block, &[a1], &[]);
        func.append_copy(block, a2, a1);
        func.append_op(block, &[], &[a2]);

        let mut map = VarMap::build(&mut func, false);
        coalesce_partitions(&func, &mut map);

        assert!(map.same_partition(a1, a2));
        assert_eq!(map.num_partitions(), 1);
    }

    #[test]
    fn interfering_candidate_is_refused() {
        // a3 = φ(a1, a2); use(a1); use(a3): a1 and a3 are both live at the
        // later use, so even an explicit candidate must be rejected.
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

        let (mut map, live) = analyze(&mut func);
        let mut rv = PartitionGroups::by_root_var(&map, &func);
        let mut graph = build_conflict_graph(&live, &rv, &map, &func, None);

        let p1 = map.var_to_partition(a1).unwrap();
        let p3 = map.var_to_partition(a3).unwrap();
        assert!(graph.conflict(p1, p3));

        let mut cl = CoalesceList::new(map.num_partitions());
        cl.add(p1, p3, 1);
        cl.sort();
        coalesce_groups(&mut rv, &mut graph, &mut map, &func, Some(&mut cl));

        assert!(!map.same_partition(a1, a3));
    }

    #[test]
    fn unused_phi_result_refuses_live_through() {
        // a3 = φ(a1, a2) with no use, a4 live through the join block: the
        // edge copies for the φ still clobber a3, so a3 and a4 must not
        // coalesce.
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

        let (mut map, live) = analyze(&mut func);
        let mut rv = PartitionGroups::by_root_var(&map, &func);
        let mut graph = build_conflict_graph(&live, &rv, &map, &func, None);

        let p3 = map.var_to_partition(a3).unwrap();
        let p4 = map.var_to_partition(a4).unwrap();
        let mut cl = CoalesceList::new(map.num_partitions());
        cl.add(p3, p4, 1);
        cl.sort();
        coalesce_groups(&mut rv, &mut graph, &mut map, &func, Some(&mut cl));

        assert!(!map.same_partition(a3, a4));
    }

    #[test]
    fn unguided_mode_reduces_groups() {
        // Three versions of one variable with disjoint live ranges collapse
        // into a single partition without any candidate list.
        let mut func = Function::new();
        let block = func.make_block();
        let a = func.make_var("a", Type::I32);
        let vals: Vec<Value> = (0..3).map(|_| func.make_value(a)).collect();
        func.append_op(block, &[vals[0]], &[]);
        func.append_op(block, &[vals[1]], &[vals[0]]);
        func.append_op(block, &[vals[2]], &[vals[1]]);
        func.append_op(block, &[], &[vals[2]]);

        let (mut map, live) = analyze(&mut func);
        let mut rv = PartitionGroups::by_root_var(&map, &func);
        let mut graph = build_conflict_graph(&live, &rv, &map, &func, None);

        coalesce_groups(&mut rv, &mut graph, &mut map, &func, None);

        assert!(map.same_partition(vals[0], vals[1]));
        assert!(map.same_partition(vals[1], vals[2]));
        map.compact(&func, CompactMode::Normal);
        assert_eq!(map.num_partitions(), 1);
    }

    #[test]
    fn guided_candidates_merge_transitively() {
        // a2 := a1; a3 := a2. Both copies coalesce, and the second
        // candidate must re-resolve its partitions after the first union.
        let mut func = Function::new();
        let block = func.make_block();
        let a = func.make_var("a", Type::I32);
        let a1 = func.make_value(a);
        let a2 = func.make_value(a);
        let a3 = func.make_value(a);
        func.append_op(block, &[a1], &[]);
        func.append_copy(block, a2, a1);
        func.append_copy(block, a3, a2);
        func.append_op(block, &[], &[a3]);

        let mut map = VarMap::build(&mut func, false);
        coalesce_partitions(&func, &mut map);

        assert!(map.same_partition(a1, a2));
        assert!(map.same_partition(a2, a3));
        assert_eq!(map.num_partitions(), 1);
    }
}
