//! Grouping of partitions into coalescing-compatible classes.
//!
//! Interference is only interesting between partitions that could legally
//! share storage, so before any conflict analysis the partitions are grouped
//! by a compatibility key: the root program variable they descend from, or
//! their type. Conflict building and coalescing then work group by group and
//! never look across groups.
//!
//! Both flavors share one structure, [`PartitionGroups`], parameterized over
//! the key; they differ only in how a partition is classified. Each group is
//! a singly-linked list of partitions threaded through `next_partition`.

use crate::entity::packed_option::PackedOption;
use crate::entity::{entity_impl, EntityRef, SecondaryMap};
use crate::ir::{Function, Name, Type, Var};
use crate::varmap::{Partition, VarMap};
use cranelift_bitset::CompoundBitSet;

/// An opaque reference to a partition group.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Group(u32);
entity_impl!(Group, "group");

/// Partitions associated into groups by a shared key.
pub struct PartitionGroups<K> {
    /// The grouping key of each group.
    keys: Vec<K>,

    /// Head of each group's partition list.
    first_partition: Vec<PackedOption<Partition>>,

    /// Next partition in the same group. Removal leaves this link intact so
    /// an iteration that removed its current partition can still advance.
    next_partition: SecondaryMap<Partition, PackedOption<Partition>>,

    /// Owning group of each partition.
    partition_to_group: SecondaryMap<Partition, PackedOption<Group>>,

    /// Number of live groups; compaction shrinks this without shrinking the
    /// arrays.
    num_groups: usize,

    /// Group count before compaction, once compacted.
    uncompressed_num: Option<usize>,
}

impl<K> PartitionGroups<K> {
    fn empty() -> Self {
        Self {
            keys: Vec::new(),
            first_partition: Vec::new(),
            next_partition: SecondaryMap::new(),
            partition_to_group: SecondaryMap::new(),
            num_groups: 0,
            uncompressed_num: None,
        }
    }

    fn push_group(&mut self, key: K, first: Partition) -> Group {
        let group = Group::new(self.num_groups);
        debug_assert_eq!(self.keys.len(), self.num_groups);
        self.keys.push(key);
        self.first_partition.push(first.into());
        self.partition_to_group[first] = group.into();
        self.num_groups += 1;
        group
    }

    fn link_partition(&mut self, group: Group, part: Partition) {
        self.next_partition[part] = self.first_partition[group.index()];
        self.first_partition[group.index()] = part.into();
        self.partition_to_group[part] = group.into();
    }

    /// The group owning `part`, or `None` if `part` was never grouped.
    pub fn find(&self, part: Partition) -> Option<Group> {
        self.partition_to_group[part].expand()
    }

    /// The first partition of `group`'s list.
    pub fn first_partition(&self, group: Group) -> Option<Partition> {
        self.first_partition[group.index()].expand()
    }

    /// The partition following `part` in its group's list.
    pub fn next_partition(&self, part: Partition) -> Option<Partition> {
        self.next_partition[part].expand()
    }

    /// The grouping key of `group`.
    pub fn key(&self, group: Group) -> &K {
        &self.keys[group.index()]
    }

    /// Number of groups.
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// The group count before [`PartitionGroups::compact`] dropped the
    /// single-member groups.
    pub fn uncompressed_num(&self) -> Option<usize> {
        self.uncompressed_num
    }

    /// Iterate over the groups.
    pub fn groups(&self) -> impl Iterator<Item = Group> + '_ {
        (0..self.num_groups).map(Group::new)
    }

    /// Iterate over the partitions of `group`.
    pub fn partitions(&self, group: Group) -> Partitions<'_, K> {
        Partitions {
            groups: self,
            next: self.first_partition[group.index()],
        }
    }

    /// Whether `group` currently holds more than one partition.
    fn is_multi(&self, group: Group) -> bool {
        self.first_partition(group)
            .map_or(false, |first| self.next_partition(first).is_some())
    }

    /// Unlink `part` from `group`'s list. `part`'s own next link is left in
    /// place.
    pub fn remove_partition(&mut self, group: Group, part: Partition) {
        if self.first_partition(group) == Some(part) {
            self.first_partition[group.index()] = self.next_partition[part];
            return;
        }
        let mut cursor = self.first_partition(group);
        while let Some(i) = cursor {
            if self.next_partition(i) == Some(part) {
                self.next_partition[i] = self.next_partition[part];
                break;
            }
            cursor = self.next_partition(i);
        }
    }

    /// Move all single-member groups behind the live range `0..num_groups`,
    /// keeping only groups that contain a coalesce opportunity. The original
    /// count is preserved and available through
    /// [`PartitionGroups::uncompressed_num`]. Returns the index of the last
    /// remaining multi-member group.
    pub fn compact(&mut self) -> usize {
        if self.num_groups == 0 {
            self.uncompressed_num = Some(0);
            return 0;
        }

        // Find the last list which has more than one partition.
        let mut last = self.num_groups - 1;
        while last > 0 && !self.is_multi(Group::new(last)) {
            last -= 1;
        }

        let mut x = 0;
        while x < last {
            if !self.is_multi(Group::new(x)) {
                // Swap with the current end. The departing entry holds at
                // most one partition, so only its owner pointer needs
                // fixing; the arriving multi-member list gets rewritten.
                self.keys.swap(x, last);
                self.first_partition.swap(x, last);
                if let Some(single) = self.first_partition(Group::new(last)) {
                    self.partition_to_group[single] = Group::new(last).into();
                }
                let mut cursor = self.first_partition(Group::new(x));
                while let Some(p) = cursor {
                    self.partition_to_group[p] = Group::new(x).into();
                    cursor = self.next_partition(p);
                }

                last -= 1;
                while last > x && !self.is_multi(Group::new(last)) {
                    last -= 1;
                }
            }
            x += 1;
        }

        if self.is_multi(Group::new(x)) {
            x += 1;
        }
        self.uncompressed_num = Some(self.num_groups);
        self.num_groups = x;
        last
    }
}

/// Iterator over the partitions of one group.
pub struct Partitions<'a, K> {
    groups: &'a PartitionGroups<K>,
    next: PackedOption<Partition>,
}

impl<'a, K> Iterator for Partitions<'a, K> {
    type Item = Partition;

    fn next(&mut self) -> Option<Partition> {
        let part = self.next.expand()?;
        self.next = self.groups.next_partition[part];
        Some(part)
    }
}

impl PartitionGroups<Var> {
    /// Group the partitions of `map` by their root program variable.
    ///
    /// Partitions are walked from last to first so each group's list comes
    /// out in ascending partition order.
    pub fn by_root_var(map: &VarMap, func: &Function) -> Self {
        let num_partitions = map.num_partitions();
        let mut groups = Self::empty();
        let mut seen = CompoundBitSet::with_capacity(num_partitions);
        let mut group_of_var: SecondaryMap<Var, PackedOption<Group>> = SecondaryMap::new();

        for x in (0..num_partitions).rev() {
            // The map may not be compacted yet, so unregistered entries can
            // still show up here.
            let name = match map.partition_to_name(Partition::new(x)) {
                Some(name) => name,
                None => continue,
            };
            let part = match map.var_to_partition(name) {
                Some(part) => part,
                None => continue,
            };

            // Only enter coalesced partitions into the list once.
            if !seen.insert(part.index()) {
                continue;
            }

            let root = match name {
                Name::Value(v) => func.root_var(v),
                Name::Var(v) => v,
            };
            match group_of_var[root].expand() {
                Some(group) => groups.link_partition(group, part),
                None => {
                    let group = groups.push_group(root, part);
                    group_of_var[root] = group.into();
                }
            }
        }

        groups
    }
}

impl PartitionGroups<Type> {
    /// Group the partitions of `map` by the type of their representative.
    ///
    /// Storage that must keep its declared shape is left out: volatiles,
    /// function results, parameters, register-qualified declarations,
    /// declarations already assigned hard storage, and user-visible
    /// (non-artificial) declarations.
    pub fn by_type(map: &VarMap, func: &Function) -> Self {
        let num_partitions = map.num_partitions();
        let mut groups = Self::empty();
        let mut seen = CompoundBitSet::with_capacity(num_partitions);

        for x in (0..num_partitions).rev() {
            let name = match map.partition_to_name(Partition::new(x)) {
                Some(name) => name,
                None => continue,
            };
            let var = match name {
                Name::Value(v) => func.root_var(v),
                Name::Var(v) => v,
            };
            let decl = func.var(var);
            if decl.volatile
                || decl.result
                || decl.parameter
                || decl.register
                || decl.hard_storage
                || !decl.artificial
            {
                continue;
            }

            let part = match map.var_to_partition(name) {
                Some(part) => part,
                None => continue,
            };
            if !seen.insert(part.index()) {
                continue;
            }

            // Find the list for this type.
            let key = decl.ty;
            let existing = groups.groups().find(|&g| *groups.key(g) == key);
            match existing {
                Some(group) => groups.link_partition(group, part),
                None => {
                    groups.push_group(key, part);
                }
            }
        }

        groups
    }
}
