//! Mapping from SSA value versions to storage partitions.
//!
//! This is where the translation out of SSA form tracks which versions may
//! share one storage location. All versions of the same variable may not
//! ultimately be mapped back to the same storage: when live ranges overlap,
//! one of them needs a new home. The [`VarMap`] owns the disjoint-set
//! structure over versions, the representative entity of each partition, and
//! the compaction maps that renumber partitions into a dense range so the
//! bitmaps downstream stay small.
//!
//! Compaction never affects partition membership. Once partitions are
//! created and possibly merged, compacting one or more times only changes
//! their indices; the same versions remain members of the same groups. This
//! allows the coalescer to work on a reduced set (partitions with two or
//! more definitions) and recompact later to include everything.

use crate::entity::packed_option::PackedOption;
use crate::entity::{entity_impl, EntityRef, SecondaryMap};
use crate::groups::PartitionGroups;
use crate::ir::{Function, Name, Value, Var};
use crate::unionfind::UnionFind;
use cranelift_bitset::CompoundBitSet;

/// An opaque reference to a storage partition.
///
/// Partition indices live in two numbering regimes: before compaction a
/// partition is named by the index of its representative version, afterwards
/// by a dense index in `0..num_partitions`. A `Partition` value is only
/// meaningful under the numbering current at the time it was produced;
/// after a union or a compaction, stale indices must be re-resolved through
/// [`VarMap::var_to_partition`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition(u32);
entity_impl!(Partition, "part");

/// Compaction filtering mode.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CompactMode {
    /// Keep every referenced partition.
    Normal,
    /// Additionally drop partitions that are the only member of their root
    /// variable's group. With a single definition there is nothing to
    /// coalesce, so the reduced set is all the coalescer needs.
    NoSingleDefs,
}

/// The variable partition map.
pub struct VarMap {
    /// Disjoint-set structure over value versions.
    partition: UnionFind<Value>,

    /// Representative entity for each raw partition, indexed by the
    /// representative version. Empty entries are unregistered versions.
    partition_to_name: Vec<Option<Name>>,

    /// Raw partition index to dense index, present after a compaction that
    /// eliminated something.
    partition_to_compact: Option<Vec<PackedOption<Partition>>>,

    /// Dense index back to raw partition index.
    compact_to_partition: Option<Vec<Partition>>,

    /// Storage binding written by [`VarMap::change_partition_var`].
    var_binding: SecondaryMap<Var, PackedOption<Partition>>,

    /// Current number of partitions; equals `partition_size` until a
    /// compaction eliminates some.
    num_partitions: usize,

    /// Size of the version space this map was created over.
    partition_size: usize,

    /// Optional per-version reference counts.
    ref_count: Option<Vec<u32>>,
}

impl VarMap {
    /// Create a variable partition map over `size` versions, each initially
    /// in its own partition.
    pub fn new(size: usize) -> Self {
        Self {
            partition: UnionFind::with_capacity(size),
            partition_to_name: vec![None; size],
            partition_to_compact: None,
            compact_to_partition: None,
            var_binding: SecondaryMap::new(),
            num_partitions: size,
            partition_size: size,
            ref_count: None,
        }
    }

    /// Scan `func` and build a partition map with an entry for every SSA
    /// version used or defined by a φ-node or statement. Root variables of
    /// scanned operands are marked used. With `ref_counts`, each use of a
    /// version on the right-hand side of a statement is counted.
    ///
    /// In debug builds this also validates that virtual operands stay out of
    /// the register-candidate world: registering a version of a
    /// non-candidate variable, or seeing one variable in both real and
    /// virtual operands, is SSA corruption from an earlier pass.
    pub fn build(func: &mut Function, ref_counts: bool) -> Self {
        let mut map = Self::new(func.num_values());
        if ref_counts {
            map.ref_count = Some(vec![0; func.num_values()]);
        }

        let mut used_vars = CompoundBitSet::new();
        let mut used_in_real_ops = CompoundBitSet::new();
        let mut used_in_virtual_ops = CompoundBitSet::new();

        for block in func.blocks() {
            for &phi in func.phis(block) {
                let result = func.phi_result(phi);
                map.register_value(func, result, false);
                used_vars.insert(func.root_var(result).index());
                for &(arg, _) in func.phi_args(phi) {
                    map.register_value(func, arg, true);
                    used_vars.insert(func.root_var(arg).index());
                }
            }

            for &inst in func.block_insts(block) {
                for &arg in func.uses(inst) {
                    map.register_value(func, arg, true);
                    let root = func.root_var(arg);
                    used_vars.insert(root.index());
                    if cfg!(debug_assertions) {
                        used_in_real_ops.insert(root.index());
                    }
                }
                for &def in func.defs(inst) {
                    map.register_value(func, def, false);
                    let root = func.root_var(def);
                    used_vars.insert(root.index());
                    if cfg!(debug_assertions) {
                        used_in_real_ops.insert(root.index());
                    }
                }
                if cfg!(debug_assertions) {
                    for &virt in func.virt_operands(inst) {
                        used_in_virtual_ops.insert(func.root_var(virt).index());
                    }
                }
            }
        }

        for v in used_vars.iter() {
            func.var_mut(Var::new(v)).used = true;
        }

        if cfg!(debug_assertions) {
            let mut corrupt = false;
            for v in used_in_real_ops.iter() {
                if used_in_virtual_ops.contains(v) {
                    log::error!(
                        "variable {} used in real and virtual operands",
                        func.var(Var::new(v)).name
                    );
                    corrupt = true;
                }
            }
            if corrupt {
                panic!("SSA corruption");
            }
        }

        map
    }

    /// Make sure `value` has a partition entry. With reference counting
    /// enabled, `used_as_rhs` bumps the version's count.
    pub fn register_value(&mut self, func: &Function, value: Value, used_as_rhs: bool) {
        if cfg!(debug_assertions) && !func.var(func.root_var(value)).reg_candidate {
            log::error!("illegally registering a virtual SSA name: {}", value);
            panic!("SSA corruption");
        }
        if used_as_rhs {
            if let Some(rc) = &mut self.ref_count {
                rc[value.index()] += 1;
            }
        }
        let slot = &mut self.partition_to_name[value.index()];
        if slot.is_none() {
            *slot = Some(Name::Value(value));
        }
    }

    /// Number of times `value` was registered as a right-hand-side operand.
    /// Zero when reference counting was not enabled.
    pub fn version_ref_count(&self, value: Value) -> u32 {
        self.ref_count
            .as_ref()
            .map_or(0, |rc| rc[value.index()])
    }

    /// Current number of partitions.
    pub fn num_partitions(&self) -> usize {
        self.num_partitions
    }

    /// The raw representative of `value`'s class, independent of any
    /// compaction.
    pub fn find(&self, value: Value) -> Partition {
        Partition::new(self.partition.find_const(value).index())
    }

    /// Return `x`'s partition under the current numbering, or `None` if `x`
    /// is not mapped.
    pub fn var_to_partition(&self, x: impl Into<Name>) -> Option<Partition> {
        match x.into() {
            Name::Value(v) => {
                let raw = self.find(v);
                match &self.partition_to_compact {
                    Some(p2c) => p2c[raw.index()].expand(),
                    None => {
                        if self.partition_to_name[raw.index()].is_some() {
                            Some(raw)
                        } else {
                            None
                        }
                    }
                }
            }
            Name::Var(var) => self.var_binding[var].expand(),
        }
    }

    /// The representative entity of partition `part` under the current
    /// numbering: one of its SSA versions, or the program variable bound by
    /// [`VarMap::change_partition_var`].
    pub fn partition_to_name(&self, part: Partition) -> Option<Name> {
        let raw = match &self.compact_to_partition {
            Some(c2p) => c2p[part.index()],
            None => part,
        };
        let rep = self.partition.find_const(Value::new(raw.index()));
        self.partition_to_name[rep.index()]
    }

    /// Combine the partitions of `n1` and `n2` and return the representative
    /// of the merged partition, or `None` if either input has no partition.
    ///
    /// When program variables are passed in, their partitions are resolved
    /// through the current binding and the preferred storage binding after
    /// the union goes to a user-visible variable over an artificial one.
    pub fn union(&mut self, func: &Function, n1: Name, n2: Name) -> Option<Partition> {
        let mut root_var: Option<Var> = None;
        let mut other_var: Option<Var> = None;

        // Resolve each side to a raw partition index. This is independent of
        // any compaction: whichever partition gets absorbed will simply
        // never be dereferenced through the compact map again.
        let p1 = match n1 {
            Name::Value(v) => self.find(v),
            Name::Var(var) => {
                let p = self.var_to_partition(var)?;
                root_var = Some(var);
                match &self.compact_to_partition {
                    Some(c2p) => c2p[p.index()],
                    None => p,
                }
            }
        };

        let p2 = match n2 {
            Name::Value(v) => self.find(v),
            Name::Var(var) => {
                let p = self.var_to_partition(var)?;
                match root_var {
                    Some(rv) if !func.var(rv).artificial => other_var = Some(var),
                    prev => {
                        other_var = prev;
                        root_var = Some(var);
                    }
                }
                match &self.compact_to_partition {
                    Some(c2p) => c2p[p.index()],
                    None => p,
                }
            }
        };

        if self.partition_to_name[p1.index()].is_none()
            || self.partition_to_name[p2.index()].is_none()
        {
            return None;
        }

        let p3 = if p1 == p2 {
            p1
        } else {
            let rep = self
                .partition
                .union(Value::new(p1.index()), Value::new(p2.index()));
            Partition::new(rep.index())
        };

        let p3 = match &self.partition_to_compact {
            Some(p2c) => p2c[p3.index()].expand()?,
            None => p3,
        };

        if let Some(var) = root_var {
            self.change_partition_var(var, p3);
        }
        if let Some(var) = other_var {
            self.change_partition_var(var, p3);
        }

        Some(p3)
    }

    /// Bind compact partition `part` to program variable `var`, making `var`
    /// the partition's representative entity. This is how partitions are
    /// mapped back to real storage after compaction.
    pub fn change_partition_var(&mut self, var: Var, part: Partition) {
        self.var_binding[var] = part.into();
        if let Some(c2p) = &self.compact_to_partition {
            let raw = c2p[part.index()];
            self.partition_to_name[raw.index()] = Some(Name::Var(var));
        }
    }

    /// Compress partition numbers into the dense range
    /// `0..num_partitions`, removing references to unused partitions so
    /// downstream bitmaps can be much denser.
    ///
    /// [`CompactMode::NoSingleDefs`] additionally filters out partitions
    /// that are the only member of their root variable's group. Compaction
    /// is idempotent with respect to membership and may be re-run with a
    /// different mode at any time; prior compaction maps are discarded
    /// first. If nothing is eliminated, no compaction maps are kept at all.
    pub fn compact(&mut self, func: &Function, mode: CompactMode) {
        let limit = self.partition_size;
        let mut used = CompoundBitSet::with_capacity(limit);

        // Already compressed? Abandon the old numbering.
        self.partition_to_compact = None;
        self.compact_to_partition = None;
        self.var_binding.clear();
        self.num_partitions = self.partition_size;

        let rv = match mode {
            CompactMode::NoSingleDefs => Some(PartitionGroups::by_root_var(self, func)),
            CompactMode::Normal => None,
        };

        // Find out which partitions are actually referenced.
        let mut count = 0;
        for x in 0..limit {
            let rep = self.partition.find_const(Value::new(x)).index();
            if !used.contains(rep) && self.partition_to_name[rep].is_some() {
                if let Some(rv) = &rv {
                    // Check whether the root variable group holds more than
                    // one partition; a lone member needs no renumbering.
                    if let Some(group) = rv.find(Partition::new(rep)) {
                        let first = rv.first_partition(group).expect("non-empty group");
                        if rv.next_partition(first).is_none() {
                            continue;
                        }
                    }
                }
                used.insert(rep);
                count += 1;
            }
        }

        // Build the compacted numbering, unless everything survived.
        if count != limit {
            let mut p2c: Vec<PackedOption<Partition>> = vec![None.into(); limit];
            let mut c2p: Vec<Partition> = Vec::with_capacity(count);
            let mut rebind: Vec<(Var, Partition)> = Vec::new();
            for (compact, raw) in used.iter().enumerate() {
                p2c[raw] = Partition::new(compact).into();
                c2p.push(Partition::new(raw));
                if let Some(Name::Var(var)) = self.partition_to_name[raw] {
                    rebind.push((var, Partition::new(compact)));
                }
            }
            self.partition_to_compact = Some(p2c);
            self.compact_to_partition = Some(c2p);
            for (var, part) in rebind {
                self.change_partition_var(var, part);
            }
        }

        self.num_partitions = count;
    }

    /// Whether `a` and `b` are members of the same partition. Compaction
    /// does not change the answer.
    pub fn same_partition(&self, a: Value, b: Value) -> bool {
        self.partition.find_const(a) == self.partition.find_const(b)
    }
}
