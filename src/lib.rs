//! Out-of-SSA liveness analysis and storage coalescing.
//!
//! After a program has been optimized in SSA form it has to be translated
//! back to ordinary code, which means deciding which SSA value versions can
//! share one storage location. This crate implements the analysis core of
//! that translation:
//!
//! - [`varmap::VarMap`] partitions SSA versions with a disjoint-set
//!   structure and compacts partition numbers into a dense range.
//! - [`live::LiveInfo`] computes per-block live-on-entry and live-on-exit
//!   sets for every partition, with the φ-node edge semantics that makes
//!   out-of-SSA liveness different from ordinary dataflow.
//! - [`groups::PartitionGroups`] associates partitions into classes that may
//!   legally coalesce, either by root program variable or by type.
//! - [`conflict::ConflictGraph`] records which partitions of a group overlap,
//!   and [`coalesce`] pops copy-seeded candidates in descending cost order,
//!   unioning partitions whenever the graph permits.
//!
//! The pipeline is tied together by [`coalesce::coalesce_partitions`]; the
//! pieces are public so an embedding compiler can drive them separately.
//!
//! The input program is consumed through the small SSA carrier in [`ir`].
//! Rewriting the program with the final partitioning is the caller's job;
//! this crate only decides what may share storage.

#![deny(missing_docs)]

pub use cranelift_bitset as bitset;
pub use cranelift_entity as entity;

pub mod coalesce;
pub mod conflict;
pub mod groups;
pub mod ir;
pub mod live;
pub mod unionfind;
pub mod varmap;

pub use crate::coalesce::{coalesce_groups, coalesce_partitions, CoalesceList};
pub use crate::conflict::{build_conflict_graph, ConflictGraph};
pub use crate::groups::{Group, PartitionGroups};
pub use crate::live::LiveInfo;
pub use crate::varmap::{CompactMode, Partition, VarMap};
