//! Simple union-find data structure over entity references.

use crate::entity::EntityRef;
use core::marker::PhantomData;

/// A union-find data structure. The data structure can allocate `Idx`s,
/// indicating eclasses, and can merge eclasses together.
///
/// The representative of a merged class is always the member with the lowest
/// index, so walking elements in index order visits every representative
/// before any non-representative member of its class.
#[derive(Clone)]
pub struct UnionFind<Idx: EntityRef> {
    parent: Vec<u32>,
    unused: PhantomData<Idx>,
}

impl<Idx: EntityRef> UnionFind<Idx> {
    /// Create a new `UnionFind` over the `size` elements `0..size`, each in
    /// its own singleton class.
    pub fn with_capacity(size: usize) -> Self {
        Self {
            parent: (0..size as u32).collect(),
            unused: PhantomData,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    /// Whether the structure is empty.
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Find the representative of `x`'s class, compressing the path along
    /// the way.
    pub fn find(&mut self, x: Idx) -> Idx {
        let mut i = x.index() as u32;
        while self.parent[i as usize] != i {
            // Path halving: point at the grandparent before stepping.
            let grandparent = self.parent[self.parent[i as usize] as usize];
            self.parent[i as usize] = grandparent;
            i = grandparent;
        }
        Idx::new(i as usize)
    }

    /// Find the representative of `x`'s class without mutation.
    pub fn find_const(&self, x: Idx) -> Idx {
        let mut i = x.index() as u32;
        while self.parent[i as usize] != i {
            i = self.parent[i as usize];
        }
        Idx::new(i as usize)
    }

    /// Merge the classes of `a` and `b` and return the representative of
    /// the merged class.
    pub fn union(&mut self, a: Idx, b: Idx) -> Idx {
        let a = self.find(a);
        let b = self.find(b);
        if a == b {
            return a;
        }
        // Keep the lower index as the representative.
        let (keep, drop) = if a.index() < b.index() { (a, b) } else { (b, a) };
        self.parent[drop.index()] = keep.index() as u32;
        keep
    }
}
