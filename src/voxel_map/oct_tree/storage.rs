use std::{
    num::NonZero,
    ops::{Index, IndexMut},
};

use super::OctTreeNode;

use slab::Slab;

/// Arena of the nodes of one octree. Nodes are never removed.
#[derive(Debug)]
pub(crate) struct TreeStorage(Slab<OctTreeNode>);

/// Handle of a non-root node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeID {
    /// zero is reserved for the root node.
    index: NonZero<usize>,
}

pub(crate) struct RootTreeID;

impl Index<RootTreeID> for TreeStorage {
    type Output = OctTreeNode;

    #[inline]
    fn index(&self, _: RootTreeID) -> &Self::Output {
        &self.0[0]
    }
}

impl IndexMut<RootTreeID> for TreeStorage {
    #[inline]
    fn index_mut(&mut self, _: RootTreeID) -> &mut Self::Output {
        &mut self.0[0]
    }
}

impl Index<TreeID> for TreeStorage {
    type Output = OctTreeNode;

    #[inline]
    fn index(&self, id: TreeID) -> &Self::Output {
        let index = id.index.get();
        // SAFETY:
        //
        // [`TreeID`] can only be allocated from the [`TreeStorage`] and nodes
        // are never removed, so the index is always occupied.
        unsafe { self.0.get_unchecked(index) }
    }
}

impl IndexMut<TreeID> for TreeStorage {
    #[inline]
    fn index_mut(&mut self, id: TreeID) -> &mut Self::Output {
        let index = id.index.get();
        // SAFETY:
        //
        // See also Self `Index<TreeID>` implemenation.
        unsafe { self.0.get_unchecked_mut(index) }
    }
}

impl TreeStorage {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self(Slab::with_capacity(capacity))
    }

    /// Stores `node`, returning `None` when it became the root.
    #[must_use]
    pub(crate) fn alloc(&mut self, node: OctTreeNode) -> Option<TreeID> {
        let index = self.0.insert(node);
        NonZero::new(index).map(|index| TreeID { index })
    }

    pub(crate) fn has_root(&self) -> bool {
        self.0.contains(0)
    }
}
