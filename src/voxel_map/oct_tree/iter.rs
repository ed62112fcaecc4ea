use crate::voxel_map::VoxelCell;

use super::{OctTree, OctTreeNode, storage::TreeStorage};

/// Depth-first walk over the leaf cells of one tree.
pub struct CellIter<'tree> {
    storage: &'tree TreeStorage,
    stack: Vec<&'tree OctTreeNode>,
}

impl<'tree> CellIter<'tree> {
    pub(crate) fn new(storage: &'tree TreeStorage, root: Option<&'tree OctTreeNode>) -> Self {
        Self {
            storage,
            stack: root.into_iter().collect(),
        }
    }
}

impl<'tree> Iterator for CellIter<'tree> {
    type Item = &'tree VoxelCell;

    fn next(&mut self) -> Option<Self::Item> {
        let storage = self.storage;
        while let Some(node) = self.stack.pop() {
            match &node.tree {
                OctTree::Leaf(cell) => return Some(cell),
                // reversed so that children come out in octant order
                OctTree::Branch(branch) => {
                    self.stack.extend(branch.iter().rev().map(|id| &storage[id]))
                }
            }
        }
        None
    }
}
