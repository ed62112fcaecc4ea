mod branch;
mod iter;
mod storage;

use crate::{
    utils::VectorSquareSum,
    voxel_map::{IndexConfig, VoxelCell, VoxelCoord},
};

use branch::{Branch, coord_to_octant, octant_to_coord, point_to_coord};
use iter::CellIter;
use storage::{RootTreeID, TreeID, TreeStorage};

use nalgebra::{Point3, Vector3};

#[derive(Debug)]
pub(crate) struct OctTreeNode {
    tree: OctTree,
    state: NodeState,
}

#[derive(Debug, Clone)]
struct NodeState {
    center: Point3<f64>,
    /// The quarter length of the side of the node.
    side_quarter_length: f64,
    /// Current depth of the node in the tree.
    depth: u8,
}

#[derive(Debug)]
enum OctTree {
    Branch(Branch),
    Leaf(VoxelCell),
}

impl NodeState {
    #[inline]
    fn edge(&self) -> f64 {
        self.side_quarter_length * 4.0
    }

    fn child(&self, coord: Vector3<bool>) -> Self {
        let quarter = self.side_quarter_length;
        Self {
            center: self.center + coord.map(|x| if x { quarter } else { -quarter }),
            side_quarter_length: quarter / 2.0,
            depth: self.depth + 1,
        }
    }
}

/// One root cell of the index and its refinement.
#[derive(Debug)]
pub(crate) struct OctTreeRoot {
    storage: TreeStorage,
}

impl OctTreeRoot {
    pub fn build(coord: VoxelCoord, points: Vec<Point3<f64>>, config: &IndexConfig) -> Self {
        let edge = config.b_max;
        let state = NodeState {
            center: coord.center(edge),
            side_quarter_length: edge / 4.0,
            depth: 0,
        };
        let mut storage = TreeStorage::with_capacity(1);
        let root = TreeBuilder {
            storage: &mut storage,
            config,
        }
        .build_node(points, state);
        debug_assert!(root.is_none() && storage.has_root());
        Self { storage }
    }

    pub fn cells(&self) -> CellIter<'_> {
        let root = self.storage.has_root().then(|| &self.storage[RootTreeID]);
        CellIter::new(&self.storage, root)
    }

    /// The leaf containing `point`, or when its octant is empty, the leaf
    /// under the sibling whose center is closest to `point`.
    pub fn locate(&self, point: &Point3<f64>) -> Option<&VoxelCell> {
        if !self.storage.has_root() {
            return None;
        }
        let mut node = &self.storage[RootTreeID];
        loop {
            match &node.tree {
                OctTree::Leaf(cell) => return Some(cell),
                OctTree::Branch(branch) => {
                    let child = match branch[point_to_coord(point, &node.state.center)] {
                        Some(child) => child,
                        None => branch.iter().min_by(|&a, &b| {
                            let da = (self.storage[a].state.center - point).norm_squared();
                            let db = (self.storage[b].state.center - point).norm_squared();
                            da.total_cmp(&db)
                        })?,
                    };
                    node = &self.storage[child];
                }
            }
        }
    }
}

/// Storage being filled, with the settings the refinement follows.
struct TreeBuilder<'a> {
    storage: &'a mut TreeStorage,
    config: &'a IndexConfig,
}

impl TreeBuilder<'_> {
    /// Recursively builds the subtree over `points`, parents before children.
    fn build_node(&mut self, points: Vec<Point3<f64>>, state: NodeState) -> Option<TreeID> {
        let config = self.config;
        let Some(surface) = points
            .iter()
            .map(|p| &p.coords)
            .sum::<VectorSquareSum<f64>>()
            .surface()
        else {
            // only an empty root lands here, empty octants get no child
            return self.storage.alloc(OctTreeNode {
                tree: OctTree::Branch(Branch::default()),
                state,
            });
        };

        let splits = state.edge() / 2.0 >= config.b_min
            && surface.count >= 2 * config.min_cell_points
            && surface.thickness_ratio() > config.b_ratio;

        if !splits {
            let cell = VoxelCell::new(&surface, state.edge(), state.depth, config);
            return self.storage.alloc(OctTreeNode {
                tree: OctTree::Leaf(cell),
                state,
            });
        }

        let mut octants: [Vec<Point3<f64>>; 8] = Default::default();
        for point in points {
            octants[coord_to_octant(point_to_coord(&point, &state.center))].push(point);
        }

        let id = self.storage.alloc(OctTreeNode {
            tree: OctTree::Branch(Branch::default()),
            state: state.clone(),
        });
        let mut branch = Branch::default();
        for (octant, points) in octants.into_iter().enumerate() {
            if points.is_empty() {
                continue;
            }
            let coord = octant_to_coord(octant);
            branch[coord] = self.build_node(points, state.child(coord));
        }

        let node = match id {
            Some(id) => &mut self.storage[id],
            None => &mut self.storage[RootTreeID],
        };
        node.tree = OctTree::Branch(branch);
        id
    }
}
