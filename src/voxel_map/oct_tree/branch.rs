use std::ops::{Index, IndexMut};

use nalgebra::{Point3, Vector3};

use super::storage::TreeID;

type Childrens = [[[Option<TreeID>; 2]; 2]; 2];

/// Interior node. Octants without points have no child.
#[derive(Debug, Default)]
pub(crate) struct Branch {
    pub(crate) childrens: Childrens,
}

impl Branch {
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = TreeID> + '_ {
        self.childrens.iter().flatten().flatten().flatten().copied()
    }
}

impl Index<Vector3<bool>> for Branch {
    type Output = Option<TreeID>;

    fn index(&self, coord: Vector3<bool>) -> &Self::Output {
        &self.childrens[coord.z as usize][coord.y as usize][coord.x as usize]
    }
}

impl IndexMut<Vector3<bool>> for Branch {
    fn index_mut(&mut self, coord: Vector3<bool>) -> &mut Self::Output {
        &mut self.childrens[coord.z as usize][coord.y as usize][coord.x as usize]
    }
}

/// Octant of `point` relative to `center`, `true` on the positive side.
#[inline]
pub(crate) fn point_to_coord(point: &Point3<f64>, center: &Point3<f64>) -> Vector3<bool> {
    (point - center).map(|x| x >= 0.0)
}

/// Bit index of an octant, used to bucket points before building children.
#[inline]
pub(crate) fn coord_to_octant(coord: Vector3<bool>) -> usize {
    coord.x as usize | (coord.y as usize) << 1 | (coord.z as usize) << 2
}

#[inline]
pub(crate) fn octant_to_coord(octant: usize) -> Vector3<bool> {
    Vector3::new(octant & 1 != 0, octant & 2 != 0, octant & 4 != 0)
}
