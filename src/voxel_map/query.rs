use itertools::iproduct;
use nalgebra::{Point3, Vector3};

use super::{AdaptiveVoxelIndex, PlaneEstimate, ToVoxelCoord, VoxelCell, VoxelCoord};

/// Orientation a matched plane must agree with.
///
/// Planes are unoriented, so a normal and its opposite agree fully.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Facing {
    pub normal: Vector3<f64>,
    /// Minimum `|cos|` of the angle between the two normals.
    pub min_agreement: f64,
}

impl Facing {
    #[inline]
    pub fn accepts(&self, plane: &PlaneEstimate) -> bool {
        plane.normal.dot(&self.normal).abs() >= self.min_agreement
    }
}

/// A reliable cell explaining a query point.
#[derive(Debug, Clone, Copy)]
pub struct CellMatch<'a> {
    pub cell: &'a VoxelCell,
    pub plane: &'a PlaneEstimate,
    /// Signed point-to-plane distance.
    pub distance_to_plane: f64,
}

impl<'a> CellMatch<'a> {
    fn try_new(
        cell: &'a VoxelCell,
        point: &Point3<f64>,
        radius: f64,
        facing: Option<&Facing>,
    ) -> Option<Self> {
        let plane = cell.plane.as_ref()?;
        if facing.is_some_and(|facing| !facing.accepts(plane)) {
            return None;
        }
        let distance_to_center = point - cell.centroid;
        let distance_to_center_squared = distance_to_center.norm_squared();
        if distance_to_center_squared > radius * radius {
            return None;
        }
        let distance_to_plane = plane.normal.dot(&distance_to_center);
        let range_distance = (distance_to_center_squared - distance_to_plane.powi(2))
            .max(0.0)
            .sqrt();
        (range_distance <= cell.support_radius()).then_some(Self {
            cell,
            plane,
            distance_to_plane,
        })
    }
}

impl AdaptiveVoxelIndex {
    /// The reliable cell closest to `point` in the point-to-plane sense.
    ///
    /// Every root cell whose box lies within `radius` is descended to the leaf
    /// holding (or nearest to) `point`; candidates must have their centroid
    /// within `radius`, the point inside their planar support and, with
    /// `facing`, a normal agreeing with it.
    pub fn nearest_cell(
        &self,
        point: &Point3<f64>,
        radius: f64,
        facing: Option<&Facing>,
    ) -> Option<CellMatch<'_>> {
        let edge = self.root_edge;
        let reach = Vector3::repeat(radius);
        let VoxelCoord(lo) = (point - reach).to_voxel_coord(edge);
        let VoxelCoord(hi) = (point + reach).to_voxel_coord(edge);

        iproduct!(lo[0]..=hi[0], lo[1]..=hi[1], lo[2]..=hi[2])
            .map(|(x, y, z)| VoxelCoord::new(x, y, z))
            .filter(|coord| coord.box_distance(point, edge) <= radius)
            .filter_map(|coord| self.roots.get(&coord))
            .filter_map(|root| root.locate(point))
            .filter_map(|cell| CellMatch::try_new(cell, point, radius, facing))
            .min_by(|a, b| {
                a.distance_to_plane
                    .abs()
                    .total_cmp(&b.distance_to_plane.abs())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_helpers::grid_plane, voxel_map::IndexConfig};
    use approx::assert_relative_eq;

    fn wall_index() -> AdaptiveVoxelIndex {
        // wall x = 2 spanning y, z in [-2, 2]
        let points = grid_plane(
            Point3::new(2.0, -2.0, -2.0),
            Vector3::y() * 4.0,
            Vector3::z() * 4.0,
            21,
        );
        AdaptiveVoxelIndex::build(&points, &IndexConfig::default())
    }

    #[test]
    fn test_finds_wall_from_nearby_point() {
        let index = wall_index();
        let found = index
            .nearest_cell(&Point3::new(1.3, 0.4, 0.3), 1.5, None)
            .expect("wall within radius");
        assert_relative_eq!(found.distance_to_plane.abs(), 0.7, epsilon = 1e-9);
        assert_relative_eq!(found.plane.normal.x.abs(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(found.cell.centroid.x, 2.0, epsilon = 1e-9);
    }

    #[test]
    fn test_nothing_beyond_radius() {
        let index = wall_index();
        assert!(
            index
                .nearest_cell(&Point3::new(0.0, 0.4, 0.3), 1.5, None)
                .is_none()
        );
        assert!(
            index
                .nearest_cell(&Point3::new(2.0, 9.0, 0.0), 1.5, None)
                .is_none()
        );
    }

    #[test]
    fn test_prefers_smallest_plane_distance() {
        let mut points = grid_plane(
            Point3::new(0.0, 0.0, 0.0),
            Vector3::x() * 4.0,
            Vector3::y() * 4.0,
            21,
        );
        // a parallel shelf 1.2 m above the floor, in other root cells
        points.extend(grid_plane(
            Point3::new(0.0, 0.0, 1.2),
            Vector3::x() * 4.0,
            Vector3::y() * 4.0,
            21,
        ));
        let index = AdaptiveVoxelIndex::build(&points, &IndexConfig::default());

        let found = index
            .nearest_cell(&Point3::new(1.5, 1.5, 0.9), 1.5, None)
            .expect("both planes in reach");
        assert_relative_eq!(found.cell.centroid.z, 1.2, epsilon = 1e-9);
        assert_relative_eq!(found.distance_to_plane.abs(), 0.3, epsilon = 1e-9);
    }

    #[test]
    fn test_facing_skips_closer_perpendicular_plane() {
        // a floor at z = 1 up to y = 0.9 and a wall at y = 1 from z = 1.1,
        // in disjoint root cells
        let mut points = grid_plane(
            Point3::new(0.0, -2.9, 1.0),
            Vector3::x() * 4.0,
            Vector3::y() * 3.8,
            21,
        );
        points.extend(grid_plane(
            Point3::new(0.0, 1.0, 1.1),
            Vector3::x() * 4.0,
            Vector3::z() * 3.8,
            21,
        ));
        let index = AdaptiveVoxelIndex::build(&points, &IndexConfig::default());
        // 3 cm above the floor, 2 cm in front of the wall
        let point = Point3::new(1.5, 0.98, 1.03);

        let any = index.nearest_cell(&point, 1.5, None).expect("wall in reach");
        assert_relative_eq!(any.plane.normal.y.abs(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(any.distance_to_plane.abs(), 0.02, epsilon = 1e-9);

        let up = Facing {
            normal: Vector3::new(0.2, 0.0, 0.98).normalize(),
            min_agreement: 0.9,
        };
        let floor = index
            .nearest_cell(&point, 1.5, Some(&up))
            .expect("floor in reach");
        assert_relative_eq!(floor.plane.normal.z.abs(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(floor.distance_to_plane.abs(), 0.03, epsilon = 1e-9);
        assert_relative_eq!(floor.cell.centroid.z, 1.0, epsilon = 1e-9);

        let sideways = Facing {
            normal: Vector3::x(),
            min_agreement: 0.9,
        };
        assert!(index.nearest_cell(&point, 1.5, Some(&sideways)).is_none());
    }
}
