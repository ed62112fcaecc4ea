#![allow(dead_code)]

use nalgebra::{Isometry3, Point3, Vector3};

use crate::config::Config;

/// `n × n` points spanning the parallelogram `origin + [0, 1] u + [0, 1] v`.
pub(crate) fn grid_plane(
    origin: Point3<f64>,
    u: Vector3<f64>,
    v: Vector3<f64>,
    n: usize,
) -> Vec<Point3<f64>> {
    let steps = (n - 1).max(1) as f64;
    (0..n)
        .flat_map(|i| (0..n).map(move |j| (i, j)))
        .map(|(i, j)| origin + u * (i as f64 / steps) + v * (j as f64 / steps))
        .collect()
}

fn grid_rectangle(
    origin: Point3<f64>,
    u: Vector3<f64>,
    v: Vector3<f64>,
    spacing: f64,
) -> Vec<Point3<f64>> {
    let nu = (u.norm() / spacing).round() as usize + 1;
    let nv = (v.norm() / spacing).round() as usize + 1;
    let su = (nu - 1).max(1) as f64;
    let sv = (nv - 1).max(1) as f64;
    (0..nu)
        .flat_map(|i| (0..nv).map(move |j| (i, j)))
        .map(|(i, j)| origin + u * (i as f64 / su) + v * (j as f64 / sv))
        .collect()
}

/// World-frame samples of the six faces of a closed box room spanning
/// `[-12, 18] × [-6, 6] × [-1.5, 2.5]`.
pub(crate) fn room_scene(spacing: f64) -> Vec<Point3<f64>> {
    let room_min = Point3::new(-12.0, -6.0, -1.5);
    let size = Vector3::new(30.0, 12.0, 4.0);
    let (dx, dy, dz) = (
        Vector3::x() * size.x,
        Vector3::y() * size.y,
        Vector3::z() * size.z,
    );
    [
        (room_min, dx, dy),
        (room_min + dz, dx, dy),
        (room_min, dy, dz),
        (room_min + dx, dy, dz),
        (room_min, dx, dz),
        (room_min + dy, dx, dz),
    ]
    .into_iter()
    .flat_map(|(origin, u, v)| grid_rectangle(origin, u, v, spacing))
    .collect()
}

/// What a sensor at `sensor_to_world` sees of `world`, in its own frame.
pub(crate) fn observe(world: &[Point3<f64>], sensor_to_world: &Isometry3<f64>) -> Vec<Point3<f64>> {
    let world_to_sensor = sensor_to_world.inverse();
    world.iter().map(|p| world_to_sensor * p).collect()
}

pub(crate) fn translation(x: f64, y: f64, z: f64) -> Isometry3<f64> {
    Isometry3::translation(x, y, z)
}

/// 1 m root cells over the room, two workers.
pub(crate) fn test_config() -> Config {
    Config::new(10.0, false, 1.0, 0.1, 0.8, 0.25, 0.02, 4, 2, false)
}
