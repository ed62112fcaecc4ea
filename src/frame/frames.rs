use nalgebra::{Isometry3, Point3};

use super::Framed;

/// The LiDAR frame, at the start of the scan.
#[derive(Debug, Clone, Copy)]
pub struct Sensor;

#[derive(Debug, Clone, Copy)]
pub struct World;

pub type SensorFramed<T> = Framed<T, Sensor>;
pub type WorldFramed<T> = Framed<T, World>;

pub type IsometryFramed<T, F> = Framed<Isometry3<T>, F>;

pub type FramedPoint<T, F> = Framed<Point3<T>, F>;
pub type SensorPoint<T = f64> = SensorFramed<Point3<T>>;
pub type WorldPoint<T = f64> = WorldFramed<Point3<T>>;

/// Maps points of the sensor frame into the world frame.
pub type SensorToWorld<T = f64> = IsometryFramed<T, fn(Sensor) -> World>;
pub type WorldToSensor<T = f64> = IsometryFramed<T, fn(World) -> Sensor>;
