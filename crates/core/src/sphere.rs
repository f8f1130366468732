//! Unit-sphere math: lon/lat ↔ 3-vectors, angular distances, spherical areas
//! and the pole-avoiding frame rotation used around polygon intersections.
//!
//! Longitudes and latitudes are in degrees. Vectors follow the HEALPix angular
//! convention: co-latitude θ = 90° − lat and azimuth φ = lon wrapped to [0, 2π).

use std::f64::consts::{PI, TAU};

use geo::{Coord, Geometry, LineString, MapCoords, Polygon};
use nalgebra::{Rotation3, UnitQuaternion, Vector3};

/// A point on the unit sphere.
pub type Vec3 = Vector3<f64>;

/// Convert lon/lat (degrees) to a unit vector.
///
/// Panics if the resulting co-latitude falls outside [0, π]: that can only
/// happen when a latitude escaped normalization upstream.
pub fn to_vec3(lon: f64, lat: f64) -> Vec3 {
    let theta = (90.0 - lat).to_radians();
    let mut phi = lon.to_radians().rem_euclid(TAU);
    if phi >= TAU {
        phi = 0.0;
    }
    assert!(
        (0.0..=PI).contains(&theta),
        "co-latitude {theta} out of range for lat {lat}"
    );
    assert!((0.0..TAU).contains(&phi), "azimuth {phi} out of range");
    from_angles(theta, phi)
}

/// Convert a (not necessarily normalized) vector back to lon/lat degrees.
///
/// The longitude is returned in (-180, 180].
pub fn to_lon_lat(v: &Vec3) -> (f64, f64) {
    let norm = v.norm();
    let theta = (v.z / norm).clamp(-1.0, 1.0).acos();
    let mut phi = v.y.atan2(v.x);
    if phi < 0.0 {
        phi += TAU;
    }
    if phi >= TAU {
        phi -= TAU;
    }
    assert!((0.0..=PI).contains(&theta));
    assert!((0.0..TAU).contains(&phi));

    let lat = 90.0 - theta.to_degrees();
    let mut lon = phi.to_degrees();
    if lon > 180.0 {
        lon -= 360.0;
    }
    (lon, lat)
}

fn from_angles(theta: f64, phi: f64) -> Vec3 {
    let sin_theta = theta.sin();
    Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), theta.cos())
}

/// Great-circle angular distance between two unit vectors, in radians.
///
/// Uses `atan2(|a x b|, a . b)`, which stays accurate for nearly coincident
/// and nearly antipodal vectors.
pub fn angular_distance(a: &Vec3, b: &Vec3) -> f64 {
    a.cross(b).norm().atan2(a.dot(b))
}

/// Area of a polygonal geometry on the unit sphere, in steradians.
///
/// Edges are treated as rhumb segments in lon/lat (Chamberlain & Duquette),
/// which is exact enough for footprint-size polygons.
pub fn spherical_area(geom: &Geometry<f64>) -> f64 {
    match geom {
        Geometry::Polygon(p) => polygon_area(p),
        Geometry::MultiPolygon(mp) => mp.0.iter().map(polygon_area).sum(),
        _ => 0.0,
    }
}

/// Area of a polygon on the unit sphere, in steradians.
pub fn polygon_area(poly: &Polygon<f64>) -> f64 {
    let holes: f64 = poly.interiors().iter().map(ring_area).sum();
    (ring_area(poly.exterior()) - holes).max(0.0)
}

fn ring_area(ring: &LineString<f64>) -> f64 {
    let coords = &ring.0;
    if coords.len() < 3 {
        return 0.0;
    }
    let mut total = 0.0;
    for pair in coords.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        total += (b.x - a.x).to_radians()
            * (2.0 + a.y.to_radians().sin() + b.y.to_radians().sin());
    }
    // Rings may omit the closing point
    if coords.first() != coords.last() {
        let (a, b) = (coords[coords.len() - 1], coords[0]);
        total += (b.x - a.x).to_radians()
            * (2.0 + a.y.to_radians().sin() + b.y.to_radians().sin());
    }
    (total / 2.0).abs()
}

/// A rotation moving a reference point onto the (1, 0, 0) axis, i.e. to
/// lon = 0, lat = 0, where neither poles nor the antimeridian seam are near.
#[derive(Debug, Clone, Copy)]
pub struct FrameRotation {
    forward: Rotation3<f64>,
    inverse: Rotation3<f64>,
}

impl FrameRotation {
    /// Build the rotation bringing `center` onto the reference axis.
    pub fn new(center: &Vec3) -> Self {
        let axis = Vector3::x();
        let quat = UnitQuaternion::rotation_between(center, &axis).unwrap_or_else(|| {
            // Antipodal to the axis: any half-turn about a perpendicular axis works
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), PI)
        });
        let forward = quat.to_rotation_matrix();
        Self {
            forward,
            inverse: forward.inverse(),
        }
    }

    /// Build the rotation for a lon/lat center given in degrees.
    pub fn around(lon: f64, lat: f64) -> Self {
        Self::new(&to_vec3(lon, lat))
    }

    /// Rotate one lon/lat point into the local frame.
    pub fn apply(&self, coord: Coord<f64>) -> Coord<f64> {
        rotate_coord(&self.forward, coord)
    }

    /// Rotate one lon/lat point from the local frame back to the sky.
    pub fn revert(&self, coord: Coord<f64>) -> Coord<f64> {
        rotate_coord(&self.inverse, coord)
    }

    /// Rotate a polygon into the local frame.
    pub fn apply_polygon(&self, poly: &Polygon<f64>) -> Polygon<f64> {
        poly.map_coords(|c| self.apply(c))
    }

    /// Rotate a polygon from the local frame back to the sky.
    pub fn revert_polygon(&self, poly: &Polygon<f64>) -> Polygon<f64> {
        poly.map_coords(|c| self.revert(c))
    }
}

fn rotate_coord(m: &Rotation3<f64>, coord: Coord<f64>) -> Coord<f64> {
    let v = m * to_vec3(coord.x, coord.y);
    let (x, y) = to_lon_lat(&v);
    Coord { x, y }
}
