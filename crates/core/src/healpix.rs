//! Nested HEALPix grid math on unit vectors.
//!
//! A pixel is a face (0-3 north cap, 4-7 equatorial belt, 8-11 south cap)
//! plus integer face coordinates `(ix, iy)`. `ix` runs towards the face's east
//! vertex and `iy` towards its west vertex, so `(nside - 1, nside - 1)` is the
//! northernmost pixel of a face. The nested index puts the bits of `ix` on the
//! even positions and `iy` on the odd ones below the face number, which makes
//! the children of pixel `p` exactly `4p..4p + 3`.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

use crate::sphere::{angular_distance, to_lon_lat, to_vec3, Vec3};

/// Deepest order whose pixel count fits comfortably in an `i64` index.
pub const MAX_ORDER: u8 = 29;

/// Slack applied to a pixel's corner radius so the disc query stays inclusive
/// even where cell edges bulge beyond their corners.
const CELL_REACH_SLACK: f64 = 1.2;

/// Ring index of each face's southern vertex, counted in face heights from the
/// north pole.
const FACE_RING: [f64; 12] = [2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 3.0, 3.0, 4.0, 4.0, 4.0, 4.0];

/// Azimuth of each face's center in units of π/4.
const FACE_AZIMUTH: [f64; 12] = [1.0, 3.0, 5.0, 7.0, 0.0, 2.0, 4.0, 6.0, 1.0, 3.0, 5.0, 7.0];

pub fn nside(order: u8) -> u64 {
    1u64 << order
}

pub fn npix(order: u8) -> u64 {
    12u64 << (2 * u32::from(order))
}

/// Solid angle of one pixel, in steradians. Every pixel has the same area.
pub fn pixel_area(order: u8) -> f64 {
    PI / (3u64 << (2 * u32::from(order))) as f64
}

/// Pixel containing a lon/lat point given in degrees.
pub fn pixel_of(lon: f64, lat: f64, order: u8) -> u64 {
    pixel_of_vec(&to_vec3(lon, lat), order)
}

/// Pixel containing the direction `v` (need not be normalized).
pub fn pixel_of_vec(v: &Vec3, order: u8) -> u64 {
    let ns = nside(order);
    let nsf = ns as f64;
    let norm = v.norm();
    let z = v.z / norm;
    let za = z.abs();

    // Azimuth in quarter turns, [0, 4)
    let mut tt = (v.y.atan2(v.x) / FRAC_PI_2).rem_euclid(4.0);
    if tt >= 4.0 {
        tt = 0.0;
    }

    let cell = if za <= 2.0 / 3.0 {
        // Equatorial zone: locate the two edge lines through the point
        let along = nsf * (0.5 + tt);
        let across = nsf * z * 0.75;
        let ascending = (along - across) as u64;
        let descending = (along + across) as u64;
        let fa = ascending >> order;
        let fd = descending >> order;
        let face = match fa.cmp(&fd) {
            std::cmp::Ordering::Equal => fa | 4,
            std::cmp::Ordering::Less => fa,
            std::cmp::Ordering::Greater => fd + 8,
        };
        FacePixel {
            face,
            ix: descending & (ns - 1),
            iy: ns - (ascending & (ns - 1)) - 1,
        }
    } else {
        // Polar caps: distance from the pole in pixel units, split by azimuth.
        // Near the pole sin(theta) from the vector keeps the precision acos loses.
        let column = (tt as u64).min(3);
        let tp = tt - column as f64;
        let scale = if za < 0.99 {
            nsf * (3.0 * (1.0 - za)).sqrt()
        } else {
            nsf * (v.x.hypot(v.y) / norm) / ((1.0 + za) / 3.0).sqrt()
        };
        let jp = ((tp * scale) as u64).min(ns - 1);
        let jm = (((1.0 - tp) * scale) as u64).min(ns - 1);
        if z > 0.0 {
            FacePixel {
                face: column,
                ix: ns - jm - 1,
                iy: ns - jp - 1,
            }
        } else {
            FacePixel {
                face: column + 8,
                ix: jp,
                iy: jm,
            }
        }
    };
    cell.to_nested(order)
}

/// Center of a pixel as (lon, lat) in degrees.
pub fn center(pixel: u64, order: u8) -> (f64, f64) {
    to_lon_lat(&center_vec(pixel, order))
}

/// Center of a pixel as a unit vector.
pub fn center_vec(pixel: u64, order: u8) -> Vec3 {
    FacePixel::from_nested(pixel, order).point(0.5, 0.5, order)
}

/// The four corners of a pixel, counter-clockwise: north, west, south, east.
pub fn corners(pixel: u64, order: u8) -> [Vec3; 4] {
    let cell = FacePixel::from_nested(pixel, order);
    [(1.0, 1.0), (0.0, 1.0), (0.0, 0.0), (1.0, 0.0)].map(|(dx, dy)| cell.point(dx, dy, order))
}

/// Largest angular distance from a pixel's center to one of its corners.
pub fn corner_radius(pixel: u64, order: u8) -> f64 {
    let center = center_vec(pixel, order);
    corners(pixel, order)
        .iter()
        .map(|c| angular_distance(&center, c))
        .fold(0.0, f64::max)
}

/// All pixels at `order` that may overlap the disc of `radius` radians around
/// `center`. The result is a sorted superset of the overlapping pixels.
pub fn query_disc_inclusive(center: &Vec3, radius: f64, order: u8) -> Vec<u64> {
    let mut found = Vec::new();
    let mut pending: Vec<(u8, u64)> = (0..12).map(|face| (0, face)).collect();

    while let Some((depth, pixel)) = pending.pop() {
        let reach = corner_radius(pixel, depth) * CELL_REACH_SLACK;
        if angular_distance(center, &center_vec(pixel, depth)) > radius + reach {
            continue;
        }
        if depth == order {
            found.push(pixel);
        } else {
            pending.extend((0..4).map(|child| (depth + 1, pixel * 4 + child)));
        }
    }

    found.sort_unstable();
    found
}

/// Same as [`query_disc_inclusive`] with the center given in degrees.
pub fn query_disc_inclusive_deg(lon: f64, lat: f64, radius: f64, order: u8) -> Vec<u64> {
    query_disc_inclusive(&to_vec3(lon, lat), radius, order)
}

/// Inclusive index range of the descendants of `pixel` (at `order`) at the
/// finer order `target`.
pub fn descendant_range(pixel: u64, order: u8, target: u8) -> (u64, u64) {
    debug_assert!(target >= order);
    let scale = 1u64 << (2 * u32::from(target - order));
    (pixel * scale, (pixel + 1) * scale - 1)
}

/// Ancestor of `pixel` (at `order`) at the coarser order `target`.
pub fn ancestor(pixel: u64, order: u8, target: u8) -> u64 {
    debug_assert!(target <= order);
    pixel >> (2 * u32::from(order - target))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FacePixel {
    face: u64,
    ix: u64,
    iy: u64,
}

impl FacePixel {
    fn from_nested(pixel: u64, order: u8) -> Self {
        let shift = 2 * u32::from(order);
        let sub = pixel & ((1u64 << shift) - 1);
        Self {
            face: pixel >> shift,
            ix: compact_bits(sub),
            iy: compact_bits(sub >> 1),
        }
    }

    fn to_nested(self, order: u8) -> u64 {
        (self.face << (2 * u32::from(order))) | spread_bits(self.ix) | (spread_bits(self.iy) << 1)
    }

    /// Point at offset `(dx, dy)` in [0, 1]² inside the pixel. Integer offsets
    /// land on corners.
    fn point(self, dx: f64, dy: f64, order: u8) -> Vec3 {
        let ns = nside(order) as f64;
        face_point(
            self.face as usize,
            (self.ix as f64 + dx) / ns,
            (self.iy as f64 + dy) / ns,
        )
    }
}

/// Unit vector at face coordinates `(x, y)` in [0, 1]².
fn face_point(face: usize, x: f64, y: f64) -> Vec3 {
    // Ring position measured from the north pole, in face heights (0..=4)
    let ring = FACE_RING[face] - x - y;
    let (nr, z, sin_theta) = if ring < 1.0 {
        let t = ring * ring / 3.0;
        (ring, 1.0 - t, (t * (2.0 - t)).sqrt())
    } else if ring > 3.0 {
        let nr = 4.0 - ring;
        let t = nr * nr / 3.0;
        (nr, t - 1.0, (t * (2.0 - t)).sqrt())
    } else {
        let z = (2.0 - ring) * 2.0 / 3.0;
        (1.0, z, ((1.0 - z) * (1.0 + z)).sqrt())
    };

    let mut azimuth = FACE_AZIMUTH[face] * nr + x - y;
    if azimuth < 0.0 {
        azimuth += 8.0;
    }
    if azimuth >= 8.0 {
        azimuth -= 8.0;
    }
    let phi = if nr < 1e-15 {
        0.0
    } else {
        FRAC_PI_4 * azimuth / nr
    };
    Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), z)
}

/// Spread the low 32 bits of `v` onto the even bit positions.
fn spread_bits(v: u64) -> u64 {
    let mut v = v & 0xffff_ffff;
    v = (v | (v << 16)) & 0x0000_ffff_0000_ffff;
    v = (v | (v << 8)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v << 4)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v << 2)) & 0x3333_3333_3333_3333;
    (v | (v << 1)) & 0x5555_5555_5555_5555
}

/// Inverse of [`spread_bits`]: gather the even bits of `v`.
fn compact_bits(v: u64) -> u64 {
    let mut v = v & 0x5555_5555_5555_5555;
    v = (v | (v >> 1)) & 0x3333_3333_3333_3333;
    v = (v | (v >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    v = (v | (v >> 4)) & 0x00ff_00ff_00ff_00ff;
    v = (v | (v >> 8)) & 0x0000_ffff_0000_ffff;
    (v | (v >> 16)) & 0x0000_0000_ffff_ffff
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-8;

    #[test]
    fn nside_and_npix() {
        assert_eq!(nside(0), 1);
        assert_eq!(nside(3), 8);
        assert_eq!(npix(0), 12);
        assert_eq!(npix(1), 48);
        assert_eq!(npix(5), 12_288);
    }

    #[test]
    fn pixel_area_sum() {
        for order in 0..6 {
            let total = pixel_area(order) * npix(order) as f64;
            assert!((total - 4.0 * PI).abs() < EPS, "order {order}: {total}");
        }
    }

    #[test]
    fn bit_spreading_roundtrip() {
        for x in 0..64 {
            assert_eq!(compact_bits(spread_bits(x)), x);
            assert_eq!(spread_bits(x) & 0xaaaa_aaaa_aaaa_aaaa, 0);
        }
        let deep = (1u64 << 29) - 1;
        assert_eq!(compact_bits(spread_bits(deep)), deep);
    }

    #[test]
    fn children_are_consecutive() {
        let parent = FacePixel::from_nested(37, 2);
        for child in 37 * 4..37 * 4 + 4 {
            let c = FacePixel::from_nested(child, 3);
            assert_eq!(c.face, parent.face);
            assert_eq!((c.ix / 2, c.iy / 2), (parent.ix, parent.iy));
        }
    }

    #[test]
    fn every_pixel_center_maps_back_to_itself() {
        for order in 0..5 {
            for pixel in 0..npix(order) {
                assert_eq!(
                    pixel_of_vec(&center_vec(pixel, order), order),
                    pixel,
                    "order {order}, pixel {pixel}"
                );
                let (lon, lat) = center(pixel, order);
                assert_eq!(pixel_of(lon, lat, order), pixel);
            }
        }
    }

    #[test]
    fn all_pixels_covered() {
        for order in 0..3 {
            let mut seen = vec![false; npix(order) as usize];
            let n = 300;
            for i in 0..n {
                let lon = -180.0 + 360.0 * i as f64 / n as f64;
                for j in 0..n {
                    let lat = -90.0 + 180.0 * j as f64 / (n - 1) as f64;
                    seen[pixel_of(lon, lat, order) as usize] = true;
                }
            }
            assert!(seen.iter().all(|&v| v), "order {order} has uncovered pixels");
        }
    }

    #[test]
    fn face_layout() {
        assert_eq!(pixel_of(45.0, 60.0, 0), 0);
        assert_eq!(pixel_of(135.0, 60.0, 0), 1);
        assert_eq!(pixel_of(0.0, 0.0, 0), 4);
        assert_eq!(pixel_of(90.0, 0.0, 0), 5);
        assert_eq!(pixel_of(45.0, -60.0, 0), 8);
        assert_eq!(pixel_of(-45.0, -60.0, 0), 11);
        // Pole points fall in the pixel touching the pole
        assert_eq!(pixel_of(10.0, 90.0, 3), FacePixel { face: 0, ix: 7, iy: 7 }.to_nested(3));
    }

    #[test]
    fn corners_surround_center() {
        for order in 0..4 {
            for pixel in 0..npix(order) {
                let center = center_vec(pixel, order);
                let radius = corner_radius(pixel, order);
                assert!(radius > 0.0);
                // Corners are roughly one pixel away from the center
                assert!(radius < 2.0 * pixel_area(order).sqrt() + 0.1);
                for corner in corners(pixel, order) {
                    assert!((corner.norm() - 1.0).abs() < EPS);
                    assert!(angular_distance(&center, &corner) <= radius + EPS);
                }
            }
        }
    }

    #[test]
    fn north_cap_base_cell_touches_pole() {
        let [north, ..] = corners(0, 0);
        assert!((north.z - 1.0).abs() < EPS);
        let [.., south, _] = corners(8, 0);
        assert!((south.z + 1.0).abs() < EPS);
    }

    #[test]
    fn adjacent_pixels_share_corners() {
        // Pixel 0 at order 1 and its east sibling 1 share an edge
        let a = corners(0, 1);
        let b = corners(1, 1);
        let shared = a
            .iter()
            .filter(|ca| b.iter().any(|cb| angular_distance(ca, cb) < EPS))
            .count();
        assert_eq!(shared, 2);
    }

    #[test]
    fn disc_query_contains_center_pixel() {
        for (lon, lat) in [(10.0, 20.0), (179.9, -45.0), (-60.0, 89.0), (0.0, -89.5)] {
            let order = 5;
            let pixel = pixel_of(lon, lat, order);
            let found = query_disc_inclusive_deg(lon, lat, 0.01, order);
            assert!(found.contains(&pixel), "({lon},{lat}) missing {pixel}");
            assert!(found.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn disc_query_is_inclusive() {
        // Every pixel whose center lies inside the disc must be returned
        let order = 4;
        let (lon, lat) = (33.0, 12.0);
        let radius = 0.15;
        let center = to_vec3(lon, lat);
        let found = query_disc_inclusive(&center, radius, order);
        for pixel in 0..npix(order) {
            if angular_distance(&center, &center_vec(pixel, order)) <= radius {
                assert!(found.contains(&pixel), "pixel {pixel} missing");
            }
        }
    }

    #[test]
    fn whole_sky_disc_returns_every_pixel() {
        let found = query_disc_inclusive_deg(0.0, 0.0, PI, 2);
        assert_eq!(found.len() as u64, npix(2));
    }

    #[test]
    fn descendant_and_ancestor() {
        assert_eq!(descendant_range(3, 2, 2), (3, 3));
        assert_eq!(descendant_range(3, 2, 3), (12, 15));
        assert_eq!(descendant_range(1, 0, 2), (16, 31));
        assert_eq!(ancestor(31, 2, 0), 1);
        assert_eq!(ancestor(15, 3, 2), 3);

        let pixel = pixel_of(40.0, 40.0, 5);
        let parent = pixel_of(40.0, 40.0, 2);
        assert_eq!(ancestor(pixel, 5, 2), parent);
        let (lo, hi) = descendant_range(parent, 2, 5);
        assert!((lo..=hi).contains(&pixel));
    }
}
