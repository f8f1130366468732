//! Splitting footprints on the HEALPix grid.
//!
//! A footprint is split into [`Piece`]s, one per HEALPix cell it overlaps at
//! the storage order. Intersections are computed in a rotated frame centered
//! on the footprint so that neither the poles nor the antimeridian seam sit
//! near the planar boolean operation.
//!
//! Footprints whose area exceeds a configured multiple of one cell's area are
//! not split: they are kept whole and pinned to the all-sky index `-1`.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use geo::{
    Area, BooleanOps, BoundingRect, Centroid, Coord, CoordsIter, Geometry, Intersects, LineString,
    MultiPolygon, Polygon, RemoveRepeatedPoints,
};
use parking_lot::RwLock;

use crate::healpix;
use crate::normalize::normalize_polygon;
use crate::sphere::{angular_distance, spherical_area, to_lon_lat, to_vec3, FrameRotation};
use crate::{Error, Result};

/// HEALPix index of pieces that only render on the all-sky tile.
pub const ALL_SKY_INDEX: i64 = -1;

/// Corners closer than this (radians) to a pole are expanded into two vertices.
const POLE_EPSILON: f64 = 1e-7;

/// Intersection parts smaller than this (square degrees in the rotated frame)
/// are numerical residue.
const MIN_PIECE_AREA: f64 = 1e-10;

/// One cell-bound part of a footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Piece {
    /// Cell at the storage order, or [`ALL_SKY_INDEX`]
    pub healpix_index: i64,
    pub polygon: Polygon<f64>,
}

/// Lazily built lon/lat outlines of HEALPix cells, shared across splits.
///
/// Outlines are pure functions of `(order, pixel)`, so entries never expire.
#[derive(Debug, Default)]
pub struct CellPolygonCache {
    cells: RwLock<HashMap<(u8, u64), Arc<Polygon<f64>>>>,
}

impl CellPolygonCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outline of a cell, building and caching it on first use.
    pub fn get(&self, order: u8, pixel: u64) -> Arc<Polygon<f64>> {
        if let Some(cell) = self.cells.read().get(&(order, pixel)) {
            return Arc::clone(cell);
        }
        let cell = Arc::new(cell_polygon(order, pixel));
        self.cells
            .write()
            .entry((order, pixel))
            .or_insert(cell)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }
}

/// Build the lon/lat outline of a cell.
///
/// A corner sitting on a pole has no meaningful longitude. It is replaced by
/// two polar vertices that take the longitudes of its ring neighbours, so the
/// outline stays a simple ring in lon/lat.
pub fn cell_polygon(order: u8, pixel: u64) -> Polygon<f64> {
    let corners: Vec<(f64, f64)> = healpix::corners(pixel, order)
        .iter()
        .map(to_lon_lat)
        .collect();

    let pole_lat = 90.0 - POLE_EPSILON.to_degrees();
    let n = corners.len();
    let mut ring = Vec::with_capacity(n + 2);
    for i in 0..n {
        let (lon, lat) = corners[i];
        if lat.abs() > pole_lat {
            let prev = corners[(i + n - 1) % n];
            let next = corners[(i + 1) % n];
            ring.push(Coord { x: prev.0, y: lat });
            ring.push(Coord { x: next.0, y: lat });
        } else {
            ring.push(Coord { x: lon, y: lat });
        }
    }

    // Polygon::new closes the ring
    let mut poly = Polygon::new(LineString::new(ring), vec![]);
    normalize_polygon(&mut poly);
    poly
}

/// Splits footprints on the grid at a fixed order.
#[derive(Debug, Clone)]
pub struct Partitioner {
    order: u8,
    large_footprint_cells: f64,
    cells: Arc<CellPolygonCache>,
}

impl Partitioner {
    /// Create a partitioner.
    ///
    /// # Arguments
    ///
    /// * `order` - HEALPix storage order
    /// * `large_footprint_cells` - Area cutoff, as a multiple of one cell's area
    /// * `cells` - Shared cell outline cache
    pub fn new(order: u8, large_footprint_cells: f64, cells: Arc<CellPolygonCache>) -> Self {
        Self {
            order,
            large_footprint_cells,
            cells,
        }
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    pub fn cells(&self) -> &Arc<CellPolygonCache> {
        &self.cells
    }

    /// Area (steradians) above which a footprint is pinned to the all-sky tile.
    pub fn area_cutoff(&self) -> f64 {
        self.large_footprint_cells * healpix::pixel_area(self.order)
    }

    /// Split a normalized polygonal geometry into cell-bound pieces.
    ///
    /// Returns an empty list when nothing intersects; that indicates a
    /// geometry or radius problem and is logged.
    pub fn split(&self, geom: &Geometry<f64>) -> Vec<Piece> {
        let geom = merge_parts(geom);
        let parts = polygons(&geom);
        if parts.is_empty() {
            return Vec::new();
        }

        if spherical_area(&geom) > self.area_cutoff() {
            return parts
                .into_iter()
                .map(|polygon| Piece {
                    healpix_index: ALL_SKY_INDEX,
                    polygon,
                })
                .collect();
        }

        let Some(center) = geom.centroid().or_else(|| {
            geom.coords_iter()
                .next()
                .map(|c| geo::Point::new(c.x, c.y))
        }) else {
            return Vec::new();
        };
        let center = to_vec3(center.x(), center.y());
        let radius = geom
            .coords_iter()
            .map(|c| angular_distance(&center, &to_vec3(c.x, c.y)))
            .fold(0.0, f64::max);

        let rotation = FrameRotation::new(&center);
        let rotated: Vec<Polygon<f64>> = parts
            .iter()
            .map(|p| rotation.apply_polygon(p).remove_repeated_points())
            .collect();

        let mut pieces = Vec::new();
        for pixel in healpix::query_disc_inclusive(&center, radius, self.order) {
            let cell = self.cells.get(self.order, pixel);
            let rotated_cell = rotation.apply_polygon(&cell).remove_repeated_points();

            for part in &rotated {
                match robust_intersection(part, &rotated_cell) {
                    Ok(overlap) => {
                        for local in overlap {
                            let mut polygon = rotation.revert_polygon(&local);
                            normalize_polygon(&mut polygon);
                            pieces.push(Piece {
                                healpix_index: pixel as i64,
                                polygon,
                            });
                        }
                    }
                    Err(e) => {
                        log::trace!("cell {} treated as no overlap: {}", pixel, e);
                    }
                }
            }
        }

        if pieces.is_empty() {
            log::warn!(
                "footprint produced no pieces at order {} (radius {:.6} rad)",
                self.order,
                radius
            );
        }
        pieces
    }
}

/// Union the parts of a MultiPolygon; a single resulting polygon replaces the
/// geometry. A failing union leaves the geometry unchanged.
fn merge_parts(geom: &Geometry<f64>) -> Geometry<f64> {
    let Geometry::MultiPolygon(mp) = geom else {
        return geom.clone();
    };
    if mp.0.len() < 2 {
        return match mp.0.first() {
            Some(p) => Geometry::Polygon(p.clone()),
            None => geom.clone(),
        };
    }

    let merged = catch_unwind(AssertUnwindSafe(|| {
        mp.0.iter()
            .skip(1)
            .fold(MultiPolygon(vec![mp.0[0].clone()]), |acc, p| acc.union(p))
    }));
    match merged {
        Ok(union) if union.0.len() == 1 => union
            .0
            .into_iter()
            .next()
            .map(Geometry::Polygon)
            .unwrap_or_else(|| geom.clone()),
        Ok(union) if !union.0.is_empty() => Geometry::MultiPolygon(union),
        _ => {
            log::debug!("multipolygon union failed, keeping parts");
            geom.clone()
        }
    }
}

fn polygons(geom: &Geometry<f64>) -> Vec<Polygon<f64>> {
    match geom {
        Geometry::Polygon(p) => vec![p.clone()],
        Geometry::MultiPolygon(mp) => mp.0.clone(),
        _ => Vec::new(),
    }
}

/// Planar intersection that reports degenerate input and boolean-op panics
/// as [`Error::IntersectionFailure`] instead of aborting.
pub fn robust_intersection(a: &Polygon<f64>, b: &Polygon<f64>) -> Result<MultiPolygon<f64>> {
    for (name, poly) in [("feature", a), ("cell", b)] {
        if let Some(reason) = check_ring(poly.exterior()) {
            return Err(Error::IntersectionFailure(format!("{name} {reason}")));
        }
    }

    match (a.bounding_rect(), b.bounding_rect()) {
        (Some(ra), Some(rb)) if !ra.intersects(&rb) => return Ok(MultiPolygon(vec![])),
        (Some(_), Some(_)) => {}
        _ => return Err(Error::IntersectionFailure("empty bounds".to_string())),
    }

    let overlap = catch_unwind(AssertUnwindSafe(|| a.intersection(b)))
        .map_err(|_| Error::IntersectionFailure("boolean operation panicked".to_string()))?;

    Ok(MultiPolygon(
        overlap
            .0
            .into_iter()
            .filter(|p| p.unsigned_area() > MIN_PIECE_AREA)
            .collect(),
    ))
}

fn check_ring(ring: &LineString<f64>) -> Option<String> {
    let coords = &ring.0;
    if coords.len() < 4 {
        return Some("ring must have at least 3 distinct points".to_string());
    }
    if let Some(idx) = coords
        .iter()
        .position(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return Some(format!("ring has a non-finite coordinate at index {idx}"));
    }
    None
}
