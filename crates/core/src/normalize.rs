//! Geometry decoding and longitude normalization.
//!
//! Every ingested footprint goes through [`decode_geometry`] (structural
//! validation of the raw GeoJSON coordinates) and then [`normalize_geometry`],
//! which puts longitudes into one contiguous convention per feature:
//!
//! 1. Longitudes above 180° are wrapped by −360° (and below −180° by +360°).
//! 2. If the geometry has vertices on both sides of the antimeridian
//!    (some lon ≥ 90° and some lon ≤ −90°), all negative longitudes are
//!    shifted by +360° so the rings have no false wraparound seam.

use geo::{Coord, Geometry, LineString, MapCoordsInPlace, MultiPolygon, Polygon};
use geojson::{PolygonType, Position, Value};

use crate::{Error, Result};

/// Longitudes beyond this magnitude cannot be brought into range by one wrap.
const MAX_ABS_LONGITUDE: f64 = 360.0;

/// Decode and validate a polygonal GeoJSON geometry.
///
/// Only `Polygon` and `MultiPolygon` are accepted. Rings need at least four
/// positions, every position needs finite lon/lat and |lat| ≤ 90°.
///
/// # Arguments
///
/// * `value` - Raw GeoJSON geometry value
/// * `feature` - Index of the feature in its collection, used in errors
pub fn decode_geometry(value: &Value, feature: usize) -> Result<Geometry<f64>> {
    match value {
        Value::Polygon(rings) => Ok(Geometry::Polygon(decode_polygon(rings, feature)?)),
        Value::MultiPolygon(polygons) => {
            if polygons.is_empty() {
                return Err(malformed(feature, "multipolygon has no parts"));
            }
            let parts = polygons
                .iter()
                .map(|rings| decode_polygon(rings, feature))
                .collect::<Result<Vec<_>>>()?;
            Ok(Geometry::MultiPolygon(MultiPolygon(parts)))
        }
        other => Err(malformed(
            feature,
            format!("unsupported geometry type {}", value_type(other)),
        )),
    }
}

fn value_type(value: &Value) -> &'static str {
    match value {
        Value::Point(_) => "Point",
        Value::MultiPoint(_) => "MultiPoint",
        Value::LineString(_) => "LineString",
        Value::MultiLineString(_) => "MultiLineString",
        Value::Polygon(_) => "Polygon",
        Value::MultiPolygon(_) => "MultiPolygon",
        Value::GeometryCollection(_) => "GeometryCollection",
    }
}

fn decode_polygon(rings: &PolygonType, feature: usize) -> Result<Polygon<f64>> {
    let Some((exterior, interiors)) = rings.split_first() else {
        return Err(malformed(feature, "polygon has no rings"));
    };
    let exterior = decode_ring(exterior, "exterior ring", feature)?;
    let interiors = interiors
        .iter()
        .enumerate()
        .map(|(i, ring)| decode_ring(ring, &format!("interior ring {i}"), feature))
        .collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn decode_ring(ring: &[Position], name: &str, feature: usize) -> Result<LineString<f64>> {
    if ring.len() < 4 {
        return Err(malformed(
            feature,
            format!("{name} must have at least 4 positions, got {}", ring.len()),
        ));
    }

    let mut coords = Vec::with_capacity(ring.len());
    for (idx, position) in ring.iter().enumerate() {
        let (lon, lat) = match position.as_slice() {
            [lon, lat, ..] => (*lon, *lat),
            _ => {
                return Err(malformed(
                    feature,
                    format!("{name} position {idx} has fewer than 2 values"),
                ))
            }
        };
        if !lon.is_finite() || !lat.is_finite() {
            return Err(malformed(
                feature,
                format!("{name} has a non-finite coordinate at index {idx}"),
            ));
        }
        if lat.abs() > 90.0 {
            return Err(malformed(
                feature,
                format!("{name} latitude {lat} out of range at index {idx}"),
            ));
        }
        if lon.abs() > MAX_ABS_LONGITUDE {
            return Err(malformed(
                feature,
                format!("{name} longitude {lon} out of range at index {idx}"),
            ));
        }
        coords.push(Coord { x: lon, y: lat });
    }
    Ok(LineString::new(coords))
}

fn malformed(feature: usize, reason: impl Into<String>) -> Error {
    Error::MalformedGeometry {
        feature,
        reason: reason.into(),
    }
}

/// Normalize longitudes in place: wrap into [-180, 180), then shift negative
/// longitudes by +360° when the geometry straddles the antimeridian.
pub fn normalize_geometry(geom: &mut Geometry<f64>) {
    geom.map_coords_in_place(|c| Coord {
        x: wrap_longitude(c.x),
        y: c.y,
    });
    if crosses_antimeridian(geom) {
        geom.map_coords_in_place(|c| Coord {
            x: if c.x < 0.0 { c.x + 360.0 } else { c.x },
            y: c.y,
        });
    }
}

/// Same as [`normalize_geometry`] for a single polygon.
pub fn normalize_polygon(poly: &mut Polygon<f64>) {
    let mut geom = Geometry::Polygon(std::mem::replace(
        poly,
        Polygon::new(LineString::new(vec![]), vec![]),
    ));
    normalize_geometry(&mut geom);
    if let Geometry::Polygon(p) = geom {
        *poly = p;
    }
}

fn wrap_longitude(lon: f64) -> f64 {
    if (-180.0..180.0).contains(&lon) {
        lon
    } else {
        (lon + 180.0).rem_euclid(360.0) - 180.0
    }
}

/// Whether a geometry has vertices on both sides of the antimeridian.
pub fn crosses_antimeridian(geom: &Geometry<f64>) -> bool {
    use geo::CoordsIter;

    let mut east = false;
    let mut west = false;
    for c in geom.coords_iter() {
        east |= c.x >= 90.0;
        west |= c.x <= -90.0;
        if east && west {
            return true;
        }
    }
    false
}

/// Largest longitude step between consecutive vertices of any ring.
pub fn max_longitude_jump(geom: &Geometry<f64>) -> f64 {
    let rings: Vec<&LineString<f64>> = match geom {
        Geometry::Polygon(p) => std::iter::once(p.exterior())
            .chain(p.interiors())
            .collect(),
        Geometry::MultiPolygon(mp) => mp
            .0
            .iter()
            .flat_map(|p| std::iter::once(p.exterior()).chain(p.interiors()))
            .collect(),
        _ => Vec::new(),
    };
    rings
        .iter()
        .flat_map(|ring| ring.0.windows(2).map(|w| (w[1].x - w[0].x).abs()))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(lon0: f64, lon1: f64, lat0: f64, lat1: f64) -> Value {
        Value::Polygon(vec![vec![
            vec![lon0, lat0],
            vec![lon1, lat0],
            vec![lon1, lat1],
            vec![lon0, lat1],
            vec![lon0, lat0],
        ]])
    }

    fn lons(geom: &Geometry<f64>) -> Vec<f64> {
        use geo::CoordsIter;
        geom.coords_iter().map(|c| c.x).collect()
    }

    // ========== Decoding Tests ==========

    #[test]
    fn test_decode_polygon() {
        let geom = decode_geometry(&square(10.0, 12.0, -1.0, 1.0), 0).unwrap();
        match geom {
            Geometry::Polygon(p) => assert_eq!(p.exterior().0.len(), 5),
            other => panic!("expected polygon, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_multipolygon() {
        let value = Value::MultiPolygon(vec![
            match square(0.0, 1.0, 0.0, 1.0) {
                Value::Polygon(p) => p,
                _ => unreachable!(),
            },
            match square(5.0, 6.0, 0.0, 1.0) {
                Value::Polygon(p) => p,
                _ => unreachable!(),
            },
        ]);
        match decode_geometry(&value, 0).unwrap() {
            Geometry::MultiPolygon(mp) => assert_eq!(mp.0.len(), 2),
            other => panic!("expected multipolygon, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_points_and_lines() {
        let err = decode_geometry(&Value::Point(vec![1.0, 2.0]), 7).unwrap_err();
        assert!(matches!(err, Error::MalformedGeometry { feature: 7, .. }));
        let line = Value::LineString(vec![vec![0.0, 0.0], vec![1.0, 1.0]]);
        assert!(decode_geometry(&line, 0).is_err());
    }

    #[test]
    fn test_rejects_short_ring() {
        let value = Value::Polygon(vec![vec![vec![0.0, 0.0], vec![1.0, 0.0], vec![0.0, 0.0]]]);
        let err = decode_geometry(&value, 2).unwrap_err();
        assert!(err.to_string().contains("at least 4 positions"));
    }

    #[test]
    fn test_rejects_bad_coordinates() {
        let nan = Value::Polygon(vec![vec![
            vec![0.0, 0.0],
            vec![f64::NAN, 0.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ]]);
        assert!(decode_geometry(&nan, 0).is_err());
        assert!(decode_geometry(&square(0.0, 1.0, 89.0, 91.0), 0).is_err());
        assert!(decode_geometry(&square(0.0, 400.0, 0.0, 1.0), 0).is_err());

        let short = Value::Polygon(vec![vec![
            vec![0.0, 0.0],
            vec![1.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ]]);
        assert!(decode_geometry(&short, 0).is_err());
        assert!(decode_geometry(&Value::Polygon(vec![]), 0).is_err());
    }

    // ========== Normalization Tests ==========

    #[test]
    fn test_wrap_longitudes_above_180() {
        let mut geom = decode_geometry(&square(200.0, 210.0, 0.0, 5.0), 0).unwrap();
        normalize_geometry(&mut geom);
        assert!(lons(&geom).iter().all(|&x| (-160.0..=-150.0).contains(&x)));
    }

    #[test]
    fn test_longitude_180_maps_to_minus_180() {
        assert_eq!(wrap_longitude(180.0), -180.0);
        assert_eq!(wrap_longitude(-180.0), -180.0);
        assert_eq!(wrap_longitude(540.0), -180.0);
        assert_eq!(wrap_longitude(359.0), -1.0);

        // A footprint touching the seam from the west side stays contiguous
        let mut geom = decode_geometry(&square(-180.0, -175.0, 0.0, 5.0), 0).unwrap();
        normalize_geometry(&mut geom);
        assert!(lons(&geom).iter().all(|&x| (-180.0..=-175.0).contains(&x)));

        let mut geom = decode_geometry(&square(180.0, 185.0, 0.0, 5.0), 0).unwrap();
        normalize_geometry(&mut geom);
        assert!(lons(&geom).iter().all(|&x| (-180.0..=-175.0).contains(&x)));
    }

    #[test]
    fn test_antimeridian_crossing_becomes_contiguous() {
        // 179 -> 181 wraps to 179 -> -179, then negatives shift to 181
        let mut geom = decode_geometry(&square(179.0, 181.0, -1.0, 1.0), 0).unwrap();
        normalize_geometry(&mut geom);
        assert!(lons(&geom).iter().all(|&x| (179.0..=181.0).contains(&x)));
        assert!(max_longitude_jump(&geom) <= 180.0);
    }

    #[test]
    fn test_negative_side_crossing() {
        let mut geom = decode_geometry(&square(170.0, -170.0, 10.0, 20.0), 0).unwrap();
        assert!(max_longitude_jump(&geom) > 180.0);
        normalize_geometry(&mut geom);
        assert!(max_longitude_jump(&geom) <= 180.0);
        assert!(lons(&geom).iter().all(|&x| x >= 170.0));
    }

    #[test]
    fn test_ordinary_geometry_untouched() {
        let mut geom = decode_geometry(&square(-20.0, 20.0, 0.0, 5.0), 0).unwrap();
        let before = lons(&geom);
        normalize_geometry(&mut geom);
        assert_eq!(lons(&geom), before);
        assert!(!crosses_antimeridian(&geom));
    }

    #[test]
    fn test_normalize_polygon_in_place() {
        let mut poly = match decode_geometry(&square(179.5, 180.5, 0.0, 1.0), 0).unwrap() {
            Geometry::Polygon(p) => p,
            _ => unreachable!(),
        };
        normalize_polygon(&mut poly);
        assert!(poly.exterior().0.iter().all(|c| c.x >= 179.5 && c.x <= 180.5));
    }
}
