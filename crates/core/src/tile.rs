//! HiPS tile addressing, tile properties and GeoJSON tile rendering.
//!
//! Tiles are addressed as `Norder<N>/Dir<D>/Npix<M>` on the nested HEALPix
//! grid, plus one all-sky tile holding the footprints too large to split.
//! A tile is a pure function of a query, a cell and the current data: the
//! query's constraints are restricted to the cell, matching pieces are grouped
//! and each group becomes one output feature with summarized properties.

use std::collections::HashMap;
use std::fmt;

use geojson::{Feature, FeatureCollection, JsonObject};
use serde::Serialize;
use serde_json::Value;

use crate::aggregate::CellSummary;
use crate::healpix::{self, MAX_ORDER};
use crate::partition::{CellPolygonCache, ALL_SKY_INDEX};
use crate::query::{Constraint, Operation, Query};
use crate::store::FeatureStore;
use crate::{EngineConfig, Error, Result};

/// HiPS directory bucket size
const DIR_SIZE: u64 = 10_000;

/// Address of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileAddress {
    /// Nested cell at a HiPS order
    Cell { order: u8, pixel: u64 },
    /// Coarsest overview holding unsplit large footprints
    AllSky,
}

impl TileAddress {
    /// Validated cell address.
    pub fn cell(order: u8, pixel: u64) -> Result<Self> {
        if order > MAX_ORDER {
            return Err(Error::InvalidQuery(format!(
                "tile order {order} exceeds {MAX_ORDER}"
            )));
        }
        if pixel >= healpix::npix(order) {
            return Err(Error::InvalidQuery(format!(
                "pixel {pixel} out of range at order {order}"
            )));
        }
        Ok(TileAddress::Cell { order, pixel })
    }

    /// HiPS directory number of a cell tile.
    pub fn dir(&self) -> Option<u64> {
        match self {
            TileAddress::Cell { pixel, .. } => Some(pixel / DIR_SIZE * DIR_SIZE),
            TileAddress::AllSky => None,
        }
    }

    /// Relative tile path, without extension.
    pub fn path(&self) -> String {
        match self {
            TileAddress::Cell { order, pixel } => {
                format!("Norder{order}/Dir{}/Npix{pixel}", pixel / DIR_SIZE * DIR_SIZE)
            }
            TileAddress::AllSky => "Allsky".to_string(),
        }
    }

    /// Parse a tile path such as `Norder3/Dir0/Npix42.geojson` or `Allsky`.
    ///
    /// A leading slash and a file extension are ignored. The directory must
    /// match the pixel.
    pub fn from_path(path: &str) -> Result<Self> {
        let bad = || Error::InvalidQuery(format!("invalid tile path '{path}'"));
        let trimmed = path.trim_start_matches('/');
        let trimmed = match trimmed.rsplit_once('.') {
            Some((stem, ext)) if !ext.contains('/') => stem,
            _ => trimmed,
        };

        let parts: Vec<&str> = trimmed.split('/').collect();
        match parts.as_slice() {
            ["Allsky"] | [_, "Allsky"] => Ok(TileAddress::AllSky),
            [norder, dir, npix] => {
                let order: u8 = norder
                    .strip_prefix("Norder")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(bad)?;
                let dir: u64 = dir
                    .strip_prefix("Dir")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(bad)?;
                let pixel: u64 = npix
                    .strip_prefix("Npix")
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(bad)?;
                let address = TileAddress::cell(order, pixel)?;
                if address.dir() != Some(dir) {
                    return Err(bad());
                }
                Ok(address)
            }
            _ => Err(bad()),
        }
    }

    /// Constraint selecting the stored pieces belonging to this tile.
    ///
    /// Coarser tiles cover the range of their descendants at the storage
    /// order, finer tiles map to their ancestor cell.
    pub fn storage_constraint(&self, storage_order: u8) -> Constraint {
        let operation = match *self {
            TileAddress::AllSky => Operation::IntEqual(ALL_SKY_INDEX),
            TileAddress::Cell { order, pixel } if order == storage_order => {
                Operation::IntEqual(pixel as i64)
            }
            TileAddress::Cell { order, pixel } if order < storage_order => {
                let (lo, hi) = healpix::descendant_range(pixel, order, storage_order);
                Operation::NumberRange(lo as f64, hi as f64)
            }
            TileAddress::Cell { order, pixel } => {
                Operation::IntEqual(healpix::ancestor(pixel, order, storage_order) as i64)
            }
        };
        Constraint::new("healpix_index", operation)
    }

    /// Restrict a query to this tile. Only the constraints of `query` are
    /// kept; every matching piece is a row.
    pub fn restrict(&self, query: &Query, storage_order: u8) -> Query {
        let mut constraints = query.constraints.clone();
        constraints.push(self.storage_constraint(storage_order));
        Query {
            constraints,
            on_sub_features: true,
            ..Query::default()
        }
    }

    /// Level of detail rendered for this tile.
    pub fn level_of_detail(&self, outline_max_order: u8) -> LevelOfDetail {
        match self {
            TileAddress::Cell { order, .. } if *order <= outline_max_order => {
                LevelOfDetail::CellOutline
            }
            _ => LevelOfDetail::Footprint,
        }
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// How matching pieces are grouped and drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelOfDetail {
    /// One feature per storage cell, drawn as the cell outline
    CellOutline,
    /// One feature per cell and geogroup, drawn as its first piece
    Footprint,
}

/// HiPS properties of the tile set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileProperties {
    pub format: String,
    pub order: u8,
    pub order_min: u8,
    pub tile_width: u32,
    pub title: String,
}

impl TileProperties {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            format: "geojson".to_string(),
            order: config.tile_order,
            order_min: config.tile_order_min,
            tile_width: config.tile_width,
            title: config.title.clone(),
        }
    }
}

impl fmt::Display for TileProperties {
    /// Render as a HiPS `properties` file.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "hips_tile_format = {}", self.format)?;
        writeln!(f, "hips_order = {}", self.order)?;
        writeln!(f, "hips_order_min = {}", self.order_min)?;
        writeln!(f, "hips_tile_width = {}", self.tile_width)?;
        write!(f, "obs_title = {}", self.title)
    }
}

struct Group {
    first_row: usize,
    healpix_index: i64,
    geogroup_id: Option<String>,
    summary: CellSummary,
}

/// Render the pieces in `rows` as a tile.
///
/// Returns `None` when no rows match, so callers can serve an absent tile.
///
/// # Arguments
///
/// * `store` - Store the rows index into
/// * `rows` - Matching rows in storage order
/// * `lod` - Grouping and drawing mode
/// * `cells` - Cell outline cache at the storage order
/// * `storage_order` - HEALPix order of `healpix_index`
/// * `survey_field` - Property whose value always splits groups
pub fn render(
    store: &FeatureStore,
    rows: &[usize],
    lod: LevelOfDetail,
    cells: &CellPolygonCache,
    storage_order: u8,
    survey_field: &str,
) -> Option<FeatureCollection> {
    let schema = store.schema();
    let mut groups: Vec<Group> = Vec::new();
    let mut by_key: HashMap<(i64, Option<&str>, String), usize> = HashMap::new();

    for &row in rows {
        let record = store.record(row);
        let geogroup = match lod {
            LevelOfDetail::CellOutline => None,
            LevelOfDetail::Footprint => Some(record.geogroup_id.as_str()),
        };
        let survey = match record.properties.get(survey_field) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let idx = *by_key
            .entry((record.healpix_index, geogroup, survey))
            .or_insert_with(|| {
                groups.push(Group {
                    first_row: row,
                    healpix_index: record.healpix_index,
                    geogroup_id: geogroup.map(str::to_string),
                    summary: CellSummary::new(schema),
                });
                groups.len() - 1
            });
        groups[idx].summary.add(record);
    }

    if groups.is_empty() {
        return None;
    }

    let features = groups
        .into_iter()
        .map(|group| {
            let geometry = match lod {
                LevelOfDetail::CellOutline if group.healpix_index >= 0 => {
                    let outline = cells.get(storage_order, group.healpix_index as u64);
                    geojson::Geometry::new(geojson::Value::from(outline.as_ref()))
                }
                _ => store.record(group.first_row).geometry(),
            };

            let mut members = JsonObject::new();
            if let Some(id) = group.geogroup_id {
                members.insert("geogroup_id".to_string(), Value::from(id));
            }
            members.insert("healpix_index".to_string(), Value::from(group.healpix_index));
            members.insert("geogroup_size".to_string(), Value::from(group.summary.count()));

            Feature {
                bbox: None,
                geometry: Some(geometry),
                id: None,
                properties: Some(group.summary.to_properties(schema)),
                foreign_members: Some(members),
            }
        })
        .collect::<Vec<_>>();

    log::debug!("Rendered {} tile features from {} rows", features.len(), rows.len());
    Some(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}
