//! Core library for indexing sky-survey footprints on a HEALPix grid and
//! serving them as HiPS-style GeoJSON tiles.
//!
//! This library ingests GeoJSON feature collections describing survey
//! footprints, splits them on a HEALPix grid, stores the pieces in an indexed
//! feature table, answers structured queries (filters and aggregations) and
//! renders per-cell GeoJSON tiles for queries registered under a content hash.
//!
//! # Examples
//!
//! ```no_run
//! use survey_tiles_core::{Engine, EngineConfig, FieldSpec, FieldType, Query};
//!
//! let engine = Engine::new(EngineConfig::default()).unwrap();
//! engine
//!     .init_schema(vec![FieldSpec::new("SurveyName", FieldType::String)])
//!     .unwrap();
//!
//! let geojson = std::fs::read_to_string("footprints.geojson").unwrap();
//! let report = engine.ingest_str(&geojson).unwrap();
//! println!("ingested {} features", report.features);
//!
//! let hash = engine.query_visual(&Query::default()).unwrap();
//! let tile = engine.get_tile(&hash, 2, 17).unwrap();
//! ```

use serde::Deserialize;
use thiserror::Error;

pub mod aggregate;
pub mod cache;
pub mod compile;
pub mod engine;
pub mod expr;
pub mod healpix;
pub mod normalize;
pub mod partition;
pub mod query;
pub mod schema;
pub mod sphere;
pub mod store;
pub mod tile;

pub use engine::{Engine, IngestReport, QueryResponse};
pub use query::{Aggregation, AggregationOp, Constraint, Operation, Query};
pub use schema::{FieldSpec, FieldType};
pub use tile::{TileAddress, TileProperties};

/// Errors produced by the indexing and query engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed geometry at feature {feature}: {reason}")]
    MalformedGeometry { feature: usize, reason: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Intersection failed: {0}")]
    IntersectionFailure(String),

    #[error("Invalid expression: {0}")]
    Expression(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for the indexing engine and its tile service
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// HEALPix order used to split and index features
    pub healpix_order: u8,
    /// Features larger than this many cells (by area) are only rendered on the all-sky tile
    pub large_footprint_cells: f64,
    /// Highest tile order advertised to clients
    pub tile_order: u8,
    /// Lowest tile order advertised to clients
    pub tile_order_min: u8,
    /// Tiles at or below this order render plain cell outlines
    pub outline_max_order: u8,
    /// Advertised tile width
    pub tile_width: u32,
    /// Advertised tile set title
    pub title: String,
    /// Revision key of the serving code and data, mixed into every query hash
    pub base_hash_key: String,
    /// Property holding the geogroup id of a feature
    pub geogroup_field: String,
    /// Property used to synthesize a geogroup id when `geogroup_field` is missing
    pub geogroup_fallback_field: String,
    /// Number of query workers (0 lets rayon decide)
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            healpix_order: 5,
            large_footprint_cells: 8.0,
            tile_order: 2,
            tile_order_min: 1,
            outline_max_order: 1,
            tile_width: 400,
            title: "Survey Geojson".to_string(),
            base_hash_key: String::new(),
            geogroup_field: "fieldID".to_string(),
            geogroup_fallback_field: "SurveyName".to_string(),
            workers: 0,
        }
    }
}

impl EngineConfig {
    /// Create a config splitting features at the given HEALPix order.
    pub fn new(healpix_order: u8) -> Self {
        Self {
            healpix_order,
            ..Default::default()
        }
    }

    /// Set the revision key mixed into query hashes.
    pub fn with_base_hash_key(mut self, key: impl Into<String>) -> Self {
        self.base_hash_key = key.into();
        self
    }

    /// Set the large-footprint cutoff, as a multiple of one cell's area.
    pub fn with_large_footprint_cells(mut self, cells: f64) -> Self {
        self.large_footprint_cells = cells;
        self
    }

    /// Set the advertised tile order range.
    pub fn with_tile_orders(mut self, order_min: u8, order: u8) -> Self {
        self.tile_order_min = order_min;
        self.tile_order = order;
        self
    }

    /// Set the number of query workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Check the config for values the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.healpix_order > healpix::MAX_ORDER {
            return Err(Error::Config(format!(
                "healpix order {} exceeds maximum {}",
                self.healpix_order,
                healpix::MAX_ORDER
            )));
        }
        if !(self.large_footprint_cells.is_finite() && self.large_footprint_cells > 0.0) {
            return Err(Error::Config(format!(
                "large footprint cutoff must be positive, got {}",
                self.large_footprint_cells
            )));
        }
        if self.tile_order_min > self.tile_order {
            return Err(Error::Config(format!(
                "tile order min {} is above tile order {}",
                self.tile_order_min, self.tile_order
            )));
        }
        Ok(())
    }
}

/// A survey configuration document: the field schema plus engine settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SurveyConfig {
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl SurveyConfig {
    /// Parse a survey configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
