//! The engine façade: schema setup, ingestion, queries and tiles.
//!
//! The engine owns the current feature store snapshot behind a lock and swaps
//! it wholesale after each ingestion, so readers see either the previous or
//! the next complete store. Queries and tile renders run on a dedicated rayon
//! pool and block the caller until done.

use std::sync::Arc;

use geojson::FeatureCollection;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

use crate::aggregate;
use crate::cache::QueryCache;
use crate::compile::CompiledQuery;
use crate::partition::{CellPolygonCache, Partitioner};
use crate::query::Query;
use crate::schema::{FieldSpec, Schema};
use crate::store::{FeatureStore, GeogroupRule, StoreBuilder};
use crate::tile::{self, TileAddress, TileProperties};
use crate::{EngineConfig, Error, Result, SurveyConfig};

pub use crate::store::IngestReport;

/// Result of a query: the query as understood plus its output rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    #[serde(rename = "q")]
    pub query: Query,
    /// Feature rows, or a single row of aggregation outputs
    pub res: Vec<Value>,
}

impl QueryResponse {
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Spatial index and query engine over survey footprints
pub struct Engine {
    config: EngineConfig,
    cells: Arc<CellPolygonCache>,
    builder: Mutex<Option<StoreBuilder>>,
    store: RwLock<Option<Arc<FeatureStore>>>,
    cache: QueryCache,
    workers: rayon::ThreadPool,
}

impl Engine {
    /// Create an engine with no schema and no data.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("query-worker-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("failed to start query workers: {e}")))?;

        Ok(Self {
            config,
            cells: Arc::new(CellPolygonCache::new()),
            builder: Mutex::new(None),
            store: RwLock::new(None),
            cache: QueryCache::new(),
            workers,
        })
    }

    /// Create an engine from a survey configuration and declare its schema.
    pub fn from_survey(survey: SurveyConfig) -> Result<Self> {
        let engine = Self::new(survey.engine)?;
        engine.init_schema(survey.fields)?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Declare the field schema and start an empty data epoch.
    ///
    /// Calling it again discards all ingested data.
    pub fn init_schema(&self, fields: Vec<FieldSpec>) -> Result<()> {
        let schema = Arc::new(Schema::new(fields)?);
        let builder = self.new_builder(schema);
        log::info!(
            "Initialized schema with {} fields at HEALPix order {}",
            builder.schema().len(),
            self.config.healpix_order
        );
        let mut slot = self.builder.lock();
        self.publish(builder.snapshot());
        *slot = Some(builder);
        Ok(())
    }

    /// Ingest one feature collection into the current epoch.
    pub fn ingest(&self, collection: &FeatureCollection) -> Result<IngestReport> {
        let mut slot = self.builder.lock();
        let builder = slot.as_mut().ok_or_else(schema_missing)?;
        let report = builder.ingest(collection)?;
        self.publish(builder.snapshot());
        Ok(report)
    }

    /// Parse and ingest a GeoJSON FeatureCollection document.
    pub fn ingest_str(&self, text: &str) -> Result<IngestReport> {
        let collection: FeatureCollection = serde_json::from_str(text)?;
        self.ingest(&collection)
    }

    /// Replace all data with the given collections.
    ///
    /// The new store is built aside and swapped in once complete; on error the
    /// previous data stays in place.
    pub fn reload(&self, collections: &[FeatureCollection]) -> Result<IngestReport> {
        let mut slot = self.builder.lock();
        let schema = slot
            .as_ref()
            .map(StoreBuilder::schema)
            .cloned()
            .ok_or_else(schema_missing)?;

        let mut builder = self.new_builder(schema);
        let mut report = IngestReport::default();
        for collection in collections {
            report.absorb(builder.ingest(collection)?);
        }
        self.publish(builder.snapshot());
        *slot = Some(builder);
        log::info!(
            "Reloaded {} collections: {} features, {} pieces",
            collections.len(),
            report.features,
            report.pieces
        );
        Ok(report)
    }

    /// Run a query against the current data.
    pub fn query(&self, query: &Query) -> Result<QueryResponse> {
        let store = self.current_store()?;
        let compiled = CompiledQuery::compile(query, store.schema())?;
        let res = self.workers.install(|| execute(&store, &compiled));
        log::debug!("Query returned {} rows", res.len());
        Ok(QueryResponse {
            query: query.clone(),
            res,
        })
    }

    /// Decode and run a JSON query, returning `{q, res}`.
    pub fn query_json(&self, text: &str) -> Result<Value> {
        let query = Query::from_json(text)?;
        self.query(&query)?.to_json()
    }

    /// Register a query for tile rendering and return its hash.
    ///
    /// The hash depends on the query, the configured base key and the current
    /// data epoch.
    pub fn query_visual(&self, query: &Query) -> Result<String> {
        // Register under the store read lock; publish prunes the cache while
        // holding the write lock.
        let guard = self.store.read();
        let store = guard.as_ref().ok_or_else(schema_missing)?;
        CompiledQuery::compile(query, store.schema())?;
        let base_key = format!("{}:{:016x}", self.config.base_hash_key, store.data_key());
        self.cache.insert(query, &base_key, store.data_key())
    }

    /// Tile set properties for a registered query.
    pub fn tile_properties(&self, hash: &str) -> Option<TileProperties> {
        let store = self.current_store().ok()?;
        self.cache.get(hash, store.data_key())?;
        Some(TileProperties::from_config(&self.config))
    }

    /// Render the tile at `(order, pixel)` for a registered query.
    ///
    /// Unknown hashes and tiles without matching data are `None`.
    pub fn get_tile(&self, hash: &str, order: u8, pixel: u64) -> Result<Option<FeatureCollection>> {
        self.render_tile(hash, TileAddress::cell(order, pixel)?)
    }

    /// Render the all-sky tile for a registered query.
    pub fn get_all_sky_tile(&self, hash: &str) -> Result<Option<FeatureCollection>> {
        self.render_tile(hash, TileAddress::AllSky)
    }

    /// Render a tile addressed by its HiPS path.
    pub fn get_tile_by_path(&self, hash: &str, path: &str) -> Result<Option<FeatureCollection>> {
        self.render_tile(hash, TileAddress::from_path(path)?)
    }

    /// Data epoch key of the current store.
    pub fn data_key(&self) -> Option<u64> {
        self.store.read().as_ref().map(|s| s.data_key())
    }

    /// Number of ingested features in the current store.
    pub fn feature_count(&self) -> usize {
        self.store.read().as_ref().map_or(0, |s| s.feature_count())
    }

    fn render_tile(&self, hash: &str, address: TileAddress) -> Result<Option<FeatureCollection>> {
        let Some(store) = self.store.read().clone() else {
            return Ok(None);
        };
        let Some(entry) = self.cache.get(hash, store.data_key()) else {
            log::debug!("Unknown query hash {}", hash);
            return Ok(None);
        };

        let order = self.config.healpix_order;
        let restricted = address.restrict(&entry.query, order);
        let compiled = CompiledQuery::compile(&restricted, store.schema())?;
        let lod = address.level_of_detail(self.config.outline_max_order);

        let tile = self.workers.install(|| {
            let rows = compiled.select(&store);
            tile::render(
                &store,
                &rows,
                lod,
                &self.cells,
                order,
                &self.config.geogroup_fallback_field,
            )
        });
        log::debug!(
            "Tile {} for {}: {}",
            address,
            hash,
            tile.as_ref()
                .map_or("empty".to_string(), |t| format!("{} features", t.features.len()))
        );
        Ok(tile)
    }

    fn new_builder(&self, schema: Arc<Schema>) -> StoreBuilder {
        let partitioner = Partitioner::new(
            self.config.healpix_order,
            self.config.large_footprint_cells,
            Arc::clone(&self.cells),
        );
        let rule = GeogroupRule::new(
            self.config.geogroup_field.as_str(),
            self.config.geogroup_fallback_field.as_str(),
        );
        let seed = xxhash_rust::xxh3::xxh3_64(self.config.base_hash_key.as_bytes());
        StoreBuilder::new(schema, partitioner, rule, seed)
    }

    fn publish(&self, store: FeatureStore) {
        let data_key = store.data_key();
        let mut slot = self.store.write();
        *slot = Some(Arc::new(store));
        let dropped = self.cache.retain_epoch(data_key);
        drop(slot);
        if dropped > 0 {
            log::debug!("Dropped {} visual queries of the previous epoch", dropped);
        }
    }

    fn current_store(&self) -> Result<Arc<FeatureStore>> {
        self.store.read().clone().ok_or_else(schema_missing)
    }
}

fn schema_missing() -> Error {
    Error::Schema("schema not initialized".to_string())
}

fn execute(store: &FeatureStore, compiled: &CompiledQuery) -> Vec<Value> {
    let rows = compiled.select(store);
    if !compiled.aggregations.is_empty() {
        return vec![Value::Object(aggregate::run(store, &rows, &compiled.aggregations))];
    }
    compiled
        .page(&rows)
        .iter()
        .map(|&row| Value::Object(compiled.render_row(store.record(row))))
        .collect()
}
