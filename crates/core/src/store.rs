//! The feature store: an immutable, indexed table of cell-bound pieces.
//!
//! A [`StoreBuilder`] accumulates ingested batches and produces
//! [`FeatureStore`] snapshots. A snapshot is never mutated; the engine swaps
//! in a new snapshot after each ingestion, so readers always see a complete
//! store.
//!
//! Every column (the built-in `id`, `geogroup_id`, `healpix_index` and one per
//! schema field) carries three indexes:
//! - exact-value postings for equality and set membership
//! - a postings list of rows where the value is undefined
//! - a value-sorted list for closed-interval range scans

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use geo::{Geometry, Polygon};
use geojson::FeatureCollection;
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::normalize::{decode_geometry, normalize_geometry};
use crate::partition::Partitioner;
use crate::schema::{ColumnRef, FieldValue, Schema};
use crate::{Error, Result};

/// Outcome of ingesting one feature collection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Features accepted into the store
    pub features: usize,
    /// Cell-bound pieces stored for those features
    pub pieces: usize,
    /// Features rejected as malformed
    pub rejected: usize,
    /// Accepted features that produced no piece
    pub empty: usize,
}

impl IngestReport {
    /// Add the counts of another batch.
    pub fn absorb(&mut self, other: IngestReport) {
        self.features += other.features;
        self.pieces += other.pieces;
        self.rejected += other.rejected;
        self.empty += other.empty;
    }
}

/// How geogroup ids are derived from feature properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeogroupRule {
    /// Property holding an explicit geogroup id
    pub field: String,
    /// Property prefixed to the feature id when `field` is missing
    pub fallback_field: String,
}

impl GeogroupRule {
    pub fn new(field: impl Into<String>, fallback_field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            fallback_field: fallback_field.into(),
        }
    }

    /// Geogroup id of a feature.
    pub fn derive(&self, props: &Map<String, Value>, feature_id: Option<&geojson::feature::Id>) -> String {
        if let Some(explicit) = props.get(&self.field).and_then(non_empty_text) {
            return explicit;
        }
        let prefix = props
            .get(&self.fallback_field)
            .and_then(non_empty_text)
            .unwrap_or_default();
        let suffix = match feature_id {
            Some(geojson::feature::Id::String(s)) => s.clone(),
            Some(geojson::feature::Id::Number(n)) => n.to_string(),
            None => String::new(),
        };
        prefix + &suffix
    }
}

fn non_empty_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One stored piece of an ingested feature.
#[derive(Debug, Clone)]
pub struct FeatureRecord {
    /// Id of the ingested feature; shared by all its pieces
    pub id: u64,
    pub geogroup_id: String,
    /// Cell at the storage order, or -1 for all-sky pieces
    pub healpix_index: i64,
    pub polygon: Polygon<f64>,
    /// Original properties, shared by all pieces of a feature
    pub properties: Arc<Map<String, Value>>,
    /// Materialized field values in schema order
    pub values: Arc<[Option<FieldValue>]>,
}

impl FeatureRecord {
    /// Value of a column, built-ins included.
    pub fn column_value(&self, column: ColumnRef) -> Option<Cow<'_, FieldValue>> {
        match column {
            ColumnRef::Id => Some(Cow::Owned(FieldValue::Number(self.id as f64))),
            ColumnRef::HealpixIndex => {
                Some(Cow::Owned(FieldValue::Number(self.healpix_index as f64)))
            }
            ColumnRef::GeogroupId => Some(Cow::Owned(FieldValue::Text(self.geogroup_id.clone()))),
            ColumnRef::Field(idx) => self.values.get(idx)?.as_ref().map(Cow::Borrowed),
        }
    }

    pub fn geometry(&self) -> geojson::Geometry {
        geojson::Geometry::new(geojson::Value::from(&self.polygon))
    }
}

/// Hashable key for exact-value postings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    Text(String),
    /// Bit pattern of an f64 with -0.0 folded into 0.0
    Number(u64),
}

impl IndexKey {
    pub fn number(n: f64) -> Self {
        let n = if n == 0.0 { 0.0 } else { n };
        IndexKey::Number(n.to_bits())
    }

    pub fn text(s: impl Into<String>) -> Self {
        IndexKey::Text(s.into())
    }

    pub fn of(value: &FieldValue) -> Self {
        match value {
            FieldValue::Text(s) => IndexKey::text(s.as_str()),
            FieldValue::Number(n) => IndexKey::number(*n),
            FieldValue::Date(ms) => IndexKey::number(*ms as f64),
            FieldValue::Json(v) => IndexKey::text(v.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct ColumnIndex {
    equal: HashMap<IndexKey, Vec<usize>>,
    undefined: Vec<usize>,
    sorted: Vec<(f64, usize)>,
}

impl ColumnIndex {
    fn build<'a>(values: impl Iterator<Item = Option<Cow<'a, FieldValue>>>) -> Self {
        let mut index = ColumnIndex::default();
        for (row, value) in values.enumerate() {
            match value {
                Some(v) => {
                    index.equal.entry(IndexKey::of(&v)).or_default().push(row);
                    if let Some(n) = v.as_number().filter(|n| !n.is_nan()) {
                        index.sorted.push((n, row));
                    }
                }
                None => index.undefined.push(row),
            }
        }
        index
            .sorted
            .sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        index
    }

    fn range(&self, lo: f64, hi: f64) -> Vec<usize> {
        let start = self.sorted.partition_point(|(v, _)| *v < lo);
        let mut rows: Vec<usize> = self.sorted[start..]
            .iter()
            .take_while(|(v, _)| *v <= hi)
            .map(|(_, row)| *row)
            .collect();
        rows.sort_unstable();
        rows
    }
}

/// Immutable snapshot of the feature table.
#[derive(Debug)]
pub struct FeatureStore {
    schema: Arc<Schema>,
    records: Vec<Arc<FeatureRecord>>,
    columns: HashMap<ColumnRef, ColumnIndex>,
    feature_count: usize,
    data_key: u64,
}

impl FeatureStore {
    /// An empty store for a schema.
    pub fn empty(schema: Arc<Schema>, data_key: u64) -> Self {
        Self::from_records(schema, Vec::new(), data_key)
    }

    fn from_records(schema: Arc<Schema>, records: Vec<Arc<FeatureRecord>>, data_key: u64) -> Self {
        let mut refs = vec![ColumnRef::Id, ColumnRef::GeogroupId, ColumnRef::HealpixIndex];
        refs.extend((0..schema.len()).map(ColumnRef::Field));

        let columns = refs
            .into_par_iter()
            .map(|column| {
                let index = ColumnIndex::build(records.iter().map(|r| r.column_value(column)));
                (column, index)
            })
            .collect();

        let mut feature_count = 0;
        let mut last_id = None;
        for record in &records {
            if last_id != Some(record.id) {
                feature_count += 1;
                last_id = Some(record.id);
            }
        }

        Self {
            schema,
            records,
            columns,
            feature_count,
            data_key,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of stored pieces.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of distinct ingested features.
    pub fn feature_count(&self) -> usize {
        self.feature_count
    }

    pub fn records(&self) -> &[Arc<FeatureRecord>] {
        &self.records
    }

    pub fn record(&self, row: usize) -> &FeatureRecord {
        self.records[row].as_ref()
    }

    /// Content key of everything ingested into this store.
    pub fn data_key(&self) -> u64 {
        self.data_key
    }

    /// Rows whose column value has the given key, in row order.
    pub fn equal_rows(&self, column: ColumnRef, key: &IndexKey) -> &[usize] {
        self.columns
            .get(&column)
            .and_then(|c| c.equal.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Rows where the column is undefined, in row order.
    pub fn undefined_rows(&self, column: ColumnRef) -> &[usize] {
        self.columns
            .get(&column)
            .map(|c| c.undefined.as_slice())
            .unwrap_or(&[])
    }

    /// Rows whose numeric column value lies in `[lo, hi]`, in row order.
    pub fn range_rows(&self, column: ColumnRef, lo: f64, hi: f64) -> Vec<usize> {
        self.columns
            .get(&column)
            .map_or_else(Vec::new, |c| c.range(lo, hi))
    }
}

struct PreparedFeature {
    id: u64,
    geogroup_id: String,
    geometry: Geometry<f64>,
    properties: Arc<Map<String, Value>>,
    values: Arc<[Option<FieldValue>]>,
}

/// Accumulates ingested features for one data epoch.
#[derive(Debug, Clone)]
pub struct StoreBuilder {
    schema: Arc<Schema>,
    partitioner: Partitioner,
    geogroups: GeogroupRule,
    // Shared with published snapshots
    records: Vec<Arc<FeatureRecord>>,
    next_id: u64,
    data_key: u64,
}

impl StoreBuilder {
    /// Start an empty epoch.
    ///
    /// # Arguments
    ///
    /// * `schema` - Field schema of the store
    /// * `partitioner` - Grid splitter at the storage order
    /// * `geogroups` - Geogroup id derivation rule
    /// * `seed` - Initial data key; batches are chained onto it
    pub fn new(
        schema: Arc<Schema>,
        partitioner: Partitioner,
        geogroups: GeogroupRule,
        seed: u64,
    ) -> Self {
        Self {
            schema,
            partitioner,
            geogroups,
            records: Vec::new(),
            next_id: 0,
            data_key: seed,
        }
    }

    pub fn data_key(&self) -> u64 {
        self.data_key
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Ingest a feature collection.
    ///
    /// Malformed features are rejected individually and logged; the rest of
    /// the batch is kept.
    pub fn ingest(&mut self, collection: &FeatureCollection) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let mut prepared = Vec::with_capacity(collection.features.len());

        for (idx, feature) in collection.features.iter().enumerate() {
            let decoded = match &feature.geometry {
                Some(geometry) => decode_geometry(&geometry.value, idx),
                None => Err(Error::MalformedGeometry {
                    feature: idx,
                    reason: "feature has no geometry".to_string(),
                }),
            };
            let mut geometry = match decoded {
                Ok(g) => g,
                Err(e) => {
                    log::warn!("Rejecting feature: {}", e);
                    report.rejected += 1;
                    continue;
                }
            };
            normalize_geometry(&mut geometry);

            let properties = feature.properties.clone().unwrap_or_default();
            let geogroup_id = self.geogroups.derive(&properties, feature.id.as_ref());
            let values: Arc<[Option<FieldValue>]> = self.schema.materialize(&properties).into();

            prepared.push(PreparedFeature {
                id: self.next_id,
                geogroup_id,
                geometry,
                properties: Arc::new(properties),
                values,
            });
            self.next_id += 1;
        }

        let partitioner = &self.partitioner;
        let split: Vec<_> = prepared
            .par_iter()
            .map(|f| partitioner.split(&f.geometry))
            .collect();

        for (feature, pieces) in prepared.into_iter().zip(split) {
            report.features += 1;
            if pieces.is_empty() {
                report.empty += 1;
                continue;
            }
            report.pieces += pieces.len();
            for piece in pieces {
                self.records.push(Arc::new(FeatureRecord {
                    id: feature.id,
                    geogroup_id: feature.geogroup_id.clone(),
                    healpix_index: piece.healpix_index,
                    polygon: piece.polygon,
                    properties: Arc::clone(&feature.properties),
                    values: Arc::clone(&feature.values),
                }));
            }
        }

        let bytes = serde_json::to_vec(collection)?;
        self.data_key = xxhash_rust::xxh3::xxh3_64_with_seed(&bytes, self.data_key);

        log::info!(
            "Ingested {} features as {} pieces ({} rejected, {} empty)",
            report.features,
            report.pieces,
            report.rejected,
            report.empty
        );
        Ok(report)
    }

    /// Build an indexed snapshot of everything ingested so far.
    ///
    /// Records are shared with the builder, only the indexes are rebuilt.
    pub fn snapshot(&self) -> FeatureStore {
        FeatureStore::from_records(
            Arc::clone(&self.schema),
            self.records.clone(),
            self.data_key,
        )
    }
}
