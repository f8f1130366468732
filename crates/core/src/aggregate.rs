//! Aggregation engine.
//!
//! Runs COUNT, VALUES_AND_COUNT, DATE_HISTOGRAM and NUMBER_HISTOGRAM over a
//! set of filtered rows, and builds the per-group summaries carried by tile
//! features.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::compile::CompiledAggregation;
use crate::query::AggregationOp;
use crate::schema::{ColumnRef, FieldValue, Schema};
use crate::store::{FeatureRecord, FeatureStore};

/// Key counting missing values in value/count maps.
pub const UNDEFINED_KEY: &str = "__undefined";

const MILLIS_PER_DAY: f64 = 86_400_000.0;
const NUMBER_BUCKETS: usize = 10;

/// Per-value occurrence counts. Merging is associative and commutative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValueCounts(BTreeMap<String, u64>);

impl ValueCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one value; missing and empty values count under [`UNDEFINED_KEY`].
    pub fn add(&mut self, value: Option<&FieldValue>) {
        let key = match value {
            Some(FieldValue::Text(s)) if s.is_empty() => UNDEFINED_KEY.to_string(),
            Some(v) => v.count_key(),
            None => UNDEFINED_KEY.to_string(),
        };
        *self.0.entry(key).or_insert(0) += 1;
    }

    pub fn merge(&mut self, other: &ValueCounts) {
        for (key, count) in &other.0 {
            *self.0.entry(key.clone()).or_insert(0) += count;
        }
    }

    pub fn get(&self, key: &str) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect())
    }
}

/// Bucket granularity of a date histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateStep {
    Day,
    Month,
    Year,
}

impl DateStep {
    /// Pick a granularity for a span in days: over three years buckets by
    /// year, over three months by month.
    pub fn for_span(days: f64) -> Self {
        if days > 3.0 * 365.0 {
            DateStep::Year
        } else if days > 3.0 * 30.0 {
            DateStep::Month
        } else {
            DateStep::Day
        }
    }

    /// strftime pattern of a bucket key; also reported as the histogram step.
    pub fn key_format(self) -> &'static str {
        match self {
            DateStep::Day => "%Y-%m-%d",
            DateStep::Month => "%Y-%m",
            DateStep::Year => "%Y",
        }
    }

    fn key(self, date: NaiveDate) -> String {
        date.format(self.key_format()).to_string()
    }

    fn align_start(self, date: NaiveDate) -> NaiveDate {
        match self {
            DateStep::Day => Some(date),
            DateStep::Month => date.with_day(1),
            DateStep::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        }
        .unwrap_or(date)
    }

    fn align_end(self, date: NaiveDate) -> NaiveDate {
        match self {
            DateStep::Day => Some(date),
            DateStep::Month => date
                .with_day(1)
                .and_then(|d| d.checked_add_months(Months::new(1)))
                .and_then(|d| d.pred_opt()),
            DateStep::Year => NaiveDate::from_ymd_opt(date.year(), 12, 31),
        }
        .unwrap_or(date)
    }

    fn next(self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            DateStep::Day => date.succ_opt(),
            DateStep::Month => date.checked_add_months(Months::new(1)),
            DateStep::Year => date.checked_add_months(Months::new(12)),
        }
    }
}

/// Counts of dates per calendar bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct DateHistogram {
    /// Aligned first bucket start and last bucket end, absent without data
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub step: DateStep,
    /// Bucket key and count, in chronological order
    pub buckets: Vec<(String, u64)>,
}

impl DateHistogram {
    /// Build a histogram from epoch milliseconds. Every bucket between the
    /// first and last value is present, empty ones with a zero count.
    pub fn build(values: impl IntoIterator<Item = i64>) -> Self {
        let dates: Vec<DateTime<Utc>> = values
            .into_iter()
            .filter_map(DateTime::from_timestamp_millis)
            .collect();
        let (Some(min), Some(max)) = (dates.iter().min(), dates.iter().max()) else {
            return Self {
                range: None,
                step: DateStep::Day,
                buckets: Vec::new(),
            };
        };

        let first_day = min.date_naive();
        let last_day = max
            .date_naive()
            .succ_opt()
            .unwrap_or_else(|| max.date_naive());
        let span = (end_of_day(last_day) - start_of_day(first_day)).num_milliseconds() as f64
            / MILLIS_PER_DAY;
        let step = DateStep::for_span(span);

        let start = start_of_day(step.align_start(first_day));
        let stop = end_of_day(step.align_end(last_day));

        let mut table: BTreeMap<String, u64> = BTreeMap::new();
        let mut day = Some(start.date());
        while let Some(d) = day.filter(|d| start_of_day(*d) < stop) {
            table.insert(step.key(d), 0);
            day = step.next(d);
        }
        for date in &dates {
            *table.entry(step.key(date.date_naive())).or_insert(0) += 1;
        }

        Self {
            range: Some((start.and_utc(), stop.and_utc())),
            step,
            buckets: table.into_iter().collect(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut table = vec![json!(["Date", "Count"])];
        table.extend(self.buckets.iter().map(|(k, c)| json!([k, c])));
        let (min, max) = match &self.range {
            Some((min, max)) => (
                Value::from(min.to_rfc3339_opts(SecondsFormat::Millis, true)),
                Value::from(max.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ),
            None => (Value::Null, Value::Null),
        };
        json!({
            "min": min,
            "max": max,
            "step": self.step.key_format(),
            "table": table,
        })
    }
}

fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

fn end_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_hms_opt(23, 59, 59).unwrap_or_else(|| start_of_day(date))
}

/// Counts of numbers in ten equal-width buckets over the observed range.
#[derive(Debug, Clone, PartialEq)]
pub struct NumberHistogram {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Bucket width; absent when all values are equal or there are none
    pub step: Option<f64>,
    /// Bucket lower bound and count
    pub buckets: Vec<(f64, u64)>,
}

impl NumberHistogram {
    pub fn build(values: impl IntoIterator<Item = f64>) -> Self {
        let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        let min = values.iter().copied().reduce(f64::min);
        let max = values.iter().copied().reduce(f64::max);

        let (step, buckets) = match (min, max) {
            (Some(lo), Some(hi)) if hi > lo => {
                let step = (hi - lo) / NUMBER_BUCKETS as f64;
                let mut counts = [0u64; NUMBER_BUCKETS];
                for v in &values {
                    let idx = (((v - lo) / step).floor() as usize).min(NUMBER_BUCKETS - 1);
                    counts[idx] += 1;
                }
                let buckets = counts
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (lo + i as f64 * step, *c))
                    .collect();
                (Some(step), buckets)
            }
            (Some(lo), Some(_)) => (None, vec![(lo, values.len() as u64)]),
            _ => (None, Vec::new()),
        };

        Self {
            min,
            max,
            step,
            buckets,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut table = vec![json!(["Value", "Count"])];
        table.extend(self.buckets.iter().map(|(v, c)| json!([v, c])));
        json!({
            "min": self.min,
            "max": self.max,
            "step": self.step,
            "table": table,
        })
    }
}

/// Run aggregations over `rows`, producing the single output row.
pub fn run(store: &FeatureStore, rows: &[usize], aggregations: &[CompiledAggregation]) -> Map<String, Value> {
    aggregations
        .iter()
        .map(|agg| (agg.out.clone(), run_one(store, rows, agg)))
        .collect()
}

fn run_one(store: &FeatureStore, rows: &[usize], agg: &CompiledAggregation) -> Value {
    let values = |column: Option<ColumnRef>| {
        rows.iter().map(move |&row| {
            column.and_then(|c| store.record(row).column_value(c).map(|v| v.into_owned()))
        })
    };

    match agg.op {
        AggregationOp::Count => Value::from(rows.len()),
        AggregationOp::ValuesAndCount => {
            let mut counts = ValueCounts::new();
            for value in values(agg.column) {
                counts.add(value.as_ref());
            }
            counts.to_json()
        }
        AggregationOp::DateHistogram => DateHistogram::build(
            values(agg.column)
                .flatten()
                .filter_map(|v| v.as_number())
                .map(|ms| ms as i64),
        )
        .to_json(),
        AggregationOp::NumberHistogram => {
            NumberHistogram::build(values(agg.column).flatten().filter_map(|v| v.as_number()))
                .to_json()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FieldSummary {
    Range(Option<(FieldValue, FieldValue)>),
    Tags(ValueCounts),
}

/// Min/max of scalar fields and value counts of tag fields over one tile
/// group.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSummary {
    count: u64,
    fields: Vec<FieldSummary>,
}

impl CellSummary {
    pub fn new(schema: &Schema) -> Self {
        let fields = schema
            .fields()
            .iter()
            .map(|f| {
                if f.is_tags() {
                    FieldSummary::Tags(ValueCounts::new())
                } else {
                    FieldSummary::Range(None)
                }
            })
            .collect();
        Self { count: 0, fields }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn add(&mut self, record: &FeatureRecord) {
        self.count += 1;
        for (idx, summary) in self.fields.iter_mut().enumerate() {
            let value = record.values.get(idx).and_then(Option::as_ref);
            match summary {
                FieldSummary::Tags(counts) => counts.add(value),
                FieldSummary::Range(range) => {
                    let Some(v) = value else { continue };
                    match range {
                        None => {
                            if compare(v, v).is_some() {
                                *range = Some((v.clone(), v.clone()));
                            }
                        }
                        Some((lo, hi)) => {
                            if compare(v, lo) == Some(Ordering::Less) {
                                *lo = v.clone();
                            }
                            if compare(v, hi) == Some(Ordering::Greater) {
                                *hi = v.clone();
                            }
                        }
                    }
                }
            }
        }
    }

    /// Properties keyed by field id: `[min, max]` for scalar fields (null
    /// without values) and a value/count map for tag fields.
    pub fn to_properties(&self, schema: &Schema) -> Map<String, Value> {
        schema
            .fields()
            .iter()
            .zip(&self.fields)
            .map(|(field, summary)| {
                let value = match summary {
                    FieldSummary::Tags(counts) => counts.to_json(),
                    FieldSummary::Range(Some((lo, hi))) => json!([lo.to_json(), hi.to_json()]),
                    FieldSummary::Range(None) => Value::Null,
                };
                (field.id.clone(), value)
            })
            .collect()
    }
}

fn compare(a: &FieldValue, b: &FieldValue) -> Option<Ordering> {
    match (a, b) {
        (FieldValue::Text(x), FieldValue::Text(y)) => Some(x.cmp(y)),
        _ => a.as_number()?.partial_cmp(&b.as_number()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, FieldType};
    use geo::polygon;
    use std::sync::Arc;

    fn millis(date: &str) -> i64 {
        crate::schema::parse_date_millis(date).unwrap()
    }

    // ========== ValueCounts Tests ==========

    #[test]
    fn test_value_counts_undefined_key() {
        let mut counts = ValueCounts::new();
        counts.add(Some(&FieldValue::Text("g".into())));
        counts.add(Some(&FieldValue::Text("g".into())));
        counts.add(Some(&FieldValue::Text(String::new())));
        counts.add(None);
        assert_eq!(counts.get("g"), 2);
        assert_eq!(counts.get(UNDEFINED_KEY), 2);
        assert_eq!(counts.total(), 4);
    }

    #[test]
    fn test_value_counts_merge_matches_single_pass() {
        let values = ["a", "b", "a", "c", "b", "a"];
        let mut whole = ValueCounts::new();
        for v in values {
            whole.add(Some(&FieldValue::Text(v.into())));
        }
        let mut left = ValueCounts::new();
        let mut right = ValueCounts::new();
        for v in &values[..2] {
            left.add(Some(&FieldValue::Text((*v).into())));
        }
        for v in &values[2..] {
            right.add(Some(&FieldValue::Text((*v).into())));
        }
        left.merge(&right);
        assert_eq!(left, whole);
        assert_eq!(whole.to_json(), json!({"a": 3, "b": 2, "c": 1}));
    }

    // ========== Date Histogram Tests ==========

    #[test]
    fn test_date_step_thresholds() {
        assert_eq!(DateStep::for_span(40.0), DateStep::Day);
        assert_eq!(DateStep::for_span(90.0), DateStep::Day);
        assert_eq!(DateStep::for_span(91.0), DateStep::Month);
        assert_eq!(DateStep::for_span(3.0 * 365.0 + 1.0), DateStep::Year);
    }

    #[test]
    fn test_date_histogram_five_years_uses_years() {
        let hist = DateHistogram::build([
            millis("2015-06-01"),
            millis("2016-02-10"),
            millis("2016-07-10"),
            millis("2020-03-01"),
        ]);
        assert_eq!(hist.step, DateStep::Year);
        let keys: Vec<&str> = hist.buckets.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["2015", "2016", "2017", "2018", "2019", "2020"]);
        assert_eq!(hist.buckets[1].1, 2);
        assert_eq!(hist.buckets[2].1, 0);

        let out = hist.to_json();
        assert_eq!(out["step"], json!("%Y"));
        assert_eq!(out["min"], json!("2015-01-01T00:00:00.000Z"));
        assert_eq!(out["max"], json!("2020-12-31T23:59:59.000Z"));
        assert_eq!(out["table"][0], json!(["Date", "Count"]));
    }

    #[test]
    fn test_date_histogram_forty_days_uses_days() {
        let hist = DateHistogram::build([
            millis("2021-01-01T10:00:00Z"),
            millis("2021-01-01T23:00:00Z"),
            millis("2021-02-09"),
        ]);
        assert_eq!(hist.step, DateStep::Day);
        // Jan 1 up to and including the day after the maximum
        assert_eq!(hist.buckets.len(), 41);
        assert_eq!(hist.buckets[0], ("2021-01-01".to_string(), 2));
        assert_eq!(hist.buckets[39], ("2021-02-09".to_string(), 1));
        assert_eq!(hist.buckets.iter().map(|(_, c)| c).sum::<u64>(), 3);
    }

    #[test]
    fn test_date_histogram_months_are_aligned() {
        let hist = DateHistogram::build([millis("2021-01-15"), millis("2021-06-20")]);
        assert_eq!(hist.step, DateStep::Month);
        let keys: Vec<&str> = hist.buckets.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["2021-01", "2021-02", "2021-03", "2021-04", "2021-05", "2021-06"]);
        let out = hist.to_json();
        assert_eq!(out["min"], json!("2021-01-01T00:00:00.000Z"));
        assert_eq!(out["max"], json!("2021-06-30T23:59:59.000Z"));
    }

    #[test]
    fn test_date_histogram_empty() {
        let out = DateHistogram::build(std::iter::empty()).to_json();
        assert_eq!(
            out,
            json!({"min": null, "max": null, "step": "%Y-%m-%d", "table": [["Date", "Count"]]})
        );
    }

    // ========== Number Histogram Tests ==========

    #[test]
    fn test_number_histogram_ten_buckets() {
        let hist = NumberHistogram::build((0..=20).map(f64::from));
        assert_eq!(hist.step, Some(2.0));
        assert_eq!(hist.buckets.len(), 10);
        assert_eq!(hist.buckets[0], (0.0, 2));
        // maximum lands in the last bucket
        assert_eq!(hist.buckets[9], (18.0, 3));
        assert_eq!(hist.buckets.iter().map(|(_, c)| c).sum::<u64>(), 21);
    }

    #[test]
    fn test_number_histogram_degenerate() {
        let hist = NumberHistogram::build([4.0, 4.0, 4.0]);
        assert_eq!(hist.step, None);
        assert_eq!(hist.buckets, vec![(4.0, 3)]);

        let empty = NumberHistogram::build(std::iter::empty()).to_json();
        assert_eq!(empty["min"], Value::Null);
        assert_eq!(empty["table"], json!([["Value", "Count"]]));
    }

    // ========== Cell Summary Tests ==========

    fn record(values: Vec<Option<FieldValue>>) -> FeatureRecord {
        FeatureRecord {
            id: 0,
            geogroup_id: "g".to_string(),
            healpix_index: 3,
            polygon: polygon![(x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 0.0)],
            properties: Arc::new(Map::new()),
            values: values.into(),
        }
    }

    #[test]
    fn test_cell_summary_min_max_and_tags() {
        let schema = Schema::new(vec![
            FieldSpec::new("exposure", FieldType::Number),
            FieldSpec::new("band", FieldType::String).with_widget("tags"),
            FieldSpec::new("SurveyName", FieldType::String),
            FieldSpec::new("notes", FieldType::String),
        ])
        .unwrap();
        let mut summary = CellSummary::new(&schema);
        summary.add(&record(vec![
            Some(FieldValue::Number(5.0)),
            Some(FieldValue::Text("g".into())),
            Some(FieldValue::Text("HSC".into())),
            None,
        ]));
        summary.add(&record(vec![
            Some(FieldValue::Number(2.0)),
            None,
            Some(FieldValue::Text("DES".into())),
            None,
        ]));

        assert_eq!(summary.count(), 2);
        let props = summary.to_properties(&schema);
        assert_eq!(props["exposure"], json!([2.0, 5.0]));
        assert_eq!(props["band"], json!({"g": 1, "__undefined": 1}));
        assert_eq!(props["SurveyName"], json!(["DES", "HSC"]));
        assert_eq!(props["notes"], Value::Null);
    }
}
