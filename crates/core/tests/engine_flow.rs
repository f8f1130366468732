//! End-to-end tests driving the engine with GeoJSON input and JSON queries.
//!
//! Each test builds a fresh engine, ingests a small synthetic survey and checks
//! query results, visual-query hashes and rendered tiles.

use serde_json::{json, Value};
use survey_tiles_core::healpix::pixel_of;
use survey_tiles_core::{Engine, EngineConfig, FieldSpec, FieldType, Query};

// ========== Fixtures ==========

fn fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("SurveyName", FieldType::String),
        FieldSpec::new("exposure", FieldType::Number),
        FieldSpec::new("band", FieldType::String).with_widget("tags"),
        FieldSpec::new("obs.date", FieldType::Date),
        FieldSpec::new("airmass_x10", FieldType::Number).with_computed("round(obs.airmass * 10)"),
    ]
}

fn engine_with(config: EngineConfig) -> Engine {
    let engine = Engine::new(config).expect("engine");
    engine.init_schema(fields()).expect("schema");
    engine
}

fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

fn rect(lon: f64, lat: f64, width: f64, height: f64) -> Value {
    json!({"type": "Polygon", "coordinates": [[
        [lon, lat], [lon + width, lat], [lon + width, lat + height], [lon, lat + height], [lon, lat]
    ]]})
}

fn feature(geometry: Value, properties: Value) -> Value {
    json!({"type": "Feature", "geometry": geometry, "properties": properties})
}

fn collection(features: Vec<Value>) -> String {
    json!({"type": "FeatureCollection", "features": features}).to_string()
}

/// Five small footprints from three surveys.
fn survey() -> String {
    collection(vec![
        feature(
            rect(10.0, 10.0, 0.5, 0.5),
            json!({"SurveyName": "DES", "exposure": 5, "band": "g", "obs": {"date": "2021-01-01", "airmass": 1.21}}),
        ),
        feature(
            rect(20.0, 10.0, 0.5, 0.5),
            json!({"SurveyName": "DES", "exposure": 12, "band": "r", "obs": {"date": "2021-01-20", "airmass": 1.05}}),
        ),
        feature(
            rect(30.0, 10.0, 0.5, 0.5),
            json!({"SurveyName": "HSC", "exposure": 8, "band": "i", "obs": {"date": "2021-02-09"}}),
        ),
        feature(
            rect(40.0, 10.0, 0.5, 0.5),
            json!({"SurveyName": "HSC", "exposure": 3, "band": "g"}),
        ),
        feature(
            rect(50.0, 10.0, 0.5, 0.5),
            json!({"SurveyName": "KiDS", "exposure": 9}),
        ),
    ])
}

fn rows(engine: &Engine, query: Value) -> Vec<Value> {
    let out = engine.query_json(&query.to_string()).expect("query");
    out["res"].as_array().cloned().unwrap_or_default()
}

fn surveys_of(rows: &[Value]) -> Vec<String> {
    let mut names: Vec<String> = rows
        .iter()
        .map(|r| r["SurveyName"].as_str().unwrap_or_default().to_string())
        .collect();
    names.sort();
    names
}

fn max_jump(geometry: &Value) -> f64 {
    let mut worst: f64 = 0.0;
    for ring in geometry["coordinates"].as_array().unwrap() {
        let lons: Vec<f64> = ring
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p[0].as_f64().unwrap())
            .collect();
        for pair in lons.windows(2) {
            worst = worst.max((pair[1] - pair[0]).abs());
        }
    }
    worst
}

// ========== Ingestion Tests ==========

#[test]
fn test_antimeridian_feature_has_no_longitude_jump() {
    let engine = engine();
    let report = engine
        .ingest_str(&collection(vec![feature(
            rect(179.0, 5.0, 2.0, 1.0),
            json!({"SurveyName": "DES"}),
        )]))
        .unwrap();
    assert_eq!(report.features, 1);
    assert!(report.pieces >= 2);

    let pieces = rows(&engine, json!({"onSubFeatures": true, "projectOptions": {"geometry": true}}));
    assert_eq!(pieces.len(), report.pieces);
    for row in &pieces {
        assert!(max_jump(&row["geometry"]) <= 180.0, "{row}");
    }
}

#[test]
fn test_seam_written_with_negative_longitudes() {
    let engine = engine();
    let crossing = json!({"type": "Polygon", "coordinates": [[
        [179.5, 0.0], [-179.5, 0.0], [-179.5, 1.0], [179.5, 1.0], [179.5, 0.0]
    ]]});
    engine
        .ingest_str(&collection(vec![feature(crossing, json!({"SurveyName": "DES"}))]))
        .unwrap();
    let pieces = rows(&engine, json!({"onSubFeatures": true, "projectOptions": {"geometry": true}}));
    assert!(!pieces.is_empty());
    for row in &pieces {
        assert!(max_jump(&row["geometry"]) <= 180.0, "{row}");
    }
}

#[test]
fn test_malformed_features_are_skipped() {
    let engine = engine();
    let report = engine
        .ingest_str(&collection(vec![
            feature(rect(10.0, 10.0, 0.5, 0.5), json!({"SurveyName": "DES"})),
            feature(json!({"type": "Point", "coordinates": [1.0, 2.0]}), json!({})),
            feature(
                json!({"type": "Polygon", "coordinates": [[[0.0, 0.0], [1.0, 0.0], [0.0, 0.0]]]}),
                json!({}),
            ),
            feature(rect(20.0, 95.0, 1.0, 1.0), json!({})),
        ]))
        .unwrap();
    assert_eq!(report.features, 1);
    assert_eq!(report.rejected, 3);
    assert_eq!(engine.feature_count(), 1);
    let res = rows(&engine, json!({"projectOptions": {"SurveyName": true}}));
    assert_eq!(surveys_of(&res), vec!["DES"]);
}

#[test]
fn test_split_feature_counts_once() {
    let engine = engine();
    let report = engine
        .ingest_str(&collection(vec![feature(
            rect(100.0, 20.0, 4.0, 4.0),
            json!({"SurveyName": "DES"}),
        )]))
        .unwrap();
    assert!(report.pieces > 1);

    let count = rows(&engine, json!({
        "aggregationOptions": [{"operation": "COUNT", "out": "n"}],
        "groupingOptions": [{"operation": "GROUP_ALL"}]
    }));
    assert_eq!(count, vec![json!({"n": 1})]);

    let count = rows(&engine, json!({
        "onSubFeatures": true,
        "aggregationOptions": [{"operation": "COUNT", "out": "n"}]
    }));
    assert_eq!(count, vec![json!({"n": report.pieces})]);
}

// ========== Query Tests ==========

#[test]
fn test_number_range_and_in_on_distinct_fields() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let res = rows(&engine, json!({"constraints": [
        {"fieldId": "exposure", "operation": "NUMBER_RANGE", "expression": [0, 10]},
        {"fieldId": "SurveyName", "operation": "IN", "expression": ["HSC", "KiDS"]}
    ]}));
    assert_eq!(surveys_of(&res), vec!["HSC", "HSC", "KiDS"]);
    for row in &res {
        let exposure = row["exposure"].as_f64().unwrap();
        assert!((0.0..=10.0).contains(&exposure));
    }
}

#[test]
fn test_string_equal_on_same_field_is_union() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let res = rows(&engine, json!({"constraints": [
        {"fieldId": "SurveyName", "operation": "STRING_EQUAL", "expression": "DES"},
        {"fieldId": "SurveyName", "operation": "STRING_EQUAL", "expression": "KiDS"}
    ]}));
    assert_eq!(surveys_of(&res), vec!["DES", "DES", "KiDS"]);
}

#[test]
fn test_is_undefined_and_date_range() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let undated = rows(&engine, json!({"constraints": [
        {"fieldId": "obs.date", "operation": "IS_UNDEFINED"}
    ]}));
    assert_eq!(surveys_of(&undated), vec!["HSC", "KiDS"]);

    let january = rows(&engine, json!({"constraints": [
        {"fieldId": "obs.date", "operation": "DATE_RANGE", "expression": ["2021-01-01", "2021-01-31"]}
    ]}));
    assert_eq!(surveys_of(&january), vec!["DES", "DES"]);
}

#[test]
fn test_computed_field() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let res = rows(&engine, json!({"constraints": [
        {"fieldId": "airmass_x10", "operation": "INT_EQUAL", "expression": 12}
    ]}));
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["exposure"], json!(5.0));
}

#[test]
fn test_values_and_count() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let res = rows(&engine, json!({
        "aggregationOptions": [
            {"operation": "VALUES_AND_COUNT", "fieldId": "band", "out": "bands"},
            {"operation": "COUNT", "out": "total"}
        ],
        "groupingOptions": [{"operation": "GROUP_ALL"}]
    }));
    assert_eq!(res.len(), 1);
    assert_eq!(res[0]["bands"], json!({"g": 2, "r": 1, "i": 1, "__undefined": 1}));
    assert_eq!(res[0]["total"], json!(5));
}

#[test]
fn test_date_histogram_granularity() {
    let engine = engine();
    let dated = |dates: &[&str]| {
        collection(
            dates
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    feature(
                        rect(10.0 + i as f64, 0.0, 0.2, 0.2),
                        json!({"SurveyName": "DES", "obs": {"date": d}}),
                    )
                })
                .collect(),
        )
    };
    let histogram = json!({
        "aggregationOptions": [{"operation": "DATE_HISTOGRAM", "fieldId": "obs.date", "out": "h"}]
    });

    engine
        .ingest_str(&dated(&["2016-03-01", "2017-08-15", "2021-02-28"]))
        .unwrap();
    let res = rows(&engine, histogram.clone());
    assert_eq!(res[0]["h"]["step"], json!("%Y"));
    assert_eq!(res[0]["h"]["table"][1], json!(["2016", 1]));

    let fresh = engine_with(EngineConfig::default());
    fresh
        .ingest_str(&dated(&["2021-03-01", "2021-03-20", "2021-04-09"]))
        .unwrap();
    let res = rows(&fresh, histogram);
    assert_eq!(res[0]["h"]["step"], json!("%Y-%m-%d"));
    assert_eq!(res[0]["h"]["table"][1], json!(["2021-03-01", 1]));
}

#[test]
fn test_histogram_must_be_alone() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let err = engine.query_json(
        &json!({"aggregationOptions": [
            {"operation": "NUMBER_HISTOGRAM", "fieldId": "exposure", "out": "h"},
            {"operation": "COUNT", "out": "n"}
        ]})
        .to_string(),
    );
    assert!(err.is_err());
}

#[test]
fn test_unknown_operation_rejected() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let err = engine.query_json(
        &json!({"constraints": [{"fieldId": "exposure", "operation": "REGEX", "expression": ".*"}]})
            .to_string(),
    );
    assert!(err.is_err());
}

#[test]
fn test_limit_and_skip() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let res = rows(&engine, json!({"skip": 1, "limit": 2, "projectOptions": {"id": true}}));
    assert_eq!(res, vec![json!({"id": 1}), json!({"id": 2})]);
}

// ========== Visual Query and Tile Tests ==========

#[test]
fn test_query_visual_hash_is_deterministic() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let des = Query::from_json(
        r#"{"constraints": [{"fieldId": "SurveyName", "operation": "STRING_EQUAL", "expression": "DES"}]}"#,
    )
    .unwrap();
    let hsc = Query::from_json(
        r#"{"constraints": [{"fieldId": "SurveyName", "operation": "STRING_EQUAL", "expression": "HSC"}]}"#,
    )
    .unwrap();

    let first = engine.query_visual(&des).unwrap();
    assert_eq!(engine.query_visual(&des).unwrap(), first);
    assert_ne!(engine.query_visual(&hsc).unwrap(), first);

    // same data under another server key
    let other = engine_with(EngineConfig::default().with_base_hash_key("rev2"));
    other.ingest_str(&survey()).unwrap();
    assert_ne!(other.query_visual(&des).unwrap(), first);

    // same key and data in another process
    let twin = self::engine();
    twin.ingest_str(&survey()).unwrap();
    assert_eq!(twin.query_visual(&des).unwrap(), first);

    // new data changes the hash
    engine
        .ingest_str(&collection(vec![feature(rect(60.0, 10.0, 0.5, 0.5), json!({"SurveyName": "DES"}))]))
        .unwrap();
    assert_ne!(engine.query_visual(&des).unwrap(), first);
}

#[test]
fn test_reload_moves_to_new_epoch() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let query = Query::default();
    let before = engine.query_visual(&query).unwrap();
    let des_pixel = pixel_of(10.25, 10.25, 2);
    assert!(engine.get_tile(&before, 2, des_pixel).unwrap().is_some());

    let replacement: geojson::FeatureCollection = serde_json::from_str(&collection(vec![feature(
        rect(70.0, 10.0, 0.5, 0.5),
        json!({"SurveyName": "KiDS"}),
    )]))
    .unwrap();
    engine.reload(&[replacement]).unwrap();
    assert_eq!(engine.feature_count(), 1);

    // the old hash is gone, the same query registers under a new one
    assert!(engine.tile_properties(&before).is_none());
    assert_eq!(engine.get_tile(&before, 2, des_pixel).unwrap(), None);
    let after = engine.query_visual(&query).unwrap();
    assert_ne!(after, before);
    assert_eq!(engine.get_tile(&after, 2, des_pixel).unwrap(), None);
    assert!(engine
        .get_tile(&after, 2, pixel_of(70.25, 10.25, 2))
        .unwrap()
        .is_some());

    // epochs are keyed by content: reloading the same data keeps the hash
    let same: geojson::FeatureCollection = serde_json::from_str(&collection(vec![feature(
        rect(70.0, 10.0, 0.5, 0.5),
        json!({"SurveyName": "KiDS"}),
    )]))
    .unwrap();
    engine.reload(&[same]).unwrap();
    assert_eq!(engine.query_visual(&query).unwrap(), after);
}

#[test]
fn test_unknown_hash_and_empty_cell_are_absent() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    assert_eq!(engine.get_tile("feedfacefeedface", 2, 0).unwrap(), None);
    assert!(engine.tile_properties("feedfacefeedface").is_none());

    let hash = engine.query_visual(&Query::default()).unwrap();
    let empty = pixel_of(-120.0, -60.0, 2);
    assert_eq!(engine.get_tile(&hash, 2, empty).unwrap(), None);
    assert_eq!(engine.get_all_sky_tile(&hash).unwrap(), None);
}

#[test]
fn test_tile_groups_by_geogroup() {
    let engine = engine();
    engine
        .ingest_str(&collection(vec![
            feature(rect(10.0, 10.0, 0.3, 0.3), json!({"SurveyName": "DES", "fieldID": "F1", "exposure": 4})),
            feature(rect(10.05, 10.05, 0.2, 0.2), json!({"SurveyName": "DES", "fieldID": "F1", "exposure": 7})),
            feature(rect(10.1, 10.1, 0.1, 0.1), json!({"SurveyName": "DES", "fieldID": "F2", "exposure": 1})),
        ]))
        .unwrap();
    let hash = engine.query_visual(&Query::default()).unwrap();

    let tile = engine
        .get_tile(&hash, 2, pixel_of(10.15, 10.15, 2))
        .unwrap()
        .expect("tile");
    let f1: Vec<_> = tile
        .features
        .iter()
        .filter(|f| f.foreign_members.as_ref().unwrap()["geogroup_id"] == json!("F1"))
        .collect();
    assert!(!f1.is_empty());
    let inner = pixel_of(10.15, 10.15, 5) as i64;
    let cell = f1
        .iter()
        .find(|f| f.foreign_members.as_ref().unwrap()["healpix_index"] == json!(inner))
        .expect("group in the inner cell");
    let members = cell.foreign_members.as_ref().unwrap();
    assert_eq!(members["geogroup_size"], json!(2));
    assert_eq!(cell.properties.as_ref().unwrap()["exposure"], json!([4.0, 7.0]));
}

#[test]
fn test_coarse_tile_renders_cell_outlines() {
    let engine = engine();
    engine.ingest_str(&survey()).unwrap();
    let hash = engine.query_visual(&Query::default()).unwrap();

    let tile = engine
        .get_tile(&hash, 1, pixel_of(10.25, 10.25, 1))
        .unwrap()
        .expect("tile");
    for f in &tile.features {
        let members = f.foreign_members.as_ref().unwrap();
        assert!(!members.contains_key("geogroup_id"));
        assert!(members["healpix_index"].as_i64().unwrap() >= 0);
        let geometry = serde_json::to_value(f.geometry.as_ref().unwrap()).unwrap();
        // outlines of storage cells are quads, expanded at the poles only
        assert_eq!(geometry["coordinates"][0].as_array().unwrap().len(), 5);
    }
}

#[test]
fn test_tile_groups_never_mix_surveys() {
    let engine = engine();
    engine
        .ingest_str(&collection(vec![
            feature(rect(10.1, 10.1, 0.1, 0.1), json!({"SurveyName": "DES", "fieldID": "F1"})),
            feature(rect(10.12, 10.12, 0.1, 0.1), json!({"SurveyName": "HSC", "fieldID": "F1"})),
            feature(rect(10.14, 10.14, 0.1, 0.1), json!({"SurveyName": "HSC", "fieldID": "F9"})),
        ]))
        .unwrap();
    let hash = engine.query_visual(&Query::default()).unwrap();
    let inner = pixel_of(10.15, 10.15, 5) as i64;
    let in_inner = |tile: &geojson::FeatureCollection| -> Vec<(Value, u64)> {
        tile.features
            .iter()
            .filter(|f| f.foreign_members.as_ref().unwrap()["healpix_index"] == json!(inner))
            .map(|f| {
                let props = f.properties.as_ref().unwrap();
                let size = f.foreign_members.as_ref().unwrap()["geogroup_size"].as_u64().unwrap();
                (props["SurveyName"].clone(), size)
            })
            .collect()
    };

    // outlines group per cell and survey
    let outline = engine
        .get_tile(&hash, 1, pixel_of(10.15, 10.15, 1))
        .unwrap()
        .expect("tile");
    let mut groups = in_inner(&outline);
    groups.sort_by_key(|(_, size)| *size);
    assert_eq!(
        groups,
        vec![(json!(["DES", "DES"]), 1), (json!(["HSC", "HSC"]), 2)]
    );

    // footprints also split a shared fieldID by survey
    let footprint = engine
        .get_tile(&hash, 2, pixel_of(10.15, 10.15, 2))
        .unwrap()
        .expect("tile");
    assert_eq!(in_inner(&footprint).len(), 3);
}

#[test]
fn test_large_footprint_only_on_all_sky_tile() {
    let engine = engine();
    engine
        .ingest_str(&collection(vec![
            feature(rect(60.0, -40.0, 20.0, 20.0), json!({"SurveyName": "WIDE"})),
            feature(rect(10.0, 10.0, 0.5, 0.5), json!({"SurveyName": "DES"})),
        ]))
        .unwrap();
    let hash = engine.query_visual(&Query::default()).unwrap();

    let all_sky = engine.get_all_sky_tile(&hash).unwrap().expect("all-sky tile");
    assert_eq!(all_sky.features.len(), 1);
    let members = all_sky.features[0].foreign_members.as_ref().unwrap();
    assert_eq!(members["healpix_index"], json!(-1));

    let by_path = engine.get_tile_by_path(&hash, "Allsky.geojson").unwrap();
    assert_eq!(by_path, Some(all_sky));

    let inside = engine.get_tile(&hash, 2, pixel_of(70.0, -30.0, 2)).unwrap();
    assert_eq!(inside, None);
    let storage = engine.get_tile(&hash, 5, pixel_of(70.0, -30.0, 5)).unwrap();
    assert_eq!(storage, None);

    // the footprint is still a regular query row
    let res = rows(&engine, json!({"projectOptions": {"SurveyName": true, "healpix_index": true}}));
    assert!(res.contains(&json!({"SurveyName": "WIDE", "healpix_index": -1})));
}

#[test]
fn test_tile_properties() {
    let engine = engine_with(EngineConfig::default().with_tile_orders(1, 3));
    engine.ingest_str(&survey()).unwrap();
    let hash = engine.query_visual(&Query::default()).unwrap();
    let props = engine.tile_properties(&hash).unwrap();
    assert_eq!(props.order, 3);
    assert!(props.to_string().contains("hips_order = 3\n"));
    assert!(props.to_string().starts_with("hips_tile_format = geojson\n"));
}
