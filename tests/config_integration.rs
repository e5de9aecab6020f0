//! Integration tests for the shipped pipeline definition

use stagepipe::config::PipelineConfig;
use stagepipe::table::MergePolicy;
use std::path::Path;

fn shipped() -> PipelineConfig {
    PipelineConfig::read(Path::new(env!("CARGO_MANIFEST_DIR")).join("pipeline.yml")).unwrap()
}

#[test]
fn test_shipped_config_loads_every_query() {
    let config = shipped();
    let specs = config.table_specs().unwrap();

    let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "aircrafts_data",
            "airports_data",
            "bookings",
            "tickets",
            "seats",
            "flights",
            "ticket_flights",
            "boarding_passes",
        ]
    );
    for spec in &specs {
        assert!(spec.query.contains(&format!("bookings.{}", spec.name)));
        assert!(spec.has_primary_key(), "{} has no key", spec.name);
    }
}

#[test]
fn test_shipped_config_settings() {
    let config = shipped();
    let options = config.options();

    assert_eq!(options.bucket, "extracted-data");
    assert_eq!(options.staging_prefix, "temp");
    assert_eq!(options.default_policy, MergePolicy::Replace);
    assert_eq!(options.max_parallel_merges, 1);
    assert_eq!(config.schema, "stg");

    let specs = config.table_specs().unwrap();
    let json: Vec<_> = specs
        .iter()
        .flat_map(|s| s.json_columns.iter().map(String::as_str))
        .collect();
    assert_eq!(json, vec!["model", "airport_name", "city", "contact_data"]);

    let seats = specs.iter().find(|s| s.name == "seats").unwrap();
    assert_eq!(seats.primary_key, vec!["aircraft_code", "seat_no"]);
}
