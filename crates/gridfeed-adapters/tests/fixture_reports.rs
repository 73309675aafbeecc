// Parses the captured reports under fixtures/ end to end.

use std::collections::HashSet;
use std::path::PathBuf;

use gridfeed_adapters::parser_for;
use gridfeed_core::ParserKind;

fn fixture(relative: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(relative);
    std::fs::read_to_string(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn realtime_zonal_lbmp_fixture_parses_cleanly() {
    let body = fixture("rt-lbmp/20251110realtime_zone.csv");
    let outcome = parser_for(ParserKind::ZonalPrice)
        .parse("rt-lbmp", &body)
        .expect("parse");

    assert_eq!(outcome.rows_total, 60);
    assert_eq!(outcome.rows_skipped, 0);
    assert_eq!(outcome.records.len(), 60);

    let keys: HashSet<_> = outcome.records.iter().map(|r| r.natural_key()).collect();
    assert_eq!(keys.len(), 60);
    assert!(outcome.records.iter().any(|r| r.dimension_name == "N.Y.C."));
}

#[test]
fn fuel_mix_fixture_normalizes_categories() {
    let body = fixture("rt-fuel-mix/20251110rtfuelmix.csv");
    let outcome = parser_for(ParserKind::FuelMix)
        .parse("rt-fuel-mix", &body)
        .expect("parse");

    assert_eq!(outcome.records.len(), 14);
    assert!(outcome
        .records
        .iter()
        .any(|r| r.dimension_name == "other_fossil_fuels"));
}

#[test]
fn load_forecast_fixture_spans_two_days_of_zones() {
    let body = fixture("load-forecast/20251110isolf.csv");
    let outcome = parser_for(ParserKind::LoadForecast)
        .parse("load-forecast", &body)
        .expect("parse");

    assert_eq!(outcome.rows_parsed, 48);
    assert_eq!(outcome.records.len(), 48 * 11);
    assert!(outcome.records.iter().all(|r| r.dimension_name != "NYISO"));
}
