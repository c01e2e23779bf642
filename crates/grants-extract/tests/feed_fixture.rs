use std::path::Path;

use grants_core::RecordField;
use grants_extract::extract_records;

fn fixture(name: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

#[test]
fn feed_fixture_extracts_synopses_only() {
    let records = extract_records(&fixture("GrantsDBExtract20240215v2.xml")).expect("extract");
    assert_eq!(records.len(), 2);

    let first = &records[0];
    assert_eq!(first.opportunity_id(), Some("350101"));
    assert_eq!(first.get(RecordField::FundingInstrumentType), Some("G"));
    assert_eq!(first.get(RecordField::CloseDate), Some("01152025"));
    assert_eq!(
        first.get(RecordField::Description),
        Some("Supports rural communities & partners expanding access to care.")
    );
    assert!(first.iter().all(|(_, value)| value.is_some()));

    let second = &records[1];
    assert_eq!(second.opportunity_id(), Some("350102"));
    assert_eq!(second.get(RecordField::CloseDate), None);
    assert_eq!(second.get(RecordField::AwardCeiling), None);
    assert_eq!(second.get(RecordField::LastUpdatedDate), Some("2024-02-06"));
}
