//! Opportunity synopsis extraction from the namespaced grants XML document.

use grants_core::{OpportunityRecord, RecordField};
use roxmltree::{Document, Node};
use tracing::debug;

use crate::ExtractError;

pub const OPPORTUNITY_NAMESPACE: &str = "http://apply.grants.gov/system/OpportunityDetail-V1.0";
pub const SYNOPSIS_TAG: &str = "OpportunitySynopsisDetail_1_0";

/// Parse a feed document into one record per synopsis element, in document
/// order. A document with no synopsis elements yields an empty vector.
pub fn extract_records(xml: &[u8]) -> Result<Vec<OpportunityRecord>, ExtractError> {
    let text = std::str::from_utf8(xml)?;
    let doc = Document::parse(text)?;

    let records = doc
        .root_element()
        .descendants()
        .skip(1)
        .filter(|node| node.has_tag_name((OPPORTUNITY_NAMESPACE, SYNOPSIS_TAG)))
        .map(record_from_synopsis)
        .collect::<Vec<_>>();

    debug!(records = records.len(), "extracted synopsis records");
    Ok(records)
}

fn record_from_synopsis(synopsis: Node<'_, '_>) -> OpportunityRecord {
    let mut record = OpportunityRecord::new();
    for field in RecordField::ALL {
        record.set(field, first_descendant_text(synopsis, field.name()));
    }
    record
}

/// Text of the first descendant (not only direct children) named `local` in
/// the opportunity namespace. Missing or empty elements give `None`.
fn first_descendant_text(parent: Node<'_, '_>, local: &str) -> Option<String> {
    parent
        .descendants()
        .skip(1)
        .find(|node| node.has_tag_name((OPPORTUNITY_NAMESPACE, local)))
        .and_then(|node| node.text())
        .map(str::to_string)
}
