//! Core domain model for the grants extract pipeline.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "grants-core";

/// `FundingInstrumentType` code meaning "grant". Downstream consumers filter on
/// this exact value.
pub const FUNDING_INSTRUMENT_GRANT: &str = "G";

/// Source format of the three date fields.
pub const FEED_DATE_FORMAT: &str = "%m%d%Y";

pub const FIELD_COUNT: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Date,
}

/// One column of the opportunity table. `ALL` is the column order of the
/// dataset and the extraction table of the XML extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordField {
    OpportunityId,
    OpportunityTitle,
    Description,
    AgencyCode,
    OpportunityNumber,
    OpportunityCategory,
    FundingInstrumentType,
    CfdaNumbers,
    CategoryOfFundingActivity,
    EligibleApplicants,
    AdditionalInformationOnEligibility,
    AgencyName,
    PostDate,
    CloseDate,
    LastUpdatedDate,
    AwardCeiling,
    EstimatedTotalProgramFunding,
    ExpectedNumberOfAwards,
}

impl RecordField {
    pub const ALL: [RecordField; FIELD_COUNT] = [
        RecordField::OpportunityId,
        RecordField::OpportunityTitle,
        RecordField::Description,
        RecordField::AgencyCode,
        RecordField::OpportunityNumber,
        RecordField::OpportunityCategory,
        RecordField::FundingInstrumentType,
        RecordField::CfdaNumbers,
        RecordField::CategoryOfFundingActivity,
        RecordField::EligibleApplicants,
        RecordField::AdditionalInformationOnEligibility,
        RecordField::AgencyName,
        RecordField::PostDate,
        RecordField::CloseDate,
        RecordField::LastUpdatedDate,
        RecordField::AwardCeiling,
        RecordField::EstimatedTotalProgramFunding,
        RecordField::ExpectedNumberOfAwards,
    ];

    /// Element name in the feed and column name in the dataset.
    pub fn name(self) -> &'static str {
        match self {
            RecordField::OpportunityId => "OpportunityID",
            RecordField::OpportunityTitle => "OpportunityTitle",
            RecordField::Description => "Description",
            RecordField::AgencyCode => "AgencyCode",
            RecordField::OpportunityNumber => "OpportunityNumber",
            RecordField::OpportunityCategory => "OpportunityCategory",
            RecordField::FundingInstrumentType => "FundingInstrumentType",
            RecordField::CfdaNumbers => "CFDANumbers",
            RecordField::CategoryOfFundingActivity => "CategoryOfFundingActivity",
            RecordField::EligibleApplicants => "EligibleApplicants",
            RecordField::AdditionalInformationOnEligibility => {
                "AdditionalInformationOnEligibility"
            }
            RecordField::AgencyName => "AgencyName",
            RecordField::PostDate => "PostDate",
            RecordField::CloseDate => "CloseDate",
            RecordField::LastUpdatedDate => "LastUpdatedDate",
            RecordField::AwardCeiling => "AwardCeiling",
            RecordField::EstimatedTotalProgramFunding => "EstimatedTotalProgramFunding",
            RecordField::ExpectedNumberOfAwards => "ExpectedNumberOfAwards",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            RecordField::PostDate | RecordField::CloseDate | RecordField::LastUpdatedDate => {
                FieldKind::Date
            }
            _ => FieldKind::Text,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Flat opportunity as extracted from the feed. Every field is raw text or
/// null, so all records share the same shape.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpportunityRecord {
    values: [Option<String>; FIELD_COUNT],
}

impl OpportunityRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: RecordField) -> Option<&str> {
        self.values[field.index()].as_deref()
    }

    pub fn set(&mut self, field: RecordField, value: Option<String>) {
        self.values[field.index()] = value;
    }

    pub fn with(mut self, field: RecordField, value: impl Into<String>) -> Self {
        self.set(field, Some(value.into()));
        self
    }

    pub fn opportunity_id(&self) -> Option<&str> {
        self.get(RecordField::OpportunityId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RecordField, Option<&str>)> + '_ {
        RecordField::ALL
            .into_iter()
            .map(move |field| (field, self.get(field)))
    }
}

/// Value of one dataset cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(Option<String>),
    Date(Option<NaiveDate>),
}

impl FieldValue {
    fn null_for(field: RecordField) -> Self {
        match field.kind() {
            FieldKind::Text => FieldValue::Text(None),
            FieldKind::Date => FieldValue::Date(None),
        }
    }
}

/// Materialized row: text fields carried verbatim, date fields parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRecord {
    values: Vec<FieldValue>,
}

impl Default for DatasetRecord {
    fn default() -> Self {
        Self {
            values: RecordField::ALL
                .into_iter()
                .map(FieldValue::null_for)
                .collect(),
        }
    }
}

impl DatasetRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, field: RecordField) -> &FieldValue {
        &self.values[field.index()]
    }

    /// Text of a text field; `None` for nulls and for date fields.
    pub fn text(&self, field: RecordField) -> Option<&str> {
        match self.value(field) {
            FieldValue::Text(value) => value.as_deref(),
            FieldValue::Date(_) => None,
        }
    }

    /// Parsed date of a date field; `None` for nulls and for text fields.
    pub fn date(&self, field: RecordField) -> Option<NaiveDate> {
        match self.value(field) {
            FieldValue::Date(value) => *value,
            FieldValue::Text(_) => None,
        }
    }

    pub fn set_text(&mut self, field: RecordField, value: Option<String>) {
        debug_assert_eq!(field.kind(), FieldKind::Text);
        self.values[field.index()] = FieldValue::Text(value);
    }

    pub fn set_date(&mut self, field: RecordField, value: Option<NaiveDate>) {
        debug_assert_eq!(field.kind(), FieldKind::Date);
        self.values[field.index()] = FieldValue::Date(value);
    }

    pub fn close_date(&self) -> Option<NaiveDate> {
        self.date(RecordField::CloseDate)
    }

    pub fn funding_instrument_type(&self) -> Option<&str> {
        self.text(RecordField::FundingInstrumentType)
    }

    pub fn is_grant(&self) -> bool {
        self.funding_instrument_type() == Some(FUNDING_INSTRUMENT_GRANT)
    }
}
