//! Grant selection over a loaded dataset.

use chrono::{Days, NaiveDate};
use grants_core::DatasetRecord;
use serde::Serialize;

/// Grants (`FundingInstrumentType == "G"`) closing between `today` and
/// `today + days`, both ends inclusive. Rows without a close date never match.
pub fn filter_closing_grants(
    records: &[DatasetRecord],
    today: NaiveDate,
    days: u32,
) -> Vec<DatasetRecord> {
    let horizon = today
        .checked_add_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MAX);

    records
        .iter()
        .filter(|record| record.is_grant())
        .filter(|record| {
            record
                .close_date()
                .is_some_and(|close| close >= today && close <= horizon)
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatasetInsights {
    pub record_count: usize,
    pub earliest_close_date: Option<NaiveDate>,
    pub latest_close_date: Option<NaiveDate>,
}

impl DatasetInsights {
    pub fn from_records(records: &[DatasetRecord]) -> Self {
        let close_dates = records.iter().filter_map(DatasetRecord::close_date);
        Self {
            record_count: records.len(),
            earliest_close_date: close_dates.clone().min(),
            latest_close_date: close_dates.max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grants_core::RecordField;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn row(id: &str, instrument: &str, close: Option<NaiveDate>) -> DatasetRecord {
        let mut record = DatasetRecord::new();
        record.set_text(RecordField::OpportunityId, Some(id.to_string()));
        record.set_text(RecordField::FundingInstrumentType, Some(instrument.to_string()));
        record.set_date(RecordField::CloseDate, close);
        record
    }

    fn ids(records: &[DatasetRecord]) -> Vec<&str> {
        records
            .iter()
            .filter_map(|r| r.text(RecordField::OpportunityId))
            .collect()
    }

    #[test]
    fn window_is_inclusive_and_grants_only() {
        let today = ymd(2024, 3, 1);
        let records = vec![
            row("yesterday", "G", Some(ymd(2024, 2, 29))),
            row("today", "G", Some(today)),
            row("edge", "G", Some(ymd(2024, 3, 21))),
            row("beyond", "G", Some(ymd(2024, 3, 22))),
            row("cooperative", "CA", Some(ymd(2024, 3, 5))),
            row("no-close-date", "G", None),
        ];

        let selected = filter_closing_grants(&records, today, 20);
        assert_eq!(ids(&selected), vec!["today", "edge"]);
    }

    #[test]
    fn zero_day_window_keeps_only_today() {
        let today = ymd(2024, 3, 1);
        let records = vec![row("a", "G", Some(today)), row("b", "G", Some(ymd(2024, 3, 2)))];
        assert_eq!(ids(&filter_closing_grants(&records, today, 0)), vec!["a"]);
    }

    #[test]
    fn insights_ignore_null_close_dates() {
        let records = vec![
            row("a", "G", Some(ymd(2024, 5, 1))),
            row("b", "G", None),
            row("c", "G", Some(ymd(2024, 4, 1))),
        ];
        let insights = DatasetInsights::from_records(&records);
        assert_eq!(insights.record_count, 3);
        assert_eq!(insights.earliest_close_date, Some(ymd(2024, 4, 1)));
        assert_eq!(insights.latest_close_date, Some(ymd(2024, 5, 1)));

        let empty = DatasetInsights::from_records(&[row("x", "G", None)]);
        assert_eq!(empty.earliest_close_date, None);
        assert_eq!(empty.latest_close_date, None);
    }
}
