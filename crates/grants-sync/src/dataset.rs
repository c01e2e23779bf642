//! Columnar dataset encoding: date normalization, Parquet write and read-back.

use std::sync::Arc;

use arrow_array::{Array, ArrayRef, Date32Array, RecordBatch, StringArray};
use arrow_schema::{ArrowError, DataType, Field as ArrowField, Schema, SchemaRef};
use bytes::Bytes;
use chrono::{NaiveDate, TimeDelta};
use grants_core::{DatasetRecord, FieldKind, OpportunityRecord, RecordField, FEED_DATE_FORMAT};
use grants_storage::{Storage, StorageError};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::errors::ParquetError;
use thiserror::Error;
use tracing::warn;

pub const DATASET_EXTENSION: &str = ".parquet";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("arrow: {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("dataset is missing column {0}")]
    MissingColumn(&'static str),
    #[error("dataset column {column} has type {found}, expected {expected}")]
    ColumnType {
        column: &'static str,
        found: DataType,
        expected: DataType,
    },
    #[error("dataset column {column} holds day {days}, outside the supported date range")]
    DateOutOfRange { column: &'static str, days: i32 },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn date_from_days(column: &'static str, days: i32) -> Result<NaiveDate, DatasetError> {
    TimeDelta::try_days(i64::from(days))
        .and_then(|delta| epoch().checked_add_signed(delta))
        .ok_or(DatasetError::DateOutOfRange { column, days })
}

/// Parse an `MMDDYYYY` feed date. Anything that is not exactly eight digits
/// forming a real calendar date gives `None`.
pub fn parse_feed_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(text, FEED_DATE_FORMAT).ok()
}

/// Normalize extracted records into dataset rows. Malformed dates are logged
/// and stored as null; they never abort the batch.
pub fn materialize_records(records: &[OpportunityRecord]) -> Vec<DatasetRecord> {
    records
        .iter()
        .map(|record| {
            let mut row = DatasetRecord::new();
            for (field, raw) in record.iter() {
                match field.kind() {
                    FieldKind::Text => row.set_text(field, raw.map(str::to_string)),
                    FieldKind::Date => {
                        let parsed = raw.and_then(parse_feed_date);
                        if let (Some(raw), None) = (raw, parsed) {
                            warn!(
                                opportunity_id = record.opportunity_id().unwrap_or("<none>"),
                                field = field.name(),
                                value = raw,
                                "unparseable feed date; storing null"
                            );
                        }
                        row.set_date(field, parsed);
                    }
                }
            }
            row
        })
        .collect()
}

fn arrow_type(kind: FieldKind) -> DataType {
    match kind {
        FieldKind::Text => DataType::Utf8,
        FieldKind::Date => DataType::Date32,
    }
}

/// Column layout of every dataset file, in field-table order.
pub fn dataset_schema() -> SchemaRef {
    Arc::new(Schema::new(
        RecordField::ALL
            .into_iter()
            .map(|field| ArrowField::new(field.name(), arrow_type(field.kind()), true))
            .collect::<Vec<_>>(),
    ))
}

fn column_for(field: RecordField, rows: &[DatasetRecord]) -> ArrayRef {
    match field.kind() {
        FieldKind::Text => Arc::new(StringArray::from(
            rows.iter().map(|row| row.text(field)).collect::<Vec<_>>(),
        )),
        FieldKind::Date => Arc::new(Date32Array::from(
            rows.iter()
                .map(|row| row.date(field).map(|d| (d - epoch()).num_days() as i32))
                .collect::<Vec<_>>(),
        )),
    }
}

pub fn encode_parquet(rows: &[DatasetRecord]) -> Result<Vec<u8>, DatasetError> {
    let schema = dataset_schema();
    let columns = RecordField::ALL
        .into_iter()
        .map(|field| column_for(field, rows))
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let mut writer = ArrowWriter::try_new(Vec::new(), schema, None)?;
    writer.write(&batch)?;
    Ok(writer.into_inner()?)
}

fn typed_column<'a, T: 'static>(
    batch: &'a RecordBatch,
    field: RecordField,
) -> Result<&'a T, DatasetError> {
    let column = batch
        .column_by_name(field.name())
        .ok_or(DatasetError::MissingColumn(field.name()))?;
    column
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| DatasetError::ColumnType {
            column: field.name(),
            found: column.data_type().clone(),
            expected: arrow_type(field.kind()),
        })
}

pub fn decode_parquet(bytes: Vec<u8>) -> Result<Vec<DatasetRecord>, DatasetError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(Bytes::from(bytes))?.build()?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let mut chunk = vec![DatasetRecord::new(); batch.num_rows()];
        for field in RecordField::ALL {
            match field.kind() {
                FieldKind::Text => {
                    let column = typed_column::<StringArray>(&batch, field)?;
                    for (row, value) in chunk.iter_mut().zip(column.iter()) {
                        row.set_text(field, value.map(str::to_string));
                    }
                }
                FieldKind::Date => {
                    let column = typed_column::<Date32Array>(&batch, field)?;
                    for (row, value) in chunk.iter_mut().zip(column.iter()) {
                        let date = value
                            .map(|days| date_from_days(field.name(), days))
                            .transpose()?;
                        row.set_date(field, date);
                    }
                }
            }
        }
        rows.extend(chunk);
    }
    Ok(rows)
}

/// A dataset artifact read back from the store.
#[derive(Debug, Clone)]
pub struct LoadedDataset {
    pub key: String,
    pub records: Vec<DatasetRecord>,
}

/// Read the most recent dataset at the bucket root. `Ok(None)` means no
/// dataset has been written yet.
pub async fn load_latest_dataset(
    storage: &dyn Storage,
) -> Result<Option<LoadedDataset>, DatasetError> {
    let Some(key) = storage
        .list("")
        .await?
        .into_iter()
        .filter(|key| !key.contains('/') && key.ends_with(DATASET_EXTENSION))
        .max()
    else {
        return Ok(None);
    };

    let bytes = storage.get(&key).await?;
    let records = decode_parquet(bytes)?;
    Ok(Some(LoadedDataset { key, records }))
}
