//! Reads a staged bill export and maps its rows onto the platform-independent record shape.

use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;

use crate::{
    config::PlatformOptions,
    platform::{AmountError, PlatformAdapter},
};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, io::Error),
    #[error("{} has no header row starting with '{column}'; is it really a {platform} export?", .path.display())]
    MissingHeader {
        path: PathBuf,
        platform: &'static str,
        column: &'static str,
    },
    #[error("malformed table in {0}: {1}")]
    MalformedTable(PathBuf, csv::Error),
    #[error("row {row}: {source}")]
    Amount { row: usize, source: AmountError },
}

/// One row of a platform's export, keyed by the platform's own column names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawRow(HashMap<String, String>);

impl RawRow {
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    fn remove(&mut self, column: &str) {
        self.0.remove(column);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(column, value)| (column.into(), value.into()))
                .collect(),
        )
    }
}

/// A transaction in the shape every platform is mapped to.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CanonicalRecord {
    pub content: String,
    pub amount: f64,
    pub category: String,
    /// ISO 8601 form of the platform's local timestamp, e.g. `2023-01-02T03:04:05Z`.
    pub datetime: String,
    pub counterparty: String,
    pub remarks: String,
    pub transaction_id: String,
    pub merchant_order_id: String,
    pub payment_method: String,
    /// The display name of the platform the record came from.
    pub source_platform: String,
}

/// Read a staged export. Everything above the header row is skipped, every cell is trimmed, and
/// rows shorter than the header (summary footers) are dropped.
///
/// # Errors
/// Returns a [`DataError`] if the file can't be read, has no header row or isn't valid CSV.
pub fn read_bill_table(path: &Path, adapter: &dyn PlatformAdapter) -> Result<Vec<RawRow>, DataError> {
    let bytes = fs::read(path).map_err(|err| DataError::ReadFailed(path.to_path_buf(), err))?;
    let (text, _, had_errors) = adapter.raw_encoding().decode(&bytes);
    if had_errors {
        warn!(
            "{} is not entirely valid {}; some characters were replaced",
            path.display(),
            adapter.raw_encoding().name()
        );
    }

    let header_column = adapter.columns().datetime;
    let header_start = find_header(&text, header_column).ok_or_else(|| DataError::MissingHeader {
        path: path.to_path_buf(),
        platform: adapter.id(),
        column: header_column,
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text[header_start..].as_bytes());
    let headers = reader
        .headers()
        .map_err(|err| DataError::MalformedTable(path.to_path_buf(), err))?
        .iter()
        .map(|header| header.trim().to_string())
        .collect::<Vec<_>>();

    let mut rows: Vec<RawRow> = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| DataError::MalformedTable(path.to_path_buf(), err))?;
        if record.len() < headers.len() {
            debug!("Skipping short row in {}: {record:?}", path.display());
            continue;
        }

        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .filter(|(header, _)| !header.is_empty())
                .map(|(header, value)| (header.as_str(), value.trim()))
                .collect(),
        );
    }

    debug!("Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// The byte offset of the first line starting with `column`.
fn find_header(text: &str, column: &str) -> Option<usize> {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start_matches('\u{feff}').trim_start().starts_with(column) {
            return Some(offset);
        }

        offset += line.len();
    }

    None
}

/// Turns raw rows into canonical records, dropping excluded rows and pruned columns on the way.
#[derive(Clone, Debug, Default)]
pub struct RecordNormalizer {
    exclude: BTreeMap<String, Vec<String>>,
    prune: Vec<String>,
}

impl RecordNormalizer {
    #[must_use]
    pub fn new(exclude: BTreeMap<String, Vec<String>>, prune: Vec<String>) -> Self {
        Self { exclude, prune }
    }

    #[must_use]
    pub fn from_options(options: &PlatformOptions) -> Self {
        Self::new(options.exclude().clone(), options.prune().to_vec())
    }

    /// Normalize every row that survives filtering.
    ///
    /// # Errors
    /// Returns [`DataError::Amount`] if the adapter rejects an amount. The row is counted from one
    /// among all data rows, excluded ones included.
    pub fn normalize(
        &self,
        rows: Vec<RawRow>,
        adapter: &dyn PlatformAdapter,
    ) -> Result<Vec<CanonicalRecord>, DataError> {
        rows.into_iter()
            .enumerate()
            .filter(|(_, row)| !self.is_excluded(row))
            .map(|(index, mut row)| {
                for column in &self.prune {
                    row.remove(column);
                }

                to_canonical(&row, adapter).map_err(|source| DataError::Amount {
                    row: index + 1,
                    source,
                })
            })
            .collect()
    }

    fn is_excluded(&self, row: &RawRow) -> bool {
        self.exclude.iter().any(|(column, values)| {
            row.get(column)
                .is_some_and(|value| values.iter().any(|excluded| excluded == value))
        })
    }
}

fn to_canonical(row: &RawRow, adapter: &dyn PlatformAdapter) -> Result<CanonicalRecord, AmountError> {
    let columns = adapter.columns();
    let field = |column: &str| row.get(column).unwrap_or_default().to_string();

    Ok(CanonicalRecord {
        content: field(columns.content),
        amount: adapter.parse_amount(row.get(columns.amount).unwrap_or_default())?,
        category: field(columns.category),
        datetime: normalize_datetime(row.get(columns.datetime).unwrap_or_default()),
        counterparty: field(columns.counterparty),
        remarks: adapter.normalize_remarks(row.get(columns.remarks).unwrap_or_default()),
        transaction_id: field(columns.transaction_id),
        merchant_order_id: field(columns.merchant_order_id),
        payment_method: field(columns.payment_method),
        source_platform: adapter.display_name().to_string(),
    })
}

/// Splice a `T` after the date and append `Z`: `2023-01-02 03:04:05` becomes
/// `2023-01-02T03:04:05Z`. The input is not validated.
#[must_use]
pub fn normalize_datetime(raw: &str) -> String {
    let date = raw.chars().take(10).collect::<String>();
    let time = raw.chars().skip(11).collect::<String>();

    format!("{date}T{time}Z")
}
