// src/pipeline/parser.rs
//! Streaming CSV → typed records against a declared schema.
//!
//! The payload is read record by record straight from the fetched byte
//! buffer. Bad rows become `RowError`s and parsing carries on; only a header
//! that disagrees with the schema stops the cycle.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{Reader, ReaderBuilder, StringRecord, Trim};
use std::borrow::Cow;

use crate::config::schema::{CsvSchema, FieldType};
use crate::error::{HeaderError, RowError, RowErrorKind};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Typed value of one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Numeric view; timestamps become epoch seconds.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Str(_) => None,
            FieldValue::Int(i) => Some(*i as f64),
            FieldValue::Float(f) => Some(*f),
            FieldValue::Timestamp(ts) => Some(ts.timestamp() as f64),
        }
    }

    /// Textual view used for filters and label values.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            FieldValue::Str(s) => Cow::Borrowed(s.as_str()),
            FieldValue::Int(i) => Cow::Owned(i.to_string()),
            FieldValue::Float(f) => Cow::Owned(f.to_string()),
            FieldValue::Timestamp(ts) => Cow::Owned(ts.to_rfc3339()),
        }
    }

    fn convert(raw: &str, field_type: FieldType) -> Option<Self> {
        match field_type {
            FieldType::String => Some(FieldValue::Str(raw.to_string())),
            FieldType::Integer => raw.parse::<i64>().ok().map(FieldValue::Int),
            FieldType::Float => raw
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(FieldValue::Float),
            FieldType::Timestamp => parse_timestamp(raw).map(FieldValue::Timestamp),
        }
    }
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC), `YYYY-MM-DD`, or epoch seconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
    }
    None
}

/// A row that passed validation. Values are indexed by schema position.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub line: u64,
    values: Vec<Option<FieldValue>>,
}

impl ParsedRecord {
    pub fn new(line: u64, values: Vec<Option<FieldValue>>) -> Self {
        Self { line, values }
    }

    /// `None` for empty optional fields.
    pub fn get(&self, position: usize) -> Option<&FieldValue> {
        self.values.get(position).and_then(Option::as_ref)
    }
}

/// Everything one parse pass produced.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<ParsedRecord>,
    pub dropped: usize,
    pub errors: Vec<RowError>,
    pub total_rows: usize,
}

/// Lazy, single-pass iterator over the data rows of a payload.
pub struct RecordIter<'a> {
    reader: Reader<&'a [u8]>,
    schema: &'a CsvSchema,
    /// Header column index → schema position, `None` for ignored columns.
    header_map: Vec<Option<usize>>,
    record: StringRecord,
    total_rows: usize,
}

impl<'a> RecordIter<'a> {
    /// Data rows seen so far (valid + dropped).
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    fn convert(&self, line: u64) -> Result<ParsedRecord, RowErrorKind> {
        if self.record.len() != self.header_map.len() {
            return Err(RowErrorKind::ColumnCount {
                expected: self.header_map.len(),
                found: self.record.len(),
            });
        }

        let columns = self.schema.columns();
        let mut values = vec![None; columns.len()];
        for (raw, slot) in self.record.iter().zip(&self.header_map) {
            let Some(pos) = *slot else { continue };
            let col = &columns[pos];
            if raw.is_empty() {
                if col.required {
                    return Err(RowErrorKind::MissingRequired {
                        column: col.name.clone(),
                    });
                }
                continue;
            }
            let value =
                FieldValue::convert(raw, col.field_type).ok_or_else(|| RowErrorKind::InvalidValue {
                    column: col.name.clone(),
                    value: raw.to_string(),
                    expected: col.field_type,
                })?;
            values[pos] = Some(value);
        }
        Ok(ParsedRecord::new(line, values))
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<ParsedRecord, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            return match self.reader.read_record(&mut self.record) {
                Ok(false) => None,
                // Whitespace-only lines trim down to empty fields; not a row.
                Ok(true) if self.record.iter().all(str::is_empty) => continue,
                Ok(true) => {
                    self.total_rows += 1;
                    let line = self
                        .record
                        .position()
                        .map(|p| p.line())
                        .unwrap_or_else(|| self.reader.position().line());
                    Some(self.convert(line).map_err(|kind| RowError { line, kind }))
                }
                Err(e) => {
                    self.total_rows += 1;
                    let line = e
                        .position()
                        .map(|p| p.line())
                        .unwrap_or_else(|| self.reader.position().line());
                    Some(Err(RowError {
                        line,
                        kind: RowErrorKind::Malformed(e.to_string()),
                    }))
                }
            };
        }
    }
}

/// Validate the header and return an iterator over the remaining rows.
pub fn records<'a>(payload: &'a [u8], schema: &'a CsvSchema) -> Result<RecordIter<'a>, HeaderError> {
    let payload = payload.strip_prefix(UTF8_BOM).unwrap_or(payload);
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(schema.delimiter)
        .from_reader(payload);

    let mut header = StringRecord::new();
    match reader.read_record(&mut header) {
        Ok(true) => {}
        Ok(false) => return Err(HeaderError::Missing),
        Err(e) => return Err(HeaderError::Malformed(e.to_string())),
    }

    let mut header_map = Vec::with_capacity(header.len());
    let mut seen = vec![false; schema.len()];
    for name in header.iter() {
        match schema.position(name) {
            Some(pos) if seen[pos] => return Err(HeaderError::DuplicateColumn(name.to_string())),
            Some(pos) => {
                seen[pos] = true;
                header_map.push(Some(pos));
            }
            None if schema.ignore_extra_columns => header_map.push(None),
            None => return Err(HeaderError::UnexpectedColumn(name.to_string())),
        }
    }
    if let Some(missing) = schema.columns().iter().zip(&seen).find(|(_, s)| !**s) {
        return Err(HeaderError::MissingColumn(missing.0.name.clone()));
    }

    Ok(RecordIter {
        reader,
        schema,
        header_map,
        record: StringRecord::new(),
        total_rows: 0,
    })
}

/// Drain the payload into records and row errors.
pub fn parse(payload: &[u8], schema: &CsvSchema) -> Result<ParseOutcome, HeaderError> {
    let mut iter = records(payload, schema)?;
    let mut out = ParseOutcome::default();
    for item in iter.by_ref() {
        match item {
            Ok(rec) => out.records.push(rec),
            Err(err) => {
                out.dropped += 1;
                out.errors.push(err);
            }
        }
    }
    out.total_rows = iter.total_rows();
    Ok(out)
}
