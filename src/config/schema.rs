// src/config/schema.rs
//! Declared CSV schema: column names and their tagged types.
//!
//! The schema is configuration, never inferred from the payload. Header
//! validation and row conversion both read from here.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// Type tag for one declared column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Timestamp,
}

impl FieldType {
    /// Integer, float and timestamp fields can feed gauges and histograms.
    pub fn is_numeric(self) -> bool {
        !matches!(self, FieldType::String)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Timestamp => "timestamp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Empty values in a required column drop the row.
    #[serde(default)]
    pub required: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Ordered column declarations plus the reader options for one artifact.
#[derive(Debug, Clone)]
pub struct CsvSchema {
    columns: Vec<ColumnSpec>,
    index: HashMap<String, usize>,
    pub delimiter: u8,
    pub ignore_extra_columns: bool,
}

impl CsvSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Self {
            columns,
            index,
            delimiter: b',',
            ignore_extra_columns: false,
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_ignore_extra_columns(mut self, ignore: bool) -> Self {
        self.ignore_extra_columns = ignore;
        self
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Position of a declared column in the schema (not in the header).
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.position(name).map(|i| &self.columns[i])
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl PartialEq for CsvSchema {
    fn eq(&self, other: &Self) -> bool {
        self.columns == other.columns
            && self.delimiter == other.delimiter
            && self.ignore_extra_columns == other.ignore_extra_columns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_follow_declaration_order() {
        let schema = CsvSchema::new(vec![
            ColumnSpec::new("id", FieldType::Integer).required(),
            ColumnSpec::new("status", FieldType::String),
        ]);
        assert_eq!(schema.position("id"), Some(0));
        assert_eq!(schema.position("status"), Some(1));
        assert_eq!(schema.position("missing"), None);
        assert!(schema.column("id").unwrap().required);
    }

    #[test]
    fn field_type_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrap {
            t: FieldType,
        }
        let w: Wrap = toml::from_str(r#"t = "timestamp""#).unwrap();
        assert_eq!(w.t, FieldType::Timestamp);
        assert!(w.t.is_numeric());
        assert!(!FieldType::String.is_numeric());
    }
}
