// src/error.rs
use thiserror::Error;

use crate::config::schema::FieldType;

/// Invalid configuration. Fatal at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no artifacts configured")]
    NoArtifacts,
    #[error("duplicate artifact name '{0}'")]
    DuplicateArtifact(String),
    #[error("artifact '{artifact}': {reason}")]
    Artifact { artifact: String, reason: String },
    #[error("metric '{metric}': {reason}")]
    Metric { metric: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn metric(metric: &str, reason: impl Into<String>) -> Self {
        Self::Metric {
            metric: metric.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn artifact(artifact: &str, reason: impl Into<String>) -> Self {
        Self::Artifact {
            artifact: artifact.to_string(),
            reason: reason.into(),
        }
    }
}

/// The header row does not match the declared schema. Fails the whole cycle.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HeaderError {
    #[error("payload has no header row")]
    Missing,
    #[error("header is missing declared column '{0}'")]
    MissingColumn(String),
    #[error("header repeats column '{0}'")]
    DuplicateColumn(String),
    #[error("header has undeclared column '{0}'")]
    UnexpectedColumn(String),
    #[error("header is unreadable: {0}")]
    Malformed(String),
}

/// Why a single row was dropped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RowErrorKind {
    #[error("expected {expected} fields, found {found}")]
    ColumnCount { expected: usize, found: usize },
    #[error("column '{column}': '{value}' is not a valid {expected}")]
    InvalidValue {
        column: String,
        value: String,
        expected: FieldType,
    },
    #[error("column '{column}' is required but empty")]
    MissingRequired { column: String },
    #[error("unreadable row: {0}")]
    Malformed(String),
}

/// A dropped row with its 1-based line number.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("line {line}: {kind}")]
pub struct RowError {
    pub line: u64,
    pub kind: RowErrorKind,
}
