//! Core domain model for the daily CPH reconciliation routine.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Return-code placeholder shown for jobs that never reported one.
pub const NOT_RUN: &str = "Not Run";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown job status `{0}` (expected OK or NOT-OK)")]
    JobStatus(String),
    #[error("unknown metric `{0}`")]
    Metric(String),
    #[error("unknown jira mode `{0}` (expected QA or PROD)")]
    JiraMode(String),
}

/// Outcome recorded for one legacy batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "NOT-OK")]
    NotOk,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotOk => "NOT-OK",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OK" => Ok(Self::Ok),
            "NOT-OK" | "NOT_OK" | "NOK" => Ok(Self::NotOk),
            _ => Err(ParseError::JobStatus(s.to_string())),
        }
    }
}

/// Per-run status of one legacy job (ephemeral, rebuilt every run).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: String,
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default)]
    pub rc: Option<String>,
}

impl JobRecord {
    pub fn new(
        job: impl Into<String>,
        job_id: impl Into<String>,
        status: JobStatus,
        rc: Option<String>,
    ) -> Self {
        Self {
            job: job.into(),
            job_id: job_id.into(),
            status,
            rc,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == JobStatus::Ok
    }

    /// Return code for display; never blank.
    pub fn rc_display(&self) -> &str {
        match self.rc.as_deref().map(str::trim) {
            Some(rc) if !rc.is_empty() => rc,
            _ => NOT_RUN,
        }
    }
}

/// The six fixed rows of the reconciliation overview, in report order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    Settled,
    Pending,
    Participants,
    #[serde(rename = "ISIN")]
    Isin,
    Holdings,
    Accounts,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Settled,
        Metric::Pending,
        Metric::Participants,
        Metric::Isin,
        Metric::Holdings,
        Metric::Accounts,
    ];

    /// Row label as it appears in the overview sheet.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settled => "Settled",
            Self::Pending => "Pending",
            Self::Participants => "Participants",
            Self::Isin => "ISIN",
            Self::Holdings => "Holdings",
            Self::Accounts => "Accounts",
        }
    }

    /// Row label used in issue descriptions.
    pub fn jira_label(&self) -> &'static str {
        match self {
            Self::Settled => "Settled Events",
            Self::Pending => "Pending Events",
            Self::Participants => "Participants",
            Self::Isin => "ISINS",
            Self::Holdings => "Holdings",
            Self::Accounts => "Accounts",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseError::Metric(s.to_string()))
    }
}

/// Raw column header as delivered by the spreadsheet reader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnLabel {
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl From<&str> for ColumnLabel {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ColumnLabel {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for ColumnLabel {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for ColumnLabel {
    fn from(value: NaiveDateTime) -> Self {
        Self::DateTime(value)
    }
}

/// One cell of the overview table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    #[default]
    Empty,
}

impl CellValue {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        match trimmed.parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Text(trimmed.to_string()),
        }
    }

    /// Numeric coercion; anything that is not a finite number is missing.
    pub fn to_numeric(&self) -> Option<f64> {
        match self {
            Self::Number(n) if n.is_finite() => Some(*n),
            Self::Number(_) | Self::Empty => None,
            Self::Text(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.trim().is_empty(),
            Self::Number(_) => false,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{n:.0}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(text) => f.write_str(text),
            Self::Empty => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("index has {index} labels but {rows} rows were supplied")]
    IndexLength { index: usize, rows: usize },
    #[error("row `{row}` has {found} cells, expected {expected}")]
    RowWidth {
        row: String,
        found: usize,
        expected: usize,
    },
    #[error("{found} column labels supplied for a table with {expected} columns")]
    ColumnCount { found: usize, expected: usize },
}

/// Overview table: rows are metric names, columns are dated observations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReconTable {
    index: Vec<String>,
    columns: Vec<String>,
    rows: Vec<Vec<CellValue>>,
}

impl ReconTable {
    pub fn new(
        index: Vec<String>,
        columns: Vec<String>,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<Self, TableError> {
        if index.len() != rows.len() {
            return Err(TableError::IndexLength {
                index: index.len(),
                rows: rows.len(),
            });
        }
        for (name, row) in index.iter().zip(&rows) {
            if row.len() != columns.len() {
                return Err(TableError::RowWidth {
                    row: name.clone(),
                    found: row.len(),
                    expected: columns.len(),
                });
            }
        }
        Ok(Self {
            index,
            columns,
            rows,
        })
    }

    pub fn index(&self) -> &[String] {
        &self.index
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<CellValue>] {
        &self.rows
    }

    pub fn n_rows(&self) -> usize {
        self.index.len()
    }

    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// A table with no rows or no columns carries no observation.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty() || self.columns.is_empty()
    }

    /// Every row whose trimmed index name equals `name`, in table order.
    /// Exports can repeat a metric row, so callers must not assume one match.
    pub fn rows_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a [CellValue]> + 'a {
        self.index
            .iter()
            .zip(&self.rows)
            .filter(move |(index, _)| index.trim() == name)
            .map(|(_, row)| row.as_slice())
    }

    /// Keeps only the trailing `n` columns (all of them when fewer exist).
    pub fn last_columns(&self, n: usize) -> Self {
        let start = self.columns.len().saturating_sub(n);
        Self {
            index: self.index.clone(),
            columns: self.columns[start..].to_vec(),
            rows: self.rows.iter().map(|row| row[start..].to_vec()).collect(),
        }
    }

    pub fn with_columns(self, labels: Vec<String>) -> Result<Self, TableError> {
        if labels.len() != self.columns.len() {
            return Err(TableError::ColumnCount {
                found: labels.len(),
                expected: self.columns.len(),
            });
        }
        Ok(Self {
            columns: labels,
            ..self
        })
    }

    /// Removes columns in which every cell is empty.
    pub fn drop_empty_columns(self) -> Self {
        let keep: Vec<bool> = (0..self.columns.len())
            .map(|c| self.rows.iter().any(|row| !row[c].is_empty()))
            .collect();
        let columns = self
            .columns
            .into_iter()
            .zip(&keep)
            .filter_map(|(label, keep)| keep.then_some(label))
            .collect();
        let rows = self
            .rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&keep)
                    .filter_map(|(cell, keep)| keep.then_some(cell))
                    .collect()
            })
            .collect();
        Self {
            index: self.index,
            columns,
            rows,
        }
    }
}

/// Communication classification for a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailType {
    Full,
    Partial,
    FlowStopped,
    Wait,
}

impl EmailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Partial => "PARTIAL",
            Self::FlowStopped => "FLOW_STOPPED",
            Self::Wait => "WAIT",
        }
    }
}

impl fmt::Display for EmailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of the two most recent snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Duplicate,
    NearDuplicate,
    Ok,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::NearDuplicate => "near_duplicate",
            Self::Ok => "ok",
        }
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which issue-tracker instance the run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JiraMode {
    #[default]
    Qa,
    Prod,
}

impl FromStr for JiraMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QA" => Ok(Self::Qa),
            "PROD" => Ok(Self::Prod),
            _ => Err(ParseError::JiraMode(s.to_string())),
        }
    }
}
