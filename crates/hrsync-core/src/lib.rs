//! Core schema model, field normalization and run bookkeeping for hrsync.
//!
//! Everything in this crate is pure: no network, no database. The sync crate drives these
//! types window by window and owns the single [`RunResult`] of a run.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hrsync-core";

/// Stored in place of a text field that is blank or absent from the source header.
pub const NA_SENTINEL: &str = "NA";

/// Candidate date layouts, tried in order. The order resolves ambiguous inputs:
/// slash-separated dates are month-first, dash and dot separated ones are day-first.
pub const DATE_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d-%m-%Y",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m-%d-%Y",
    "%Y.%m.%d",
    "%d.%m.%Y",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ColumnType {
    Text,
    Varchar(u32),
    Date,
}

impl ColumnType {
    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::Text => "TEXT".to_string(),
            ColumnType::Varchar(len) => format!("VARCHAR({len})"),
            ColumnType::Date => "DATE".to_string(),
        }
    }

    /// `data_type` as reported by `information_schema.columns`.
    pub fn information_schema_type(&self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Varchar(_) => "character varying",
            ColumnType::Date => "date",
        }
    }

    pub fn max_len(&self) -> Option<usize> {
        match self {
            ColumnType::Varchar(len) => Some(*len as usize),
            _ => None,
        }
    }

    pub fn is_date(&self) -> bool {
        matches!(self, ColumnType::Date)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Text => f.write_str("text"),
            ColumnType::Varchar(len) => write!(f, "varchar({len})"),
            ColumnType::Date => f.write_str("date"),
        }
    }
}

impl FromStr for ColumnType {
    type Err = SchemaError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "text" => return Ok(ColumnType::Text),
            "date" => return Ok(ColumnType::Date),
            _ => {}
        }
        let len = normalized
            .strip_prefix("varchar(")
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(|digits| digits.trim().parse::<u32>().ok())
            .filter(|len| *len > 0)
            .ok_or_else(|| SchemaError::UnknownType(input.to_string()))?;
        Ok(ColumnType::Varchar(len))
    }
}

impl TryFrom<String> for ColumnType {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ColumnType> for String {
    fn from(value: ColumnType) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Header label in the source sheet when it differs from the column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, rename = "key")]
    pub is_key: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            source_label: None,
            column_type,
            nullable: true,
            is_key: false,
        }
    }

    pub fn key(name: &str, column_type: ColumnType) -> Self {
        Self {
            nullable: false,
            is_key: true,
            ..Self::new(name, column_type)
        }
    }

    pub fn with_source_label(mut self, label: &str) -> Self {
        self.source_label = Some(label.to_string());
        self
    }

    pub fn label(&self) -> &str {
        self.source_label.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown column type `{0}` (expected text, date or varchar(n))")]
    UnknownType(String),
    #[error("schema `{0}` declares no columns")]
    Empty(String),
    #[error("schema `{schema}` must declare exactly one key column, found {found}")]
    KeyCount { schema: String, found: usize },
    #[error("key column `{0}` must be a text column")]
    KeyNotText(String),
    #[error("column `{0}` is declared more than once")]
    DuplicateColumn(String),
    #[error("unknown built-in schema `{0}`")]
    UnknownPreset(String),
}

/// Declared target table layout: ordered columns with exactly one natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::Empty(self.name.clone()));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()));
            }
        }

        let keys: Vec<&ColumnDef> = self.columns.iter().filter(|c| c.is_key).collect();
        if keys.len() != 1 {
            return Err(SchemaError::KeyCount {
                schema: self.name.clone(),
                found: keys.len(),
            });
        }
        if keys[0].column_type.is_date() {
            return Err(SchemaError::KeyNotText(keys[0].name.clone()));
        }
        Ok(())
    }

    pub fn key_column(&self) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.is_key)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn preset(name: &str) -> Result<Self, SchemaError> {
        match name {
            "employee_records" => Ok(Self::employee_records()),
            "hr_merge" => Ok(Self::hr_merge()),
            other => Err(SchemaError::UnknownPreset(other.to_string())),
        }
    }

    /// HR ten-digit employee number sheet.
    pub fn employee_records() -> Self {
        use ColumnType::{Date, Varchar};
        Self {
            name: "employee_records".to_string(),
            columns: vec![
                ColumnDef::new("Div", Varchar(50)),
                ColumnDef::new("Formal_Name", Varchar(100)),
                ColumnDef::new("Department", Varchar(100)),
                ColumnDef::new("Cost_Centre", Varchar(50)),
                ColumnDef::new("Reporting_date", Date),
                ColumnDef::new("Resigned_date", Date),
                ColumnDef::key("10_Number", Varchar(10)),
                ColumnDef::new("Department_Code", Varchar(8)),
                ColumnDef::new("Cost_Centre_Code", Varchar(8)),
            ],
        }
    }

    /// HR merge sheet consumed by IT.
    pub fn hr_merge() -> Self {
        use ColumnType::{Date, Varchar};
        Self {
            name: "hr_merge".to_string(),
            columns: vec![
                ColumnDef::new("div", Varchar(13)),
                ColumnDef::new("last_name", Varchar(50)),
                ColumnDef::new("first_name", Varchar(50)),
                ColumnDef::new("middle_name", Varchar(13)),
                ColumnDef::new("formal_name", Varchar(255)),
                ColumnDef::new("department", Varchar(50)),
                ColumnDef::new("cost_centre", Varchar(50)),
                ColumnDef::new("reporting_date", Date),
                ColumnDef::new("resigned_date", Date),
                ColumnDef::key("10_number", Varchar(10)),
                ColumnDef::new("type", Varchar(21)),
                ColumnDef::new("department_code", Varchar(15)),
                ColumnDef::new("cost_centre_code", Varchar(16)),
                ColumnDef::new("transfer_record", Varchar(50)),
                ColumnDef::new("remark", Varchar(87)),
                ColumnDef::new("card_number", Varchar(59)),
                ColumnDef::new("adm_remark", Varchar(94)),
                ColumnDef::new("active", Varchar(6)),
            ],
        }
    }
}

/// A calendar date, or the explicit absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateValue {
    Date(NaiveDate),
    Absent,
}

impl DateValue {
    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            DateValue::Date(date) => Some(*date),
            DateValue::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, DateValue::Absent)
    }
}

/// Normalize a heterogeneous date cell. Unparseable input becomes [`DateValue::Absent`]
/// rather than a guessed date.
pub fn normalize_date(raw: Option<&str>) -> DateValue {
    let Some(raw) = raw.map(str::trim) else {
        return DateValue::Absent;
    };
    if raw.is_empty() || raw == "-" {
        return DateValue::Absent;
    }

    DATE_FORMATS
        .iter()
        .filter_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        // four-digit years only; chrono accepts "24" for %Y
        .find(|date| (1000..=9999).contains(&date.year()))
        .map(DateValue::Date)
        .unwrap_or(DateValue::Absent)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum CellValue {
    Text(String),
    NotAvailable,
    Date(DateValue),
}

impl CellValue {
    /// Text as persisted: the sentinel stands in for unavailable values.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(value) => Some(value),
            CellValue::NotAvailable => Some(NA_SENTINEL),
            CellValue::Date(_) => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            CellValue::Date(value) => value.as_date(),
            _ => None,
        }
    }

    pub fn display(&self) -> String {
        match self {
            CellValue::Text(value) => value.clone(),
            CellValue::NotAvailable => NA_SENTINEL.to_string(),
            CellValue::Date(DateValue::Date(date)) => date.format("%Y-%m-%d").to_string(),
            CellValue::Date(DateValue::Absent) => "null".to_string(),
        }
    }
}

/// Sheet header row after sanitizing: trimmed labels, `col_N` placeholders for blanks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    labels: Vec<String>,
    positions: HashMap<String, usize>,
    duplicates: Vec<String>,
    placeholders: usize,
}

impl Header {
    pub fn sanitize<S: AsRef<str>>(raw: &[S]) -> Self {
        let mut labels = Vec::with_capacity(raw.len());
        let mut positions = HashMap::new();
        let mut duplicates = Vec::new();
        let mut placeholders = 0usize;

        for (idx, label) in raw.iter().enumerate() {
            let trimmed = label.as_ref().trim();
            let label = if trimmed.is_empty() {
                placeholders += 1;
                format!("col_{}", idx + 1)
            } else {
                trimmed.to_string()
            };

            if positions.contains_key(&label) {
                if !duplicates.contains(&label) {
                    duplicates.push(label.clone());
                }
            } else {
                positions.insert(label.clone(), idx);
            }
            labels.push(label);
        }

        Self {
            labels,
            positions,
            duplicates,
            placeholders,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn width(&self) -> usize {
        self.labels.len()
    }

    /// First position carrying `label`.
    pub fn position(&self, label: &str) -> Option<usize> {
        self.positions.get(label.trim()).copied()
    }

    pub fn duplicates(&self) -> &[String] {
        &self.duplicates
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholders
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedRecord {
    pub row_number: usize,
    pub fields: Vec<(String, CellValue)>,
}

impl MappedRecord {
    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Natural key value, `None` when absent or still the sentinel.
    pub fn key<'a>(&'a self, schema: &TableSchema) -> Option<&'a str> {
        let key = schema.key_column()?;
        match self.get(&key.name)? {
            CellValue::Text(value) if !value.is_empty() && value != NA_SENTINEL => Some(value),
            _ => None,
        }
    }

    pub fn display_values(&self) -> Vec<String> {
        self.fields.iter().map(|(_, value)| value.display()).collect()
    }
}

#[derive(Debug, Clone)]
struct ColumnSlot {
    column: ColumnDef,
    position: Option<usize>,
}

/// Resolves schema columns against a header once, then maps rows positionally.
#[derive(Debug, Clone)]
pub struct RowMapper {
    slots: Vec<ColumnSlot>,
    width: usize,
}

impl RowMapper {
    pub fn new(header: &Header, schema: &TableSchema) -> Self {
        let slots = schema
            .columns
            .iter()
            .map(|column| ColumnSlot {
                position: header.position(column.label()),
                column: column.clone(),
            })
            .collect();
        Self {
            slots,
            width: header.width(),
        }
    }

    /// Schema columns whose label is not in the header.
    pub fn missing_columns(&self) -> Vec<&ColumnDef> {
        self.slots
            .iter()
            .filter(|slot| slot.position.is_none())
            .map(|slot| &slot.column)
            .collect()
    }

    pub fn map(&self, row_number: usize, raw: &[String]) -> MappedRecord {
        let fields = self
            .slots
            .iter()
            .map(|slot| {
                // short rows read as empty cells past their end
                let cell = slot
                    .position
                    .map(|idx| raw.get(idx).map(|c| c.trim()).unwrap_or(""));
                (slot.column.name.clone(), map_cell(&slot.column, cell))
            })
            .collect();
        MappedRecord { row_number, fields }
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

fn map_cell(column: &ColumnDef, cell: Option<&str>) -> CellValue {
    if column.column_type.is_date() {
        return CellValue::Date(normalize_date(cell));
    }
    match cell {
        Some(value) if !value.is_empty() => CellValue::Text(value.to_string()),
        _ => CellValue::NotAvailable,
    }
}

/// One-shot form of [`RowMapper::map`].
pub fn map_row(
    header: &Header,
    schema: &TableSchema,
    row_number: usize,
    raw: &[String],
) -> MappedRecord {
    RowMapper::new(header, schema).map(row_number, raw)
}

pub fn is_blank_row(raw: &[String]) -> bool {
    raw.iter().all(|cell| cell.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingKey,
    DuplicateKey { key: String },
    DataValidation { detail: String },
    Transient { detail: String },
    Unexpected { detail: String },
}

impl SkipReason {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            SkipReason::MissingKey => DiagnosticKind::MissingKey,
            SkipReason::DuplicateKey { .. } => DiagnosticKind::DuplicateKeyViolation,
            SkipReason::DataValidation { .. } => DiagnosticKind::DataValidationError,
            SkipReason::Transient { .. } => DiagnosticKind::TransientError,
            SkipReason::Unexpected { .. } => DiagnosticKind::UnexpectedRowError,
        }
    }

    pub fn message(&self) -> String {
        match self {
            SkipReason::MissingKey => "natural key is blank".to_string(),
            SkipReason::DuplicateKey { key } => format!("duplicate key {key}"),
            SkipReason::DataValidation { detail }
            | SkipReason::Transient { detail }
            | SkipReason::Unexpected { detail } => detail.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    Updated,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    RowMappingDefect,
    MissingKey,
    DuplicateKeyViolation,
    DataValidationError,
    TransientError,
    UnexpectedRowError,
    WindowFetchFailed,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDiagnostic {
    pub row_number: usize,
    pub kind: DiagnosticKind,
    pub reason: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingColumn {
    pub column: String,
    pub suggestion: Option<String>,
}

/// Per-run counters and diagnostics. Counters only ever grow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub target_table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub windows: usize,
    pub failed_windows: usize,
    pub attempted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_duplicate: usize,
    pub skipped_invalid: usize,
    pub skipped_error: usize,
    pub blank_rows: usize,
    pub padded_rows: usize,
    pub missing_columns: Vec<MissingColumn>,
    pub duplicate_labels: Vec<String>,
    pub diagnostics: Vec<RowDiagnostic>,
    /// Set when the store was lost mid-run and the remaining windows were not read.
    pub aborted: Option<String>,
}

impl RunResult {
    pub fn new(run_id: Uuid, target_table: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            target_table: target_table.to_string(),
            started_at,
            finished_at: None,
            windows: 0,
            failed_windows: 0,
            attempted: 0,
            inserted: 0,
            updated: 0,
            skipped_duplicate: 0,
            skipped_invalid: 0,
            skipped_error: 0,
            blank_rows: 0,
            padded_rows: 0,
            missing_columns: Vec::new(),
            duplicate_labels: Vec::new(),
            diagnostics: Vec::new(),
            aborted: None,
        }
    }

    pub fn record_outcome(&mut self, record: &MappedRecord, outcome: &WriteOutcome) {
        self.attempted += 1;
        match outcome {
            WriteOutcome::Inserted => self.inserted += 1,
            WriteOutcome::Updated => self.updated += 1,
            WriteOutcome::Skipped(reason) => {
                match reason {
                    SkipReason::DuplicateKey { .. } => self.skipped_duplicate += 1,
                    SkipReason::MissingKey | SkipReason::DataValidation { .. } => {
                        self.skipped_invalid += 1
                    }
                    SkipReason::Transient { .. } | SkipReason::Unexpected { .. } => {
                        self.skipped_error += 1
                    }
                }
                self.diagnostics.push(RowDiagnostic {
                    row_number: record.row_number,
                    kind: reason.kind(),
                    reason: reason.message(),
                    values: record.display_values(),
                });
            }
        }
    }

    pub fn record_padded_row(
        &mut self,
        row_number: usize,
        found: usize,
        expected: usize,
        raw: &[String],
    ) {
        self.padded_rows += 1;
        self.diagnostics.push(RowDiagnostic {
            row_number,
            kind: DiagnosticKind::RowMappingDefect,
            reason: format!("row has {found} cells, padded to {expected}"),
            values: raw.to_vec(),
        });
    }

    pub fn record_window_failure(&mut self, start: usize, end: usize, reason: String) {
        self.failed_windows += 1;
        self.diagnostics.push(RowDiagnostic {
            row_number: start,
            kind: DiagnosticKind::WindowFetchFailed,
            reason: format!("rows {start}-{end}: {reason}"),
            values: Vec::new(),
        });
    }

    pub fn finalize(&mut self, finished_at: DateTime<Utc>) {
        self.finished_at = Some(finished_at);
    }

    pub fn persisted(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn skipped(&self) -> usize {
        self.skipped_duplicate + self.skipped_invalid + self.skipped_error
    }

    /// Diagnostics for rows that were not persisted.
    pub fn skipped_rows(&self) -> impl Iterator<Item = &RowDiagnostic> {
        self.diagnostics.iter().filter(|d| {
            !matches!(
                d.kind,
                DiagnosticKind::RowMappingDefect | DiagnosticKind::WindowFetchFailed
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> DateValue {
        DateValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap())
    }

    fn strings(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn employee_header() -> Header {
        Header::sanitize(&[
            "Div",
            "Formal_Name",
            "Department",
            "Cost_Centre",
            "Reporting_date",
            "Resigned_date",
            "10_Number",
            "Department_Code",
            "Cost_Centre_Code",
        ])
    }

    #[test]
    fn every_candidate_format_parses() {
        let cases = [
            ("2024-03-15", ymd(2024, 3, 15)),
            ("03/15/2024", ymd(2024, 3, 15)),
            ("15-03-2024", ymd(2024, 3, 15)),
            ("2024/03/15", ymd(2024, 3, 15)),
            ("15/03/2024", ymd(2024, 3, 15)),
            ("03-15-2024", ymd(2024, 3, 15)),
            ("2024.03.15", ymd(2024, 3, 15)),
            ("15.03.2024", ymd(2024, 3, 15)),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize_date(Some(raw)), expected, "input {raw}");
        }
    }

    #[test]
    fn ambiguous_dates_follow_format_order() {
        // slash: month-first wins over day-first
        assert_eq!(normalize_date(Some("01/02/2024")), ymd(2024, 1, 2));
        // dash: day-first wins over month-first
        assert_eq!(normalize_date(Some("01-02-2024")), ymd(2024, 2, 1));
        // dot: only day-first exists
        assert_eq!(normalize_date(Some("01.02.2024")), ymd(2024, 2, 1));
        // impossible month pushes slash input to day-first
        assert_eq!(normalize_date(Some("13/01/2024")), ymd(2024, 1, 13));
        assert_eq!(normalize_date(Some("01-13-2024")), ymd(2024, 1, 13));
    }

    #[test]
    fn blank_dash_and_garbage_are_absent() {
        for raw in ["", "   ", "-", "NA", "tomorrow", "2024-02-30", "01/02/24", "2024/13/01"] {
            assert_eq!(normalize_date(Some(raw)), DateValue::Absent, "input {raw:?}");
        }
        assert_eq!(normalize_date(None), DateValue::Absent);
    }

    #[test]
    fn date_input_is_trimmed() {
        assert_eq!(normalize_date(Some(" 2024/03/01 ")), ymd(2024, 3, 1));
    }

    #[test]
    fn header_blank_labels_get_positional_placeholders() {
        let header = Header::sanitize(&[" Div ", "", "Department", "  ", "Div"]);
        assert_eq!(
            header.labels(),
            &strings(&["Div", "col_2", "Department", "col_4", "Div"])[..]
        );
        assert_eq!(header.placeholder_count(), 2);
        assert_eq!(header.duplicates(), &strings(&["Div"])[..]);
        assert_eq!(header.position("Div"), Some(0));
        assert_eq!(header.position("col_4"), Some(3));
    }

    #[test]
    fn scenario_row_maps_to_sentinels_and_dates() {
        let schema = TableSchema::employee_records();
        let row = strings(&["", "Jane Doe", "Eng", "", "2024/03/01", "-", "1234567890", "D1", ""]);
        let record = map_row(&employee_header(), &schema, 2, &row);

        assert_eq!(record.get("Div"), Some(&CellValue::NotAvailable));
        assert_eq!(record.get("Formal_Name"), Some(&CellValue::Text("Jane Doe".into())));
        assert_eq!(record.get("Cost_Centre"), Some(&CellValue::NotAvailable));
        assert_eq!(record.get("Reporting_date"), Some(&CellValue::Date(ymd(2024, 3, 1))));
        assert_eq!(record.get("Resigned_date"), Some(&CellValue::Date(DateValue::Absent)));
        assert_eq!(record.get("Cost_Centre_Code"), Some(&CellValue::NotAvailable));
        assert_eq!(record.key(&schema), Some("1234567890"));
    }

    #[test]
    fn column_missing_from_header_is_sentinel_regardless_of_cells() {
        let schema = TableSchema::employee_records();
        let header = Header::sanitize(&["Div", "Formal Name", "10_Number", "Reporting date"]);
        let mapper = RowMapper::new(&header, &schema);
        let record = mapper.map(5, &strings(&["A", "Jane", "0000000001", "2024-01-01"]));

        assert_eq!(record.get("Div"), Some(&CellValue::Text("A".into())));
        assert_eq!(record.get("Formal_Name"), Some(&CellValue::NotAvailable));
        assert_eq!(record.get("Reporting_date"), Some(&CellValue::Date(DateValue::Absent)));
        let missing: Vec<&str> = mapper.missing_columns().iter().map(|c| c.name.as_str()).collect();
        assert!(missing.contains(&"Formal_Name"));
        assert!(missing.contains(&"Reporting_date"));
        assert!(!missing.contains(&"Div"));
    }

    #[test]
    fn short_rows_read_as_empty_cells() {
        let schema = TableSchema::employee_records();
        let record = map_row(&employee_header(), &schema, 9, &strings(&["Ops", "Sam"]));
        assert_eq!(record.fields.len(), schema.columns.len());
        assert_eq!(record.get("Div"), Some(&CellValue::Text("Ops".into())));
        assert_eq!(record.get("10_Number"), Some(&CellValue::NotAvailable));
        assert_eq!(record.key(&schema), None);
    }

    #[test]
    fn source_label_overrides_column_name_lookup() {
        let schema = TableSchema {
            name: "t".into(),
            columns: vec![
                ColumnDef::key("emp_no", ColumnType::Varchar(10)).with_source_label("10 Number"),
                ColumnDef::new("name", ColumnType::Text),
            ],
        };
        let header = Header::sanitize(&["10 Number", "name"]);
        let record = map_row(&header, &schema, 2, &strings(&[" 42 ", " Ann "]));
        assert_eq!(record.key(&schema), Some("42"));
        assert_eq!(record.get("name"), Some(&CellValue::Text("Ann".into())));
    }

    #[test]
    fn schema_validation_requires_exactly_one_text_key() {
        assert!(TableSchema::employee_records().validate().is_ok());
        assert!(TableSchema::hr_merge().validate().is_ok());

        let mut no_key = TableSchema::employee_records();
        no_key.columns.iter_mut().for_each(|c| c.is_key = false);
        assert!(matches!(no_key.validate(), Err(SchemaError::KeyCount { found: 0, .. })));

        let date_key = TableSchema {
            name: "t".into(),
            columns: vec![ColumnDef::key("d", ColumnType::Date)],
        };
        assert!(matches!(date_key.validate(), Err(SchemaError::KeyNotText(_))));

        let dup = TableSchema {
            name: "t".into(),
            columns: vec![
                ColumnDef::key("a", ColumnType::Text),
                ColumnDef::new("a", ColumnType::Text),
            ],
        };
        assert!(matches!(dup.validate(), Err(SchemaError::DuplicateColumn(_))));
    }

    #[test]
    fn schema_yaml_uses_sql_like_type_names() {
        let yaml = r#"
name: badges
columns:
  - { name: badge_id, type: "varchar(12)", key: true, nullable: false }
  - { name: issued_on, type: date }
  - { name: holder, type: text, source_label: "Holder Name" }
"#;
        let schema: TableSchema = serde_yaml::from_str(yaml).unwrap();
        schema.validate().unwrap();
        assert_eq!(schema.columns[0].column_type, ColumnType::Varchar(12));
        assert_eq!(schema.columns[1].column_type.sql_type(), "DATE");
        assert!(schema.columns[1].nullable);
        assert_eq!(schema.columns[2].label(), "Holder Name");
        assert!("varchar(0)".parse::<ColumnType>().is_err());
        assert!("integer".parse::<ColumnType>().is_err());
    }

    #[test]
    fn run_result_counts_outcomes_by_bucket() {
        let schema = TableSchema::employee_records();
        let record = map_row(&employee_header(), &schema, 3, &strings(&["D"]));
        let mut result = RunResult::new(Uuid::new_v4(), "t", Utc::now());

        result.record_outcome(&record, &WriteOutcome::Inserted);
        result.record_outcome(&record, &WriteOutcome::Updated);
        result.record_outcome(&record, &WriteOutcome::Skipped(SkipReason::MissingKey));
        result.record_outcome(
            &record,
            &WriteOutcome::Skipped(SkipReason::DuplicateKey { key: "1".into() }),
        );
        result.record_outcome(
            &record,
            &WriteOutcome::Skipped(SkipReason::Transient { detail: "timeout".into() }),
        );
        result.record_padded_row(4, 2, 9, &strings(&["a", "b"]));

        assert_eq!(result.attempted, 5);
        assert_eq!(result.persisted(), 2);
        assert_eq!(result.skipped_invalid, 1);
        assert_eq!(result.skipped_duplicate, 1);
        assert_eq!(result.skipped_error, 1);
        assert_eq!(result.skipped(), 3);
        assert_eq!(result.padded_rows, 1);
        assert_eq!(result.skipped_rows().count(), 3);
        assert_eq!(result.diagnostics[0].row_number, 3);
        assert_eq!(result.diagnostics[0].kind, DiagnosticKind::MissingKey);
    }
}
