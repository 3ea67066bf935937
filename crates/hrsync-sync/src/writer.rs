//! Upsert writer and the record store contract it writes through.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hrsync_core::{CellValue, MappedRecord, SkipReason, TableSchema, WriteOutcome};
use thiserror::Error;
use tracing::debug;

use crate::{TableMode, WriteMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWrite {
    Inserted,
    Updated,
}

/// Why a single record write was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreFailure {
    #[error("duplicate key {key}")]
    DuplicateKey { key: String },
    #[error("data rejected by store: {0}")]
    DataValidation(String),
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("unexpected store error: {0}")]
    Unexpected(String),
    #[error("store closed: {0}")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("column `{column}` is {found} in the table but declared {declared}")]
    SchemaMismatch {
        column: String,
        declared: String,
        found: String,
    },
    #[error("column `{column}` is NOT NULL without a default but not declared in the schema")]
    UndeclaredRequiredColumn { column: String },
    #[error("preparing table {table}: {reason}")]
    Prepare { table: String, reason: String },
}

/// Relational target bound to one table and its declared schema.
#[async_trait]
pub trait RecordStore: Send {
    fn describe(&self) -> String;

    /// Make the table match the schema. Idempotent for [`TableMode::CreateIfAbsent`].
    async fn prepare_table(&mut self, mode: TableMode) -> Result<(), StoreError>;

    /// Write one record in its own transaction; on failure nothing of it is committed.
    async fn write_record(
        &mut self,
        record: &MappedRecord,
        mode: WriteMode,
    ) -> Result<StoreWrite, StoreFailure>;

    async fn row_count(&mut self) -> Result<u64, StoreError>;

    async fn close(&mut self);
}

/// Guards the key and column constraints, then persists through a [`RecordStore`].
pub struct UpsertWriter {
    store: Box<dyn RecordStore>,
    schema: TableSchema,
    mode: WriteMode,
}

impl UpsertWriter {
    pub fn new(store: Box<dyn RecordStore>, schema: TableSchema, mode: WriteMode) -> Self {
        Self {
            store,
            schema,
            mode,
        }
    }

    pub fn store_mut(&mut self) -> &mut dyn RecordStore {
        self.store.as_mut()
    }

    /// Reasons a record must not reach the store at all.
    pub fn precheck(&self, record: &MappedRecord) -> Option<SkipReason> {
        if record.key(&self.schema).is_none() {
            return Some(SkipReason::MissingKey);
        }
        validate_record(&self.schema, record)
            .err()
            .map(|detail| SkipReason::DataValidation { detail })
    }

    /// `Err` only when the store is gone; every per-row failure is a skip.
    pub async fn upsert(&mut self, record: &MappedRecord) -> Result<WriteOutcome, StoreError> {
        if let Some(reason) = self.precheck(record) {
            return Ok(WriteOutcome::Skipped(reason));
        }

        let outcome = match self.store.write_record(record, self.mode).await {
            Ok(StoreWrite::Inserted) => WriteOutcome::Inserted,
            Ok(StoreWrite::Updated) => WriteOutcome::Updated,
            Err(StoreFailure::Closed(reason)) => return Err(StoreError::Unavailable(reason)),
            Err(failure) => WriteOutcome::Skipped(skip_reason(failure)),
        };
        debug!(row = record.row_number, ?outcome, "record written");
        Ok(outcome)
    }
}

fn skip_reason(failure: StoreFailure) -> SkipReason {
    match failure {
        StoreFailure::DuplicateKey { key } => SkipReason::DuplicateKey { key },
        StoreFailure::DataValidation(detail) => SkipReason::DataValidation { detail },
        StoreFailure::Transient(detail) => SkipReason::Transient { detail },
        StoreFailure::Unexpected(detail) | StoreFailure::Closed(detail) => {
            SkipReason::Unexpected { detail }
        }
    }
}

/// Declared widths (in characters) and date nullability.
pub fn validate_record(schema: &TableSchema, record: &MappedRecord) -> Result<(), String> {
    let mut problems = Vec::new();
    for column in &schema.columns {
        let Some(value) = record.get(&column.name) else {
            problems.push(format!("`{}` missing from record", column.name));
            continue;
        };
        if let (Some(limit), Some(text)) = (column.column_type.max_len(), value.as_text()) {
            let len = text.chars().count();
            if len > limit {
                problems.push(format!(
                    "`{}` is {len} characters, limit {limit}",
                    column.name
                ));
            }
        }
        if !column.nullable && matches!(value, CellValue::Date(d) if d.is_absent()) {
            problems.push(format!("`{}` requires a date", column.name));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

type StoredRow = Vec<(String, CellValue)>;

#[derive(Debug, Default)]
struct MemoryTable {
    exists: bool,
    rows: BTreeMap<String, StoredRow>,
    failures: HashMap<String, StoreFailure>,
    writes: usize,
}

/// In-process table with the same conflict semantics as the Postgres store.
/// Clones share one table.
#[derive(Debug, Clone)]
pub struct MemoryRecordStore {
    schema: TableSchema,
    table: Arc<Mutex<MemoryTable>>,
}

impl MemoryRecordStore {
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            table: Arc::default(),
        }
    }

    /// Fail every write of `key` with `failure`.
    pub fn fail_on_key(self, key: &str, failure: StoreFailure) -> Self {
        self.lock().failures.insert(key.to_string(), failure);
        self
    }

    pub fn get(&self, key: &str) -> Option<StoredRow> {
        self.lock().rows.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().rows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write attempts that reached the table.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryTable> {
        // a poisoned table only means a test thread panicked mid-write
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn describe(&self) -> String {
        format!("memory:{}", self.schema.name)
    }

    async fn prepare_table(&mut self, mode: TableMode) -> Result<(), StoreError> {
        let mut table = self.lock();
        if mode == TableMode::DropAndRecreate {
            table.rows.clear();
        }
        table.exists = true;
        Ok(())
    }

    async fn write_record(
        &mut self,
        record: &MappedRecord,
        mode: WriteMode,
    ) -> Result<StoreWrite, StoreFailure> {
        let key = record
            .key(&self.schema)
            .ok_or_else(|| StoreFailure::DataValidation("key column is null".to_string()))?
            .to_string();
        validate_record(&self.schema, record).map_err(StoreFailure::DataValidation)?;

        let mut table = self.lock();
        if !table.exists {
            return Err(StoreFailure::Unexpected(format!(
                "relation {} does not exist",
                self.schema.name
            )));
        }
        table.writes += 1;
        if let Some(failure) = table.failures.get(&key) {
            return Err(failure.clone());
        }

        let exists = table.rows.contains_key(&key);
        match (exists, mode) {
            (true, WriteMode::InsertOnly) => Err(StoreFailure::DuplicateKey { key }),
            (true, WriteMode::Upsert) => {
                table.rows.insert(key, record.fields.clone());
                Ok(StoreWrite::Updated)
            }
            (false, _) => {
                table.rows.insert(key, record.fields.clone());
                Ok(StoreWrite::Inserted)
            }
        }
    }

    async fn row_count(&mut self) -> Result<u64, StoreError> {
        Ok(self.lock().rows.len() as u64)
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrsync_core::{map_row, DateValue, Header};

    fn record(row_number: usize, cells: &[&str]) -> MappedRecord {
        let header = Header::sanitize(&[
            "Div",
            "Formal_Name",
            "Department",
            "Cost_Centre",
            "Reporting_date",
            "Resigned_date",
            "10_Number",
            "Department_Code",
            "Cost_Centre_Code",
        ]);
        let raw: Vec<String> = cells.iter().map(|c| c.to_string()).collect();
        map_row(&header, &TableSchema::employee_records(), row_number, &raw)
    }

    async fn prepared_writer(mode: WriteMode) -> (UpsertWriter, MemoryRecordStore) {
        let schema = TableSchema::employee_records();
        let store = MemoryRecordStore::new(schema.clone());
        let mut writer = UpsertWriter::new(Box::new(store.clone()), schema, mode);
        writer
            .store_mut()
            .prepare_table(TableMode::CreateIfAbsent)
            .await
            .unwrap();
        (writer, store)
    }

    #[tokio::test]
    async fn missing_key_skips_without_touching_the_store() {
        let (mut writer, store) = prepared_writer(WriteMode::Upsert).await;
        let outcome = writer.upsert(&record(2, &["D", "Ann"])).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped(SkipReason::MissingKey));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn second_write_of_a_key_overwrites_every_field() {
        let (mut writer, store) = prepared_writer(WriteMode::Upsert).await;
        let first = record(2, &["D1", "Ann", "Eng", "C1", "2024-01-05", "", "0000000001"]);
        let second = record(900, &["D2", "Ann B", "Ops", "", "", "2024-06-30", "0000000001"]);

        assert_eq!(writer.upsert(&first).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(writer.upsert(&second).await.unwrap(), WriteOutcome::Updated);
        assert_eq!(store.len(), 1);

        let stored = store.get("0000000001").unwrap();
        let lookup = |name: &str| stored.iter().find(|(n, _)| n == name).unwrap().1.clone();
        assert_eq!(lookup("Div"), CellValue::Text("D2".into()));
        assert_eq!(lookup("Cost_Centre"), CellValue::NotAvailable);
        assert_eq!(lookup("Reporting_date"), CellValue::Date(DateValue::Absent));
    }

    #[tokio::test]
    async fn over_length_value_is_a_validation_skip() {
        let (mut writer, store) = prepared_writer(WriteMode::Upsert).await;
        let long_code = "D".repeat(9);
        let outcome = writer
            .upsert(&record(4, &["D", "Ann", "Eng", "C", "", "", "0000000002", &long_code]))
            .await
            .unwrap();
        match outcome {
            WriteOutcome::Skipped(SkipReason::DataValidation { detail }) => {
                assert!(detail.contains("Department_Code"), "{detail}");
                assert!(detail.contains("limit 8"), "{detail}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(store.is_empty());
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn insert_only_mode_reports_duplicates() {
        let (mut writer, store) = prepared_writer(WriteMode::InsertOnly).await;
        let row = record(2, &["D", "Ann", "", "", "", "", "0000000003"]);
        assert_eq!(writer.upsert(&row).await.unwrap(), WriteOutcome::Inserted);
        assert_eq!(
            writer.upsert(&row).await.unwrap(),
            WriteOutcome::Skipped(SkipReason::DuplicateKey {
                key: "0000000003".into()
            })
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn store_failures_become_skips_and_closed_store_is_an_error() {
        let schema = TableSchema::employee_records();
        let store = MemoryRecordStore::new(schema.clone())
            .fail_on_key("0000000004", StoreFailure::Transient("timeout".into()))
            .fail_on_key("0000000005", StoreFailure::Closed("pool closed".into()));
        let mut writer = UpsertWriter::new(Box::new(store.clone()), schema, WriteMode::Upsert);
        writer
            .store_mut()
            .prepare_table(TableMode::CreateIfAbsent)
            .await
            .unwrap();

        let transient = writer
            .upsert(&record(2, &["D", "A", "", "", "", "", "0000000004"]))
            .await
            .unwrap();
        assert!(matches!(
            transient,
            WriteOutcome::Skipped(SkipReason::Transient { .. })
        ));
        let closed = writer
            .upsert(&record(3, &["D", "B", "", "", "", "", "0000000005"]))
            .await;
        assert!(matches!(closed, Err(StoreError::Unavailable(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn non_nullable_date_must_be_present() {
        let mut schema = TableSchema::employee_records();
        for column in schema.columns.iter_mut() {
            if column.name == "Reporting_date" {
                column.nullable = false;
            }
        }
        let rec = record(2, &["D", "A", "", "", "-", "", "0000000006"]);
        let err = validate_record(&schema, &rec).unwrap_err();
        assert!(err.contains("Reporting_date"));
    }
}
