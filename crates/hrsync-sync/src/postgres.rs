//! Postgres-backed [`RecordStore`].

use std::time::Duration;

use async_trait::async_trait;
use hrsync_core::{CellValue, ColumnDef, MappedRecord, TableSchema};
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info, warn};

use crate::writer::{RecordStore, StoreError, StoreFailure, StoreWrite};
use crate::{TableMode, WriteMode};

pub struct PgRecordStore {
    pool: PgPool,
    table: String,
    schema: TableSchema,
    upsert_sql: String,
    insert_sql: String,
}

impl PgRecordStore {
    /// Single-connection pool: records are written strictly one at a time.
    pub async fn connect(
        database_url: &str,
        table: &str,
        schema: TableSchema,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        info!(table, "connected to postgres");
        Ok(Self::with_pool(pool, table, schema))
    }

    pub fn with_pool(pool: PgPool, table: &str, schema: TableSchema) -> Self {
        Self {
            upsert_sql: upsert_sql(table, &schema),
            insert_sql: insert_sql(table, &schema),
            pool,
            table: table.to_string(),
            schema,
        }
    }

    async fn existing_columns(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        table: &str,
    ) -> Result<Vec<ExistingColumn>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name,
                   data_type::text AS data_type,
                   character_maximum_length::int4 AS max_len,
                   is_nullable::text = 'YES' AS nullable,
                   column_default IS NOT NULL AS has_default
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&mut **tx)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ExistingColumn {
                    name: row.try_get("column_name")?,
                    data_type: row.try_get("data_type")?,
                    max_len: row.try_get("max_len")?,
                    nullable: row.try_get("nullable")?,
                    has_default: row.try_get("has_default")?,
                })
            })
            .collect()
    }

    async fn prepare_in_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        mode: TableMode,
    ) -> Result<(), StoreError> {
        let prepare_err = |err: sqlx::Error| StoreError::Prepare {
            table: self.table.clone(),
            reason: err.to_string(),
        };

        if mode == TableMode::DropAndRecreate {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", pg_quote_ident(&self.table)))
                .execute(&mut **tx)
                .await
                .map_err(prepare_err)?;
            info!(table = %self.table, "dropped target table");
        }

        let existing = Self::existing_columns(tx, &self.table)
            .await
            .map_err(prepare_err)?;
        if existing.is_empty() {
            sqlx::query(&create_table_sql(&self.table, &self.schema))
                .execute(&mut **tx)
                .await
                .map_err(prepare_err)?;
            info!(table = %self.table, columns = self.schema.columns.len(), "created target table");
        } else {
            check_undeclared(&self.schema, &existing)?;
            for column in &self.schema.columns {
                match existing.iter().find(|e| e.name == column.name) {
                    None => {
                        sqlx::query(&add_column_sql(&self.table, column))
                            .execute(&mut **tx)
                            .await
                            .map_err(prepare_err)?;
                        info!(table = %self.table, column = %column.name, "added missing column");
                    }
                    Some(found) => check_column(column, found)?,
                }
            }
        }

        if let Some(key) = self.schema.key_column() {
            sqlx::query(&unique_index_sql(&self.table, &key.name))
                .execute(&mut **tx)
                .await
                .map_err(prepare_err)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExistingColumn {
    name: String,
    data_type: String,
    max_len: Option<i32>,
    nullable: bool,
    has_default: bool,
}

/// Extra columns are tolerated unless every insert would violate them.
fn check_undeclared(schema: &TableSchema, existing: &[ExistingColumn]) -> Result<(), StoreError> {
    match existing
        .iter()
        .filter(|found| !found.nullable && !found.has_default)
        .find(|found| schema.column(&found.name).is_none())
    {
        Some(found) => Err(StoreError::UndeclaredRequiredColumn {
            column: found.name.clone(),
        }),
        None => Ok(()),
    }
}

fn check_column(declared: &ColumnDef, found: &ExistingColumn) -> Result<(), StoreError> {
    let expected = declared.column_type.information_schema_type();
    if found.data_type != expected {
        return Err(StoreError::SchemaMismatch {
            column: declared.name.clone(),
            declared: declared.column_type.to_string(),
            found: found.data_type.clone(),
        });
    }
    let declared_len = declared.column_type.max_len();
    let found_len = found.max_len.and_then(|len| usize::try_from(len).ok());
    if declared_len != found_len {
        warn!(
            column = %declared.name,
            ?declared_len,
            ?found_len,
            "column width differs from declaration; over-length rows will be skipped"
        );
    }
    Ok(())
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn describe(&self) -> String {
        format!("postgres:{}", self.table)
    }

    async fn prepare_table(&mut self, mode: TableMode) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if let Err(err) = self.prepare_in_tx(&mut tx, mode).await {
            if let Err(rollback) = tx.rollback().await {
                debug!(error = %rollback, "rollback after failed prepare");
            }
            return Err(err);
        }
        tx.commit().await.map_err(|err| StoreError::Prepare {
            table: self.table.clone(),
            reason: err.to_string(),
        })
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
        let sql = match mode {
            WriteMode::Upsert => &self.upsert_sql,
            WriteMode::InsertOnly => &self.insert_sql,
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| classify_sqlx_error(&err, &key))?;
        let result = bind_record(sqlx::query(sql), &self.schema, record)
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get::<bool, _>("inserted"));

        match result {
            Ok(inserted) => {
                tx.commit()
                    .await
                    .map_err(|err| classify_sqlx_error(&err, &key))?;
                Ok(if inserted {
                    StoreWrite::Inserted
                } else {
                    StoreWrite::Updated
                })
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    debug!(error = %rollback, row = record.row_number, "rollback failed");
                }
                Err(classify_sqlx_error(&err, &key))
            }
        }
    }

    async fn row_count(&mut self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}",
            pg_quote_ident(&self.table)
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn close(&mut self) {
        self.pool.close().await;
    }
}

fn bind_record<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    schema: &TableSchema,
    record: &MappedRecord,
) -> Query<'q, Postgres, PgArguments> {
    for column in &schema.columns {
        let value = record.get(&column.name);
        query = if column.column_type.is_date() {
            query.bind(value.and_then(CellValue::as_date))
        } else {
            query.bind(value.and_then(CellValue::as_text).map(str::to_string))
        };
    }
    query
}

pub fn pg_quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list(schema: &TableSchema) -> String {
    schema
        .columns
        .iter()
        .map(|c| pg_quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(count: usize) -> String {
    (1..=count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_sql(column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", pg_quote_ident(&column.name), column.column_type.sql_type());
    if column.is_key {
        sql.push_str(" PRIMARY KEY");
    } else if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    sql
}

pub fn create_table_sql(table: &str, schema: &TableSchema) -> String {
    let columns = schema
        .columns
        .iter()
        .map(column_sql)
        .collect::<Vec<_>>()
        .join(",\n    ");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        pg_quote_ident(table),
        columns
    )
}

pub fn add_column_sql(table: &str, column: &ColumnDef) -> String {
    // added columns stay nullable; existing rows have no value for them
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        pg_quote_ident(table),
        pg_quote_ident(&column.name),
        column.column_type.sql_type()
    )
}

pub fn unique_index_sql(table: &str, key: &str) -> String {
    format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
        pg_quote_ident(&format!("{table}_{key}_uidx")),
        pg_quote_ident(table),
        pg_quote_ident(key)
    )
}

/// Insert or overwrite every column, reporting which happened via `inserted`.
pub fn upsert_sql(table: &str, schema: &TableSchema) -> String {
    let key = schema
        .key_column()
        .map(|c| c.name.as_str())
        .unwrap_or_default();
    let mut updates: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| !c.is_key)
        .map(|c| {
            let ident = pg_quote_ident(&c.name);
            format!("{ident} = EXCLUDED.{ident}")
        })
        .collect();
    if updates.is_empty() {
        let ident = pg_quote_ident(key);
        updates.push(format!("{ident} = EXCLUDED.{ident}"));
    }
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
        pg_quote_ident(table),
        column_list(schema),
        placeholders(schema.columns.len()),
        pg_quote_ident(key),
        updates.join(", ")
    )
}

pub fn insert_sql(table: &str, schema: &TableSchema) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING true AS inserted",
        pg_quote_ident(table),
        column_list(schema),
        placeholders(schema.columns.len())
    )
}

/// Map a SQLSTATE to the per-record failure it represents.
pub fn classify_sqlstate(code: &str, key: &str, message: &str) -> StoreFailure {
    match code {
        "23505" => StoreFailure::DuplicateKey {
            key: key.to_string(),
        },
        "23502" => StoreFailure::DataValidation(message.to_string()),
        c if c.starts_with("22") => StoreFailure::DataValidation(message.to_string()),
        c if c.starts_with("08") || c == "40001" || c == "40P01" => {
            StoreFailure::Transient(message.to_string())
        }
        "57P01" | "57P02" | "57P03" => StoreFailure::Closed(message.to_string()),
        _ => StoreFailure::Unexpected(format!("{code}: {message}")),
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error, key: &str) -> StoreFailure {
    match err {
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) => classify_sqlstate(&code, key, db_err.message()),
            None => StoreFailure::Unexpected(db_err.message().to_string()),
        },
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_) => StoreFailure::Transient(err.to_string()),
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            StoreFailure::Closed(err.to_string())
        }
        other => StoreFailure::Unexpected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrsync_core::{ColumnType, Header, RowMapper};

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(pg_quote_ident("10_Number"), "\"10_Number\"");
        assert_eq!(pg_quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn create_table_declares_key_and_widths() {
        let sql = create_table_sql("employee_records", &TableSchema::employee_records());
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"employee_records\""));
        assert!(sql.contains("\"10_Number\" VARCHAR(10) PRIMARY KEY"));
        assert!(sql.contains("\"Reporting_date\" DATE"));
        assert!(sql.contains("\"Department_Code\" VARCHAR(8)"));
    }

    #[test]
    fn upsert_overwrites_every_non_key_column() {
        let sql = upsert_sql("employee_records", &TableSchema::employee_records());
        assert!(sql.contains("VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"));
        assert!(sql.contains("ON CONFLICT (\"10_Number\") DO UPDATE SET"));
        assert!(sql.contains("\"Div\" = EXCLUDED.\"Div\""));
        assert!(!sql.contains("\"10_Number\" = EXCLUDED"));
        assert!(sql.ends_with("RETURNING (xmax = 0) AS inserted"));
    }

    #[test]
    fn key_only_schema_still_has_an_update_clause() {
        let schema = TableSchema {
            name: "keys".into(),
            columns: vec![ColumnDef::key("id", ColumnType::Text)],
        };
        let sql = upsert_sql("keys", &schema);
        assert!(sql.contains("DO UPDATE SET \"id\" = EXCLUDED.\"id\""));
    }

    #[test]
    fn insert_only_has_no_conflict_clause() {
        let sql = insert_sql("t", &TableSchema::employee_records());
        assert!(!sql.contains("ON CONFLICT"));
        assert!(sql.contains("RETURNING true AS inserted"));
    }

    #[test]
    fn sqlstates_map_to_failure_kinds() {
        assert_eq!(
            classify_sqlstate("23505", "k1", "dup"),
            StoreFailure::DuplicateKey { key: "k1".into() }
        );
        assert!(matches!(
            classify_sqlstate("22001", "k", "value too long"),
            StoreFailure::DataValidation(_)
        ));
        assert!(matches!(
            classify_sqlstate("22007", "k", "bad date"),
            StoreFailure::DataValidation(_)
        ));
        assert!(matches!(
            classify_sqlstate("23502", "k", "null"),
            StoreFailure::DataValidation(_)
        ));
        assert!(matches!(
            classify_sqlstate("08006", "k", "connection failure"),
            StoreFailure::Transient(_)
        ));
        assert!(matches!(
            classify_sqlstate("42P01", "k", "no relation"),
            StoreFailure::Unexpected(_)
        ));
        assert!(matches!(
            classify_sqlx_error(&sqlx::Error::PoolClosed, "k"),
            StoreFailure::Closed(_)
        ));
        assert!(matches!(
            classify_sqlx_error(&sqlx::Error::PoolTimedOut, "k"),
            StoreFailure::Transient(_)
        ));
    }

    #[test]
    fn type_mismatch_is_fatal_but_width_drift_is_not() {
        let column = ColumnDef::new("Div", ColumnType::Varchar(50));
        let wrong_type = ExistingColumn {
            name: "Div".into(),
            data_type: "integer".into(),
            max_len: None,
            nullable: true,
            has_default: false,
        };
        assert!(matches!(
            check_column(&column, &wrong_type),
            Err(StoreError::SchemaMismatch { .. })
        ));
        let wider = ExistingColumn {
            name: "Div".into(),
            data_type: "character varying".into(),
            max_len: Some(80),
            nullable: true,
            has_default: false,
        };
        assert!(check_column(&column, &wider).is_ok());
    }

    fn existing(name: &str, nullable: bool, has_default: bool) -> ExistingColumn {
        ExistingColumn {
            name: name.into(),
            data_type: "character varying".into(),
            max_len: Some(10),
            nullable,
            has_default,
        }
    }

    #[test]
    fn undeclared_not_null_column_blocks_the_run() {
        let schema = TableSchema::employee_records();
        // table created by the hr_merge layout: lowercase key column
        let foreign = vec![existing("Div", true, false), existing("10_number", false, false)];
        assert!(matches!(
            check_undeclared(&schema, &foreign),
            Err(StoreError::UndeclaredRequiredColumn { column }) if column == "10_number"
        ));

        let tolerated = vec![
            existing("10_Number", false, false),
            existing("notes", true, false),
            existing("id", false, true),
        ];
        assert!(check_undeclared(&schema, &tolerated).is_ok());
    }

    /// Runs against a live database when `HRSYNC_TEST_DATABASE_URL` is set.
    #[tokio::test]
    async fn live_upsert_round_trip() {
        let Ok(url) = std::env::var("HRSYNC_TEST_DATABASE_URL") else {
            return;
        };
        let schema = TableSchema::employee_records();
        let table = format!("hrsync_test_{}", uuid::Uuid::new_v4().simple());
        let mut store = PgRecordStore::connect(&url, &table, schema.clone())
            .await
            .unwrap();
        store.prepare_table(TableMode::DropAndRecreate).await.unwrap();

        let header = Header::sanitize(&[
            "Div",
            "Formal_Name",
            "Department",
            "Cost_Centre",
            "Reporting_date",
            "Resigned_date",
            "10_Number",
        ]);
        let mapper = RowMapper::new(&header, &schema);
        let raw = |cells: &[&str]| cells.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        let first = mapper.map(2, &raw(&["D", "Ann", "Eng", "C", "05/01/2024", "-", "0000000001"]));
        let again = mapper.map(3, &raw(&["D2", "Ann", "", "", "", "", "0000000001"]));

        assert_eq!(
            store.write_record(&first, WriteMode::Upsert).await.unwrap(),
            StoreWrite::Inserted
        );
        assert_eq!(
            store.write_record(&again, WriteMode::Upsert).await.unwrap(),
            StoreWrite::Updated
        );
        assert!(matches!(
            store.write_record(&again, WriteMode::InsertOnly).await,
            Err(StoreFailure::DuplicateKey { .. })
        ));
        assert_eq!(store.row_count().await.unwrap(), 1);

        // re-preparing an existing table is a no-op
        store.prepare_table(TableMode::CreateIfAbsent).await.unwrap();
        sqlx::query(&format!("DROP TABLE {}", pg_quote_ident(&table)))
            .execute(&store.pool)
            .await
            .unwrap();
        store.close().await;
    }
}
