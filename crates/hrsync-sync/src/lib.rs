//! Run orchestration: configuration, windowed reads, per-record writes and run reports.

mod batch;
mod postgres;
mod writer;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use hrsync_adapters::{
    GoogleSheetsConfig, GoogleSheetsSource, GridSheetSource, SheetSource, SourceError, Worksheet,
    GOOGLE_SHEETS_BASE_URL,
};
use hrsync_core::{
    is_blank_row, Header, MissingColumn, RowMapper, RunResult, SchemaError, TableSchema,
    WriteOutcome,
};
use hrsync_storage::{ArtifactStore, HttpClientConfig};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub use batch::{
    pad_grid, plan_windows, BatchReader, FetchedWindow, RowWindow, SourceRow,
    DEFAULT_WINDOW_SIZE, FIRST_DATA_ROW,
};
pub use postgres::{
    classify_sqlstate, classify_sqlx_error, create_table_sql, insert_sql, pg_quote_ident,
    upsert_sql, PgRecordStore,
};
pub use writer::{
    validate_record, MemoryRecordStore, RecordStore, StoreError, StoreFailure, StoreWrite,
    UpsertWriter,
};

pub const CRATE_NAME: &str = "hrsync-sync";

pub const DEFAULT_SHEET_PAGE: &str = "Merge";

/// Table written when none is configured: `<schema name>_for_it_use`.
pub fn default_target_table(schema: &TableSchema) -> String {
    format!("{}_for_it_use", schema.name)
}

/// Minimum Jaro-Winkler score for a header label to be offered as a rename suggestion.
pub const LABEL_SUGGESTION_THRESHOLD: f64 = 0.85;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TableMode {
    #[default]
    CreateIfAbsent,
    DropAndRecreate,
}

impl FromStr for TableMode {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "create-if-absent" => Ok(Self::CreateIfAbsent),
            "drop-and-recreate" => Ok(Self::DropAndRecreate),
            other => Err(ConfigError::Invalid {
                name: "table mode",
                value: other.to_string(),
                reason: "expected create-if-absent or drop-and-recreate".to_string(),
            }),
        }
    }
}

impl fmt::Display for TableMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::CreateIfAbsent => "create-if-absent",
            Self::DropAndRecreate => "drop-and-recreate",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WriteMode {
    #[default]
    Upsert,
    /// Plain insert; an existing key is reported as a duplicate.
    InsertOnly,
}

impl FromStr for WriteMode {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(Self::Upsert),
            "insert-only" => Ok(Self::InsertOnly),
            other => Err(ConfigError::Invalid {
                name: "write mode",
                value: other.to_string(),
                reason: "expected upsert or insert-only".to_string(),
            }),
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upsert => "upsert",
            Self::InsertOnly => "insert-only",
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid {name} `{value}`: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading schema file {path}: {reason}")]
    SchemaFile { path: PathBuf, reason: String },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_identifier: String,
    pub source_page: String,
    pub target_table: String,
    pub schema: TableSchema,
    pub batch_window_size: usize,
    pub table_mode: TableMode,
    pub write_mode: WriteMode,
    pub database_url: Option<String>,
    pub sheets_access_token: Option<String>,
    pub sheets_api_key: Option<String>,
    pub sheets_base_url: String,
    pub http_timeout_secs: u64,
    pub reports_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn new(source_identifier: &str, target_table: &str, schema: TableSchema) -> Self {
        Self {
            source_identifier: source_identifier.to_string(),
            source_page: DEFAULT_SHEET_PAGE.to_string(),
            target_table: target_table.to_string(),
            schema,
            batch_window_size: DEFAULT_WINDOW_SIZE,
            table_mode: TableMode::default(),
            write_mode: WriteMode::default(),
            database_url: None,
            sheets_access_token: None,
            sheets_api_key: None,
            sheets_base_url: GOOGLE_SHEETS_BASE_URL.to_string(),
            http_timeout_secs: 30,
            reports_dir: None,
            artifacts_dir: None,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let schema = match var("HRSYNC_SCHEMA_FILE") {
            Some(path) => load_schema_file(Path::new(&path))?,
            None => TableSchema::preset(
                var("HRSYNC_SCHEMA")
                    .as_deref()
                    .unwrap_or("employee_records"),
            )?,
        };

        let table = var("HRSYNC_TARGET_TABLE").unwrap_or_else(|| default_target_table(&schema));
        let mut config = Self::new(&var("HRSYNC_SPREADSHEET_ID").unwrap_or_default(), &table, schema);
        if let Some(page) = var("HRSYNC_SHEET_PAGE") {
            config.source_page = page;
        }
        if let Some(size) = var("HRSYNC_WINDOW_SIZE") {
            config.batch_window_size = parse_number("HRSYNC_WINDOW_SIZE", &size)?;
        }
        if let Some(mode) = var("HRSYNC_TABLE_MODE") {
            config.table_mode = mode.parse()?;
        }
        if let Some(mode) = var("HRSYNC_WRITE_MODE") {
            config.write_mode = mode.parse()?;
        }
        if let Some(url) = var("HRSYNC_SHEETS_BASE_URL") {
            config.sheets_base_url = url;
        }
        if let Some(secs) = var("HRSYNC_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = parse_number("HRSYNC_HTTP_TIMEOUT_SECS", &secs)?;
        }
        config.database_url = var("DATABASE_URL");
        config.sheets_access_token = var("GOOGLE_SHEETS_ACCESS_TOKEN");
        config.sheets_api_key = var("GOOGLE_SHEETS_API_KEY");
        config.reports_dir = var("HRSYNC_REPORTS_DIR").map(PathBuf::from);
        config.artifacts_dir = var("HRSYNC_ARTIFACTS_DIR").map(PathBuf::from);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source_identifier.trim().is_empty() {
            return Err(ConfigError::Missing("HRSYNC_SPREADSHEET_ID"));
        }
        if self.source_page.trim().is_empty() {
            return Err(ConfigError::Missing("HRSYNC_SHEET_PAGE"));
        }
        let table = self.target_table.as_str();
        if table.trim().is_empty() {
            return Err(ConfigError::Missing("HRSYNC_TARGET_TABLE"));
        }
        // postgres truncates identifiers beyond 63 bytes
        if table.len() > 63 {
            return Err(ConfigError::Invalid {
                name: "target table",
                value: table.to_string(),
                reason: "longer than 63 bytes".to_string(),
            });
        }
        // also names the artifact namespace directory
        if !is_plain_identifier(table) {
            return Err(ConfigError::Invalid {
                name: "target table",
                value: table.to_string(),
                reason: "expected ASCII letters, digits and underscores, not starting with a digit"
                    .to_string(),
            });
        }
        if self.batch_window_size == 0 {
            return Err(ConfigError::Invalid {
                name: "window size",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        self.schema.validate()?;
        Ok(())
    }

    pub fn google_sheets_config(&self) -> GoogleSheetsConfig {
        GoogleSheetsConfig {
            base_url: self.sheets_base_url.clone(),
            http: HttpClientConfig {
                timeout: Duration::from_secs(self.http_timeout_secs),
                user_agent: Some(format!("hrsync/{}", env!("CARGO_PKG_VERSION"))),
                bearer_token: self.sheets_access_token.clone(),
                api_key: self.sheets_api_key.clone(),
                ..Default::default()
            },
        }
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_number<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    value.parse().map_err(|err: T::Err| ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

/// Read and validate a YAML table schema.
pub fn load_schema_file(path: &Path) -> Result<TableSchema, ConfigError> {
    let schema_err = |reason: String| ConfigError::SchemaFile {
        path: path.to_path_buf(),
        reason,
    };
    let text = std::fs::read_to_string(path).map_err(|err| schema_err(err.to_string()))?;
    let schema: TableSchema =
        serde_yaml::from_str(&text).map_err(|err| schema_err(err.to_string()))?;
    schema.validate()?;
    Ok(schema)
}

/// Google Sheets, or a JSON grid fixture when `fixture` is given.
pub fn open_source(config: &SyncConfig, fixture: Option<&Path>) -> Result<Box<dyn SheetSource>> {
    match fixture {
        Some(path) => Ok(Box::new(GridSheetSource::from_fixture_path(path)?)),
        None => Ok(Box::new(GoogleSheetsSource::new(
            config.google_sheets_config(),
        )?)),
    }
}

/// Postgres, or an in-memory table for dry runs.
pub async fn open_store(config: &SyncConfig, dry_run: bool) -> Result<Box<dyn RecordStore>> {
    if dry_run {
        return Ok(Box::new(MemoryRecordStore::new(config.schema.clone())));
    }
    let url = config
        .database_url
        .as_deref()
        .ok_or(ConfigError::Missing("DATABASE_URL"))?;
    let store = PgRecordStore::connect(url, &config.target_table, config.schema.clone())
        .await
        .context("connecting to postgres")?;
    Ok(Box::new(store))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let source = open_source(&config, None)?;
    let store = open_store(&config, false).await?;
    let mut pipeline = SyncPipeline::new(config, source, store);
    let summary = pipeline.run_once().await?;
    pipeline.shutdown().await;
    Ok(summary)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[source] SourceError),
    #[error("page `{page}` has no header row")]
    EmptySource { page: String },
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    TablePrepared,
    Reading,
    Processing,
    Finalized,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunPhase::Init => "init",
            RunPhase::TablePrepared => "table-prepared",
            RunPhase::Reading => "reading",
            RunPhase::Processing => "processing",
            RunPhase::Finalized => "finalized",
        })
    }
}

/// What a run would read, without touching the store.
#[derive(Debug, Clone, Serialize)]
pub struct SheetInspection {
    pub title: String,
    pub row_count: usize,
    pub header: Vec<String>,
    pub duplicate_labels: Vec<String>,
    pub missing_columns: Vec<MissingColumn>,
    pub windows: Vec<RowWindow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub result: RunResult,
    pub reports_dir: Option<PathBuf>,
    pub diagnostics_artifact: Option<PathBuf>,
}

struct OpenedSheet {
    sheet: Box<dyn Worksheet>,
    header: Header,
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn SheetSource>,
    writer: UpsertWriter,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn SheetSource>, store: Box<dyn RecordStore>) -> Self {
        let writer = UpsertWriter::new(store, config.schema.clone(), config.write_mode);
        Self {
            config,
            source,
            writer,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full reconcile pass. Errors only for failures before the first window is read.
    pub async fn run_once(&mut self) -> Result<SyncRunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sync_run",
            %run_id,
            table = %self.config.target_table,
            source = self.source.kind()
        );
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&mut self, run_id: Uuid) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let mut result = RunResult::new(run_id, &self.config.target_table, started_at);

        let opened = match self.init().await {
            Ok(opened) => opened,
            Err(err) => return Err(self.abort(err).await),
        };
        if let Err(err) = self.prepare_table().await {
            return Err(self.abort(err).await);
        }

        let mapper = RowMapper::new(&opened.header, &self.config.schema);
        result.missing_columns = header_drift(&opened.header, &mapper);
        result.duplicate_labels = opened.header.duplicates().to_vec();

        let width = opened.header.width();
        let mut reader =
            BatchReader::new(opened.sheet.as_ref(), self.config.batch_window_size, width);
        info!(
            phase = %RunPhase::Reading,
            rows = opened.sheet.row_count(),
            windows = reader.remaining(),
            "reading source"
        );

        while let Some((window, fetched)) = reader.next_window().await {
            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(err) => {
                    warn!(start = window.start, end = window.end, error = %err, "window fetch failed");
                    result.record_window_failure(window.start, window.end, err.to_string());
                    continue;
                }
            };

            let span = info_span!("window", start = window.start, end = window.end);
            let processed = self
                .process_window(&mapper, fetched, width, &mut result)
                .instrument(span)
                .await;
            if let Err(err) = processed {
                warn!(error = %err, remaining = reader.remaining(), "store lost; stopping run");
                result.aborted = Some(err.to_string());
                break;
            }
        }

        result.finalize(Utc::now());
        info!(
            phase = %RunPhase::Finalized,
            attempted = result.attempted,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped(),
            failed_windows = result.failed_windows,
            "sync run finished"
        );
        Ok(self.finish(result).await)
    }

    async fn init(&self) -> Result<OpenedSheet, SyncError> {
        info!(phase = %RunPhase::Init, "validating configuration");
        self.config.validate()?;

        let sheet = self
            .source
            .open(&self.config.source_identifier, &self.config.source_page)
            .await
            .map_err(SyncError::SourceUnavailable)?;
        let header = Header::sanitize(
            &sheet
                .header_row()
                .await
                .map_err(SyncError::SourceUnavailable)?,
        );
        if header.width() == 0 {
            return Err(SyncError::EmptySource {
                page: self.config.source_page.clone(),
            });
        }
        if header.placeholder_count() > 0 {
            warn!(
                placeholders = header.placeholder_count(),
                "header has blank labels; using positional placeholders"
            );
        }
        for label in header.duplicates() {
            warn!(%label, "duplicate header label; first occurrence is used");
        }
        Ok(OpenedSheet { sheet, header })
    }

    async fn prepare_table(&mut self) -> Result<(), SyncError> {
        self.writer
            .store_mut()
            .prepare_table(self.config.table_mode)
            .await?;
        info!(
            phase = %RunPhase::TablePrepared,
            mode = %self.config.table_mode,
            "target table ready"
        );
        Ok(())
    }

    async fn abort(&mut self, err: SyncError) -> SyncError {
        warn!(error = %err, "sync run aborted");
        self.writer.store_mut().close().await;
        err
    }

    async fn process_window(
        &mut self,
        mapper: &RowMapper,
        fetched: FetchedWindow,
        width: usize,
        result: &mut RunResult,
    ) -> Result<(), StoreError> {
        info!(phase = %RunPhase::Processing, rows = fetched.rows.len(), "processing window");
        for row in fetched.rows {
            if is_blank_row(&row.cells) {
                result.blank_rows += 1;
                continue;
            }
            if row.was_padded() {
                result.record_padded_row(
                    row.row_number,
                    row.original_len,
                    width,
                    &row.cells[..row.original_len],
                );
            }

            let record = mapper.map(row.row_number, &row.cells);
            let outcome = self.writer.upsert(&record).await?;
            if let WriteOutcome::Skipped(reason) = &outcome {
                warn!(
                    row = record.row_number,
                    kind = %reason.kind(),
                    reason = %reason.message(),
                    "row skipped"
                );
            }
            result.record_outcome(&record, &outcome);
        }
        result.windows += 1;
        info!(
            attempted = result.attempted,
            persisted = result.persisted(),
            "window processed"
        );
        Ok(())
    }

    async fn finish(&self, result: RunResult) -> SyncRunSummary {
        let reports_dir = match &self.config.reports_dir {
            Some(root) => match write_reports(root, &result).await {
                Ok(dir) => Some(dir),
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "writing run reports failed");
                    None
                }
            },
            None => None,
        };

        let diagnostics_artifact = match &self.config.artifacts_dir {
            Some(root) if !result.diagnostics.is_empty() => {
                match store_diagnostics(root, &result).await {
                    Ok(path) => Some(path),
                    Err(err) => {
                        warn!(error = %format!("{err:#}"), "storing diagnostics artifact failed");
                        None
                    }
                }
            }
            _ => None,
        };

        SyncRunSummary {
            result,
            reports_dir,
            diagnostics_artifact,
        }
    }

    /// Init and table preparation only.
    pub async fn prepare(&mut self) -> Result<SheetInspection, SyncError> {
        let opened = match self.init().await {
            Ok(opened) => opened,
            Err(err) => return Err(self.abort(err).await),
        };
        if let Err(err) = self.prepare_table().await {
            return Err(self.abort(err).await);
        }
        Ok(self.inspection(&opened))
    }

    /// Header, row count and planned windows, without touching the store.
    pub async fn inspect(&self) -> Result<SheetInspection, SyncError> {
        let opened = self.init().await?;
        Ok(self.inspection(&opened))
    }

    fn inspection(&self, opened: &OpenedSheet) -> SheetInspection {
        let mapper = RowMapper::new(&opened.header, &self.config.schema);
        SheetInspection {
            title: opened.sheet.title().to_string(),
            row_count: opened.sheet.row_count(),
            header: opened.header.labels().to_vec(),
            duplicate_labels: opened.header.duplicates().to_vec(),
            missing_columns: header_drift(&opened.header, &mapper),
            windows: plan_windows(opened.sheet.row_count(), self.config.batch_window_size),
        }
    }

    pub async fn row_count(&mut self) -> Result<u64, StoreError> {
        self.writer.store_mut().row_count().await
    }

    pub async fn shutdown(mut self) {
        self.writer.store_mut().close().await;
    }
}

/// Schema columns the header lacks, each with the closest header label if one is close enough.
pub fn header_drift(header: &Header, mapper: &RowMapper) -> Vec<MissingColumn> {
    mapper
        .missing_columns()
        .into_iter()
        .map(|column| {
            let suggestion = suggest_label(column.label(), header.labels());
            match &suggestion {
                Some(label) => warn!(
                    column = %column.name,
                    closest = %label,
                    "schema column missing from header"
                ),
                None => warn!(column = %column.name, "schema column missing from header"),
            }
            MissingColumn {
                column: column.name.clone(),
                suggestion,
            }
        })
        .collect()
}

pub fn normalize_label(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

pub fn suggest_label(wanted: &str, labels: &[String]) -> Option<String> {
    let wanted = normalize_label(wanted);
    labels
        .iter()
        .map(|label| (label, jaro_winkler(&wanted, &normalize_label(label))))
        .filter(|(_, score)| *score >= LABEL_SUGGESTION_THRESHOLD)
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(label, _)| label.clone())
}

pub fn report_markdown(result: &RunResult) -> String {
    let mut out = format!(
        "# HR Sync Brief\n\n- Run ID: `{}`\n- Table: `{}`\n- Started: {}\n- Finished: {}\n- Windows: {} ({} failed)\n- Attempted: {}\n- Inserted: {}\n- Updated: {}\n- Skipped (duplicate): {}\n- Skipped (invalid): {}\n- Skipped (error): {}\n- Blank rows: {}\n- Padded rows: {}\n",
        result.run_id,
        result.target_table,
        result.started_at,
        result
            .finished_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string()),
        result.windows,
        result.failed_windows,
        result.attempted,
        result.inserted,
        result.updated,
        result.skipped_duplicate,
        result.skipped_invalid,
        result.skipped_error,
        result.blank_rows,
        result.padded_rows,
    );
    if let Some(reason) = &result.aborted {
        out.push_str(&format!("- Aborted: {reason}\n"));
    }

    if !result.missing_columns.is_empty() {
        out.push_str("\n## Missing Columns\n");
        for missing in &result.missing_columns {
            match &missing.suggestion {
                Some(label) => out.push_str(&format!(
                    "- `{}` (closest header label: `{}`)\n",
                    missing.column, label
                )),
                None => out.push_str(&format!("- `{}`\n", missing.column)),
            }
        }
    }

    let skipped: Vec<_> = result.skipped_rows().collect();
    if !skipped.is_empty() {
        out.push_str("\n## Skipped Rows\n\n| Row | Kind | Reason |\n|---|---|---|\n");
        for diag in skipped {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                diag.row_number,
                diag.kind,
                diag.reason.replace('|', "\\|")
            ));
        }
    }
    out
}

/// Writes `<root>/<run_id>/run_summary.json` and `sync_brief.md`.
pub async fn write_reports(root: &Path, result: &RunResult) -> Result<PathBuf> {
    let reports_dir = root.join(result.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary = serde_json::to_vec_pretty(result).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), summary)
        .await
        .context("writing run_summary.json")?;
    fs::write(reports_dir.join("sync_brief.md"), report_markdown(result))
        .await
        .context("writing sync_brief.md")?;
    Ok(reports_dir)
}

async fn store_diagnostics(root: &Path, result: &RunResult) -> Result<PathBuf> {
    let bytes =
        serde_json::to_vec_pretty(&result.diagnostics).context("serializing diagnostics")?;
    let created_at = result.finished_at.unwrap_or(result.started_at);
    let stored = ArtifactStore::new(root)
        .store_bytes(created_at, &result.target_table, "json", &bytes)
        .await?;
    info!(
        path = %stored.relative_path.display(),
        deduplicated = stored.deduplicated,
        "stored diagnostics artifact"
    );
    Ok(stored.absolute_path)
}
