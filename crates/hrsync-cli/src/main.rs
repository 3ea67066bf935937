use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hrsync_sync::{
    open_source, open_store, MemoryRecordStore, SheetInspection, SyncConfig, SyncPipeline,
    SyncRunSummary, TableMode, WriteMode,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hrsync-cli")]
#[command(about = "Sync HR spreadsheet rows into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full reconcile pass.
    Sync(RunArgs),
    /// Open the sheet and prepare the target table, without writing rows.
    Prepare(RunArgs),
    /// Show the sanitized header, row count and planned windows.
    Inspect(RunArgs),
}

/// Flags override the corresponding `HRSYNC_*` variables.
#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    spreadsheet_id: Option<String>,
    #[arg(long)]
    page: Option<String>,
    #[arg(long)]
    table: Option<String>,
    /// Built-in schema name (employee_records, hr_merge).
    #[arg(long, conflicts_with = "schema_file")]
    schema: Option<String>,
    #[arg(long)]
    schema_file: Option<PathBuf>,
    #[arg(long)]
    window_size: Option<usize>,
    #[arg(long)]
    table_mode: Option<TableMode>,
    #[arg(long)]
    write_mode: Option<WriteMode>,
    /// Read from a JSON grid fixture instead of Google Sheets.
    #[arg(long)]
    fixture: Option<PathBuf>,
    /// Write into an in-memory table instead of Postgres.
    #[arg(long)]
    dry_run: bool,
}

impl RunArgs {
    fn config(&self) -> Result<SyncConfig> {
        self.config_with(|name| std::env::var(name).ok())
    }

    /// Flags are layered over `env` before anything is parsed, so a bad environment value
    /// that a flag replaces is never read.
    fn config_with<F>(&self, env: F) -> Result<SyncConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let overrides = self.overrides();
        SyncConfig::from_lookup(|name| {
            match overrides.iter().find(|(key, _)| *key == name) {
                Some((_, value)) => Some(value.clone()),
                None => env(name),
            }
        })
        .context("reading configuration")
    }

    fn overrides(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if let Some(id) = &self.spreadsheet_id {
            vars.push(("HRSYNC_SPREADSHEET_ID", id.clone()));
        }
        if let Some(page) = &self.page {
            vars.push(("HRSYNC_SHEET_PAGE", page.clone()));
        }
        if let Some(table) = &self.table {
            vars.push(("HRSYNC_TARGET_TABLE", table.clone()));
        }
        if let Some(path) = &self.schema_file {
            vars.push(("HRSYNC_SCHEMA_FILE", path.to_string_lossy().into_owned()));
        } else if let Some(name) = &self.schema {
            // blank counts as unset, so a schema file from the environment is ignored
            vars.push(("HRSYNC_SCHEMA_FILE", String::new()));
            vars.push(("HRSYNC_SCHEMA", name.clone()));
        }
        if let Some(size) = self.window_size {
            vars.push(("HRSYNC_WINDOW_SIZE", size.to_string()));
        }
        if let Some(mode) = self.table_mode {
            vars.push(("HRSYNC_TABLE_MODE", mode.to_string()));
        }
        if let Some(mode) = self.write_mode {
            vars.push(("HRSYNC_WRITE_MODE", mode.to_string()));
        }
        vars
    }

    async fn pipeline(&self, dry_run: bool) -> Result<SyncPipeline> {
        let config = self.config()?;
        let source = open_source(&config, self.fixture.as_deref())?;
        let store = open_store(&config, dry_run).await?;
        Ok(SyncPipeline::new(config, source, store))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| Commands::Sync(RunArgs::default())) {
        Commands::Sync(args) => {
            let mut pipeline = args.pipeline(args.dry_run).await?;
            let summary = pipeline.run_once().await?;
            pipeline.shutdown().await;
            print_summary(&summary);
            if let Some(reason) = &summary.result.aborted {
                bail!("sync aborted: {reason}");
            }
        }
        Commands::Prepare(args) => {
            let mut pipeline = args.pipeline(args.dry_run).await?;
            let inspection = pipeline.prepare().await?;
            let table = pipeline.config().target_table.clone();
            pipeline.shutdown().await;
            println!(
                "table {table} ready for {} data rows from page {}",
                inspection.row_count.saturating_sub(1),
                inspection.title
            );
        }
        Commands::Inspect(args) => {
            let config = args.config()?;
            let source = open_source(&config, args.fixture.as_deref())?;
            let store = Box::new(MemoryRecordStore::new(config.schema.clone()));
            let pipeline = SyncPipeline::new(config, source, store);
            print_inspection(&pipeline.inspect().await?);
        }
    }

    Ok(())
}

fn print_summary(summary: &SyncRunSummary) {
    let result = &summary.result;
    println!(
        "sync complete: run_id={} table={} attempted={} inserted={} updated={} skipped_duplicate={} skipped_invalid={} skipped_error={} blank={} failed_windows={}",
        result.run_id,
        result.target_table,
        result.attempted,
        result.inserted,
        result.updated,
        result.skipped_duplicate,
        result.skipped_invalid,
        result.skipped_error,
        result.blank_rows,
        result.failed_windows,
    );
    for missing in &result.missing_columns {
        match &missing.suggestion {
            Some(label) => println!("missing column {} (header has {label})", missing.column),
            None => println!("missing column {}", missing.column),
        }
    }
    for diag in result.skipped_rows() {
        println!(
            "row {:>6}  {:<22} {}  [{}]",
            diag.row_number,
            diag.kind.to_string(),
            diag.reason,
            diag.values.join(", ")
        );
    }
    if let Some(dir) = &summary.reports_dir {
        println!("reports: {}", dir.display());
    }
    if let Some(path) = &summary.diagnostics_artifact {
        println!("diagnostics: {}", path.display());
    }
}

fn print_inspection(inspection: &SheetInspection) {
    println!("page: {}", inspection.title);
    println!("rows: {} (header included)", inspection.row_count);
    println!("header:");
    for (idx, label) in inspection.header.iter().enumerate() {
        println!("  {:>3}  {label}", idx + 1);
    }
    for label in &inspection.duplicate_labels {
        println!("duplicate label: {label}");
    }
    for missing in &inspection.missing_columns {
        println!(
            "missing column: {}{}",
            missing.column,
            missing
                .suggestion
                .as_deref()
                .map(|s| format!(" (closest: {s})"))
                .unwrap_or_default()
        );
    }
    println!("windows:");
    for window in &inspection.windows {
        println!("  rows {}-{}", window.start, window.end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_parse_into_modes() {
        let cli = Cli::try_parse_from([
            "hrsync-cli",
            "sync",
            "--spreadsheet-id",
            "abc",
            "--window-size",
            "200",
            "--table-mode",
            "drop-and-recreate",
            "--write-mode",
            "insert-only",
            "--dry-run",
        ])
        .unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync");
        };
        assert_eq!(args.spreadsheet_id.as_deref(), Some("abc"));
        assert_eq!(args.window_size, Some(200));
        assert_eq!(args.table_mode, Some(TableMode::DropAndRecreate));
        assert_eq!(args.write_mode, Some(WriteMode::InsertOnly));
        assert!(args.dry_run);
    }

    #[test]
    fn schema_and_schema_file_conflict() {
        let parsed = Cli::try_parse_from([
            "hrsync-cli",
            "inspect",
            "--schema",
            "hr_merge",
            "--schema-file",
            "schema.yaml",
        ]);
        assert!(parsed.is_err());
    }

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            pairs
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    fn run_args(argv: &[&str]) -> RunArgs {
        match Cli::try_parse_from(argv).unwrap().command {
            Some(Commands::Sync(args) | Commands::Prepare(args) | Commands::Inspect(args)) => args,
            None => panic!("expected a subcommand"),
        }
    }

    #[test]
    fn schema_flag_wins_over_broken_schema_environment() {
        let args = run_args(&["hrsync-cli", "inspect", "--schema", "hr_merge"]);
        let config = args
            .config_with(env(&[
                ("HRSYNC_SPREADSHEET_ID", "sheet-1"),
                ("HRSYNC_SCHEMA_FILE", "/nonexistent/schema.yaml"),
                ("HRSYNC_SCHEMA", "no_such_preset"),
            ]))
            .unwrap();
        assert_eq!(config.schema.name, "hr_merge");
        assert_eq!(config.target_table, "hr_merge_for_it_use");

        let schema_file = concat!(env!("CARGO_MANIFEST_DIR"), "/../../schemas/hr_merge.yaml");
        let args = run_args(&["hrsync-cli", "sync", "--schema-file", schema_file]);
        let config = args
            .config_with(env(&[
                ("HRSYNC_SCHEMA_FILE", "/nonexistent/schema.yaml"),
                ("HRSYNC_SCHEMA", "no_such_preset"),
            ]))
            .unwrap();
        assert_eq!(config.schema.name, "hr_merge");
    }

    #[test]
    fn flags_override_environment_values() {
        let args = run_args(&["hrsync-cli", "sync", "--table", "staging", "--window-size", "50"]);
        let config = args
            .config_with(env(&[
                ("HRSYNC_TARGET_TABLE", "bad/name"),
                ("HRSYNC_WINDOW_SIZE", "lots"),
                ("HRSYNC_TABLE_MODE", "drop-and-recreate"),
            ]))
            .unwrap();
        assert_eq!(config.target_table, "staging");
        assert_eq!(config.batch_window_size, 50);
        assert_eq!(config.table_mode, TableMode::DropAndRecreate);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["hrsync-cli", "sync", "--table-mode", "truncate"]).is_err());
    }
}
