use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use hrsync_core::{CellValue, DateValue, TableSchema};
use hrsync_sync::{load_schema_file, open_source, MemoryRecordStore, SyncConfig, SyncPipeline};

fn repo_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(relative)
}

#[test]
fn bundled_merge_schema_matches_builtin() {
    let schema = load_schema_file(&repo_path("schemas/hr_merge.yaml")).unwrap();
    assert_eq!(schema, TableSchema::hr_merge());
}

#[tokio::test]
async fn sample_fixture_run() {
    let config = SyncConfig::new("hr-sample", "employees", TableSchema::employee_records());
    let source = open_source(&config, Some(&repo_path("fixtures/hr-sample/grid.json"))).unwrap();
    let store = MemoryRecordStore::new(TableSchema::employee_records());
    let mut pipeline = SyncPipeline::new(config, source, Box::new(store.clone()));

    let summary = pipeline.run_once().await.unwrap();
    let result = &summary.result;
    assert_eq!(result.windows, 1);
    assert_eq!(result.attempted, 6);
    assert_eq!(result.inserted, 3);
    assert_eq!(result.updated, 1);
    assert_eq!(result.skipped_invalid, 2);
    assert_eq!(result.blank_rows, 1);
    assert_eq!(store.len(), 3);

    let value = |key: &str, column: &str| {
        store
            .get(key)
            .unwrap()
            .into_iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
            .unwrap()
    };
    let date = |y, m, d| CellValue::Date(DateValue::Date(NaiveDate::from_ymd_opt(y, m, d).unwrap()));

    // later row for the same employee number wins
    assert_eq!(value("1234567890", "Department"), CellValue::Text("Platform".into()));
    assert_eq!(value("2000000001", "Reporting_date"), date(2023, 4, 15));
    assert_eq!(value("2000000002", "Reporting_date"), date(2022, 3, 7));
    assert_eq!(value("2000000002", "Resigned_date"), date(2024, 12, 31));
    assert!(store.get("2000000003").is_none());
}
