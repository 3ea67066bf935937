//! Spreadsheet source contracts + Google Sheets and fixture-grid implementations.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use hrsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "hrsync-adapters";

pub const GOOGLE_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("spreadsheet `{identifier}` not found")]
    SourceNotFound { identifier: String },
    #[error("page `{page}` not found in spreadsheet `{identifier}`")]
    PageNotFound { identifier: String, page: String },
    #[error("invalid A1 range `{0}`")]
    InvalidRange(String),
    #[error("range `{range}` unavailable: {reason}")]
    RangeUnavailable { range: String, reason: String },
    #[error("decoding sheets response: {0}")]
    Decode(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl SourceError {
    /// Whether the source itself (not just one range) is unreachable.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SourceError::SourceNotFound { .. } | SourceError::PageNotFound { .. }
        )
    }
}

/// Opens one page ("worksheet") of a spreadsheet.
#[async_trait]
pub trait SheetSource: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn open(&self, identifier: &str, page: &str) -> Result<Box<dyn Worksheet>, SourceError>;
}

#[async_trait]
pub trait Worksheet: Send + Sync {
    fn title(&self) -> &str;

    /// Number of grid rows, header included.
    fn row_count(&self) -> usize;

    async fn header_row(&self) -> Result<Vec<String>, SourceError>;

    /// Cells for an A1 range such as `A2:I801`. Trailing empty cells and rows may be omitted.
    async fn get_range(&self, a1: &str) -> Result<Vec<Vec<String>>, SourceError>;
}

/// `0 -> A`, `25 -> Z`, `26 -> AA`.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

pub fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() || !letters.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    let mut n = 0usize;
    for b in letters.bytes() {
        n = n.checked_mul(26)? + (b.to_ascii_uppercase() - b'A') as usize + 1;
    }
    Some(n - 1)
}

/// Rectangular A1 range with 1-based rows and 0-based columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct A1Range {
    pub start_col: usize,
    pub start_row: usize,
    pub end_col: usize,
    pub end_row: usize,
}

impl A1Range {
    pub fn rows(start_row: usize, end_row: usize, width: usize) -> Self {
        Self {
            start_col: 0,
            start_row,
            end_col: width.max(1) - 1,
            end_row,
        }
    }

    pub fn parse(input: &str) -> Result<Self, SourceError> {
        let invalid = || SourceError::InvalidRange(input.to_string());
        let (start, end) = input.split_once(':').ok_or_else(invalid)?;
        let (start_col, start_row) = split_cell(start).ok_or_else(invalid)?;
        let (end_col, end_row) = split_cell(end).ok_or_else(invalid)?;
        if start_row == 0 || end_row < start_row || end_col < start_col {
            return Err(invalid());
        }
        Ok(Self {
            start_col,
            start_row,
            end_col,
            end_row,
        })
    }

    pub fn width(&self) -> usize {
        self.end_col - self.start_col + 1
    }
}

fn split_cell(cell: &str) -> Option<(usize, usize)> {
    let cell = cell.trim();
    let digits_at = cell.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cell.split_at(digits_at);
    Some((column_index(letters)?, digits.parse().ok()?))
}

impl fmt::Display for A1Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}{}",
            column_letter(self.start_col),
            self.start_row,
            column_letter(self.end_col),
            self.end_row
        )
    }
}

/// Quote a page title for use in an A1 reference: `Sheet 1` -> `'Sheet 1'`.
pub fn quote_page(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

// ---------------------------------------------------------------------------
// Google Sheets v4
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GoogleSheetsConfig {
    pub base_url: String,
    /// Credentials (bearer token or API key) travel as headers set on `http`.
    pub http: HttpClientConfig,
}

impl Default for GoogleSheetsConfig {
    fn default() -> Self {
        Self {
            base_url: GOOGLE_SHEETS_BASE_URL.to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug)]
struct GoogleClient {
    http: HttpFetcher,
    base_url: String,
}

/// Reads pages through the Sheets v4 REST API.
#[derive(Debug, Clone)]
pub struct GoogleSheetsSource {
    client: Arc<GoogleClient>,
}

impl GoogleSheetsSource {
    pub fn new(config: GoogleSheetsConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http).context("building sheets http client")?;
        Ok(Self {
            client: Arc::new(GoogleClient {
                http,
                base_url: config.base_url,
            }),
        })
    }
}

impl GoogleClient {
    fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, SourceError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|err| SourceError::Decode(format!("base url {}: {err}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|_| SourceError::Decode(format!("base url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    fn metadata_url(&self, identifier: &str) -> Result<Url, SourceError> {
        self.url(
            &["v4", "spreadsheets", identifier],
            &[("fields", "sheets.properties(title,gridProperties(rowCount,columnCount))")],
        )
    }

    fn values_url(&self, identifier: &str, page: &str, a1: &str) -> Result<Url, SourceError> {
        let range = format!("{}!{}", quote_page(page), a1);
        self.url(
            &["v4", "spreadsheets", identifier, "values", &range],
            &[
                ("majorDimension", "ROWS"),
                ("valueRenderOption", "FORMATTED_VALUE"),
            ],
        )
    }
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMetadata {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    title: String,
    #[serde(default)]
    grid_properties: Option<GridProperties>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridProperties {
    #[serde(default)]
    row_count: usize,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

/// Grid row count of `page` from a `spreadsheets.get` response body.
pub fn page_row_count(metadata_json: &[u8], page: &str) -> Result<Option<usize>, SourceError> {
    let metadata: SpreadsheetMetadata =
        serde_json::from_slice(metadata_json).map_err(|err| SourceError::Decode(err.to_string()))?;
    Ok(metadata
        .sheets
        .into_iter()
        .find(|sheet| sheet.properties.title == page)
        .map(|sheet| {
            sheet
                .properties
                .grid_properties
                .map(|grid| grid.row_count)
                .unwrap_or(0)
        }))
}

/// String grid from a `spreadsheets.values.get` response body.
pub fn value_range_grid(values_json: &[u8]) -> Result<Vec<Vec<String>>, SourceError> {
    let range: ValueRange =
        serde_json::from_slice(values_json).map_err(|err| SourceError::Decode(err.to_string()))?;
    Ok(range
        .values
        .into_iter()
        .map(|row| row.into_iter().map(cell_to_string).collect())
        .collect())
}

fn cell_to_string(cell: JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl SheetSource for GoogleSheetsSource {
    fn kind(&self) -> &'static str {
        "google-sheets"
    }

    async fn open(&self, identifier: &str, page: &str) -> Result<Box<dyn Worksheet>, SourceError> {
        let url = self.client.metadata_url(identifier)?;
        let response = match self.client.http.fetch_bytes(url.as_str()).await {
            Ok(response) => response,
            Err(err) if err.status() == Some(404) => {
                return Err(SourceError::SourceNotFound {
                    identifier: identifier.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        let row_count = page_row_count(&response.body, page)?.ok_or_else(|| {
            SourceError::PageNotFound {
                identifier: identifier.to_string(),
                page: page.to_string(),
            }
        })?;
        debug!(identifier, page, row_count, "opened google sheet");

        Ok(Box::new(GoogleWorksheet {
            client: Arc::clone(&self.client),
            identifier: identifier.to_string(),
            title: page.to_string(),
            row_count,
        }))
    }
}

#[derive(Debug)]
struct GoogleWorksheet {
    client: Arc<GoogleClient>,
    identifier: String,
    title: String,
    row_count: usize,
}

#[async_trait]
impl Worksheet for GoogleWorksheet {
    fn title(&self) -> &str {
        &self.title
    }

    fn row_count(&self) -> usize {
        self.row_count
    }

    async fn header_row(&self) -> Result<Vec<String>, SourceError> {
        let grid = self.get_range("1:1").await?;
        Ok(grid.into_iter().next().unwrap_or_default())
    }

    async fn get_range(&self, a1: &str) -> Result<Vec<Vec<String>>, SourceError> {
        let url = self.client.values_url(&self.identifier, &self.title, a1)?;
        let response = self
            .client
            .http
            .fetch_bytes(url.as_str())
            .await
            .map_err(|err| match err.status() {
                Some(400) | Some(404) => SourceError::RangeUnavailable {
                    range: a1.to_string(),
                    reason: err.to_string(),
                },
                _ => SourceError::Fetch(err),
            })?;
        value_range_grid(&response.body)
    }
}

// ---------------------------------------------------------------------------
// In-memory grids and JSON fixtures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridFixture {
    pub spreadsheets: Vec<FixtureSpreadsheet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureSpreadsheet {
    pub id: String,
    pub pages: Vec<FixturePage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub title: String,
    pub rows: Vec<Vec<String>>,
}

pub fn load_grid_fixture(path: &Path) -> Result<GridFixture> {
    let text =
        fs::read_to_string(path).with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing fixture {}", path.display()))
}

type PageKey = (String, String);

/// Sheet source over in-memory grids. Ranges are served the way the Sheets API serves
/// them: trailing empty cells and trailing empty rows are dropped.
#[derive(Debug, Default, Clone)]
pub struct GridSheetSource {
    pages: HashMap<PageKey, Arc<Vec<Vec<String>>>>,
    unavailable: Arc<HashSet<String>>,
    fetches: Arc<AtomicUsize>,
}

impl GridSheetSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, identifier: &str, page: &str, rows: Vec<Vec<String>>) -> Self {
        self.pages
            .insert((identifier.to_string(), page.to_string()), Arc::new(rows));
        self
    }

    /// Make `get_range` fail for this exact A1 range.
    pub fn with_unavailable_range(mut self, a1: &str) -> Self {
        Arc::make_mut(&mut self.unavailable).insert(a1.to_string());
        self
    }

    pub fn from_fixture(fixture: GridFixture) -> Self {
        fixture
            .spreadsheets
            .into_iter()
            .flat_map(|sheet| {
                let id = sheet.id;
                sheet
                    .pages
                    .into_iter()
                    .map(move |page| (id.clone(), page))
            })
            .fold(Self::new(), |source, (id, page)| {
                source.with_page(&id, &page.title, page.rows)
            })
    }

    pub fn from_fixture_path(path: &Path) -> Result<Self> {
        Ok(Self::from_fixture(load_grid_fixture(path)?))
    }

    /// Number of range reads served so far, header reads included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SheetSource for GridSheetSource {
    fn kind(&self) -> &'static str {
        "grid"
    }

    async fn open(&self, identifier: &str, page: &str) -> Result<Box<dyn Worksheet>, SourceError> {
        if !self.pages.keys().any(|(id, _)| id == identifier) {
            return Err(SourceError::SourceNotFound {
                identifier: identifier.to_string(),
            });
        }
        let rows = self
            .pages
            .get(&(identifier.to_string(), page.to_string()))
            .cloned()
            .ok_or_else(|| SourceError::PageNotFound {
                identifier: identifier.to_string(),
                page: page.to_string(),
            })?;
        Ok(Box::new(GridWorksheet {
            title: page.to_string(),
            rows,
            unavailable: Arc::clone(&self.unavailable),
            fetches: Arc::clone(&self.fetches),
        }))
    }
}

#[derive(Debug)]
struct GridWorksheet {
    title: String,
    rows: Arc<Vec<Vec<String>>>,
    unavailable: Arc<HashSet<String>>,
    fetches: Arc<AtomicUsize>,
}

impl GridWorksheet {
    fn slice(&self, range: A1Range) -> Vec<Vec<String>> {
        let first = range.start_row - 1;
        let last = range.end_row.min(self.rows.len());
        let mut grid: Vec<Vec<String>> = self
            .rows
            .get(first..last)
            .unwrap_or_default()
            .iter()
            .map(|row| {
                let mut cells: Vec<String> = row
                    .iter()
                    .skip(range.start_col)
                    .take(range.width())
                    .cloned()
                    .collect();
                while cells.last().is_some_and(|c| c.is_empty()) {
                    cells.pop();
                }
                cells
            })
            .collect();
        while grid.last().is_some_and(|row| row.is_empty()) {
            grid.pop();
        }
        grid
    }
}

#[async_trait]
impl Worksheet for GridWorksheet {
    fn title(&self) -> &str {
        &self.title
    }

    fn row_count(&self) -> usize {
        self.rows.len()
    }

    async fn header_row(&self) -> Result<Vec<String>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.rows.first().cloned().unwrap_or_default())
    }

    async fn get_range(&self, a1: &str) -> Result<Vec<Vec<String>>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.contains(a1) {
            return Err(SourceError::RangeUnavailable {
                range: a1.to_string(),
                reason: "range marked unavailable".to_string(),
            });
        }
        Ok(self.slice(A1Range::parse(a1)?))
    }
}
