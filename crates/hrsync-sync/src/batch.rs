//! Windowed reads over a worksheet.

use std::vec;

use hrsync_adapters::{A1Range, SourceError, Worksheet};
use serde::Serialize;

/// Row 1 holds the header.
pub const FIRST_DATA_ROW: usize = 2;

pub const DEFAULT_WINDOW_SIZE: usize = 800;

/// Inclusive 1-based sheet row range fetched in one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowWindow {
    pub start: usize,
    pub end: usize,
}

impl RowWindow {
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn a1(&self, width: usize) -> String {
        A1Range::rows(self.start, self.end, width).to_string()
    }
}

/// Partition `[2, total_rows]` into ascending windows of at most `window_size` rows.
/// The last window holds whatever remains.
pub fn plan_windows(total_rows: usize, window_size: usize) -> Vec<RowWindow> {
    let size = window_size.max(1);
    (FIRST_DATA_ROW..=total_rows)
        .step_by(size)
        .map(|start| RowWindow {
            start,
            end: start.saturating_add(size - 1).min(total_rows),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    pub row_number: usize,
    /// Cell count as returned by the source, before padding.
    pub original_len: usize,
    pub cells: Vec<String>,
}

impl SourceRow {
    pub fn was_padded(&self) -> bool {
        self.original_len < self.cells.len()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedWindow {
    pub window: RowWindow,
    pub rows: Vec<SourceRow>,
}

/// Pull-based, single-pass reader: every [`BatchReader::next_window`] call hits the source.
pub struct BatchReader<'a> {
    sheet: &'a dyn Worksheet,
    width: usize,
    windows: vec::IntoIter<RowWindow>,
}

impl<'a> BatchReader<'a> {
    pub fn new(sheet: &'a dyn Worksheet, window_size: usize, width: usize) -> Self {
        Self {
            windows: plan_windows(sheet.row_count(), window_size).into_iter(),
            sheet,
            width,
        }
    }

    pub fn remaining(&self) -> usize {
        self.windows.len()
    }

    pub async fn next_window(
        &mut self,
    ) -> Option<(RowWindow, Result<FetchedWindow, SourceError>)> {
        let window = self.windows.next()?;
        let fetched = self
            .sheet
            .get_range(&window.a1(self.width))
            .await
            .map(|grid| FetchedWindow {
                window,
                rows: pad_grid(window, grid, self.width),
            });
        Some((window, fetched))
    }
}

/// Right-pad short rows to `width`; rows past the window end are dropped.
pub fn pad_grid(window: RowWindow, grid: Vec<Vec<String>>, width: usize) -> Vec<SourceRow> {
    grid.into_iter()
        .take(window.len())
        .enumerate()
        .map(|(offset, mut cells)| {
            let original_len = cells.len();
            if cells.len() < width {
                cells.resize(width, String::new());
            }
            SourceRow {
                row_number: window.start + offset,
                original_len,
                cells,
            }
        })
        .collect()
}
