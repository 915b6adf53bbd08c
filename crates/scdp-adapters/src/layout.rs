//! Column recovery for text-layer and OCR output: one page of plain text in,
//! stitched multi-page tables out.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use scdp_core::{header_signature, StrategyKind};

use crate::extract::TableSignals;
use crate::html::synthetic_header;
use crate::text::{clean_cell, has_presentation_forms, looks_like_ticker, looks_numeric, rtl_dominant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    pub page: u32,
    pub text: String,
}

/// One cell of a text line and the character columns it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// Tabular lines found on one page. Rows keep their raw cells and positions.
#[derive(Debug, Clone, PartialEq)]
pub struct PageTable {
    pub page: u32,
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<Cell>>,
    columns: Vec<(usize, usize)>,
}

impl PageTable {
    fn width(&self) -> usize {
        if let Some(header) = &self.header {
            return header.len();
        }
        let mut counts: HashMap<usize, usize> = HashMap::new();
        for row in &self.rows {
            *counts.entry(row.len()).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(len, n)| (*n, *len))
            .map(|(len, _)| len)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StitchedTable {
    pub pages: Vec<u32>,
    pub header: Vec<String>,
    pub header_detected: bool,
    pub rows: Vec<Vec<String>>,
    pub confidence: f64,
}

/// Cells are separated by a tab or a run of two or more spaces. Positions
/// count characters of the line with each tab widened to two spaces.
pub fn line_cells(line: &str, visual_order: bool) -> Vec<Cell> {
    let visual = visual_order || has_presentation_forms(line);
    let chars: Vec<char> = line.replace('\t', "  ").chars().collect();
    let mut cells = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ' ' {
            i += 1;
            continue;
        }
        let start = i;
        let mut end = i;
        while i < chars.len() {
            if chars[i] != ' ' {
                i += 1;
                end = i;
                continue;
            }
            let gap = chars[i..].iter().take_while(|c| **c == ' ').count();
            if gap >= 2 {
                break;
            }
            i += gap;
        }
        let raw: String = chars[start..end].iter().collect();
        let text = clean_cell(&raw, visual);
        if !text.is_empty() {
            cells.push(Cell { start, end, text });
        }
    }
    if visual && rtl_dominant(line) {
        cells.reverse();
    }
    cells
}

pub fn split_cells(line: &str, visual_order: bool) -> Vec<String> {
    line_cells(line, visual_order).into_iter().map(|c| c.text).collect()
}

fn looks_like_header(row: &[Cell], next: Option<&Vec<Cell>>) -> bool {
    row.iter().all(|c| !looks_numeric(&c.text)) && next.is_some_and(|n| n.iter().any(|c| looks_numeric(&c.text)))
}

/// Each header cell owns the character range from its start up to the next
/// header cell's start.
fn column_spans(header: &[Cell]) -> Vec<(usize, usize)> {
    header
        .iter()
        .map(|cell| {
            let end = header
                .iter()
                .map(|c| c.start)
                .filter(|s| *s > cell.start)
                .min()
                .unwrap_or(usize::MAX);
            (cell.start, end)
        })
        .collect()
}

pub fn parse_page(page: u32, text: &str, visual_order: bool) -> Option<PageTable> {
    let mut lines: Vec<Vec<Cell>> = text
        .lines()
        .map(|l| line_cells(l, visual_order))
        .filter(|cells| cells.len() >= 2)
        .collect();
    if lines.is_empty() {
        return None;
    }
    let header = looks_like_header(&lines[0], lines.get(1)).then(|| lines.remove(0));
    if lines.is_empty() {
        return None;
    }
    let columns = header.as_deref().map(column_spans).unwrap_or_default();
    Some(PageTable {
        page,
        header: header.map(|cells| cells.into_iter().map(|c| c.text).collect()),
        rows: lines,
        columns,
    })
}

/// Place the cells of a short row under the header columns they overlap most.
/// `None` when a cell sits under no column or two cells claim the same one.
fn align(cells: &[Cell], columns: &[(usize, usize)]) -> Option<Vec<String>> {
    let mut row = vec![String::new(); columns.len()];
    for cell in cells {
        let (idx, overlap) = columns
            .iter()
            .enumerate()
            .map(|(i, (start, end))| (i, cell.end.min(*end).saturating_sub(cell.start.max(*start))))
            .max_by_key(|(i, overlap)| (*overlap, Reverse(*i)))?;
        if overlap == 0 || !row[idx].is_empty() {
            return None;
        }
        row[idx] = cell.text.clone();
    }
    Some(row)
}

/// Bring a raw row to `width`. Short rows are placed by position when the
/// header columns are known: blanks keep their column, and blank leading
/// cells (a spanned board or market) come from the row above. Without
/// positions a short row is padded at the end when it starts with a ticker
/// and inherits its leading cells otherwise. Long rows fold the overflow into
/// the last cell. The flag is false whenever a cell had to be guessed.
fn shape_row(
    raw: Vec<Cell>,
    width: usize,
    columns: &[(usize, usize)],
    prev: Option<&Vec<String>>,
) -> (Vec<String>, bool) {
    if raw.len() < width && columns.len() == width {
        if let Some(mut row) = align(&raw, columns) {
            let leading = row.iter().take_while(|c| c.is_empty()).count();
            return match prev {
                Some(prev) if leading > 0 => {
                    row[..leading].clone_from_slice(&prev[..leading]);
                    (row, false)
                }
                _ => (row, leading == 0),
            };
        }
    }

    let mut cells: Vec<String> = raw.into_iter().map(|c| c.text).collect();
    match cells.len().cmp(&width) {
        Ordering::Equal => (cells, true),
        Ordering::Greater => {
            let overflow = cells.split_off(width.saturating_sub(1)).join(" ");
            cells.push(overflow);
            (cells, false)
        }
        Ordering::Less => match prev {
            Some(prev) if !cells.first().is_some_and(|c| looks_like_ticker(c)) => {
                let missing = width - cells.len();
                let mut row: Vec<String> = prev.iter().take(missing).cloned().collect();
                row.extend(cells);
                (row, false)
            }
            _ => {
                cells.resize(width, String::new());
                (cells, false)
            }
        },
    }
}

struct Group {
    header: Vec<String>,
    header_detected: bool,
    pages: Vec<u32>,
    page_tables: Vec<PageTable>,
}

impl Group {
    fn start(table: PageTable) -> Self {
        let width = table.width();
        let header_detected = table.header.is_some();
        Self {
            header: table.header.clone().unwrap_or_else(|| synthetic_header(width)),
            header_detected,
            pages: vec![table.page],
            page_tables: vec![table],
        }
    }

    fn accepts(&self, table: &PageTable) -> bool {
        let adjacent = self.pages.last().is_some_and(|p| p + 1 == table.page);
        adjacent
            && match &table.header {
                Some(header) => header_signature(header) == header_signature(&self.header),
                None => table.width() == self.header.len(),
            }
    }

    fn push(&mut self, table: PageTable) {
        self.pages.push(table.page);
        self.page_tables.push(table);
    }

    fn finish(self, kind: StrategyKind) -> StitchedTable {
        let width = self.header.len();
        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut confidence = 1.0_f64;
        // Headerless continuation pages reuse the last header's columns.
        let mut columns: Vec<(usize, usize)> = Vec::new();
        for table in self.page_tables {
            if table.columns.len() == width {
                columns = table.columns;
            }
            let mut shaped = Vec::with_capacity(table.rows.len());
            let mut consistent = 0;
            for raw in table.rows {
                let (row, fits) = shape_row(raw, width, &columns, shaped.last().or(rows.last()));
                consistent += usize::from(fits);
                shaped.push(row);
            }
            let signals = TableSignals::measure(&self.header, self.header_detected, &shaped, consistent);
            confidence = confidence.min(signals.confidence(kind));
            rows.extend(shaped);
        }
        StitchedTable {
            pages: self.pages,
            header: self.header,
            header_detected: self.header_detected,
            rows,
            confidence,
        }
    }
}

/// Merge page tables that continue each other on adjacent pages, in document
/// order. A stitched table is only as confident as its weakest page.
pub fn stitch(tables: Vec<PageTable>, kind: StrategyKind) -> Vec<StitchedTable> {
    let mut groups: Vec<Group> = Vec::new();
    for table in tables {
        match groups.last_mut() {
            Some(group) if group.accepts(&table) => group.push(table),
            _ => groups.push(Group::start(table)),
        }
    }
    groups.into_iter().map(|g| g.finish(kind)).collect()
}
