use scdp_core::{ContentHint, ExtractionResult, RawDocument, StrategyKind};
use scraper::{ElementRef, Html, Selector};

use crate::extract::{ExtractionStrategy, StrategyOutcome, TableSignals};
use crate::text::{clean_cell, looks_numeric};

const MAX_SPAN: usize = 1000;

/// Tables read straight from the DOM. Cheapest and most reliable strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlTableStrategy;

/// One `<table>` flattened into a rectangular grid.
#[derive(Debug, Clone, PartialEq)]
pub struct HtmlGrid {
    pub header: Option<Vec<String>>,
    pub rows: Vec<Vec<String>>,
    /// Rows whose cell count already matched the grid width before padding.
    pub consistent_rows: usize,
}

fn span_attr(cell: ElementRef<'_>, name: &str) -> usize {
    cell.value()
        .attr(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_SPAN)
}

fn cell_text(cell: ElementRef<'_>) -> String {
    clean_cell(&cell.text().collect::<Vec<_>>().join(" "), false)
}

fn take_carry(carry: &mut [Option<(String, usize)>], col: usize) -> Option<String> {
    let slot = carry.get_mut(col)?;
    let (text, left) = slot.as_mut()?;
    let text = text.clone();
    *left -= 1;
    if *left == 0 {
        *slot = None;
    }
    Some(text)
}

/// Expand `colspan`/`rowspan` so every covered position holds the spanning
/// cell's text. Returns each row alongside whether it contained a `<th>`.
fn expand_rows(table: ElementRef<'_>, tr: &Selector) -> Vec<(Vec<String>, bool)> {
    let mut carry: Vec<Option<(String, usize)>> = Vec::new();
    let mut out = Vec::new();

    for row_el in table.select(tr) {
        let mut cells = row_el
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|e| matches!(e.value().name(), "td" | "th"));
        let mut row = Vec::new();
        let mut has_th = false;
        let mut col = 0;

        loop {
            if let Some(text) = take_carry(&mut carry, col) {
                row.push(text);
                col += 1;
                continue;
            }
            let Some(cell) = cells.next() else { break };
            has_th |= cell.value().name() == "th";
            let colspan = span_attr(cell, "colspan");
            let rowspan = span_attr(cell, "rowspan");
            let text = cell_text(cell);
            for _ in 0..colspan {
                if rowspan > 1 {
                    if carry.len() <= col {
                        carry.resize(col + 1, None);
                    }
                    carry[col] = Some((text.clone(), rowspan - 1));
                }
                row.push(text.clone());
                col += 1;
            }
        }
        for c in col..carry.len() {
            row.push(take_carry(&mut carry, c).unwrap_or_default());
        }
        while row.last().is_some_and(|c| c.is_empty()) && row.len() > col {
            row.pop();
        }

        if row.iter().any(|c| !c.is_empty()) {
            out.push((row, has_th));
        }
    }
    out
}

fn looks_like_header(row: &[String], next: Option<&Vec<String>>) -> bool {
    let all_text = row.iter().all(|c| !c.is_empty() && !looks_numeric(c));
    let next_has_numbers = next.is_some_and(|n| n.iter().any(|c| looks_numeric(c)));
    all_text && next_has_numbers
}

pub fn parse_tables(html: &str) -> Vec<HtmlGrid> {
    let document = Html::parse_document(html);
    let (Ok(table_sel), Ok(tr_sel)) = (Selector::parse("table"), Selector::parse("tr")) else {
        return Vec::new();
    };

    document
        .select(&table_sel)
        .filter_map(|table| {
            let mut rows = expand_rows(table, &tr_sel);
            if rows.is_empty() {
                return None;
            }
            let header_detected = rows[0].1 || looks_like_header(&rows[0].0, rows.get(1).map(|r| &r.0));
            let header = header_detected.then(|| rows.remove(0).0);
            let mut rows: Vec<Vec<String>> = rows
                .into_iter()
                .filter(|(_, is_th)| !*is_th)
                .map(|(r, _)| r)
                .collect();
            if rows.is_empty() {
                return None;
            }
            let width = header
                .as_ref()
                .map(Vec::len)
                .into_iter()
                .chain(rows.iter().map(Vec::len))
                .max()
                .unwrap_or(0);
            let consistent_rows = rows.iter().filter(|r| r.len() == width).count();
            for row in &mut rows {
                row.resize(width, String::new());
            }
            let header = header.map(|mut h| {
                h.resize(width, String::new());
                h
            });
            Some(HtmlGrid {
                header,
                rows,
                consistent_rows,
            })
        })
        .collect()
}

pub fn synthetic_header(width: usize) -> Vec<String> {
    (1..=width).map(|i| format!("column_{i}")).collect()
}

impl ExtractionStrategy for HtmlTableStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HtmlTable
    }

    fn applies_to(&self, document: &RawDocument) -> bool {
        match document.effective_hint() {
            ContentHint::Html => true,
            ContentHint::Pdf => false,
            ContentHint::Unknown => document
                .body()
                .iter()
                .find(|b| !b.is_ascii_whitespace())
                .is_some_and(|b| *b == b'<'),
        }
    }

    fn extract(&self, document: &RawDocument) -> StrategyOutcome {
        let html = String::from_utf8_lossy(document.body());
        let grids = parse_tables(&html);
        if grids.is_empty() {
            return StrategyOutcome::Declined("no <table> with data rows".to_string());
        }

        let candidates = grids
            .into_iter()
            .enumerate()
            .map(|(region, grid)| {
                let width = grid.rows.first().map(Vec::len).unwrap_or(0);
                let header_detected = grid.header.is_some();
                let header = grid.header.unwrap_or_else(|| synthetic_header(width));
                let signals = TableSignals::measure(&header, header_detected, &grid.rows, grid.consistent_rows);
                ExtractionResult {
                    source: document.source().clone(),
                    strategy: StrategyKind::HtmlTable,
                    region,
                    pages: document.source().page_index.map(|i| i + 1).into_iter().collect(),
                    header,
                    rows: grid.rows,
                    confidence: signals.confidence(StrategyKind::HtmlTable),
                    retrieved_at: document.retrieved_at(),
                }
            })
            .collect();
        StrategyOutcome::Candidates(candidates)
    }
}
