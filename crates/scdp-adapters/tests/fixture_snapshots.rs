use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use scdp_adapters::{CommandOcrEngine, Extractor, OcrEngine};
use scdp_core::{ContentHint, ExtractionResult, RawDocument, SourceRef, StrategyKind};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct GoldenTable {
    strategy: StrategyKind,
    region: usize,
    pages: Vec<u32>,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
    confidence: f64,
}

fn fixture_dir(source_id: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source_id)
        .join("sample")
}

fn read_snapshot(source_id: &str) -> Vec<GoldenTable> {
    let text = fs::read_to_string(fixture_dir(source_id).join("snapshot.json")).expect("read snapshot");
    serde_json::from_str(&text).expect("parse snapshot")
}

fn assert_matches_snapshot(actual: &[ExtractionResult], expected: &[GoldenTable]) {
    assert_eq!(actual.len(), expected.len(), "table count");
    for (a, e) in actual.iter().zip(expected) {
        assert_eq!(a.strategy, e.strategy);
        assert_eq!(a.region, e.region);
        assert_eq!(a.pages, e.pages);
        assert_eq!(a.header, e.header);
        assert_eq!(a.rows, e.rows);
        assert!((a.confidence - e.confidence).abs() < 1e-9, "confidence {} != {}", a.confidence, e.confidence);
    }
}

fn retrieved_at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap()
}

#[test]
fn golden_html_listing_alrajhi_main() {
    let body = fs::read(fixture_dir("alrajhi-main").join("listing.html")).expect("read listing");
    let source = SourceRef::new(
        "alrajhi-main",
        "https://www.argaam.com/ar/company/shariahcompaniesbyinstitution/1?marketid=3",
        ContentHint::Html,
    )
    .with_page(None, 0)
    .with_hints(Some("main".into()), Some("alrajhi".into()));
    let document = RawDocument::new(source, 200, Some("text/html; charset=utf-8".into()), body, retrieved_at());

    let results = Extractor::standard(0.6, None).extract(&document).expect("extract");
    assert_matches_snapshot(&results, &read_snapshot("alrajhi-main"));
}

#[cfg(unix)]
#[test]
fn golden_scanned_report_osaimi_parallel() {
    // `cat` stands in for an OCR engine: the fixture already holds recognized text.
    let body = fs::read(fixture_dir("osaimi-parallel").join("report.txt")).expect("read report");
    let source = SourceRef::new("osaimi-parallel", "https://example.test/osaimi-parallel.pdf", ContentHint::Pdf);
    let document = RawDocument::new(source, 200, Some("application/pdf".into()), body, retrieved_at());

    let ocr: Arc<dyn OcrEngine> = Arc::new(CommandOcrEngine::from_command_line("cat").expect("command"));
    let results = Extractor::standard(0.6, Some(ocr)).extract(&document).expect("extract");
    assert_matches_snapshot(&results, &read_snapshot("osaimi-parallel"));

    // Rows with blank sector or purification cells keep their own ticker.
    let tickers: HashSet<&str> = results[0].rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(tickers.len(), results[0].rows.len());
}
