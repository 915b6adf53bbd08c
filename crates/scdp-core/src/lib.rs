//! Core domain model for SCDP: source references, fetched documents,
//! extraction candidates, canonical records and dataset snapshots.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "scdp-core";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// What the locator believes a document to be before it is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentHint {
    Html,
    Pdf,
    Unknown,
}

impl ContentHint {
    pub fn from_content_type(content_type: &str) -> Self {
        let lower = content_type.to_ascii_lowercase();
        if lower.contains("pdf") {
            Self::Pdf
        } else if lower.contains("html") || lower.contains("xml") {
            Self::Html
        } else {
            Self::Unknown
        }
    }

    pub fn from_url(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        if path.to_ascii_lowercase().ends_with(".pdf") {
            Self::Pdf
        } else {
            Self::Unknown
        }
    }
}

/// One document to fetch. Produced only by the locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub source_id: String,
    pub url: String,
    pub parent: Option<String>,
    pub page_index: Option<u32>,
    pub content_hint: ContentHint,
    pub market_hint: Option<String>,
    pub board_hint: Option<String>,
}

impl SourceRef {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>, content_hint: ContentHint) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            parent: None,
            page_index: None,
            content_hint,
            market_hint: None,
            board_hint: None,
        }
    }

    pub fn with_page(mut self, parent: Option<String>, page_index: u32) -> Self {
        self.parent = parent;
        self.page_index = Some(page_index);
        self
    }

    pub fn with_hints(mut self, market: Option<String>, board: Option<String>) -> Self {
        self.market_hint = market;
        self.board_hint = board;
        self
    }
}

/// Fetched payload plus transport metadata. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    source: SourceRef,
    retrieved_at: DateTime<Utc>,
    content_hash: String,
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

impl RawDocument {
    pub fn new(
        source: SourceRef,
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            content_hash: sha256_hex(&body),
            source,
            retrieved_at,
            status,
            content_type,
            body,
        }
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    pub fn retrieved_at(&self) -> DateTime<Utc> {
        self.retrieved_at
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Effective shape: the server's content type wins over the locator hint,
    /// and PDF magic bytes win over both.
    pub fn effective_hint(&self) -> ContentHint {
        if self.body.starts_with(b"%PDF-") {
            return ContentHint::Pdf;
        }
        match self.content_type.as_deref().map(ContentHint::from_content_type) {
            Some(ContentHint::Unknown) | None => match self.source.content_hint {
                ContentHint::Unknown => ContentHint::from_url(&self.source.url),
                hint => hint,
            },
            Some(hint) => hint,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    HtmlTable,
    PdfText,
    PdfOcr,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HtmlTable => "html_table",
            Self::PdfText => "pdf_text",
            Self::PdfOcr => "pdf_ocr",
        }
    }
}

/// One candidate table pulled out of a raw document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub source: SourceRef,
    pub strategy: StrategyKind,
    pub region: usize,
    pub pages: Vec<u32>,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub confidence: f64,
    pub retrieved_at: DateTime<Utc>,
}

impl ExtractionResult {
    /// Normalized header tokens, used to decide whether two candidates describe
    /// the same logical table.
    pub fn header_signature(&self) -> String {
        header_signature(&self.header)
    }
}

pub fn header_signature(header: &[String]) -> String {
    header
        .iter()
        .map(|h| {
            h.split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase()
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Canonical normalized unit. Every field is always serialized; absent data is `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: String,
    pub ticker: String,
    pub name: String,
    pub market: String,
    pub certifying_board: String,
    pub sector: Option<String>,
    pub subsector: Option<String>,
    pub year: Option<i32>,
    pub metric_values: BTreeMap<String, Option<f64>>,
    pub attributes: BTreeMap<String, String>,
    pub source_ref: String,
    pub extracted_at: DateTime<Utc>,
    pub confidence: f64,
}

impl Record {
    pub fn make_identifier(ticker: &str, board_key: &str) -> String {
        format!("{ticker}@{board_key}")
    }

    /// Content fields compared by the change detector, flattened to dotted names.
    pub fn comparable_fields(&self) -> BTreeMap<String, JsonValue> {
        let mut out = BTreeMap::new();
        out.insert("ticker".to_string(), JsonValue::from(self.ticker.clone()));
        out.insert("name".to_string(), JsonValue::from(self.name.clone()));
        out.insert("market".to_string(), JsonValue::from(self.market.clone()));
        out.insert(
            "certifying_board".to_string(),
            JsonValue::from(self.certifying_board.clone()),
        );
        out.insert("sector".to_string(), option_json(self.sector.clone()));
        out.insert("subsector".to_string(), option_json(self.subsector.clone()));
        out.insert("year".to_string(), option_json(self.year));
        for (key, value) in &self.metric_values {
            out.insert(format!("metric_values.{key}"), option_json(*value));
        }
        for (key, value) in &self.attributes {
            out.insert(format!("attributes.{key}"), JsonValue::from(value.clone()));
        }
        out
    }
}

fn option_json<T: Into<JsonValue>>(value: Option<T>) -> JsonValue {
    value.map(Into::into).unwrap_or(JsonValue::Null)
}

#[derive(Debug, Error, PartialEq)]
pub enum DatasetError {
    #[error("duplicate identifier {0} in dataset")]
    DuplicateIdentifier(String),
    #[error("metric {metric} of {identifier} is not a finite decimal")]
    NonFiniteMetric { identifier: String, metric: String },
}

/// Ordered, deduplicated snapshot of records produced by one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    generated_at: DateTime<Utc>,
    taxonomy_version: u32,
    checksum: String,
    records: Vec<Record>,
}

impl Dataset {
    pub fn from_records(
        mut records: Vec<Record>,
        generated_at: DateTime<Utc>,
        taxonomy_version: u32,
    ) -> Result<Self, DatasetError> {
        records.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.identifier.as_str()) {
                return Err(DatasetError::DuplicateIdentifier(record.identifier.clone()));
            }
            for (metric, value) in &record.metric_values {
                if value.is_some_and(|v| !v.is_finite()) {
                    return Err(DatasetError::NonFiniteMetric {
                        identifier: record.identifier.clone(),
                        metric: metric.clone(),
                    });
                }
            }
        }
        let checksum = Self::checksum_of(&records);
        Ok(Self {
            generated_at,
            taxonomy_version,
            checksum,
            records,
        })
    }

    /// SHA-256 over the compact canonical JSON of the sorted records.
    pub fn checksum_of(records: &[Record]) -> String {
        let canonical = serde_json::to_vec(records).unwrap_or_default();
        sha256_hex(&canonical)
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn taxonomy_version(&self) -> u32 {
        self.taxonomy_version
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identifier: &str) -> Option<&Record> {
        self.records
            .binary_search_by(|r| r.identifier.as_str().cmp(identifier))
            .ok()
            .map(|idx| &self.records[idx])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub identifier: String,
    pub field: String,
    pub old: JsonValue,
    pub new: JsonValue,
}

/// Added/removed/changed summary between two dataset generations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Delta {
    pub added: Vec<Record>,
    pub removed: Vec<String>,
    pub changed: Vec<FieldChange>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub label_en: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Ticker prefixes that place an otherwise unlabelled row in this entry (markets only).
    #[serde(default)]
    pub ticker_prefixes: Vec<String>,
}

/// Closed, versioned classification vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub version: u32,
    pub markets: Vec<TaxonomyEntry>,
    pub certifying_boards: Vec<TaxonomyEntry>,
    #[serde(default)]
    pub sectors: Vec<TaxonomyEntry>,
}

impl Taxonomy {
    pub fn market(&self, key: &str) -> Option<&TaxonomyEntry> {
        self.markets.iter().find(|e| e.key == key)
    }

    pub fn board(&self, key: &str) -> Option<&TaxonomyEntry> {
        self.certifying_boards.iter().find(|e| e.key == key)
    }

    pub fn sector(&self, key: &str) -> Option<&TaxonomyEntry> {
        self.sectors.iter().find(|e| e.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap()
    }

    fn record(ticker: &str, board: &str) -> Record {
        Record {
            identifier: Record::make_identifier(ticker, board),
            ticker: ticker.to_string(),
            name: format!("Company {ticker}"),
            market: "main".to_string(),
            certifying_board: board.to_string(),
            sector: None,
            subsector: None,
            year: None,
            metric_values: BTreeMap::new(),
            attributes: BTreeMap::new(),
            source_ref: "https://example.test/list".to_string(),
            extracted_at: ts(),
            confidence: 0.9,
        }
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn dataset_sorts_and_rejects_duplicates() {
        let ds = Dataset::from_records(vec![record("2222", "alrajhi"), record("1120", "alrajhi")], ts(), 1)
            .unwrap();
        let ids: Vec<_> = ds.records().iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["1120@alrajhi", "2222@alrajhi"]);
        assert!(ds.get("2222@alrajhi").is_some());

        let err = Dataset::from_records(vec![record("1120", "alrajhi"), record("1120", "alrajhi")], ts(), 1)
            .unwrap_err();
        assert_eq!(err, DatasetError::DuplicateIdentifier("1120@alrajhi".into()));
    }

    #[test]
    fn dataset_rejects_non_finite_metrics() {
        let mut r = record("1120", "alrajhi");
        r.metric_values.insert("purification_amount".into(), Some(f64::NAN));
        assert!(matches!(
            Dataset::from_records(vec![r], ts(), 1),
            Err(DatasetError::NonFiniteMetric { .. })
        ));
    }

    #[test]
    fn checksum_ignores_input_order() {
        let a = Dataset::from_records(vec![record("1", "b"), record("2", "b")], ts(), 1).unwrap();
        let b = Dataset::from_records(vec![record("2", "b"), record("1", "b")], ts(), 1).unwrap();
        assert_eq!(a.checksum(), b.checksum());
    }

    #[test]
    fn record_json_keeps_null_fields() {
        let json = serde_json::to_value(record("1120", "alrajhi")).unwrap();
        let obj = json.as_object().unwrap();
        for key in ["sector", "subsector", "year", "metric_values", "extracted_at"] {
            assert!(obj.contains_key(key), "missing {key}");
        }
        assert!(obj["sector"].is_null());
    }

    #[test]
    fn effective_hint_prefers_magic_bytes() {
        let src = SourceRef::new("s", "https://example.test/report", ContentHint::Html);
        let doc = RawDocument::new(src, 200, Some("text/html".into()), b"%PDF-1.5 ...".to_vec(), ts());
        assert_eq!(doc.effective_hint(), ContentHint::Pdf);
        assert_eq!(ContentHint::from_url("https://x.test/a.PDF?x=1"), ContentHint::Pdf);
    }
}
