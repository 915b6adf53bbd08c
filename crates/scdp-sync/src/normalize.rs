//! Header mapping, value coercion, taxonomy classification and
//! deduplication: everything between an extracted table and a `Record`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use chrono::{Datelike, NaiveDate};
use scdp_adapters::text::{collapse_whitespace, fold_digits, fold_presentation_forms, looks_like_ticker, normalize_arabic};
use scdp_core::{ExtractionResult, Record, Taxonomy, TaxonomyEntry};
use serde::Serialize;
use strsim::jaro_winkler;
use thiserror::Error;

use crate::config::AliasTable;

/// Comparison key for headers and taxonomy labels: presentation forms and
/// harakat removed, alef/ya/ta marbuta variants folded, lowercase, punctuation
/// replaced by spaces.
pub fn match_key(text: &str) -> String {
    let folded = normalize_arabic(&fold_presentation_forms(text));
    let mapped: String = folded
        .chars()
        .map(|c| match c {
            'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
            'ى' => 'ي',
            'ة' => 'ه',
            c if c.is_alphanumeric() => c,
            _ => ' ',
        })
        .flat_map(char::to_lowercase)
        .collect();
    collapse_whitespace(&mapped)
}

fn slug(text: &str) -> String {
    match_key(text).replace(' ', "_")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Ticker,
    Name,
    Market,
    CertifyingBoard,
    Sector,
    Subsector,
    Year,
}

impl RecordField {
    pub fn from_key(key: &str) -> Option<Self> {
        Some(match key {
            "ticker" => Self::Ticker,
            "name" => Self::Name,
            "market" => Self::Market,
            "certifying_board" => Self::CertifyingBoard,
            "sector" => Self::Sector,
            "subsector" => Self::Subsector,
            "year" => Self::Year,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnTarget {
    Field(RecordField),
    Metric(String),
    Attribute(String),
}

/// Resolves header text to record fields and metric keys.
#[derive(Debug, Clone)]
pub struct HeaderMapper {
    entries: Vec<(String, ColumnTarget)>,
    exact: HashMap<String, usize>,
    similarity_threshold: f64,
}

impl HeaderMapper {
    pub fn new(aliases: &AliasTable) -> Self {
        let mut entries = Vec::new();
        for (key, names) in &aliases.fields {
            if let Some(field) = RecordField::from_key(key) {
                for name in std::iter::once(key).chain(names) {
                    entries.push((match_key(name), ColumnTarget::Field(field)));
                }
            }
        }
        for (key, names) in &aliases.metrics {
            for name in std::iter::once(key).chain(names) {
                entries.push((match_key(name), ColumnTarget::Metric(key.clone())));
            }
        }
        entries.retain(|(k, _)| !k.is_empty());

        let mut exact = HashMap::new();
        for (idx, (k, _)) in entries.iter().enumerate() {
            exact.entry(k.clone()).or_insert(idx);
        }
        Self {
            entries,
            exact,
            similarity_threshold: aliases.similarity_threshold,
        }
    }

    pub fn resolve(&self, header: &str) -> Option<ColumnTarget> {
        let key = match_key(header);
        if key.is_empty() {
            return None;
        }
        if let Some(idx) = self.exact.get(&key) {
            return Some(self.entries[*idx].1.clone());
        }
        let mut best: Option<(f64, usize)> = None;
        for (idx, (alias, _)) in self.entries.iter().enumerate() {
            let score = jaro_winkler(&key, alias);
            if score >= self.similarity_threshold && best.map_or(true, |(s, _)| score > s) {
                best = Some((score, idx));
            }
        }
        best.map(|(_, idx)| self.entries[idx].1.clone())
    }

    /// One target per column. A field or metric claimed twice keeps the first
    /// column; later ones fall through to the unmapped rules.
    pub fn map_columns(&self, header: &[String], rows: &[Vec<String>]) -> Vec<ColumnTarget> {
        let mut claimed_fields = HashSet::new();
        let mut claimed_keys = HashSet::new();
        let mut resolved = vec![false; header.len()];
        let mut targets = Vec::with_capacity(header.len());

        for (idx, name) in header.iter().enumerate() {
            let target = match self.resolve(name) {
                Some(ColumnTarget::Field(f)) if claimed_fields.insert(f) => Some(ColumnTarget::Field(f)),
                Some(ColumnTarget::Metric(m)) if claimed_keys.insert(m.clone()) => Some(ColumnTarget::Metric(m)),
                _ => None,
            };
            resolved[idx] = target.is_some();
            targets.push(target.unwrap_or_else(|| unmapped_target(idx, name, rows, &mut claimed_keys)));
        }

        if !claimed_fields.contains(&RecordField::Ticker) {
            if let Some(idx) = (0..targets.len()).find(|i| !resolved[*i] && column_is_ticker(rows, *i)) {
                targets[idx] = ColumnTarget::Field(RecordField::Ticker);
                resolved[idx] = true;
            }
        }
        if !claimed_fields.contains(&RecordField::Name) {
            if let Some(idx) = (0..targets.len()).find(|i| {
                !resolved[*i] && matches!(targets[*i], ColumnTarget::Attribute(_)) && column_has_words(rows, *i)
            }) {
                targets[idx] = ColumnTarget::Field(RecordField::Name);
            }
        }
        targets
    }
}

fn column_cells(rows: &[Vec<String>], idx: usize) -> impl Iterator<Item = &str> {
    rows.iter()
        .filter_map(move |r| r.get(idx))
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
}

fn unmapped_target(
    idx: usize,
    header: &str,
    rows: &[Vec<String>],
    claimed: &mut HashSet<String>,
) -> ColumnTarget {
    let mut key = slug(header);
    if key.is_empty() {
        key = format!("column_{}", idx + 1);
    }
    if !claimed.insert(key.clone()) {
        key = format!("{key}_{}", idx + 1);
        claimed.insert(key.clone());
    }
    let (total, numeric) = column_cells(rows, idx).fold((0usize, 0usize), |(t, n), cell| {
        (t + 1, n + usize::from(matches!(parse_decimal(cell), Ok(Some(_)))))
    });
    if total > 0 && numeric * 2 >= total {
        ColumnTarget::Metric(key)
    } else {
        ColumnTarget::Attribute(key)
    }
}

fn column_is_ticker(rows: &[Vec<String>], idx: usize) -> bool {
    let mut any = false;
    for cell in column_cells(rows, idx) {
        if !looks_like_ticker(cell) {
            return false;
        }
        any = true;
    }
    any
}

fn column_has_words(rows: &[Vec<String>], idx: usize) -> bool {
    column_cells(rows, idx).any(|c| c.chars().any(char::is_alphabetic))
}

const CURRENCY_TOKENS: &[&str] = &["ر.س", "ريال", "\u{FDFC}", "SAR", "USD", "$", "%", "\u{066A}"];

/// Locale-aware decimal parsing. Empty cells and dashes are `Ok(None)`;
/// anything left over after stripping currency and separators is an error.
pub fn parse_decimal(raw: &str) -> Result<Option<f64>, String> {
    let mut s = fold_digits(raw.trim());
    if s.is_empty() || matches!(s.as_str(), "-" | "–" | "—" | "n/a" | "N/A") {
        return Ok(None);
    }
    let mut negative = false;
    if s.starts_with('(') && s.ends_with(')') {
        negative = true;
        s = s[1..s.len() - 1].to_string();
    }
    for token in CURRENCY_TOKENS {
        s = s.replace(token, "");
    }
    s.retain(|c| !c.is_whitespace());
    if let Some(rest) = s.strip_prefix('-') {
        negative = !negative;
        s = rest.to_string();
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest.to_string();
    }
    if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return Err(format!("not a decimal: {raw:?}"));
    }

    let canonical = match (s.rfind('.'), s.rfind(',')) {
        (Some(dot), Some(comma)) if dot > comma => s.replace(',', ""),
        (Some(_), Some(_)) => s.replace('.', "").replace(',', "."),
        (None, Some(comma)) => {
            let decimals = s.len() - comma - 1;
            if s.matches(',').count() == 1 && decimals != 3 {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        (Some(_), None) if s.matches('.').count() > 1 => s.replace('.', ""),
        _ => s,
    };
    let value: f64 = canonical
        .parse()
        .map_err(|_| format!("not a decimal: {raw:?}"))?;
    if !value.is_finite() {
        return Err(format!("not a finite decimal: {raw:?}"));
    }
    Ok(Some(if negative { -value } else { value }))
}

/// `YYYY`, `YYYY-MM-DD` or `DD/MM/YYYY`.
pub fn parse_year(raw: &str) -> Result<Option<i32>, String> {
    let s = fold_digits(raw.trim());
    if s.is_empty() {
        return Ok(None);
    }
    if s.len() == 4 && s.chars().all(|c| c.is_ascii_digit()) {
        return s
            .parse::<i32>()
            .map(Some)
            .map_err(|e| format!("bad year {raw:?}: {e}"));
    }
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&s, "%d/%m/%Y"))
        .map(|d| Some(d.year()))
        .map_err(|_| format!("unrecognized date {raw:?}"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Market,
    CertifyingBoard,
    Sector,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Market => "market",
            Self::CertifyingBoard => "certifying board",
            Self::Sector => "sector",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassificationError {
    #[error("{dimension} {value:?} matches no taxonomy entry")]
    Unknown { dimension: Dimension, value: String },
    #[error("{dimension} {value:?} matches several taxonomy entries: {candidates:?}")]
    Ambiguous {
        dimension: Dimension,
        value: String,
        candidates: Vec<String>,
    },
    #[error("no {dimension} in the row, the source or the ticker prefix")]
    Unresolved { dimension: Dimension },
}

fn entry_matches(entry: &TaxonomyEntry, key: &str) -> bool {
    std::iter::once(&entry.key)
        .chain(std::iter::once(&entry.label))
        .chain(entry.label_en.iter())
        .chain(entry.aliases.iter())
        .any(|name| match_key(name) == key)
}

/// Exactly one entry must match by key, label, English label or alias.
pub fn resolve_entry<'t>(
    entries: &'t [TaxonomyEntry],
    dimension: Dimension,
    value: &str,
) -> Result<&'t TaxonomyEntry, ClassificationError> {
    let key = match_key(value);
    let matches: Vec<&TaxonomyEntry> = entries.iter().filter(|e| entry_matches(e, &key)).collect();
    match matches.as_slice() {
        [one] => Ok(*one),
        [] => Err(ClassificationError::Unknown {
            dimension,
            value: value.to_string(),
        }),
        many => Err(ClassificationError::Ambiguous {
            dimension,
            value: value.to_string(),
            candidates: many.iter().map(|e| e.key.clone()).collect(),
        }),
    }
}

/// Cell value first, then the source hint, then (markets only) ticker prefixes.
pub fn classify_market<'t>(
    taxonomy: &'t Taxonomy,
    cell: Option<&str>,
    hint: Option<&str>,
    ticker: &str,
) -> Result<&'t TaxonomyEntry, ClassificationError> {
    if let Some(value) = cell.or(hint) {
        return resolve_entry(&taxonomy.markets, Dimension::Market, value);
    }
    let by_prefix: Vec<&TaxonomyEntry> = taxonomy
        .markets
        .iter()
        .filter(|e| e.ticker_prefixes.iter().any(|p| !p.is_empty() && ticker.starts_with(p.as_str())))
        .collect();
    match by_prefix.as_slice() {
        [one] => Ok(*one),
        [] => Err(ClassificationError::Unresolved {
            dimension: Dimension::Market,
        }),
        many => Err(ClassificationError::Ambiguous {
            dimension: Dimension::Market,
            value: ticker.to_string(),
            candidates: many.iter().map(|e| e.key.clone()).collect(),
        }),
    }
}

pub fn classify_board<'t>(
    taxonomy: &'t Taxonomy,
    cell: Option<&str>,
    hint: Option<&str>,
) -> Result<&'t TaxonomyEntry, ClassificationError> {
    match cell.or(hint) {
        Some(value) => resolve_entry(&taxonomy.certifying_boards, Dimension::CertifyingBoard, value),
        None => Err(ClassificationError::Unresolved {
            dimension: Dimension::CertifyingBoard,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizationError {
    #[error("row {row} of {source_url}: no ticker")]
    MissingTicker { source_url: String, row: usize },
    #[error("row {row} of {source_url}: no company name")]
    MissingName { source_url: String, row: usize },
    #[error("row {row} of {source_url}: {error}")]
    Classification {
        source_url: String,
        row: usize,
        error: ClassificationError,
    },
}

/// A single value that could not be coerced; the field is stored as null.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoercionWarning {
    pub source_url: String,
    pub row: usize,
    pub column: String,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedRows {
    pub outcomes: Vec<Result<Record, NormalizationError>>,
    pub warnings: Vec<CoercionWarning>,
}

impl NormalizedRows {
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.outcomes.iter().filter_map(|o| o.as_ref().ok())
    }
}

fn non_empty(cell: Option<&String>) -> Option<&str> {
    cell.map(|c| c.trim()).filter(|c| !c.is_empty())
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    taxonomy: Taxonomy,
    mapper: HeaderMapper,
}

impl Normalizer {
    pub fn new(taxonomy: Taxonomy, aliases: &AliasTable) -> Self {
        Self {
            taxonomy,
            mapper: HeaderMapper::new(aliases),
        }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn normalize(&self, result: &ExtractionResult) -> NormalizedRows {
        let targets = self.mapper.map_columns(&result.header, &result.rows);
        let mut out = NormalizedRows::default();
        for (idx, row) in result.rows.iter().enumerate() {
            let outcome = self.normalize_row(result, &targets, idx + 1, row, &mut out.warnings);
            out.outcomes.push(outcome);
        }
        out
    }

    fn normalize_row(
        &self,
        result: &ExtractionResult,
        targets: &[ColumnTarget],
        row_no: usize,
        row: &[String],
        warnings: &mut Vec<CoercionWarning>,
    ) -> Result<Record, NormalizationError> {
        let source_url = &result.source.url;
        let field = |f: RecordField| {
            targets
                .iter()
                .position(|t| *t == ColumnTarget::Field(f))
                .and_then(|i| non_empty(row.get(i)))
        };
        let classification = |error| NormalizationError::Classification {
            source_url: source_url.clone(),
            row: row_no,
            error,
        };

        let ticker: String = field(RecordField::Ticker)
            .map(|t| fold_digits(t).chars().filter(|c| !c.is_whitespace()).collect())
            .unwrap_or_default();
        if ticker.is_empty() {
            return Err(NormalizationError::MissingTicker {
                source_url: source_url.clone(),
                row: row_no,
            });
        }
        let name = field(RecordField::Name).map(normalize_arabic).unwrap_or_default();
        if name.is_empty() {
            return Err(NormalizationError::MissingName {
                source_url: source_url.clone(),
                row: row_no,
            });
        }

        let market = classify_market(
            &self.taxonomy,
            field(RecordField::Market),
            result.source.market_hint.as_deref(),
            &ticker,
        )
        .map_err(classification)?;
        let board = classify_board(
            &self.taxonomy,
            field(RecordField::CertifyingBoard),
            result.source.board_hint.as_deref(),
        )
        .map_err(classification)?;

        let sector = field(RecordField::Sector).map(|s| {
            resolve_entry(&self.taxonomy.sectors, Dimension::Sector, s)
                .map(|e| e.key.clone())
                .unwrap_or_else(|_| normalize_arabic(s))
        });
        let subsector = field(RecordField::Subsector).map(normalize_arabic);

        let mut warn = |column: &str, value: &str, reason: String| {
            warnings.push(CoercionWarning {
                source_url: source_url.clone(),
                row: row_no,
                column: column.to_string(),
                value: value.to_string(),
                reason,
            });
        };

        let year = match field(RecordField::Year) {
            Some(raw) => parse_year(raw).unwrap_or_else(|reason| {
                warn("year", raw, reason);
                None
            }),
            None => None,
        };

        let mut metric_values = BTreeMap::new();
        let mut attributes = BTreeMap::new();
        for (idx, target) in targets.iter().enumerate() {
            let cell = row.get(idx).map(|c| c.trim()).unwrap_or_default();
            match target {
                ColumnTarget::Metric(key) => {
                    let value = parse_decimal(cell).unwrap_or_else(|reason| {
                        warn(key, cell, reason);
                        None
                    });
                    metric_values.insert(key.clone(), value);
                }
                ColumnTarget::Attribute(key) if !cell.is_empty() => {
                    attributes.insert(key.clone(), normalize_arabic(cell));
                }
                _ => {}
            }
        }

        Ok(Record {
            identifier: Record::make_identifier(&ticker, &board.key),
            ticker,
            name,
            market: market.key.clone(),
            certifying_board: board.key.clone(),
            sector,
            subsector,
            year,
            metric_values,
            attributes,
            source_ref: source_url.clone(),
            extracted_at: result.retrieved_at,
            confidence: result.confidence,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscardedDuplicate {
    pub source_ref: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateAudit {
    pub identifier: String,
    pub kept_source: String,
    pub kept_confidence: f64,
    pub discarded: Vec<DiscardedDuplicate>,
}

/// Keep the highest-confidence record per identifier (earliest on ties) and
/// return the survivors sorted by identifier.
pub fn deduplicate(records: Vec<Record>) -> (Vec<Record>, Vec<DuplicateAudit>) {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in records {
        groups.entry(record.identifier.clone()).or_default().push(record);
    }

    let mut kept = Vec::with_capacity(groups.len());
    let mut audits = Vec::new();
    for (identifier, mut group) in groups {
        let best = group
            .iter()
            .enumerate()
            .fold(0, |best, (idx, r)| if r.confidence > group[best].confidence { idx } else { best });
        let winner = group.remove(best);
        if !group.is_empty() {
            audits.push(DuplicateAudit {
                identifier,
                kept_source: winner.source_ref.clone(),
                kept_confidence: winner.confidence,
                discarded: group
                    .into_iter()
                    .map(|r| DiscardedDuplicate {
                        source_ref: r.source_ref,
                        confidence: r.confidence,
                    })
                    .collect(),
            });
        }
        kept.push(winner);
    }
    (kept, audits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{load_aliases, load_taxonomy};
    use chrono::{TimeZone, Utc};
    use scdp_core::{ContentHint, SourceRef, StrategyKind};
    use std::path::Path;

    fn rules() -> (Taxonomy, AliasTable) {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules");
        (
            load_taxonomy(root.join("taxonomy.yaml")).unwrap(),
            load_aliases(root.join("aliases.yaml")).unwrap(),
        )
    }

    fn normalizer() -> Normalizer {
        let (taxonomy, aliases) = rules();
        Normalizer::new(taxonomy, &aliases)
    }

    fn table(header: &[&str], rows: &[&[&str]], market: Option<&str>, board: Option<&str>) -> ExtractionResult {
        ExtractionResult {
            source: SourceRef::new("alrajhi-main", "https://example.test/list", ContentHint::Html)
                .with_hints(market.map(String::from), board.map(String::from)),
            strategy: StrategyKind::HtmlTable,
            region: 0,
            pages: vec![1],
            header: header.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
            confidence: 0.95,
            retrieved_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        }
    }

    #[test]
    fn decimals_follow_locale_rules() {
        assert_eq!(parse_decimal("1,234.5"), Ok(Some(1234.5)));
        assert_eq!(parse_decimal("1.234,5"), Ok(Some(1234.5)));
        assert_eq!(parse_decimal("٠٫٠٥"), Ok(Some(0.05)));
        assert_eq!(parse_decimal("١٬٢٣٤٫٥"), Ok(Some(1234.5)));
        assert_eq!(parse_decimal("(0.12)"), Ok(Some(-0.12)));
        assert_eq!(parse_decimal("12.5 %"), Ok(Some(12.5)));
        assert_eq!(parse_decimal("0.35 ر.س"), Ok(Some(0.35)));
        assert_eq!(parse_decimal("SAR 1,000"), Ok(Some(1000.0)));
        assert_eq!(parse_decimal("0,5"), Ok(Some(0.5)));
        assert_eq!(parse_decimal(""), Ok(None));
        assert_eq!(parse_decimal("-"), Ok(None));
        assert!(parse_decimal("N.A.x").is_err());
    }

    #[test]
    fn years_accept_three_layouts() {
        assert_eq!(parse_year("2024"), Ok(Some(2024)));
        assert_eq!(parse_year("2023-12-31"), Ok(Some(2023)));
        assert_eq!(parse_year("31/12/2022"), Ok(Some(2022)));
        assert_eq!(parse_year("٢٠٢٤"), Ok(Some(2024)));
        assert!(parse_year("Q4").is_err());
    }

    #[test]
    fn headers_resolve_exactly_and_by_similarity() {
        let (_, aliases) = rules();
        let mapper = HeaderMapper::new(&aliases);
        assert_eq!(mapper.resolve("الرمز"), Some(ColumnTarget::Field(RecordField::Ticker)));
        assert_eq!(mapper.resolve("اسم الشركة"), Some(ColumnTarget::Field(RecordField::Name)));
        assert_eq!(
            mapper.resolve("نسبة التطهير"),
            Some(ColumnTarget::Metric("purification_amount".into()))
        );
        assert_eq!(
            mapper.resolve("Purification Amout"),
            Some(ColumnTarget::Metric("purification_amount".into()))
        );
        assert_eq!(mapper.resolve("Listing Date"), None);
    }

    #[test]
    fn unmapped_columns_become_metrics_or_attributes() {
        let (_, aliases) = rules();
        let mapper = HeaderMapper::new(&aliases);
        let header: Vec<String> = ["Code", "Company", "Free Float", "Notes"].iter().map(|s| s.to_string()).collect();
        let rows = vec![
            vec!["1120".to_string(), "Al Rajhi".into(), "12.5%".into(), "listed".into()],
            vec!["2222".to_string(), "Aramco".into(), "".into(), "".into()],
        ];
        let targets = mapper.map_columns(&header, &rows);
        assert_eq!(targets[2], ColumnTarget::Metric("free_float".into()));
        assert_eq!(targets[3], ColumnTarget::Attribute("notes".into()));
    }

    #[test]
    fn ticker_and_name_are_inferred_for_synthetic_headers() {
        let (_, aliases) = rules();
        let mapper = HeaderMapper::new(&aliases);
        let header: Vec<String> = ["column_1", "column_2"].iter().map(|s| s.to_string()).collect();
        let rows = vec![vec!["٤٠٠١".to_string(), "أسواق عبدالله العثيم".into()]];
        let targets = mapper.map_columns(&header, &rows);
        assert_eq!(
            targets,
            vec![ColumnTarget::Field(RecordField::Ticker), ColumnTarget::Field(RecordField::Name)]
        );
    }

    #[test]
    fn empty_purification_amount_normalizes_to_null() {
        let rows = normalizer().normalize(&table(
            &["الرمز", "الشركة", "نسبة التطهير"],
            &[&["2222", "أرامكو السعودية", ""]],
            Some("main"),
            Some("alrajhi"),
        ));
        assert!(rows.warnings.is_empty());
        let record = rows.outcomes[0].as_ref().unwrap();
        assert_eq!(record.identifier, "2222@alrajhi");
        assert_eq!(record.metric_values.get("purification_amount"), Some(&None));
        let json = serde_json::to_value(record).unwrap();
        assert!(json["metric_values"]["purification_amount"].is_null());
    }

    #[test]
    fn bad_values_become_null_with_a_warning() {
        let rows = normalizer().normalize(&table(
            &["Code", "Company", "Purification", "Year"],
            &[&["1120", "Al Rajhi", "n.a.", "FY24"]],
            Some("main"),
            Some("alrajhi"),
        ));
        let record = rows.outcomes[0].as_ref().unwrap();
        assert_eq!(record.metric_values["purification_amount"], None);
        assert_eq!(record.year, None);
        assert_eq!(rows.warnings.len(), 2);
        assert_eq!(rows.warnings[0].column, "year");
    }

    #[test]
    fn unknown_market_is_rejected_not_guessed() {
        let rows = normalizer().normalize(&table(
            &["Code", "Company", "Market"],
            &[&["1120", "Al Rajhi", "Bahrain Bourse"], &["9510", "NBM", "نمو"]],
            None,
            Some("osaimi"),
        ));
        assert!(matches!(
            &rows.outcomes[0],
            Err(NormalizationError::Classification {
                error: ClassificationError::Unknown { dimension: Dimension::Market, .. },
                ..
            })
        ));
        let nomu = rows.outcomes[1].as_ref().unwrap();
        assert_eq!(nomu.market, "parallel");
        assert_eq!(nomu.certifying_board, "osaimi");
    }

    #[test]
    fn market_falls_back_to_ticker_prefix() {
        let rows = normalizer().normalize(&table(
            &["Code", "Company"],
            &[&["9522", "Al Hasoob"], &["4190", "Jarir"]],
            None,
            Some("tanmiya"),
        ));
        let markets: Vec<_> = rows.records().map(|r| r.market.as_str()).collect();
        assert_eq!(markets, vec!["parallel", "main"]);
    }

    #[test]
    fn missing_board_fails_the_row() {
        let rows = normalizer().normalize(&table(&["Code", "Company"], &[&["1120", "Al Rajhi"]], Some("main"), None));
        assert!(matches!(
            &rows.outcomes[0],
            Err(NormalizationError::Classification {
                error: ClassificationError::Unresolved { dimension: Dimension::CertifyingBoard },
                ..
            })
        ));
    }

    #[test]
    fn sectors_resolve_through_taxonomy_or_keep_text() {
        let rows = normalizer().normalize(&table(
            &["الرمز", "الشركة", "القطاع"],
            &[&["1120", "مصرف الراجحي", "البنوك"], &["1111", "شركة", "قطاع جديد"]],
            Some("main"),
            Some("alrajhi"),
        ));
        let sectors: Vec<_> = rows.records().map(|r| r.sector.clone()).collect();
        assert_eq!(sectors, vec![Some("banks".to_string()), Some("قطاع جديد".to_string())]);
    }

    #[test]
    fn names_lose_diacritics() {
        let rows = normalizer().normalize(&table(
            &["Code", "Company"],
            &[&["1120", "مَصْرِف   الراجحي"]],
            Some("main"),
            Some("alrajhi"),
        ));
        assert_eq!(rows.records().next().unwrap().name, "مصرف الراجحي");
    }

    #[test]
    fn deduplicate_keeps_highest_confidence() {
        let n = normalizer();
        let mut low = table(&["Code", "Company"], &[&["1120", "Al Rajhi"]], Some("main"), Some("alrajhi"));
        low.confidence = 0.7;
        low.source.url = "https://example.test/scan.pdf".into();
        let high = table(&["Code", "Company"], &[&["1120", "Al Rajhi Bank"]], Some("main"), Some("alrajhi"));
        let records: Vec<Record> = n
            .normalize(&low)
            .records()
            .chain(n.normalize(&high).records())
            .cloned()
            .collect();

        let (kept, audits) = deduplicate(records);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "Al Rajhi Bank");
        assert_eq!(audits[0].discarded[0].confidence, 0.7);
        assert_eq!(audits[0].discarded[0].source_ref, "https://example.test/scan.pdf");
    }
}
