//! Read-side helpers over an exported dataset: filtering, counts and the
//! market → board grouping shared by the hierarchical export and the API.

use std::collections::BTreeMap;

use scdp_core::{Record, TaxonomyEntry};
use serde::{Deserialize, Serialize};

pub const UNCLASSIFIED_SECTOR: &str = "unclassified";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default, alias = "certifying_board")]
    pub board: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
}

impl RecordFilter {
    pub fn matches(&self, record: &Record) -> bool {
        let eq = |want: &Option<String>, have: Option<&str>| want.as_deref().map_or(true, |w| have == Some(w));
        eq(&self.market, Some(&record.market))
            && eq(&self.board, Some(&record.certifying_board))
            && eq(&self.sector, record.sector.as_deref())
    }
}

pub fn filter_records<'a>(records: &'a [Record], filter: &RecordFilter) -> Vec<&'a Record> {
    records.iter().filter(|r| filter.matches(r)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: usize,
    pub by_market: BTreeMap<String, usize>,
    pub by_board: BTreeMap<String, usize>,
    pub by_sector: BTreeMap<String, usize>,
}

pub fn statistics<'a>(records: impl IntoIterator<Item = &'a Record>) -> Statistics {
    let mut stats = Statistics::default();
    for record in records {
        stats.total += 1;
        *stats.by_market.entry(record.market.clone()).or_default() += 1;
        *stats.by_board.entry(record.certifying_board.clone()).or_default() += 1;
        let sector = record.sector.clone().unwrap_or_else(|| UNCLASSIFIED_SECTOR.to_string());
        *stats.by_sector.entry(sector).or_default() += 1;
    }
    stats
}

/// Records grouped market → certifying board, each group in identifier order
/// when the input is.
pub fn hierarchy<'a>(
    records: impl IntoIterator<Item = &'a Record>,
) -> BTreeMap<&'a str, BTreeMap<&'a str, Vec<&'a Record>>> {
    let mut tree: BTreeMap<&str, BTreeMap<&str, Vec<&Record>>> = BTreeMap::new();
    for record in records {
        tree.entry(record.market.as_str())
            .or_default()
            .entry(record.certifying_board.as_str())
            .or_default()
            .push(record);
    }
    tree
}

/// A taxonomy entry with the number of records filed under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub key: String,
    pub label: String,
    pub label_en: Option<String>,
    pub count: usize,
}

pub fn category_counts(entries: &[TaxonomyEntry], counts: &BTreeMap<String, usize>) -> Vec<CategoryCount> {
    entries
        .iter()
        .map(|e| CategoryCount {
            key: e.key.clone(),
            label: e.label.clone(),
            label_en: e.label_en.clone(),
            count: counts.get(&e.key).copied().unwrap_or(0),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(ticker: &str, market: &str, board: &str, sector: Option<&str>) -> Record {
        Record {
            identifier: Record::make_identifier(ticker, board),
            ticker: ticker.into(),
            name: ticker.into(),
            market: market.into(),
            certifying_board: board.into(),
            sector: sector.map(String::from),
            subsector: None,
            year: None,
            metric_values: BTreeMap::new(),
            attributes: BTreeMap::new(),
            source_ref: "https://example.test".into(),
            extracted_at: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap(),
            confidence: 1.0,
        }
    }

    fn sample() -> Vec<Record> {
        vec![
            record("1120", "main", "alrajhi", Some("banks")),
            record("1120", "main", "albilad", Some("banks")),
            record("2222", "main", "alrajhi", Some("energy")),
            record("9510", "parallel", "osaimi", None),
        ]
    }

    #[test]
    fn filters_combine() {
        let records = sample();
        let filter = RecordFilter {
            market: Some("main".into()),
            board: Some("alrajhi".into()),
            sector: None,
        };
        let hits: Vec<_> = filter_records(&records, &filter).iter().map(|r| r.ticker.as_str()).collect();
        assert_eq!(hits, vec!["1120", "2222"]);

        let by_sector = RecordFilter {
            sector: Some("banks".into()),
            ..RecordFilter::default()
        };
        assert_eq!(filter_records(&records, &by_sector).len(), 2);
    }

    #[test]
    fn statistics_count_every_dimension() {
        let stats = statistics(&sample());
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_market["main"], 3);
        assert_eq!(stats.by_board["alrajhi"], 2);
        assert_eq!(stats.by_sector[UNCLASSIFIED_SECTOR], 1);
    }

    #[test]
    fn hierarchy_groups_market_then_board() {
        let records = sample();
        let tree = hierarchy(&records);
        assert_eq!(tree.keys().copied().collect::<Vec<_>>(), vec!["main", "parallel"]);
        assert_eq!(tree["main"]["alrajhi"].len(), 2);
        assert_eq!(tree["parallel"]["osaimi"][0].ticker, "9510");
    }
}
