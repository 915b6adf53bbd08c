use std::cmp::Ordering;

use scdp_core::{Dataset, Delta, FieldChange, Record};

/// Field-level changes between two versions of one record. Only fields
/// present in both versions are compared; a `null` that becomes a value (or
/// the reverse) is a change, a key that appears or disappears is not.
pub fn record_changes(old: &Record, new: &Record) -> Vec<FieldChange> {
    let before = old.comparable_fields();
    let mut after = new.comparable_fields();
    before
        .into_iter()
        .filter_map(|(field, o)| {
            let n = after.remove(&field)?;
            (o != n).then(|| FieldChange {
                identifier: new.identifier.clone(),
                field,
                old: o,
                new: n,
            })
        })
        .collect()
}

/// Compare two dataset generations by `identifier`. Without a previous
/// generation every record is added.
pub fn diff(previous: Option<&Dataset>, current: &Dataset) -> Delta {
    let Some(previous) = previous else {
        return Delta {
            added: current.records().to_vec(),
            ..Delta::default()
        };
    };

    let mut delta = Delta::default();
    let (old, new) = (previous.records(), current.records());
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        let order = match (old.get(i), new.get(j)) {
            (Some(a), Some(b)) => a.identifier.cmp(&b.identifier),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };
        match order {
            Ordering::Less => {
                delta.removed.push(old[i].identifier.clone());
                i += 1;
            }
            Ordering::Greater => {
                delta.added.push(new[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                delta.changed.extend(record_changes(&old[i], &new[j]));
                i += 1;
                j += 1;
            }
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::Value as JsonValue;
    use std::collections::BTreeMap;

    fn record(ticker: &str, amount: Option<f64>) -> Record {
        Record {
            identifier: Record::make_identifier(ticker, "alrajhi"),
            ticker: ticker.to_string(),
            name: format!("شركة {ticker}"),
            market: "main".to_string(),
            certifying_board: "alrajhi".to_string(),
            sector: Some("banks".to_string()),
            subsector: None,
            year: Some(2024),
            metric_values: BTreeMap::from([("purification_amount".to_string(), amount)]),
            attributes: BTreeMap::new(),
            source_ref: "https://example.test/list".to_string(),
            extracted_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
            confidence: 0.95,
        }
    }

    fn dataset(records: Vec<Record>) -> Dataset {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        Dataset::from_records(records, at, 1).unwrap()
    }

    #[test]
    fn identical_datasets_produce_an_empty_delta() {
        let d = dataset(vec![record("1120", Some(0.0)), record("2222", None)]);
        assert!(diff(Some(&d), &d).is_empty());
    }

    #[test]
    fn first_run_reports_everything_added() {
        let d = dataset(vec![record("2222", None), record("1120", Some(0.0))]);
        let delta = diff(None, &d);
        let ids: Vec<_> = delta.added.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["1120@alrajhi", "2222@alrajhi"]);
        assert!(delta.removed.is_empty() && delta.changed.is_empty());
    }

    #[test]
    fn added_removed_and_changed_are_separated() {
        let before = dataset(vec![record("1120", Some(0.0)), record("2010", Some(0.1))]);
        let after = dataset(vec![record("1120", Some(0.05)), record("2222", None)]);
        let delta = diff(Some(&before), &after);

        assert_eq!(delta.removed, vec!["2010@alrajhi".to_string()]);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].identifier, "2222@alrajhi");
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].field, "metric_values.purification_amount");
        assert_eq!(delta.changed[0].old, serde_json::json!(0.0));
        assert_eq!(delta.changed[0].new, serde_json::json!(0.05));
    }

    #[test]
    fn provenance_is_not_compared() {
        let before = dataset(vec![record("1120", Some(0.0))]);
        let mut moved = record("1120", Some(0.0));
        moved.source_ref = "https://example.test/other".to_string();
        moved.confidence = 0.5;
        moved.extracted_at = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).single().unwrap();
        assert!(diff(Some(&before), &dataset(vec![moved])).is_empty());
    }

    #[test]
    fn fields_on_one_side_only_are_not_compared() {
        let before = dataset(vec![record("1120", Some(0.05))]);
        let mut after_record = record("1120", Some(0.05));
        after_record.metric_values.insert("interest_income_ratio".into(), Some(0.01));
        after_record.attributes.insert("notes".into(), "موقوفة".into());
        assert!(diff(Some(&before), &dataset(vec![after_record.clone()])).is_empty());

        after_record.metric_values.remove("purification_amount");
        assert!(diff(Some(&before), &dataset(vec![after_record])).is_empty());
    }

    #[test]
    fn null_becoming_a_value_is_a_change() {
        let before = dataset(vec![record("1120", None)]);
        let delta = diff(Some(&before), &dataset(vec![record("1120", Some(0.02))]));
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].field, "metric_values.purification_amount");
        assert_eq!(delta.changed[0].old, JsonValue::Null);
        assert_eq!(delta.changed[0].new, serde_json::json!(0.02));
    }
}
