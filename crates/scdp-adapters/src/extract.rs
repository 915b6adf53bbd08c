use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use scdp_core::{header_signature, ExtractionResult, RawDocument, StrategyKind};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::html::HtmlTableStrategy;
use crate::pdf::{OcrEngine, PdfOcrStrategy, PdfTextStrategy};
use crate::text::looks_numeric;

const W_COLUMNS: f64 = 0.4;
const W_HEADER: f64 = 0.35;
const W_NUMERIC: f64 = 0.25;

/// Multiplier applied to the combined signals for each strategy.
pub fn reliability(kind: StrategyKind) -> f64 {
    match kind {
        StrategyKind::HtmlTable => 1.0,
        StrategyKind::PdfText => 0.9,
        StrategyKind::PdfOcr => 0.75,
    }
}

/// Raw table-quality signals, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableSignals {
    pub column_consistency: f64,
    pub header_score: f64,
    pub numeric_ratio: f64,
}

impl TableSignals {
    pub fn measure(header: &[String], header_detected: bool, rows: &[Vec<String>], consistent_rows: usize) -> Self {
        if rows.is_empty() || header.is_empty() {
            return Self {
                column_consistency: 0.0,
                header_score: 0.0,
                numeric_ratio: 0.0,
            };
        }
        let column_consistency = consistent_rows.min(rows.len()) as f64 / rows.len() as f64;

        let header_score = if header_detected {
            let good = header
                .iter()
                .filter(|h| !h.trim().is_empty() && !looks_numeric(h))
                .count();
            good as f64 / header.len() as f64
        } else {
            0.0
        };

        let numeric_columns = (0..header.len())
            .filter(|&col| {
                let filled: Vec<&str> = rows
                    .iter()
                    .filter_map(|r| r.get(col).map(String::as_str))
                    .filter(|c| !c.trim().is_empty())
                    .collect();
                !filled.is_empty() && filled.iter().filter(|c| looks_numeric(c)).count() * 2 >= filled.len()
            })
            .count();
        let numeric_ratio = numeric_columns as f64 / header.len() as f64;

        Self {
            column_consistency,
            header_score,
            numeric_ratio,
        }
    }

    /// Company tables need at least one numeric column (the ticker); half the
    /// columns being numeric already earns the full score.
    fn numeric_ratio_score(&self) -> f64 {
        (self.numeric_ratio * 2.0).min(1.0)
    }

    pub fn confidence(&self, kind: StrategyKind) -> f64 {
        let combined = W_COLUMNS * self.column_consistency
            + W_HEADER * self.header_score
            + W_NUMERIC * self.numeric_ratio_score();
        (combined * reliability(kind)).clamp(0.0, 1.0)
    }
}

/// What a single strategy made of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    Declined(String),
    Candidates(Vec<ExtractionResult>),
}

pub trait ExtractionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    fn applies_to(&self, document: &RawDocument) -> bool;

    fn extract(&self, document: &RawDocument) -> StrategyOutcome;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: StrategyKind,
    pub outcome: String,
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("no table above confidence {threshold} in {url} ({})", describe_attempts(.attempts))]
pub struct ExtractionFailed {
    pub url: String,
    pub threshold: f64,
    pub attempts: Vec<StrategyAttempt>,
}

fn describe_attempts(attempts: &[StrategyAttempt]) -> String {
    if attempts.is_empty() {
        return "no applicable strategy".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.strategy.as_str(), a.outcome))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Ordered strategy chain. Cheaper strategies come first; escalation stops as
/// soon as one of them yields a candidate at or above the threshold.
pub struct Extractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
    threshold: f64,
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extractor")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.kind().as_str()).collect::<Vec<_>>(),
            )
            .field("threshold", &self.threshold)
            .finish()
    }
}

impl Extractor {
    pub fn new(threshold: f64) -> Self {
        Self {
            strategies: Vec::new(),
            threshold,
        }
    }

    pub fn standard(threshold: f64, ocr: Option<Arc<dyn OcrEngine>>) -> Self {
        let mut extractor = Self::new(threshold)
            .with_strategy(HtmlTableStrategy::default())
            .with_strategy(PdfTextStrategy::default());
        if let Some(engine) = ocr {
            extractor = extractor.with_strategy(PdfOcrStrategy::new(engine));
        }
        extractor
    }

    pub fn with_strategy(mut self, strategy: impl ExtractionStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn extract(&self, document: &RawDocument) -> Result<Vec<ExtractionResult>, ExtractionFailed> {
        let mut attempts = Vec::new();
        let mut pool = Vec::new();

        for strategy in &self.strategies {
            if !strategy.applies_to(document) {
                continue;
            }
            match strategy.extract(document) {
                StrategyOutcome::Declined(reason) => {
                    debug!(strategy = strategy.kind().as_str(), %reason, "strategy declined");
                    attempts.push(StrategyAttempt {
                        strategy: strategy.kind(),
                        outcome: format!("declined: {reason}"),
                    });
                }
                StrategyOutcome::Candidates(candidates) => {
                    let best = candidates.iter().map(|c| c.confidence).fold(0.0_f64, f64::max);
                    attempts.push(StrategyAttempt {
                        strategy: strategy.kind(),
                        outcome: format!("{} candidates, best confidence {best:.3}", candidates.len()),
                    });
                    pool.extend(candidates);
                    if best >= self.threshold {
                        break;
                    }
                }
            }
        }

        let selected = select_per_region(pool, self.threshold);
        if selected.is_empty() {
            return Err(ExtractionFailed {
                url: document.source().url.clone(),
                threshold: self.threshold,
                attempts,
            });
        }
        Ok(selected)
    }
}

/// Keep the best candidate per logical region. A region is identified by the
/// header signature plus its occurrence count within one strategy's output,
/// so two same-shaped tables in one document stay distinct. Ties go to the
/// candidate seen first, i.e. the cheaper strategy.
pub fn select_per_region(candidates: Vec<ExtractionResult>, threshold: f64) -> Vec<ExtractionResult> {
    let mut order: Vec<(String, usize)> = Vec::new();
    let mut best: HashMap<(String, usize), ExtractionResult> = HashMap::new();
    let mut occurrences: HashMap<(StrategyKind, String), usize> = HashMap::new();

    for candidate in candidates {
        let signature = header_signature(&candidate.header);
        let counter = occurrences
            .entry((candidate.strategy, signature.clone()))
            .or_insert(0);
        let key = (signature, *counter);
        *counter += 1;

        match best.get(&key) {
            Some(current) if current.confidence >= candidate.confidence => {}
            Some(_) => {
                best.insert(key, candidate);
            }
            None => {
                order.push(key.clone());
                best.insert(key, candidate);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|key| best.remove(&key))
        .filter(|c| c.confidence >= threshold)
        .enumerate()
        .map(|(region, mut c)| {
            c.region = region;
            c
        })
        .collect()
}
