use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use scdp_core::{ContentHint, ExtractionResult, RawDocument, StrategyKind};

use crate::extract::{ExtractionStrategy, StrategyOutcome};
use crate::layout::{parse_page, stitch, PageText};

/// Turns a PDF into plain text, one string per page.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, pdf: &[u8]) -> anyhow::Result<Vec<String>>;
}

/// Runs an external program that reads a PDF on stdin and prints text to
/// stdout, pages separated by form feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOcrEngine {
    program: String,
    args: Vec<String>,
}

impl CommandOcrEngine {
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl OcrEngine for CommandOcrEngine {
    fn recognize(&self, pdf: &[u8]) -> anyhow::Result<Vec<String>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("starting ocr command {}", self.program))?;

        let mut stdin = child.stdin.take().context("ocr command has no stdin")?;
        let input = pdf.to_vec();
        let writer = std::thread::spawn(move || stdin.write_all(&input));
        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for ocr command {}", self.program))?;
        let written = writer.join().map_err(|_| anyhow!("ocr stdin writer panicked"))?;

        if !output.status.success() {
            bail!(
                "ocr command {} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        written.context("writing pdf to ocr command")?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .split('\u{c}')
            .map(str::to_string)
            .collect())
    }
}

fn is_pdf(document: &RawDocument) -> bool {
    document.effective_hint() == ContentHint::Pdf
}

fn candidates_from_pages(
    document: &RawDocument,
    pages: &[PageText],
    kind: StrategyKind,
    visual_order: bool,
) -> StrategyOutcome {
    let tables: Vec<_> = pages
        .iter()
        .filter_map(|p| parse_page(p.page, &p.text, visual_order))
        .collect();
    if tables.is_empty() {
        return StrategyOutcome::Declined("no tabular lines found".to_string());
    }
    let candidates = stitch(tables, kind)
        .into_iter()
        .enumerate()
        .map(|(region, table)| ExtractionResult {
            source: document.source().clone(),
            strategy: kind,
            region,
            pages: table.pages,
            header: table.header,
            rows: table.rows,
            confidence: table.confidence,
            retrieved_at: document.retrieved_at(),
        })
        .collect();
    StrategyOutcome::Candidates(candidates)
}

/// Reads the embedded text layer with lopdf.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfTextStrategy {
    visual_order: bool,
}

impl PdfTextStrategy {
    /// For producers known to write right-to-left text in visual order.
    pub fn with_visual_order(mut self, visual_order: bool) -> Self {
        self.visual_order = visual_order;
        self
    }
}

impl ExtractionStrategy for PdfTextStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PdfText
    }

    fn applies_to(&self, document: &RawDocument) -> bool {
        is_pdf(document)
    }

    fn extract(&self, document: &RawDocument) -> StrategyOutcome {
        let pdf = match lopdf::Document::load_mem(document.body()) {
            Ok(pdf) => pdf,
            Err(err) => return StrategyOutcome::Declined(format!("unreadable pdf: {err}")),
        };
        let pages: Vec<PageText> = pdf
            .get_pages()
            .keys()
            .map(|&page| PageText {
                page,
                text: pdf.extract_text(&[page]).unwrap_or_default(),
            })
            .collect();
        if pages.iter().all(|p| p.text.trim().is_empty()) {
            return StrategyOutcome::Declined("no text layer".to_string());
        }
        candidates_from_pages(document, &pages, StrategyKind::PdfText, self.visual_order)
    }
}

/// Last resort for scanned reports.
pub struct PdfOcrStrategy {
    engine: Arc<dyn OcrEngine>,
    visual_order: bool,
}

impl fmt::Debug for PdfOcrStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PdfOcrStrategy")
            .field("visual_order", &self.visual_order)
            .finish_non_exhaustive()
    }
}

impl PdfOcrStrategy {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self {
            engine,
            visual_order: false,
        }
    }

    pub fn with_visual_order(mut self, visual_order: bool) -> Self {
        self.visual_order = visual_order;
        self
    }
}

impl ExtractionStrategy for PdfOcrStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PdfOcr
    }

    fn applies_to(&self, document: &RawDocument) -> bool {
        is_pdf(document)
    }

    fn extract(&self, document: &RawDocument) -> StrategyOutcome {
        let texts = match self.engine.recognize(document.body()) {
            Ok(texts) => texts,
            Err(err) => return StrategyOutcome::Declined(format!("ocr failed: {err:#}")),
        };
        let pages: Vec<PageText> = texts
            .into_iter()
            .enumerate()
            .map(|(idx, text)| PageText {
                page: idx as u32 + 1,
                text,
            })
            .collect();
        candidates_from_pages(document, &pages, StrategyKind::PdfOcr, self.visual_order)
    }
}
