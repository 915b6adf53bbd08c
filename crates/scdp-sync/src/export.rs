use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int32Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, SecondsFormat, Utc};
use parquet::arrow::ArrowWriter;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer as XmlWriter;
use rust_xlsxwriter::{DocProperties, ExcelDateTime, Format, Workbook, Worksheet};
use scdp_core::{sha256_hex, Dataset, Record, Taxonomy, TaxonomyEntry};
use scdp_storage::{stage_file, FileBackup, StagedFile};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::config::ExportFormat;
use crate::query::{hierarchy, statistics};

pub const MANIFEST_NAME: &str = "latest.json";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const SHEET_NAME_LIMIT: usize = 31;

#[derive(Debug, Error)]
pub enum ExportFailure {
    #[error("serializing {format} export: {reason}")]
    Serialize { format: String, reason: String },
    #[error("writing {path}: {reason}")]
    Write { path: String, reason: String },
}

/// One promoted export file as listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedFile {
    pub format: String,
    pub name: String,
    pub alias: String,
    pub bytes: u64,
    pub sha256: String,
}

/// Contents of `latest.json`; rewritten only after every format is in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub generated_at: DateTime<Utc>,
    pub taxonomy_version: u32,
    pub dataset_checksum: String,
    pub record_count: usize,
    pub files: Vec<ExportedFile>,
}

impl ExportManifest {
    pub fn file(&self, format: &str) -> Option<&ExportedFile> {
        self.files.iter().find(|f| f.format == format)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WriteReport {
    pub directory: PathBuf,
    pub manifest: ExportManifest,
}

/// Serialized bytes for one file, produced before anything touches disk.
#[derive(Debug, Clone)]
pub struct Payload {
    pub format: &'static str,
    pub name: String,
    pub alias: String,
    pub bytes: Vec<u8>,
}

pub fn stamp(generated_at: DateTime<Utc>) -> String {
    generated_at.format("%Y%m%dT%H%M%SZ").to_string()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Column layout shared by the tabular formats: fixed record fields, then one
/// column per metric key and attribute key seen anywhere in the dataset.
struct Columns {
    metrics: Vec<String>,
    attributes: Vec<String>,
}

enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl Cell {
    fn text(value: Option<&str>) -> Self {
        value.map_or(Self::Empty, |v| Self::Text(v.to_string()))
    }

    fn number(value: Option<f64>) -> Self {
        value.map_or(Self::Empty, Self::Number)
    }

    fn to_csv(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Number(n) => n.to_string(),
            Self::Empty => String::new(),
        }
    }
}

impl Columns {
    fn of(records: &[Record]) -> Self {
        let metrics: BTreeSet<&String> = records.iter().flat_map(|r| r.metric_values.keys()).collect();
        let attributes: BTreeSet<&String> = records.iter().flat_map(|r| r.attributes.keys()).collect();
        Self {
            metrics: metrics.into_iter().cloned().collect(),
            attributes: attributes.into_iter().cloned().collect(),
        }
    }

    fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = [
            "identifier",
            "ticker",
            "name",
            "market",
            "certifying_board",
            "sector",
            "subsector",
            "year",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        header.extend(self.metrics.iter().map(|k| format!("metric_values.{k}")));
        header.extend(self.attributes.iter().map(|k| format!("attributes.{k}")));
        header.extend(["source_ref", "extracted_at", "confidence"].iter().map(|s| s.to_string()));
        header
    }

    fn row(&self, r: &Record) -> Vec<Cell> {
        let mut row = vec![
            Cell::Text(r.identifier.clone()),
            Cell::Text(r.ticker.clone()),
            Cell::Text(r.name.clone()),
            Cell::Text(r.market.clone()),
            Cell::Text(r.certifying_board.clone()),
            Cell::text(r.sector.as_deref()),
            Cell::text(r.subsector.as_deref()),
            Cell::number(r.year.map(f64::from)),
        ];
        row.extend(
            self.metrics
                .iter()
                .map(|k| Cell::number(r.metric_values.get(k).copied().flatten())),
        );
        row.extend(self.attributes.iter().map(|k| Cell::text(r.attributes.get(k).map(String::as_str))));
        row.push(Cell::Text(r.source_ref.clone()));
        row.push(Cell::Text(timestamp(r.extracted_at)));
        row.push(Cell::Number(r.confidence));
        row
    }

    fn rows<'a>(&self, records: impl Iterator<Item = &'a Record>) -> Vec<Vec<Cell>> {
        records.map(|r| self.row(r)).collect()
    }
}

fn entry_label(entry: Option<&TaxonomyEntry>, key: &str) -> String {
    entry.map(|e| e.label.clone()).unwrap_or_else(|| key.to_string())
}

fn sheet_name(raw: &str, used: &mut HashSet<String>) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if matches!(c, '[' | ']' | ':' | '*' | '?' | '/' | '\\') { ' ' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches('\'').to_string();
    let base: String = if cleaned.is_empty() { "sheet".to_string() } else { cleaned };
    let mut candidate: String = base.chars().take(SHEET_NAME_LIMIT).collect();
    let mut n = 2;
    while !used.insert(candidate.to_lowercase()) {
        let suffix = format!(" ({n})");
        let keep = SHEET_NAME_LIMIT - suffix.chars().count();
        candidate = base.chars().take(keep).collect::<String>() + &suffix;
        n += 1;
    }
    candidate
}

fn write_table(sheet: &mut Worksheet, header: &[String], rows: &[Vec<Cell>], bold: &Format) -> Result<()> {
    for (col, name) in header.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, name, bold)?;
    }
    for (idx, row) in rows.iter().enumerate() {
        let r = idx as u32 + 1;
        for (col, cell) in row.iter().enumerate() {
            match cell {
                Cell::Text(t) => {
                    sheet.write_string(r, col as u16, t)?;
                }
                Cell::Number(n) => {
                    sheet.write_number(r, col as u16, *n)?;
                }
                Cell::Empty => {}
            }
        }
    }
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

fn xml_text(writer: &mut XmlWriter<Vec<u8>>, name: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(v) => {
            writer.write_event(Event::Start(BytesStart::new(name)))?;
            writer.write_event(Event::Text(BytesText::new(v)))?;
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }
        None => {
            let mut empty = BytesStart::new(name);
            empty.push_attribute(("nil", "true"));
            writer.write_event(Event::Empty(empty))?;
        }
    }
    Ok(())
}

fn xml_keyed(writer: &mut XmlWriter<Vec<u8>>, name: &str, key: &str, value: Option<&str>) -> Result<()> {
    let mut start = BytesStart::new(name);
    start.push_attribute(("key", key));
    match value {
        Some(v) => {
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::Text(BytesText::new(v)))?;
            writer.write_event(Event::End(BytesEnd::new(name)))?;
        }
        None => {
            start.push_attribute(("nil", "true"));
            writer.write_event(Event::Empty(start))?;
        }
    }
    Ok(())
}

/// Serializes a dataset into every export format and promotes the files into
/// the export directory.
#[derive(Debug, Clone)]
pub struct Exporter {
    dir: PathBuf,
    taxonomy: Option<Taxonomy>,
}

impl Exporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            taxonomy: None,
        }
    }

    /// Taxonomy labels are used for sheet names and the hierarchical JSON.
    pub fn with_taxonomy(mut self, taxonomy: Taxonomy) -> Self {
        self.taxonomy = Some(taxonomy);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn market_entry(&self, key: &str) -> Option<&TaxonomyEntry> {
        self.taxonomy.as_ref().and_then(|t| t.market(key))
    }

    fn board_entry(&self, key: &str) -> Option<&TaxonomyEntry> {
        self.taxonomy.as_ref().and_then(|t| t.board(key))
    }

    /// All payloads for `formats`, in manifest order. The flat JSON snapshot is
    /// always included: the change detector and the API read it back.
    pub fn render(&self, dataset: &Dataset, formats: &[ExportFormat]) -> Result<Vec<Payload>, ExportFailure> {
        let mut wanted: BTreeSet<ExportFormat> = formats.iter().copied().collect();
        wanted.insert(ExportFormat::Json);
        let stamp = stamp(dataset.generated_at());

        let mut payloads = Vec::new();
        for format in wanted {
            let fail = |e: anyhow::Error| ExportFailure::Serialize {
                format: format.to_string(),
                reason: format!("{e:#}"),
            };
            match format {
                ExportFormat::Json => {
                    payloads.push(Payload {
                        format: "json",
                        name: format!("records_{stamp}.json"),
                        alias: "latest.records.json".to_string(),
                        bytes: self.render_flat_json(dataset).map_err(fail)?,
                    });
                    payloads.push(Payload {
                        format: "json_by_taxonomy",
                        name: format!("records_by_taxonomy_{stamp}.json"),
                        alias: "latest.by_taxonomy.json".to_string(),
                        bytes: self.render_hierarchical_json(dataset).map_err(fail)?,
                    });
                }
                ExportFormat::Csv => payloads.push(Payload {
                    format: "csv",
                    name: format!("records_{stamp}.csv"),
                    alias: "latest.csv".to_string(),
                    bytes: self.render_csv(dataset).map_err(fail)?,
                }),
                ExportFormat::Xlsx => payloads.push(Payload {
                    format: "xlsx",
                    name: format!("records_{stamp}.xlsx"),
                    alias: "latest.xlsx".to_string(),
                    bytes: self.render_xlsx(dataset).map_err(fail)?,
                }),
                ExportFormat::Xml => payloads.push(Payload {
                    format: "xml",
                    name: format!("records_{stamp}.xml"),
                    alias: "latest.xml".to_string(),
                    bytes: self.render_xml(dataset).map_err(fail)?,
                }),
                ExportFormat::Parquet => payloads.push(Payload {
                    format: "parquet",
                    name: format!("records_{stamp}.parquet"),
                    alias: "latest.parquet".to_string(),
                    bytes: self.render_parquet(dataset).map_err(fail)?,
                }),
            }
        }
        Ok(payloads)
    }

    pub fn render_flat_json(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(dataset.records()).context("serializing records")?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    pub fn render_hierarchical_json(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        let mut markets = serde_json::Map::new();
        for (market, boards) in hierarchy(dataset.records()) {
            let mut board_map = serde_json::Map::new();
            for (board, records) in boards {
                let entry = self.board_entry(board);
                board_map.insert(
                    board.to_string(),
                    json!({
                        "label": entry_label(entry, board),
                        "label_en": entry.and_then(|e| e.label_en.clone()),
                        "count": records.len(),
                        "records": records,
                    }),
                );
            }
            let entry = self.market_entry(market);
            markets.insert(
                market.to_string(),
                json!({
                    "label": entry_label(entry, market),
                    "label_en": entry.and_then(|e| e.label_en.clone()),
                    "boards": board_map,
                }),
            );
        }
        let doc = json!({
            "generated_at": timestamp(dataset.generated_at()),
            "taxonomy_version": dataset.taxonomy_version(),
            "dataset_checksum": dataset.checksum(),
            "statistics": statistics(dataset.records()),
            "markets": markets,
        });
        let mut bytes = serde_json::to_vec_pretty(&doc).context("serializing hierarchy")?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// UTF-8 with a byte-order mark so spreadsheet tools read Arabic text.
    pub fn render_csv(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        let columns = Columns::of(dataset.records());
        let mut writer = csv::WriterBuilder::new().from_writer(UTF8_BOM.to_vec());
        writer.write_record(columns.header()).context("writing csv header")?;
        for record in dataset.records() {
            let row: Vec<String> = columns.row(record).iter().map(Cell::to_csv).collect();
            writer
                .write_record(&row)
                .with_context(|| format!("writing csv row {}", record.identifier))?;
        }
        writer.flush().context("flushing csv")?;
        writer
            .into_inner()
            .map_err(|e| anyhow!("finishing csv: {}", e.error()))
    }

    pub fn render_xlsx(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        let columns = Columns::of(dataset.records());
        let header = columns.header();
        let mut workbook = Workbook::new();
        let created = ExcelDateTime::parse_from_str(&dataset.generated_at().format("%Y-%m-%dT%H:%M:%S").to_string())?;
        let properties = DocProperties::new()
            .set_title("Shariah compliance dataset")
            .set_creation_datetime(&created);
        workbook.set_properties(&properties);
        let bold = Format::new().set_bold();
        let mut used = HashSet::new();

        let all = columns.rows(dataset.records().iter());
        let sheet = workbook.add_worksheet();
        sheet.set_name(&sheet_name("جميع الشركات", &mut used))?;
        write_table(sheet, &header, &all, &bold)?;

        let stats = statistics(dataset.records());
        for market in stats.by_market.keys() {
            let rows = columns.rows(dataset.records().iter().filter(|r| &r.market == market));
            let name = sheet_name(&entry_label(self.market_entry(market), market), &mut used);
            let sheet = workbook.add_worksheet();
            sheet.set_name(&name)?;
            write_table(sheet, &header, &rows, &bold)?;
        }
        for board in stats.by_board.keys() {
            let rows = columns.rows(dataset.records().iter().filter(|r| &r.certifying_board == board));
            let name = sheet_name(&entry_label(self.board_entry(board), board), &mut used);
            let sheet = workbook.add_worksheet();
            sheet.set_name(&name)?;
            write_table(sheet, &header, &rows, &bold)?;
        }

        let mut summary: Vec<Vec<Cell>> = vec![
            vec![Cell::Text("generated_at".into()), Cell::Text(timestamp(dataset.generated_at()))],
            vec![
                Cell::Text("taxonomy_version".into()),
                Cell::Number(f64::from(dataset.taxonomy_version())),
            ],
            vec![Cell::Text("dataset_checksum".into()), Cell::Text(dataset.checksum().to_string())],
            vec![Cell::Text("total".into()), Cell::Number(stats.total as f64)],
        ];
        for (dimension, counts) in [
            ("market", &stats.by_market),
            ("certifying_board", &stats.by_board),
            ("sector", &stats.by_sector),
        ] {
            summary.extend(
                counts
                    .iter()
                    .map(|(k, n)| vec![Cell::Text(format!("{dimension}:{k}")), Cell::Number(*n as f64)]),
            );
        }
        let sheet = workbook.add_worksheet();
        sheet.set_name(&sheet_name("ملخص", &mut used))?;
        write_table(sheet, &["metric".to_string(), "value".to_string()], &summary, &bold)?;

        Ok(workbook.save_to_buffer()?)
    }

    /// Absent values are written as empty elements with `nil="true"`.
    pub fn render_xml(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        let mut writer = XmlWriter::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let generated_at = timestamp(dataset.generated_at());
        let version = dataset.taxonomy_version().to_string();
        let count = dataset.len().to_string();
        let mut root = BytesStart::new("dataset");
        root.push_attribute(("generated_at", generated_at.as_str()));
        root.push_attribute(("taxonomy_version", version.as_str()));
        root.push_attribute(("checksum", dataset.checksum()));
        root.push_attribute(("count", count.as_str()));
        writer.write_event(Event::Start(root))?;

        for r in dataset.records() {
            let mut start = BytesStart::new("record");
            start.push_attribute(("identifier", r.identifier.as_str()));
            writer.write_event(Event::Start(start))?;
            xml_text(&mut writer, "ticker", Some(&r.ticker))?;
            xml_text(&mut writer, "name", Some(&r.name))?;
            xml_text(&mut writer, "market", Some(&r.market))?;
            xml_text(&mut writer, "certifying_board", Some(&r.certifying_board))?;
            xml_text(&mut writer, "sector", r.sector.as_deref())?;
            xml_text(&mut writer, "subsector", r.subsector.as_deref())?;
            xml_text(&mut writer, "year", r.year.map(|y| y.to_string()).as_deref())?;

            writer.write_event(Event::Start(BytesStart::new("metric_values")))?;
            for (key, value) in &r.metric_values {
                xml_keyed(&mut writer, "metric", key, value.map(|v| v.to_string()).as_deref())?;
            }
            writer.write_event(Event::End(BytesEnd::new("metric_values")))?;

            writer.write_event(Event::Start(BytesStart::new("attributes")))?;
            for (key, value) in &r.attributes {
                xml_keyed(&mut writer, "attribute", key, Some(value))?;
            }
            writer.write_event(Event::End(BytesEnd::new("attributes")))?;

            xml_text(&mut writer, "source_ref", Some(&r.source_ref))?;
            xml_text(&mut writer, "extracted_at", Some(&timestamp(r.extracted_at)))?;
            xml_text(&mut writer, "confidence", Some(&r.confidence.to_string()))?;
            writer.write_event(Event::End(BytesEnd::new("record")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("dataset")))?;
        let mut bytes = writer.into_inner();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// One row per record; metric columns are typed, attributes travel as a
    /// JSON object string.
    pub fn render_parquet(&self, dataset: &Dataset) -> Result<Vec<u8>> {
        let records = dataset.records();
        let columns = Columns::of(records);
        let text = |f: &dyn Fn(&Record) -> Option<String>| -> ArrayRef {
            Arc::new(StringArray::from(records.iter().map(f).collect::<Vec<_>>()))
        };

        let mut fields = vec![
            ArrowField::new("identifier", DataType::Utf8, false),
            ArrowField::new("ticker", DataType::Utf8, false),
            ArrowField::new("name", DataType::Utf8, false),
            ArrowField::new("market", DataType::Utf8, false),
            ArrowField::new("certifying_board", DataType::Utf8, false),
            ArrowField::new("sector", DataType::Utf8, true),
            ArrowField::new("subsector", DataType::Utf8, true),
            ArrowField::new("year", DataType::Int32, true),
        ];
        let mut arrays: Vec<ArrayRef> = vec![
            text(&|r| Some(r.identifier.clone())),
            text(&|r| Some(r.ticker.clone())),
            text(&|r| Some(r.name.clone())),
            text(&|r| Some(r.market.clone())),
            text(&|r| Some(r.certifying_board.clone())),
            text(&|r| r.sector.clone()),
            text(&|r| r.subsector.clone()),
            Arc::new(Int32Array::from(records.iter().map(|r| r.year).collect::<Vec<_>>())),
        ];
        for key in &columns.metrics {
            fields.push(ArrowField::new(format!("metric_values.{key}"), DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from(
                records
                    .iter()
                    .map(|r| r.metric_values.get(key).copied().flatten())
                    .collect::<Vec<_>>(),
            )));
        }
        let attributes = records
            .iter()
            .map(|r| serde_json::to_string(&r.attributes).map(Some))
            .collect::<serde_json::Result<Vec<_>>>()
            .context("encoding attributes")?;
        fields.push(ArrowField::new("attributes", DataType::Utf8, false));
        arrays.push(Arc::new(StringArray::from(attributes)));
        fields.push(ArrowField::new("source_ref", DataType::Utf8, false));
        arrays.push(text(&|r| Some(r.source_ref.clone())));
        fields.push(ArrowField::new("extracted_at", DataType::Utf8, false));
        arrays.push(text(&|r| Some(timestamp(r.extracted_at))));
        fields.push(ArrowField::new("confidence", DataType::Float64, false));
        arrays.push(Arc::new(Float64Array::from(
            records.iter().map(|r| r.confidence).collect::<Vec<_>>(),
        )));

        let batch = RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("building record batch")?;
        let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None).context("opening parquet writer")?;
        writer.write(&batch).context("writing record batch")?;
        writer.into_inner().context("closing parquet writer")
    }

    /// Render everything, stage every file next to its destination, then
    /// promote data files, aliases and finally the manifest. Every destination
    /// is backed up first; any failure discards what is still staged and puts
    /// each promoted destination back the way it was.
    pub async fn export(&self, dataset: &Dataset, formats: &[ExportFormat]) -> Result<WriteReport, ExportFailure> {
        let payloads = self.render(dataset, formats)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.write_failure(&self.dir, e.into()))?;

        let mut files = Vec::with_capacity(payloads.len());
        let mut staged: Vec<StagedFile> = Vec::new();
        let mut aliases: Vec<StagedFile> = Vec::new();
        for payload in &payloads {
            let data_path = self.dir.join(&payload.name);
            let outcome = async {
                let data = stage_file(&data_path, &payload.bytes).await?;
                let alias = stage_file(&self.dir.join(&payload.alias), &payload.bytes).await?;
                anyhow::Ok((data, alias))
            }
            .await;
            match outcome {
                Ok((data, alias)) => {
                    files.push(ExportedFile {
                        format: payload.format.to_string(),
                        name: payload.name.clone(),
                        alias: payload.alias.clone(),
                        bytes: data.byte_len(),
                        sha256: data.sha256().to_string(),
                    });
                    staged.push(data);
                    aliases.push(alias);
                }
                Err(e) => {
                    discard_all(staged.into_iter().chain(aliases)).await;
                    return Err(self.write_failure(&data_path, e));
                }
            }
        }

        let manifest = ExportManifest {
            generated_at: dataset.generated_at(),
            taxonomy_version: dataset.taxonomy_version(),
            dataset_checksum: dataset.checksum().to_string(),
            record_count: dataset.len(),
            files,
        };
        let manifest_path = self.dir.join(MANIFEST_NAME);
        let manifest_staged = match serde_json::to_vec_pretty(&manifest) {
            Ok(bytes) => stage_file(&manifest_path, &bytes).await,
            Err(e) => Err(e.into()),
        };
        let manifest_staged = match manifest_staged {
            Ok(s) => s,
            Err(e) => {
                discard_all(staged.into_iter().chain(aliases)).await;
                return Err(self.write_failure(&manifest_path, e));
            }
        };

        let order: Vec<StagedFile> = staged.into_iter().chain(aliases).chain([manifest_staged]).collect();
        let mut backups = Vec::with_capacity(order.len());
        let dests: Vec<PathBuf> = order.iter().map(|f| f.dest().to_path_buf()).collect();
        for dest in &dests {
            match FileBackup::take(dest).await {
                Ok(backup) => backups.push(backup),
                Err(e) => {
                    release_all(backups).await;
                    discard_all(order).await;
                    return Err(self.write_failure(dest, e));
                }
            }
        }

        let mut promoted: Vec<FileBackup> = Vec::new();
        let mut pending = order.into_iter().zip(backups);
        while let Some((file, backup)) = pending.next() {
            let dest = file.dest().to_path_buf();
            if let Err(e) = file.promote().await {
                for (file, backup) in pending.by_ref() {
                    file.discard().await;
                    backup.release().await;
                }
                backup.release().await;
                for done in promoted.into_iter().rev() {
                    done.restore().await;
                }
                return Err(self.write_failure(&dest, e));
            }
            promoted.push(backup);
        }
        release_all(promoted).await;

        info!(
            dir = %self.dir.display(),
            records = manifest.record_count,
            files = manifest.files.len(),
            checksum = %manifest.dataset_checksum,
            "export promoted"
        );
        Ok(WriteReport {
            directory: self.dir.clone(),
            manifest,
        })
    }

    fn write_failure(&self, path: &Path, error: anyhow::Error) -> ExportFailure {
        ExportFailure::Write {
            path: path.display().to_string(),
            reason: format!("{error:#}"),
        }
    }
}

async fn release_all(backups: impl IntoIterator<Item = FileBackup>) {
    for backup in backups {
        backup.release().await;
    }
}

async fn discard_all(files: impl IntoIterator<Item = StagedFile>) {
    for file in files {
        file.discard().await;
    }
}

pub fn load_manifest(dir: &Path) -> Result<Option<ExportManifest>> {
    let path = dir.join(MANIFEST_NAME);
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let manifest = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(manifest))
}

/// Rebuild the dataset recorded by `latest.json` from its flat JSON file and
/// check it against the manifest checksum.
pub fn load_dataset(dir: &Path) -> Result<Option<Dataset>> {
    let Some(manifest) = load_manifest(dir)? else {
        return Ok(None);
    };
    let file = manifest
        .file("json")
        .with_context(|| format!("{} lists no flat json file", MANIFEST_NAME))?;
    let path = dir.join(&file.name);
    let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    if sha256_hex(&bytes) != file.sha256 {
        anyhow::bail!("{} does not match the manifest checksum", path.display());
    }
    let records: Vec<Record> = serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    let dataset = Dataset::from_records(records, manifest.generated_at, manifest.taxonomy_version)
        .with_context(|| format!("rebuilding dataset from {}", path.display()))?;
    if dataset.checksum() != manifest.dataset_checksum {
        anyhow::bail!("dataset checksum mismatch for {}", path.display());
    }
    Ok(Some(dataset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(ticker: &str, market: &str, board: &str, amount: Option<f64>) -> Record {
        Record {
            identifier: Record::make_identifier(ticker, board),
            ticker: ticker.into(),
            name: format!("شركة {ticker}"),
            market: market.into(),
            certifying_board: board.into(),
            sector: (ticker != "9510").then(|| "banks".to_string()),
            subsector: None,
            year: Some(2024),
            metric_values: BTreeMap::from([("purification_amount".to_string(), amount)]),
            attributes: if ticker == "1120" {
                BTreeMap::from([("notes".to_string(), "<مدرجة> & نشطة".to_string())])
            } else {
                BTreeMap::new()
            },
            source_ref: "https://example.test/list?page=1&x=2".into(),
            extracted_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
            confidence: 0.95,
        }
    }

    fn dataset() -> Dataset {
        Dataset::from_records(
            vec![
                record("2222", "main", "alrajhi", None),
                record("1120", "main", "alrajhi", Some(0.05)),
                record("9510", "parallel", "osaimi", Some(-0.12)),
            ],
            Utc.with_ymd_and_hms(2026, 3, 1, 6, 30, 0).single().unwrap(),
            1,
        )
        .unwrap()
    }

    const ALL: &[ExportFormat] = &[
        ExportFormat::Json,
        ExportFormat::Csv,
        ExportFormat::Xlsx,
        ExportFormat::Xml,
        ExportFormat::Parquet,
    ];

    #[tokio::test]
    async fn export_promotes_every_format_and_the_manifest() {
        let dir = tempdir().unwrap();
        let report = Exporter::new(dir.path()).export(&dataset(), ALL).await.unwrap();

        let names: Vec<_> = report.manifest.files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "records_20260301T063000Z.json",
                "records_by_taxonomy_20260301T063000Z.json",
                "records_20260301T063000Z.csv",
                "records_20260301T063000Z.xlsx",
                "records_20260301T063000Z.xml",
                "records_20260301T063000Z.parquet",
            ]
        );
        for file in &report.manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.name)).unwrap();
            assert_eq!(sha256_hex(&bytes), file.sha256);
            assert_eq!(std::fs::read(dir.path().join(&file.alias)).unwrap(), bytes);
        }
        let manifest = load_manifest(dir.path()).unwrap().unwrap();
        assert_eq!(manifest, report.manifest);
        assert_eq!(manifest.record_count, 3);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn flat_json_round_trips_to_the_same_dataset() {
        let dir = tempdir().unwrap();
        let original = dataset();
        Exporter::new(dir.path())
            .export(&original, &[ExportFormat::Csv])
            .await
            .unwrap();
        let loaded = load_dataset(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.checksum(), original.checksum());
    }

    #[test]
    fn unchanged_dataset_renders_byte_identical_output() {
        let exporter = Exporter::new("unused");
        let formats = [ExportFormat::Json, ExportFormat::Csv, ExportFormat::Xml, ExportFormat::Parquet];
        let first = exporter.render(&dataset(), &formats).unwrap();
        let second = exporter.render(&dataset(), &formats).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.bytes, b.bytes, "{} differs", a.format);
        }
    }

    #[test]
    fn csv_has_bom_sorted_rows_and_null_cells() {
        let bytes = Exporter::new("unused").render_csv(&dataset()).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "identifier,ticker,name,market,certifying_board,sector,subsector,year,\
             metric_values.purification_amount,attributes.notes,source_ref,extracted_at,confidence"
        );
        let first = lines.next().unwrap();
        assert!(first.starts_with("1120@alrajhi,1120,"));
        let second = lines.next().unwrap();
        assert!(second.starts_with("2222@alrajhi,2222,شركة 2222,main,alrajhi,banks,,2024,,,"));
    }

    #[test]
    fn xml_marks_nulls_and_escapes_text() {
        let xml = String::from_utf8(Exporter::new("unused").render_xml(&dataset()).unwrap()).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<metric key=\"purification_amount\" nil=\"true\"/>"));
        assert!(xml.contains("<sector nil=\"true\"/>"));
        assert!(xml.contains("&lt;مدرجة&gt; &amp; نشطة"));
        assert!(xml.contains("<metric key=\"purification_amount\">-0.12</metric>"));
    }

    #[test]
    fn hierarchical_json_groups_by_market_and_board() {
        let bytes = Exporter::new("unused").render_hierarchical_json(&dataset()).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc["markets"]["main"]["boards"]["alrajhi"]["count"], 2);
        assert_eq!(doc["markets"]["parallel"]["boards"]["osaimi"]["records"][0]["ticker"], "9510");
        assert_eq!(doc["statistics"]["total"], 3);
    }

    #[test]
    fn sheet_names_are_sanitized_truncated_and_unique() {
        let mut used = HashSet::new();
        assert_eq!(sheet_name("a/b:c", &mut used), "a b c");
        let long = "الهيئة الشرعية لمصرف الراجحي للاستثمار";
        let first = sheet_name(long, &mut used);
        assert_eq!(first.chars().count(), SHEET_NAME_LIMIT);
        let second = sheet_name(long, &mut used);
        assert!(second.ends_with(" (2)"));
        assert_eq!(second.chars().count(), SHEET_NAME_LIMIT);
    }

    #[tokio::test]
    async fn failed_promotion_rolls_back_this_runs_files() {
        let dir = tempdir().unwrap();
        // A non-empty directory where an alias should go makes its rename fail.
        std::fs::create_dir_all(dir.path().join("latest.csv").join("blocker")).unwrap();

        let err = Exporter::new(dir.path())
            .export(&dataset(), &[ExportFormat::Json, ExportFormat::Csv])
            .await
            .unwrap_err();
        assert!(matches!(err, ExportFailure::Write { .. }));

        let names = file_names(dir.path());
        assert!(!names.iter().any(|n| n.starts_with("records_")), "{names:?}");
        assert!(!names.iter().any(|n| n.starts_with('.')), "{names:?}");
        assert!(!names.contains(&MANIFEST_NAME.to_string()));
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn latest_files(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        file_names(dir)
            .into_iter()
            .filter(|n| n.starts_with("latest.") && dir.join(n).is_file())
            .map(|n| {
                let bytes = std::fs::read(dir.join(&n)).unwrap();
                (n, bytes)
            })
            .collect()
    }

    #[tokio::test]
    async fn failed_promotion_restores_the_previous_generation() {
        let dir = tempdir().unwrap();
        let exporter = Exporter::new(dir.path());
        exporter.export(&dataset(), &[ExportFormat::Json]).await.unwrap();
        let before = latest_files(dir.path());
        assert_eq!(before.len(), 3, "{:?}", before.keys());

        std::fs::create_dir_all(dir.path().join("latest.csv").join("blocker")).unwrap();
        let next = Dataset::from_records(
            vec![record("7777", "main", "alrajhi", Some(0.3))],
            Utc.with_ymd_and_hms(2026, 3, 2, 6, 30, 0).single().unwrap(),
            1,
        )
        .unwrap();
        let err = exporter
            .export(&next, &[ExportFormat::Json, ExportFormat::Csv])
            .await
            .unwrap_err();
        assert!(matches!(err, ExportFailure::Write { .. }));

        assert_eq!(latest_files(dir.path()), before);
        let names = file_names(dir.path());
        assert!(!names.iter().any(|n| n.contains("20260302")), "{names:?}");
        assert!(names.contains(&"records_20260301T063000Z.json".to_string()));
        assert!(!names.iter().any(|n| n.starts_with('.')), "{names:?}");

        let reloaded = load_dataset(dir.path()).unwrap().expect("previous dataset");
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.get("7777@alrajhi").is_none());
    }
}
