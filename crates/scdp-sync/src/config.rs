use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use scdp_adapters::Scope;
use scdp_core::Taxonomy;
use scdp_storage::{FetcherConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Csv,
    Xlsx,
    Xml,
    Parquet,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Xml => "xml",
            Self::Parquet => "parquet",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "xlsx" | "excel" => Ok(Self::Xlsx),
            "xml" => Ok(Self::Xml),
            "parquet" => Ok(Self::Parquet),
            other => bail!("unknown export format {other:?}"),
        }
    }
}

/// Comma-separated list; order and duplicates do not matter.
pub fn parse_formats(list: &str) -> Result<Vec<ExportFormat>> {
    let formats: BTreeSet<ExportFormat> = list
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(str::parse)
        .collect::<Result<_>>()?;
    if formats.is_empty() {
        bail!("at least one export format is required");
    }
    Ok(formats.into_iter().collect())
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub scope: Scope,
    pub formats: Vec<ExportFormat>,
    pub max_pages: usize,
    pub concurrency: usize,
    pub retry_limit: usize,
    pub confidence_threshold: f64,
    pub exports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub ocr_command: Option<String>,
    pub workspace_root: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scope: Scope::All,
            formats: vec![ExportFormat::Json, ExportFormat::Csv, ExportFormat::Xlsx, ExportFormat::Xml],
            max_pages: 20,
            concurrency: 4,
            retry_limit: 3,
            confidence_threshold: 0.6,
            exports_dir: PathBuf::from("./exports"),
            artifacts_dir: PathBuf::from("./artifacts"),
            user_agent: "scdp-bot/0.1".to_string(),
            http_timeout_secs: 30,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".to_string(),
            ocr_command: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

impl RunConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable numbers fall back to defaults; an invalid scope, format
    /// list or threshold is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let number = |key: &str, default: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(default)
        };

        let scope = match lookup("SCDP_SCOPE") {
            Some(v) => v.parse().context("parsing SCDP_SCOPE")?,
            None => defaults.scope,
        };
        let formats = match lookup("SCDP_FORMATS") {
            Some(v) => parse_formats(&v).context("parsing SCDP_FORMATS")?,
            None => defaults.formats,
        };
        let confidence_threshold = match lookup("SCDP_CONFIDENCE_THRESHOLD") {
            Some(v) => v
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|t| (0.0..=1.0).contains(t))
                .with_context(|| format!("SCDP_CONFIDENCE_THRESHOLD must be within [0, 1], got {v:?}"))?,
            None => defaults.confidence_threshold,
        };

        Ok(Self {
            scope,
            formats,
            max_pages: number("SCDP_MAX_PAGES", defaults.max_pages).max(1),
            concurrency: number("SCDP_CONCURRENCY", defaults.concurrency).max(1),
            retry_limit: number("SCDP_RETRY_LIMIT", defaults.retry_limit),
            confidence_threshold,
            exports_dir: lookup("SCDP_EXPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.exports_dir),
            artifacts_dir: lookup("SCDP_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            user_agent: lookup("SCDP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: lookup("SCDP_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            scheduler_enabled: lookup("SCDP_SCHEDULER_ENABLED")
                .map(|v| flag(&v))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: lookup("SCDP_SYNC_CRON").unwrap_or(defaults.sync_cron),
            ocr_command: lookup("SCDP_OCR_COMMAND").filter(|c| !c.trim().is_empty()),
            workspace_root: defaults.workspace_root,
        })
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency,
            per_host_concurrency: self.concurrency.clamp(1, 2),
            retry: RetryPolicy {
                max_retries: self.retry_limit,
                ..RetryPolicy::default()
            },
            ..FetcherConfig::default()
        }
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Loads `rules/taxonomy.yaml` and rejects empty or repeated keys.
pub fn load_taxonomy(path: impl AsRef<Path>) -> Result<Taxonomy> {
    let path = path.as_ref();
    let taxonomy: Taxonomy = read_yaml(path)?;
    for (kind, entries) in [
        ("market", &taxonomy.markets),
        ("certifying board", &taxonomy.certifying_boards),
        ("sector", &taxonomy.sectors),
    ] {
        let mut seen = HashSet::new();
        for entry in entries {
            if entry.key.trim().is_empty() {
                bail!("{}: {kind} entry with an empty key", path.display());
            }
            if !seen.insert(entry.key.as_str()) {
                bail!("{}: duplicate {kind} key {:?}", path.display(), entry.key);
            }
        }
    }
    if taxonomy.markets.is_empty() || taxonomy.certifying_boards.is_empty() {
        bail!("{}: taxonomy needs at least one market and one certifying board", path.display());
    }
    Ok(taxonomy)
}

fn default_similarity() -> f64 {
    0.92
}

/// Header alias table from `rules/aliases.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasTable {
    pub version: u32,
    #[serde(default)]
    pub fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_similarity")]
    pub similarity_threshold: f64,
}

pub const RECORD_FIELDS: &[&str] = &[
    "ticker",
    "name",
    "market",
    "certifying_board",
    "sector",
    "subsector",
    "year",
];

pub fn load_aliases(path: impl AsRef<Path>) -> Result<AliasTable> {
    let path = path.as_ref();
    let table: AliasTable = read_yaml(path)?;
    if let Some(unknown) = table.fields.keys().find(|k| !RECORD_FIELDS.contains(&k.as_str())) {
        bail!("{}: unknown record field {unknown:?}", path.display());
    }
    if !(0.0..=1.0).contains(&table.similarity_threshold) {
        bail!("{}: similarity_threshold must be within [0, 1]", path.display());
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let cfg = RunConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.scope, Scope::All);
        assert_eq!(
            cfg.formats,
            vec![ExportFormat::Json, ExportFormat::Csv, ExportFormat::Xlsx, ExportFormat::Xml]
        );
        assert_eq!(cfg.max_pages, 20);
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.retry_limit, 3);
        assert!((cfg.confidence_threshold - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn environment_overrides_are_parsed() {
        let cfg = RunConfig::from_lookup(lookup(&[
            ("SCDP_SCOPE", "market:parallel"),
            ("SCDP_FORMATS", "parquet, csv,csv"),
            ("SCDP_MAX_PAGES", "5"),
            ("SCDP_RETRY_LIMIT", "nope"),
            ("SCDP_OCR_COMMAND", "pdf-ocr -"),
        ]))
        .unwrap();
        assert_eq!(cfg.scope, Scope::Market("parallel".into()));
        assert_eq!(cfg.formats, vec![ExportFormat::Csv, ExportFormat::Parquet]);
        assert_eq!(cfg.max_pages, 5);
        assert_eq!(cfg.retry_limit, 3);
        assert_eq!(cfg.fetcher_config().retry.max_retries, 3);
        assert_eq!(cfg.ocr_command.as_deref(), Some("pdf-ocr -"));
    }

    #[test]
    fn invalid_scope_or_threshold_is_rejected() {
        assert!(RunConfig::from_lookup(lookup(&[("SCDP_SCOPE", "planet:mars")])).is_err());
        assert!(RunConfig::from_lookup(lookup(&[("SCDP_CONFIDENCE_THRESHOLD", "1.5")])).is_err());
        assert!(RunConfig::from_lookup(lookup(&[("SCDP_FORMATS", "json,pdf")])).is_err());
    }

    #[test]
    fn taxonomy_rejects_duplicate_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taxonomy.yaml");
        std::fs::write(
            &path,
            "version: 1\nmarkets:\n  - {key: main, label: TASI}\n  - {key: main, label: again}\ncertifying_boards:\n  - {key: alrajhi, label: x}\n",
        )
        .unwrap();
        let err = load_taxonomy(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate market key"));
    }

    #[test]
    fn workspace_rule_files_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let taxonomy = load_taxonomy(root.join("rules/taxonomy.yaml")).unwrap();
        assert!(taxonomy.market("main").is_some());
        assert!(taxonomy.board("alrajhi").is_some());
        let aliases = load_aliases(root.join("rules/aliases.yaml")).unwrap();
        assert!(aliases.metrics.contains_key("purification_amount"));
    }
}
