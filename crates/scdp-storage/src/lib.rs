//! Raw-document archive, atomic file promotion and the retrying fetcher for SCDP.

mod fetch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use scdp_core::{sha256_hex, ContentHint, RawDocument};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

pub use fetch::{
    FetchError, Fetched, FetcherConfig, HttpFetcher, IntegrityPolicy, ReqwestTransport, RetryEvent,
    RetryPolicy, RetryReason, Sleeper, TokioSleeper, Transport, TransportFailure, TransportResponse,
};

pub const CRATE_NAME: &str = "scdp-storage";

/// Cooperative cancellation signal shared by every worker of a run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A fully written temp file waiting to be renamed over its destination.
#[derive(Debug)]
pub struct StagedFile {
    temp_path: PathBuf,
    dest: PathBuf,
    sha256: String,
    bytes: u64,
}

impl StagedFile {
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes
    }

    pub async fn promote(self) -> anyhow::Result<PathBuf> {
        match fs::rename(&self.temp_path, &self.dest).await {
            Ok(()) => Ok(self.dest),
            Err(err) => {
                let _ = fs::remove_file(&self.temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming {} -> {}",
                        self.temp_path.display(),
                        self.dest.display()
                    )
                })
            }
        }
    }

    pub async fn discard(self) {
        let _ = fs::remove_file(&self.temp_path).await;
    }
}

/// Write `bytes` to a hidden temp file next to `dest` and flush it to disk.
/// Nothing is visible under `dest` until [`StagedFile::promote`].
pub async fn stage_file(dest: &Path, bytes: &[u8]) -> anyhow::Result<StagedFile> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;

    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    Ok(StagedFile {
        temp_path,
        dest: dest.to_path_buf(),
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    })
}

pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    stage_file(dest, bytes).await?.promote().await
}

/// What a destination held before a promotion overwrote it.
#[derive(Debug)]
enum Prior {
    Missing,
    File(PathBuf),
    /// A directory or other non-file; promotion over it fails and leaves it alone.
    Other,
}

/// A hidden hard link (or copy) of a destination taken before promotion, so
/// a multi-file promotion that fails halfway can put every file back.
#[derive(Debug)]
pub struct FileBackup {
    dest: PathBuf,
    prior: Prior,
}

impl FileBackup {
    pub async fn take(dest: &Path) -> anyhow::Result<Self> {
        let prior = match fs::symlink_metadata(dest).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Prior::Missing,
            Err(err) => return Err(err).with_context(|| format!("inspecting {}", dest.display())),
            Ok(meta) if !meta.is_file() => Prior::Other,
            Ok(_) => {
                let parent = dest
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let saved = parent.join(format!(".{}.prev", Uuid::new_v4()));
                if fs::hard_link(dest, &saved).await.is_err() {
                    fs::copy(dest, &saved)
                        .await
                        .with_context(|| format!("backing up {}", dest.display()))?;
                }
                Prior::File(saved)
            }
        };
        Ok(Self {
            dest: dest.to_path_buf(),
            prior,
        })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Put the previous content back, or remove a destination that did not
    /// exist before.
    pub async fn restore(self) {
        let result = match &self.prior {
            Prior::File(saved) => fs::rename(saved, &self.dest).await,
            Prior::Missing => fs::remove_file(&self.dest).await,
            Prior::Other => Ok(()),
        };
        if let Err(err) = result {
            warn!(path = %self.dest.display(), error = %err, "could not restore file after failed promotion");
        }
    }

    /// Drop the saved copy once the new content is final.
    pub async fn release(self) {
        if let Prior::File(saved) = self.prior {
            let _ = fs::remove_file(saved).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of fetched raw documents.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        retrieved_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = retrieved_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(source_id)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_document(&self, document: &RawDocument) -> anyhow::Result<StoredArtifact> {
        let ext = match document.effective_hint() {
            ContentHint::Html => "html",
            ContentHint::Pdf => "pdf",
            ContentHint::Unknown => "bin",
        };
        let relative_path = self.artifact_relative_path(
            document.retrieved_at(),
            &document.source().source_id,
            document.content_hash(),
            ext,
        );
        let absolute_path = self.root.join(&relative_path);
        let artifact = StoredArtifact {
            content_hash: document.content_hash().to_string(),
            relative_path,
            absolute_path: absolute_path.clone(),
            byte_size: document.body().len(),
            deduplicated: true,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact);
        }

        write_atomic(&absolute_path, document.body()).await?;
        Ok(StoredArtifact {
            deduplicated: false,
            ..artifact
        })
    }
}
