//! Output collaborators
//!
//! The orchestrator hands every finished batch to a [`ResultSink`]. The
//! JSON sink writes it to disk; a [`ForwardingSink`] additionally passes the
//! produced file to a [`FileSender`] under a remote path built from a
//! [`ConfigValues`] lookup.

use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

use crate::model::ResultSet;

/// Persists one finished batch.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Write `set` and return where it landed.
    async fn write(&self, set: &ResultSet) -> anyhow::Result<PathBuf>;
}

/// Transfers a produced file to its remote destination.
#[async_trait]
pub trait FileSender: Send + Sync {
    async fn send(&self, local: &Path, remote: &str) -> anyhow::Result<()>;
}

/// Named configuration or credential values.
pub trait ConfigValues: Send + Sync {
    fn value(&self, key: &str) -> Option<String>;
}

impl ConfigValues for HashMap<String, String> {
    fn value(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Writes each batch as pretty-printed JSON into a directory.
#[derive(Debug, Clone)]
pub struct JsonFileSink {
    directory: PathBuf,
}

impl JsonFileSink {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self { directory: directory.into() }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

#[async_trait]
impl ResultSink for JsonFileSink {
    async fn write(&self, set: &ResultSet) -> anyhow::Result<PathBuf> {
        fs::create_dir_all(&self.directory)
            .await
            .with_context(|| format!("Cannot create output directory {:?}", self.directory))?;

        let path = self.directory.join(set.run.file_name());
        let json = serde_json::to_string_pretty(set)?;
        fs::write(&path, json)
            .await
            .with_context(|| format!("Cannot write results to {:?}", path))?;

        info!(path = %path.display(), targets = set.len(), "Batch written");
        Ok(path)
    }
}

/// Copies files into a local directory tree, e.g. a mounted share.
#[derive(Debug, Clone)]
pub struct DirectorySender {
    root: PathBuf,
}

impl DirectorySender {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl FileSender for DirectorySender {
    async fn send(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        let destination = self.root.join(remote.trim_start_matches('/'));
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(local, &destination)
            .await
            .with_context(|| format!("Cannot copy {:?} to {:?}", local, destination))?;
        Ok(())
    }
}

/// Remote path for `local`: its file name under the base path stored at
/// `base_key`, or the bare file name when no base is configured.
pub fn remote_path(values: &dyn ConfigValues, base_key: Option<&str>, local: &Path) -> String {
    let name = local
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    match base_key.and_then(|key| values.value(key)) {
        Some(base) if !base.is_empty() => format!("{}/{}", base.trim_end_matches('/'), name),
        _ => name,
    }
}

/// Writes through an inner sink, then forwards the file. A failed
/// transfer is logged and does not fail the batch.
pub struct ForwardingSink<S> {
    inner: S,
    sender: Box<dyn FileSender>,
    values: Box<dyn ConfigValues>,
    base_key: Option<String>,
}

impl<S: ResultSink> ForwardingSink<S> {
    pub fn new(
        inner: S,
        sender: Box<dyn FileSender>,
        values: Box<dyn ConfigValues>,
        base_key: Option<String>,
    ) -> Self {
        Self { inner, sender, values, base_key }
    }
}

#[async_trait]
impl<S: ResultSink> ResultSink for ForwardingSink<S> {
    async fn write(&self, set: &ResultSet) -> anyhow::Result<PathBuf> {
        let path = self.inner.write(set).await?;
        let remote = remote_path(self.values.as_ref(), self.base_key.as_deref(), &path);

        match self.sender.send(&path, &remote).await {
            Ok(()) => info!(%remote, "Results forwarded"),
            Err(err) => warn!(%remote, "Failed to forward results: {:#}", err),
        }
        Ok(path)
    }
}
