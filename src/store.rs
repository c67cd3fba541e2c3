//! Chart persistence keyed by owner, and the access guard in front of it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::chart::NatalChart;
use crate::{ChartError, Result};

/// Owner-keyed chart storage. `put` is an upsert: one chart per owner,
/// last writer wins.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChartStore: Send + Sync {
    /// Stores the chart under its owner and returns the chart it replaced.
    async fn put(&self, chart: NatalChart) -> Result<Option<NatalChart>>;

    async fn get(&self, owner_id: &str) -> Result<Option<NatalChart>>;
}

#[derive(Default)]
pub struct InMemoryChartStore {
    charts: RwLock<HashMap<String, NatalChart>>,
}

impl InMemoryChartStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.charts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.charts.read().await.is_empty()
    }
}

#[async_trait]
impl ChartStore for InMemoryChartStore {
    async fn put(&self, chart: NatalChart) -> Result<Option<NatalChart>> {
        let mut charts = self.charts.write().await;
        Ok(charts.insert(chart.owner_id().to_string(), chart))
    }

    async fn get(&self, owner_id: &str) -> Result<Option<NatalChart>> {
        Ok(self.charts.read().await.get(owner_id).cloned())
    }
}

/// One JSON document per owner under a root directory. Files are replaced
/// atomically by renaming a fully written temporary file over them.
pub struct FileChartStore {
    root: PathBuf,
    writes: Mutex<()>,
}

impl FileChartStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "opened chart store");
        Ok(FileChartStore {
            root,
            writes: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Owner ids are hex-encoded so any identifier maps to a safe file name.
    fn path_for(&self, owner_id: &str) -> PathBuf {
        let name: String = owner_id.bytes().map(|b| format!("{:02x}", b)).collect();
        self.root.join(format!("{}.json", name))
    }
}

fn read_chart(path: &Path) -> Result<Option<NatalChart>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_chart(root: &Path, path: &Path, chart: &NatalChart) -> Result<()> {
    let mut file = NamedTempFile::new_in(root)?;
    serde_json::to_writer_pretty(&mut file, chart)?;
    file.flush()?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| ChartError::from(err.error))?;
    Ok(())
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|err| ChartError::StoreFailure(format!("store task failed: {}", err)))?
}

#[async_trait]
impl ChartStore for FileChartStore {
    async fn put(&self, chart: NatalChart) -> Result<Option<NatalChart>> {
        let _guard = self.writes.lock().await;
        let root = self.root.clone();
        let path = self.path_for(chart.owner_id());
        blocking(move || {
            // an unreadable previous record must not block the replacement
            let previous = read_chart(&path).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "discarding unreadable chart record");
                None
            });
            write_chart(&root, &path, &chart)?;
            Ok(previous)
        })
        .await
    }

    async fn get(&self, owner_id: &str) -> Result<Option<NatalChart>> {
        let path = self.path_for(owner_id);
        blocking(move || read_chart(&path)).await
    }
}

// ---------------------------
// ## Gateway
// ---------------------------

/// Guarded access to a [`ChartStore`]. Reads are only served to the owner;
/// ownership is checked before the store is consulted, so a stranger cannot
/// tell whether a chart exists.
#[derive(Clone)]
pub struct ChartGateway {
    store: Arc<dyn ChartStore>,
}

impl ChartGateway {
    pub fn new(store: Arc<dyn ChartStore>) -> Self {
        ChartGateway { store }
    }

    #[instrument(skip_all, fields(owner = %chart.owner_id()))]
    pub async fn put(&self, chart: NatalChart) -> Result<Option<NatalChart>> {
        if chart.owner_id().trim().is_empty() {
            return Err(ChartError::MissingOwner);
        }
        let computed_at = chart.computed_at();
        let replaced = self.store.put(chart).await?;
        match &replaced {
            Some(previous) => info!(
                %computed_at,
                replaced_computed_at = %previous.computed_at(),
                "replaced natal chart"
            ),
            None => info!(%computed_at, "stored natal chart"),
        }
        Ok(replaced)
    }

    /// Reads the owner's chart on behalf of `requester_id`.
    ///
    /// Errors, in check order: `MissingOwner`, `Forbidden` (absent or
    /// different requester), `StoreFailure`, `NotFound`.
    #[instrument(skip(self))]
    pub async fn get(&self, owner_id: &str, requester_id: Option<&str>) -> Result<NatalChart> {
        if owner_id.trim().is_empty() {
            return Err(ChartError::MissingOwner);
        }
        if requester_id != Some(owner_id) {
            warn!("chart read denied");
            return Err(ChartError::Forbidden);
        }
        self.store.get(owner_id).await?.ok_or(ChartError::NotFound)
    }
}
