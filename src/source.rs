//! Manifest source readers: revision-addressed stores of desired state.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::debug;

use crate::application::SourceRef;
use crate::error::SyncError;
use crate::manifest::{parse_documents, ManifestSet, Resource};

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Resolves `source` into a manifest set. Fetching the same location and
    /// revision twice yields identical sets.
    async fn fetch(&self, source: &SourceRef) -> Result<Arc<ManifestSet>, SyncError>;
}

/// Reads snapshots from a directory laid out as `<repository>/<revision>/<path>`.
///
/// Each revision directory is an immutable checkout of the repository at that
/// revision, as produced by an external sync of the version control system.
#[derive(Debug, Default, Clone)]
pub struct FilesystemSource;

impl FilesystemSource {
    pub fn new() -> Self {
        FilesystemSource
    }
}

#[async_trait]
impl ManifestSource for FilesystemSource {
    async fn fetch(&self, source: &SourceRef) -> Result<Arc<ManifestSet>, SyncError> {
        let owned = source.clone();

        tokio::task::spawn_blocking(move || read_snapshot(&owned))
            .await
            .map_err(|e| SyncError::SourceUnavailable {
                location: source.location(),
                reason: e.to_string(),
            })?
            .map(Arc::new)
    }
}

fn read_snapshot(source: &SourceRef) -> Result<ManifestSet, SyncError> {
    let root = Path::new(&source.repository);
    if !root.is_dir() {
        return Err(SyncError::SourceUnavailable {
            location: source.location(),
            reason: format!("{} is not a directory", root.display()),
        });
    }

    let not_found = || SyncError::RevisionNotFound {
        location: source.location(),
        revision: source.revision.clone(),
    };

    if !is_contained(&source.revision) || !is_contained(&source.path) {
        return Err(not_found());
    }

    let snapshot = root.join(&source.revision);
    if !snapshot.is_dir() {
        return Err(not_found());
    }

    let target = snapshot.join(&source.path);
    if !target.exists() {
        return Err(not_found());
    }

    let mut files = Vec::new();
    collect_files(&target, &mut files).map_err(|e| SyncError::SourceUnavailable {
        location: source.location(),
        reason: e.to_string(),
    })?;
    files.sort();

    let mut resources: Vec<Resource> = Vec::new();
    for file in files {
        let display = file
            .strip_prefix(&snapshot)
            .unwrap_or(file.as_path())
            .display()
            .to_string();
        let text = std::fs::read_to_string(&file).map_err(|e| SyncError::SourceUnavailable {
            location: source.location(),
            reason: format!("{display}: {e}"),
        })?;

        resources.extend(parse_documents(&display, &text)?);
    }

    debug!("read {} resources from {source}", resources.len());

    Ok(ManifestSet::new(source.revision.clone(), resources))
}

/// Rejects revisions and paths which would escape the repository root.
fn is_contained(segment: &str) -> bool {
    Path::new(segment)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn collect_files(path: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if path.is_file() {
        if is_manifest(path) {
            files.push(path.to_path_buf());
        }
        return Ok(());
    }

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        // Symlinked directories may loop back into the checkout.
        let entry_path = entry.path();
        if entry.file_type()?.is_symlink() && entry_path.is_dir() {
            debug!("skipping symlinked directory {}", entry_path.display());
            continue;
        }
        collect_files(&entry_path, files)?;
    }

    Ok(())
}

fn is_manifest(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| MANIFEST_EXTENSIONS.contains(&extension))
}

/// Reuses previously fetched revisions of the wrapped source.
///
/// Only successful fetches are cached, and at most `capacity` revisions are
/// kept, evicting the oldest first.
pub struct CachingSource<S> {
    inner: S,
    capacity: usize,
    cache: Mutex<Cache>,
}

#[derive(Default)]
struct Cache {
    entries: HashMap<SourceRef, Arc<ManifestSet>>,
    order: VecDeque<SourceRef>,
}

impl<S: ManifestSource> CachingSource<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        CachingSource {
            inner,
            capacity: capacity.max(1),
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: ManifestSource> ManifestSource for CachingSource<S> {
    async fn fetch(&self, source: &SourceRef) -> Result<Arc<ManifestSet>, SyncError> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(source)
            .cloned();

        if let Some(manifests) = cached {
            debug!("reusing cached manifests for {source}");
            return Ok(manifests);
        }

        let manifests = self.inner.fetch(source).await?;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache
            .entries
            .insert(source.clone(), manifests.clone())
            .is_none()
        {
            cache.order.push_back(source.clone());
        }
        while cache.order.len() > self.capacity {
            if let Some(evicted) = cache.order.pop_front() {
                cache.entries.remove(&evicted);
            }
        }

        Ok(manifests)
    }
}

/// Source backed by resources held in memory, keyed by location and revision.
#[derive(Default)]
pub struct InMemorySource {
    revisions: RwLock<HashMap<(String, String), Vec<Resource>>>,
    outages: AtomicUsize,
    fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new() -> Self {
        InMemorySource::default()
    }

    pub fn insert(&self, source: &SourceRef, resources: Vec<Resource>) {
        self.revisions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((source.location(), source.revision.clone()), resources);
    }

    /// Makes the next `count` fetches fail with `SourceUnavailable`.
    pub fn fail_next(&self, count: usize) {
        self.outages.store(count, Ordering::SeqCst);
    }

    /// Number of fetches served so far, failed ones included.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManifestSource for InMemorySource {
    async fn fetch(&self, source: &SourceRef) -> Result<Arc<ManifestSet>, SyncError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(SyncError::SourceUnavailable {
                location: source.location(),
                reason: "simulated outage".to_string(),
            });
        }

        let location = source.location();
        let revisions = self
            .revisions
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        match revisions.get(&(location.clone(), source.revision.clone())) {
            Some(resources) => Ok(Arc::new(ManifestSet::new(
                source.revision.clone(),
                resources.clone(),
            ))),
            None if revisions.keys().any(|(known, _)| *known == location) => {
                Err(SyncError::RevisionNotFound {
                    location,
                    revision: source.revision.clone(),
                })
            }
            None => Err(SyncError::SourceUnavailable {
                location,
                reason: "unknown repository".to_string(),
            }),
        }
    }
}
