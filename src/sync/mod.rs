//! Album sync engine. Decides per pin whether the cached album is enough or
//! a fresh page of photos must be fetched, and keeps at most one fetch cycle
//! running per pin.
//!
//! A fetch cycle searches one randomly chosen result page, downloads every
//! reference with bounded concurrency, and saves each image as it arrives.
//! Failed downloads are skipped, never retried; a failed search yields an
//! empty album. Storage errors abort the cycle and are returned.

pub mod lock;
pub mod pages;

use std::collections::BTreeSet;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::source::PhotoSource;
use crate::store::{PhotoId, Pin, PinId, PinStore, StoreError};

pub use lock::AlbumLocks;
pub use pages::PageWindow;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Album lock {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Lock task failed: {0}")]
    Spawn(#[from] tokio::task::JoinError),
}

/// Engine tuning, decoupled from CLI parsing.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of simultaneous image downloads per cycle.
    pub concurrent_downloads: usize,
    /// Upper bound of the random page window.
    pub max_page: u32,
    /// Directory for per-pin lock files. Without one, fetch slots are only
    /// exclusive within this engine.
    pub lock_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrent_downloads: 4,
            max_page: 10,
            lock_dir: None,
        }
    }
}

/// What a call to [`AlbumSyncEngine::ensure_photos`] or
/// [`AlbumSyncEngine::refresh`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The album already had photos; nothing was fetched.
    Cached { photos: u64 },
    /// A fetch cycle ran to completion.
    Fetched(CycleReport),
    /// Another cycle for this pin is in flight; the request was rejected.
    AlreadyFetching,
}

/// Result of one fetch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub page: u32,
    pub references: usize,
    pub saved: usize,
    pub failed: usize,
    pub search_failed: bool,
}

/// Marks a pin as fetching for as long as it is alive.
struct FetchGuard<'a> {
    fetching: &'a watch::Sender<BTreeSet<PinId>>,
    pin_id: PinId,
    lock_file: Option<File>,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        // Unlock before the pin leaves the set.
        drop(self.lock_file.take());
        let pin_id = self.pin_id;
        self.fetching.send_modify(|set| {
            set.remove(&pin_id);
        });
        tracing::debug!(pin_id = %pin_id, "Fetch slot released");
    }
}

pub struct AlbumSyncEngine {
    store: Arc<dyn PinStore>,
    source: Arc<dyn PhotoSource>,
    /// Pins with a fetch cycle in flight. A pin's "new collection" trigger is
    /// enabled exactly when it is absent from this set.
    fetching: watch::Sender<BTreeSet<PinId>>,
    pages: PageWindow,
    concurrent_downloads: usize,
    locks: Option<AlbumLocks>,
}

impl std::fmt::Debug for AlbumSyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlbumSyncEngine")
            .field("fetching", &*self.fetching.borrow())
            .field("pages", &self.pages)
            .field("concurrent_downloads", &self.concurrent_downloads)
            .finish_non_exhaustive()
    }
}

impl AlbumSyncEngine {
    pub fn new(store: Arc<dyn PinStore>, source: Arc<dyn PhotoSource>, config: SyncConfig) -> Self {
        let (fetching, _) = watch::channel(BTreeSet::new());
        Self {
            store,
            source,
            fetching,
            pages: PageWindow::new(config.max_page),
            concurrent_downloads: config.concurrent_downloads.max(1),
            locks: config.lock_dir.as_deref().map(AlbumLocks::new),
        }
    }

    pub fn is_fetching(&self, pin_id: PinId) -> bool {
        self.fetching.borrow().contains(&pin_id)
    }

    /// Whether a presenter should offer "new collection" for this pin.
    pub fn trigger_enabled(&self, pin_id: PinId) -> bool {
        !self.is_fetching(pin_id)
    }

    /// Observe the set of pins with a fetch cycle in flight.
    pub fn watch_fetching(&self) -> watch::Receiver<BTreeSet<PinId>> {
        self.fetching.subscribe()
    }

    /// Claim the pin's fetch slot, or `None` if a cycle already holds it,
    /// here or in another process sharing the lock directory.
    ///
    /// The pin only enters the fetching set once its lock file is held.
    async fn try_claim(&self, pin_id: PinId) -> Result<Option<FetchGuard<'_>>, SyncError> {
        if self.is_fetching(pin_id) {
            return Ok(None);
        }
        let lock_file = match &self.locks {
            Some(locks) => match locks.try_acquire(pin_id).await? {
                Some(file) => Some(file),
                None => return Ok(None),
            },
            None => None,
        };
        let claimed = self.fetching.send_if_modified(|set| set.insert(pin_id));
        if !claimed {
            return Ok(None);
        }
        tracing::debug!(pin_id = %pin_id, "Fetch slot claimed");
        Ok(Some(FetchGuard {
            fetching: &self.fetching,
            pin_id,
            lock_file,
        }))
    }

    /// Make sure the pin has an album: use the cache if it has photos,
    /// otherwise run a fetch cycle.
    pub async fn ensure_photos(&self, pin: &Pin) -> Result<SyncOutcome, SyncError> {
        if self.is_fetching(pin.id) {
            tracing::debug!(pin_id = %pin.id, "Fetch already in flight");
            return Ok(SyncOutcome::AlreadyFetching);
        }

        if self.store.get_pin(pin.id).await?.is_none() {
            return Err(StoreError::PinNotFound(pin.id).into());
        }

        let cached = self.store.count_photos(pin.id).await?;
        if cached > 0 {
            tracing::debug!(pin_id = %pin.id, photos = cached, "Album cached");
            return Ok(SyncOutcome::Cached { photos: cached });
        }

        let Some(guard) = self.try_claim(pin.id).await? else {
            tracing::debug!(pin_id = %pin.id, "Fetch already in flight");
            return Ok(SyncOutcome::AlreadyFetching);
        };

        // A cycle may have finished between the count and the claim.
        let cached = self.store.count_photos(pin.id).await?;
        if cached > 0 {
            return Ok(SyncOutcome::Cached { photos: cached });
        }

        tracing::info!(pin_id = %pin.id, coordinate = %pin.coordinate, "Album empty, fetching photos");
        let report = self.run_cycle(pin, &guard).await?;
        Ok(SyncOutcome::Fetched(report))
    }

    /// Replace the pin's album with a freshly chosen page of photos.
    pub async fn refresh(&self, pin: &Pin) -> Result<SyncOutcome, SyncError> {
        let Some(guard) = self.try_claim(pin.id).await? else {
            tracing::debug!(pin_id = %pin.id, "Refresh rejected, fetch already in flight");
            return Ok(SyncOutcome::AlreadyFetching);
        };

        let removed = self.store.delete_all_photos(pin.id).await?;
        tracing::info!(pin_id = %pin.id, removed, "Cleared album for new collection");

        let report = self.run_cycle(pin, &guard).await?;
        Ok(SyncOutcome::Fetched(report))
    }

    /// Remove one photo. Allowed at any time, including mid-cycle.
    pub async fn delete_photo(&self, photo_id: PhotoId) -> Result<(), SyncError> {
        self.store.delete_photo(photo_id).await?;
        Ok(())
    }

    /// Run [`ensure_photos`](Self::ensure_photos) on a detached task.
    ///
    /// The cycle keeps saving photos after the caller stops observing the
    /// album; only the caller's view is torn down.
    pub fn spawn_ensure_photos(
        self: &Arc<Self>,
        pin: Pin,
    ) -> JoinHandle<Result<SyncOutcome, SyncError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.ensure_photos(&pin).await })
    }

    /// Run [`refresh`](Self::refresh) on a detached task.
    pub fn spawn_refresh(self: &Arc<Self>, pin: Pin) -> JoinHandle<Result<SyncOutcome, SyncError>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.refresh(&pin).await })
    }

    /// One search-then-download pass. The caller holds the pin's fetch slot.
    ///
    /// Completes only once every reference has either been saved or failed.
    async fn run_cycle(
        &self,
        pin: &Pin,
        _slot: &FetchGuard<'_>,
    ) -> Result<CycleReport, SyncError> {
        let page = self.pages.choose();
        let mut report = CycleReport {
            page,
            ..CycleReport::default()
        };

        let results = match self.source.search(pin.coordinate, page).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(pin_id = %pin.id, page, error = %e, "Photo search failed, album left empty");
                report.search_failed = true;
                return Ok(report);
            }
        };
        self.pages.observe(results.page_count);
        report.references = results.references.len();
        tracing::debug!(
            pin_id = %pin.id,
            page,
            page_count = results.page_count,
            references = report.references,
            "Search returned"
        );

        let source = &self.source;
        let mut downloads = stream::iter(results.references)
            .map(|reference| async move {
                let result = source.fetch(&reference).await;
                (reference, result)
            })
            .buffer_unordered(self.concurrent_downloads);

        while let Some((reference, result)) = downloads.next().await {
            match result {
                Ok(image) => {
                    // Dropping `downloads` on error cancels the fetches still in flight.
                    self.store.save_photo(pin.id, image).await?;
                    report.saved += 1;
                }
                Err(e) => {
                    tracing::warn!(pin_id = %pin.id, reference = %reference, error = %e, "Photo download failed, skipping");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            pin_id = %pin.id,
            saved = report.saved,
            failed = report.failed,
            "Fetch cycle complete"
        );
        Ok(report)
    }
}
