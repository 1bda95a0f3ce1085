//! Photo-set synchronization.
//!
//! The engine reconciles the remote search with the local store, one location
//! at a time:
//!
//! 1. **Cold start**: a location that already has stored photos is served from
//!    the store without touching the network.
//! 2. **Fetch**: otherwise one search request is made (page 1 until the page
//!    count is known, a random page afterwards), tombstoned ids are dropped and
//!    the rest is upserted.
//! 3. **Coalescing**: while an attempt is in flight for a location, further
//!    callers wait on that attempt's outcome instead of issuing another request.
//!    Image downloads are coalesced per photo the same way.
//!
//! Attempts run as spawned tasks and publish their outcome on a `watch`
//! channel, so a caller that gives up does not strand the others. Every
//! attempt carries a unique generation; deleting a location invalidates it and
//! its result is discarded instead of written.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch, Semaphore};

use crate::config::Config;
use crate::db::{
    create_db_pool, Coordinate, Location, LocationId, Photo, PhotoId, PhotoRecord, PhotoStore,
    RemoteId,
};
use crate::error::{SyncError, SyncResult};
use crate::image_fetcher::{HttpImageFetcher, ImageFetcher};
use crate::notifier::{ChangeBatch, ChangeNotifier};
use crate::search_client::{FlickrClient, PhotoSearch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    Empty,
    Fetching,
    Populated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptMode {
    /// Serve stored photos if there are any, otherwise fetch.
    Load,
    /// Drop stored photos and fetch a new page.
    Refresh,
}

type Outcome<T> = Option<SyncResult<T>>;

struct LocationSlot {
    state: LoadState,
    generation: u64,
    inflight: Option<watch::Receiver<Outcome<Vec<Photo>>>>,
}

impl Default for LocationSlot {
    fn default() -> Self {
        Self {
            state: LoadState::Empty,
            generation: 0,
            inflight: None,
        }
    }
}

impl LocationSlot {
    /// Folds in the outcome of an attempt that finished while the slot was
    /// detached from the table.
    fn settled(mut self) -> Self {
        let finished = match &self.inflight {
            Some(rx) => rx.has_changed().is_err() || rx.borrow().is_some(),
            None => false,
        };
        if finished {
            if let Some(rx) = self.inflight.take() {
                self.state = match &*rx.borrow() {
                    Some(Ok(_)) => LoadState::Populated,
                    _ => LoadState::Failed,
                };
            }
        }
        self
    }
}

#[derive(Default)]
struct EngineState {
    next_generation: u64,
    locations: HashMap<LocationId, LocationSlot>,
    downloads: HashMap<PhotoId, watch::Receiver<Outcome<Vec<u8>>>>,
}

enum Join {
    /// Started or joined an attempt whose outcome answers the call.
    Wait(watch::Receiver<Outcome<Vec<Photo>>>),
    /// Another attempt is running; it must finish before a refresh can start.
    Busy(watch::Receiver<Outcome<Vec<Photo>>>),
    /// Already populated, read the store.
    Stored,
}

#[derive(Clone)]
pub struct SyncEngine {
    store: PhotoStore,
    search: Arc<dyn PhotoSearch>,
    fetcher: Arc<dyn ImageFetcher>,
    download_permits: Arc<Semaphore>,
    state: Arc<Mutex<EngineState>>,
}

impl SyncEngine {
    pub fn new(
        store: PhotoStore,
        search: Arc<dyn PhotoSearch>,
        fetcher: Arc<dyn ImageFetcher>,
        download_concurrency: usize,
    ) -> Self {
        Self {
            store,
            search,
            fetcher,
            download_permits: Arc::new(Semaphore::new(download_concurrency.max(1))),
            state: Arc::new(Mutex::new(EngineState::default())),
        }
    }

    /// Wires the production stack: on-disk store, Flickr search and HTTP downloads.
    pub async fn from_config(config: &Config) -> SyncResult<Self> {
        let pool = create_db_pool(&config.db_path).await?;
        let store = PhotoStore::new(pool, ChangeNotifier::new(config.event_buffer));
        let search = Arc::new(FlickrClient::new(config.search.clone()));
        let fetcher = Arc::new(HttpImageFetcher::new(config.search.request_timeout()));

        Ok(Self::new(
            store,
            search,
            fetcher,
            config.download_concurrency,
        ))
    }

    pub fn store(&self) -> &PhotoStore {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.store.notifier().subscribe()
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self, location_id: LocationId) -> LoadState {
        self.lock_state()
            .locations
            .get(&location_id)
            .map(|slot| slot.state)
            .unwrap_or(LoadState::Empty)
    }

    fn is_current(&self, location_id: LocationId, generation: u64) -> bool {
        self.lock_state()
            .locations
            .get(&location_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    // ===== LOCATIONS =====

    pub async fn create_location(&self, coordinate: Coordinate) -> SyncResult<Location> {
        self.store.create_location(coordinate).await
    }

    pub async fn locations(&self) -> SyncResult<Vec<Location>> {
        self.store.list_locations().await
    }

    /// Deletes the location with its photos and tombstones. An attempt still in
    /// flight for it finishes as `Cancelled` without writing.
    ///
    /// If the store refuses the delete, the slot is put back and the location
    /// keeps its state.
    pub async fn delete_location(&self, location_id: LocationId) -> SyncResult<bool> {
        let removed = self.lock_state().locations.remove(&location_id);

        match self.store.delete_location(location_id).await {
            Ok(existed) => {
                if removed.as_ref().is_some_and(|slot| slot.inflight.is_some()) {
                    info!(
                        "Location {} deleted while fetching, in-flight result discarded",
                        location_id
                    );
                }
                Ok(existed)
            }
            Err(e) => {
                if let Some(slot) = removed {
                    warn!("Delete of location {} failed, keeping its state: {}", location_id, e);
                    self.lock_state()
                        .locations
                        .entry(location_id)
                        .or_insert_with(|| slot.settled());
                }
                Err(e)
            }
        }
    }

    // ===== PHOTO SETS =====

    /// Makes sure the location has a photo set and returns it in canonical order.
    pub async fn ensure_loaded(&self, location_id: LocationId) -> SyncResult<Vec<Photo>> {
        match self.join_or_start(location_id, AttemptMode::Load) {
            Join::Wait(rx) | Join::Busy(rx) => await_outcome(rx).await,
            Join::Stored => self.store.list_photos(location_id).await,
        }
    }

    /// Replaces the stored (non-deleted) photos with a freshly fetched page.
    pub async fn refresh(&self, location_id: LocationId) -> SyncResult<Vec<Photo>> {
        loop {
            match self.join_or_start(location_id, AttemptMode::Refresh) {
                Join::Busy(rx) => {
                    debug!(
                        "Refresh of location {} waiting for the in-flight attempt",
                        location_id
                    );
                    let _ = await_outcome(rx).await;
                }
                Join::Wait(rx) => return await_outcome(rx).await,
                Join::Stored => return self.store.list_photos(location_id).await,
            }
        }
    }

    /// Deletes the given photos and tombstones them. Ids that are not stored
    /// are ignored, so repeating a deletion changes nothing.
    pub async fn delete_photos<I>(&self, location_id: LocationId, remote_ids: I) -> SyncResult<Vec<RemoteId>>
    where
        I: IntoIterator<Item = RemoteId>,
    {
        let mut ids: Vec<RemoteId> = remote_ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        self.store.delete_photos(location_id, &ids).await
    }

    fn join_or_start(&self, location_id: LocationId, mode: AttemptMode) -> Join {
        let mut state = self.lock_state();
        state.next_generation += 1;
        let generation = state.next_generation;
        let slot = state.locations.entry(location_id).or_default();

        if let Some(rx) = &slot.inflight {
            // A closed channel without an outcome means the attempt task died.
            if rx.has_changed().is_ok() {
                if mode == AttemptMode::Refresh {
                    return Join::Busy(rx.clone());
                }
                debug!("Coalescing onto in-flight fetch for location {}", location_id);
                return Join::Wait(rx.clone());
            }
        }

        if mode == AttemptMode::Load && slot.state == LoadState::Populated {
            return Join::Stored;
        }

        let (tx, rx) = watch::channel(None);
        slot.state = LoadState::Fetching;
        slot.generation = generation;
        slot.inflight = Some(rx.clone());
        drop(state);

        let engine = self.clone();
        tokio::spawn(async move {
            engine.run_attempt(location_id, generation, mode, tx).await;
        });

        Join::Wait(rx)
    }

    async fn run_attempt(
        self,
        location_id: LocationId,
        generation: u64,
        mode: AttemptMode,
        tx: watch::Sender<Outcome<Vec<Photo>>>,
    ) {
        let outcome = self.attempt(location_id, generation, mode).await;

        {
            let mut state = self.lock_state();
            if let Some(slot) = state.locations.get_mut(&location_id) {
                if slot.generation == generation {
                    slot.inflight = None;
                    slot.state = match &outcome {
                        Ok(_) => LoadState::Populated,
                        Err(_) => LoadState::Failed,
                    };
                }
            }
            // No slot for ids the store does not know
            if matches!(outcome, Err(SyncError::NotFound(_)))
                && state
                    .locations
                    .get(&location_id)
                    .is_some_and(|slot| slot.generation == generation)
            {
                state.locations.remove(&location_id);
            }
        }

        match &outcome {
            Ok(photos) => info!(
                "Location {} populated with {} photo(s)",
                location_id,
                photos.len()
            ),
            Err(SyncError::Cancelled(reason)) => debug!("Location {}: {}", location_id, reason),
            Err(e) => warn!("Sync of location {} failed: {}", location_id, e),
        }

        let _ = tx.send(Some(outcome));
    }

    async fn attempt(
        &self,
        location_id: LocationId,
        generation: u64,
        mode: AttemptMode,
    ) -> SyncResult<Vec<Photo>> {
        let location = self
            .store
            .get_location(location_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("location {}", location_id)))?;

        match mode {
            AttemptMode::Refresh => {
                self.store.clear_photos(location_id).await?;
            }
            AttemptMode::Load => {
                if self.store.count_photos(location_id).await? > 0 {
                    debug!("Location {} already has stored photos", location_id);
                    self.store.announce_current(location_id).await?;
                    return self.store.list_photos(location_id).await;
                }
            }
        }

        let page = choose_page(location.total_pages);
        info!(
            "Fetching page {} for location {} at {}",
            page,
            location_id,
            location.coordinate()
        );
        let result = self.search.search_photos(location.coordinate(), page).await?;
        self.check_current(location_id, generation)?;

        if location.total_pages != Some(i64::from(result.total_pages)) {
            self.store
                .set_total_pages(location_id, result.total_pages)
                .await
                .map_err(|e| self.cancelled_or(location_id, generation, e))?;
        }

        let tombstones = self.store.tombstones(location_id).await?;
        let fresh: Vec<PhotoRecord> = result
            .photos
            .into_iter()
            .filter(|record| !tombstones.contains(&record.remote_id))
            .collect();

        self.check_current(location_id, generation)?;
        let inserted = self
            .store
            .upsert_photos(location_id, &fresh)
            .await
            .map_err(|e| self.cancelled_or(location_id, generation, e))?;
        debug!(
            "Location {}: {} new photo(s) after dropping {} tombstoned",
            location_id,
            inserted.len(),
            tombstones.len()
        );

        self.store.list_photos(location_id).await
    }

    fn check_current(&self, location_id: LocationId, generation: u64) -> SyncResult<()> {
        if self.is_current(location_id, generation) {
            Ok(())
        } else {
            Err(SyncError::Cancelled(format!(
                "location {} was removed during sync, result discarded",
                location_id
            )))
        }
    }

    /// A store error caused by the location disappearing mid-attempt is a cancellation.
    fn cancelled_or(&self, location_id: LocationId, generation: u64, e: SyncError) -> SyncError {
        match self.check_current(location_id, generation) {
            Err(cancelled) => cancelled,
            Ok(()) => e,
        }
    }

    // ===== IMAGES =====

    /// Returns the photo's image bytes, downloading and caching them on first
    /// use. Concurrent callers for the same photo share one download.
    pub async fn ensure_image_loaded(&self, photo_id: &PhotoId) -> SyncResult<Vec<u8>> {
        let photo = self
            .store
            .get_photo(photo_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("photo {}", photo_id)))?;

        if let Some(bytes) = photo.image_data {
            return Ok(bytes);
        }

        let rx = self.join_or_start_download(photo_id, photo.image_url);
        await_outcome(rx).await
    }

    fn join_or_start_download(
        &self,
        photo_id: &PhotoId,
        url: String,
    ) -> watch::Receiver<Outcome<Vec<u8>>> {
        let mut state = self.lock_state();
        if let Some(rx) = state.downloads.get(photo_id) {
            if rx.has_changed().is_ok() {
                debug!("Coalescing onto in-flight download of {}", photo_id);
                return rx.clone();
            }
        }

        let (tx, rx) = watch::channel(None);
        state.downloads.insert(photo_id.clone(), rx.clone());
        drop(state);

        let engine = self.clone();
        let photo_id = photo_id.clone();
        tokio::spawn(async move {
            let outcome = engine.download(&photo_id, &url).await;
            if let Err(e) = &outcome {
                warn!("Image for {} not loaded: {}", photo_id, e);
            }
            engine.lock_state().downloads.remove(&photo_id);
            let _ = tx.send(Some(outcome));
        });

        rx
    }

    async fn download(&self, photo_id: &PhotoId, url: &str) -> SyncResult<Vec<u8>> {
        // Another download may have finished between the caller's read and ours.
        match self.store.get_photo(photo_id).await? {
            Some(Photo {
                image_data: Some(bytes),
                ..
            }) => return Ok(bytes),
            Some(_) => {}
            None => return Err(SyncError::NotFound(format!("photo {}", photo_id))),
        }

        let _permit = self
            .download_permits
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled("download pool closed".to_string()))?;

        let bytes = self.fetcher.fetch_bytes(url).await?;
        self.store.set_image_bytes(photo_id, &bytes).await?;
        debug!("Cached {} bytes for {}", bytes.len(), photo_id);
        Ok(bytes)
    }
}

async fn await_outcome<T: Clone>(mut rx: watch::Receiver<Outcome<T>>) -> SyncResult<T> {
    let outcome = rx
        .wait_for(Option::is_some)
        .await
        .map_err(|_| SyncError::Cancelled("attempt ended without a result".to_string()))?
        .clone();

    outcome.unwrap_or_else(|| Err(SyncError::Cancelled("attempt ended without a result".to_string())))
}

/// Page 1 until the page count is known (or known to be zero), then a
/// uniformly random page.
fn choose_page(total_pages: Option<i64>) -> u32 {
    match total_pages {
        Some(total) if total > 1 => {
            let upper = u32::try_from(total).unwrap_or(u32::MAX);
            rand::random_range(1..=upper)
        }
        _ => 1,
    }
}
