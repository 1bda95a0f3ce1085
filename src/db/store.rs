use chrono::Utc;
use log::{debug, info};
use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::db::{Coordinate, DbPool, Location, LocationId, Photo, PhotoId, PhotoRecord, RemoteId};
use crate::error::{SyncError, SyncResult};
use crate::notifier::ChangeNotifier;

const PHOTO_COLUMNS: &str = "location_id, remote_id, image_url, image_data";
const LOCATION_COLUMNS: &str = "id, latitude, longitude, total_pages, created_at";
/// Flickr ids are decimal strings; shorter first keeps them in numeric order.
const CANONICAL_ORDER: &str = "length(remote_id), remote_id";

/// Durable storage for locations, their photos and deletion tombstones.
///
/// Every mutation runs in a single transaction. Mutations of one location are
/// additionally serialized by a per-location writer lock that stays held until
/// the resulting change batch has been published, so batches go out in commit
/// order.
#[derive(Clone)]
pub struct PhotoStore {
    pool: DbPool,
    notifier: ChangeNotifier,
    write_locks: Arc<Mutex<HashMap<LocationId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PhotoStore {
    pub fn new(pool: DbPool, notifier: ChangeNotifier) -> Self {
        Self {
            pool,
            notifier,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    fn write_lock(&self, location_id: LocationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(location_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Drops the writer lock of a location that no longer exists.
    fn release_write_lock(&self, location_id: LocationId) {
        self.write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&location_id);
    }

    // ===== LOCATIONS =====

    pub async fn create_location(&self, coordinate: Coordinate) -> SyncResult<Location> {
        coordinate.validate()?;

        let location = sqlx::query_as::<_, Location>(&format!(
            "INSERT INTO locations (latitude, longitude, total_pages, created_at)
             VALUES (?, ?, NULL, ?)
             RETURNING {}",
            LOCATION_COLUMNS
        ))
        .bind(coordinate.latitude)
        .bind(coordinate.longitude)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        info!("Created location {} at {}", location.id, coordinate);
        Ok(location)
    }

    pub async fn get_location(&self, location_id: LocationId) -> SyncResult<Option<Location>> {
        let location = sqlx::query_as::<_, Location>(&format!(
            "SELECT {} FROM locations WHERE id = ?",
            LOCATION_COLUMNS
        ))
        .bind(location_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(location)
    }

    pub async fn list_locations(&self) -> SyncResult<Vec<Location>> {
        let locations = sqlx::query_as::<_, Location>(&format!(
            "SELECT {} FROM locations ORDER BY id",
            LOCATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(locations)
    }

    pub async fn set_total_pages(&self, location_id: LocationId, total_pages: u32) -> SyncResult<()> {
        let result = sqlx::query("UPDATE locations SET total_pages = ? WHERE id = ?")
            .bind(i64::from(total_pages))
            .bind(location_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("location {}", location_id)));
        }
        Ok(())
    }

    /// Removes the location; photos and tombstones go with it through the
    /// foreign key cascade. Returns false when the location did not exist.
    pub async fn delete_location(&self, location_id: LocationId) -> SyncResult<bool> {
        let lock = self.write_lock(location_id);
        let _guard = lock.lock().await;

        let result = sqlx::query("DELETE FROM locations WHERE id = ?")
            .bind(location_id)
            .execute(&self.pool)
            .await?;

        self.release_write_lock(location_id);
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.notifier.forget(location_id);
        info!("Deleted location {}", location_id);
        Ok(true)
    }

    // ===== PHOTOS =====

    /// Photos of a location in canonical order (ascending numeric remote id).
    pub async fn list_photos(&self, location_id: LocationId) -> SyncResult<Vec<Photo>> {
        let photos = sqlx::query_as::<_, Photo>(&format!(
            "SELECT {} FROM photos WHERE location_id = ? ORDER BY {}",
            PHOTO_COLUMNS, CANONICAL_ORDER
        ))
        .bind(location_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(photos)
    }

    pub async fn count_photos(&self, location_id: LocationId) -> SyncResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM photos WHERE location_id = ?")
            .bind(location_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_photo(&self, photo_id: &PhotoId) -> SyncResult<Option<Photo>> {
        let photo = sqlx::query_as::<_, Photo>(&format!(
            "SELECT {} FROM photos WHERE location_id = ? AND remote_id = ?",
            PHOTO_COLUMNS
        ))
        .bind(photo_id.location_id)
        .bind(&photo_id.remote_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(photo)
    }

    /// Inserts the records that are neither stored nor tombstoned for the
    /// location and returns their remote ids in input order. The whole batch is
    /// rejected before any write if a record is incomplete.
    pub async fn upsert_photos(
        &self,
        location_id: LocationId,
        records: &[PhotoRecord],
    ) -> SyncResult<Vec<RemoteId>> {
        if let Some(bad) = records
            .iter()
            .find(|r| r.remote_id.is_empty() || r.image_url.is_empty())
        {
            return Err(SyncError::InvalidRequest(format!(
                "incomplete photo record {:?}",
                bad
            )));
        }

        let lock = self.write_lock(location_id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM locations WHERE id = ?)")
            .bind(location_id)
            .fetch_one(&mut *tx)
            .await?;
        if !exists {
            self.release_write_lock(location_id);
            return Err(SyncError::NotFound(format!("location {}", location_id)));
        }

        let mut inserted = Vec::new();
        for record in records {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO photos (location_id, remote_id, image_url)
                 SELECT ?, ?, ?
                 WHERE NOT EXISTS (
                     SELECT 1 FROM tombstones WHERE location_id = ? AND remote_id = ?
                 )",
            )
            .bind(location_id)
            .bind(&record.remote_id)
            .bind(&record.image_url)
            .bind(location_id)
            .bind(&record.remote_id)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                inserted.push(record.remote_id.clone());
            }
        }

        let canonical = canonical_ids(&mut *tx, location_id).await?;
        tx.commit().await?;

        debug!(
            "Upserted {} of {} photo(s) for location {}",
            inserted.len(),
            records.len(),
            location_id
        );
        self.notifier.publish(location_id, &canonical);
        Ok(inserted)
    }

    pub async fn set_image_bytes(&self, photo_id: &PhotoId, bytes: &[u8]) -> SyncResult<()> {
        let lock = self.write_lock(photo_id.location_id);
        let _guard = lock.lock().await;

        let result = sqlx::query(
            "UPDATE photos SET image_data = ? WHERE location_id = ? AND remote_id = ?",
        )
        .bind(bytes)
        .bind(photo_id.location_id)
        .bind(&photo_id.remote_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound(format!("photo {}", photo_id)));
        }
        Ok(())
    }

    /// Removes one photo and tombstones it. Absent photos are a no-op.
    pub async fn delete_photo(&self, photo_id: &PhotoId) -> SyncResult<bool> {
        let removed = self
            .delete_photos(photo_id.location_id, std::slice::from_ref(&photo_id.remote_id))
            .await?;
        Ok(!removed.is_empty())
    }

    /// Removes the listed photos of a location and tombstones each removed id,
    /// all in one transaction. Returns the ids that were actually present.
    pub async fn delete_photos(
        &self,
        location_id: LocationId,
        remote_ids: &[RemoteId],
    ) -> SyncResult<Vec<RemoteId>> {
        let lock = self.write_lock(location_id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let mut removed = Vec::new();
        for remote_id in remote_ids {
            let result = sqlx::query("DELETE FROM photos WHERE location_id = ? AND remote_id = ?")
                .bind(location_id)
                .bind(remote_id)
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() == 0 {
                continue;
            }

            sqlx::query(
                "INSERT OR IGNORE INTO tombstones (location_id, remote_id, created_at)
                 VALUES (?, ?, ?)",
            )
            .bind(location_id)
            .bind(remote_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            removed.push(remote_id.clone());
        }

        if removed.is_empty() {
            tx.rollback().await?;
            return Ok(removed);
        }

        let canonical = canonical_ids(&mut *tx, location_id).await?;
        tx.commit().await?;

        info!(
            "Deleted and tombstoned {} photo(s) for location {}",
            removed.len(),
            location_id
        );
        self.notifier.publish(location_id, &canonical);
        Ok(removed)
    }

    /// Drops every stored photo of the location without tombstoning them.
    pub async fn clear_photos(&self, location_id: LocationId) -> SyncResult<Vec<RemoteId>> {
        let lock = self.write_lock(location_id);
        let _guard = lock.lock().await;

        let mut tx = self.pool.begin().await?;
        let cleared = canonical_ids(&mut *tx, location_id).await?;
        sqlx::query("DELETE FROM photos WHERE location_id = ?")
            .bind(location_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!("Cleared {} photo(s) for location {}", cleared.len(), location_id);
        self.notifier.publish(location_id, &[]);
        Ok(cleared)
    }

    pub async fn is_tombstoned(&self, location_id: LocationId, remote_id: &str) -> SyncResult<bool> {
        let tombstoned: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM tombstones WHERE location_id = ? AND remote_id = ?)",
        )
        .bind(location_id)
        .bind(remote_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(tombstoned)
    }

    pub async fn tombstones(&self, location_id: LocationId) -> SyncResult<BTreeSet<RemoteId>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT remote_id FROM tombstones WHERE location_id = ?",
        )
        .bind(location_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Brings the notifier's projection up to date with what is stored, e.g.
    /// for photos persisted by an earlier run.
    pub async fn announce_current(&self, location_id: LocationId) -> SyncResult<()> {
        let lock = self.write_lock(location_id);
        let _guard = lock.lock().await;

        let mut conn = self.pool.acquire().await?;
        let canonical = canonical_ids(&mut *conn, location_id).await?;
        self.notifier.publish(location_id, &canonical);
        Ok(())
    }
}

async fn canonical_ids(
    conn: &mut SqliteConnection,
    location_id: LocationId,
) -> SyncResult<Vec<RemoteId>> {
    let ids = sqlx::query_scalar::<_, String>(&format!(
        "SELECT remote_id FROM photos WHERE location_id = ? ORDER BY {}",
        CANONICAL_ORDER
    ))
    .bind(location_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}
