//! Change notification for displayed photo collections.
//!
//! The notifier keeps, per location, the list of remote ids it has already
//! announced (its projection). Each time the store commits a mutation it hands
//! the notifier the new canonical list; the difference is broadcast as one
//! ordered `ChangeBatch`.
//!
//! Within a batch, deletes come first in descending position and inserts
//! follow in ascending position. Applying the events one after another to a
//! `Vec` turns the previous list into the new one, and the delete positions
//! are also valid against the list as it was before the batch.

use log::debug;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::db::{LocationId, RemoteId};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Insert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub photo_id: RemoteId,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeBatch {
    pub location_id: LocationId,
    pub events: Vec<ChangeEvent>,
}

/// Computes the ordered events turning `old` into `new`. Both must follow the
/// same canonical order without duplicates.
pub fn diff(old: &[RemoteId], new: &[RemoteId]) -> Vec<ChangeEvent> {
    let old_set: BTreeSet<&RemoteId> = old.iter().collect();
    let new_set: BTreeSet<&RemoteId> = new.iter().collect();

    let deletes = old
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, id)| !new_set.contains(id))
        .map(|(position, id)| ChangeEvent {
            kind: ChangeKind::Delete,
            photo_id: id.clone(),
            position,
        });

    let inserts = new
        .iter()
        .enumerate()
        .filter(|(_, id)| !old_set.contains(id))
        .map(|(position, id)| ChangeEvent {
            kind: ChangeKind::Insert,
            photo_id: id.clone(),
            position,
        });

    deletes.chain(inserts).collect()
}

#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<ChangeBatch>,
    projections: Arc<Mutex<HashMap<LocationId, Vec<RemoteId>>>>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            projections: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.sender.subscribe()
    }

    /// Announces the difference between what was last published for the
    /// location and `canonical`. Returns the batch, or `None` when nothing
    /// changed.
    pub fn publish(&self, location_id: LocationId, canonical: &[RemoteId]) -> Option<ChangeBatch> {
        let mut projections = self.lock_projections();

        let previous = projections.entry(location_id).or_default();
        let events = diff(previous, canonical);
        if events.is_empty() {
            return None;
        }
        *previous = canonical.to_vec();

        let batch = ChangeBatch {
            location_id,
            events,
        };
        debug!(
            "Publishing {} change(s) for location {}",
            batch.events.len(),
            location_id
        );
        // No receivers is fine
        let _ = self.sender.send(batch.clone());
        Some(batch)
    }

    /// Announces removal of everything for a deleted location and drops its projection.
    pub fn forget(&self, location_id: LocationId) -> Option<ChangeBatch> {
        let batch = self.publish(location_id, &[]);
        self.lock_projections().remove(&location_id);
        batch
    }

    /// Ids announced so far for the location.
    pub fn projected(&self, location_id: LocationId) -> Vec<RemoteId> {
        self.lock_projections()
            .get(&location_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock_projections(&self) -> MutexGuard<'_, HashMap<LocationId, Vec<RemoteId>>> {
        self.projections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Consumer-side mirror of one location's collection, built by replaying batches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    items: Vec<RemoteId>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[RemoteId] {
        &self.items
    }

    pub fn apply(&mut self, batch: &ChangeBatch) -> SyncResult<()> {
        for event in &batch.events {
            match event.kind {
                ChangeKind::Delete => {
                    if self.items.get(event.position) != Some(&event.photo_id) {
                        return Err(SyncError::InvalidRequest(format!(
                            "delete of {} at {} does not match projection",
                            event.photo_id, event.position
                        )));
                    }
                    self.items.remove(event.position);
                }
                ChangeKind::Insert => {
                    if event.position > self.items.len() {
                        return Err(SyncError::InvalidRequest(format!(
                            "insert of {} at {} beyond projection of {}",
                            event.photo_id,
                            event.position,
                            self.items.len()
                        )));
                    }
                    self.items.insert(event.position, event.photo_id.clone());
                }
            }
        }
        Ok(())
    }
}
