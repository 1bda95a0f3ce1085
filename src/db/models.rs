use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{SyncError, SyncResult};

pub type LocationId = i64;

/// Flickr photo id. Numeric in practice but kept as text, the API returns strings.
pub type RemoteId = String;

/// WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> SyncResult<Self> {
        let coordinate = Self {
            latitude,
            longitude,
        };
        coordinate.validate()?;
        Ok(coordinate)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(SyncError::InvalidRequest(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(SyncError::InvalidRequest(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.5}, {:.5})", self.latitude, self.longitude)
    }
}

/// A user-placed pin. Photos and tombstones hang off it and go away with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Location {
    pub id: LocationId,
    pub latitude: f64,
    pub longitude: f64,
    /// Page count reported by the last search, if any search has completed.
    pub total_pages: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Location {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Identity of a stored photo: remote ids are only unique within one location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhotoId {
    pub location_id: LocationId,
    pub remote_id: RemoteId,
}

impl PhotoId {
    pub fn new(location_id: LocationId, remote_id: impl Into<RemoteId>) -> Self {
        Self {
            location_id,
            remote_id: remote_id.into(),
        }
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.location_id, self.remote_id)
    }
}

/// Photo metadata as it comes back from a search, before it is owned by a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub remote_id: RemoteId,
    pub image_url: String,
}

impl PhotoRecord {
    pub fn new(remote_id: impl Into<RemoteId>, image_url: impl Into<String>) -> Self {
        Self {
            remote_id: remote_id.into(),
            image_url: image_url.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Photo {
    pub location_id: LocationId,
    pub remote_id: RemoteId,
    pub image_url: String,
    /// Absent until the image has been downloaded once.
    pub image_data: Option<Vec<u8>>,
}

impl Photo {
    pub fn id(&self) -> PhotoId {
        PhotoId::new(self.location_id, self.remote_id.clone())
    }

    pub fn has_image(&self) -> bool {
        self.image_data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_bounds() {
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert!(Coordinate::new(-90.0, -180.0).is_ok());
        assert!(matches!(
            Coordinate::new(90.5, 0.0),
            Err(SyncError::InvalidRequest(_))
        ));
        assert!(matches!(
            Coordinate::new(0.0, -180.1),
            Err(SyncError::InvalidRequest(_))
        ));
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_photo_id_ordering_and_display() {
        let a = PhotoId::new(1, "10");
        let b = PhotoId::new(1, "2");
        let c = PhotoId::new(2, "1");
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.to_string(), "1/10");
    }
}
