//! Types for the pin store.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Row id of a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PinId(pub i64);

/// Row id of a photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PhotoId(pub i64);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point on the map, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.latitude, self.longitude)
    }
}

/// A saved point of interest. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    pub id: PinId,
    pub coordinate: Coordinate,
    pub created_at: DateTime<Utc>,
}

/// A downloaded image owned by exactly one pin.
#[derive(Clone, PartialEq)]
pub struct Photo {
    pub id: PhotoId,
    pub pin_id: PinId,
    pub image: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

// Image payloads can be hundreds of kilobytes; keep them out of log output.
impl fmt::Debug for Photo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Photo")
            .field("id", &self.id)
            .field("pin_id", &self.pin_id)
            .field("image_len", &self.image.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Totals reported by the `status` command.
#[derive(Debug, Clone, Default)]
pub struct StoreSummary {
    pub pins: u64,
    pub photos: u64,
    /// Sum of stored image payload sizes.
    pub image_bytes: u64,
    pub newest_pin: Option<DateTime<Utc>>,
}

/// Convert a stored millisecond timestamp back to UTC.
///
/// Out-of-range values clamp to the Unix epoch rather than failing the row.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}
