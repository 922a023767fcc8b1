//! Pin store trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tokio::sync::broadcast;

use super::error::StoreError;
use super::events::{ChangeEvent, PhotoSubscription, StoreEvent, EVENT_CAPACITY};
use super::schema;
use super::types::{from_millis, Coordinate, Photo, PhotoId, Pin, PinId, StoreSummary};

/// Persisted pins and their photos.
///
/// This trait is object-safe and is shared as `Arc<dyn PinStore>` between the
/// sync engine and presenters. Every write is durable when it returns and is
/// published to subscribers before the call completes.
#[async_trait]
pub trait PinStore: Send + Sync {
    /// Insert a pin at `coordinate`, stamped with the current time.
    async fn create_pin(&self, coordinate: Coordinate) -> Result<Pin, StoreError>;

    async fn get_pin(&self, pin_id: PinId) -> Result<Option<Pin>, StoreError>;

    /// All pins, newest first.
    async fn list_pins(&self) -> Result<Vec<Pin>, StoreError>;

    /// Remove a pin together with every photo it owns.
    ///
    /// Emits one `Deleted` per photo (highest index first) followed by the
    /// pin's own `Deleted`.
    async fn delete_pin(&self, pin_id: PinId) -> Result<(), StoreError>;

    /// The pin's album, newest first.
    async fn list_photos(&self, pin_id: PinId) -> Result<Vec<Photo>, StoreError>;

    /// Number of photos owned by a pin, without loading image data.
    async fn count_photos(&self, pin_id: PinId) -> Result<u64, StoreError>;

    /// Persist a downloaded image for `pin_id`.
    ///
    /// Fails with [`StoreError::PinNotFound`] if the pin was deleted while the
    /// image was downloading.
    async fn save_photo(&self, pin_id: PinId, image: Vec<u8>) -> Result<Photo, StoreError>;

    async fn delete_photo(&self, photo_id: PhotoId) -> Result<(), StoreError>;

    /// Remove every photo of a pin in one statement.
    ///
    /// Emits a single `BatchReset` for the album instead of one event per
    /// photo. Returns the number of photos removed.
    async fn delete_all_photos(&self, pin_id: PinId) -> Result<u64, StoreError>;

    async fn summary(&self) -> Result<StoreSummary, StoreError>;

    /// Subscribe to every change in the store.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;

    /// Subscribe to changes of one pin's album.
    fn subscribe_photos(&self, pin_id: PinId) -> PhotoSubscription {
        PhotoSubscription::new(pin_id, self.subscribe())
    }
}

/// SQLite implementation of the pin store.
pub struct SqlitePinStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    events: broadcast::Sender<StoreEvent>,
    /// Path to the database file (for error messages).
    path: PathBuf,
}

impl std::fmt::Debug for SqlitePinStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePinStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqlitePinStore {
    /// Open or create a database at the given path.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StoreError::Migration)?;
            conn.pragma_update(None, "foreign_keys", "ON")
                .map_err(StoreError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StoreError>(conn)
        })
        .await??;

        Ok(Self::from_connection(conn, path))
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::migrate(&conn)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:")))
    }

    fn from_connection(conn: Connection, path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            events,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    /// Publish a change. Having no subscribers is not an error.
    fn publish(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }
}

/// Run `f` inside a transaction, rolling back on error.
fn in_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    conn.execute("BEGIN IMMEDIATE", [])
        .map_err(StoreError::query)?;

    match f(conn) {
        Ok(value) => {
            conn.execute("COMMIT", []).map_err(StoreError::query)?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

/// Position of a pin in the newest-first ordering.
fn pin_index(conn: &Connection, created_at: i64, id: i64) -> Result<usize, StoreError> {
    let index: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM pins WHERE created_at > ?1 OR (created_at = ?1 AND id > ?2)",
            rusqlite::params![created_at, id],
            |row| row.get(0),
        )
        .map_err(StoreError::query)?;
    Ok(index as usize)
}

/// Position of a photo in its album's newest-first ordering.
fn photo_index(
    conn: &Connection,
    pin_id: i64,
    created_at: i64,
    id: i64,
) -> Result<usize, StoreError> {
    let index: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM photos WHERE pin_id = ?1 AND (created_at > ?2 OR (created_at = ?2 AND id > ?3))",
            rusqlite::params![pin_id, created_at, id],
            |row| row.get(0),
        )
        .map_err(StoreError::query)?;
    Ok(index as usize)
}

fn pin_exists(conn: &Connection, pin_id: PinId) -> Result<bool, StoreError> {
    conn.query_row("SELECT 1 FROM pins WHERE id = ?1", [pin_id.0], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(StoreError::query)
}

fn count_photos_for(conn: &Connection, pin_id: PinId) -> Result<u64, StoreError> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM photos WHERE pin_id = ?1",
            [pin_id.0],
            |row| row.get(0),
        )
        .map_err(StoreError::query)?;
    Ok(count as u64)
}

#[async_trait]
impl PinStore for SqlitePinStore {
    async fn create_pin(&self, coordinate: Coordinate) -> Result<Pin, StoreError> {
        let created_at = Utc::now().timestamp_millis();
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO pins (latitude, longitude, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![coordinate.latitude, coordinate.longitude, created_at],
        )
        .map_err(StoreError::query)?;
        let id = conn.last_insert_rowid();

        let pin = Pin {
            id: PinId(id),
            coordinate,
            created_at: from_millis(created_at),
        };
        let index = pin_index(&conn, created_at, id)?;
        tracing::debug!(pin_id = %pin.id, %coordinate, "Created pin");

        self.publish(StoreEvent::Pins(ChangeEvent::Inserted {
            index,
            entity: Arc::new(pin.clone()),
        }));
        Ok(pin)
    }

    async fn get_pin(&self, pin_id: PinId) -> Result<Option<Pin>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, latitude, longitude, created_at FROM pins WHERE id = ?1",
            [pin_id.0],
            row_to_pin,
        )
        .optional()
        .map_err(StoreError::query)
    }

    async fn list_pins(&self) -> Result<Vec<Pin>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, latitude, longitude, created_at FROM pins ORDER BY created_at DESC, id DESC",
            )
            .map_err(StoreError::query)?;

        let pins = stmt
            .query_map([], row_to_pin)
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;

        Ok(pins)
    }

    async fn delete_pin(&self, pin_id: PinId) -> Result<(), StoreError> {
        let conn = self.lock()?;

        let (pin_position, removed_photos) = in_transaction(&conn, |conn| {
            let created_at: i64 = conn
                .query_row(
                    "SELECT created_at FROM pins WHERE id = ?1",
                    [pin_id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StoreError::query)?
                .ok_or(StoreError::PinNotFound(pin_id))?;

            let position = pin_index(conn, created_at, pin_id.0)?;
            let photos = count_photos_for(conn, pin_id)?;

            // Photos first, then the pin.
            conn.execute("DELETE FROM photos WHERE pin_id = ?1", [pin_id.0])
                .map_err(StoreError::query)?;
            conn.execute("DELETE FROM pins WHERE id = ?1", [pin_id.0])
                .map_err(StoreError::query)?;

            Ok((position, photos))
        })?;

        tracing::debug!(pin_id = %pin_id, photos = removed_photos, "Deleted pin");

        for index in (0..removed_photos as usize).rev() {
            self.publish(StoreEvent::Photos {
                pin_id,
                change: ChangeEvent::Deleted { index },
            });
        }
        self.publish(StoreEvent::Pins(ChangeEvent::Deleted {
            index: pin_position,
        }));
        Ok(())
    }

    async fn list_photos(&self, pin_id: PinId) -> Result<Vec<Photo>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, pin_id, image, created_at FROM photos WHERE pin_id = ?1 ORDER BY created_at DESC, id DESC",
            )
            .map_err(StoreError::query)?;

        let photos = stmt
            .query_map([pin_id.0], row_to_photo)
            .map_err(StoreError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::query)?;

        Ok(photos)
    }

    async fn count_photos(&self, pin_id: PinId) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        count_photos_for(&conn, pin_id)
    }

    async fn save_photo(&self, pin_id: PinId, image: Vec<u8>) -> Result<Photo, StoreError> {
        let created_at = Utc::now().timestamp_millis();
        let conn = self.lock()?;

        if !pin_exists(&conn, pin_id)? {
            return Err(StoreError::PinNotFound(pin_id));
        }

        conn.execute(
            "INSERT INTO photos (pin_id, image, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![pin_id.0, &image, created_at],
        )
        .map_err(StoreError::query)?;
        let id = conn.last_insert_rowid();
        let index = photo_index(&conn, pin_id.0, created_at, id)?;

        let photo = Photo {
            id: PhotoId(id),
            pin_id,
            image,
            created_at: from_millis(created_at),
        };
        tracing::debug!(
            pin_id = %pin_id,
            photo_id = %photo.id,
            size_bytes = photo.image.len(),
            "Saved photo"
        );

        self.publish(StoreEvent::Photos {
            pin_id,
            change: ChangeEvent::Inserted {
                index,
                entity: Arc::new(photo.clone()),
            },
        });
        Ok(photo)
    }

    async fn delete_photo(&self, photo_id: PhotoId) -> Result<(), StoreError> {
        let conn = self.lock()?;

        let (pin_id, index) = in_transaction(&conn, |conn| {
            let (pin_id, created_at): (i64, i64) = conn
                .query_row(
                    "SELECT pin_id, created_at FROM photos WHERE id = ?1",
                    [photo_id.0],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(StoreError::query)?
                .ok_or(StoreError::PhotoNotFound(photo_id))?;

            let index = photo_index(conn, pin_id, created_at, photo_id.0)?;
            conn.execute("DELETE FROM photos WHERE id = ?1", [photo_id.0])
                .map_err(StoreError::query)?;
            Ok((PinId(pin_id), index))
        })?;

        tracing::debug!(pin_id = %pin_id, photo_id = %photo_id, "Deleted photo");
        self.publish(StoreEvent::Photos {
            pin_id,
            change: ChangeEvent::Deleted { index },
        });
        Ok(())
    }

    async fn delete_all_photos(&self, pin_id: PinId) -> Result<u64, StoreError> {
        let conn = self.lock()?;

        if !pin_exists(&conn, pin_id)? {
            return Err(StoreError::PinNotFound(pin_id));
        }

        let removed = conn
            .execute("DELETE FROM photos WHERE pin_id = ?1", [pin_id.0])
            .map_err(StoreError::query)? as u64;

        tracing::debug!(pin_id = %pin_id, removed, "Cleared album");
        self.publish(StoreEvent::Photos {
            pin_id,
            change: ChangeEvent::BatchReset,
        });
        Ok(removed)
    }

    async fn summary(&self) -> Result<StoreSummary, StoreError> {
        let conn = self.lock()?;

        let (pins, newest_pin): (i64, Option<i64>) = conn
            .query_row("SELECT COUNT(*), MAX(created_at) FROM pins", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .map_err(StoreError::query)?;

        let (photos, image_bytes): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(image)), 0) FROM photos",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(StoreError::query)?;

        Ok(StoreSummary {
            pins: pins as u64,
            photos: photos as u64,
            image_bytes: image_bytes as u64,
            newest_pin: newest_pin.map(from_millis),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

fn row_to_pin(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pin> {
    Ok(Pin {
        id: PinId(row.get(0)?),
        coordinate: Coordinate::new(row.get(1)?, row.get(2)?),
        created_at: from_millis(row.get(3)?),
    })
}

fn row_to_photo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: PhotoId(row.get(0)?),
        pin_id: PinId(row.get(1)?),
        image: row.get(2)?,
        created_at: from_millis(row.get(3)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("pin_album_tests").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn beijing() -> Coordinate {
        Coordinate::new(39.90, 116.40)
    }

    /// Drain every event currently buffered for a receiver.
    fn drain(rx: &mut broadcast::Receiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_open_creates_db() {
        let dir = test_dir("open_creates_db");
        let db_path = dir.join("album.db");
        let store = SqlitePinStore::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        assert_eq!(store.path(), db_path);
    }

    #[tokio::test]
    async fn test_reopen_keeps_pins() {
        let dir = test_dir("reopen_keeps_pins");
        let db_path = dir.join("album.db");
        {
            let store = SqlitePinStore::open(&db_path).await.unwrap();
            let pin = store.create_pin(beijing()).await.unwrap();
            store.save_photo(pin.id, vec![1, 2, 3]).await.unwrap();
        }
        let store = SqlitePinStore::open(&db_path).await.unwrap();
        let pins = store.list_pins().await.unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].coordinate, beijing());
        assert_eq!(store.count_photos(pins[0].id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_pins_newest_first() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let first = store.create_pin(Coordinate::new(1.0, 1.0)).await.unwrap();
        let second = store.create_pin(Coordinate::new(2.0, 2.0)).await.unwrap();

        let pins = store.list_pins().await.unwrap();
        assert_eq!(
            pins.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );
    }

    #[tokio::test]
    async fn test_create_pin_emits_insert() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let mut rx = store.subscribe();
        let pin = store.create_pin(beijing()).await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            StoreEvent::Pins(ChangeEvent::Inserted { index, entity }) => {
                assert_eq!(*index, 0);
                assert_eq!(entity.id, pin.id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_save_photo_for_missing_pin() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let result = store.save_photo(PinId(99), vec![0]).await;
        assert!(matches!(result, Err(StoreError::PinNotFound(PinId(99)))));
    }

    #[tokio::test]
    async fn test_list_photos_scoped_and_newest_first() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let a = store.create_pin(beijing()).await.unwrap();
        let b = store.create_pin(Coordinate::new(48.85, 2.35)).await.unwrap();

        let p1 = store.save_photo(a.id, vec![1]).await.unwrap();
        let p2 = store.save_photo(a.id, vec![2]).await.unwrap();
        store.save_photo(b.id, vec![3]).await.unwrap();

        let photos = store.list_photos(a.id).await.unwrap();
        assert_eq!(
            photos.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![p2.id, p1.id]
        );
        assert_eq!(photos[0].image, vec![2]);
        assert_eq!(store.count_photos(b.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_pin_cascades_photos() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let pin = store.create_pin(beijing()).await.unwrap();
        let other = store.create_pin(Coordinate::new(0.0, 0.0)).await.unwrap();
        for i in 0..3 {
            store.save_photo(pin.id, vec![i]).await.unwrap();
        }
        store.save_photo(other.id, vec![9]).await.unwrap();

        let mut rx = store.subscribe();
        store.delete_pin(pin.id).await.unwrap();

        assert!(store.get_pin(pin.id).await.unwrap().is_none());
        assert_eq!(store.count_photos(pin.id).await.unwrap(), 0);
        let summary = store.summary().await.unwrap();
        assert_eq!(summary.pins, 1);
        assert_eq!(summary.photos, 1);

        let events = drain(&mut rx);
        let photo_deletes: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Photos {
                    pin_id,
                    change: ChangeEvent::Deleted { index },
                } if *pin_id == pin.id => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(photo_deletes, vec![2, 1, 0]);
        // pin was created first, so it sits below `other`
        assert!(matches!(
            events.last(),
            Some(StoreEvent::Pins(ChangeEvent::Deleted { index: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_pin() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let result = store.delete_pin(PinId(5)).await;
        assert!(matches!(result, Err(StoreError::PinNotFound(PinId(5)))));
    }

    #[tokio::test]
    async fn test_delete_photo_reports_index() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let pin = store.create_pin(beijing()).await.unwrap();
        let oldest = store.save_photo(pin.id, vec![1]).await.unwrap();
        store.save_photo(pin.id, vec![2]).await.unwrap();
        store.save_photo(pin.id, vec![3]).await.unwrap();

        let mut rx = store.subscribe();
        store.delete_photo(oldest.id).await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [StoreEvent::Photos {
                change: ChangeEvent::Deleted { index: 2 },
                ..
            }]
        ));
        assert_eq!(store.count_photos(pin.id).await.unwrap(), 2);

        let again = store.delete_photo(oldest.id).await;
        assert!(matches!(again, Err(StoreError::PhotoNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_all_photos_emits_single_reset() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let pin = store.create_pin(beijing()).await.unwrap();
        for i in 0..10 {
            store.save_photo(pin.id, vec![i]).await.unwrap();
        }

        let mut rx = store.subscribe();
        let removed = store.delete_all_photos(pin.id).await.unwrap();
        assert_eq!(removed, 10);
        assert_eq!(store.count_photos(pin.id).await.unwrap(), 0);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StoreEvent::Photos {
                change: ChangeEvent::BatchReset,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_events_replay_matches_listing() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let pin = store.create_pin(beijing()).await.unwrap();
        let mut sub = store.subscribe_photos(pin.id);

        let mut saved = Vec::new();
        for i in 0..5 {
            saved.push(store.save_photo(pin.id, vec![i]).await.unwrap());
        }
        store.delete_photo(saved[1].id).await.unwrap();
        store.delete_photo(saved[4].id).await.unwrap();
        store.save_photo(pin.id, vec![42]).await.unwrap();

        let mut local: Vec<Arc<Photo>> = Vec::new();
        for _ in 0..8 {
            let change = sub.recv().await.unwrap();
            assert!(change.apply_to(&mut local));
        }

        let listed = store.list_photos(pin.id).await.unwrap();
        assert_eq!(
            local.iter().map(|p| p.id).collect::<Vec<_>>(),
            listed.iter().map(|p| p.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_summary_counts_bytes() {
        let store = SqlitePinStore::open_in_memory().unwrap();
        let empty = store.summary().await.unwrap();
        assert_eq!(empty.pins, 0);
        assert!(empty.newest_pin.is_none());

        let pin = store.create_pin(beijing()).await.unwrap();
        store.save_photo(pin.id, vec![0; 100]).await.unwrap();
        store.save_photo(pin.id, vec![0; 50]).await.unwrap();

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.pins, 1);
        assert_eq!(summary.photos, 2);
        assert_eq!(summary.image_bytes, 150);
        assert!(summary.newest_pin.is_some());
    }
}
