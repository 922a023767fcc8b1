//! Local cache of pins and their photo albums.
//!
//! SQLite-backed storage for the pins a user has dropped and the images
//! downloaded for each. Every mutation is broadcast as a [`events::StoreEvent`] so
//! presenters can patch their views incrementally instead of re-querying.

pub mod db;
pub mod error;
pub mod events;
pub mod schema;
pub mod types;

pub use db::{PinStore, SqlitePinStore};
pub use error::StoreError;
pub use events::ChangeEvent;
pub use types::{Coordinate, Photo, PhotoId, Pin, PinId};
