//! Change notifications emitted by the pin store.
//!
//! Every mutation is published on a broadcast channel while the connection
//! lock is held, so subscribers see events in commit order. Indices refer to
//! the newest-first ordering of the affected collection at the moment of the
//! change; applying events in order to a local copy keeps it in step with
//! `list_pins` / `list_photos`.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::types::{Photo, Pin, PinId};

/// Capacity of the store's event channel. Slow subscribers that fall further
/// behind than this receive a [`ChangeEvent::BatchReset`] and must re-query.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// A change to one ordered collection.
#[derive(Debug, Clone)]
pub enum ChangeEvent<T> {
    Inserted { index: usize, entity: Arc<T> },
    Deleted { index: usize },
    /// The collection changed wholesale; discard local state and reload.
    BatchReset,
}

/// A change tagged with the collection it applies to.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Pins(ChangeEvent<Pin>),
    Photos {
        pin_id: PinId,
        change: ChangeEvent<Photo>,
    },
}

impl<T> ChangeEvent<T> {
    /// Apply this change to a local newest-first list.
    ///
    /// Returns `false` when the list can no longer be patched incrementally
    /// (a batch reset, or an index outside the list) and must be reloaded.
    pub fn apply_to(&self, list: &mut Vec<Arc<T>>) -> bool {
        match self {
            ChangeEvent::Inserted { index, entity } if *index <= list.len() => {
                list.insert(*index, Arc::clone(entity));
                true
            }
            ChangeEvent::Deleted { index } if *index < list.len() => {
                list.remove(*index);
                true
            }
            _ => false,
        }
    }
}

/// Photo events for a single pin, filtered out of the store-wide channel.
///
/// Dropping the subscription is how a presenter stops observing an album;
/// it has no effect on in-flight downloads.
pub struct PhotoSubscription {
    pin_id: PinId,
    rx: broadcast::Receiver<StoreEvent>,
}

impl PhotoSubscription {
    pub(crate) fn new(pin_id: PinId, rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self { pin_id, rx }
    }

    pub fn pin_id(&self) -> PinId {
        self.pin_id
    }

    /// Wait for the next change to this pin's album.
    ///
    /// Returns `None` once the store has been dropped.
    pub async fn recv(&mut self) -> Option<ChangeEvent<Photo>> {
        loop {
            match self.rx.recv().await {
                Ok(StoreEvent::Photos { pin_id, change }) if pin_id == self.pin_id => {
                    return Some(change);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        pin_id = %self.pin_id,
                        skipped,
                        "Album subscriber lagged, requesting reload"
                    );
                    return Some(ChangeEvent::BatchReset);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
