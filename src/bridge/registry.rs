//! Listener registration
//!
//! [`ListenerRegistry`] holds the one listener currently interested in bridge events.
//! It keeps only a weak reference: the foreground owns its listener, and a listener that
//! has been dropped simply stops receiving events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;

use crate::types::event::BridgeEvent;

/// A sink for bridge events.
///
/// Listeners are always invoked from the bridge's single delivery task, one event at a
/// time, so an implementation never runs concurrently with itself. They must not block.
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &BridgeEvent);
}

impl<F> Listener for F
where
    F: Fn(&BridgeEvent) + Send + Sync,
{
    fn on_event(&self, event: &BridgeEvent) {
        self(event)
    }
}

/// Identifies one registration, for logging
pub type ListenerId = u64;

struct Slot {
    id: ListenerId,
    listener: Weak<dyn Listener>,
}

/// Atomically swappable reference to the current listener.
///
/// Cloning yields another handle to the same slot.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    current: Arc<ArcSwapOption<Slot>>,
    next_id: Arc<AtomicU64>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current listener. Registering the listener that is already current
    /// keeps its registration.
    pub fn set<L>(&self, listener: &Arc<L>) -> ListenerId
    where
        L: Listener + 'static,
    {
        let weak: Weak<L> = Arc::downgrade(listener);
        let weak: Weak<dyn Listener> = weak;

        if let Some(slot) = self.current.load_full() {
            if Weak::ptr_eq(&slot.listener, &weak) {
                return slot.id;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.current.store(Some(Arc::new(Slot { id, listener: weak })));
        tracing::debug!("Listener {} registered", id);
        id
    }

    /// Returns the current listener if one is registered and still alive
    pub fn get(&self) -> Option<Arc<dyn Listener>> {
        self.current
            .load_full()
            .and_then(|slot| slot.listener.upgrade())
    }

    /// Id of the current registration, if any
    pub fn current_id(&self) -> Option<ListenerId> {
        self.current.load_full().map(|slot| slot.id)
    }

    pub fn clear(&self) {
        if let Some(slot) = self.current.swap(None) {
            tracing::debug!("Listener {} cleared", slot.id);
        }
    }
}
