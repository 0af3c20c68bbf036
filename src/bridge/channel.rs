//! Token channel
//!
//! A bounded, ordered queue from the background worker to a single delivery task. The
//! delivery task is the foreground context: it is the only place listeners are invoked.
//!
//! The [`ListenerRegistry`] is consulted twice. Items produced while nobody is listening
//! are dropped before they are queued, so a late listener never sees a backlog. Queued
//! items are handed to whichever listener is current when they are delivered.
//!
//! A full queue blocks the producer, which in turn blocks the engine's token callback.

use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::error::DeliveryError;
use crate::bridge::panic_message;
use crate::bridge::registry::ListenerRegistry;
use crate::types::event::BridgeEvent;
use crate::types::token::{RunId, StreamItem, TerminalSignal, Token};

/// Item queued for delivery
#[derive(Debug)]
enum Delivery {
    Stream { run_id: RunId, item: StreamItem },
    Notice(BridgeEvent),
}

impl Delivery {
    fn kind(&self) -> &'static str {
        match self {
            Delivery::Stream {
                item: StreamItem::Token(_),
                ..
            } => "token",
            Delivery::Stream {
                item: StreamItem::Terminal(_),
                ..
            } => "terminal",
            Delivery::Notice(event) => event.method_name(),
        }
    }

    fn into_event(self) -> BridgeEvent {
        match self {
            Delivery::Stream { run_id, item } => BridgeEvent::from_stream(run_id, item),
            Delivery::Notice(event) => event,
        }
    }
}

#[derive(Debug, Default)]
struct ChannelStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelStats {
    fn snapshot(&self) -> ChannelCounts {
        ChannelCounts {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of delivery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounts {
    /// Events handed to a listener
    pub delivered: u64,
    /// Events dropped because no listener was registered
    pub dropped: u64,
}

/// Outcome of offering an item to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enqueue {
    Queued,
    NoListener,
    Closed,
}

/// Queue handle shared by the channel and its producers
#[derive(Clone)]
struct Outbox {
    tx: mpsc::Sender<Delivery>,
    registry: ListenerRegistry,
    stats: Arc<ChannelStats>,
}

impl Outbox {
    /// Queues `delivery`, blocking while the channel is full
    fn send(&self, delivery: Delivery) -> Enqueue {
        if let Some(outcome) = self.drop_unheard(&delivery) {
            return outcome;
        }
        match self.tx.blocking_send(delivery) {
            Ok(()) => Enqueue::Queued,
            Err(_) => Enqueue::Closed,
        }
    }

    /// Queues `delivery` only if there is room right now
    fn try_send(&self, delivery: Delivery) -> Enqueue {
        if let Some(outcome) = self.drop_unheard(&delivery) {
            return outcome;
        }
        match self.tx.try_send(delivery) {
            Ok(()) => Enqueue::Queued,
            Err(_) => Enqueue::Closed,
        }
    }

    fn drop_unheard(&self, delivery: &Delivery) -> Option<Enqueue> {
        if self.registry.get().is_some() {
            return None;
        }
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("No listener, dropped {} before queueing", delivery.kind());
        Some(Enqueue::NoListener)
    }
}

/// Sending side of the token channel
#[derive(Clone)]
pub struct TokenChannel {
    outbox: Outbox,
    capacity: usize,
}

impl TokenChannel {
    /// Creates the channel and spawns its delivery task on `runtime`.
    ///
    /// The task runs until every sending handle (including producers) is dropped.
    pub fn spawn_on(
        runtime: &Handle,
        capacity: usize,
        registry: ListenerRegistry,
    ) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(ChannelStats::default());

        let task = runtime.spawn(run_delivery(rx, registry.clone(), stats.clone()));
        tracing::debug!("Token channel started (capacity {})", capacity);

        (
            Self {
                outbox: Outbox {
                    tx,
                    registry,
                    stats,
                },
                capacity,
            },
            task,
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn counts(&self) -> ChannelCounts {
        self.outbox.stats.snapshot()
    }

    /// Drops this handle and waits for the delivery task to drain.
    ///
    /// Other clones and live producers keep the task running, so drop those first.
    pub async fn close(self, task: JoinHandle<()>) -> ChannelCounts {
        let stats = self.outbox.stats.clone();
        drop(self);
        if let Err(e) = task.await {
            tracing::error!("Delivery task failed: {}", e);
        }
        stats.snapshot()
    }

    /// Creates the producer for one run
    pub fn producer(&self, run_id: RunId, cancel: CancellationToken) -> TokenProducer {
        TokenProducer {
            run_id,
            outbox: self.outbox.clone(),
            cancel,
            next_sequence: 0,
            finished: false,
        }
    }

    /// Queues a notification, blocking while the channel is full. Dropped if no listener
    /// is registered.
    ///
    /// Must be called from the background worker, never from async code.
    pub fn notify(&self, event: BridgeEvent) {
        if self.outbox.send(Delivery::Notice(event)) == Enqueue::Closed {
            tracing::warn!("Delivery task gone, notification dropped");
        }
    }
}

/// Producing side of a single run.
///
/// Assigns sequence numbers starting at 0 and emits exactly one terminal signal: either
/// through [`TokenProducer::finish`] or, if the producer is dropped unfinished, a
/// `Failed` signal. A token dropped for lack of a listener still uses up its sequence
/// number. Must be driven from the background worker or the engine thread it calls.
pub struct TokenProducer {
    run_id: RunId,
    outbox: Outbox,
    cancel: CancellationToken,
    next_sequence: u64,
    finished: bool,
}

impl TokenProducer {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Tokens accepted so far, including those nobody was listening for
    pub fn produced(&self) -> u64 {
        self.next_sequence
    }

    /// Queues one token. Returns `Break` once the run is cancelled or the delivery task
    /// is gone; the token is not queued in that case.
    ///
    /// Sequencing happens here, on the calling thread, since `&mut self` already
    /// serializes the engine's callbacks for one run.
    pub fn push(&mut self, text: &str) -> ControlFlow<()> {
        if self.cancel.is_cancelled() {
            return ControlFlow::Break(());
        }

        let token = Token {
            text: text.to_string(),
            sequence: self.next_sequence,
        };
        tracing::trace!(run = %self.run_id, sequence = token.sequence, "token");

        let delivery = Delivery::Stream {
            run_id: self.run_id,
            item: StreamItem::Token(token),
        };
        if self.outbox.send(delivery) == Enqueue::Closed {
            tracing::warn!("Delivery task gone, stopping run {}", self.run_id);
            return ControlFlow::Break(());
        }

        self.next_sequence += 1;
        ControlFlow::Continue(())
    }

    /// Closes the run with `signal`
    pub fn finish(mut self, signal: TerminalSignal) {
        self.finished = true;
        let delivery = Delivery::Stream {
            run_id: self.run_id,
            item: StreamItem::Terminal(signal),
        };
        if self.outbox.send(delivery) == Enqueue::Closed {
            tracing::warn!("Delivery task gone, terminal signal for run {} dropped", self.run_id);
        }
    }

    /// Drops a producer whose run was never accepted, without emitting anything
    pub(crate) fn discard(mut self) {
        self.finished = true;
    }
}

impl Drop for TokenProducer {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // May run on an async thread, so never block here
        let delivery = Delivery::Stream {
            run_id: self.run_id,
            item: StreamItem::Terminal(TerminalSignal::Failed("generation aborted".to_string())),
        };
        if self.outbox.try_send(delivery) == Enqueue::Closed {
            tracing::warn!("Terminal signal for aborted run {} dropped", self.run_id);
        }
    }
}

async fn run_delivery(
    mut rx: mpsc::Receiver<Delivery>,
    registry: ListenerRegistry,
    stats: Arc<ChannelStats>,
) {
    while let Some(delivery) = rx.recv().await {
        let event = delivery.into_event();
        match deliver(&registry, &event) {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(DeliveryError::NoListener) => {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Listener gone, dropped {}", event.method_name());
            }
        }
    }
    tracing::debug!("Token channel closed, delivery task exiting");
}

/// Hands `event` to the current listener. A panicking listener is logged and survives.
fn deliver(registry: &ListenerRegistry, event: &BridgeEvent) -> Result<(), DeliveryError> {
    let listener = registry.get().ok_or(DeliveryError::NoListener)?;
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        tracing::error!(
            "Listener panicked handling {}: {}",
            event.method_name(),
            panic_message(payload.as_ref())
        );
    }
    Ok(())
}
