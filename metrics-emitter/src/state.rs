use std::{
    fmt,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::{queue::DeliveryQueue, transport::Transport};

/// State of the connection to the collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport is open. A connection attempt is pending.
    Disconnected,

    /// A connection attempt is in progress.
    Connecting,

    /// The transport is open and queued payloads are being written to it.
    Ready,

    /// The emitter is being destroyed and the transport is being closed.
    Closing,

    /// Reconnection attempts were exhausted. Nothing will be delivered anymore.
    Closed,

    /// The emitter was destroyed. Nothing will be delivered anymore.
    Destroyed,
}

impl ConnectionState {
    /// Returns `true` if no further delivery can happen from this state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Destroyed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Lifecycle notifications emitted by an emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The transport is open and usable.
    Ready,

    /// The transport was lost, or could not be opened.
    ///
    /// `will_retry` is `false` once reconnection attempts are exhausted: the emitter is then closed for good.
    Close {
        /// Whether another connection attempt is scheduled.
        will_retry: bool,
    },

    /// The emitter was destroyed.
    Destroy,
}

pub(crate) struct Inner {
    pub state: ConnectionState,
    pub queue: DeliveryQueue,

    // Entries taken out of the queue by the forwarder and not yet written.
    pub in_flight: usize,

    // Bumped whenever a transport is opened or abandoned, so that close notifications from older transports can be
    // told apart from the current one.
    pub generation: u64,
    pub link_lost: bool,
}

/// State shared between an emitter and its forwarder.
pub(crate) struct Shared {
    inner: Mutex<Inner>,
    wake: Condvar,
    transport: Mutex<Option<Box<dyn Transport>>>,
    subscribers: Mutex<Vec<Sender<LifecycleEvent>>>,
}

impl Shared {
    pub fn new() -> Self {
        Shared {
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                queue: DeliveryQueue::new(),
                in_flight: 0,
                generation: 0,
                link_lost: false,
            }),
            wake: Condvar::new(),
            transport: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &Mutex<Inner> {
        &self.inner
    }

    pub fn wake(&self) -> &Condvar {
        &self.wake
    }

    pub fn transport(&self) -> &Mutex<Option<Box<dyn Transport>>> {
        &self.transport
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Returns the number of payloads that have not been delivered yet.
    pub fn queued(&self) -> usize {
        let inner = self.inner.lock();
        inner.queue.len() + inner.in_flight
    }

    /// Enqueues a formatted payload and wakes up the forwarder.
    pub fn enqueue(&self, payload: Bytes) {
        let mut inner = self.inner.lock();
        let seq = inner.queue.enqueue(payload);
        trace!(seq, state = %inner.state, "Enqueued payload.");
        if inner.state == ConnectionState::Ready {
            self.wake.notify_all();
        }
    }

    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Sends a lifecycle event to every live subscriber.
    pub fn emit(&self, event: LifecycleEvent) {
        trace!(?event, "Emitting lifecycle event.");
        self.subscribers.lock().retain(|tx| tx.send(event).is_ok());
    }

    /// Destroys the emitter: closes the transport, discards queued payloads and stops the forwarder.
    ///
    /// Returns `false` if the emitter was already destroyed, or is being destroyed.
    pub fn destroy(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ConnectionState::Closing | ConnectionState::Destroyed) {
                return false;
            }

            inner.state = ConnectionState::Closing;
            inner.generation += 1;
            let dropped = inner.queue.clear() + inner.in_flight;
            debug!(dropped, "Destroying emitter.");
        }
        self.wake.notify_all();

        // Waits for any write in progress to finish before closing.
        if let Some(mut transport) = self.transport.lock().take() {
            transport.close();
        }

        self.inner.lock().state = ConnectionState::Destroyed;
        self.emit(LifecycleEvent::Destroy);
        true
    }
}

/// Notifies the emitter that its transport was closed by the remote end.
///
/// A `CloseNotifier` is handed to [`Connector::connect`][crate::Connector::connect] for every connection attempt, and
/// is tied to the transport produced by that attempt: notifying after the emitter has moved on to another transport
/// has no effect.
#[derive(Clone)]
pub struct CloseNotifier {
    shared: Weak<Shared>,
    generation: u64,
}

impl CloseNotifier {
    pub(crate) fn new(shared: &Arc<Shared>, generation: u64) -> Self {
        CloseNotifier { shared: Arc::downgrade(shared), generation }
    }

    /// Reports that the transport was closed.
    pub fn notify(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        let mut inner = shared.inner.lock();
        let live = matches!(inner.state, ConnectionState::Connecting | ConnectionState::Ready);
        if inner.generation != self.generation || !live {
            trace!(generation = self.generation, "Ignoring stale close notification.");
            return;
        }

        debug!(generation = self.generation, "Transport closed by remote end.");
        inner.link_lost = true;
        shared.wake.notify_all();
    }
}

impl fmt::Debug for CloseNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseNotifier").field("generation", &self.generation).finish()
    }
}
