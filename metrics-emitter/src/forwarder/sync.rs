use std::{
    io,
    sync::Arc,
    time::{Duration, Instant},
};

use backon::{BackoffBuilder as _, ExponentialBackoff};
use parking_lot::MutexGuard;
use tracing::{debug, error, trace, warn};

use crate::{
    queue::DeliveryQueue,
    state::{CloseNotifier, ConnectionState, Inner, LifecycleEvent, Shared},
    transport::Connector,
};

use super::ForwarderConfiguration;

// Used if the backoff policy ever runs dry, which an unbounded policy should not.
const FALLBACK_RECONNECT_DELAY: Duration = Duration::from_secs(1);

enum Step {
    Continue,
    Exit,
}

/// Drives the connection state machine and drains the delivery queue into the transport.
///
/// The forwarder runs on its own thread. Socket I/O happens without holding the state lock, so submitting a metric
/// never waits on the network.
pub struct Forwarder {
    config: ForwarderConfiguration,
    connector: Box<dyn Connector>,
    shared: Arc<Shared>,
    backoff: ExponentialBackoff,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Forwarder {
    /// Create a new synchronous `Forwarder`.
    pub(crate) fn new(
        config: ForwarderConfiguration,
        connector: Box<dyn Connector>,
        shared: Arc<Shared>,
    ) -> Self {
        let backoff = config.backoff.build();
        Forwarder { config, connector, shared, backoff, failures: 0, retry_at: None }
    }

    /// Run the forwarder until the emitter is closed or destroyed.
    pub fn run(mut self) {
        debug!(protocol = %self.config.protocol, "Forwarder started.");

        let shared = Arc::clone(&self.shared);
        loop {
            let mut inner = shared.inner().lock();
            let step = match inner.state {
                ConnectionState::Disconnected => self.disconnected(inner),
                ConnectionState::Ready => self.ready(inner),
                // Only the forwarder moves through `Connecting` and it never loops while there, so this is purely
                // for completeness.
                ConnectionState::Connecting => {
                    inner.state = ConnectionState::Disconnected;
                    Step::Continue
                }
                ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Destroyed => Step::Exit,
            };

            if let Step::Exit = step {
                break;
            }
        }

        debug!(protocol = %self.config.protocol, "Forwarder stopped.");
    }

    fn disconnected(&mut self, mut inner: MutexGuard<'_, Inner>) -> Step {
        if let Some(retry_at) = self.retry_at {
            if Instant::now() < retry_at {
                // Only destroy wakes this wait early; the loop checks the state again either way.
                let _ = self.shared.wake().wait_until(&mut inner, retry_at);
                return Step::Continue;
            }
        }

        inner.state = ConnectionState::Connecting;
        inner.generation += 1;
        inner.link_lost = false;
        let generation = inner.generation;
        drop(inner);

        trace!(generation, attempt = self.failures + 1, "Connecting.");
        let shared = Arc::clone(&self.shared);
        let result = self.connector.connect(CloseNotifier::new(&shared, generation));

        let mut inner = shared.inner().lock();
        if inner.state.is_terminal() {
            // Destroyed while connecting. Whatever we opened has to go, and there is nothing left to retry.
            drop(inner);
            if let Ok(mut transport) = result {
                debug!("Closing transport opened during destroy.");
                transport.close();
            }
            return Step::Exit;
        }

        match result {
            Ok(transport) => {
                *shared.transport().lock() = Some(transport);
                inner.state = ConnectionState::Ready;
                self.failures = 0;
                self.retry_at = None;
                self.backoff = self.config.backoff.build();

                debug!(generation, queued = inner.queue.len(), "Transport ready.");
                self.shared.emit(LifecycleEvent::Ready);
                Step::Continue
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to collector.");
                self.fail(inner)
            }
        }
    }

    fn ready(&mut self, mut inner: MutexGuard<'_, Inner>) -> Step {
        if inner.link_lost {
            self.abandon_transport(&mut inner);
            return self.fail(inner);
        }

        if inner.queue.is_empty() {
            self.shared.wake().wait(&mut inner);
            return Step::Continue;
        }

        let mut batch = inner.queue.take();
        inner.in_flight = batch.len();
        drop(inner);

        let (written, write_error) = self.write_batch(&mut batch);

        let shared = Arc::clone(&self.shared);
        let mut inner = shared.inner().lock();
        inner.in_flight = 0;
        if inner.state.is_terminal() {
            // Destroyed while writing: the batch goes down with the rest of the queue.
            return Step::Exit;
        }

        inner.queue.restore(batch);
        trace!(written, remaining = inner.queue.len(), "Drained delivery queue.");

        match write_error {
            None => Step::Continue,
            Some(e) => {
                warn!(error = %e, "Failed to write to collector, reconnecting.");
                self.abandon_transport(&mut inner);
                self.fail(inner)
            }
        }
    }

    /// Writes as much of the batch as the transport accepts.
    ///
    /// Stream transports stop at the first failed write, leaving the failed payload at the head of the batch. Payloads
    /// sent over connectionless transports are fire-and-forget: failures are logged and the payload is dropped.
    fn write_batch(&self, batch: &mut DeliveryQueue) -> (usize, Option<io::Error>) {
        let connectionless = self.config.protocol.is_connectionless();
        let mut write_error = None;
        let mut dropped = 0;

        let mut slot = self.shared.transport().lock();
        let Some(transport) = slot.as_mut() else {
            // Only destroy takes the transport away, and the caller checks for that once we return.
            return (0, None);
        };

        let written = batch.drain(|entry| {
            // Stop early if destroy is waiting on us to close the transport.
            if self.shared.state().is_terminal() {
                return false;
            }

            match transport.write(entry.payload()) {
                Ok(()) => true,
                Err(e) if connectionless => {
                    error!(error = %e, seq = entry.seq(), "Failed to send payload.");
                    dropped += 1;
                    true
                }
                Err(e) => {
                    write_error = Some(e);
                    false
                }
            }
        });

        if dropped > 0 {
            debug!(dropped, "Dropped payloads over connectionless transport.");
        }

        (written - dropped, write_error)
    }

    /// Closes the current transport, ignoring whatever it reports afterwards.
    fn abandon_transport(&self, inner: &mut Inner) {
        inner.generation += 1;
        inner.link_lost = false;
        inner.state = ConnectionState::Disconnected;
        if let Some(mut transport) = self.shared.transport().lock().take() {
            transport.close();
        }
    }

    /// Records a failed attempt or a lost connection, and schedules the next attempt if any remain.
    fn fail(&mut self, mut inner: MutexGuard<'_, Inner>) -> Step {
        self.failures = self.failures.saturating_add(1);

        // Events are emitted under the state lock so that none can follow a concurrent destroy's `Destroy`.
        if self.config.retries_exhausted(self.failures) {
            inner.state = ConnectionState::Closed;
            error!(
                failures = self.failures,
                undelivered = inner.queue.len(),
                "Reconnection attempts exhausted, emitter closed."
            );
            self.shared.emit(LifecycleEvent::Close { will_retry: false });
            drop(inner);
            return Step::Exit;
        }

        inner.state = ConnectionState::Disconnected;
        let delay = self.backoff.next().unwrap_or(FALLBACK_RECONNECT_DELAY);
        self.retry_at = Some(Instant::now() + delay);

        debug!(failures = self.failures, ?delay, "Scheduled reconnection attempt.");
        self.shared.emit(LifecycleEvent::Close { will_retry: true });
        drop(inner);
        Step::Continue
    }
}
