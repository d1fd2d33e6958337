use std::{
    fmt,
    sync::{Arc, Weak},
};

use crossbeam_channel::Receiver;
use tracing::{error, trace};

use crate::{
    metric::{self, CanonicalRecord, Metric, RecordContext},
    state::{ConnectionState, LifecycleEvent, Shared},
    writer::{self, Protocol},
};

pub(crate) struct Handle {
    shared: Arc<Shared>,
    context: RecordContext,
    protocol: Protocol,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

/// Sends metrics to a remote collector.
///
/// `Emitter` is a cheap handle: clones share the same queue and connection. Once every clone is dropped, the emitter
/// is destroyed.
///
/// Submitting a metric never blocks on the network. Metrics are queued, in order, and written to the collector by a
/// background thread whenever the transport is usable. If the connection is lost, queued metrics are kept and
/// delivered once the connection is re-established.
#[derive(Clone)]
pub struct Emitter {
    handle: Arc<Handle>,
}

impl Emitter {
    pub(crate) fn new(shared: Arc<Shared>, context: RecordContext, protocol: Protocol) -> Self {
        Emitter { handle: Arc::new(Handle { shared, context, protocol }) }
    }

    pub(crate) fn downgrade(&self) -> Weak<Handle> {
        Arc::downgrade(&self.handle)
    }

    pub(crate) fn from_handle(handle: Arc<Handle>) -> Self {
        Emitter { handle }
    }

    /// Submits a metric.
    ///
    /// The metric is normalized: its name is prefixed with the application name, a missing value or time is filled
    /// in, and the host and node are attached. It is then formatted for the configured protocol and queued for
    /// delivery.
    ///
    /// Returns the record that was queued, or `None` if the metric has no name, in which case nothing is sent.
    ///
    /// Metrics submitted after the emitter has been closed or destroyed are still queued, but will never be
    /// delivered.
    pub fn submit(&self, metric: Metric) -> Option<CanonicalRecord> {
        let Some(record) = metric::normalize(metric, &self.handle.context) else {
            trace!("Skipping metric without a name.");
            return None;
        };

        match writer::format(&record, self.handle.protocol) {
            Ok(payload) => self.handle.shared.enqueue(payload),
            Err(e) => error!(error = %e, metric_name = record.name(), "Failed to format metric."),
        }

        Some(record)
    }

    /// Destroys the emitter.
    ///
    /// The transport is closed, queued metrics are discarded, and no further connection attempts are made. Destroying
    /// an emitter is irreversible; calling this again has no effect.
    pub fn destroy(&self) {
        self.handle.shared.destroy();
    }

    /// Returns `true` if the emitter was destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self.state(), ConnectionState::Closing | ConnectionState::Destroyed)
    }

    /// Returns `true` if the emitter gave up reconnecting.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.handle.shared.state()
    }

    /// Returns the number of metrics waiting to be delivered.
    pub fn queued(&self) -> usize {
        self.handle.shared.queued()
    }

    /// Returns the protocol metrics are sent with.
    pub fn protocol(&self) -> Protocol {
        self.handle.protocol
    }

    /// Returns the context every metric is decorated with.
    pub fn context(&self) -> &RecordContext {
        &self.handle.context
    }

    /// Subscribes to lifecycle events.
    ///
    /// Only events occurring after the subscription are received.
    pub fn subscribe(&self) -> Receiver<LifecycleEvent> {
        self.handle.shared.subscribe()
    }

    /// Returns `true` if both handles refer to the same emitter.
    pub fn ptr_eq(&self, other: &Emitter) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("app", &self.handle.context.app())
            .field("protocol", &self.handle.protocol)
            .field("state", &self.state())
            .finish()
    }
}
