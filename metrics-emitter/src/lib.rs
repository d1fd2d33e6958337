//! A client for sending application metrics to a remote collector.
//!
//! Metrics are submitted through an [`Emitter`], which normalizes them, formats them for the configured protocol, and
//! queues them for delivery. A background thread owns the connection to the collector: it connects, drains the queue
//! in submission order, and reconnects with exponential backoff when the connection is lost.
//!
//! # Usage
//!
//! ```no_run
//! # use metrics_emitter::{EmitterBuilder, Metric};
//! let emitter = EmitterBuilder::default()
//!     .with_uri("tcp://127.0.0.1:8000")
//!     .expect("invalid URI")
//!     .with_app("checkout")
//!     .build()
//!     .expect("failed to build emitter");
//!
//! // Sent as `{"name":"checkout.orders","value":1,"time":"...","host":"..."}`.
//! emitter.submit(Metric::new("orders"));
//!
//! // Extra fields are carried alongside the standard ones.
//! emitter.submit(Metric::new("basket").with_value(3).with_field("region", "eu-west"));
//! ```
//!
//! # Protocols
//!
//! The scheme of the URI selects the protocol:
//!
//! - `tcp`: each metric is a JSON object followed by a newline, written to a persistent TCP connection
//! - `udp`: each metric is a JSON object sent as a single UDP datagram
//! - `statsd`: each metric is a statsd line sent as a single UDP datagram, either a counter (`name:1|c`) when the
//!   metric was submitted without a value, or a gauge (`name:value|g`) otherwise
//!
//! # Connection lifecycle
//!
//! Metrics submitted while disconnected are kept, and delivered in order once the connection is established. When
//! the connection cannot be established, or is lost, the emitter retries with exponential backoff, optionally giving
//! up after a configurable number of consecutive failures. Lifecycle changes can be observed through
//! [`Emitter::subscribe`].
//!
//! # Process-wide emitter
//!
//! An emitter can be registered as the process-wide emitter, through [`EmitterBuilder::install`] or
//! [`set_global_emitter`]. Metrics passed to [`broadcast`] are then forwarded to it, as long as it is active.
//!
//! [`EmitterRecorder`] bridges the [`metrics`] facade to the process-wide emitter, so that the `counter!`, `gauge!`
//! and `histogram!` macros can be used to submit metrics.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod builder;
pub use self::builder::{install_recorder, BuildError, EmitterBuilder};

mod emitter;
pub use self::emitter::Emitter;

mod forwarder;

mod metric;
pub use self::metric::{normalize, normalize_at, CanonicalRecord, Metric, MetricValue, RecordContext};

mod queue;
pub use self::queue::{DeliveryQueue, QueueEntry};

mod recorder;
pub use self::recorder::EmitterRecorder;

mod registry;
pub use self::registry::{
    broadcast, clear_global_emitter, global_emitter, global_registry, set_global_emitter, EmitterRegistry,
};

mod state;
pub use self::state::{CloseNotifier, ConnectionState, LifecycleEvent};

mod transport;
pub use self::transport::{Connector, SocketConnector, Transport};

mod writer;
pub use self::writer::{format, Protocol};
