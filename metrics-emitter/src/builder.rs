use std::{fs, sync::Arc, time::Duration};

use thiserror::Error;
use tracing::debug;

use crate::{
    emitter::Emitter,
    forwarder::{self, sync::Forwarder, ForwarderConfiguration, RemoteAddr},
    metric::RecordContext,
    recorder::EmitterRecorder,
    registry,
    state::Shared,
    transport::{Connector, SocketConnector},
    writer::Protocol,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MIN_RECONNECT_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const FALLBACK_HOST: &str = "localhost";

/// Errors that could occur while building or installing an emitter.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the URI.
    #[error("invalid URI: {reason}")]
    InvalidUri {
        /// Details about the parsing failure.
        reason: String,
    },

    /// No URI was given.
    #[error("no URI configured")]
    MissingUri,

    /// No application name was given, or it was empty.
    #[error("no application name configured")]
    MissingApplication,

    /// The reconnect delay bounds are inverted.
    #[error("minimum reconnect delay ({min:?}) is greater than the maximum ({max:?})")]
    InvalidReconnectDelay {
        /// Minimum delay.
        min: Duration,
        /// Maximum delay.
        max: Duration,
    },

    /// Failed to spawn the background forwarder thread.
    #[error("failed to spawn background thread for emitter")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install emitter recorder as global recorder")]
    FailedToInstall,
}

/// Builder for an [`Emitter`].
pub struct EmitterBuilder {
    target: Option<(Protocol, RemoteAddr)>,
    app: Option<String>,
    node: Option<String>,
    host: Option<String>,
    max_retries: Option<u32>,
    min_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    connect_timeout: Duration,
    write_timeout: Duration,
    connector: Option<Box<dyn Connector>>,
}

impl EmitterBuilder {
    /// Creates a new `EmitterBuilder`.
    pub fn new() -> Self {
        EmitterBuilder {
            target: None,
            app: None,
            node: None,
            host: None,
            max_retries: None,
            min_reconnect_delay: DEFAULT_MIN_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            connector: None,
        }
    }

    /// Set the URI of the collector.
    ///
    /// The scheme selects the protocol:
    /// - `tcp://<host>:<port>`: newline-delimited JSON over a persistent TCP connection
    /// - `udp://<host>:<port>`: one JSON object per UDP datagram
    /// - `statsd://<host>[:<port>]`: one statsd line per UDP datagram, on port 8125 unless specified
    ///
    /// Required.
    ///
    /// # Errors
    ///
    /// If the URI is not able to be parsed, an error will be returned indicating the reason.
    pub fn with_uri<U>(mut self, uri: U) -> Result<Self, BuildError>
    where
        U: AsRef<str>,
    {
        let target =
            forwarder::parse_uri(uri.as_ref()).map_err(|reason| BuildError::InvalidUri { reason })?;
        self.target = Some(target);
        Ok(self)
    }

    /// Set the application name.
    ///
    /// Every metric name is prefixed with the application name, as `<app>.<name>`.
    ///
    /// Required.
    #[must_use]
    pub fn with_app<A>(mut self, app: A) -> Self
    where
        A: Into<String>,
    {
        self.app = Some(app.into());
        self
    }

    /// Set the node identifier.
    ///
    /// When set, every metric carries a `node` field with this value. When not set, the field is left out.
    #[must_use]
    pub fn with_node<N>(mut self, node: N) -> Self
    where
        N: Into<String>,
    {
        self.node = Some(node.into());
        self
    }

    /// Set the host identifier carried by every metric.
    ///
    /// Defaults to the hostname of the machine, as found in the `HOSTNAME` environment variable or `/etc/hostname`.
    #[must_use]
    pub fn with_host<H>(mut self, host: H) -> Self
    where
        H: Into<String>,
    {
        self.host = Some(host.into());
        self
    }

    /// Set the maximum number of consecutive reconnection attempts.
    ///
    /// Every failed connection attempt, and every lost connection, counts as a failure; the count is reset whenever a
    /// connection is established. Once the count exceeds `max_retries`, the emitter is closed: metrics can still be
    /// submitted, but nothing will be delivered anymore.
    ///
    /// Defaults to retrying forever.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the bounds of the delay between reconnection attempts.
    ///
    /// The delay starts at `min` and doubles after every failure, up to `max`.
    ///
    /// Defaults to 100 milliseconds and 30 seconds.
    #[must_use]
    pub fn with_reconnect_delay(mut self, min: Duration, max: Duration) -> Self {
        self.min_reconnect_delay = min;
        self.max_reconnect_delay = max;
        self
    }

    /// Set the connect timeout for TCP connections.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the write timeout for forwarding metrics.
    ///
    /// When the write timeout is reached on a TCP connection, the connection is considered lost and is reopened. Over
    /// UDP, the datagram being sent at the time is dropped.
    ///
    /// Defaults to 1 second.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Use a custom connector to open transports.
    ///
    /// The URI still selects the protocol, but the host and port are not used.
    #[must_use]
    pub fn with_connector<C>(mut self, connector: C) -> Self
    where
        C: Connector + 'static,
    {
        self.connector = Some(Box::new(connector));
        self
    }

    /// Builds the emitter.
    ///
    /// A background thread is spawned to connect to the collector and forward metrics to it.
    ///
    /// # Errors
    ///
    /// If the URI or application name is missing, if the reconnect delay bounds are inverted, or if the background
    /// thread cannot be spawned, an error will be returned.
    pub fn build(self) -> Result<Emitter, BuildError> {
        let (protocol, remote_addr) = self.target.ok_or(BuildError::MissingUri)?;
        let app = self.app.filter(|app| !app.is_empty()).ok_or(BuildError::MissingApplication)?;
        if self.min_reconnect_delay > self.max_reconnect_delay {
            return Err(BuildError::InvalidReconnectDelay {
                min: self.min_reconnect_delay,
                max: self.max_reconnect_delay,
            });
        }

        let host = self.host.unwrap_or_else(local_hostname);
        let mut context = RecordContext::new(app, host);
        if let Some(node) = self.node {
            context = context.with_node(node);
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => Box::new(SocketConnector::new(
                remote_addr.clone(),
                protocol,
                self.connect_timeout,
                self.write_timeout,
            )),
        };

        let forwarder_config = ForwarderConfiguration {
            protocol,
            max_retries: self.max_retries,
            backoff: forwarder::reconnect_backoff(self.min_reconnect_delay, self.max_reconnect_delay),
        };

        let shared = Arc::new(Shared::new());
        let forwarder = Forwarder::new(forwarder_config, connector, Arc::clone(&shared));

        std::thread::Builder::new()
            .name("metrics-emitter-forwarder".to_string())
            .spawn(move || forwarder.run())
            .map_err(|_| BuildError::Backend)?;

        debug!(app = context.app(), %protocol, %remote_addr, "Emitter built.");
        Ok(Emitter::new(shared, context, protocol))
    }

    /// Builds the emitter and sets it as the process-wide emitter.
    ///
    /// The emitter replaces any previously set process-wide emitter, and receives every metric passed to
    /// [`broadcast`][crate::broadcast].
    ///
    /// # Errors
    ///
    /// See [`build`][EmitterBuilder::build].
    pub fn install(self) -> Result<Emitter, BuildError> {
        let emitter = self.build()?;
        registry::set_global_emitter(&emitter);
        Ok(emitter)
    }
}

impl Default for EmitterBuilder {
    fn default() -> Self {
        EmitterBuilder::new()
    }
}

/// Installs [`EmitterRecorder`] as the global [`metrics`] recorder.
///
/// Values recorded through the `metrics` macros are then broadcast to the process-wide emitter.
///
/// # Errors
///
/// If a global recorder is already installed, an error will be returned.
pub fn install_recorder() -> Result<(), BuildError> {
    metrics::set_global_recorder(EmitterRecorder::new()).map_err(|_| BuildError::FailedToInstall)
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| FALLBACK_HOST.to_string())
}
