use std::{fmt, time::Duration};

use backon::ExponentialBuilder;

use crate::writer::Protocol;

pub mod sync;

const DEFAULT_STATSD_PORT: u16 = 8125;

/// Address of the collector, as given by the emitter URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RemoteAddr {
    host: String,
    port: u16,
}

impl RemoteAddr {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parses an emitter URI into its protocol and remote address.
///
/// The URI takes the form `<scheme>://<host>:<port>`, where the scheme is one of `tcp`, `udp` or `statsd`. IPv6
/// hosts are written in brackets, e.g. `udp://[::1]:9000`. The port may be left out for `statsd`, in which case it
/// defaults to 8125. Anything after the port (a trailing slash or path) is ignored.
pub(crate) fn parse_uri(uri: &str) -> Result<(Protocol, RemoteAddr), String> {
    let (scheme, rest) =
        uri.split_once("://").ok_or_else(|| format!("missing scheme in '{}'", uri))?;
    let protocol = Protocol::from_scheme(scheme).ok_or_else(|| {
        format!("invalid scheme '{}' (expected 'tcp', 'udp' or 'statsd')", scheme)
    })?;

    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) =
            bracketed.split_once(']').ok_or_else(|| format!("unterminated IPv6 host in '{}'", uri))?;
        let port = match after {
            "" => None,
            _ => Some(
                after.strip_prefix(':').ok_or_else(|| format!("invalid port separator in '{}'", uri))?,
            ),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(format!("missing host in '{}'", uri));
    }

    let port = match (port, protocol) {
        (Some(port), _) => port.parse::<u16>().map_err(|e| format!("invalid port '{}': {}", port, e))?,
        (None, Protocol::Statsd) => DEFAULT_STATSD_PORT,
        (None, _) => return Err(format!("missing port in '{}'", uri)),
    };

    Ok((protocol, RemoteAddr { host: host.to_string(), port }))
}

/// Forwarder configuration.
#[derive(Clone)]
pub(crate) struct ForwarderConfiguration {
    pub protocol: Protocol,
    pub max_retries: Option<u32>,
    pub backoff: ExponentialBuilder,
}

impl ForwarderConfiguration {
    /// Returns `true` if `failures` consecutive failures exhaust the retry budget.
    pub fn retries_exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max_retries| failures > max_retries)
    }
}

/// Builds the reconnect backoff policy.
pub(crate) fn reconnect_backoff(min_delay: Duration, max_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .with_factor(2.0)
        .without_max_times()
}

#[cfg(test)]
mod tests {
    use super::{parse_uri, ForwarderConfiguration, RemoteAddr};
    use crate::writer::Protocol;

    fn addr(host: &str, port: u16) -> RemoteAddr {
        RemoteAddr { host: host.to_string(), port }
    }

    #[test]
    fn valid_uris() {
        // Cases are defined as: URI, expected protocol, expected remote address.
        let cases = [
            ("tcp://localhost:5000", Protocol::StreamJson, addr("localhost", 5000)),
            ("udp://10.0.0.1:9000", Protocol::DatagramJson, addr("10.0.0.1", 9000)),
            ("statsd://metrics.internal:8126", Protocol::Statsd, addr("metrics.internal", 8126)),
            ("statsd://metrics.internal", Protocol::Statsd, addr("metrics.internal", 8125)),
            ("tcp://collector:7000/", Protocol::StreamJson, addr("collector", 7000)),
            ("udp://[::1]:9000", Protocol::DatagramJson, addr("::1", 9000)),
            ("statsd://[fe80::1]", Protocol::Statsd, addr("fe80::1", 8125)),
        ];

        for (uri, protocol, remote_addr) in cases {
            assert_eq!(parse_uri(uri), Ok((protocol, remote_addr)), "uri: {}", uri);
        }
    }

    #[test]
    fn invalid_uris() {
        let cases = [
            "localhost:5000",
            "http://localhost:5000",
            "tcp://localhost",
            "udp://:9000",
            "tcp://localhost:notaport",
            "tcp://localhost:70000",
            "udp://[::1:9000",
            "udp://[::1]9000",
        ];

        for uri in cases {
            assert!(parse_uri(uri).is_err(), "uri: {}", uri);
        }
    }

    #[test]
    fn display_brackets_ipv6() {
        assert_eq!(addr("::1", 9000).to_string(), "[::1]:9000");
        assert_eq!(addr("localhost", 9000).to_string(), "localhost:9000");
    }

    #[test]
    fn retry_budget() {
        let bounded = ForwarderConfiguration {
            protocol: Protocol::StreamJson,
            max_retries: Some(2),
            backoff: super::reconnect_backoff(
                std::time::Duration::from_millis(1),
                std::time::Duration::from_millis(10),
            ),
        };
        assert!(!bounded.retries_exhausted(2));
        assert!(bounded.retries_exhausted(3));

        let unbounded = ForwarderConfiguration { max_retries: None, ..bounded };
        assert!(!unbounded.retries_exhausted(u32::MAX));
    }
}
