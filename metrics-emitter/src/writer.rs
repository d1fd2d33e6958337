use std::fmt;

use bytes::{BufMut as _, Bytes, BytesMut};

use crate::metric::{CanonicalRecord, MetricValue};

/// Wire protocol used to send records to the collector.
///
/// The protocol is chosen by the scheme of the URI the emitter is configured with, and is fixed for the lifetime of
/// the emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Newline-terminated JSON objects over a persistent TCP connection. (`tcp://`)
    StreamJson,

    /// One JSON object per UDP datagram. (`udp://`)
    DatagramJson,

    /// One statsd line per UDP datagram. (`statsd://`)
    Statsd,
}

impl Protocol {
    /// Returns the URI scheme that selects this protocol.
    pub const fn scheme(self) -> &'static str {
        match self {
            Protocol::StreamJson => "tcp",
            Protocol::DatagramJson => "udp",
            Protocol::Statsd => "statsd",
        }
    }

    /// Returns the protocol selected by the given URI scheme, if any.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(Protocol::StreamJson),
            "udp" => Some(Protocol::DatagramJson),
            "statsd" => Some(Protocol::Statsd),
            _ => None,
        }
    }

    /// Returns `true` if the protocol runs over a connectionless transport.
    ///
    /// Connectionless transports have no handshake to retry and no connection to lose, so payloads are sent on a
    /// best-effort basis.
    pub const fn is_connectionless(self) -> bool {
        match self {
            Protocol::StreamJson => false,
            Protocol::DatagramJson | Protocol::Statsd => true,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

#[derive(Clone, Copy)]
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MetricType::Counter => b"|c",
            MetricType::Gauge => b"|g",
        }
    }
}

struct MetricValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl MetricValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    fn format(&mut self, value: MetricValue) -> &str {
        match value {
            MetricValue::Integer(v) => self.int_writer.format(v),
            MetricValue::FloatingPoint(v) => self.float_writer.format(v),
        }
    }
}

/// Formats a record into a payload for the given protocol.
///
/// - stream JSON: `JSON(record)` followed by a newline, so the collector can split the byte stream back into records
/// - datagram JSON: `JSON(record)`, the datagram boundary delimits the record
/// - statsd: `<name>:<value>|<type>` without a trailing newline
///
/// For statsd, a record whose metric carried no explicit value is an increment, and is written as a counter with a
/// value of `1`. A record whose metric did carry a value is written as a gauge with that value. There is no way to
/// write a counter with an explicit value, or any other statsd type.
///
/// # Errors
///
/// If the record cannot be serialized as JSON, an error is returned.
pub fn format(record: &CanonicalRecord, protocol: Protocol) -> Result<Bytes, serde_json::Error> {
    match protocol {
        Protocol::StreamJson => {
            let mut buf = serde_json::to_vec(record)?;
            buf.push(b'\n');
            Ok(Bytes::from(buf))
        }
        Protocol::DatagramJson => serde_json::to_vec(record).map(Bytes::from),
        Protocol::Statsd => Ok(format_statsd(record)),
    }
}

fn format_statsd(record: &CanonicalRecord) -> Bytes {
    let (metric_type, value) = if record.has_explicit_value() {
        (MetricType::Gauge, record.value())
    } else {
        (MetricType::Counter, MetricValue::Integer(1))
    };

    let mut formatter = MetricValueFormatter::new();
    let value = formatter.format(value);

    let name = record.name().as_bytes();
    let mut buf = BytesMut::with_capacity(name.len() + value.len() + 3);
    buf.put_slice(name);
    buf.put_u8(b':');
    buf.put_slice(value.as_bytes());
    buf.put_slice(metric_type.as_bytes());
    buf.freeze()
}
