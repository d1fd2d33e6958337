use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap as _, Serializer};
use serde_json::{Map, Value};
use tracing::trace;

// Largest magnitude at which every integer is exactly representable as an `f64`.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A numeric metric value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricValue {
    /// An integral value.
    Integer(i64),

    /// A floating-point value.
    FloatingPoint(f64),
}

impl MetricValue {
    /// Returns `true` if the value can be represented on the wire.
    ///
    /// `NaN` and infinities have no JSON representation, so they are treated as if no value was given at all.
    pub fn is_finite(&self) -> bool {
        match self {
            MetricValue::Integer(_) => true,
            MetricValue::FloatingPoint(v) => v.is_finite(),
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        let Value::Number(number) = value else {
            return None;
        };

        if let Some(v) = number.as_i64() {
            Some(MetricValue::Integer(v))
        } else {
            number.as_f64().map(MetricValue::from)
        }
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for MetricValue {
                fn from(value: $ty) -> Self {
                    MetricValue::Integer(i64::from(value))
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for MetricValue {
    fn from(value: u64) -> Self {
        i64::try_from(value)
            .map(MetricValue::Integer)
            .unwrap_or(MetricValue::FloatingPoint(value as f64))
    }
}

impl From<f32> for MetricValue {
    fn from(value: f32) -> Self {
        MetricValue::from(f64::from(value))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        // Integral floats are written the same way a JSON number would be, so `42.0` goes out as `42`.
        if value.is_finite() && value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
            MetricValue::Integer(value as i64)
        } else {
            MetricValue::FloatingPoint(value)
        }
    }
}

impl Serialize for MetricValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            MetricValue::Integer(v) => serializer.serialize_i64(*v),
            MetricValue::FloatingPoint(v) => serializer.serialize_f64(*v),
        }
    }
}

/// A raw measurement, as submitted by application code.
///
/// Only the name is required for a metric to be sent. Everything else is optional: the value defaults to `1`, the
/// time defaults to the moment the metric is submitted, and any extra fields are passed through to the collector
/// untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metric {
    name: Option<String>,
    value: Option<MetricValue>,
    time: Option<Value>,
    fields: Map<String, Value>,
}

impl Metric {
    /// Creates a new `Metric` with the given name.
    pub fn new<N>(name: N) -> Self
    where
        N: Into<String>,
    {
        Metric { name: Some(name.into()), ..Default::default() }
    }

    /// Creates a `Metric` from an arbitrary JSON value.
    ///
    /// The `name`, `value` and `time` members of a JSON object are picked up as such, and every other member becomes
    /// an extra field. A `name` that is not a string and a `value` that is not a number are ignored. `host` and
    /// `node` are ignored as well, since both are always decided by the emitter.
    ///
    /// Anything other than a JSON object produces an empty metric, which is never sent.
    pub fn from_json(value: Value) -> Self {
        let mut metric = Metric::default();
        if let Value::Object(members) = value {
            for (key, value) in members {
                metric.insert(key, value);
            }
        }
        metric
    }

    /// Sets the value of the metric.
    #[must_use]
    pub fn with_value<V>(mut self, value: V) -> Self
    where
        V: Into<MetricValue>,
    {
        self.value = Some(value.into());
        self
    }

    /// Sets the time of the metric.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(Value::String(format_timestamp(time)));
        self
    }

    /// Sets the time of the metric to a preformatted value.
    ///
    /// The value is forwarded exactly as given.
    #[must_use]
    pub fn with_raw_time<T>(mut self, time: T) -> Self
    where
        T: Into<Value>,
    {
        self.time = Some(time.into());
        self
    }

    /// Adds an extra field to the metric.
    ///
    /// The reserved keys `name`, `value` and `time` update the corresponding part of the metric instead.
    #[must_use]
    pub fn with_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.insert(key.into(), value.into());
        self
    }

    /// Returns the name of the metric, if one was set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the value of the metric, if one was set.
    pub fn value(&self) -> Option<MetricValue> {
        self.value
    }

    /// Returns the time of the metric, if one was set.
    pub fn time(&self) -> Option<&Value> {
        self.time.as_ref()
    }

    /// Returns the extra fields of the metric.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn insert(&mut self, key: String, value: Value) {
        match key.as_str() {
            "name" => self.name = value.as_str().map(str::to_owned),
            "value" => self.value = MetricValue::from_json(&value),
            "time" => self.time = (!value.is_null()).then_some(value),
            "host" | "node" => trace!(field = key.as_str(), "Ignoring reserved metric field."),
            _ => {
                self.fields.insert(key, value);
            }
        }
    }
}

/// Decoration applied to every metric as it is normalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordContext {
    app: String,
    host: String,
    node: Option<String>,
}

impl RecordContext {
    /// Creates a new `RecordContext` for the given application and host.
    pub fn new<A, H>(app: A, host: H) -> Self
    where
        A: Into<String>,
        H: Into<String>,
    {
        RecordContext { app: app.into(), host: host.into(), node: None }
    }

    /// Sets the node identifier.
    #[must_use]
    pub fn with_node<N>(mut self, node: N) -> Self
    where
        N: Into<String>,
    {
        self.node = Some(node.into());
        self
    }

    /// Returns the application name used as the namespace prefix.
    pub fn app(&self) -> &str {
        &self.app
    }

    /// Returns the host identifier.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the node identifier, if one was configured.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }
}

/// A validated, decorated metric, ready to be formatted.
#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalRecord {
    name: String,
    value: MetricValue,
    time: Value,
    host: String,
    node: Option<String>,
    fields: Map<String, Value>,
    explicit_value: bool,
}

impl CanonicalRecord {
    /// Returns the namespaced name, in the form `<app>.<name>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the value.
    pub fn value(&self) -> MetricValue {
        self.value
    }

    /// Returns the time.
    pub fn time(&self) -> &Value {
        &self.time
    }

    /// Returns the host identifier.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the node identifier, if the emitter has one.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Returns the extra fields carried over from the submitted metric.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns `true` if the submitted metric carried its own value.
    ///
    /// Records without an explicit value are increments; this drives the type chosen for the statsd protocol.
    pub fn has_explicit_value(&self) -> bool {
        self.explicit_value
    }
}

impl Serialize for CanonicalRecord {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let len = 4 + usize::from(self.node.is_some()) + self.fields.len();
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("value", &self.value)?;
        map.serialize_entry("time", &self.time)?;
        map.serialize_entry("host", &self.host)?;
        if let Some(node) = &self.node {
            map.serialize_entry("node", node)?;
        }
        for (key, value) in &self.fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Normalizes a metric into a canonical record, using the current time for metrics without one.
///
/// Returns `None` if the metric has no name, or an empty one.
pub fn normalize(metric: Metric, context: &RecordContext) -> Option<CanonicalRecord> {
    normalize_at(metric, context, Utc::now())
}

/// Normalizes a metric into a canonical record, using `now` for metrics without a time.
///
/// Returns `None` if the metric has no name, or an empty one.
pub fn normalize_at(
    metric: Metric,
    context: &RecordContext,
    now: DateTime<Utc>,
) -> Option<CanonicalRecord> {
    let Metric { name, value, time, fields } = metric;

    let name = match name {
        Some(name) if !name.is_empty() => name,
        _ => return None,
    };

    let value = value.filter(MetricValue::is_finite);
    let explicit_value = value.is_some();

    Some(CanonicalRecord {
        name: format!("{}.{}", context.app, name),
        value: value.unwrap_or(MetricValue::Integer(1)),
        time: time.unwrap_or_else(|| Value::String(format_timestamp(now))),
        host: context.host.clone(),
        node: context.node.clone(),
        fields,
        explicit_value,
    })
}

fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone as _, Utc};
    use proptest::prelude::*;
    use serde_json::{json, Value};

    use super::{normalize, normalize_at, Metric, MetricValue, RecordContext};

    fn context() -> RecordContext {
        RecordContext::new("testapp", "box-01")
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 16, 20, 5).single().unwrap()
    }

    #[test]
    fn missing_or_empty_name_produces_no_record() {
        assert!(normalize(Metric::default(), &context()).is_none());
        assert!(normalize(Metric::new(""), &context()).is_none());
        assert!(normalize(Metric::default().with_value(42), &context()).is_none());
        assert!(normalize(Metric::from_json(json!({ "value": 3 })), &context()).is_none());
        assert!(normalize(Metric::from_json(json!({ "name": 7 })), &context()).is_none());
        assert!(normalize(Metric::from_json(json!("test")), &context()).is_none());
        assert!(normalize(Metric::from_json(Value::Null), &context()).is_none());
    }

    #[test]
    fn defaults_are_applied() {
        let record = normalize_at(Metric::new("test"), &context(), fixed_now()).unwrap();

        assert_eq!(record.name(), "testapp.test");
        assert_eq!(record.value(), MetricValue::Integer(1));
        assert!(!record.has_explicit_value());
        assert_eq!(record.time(), &json!("2024-03-09T16:20:05.000Z"));
        assert_eq!(record.host(), "box-01");
        assert_eq!(record.node(), None);
    }

    #[test]
    fn default_time_is_close_to_now() {
        let before = Utc::now();
        let record = normalize(Metric::new("test"), &context()).unwrap();
        let after = Utc::now();

        let time = record.time().as_str().unwrap();
        let time = DateTime::parse_from_rfc3339(time).unwrap().with_timezone(&Utc);

        // Millisecond precision on the wire, so allow for truncation.
        assert!(time >= before - chrono::Duration::milliseconds(1));
        assert!(time <= after);
    }

    #[test]
    fn supplied_time_is_never_overwritten() {
        let cases = [
            Metric::new("test").with_time(fixed_now()),
            Metric::new("test").with_raw_time("yesterday-ish"),
            Metric::new("test").with_raw_time(1_700_000_000_123_u64),
            Metric::from_json(json!({ "name": "test", "time": { "seconds": 5, "nanos": 1 } })),
        ];

        for metric in cases {
            let supplied = metric.time().cloned().unwrap();
            let record = normalize(metric, &context()).unwrap();
            assert_eq!(record.time(), &supplied);
        }
    }

    #[test]
    fn node_is_only_present_when_configured() {
        let record = normalize(Metric::new("test"), &context()).unwrap();
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("node").is_none());

        let record = normalize(Metric::new("test"), &context().with_node("node-7")).unwrap();
        assert_eq!(record.node(), Some("node-7"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["node"], "node-7");
    }

    #[test]
    fn host_and_node_cannot_be_overridden() {
        let metric = Metric::from_json(json!({
            "name": "test",
            "host": "somewhere-else",
            "node": "rogue",
        }));
        let record = normalize(metric, &context()).unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["host"], "box-01");
        assert!(json.get("node").is_none());
    }

    #[test]
    fn extra_fields_pass_through() {
        let metric = Metric::new("requests")
            .with_field("route", "/health")
            .with_field("status", 200)
            .with_field("tags", json!(["a", "b"]));
        let record = normalize(metric, &context()).unwrap();
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["route"], "/health");
        assert_eq!(json["status"], 200);
        assert_eq!(json["tags"], json!(["a", "b"]));
    }

    #[test]
    fn reserved_fields_route_to_their_slots() {
        let metric = Metric::default().with_field("name", "latency").with_field("value", 12.5);
        assert_eq!(metric.name(), Some("latency"));
        assert_eq!(metric.value(), Some(MetricValue::FloatingPoint(12.5)));
        assert!(metric.fields().is_empty());
    }

    #[test]
    fn non_numeric_and_non_finite_values_count_as_absent() {
        let metric = Metric::from_json(json!({ "name": "test", "value": "42" }));
        let record = normalize(metric, &context()).unwrap();
        assert!(!record.has_explicit_value());
        assert_eq!(record.value(), MetricValue::Integer(1));

        let record = normalize(Metric::new("test").with_value(f64::NAN), &context()).unwrap();
        assert!(!record.has_explicit_value());
        assert_eq!(record.value(), MetricValue::Integer(1));
    }

    #[test]
    fn zero_is_an_explicit_value() {
        let record = normalize(Metric::new("test").with_value(0), &context()).unwrap();
        assert!(record.has_explicit_value());
        assert_eq!(record.value(), MetricValue::Integer(0));
    }

    #[test]
    fn integral_floats_become_integers() {
        assert_eq!(MetricValue::from(42.0), MetricValue::Integer(42));
        assert_eq!(MetricValue::from(-3.0_f32), MetricValue::Integer(-3));
        assert_eq!(MetricValue::from(0.25), MetricValue::FloatingPoint(0.25));
        assert_eq!(MetricValue::from(1e300), MetricValue::FloatingPoint(1e300));
        assert_eq!(MetricValue::from(u64::MAX), MetricValue::FloatingPoint(u64::MAX as f64));
    }

    #[test]
    fn serialized_field_order() {
        let record = normalize_at(Metric::new("test"), &context(), fixed_now()).unwrap();
        let encoded = serde_json::to_string(&record).unwrap();
        assert_eq!(
            encoded,
            r#"{"name":"testapp.test","value":1,"time":"2024-03-09T16:20:05.000Z","host":"box-01"}"#
        );
    }

    proptest! {
        #[test]
        fn explicit_values_are_preserved(name in "[a-z][a-z0-9_.-]{0,31}", value in any::<i64>()) {
            let record = normalize(Metric::new(name.clone()).with_value(value), &context()).unwrap();
            prop_assert_eq!(record.name(), format!("testapp.{}", name));
            prop_assert_eq!(record.value(), MetricValue::Integer(value));
            prop_assert!(record.has_explicit_value());
        }

        #[test]
        fn missing_values_default_to_one(name in "[a-zA-Z0-9_-]{1,32}") {
            let record = normalize(Metric::new(name), &context()).unwrap();
            prop_assert_eq!(record.value(), MetricValue::Integer(1));
            prop_assert!(!record.has_explicit_value());
            prop_assert_eq!(record.host(), "box-01");
        }
    }
}
