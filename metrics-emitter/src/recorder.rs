use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use serde_json::{Map, Value};

use crate::{
    metric::{Metric, MetricValue},
    registry::{global_registry, EmitterRegistry},
};

/// A [`metrics`] recorder that broadcasts everything it records to the registered emitter.
///
/// Installing this recorder routes the `counter!`, `gauge!` and `histogram!` macros to whichever emitter is
/// registered at the time a value is recorded. Values recorded while no active emitter is registered are dropped.
///
/// Counters incremented by one are sent as plain increments, with no explicit value. Any other recorded value is sent
/// with an explicit value. Labels are sent as extra string fields.
pub struct EmitterRecorder {
    registry: &'static EmitterRegistry,
}

impl EmitterRecorder {
    /// Creates a recorder that broadcasts to the process-wide registry.
    pub fn new() -> Self {
        Self::with_registry(global_registry())
    }

    /// Creates a recorder that broadcasts to the given registry.
    pub fn with_registry(registry: &'static EmitterRegistry) -> Self {
        EmitterRecorder { registry }
    }

    fn source(&self, key: &Key) -> Arc<Source> {
        let labels = key
            .labels()
            .map(|label| (label.key().to_owned(), Value::String(label.value().to_owned())))
            .collect();
        Arc::new(Source { registry: self.registry, name: key.name().to_owned(), labels })
    }
}

impl Default for EmitterRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder for EmitterRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(CounterHandle(self.source(key))))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(GaugeHandle {
            source: self.source(key),
            level: AtomicU64::new(0f64.to_bits()),
        }))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(HistogramHandle(self.source(key))))
    }
}

struct Source {
    registry: &'static EmitterRegistry,
    name: String,
    labels: Map<String, Value>,
}

impl Source {
    fn emit(&self, value: Option<MetricValue>) {
        let mut metric = Metric::new(self.name.clone());
        if let Some(value) = value {
            metric = metric.with_value(value);
        }
        for (key, label) in &self.labels {
            metric = metric.with_field(key.clone(), label.clone());
        }

        self.registry.broadcast(metric);
    }
}

struct CounterHandle(Arc<Source>);

impl CounterFn for CounterHandle {
    fn increment(&self, value: u64) {
        if value == 1 {
            self.0.emit(None);
        } else {
            self.0.emit(Some(MetricValue::from(value)));
        }
    }

    fn absolute(&self, value: u64) {
        self.0.emit(Some(MetricValue::from(value)));
    }
}

struct GaugeHandle {
    source: Arc<Source>,
    level: AtomicU64,
}

impl GaugeHandle {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut current = self.level.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(current));
            match self.level.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.source.emit(Some(MetricValue::from(next)));
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl GaugeFn for GaugeHandle {
    fn increment(&self, value: f64) {
        self.update(|level| level + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|level| level - value);
    }

    fn set(&self, value: f64) {
        self.level.store(value.to_bits(), Ordering::Release);
        self.source.emit(Some(MetricValue::from(value)));
    }
}

struct HistogramHandle(Arc<Source>);

impl HistogramFn for HistogramHandle {
    fn record(&self, value: f64) {
        self.0.emit(Some(MetricValue::from(value)));
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use metrics::{counter, gauge, histogram, with_local_recorder};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::EmitterRecorder;
    use crate::{
        registry::EmitterRegistry, state::CloseNotifier, transport::Transport, Connector,
        EmitterBuilder, LifecycleEvent,
    };

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<Value>>>);

    impl Transport for Capture {
        fn write(&mut self, payload: &[u8]) -> io::Result<()> {
            let value = serde_json::from_slice(payload)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.0.lock().push(value);
            Ok(())
        }

        fn close(&mut self) {}
    }

    impl Connector for Capture {
        fn connect(&mut self, _: CloseNotifier) -> io::Result<Box<dyn Transport>> {
            Ok(Box::new(self.clone()))
        }
    }

    fn captured(capture: &Capture, count: usize) -> Vec<Value> {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            let values = capture.0.lock().clone();
            if values.len() >= count || std::time::Instant::now() > deadline {
                return values;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    #[test]
    fn macros_are_broadcast_to_registered_emitter() {
        let registry: &'static EmitterRegistry = Box::leak(Box::new(EmitterRegistry::new()));
        let capture = Capture::default();
        let emitter = EmitterBuilder::new()
            .with_uri("udp://127.0.0.1:9")
            .unwrap()
            .with_app("bridge")
            .with_host("box-01")
            .with_connector(capture.clone())
            .build()
            .unwrap();
        let events = emitter.subscribe();
        registry.set(&emitter);

        let recorder = EmitterRecorder::with_registry(registry);
        with_local_recorder(&recorder, || {
            counter!("requests", "route" => "/health").increment(1);
            counter!("bytes").increment(512);
            let depth = gauge!("depth");
            depth.set(4.0);
            depth.increment(2.0);
            depth.decrement(0.5);
            histogram!("latency").record(0.25);
        });

        let values = captured(&capture, 6);
        let summary = values
            .iter()
            .map(|value| (value["name"].clone(), value["value"].clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            summary,
            vec![
                (json!("bridge.requests"), json!(1)),
                (json!("bridge.bytes"), json!(512)),
                (json!("bridge.depth"), json!(4)),
                (json!("bridge.depth"), json!(6)),
                (json!("bridge.depth"), json!(5.5)),
                (json!("bridge.latency"), json!(0.25)),
            ]
        );
        assert_eq!(values[0]["route"], "/health");
        assert_eq!(values[0]["host"], "box-01");

        emitter.destroy();
        assert!(events.try_iter().any(|event| event == LifecycleEvent::Destroy));
    }

    #[test]
    fn nothing_registered_is_a_no_op() {
        let registry: &'static EmitterRegistry = Box::leak(Box::new(EmitterRegistry::new()));
        let recorder = EmitterRecorder::with_registry(registry);
        with_local_recorder(&recorder, || {
            counter!("requests").increment(1);
            gauge!("depth").set(1.0);
        });
    }
}
