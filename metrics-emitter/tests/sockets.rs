use std::{
    io::{BufRead as _, BufReader},
    net::{TcpListener, TcpStream, UdpSocket},
    time::Duration,
};

use metrics_emitter::{Emitter, EmitterBuilder, LifecycleEvent, Metric, Protocol};
use serde_json::Value;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

fn emitter(uri: &str, app: &str) -> Emitter {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    EmitterBuilder::new()
        .with_uri(uri)
        .unwrap()
        .with_app(app)
        .with_host("box-01")
        .with_reconnect_delay(Duration::from_millis(5), Duration::from_millis(20))
        .build()
        .unwrap()
}

fn accept(listener: &TcpListener) -> BufReader<TcpStream> {
    let (stream, _) = listener.accept().unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    BufReader::new(stream)
}

fn read_record(reader: &mut BufReader<TcpStream>) -> Value {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    assert!(line.ends_with('\n'), "record not newline-terminated: {line:?}");
    serde_json::from_str(&line).unwrap()
}

fn udp_collector() -> (UdpSocket, u16) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    let port = socket.local_addr().unwrap().port();
    (socket, port)
}

fn recv_datagram(socket: &UdpSocket) -> String {
    let mut buf = [0u8; 2048];
    let len = socket.recv(&mut buf).unwrap();
    String::from_utf8(buf[..len].to_vec()).unwrap()
}

#[test]
fn tcp_writes_newline_delimited_json() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let emitter = emitter(&format!("tcp://127.0.0.1:{port}"), "testapp");
    assert_eq!(emitter.protocol(), Protocol::StreamJson);

    emitter.submit(Metric::new("test"));
    emitter.submit(Metric::new("latency").with_value(0.25).with_field("route", "/health"));

    let mut reader = accept(&listener);
    let record = read_record(&mut reader);
    assert_eq!(record["name"], "testapp.test");
    assert_eq!(record["value"], 1);
    assert_eq!(record["host"], "box-01");
    assert!(record.get("node").is_none());
    assert!(record["time"].as_str().unwrap().ends_with('Z'));

    let record = read_record(&mut reader);
    assert_eq!(record["name"], "testapp.latency");
    assert_eq!(record["value"], 0.25);
    assert_eq!(record["route"], "/health");
}

#[test]
fn tcp_reconnects_after_collector_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let emitter = emitter(&format!("tcp://127.0.0.1:{port}"), "testapp");
    let events = emitter.subscribe();

    emitter.submit(Metric::new("first"));
    let mut reader = accept(&listener);
    assert_eq!(read_record(&mut reader)["name"], "testapp.first");

    // The first `Ready` may have been emitted before we subscribed.
    drop(reader);
    let event = events.recv_timeout(IO_TIMEOUT).unwrap();
    let event = if event == LifecycleEvent::Ready { events.recv_timeout(IO_TIMEOUT).unwrap() } else { event };
    assert_eq!(event, LifecycleEvent::Close { will_retry: true });

    emitter.submit(Metric::new("second"));
    let mut reader = accept(&listener);
    assert_eq!(read_record(&mut reader)["name"], "testapp.second");
    assert_eq!(events.recv_timeout(IO_TIMEOUT).unwrap(), LifecycleEvent::Ready);
}

#[test]
fn statsd_sends_counters_and_gauges() {
    let (collector, port) = udp_collector();
    let emitter = emitter(&format!("statsd://127.0.0.1:{port}"), "statsdapp");
    assert_eq!(emitter.protocol(), Protocol::Statsd);

    emitter.submit(Metric::new("test"));
    emitter.submit(Metric::new("test-gauge").with_value(42));

    assert_eq!(recv_datagram(&collector), "statsdapp.test:1|c");
    assert_eq!(recv_datagram(&collector), "statsdapp.test-gauge:42|g");
}

#[test]
fn udp_sends_one_json_record_per_datagram() {
    let (collector, port) = udp_collector();
    let emitter = EmitterBuilder::new()
        .with_uri(format!("udp://127.0.0.1:{port}"))
        .unwrap()
        .with_app("udpapp")
        .with_host("box-01")
        .with_node("node-7")
        .build()
        .unwrap();
    assert_eq!(emitter.protocol(), Protocol::DatagramJson);

    emitter.submit(Metric::new("test").with_value(0).with_raw_time("2024-01-02T03:04:05.678Z"));

    let datagram = recv_datagram(&collector);
    assert!(!datagram.ends_with('\n'));

    let record: Value = serde_json::from_str(&datagram).unwrap();
    assert_eq!(record["name"], "udpapp.test");
    assert_eq!(record["value"], 0);
    assert_eq!(record["time"], "2024-01-02T03:04:05.678Z");
    assert_eq!(record["host"], "box-01");
    assert_eq!(record["node"], "node-7");
}
