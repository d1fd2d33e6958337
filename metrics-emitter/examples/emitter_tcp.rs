use std::{thread, time::Duration};

use metrics::{counter, gauge, histogram};
use metrics_emitter::{broadcast, install_recorder, EmitterBuilder, LifecycleEvent, Metric};

fn main() {
    tracing_subscriber::fmt::init();

    let emitter = EmitterBuilder::default()
        .with_uri("tcp://localhost:8000")
        .expect("failed to parse URI")
        .with_app("demo")
        .with_node("worker-1")
        .with_reconnect_delay(Duration::from_millis(250), Duration::from_secs(5))
        .install()
        .expect("failed to install emitter");
    install_recorder().expect("failed to install recorder");

    let events = emitter.subscribe();
    thread::spawn(move || {
        for event in events {
            match event {
                LifecycleEvent::Ready => println!("connected"),
                LifecycleEvent::Close { will_retry } => println!("disconnected (will retry: {will_retry})"),
                LifecycleEvent::Destroy => println!("destroyed"),
            }
        }
    });

    emitter.submit(Metric::new("started"));

    let loops = counter!("loops", "system" => "demo");
    let delta = histogram!("loop_delta_secs", "system" => "demo");

    // Loop over and over, pretending to do some work.
    for i in 0u32.. {
        loops.increment(1);
        delta.record(f64::from(i % 10) / 10.0);
        gauge!("lucky_iterations").set(f64::from(i % 7));

        if i % 100 == 0 {
            broadcast(Metric::new("checkpoint").with_value(i).with_field("phase", "loop"));
            println!("{} metrics waiting for delivery", emitter.queued());
        }

        thread::sleep(Duration::from_millis(10));
    }
}
