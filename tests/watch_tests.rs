use std::sync::Arc;
use std::thread::sleep;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use lineio::{
    BinaryValue, Direction, Edge, Error, Line, LineConfig, MockGpioBackend, WatchCallback,
};

type EventLog = Arc<Mutex<Vec<Result<BinaryValue, Error>>>>;

fn collector() -> (WatchCallback, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let callback: WatchCallback = Arc::new(move |event| sink.lock().push(event));
    (callback, log)
}

fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn watcher_runs_only_while_registry_non_empty() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Rising);
    let mut line = Line::new(backend, 17, config).unwrap();
    assert!(!line.is_watching());

    let (first, _) = collector();
    let (second, _) = collector();

    line.watch(first.clone());
    assert!(line.is_watching());
    line.watch(second.clone());
    assert!(line.is_watching());

    line.unwatch(&first);
    assert!(line.is_watching());
    line.unwatch(&second);
    assert!(!line.is_watching());
}

#[test]
fn no_watcher_without_edge_or_input_direction() {
    let backend = Arc::new(MockGpioBackend::default());

    let mut no_edge = Line::new(backend.clone(), 2, LineConfig::input()).unwrap();
    let (callback, _) = collector();
    no_edge.watch(callback);
    assert!(!no_edge.is_watching());

    let mut output = Line::new(backend, 3, LineConfig::output()).unwrap();
    let (callback, _) = collector();
    output.watch(callback);
    assert!(!output.is_watching());
}

#[test]
fn enabling_edge_after_watch_starts_the_watcher() {
    let backend = Arc::new(MockGpioBackend::default());
    let mut line = Line::new(backend.clone(), 17, LineConfig::input()).unwrap();

    let (callback, log) = collector();
    line.watch(callback);
    assert!(!line.is_watching());

    line.set_edge(Edge::Rising).unwrap();
    assert!(line.is_watching());

    backend.drive(17, BinaryValue::High);
    assert!(wait_for(|| log.lock().len() == 1, Duration::from_millis(500)));
    assert!(matches!(log.lock()[0], Ok(BinaryValue::High)));
}

#[test]
fn reconfiguring_edge_stops_and_restarts_watcher() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Rising);
    let mut line = Line::new(backend, 17, config).unwrap();

    let (callback, _) = collector();
    line.watch(callback);
    assert!(line.is_watching());

    line.set_edge(Edge::None).unwrap();
    assert!(!line.is_watching());

    line.set_edge(Edge::Both).unwrap();
    assert!(line.is_watching());

    line.unwatch_all();
    assert!(!line.is_watching());
}

#[test]
fn disabling_edge_discards_buffered_events() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Both);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let slow: WatchCallback = {
        let sink = log.clone();
        Arc::new(move |event| {
            sink.lock().push(event);
            // hold the dispatch thread so further events stay buffered
            sleep(Duration::from_millis(200));
        })
    };
    line.watch(slow);

    backend.drive(17, BinaryValue::High);
    assert!(wait_for(|| log.lock().len() == 1, Duration::from_millis(500)));

    // these pile up behind the stalled dispatch thread
    for _ in 0..5 {
        backend.drive(17, BinaryValue::Low);
        backend.drive(17, BinaryValue::High);
    }
    line.set_edge(Edge::None).unwrap();
    assert!(!line.is_watching());

    // the registry kept its entry, yet nothing buffered leaks out
    sleep(Duration::from_millis(100));
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn events_fan_out_in_registration_order() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Rising);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for tag in ["a", "b", "c"] {
        let order = order.clone();
        line.watch(Arc::new(move |_event| order.lock().push(tag)));
    }

    backend.drive(17, BinaryValue::High);
    assert!(wait_for(|| order.lock().len() == 3, Duration::from_millis(500)));
    assert_eq!(*order.lock(), ["a", "b", "c"]);
}

#[test]
fn pass_through_delivers_every_event_in_order() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Both);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let (callback, log) = collector();
    line.watch(callback);

    let wave = [BinaryValue::High, BinaryValue::Low, BinaryValue::High];
    for (i, value) in wave.into_iter().enumerate() {
        backend.drive(17, value);
        // wait out each delivery so the sampled value is unambiguous
        assert!(wait_for(|| log.lock().len() == i + 1, Duration::from_millis(500)));
    }

    let seen: Vec<BinaryValue> = log.lock().iter().map(|e| e.clone().unwrap()).collect();
    assert_eq!(seen, wave);
}

#[test]
fn full_channel_applies_backpressure_without_losing_events() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Both);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let slow: WatchCallback = {
        let seen = seen.clone();
        Arc::new(move |_event| {
            // stall the dispatch thread so the wait thread runs well ahead
            // of it and fills the event channel
            sleep(Duration::from_millis(10));
            *seen.lock() += 1;
        })
    };
    line.watch(slow);

    // far more qualifying transitions than the channel buffers
    for _ in 0..40 {
        backend.drive(17, BinaryValue::High);
        backend.drive(17, BinaryValue::Low);
    }

    assert!(wait_for(|| *seen.lock() == 80, Duration::from_secs(5)));
    sleep(Duration::from_millis(50));
    assert_eq!(*seen.lock(), 80);
}

#[test]
fn debounce_collapses_bursts_to_trailing_event() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input()
        .with_edge(Edge::Rising)
        .with_debounce_ms(50);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let (callback, log) = collector();
    line.watch(callback);

    // three rising edges inside one quiet window
    let start = Instant::now();
    backend.drive(17, BinaryValue::High);
    sleep(Duration::from_millis(10));
    backend.drive(17, BinaryValue::Low);
    sleep(Duration::from_millis(10));
    backend.drive(17, BinaryValue::High);
    sleep(Duration::from_millis(15));
    backend.drive(17, BinaryValue::Low);
    sleep(Duration::from_millis(10));
    backend.drive(17, BinaryValue::High);
    let last_event_at = start.elapsed();

    // nothing may be delivered before the quiet window has elapsed
    sleep(Duration::from_millis(25));
    assert!(log.lock().is_empty());

    assert!(wait_for(|| !log.lock().is_empty(), Duration::from_millis(500)));
    let elapsed = start.elapsed();
    assert!(elapsed >= last_event_at + Duration::from_millis(50));
    assert!(elapsed >= Duration::from_millis(95));

    // the burst collapses to exactly one delivery of the final value
    sleep(Duration::from_millis(80));
    let events = log.lock();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], Ok(BinaryValue::High)));
}

#[test]
fn unwatch_removes_one_duplicate_registration() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Rising);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let (callback, log) = collector();
    line.watch(callback.clone());
    line.watch(callback.clone());

    backend.drive(17, BinaryValue::High);
    assert!(wait_for(|| log.lock().len() == 2, Duration::from_millis(500)));

    line.unwatch(&callback);
    assert!(line.is_watching());

    backend.drive(17, BinaryValue::Low);
    backend.drive(17, BinaryValue::High);
    assert!(wait_for(|| log.lock().len() == 3, Duration::from_millis(500)));

    sleep(Duration::from_millis(50));
    assert_eq!(log.lock().len(), 3);
}

#[test]
fn unwatch_all_leaves_direct_io_working() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Both);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let (callback, log) = collector();
    line.watch(callback);
    backend.drive(17, BinaryValue::High);
    assert!(wait_for(|| log.lock().len() == 1, Duration::from_millis(500)));

    line.unwatch_all();
    assert!(!line.is_watching());
    assert_eq!(line.read_value().unwrap(), BinaryValue::High);

    // no further deliveries after the stop
    backend.drive(17, BinaryValue::Low);
    sleep(Duration::from_millis(50));
    assert_eq!(log.lock().len(), 1);

    line.set_edge(Edge::None).unwrap();
    line.set_direction(Direction::Output).unwrap();
    line.write_value(BinaryValue::Low).unwrap();
    assert_eq!(line.read_value().unwrap(), BinaryValue::Low);
}

#[test]
fn failed_wait_reports_error_once_and_stops_worker() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Rising);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let (callback, log) = collector();
    line.watch(callback);
    assert!(wait_for(|| backend.wait_calls(17) > 0, Duration::from_millis(500)));

    backend.fail_next_wait(17, "interrupt watcher failed");
    assert!(wait_for(|| !log.lock().is_empty(), Duration::from_millis(500)));

    {
        let events = log.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(Error::Wait(17, _))));
    }

    // the wait loop does not keep polling after a fatal failure
    let calls_after_failure = backend.wait_calls(17);
    sleep(Duration::from_millis(60));
    assert_eq!(backend.wait_calls(17), calls_after_failure);

    // the failure does not tear down the watch handle by itself
    assert!(line.is_watching());
    line.unwatch_all();
    assert!(!line.is_watching());
}

#[test]
fn failure_during_debounce_window_flushes_pending_value() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input()
        .with_edge(Edge::Rising)
        .with_debounce_ms(100);
    let mut line = Line::new(backend.clone(), 17, config).unwrap();

    let (callback, log) = collector();
    line.watch(callback);

    backend.drive(17, BinaryValue::High);
    // let the edge reach the debounce stage, then fail well within the window
    sleep(Duration::from_millis(30));
    backend.fail_next_wait(17, "boom");

    assert!(wait_for(|| log.lock().len() == 2, Duration::from_millis(500)));
    let events = log.lock();
    assert!(matches!(events[0], Ok(BinaryValue::High)));
    assert!(matches!(events[1], Err(Error::Wait(17, _))));
}

#[test]
fn callback_may_stop_the_watch_without_deadlock() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Rising);
    let line = Arc::new(Mutex::new(
        Line::new(backend.clone(), 17, config).unwrap(),
    ));

    let self_stop: WatchCallback = {
        let line = line.clone();
        Arc::new(move |_event| line.lock().unwatch_all())
    };
    let (callback, log) = collector();

    line.lock().watch(self_stop);
    line.lock().watch(callback);

    backend.drive(17, BinaryValue::High);
    assert!(wait_for(|| log.lock().len() == 1, Duration::from_millis(500)));
    assert!(wait_for(
        || !line.lock().is_watching(),
        Duration::from_millis(500)
    ));

    // the in-progress fan-out pass still reached the second callback
    assert!(matches!(log.lock()[0], Ok(BinaryValue::High)));

    backend.drive(17, BinaryValue::Low);
    backend.drive(17, BinaryValue::High);
    sleep(Duration::from_millis(50));
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn callback_may_stop_the_watch_with_a_backlogged_channel() {
    let backend = Arc::new(MockGpioBackend::default());
    let config = LineConfig::input().with_edge(Edge::Both);
    let line = Arc::new(Mutex::new(
        Line::new(backend.clone(), 17, config).unwrap(),
    ));

    let deliveries: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let stop_after_stall: WatchCallback = {
        let line = line.clone();
        let deliveries = deliveries.clone();
        Arc::new(move |_event| {
            *deliveries.lock() += 1;
            // hold the dispatch thread until the wait thread has filled the
            // event channel behind it, then stop from inside the callback
            sleep(Duration::from_millis(300));
            line.lock().unwatch_all();
        })
    };
    line.lock().watch(stop_after_stall);

    // queue far more qualifying transitions than the channel buffers
    for _ in 0..100 {
        backend.drive(17, BinaryValue::High);
        backend.drive(17, BinaryValue::Low);
    }

    assert!(wait_for(
        || !line.lock().is_watching(),
        Duration::from_secs(2)
    ));

    // only the delivery that initiated the stop went out
    sleep(Duration::from_millis(100));
    assert_eq!(*deliveries.lock(), 1);
}

#[test]
fn dropping_line_stops_watcher_and_releases() {
    let backend = Arc::new(MockGpioBackend::default());
    {
        let config = LineConfig::input().with_edge(Edge::Rising);
        let mut line = Line::new(backend.clone(), 17, config).unwrap();
        let (callback, _) = collector();
        line.watch(callback);
        assert!(wait_for(|| backend.wait_calls(17) > 0, Duration::from_millis(500)));
    }
    assert!(!backend.is_requested(17));
    assert_eq!(backend.release_count(17), 1);

    // both watch threads are joined on drop, so polling stops with it
    let calls = backend.wait_calls(17);
    sleep(Duration::from_millis(50));
    assert_eq!(backend.wait_calls(17), calls);
}
