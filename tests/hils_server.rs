// Integration tests: sync server over real TCP.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use gelsense::config::{Config, MAX_LINE_BYTES};
use gelsense::drivers::hils::HilsClient;
use gelsense::events::{ChannelPair, Point, Reading};
use gelsense::protocol::{Role, ServerMessage};
use gelsense::server::{HilsServer, ServerHandle};
use gelsense::simulation::MeasureMode;
use gelsense::Error;

const TIMEOUT: Duration = Duration::from_secs(5);

fn start(noise: bool) -> ServerHandle {
    let mut config = Config::default();
    config.server.port = 0;
    config.simulation.noise = noise;
    HilsServer::bind(&config).unwrap().spawn().unwrap()
}

fn client(server: &ServerHandle, role: Role) -> HilsClient {
    HilsClient::connect(&server.addr().to_string(), role, None, TIMEOUT).unwrap()
}

fn magnitude(reading: &Reading) -> f64 {
    match reading {
        Reading::Fixed { magnitude, .. } => *magnitude,
        Reading::Sweep(_) => panic!("expected fixed reading"),
    }
}

/// Raw line-level connection for malformed input.
struct Raw {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Raw {
    fn open(server: &ServerHandle) -> Self {
        let stream = TcpStream::connect(server.addr()).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        Self {
            writer: stream.try_clone().unwrap(),
            reader: BufReader::new(stream),
        }
    }

    fn send(&mut self, line: &str) {
        self.send_bytes(line.as_bytes());
    }

    fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).unwrap();
        self.writer.write_all(b"\n").unwrap();
    }

    fn connect(&mut self, role: &str) {
        self.send(&format!(r#"{{"type":"CONNECT","payload":{{"role":"{role}"}}}}"#));
        assert!(matches!(self.recv(), ServerMessage::Connected { .. }));
    }

    fn expect_error(&mut self, expected: &str) {
        match self.recv() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, expected),
            other => panic!("unexpected {other:?}"),
        }
    }

    fn expect_state(&mut self) -> (u64, usize) {
        self.send(r#"{"type":"GET_STATE"}"#);
        loop {
            if let ServerMessage::StateUpdate { state, client_count, requested: true } = self.recv() {
                return (state.version, client_count);
            }
        }
    }

    fn recv(&mut self) -> ServerMessage {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }
}

#[test]
fn set_then_measure_on_same_session_sees_the_write() {
    let server = start(false);
    let mut setter = client(&server, Role::Setter);
    let pairs = [ChannelPair::new(0, 1).unwrap()];

    let version = setter.set_touch(50.0, 3.0).unwrap();
    let (state, vector) = setter.measure_pairs(Some(&pairs), &MeasureMode::Fixed).unwrap();
    assert_eq!(state.version, version);
    assert_eq!(state.position, Some(Point::new(50.0, 3.0)));
    assert!((magnitude(&vector.readings()[0].reading) - 1030.0).abs() < 1e-9);

    for i in 0..20 {
        let x = 5.0 * i as f64;
        let v = setter.set_touch(x, 10.0).unwrap();
        let (state, _) = setter.measure_pairs(Some(&pairs), &MeasureMode::Fixed).unwrap();
        assert_eq!(state.version, v);
        assert_eq!(state.position, Some(Point::new(x, 10.0)));
    }
}

#[test]
fn consumers_receive_broadcasts_in_commit_order() {
    let server = start(false);
    let mut setter = client(&server, Role::Setter);
    let mut consumer = client(&server, Role::Consumer);

    for x in [10.0, 20.0, 30.0] {
        setter.set_touch(x, 0.0).unwrap();
    }
    setter.clear_touch().unwrap();

    let mut seen = Vec::new();
    while seen.len() < 4 {
        if let ServerMessage::StateUpdate { state, .. } = consumer.next_message().unwrap() {
            seen.push((state.version, state.position));
        }
    }
    assert_eq!(
        seen,
        vec![
            (1, Some(Point::new(10.0, 0.0))),
            (2, Some(Point::new(20.0, 0.0))),
            (3, Some(Point::new(30.0, 0.0))),
            (4, None),
        ]
    );
    assert_eq!(consumer.client_count(), 2);
}

#[test]
fn consumer_cannot_mutate() {
    let server = start(false);
    let mut consumer = client(&server, Role::Consumer);

    let err = consumer.set_touch(1.0, 1.0).unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
    let err = consumer.clear_touch().unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));

    let state = consumer.get_state().unwrap();
    assert_eq!(state.version, 0);
    assert_eq!(state.position, None);
}

#[test]
fn unrepresentable_coordinates_leave_state_alone() {
    let server = start(false);
    let mut raw = Raw::open(&server);
    raw.send(r#"{"type":"CONNECT","payload":{"role":"setter"}}"#);
    assert!(matches!(raw.recv(), ServerMessage::Connected { .. }));

    raw.send(r#"{"type":"SET_TOUCH","payload":{"x":1e999,"y":0}}"#);
    assert!(matches!(raw.recv(), ServerMessage::Error { .. }));

    raw.send(r#"{"type":"GET_STATE"}"#);
    match raw.recv() {
        ServerMessage::StateUpdate { state, requested, .. } => {
            assert!(requested);
            assert_eq!(state.version, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn malformed_lines_do_not_drop_the_connection() {
    let server = start(false);
    let mut raw = Raw::open(&server);

    raw.send(r#"{"type":"GET_STATE"}"#);
    match raw.recv() {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, "protocol"),
        other => panic!("unexpected {other:?}"),
    }

    raw.send(r#"{"type":"CONNECT","payload":{"role":"consumer","client_id":"raw"}}"#);
    assert!(matches!(raw.recv(), ServerMessage::Connected { role: Role::Consumer, .. }));

    for garbage in ["{not json", r#"{"type":"NOPE"}"#, r#"{"type":"MEASURE","payload":{"pairs":[[1,1]]}}"#] {
        raw.send(garbage);
        match raw.recv() {
            ServerMessage::Error { kind, .. } => assert_eq!(kind, "protocol", "{garbage}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    raw.send(r#"{"type":"MEASURE","payload":{"request_id":"m1","pairs":[[0,7]]}}"#);
    match raw.recv() {
        ServerMessage::Error { kind, request_id, .. } => {
            assert_eq!(kind, "validation");
            assert_eq!(request_id.as_deref(), Some("m1"));
        }
        other => panic!("unexpected {other:?}"),
    }

    raw.send(r#"{"type":"MEASURE","payload":{"request_id":"m2"}}"#);
    match raw.recv() {
        ServerMessage::Measurement { request_id, vector, .. } => {
            assert_eq!(request_id.as_deref(), Some("m2"));
            assert_eq!(vector.len(), 6);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn non_utf8_and_overlong_lines_are_rejected_in_place() {
    let server = start(false);
    let mut raw = Raw::open(&server);
    raw.connect("consumer");

    raw.send_bytes(b"\xff\xfe garbage");
    raw.expect_error("protocol");

    raw.send_bytes(&vec![b'x'; MAX_LINE_BYTES + 100]);
    raw.expect_error("protocol");

    assert_eq!(raw.expect_state(), (0, 1));
}

#[test]
fn oversized_sweep_is_a_validation_error_and_session_survives() {
    let server = start(false);
    {
        let mut raw = Raw::open(&server);
        raw.connect("consumer");
        for points in ["18446744073709551615", "1000000000"] {
            raw.send(&format!(
                r#"{{"type":"MEASURE","payload":{{"request_id":"big","pairs":[[0,1]],"mode":{{"kind":"sweep","min_hz":2000,"max_hz":20000,"points":{points}}}}}}}"#
            ));
            match raw.recv() {
                ServerMessage::Error { kind, request_id, .. } => {
                    assert_eq!(kind, "validation");
                    assert_eq!(request_id.as_deref(), Some("big"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(raw.expect_state(), (0, 1));
    }

    // The session above left the roster when it hung up.
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let mut fresh = client(&server, Role::Consumer);
        fresh.get_state().unwrap();
        if fresh.client_count() == 1 {
            break;
        }
        assert!(Instant::now() < deadline, "roster still holds the closed session");
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn touch_too_far_to_simulate_is_rejected_per_measurement() {
    let server = start(false);
    let mut setter = client(&server, Role::Setter);
    let mut consumer = client(&server, Role::Consumer);
    let pairs = [ChannelPair::new(0, 1).unwrap()];

    setter.set_touch(1e308, 0.0).unwrap();
    let err = consumer.measure_pairs(Some(&pairs), &MeasureMode::Fixed).unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "{err:?}");

    setter.clear_touch().unwrap();
    let (state, vector) = consumer.measure_pairs(Some(&pairs), &MeasureMode::Fixed).unwrap();
    assert_eq!(state.version, 2);
    assert!(magnitude(&vector.readings()[0].reading).is_finite());
}

#[test]
fn consumer_that_never_reads_does_not_stall_the_setter() {
    let server = start(false);
    let mut stalled = Raw::open(&server);
    stalled.send(r#"{"type":"CONNECT","payload":{"role":"consumer"}}"#);
    let mut setter = client(&server, Role::Setter);

    let started = Instant::now();
    for i in 1..=3_000u64 {
        let x = (i % 100) as f64;
        assert_eq!(setter.set_touch(x, 1.0).unwrap(), i);
    }
    assert!(started.elapsed() < Duration::from_secs(30));

    let mut observer = client(&server, Role::Consumer);
    assert_eq!(observer.get_state().unwrap().version, 3_000);
}

#[test]
fn disconnect_leaves_state_untouched() {
    let server = start(false);
    {
        let mut setter = client(&server, Role::Setter);
        setter.set_touch(42.0, 24.0).unwrap();
    }
    let mut consumer = client(&server, Role::Consumer);
    assert_eq!(consumer.latest_state().version, 1);
    let state = consumer.get_state().unwrap();
    assert_eq!(state.position, Some(Point::new(42.0, 24.0)));
}

#[test]
fn sweep_measurement_over_the_wire() {
    let server = start(true);
    let mut consumer = client(&server, Role::Consumer);
    let mode = MeasureMode::Sweep {
        min_hz: 2_000.0,
        max_hz: 20_000.0,
        points: 50,
    };
    let (_, vector) = consumer.measure_pairs(None, &mode).unwrap();
    assert_eq!(vector.len(), 6);
    for pr in vector.readings() {
        let Reading::Sweep(s) = &pr.reading else {
            panic!("expected sweep reading");
        };
        assert_eq!(s.frequencies.len(), 50);
        assert!(s.magnitude.iter().all(|m| *m >= 100.0));
    }
}
