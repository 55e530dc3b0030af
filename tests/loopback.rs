use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tperf::client::{self, SessionHandle};
use tperf::report::{FinalReport, Outcome};
use tperf::server::{Server, ServerConfig};
use tperf::settings::{Amount, Direction, Limits, Protocol, Settings};
use tperf::{AbortReason, ConfigError, Error, SessionState};

struct TestServer {
    address: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<tperf::Result<()>>>,
}

impl TestServer {
    fn start(limits: Limits) -> TestServer {
        let config = ServerConfig {
            bind: "127.0.0.1".parse().unwrap(),
            port: 0,
            limits,
            ..ServerConfig::default()
        };
        let server = Server::bind(config).unwrap();
        let address = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());
        TestServer {
            address,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn wait_for_state(handle: &SessionHandle, wanted: &SessionState) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while &handle.state() != wanted {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<serde_json::Value> {
    let mut length = [0_u8; 2];
    stream.read_exact(&mut length)?;
    let mut payload = vec![0_u8; usize::from(u16::from_be_bytes(length))];
    stream.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}

fn write_frame(stream: &mut TcpStream, value: serde_json::Value) {
    let payload = serde_json::to_vec(&value).unwrap();
    stream.write_all(&(payload.len() as u16).to_be_bytes()).unwrap();
    stream.write_all(&payload).unwrap();
}

/// a server that takes the proposal, optionally offers `stream_ports`, and then never
/// answers again; returns the kinds of every message it was sent
fn silent_server(offer_ports: bool) -> (SocketAddr, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let data_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let (mut control, _) = listener.accept().unwrap();
        let mut kinds = Vec::new();
        while let Ok(message) = read_frame(&mut control) {
            let kind = message["kind"].as_str().unwrap_or_default().to_string();
            if kind == "settings" && offer_ports {
                let port = data_listener.local_addr().unwrap().port();
                write_frame(&mut control, serde_json::json!({"kind": "accept", "stream_ports": [port]}));
            }
            kinds.push(kind);
        }
        kinds
    });
    (address, handle)
}

fn assert_intervals_add_up(report: &FinalReport) {
    for stream in report.streams.iter() {
        let interval_bytes: u64 = stream.intervals.iter().map(|record| record.bytes).sum();
        assert_eq!(interval_bytes, stream.cumulative.bytes, "stream {}", stream.stream_idx);
        for pair in stream.intervals.windows(2) {
            assert!(pair[0].interval_end <= pair[1].interval_start + 1e-9);
        }
    }
    let total: u64 = report.streams.iter().map(|stream| stream.cumulative.bytes).sum();
    assert_eq!(total, report.sum.bytes);
}

#[test]
fn udp_two_streams_for_five_seconds() {
    let server = TestServer::start(Limits::default());
    let settings = Settings {
        protocol: Protocol::Udp,
        streams: 2,
        block_size: 1200,
        bandwidth: Some(1_000_000),
        amount: Amount::Duration(Duration::from_secs(5)),
        interval: Duration::from_millis(1000),
        ..Settings::default()
    };

    let mut handle = client::start(settings, server.address).unwrap();
    let intervals = handle.interval_reports().unwrap();
    let report = handle.wait().unwrap();
    let published = intervals.try_iter().count();

    assert_eq!(report.outcome, Outcome::Done);
    assert!((4..=6).contains(&published), "{} interval reports", published);
    assert_eq!(report.streams.len(), 2);
    assert_intervals_add_up(&report);
    for stream in report.streams.iter() {
        assert!(stream.sending);
        assert!((4..=6).contains(&stream.intervals.len()));
        assert!(stream.cumulative.bytes > 0);
        assert_eq!(stream.cumulative.bytes % 1200, 0);

        let received = stream.peer.as_ref().expect("receiver totals");
        assert_eq!(received.lost_packets, Some(0));
        assert!(received.jitter_ms.is_some());
        assert!(received.packets.unwrap_or(0) > 0);
    }
    assert!(report.sum_peer.is_some());
}

#[test]
fn tcp_short_run() {
    let server = TestServer::start(Limits::default());
    let settings = Settings {
        streams: 1,
        amount: Amount::Duration(Duration::from_secs(2)),
        interval: Duration::from_millis(500),
        ..Settings::default()
    };

    let handle = client::start(settings, server.address).unwrap();
    let report = handle.wait().unwrap();

    assert_eq!(report.outcome, Outcome::Done);
    assert_intervals_add_up(&report);
    let stream = report.stream(0).unwrap();
    assert!(stream.sending);
    assert!(stream.cumulative.bytes > 0);
    let received = stream.peer.as_ref().unwrap();
    assert!(received.bytes > 0);
    assert!(received.bytes <= stream.cumulative.bytes);
    assert_eq!(received.lost_packets, None);
}

#[test]
fn reverse_tcp_receives_locally() {
    let server = TestServer::start(Limits::default());
    let settings = Settings {
        direction: Direction::Reverse,
        streams: 2,
        amount: Amount::Duration(Duration::from_secs(2)),
        ..Settings::default()
    };

    let report = client::start(settings, server.address).unwrap().wait().unwrap();

    assert_eq!(report.outcome, Outcome::Done);
    assert_intervals_add_up(&report);
    for stream in report.streams.iter() {
        assert!(!stream.sending);
        assert!(stream.cumulative.bytes > 0);
        assert!(stream.peer.as_ref().unwrap().bytes >= stream.cumulative.bytes);
    }
}

#[test]
fn bidirectional_udp_uses_both_directions() {
    let server = TestServer::start(Limits::default());
    let settings = Settings {
        protocol: Protocol::Udp,
        direction: Direction::Bidirectional,
        streams: 1,
        block_size: 1000,
        bandwidth: Some(2_000_000),
        amount: Amount::Duration(Duration::from_secs(2)),
        ..Settings::default()
    };

    let report = client::start(settings, server.address).unwrap().wait().unwrap();

    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(report.streams.len(), 2);
    let upload = report.stream(0).unwrap();
    let download = report.stream(1).unwrap();
    assert!(upload.sending);
    assert!(!download.sending);
    assert!(upload.cumulative.bytes > 0);
    assert!(download.cumulative.bytes > 0);
    // loss is only known where datagrams arrive
    assert!(upload.cumulative.lost_packets.is_none());
    assert!(download.cumulative.lost_packets.is_some());
    assert!(upload.peer.as_ref().unwrap().lost_packets.is_some());
}

#[test]
fn byte_target_is_delivered_exactly() {
    let server = TestServer::start(Limits::default());
    let settings = Settings {
        streams: 2,
        amount: Amount::Bytes(1_000_001),
        ..Settings::default()
    };

    let started = Instant::now();
    let report = client::start(settings, server.address).unwrap().wait().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(report.stream(0).unwrap().cumulative.bytes, 500_001);
    assert_eq!(report.stream(1).unwrap().cumulative.bytes, 500_000);
    assert_eq!(report.sum.bytes, 1_000_001);
    assert_eq!(report.sum_peer.as_ref().unwrap().bytes, 1_000_001);
}

#[test]
fn packet_target_counts_datagrams() {
    let server = TestServer::start(Limits::default());
    let settings = Settings {
        protocol: Protocol::Udp,
        block_size: 500,
        bandwidth: Some(4_000_000),
        amount: Amount::Packets(200),
        ..Settings::default()
    };

    let report = client::start(settings, server.address).unwrap().wait().unwrap();

    let stream = report.stream(0).unwrap();
    assert_eq!(stream.cumulative.packets, Some(200));
    assert_eq!(stream.cumulative.bytes, 200 * 500);
    let received = stream.peer.as_ref().unwrap();
    assert_eq!(received.packets, Some(200));
    assert_eq!(received.lost_packets, Some(0));
}

#[test]
fn too_many_streams_never_leaves_the_host() {
    let settings = Settings {
        protocol: Protocol::Udp,
        streams: 64,
        block_size: 1200,
        ..Settings::default()
    };
    // no server is running; validation must fail first
    let address: SocketAddr = "127.0.0.1:9".parse().unwrap();
    match client::start(settings, address) {
        Err(Error::Config(ConfigError::TooManyStreams { requested, max })) => {
            assert_eq!(requested, 64);
            assert_eq!(max, 8);
        }
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("64 streams were accepted"),
    }
}

#[test]
fn server_rejects_more_streams_than_it_allows() {
    let server = TestServer::start(Limits {
        max_streams: 2,
        ..Limits::default()
    });
    let settings = Settings {
        streams: 4,
        amount: Amount::Duration(Duration::from_secs(1)),
        ..Settings::default()
    };

    let handle = client::start(settings, server.address).unwrap();
    match handle.wait() {
        Err(Error::Rejected(reason)) => assert!(reason.contains("4 streams"), "{}", reason),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(report) => panic!("test ran: {:?}", report.outcome),
    }
}

#[test]
fn abort_closes_everything_and_keeps_partial_results() {
    let server = TestServer::start(Limits::default());
    let settings = Settings {
        protocol: Protocol::Udp,
        streams: 2,
        block_size: 1200,
        bandwidth: Some(1_000_000),
        amount: Amount::Duration(Duration::from_secs(30)),
        ..Settings::default()
    };

    let handle = client::start(settings, server.address).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while handle.state() != SessionState::Running && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(handle.state(), SessionState::Running);
    thread::sleep(Duration::from_millis(1500));

    let aborted_at = Instant::now();
    assert!(handle.abort());
    assert!(aborted_at.elapsed() < Duration::from_secs(5));
    assert_eq!(handle.state(), SessionState::Aborted(AbortReason::Cancelled));
    assert_eq!(handle.open_sockets(), 0);

    let report = handle.wait().unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(report.sum.bytes > 0);
    assert!(report.sum.interval_end < 30.0);
    assert_intervals_add_up(&report);
}

#[test]
fn abort_straight_after_start_is_a_cancellation() {
    // the session may still be New or connecting when the abort lands
    let (address, _server) = silent_server(false);
    let handle = client::start(Settings::default(), address).unwrap();
    assert!(handle.abort());
    assert_eq!(handle.state(), SessionState::Aborted(AbortReason::Cancelled));
    assert_eq!(handle.open_sockets(), 0);
    let report = handle.wait().unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(report.streams.is_empty());
}

#[test]
fn abort_while_negotiating_is_a_cancellation() {
    let (address, server) = silent_server(false);
    let handle = client::start(Settings::default(), address).unwrap();
    assert!(wait_for_state(&handle, &SessionState::Negotiating));

    assert!(handle.abort());
    assert_eq!(handle.state(), SessionState::Aborted(AbortReason::Cancelled));
    assert_eq!(handle.open_sockets(), 0);
    let report = handle.wait().unwrap();
    assert_eq!(report.outcome, Outcome::Cancelled);
    assert!(report.streams.is_empty());

    // the peer hears about it
    let kinds = server.join().unwrap();
    assert_eq!(kinds.first().map(String::as_str), Some("cookie"));
    assert_eq!(kinds.last().map(String::as_str), Some("abort"));
}

#[test]
fn abort_while_ready_closes_connected_streams() {
    let (address, server) = silent_server(true);
    let handle = client::start(Settings::default(), address).unwrap();
    let ready = SessionState::Ready {
        local_connected: true,
        peer_connected: false,
    };
    assert!(wait_for_state(&handle, &ready));
    assert_eq!(handle.open_sockets(), 1);

    assert!(handle.abort());
    assert_eq!(handle.state(), SessionState::Aborted(AbortReason::Cancelled));
    assert_eq!(handle.open_sockets(), 0);
    assert_eq!(handle.wait().unwrap().outcome, Outcome::Cancelled);
    assert_eq!(server.join().unwrap().last().map(String::as_str), Some("abort"));
}

#[test]
fn unreachable_server_is_a_connect_error() {
    // bind and release a port so that nothing is listening on it
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let handle = client::start(Settings::default(), address).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(matches!(handle.state(), SessionState::Aborted(AbortReason::ConnectFailed(_))));
    assert!(matches!(handle.wait(), Err(Error::Connect(_))));
}
