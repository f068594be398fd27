//! End-to-end tests over real TCP connections

use h2sched::config::{IoWorkerKind, SchedulerConfig, ServerConfig};
use h2sched::http::h2::codec::FrameCodec;
use h2sched::http::h2::frames::Frame;
use h2sched::http::h2::{
    ConnectionHandler, FrameFlags, FrameHeader, FrameType, H2Request, H2Response, H2Server,
    HeaderCodec, HpackCodec, SessionConfig, CONNECTION_PREFACE,
};
use h2sched::runtime::Scheduler;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start(io_worker: IoWorkerKind) -> (Scheduler, H2Server) {
    let scheduler = Scheduler::new(&SchedulerConfig {
        processors: Some(2),
        io_worker,
        drain_timeout_ms: 500,
        ..SchedulerConfig::default()
    })
    .unwrap();
    let handler = Arc::new(|request: H2Request| {
        let body = format!("{} {} {}", request.method(), request.path(), request.body().len());
        H2Response::ok(body).with_header("server", "h2sched")
    });
    let connections = ConnectionHandler::new(scheduler.handle(), SessionConfig::default(), handler);
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    };
    let mut server = H2Server::bind(&config, connections).unwrap();
    server.start().unwrap();
    (scheduler, server)
}

fn send(stream: &mut TcpStream, kind: FrameType, flags: u8, id: u32, payload: &[u8]) {
    let frame = FrameCodec::encode_raw(&FrameHeader::new(kind, flags, id, 0), payload);
    stream.write_all(&frame).unwrap();
}

fn connect(server: &H2Server) -> TcpStream {
    let mut stream = TcpStream::connect(server.local_addr()).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    stream.write_all(CONNECTION_PREFACE).unwrap();
    send(&mut stream, FrameType::Settings, 0, 0, &[]);
    stream
}

fn header_block(codec: &mut HpackCodec, fields: &[(&str, &str)]) -> Vec<u8> {
    let fields: Vec<(&[u8], &[u8])> = fields
        .iter()
        .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
        .collect();
    codec.encode(&fields).unwrap()
}

/// Read one response, returning its decoded headers and body
fn read_response(stream: &mut TcpStream, codec: &mut HpackCodec, id: u32) -> (Vec<(String, String)>, Vec<u8>) {
    let mut headers = Vec::new();
    let mut body = Vec::new();
    loop {
        let frame: Frame = FrameCodec::read_frame(stream).unwrap();
        if frame.header.stream_id != id {
            continue;
        }
        match frame.header.frame_type() {
            Some(FrameType::Headers) => {
                headers = codec
                    .decode(&frame.payload)
                    .unwrap()
                    .into_iter()
                    .map(|(n, v)| (String::from_utf8(n).unwrap(), String::from_utf8(v).unwrap()))
                    .collect();
            }
            Some(FrameType::Data) => body.extend_from_slice(&frame.payload),
            other => panic!("unexpected {:?} on stream {}", other, id),
        }
        if frame.header.flags.is_end_stream() {
            return (headers, body);
        }
    }
}

fn exchange(server: &H2Server) {
    let mut stream = connect(server);
    let mut codec = HpackCodec::default();

    for (id, method, body) in [(1u32, "GET", &b""[..]), (3, "POST", &b"payload"[..])] {
        let block = header_block(&mut codec, &[(":method", method), (":scheme", "http"), (":path", "/echo")]);
        let end_stream = if body.is_empty() { FrameFlags::END_STREAM } else { 0 };
        send(&mut stream, FrameType::Headers, FrameFlags::END_HEADERS | end_stream, id, &block);
        if !body.is_empty() {
            send(&mut stream, FrameType::Data, FrameFlags::END_STREAM, id, body);
        }

        let (headers, response) = read_response(&mut stream, &mut codec, id);
        assert!(headers.contains(&(":status".to_string(), "200".to_string())));
        assert!(headers.contains(&("server".to_string(), "h2sched".to_string())));
        assert_eq!(response, format!("{} /echo {}", method, body.len()).as_bytes());
    }
    stream.shutdown(Shutdown::Both).unwrap();
}

fn wait_sessions(server: &H2Server, count: usize) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while server.connections().sessions_count() != count {
        if Instant::now() > deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

#[test]
fn test_requests_over_tcp() {
    for kind in [IoWorkerKind::Event, IoWorkerKind::Naive] {
        let (scheduler, mut server) = start(kind);
        exchange(&server);
        assert!(wait_sessions(&server, 0), "{:?}: session outlived its connection", kind);
        server.stop();
        assert!(scheduler.wait_all_finished(TIMEOUT));
    }
}

#[test]
fn test_parallel_connections() {
    let (_scheduler, server) = start(IoWorkerKind::Event);
    let server = Arc::new(server);
    let clients: Vec<_> = (0..8)
        .map(|_| {
            let server = Arc::clone(&server);
            thread::spawn(move || exchange(&server))
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }
    assert!(wait_sessions(&server, 0));
}

#[test]
fn test_protocol_error_closes_connection() {
    let (_scheduler, server) = start(IoWorkerKind::Event);
    let mut stream = connect(&server);
    send(&mut stream, FrameType::Data, 0, 2, b"even");

    loop {
        let frame = FrameCodec::read_frame(&mut stream).unwrap();
        if frame.header.frame_type() == Some(FrameType::Goaway) {
            break;
        }
    }
    // The server closes after GOAWAY
    assert!(FrameCodec::read_frame(&mut stream).is_err());
    assert!(wait_sessions(&server, 0));
}

#[test]
fn test_stop_keeps_sessions() {
    let (scheduler, mut server) = start(IoWorkerKind::Event);
    let mut stream = connect(&server);
    assert!(wait_sessions(&server, 1));

    server.stop();
    assert!(TcpStream::connect(server.local_addr())
        .and_then(|mut late| {
            late.set_read_timeout(Some(Duration::from_millis(200)))?;
            late.write_all(CONNECTION_PREFACE)?;
            FrameCodec::read_frame(&mut late).map(|_| ())
        })
        .is_err());

    let mut codec = HpackCodec::default();
    let block = header_block(&mut codec, &[(":method", "GET"), (":path", "/still-here")]);
    send(&mut stream, FrameType::Headers, FrameFlags::END_HEADERS | FrameFlags::END_STREAM, 1, &block);
    let (_, body) = read_response(&mut stream, &mut codec, 1);
    assert_eq!(body, b"GET /still-here 0");

    drop(stream);
    assert!(wait_sessions(&server, 0));
    assert!(scheduler.wait_all_finished(TIMEOUT));
}
