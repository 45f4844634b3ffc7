use rpcio::{
    ErrorCode, MessageType, Packet, PayloadType, RpcMessage, Server, ServerHandle, ServerOptions,
    Service, HEADER_SIZE,
};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

struct EchoService;

impl Service for EchoService {
    fn name(&self) -> &str {
        "echo"
    }
    fn call(&self, method: &str, request: &[u8]) -> Result<Vec<u8>, ErrorCode> {
        match method {
            "say" => Ok(request.to_vec()),
            "rev" => Ok(request.iter().rev().copied().collect()),
            _ => Err(ErrorCode::NoMethod),
        }
    }
}

fn start_server(options: ServerOptions) -> (ServerHandle, SocketAddr, std::thread::JoinHandle<()>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut server = Server::new(options).unwrap();
    assert!(server.add_service(Box::new(EchoService)));
    let handle = server.handle();
    let jh = std::thread::spawn(move || server.start().unwrap());
    let deadline = Instant::now() + Duration::from_secs(5);
    let addr = loop {
        if let Some(addr) = handle.local_addr() {
            break addr;
        }
        assert!(Instant::now() < deadline, "timeout waiting for server start");
        std::thread::sleep(Duration::from_millis(1));
    };
    (handle, addr, jh)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let sock = TcpStream::connect(addr).unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    sock
}

fn send_request(sock: &mut TcpStream, payload: PayloadType, msg: &RpcMessage) {
    let body = msg.encode(payload).unwrap();
    sock.write_all(&Packet::encode(payload, &body)).unwrap();
}

fn read_response(sock: &mut TcpStream) -> (PayloadType, RpcMessage) {
    let mut header = [0u8; HEADER_SIZE];
    sock.read_exact(&mut header).unwrap();
    let payload = PayloadType::from_bits((header[0] >> 4) & 0x07).unwrap();
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut body = vec![0u8; len];
    sock.read_exact(&mut body).unwrap();
    (payload, RpcMessage::decode(payload, &body).unwrap())
}

#[test]
fn concurrent_clients_on_a_worker_pool() {
    let (handle, addr, jh) = start_server(ServerOptions {
        threads: 2,
        ..Default::default()
    });

    let clients: Vec<_> = (0..6u64)
        .map(|i| {
            std::thread::spawn(move || {
                let payload = if i % 2 == 0 {
                    PayloadType::Json
                } else {
                    PayloadType::Binary
                };
                let mut sock = connect(addr);
                for round in 0..20u64 {
                    let id = i * 1000 + round;
                    let text = format!("client-{}-round-{}", i, round);
                    send_request(
                        &mut sock,
                        payload,
                        &RpcMessage::request(id, "echo", "say", text.clone().into_bytes()),
                    );
                    let (resp_payload, resp) = read_response(&mut sock);
                    assert_eq!(resp_payload, payload); // reply reuses request encoding
                    assert_eq!(resp.kind, MessageType::Response);
                    assert_eq!(resp.id, id);
                    assert_eq!(resp.error, None);
                    assert_eq!(resp.response, text.as_bytes());
                }
            })
        })
        .collect();
    for c in clients {
        c.join().unwrap();
    }

    handle.stop();
    jh.join().unwrap();
}

#[test]
fn pipelined_requests_answered_in_order() {
    let (handle, addr, jh) = start_server(ServerOptions {
        threads: 1,
        ..Default::default()
    });
    let mut sock = connect(addr);

    // three frames in one write; one receive may deliver them all.
    let mut batch = Vec::new();
    for id in 1..=3u64 {
        let msg = RpcMessage::request(id, "echo", "rev", vec![b'a' + id as u8; 4]);
        let body = msg.encode(PayloadType::Json).unwrap();
        batch.extend_from_slice(&Packet::encode(PayloadType::Json, &body));
    }
    sock.write_all(&batch).unwrap();

    for id in 1..=3u64 {
        let (_payload, resp) = read_response(&mut sock);
        assert_eq!(resp.id, id);
        assert_eq!(resp.response, vec![b'a' + id as u8; 4]);
    }

    handle.stop();
    jh.join().unwrap();
}

#[test]
fn large_payload_round_trips_through_backpressure() {
    let (handle, addr, jh) = start_server(ServerOptions {
        threads: 1,
        ..Default::default()
    });
    let mut sock = connect(addr);

    let big: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    send_request(
        &mut sock,
        PayloadType::Binary,
        &RpcMessage::request(77, "echo", "say", big.clone()),
    );
    let (_payload, resp) = read_response(&mut sock);
    assert_eq!(resp.id, 77);
    assert_eq!(resp.response, big);

    handle.stop();
    jh.join().unwrap();
}

#[test]
fn idle_channels_are_reaped_while_active_ones_survive() {
    let (handle, addr, jh) = start_server(ServerOptions {
        threads: 1,
        idle_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    });

    let mut idle = connect(addr);
    let mut active = connect(addr);

    // keep one channel busy well past the idle timeout.
    for round in 0..6u64 {
        std::thread::sleep(Duration::from_millis(60));
        send_request(
            &mut active,
            PayloadType::Json,
            &RpcMessage::request(round, "echo", "say", b"tick".to_vec()),
        );
        let (_payload, resp) = read_response(&mut active);
        assert_eq!(resp.id, round);
    }

    // the silent channel was closed by the reaper.
    let mut buf = [0u8; 1];
    match idle.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {} bytes on idle channel", n),
        Err(e) if e.kind() == ErrorKind::ConnectionReset => {}
        Err(e) => panic!("unexpected idle read error: {}", e),
    }

    handle.stop();
    jh.join().unwrap();
}

#[test]
fn error_frames_keep_the_connection_usable() {
    let (handle, addr, jh) = start_server(ServerOptions {
        threads: 1,
        ..Default::default()
    });
    let mut sock = connect(addr);

    send_request(
        &mut sock,
        PayloadType::Json,
        &RpcMessage::request(10, "missing", "say", Vec::new()),
    );
    let (_payload, resp) = read_response(&mut sock);
    assert_eq!(resp.id, 10);
    assert_eq!(resp.error, Some(ErrorCode::NoService));

    // the same connection still serves valid requests afterwards.
    send_request(
        &mut sock,
        PayloadType::Json,
        &RpcMessage::request(11, "echo", "say", b"still here".to_vec()),
    );
    let (_payload, resp) = read_response(&mut sock);
    assert_eq!(resp.id, 11);
    assert_eq!(resp.error, None);
    assert_eq!(resp.response, b"still here");

    handle.stop();
    jh.join().unwrap();
}

#[test]
fn stopped_server_refuses_new_connections() {
    let (handle, addr, jh) = start_server(ServerOptions {
        threads: 1,
        ..Default::default()
    });
    drop(connect(addr));
    handle.stop();
    jh.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Err(_) => break,
            Ok(_) => {
                assert!(Instant::now() < deadline, "listener still accepting after stop");
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}
