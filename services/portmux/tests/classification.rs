//! Classification over real TCP connections.

mod harness;

use std::time::Duration;

use futures_util::future::BoxFuture;
use harness::{exchange, read_reply, recorder, MuxHandle, Seen};
use portmux::matcher::{self, Matcher};
use portmux::mux::NOT_FOUND_RESPONSE;
use portmux::{Conn, Listener, ServeMux};
use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;

const REQUEST: &[u8] = b"GET /healthz HTTP/1.1\r\nHost: localhost\r\n\r\n";

async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("handler did not run")
        .expect("channel closed")
}

#[tokio::test]
async fn http1_request_routes_before_catch_all() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mux = ServeMux::new();
    mux.handle(matcher::http1_fast(), recorder("http", tx.clone()));
    mux.handle(matcher::any(), recorder("other", tx));
    let handle = MuxHandle::spawn(mux).await.unwrap();

    let reply = exchange(handle.addr, REQUEST).await.unwrap();
    assert_eq!(reply, b"http");
    let (tag, seen) = next(&mut rx).await;
    assert_eq!(tag, "http");
    assert_eq!(seen, REQUEST, "handler must see the bytes the matcher peeked at");

    let reply = exchange(handle.addr, b"\x00\x01binary").await.unwrap();
    assert_eq!(reply, b"other");
    let (tag, seen) = next(&mut rx).await;
    assert_eq!(tag, "other");
    assert_eq!(seen, b"\x00\x01binary");
}

#[tokio::test]
async fn tls_record_routes_to_tls_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mux = ServeMux::new();
    mux.handle(matcher::tls(), recorder("tls", tx.clone()));
    mux.handle(matcher::any(), recorder("other", tx));
    let handle = MuxHandle::spawn(mux).await.unwrap();

    // Handshake record header (TLS 1.0 record version) and a stub body.
    let record = [0x16, 0x03, 0x01, 0x00, 0x02, 0x01, 0x00];
    let reply = exchange(handle.addr, &record).await.unwrap();
    assert_eq!(reply, b"tls");
    assert_eq!(next(&mut rx).await, ("tls", record.to_vec()));

    // Application data record is not a handshake.
    let reply = exchange(handle.addr, &[0x17, 0x03, 0x03, 0x00]).await.unwrap();
    assert_eq!(reply, b"other");
}

#[tokio::test]
async fn unmatched_connection_gets_not_found() {
    let mux = ServeMux::new();
    mux.handle(matcher::prefix(["SSH-"]), harness::responder("ssh", 4));
    let handle = MuxHandle::spawn(mux).await.unwrap();

    // Exactly what the matcher reads, so nothing is left unread on close.
    let reply = exchange(handle.addr, b"HELO").await.unwrap();
    assert_eq!(reply, NOT_FOUND_RESPONSE);
}

#[tokio::test]
async fn silent_client_falls_through_after_read_timeout() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mux = ServeMux::new();
    mux.set_read_timeout(Some(Duration::from_millis(50)));
    mux.handle(matcher::prefix(["SSH-"]), recorder("ssh", tx.clone()));
    mux.handle(matcher::any(), recorder("fallback", tx));
    let handle = MuxHandle::spawn(mux).await.unwrap();

    let mut client = TcpStream::connect(handle.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The deadline only bounds classification; the fallback keeps reading.
    client.write_all(b"late bytes").await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(read_reply(&mut client).await.unwrap(), b"fallback");
    assert_eq!(next(&mut rx).await, ("fallback", b"late bytes".to_vec()));
}

#[tokio::test]
async fn sub_listener_receives_connection_after_silence() {
    let mux = ServeMux::new();
    mux.set_read_timeout(Some(Duration::from_millis(50)));
    let sub = mux.handle_listener(matcher::any());
    let handle = MuxHandle::spawn(mux).await.unwrap();

    let mut client = TcpStream::connect(handle.addr).await.unwrap();
    let mut conn = timeout(Duration::from_secs(2), sub.accept())
        .await
        .expect("sub-listener never saw the connection")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();

    let mut seen = Vec::new();
    conn.read_to_end(&mut seen).await.unwrap();
    assert_eq!(seen, b"ping");
    assert!(conn.is_hijacked());
}

/// Reads four bytes and declines.
fn greedy_refusal(conn: &mut Conn) -> BoxFuture<'_, bool> {
    Box::pin(async move {
        let mut buf = [0u8; 4];
        let _ = conn.read_exact(&mut buf).await;
        false
    })
}

#[tokio::test]
async fn failed_matcher_leaves_stream_for_next() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mux = ServeMux::new();
    mux.handle(matcher::match_fn(greedy_refusal), recorder("greedy", tx.clone()));
    mux.handle(matcher::prefix(["PING"]), recorder("ping", tx));
    let handle = MuxHandle::spawn(mux).await.unwrap();

    let reply = exchange(handle.addr, b"PING 1").await.unwrap();
    assert_eq!(reply, b"ping");
    assert_eq!(next(&mut rx).await, ("ping", b"PING 1".to_vec()));
}

fn hpack_block(headers: &[(&str, &str)]) -> Vec<u8> {
    let mut encoder = hpack::Encoder::new();
    encoder.encode(
        &headers
            .iter()
            .map(|(name, value)| (name.as_bytes().to_vec(), value.as_bytes().to_vec()))
            .collect(),
    )
}

fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn h2_request(content_type: &str) -> Vec<u8> {
    let block = hpack_block(&[
        (":method", "POST"),
        (":scheme", "http"),
        (":path", "/helloworld.Greeter/SayHello"),
        (":authority", "localhost"),
        ("content-type", content_type),
    ]);
    let mut stream = matcher::HTTP2_CLIENT_PREFACE.to_vec();
    stream.extend(frame(0x4, 0, 0, &[]));
    stream.extend(frame(0x1, 0x4, 1, &block));
    stream
}

#[tokio::test]
async fn grpc_and_plain_http2_are_told_apart() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mux = ServeMux::new();
    mux.handle(matcher::grpc(), recorder("grpc", tx.clone()));
    mux.handle(matcher::http2(), recorder("h2", tx.clone()));
    mux.handle(matcher::http1_fast(), recorder("http", tx));
    let handle = MuxHandle::spawn(mux).await.unwrap();

    let request = h2_request("application/grpc");
    let reply = exchange(handle.addr, &request).await.unwrap();
    // The gRPC matcher answers the client SETTINGS before the handler runs.
    assert!(reply.starts_with(&[0, 0, 0, 0x4, 0, 0, 0, 0, 0]));
    assert!(reply.ends_with(b"grpc"));
    assert_eq!(next(&mut rx).await, ("grpc", request));

    let request = h2_request("text/html");
    let reply = exchange(handle.addr, &request).await.unwrap();
    assert!(reply.ends_with(b"h2"));
    assert_eq!(next(&mut rx).await, ("h2", request));

    let reply = exchange(handle.addr, REQUEST).await.unwrap();
    assert_eq!(reply, b"http");
}

fn tagged(tag: &str) -> Box<dyn Matcher> {
    match tag {
        "get" => matcher::prefix(["GET "]).boxed(),
        "g" => matcher::prefix(["G"]).boxed(),
        "http" => matcher::http1_fast().boxed(),
        _ => matcher::any().boxed(),
    }
}

#[rstest]
#[case::longest_prefix_first(&["get", "g", "any"], "get")]
#[case::shortest_prefix_first(&["g", "get", "any"], "g")]
#[case::method_matcher_first(&["http", "get", "any"], "http")]
#[case::catch_all_first(&["any", "http", "get"], "any")]
#[tokio::test]
async fn first_registered_match_wins(#[case] order: &[&'static str], #[case] expected: &str) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mux = ServeMux::new();
    for &tag in order {
        mux.handle(tagged(tag), recorder(tag, tx.clone()));
    }
    let handle = MuxHandle::spawn(mux).await.unwrap();

    for _ in 0..3 {
        let reply = exchange(handle.addr, REQUEST).await.unwrap();
        assert_eq!(reply, expected.as_bytes());
        let (tag, seen) = next(&mut rx).await;
        assert_eq!(tag, expected);
        assert_eq!(seen, REQUEST);
    }
}
