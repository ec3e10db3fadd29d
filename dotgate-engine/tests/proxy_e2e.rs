//! End-to-end proxy tests over real listener sockets
//!
//! These tests run the real listener drivers and the real proxy handler
//! against a scripted upstream client, verifying the transport reshape on
//! the wire as a client would see it.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use dotgate_engine::{NoopErrorSink, ProxyHandler, ProxyHandlerOpts};
use dotgate_metrics::NoopHook;
use dotgate_net::mock::{MockClient, MockConn, MockOutcome};
use dotgate_net::{TcpServer, TcpServerOpts, UdpServer, UdpServerOpts};

type WriteCaptures = Arc<Mutex<Vec<Arc<Mutex<Vec<u8>>>>>>;

fn framed(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(2 + payload.len());
    framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Builds a handler whose upstream serves the given length-prefixed
/// responses, one connection per response, capturing upstream writes.
fn scripted_handler(responses: Vec<Vec<u8>>) -> (Arc<ProxyHandler>, WriteCaptures) {
    let captures: WriteCaptures = Arc::new(Mutex::new(Vec::new()));

    let script = responses
        .into_iter()
        .map(|response| {
            let captures = Arc::clone(&captures);
            MockOutcome::Conn(Box::new(move || {
                let conn = MockConn::new(vec![response]);
                captures.lock().unwrap().push(conn.written());
                conn
            }))
        })
        .collect();

    let handler = ProxyHandler::new(
        Arc::new(MockClient::with_script(script, true)),
        Arc::new(NoopHook),
        Arc::new(NoopHook),
        Arc::new(NoopHook),
        Arc::new(NoopErrorSink),
        ProxyHandlerOpts {
            max_upstream_retries: 4,
        },
    );

    (Arc::new(handler), captures)
}

#[tokio::test]
async fn udp_client_round_trip_reshapes_both_directions() {
    let query: Vec<u8> = (0..40u8).collect();
    let response_payload: Vec<u8> = (0..42u8).rev().collect();

    let (handler, captures) = scripted_handler(vec![framed(&response_payload)]);

    let server = UdpServer::bind(
        "127.0.0.1:0",
        UdpServerOpts {
            max_concurrent_connections: 2,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(handler));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(&query, addr).await.unwrap();

    let mut buf = [0u8; 512];
    let (n, _) = client.recv_from(&mut buf).await.unwrap();

    // The client sees exactly the bare response payload.
    assert_eq!(&buf[..n], &response_payload[..]);

    // The upstream saw the query with the stream-framing prefix prepended.
    let upstream_written = captures.lock().unwrap()[0].lock().unwrap().clone();
    assert_eq!(upstream_written, framed(&query));
}

#[tokio::test]
async fn tcp_client_round_trip_passes_frames_verbatim() {
    let query: Vec<u8> = (0..40u8).collect();
    let response_payload: Vec<u8> = (0..42u8).rev().collect();
    let framed_query = framed(&query);
    let framed_response = framed(&response_payload);

    let (handler, captures) = scripted_handler(vec![framed_response.clone()]);

    let server = TcpServer::bind("127.0.0.1:0", Arc::new(NoopHook), TcpServerOpts::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(handler));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&framed_query).await.unwrap();

    let mut buf = vec![0u8; framed_response.len()];
    client.read_exact(&mut buf).await.unwrap();

    // Length prefix and payload arrive untouched.
    assert_eq!(buf, framed_response);

    // The upstream saw the client's frame unchanged.
    let upstream_written = captures.lock().unwrap()[0].lock().unwrap().clone();
    assert_eq!(upstream_written, framed_query);
}

#[tokio::test]
async fn sequential_udp_requests_are_served_independently() {
    let first_resp: Vec<u8> = vec![0xAA; 12];
    let second_resp: Vec<u8> = vec![0xBB; 24];

    let (handler, _captures) =
        scripted_handler(vec![framed(&first_resp), framed(&second_resp)]);

    let server = UdpServer::bind(
        "127.0.0.1:0",
        UdpServerOpts {
            max_concurrent_connections: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(handler));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 512];

    client.send_to(b"first query", addr).await.unwrap();
    let (n, _) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &first_resp[..]);

    client.send_to(b"second query", addr).await.unwrap();
    let (n, _) = client.recv_from(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &second_resp[..]);
}
