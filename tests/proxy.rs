//! End-to-end tests for the proxy
//!
//! Each test binds a daemon on an ephemeral port, points a raw TCP
//! client at it and scripts the origin server on the other side.

use httprox::proxy::Daemon;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

fn start_proxy() -> SocketAddr {
    let daemon = Daemon::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = daemon.local_addr().unwrap();

    thread::spawn(move || {
        let _ = daemon.run();
    });

    addr
}

/// Read from `stream` until the end of the header block.
fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "peer closed before end of headers");
        head.push(byte[0]);
    }

    String::from_utf8(head).unwrap()
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

#[test]
fn test_persistent_get_reuses_both_connections() {
    let proxy = start_proxy();

    let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();

    let origin = thread::spawn(move || {
        // one accepted connection serves both exchanges
        let (mut stream, _) = origin_listener.accept().unwrap();

        for round in 0..2 {
            let head = read_head(&mut stream);

            assert!(head.starts_with("GET /p HTTP/1.1\r\n"), "{}", head);
            assert!(head.contains(&format!("Host: 127.0.0.1:{}\r\n", origin_port)));
            assert!(head.contains("Connection: keep-alive\r\n"));

            stream
                .write_all(
                    format!(
                        "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Length: 6\r\n\r\nround{}",
                        round
                    )
                    .as_bytes(),
                )
                .unwrap();
        }
    });

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for round in 0..2 {
        client
            .write_all(
                format!(
                    "GET http://127.0.0.1:{}/p HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
                    origin_port
                )
                .as_bytes(),
            )
            .unwrap();

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Content-Length: 6\r\n"));

        let body = read_exact(&mut client, 6);
        assert_eq!(body, format!("round{}", round).as_bytes());
    }

    origin.join().unwrap();
}

#[test]
fn test_chunked_response_relayed_byte_identical() {
    let proxy = start_proxy();

    let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();

    let origin = thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();

        let _head = read_head(&mut stream);

        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n\r\n4\r\ndata\r\n0\r\n\r\n",
            )
            .unwrap();
    });

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
                origin_port
            )
            .as_bytes(),
        )
        .unwrap();

    let head = read_head(&mut client);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));
    assert!(head.contains("Connection: close\r\n"));

    // the proxy closes its side afterwards, so read to EOF
    let mut body = Vec::new();
    client.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"4\r\ndata\r\n0\r\n\r\n");

    origin.join().unwrap();
}

#[test]
fn test_eof_framed_response_rechunked() {
    let proxy = start_proxy();

    let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();

    let origin = thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();

        let _head = read_head(&mut stream);

        // no framing at all: the body runs until we hang up
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nlegacy")
            .unwrap();
    });

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
                origin_port
            )
            .as_bytes(),
        )
        .unwrap();

    let head = read_head(&mut client);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Transfer-Encoding: chunked\r\n"));

    let mut body = Vec::new();
    client.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"6\r\nlegacy\r\n0\r\n\r\n");

    origin.join().unwrap();
}

#[test]
fn test_connect_tunnel_relays_raw_bytes() {
    let proxy = start_proxy();

    let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();

    let origin = thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();

        // echo until the tunnel goes away
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", origin_port).as_bytes())
        .unwrap();

    let head = read_head(&mut client);
    assert!(head.starts_with("HTTP/1.1 200 Connection established\r\n"));
    assert!(head.contains("Proxy-Agent: httprox/"));

    client.write_all(b"opaque bytes").unwrap();
    let echoed = read_exact(&mut client, 12);
    assert_eq!(echoed, b"opaque bytes");

    drop(client);
    origin.join().unwrap();
}

#[test]
fn test_request_body_forwarded_to_origin() {
    let proxy = start_proxy();

    let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();

    let origin = thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();

        let head = read_head(&mut stream);
        assert!(head.starts_with("POST /submit HTTP/1.1\r\n"), "{}", head);
        assert!(head.contains("Content-Length: 4\r\n"));

        let body = read_exact(&mut stream, 4);
        assert_eq!(body, b"ping");

        stream
            .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 4\r\n\r\npong")
            .unwrap();
    });

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(
            format!(
                "POST http://127.0.0.1:{}/submit HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\nConnection: close\r\n\r\nping",
                origin_port
            )
            .as_bytes(),
        )
        .unwrap();

    let head = read_head(&mut client);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

    let body = read_exact(&mut client, 4);
    assert_eq!(body, b"pong");

    origin.join().unwrap();
}

#[test]
fn test_relative_uri_denied() {
    let proxy = start_proxy();

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", text);
    assert!(text.contains("Connection: close\r\n"));
    assert!(text.contains("access denied"));
}

#[test]
fn test_unlisted_method_rejected() {
    let proxy = start_proxy();

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(b"BREW http://a.test/ HTTP/1.1\r\nHost: a.test\r\n\r\n")
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(
        text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"),
        "{}",
        text
    );
}

#[test]
fn test_malformed_origin_status_becomes_502() {
    let proxy = start_proxy();

    let origin_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_port = origin_listener.local_addr().unwrap().port();

    let origin = thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();

        let _head = read_head(&mut stream);

        stream.write_all(b"not a status line\r\n\r\n").unwrap();
    });

    let mut client = TcpStream::connect(proxy).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    client
        .write_all(
            format!(
                "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: x\r\n\r\n",
                origin_port
            )
            .as_bytes(),
        )
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);

    assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", text);

    origin.join().unwrap();
}
