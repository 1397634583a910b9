//! End-to-end request/response flows over a loopback socket.
//!
//! These drive the connection state machine exactly as a worker would:
//! read, process, write. The sockets stay blocking so each step completes
//! deterministically without an event loop.

use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use peregrine_core::{HttpConnection, NextStep, SendOutcome, TrigMode, UserDirectory};

fn doc_root() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(
        tmp.path().join("judge.html"),
        b"<html><body>home</body></html>",
    )
    .unwrap();
    fs::write(tmp.path().join("welcome.html"), b"<html>welcome</html>").unwrap();
    fs::write(tmp.path().join("logError.html"), b"<html>bad login</html>").unwrap();
    fs::write(tmp.path().join("registerError.html"), b"<html>taken</html>").unwrap();
    tmp
}

fn connect(doc_root: &Path) -> (HttpConnection, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let (server, _) = listener.accept().unwrap();
    let peer = server.peer_addr().unwrap();
    let conn = HttpConnection::new(
        server,
        peer,
        TrigMode::Level,
        Arc::new(doc_root.to_path_buf()),
    );
    (conn, client)
}

/// Read, process, and send exactly as a worker would; returns the final
/// send outcome.
fn drive(conn: &mut HttpConnection, users: &UserDirectory) -> SendOutcome {
    loop {
        assert!(conn.read_once(), "peer closed mid-request");
        match conn.process(users, None) {
            NextStep::AwaitRead => continue,
            NextStep::AwaitWrite => break,
            NextStep::Close => panic!("connection unexpectedly unusable"),
        }
    }
    conn.write()
}

fn read_exact_string(client: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    client.read_exact(&mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

#[test]
fn static_get_with_keep_alive_replays_on_same_socket() {
    let root = doc_root();
    let (mut conn, mut client) = connect(root.path());
    let users = UserDirectory::new();

    let body = "<html><body>home</body></html>";
    let expected = format!(
        "HTTP/1.1 200 OK\r\nContent-Length:{}\r\nConnection:keep-alive\r\n\r\n{body}",
        body.len()
    );

    for _ in 0..2 {
        client
            .write_all(b"GET /judge.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert_eq!(drive(&mut conn, &users), SendOutcome::KeepAlive);
        assert_eq!(read_exact_string(&mut client, expected.len()), expected);
    }
}

#[test]
fn root_url_serves_the_judge_page() {
    let root = doc_root();
    let (mut conn, mut client) = connect(root.path());
    let users = UserDirectory::new();

    client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    assert_eq!(drive(&mut conn, &users), SendOutcome::Close);
    drop(conn);

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Connection:close\r\n"));
    assert!(response.ends_with("<html><body>home</body></html>"));
}

#[test]
fn missing_file_gets_404_with_inline_body() {
    let root = doc_root();
    let (mut conn, mut client) = connect(root.path());
    let users = UserDirectory::new();

    client
        .write_all(b"GET /nosuchfile HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    assert_eq!(drive(&mut conn, &users), SendOutcome::Close);
    drop(conn);

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(response.contains("The requested file was not found on this server.\n"));
}

#[test]
fn malformed_version_gets_400() {
    let root = doc_root();
    let (mut conn, mut client) = connect(root.path());
    let users = UserDirectory::new();

    client.write_all(b"GET /x HTP/1.0\r\n\r\n").unwrap();
    assert_eq!(drive(&mut conn, &users), SendOutcome::Close);
    drop(conn);

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn login_success_serves_welcome_page() {
    let root = doc_root();
    let (mut conn, mut client) = connect(root.path());
    let users = UserDirectory::new();
    users.insert("alice", "secret");

    client
        .write_all(
            b"POST /2CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-length: 26\r\n\r\n\
              user=alice&password=secret",
        )
        .unwrap();
    assert_eq!(drive(&mut conn, &users), SendOutcome::Close);
    drop(conn);

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("<html>welcome</html>"));
}

#[test]
fn login_failure_serves_error_page() {
    let root = doc_root();
    let (mut conn, mut client) = connect(root.path());
    let users = UserDirectory::new();
    users.insert("alice", "secret");

    client
        .write_all(
            b"POST /2CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-length: 25\r\n\r\n\
              user=alice&password=wrong",
        )
        .unwrap();
    assert_eq!(drive(&mut conn, &users), SendOutcome::Close);
    drop(conn);

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.ends_with("<html>bad login</html>"));
}

#[test]
fn registration_collision_serves_error_and_keeps_directory() {
    let root = doc_root();
    let (mut conn, mut client) = connect(root.path());
    let users = UserDirectory::new();
    users.insert("alice", "secret");

    client
        .write_all(
            b"POST /3CGISQL.cgi HTTP/1.1\r\nHost: x\r\nContent-length: 21\r\n\r\n\
              user=alice&password=x",
        )
        .unwrap();
    assert_eq!(drive(&mut conn, &users), SendOutcome::Close);
    drop(conn);

    let mut response = String::new();
    client.read_to_string(&mut response).unwrap();
    assert!(response.ends_with("<html>taken</html>"));
    assert_eq!(users.len(), 1);
    assert!(users.verify("alice", "secret"));
}
