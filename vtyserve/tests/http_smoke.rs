//! Smoke tests that spawn a real vtyserve process and talk to it over
//! plain HTTP, exercising the event loop/dispatcher stack end to end
//! rather than any single module in isolation.

mod support;

use std::io::{Read, Write};

use support::server::Proc;

/// Sends a bare-bones HTTP/1.0 request and reads the response until the
/// peer closes the connection (HTTP/1.0 has no keep-alive by default,
/// so this is enough to capture a full small response).
fn get(proc: &Proc, path: &str) -> anyhow::Result<String> {
    let mut stream = proc.connect()?;
    write!(stream, "GET {} HTTP/1.0\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n", path)?;
    let mut resp = String::new();
    stream.read_to_string(&mut resp)?;
    Ok(resp)
}

/// Sends an HTTP/1.0 form POST and reads the response until the peer
/// closes the connection.
fn post(proc: &Proc, path: &str, form_body: &str) -> anyhow::Result<String> {
    let mut stream = proc.connect()?;
    write!(
        stream,
        "POST {} HTTP/1.0\r\nHost: 127.0.0.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        form_body.len(),
        form_body
    )?;
    let mut resp = String::new();
    stream.read_to_string(&mut resp)?;
    Ok(resp)
}

fn status_line(resp: &str) -> &str {
    resp.lines().next().unwrap_or("")
}

#[test]
fn serves_bundled_terminal_page() {
    let proc = Proc::new().expect("vtyserve should start");
    let resp = get(&proc, "/vtyserve.html").expect("request should succeed");
    assert!(status_line(&resp).contains("200"), "unexpected status: {}", status_line(&resp));
    assert!(resp.contains("text/html"));
}

#[test]
fn root_service_serves_the_same_bootstrap_page() {
    let proc = Proc::new().expect("vtyserve should start");
    let resp = get(&proc, "/").expect("request should succeed");
    assert!(status_line(&resp).contains("200"), "unexpected status: {}", status_line(&resp));
}

#[test]
fn unrecognized_sub_path_is_a_404() {
    let proc = Proc::new().expect("vtyserve should start");
    let resp = get(&proc, "/not-a-real-endpoint").expect("request should succeed");
    assert!(status_line(&resp).contains("404"), "unexpected status: {}", status_line(&resp));
}

#[test]
fn polling_an_unknown_session_is_a_400() {
    let proc = Proc::new().expect("vtyserve should start");
    let resp = post(&proc, "/?session=not-a-real-session-key", "noop=1").expect("request should succeed");
    assert!(status_line(&resp).contains("400"), "unexpected status: {}", status_line(&resp));
}
