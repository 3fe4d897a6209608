// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The per-socket HTTP/1.1 state machine. One `HttpConnection` owns one
//! accepted TCP socket for its whole life; everything about a given
//! request — method, path, headers, how much payload is still owed —
//! lives here and gets reset on the jump back to `State::Command`.

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    net::TcpStream,
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
    cell::RefCell,
    time::Instant,
};

use flate2::{write::DeflateEncoder, Compression};
use tracing::{debug, warn};

use crate::{
    consts::{AJAX_POLL_INTERVAL, AJAX_TIMEOUT, BUF_SIZE, COMPRESS_THRESHOLD, CONN_TIMEOUT, MAX_HEADER_BYTES},
    event_loop::{ConnHandler, ConnId, Interest, Outcome},
    http::{tls::TlsEngine, websocket},
    session::{dispatcher::Dispatcher, json},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    SniffSsl,
    Command,
    Headers,
    Payload,
    DiscardPayload,
    WebSocket,
}

/// What a dispatcher's request handler asks the connection to do next.
pub enum Directive {
    Done,
    ReadMore,
    PartialReply,
    UpgradeWebSocket,
    Error(u16, &'static str),
}

pub struct Request {
    pub method: String,
    pub path: String,
    pub path_info: String,
    pub matched_prefix: String,
    pub version: String,
    pub headers: HashMap<String, String>,
    pub query: String,
}

impl Request {
    fn new() -> Request {
        Request {
            method: String::new(),
            path: String::new(),
            path_info: String::new(),
            matched_prefix: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            query: String::new(),
        }
    }
}

pub struct HttpConnection {
    stream: TcpStream,
    conn_id: Option<ConnId>,
    state: State,
    tls: Option<Box<dyn TlsEngine>>,
    sniff_buf: Vec<u8>,

    inbuf: Vec<u8>,
    request: Request,
    last_header_name: Option<String>,

    content_length: Option<i64>,
    payload_read: i64,
    payload_buf: Vec<u8>,

    outbound: VecDeque<u8>,
    headers_sent: bool,
    done: bool,
    suspended: bool,
    partial_reply: bool,
    closed_read: bool,
    close_after_response: bool,
    /// Guards the EOF-triggered completion path for a `Content-Length`-less
    /// body (see `process_payload`) against firing more than once while
    /// the connection stays suspended or mid-partial-reply afterward.
    payload_finished: bool,

    ws_pending: Vec<u8>,
    pub ws_session_key: Option<String>,

    /// Set while `suspended` for a long-poll reattached to a session:
    /// which session to recheck, and the absolute point past which the
    /// server gives up waiting and replies with an empty envelope.
    pub ajax_key: Option<String>,
    pub ajax_deadline: Option<Instant>,

    dispatcher: Rc<RefCell<Dispatcher>>,
}

impl HttpConnection {
    pub fn new(stream: TcpStream, tls: Option<Box<dyn TlsEngine>>, dispatcher: Rc<RefCell<Dispatcher>>) -> HttpConnection {
        HttpConnection {
            stream,
            conn_id: None,
            state: if tls.is_some() { State::SniffSsl } else { State::Command },
            tls,
            sniff_buf: Vec::new(),
            inbuf: Vec::new(),
            request: Request::new(),
            last_header_name: None,
            content_length: None,
            payload_read: 0,
            payload_buf: Vec::new(),
            outbound: VecDeque::new(),
            headers_sent: false,
            done: false,
            suspended: false,
            partial_reply: false,
            closed_read: false,
            close_after_response: false,
            payload_finished: false,
            ws_pending: Vec::new(),
            ws_session_key: None,
            ajax_key: None,
            ajax_deadline: None,
            dispatcher,
        }
    }

    pub fn set_conn_id(&mut self, id: ConnId) {
        self.conn_id = Some(id);
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Hand the dispatcher the accumulated request body, leaving this
    /// connection's copy empty. Called exactly once per request, from
    /// the payload-complete hook.
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload_buf)
    }

    /// Append `body` to the outbound queue and try to flush
    /// immediately; registers write interest if the kernel buffer is
    /// full. The first call on a response validates/rewrites headers
    /// and applies DEFLATE compression for large bodies.
    pub fn transfer(&mut self, status: u16, extra_headers: &[(&str, String)], body: &[u8]) {
        if !self.headers_sent {
            self.send_headers(status, extra_headers, body, false);
        } else {
            self.outbound.extend(body.iter().copied());
        }
        self.flush();
    }

    /// Like `transfer`, but for `HEAD`: the headers (including
    /// `Content-Length`) match what a `GET` of the same resource would
    /// send, with the response body itself left out.
    pub fn transfer_head(&mut self, status: u16, extra_headers: &[(&str, String)], body: &[u8]) {
        if !self.headers_sent {
            self.send_headers(status, extra_headers, body, true);
        }
        self.flush();
    }

    /// Stream-style partial reply: additional chunks of an
    /// already-started response.
    pub fn transfer_partial(&mut self, body: &[u8]) {
        self.outbound.extend(body.iter().copied());
        self.flush();
    }

    /// Marks this connection as bound to a long-poll wait for `key`. Woken
    /// on the connection's own timeout tick (see `recheck_ajax`) rather
    /// than by any cross-connection signal.
    pub fn suspend_for_ajax(&mut self, key: &str) {
        self.ajax_key = Some(key.to_string());
        self.ajax_deadline = Some(Instant::now() + AJAX_TIMEOUT);
        self.suspended = true;
    }

    fn send_headers(&mut self, status: u16, extra_headers: &[(&str, String)], body: &[u8], suppress_body: bool) {
        let compress = body.len() > COMPRESS_THRESHOLD
            && self.request.headers.get("accept-encoding").map(|v| v.contains("deflate")).unwrap_or(false);

        let (body, encoding_header) = if compress {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
            if enc.write_all(body).is_ok() {
                if let Ok(compressed) = enc.finish() {
                    (compressed, Some("deflate".to_string()))
                } else {
                    (body.to_vec(), None)
                }
            } else {
                (body.to_vec(), None)
            }
        } else {
            (body.to_vec(), None)
        };

        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n",
            status,
            reason_phrase(status),
            body.len()
        );
        if let Some(enc) = encoding_header {
            head.push_str(&format!("Content-Encoding: {}\r\n", enc));
        }
        for (k, v) in extra_headers {
            head.push_str(&format!("{}: {}\r\n", k, v));
        }
        if self.close_after_response {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        self.outbound.extend(head.into_bytes());
        if !suppress_body {
            self.outbound.extend(body);
        }
        self.headers_sent = true;
    }

    fn flush(&mut self) {
        let (chunk, _) = self.outbound.as_slices();
        let chunk: Vec<u8> = self.outbound.iter().copied().collect();
        if chunk.is_empty() {
            return;
        }
        let write_result = match &mut self.tls {
            Some(tls) => {
                let _ = tls.write_plaintext(&chunk);
                let ciphertext = tls.take_outbound_ciphertext();
                self.stream.write(&ciphertext)
            }
            None => self.stream.write(&chunk),
        };

        match write_result {
            Ok(n) => {
                for _ in 0..n.min(chunk.len()) {
                    self.outbound.pop_front();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("write error, closing connection: {:?}", e);
                self.done = true;
            }
        }
    }

    fn reset_for_next_request(&mut self) {
        self.request = Request::new();
        self.last_header_name = None;
        self.content_length = None;
        self.payload_read = 0;
        self.payload_buf.clear();
        self.headers_sent = false;
        self.suspended = false;
        self.partial_reply = false;
        self.payload_finished = false;
        self.state = State::Command;
    }

    fn process_command_line(&mut self) -> anyhow::Result<bool> {
        let Some(pos) = find_crlf(&self.inbuf) else { return Ok(false) };
        let line = String::from_utf8_lossy(&self.inbuf[..pos]).into_owned();
        self.inbuf.drain(..pos + 2);

        let mut parts = line.split_whitespace();
        let method = parts.next().unwrap_or("").to_ascii_uppercase();
        let path_and_query = parts.next().unwrap_or("");
        let version = parts.next().unwrap_or("HTTP/1.1").to_ascii_uppercase();

        if !matches!(method.as_str(), "GET" | "POST" | "HEAD" | "OPTIONS") {
            let status = if matches!(method.as_str(), "PUT" | "DELETE" | "TRACE" | "CONNECT") { 405 } else { 501 };
            self.transfer(status, &[], b"");
            self.close_after_response = true;
            self.state = State::DiscardPayload;
            return Ok(true);
        }

        if !path_and_query.starts_with('/') && !(method == "OPTIONS" && path_and_query == "*") {
            self.transfer(400, &[], b"bad request path");
            self.close_after_response = true;
            self.state = State::DiscardPayload;
            return Ok(true);
        }

        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (path_and_query.to_string(), String::new()),
        };

        self.request.method = method;
        self.request.path = path;
        self.request.query = query;
        self.request.version = version;
        self.state = State::Headers;
        Ok(true)
    }

    fn process_header_lines(&mut self) -> anyhow::Result<bool> {
        loop {
            let Some(pos) = find_crlf(&self.inbuf) else { return Ok(false) };
            if pos == 0 {
                self.inbuf.drain(..2);
                return self.dispatch_request();
            }

            let line_bytes = self.inbuf[..pos].to_vec();
            self.inbuf.drain(..pos + 2);

            if (line_bytes.first() == Some(&b' ') || line_bytes.first() == Some(&b'\t'))
                && self.last_header_name.is_some()
            {
                let name = self.last_header_name.clone().unwrap();
                let cont = String::from_utf8_lossy(&line_bytes).trim().to_string();
                if let Some(existing) = self.request.headers.get_mut(&name) {
                    existing.push(' ');
                    existing.push_str(&cont);
                }
                continue;
            }

            let line = String::from_utf8_lossy(&line_bytes);
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim().to_ascii_lowercase();
                let value = value.trim().to_string();
                if !self.request.headers.contains_key(&name) {
                    self.request.headers.insert(name.clone(), value);
                }
                self.last_header_name = Some(name);
            }

            if self.request.headers.values().map(|v| v.len()).sum::<usize>() > MAX_HEADER_BYTES {
                self.transfer(413, &[], b"");
                self.close_after_response = true;
                self.state = State::DiscardPayload;
                return Ok(true);
            }
        }
    }

    fn dispatch_request(&mut self) -> anyhow::Result<bool> {
        if let Some(host) = self.request.headers.get("host").cloned() {
            let host_only = host.split(':').next().unwrap_or("");
            if !host_only.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
                self.transfer(400, &[], b"bad host header");
                self.close_after_response = true;
                self.state = State::DiscardPayload;
                return Ok(true);
            }
        }

        self.content_length = self.request.headers.get("content-length").and_then(|v| v.parse::<i64>().ok());
        if self.request.headers.get("connection").map(|v| v.eq_ignore_ascii_case("close")).unwrap_or(false)
            || self.request.version == "HTTP/1.0"
        {
            self.close_after_response = true;
        }

        let dispatcher = self.dispatcher.clone();
        let directive = dispatcher.borrow_mut().handle_request(self);

        match directive {
            Directive::Done => {
                self.finish_or_discard();
            }
            Directive::Error(status, msg) => {
                self.transfer(status, &[], msg.as_bytes());
                self.close_after_response = true;
                self.finish_or_discard();
            }
            Directive::ReadMore => match self.content_length {
                Some(cl) if cl > 0 => {
                    self.state = State::Payload;
                }
                Some(_) => {
                    // Content-Length: 0 — an empty but present body; there's
                    // nothing to read, so deliver it right away.
                    self.state = State::Payload;
                    self.finish_payload();
                }
                None => {
                    // No Content-Length: the body runs to EOF, so the
                    // connection can't be reused for a later request.
                    self.close_after_response = true;
                    self.state = State::Payload;
                }
            },
            Directive::PartialReply => {
                self.partial_reply = true;
                self.state = State::Payload;
            }
            Directive::UpgradeWebSocket => {
                self.state = State::WebSocket;
            }
        }
        Ok(true)
    }

    fn finish_or_discard(&mut self) {
        let remaining = self.content_length.unwrap_or(0) - self.payload_read;
        if remaining > 0 {
            self.state = State::DiscardPayload;
        } else {
            self.reset_for_next_request();
        }
    }

    fn process_payload(&mut self) -> anyhow::Result<bool> {
        if self.inbuf.is_empty() {
            // A `Content-Length`-less body only ever completes this way:
            // the peer closes its write side and nothing more is coming.
            if self.closed_read
                && self.content_length.is_none()
                && self.state == State::Payload
                && !self.payload_finished
            {
                self.payload_finished = true;
                self.finish_payload();
                return Ok(true);
            }
            return Ok(false);
        }
        let take = self.inbuf.len();
        let chunk: Vec<u8> = self.inbuf.drain(..take).collect();
        self.payload_read += chunk.len() as i64;
        self.payload_buf.extend_from_slice(&chunk);

        let dispatcher = self.dispatcher.clone();
        dispatcher.borrow_mut().handle_payload_chunk(self, &chunk);

        if self.content_length.map(|cl| self.payload_read >= cl).unwrap_or(false) {
            self.finish_payload();
        }
        Ok(true)
    }

    /// Hands the now-complete body to the dispatcher, then returns the
    /// connection to `Command` unless the dispatcher asked to suspend it
    /// (a bound long poll) or stream a partial reply instead.
    fn finish_payload(&mut self) {
        let dispatcher = self.dispatcher.clone();
        dispatcher.borrow_mut().handle_payload_complete(self);
        if !self.suspended && !self.partial_reply {
            self.reset_for_next_request();
        }
    }

    fn process_websocket(&mut self) -> anyhow::Result<bool> {
        let buf = self.inbuf.clone();
        match websocket::parse_one(&buf)? {
            Some((frame, consumed)) => {
                self.inbuf.drain(..consumed);
                let dispatcher = self.dispatcher.clone();
                dispatcher.borrow_mut().handle_ws_frame(self, frame);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn send_ws_frame(&mut self, frame: websocket::Frame) {
        let wire = websocket::encode(&frame);
        if let Some(tls) = &mut self.tls {
            let _ = tls.write_plaintext(&wire);
            let ciphertext = tls.take_outbound_ciphertext();
            let _ = self.stream.write(&ciphertext);
        } else {
            let _ = self.stream.write(&wire);
        }
    }

    /// Re-checks a suspended session-bound long-poll for freshly arrived
    /// PTY output. There's no cross-connection wake in this reactor, so this
    /// runs every time the connection's own deadline fires while
    /// suspended (see `AJAX_POLL_INTERVAL` in `ConnHandler::handle`
    /// below) rather than being triggered by the PTY becoming readable.
    fn recheck_ajax(&mut self) {
        let Some(key) = self.ajax_key.clone() else { return };

        let dispatcher = self.dispatcher.clone();
        if dispatcher.borrow_mut().try_deliver_ajax(self, &key) {
            self.ajax_key = None;
            self.ajax_deadline = None;
            self.suspended = false;
            self.reset_for_next_request();
            return;
        }

        if self.ajax_deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            let body = json::envelope(&key, b"");
            self.transfer(200, &[("Content-Type", "application/json".to_string())], body.as_bytes());
            self.ajax_key = None;
            self.ajax_deadline = None;
            self.suspended = false;
            self.reset_for_next_request();
        }
    }
}

impl ConnHandler for HttpConnection {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn handle(&mut self, events: &mut Interest, ready: Interest) -> anyhow::Result<Outcome> {
        if ready.contains(Interest::READABLE) {
            let mut buf = [0u8; BUF_SIZE];
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closed_read = true;
                }
                Ok(n) => {
                    let raw = &buf[..n];
                    match &mut self.tls {
                        Some(tls) => {
                            let plaintext = tls.feed_ciphertext(raw)?;
                            self.inbuf.extend(plaintext);
                        }
                        None if self.state == State::SniffSsl => {
                            self.sniff_buf.extend_from_slice(raw);
                            if crate::http::tls::looks_like_http(&self.sniff_buf) || self.sniff_buf.len() > 8 {
                                self.inbuf.extend(std::mem::take(&mut self.sniff_buf));
                                self.state = State::Command;
                            }
                        }
                        None => self.inbuf.extend_from_slice(raw),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => self.closed_read = true,
            }
        }

        if ready.contains(Interest::WRITABLE) {
            self.flush();
        }

        loop {
            let progressed = match self.state {
                State::SniffSsl => false,
                State::Command => self.process_command_line()?,
                State::Headers => self.process_header_lines()?,
                State::Payload | State::DiscardPayload => self.process_payload()?,
                State::WebSocket => self.process_websocket()?,
            };
            if !progressed {
                break;
            }
        }

        if self.suspended {
            self.recheck_ajax();
        }

        *events = if self.outbound.is_empty() { Interest::READABLE } else { Interest::READABLE | Interest::WRITABLE };

        if self.done || (self.closed_read && self.outbound.is_empty() && !self.suspended) {
            if let Some(tls) = &mut self.tls {
                tls.shutdown();
            }
            return Ok(Outcome::Done);
        }

        let timeout = if self.suspended { AJAX_POLL_INTERVAL } else { CONN_TIMEOUT };
        Ok(Outcome::ContinueWithTimeout(timeout))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        101 => "Web Socket Protocol Handshake",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Request Entity Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn finds_crlf_boundary() {
        assert_eq!(find_crlf(b"GET / HTTP/1.1\r\nHost: x\r\n"), Some(14));
        assert_eq!(find_crlf(b"no newline here"), None);
    }
}
