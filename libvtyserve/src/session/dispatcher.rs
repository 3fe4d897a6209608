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

//! The piece that turns a parsed HTTP request into session actions: it
//! owns the path trie mapping service prefixes to configured services,
//! the static asset set, the registry of live sessions, and the client
//! end of the launcher socket. `HttpConnection` knows nothing about any
//! of this; it just calls into the dispatcher at the two points where a
//! request becomes meaningful (headers complete, payload complete) and
//! acts on the `Directive` it gets back.

use std::{cell::RefCell, rc::Rc};

use tracing::{info, warn};

use crate::{
    config::Config,
    event_loop::Spawner,
    http::{connection::Directive, statics, url, websocket::Frame, HttpConnection},
    launcher::LauncherClient,
    session::{json, new_session_key, pty_io::PtyConnHandler, registry::SessionRegistry, Session},
    trie::Trie,
};

/// Static assets served at well-known sub-paths of every mounted
/// service, e.g. `<prefix>/vtyserve.html`.
const PAGE_HTML: &[u8] = include_bytes!("../../assets/vtyserve.html");
const PAGE_JS: &[u8] = include_bytes!("../../assets/vtyserve.js");
const PAGE_CSS: &[u8] = include_bytes!("../../assets/vtyserve.css");

pub struct Dispatcher {
    config: Rc<Config>,
    service_trie: Trie<usize>,
    statics: statics::StaticSet,
    pub registry: SessionRegistry,
    launcher: Option<LauncherClient>,
    pending_body: Option<Exchange>,
    spawner: Spawner,
    /// A back-reference to the `Rc<RefCell<Dispatcher>>` this dispatcher
    /// itself lives behind, set once right after construction (see
    /// `set_self_handle`) so `create_session` can hand the same shared
    /// handle to the PTY connection it spawns. There's no way to obtain
    /// this from inside `&mut self`, so it's threaded in after the fact
    /// rather than computed here.
    self_handle: Option<Rc<RefCell<Dispatcher>>>,
}

/// What to do with the body once it has fully arrived, decided at
/// header time and acted on from `handle_payload_complete`. Every data
/// exchange arrives the same way — a `POST` to a service root — so the
/// only thing decided up front is which session (if any) the `session`
/// query parameter names; whether the form body turns out to carry
/// `keys` or not is only known once it has arrived.
struct Exchange {
    service_idx: usize,
    root_url: String,
    session_key: Option<String>,
}

impl Dispatcher {
    pub fn new(config: Rc<Config>, launcher: Option<LauncherClient>, spawner: Spawner) -> Dispatcher {
        let mut service_trie = Trie::new();
        for (idx, svc) in config.services.iter().enumerate() {
            service_trie.insert(svc.prefix.as_bytes(), idx);
        }

        let mut statics = statics::StaticSet::new();
        statics.insert("/vtyserve.html", statics::StaticAsset::new("text/html; charset=utf-8", PAGE_HTML.to_vec()));
        statics.insert("/vtyserve.js", statics::StaticAsset::new("application/javascript", PAGE_JS.to_vec()));
        statics.insert("/vtyserve.css", statics::StaticAsset::new("text/css", PAGE_CSS.to_vec()));

        let cgi_mode = config.cgi.is_some();
        Dispatcher {
            config,
            service_trie,
            statics,
            registry: SessionRegistry::new(cgi_mode),
            launcher,
            pending_body: None,
            spawner,
            self_handle: None,
        }
    }

    /// Must be called once, immediately after wrapping a freshly built
    /// `Dispatcher` in `Rc<RefCell<_>>`, so `create_session` can clone
    /// the same handle into the PTY connections it spawns.
    pub fn set_self_handle(&mut self, handle: Rc<RefCell<Dispatcher>>) {
        self.self_handle = Some(handle);
    }

    pub fn handle_request(&mut self, conn: &mut HttpConnection) -> Directive {
        let method = conn.request().method.clone();
        let path = conn.request().path.clone();

        if method == "OPTIONS" {
            conn.transfer(200, &[("Allow", "GET, POST, OPTIONS".to_string())], b"");
            return Directive::Done;
        }

        if method == "GET" || method == "HEAD" {
            if let Some(asset) = self.statics.get(&path) {
                let if_none_match = conn.request().headers.get("if-none-match").cloned();
                if statics::StaticSet::not_modified(asset, if_none_match.as_deref()) {
                    return Directive::Error(304, "");
                }
                let headers = [
                    ("Content-Type", asset.content_type.to_string()),
                    ("ETag", asset.etag.clone()),
                    ("Cache-Control", "no-cache".to_string()),
                ];
                let body = asset.body.clone();
                if method == "HEAD" {
                    conn.transfer_head(200, &headers, &body);
                } else {
                    conn.transfer(200, &headers, &body);
                }
                return Directive::Done;
            }
        }

        let Some(m) = self.service_trie.longest_prefix(path.as_bytes()) else {
            return Directive::Error(404, "no service mounted at this path");
        };
        let service_idx = *m.value;
        let remainder = String::from_utf8_lossy(m.remainder).into_owned();

        match (method.as_str(), remainder.as_str()) {
            ("GET" | "HEAD", "" | "/") => {
                let body = self.statics.get("/vtyserve.html").map(|a| a.body.clone()).unwrap_or_default();
                let headers = [("Content-Type", "text/html; charset=utf-8".to_string())];
                if method == "HEAD" {
                    conn.transfer_head(200, &headers, &body);
                } else {
                    conn.transfer(200, &headers, &body);
                }
                Directive::Done
            }
            ("POST", "" | "/") => {
                let query_args = url::parse_urlencoded(conn.request().query.as_bytes());
                let session_key = query_args.get("session").cloned();
                self.pending_body = Some(Exchange { service_idx, root_url: path, session_key });
                Directive::ReadMore
            }
            ("GET", p) if p.starts_with("/ws/") => self.begin_websocket_upgrade(conn, p.trim_start_matches("/ws/")),
            _ => Directive::Error(404, "unrecognized service sub-path"),
        }
    }

    /// Validates and starts a hixie-draft WebSocket handshake. `Origin:`
    /// is rejected if it carries control characters; a valid one is
    /// echoed back as `WebSocket-Origin` alongside `WebSocket-Location`,
    /// both parts of the handshake the draft requires from the server.
    fn begin_websocket_upgrade(&mut self, conn: &mut HttpConnection, key: &str) -> Directive {
        let upgrade_ok =
            conn.request().headers.get("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
        if !upgrade_ok {
            return Directive::Error(400, "expected a websocket upgrade");
        }

        let origin = conn.request().headers.get("origin").cloned().unwrap_or_default();
        if origin.chars().any(|c| c.is_control()) {
            return Directive::Error(400, "bad origin header");
        }

        let scheme = if conn.is_tls() { "wss" } else { "ws" };
        let host = conn.request().headers.get("host").cloned().unwrap_or_default();
        let location = format!("{}://{}{}", scheme, host, conn.request().path);

        conn.ws_session_key = Some(key.to_string());
        conn.transfer(
            101,
            &[
                ("Upgrade", "WebSocket".to_string()),
                ("Connection", "Upgrade".to_string()),
                ("WebSocket-Origin", origin),
                ("WebSocket-Location", location),
            ],
            b"",
        );
        Directive::UpgradeWebSocket
    }

    pub fn handle_payload_chunk(&mut self, _conn: &mut HttpConnection, _chunk: &[u8]) {
        // Bodies here are small control messages (form posts), so
        // nothing streams incrementally; everything happens once the
        // whole body has arrived, in `handle_payload_complete`.
    }

    pub fn handle_payload_complete(&mut self, conn: &mut HttpConnection) {
        let Some(pending) = self.pending_body.take() else { return };
        let body = conn.take_payload();
        let content_type = conn.request().headers.get("content-type").cloned().unwrap_or_default();
        let args = if let Some(boundary) = url::multipart_boundary(&content_type) {
            url::parse_multipart(&body, &boundary)
        } else {
            url::parse_urlencoded(&body)
        };

        match pending.session_key {
            None => self.create_session(conn, pending.service_idx, &pending.root_url, &args),
            Some(key) if args.contains_key("keys") => self.send_keystrokes(conn, &key, &args),
            Some(key) => self.poll_or_suspend(conn, &key),
        }
    }

    fn create_session(&mut self, conn: &mut HttpConnection, service_idx: usize, root_url: &str, args: &url::Args) {
        if self.registry.cgi_session_exists() {
            // A second session in CGI mode ends the one-shot invocation
            // outright rather than just refusing this request.
            conn.transfer(503, &[], b"this server only accepts a single session");
            self.spawner.request_exit();
            return;
        }

        let width: u16 = args.get("width").and_then(|v| v.parse().ok()).unwrap_or(80);
        let height: u16 = args.get("height").and_then(|v| v.parse().ok()).unwrap_or(24);

        let Some(launcher) = &mut self.launcher else {
            conn.transfer(500, &[], b"launcher unavailable");
            return;
        };

        let peer = "unknown".to_string();
        match launcher.launch(service_idx as i32, width, height, &peer, root_url) {
            Ok((pid, pty_fd)) => {
                let key = new_session_key();
                let mut session = Session::new(key.clone(), peer, pty_fd, pid);
                session.size.rows = height;
                session.size.cols = width;
                session.root_url = Some(root_url.to_string());
                if self.registry.insert(session).is_err() {
                    conn.transfer(503, &[], b"this server only accepts a single session");
                    self.spawner.request_exit();
                    return;
                }

                let dispatcher_handle =
                    self.self_handle.clone().expect("Dispatcher::set_self_handle must run before any session is created");
                self.spawner.spawn(Box::new(PtyConnHandler::new(key.clone(), pty_fd, dispatcher_handle, self.config.no_beep)));

                let body = json::envelope(&key, b"");
                info!(session = %key, "created session");
                conn.transfer(200, &[("Content-Type", "application/json".to_string())], body.as_bytes());
            }
            Err(e) => {
                warn!("launch failed: {:?}", e);
                conn.transfer(502, &[], b"failed to launch session");
            }
        }
    }

    fn send_keystrokes(&mut self, conn: &mut HttpConnection, key: &str, args: &url::Args) {
        let Some(session) = self.registry.get_mut(key) else {
            conn.transfer(400, &[], b"no such session");
            return;
        };
        if let Some(hex) = args.get("keys") {
            if let Some(bytes) = decode_hex(hex) {
                session.pending_input.extend(bytes);
            }
        }
        conn.transfer(200, &[], b"");
    }

    /// The poll half of the data-exchange endpoint: answer right away if
    /// there's anything to report, otherwise suspend the connection to be
    /// rechecked on its own timeout tick until `AJAX_TIMEOUT` elapses.
    fn poll_or_suspend(&mut self, conn: &mut HttpConnection, key: &str) {
        if self.try_deliver_ajax(conn, key) {
            return;
        }
        conn.suspend_for_ajax(key);
    }

    /// Attempts to answer a long-poll request for `key` right now.
    /// Returns `true` if it queued a reply on `conn` (including the "no
    /// such session" error case), `false` if the caller should keep
    /// waiting. Shared between the initial bind and the periodic
    /// recheck a suspended connection performs while it waits.
    pub fn try_deliver_ajax(&mut self, conn: &mut HttpConnection, key: &str) -> bool {
        let Some(session) = self.registry.get_mut(key) else {
            conn.transfer(400, &[], b"no such session");
            return true;
        };
        if !session.pending_output.is_empty() {
            let body = json::envelope(key, &session.pending_output);
            session.pending_output.clear();
            conn.transfer(200, &[("Content-Type", "application/json".to_string())], body.as_bytes());
            return true;
        }
        if session.done {
            let body = json::envelope(key, b"");
            conn.transfer(200, &[("Content-Type", "application/json".to_string())], body.as_bytes());
            self.registry.remove(key);
            return true;
        }
        false
    }

    pub fn handle_ws_frame(&mut self, conn: &mut HttpConnection, frame: Frame) {
        let Some(key) = conn.ws_session_key.clone() else { return };
        let Some(session) = self.registry.get_mut(&key) else { return };

        match frame {
            Frame::Text(payload) => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                if let Some(hex) = text.strip_prefix("keys:") {
                    if let Some(bytes) = decode_hex(hex) {
                        session.pending_input.extend(bytes);
                    }
                }
            }
            Frame::Binary(payload) => session.pending_input.extend(payload),
        }
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_even_length_hex() {
        assert_eq!(decode_hex("1b5b41"), Some(vec![0x1b, 0x5b, 0x41]));
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
    }
}
