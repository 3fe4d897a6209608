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

pub mod dispatcher;
pub mod json;
pub mod pty_io;
pub mod registry;

use rand::RngCore;

use crate::{consts::SESSION_KEY_BYTES, tty::Size};

const KEY_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-/";

/// Draw 16 CSPRNG bytes and encode them with a URL-safe, unpadded
/// base64-ish alphabet (`A-Za-z0-9-/`) to get a 21-2/3-rounded-up
/// character opaque session key. Two bytes do not evenly divide into
/// 6-bit groups, so the last group is padded with zero bits the same
/// way standard base64 pads with `=` — except we just leave the
/// trailing bits as part of the last character rather than appending a
/// pad marker, since there is no decoder on the other end.
pub fn new_session_key() -> String {
    let mut bytes = [0u8; SESSION_KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    encode_key(&bytes)
}

fn encode_key(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8 + 5) / 6);
    let mut acc: u32 = 0;
    let mut bits = 0u32;
    for &b in bytes {
        acc = (acc << 8) | b as u32;
        bits += 8;
        while bits >= 6 {
            bits -= 6;
            let idx = (acc >> bits) & 0x3f;
            out.push(KEY_ALPHABET[idx as usize] as char);
        }
    }
    if bits > 0 {
        let idx = (acc << (6 - bits)) & 0x3f;
        out.push(KEY_ALPHABET[idx as usize] as char);
    }
    out
}

/// A long-lived PTY-backed terminal session, keyed by an opaque string
/// handed to the browser. Everything here is owned by the registry;
/// the event loop only ever reaches it through the registry's map.
pub struct Session {
    pub key: String,
    pub peer_name: String,
    pub pty_fd: std::os::fd::RawFd,
    pub child_pid: i32,
    pub size: Size,
    /// Output produced by the child since the last time it was handed
    /// to a bound poll request.
    pub pending_output: Vec<u8>,
    /// Keystroke bytes queued for the PTY master but not yet written;
    /// drained by the event loop's PTY write-readiness handler.
    pub pending_input: Vec<u8>,
    /// Set once the child has exited; the session then lives until the
    /// graveyard grace period expires or its output is drained.
    pub done: bool,
    pub root_url: Option<String>,
}

impl Session {
    pub fn new(key: String, peer_name: String, pty_fd: std::os::fd::RawFd, child_pid: i32) -> Session {
        Session {
            key,
            peer_name,
            pty_fd,
            child_pid,
            size: Size::default(),
            pending_output: Vec::new(),
            pending_input: Vec::new(),
            done: false,
            root_url: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn session_keys_use_only_the_safe_alphabet() {
        for _ in 0..50 {
            let key = new_session_key();
            assert!(key.len() >= 21 && key.len() <= 22, "unexpected key length {}", key.len());
            assert!(key.bytes().all(|b| KEY_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn encode_key_is_deterministic() {
        let bytes = [0u8; 16];
        assert_eq!(encode_key(&bytes), encode_key(&bytes));
        let all_ff = [0xffu8; 16];
        let key = encode_key(&all_ff);
        assert!(key.bytes().all(|b| KEY_ALPHABET.contains(&b)));
    }
}
