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

//! The poll reply envelope is one fixed two-field object, so it's
//! cheaper and more predictable to hand-encode it than to pull in a
//! general JSON library just for this. PTY output is arbitrary bytes,
//! not valid UTF-8, so every byte above `0x7F` is escaped numerically
//! rather than assumed to be part of a valid encoding.

/// Escape `data` the way a JSON string literal must be escaped, with
/// every byte `< 0x20` or `>= 0x80` forced through `\u00XX` (except the
/// handful with short escapes C recognizes: `\b\f\n\r\t`).
pub fn escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 8);
    for &b in data {
        match b {
            0x08 => out.push_str("\\b"),
            0x0c => out.push_str("\\f"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'/' => out.push_str("\\/"),
            0x00..=0x1f | 0x80..=0xff => out.push_str(&format!("\\u{:04x}", b)),
            _ => out.push(b as char),
        }
    }
    out
}

/// Build the `{"session":"<key>","data":"<escaped>"}` envelope that
/// every poll reply body consists of.
pub fn envelope(session_key: &str, data: &[u8]) -> String {
    format!("{{\"session\":\"{}\",\"data\":\"{}\"}}", session_key, escape(data))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escapes_control_and_high_bytes() {
        assert_eq!(escape(b"\n\t\x01"), "\\n\\t\\u0001");
        assert_eq!(escape(&[0x80, 0xff]), "\\u0080\\u00ff");
    }

    #[test]
    fn escapes_quote_backslash_and_slash() {
        assert_eq!(escape(b"a\"b\\c/d"), "a\\\"b\\\\c\\/d");
    }

    #[test]
    fn passes_through_plain_ascii() {
        assert_eq!(escape(b"hello world"), "hello world");
    }

    #[test]
    fn envelope_round_trip_shape() {
        let env = envelope("abcXYZ012-_", b"ok\n");
        assert_eq!(env, r#"{"session":"abcXYZ012-_","data":"ok\n"}"#);
    }
}
