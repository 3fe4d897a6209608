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

//! Decodes query strings and the two request body encodings the
//! dispatcher cares about (`application/x-www-form-urlencoded` and
//! `multipart/form-data`) into a flat name→value map. Neither encoding
//! is handled by a general-purpose crate here: both are small, fixed
//! grammars and the corpus this grew out of hand-rolls its own request
//! parsing throughout rather than reaching for `url`/`multer`.

use std::collections::HashMap;

use tracing::warn;

pub type Args = HashMap<String, String>;

/// Decode `application/x-www-form-urlencoded` bytes (also used for
/// query strings) into a name→value map. Malformed `%` escapes are
/// logged once and copied through literally rather than rejected.
pub fn parse_urlencoded(body: &[u8]) -> Args {
    let mut args = Args::new();
    if body.is_empty() {
        return args;
    }
    for pair in body.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match pair.iter().position(|&b| b == b'=') {
            Some(idx) => (&pair[..idx], &pair[idx + 1..]),
            None => (pair, &pair[pair.len()..]),
        };
        args.insert(unescape(name), unescape(value));
    }
    args
}

fn unescape(bytes: &[u8]) -> String {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() && is_hex(bytes[i + 1]) && is_hex(bytes[i + 2]) => {
                let hi = hex_val(bytes[i + 1]);
                let lo = hex_val(bytes[i + 2]);
                out.push((hi << 4) | lo);
                i += 3;
            }
            b'%' => {
                warn!("malformed %% escape in urlencoded data, copying literally");
                out.push(b'%');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_hex(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

/// Extract the boundary token from a `Content-Type: multipart/form-data;
/// boundary=...` header value.
pub fn multipart_boundary(content_type: &str) -> Option<String> {
    content_type.split(';').map(str::trim).find_map(|part| {
        part.strip_prefix("boundary=").map(|b| b.trim_matches('"').to_string())
    })
}

/// Parse a `multipart/form-data` body down to its named text fields.
/// File uploads (parts with a `filename=` in their `Content-Disposition`)
/// are recognized but their bodies are discarded, matching spec: binary
/// file uploads are out of scope for this dispatcher.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Args {
    let mut args = Args::new();
    let delim = format!("--{}", boundary);
    let delim = delim.as_bytes();

    for part in split_on_boundary(body, delim) {
        let Some(header_end) = find_subslice(part, b"\r\n\r\n") else { continue };
        let header_bytes = &part[..header_end];
        let part_body = &part[header_end + 4..];
        let headers = String::from_utf8_lossy(header_bytes);

        let Some(name) = headers
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
            .and_then(|l| extract_quoted(l, "name="))
        else {
            continue;
        };

        let is_file = headers
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with("content-disposition"))
            .map(|l| l.contains("filename="))
            .unwrap_or(false);
        if is_file {
            continue;
        }

        // Strip the trailing CRLF the encoder puts before the next
        // boundary delimiter.
        let trimmed = part_body.strip_suffix(b"\r\n").unwrap_or(part_body);
        args.insert(name, String::from_utf8_lossy(trimmed).into_owned());
    }

    args
}

fn extract_quoted(line: &str, key: &str) -> Option<String> {
    let idx = line.find(key)?;
    let rest = &line[idx + key.len()..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

fn split_on_boundary<'a>(body: &'a [u8], delim: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    let mut rest = body;
    while let Some(pos) = find_subslice(rest, delim) {
        let after = &rest[pos + delim.len()..];
        if after.starts_with(b"--") {
            break; // final boundary
        }
        let after = after.strip_prefix(b"\r\n").unwrap_or(after);
        rest = after;
        if let Some(next) = find_subslice(rest, delim) {
            parts.push(&rest[..next]);
        }
    }
    parts
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plus_and_percent_escapes() {
        let args = parse_urlencoded(b"width=80&height=24&keys=1b5b41");
        assert_eq!(args.get("width").map(String::as_str), Some("80"));
        assert_eq!(args.get("keys").map(String::as_str), Some("1b5b41"));

        let args = parse_urlencoded(b"rooturl=http%3A%2F%2Fx%2Fy+z");
        assert_eq!(args.get("rooturl").map(String::as_str), Some("http://x/y z"));
    }

    #[test]
    fn tolerates_a_lone_percent() {
        let args = parse_urlencoded(b"a=100%");
        assert_eq!(args.get("a").map(String::as_str), Some("100%"));
    }

    #[test]
    fn extracts_boundary_token() {
        let ct = "multipart/form-data; boundary=----WebKitFormBoundaryXYZ";
        assert_eq!(multipart_boundary(ct).as_deref(), Some("----WebKitFormBoundaryXYZ"));
    }

    #[test]
    fn parses_simple_multipart_fields() {
        let boundary = "X";
        let body = "--X\r\nContent-Disposition: form-data; name=\"width\"\r\n\r\n80\r\n--X\r\nContent-Disposition: form-data; name=\"keys\"\r\n\r\n1b5b41\r\n--X--\r\n";
        let args = parse_multipart(body.as_bytes(), boundary);
        assert_eq!(args.get("width").map(String::as_str), Some("80"));
        assert_eq!(args.get("keys").map(String::as_str), Some("1b5b41"));
    }

    #[test]
    fn discards_file_upload_parts() {
        let boundary = "X";
        let body = "--X\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n\r\nbinary junk\r\n--X--\r\n";
        let args = parse_multipart(body.as_bytes(), boundary);
        assert!(args.get("f").is_none());
    }
}
