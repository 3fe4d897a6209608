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

//! The pre-RFC6455 "hixie" draft framing: a type byte followed either
//! by a `0xFF`-terminated text payload, or — when the high bit of the
//! type byte is set — a base-128 variable-length length prefix and a
//! binary payload of exactly that many bytes. There is no masking, no
//! extensions, no close-frame negotiation; this is the framing the
//! oldest browsers this server still needs to support speak.

use crate::consts::MAX_WS_FRAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Vec<u8>),
    Binary(Vec<u8>),
}

/// How much of `buf` a full frame would need, and what was parsed. A
/// caller with a partial frame gets `None` back and should wait for
/// more bytes to arrive before calling again.
pub fn parse_one(buf: &[u8]) -> anyhow::Result<Option<(Frame, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let type_byte = buf[0];
    if type_byte & 0x80 == 0 {
        // Text frame: scan for the 0xFF terminator.
        match buf[1..].iter().position(|&b| b == 0xFF) {
            Some(end) => Ok(Some((Frame::Text(buf[1..1 + end].to_vec()), 1 + end + 1))),
            None => Ok(None),
        }
    } else {
        // Binary frame: base-128 length prefix, continuation bit 0x80.
        let mut len: u64 = 0;
        let mut idx = 1;
        loop {
            if idx >= buf.len() {
                return Ok(None);
            }
            let b = buf[idx];
            len = (len << 7) | (b & 0x7f) as u64;
            idx += 1;
            if len > MAX_WS_FRAME_LEN {
                return Err(anyhow::anyhow!("websocket frame length {} exceeds cap", len));
            }
            if b & 0x80 == 0 {
                break;
            }
        }
        let total_needed = idx + len as usize;
        if buf.len() < total_needed {
            return Ok(None);
        }
        Ok(Some((Frame::Binary(buf[idx..total_needed].to_vec()), total_needed)))
    }
}

/// Encode a frame for sending to the browser. The server only ever
/// sends text frames (PTY output re-encoded as UTF-8-safe bytes), but
/// binary encoding is implemented too since it's symmetric and cheap.
pub fn encode(frame: &Frame) -> Vec<u8> {
    match frame {
        Frame::Text(payload) => {
            let mut out = Vec::with_capacity(payload.len() + 2);
            out.push(0x00);
            out.extend_from_slice(payload);
            out.push(0xFF);
            out
        }
        Frame::Binary(payload) => {
            let mut out = Vec::with_capacity(payload.len() + 6);
            out.push(0x80);
            let mut len = payload.len() as u64;
            let mut len_bytes = Vec::new();
            if len == 0 {
                len_bytes.push(0);
            }
            while len > 0 {
                len_bytes.push((len & 0x7f) as u8);
                len >>= 7;
            }
            len_bytes.reverse();
            for (i, b) in len_bytes.iter().enumerate() {
                let continuation = if i + 1 < len_bytes.len() { 0x80 } else { 0 };
                out.push(b | continuation);
            }
            out.extend_from_slice(payload);
            out
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn text_frame_round_trip() {
        let frame = Frame::Text(b"hello".to_vec());
        let wire = encode(&frame);
        let (parsed, consumed) = parse_one(&wire).unwrap().unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn binary_frame_round_trip_small_and_large() {
        for len in [0usize, 1, 127, 128, 300, 20000] {
            let payload = vec![0x42u8; len];
            let frame = Frame::Binary(payload.clone());
            let wire = encode(&frame);
            let (parsed, consumed) = parse_one(&wire).unwrap().unwrap();
            assert_eq!(parsed, Frame::Binary(payload));
            assert_eq!(consumed, wire.len());
        }
    }

    #[test]
    fn partial_text_frame_returns_none() {
        assert_eq!(parse_one(b"\x00hello").unwrap(), None);
    }

    #[test]
    fn partial_binary_frame_returns_none() {
        // high bit set length byte with continuation bit but no payload yet
        assert_eq!(parse_one(&[0x80, 0x85]).unwrap(), None);
    }

    #[test]
    fn oversized_length_is_rejected() {
        // A handful of continuation bytes whose accumulated value blows
        // past the cap long before a payload could follow.
        let wire = [0x80u8, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert!(parse_one(&wire).is_err());
    }
}
