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

//! TLS is behind a trait rather than wired directly into
//! `HttpConnection` so the sniff/upgrade dance in §4.2 only has to know
//! about "feed bytes in, get plaintext out" and never about a specific
//! TLS stack's handshake state machine.

use std::io::{self, Read, Write};

use anyhow::Context;
use rustls::{ServerConfig, ServerConnection};

/// What `HttpConnection` needs from a TLS implementation: take raw
/// socket bytes (the replayed sniff buffer, then live reads) and
/// produce decrypted application bytes, and take plaintext destined for
/// the client and produce bytes to write to the raw socket.
pub trait TlsEngine: Send {
    /// Feed raw bytes read off the socket (including the replayed sniff
    /// buffer on the very first call). Returns decrypted application
    /// bytes ready for the HTTP parser, which may be empty mid-handshake.
    fn feed_ciphertext(&mut self, data: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Queue plaintext to be encrypted and sent to the peer.
    fn write_plaintext(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Drain any ciphertext the engine wants written to the raw socket.
    fn take_outbound_ciphertext(&mut self) -> Vec<u8>;

    /// Initiate a clean shutdown (`close_notify`); per the decided Open
    /// Question, every connection close attempts this rather than a
    /// bare socket close, best-effort.
    fn shutdown(&mut self);

    fn is_handshaking(&self) -> bool;
}

pub struct RustlsEngine {
    conn: ServerConnection,
}

impl RustlsEngine {
    pub fn new(config: std::sync::Arc<ServerConfig>) -> anyhow::Result<RustlsEngine> {
        let conn = ServerConnection::new(config).context("constructing rustls server connection")?;
        Ok(RustlsEngine { conn })
    }
}

impl TlsEngine for RustlsEngine {
    fn feed_ciphertext(&mut self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut cursor = io::Cursor::new(data);
        loop {
            match self.conn.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => return Err(e).context("reading tls record"),
            }
            self.conn.process_new_packets().context("processing tls packets")?;
            if cursor.position() as usize >= data.len() {
                break;
            }
        }

        let mut plaintext = Vec::new();
        match self.conn.reader().read_to_end(&mut plaintext) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(e).context("reading decrypted tls application data"),
        }
        Ok(plaintext)
    }

    fn write_plaintext(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.conn.writer().write_all(data).context("queueing tls plaintext")
    }

    fn take_outbound_ciphertext(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut out).is_err() {
                break;
            }
        }
        out
    }

    fn shutdown(&mut self) {
        self.conn.send_close_notify();
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }
}

/// Load a PEM certificate+key bundle from a directory the way `--cert
/// DIR` specifies it: `DIR` contains one or more `*.pem` files each
/// holding a certificate chain followed by its private key.
pub fn load_server_config(cert_dir: &std::path::Path) -> anyhow::Result<std::sync::Arc<ServerConfig>> {
    let mut certs: Vec<rustls::Certificate> = Vec::new();
    let mut key: Option<rustls::PrivateKey> = None;

    for entry in std::fs::read_dir(cert_dir).with_context(|| format!("reading cert dir {:?}", cert_dir))? {
        let entry = entry?;
        if entry.path().extension().and_then(|e| e.to_str()) != Some("pem") {
            continue;
        }
        let bytes = std::fs::read(entry.path())?;

        let mut reader = io::BufReader::new(bytes.as_slice());
        let der_certs = rustls_pemfile::certs(&mut reader).context("parsing certificate chain")?;
        certs.extend(der_certs.into_iter().map(rustls::Certificate));

        let mut reader = io::BufReader::new(bytes.as_slice());
        if let Some(der_key) = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .context("parsing pkcs8 private key")?
            .into_iter()
            .next()
        {
            key = Some(rustls::PrivateKey(der_key));
        }
    }

    let key = key.ok_or_else(|| anyhow::anyhow!("no private key found under {:?}", cert_dir))?;
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building rustls server config")?;
    Ok(std::sync::Arc::new(config))
}

/// Detection used by `HttpConnection::SniffSsl`: does the leading token
/// of `buf` look like an HTTP request line? TLS client hellos start
/// with `0x16` (handshake content type), which never matches an
/// uppercase-letter method token.
pub fn looks_like_http(buf: &[u8]) -> bool {
    let token_end = buf.iter().position(|&b| b == b' ' || b == b'\t' || b == b'\r' || b == b'\n');
    let Some(end) = token_end else { return buf.iter().all(|&b| b.is_ascii_uppercase()) };
    end > 0 && buf[..end].iter().all(|&b| b.is_ascii_uppercase())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recognizes_http_method_tokens() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"POST "));
        assert!(!looks_like_http(&[0x16, 0x03, 0x01]));
        assert!(!looks_like_http(b"get / HTTP/1.1\r\n"));
    }
}
