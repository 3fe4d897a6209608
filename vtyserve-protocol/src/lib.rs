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

//! Wire types shared between the main vtyserve process and the
//! privileged launcher subprocess it forks before dropping privileges.
//!
//! The channel is a UNIX-domain socket pair, not a generic RPC stream:
//! the reply carries a raw file descriptor (the PTY master) out of band
//! via `SCM_RIGHTS`, so the framing here is hand rolled rather than
//! piped through a general purpose serializer the way the rest of this
//! workspace's control-plane protocols are.

use std::io::{self, Read, Write};

use anyhow::{anyhow, Context};
use byteorder::{LittleEndian, ReadBytesExt as _, WriteBytesExt as _};

/// Upper bound on the peer name we'll embed in a `LaunchRequest`. Longer
/// names are truncated by the sender.
pub const PEER_NAME_CAP: usize = 64;

/// Upper bound on the URL bytes that follow a `LaunchRequest` header.
/// This keeps a malicious or confused peer from forcing the launcher to
/// allocate an unbounded buffer.
pub const MAX_URL_LEN: u32 = 16 * 1024;

/// Identifies which authentication/identity policy a service mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LaunchPolicy {
    /// Hand off to `/bin/login -p -h <peer>`.
    Login = 0,
    /// Prompt for a username, then `ssh` to the configured host.
    Ssh = 1,
    /// Pluggable-authentication prompt, then exec as the resolved user.
    Auth = 2,
    /// Assume a fixed, statically configured uid/gid with no prompt.
    UidGid = 3,
}

impl TryFrom<i32> for LaunchPolicy {
    type Error = anyhow::Error;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(LaunchPolicy::Login),
            1 => Ok(LaunchPolicy::Ssh),
            2 => Ok(LaunchPolicy::Auth),
            3 => Ok(LaunchPolicy::UidGid),
            _ => Err(anyhow!("unknown launch policy tag {}", v)),
        }
    }
}

/// The fixed-size header the main process sends to request a new
/// PTY-backed child. `url_len + 1` URL bytes (including a trailing NUL)
/// follow immediately after this header on the wire.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Index into the server's configured service table.
    pub service: i32,
    pub width: u16,
    pub height: u16,
    /// Collapsed to `[-.0-9A-Za-z]` and `-` by the sender; the launcher
    /// re-sanitizes defensively before using it in a login record.
    pub peer_name: String,
    /// The pre-escaped (percent-encoded) request URL that seeded this
    /// session, used for `${url}` expansion in command templates.
    pub url: String,
}

impl LaunchRequest {
    pub fn write_to<W: Write>(&self, w: &mut W) -> anyhow::Result<()> {
        let mut peer_buf = [0u8; PEER_NAME_CAP];
        let peer_bytes = self.peer_name.as_bytes();
        let n = peer_bytes.len().min(PEER_NAME_CAP - 1);
        peer_buf[..n].copy_from_slice(&peer_bytes[..n]);

        let mut url_bytes = self.url.clone().into_bytes();
        url_bytes.push(0);
        if url_bytes.len() as u64 > MAX_URL_LEN as u64 {
            return Err(anyhow!("url of {} bytes exceeds cap of {}", url_bytes.len(), MAX_URL_LEN));
        }

        w.write_i32::<LittleEndian>(self.service)?;
        w.write_u16::<LittleEndian>(self.width)?;
        w.write_u16::<LittleEndian>(self.height)?;
        w.write_all(&peer_buf)?;
        w.write_i32::<LittleEndian>((url_bytes.len() - 1) as i32)?;
        w.write_all(&url_bytes)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> anyhow::Result<Self> {
        let service = r.read_i32::<LittleEndian>()?;
        let width = r.read_u16::<LittleEndian>()?;
        let height = r.read_u16::<LittleEndian>()?;

        let mut peer_buf = [0u8; PEER_NAME_CAP];
        r.read_exact(&mut peer_buf)?;
        let peer_end = peer_buf.iter().position(|&b| b == 0).unwrap_or(PEER_NAME_CAP);
        let peer_name = String::from_utf8_lossy(&peer_buf[..peer_end]).into_owned();

        let url_len = r.read_i32::<LittleEndian>().context("reading url_len")?;
        if url_len < 0 || url_len as u32 > MAX_URL_LEN {
            return Err(anyhow!("url_len {} out of bounds", url_len));
        }
        let mut url_buf = vec![0u8; url_len as usize + 1];
        r.read_exact(&mut url_buf).context("reading url bytes")?;
        url_buf.pop(); // trailing NUL
        let url = String::from_utf8_lossy(&url_buf).into_owned();

        Ok(LaunchRequest { service, width, height, peer_name, url })
    }
}

/// The reply to a `LaunchRequest`. The master PTY file descriptor (or, on
/// failure, a pipe that will yield a one-line diagnostic) rides alongside
/// this header as `SCM_RIGHTS` ancillary data — see
/// `libvtyserve::launcher` for the `sendmsg`/`recvmsg` glue.
#[derive(Debug, Clone, Copy)]
pub struct LaunchReply {
    /// Zero is the sentinel for "the launcher failed to start a child";
    /// the accompanying FD is a readable pipe with a diagnostic line
    /// instead of a PTY master in that case.
    pub pid: i32,
}

impl LaunchReply {
    pub const WIRE_LEN: usize = 4;

    pub fn ok(pid: i32) -> Self {
        LaunchReply { pid }
    }

    pub fn error() -> Self {
        LaunchReply { pid: 0 }
    }

    pub fn is_error(&self) -> bool {
        self.pid == 0
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_i32::<LittleEndian>(self.pid)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(LaunchReply { pid: r.read_i32::<LittleEndian>()? })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn launch_request_round_trip() {
        let req = LaunchRequest {
            service: 3,
            width: 80,
            height: 24,
            peer_name: "10.0.0.1".to_string(),
            url: "/foo?session=abc".to_string(),
        };

        let mut buf = Vec::new();
        req.write_to(&mut buf).expect("encode");
        let got = LaunchRequest::read_from(&mut &buf[..]).expect("decode");

        assert_eq!(got.service, req.service);
        assert_eq!(got.width, req.width);
        assert_eq!(got.height, req.height);
        assert_eq!(got.peer_name, req.peer_name);
        assert_eq!(got.url, req.url);
    }

    #[test]
    fn peer_name_is_truncated_not_rejected() {
        let long_peer = "x".repeat(PEER_NAME_CAP * 2);
        let req = LaunchRequest {
            service: 0,
            width: 1,
            height: 1,
            peer_name: long_peer,
            url: "/".to_string(),
        };
        let mut buf = Vec::new();
        req.write_to(&mut buf).expect("encode");
        let got = LaunchRequest::read_from(&mut &buf[..]).expect("decode");
        assert_eq!(got.peer_name.len(), PEER_NAME_CAP - 1);
    }

    #[test]
    fn oversized_url_is_rejected() {
        let req = LaunchRequest {
            service: 0,
            width: 1,
            height: 1,
            peer_name: "p".to_string(),
            url: "x".repeat(MAX_URL_LEN as usize + 1),
        };
        let mut buf = Vec::new();
        assert!(req.write_to(&mut buf).is_err());
    }

    #[test]
    fn launch_reply_round_trip() {
        for pid in [0, 1, 42, i32::MAX] {
            let reply = LaunchReply { pid };
            let mut buf = Vec::new();
            reply.write_to(&mut buf).expect("encode");
            let got = LaunchReply::read_from(&mut &buf[..]).expect("decode");
            assert_eq!(got.pid, reply.pid);
            assert_eq!(got.is_error(), pid == 0);
        }
    }

    #[test]
    fn launch_policy_round_trip() {
        for p in [LaunchPolicy::Login, LaunchPolicy::Ssh, LaunchPolicy::Auth, LaunchPolicy::UidGid] {
            let encoded = p as i32;
            let decoded = LaunchPolicy::try_from(encoded).expect("decode");
            assert_eq!(decoded, p);
        }
        assert!(LaunchPolicy::try_from(99).is_err());
    }
}
