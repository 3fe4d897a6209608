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

//! The unprivileged side of the launcher socket: what the dispatcher
//! calls into whenever a browser asks for a new session.

use std::{
    io::{IoSliceMut, Write},
    os::unix::{io::{AsRawFd, RawFd}, net::UnixStream},
};

use anyhow::{anyhow, Context};
use nix::sys::socket::{self, ControlMessageOwned, MsgFlags};

use vtyserve_protocol::{LaunchReply, LaunchRequest};

pub struct LauncherClient {
    sock: UnixStream,
}

impl LauncherClient {
    pub fn new(sock: UnixStream) -> LauncherClient {
        LauncherClient { sock }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Send a `LaunchRequest` to the launcher and block for its reply.
    /// This is a synchronous round trip against a process local to this
    /// host that does only bounded work (fork + exec), so it is not run
    /// through the event loop the way client sockets are.
    pub fn launch(&mut self, service: i32, width: u16, height: u16, peer_name: &str, url: &str) -> anyhow::Result<(i32, RawFd)> {
        let req = LaunchRequest { service, width, height, peer_name: peer_name.to_string(), url: url.to_string() };
        let mut buf = Vec::new();
        req.write_to(&mut buf)?;
        self.sock.write_all(&buf).context("writing launch request")?;

        let mut reply_buf = [0u8; LaunchReply::WIRE_LEN];
        let mut iov = [IoSliceMut::new(&mut reply_buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);

        let msg = socket::recvmsg::<()>(self.sock.as_raw_fd(), &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
            .context("receiving launch reply")?;

        let mut fd = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                fd = fds.first().copied();
            }
        }

        let reply = LaunchReply::read_from(&mut &reply_buf[..]).context("decoding launch reply")?;
        if reply.is_error() {
            return Err(anyhow!("launcher refused to start service {}", service));
        }

        let fd = fd.ok_or_else(|| anyhow!("launcher reply carried no pty fd"))?;
        Ok((reply.pid, fd))
    }
}
