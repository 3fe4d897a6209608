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

//! The event loop connection that owns a session's PTY master fd: reads
//! whatever the child wrote since the last pass into
//! `Session::pending_output`, and drains `Session::pending_input` out to
//! the child. Registered once, right after a session is launched, via
//! `event_loop::Spawner` (the dispatcher that creates the session has no
//! `&mut EventLoop` of its own).

use std::{
    cell::RefCell,
    os::fd::RawFd,
    rc::Rc,
};

use nix::errno::Errno;
use tracing::{info, warn};

use crate::{
    consts::{BUF_SIZE, MAX_RESPONSE},
    event_loop::{ConnHandler, Interest, Outcome},
    session::dispatcher::Dispatcher,
};

pub struct PtyConnHandler {
    key: String,
    fd: RawFd,
    dispatcher: Rc<RefCell<Dispatcher>>,
    no_beep: bool,
}

impl PtyConnHandler {
    pub fn new(key: String, fd: RawFd, dispatcher: Rc<RefCell<Dispatcher>>, no_beep: bool) -> PtyConnHandler {
        PtyConnHandler { key, fd, dispatcher, no_beep }
    }
}

impl ConnHandler for PtyConnHandler {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn handle(&mut self, events: &mut Interest, ready: Interest) -> anyhow::Result<Outcome> {
        let mut dispatcher = self.dispatcher.borrow_mut();
        let Some(session) = dispatcher.registry.get_mut(&self.key) else {
            return Ok(Outcome::Done);
        };

        let mut child_gone = false;

        if ready.contains(Interest::READABLE) {
            let mut buf = [0u8; BUF_SIZE];
            loop {
                if session.pending_output.len() >= MAX_RESPONSE {
                    // Stop reading until the client drains what's
                    // already buffered; we'll get another READABLE
                    // notification on the next pass.
                    break;
                }
                // Safety: `self.fd` is the session's own PTY master,
                // owned for the lifetime of this handler.
                match nix::unistd::read(self.fd, &mut buf) {
                    Ok(0) => {
                        child_gone = true;
                        break;
                    }
                    Ok(n) => {
                        if self.no_beep {
                            session.pending_output.extend(buf[..n].iter().copied().filter(|&b| b != 0x07));
                        } else {
                            session.pending_output.extend_from_slice(&buf[..n]);
                        }
                    }
                    Err(Errno::EAGAIN) => break,
                    Err(Errno::EIO) => {
                        // The slave side closed; this is the normal way
                        // a PTY reports "child exited" before SIGCHLD
                        // has necessarily been reaped yet.
                        child_gone = true;
                        break;
                    }
                    Err(e) => {
                        warn!(session = %self.key, "error reading pty master: {:?}", e);
                        child_gone = true;
                        break;
                    }
                }
            }
        }

        if ready.contains(Interest::WRITABLE) && !session.pending_input.is_empty() {
            match nix::unistd::write(self.fd, &session.pending_input) {
                Ok(n) => {
                    session.pending_input.drain(..n);
                }
                Err(Errno::EAGAIN) => {}
                Err(e) => warn!(session = %self.key, "error writing pty master: {:?}", e),
            }
        }

        if child_gone {
            session.done = true;
            info!(session = %self.key, "pty master reached eof");
            return Ok(Outcome::Done);
        }

        *events =
            if session.pending_input.is_empty() { Interest::READABLE } else { Interest::READABLE | Interest::WRITABLE };

        Ok(Outcome::Continue)
    }
}
