// Copyright 2023 Google LLC
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

//! A non-blocking, single-threaded, multiplexed reactor. Every socket and
//! PTY master the server touches is registered here; `run` is the only
//! place that blocks, and it blocks in `poll(2)`, never in a read or
//! write on a registered descriptor.
//!
//! Descriptor storage is a flat `Vec<Slot>` rather than a `HashMap`, so
//! that dispatch is a single linear scan with no hashing: the number of
//! simultaneously open connections on a box like this is small enough
//! that the scan is cheap, and a stable, generation-checked index
//! (`ConnId`) lets long-lived owners (a `Session` holding on to its PTY
//! connection) detect whether the slot they remember has since been
//! recycled.

use std::{
    cell::{Cell, RefCell},
    net::{TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
    time::{Duration, Instant},
};

use anyhow::Context;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
};
use tracing::{error, info, instrument, warn};

use crate::check;

/// A tiny hand-rolled bitmask rather than pulling in a crate for two
/// flags: readability and writability interest on a registered
/// descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    bits0: u8,
}

impl Interest {
    pub const READABLE: Interest = Interest { bits0: 0b01 };
    pub const WRITABLE: Interest = Interest { bits0: 0b10 };

    pub const fn empty() -> Self {
        Interest { bits0: 0 }
    }

    pub const fn bits(self) -> u8 {
        self.bits0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.bits0 & other.bits0 == other.bits0
    }

    pub fn is_empty(self) -> bool {
        self.bits0 == 0
    }
}

impl std::ops::BitOr for Interest {
    type Output = Interest;
    fn bitor(self, rhs: Interest) -> Interest {
        Interest { bits0: self.bits0 | rhs.bits0 }
    }
}

impl std::ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.bits0 |= rhs.bits0;
    }
}

/// What a handler wants to happen to its connection after `handle`
/// returns.
pub enum Outcome {
    /// Keep the connection registered, possibly with an updated
    /// interest mask (set via `EventLoop::set_events` from inside the
    /// callback).
    Continue,
    /// Keep the connection registered and (re)arm its deadline to fire
    /// `after` from now. A handler that has no pending I/O to wait on
    /// but still needs to be revisited later (a suspended long-poll
    /// request checking for new output, a connection resetting its idle
    /// timeout after handling a request) returns this instead of
    /// `Continue` plus a separate call the handler has no way to make
    /// from inside `handle`.
    ContinueWithTimeout(Duration),
    /// Drop the connection: run its destructor and compact its slot out
    /// on the next pass.
    Done,
}

/// Implemented once per concrete connection kind (`HttpConnection`, the
/// launcher reply socket, a PTY reader). `ready` is empty when the
/// invocation is due to the descriptor's deadline expiring rather than
/// I/O readiness.
pub trait ConnHandler {
    fn fd(&self) -> RawFd;
    fn handle(&mut self, events: &mut Interest, ready: Interest) -> anyhow::Result<Outcome>;
}

/// A stable handle to a registered connection. `generation` lets
/// `get_connection` detect a slot that has since been recycled for an
/// unrelated descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: usize,
    generation: u64,
}

struct Slot {
    handler: Option<Box<dyn ConnHandler>>,
    fd: RawFd,
    interest: Interest,
    deadline: Option<Instant>,
    generation: u64,
    deleted: bool,
    occupied: bool,
}

impl Slot {
    fn empty() -> Self {
        Slot {
            handler: None,
            fd: -1,
            interest: Interest::READABLE,
            deadline: None,
            generation: 0,
            deleted: false,
            occupied: false,
        }
    }
}

/// Lets code running inside a `ConnHandler::handle` callback register a
/// brand new connection (e.g. a PTY master opened as a side effect of
/// handling an HTTP request) without needing a `&mut EventLoop` of its
/// own, which `handle`'s signature doesn't provide. Registration is
/// deferred: handlers queued here are added to the reactor at the start
/// of the next loop iteration, never synchronously from inside `handle`.
#[derive(Clone)]
pub struct Spawner {
    queue: Rc<RefCell<Vec<Box<dyn ConnHandler>>>>,
    exit_requested: Rc<Cell<bool>>,
}

impl Spawner {
    pub fn spawn(&self, handler: Box<dyn ConnHandler>) {
        self.queue.borrow_mut().push(handler);
    }

    /// Requests that the reactor unwind every nested `run()` level at
    /// the start of its next iteration, equivalent to `EventLoop::exit
    /// (true)` called from inside `handle`, which the callback has no
    /// way to do directly.
    pub fn request_exit(&self) {
        self.exit_requested.set(true);
    }
}

pub struct EventLoop {
    slots: Vec<Slot>,
    free: Vec<usize>,
    exit_levels: usize,
    /// An idle deadline applied on top of any per-connection deadline so
    /// `poll` doesn't block forever with zero registered connections.
    idle_poll: Duration,
    pending: Rc<RefCell<Vec<Box<dyn ConnHandler>>>>,
    exit_requested: Rc<Cell<bool>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        EventLoop {
            slots: Vec::new(),
            free: Vec::new(),
            exit_levels: 0,
            idle_poll: Duration::from_secs(1),
            pending: Rc::new(RefCell::new(Vec::new())),
            exit_requested: Rc::new(Cell::new(false)),
        }
    }

    /// A cheap, cloneable handle that lets a connection handler register
    /// new connections, or request the whole reactor unwind, without
    /// borrowing the loop itself.
    pub fn spawner(&self) -> Spawner {
        Spawner { queue: self.pending.clone(), exit_requested: self.exit_requested.clone() }
    }

    /// Register a descriptor with initial interest READABLE.
    pub fn register(&mut self, handler: Box<dyn ConnHandler>) -> ConnId {
        let fd = handler.fd();
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::empty());
                self.slots.len() - 1
            }
        };
        let generation = self.slots[index].generation.wrapping_add(1);
        self.slots[index] = Slot {
            handler: Some(handler),
            fd,
            interest: Interest::READABLE,
            deadline: None,
            generation,
            deleted: false,
            occupied: true,
        };
        ConnId { index, generation }
    }

    fn resolve(&self, id: ConnId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        if slot.occupied && !slot.deleted && slot.generation == id.generation {
            Some(id.index)
        } else {
            None
        }
    }

    /// Replace the interest mask for a connection, returning the prior
    /// mask. Panics (via `check!`) if the handle is stale; callers own
    /// their own `ConnId` for the lifetime of their registration so a
    /// stale handle here is a programming error, not a runtime event.
    pub fn set_events(&mut self, id: ConnId, events: Interest) -> Interest {
        let idx = self.resolve(id);
        check!(idx.is_some(), "set_events on a stale or unknown connection handle");
        let idx = idx.unwrap();
        let prior = self.slots[idx].interest;
        self.slots[idx].interest = events;
        prior
    }

    /// `seconds == 0` disables the timeout. Negative values are a
    /// programming error, not a runtime event we want to recover from
    /// gracefully, so they are rejected loudly.
    pub fn set_timeout(&mut self, id: ConnId, seconds: i64) {
        check!(seconds >= 0, "set_timeout called with a negative duration");
        let idx = self.resolve(id);
        check!(idx.is_some(), "set_timeout on a stale or unknown connection handle");
        let idx = idx.unwrap();
        self.slots[idx].deadline =
            if seconds == 0 { None } else { Some(Instant::now() + Duration::from_secs(seconds as u64)) };
    }

    /// Returns `<0` if the deadline has already passed, `0` if unset,
    /// `>0` seconds remaining.
    pub fn get_timeout(&self, id: ConnId) -> i64 {
        let Some(idx) = self.resolve(id) else { return -1 };
        match self.slots[idx].deadline {
            None => 0,
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    -1
                } else {
                    (deadline - now).as_secs() as i64 + 1
                }
            }
        }
    }

    /// Validate a (possibly stale) handle, falling back to scanning by
    /// raw fd. Used by callers that held on to a `ConnId` across a
    /// compaction boundary and need to reacquire the current slot.
    pub fn get_connection(&self, hint: Option<ConnId>, fd: RawFd) -> Option<ConnId> {
        if let Some(hint) = hint {
            if let Some(idx) = self.resolve(hint) {
                if self.slots[idx].fd == fd {
                    return Some(hint);
                }
            }
        }
        self.slots
            .iter()
            .enumerate()
            .find(|(_, s)| s.occupied && !s.deleted && s.fd == fd)
            .map(|(index, s)| ConnId { index, generation: s.generation })
    }

    /// Mark a connection for removal; it is dropped (destructor run via
    /// `Drop`) and compacted out at the end of the current iteration.
    pub fn close(&mut self, id: ConnId) {
        if let Some(idx) = self.resolve(id) {
            self.slots[idx].deleted = true;
        }
    }

    /// Pop one level of nested `run()`. `exit(true)` unwinds every
    /// level at once.
    pub fn exit(&mut self, all: bool) {
        if all {
            self.exit_levels = 0;
        } else if self.exit_levels > 0 {
            self.exit_levels -= 1;
        }
    }

    /// Accept new TCP connections on `listener`, handing each to
    /// `on_accept` to build its handler, and run the reactor until
    /// `exit` unwinds this nesting level.
    #[instrument(skip_all)]
    pub fn run(
        &mut self,
        listener: Option<&TcpListener>,
        mut on_accept: impl FnMut(&mut EventLoop, TcpStream) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        self.exit_levels += 1;
        let my_level = self.exit_levels;

        while self.exit_levels >= my_level {
            let wait = self.next_wait();

            let mut pollfds: Vec<PollFd> = Vec::with_capacity(self.slots.len() + 1);
            // SAFETY: the BorrowedFd values created here are only used for
            // the duration of this `poll` call; the underlying descriptors
            // outlive it because they are owned by `self.slots`/`listener`.
            let listener_fd = listener.map(|l| l.as_raw_fd());
            if let Some(fd) = listener_fd {
                pollfds.push(PollFd::new(fd, PollFlags::POLLIN));
            }
            let mut slot_order: Vec<usize> = Vec::with_capacity(self.slots.len());
            for (i, s) in self.slots.iter().enumerate() {
                if !s.occupied || s.deleted {
                    continue;
                }
                if s.interest.is_empty() && s.deadline.is_none() {
                    // Nothing to wake this one up for; skip it entirely
                    // (DESIGN NOTES: idle descriptors move to the tail).
                    continue;
                }
                let mut flags = PollFlags::empty();
                if s.interest.contains(Interest::READABLE) {
                    flags |= PollFlags::POLLIN;
                }
                if s.interest.contains(Interest::WRITABLE) {
                    flags |= PollFlags::POLLOUT;
                }
                pollfds.push(PollFd::new(s.fd, flags));
                slot_order.push(i);
            }

            let nready = loop {
                match poll(&mut pollfds, wait as libc::c_int) {
                    Ok(n) => break n,
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e).context("polling registered descriptors"),
                }
            };

            let listener_ready = listener_fd.is_some()
                && pollfds[0].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false);
            if listener_ready {
                if let Some(l) = listener {
                    match l.accept() {
                        Ok((stream, _addr)) => {
                            stream.set_nonblocking(true).context("setting accepted socket nonblocking")?;
                            on_accept(self, stream)?;
                        }
                        Err(e) => warn!("accept failed: {:?}", e),
                    }
                }
            }

            let poll_offset = if listener_fd.is_some() { 1 } else { 0 };
            let now = Instant::now();
            for (order_idx, &slot_idx) in slot_order.iter().enumerate() {
                if self.slots[slot_idx].deleted || !self.slots[slot_idx].occupied {
                    continue;
                }
                let revents = pollfds[order_idx + poll_offset].revents().unwrap_or(PollFlags::empty());
                let ready = Interest {
                    bits0: {
                        let mut b = 0u8;
                        if revents.intersects(
                            PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR,
                        ) {
                            b |= Interest::READABLE.bits();
                        }
                        if revents.contains(PollFlags::POLLOUT) {
                            b |= Interest::WRITABLE.bits();
                        }
                        b
                    },
                };
                let timed_out =
                    self.slots[slot_idx].deadline.map(|d| d <= now).unwrap_or(false) && ready.is_empty();
                if ready.is_empty() && !timed_out {
                    continue;
                }
                if nready == 0 && !timed_out {
                    continue;
                }

                self.dispatch_one(slot_idx, ready);
            }

            self.compact();

            let spawned: Vec<Box<dyn ConnHandler>> = self.pending.borrow_mut().drain(..).collect();
            for handler in spawned {
                self.register(handler);
            }

            if self.exit_requested.take() {
                self.exit(true);
                continue;
            }

            if nready == 0 && self.slots.is_empty() && listener.is_none() {
                // CGI mode with no session yet and nothing to accept: keep
                // spinning on the idle deadline, we'll get a connection
                // eventually or the process will be signaled.
                continue;
            }
        }

        Ok(())
    }

    fn dispatch_one(&mut self, slot_idx: usize, ready: Interest) {
        let mut events = self.slots[slot_idx].interest;
        let mut handler = match self.slots[slot_idx].handler.take() {
            Some(h) => h,
            None => return,
        };
        let outcome = handler.handle(&mut events, ready);
        if self.slots[slot_idx].occupied {
            self.slots[slot_idx].interest = events;
            self.slots[slot_idx].handler = Some(handler);
            match outcome {
                Ok(Outcome::Continue) => {}
                Ok(Outcome::ContinueWithTimeout(after)) => {
                    self.slots[slot_idx].deadline = Some(Instant::now() + after);
                }
                Ok(Outcome::Done) => {
                    self.slots[slot_idx].deleted = true;
                }
                Err(e) => {
                    error!("connection handler error, closing: {:?}", e);
                    self.slots[slot_idx].deleted = true;
                }
            }
        }
    }

    fn next_wait(&self) -> u16 {
        let now = Instant::now();
        let mut min: Option<Duration> = Some(self.idle_poll);
        for s in &self.slots {
            if !s.occupied || s.deleted {
                continue;
            }
            if let Some(deadline) = s.deadline {
                let remaining = deadline.saturating_duration_since(now);
                min = Some(min.map(|m| m.min(remaining)).unwrap_or(remaining));
            }
        }
        min.unwrap_or(self.idle_poll).as_millis().min(u16::MAX as u128) as u16
    }

    /// Compact deleted slots out so dead entries stop taking up a poll
    /// array position. The handler (and its `Drop` impl) runs here.
    fn compact(&mut self) {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.deleted && s.occupied {
                info!("closing connection fd={}", s.fd);
                s.handler = None;
                s.occupied = false;
                s.deleted = false;
                self.free.push(i);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied && !s.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Counter {
        fd: RawFd,
        calls: Arc<Mutex<Vec<Interest>>>,
        done_after: usize,
    }

    impl ConnHandler for Counter {
        fn fd(&self) -> RawFd {
            self.fd
        }
        fn handle(&mut self, _events: &mut Interest, ready: Interest) -> anyhow::Result<Outcome> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(ready);
            if calls.len() >= self.done_after {
                Ok(Outcome::Done)
            } else {
                Ok(Outcome::Continue)
            }
        }
    }

    #[test]
    fn timeout_fires_once_then_compacts() {
        let mut ev = EventLoop::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        // A closed pipe read end: always readable (EOF), so this drives
        // the dispatch loop deterministically without real timers.
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        drop(_w);
        let id = ev.register(Box::new(Counter { fd: r.as_raw_fd(), calls: calls.clone(), done_after: 1 }));
        ev.set_timeout(id, 0);

        let mut saw_accept = false;
        ev.run(None, |_ev, _s| {
            saw_accept = true;
            Ok(())
        })
        .expect("run");

        assert!(!saw_accept);
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(ev.len(), 0);
    }

    struct ExitRequester {
        fd: RawFd,
        spawner_exit: Spawner,
    }

    impl ConnHandler for ExitRequester {
        fn fd(&self) -> RawFd {
            self.fd
        }
        fn handle(&mut self, _events: &mut Interest, _ready: Interest) -> anyhow::Result<Outcome> {
            self.spawner_exit.request_exit();
            Ok(Outcome::Continue)
        }
    }

    #[test]
    fn request_exit_unwinds_the_loop() {
        let mut ev = EventLoop::new();
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        let spawner = ev.spawner();
        ev.register(Box::new(ExitRequester { fd: r.as_raw_fd(), spawner_exit: spawner }));

        ev.run(None, |_ev, _s| Ok(())).expect("run");

        // The handler is still registered (it never returned Done); the
        // loop only unwound because of the exit request.
        assert_eq!(ev.len(), 1);
    }

    #[test]
    fn stale_handle_is_rejected_by_get_connection() {
        let mut ev = EventLoop::new();
        let (r, _w) = nix::unistd::pipe().expect("pipe");
        let fd = r.as_raw_fd();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let id = ev.register(Box::new(Counter { fd, calls, done_after: 1 }));
        ev.close(id);
        ev.compact();
        assert!(ev.get_connection(Some(id), fd).is_none());
        drop(_w);
    }
}
