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

//! Top-level wiring: fork the privileged launcher, bind the listening
//! socket, drop privileges if asked to, and hand everything to the
//! event loop. This is the one module that is allowed to know about
//! every other piece of the server at once; everything downstream of
//! here only sees the slice it needs.

use std::{
    cell::RefCell,
    net::TcpListener,
    os::{fd::AsRawFd, unix::net::UnixStream},
    rc::Rc,
};

use anyhow::Context;
use nix::{
    sys::{
        signal::{self, SigHandler, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::ForkResult,
};
use tracing::{info, warn};

use crate::{
    config::Config,
    event_loop::{ConnHandler, EventLoop, Interest, Outcome},
    http::{tls::RustlsEngine, HttpConnection},
    launcher::{self, LauncherClient},
    session::dispatcher::Dispatcher,
    signals::SignalPipe,
    user,
};

pub fn run(config: Config) -> anyhow::Result<()> {
    let config = Rc::new(config);

    let launcher_client = spawn_launcher(&config)?;

    if let Some(group) = &config.group {
        let gid = user::resolve_group(group, config.numeric)?;
        nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).context("dropping to configured group")?;
    }
    if let Some(user_spec) = &config.user {
        let info = user::resolve_user(user_spec, config.numeric)?;
        nix::unistd::setuid(nix::unistd::Uid::from_raw(info.uid)).context("dropping to configured user")?;
    }

    let tls_config = match &config.tls {
        Some(tls_cfg) => {
            let dir = tls_cfg
                .cert_dir
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--cert-fd is accepted but not yet backed by a loader"))?;
            Some(crate::http::tls::load_server_config(&dir)?)
        }
        None => None,
    };

    let bind_addr = if config.localhost_only { "127.0.0.1" } else { "0.0.0.0" };
    let listener = TcpListener::bind((bind_addr, config.port)).with_context(|| format!("binding {}:{}", bind_addr, config.port))?;
    listener.set_nonblocking(true).context("setting listener nonblocking")?;
    info!(port = config.port, "listening");

    let mut event_loop = EventLoop::new();

    let dispatcher = Rc::new(RefCell::new(Dispatcher::new(config.clone(), launcher_client, event_loop.spawner())));
    dispatcher.borrow_mut().set_self_handle(dispatcher.clone());

    // SIGPIPE is ignored outright rather than routed through the self
    // pipe: a write to a socket the peer has closed should surface as
    // an ordinary `EPIPE` I/O error on that connection, not tear down
    // the whole process.
    // Safety: installing a trivial SIG_IGN disposition has no
    // preconditions beyond "called before any thread depends on the
    // default SIGPIPE behavior," which is true this early in startup.
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }.context("ignoring SIGPIPE")?;

    let term_pipe = SignalPipe::install(&[Signal::SIGTERM, Signal::SIGINT]).context("installing termination signal handlers")?;
    let chld_pipe = SignalPipe::install(&[Signal::SIGCHLD]).context("installing SIGCHLD handler")?;

    event_loop.register(Box::new(TerminationSignalHandler { pipe: term_pipe }));
    event_loop.register(Box::new(ReapSignalHandler { pipe: chld_pipe, dispatcher: dispatcher.clone() }));

    event_loop.run(Some(&listener), {
        let dispatcher = dispatcher.clone();
        let tls_config = tls_config.clone();
        move |ev, stream| {
            let tls_engine = match &tls_config {
                Some(cfg) => Some(Box::new(RustlsEngine::new(cfg.clone())?) as Box<dyn crate::http::tls::TlsEngine>),
                None => None,
            };
            let conn = HttpConnection::new(stream, tls_engine, dispatcher.clone());
            let id = ev.register(Box::new(conn));
            ev.set_timeout(id, crate::consts::CONN_TIMEOUT.as_secs() as i64);
            Ok(())
        }
    })?;

    Ok(())
}

/// Forks the privileged launcher subprocess over a freshly created
/// socketpair and returns the main process's end wrapped for the
/// dispatcher's use. Must run before any privilege drop below.
fn spawn_launcher(config: &Rc<Config>) -> anyhow::Result<Option<LauncherClient>> {
    if !nix::unistd::Uid::current().is_root() && config.user.is_some() {
        warn!("--user given but process is not running as root; privilege drop will likely fail");
    }

    let (main_end, launcher_end) = UnixStream::pair().context("creating launcher socketpair")?;

    // Safety: the child branch below only calls async-signal-safe nix
    // wrappers and `process::exit`, same discipline as the launcher's
    // own per-request fork.
    match unsafe { nix::unistd::fork() }.context("forking launcher subprocess")? {
        ForkResult::Parent { child: _ } => {
            drop(launcher_end);
            main_end.set_nonblocking(false).context("launcher client socket blocking mode")?;
            Ok(Some(LauncherClient::new(main_end)))
        }
        ForkResult::Child => {
            drop(main_end);
            match launcher::server::run(launcher_end, config.clone()) {
                Ok(()) => std::process::exit(0),
                Err(e) => {
                    eprintln!("launcher subprocess exiting on error: {:?}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

/// `SIGTERM`/`SIGINT` terminate the process. There is no drain-in-flight
/// grace period: this is a single-threaded server with no persistent
/// state beyond the optional pidfile, so an immediate exit is the
/// simplest correct behavior and matches how the rest of the corpus
/// this grew out of treats a plain (non-attach) termination request.
struct TerminationSignalHandler {
    pipe: SignalPipe,
}

impl ConnHandler for TerminationSignalHandler {
    fn fd(&self) -> std::os::fd::RawFd {
        self.pipe.as_raw_fd()
    }

    fn handle(&mut self, _events: &mut Interest, _ready: Interest) -> anyhow::Result<Outcome> {
        self.pipe.drain();
        info!("received a shutdown signal, exiting");
        std::process::exit(0);
    }
}

/// `SIGCHLD` reaps every exited launcher-spawned child non-blockingly
/// and marks the matching session done so its final output can drain
/// to a bound poll before the session enters the graveyard.
struct ReapSignalHandler {
    pipe: SignalPipe,
    dispatcher: Rc<RefCell<Dispatcher>>,
}

impl ConnHandler for ReapSignalHandler {
    fn fd(&self) -> std::os::fd::RawFd {
        self.pipe.as_raw_fd()
    }

    fn handle(&mut self, _events: &mut Interest, _ready: Interest) -> anyhow::Result<Outcome> {
        self.pipe.drain();

        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.dispatcher.borrow_mut().registry.mark_done_by_pid(pid.as_raw());
                }
                Ok(WaitStatus::StillAlive) => break,
                Err(nix::errno::Errno::ECHILD) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }

        Ok(Outcome::Continue)
    }
}
