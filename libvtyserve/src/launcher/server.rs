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

//! The privileged subprocess's main loop: read one `LaunchRequest` at a
//! time off the socketpair, fork a PTY-attached child per request, and
//! hand the master fd back to the main process. This process never
//! drops privileges itself (it's forked before the main process drops
//! its own), since it's the one thing in the tree that needs to be able
//! to become an arbitrary configured uid.

use std::{
    ffi::CString,
    io::{IoSlice, Read, Write},
    os::unix::{io::{AsRawFd, RawFd},  net::UnixStream},
};

use anyhow::Context;
use nix::{
    sys::socket::{self, ControlMessage, MsgFlags},
    unistd::{self, ForkResult},
};
use tracing::{error, info, warn};

use vtyserve_protocol::{LaunchPolicy, LaunchReply, LaunchRequest};

use crate::{
    config::{Cmd, Config, Cwd},
    launcher::{auth, utmp},
    tty,
    user,
};

/// Runs until the socket closes (the main process exited) or a fatal
/// setup error occurs. Never returns `Ok` in practice.
pub fn run(mut sock: UnixStream, config: std::rc::Rc<Config>) -> anyhow::Result<()> {
    let authenticator = auth::default_authenticator();

    // If this process wasn't started as root, it can never legitimately
    // become a different uid than the one it's already running as; note
    // that uid now so `handle_one` can refuse a mismatched request up
    // front rather than failing deep inside the forked child.
    let restricted_uid = if unistd::Uid::current().is_root() { None } else { Some(unistd::Uid::current().as_raw()) };

    loop {
        let req = match LaunchRequest::read_from(&mut sock) {
            Ok(req) => req,
            Err(e) => {
                info!("launcher socket closed ({:?}), exiting", e);
                return Ok(());
            }
        };

        let reply: anyhow::Result<()> = match handle_one(&req, &config, authenticator.as_ref(), restricted_uid) {
            Ok((pid, master_fd)) => {
                if let Err(e) = send_reply(&sock, LaunchReply::ok(pid), Some(master_fd)) {
                    error!("failed to send launch reply: {:?}", e);
                }
                // The launcher's copy of the master fd is no longer
                // needed once it has been passed to the main process.
                let _ = unistd::close(master_fd);
                continue;
            }
            Err(e) => {
                warn!("launch request failed: {:?}", e);
                Err(e)
            }
        };

        if reply.is_err() {
            if let Err(e) = send_reply(&sock, LaunchReply::error(), None) {
                error!("failed to send launch failure reply: {:?}", e);
            }
        }
    }
}

fn send_reply(sock: &UnixStream, reply: LaunchReply, fd: Option<RawFd>) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    reply.write_to(&mut buf)?;
    let iov = [IoSlice::new(&buf)];

    match fd {
        Some(fd) => {
            let fds = [fd];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            socket::sendmsg::<()>(sock.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                .context("sendmsg with pty fd")?;
        }
        None => {
            socket::sendmsg::<()>(sock.as_raw_fd(), &iov, &[], MsgFlags::empty(), None).context("sendmsg without fd")?;
        }
    }
    Ok(())
}

fn handle_one(
    req: &LaunchRequest,
    config: &Config,
    authenticator: &dyn auth::Authenticator,
    restricted_uid: Option<u32>,
) -> anyhow::Result<(i32, RawFd)> {
    let service = config
        .services
        .get(req.service as usize)
        .ok_or_else(|| anyhow::anyhow!("launch request named unknown service index {}", req.service))?;

    let (info, gid, cwd, argv) = match service.policy {
        LaunchPolicy::Login => {
            let info = user::info()?;
            let gid = info.gid;
            let home = info.home_dir.clone();
            (info, gid, home, vec!["/bin/login".to_string(), "-p".to_string(), "-h".to_string(), req.peer_name.clone()])
        }
        LaunchPolicy::Ssh => {
            let info = user::info()?;
            let gid = info.gid;
            let home = info.home_dir.clone();
            let host = service.ssh_host.clone().unwrap_or_else(|| "localhost".to_string());
            (info, gid, home, vec!["/usr/bin/ssh".to_string(), host])
        }
        LaunchPolicy::Auth => {
            // A real prompt would arrive as form fields on the session
            // POST; this path authenticates against whatever the
            // pluggable authenticator accepts with no credentials,
            // which is "nothing" without the pam feature.
            let uid = authenticator.authenticate("", "")?;
            let info = user::by_uid(uid)?;
            let gid = info.gid;
            let cwd = resolve_cwd(&service.cwd, &info.home_dir);
            let argv = resolve_cmd(&service.cmd, &info.default_shell);
            (info, gid, cwd, argv)
        }
        LaunchPolicy::UidGid => {
            let uid = service.uid.ok_or_else(|| anyhow::anyhow!("UidGid service missing uid"))?;
            let gid = service.gid.ok_or_else(|| anyhow::anyhow!("UidGid service missing gid"))?;
            let info = user::by_uid(uid)?;
            let cwd = resolve_cwd(&service.cwd, &info.home_dir);
            let argv = resolve_cmd(&service.cmd, &info.default_shell);
            (info, gid, cwd, argv)
        }
    };

    if let Some(restricted) = restricted_uid {
        if info.uid != restricted {
            anyhow::bail!("this launcher is running as uid {} and cannot start a session as uid {}", restricted, info.uid);
        }
    }

    let pty = tty::open_pty()?;
    let master_fd = pty.master.as_raw_fd();

    // Safety: fork() is unsafe because the child must avoid any
    // non-async-signal-safe calls before exec; everything on the child
    // branch below is either libc/nix primitives or `process::exit`.
    match unsafe { unistd::fork() }.context("forking launcher child")? {
        ForkResult::Parent { child } => {
            // Detach our reference to the slave so only the child's
            // open of the pty path keeps it alive; the master is what
            // travels back to the main process.
            Ok((child.as_raw(), dup_master(master_fd)?))
        }
        ForkResult::Child => {
            run_child(&pty.slave_path, &info, gid, &cwd, &argv, req);
            std::process::exit(127);
        }
    }
}

fn dup_master(fd: RawFd) -> anyhow::Result<RawFd> {
    unistd::dup(fd).context("duplicating pty master for handoff")
}

fn resolve_cwd(cwd: &Cwd, home: &str) -> String {
    match cwd {
        Cwd::Home => home.to_string(),
        Cwd::Absolute(p) => p.to_string_lossy().into_owned(),
    }
}

fn resolve_cmd(cmd: &Cmd, shell: &str) -> Vec<String> {
    match cmd {
        Cmd::Shell => vec![shell.to_string()],
        Cmd::Template(tmpl) => shell_words::split(tmpl).unwrap_or_else(|_| vec![tmpl.clone()]),
    }
}

/// Runs entirely inside the forked child: become the session leader on
/// the new PTY, drop to the target identity, and exec the configured
/// command. Never returns.
fn run_child(slave_path: &str, info: &user::Info, gid: u32, cwd: &str, argv: &[String], req: &LaunchRequest) -> ! {
    if unistd::setsid().is_err() {
        std::process::exit(1);
    }

    let slave = match tty::open_pty_slave(slave_path) {
        Ok(fd) => fd,
        Err(_) => std::process::exit(1),
    };
    let slave_fd = slave.as_raw_fd();
    if tty::configure_child_termios(slave_fd).is_err() {
        std::process::exit(1);
    }
    for stdio_fd in [0, 1, 2] {
        let _ = unistd::dup2(slave_fd, stdio_fd);
    }

    let size = tty::Size { rows: req.height, cols: req.width };
    let _ = size.set_fd(0);

    utmp::record_login(std::process::id() as i32, slave_path, &req.peer_name, &req.peer_name, true);

    // initgroups before dropping the primary gid/uid: it needs the
    // privilege we're about to give up to read /etc/group on the
    // target's behalf.
    let Ok(c_user) = CString::new(info.user.as_str()) else { std::process::exit(1) };
    if unistd::initgroups(&c_user, unistd::Gid::from_raw(gid)).is_err() {
        std::process::exit(1);
    }
    let target_gid = unistd::Gid::from_raw(gid);
    if unistd::setresgid(target_gid, target_gid, target_gid).is_err() {
        std::process::exit(1);
    }
    let target_uid = unistd::Uid::from_raw(info.uid);
    if unistd::setresuid(target_uid, target_uid, target_uid).is_err() {
        std::process::exit(1);
    }
    if unistd::chdir(cwd).is_err() {
        // Fall back to "/" rather than failing the whole session over a
        // missing home directory.
        let _ = unistd::chdir("/");
    }

    set_child_environment(info, req);

    let Some(prog) = argv.first() else { std::process::exit(1) };
    let Ok(c_prog) = CString::new(prog.as_str()) else { std::process::exit(1) };
    let c_args: Vec<CString> = argv.iter().filter_map(|a| CString::new(a.as_str()).ok()).collect();

    let _ = unistd::execvp(&c_prog, &c_args);
    std::process::exit(127);
}

/// Replaces the child's environment with the fixed tty-session set
/// (`TERM`, `HOME`, `SHELL`, `PATH`, `LOGNAME`, `USER`, and the reported
/// window size), passing through only `TZ`/`HZ` from whatever the
/// launcher itself inherited rather than the whole environment.
fn set_child_environment(info: &user::Info, req: &LaunchRequest) {
    let passthrough: Vec<(String, String)> =
        ["TZ", "HZ"].iter().filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v))).collect();

    for (k, _) in std::env::vars() {
        std::env::remove_var(k);
    }
    for (k, v) in passthrough {
        std::env::set_var(k, v);
    }

    std::env::set_var("TERM", "xterm");
    std::env::set_var("HOME", &info.home_dir);
    std::env::set_var("SHELL", &info.default_shell);
    std::env::set_var("PATH", "/usr/local/bin:/usr/bin:/bin:/usr/games");
    std::env::set_var("LOGNAME", &info.user);
    std::env::set_var("USER", &info.user);
    if req.width > 0 {
        std::env::set_var("COLUMNS", req.width.to_string());
    }
    if req.height > 0 {
        std::env::set_var("LINES", req.height.to_string());
    }
}
