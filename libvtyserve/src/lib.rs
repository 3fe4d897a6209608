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

use std::{fs, io};

use anyhow::Context;
use clap::Parser;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

#[macro_use]
pub mod checks;
pub mod config;
pub mod consts;
mod daemonize;
pub mod event_loop;
pub mod http;
pub mod launcher;
pub mod server;
pub mod session;
mod signals;
pub mod trie;
mod tty;
mod user;

/// The command line surface the `vtyserve` binary exposes. Kept in the
/// library (rather than the thin binary crate) so alternate front ends
/// can construct an `Args` by hand instead of going through clap.
#[derive(Parser, Debug)]
#[clap(author, about, disable_version_flag = true)]
pub struct Args {
    #[clap(long, action, help = "Print the version and exit")]
    pub version: bool,

    #[clap(
        short = 'p',
        long,
        default_value_t = consts::DEFAULT_PORT,
        help = "TCP port to listen on"
    )]
    pub port: u16,

    #[clap(long, action, help = "Refuse connections from anywhere but 127.0.0.1/::1")]
    pub localhost_only: bool,

    #[clap(
        long,
        conflicts_with = "cert_fd",
        long_help = "Directory containing a PEM certificate bundle to serve TLS with.

A '%s' in the directory's configured hostname template is substituted with
the client's requested SNI hostname when multiple certificates are present."
    )]
    pub cert: Option<String>,

    #[clap(long, conflicts_with = "cert", help = "An already-open fd carrying a PEM certificate bundle")]
    pub cert_fd: Option<i32>,

    #[clap(long, action, help = "Never sniff for or negotiate TLS, serve plain HTTP only")]
    pub disable_ssl: bool,

    #[clap(long, action, help = "Serve TLS but omit the http/https toggle menu from the bootstrap page")]
    pub disable_ssl_menu: bool,

    #[clap(
        long,
        value_name = "MIN-MAX",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Run in one-shot CGI mode: read a single HTTP request from stdin,
bind an ephemeral port in the given range (or any free port if no range is
given), print its URL, and exit after the first session ends."
    )]
    pub cgi: Option<String>,

    #[clap(
        long,
        value_name = "PIDFILE",
        num_args = 0..=1,
        default_missing_value = "",
        long_help = "Fork into the background after startup checks pass.

An optional pidfile path may be given inline (--background=/run/vtyserve.pid);
otherwise --pidfile is used if present."
    )]
    pub background: Option<String>,

    #[clap(long, help = "Write the server's PID to this file")]
    pub pidfile: Option<String>,

    #[clap(long, help = "Drop privileges to this user (name or numeric uid) after binding")]
    pub user: Option<String>,

    #[clap(long, help = "Drop privileges to this group (name or numeric gid) after binding")]
    pub group: Option<String>,

    #[clap(long, action, help = "Treat --user/--group as numeric ids even if they parse as names")]
    pub numeric: bool,

    #[clap(long, action, help = "Strip ASCII BEL (0x07) from PTY output before it reaches the browser")]
    pub no_beep: bool,

    #[clap(long, default_value = "normal", help = "URL auto-linking aggressiveness: none, normal, aggressive")]
    pub linkify: String,

    #[clap(
        long = "service",
        action = clap::ArgAction::Append,
        long_help = "Mount a service at a path: /<path>:APP

APP is one of LOGIN, SSH[:host], AUTH:cwd:cmd, or uid:gid:cwd:cmd. May be
given multiple times; defaults to a single `/:LOGIN` service if omitted."
    )]
    pub service: Vec<String>,

    #[clap(
        long = "static-file",
        action = clap::ArgAction::Append,
        help = "Serve FILE's bytes verbatim at URL, e.g. --static-file=/favicon.ico:./favicon.ico"
    )]
    pub static_file: Vec<String>,

    #[clap(long, help = "Replace the bundled stylesheet with FILE's contents")]
    pub css: Option<String>,

    #[clap(long = "user-css", help = "Offer an additional named, user-selectable stylesheet: NAME:FILE")]
    pub user_css: Option<String>,

    #[clap(long, action, help = "Use a config file in addition to/instead of flags")]
    pub config_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times"
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "Only log errors")]
    pub quiet: bool,

    #[clap(long, action, help = "A file to write logs to instead of stderr")]
    pub log_file: Option<String>,
}

/// Run vtyserve with the given already-parsed arguments. Split out from
/// `main` so the thin binary crate stays a few lines of glue.
pub fn run(args: Args) -> anyhow::Result<()> {
    if args.version {
        println!("vtyserve {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let trace_level = if args.quiet {
        tracing::Level::ERROR
    } else if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };

    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(&log_file)
            .with_context(|| format!("opening log file {}", log_file))?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(false)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(false)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let cfg = config::Config::from_args(&args).context("assembling configuration")?;

    if let Some(pidfile_spec) = &args.background {
        let pidfile = if !pidfile_spec.is_empty() {
            Some(pidfile_spec.clone())
        } else {
            args.pidfile.clone()
        };
        daemonize::maybe_fork_daemon(pidfile.as_deref())?;
    }

    if let Some(pidfile) = &cfg.pidfile {
        fs::write(pidfile, format!("{}\n", std::process::id()))
            .with_context(|| format!("writing pidfile {}", pidfile))?;
    }

    let res = server::run(cfg);

    if let Err(err) = &res {
        error!("{:?}", err);
    }
    res
}

impl Args {
    /// Used by tests and by `run` to bail out before any logging/socket
    /// setup when the user only asked for the version string.
    pub fn wants_version(&self) -> bool {
        self.version
    }
}
