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

//! `--background` support. There is no long-running control socket to
//! dial readiness against the way there is in a session-pool daemon, so
//! "backgrounding" here is a plain self-relaunch: re-exec the current
//! binary with a sentinel env var, let the child detach from the
//! controlling terminal with `setsid`, and have the original process
//! exit once the child is spawned.

use std::{env, process};

use anyhow::Context;
use nix::unistd::setsid;
use tracing::info;

use crate::consts::BACKGROUND_SENTINEL_VAR;

/// Called once at startup. If this process hasn't already been
/// relaunched into the background, re-exec itself with the sentinel set
/// and exit; otherwise detach from the controlling terminal and
/// continue. `pidfile` is forwarded unchanged to the relaunched process
/// via `--pidfile` so it still gets written from the process that ends
/// up actually running the server.
pub fn maybe_fork_daemon(pidfile: Option<&str>) -> anyhow::Result<()> {
    if env::var(BACKGROUND_SENTINEL_VAR).is_ok() {
        // setsid fails with EPERM if we're already a process group
        // leader, which is harmless here: we're already detached.
        if let Err(e) = setsid() {
            if e != nix::errno::Errno::EPERM {
                return Err(e).context("detaching from controlling terminal");
            }
        }
        return Ok(());
    }

    let exe = env::current_exe().context("resolving our own executable path for self-relaunch")?;
    let mut args: Vec<String> = env::args().skip(1).collect();
    if let Some(pidfile) = pidfile {
        if !args.iter().any(|a| a == "--pidfile") {
            args.push("--pidfile".to_string());
            args.push(pidfile.to_string());
        }
    }

    info!("relaunching into the background");
    process::Command::new(exe)
        .args(&args)
        .env(BACKGROUND_SENTINEL_VAR, "1")
        .stdin(process::Stdio::null())
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::null())
        .spawn()
        .context("relaunching into the background")?;

    process::exit(0);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sentinel_path_detaches_without_relaunching() {
        env::set_var(BACKGROUND_SENTINEL_VAR, "1");
        let result = maybe_fork_daemon(None);
        env::remove_var(BACKGROUND_SENTINEL_VAR);
        assert!(result.is_ok());
    }
}
