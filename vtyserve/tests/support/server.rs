use std::{
    net::TcpStream,
    process::{Child, Command, Stdio},
    time,
};

use anyhow::Context;

use super::{pick_port, vtyserve_bin};

/// A running `vtyserve` subprocess, killed when it goes out of scope.
pub struct Proc {
    proc: Child,
    pub port: u16,
}

impl Proc {
    /// Spawns vtyserve with plain HTTP (no TLS) on a freshly picked
    /// port and blocks until the listener accepts connections or the
    /// retry budget is exhausted.
    pub fn new() -> anyhow::Result<Proc> {
        let port = pick_port();

        let proc = Command::new(vtyserve_bin())
            .arg("--port").arg(port.to_string())
            .arg("--localhost-only")
            .arg("--disable-ssl")
            .arg("--service").arg("/:LOGIN")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning vtyserve process")?;

        let mut sleep_dur = time::Duration::from_millis(10);
        let mut connected = false;
        for _ in 0..12 {
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                connected = true;
                break;
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }

        if !connected {
            anyhow::bail!("vtyserve never started listening on port {}", port);
        }

        Ok(Proc { proc, port })
    }

    pub fn connect(&self) -> anyhow::Result<TcpStream> {
        TcpStream::connect(("127.0.0.1", self.port)).context("connecting to vtyserve")
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if let Err(e) = self.proc.kill() {
            eprintln!("err killing vtyserve proc: {:?}", e);
        }
        let _ = self.proc.wait();
    }
}
