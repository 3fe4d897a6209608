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

//! PTY allocation and window-size plumbing used by the launcher when it
//! spins up a child under a service, and by the dispatcher whenever the
//! browser reports a resize.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use anyhow::Context;
use nix::{
    fcntl::{open, OFlag},
    pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster},
    sys::{
        stat::Mode,
        termios::{self, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags, SpecialCharacterIndices},
    },
};
use serde_derive::{Deserialize, Serialize};

// see `man ioctl_tty` for info on these ioctl commands
nix::ioctl_read_bad!(tiocgwinsz, libc::TIOCGWINSZ, libc::winsize);
nix::ioctl_write_ptr_bad!(tiocswinsz, libc::TIOCSWINSZ, libc::winsize);

#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub rows: u16,
    pub cols: u16,
}

impl Size {
    /// from_fd returns the terminal size for the given terminal.
    pub fn from_fd(fd: RawFd) -> anyhow::Result<Size> {
        let mut term_size = libc::winsize { ws_row: 0, ws_col: 0, ws_xpixel: 0, ws_ypixel: 0 };

        // Safety: term_size is stack allocated and lives for the whole call.
        unsafe {
            tiocgwinsz(fd, &mut term_size).context("fetching term size")?;
        }

        Ok(Size { rows: term_size.ws_row, cols: term_size.ws_col })
    }

    /// set_fd sets the tty indicated by the given file descriptor
    /// to have this size.
    pub fn set_fd(&self, fd: RawFd) -> anyhow::Result<()> {
        let term_size =
            libc::winsize { ws_row: self.rows, ws_col: self.cols, ws_xpixel: 0, ws_ypixel: 0 };

        unsafe {
            tiocswinsz(fd, &term_size).context("setting term size")?;
        }

        Ok(())
    }
}

/// Configures the slave side of a freshly opened PTY with the historical
/// tty defaults (`TTYDEF_IFLAG`/`_OFLAG`/`_LFLAG`, 8-bit `CS8`, erase key
/// `^?`/0x7F, 38400 baud) rather than whatever the master happened to
/// inherit, since nothing else initializes the slave before a child
/// shell attaches to it as its controlling terminal.
pub fn configure_child_termios(fd: RawFd) -> anyhow::Result<()> {
    let mut term = termios::tcgetattr(fd).context("grabbing term flags for child pty")?;

    term.input_flags = (InputFlags::BRKINT | InputFlags::ICRNL | InputFlags::IMAXBEL | InputFlags::IXON | InputFlags::IXANY)
        & !InputFlags::ISTRIP;
    term.output_flags = OutputFlags::OPOST | OutputFlags::ONLCR;
    term.local_flags = LocalFlags::ECHO
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN
        | LocalFlags::ECHOE
        | LocalFlags::ECHOKE
        | LocalFlags::ECHOCTL;
    term.control_flags = (term.control_flags & !ControlFlags::CSIZE) | ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::HUPCL;
    term.control_chars[SpecialCharacterIndices::VERASE as usize] = 0x7f;

    termios::cfsetispeed(&mut term, BaudRate::B38400).context("setting input baud rate")?;
    termios::cfsetospeed(&mut term, BaudRate::B38400).context("setting output baud rate")?;

    termios::tcsetattr(fd, termios::SetArg::TCSANOW, &term).context("applying child pty termios")?;
    Ok(())
}

/// A newly allocated pseudo-terminal pair: the master the event loop
/// polls and the slave path the launcher hands to the child as its
/// controlling terminal.
pub struct Pty {
    pub master: PtyMaster,
    pub slave_path: String,
}

/// Allocate a fresh PTY master/slave pair, unlocked and ready for a
/// child process to open the slave side. The master is opened
/// non-blocking since it ends up registered in the event loop; the
/// O_NONBLOCK file status flag travels with the descriptor across the
/// SCM_RIGHTS handoff to the main process, so there's no need to set it
/// again on the receiving end.
pub fn open_pty() -> anyhow::Result<Pty> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK).context("posix_openpt")?;
    grantpt(&master).context("grantpt")?;
    unlockpt(&master).context("unlockpt")?;
    let slave_path = ptsname_r(&master).context("ptsname_r")?;
    Ok(Pty { master, slave_path })
}

/// Open the slave half of an already-allocated PTY, to be called from
/// the launcher's child after `fork` and `setsid`.
pub fn open_pty_slave(path: &str) -> anyhow::Result<OwnedFd> {
    let fd = open(path, OFlag::O_RDWR, Mode::empty()).with_context(|| format!("opening pty slave {}", path))?;
    // Safety: `open` returned a freshly opened, uniquely owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn size_round_trips_through_a_pty() {
        let pty = open_pty().expect("allocate pty");
        let want = Size { rows: 40, cols: 100 };
        want.set_fd(pty.master.as_raw_fd()).expect("set size");
        let got = Size::from_fd(pty.master.as_raw_fd()).expect("get size");
        assert_eq!(want, got);
    }

    #[test]
    fn configure_child_termios_sets_erase_and_8_bit_chars() {
        let pty = open_pty().expect("allocate pty");
        let slave = open_pty_slave(&pty.slave_path).expect("open slave");
        configure_child_termios(slave.as_raw_fd()).expect("configure termios");

        let term = termios::tcgetattr(slave.as_raw_fd()).expect("read back termios");
        assert_eq!(term.control_chars[SpecialCharacterIndices::VERASE as usize], 0x7f);
        assert!(term.control_flags.contains(ControlFlags::CS8));
        assert!(!term.input_flags.contains(InputFlags::ISTRIP));
    }
}
