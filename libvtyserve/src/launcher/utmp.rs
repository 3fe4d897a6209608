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

//! Best-effort utmp/wtmp bookkeeping so `who` and `last` notice browser
//! sessions the same way they'd notice an SSH login. Nothing here is
//! load-bearing for the terminal session itself; a failure to update
//! either file is logged and otherwise ignored.

use std::{
    ffi::CString,
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    mem,
};

use tracing::warn;

const UTMP_PATH: &str = "/var/run/utmp";
const WTMP_PATH: &str = "/var/log/wtmp";

/// Mirrors the fields of glibc's `struct utmp` that vtyserve cares
/// about; the rest are zeroed. Field widths come from `<utmp.h>` (`ut_line`
/// and `ut_id` are 32/4 bytes respectively, `ut_user` and `ut_host` are
/// 32/256).
#[repr(C)]
struct UtmpRecord {
    ut_type: libc::c_short,
    ut_pid: libc::pid_t,
    ut_line: [libc::c_char; 32],
    ut_id: [libc::c_char; 4],
    ut_user: [libc::c_char; 32],
    ut_host: [libc::c_char; 256],
    ut_exit: [libc::c_int; 2],
    ut_session: libc::c_long,
    ut_tv: [libc::c_int; 2],
    ut_addr_v6: [libc::c_int; 4],
    unused: [libc::c_char; 20],
}

fn cfill(dst: &mut [libc::c_char], src: &str) {
    let bytes = src.as_bytes();
    let n = bytes.len().min(dst.len());
    for (i, b) in bytes[..n].iter().enumerate() {
        dst[i] = *b as libc::c_char;
    }
}

fn build_record(pid: i32, line: &str, user: &str, host: &str, logging_in: bool) -> UtmpRecord {
    let mut rec: UtmpRecord = unsafe { mem::zeroed() };
    rec.ut_type = if logging_in { 7 /* USER_PROCESS */ } else { 8 /* DEAD_PROCESS */ };
    rec.ut_pid = pid;
    cfill(&mut rec.ut_line, line);
    cfill(&mut rec.ut_id, &line[line.len().saturating_sub(4)..]);
    cfill(&mut rec.ut_user, user);
    cfill(&mut rec.ut_host, host);
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    rec.ut_tv = [now.as_secs() as libc::c_int, now.subsec_micros() as libc::c_int];
    rec
}

/// Append a login (or logout, when `logging_in` is false) record. Uses
/// a simple append-only write rather than the libc `updwtmp`/`pututline`
/// helpers, since those expect to run as the invoking process's own
/// session leader bookkeeping rather than being called once per browser
/// tab from a privileged helper.
pub fn record_login(pid: i32, line: &str, user: &str, host: &str, logging_in: bool) {
    let rec = build_record(pid, line, user, host, logging_in);
    let bytes = unsafe {
        std::slice::from_raw_parts((&rec as *const UtmpRecord) as *const u8, mem::size_of::<UtmpRecord>())
    };

    for path in [WTMP_PATH, UTMP_PATH] {
        if let Err(e) = append_record(path, bytes) {
            warn!("failed to update {}: {:?}", path, e);
        }
    }

    // Silence "unused" warning on a field kept only for layout fidelity
    // with glibc's struct utmp.
    let _ = CString::new(user);
}

fn append_record(path: &str, bytes: &[u8]) -> std::io::Result<()> {
    let mut f = OpenOptions::new().append(true).open(path)?;
    f.seek(SeekFrom::End(0))?;
    f.write_all(bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_layout_round_trips_short_fields() {
        let rec = build_record(1234, "pts/7", "alice", "10.0.0.5", true);
        assert_eq!(rec.ut_pid, 1234);
        assert_eq!(rec.ut_type, 7);
        let line: Vec<u8> = rec.ut_line.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
        assert_eq!(String::from_utf8(line).unwrap(), "pts/7");
    }
}
