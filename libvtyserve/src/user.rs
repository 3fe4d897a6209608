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

//! passwd/group lookups. The launcher needs to resolve an arbitrary
//! target identity (the `--user`/`--group` flags, or the uid:gid pair
//! embedded directly in a `uid:gid:cwd:cmd` service spec), not just
//! introspect the identity the server process itself is running as.

use std::{ffi::CStr, io, ptr};

use anyhow::anyhow;

#[derive(Debug, Clone)]
pub struct Info {
    pub uid: u32,
    pub gid: u32,
    pub default_shell: String,
    pub home_dir: String,
    pub user: String,
}

/// The identity the server process itself is running as.
pub fn info() -> anyhow::Result<Info> {
    by_uid(unsafe { libc::getuid() })
}

pub fn by_uid(uid: libc::uid_t) -> anyhow::Result<Info> {
    let mut buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    let mut passwd = empty_passwd();
    let mut res: *mut libc::passwd = ptr::null_mut();

    // Safety: `passwd` and `buf` are stack-allocated and outlive the call.
    let errno = unsafe {
        libc::getpwuid_r(uid, &mut passwd, buf.as_mut_ptr(), buf.len(), &mut res as *mut *mut libc::passwd)
    };
    finish(res, errno, &passwd, uid)
}

pub fn by_name(name: &str) -> anyhow::Result<Info> {
    let cname = std::ffi::CString::new(name).map_err(|_| anyhow!("user name '{}' contains a NUL", name))?;
    let mut buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    let mut passwd = empty_passwd();
    let mut res: *mut libc::passwd = ptr::null_mut();

    // Safety: `passwd` and `buf` are stack-allocated and outlive the call.
    let errno = unsafe {
        libc::getpwnam_r(
            cname.as_ptr(),
            &mut passwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut res as *mut *mut libc::passwd,
        )
    };
    if res.is_null() && errno == 0 {
        return Err(anyhow!("no such user '{}'", name));
    }
    finish(res, errno, &passwd, 0)
}

/// Resolve a `--user`/uid-token that may be a name or a decimal uid.
/// `numeric` forces the numeric interpretation even if it happens to
/// also parse as a name (it never will, but mirrors the CLI contract).
pub fn resolve_user(spec: &str, numeric: bool) -> anyhow::Result<Info> {
    if numeric {
        let uid: libc::uid_t =
            spec.parse().map_err(|_| anyhow!("--numeric given but '{}' is not a uid", spec))?;
        return by_uid(uid);
    }
    match spec.parse::<libc::uid_t>() {
        Ok(uid) => by_uid(uid),
        Err(_) => by_name(spec),
    }
}

/// Resolve a `--group` token (name or decimal gid) to a gid.
pub fn resolve_group(spec: &str, numeric: bool) -> anyhow::Result<libc::gid_t> {
    if numeric {
        return spec.parse().map_err(|_| anyhow!("--numeric given but '{}' is not a gid", spec));
    }
    if let Ok(gid) = spec.parse::<libc::gid_t>() {
        return Ok(gid);
    }

    let cname = std::ffi::CString::new(spec).map_err(|_| anyhow!("group name '{}' contains a NUL", spec))?;
    let mut buf: [libc::c_char; 1024 * 4] = [0; 1024 * 4];
    let mut group = libc::group {
        gr_name: ptr::null_mut(),
        gr_passwd: ptr::null_mut(),
        gr_gid: 0,
        gr_mem: ptr::null_mut(),
    };
    let mut res: *mut libc::group = ptr::null_mut();

    // Safety: `group` and `buf` are stack-allocated and outlive the call.
    let errno = unsafe {
        libc::getgrnam_r(
            cname.as_ptr(),
            &mut group,
            buf.as_mut_ptr(),
            buf.len(),
            &mut res as *mut *mut libc::group,
        )
    };
    if res.is_null() {
        if errno == 0 {
            Err(anyhow!("no such group '{}'", spec))
        } else {
            Err(anyhow!("error resolving group '{}': {}", spec, io::Error::from_raw_os_error(errno)))
        }
    } else {
        Ok(group.gr_gid)
    }
}

fn empty_passwd() -> libc::passwd {
    libc::passwd {
        pw_name: ptr::null_mut(),
        pw_passwd: ptr::null_mut(),
        pw_uid: 0,
        pw_gid: 0,
        pw_gecos: ptr::null_mut(),
        pw_dir: ptr::null_mut(),
        pw_shell: ptr::null_mut(),
    }
}

fn finish(res: *mut libc::passwd, errno: i32, passwd: &libc::passwd, uid: libc::uid_t) -> anyhow::Result<Info> {
    if res.is_null() {
        return if errno == 0 {
            Err(anyhow!("could not find a passwd entry for uid {}", uid))
        } else {
            Err(anyhow!("error resolving user info: {}", io::Error::from_raw_os_error(errno)))
        };
    }

    // Safety: a non-null result from getpw{uid,nam}_r points at valid,
    // NUL-terminated C strings for the lifetime of this call.
    unsafe {
        Ok(Info {
            uid: passwd.pw_uid,
            gid: passwd.pw_gid,
            default_shell: String::from_utf8_lossy(CStr::from_ptr(passwd.pw_shell).to_bytes()).into_owned(),
            home_dir: String::from_utf8_lossy(CStr::from_ptr(passwd.pw_dir).to_bytes()).into_owned(),
            user: String::from_utf8_lossy(CStr::from_ptr(passwd.pw_name).to_bytes()).into_owned(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn current_user_resolves_by_uid_and_by_name() {
        let me = info().expect("resolve current user");
        let by_explicit_uid = by_uid(me.uid).expect("resolve by uid");
        assert_eq!(me.user, by_explicit_uid.user);

        let by_explicit_name = by_name(&me.user).expect("resolve by name");
        assert_eq!(me.uid, by_explicit_name.uid);
    }

    #[test]
    fn resolve_user_numeric_flag_rejects_names() {
        let me = info().expect("resolve current user");
        assert!(resolve_user(&me.user, true).is_err());
        assert!(resolve_user(&me.uid.to_string(), true).is_ok());
    }
}
