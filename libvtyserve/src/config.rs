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

//! Assembles the concrete settings the server runs with from two
//! sources: CLI flags and an optional TOML file. The file supplies
//! defaults for knobs the caller didn't pass on the command line; flags
//! always win. There is no daemon-side watcher for the file the way
//! there is for interactive attach sessions elsewhere in the corpus
//! this grew out of — a config change here requires a restart.

use std::{fs, path::PathBuf};

use anyhow::{anyhow, Context};
use serde_derive::Deserialize;
use tracing::{info, instrument};

use vtyserve_protocol::LaunchPolicy;

use crate::Args;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkify {
    None,
    Normal,
    Aggressive,
}

impl std::str::FromStr for Linkify {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "none" => Ok(Linkify::None),
            "normal" => Ok(Linkify::Normal),
            "aggressive" => Ok(Linkify::Aggressive),
            other => Err(anyhow!("unknown --linkify level '{}', want none|normal|aggressive", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cwd {
    Home,
    Absolute(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cmd {
    Shell,
    Template(String),
}

/// A single `--service` mount: the path prefix it answers on and the
/// policy the launcher uses to decide who runs under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub prefix: String,
    pub policy: LaunchPolicy,
    pub ssh_host: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub cwd: Cwd,
    pub cmd: Cmd,
}

impl Service {
    /// Parse the `/<path>:APP` grammar from spec §6:
    /// `APP ∈ { LOGIN, SSH[:host], AUTH:cwd:cmd, uid:gid:cwd:cmd }`.
    pub fn parse(spec: &str) -> anyhow::Result<Service> {
        let (path, app) =
            spec.split_once(':').ok_or_else(|| anyhow!("service spec '{}' missing ':APP' suffix", spec))?;
        let prefix = normalize_path(path)?;

        let mut parts = app.splitn(4, ':');
        let head = parts.next().unwrap_or("");

        if head.eq_ignore_ascii_case("login") {
            return Ok(Service { prefix, policy: LaunchPolicy::Login, ssh_host: None, uid: None, gid: None, cwd: Cwd::Home, cmd: Cmd::Shell });
        }
        if head.eq_ignore_ascii_case("ssh") {
            let host = parts.next().map(str::to_string);
            return Ok(Service { prefix, policy: LaunchPolicy::Ssh, ssh_host: host, uid: None, gid: None, cwd: Cwd::Home, cmd: Cmd::Shell });
        }
        if head.eq_ignore_ascii_case("auth") {
            let cwd_tok = parts.next().ok_or_else(|| anyhow!("AUTH service '{}' missing cwd", spec))?;
            let cmd_tok = parts.next().ok_or_else(|| anyhow!("AUTH service '{}' missing cmd", spec))?;
            return Ok(Service {
                prefix,
                policy: LaunchPolicy::Auth,
                ssh_host: None,
                uid: None,
                gid: None,
                cwd: parse_cwd(cwd_tok)?,
                cmd: parse_cmd(cmd_tok),
            });
        }

        // Otherwise it must be the numeric uid:gid:cwd:cmd form. `head`
        // is the uid token; re-split the remainder ourselves since we
        // already consumed one colon-delimited field via `parts`.
        let uid: u32 = head.parse().with_context(|| format!("service spec '{}' has neither a known keyword nor a numeric uid", spec))?;
        let gid_tok = parts.next().ok_or_else(|| anyhow!("uid:gid:cwd:cmd service '{}' missing gid", spec))?;
        let gid: u32 = gid_tok.parse().with_context(|| format!("service spec '{}' has a non-numeric gid", spec))?;
        let cwd_tok = parts.next().ok_or_else(|| anyhow!("uid:gid:cwd:cmd service '{}' missing cwd", spec))?;
        let cmd_tok = parts.next().ok_or_else(|| anyhow!("uid:gid:cwd:cmd service '{}' missing cmd", spec))?;
        Ok(Service {
            prefix,
            policy: LaunchPolicy::UidGid,
            ssh_host: None,
            uid: Some(uid),
            gid: Some(gid),
            cwd: parse_cwd(cwd_tok)?,
            cmd: parse_cmd(cmd_tok),
        })
    }
}

fn parse_cwd(tok: &str) -> anyhow::Result<Cwd> {
    if tok == "HOME" {
        Ok(Cwd::Home)
    } else if tok.starts_with('/') {
        Ok(Cwd::Absolute(PathBuf::from(tok)))
    } else {
        Err(anyhow!("cwd '{}' is neither HOME nor an absolute path", tok))
    }
}

fn parse_cmd(tok: &str) -> Cmd {
    if tok == "SHELL" {
        Cmd::Shell
    } else {
        Cmd::Template(tok.to_string())
    }
}

/// Collapse a service path down to a single leading slash with no
/// trailing slash, except for the root path itself.
pub fn normalize_path(path: &str) -> anyhow::Result<String> {
    if path.is_empty() {
        return Err(anyhow!("service path must not be empty"));
    }
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", trimmed))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFile {
    pub url: String,
    pub path: PathBuf,
}

impl StaticFile {
    pub fn parse(spec: &str) -> anyhow::Result<StaticFile> {
        let (url, path) = spec
            .split_once(':')
            .ok_or_else(|| anyhow!("--static-file spec '{}' must be URL:FILE", spec))?;
        Ok(StaticFile { url: url.to_string(), path: PathBuf::from(path) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCss {
    pub name: String,
    pub path: PathBuf,
}

impl UserCss {
    pub fn parse(spec: &str) -> anyhow::Result<UserCss> {
        let (name, path) =
            spec.split_once(':').ok_or_else(|| anyhow!("--user-css spec '{}' must be NAME:FILE", spec))?;
        Ok(UserCss { name: name.to_string(), path: PathBuf::from(path) })
    }
}

/// Port range a `--cgi` invocation is allowed to bind in. `(0, 0)` is
/// the sentinel for "no range given, let the OS pick any free port."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgiRange {
    pub min: u16,
    pub max: u16,
}

fn parse_cgi_range(s: &str) -> anyhow::Result<CgiRange> {
    if s.is_empty() {
        return Ok(CgiRange { min: 0, max: 0 });
    }
    let (min_s, max_s) =
        s.split_once('-').ok_or_else(|| anyhow!("--cgi range '{}' must be MIN-MAX", s))?;
    let min: u16 = min_s.parse().with_context(|| format!("--cgi range '{}' has a bad lower bound", s))?;
    let max: u16 = max_s.parse().with_context(|| format!("--cgi range '{}' has a bad upper bound", s))?;
    if min > max {
        return Err(anyhow!("--cgi range '{}' has min > max", s));
    }
    Ok(CgiRange { min, max })
}

#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_dir: Option<PathBuf>,
    pub cert_fd: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub localhost_only: bool,
    pub tls: Option<TlsConfig>,
    pub disable_ssl_menu: bool,
    pub cgi: Option<CgiRange>,
    pub pidfile: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub numeric: bool,
    pub no_beep: bool,
    pub linkify: Linkify,
    pub services: Vec<Service>,
    pub static_files: Vec<StaticFile>,
    pub css: Option<PathBuf>,
    pub user_css: Vec<UserCss>,
}

impl Config {
    /// Build the effective configuration from CLI flags, falling back
    /// to an optional TOML file for anything the flags left unset.
    #[instrument(skip_all)]
    pub fn from_args(args: &Args) -> anyhow::Result<Config> {
        let file = match &args.config_file {
            Some(path) => {
                info!("reading config file {}", path);
                let text = fs::read_to_string(path).with_context(|| format!("reading config file {}", path))?;
                toml::from_str(&text).with_context(|| format!("parsing config file {}", path))?
            }
            None => FileConfig::default(),
        };

        let tls = if args.disable_ssl {
            None
        } else if let Some(dir) = args.cert.clone().or(file.cert) {
            Some(TlsConfig { cert_dir: Some(PathBuf::from(dir)), cert_fd: None })
        } else if let Some(fd) = args.cert_fd.or(file.cert_fd) {
            Some(TlsConfig { cert_dir: None, cert_fd: Some(fd) })
        } else {
            None
        };

        let cgi = match &args.cgi {
            Some(s) => Some(parse_cgi_range(s)?),
            None => None,
        };

        let linkify_str = if args.linkify != "normal" { args.linkify.clone() } else { file.linkify.unwrap_or(args.linkify.clone()) };
        let linkify: Linkify = linkify_str.parse()?;

        let mut services = Vec::new();
        for spec in &args.service {
            services.push(Service::parse(spec)?);
        }
        for spec in file.service.unwrap_or_default() {
            services.push(Service::parse(&spec)?);
        }
        if services.is_empty() {
            services.push(Service::parse("/:LOGIN")?);
        }

        let mut static_files = Vec::new();
        for spec in &args.static_file {
            static_files.push(StaticFile::parse(spec)?);
        }

        let mut user_css = Vec::new();
        if let Some(spec) = &args.user_css {
            user_css.push(UserCss::parse(spec)?);
        }

        Ok(Config {
            port: args.port,
            localhost_only: args.localhost_only || file.localhost_only.unwrap_or(false),
            tls,
            disable_ssl_menu: args.disable_ssl_menu,
            cgi,
            pidfile: args.pidfile.clone(),
            user: args.user.clone().or(file.user),
            group: args.group.clone().or(file.group),
            numeric: args.numeric,
            no_beep: args.no_beep || file.no_beep.unwrap_or(false),
            linkify,
            services,
            static_files,
            css: args.css.clone().map(PathBuf::from),
            user_css,
        })
    }
}

#[derive(Deserialize, Default, Debug, Clone)]
struct FileConfig {
    localhost_only: Option<bool>,
    cert: Option<String>,
    cert_fd: Option<i32>,
    user: Option<String>,
    group: Option<String>,
    no_beep: Option<bool>,
    linkify: Option<String>,
    service: Option<Vec<String>>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_login_service() {
        let s = Service::parse("/:LOGIN").unwrap();
        assert_eq!(s.prefix, "/");
        assert_eq!(s.policy, LaunchPolicy::Login);
    }

    #[test]
    fn parse_ssh_service_with_host() {
        let s = Service::parse("/ssh:SSH:example.com").unwrap();
        assert_eq!(s.prefix, "/ssh");
        assert_eq!(s.policy, LaunchPolicy::Ssh);
        assert_eq!(s.ssh_host.as_deref(), Some("example.com"));
    }

    #[test]
    fn parse_auth_service() {
        let s = Service::parse("/shell:AUTH:HOME:SHELL").unwrap();
        assert_eq!(s.policy, LaunchPolicy::Auth);
        assert_eq!(s.cwd, Cwd::Home);
        assert_eq!(s.cmd, Cmd::Shell);
    }

    #[test]
    fn parse_uid_gid_service() {
        let s = Service::parse("/admin:1000:1000:/var/admin:/bin/bash --login").unwrap();
        assert_eq!(s.policy, LaunchPolicy::UidGid);
        assert_eq!(s.uid, Some(1000));
        assert_eq!(s.gid, Some(1000));
        assert_eq!(s.cwd, Cwd::Absolute(PathBuf::from("/var/admin")));
        assert_eq!(s.cmd, Cmd::Template("/bin/bash --login".to_string()));
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_path("/foo/").unwrap(), "/foo");
        assert_eq!(normalize_path("foo").unwrap(), "/foo");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert!(normalize_path("").is_err());
    }

    #[test]
    fn cgi_range_parsing() {
        assert_eq!(parse_cgi_range("").unwrap(), CgiRange { min: 0, max: 0 });
        assert_eq!(parse_cgi_range("8000-9000").unwrap(), CgiRange { min: 8000, max: 9000 });
        assert!(parse_cgi_range("9000-8000").is_err());
        assert!(parse_cgi_range("bogus").is_err());
    }

    #[test]
    fn linkify_parsing() {
        assert_eq!("none".parse::<Linkify>().unwrap(), Linkify::None);
        assert_eq!("aggressive".parse::<Linkify>().unwrap(), Linkify::Aggressive);
        assert!("loud".parse::<Linkify>().is_err());
    }
}
