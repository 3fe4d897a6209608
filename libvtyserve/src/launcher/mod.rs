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

//! The privileged half of vtyserve lives in its own process, forked
//! before the main process drops any privileges it was started with.
//! Everything the main event loop needs from it — "start me a PTY
//! running this service's command" — goes over a UNIX domain
//! socketpair established at startup; the PTY master fd rides back as
//! `SCM_RIGHTS` ancillary data so it never has to be named in the
//! filesystem.

pub mod auth;
pub mod client;
pub mod server;
pub mod utmp;

pub use client::LauncherClient;
