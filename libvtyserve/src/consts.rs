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

use std::time::Duration;

/// How long a connection may sit idle before the event loop closes it.
pub const CONN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// How long a bound long-poll request may wait for PTY output before the
/// server replies with an empty data field.
pub const AJAX_TIMEOUT: Duration = Duration::from_secs(45);

/// How often a suspended long-poll connection is re-checked for newly
/// arrived PTY output. The event loop has no cross-connection wake
/// signal, so a bound request re-arms its own deadline to this interval
/// each time it fires instead of blocking until data shows up.
pub const AJAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// How long a dead session's final output lingers in the graveyard for a
/// straggling poll to collect, expressed as a multiple of AJAX_TIMEOUT.
pub const GRAVEYARD_TIMEOUT_MULTIPLE: u32 = 2;

/// Largest chunk of PTY output read into a session's buffer before read
/// readiness on the PTY master is disabled until the client drains it.
pub const MAX_RESPONSE: usize = 2048;

/// Cap on accumulated request header bytes before a connection is killed
/// with 413.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Bodies larger than this are eligible for DEFLATE compression.
pub const COMPRESS_THRESHOLD: usize = 1400;

pub const BUF_SIZE: usize = 1024 * 16;

/// WebSocket (hixie draft) binary frame length cap.
pub const MAX_WS_FRAME_LEN: u64 = 0x7FFF_FFF0;

pub const DEFAULT_PORT: u16 = 4200;

/// Number of random bytes drawn to build a session key.
pub const SESSION_KEY_BYTES: usize = 16;

/// Set in the environment of a self-relaunched `--background` process
/// so it knows not to relaunch itself again.
pub const BACKGROUND_SENTINEL_VAR: &str = "VTYSERVE_BACKGROUNDED";
