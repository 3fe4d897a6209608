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

//! Everything needed to speak enough HTTP/1.1 to serve a handful of
//! long-poll and WebSocket endpoints plus a static file tree: the
//! per-connection state machine, the TLS sniff/engine layer, the
//! hixie-draft WebSocket framing, and request body decoding.

pub mod connection;
pub mod statics;
pub mod tls;
pub mod url;
pub mod websocket;

pub use connection::{Directive, HttpConnection, Request, State};
