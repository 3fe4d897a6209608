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

//! `check!` guards the handful of invariants the event loop and session
//! registry depend on for safety (stable connection handles, at most one
//! bound poll per session, ...). Unlike an ordinary `anyhow::Result`
//! error these are not recoverable by any caller, so we log and exit
//! rather than unwind, matching the `abort()`-on-invariant-violation
//! behavior spelled out for "Fatal" errors.

/// Log and exit the process if `cond` is false. Not a panic: a violated
/// invariant here means the in-memory bookkeeping has already diverged
/// from reality, so unwinding through it would just run destructors over
/// corrupted state.
#[macro_export]
macro_rules! check {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            tracing::error!("invariant violated: {}", format!($($arg)+));
            std::process::exit(1);
        }
    };
}
