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

//! Owns every live `Session` plus a "graveyard": a deadline-ordered
//! queue of sessions whose child has already exited but whose last
//! chunk of output may not have been collected yet. A naive
//! linked-list scan of the graveyard (the historical approach) is O(N)
//! per sweep; since sweeps happen on every dispatch, a `BinaryHeap`
//! keyed by expiry turns each sweep into "pop while the earliest
//! deadline has passed."

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::{Duration, Instant},
};

use tracing::info;

use super::Session;
use crate::consts::{AJAX_TIMEOUT, GRAVEYARD_TIMEOUT_MULTIPLE};

pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
    graveyard: BinaryHeap<Reverse<(Instant, String)>>,
    /// Set once a session has been created in CGI mode; a second
    /// creation attempt is the signal to exit the event loop entirely.
    cgi_pinned_key: Option<String>,
    cgi_mode: bool,
}

impl SessionRegistry {
    pub fn new(cgi_mode: bool) -> SessionRegistry {
        SessionRegistry {
            sessions: HashMap::new(),
            graveyard: BinaryHeap::new(),
            cgi_pinned_key: None,
            cgi_mode,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Session> {
        self.sessions.get_mut(key)
    }

    /// In CGI mode, whether a session has already been pinned — a second
    /// creation attempt is the signal to end the one-shot invocation.
    pub fn cgi_session_exists(&self) -> bool {
        self.cgi_mode && self.cgi_pinned_key.is_some()
    }

    /// Returns `Err` in CGI mode when a session already exists: the
    /// caller is expected to respond to this by unwinding the whole
    /// event loop.
    pub fn insert(&mut self, session: Session) -> Result<(), ()> {
        if self.cgi_mode {
            if self.cgi_pinned_key.is_some() {
                return Err(());
            }
            self.cgi_pinned_key = Some(session.key.clone());
        }
        self.sessions.insert(session.key.clone(), session);
        Ok(())
    }

    /// Mark a session's child as exited: flag it done, hand off any
    /// pending output to a bound poll immediately (the caller does the
    /// actual HTTP reply; this just returns what to send, if anyone is
    /// bound), and schedule the session for graveyard expiry.
    pub fn mark_done(&mut self, key: &str) {
        let Some(session) = self.sessions.get_mut(key) else { return };
        session.done = true;
        let deadline = Instant::now() + AJAX_TIMEOUT * GRAVEYARD_TIMEOUT_MULTIPLE;
        self.graveyard.push(Reverse((deadline, key.to_string())));
    }

    /// Remove every graveyard entry whose deadline has passed. Sessions
    /// that got their output collected before the deadline are removed
    /// eagerly elsewhere (`remove` below); this only catches stragglers.
    pub fn sweep_graveyard(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((deadline, _))) = self.graveyard.peek() {
            if *deadline > now {
                break;
            }
            let Reverse((_, key)) = self.graveyard.pop().unwrap();
            if self.sessions.remove(&key).is_some() {
                info!(session = %key, "graveyard expired, session removed");
            }
        }
    }

    /// Find whichever session this child pid belongs to (if any) and
    /// mark it done; called from the SIGCHLD handler once per reaped
    /// child.
    pub fn mark_done_by_pid(&mut self, pid: i32) {
        let key = self.sessions.values().find(|s| s.child_pid == pid).map(|s| s.key.clone());
        if let Some(key) = key {
            self.mark_done(&key);
        }
    }

    /// A session is reachable iff it is present here or still has a
    /// live graveyard entry (invariant from the data model); removing
    /// it early once output has drained keeps the registry tight
    /// without waiting for the sweep.
    pub fn remove(&mut self, key: &str) {
        self.sessions.remove(key);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// How long until the graveyard needs the next sweep, for the event
/// loop's idle-timeout calculation. `None` if nothing is pending.
pub fn next_sweep_delay(registry: &SessionRegistry) -> Option<Duration> {
    registry.graveyard.peek().map(|Reverse((deadline, _))| deadline.saturating_duration_since(Instant::now()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn dummy_session(key: &str) -> Session {
        Session::new(key.to_string(), "test".to_string(), -1, 0)
    }

    #[test]
    fn cgi_mode_refuses_a_second_session() {
        let mut reg = SessionRegistry::new(true);
        assert!(reg.insert(dummy_session("one")).is_ok());
        assert!(reg.insert(dummy_session("two")).is_err());
    }

    #[test]
    fn non_cgi_mode_allows_many_sessions() {
        let mut reg = SessionRegistry::new(false);
        assert!(reg.insert(dummy_session("one")).is_ok());
        assert!(reg.insert(dummy_session("two")).is_ok());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn mark_done_schedules_a_graveyard_entry() {
        let mut reg = SessionRegistry::new(false);
        reg.insert(dummy_session("a")).unwrap();
        reg.mark_done("a");
        assert!(reg.get("a").unwrap().done);
        assert!(next_sweep_delay(&reg).is_some());
    }

    #[test]
    fn sweep_only_removes_expired_entries() {
        let mut reg = SessionRegistry::new(false);
        reg.insert(dummy_session("a")).unwrap();
        reg.graveyard.push(Reverse((Instant::now() - Duration::from_secs(1), "a".to_string())));
        reg.sweep_graveyard();
        assert!(reg.get("a").is_none());
    }
}
