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

//! A byte trie used to dispatch request paths to handlers by longest
//! registered prefix. `TerminalDispatcher` registers one entry per
//! mounted service root plus the static asset paths under it; a lookup
//! for `/foo/bar/beep.wav` against a registered prefix `/foo/bar` yields
//! that prefix's value and the unmatched suffix `/beep.wav`.

use std::collections::HashMap;

#[derive(Debug)]
pub struct Trie<V> {
    nodes: Vec<Node<V>>,
}

#[derive(Debug)]
struct Node<V> {
    value: Option<V>,
    children: HashMap<u8, usize>,
}

impl<V> Node<V> {
    fn new() -> Self {
        Node { value: None, children: HashMap::new() }
    }
}

/// The result of a longest-prefix lookup: the value stored at the
/// longest registered key that is a prefix of the query, and the
/// unconsumed remainder of the query past that key.
pub struct Matched<'a, 'q, V> {
    pub value: &'a V,
    pub remainder: &'q [u8],
}

impl<V> Default for Trie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Trie<V> {
    pub fn new() -> Self {
        Trie { nodes: vec![Node::new()] }
    }

    /// Insert `key`, overwriting any value already registered at that
    /// exact key.
    pub fn insert(&mut self, key: &[u8], value: V) {
        let mut cur = 0;
        for &b in key {
            cur = match self.nodes[cur].children.get(&b) {
                Some(&next) => next,
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(Node::new());
                    self.nodes[cur].children.insert(b, idx);
                    idx
                }
            };
        }
        self.nodes[cur].value = Some(value);
    }

    /// Find the longest registered key that is a byte-for-byte prefix of
    /// `query`, returning its value and the remaining suffix of `query`.
    /// Returns `None` if no registered key prefixes `query` at all (not
    /// even the empty key, i.e. nothing was ever inserted with an empty
    /// key as a catch-all).
    pub fn longest_prefix<'a, 'q>(&'a self, query: &'q [u8]) -> Option<Matched<'a, 'q, V>> {
        let mut cur = 0;
        let mut best: Option<(usize, &'a V)> = self.nodes[0].value.as_ref().map(|v| (0, v));

        for (i, &b) in query.iter().enumerate() {
            match self.nodes[cur].children.get(&b) {
                Some(&next) => {
                    cur = next;
                    if let Some(v) = &self.nodes[cur].value {
                        best = Some((i + 1, v));
                    }
                }
                None => break,
            }
        }

        best.map(|(consumed, value)| Matched { value, remainder: &query[consumed..] })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn longest_prefix_match() {
        let mut t = Trie::new();
        t.insert(b"/foo", 1);
        t.insert(b"/foo/bar", 2);

        let m = t.longest_prefix(b"/foo/bar/beep.wav").expect("a match");
        assert_eq!(*m.value, 2);
        assert_eq!(m.remainder, b"/beep.wav");

        let m = t.longest_prefix(b"/foo/baz").expect("a match");
        assert_eq!(*m.value, 1);
        assert_eq!(m.remainder, b"/baz");

        assert!(t.longest_prefix(b"/other").is_none());
    }

    #[test]
    fn exact_match_has_empty_remainder() {
        let mut t = Trie::new();
        t.insert(b"/", 0);
        t.insert(b"/plain", 1);

        let m = t.longest_prefix(b"/plain").expect("a match");
        assert_eq!(*m.value, 1);
        assert!(m.remainder.is_empty());

        let m = t.longest_prefix(b"/").expect("a match");
        assert_eq!(*m.value, 0);
        assert!(m.remainder.is_empty());
    }

    #[test]
    fn root_catch_all() {
        let mut t = Trie::new();
        t.insert(b"", -1);
        t.insert(b"/secure", 9);

        let m = t.longest_prefix(b"/unregistered/path").expect("root catches everything");
        assert_eq!(*m.value, -1);
        assert_eq!(m.remainder, b"/unregistered/path");
    }
}
