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

//! Serves the fixed set of built-in assets (the terminal page, its
//! stylesheet, the client-side JS) plus any `--css`/`--user-css`
//! overrides, with basic conditional-GET support so a browser that
//! already has the asset cached gets a bare 304.

use std::collections::HashMap;

use tracing::debug;

/// One servable blob: its bytes, a MIME type, and a weak ETag derived
/// from its content so a reload after a restart still finds a match
/// whenever the bytes are unchanged.
pub struct StaticAsset {
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub etag: String,
}

impl StaticAsset {
    pub fn new(content_type: &'static str, body: Vec<u8>) -> StaticAsset {
        let etag = format!("\"{:x}\"", fnv1a(&body));
        StaticAsset { content_type, body, etag }
    }
}

pub struct StaticSet {
    assets: HashMap<String, StaticAsset>,
}

impl StaticSet {
    pub fn new() -> StaticSet {
        StaticSet { assets: HashMap::new() }
    }

    pub fn insert(&mut self, path: &str, asset: StaticAsset) {
        self.assets.insert(path.to_string(), asset);
    }

    pub fn get(&self, path: &str) -> Option<&StaticAsset> {
        self.assets.get(path)
    }

    /// Whether `if_none_match`, as sent on the request, already matches
    /// the asset's current ETag — the caller should reply 304 with no
    /// body when this is true.
    pub fn not_modified(asset: &StaticAsset, if_none_match: Option<&str>) -> bool {
        if_none_match.map(|tag| tag.trim() == asset.etag).unwrap_or(false)
    }
}

impl Default for StaticSet {
    fn default() -> StaticSet {
        StaticSet::new()
    }
}

/// Cheap, dependency-free content hash for ETags; collision resistance
/// against a malicious client doesn't matter here, only change
/// detection across restarts with the same build.
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn etag_is_stable_for_identical_bytes() {
        let a = StaticAsset::new("text/plain", b"hello".to_vec());
        let b = StaticAsset::new("text/plain", b"hello".to_vec());
        assert_eq!(a.etag, b.etag);
    }

    #[test]
    fn not_modified_requires_exact_match() {
        let asset = StaticAsset::new("text/plain", b"hello".to_vec());
        assert!(StaticSet::not_modified(&asset, Some(&asset.etag)));
        assert!(!StaticSet::not_modified(&asset, Some("\"stale\"")));
        assert!(!StaticSet::not_modified(&asset, None));
    }

    #[test]
    fn lookup_by_path() {
        let mut set = StaticSet::new();
        set.insert("/vtyserve.js", StaticAsset::new("application/javascript", b"1".to_vec()));
        assert!(set.get("/vtyserve.js").is_some());
        assert!(set.get("/missing").is_none());
    }
}
