//! In-memory mock index.
//!
//! Records are loaded once at startup and never mutated. The index maps the
//! composite byte-exact key `path|mock_id|content_type` to the list of
//! responses encountered for it, in filesystem order; method is the only
//! tie-breaker within a list.
//!
//! Lookup is the hot path: it works on raw byte slices and builds the
//! composite key in a thread-local buffer, so the only per-request allocation
//! on a miss-free probe is the buffer growth on first use.

use crate::record::{self, MockResponse};
use crate::scenario::{ScenarioError, ScenarioSet};
use bytes::Bytes;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

thread_local! {
    static KEY_BUF: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(256));
}

/// Aggregate numbers served by `/__mock__/stats`.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total_responses: usize,
    pub unique_paths: usize,
    pub unique_mock_ids: usize,
    pub paths: Vec<String>,
}

#[derive(Serialize)]
struct MockListEntry<'a> {
    request_id: &'a str,
    path: &'a str,
    method: &'a str,
    mock_id: &'a str,
    content_type: &'a str,
    status_code: u16,
    full_url: &'a str,
}

#[derive(Serialize)]
struct MockList<'a> {
    total: usize,
    mocks: Vec<MockListEntry<'a>>,
}

/// The mock index plus its pre-serialized projections.
pub struct MockStore {
    responses: HashMap<Vec<u8>, Vec<Arc<MockResponse>>>,
    /// Every response in filesystem-encounter order; drives the O(N)
    /// any-content-type fallback and the list projection.
    order: Vec<Arc<MockResponse>>,
    cached_stats: Bytes,
    cached_list: Bytes,
    scenarios: Option<ScenarioSet>,
}

impl MockStore {
    /// Walk `base_dir`: each immediate subdirectory is a mock-id, each
    /// `*.json` file inside it a record. Files that fail to parse are skipped
    /// with a warning; a missing base directory yields an empty store.
    pub fn load(base_dir: &Path) -> anyhow::Result<Self> {
        let mut store = Self::empty();
        if !base_dir.exists() {
            store.rebuild_caches();
            return Ok(store);
        }

        for entry in std::fs::read_dir(base_dir)? {
            let Ok(entry) = entry else { continue };
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let mock_id = entry.file_name().to_string_lossy().into_owned();
            let Ok(files) = std::fs::read_dir(&dir) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match record::load_from_file(&path, &mock_id) {
                    Ok(response) => store.insert(response),
                    Err(err) => {
                        warn!(file = %path.display(), error = %err, "skipping unparseable record");
                    }
                }
            }
        }

        store.rebuild_caches();
        debug!(responses = store.order.len(), "mock index loaded");
        Ok(store)
    }

    /// Build a store from already-parsed records. Used by benchmarks and
    /// tests that do not want to touch the filesystem.
    pub fn from_records(records: Vec<MockResponse>) -> Self {
        let mut store = Self::empty();
        for record in records {
            store.insert(record);
        }
        store.rebuild_caches();
        store
    }

    fn empty() -> Self {
        Self {
            responses: HashMap::new(),
            order: Vec::new(),
            cached_stats: Bytes::new(),
            cached_list: Bytes::new(),
            scenarios: None,
        }
    }

    fn insert(&mut self, response: MockResponse) {
        let mut key = Vec::with_capacity(
            response.path.len() + response.mock_id.len() + response.content_type.len() + 2,
        );
        key.extend_from_slice(response.path.as_bytes());
        key.push(b'|');
        key.extend_from_slice(response.mock_id.as_bytes());
        key.push(b'|');
        key.extend_from_slice(response.content_type.as_bytes());

        let response = Arc::new(response);
        self.responses
            .entry(key)
            .or_default()
            .push(Arc::clone(&response));
        self.order.push(response);
    }

    /// Exact-key lookup. The content type is normalized inline (parameters
    /// stripped, whitespace trimmed) before the key is composed. With a
    /// non-empty method, the first candidate whose method matches
    /// case-insensitively wins; with an empty method, the first candidate.
    pub fn find(
        &self,
        path: &[u8],
        mock_id: &[u8],
        content_type: &[u8],
        method: &[u8],
    ) -> Option<Arc<MockResponse>> {
        let content_type = normalize_content_type_bytes(content_type);
        KEY_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();
            buf.extend_from_slice(path);
            buf.push(b'|');
            buf.extend_from_slice(mock_id);
            buf.push(b'|');
            buf.extend_from_slice(content_type);

            let candidates = self.responses.get(buf.as_slice())?;
            if method.is_empty() {
                return candidates.first().cloned();
            }
            candidates
                .iter()
                .find(|c| c.method.as_bytes().eq_ignore_ascii_case(method))
                .cloned()
        })
    }

    /// `Accept: */*` fallback: scan every loaded response and return the
    /// first (in encounter order) whose path and mock-id match, regardless of
    /// content type.
    pub fn find_any_content_type(
        &self,
        path: &[u8],
        mock_id: &[u8],
        method: &[u8],
    ) -> Option<Arc<MockResponse>> {
        self.order
            .iter()
            .find(|r| {
                r.path.as_bytes() == path
                    && r.mock_id.as_bytes() == mock_id
                    && (method.is_empty() || r.method.as_bytes().eq_ignore_ascii_case(method))
            })
            .cloned()
    }

    /// Activate scenario mode. Header-based lookup is disabled from here on
    /// and the stats/list projections are rebuilt from the scenario set.
    pub fn load_scenarios(&mut self, config_path: &Path) -> Result<(), ScenarioError> {
        let set = ScenarioSet::load(config_path)?;
        self.scenarios = Some(set);
        self.rebuild_caches();
        Ok(())
    }

    pub fn has_scenarios(&self) -> bool {
        self.scenarios.is_some()
    }

    pub fn match_scenario(
        &self,
        path: &[u8],
        method: &[u8],
        body: &[u8],
    ) -> Option<Arc<MockResponse>> {
        self.scenarios.as_ref()?.match_response(path, method, body)
    }

    /// Pre-serialized stats JSON, served verbatim by `/__mock__/stats`.
    pub fn stats_json(&self) -> Bytes {
        self.cached_stats.clone()
    }

    /// Pre-serialized mock list JSON, served verbatim by `/__mock__/list`.
    pub fn mock_list_json(&self) -> Bytes {
        self.cached_list.clone()
    }

    pub fn stats(&self) -> StoreStats {
        match &self.scenarios {
            Some(set) => {
                let mut paths = HashSet::new();
                let mut mock_ids = HashSet::new();
                for scenario in set.scenarios() {
                    paths.insert(scenario.path.as_str());
                    mock_ids.insert(scenario.name.as_str());
                }
                StoreStats {
                    total_responses: set.scenarios().len(),
                    unique_paths: paths.len(),
                    unique_mock_ids: mock_ids.len(),
                    paths: paths.into_iter().map(str::to_string).collect(),
                }
            }
            None => {
                let mut paths = HashSet::new();
                let mut mock_ids = HashSet::new();
                for response in &self.order {
                    paths.insert(response.path.as_str());
                    if !response.mock_id.is_empty() {
                        mock_ids.insert(response.mock_id.as_str());
                    }
                }
                StoreStats {
                    total_responses: self.order.len(),
                    unique_paths: paths.len(),
                    unique_mock_ids: mock_ids.len(),
                    paths: paths.into_iter().map(str::to_string).collect(),
                }
            }
        }
    }

    fn listed_responses(&self) -> Vec<&Arc<MockResponse>> {
        match &self.scenarios {
            Some(set) => set.scenarios().iter().map(|s| &s.response).collect(),
            None => self.order.iter().collect(),
        }
    }

    fn rebuild_caches(&mut self) {
        self.cached_stats = Bytes::from(serde_json::to_vec(&self.stats()).unwrap_or_default());

        let mocks: Vec<MockListEntry> = self
            .listed_responses()
            .into_iter()
            .map(|r| MockListEntry {
                request_id: &r.request_id,
                path: &r.path,
                method: &r.method,
                mock_id: &r.mock_id,
                content_type: &r.content_type,
                status_code: r.status_code,
                full_url: &r.full_url,
            })
            .collect();
        let list = MockList {
            total: mocks.len(),
            mocks,
        };
        self.cached_list = Bytes::from(serde_json::to_vec(&list).unwrap_or_default());
    }
}

/// Byte-level content-type normalization for lookup keys: drop parameters
/// after `;`, trim ASCII whitespace. No defaulting happens here; callers
/// supply `application/json` explicitly when the request carries no Accept.
pub fn normalize_content_type_bytes(content_type: &[u8]) -> &[u8] {
    let mut ct = content_type;
    if let Some(i) = ct.iter().position(|&b| b == b';') {
        ct = &ct[..i];
    }
    trim_ascii_space(ct)
}

fn trim_ascii_space(mut s: &[u8]) -> &[u8] {
    while let Some((first, rest)) = s.split_first() {
        if matches!(first, b' ' | b'\t' | b'\r' | b'\n') {
            s = rest;
        } else {
            break;
        }
    }
    while let Some((last, rest)) = s.split_last() {
        if matches!(last, b' ' | b'\t' | b'\r' | b'\n') {
            s = rest;
        } else {
            break;
        }
    }
    s
}
