//! Scenario YAML loading and request-time matching.

use super::predicate::{BodyPredicate, CompiledPredicate, PredicateError};
use crate::record::{self, MockResponse, RecordError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("read scenario config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parse scenario config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("scenario config {0:?} does not define any scenarios")]
    Empty(PathBuf),
    #[error("scenario #{index} is missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("scenario {name}: load response: {source}")]
    LoadResponse { name: String, source: RecordError },
    #[error("scenario {name} filter invalid: {source}")]
    InvalidFilter {
        name: String,
        source: PredicateError,
    },
}

#[derive(Debug, Deserialize)]
struct ScenarioFile {
    #[serde(default)]
    scenarios: Vec<ScenarioDef>,
}

#[derive(Debug, Deserialize)]
struct ScenarioDef {
    #[serde(default)]
    name: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    path: String,
    #[serde(default)]
    filter: FilterDef,
    #[serde(default)]
    response: Option<ResponseDef>,
}

#[derive(Debug, Default, Deserialize)]
struct FilterDef {
    #[serde(default)]
    body: Option<BodyPredicate>,
}

#[derive(Debug, Deserialize)]
struct ResponseDef {
    #[serde(default)]
    file: String,
    #[serde(default)]
    delay: Option<f64>,
}

/// One loaded scenario: identity, compiled predicate, materialized response.
#[derive(Debug)]
pub struct Scenario {
    pub name: String,
    pub path: String,
    pub method: String,
    pub filter: Option<CompiledPredicate>,
    pub response: Arc<MockResponse>,
}

/// Declaration-ordered scenario set, indexed by exact path for matching.
#[derive(Debug)]
pub struct ScenarioSet {
    by_path: HashMap<String, Vec<Arc<Scenario>>>,
    order: Vec<Arc<Scenario>>,
}

impl ScenarioSet {
    /// Load and validate a scenario YAML. Any configuration problem is fatal:
    /// the caller must refuse to start.
    pub fn load(config_path: &Path) -> Result<Self, ScenarioError> {
        let payload = std::fs::read(config_path).map_err(|source| ScenarioError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        let file: ScenarioFile =
            serde_yaml::from_slice(&payload).map_err(|source| ScenarioError::Parse {
                path: config_path.to_path_buf(),
                source,
            })?;
        if file.scenarios.is_empty() {
            return Err(ScenarioError::Empty(config_path.to_path_buf()));
        }

        let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
        let mut by_path: HashMap<String, Vec<Arc<Scenario>>> = HashMap::new();
        let mut order = Vec::with_capacity(file.scenarios.len());

        for (idx, def) in file.scenarios.iter().enumerate() {
            let index = idx + 1;
            let name = def.name.trim();
            if name.is_empty() {
                return Err(ScenarioError::MissingField {
                    index,
                    field: "name",
                });
            }
            let path = def.path.trim();
            if path.is_empty() {
                return Err(ScenarioError::MissingField {
                    index,
                    field: "path",
                });
            }
            let response_file = def
                .response
                .as_ref()
                .map(|r| r.file.trim())
                .unwrap_or_default();
            if response_file.is_empty() {
                return Err(ScenarioError::MissingField {
                    index,
                    field: "response.file",
                });
            }

            let resolved = if Path::new(response_file).is_absolute() {
                PathBuf::from(response_file)
            } else {
                base_dir.join(response_file)
            };
            let mut response = record::load_from_file(&resolved, name).map_err(|source| {
                ScenarioError::LoadResponse {
                    name: name.to_string(),
                    source,
                }
            })?;

            if let Some(new_delay) = def.response.as_ref().and_then(|r| r.delay) {
                apply_delay_override(&mut response, new_delay);
            }

            let mut method = def.method.trim().to_ascii_uppercase();
            if method.is_empty() {
                method = response.method.to_ascii_uppercase();
            }
            if method.is_empty() {
                method = "GET".to_string();
            }

            let filter = match &def.filter.body {
                Some(predicate) => Some(CompiledPredicate::compile(predicate).map_err(
                    |source| ScenarioError::InvalidFilter {
                        name: name.to_string(),
                        source,
                    },
                )?),
                None => None,
            };

            // Scenario identity overrides the record's, so `/__mock__/list`
            // reports what was declared rather than what was captured.
            response.path = path.to_string();
            response.full_url = path.to_string();
            response.method = method.clone();
            response.mock_id = name.to_string();

            let scenario = Arc::new(Scenario {
                name: name.to_string(),
                path: path.to_string(),
                method,
                filter,
                response: Arc::new(response),
            });
            by_path
                .entry(path.to_string())
                .or_default()
                .push(Arc::clone(&scenario));
            order.push(scenario);
        }

        info!(scenarios = order.len(), "scenario routing enabled");
        Ok(Self { by_path, order })
    }

    /// Evaluate scenarios in declaration order; the first one whose path,
    /// method and body predicate all accept the request wins.
    pub fn match_response(
        &self,
        path: &[u8],
        method: &[u8],
        body: &[u8],
    ) -> Option<Arc<MockResponse>> {
        let path = std::str::from_utf8(path).ok()?;
        let candidates = self.by_path.get(path)?;

        // The body is parsed lazily, once, and only when some candidate
        // actually carries a predicate.
        let mut parsed_body: Option<Option<Value>> = None;

        for scenario in candidates {
            if !scenario.method.is_empty()
                && !method.is_empty()
                && !scenario.method.as_bytes().eq_ignore_ascii_case(method)
            {
                continue;
            }
            if let Some(filter) = &scenario.filter {
                let body_json =
                    parsed_body.get_or_insert_with(|| serde_json::from_slice(body).ok());
                if !filter.matches(body_json.as_ref()) {
                    continue;
                }
            }
            return Some(Arc::clone(&scenario.response));
        }
        None
    }

    pub fn scenarios(&self) -> &[Arc<Scenario>] {
        &self.order
    }
}

/// Replace the record's delay. SSE records with a prior positive delay get
/// every event timestamp rescaled by `new/old`, preserving relative spacing
/// while compressing or stretching the stream.
fn apply_delay_override(response: &mut MockResponse, new_delay: f64) {
    let old_delay = response.delay;
    if response.is_sse && !response.sse_events.is_empty() && old_delay > 0.0 {
        let scale = new_delay / old_delay;
        for event in &mut response.sse_events {
            event.timestamp *= scale;
        }
    }
    response.delay = new_delay;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_record(dir: &Path, name: &str, record: Value) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, record.to_string()).unwrap();
        path
    }

    fn status_record(state: &str) -> Value {
        json!({
            "request": {"method": "POST", "url": "http://u/api/v1/status"},
            "response": {
                "status_code": 200,
                "headers": {"Content-Type": "application/json"},
                "body": {"state": state}
            }
        })
    }

    fn sse_record(delay: f64) -> Value {
        json!({
            "request": {"method": "GET", "url": "http://u/stream"},
            "response": {
                "headers": {"Content-Type": "text/event-stream"},
                "body": [
                    {"data": {"i": 1}, "timestamp": 0.1},
                    {"data": {"i": 2}, "timestamp": 0.2},
                    {"data": {"i": 3}, "timestamp": 0.3},
                    {"data": {"i": 4}, "timestamp": 0.4},
                    {"data": {"i": 5}, "timestamp": 0.5}
                ],
                "delay": delay
            }
        })
    }

    fn load(dir: &Path, yaml: &str) -> Result<ScenarioSet, ScenarioError> {
        let config = dir.join("scenarios.yml");
        std::fs::write(&config, yaml).unwrap();
        ScenarioSet::load(&config)
    }

    #[test]
    fn first_matching_scenario_in_declaration_order_wins() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "done.json", status_record("done"));
        write_record(dir.path(), "fallback.json", status_record("fallback"));

        let set = load(
            dir.path(),
            r#"
scenarios:
  - name: done-status
    path: /api/v1/status
    method: POST
    filter:
      body:
        and:
          - eq: {field: processing.state, value: done}
          - rx: {field: payload.id, value: "^[A-Z]{3}-[0-9]{4}$"}
    response:
      file: done.json
  - name: any-status
    path: /api/v1/status
    method: POST
    response:
      file: fallback.json
"#,
        )
        .unwrap();

        let hit = set
            .match_response(
                b"/api/v1/status",
                b"POST",
                br#"{"processing":{"state":"done"},"payload":{"id":"ABC-1234"}}"#,
            )
            .unwrap();
        assert_eq!(hit.mock_id, "done-status");

        let hit = set
            .match_response(
                b"/api/v1/status",
                b"POST",
                br#"{"processing":{"state":"pending"}}"#,
            )
            .unwrap();
        assert_eq!(hit.mock_id, "any-status");

        // Non-JSON bodies skip the filtered scenario but hit the open one.
        let hit = set
            .match_response(b"/api/v1/status", b"POST", b"not json")
            .unwrap();
        assert_eq!(hit.mock_id, "any-status");

        assert!(set.match_response(b"/other", b"POST", b"{}").is_none());
        assert!(set
            .match_response(b"/api/v1/status", b"GET", b"{}")
            .is_none());
    }

    #[test]
    fn scenario_identity_overrides_record_identity() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "r.json", status_record("done"));

        let set = load(
            dir.path(),
            "scenarios:\n  - name: renamed\n    path: /declared\n    response:\n      file: r.json\n",
        )
        .unwrap();

        let scenario = &set.scenarios()[0];
        assert_eq!(scenario.response.path, "/declared");
        assert_eq!(scenario.response.full_url, "/declared");
        assert_eq!(scenario.response.mock_id, "renamed");
        // Method falls back to the record's, upper-cased.
        assert_eq!(scenario.response.method, "POST");
    }

    #[test]
    fn delay_override_rescales_sse_timestamps_proportionally() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "stream.json", sse_record(5.0));

        let set = load(
            dir.path(),
            "scenarios:\n  - name: fast\n    path: /stream\n    response:\n      file: stream.json\n      delay: 1.0\n",
        )
        .unwrap();

        let response = &set.scenarios()[0].response;
        assert_eq!(response.delay, 1.0);
        let expected = [0.02, 0.04, 0.06, 0.08, 0.10];
        for (event, want) in response.sse_events.iter().zip(expected) {
            assert!(
                (event.timestamp - want).abs() < 1e-6,
                "timestamp {} != {want}",
                event.timestamp
            );
        }
        let max = response
            .sse_events
            .iter()
            .map(|e| e.timestamp)
            .fold(0.0, f64::max);
        assert!((max - 0.10).abs() < 1e-6);
    }

    #[test]
    fn delay_override_on_non_sse_just_replaces_delay() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "r.json", status_record("done"));

        let set = load(
            dir.path(),
            "scenarios:\n  - name: slow\n    path: /x\n    response:\n      file: r.json\n      delay: 2.5\n",
        )
        .unwrap();
        assert_eq!(set.scenarios()[0].response.delay, 2.5);
    }

    #[test]
    fn configuration_errors_are_fatal() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), "r.json", status_record("done"));

        assert!(matches!(
            load(dir.path(), "scenarios: []"),
            Err(ScenarioError::Empty(_))
        ));
        assert!(matches!(
            load(
                dir.path(),
                "scenarios:\n  - path: /x\n    response:\n      file: r.json\n"
            ),
            Err(ScenarioError::MissingField { field: "name", .. })
        ));
        assert!(matches!(
            load(
                dir.path(),
                "scenarios:\n  - name: a\n    response:\n      file: r.json\n"
            ),
            Err(ScenarioError::MissingField { field: "path", .. })
        ));
        assert!(matches!(
            load(dir.path(), "scenarios:\n  - name: a\n    path: /x\n"),
            Err(ScenarioError::MissingField {
                field: "response.file",
                ..
            })
        ));
        assert!(matches!(
            load(
                dir.path(),
                "scenarios:\n  - name: a\n    path: /x\n    response:\n      file: nope.json\n"
            ),
            Err(ScenarioError::LoadResponse { .. })
        ));
        assert!(matches!(
            load(
                dir.path(),
                r#"
scenarios:
  - name: a
    path: /x
    filter:
      body:
        rx: {field: id, value: "["}
    response:
      file: r.json
"#
            ),
            Err(ScenarioError::InvalidFilter { .. })
        ));
    }
}
