use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collections::Entrypoint;
use crate::environment::VariableList;
use crate::http::policy::RequesterOptions;

/// Defaults shared by every run started from one [`super::Runner`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunnerOptions {
    pub requester: RequesterOptions,
}

/// Options for a single run. Every field has a default so a partial TOML
/// or JSON file is enough.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunOptions {
    /// Defaults to the number of data rows, or 1.
    pub iteration_count: Option<u32>,
    /// One row per iteration. Rows are reused cyclically when there are
    /// fewer rows than iterations.
    pub data: Vec<Map<String, Value>>,
    pub environment: VariableList,
    pub globals: VariableList,
    pub entrypoint: Option<Entrypoint>,

    pub stop_on_error: bool,
    pub stop_on_failure: bool,
    pub abort_on_error: bool,
    pub abort_on_failure: bool,

    pub global_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub item_delay_ms: u64,
    pub iteration_delay_ms: u64,

    /// Replaces the runner's requester defaults when set.
    pub requester: Option<RequesterOptions>,
}

impl RunOptions {
    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        toml::from_str(raw).map_err(|err| format!("Invalid run options: {err}"))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("Failed to read run options `{}`: {err}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw)
                .map_err(|err| format!("Invalid run options `{}`: {err}", path.display())),
            _ => Self::from_toml_str(&raw),
        }
    }

    pub fn iterations(&self) -> u32 {
        match self.iteration_count {
            Some(count) if count > 0 => count,
            _ => (self.data.len() as u32).max(1),
        }
    }

    pub fn data_row(&self, iteration: u32) -> Option<&Map<String, Value>> {
        if self.data.is_empty() {
            return None;
        }
        self.data.get(iteration as usize % self.data.len())
    }

    /// Load iteration data from a JSON array of objects.
    pub fn load_data(path: &Path) -> Result<Vec<Map<String, Value>>, String> {
        let raw = fs::read_to_string(path)
            .map_err(|err| format!("Failed to read iteration data `{}`: {err}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| format!("Invalid iteration data `{}`: {err}", path.display()))?;
        match value {
            Value::Array(rows) => rows
                .into_iter()
                .enumerate()
                .map(|(index, row)| match row {
                    Value::Object(map) => Ok(map),
                    _ => Err(format!("Iteration data row {index} is not an object")),
                })
                .collect(),
            _ => Err("Iteration data must be a JSON array of objects".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_toml() {
        let options = RunOptions::from_toml_str(
            r#"
            iterationCount = 3
            stopOnFailure = true
            itemDelayMs = 25

            [[environment]]
            key = "base"
            value = "http://localhost"

            [requester]
            followRedirects = false
            maxRedirects = 2

            [entrypoint]
            targets = ["Users"]
            "#,
        )
        .unwrap();

        assert_eq!(options.iterations(), 3);
        assert!(options.stop_on_failure);
        assert!(!options.abort_on_error);
        assert_eq!(options.item_delay_ms, 25);
        assert_eq!(options.environment.get("base"), Some("http://localhost"));
        let requester = options.requester.unwrap();
        assert!(!requester.follow_redirects);
        assert_eq!(requester.max_redirects, 2);
        assert!(requester.strict_ssl);
        assert_eq!(options.entrypoint.unwrap().targets, ["Users"]);
    }

    #[test]
    fn iterations_follow_data_rows() {
        let mut options = RunOptions::default();
        assert_eq!(options.iterations(), 1);
        assert!(options.data_row(0).is_none());

        let row = |n: i64| {
            let mut map = Map::new();
            map.insert("n".into(), Value::from(n));
            map
        };
        options.data = vec![row(1), row(2)];
        assert_eq!(options.iterations(), 2);
        options.iteration_count = Some(3);
        assert_eq!(options.data_row(2).unwrap()["n"], 1);
    }

    #[test]
    fn load_data_rejects_non_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, r#"[{"a":1}, 2]"#).unwrap();
        assert!(RunOptions::load_data(&path).is_err());

        fs::write(&path, r#"[{"a":1}, {"a":2}]"#).unwrap();
        assert_eq!(RunOptions::load_data(&path).unwrap().len(), 2);
    }
}
