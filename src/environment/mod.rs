//! # Variables & Scopes
//!
//! Layered variable scopes used while a collection runs. Lookups walk the
//! scopes from the most specific to the least specific:
//! local > data > environment > collection > globals.
//!
//! `{{name}}` placeholders are replaced repeatedly so a variable may refer
//! to another one. Unknown placeholders are left untouched.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Upper bound on nested `{{var}}` expansion passes.
const MAX_RESOLVE_DEPTH: usize = 19;

/// Scope at which a variable is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VariableScope {
    Local,
    Data,
    Environment,
    Collection,
    Globals,
}

/// A single variable entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Variable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

/// Ordered list of variables belonging to one scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableList {
    variables: Vec<Variable>,
}

impl VariableList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables
            .iter()
            .rev()
            .find(|v| v.enabled && !v.key.is_empty() && v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Insert or update `key`. The last entry for `key` keeps its place and
    /// is re-enabled; earlier duplicates are removed.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if key.is_empty() {
            return;
        }

        match self.variables.iter().rposition(|v| v.key == key) {
            Some(last) => {
                let existing = &mut self.variables[last];
                existing.value = value;
                existing.enabled = true;
                let mut index = 0;
                self.variables.retain(|v| {
                    let keep = v.key != key || index == last;
                    index += 1;
                    keep
                });
            }
            None => self.variables.push(Variable::new(key, value)),
        }
    }

    pub fn unset(&mut self, key: &str) -> bool {
        let before = self.variables.len();
        self.variables.retain(|v| v.key != key);
        before != self.variables.len()
    }

    pub fn clear(&mut self) {
        self.variables.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.iter()
    }

    /// Enabled, non-empty entries as a flat map. Later entries win.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for v in &self.variables {
            if v.enabled && !v.key.is_empty() {
                map.insert(v.key.clone(), v.value.clone());
            }
        }
        map
    }

    /// Build a scope from one row of iteration data. Non-string values are
    /// stored in their JSON form.
    pub fn from_data_row(row: &serde_json::Map<String, Value>) -> Self {
        let mut list = Self::new();
        for (key, value) in row {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            list.set(key.clone(), value);
        }
        list
    }
}

impl From<Vec<Variable>> for VariableList {
    fn from(variables: Vec<Variable>) -> Self {
        Self { variables }
    }
}

impl FromIterator<(String, String)> for VariableList {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut list = Self::new();
        for (key, value) in iter {
            list.set(key, value);
        }
        list
    }
}

/// An environment or globals file: a named set of variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "variables")]
    pub values: VariableList,
}

impl Environment {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read environment file `{}`: {e}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse environment file `{}`: {e}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let raw = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize environment: {e}"))?;
        fs::write(path, raw)
            .map_err(|e| format!("Failed to write environment file `{}`: {e}", path.display()))
    }
}

/// All variable scopes visible to a running item.
#[derive(Debug, Clone, Default)]
pub struct VariableScopes {
    pub globals: VariableList,
    pub collection: VariableList,
    pub environment: VariableList,
    pub data: VariableList,
    pub local: VariableList,
}

impl VariableScopes {
    pub fn scope(&self, scope: VariableScope) -> &VariableList {
        match scope {
            VariableScope::Local => &self.local,
            VariableScope::Data => &self.data,
            VariableScope::Environment => &self.environment,
            VariableScope::Collection => &self.collection,
            VariableScope::Globals => &self.globals,
        }
    }

    pub fn scope_mut(&mut self, scope: VariableScope) -> &mut VariableList {
        match scope {
            VariableScope::Local => &mut self.local,
            VariableScope::Data => &mut self.data,
            VariableScope::Environment => &mut self.environment,
            VariableScope::Collection => &mut self.collection,
            VariableScope::Globals => &mut self.globals,
        }
    }

    /// Look a variable up through every scope, most specific first.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.local
            .get(key)
            .or_else(|| self.data.get(key))
            .or_else(|| self.environment.get(key))
            .or_else(|| self.collection.get(key))
            .or_else(|| self.globals.get(key))
    }

    /// Flatten every scope into one map respecting precedence.
    pub fn resolve(&self) -> HashMap<String, String> {
        let mut resolved = self.globals.to_map();
        resolved.extend(self.collection.to_map());
        resolved.extend(self.environment.to_map());
        resolved.extend(self.data.to_map());
        resolved.extend(self.local.to_map());
        resolved
    }

    /// Replace `{{name}}` placeholders, following nested references.
    pub fn interpolate(&self, input: &str) -> String {
        if !input.contains("{{") {
            return input.to_string();
        }

        let mut current = input.to_string();
        for _ in 0..MAX_RESOLVE_DEPTH {
            let (next, replaced) = self.interpolate_once(&current);
            current = next;
            if !replaced {
                break;
            }
        }
        current
    }

    fn interpolate_once(&self, input: &str) -> (String, bool) {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        let mut replaced = false;

        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                break;
            };

            output.push_str(&rest[..start]);
            let name = after[..end].trim();
            match self.lookup(name) {
                Some(value) => {
                    output.push_str(&value);
                    replaced = true;
                }
                None => output.push_str(&rest[start..start + end + 4]),
            }
            rest = &after[end + 2..];
        }

        output.push_str(rest);
        (output, replaced)
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if name.starts_with('$') {
            return dynamic_value(name);
        }
        self.get(name).map(str::to_string)
    }
}

/// Values generated fresh on every reference.
fn dynamic_value(name: &str) -> Option<String> {
    match name {
        "$guid" | "$randomUUID" => Some(Uuid::new_v4().to_string()),
        "$timestamp" => Some(Utc::now().timestamp().to_string()),
        "$isoTimestamp" => Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        "$randomInt" => Some(rand::thread_rng().gen_range(0..1000).to_string()),
        _ => None,
    }
}
