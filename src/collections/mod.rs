//! # Collections
//!
//! A collection is a tree of folders and requests. Before a run the tree is
//! flattened into [`RunnableItem`]s, each carrying everything it inherits
//! from its ancestors: auth, protocol profile and scripts.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::AuthConfig;
use crate::environment::VariableList;
use crate::http::policy::ProtocolProfile;
use crate::http::request::RequestDefinition;
use crate::scripts::EventScript;

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("Failed to read collection `{path}`: {reason}")]
    Read { path: String, reason: String },
    #[error("Invalid collection: {0}")]
    Parse(String),
    #[error("Unable to find a folder or request: {0}")]
    UnknownEntrypoint(String),
}

// ─── Tree ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    #[serde(default, alias = "_postman_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    #[serde(default)]
    pub info: CollectionInfo,
    #[serde(default, alias = "variable")]
    pub variables: VariableList,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default, alias = "event")]
    pub events: Vec<EventScript>,
    #[serde(default)]
    pub protocol_profile: ProtocolProfile,
    #[serde(default, alias = "item")]
    pub items: Vec<CollectionItem>,
}

/// A folder is recognised by its `items` list; anything with a `request`
/// is a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionItem {
    Folder(Folder),
    Request(RequestItem),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "item")]
    pub items: Vec<CollectionItem>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default, alias = "event")]
    pub events: Vec<EventScript>,
    #[serde(default)]
    pub protocol_profile: ProtocolProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub request: RequestDefinition,
    #[serde(default, alias = "event")]
    pub events: Vec<EventScript>,
    #[serde(default)]
    pub protocol_profile: ProtocolProfile,
}

impl CollectionItem {
    pub fn id(&self) -> &str {
        match self {
            CollectionItem::Folder(folder) => &folder.id,
            CollectionItem::Request(request) => &request.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CollectionItem::Folder(folder) => &folder.name,
            CollectionItem::Request(request) => &request.name,
        }
    }

    fn children(&self) -> &[CollectionItem] {
        match self {
            CollectionItem::Folder(folder) => &folder.items,
            CollectionItem::Request(_) => &[],
        }
    }

    fn assign_ids(&mut self) {
        match self {
            CollectionItem::Folder(folder) => {
                fill_id(&mut folder.id);
                folder.items.iter_mut().for_each(CollectionItem::assign_ids);
            }
            CollectionItem::Request(request) => fill_id(&mut request.id),
        }
    }
}

fn fill_id(id: &mut String) {
    if id.trim().is_empty() {
        *id = Uuid::new_v4().to_string();
    }
}

// ─── Entrypoint ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntrypointLookup {
    /// First folder or request whose id, then name, matches the target.
    #[default]
    IdOrName,
    /// Names from the root down to the target.
    Path,
    /// Every target looked up by id or name.
    MultipleIdOrName,
}

/// Part of the collection to run instead of the whole tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entrypoint {
    pub targets: Vec<String>,
    #[serde(default)]
    pub lookup: EntrypointLookup,
    /// Run multiple targets in the order given rather than collection order.
    #[serde(default)]
    pub follow_order: bool,
}

impl Entrypoint {
    pub fn id_or_name(target: impl Into<String>) -> Self {
        Self {
            targets: vec![target.into()],
            ..Default::default()
        }
    }
}

// ─── Flattening ─────────────────────────────────────────────────

/// A request with everything inherited from its ancestors resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnableItem {
    pub id: String,
    pub name: String,
    /// Folder ids from the root down to the item's parent.
    pub folder_ids: Vec<String>,
    pub folder_names: Vec<String>,
    pub request: RequestDefinition,
    /// `None` when nothing applies or an explicit `noauth` stopped
    /// inheritance.
    pub auth: Option<AuthConfig>,
    pub protocol_profile: ProtocolProfile,
    /// Collection scripts first, then folders outer to inner, then the item.
    pub scripts: Vec<(String, EventScript)>,
}

impl RunnableItem {
    /// `Folder/Sub/Request` for display.
    pub fn path(&self) -> String {
        let mut parts = self.folder_names.clone();
        parts.push(self.name.clone());
        parts.join("/")
    }

    fn within(&self, node_id: &str) -> bool {
        self.id == node_id || self.folder_ids.iter().any(|id| id == node_id)
    }
}

struct Ancestry<'a> {
    ids: Vec<String>,
    names: Vec<String>,
    auth: Option<&'a AuthConfig>,
    profile: ProtocolProfile,
    scripts: Vec<(String, EventScript)>,
}

impl Collection {
    pub fn from_json(raw: &str) -> Result<Self, CollectionError> {
        let mut collection: Collection =
            serde_json::from_str(raw).map_err(|err| CollectionError::Parse(err.to_string()))?;
        fill_id(&mut collection.info.id);
        collection.items.iter_mut().for_each(CollectionItem::assign_ids);
        Ok(collection)
    }

    pub fn load(path: &Path) -> Result<Self, CollectionError> {
        let raw = fs::read_to_string(path).map_err(|err| CollectionError::Read {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        Self::from_json(&raw)
    }

    /// Every request in depth-first declaration order.
    pub fn flatten(&self) -> Vec<RunnableItem> {
        let root = Ancestry {
            ids: Vec::new(),
            names: Vec::new(),
            auth: self.auth.as_ref(),
            profile: self.protocol_profile.clone(),
            scripts: self
                .events
                .iter()
                .map(|script| ("collection".to_string(), script.clone()))
                .collect(),
        };
        let mut out = Vec::new();
        flatten_into(&self.items, &root, &mut out);
        out
    }

    /// The requests selected by `entrypoint`, or every request when it is
    /// `None`.
    pub fn runnable_items(&self, entrypoint: Option<&Entrypoint>) -> Result<Vec<RunnableItem>, CollectionError> {
        let all = self.flatten();
        let Some(entrypoint) = entrypoint else {
            return Ok(all);
        };

        match entrypoint.lookup {
            EntrypointLookup::IdOrName => {
                let target = entrypoint
                    .targets
                    .first()
                    .ok_or_else(|| CollectionError::UnknownEntrypoint("no target given".into()))?;
                let id = self.find_id_or_name(target)?;
                Ok(all.into_iter().filter(|item| item.within(&id)).collect())
            }
            EntrypointLookup::Path => {
                let id = self.find_path(&entrypoint.targets)?;
                Ok(all.into_iter().filter(|item| item.within(&id)).collect())
            }
            EntrypointLookup::MultipleIdOrName => {
                let ids = entrypoint
                    .targets
                    .iter()
                    .map(|target| self.find_id_or_name(target))
                    .collect::<Result<Vec<_>, _>>()?;
                if entrypoint.follow_order {
                    let mut selected: Vec<RunnableItem> = Vec::new();
                    for id in &ids {
                        for item in all.iter().filter(|item| item.within(id)) {
                            if !selected.iter().any(|s| s.id == item.id) {
                                selected.push(item.clone());
                            }
                        }
                    }
                    Ok(selected)
                } else {
                    Ok(all
                        .into_iter()
                        .filter(|item| ids.iter().any(|id| item.within(id)))
                        .collect())
                }
            }
        }
    }

    fn find_id_or_name(&self, target: &str) -> Result<String, CollectionError> {
        find_node(&self.items, &|node| node.id() == target)
            .or_else(|| find_node(&self.items, &|node| node.name() == target))
            .map(|node| node.id().to_string())
            .ok_or_else(|| CollectionError::UnknownEntrypoint(target.to_string()))
    }

    fn find_path(&self, names: &[String]) -> Result<String, CollectionError> {
        let mut level: &[CollectionItem] = &self.items;
        let mut found: Option<&CollectionItem> = None;
        for name in names {
            let node = level
                .iter()
                .find(|node| node.name() == name)
                .ok_or_else(|| CollectionError::UnknownEntrypoint(names.join("/")))?;
            level = node.children();
            found = Some(node);
        }
        found
            .map(|node| node.id().to_string())
            .ok_or_else(|| CollectionError::UnknownEntrypoint("empty path".into()))
    }
}

fn find_node<'a>(
    items: &'a [CollectionItem],
    matches: &dyn Fn(&CollectionItem) -> bool,
) -> Option<&'a CollectionItem> {
    for item in items {
        if matches(item) {
            return Some(item);
        }
        if let Some(found) = find_node(item.children(), matches) {
            return Some(found);
        }
    }
    None
}

fn flatten_into(items: &[CollectionItem], parent: &Ancestry<'_>, out: &mut Vec<RunnableItem>) {
    for item in items {
        match item {
            CollectionItem::Folder(folder) => {
                let mut ids = parent.ids.clone();
                ids.push(folder.id.clone());
                let mut names = parent.names.clone();
                names.push(folder.name.clone());
                let mut scripts = parent.scripts.clone();
                scripts.extend(
                    folder
                        .events
                        .iter()
                        .map(|script| (format!("folder \"{}\"", folder.name), script.clone())),
                );
                let ancestry = Ancestry {
                    ids,
                    names,
                    auth: folder.auth.as_ref().or(parent.auth),
                    profile: parent.profile.merge(&folder.protocol_profile),
                    scripts,
                };
                flatten_into(&folder.items, &ancestry, out);
            }
            CollectionItem::Request(request) => {
                let auth = request.request.auth.as_ref().or(parent.auth);
                let mut scripts = parent.scripts.clone();
                scripts.extend(
                    request
                        .events
                        .iter()
                        .map(|script| (format!("item \"{}\"", request.name), script.clone())),
                );
                out.push(RunnableItem {
                    id: request.id.clone(),
                    name: request.name.clone(),
                    folder_ids: parent.ids.clone(),
                    folder_names: parent.names.clone(),
                    request: request.request.clone(),
                    auth: auth.filter(|a| !matches!(a, AuthConfig::Noauth)).cloned(),
                    protocol_profile: parent.profile.merge(&request.protocol_profile),
                    scripts,
                });
            }
        }
    }
}
