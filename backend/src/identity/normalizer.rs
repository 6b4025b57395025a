//! Workflow definition normalization.
//!
//! A definition is normalized before hashing: runtime-assigned and cosmetic
//! fields are dropped, physical credential references become logical keys,
//! and unordered collections are sorted. Two definitions are the same
//! workflow exactly when their normalized trees are equal.

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

use super::hash::canonical_json;
use flowops_shared::logical_key;

/// Top-level fields assigned by the runtime or carrying per-environment state
const VOLATILE_WORKFLOW_FIELDS: &[&str] = &[
    "id",
    "createdAt",
    "updatedAt",
    "versionId",
    "active",
    "meta",
    "pinData",
    "staticData",
    "triggerCount",
    "shared",
    "tags",
    "isArchived",
    "hash",
];

/// `settings.errorWorkflow` points at a runtime workflow id
const VOLATILE_SETTINGS_FIELDS: &[&str] = &["errorWorkflow"];

const VOLATILE_NODE_FIELDS: &[&str] = &["id", "webhookId", "position", "notes", "notesInFlow"];

/// Field used by portable (Git-stored) definitions in place of `id`/`name`
const LOGICAL_FIELD: &str = "logical";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("workflow definition must be a JSON object")]
    NotAnObject,
    #[error("workflow definition has no `nodes` array")]
    MissingNodes,
    #[error("node at index {0} is not an object with a string `name`")]
    InvalidNode(usize),
    #[error("node '{0}' has a malformed credentials block")]
    MalformedCredentials(String),
    #[error("node '{node}' references credential type '{credential_type}' with no substitution")]
    UnresolvedCredential { node: String, credential_type: String },
}

/// A credential referenced by one node of a definition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialRef {
    pub node_name: String,
    pub credential_type: String,
    pub physical_id: Option<String>,
    pub physical_name: String,
    /// Present when the definition is already in portable form
    pub logical_key: Option<String>,
}

impl CredentialRef {
    /// Key identifying the referenced credential inside its own environment
    pub fn source_key(&self) -> String {
        if let Some(key) = &self.logical_key {
            format!("logical:{}", key)
        } else if let Some(id) = &self.physical_id {
            format!("id:{}", id)
        } else {
            format!("name:{}", self.physical_name)
        }
    }
}

/// Physical credential id → logical key lookup for one environment
#[derive(Debug, Clone, Default)]
pub struct CredentialKeyMap {
    by_physical: HashMap<(String, String), String>,
}

impl CredentialKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        credential_type: impl Into<String>,
        physical_id: impl Into<String>,
        logical_key: impl Into<String>,
    ) {
        self.by_physical
            .insert((credential_type.into(), physical_id.into()), logical_key.into());
    }

    /// Logical key for a reference; falls back to `"<type>:<name>"` when unmapped
    pub fn resolve(&self, credential: &CredentialRef) -> String {
        if let Some(key) = &credential.logical_key {
            return key.clone();
        }
        credential
            .physical_id
            .as_ref()
            .and_then(|id| {
                self.by_physical
                    .get(&(credential.credential_type.clone(), id.clone()))
            })
            .cloned()
            .unwrap_or_else(|| logical_key(&credential.credential_type, &credential.physical_name))
    }

    pub fn len(&self) -> usize {
        self.by_physical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_physical.is_empty()
    }
}

/// Target-environment credential for one source reference
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    pub physical_id: String,
    pub physical_name: String,
}

/// Substitutions keyed by `(credential type, CredentialRef::source_key)`
pub type CredentialSubstitutions = HashMap<(String, String), Substitution>;

fn nodes_of(definition: &Value) -> Result<&Vec<Value>, NormalizeError> {
    let obj = definition.as_object().ok_or(NormalizeError::NotAnObject)?;
    obj.get("nodes")
        .and_then(Value::as_array)
        .ok_or(NormalizeError::MissingNodes)
}

fn node_name(node: &Value, index: usize) -> Result<&str, NormalizeError> {
    node.as_object()
        .and_then(|n| n.get("name"))
        .and_then(Value::as_str)
        .ok_or(NormalizeError::InvalidNode(index))
}

fn parse_credential(
    node_name: &str,
    credential_type: &str,
    value: &Value,
) -> Result<CredentialRef, NormalizeError> {
    let malformed = || NormalizeError::MalformedCredentials(node_name.to_string());

    let credential = match value {
        // Older exports carry only the credential name
        Value::String(name) => CredentialRef {
            node_name: node_name.to_string(),
            credential_type: credential_type.to_string(),
            physical_id: None,
            physical_name: name.clone(),
            logical_key: None,
        },
        Value::Object(fields) => {
            let logical = fields
                .get(LOGICAL_FIELD)
                .and_then(Value::as_str)
                .map(str::to_string);
            let physical_id = match fields.get("id") {
                Some(Value::String(id)) => Some(id.clone()),
                Some(Value::Number(id)) => Some(id.to_string()),
                Some(Value::Null) | None => None,
                Some(_) => return Err(malformed()),
            };
            let physical_name = fields
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string);

            if logical.is_none() && physical_name.is_none() {
                return Err(malformed());
            }

            CredentialRef {
                node_name: node_name.to_string(),
                credential_type: credential_type.to_string(),
                physical_id,
                physical_name: physical_name.unwrap_or_default(),
                logical_key: logical,
            }
        }
        _ => return Err(malformed()),
    };

    Ok(credential)
}

fn node_credentials(node: &Value, name: &str) -> Result<Vec<CredentialRef>, NormalizeError> {
    match node.get("credentials") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(entries)) => entries
            .iter()
            .map(|(credential_type, value)| parse_credential(name, credential_type, value))
            .collect(),
        Some(_) => Err(NormalizeError::MalformedCredentials(name.to_string())),
    }
}

/// Every credential reference in a raw definition, in node order
pub fn credential_refs(definition: &Value) -> Result<Vec<CredentialRef>, NormalizeError> {
    let mut refs = Vec::new();
    for (index, node) in nodes_of(definition)?.iter().enumerate() {
        let name = node_name(node, index)?;
        refs.extend(node_credentials(node, name)?);
    }
    Ok(refs)
}

fn normalize_node(
    node: &Value,
    index: usize,
    keys: &CredentialKeyMap,
) -> Result<Value, NormalizeError> {
    let name = node_name(node, index)?;
    let fields = node.as_object().ok_or(NormalizeError::InvalidNode(index))?;

    let mut out = Map::new();
    for (key, value) in fields {
        if VOLATILE_NODE_FIELDS.contains(&key.as_str()) || key == "credentials" {
            continue;
        }
        out.insert(key.clone(), value.clone());
    }

    let credentials = node_credentials(node, name)?;
    if !credentials.is_empty() {
        let logical: Map<String, Value> = credentials
            .iter()
            .map(|c| (c.credential_type.clone(), Value::String(keys.resolve(c))))
            .collect();
        out.insert("credentials".to_string(), Value::Object(logical));
    }

    Ok(Value::Object(out))
}

fn node_sort_key(node: &Value) -> (String, String) {
    let field = |name: &str| {
        node.get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    (field("name"), field("type"))
}

/// Targets of one output are a set; output positions are not.
fn normalize_connections(connections: &Value) -> Value {
    let Some(sources) = connections.as_object() else {
        return connections.clone();
    };

    let mut out = Map::new();
    for (source, by_type) in sources {
        let Some(by_type) = by_type.as_object() else {
            out.insert(source.clone(), by_type.clone());
            continue;
        };
        let mut types = Map::new();
        for (connection_type, outputs) in by_type {
            let normalized = match outputs.as_array() {
                Some(outputs) => Value::Array(
                    outputs
                        .iter()
                        .map(|targets| match targets.as_array() {
                            Some(targets) => {
                                let mut targets = targets.clone();
                                targets.sort_by_cached_key(canonical_json);
                                Value::Array(targets)
                            }
                            None => targets.clone(),
                        })
                        .collect(),
                ),
                None => outputs.clone(),
            };
            types.insert(connection_type.clone(), normalized);
        }
        out.insert(source.clone(), Value::Object(types));
    }
    Value::Object(out)
}

fn normalize_settings(settings: &Value) -> Value {
    match settings.as_object() {
        Some(fields) => Value::Object(
            fields
                .iter()
                .filter(|(k, _)| !VOLATILE_SETTINGS_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => settings.clone(),
    }
}

/// Produce the normalized tree that defines workflow identity.
pub fn normalize(definition: &Value, keys: &CredentialKeyMap) -> Result<Value, NormalizeError> {
    let fields = definition.as_object().ok_or(NormalizeError::NotAnObject)?;
    let nodes = nodes_of(definition)?;

    let mut normalized_nodes = nodes
        .iter()
        .enumerate()
        .map(|(index, node)| normalize_node(node, index, keys))
        .collect::<Result<Vec<_>, _>>()?;
    normalized_nodes.sort_by_cached_key(node_sort_key);

    let mut out = Map::new();
    for (key, value) in fields {
        if VOLATILE_WORKFLOW_FIELDS.contains(&key.as_str()) {
            continue;
        }
        let normalized = match key.as_str() {
            "nodes" => continue,
            // Casing is display-only
            "name" => match value.as_str() {
                Some(name) => Value::String(name.trim().to_lowercase()),
                None => value.clone(),
            },
            "connections" => normalize_connections(value),
            "settings" => normalize_settings(value),
            _ => value.clone(),
        };
        out.insert(key.clone(), normalized);
    }
    out.insert("nodes".to_string(), Value::Array(normalized_nodes));

    Ok(Value::Object(out))
}

fn rewrite_credentials<F>(definition: &Value, mut rewrite: F) -> Result<Value, NormalizeError>
where
    F: FnMut(&CredentialRef) -> Result<Value, NormalizeError>,
{
    let mut out = definition.clone();
    let nodes = out
        .get_mut("nodes")
        .and_then(Value::as_array_mut)
        .ok_or(NormalizeError::MissingNodes)?;

    for (index, node) in nodes.iter_mut().enumerate() {
        let name = node_name(node, index)?.to_string();
        let credentials = node_credentials(node, &name)?;
        if credentials.is_empty() {
            continue;
        }
        let mut rewritten = Map::new();
        for credential in &credentials {
            rewritten.insert(credential.credential_type.clone(), rewrite(credential)?);
        }
        if let Some(fields) = node.as_object_mut() {
            fields.insert("credentials".to_string(), Value::Object(rewritten));
        }
    }
    Ok(out)
}

/// Git-stored form: runtime ids dropped, credentials carried as logical keys.
pub fn portable_definition(
    definition: &Value,
    keys: &CredentialKeyMap,
) -> Result<Value, NormalizeError> {
    let mut out = rewrite_credentials(definition, |credential| {
        let mut entry = Map::new();
        entry.insert(LOGICAL_FIELD.to_string(), Value::String(keys.resolve(credential)));
        Ok(Value::Object(entry))
    })?;

    if let Some(fields) = out.as_object_mut() {
        fields.retain(|k, _| !VOLATILE_WORKFLOW_FIELDS.contains(&k.as_str()));
    }
    Ok(out)
}

/// Rewrite credential references for the target environment.
///
/// Every reference must have a substitution; a missing one is an error rather
/// than a silently dangling credential.
pub fn substitute_credentials(
    definition: &Value,
    substitutions: &CredentialSubstitutions,
) -> Result<Value, NormalizeError> {
    rewrite_credentials(definition, |credential| {
        let key = (credential.credential_type.clone(), credential.source_key());
        let target = substitutions
            .get(&key)
            .ok_or_else(|| NormalizeError::UnresolvedCredential {
                node: credential.node_name.clone(),
                credential_type: credential.credential_type.clone(),
            })?;
        let mut entry = Map::new();
        entry.insert("id".to_string(), Value::String(target.physical_id.clone()));
        entry.insert("name".to_string(), Value::String(target.physical_name.clone()));
        Ok(Value::Object(entry))
    })
}
