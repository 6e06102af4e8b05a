//! Resource definitions and the immutable, revision-bound [`ManifestSet`].

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Label stamped onto every resource applied on behalf of an application.
/// Only resources carrying it are ever considered orphans of that application.
pub const TRACKING_LABEL: &str = "fleetsync.io/application";

/// Whether objects of a kind live inside a namespace, as reported by the
/// cluster serving the kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceScope {
    #[default]
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKind {
    pub api_version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        ResourceKind {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Splits `apps/v1` into `("apps", "v1")`, and the core `v1` into `("", "v1")`.
    pub fn group_version(&self) -> (&str, &str) {
        self.api_version
            .split_once('/')
            .unwrap_or(("", self.api_version.as_str()))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{namespace}/{}", self.kind.kind, self.name),
            None => write!(f, "{}/{}", self.kind.kind, self.name),
        }
    }
}

/// A single declarative object together with its identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Resource {
    key: ResourceKey,
    body: Value,
}

impl Resource {
    /// Validates that the object carries `apiVersion`, `kind` and `metadata.name`.
    pub fn from_value(body: Value) -> Result<Self, String> {
        let text = |pointer: &str| {
            body.pointer(pointer)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let api_version = text("/apiVersion").ok_or("missing apiVersion")?;
        let kind = text("/kind").ok_or("missing kind")?;
        let name = text("/metadata/name").ok_or("missing metadata.name")?;
        let namespace = text("/metadata/namespace");

        Ok(Resource {
            key: ResourceKey {
                kind: ResourceKind::new(api_version, kind),
                namespace,
                name,
            },
            body,
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.key.kind
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn label(&self, label: &str) -> Option<&str> {
        self.body
            .get("metadata")
            .and_then(|metadata| metadata.get("labels"))
            .and_then(|labels| labels.get(label))
            .and_then(Value::as_str)
    }

    /// Places a resource without an explicit namespace into `namespace`.
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        if self.key.namespace.is_none() {
            if let Some(metadata) = self.metadata_mut() {
                metadata.insert("namespace".to_string(), Value::from(namespace));
                self.key.namespace = Some(namespace.to_string());
            }
        }
        self
    }

    /// Drops any namespace, the way the API server does for cluster-scoped kinds.
    pub fn without_namespace(mut self) -> Self {
        if self.key.namespace.take().is_some() {
            if let Some(metadata) = self.metadata_mut() {
                metadata.remove("namespace");
            }
        }
        self
    }

    pub fn with_label(mut self, label: &str, value: &str) -> Self {
        if let Some(metadata) = self.metadata_mut() {
            let labels = metadata
                .entry("labels")
                .or_insert_with(|| Value::Object(Map::new()));
            if !labels.is_object() {
                *labels = Value::Object(Map::new());
            }
            if let Some(labels) = labels.as_object_mut() {
                labels.insert(label.to_string(), Value::from(value));
            }
        }
        self
    }

    // `from_value` guarantees that metadata is a mapping.
    fn metadata_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.body.get_mut("metadata").and_then(Value::as_object_mut)
    }
}

impl TryFrom<Value> for Resource {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Resource::from_value(value)
    }
}

impl From<Resource> for Value {
    fn from(resource: Resource) -> Self {
        resource.body
    }
}

/// Ordered resource definitions resolved from a single source revision.
///
/// A manifest set is never edited in place: binding it to a destination
/// produces a new set.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestSet {
    revision: String,
    resources: Vec<Resource>,
}

impl ManifestSet {
    pub fn new(revision: impl Into<String>, resources: Vec<Resource>) -> Self {
        ManifestSet {
            revision: revision.into(),
            resources,
        }
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn kinds(&self) -> BTreeSet<ResourceKind> {
        self.resources
            .iter()
            .map(|resource| resource.kind().clone())
            .collect()
    }

    /// Canonical serialization of the set, used to compare fetches byte-for-byte.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let bodies: Vec<&Value> = self.resources.iter().map(Resource::body).collect();
        let document = serde_json::json!({
            "revision": self.revision,
            "resources": bodies,
        });

        document.to_string().into_bytes()
    }

    /// Produces the set as it should exist for one application: namespaced
    /// resources are defaulted into `namespace`, cluster-scoped ones lose any
    /// namespace, and every resource is labelled as owned by `application`.
    ///
    /// Kinds missing from `scopes` are treated as namespaced.
    pub fn bind(
        &self,
        application: &str,
        namespace: &str,
        scopes: &BTreeMap<ResourceKind, ResourceScope>,
    ) -> Result<ManifestSet, SyncError> {
        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(self.resources.len());

        for resource in &self.resources {
            let scope = scopes.get(resource.kind()).copied().unwrap_or_default();
            let resource = match scope {
                ResourceScope::Namespaced => resource.clone().in_namespace(namespace),
                ResourceScope::Cluster => resource.clone().without_namespace(),
            }
            .with_label(TRACKING_LABEL, application);

            if !seen.insert(resource.key().clone()) {
                return Err(SyncError::ParseError {
                    file: format!("revision {}", self.revision),
                    reason: format!("resource {} is declared more than once", resource.key()),
                });
            }
            resources.push(resource);
        }

        Ok(ManifestSet::new(self.revision.clone(), resources))
    }
}

/// Parses every YAML (or JSON) document in `text` into resources.
///
/// Empty and `null` documents are skipped and `kind: List` documents are
/// flattened into their items.
pub fn parse_documents(file: &str, text: &str) -> Result<Vec<Resource>, SyncError> {
    let parse_error = |reason: String| SyncError::ParseError {
        file: file.to_string(),
        reason,
    };

    let mut resources = Vec::new();

    for document in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(document).map_err(|e| parse_error(e.to_string()))?;

        let objects = match value {
            Value::Null => continue,
            Value::Object(_) if is_list(&value) => match value.get("items") {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(_) => return Err(parse_error("List items must be a sequence".to_string())),
            },
            Value::Object(_) => vec![value],
            other => {
                return Err(parse_error(format!(
                    "expected a mapping, found {}",
                    type_name(&other)
                )))
            }
        };

        for object in objects {
            resources.push(Resource::from_value(object).map_err(parse_error)?);
        }
    }

    Ok(resources)
}

fn is_list(value: &Value) -> bool {
    value.get("kind").and_then(Value::as_str) == Some("List")
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}
