use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::error::{AppError, AppResult};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Stable identity of an API object inside the cluster-state cache.
///
/// Rendered to a `name=..;group=..;kind=..;version=..;namespace=..` string
/// for use as a map key; `parse` is the exact inverse.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    pub name: String,
    pub group: String,
    pub kind: String,
    pub version: String,
    pub namespace: String,
}

impl ResourceIdentifier {
    pub fn new(name: &str, group: &str, kind: &str, version: &str, namespace: &str) -> Self {
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            namespace
        };

        ResourceIdentifier {
            name: name.to_string(),
            group: group.to_string(),
            kind: kind.to_string(),
            version: version.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Identifier of a decoded object. `fallback_namespace` applies when the
    /// manifest carries no `metadata.namespace`.
    pub fn from_object(obj: &DynamicObject, fallback_namespace: &str) -> AppResult<Self> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| AppError::Decode("metadata.name required".to_string()))?;
        let (group, version, kind) = object_gvk(obj)?;
        let namespace = obj
            .namespace()
            .unwrap_or_else(|| fallback_namespace.to_string());

        Ok(ResourceIdentifier::new(
            &name, &group, &kind, &version, &namespace,
        ))
    }

    pub fn key(&self) -> String {
        format!(
            "name={};group={};kind={};version={};namespace={}",
            self.name, self.group, self.kind, self.version, self.namespace
        )
    }

    /// Inverse of `key`. Returns `None` for anything that is not a rendered key.
    pub fn parse(key: &str) -> Option<Self> {
        let mut name = None;
        let mut group = None;
        let mut kind = None;
        let mut version = None;
        let mut namespace = None;

        for part in key.split(';') {
            let (field, value) = part.split_once('=')?;
            match field {
                "name" => name = Some(value),
                "group" => group = Some(value),
                "kind" => kind = Some(value),
                "version" => version = Some(value),
                "namespace" => namespace = Some(value),
                _ => return None,
            }
        }

        Some(ResourceIdentifier {
            name: name?.to_string(),
            group: group?.to_string(),
            kind: kind?.to_string(),
            version: version?.to_string(),
            namespace: namespace?.to_string(),
        })
    }
}

impl std::fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// One entry of an object's `metadata.ownerReferences`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceOwner {
    pub name: String,
    pub kind: String,
    pub api_version: String,
    pub is_controller: bool,
}

/// Cache entry: identity plus the metadata this system tracks about an object
#[derive(Clone, Debug)]
pub struct Resource {
    pub identifier: ResourceIdentifier,
    /// Plural REST path segment (e.g. `deployments`), required by the dynamic client
    pub resource_name: String,
    /// True iff the object carries the `circlerr.io/controlled-by` annotation
    pub is_managed: bool,
    pub owners: Vec<ResourceOwner>,
    /// Full object graph; populated for managed resources and for any object
    /// delivered by a watch event or acknowledged by the executor
    pub object: Option<DynamicObject>,
}

impl Resource {
    pub fn from_object(
        obj: &DynamicObject,
        fallback_namespace: &str,
        resource_name: &str,
        is_managed: bool,
    ) -> AppResult<Self> {
        let identifier = ResourceIdentifier::from_object(obj, fallback_namespace)?;
        let owners = object_owners(obj);

        Ok(Resource {
            identifier,
            resource_name: resource_name.to_string(),
            is_managed,
            owners,
            object: Some(obj.clone()),
        })
    }

    pub fn key(&self) -> String {
        self.identifier.key()
    }

    /// A controller-owned object must never be orphan-deleted
    pub fn has_controller_owner(&self) -> bool {
        self.owners.iter().any(|o| o.is_controller)
    }

    pub fn without_object(mut self) -> Self {
        self.object = None;
        self
    }
}

/// Split an object's `apiVersion`/`kind` into `(group, version, kind)`
pub fn object_gvk(obj: &DynamicObject) -> AppResult<(String, String, String)> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| AppError::Decode("missing apiVersion/kind on object".to_string()))?;

    let (group, version) = match types.api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        // core group, e.g. apiVersion: v1
        None => (String::new(), types.api_version.clone()),
    };

    Ok((group, version, types.kind.clone()))
}

fn object_owners(obj: &DynamicObject) -> Vec<ResourceOwner> {
    let Some(refs) = &obj.metadata.owner_references else {
        return Vec::new();
    };

    refs.iter()
        .map(|o| ResourceOwner {
            name: o.name.clone(),
            kind: o.kind.clone(),
            api_version: o.api_version.clone(),
            is_controller: o.controller.unwrap_or(false),
        })
        .collect()
}
