use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer guarding the undeploy of a Circle's objects
pub const CIRCLE_FINALIZER: &str = "circlerr.io/finalizer";

/// A single key/value edit applied to a module's rendered templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct Override {
    pub key: String,
    pub value: String,
}

/// Reference to a Module plus the revision and edits this Circle pins
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct CircleModule {
    /// Name of the Module resource
    pub name: String,
    /// Namespace of the Module resource
    pub namespace: String,
    /// Git revision to deploy (optional; default branch tip when empty)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<Override>,
}

/// Key/value pair recorded on the Circle for its templates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CircleEnvironment {
    pub key: String,
    pub value: String,
}

/// Per-resource sync outcome
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CircleResourceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "syncTime")]
    pub synced_at: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "syncStatus"
    )]
    pub sync_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Module that produced a synced resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CircleResourceModule {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// One entry of `status.resources`
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CircleStatusResource {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub status: CircleResourceStatus,
    #[serde(default)]
    pub module: CircleResourceModule,
}

/// One entry of the bounded reconcile history
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CircleStatusHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "eventTime"
    )]
    pub event_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// Circle status information
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct CircleStatus {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "syncStatus"
    )]
    pub sync_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "syncTime")]
    pub synced_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<CircleStatusResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<CircleStatusHistory>,
}

/// The Circle CustomResource: a bundle of Modules reconciled as a unit
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "circlerr.io",
    version = "v1alpha1",
    kind = "Circle",
    shortname = "cir",
    namespaced,
    status = "CircleStatus",
    printcolumn = r#"{"name":"Target Namespace", "jsonPath":".spec.namespace", "type":"string"}"#,
    printcolumn = r#"{"name":"Sync Status", "jsonPath":".status.syncStatus", "type":"string"}"#,
    printcolumn = r#"{"name":"Synced At", "jsonPath":".status.syncTime", "type":"string"}"#
)]
pub struct CircleSpec {
    /// Author recorded for audit purposes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Namespace the Circle's objects are deployed into
    pub namespace: String,
    /// Modules bundled by this Circle
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<CircleModule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<CircleEnvironment>,
}

impl Circle {
    /// Namespace the Circle deploys into, defaulting like the API server does
    pub fn target_namespace(&self) -> &str {
        if self.spec.namespace.is_empty() {
            crate::resource::DEFAULT_NAMESPACE
        } else {
            &self.spec.namespace
        }
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
