use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How a module's checkout is turned into manifests
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateType {
    /// Raw YAML/JSON files collected from the module path
    Simple,
    /// Helm chart expanded with `helm template`
    Helm,
}

impl Default for TemplateType {
    fn default() -> Self {
        TemplateType::Simple
    }
}

/// Secret holding the module's Git credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

/// Module status information
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
pub struct ModuleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The Module CustomResource: a Git-backed, templated manifest source
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "circlerr.io",
    version = "v1alpha1",
    kind = "Module",
    shortname = "mod",
    namespaced,
    status = "ModuleStatus",
    printcolumn = r#"{"name":"Url", "jsonPath":".spec.url", "type":"string"}"#,
    printcolumn = r#"{"name":"Template", "jsonPath":".spec.templateType", "type":"string"}"#
)]
pub struct ModuleSpec {
    /// Git repository URL
    pub url: String,
    /// Path of the manifests (or chart) inside the repository
    #[serde(default)]
    pub path: String,
    /// Rendering strategy
    #[serde(default, rename = "templateType")]
    pub template_type: TemplateType,
    /// Credentials for private repositories
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "secretRef")]
    pub secret_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}
