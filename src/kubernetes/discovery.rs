use async_trait::async_trait;
use kube::api::GroupVersionKind;
use kube::discovery::{pinned_kind, verbs, ApiCapabilities, ApiResource};
use kube::{Client, Discovery};

use crate::error::{AppError, AppResult};

/// Kinds never mirrored into the cache. `events` churns constantly and is
/// useless for reconciliation.
const IGNORED_RESOURCES: &[&str] = &["events"];

/// A kind qualifies for the cache only when it can be both listed and watched
pub fn is_supported(caps: &ApiCapabilities) -> bool {
    caps.supports_operation(verbs::LIST) && caps.supports_operation(verbs::WATCH)
}

pub fn is_ignored(ar: &ApiResource) -> bool {
    IGNORED_RESOURCES.contains(&ar.plural.as_str())
}

/// Enumerate the preferred version of every kind the server exposes,
/// restricted to kinds the watch engine can mirror.
pub async fn server_preferred_resources(
    client: &Client,
) -> AppResult<Vec<(ApiResource, ApiCapabilities)>> {
    let discovery = Discovery::new(client.clone()).run().await?;
    let mut resources = Vec::new();

    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            // skip subresources like deployments/status
            if ar.plural.contains('/') {
                continue;
            }
            if is_ignored(&ar) || !is_supported(&caps) {
                continue;
            }

            resources.push((ar, caps));
        }
    }

    Ok(resources)
}

/// Resolves a rendered object's `apiVersion`/`kind` to the REST resource the
/// dynamic client needs. Seam trait so the planner can be exercised without a
/// cluster.
#[async_trait]
pub trait ResourceResolver: Send + Sync {
    async fn resolve(&self, gvk: &GroupVersionKind) -> AppResult<ApiResource>;
}

/// Production resolver backed by the discovery API. Results are not cached;
/// resolution happens per object at plan time.
pub struct DiscoveryResolver {
    client: Client,
}

impl DiscoveryResolver {
    pub fn new(client: Client) -> Self {
        DiscoveryResolver { client }
    }
}

#[async_trait]
impl ResourceResolver for DiscoveryResolver {
    async fn resolve(&self, gvk: &GroupVersionKind) -> AppResult<ApiResource> {
        let (ar, caps) = pinned_kind(&self.client, gvk).await.map_err(|e| {
            AppError::Discovery(format!(
                "server does not know {}/{} {}: {}",
                gvk.group, gvk.version, gvk.kind, e
            ))
        })?;

        if !is_supported(&caps) {
            return Err(AppError::Discovery(format!(
                "server resource {} does not support list+watch",
                ar.plural
            )));
        }

        Ok(ar)
    }
}
