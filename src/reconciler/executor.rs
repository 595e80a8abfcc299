use std::sync::Arc;
use std::time::Duration;

use kube::api::DynamicObject;

use crate::annotations;
use crate::cache::ResourceCache;
use crate::error::{AppError, AppResult};
use crate::kubernetes::api::DynamicApi;
use crate::reconciler::{Action, ApplyResult, PlanResult, SyncStatus};
use crate::resource::Resource;

/// Update attempts before a conflict is surfaced as a failure
const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_BACKOFF_BASE_MS: u64 = 100;

/// Enacts a plan against the cluster and keeps the cache in sync with every
/// acknowledged mutation.
///
/// Entries are applied independently and in order; a failed entry is recorded
/// and the remaining entries still run.
pub struct Executor {
    cache: ResourceCache,
    api: Arc<dyn DynamicApi>,
}

impl Executor {
    pub fn new(cache: ResourceCache, api: Arc<dyn DynamicApi>) -> Self {
        Executor { cache, api }
    }

    pub async fn apply(&self, plan: &[PlanResult], namespace: &str) -> Vec<ApplyResult> {
        let mut results = Vec::with_capacity(plan.len());

        for entry in plan {
            let outcome = self.apply_one(entry, namespace).await;
            let result = match outcome {
                Ok(()) => ApplyResult {
                    plan: entry.clone(),
                    status: SyncStatus::Ok,
                    error: None,
                },
                Err(e) => {
                    log::error!(
                        "Failed to apply {} for {}: {}",
                        entry.action,
                        entry.resource.identifier,
                        e
                    );
                    ApplyResult {
                        plan: entry.clone(),
                        status: SyncStatus::Failed,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }

        results
    }

    async fn apply_one(&self, entry: &PlanResult, namespace: &str) -> AppResult<()> {
        match entry.action {
            Action::Create => self.create(entry, namespace).await,
            Action::Update => self.update(entry, namespace).await,
            Action::Delete => self.delete(entry, namespace).await,
            Action::Immutable => Ok(()),
        }
    }

    async fn create(&self, entry: &PlanResult, namespace: &str) -> AppResult<()> {
        let mut obj = planned_object(entry)?;
        annotations::set_last_applied_configuration(&mut obj, &entry.target_manifest);

        log::debug!("Creating {}", entry.resource.identifier);
        let created = self.api.create(namespace, &entry.resource, &obj).await?;

        self.remember(&created, namespace, &entry.resource.resource_name)?;
        Ok(())
    }

    async fn update(&self, entry: &PlanResult, namespace: &str) -> AppResult<()> {
        let mut obj = planned_object(entry)?;
        annotations::set_last_applied_configuration(&mut obj, &entry.target_manifest);
        let name = entry.resource.identifier.name.clone();

        log::debug!("Updating {}", entry.resource.identifier);

        let mut attempt = 0;
        let updated = loop {
            match self.api.replace(namespace, &entry.resource, &obj).await {
                Ok(updated) => break updated,
                Err(e) if AppError::is_conflict(&e) => {
                    attempt += 1;
                    if attempt >= CONFLICT_RETRIES {
                        return Err(AppError::Conflict(entry.resource.identifier.key()));
                    }

                    let backoff = CONFLICT_BACKOFF_BASE_MS * 2u64.pow(attempt - 1);
                    log::debug!(
                        "Conflict updating {}, retrying in {}ms",
                        entry.resource.identifier,
                        backoff
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;

                    // refresh the optimistic-concurrency token from the live object
                    let live = self.api.get(namespace, &entry.resource, &name).await?;
                    obj.metadata.resource_version = live.metadata.resource_version;
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.remember(&updated, namespace, &entry.resource.resource_name)?;
        Ok(())
    }

    async fn delete(&self, entry: &PlanResult, namespace: &str) -> AppResult<()> {
        let name = entry.resource.identifier.name.clone();

        log::debug!("Deleting {}", entry.resource.identifier);
        self.api
            .delete(namespace, &entry.resource, &name)
            .await
            .map_err(|e| {
                if AppError::is_not_found(&e) {
                    AppError::NotFound(entry.resource.identifier.key())
                } else {
                    e.into()
                }
            })?;

        self.cache.delete(&entry.resource.key());
        Ok(())
    }

    /// Write an acknowledged create/update back into the cache so the next
    /// plan tick sees it even before the watch event arrives.
    fn remember(&self, obj: &DynamicObject, namespace: &str, resource_name: &str) -> AppResult<()> {
        let is_managed = annotations::is_managed_object(obj);
        let resource = Resource::from_object(obj, namespace, resource_name, is_managed)?;
        self.cache.set(&resource.key(), resource);
        Ok(())
    }
}

fn planned_object(entry: &PlanResult) -> AppResult<DynamicObject> {
    entry.resource.object.clone().ok_or_else(|| {
        AppError::Internal(format!(
            "plan entry for {} carries no object",
            entry.resource.identifier
        ))
    })
}
