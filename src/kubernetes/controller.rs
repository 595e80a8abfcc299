use futures_util::StreamExt;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::runtime::{controller::Action, watcher, Controller};
use kube::{Client, ResourceExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::circle::{
    Circle, CircleResourceModule, CircleResourceStatus, CircleStatus, CircleStatusHistory,
    CircleStatusResource, CIRCLE_FINALIZER,
};
use super::module::Module;
use crate::annotations;
use crate::cache::ResourceCache;
use crate::gitmanager::GitManager;
use crate::kubernetes::api::KubeDynamicApi;
use crate::kubernetes::discovery::DiscoveryResolver;
use crate::kubernetes::Error;
use crate::manifest;
use crate::metrics;
use crate::reconciler::{ApplyResult, Executor, Planner, SyncStatus};
use crate::template::{self, TemplateManager};

const REQUEUE_AFTER_SUCCESS: Duration = Duration::from_secs(300);
const REQUEUE_AFTER_ERROR: Duration = Duration::from_secs(5);
/// Entries kept in `status.history`
const HISTORY_LIMIT: usize = 10;

/// Context for the controller
pub struct ControllerContext {
    /// Kubernetes client
    client: Client,
    cache: ResourceCache,
    planner: Planner,
    executor: Executor,
    git: GitManager,
    templates: TemplateManager,
}

/// Where a rendered document came from, keyed by `(kind, original name)`.
/// Looked up by the plan pre-hook to stamp ownership annotations.
struct ModuleSource {
    name: String,
    namespace: String,
    revision: String,
    snapshot: String,
}

type SourceMap = HashMap<(String, String), ModuleSource>;

/// The reconciliation function for Circle resources
async fn reconcile(circle: Arc<Circle>, ctx: Arc<ControllerContext>) -> Result<Action, Error> {
    let ns = circle.namespace().unwrap_or_else(|| "default".to_string());
    let name = circle.name_any();

    log::debug!("Reconciling Circle {}/{}", ns, name);
    metrics::get().reconciles.add(1, &[]);
    metrics::get().cache_objects.set(ctx.cache.len() as i64);

    let target_ns = circle.target_namespace().to_string();
    let is_managed = {
        let name = name.clone();
        let ns = ns.clone();
        move |obj: &DynamicObject| annotations::is_owned_by_circle(obj, &name, &ns)
    };

    if circle.is_being_deleted() {
        return finalize(&circle, &ctx, &ns, &name, &target_ns, &is_managed).await;
    }

    ensure_finalizer(&ctx.client, &circle, &ns, &name).await?;

    let (blobs, sources) = match render_circle(&ctx, &circle).await {
        Ok(rendered) => rendered,
        Err(e) => {
            record_failure(&ctx.client, &ns, &name, &e.to_string()).await;
            return Err(e);
        }
    };

    let hook = pre_hook(sources, name.clone(), ns.clone());
    let plan = match ctx
        .planner
        .plan(&blobs, &target_ns, &is_managed, Some(&hook))
        .await
    {
        Ok(plan) => plan,
        Err(e) => {
            record_failure(&ctx.client, &ns, &name, &e.to_string()).await;
            return Err(Error::App(e));
        }
    };

    for entry in &plan {
        metrics::get()
            .plan_actions
            .with_label_values(&[&entry.action.to_string()])
            .inc();
    }

    let results = ctx.executor.apply(&plan, &target_ns).await;
    let failures = results
        .iter()
        .filter(|r| r.status == SyncStatus::Failed)
        .count();
    if failures > 0 {
        metrics::get().apply_failures.add(failures as u64, &[]);
        log::warn!(
            "Circle {}/{}: {} of {} resources failed to apply",
            ns,
            name,
            failures,
            results.len()
        );
    }

    let status = compose_status(&circle, &results);
    update_circle_status(&ctx.client, &ns, &name, &status).await?;

    if failures > 0 {
        Ok(Action::requeue(REQUEUE_AFTER_ERROR))
    } else {
        log::info!("Circle {}/{} is in sync", ns, name);
        Ok(Action::requeue(REQUEUE_AFTER_SUCCESS))
    }
}

/// Deletion path: an empty render set plans a DELETE for every object this
/// Circle owns; the finalizer is cleared only once all of them went through.
async fn finalize(
    circle: &Circle,
    ctx: &ControllerContext,
    ns: &str,
    name: &str,
    target_ns: &str,
    is_managed: &(dyn Fn(&DynamicObject) -> bool + Send + Sync),
) -> Result<Action, Error> {
    log::info!("Circle {}/{} is being deleted, undeploying", ns, name);

    let plan = ctx
        .planner
        .plan(&[], target_ns, is_managed, None)
        .await
        .map_err(Error::App)?;
    let results = ctx.executor.apply(&plan, target_ns).await;

    let failed = results.iter().any(|r| r.status == SyncStatus::Failed);
    if failed {
        record_failure(&ctx.client, ns, name, "undeploy incomplete").await;
        return Ok(Action::requeue(REQUEUE_AFTER_ERROR));
    }

    remove_finalizer(&ctx.client, circle, ns, name).await?;
    log::info!("Circle {}/{} undeployed", ns, name);
    Ok(Action::await_change())
}

/// Materialize every module of the Circle: load the Module resource, sync its
/// Git checkout, render manifests, apply the module's value overrides to each
/// document, and remember which module produced which document.
async fn render_circle(
    ctx: &ControllerContext,
    circle: &Circle,
) -> Result<(Vec<Vec<u8>>, SourceMap), Error> {
    let mut manifests = Vec::new();
    let mut sources: SourceMap = HashMap::new();

    for circle_module in &circle.spec.modules {
        let api: Api<Module> = Api::namespaced(ctx.client.clone(), &circle_module.namespace);
        let module = api.get(&circle_module.name).await?;

        let revision = circle_module.revision.clone().unwrap_or_default();
        let rendered = render_module(ctx, circle, circle_module, &module, &revision).await;

        let module_ns = module.namespace().unwrap_or_else(|| "default".to_string());
        let module_name = module.name_any();
        match rendered {
            Ok(documents) => {
                update_module_status(&ctx.client, &module_ns, &module_name, "OK", None).await;

                for document in documents {
                    index_document(&document, circle_module, &revision, &mut sources)?;
                    manifests.push(document.into_bytes());
                }
            }
            Err(e) => {
                update_module_status(
                    &ctx.client,
                    &module_ns,
                    &module_name,
                    "FAILED",
                    Some(&e.to_string()),
                )
                .await;
                return Err(e);
            }
        }
    }

    Ok((manifests, sources))
}

/// Sync and render one module, returning its individual documents with the
/// Circle's per-module overrides already applied.
async fn render_module(
    ctx: &ControllerContext,
    circle: &Circle,
    circle_module: &super::circle::CircleModule,
    module: &Module,
    revision: &str,
) -> Result<Vec<String>, Error> {
    let checkout = ctx.git.sync(module, revision).await.map_err(Error::App)?;
    let blobs = ctx
        .templates
        .render(module, circle.target_namespace(), &checkout)
        .await
        .map_err(Error::App)?;

    let mut documents = Vec::new();
    for blob in blobs {
        for document in manifest::split_manifests(&blob).map_err(Error::App)? {
            let document = template::override_values(&document, &circle_module.overrides)
                .map_err(Error::App)?;
            documents.push(document);
        }
    }

    Ok(documents)
}

/// Record a document's source module so the pre-hook can stamp it later
fn index_document(
    document: &str,
    circle_module: &super::circle::CircleModule,
    revision: &str,
    sources: &mut SourceMap,
) -> Result<(), Error> {
    let obj = manifest::to_object(document).map_err(Error::App)?;
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();
    let name = obj.name_any();

    sources.insert(
        (kind, name),
        ModuleSource {
            name: circle_module.name.clone(),
            namespace: circle_module.namespace.clone(),
            revision: revision.to_string(),
            snapshot: document.to_string(),
        },
    );

    Ok(())
}

/// The pre-hook handed to the planner: prefix the object name with the Circle
/// name and stamp the ownership annotations of its source module.
fn pre_hook(
    sources: SourceMap,
    circle_name: String,
    circle_namespace: String,
) -> impl Fn(DynamicObject) -> DynamicObject + Send + Sync {
    move |mut obj: DynamicObject| {
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .unwrap_or_default();
        let name = obj.name_any();
        let prefix = format!("{}-", circle_name);

        // update targets rebuilt from a live manifest arrive already prefixed
        let original = name.strip_prefix(&prefix).unwrap_or(&name).to_string();

        if let Some(source) = sources.get(&(kind, original.clone())) {
            annotations::decorate_object(
                &mut obj,
                &circle_name,
                &circle_namespace,
                &source.name,
                &source.namespace,
                &source.revision,
                &source.snapshot,
            );
        }

        obj.metadata.name = Some(format!("{}{}", prefix, original));
        obj
    }
}

/// Build the status subresource from the apply results
fn compose_status(circle: &Circle, results: &[ApplyResult]) -> CircleStatus {
    let now = chrono::Utc::now().to_rfc3339();
    let failed = results.iter().any(|r| r.status == SyncStatus::Failed);
    let overall = if failed { "FAILED" } else { "OK" };

    let resources = results
        .iter()
        .map(|result| {
            let identifier = &result.plan.resource.identifier;
            let (module_name, module_namespace, module_revision) = result
                .plan
                .resource
                .object
                .as_ref()
                .map(annotations::module_of)
                .unwrap_or_default();

            CircleStatusResource {
                group: identifier.group.clone(),
                kind: identifier.kind.clone(),
                name: identifier.name.clone(),
                namespace: identifier.namespace.clone(),
                status: CircleResourceStatus {
                    synced_at: Some(now.clone()),
                    sync_status: Some(result.status.to_string()),
                    error: result.error.clone(),
                },
                module: CircleResourceModule {
                    name: module_name,
                    namespace: module_namespace,
                    revision: (!module_revision.is_empty()).then_some(module_revision),
                },
            }
        })
        .collect();

    let mut history = circle
        .status
        .as_ref()
        .map(|s| s.history.clone())
        .unwrap_or_default();
    history.push(CircleStatusHistory {
        status: Some(overall.to_string()),
        message: Some(format!("{} resources reconciled", results.len())),
        event_time: Some(now.clone()),
        action: Some("SYNC".to_string()),
    });
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }

    CircleStatus {
        sync_status: Some(overall.to_string()),
        synced_at: Some(now),
        error: None,
        resources,
        history,
    }
}

/// Update the Circle status subresource
async fn update_circle_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &CircleStatus,
) -> Result<(), Error> {
    let api: Api<Circle> = Api::namespaced(client.clone(), namespace);

    let patch = Patch::Merge(serde_json::json!({ "status": status }));
    let params = PatchParams::default();
    api.patch_status(name, &params, &patch).await?;

    Ok(())
}

/// Stamp a failure on the Circle status without touching the resource list
async fn record_failure(client: &Client, namespace: &str, name: &str, message: &str) {
    metrics::get().reconcile_failures.add(1, &[]);

    let api: Api<Circle> = Api::namespaced(client.clone(), namespace);
    let status = serde_json::json!({
        "status": {
            "syncStatus": "FAILED",
            "syncTime": chrono::Utc::now().to_rfc3339(),
            "error": message,
        }
    });

    if let Err(e) = api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
        .await
    {
        log::error!(
            "Failed to record failure on Circle {}/{}: {}",
            namespace,
            name,
            e
        );
    }
}

/// Update the Module status after a render attempt
async fn update_module_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: &str,
    error: Option<&str>,
) {
    let api: Api<Module> = Api::namespaced(client.clone(), namespace);
    let status = serde_json::json!({
        "status": {
            "status": status,
            "error": error,
        }
    });

    if let Err(e) = api
        .patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
        .await
    {
        log::debug!(
            "Failed to update Module status {}/{}: {}",
            namespace,
            name,
            e
        );
    }
}

async fn ensure_finalizer(
    client: &Client,
    circle: &Circle,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    if circle.finalizers().iter().any(|f| f == CIRCLE_FINALIZER) {
        return Ok(());
    }

    let mut finalizers = circle.finalizers().to_vec();
    finalizers.push(CIRCLE_FINALIZER.to_string());

    let api: Api<Circle> = Api::namespaced(client.clone(), namespace);
    let patch = Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } }));
    api.patch(name, &PatchParams::default(), &patch).await?;

    Ok(())
}

async fn remove_finalizer(
    client: &Client,
    circle: &Circle,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let finalizers: Vec<&String> = circle
        .finalizers()
        .iter()
        .filter(|f| *f != CIRCLE_FINALIZER)
        .collect();

    let api: Api<Circle> = Api::namespaced(client.clone(), namespace);
    let patch = Patch::Merge(serde_json::json!({ "metadata": { "finalizers": finalizers } }));
    api.patch(name, &PatchParams::default(), &patch).await?;

    Ok(())
}

/// Error handler for the controller
fn error_policy(_circle: Arc<Circle>, error: &Error, _ctx: Arc<ControllerContext>) -> Action {
    log::error!(
        "Error during reconciliation: {}",
        crate::error::format_error_chain(error)
    );
    Action::requeue(REQUEUE_AFTER_ERROR)
}

/// Start the Kubernetes controller
pub async fn start_controller(client: Client, cache: ResourceCache) -> Result<(), Error> {
    let repositories_dir = std::env::var("REPOSITORIES_TMP_DIR")
        .unwrap_or_else(|_| "/tmp/circlerr/repositories".to_string());

    let context = Arc::new(ControllerContext {
        client: client.clone(),
        cache: cache.clone(),
        planner: Planner::new(cache.clone(), Arc::new(DiscoveryResolver::new(client.clone()))),
        executor: Executor::new(cache, Arc::new(KubeDynamicApi::new(client.clone()))),
        git: GitManager::new(client.clone(), PathBuf::from(repositories_dir)),
        templates: TemplateManager::new(),
    });

    // Create the API for Circle resources
    let circles: Api<Circle> = Api::all(client.clone());

    log::info!("Starting Circle controller");

    Controller::new(circles, watcher::Config::default())
        .run(reconcile, error_policy, context.clone())
        .for_each(|res| async move {
            match res {
                Ok(o) => log::debug!("Reconciliation completed: {:?}", o),
                Err(e) => log::error!("Reconciliation error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reconciler::{Action as PlanAction, PlanResult};
    use crate::resource::Resource;
    use serde_json::json;

    fn circle(name: &str) -> Circle {
        let mut circle = Circle::new(
            name,
            super::super::circle::CircleSpec {
                author: None,
                description: None,
                namespace: "default".to_string(),
                modules: Vec::new(),
                environments: Vec::new(),
            },
        );
        circle.metadata.namespace = Some("circles".to_string());
        circle
    }

    fn apply_result(name: &str, status: SyncStatus, error: Option<&str>) -> ApplyResult {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": name,
                "namespace": "default",
                "annotations": {
                    "circlerr.io/module-name": "web",
                    "circlerr.io/module-namespace": "modules",
                },
            },
        }))
        .unwrap();
        let resource = Resource::from_object(&obj, "default", "deployments", true).unwrap();

        ApplyResult {
            plan: PlanResult {
                resource,
                action: PlanAction::Create,
                src_manifest: String::new(),
                target_manifest: String::new(),
                diff: Vec::new(),
            },
            status,
            error: error.map(String::from),
        }
    }

    #[test]
    fn pre_hook_prefixes_and_decorates_known_documents() {
        let doc = serde_json::to_string(&json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "nginx" },
        }))
        .unwrap();

        let mut sources = SourceMap::new();
        sources.insert(
            ("Deployment".to_string(), "nginx".to_string()),
            ModuleSource {
                name: "web".to_string(),
                namespace: "modules".to_string(),
                revision: "v1".to_string(),
                snapshot: doc.clone(),
            },
        );

        let hook = pre_hook(sources, "main".to_string(), "circles".to_string());
        let obj = hook(manifest::to_object(&doc).unwrap());

        assert_eq!(obj.metadata.name.as_deref(), Some("main-nginx"));
        assert!(annotations::is_owned_by_circle(&obj, "main", "circles"));
        let (module, module_ns, revision) = annotations::module_of(&obj);
        assert_eq!(module, "web");
        assert_eq!(module_ns, "modules");
        assert_eq!(revision, "v1");
    }

    #[test]
    fn pre_hook_does_not_double_prefix_rebuilt_targets() {
        let hook = pre_hook(SourceMap::new(), "main".to_string(), "circles".to_string());
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "main-nginx" },
        }))
        .unwrap();

        let hooked = hook(obj);
        assert_eq!(hooked.metadata.name.as_deref(), Some("main-nginx"));
    }

    #[test]
    fn compose_status_reports_per_resource_outcomes() {
        let circle = circle("main");
        let results = vec![
            apply_result("main-nginx", SyncStatus::Ok, None),
            apply_result("main-other", SyncStatus::Failed, Some("boom")),
        ];

        let status = compose_status(&circle, &results);

        assert_eq!(status.sync_status.as_deref(), Some("FAILED"));
        assert_eq!(status.resources.len(), 2);
        assert_eq!(status.resources[0].name, "main-nginx");
        assert_eq!(status.resources[0].status.sync_status.as_deref(), Some("OK"));
        assert_eq!(status.resources[0].module.name, "web");
        assert_eq!(
            status.resources[1].status.error.as_deref(),
            Some("boom")
        );
        assert_eq!(status.history.len(), 1);
    }

    #[test]
    fn compose_status_bounds_the_history() {
        let mut circle = circle("main");
        circle.status = Some(CircleStatus {
            history: (0..HISTORY_LIMIT)
                .map(|i| CircleStatusHistory {
                    status: Some("OK".to_string()),
                    message: Some(format!("tick {}", i)),
                    event_time: None,
                    action: Some("SYNC".to_string()),
                })
                .collect(),
            ..Default::default()
        });

        let status = compose_status(&circle, &[]);
        assert_eq!(status.history.len(), HISTORY_LIMIT);
        assert_eq!(
            status.history.last().unwrap().message.as_deref(),
            Some("0 resources reconciled")
        );
    }
}
