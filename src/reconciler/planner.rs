use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use kube::api::{DynamicObject, GroupVersionKind};
use serde_json::Value;

use crate::annotations;
use crate::cache::ResourceCache;
use crate::error::{AppError, AppResult};
use crate::kubernetes::discovery::ResourceResolver;
use crate::manifest;
use crate::reconciler::{Action, PlanResult};
use crate::resource::{object_gvk, Resource, ResourceIdentifier};

/// Turns rendered manifests plus the cluster-state cache into a per-object
/// apply plan.
///
/// The diff against the cluster is a three-way JSON merge against the stored
/// last-applied-configuration annotation, never against live server state, so
/// server-managed fields are left alone. Field *removals* are deliberately not
/// propagated: null entries are stripped from the computed merge patch, which
/// diverges from `kubectl apply`.
pub struct Planner {
    cache: ResourceCache,
    resolver: Arc<dyn ResourceResolver>,
}

impl Planner {
    pub fn new(cache: ResourceCache, resolver: Arc<dyn ResourceResolver>) -> Self {
        Planner { cache, resolver }
    }

    /// Compute the plan for one render set.
    ///
    /// `is_managed` selects which cached objects are candidates for
    /// orphan-deletion; `pre_hook` is applied to every decoded object and to
    /// the rebuilt target of an UPDATE. Any decode or discovery failure aborts
    /// the whole plan.
    pub async fn plan(
        &self,
        manifests: &[Vec<u8>],
        namespace: &str,
        is_managed: &(dyn Fn(&DynamicObject) -> bool + Send + Sync),
        pre_hook: Option<&(dyn Fn(DynamicObject) -> DynamicObject + Send + Sync)>,
    ) -> AppResult<Vec<PlanResult>> {
        let mut documents = Vec::new();
        for blob in manifests {
            documents.extend(manifest::split_manifests(blob)?);
        }

        let mut results: Vec<PlanResult> = Vec::new();
        // last decoded document wins for its identifier
        let mut positions: HashMap<String, usize> = HashMap::new();

        for document in &documents {
            let mut obj = manifest::to_object(document)?;
            if let Some(hook) = pre_hook {
                obj = hook(obj);
            }

            let (group, version, kind) = object_gvk(&obj)?;
            let gvk = GroupVersionKind::gvk(&group, &version, &kind);
            let api_resource = self.resolver.resolve(&gvk).await?;

            let identifier = ResourceIdentifier::from_object(&obj, namespace)?;
            let key = identifier.key();

            let result = if self.cache.has(&key) {
                self.classify_cached(&key, document, &obj, namespace, &api_resource.plural, pre_hook)?
            } else {
                let resource =
                    Resource::from_object(&obj, namespace, &api_resource.plural, true)?;
                PlanResult {
                    resource,
                    action: Action::Create,
                    src_manifest: document.clone(),
                    target_manifest: document.clone(),
                    diff: Vec::new(),
                }
            };

            if let Some(pos) = positions.get(&key).copied() {
                results[pos] = result;
            } else {
                positions.insert(key, results.len());
                results.push(result);
            }
        }

        let deletions = self.deletions(is_managed, &positions);
        results.extend(deletions);

        Ok(results)
    }

    /// Classify a rendered document whose identifier is already cached:
    /// IMMUTABLE when the cleaned merge patch is empty, UPDATE otherwise.
    fn classify_cached(
        &self,
        key: &str,
        document: &str,
        obj: &DynamicObject,
        namespace: &str,
        resource_name: &str,
        pre_hook: Option<&(dyn Fn(DynamicObject) -> DynamicObject + Send + Sync)>,
    ) -> AppResult<PlanResult> {
        let cached = self
            .cache
            .get(key)
            .ok_or_else(|| AppError::NotFound(format!("cache entry vanished for {}", key)))?;

        let last_applied = cached
            .object
            .as_ref()
            .map(annotations::last_applied_configuration)
            .unwrap_or_default();

        // An object not originally applied by us has no recorded manifest;
        // diff against nothing and take over the declared fields.
        let original: Value = if last_applied.is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&last_applied)?
        };
        let modified: Value = serde_json::from_str(document)?;

        let mut patch = create_merge_patch(&original, &modified);
        strip_nulls(&mut patch);

        let is_noop = patch.as_object().map(|p| p.is_empty()).unwrap_or(false);
        let (action, target_manifest, diff) = if is_noop {
            (Action::Immutable, last_applied, Vec::new())
        } else {
            let mut target = original;
            json_patch::merge(&mut target, &patch);
            let rendered = serde_json::to_string(&target)?;

            let diff = serde_json::to_string_pretty(&patch)?
                .lines()
                .map(String::from)
                .collect();
            (Action::Update, rendered, diff)
        };

        let mut target_obj: DynamicObject = serde_json::from_str(&target_manifest)
            .map_err(|e| AppError::Decode(format!("rebuilt target for {}: {}", key, e)))?;
        if let Some(hook) = pre_hook {
            target_obj = hook(target_obj);
        }

        // identity comes from the rendered object; the materialized target
        // (parsed from the stored manifest) becomes the object that is applied
        let mut resource = Resource::from_object(obj, namespace, resource_name, true)?;
        resource.object = Some(target_obj);

        Ok(PlanResult {
            resource,
            action,
            src_manifest: document.to_string(),
            target_manifest,
            diff,
        })
    }

    /// Managed cached objects absent from the current render become DELETE
    /// actions, unless a controller owns them.
    fn deletions(
        &self,
        is_managed: &(dyn Fn(&DynamicObject) -> bool + Send + Sync),
        produced: &HashMap<String, usize>,
    ) -> Vec<PlanResult> {
        let candidates = self
            .cache
            .list(|res| {
                res.object
                    .as_ref()
                    .map(|obj| is_managed(obj))
                    .unwrap_or(false)
            })
            .into_iter()
            .sorted();

        let mut deletions = Vec::new();
        for key in candidates {
            if produced.contains_key(&key) {
                continue;
            }

            let Some(cached) = self.cache.get(&key) else {
                continue;
            };

            // never delete children a controller still owns
            if cached.has_controller_owner() {
                continue;
            }

            let src_manifest = cached
                .object
                .as_ref()
                .map(annotations::last_applied_configuration)
                .unwrap_or_default();

            deletions.push(PlanResult {
                resource: cached,
                action: Action::Delete,
                src_manifest,
                target_manifest: String::new(),
                diff: Vec::new(),
            });
        }

        deletions
    }
}

/// RFC 7386 merge patch turning `original` into `modified`.
///
/// Objects are recursed into; arrays and scalars are replaced wholesale; keys
/// present only in `original` are emitted as explicit nulls (which the caller
/// is expected to strip).
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            let mut patch = serde_json::Map::new();

            for (key, modified_value) in modified {
                match original.get(key) {
                    Some(original_value) if original_value == modified_value => {}
                    Some(original_value)
                        if original_value.is_object() && modified_value.is_object() =>
                    {
                        let sub = create_merge_patch(original_value, modified_value);
                        if sub.as_object().map(|m| !m.is_empty()).unwrap_or(true) {
                            patch.insert(key.clone(), sub);
                        }
                    }
                    _ => {
                        patch.insert(key.clone(), modified_value.clone());
                    }
                }
            }

            for key in original.keys() {
                if !modified.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }

            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

/// Recursively drop null members from a merge patch, so field removals are
/// never propagated to the cluster. Arrays are opaque and left untouched.
pub fn strip_nulls(patch: &mut Value) {
    if let Value::Object(map) = patch {
        map.retain(|_, value| !value.is_null());
        for value in map.values_mut() {
            strip_nulls(value);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kube::discovery::ApiResource;
    use serde_json::json;

    struct StaticResolver;

    #[async_trait]
    impl ResourceResolver for StaticResolver {
        async fn resolve(&self, gvk: &GroupVersionKind) -> AppResult<ApiResource> {
            let plural = match gvk.kind.as_str() {
                "Deployment" => "deployments",
                "ConfigMap" => "configmaps",
                "Pod" => "pods",
                "Service" => "services",
                _ => {
                    return Err(AppError::Discovery(format!(
                        "server resource not supported: {}",
                        gvk.kind
                    )))
                }
            };
            Ok(ApiResource::from_gvk_with_plural(gvk, plural))
        }
    }

    fn planner(cache: &ResourceCache) -> Planner {
        Planner::new(cache.clone(), Arc::new(StaticResolver))
    }

    fn manage(obj: &DynamicObject) -> bool {
        annotations::is_managed_object(obj)
    }

    fn deployment_doc(name: &str, replicas: u64) -> String {
        serde_json::to_string(&json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": name },
            "spec": { "replicas": replicas },
        }))
        .unwrap()
    }

    /// Cache entry shaped like the aftermath of a successful apply: the live
    /// object carries our control annotation and the persisted manifest.
    fn applied_entry(cache: &ResourceCache, doc: &str, resource_name: &str) {
        let mut obj = manifest::to_object(doc).unwrap();
        annotations::decorate_object(&mut obj, "main", "circles", "web", "modules", "", doc);
        annotations::set_last_applied_configuration(&mut obj, doc);
        let res = Resource::from_object(&obj, "default", resource_name, true).unwrap();
        cache.set(&res.key(), res);
    }

    #[tokio::test]
    async fn empty_cache_yields_creates_in_input_order() {
        let cache = ResourceCache::new();
        let manifests = vec![
            deployment_doc("alpha", 1).into_bytes(),
            deployment_doc("beta", 2).into_bytes(),
        ];

        let plan = planner(&cache)
            .plan(&manifests, "default", &manage, None)
            .await
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|p| p.action == Action::Create));
        assert_eq!(plan[0].resource.identifier.name, "alpha");
        assert_eq!(plan[1].resource.identifier.name, "beta");
        assert_eq!(plan[0].src_manifest, plan[0].target_manifest);
    }

    #[tokio::test]
    async fn identical_rerender_is_immutable() {
        let cache = ResourceCache::new();
        let doc = deployment_doc("nginx", 3);
        applied_entry(&cache, &doc, "deployments");

        let plan = planner(&cache)
            .plan(&[doc.clone().into_bytes()], "default", &manage, None)
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, Action::Immutable);
        assert_eq!(plan[0].target_manifest, doc);
        assert!(plan[0].diff.is_empty());
    }

    #[tokio::test]
    async fn changed_field_becomes_update() {
        let cache = ResourceCache::new();
        applied_entry(&cache, &deployment_doc("nginx", 3), "deployments");

        let plan = planner(&cache)
            .plan(
                &[deployment_doc("nginx", 5).into_bytes()],
                "default",
                &manage,
                None,
            )
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, Action::Update);
        assert!(!plan[0].diff.is_empty());

        let target: Value = serde_json::from_str(&plan[0].target_manifest).unwrap();
        assert_eq!(target["spec"]["replicas"], json!(5));
        // only that key moved
        let mut expected: Value = serde_json::from_str(&deployment_doc("nginx", 3)).unwrap();
        expected["spec"]["replicas"] = json!(5);
        assert_eq!(target, expected);
    }

    #[tokio::test]
    async fn dropped_field_is_not_propagated() {
        let cache = ResourceCache::new();
        let first = serde_json::to_string(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings" },
            "data": { "foo": "v", "bar": "w" },
        }))
        .unwrap();
        applied_entry(&cache, &first, "configmaps");

        let second = serde_json::to_string(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings" },
            "data": { "bar": "w" },
        }))
        .unwrap();

        let plan = planner(&cache)
            .plan(&[second.into_bytes()], "default", &manage, None)
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, Action::Immutable);
        assert_eq!(plan[0].target_manifest, first);
    }

    #[tokio::test]
    async fn absent_document_deletes_the_orphan() {
        let cache = ResourceCache::new();
        let kept = deployment_doc("kept", 1);
        let orphan = deployment_doc("orphan", 1);
        applied_entry(&cache, &kept, "deployments");
        applied_entry(&cache, &orphan, "deployments");

        let plan = planner(&cache)
            .plan(&[kept.clone().into_bytes()], "default", &manage, None)
            .await
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].action, Action::Immutable);
        assert_eq!(plan[0].resource.identifier.name, "kept");
        assert_eq!(plan[1].action, Action::Delete);
        assert_eq!(plan[1].resource.identifier.name, "orphan");
        assert_eq!(plan[1].src_manifest, orphan);
        assert_eq!(plan[1].target_manifest, "");
    }

    #[tokio::test]
    async fn controller_owned_object_is_never_deleted() {
        let cache = ResourceCache::new();
        let doc = serde_json::to_string(&json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "x" },
        }))
        .unwrap();

        let mut obj = manifest::to_object(&doc).unwrap();
        annotations::decorate_object(&mut obj, "main", "circles", "web", "modules", "", &doc);
        annotations::set_last_applied_configuration(&mut obj, &doc);
        obj.metadata.owner_references = Some(vec![
            k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "ReplicaSet".to_string(),
                name: "web".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                ..Default::default()
            },
        ]);
        let res = Resource::from_object(&obj, "default", "pods", true).unwrap();
        cache.set(&res.key(), res);

        let plan = planner(&cache)
            .plan(&[], "default", &manage, None)
            .await
            .unwrap();

        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn unmanaged_cache_entries_are_not_orphans() {
        let cache = ResourceCache::new();
        // observed by the watch engine, but applied by someone else
        let doc = deployment_doc("foreign", 1);
        let obj = manifest::to_object(&doc).unwrap();
        let res = Resource::from_object(&obj, "default", "deployments", false).unwrap();
        cache.set(&res.key(), res);

        let plan = planner(&cache)
            .plan(&[], "default", &manage, None)
            .await
            .unwrap();

        assert!(plan.is_empty());
    }

    #[tokio::test]
    async fn cached_object_without_recorded_manifest_is_updated() {
        let cache = ResourceCache::new();
        let doc = deployment_doc("adopted", 2);
        // in the cache (e.g. kubectl-created without last-applied), no manifest
        let obj = manifest::to_object(&doc).unwrap();
        let res = Resource::from_object(&obj, "default", "deployments", false).unwrap();
        cache.set(&res.key(), res);

        let plan = planner(&cache)
            .plan(&[doc.clone().into_bytes()], "default", &manage, None)
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, Action::Update);
        let target: Value = serde_json::from_str(&plan[0].target_manifest).unwrap();
        let expected: Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(target, expected);
    }

    #[tokio::test]
    async fn last_decoded_duplicate_wins() {
        let cache = ResourceCache::new();
        let manifests = vec![
            deployment_doc("dup", 1).into_bytes(),
            deployment_doc("other", 1).into_bytes(),
            deployment_doc("dup", 9).into_bytes(),
        ];

        let plan = planner(&cache)
            .plan(&manifests, "default", &manage, None)
            .await
            .unwrap();

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].resource.identifier.name, "dup");
        let target: Value = serde_json::from_str(&plan[0].target_manifest).unwrap();
        assert_eq!(target["spec"]["replicas"], json!(9));
        assert_eq!(plan[1].resource.identifier.name, "other");
    }

    #[tokio::test]
    async fn unknown_kind_aborts_the_plan() {
        let cache = ResourceCache::new();
        let doc = serde_json::to_string(&json!({
            "apiVersion": "example.io/v1",
            "kind": "Widget",
            "metadata": { "name": "w" },
        }))
        .unwrap();

        let err = planner(&cache)
            .plan(&[doc.into_bytes()], "default", &manage, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Discovery(_)));
    }

    #[tokio::test]
    async fn malformed_document_aborts_the_plan() {
        let cache = ResourceCache::new();
        let err = planner(&cache)
            .plan(&[b"kind: [broken".to_vec()], "default", &manage, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Yaml(_)));
    }

    #[tokio::test]
    async fn pre_hook_shapes_the_identifier() {
        let cache = ResourceCache::new();
        let hook = |mut obj: DynamicObject| {
            let name = obj.metadata.name.take().unwrap_or_default();
            obj.metadata.name = Some(format!("main-{}", name));
            obj
        };

        let plan = planner(&cache)
            .plan(
                &[deployment_doc("nginx", 1).into_bytes()],
                "default",
                &manage,
                Some(&hook),
            )
            .await
            .unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].resource.identifier.name, "main-nginx");
        assert_eq!(plan[0].resource.resource_name, "deployments");
    }

    #[test]
    fn merge_patch_recurses_into_objects() {
        let original = json!({"spec": {"a": 1, "b": {"c": 2}}, "keep": true});
        let modified = json!({"spec": {"a": 1, "b": {"c": 3}}, "keep": true});

        let patch = create_merge_patch(&original, &modified);
        assert_eq!(patch, json!({"spec": {"b": {"c": 3}}}));
    }

    #[test]
    fn merge_patch_replaces_arrays_wholesale() {
        let original = json!({"spec": {"ports": [80, 443]}});
        let modified = json!({"spec": {"ports": [80]}});

        let patch = create_merge_patch(&original, &modified);
        assert_eq!(patch, json!({"spec": {"ports": [80]}}));
    }

    #[test]
    fn merge_patch_marks_removals_with_null() {
        let original = json!({"spec": {"foo": "v", "bar": "w"}});
        let modified = json!({"spec": {"bar": "w"}});

        let mut patch = create_merge_patch(&original, &modified);
        assert_eq!(patch, json!({"spec": {"foo": null}}));

        strip_nulls(&mut patch);
        assert_eq!(patch, json!({"spec": {}}));
    }

    #[test]
    fn strip_nulls_recurses_but_leaves_arrays_alone() {
        let mut patch = json!({
            "a": null,
            "b": {"c": null, "d": 1},
            "e": [null, {"f": null}],
        });
        strip_nulls(&mut patch);
        assert_eq!(patch, json!({"b": {"d": 1}, "e": [null, {"f": null}]}));
    }
}
