use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::Resource;

/// Marks an object as managed by this controller
pub const CONTROLLED_BY: &str = "circlerr.io/controlled-by";
/// Value stored under `CONTROLLED_BY`
pub const CONTROLLED_BY_VALUE: &str = "circlerr.io";
pub const CIRCLE_NAME: &str = "circlerr.io/circle-name";
pub const CIRCLE_NAMESPACE: &str = "circlerr.io/circle-namespace";
pub const MODULE_NAME: &str = "circlerr.io/module-name";
pub const MODULE_NAMESPACE: &str = "circlerr.io/module-namespace";
pub const MODULE_REVISION: &str = "circlerr.io/module-revision";
/// Original template body, kept for audit
pub const SNAPSHOT: &str = "circlerr.io/snapshot";
/// Last manifest persisted by the executor
pub const LAST_APPLIED_CONFIGURATION: &str = "twice.io/last-applied-configuration";
/// kubectl's equivalent; honored on read for interoperability, never written
pub const KUBECTL_LAST_APPLIED_CONFIGURATION: &str =
    "kubectl.kubernetes.io/last-applied-configuration";

fn annotation(obj: &DynamicObject, key: &str) -> Option<String> {
    obj.meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .cloned()
}

fn set_annotation(obj: &mut DynamicObject, key: &str, value: &str) {
    obj.meta_mut()
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// True iff the object carries our control annotation
pub fn is_managed_object(obj: &DynamicObject) -> bool {
    annotation(obj, CONTROLLED_BY).as_deref() == Some(CONTROLLED_BY_VALUE)
}

/// True iff the object is managed and owned by the given Circle
pub fn is_owned_by_circle(obj: &DynamicObject, circle_name: &str, circle_namespace: &str) -> bool {
    is_managed_object(obj)
        && annotation(obj, CIRCLE_NAME).as_deref() == Some(circle_name)
        && annotation(obj, CIRCLE_NAMESPACE).as_deref() == Some(circle_namespace)
}

/// The manifest most recently persisted for this object.
///
/// kubectl's annotation wins when both are present; an object applied by
/// neither tool yields the empty string.
pub fn last_applied_configuration(obj: &DynamicObject) -> String {
    annotation(obj, KUBECTL_LAST_APPLIED_CONFIGURATION)
        .or_else(|| annotation(obj, LAST_APPLIED_CONFIGURATION))
        .unwrap_or_default()
}

pub fn set_last_applied_configuration(obj: &mut DynamicObject, manifest: &str) {
    set_annotation(obj, LAST_APPLIED_CONFIGURATION, manifest);
}

/// Stamp the ownership annotations of a rendered object.
///
/// `snapshot` is the original template body before any rewriting, kept so the
/// source of a live object can always be audited.
pub fn decorate_object(
    obj: &mut DynamicObject,
    circle_name: &str,
    circle_namespace: &str,
    module_name: &str,
    module_namespace: &str,
    module_revision: &str,
    snapshot: &str,
) {
    set_annotation(obj, CONTROLLED_BY, CONTROLLED_BY_VALUE);
    set_annotation(obj, CIRCLE_NAME, circle_name);
    set_annotation(obj, CIRCLE_NAMESPACE, circle_namespace);
    set_annotation(obj, MODULE_NAME, module_name);
    set_annotation(obj, MODULE_NAMESPACE, module_namespace);
    set_annotation(obj, SNAPSHOT, snapshot);
    if !module_revision.is_empty() {
        set_annotation(obj, MODULE_REVISION, module_revision);
    }
}

/// Module identity stamped on an object, read back for status reporting
pub fn module_of(obj: &DynamicObject) -> (String, String, String) {
    (
        annotation(obj, MODULE_NAME).unwrap_or_default(),
        annotation(obj, MODULE_NAMESPACE).unwrap_or_default(),
        annotation(obj, MODULE_REVISION).unwrap_or_default(),
    )
}
