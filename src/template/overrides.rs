use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::kubernetes::circle::Override;

/// Apply a Circle module's value overrides to one rendered document.
///
/// Each override names an existing field by JSON pointer (`/spec/replicas`)
/// and replaces it. Values are read as YAML scalars, so `"5"` becomes a
/// number and `"true"` a boolean; anything that does not parse stays a
/// string. A pointer that resolves to nothing fails the render, the same way
/// a broken template does.
pub fn override_values(document: &str, overrides: &[Override]) -> AppResult<String> {
    if overrides.is_empty() {
        return Ok(document.to_string());
    }

    let mut doc: Value = serde_json::from_str(document)?;

    for override_ in overrides {
        let value = scalar_value(&override_.value);
        let patch: json_patch::Patch = serde_json::from_value(serde_json::json!([
            { "op": "replace", "path": override_.key.as_str(), "value": value }
        ]))
        .map_err(|e| AppError::Template(format!("invalid override key {}: {}", override_.key, e)))?;

        json_patch::patch(&mut doc, &patch).map_err(|e| {
            AppError::Template(format!("override {} did not apply: {}", override_.key, e))
        })?;
    }

    Ok(serde_json::to_string(&doc)?)
}

/// Interpret an override value the way a YAML scalar would be read
fn scalar_value(raw: &str) -> Value {
    serde_yaml::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> String {
        serde_json::to_string(&json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "nginx" },
            "spec": {
                "replicas": 3,
                "template": {
                    "spec": {
                        "containers": [ { "image": "nginx:1.14", "name": "nginx" } ],
                    },
                },
            },
        }))
        .unwrap()
    }

    fn override_(key: &str, value: &str) -> Override {
        Override {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn no_overrides_is_a_passthrough() {
        let doc = document();
        assert_eq!(override_values(&doc, &[]).unwrap(), doc);
    }

    #[test]
    fn replaces_scalars_with_their_yaml_typed_value() {
        let out = override_values(
            &document(),
            &[
                override_("/spec/replicas", "5"),
                override_("/spec/template/spec/containers/0/image", "nginx:1.25"),
            ],
        )
        .unwrap();

        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["spec"]["replicas"], json!(5));
        assert_eq!(
            value["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("nginx:1.25")
        );
    }

    #[test]
    fn boolean_and_plain_string_values_keep_their_shape() {
        let doc = serde_json::to_string(&json!({
            "metadata": { "name": "nginx" },
            "spec": { "paused": false, "serviceAccountName": "default" },
        }))
        .unwrap();

        let out = override_values(
            &doc,
            &[
                override_("/spec/paused", "true"),
                override_("/spec/serviceAccountName", "deployer"),
            ],
        )
        .unwrap();

        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["spec"]["paused"], json!(true));
        assert_eq!(value["spec"]["serviceAccountName"], json!("deployer"));
    }

    #[test]
    fn overrides_apply_in_order() {
        let out = override_values(
            &document(),
            &[
                override_("/spec/replicas", "5"),
                override_("/spec/replicas", "7"),
            ],
        )
        .unwrap();

        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["spec"]["replicas"], json!(7));
    }

    #[test]
    fn a_pointer_to_nothing_fails_the_render() {
        let err = override_values(&document(), &[override_("/spec/missing/field", "x")])
            .unwrap_err();
        assert!(matches!(err, AppError::Template(_)));
    }
}
