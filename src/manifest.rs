use kube::api::DynamicObject;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Split a manifest blob into individual documents, each re-serialized as JSON.
///
/// Accepts multi-document YAML (`---` separators) or concatenated JSON,
/// sniffed on the first non-blank byte. Empty documents and documents whose
/// payload is `null` (e.g. comment-only YAML) are discarded.
pub fn split_manifests(manifest: &[u8]) -> AppResult<Vec<String>> {
    let mut documents = Vec::new();

    if looks_like_json(manifest) {
        let stream = serde_json::Deserializer::from_slice(manifest).into_iter::<serde_json::Value>();
        for value in stream {
            push_document(&mut documents, value?)?;
        }
    } else {
        for doc in serde_yaml::Deserializer::from_slice(manifest) {
            let value = serde_json::Value::deserialize(doc)?;
            push_document(&mut documents, value)?;
        }
    }

    Ok(documents)
}

/// Decode one JSON document into a dynamic object
pub fn to_object(document: &str) -> AppResult<DynamicObject> {
    serde_json::from_str(document).map_err(|e| {
        AppError::Decode(format!(
            "document is not a Kubernetes object (apiVersion/kind/metadata): {}",
            e
        ))
    })
}

fn looks_like_json(manifest: &[u8]) -> bool {
    manifest
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == b'{')
        .unwrap_or(false)
}

fn push_document(documents: &mut Vec<String>, value: serde_json::Value) -> AppResult<()> {
    if value.is_null() {
        return Ok(());
    }

    documents.push(serde_json::to_string(&value)?);
    Ok(())
}
