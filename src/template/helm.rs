use std::path::Path;

use kube::ResourceExt;
use tokio::process::Command;

use crate::error::{AppError, AppResult};
use crate::kubernetes::module::Module;

/// Expand a Helm chart to rendered YAML with `helm template`.
///
/// The release name is the module name, so resources rendered from the same
/// chart by different modules stay distinguishable. The chart is rendered
/// client-side only; no release is installed.
pub async fn render(module: &Module, namespace: &str, chart_path: &Path) -> AppResult<Vec<Vec<u8>>> {
    let release = module.name_any();

    let output = Command::new("helm")
        .arg("template")
        .arg(&release)
        .arg(chart_path)
        .arg("--namespace")
        .arg(namespace)
        .output()
        .await
        .map_err(|e| AppError::Template(format!("failed to run helm: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Template(format!(
            "helm template failed for {}: {}",
            release,
            stderr.trim()
        )));
    }

    Ok(vec![output.stdout])
}
