mod helm;
mod overrides;
mod simple;

pub use overrides::override_values;

use std::path::{Path, PathBuf};

use crate::error::AppResult;
use crate::kubernetes::module::{Module, TemplateType};

/// Renders a checked-out Module into manifest byte blobs, dispatching on the
/// module's template type.
#[derive(Clone, Default)]
pub struct TemplateManager;

impl TemplateManager {
    pub fn new() -> Self {
        TemplateManager
    }

    /// `checkout` is the root of the module's Git checkout; the module path
    /// is resolved inside it.
    pub async fn render(
        &self,
        module: &Module,
        namespace: &str,
        checkout: &Path,
    ) -> AppResult<Vec<Vec<u8>>> {
        let path = module_path(module, checkout);

        match module.spec.template_type {
            TemplateType::Simple => simple::render(&path),
            TemplateType::Helm => helm::render(module, namespace, &path).await,
        }
    }
}

fn module_path(module: &Module, checkout: &Path) -> PathBuf {
    if module.spec.path.is_empty() {
        checkout.to_path_buf()
    } else {
        checkout.join(&module.spec.path)
    }
}
