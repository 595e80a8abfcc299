use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

/// Collect every YAML/JSON file under the module path, one blob per file.
///
/// Files are gathered depth-first and sorted by path so a render is
/// deterministic across reconciles.
pub fn render(path: &Path) -> AppResult<Vec<Vec<u8>>> {
    if !path.is_dir() {
        return Err(AppError::Template(format!(
            "module path {} is not a directory",
            path.display()
        )));
    }

    let mut files = Vec::new();
    collect_manifest_files(path, &mut files)?;
    files.sort();

    let mut manifests = Vec::with_capacity(files.len());
    for file in files {
        manifests.push(std::fs::read(&file)?);
    }

    Ok(manifests)
}

fn collect_manifest_files(dir: &Path, files: &mut Vec<PathBuf>) -> AppResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            // .git and other dot directories carry no manifests
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(false);
            if !hidden {
                collect_manifest_files(&path, files)?;
            }
            continue;
        }

        let is_manifest = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e.to_ascii_lowercase().as_str(), "yaml" | "yml" | "json"))
            .unwrap_or(false);
        if is_manifest {
            files.push(path);
        }
    }

    Ok(())
}
