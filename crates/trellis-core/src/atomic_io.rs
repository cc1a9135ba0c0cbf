use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::ids::next_id;

/// Writes text using a temp file + rename so readers never observe partial data.
///
/// A crash between the temporary write and the rename leaves the previous
/// record intact; readers see either the old complete record or the new one.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("destination path cannot be empty");
    }
    if path.exists() && path.is_dir() {
        bail!("destination path '{}' is a directory", path.display());
    }

    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;

    // Hidden sibling named by the id generator; one process owns the state
    // dir, so process-local uniqueness is enough.
    let temp_name = format!(
        ".{}.{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("record"),
        next_id("swap")
    );
    let temp_path = parent_dir.join(temp_name);
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to promote temporary file {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}
