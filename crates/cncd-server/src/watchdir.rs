//! Watch-directory file service
//!
//! Serves `watchdir:load` from a fixed root directory. Only plain G-code
//! files directly addressable under the root are readable; traversal out of
//! the root is rejected.

use cncd_communication::FileService;
use cncd_core::{Result, ValidationError};
use std::path::{Component, Path, PathBuf};

const ALLOWED_EXTENSIONS: [&str; 5] = ["nc", "gcode", "ngc", "cnc", "txt"];

/// Fixed-root program file service
#[derive(Debug, Clone)]
pub struct WatchDir {
    root: PathBuf,
}

impl WatchDir {
    /// Create a service rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        let traversal = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if traversal {
            return Err(ValidationError::FileNotFound { name: name.into() }.into());
        }

        let ext_ok = rel
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !ext_ok {
            return Err(ValidationError::FileNotFound { name: name.into() }.into());
        }

        Ok(self.root.join(rel))
    }

    /// List loadable files under the root
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(names),
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if self.resolve(&name).is_ok() && entry.path().is_file() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

impl FileService for WatchDir {
    fn read_program(&self, name: &str) -> Result<String> {
        let path = self.resolve(name)?;
        std::fs::read_to_string(&path).map_err(|_| {
            ValidationError::FileNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }
}
