//! Settings persistence
//!
//! Holds the live configuration behind a lock, loads and saves it from the
//! platform config directory, and notifies registered listeners on change
//! so the engine can re-emit `config:change` to clients.

use crate::config::Config;
use cncd_core::Result;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

type ChangeListener = Box<dyn Fn() + Send + Sync>;

/// Shared configuration store
pub struct ConfigStore {
    path: PathBuf,
    config: RwLock<Config>,
    listeners: RwLock<Vec<ChangeListener>>,
}

impl ConfigStore {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cncd")
            .join("config.json")
    }

    /// Create a store with defaults, bound to the given file path
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            path: path.into(),
            config: RwLock::new(Config::default()),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Load the store from its file, falling back to defaults when the file
    /// does not exist yet
    pub fn load(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        let config = if path.exists() {
            Config::load_from_file(&path)?
        } else {
            tracing::info!("No config file at {}, using defaults", path.display());
            Config::default()
        };

        Ok(Arc::new(Self {
            path,
            config: RwLock::new(config),
            listeners: RwLock::new(Vec::new()),
        }))
    }

    /// Path this store persists to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current configuration
    pub fn get(&self) -> Config {
        self.config.read().clone()
    }

    /// Mutate the configuration, persist it, and notify listeners
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        {
            let mut config = self.config.write();
            mutate(&mut config);
            config.validate()?;
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent).ok();
            }
            config.save_to_file(&self.path)?;
        }

        for listener in self.listeners.read().iter() {
            listener();
        }
        Ok(())
    }

    /// Register a change listener
    ///
    /// The listener runs on the updating thread and should return quickly.
    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners.write().push(Box::new(listener));
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("path", &self.path)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MacroRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn update_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::new(&path);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        store.on_change(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        store
            .update(|config| {
                config.macros.push(MacroRecord {
                    id: "m1".into(),
                    name: "Home".into(),
                    content: "$H".into(),
                });
            })
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(path.exists());

        let reloaded = ConfigStore::load(&path).unwrap();
        assert!(reloaded.get().find_macro("m1").is_some());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("nope.json")).unwrap();
        assert!(store.get().macros.is_empty());
    }
}
