use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{PluginError, PluginHooks, PluginInfo, PluginManifest, PluginRuntime};
use crate::config::PluginSettings;

const MANIFEST_FILE: &str = "plugin.json";
const SIGNATURE_FILE: &str = "plugin.sig";

/// Plugins unpacked under `PluginSettings.Directory`, one directory per id.
/// Server-side hooks are attached in-process with [`LocalRuntime::register_hooks`].
pub struct LocalRuntime {
    dir: PathBuf,
    client_dir: PathBuf,
    require_signature: bool,
    active: RwLock<HashSet<String>>,
    hooks: RwLock<HashMap<String, Arc<dyn PluginHooks>>>,
}

impl LocalRuntime {
    pub fn new(settings: &PluginSettings) -> Self {
        Self {
            dir: settings.directory.clone(),
            client_dir: settings.client_directory.clone(),
            require_signature: settings.require_plugin_signature,
            active: RwLock::new(HashSet::new()),
            hooks: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_hooks(&self, id: &str, hooks: Arc<dyn PluginHooks>) {
        self.hooks.write().insert(id.to_string(), hooks);
    }

    #[cfg(test)]
    pub(crate) fn mark_active(&self, id: &str) {
        self.active.write().insert(id.to_string());
    }

    fn plugin_path(&self, id: &str) -> Result<PathBuf, PluginError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
            && !id.starts_with('.');
        if !valid {
            return Err(PluginError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(id))
    }

    async fn read_manifest(path: &Path) -> Result<PluginManifest, PluginError> {
        let raw = tokio::fs::read(path.join(MANIFEST_FILE)).await?;
        let manifest: PluginManifest = serde_json::from_slice(&raw).map_err(|e| PluginError::Manifest {
            id: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if manifest.id.is_empty() {
            return Err(PluginError::Manifest {
                id: path.display().to_string(),
                reason: "missing id".into(),
            });
        }
        Ok(manifest)
    }

    async fn manifest_for(&self, id: &str) -> Result<PluginManifest, PluginError> {
        let path = self.plugin_path(id)?;
        match Self::read_manifest(&path).await {
            Err(PluginError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(PluginError::NotFound(id.to_string())),
            other => other,
        }
    }
}

#[async_trait]
impl PluginRuntime for LocalRuntime {
    async fn available(&self) -> Result<Vec<PluginInfo>, PluginError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            match Self::read_manifest(&path).await {
                Ok(manifest) => {
                    let active = self.active.read().contains(&manifest.id);
                    out.push(PluginInfo { manifest, path, active });
                }
                Err(e) => debug!("skipping {}: {}", path.display(), e),
            }
        }
        out.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        Ok(out)
    }

    async fn activate(&self, id: &str) -> Result<(), PluginError> {
        let manifest = self.manifest_for(id).await?;
        if self.require_signature {
            let sig = self.plugin_path(id)?.join(SIGNATURE_FILE);
            if !tokio::fs::try_exists(&sig).await.unwrap_or(false) {
                return Err(PluginError::Unsigned(id.to_string()));
            }
        }
        if manifest.webapp.is_some() {
            self.unpack_webapp_bundle(id).await?;
        }
        self.active.write().insert(id.to_string());
        Ok(())
    }

    async fn deactivate(&self, id: &str) -> bool {
        self.active.write().remove(id)
    }

    async fn remove(&self, id: &str) -> Result<(), PluginError> {
        let path = self.plugin_path(id)?;
        self.active.write().remove(id);
        self.hooks.write().remove(id);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(PluginError::NotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = tokio::fs::remove_dir_all(self.client_dir.join(id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove webapp bundle for {}: {}", id, e);
            }
        }
        Ok(())
    }

    /// Copy the webapp bundle into the client directory as `<id>/<id>_bundle.js`.
    async fn unpack_webapp_bundle(&self, id: &str) -> Result<PluginManifest, PluginError> {
        let mut manifest = self.manifest_for(id).await?;
        let Some(webapp) = manifest.webapp.as_mut() else {
            return Err(PluginError::Manifest {
                id: id.to_string(),
                reason: "no webapp section".into(),
            });
        };
        let source = self.plugin_path(id)?.join(&webapp.bundle_path);
        let dest_dir = self.client_dir.join(id);
        tokio::fs::create_dir_all(&dest_dir).await?;
        let file_name = format!("{}_bundle.js", id);
        tokio::fs::copy(&source, dest_dir.join(&file_name)).await?;
        webapp.bundle_path = format!("{}/{}", id, file_name);
        Ok(manifest)
    }

    fn is_active(&self, id: &str) -> bool {
        self.active.read().contains(id)
    }

    fn hooks_for_plugin(&self, id: &str) -> Option<Arc<dyn PluginHooks>> {
        if !self.is_active(id) {
            return None;
        }
        self.hooks.read().get(id).cloned()
    }

    fn plugin_dir(&self) -> PathBuf {
        self.dir.clone()
    }
}
