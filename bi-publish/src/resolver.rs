//! Connection resolver backed by a JSON file of caption → target credentials.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use bi_publish_core::contract::{ConnectionResolver, ResolveError, TargetConnection};
use tracing::info;

#[derive(Debug, Default)]
pub struct FileConnectionResolver {
    targets: HashMap<String, TargetConnection>,
}

impl FileConnectionResolver {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read target connections {}", path.display()))?;
        let targets: HashMap<String, TargetConnection> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse target connections {}", path.display()))?;
        info!(path = %path.display(), captions = targets.len(), "Loaded target connections");
        Ok(FileConnectionResolver { targets })
    }

    pub fn from_targets(targets: HashMap<String, TargetConnection>) -> Self {
        FileConnectionResolver { targets }
    }
}

impl ConnectionResolver for FileConnectionResolver {
    fn resolve(&self, caption: &str) -> Result<TargetConnection, ResolveError> {
        self.targets
            .get(caption)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(caption.to_string()))
    }
}
