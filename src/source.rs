//! Delivery boundary for system definitions and their file trees.
//!
//! Catalog lookup and remote retrieval (git repositories, image labels)
//! live behind this boundary; the core only requires that a definition
//! document and its file tree can be materialized locally.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;
use walkdir::WalkDir;

use crate::error::SessionError;
use crate::formats::SystemDefinition;

/// Name of the definition document inside a system's file tree.
pub const DEFINITION_FILE: &str = "definition.json";

/// Delivers a system's definition document together with its file tree.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Materializes the file tree of `name`/`version` into `destination`
    /// and returns the validated definition document found inside it.
    async fn fetch(
        &self,
        name: &str,
        version: &str,
        destination: &Path,
    ) -> Result<SystemDefinition, SessionError>;
}

/// Source backed by a local directory per system: `<root>/<name>/<version>/`.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DefinitionSource for DirectorySource {
    async fn fetch(
        &self,
        name: &str,
        version: &str,
        destination: &Path,
    ) -> Result<SystemDefinition, SessionError> {
        let source_dir = self.root.join(name).join(version);
        if !source_dir.is_dir() {
            return Err(SessionError::Validation(format!(
                "system '{name}:{version}' is not present under '{}'",
                self.root.display()
            )));
        }
        info!("copying system tree from '{}'", source_dir.display());
        copy_tree(&source_dir, destination).await?;

        let raw = tokio::fs::read_to_string(destination.join(DEFINITION_FILE))
            .await
            .map_err(|_| {
                SessionError::Validation(format!(
                    "'{DEFINITION_FILE}' is missing in the file tree of '{name}:{version}'"
                ))
            })?;
        let definition: SystemDefinition = serde_json::from_str(&raw).map_err(|e| {
            SessionError::Validation(format!(
                "'{DEFINITION_FILE}' of '{name}:{version}' cannot be parsed: {e}"
            ))
        })?;
        definition.validate()?;
        Ok(definition)
    }
}

async fn copy_tree(source: &Path, destination: &Path) -> Result<(), SessionError> {
    for entry in WalkDir::new(source) {
        let entry = entry
            .map_err(|e| SessionError::Validation(format!("system tree cannot be read: {e}")))?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = destination.join(relative);
        if entry.file_type().is_dir() {
            tokio::fs::create_dir_all(&target).await?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(entry.path(), &target).await?;
        }
    }
    Ok(())
}
