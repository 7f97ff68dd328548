//! Effect library lookup
//!
//! Effects are short clips in a single directory, addressed by a
//! case-insensitive name prefix (`"applause"` finds `Applause-01.mp3`).

use std::path::{Path, PathBuf};

use crate::error::EffectError;

/// Directory of effect clips
#[derive(Debug, Clone)]
pub struct EffectLibrary {
    dir: PathBuf,
}

impl EffectLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve an effect name to the path of the first matching file
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, EffectError> {
        let wanted = name.trim().to_lowercase();
        if wanted.is_empty() {
            return Err(EffectError::NotFound(name.to_string()));
        }

        let chosen = self
            .list()
            .await?
            .into_iter()
            .find(|entry| entry.to_lowercase().starts_with(&wanted))
            .ok_or_else(|| EffectError::NotFound(name.to_string()))?;

        Ok(self.dir.join(chosen))
    }

    /// File names in the effects directory, sorted
    pub async fn list(&self) -> Result<Vec<String>, EffectError> {
        let io_error = |source| EffectError::Io {
            path: self.dir.clone(),
            source,
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_error)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
