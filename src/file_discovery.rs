use std::path::{Path, PathBuf};

use globset::{GlobSet, GlobSetBuilder};
use tokio::fs;

use crate::error::{EngineError, Result};

/// Async discovery of CFDI XML files under a path, for bulk import.
#[derive(Debug, Clone, Default)]
pub struct FileDiscovery {
    extensions: Vec<String>,
    include_set: Option<GlobSet>,
    exclude_set: Option<GlobSet>,
}

impl FileDiscovery {
    pub fn new() -> Self {
        Self {
            extensions: vec!["xml".to_string()],
            include_set: None,
            exclude_set: None,
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions.into_iter().map(|e| e.to_lowercase()).collect();
        self
    }

    pub fn with_include_patterns(mut self, patterns: Vec<String>) -> Result<Self> {
        self.include_set = build_glob_set(patterns)?;
        Ok(self)
    }

    pub fn with_exclude_patterns(mut self, patterns: Vec<String>) -> Result<Self> {
        self.exclude_set = build_glob_set(patterns)?;
        Ok(self)
    }

    /// Discover matching files under `path` (a file or a directory).
    /// Results are sorted so batch ingestion order is deterministic.
    pub async fn discover_files(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let metadata = fs::metadata(path).await?;
        if metadata.is_file() {
            return Ok(if self.should_process(path) {
                vec![path.to_path_buf()]
            } else {
                Vec::new()
            });
        }

        let mut files = Vec::new();
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut read_dir = match fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "skipping unreadable directory");
                    continue;
                }
            };
            while let Some(entry) = read_dir.next_entry().await? {
                let entry_path = entry.path();
                if entry_path.is_symlink() {
                    continue;
                }
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry_path);
                } else if self.should_process(&entry_path) {
                    files.push(entry_path);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Extension and include/exclude pattern check.
    pub fn should_process(&self, path: &Path) -> bool {
        let extension_ok = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(&ext.to_lowercase()))
            .unwrap_or(false);
        if !extension_ok {
            return false;
        }
        if let Some(include) = &self.include_set
            && !include.is_match(path)
        {
            return false;
        }
        if let Some(exclude) = &self.exclude_set
            && exclude.is_match(path)
        {
            return false;
        }
        true
    }
}

fn build_glob_set(patterns: Vec<String>) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = globset::GlobBuilder::new(&pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| {
                EngineError::Config(format!("invalid glob pattern '{}': {}", pattern, e))
            })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| EngineError::Config(format!("failed to build glob set: {}", e)))?;
    Ok(Some(set))
}
