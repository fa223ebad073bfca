use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An image file found under a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub absolute_path: PathBuf,
    /// `/`-separated path below the root; the record identity.
    pub relative_path: String,
    pub size_bytes: u64,
}

/// Walks a directory tree for files with a supported extension.
#[derive(Debug, Clone)]
pub struct Scanner {
    supported_formats: HashSet<String>,
}

impl Scanner {
    pub fn new<S: AsRef<str>>(formats: &[S]) -> Self {
        Self {
            supported_formats: formats
                .iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn validate_root(root: &Path) -> Result<(), ScanError> {
        if !root.exists() {
            return Err(ScanError::InvalidPath {
                path: root.to_string_lossy().to_string(),
            });
        }

        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: format!("{} is not a directory", root.to_string_lossy()),
            });
        }
        Ok(())
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.supported_formats.contains(&ext))
    }

    /// Every supported file under `root`, sorted by relative path.
    /// Unreadable entries are logged and skipped.
    pub fn discover(&self, root: &Path) -> Result<Vec<DiscoveredFile>, ScanError> {
        Self::validate_root(root)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };

            if !entry.file_type().is_file() || !self.is_supported(entry.path()) {
                continue;
            }

            let Some(relative_path) = relative_path(root, entry.path()) else {
                continue;
            };
            let size_bytes = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    log::warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            files.push(DiscoveredFile {
                absolute_path: entry.path().to_path_buf(),
                relative_path,
                size_bytes,
            });
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(files)
    }
}

/// `path` relative to `root`, joined with `/` regardless of platform.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(root: &Path, relative: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_discovers_supported_files_recursively() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "b.JPG");
        touch(temp_dir.path(), "nested/deeper/a.png");
        touch(temp_dir.path(), "notes.txt");
        touch(temp_dir.path(), "noext");

        let scanner = Scanner::new(&["jpg", "png"]);
        let files = scanner.discover(temp_dir.path()).unwrap();

        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["b.JPG", "nested/deeper/a.png"]);
        assert_eq!(files[0].size_bytes, 1);
    }

    #[test]
    fn test_missing_root_is_invalid_path() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = Scanner::new(&["png"]);

        let result = scanner.discover(&temp_dir.path().join("gone"));
        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }

    #[test]
    fn test_file_root_is_invalid_path() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), "a.png");

        let result = Scanner::validate_root(&temp_dir.path().join("a.png"));
        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }

    #[test]
    fn test_relative_path_uses_forward_slashes() {
        let root = Path::new("/photos");
        assert_eq!(
            relative_path(root, &root.join("2024").join("img.png")).as_deref(),
            Some("2024/img.png")
        );
        assert_eq!(relative_path(root, root), None);
    }

    #[test]
    fn test_formats_are_normalized() {
        let scanner = Scanner::new(&[".TIFF".to_string()]);
        assert!(scanner.is_supported(Path::new("scan.tiff")));
        assert!(!scanner.is_supported(Path::new("scan.tif")));
    }
}
