//! Upload discovery.
//!
//! Expands the paths named on the command line into a list of upload
//! files. Directories are walked for accepted extensions; files named
//! explicitly are always kept so an unsupported one is reported rather
//! than silently ignored.

use crate::ingest::{extension_of, is_accepted_extension};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Directory names never descended into.
const EXCLUDED_DIRS: [&str; 4] = ["target", "node_modules", "__pycache__", "venv"];

/// A file selected for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
    /// Lowercased extension without the dot.
    pub extension: String,
}

impl ScannedFile {
    fn from_path(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)
            .with_context(|| format!("Failed to read metadata: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            size: metadata.len(),
            extension: extension_of(path),
        })
    }
}

/// Walks input paths for uploads.
#[derive(Debug, Default)]
pub struct FileScanner {
    max_depth: Option<usize>,
}

impl FileScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit how deep directories are walked.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Expand inputs into uploads, sorted by path and without duplicates.
    pub fn scan(&self, inputs: &[PathBuf]) -> Result<Vec<ScannedFile>> {
        let mut paths = BTreeSet::new();

        for input in inputs {
            if input.is_dir() {
                self.walk_dir(input, &mut paths);
            } else if input.exists() {
                paths.insert(input.clone());
            } else {
                anyhow::bail!("Input not found: {}", input.display());
            }
        }

        let files = paths
            .iter()
            .map(|p| ScannedFile::from_path(p))
            .collect::<Result<Vec<_>>>()?;

        debug!("Discovered {} upload(s)", files.len());
        Ok(files)
    }

    fn walk_dir(&self, root: &Path, paths: &mut BTreeSet<PathBuf>) {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_excluded(e));

        for entry in walker {
            match entry {
                Ok(entry) => {
                    if entry.file_type().is_file()
                        && is_accepted_extension(&extension_of(entry.path()))
                    {
                        paths.insert(entry.path().to_path_buf());
                    }
                }
                Err(e) => warn!("Error accessing entry: {}", e),
            }
        }
    }
}

/// Hidden entries and build/dependency directories.
fn is_excluded(entry: &DirEntry) -> bool {
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return true;
    }
    entry.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_scan_directory_filters_extensions() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "jan/ERA_JAN.835", "ST*835*0001~");
        touch(dir.path(), "feb/ERA_FEB.DAT", "ST*835*0002~");
        touch(dir.path(), "exports/denials.csv", "Payer,CPT\n");
        touch(dir.path(), "notes/readme.txt", "notes");
        touch(dir.path(), "scans/eob.pdf", "%PDF");
        touch(dir.path(), ".cache/old.835", "ST*835*0003~");

        let files = FileScanner::new().scan(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();

        assert_eq!(names, vec!["denials.csv", "ERA_FEB.DAT", "ERA_JAN.835"]);
        assert!(files.iter().any(|f| f.extension == "dat"));
    }

    #[test]
    fn test_explicit_files_are_kept() {
        let dir = TempDir::new().unwrap();
        let pdf = touch(dir.path(), "eob.pdf", "%PDF");
        let era = touch(dir.path(), "era.835", "ST*835*0001~");

        let files = FileScanner::new().scan(&[pdf.clone(), era.clone(), era]).unwrap();

        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.extension == "pdf"));
        assert_eq!(files.iter().find(|f| f.extension == "835").unwrap().size, 12);
    }

    #[test]
    fn test_max_depth() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "top.835", "ST~");
        touch(dir.path(), "a/b/deep.835", "ST~");

        let files = FileScanner::new()
            .with_max_depth(1)
            .scan(&[dir.path().to_path_buf()])
            .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_missing_input_is_error() {
        assert!(FileScanner::new()
            .scan(&[PathBuf::from("no/such/upload.835")])
            .is_err());
    }
}
