//! Repository file tree snapshot.
//!
//! A `FileTree` holds relative file and directory paths (always `/`-separated)
//! plus truncated contents of dependency manifests and a sample of source
//! files. It is the only view of a checkout the classifier and the structure
//! renderer ever see.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::ClassifyError;

/// Directories never descended into.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".env",
    "dist",
    "build",
    ".next",
    ".nuxt",
    "coverage",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    ".eggs",
    "target",
    "vendor",
];

const MANIFEST_NAMES: &[&str] = &[
    // Python
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "Pipfile",
    "environment.yml",
    // JavaScript
    "package.json",
    "bower.json",
    "lerna.json",
    // Ruby
    "Gemfile",
    // Go
    "go.mod",
    "Gopkg.toml",
    // Rust
    "Cargo.toml",
    // Java
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "settings.gradle",
    // C#
    "packages.config",
    "Directory.Build.props",
    // PHP
    "composer.json",
];

const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "js", "mjs", "ts", "tsx", "jsx", "vue", "svelte", "go", "rs", "java", "kt", "rb",
    "php", "cs", "tf", "hcl", "yaml", "yml",
];

/// True for recognised dependency manifests. Lock files never match.
pub fn is_dependency_manifest(file_name: &str) -> bool {
    if file_name.ends_with(".lock") || file_name == "go.sum" || file_name == "package-lock.json" {
        return false;
    }
    if MANIFEST_NAMES.contains(&file_name) {
        return true;
    }
    (file_name.starts_with("requirements") && file_name.ends_with(".txt"))
        || file_name.ends_with(".gemspec")
        || file_name.ends_with(".csproj")
}

fn is_source_file(file_name: &str) -> bool {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| SOURCE_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

fn is_skipped_dir(name: &str) -> bool {
    SKIP_DIRS.contains(&name) || name.ends_with(".egg-info")
}

fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Limits applied while scanning a checkout.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub max_depth: usize,
    pub max_files: usize,
    /// Bytes read from each manifest or source sample.
    pub max_content_bytes: u64,
    pub max_source_samples: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_files: 5000,
            max_content_bytes: 16 * 1024,
            max_source_samples: 40,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileTree {
    root: Option<PathBuf>,
    files: BTreeSet<String>,
    dirs: BTreeSet<String>,
    contents: BTreeMap<String, String>,
}

impl FileTree {
    /// Build a tree from relative file paths; parent directories are derived.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = FileTree::default();
        for path in paths {
            tree.insert_file(path.as_ref());
        }
        tree
    }

    /// Attach file content (manifest or source sample).
    pub fn with_content(mut self, path: &str, content: impl Into<String>) -> Self {
        self.insert_file(path);
        self.contents.insert(normalize(path), content.into());
        self
    }

    fn insert_file(&mut self, path: &str) {
        let path = normalize(path);
        if path.is_empty() {
            return;
        }
        let mut parent = path.as_str();
        while let Some((dir, _)) = parent.rsplit_once('/') {
            self.dirs.insert(dir.to_string());
            parent = dir;
        }
        self.files.insert(path);
    }

    pub fn scan(root: &Path) -> Result<Self, ClassifyError> {
        Self::scan_with(root, &ScanConfig::default())
    }

    /// Walk `root`, honouring `.gitignore` and skipping [`SKIP_DIRS`].
    pub fn scan_with(root: &Path, config: &ScanConfig) -> Result<Self, ClassifyError> {
        let meta = std::fs::metadata(root).map_err(|e| ClassifyError::Inaccessible {
            path: root.display().to_string(),
            reason: e.to_string(),
        })?;
        if !meta.is_dir() {
            return Err(ClassifyError::Inaccessible {
                path: root.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        let mut tree = FileTree {
            root: Some(root.to_path_buf()),
            ..FileTree::default()
        };
        let mut samples = 0usize;

        let walker = WalkBuilder::new(root)
            .max_depth(Some(config.max_depth))
            .hidden(false)
            .git_ignore(true)
            .require_git(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(|entry| {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                !(is_dir && entry.depth() > 0 && is_skipped_dir(&entry.file_name().to_string_lossy()))
            })
            .build();

        for result in walker {
            let entry = match result {
                Ok(e) => e,
                Err(err) => {
                    warn!(error = %err, "failed to read directory entry");
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            let Some(rel) = relative(root, entry.path()) else {
                debug!(path = %entry.path().display(), "skipping non-utf8 path");
                continue;
            };

            let file_type = match entry.file_type() {
                Some(t) => t,
                None => continue,
            };
            if file_type.is_dir() {
                tree.dirs.insert(rel);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            if tree.files.len() >= config.max_files {
                warn!(
                    max_files = config.max_files,
                    root = %root.display(),
                    "reached file limit, stopping scan"
                );
                break;
            }

            let name = base_name(&rel).to_string();
            let wants_content = if is_dependency_manifest(&name) {
                true
            } else if samples < config.max_source_samples && is_source_file(&name) {
                samples += 1;
                true
            } else {
                false
            };
            if wants_content {
                match read_prefix(entry.path(), config.max_content_bytes) {
                    Ok(text) => {
                        tree.contents.insert(rel.clone(), text);
                    }
                    Err(e) => warn!(path = %rel, error = %e, "failed to read file content"),
                }
            }
            tree.insert_file(&rel);
        }

        debug!(
            root = %root.display(),
            files = tree.files.len(),
            dirs = tree.dirs.len(),
            "scanned repository tree"
        );
        Ok(tree)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.dirs.iter().map(String::as_str)
    }

    pub fn content(&self, path: &str) -> Option<&str> {
        self.contents.get(path).map(String::as_str)
    }

    /// `(path, content)` of every captured dependency manifest, in path order.
    pub fn manifests(&self) -> impl Iterator<Item = (&str, &str)> {
        self.contents
            .iter()
            .filter(|(path, _)| is_dependency_manifest(base_name(path)))
            .map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// `(path, content)` of captured source samples, in path order.
    pub fn source_samples(&self) -> impl Iterator<Item = (&str, &str)> {
        self.contents
            .iter()
            .filter(|(path, _)| !is_dependency_manifest(base_name(path)))
            .map(|(p, c)| (p.as_str(), c.as_str()))
    }
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches("./")
        .trim_matches('/')
        .to_string()
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

fn read_prefix(path: &Path, limit: u64) -> std::io::Result<String> {
    let mut buf = Vec::new();
    File::open(path)?.take(limit).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
