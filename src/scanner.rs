//! Filesystem inventory source.
//!
//! Walks a root directory and yields one [`ScanItem`] per regular file. The
//! walk is lazy and restartable: every call to [`Scanner::iter`] starts a
//! fresh traversal. Unreadable entries are yielded as failures instead of
//! ending the walk.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ScanConfig;

/// Stat metadata for one discovered file.
#[derive(Debug, Clone)]
pub struct Discovered {
    pub path: PathBuf,
    pub size: u64,
    pub mtime: i64,
    pub mime_hint: Option<String>,
}

#[derive(Debug)]
pub enum ScanItem {
    Found(Discovered),
    Failed { path: PathBuf, error: String },
}

pub struct Scanner {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    skip_dirs: Vec<String>,
    follow_symlinks: bool,
}

impl Scanner {
    pub fn new(root: &Path, config: &ScanConfig) -> Result<Self> {
        if !root.exists() {
            bail!("Scan root does not exist: {}", root.display());
        }
        if !root.is_dir() {
            bail!("Scan root is not a directory: {}", root.display());
        }

        Ok(Self {
            root: root.canonicalize()?,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
            skip_dirs: config.skip_dirs.clone(),
            follow_symlinks: config.follow_symlinks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new traversal. Output is sorted by file name per directory,
    /// so repeated walks over an unchanged tree yield the same order.
    pub fn iter(&self) -> impl Iterator<Item = ScanItem> + '_ {
        WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| {
                if entry.depth() == 0 || !entry.file_type().is_dir() {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !self.skip_dirs.iter().any(|skip| *skip == name)
            })
            .filter_map(move |entry| match entry {
                Ok(entry) => {
                    if !entry.file_type().is_file() {
                        return None;
                    }
                    let path = entry.path();
                    let relative = path.strip_prefix(&self.root).unwrap_or(path);
                    let rel_str = relative.to_string_lossy().to_string();
                    if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                        return None;
                    }
                    Some(match entry.metadata() {
                        Ok(meta) => ScanItem::Found(discovered(path, &meta)),
                        Err(e) => ScanItem::Failed {
                            path: path.to_path_buf(),
                            error: e.to_string(),
                        },
                    })
                }
                Err(e) => Some(ScanItem::Failed {
                    path: e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone()),
                    error: e.to_string(),
                }),
            })
    }
}

fn discovered(path: &Path, meta: &std::fs::Metadata) -> Discovered {
    let mtime = meta
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    Discovered {
        path: path.to_path_buf(),
        size: meta.len(),
        mtime,
        mime_hint: mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string()),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn found_names(scanner: &Scanner) -> Vec<String> {
        scanner
            .iter()
            .filter_map(|item| match item {
                ScanItem::Found(d) => Some(
                    d.path
                        .strip_prefix(scanner.root())
                        .unwrap()
                        .to_string_lossy()
                        .to_string(),
                ),
                ScanItem::Failed { .. } => None,
            })
            .collect()
    }

    #[test]
    fn skips_configured_dirs_and_is_restartable() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("docs")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("docs/b.pdf"), b"%PDF").unwrap();
        fs::write(dir.path().join("a.txt"), b"hi").unwrap();
        fs::write(dir.path().join(".git/config"), b"x").unwrap();

        let scanner = Scanner::new(dir.path(), &ScanConfig::default()).unwrap();
        let first = found_names(&scanner);
        assert_eq!(first, vec!["a.txt".to_string(), format!("docs{}b.pdf", std::path::MAIN_SEPARATOR)]);
        assert_eq!(found_names(&scanner), first);
    }

    #[test]
    fn honors_exclude_globs_and_guesses_mime() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("keep.pdf"), b"%PDF").unwrap();
        fs::write(dir.path().join("drop.tmp"), b"x").unwrap();

        let config = ScanConfig {
            exclude_globs: vec!["**/*.tmp".to_string()],
            ..ScanConfig::default()
        };
        let scanner = Scanner::new(dir.path(), &config).unwrap();
        let items: Vec<Discovered> = scanner
            .iter()
            .filter_map(|i| match i {
                ScanItem::Found(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].size, 4);
        assert_eq!(items[0].mime_hint.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn missing_root_is_rejected() {
        let err = Scanner::new(Path::new("/definitely/not/a/dir"), &ScanConfig::default());
        assert!(err.is_err());
    }
}
