use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub submitted: u64,
    pub skipped: u64,
    pub walk_errors: u64,
}

/// Walks `root` without following links and hands every non-empty regular
/// file to `on_file`, stopping early if it returns `false`. Directories,
/// zero-length files, symlinks, devices, pipes and sockets are skipped.
pub fn walk_regular_files<F>(root: &Path, excludes: &ExcludeMatcher, mut on_file: F) -> WalkStats
where
    F: FnMut(PathBuf) -> bool,
{
    let mut stats = WalkStats::default();
    let iter = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !excludes.is_excluded(entry.path()));

    for item in iter {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                debug!("walk error under {}: {}", root.display(), err);
                stats.walk_errors += 1;
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        if !entry.file_type().is_file() {
            stats.skipped += 1;
            continue;
        }
        let size = match entry.metadata() {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                debug!("metadata read failed for {}: {}", entry.path().display(), err);
                stats.walk_errors += 1;
                continue;
            }
        };
        if size == 0 {
            stats.skipped += 1;
            continue;
        }

        stats.submitted += 1;
        if !on_file(entry.into_path()) {
            break;
        }
    }
    stats
}

/// Reported label for a file under the mount: the mount prefix is replaced
/// by `/` so the label reads like a path on the original volume.
pub fn subject_label(mount_dir: &Path, path: &Path) -> String {
    match path.strip_prefix(mount_dir) {
        Ok(relative) => format!("/{}", relative.to_string_lossy()),
        Err(_) => path.to_string_lossy().to_string(),
    }
}

/// Glob and substring exclusions applied to walked paths and object keys.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    globset: Option<GlobSet>,
    substrings: Vec<String>,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> Self {
        if patterns.is_empty() {
            return Self::default();
        }

        let mut builder = GlobSetBuilder::new();
        let mut substrings = Vec::new();
        for pattern in patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }

            if is_plain_substring_pattern(pattern) {
                substrings.push(pattern.to_lowercase());
                continue;
            }

            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                }
                Err(err) => {
                    warn!("invalid exclude glob '{pattern}': {err}; using substring fallback");
                    substrings.push(pattern.to_lowercase());
                }
            }
        }

        let globset = match builder.build() {
            Ok(set) => Some(set),
            Err(err) => {
                warn!("failed to compile exclude glob set: {err}; glob excludes disabled");
                None
            }
        };

        Self {
            globset,
            substrings,
        }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        if let Some(globset) = &self.globset {
            if globset.is_match(path) {
                return true;
            }
        }

        if self.substrings.is_empty() {
            return false;
        }

        let lowered = path.to_string_lossy().to_lowercase();
        self.substrings
            .iter()
            .any(|pattern| lowered.contains(pattern))
    }

    pub fn is_excluded_key(&self, key: &str) -> bool {
        self.is_excluded(Path::new(key))
    }
}

fn is_plain_substring_pattern(pattern: &str) -> bool {
    !pattern
        .chars()
        .any(|ch| matches!(ch, '*' | '?' | '[' | ']' | '{' | '}'))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::{subject_label, walk_regular_files, ExcludeMatcher};

    #[test]
    fn exclude_matcher_matches_glob_and_substring() {
        let matcher = ExcludeMatcher::new(&[
            "**/*.tmp".to_string(),
            "[".to_string(),
            "node_modules".to_string(),
        ]);

        assert!(matcher.is_excluded(Path::new("/snapshot/repo/a.tmp")));
        assert!(matcher.is_excluded(Path::new("/snapshot/node_modules/pkg/index.js")));
        assert!(!matcher.is_excluded(Path::new("/snapshot/src/main.rs")));
        assert!(matcher.is_excluded_key("logs/[old]/x"));
    }

    #[test]
    fn walk_skips_empty_files_symlinks_and_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("etc/nested")).expect("mkdir");
        fs::write(root.join("etc/passwd"), b"root:x:0:0").expect("write");
        fs::write(root.join("etc/nested/a.bin"), b"abc").expect("write");
        fs::write(root.join("payload.sh"), b"#!/bin/sh").expect("write");
        fs::write(root.join("empty"), b"").expect("write");
        std::os::unix::fs::symlink(root.join("etc/passwd"), root.join("link")).expect("symlink");

        let mut seen = Vec::new();
        let stats = walk_regular_files(root, &ExcludeMatcher::default(), |path| {
            seen.push(subject_label(root, &path));
            true
        });
        seen.sort();

        assert_eq!(seen, vec!["/etc/nested/a.bin", "/etc/passwd", "/payload.sh"]);
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.skipped, 2);
    }

    #[test]
    fn excluded_directories_are_not_descended() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        fs::create_dir_all(root.join("proc/1")).expect("mkdir");
        fs::write(root.join("proc/1/status"), b"x").expect("write");
        fs::write(root.join("keep"), b"x").expect("write");

        let matcher = ExcludeMatcher::new(&["**/proc".to_string()]);
        let mut seen = Vec::new();
        walk_regular_files(root, &matcher, |path| {
            seen.push(path);
            true
        });
        assert_eq!(seen, vec![root.join("keep")]);
    }

    #[test]
    fn label_strips_mount_prefix() {
        assert_eq!(
            subject_label(Path::new("./snapshot"), Path::new("./snapshot/etc/shadow")),
            "/etc/shadow"
        );
        assert_eq!(
            subject_label(Path::new("/mnt/a"), Path::new("/other/file")),
            "/other/file"
        );
    }
}
