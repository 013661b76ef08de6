use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::archive_store::{CHAPTERS_FILE, METADATA_FILE};

const MAX_DISCOVERY_DEPTH: usize = 4;

/// A directory qualifies when it holds story metadata and a chapter store.
pub fn is_archive(path: &Path) -> bool {
    path.is_dir() && path.join(METADATA_FILE).is_file() && path.join(CHAPTERS_FILE).is_file()
}

/// All archives under `root` (including `root` itself), sorted.
///
/// Archives are not descended into, so rendered views stored in situ are
/// never mistaken for further input.
pub fn discover_archives(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];

    while let Some((current, depth)) = stack.pop() {
        if is_archive(&current) {
            found.push(current);
            continue;
        }
        if depth >= MAX_DISCOVERY_DEPTH {
            continue;
        }

        let entries = fs::read_dir(&current)
            .with_context(|| format!("read dir: {}", current.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("list dir: {}", current.display()))?;
        for entry in entries {
            let file_type = entry.file_type().context("read entry type")?;
            if file_type.is_dir() {
                stack.push((entry.path(), depth + 1));
            }
        }
    }

    found.sort();
    Ok(found)
}

/// Most recent `data-*` output directory under `parent`, by name.
pub fn latest_data_dir(parent: &Path) -> anyhow::Result<Option<PathBuf>> {
    let mut candidates = fs::read_dir(parent)
        .with_context(|| format!("read dir: {}", parent.display()))?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("data-"))
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    candidates.sort();
    Ok(candidates.pop())
}
