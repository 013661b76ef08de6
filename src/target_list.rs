use std::collections::HashSet;
use std::path::Path;

use anyhow::Context as _;

/// Reads a plain-text identifier list: one identifier per line, blank lines
/// and `#` comments ignored, surrounding whitespace trimmed.
pub fn read_identifier_list(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read identifier list: {}", path.display()))?;
    Ok(parse_identifier_list(&contents))
}

pub fn parse_identifier_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

/// Story ids excluded from a scrape. Loaded once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct SkipSet {
    ids: HashSet<String>,
}

impl SkipSet {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let ids = read_identifier_list(path).context("load skip list")?;
        Ok(Self::new(ids))
    }

    pub fn contains(&self, story_id: &str) -> bool {
        self.ids.contains(story_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
