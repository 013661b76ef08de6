use std::fs::OpenOptions;
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use chrono::Utc;

use crate::formats::FatQuestRecord;

pub const LEDGER_FILE: &str = "fat_quests.jsonl";

/// Append-only record of stories that failed to archive.
#[derive(Debug)]
pub struct FailureLedger {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl FailureLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append_lock: Mutex::new(()),
        }
    }

    pub fn in_dir(output_root: &Path) -> Self {
        Self::new(output_root.join(LEDGER_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, story_id: &str, reason: &str) -> anyhow::Result<()> {
        let record = FatQuestRecord {
            story_id: story_id.to_owned(),
            reason: reason.to_owned(),
            recorded_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&record).context("serialize fat quest record")?;
        line.push(b'\n');

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("fat quest ledger lock poisoned"))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir: {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open fat quest ledger: {}", self.path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("append fat quest ledger: {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush fat quest ledger: {}", self.path.display()))?;

        tracing::info!(story_id, ledger = %self.path.display(), "recorded fat quest");
        Ok(())
    }

    /// All records in append order; duplicates are kept.
    pub fn list(&self) -> anyhow::Result<Vec<FatQuestRecord>> {
        let file = match OpenOptions::new().read(true).open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("open fat quest ledger: {}", self.path.display()));
            }
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.context("read fat quest ledger line")?;
            if line.trim().is_empty() {
                continue;
            }
            let record: FatQuestRecord =
                serde_json::from_str(&line).context("parse fat quest record")?;
            records.push(record);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_appended_and_never_deduplicated() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let ledger = FailureLedger::in_dir(temp.path());
        assert!(ledger.list()?.is_empty());

        ledger.record("s1", "chapter fetch failed")?;
        ledger.record("s2", "metadata not found")?;
        ledger.record("s1", "chapter fetch failed")?;

        let ids = ledger
            .list()?
            .into_iter()
            .map(|r| r.story_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["s1", "s2", "s1"]);
        Ok(())
    }
}
