use std::fs::{self, OpenOptions};
use std::io::{BufRead as _, BufReader, Write as _};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use sha2::Digest as _;

use crate::formats::{ArchiveManifest, ChatReply, Chapter, StoryMetadata, TargetDescriptor};

pub const METADATA_FILE: &str = "metadata.json";
pub const CHAPTERS_FILE: &str = "chapters.jsonl";
pub const CHAT_FILE: &str = "chat.jsonl";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const MEDIA_DIR: &str = "media";

/// Story ids and author handles become directory names.
pub fn is_safe_path_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment.len() <= 128
        && !segment
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
}

/// File name for a media asset, derived only from its remote reference.
pub fn media_file_name(image_ref: &str) -> String {
    let digest = sha2::Sha256::digest(image_ref.as_bytes());
    format!("{}.{}", hex::encode(digest), media_extension(image_ref))
}

fn media_extension(image_ref: &str) -> String {
    let path = match url::Url::parse(image_ref) {
        Ok(url) => url.path().to_owned(),
        Err(_) => image_ref
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_owned(),
    };
    let last_segment = path.rsplit('/').next().unwrap_or_default();
    match last_segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ext.to_ascii_lowercase()
        }
        _ => "bin".to_owned(),
    }
}

/// One story's directory on disk.
#[derive(Debug, Clone)]
pub struct StoryArchiveDir {
    root: PathBuf,
}

impl StoryArchiveDir {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<out>/<story_id>` or `<out>/<user>/<story_id>` when the target names an author.
    pub fn for_target(output_root: &Path, target: &TargetDescriptor) -> anyhow::Result<Self> {
        if !is_safe_path_segment(&target.story_id) {
            anyhow::bail!("story id is not a valid directory name: {:?}", target.story_id);
        }
        let mut root = output_root.to_path_buf();
        if let Some(user) = target.user.as_deref() {
            if !is_safe_path_segment(user) {
                anyhow::bail!("author handle is not a valid directory name: {user:?}");
            }
            root = root.join(user);
        }
        Ok(Self::open(root.join(&target.story_id)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    pub fn chapters_path(&self) -> PathBuf {
        self.root.join(CHAPTERS_FILE)
    }

    pub fn chat_path(&self) -> PathBuf {
        self.root.join(CHAT_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.root.join(MEDIA_DIR)
    }

    pub fn media_path(&self, image_ref: &str) -> PathBuf {
        self.media_dir().join(media_file_name(image_ref))
    }

    /// Creates the directory skeleton; existing files are left untouched.
    pub fn ensure_layout(&self) -> anyhow::Result<()> {
        fs::create_dir_all(self.media_dir())
            .with_context(|| format!("create archive dir: {}", self.root.display()))?;
        for path in [self.chapters_path(), self.chat_path()] {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("create store: {}", path.display()))?;
        }
        Ok(())
    }

    pub fn load_manifest(&self) -> anyhow::Result<Option<ArchiveManifest>> {
        read_json(&self.manifest_path())
    }

    pub fn save_manifest(&self, manifest: &ArchiveManifest) -> anyhow::Result<()> {
        write_json_atomic(&self.manifest_path(), manifest).context("write manifest")
    }

    /// Returns `true` when the file changed.
    pub fn write_metadata(&self, metadata: &StoryMetadata) -> anyhow::Result<bool> {
        let path = self.metadata_path();
        let data = to_pretty_json(metadata)?;
        match fs::read(&path) {
            Ok(existing) if existing == data => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("read metadata: {}", path.display()));
            }
        }
        write_bytes_atomic(&path, &data).context("write metadata")?;
        Ok(true)
    }

    pub fn read_metadata(&self) -> anyhow::Result<StoryMetadata> {
        read_json(&self.metadata_path())?
            .ok_or_else(|| anyhow::anyhow!("missing {METADATA_FILE} in {}", self.root.display()))
    }

    /// Appends and syncs one chapter so the manifest can safely move past it.
    pub fn append_chapter(&self, chapter: &Chapter) -> anyhow::Result<()> {
        append_jsonl(&self.chapters_path(), std::slice::from_ref(chapter))
    }

    pub fn append_chat(&self, replies: &[ChatReply]) -> anyhow::Result<()> {
        append_jsonl(&self.chat_path(), replies)
    }

    pub fn read_chapters(&self) -> anyhow::Result<Vec<Chapter>> {
        read_jsonl(&self.chapters_path())
    }

    /// A story archived with chat skipped may have no chat store at all.
    pub fn read_chat(&self) -> anyhow::Result<Vec<ChatReply>> {
        if !self.chat_path().exists() {
            return Ok(Vec::new());
        }
        read_jsonl(&self.chat_path())
    }

    /// Drops store lines written after the manifest's last update.
    ///
    /// An interruption between a sync and the manifest write leaves records
    /// the manifest does not know about; the next fetch brings them back.
    pub fn reconcile(&self, manifest: &ArchiveManifest) -> anyhow::Result<()> {
        let chapters = self.read_chapters().context("read chapter store")?;
        let ahead = chapters
            .iter()
            .any(|chapter| chapter.position > manifest.last_chapter_position);
        if ahead || has_torn_tail(&self.chapters_path())? {
            let kept = chapters
                .into_iter()
                .filter(|chapter| chapter.position <= manifest.last_chapter_position)
                .collect::<Vec<_>>();
            tracing::warn!(
                story_id = %manifest.story_id,
                kept = kept.len(),
                "chapter store ahead of manifest; truncating"
            );
            rewrite_jsonl(&self.chapters_path(), &kept)?;
        }

        let chat = self.read_chat().context("read chat store")?;
        let keep = usize::try_from(manifest.chat_reply_count)
            .unwrap_or(usize::MAX)
            .min(chat.len());
        if chat.len() > keep || has_torn_tail(&self.chat_path())? {
            tracing::warn!(
                story_id = %manifest.story_id,
                kept = keep,
                "chat store ahead of manifest; truncating"
            );
            rewrite_jsonl(&self.chat_path(), &chat[..keep])?;
        }
        Ok(())
    }

    pub fn has_media(&self, image_ref: &str) -> bool {
        self.media_path(image_ref).is_file()
    }

    pub fn write_media(&self, image_ref: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.media_path(image_ref);
        write_bytes_atomic(&path, bytes).with_context(|| format!("write media for {image_ref}"))?;
        Ok(path)
    }
}

fn to_pretty_json<T: serde::Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut data = serde_json::to_vec_pretty(value).context("serialize json")?;
    data.push(b'\n');
    Ok(data)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read: {}", path.display())),
    };
    let value =
        serde_json::from_slice(&bytes).with_context(|| format!("parse json: {}", path.display()))?;
    Ok(Some(value))
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    write_bytes_atomic(path, &to_pretty_json(value)?)
}

fn write_bytes_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let mut file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&tmp_path)
        .with_context(|| format!("create tmp: {}", tmp_path.display()))?;
    file.write_all(data)
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

fn append_jsonl<T: serde::Serialize>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record).context("serialize jsonl record")?;
        buf.push(b'\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open for append: {}", path.display()))?;
    file.write_all(&buf)
        .with_context(|| format!("append: {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync: {}", path.display()))?;
    Ok(())
}

fn rewrite_jsonl<T: serde::Serialize>(path: &Path, records: &[T]) -> anyhow::Result<()> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record).context("serialize jsonl record")?;
        buf.push(b'\n');
    }
    write_bytes_atomic(path, &buf)
}

fn has_torn_tail(path: &Path) -> anyhow::Result<bool> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes.last().is_some_and(|last| *last != b'\n')),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("read: {}", path.display())),
    }
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("open: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut lines = reader.lines().enumerate().peekable();
    while let Some((idx, line)) = lines.next() {
        let line = line.with_context(|| format!("read line: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            // A torn final line is what an interrupted append leaves behind.
            Err(err) if lines.peek().is_none() => {
                tracing::warn!(path = %path.display(), ?err, "ignoring torn trailing record");
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("parse {}:{}", path.display(), idx + 1));
            }
        }
    }
    Ok(records)
}
