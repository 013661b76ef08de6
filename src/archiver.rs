use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;
use chrono::Utc;

use crate::archive_store::StoryArchiveDir;
use crate::formats::{ArchiveManifest, TargetDescriptor};
use crate::platform::PlatformClient;
use crate::retry::{RetryPolicy, with_retry};

/// Per-story progress. Steps run strictly in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    NotStarted,
    FetchingMetadata,
    FetchingChapters,
    FetchingChat,
    FetchingImages,
    Persisted,
    Failed,
}

impl ArchiveState {
    /// State entered once the current step has completed.
    pub fn advance(self, skip_chat: bool, download_images: bool) -> Self {
        match self {
            ArchiveState::NotStarted => ArchiveState::FetchingMetadata,
            ArchiveState::FetchingMetadata => ArchiveState::FetchingChapters,
            ArchiveState::FetchingChapters if !skip_chat => ArchiveState::FetchingChat,
            ArchiveState::FetchingChapters | ArchiveState::FetchingChat if download_images => {
                ArchiveState::FetchingImages
            }
            ArchiveState::FetchingChapters
            | ArchiveState::FetchingChat
            | ArchiveState::FetchingImages => ArchiveState::Persisted,
            ArchiveState::Persisted => ArchiveState::Persisted,
            ArchiveState::Failed => ArchiveState::Failed,
        }
    }

    /// Errors in these steps fail the story; later steps are best-effort.
    pub fn is_content_critical(self) -> bool {
        matches!(
            self,
            ArchiveState::NotStarted
                | ArchiveState::FetchingMetadata
                | ArchiveState::FetchingChapters
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ArchiveState::Persisted | ArchiveState::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub new_chapters: usize,
    pub new_replies: usize,
    pub images_downloaded: usize,
    pub images_failed: usize,
    pub metadata_changed: bool,
    pub manifest_writes: usize,
    /// Chat could not be fetched to the end this run.
    pub chat_incomplete: bool,
}

impl ArchiveStats {
    /// Number of chapter and chat records written this run.
    pub fn content_writes(&self) -> usize {
        self.new_chapters + self.new_replies
    }
}

#[derive(Debug, thiserror::Error)]
#[error("story {story_id} failed while {state:?}: {error:#}")]
pub struct ArchiveFailure {
    pub story_id: String,
    pub state: ArchiveState,
    pub error: anyhow::Error,
}

struct StoryRun<'t> {
    target: &'t TargetDescriptor,
    store: StoryArchiveDir,
    manifest: ArchiveManifest,
    manifest_exists: bool,
    state: ArchiveState,
    stats: ArchiveStats,
}

impl StoryRun<'_> {
    fn persist_manifest(&mut self) -> anyhow::Result<()> {
        self.manifest.updated_at = Some(Utc::now());
        self.store.save_manifest(&self.manifest)?;
        self.manifest_exists = true;
        self.stats.manifest_writes += 1;
        Ok(())
    }

    /// Image references in the archived chapters and chat with no media file yet.
    ///
    /// Scans the stores rather than this run's fetches, so images of content
    /// saved by an earlier, failed or interrupted run are still picked up.
    fn pending_image_refs(&self) -> anyhow::Result<BTreeSet<String>> {
        let chapters = self.store.read_chapters().context("read chapter store")?;
        let chat = self.store.read_chat().context("read chat store")?;
        let bodies = chapters
            .iter()
            .map(|chapter| chapter.body.as_str())
            .chain(chat.iter().map(|reply| reply.body.as_str()));

        let mut refs = BTreeSet::new();
        for body in bodies {
            refs.extend(
                crate::media::image_refs(body)
                    .into_iter()
                    .filter(|image_ref| !self.store.has_media(image_ref)),
            );
        }
        Ok(refs)
    }
}

/// Fetches one story into its archive directory, resuming from the manifest.
pub struct StoryArchiver {
    client: Arc<dyn PlatformClient>,
    output_root: PathBuf,
    retry: RetryPolicy,
}

impl StoryArchiver {
    pub fn new(
        client: Arc<dyn PlatformClient>,
        output_root: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            output_root: output_root.into(),
            retry,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub async fn archive(
        &self,
        target: &TargetDescriptor,
        download_images: bool,
    ) -> Result<ArchiveStats, ArchiveFailure> {
        let started = Instant::now();
        let store = StoryArchiveDir::for_target(&self.output_root, target).map_err(|error| {
            ArchiveFailure {
                story_id: target.story_id.clone(),
                state: ArchiveState::NotStarted,
                error,
            }
        })?;
        let mut run = StoryRun {
            target,
            store,
            manifest: ArchiveManifest::new(&target.story_id, target.user.clone()),
            manifest_exists: false,
            state: ArchiveState::NotStarted,
            stats: ArchiveStats::default(),
        };

        while !run.state.is_terminal() {
            let step = run.state;
            let result = match step {
                ArchiveState::NotStarted => self.load_manifest(&mut run),
                ArchiveState::FetchingMetadata => self.fetch_metadata(&mut run).await,
                ArchiveState::FetchingChapters => self.fetch_chapters(&mut run).await,
                ArchiveState::FetchingChat => self.fetch_chat(&mut run).await,
                ArchiveState::FetchingImages => self.fetch_images(&mut run).await,
                ArchiveState::Persisted | ArchiveState::Failed => break,
            };

            match result {
                Ok(()) => {}
                Err(error) if step.is_content_critical() => {
                    // Chapters saved before the failure still get their images.
                    if step == ArchiveState::FetchingChapters
                        && download_images
                        && let Err(err) = self.fetch_images(&mut run).await
                    {
                        tracing::warn!(
                            story_id = %target.story_id,
                            ?err,
                            "image download for saved chapters failed"
                        );
                    }
                    run.state = ArchiveState::Failed;
                    tracing::error!(
                        story_id = %target.story_id,
                        state = ?step,
                        ?error,
                        "story failed"
                    );
                    return Err(ArchiveFailure {
                        story_id: target.story_id.clone(),
                        state: step,
                        error,
                    });
                }
                Err(error) => {
                    if step == ArchiveState::FetchingChat {
                        run.stats.chat_incomplete = true;
                    }
                    tracing::warn!(
                        story_id = %target.story_id,
                        state = ?step,
                        ?error,
                        "best-effort step failed; continuing"
                    );
                }
            }
            run.state = step.advance(target.skip_chat, download_images);
        }

        tracing::info!(
            story_id = %target.story_id,
            new_chapters = run.stats.new_chapters,
            new_replies = run.stats.new_replies,
            images = run.stats.images_downloaded,
            elapsed = ?started.elapsed(),
            "story archived"
        );
        Ok(run.stats)
    }

    fn load_manifest(&self, run: &mut StoryRun<'_>) -> anyhow::Result<()> {
        if !run.store.root().exists() {
            tracing::debug!(story_id = %run.target.story_id, "new story");
            return Ok(());
        }

        if let Some(manifest) = run.store.load_manifest().context("load manifest")? {
            if manifest.story_id != run.target.story_id {
                anyhow::bail!(
                    "manifest belongs to story {} not {}",
                    manifest.story_id,
                    run.target.story_id
                );
            }
            run.manifest = manifest;
            run.manifest_exists = true;
        }
        run.store
            .reconcile(&run.manifest)
            .context("reconcile archive with manifest")?;

        tracing::debug!(
            story_id = %run.target.story_id,
            last_chapter = run.manifest.last_chapter_position,
            chat_cursor = ?run.manifest.chat_cursor,
            "resuming story"
        );
        Ok(())
    }

    async fn fetch_metadata(&self, run: &mut StoryRun<'_>) -> anyhow::Result<()> {
        let target = run.target;
        let story_id = target.story_id.as_str();
        let metadata = with_retry(&self.retry, "metadata", || {
            self.client.fetch_metadata(story_id)
        })
        .await
        .context("fetch metadata")?;

        run.store.ensure_layout()?;
        run.stats.metadata_changed = run.store.write_metadata(&metadata)?;
        if !run.manifest_exists {
            run.persist_manifest()?;
        }
        Ok(())
    }

    async fn fetch_chapters(&self, run: &mut StoryRun<'_>) -> anyhow::Result<()> {
        let target = run.target;
        let story_id = target.story_id.as_str();
        let after = run.manifest.last_chapter_position;
        let mut chapters = with_retry(&self.retry, "chapters", || {
            self.client.fetch_chapters(story_id, after)
        })
        .await
        .with_context(|| format!("fetch chapters after position {after}"))?;
        chapters.sort_by_key(|chapter| chapter.position);

        for chapter in chapters {
            let last = run.manifest.last_chapter_position;
            if chapter.position <= last {
                tracing::debug!(story_id, position = chapter.position, "chapter already archived");
                continue;
            }
            if chapter.position != last + 1 {
                anyhow::bail!(
                    "chapter sequence gap: expected position {}, got {}",
                    last + 1,
                    chapter.position
                );
            }

            run.store
                .append_chapter(&chapter)
                .with_context(|| format!("write chapter {}", chapter.position))?;
            run.manifest.last_chapter_position = chapter.position;
            run.persist_manifest()?;
            run.stats.new_chapters += 1;
        }
        Ok(())
    }

    async fn fetch_chat(&self, run: &mut StoryRun<'_>) -> anyhow::Result<()> {
        let target = run.target;
        let story_id = target.story_id.as_str();
        loop {
            let cursor = run.manifest.chat_cursor.clone();
            let page = with_retry(&self.retry, "chat page", || {
                self.client.fetch_chat(story_id, cursor.as_deref())
            })
            .await
            .with_context(|| format!("fetch chat after cursor {cursor:?}"))?;

            if page.replies.is_empty() {
                break;
            }

            let mut replies = page.replies;
            replies.sort_by(|a, b| (a.posted_at, &a.id).cmp(&(b.posted_at, &b.id)));
            run.store.append_chat(&replies).context("write chat page")?;

            let next_cursor = page
                .next_cursor
                .clone()
                .or_else(|| replies.last().map(|reply| reply.id.clone()));
            run.manifest.chat_cursor = next_cursor;
            run.manifest.chat_reply_count += replies.len() as u64;
            run.persist_manifest()?;
            run.stats.new_replies += replies.len();

            match page.next_cursor {
                None => break,
                Some(next) if Some(&next) == cursor.as_ref() => {
                    tracing::warn!(story_id, cursor = %next, "chat cursor did not advance; stopping");
                    break;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    async fn fetch_images(&self, run: &mut StoryRun<'_>) -> anyhow::Result<()> {
        let refs = run.pending_image_refs()?;
        for image_ref in refs {
            let result = with_retry(&self.retry, "image", || {
                self.client.fetch_image(&image_ref)
            })
            .await;
            let stored = match result {
                Ok(bytes) => run.store.write_media(&image_ref, &bytes).map(|_| ()),
                Err(err) => Err(anyhow::Error::new(err)),
            };
            match stored {
                Ok(()) => run.stats.images_downloaded += 1,
                Err(err) => {
                    run.stats.images_failed += 1;
                    tracing::warn!(
                        story_id = %run.target.story_id,
                        image = %image_ref,
                        ?err,
                        "image download failed; skipping"
                    );
                }
            }
        }
        Ok(())
    }
}
