#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quest_archiver::formats::{ChatPage, ChatReply, Chapter, SortMode, StoryMetadata, StorySummary};
use quest_archiver::platform::{FetchError, FetchErrorKind, PlatformClient, Session};
use quest_archiver::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Login,
    ListStories { sort: SortMode, page: u32 },
    ListByAuthor(String),
    Metadata(String),
    Chapters { story_id: String, after: u64 },
    Chat { story_id: String, after: Option<String> },
    Image(String),
}

#[derive(Debug, Clone)]
pub struct FakeStory {
    pub metadata: StoryMetadata,
    pub chapters: Vec<Chapter>,
    pub chat: Vec<ChatReply>,
    pub chat_page_size: usize,
    /// Positions left out of chapter responses, to simulate a broken sequence.
    pub hidden_positions: BTreeSet<u64>,
    pub chapter_failure: Option<FetchErrorKind>,
    pub chat_failure: Option<FetchErrorKind>,
}

impl FakeStory {
    pub fn new(id: &str, chapters: u64) -> Self {
        let mut story = Self {
            metadata: StoryMetadata {
                id: id.to_owned(),
                title: format!("Quest {id}"),
                author: Some("questmaster".to_owned()),
                description: Some(format!("The tale of {id}.")),
                created_at: Some(at(0)),
                updated_at: Some(at(0)),
                chapter_count: 0,
                reply_count: 0,
                like_count: 7,
            },
            chapters: Vec::new(),
            chat: Vec::new(),
            chat_page_size: 2,
            hidden_positions: BTreeSet::new(),
            chapter_failure: None,
            chat_failure: None,
        };
        story.push_chapters(chapters);
        story
    }

    /// Appends `count` chapters after the current last one, one hour apart.
    pub fn push_chapters(&mut self, count: u64) {
        let start = self.chapters.len() as u64 + 1;
        for position in start..start + count {
            self.chapters.push(Chapter {
                position,
                id: format!("{}-c{position}", self.metadata.id),
                title: Some(format!("Part {position}")),
                body: format!("<p>Chapter {position} of {}.</p>", self.metadata.id),
                posted_at: at(position as i64 * 3600),
            });
        }
        self.metadata.chapter_count = self.chapters.len() as u64;
    }

    /// Adds a reply posted `minutes` after the story started.
    pub fn push_reply(&mut self, id: &str, minutes: i64, after_chapter: Option<u64>) {
        self.chat.push(ChatReply {
            id: id.to_owned(),
            author: Some("reader".to_owned()),
            body: format!("<p>{id} says hi</p>"),
            posted_at: at(minutes * 60),
            after_chapter,
        });
        self.metadata.reply_count = self.chat.len() as u64;
    }

    pub fn with_replies(mut self, count: usize) -> Self {
        for n in 1..=count {
            let id = format!("{}-r{n}", self.metadata.id);
            self.push_reply(&id, n as i64 * 90, None);
        }
        self
    }

    pub fn with_chapter_body(mut self, position: u64, body: &str) -> Self {
        if let Some(chapter) = self.chapters.iter_mut().find(|c| c.position == position) {
            chapter.body = body.to_owned();
        }
        self
    }

    pub fn summary(&self) -> StorySummary {
        StorySummary {
            id: self.metadata.id.clone(),
            title: self.metadata.title.clone(),
            author: self.metadata.author.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    listing: BTreeMap<u32, Vec<StorySummary>>,
    listing_failures: BTreeSet<u32>,
    authors: BTreeMap<String, Vec<StorySummary>>,
    stories: BTreeMap<String, FakeStory>,
    images: BTreeMap<String, Vec<u8>>,
    calls: Vec<Call>,
}

/// In-memory platform with scripted content and failure injection.
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<State>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().expect("lock fake platform");
        f(&mut state)
    }

    /// Pages that are never set come back empty.
    pub fn set_listing_page(&self, page: u32, ids: &[&str]) {
        let summaries = ids
            .iter()
            .map(|id| StorySummary {
                id: (*id).to_owned(),
                title: format!("Quest {id}"),
                author: None,
            })
            .collect();
        self.with_state(|s| s.listing.insert(page, summaries));
    }

    pub fn fail_listing_page(&self, page: u32) {
        self.with_state(|s| s.listing_failures.insert(page));
    }

    pub fn set_author(&self, handle: &str, story_ids: &[&str]) {
        let summaries = story_ids
            .iter()
            .map(|id| StorySummary {
                id: (*id).to_owned(),
                title: format!("Quest {id}"),
                author: Some(handle.to_owned()),
            })
            .collect();
        self.with_state(|s| s.authors.insert(handle.to_owned(), summaries));
    }

    pub fn add_story(&self, story: FakeStory) {
        self.with_state(|s| s.stories.insert(story.metadata.id.clone(), story));
    }

    pub fn update_story(&self, story_id: &str, f: impl FnOnce(&mut FakeStory)) {
        self.with_state(|s| {
            let story = s.stories.get_mut(story_id).expect("story exists");
            f(story);
        });
    }

    pub fn add_image(&self, image_ref: &str, bytes: &[u8]) {
        self.with_state(|s| s.images.insert(image_ref.to_owned(), bytes.to_vec()));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn clear_calls(&self) {
        self.with_state(|s| s.calls.clear());
    }

    pub fn listing_pages_requested(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ListStories { page, .. } => Some(page),
                _ => None,
            })
            .collect()
    }

    pub fn chapter_requests(&self, story_id: &str) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Chapters { story_id: id, after } if id == story_id => Some(after),
                _ => None,
            })
            .collect()
    }

    pub fn image_requests(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Image(image_ref) => Some(image_ref),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.with_state(|s| s.calls.push(call));
    }

    fn story(&self, story_id: &str) -> Result<FakeStory, FetchError> {
        self.with_state(|s| s.stories.get(story_id).cloned())
            .ok_or_else(|| FetchError::not_found(format!("story {story_id}")))
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    async fn login(&self, username: &str, _password: &str) -> Result<Session, FetchError> {
        self.record(Call::Login);
        Ok(Session {
            username: username.to_owned(),
        })
    }

    async fn list_stories(
        &self,
        sort: SortMode,
        page: u32,
    ) -> Result<Vec<StorySummary>, FetchError> {
        self.record(Call::ListStories { sort, page });
        self.with_state(|s| {
            if s.listing_failures.contains(&page) {
                return Err(FetchError::transient(format!("listing page {page} timed out")));
            }
            Ok(s.listing.get(&page).cloned().unwrap_or_default())
        })
    }

    async fn list_stories_by_author(&self, handle: &str) -> Result<Vec<StorySummary>, FetchError> {
        self.record(Call::ListByAuthor(handle.to_owned()));
        self.with_state(|s| s.authors.get(handle).cloned())
            .ok_or_else(|| FetchError::not_found(format!("author {handle}")))
    }

    async fn fetch_metadata(&self, story_id: &str) -> Result<StoryMetadata, FetchError> {
        self.record(Call::Metadata(story_id.to_owned()));
        Ok(self.story(story_id)?.metadata)
    }

    async fn fetch_chapters(
        &self,
        story_id: &str,
        after_position: u64,
    ) -> Result<Vec<Chapter>, FetchError> {
        self.record(Call::Chapters {
            story_id: story_id.to_owned(),
            after: after_position,
        });
        let story = self.story(story_id)?;
        if let Some(kind) = story.chapter_failure {
            return Err(FetchError::new(kind, format!("chapters of {story_id}")));
        }
        Ok(story
            .chapters
            .into_iter()
            .filter(|c| c.position > after_position)
            .filter(|c| !story.hidden_positions.contains(&c.position))
            .collect())
    }

    async fn fetch_chat(
        &self,
        story_id: &str,
        after_cursor: Option<&str>,
    ) -> Result<ChatPage, FetchError> {
        self.record(Call::Chat {
            story_id: story_id.to_owned(),
            after: after_cursor.map(str::to_owned),
        });
        let story = self.story(story_id)?;
        if let Some(kind) = story.chat_failure {
            return Err(FetchError::new(kind, format!("chat of {story_id}")));
        }

        let start = match after_cursor {
            None => 0,
            Some(cursor) => match story.chat.iter().position(|r| r.id == cursor) {
                Some(idx) => idx + 1,
                None => story.chat.len(),
            },
        };
        let end = (start + story.chat_page_size.max(1)).min(story.chat.len());
        let replies = story.chat[start..end].to_vec();
        let next_cursor = if end < story.chat.len() {
            replies.last().map(|r| r.id.clone())
        } else {
            None
        };
        Ok(ChatPage {
            replies,
            next_cursor,
        })
    }

    async fn fetch_image(&self, image_ref: &str) -> Result<Vec<u8>, FetchError> {
        self.record(Call::Image(image_ref.to_owned()));
        self.with_state(|s| s.images.get(image_ref).cloned())
            .ok_or_else(|| FetchError::new(FetchErrorKind::Rejected, format!("image {image_ref}")))
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid timestamp")
}

/// Retries without waiting, so failure tests stay fast.
pub fn quick_retry(retries: u32) -> RetryPolicy {
    RetryPolicy::new(retries, Duration::from_millis(1))
}

/// Every file under `root` with its bytes, keyed by relative path.
pub fn snapshot_dir(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    let mut out = BTreeMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).expect("read dir") {
            let path = entry.expect("dir entry").path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let rel = path.strip_prefix(root).expect("relative path").to_path_buf();
                out.insert(rel, fs::read(&path).expect("read file"));
            }
        }
    }
    out
}

pub fn jsonl_lines(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .expect("read jsonl")
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("parse jsonl line"))
        .collect()
}
