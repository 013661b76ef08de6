use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Remote listing orderings understood by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    /// Newest stories first.
    New,
    /// Latest activity, chat included.
    Active,
    /// Latest posted chapter.
    Chapter,
    /// Most commented.
    Replies,
    /// Most liked.
    Like,
    /// Top rated.
    Top,
}

impl SortMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SortMode::New => "new",
            SortMode::Active => "active",
            SortMode::Chapter => "chapter",
            SortMode::Replies => "replies",
            SortMode::Like => "like",
            SortMode::Top => "top",
        }
    }
}

/// One resolved unit of archiving work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    pub story_id: String,
    pub skip_chat: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl TargetDescriptor {
    pub fn story(story_id: impl Into<String>, skip_chat: bool) -> Self {
        Self {
            story_id: story_id.into(),
            skip_chat,
            user: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorySummary {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryMetadata {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub chapter_count: u64,
    #[serde(default)]
    pub reply_count: u64,
    #[serde(default)]
    pub like_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    /// 1-based sequence position within the story.
    pub position: u64,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// HTML fragment as served by the platform.
    pub body: String,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub body: String,
    pub posted_at: DateTime<Utc>,
    /// Position of the chapter this reply follows, when the platform knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_chapter: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPage {
    pub replies: Vec<ChatReply>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Per-story bookkeeping for incremental fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u32,
    pub story_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub last_chapter_position: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_cursor: Option<String>,
    #[serde(default)]
    pub chat_reply_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ArchiveManifest {
    pub fn new(story_id: impl Into<String>, user: Option<String>) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            story_id: story_id.into(),
            user,
            last_chapter_position: 0,
            chat_cursor: None,
            chat_reply_count: 0,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatQuestRecord {
    pub story_id: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}
