use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, USER_AGENT};
use serde::Deserialize;
use url::Url;

use crate::formats::{ChatPage, Chapter, SortMode, StoryMetadata, StorySummary};

pub const API_BASE_ENV: &str = "QUEST_ARCHIVER_API_BASE";
pub const USERNAME_ENV: &str = "QUEST_ARCHIVER_USERNAME";
pub const PASSWORD_ENV: &str = "QUEST_ARCHIVER_PASSWORD";

const USER_AGENT_VALUE: &str = concat!("quest-archiver/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Network failure, timeout or throttling; worth retrying.
    Transient,
    NotFound,
    Rejected,
    Malformed,
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchErrorKind::Transient => write!(f, "transient error"),
            FetchErrorKind::NotFound => write!(f, "not found"),
            FetchErrorKind::Rejected => write!(f, "rejected"),
            FetchErrorKind::Malformed => write!(f, "malformed response"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::NotFound, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FetchErrorKind::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
}

/// Authenticated access to the remote story platform.
///
/// Every method is a suspension point; callers never issue two of them
/// concurrently for the same story.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<Session, FetchError>;

    async fn list_stories(&self, sort: SortMode, page: u32)
    -> Result<Vec<StorySummary>, FetchError>;

    /// Stories owned by `handle`, in the platform's own order.
    async fn list_stories_by_author(&self, handle: &str) -> Result<Vec<StorySummary>, FetchError>;

    async fn fetch_metadata(&self, story_id: &str) -> Result<StoryMetadata, FetchError>;

    /// Chapters with a position strictly greater than `after_position`.
    async fn fetch_chapters(
        &self,
        story_id: &str,
        after_position: u64,
    ) -> Result<Vec<Chapter>, FetchError>;

    /// Chat replies strictly after `after_cursor` (from the start when `None`).
    ///
    /// `next_cursor == None` means the thread is exhausted; the id of the last
    /// returned reply is then a valid cursor for the next call.
    async fn fetch_chat(
        &self,
        story_id: &str,
        after_cursor: Option<&str>,
    ) -> Result<ChatPage, FetchError>;

    async fn fetch_image(&self, image_ref: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        let username = std::env::var(USERNAME_ENV).ok()?;
        let password = std::env::var(PASSWORD_ENV).ok()?;
        if username.trim().is_empty() || password.is_empty() {
            return None;
        }
        Some(Self { username, password })
    }
}

#[derive(Debug, Clone)]
pub struct PlatformConfig {
    pub base_url: Url,
    pub request_timeout: Duration,
}

impl PlatformConfig {
    /// `--api-base` wins over the environment.
    pub fn resolve(api_base: Option<&str>) -> anyhow::Result<Self> {
        let raw = match api_base {
            Some(raw) => raw.to_owned(),
            None => std::env::var(API_BASE_ENV).with_context(|| {
                format!("platform base url missing: pass --api-base or set {API_BASE_ENV}")
            })?,
        };
        let mut base_url = Url::parse(raw.trim()).context("parse platform base url")?;
        if base_url.scheme() != "http" && base_url.scheme() != "https" {
            anyhow::bail!("platform base url must be http/https: {base_url}");
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            request_timeout: Duration::from_secs(30),
        })
    }
}

/// `PlatformClient` over the archiver's JSON gateway.
#[derive(Debug)]
pub struct HttpPlatformClient {
    config: PlatformConfig,
    client: reqwest::Client,
    token: Mutex<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    username: String,
    #[serde(default)]
    token: Option<String>,
}

impl HttpPlatformClient {
    pub fn new(config: PlatformConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build platform http client")?;
        Ok(Self {
            config,
            client,
            token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, FetchError> {
        self.config
            .base_url
            .join(path)
            .map_err(|err| FetchError::new(FetchErrorKind::Rejected, format!("{path}: {err}")))
    }

    fn bearer(&self) -> Option<String> {
        self.token.lock().ok().and_then(|token| token.clone())
    }

    async fn get_bytes(&self, url: Url) -> Result<Vec<u8>, FetchError> {
        tracing::debug!(%url, "GET");
        let mut request = self
            .client
            .get(url.clone())
            .header(USER_AGENT, USER_AGENT_VALUE);
        if let Some(token) = self.bearer() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;
        check_status(response.status(), &url)?;
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;
        Ok(bytes.to_vec())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        let bytes = self.get_bytes(url.clone()).await?;
        serde_json::from_slice(&bytes)
            .map_err(|err| FetchError::new(FetchErrorKind::Malformed, format!("{url}: {err}")))
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn login(&self, username: &str, password: &str) -> Result<Session, FetchError> {
        let url = self.endpoint("login")?;
        let response = self
            .client
            .post(url.clone())
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header(ACCEPT, "application/json")
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response.status(), &url)?;
        let body: LoginResponse = response
            .json()
            .await
            .map_err(|err| FetchError::new(FetchErrorKind::Malformed, err.to_string()))?;

        if let Ok(mut token) = self.token.lock() {
            *token = body.token;
        }
        Ok(Session {
            username: body.username,
        })
    }

    async fn list_stories(
        &self,
        sort: SortMode,
        page: u32,
    ) -> Result<Vec<StorySummary>, FetchError> {
        let mut url = self.endpoint("stories")?;
        url.query_pairs_mut()
            .append_pair("sort", sort.as_str())
            .append_pair("page", &page.to_string());
        self.get_json(url).await
    }

    async fn list_stories_by_author(&self, handle: &str) -> Result<Vec<StorySummary>, FetchError> {
        let url = self.endpoint(&format!("authors/{handle}/stories"))?;
        self.get_json(url).await
    }

    async fn fetch_metadata(&self, story_id: &str) -> Result<StoryMetadata, FetchError> {
        let url = self.endpoint(&format!("stories/{story_id}"))?;
        self.get_json(url).await
    }

    async fn fetch_chapters(
        &self,
        story_id: &str,
        after_position: u64,
    ) -> Result<Vec<Chapter>, FetchError> {
        let mut url = self.endpoint(&format!("stories/{story_id}/chapters"))?;
        url.query_pairs_mut()
            .append_pair("after", &after_position.to_string());
        self.get_json(url).await
    }

    async fn fetch_chat(
        &self,
        story_id: &str,
        after_cursor: Option<&str>,
    ) -> Result<ChatPage, FetchError> {
        let mut url = self.endpoint(&format!("stories/{story_id}/chat"))?;
        if let Some(cursor) = after_cursor {
            url.query_pairs_mut().append_pair("after", cursor);
        }
        self.get_json(url).await
    }

    async fn fetch_image(&self, image_ref: &str) -> Result<Vec<u8>, FetchError> {
        let url = image_url(&self.config.base_url, image_ref)?;
        self.get_bytes(url).await
    }
}

/// Absolute http(s) refs are used as is, protocol-relative ones inherit the
/// gateway scheme, and other relative refs resolve under the gateway base.
fn image_url(base_url: &Url, image_ref: &str) -> Result<Url, FetchError> {
    let resolved = match Url::parse(image_ref) {
        Ok(url) => Ok(url),
        Err(_) if image_ref.starts_with("//") => base_url.join(image_ref),
        Err(_) => base_url.join(image_ref.trim_start_matches('/')),
    };
    let url = resolved.map_err(|err| {
        FetchError::new(FetchErrorKind::Rejected, format!("{image_ref}: {err}"))
    })?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(FetchError::new(
            FetchErrorKind::Rejected,
            format!("unsupported image scheme: {url}"),
        ));
    }
    Ok(url)
}

fn check_status(status: StatusCode, url: &Url) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    let kind = match status {
        StatusCode::NOT_FOUND => FetchErrorKind::NotFound,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => FetchErrorKind::Transient,
        status if status.is_server_error() => FetchErrorKind::Transient,
        _ => FetchErrorKind::Rejected,
    };
    Err(FetchError::new(kind, format!("{url}: http {status}")))
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        return FetchError::new(FetchErrorKind::Malformed, err.to_string());
    }
    FetchError::transient(err.to_string())
}
