use crate::archive_store::is_safe_path_segment;
use crate::formats::TargetDescriptor;
use crate::platform::PlatformClient;
use crate::retry::{RetryPolicy, with_retry};

pub const DEFAULT_AUTHOR_PREFIX: &str = "@";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    Story(String),
    Author(String),
}

/// How raw list entries are told apart: an entry starting with
/// `author_prefix` names an author handle, anything else is a story id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierPolicy {
    pub author_prefix: String,
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self {
            author_prefix: DEFAULT_AUTHOR_PREFIX.to_owned(),
        }
    }
}

impl IdentifierPolicy {
    pub fn new(author_prefix: impl Into<String>) -> Self {
        Self {
            author_prefix: author_prefix.into(),
        }
    }

    pub fn classify(&self, raw: &str) -> Result<Identifier, String> {
        let raw = raw.trim();
        let (identifier, value) = match raw.strip_prefix(self.author_prefix.as_str()) {
            Some(handle) if !self.author_prefix.is_empty() => {
                let handle = handle.trim();
                (Identifier::Author(handle.to_owned()), handle)
            }
            _ => (Identifier::Story(raw.to_owned()), raw),
        };
        if !is_safe_path_segment(value) {
            return Err(format!("malformed identifier: {raw:?}"));
        }
        Ok(identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    pub identifier: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Resolution {
    pub targets: Vec<TargetDescriptor>,
    pub failures: Vec<ResolveFailure>,
}

/// Expands raw identifiers into descriptors, in input order.
///
/// One bad identifier is reported in `failures` and never stops the rest.
pub async fn resolve(
    raw_identifiers: &[String],
    client: &dyn PlatformClient,
    policy: &IdentifierPolicy,
    skip_chat: bool,
    retry: &RetryPolicy,
) -> Resolution {
    let mut resolution = Resolution::default();

    for raw in raw_identifiers {
        let identifier = match policy.classify(raw) {
            Ok(identifier) => identifier,
            Err(reason) => {
                tracing::warn!(identifier = %raw, %reason, "skipping identifier");
                resolution.failures.push(ResolveFailure {
                    identifier: raw.clone(),
                    reason,
                });
                continue;
            }
        };

        match identifier {
            Identifier::Story(story_id) => {
                resolution
                    .targets
                    .push(TargetDescriptor::story(story_id, skip_chat));
            }
            Identifier::Author(handle) => {
                let result = with_retry(retry, "author listing", || {
                    client.list_stories_by_author(&handle)
                })
                .await;
                match result {
                    Ok(stories) => {
                        tracing::info!(author = %handle, stories = stories.len(), "expanded author");
                        resolution
                            .targets
                            .extend(stories.into_iter().map(|story| TargetDescriptor {
                                story_id: story.id,
                                skip_chat,
                                user: Some(handle.clone()),
                            }));
                    }
                    Err(err) => {
                        tracing::warn!(author = %handle, %err, "unable to expand author");
                        resolution.failures.push(ResolveFailure {
                            identifier: raw.clone(),
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    resolution
}
