use std::collections::{HashSet, VecDeque};

use anyhow::Context as _;

use crate::formats::{SortMode, TargetDescriptor};
use crate::platform::PlatformClient;
use crate::retry::{RetryPolicy, with_retry};
use crate::target_list::SkipSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlRequest {
    pub sort: SortMode,
    pub start_page: u32,
    /// Inclusive.
    pub end_page: u32,
    pub skip_chat: bool,
}

/// Lazily walks the sorted story index, one listing page per pull.
///
/// Single pass: once exhausted or failed it only yields `None`.
pub struct ListingCrawler<'a> {
    client: &'a dyn PlatformClient,
    skip: &'a SkipSet,
    retry: RetryPolicy,
    request: CrawlRequest,
    next_page: u32,
    buffer: VecDeque<TargetDescriptor>,
    emitted: HashSet<String>,
    pages_fetched: u32,
    finished: bool,
}

pub fn crawl<'a>(
    client: &'a dyn PlatformClient,
    request: CrawlRequest,
    skip: &'a SkipSet,
    retry: RetryPolicy,
) -> ListingCrawler<'a> {
    ListingCrawler {
        client,
        skip,
        retry,
        request,
        next_page: request.start_page.max(1),
        buffer: VecDeque::new(),
        emitted: HashSet::new(),
        pages_fetched: 0,
        finished: false,
    }
}

impl ListingCrawler<'_> {
    /// Next descriptor, fetching listing pages only when the buffer is empty.
    ///
    /// An `Err` means a page exhausted its retries; the crawl is over.
    pub async fn next(&mut self) -> anyhow::Result<Option<TargetDescriptor>> {
        loop {
            if let Some(target) = self.buffer.pop_front() {
                return Ok(Some(target));
            }
            if self.finished || self.next_page > self.request.end_page {
                self.finished = true;
                return Ok(None);
            }

            let page = self.next_page;
            match page.checked_add(1) {
                Some(next) => self.next_page = next,
                // No page can follow `u32::MAX`; this one is the last.
                None => self.finished = true,
            }
            let client = self.client;
            let sort = self.request.sort;
            let result =
                with_retry(&self.retry, "listing page", move || client.list_stories(sort, page))
                    .await;
            let entries = match result {
                Ok(entries) => entries,
                Err(err) => {
                    self.finished = true;
                    return Err(err).with_context(|| {
                        format!(
                            "fetch listing page {page} (sort {})",
                            self.request.sort.as_str()
                        )
                    });
                }
            };
            self.pages_fetched += 1;

            if entries.is_empty() {
                tracing::info!(page, "listing page is empty; end of listing");
                self.finished = true;
                return Ok(None);
            }

            let total = entries.len();
            let mut skipped = 0usize;
            for entry in entries {
                if self.skip.contains(&entry.id) {
                    skipped += 1;
                    continue;
                }
                if !self.emitted.insert(entry.id.clone()) {
                    tracing::debug!(story_id = %entry.id, page, "already queued by an earlier page");
                    continue;
                }
                self.buffer
                    .push_back(TargetDescriptor::story(entry.id, self.request.skip_chat));
            }
            tracing::info!(
                page,
                entries = total,
                skipped,
                queued = self.buffer.len(),
                "listing page fetched"
            );
        }
    }

    pub fn pages_fetched(&self) -> u32 {
        self.pages_fetched
    }
}
