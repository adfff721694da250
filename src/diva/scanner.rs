use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::diva::extractor;
use crate::diva::sender::entries::ListingEntry;
use crate::diva::sender::{calculate_backoff, FeedKind, RequestSender, SenderError};

/// An audio page reference pulled out of a profile's feed.
#[derive(Clone, Debug)]
pub(crate) struct DiscoveredItem {
    title: String,
    page_url: String,
    permalink: String,
    description: Option<String>,
}

impl DiscoveredItem {
    pub(crate) fn new(
        title: String,
        page_url: String,
        permalink: String,
        description: Option<String>,
    ) -> Self {
        DiscoveredItem {
            title,
            page_url,
            permalink,
            description,
        }
    }

    /// Title of the feed item the link was found in.
    pub(crate) fn title(&self) -> &str {
        &self.title
    }

    /// The audio host page to resolve.
    pub(crate) fn page_url(&self) -> &str {
        &self.page_url
    }

    /// Permalink of the post or comment that mentioned the link.
    pub(crate) fn permalink(&self) -> &str {
        &self.permalink
    }

    /// Feed item body, when it had one worth keeping.
    pub(crate) fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Errors that end a feed scan.
#[derive(Error, Debug)]
pub(crate) enum FeedError {
    #[error("feed for \"{profile}\" unavailable after {attempts} attempts: {reason}")]
    Unavailable {
        profile: String,
        attempts: u32,
        reason: String,
    },

    #[error("profile \"{profile}\" does not exist or cannot be read")]
    Missing { profile: String },

    #[error("feed credentials are missing or were rejected")]
    Credentials,
}

/// Retry behavior for feed page fetches.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FeedRetry {
    pub(crate) attempts: u32,
    pub(crate) base_delay_ms: u64,
}

impl Default for FeedRetry {
    fn default() -> Self {
        FeedRetry {
            attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

enum FeedPhase {
    Submitted,
    Comments,
    Done,
}

/// Lazy walk over a profile's submissions and comments.
///
/// Pages are fetched on demand as `next` drains the buffer, so a large
/// profile is never materialized, and items handed out before a feed
/// failure stay valid. Page URLs repeat freely across a profile's posts;
/// each one is yielded only once per scan.
pub(crate) struct ProfileScan {
    sender: RequestSender,
    profile: String,
    retry: FeedRetry,
    max_items: Option<usize>,
    yielded: usize,
    seen: HashSet<String>,
    buffer: VecDeque<DiscoveredItem>,
    phase: FeedPhase,
    cursor: Option<String>,
}

impl ProfileScan {
    pub(crate) fn new(
        sender: RequestSender,
        profile: &str,
        max_items: Option<usize>,
        retry: FeedRetry,
    ) -> Self {
        ProfileScan {
            sender,
            profile: profile.to_string(),
            retry,
            max_items,
            yielded: 0,
            seen: HashSet::new(),
            buffer: VecDeque::new(),
            phase: FeedPhase::Submitted,
            cursor: None,
        }
    }

    /// The next discovered item, or `None` once the feed is exhausted or the
    /// item cap is reached.
    pub(crate) async fn next(&mut self) -> Result<Option<DiscoveredItem>, FeedError> {
        loop {
            if let Some(max) = self.max_items {
                if self.yielded >= max {
                    return Ok(None);
                }
            }

            if let Some(item) = self.buffer.pop_front() {
                self.yielded += 1;
                return Ok(Some(item));
            }

            match self.phase {
                FeedPhase::Done => return Ok(None),
                _ => self.fill_buffer().await?,
            }
        }
    }

    /// Fetches one feed page and queues whatever it links to.
    async fn fill_buffer(&mut self) -> Result<(), FeedError> {
        let kind = match self.phase {
            FeedPhase::Submitted => FeedKind::Submitted,
            FeedPhase::Comments => FeedKind::Comments,
            FeedPhase::Done => return Ok(()),
        };

        let listing = self.fetch_with_retry(kind).await?;
        self.collect_items(&listing);

        match listing.data.after {
            Some(after) if !listing.data.children.is_empty() => {
                self.cursor = Some(after);
            }
            _ => {
                self.cursor = None;
                self.phase = match self.phase {
                    FeedPhase::Submitted => {
                        trace!(
                            "Submissions of \"{}\" exhausted, moving to comments...",
                            self.profile
                        );
                        FeedPhase::Comments
                    }
                    _ => FeedPhase::Done,
                };
            }
        }

        Ok(())
    }

    async fn fetch_with_retry(&self, kind: FeedKind) -> Result<ListingEntry, FeedError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .sender
                .feed_page(&self.profile, kind, self.cursor.as_deref())
                .await
            {
                Ok(listing) => return Ok(listing),
                Err(SenderError::Unauthorized) | Err(SenderError::MissingCredentials) => {
                    return Err(FeedError::Credentials);
                }
                Err(SenderError::NotFound { .. }) => {
                    return Err(FeedError::Missing {
                        profile: self.profile.clone(),
                    });
                }
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    let delay_ms = match &err {
                        SenderError::RateLimited {
                            retry_after: Some(secs),
                        } => secs * 1000,
                        _ => calculate_backoff(attempt, self.retry.base_delay_ms),
                    };
                    warn!(
                        "Feed fetch {}/{} for \"{}\" failed: {}",
                        attempt, self.retry.attempts, self.profile, err
                    );
                    debug!("Backing off for {}ms before retry", delay_ms);
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(err) => {
                    return Err(FeedError::Unavailable {
                        profile: self.profile.clone(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    fn collect_items(&mut self, listing: &ListingEntry) {
        for thing in &listing.data.children {
            // Feed pages can carry "more" stubs alongside t1/t3 items.
            if thing.kind != "t3" && thing.kind != "t1" {
                continue;
            }
            let text = thing.data.searchable_text();
            if text.is_empty() {
                continue;
            }

            for link in extractor::extract_links(&text) {
                if !self.seen.insert(link.clone()) {
                    continue;
                }
                self.buffer.push_back(DiscoveredItem::new(
                    thing.data.display_title().unwrap_or_default().to_string(),
                    link,
                    thing.data.full_permalink().unwrap_or_default(),
                    thing.data.description(),
                ));
            }
        }
    }
}
