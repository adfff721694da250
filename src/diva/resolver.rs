use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tokio::time::sleep;

use crate::diva::extractor;
use crate::diva::scanner::DiscoveredItem;
use crate::diva::sender::{calculate_backoff, RequestSender, SenderError};

/// Direct media URL embedded in a host page's player script.
static MEDIA_IN_PAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("(?i){}", extractor::MEDIA_FILE_PATTERN)).unwrap());

static TITLE_IN_PAGE: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());

static DESCRIPTION_IN_PAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse("div.jp-description").unwrap());

/// A download the worker pool can act on. The stream URL is only trusted
/// immediately after resolution; retries go back through the page URL.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedTask {
    title: String,
    stream_url: String,
    description: Option<String>,
    hint: String,
    page_url: Option<String>,
}

impl ResolvedTask {
    pub(crate) fn title(&self) -> &str {
        &self.title
    }

    pub(crate) fn stream_url(&self) -> &str {
        &self.stream_url
    }

    pub(crate) fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Performer handle used as the destination folder.
    pub(crate) fn hint(&self) -> &str {
        &self.hint
    }

    /// The host page this task came from, absent for direct media links.
    pub(crate) fn page_url(&self) -> Option<&str> {
        self.page_url.as_deref()
    }

    /// Stable identity of the task for progress reporting, independent of
    /// stream URL churn across re-resolutions.
    pub(crate) fn key(&self) -> &str {
        self.page_url.as_deref().unwrap_or(&self.stream_url)
    }

    /// File extension taken from the stream URL.
    pub(crate) fn ext(&self) -> &str {
        match self.stream_url.rsplit('.').next() {
            Some(ext)
                if !ext.is_empty()
                    && ext.len() <= 4
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                ext
            }
            _ => "m4a",
        }
    }
}

/// Builds a task that still remembers its host page.
#[cfg(test)]
pub(crate) fn page_backed_task(title: &str, stream_url: &str, page_url: &str) -> ResolvedTask {
    ResolvedTask {
        title: title.to_string(),
        stream_url: stream_url.to_string(),
        description: None,
        hint: String::from("unsorted"),
        page_url: Some(page_url.to_string()),
    }
}

/// Builds a task straight from a media URL, skipping resolution.
pub(crate) fn direct_media_task(url: &str) -> ResolvedTask {
    let stem = url
        .rsplit('/')
        .next()
        .and_then(|name| name.split('.').next())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("audio");

    ResolvedTask {
        title: stem.to_string(),
        stream_url: url.to_string(),
        description: None,
        hint: String::from("unsorted"),
        page_url: None,
    }
}

/// Why a host page could not be turned into a download.
#[derive(Error, Debug)]
pub(crate) enum ResolveError {
    #[error("audio page was removed: {url}")]
    NotFound { url: String },

    #[error("no media reference found on page: {url}")]
    Malformed { url: String },

    #[error("page unreachable after {attempts} attempts: {url}: {reason}")]
    Unreachable {
        url: String,
        attempts: u32,
        reason: String,
    },
}

/// Retry behavior for host page fetches.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ResolveRetry {
    pub(crate) attempts: u32,
    pub(crate) base_delay_ms: u64,
}

impl Default for ResolveRetry {
    fn default() -> Self {
        ResolveRetry {
            attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

/// Turns discovered host pages into direct-stream download tasks.
pub(crate) struct AudioResolver {
    sender: RequestSender,
    retry: ResolveRetry,
}

impl AudioResolver {
    pub(crate) fn new(sender: RequestSender, retry: ResolveRetry) -> Self {
        AudioResolver { sender, retry }
    }

    /// Resolves a discovered item into a downloadable task.
    pub(crate) async fn resolve(&self, item: &DiscoveredItem) -> Result<ResolvedTask, ResolveError> {
        self.resolve_page(item.page_url(), item.title(), item.description())
            .await
    }

    /// Re-resolves a task so a retry gets a fresh stream URL. Tasks without
    /// a page behind them come back unchanged.
    pub(crate) async fn refresh(&self, task: &ResolvedTask) -> Result<ResolvedTask, ResolveError> {
        match task.page_url() {
            Some(page_url) => {
                debug!("Re-resolving \"{}\" before retry...", task.title());
                self.resolve_page(page_url, task.title(), task.description())
                    .await
            }
            None => Ok(task.clone()),
        }
    }

    async fn resolve_page(
        &self,
        page_url: &str,
        fallback_title: &str,
        fallback_description: Option<&str>,
    ) -> Result<ResolvedTask, ResolveError> {
        let body = self.fetch_page(page_url).await?;
        let parsed = parse_host_page(&body);

        let stream_url = parsed.stream_url.ok_or_else(|| {
            warn!("Page has no playable media reference: {}", page_url);
            ResolveError::Malformed {
                url: page_url.to_string(),
            }
        })?;

        let title = parsed
            .title
            .or_else(|| {
                let fallback = fallback_title.trim();
                if fallback.is_empty() {
                    None
                } else {
                    Some(fallback.to_string())
                }
            })
            .or_else(|| slug_title(page_url))
            .unwrap_or_else(|| String::from("untitled"));

        let description = parsed
            .description
            .or_else(|| fallback_description.map(str::to_string));

        let hint = extractor::host_user(page_url).unwrap_or_else(|| String::from("unsorted"));

        Ok(ResolvedTask {
            title,
            stream_url,
            description,
            hint,
            page_url: Some(page_url.to_string()),
        })
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ResolveError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sender.page_text(url).await {
                Ok(body) => return Ok(body),
                Err(SenderError::NotFound { .. }) => {
                    return Err(ResolveError::NotFound {
                        url: url.to_string(),
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
                        "Page fetch {}/{} failed for {}: {}",
                        attempt, self.retry.attempts, url, err
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(err) => {
                    return Err(ResolveError::Unreachable {
                        url: url.to_string(),
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

struct ParsedPage {
    stream_url: Option<String>,
    title: Option<String>,
    description: Option<String>,
}

/// Extracts the stream URL, title and description from a host page body.
fn parse_host_page(body: &str) -> ParsedPage {
    let stream_url = MEDIA_IN_PAGE
        .find(body)
        .map(|found| found.as_str().to_string());

    let document = Html::parse_document(body);

    let title = document
        .select(&TITLE_IN_PAGE)
        .next()
        .map(|node| node.text().collect::<String>())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());

    let description = document
        .select(&DESCRIPTION_IN_PAGE)
        .next()
        .map(|node| node.text().collect::<String>())
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());

    ParsedPage {
        stream_url,
        title,
        description,
    }
}

/// Last URL segment with dashes opened back up into spaces.
fn slug_title(page_url: &str) -> Option<String> {
    page_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|slug| !slug.is_empty())
        .map(|slug| slug.replace('-', " "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diva::io::Config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PAGE_BODY: &str = r#"<!DOCTYPE html>
<html>
<head><title>soundgasm</title></head>
<body>
  <div class="jp-title"><h1>Midnight Story</h1></div>
  <div class="jp-description"><p>A slow, quiet story for late nights.</p></div>
  <script type="text/javascript">
    $(document).ready(function() {
      var m4a = "https://media.soundgasm.net/sounds/abc123DEF456.m4a";
      setupPlayer(m4a);
    });
  </script>
</body>
</html>"#;

    fn fast_resolver() -> AudioResolver {
        let sender = RequestSender::new(&Config::default()).unwrap();
        AudioResolver::new(
            sender,
            ResolveRetry {
                attempts: 3,
                base_delay_ms: 1,
            },
        )
    }

    fn item(page_url: &str, title: &str) -> DiscoveredItem {
        DiscoveredItem::new(
            title.to_string(),
            page_url.to_string(),
            String::from("https://www.reddit.com/r/test/comments/abc/post/"),
            Some(String::from("posted in a request thread")),
        )
    }

    #[tokio::test]
    async fn full_page_resolves_to_a_task() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/u/velvet-voice/Midnight-Story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(PAGE_BODY))
            .mount(&server)
            .await;

        let page_url = format!("{}/u/velvet-voice/Midnight-Story", server.uri());
        let task = fast_resolver()
            .resolve(&item(&page_url, "feed title"))
            .await
            .unwrap();

        assert_eq!(task.title(), "Midnight Story");
        assert_eq!(
            task.stream_url(),
            "https://media.soundgasm.net/sounds/abc123DEF456.m4a"
        );
        assert_eq!(
            task.description(),
            Some("A slow, quiet story for late nights.")
        );
        assert_eq!(task.hint(), "velvet-voice");
        assert_eq!(task.ext(), "m4a");
        assert_eq!(task.page_url(), Some(page_url.as_str()));
    }

    #[tokio::test]
    async fn removed_page_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/u/velvet-voice/Deleted"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let page_url = format!("{}/u/velvet-voice/Deleted", server.uri());
        let err = fast_resolver()
            .resolve(&item(&page_url, "gone"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn page_without_media_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/u/velvet-voice/Empty"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body><h1>hello</h1></body></html>"),
            )
            .mount(&server)
            .await;

        let page_url = format!("{}/u/velvet-voice/Empty", server.uri());
        let err = fast_resolver()
            .resolve(&item(&page_url, "empty"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Malformed { .. }));
    }

    #[tokio::test]
    async fn title_falls_back_to_feed_then_slug() {
        let server = MockServer::start().await;
        let bare = format!(
            "<html><body><script>var u = \"{}\";</script></body></html>",
            "https://media.soundgasm.net/sounds/ff00aa.m4a"
        );
        Mock::given(method("GET"))
            .and(path("/u/velvet-voice/Late-Night-Tale"))
            .respond_with(ResponseTemplate::new(200).set_body_string(bare))
            .mount(&server)
            .await;

        let page_url = format!("{}/u/velvet-voice/Late-Night-Tale", server.uri());
        let resolver = fast_resolver();

        let from_feed = resolver.resolve(&item(&page_url, "feed title")).await.unwrap();
        assert_eq!(from_feed.title(), "feed title");

        let from_slug = resolver.resolve(&item(&page_url, "   ")).await.unwrap();
        assert_eq!(from_slug.title(), "Late Night Tale");
    }

    #[tokio::test]
    async fn unreachable_page_records_every_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/u/velvet-voice/Flaky"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let page_url = format!("{}/u/velvet-voice/Flaky", server.uri());
        let err = fast_resolver()
            .resolve(&item(&page_url, "flaky"))
            .await
            .unwrap_err();

        assert!(matches!(err, ResolveError::Unreachable { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn refresh_picks_up_a_rotated_stream_url() {
        let server = MockServer::start().await;
        let first = PAGE_BODY;
        let second = PAGE_BODY.replace("abc123DEF456", "rotated999");

        Mock::given(method("GET"))
            .and(path("/u/velvet-voice/Midnight-Story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(first))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/u/velvet-voice/Midnight-Story"))
            .respond_with(ResponseTemplate::new(200).set_body_string(second))
            .mount(&server)
            .await;

        let page_url = format!("{}/u/velvet-voice/Midnight-Story", server.uri());
        let resolver = fast_resolver();

        let task = resolver.resolve(&item(&page_url, "t")).await.unwrap();
        assert!(task.stream_url().contains("abc123DEF456"));

        let refreshed = resolver.refresh(&task).await.unwrap();
        assert!(refreshed.stream_url().contains("rotated999"));
        assert_eq!(refreshed.key(), task.key());
    }

    #[test]
    fn direct_media_links_become_tasks_without_a_page() {
        let task = direct_media_task("https://media.soundgasm.net/sounds/f00ba4.m4a");
        assert_eq!(task.title(), "f00ba4");
        assert_eq!(task.hint(), "unsorted");
        assert_eq!(task.ext(), "m4a");
        assert_eq!(task.page_url(), None);
        assert_eq!(task.key(), "https://media.soundgasm.net/sounds/f00ba4.m4a");
    }
}
