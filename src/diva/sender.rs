use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::diva::io::Config;
use crate::diva::sender::entries::{ListingEntry, TokenEntry};

pub(crate) mod entries;

/// Base URL for token grants.
const AUTH_BASE: &str = "https://www.reddit.com";

/// Base URL for authenticated feed reads.
const API_BASE: &str = "https://oauth.reddit.com";

/// User agent sent with every request, as the platform requires.
const USER_AGENT: &str = concat!(
    "script:diva:v",
    env!("CARGO_PKG_VERSION"),
    " (soundgasm profile archiver)"
);

/// Items requested per feed page.
const FEED_PAGE_LIMIT: u8 = 100;

/// Seconds shaved off a token's lifetime so it is refreshed before expiry.
const TOKEN_REFRESH_MARGIN_SECS: u64 = 60;

/// Errors raised by requests to the platform or the audio host.
#[derive(Error, Debug)]
pub(crate) enum SenderError {
    #[error("request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("application credentials were rejected")]
    Unauthorized,

    #[error("client id and secret are missing from the config")]
    MissingCredentials,

    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<u64> },

    #[error("HTTP error {status} from {url}")]
    Status { status: StatusCode, url: String },
}

impl SenderError {
    /// Whether a retry with backoff could plausibly succeed.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            SenderError::Transport(_) | SenderError::RateLimited { .. } => true,
            SenderError::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Which half of a profile's feed to page through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FeedKind {
    Submitted,
    Comments,
}

impl FeedKind {
    fn as_path(&self) -> &'static str {
        match self {
            FeedKind::Submitted => "submitted",
            FeedKind::Comments => "comments",
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Shared HTTP entry point: one pooled client, the application identity, and
/// a cached bearer token for feed reads. Cloned freely across tasks.
#[derive(Clone)]
pub(crate) struct RequestSender {
    client: Client,
    client_id: String,
    client_secret: String,
    auth_base: String,
    api_base: String,
    token: Arc<Mutex<Option<CachedToken>>>,
    #[cfg(test)]
    media_base: Option<String>,
}

impl RequestSender {
    pub(crate) fn new(config: &Config) -> Result<Self, SenderError> {
        // No whole-request timeout: audio downloads can legitimately run for
        // minutes. Stalls are caught by the read timeout instead.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .read_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .gzip(true)
            .build()?;

        Ok(RequestSender {
            client,
            client_id: config.client_id().to_string(),
            client_secret: config.client_secret().to_string(),
            auth_base: String::from(AUTH_BASE),
            api_base: String::from(API_BASE),
            token: Arc::new(Mutex::new(None)),
            #[cfg(test)]
            media_base: None,
        })
    }

    /// Points feed and token requests at a stand-in server.
    #[cfg(test)]
    pub(crate) fn with_bases(mut self, auth_base: &str, api_base: &str) -> Self {
        self.auth_base = auth_base.to_string();
        self.api_base = api_base.to_string();
        self
    }

    /// Points minted stream URLs at a stand-in server.
    #[cfg(test)]
    pub(crate) fn with_media_base(mut self, media_base: &str) -> Self {
        self.media_base = Some(media_base.trim_end_matches('/').to_string());
        self
    }

    #[cfg(test)]
    fn rebase_media(&self, url: &str) -> String {
        match &self.media_base {
            Some(base) => url.replacen("https://media.soundgasm.net", base, 1),
            None => url.to_string(),
        }
    }

    /// Fetches one page of a profile's feed.
    pub(crate) async fn feed_page(
        &self,
        profile: &str,
        kind: FeedKind,
        cursor: Option<&str>,
    ) -> Result<ListingEntry, SenderError> {
        let token = self.bearer_token().await?;
        let mut url = format!(
            "{}/user/{}/{}?limit={}&raw_json=1",
            self.api_base,
            profile,
            kind.as_path(),
            FEED_PAGE_LIMIT
        );
        if let Some(after) = cursor {
            url.push_str("&after=");
            url.push_str(after);
        }

        trace!("Fetching feed page: {}", url);
        let response = self.client.get(&url).bearer_auth(&token).send().await?;
        let response = Self::check_feed_status(response, &url)?;

        Ok(response.json::<ListingEntry>().await?)
    }

    /// Fetches a whole submission thread (the submission listing followed by
    /// its comment listing).
    pub(crate) async fn thread(&self, article: &str) -> Result<Vec<ListingEntry>, SenderError> {
        let token = self.bearer_token().await?;
        let url = format!("{}/comments/{}?limit=500&raw_json=1", self.api_base, article);

        trace!("Fetching thread: {}", url);
        let response = self.client.get(&url).bearer_auth(&token).send().await?;
        let response = Self::check_feed_status(response, &url)?;

        Ok(response.json::<Vec<ListingEntry>>().await?)
    }

    /// Fetches an audio host page as text. No authentication involved.
    pub(crate) async fn page_text(&self, url: &str) -> Result<String, SenderError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(SenderError::NotFound {
                url: url.to_string(),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SenderError::RateLimited {
                retry_after: retry_after_secs(&response),
            });
        }
        if !status.is_success() {
            return Err(SenderError::Status {
                status,
                url: url.to_string(),
            });
        }

        Ok(response.text().await?)
    }

    /// Opens a streaming GET against a media URL. Status triage is left to
    /// the caller, which owns the retry policy.
    pub(crate) async fn begin_stream(&self, url: &str) -> Result<Response, SenderError> {
        #[cfg(test)]
        let url = &self.rebase_media(url);
        Ok(self.client.get(url).send().await?)
    }

    async fn bearer_token(&self) -> Result<String, SenderError> {
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(SenderError::MissingCredentials);
        }

        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.value.clone());
            }
        }

        let url = format!("{}/api/v1/access_token", self.auth_base);
        trace!("Requesting access token...");
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SenderError::Unauthorized);
        }
        if !status.is_success() {
            return Err(SenderError::Status { status, url });
        }

        let token: TokenEntry = response.json().await?;
        let lifetime = token
            .expires_in
            .saturating_sub(TOKEN_REFRESH_MARGIN_SECS)
            .max(60);
        *guard = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(lifetime),
        });
        debug!("Access token refreshed, lifetime {}s", lifetime);

        Ok(token.access_token)
    }

    fn check_feed_status(response: Response, url: &str) -> Result<Response, SenderError> {
        let status = response.status();
        match status {
            StatusCode::UNAUTHORIZED => Err(SenderError::Unauthorized),
            StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Err(SenderError::NotFound {
                url: url.to_string(),
            }),
            StatusCode::TOO_MANY_REQUESTS => Err(SenderError::RateLimited {
                retry_after: retry_after_secs(&response),
            }),
            _ if !status.is_success() => Err(SenderError::Status {
                status,
                url: url.to_string(),
            }),
            _ => Ok(response),
        }
    }
}

/// Parses a `Retry-After` header as whole seconds.
pub(crate) fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
}

/// Calculate the backoff duration using exponential backoff.
pub(crate) fn calculate_backoff(attempt: u32, base_delay_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let max_delay = 60_000;

    let delay = (1u64 << exponent) * base_delay_ms;
    std::cmp::min(delay, max_delay)
}
