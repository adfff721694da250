use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::diva::downloader::{DownloadOutcome, DownloadPool, DownloadPoolConfig, DownloadResult};
use crate::diva::extractor::ImportEntry;
use crate::diva::io::Config;
use crate::diva::organizer::FileOrganizer;
use crate::diva::progress::DownloadObserver;
use crate::diva::resolver::{direct_media_task, AudioResolver, ResolveRetry, ResolvedTask};
use crate::diva::scanner::{DiscoveredItem, FeedError, FeedRetry, ProfileScan};
use crate::diva::sender::{RequestSender, SenderError};

pub(crate) mod downloader;
pub(crate) mod extractor;
pub(crate) mod io;
pub(crate) mod organizer;
pub(crate) mod progress;
pub(crate) mod resolver;
pub(crate) mod scanner;
pub(crate) mod sender;

/// Coarse phase of a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Scanning,
    Resolving,
    Downloading,
    Cancelling,
    Summarizing,
    Done,
}

/// What the user asked a session to work through.
pub(crate) enum SessionRequest {
    /// Scan these profile feeds for audio links.
    Profiles(Vec<String>),
    /// Raw text, one link or handle per line.
    LinkText(String),
}

/// One entry that did not make it, kept for the closing report.
#[derive(Debug, Clone)]
pub(crate) struct FailureNote {
    pub(crate) title: String,
    pub(crate) url: String,
    pub(crate) reason: String,
}

/// Closing report for one session.
#[derive(Debug)]
pub(crate) struct SessionSummary {
    pub(crate) started_at: DateTime<Local>,
    pub(crate) discovered: usize,
    pub(crate) resolved: usize,
    pub(crate) succeeded: usize,
    pub(crate) skipped: usize,
    pub(crate) failed: usize,
    pub(crate) bytes_downloaded: u64,
    pub(crate) elapsed: Duration,
    pub(crate) cancelled: bool,
    pub(crate) feed_failures: Vec<FailureNote>,
    pub(crate) resolution_failures: Vec<FailureNote>,
    pub(crate) download_failures: Vec<FailureNote>,
}

impl SessionSummary {
    /// Logs the report the way the rest of the app talks: a couple of info
    /// lines, then one warn block per failure category.
    pub(crate) fn log(&self) {
        debug!(
            "Session opened at {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        info!("Finished downloading!");
        if self.discovered > 0 {
            info!(
                "Resolved {} of {} discovered link(s)",
                self.resolved, self.discovered
            );
        }
        let secs = self.elapsed.as_secs_f64();
        if self.bytes_downloaded > 0 && secs > 0.0 {
            info!(
                "Downloaded {} file(s) ({}) in {} at {}/s",
                self.succeeded,
                format_file_size(self.bytes_downloaded),
                format_duration(self.elapsed),
                format_file_size((self.bytes_downloaded as f64 / secs) as u64)
            );
        } else {
            info!(
                "Downloaded {} file(s) ({}) in {}",
                self.succeeded,
                format_file_size(self.bytes_downloaded),
                format_duration(self.elapsed)
            );
        }
        if self.skipped > 0 {
            info!("Skipped {} file(s) already on disk", self.skipped);
        }
        if self.cancelled {
            info!("Run was stopped early, queued work was dropped");
        }

        for note in &self.feed_failures {
            warn!("Feed unavailable for \"{}\": {}", note.title, note.reason);
        }
        if !self.resolution_failures.is_empty() {
            warn!(
                "{} link(s) could not be resolved:",
                self.resolution_failures.len()
            );
            for note in &self.resolution_failures {
                warn!("    {}: {}", note.url, note.reason);
            }
        }
        if !self.download_failures.is_empty() {
            warn!("{} download(s) failed:", self.download_failures.len());
            for note in &self.download_failures {
                warn!("    \"{}\": {}", note.title, note.reason);
            }
        }
    }
}

/// Errors that end a session before any downloads run. Per-item trouble is
/// never fatal, it lands in the summary instead.
#[derive(Error, Debug)]
pub(crate) enum SessionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("feed credentials are missing or were rejected")]
    Credentials,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Links and direct tasks collected during the scanning phase.
#[derive(Default)]
pub(crate) struct ScanReport {
    pub(crate) items: Vec<DiscoveredItem>,
    pub(crate) direct: Vec<ResolvedTask>,
    pub(crate) feed_failures: Vec<FailureNote>,
}

/// What came back from one pass of the resolve-and-download pipeline.
#[derive(Default)]
pub(crate) struct DownloadReport {
    pub(crate) results: Vec<DownloadResult>,
    pub(crate) resolution_failures: Vec<FailureNote>,
    pub(crate) resolved: usize,
}

struct Tally {
    succeeded: usize,
    skipped: usize,
    failed: usize,
    bytes_downloaded: u64,
    failures: Vec<FailureNote>,
}

/// Drives one session through its phases: scan the sources, resolve every
/// page into a stream URL, run the download pool, then report.
pub(crate) struct SessionController {
    config: Config,
    sender: RequestSender,
    resolver: Arc<AudioResolver>,
    organizer: Arc<FileOrganizer>,
    observer: Arc<dyn DownloadObserver>,
    cancel: CancellationToken,
    state: SessionState,
}

impl SessionController {
    pub(crate) fn new(
        config: Config,
        observer: Arc<dyn DownloadObserver>,
    ) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(|err| SessionError::Config(err.to_string()))?;

        let sender = RequestSender::new(&config)
            .map_err(|err| SessionError::Config(err.to_string()))?;
        let resolver = Arc::new(AudioResolver::new(
            sender.clone(),
            ResolveRetry {
                attempts: config.retry_count(),
                base_delay_ms: config.retry_delay_ms(),
            },
        ));
        let organizer = Arc::new(FileOrganizer::new(Path::new(config.download_directory()))?);

        Ok(SessionController {
            config,
            sender,
            resolver,
            organizer,
            observer,
            cancel: CancellationToken::new(),
            state: SessionState::Idle,
        })
    }

    /// Points network traffic at a stand-in server.
    #[cfg(test)]
    pub(crate) fn rewire_sender(&mut self, sender: RequestSender) {
        self.resolver = Arc::new(AudioResolver::new(
            sender.clone(),
            ResolveRetry {
                attempts: 1,
                base_delay_ms: 1,
            },
        ));
        self.sender = sender;
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the whole session. Always comes back with a summary unless the
    /// configuration or credentials are unusable.
    pub(crate) async fn run(
        &mut self,
        request: SessionRequest,
    ) -> Result<SessionSummary, SessionError> {
        let started = Instant::now();
        let started_at = Local::now();
        debug!("Saving files under {:?}", self.organizer.root());

        let watcher_cancel = self.cancel.clone();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Stop requested, letting in-flight downloads finish...");
                watcher_cancel.cancel();
            }
        });

        self.enter(SessionState::Scanning);
        let scan = self.scan_phase(&request).await?;
        let discovered = scan.items.len() + scan.direct.len();

        let mut report = DownloadReport::default();
        if !self.cancel.is_cancelled() {
            self.enter(SessionState::Resolving);
            report = self.download_phase(scan.items, scan.direct).await;
        }

        if self.cancel.is_cancelled() {
            self.enter(SessionState::Cancelling);
        }
        self.enter(SessionState::Summarizing);
        let tally = tally_results(&report.results);
        let summary = SessionSummary {
            started_at,
            discovered,
            resolved: report.resolved,
            succeeded: tally.succeeded,
            skipped: tally.skipped,
            failed: tally.failed,
            bytes_downloaded: tally.bytes_downloaded,
            elapsed: started.elapsed(),
            cancelled: self.cancel.is_cancelled(),
            feed_failures: scan.feed_failures,
            resolution_failures: report.resolution_failures,
            download_failures: tally.failures,
        };
        summary.log();

        watcher.abort();
        self.enter(SessionState::Done);
        Ok(summary)
    }

    fn enter(&mut self, next: SessionState) {
        trace!("Session state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Walks every requested source and collects audio links. Only broken
    /// credentials abort the scan, a dead profile just leaves a note.
    pub(crate) async fn scan_phase(
        &self,
        request: &SessionRequest,
    ) -> Result<ScanReport, SessionError> {
        let mut report = ScanReport::default();
        let mut seen: HashSet<String> = HashSet::new();

        match request {
            SessionRequest::Profiles(profiles) => {
                for profile in profiles {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.scan_profile(profile, &mut report, &mut seen).await?;
                }
            }
            SessionRequest::LinkText(text) => {
                for token in text.split_whitespace() {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let Some(entry) = extractor::parse_import_line(token) else {
                        debug!("Ignoring unrecognized import entry: {}", token);
                        continue;
                    };
                    match entry {
                        ImportEntry::Profile(profile) => {
                            self.scan_profile(&profile, &mut report, &mut seen).await?;
                        }
                        ImportEntry::HostPage(url) => {
                            if seen.insert(url.to_lowercase()) {
                                report.items.push(DiscoveredItem::new(
                                    String::new(),
                                    url.clone(),
                                    url,
                                    None,
                                ));
                            }
                        }
                        ImportEntry::MediaLink(url) => {
                            if seen.insert(url.to_lowercase()) {
                                report.direct.push(direct_media_task(&url));
                            }
                        }
                        ImportEntry::RedditPost(url) => {
                            self.scan_thread(&url, &mut report, &mut seen).await?;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    async fn scan_profile(
        &self,
        profile: &str,
        report: &mut ScanReport,
        seen: &mut HashSet<String>,
    ) -> Result<(), SessionError> {
        info!(
            "Scanning profile {}...",
            console::style(format!("\"{}\"", profile)).color256(39).italic()
        );

        let retry = FeedRetry {
            attempts: self.config.retry_count(),
            base_delay_ms: self.config.retry_delay_ms(),
        };
        let mut scan = ProfileScan::new(self.sender.clone(), profile, None, retry);
        let mut found = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match scan.next().await {
                Ok(Some(item)) => {
                    if seen.insert(item.page_url().to_lowercase()) {
                        debug!("Found {} via {}", item.page_url(), item.permalink());
                        report.items.push(item);
                        found += 1;
                    }
                }
                Ok(None) => break,
                Err(FeedError::Credentials) => return Err(SessionError::Credentials),
                Err(err) => {
                    report.feed_failures.push(FailureNote {
                        title: profile.to_string(),
                        url: String::new(),
                        reason: err.to_string(),
                    });
                    break;
                }
            }
        }

        info!("{} audio link(s) grabbed from \"{}\"!", found, profile);
        Ok(())
    }

    async fn scan_thread(
        &self,
        url: &str,
        report: &mut ScanReport,
        seen: &mut HashSet<String>,
    ) -> Result<(), SessionError> {
        let Some(article) = extractor::reddit_article(url) else {
            debug!("No article id in {}", url);
            return Ok(());
        };

        debug!("Searching thread {} for audio links...", article);
        let listings = match self.sender.thread(&article).await {
            Ok(listings) => listings,
            Err(SenderError::Unauthorized | SenderError::MissingCredentials) => {
                return Err(SessionError::Credentials);
            }
            Err(err) => {
                report.feed_failures.push(FailureNote {
                    title: url.to_string(),
                    url: url.to_string(),
                    reason: err.to_string(),
                });
                return Ok(());
            }
        };

        let mut text = String::new();
        for listing in &listings {
            listing.flatten_text_into(&mut text);
        }
        for link in extractor::extract_links(&text) {
            if seen.insert(link.to_lowercase()) {
                report
                    .items
                    .push(DiscoveredItem::new(String::new(), link, url.to_string(), None));
            }
        }
        Ok(())
    }

    /// Resolves discovered pages in a producer task and feeds each download
    /// through the bounded queue into the worker pool. A stream URL is
    /// minted right before its task enters the queue, so it never sits
    /// around going stale, and a page that cannot be resolved costs that
    /// item only.
    pub(crate) async fn download_phase(
        &mut self,
        items: Vec<DiscoveredItem>,
        direct: Vec<ResolvedTask>,
    ) -> DownloadReport {
        let pool = DownloadPool::new(
            DownloadPoolConfig::from_config(&self.config),
            self.sender.clone(),
            Arc::clone(&self.resolver),
            Arc::clone(&self.organizer),
            Arc::clone(&self.observer),
            self.cancel.clone(),
        );

        let (task_tx, task_rx) = flume::bounded(pool.queue_bound());
        let resolver = Arc::clone(&self.resolver);
        let feeder_cancel = self.cancel.clone();
        let feeder = tokio::spawn(async move {
            let total = items.len();
            let mut failures = Vec::new();
            let mut resolved = 0usize;
            let mut queued = 0usize;

            for item in items {
                if feeder_cancel.is_cancelled() {
                    break;
                }
                let task = match resolver.resolve(&item).await {
                    Ok(task) => task,
                    Err(err) => {
                        failures.push(FailureNote {
                            title: item.title().to_string(),
                            url: item.page_url().to_string(),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                };
                resolved += 1;
                tokio::select! {
                    biased;
                    _ = feeder_cancel.cancelled() => break,
                    sent = task_tx.send_async(task) => {
                        if sent.is_err() {
                            break;
                        }
                        queued += 1;
                    }
                }
            }

            for task in direct {
                tokio::select! {
                    biased;
                    _ = feeder_cancel.cancelled() => break,
                    sent = task_tx.send_async(task) => {
                        if sent.is_err() {
                            break;
                        }
                        queued += 1;
                    }
                }
            }

            if total > 0 {
                info!("{} of {} link(s) resolved", resolved, total);
            }
            (failures, queued)
        });

        self.enter(SessionState::Downloading);
        let results = pool.run(task_rx).await;
        let (resolution_failures, resolved) = match feeder.await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Resolver task panicked: {}", err);
                (Vec::new(), 0)
            }
        };

        DownloadReport {
            results,
            resolution_failures,
            resolved,
        }
    }
}

fn tally_results(results: &[DownloadResult]) -> Tally {
    let mut tally = Tally {
        succeeded: 0,
        skipped: 0,
        failed: 0,
        bytes_downloaded: 0,
        failures: Vec::new(),
    };

    for result in results {
        match result.outcome() {
            DownloadOutcome::Success { .. } => {
                tally.succeeded += 1;
                tally.bytes_downloaded += result.bytes_written();
            }
            DownloadOutcome::Skipped { .. } => tally.skipped += 1,
            DownloadOutcome::Failure { reason } => {
                tally.failed += 1;
                tally.failures.push(FailureNote {
                    title: result.task().title().to_string(),
                    url: result.task().key().to_string(),
                    reason: reason.clone(),
                });
            }
        }
    }
    tally
}

/// Formats file size in bytes to a human-readable string with appropriate units
pub(crate) fn format_file_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let size = size_bytes as f64;

    if size >= GB {
        format!("{:.2} GB", size / GB)
    } else if size >= MB {
        format!("{:.2} MB", size / MB)
    } else if size >= KB {
        format!("{:.2} KB", size / KB)
    } else {
        format!("{} bytes", size_bytes)
    }
}

pub(crate) fn format_duration(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    if total_secs >= 60 {
        format!("{}m {}s", total_secs / 60, total_secs % 60)
    } else {
        format!("{:.1}s", elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diva::progress::NoopObserver;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn controller_for(server: &MockServer) -> (SessionController, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.set_download_directory(dir.path().to_string_lossy().into_owned());
        config.set_credentials("app-id".to_string(), "app-secret".to_string());

        let mut controller = SessionController::new(config.clone(), Arc::new(NoopObserver)).unwrap();
        let sender = RequestSender::new(&config)
            .unwrap()
            .with_bases(&server.uri(), &server.uri());
        controller.rewire_sender(sender);
        (controller, dir)
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/v1/access_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "token_type": "bearer",
                "expires_in": 3600
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn import_lines_are_classified_and_deduplicated() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        let link_one = "https://soundgasm.net/u/voice/First-Story";
        let link_two = "https://soundgasm.net/u/voice/Second-Story";
        Mock::given(method("GET"))
            .and(path("/comments/1abc2d"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "kind": "Listing",
                    "data": { "after": null, "children": [{
                        "kind": "t3",
                        "data": {
                            "title": "request filled",
                            "selftext": format!("{link_one} and again {link_one}")
                        }
                    }]}
                },
                {
                    "kind": "Listing",
                    "data": { "after": null, "children": [{
                        "kind": "t1",
                        "data": { "body": format!("mirror: {link_two}") }
                    }]}
                }
            ])))
            .mount(&server)
            .await;

        let (controller, _dir) = controller_for(&server);
        let text = [
            "https://reddit.com/r/audio/comments/1abc2d/slug",
            "https://media.soundgasm.net/sounds/f00ba4.m4a",
            "https://soundgasm.net/u/voice/Third-Story",
            "???",
            "",
        ]
        .join("\n");

        let report = controller
            .scan_phase(&SessionRequest::LinkText(text))
            .await
            .unwrap();

        let mut pages: Vec<&str> = report.items.iter().map(|i| i.page_url()).collect();
        pages.sort_unstable();
        assert_eq!(
            pages,
            vec![
                link_one,
                link_two,
                "https://soundgasm.net/u/voice/Third-Story",
            ]
        );
        assert_eq!(report.direct.len(), 1);
        assert_eq!(report.direct[0].title(), "f00ba4");
        assert!(report.feed_failures.is_empty());
    }

    #[tokio::test]
    async fn links_crammed_onto_one_line_import_separately() {
        let server = MockServer::start().await;
        let (controller, _dir) = controller_for(&server);

        let media = "https://media.soundgasm.net/sounds/f00ba4.m4a";
        let text = format!("{media} https://soundgasm.net/u/voice/Solo-Story {media}");

        let report = controller
            .scan_phase(&SessionRequest::LinkText(text))
            .await
            .unwrap();

        assert_eq!(report.items.len(), 1);
        assert_eq!(
            report.items[0].page_url(),
            "https://soundgasm.net/u/voice/Solo-Story"
        );
        assert_eq!(report.direct.len(), 1);
        assert_eq!(report.direct[0].title(), "f00ba4");
    }

    #[tokio::test]
    async fn download_outcomes_aggregate_into_a_tally() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sounds/ok.m4a"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abcde".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/sounds/bad.m4a"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (mut controller, dir) = controller_for(&server);
        let tasks = vec![
            direct_media_task(&format!("{}/sounds/ok.m4a", server.uri())),
            direct_media_task(&format!("{}/sounds/bad.m4a", server.uri())),
        ];
        let report = controller.download_phase(Vec::new(), tasks).await;
        let tally = tally_results(&report.results);

        assert_eq!(tally.succeeded, 1);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.skipped, 0);
        assert_eq!(tally.bytes_downloaded, 5);
        assert_eq!(tally.failures.len(), 1);
        assert_eq!(tally.failures[0].title, "bad");
        assert!(dir.path().join("unsorted").join("ok.m4a").exists());
    }

    #[tokio::test]
    async fn pages_resolve_as_the_pool_drains() {
        let server = MockServer::start().await;
        for i in 1..=5 {
            let page = format!(
                "<html><body><h1>Take {i}</h1>\
                 <script>var m4a = \"https://media.soundgasm.net/sounds/take{i}.m4a\";</script>\
                 </body></html>"
            );
            Mock::given(method("GET"))
                .and(path(format!("/u/rotation/take-{i}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(page))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path(format!("/sounds/take{i}.m4a")))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(b"audio".to_vec()))
                .mount(&server)
                .await;
        }

        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.set_download_directory(dir.path().to_string_lossy().into_owned());
        config.set_worker_count(1);

        let mut controller =
            SessionController::new(config.clone(), Arc::new(NoopObserver)).unwrap();
        let sender = RequestSender::new(&config)
            .unwrap()
            .with_bases(&server.uri(), &server.uri())
            .with_media_base(&server.uri());
        controller.rewire_sender(sender);

        let items: Vec<DiscoveredItem> = (1..=5)
            .map(|i| {
                DiscoveredItem::new(
                    format!("Take {i}"),
                    format!("{}/u/rotation/take-{i}", server.uri()),
                    String::new(),
                    None,
                )
            })
            .collect();
        let report = controller.download_phase(items, Vec::new()).await;

        assert_eq!(report.resolved, 5);
        assert!(report.resolution_failures.is_empty());
        assert_eq!(report.results.len(), 5);
        assert!(report.results.iter().all(|r| r.is_success()));

        // One worker and a queue bound of two: the fifth page can only be
        // fetched once the first download has freed a queue slot.
        let requests = server.received_requests().await.unwrap();
        let first_media = requests
            .iter()
            .position(|r| r.url.path().starts_with("/sounds/"))
            .unwrap();
        let last_page = requests
            .iter()
            .rposition(|r| r.url.path().starts_with("/u/"))
            .unwrap();
        assert!(
            first_media < last_page,
            "every page was fetched before any download started"
        );
    }

    #[tokio::test]
    async fn an_empty_run_still_completes() {
        let server = MockServer::start().await;
        let (mut controller, _dir) = controller_for(&server);

        let summary = controller
            .run(SessionRequest::LinkText(String::from("??? !!!\n\n")))
            .await
            .unwrap();

        assert_eq!(summary.discovered, 0);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 0);
        assert!(!summary.cancelled);
        assert_eq!(controller.state(), SessionState::Done);
    }

    #[test]
    fn sizes_and_durations_read_naturally() {
        assert_eq!(format_file_size(512), "512 bytes");
        assert_eq!(format_file_size(2048), "2.00 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_file_size(3 * 1024 * 1024 * 1024), "3.00 GB");

        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
    }
}
