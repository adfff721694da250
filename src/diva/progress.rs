use std::collections::HashMap;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;

use crate::diva::downloader::{DownloadOutcome, DownloadResult};
use crate::diva::resolver::ResolvedTask;
use crate::diva::{format_duration, format_file_size};

pub(crate) trait Shorten<T> {
    fn shorten(&self, delimiter: T) -> String;
}

impl Shorten<&str> for ResolvedTask {
    fn shorten(&self, delimiter: &str) -> String {
        let title = self.title();
        if title.chars().count() >= 25 {
            let mut short_name: String = title.chars().take(25).collect();
            short_name.push_str(delimiter);
            short_name
        } else {
            title.to_string()
        }
    }
}

/// Receives download lifecycle events from the worker pool. Workers only
/// report; whatever renders or records the events lives behind this trait.
pub(crate) trait DownloadObserver: Send + Sync {
    fn on_started(&self, _task: &ResolvedTask, _total: Option<u64>) {}

    fn on_progress(&self, _task: &ResolvedTask, _bytes: u64, _total: Option<u64>) {}

    /// Called once before streaming when the reported size crosses the
    /// configured threshold. Informational only, the download proceeds.
    fn on_large_file(&self, _task: &ResolvedTask, _size: u64) {}

    fn on_finished(&self, _result: &DownloadResult) {}
}

/// Observer that swallows every event.
pub(crate) struct NoopObserver;

impl DownloadObserver for NoopObserver {}

/// Renders one progress bar per active download and logs outcomes.
pub(crate) struct ProgressReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressReporter {
    pub(crate) fn new() -> Self {
        ProgressReporter {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(5)),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn byte_bar(&self, total: u64) -> ProgressBar {
        let progress_style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");

        let progress_bar = self.multi.add(ProgressBar::new(total));
        progress_bar.set_style(progress_style);
        progress_bar
    }

    fn spinner_bar(&self) -> ProgressBar {
        let progress_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {bytes} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());

        let progress_bar = self.multi.add(ProgressBar::new_spinner());
        progress_bar.set_style(progress_style);
        progress_bar.enable_steady_tick(Duration::from_millis(200));
        progress_bar
    }
}

impl DownloadObserver for ProgressReporter {
    fn on_started(&self, task: &ResolvedTask, total: Option<u64>) {
        let progress_bar = match total {
            Some(total) => self.byte_bar(total),
            None => self.spinner_bar(),
        };
        progress_bar.set_message(task.shorten("..."));
        self.bars
            .lock()
            .insert(task.key().to_string(), progress_bar);
    }

    fn on_progress(&self, task: &ResolvedTask, bytes: u64, total: Option<u64>) {
        let bars = self.bars.lock();
        if let Some(progress_bar) = bars.get(task.key()) {
            if let Some(total) = total {
                if progress_bar.length().is_none() {
                    progress_bar.set_length(total);
                }
            }
            progress_bar.set_position(bytes);
        }
    }

    fn on_large_file(&self, task: &ResolvedTask, size: u64) {
        warn!(
            "{} weighs in at {}, this will take a while...",
            console::style(format!("\"{}\"", task.title()))
                .color256(39)
                .italic(),
            format_file_size(size)
        );
    }

    fn on_finished(&self, result: &DownloadResult) {
        if let Some(progress_bar) = self.bars.lock().remove(result.task().key()) {
            progress_bar.finish_and_clear();
        }

        let styled_title = console::style(format!("\"{}\"", result.task().title()))
            .color256(39)
            .italic();
        match result.outcome() {
            DownloadOutcome::Success { .. } => {
                if result.retries() > 0 {
                    info!(
                        "{} downloaded after {} retries!",
                        styled_title,
                        result.retries()
                    );
                } else {
                    info!(
                        "{} downloaded in {}!",
                        styled_title,
                        format_duration(result.elapsed())
                    );
                }
            }
            DownloadOutcome::Skipped { .. } => {
                info!("{} is already saved, skipping...", styled_title);
            }
            DownloadOutcome::Failure { reason } => {
                warn!("{} failed to download: {}", styled_title, reason);
            }
        }
    }
}

/// Test double that records the order of lifecycle events.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<ObservedEvent>>,
}

#[cfg(test)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ObservedEvent {
    Started(String),
    LargeFile(String, u64),
    Finished(String, bool),
}

#[cfg(test)]
impl RecordingObserver {
    pub(crate) fn events(&self) -> Vec<ObservedEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn started_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, ObservedEvent::Started(_)))
            .count()
    }

    pub(crate) fn large_file_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, ObservedEvent::LargeFile(..)))
            .count()
    }
}

#[cfg(test)]
impl DownloadObserver for RecordingObserver {
    fn on_started(&self, task: &ResolvedTask, _total: Option<u64>) {
        self.events
            .lock()
            .push(ObservedEvent::Started(task.title().to_string()));
    }

    fn on_large_file(&self, task: &ResolvedTask, size: u64) {
        self.events
            .lock()
            .push(ObservedEvent::LargeFile(task.title().to_string(), size));
    }

    fn on_finished(&self, result: &DownloadResult) {
        self.events.lock().push(ObservedEvent::Finished(
            result.task().title().to_string(),
            result.is_success(),
        ));
    }
}
