use std::env::current_dir;
use std::fs;
use std::sync::Arc;

use anyhow::Error;
use console::Term;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input, Select};
use tokio::runtime::Runtime;

use crate::diva::extractor::{parse_import_line, ImportEntry};
use crate::diva::io::{emergency_exit, Config};
use crate::diva::progress::ProgressReporter;
use crate::diva::{SessionController, SessionError, SessionRequest};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The authors who created the package.
const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");

/// Main menu options.
#[derive(Debug, Clone, Copy)]
enum MainMenuOption {
    DownloadProfiles,
    ImportLinks,
    Options,
    Exit,
}

impl MainMenuOption {
    fn variants() -> &'static [MainMenuOption] {
        &[
            MainMenuOption::DownloadProfiles,
            MainMenuOption::ImportLinks,
            MainMenuOption::Options,
            MainMenuOption::Exit,
        ]
    }

    fn display_name(&self) -> &'static str {
        match self {
            MainMenuOption::DownloadProfiles => "Download audios from profiles",
            MainMenuOption::ImportLinks => "Import links from text or file",
            MainMenuOption::Options => "Options",
            MainMenuOption::Exit => "Exit",
        }
    }
}

/// Sources the link importer can read from.
#[derive(Debug, Clone, Copy)]
enum ImportSourceOption {
    PasteText,
    ReadFile,
    Back,
}

impl ImportSourceOption {
    fn variants() -> &'static [ImportSourceOption] {
        &[
            ImportSourceOption::PasteText,
            ImportSourceOption::ReadFile,
            ImportSourceOption::Back,
        ]
    }

    fn display_name(&self) -> &'static str {
        match self {
            ImportSourceOption::PasteText => "Paste links",
            ImportSourceOption::ReadFile => "Read links from a file",
            ImportSourceOption::Back => "Back to main menu",
        }
    }
}

/// Options menu entries.
#[derive(Debug, Clone, Copy)]
enum OptionsMenuOption {
    WorkerCount,
    DownloadDirectory,
    ToggleSizeWarning,
    ToggleSkipExisting,
    ToggleVerbose,
    Back,
}

impl OptionsMenuOption {
    fn variants() -> &'static [OptionsMenuOption] {
        &[
            OptionsMenuOption::WorkerCount,
            OptionsMenuOption::DownloadDirectory,
            OptionsMenuOption::ToggleSizeWarning,
            OptionsMenuOption::ToggleSkipExisting,
            OptionsMenuOption::ToggleVerbose,
            OptionsMenuOption::Back,
        ]
    }

    fn display_name(&self) -> &'static str {
        match self {
            OptionsMenuOption::WorkerCount => "Download workers",
            OptionsMenuOption::DownloadDirectory => "Download directory",
            OptionsMenuOption::ToggleSizeWarning => "Large file warning",
            OptionsMenuOption::ToggleSkipExisting => "Skip files already on disk",
            OptionsMenuOption::ToggleVerbose => "Verbose logging",
            OptionsMenuOption::Back => "Back to main menu",
        }
    }
}

/// A program class that handles the flow of the downloader user experience and steps of execution.
pub(crate) struct Program {
    config: Config,
    theme: ColorfulTheme,
    runtime: Runtime,
}

impl Program {
    /// Creates a new instance of the program.
    pub(crate) fn new(config: Config) -> Result<Self, Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;

        Ok(Program {
            config,
            theme: ColorfulTheme::default(),
            runtime,
        })
    }

    /// Runs the downloader program.
    pub(crate) fn run(mut self) -> Result<(), Error> {
        Term::stdout().set_title(NAME);
        trace!("Starting {}...", NAME);
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Program Authors: {}", AUTHORS);
        if let Ok(working_dir) = current_dir() {
            trace!("Program Working Directory: {}", working_dir.display());
        }

        loop {
            match self.show_main_menu()? {
                MainMenuOption::DownloadProfiles => self.download_profiles()?,
                MainMenuOption::ImportLinks => self.import_links()?,
                MainMenuOption::Options => self.edit_options()?,
                MainMenuOption::Exit => {
                    info!("Exiting at user request...");
                    break;
                }
            }
        }

        Ok(())
    }

    fn show_main_menu(&self) -> Result<MainMenuOption, Error> {
        let options = MainMenuOption::variants();
        let option_names: Vec<&str> = options.iter().map(|option| option.display_name()).collect();

        println!(
            "\n{}",
            console::style(format!("{NAME} v{VERSION}")).cyan().bold()
        );
        let selection = Select::with_theme(&self.theme)
            .with_prompt("What would you like to do?")
            .items(&option_names)
            .default(0)
            .interact()?;

        Ok(options[selection])
    }

    fn download_profiles(&mut self) -> Result<(), Error> {
        self.ensure_credentials()?;

        let handles: String = Input::with_theme(&self.theme)
            .with_prompt("Profile handles (space separated)")
            .interact_text()?;
        let profiles: Vec<String> = handles
            .split_whitespace()
            .map(|handle| handle.trim_start_matches("/u/").trim_start_matches("u/"))
            .filter(|handle| !handle.is_empty())
            .map(str::to_string)
            .collect();

        if profiles.is_empty() {
            warn!("No profile handles were given, returning to the menu.");
            return Ok(());
        }

        self.run_session(SessionRequest::Profiles(profiles))
    }

    fn import_links(&mut self) -> Result<(), Error> {
        let options = ImportSourceOption::variants();
        let option_names: Vec<&str> = options.iter().map(|option| option.display_name()).collect();
        let selection = Select::with_theme(&self.theme)
            .with_prompt("Where are the links coming from?")
            .items(&option_names)
            .default(0)
            .interact()?;

        let text = match options[selection] {
            ImportSourceOption::PasteText => {
                println!("Paste links or handles, one per line. An empty line finishes.");
                let term = Term::stdout();
                let mut text = String::new();
                loop {
                    let line = term.read_line()?;
                    if line.trim().is_empty() {
                        break;
                    }
                    text.push_str(&line);
                    text.push('\n');
                }
                text
            }
            ImportSourceOption::ReadFile => {
                let path: String = Input::with_theme(&self.theme)
                    .with_prompt("Path to the link file")
                    .interact_text()?;
                match fs::read_to_string(path.trim()) {
                    Ok(text) => text,
                    Err(err) => {
                        error!("Unable to read \"{}\": {}", path.trim(), err);
                        return Ok(());
                    }
                }
            }
            ImportSourceOption::Back => return Ok(()),
        };

        if text.trim().is_empty() {
            warn!("No links were given, returning to the menu.");
            return Ok(());
        }

        // Credentials are only needed when a token points at the feed API.
        let needs_feed = text.split_whitespace().any(|token| {
            matches!(
                parse_import_line(token),
                Some(ImportEntry::Profile(_) | ImportEntry::RedditPost(_))
            )
        });
        if needs_feed {
            self.ensure_credentials()?;
        }

        self.run_session(SessionRequest::LinkText(text))
    }

    fn edit_options(&mut self) -> Result<(), Error> {
        loop {
            let options = OptionsMenuOption::variants();
            let option_names: Vec<&str> =
                options.iter().map(|option| option.display_name()).collect();

            println!("\n{}", console::style("Options").cyan().bold());
            let selection = Select::with_theme(&self.theme)
                .items(&option_names)
                .default(0)
                .interact()?;

            match options[selection] {
                OptionsMenuOption::WorkerCount => {
                    let current = self.config.worker_count();
                    let count: usize = Input::with_theme(&self.theme)
                        .with_prompt("Number of download workers")
                        .default(current)
                        .interact()
                        .unwrap_or(current);
                    self.config.set_worker_count(count.clamp(1, 16));
                    info!("Worker count set to: {}", self.config.worker_count());
                }
                OptionsMenuOption::DownloadDirectory => {
                    let directory: String = Input::with_theme(&self.theme)
                        .with_prompt("Download directory")
                        .default(self.config.download_directory().to_string())
                        .interact_text()?;
                    self.config.set_download_directory(directory.trim().to_string());
                }
                OptionsMenuOption::ToggleSizeWarning => {
                    let enabled = Confirm::with_theme(&self.theme)
                        .with_prompt("Warn before downloading very large files?")
                        .default(self.config.size_warning())
                        .interact()
                        .unwrap_or(self.config.size_warning());
                    self.config.set_size_warning(enabled);
                }
                OptionsMenuOption::ToggleSkipExisting => {
                    let enabled = Confirm::with_theme(&self.theme)
                        .with_prompt("Skip downloads that already exist on disk?")
                        .default(self.config.skip_existing())
                        .interact()
                        .unwrap_or(self.config.skip_existing());
                    self.config.set_skip_existing(enabled);
                }
                OptionsMenuOption::ToggleVerbose => {
                    let enabled = Confirm::with_theme(&self.theme)
                        .with_prompt("Enable verbose logging?")
                        .default(self.config.verbose())
                        .interact()
                        .unwrap_or(self.config.verbose());
                    self.config.set_verbose(enabled);
                    info!("Verbose logging takes effect on the next launch.");
                }
                OptionsMenuOption::Back => {
                    match self.config.save() {
                        Ok(()) => info!("Options saved!"),
                        Err(err) => error!("Unable to save the config: {}", err),
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    /// Prompts for feed API credentials when the config has none yet.
    fn ensure_credentials(&mut self) -> Result<(), Error> {
        if self.config.has_credentials() {
            return Ok(());
        }

        println!("Scanning profiles needs read-only feed API access.");
        println!("Create a \"script\" application in your account settings and enter its keys.");

        let client_id: String = Input::with_theme(&self.theme)
            .with_prompt("Application client id")
            .interact_text()?;
        let client_secret: String = Input::with_theme(&self.theme)
            .with_prompt("Application client secret")
            .interact_text()?;

        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            emergency_exit("Feed credentials are required to scan profiles.");
        }

        self.config
            .set_credentials(client_id.trim().to_string(), client_secret.trim().to_string());
        self.config.save()?;
        trace!("Credentials stored...");

        Ok(())
    }

    /// Builds a fresh session for the request and blocks until it finishes.
    fn run_session(&mut self, request: SessionRequest) -> Result<(), Error> {
        let observer = Arc::new(ProgressReporter::new());
        let mut controller = match SessionController::new(self.config.clone(), observer) {
            Ok(controller) => controller,
            Err(err) => emergency_exit(&err.to_string()),
        };

        match self.runtime.block_on(controller.run(request)) {
            Ok(_summary) => Ok(()),
            Err(SessionError::Credentials) => {
                emergency_exit("The feed rejected the configured credentials.")
            }
            Err(err) => emergency_exit(&err.to_string()),
        }
    }
}
