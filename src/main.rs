#[macro_use]
extern crate log;

use std::env::consts::{ARCH, EXE_EXTENSION, EXE_SUFFIX, FAMILY, OS};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::process;

use anyhow::Error;
use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, Config as LogConfig, ConfigBuilder, TermLogger, TerminalMode,
    WriteLogger,
};

use crate::diva::io::Config;
use crate::program::Program;

mod diva;
mod program;

/// Name of the log file written next to the executable.
const LOG_NAME: &str = "diva.log";

/// A buffered log file writer that flushes periodically so a crash loses
/// little of the trail.
struct LogFileWriter {
    inner: BufWriter<File>,
    lines_since_flush: usize,
}

impl LogFileWriter {
    fn new() -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(LOG_NAME)?;
        Ok(LogFileWriter {
            inner: BufWriter::with_capacity(64 * 1024, file),
            lines_since_flush: 0,
        })
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.inner.write(buf)?;
        self.lines_since_flush += buf.iter().filter(|&&byte| byte == b'\n').count();
        if self.lines_since_flush >= 50 {
            self.inner.flush()?;
            self.lines_since_flush = 0;
        }
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Drop for LogFileWriter {
    fn drop(&mut self) {
        let _ = self.inner.flush();
    }
}

fn main() -> Result<(), Error> {
    // The config carries the verbose flag, so it loads before the logger.
    let config = match Config::load_or_create() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Unable to load the config file: {err}");
            process::exit(0x00FF);
        }
    };

    initialize_logger(config.verbose());
    log_system_information();

    Program::new(config)?.run()
}

/// Initializes the logger with preset filtering and a file trail.
fn initialize_logger(verbose: bool) {
    let term_level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut file_config = ConfigBuilder::new();
    file_config.add_filter_allow_str("diva");

    let file_writer = match LogFileWriter::new() {
        Ok(writer) => writer,
        Err(err) => {
            eprintln!(
                "Failed to open \"{}\": {}. Logging will only output to terminal.",
                LOG_NAME, err
            );
            let _ = TermLogger::init(
                term_level,
                LogConfig::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            );
            return;
        }
    };

    if let Err(err) = CombinedLogger::init(vec![
        TermLogger::new(
            term_level,
            LogConfig::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::max(), file_config.build(), file_writer),
    ]) {
        eprintln!(
            "Failed to initialize combined logger: {}. Falling back to terminal-only logging.",
            err
        );
        let _ = TermLogger::init(
            term_level,
            LogConfig::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        );
    }
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("EXE_EXTENSION:  \"{}\"", EXE_EXTENSION);
    trace!("EXE_SUFFIX:     \"{}\"", EXE_SUFFIX);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
}
