/// # formsplit
///
/// A streaming multipart/form-data decoder.
///
/// The library splits a `multipart/form-data` body into text fields and file
/// fragments while reading it chunk by chunk, so file contents never have to
/// fit in memory. The `run` function is the command-line entry point: it
/// decodes a body from a file or standard input into a directory.
pub mod cli;
pub mod config;
pub mod error;
pub mod form;
pub mod multipart;
pub mod part;
pub mod reader;
pub mod scanner;
pub mod stack;
pub mod upload;

use crate::cli::Cli;
use crate::config::Config;
use crate::error::Result;
use crate::multipart::PartClassifier;
use crate::reader::ReadSource;
use crate::upload::{DiskSink, format_bytes};
use clap::Parser;
use log::{error, info};
use std::fs::File;
use std::io::{self, BufReader, Read};

/// Initializes the logger, parses command-line arguments and splits the body.
///
/// Exits the process with status 1 on configuration or decoding errors.
pub fn run() {
    let cli = Cli::parse();

    // Load configuration with precedence: CLI > INI > Defaults
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    let log_level = if config.verbose {
        "debug"
    } else if config.detailed_logging {
        "info"
    } else {
        "warn"
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::debug!("Log level set to: {log_level}");

    if config.verbose {
        config.print_summary();
    }

    if let Err(e) = cli.validate() {
        error!("Configuration validation error: {e}");
        std::process::exit(1);
    }

    match split_to_disk(&config) {
        Ok(sink) => print_report(&sink),
        Err(e) => {
            error!("Decoding error: {e}");
            std::process::exit(1);
        }
    }
}

/// Decodes the configured input into `config.output_dir`
pub fn split_to_disk(config: &Config) -> Result<DiskSink> {
    let options = config.to_parser_options()?;
    let input: Box<dyn Read> = match config.input {
        Some(ref path) => Box::new(BufReader::new(File::open(path)?)),
        None => Box::new(io::stdin().lock()),
    };
    let sink = DiskSink::new(&config.output_dir, config.overwrite)?;

    let mut classifier = PartClassifier::new(ReadSource::new(input), sink, options)?;
    classifier.run_blocking()?;

    info!(
        "Decoded {} parts ({} read)",
        classifier.parts_seen(),
        format_bytes(classifier.bytes_pulled())
    );
    Ok(classifier.into_handler())
}

fn print_report(sink: &DiskSink) {
    for field in sink.fields() {
        println!("{}={}", field.name(), field.text());
    }
    for file in sink.saved_files() {
        println!(
            "{} -> {} ({})",
            file.field_name,
            file.saved_path.display(),
            format_bytes(file.size)
        );
    }
}
