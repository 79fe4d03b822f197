#![warn(clippy::all, clippy::pedantic)]

#[macro_use]
extern crate log;

use std::{
    path::{Path, PathBuf},
    process,
    str::FromStr,
};

use anyhow::Context;
use billmail::{
    attachment::download::HttpDownloader,
    notion::{Client as NotionClient, JsonLinesSink, RecordSink},
    Config, ConfigSessionGenerator, ImportResult, Pipeline, Platform,
};
use clap::Parser;
use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter};
use strum::IntoEnumIterator;
use tokio::runtime::Runtime;

/// Fetch password-protected payment bills from your mailbox and import them.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,

    /// Platform to import; may be given more than once. Defaults to every platform.
    #[arg(short, long = "platform", value_parser = Platform::from_str)]
    platforms: Vec<Platform>,

    /// Print normalized records as JSON lines instead of exporting them to Notion
    #[arg(long)]
    dry_run: bool,

    /// Log at debug level regardless of the configured level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    let error_prefix = "Error".red();

    let config = Config::load(&args.config).unwrap_or_else(|err| {
        eprintln!("{error_prefix} {err}");
        process::exit(2);
    });

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        config.log_level()
    };
    if let Err(err) = setup_logger(level, config.log_file()) {
        eprintln!("{error_prefix} failed to set up logging: {err:#}");
        process::exit(2);
    }

    let platforms = if args.platforms.is_empty() {
        Platform::iter().collect()
    } else {
        args.platforms
    };

    let results = Runtime::new()
        .context("failed to create runtime")
        .and_then(|runtime| runtime.block_on(import_all(&config, &platforms, args.dry_run)));

    let results = results.unwrap_or_else(|err| {
        eprintln!("{error_prefix} {err:#}");
        process::exit(2);
    });

    let mut any_failed = false;
    for result in &results {
        if result.is_success() {
            println!("{}", result.to_string().green());
        } else {
            any_failed = true;
            println!("{}", result.to_string().red());
        }
    }

    if any_failed {
        process::exit(1);
    }
}

/// Import each platform in turn. A failing platform never stops the others.
async fn import_all(
    config: &Config,
    platforms: &[Platform],
    dry_run: bool,
) -> anyhow::Result<Vec<ImportResult>> {
    let downloader = HttpDownloader::new().context("failed to set up downloader")?;
    let pipeline = Pipeline::from_config(config, downloader);
    let session_generator = ConfigSessionGenerator::new(config.imap().clone());

    let mut sink: Box<dyn RecordSink + Send> = match config.notion() {
        Some(notion) if !dry_run => Box::new(NotionClient::from_config(notion)),
        Some(_) => Box::new(JsonLinesSink::stdout()),
        None => {
            info!("No notion section configured; writing records to stdout");
            Box::new(JsonLinesSink::stdout())
        }
    };

    let mut results = Vec::with_capacity(platforms.len());
    for &platform in platforms {
        let result = pipeline.import(&session_generator, platform, &mut sink).await;
        if let Err(err) = result.outcome() {
            error!("Import of {platform} failed: {err}");
        }

        results.push(result);
    }

    Ok(results)
}

fn setup_logger(level: LevelFilter, log_file: Option<&Path>) -> anyhow::Result<()> {
    let stderr = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {message}",
                timestamp(),
                colored_level(record.level())
            ));
        })
        .chain(std::io::stderr());

    let mut dispatch = fern::Dispatch::new()
        .level(level)
        // The IMAP and HTTP stacks are very chatty at debug level
        .level_for("async_imap", LevelFilter::Warn)
        .level_for("reqwest", LevelFilter::Warn)
        .chain(stderr);

    if let Some(path) = log_file {
        let file = fern::log_file(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    out.finish(format_args!(
                        "{} [{}] [{}] {message}",
                        timestamp(),
                        record.level(),
                        record.target()
                    ));
                })
                .chain(file),
        );
    }

    dispatch.apply()?;
    Ok(())
}

fn timestamp() -> impl std::fmt::Display {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
}

fn colored_level(level: Level) -> ColoredString {
    match level {
        Level::Error => "ERROR".red(),
        Level::Warn => "WARN".yellow(),
        Level::Info => "INFO".green(),
        Level::Debug => "DEBUG".blue(),
        Level::Trace => "TRACE".normal(),
    }
}
