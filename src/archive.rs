//! Finds the newest bill archive for a platform and unpacks it with the mailed password.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use regex::Regex;
use strum::IntoEnumIterator;
use thiserror::Error;

use crate::platform::{PlatformAdapter, ARCHIVE_EXTENSION};
use strategy::AttemptError;
pub use strategy::Strategy;

mod strategy;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("failed to list {0}: {1}")]
    ListFailed(PathBuf, io::Error),
    #[error("no {platform} bill archive found in {}; its name must start with '{prefix}' and end with '{ARCHIVE_EXTENSION}'", .dir.display())]
    NoArchive {
        platform: &'static str,
        prefix: &'static str,
        dir: PathBuf,
    },
    #[error("failed to read archive {0}: {1}")]
    ReadFailed(PathBuf, io::Error),
    #[error("could not extract {}{} ({})", .path.display(), failure_hint(.password_rejected), .diagnostics.join("; "))]
    AllStrategiesFailed {
        path: PathBuf,
        diagnostics: Vec<String>,
        /// Whether any strategy got as far as trying the password and had it rejected.
        password_rejected: bool,
    },
    #[error("failed to move extracted files into {0}: {1}")]
    PlaceFailed(PathBuf, io::Error),
}

fn failure_hint(password_rejected: &bool) -> &'static str {
    if *password_rejected {
        "; the password may be wrong"
    } else {
        "; it does not look like a readable zip archive"
    }
}

/// The result of a successful extraction.
#[derive(Debug)]
pub struct Extracted {
    /// The strategy that unpacked the archive.
    pub strategy: Strategy,
    pub files: Vec<PathBuf>,
    /// Why each earlier strategy was passed over, as `strategy: reason`.
    pub skipped: Vec<String>,
}

/// List the archives in `dir` (not recursively) that belong to the given platform, in name order.
///
/// # Errors
/// Returns [`ExtractionError::ListFailed`] if the directory cannot be read.
pub fn search(dir: &Path, adapter: &dyn PlatformAdapter) -> Result<Vec<String>, ExtractionError> {
    let entries =
        fs::read_dir(dir).map_err(|err| ExtractionError::ListFailed(dir.to_path_buf(), err))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ExtractionError::ListFailed(dir.to_path_buf(), err))?;
        let is_file = entry.file_type().map(|kind| kind.is_file()).unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_file
            && name.starts_with(adapter.bill_file_prefix())
            && name.ends_with(ARCHIVE_EXTENSION)
        {
            names.push(name);
        }
    }

    names.sort();
    Ok(names)
}

/// Pick the most recently modified of `names` (which live in `dir`). Ties go to whichever comes
/// first. A file whose modification time can't be read falls back to the last date in its name.
#[must_use]
pub fn select_latest(dir: &Path, names: &[String]) -> Option<String> {
    let mut latest: Option<(&String, Option<DateTime<Utc>>)> = None;
    for name in names {
        let timestamp = timestamp_of(&dir.join(name));
        match latest {
            Some((_, latest_timestamp)) if timestamp <= latest_timestamp => {}
            _ => latest = Some((name, timestamp)),
        }
    }

    latest.map(|(name, _)| name.clone())
}

/// Find the newest archive for the platform in `dir`.
///
/// # Errors
/// Returns [`ExtractionError::NoArchive`] if there is none.
pub fn latest_archive(
    dir: &Path,
    adapter: &dyn PlatformAdapter,
) -> Result<PathBuf, ExtractionError> {
    let names = search(dir, adapter)?;
    debug!("Found {} candidate {} archives: {names:?}", names.len(), adapter.id());

    select_latest(dir, &names)
        .map(|name| dir.join(name))
        .ok_or_else(|| ExtractionError::NoArchive {
            platform: adapter.id(),
            prefix: adapter.bill_file_prefix(),
            dir: dir.to_path_buf(),
        })
}

/// Extract every member of the archive into `target_dir`, trying each decryption strategy in turn.
/// Nothing is written to `target_dir` unless a strategy succeeds.
///
/// # Errors
/// Returns [`ExtractionError::AllStrategiesFailed`] with each strategy's reason if none succeed.
pub fn extract(path: &Path, password: &str, target_dir: &Path) -> Result<Extracted, ExtractionError> {
    let bytes =
        fs::read(path).map_err(|err| ExtractionError::ReadFailed(path.to_path_buf(), err))?;

    let mut diagnostics = Vec::new();
    let mut password_rejected = false;
    for strategy in Strategy::iter() {
        let staging = tempfile::Builder::new()
            .prefix(".extract")
            .tempdir_in(target_dir)
            .map_err(|err| ExtractionError::PlaceFailed(target_dir.to_path_buf(), err))?;

        match strategy.attempt(&bytes, password, staging.path()) {
            Ok(members) => {
                info!("Extracted {} with the {strategy} strategy", path.display());
                let files = place(staging.path(), &members, target_dir)
                    .map_err(|err| ExtractionError::PlaceFailed(target_dir.to_path_buf(), err))?;

                return Ok(Extracted {
                    strategy,
                    files,
                    skipped: diagnostics,
                });
            }
            Err(reason) => {
                info!(
                    "The {strategy} strategy could not extract {}: {reason}",
                    path.display()
                );
                password_rejected |= matches!(reason, AttemptError::Decryption(_));
                diagnostics.push(format!("{strategy}: {reason}"));
            }
        }
    }

    Err(ExtractionError::AllStrategiesFailed {
        path: path.to_path_buf(),
        diagnostics,
        password_rejected,
    })
}

/// Move the extracted members out of the staging directory, replacing existing files.
fn place(staging: &Path, members: &[PathBuf], target_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut placed = Vec::with_capacity(members.len());
    for member in members {
        let destination = target_dir.join(member);
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        if destination.is_file() {
            fs::remove_file(&destination)?;
        }

        fs::rename(staging.join(member), &destination)?;
        placed.push(destination);
    }

    Ok(placed)
}

fn timestamp_of(path: &Path) -> Option<DateTime<Utc>> {
    match fs::metadata(path).and_then(|metadata| metadata.modified()) {
        Ok(modified) => Some(DateTime::<Utc>::from(modified)),
        Err(err) => {
            debug!(
                "No modification time for {}, using the date in its name: {err}",
                path.display()
            );
            path.file_name()
                .and_then(|name| date_in_name(&name.to_string_lossy()))
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|midnight| Utc.from_utc_datetime(&midnight))
        }
    }
}

/// The last `YYYYMMDD` group in a file name, which for bill exports is the end of the period.
fn date_in_name(name: &str) -> Option<NaiveDate> {
    // If this is malformed it's programmer error
    let date_regexp = Regex::new(r"\d{8}").expect("failed to create regex for dates");
    let last = date_regexp.find_iter(name).last()?;

    NaiveDate::parse_from_str(last.as_str(), "%Y%m%d").ok()
}
