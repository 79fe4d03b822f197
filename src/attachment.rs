//! Saves a platform's bill from its notification email, either as a direct attachment or by
//! following the download link in the HTML body.

use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use itertools::Itertools;
use mailparse::{MailParseError, ParsedMail};
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

use crate::{
    email::{
        self,
        message::{decode_encoded_words, raw_header},
        Mailbox,
    },
    platform::PlatformAdapter,
};
use download::{DownloadError, Downloader};

pub mod download;

/// Bill emails are at most a couple of levels deep; anything past this is malformed.
const MAX_DEPTH: usize = 8;

const URL_PATTERN: &str =
    r"^http[s]?://(?:[a-zA-Z]|[0-9]|[$-_@.&+]|[!*\(\),]|(?:%[0-9a-fA-F][0-9a-fA-F]))+";

const FALLBACK_FILENAME: &str = "download";

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("failed to decode attachment '{0}': {1}")]
    PartDecodeFailed(String, MailParseError),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, io::Error),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("download of {url} returned HTTP status {status}")]
    BadStatus { url: Url, status: u16 },
    #[error("the {platform} export link has expired or reached its download limit (page says '{marker}'); export the bill again from {platform}")]
    ExportExpired {
        platform: &'static str,
        marker: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum BillError<E: std::error::Error> {
    #[error("mailbox failure while searching for the bill email: {0}")]
    Mailbox(E),
    #[error("no bill email from {sender} found for {platform}; request a bill export from {platform} first")]
    NotFound {
        platform: &'static str,
        sender: &'static str,
    },
    #[error("the newest bill email from {sender} carried no attachment or download link")]
    Empty { sender: &'static str },
    #[error(transparent)]
    Collect(CollectError),
}

/// Scan the mailbox newest-first for the platform's bill email and save everything it carries to
/// `target_dir`. Only the first message from the platform's notification address is used.
///
/// # Errors
/// Returns [`BillError::NotFound`] if no message comes from the platform, [`BillError::Empty`] if the
/// newest one yielded no files, and [`BillError::Collect`] if saving or downloading failed.
pub async fn collect_from_mailbox<M, D>(
    mailbox: &mut M,
    adapter: &dyn PlatformAdapter,
    target_dir: &Path,
    downloader: &D,
) -> Result<Vec<PathBuf>, BillError<M::Error>>
where
    M: Mailbox + Send,
    D: Downloader + Sync,
{
    for uid in email::list_newest_first(mailbox)
        .await
        .map_err(BillError::Mailbox)?
    {
        let message = mailbox.fetch(uid).await.map_err(BillError::Mailbox)?;
        let decoded = message.decode();
        if decoded.sender() != adapter.sender_address() {
            continue;
        }

        info!(
            "Processing {} bill email {uid} with subject '{}'",
            adapter.id(),
            decoded.subject()
        );

        let saved = match decoded.tree() {
            Some(tree) => collect(tree, adapter, target_dir, downloader)
                .await
                .map_err(BillError::Collect)?,
            None => Vec::new(),
        };

        if saved.is_empty() {
            return Err(BillError::Empty {
                sender: adapter.sender_address(),
            });
        }

        return Ok(saved);
    }

    Err(BillError::NotFound {
        platform: adapter.id(),
        sender: adapter.sender_address(),
    })
}

/// Save every attachment in the message tree to `target_dir`, and download every link in its HTML
/// parts there too. Returns the paths written, in the order they were written.
///
/// # Errors
/// Returns a [`CollectError`] on the first failure; later parts are not processed.
pub async fn collect<D: Downloader + Sync>(
    tree: &ParsedMail<'_>,
    adapter: &dyn PlatformAdapter,
    target_dir: &Path,
    downloader: &D,
) -> Result<Vec<PathBuf>, CollectError> {
    let mut saved = Vec::new();
    let mut html_bodies = Vec::new();
    walk(tree, 0, target_dir, &mut saved, &mut html_bodies)?;

    // Each link is followed at most once; WeChat Pay counts repeated downloads against a limit.
    let links = html_bodies
        .iter()
        .map(String::as_str)
        .flat_map(extract_links)
        .unique()
        .collect::<Vec<_>>();

    info!("Found {} links in HTML content", links.len());
    for link in links {
        let path = follow_link(&link, adapter, target_dir, downloader).await?;
        saved.push(path);
    }

    Ok(saved)
}

/// Walk the tree depth first, writing attachments as they are found and collecting HTML bodies for
/// link extraction.
fn walk(
    part: &ParsedMail<'_>,
    depth: usize,
    target_dir: &Path,
    saved: &mut Vec<PathBuf>,
    html_bodies: &mut Vec<String>,
) -> Result<(), CollectError> {
    if depth > MAX_DEPTH {
        warn!("Not descending into message parts nested deeper than {MAX_DEPTH} levels");
        return Ok(());
    }

    debug!("Processing part at depth {depth}: {}", part.ctype.mimetype);

    if let Some(part_name) = part_filename(part) {
        let filename = sanitize_filename(&part_name);
        let payload = part
            .get_body_raw()
            .map_err(|err| CollectError::PartDecodeFailed(filename.clone(), err))?;

        if payload.is_empty() {
            warn!("No payload found for attachment: {filename}");
        } else {
            saved.push(write_file(target_dir, &filename, &payload)?);
        }
    }

    if part.ctype.mimetype.eq_ignore_ascii_case("text/html") {
        match part.get_body() {
            Ok(body) => html_bodies.push(body),
            Err(err) => warn!("Skipping undecodable HTML part: {err}"),
        }
    }

    for subpart in &part.subparts {
        walk(subpart, depth + 1, target_dir, saved, html_bodies)?;
    }

    Ok(())
}

/// The part's filename, from `Content-Disposition` or else the `name` of its `Content-Type`.
/// The parameters are parsed from the raw headers so encoded-words reach the decoder intact.
fn part_filename(part: &ParsedMail<'_>) -> Option<String> {
    let from_disposition = raw_header(&part.headers, "Content-Disposition")
        .and_then(|raw| {
            mailparse::parse_content_disposition(&raw)
                .params
                .get("filename")
                .cloned()
        });
    let from_content_type = || {
        raw_header(&part.headers, "Content-Type")
            .and_then(|raw| mailparse::parse_content_type(&raw).params.get("name").cloned())
    };

    from_disposition
        .filter(|name| !name.trim().is_empty())
        .or_else(|| from_content_type().filter(|name| !name.trim().is_empty()))
        .map(|name| decode_encoded_words(&name))
}

fn extract_links(html: &str) -> Vec<Url> {
    // If these are malformed it's programmer error
    let anchor_selector = Selector::parse("a[href]").expect("failed to create selector for links");
    let url_regexp = Regex::new(URL_PATTERN).expect("failed to create regex for urls");

    let document = Html::parse_document(html);
    document
        .select(&anchor_selector)
        .filter_map(|anchor| anchor.value().attr("href"))
        .map(str::trim)
        .filter(|href| url_regexp.is_match(href))
        .filter_map(|href| match Url::parse(href) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("Skipping unparseable link {href}: {err}");
                None
            }
        })
        .collect()
}

async fn follow_link<D: Downloader + Sync>(
    url: &Url,
    adapter: &dyn PlatformAdapter,
    target_dir: &Path,
    downloader: &D,
) -> Result<PathBuf, CollectError> {
    info!("Downloading from URL: {url}");
    let download = downloader.get(url).await?;

    if download.status() != 200 {
        return Err(CollectError::BadStatus {
            url: url.clone(),
            status: download.status(),
        });
    }

    if let Some(marker) = adapter.expired_export_marker() {
        if String::from_utf8_lossy(download.body()).contains(marker) {
            return Err(CollectError::ExportExpired {
                platform: adapter.id(),
                marker,
            });
        }
    }

    let filename = download
        .content_disposition()
        .and_then(filename_from_disposition)
        .unwrap_or_else(|| filename_from_url(url));

    write_file(target_dir, &sanitize_filename(&filename), download.body())
}

fn write_file(target_dir: &Path, filename: &str, contents: &[u8]) -> Result<PathBuf, CollectError> {
    let path = target_dir.join(filename);
    fs::write(&path, contents).map_err(|err| CollectError::WriteFailed(path.clone(), err))?;
    info!("Saved {}", path.display());

    Ok(path)
}

/// Pull a filename out of a `Content-Disposition` header, preferring the RFC 5987 form.
fn filename_from_disposition(disposition: &str) -> Option<String> {
    // If these are malformed it's programmer error
    let extended_regexp = Regex::new(r"(?i)filename\*\s*=\s*(?:[\w-]+'[^']*')?([^;]*)")
        .expect("failed to create regex for filename*");
    let plain_regexp =
        Regex::new(r"(?i)filename\s*=\s*([^;]*)").expect("failed to create regex for filename");

    let raw = extended_regexp
        .captures(disposition)
        .or_else(|| plain_regexp.captures(disposition))
        .and_then(|captures| captures.get(1))
        .map(|name| name.as_str().trim().trim_matches('"'))
        .filter(|name| !name.is_empty())?;

    Some(percent_decode(raw))
}

fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map_or_else(|| FALLBACK_FILENAME.to_string(), percent_decode)
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_string(), std::borrow::Cow::into_owned)
}

/// Remove characters that are illegal in file names on common filesystems.
fn sanitize_filename(filename: &str) -> String {
    let sanitized = filename
        .chars()
        .filter(|c| {
            !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|') && !c.is_control()
        })
        .collect::<String>();

    let trimmed = sanitized.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}
