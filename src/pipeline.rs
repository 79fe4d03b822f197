//! Runs one platform's import from mailbox to record sink.

use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt::{self, Display, Formatter},
    path::PathBuf,
};

use strum::IntoEnumIterator;
use thiserror::Error;

use crate::{
    archive::{self, ExtractionError},
    attachment::{self, download::Downloader, BillError, CollectError},
    config::{Config, ConfigError, Directories, PlatformOptions},
    email::{
        login::SessionGenerator,
        session::{FetchError, ImapMailbox},
        Mailbox,
    },
    normalize::{self, DataError, RecordNormalizer},
    notion::{self, RecordSink},
    platform::{Platform, PlatformAdapter},
    secret::{self, PlatformSecret, SecretError},
    stage::{self, StageError},
};

type BoxedError = Box<dyn StdError + Send + Sync>;

/// Everything that can stop a platform's import. Each message says what the user has to do about
/// it where there is something to do.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("could not log in to the mail server: {0}")]
    Authentication(FetchError),
    #[error("mailbox error: {0}")]
    Fetch(BoxedError),
    #[error("{0}")]
    PasswordNotFound(BoxedError),
    #[error("{0}")]
    AttachmentNotFound(BoxedError),
    #[error("{0}")]
    ExportExpired(CollectError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("file processing failed: {0}")]
    FileProcessing(BoxedError),
    #[error("data processing failed: {0}")]
    DataProcessing(#[from] DataError),
    #[error("export failed: {0}")]
    Export(#[from] notion::Error),
}

impl From<FetchError> for Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::AuthenticationFailed(_) => Error::Authentication(err),
            _ => Error::Fetch(Box::new(err)),
        }
    }
}

impl<E: StdError + Send + Sync + 'static> From<SecretError<E>> for Error {
    fn from(err: SecretError<E>) -> Self {
        match err {
            SecretError::Mailbox(inner) => Error::Fetch(Box::new(inner)),
            SecretError::NotFound { .. } => Error::PasswordNotFound(Box::new(err)),
        }
    }
}

impl<E: StdError + Send + Sync + 'static> From<BillError<E>> for Error {
    fn from(err: BillError<E>) -> Self {
        match err {
            BillError::Mailbox(inner) => Error::Fetch(Box::new(inner)),
            BillError::NotFound { .. } | BillError::Empty { .. } => {
                Error::AttachmentNotFound(Box::new(err))
            }
            BillError::Collect(inner) => inner.into(),
        }
    }
}

impl From<CollectError> for Error {
    fn from(err: CollectError) -> Self {
        match err {
            CollectError::ExportExpired { .. } => Error::ExportExpired(err),
            CollectError::Download(_) | CollectError::BadStatus { .. } => {
                Error::Fetch(Box::new(err))
            }
            CollectError::PartDecodeFailed(..) | CollectError::WriteFailed(..) => {
                Error::FileProcessing(Box::new(err))
            }
        }
    }
}

impl From<StageError> for Error {
    fn from(err: StageError) -> Self {
        Error::FileProcessing(Box::new(err))
    }
}

/// What a successful import produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Imported {
    pub staged: PathBuf,
    pub records: usize,
    pub exported: usize,
    pub failed: usize,
}

pub type Outcome = Result<Imported, Error>;

/// The result of importing one platform.
#[derive(Debug)]
pub struct ImportResult {
    platform: Platform,
    outcome: Outcome,
}

impl ImportResult {
    #[must_use]
    pub fn new(platform: Platform, outcome: Outcome) -> Self {
        Self { platform, outcome }
    }

    #[must_use]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    #[must_use]
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

impl Display for ImportResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Ok(imported) if imported.failed > 0 => write!(
                f,
                "✓ {}: imported {} records ({} failed to export)",
                self.platform, imported.exported, imported.failed
            ),
            Ok(imported) => write!(
                f,
                "✓ {}: imported {} records",
                self.platform, imported.exported
            ),
            Err(err) => write!(f, "✗ {}: {err}", self.platform),
        }
    }
}

/// A `Pipeline` holds everything shared between platform imports.
pub struct Pipeline<D> {
    directories: Directories,
    platform_options: BTreeMap<String, PlatformOptions>,
    downloader: D,
}

impl<D: Downloader + Sync> Pipeline<D> {
    #[must_use]
    pub fn new(
        directories: Directories,
        platform_options: BTreeMap<String, PlatformOptions>,
        downloader: D,
    ) -> Self {
        Self {
            directories,
            platform_options,
            downloader,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config, downloader: D) -> Self {
        let platform_options = Platform::iter()
            .map(|platform| {
                let id = platform.adapter().id().to_string();
                let options = config.platform_options(&id);
                (id, options)
            })
            .collect();

        Self::new(config.directories().clone(), platform_options, downloader)
    }

    /// Import one platform over a fresh IMAP session. The session is logged out as soon as the
    /// mailbox is no longer needed, whether or not retrieval succeeded.
    pub async fn import<G, S>(
        &self,
        session_generator: &G,
        platform: Platform,
        sink: &mut S,
    ) -> ImportResult
    where
        G: SessionGenerator + Sync,
        S: RecordSink + Send,
    {
        info!("Importing {platform}");
        let adapter = platform.adapter();
        let outcome = self
            .import_with_session(session_generator, adapter.as_ref(), sink)
            .await;

        ImportResult::new(platform, outcome)
    }

    async fn import_with_session<G, S>(
        &self,
        session_generator: &G,
        adapter: &dyn PlatformAdapter,
        sink: &mut S,
    ) -> Outcome
    where
        G: SessionGenerator + Sync,
        S: RecordSink + Send,
    {
        self.directories.ensure()?;

        let mut mailbox = ImapMailbox::open(session_generator).await?;
        let retrieved = self.retrieve(&mut mailbox, adapter).await;
        mailbox.logout().await;

        self.process(adapter, &retrieved?, sink).await
    }

    /// Run the whole import against an already open mailbox. The caller remains responsible for
    /// releasing it.
    ///
    /// # Errors
    /// Returns the [`Error`] of whichever step failed first.
    pub async fn run<M, S>(
        &self,
        mailbox: &mut M,
        adapter: &dyn PlatformAdapter,
        sink: &mut S,
    ) -> Outcome
    where
        M: Mailbox + Send,
        S: RecordSink + Send,
    {
        self.directories.ensure()?;

        let secret = self.retrieve(mailbox, adapter).await?;
        self.process(adapter, &secret, sink).await
    }

    /// Find the password and save the bill email's files. This is all the mailbox is needed for.
    async fn retrieve<M: Mailbox + Send>(
        &self,
        mailbox: &mut M,
        adapter: &dyn PlatformAdapter,
    ) -> Result<PlatformSecret, Error> {
        let secret = secret::find_secret(mailbox, adapter).await?;
        let saved = attachment::collect_from_mailbox(
            mailbox,
            adapter,
            self.directories.attachments(),
            &self.downloader,
        )
        .await?;
        debug!("Saved {} files for {}: {saved:?}", saved.len(), adapter.id());

        Ok(secret)
    }

    async fn process<S: RecordSink + Send>(
        &self,
        adapter: &dyn PlatformAdapter,
        secret: &PlatformSecret,
        sink: &mut S,
    ) -> Outcome {
        let archive = archive::latest_archive(self.directories.attachments(), adapter)?;
        let extracted = archive::extract(&archive, secret.value(), self.directories.archives())?;
        if !extracted.skipped.is_empty() {
            info!(
                "{} needed the {} strategy after: {}",
                archive.display(),
                extracted.strategy,
                extracted.skipped.join("; ")
            );
        }

        let staged = stage::stage(
            self.directories.archives(),
            self.directories.staging(),
            adapter,
        )?;

        let rows = normalize::read_bill_table(&staged, adapter)?;
        let records = self.normalizer_for(adapter).normalize(rows, adapter)?;
        info!("Normalized {} {} records", records.len(), adapter.id());

        let summary = sink.export(&records).await?;

        Ok(Imported {
            staged,
            records: records.len(),
            exported: summary.exported,
            failed: summary.failed,
        })
    }

    fn normalizer_for(&self, adapter: &dyn PlatformAdapter) -> RecordNormalizer {
        self.platform_options
            .get(adapter.id())
            .map(RecordNormalizer::from_options)
            .unwrap_or_default()
    }
}
