use std::{
    fs::{self, File},
    io::{self, Cursor, Read, Seek},
    path::{Component, Path, PathBuf},
};

use strum::{Display, EnumIter};
use thiserror::Error;
use zip::{result::ZipError, ZipArchive};

/// How a single member of an archive is protected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Protection {
    None,
    Aes,
    ZipCrypto,
}

/// The ways an archive can be unpacked, in the order they are attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Strategy {
    /// Stored and deflated members with no encryption at all.
    Standard,
    /// WinZip AES encryption.
    Aes,
    /// The original PKWARE stream cipher.
    Legacy,
}

/// Why a strategy gave up on an archive.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub(super) enum AttemptError {
    #[error("{0}")]
    Corrupt(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("{0}")]
    Decryption(String),
    #[error("{0}")]
    Write(String),
}

impl Strategy {
    fn handles(self, protection: Protection) -> bool {
        match self {
            Strategy::Standard => protection == Protection::None,
            Strategy::Aes => matches!(protection, Protection::None | Protection::Aes),
            Strategy::Legacy => matches!(protection, Protection::None | Protection::ZipCrypto),
        }
    }

    /// Unpack every member into `staging`, returning their paths relative to it.
    pub(super) fn attempt(
        self,
        archive_bytes: &[u8],
        password: &str,
        staging: &Path,
    ) -> Result<Vec<PathBuf>, AttemptError> {
        let mut archive = ZipArchive::new(Cursor::new(archive_bytes))
            .map_err(|err| AttemptError::Corrupt(err.to_string()))?;
        let protections = scan_protections(&mut archive)?;
        if let Some(unhandled) = protections.iter().find(|&&protection| !self.handles(protection)) {
            return Err(AttemptError::Unsupported(format!(
                "archive has {unhandled:?} protected members"
            )));
        }

        let mut extracted = Vec::new();
        for (index, protection) in protections.into_iter().enumerate() {
            let encrypted = protection != Protection::None;
            let mut member = if encrypted {
                archive.by_index_decrypt(index, password.as_bytes())
            } else {
                archive.by_index(index)
            }
            .map_err(|err| member_error(encrypted, &format!("member {index}"), err.to_string()))?;

            let name = member_name(member.name_raw());
            let Some(relative_path) = confine(&name) else {
                warn!("Skipping archive member with no usable path: '{name}'");
                continue;
            };

            let destination = staging.join(&relative_path);
            let write_error = |err: io::Error| AttemptError::Write(format!("{name}: {err}"));
            if member.is_dir() {
                fs::create_dir_all(&destination).map_err(write_error)?;
                continue;
            }

            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(write_error)?;
            }
            let mut file = File::create(&destination).map_err(write_error)?;
            // A wrong legacy password is often only noticed here, when the checksum fails
            io::copy(&mut member, &mut file)
                .map_err(|err| member_error(encrypted, &name, err.to_string()))?;

            debug!("Extracted member '{name}'");
            extracted.push(relative_path);
        }

        Ok(extracted)
    }
}

/// Failing to read an encrypted member means the password was wrong; anything else is damage.
fn member_error(encrypted: bool, member: &str, reason: String) -> AttemptError {
    if encrypted {
        AttemptError::Decryption(format!("{member}: {reason}"))
    } else {
        AttemptError::Corrupt(format!("{member}: {reason}"))
    }
}

/// Read the protection of every member, in archive order.
pub(super) fn scan_protections<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<Vec<Protection>, AttemptError> {
    let corrupt =
        |index: usize, err: ZipError| AttemptError::Corrupt(format!("member {index}: {err}"));

    (0..archive.len())
        .map(|index| {
            let encrypted = archive
                .by_index_raw(index)
                .map_err(|err| corrupt(index, err))?
                .encrypted();
            if !encrypted {
                return Ok(Protection::None);
            }

            match archive.get_aes_verification_key_and_salt(index) {
                Ok(Some(_)) => Ok(Protection::Aes),
                Ok(None) => Ok(Protection::ZipCrypto),
                Err(err) => Err(corrupt(index, err)),
            }
        })
        .collect()
}

/// Member names carry no reliable charset flag; Chinese exports are usually GBK.
fn member_name(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(name) => name.to_string(),
        Err(_) => encoding_rs::GBK.decode(raw).0.into_owned(),
    }
}

/// Turn a member name into a relative path that cannot leave the extraction directory.
fn confine(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let path = Path::new(&normalized)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect::<PathBuf>();

    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}
