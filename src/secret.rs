//! Finds the archive password the user mailed to themselves.

use regex::Regex;
use thiserror::Error;

use crate::{
    email::{self, Mailbox},
    platform::PlatformAdapter,
};

/// Passwords are always this many digits long.
const SECRET_LENGTH: usize = 6;

#[derive(Error, Debug)]
pub enum SecretError<E: std::error::Error> {
    #[error("mailbox failure while searching for the password email: {0}")]
    Mailbox(E),
    #[error("no password email found for {platform}; send yourself an email with the subject '{platform}解压密码' followed by the six digit password")]
    NotFound { platform: &'static str },
}

/// The password for one platform's archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlatformSecret {
    platform: &'static str,
    value: String,
}

impl PlatformSecret {
    #[must_use]
    pub fn platform(&self) -> &'static str {
        self.platform
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Scan the mailbox newest-first for a self-sent password email, stopping at the first one found.
/// Older password emails are never considered once a match is found, even if they are "better".
///
/// # Errors
/// Returns [`SecretError::NotFound`] if no message qualifies, or [`SecretError::Mailbox`] if the
/// mailbox could not be listed or a message could not be fetched.
pub async fn find_secret<M: Mailbox + Send>(
    mailbox: &mut M,
    adapter: &dyn PlatformAdapter,
) -> Result<PlatformSecret, SecretError<M::Error>> {
    let subject_regexp = subject_pattern(adapter);
    let own_address = mailbox.address().to_string();

    for uid in email::list_newest_first(mailbox)
        .await
        .map_err(SecretError::Mailbox)?
    {
        let message = mailbox.fetch(uid).await.map_err(SecretError::Mailbox)?;
        let decoded = message.decode();
        debug!(
            "Checking message {uid} from '{}' with subject '{}'",
            decoded.sender(),
            decoded.subject()
        );

        let secret = secret_from(
            &subject_regexp,
            &own_address,
            decoded.sender(),
            decoded.subject(),
        );
        if let Some(secret) = secret {
            info!("Found {} password in message {uid}", adapter.id());
            return Ok(PlatformSecret {
                platform: adapter.id(),
                value: secret,
            });
        }
    }

    Err(SecretError::NotFound {
        platform: adapter.id(),
    })
}

fn subject_pattern(adapter: &dyn PlatformAdapter) -> Regex {
    let pattern = format!(
        "^{}解压密码[0-9]{{{SECRET_LENGTH}}}$",
        regex::escape(adapter.id())
    );

    // The pattern only varies by an escaped platform id, so failing here is programmer error
    Regex::new(&pattern).expect("failed to create regex for password subject")
}

fn secret_from(
    subject_regexp: &Regex,
    own_address: &str,
    sender: &str,
    subject: &str,
) -> Option<String> {
    if sender.is_empty() || sender != own_address || !subject_regexp.is_match(subject) {
        return None;
    }

    let digit_start = subject.len() - SECRET_LENGTH;
    Some(subject[digit_start..].to_string())
}
