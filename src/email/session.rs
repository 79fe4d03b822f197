//! An IMAP-backed [`Mailbox`].

use async_imap::error::Error as IMAPError;
use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;

use super::{login::SessionGenerator, message::Message, Mailbox, Uid};
use crate::IMAPSession;

/// Indicates an error that occured while talking to the mail server
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to log in to the mail server: {0}")]
    AuthenticationFailed(IMAPError),
    #[error("failed to select INBOX: {0}")]
    SelectFailed(IMAPError),
    #[error("failed to search the inbox: {0}")]
    SearchFailed(IMAPError),
    #[error("failed to fetch message: {0}")]
    MessageFetchFailed(IMAPError),
    #[error("the given uid ({0}) yielded no results")]
    MessageNotFound(Uid),
    #[error("a message was fetched for uid {0}, but it had no body")]
    NoBody(Uid),
}

/// A live, logged in IMAP session with INBOX selected. It must be released with
/// [`ImapMailbox::logout`] once the caller is done with it.
pub struct ImapMailbox {
    session: IMAPSession,
    address: String,
}

impl ImapMailbox {
    /// Log in and select the inbox.
    ///
    /// # Errors
    /// Returns [`FetchError::AuthenticationFailed`] if a session could not be established, or
    /// [`FetchError::SelectFailed`] if the inbox could not be selected. In the latter case the
    /// session is logged out before returning.
    pub async fn open<G: SessionGenerator + Sync>(session_generator: &G) -> Result<Self, FetchError> {
        let mut session = session_generator
            .new_session()
            .await
            .map_err(FetchError::AuthenticationFailed)?;

        match session.select("INBOX").await {
            Ok(mailbox) => {
                debug!("Selected INBOX with {} messages", mailbox.exists);
                Ok(Self {
                    session,
                    address: session_generator.username().to_string(),
                })
            }
            Err(err) => {
                best_effort_logout(&mut session).await;
                Err(FetchError::SelectFailed(err))
            }
        }
    }

    /// Release the connection. Failures are logged, as there is nothing more to do with the
    /// session at this point.
    pub async fn logout(mut self) {
        best_effort_logout(&mut self.session).await;
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    type Error = FetchError;

    fn address(&self) -> &str {
        &self.address
    }

    async fn list_all(&mut self) -> Result<Vec<Uid>, Self::Error> {
        let uid_set = self
            .session
            .uid_search("ALL")
            .await
            .map_err(FetchError::SearchFailed)?;

        let mut uids = uid_set.into_iter().map(Uid).collect::<Vec<_>>();
        uids.sort_unstable();
        info!("Found {} emails in inbox", uids.len());

        Ok(uids)
    }

    async fn fetch(&mut self, uid: Uid) -> Result<Message, Self::Error> {
        // PEEK, so that scanning for bills does not mark everything as read
        let mut message_iter = self
            .session
            .uid_fetch(uid.to_string(), "BODY.PEEK[]")
            .await
            .map_err(FetchError::MessageFetchFailed)?;

        let mut found = false;
        let mut body = None;
        while let Some(fetch_res) = message_iter.next().await {
            let fetch = fetch_res.map_err(FetchError::MessageFetchFailed)?;
            // Servers may send unsolicited FETCH responses for other messages (e.g. flag updates)
            if fetch.uid.map_or(true, |fetched_uid| fetched_uid == uid.value()) {
                found = true;
                if let Some(raw) = fetch.body() {
                    body = Some(raw.to_vec());
                }
            }
        }

        match (found, body) {
            (_, Some(raw)) => Ok(Message::new(raw)),
            (true, None) => Err(FetchError::NoBody(uid)),
            (false, None) => Err(FetchError::MessageNotFound(uid)),
        }
    }
}

async fn best_effort_logout(session: &mut IMAPSession) {
    debug!("Logging out of IMAP session");

    let logout_res = session.logout().await;
    if let Err(err) = logout_res {
        error!("Failed to best-effort tear down session: {err}");
    }
}
