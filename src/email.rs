use std::{
    error::Error,
    fmt::{Display, Formatter},
};

use async_trait::async_trait;

pub mod login;
pub mod message;
pub mod session;

use message::Message;

/// The server-assigned, stable ID of a single message stored in the inbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(u32);

impl Uid {
    #[must_use]
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    /// Get the integral value of this UID
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

impl Display for Uid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// A `Mailbox` is an open, authenticated view of an inbox that can list and fetch messages.
#[async_trait]
pub trait Mailbox {
    type Error: Error + Send + Sync + 'static;

    /// The address the mailbox belongs to; self-sent messages come from this address.
    fn address(&self) -> &str;

    /// List every message in the inbox, oldest first.
    async fn list_all(&mut self) -> Result<Vec<Uid>, Self::Error>;

    /// Fetch the raw contents of a single message.
    async fn fetch(&mut self, uid: Uid) -> Result<Message, Self::Error>;
}

/// List the inbox newest-first, which is the order every scan in this crate uses.
///
/// # Errors
/// Propagates the mailbox's listing error.
pub async fn list_newest_first<M: Mailbox + Send>(mailbox: &mut M) -> Result<Vec<Uid>, M::Error> {
    let mut uids = mailbox.list_all().await?;
    uids.reverse();
    Ok(uids)
}
