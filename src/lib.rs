#![warn(clippy::all, clippy::pedantic)]

#[macro_use]
extern crate log;

use async_native_tls::TlsStream;
use async_std::net::TcpStream;

pub use config::{Config, IMAP as IMAPConfig};
pub use email::login::{ConfigSessionGenerator, SessionGenerator};
pub use email::message::{DecodedMessage, Message};
pub use email::session::ImapMailbox;
pub use email::{Mailbox, Uid};
pub use normalize::{CanonicalRecord, RawRow, RecordNormalizer};
pub use pipeline::{ImportResult, Outcome, Pipeline};
pub use platform::{Platform, PlatformAdapter};

pub mod archive;
pub mod attachment;
pub mod config;
pub mod email;
pub mod normalize;
pub mod notion;
pub mod pipeline;
pub mod platform;
pub mod secret;
pub mod stage;

#[cfg(test)]
mod testutil;

type IMAPTransportStream = TlsStream<TcpStream>;
type IMAPClient = async_imap::Client<IMAPTransportStream>;
pub type IMAPSession = async_imap::Session<IMAPTransportStream>;
