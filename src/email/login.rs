//! The login module abstracts the generation of IMAP sessions for use when fetching emails

use crate::config::IMAP as IMAPConfig;
use crate::{IMAPClient, IMAPSession};
use async_imap::error::Result as IMAPResult;
use async_native_tls::TlsConnector;
use async_trait::async_trait;

/// Servers that refuse to log in "unsafe" clients unless they identify themselves first.
const IDENTIFY_BEFORE_LOGIN: &[&str] = &["imap.163.com"];

const ID_COMMAND: &str = r#"ID ("name" "billmail" "version" "0.1.0" "vendor" "billmail")"#;

#[async_trait]
pub trait SessionGenerator {
    /// The address of the account sessions are logged in as.
    fn username(&self) -> &str;

    async fn new_session(&self) -> IMAPResult<IMAPSession>;
}

pub struct ConfigSessionGenerator {
    config: IMAPConfig,
}

#[async_trait]
impl SessionGenerator for ConfigSessionGenerator {
    fn username(&self) -> &str {
        self.config.username()
    }

    async fn new_session(&self) -> IMAPResult<IMAPSession> {
        let mut client = self.new_client().await?;
        debug!("Connected to IMAP server {}", self.config.domain());

        if requires_identification(self.config.domain()) {
            debug!("Identifying to {} before login", self.config.domain());
            client.run_command_and_check_ok(ID_COMMAND, None).await?;
        }

        let session = client
            .login(self.config.username(), self.config.password())
            .await
            .map_err(|err| err.0)?;

        info!("Logged in as {}", self.config.username());
        Ok(session)
    }
}

impl ConfigSessionGenerator {
    #[must_use]
    pub fn new(config: IMAPConfig) -> Self {
        Self { config }
    }

    async fn new_client(&self) -> IMAPResult<IMAPClient> {
        let tls_connector = TlsConnector::new();
        async_imap::connect(
            (self.config.domain(), self.config.port()),
            self.config.domain(),
            tls_connector,
        )
        .await
    }
}

fn requires_identification(domain: &str) -> bool {
    IDENTIFY_BEFORE_LOGIN
        .iter()
        .any(|host| host.eq_ignore_ascii_case(domain))
}
