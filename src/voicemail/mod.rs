//! Voicemail ingestion. The actual IMAP mechanics live behind the
//! [`MailGateway`] contract; the pollers only decide *when* to fetch and
//! what to do with the fetched messages.

pub mod imap;
pub mod manager;
pub mod synced_mailbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use imap::ImapMailGateway;
pub use manager::SyncManager;
pub use synced_mailbox::SyncedMailbox;

use crate::models::Mailbox;

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub folder: String,
    pub user: String,
    pub password: String,
    pub tls: bool,
    pub insecure_skip_verify: bool,
    pub read_only: bool,
}

impl ImapConfig {
    pub fn from_mailbox(mailbox: &Mailbox) -> Self {
        Self {
            host: mailbox.imap_host.clone(),
            folder: mailbox.imap_folder.clone(),
            user: mailbox.imap_user.clone(),
            password: mailbox.imap_password.clone(),
            tls: mailbox.imap_tls,
            insecure_skip_verify: mailbox.imap_insecure_skip_verify,
            read_only: mailbox.imap_read_only,
        }
    }
}

/// Position marker of a mailbox sync. A changed uidvalidity invalidates
/// the last-seen uid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMarker {
    pub uid_validity: i64,
    pub last_uid: i64,
}

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub uid: i64,
    pub subject: String,
    pub internal_date: DateTime<Utc>,
    pub text_parts: Vec<String>,
    pub html_parts: Vec<String>,
    pub attachments: Vec<MailAttachment>,
}

#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub file_name: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Contract of the external voicemail gateway: fetch everything newer
/// than the marker and report the new marker.
#[async_trait]
pub trait MailGateway: Send + Sync + 'static {
    async fn fetch_new(
        &self,
        config: &ImapConfig,
        marker: &SyncMarker,
    ) -> anyhow::Result<(Vec<MailMessage>, SyncMarker)>;
}
