//! The one concrete [`MailGateway`]: an IMAP client fetching full
//! messages by uid and splitting them into text, html and attachment
//! parts.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use mail_parser::{MessageParser, MimeHeaders};
use tokio::net::TcpStream;

use super::{ImapConfig, MailAttachment, MailGateway, MailMessage, SyncMarker};

const DEFAULT_TLS_PORT: u16 = 993;
const DEFAULT_PLAIN_PORT: u16 = 143;

pub struct ImapMailGateway;

#[async_trait]
impl MailGateway for ImapMailGateway {
    async fn fetch_new(
        &self,
        config: &ImapConfig,
        marker: &SyncMarker,
    ) -> Result<(Vec<MailMessage>, SyncMarker)> {
        let (host, port) = split_host_port(&config.host, config.tls);

        let tcp = TcpStream::connect((host.as_str(), port))
            .await
            .with_context(|| format!("failed to connect to {host}:{port}"))?;

        if config.tls {
            let connector = async_native_tls::TlsConnector::new()
                .danger_accept_invalid_certs(config.insecure_skip_verify);
            let tls = connector
                .connect(host.as_str(), tcp)
                .await
                .context("TLS handshake failed")?;

            let client = async_imap::Client::new(tls);
            let session = client
                .login(&config.user, &config.password)
                .await
                .map_err(|(err, _)| anyhow!("login failed: {err}"))?;

            fetch_session(session, config, marker).await
        } else {
            let client = async_imap::Client::new(tcp);
            let session = client
                .login(&config.user, &config.password)
                .await
                .map_err(|(err, _)| anyhow!("login failed: {err}"))?;

            fetch_session(session, config, marker).await
        }
    }
}

fn split_host_port(host: &str, tls: bool) -> (String, u16) {
    if let Some((name, port)) = host.rsplit_once(':') {
        if let Ok(port) = port.parse() {
            return (name.to_string(), port);
        }
    }

    let port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT };
    (host.to_string(), port)
}

async fn fetch_session<S>(
    mut session: async_imap::Session<S>,
    config: &ImapConfig,
    marker: &SyncMarker,
) -> Result<(Vec<MailMessage>, SyncMarker)>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug,
{
    let mailbox = if config.read_only {
        session.examine(&config.folder).await
    } else {
        session.select(&config.folder).await
    }
    .with_context(|| format!("failed to open folder {:?}", config.folder))?;

    let uid_validity = i64::from(mailbox.uid_validity.unwrap_or(0));
    let mut last_uid = if uid_validity == marker.uid_validity {
        marker.last_uid
    } else {
        // the folder was rebuilt, start over
        0
    };

    let query = format!("UID {}:*", last_uid + 1);
    let mut uids: Vec<u32> = session
        .uid_search(&query)
        .await
        .context("uid search failed")?
        .into_iter()
        .filter(|uid| i64::from(*uid) > last_uid)
        .collect();
    uids.sort_unstable();

    let mut messages = Vec::new();

    if !uids.is_empty() {
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        {
            let mut fetches = session
                .uid_fetch(&set, "(UID INTERNALDATE RFC822)")
                .await
                .context("uid fetch failed")?;

            while let Some(fetch) = fetches.next().await {
                let fetch = fetch.context("failed to read fetch response")?;
                let Some(uid) = fetch.uid else {
                    continue;
                };

                let internal_date = fetch
                    .internal_date()
                    .map(|date| date.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now);

                messages.push(parse_message(
                    fetch.body().unwrap_or_default(),
                    i64::from(uid),
                    internal_date,
                ));

                last_uid = last_uid.max(i64::from(uid));
            }
        }
    }

    let _ = session.logout().await;

    Ok((
        messages,
        SyncMarker {
            uid_validity,
            last_uid,
        },
    ))
}

fn parse_message(raw: &[u8], uid: i64, internal_date: chrono::DateTime<Utc>) -> MailMessage {
    let mut message = MailMessage {
        uid,
        subject: String::new(),
        internal_date,
        text_parts: Vec::new(),
        html_parts: Vec::new(),
        attachments: Vec::new(),
    };

    let Some(parsed) = MessageParser::default().parse(raw) else {
        return message;
    };

    message.subject = parsed.subject().unwrap_or_default().to_string();

    let mut index = 0;
    while let Some(text) = parsed.body_text(index) {
        message.text_parts.push(text.to_string());
        index += 1;
    }

    let mut index = 0;
    while let Some(html) = parsed.body_html(index) {
        message.html_parts.push(html.to_string());
        index += 1;
    }

    for part in parsed.attachments() {
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        message.attachments.push(MailAttachment {
            file_name: part.attachment_name().unwrap_or_default().to_string(),
            content_type,
            body: part.contents().to_vec(),
        });
    }

    message
}
