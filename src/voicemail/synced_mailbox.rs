//! One live poller per mailbox: a strictly sequential loop that fetches
//! new messages on a per-mailbox interval, extracts caller and target
//! via the configured regular expressions, files the recording under a
//! content-hash name and persists the voicemail record.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::{Mailbox, NewVoiceMail, SyncState};
use crate::state::AppState;
use crate::stores::mailboxes as mailbox_store;

use super::{ImapConfig, MailMessage, SyncMarker};

type SyncReply = oneshot::Sender<Result<()>>;

pub struct SyncedMailbox {
    mailbox_id: Uuid,
    trigger: mpsc::Sender<SyncReply>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl SyncedMailbox {
    /// Compiles the extraction regexes and starts the poll loop.
    pub fn spawn(state: AppState, mailbox: &Mailbox) -> Result<Self> {
        let caller_regex = compile_regex(mailbox.extract_caller_regex.as_deref())
            .context("invalid caller regexp")?;
        let target_regex = compile_regex(mailbox.extract_target_regex.as_deref())
            .context("invalid target regexp")?;

        let interval = Duration::from_secs(mailbox.poll_interval_seconds.max(1) as u64);
        let storage_path = state.config.storage_path.clone();

        let poller = Poller {
            state,
            mailbox_id: mailbox.id,
            config: ImapConfig::from_mailbox(mailbox),
            caller_regex,
            target_regex,
            storage_path,
        };

        let (trigger_tx, trigger_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(poller, interval, trigger_rx, cancel.clone()));

        Ok(Self {
            mailbox_id: mailbox.id,
            trigger: trigger_tx,
            cancel,
            handle,
        })
    }

    pub fn mailbox_id(&self) -> Uuid {
        self.mailbox_id
    }

    /// Requests an immediate fetch and waits for it to complete.
    pub async fn trigger_sync(&self) -> Result<()> {
        self.trigger_handle().run().await
    }

    /// A detached handle for triggering a sync without borrowing the
    /// poller, so callers don't hold the manager lock while waiting.
    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle {
            trigger: self.trigger.clone(),
        }
    }

    /// Stops the poller and waits for the in-flight iteration to drain.
    pub async fn dispose(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

pub struct TriggerHandle {
    trigger: mpsc::Sender<SyncReply>,
}

impl TriggerHandle {
    pub async fn run(self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.trigger
            .send(reply_tx)
            .await
            .map_err(|_| anyhow!("mailbox poller stopped"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("mailbox poller stopped"))?
    }
}

fn compile_regex(raw: Option<&str>) -> Result<Option<Regex>> {
    match raw.filter(|pattern| !pattern.is_empty()) {
        Some(pattern) => Ok(Some(Regex::new(pattern)?)),
        None => Ok(None),
    }
}

async fn run(
    poller: Poller,
    interval: Duration,
    mut trigger_rx: mpsc::Receiver<SyncReply>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    if let Err(err) = poller.sync().await {
        error!(mailbox = %poller.mailbox_id, error = %err, "initial mailbox sync failed");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(err) = poller.sync().await {
                    error!(mailbox = %poller.mailbox_id, error = %err, "mailbox sync failed");
                }
            }
            Some(reply) = trigger_rx.recv() => {
                let result = poller.sync().await;
                if let Err(err) = &result {
                    error!(mailbox = %poller.mailbox_id, error = %err, "triggered mailbox sync failed");
                }
                let _ = reply.send(result);
            }
        }
    }
}

struct Poller {
    state: AppState,
    mailbox_id: Uuid,
    config: ImapConfig,
    caller_regex: Option<Regex>,
    target_regex: Option<Regex>,
    storage_path: PathBuf,
}

impl Poller {
    async fn sync(&self) -> Result<()> {
        let name = self.mailbox_id.to_string();

        let stored = {
            let state = self.state.clone();
            let name = name.clone();
            tokio::task::spawn_blocking(move || -> Result<SyncState> {
                let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;
                Ok(mailbox_store::load_sync_state(&mut conn, &name)?)
            })
            .await
            .context("sync-state task panicked")??
        };

        let marker = SyncMarker {
            uid_validity: stored.uid_validity,
            last_uid: stored.last_uid,
        };

        let (messages, new_marker) = self.state.mail.fetch_new(&self.config, &marker).await?;

        for message in &messages {
            if let Err(err) = self.handle_message(message).await {
                error!(
                    mailbox = %self.mailbox_id,
                    uid = message.uid,
                    error = %err,
                    "failed to process voicemail message"
                );
            }
        }

        if new_marker != marker {
            let state = self.state.clone();
            let updated = SyncState {
                name,
                uid_validity: new_marker.uid_validity,
                last_uid: new_marker.last_uid,
                updated_at: chrono::Utc::now(),
            };
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;
                mailbox_store::save_sync_state(&mut conn, &updated)?;
                Ok(())
            })
            .await
            .context("sync-state task panicked")??;
        }

        Ok(())
    }

    async fn handle_message(&self, mail: &MailMessage) -> Result<()> {
        let (caller, target, body) = extract_data(mail, &self.caller_regex, &self.target_regex);

        let mut customer_id = None;
        if !caller.is_empty() {
            match self.state.customer.search_by_phone(&[caller.clone()]).await {
                Ok(customers) => customer_id = customers.into_iter().next().map(|c| c.id),
                Err(err) => {
                    // non-fatal, the record is stored with the raw number
                    warn!(caller, error = %err, "failed to query customer for voicemail");
                }
            }
        }

        let file_path = match save_voice_attachment(&self.storage_path, mail).await {
            Ok(path) => path,
            Err(err) => {
                warn!(mailbox = %self.mailbox_id, caller, error = %err, "skipping voicemail");
                return Ok(());
            }
        };

        let record = NewVoiceMail {
            id: Uuid::new_v4(),
            mailbox_id: self.mailbox_id,
            receive_time: mail.internal_date,
            subject: mail.subject.clone(),
            message: body,
            caller: match customer_id {
                Some(_) => None,
                None if caller.is_empty() => None,
                None => Some(caller.clone()),
            },
            customer_id,
            file_name: file_path.to_string_lossy().into_owned(),
            inbound_number: if target.is_empty() {
                None
            } else {
                Some(target.clone())
            },
        };

        let state = self.state.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;
            mailbox_store::create_voicemail(&mut conn, record)?;
            Ok(())
        })
        .await
        .context("voicemail task panicked")??;

        info!(
            mailbox = %self.mailbox_id,
            caller,
            target,
            file = %file_path.display(),
            "new voicemail received"
        );

        Ok(())
    }
}

/// Concatenates the text parts (falling back to html) while running the
/// extraction regexes; stops early once both values are known.
fn extract_data(
    mail: &MailMessage,
    caller_regex: &Option<Regex>,
    target_regex: &Option<Regex>,
) -> (String, String, String) {
    let parts = if mail.text_parts.is_empty() {
        &mail.html_parts
    } else {
        &mail.text_parts
    };

    let mut caller = String::new();
    let mut target = String::new();
    let mut body = String::new();

    for part in parts {
        body.push_str(part);

        if caller.is_empty() {
            if let Some(regex) = caller_regex {
                if let Some(found) = first_submatch(regex, part) {
                    caller = found;
                }
            }
        }

        if target.is_empty() {
            if let Some(regex) = target_regex {
                if let Some(found) = first_submatch(regex, part) {
                    target = found;
                }
            }
        }

        if !caller.is_empty() && !target.is_empty() {
            break;
        }
    }

    (caller, target, body)
}

fn first_submatch(regex: &Regex, haystack: &str) -> Option<String> {
    regex
        .captures(haystack)
        .and_then(|captures| captures.get(1))
        .map(|group| group.as_str().to_string())
}

/// Streams the first `application/octet-stream` attachment to disk,
/// naming the file after its SHA-256 hash while keeping the original
/// extension.
async fn save_voice_attachment(storage: &Path, mail: &MailMessage) -> Result<PathBuf> {
    let Some(attachment) = mail
        .attachments
        .iter()
        .find(|a| a.content_type == "application/octet-stream")
    else {
        bail!("no voice recordings found");
    };

    if let Err(err) = tokio::fs::create_dir_all(storage).await {
        // saving might still succeed
        warn!(directory = %storage.display(), error = %err, "failed to create storage directory");
    }

    let extension = Path::new(&attachment.file_name)
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let temp_path = storage.join(format!("{}.tmp", Uuid::new_v4()));

    let hash = hex_digest(&attachment.body);

    tokio::fs::write(&temp_path, &attachment.body)
        .await
        .with_context(|| format!("failed to create voice file at {}", temp_path.display()))?;

    let final_path = storage.join(format!("{hash}{extension}"));

    tokio::fs::rename(&temp_path, &final_path)
        .await
        .with_context(|| {
            format!(
                "failed to rename voice file from {} to {}",
                temp_path.display(),
                final_path.display()
            )
        })?;

    Ok(final_path)
}

fn hex_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let digest = hasher.finalize();

    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
