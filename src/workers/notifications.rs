//! Unseen-voicemail notification scheduler.
//!
//! A minute tick walks every mailbox and notification setting. A
//! time-of-day slot fires once per day: the slot must have been reached
//! by wall clock, must not predate the worker start, and must not have
//! fired already (tracked in `last_sent`). Successful sends journal all
//! candidate records so no voicemail is announced twice for the same
//! setting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveTime, TimeZone};
use minijinja::{context, Environment};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{
    EmailMessage, ErrorKind, NotificationSettings, NotificationType, SendNotificationRequest, Sms,
    WebPushNotification,
};
use crate::config::AppConfig;
use crate::models::Mailbox;
use crate::state::AppState;
use crate::stores::mailboxes as mailbox_store;
use crate::voicemail::SyncManager;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(state: AppState, manager: Arc<SyncManager>, cancel: CancellationToken) {
    let worker_start = Local::now();
    let mut last_sent: HashMap<String, DateTime<Local>> = HashMap::new();

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("notification worker cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        tick(&state, &manager, worker_start, &mut last_sent).await;
    }
}

async fn tick(
    state: &AppState,
    manager: &SyncManager,
    worker_start: DateTime<Local>,
    last_sent: &mut HashMap<String, DateTime<Local>>,
) {
    let mailboxes = {
        let state = state.clone();
        match tokio::task::spawn_blocking(move || -> Result<Vec<Mailbox>> {
            let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;
            Ok(mailbox_store::list_mailboxes(&mut conn)?)
        })
        .await
        {
            Ok(Ok(mailboxes)) => mailboxes,
            Ok(Err(err)) => {
                error!(error = %err, "failed to retrieve mailbox list");
                return;
            }
            Err(join_err) => {
                error!(error = %join_err, "mailbox list task panicked");
                return;
            }
        }
    };

    for mailbox in mailboxes {
        // sync first so freshly delivered voicemails are considered
        if let Err(err) = manager.trigger_sync(mailbox.id).await {
            error!(mailbox = %mailbox.id, error = %err, "failed to trigger mailbox sync");
        }

        for (index, setting) in mailbox.settings().iter().enumerate() {
            process_setting(state, &mailbox, index, setting, worker_start, last_sent).await;
        }
    }
}

async fn process_setting(
    state: &AppState,
    mailbox: &Mailbox,
    index: usize,
    setting: &NotificationSettings,
    worker_start: DateTime<Local>,
    last_sent: &mut HashMap<String, DateTime<Local>>,
) {
    let candidates = {
        let state = state.clone();
        let mailbox_id = mailbox.id;
        let notification = setting.name.clone();
        match tokio::task::spawn_blocking(move || -> Result<Vec<Uuid>> {
            let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;
            Ok(mailbox_store::find_notification_candidates(
                &mut conn,
                mailbox_id,
                &notification,
            )?)
        })
        .await
        {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(err)) => {
                error!(
                    mailbox = %mailbox.id,
                    notification_setting = %setting.name,
                    error = %err,
                    "failed to find notification candidates"
                );
                return;
            }
            Err(join_err) => {
                error!(error = %join_err, "candidate task panicked");
                return;
            }
        }
    };

    if candidates.is_empty() {
        return;
    }

    let requests = match build_requests(&state.config, mailbox, setting, candidates.len()) {
        Ok(requests) => requests,
        Err(err) => {
            error!(
                mailbox = %mailbox.id,
                notification_setting = %setting.name,
                error = %err,
                "failed to create notification requests"
            );
            return;
        }
    };

    let now = Local::now();

    for slot in &setting.send_times {
        let Some(time) = NaiveTime::from_hms_opt(slot.hour, slot.minute, slot.second) else {
            warn!(
                notification_setting = %setting.name,
                hour = slot.hour,
                minute = slot.minute,
                second = slot.second,
                "ignoring invalid time-of-day slot"
            );
            continue;
        };

        let Some(send_time_today) = Local
            .from_local_datetime(&now.date_naive().and_time(time))
            .single()
        else {
            continue;
        };

        // a slot must be reached by wall clock and must not predate the
        // worker start
        if send_time_today < worker_start || send_time_today > now {
            continue;
        }

        let key = format!(
            "{}-{}-{}:{}:{}",
            mailbox.id, index, slot.hour, slot.minute, slot.second
        );

        if let Some(last) = last_sent.get(&key) {
            if *last >= send_time_today {
                continue;
            }
        }

        info!(
            mailbox = %mailbox.id,
            notification_setting = %setting.name,
            key,
            count = candidates.len(),
            "sending notification requests for time-of-day"
        );

        let mut all_delivered = true;

        for request in &requests {
            match state.idm.send_notification(request).await {
                Ok(response) => {
                    for delivery in &response.deliveries {
                        if delivery.error_kind != ErrorKind::Unspecified {
                            all_delivered = false;
                            error!(
                                key,
                                target_user = %delivery.target_user,
                                error = %delivery.error,
                                "failed to deliver notification"
                            );
                        }
                    }
                }
                Err(err) => {
                    all_delivered = false;
                    error!(key, error = %err, "failed to send notification");
                }
            }
        }

        if !all_delivered {
            // candidates stay unjournaled and eligible for the next tick
            continue;
        }

        let journaled = {
            let state = state.clone();
            let mailbox_id = mailbox.id;
            let notification = setting.name.clone();
            let ids = candidates.clone();
            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut conn = state.db().map_err(|err| anyhow!("{err}"))?;
                mailbox_store::mark_notification_sent(&mut conn, mailbox_id, &notification, &ids)?;
                Ok(())
            })
            .await
        };

        match journaled {
            Ok(Ok(())) => {
                last_sent.insert(key, send_time_today);
            }
            Ok(Err(err)) => {
                error!(key, error = %err, "failed to journal notification-sent records");
            }
            Err(join_err) => {
                error!(key, error = %join_err, "journal task panicked");
            }
        }
    }
}

/// Renders the subject and message templates and builds one request per
/// configured notification type.
fn build_requests(
    config: &AppConfig,
    mailbox: &Mailbox,
    setting: &NotificationSettings,
    count: usize,
) -> Result<Vec<SendNotificationRequest>> {
    let env = Environment::new();

    let message = env
        .template_from_str(&setting.message_template)
        .context("failed to parse message template")?
        .render(context! { count => count, name => mailbox.display_name.clone() })
        .context("failed to render message template")?;

    let subject = env
        .template_from_str(&setting.subject_template)
        .context("failed to parse subject template")?
        .render(context! { count => count, name => mailbox.display_name.clone() })
        .context("failed to render subject template")?;

    let mut requests = Vec::new();

    for kind in &setting.types {
        let mut request = SendNotificationRequest {
            sender_user_id: config.notification_sender_id.clone(),
            ..Default::default()
        };

        if let Some(roles) = &setting.role_ids {
            request.target_roles = roles.clone();
        } else if let Some(users) = &setting.user_ids {
            request.target_users = users.clone();
        } else {
            warn!(notification_setting = %setting.name, "unspecified or unsupported recipients");
            continue;
        }

        match kind {
            NotificationType::Mail => {
                request.email = Some(EmailMessage {
                    subject: subject.clone(),
                    body: message.clone(),
                });
            }
            NotificationType::Sms => {
                request.sms = Some(Sms {
                    body: message.clone(),
                });
            }
            NotificationType::Webpush => {
                request.webpush = Some(WebPushNotification {
                    title: subject.clone(),
                    body: message.clone(),
                });
            }
            NotificationType::Unspecified => {
                warn!(notification_setting = %setting.name, "unspecified or unsupported notification type");
                continue;
            }
        }

        requests.push(request);
    }

    Ok(requests)
}
