//! Mailbox, voicemail, notification-journal and mailsync-state store.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

use crate::api::NotificationSettings;
use crate::models::{Mailbox, NewMailbox, NewVoiceMail, NotificationSent, SyncState, VoiceMail};
use crate::schema::{mailboxes, notifications_sent, sync_states, voicemails};

pub fn create_mailbox(conn: &mut PgConnection, new: NewMailbox) -> QueryResult<Mailbox> {
    diesel::insert_into(mailboxes::table)
        .values(&new)
        .execute(conn)?;

    mailboxes::table.find(new.id).first(conn)
}

pub fn list_mailboxes(conn: &mut PgConnection) -> QueryResult<Vec<Mailbox>> {
    mailboxes::table.order(mailboxes::created_at.asc()).load(conn)
}

pub fn get_mailbox(conn: &mut PgConnection, id: Uuid) -> QueryResult<Mailbox> {
    mailboxes::table.find(id).first(conn)
}

pub fn delete_mailbox(conn: &mut PgConnection, id: Uuid) -> QueryResult<()> {
    let deleted = diesel::delete(mailboxes::table.find(id)).execute(conn)?;

    if deleted == 0 {
        return Err(diesel::result::Error::NotFound);
    }

    Ok(())
}

#[derive(Debug, AsChangeset)]
#[diesel(table_name = mailboxes)]
#[diesel(treat_none_as_null = true)]
pub struct MailboxChangeset {
    pub display_name: String,
    pub imap_host: String,
    pub imap_folder: String,
    pub imap_user: String,
    pub imap_password: String,
    pub imap_tls: bool,
    pub imap_insecure_skip_verify: bool,
    pub imap_read_only: bool,
    pub poll_interval_seconds: i32,
    pub extract_caller_regex: Option<String>,
    pub extract_target_regex: Option<String>,
}

/// Replaces the mailbox configuration. The embedded notification
/// settings are deliberately left untouched; they have their own
/// operations below.
pub fn update_mailbox(
    conn: &mut PgConnection,
    id: Uuid,
    changes: &MailboxChangeset,
) -> QueryResult<()> {
    let updated = diesel::update(mailboxes::table.find(id))
        .set((changes, mailboxes::updated_at.eq(Utc::now())))
        .execute(conn)?;

    if updated == 0 {
        return Err(diesel::result::Error::NotFound);
    }

    Ok(())
}

/// Adds a notification setting, or replaces the one with the same name.
/// Names are unique within a mailbox.
pub fn append_notification_setting(
    conn: &mut PgConnection,
    mailbox_id: Uuid,
    setting: NotificationSettings,
) -> QueryResult<()> {
    conn.transaction(|conn| {
        let mailbox: Mailbox = mailboxes::table.find(mailbox_id).first(conn)?;

        let mut settings = mailbox.settings();
        match settings.iter_mut().find(|s| s.name == setting.name) {
            Some(existing) => *existing = setting,
            None => settings.push(setting),
        }

        diesel::update(mailboxes::table.find(mailbox_id))
            .set((
                mailboxes::notification_settings.eq(json!(settings)),
                mailboxes::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;

        Ok(())
    })
}

pub fn delete_notification_setting(
    conn: &mut PgConnection,
    mailbox_id: Uuid,
    name: &str,
) -> QueryResult<()> {
    conn.transaction(|conn| {
        let mailbox: Mailbox = mailboxes::table.find(mailbox_id).first(conn)?;

        let mut settings = mailbox.settings();
        let before = settings.len();
        settings.retain(|s| s.name != name);

        if settings.len() == before {
            return Err(diesel::result::Error::NotFound);
        }

        diesel::update(mailboxes::table.find(mailbox_id))
            .set((
                mailboxes::notification_settings.eq(json!(settings)),
                mailboxes::updated_at.eq(Utc::now()),
            ))
            .execute(conn)?;

        Ok(())
    })
}

pub fn create_voicemail(conn: &mut PgConnection, new: NewVoiceMail) -> QueryResult<VoiceMail> {
    diesel::insert_into(voicemails::table)
        .values(&new)
        .execute(conn)?;

    voicemails::table.find(new.id).first(conn)
}

pub fn get_voicemail(conn: &mut PgConnection, id: Uuid) -> QueryResult<VoiceMail> {
    voicemails::table.find(id).first(conn)
}

#[derive(Debug, Default, Clone)]
pub struct VoiceMailFilter {
    pub caller_number: Option<String>,
    pub customer_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub unseen: Option<bool>,
}

pub fn list_voicemails(
    conn: &mut PgConnection,
    mailbox_id: Uuid,
    filter: &VoiceMailFilter,
) -> QueryResult<Vec<VoiceMail>> {
    let mut query = voicemails::table
        .filter(voicemails::mailbox_id.eq(mailbox_id))
        .order(voicemails::receive_time.desc())
        .into_boxed();

    if let Some(ref number) = filter.caller_number {
        query = query.filter(voicemails::caller.eq(number));
    }
    if let Some(ref customer) = filter.customer_id {
        query = query.filter(voicemails::customer_id.eq(customer));
    }
    if let Some(from) = filter.from {
        query = query.filter(voicemails::receive_time.ge(from));
    }
    if let Some(to) = filter.to {
        query = query.filter(voicemails::receive_time.le(to));
    }
    match filter.unseen {
        Some(true) => query = query.filter(voicemails::seen_time.is_null()),
        Some(false) => query = query.filter(voicemails::seen_time.is_not_null()),
        None => {}
    }

    query.load(conn)
}

/// Case-insensitive substring search over subject, message body and
/// caller number.
pub fn search_voicemails(
    conn: &mut PgConnection,
    mailbox_id: Uuid,
    query: &str,
) -> QueryResult<Vec<VoiceMail>> {
    let pattern = format!(
        "%{}%",
        query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
    );

    voicemails::table
        .filter(voicemails::mailbox_id.eq(mailbox_id))
        .filter(
            voicemails::subject
                .ilike(pattern.clone())
                .nullable()
                .or(voicemails::message.ilike(pattern.clone()).nullable())
                .or(voicemails::caller.ilike(pattern)),
        )
        .order(voicemails::receive_time.desc())
        .load(conn)
}

/// Marks voicemails seen or unseen. Marking seen only touches records
/// that are still unseen, which keeps the first `seen_time` stable and
/// makes the operation idempotent.
pub fn mark_voicemails(
    conn: &mut PgConnection,
    seen: bool,
    mailbox_id: Option<Uuid>,
    ids: &[Uuid],
) -> QueryResult<usize> {
    conn.transaction(|conn| {
        let mut targets = voicemails::table.select(voicemails::id).into_boxed();

        if seen {
            targets = targets.filter(voicemails::seen_time.is_null());
        } else {
            targets = targets.filter(voicemails::seen_time.is_not_null());
        }
        if let Some(mailbox_id) = mailbox_id {
            targets = targets.filter(voicemails::mailbox_id.eq(mailbox_id));
        }
        if !ids.is_empty() {
            targets = targets.filter(voicemails::id.eq_any(ids.to_vec()));
        }

        let ids: Vec<Uuid> = targets.load(conn)?;
        if ids.is_empty() {
            return Ok(0);
        }

        let seen_time: Option<DateTime<Utc>> = seen.then(Utc::now);

        diesel::update(voicemails::table.filter(voicemails::id.eq_any(ids)))
            .set(voicemails::seen_time.eq(seen_time))
            .execute(conn)
    })
}

pub fn distinct_numbers_without_customer(conn: &mut PgConnection) -> QueryResult<Vec<String>> {
    let numbers: Vec<Option<String>> = voicemails::table
        .select(voicemails::caller)
        .distinct()
        .filter(voicemails::caller.is_not_null())
        .filter(voicemails::customer_id.is_null())
        .load(conn)?;

    Ok(numbers.into_iter().flatten().collect())
}

pub fn update_unmatched_number(
    conn: &mut PgConnection,
    number: &str,
    customer_id: &str,
) -> QueryResult<usize> {
    diesel::update(
        voicemails::table
            .filter(voicemails::caller.eq(number))
            .filter(voicemails::customer_id.is_null()),
    )
    .set(voicemails::customer_id.eq(customer_id))
    .execute(conn)
}

/// Unseen voicemails of the mailbox that have not yet been journaled for
/// the given notification setting. Runs under a transaction so the
/// scheduler observes a consistent candidate set.
pub fn find_notification_candidates(
    conn: &mut PgConnection,
    mailbox_id: Uuid,
    notification: &str,
) -> QueryResult<Vec<Uuid>> {
    conn.transaction(|conn| {
        let unseen: Vec<Uuid> = voicemails::table
            .select(voicemails::id)
            .filter(voicemails::mailbox_id.eq(mailbox_id))
            .filter(voicemails::seen_time.is_null())
            .load(conn)?;

        if unseen.is_empty() {
            return Ok(Vec::new());
        }

        let sent: Vec<Uuid> = notifications_sent::table
            .select(notifications_sent::record_id)
            .filter(notifications_sent::record_id.eq_any(&unseen))
            .filter(notifications_sent::notification.eq(notification))
            .filter(notifications_sent::mailbox_id.eq(mailbox_id))
            .load(conn)?;

        Ok(unseen.into_iter().filter(|id| !sent.contains(id)).collect())
    })
}

/// Journals the records as notified. The composite primary key makes the
/// journal write-once; replays are ignored.
pub fn mark_notification_sent(
    conn: &mut PgConnection,
    mailbox_id: Uuid,
    notification: &str,
    record_ids: &[Uuid],
) -> QueryResult<usize> {
    let now = Utc::now();
    let rows: Vec<NotificationSent> = record_ids
        .iter()
        .map(|record_id| NotificationSent {
            record_id: *record_id,
            notification: notification.to_string(),
            mailbox_id,
            sent_at: now,
        })
        .collect();

    diesel::insert_into(notifications_sent::table)
        .values(&rows)
        .on_conflict_do_nothing()
        .execute(conn)
}

pub fn load_sync_state(conn: &mut PgConnection, name: &str) -> QueryResult<SyncState> {
    let state: Option<SyncState> = sync_states::table.find(name).first(conn).optional()?;

    Ok(state.unwrap_or_else(|| SyncState::empty(name)))
}

pub fn save_sync_state(conn: &mut PgConnection, state: &SyncState) -> QueryResult<()> {
    diesel::insert_into(sync_states::table)
        .values(state)
        .on_conflict(sync_states::name)
        .do_update()
        .set(state)
        .execute(conn)?;

    Ok(())
}
