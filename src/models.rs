use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::api::{
    CallEntry, CustomOverwrite, Customer, InboundNumberWire, MailboxConfig, MailboxWire,
    NotificationSettings, OverwriteWire, PhoneExtensionWire, VoiceMailWire,
};
use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = call_logs)]
pub struct CallLog {
    pub id: Uuid,
    pub caller: String,
    pub inbound_number: Option<String>,
    pub date: DateTime<Utc>,
    pub datestr: String,
    pub duration_seconds: Option<i64>,
    pub call_type: Option<String>,
    pub agent: Option<String>,
    pub agent_user_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_source: Option<String>,
    pub error: bool,
    pub transfer_target: Option<String>,
    pub transfer_from: Option<String>,
    pub call_id: Option<String>,
    pub direction: Option<String>,
    pub queue_extension: Option<String>,
    pub from_type: Option<String>,
    pub to_type: Option<String>,
    pub chain: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = call_logs)]
#[diesel(treat_none_as_null = true)]
pub struct NewCallLog {
    pub id: Uuid,
    pub caller: String,
    pub inbound_number: Option<String>,
    pub date: DateTime<Utc>,
    pub datestr: String,
    pub duration_seconds: Option<i64>,
    pub call_type: Option<String>,
    pub agent: Option<String>,
    pub agent_user_id: Option<String>,
    pub customer_id: Option<String>,
    pub customer_source: Option<String>,
    pub error: bool,
    pub transfer_target: Option<String>,
    pub transfer_from: Option<String>,
    pub call_id: Option<String>,
    pub direction: Option<String>,
    pub queue_extension: Option<String>,
    pub from_type: Option<String>,
    pub to_type: Option<String>,
    pub chain: Option<String>,
}

impl Default for NewCallLog {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            caller: String::new(),
            inbound_number: None,
            date: Utc::now(),
            datestr: String::new(),
            duration_seconds: None,
            call_type: None,
            agent: None,
            agent_user_id: None,
            customer_id: None,
            customer_source: None,
            error: false,
            transfer_target: None,
            transfer_from: None,
            call_id: None,
            direction: None,
            queue_extension: None,
            from_type: None,
            to_type: None,
            chain: None,
        }
    }
}

impl CallLog {
    pub fn to_entry(&self) -> CallEntry {
        CallEntry {
            id: self.id.to_string(),
            caller: self.caller.clone(),
            inbound_number: self.inbound_number.clone().unwrap_or_default(),
            received_at: self.date,
            duration_seconds: self.duration_seconds,
            call_type: self.call_type.clone().unwrap_or_default(),
            agent_user_id: self.agent_user_id.clone().unwrap_or_default(),
            customer_id: self.customer_id.clone().unwrap_or_default(),
            customer_source: self.customer_source.clone().unwrap_or_default(),
            error: self.error,
            transfer_target: self.transfer_target.clone().unwrap_or_default(),
            accepted_agent: self.agent.clone().unwrap_or_default(),
            direction: self.direction.clone().unwrap_or_default(),
            queue_extension: self.queue_extension.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = overwrites)]
pub struct Overwrite {
    pub id: Uuid,
    pub from_time: DateTime<Utc>,
    pub to_time: DateTime<Utc>,
    pub user_id: Option<String>,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub inbound_number: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = overwrites)]
pub struct NewOverwrite {
    pub id: Uuid,
    pub from_time: DateTime<Utc>,
    pub to_time: DateTime<Utc>,
    pub user_id: Option<String>,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub inbound_number: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Overwrite {
    pub fn to_wire(&self) -> OverwriteWire {
        let mut wire = OverwriteWire {
            id: self.id.to_string(),
            from: self.from_time,
            to: self.to_time,
            created_at: self.created_at,
            created_by_user_id: self.created_by.clone(),
            inbound_number: self.inbound_number.clone().map(|number| InboundNumberWire {
                number,
                ..Default::default()
            }),
            user_id: None,
            custom: None,
        };

        if let Some(phone) = self.phone_number.clone() {
            wire.custom = Some(CustomOverwrite {
                display_name: self.display_name.clone().unwrap_or_default(),
                transfer_target: phone,
            });
        } else {
            wire.user_id = self.user_id.clone();
        }

        wire
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = inbound_numbers)]
#[diesel(primary_key(number))]
#[diesel(treat_none_as_null = true)]
pub struct InboundNumber {
    pub number: String,
    pub display_name: String,
    pub roster_type_name: Option<String>,
    pub roster_shift_tags: Vec<String>,
    pub result_limit: i32,
}

impl InboundNumber {
    pub fn to_wire(&self) -> InboundNumberWire {
        InboundNumberWire {
            number: self.number.clone(),
            display_name: self.display_name.clone(),
            roster_type_name: self.roster_type_name.clone().unwrap_or_default(),
            roster_shift_tags: self.roster_shift_tags.clone(),
            result_limit: self.result_limit,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = phone_extensions)]
#[diesel(primary_key(extension))]
pub struct PhoneExtension {
    pub extension: String,
    pub display_name: String,
    pub eligible_for_overwrite: bool,
    pub internal_queue: bool,
}

impl PhoneExtension {
    pub fn to_wire(&self) -> PhoneExtensionWire {
        PhoneExtensionWire {
            extension: self.extension.clone(),
            display_name: self.display_name.clone(),
            eligible_for_overwrite: self.eligible_for_overwrite,
            internal_queue: self.internal_queue,
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = mailboxes)]
pub struct Mailbox {
    pub id: Uuid,
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
    pub notification_settings: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = mailboxes)]
pub struct NewMailbox {
    pub id: Uuid,
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
    pub notification_settings: serde_json::Value,
}

impl Mailbox {
    /// Decodes the embedded notification settings, discarding entries
    /// that no longer deserialize.
    pub fn settings(&self) -> Vec<NotificationSettings> {
        serde_json::from_value(self.notification_settings.clone()).unwrap_or_default()
    }

    pub fn to_wire(&self) -> MailboxWire {
        MailboxWire {
            id: self.id.to_string(),
            display_name: self.display_name.clone(),
            config: MailboxConfig {
                host: self.imap_host.clone(),
                folder: self.imap_folder.clone(),
                user: self.imap_user.clone(),
                password: self.imap_password.clone(),
                tls: self.imap_tls,
                insecure_skip_verify: self.imap_insecure_skip_verify,
                read_only: self.imap_read_only,
            },
            poll_interval_seconds: self.poll_interval_seconds.max(0) as u32,
            extract_caller_regexp: self.extract_caller_regex.clone(),
            extract_target_regexp: self.extract_target_regex.clone(),
            notification_settings: self.settings(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = voicemails)]
pub struct VoiceMail {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    pub receive_time: DateTime<Utc>,
    pub subject: String,
    pub message: String,
    pub seen_time: Option<DateTime<Utc>>,
    pub caller: Option<String>,
    pub customer_id: Option<String>,
    pub file_name: String,
    pub inbound_number: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = voicemails)]
pub struct NewVoiceMail {
    pub id: Uuid,
    pub mailbox_id: Uuid,
    pub receive_time: DateTime<Utc>,
    pub subject: String,
    pub message: String,
    pub caller: Option<String>,
    pub customer_id: Option<String>,
    pub file_name: String,
    pub inbound_number: Option<String>,
}

impl VoiceMail {
    pub fn to_wire(&self) -> VoiceMailWire {
        VoiceMailWire {
            id: self.id.to_string(),
            mailbox: self.mailbox_id.to_string(),
            receive_time: self.receive_time,
            subject: self.subject.clone(),
            message: self.message.clone(),
            seen_time: self.seen_time,
            number: self.caller.clone(),
            customer: match (&self.caller, &self.customer_id) {
                (None, Some(id)) => Some(Customer {
                    id: id.clone(),
                    ..Default::default()
                }),
                _ => None,
            },
            file_name: self.file_name.clone(),
            inbound_number: self.inbound_number.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = notifications_sent)]
pub struct NotificationSent {
    pub record_id: Uuid,
    pub notification: String,
    pub mailbox_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = sync_states)]
#[diesel(primary_key(name))]
pub struct SyncState {
    pub name: String,
    pub uid_validity: i64,
    pub last_uid: i64,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid_validity: 0,
            last_uid: 0,
            updated_at: Utc::now(),
        }
    }
}
