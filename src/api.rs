//! Wire types exchanged with the PBX frontends and the external
//! identity, roster and customer services. All messages are
//! protojson-shaped: camelCase fields, RFC 3339 timestamps, oneofs as
//! mutually exclusive optional fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Profile {
    pub user: UserInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_phone_number: Option<PhoneNumber>,
    /// Extensible per-user attributes (protobuf Struct), used for the
    /// phone-extension key lookup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhoneNumber {
    pub number: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Customer {
    pub id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub first_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub phone_numbers: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendNotificationRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sender_user_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_users: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub target_roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<EmailMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sms: Option<Sms>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webpush: Option<WebPushNotification>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EmailMessage {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sms {
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebPushNotification {
    pub title: String,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendNotificationResponse {
    pub deliveries: Vec<DeliveryNotification>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliveryNotification {
    pub target_user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub error_kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[default]
    #[serde(rename = "ERROR_KIND_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "ERROR_KIND_TRANSIENT")]
    Transient,
    #[serde(rename = "ERROR_KIND_PERMANENT")]
    Permanent,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkingStaff {
    pub user_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roster_id: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub current_shifts: Vec<PlannedShift>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster_date: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlannedShift {
    pub assigned_user_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnCall {
    pub transfer_target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Profile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetOnCallResponse {
    pub on_call: Vec<OnCall>,
    pub primary_transfer_target: String,
    pub is_overwrite: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverwriteWire {
    pub id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_number: Option<InboundNumberWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<CustomOverwrite>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomOverwrite {
    pub display_name: String,
    pub transfer_target: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundNumberWire {
    pub number: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub roster_type_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roster_shift_tags: Vec<String>,
    pub result_limit: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEntry {
    pub id: String,
    #[serde(default)]
    pub caller: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inbound_number: String,
    pub received_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_user_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub customer_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub customer_source: String,
    #[serde(default)]
    pub error: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transfer_target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub accepted_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub direction: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue_extension: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailboxWire {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub display_name: String,
    pub config: MailboxConfig,
    pub poll_interval_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract_caller_regexp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extract_target_regexp: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notification_settings: Vec<NotificationSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailboxConfig {
    pub host: String,
    pub folder: String,
    pub user: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub password: String,
    pub tls: bool,
    pub insecure_skip_verify: bool,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub name: String,
    pub subject_template: String,
    pub message_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<String>>,
    pub types: Vec<NotificationType>,
    pub send_times: Vec<DayTime>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationType {
    #[default]
    #[serde(rename = "NOTIFICATION_TYPE_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "NOTIFICATION_TYPE_MAIL")]
    Mail,
    #[serde(rename = "NOTIFICATION_TYPE_SMS")]
    Sms,
    #[serde(rename = "NOTIFICATION_TYPE_WEBPUSH")]
    Webpush,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DayTime {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMailWire {
    pub id: String,
    pub mailbox: String,
    pub receive_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subject: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<Customer>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inbound_number: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnCallChangeEvent {
    pub on_call: Vec<OnCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster_date: Option<String>,
    pub is_overwrite: bool,
    pub primary_transfer_target: String,
    pub inbound_number: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecordReceived {
    pub call_entry: CallEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverwriteCreatedEvent {
    pub overwrite: OverwriteWire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverwriteDeletedEvent {
    pub overwrite: OverwriteWire,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PhoneExtensionWire {
    pub extension: String,
    pub display_name: String,
    pub eligible_for_overwrite: bool,
    pub internal_queue: bool,
}
