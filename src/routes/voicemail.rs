use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use minijinja::Environment;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{Customer, MailboxWire, NotificationSettings, VoiceMailWire};
use crate::error::{AppError, AppResult};
use crate::models::{NewMailbox, VoiceMail};
use crate::state::AppState;
use crate::stores::mailboxes as mailbox_store;

use super::call::TimeRange;
use super::AppContext;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateMailboxRequest {
    pub mailbox: MailboxWire,
}

pub async fn create_mailbox(
    State(context): State<AppContext>,
    Json(request): Json<CreateMailboxRequest>,
) -> AppResult<Json<Value>> {
    let new = new_mailbox_from_wire(&request.mailbox)?;

    context.manager.create_mailbox(new).await?;

    Ok(Json(json!({})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseView {
    pub field_mask: Option<super::inbound::FieldMask>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMailboxesResponse {
    pub mailboxes: Vec<MailboxWire>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListMailboxesRequest {
    pub view: Option<ResponseView>,
}

pub async fn list_mailboxes(
    State(state): State<AppState>,
    Json(request): Json<ListMailboxesRequest>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    let mailboxes = mailbox_store::list_mailboxes(&mut conn).map_err(AppError::from)?;

    let mailboxes: Vec<MailboxWire> = mailboxes
        .iter()
        .map(|mailbox| {
            let mut wire = mailbox.to_wire();
            // credentials never leave the service
            wire.config.password = String::new();
            wire
        })
        .collect();

    Ok(apply_view(&ListMailboxesResponse { mailboxes }, &request.view))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteMailboxRequest {
    pub id: String,
}

pub async fn delete_mailbox(
    State(context): State<AppContext>,
    Json(request): Json<DeleteMailboxRequest>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&request.id)?;

    context.manager.delete_mailbox(id).await?;

    Ok(Json(json!({})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateMailboxRequest {
    pub mailbox_id: String,
    pub mailbox: Option<MailboxWire>,
    pub add_notification_setting: Option<NotificationSettings>,
    pub delete_notification_setting: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMailboxResponse {
    pub mailbox: MailboxWire,
}

pub async fn update_mailbox(
    State(context): State<AppContext>,
    Json(request): Json<UpdateMailboxRequest>,
) -> AppResult<Json<UpdateMailboxResponse>> {
    let state = &context.state;
    let id = parse_id(&request.mailbox_id)?;

    match (
        &request.mailbox,
        &request.add_notification_setting,
        &request.delete_notification_setting,
    ) {
        (Some(wire), None, None) => {
            info!(mailbox = %id, "updating mailbox");

            let changes = mailbox_changeset_from_wire(wire)?;

            {
                let mut conn = state.db()?;
                mailbox_store::update_mailbox(&mut conn, id, &changes).map_err(AppError::from)?;
            }

            let updated = {
                let mut conn = state.db()?;
                mailbox_store::get_mailbox(&mut conn, id).map_err(AppError::from)?
            };

            // swap the poller only after the store accepted the change
            context.manager.update_poller(&updated).await?;
        }
        (None, Some(setting), None) => {
            info!(mailbox = %id, name = %setting.name, "appending notification settings");

            validate_notification_setting(setting)?;

            let mut conn = state.db()?;
            mailbox_store::append_notification_setting(&mut conn, id, setting.clone())
                .map_err(AppError::from)?;
        }
        (None, None, Some(name)) => {
            info!(mailbox = %id, name, "deleting notification settings");

            let mut conn = state.db()?;
            mailbox_store::delete_notification_setting(&mut conn, id, name)
                .map_err(AppError::from)?;
        }
        _ => {
            return Err(AppError::invalid_argument("invalid or unsupported update"));
        }
    }

    let updated = {
        let mut conn = state.db()?;
        mailbox_store::get_mailbox(&mut conn, id).map_err(AppError::from)?
    };

    Ok(Json(UpdateMailboxResponse {
        mailbox: updated.to_wire(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceMailFilterRequest {
    pub number: Option<String>,
    pub customer_id: Option<String>,
    pub time_range: Option<TimeRange>,
    pub unseen: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListVoiceMailsRequest {
    pub mailbox: String,
    pub filter: Option<VoiceMailFilterRequest>,
    pub view: Option<ResponseView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMailListResponse {
    pub voicemails: Vec<VoiceMailWire>,
    pub customers: Vec<Customer>,
}

pub async fn list_voicemails(
    State(state): State<AppState>,
    Json(request): Json<ListVoiceMailsRequest>,
) -> AppResult<Json<Value>> {
    let mailbox_id = parse_id(&request.mailbox)?;

    let mut filter = mailbox_store::VoiceMailFilter::default();
    if let Some(ref wire) = request.filter {
        if wire.number.is_some() && wire.customer_id.is_some() {
            return Err(AppError::invalid_argument(
                "invalid or unsupported caller query",
            ));
        }
        filter.caller_number = wire.number.clone();
        filter.customer_id = wire.customer_id.clone();
        filter.unseen = wire.unseen;

        if let Some(ref range) = wire.time_range {
            if let (Some(from), Some(to)) = (range.from, range.to) {
                if to < from {
                    return Err(AppError::invalid_argument("invalid time_range value"));
                }
            }
            filter.from = range.from;
            filter.to = range.to;
        }
    }

    let records = {
        let mut conn = state.db()?;
        mailbox_store::list_voicemails(&mut conn, mailbox_id, &filter).map_err(AppError::from)?
    };

    let (voicemails, customers) = collect_customers(&state, &records).await;

    Ok(apply_view(
        &VoiceMailListResponse {
            voicemails,
            customers,
        },
        &request.view,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchVoiceMailsRequest {
    pub mailbox: String,
    pub query: String,
}

pub async fn search_voicemails(
    State(state): State<AppState>,
    Json(request): Json<SearchVoiceMailsRequest>,
) -> AppResult<Json<VoiceMailListResponse>> {
    let mailbox_id = parse_id(&request.mailbox)?;

    let records = {
        let mut conn = state.db()?;
        mailbox_store::search_voicemails(&mut conn, mailbox_id, &request.query)
            .map_err(AppError::from)?
    };

    let (voicemails, customers) = collect_customers(&state, &records).await;

    Ok(Json(VoiceMailListResponse {
        voicemails,
        customers,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetVoiceMailRequest {
    pub id: String,
    pub view: Option<ResponseView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVoiceMailResponse {
    pub voicemail: VoiceMailWire,
}

pub async fn get_voicemail(
    State(state): State<AppState>,
    Json(request): Json<GetVoiceMailRequest>,
) -> AppResult<Json<Value>> {
    let id = parse_id(&request.id)?;

    let record = {
        let mut conn = state.db()?;
        mailbox_store::get_voicemail(&mut conn, id).map_err(AppError::from)?
    };

    let mut wire = record.to_wire();

    if let Some(customer_id) = wire.customer.as_ref().map(|customer| customer.id.clone()) {
        match state.customer.search_by_ids(&[customer_id.clone()]).await {
            Ok(customers) => match customers.into_iter().next() {
                Some(customer) => wire.customer = Some(customer),
                None => {
                    warn!(customer_id, "failed to find customer record");
                }
            },
            Err(err) => {
                warn!(customer_id, error = %err, "failed to fetch customer record");
            }
        }
    }

    Ok(apply_view(
        &GetVoiceMailResponse { voicemail: wire },
        &request.view,
    ))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarkVoiceMailsRequest {
    pub mailbox: String,
    pub voicemail_ids: Vec<String>,
    pub seen: bool,
}

pub async fn mark_voicemails(
    State(state): State<AppState>,
    Json(request): Json<MarkVoiceMailsRequest>,
) -> AppResult<Json<Value>> {
    let mailbox_id = if request.mailbox.is_empty() {
        None
    } else {
        Some(parse_id(&request.mailbox)?)
    };

    let ids = request
        .voicemail_ids
        .iter()
        .map(|id| parse_id(id))
        .collect::<AppResult<Vec<Uuid>>>()?;

    let mut conn = state.db()?;
    mailbox_store::mark_voicemails(&mut conn, request.seen, mailbox_id, &ids)
        .map_err(AppError::from)?;

    Ok(Json(json!({})))
}

/// Batch-fetches the customer records referenced by the voicemails and
/// splices them into the response.
async fn collect_customers(
    state: &AppState,
    records: &[VoiceMail],
) -> (Vec<VoiceMailWire>, Vec<Customer>) {
    let mut wires: Vec<VoiceMailWire> = records.iter().map(VoiceMail::to_wire).collect();

    let mut ids: Vec<String> = wires
        .iter()
        .filter_map(|wire| wire.customer.as_ref().map(|customer| customer.id.clone()))
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();

    if ids.is_empty() {
        return (wires, Vec::new());
    }

    let customers = match state.customer.search_by_ids(&ids).await {
        Ok(customers) => customers,
        Err(err) => {
            warn!(error = %err, "failed to search customers");
            return (wires, Vec::new());
        }
    };

    let by_id: HashMap<String, Customer> = customers
        .iter()
        .map(|customer| (customer.id.clone(), customer.clone()))
        .collect();

    for wire in &mut wires {
        if let Some(current) = wire.customer.as_ref() {
            if let Some(full) = by_id.get(&current.id) {
                wire.customer = Some(full.clone());
            }
        }
    }

    (wires, customers)
}

fn new_mailbox_from_wire(wire: &MailboxWire) -> AppResult<NewMailbox> {
    if wire.display_name.is_empty() {
        return Err(AppError::invalid_argument("display_name must not be empty"));
    }
    if wire.config.host.is_empty() {
        return Err(AppError::invalid_argument("config.host must not be empty"));
    }

    let mut seen = std::collections::HashSet::new();
    for setting in &wire.notification_settings {
        validate_notification_setting(setting)?;
        if !seen.insert(setting.name.clone()) {
            return Err(AppError::invalid_argument(format!(
                "duplicate notification-setting name {:?}",
                setting.name
            )));
        }
    }

    Ok(NewMailbox {
        id: Uuid::new_v4(),
        display_name: wire.display_name.clone(),
        imap_host: wire.config.host.clone(),
        imap_folder: if wire.config.folder.is_empty() {
            "INBOX".to_string()
        } else {
            wire.config.folder.clone()
        },
        imap_user: wire.config.user.clone(),
        imap_password: wire.config.password.clone(),
        imap_tls: wire.config.tls,
        imap_insecure_skip_verify: wire.config.insecure_skip_verify,
        imap_read_only: wire.config.read_only,
        poll_interval_seconds: wire.poll_interval_seconds.max(1) as i32,
        extract_caller_regex: wire.extract_caller_regexp.clone().filter(|r| !r.is_empty()),
        extract_target_regex: wire.extract_target_regexp.clone().filter(|r| !r.is_empty()),
        notification_settings: json!(wire.notification_settings),
    })
}

fn mailbox_changeset_from_wire(wire: &MailboxWire) -> AppResult<mailbox_store::MailboxChangeset> {
    let new = new_mailbox_from_wire(wire)?;

    Ok(mailbox_store::MailboxChangeset {
        display_name: new.display_name,
        imap_host: new.imap_host,
        imap_folder: new.imap_folder,
        imap_user: new.imap_user,
        imap_password: new.imap_password,
        imap_tls: new.imap_tls,
        imap_insecure_skip_verify: new.imap_insecure_skip_verify,
        imap_read_only: new.imap_read_only,
        poll_interval_seconds: new.poll_interval_seconds,
        extract_caller_regex: new.extract_caller_regex,
        extract_target_regex: new.extract_target_regex,
    })
}

/// Notification templates must render with the `count`/`name` context.
fn validate_notification_setting(setting: &NotificationSettings) -> AppResult<()> {
    if setting.name.is_empty() {
        return Err(AppError::invalid_argument(
            "notification-setting name must not be empty",
        ));
    }

    let env = Environment::new();
    env.template_from_str(&setting.subject_template)
        .map_err(|err| AppError::invalid_argument(format!("invalid subject template: {err}")))?;
    env.template_from_str(&setting.message_template)
        .map_err(|err| AppError::invalid_argument(format!("invalid message template: {err}")))?;

    Ok(())
}

fn parse_id(raw: &str) -> AppResult<Uuid> {
    raw.parse()
        .map_err(|_| AppError::invalid_argument(format!("invalid id: {raw:?}")))
}

/// Applies the requested field-mask view to a response by pruning the
/// serialized payload to the listed (dotted) paths.
fn apply_view<T: serde::Serialize>(response: &T, view: &Option<ResponseView>) -> Json<Value> {
    let mut value = serde_json::to_value(response).unwrap_or(Value::Null);

    if let Some(mask) = view.as_ref().and_then(|view| view.field_mask.as_ref()) {
        if !mask.paths.is_empty() {
            let paths: Vec<Vec<&str>> = mask.paths.iter().map(|p| p.split('.').collect()).collect();
            prune(&mut value, &paths);
        }
    }

    Json(value)
}

fn prune(value: &mut Value, paths: &[Vec<&str>]) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| paths.iter().any(|path| path.first() == Some(&key.as_str())));

            for (key, child) in map.iter_mut() {
                // a path ending at this key keeps the whole subtree
                let keep_whole = paths
                    .iter()
                    .any(|path| path.len() == 1 && path[0] == key.as_str());
                if keep_whole {
                    continue;
                }

                let rest: Vec<Vec<&str>> = paths
                    .iter()
                    .filter(|path| path.first() == Some(&key.as_str()))
                    .map(|path| path[1..].to_vec())
                    .collect();

                prune(child, &rest);
            }
        }
        Value::Array(items) => {
            for item in items {
                prune(item, paths);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prunes_to_the_requested_paths() {
        let mut value = json!({
            "voicemails": [
                { "id": "a", "subject": "s", "message": "m" },
                { "id": "b", "subject": "t", "message": "n" },
            ],
            "customers": [{ "id": "c" }],
        });

        let paths = vec![vec!["voicemails", "id"], vec!["voicemails", "subject"]];
        prune(&mut value, &paths);

        assert_eq!(
            value,
            json!({
                "voicemails": [
                    { "id": "a", "subject": "s" },
                    { "id": "b", "subject": "t" },
                ],
            })
        );
    }

    #[test]
    fn single_segment_path_keeps_the_subtree() {
        let mut value = json!({
            "voicemail": { "id": "a", "subject": "s" },
            "other": true,
        });

        prune(&mut value, &[vec!["voicemail"]]);

        assert_eq!(value, json!({ "voicemail": { "id": "a", "subject": "s" } }));
    }
}
