use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{
    CallEntry, CustomOverwrite, Customer, GetOnCallResponse, OverwriteCreatedEvent,
    OverwriteDeletedEvent, OverwriteWire, SendNotificationRequest, Sms,
};
use crate::clients::idm::SUPERUSER_ROLE;
use crate::error::{AppError, AppResult};
use crate::events;
use crate::models::{NewCallLog, NewOverwrite, Overwrite};
use crate::oncall::{resolve_on_call_target, resolve_overwrite_target, user_id_for_agent};
use crate::state::AppState;
use crate::stores::{call_logs, overwrites};

use super::remote_user_id;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetOnCallRequest {
    pub date: String,
    pub ignore_overwrites: bool,
    pub inbound_number: String,
}

pub async fn get_on_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GetOnCallRequest>,
) -> AppResult<Json<GetOnCallResponse>> {
    let at = if request.date.is_empty() {
        Utc::now()
    } else {
        DateTime::parse_from_rfc3339(&request.date)
            .map_err(|err| {
                AppError::invalid_argument(format!(
                    "invalid value for date: {:?}: {err}",
                    request.date
                ))
            })?
            .with_timezone(&Utc)
    };

    // "who is on call right now" is served from the cache when one is
    // populated for the inbound number
    if request.date.is_empty() && !request.ignore_overwrites {
        let number = if request.inbound_number.is_empty() {
            state.config.default_inbound_number.clone()
        } else {
            request.inbound_number.clone()
        };

        if let Some(cache) = state.caches.get(&number) {
            if let Some(cached) = cache.current().await {
                state.error_gate.reset();
                return Ok(Json(cached));
            }
        }
    }

    match resolve_on_call_target(&state, at, request.ignore_overwrites, &request.inbound_number)
        .await
    {
        Ok(response) => {
            state.error_gate.reset();
            Ok(Json(response))
        }
        Err(err) => handle_on_call_error(&state, remote_user_id(&headers), err),
    }
}

/// Failure policy of the on-call query: notify the superusers once per
/// failure streak and fall back to the configured failover target so the
/// PBX always has a number to dial.
fn handle_on_call_error(
    state: &AppState,
    remote_user: Option<String>,
    err: AppError,
) -> AppResult<Json<GetOnCallResponse>> {
    if state.error_gate.acquire() {
        let state = state.clone();
        let message = format!("failed to get on-call target: {err}");
        tokio::spawn(async move {
            if let Err(notify_err) =
                send_notification_to_admins(&state, remote_user, &message).await
            {
                error!(error = %notify_err, "failed to send error notification");
                // allow another attempt on the next failure
                state.error_gate.reset();
            }
        });
    }

    if let Some(failover) = state.config.failover_transfer_target.clone() {
        error!(
            failover_target = failover,
            error = %err,
            "failed to get on-call response, returning failover target"
        );

        return Ok(Json(GetOnCallResponse {
            primary_transfer_target: failover,
            ..Default::default()
        }));
    }

    Err(err)
}

async fn send_notification_to_admins(
    state: &AppState,
    remote_user: Option<String>,
    message: &str,
) -> anyhow::Result<()> {
    let admins = state.idm.list_users_by_role(SUPERUSER_ROLE).await?;
    if admins.is_empty() {
        anyhow::bail!("failed to determine users with the {SUPERUSER_ROLE} role");
    }

    let ids: Vec<String> = admins.into_iter().map(|profile| profile.user.id).collect();
    let target_count = ids.len();

    let response = state
        .idm
        .send_notification(&SendNotificationRequest {
            sender_user_id: remote_user.unwrap_or_default(),
            target_users: ids,
            sms: Some(Sms {
                body: message.to_string(),
            }),
            ..Default::default()
        })
        .await?;

    let failed = response
        .deliveries
        .iter()
        .filter(|delivery| delivery.error_kind != crate::api::ErrorKind::Unspecified)
        .count();

    if failed == target_count && target_count > 0 {
        anyhow::bail!("failed to notify any {SUPERUSER_ROLE} user");
    }

    Ok(())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateOverwriteRequest {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub custom: Option<CustomOverwrite>,
    pub inbound_number: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOverwriteResponse {
    pub overwrite: OverwriteWire,
}

pub async fn create_overwrite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateOverwriteRequest>,
) -> AppResult<Json<CreateOverwriteResponse>> {
    let remote_user =
        remote_user_id(&headers).ok_or_else(|| AppError::internal("missing remote user"))?;

    let from = request
        .from
        .ok_or_else(|| AppError::invalid_argument("missing from field"))?;
    let to = request
        .to
        .ok_or_else(|| AppError::invalid_argument("missing to field"))?;

    if to <= from {
        return Err(AppError::invalid_argument("invalid time range"));
    }

    let (user_id, phone_number, display_name) = match (&request.user_id, &request.custom) {
        (Some(user_id), None) if !user_id.is_empty() => (Some(user_id.clone()), None, None),
        (None, Some(custom)) => (
            None,
            Some(custom.transfer_target.clone()),
            Some(custom.display_name.clone()),
        ),
        _ => {
            return Err(AppError::invalid_argument(
                "invalid or unsupported transfer_target",
            ))
        }
    };

    let mut model = Overwrite {
        id: Uuid::new_v4(),
        from_time: from,
        to_time: to,
        user_id,
        phone_number,
        display_name,
        inbound_number: if request.inbound_number.is_empty() {
            None
        } else {
            Some(request.inbound_number.clone())
        },
        created_by: remote_user.clone(),
        created_at: Utc::now(),
        deleted: false,
    };

    // the overwrite must resolve to a dialable target before it is
    // accepted
    let (target, _) = resolve_overwrite_target(&state, &model).await.map_err(|_| {
        AppError::invalid_argument("overwrite does not have a valid target phone number")
    })?;

    if model.phone_number.is_some() {
        model.phone_number = Some(target.clone());
        model.display_name = Some(target.clone());
    }

    let stored = {
        let mut conn = state.db()?;
        overwrites::create(
            &mut conn,
            NewOverwrite {
                id: model.id,
                from_time: model.from_time,
                to_time: model.to_time,
                user_id: model.user_id.clone(),
                phone_number: model.phone_number.clone(),
                display_name: model.display_name.clone(),
                inbound_number: model.inbound_number.clone(),
                created_by: model.created_by.clone(),
                created_at: model.created_at,
            },
        )
        .map_err(AppError::from)?
    };

    {
        let state = state.clone();
        let scope = stored
            .inbound_number
            .clone()
            .unwrap_or_else(|| "all numbers".to_string());
        let message = format!(
            "User {} created a new overwrite for {} to {} from {} to {}",
            remote_user,
            scope,
            target,
            stored.from_time.with_timezone(&Local).to_rfc3339(),
            stored.to_time.with_timezone(&Local).to_rfc3339(),
        );
        let sender = remote_user.clone();
        tokio::spawn(async move {
            if let Err(err) = send_notification_to_admins(&state, Some(sender), &message).await {
                error!(error = %err, "failed to send overwrite creation notice");
            }
        });
    }

    state.caches.trigger_all();

    state.events.publish(
        events::OVERWRITE_CREATED,
        &OverwriteCreatedEvent {
            overwrite: stored.to_wire(),
        },
        false,
    );

    Ok(Json(CreateOverwriteResponse {
        overwrite: stored.to_wire(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundNumberList {
    pub numbers: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteOverwriteRequest {
    pub overwrite_id: Option<String>,
    pub active_at: Option<DateTime<Utc>>,
    pub inbound_numbers: Option<InboundNumberList>,
}

pub async fn delete_overwrite(
    State(state): State<AppState>,
    Json(request): Json<DeleteOverwriteRequest>,
) -> AppResult<Json<Value>> {
    let numbers = request
        .inbound_numbers
        .map(|list| list.numbers)
        .unwrap_or_default();

    let deleted = {
        let mut conn = state.db()?;

        match (&request.overwrite_id, request.active_at) {
            (Some(id), None) => {
                let id = parse_id(id)?;
                overwrites::soft_delete(&mut conn, id).map_err(AppError::from)?
            }
            (None, Some(at)) => {
                overwrites::soft_delete_active_at(&mut conn, at, &numbers).map_err(AppError::from)?
            }
            _ => {
                return Err(AppError::invalid_argument("invalid or unsupported selector"));
            }
        }
    };

    state.caches.trigger_all();

    state.events.publish(
        events::OVERWRITE_DELETED,
        &OverwriteDeletedEvent {
            overwrite: deleted.to_wire(),
        },
        false,
    );

    Ok(Json(json!({})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetOverwriteRequest {
    pub overwrite_id: Option<String>,
    pub active_at: Option<DateTime<Utc>>,
    pub time_range: Option<TimeRange>,
    pub inbound_numbers: Option<InboundNumberList>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetOverwriteResponse {
    pub overwrites: Vec<OverwriteWire>,
}

pub async fn get_overwrite(
    State(state): State<AppState>,
    Json(request): Json<GetOverwriteRequest>,
) -> AppResult<Json<GetOverwriteResponse>> {
    let numbers = request
        .inbound_numbers
        .map(|list| list.numbers)
        .unwrap_or_default();

    let mut conn = state.db()?;

    let results: Vec<Overwrite> = match (&request.overwrite_id, request.active_at, &request.time_range)
    {
        (Some(id), None, None) => {
            let id = parse_id(id)?;
            let overwrite = overwrites::get(&mut conn, id).map_err(AppError::from)?;

            // deleted overwrites are not addressable here
            if overwrite.deleted {
                return Err(AppError::not_found());
            }

            vec![overwrite]
        }
        (None, Some(at), None) => {
            let overwrite = overwrites::get_active_at(&mut conn, at, &numbers)
                .map_err(AppError::from)?
                .ok_or_else(AppError::not_found)?;

            vec![overwrite]
        }
        (None, None, Some(range)) => {
            if let (Some(from), Some(to)) = (range.from, range.to) {
                if to <= from {
                    return Err(AppError::invalid_argument("invalid time_range value"));
                }
            }

            overwrites::list_between(&mut conn, range.from, range.to, false, &numbers)
                .map_err(AppError::from)?
        }
        _ => {
            return Err(AppError::invalid_argument("invalid or unsupported selector"));
        }
    };

    Ok(Json(GetOverwriteResponse {
        overwrites: results.iter().map(Overwrite::to_wire).collect(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordCallRequest {
    pub number: String,
    pub agent: String,
    pub call_type: String,
    pub duration: String,
    pub date_time: String,
    pub customer_id: String,
    pub customer_source: String,
    pub queue_extension: String,
    pub direction: String,
}

pub async fn record_call(
    State(state): State<AppState>,
    Json(request): Json<RecordCallRequest>,
) -> AppResult<Json<Value>> {
    let duration_seconds = if request.duration.is_empty() {
        None
    } else {
        let parsed = request.duration.parse::<i64>().map_err(|err| {
            AppError::invalid_argument(format!(
                "invalid value for duration: {:?}: {err}",
                request.duration
            ))
        })?;

        (parsed > 0).then_some(parsed)
    };

    let naive = NaiveDateTime::parse_from_str(&request.date_time, "%d.%m.%Y %H:%M")
        .map_err(|err| AppError::invalid_argument(format!("invalid value for date-time: {err}")))?;
    let date = Local
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| AppError::invalid_argument("invalid value for date-time"))?
        .with_timezone(&Utc);

    let agent_user_id = user_id_for_agent(&state, &request.agent).await;

    let record = NewCallLog {
        caller: request.number.clone(),
        agent: some_if_not_empty(&request.agent),
        agent_user_id,
        call_type: some_if_not_empty(&request.call_type),
        customer_id: some_if_not_empty(&request.customer_id),
        customer_source: some_if_not_empty(&request.customer_source),
        queue_extension: some_if_not_empty(&request.queue_extension),
        direction: some_if_not_empty(&request.direction),
        duration_seconds,
        date,
        ..Default::default()
    };

    let mut conn = state.db()?;
    call_logs::record_customer_call(&mut conn, record, state.config.country)
        .map_err(AppError::from)?;

    Ok(Json(json!({})))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomerRef {
    pub source: String,
    pub id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchCallLogsRequest {
    pub customer_ref: Option<CustomerRef>,
    pub time_range: Option<TimeRange>,
    pub date: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCallLogsResponse {
    pub results: Vec<CallEntry>,
    pub customers: Vec<Customer>,
}

pub async fn search_call_logs(
    State(state): State<AppState>,
    Json(request): Json<SearchCallLogsRequest>,
) -> AppResult<Json<SearchCallLogsResponse>> {
    let mut query = call_logs::SearchQuery::default();

    if let Some(customer_ref) = &request.customer_ref {
        query = query.customer(customer_ref.id.clone());
        if !customer_ref.source.is_empty() {
            query.customer_source = Some(customer_ref.source.clone());
        }
    }

    if let Some(range) = &request.time_range {
        match (range.from, range.to) {
            (Some(from), Some(to)) => query = query.between(from, to),
            (Some(from), None) => query = query.after(from),
            (None, Some(to)) => query = query.before(to),
            (None, None) => {}
        }
    } else if !request.date.is_empty() {
        let date = chrono::NaiveDate::parse_from_str(&request.date, "%Y-%m-%d")
            .map_err(|err| AppError::invalid_argument(format!("invalid value for date: {err}")))?;
        query = query.at_date_string(date.format("%Y-%m-%d").to_string());
    }

    let results = {
        let mut conn = state.db()?;
        call_logs::search(&mut conn, &query).map_err(AppError::from)?
    };

    let customers = collect_customers_for_entries(&state, &results).await;

    Ok(Json(SearchCallLogsResponse {
        results: results.iter().map(|record| record.to_entry()).collect(),
        customers,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetLogsForDateRequest {
    pub date: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLogListResponse {
    pub results: Vec<CallEntry>,
}

pub async fn get_logs_for_date(
    State(state): State<AppState>,
    Json(request): Json<GetLogsForDateRequest>,
) -> AppResult<Json<CallLogListResponse>> {
    let date = chrono::NaiveDate::parse_from_str(&request.date, "%Y-%m-%d")
        .map_err(|err| AppError::invalid_argument(format!("invalid value for date: {err}")))?;

    let query = call_logs::SearchQuery::default().at_date_string(date.format("%Y-%m-%d").to_string());

    let mut conn = state.db()?;
    let results = call_logs::search(&mut conn, &query).map_err(AppError::from)?;

    Ok(Json(CallLogListResponse {
        results: results.iter().map(|record| record.to_entry()).collect(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetLogsForCustomerRequest {
    pub id: String,
}

pub async fn get_logs_for_customer(
    State(state): State<AppState>,
    Json(request): Json<GetLogsForCustomerRequest>,
) -> AppResult<Json<CallLogListResponse>> {
    let query = call_logs::SearchQuery::default().customer(request.id);

    let mut conn = state.db()?;
    let results = call_logs::search(&mut conn, &query).map_err(AppError::from)?;

    Ok(Json(CallLogListResponse {
        results: results.iter().map(|record| record.to_entry()).collect(),
    }))
}

async fn collect_customers_for_entries(
    state: &AppState,
    records: &[crate::models::CallLog],
) -> Vec<Customer> {
    let mut ids: Vec<String> = records
        .iter()
        .filter_map(|record| record.customer_id.clone())
        .filter(|id| !id.is_empty())
        .collect();
    ids.sort();
    ids.dedup();

    if ids.is_empty() {
        return Vec::new();
    }

    match state.customer.search_by_ids(&ids).await {
        Ok(customers) => {
            info!(count = customers.len(), "resolved customers for call-log results");
            customers
        }
        Err(err) => {
            warn!(error = %err, "failed to resolve customers for call-log results");
            Vec::new()
        }
    }
}

fn parse_id(raw: &str) -> AppResult<Uuid> {
    raw.parse()
        .map_err(|_| AppError::invalid_argument(format!("invalid id: {raw:?}")))
}

fn some_if_not_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
