//! Answers the PBX's "who should we ring right now" question by
//! combining the overwrite journal, the roster service and the identity
//! profiles.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, warn};

use crate::api::{GetOnCallResponse, OnCall, Profile};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult, ErrorCode};
use crate::models::Overwrite;
use crate::state::AppState;
use crate::stores::overwrites;

/// Resolves the on-call response for `at`.
///
/// An active overwrite wins unless explicitly ignored; otherwise the
/// roster service provides the working staff whose profiles yield the
/// transfer targets. The first entry becomes the primary target.
pub async fn resolve_on_call_target(
    state: &AppState,
    at: DateTime<Utc>,
    ignore_overwrites: bool,
    inbound_number: &str,
) -> AppResult<GetOnCallResponse> {
    let mut inbound_number = inbound_number.to_string();
    if inbound_number.is_empty() {
        inbound_number = state.config.default_inbound_number.clone();
    }

    let scope: Vec<String> = if inbound_number.is_empty() {
        Vec::new()
    } else {
        vec![inbound_number.clone()]
    };

    let overwrite = {
        let mut conn = state.db()?;
        overwrites::get_active_at(&mut conn, at, &scope).map_err(AppError::from)?
    };

    if let Some(overwrite) = overwrite {
        if !ignore_overwrites {
            let (target, profile) = resolve_overwrite_target(state, &overwrite).await?;

            return Ok(GetOnCallResponse {
                is_overwrite: true,
                on_call: vec![OnCall {
                    transfer_target: target.clone(),
                    profile,
                    until: Some(overwrite.to_time),
                }],
                primary_transfer_target: target,
                roster_date: None,
            });
        }
    }

    let mut roster_type_name = state.config.roster_type_name.clone();
    let mut shift_tags: Vec<String> = Vec::new();
    let mut result_limit = 0;

    if !inbound_number.is_empty() {
        let mut conn = state.db()?;
        match overwrites::get_inbound_number(&mut conn, &inbound_number) {
            Ok(model) => {
                if let Some(name) = model.roster_type_name.filter(|n| !n.is_empty()) {
                    roster_type_name = name;
                }
                shift_tags = model.roster_shift_tags;
                result_limit = model.result_limit;
            }
            Err(diesel::result::Error::NotFound) => {
                warn!(
                    inbound_number,
                    "no inbound-number record found, using the global roster type"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    let staff = state
        .roster
        .working_staff_at(at, &roster_type_name, &shift_tags)
        .await
        .map_err(|err| AppError::internal(format!("roster: {err}")))?;

    if staff.user_ids.is_empty() {
        return Err(AppError::new(
            ErrorCode::NotFound,
            format!("no roster defined for {at}"),
        ));
    }

    let mut response = GetOnCallResponse {
        is_overwrite: false,
        roster_date: staff.roster_date.clone(),
        ..Default::default()
    };

    for user_id in &staff.user_ids {
        if result_limit > 0 && response.on_call.len() >= result_limit as usize {
            break;
        }

        let profile = match state.idm.get_user(user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                error!(user_id, error = %err, "failed to fetch user profile");
                continue;
            }
        };

        let mut until: Option<DateTime<Utc>> = None;
        for shift in &staff.current_shifts {
            if !shift.assigned_user_ids.iter().any(|id| id == user_id) {
                continue;
            }
            if let Some(to) = shift.to {
                if until.map_or(true, |current| to < current) {
                    until = Some(to);
                }
            }
        }

        match user_transfer_target(&state.config, &profile) {
            Some(target) => response.on_call.push(OnCall {
                transfer_target: target,
                profile: Some(profile),
                until,
            }),
            None => {
                warn!(
                    user_id,
                    username = %profile.user.username,
                    "user marked as on-call but no transfer target available"
                );
            }
        }
    }

    if response.on_call.is_empty() {
        return Err(AppError::internal("roster: failed to determine on-call users"));
    }

    response.primary_transfer_target = response.on_call[0].transfer_target.clone();

    Ok(response)
}

/// Resolves the transfer target of an overwrite: the named user's
/// profile target, or the sanitized custom phone number.
pub async fn resolve_overwrite_target(
    state: &AppState,
    overwrite: &Overwrite,
) -> AppResult<(String, Option<Profile>)> {
    let mut target = overwrite.phone_number.clone().unwrap_or_default();
    let mut profile = None;

    if let Some(user_id) = overwrite
        .user_id
        .as_deref()
        .filter(|user_id| !user_id.is_empty())
    {
        let fetched = state
            .idm
            .get_user(user_id)
            .await
            .map_err(|err| AppError::internal(format!("failed to fetch user {user_id:?}: {err}")))?;

        target = user_transfer_target(&state.config, &fetched).unwrap_or_default();
        profile = Some(fetched);
    }

    let target = sanitize_transfer_target(&target).ok_or_else(|| {
        AppError::invalid_argument(format!(
            "invalid transfer target: expected a number but got {target:?}"
        ))
    })?;

    Ok((target, profile))
}

/// Strips separators from a dialable number and requires the remainder
/// to parse as an integer (with an optional leading '+').
pub fn sanitize_transfer_target(raw: &str) -> Option<String> {
    let target: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '/'))
        .collect();

    if target.is_empty() {
        return None;
    }

    let digits = target.strip_prefix('+').unwrap_or(&target);
    digits.parse::<i64>().ok()?;

    Some(target)
}

/// Walks the configured phone-extension keys through the profile's extra
/// attributes, accepting string and numeric values, and falls back to
/// the primary phone number.
pub fn user_transfer_target(config: &AppConfig, profile: &Profile) -> Option<String> {
    if let Some(extra) = profile.user.extra.as_ref().and_then(Value::as_object) {
        for key in &config.phone_extension_keys {
            match extra.get(key) {
                Some(Value::String(value)) if !value.is_empty() => return Some(value.clone()),
                Some(Value::Number(value)) => {
                    if let Some(value) = value.as_i64() {
                        return Some(value.to_string());
                    }
                    warn!(key, "unsupported numeric value for phone-extension key");
                }
                Some(Value::Null) | None => {}
                Some(_) => {
                    warn!(key, "unsupported value type for phone-extension key");
                }
            }
        }
    }

    profile
        .user
        .primary_phone_number
        .as_ref()
        .map(|phone| phone.number.clone())
        .filter(|number| !number.is_empty())
}

/// Resolves the user id behind an agent display string by matching the
/// primary phone number or the well-known extension attributes.
pub async fn user_id_for_agent(state: &AppState, agent: &str) -> Option<String> {
    let profiles = match state.idm.list_users().await {
        Ok(profiles) => profiles,
        Err(err) => {
            error!(error = %err, "failed to fetch users from identity service");
            return None;
        }
    };

    for profile in profiles {
        if let Some(number) = profile.user.primary_phone_number.as_ref() {
            if number.number == agent {
                return Some(profile.user.id);
            }
        }

        if let Some(extra) = profile.user.extra.as_ref().and_then(Value::as_object) {
            for key in ["phoneExtension", "emergencyExtension"] {
                if extra.get(key).and_then(Value::as_str) == Some(agent) {
                    return Some(profile.user.id);
                }
            }
        }
    }

    None
}
