use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::InboundNumberWire;
use crate::error::{AppError, AppResult};
use crate::models::InboundNumber;
use crate::state::AppState;
use crate::stores::overwrites;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateInboundNumberRequest {
    pub number: String,
    pub display_name: String,
    pub roster_type_name: String,
    pub roster_shift_tags: Vec<String>,
    pub result_limit: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundNumberResponse {
    pub inbound_number: InboundNumberWire,
}

pub async fn create_inbound_number(
    State(state): State<AppState>,
    Json(request): Json<CreateInboundNumberRequest>,
) -> AppResult<Json<InboundNumberResponse>> {
    if request.number.is_empty() {
        return Err(AppError::invalid_argument("number must not be empty"));
    }

    let model = InboundNumber {
        number: request.number,
        display_name: request.display_name,
        roster_type_name: if request.roster_type_name.is_empty() {
            None
        } else {
            Some(request.roster_type_name)
        },
        roster_shift_tags: request.roster_shift_tags,
        result_limit: request.result_limit,
    };

    let mut conn = state.db()?;
    overwrites::create_inbound_number(&mut conn, &model).map_err(AppError::from)?;

    Ok(Json(InboundNumberResponse {
        inbound_number: model.to_wire(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldMask {
    pub paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateInboundNumberRequest {
    pub number: String,
    pub new_display_name: String,
    pub roster_type_name: String,
    pub roster_shift_tags: Vec<String>,
    pub update_mask: Option<FieldMask>,
}

pub async fn update_inbound_number(
    State(state): State<AppState>,
    Json(request): Json<UpdateInboundNumberRequest>,
) -> AppResult<Json<InboundNumberResponse>> {
    let mut conn = state.db()?;

    let mut model =
        overwrites::get_inbound_number(&mut conn, &request.number).map_err(AppError::from)?;

    let default_paths = vec![
        "display_name".to_string(),
        "roster_shift_tags".to_string(),
        "roster_type_name".to_string(),
    ];
    let paths = match request.update_mask {
        Some(mask) if !mask.paths.is_empty() => mask.paths,
        _ => default_paths,
    };

    for path in &paths {
        match path.as_str() {
            "display_name" => model.display_name = request.new_display_name.clone(),
            "roster_shift_tags" => model.roster_shift_tags = request.roster_shift_tags.clone(),
            "roster_type_name" => {
                model.roster_type_name = if request.roster_type_name.is_empty() {
                    None
                } else {
                    Some(request.roster_type_name.clone())
                }
            }
            other => {
                return Err(AppError::invalid_argument(format!(
                    "invalid path in update_mask: {other:?}"
                )));
            }
        }
    }

    overwrites::update_inbound_number(&mut conn, &model).map_err(AppError::from)?;

    Ok(Json(InboundNumberResponse {
        inbound_number: model.to_wire(),
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteInboundNumberRequest {
    pub number: String,
}

pub async fn delete_inbound_number(
    State(state): State<AppState>,
    Json(request): Json<DeleteInboundNumberRequest>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;
    overwrites::delete_inbound_number(&mut conn, &request.number).map_err(AppError::from)?;

    Ok(Json(json!({})))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListInboundNumberResponse {
    pub inbound_numbers: Vec<InboundNumberWire>,
}

pub async fn list_inbound_numbers(
    State(state): State<AppState>,
) -> AppResult<Json<ListInboundNumberResponse>> {
    let mut conn = state.db()?;
    let numbers = overwrites::list_inbound_numbers(&mut conn).map_err(AppError::from)?;

    Ok(Json(ListInboundNumberResponse {
        inbound_numbers: numbers.iter().map(InboundNumber::to_wire).collect(),
    }))
}
