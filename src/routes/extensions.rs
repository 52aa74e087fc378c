use axum::extract::State;
use axum::Json;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::PhoneExtensionWire;
use crate::error::{AppError, AppResult};
use crate::models::PhoneExtension;
use crate::schema::phone_extensions;
use crate::state::AppState;

use super::inbound::FieldMask;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterPhoneExtensionRequest {
    pub phone_extension: PhoneExtensionWire,
}

pub async fn register_phone_extension(
    State(state): State<AppState>,
    Json(request): Json<RegisterPhoneExtensionRequest>,
) -> AppResult<Json<PhoneExtensionWire>> {
    let wire = request.phone_extension;
    if wire.extension.is_empty() {
        return Err(AppError::invalid_argument("extension must not be empty"));
    }

    let model = PhoneExtension {
        extension: wire.extension,
        display_name: wire.display_name,
        eligible_for_overwrite: wire.eligible_for_overwrite,
        internal_queue: wire.internal_queue,
    };

    let mut conn = state.db()?;
    diesel::insert_into(phone_extensions::table)
        .values(&model)
        .execute(&mut conn)
        .map_err(AppError::from)?;

    Ok(Json(model.to_wire()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdatePhoneExtensionRequest {
    pub extension: String,
    pub phone_extension: Option<PhoneExtensionWire>,
    pub update_mask: Option<FieldMask>,
}

pub async fn update_phone_extension(
    State(state): State<AppState>,
    Json(request): Json<UpdatePhoneExtensionRequest>,
) -> AppResult<Json<PhoneExtensionWire>> {
    let update = request
        .phone_extension
        .ok_or_else(|| AppError::invalid_argument("phone_extension must not be nil"))?;

    let mut conn = state.db()?;

    let mut model: PhoneExtension = phone_extensions::table
        .find(&request.extension)
        .first(&mut conn)
        .map_err(AppError::from)?;

    let default_paths = vec![
        "extension".to_string(),
        "display_name".to_string(),
        "eligible_for_overwrite".to_string(),
        "internal_queue".to_string(),
    ];
    let paths = match request.update_mask {
        Some(mask) if !mask.paths.is_empty() => mask.paths,
        _ => default_paths,
    };

    for path in &paths {
        match path.as_str() {
            "extension" => {
                if update.extension.is_empty() {
                    return Err(AppError::invalid_argument("extension must not be empty"));
                }
                model.extension = update.extension.clone();
            }
            "display_name" => {
                if update.display_name.is_empty() {
                    return Err(AppError::invalid_argument("display_name must not be empty"));
                }
                model.display_name = update.display_name.clone();
            }
            "eligible_for_overwrite" => model.eligible_for_overwrite = update.eligible_for_overwrite,
            "internal_queue" => model.internal_queue = update.internal_queue,
            other => {
                return Err(AppError::invalid_argument(format!(
                    "invalid field name {other:?} in update_mask"
                )));
            }
        }
    }

    if model.extension == request.extension {
        diesel::update(phone_extensions::table.find(&request.extension))
            .set(&model)
            .execute(&mut conn)
            .map_err(AppError::from)?;
    } else {
        // renaming moves the row to a new primary key
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(phone_extensions::table)
                .values(&model)
                .execute(conn)?;
            diesel::delete(phone_extensions::table.find(&request.extension)).execute(conn)?;
            Ok(())
        })
        .map_err(AppError::from)?;
    }

    Ok(Json(model.to_wire()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeletePhoneExtensionRequest {
    pub extension: String,
}

pub async fn delete_phone_extension(
    State(state): State<AppState>,
    Json(request): Json<DeletePhoneExtensionRequest>,
) -> AppResult<Json<Value>> {
    let mut conn = state.db()?;

    let deleted = diesel::delete(phone_extensions::table.find(&request.extension))
        .execute(&mut conn)
        .map_err(AppError::from)?;

    if deleted == 0 {
        return Err(AppError::not_found());
    }

    Ok(Json(json!({})))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPhoneExtensionsResponse {
    pub phone_extensions: Vec<PhoneExtensionWire>,
}

pub async fn list_phone_extensions(
    State(state): State<AppState>,
) -> AppResult<Json<ListPhoneExtensionsResponse>> {
    let mut conn = state.db()?;

    let extensions: Vec<PhoneExtension> = phone_extensions::table
        .order(phone_extensions::extension.asc())
        .load(&mut conn)
        .map_err(AppError::from)?;

    Ok(Json(ListPhoneExtensionsResponse {
        phone_extensions: extensions.iter().map(PhoneExtension::to_wire).collect(),
    }))
}
