//! The plain-HTTP surface used by the PBX itself: unidentified call
//! ingestion and recording playback.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::NewCallLog;
use crate::phone::ANONYMOUS;
use crate::state::AppState;
use crate::stores::{call_logs, mailboxes as mailbox_store};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IngestCallLogQuery {
    pub ani: String,
    pub did: String,
    #[serde(rename = "transferTo")]
    pub transfer_to: String,
    pub from: String,
    #[serde(rename = "callID")]
    pub call_id: String,
    pub error: String,
}

/// Records the transfer event of an inbound call before the customer is
/// known. The PBX only cares that we heard it, so the record is written
/// asynchronously and the request completes immediately.
pub async fn ingest_call_log(
    State(state): State<AppState>,
    Query(query): Query<IngestCallLogQuery>,
) -> StatusCode {
    let mut record = NewCallLog {
        caller: query.ani.clone(),
        inbound_number: some_if_not_empty(&query.did),
        transfer_target: some_if_not_empty(&query.transfer_to),
        transfer_from: some_if_not_empty(&query.from),
        call_id: some_if_not_empty(&query.call_id),
        direction: Some("Inbound".to_string()),
        date: chrono::Utc::now(),
        ..Default::default()
    };

    if !query.error.is_empty() {
        match query.error.parse::<bool>() {
            Ok(value) => record.error = value,
            Err(err) => {
                error!(value = %query.error, error = %err, "failed to parse error parameter");
            }
        }
    }

    tokio::spawn(async move {
        if !record.caller.eq_ignore_ascii_case(ANONYMOUS) && !record.caller.is_empty() {
            info!(caller = %record.caller, "trying to get customer for number");

            match state.customer.search_by_phone(&[record.caller.clone()]).await {
                Ok(customers) => match customers.first() {
                    Some(customer) => {
                        info!(
                            customer_id = %customer.id,
                            "identified caller {} {}",
                            customer.first_name,
                            customer.last_name
                        );
                        record.customer_id = Some(customer.id.clone());

                        if customers.len() > 1 {
                            warn!(
                                caller = %record.caller,
                                "found multiple customer records for caller number, using first one"
                            );
                        }
                    }
                    None => {
                        warn!(caller = %record.caller, "failed to find customer record for phone number");
                    }
                },
                Err(err) => {
                    error!(caller = %record.caller, error = %err, "failed to search customer records");
                }
            }
        } else {
            info!(caller = %record.caller, "unspecified caller, not searching for records");
        }

        let region = state.config.country;
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = state
                .db()
                .map_err(|err| format!("database pool error: {err}"))?;
            call_logs::create_unidentified(&mut conn, record, region).map_err(|err| err.to_string())
        })
        .await;

        match result {
            Ok(Ok(stored)) => {
                info!(caller = %stored.caller, id = %stored.id, "successfully created unidentified call log entry");
            }
            Ok(Err(err)) => {
                error!(error = %err, "failed to create unidentified call-log entry");
            }
            Err(join_err) => {
                error!(error = %join_err, "call-log task panicked");
            }
        }
    });

    StatusCode::NO_CONTENT
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServeRecordingQuery {
    pub id: String,
}

/// Streams a voicemail recording with the content type inferred from
/// the stored file path.
pub async fn serve_recording(
    State(state): State<AppState>,
    Query(query): Query<ServeRecordingQuery>,
) -> Response {
    if query.id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            "invalid or missing voicemail recording id",
        )
            .into_response();
    }

    let Ok(id) = query.id.parse::<Uuid>() else {
        return (
            StatusCode::BAD_REQUEST,
            "invalid or missing voicemail recording id",
        )
            .into_response();
    };

    info!(%id, "searching voicemail record");

    let record = {
        let mut conn = match state.db() {
            Ok(conn) => conn,
            Err(err) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
            }
        };

        match mailbox_store::get_voicemail(&mut conn, id) {
            Ok(record) => record,
            Err(diesel::result::Error::NotFound) => {
                return (StatusCode::NOT_FOUND, "voicemail recording not found").into_response();
            }
            Err(err) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
            }
        }
    };

    info!(%id, filename = %record.file_name, "found voicemail recording");

    let file = match tokio::fs::File::open(&record.file_name).await {
        Ok(file) => file,
        Err(err) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
        }
    };

    let content_type = mime_guess::from_path(&record.file_name)
        .first_or_octet_stream()
        .to_string();

    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(body)
        .unwrap_or_else(|err| {
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        })
}

fn some_if_not_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
