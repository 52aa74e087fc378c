use std::sync::Arc;

use axum::extract::FromRef;
use axum::http::{HeaderMap, HeaderValue};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::state::AppState;
use crate::voicemail::SyncManager;

pub mod call;
pub mod extensions;
pub mod external;
pub mod health;
pub mod inbound;
pub mod voicemail;

/// Router state: the shared application state plus the voicemail sync
/// manager, which owns the live pollers.
#[derive(Clone)]
pub struct AppContext {
    pub state: AppState,
    pub manager: Arc<SyncManager>,
}

impl FromRef<AppContext> for AppState {
    fn from_ref(context: &AppContext) -> AppState {
        context.state.clone()
    }
}

pub fn create_router(context: AppContext) -> Router<()> {
    let origins = &context.state.config.allowed_origins;

    let cors = if origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    } else {
        let headers: Vec<HeaderValue> = origins
            .iter()
            .map(|origin| {
                origin
                    .parse::<HeaderValue>()
                    .expect("invalid CORS allowed origin")
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(headers))
            .allow_methods(tower_http::cors::AllowMethods::mirror_request())
            .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
            .allow_credentials(true)
    };

    let call_routes = Router::new()
        .route("/GetOnCall", post(call::get_on_call))
        .route("/CreateOverwrite", post(call::create_overwrite))
        .route("/DeleteOverwrite", post(call::delete_overwrite))
        .route("/GetOverwrite", post(call::get_overwrite))
        .route("/RecordCall", post(call::record_call))
        .route("/SearchCallLogs", post(call::search_call_logs))
        .route("/GetLogsForDate", post(call::get_logs_for_date))
        .route("/GetLogsForCustomer", post(call::get_logs_for_customer))
        .route("/CreateInboundNumber", post(inbound::create_inbound_number))
        .route("/UpdateInboundNumber", post(inbound::update_inbound_number))
        .route("/DeleteInboundNumber", post(inbound::delete_inbound_number))
        .route("/ListInboundNumber", post(inbound::list_inbound_numbers))
        .route(
            "/RegisterPhoneExtension",
            post(extensions::register_phone_extension),
        )
        .route(
            "/UpdatePhoneExtension",
            post(extensions::update_phone_extension),
        )
        .route(
            "/DeletePhoneExtension",
            post(extensions::delete_phone_extension),
        )
        .route(
            "/ListPhoneExtensions",
            post(extensions::list_phone_extensions),
        );

    let voicemail_routes = Router::new()
        .route("/CreateMailbox", post(voicemail::create_mailbox))
        .route("/ListMailboxes", post(voicemail::list_mailboxes))
        .route("/DeleteMailbox", post(voicemail::delete_mailbox))
        .route("/UpdateMailbox", post(voicemail::update_mailbox))
        .route("/ListVoiceMails", post(voicemail::list_voicemails))
        .route("/SearchVoiceMails", post(voicemail::search_voicemails))
        .route("/GetVoiceMail", post(voicemail::get_voicemail))
        .route("/MarkVoiceMails", post(voicemail::mark_voicemails));

    Router::new()
        .nest("/tkd.pbx3cx.v1.CallService", call_routes)
        .nest("/tkd.pbx3cx.v1.VoiceMailService", voicemail_routes)
        .route("/api/external/v1/calllog", get(external::ingest_call_log))
        .route("/voicemails/", get(external::serve_recording))
        .route("/api/health", get(health::health_check))
        .with_state(context)
        .layer(cors)
}

/// The authenticated user forwarded by the ingress proxy.
pub(crate) fn remote_user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-remote-user-id")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
