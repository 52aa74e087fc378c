//! Turns parsed call-data-records into call-log entries and publishes
//! the ingestion event.

use tracing::error;

use crate::api::CallRecordReceived;
use crate::events;
use crate::models::NewCallLog;
use crate::oncall::user_id_for_agent;
use crate::state::AppState;
use crate::stores::call_logs;

use super::{default_field_order, split_line, Field, Record};

#[derive(Clone)]
pub struct CdrProcessor {
    state: AppState,
    order: std::sync::Arc<Vec<Field>>,
}

impl CdrProcessor {
    pub fn new(state: AppState, order: Option<Vec<Field>>) -> Self {
        Self {
            state,
            order: std::sync::Arc::new(order.unwrap_or_else(default_field_order)),
        }
    }

    /// Handles one CSV line. Failures are logged; a bad record never
    /// stops the connection loop.
    pub async fn process_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }

        let columns = split_line(line);
        let record = match Record::from_columns(&columns, &self.order) {
            Ok(record) => record,
            Err(err) => {
                error!(error = %err, data = line, "failed to convert call-data-record");
                return;
            }
        };

        let mut call = synthesize_call_log(&record);
        if let Some(agent) = call.agent.clone() {
            call.agent_user_id = user_id_for_agent(&self.state, &agent).await;
        }

        let state = self.state.clone();
        let region = state.config.country;
        let stored = tokio::task::spawn_blocking(move || {
            let mut conn = state
                .db()
                .map_err(|err| format!("database pool error: {err}"))?;
            call_logs::record_customer_call(&mut conn, call, region).map_err(|err| err.to_string())
        })
        .await;

        let stored = match stored {
            Ok(Ok(stored)) => stored,
            Ok(Err(err)) => {
                error!(error = %err, data = line, "failed to process call-data-record");
                return;
            }
            Err(join_err) => {
                error!(error = %join_err, "call-data-record task panicked");
                return;
            }
        };

        self.state.events.publish(
            events::CALL_RECORD_RECEIVED,
            &CallRecordReceived {
                call_entry: stored.to_entry(),
            },
            false,
        );
    }
}

/// Synthesizes the call-log entry from a CDR record. The agent user id
/// is resolved separately.
fn synthesize_call_log(record: &Record) -> NewCallLog {
    let mut call = NewCallLog {
        date: record.time_received.unwrap_or_else(chrono::Utc::now),
        call_id: some_if_not_empty(&record.call_id),
        // a zero duration is stored as "absent" so the record stays
        // eligible for the customer-tagged merge
        duration_seconds: (record.duration_seconds > 0).then_some(record.duration_seconds),
        from_type: some_if_not_empty(&record.from_type),
        to_type: some_if_not_empty(&record.final_type),
        chain: some_if_not_empty(&record.chain),
        ..Default::default()
    };

    if record.inbound() {
        call.caller = record.from_number.clone();
        call.direction = Some("Inbound".to_string());
        call.inbound_number = some_if_not_empty(&record.dial_number);
        call.agent = some_if_not_empty(strip_extension_prefix(&record.final_number));
        call.call_type = Some(if record.answered() { "Inbound" } else { "Missed" }.to_string());
    } else {
        call.caller = record.dial_number.clone();
        call.direction = Some("Outbound".to_string());
        call.agent = some_if_not_empty(strip_extension_prefix(&record.from_number));
        call.call_type = Some(
            if record.answered() {
                "Outbound"
            } else {
                "NotAnswered"
            }
            .to_string(),
        );
    }

    call
}

fn strip_extension_prefix(number: &str) -> &str {
    number.strip_prefix("Ext.").unwrap_or(number)
}

fn some_if_not_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
