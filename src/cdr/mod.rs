//! Parsing of PBX call-data-records: line-oriented CSV with a
//! configurable field order, UTC timestamps and `HH:MM:SS` durations.

pub mod processor;
pub mod server;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};

pub use processor::CdrProcessor;

pub const TYPE_QUEUE: &str = "queue";
pub const TYPE_EXTENSION: &str = "extension";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    HistoryId,
    CallId,
    Duration,
    TimeStart,
    TimeAnswered,
    TimeEnd,
    ReasonTerminated,
    FromNumber,
    ToNumber,
    FromDn,
    ToDn,
    DialNumber,
    ReasonChanged,
    FinalNumber,
    FinalDn,
    BillCode,
    Chain,
    FinalType,
    FromType,
    ToType,
    FromDispName,
    ToDispName,
    FinalDispName,
}

pub fn default_field_order() -> Vec<Field> {
    use Field::*;

    vec![
        HistoryId,
        CallId,
        Duration,
        TimeStart,
        TimeAnswered,
        TimeEnd,
        ReasonTerminated,
        FromNumber,
        ToNumber,
        FromDn,
        ToDn,
        DialNumber,
        ReasonChanged,
        FinalNumber,
        FinalDn,
        BillCode,
        Chain,
        FinalType,
        FromType,
        ToType,
        FromDispName,
        ToDispName,
        FinalDispName,
    ]
}

#[derive(Debug, Clone, Default)]
pub struct Record {
    pub history_id: String,
    pub call_id: String,
    pub reason_terminated: String,
    pub time_received: Option<DateTime<Utc>>,
    pub time_answered: Option<DateTime<Utc>>,
    pub time_end: Option<DateTime<Utc>>,
    pub chain: String,
    pub duration_seconds: i64,
    pub dial_number: String,
    pub final_type: String,
    pub final_number: String,
    pub from_dn: String,
    pub from_type: String,
    pub from_number: String,
    pub to_dn: String,
    pub to_type: String,
    pub to_number: String,
}

impl Record {
    /// Builds a record from one CSV row using the given field order.
    pub fn from_columns(columns: &[&str], order: &[Field]) -> Result<Self> {
        if columns.len() != order.len() {
            bail!(
                "column and configuration order mismatch: column-count={} expected-count={}",
                columns.len(),
                order.len()
            );
        }

        let mut record = Record::default();

        for (value, field) in columns.iter().zip(order) {
            let value = *value;

            match field {
                Field::HistoryId => record.history_id = value.to_string(),
                Field::CallId => record.call_id = value.to_string(),
                Field::ReasonTerminated => record.reason_terminated = value.to_string(),
                Field::TimeStart => record.time_received = parse_time(value)?,
                Field::TimeAnswered => record.time_answered = parse_time(value)?,
                Field::TimeEnd => record.time_end = parse_time(value)?,
                Field::Duration => record.duration_seconds = parse_duration(value)?,
                Field::Chain => record.chain = value.to_string(),
                Field::DialNumber => record.dial_number = value.to_string(),
                Field::FinalType => record.final_type = value.to_string(),
                Field::FinalNumber => record.final_number = value.to_string(),
                Field::ToType => record.to_type = value.to_string(),
                Field::ToNumber => record.to_number = value.to_string(),
                Field::FromType => record.from_type = value.to_string(),
                Field::FromNumber => record.from_number = value.to_string(),
                // remaining fields are not needed for call records
                _ => {}
            }
        }

        Ok(record)
    }

    pub fn inbound(&self) -> bool {
        self.from_type != TYPE_EXTENSION
    }

    pub fn outbound(&self) -> bool {
        !self.inbound()
    }

    /// Whether the destination accepted the call. Inbound calls ending
    /// in a queue were not answered; an IVR still counts as answered
    /// since the caller chose not to proceed. Outbound calls rely on the
    /// time-answered field.
    pub fn answered(&self) -> bool {
        if self.inbound() {
            return self.final_type != TYPE_QUEUE;
        }

        self.time_answered.is_some()
    }
}

/// Parses `YYYY.MM.DD HH:MM:SS` in UTC; empty values map to `None`.
fn parse_time(value: &str) -> Result<Option<DateTime<Utc>>> {
    if value.is_empty() {
        return Ok(None);
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y.%m.%d %H:%M:%S")
        .with_context(|| format!("invalid timestamp {value:?}"))?;

    Ok(Some(naive.and_utc()))
}

/// Parses `HH:MM:SS` into seconds; empty values map to zero.
fn parse_duration(value: &str) -> Result<i64> {
    if value.is_empty() {
        return Ok(0);
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 3 {
        bail!("invalid duration {value:?}");
    }

    let parse = |part: &str| -> Result<i64> {
        part.parse::<i64>()
            .with_context(|| format!("invalid duration {value:?}"))
    };

    let hours = parse(parts[0])?;
    let minutes = parse(parts[1])?;
    let seconds = parse(parts[2])?;

    Ok(hours * 3600 + minutes * 60 + seconds)
}

/// Splits one CDR line into its CSV columns. The feed never quotes
/// fields, so a plain comma split is sufficient.
pub fn split_line(line: &str) -> Vec<&str> {
    line.trim_end_matches('\r').split(',').collect()
}
