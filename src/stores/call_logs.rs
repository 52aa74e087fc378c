//! Call-record store. Records are written twice per call: the transfer
//! event arrives first as an "unidentified" record (no duration), the
//! customer-tagged record follows and is merged onto the existing row
//! when both happened within two minutes of each other.

use chrono::{DateTime, Duration, Local, Utc};
use diesel::connection::DefaultLoadingMode;
use diesel::prelude::*;
use phonenumber::country;
use thiserror::Error;

use crate::error::AppError;
use crate::models::{CallLog, NewCallLog};
use crate::phone;
use crate::schema::call_logs;

/// Timestamp tolerance when stitching the customer-tagged record onto a
/// previously stored unidentified record.
const MERGE_TOLERANCE_MINUTES: i64 = 2;

#[derive(Debug, Error)]
pub enum CallLogError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("{0}")]
    InvalidNumber(#[from] anyhow::Error),
}

impl From<CallLogError> for AppError {
    fn from(value: CallLogError) -> Self {
        match value {
            CallLogError::Database(err) => err.into(),
            CallLogError::InvalidNumber(err) => AppError::invalid_argument(err.to_string()),
        }
    }
}

pub type CallLogResult<T> = Result<T, CallLogError>;

/// Normalizes the caller and derives the calendar-date string (local
/// zone) from the record timestamp.
fn prepare(record: &mut NewCallLog, region: country::Id) -> CallLogResult<()> {
    record.caller = phone::normalize_caller(&record.caller, region)?;
    record.datestr = local_date_string(record.date);
    Ok(())
}

pub fn local_date_string(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

pub fn create_unidentified(
    conn: &mut PgConnection,
    mut record: NewCallLog,
    region: country::Id,
) -> CallLogResult<CallLog> {
    prepare(&mut record, region)?;

    diesel::insert_into(call_logs::table)
        .values(&record)
        .execute(conn)?;

    Ok(call_logs::table.find(record.id).first(conn)?)
}

/// Records a customer-tagged call. Candidate unidentified records from
/// the same calendar day with the same normalized caller and no duration
/// are scanned newest-first; the first within the merge tolerance is
/// replaced in place, keeping its id and carrying over the fields only
/// the transfer event knew.
pub fn record_customer_call(
    conn: &mut PgConnection,
    mut record: NewCallLog,
    region: country::Id,
) -> CallLogResult<CallLog> {
    prepare(&mut record, region)?;

    let stored = conn.transaction::<CallLog, diesel::result::Error, _>(|conn| {
        let candidates: Vec<CallLog> = call_logs::table
            .filter(call_logs::datestr.eq(&record.datestr))
            .filter(call_logs::caller.eq(&record.caller))
            .filter(call_logs::duration_seconds.is_null())
            .order(call_logs::date.desc())
            .load(conn)?;

        let lower = record.date - Duration::minutes(MERGE_TOLERANCE_MINUTES);
        let upper = record.date + Duration::minutes(MERGE_TOLERANCE_MINUTES);

        if let Some(existing) = candidates
            .into_iter()
            .find(|candidate| candidate.date > lower && candidate.date < upper)
        {
            record.id = existing.id;
            record.transfer_target = existing.transfer_target.clone();
            record.error = existing.error;
            record.transfer_from = existing.transfer_from.clone();
            record.call_id = existing.call_id.clone();

            if record.inbound_number.is_none() {
                record.inbound_number = existing.inbound_number.clone();
            }
            if record.customer_id.is_none() {
                record.customer_id = existing.customer_id.clone();
            }
            if record.from_type.is_none() {
                record.from_type = existing.from_type.clone();
            }
            if record.to_type.is_none() {
                record.to_type = existing.to_type.clone();
            }

            diesel::update(call_logs::table.find(existing.id))
                .set(&record)
                .execute(conn)?;

            tracing::info!(
                caller = %record.caller,
                customer_id = record.customer_id.as_deref().unwrap_or_default(),
                "replaced unidentified call record with customer record"
            );
        } else {
            diesel::insert_into(call_logs::table)
                .values(&record)
                .execute(conn)?;

            tracing::info!(
                caller = %record.caller,
                customer_id = record.customer_id.as_deref().unwrap_or_default(),
                "created new customer call record"
            );
        }

        call_logs::table.find(record.id).first(conn)
    })?;

    Ok(stored)
}

#[derive(Debug, Default, Clone)]
pub struct SearchQuery {
    pub datestr: Option<String>,
    pub customer_id: Option<String>,
    pub customer_source: Option<String>,
    pub caller: Option<String>,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub direction: Option<String>,
    pub transfer_target: Option<String>,
}

impl SearchQuery {
    pub fn at_date(mut self, at: DateTime<Utc>) -> Self {
        self.datestr = Some(local_date_string(at));
        self
    }

    pub fn at_date_string(mut self, datestr: impl Into<String>) -> Self {
        self.datestr = Some(datestr.into());
        self
    }

    pub fn customer(mut self, id: impl Into<String>) -> Self {
        self.customer_id = Some(id.into());
        self
    }

    pub fn caller(mut self, number: impl Into<String>) -> Self {
        self.caller = Some(number.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.after = Some(start);
        self.before = Some(end);
        self
    }

    pub fn after(mut self, at: DateTime<Utc>) -> Self {
        self.after = Some(at);
        self
    }

    pub fn before(mut self, at: DateTime<Utc>) -> Self {
        self.before = Some(at);
        self
    }

    pub fn direction(mut self, direction: impl Into<String>) -> Self {
        self.direction = Some(direction.into());
        self
    }

    fn build(&self) -> call_logs::BoxedQuery<'_, diesel::pg::Pg> {
        let mut query = call_logs::table
            .order(call_logs::date.desc())
            .into_boxed();

        if let Some(ref datestr) = self.datestr {
            query = query.filter(call_logs::datestr.eq(datestr));
        }
        if let Some(ref id) = self.customer_id {
            query = query.filter(call_logs::customer_id.eq(id));
        }
        if let Some(ref source) = self.customer_source {
            query = query.filter(call_logs::customer_source.eq(source));
        }
        if let Some(ref caller) = self.caller {
            query = query.filter(call_logs::caller.eq(caller));
        }
        if let Some(after) = self.after {
            query = query.filter(call_logs::date.ge(after));
        }
        if let Some(before) = self.before {
            query = query.filter(call_logs::date.le(before));
        }
        if let Some(ref direction) = self.direction {
            query = query.filter(call_logs::direction.eq(direction));
        }
        if let Some(ref target) = self.transfer_target {
            query = query.filter(call_logs::transfer_target.eq(target));
        }

        query
    }
}

/// Streaming search; rows are produced as the cursor advances.
pub fn stream_search<'a>(
    conn: &'a mut PgConnection,
    query: &'a SearchQuery,
) -> QueryResult<impl Iterator<Item = QueryResult<CallLog>> + 'a> {
    query.build().load_iter::<CallLog, DefaultLoadingMode>(conn)
}

/// Materialized variant of [`stream_search`].
pub fn search(conn: &mut PgConnection, query: &SearchQuery) -> QueryResult<Vec<CallLog>> {
    stream_search(conn, query)?.collect()
}

/// All distinct callers that carry no customer linkage yet.
pub fn distinct_numbers_without_customer(conn: &mut PgConnection) -> QueryResult<Vec<String>> {
    call_logs::table
        .select(call_logs::caller)
        .distinct()
        .filter(call_logs::customer_id.is_null())
        .filter(call_logs::customer_source.is_null())
        .load(conn)
}

/// Back-fills the customer id onto every record of `number` that has no
/// customer linkage. Returns the number of updated rows.
pub fn update_unmatched_number(
    conn: &mut PgConnection,
    number: &str,
    customer_id: &str,
) -> QueryResult<usize> {
    diesel::update(
        call_logs::table
            .filter(call_logs::caller.eq(number))
            .filter(call_logs::customer_id.is_null())
            .filter(call_logs::customer_source.is_null()),
    )
    .set(call_logs::customer_id.eq(customer_id))
    .execute(conn)
}
