//! Journal of on-call overwrites. Entries are only ever soft-deleted so
//! the history stays auditable; "active" queries filter on the deleted
//! flag and break ties by the newest `created_at`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::models::{InboundNumber, NewOverwrite, Overwrite};
use crate::schema::{inbound_numbers, overwrites};

fn scope_values(numbers: &[String]) -> Vec<Option<String>> {
    numbers.iter().cloned().map(Some).collect()
}

pub fn create(conn: &mut PgConnection, new: NewOverwrite) -> QueryResult<Overwrite> {
    diesel::insert_into(overwrites::table)
        .values(&new)
        .execute(conn)?;

    overwrites::table.find(new.id).first(conn)
}

/// Returns the overwrite with the given id, even when soft-deleted.
pub fn get(conn: &mut PgConnection, id: Uuid) -> QueryResult<Overwrite> {
    overwrites::table.find(id).first(conn)
}

/// Returns the overwrite active at `at`, scoped to the requested inbound
/// numbers. An overwrite without an inbound number applies to all of
/// them. Overlapping entries resolve to the most recently created one.
pub fn get_active_at(
    conn: &mut PgConnection,
    at: DateTime<Utc>,
    numbers: &[String],
) -> QueryResult<Option<Overwrite>> {
    overwrites::table
        .filter(overwrites::from_time.le(at))
        .filter(overwrites::to_time.gt(at))
        .filter(overwrites::deleted.eq(false))
        .filter(
            overwrites::inbound_number
                .is_null()
                .or(overwrites::inbound_number.eq_any(scope_values(numbers))),
        )
        .order(overwrites::created_at.desc())
        .first(conn)
        .optional()
}

/// Lists overwrites overlapping the given range. With both bounds set the
/// filter covers entries starting inside, ending inside, or straddling
/// the range; a single bound degenerates to "ends after" / "starts
/// before".
pub fn list_between(
    conn: &mut PgConnection,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    include_deleted: bool,
    numbers: &[String],
) -> QueryResult<Vec<Overwrite>> {
    let mut query = overwrites::table
        .order((
            overwrites::from_time.asc(),
            overwrites::to_time.asc(),
            overwrites::id.asc(),
        ))
        .into_boxed();

    match (from, to) {
        (Some(from), Some(to)) => {
            query = query.filter(
                overwrites::from_time
                    .ge(from)
                    .and(overwrites::from_time.lt(to))
                    .or(overwrites::to_time.gt(from).and(overwrites::to_time.lt(to)))
                    .or(overwrites::from_time
                        .le(from)
                        .and(overwrites::to_time.gt(to))),
            );
        }
        (Some(from), None) => {
            query = query.filter(overwrites::to_time.gt(from));
        }
        (None, Some(to)) => {
            query = query.filter(overwrites::from_time.lt(to));
        }
        (None, None) => {}
    }

    if !include_deleted {
        query = query.filter(overwrites::deleted.eq(false));
    }

    query
        .filter(
            overwrites::inbound_number
                .is_null()
                .or(overwrites::inbound_number.eq_any(scope_values(numbers))),
        )
        .load(conn)
}

/// Marks the overwrite as deleted. Already-deleted entries report
/// `NotFound` so the flag stays monotonic.
pub fn soft_delete(conn: &mut PgConnection, id: Uuid) -> QueryResult<Overwrite> {
    let updated = diesel::update(
        overwrites::table
            .find(id)
            .filter(overwrites::deleted.eq(false)),
    )
    .set(overwrites::deleted.eq(true))
    .execute(conn)?;

    if updated == 0 {
        return Err(diesel::result::Error::NotFound);
    }

    overwrites::table.find(id).first(conn)
}

/// Soft-deletes the overwrite that is active at `at` within the requested
/// inbound-number scope.
pub fn soft_delete_active_at(
    conn: &mut PgConnection,
    at: DateTime<Utc>,
    numbers: &[String],
) -> QueryResult<Overwrite> {
    conn.transaction(|conn| {
        let active = get_active_at(conn, at, numbers)?.ok_or(diesel::result::Error::NotFound)?;

        soft_delete(conn, active.id)
    })
}

pub fn create_inbound_number(conn: &mut PgConnection, model: &InboundNumber) -> QueryResult<()> {
    diesel::insert_into(inbound_numbers::table)
        .values(model)
        .execute(conn)?;
    Ok(())
}

pub fn get_inbound_number(conn: &mut PgConnection, number: &str) -> QueryResult<InboundNumber> {
    inbound_numbers::table.find(number).first(conn)
}

pub fn list_inbound_numbers(conn: &mut PgConnection) -> QueryResult<Vec<InboundNumber>> {
    inbound_numbers::table
        .order(inbound_numbers::number.asc())
        .load(conn)
}

/// Full-document replace of an inbound-number record.
pub fn update_inbound_number(conn: &mut PgConnection, model: &InboundNumber) -> QueryResult<()> {
    let updated = diesel::update(inbound_numbers::table.find(&model.number))
        .set(model)
        .execute(conn)?;

    if updated == 0 {
        return Err(diesel::result::Error::NotFound);
    }

    Ok(())
}

pub fn delete_inbound_number(conn: &mut PgConnection, number: &str) -> QueryResult<()> {
    let deleted = diesel::delete(inbound_numbers::table.find(number)).execute(conn)?;

    if deleted == 0 {
        return Err(diesel::result::Error::NotFound);
    }

    Ok(())
}
