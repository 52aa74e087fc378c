mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::{Local, Utc};
use common::{acquire_db_lock, body_to_vec, TestApp};
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::json;

use pbxlink::api::CallEntry;
use pbxlink::cdr::CdrProcessor;
use pbxlink::models::CallLog;
use pbxlink::schema::call_logs as call_logs_table;
use pbxlink::stores::call_logs;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallLogList {
    results: Vec<CallEntry>,
}

async fn load_all_records(app: &TestApp) -> Result<Vec<CallLog>> {
    app.with_conn(|conn| {
        Ok(call_logs_table::table
            .order(call_logs_table::created_at.asc())
            .load::<CallLog>(conn)?)
    })
    .await
}

async fn wait_for_record_count(app: &TestApp, expected: usize) -> Result<Vec<CallLog>> {
    for _ in 0..50 {
        let records = load_all_records(app).await?;
        if records.len() >= expected {
            return Ok(records);
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    anyhow::bail!("timed out waiting for {expected} call records");
}

#[tokio::test]
async fn unidentified_ingest_merges_with_customer_record() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    // the PBX reports the transfer event first; the write happens in the
    // background after the request already returned
    let response = app
        .get("/api/external/v1/calllog?ani=%2B43%20664%201234567&did=%2B4322&transferTo=%2B43999&from=21&callID=call-77")
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let records = wait_for_record_count(&app, 1).await?;
    let unidentified = &records[0];
    assert_eq!(unidentified.caller, "+43 664 1234567");
    assert_eq!(unidentified.duration_seconds, None);
    assert_eq!(unidentified.transfer_target.as_deref(), Some("+43999"));

    // the customer-tagged record for the same call arrives via RPC with
    // a differently spelled number
    let now_local = Utc::now().with_timezone(&Local);
    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/RecordCall",
            &json!({
                "number": "0664 1234567",
                "agent": "Alice",
                "callType": "Inbound",
                "duration": "30",
                "dateTime": now_local.format("%d.%m.%Y %H:%M").to_string(),
                "customerId": "CX",
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let records = load_all_records(&app).await?;
    assert_eq!(records.len(), 1, "expected the records to merge");

    let merged = &records[0];
    assert_eq!(merged.id, unidentified.id);
    assert_eq!(merged.caller, "+43 664 1234567");
    assert_eq!(merged.customer_id.as_deref(), Some("CX"));
    assert_eq!(merged.duration_seconds, Some(30));
    assert_eq!(merged.transfer_target.as_deref(), Some("+43999"));
    assert_eq!(merged.transfer_from.as_deref(), Some("21"));
    assert_eq!(merged.call_id.as_deref(), Some("call-77"));
    assert_eq!(merged.inbound_number.as_deref(), Some("+4322"));

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/GetLogsForDate",
            &json!({ "date": Local::now().format("%Y-%m-%d").to_string() }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_vec(response.into_body()).await?;
    let list: CallLogList = serde_json::from_slice(&body)?;
    assert_eq!(list.results.len(), 1);
    assert_eq!(list.results[0].customer_id, "CX");
    assert_eq!(list.results[0].duration_seconds, Some(30));

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn customer_record_outside_tolerance_stays_separate() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let earlier = Utc::now() - chrono::Duration::minutes(10);

    app.with_conn(move |conn| {
        call_logs::create_unidentified(
            conn,
            pbxlink::models::NewCallLog {
                caller: "+43 664 1234567".into(),
                date: earlier,
                ..Default::default()
            },
            phonenumber::country::AT,
        )
        .map_err(anyhow::Error::from)?;
        Ok(())
    })
    .await?;

    let now_local = Utc::now().with_timezone(&Local);
    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/RecordCall",
            &json!({
                "number": "06641234567",
                "agent": "Alice",
                "callType": "Inbound",
                "duration": "12",
                "dateTime": now_local.format("%d.%m.%Y %H:%M").to_string(),
                "customerId": "CX",
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let records = load_all_records(&app).await?;
    assert_eq!(records.len(), 2, "no record within tolerance, expected an insert");

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn rejects_invalid_record_call_arguments() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/RecordCall",
            &json!({
                "number": "06641234567",
                "duration": "half an hour",
                "dateTime": "02.03.2026 12:00",
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/RecordCall",
            &json!({
                "number": "06641234567",
                "duration": "30",
                "dateTime": "2026-03-02T12:00:00Z",
            }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            "/tkd.pbx3cx.v1.CallService/GetLogsForDate",
            &json!({ "date": "yesterday" }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn cdr_line_synthesizes_a_missed_inbound_record() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    let processor = CdrProcessor::new(app.state.clone(), None);

    // historyId,callId,duration,time-start,time-answered,time-end,
    // reason-terminated,from-no,to-no,from-dn,to-dn,dial-no,
    // reason-changed,final-number,final-dn,bill-code,chain,final-type,
    // from-type,to-type,from-dispname,to-dispname,final-dispname
    let line = "h1,c1,00:00:00,2026.03.02 11:00:00,,2026.03.02 11:00:40,src_participant_terminated,+436641234567,+4312345,,,+4312345,,Ext.21,,,chain-1,queue,external_line,queue,,,";

    processor.process_line(line).await;

    let records = load_all_records(&app).await?;
    assert_eq!(records.len(), 1);

    let record = &records[0];
    assert_eq!(record.call_type.as_deref(), Some("Missed"));
    assert_eq!(record.direction.as_deref(), Some("Inbound"));
    assert_eq!(record.inbound_number.as_deref(), Some("+4312345"));
    assert_eq!(record.agent.as_deref(), Some("21"));
    assert_eq!(record.caller, "+43 664 1234567");
    assert_eq!(record.duration_seconds, None);
    assert_eq!(record.call_id.as_deref(), Some("c1"));
    assert_eq!(record.chain.as_deref(), Some("chain-1"));

    // a garbage line is logged and skipped
    processor.process_line("only,three,columns").await;
    let records = load_all_records(&app).await?;
    assert_eq!(records.len(), 1);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn unmatched_numbers_are_back_filled() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;

    app.with_conn(|conn| {
        for _ in 0..2 {
            call_logs::create_unidentified(
                conn,
                pbxlink::models::NewCallLog {
                    caller: "+43 664 1234567".into(),
                    date: Utc::now(),
                    ..Default::default()
                },
                phonenumber::country::AT,
            )
            .map_err(anyhow::Error::from)?;
        }
        Ok(())
    })
    .await?;

    let numbers = app
        .with_conn(|conn| Ok(call_logs::distinct_numbers_without_customer(conn)?))
        .await?;
    assert_eq!(numbers, vec!["+43 664 1234567".to_string()]);

    let updated = app
        .with_conn(|conn| {
            Ok(call_logs::update_unmatched_number(
                conn,
                "+43 664 1234567",
                "CUST-1",
            )?)
        })
        .await?;
    assert_eq!(updated, 2);

    let numbers = app
        .with_conn(|conn| Ok(call_logs::distinct_numbers_without_customer(conn)?))
        .await?;
    assert!(numbers.is_empty());

    // linked records are not touched again
    let updated = app
        .with_conn(|conn| {
            Ok(call_logs::update_unmatched_number(
                conn,
                "+43 664 1234567",
                "CUST-2",
            )?)
        })
        .await?;
    assert_eq!(updated, 0);

    app.cleanup().await?;
    Ok(())
}
